// Brio Expression AST Nodes

use crate::lexer::Op;
use std::sync::Arc;

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub fn from_op(op: Op) -> Option<Self> {
        match op {
            Op::Plus => Some(BinaryOp::Add),
            Op::Minus => Some(BinaryOp::Sub),
            Op::Star => Some(BinaryOp::Mul),
            Op::Slash => Some(BinaryOp::Div),
            Op::Percent => Some(BinaryOp::Mod),
            Op::EqualEqual => Some(BinaryOp::Equal),
            Op::BangEqual => Some(BinaryOp::NotEqual),
            Op::Less => Some(BinaryOp::Less),
            Op::LessEqual => Some(BinaryOp::LessEqual),
            Op::Greater => Some(BinaryOp::Greater),
            Op::GreaterEqual => Some(BinaryOp::GreaterEqual),
            Op::Amp => Some(BinaryOp::BitAnd),
            Op::Pipe => Some(BinaryOp::BitOr),
            Op::Caret => Some(BinaryOp::BitXor),
            Op::Shl => Some(BinaryOp::Shl),
            Op::Shr => Some(BinaryOp::Shr),
            _ => None,
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate, // -
    Not,    // !
    BitNot, // ~
}

/// Short-circuit connectives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortCircuitOp {
    And, // &&
    Or,  // ||
}

/// A resolved name reference. The resolve pass rewrites `Identifier`
/// nodes into one of these before any bytecode is emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum NameRef {
    /// Binding in the global table, addressed by name
    Global(Arc<str>),
    /// Frame slot of the method being compiled
    Local { slot: u8, module_level: bool },
    /// Local of a lexically enclosing, still-active method; resolved at
    /// runtime by walking the live capture-frame list
    Upvalue { capture: u32, slot: u8 },
    /// A fixed frame slot, bypassing name lookup (slot 0 is `self`)
    RawSlot(u8),
}

/// One segment of an interpolated string literal
#[derive(Debug, Clone)]
pub enum InterpPart {
    Text(Arc<str>),
    Expr(Expr),
}

/// Expression nodes
#[derive(Debug, Clone)]
pub enum Expr {
    Nil { line: usize },
    Bool { value: bool, line: usize },
    Int { value: i64, line: usize },
    Float { value: f64, line: usize },
    Str { value: Arc<str>, line: usize },

    /// Interpolated string: "a {x} b"
    Interp { parts: Vec<InterpPart>, line: usize },

    /// List literal: [1, 2, 3]
    List { elements: Vec<Expr>, line: usize },

    /// Map literal: {name: v, "key": w}
    MapLit {
        entries: Vec<(Arc<str>, Expr)>,
        line: usize,
    },

    /// Unresolved name; replaced by `Resolved` during the resolve pass
    Identifier { name: Arc<str>, line: usize },

    /// Resolved reference (global, local, upvalue, or raw slot)
    Resolved { target: NameRef, line: usize },

    /// The receiver of the current method
    SelfExpr { line: usize },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        line: usize,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        line: usize,
    },

    /// Short-circuit && / ||
    ShortCircuit {
        op: ShortCircuitOp,
        left: Box<Expr>,
        right: Box<Expr>,
        line: usize,
    },

    /// Assignment: target = value. The target must support emit_set.
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        line: usize,
    },

    /// Method call: recv.name(args). A dotted access without parens is a
    /// zero-argument call (with instance-variable fallback at runtime).
    Call {
        receiver: Box<Expr>,
        name: Arc<str>,
        args: Vec<Expr>,
        line: usize,
    },

    /// Super method call: super.name(args)
    SuperCall {
        name: Arc<str>,
        args: Vec<Expr>,
        line: usize,
    },

    /// Call of an arbitrary callee value: f(args)
    FunctionCall {
        callee: Box<Expr>,
        args: Vec<Expr>,
        line: usize,
    },

    /// Index access: obj[index]; dispatches get / set
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        line: usize,
    },
}

impl Expr {
    pub fn line(&self) -> usize {
        match self {
            Expr::Nil { line }
            | Expr::Bool { line, .. }
            | Expr::Int { line, .. }
            | Expr::Float { line, .. }
            | Expr::Str { line, .. }
            | Expr::Interp { line, .. }
            | Expr::List { line, .. }
            | Expr::MapLit { line, .. }
            | Expr::Identifier { line, .. }
            | Expr::Resolved { line, .. }
            | Expr::SelfExpr { line }
            | Expr::Binary { line, .. }
            | Expr::Unary { line, .. }
            | Expr::ShortCircuit { line, .. }
            | Expr::Assign { line, .. }
            | Expr::Call { line, .. }
            | Expr::SuperCall { line, .. }
            | Expr::FunctionCall { line, .. }
            | Expr::Index { line, .. } => *line,
        }
    }

    /// Whether this node supports emit_set, i.e. can be an assignment target.
    pub fn is_assignable(&self) -> bool {
        match self {
            Expr::Identifier { .. } | Expr::Resolved { .. } | Expr::Index { .. } => true,
            // Only the dotted zero-argument form is settable
            Expr::Call { args, .. } => args.is_empty(),
            _ => false,
        }
    }
}
