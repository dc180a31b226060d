// Brio Statement AST Nodes

use super::expr::Expr;
use crate::ordmap::OrderedMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// An ordered statement sequence at one indentation level.
///
/// A block owns its statements and two symbol tables: a lazily created
/// local-name table (shared with the environment chain during compilation)
/// and the table of function/class declarations registered by the parser,
/// which makes them forward-referenceable within the block.
#[derive(Debug, Clone)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub locals: Rc<RefCell<Option<OrderedMap<u8>>>>,
    pub decls: Vec<Decl>,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>, decls: Vec<Decl>) -> Self {
        Self {
            stmts,
            locals: Rc::new(RefCell::new(None)),
            decls,
        }
    }
}

/// Function and class declarations registered on their enclosing block
#[derive(Debug, Clone)]
pub enum Decl {
    Function(FunctionDef),
    Class(ClassDef),
}

impl Decl {
    pub fn name(&self) -> &Arc<str> {
        match self {
            Decl::Function(def) => &def.name,
            Decl::Class(def) => &def.name,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Decl::Function(def) => def.line,
            Decl::Class(def) => def.line,
        }
    }
}

/// Function definition (standalone functions and class methods)
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Arc<str>,
    pub params: Vec<Arc<str>>,
    pub body: Option<Block>,
    pub line: usize,
}

/// Class definition
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: Arc<str>,
    pub superclass: Option<Arc<str>>,
    pub ivars: Vec<Arc<str>>,
    pub methods: Vec<FunctionDef>,
    pub line: usize,
}

/// Statement nodes
#[derive(Debug, Clone)]
pub enum Stmt {
    /// Expression statement (includes assignments)
    Expr { expr: Expr, line: usize },

    /// if cond / indented block / optional else
    If {
        cond: Expr,
        then_block: Option<Block>,
        else_block: Option<Block>,
        line: usize,
    },

    /// while cond / indented block
    While {
        cond: Expr,
        body: Option<Block>,
        line: usize,
    },

    /// for var in iterable / indented block
    For {
        var: Arc<str>,
        /// Frame slot of the loop variable, assigned by the resolve pass
        var_slot: std::cell::Cell<u8>,
        iterable: Expr,
        body: Option<Block>,
        line: usize,
    },

    Return { value: Option<Expr>, line: usize },

    Break { line: usize },

    Continue { line: usize },

    /// import name — binds the named module's export map
    Import { name: Arc<str>, line: usize },

    /// export name — records a module-level binding in the export table
    Export { name: Arc<str>, line: usize },
}

impl Stmt {
    pub fn line(&self) -> usize {
        match self {
            Stmt::Expr { line, .. }
            | Stmt::If { line, .. }
            | Stmt::While { line, .. }
            | Stmt::For { line, .. }
            | Stmt::Return { line, .. }
            | Stmt::Break { line }
            | Stmt::Continue { line }
            | Stmt::Import { line, .. }
            | Stmt::Export { line, .. } => *line,
        }
    }
}

/// A parsed source file: one top-level block
#[derive(Debug, Clone)]
pub struct Program {
    pub body: Block,
}

impl Program {
    pub fn new(body: Block) -> Self {
        Self { body }
    }
}
