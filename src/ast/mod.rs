pub mod expr;
pub mod stmt;

pub use expr::{BinaryOp, Expr, InterpPart, NameRef, ShortCircuitOp, UnaryOp};
pub use stmt::{Block, ClassDef, Decl, FunctionDef, Program, Stmt};
