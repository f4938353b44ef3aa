//! Semantic program model: typed AST, scope tree, and pre-lowering
//! analyses. A `Module` is produced by a frontend (or deserialized
//! from JSON) and consumed by `tir::lower`.

pub mod ast;
pub mod capture;
pub mod scope;

pub use ast::{AssignTarget, BinOp, Binding, Expr, ExprKind, Stmt, SwitchCase, UnOp};
pub use capture::analyze;
pub use scope::{FunctionData, Module, Scope, ScopeKind, VarModifier, Variable};
