//! Typed statement and expression nodes.
//!
//! These arrive fully resolved from the external frontend: every
//! identifier is already a `Binding`, every expression carries its
//! checked type, and every nested block references its scope in the
//! module arena.

use serde::{Deserialize, Serialize};

use crate::ids::{ClassId, ScopeId};
use crate::types::Ty;

/// A resolved reference to a parameter or declared variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    /// Parameter `index` of the function scope.
    Param { func: ScopeId, index: u32 },
    /// Variable `index` declared in `scope` (which may be a block,
    /// function, global or namespace scope).
    Var { scope: ScopeId, index: u32 },
}

/// Binary operators. `And`/`Or` short-circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

/// A typed expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Ty,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    NumberLit(f64),
    StringLit(String),
    BoolLit(bool),
    NullLit,
    UndefinedLit,
    Var(Binding),
    This,
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// Direct call of a statically known function.
    CallDirect {
        func: ScopeId,
        args: Vec<Expr>,
    },
    /// Call of a function-typed value (closure).
    CallValue {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Call into the host's runtime import surface (e.g. `log`).
    HostCall {
        name: String,
        args: Vec<Expr>,
    },
    /// Method call; dispatch strategy depends on the base's static
    /// type (class: direct, interface: runtime-checked, string/array:
    /// builtin library).
    MethodCall {
        base: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Field {
        base: Box<Expr>,
        field: String,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    ArrayLit {
        elems: Vec<Expr>,
    },
    New {
        class: ClassId,
        args: Vec<Expr>,
    },
    /// Reference to a nested function as a value (closure creation).
    FuncRef(ScopeId),
    /// Checked conversion: static<->any boxing, class-to-interface
    /// upcast, numeric/boolean coercions.
    Cast {
        expr: Box<Expr>,
        to: Ty,
    },
    /// Runtime type query on an `any` value; yields the tag name.
    TypeOf(Box<Expr>),
}

impl Expr {
    pub fn number(v: f64) -> Expr {
        Expr {
            kind: ExprKind::NumberLit(v),
            ty: Ty::Number,
        }
    }

    pub fn string(s: impl Into<String>) -> Expr {
        Expr {
            kind: ExprKind::StringLit(s.into()),
            ty: Ty::String,
        }
    }

    pub fn boolean(v: bool) -> Expr {
        Expr {
            kind: ExprKind::BoolLit(v),
            ty: Ty::Boolean,
        }
    }

    pub fn var(binding: Binding, ty: Ty) -> Expr {
        Expr {
            kind: ExprKind::Var(binding),
            ty,
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        let ty = match op {
            BinOp::Add => lhs.ty.clone(),
            BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => Ty::Number,
            _ => Ty::Boolean,
        };
        Expr {
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        }
    }

    pub fn unary(op: UnOp, operand: Expr) -> Expr {
        let ty = match op {
            UnOp::Neg => Ty::Number,
            UnOp::Not => Ty::Boolean,
        };
        Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
        }
    }

    pub fn cast(expr: Expr, to: Ty) -> Expr {
        Expr {
            kind: ExprKind::Cast {
                expr: Box::new(expr),
                to: to.clone(),
            },
            ty: to,
        }
    }
}

/// Assignment target (places).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AssignTarget {
    Var(Binding),
    Field { base: Expr, field: String },
    Index { base: Expr, index: Expr },
}

/// One clause of a switch statement. `value: None` is the default
/// clause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: Option<Expr>,
    pub body: ScopeId,
}

/// A typed statement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Expr(Expr),
    /// Declares-and-initializes variable `index` of `scope`. The
    /// variable itself (type, slot) was registered at declaration.
    VarDecl {
        scope: ScopeId,
        index: u32,
        init: Option<Expr>,
    },
    Assign {
        target: AssignTarget,
        value: Expr,
    },
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_block: ScopeId,
        else_block: Option<ScopeId>,
    },
    While {
        label: Option<String>,
        cond: Expr,
        body: ScopeId,
    },
    DoWhile {
        label: Option<String>,
        body: ScopeId,
        cond: Expr,
    },
    For {
        label: Option<String>,
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        incr: Option<Box<Stmt>>,
        body: ScopeId,
    },
    Switch {
        scrutinee: Expr,
        cases: Vec<SwitchCase>,
    },
    Break {
        label: Option<String>,
    },
    Continue {
        label: Option<String>,
    },
    Block(ScopeId),
    /// A nested function declaration; the body lives in its scope.
    FuncDecl(ScopeId),
    Empty,
}
