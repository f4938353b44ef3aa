//! Typed intermediate representation.
//!
//! A `TirFunction` is a flat postorder op sequence with structured
//! control markers. Every op carries the type of the value it leaves
//! on the stack (`Ty::Void` for pure-effect ops), which is what lets
//! the wasm backend pick instructions without re-walking the tree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::{ClassId, GlobalId, LabelId, ScopeId};
use crate::sema::ast::{BinOp, UnOp};
use crate::types::{FuncTy, Ty};

/// Calls routed to generated runtime helpers rather than user code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeOp {
    StringLen,
    StringConcat,
    StringEq,
    StringSlice,
    StringCharAt,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TirOpKind {
    // Constants.
    ConstNumber(f64),
    ConstBool(bool),
    /// Interned in the data segment by the backend.
    ConstString(String),
    ConstNull,
    ConstUndefined,

    // Variable access. Slots index the owning function's flattened
    // variable space; captured variables go through the context chain
    // instead.
    LocalGet(u32),
    LocalSet(u32),
    GlobalGet(GlobalId),
    GlobalSet(GlobalId),
    /// Read capture `slot` of the context owned by `func`, `depth`
    /// parent links up from the current function's own context.
    CtxGet {
        func: ScopeId,
        depth: u32,
        slot: u32,
    },
    CtxSet {
        func: ScopeId,
        depth: u32,
        slot: u32,
    },

    // Operators. `operand` is the type both inputs were checked to.
    Binary {
        op: BinOp,
        operand: Ty,
    },
    Unary(UnOp),
    /// Collapse the value on top of the stack to an i32 truth value
    /// under the source language's truthiness rules.
    TruthyTest {
        from: Ty,
    },
    /// Reinterpret an i32 truth value as a number.
    BoolToNumber,
    Drop,

    // Calls. Arguments sit on the stack in order; for `CallValue` the
    // closure value sits below them.
    CallDirect {
        func: ScopeId,
    },
    CallValue {
        sig: Box<FuncTy>,
    },
    CallRuntime(RuntimeOp),
    /// Imported host function, e.g. console output.
    CallHost {
        name: String,
        sig: Box<FuncTy>,
    },
    /// Virtual-free method call: receiver (below args) is a concrete
    /// class reference and `method` names the resolved target.
    CallMethod {
        class: ClassId,
        method: ScopeId,
    },
    /// Interface dispatch through the generated dispatcher for
    /// `(iface, method)`.
    CallInterface {
        iface: ClassId,
        method: String,
        sig: Box<FuncTy>,
    },

    // Object and array operations.
    /// Allocate with field defaults and invoke the (possibly
    /// inherited) constructor; args on stack.
    New {
        class: ClassId,
        argc: u32,
    },
    StructGet {
        class: ClassId,
        field: u32,
    },
    StructSet {
        class: ClassId,
        field: u32,
    },
    /// Wrap the concrete object on the stack into an interface value
    /// carrying the class's type id and shape-table offset.
    ToInterface {
        iface: ClassId,
        class: ClassId,
    },
    InterfaceGet {
        iface: ClassId,
        field: String,
    },
    InterfaceSet {
        iface: ClassId,
        field: String,
    },
    /// Build an array from `len` element values on the stack.
    ArrayLit {
        elem: Ty,
        len: u32,
    },
    ArrayGet {
        elem: Ty,
    },
    ArraySet {
        elem: Ty,
    },
    ArrayLen,

    // Dynamic values.
    BoxAny {
        from: Ty,
    },
    UnboxAny {
        to: Ty,
    },
    TypeOf,
    /// Capture the current context chain together with a function
    /// reference into a callable value.
    ClosureCreate {
        func: ScopeId,
    },
    RefCast {
        from: Ty,
        to: Ty,
    },

    // Structured control. Every Start has a matching End; Br/BrIf
    // target enclosing Block/Loop labels only.
    BlockStart(LabelId),
    BlockEnd,
    LoopStart(LabelId),
    LoopEnd,
    /// Consumes an i32 condition; `ty` of the op is the result type
    /// (`Void` for statement-position ifs).
    IfStart,
    Else,
    IfEnd,
    Br(LabelId),
    BrIf(LabelId),
    Unreachable,
}

/// One op plus the type it leaves behind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TirOp {
    pub kind: TirOpKind,
    pub ty: Ty,
}

impl TirOp {
    pub fn new(kind: TirOpKind, ty: Ty) -> Self {
        Self { kind, ty }
    }

    /// An op that leaves nothing on the stack.
    pub fn effect(kind: TirOpKind) -> Self {
        Self {
            kind,
            ty: Ty::Void,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TirFunctionKind {
    Normal,
    Method,
    Constructor,
    /// Module start routine running global initializers.
    Start,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TirFunction {
    pub kind: TirFunctionKind,
    /// Originating function scope; the start routine has no scope.
    pub scope: Option<ScopeId>,
    pub mangled_name: String,
    /// Declared parameter types (the backend prepends the context
    /// parameter itself).
    pub params: Vec<Ty>,
    pub ret: Ty,
    /// Types of locals beyond the parameters, indexed by
    /// `slot - params.len()`.
    pub var_types: Vec<Ty>,
    /// Slot holding the return value for the single-exit pattern;
    /// only set for non-void functions with early returns.
    pub ret_slot: Option<u32>,
    pub export_name: Option<String>,
    pub ops: Vec<TirOp>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TirGlobal {
    pub id: GlobalId,
    pub name: String,
    pub ty: Ty,
}

/// Lowered program, ready for the backend. Function order follows
/// declaration order and is the backend's index order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TirProgram {
    pub functions: Vec<TirFunction>,
    pub globals: Vec<TirGlobal>,
    /// Scope to position in `functions`.
    pub func_index: HashMap<ScopeId, u32>,
}

impl TirProgram {
    pub fn function_of(&self, scope: ScopeId) -> Option<&TirFunction> {
        self.func_index
            .get(&scope)
            .map(|&i| &self.functions[i as usize])
    }
}
