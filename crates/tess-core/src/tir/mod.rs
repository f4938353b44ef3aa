//! Flattened typed IR and the AST-to-TIR lowering pass.

pub mod func;
pub mod lower;
pub mod stack;

pub use func::{
    RuntimeOp, TirFunction, TirFunctionKind, TirGlobal, TirOp, TirOpKind, TirProgram,
};
pub use lower::lower;
pub use stack::OperandStack;
