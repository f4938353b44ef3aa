//! Tess Compiler
//!
//! This crate compiles a statically typed, TypeScript-shaped program
//! model into a wasm-GC binary module:
//! - Arena-allocated scope tree with flattened variable slots
//! - Closure capture analysis and per-function context structs
//! - Flat typed IR with structured control markers
//! - Direct emission of GC struct and array types, no linear memory
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────┐    ┌───────────┐    ┌─────────┐    ┌───────────┐
//!    │  Module  │ →  │   sema    │ →  │   TIR   │ →  │  codegen  │ → .wasm
//!    │ (typed)  │    │ captures, │    │ lower   │    │  wasm-GC  │
//!    │          │    │ inference │    │         │    │           │
//!    └──────────┘    └───────────┘    └─────────┘    └───────────┘
//! ```

// Core modules
pub mod compiler;
pub mod error;
pub mod ids;
pub mod index_vec;
pub mod types;

// Program model and IR
pub mod sema;
pub mod tir;

// Codegen module
pub mod codegen;

// Re-exports
pub use compiler::{disassemble, validate, CompileOptions, CompileOutput, Compiler};
pub use error::{CompileError, CompileResult};
pub use ids::{ClassId, GlobalId, LabelId, ScopeId};
pub use index_vec::{Idx, IndexVec};
pub use sema::{Module, VarModifier};
pub use tir::{TirFunction, TirOp, TirOpKind, TirProgram};
pub use types::{ClassDef, ClassRegistry, FieldDef, FuncTy, MethodDef, MethodKind, Ty};
