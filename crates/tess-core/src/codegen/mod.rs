//! Code generation backends.
//!
//! One backend today: the wasm-GC binary format.

pub mod wasm;

pub use wasm::generate;
