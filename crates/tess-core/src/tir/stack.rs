//! Abstract operand stack tracked during lowering.
//!
//! Lowering flattens expression trees into postorder ops; the stack
//! mirrors what the emitted code will leave on the wasm value stack so
//! type mistakes surface here rather than in the validator.

use crate::error::{CompileError, CompileResult};
use crate::types::Ty;

#[derive(Debug, Default)]
pub struct OperandStack {
    items: Vec<Ty>,
    max: usize,
}

impl OperandStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ty: Ty) {
        self.items.push(ty);
        self.max = self.max.max(self.items.len());
    }

    pub fn pop(&mut self) -> CompileResult<Ty> {
        self.items
            .pop()
            .ok_or_else(|| CompileError::internal("operand stack underflow"))
    }

    /// Pop and check against the type the consumer expects.
    pub fn pop_expect(&mut self, expected: &Ty) -> CompileResult<Ty> {
        let got = self.pop()?;
        if &got != expected {
            return Err(CompileError::internal(format!(
                "operand stack type mismatch: expected {expected}, got {got}"
            )));
        }
        Ok(got)
    }

    pub fn peek(&self) -> Option<&Ty> {
        self.items.last()
    }

    pub fn depth(&self) -> usize {
        self.items.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max
    }

    /// Statement boundary: the stack must be balanced.
    pub fn assert_empty(&self) -> CompileResult<()> {
        if self.items.is_empty() {
            Ok(())
        } else {
            Err(CompileError::internal(format!(
                "operand stack not empty at statement boundary: {} values",
                self.items.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underflow_is_internal_error() {
        let mut s = OperandStack::new();
        assert!(matches!(s.pop(), Err(CompileError::Internal(_))));
    }

    #[test]
    fn test_max_depth_tracks_high_water_mark() {
        let mut s = OperandStack::new();
        s.push(Ty::Number);
        s.push(Ty::Number);
        s.pop().unwrap();
        s.push(Ty::Boolean);
        assert_eq!(s.max_depth(), 2);
        assert_eq!(s.depth(), 2);
    }

    #[test]
    fn test_pop_expect_mismatch() {
        let mut s = OperandStack::new();
        s.push(Ty::String);
        assert!(s.pop_expect(&Ty::Number).is_err());
    }
}
