//! Unique identifiers for compiler entities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a lexical scope in the module's scope arena.
///
/// ScopeId is the universal handle for:
/// - The global scope
/// - Function and method scopes
/// - Block scopes (loop bodies, switch clauses, plain blocks)
/// - Class and namespace scopes
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

impl ScopeId {
    pub const GLOBAL: ScopeId = ScopeId(0);

    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Identifier of a class or interface in the class registry.
///
/// Assigned monotonically per compilation unit; embedded in emitted
/// metadata, so it is stable within one compile but not across
/// re-ordered inputs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl ClassId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

/// Label generated for structured control flow in the typed IR.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct LabelId(pub u32);

impl LabelId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label#{}", self.0)
    }
}

/// Identifier of a module-level global in the typed IR.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

impl GlobalId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "global#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_id() {
        let id = ScopeId::new(42);
        assert_eq!(id.index(), 42);
        assert_eq!(ScopeId::GLOBAL.index(), 0);
    }

    #[test]
    fn test_class_id_display() {
        assert_eq!(ClassId::new(3).to_string(), "class#3");
    }

    #[test]
    fn test_label_id() {
        let id = LabelId::new(5);
        assert_eq!(id.index(), 5);
    }
}
