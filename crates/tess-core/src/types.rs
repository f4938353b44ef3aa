//! Type model: the closed set of Tess types, structural comparison and
//! subtyping, and the class registry assigning stable numeric ids.
//!
//! Only object-shaped types (classes and interfaces) get registry ids.
//! Ids are monotonic for the lifetime of a compilation unit and are
//! embedded in emitted metadata; re-ordering class declarations across
//! compiles changes them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CompileError, CompileResult};
use crate::ids::{ClassId, ScopeId};
use crate::index_vec::IndexVec;
use crate::sema::Module;

/// A Tess type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ty {
    Void,
    Boolean,
    /// IEEE-754 double, the only numeric type.
    Number,
    String,
    /// The dynamic escape hatch; values are boxed with a runtime tag.
    Any,
    Null,
    Undefined,
    Array(Box<Ty>),
    Func(Box<FuncTy>),
    Class(ClassId),
    Interface(ClassId),
}

impl Ty {
    pub fn array(elem: Ty) -> Ty {
        Ty::Array(Box::new(elem))
    }

    pub fn func(params: Vec<Ty>, ret: Ty) -> Ty {
        Ty::Func(Box::new(FuncTy { params, ret }))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Ty::Void)
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Ty::Any)
    }

    /// Whether values of this type live on the GC heap.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Ty::String
                | Ty::Any
                | Ty::Array(_)
                | Ty::Func(_)
                | Ty::Class(_)
                | Ty::Interface(_)
                | Ty::Null
        )
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Boolean => write!(f, "boolean"),
            Ty::Number => write!(f, "number"),
            Ty::String => write!(f, "string"),
            Ty::Any => write!(f, "any"),
            Ty::Null => write!(f, "null"),
            Ty::Undefined => write!(f, "undefined"),
            Ty::Array(elem) => write!(f, "{}[]", elem),
            Ty::Func(func) => {
                write!(f, "(")?;
                for (i, p) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") => {}", func.ret)
            }
            Ty::Class(id) => write!(f, "{}", id),
            Ty::Interface(id) => write!(f, "interface {}", id),
        }
    }
}

/// Signature of a function-typed value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncTy {
    pub params: Vec<Ty>,
    pub ret: Ty,
}

/// One field of a class or interface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: Ty,
    pub readonly: bool,
}

/// Method kind within a class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodKind {
    Constructor,
    Method,
    Getter,
    Setter,
    Static,
}

/// One method of a class or interface.
///
/// Interface methods carry a signature but no body scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub kind: MethodKind,
    pub params: Vec<Ty>,
    pub ret: Ty,
    pub scope: Option<ScopeId>,
}

/// A class or interface definition.
///
/// `fields` holds OWN fields only; the emitted struct layout embeds the
/// supertype's fields as a prefix (see `ClassRegistry::flat_fields`),
/// which is what makes subtype checks structural walks rather than
/// name-based nominal checks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub super_id: Option<ClassId>,
    pub is_interface: bool,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
}

/// Registry of object-shaped types with monotonic id assignment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClassRegistry {
    classes: IndexVec<ClassId, ClassDef>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class or interface, assigning the next id.
    pub fn register(&mut self, def: ClassDef) -> ClassId {
        self.classes.push(def)
    }

    pub fn get(&self, id: ClassId) -> &ClassDef {
        &self.classes[id]
    }

    pub fn get_mut(&mut self, id: ClassId) -> &mut ClassDef {
        &mut self.classes[id]
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &ClassDef)> {
        self.classes.iter_enumerated()
    }

    /// The inheritance chain from the root ancestor down to `id`.
    pub fn chain(&self, id: ClassId) -> Vec<ClassId> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            chain.push(c);
            cur = self.classes[c].super_id;
        }
        chain.reverse();
        chain
    }

    /// Flattened field list: supertype fields first, own fields last.
    /// Field indices used by the code generator index into this list.
    pub fn flat_fields(&self, id: ClassId) -> Vec<&FieldDef> {
        let mut fields = Vec::new();
        for c in self.chain(id) {
            fields.extend(self.classes[c].fields.iter());
        }
        fields
    }

    /// Index of a named field in the flattened layout.
    pub fn field_index(&self, id: ClassId, name: &str) -> Option<usize> {
        self.flat_fields(id).iter().position(|f| f.name == name)
    }

    /// Resolve a method by name and arity, nearest override first.
    /// Returns the defining class and the method's index within it.
    pub fn find_method(
        &self,
        id: ClassId,
        name: &str,
        argc: usize,
    ) -> Option<(ClassId, usize, &MethodDef)> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let def = &self.classes[c];
            if let Some((idx, m)) = def
                .methods
                .iter()
                .enumerate()
                .find(|(_, m)| m.name == name && m.params.len() == argc)
            {
                return Some((c, idx, m));
            }
            cur = def.super_id;
        }
        None
    }

    /// Nearest constructor up the chain. A subclass with no explicit
    /// constructor inherits its parent's.
    pub fn find_constructor(&self, id: ClassId) -> Option<(ClassId, usize, &MethodDef)> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let def = &self.classes[c];
            if let Some((idx, m)) = def
                .methods
                .iter()
                .enumerate()
                .find(|(_, m)| m.kind == MethodKind::Constructor)
            {
                return Some((c, idx, m));
            }
            cur = def.super_id;
        }
        None
    }

    /// Structural conformance: does `class_id` provide every method the
    /// interface declares, with structurally equal signatures?
    pub fn implements(&self, class_id: ClassId, iface_id: ClassId) -> bool {
        let iface = &self.classes[iface_id];
        iface.methods.iter().all(|im| {
            self.find_method(class_id, &im.name, im.params.len())
                .map(|(_, _, m)| {
                    m.params
                        .iter()
                        .zip(im.params.iter())
                        .all(|(a, b)| structural_equal(a, b, self))
                        && structural_equal(&m.ret, &im.ret, self)
                })
                .unwrap_or(false)
        })
    }
}

/// Resolve a type name against a scope chain.
///
/// Nearest enclosing scope wins; falls back to the builtin names.
pub fn resolve(name: &str, scope: ScopeId, module: &Module) -> CompileResult<Ty> {
    let mut cur = Some(scope);
    while let Some(s) = cur {
        let scope = module.scope(s);
        if let Some(ty) = scope.named_types.get(name) {
            return Ok(ty.clone());
        }
        cur = scope.parent;
    }
    match name {
        "void" => Ok(Ty::Void),
        "boolean" => Ok(Ty::Boolean),
        "number" => Ok(Ty::Number),
        "string" => Ok(Ty::String),
        "any" => Ok(Ty::Any),
        "null" => Ok(Ty::Null),
        "undefined" => Ok(Ty::Undefined),
        _ => Err(CompileError::UnresolvedType(name.to_string())),
    }
}

/// Structural equality: shapes are compared field-by-field by type and
/// mutability, never by name.
pub fn structural_equal(a: &Ty, b: &Ty, reg: &ClassRegistry) -> bool {
    match (a, b) {
        (Ty::Array(ea), Ty::Array(eb)) => structural_equal(ea, eb, reg),
        (Ty::Func(fa), Ty::Func(fb)) => {
            fa.params.len() == fb.params.len()
                && fa
                    .params
                    .iter()
                    .zip(fb.params.iter())
                    .all(|(x, y)| structural_equal(x, y, reg))
                && structural_equal(&fa.ret, &fb.ret, reg)
        }
        (Ty::Class(ca), Ty::Class(cb)) | (Ty::Interface(ca), Ty::Interface(cb)) => {
            if ca == cb {
                return true;
            }
            let fa = reg.flat_fields(*ca);
            let fb = reg.flat_fields(*cb);
            fa.len() == fb.len()
                && fa
                    .iter()
                    .zip(fb.iter())
                    .all(|(x, y)| x.readonly == y.readonly && structural_equal(&x.ty, &y.ty, reg))
        }
        _ => a == b,
    }
}

/// Subtype check for class hierarchies: true iff `sub` is `sup` or a
/// structural descendant, by a bounded walk up the single-inheritance
/// chain.
pub fn is_subtype(sub: &Ty, sup: &Ty, reg: &ClassRegistry) -> bool {
    match (sub, sup) {
        (Ty::Class(s), Ty::Class(p)) => {
            let mut cur = Some(*s);
            while let Some(c) = cur {
                if c == *p {
                    return true;
                }
                cur = reg.get(c).super_id;
            }
            false
        }
        (Ty::Class(c), Ty::Interface(i)) => reg.implements(*c, *i),
        _ => structural_equal(sub, sup, reg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> (ClassRegistry, ClassId, ClassId) {
        let mut reg = ClassRegistry::new();
        let base = reg.register(ClassDef {
            name: "Base".to_string(),
            super_id: None,
            is_interface: false,
            fields: vec![FieldDef {
                name: "x".to_string(),
                ty: Ty::Number,
                readonly: false,
            }],
            methods: vec![],
        });
        let derived = reg.register(ClassDef {
            name: "Derived".to_string(),
            super_id: Some(base),
            is_interface: false,
            fields: vec![FieldDef {
                name: "y".to_string(),
                ty: Ty::String,
                readonly: true,
            }],
            methods: vec![],
        });
        (reg, base, derived)
    }

    #[test]
    fn test_monotonic_ids() {
        let (_, base, derived) = sample_registry();
        assert_eq!(base, ClassId::new(0));
        assert_eq!(derived, ClassId::new(1));
    }

    #[test]
    fn test_flat_fields_embed_supertype_prefix() {
        let (reg, _, derived) = sample_registry();
        let fields = reg.flat_fields(derived);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "x");
        assert_eq!(fields[1].name, "y");
        assert_eq!(reg.field_index(derived, "y"), Some(1));
    }

    #[test]
    fn test_is_subtype_walks_chain() {
        let (reg, base, derived) = sample_registry();
        assert!(is_subtype(&Ty::Class(derived), &Ty::Class(base), &reg));
        assert!(!is_subtype(&Ty::Class(base), &Ty::Class(derived), &reg));
        assert!(is_subtype(&Ty::Class(base), &Ty::Class(base), &reg));
    }

    #[test]
    fn test_structural_equality_ignores_names() {
        let mut reg = ClassRegistry::new();
        let a = reg.register(ClassDef {
            name: "A".to_string(),
            super_id: None,
            is_interface: false,
            fields: vec![FieldDef {
                name: "first".to_string(),
                ty: Ty::Number,
                readonly: false,
            }],
            methods: vec![],
        });
        let b = reg.register(ClassDef {
            name: "B".to_string(),
            super_id: None,
            is_interface: false,
            fields: vec![FieldDef {
                name: "second".to_string(),
                ty: Ty::Number,
                readonly: false,
            }],
            methods: vec![],
        });
        assert!(structural_equal(&Ty::Class(a), &Ty::Class(b), &reg));

        let arr_a = Ty::array(Ty::Number);
        let arr_b = Ty::array(Ty::Number);
        let arr_c = Ty::array(Ty::String);
        assert!(structural_equal(&arr_a, &arr_b, &reg));
        assert!(!structural_equal(&arr_a, &arr_c, &reg));
    }

    #[test]
    fn test_inherited_constructor_lookup() {
        let mut reg = ClassRegistry::new();
        let base = reg.register(ClassDef {
            name: "Base".to_string(),
            super_id: None,
            is_interface: false,
            fields: vec![],
            methods: vec![MethodDef {
                name: "constructor".to_string(),
                kind: MethodKind::Constructor,
                params: vec![Ty::Number],
                ret: Ty::Void,
                scope: None,
            }],
        });
        let derived = reg.register(ClassDef {
            name: "Derived".to_string(),
            super_id: Some(base),
            is_interface: false,
            fields: vec![],
            methods: vec![],
        });
        let (owner, _, ctor) = reg.find_constructor(derived).unwrap();
        assert_eq!(owner, base);
        assert_eq!(ctor.params.len(), 1);
    }
}
