//! Scope & symbol model.
//!
//! A `Module` owns an arena of scopes forming a tree: children are
//! owned by their parent's `children` list, back-references are plain
//! `ScopeId`s. Variable slot indices are assigned once at declaration,
//! are unique within their owning function's flattened variable space,
//! and are never reused.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::{ClassId, ScopeId};
use crate::index_vec::IndexVec;
use crate::sema::ast::{Binding, Stmt};
use crate::types::{ClassDef, ClassRegistry, MethodDef, MethodKind, Ty};

/// Declaration modifier of a variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarModifier {
    Const,
    Let,
    Var,
    Readonly,
}

/// A declared variable or parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// May be empty for compiler-synthesized slots.
    pub name: String,
    pub ty: Ty,
    pub modifier: VarModifier,
    /// Index in the owning function's flattened variable space;
    /// parameters occupy 0..param_count.
    pub slot: u32,
    /// Set lazily once the variable is seen referenced from a nested
    /// function.
    pub captured: bool,
    /// Capture ordinal within the owning function's closure context;
    /// assigned only if `captured`.
    pub closure_slot: Option<u32>,
}

/// Extra data carried by function scopes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionData {
    /// Surface name ("" for synthesized functions).
    pub name: String,
    /// Unique name disambiguated by nesting path, so sibling `inner`s
    /// in different functions never collide.
    pub mangled_name: String,
    /// Ordered parameter list, distinct from declared variables.
    pub params: Vec<Variable>,
    /// Return type. `Void` is a valid transient state for functions
    /// whose return type is inferred from their return statements.
    pub ret: Ty,
    /// Whether `ret` should be inferred from the first return.
    pub infer_ret: bool,
    pub is_export: bool,
    /// Owning class, if this is a member function.
    pub owner_class: Option<ClassId>,
    pub method_kind: Option<MethodKind>,
    /// Next flattened slot index (params + declared vars).
    pub next_slot: u32,
}

impl FunctionData {
    pub fn param_count(&self) -> u32 {
        self.params.len() as u32
    }

    /// Whether the function takes an implicit `this` (member functions
    /// other than statics).
    pub fn has_this(&self) -> bool {
        self.owner_class.is_some() && self.method_kind != Some(MethodKind::Static)
    }
}

/// Scope kind, with kind-specific payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScopeKind {
    Global,
    Function(FunctionData),
    Block,
    Class(ClassId),
    Namespace { name: String },
}

/// A lexical scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    /// Declaration order; must stay stable for slot indexing.
    pub variables: Vec<Variable>,
    /// Named types visible from this scope; nearest enclosing scope
    /// wins on lookup.
    pub named_types: HashMap<String, Ty>,
    pub stmts: Vec<Stmt>,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            variables: Vec::new(),
            named_types: HashMap::new(),
            stmts: Vec::new(),
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, ScopeKind::Function(_))
    }

    pub fn func(&self) -> Option<&FunctionData> {
        match &self.kind {
            ScopeKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn func_mut(&mut self) -> Option<&mut FunctionData> {
        match &mut self.kind {
            ScopeKind::Function(f) => Some(f),
            _ => None,
        }
    }
}

/// A fully typed, scope-annotated program: the input boundary of the
/// code generator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Module {
    pub scopes: IndexVec<ScopeId, Scope>,
    pub classes: ClassRegistry,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    /// Create a module with an empty global scope.
    pub fn new() -> Self {
        let mut scopes = IndexVec::new();
        scopes.push(Scope::new(ScopeKind::Global, None));
        Self {
            scopes,
            classes: ClassRegistry::new(),
        }
    }

    pub fn global_scope(&self) -> ScopeId {
        ScopeId::GLOBAL
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id]
    }

    fn add_scope(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        let id = self.scopes.push(Scope::new(kind, Some(parent)));
        self.scopes[parent].children.push(id);
        id
    }

    /// Add a block scope under `parent`.
    pub fn add_block(&mut self, parent: ScopeId) -> ScopeId {
        self.add_scope(parent, ScopeKind::Block)
    }

    /// Add a namespace scope under `parent`.
    pub fn add_namespace(&mut self, parent: ScopeId, name: impl Into<String>) -> ScopeId {
        self.add_scope(parent, ScopeKind::Namespace { name: name.into() })
    }

    /// Add a free (or nested) function scope. The mangled name is the
    /// enclosing function's mangled name joined with `|`, which keeps
    /// nested declarations collision-free.
    pub fn add_function(
        &mut self,
        parent: ScopeId,
        name: impl Into<String>,
        params: &[(&str, Ty)],
        ret: Ty,
        is_export: bool,
    ) -> ScopeId {
        let name = name.into();
        let mangled_name = match self.owning_function(parent) {
            Some(outer) => {
                let outer_mangled = &self.scopes[outer]
                    .func()
                    .map(|f| f.mangled_name.clone())
                    .unwrap_or_default();
                format!("{}|{}", outer_mangled, name)
            }
            None => name.clone(),
        };
        self.add_function_inner(parent, name, mangled_name, params, ret, is_export, None, None)
    }

    /// Register a class (or interface) scope plus its registry entry,
    /// and bind its name in the parent scope's named-type table.
    pub fn add_class(
        &mut self,
        parent: ScopeId,
        name: impl Into<String>,
        super_id: Option<ClassId>,
        is_interface: bool,
    ) -> (ScopeId, ClassId) {
        let name = name.into();
        let class_id = self.classes.register(ClassDef {
            name: name.clone(),
            super_id,
            is_interface,
            fields: Vec::new(),
            methods: Vec::new(),
        });
        let scope = self.add_scope(parent, ScopeKind::Class(class_id));
        let ty = if is_interface {
            Ty::Interface(class_id)
        } else {
            Ty::Class(class_id)
        };
        self.scopes[parent].named_types.insert(name, ty);
        (scope, class_id)
    }

    /// Add a member function to a class. Non-static members get an
    /// implicit leading `this` parameter.
    pub fn add_method(
        &mut self,
        class_scope: ScopeId,
        name: impl Into<String>,
        kind: MethodKind,
        params: &[(&str, Ty)],
        ret: Ty,
    ) -> ScopeId {
        let name = name.into();
        let class_id = match self.scopes[class_scope].kind {
            ScopeKind::Class(id) => id,
            _ => panic!("add_method on non-class scope {}", class_scope),
        };
        let class_name = self.classes.get(class_id).name.clone();
        let mangled_name = format!("{}.{}", class_name, name);

        let mut full_params: Vec<(&str, Ty)> = Vec::new();
        if kind != MethodKind::Static {
            full_params.push(("this", Ty::Class(class_id)));
        }
        full_params.extend(params.iter().cloned());

        let scope = self.add_function_inner(
            class_scope,
            name.clone(),
            mangled_name,
            &full_params,
            ret.clone(),
            false,
            Some(class_id),
            Some(kind),
        );

        self.classes.get_mut(class_id).methods.push(MethodDef {
            name,
            kind,
            params: params.iter().map(|(_, t)| t.clone()).collect(),
            ret,
            scope: Some(scope),
        });
        scope
    }

    #[allow(clippy::too_many_arguments)]
    fn add_function_inner(
        &mut self,
        parent: ScopeId,
        name: String,
        mangled_name: String,
        params: &[(&str, Ty)],
        ret: Ty,
        is_export: bool,
        owner_class: Option<ClassId>,
        method_kind: Option<MethodKind>,
    ) -> ScopeId {
        let param_vars: Vec<Variable> = params
            .iter()
            .enumerate()
            .map(|(i, (n, t))| Variable {
                name: (*n).to_string(),
                ty: t.clone(),
                modifier: VarModifier::Let,
                slot: i as u32,
                captured: false,
                closure_slot: None,
            })
            .collect();
        let next_slot = param_vars.len() as u32;
        let infer_ret = ret == Ty::Void && method_kind.is_none();
        self.add_scope(
            parent,
            ScopeKind::Function(FunctionData {
                name,
                mangled_name,
                params: param_vars,
                ret,
                infer_ret,
                is_export,
                owner_class,
                method_kind,
                next_slot,
            }),
        )
    }

    /// Declare a variable in `scope`, assigning its slot from the
    /// owning function's flattened counter. Returns the variable's
    /// index within the scope plus its binding.
    pub fn declare_var(
        &mut self,
        scope: ScopeId,
        name: impl Into<String>,
        ty: Ty,
        modifier: VarModifier,
    ) -> Binding {
        let slot = match self.owning_function(scope) {
            Some(func) => {
                let data = self.scopes[func]
                    .func_mut()
                    .expect("owning_function returned non-function");
                let s = data.next_slot;
                data.next_slot += 1;
                s
            }
            // Global/namespace variables become module globals; the
            // slot only records declaration order.
            None => self.scopes[scope].variables.len() as u32,
        };
        let index = self.scopes[scope].variables.len() as u32;
        self.scopes[scope].variables.push(Variable {
            name: name.into(),
            ty,
            modifier,
            slot,
            captured: false,
            closure_slot: None,
        });
        Binding::Var { scope, index }
    }

    /// Declare a compiler-synthesized slot (empty name).
    pub fn declare_temp(&mut self, scope: ScopeId, ty: Ty) -> Binding {
        self.declare_var(scope, "", ty, VarModifier::Let)
    }

    /// Nearest enclosing function scope, including `scope` itself.
    /// Stops at class/global/namespace boundaries.
    pub fn owning_function(&self, scope: ScopeId) -> Option<ScopeId> {
        let mut cur = Some(scope);
        while let Some(s) = cur {
            match self.scopes[s].kind {
                ScopeKind::Function(_) => return Some(s),
                ScopeKind::Global | ScopeKind::Namespace { .. } | ScopeKind::Class(_) => {
                    return None
                }
                ScopeKind::Block => cur = self.scopes[s].parent,
            }
        }
        None
    }

    /// Look up a variable by name from `scope` outward. Checks block
    /// variables (latest declaration wins) and function parameters.
    pub fn find_var(&self, scope: ScopeId, name: &str) -> Option<(Binding, Ty)> {
        let mut cur = Some(scope);
        while let Some(s) = cur {
            let sc = &self.scopes[s];
            if let Some((i, v)) = sc
                .variables
                .iter()
                .enumerate()
                .rev()
                .find(|(_, v)| v.name == name)
            {
                return Some((
                    Binding::Var {
                        scope: s,
                        index: i as u32,
                    },
                    v.ty.clone(),
                ));
            }
            if let ScopeKind::Function(f) = &sc.kind {
                if let Some((i, p)) = f.params.iter().enumerate().find(|(_, p)| p.name == name) {
                    return Some((
                        Binding::Param {
                            func: s,
                            index: i as u32,
                        },
                        p.ty.clone(),
                    ));
                }
            }
            cur = sc.parent;
        }
        None
    }

    /// Resolve a binding to its variable record.
    pub fn binding_var(&self, binding: Binding) -> &Variable {
        match binding {
            Binding::Param { func, index } => {
                &self.scopes[func]
                    .func()
                    .expect("param binding into non-function scope")
                    .params[index as usize]
            }
            Binding::Var { scope, index } => &self.scopes[scope].variables[index as usize],
        }
    }

    pub fn binding_var_mut(&mut self, binding: Binding) -> &mut Variable {
        match binding {
            Binding::Param { func, index } => {
                &mut self.scopes[func]
                    .func_mut()
                    .expect("param binding into non-function scope")
                    .params[index as usize]
            }
            Binding::Var { scope, index } => &mut self.scopes[scope].variables[index as usize],
        }
    }

    /// The function scope a binding belongs to, `None` for bindings in
    /// global/namespace scopes (those become module globals).
    pub fn binding_function(&self, binding: Binding) -> Option<ScopeId> {
        match binding {
            Binding::Param { func, .. } => Some(func),
            Binding::Var { scope, .. } => self.owning_function(scope),
        }
    }

    /// All function scopes in declaration order: functions declared
    /// earlier always precede their own nested functions.
    pub fn function_scopes(&self) -> Vec<ScopeId> {
        let mut out = Vec::new();
        let mut stack = vec![ScopeId::GLOBAL];
        while let Some(s) = stack.pop() {
            if self.scopes[s].is_function() {
                out.push(s);
            }
            // Reverse to visit children in declaration order.
            for &c in self.scopes[s].children.iter().rev() {
                stack.push(c);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_indices_contiguous_from_param_count() {
        let mut m = Module::new();
        let f = m.add_function(
            m.global_scope(),
            "f",
            &[("a", Ty::Number), ("b", Ty::Number)],
            Ty::Number,
            false,
        );
        let v0 = m.declare_var(f, "x", Ty::Number, VarModifier::Let);
        let block = m.add_block(f);
        let v1 = m.declare_var(block, "y", Ty::String, VarModifier::Const);
        let v2 = m.declare_var(f, "z", Ty::Boolean, VarModifier::Let);

        assert_eq!(m.binding_var(v0).slot, 2);
        assert_eq!(m.binding_var(v1).slot, 3);
        assert_eq!(m.binding_var(v2).slot, 4);
    }

    #[test]
    fn test_mangled_names_disambiguate_nesting() {
        let mut m = Module::new();
        let outer = m.add_function(m.global_scope(), "outer", &[], Ty::Void, false);
        let inner = m.add_function(outer, "inner", &[], Ty::Void, false);
        let other = m.add_function(m.global_scope(), "other", &[], Ty::Void, false);
        let inner2 = m.add_function(other, "inner", &[], Ty::Void, false);

        assert_eq!(m.scope(inner).func().unwrap().mangled_name, "outer|inner");
        assert_eq!(m.scope(inner2).func().unwrap().mangled_name, "other|inner");
    }

    #[test]
    fn test_find_var_shadowing_nearest_wins() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[("x", Ty::Number)], Ty::Void, false);
        let block = m.add_block(f);
        m.declare_var(block, "x", Ty::String, VarModifier::Let);

        let (binding, ty) = m.find_var(block, "x").unwrap();
        assert_eq!(ty, Ty::String);
        assert!(matches!(binding, Binding::Var { .. }));

        let (binding, ty) = m.find_var(f, "x").unwrap();
        assert_eq!(ty, Ty::Number);
        assert!(matches!(binding, Binding::Param { .. }));
    }

    #[test]
    fn test_method_gets_implicit_this() {
        let mut m = Module::new();
        let (cs, cid) = m.add_class(m.global_scope(), "Point", None, false);
        let ms = m.add_method(cs, "getX", MethodKind::Method, &[], Ty::Number);

        let f = m.scope(ms).func().unwrap();
        assert_eq!(f.params.len(), 1);
        assert_eq!(f.params[0].name, "this");
        assert_eq!(f.params[0].ty, Ty::Class(cid));
        assert_eq!(f.mangled_name, "Point.getX");
    }

    #[test]
    fn test_class_name_resolves_in_parent_scope() {
        let mut m = Module::new();
        let (_, cid) = m.add_class(m.global_scope(), "Point", None, false);
        let ty = crate::types::resolve("Point", m.global_scope(), &m).unwrap();
        assert_eq!(ty, Ty::Class(cid));
        assert!(crate::types::resolve("Missing", m.global_scope(), &m).is_err());
    }
}
