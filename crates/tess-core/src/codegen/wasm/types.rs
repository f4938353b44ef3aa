//! Wasm-GC heap type table.
//!
//! Every composite type in the output module lives in a single
//! recursion group so classes, contexts, closures and signatures can
//! reference each other freely. Indices are handed out monotonically
//! as types are registered; the section itself is serialized last,
//! once all of codegen has run, so registration order is the only
//! thing that matters for determinism.

use std::collections::HashMap;

use wasm_encoder::{
    AbstractHeapType, ArrayType, CompositeInnerType, CompositeType, FieldType, FuncType, HeapType,
    RefType, StorageType, StructType, SubType, TypeSection, ValType,
};

use crate::error::{CompileError, CompileResult};
use crate::ids::{ClassId, ScopeId};
use crate::sema::capture::{capture_count, has_captures};
use crate::sema::scope::Module;
use crate::types::{FuncTy, Ty};

/// Nullable reference to an opaque struct; the type every incoming
/// closure-context parameter carries before the callee casts it.
pub const STRUCTREF: RefType = RefType {
    nullable: true,
    heap_type: HeapType::Abstract {
        shared: false,
        ty: AbstractHeapType::Struct,
    },
};

/// Bottom-typed null, pushed where a context is absent.
pub const NULLREF: HeapType = HeapType::Abstract {
    shared: false,
    ty: AbstractHeapType::None,
};

pub struct WasmTypeTable {
    entries: Vec<SubType>,
    /// Heap type index of the string byte array.
    pub string_idx: u32,
    /// Heap type index of the boxed any struct.
    pub any_idx: u32,
    /// Heap type index of the shared interface fat-value struct.
    pub iface_idx: u32,
    class_indices: HashMap<ClassId, u32>,
    ctx_indices: HashMap<ScopeId, u32>,
    array_indices: HashMap<Ty, u32>,
    sig_indices: HashMap<(Vec<ValType>, Vec<ValType>), u32>,
    closure_indices: HashMap<FuncTy, u32>,
}

impl WasmTypeTable {
    /// Register the fixed shapes plus one struct per class; classes
    /// must all be present before any field type referencing them is
    /// computed.
    pub fn new(module: &Module) -> CompileResult<Self> {
        let mut table = Self {
            entries: Vec::new(),
            string_idx: 0,
            any_idx: 0,
            iface_idx: 0,
            class_indices: HashMap::new(),
            ctx_indices: HashMap::new(),
            array_indices: HashMap::new(),
            sig_indices: HashMap::new(),
            closure_indices: HashMap::new(),
        };

        // string: array (mut i8)
        table.string_idx = table.push(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Array(ArrayType(FieldType {
                    element_type: StorageType::I8,
                    mutable: true,
                })),
                shared: false,
            },
        });

        // any: struct { tag: i32, num: f64, ref: anyref }
        table.any_idx = table.push(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Struct(StructType {
                    fields: Box::new([
                        immutable(StorageType::Val(ValType::I32)),
                        immutable(StorageType::Val(ValType::F64)),
                        immutable(StorageType::Val(ValType::Ref(RefType::ANYREF))),
                    ]),
                }),
                shared: false,
            },
        });

        // interface fat value: { class_id: i32, shape_off: i32,
        // obj: structref }. One shape shared by every interface; the
        // ids inside distinguish them at runtime.
        table.iface_idx = table.push(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Struct(StructType {
                    fields: Box::new([
                        immutable(StorageType::Val(ValType::I32)),
                        immutable(StorageType::Val(ValType::I32)),
                        immutable(StorageType::Val(ValType::Ref(STRUCTREF))),
                    ]),
                }),
                shared: false,
            },
        });

        // Reserve class indices first so field types can refer to any
        // class, then fill the entries in a second pass.
        let class_base = table.entries.len() as u32;
        let mut concrete = Vec::new();
        for (id, def) in module.classes.iter() {
            if def.is_interface {
                continue;
            }
            table.class_indices.insert(id, class_base + concrete.len() as u32);
            concrete.push(id);
        }
        for _ in &concrete {
            table.entries.push(placeholder());
        }
        for &id in &concrete {
            let def = module.classes.get(id);
            let fields: CompileResult<Vec<FieldType>> = module
                .classes
                .flat_fields(id)
                .iter()
                .map(|f| {
                    Ok(FieldType {
                        element_type: StorageType::Val(table.valtype(&f.ty, module)?),
                        mutable: true,
                    })
                })
                .collect();
            let idx = table.class_indices[&id];
            table.entries[idx as usize] = SubType {
                is_final: false,
                supertype_idx: def.super_id.map(|s| table.class_indices[&s]),
                composite_type: CompositeType {
                    inner: CompositeInnerType::Struct(StructType {
                        fields: fields?.into_boxed_slice(),
                    }),
                    shared: false,
                },
            };
        }

        // Context structs, in function declaration order:
        // [parent, captured-0, captured-1, ...]. Functions with no
        // captures get no entry; they forward the parent context.
        for func in module.function_scopes() {
            if !has_captures(module, func) {
                continue;
            }
            let mut fields = vec![immutable(StorageType::Val(ValType::Ref(STRUCTREF)))];
            fields.extend(table.ctx_capture_fields(module, func)?);
            let idx = table.push(SubType {
                is_final: true,
                supertype_idx: None,
                composite_type: CompositeType {
                    inner: CompositeInnerType::Struct(StructType {
                        fields: fields.into_boxed_slice(),
                    }),
                    shared: false,
                },
            });
            table.ctx_indices.insert(func, idx);
        }

        Ok(table)
    }

    fn push(&mut self, sub: SubType) -> u32 {
        let idx = self.entries.len() as u32;
        self.entries.push(sub);
        idx
    }

    /// Captured variable types of `func` in closure-slot order.
    fn ctx_capture_fields(&mut self, module: &Module, func: ScopeId) -> CompileResult<Vec<FieldType>> {
        let n = capture_count(module, func);
        let mut slots: Vec<Option<Ty>> = vec![None; n as usize];
        let data = module
            .scope(func)
            .func()
            .ok_or_else(|| CompileError::internal("context for non-function scope"))?;
        for p in &data.params {
            if let Some(s) = p.closure_slot {
                slots[s as usize] = Some(p.ty.clone());
            }
        }
        let mut stack = vec![func];
        while let Some(s) = stack.pop() {
            if s != func && module.scope(s).is_function() {
                continue;
            }
            for v in &module.scope(s).variables {
                if let Some(cs) = v.closure_slot {
                    slots[cs as usize] = Some(v.ty.clone());
                }
            }
            stack.extend(module.scope(s).children.iter().copied());
        }
        slots
            .into_iter()
            .map(|ty| {
                let ty = ty.ok_or_else(|| CompileError::internal("unassigned closure slot"))?;
                Ok(FieldType {
                    element_type: StorageType::Val(self.valtype(&ty, module)?),
                    mutable: true,
                })
            })
            .collect()
    }

    pub fn class(&self, id: ClassId) -> CompileResult<u32> {
        self.class_indices
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::internal(format!("no heap type for {}", id)))
    }

    pub fn ctx(&self, func: ScopeId) -> Option<u32> {
        self.ctx_indices.get(&func).copied()
    }

    /// Number of registered context struct types.
    pub fn ctx_count(&self) -> usize {
        self.ctx_indices.len()
    }

    /// Array heap type for an element type, interned on first use.
    pub fn array(&mut self, elem: &Ty, module: &Module) -> CompileResult<u32> {
        if let Some(&idx) = self.array_indices.get(elem) {
            return Ok(idx);
        }
        let vt = self.valtype(elem, module)?;
        let idx = self.push(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Array(ArrayType(FieldType {
                    element_type: StorageType::Val(vt),
                    mutable: true,
                })),
                shared: false,
            },
        });
        self.array_indices.insert(elem.clone(), idx);
        Ok(idx)
    }

    /// Intern a raw wasm signature.
    pub fn sig(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> u32 {
        if let Some(&idx) = self.sig_indices.get(&(params.clone(), results.clone())) {
            return idx;
        }
        let idx = self.push(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Func(FuncType::new(
                    params.clone(),
                    results.clone(),
                )),
                shared: false,
            },
        });
        self.sig_indices.insert((params, results), idx);
        idx
    }

    /// Signature of a compiled function value: opaque context first,
    /// then the declared parameters.
    pub fn func_sig(&mut self, sig: &FuncTy, module: &Module) -> CompileResult<u32> {
        let mut params = vec![ValType::Ref(STRUCTREF)];
        for p in &sig.params {
            params.push(self.valtype(p, module)?);
        }
        let results = if sig.ret.is_void() {
            Vec::new()
        } else {
            vec![self.valtype(&sig.ret, module)?]
        };
        Ok(self.sig(params, results))
    }

    /// Closure value struct for a signature: { ctx, fn }.
    pub fn closure(&mut self, sig: &FuncTy, module: &Module) -> CompileResult<u32> {
        if let Some(&idx) = self.closure_indices.get(sig) {
            return Ok(idx);
        }
        let sig_idx = self.func_sig(sig, module)?;
        let idx = self.push(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Struct(StructType {
                    fields: Box::new([
                        immutable(StorageType::Val(ValType::Ref(STRUCTREF))),
                        immutable(StorageType::Val(ValType::Ref(RefType {
                            nullable: false,
                            heap_type: HeapType::Concrete(sig_idx),
                        }))),
                    ]),
                }),
                shared: false,
            },
        });
        self.closure_indices.insert(sig.clone(), idx);
        Ok(idx)
    }

    /// Wasm value type carrying a source-level type.
    pub fn valtype(&mut self, ty: &Ty, module: &Module) -> CompileResult<ValType> {
        Ok(match ty {
            Ty::Number => ValType::F64,
            Ty::Boolean => ValType::I32,
            Ty::String => ValType::Ref(nullable(self.string_idx)),
            Ty::Any | Ty::Undefined => ValType::Ref(nullable(self.any_idx)),
            Ty::Null => ValType::Ref(RefType {
                nullable: true,
                heap_type: NULLREF,
            }),
            Ty::Array(elem) => {
                let idx = self.array(elem, module)?;
                ValType::Ref(nullable(idx))
            }
            Ty::Func(sig) => {
                let idx = self.closure(sig, module)?;
                ValType::Ref(nullable(idx))
            }
            Ty::Class(id) => ValType::Ref(nullable(self.class(*id)?)),
            Ty::Interface(_) => ValType::Ref(nullable(self.iface_idx)),
            Ty::Void => {
                return Err(CompileError::internal("void has no value representation"))
            }
        })
    }

    /// Serialize as one recursion group.
    pub fn emit(&self, section: &mut TypeSection) {
        section.ty().rec(self.entries.iter().cloned());
    }
}

fn immutable(st: StorageType) -> FieldType {
    FieldType {
        element_type: st,
        mutable: false,
    }
}

fn nullable(idx: u32) -> RefType {
    RefType {
        nullable: true,
        heap_type: HeapType::Concrete(idx),
    }
}

fn placeholder() -> SubType {
    SubType {
        is_final: true,
        supertype_idx: None,
        composite_type: CompositeType {
            inner: CompositeInnerType::Struct(StructType {
                fields: Box::new([]),
            }),
            shared: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sema::scope::VarModifier;
    use crate::sema::ast::{Expr, Stmt};

    #[test]
    fn test_fixed_shapes_come_first() {
        let m = Module::new();
        let t = WasmTypeTable::new(&m).unwrap();
        assert_eq!(t.string_idx, 0);
        assert_eq!(t.any_idx, 1);
        assert_eq!(t.iface_idx, 2);
    }

    #[test]
    fn test_no_context_type_for_capture_free_function() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::Void, false);
        crate::sema::analyze(&mut m).unwrap();
        let t = WasmTypeTable::new(&m).unwrap();
        assert!(t.ctx(f).is_none());
        assert_eq!(t.ctx_count(), 0);
    }

    #[test]
    fn test_context_type_registered_for_capturing_function() {
        let mut m = Module::new();
        let outer = m.add_function(m.global_scope(), "outer", &[], Ty::Void, false);
        let x = m.declare_var(outer, "x", Ty::Number, VarModifier::Let);
        let inner = m.add_function(outer, "inner", &[], Ty::Number, false);
        m.scope_mut(inner)
            .stmts
            .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));
        crate::sema::analyze(&mut m).unwrap();

        let t = WasmTypeTable::new(&m).unwrap();
        assert!(t.ctx(outer).is_some());
        // The inner function reuses outer's context.
        assert!(t.ctx(inner).is_none());
        assert_eq!(t.ctx_count(), 1);
    }

    #[test]
    fn test_signatures_are_interned() {
        let m = Module::new();
        let mut t = WasmTypeTable::new(&m).unwrap();
        let sig = FuncTy {
            params: vec![Ty::Number],
            ret: Ty::Number,
        };
        let a = t.func_sig(&sig, &m).unwrap();
        let b = t.func_sig(&sig, &m).unwrap();
        assert_eq!(a, b);
    }
}
