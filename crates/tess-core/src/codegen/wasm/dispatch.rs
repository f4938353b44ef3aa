//! Interface dispatch.
//!
//! Interface values are fat structs carrying the concrete class id, a
//! shape-table offset and the object itself. Every interface call or
//! field access goes through one generated dispatcher function per
//! `(interface, member)` pair: a chain of class-id compares, each arm
//! casting the object to its concrete class and calling (or accessing)
//! the resolved member directly. Unmatched ids report through the host
//! type-error import and trap.

use std::collections::HashMap;

use wasm_encoder::{BlockType, Function, HeapType, Instruction, RefType, ValType};

use crate::error::{CompileError, CompileResult};
use crate::ids::ClassId;
use crate::sema::scope::Module;
use crate::tir::TirProgram;
use crate::types::{FuncTy, MethodKind, Ty};

use super::types::WasmTypeTable;
use super::IMPORT_THROW_TYPE_ERROR;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    Method,
    Get,
    Set,
}

#[derive(Clone, Debug)]
pub struct DispatchEntry {
    pub iface: ClassId,
    pub name: String,
    pub kind: DispatchKind,
    pub sig: FuncTy,
}

/// Dispatcher indices, handed out in encounter order starting right
/// after the last user function.
pub struct DispatchTable {
    base: u32,
    entries: Vec<DispatchEntry>,
    index: HashMap<(ClassId, DispatchKind, String), u32>,
}

impl DispatchTable {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DispatchEntry] {
        &self.entries
    }

    fn intern(&mut self, iface: ClassId, kind: DispatchKind, name: &str, sig: FuncTy) -> u32 {
        let key = (iface, kind, name.to_string());
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.base + self.entries.len() as u32;
        self.entries.push(DispatchEntry {
            iface,
            name: name.to_string(),
            kind,
            sig,
        });
        self.index.insert(key, idx);
        idx
    }

    /// Function index of the dispatcher for a method call.
    pub fn method(&mut self, iface: ClassId, name: &str, sig: &FuncTy) -> u32 {
        self.intern(iface, DispatchKind::Method, name, sig.clone())
    }

    /// Function index of the dispatcher reading a field.
    pub fn getter(&mut self, iface: ClassId, name: &str, ty: &Ty) -> u32 {
        let sig = FuncTy {
            params: Vec::new(),
            ret: ty.clone(),
        };
        self.intern(iface, DispatchKind::Get, name, sig)
    }

    /// Function index of the dispatcher writing a field.
    pub fn setter(&mut self, iface: ClassId, name: &str, ty: &Ty) -> u32 {
        let sig = FuncTy {
            params: vec![ty.clone()],
            ret: Ty::Void,
        };
        self.intern(iface, DispatchKind::Set, name, sig)
    }
}

/// Emit every collected dispatcher body, in table order. Returns
/// `(type index, body)` pairs for the module builder to append.
pub fn emit_dispatchers(
    table: &DispatchTable,
    module: &Module,
    types: &mut WasmTypeTable,
    program: &TirProgram,
    user_base: u32,
) -> CompileResult<Vec<(u32, Function)>> {
    let entries: Vec<DispatchEntry> = table.entries().to_vec();
    let mut out = Vec::with_capacity(entries.len());
    for entry in &entries {
        let mut params = vec![ValType::Ref(RefType {
            nullable: true,
            heap_type: HeapType::Concrete(types.iface_idx),
        })];
        for p in &entry.sig.params {
            params.push(types.valtype(p, module)?);
        }
        let results = if entry.sig.ret.is_void() {
            Vec::new()
        } else {
            vec![types.valtype(&entry.sig.ret, module)?]
        };
        let type_idx = types.sig(params, results);
        let body = emit_dispatcher(entry, module, types, program, user_base)?;
        out.push((type_idx, body));
    }
    Ok(out)
}

fn emit_dispatcher(
    entry: &DispatchEntry,
    module: &Module,
    types: &mut WasmTypeTable,
    program: &TirProgram,
    user_base: u32,
) -> CompileResult<Function> {
    let iface_idx = types.iface_idx;
    let mut f = Function::new([]);

    let class_ids: Vec<ClassId> = module
        .classes
        .iter()
        .filter(|(_, def)| !def.is_interface)
        .map(|(id, _)| id)
        .collect();
    for class in class_ids {
        if !module.classes.implements(class, entry.iface) {
            continue;
        }
        match entry.kind {
            DispatchKind::Method => {
                let Some((_, _, m)) =
                    module
                        .classes
                        .find_method(class, &entry.name, entry.sig.params.len())
                else {
                    continue;
                };
                let Some(scope) = m.scope else { continue };
                let target = user_base + dispatch_target(program, scope, &entry.name)?;
                emit_guard(&mut f, iface_idx, class);
                push_null_ctx(&mut f);
                push_receiver(&mut f, iface_idx, types.class(class)?);
                for i in 0..entry.sig.params.len() as u32 {
                    f.instruction(&Instruction::LocalGet(1 + i));
                }
                f.instruction(&Instruction::Call(target));
                f.instruction(&Instruction::Return);
                f.instruction(&Instruction::End);
            }
            DispatchKind::Get => {
                if let Some(idx) = module.classes.field_index(class, &entry.name) {
                    emit_guard(&mut f, iface_idx, class);
                    push_receiver(&mut f, iface_idx, types.class(class)?);
                    f.instruction(&Instruction::StructGet {
                        struct_type_index: types.class(class)?,
                        field_index: idx as u32,
                    });
                    f.instruction(&Instruction::Return);
                    f.instruction(&Instruction::End);
                } else if let Some(scope) = accessor(module, class, &entry.name, MethodKind::Getter)
                {
                    let target = user_base + dispatch_target(program, scope, &entry.name)?;
                    emit_guard(&mut f, iface_idx, class);
                    push_null_ctx(&mut f);
                    push_receiver(&mut f, iface_idx, types.class(class)?);
                    f.instruction(&Instruction::Call(target));
                    f.instruction(&Instruction::Return);
                    f.instruction(&Instruction::End);
                }
            }
            DispatchKind::Set => {
                if let Some(idx) = module.classes.field_index(class, &entry.name) {
                    emit_guard(&mut f, iface_idx, class);
                    push_receiver(&mut f, iface_idx, types.class(class)?);
                    f.instruction(&Instruction::LocalGet(1));
                    f.instruction(&Instruction::StructSet {
                        struct_type_index: types.class(class)?,
                        field_index: idx as u32,
                    });
                    f.instruction(&Instruction::Return);
                    f.instruction(&Instruction::End);
                } else if let Some(scope) = accessor(module, class, &entry.name, MethodKind::Setter)
                {
                    let target = user_base + dispatch_target(program, scope, &entry.name)?;
                    emit_guard(&mut f, iface_idx, class);
                    push_null_ctx(&mut f);
                    push_receiver(&mut f, iface_idx, types.class(class)?);
                    f.instruction(&Instruction::LocalGet(1));
                    f.instruction(&Instruction::Call(target));
                    f.instruction(&Instruction::Return);
                    f.instruction(&Instruction::End);
                }
            }
        }
    }

    // No arm matched: report the offending class id and trap.
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: iface_idx,
        field_index: 0,
    });
    f.instruction(&Instruction::Call(IMPORT_THROW_TYPE_ERROR));
    f.instruction(&Instruction::Unreachable);
    f.instruction(&Instruction::End);
    Ok(f)
}

fn dispatch_target(program: &TirProgram, scope: crate::ids::ScopeId, name: &str) -> CompileResult<u32> {
    program
        .func_index
        .get(&scope)
        .copied()
        .ok_or_else(|| CompileError::internal(format!("unlowered dispatch target {}", name)))
}

fn accessor(
    module: &Module,
    class: ClassId,
    name: &str,
    kind: MethodKind,
) -> Option<crate::ids::ScopeId> {
    let mut cur = Some(class);
    while let Some(c) = cur {
        let def = module.classes.get(c);
        if let Some(m) = def.methods.iter().find(|m| m.kind == kind && m.name == name) {
            return m.scope;
        }
        cur = def.super_id;
    }
    None
}

fn emit_guard(f: &mut Function, iface_idx: u32, class: ClassId) {
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: iface_idx,
        field_index: 0,
    });
    f.instruction(&Instruction::I32Const(class.0 as i32));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::If(BlockType::Empty));
}

fn push_null_ctx(f: &mut Function) {
    f.instruction(&Instruction::RefNull(super::types::NULLREF));
}

fn push_receiver(f: &mut Function, iface_idx: u32, class_idx: u32) {
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::StructGet {
        struct_type_index: iface_idx,
        field_index: 2,
    });
    f.instruction(&Instruction::RefCastNonNull(HeapType::Concrete(class_idx)));
}
