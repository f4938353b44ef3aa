//! TIR-to-wasm function body compilation.
//!
//! One `FunctionCompiler` per lowered function. Instructions are
//! buffered so locals (context slot, scratch pool) can be declared
//! after the body is known. Local index space: the implicit context
//! parameter at 0, declared parameters and variable slots shifted up
//! by one, then the function's own context reference, then scratch.
//!
//! The wasm stack discipline occasionally disagrees with TIR operand
//! order (a callee's context must sit below its arguments, an array
//! index must be truncated under the stored value). Those cases spill
//! operands to a small typed scratch pool and replay them.

use wasm_encoder::{
    AbstractHeapType, BlockType, Function, HeapType, Instruction, RefType, ValType,
};

use crate::compiler::CompileOptions;
use crate::error::{CompileError, CompileResult};
use crate::ids::{ClassId, LabelId, ScopeId};
use crate::sema::ast::{BinOp, UnOp};
use crate::sema::capture::{ctx_depth, ctx_owner, has_captures, parent_function};
use crate::sema::scope::Module;
use crate::tir::{RuntimeOp, TirFunction, TirFunctionKind, TirOpKind, TirProgram};
use crate::types::{FuncTy, Ty};

use super::data::DataSegment;
use super::dispatch::DispatchTable;
use super::runtime::{
    RuntimeFunctions, TAG_ARRAY, TAG_FUNCTION, TAG_NULL, TAG_OBJECT, TAG_STRING, TAG_UNDEFINED,
};
use super::types::{WasmTypeTable, NULLREF};
use super::{host_import, IMPORT_LOG_STRING};
use crate::tir::TirOp;

enum Frame {
    Block(LabelId),
    Loop(LabelId),
    If,
}

struct Scratch {
    vt: ValType,
    taken: bool,
}

pub struct FunctionCompiler<'a> {
    module: &'a Module,
    program: &'a TirProgram,
    func: &'a TirFunction,
    types: &'a mut WasmTypeTable,
    data: &'a mut DataSegment,
    runtime: &'a RuntimeFunctions,
    dispatch: &'a mut DispatchTable,
    /// Functions referenced by `ref.func`; the builder declares them
    /// in an element segment.
    declared: &'a mut Vec<u32>,
    options: &'a CompileOptions,
    user_base: u32,
    insns: Vec<Instruction<'static>>,
    frames: Vec<Frame>,
    /// 1 for ordinary functions, 0 for the start routine (whose wasm
    /// type must be `[] -> []`).
    ctx_offset: u32,
    /// Local holding this function's own freshly built context.
    ctx_local: Option<u32>,
    /// Capturing ancestors-or-self, innermost first; `depth` in the
    /// context ops indexes into this chain.
    ctx_chain: Vec<ScopeId>,
    scratch_base: u32,
    scratch: Vec<Scratch>,
}

impl<'a> FunctionCompiler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        module: &'a Module,
        program: &'a TirProgram,
        func: &'a TirFunction,
        types: &'a mut WasmTypeTable,
        data: &'a mut DataSegment,
        runtime: &'a RuntimeFunctions,
        dispatch: &'a mut DispatchTable,
        declared: &'a mut Vec<u32>,
        options: &'a CompileOptions,
        user_base: u32,
    ) -> Self {
        let ctx_offset = match func.kind {
            TirFunctionKind::Start => 0,
            _ => 1,
        };
        let mut ctx_chain = Vec::new();
        if let Some(scope) = func.scope {
            let mut cur = ctx_owner(module, scope);
            while let Some(f) = cur {
                ctx_chain.push(f);
                cur = parent_function(module, f).and_then(|p| ctx_owner(module, p));
            }
        }
        Self {
            module,
            program,
            func,
            types,
            data,
            runtime,
            dispatch,
            declared,
            options,
            user_base,
            insns: Vec::new(),
            frames: Vec::new(),
            ctx_offset,
            ctx_local: None,
            ctx_chain,
            scratch_base: 0,
            scratch: Vec::new(),
        }
    }

    pub fn compile(mut self) -> CompileResult<Function> {
        let param_count = self.func.params.len() as u32;
        let mut locals: Vec<ValType> = Vec::new();
        for ty in &self.func.var_types {
            locals.push(self.types.valtype(ty, self.module)?);
        }

        let own_ctx = self
            .func
            .scope
            .filter(|&s| has_captures(self.module, s))
            .and_then(|s| self.types.ctx(s).map(|idx| (s, idx)));
        if let Some((_, idx)) = own_ctx {
            let l = self.ctx_offset + param_count + locals.len() as u32;
            self.ctx_local = Some(l);
            locals.push(ValType::Ref(RefType {
                nullable: false,
                heap_type: HeapType::Concrete(idx),
            }));
        }
        self.scratch_base = self.ctx_offset + param_count + locals.len() as u32;

        if let Some((scope, idx)) = own_ctx {
            self.emit_ctx_prologue(scope, idx)?;
        }

        let ops = &self.func.ops;
        for op in ops {
            self.emit_op(op)?;
        }
        self.insns.push(Instruction::End);

        for s in &self.scratch {
            locals.push(s.vt);
        }
        let mut out = Function::new(locals.into_iter().map(|vt| (1, vt)));
        for insn in &self.insns {
            out.instruction(insn);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Locals and scratch
    // ------------------------------------------------------------------

    fn local(&self, slot: u32) -> u32 {
        self.ctx_offset + slot
    }

    fn alloc_scratch(&mut self, vt: ValType) -> u32 {
        for (i, s) in self.scratch.iter_mut().enumerate() {
            if !s.taken && s.vt == vt {
                s.taken = true;
                return self.scratch_base + i as u32;
            }
        }
        self.scratch.push(Scratch { vt, taken: true });
        self.scratch_base + self.scratch.len() as u32 - 1
    }

    fn free_scratch(&mut self, local: u32) {
        let i = (local - self.scratch_base) as usize;
        self.scratch[i].taken = false;
    }

    /// Pop the topmost values (typed `tys`, in stack order) into
    /// scratch locals; returns the locals in `tys` order.
    fn spill(&mut self, tys: &[Ty]) -> CompileResult<Vec<u32>> {
        let mut locals = vec![0u32; tys.len()];
        for (i, ty) in tys.iter().enumerate().rev() {
            let vt = self.types.valtype(ty, self.module)?;
            let l = self.alloc_scratch(vt);
            self.insns.push(Instruction::LocalSet(l));
            locals[i] = l;
        }
        Ok(locals)
    }

    /// Replay spilled values and release their locals.
    fn unspill(&mut self, locals: &[u32]) {
        for &l in locals {
            self.insns.push(Instruction::LocalGet(l));
        }
        for &l in locals {
            self.free_scratch(l);
        }
    }

    // ------------------------------------------------------------------
    // Context chain
    // ------------------------------------------------------------------

    /// Build this function's context in the prologue: parent link from
    /// the incoming context parameter, captured parameters copied in,
    /// remaining capture slots zeroed.
    fn emit_ctx_prologue(&mut self, scope: ScopeId, ctx_idx: u32) -> CompileResult<()> {
        self.insns.push(Instruction::LocalGet(0));
        for (ty, param_slot) in capture_slots(self.module, scope)? {
            match param_slot {
                Some(slot) => self.insns.push(Instruction::LocalGet(self.local(slot))),
                None => self.push_default(&ty)?,
            }
        }
        self.insns.push(Instruction::StructNew(ctx_idx));
        let l = self
            .ctx_local
            .ok_or_else(|| CompileError::internal("context prologue without context local"))?;
        self.insns.push(Instruction::LocalSet(l));
        Ok(())
    }

    fn push_default(&mut self, ty: &Ty) -> CompileResult<()> {
        match self.types.valtype(ty, self.module)? {
            ValType::F64 => self.insns.push(Instruction::F64Const(0.0)),
            ValType::I32 => self.insns.push(Instruction::I32Const(0)),
            ValType::Ref(rt) => self.insns.push(Instruction::RefNull(rt.heap_type)),
            other => {
                return Err(CompileError::internal(format!(
                    "no default value for {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Push the context `depth` parent links up from the current one,
    /// typed as its concrete context struct.
    fn push_ctx_at_depth(&mut self, depth: u32) -> CompileResult<()> {
        let chain = &self.ctx_chain;
        if depth as usize >= chain.len() {
            return Err(CompileError::internal(format!(
                "context depth {} exceeds chain of {}",
                depth,
                chain.len()
            )));
        }
        let ctx_ty = |types: &WasmTypeTable, f: ScopeId| {
            types
                .ctx(f)
                .ok_or_else(|| CompileError::internal(format!("no context type for {}", f)))
        };
        match self.ctx_local {
            Some(l) => self.insns.push(Instruction::LocalGet(l)),
            None => {
                let idx = ctx_ty(self.types, chain[0])?;
                self.insns.push(Instruction::LocalGet(0));
                self.insns
                    .push(Instruction::RefCastNonNull(HeapType::Concrete(idx)));
            }
        }
        for i in 0..depth as usize {
            let cur = ctx_ty(self.types, self.ctx_chain[i])?;
            let next = ctx_ty(self.types, self.ctx_chain[i + 1])?;
            self.insns.push(Instruction::StructGet {
                struct_type_index: cur,
                field_index: 0,
            });
            self.insns
                .push(Instruction::RefCastNonNull(HeapType::Concrete(next)));
        }
        Ok(())
    }

    /// Push the context a callee expects: the context of the nearest
    /// capturing ancestor of its definition site, or null when no
    /// enclosing function captures anything.
    fn push_ctx_for_callee(&mut self, callee: ScopeId) -> CompileResult<()> {
        let owner = parent_function(self.module, callee)
            .and_then(|p| ctx_owner(self.module, p));
        match owner {
            None => self.insns.push(Instruction::RefNull(NULLREF)),
            Some(o) => {
                let scope = self.func.scope.ok_or_else(|| {
                    CompileError::internal("context-carrying call from start routine")
                })?;
                let depth = ctx_depth(self.module, scope, o);
                self.push_ctx_at_depth(depth)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Op emission
    // ------------------------------------------------------------------

    fn emit_op(&mut self, op: &TirOp) -> CompileResult<()> {
        match &op.kind {
            TirOpKind::ConstNumber(v) => self.insns.push(Instruction::F64Const(*v)),
            TirOpKind::ConstBool(v) => self.insns.push(Instruction::I32Const(*v as i32)),
            TirOpKind::ConstString(s) => {
                let (off, len) = self.data.intern(s);
                self.insns.push(Instruction::I32Const(off as i32));
                self.insns.push(Instruction::I32Const(len as i32));
                self.insns.push(Instruction::ArrayNewData {
                    array_type_index: self.types.string_idx,
                    array_data_index: 0,
                });
            }
            TirOpKind::ConstNull => match self.types.valtype(&op.ty, self.module)? {
                ValType::Ref(rt) => self.insns.push(Instruction::RefNull(rt.heap_type)),
                other => {
                    return Err(CompileError::internal(format!(
                        "null constant of non-reference type {:?}",
                        other
                    )))
                }
            },
            TirOpKind::ConstUndefined => {
                self.check_any("undefined value")?;
                self.insns.push(Instruction::I32Const(TAG_UNDEFINED));
                self.insns.push(Instruction::F64Const(0.0));
                self.insns.push(Instruction::RefNull(HeapType::Abstract {
                    shared: false,
                    ty: AbstractHeapType::Any,
                }));
                self.insns.push(Instruction::StructNew(self.types.any_idx));
            }

            TirOpKind::LocalGet(slot) => self.insns.push(Instruction::LocalGet(self.local(*slot))),
            TirOpKind::LocalSet(slot) => self.insns.push(Instruction::LocalSet(self.local(*slot))),
            TirOpKind::GlobalGet(id) => self.insns.push(Instruction::GlobalGet(id.0)),
            TirOpKind::GlobalSet(id) => self.insns.push(Instruction::GlobalSet(id.0)),
            TirOpKind::CtxGet { func, depth, slot } => {
                let ctx_idx = self.ctx_index(*func)?;
                self.push_ctx_at_depth(*depth)?;
                self.insns.push(Instruction::StructGet {
                    struct_type_index: ctx_idx,
                    field_index: slot + 1,
                });
            }
            TirOpKind::CtxSet { func, depth, slot } => {
                let ctx_idx = self.ctx_index(*func)?;
                let ty = capture_slots(self.module, *func)?
                    .into_iter()
                    .nth(*slot as usize)
                    .map(|(ty, _)| ty)
                    .ok_or_else(|| CompileError::internal("capture slot out of range"))?;
                let spilled = self.spill(std::slice::from_ref(&ty))?;
                self.push_ctx_at_depth(*depth)?;
                self.unspill(&spilled);
                self.insns.push(Instruction::StructSet {
                    struct_type_index: ctx_idx,
                    field_index: slot + 1,
                });
            }

            TirOpKind::Binary { op, operand } => self.emit_binary(*op, operand)?,
            TirOpKind::Unary(UnOp::Neg) => self.insns.push(Instruction::F64Neg),
            TirOpKind::Unary(UnOp::Not) => self.insns.push(Instruction::I32Eqz),
            TirOpKind::TruthyTest { from } => self.emit_truthy(from)?,
            TirOpKind::BoolToNumber => self.insns.push(Instruction::F64ConvertI32U),
            TirOpKind::Drop => self.insns.push(Instruction::Drop),

            TirOpKind::CallDirect { func } => {
                let target = self.user_index(*func)?;
                let params = self.callee_params(*func)?;
                let spilled = self.spill(&params)?;
                self.push_ctx_for_callee(*func)?;
                self.unspill(&spilled);
                self.insns.push(Instruction::Call(target));
            }
            TirOpKind::CallValue { sig } => self.emit_call_value(sig)?,
            TirOpKind::CallRuntime(op) => {
                if self.options.no_stdlib {
                    return Err(CompileError::Unimplemented(format!(
                        "runtime helper {:?} with --no-stdlib",
                        op
                    )));
                }
                let idx = match op {
                    RuntimeOp::StringLen => self.runtime.string_len,
                    RuntimeOp::StringConcat => self.runtime.string_concat,
                    RuntimeOp::StringEq => self.runtime.string_eq,
                    RuntimeOp::StringSlice => self.runtime.string_slice,
                    RuntimeOp::StringCharAt => self.runtime.string_char_at,
                };
                self.insns.push(Instruction::Call(idx));
            }
            TirOpKind::CallHost { name, .. } => {
                if self.options.no_stdlib && host_import(name) == Some(IMPORT_LOG_STRING) {
                    return Err(CompileError::Unsupported(format!(
                        "host call {} with --no-stdlib",
                        name
                    )));
                }
                let idx = host_import(name).ok_or_else(|| {
                    CompileError::Unimplemented(format!("host function {}", name))
                })?;
                self.insns.push(Instruction::Call(idx));
            }
            TirOpKind::CallMethod { method, .. } => {
                let target = self.user_index(*method)?;
                let params = self.callee_params(*method)?;
                let spilled = self.spill(&params)?;
                self.insns.push(Instruction::RefNull(NULLREF));
                self.unspill(&spilled);
                self.insns.push(Instruction::Call(target));
            }
            TirOpKind::CallInterface { iface, method, sig } => {
                self.check_iface("interface call")?;
                let idx = self.dispatch.method(*iface, method, sig);
                self.insns.push(Instruction::Call(idx));
            }

            TirOpKind::New { class, argc } => self.emit_new(*class, *argc)?,
            TirOpKind::StructGet { class, field } => {
                let idx = self.types.class(*class)?;
                self.insns.push(Instruction::StructGet {
                    struct_type_index: idx,
                    field_index: *field,
                });
            }
            TirOpKind::StructSet { class, field } => {
                let idx = self.types.class(*class)?;
                self.insns.push(Instruction::StructSet {
                    struct_type_index: idx,
                    field_index: *field,
                });
            }
            TirOpKind::ToInterface { class, .. } => {
                self.check_iface("interface conversion")?;
                let vt = self.types.valtype(&Ty::Class(*class), self.module)?;
                let s = self.alloc_scratch(vt);
                self.insns.push(Instruction::LocalSet(s));
                self.insns.push(Instruction::I32Const(class.0 as i32));
                let off = self.data.shape_table(&self.module.classes, *class);
                self.insns.push(Instruction::I32Const(off as i32));
                self.insns.push(Instruction::LocalGet(s));
                self.insns.push(Instruction::StructNew(self.types.iface_idx));
                self.free_scratch(s);
            }
            TirOpKind::InterfaceGet { iface, field } => {
                self.check_iface("interface field read")?;
                let idx = self.dispatch.getter(*iface, field, &op.ty);
                self.insns.push(Instruction::Call(idx));
            }
            TirOpKind::InterfaceSet { iface, field } => {
                self.check_iface("interface field write")?;
                let ty = iface_field_ty(self.module, *iface, field)?;
                let idx = self.dispatch.setter(*iface, field, &ty);
                self.insns.push(Instruction::Call(idx));
            }

            TirOpKind::ArrayLit { elem, len } => {
                let idx = self.types.array(elem, self.module)?;
                self.insns.push(Instruction::ArrayNewFixed {
                    array_type_index: idx,
                    array_size: *len,
                });
            }
            TirOpKind::ArrayGet { elem } => {
                let idx = self.types.array(elem, self.module)?;
                self.insns.push(Instruction::I32TruncF64S);
                self.insns.push(Instruction::ArrayGet(idx));
            }
            TirOpKind::ArraySet { elem } => {
                let idx = self.types.array(elem, self.module)?;
                let spilled = self.spill(std::slice::from_ref(elem))?;
                self.insns.push(Instruction::I32TruncF64S);
                self.unspill(&spilled);
                self.insns.push(Instruction::ArraySet(idx));
            }
            TirOpKind::ArrayLen => {
                self.insns.push(Instruction::ArrayLen);
                self.insns.push(Instruction::F64ConvertI32U);
            }

            TirOpKind::BoxAny { from } => self.emit_box(from)?,
            TirOpKind::UnboxAny { to } => self.emit_unbox(to)?,
            TirOpKind::TypeOf => {
                self.check_any("dynamic typeof")?;
                self.insns.push(Instruction::Call(self.runtime.any_typeof));
            }
            TirOpKind::ClosureCreate { func } => {
                let sig = self.callee_sig(*func)?;
                let closure_idx = self.types.closure(&sig, self.module)?;
                self.push_ctx_for_callee(*func)?;
                let target = self.user_index(*func)?;
                if !self.declared.contains(&target) {
                    self.declared.push(target);
                }
                self.insns.push(Instruction::RefFunc(target));
                self.insns.push(Instruction::StructNew(closure_idx));
            }
            TirOpKind::RefCast { from, to } => self.emit_ref_cast(from, to)?,

            TirOpKind::BlockStart(l) => {
                self.frames.push(Frame::Block(*l));
                self.insns.push(Instruction::Block(BlockType::Empty));
            }
            TirOpKind::BlockEnd | TirOpKind::LoopEnd => {
                self.frames.pop();
                self.insns.push(Instruction::End);
            }
            TirOpKind::LoopStart(l) => {
                self.frames.push(Frame::Loop(*l));
                self.insns.push(Instruction::Loop(BlockType::Empty));
            }
            TirOpKind::IfStart => {
                self.frames.push(Frame::If);
                let bt = if op.ty.is_void() {
                    BlockType::Empty
                } else {
                    BlockType::Result(self.types.valtype(&op.ty, self.module)?)
                };
                self.insns.push(Instruction::If(bt));
            }
            TirOpKind::Else => self.insns.push(Instruction::Else),
            TirOpKind::IfEnd => {
                self.frames.pop();
                self.insns.push(Instruction::End);
            }
            TirOpKind::Br(l) => {
                let depth = self.branch_depth(*l)?;
                self.insns.push(Instruction::Br(depth));
            }
            TirOpKind::BrIf(l) => {
                let depth = self.branch_depth(*l)?;
                self.insns.push(Instruction::BrIf(depth));
            }
            TirOpKind::Unreachable => self.insns.push(Instruction::Unreachable),
        }
        Ok(())
    }

    fn branch_depth(&self, label: LabelId) -> CompileResult<u32> {
        self.frames
            .iter()
            .rev()
            .position(|f| matches!(f, Frame::Block(l) | Frame::Loop(l) if *l == label))
            .map(|d| d as u32)
            .ok_or_else(|| CompileError::internal(format!("branch to unbound {}", label)))
    }

    fn ctx_index(&self, func: ScopeId) -> CompileResult<u32> {
        self.types
            .ctx(func)
            .ok_or_else(|| CompileError::internal(format!("no context type for {}", func)))
    }

    fn user_index(&self, func: ScopeId) -> CompileResult<u32> {
        self.program
            .func_index
            .get(&func)
            .map(|&i| self.user_base + i)
            .ok_or_else(|| CompileError::internal(format!("unlowered call target {}", func)))
    }

    fn callee_params(&self, func: ScopeId) -> CompileResult<Vec<Ty>> {
        self.program
            .function_of(func)
            .map(|f| f.params.clone())
            .ok_or_else(|| CompileError::internal(format!("unlowered call target {}", func)))
    }

    fn callee_sig(&self, func: ScopeId) -> CompileResult<FuncTy> {
        self.program
            .function_of(func)
            .map(|f| FuncTy {
                params: f.params.clone(),
                ret: f.ret.clone(),
            })
            .ok_or_else(|| CompileError::internal(format!("unlowered closure target {}", func)))
    }

    fn check_any(&self, what: &str) -> CompileResult<()> {
        if self.options.no_any {
            return Err(CompileError::Unsupported(format!(
                "{} with --no-any",
                what
            )));
        }
        Ok(())
    }

    fn check_iface(&self, what: &str) -> CompileResult<()> {
        if self.options.no_interface {
            return Err(CompileError::Unsupported(format!(
                "{} with --no-interface",
                what
            )));
        }
        Ok(())
    }

    fn emit_binary(&mut self, op: BinOp, operand: &Ty) -> CompileResult<()> {
        match operand {
            Ty::Number => {
                let insn = match op {
                    BinOp::Add => Instruction::F64Add,
                    BinOp::Sub => Instruction::F64Sub,
                    BinOp::Mul => Instruction::F64Mul,
                    BinOp::Div => Instruction::F64Div,
                    BinOp::Rem => return self.emit_rem(),
                    BinOp::Eq => Instruction::F64Eq,
                    BinOp::Ne => Instruction::F64Ne,
                    BinOp::Lt => Instruction::F64Lt,
                    BinOp::Le => Instruction::F64Le,
                    BinOp::Gt => Instruction::F64Gt,
                    BinOp::Ge => Instruction::F64Ge,
                    BinOp::And | BinOp::Or => {
                        return Err(CompileError::internal(
                            "short-circuit operator survived lowering",
                        ))
                    }
                };
                self.insns.push(insn);
            }
            Ty::Boolean => {
                let insn = match op {
                    BinOp::Eq => Instruction::I32Eq,
                    BinOp::Ne => Instruction::I32Ne,
                    other => {
                        return Err(CompileError::internal(format!(
                            "boolean operator {:?} survived lowering",
                            other
                        )))
                    }
                };
                self.insns.push(insn);
            }
            Ty::Class(_) | Ty::Array(_) | Ty::Null => {
                self.insns.push(Instruction::RefEq);
                if op == BinOp::Ne {
                    self.insns.push(Instruction::I32Eqz);
                }
            }
            other => {
                return Err(CompileError::internal(format!(
                    "binary {:?} on operand type {}",
                    op, other
                )))
            }
        }
        Ok(())
    }

    /// f64 has no remainder instruction; compute `a - trunc(a/b) * b`.
    fn emit_rem(&mut self) -> CompileResult<()> {
        let b = self.alloc_scratch(ValType::F64);
        let a = self.alloc_scratch(ValType::F64);
        self.insns.push(Instruction::LocalSet(b));
        self.insns.push(Instruction::LocalSet(a));
        self.insns.push(Instruction::LocalGet(a));
        self.insns.push(Instruction::LocalGet(a));
        self.insns.push(Instruction::LocalGet(b));
        self.insns.push(Instruction::F64Div);
        self.insns.push(Instruction::F64Trunc);
        self.insns.push(Instruction::LocalGet(b));
        self.insns.push(Instruction::F64Mul);
        self.insns.push(Instruction::F64Sub);
        self.free_scratch(b);
        self.free_scratch(a);
        Ok(())
    }

    fn emit_truthy(&mut self, from: &Ty) -> CompileResult<()> {
        match from {
            Ty::Boolean => {}
            Ty::Number => {
                // NaN and zero are the only falsy numbers.
                let s = self.alloc_scratch(ValType::F64);
                self.insns.push(Instruction::LocalSet(s));
                self.insns.push(Instruction::LocalGet(s));
                self.insns.push(Instruction::LocalGet(s));
                self.insns.push(Instruction::F64Eq);
                self.insns.push(Instruction::LocalGet(s));
                self.insns.push(Instruction::F64Const(0.0));
                self.insns.push(Instruction::F64Ne);
                self.insns.push(Instruction::I32And);
                self.free_scratch(s);
            }
            Ty::String => {
                self.insns.push(Instruction::ArrayLen);
                self.insns.push(Instruction::I32Const(0));
                self.insns.push(Instruction::I32Ne);
            }
            Ty::Any | Ty::Undefined => {
                self.check_any("dynamic truthiness")?;
                self.insns.push(Instruction::Call(self.runtime.any_truthy));
            }
            Ty::Null => {
                self.insns.push(Instruction::Drop);
                self.insns.push(Instruction::I32Const(0));
            }
            Ty::Class(_) | Ty::Interface(_) | Ty::Array(_) | Ty::Func(_) => {
                self.insns.push(Instruction::RefIsNull);
                self.insns.push(Instruction::I32Eqz);
            }
            Ty::Void => {
                return Err(CompileError::internal("truthiness of void"));
            }
        }
        Ok(())
    }

    fn emit_call_value(&mut self, sig: &FuncTy) -> CompileResult<()> {
        let closure_idx = self.types.closure(sig, self.module)?;
        let sig_idx = self.types.func_sig(sig, self.module)?;
        let clos_vt = self.types.valtype(&Ty::Func(Box::new(sig.clone())), self.module)?;
        let spilled = self.spill(&sig.params)?;
        let clos = self.alloc_scratch(clos_vt);
        self.insns.push(Instruction::LocalSet(clos));
        self.insns.push(Instruction::LocalGet(clos));
        self.insns.push(Instruction::StructGet {
            struct_type_index: closure_idx,
            field_index: 0,
        });
        self.unspill(&spilled);
        self.insns.push(Instruction::LocalGet(clos));
        self.insns.push(Instruction::StructGet {
            struct_type_index: closure_idx,
            field_index: 1,
        });
        self.insns.push(Instruction::CallRef(sig_idx));
        self.free_scratch(clos);
        Ok(())
    }

    /// Allocate with zeroed fields, then run the resolved constructor
    /// (possibly inherited) against the new object.
    fn emit_new(&mut self, class: ClassId, argc: u32) -> CompileResult<()> {
        let class_idx = self.types.class(class)?;
        let ctor = self
            .module
            .classes
            .find_constructor(class)
            .and_then(|(_, _, m)| m.scope);
        let Some(ctor_scope) = ctor else {
            if argc != 0 {
                return Err(CompileError::internal(
                    "constructor arguments without a constructor",
                ));
            }
            self.insns.push(Instruction::StructNewDefault(class_idx));
            return Ok(());
        };

        let target = self.user_index(ctor_scope)?;
        let params = self.callee_params(ctor_scope)?;
        if params.len() as u32 != argc + 1 {
            return Err(CompileError::internal(format!(
                "constructor arity mismatch for {}",
                class
            )));
        }
        let spilled = self.spill(&params[1..])?;
        let vt = self.types.valtype(&Ty::Class(class), self.module)?;
        let obj = self.alloc_scratch(vt);
        self.insns.push(Instruction::StructNewDefault(class_idx));
        self.insns.push(Instruction::LocalSet(obj));
        self.insns.push(Instruction::RefNull(NULLREF));
        self.insns.push(Instruction::LocalGet(obj));
        self.unspill(&spilled);
        self.insns.push(Instruction::Call(target));
        self.insns.push(Instruction::LocalGet(obj));
        self.free_scratch(obj);
        Ok(())
    }

    fn emit_box(&mut self, from: &Ty) -> CompileResult<()> {
        self.check_any("boxing to any")?;
        match from {
            Ty::Number => self.insns.push(Instruction::Call(self.runtime.box_number)),
            Ty::Boolean => self.insns.push(Instruction::Call(self.runtime.box_boolean)),
            Ty::Any | Ty::Undefined => {}
            other => {
                let tag = match other {
                    Ty::String => TAG_STRING,
                    Ty::Array(_) => TAG_ARRAY,
                    Ty::Func(_) => TAG_FUNCTION,
                    Ty::Null => TAG_NULL,
                    Ty::Class(_) | Ty::Interface(_) => TAG_OBJECT,
                    _ => return Err(CompileError::internal(format!("boxing {}", other))),
                };
                self.insns.push(Instruction::I32Const(tag));
                self.insns.push(Instruction::Call(self.runtime.box_ref));
            }
        }
        Ok(())
    }

    fn emit_unbox(&mut self, to: &Ty) -> CompileResult<()> {
        self.check_any("unboxing from any")?;
        match to {
            Ty::Number => self.insns.push(Instruction::Call(self.runtime.unbox_number)),
            Ty::Boolean => self
                .insns
                .push(Instruction::Call(self.runtime.unbox_boolean)),
            Ty::Any | Ty::Undefined => {}
            other => {
                let tag = match other {
                    Ty::String => TAG_STRING,
                    Ty::Array(_) => TAG_ARRAY,
                    Ty::Func(_) => TAG_FUNCTION,
                    Ty::Null => TAG_NULL,
                    Ty::Class(_) | Ty::Interface(_) => TAG_OBJECT,
                    _ => return Err(CompileError::internal(format!("unboxing to {}", other))),
                };
                self.insns.push(Instruction::I32Const(tag));
                self.insns.push(Instruction::Call(self.runtime.unbox_ref));
                match self.types.valtype(other, self.module)? {
                    ValType::Ref(rt) => self
                        .insns
                        .push(Instruction::RefCastNullable(rt.heap_type)),
                    vt => {
                        return Err(CompileError::internal(format!(
                            "unboxed reference of {:?}",
                            vt
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_ref_cast(&mut self, from: &Ty, to: &Ty) -> CompileResult<()> {
        match (from, to) {
            (Ty::Interface(_), Ty::Class(c)) => {
                let class_idx = self.types.class(*c)?;
                self.insns.push(Instruction::StructGet {
                    struct_type_index: self.types.iface_idx,
                    field_index: 2,
                });
                self.insns
                    .push(Instruction::RefCastNullable(HeapType::Concrete(class_idx)));
            }
            (Ty::Class(_), Ty::Class(c)) => {
                let class_idx = self.types.class(*c)?;
                self.insns
                    .push(Instruction::RefCastNullable(HeapType::Concrete(class_idx)));
            }
            (f, t) => {
                return Err(CompileError::internal(format!(
                    "reference cast from {} to {}",
                    f, t
                )))
            }
        }
        Ok(())
    }
}

/// Capture slots of `func` in closure-slot order, each with the
/// parameter slot it mirrors (when the capture is a parameter).
fn capture_slots(module: &Module, func: ScopeId) -> CompileResult<Vec<(Ty, Option<u32>)>> {
    let data = module
        .scope(func)
        .func()
        .ok_or_else(|| CompileError::internal("capture slots of non-function scope"))?;
    let n = crate::sema::capture::capture_count(module, func) as usize;
    let mut slots: Vec<Option<(Ty, Option<u32>)>> = vec![None; n];
    for p in &data.params {
        if let Some(cs) = p.closure_slot {
            slots[cs as usize] = Some((p.ty.clone(), Some(p.slot)));
        }
    }
    let mut stack = vec![func];
    while let Some(s) = stack.pop() {
        if s != func && module.scope(s).is_function() {
            continue;
        }
        for v in &module.scope(s).variables {
            if let Some(cs) = v.closure_slot {
                slots[cs as usize] = Some((v.ty.clone(), None));
            }
        }
        stack.extend(module.scope(s).children.iter().copied());
    }
    slots
        .into_iter()
        .map(|s| s.ok_or_else(|| CompileError::internal("unassigned closure slot")))
        .collect()
}

/// Declared type of an interface member used through field syntax.
fn iface_field_ty(module: &Module, iface: ClassId, name: &str) -> CompileResult<Ty> {
    let def = module.classes.get(iface);
    if let Some(f) = def.fields.iter().find(|f| f.name == name) {
        return Ok(f.ty.clone());
    }
    if let Some(m) = def
        .methods
        .iter()
        .find(|m| m.name == name && m.kind == crate::types::MethodKind::Getter)
    {
        return Ok(m.ret.clone());
    }
    Err(CompileError::UnresolvedType(format!(
        "no member {} on interface {}",
        name, def.name
    )))
}
