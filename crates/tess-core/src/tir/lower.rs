//! Lowering from the scope-annotated AST to flat TIR.
//!
//! One pass per function, expressions flattened in postorder with an
//! abstract operand stack checking that every op's inputs carry the
//! types its emitter will assume. Control flow becomes structured
//! markers; `break`/`continue`/`return` become branches to labels, so
//! every function body has a single fall-off exit.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{CompileError, CompileResult};
use crate::ids::{GlobalId, LabelId, ScopeId};
use crate::sema::ast::{AssignTarget, BinOp, Binding, Expr, ExprKind, Stmt, UnOp};
use crate::sema::capture::ctx_depth;
use crate::sema::scope::{Module, ScopeKind};
use crate::tir::func::{
    RuntimeOp, TirFunction, TirFunctionKind, TirGlobal, TirOp, TirOpKind, TirProgram,
};
use crate::tir::stack::OperandStack;
use crate::types::{FuncTy, MethodKind, Ty};

/// Lower a fully analyzed module. Synthesized temporaries (switch
/// scrutinees, return slots) are declared into the module as a side
/// effect.
pub fn lower(module: &mut Module) -> CompileResult<TirProgram> {
    let globals = collect_globals(module);

    let mut program = TirProgram {
        globals: globals.list.clone(),
        ..TirProgram::default()
    };

    // Global and namespace statements form the start routine.
    let mut start = Lowerer::new(module, None, &globals);
    let top_scopes: Vec<ScopeId> = start
        .module
        .scopes
        .indices()
        .filter(|&s| {
            matches!(
                start.module.scope(s).kind,
                ScopeKind::Global | ScopeKind::Namespace { .. }
            )
        })
        .collect();
    for s in top_scopes {
        start.lower_scope_stmts(s)?;
    }
    let start_fn = start.finish_start()?;
    program.func_index.insert(ScopeId::GLOBAL, 0);
    program.functions.push(start_fn);

    for func in module.function_scopes() {
        let idx = program.functions.len() as u32;
        let mut lowerer = Lowerer::new(module, Some(func), &globals);
        let f = lowerer.lower_function(func)?;
        debug!(name = %f.mangled_name, ops = f.ops.len(), "lowered function");
        program.func_index.insert(func, idx);
        program.functions.push(f);
    }
    Ok(program)
}

struct Globals {
    list: Vec<TirGlobal>,
    by_binding: HashMap<(ScopeId, u32), GlobalId>,
}

/// Variables of global and namespace scopes become module globals, in
/// declaration order.
fn collect_globals(module: &Module) -> Globals {
    let mut list = Vec::new();
    let mut by_binding = HashMap::new();
    for s in module.scopes.indices() {
        if !matches!(
            module.scope(s).kind,
            ScopeKind::Global | ScopeKind::Namespace { .. }
        ) {
            continue;
        }
        for (i, v) in module.scope(s).variables.iter().enumerate() {
            let id = GlobalId::new(list.len() as u32);
            by_binding.insert((s, i as u32), id);
            list.push(TirGlobal {
                id,
                name: v.name.clone(),
                ty: v.ty.clone(),
            });
        }
    }
    Globals { list, by_binding }
}

struct LoopFrame {
    name: Option<String>,
    exit: LabelId,
    /// `None` for switch frames, which `continue` skips over.
    cont: Option<LabelId>,
}

struct Lowerer<'a> {
    module: &'a mut Module,
    globals: &'a Globals,
    /// `None` while lowering the start routine.
    func: Option<ScopeId>,
    ops: Vec<TirOp>,
    stack: OperandStack,
    next_label: u32,
    loops: Vec<LoopFrame>,
    exit_label: LabelId,
    ret_slot: Option<u32>,
    ret_ty: Ty,
}

impl<'a> Lowerer<'a> {
    fn new(module: &'a mut Module, func: Option<ScopeId>, globals: &'a Globals) -> Self {
        Self {
            module,
            globals,
            func,
            ops: Vec::new(),
            stack: OperandStack::new(),
            next_label: 0,
            loops: Vec::new(),
            exit_label: LabelId::new(0),
            ret_slot: None,
            ret_ty: Ty::Void,
        }
    }

    fn fresh_label(&mut self) -> LabelId {
        let l = LabelId::new(self.next_label);
        self.next_label += 1;
        l
    }

    fn emit(&mut self, kind: TirOpKind, ty: Ty) {
        self.ops.push(TirOp::new(kind, ty));
    }

    fn emit_effect(&mut self, kind: TirOpKind) {
        self.ops.push(TirOp::effect(kind));
    }

    fn lower_function(&mut self, func: ScopeId) -> CompileResult<TirFunction> {
        let data = self
            .module
            .scope(func)
            .func()
            .ok_or_else(|| CompileError::internal(format!("{} is not a function scope", func)))?
            .clone();
        self.ret_ty = data.ret.clone();
        self.exit_label = self.fresh_label();
        if !data.ret.is_void() {
            let binding = self.module.declare_temp(func, data.ret.clone());
            self.ret_slot = Some(self.module.binding_var(binding).slot);
        }

        self.emit_effect(TirOpKind::BlockStart(self.exit_label));
        self.lower_scope_stmts(func)?;
        self.emit_effect(TirOpKind::BlockEnd);
        if let Some(slot) = self.ret_slot {
            self.emit(TirOpKind::LocalGet(slot), data.ret.clone());
        }

        let kind = match data.method_kind {
            Some(MethodKind::Constructor) => TirFunctionKind::Constructor,
            Some(_) => TirFunctionKind::Method,
            None => TirFunctionKind::Normal,
        };
        let export_name = data.is_export.then(|| data.name.clone());
        Ok(TirFunction {
            kind,
            scope: Some(func),
            mangled_name: data.mangled_name,
            params: data.params.iter().map(|p| p.ty.clone()).collect(),
            ret: data.ret,
            var_types: self.collect_var_types(func, data.params.len() as u32),
            ret_slot: self.ret_slot,
            export_name,
            ops: std::mem::take(&mut self.ops),
        })
    }

    fn finish_start(&mut self) -> CompileResult<TirFunction> {
        self.stack.assert_empty()?;
        Ok(TirFunction {
            kind: TirFunctionKind::Start,
            scope: None,
            mangled_name: "_start".to_string(),
            params: Vec::new(),
            ret: Ty::Void,
            var_types: Vec::new(),
            ret_slot: None,
            export_name: None,
            ops: std::mem::take(&mut self.ops),
        })
    }

    /// Local slot types beyond the parameters, indexed by
    /// `slot - param_count`.
    fn collect_var_types(&self, func: ScopeId, param_count: u32) -> Vec<Ty> {
        let total = self
            .module
            .scope(func)
            .func()
            .map(|f| f.next_slot)
            .unwrap_or(param_count);
        let mut types = vec![Ty::Void; (total - param_count) as usize];
        let mut stack = vec![func];
        while let Some(s) = stack.pop() {
            if s != func && self.module.scope(s).is_function() {
                continue;
            }
            for v in &self.module.scope(s).variables {
                types[(v.slot - param_count) as usize] = v.ty.clone();
            }
            stack.extend(self.module.scope(s).children.iter().copied());
        }
        types
    }

    fn lower_scope_stmts(&mut self, scope: ScopeId) -> CompileResult<()> {
        let stmts = self.module.scope(scope).stmts.clone();
        for stmt in &stmts {
            self.lower_stmt(stmt)?;
            self.stack.assert_empty()?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Empty | Stmt::FuncDecl(_) => Ok(()),
            Stmt::Block(scope) => self.lower_scope_stmts(*scope),
            Stmt::Expr(e) => {
                let ty = self.lower_expr(e)?;
                if !ty.is_void() {
                    self.stack.pop()?;
                    self.emit_effect(TirOpKind::Drop);
                }
                Ok(())
            }
            Stmt::VarDecl { scope, index, init } => {
                let binding = Binding::Var {
                    scope: *scope,
                    index: *index,
                };
                if let Some(init) = init {
                    self.lower_expr(init)?;
                    self.store_binding(binding)?;
                }
                Ok(())
            }
            Stmt::Assign { target, value } => self.lower_assign(target, value),
            Stmt::Return(e) => self.lower_return(e.as_ref()),
            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                self.lower_condition(cond)?;
                self.stack.pop()?;
                self.emit_effect(TirOpKind::IfStart);
                self.lower_scope_stmts(*then_block)?;
                if let Some(else_block) = else_block {
                    self.emit_effect(TirOpKind::Else);
                    self.lower_scope_stmts(*else_block)?;
                }
                self.emit_effect(TirOpKind::IfEnd);
                Ok(())
            }
            Stmt::While { label, cond, body } => {
                let exit = self.fresh_label();
                let top = self.fresh_label();
                self.emit_effect(TirOpKind::BlockStart(exit));
                self.emit_effect(TirOpKind::LoopStart(top));
                self.lower_condition(cond)?;
                self.stack.pop()?;
                self.emit(TirOpKind::Unary(UnOp::Not), Ty::Boolean);
                self.emit_effect(TirOpKind::BrIf(exit));
                self.loops.push(LoopFrame {
                    name: label.clone(),
                    exit,
                    cont: Some(top),
                });
                self.lower_scope_stmts(*body)?;
                self.loops.pop();
                self.emit_effect(TirOpKind::Br(top));
                self.emit_effect(TirOpKind::LoopEnd);
                self.emit_effect(TirOpKind::BlockEnd);
                Ok(())
            }
            Stmt::DoWhile { label, body, cond } => {
                let exit = self.fresh_label();
                let top = self.fresh_label();
                let cont = self.fresh_label();
                self.emit_effect(TirOpKind::BlockStart(exit));
                self.emit_effect(TirOpKind::LoopStart(top));
                self.emit_effect(TirOpKind::BlockStart(cont));
                self.loops.push(LoopFrame {
                    name: label.clone(),
                    exit,
                    cont: Some(cont),
                });
                self.lower_scope_stmts(*body)?;
                self.loops.pop();
                self.emit_effect(TirOpKind::BlockEnd);
                self.lower_condition(cond)?;
                self.stack.pop()?;
                self.emit_effect(TirOpKind::BrIf(top));
                self.emit_effect(TirOpKind::LoopEnd);
                self.emit_effect(TirOpKind::BlockEnd);
                Ok(())
            }
            Stmt::For {
                label,
                init,
                cond,
                incr,
                body,
            } => {
                if let Some(init) = init {
                    self.lower_stmt(init)?;
                    self.stack.assert_empty()?;
                }
                let exit = self.fresh_label();
                let top = self.fresh_label();
                let cont = self.fresh_label();
                self.emit_effect(TirOpKind::BlockStart(exit));
                self.emit_effect(TirOpKind::LoopStart(top));
                if let Some(cond) = cond {
                    self.lower_condition(cond)?;
                    self.stack.pop()?;
                    self.emit(TirOpKind::Unary(UnOp::Not), Ty::Boolean);
                    self.emit_effect(TirOpKind::BrIf(exit));
                }
                self.emit_effect(TirOpKind::BlockStart(cont));
                self.loops.push(LoopFrame {
                    name: label.clone(),
                    exit,
                    cont: Some(cont),
                });
                self.lower_scope_stmts(*body)?;
                self.loops.pop();
                self.emit_effect(TirOpKind::BlockEnd);
                if let Some(incr) = incr {
                    self.lower_stmt(incr)?;
                    self.stack.assert_empty()?;
                }
                self.emit_effect(TirOpKind::Br(top));
                self.emit_effect(TirOpKind::LoopEnd);
                self.emit_effect(TirOpKind::BlockEnd);
                Ok(())
            }
            Stmt::Switch { scrutinee, cases } => self.lower_switch(scrutinee, cases),
            Stmt::Break { label } => {
                let target = self.break_target(label.as_deref())?;
                self.emit_effect(TirOpKind::Br(target));
                Ok(())
            }
            Stmt::Continue { label } => {
                let target = self.continue_target(label.as_deref())?;
                self.emit_effect(TirOpKind::Br(target));
                Ok(())
            }
        }
    }

    fn lower_return(&mut self, e: Option<&Expr>) -> CompileResult<()> {
        if let Some(e) = e {
            let ty = self.lower_expr(e)?;
            if ty != self.ret_ty {
                return Err(CompileError::TypeMismatch(format!(
                    "return of {} from function returning {}",
                    ty, self.ret_ty
                )));
            }
            self.stack.pop()?;
            let slot = self
                .ret_slot
                .ok_or_else(|| CompileError::internal("value return without return slot"))?;
            self.emit_effect(TirOpKind::LocalSet(slot));
        } else if !self.ret_ty.is_void() {
            return Err(CompileError::TypeMismatch(format!(
                "bare return from function returning {}",
                self.ret_ty
            )));
        }
        self.emit_effect(TirOpKind::Br(self.exit_label));
        Ok(())
    }

    /// Nested labeled blocks; each case body falls through into the
    /// next. Scrutinee is evaluated once into a synthesized slot.
    fn lower_switch(&mut self, scrutinee: &Expr, cases: &[crate::sema::ast::SwitchCase]) -> CompileResult<()> {
        let scrut_ty = self.lower_expr(scrutinee)?;
        self.stack.pop()?;
        let scrut_slot = match self.func {
            Some(f) => {
                let b = self.module.declare_temp(f, scrut_ty.clone());
                self.module.binding_var(b).slot
            }
            None => {
                return Err(CompileError::Unsupported(
                    "switch at module top level".to_string(),
                ))
            }
        };
        self.emit_effect(TirOpKind::LocalSet(scrut_slot));

        let exit = self.fresh_label();
        let case_labels: Vec<LabelId> = cases.iter().map(|_| self.fresh_label()).collect();

        self.emit_effect(TirOpKind::BlockStart(exit));
        for &l in case_labels.iter().rev() {
            self.emit_effect(TirOpKind::BlockStart(l));
        }

        // Compare chain, then jump to the default clause (or straight
        // out) when nothing matched.
        let mut default = None;
        for (i, case) in cases.iter().enumerate() {
            match &case.value {
                Some(v) => {
                    self.emit(TirOpKind::LocalGet(scrut_slot), scrut_ty.clone());
                    self.stack.push(scrut_ty.clone());
                    let vty = self.lower_expr(v)?;
                    if vty != scrut_ty {
                        return Err(CompileError::TypeMismatch(format!(
                            "switch case of {} against scrutinee of {}",
                            vty, scrut_ty
                        )));
                    }
                    self.lower_eq(&scrut_ty)?;
                    self.stack.pop()?;
                    self.emit_effect(TirOpKind::BrIf(case_labels[i]));
                }
                None => default = Some(case_labels[i]),
            }
        }
        self.emit_effect(TirOpKind::Br(default.unwrap_or(exit)));

        self.loops.push(LoopFrame {
            name: None,
            exit,
            cont: None,
        });
        for case in cases {
            self.emit_effect(TirOpKind::BlockEnd);
            self.lower_scope_stmts(case.body)?;
        }
        self.loops.pop();
        self.emit_effect(TirOpKind::BlockEnd);
        Ok(())
    }

    /// Equality over two already-pushed operands of type `ty`; leaves
    /// a boolean. Shared by `==` and switch dispatch.
    fn lower_eq(&mut self, ty: &Ty) -> CompileResult<()> {
        self.stack.pop_expect(ty)?;
        self.stack.pop_expect(ty)?;
        match ty {
            Ty::Number | Ty::Boolean => self.emit(
                TirOpKind::Binary {
                    op: BinOp::Eq,
                    operand: ty.clone(),
                },
                Ty::Boolean,
            ),
            Ty::String => self.emit(TirOpKind::CallRuntime(RuntimeOp::StringEq), Ty::Boolean),
            Ty::Class(_) | Ty::Array(_) | Ty::Null => self.emit(
                TirOpKind::Binary {
                    op: BinOp::Eq,
                    operand: ty.clone(),
                },
                Ty::Boolean,
            ),
            _ => {
                return Err(CompileError::Unsupported(format!(
                    "equality on values of type {}",
                    ty
                )))
            }
        }
        self.stack.push(Ty::Boolean);
        Ok(())
    }

    fn break_target(&self, label: Option<&str>) -> CompileResult<LabelId> {
        let frame = match label {
            Some(name) => self
                .loops
                .iter()
                .rev()
                .find(|f| f.name.as_deref() == Some(name)),
            None => self.loops.last(),
        };
        frame.map(|f| f.exit).ok_or_else(|| {
            CompileError::internal(format!(
                "break outside breakable construct (label {:?})",
                label
            ))
        })
    }

    fn continue_target(&self, label: Option<&str>) -> CompileResult<LabelId> {
        let frame = match label {
            Some(name) => self
                .loops
                .iter()
                .rev()
                .find(|f| f.name.as_deref() == Some(name) && f.cont.is_some()),
            None => self.loops.iter().rev().find(|f| f.cont.is_some()),
        };
        frame.and_then(|f| f.cont).ok_or_else(|| {
            CompileError::internal(format!("continue outside loop (label {:?})", label))
        })
    }

    fn lower_assign(&mut self, target: &AssignTarget, value: &Expr) -> CompileResult<()> {
        match target {
            AssignTarget::Var(binding) => {
                let expected = self.module.binding_var(*binding).ty.clone();
                let got = self.lower_expr(value)?;
                if got != expected {
                    return Err(CompileError::TypeMismatch(format!(
                        "assignment of {} to variable of {}",
                        got, expected
                    )));
                }
                self.store_binding(*binding)
            }
            AssignTarget::Field { base, field } => match base.ty.clone() {
                Ty::Class(cid) => {
                    let idx = self.module.classes.field_index(cid, field).ok_or_else(|| {
                        CompileError::UnresolvedType(format!(
                            "no field {} on {}",
                            field,
                            self.module.classes.get(cid).name
                        ))
                    })?;
                    let def = self.module.classes.flat_fields(cid)[idx].clone();
                    if def.readonly {
                        return Err(CompileError::TypeMismatch(format!(
                            "assignment to readonly field {}",
                            field
                        )));
                    }
                    self.lower_expr(base)?;
                    let got = self.lower_expr(value)?;
                    if got != def.ty {
                        return Err(CompileError::TypeMismatch(format!(
                            "assignment of {} to field of {}",
                            got, def.ty
                        )));
                    }
                    self.stack.pop()?;
                    self.stack.pop()?;
                    self.emit_effect(TirOpKind::StructSet {
                        class: cid,
                        field: idx as u32,
                    });
                    Ok(())
                }
                Ty::Interface(iid) => {
                    self.lower_expr(base)?;
                    self.lower_expr(value)?;
                    self.stack.pop()?;
                    self.stack.pop()?;
                    self.emit_effect(TirOpKind::InterfaceSet {
                        iface: iid,
                        field: field.clone(),
                    });
                    Ok(())
                }
                other => Err(CompileError::TypeMismatch(format!(
                    "field assignment on non-object type {}",
                    other
                ))),
            },
            AssignTarget::Index { base, index } => {
                let elem = match &base.ty {
                    Ty::Array(elem) => (**elem).clone(),
                    other => {
                        return Err(CompileError::TypeMismatch(format!(
                            "index assignment on non-array type {}",
                            other
                        )))
                    }
                };
                self.lower_expr(base)?;
                let ity = self.lower_expr(index)?;
                if ity != Ty::Number {
                    return Err(CompileError::TypeMismatch(
                        "array index must be a number".to_string(),
                    ));
                }
                let got = self.lower_expr(value)?;
                if got != elem {
                    return Err(CompileError::TypeMismatch(format!(
                        "assignment of {} to array of {}",
                        got, elem
                    )));
                }
                self.stack.pop()?;
                self.stack.pop()?;
                self.stack.pop()?;
                self.emit_effect(TirOpKind::ArraySet { elem });
                Ok(())
            }
        }
    }

    /// Pop the value on the abstract stack into a binding's home:
    /// local slot, context field, or module global.
    fn store_binding(&mut self, binding: Binding) -> CompileResult<()> {
        self.stack.pop()?;
        let var = self.module.binding_var(binding).clone();
        if var.captured {
            let owner = self
                .module
                .binding_function(binding)
                .ok_or_else(|| CompileError::internal("captured global variable"))?;
            let use_func = self
                .func
                .ok_or_else(|| CompileError::internal("context access in start routine"))?;
            self.emit_effect(TirOpKind::CtxSet {
                func: owner,
                depth: ctx_depth(self.module, use_func, owner),
                slot: var.closure_slot
                    .ok_or_else(|| CompileError::internal("captured variable without slot"))?,
            });
            return Ok(());
        }
        match self.module.binding_function(binding) {
            Some(_) => self.emit_effect(TirOpKind::LocalSet(var.slot)),
            None => {
                let (scope, index) = match binding {
                    Binding::Var { scope, index } => (scope, index),
                    Binding::Param { .. } => {
                        return Err(CompileError::internal("parameter binding without function"))
                    }
                };
                let gid = self.globals.by_binding[&(scope, index)];
                self.emit_effect(TirOpKind::GlobalSet(gid));
            }
        }
        Ok(())
    }

    fn load_binding(&mut self, binding: Binding) -> CompileResult<Ty> {
        let var = self.module.binding_var(binding).clone();
        if var.captured {
            let owner = self
                .module
                .binding_function(binding)
                .ok_or_else(|| CompileError::internal("captured global variable"))?;
            let use_func = self
                .func
                .ok_or_else(|| CompileError::internal("context access in start routine"))?;
            self.emit(
                TirOpKind::CtxGet {
                    func: owner,
                    depth: ctx_depth(self.module, use_func, owner),
                    slot: var.closure_slot
                        .ok_or_else(|| CompileError::internal("captured variable without slot"))?,
                },
                var.ty.clone(),
            );
        } else {
            match self.module.binding_function(binding) {
                Some(_) => self.emit(TirOpKind::LocalGet(var.slot), var.ty.clone()),
                None => {
                    let (scope, index) = match binding {
                        Binding::Var { scope, index } => (scope, index),
                        Binding::Param { .. } => {
                            return Err(CompileError::internal(
                                "parameter binding without function",
                            ))
                        }
                    };
                    let gid = self.globals.by_binding[&(scope, index)];
                    self.emit(TirOpKind::GlobalGet(gid), var.ty.clone());
                }
            }
        }
        self.stack.push(var.ty.clone());
        Ok(var.ty)
    }

    /// Lower an expression used as an i32 condition.
    fn lower_condition(&mut self, e: &Expr) -> CompileResult<()> {
        let ty = self.lower_expr(e)?;
        if ty != Ty::Boolean {
            self.stack.pop()?;
            self.emit(TirOpKind::TruthyTest { from: ty }, Ty::Boolean);
            self.stack.push(Ty::Boolean);
        }
        Ok(())
    }

    fn lower_expr(&mut self, e: &Expr) -> CompileResult<Ty> {
        match &e.kind {
            ExprKind::NumberLit(v) => {
                self.emit(TirOpKind::ConstNumber(*v), Ty::Number);
                self.stack.push(Ty::Number);
                Ok(Ty::Number)
            }
            ExprKind::StringLit(s) => {
                self.emit(TirOpKind::ConstString(s.clone()), Ty::String);
                self.stack.push(Ty::String);
                Ok(Ty::String)
            }
            ExprKind::BoolLit(v) => {
                self.emit(TirOpKind::ConstBool(*v), Ty::Boolean);
                self.stack.push(Ty::Boolean);
                Ok(Ty::Boolean)
            }
            ExprKind::NullLit => {
                self.emit(TirOpKind::ConstNull, e.ty.clone());
                self.stack.push(e.ty.clone());
                Ok(e.ty.clone())
            }
            ExprKind::UndefinedLit => {
                self.emit(TirOpKind::ConstUndefined, Ty::Any);
                self.stack.push(Ty::Any);
                Ok(Ty::Any)
            }
            ExprKind::Var(binding) => self.load_binding(*binding),
            ExprKind::This => {
                self.emit(TirOpKind::LocalGet(0), e.ty.clone());
                self.stack.push(e.ty.clone());
                Ok(e.ty.clone())
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs),
            ExprKind::Unary { op, operand } => match op {
                UnOp::Neg => {
                    let ty = self.lower_expr(operand)?;
                    self.stack.pop_expect(&Ty::Number)?;
                    if ty != Ty::Number {
                        return Err(CompileError::TypeMismatch(format!("negation of {}", ty)));
                    }
                    self.emit(TirOpKind::Unary(UnOp::Neg), Ty::Number);
                    self.stack.push(Ty::Number);
                    Ok(Ty::Number)
                }
                UnOp::Not => {
                    self.lower_condition(operand)?;
                    self.stack.pop()?;
                    self.emit(TirOpKind::Unary(UnOp::Not), Ty::Boolean);
                    self.stack.push(Ty::Boolean);
                    Ok(Ty::Boolean)
                }
            },
            ExprKind::CallDirect { func, args } => {
                let data = self
                    .module
                    .scope(*func)
                    .func()
                    .ok_or_else(|| {
                        CompileError::internal(format!("call target {} is not a function", func))
                    })?
                    .clone();
                if args.len() != data.params.len() {
                    return Err(CompileError::TypeMismatch(format!(
                        "call of {} with {} arguments, expected {}",
                        data.name,
                        args.len(),
                        data.params.len()
                    )));
                }
                for (arg, param) in args.iter().zip(data.params.iter()) {
                    let got = self.lower_expr(arg)?;
                    if got != param.ty {
                        return Err(CompileError::TypeMismatch(format!(
                            "argument of {} where {} expected",
                            got, param.ty
                        )));
                    }
                }
                for _ in args {
                    self.stack.pop()?;
                }
                self.emit(TirOpKind::CallDirect { func: *func }, data.ret.clone());
                if !data.ret.is_void() {
                    self.stack.push(data.ret.clone());
                }
                Ok(data.ret)
            }
            ExprKind::CallValue { callee, args } => {
                let sig = match self.lower_expr(callee)? {
                    Ty::Func(sig) => sig,
                    other => {
                        return Err(CompileError::TypeMismatch(format!(
                            "call of non-function value of type {}",
                            other
                        )))
                    }
                };
                if args.len() != sig.params.len() {
                    return Err(CompileError::TypeMismatch(format!(
                        "closure call with {} arguments, expected {}",
                        args.len(),
                        sig.params.len()
                    )));
                }
                for (arg, param) in args.iter().zip(sig.params.iter()) {
                    let got = self.lower_expr(arg)?;
                    if &got != param {
                        return Err(CompileError::TypeMismatch(format!(
                            "argument of {} where {} expected",
                            got, param
                        )));
                    }
                }
                for _ in args {
                    self.stack.pop()?;
                }
                self.stack.pop()?;
                let ret = sig.ret.clone();
                self.emit(TirOpKind::CallValue { sig }, ret.clone());
                if !ret.is_void() {
                    self.stack.push(ret.clone());
                }
                Ok(ret)
            }
            ExprKind::HostCall { name, args } => {
                let mut params = Vec::new();
                for arg in args {
                    params.push(self.lower_expr(arg)?);
                }
                for _ in args {
                    self.stack.pop()?;
                }
                let sig = Box::new(FuncTy {
                    params,
                    ret: e.ty.clone(),
                });
                self.emit(
                    TirOpKind::CallHost {
                        name: name.clone(),
                        sig,
                    },
                    e.ty.clone(),
                );
                if !e.ty.is_void() {
                    self.stack.push(e.ty.clone());
                }
                Ok(e.ty.clone())
            }
            ExprKind::MethodCall { base, method, args } => self.lower_method_call(base, method, args),
            ExprKind::Field { base, field } => self.lower_field(base, field),
            ExprKind::Index { base, index } => {
                let elem = match &base.ty {
                    Ty::Array(elem) => (**elem).clone(),
                    other => {
                        return Err(CompileError::TypeMismatch(format!(
                            "index into non-array type {}",
                            other
                        )))
                    }
                };
                self.lower_expr(base)?;
                let ity = self.lower_expr(index)?;
                if ity != Ty::Number {
                    return Err(CompileError::TypeMismatch(
                        "array index must be a number".to_string(),
                    ));
                }
                self.stack.pop()?;
                self.stack.pop()?;
                self.emit(TirOpKind::ArrayGet { elem: elem.clone() }, elem.clone());
                self.stack.push(elem.clone());
                Ok(elem)
            }
            ExprKind::ArrayLit { elems } => {
                let elem = match &e.ty {
                    Ty::Array(elem) => (**elem).clone(),
                    other => {
                        return Err(CompileError::internal(format!(
                            "array literal typed {}",
                            other
                        )))
                    }
                };
                for el in elems {
                    let got = self.lower_expr(el)?;
                    if got != elem {
                        return Err(CompileError::TypeMismatch(format!(
                            "array element of {} in array of {}",
                            got, elem
                        )));
                    }
                }
                for _ in elems {
                    self.stack.pop()?;
                }
                self.emit(
                    TirOpKind::ArrayLit {
                        elem: elem.clone(),
                        len: elems.len() as u32,
                    },
                    e.ty.clone(),
                );
                self.stack.push(e.ty.clone());
                Ok(e.ty.clone())
            }
            ExprKind::New { class, args } => {
                let ctor_params: Vec<Ty> = self
                    .module
                    .classes
                    .find_constructor(*class)
                    .map(|(_, _, m)| m.params.clone())
                    .unwrap_or_default();
                if args.len() != ctor_params.len() {
                    return Err(CompileError::TypeMismatch(format!(
                        "new {} with {} arguments, expected {}",
                        self.module.classes.get(*class).name,
                        args.len(),
                        ctor_params.len()
                    )));
                }
                for (arg, param) in args.iter().zip(ctor_params.iter()) {
                    let got = self.lower_expr(arg)?;
                    if &got != param {
                        return Err(CompileError::TypeMismatch(format!(
                            "constructor argument of {} where {} expected",
                            got, param
                        )));
                    }
                }
                for _ in args {
                    self.stack.pop()?;
                }
                let ty = Ty::Class(*class);
                self.emit(
                    TirOpKind::New {
                        class: *class,
                        argc: args.len() as u32,
                    },
                    ty.clone(),
                );
                self.stack.push(ty.clone());
                Ok(ty)
            }
            ExprKind::FuncRef(func) => {
                let data = self
                    .module
                    .scope(*func)
                    .func()
                    .ok_or_else(|| CompileError::internal("function reference to non-function"))?;
                let ty = Ty::func(
                    data.params.iter().map(|p| p.ty.clone()).collect(),
                    data.ret.clone(),
                );
                self.emit(TirOpKind::ClosureCreate { func: *func }, ty.clone());
                self.stack.push(ty.clone());
                Ok(ty)
            }
            ExprKind::Cast { expr, to } => self.lower_cast(expr, to),
            ExprKind::TypeOf(inner) => {
                if inner.ty.is_any() {
                    self.lower_expr(inner)?;
                    self.stack.pop()?;
                    self.emit(TirOpKind::TypeOf, Ty::String);
                } else {
                    // Statically known tag.
                    let tag = static_type_tag(&inner.ty);
                    self.emit(TirOpKind::ConstString(tag.to_string()), Ty::String);
                }
                self.stack.push(Ty::String);
                Ok(Ty::String)
            }
        }
    }

    fn lower_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> CompileResult<Ty> {
        // Short-circuit forms become a value-yielding if.
        if matches!(op, BinOp::And | BinOp::Or) {
            self.lower_condition(lhs)?;
            self.stack.pop()?;
            self.emit(TirOpKind::IfStart, Ty::Boolean);
            match op {
                BinOp::And => {
                    self.lower_condition(rhs)?;
                    self.stack.pop()?;
                    self.emit_effect(TirOpKind::Else);
                    self.emit(TirOpKind::ConstBool(false), Ty::Boolean);
                }
                _ => {
                    self.emit(TirOpKind::ConstBool(true), Ty::Boolean);
                    self.emit_effect(TirOpKind::Else);
                    self.lower_condition(rhs)?;
                    self.stack.pop()?;
                }
            }
            self.emit_effect(TirOpKind::IfEnd);
            self.stack.push(Ty::Boolean);
            return Ok(Ty::Boolean);
        }

        let lty = self.lower_expr(lhs)?;
        let rty = self.lower_expr(rhs)?;
        if lty != rty {
            return Err(CompileError::TypeMismatch(format!(
                "binary {:?} on mismatched operands {} and {}",
                op, lty, rty
            )));
        }
        match (&lty, op) {
            (Ty::Number, _) => {
                self.stack.pop()?;
                self.stack.pop()?;
                let result = match op {
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => Ty::Number,
                    _ => Ty::Boolean,
                };
                self.emit(
                    TirOpKind::Binary {
                        op,
                        operand: Ty::Number,
                    },
                    result.clone(),
                );
                self.stack.push(result.clone());
                Ok(result)
            }
            (Ty::Boolean, BinOp::Eq | BinOp::Ne) => {
                self.stack.pop()?;
                self.stack.pop()?;
                self.emit(
                    TirOpKind::Binary {
                        op,
                        operand: Ty::Boolean,
                    },
                    Ty::Boolean,
                );
                self.stack.push(Ty::Boolean);
                Ok(Ty::Boolean)
            }
            (Ty::String, BinOp::Add) => {
                self.stack.pop()?;
                self.stack.pop()?;
                self.emit(TirOpKind::CallRuntime(RuntimeOp::StringConcat), Ty::String);
                self.stack.push(Ty::String);
                Ok(Ty::String)
            }
            (Ty::String, BinOp::Eq) => {
                self.lower_eq(&Ty::String)?;
                Ok(Ty::Boolean)
            }
            (Ty::String, BinOp::Ne) => {
                self.lower_eq(&Ty::String)?;
                self.stack.pop()?;
                self.emit(TirOpKind::Unary(UnOp::Not), Ty::Boolean);
                self.stack.push(Ty::Boolean);
                Ok(Ty::Boolean)
            }
            (Ty::Class(_) | Ty::Array(_) | Ty::Null, BinOp::Eq | BinOp::Ne) => {
                self.stack.pop()?;
                self.stack.pop()?;
                self.emit(
                    TirOpKind::Binary {
                        op,
                        operand: lty.clone(),
                    },
                    Ty::Boolean,
                );
                self.stack.push(Ty::Boolean);
                Ok(Ty::Boolean)
            }
            (ty, op) => Err(CompileError::Unsupported(format!(
                "binary {:?} on operands of type {}",
                op, ty
            ))),
        }
    }

    fn lower_method_call(&mut self, base: &Expr, method: &str, args: &[Expr]) -> CompileResult<Ty> {
        match base.ty.clone() {
            Ty::Class(cid) => {
                let (owner, _, def) = self
                    .module
                    .classes
                    .find_method(cid, method, args.len())
                    .ok_or_else(|| {
                        CompileError::UnresolvedType(format!(
                            "no method {}/{} on {}",
                            method,
                            args.len(),
                            self.module.classes.get(cid).name
                        ))
                    })?;
                let def = def.clone();
                let target = def.scope.ok_or_else(|| {
                    CompileError::internal(format!("method {} has no body", method))
                })?;
                self.lower_expr(base)?;
                for (arg, param) in args.iter().zip(def.params.iter()) {
                    let got = self.lower_expr(arg)?;
                    if &got != param {
                        return Err(CompileError::TypeMismatch(format!(
                            "argument of {} where {} expected",
                            got, param
                        )));
                    }
                }
                for _ in 0..args.len() + 1 {
                    self.stack.pop()?;
                }
                self.emit(
                    TirOpKind::CallMethod {
                        class: owner,
                        method: target,
                    },
                    def.ret.clone(),
                );
                if !def.ret.is_void() {
                    self.stack.push(def.ret.clone());
                }
                Ok(def.ret)
            }
            Ty::Interface(iid) => {
                let def = self
                    .module
                    .classes
                    .find_method(iid, method, args.len())
                    .map(|(_, _, m)| m.clone())
                    .ok_or_else(|| {
                        CompileError::UnresolvedType(format!(
                            "no method {}/{} on interface {}",
                            method,
                            args.len(),
                            self.module.classes.get(iid).name
                        ))
                    })?;
                self.lower_expr(base)?;
                for (arg, param) in args.iter().zip(def.params.iter()) {
                    let got = self.lower_expr(arg)?;
                    if &got != param {
                        return Err(CompileError::TypeMismatch(format!(
                            "argument of {} where {} expected",
                            got, param
                        )));
                    }
                }
                for _ in 0..args.len() + 1 {
                    self.stack.pop()?;
                }
                let sig = Box::new(FuncTy {
                    params: def.params.clone(),
                    ret: def.ret.clone(),
                });
                self.emit(
                    TirOpKind::CallInterface {
                        iface: iid,
                        method: method.to_string(),
                        sig,
                    },
                    def.ret.clone(),
                );
                if !def.ret.is_void() {
                    self.stack.push(def.ret.clone());
                }
                Ok(def.ret)
            }
            Ty::String => {
                let (rt, params, ret) = match (method, args.len()) {
                    ("concat", 1) => (RuntimeOp::StringConcat, vec![Ty::String], Ty::String),
                    ("slice", 2) => (
                        RuntimeOp::StringSlice,
                        vec![Ty::Number, Ty::Number],
                        Ty::String,
                    ),
                    ("charAt", 1) => (RuntimeOp::StringCharAt, vec![Ty::Number], Ty::String),
                    _ => {
                        return Err(CompileError::Unsupported(format!(
                            "string method {}/{}",
                            method,
                            args.len()
                        )))
                    }
                };
                self.lower_expr(base)?;
                for (arg, param) in args.iter().zip(params.iter()) {
                    let got = self.lower_expr(arg)?;
                    if &got != param {
                        return Err(CompileError::TypeMismatch(format!(
                            "argument of {} where {} expected",
                            got, param
                        )));
                    }
                }
                for _ in 0..args.len() + 1 {
                    self.stack.pop()?;
                }
                self.emit(TirOpKind::CallRuntime(rt), ret.clone());
                self.stack.push(ret.clone());
                Ok(ret)
            }
            other => Err(CompileError::Unsupported(format!(
                "method call on value of type {}",
                other
            ))),
        }
    }

    fn lower_field(&mut self, base: &Expr, field: &str) -> CompileResult<Ty> {
        match base.ty.clone() {
            Ty::Class(cid) => {
                let idx = self.module.classes.field_index(cid, field).ok_or_else(|| {
                    CompileError::UnresolvedType(format!(
                        "no field {} on {}",
                        field,
                        self.module.classes.get(cid).name
                    ))
                })?;
                let ty = self.module.classes.flat_fields(cid)[idx].ty.clone();
                self.lower_expr(base)?;
                self.stack.pop()?;
                self.emit(
                    TirOpKind::StructGet {
                        class: cid,
                        field: idx as u32,
                    },
                    ty.clone(),
                );
                self.stack.push(ty.clone());
                Ok(ty)
            }
            Ty::Interface(iid) => {
                let ty = self
                    .module
                    .classes
                    .get(iid)
                    .fields
                    .iter()
                    .find(|f| f.name == field)
                    .map(|f| f.ty.clone())
                    .ok_or_else(|| {
                        CompileError::UnresolvedType(format!(
                            "no field {} on interface {}",
                            field,
                            self.module.classes.get(iid).name
                        ))
                    })?;
                self.lower_expr(base)?;
                self.stack.pop()?;
                self.emit(
                    TirOpKind::InterfaceGet {
                        iface: iid,
                        field: field.to_string(),
                    },
                    ty.clone(),
                );
                self.stack.push(ty.clone());
                Ok(ty)
            }
            Ty::String if field == "length" => {
                self.lower_expr(base)?;
                self.stack.pop()?;
                self.emit(TirOpKind::CallRuntime(RuntimeOp::StringLen), Ty::Number);
                self.stack.push(Ty::Number);
                Ok(Ty::Number)
            }
            Ty::Array(_) if field == "length" => {
                self.lower_expr(base)?;
                self.stack.pop()?;
                self.emit(TirOpKind::ArrayLen, Ty::Number);
                self.stack.push(Ty::Number);
                Ok(Ty::Number)
            }
            other => Err(CompileError::TypeMismatch(format!(
                "field access on value of type {}",
                other
            ))),
        }
    }

    fn lower_cast(&mut self, expr: &Expr, to: &Ty) -> CompileResult<Ty> {
        let from = self.lower_expr(expr)?;
        if &from == to {
            return Ok(from);
        }
        self.stack.pop()?;
        match (&from, to) {
            (f, Ty::Any) => self.emit(TirOpKind::BoxAny { from: f.clone() }, Ty::Any),
            (Ty::Any, t) => self.emit(TirOpKind::UnboxAny { to: t.clone() }, t.clone()),
            (Ty::Class(cid), Ty::Interface(iid)) => {
                if !self.module.classes.implements(*cid, *iid) {
                    return Err(CompileError::TypeMismatch(format!(
                        "{} does not implement {}",
                        self.module.classes.get(*cid).name,
                        self.module.classes.get(*iid).name
                    )));
                }
                self.emit(
                    TirOpKind::ToInterface {
                        iface: *iid,
                        class: *cid,
                    },
                    to.clone(),
                );
            }
            (Ty::Class(sub), Ty::Class(_))
                if crate::types::is_subtype(&Ty::Class(*sub), to, &self.module.classes) =>
            {
                // Upcast; representation already conforms.
            }
            (Ty::Class(_) | Ty::Interface(_), Ty::Class(_)) => self.emit(
                TirOpKind::RefCast {
                    from: from.clone(),
                    to: to.clone(),
                },
                to.clone(),
            ),
            (Ty::Null, t) if t.is_reference() => {
                // Null literal flows into any reference type as-is.
            }
            (Ty::Boolean, Ty::Number) => self.emit(TirOpKind::BoolToNumber, Ty::Number),
            (Ty::Number, Ty::Boolean) => self.emit(
                TirOpKind::TruthyTest {
                    from: Ty::Number,
                },
                Ty::Boolean,
            ),
            (f, t) => {
                return Err(CompileError::Unsupported(format!(
                    "cast from {} to {}",
                    f, t
                )))
            }
        }
        self.stack.push(to.clone());
        Ok(to.clone())
    }
}

/// Tag string for `typeof` over a statically typed value.
fn static_type_tag(ty: &Ty) -> &'static str {
    match ty {
        Ty::Number => "number",
        Ty::String => "string",
        Ty::Boolean => "boolean",
        Ty::Func(_) => "function",
        Ty::Undefined | Ty::Void => "undefined",
        Ty::Null | Ty::Class(_) | Ty::Interface(_) | Ty::Array(_) => "object",
        Ty::Any => unreachable!("dynamic typeof handled separately"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sema;
    use crate::sema::scope::VarModifier;

    fn lower_module(module: &mut Module) -> TirProgram {
        sema::analyze(module).unwrap();
        lower(module).unwrap()
    }

    #[test]
    fn test_return_lowers_to_single_exit() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[("x", Ty::Number)], Ty::Number, false);
        let x = m.find_var(f, "x").unwrap().0;
        m.scope_mut(f)
            .stmts
            .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));

        let prog = lower_module(&mut m);
        let tf = prog.function_of(f).unwrap();
        assert_eq!(tf.ret_slot, Some(1));
        // Body is wrapped in one exit block and every return becomes a
        // store plus branch to it.
        assert!(matches!(tf.ops.first().unwrap().kind, TirOpKind::BlockStart(_)));
        assert!(tf
            .ops
            .iter()
            .any(|op| matches!(op.kind, TirOpKind::LocalSet(1))));
        assert!(matches!(
            tf.ops.last().unwrap().kind,
            TirOpKind::LocalGet(1)
        ));
    }

    #[test]
    fn test_captured_variable_goes_through_context() {
        let mut m = Module::new();
        let outer = m.add_function(m.global_scope(), "outer", &[], Ty::Void, false);
        let x = m.declare_var(outer, "x", Ty::Number, VarModifier::Let);
        let inner = m.add_function(outer, "inner", &[], Ty::Number, false);
        m.scope_mut(inner)
            .stmts
            .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));
        m.scope_mut(outer).stmts.push(Stmt::FuncDecl(inner));

        let prog = lower_module(&mut m);
        let ti = prog.function_of(inner).unwrap();
        assert!(ti.ops.iter().any(|op| matches!(
            op.kind,
            TirOpKind::CtxGet {
                func,
                depth: 0,
                slot: 0
            } if func == outer
        )));
    }

    #[test]
    fn test_global_variable_access() {
        let mut m = Module::new();
        let g = m.declare_var(m.global_scope(), "counter", Ty::Number, VarModifier::Let);
        m.scope_mut(ScopeId::GLOBAL).stmts.push(Stmt::VarDecl {
            scope: ScopeId::GLOBAL,
            index: 0,
            init: Some(Expr::number(0.0)),
        });
        let f = m.add_function(m.global_scope(), "get", &[], Ty::Number, false);
        m.scope_mut(f)
            .stmts
            .push(Stmt::Return(Some(Expr::var(g, Ty::Number))));

        let prog = lower_module(&mut m);
        assert_eq!(prog.globals.len(), 1);
        assert_eq!(prog.globals[0].name, "counter");
        // Initializer runs in the start routine.
        let start = &prog.functions[0];
        assert!(start
            .ops
            .iter()
            .any(|op| matches!(op.kind, TirOpKind::GlobalSet(_))));
        let tf = prog.function_of(f).unwrap();
        assert!(tf
            .ops
            .iter()
            .any(|op| matches!(op.kind, TirOpKind::GlobalGet(_))));
    }

    #[test]
    fn test_while_shape() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::Void, false);
        let body = m.add_block(f);
        m.scope_mut(body).stmts.push(Stmt::Break { label: None });
        m.scope_mut(f).stmts.push(Stmt::While {
            label: None,
            cond: Expr::boolean(true),
            body,
        });

        let prog = lower_module(&mut m);
        let ops: Vec<_> = prog
            .function_of(f)
            .unwrap()
            .ops
            .iter()
            .map(|o| &o.kind)
            .collect();
        // block(exit) loop(top) cond !cond br_if(exit) [break: br(exit)]
        // br(top) end end
        let exit = match ops[1] {
            TirOpKind::BlockStart(l) => *l,
            other => panic!("expected block start, got {:?}", other),
        };
        assert!(matches!(ops[2], TirOpKind::LoopStart(_)));
        assert!(ops
            .iter()
            .any(|op| matches!(op, TirOpKind::BrIf(l) if *l == exit)));
        assert!(ops
            .iter()
            .any(|op| matches!(op, TirOpKind::Br(l) if *l == exit)));
    }

    #[test]
    fn test_switch_lowering_uses_nested_blocks() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[("x", Ty::Number)], Ty::Void, false);
        let x = m.find_var(f, "x").unwrap().0;
        let case_a = m.add_block(f);
        let case_b = m.add_block(f);
        m.scope_mut(case_b).stmts.push(Stmt::Break { label: None });
        m.scope_mut(f).stmts.push(Stmt::Switch {
            scrutinee: Expr::var(x, Ty::Number),
            cases: vec![
                crate::sema::ast::SwitchCase {
                    value: Some(Expr::number(1.0)),
                    body: case_a,
                },
                crate::sema::ast::SwitchCase {
                    value: None,
                    body: case_b,
                },
            ],
        });

        let prog = lower_module(&mut m);
        let tf = prog.function_of(f).unwrap();
        // Scrutinee stored once, then one block per case plus exit.
        let block_starts = tf
            .ops
            .iter()
            .filter(|op| matches!(op.kind, TirOpKind::BlockStart(_)))
            .count();
        assert_eq!(block_starts, 1 + 3); // function exit + exit + 2 cases
        assert!(tf
            .ops
            .iter()
            .any(|op| matches!(op.kind, TirOpKind::LocalSet(1))));
        // Synthesized scrutinee slot got a type.
        assert_eq!(tf.var_types, vec![Ty::Number]);
    }

    #[test]
    fn test_and_lowers_to_if() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::Boolean, false);
        m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr::binary(
            BinOp::And,
            Expr::boolean(true),
            Expr::boolean(false),
        ))));

        let prog = lower_module(&mut m);
        let tf = prog.function_of(f).unwrap();
        assert!(tf
            .ops
            .iter()
            .any(|op| matches!(op.kind, TirOpKind::IfStart) && op.ty == Ty::Boolean));
        assert!(tf.ops.iter().any(|op| matches!(op.kind, TirOpKind::Else)));
    }

    #[test]
    fn test_string_concat_routes_to_runtime() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::String, false);
        m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr::binary(
            BinOp::Add,
            Expr::string("a"),
            Expr::string("b"),
        ))));

        let prog = lower_module(&mut m);
        let tf = prog.function_of(f).unwrap();
        assert!(tf.ops.iter().any(|op| matches!(
            op.kind,
            TirOpKind::CallRuntime(RuntimeOp::StringConcat)
        )));
    }

    #[test]
    fn test_number_condition_gets_truthy_test() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[("x", Ty::Number)], Ty::Void, false);
        let x = m.find_var(f, "x").unwrap().0;
        let then_block = m.add_block(f);
        m.scope_mut(f).stmts.push(Stmt::If {
            cond: Expr::var(x, Ty::Number),
            then_block,
            else_block: None,
        });

        let prog = lower_module(&mut m);
        let tf = prog.function_of(f).unwrap();
        assert!(tf.ops.iter().any(|op| matches!(
            op.kind,
            TirOpKind::TruthyTest { from: Ty::Number }
        )));
    }

    #[test]
    fn test_typeof_on_static_type_is_constant() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::String, false);
        m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr {
            kind: ExprKind::TypeOf(Box::new(Expr::number(1.0))),
            ty: Ty::String,
        })));

        let prog = lower_module(&mut m);
        let tf = prog.function_of(f).unwrap();
        assert!(tf
            .ops
            .iter()
            .any(|op| matches!(&op.kind, TirOpKind::ConstString(s) if s == "number")));
        assert!(!tf.ops.iter().any(|op| matches!(op.kind, TirOpKind::TypeOf)));
    }

    #[test]
    fn test_mismatched_return_type_rejected() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::Number, false);
        m.scope_mut(f)
            .stmts
            .push(Stmt::Return(Some(Expr::string("nope"))));

        sema::analyze(&mut m).unwrap();
        assert!(matches!(
            lower(&mut m),
            Err(CompileError::TypeMismatch(_))
        ));
    }
}
