//! Pre-lowering analysis over the scope tree.
//!
//! Two concerns, both run before any code is generated:
//!
//! * capture marking: a variable referenced from a function nested
//!   below its owner is flagged `captured` and given a closure slot in
//!   declaration order, so every later consumer agrees on context
//!   layout;
//! * return-type inference: functions declared without an annotation
//!   take the type of their first `return` statement.

use tracing::debug;

use crate::error::{CompileError, CompileResult};
use crate::ids::ScopeId;
use crate::sema::ast::{AssignTarget, Binding, Expr, ExprKind, Stmt};
use crate::sema::scope::Module;
use crate::types::Ty;

/// Run all pre-lowering analyses.
pub fn analyze(module: &mut Module) -> CompileResult<()> {
    mark_captures(module);
    infer_return_types(module)?;
    Ok(())
}

/// Whether `func` owns at least one captured variable and therefore
/// allocates its own context.
pub fn has_captures(module: &Module, func: ScopeId) -> bool {
    let Some(data) = module.scope(func).func() else {
        return false;
    };
    if data.params.iter().any(|p| p.captured) {
        return true;
    }
    let mut stack = vec![func];
    while let Some(s) = stack.pop() {
        if s != func && module.scope(s).is_function() {
            continue;
        }
        if module.scope(s).variables.iter().any(|v| v.captured) {
            return true;
        }
        stack.extend(module.scope(s).children.iter().copied());
    }
    false
}

/// Total number of capture slots in `func`'s context.
pub fn capture_count(module: &Module, func: ScopeId) -> u32 {
    let Some(data) = module.scope(func).func() else {
        return 0;
    };
    let mut n = data.params.iter().filter(|p| p.captured).count() as u32;
    let mut stack = vec![func];
    while let Some(s) = stack.pop() {
        if s != func && module.scope(s).is_function() {
            continue;
        }
        n += module.scope(s).variables.iter().filter(|v| v.captured).count() as u32;
        stack.extend(module.scope(s).children.iter().copied());
    }
    n
}

/// The function whose scope directly encloses `func`, skipping block
/// scopes.
pub fn parent_function(module: &Module, func: ScopeId) -> Option<ScopeId> {
    let parent = module.scope(func).parent?;
    module.owning_function(parent)
}

/// The nearest ancestor-or-self of `func` that allocates a context.
/// This is the function whose context is "current" inside `func`'s
/// body (functions without captures pass their incoming context
/// through unchanged).
pub fn ctx_owner(module: &Module, func: ScopeId) -> Option<ScopeId> {
    let mut cur = Some(func);
    while let Some(f) = cur {
        if has_captures(module, f) {
            return Some(f);
        }
        cur = parent_function(module, f);
    }
    None
}

/// Number of parent links to follow from the context current inside
/// `use_func` to reach `owner`'s context. `owner` must allocate a
/// context and enclose (or be) `use_func`.
pub fn ctx_depth(module: &Module, use_func: ScopeId, owner: ScopeId) -> u32 {
    let mut depth = 0u32;
    let mut cur = Some(use_func);
    while let Some(f) = cur {
        if has_captures(module, f) {
            if f == owner {
                return depth;
            }
            depth += 1;
        }
        cur = parent_function(module, f);
    }
    panic!("context owner {} does not enclose {}", owner, use_func);
}

/// Walk every statement of every scope and flag variables referenced
/// from a function other than their owner.
fn mark_captures(module: &mut Module) {
    let mut captured: Vec<Binding> = Vec::new();
    for id in module.scopes.indices() {
        let use_func = module.owning_function(id);
        let stmts = module.scope(id).stmts.clone();
        for stmt in &stmts {
            visit_stmt(stmt, &mut |binding| {
                let owner = module.binding_function(binding);
                // Globals live in module globals, never in a context.
                if owner.is_some() && owner != use_func {
                    captured.push(binding);
                }
            });
        }
    }
    for binding in captured {
        let var = module.binding_var_mut(binding);
        if !var.captured {
            var.captured = true;
            debug!(name = %var.name, "captured variable");
        }
    }
    assign_closure_slots(module);
}

/// Number captured variables per function in declaration order,
/// parameters first. Context layout is a function of this ordering.
fn assign_closure_slots(module: &mut Module) {
    for func in module.function_scopes() {
        let mut next = 0u32;
        let data = module
            .scope_mut(func)
            .func_mut()
            .expect("function_scopes returned non-function");
        for p in &mut data.params {
            if p.captured {
                p.closure_slot = Some(next);
                next += 1;
            }
        }
        let mut stack = vec![func];
        while let Some(s) = stack.pop() {
            if s != func && module.scope(s).is_function() {
                continue;
            }
            for i in 0..module.scope(s).variables.len() {
                let var = &mut module.scope_mut(s).variables[i];
                if var.captured && var.closure_slot.is_none() {
                    var.closure_slot = Some(next);
                    next += 1;
                }
            }
            for &c in module.scope(s).children.iter().rev() {
                stack.push(c);
            }
        }
    }
}

/// Fill in `ret` for functions marked `infer_ret` from the first
/// return statement in their body. Functions whose returns disagree
/// are rejected.
fn infer_return_types(module: &mut Module) -> CompileResult<()> {
    for func in module.function_scopes() {
        if !module.scope(func).func().map(|f| f.infer_ret).unwrap_or(false) {
            continue;
        }
        let mut found: Option<Ty> = None;
        collect_returns(module, func, func, &mut |expr| {
            if found.is_none() {
                found = Some(expr.map(|e| e.ty.clone()).unwrap_or(Ty::Void));
            }
        });
        let inferred = found.unwrap_or(Ty::Void);
        let name = module.scope(func).func().map(|f| f.mangled_name.clone());
        let mut mismatch = false;
        collect_returns(module, func, func, &mut |expr| {
            let ty = expr.map(|e| e.ty.clone()).unwrap_or(Ty::Void);
            if ty != inferred {
                mismatch = true;
            }
        });
        if mismatch {
            return Err(CompileError::TypeMismatch(format!(
                "function {} has returns of differing types",
                name.unwrap_or_default()
            )));
        }
        let data = module.scope_mut(func).func_mut().expect("non-function");
        data.ret = inferred;
        data.infer_ret = false;
    }
    Ok(())
}

fn collect_returns(
    module: &Module,
    func: ScopeId,
    scope: ScopeId,
    f: &mut impl FnMut(Option<&Expr>),
) {
    if scope != func && module.scope(scope).is_function() {
        return;
    }
    for stmt in &module.scope(scope).stmts {
        if let Stmt::Return(e) = stmt {
            f(e.as_ref());
        }
    }
    for &c in &module.scope(scope).children {
        collect_returns(module, func, c, f);
    }
}

fn visit_stmt(stmt: &Stmt, f: &mut impl FnMut(Binding)) {
    match stmt {
        Stmt::Expr(e) => visit_expr(e, f),
        Stmt::VarDecl { init, .. } => {
            if let Some(e) = init {
                visit_expr(e, f);
            }
        }
        Stmt::Assign { target, value } => {
            match target {
                AssignTarget::Var(b) => f(*b),
                AssignTarget::Field { base, .. } => visit_expr(base, f),
                AssignTarget::Index { base, index } => {
                    visit_expr(base, f);
                    visit_expr(index, f);
                }
            }
            visit_expr(value, f);
        }
        Stmt::Return(e) => {
            if let Some(e) = e {
                visit_expr(e, f);
            }
        }
        Stmt::If { cond, .. } => visit_expr(cond, f),
        Stmt::While { cond, .. } | Stmt::DoWhile { cond, .. } => visit_expr(cond, f),
        Stmt::For {
            init, cond, incr, ..
        } => {
            if let Some(s) = init {
                visit_stmt(s, f);
            }
            if let Some(e) = cond {
                visit_expr(e, f);
            }
            if let Some(s) = incr {
                visit_stmt(s, f);
            }
        }
        Stmt::Switch { scrutinee, cases } => {
            visit_expr(scrutinee, f);
            for c in cases {
                if let Some(v) = &c.value {
                    visit_expr(v, f);
                }
            }
        }
        Stmt::Break { .. } | Stmt::Continue { .. } => {}
        Stmt::Block(_) | Stmt::FuncDecl(_) | Stmt::Empty => {}
    }
}

fn visit_expr(expr: &Expr, f: &mut impl FnMut(Binding)) {
    match &expr.kind {
        ExprKind::Var(b) => f(*b),
        ExprKind::Binary { lhs, rhs, .. } => {
            visit_expr(lhs, f);
            visit_expr(rhs, f);
        }
        ExprKind::Unary { operand, .. } => visit_expr(operand, f),
        ExprKind::CallDirect { args, .. } | ExprKind::HostCall { args, .. } => {
            for a in args {
                visit_expr(a, f);
            }
        }
        ExprKind::CallValue { callee, args } => {
            visit_expr(callee, f);
            for a in args {
                visit_expr(a, f);
            }
        }
        ExprKind::MethodCall { base, args, .. } => {
            visit_expr(base, f);
            for a in args {
                visit_expr(a, f);
            }
        }
        ExprKind::Field { base, .. } => visit_expr(base, f),
        ExprKind::Index { base, index } => {
            visit_expr(base, f);
            visit_expr(index, f);
        }
        ExprKind::ArrayLit { elems } => {
            for e in elems {
                visit_expr(e, f);
            }
        }
        ExprKind::New { args, .. } => {
            for a in args {
                visit_expr(a, f);
            }
        }
        ExprKind::Cast { expr, .. } | ExprKind::TypeOf(expr) => visit_expr(expr, f),
        ExprKind::NumberLit(_)
        | ExprKind::StringLit(_)
        | ExprKind::BoolLit(_)
        | ExprKind::NullLit
        | ExprKind::UndefinedLit
        | ExprKind::This
        | ExprKind::FuncRef(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sema::scope::VarModifier;

    #[test]
    fn test_nested_reference_marks_capture() {
        let mut m = Module::new();
        let outer = m.add_function(m.global_scope(), "outer", &[], Ty::Number, false);
        let x = m.declare_var(outer, "x", Ty::Number, VarModifier::Let);
        let inner = m.add_function(outer, "inner", &[], Ty::Number, false);
        m.scope_mut(inner)
            .stmts
            .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));

        analyze(&mut m).unwrap();
        let var = m.binding_var(x);
        assert!(var.captured);
        assert_eq!(var.closure_slot, Some(0));
    }

    #[test]
    fn test_local_only_reference_is_not_capture() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::Number, false);
        let x = m.declare_var(f, "x", Ty::Number, VarModifier::Let);
        m.scope_mut(f)
            .stmts
            .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));

        analyze(&mut m).unwrap();
        assert!(!m.binding_var(x).captured);
        assert_eq!(m.binding_var(x).closure_slot, None);
    }

    #[test]
    fn test_closure_slots_follow_declaration_order() {
        let mut m = Module::new();
        let outer = m.add_function(
            m.global_scope(),
            "outer",
            &[("p", Ty::Number)],
            Ty::Void,
            false,
        );
        let a = m.declare_var(outer, "a", Ty::Number, VarModifier::Let);
        let b = m.declare_var(outer, "b", Ty::String, VarModifier::Let);
        let p = m.find_var(outer, "p").unwrap().0;
        let inner = m.add_function(outer, "inner", &[], Ty::Void, false);
        // Reference in reverse declaration order; slots must not care.
        m.scope_mut(inner).stmts.push(Stmt::Expr(Expr::var(b, Ty::String)));
        m.scope_mut(inner).stmts.push(Stmt::Expr(Expr::var(a, Ty::Number)));
        m.scope_mut(inner).stmts.push(Stmt::Expr(Expr::var(p, Ty::Number)));

        analyze(&mut m).unwrap();
        assert_eq!(m.binding_var(p).closure_slot, Some(0));
        assert_eq!(m.binding_var(a).closure_slot, Some(1));
        assert_eq!(m.binding_var(b).closure_slot, Some(2));
    }

    #[test]
    fn test_return_type_inference() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::Void, false);
        assert!(m.scope(f).func().unwrap().infer_ret);
        m.scope_mut(f)
            .stmts
            .push(Stmt::Return(Some(Expr::number(1.0))));

        analyze(&mut m).unwrap();
        assert_eq!(m.scope(f).func().unwrap().ret, Ty::Number);
        assert!(!m.scope(f).func().unwrap().infer_ret);
    }

    #[test]
    fn test_conflicting_returns_rejected() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::Void, false);
        m.scope_mut(f)
            .stmts
            .push(Stmt::Return(Some(Expr::number(1.0))));
        m.scope_mut(f)
            .stmts
            .push(Stmt::Return(Some(Expr::boolean(true))));

        assert!(matches!(
            analyze(&mut m),
            Err(CompileError::TypeMismatch(_))
        ));
    }
}
