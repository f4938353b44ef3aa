//! End-to-end execution tests: compile a module, instantiate it under
//! wasmtime with the `host` import surface, and check the values the
//! exports actually produce.

use anyhow::Result;
use wasmtime::{ArrayRef, Caller, Config, Engine, ExternRef, Instance, Linker, Rooted, Store};

use tess_core::sema::ast::{AssignTarget, BinOp, Expr, ExprKind, Stmt, SwitchCase, UnOp};
use tess_core::{Compiler, FieldDef, MethodKind, Module, Ty, VarModifier};

/// Host state shared with the instance; collects `log_string` output.
#[derive(Default)]
struct Host {
    logged: Vec<String>,
}

fn read_string(caller: &mut Caller<'_, Host>, s: Rooted<ArrayRef>) -> Result<String> {
    let len = s.len(&mut *caller)?;
    let mut bytes = Vec::with_capacity(len as usize);
    for i in 0..len {
        let v = s.get(&mut *caller, i)?;
        bytes.push(v.unwrap_i32() as u8);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Compile `module` and instantiate the result. The `host` functions
/// are linked against abstract heap types, which the concrete import
/// signatures subsume.
fn instantiate(module: &mut Module) -> Result<(Store<Host>, Instance)> {
    let out = Compiler::default().compile(module)?;

    let mut config = Config::new();
    config.wasm_function_references(true);
    config.wasm_gc(true);
    let engine = Engine::new(&config)?;
    let compiled = wasmtime::Module::from_binary(&engine, &out.wasm)?;

    let mut linker = Linker::<Host>::new(&engine);
    linker.func_wrap(
        "host",
        "log_string",
        |mut caller: Caller<'_, Host>, s: Option<Rooted<ArrayRef>>| -> Result<()> {
            let s = s.ok_or_else(|| anyhow::anyhow!("log_string called with null"))?;
            let text = read_string(&mut caller, s)?;
            caller.data_mut().logged.push(text);
            Ok(())
        },
    )?;
    linker.func_wrap(
        "host",
        "throw_type_error",
        |_: Caller<'_, Host>, tag: i32| -> Result<()> {
            anyhow::bail!("type error unboxing tag {}", tag)
        },
    )?;
    linker.func_wrap(
        "host",
        "extref_compare",
        |caller: Caller<'_, Host>,
         a: Option<Rooted<ExternRef>>,
         b: Option<Rooted<ExternRef>>|
         -> Result<i32> {
            Ok(match (a, b) {
                (None, None) => 1,
                (Some(a), Some(b)) => Rooted::ref_eq(&caller, &a, &b)? as i32,
                _ => 0,
            })
        },
    )?;

    let mut store = Store::new(&engine, Host::default());
    let instance = linker.instantiate(&mut store, &compiled)?;
    Ok((store, instance))
}

#[test]
fn switch_fallthrough_result() -> Result<()> {
    // pick(x) { switch (x) { case 1: r = 1; case 2: r = 2; break;
    // default: r = 3; } return r; }
    let mut m = Module::new();
    let f = m.add_function(
        m.global_scope(),
        "pick",
        &[("x", Ty::Number)],
        Ty::Number,
        true,
    );
    let x = m.find_var(f, "x").unwrap().0;
    let r = m.declare_var(f, "r", Ty::Number, VarModifier::Let);

    let case_block = |m: &mut Module, value: f64, brk: bool| {
        let b = m.add_block(f);
        m.scope_mut(b).stmts.push(Stmt::Assign {
            target: AssignTarget::Var(r),
            value: Expr::number(value),
        });
        if brk {
            m.scope_mut(b).stmts.push(Stmt::Break { label: None });
        }
        b
    };
    let c1 = case_block(&mut m, 1.0, false);
    let c2 = case_block(&mut m, 2.0, true);
    let cd = case_block(&mut m, 3.0, false);
    m.scope_mut(f).stmts.push(Stmt::Switch {
        scrutinee: Expr::var(x, Ty::Number),
        cases: vec![
            SwitchCase {
                value: Some(Expr::number(1.0)),
                body: c1,
            },
            SwitchCase {
                value: Some(Expr::number(2.0)),
                body: c2,
            },
            SwitchCase {
                value: None,
                body: cd,
            },
        ],
    });
    m.scope_mut(f)
        .stmts
        .push(Stmt::Return(Some(Expr::var(r, Ty::Number))));

    let (mut store, instance) = instantiate(&mut m)?;
    let pick = instance.get_typed_func::<f64, f64>(&mut store, "pick")?;
    // case 1 has no break, so it falls into case 2.
    assert_eq!(pick.call(&mut store, 1.0)?, 2.0);
    assert_eq!(pick.call(&mut store, 2.0)?, 2.0);
    assert_eq!(pick.call(&mut store, 7.0)?, 3.0);
    Ok(())
}

#[test]
fn any_round_trip_preserves_number() -> Result<()> {
    let mut m = Module::new();
    let f = m.add_function(
        m.global_scope(),
        "through",
        &[("x", Ty::Number)],
        Ty::Number,
        true,
    );
    let x = m.find_var(f, "x").unwrap().0;
    m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr::cast(
        Expr::cast(Expr::var(x, Ty::Number), Ty::Any),
        Ty::Number,
    ))));

    let (mut store, instance) = instantiate(&mut m)?;
    let through = instance.get_typed_func::<f64, f64>(&mut store, "through")?;
    assert_eq!(through.call(&mut store, 3.14)?, 3.14);
    assert_eq!(through.call(&mut store, -0.5)?, -0.5);
    Ok(())
}

#[test]
fn string_builtin_results() -> Result<()> {
    let mut m = Module::new();

    // joined_len() = ("ab" + "cd").length
    let f = m.add_function(m.global_scope(), "joined_len", &[], Ty::Number, true);
    m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr {
        kind: ExprKind::Field {
            base: Box::new(Expr::binary(
                BinOp::Add,
                Expr::string("ab"),
                Expr::string("cd"),
            )),
            field: "length".to_string(),
        },
        ty: Ty::Number,
    })));

    // joined_eq() = "ab" + "cd" == "abcd"
    let g = m.add_function(m.global_scope(), "joined_eq", &[], Ty::Boolean, true);
    m.scope_mut(g).stmts.push(Stmt::Return(Some(Expr::binary(
        BinOp::Eq,
        Expr::binary(BinOp::Add, Expr::string("ab"), Expr::string("cd")),
        Expr::string("abcd"),
    ))));

    // sliced_eq() = "abcd".slice(1, 3).charAt(0) == "b"
    let h = m.add_function(m.global_scope(), "sliced_eq", &[], Ty::Boolean, true);
    let sliced = Expr {
        kind: ExprKind::MethodCall {
            base: Box::new(Expr::string("abcd")),
            method: "slice".to_string(),
            args: vec![Expr::number(1.0), Expr::number(3.0)],
        },
        ty: Ty::String,
    };
    let ch = Expr {
        kind: ExprKind::MethodCall {
            base: Box::new(sliced),
            method: "charAt".to_string(),
            args: vec![Expr::number(0.0)],
        },
        ty: Ty::String,
    };
    m.scope_mut(h)
        .stmts
        .push(Stmt::Return(Some(Expr::binary(
            BinOp::Eq,
            ch,
            Expr::string("b"),
        ))));

    let (mut store, instance) = instantiate(&mut m)?;
    let joined_len = instance.get_typed_func::<(), f64>(&mut store, "joined_len")?;
    assert_eq!(joined_len.call(&mut store, ())?, 4.0);
    let joined_eq = instance.get_typed_func::<(), i32>(&mut store, "joined_eq")?;
    assert_eq!(joined_eq.call(&mut store, ())?, 1);
    let sliced_eq = instance.get_typed_func::<(), i32>(&mut store, "sliced_eq")?;
    assert_eq!(sliced_eq.call(&mut store, ())?, 1);
    Ok(())
}

#[test]
fn early_and_tail_returns_agree() -> Result<()> {
    // abs(x) { if (x < 0) { return -x; } return x; }
    let mut m = Module::new();
    let f = m.add_function(
        m.global_scope(),
        "abs",
        &[("x", Ty::Number)],
        Ty::Number,
        true,
    );
    let x = m.find_var(f, "x").unwrap().0;
    let neg = m.add_block(f);
    m.scope_mut(neg).stmts.push(Stmt::Return(Some(Expr::unary(
        UnOp::Neg,
        Expr::var(x, Ty::Number),
    ))));
    m.scope_mut(f).stmts.push(Stmt::If {
        cond: Expr::binary(BinOp::Lt, Expr::var(x, Ty::Number), Expr::number(0.0)),
        then_block: neg,
        else_block: None,
    });
    m.scope_mut(f)
        .stmts
        .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));

    let (mut store, instance) = instantiate(&mut m)?;
    let abs = instance.get_typed_func::<f64, f64>(&mut store, "abs")?;
    assert_eq!(abs.call(&mut store, -5.0)?, 5.0);
    assert_eq!(abs.call(&mut store, 3.0)?, 3.0);
    Ok(())
}

#[test]
fn constructed_object_method_result() -> Result<()> {
    // class Point { x; y; constructor(a, b) {...}; sum() { return
    // this.x + this.y; } }  make() = new Point(3, 4).sum()
    let mut m = Module::new();
    let (cs, cid) = m.add_class(m.global_scope(), "Point", None, false);
    for name in ["x", "y"] {
        m.classes.get_mut(cid).fields.push(FieldDef {
            name: name.to_string(),
            ty: Ty::Number,
            readonly: false,
        });
    }
    let this = Expr {
        kind: ExprKind::This,
        ty: Ty::Class(cid),
    };
    let ctor = m.add_method(
        cs,
        "constructor",
        MethodKind::Constructor,
        &[("a", Ty::Number), ("b", Ty::Number)],
        Ty::Void,
    );
    for (field, param) in [("x", "a"), ("y", "b")] {
        let p = m.find_var(ctor, param).unwrap().0;
        m.scope_mut(ctor).stmts.push(Stmt::Assign {
            target: AssignTarget::Field {
                base: this.clone(),
                field: field.to_string(),
            },
            value: Expr::var(p, Ty::Number),
        });
    }
    let sum = m.add_method(cs, "sum", MethodKind::Method, &[], Ty::Number);
    let field = |name: &str| Expr {
        kind: ExprKind::Field {
            base: Box::new(this.clone()),
            field: name.to_string(),
        },
        ty: Ty::Number,
    };
    m.scope_mut(sum)
        .stmts
        .push(Stmt::Return(Some(Expr::binary(
            BinOp::Add,
            field("x"),
            field("y"),
        ))));

    let f = m.add_function(m.global_scope(), "make", &[], Ty::Number, true);
    m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr {
        kind: ExprKind::MethodCall {
            base: Box::new(Expr {
                kind: ExprKind::New {
                    class: cid,
                    args: vec![Expr::number(3.0), Expr::number(4.0)],
                },
                ty: Ty::Class(cid),
            }),
            method: "sum".to_string(),
            args: vec![],
        },
        ty: Ty::Number,
    })));

    let (mut store, instance) = instantiate(&mut m)?;
    let make = instance.get_typed_func::<(), f64>(&mut store, "make")?;
    assert_eq!(make.call(&mut store, ())?, 7.0);
    Ok(())
}

#[test]
fn captured_value_read_through_context() -> Result<()> {
    // outer(v) { let x = v; function inner() { return x; } return
    // inner(); }
    let mut m = Module::new();
    let outer = m.add_function(
        m.global_scope(),
        "outer",
        &[("v", Ty::Number)],
        Ty::Number,
        true,
    );
    let v = m.find_var(outer, "v").unwrap().0;
    let x = m.declare_var(outer, "x", Ty::Number, VarModifier::Let);
    let inner = m.add_function(outer, "inner", &[], Ty::Number, false);
    m.scope_mut(inner)
        .stmts
        .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));
    m.scope_mut(outer).stmts.push(Stmt::VarDecl {
        scope: outer,
        index: 0,
        init: Some(Expr::var(v, Ty::Number)),
    });
    m.scope_mut(outer).stmts.push(Stmt::FuncDecl(inner));
    m.scope_mut(outer).stmts.push(Stmt::Return(Some(Expr {
        kind: ExprKind::CallDirect {
            func: inner,
            args: vec![],
        },
        ty: Ty::Number,
    })));

    let (mut store, instance) = instantiate(&mut m)?;
    let f = instance.get_typed_func::<f64, f64>(&mut store, "outer")?;
    assert_eq!(f.call(&mut store, 9.0)?, 9.0);
    Ok(())
}

#[test]
fn log_string_reaches_host() -> Result<()> {
    let mut m = Module::new();
    let f = m.add_function(m.global_scope(), "greet", &[], Ty::Void, true);
    m.scope_mut(f).stmts.push(Stmt::Expr(Expr {
        kind: ExprKind::HostCall {
            name: "log_string".to_string(),
            args: vec![Expr::string("hi")],
        },
        ty: Ty::Void,
    }));

    let (mut store, instance) = instantiate(&mut m)?;
    let greet = instance.get_typed_func::<(), ()>(&mut store, "greet")?;
    greet.call(&mut store, ())?;
    assert_eq!(store.data().logged, vec!["hi".to_string()]);
    Ok(())
}
