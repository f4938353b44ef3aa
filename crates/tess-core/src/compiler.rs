//! Main compiler driver.
//!
//! High-level API over the pipeline: capture analysis, return-type
//! inference, TIR lowering, wasm-GC emission, post-hoc validation.
//! The input is a fully typed `sema::Module`, built programmatically
//! or deserialized from JSON.

use tracing::{debug, info_span};

use crate::codegen;
use crate::error::{CompileError, CompileResult};
use crate::sema::{self, Module};
use crate::tir::{self, TirProgram};

/// Knobs surfaced by the CLI.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    /// 0 keeps debug names; higher levels drop them.
    pub opt_level: u8,
    /// Reject dynamic `any` values and the boxing runtime.
    pub no_any: bool,
    /// Reject interface values and dispatch.
    pub no_interface: bool,
    /// Reject host library calls (console output).
    pub no_stdlib: bool,
    /// Force the name section regardless of `opt_level`.
    pub debug_info: bool,
    /// Skip post-emission validation of the binary.
    pub no_validate: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            opt_level: 0,
            no_any: false,
            no_interface: false,
            no_stdlib: false,
            debug_info: false,
            no_validate: false,
        }
    }
}

/// Compilation output: the binary module plus whatever side artifacts
/// the options requested.
pub struct CompileOutput {
    pub wasm: Vec<u8>,
    /// JSON map of emitted functions, present under `--debug-info`.
    pub source_map: Option<String>,
    pub program: TirProgram,
}

/// Compiler instance. One per compilation unit; the module is consumed
/// mutably because lowering synthesizes temporaries into it.
pub struct Compiler {
    options: CompileOptions,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Run analyses and lowering only; useful for IR inspection.
    pub fn lower(&self, module: &mut Module) -> CompileResult<TirProgram> {
        let span = info_span!("lower");
        let _guard = span.enter();
        sema::analyze(module)?;
        tir::lower(module)
    }

    /// Full pipeline from a typed module to a validated binary.
    pub fn compile(&self, module: &mut Module) -> CompileResult<CompileOutput> {
        let program = self.lower(module)?;
        let span = info_span!("codegen");
        let _guard = span.enter();
        let wasm = codegen::generate(module, &program, &self.options)?;
        debug!(bytes = wasm.len(), "emitted module");
        drop(_guard);

        if !self.options.no_validate {
            validate(&wasm)?;
        }
        let source_map = if self.options.debug_info {
            Some(source_map(&program)?)
        } else {
            None
        };
        Ok(CompileOutput {
            wasm,
            source_map,
            program,
        })
    }
}

/// Map each emitted function to its index in the binary's function
/// space, so host-side tooling can resolve traps back to names.
fn source_map(program: &TirProgram) -> CompileResult<String> {
    #[derive(serde::Serialize)]
    struct Entry<'a> {
        index: u32,
        name: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        export: Option<&'a str>,
    }
    let entries: Vec<Entry> = program
        .functions
        .iter()
        .enumerate()
        .map(|(i, f)| Entry {
            index: codegen::wasm::USER_FUNC_BASE + i as u32,
            name: &f.mangled_name,
            export: f.export_name.as_deref(),
        })
        .collect();
    serde_json::to_string_pretty(&entries).map_err(|e| CompileError::Encoding(e.to_string()))
}

/// Validate an emitted binary with the reference validator.
pub fn validate(wasm: &[u8]) -> CompileResult<()> {
    wasmparser::Validator::new()
        .validate_all(wasm)
        .map(|_| ())
        .map_err(|e| CompileError::Validation(e.to_string()))
}

/// Render an emitted binary as the text format.
pub fn disassemble(wasm: &[u8]) -> CompileResult<String> {
    wasmprinter::print_bytes(wasm).map_err(|e| CompileError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ClassId;
    use crate::sema::ast::{AssignTarget, BinOp, Expr, ExprKind, Stmt, SwitchCase};
    use crate::sema::scope::VarModifier;
    use crate::types::{FieldDef, MethodDef, MethodKind, Ty};

    fn compile(m: &mut Module) -> CompileOutput {
        Compiler::default().compile(m).unwrap()
    }

    fn this(cid: ClassId) -> Expr {
        Expr {
            kind: ExprKind::This,
            ty: Ty::Class(cid),
        }
    }

    fn field(base: Expr, name: &str, ty: Ty) -> Expr {
        Expr {
            kind: ExprKind::Field {
                base: Box::new(base),
                field: name.to_string(),
            },
            ty,
        }
    }

    fn method_call(base: Expr, name: &str, args: Vec<Expr>, ty: Ty) -> Expr {
        Expr {
            kind: ExprKind::MethodCall {
                base: Box::new(base),
                method: name.to_string(),
                args,
            },
            ty,
        }
    }

    #[test]
    fn test_compile_validates_by_default() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "one", &[], Ty::Number, true);
        m.scope_mut(f)
            .stmts
            .push(Stmt::Return(Some(Expr::number(1.0))));

        let out = compile(&mut m);
        assert!(!out.wasm.is_empty());
        let text = disassemble(&out.wasm).unwrap();
        assert!(text.contains("(module"));
    }

    #[test]
    fn test_no_any_rejects_boxing() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "f", &[], Ty::Any, true);
        m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr::cast(
            Expr::number(1.0),
            Ty::Any,
        ))));

        let compiler = Compiler::new(CompileOptions {
            no_any: true,
            ..CompileOptions::default()
        });
        assert!(matches!(
            compiler.compile(&mut m),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn test_switch_with_fallthrough_compiles() {
        // switch (x) { case 1: r = 1; case 2: r = 2; break; default: r = 3; }
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

        m.scope_mut(f).stmts.push(Stmt::VarDecl {
            scope: f,
            index: 0,
            init: Some(Expr::number(0.0)),
        });
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

        compile(&mut m);
    }

    #[test]
    fn test_multiple_returns_converge() {
        let mut m = Module::new();
        let f = m.add_function(
            m.global_scope(),
            "abs",
            &[("x", Ty::Number)],
            Ty::Number,
            true,
        );
        let x = m.find_var(f, "x").unwrap().0;
        let then = m.add_block(f);
        m.scope_mut(then)
            .stmts
            .push(Stmt::Return(Some(Expr::unary(
                crate::sema::ast::UnOp::Neg,
                Expr::var(x, Ty::Number),
            ))));
        m.scope_mut(f).stmts.push(Stmt::If {
            cond: Expr::binary(BinOp::Lt, Expr::var(x, Ty::Number), Expr::number(0.0)),
            then_block: then,
            else_block: None,
        });
        m.scope_mut(f)
            .stmts
            .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));

        compile(&mut m);
    }

    fn point_module() -> Module {
        let mut m = Module::new();
        let (cs, cid) = m.add_class(m.global_scope(), "Point", None, false);
        m.classes.get_mut(cid).fields.push(FieldDef {
            name: "x".to_string(),
            ty: Ty::Number,
            readonly: false,
        });
        m.classes.get_mut(cid).fields.push(FieldDef {
            name: "y".to_string(),
            ty: Ty::Number,
            readonly: false,
        });

        let ctor = m.add_method(
            cs,
            "constructor",
            MethodKind::Constructor,
            &[("a", Ty::Number), ("b", Ty::Number)],
            Ty::Void,
        );
        let a = m.find_var(ctor, "a").unwrap().0;
        let b = m.find_var(ctor, "b").unwrap().0;
        m.scope_mut(ctor).stmts.push(Stmt::Assign {
            target: AssignTarget::Field {
                base: this(cid),
                field: "x".to_string(),
            },
            value: Expr::var(a, Ty::Number),
        });
        m.scope_mut(ctor).stmts.push(Stmt::Assign {
            target: AssignTarget::Field {
                base: this(cid),
                field: "y".to_string(),
            },
            value: Expr::var(b, Ty::Number),
        });

        let sum = m.add_method(cs, "sum", MethodKind::Method, &[], Ty::Number);
        m.scope_mut(sum)
            .stmts
            .push(Stmt::Return(Some(Expr::binary(
                BinOp::Add,
                field(this(cid), "x", Ty::Number),
                field(this(cid), "y", Ty::Number),
            ))));
        m
    }

    #[test]
    fn test_class_constructor_and_method() {
        let mut m = point_module();
        let cid = match crate::types::resolve("Point", m.global_scope(), &m).unwrap() {
            Ty::Class(id) => id,
            _ => unreachable!(),
        };
        let f = m.add_function(m.global_scope(), "make", &[], Ty::Number, true);
        let p = m.declare_var(f, "p", Ty::Class(cid), VarModifier::Const);
        m.scope_mut(f).stmts.push(Stmt::VarDecl {
            scope: f,
            index: 0,
            init: Some(Expr {
                kind: ExprKind::New {
                    class: cid,
                    args: vec![Expr::number(1.0), Expr::number(2.0)],
                },
                ty: Ty::Class(cid),
            }),
        });
        m.scope_mut(f).stmts.push(Stmt::Return(Some(method_call(
            Expr::var(p, Ty::Class(cid)),
            "sum",
            vec![],
            Ty::Number,
        ))));

        let out = compile(&mut m);
        let text = disassemble(&out.wasm).unwrap();
        assert!(text.contains("Point.sum"));
        assert!(text.contains("Point.constructor"));
    }

    #[test]
    fn test_subclass_uses_inherited_constructor() {
        let mut m = point_module();
        let base = match crate::types::resolve("Point", m.global_scope(), &m).unwrap() {
            Ty::Class(id) => id,
            _ => unreachable!(),
        };
        let (_, derived) = m.add_class(m.global_scope(), "Point3", Some(base), false);

        let f = m.add_function(m.global_scope(), "make", &[], Ty::Number, true);
        let p = m.declare_var(f, "p", Ty::Class(derived), VarModifier::Const);
        m.scope_mut(f).stmts.push(Stmt::VarDecl {
            scope: f,
            index: 0,
            init: Some(Expr {
                kind: ExprKind::New {
                    class: derived,
                    args: vec![Expr::number(1.0), Expr::number(2.0)],
                },
                ty: Ty::Class(derived),
            }),
        });
        m.scope_mut(f).stmts.push(Stmt::Return(Some(method_call(
            Expr::var(p, Ty::Class(derived)),
            "sum",
            vec![],
            Ty::Number,
        ))));

        compile(&mut m);
    }

    fn interface_module() -> Module {
        let mut m = Module::new();
        let (_, iid) = m.add_class(m.global_scope(), "Shape", None, true);
        m.classes.get_mut(iid).methods.push(MethodDef {
            name: "area".to_string(),
            kind: MethodKind::Method,
            params: vec![],
            ret: Ty::Number,
            scope: None,
        });

        let (cs, cid) = m.add_class(m.global_scope(), "Square", None, false);
        let area = m.add_method(cs, "area", MethodKind::Method, &[], Ty::Number);
        m.scope_mut(area)
            .stmts
            .push(Stmt::Return(Some(Expr::number(4.0))));

        let f = m.add_function(m.global_scope(), "measure", &[], Ty::Number, true);
        let s = m.declare_var(f, "s", Ty::Interface(iid), VarModifier::Const);
        m.scope_mut(f).stmts.push(Stmt::VarDecl {
            scope: f,
            index: 0,
            init: Some(Expr::cast(
                Expr {
                    kind: ExprKind::New {
                        class: cid,
                        args: vec![],
                    },
                    ty: Ty::Class(cid),
                },
                Ty::Interface(iid),
            )),
        });
        m.scope_mut(f).stmts.push(Stmt::Return(Some(method_call(
            Expr::var(s, Ty::Interface(iid)),
            "area",
            vec![],
            Ty::Number,
        ))));
        m
    }

    #[test]
    fn test_interface_call_goes_through_dispatcher() {
        let mut m = interface_module();
        let out = compile(&mut m);
        let text = disassemble(&out.wasm).unwrap();
        assert!(text.contains("Shape.area.dispatch"));
    }

    #[test]
    fn test_no_interface_rejects_dispatch() {
        let mut m = interface_module();
        let compiler = Compiler::new(CompileOptions {
            no_interface: true,
            ..CompileOptions::default()
        });
        assert!(matches!(
            compiler.compile(&mut m),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn test_boxing_round_trip_compiles() {
        let mut m = Module::new();
        let f = m.add_function(
            m.global_scope(),
            "through",
            &[("x", Ty::Number)],
            Ty::Number,
            true,
        );
        let x = m.find_var(f, "x").unwrap().0;
        let a = m.declare_var(f, "a", Ty::Any, VarModifier::Let);
        m.scope_mut(f).stmts.push(Stmt::VarDecl {
            scope: f,
            index: 0,
            init: Some(Expr::cast(Expr::var(x, Ty::Number), Ty::Any)),
        });
        m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr::cast(
            Expr::var(a, Ty::Any),
            Ty::Number,
        ))));

        let g = m.add_function(
            m.global_scope(),
            "flip",
            &[("b", Ty::Boolean)],
            Ty::Boolean,
            true,
        );
        let b = m.find_var(g, "b").unwrap().0;
        m.scope_mut(g).stmts.push(Stmt::Return(Some(Expr::cast(
            Expr::cast(Expr::var(b, Ty::Boolean), Ty::Any),
            Ty::Boolean,
        ))));

        compile(&mut m);
    }

    #[test]
    fn test_string_builtins_compile() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "strings", &[], Ty::Number, true);
        let s = m.declare_var(f, "s", Ty::String, VarModifier::Const);
        m.scope_mut(f).stmts.push(Stmt::VarDecl {
            scope: f,
            index: 0,
            init: Some(method_call(
                Expr::string("ab"),
                "concat",
                vec![Expr::string("cd")],
                Ty::String,
            )),
        });
        let sliced = method_call(
            Expr::var(s, Ty::String),
            "slice",
            vec![Expr::number(1.0), Expr::number(3.0)],
            Ty::String,
        );
        let ch = method_call(sliced, "charAt", vec![Expr::number(0.0)], Ty::String);
        m.scope_mut(f).stmts.push(Stmt::Expr(Expr::binary(
            BinOp::Eq,
            ch,
            Expr::var(s, Ty::String),
        )));
        m.scope_mut(f).stmts.push(Stmt::Return(Some(field(
            Expr::var(s, Ty::String),
            "length",
            Ty::Number,
        ))));

        compile(&mut m);
    }

    #[test]
    fn test_debug_info_emits_source_map() {
        let compiler = Compiler::new(CompileOptions {
            debug_info: true,
            ..CompileOptions::default()
        });
        let out = compiler.compile(&mut point_module()).unwrap();

        let map = out.source_map.as_deref().unwrap();
        let entries: serde_json::Value = serde_json::from_str(map).unwrap();
        let entries = entries.as_array().unwrap();
        // The start routine is the first user function, right after the
        // host imports and runtime helpers.
        assert_eq!(entries[0]["name"], "_start");
        assert_eq!(entries[0]["index"], 16);
        assert!(entries.iter().any(|e| e["name"] == "Point.sum"));

        assert!(compile(&mut point_module()).source_map.is_none());
    }

    #[test]
    fn test_no_stdlib_rejects_string_helpers() {
        let mut m = Module::new();
        let f = m.add_function(m.global_scope(), "join", &[], Ty::String, true);
        m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr::binary(
            BinOp::Add,
            Expr::string("a"),
            Expr::string("b"),
        ))));

        let compiler = Compiler::new(CompileOptions {
            no_stdlib: true,
            ..CompileOptions::default()
        });
        assert!(matches!(
            compiler.compile(&mut m),
            Err(CompileError::Unimplemented(_))
        ));
    }

    #[test]
    fn test_host_log_imported_and_gated() {
        let build = || {
            let mut m = Module::new();
            let f = m.add_function(m.global_scope(), "main", &[], Ty::Void, true);
            m.scope_mut(f).stmts.push(Stmt::Expr(Expr {
                kind: ExprKind::HostCall {
                    name: "log_string".to_string(),
                    args: vec![Expr::string("hi")],
                },
                ty: Ty::Void,
            }));
            m
        };

        let out = compile(&mut build());
        let text = disassemble(&out.wasm).unwrap();
        assert!(text.contains("(import \"host\" \"log_string\""));

        let compiler = Compiler::new(CompileOptions {
            no_stdlib: true,
            ..CompileOptions::default()
        });
        assert!(matches!(
            compiler.compile(&mut build()),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn test_capture_across_two_nesting_levels() {
        let mut m = Module::new();
        let outer = m.add_function(m.global_scope(), "outer", &[], Ty::Number, true);
        let x = m.declare_var(outer, "x", Ty::Number, VarModifier::Let);
        let mid = m.add_function(outer, "mid", &[], Ty::Number, false);
        let inner = m.add_function(mid, "inner", &[], Ty::Number, false);

        m.scope_mut(inner)
            .stmts
            .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));
        m.scope_mut(mid).stmts.push(Stmt::FuncDecl(inner));
        m.scope_mut(mid).stmts.push(Stmt::Return(Some(Expr {
            kind: ExprKind::CallDirect {
                func: inner,
                args: vec![],
            },
            ty: Ty::Number,
        })));
        m.scope_mut(outer).stmts.push(Stmt::VarDecl {
            scope: outer,
            index: 0,
            init: Some(Expr::number(10.0)),
        });
        m.scope_mut(outer).stmts.push(Stmt::FuncDecl(mid));
        m.scope_mut(outer).stmts.push(Stmt::Return(Some(Expr {
            kind: ExprKind::CallDirect {
                func: mid,
                args: vec![],
            },
            ty: Ty::Number,
        })));

        compile(&mut m);
    }

    // The CLI feeds modules in over JSON; a deserialized copy must
    // compile to the same bytes as the original.
    #[test]
    fn test_module_json_round_trip() {
        let mut m = interface_module();
        let json = serde_json::to_string(&m).unwrap();
        let mut copy: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(compile(&mut m).wasm, compile(&mut copy).wasm);
    }

    #[test]
    fn test_rich_module_is_deterministic() {
        let build = || {
            let mut m = interface_module();
            let g = m.add_function(m.global_scope(), "tag", &[("v", Ty::Any)], Ty::String, true);
            let v = m.find_var(g, "v").unwrap().0;
            m.scope_mut(g).stmts.push(Stmt::Return(Some(Expr {
                kind: ExprKind::TypeOf(Box::new(Expr::var(v, Ty::Any))),
                ty: Ty::String,
            })));
            compile(&mut m).wasm
        };
        assert_eq!(build(), build());
    }
}
