//! Wasm-GC module assembly.
//!
//! Function index space, in order: host imports, generated runtime
//! helpers, lowered user functions (the start routine first), interface
//! dispatchers, export wrappers. The type section is serialized last so
//! array, signature and closure types can be interned on demand while
//! bodies are compiled; everything else about the layout is fixed up
//! front, which keeps output byte-identical across runs.

pub mod data;
pub mod dispatch;
pub mod func;
pub mod runtime;
pub mod types;

use wasm_encoder::{
    ConstExpr, DataCountSection, DataSection, ElementMode, ElementSection, ElementSegment,
    Elements, EntityType, ExportKind, ExportSection, Function, FunctionSection, GlobalSection,
    GlobalType, ImportSection, Instruction, NameMap, NameSection, RefType, StartSection,
    TypeSection, ValType,
};

use tracing::debug;

use crate::compiler::CompileOptions;
use crate::error::{CompileError, CompileResult};
use crate::sema::scope::Module;
use crate::tir::{TirFunctionKind, TirProgram};
use crate::types::{FuncTy, Ty};

use data::DataSegment;
use dispatch::DispatchTable;
use func::FunctionCompiler;
use runtime::{RuntimeFunctions, TYPEOF_TAGS};
use types::{WasmTypeTable, NULLREF};

pub const IMPORT_LOG_STRING: u32 = 0;
pub const IMPORT_THROW_TYPE_ERROR: u32 = 1;
pub const IMPORT_EXTREF_COMPARE: u32 = 2;
pub const NUM_HOST_IMPORTS: u32 = 3;
/// First user-function index: host imports, then the runtime helpers.
pub const USER_FUNC_BASE: u32 = NUM_HOST_IMPORTS + 13;

const HOST_MODULE: &str = "host";

/// Function index of a host import, by its surface name.
pub fn host_import(name: &str) -> Option<u32> {
    match name {
        "log_string" => Some(IMPORT_LOG_STRING),
        "throw_type_error" => Some(IMPORT_THROW_TYPE_ERROR),
        "extref_compare" => Some(IMPORT_EXTREF_COMPARE),
        _ => None,
    }
}

/// Assemble the complete binary module for a lowered program.
pub fn generate(
    module: &Module,
    program: &TirProgram,
    options: &CompileOptions,
) -> CompileResult<Vec<u8>> {
    let mut types = WasmTypeTable::new(module)?;
    let mut data = DataSegment::new();
    let runtime = RuntimeFunctions::new(NUM_HOST_IMPORTS);
    debug_assert_eq!(NUM_HOST_IMPORTS + runtime.count, USER_FUNC_BASE);
    let user_base = USER_FUNC_BASE;
    let mut dispatch = DispatchTable::new(user_base + program.functions.len() as u32);
    let mut declared: Vec<u32> = Vec::new();

    // User bodies first: compiling them discovers string literals,
    // dispatcher entries and ref.func targets.
    let mut bodies: Vec<(u32, Function)> = Vec::new();
    for f in &program.functions {
        let type_idx = match f.kind {
            TirFunctionKind::Start => types.sig(Vec::new(), Vec::new()),
            _ => types.func_sig(
                &FuncTy {
                    params: f.params.clone(),
                    ret: f.ret.clone(),
                },
                module,
            )?,
        };
        let compiler = FunctionCompiler::new(
            module,
            program,
            f,
            &mut types,
            &mut data,
            &runtime,
            &mut dispatch,
            &mut declared,
            options,
            user_base,
        );
        let body = compiler.compile()?;
        debug!(name = %f.mangled_name, "compiled function body");
        bodies.push((type_idx, body));
    }

    let runtime_bodies = emit_runtime(&mut types, &mut data, module)?;
    let dispatcher_bodies =
        dispatch::emit_dispatchers(&dispatch, module, &mut types, program, user_base)?;

    // Export wrappers: same body minus the context parameter, exported
    // under the surface name.
    let mut wrappers: Vec<(String, u32, Function)> = Vec::new();
    for (i, f) in program.functions.iter().enumerate() {
        let Some(name) = &f.export_name else { continue };
        let mut params = Vec::with_capacity(f.params.len());
        for p in &f.params {
            params.push(types.valtype(p, module)?);
        }
        let results = if f.ret.is_void() {
            Vec::new()
        } else {
            vec![types.valtype(&f.ret, module)?]
        };
        let type_idx = types.sig(params, results);
        let mut w = Function::new([]);
        w.instruction(&Instruction::RefNull(NULLREF));
        for j in 0..f.params.len() as u32 {
            w.instruction(&Instruction::LocalGet(j));
        }
        w.instruction(&Instruction::Call(user_base + i as u32));
        w.instruction(&Instruction::End);
        wrappers.push((name.clone(), type_idx, w));
    }

    // Imports intern their signatures last; the type section tolerates
    // any registration order.
    let string_vt = types.valtype(&Ty::String, module)?;
    let log_string_ty = types.sig(vec![string_vt], Vec::new());
    let throw_ty = types.sig(vec![ValType::I32], Vec::new());
    let extref_ty = types.sig(
        vec![
            ValType::Ref(RefType::EXTERNREF),
            ValType::Ref(RefType::EXTERNREF),
        ],
        vec![ValType::I32],
    );

    let mut imports = ImportSection::new();
    imports.import(HOST_MODULE, "log_string", EntityType::Function(log_string_ty));
    imports.import(
        HOST_MODULE,
        "throw_type_error",
        EntityType::Function(throw_ty),
    );
    imports.import(
        HOST_MODULE,
        "extref_compare",
        EntityType::Function(extref_ty),
    );

    let mut functions = FunctionSection::new();
    let mut code = wasm_encoder::CodeSection::new();
    for (ty, body) in runtime_bodies
        .iter()
        .chain(bodies.iter())
        .chain(dispatcher_bodies.iter())
    {
        functions.function(*ty);
        code.function(body);
    }
    for (_, ty, body) in &wrappers {
        functions.function(*ty);
        code.function(body);
    }

    let mut globals = GlobalSection::new();
    for g in &program.globals {
        let vt = types.valtype(&g.ty, module)?;
        let init = zero_init(vt)?;
        globals.global(
            GlobalType {
                val_type: vt,
                mutable: true,
                shared: false,
            },
            &init,
        );
    }

    let wrapper_base = user_base + program.functions.len() as u32 + dispatch.len() as u32;
    let mut exports = ExportSection::new();
    for (i, (name, _, _)) in wrappers.iter().enumerate() {
        exports.export(name, ExportKind::Func, wrapper_base + i as u32);
    }

    let mut type_section = TypeSection::new();
    types.emit(&mut type_section);

    let mut out = wasm_encoder::Module::new();
    out.section(&type_section);
    out.section(&imports);
    out.section(&functions);
    out.section(&globals);
    out.section(&exports);
    out.section(&StartSection {
        function_index: user_base,
    });
    if !declared.is_empty() {
        let mut elements = ElementSection::new();
        elements.segment(ElementSegment {
            mode: ElementMode::Declared,
            elements: Elements::Functions(std::borrow::Cow::Borrowed(&declared)),
        });
        out.section(&elements);
    }
    let mut data_section = DataSection::new();
    let mut data_count = DataCountSection { count: 0 };
    data.emit(&mut data_section, &mut data_count);
    out.section(&data_count);
    out.section(&code);
    out.section(&data_section);

    if options.opt_level == 0 || options.debug_info {
        out.section(&name_section(program, &dispatch, module, &wrappers));
    }

    Ok(out.finish())
}

/// Bodies of the generated runtime helpers, in their fixed index
/// order.
fn emit_runtime(
    types: &mut WasmTypeTable,
    data: &mut DataSegment,
    module: &Module,
) -> CompileResult<Vec<(u32, Function)>> {
    let string_idx = types.string_idx;
    let any_idx = types.any_idx;
    let s = types.valtype(&Ty::String, module)?;
    let a = types.valtype(&Ty::Any, module)?;

    let tag_names: Vec<(i32, u32, u32)> = TYPEOF_TAGS
        .iter()
        .map(|&(tag, name)| {
            let (off, len) = data.intern(name);
            (tag, off, len)
        })
        .collect();

    Ok(vec![
        (
            types.sig(vec![s], vec![ValType::F64]),
            runtime::emit_string_len(string_idx),
        ),
        (
            types.sig(vec![s, s], vec![s]),
            runtime::emit_string_concat(string_idx),
        ),
        (
            types.sig(vec![s, s], vec![ValType::I32]),
            runtime::emit_string_eq(string_idx),
        ),
        (
            types.sig(vec![s, ValType::F64, ValType::F64], vec![s]),
            runtime::emit_string_slice(string_idx),
        ),
        (
            types.sig(vec![s, ValType::F64], vec![s]),
            runtime::emit_string_char_at(string_idx),
        ),
        (
            types.sig(vec![ValType::F64], vec![a]),
            runtime::emit_box_number(any_idx),
        ),
        (
            types.sig(vec![ValType::I32], vec![a]),
            runtime::emit_box_boolean(any_idx),
        ),
        (
            types.sig(
                vec![ValType::Ref(RefType::ANYREF), ValType::I32],
                vec![a],
            ),
            runtime::emit_box_ref(any_idx),
        ),
        (
            types.sig(vec![a], vec![ValType::F64]),
            runtime::emit_unbox_number(any_idx, IMPORT_THROW_TYPE_ERROR),
        ),
        (
            types.sig(vec![a], vec![ValType::I32]),
            runtime::emit_unbox_boolean(any_idx, IMPORT_THROW_TYPE_ERROR),
        ),
        (
            types.sig(
                vec![a, ValType::I32],
                vec![ValType::Ref(RefType::ANYREF)],
            ),
            runtime::emit_unbox_ref(any_idx, IMPORT_THROW_TYPE_ERROR),
        ),
        (
            types.sig(vec![a], vec![s]),
            runtime::emit_any_typeof(any_idx, string_idx, &tag_names),
        ),
        (
            types.sig(vec![a], vec![ValType::I32]),
            runtime::emit_any_truthy(any_idx, string_idx),
        ),
    ])
}

fn zero_init(vt: ValType) -> CompileResult<ConstExpr> {
    Ok(match vt {
        ValType::F64 => ConstExpr::f64_const(0.0),
        ValType::I32 => ConstExpr::i32_const(0),
        ValType::Ref(rt) => ConstExpr::ref_null(rt.heap_type),
        other => {
            return Err(CompileError::internal(format!(
                "global of type {:?}",
                other
            )))
        }
    })
}

const RUNTIME_NAMES: [&str; 13] = [
    "string_len",
    "string_concat",
    "string_eq",
    "string_slice",
    "string_char_at",
    "box_number",
    "box_boolean",
    "box_ref",
    "unbox_number",
    "unbox_boolean",
    "unbox_ref",
    "any_typeof",
    "any_truthy",
];

fn name_section(
    program: &TirProgram,
    dispatch: &DispatchTable,
    module: &Module,
    wrappers: &[(String, u32, Function)],
) -> NameSection {
    let mut names = NameSection::new();
    names.module("tess");
    let mut map = NameMap::new();
    map.append(IMPORT_LOG_STRING, "host.log_string");
    map.append(IMPORT_THROW_TYPE_ERROR, "host.throw_type_error");
    map.append(IMPORT_EXTREF_COMPARE, "host.extref_compare");
    let mut idx = NUM_HOST_IMPORTS;
    for name in RUNTIME_NAMES {
        map.append(idx, name);
        idx += 1;
    }
    for f in &program.functions {
        map.append(idx, &f.mangled_name);
        idx += 1;
    }
    for entry in dispatch.entries() {
        let iface = &module.classes.get(entry.iface).name;
        map.append(idx, &format!("{}.{}.dispatch", iface, entry.name));
        idx += 1;
    }
    for (name, _, _) in wrappers {
        map.append(idx, &format!("{}.export", name));
        idx += 1;
    }
    names.functions(&map);
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sema::ast::{Expr, Stmt};
    use crate::sema::scope::VarModifier;
    use crate::tir;

    fn build(module: &mut Module) -> Vec<u8> {
        crate::sema::analyze(module).unwrap();
        let program = tir::lower(module).unwrap();
        generate(module, &program, &CompileOptions::default()).unwrap()
    }

    fn validate(bytes: &[u8]) {
        wasmparser::Validator::new()
            .validate_all(bytes)
            .expect("emitted module must validate");
    }

    #[test]
    fn test_empty_module_validates() {
        let mut m = Module::new();
        let bytes = build(&mut m);
        validate(&bytes);
    }

    #[test]
    fn test_exported_function_gets_wrapper() {
        let mut m = Module::new();
        let f = m.add_function(
            m.global_scope(),
            "double",
            &[("x", Ty::Number)],
            Ty::Number,
            true,
        );
        let x = m.find_var(f, "x").unwrap().0;
        m.scope_mut(f).stmts.push(Stmt::Return(Some(Expr::binary(
            crate::sema::ast::BinOp::Add,
            Expr::var(x, Ty::Number),
            Expr::var(x, Ty::Number),
        ))));
        let bytes = build(&mut m);
        validate(&bytes);

        let printed = wasmprinter::print_bytes(&bytes).unwrap();
        assert!(printed.contains("(export \"double\""));
        assert!(printed.contains("(start"));
    }

    #[test]
    fn test_output_is_deterministic() {
        let build_once = || {
            let mut m = Module::new();
            let f = m.add_function(m.global_scope(), "f", &[], Ty::String, true);
            m.scope_mut(f)
                .stmts
                .push(Stmt::Return(Some(Expr::string("hello"))));
            build(&mut m)
        };
        assert_eq!(build_once(), build_once());
    }

    #[test]
    fn test_globals_initialized_in_start() {
        let mut m = Module::new();
        m.declare_var(m.global_scope(), "counter", Ty::Number, VarModifier::Let);
        m.scope_mut(crate::ids::ScopeId::GLOBAL)
            .stmts
            .push(Stmt::VarDecl {
                scope: crate::ids::ScopeId::GLOBAL,
                index: 0,
                init: Some(Expr::number(41.0)),
            });
        let bytes = build(&mut m);
        validate(&bytes);
        let printed = wasmprinter::print_bytes(&bytes).unwrap();
        assert!(printed.contains("global"));
    }

    #[test]
    fn test_closure_capture_builds_context() {
        let mut m = Module::new();
        let outer = m.add_function(m.global_scope(), "outer", &[], Ty::Void, false);
        let x = m.declare_var(outer, "x", Ty::Number, VarModifier::Let);
        let inner = m.add_function(outer, "inner", &[], Ty::Number, false);
        m.scope_mut(inner)
            .stmts
            .push(Stmt::Return(Some(Expr::var(x, Ty::Number))));
        m.scope_mut(outer).stmts.push(Stmt::FuncDecl(inner));
        m.scope_mut(outer).stmts.push(Stmt::Expr(Expr {
            kind: crate::sema::ast::ExprKind::FuncRef(inner),
            ty: Ty::func(vec![], Ty::Number),
        }));

        let bytes = build(&mut m);
        validate(&bytes);
        // The closure target must be declared for ref.func.
        let printed = wasmprinter::print_bytes(&bytes).unwrap();
        assert!(printed.contains("declare func"));
    }
}
