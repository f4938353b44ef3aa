//! Tess compiler CLI.
//!
//! The frontend is out of process: inputs are typed program modules in
//! JSON form, which the core deserializes, lowers and compiles.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tess_core::{CompileOptions, Compiler, Module};

#[derive(Parser)]
#[command(name = "tessc")]
#[command(author, version, about = "Tess Compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct CodegenFlags {
    /// Optimization level (0 keeps debug names)
    #[arg(short = 'O', long, default_value_t = 0)]
    opt_level: u8,

    /// Disable the dynamic `any` subsystem
    #[arg(long)]
    no_any: bool,

    /// Disable interface values and dispatch
    #[arg(long)]
    no_interface: bool,

    /// Disable the builtin host library
    #[arg(long)]
    no_stdlib: bool,

    /// Emit debug names regardless of optimization level
    #[arg(long)]
    debug_info: bool,

    /// Skip validation of the emitted binary
    #[arg(long)]
    no_validate: bool,
}

impl CodegenFlags {
    fn to_options(&self) -> CompileOptions {
        CompileOptions {
            opt_level: self.opt_level,
            no_any: self.no_any,
            no_interface: self.no_interface,
            no_stdlib: self.no_stdlib,
            debug_info: self.debug_info,
            no_validate: self.no_validate,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a typed module to a wasm binary
    Compile {
        /// Input module (JSON)
        file: PathBuf,

        /// Output path; defaults to the input with a .wasm extension
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        flags: CodegenFlags,
    },

    /// Dump the lowered typed IR
    Ir {
        /// Input module (JSON)
        file: PathBuf,

        /// Pretty-print the JSON output
        #[arg(short, long)]
        pretty: bool,
    },

    /// Run analyses and lowering without emitting anything
    Check {
        /// Input module(s) (JSON)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Compile and print the text-format disassembly
    Dis {
        /// Input module (JSON)
        file: PathBuf,

        #[command(flatten)]
        flags: CodegenFlags,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Compile {
            file,
            output,
            flags,
        } => compile(&file, output, &flags),
        Commands::Ir { file, pretty } => dump_ir(&file, pretty),
        Commands::Check { files } => check(&files),
        Commands::Dis { file, flags } => disassemble(&file, &flags),
    }
}

fn load_module(path: &Path) -> Result<Module> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&source)
        .with_context(|| format!("failed to parse module from {}", path.display()))
}

fn compile(file: &Path, output: Option<PathBuf>, flags: &CodegenFlags) -> Result<()> {
    let mut module = load_module(file)?;
    let compiler = Compiler::new(flags.to_options());
    let out = compiler
        .compile(&mut module)
        .with_context(|| format!("compilation of {} failed", file.display()))?;

    let out_path = output.unwrap_or_else(|| file.with_extension("wasm"));
    fs::write(&out_path, &out.wasm)
        .with_context(|| format!("failed to write {}", out_path.display()))?;
    eprintln!("wrote {} ({} bytes)", out_path.display(), out.wasm.len());
    if let Some(map) = &out.source_map {
        let map_path = out_path.with_extension("map.json");
        fs::write(&map_path, map)
            .with_context(|| format!("failed to write {}", map_path.display()))?;
        eprintln!("wrote {}", map_path.display());
    }
    Ok(())
}

fn dump_ir(file: &Path, pretty: bool) -> Result<()> {
    let mut module = load_module(file)?;
    let compiler = Compiler::default();
    let program = compiler
        .lower(&mut module)
        .with_context(|| format!("lowering of {} failed", file.display()))?;
    let json = if pretty {
        serde_json::to_string_pretty(&program)?
    } else {
        serde_json::to_string(&program)?
    };
    println!("{}", json);
    Ok(())
}

fn check(files: &[PathBuf]) -> Result<()> {
    let compiler = Compiler::default();
    let mut failed = false;
    for file in files {
        let mut module = load_module(file)?;
        match compiler.lower(&mut module) {
            Ok(_) => eprintln!("{}: ok", file.display()),
            Err(e) => {
                eprintln!("{}: {}", file.display(), e);
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!("check failed");
    }
    Ok(())
}

fn disassemble(file: &Path, flags: &CodegenFlags) -> Result<()> {
    let mut module = load_module(file)?;
    let compiler = Compiler::new(flags.to_options());
    let out = compiler
        .compile(&mut module)
        .with_context(|| format!("compilation of {} failed", file.display()))?;
    let text = tess_core::disassemble(&out.wasm)?;
    println!("{}", text);
    Ok(())
}
