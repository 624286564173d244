pub mod ast;
mod codegen;
pub mod dump;

pub use codegen::{Compilation, CompileError, Compiler, SymbolTables, compile_program};

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::compiler::ast::{AstError, Node};
use crate::config::{ConfigError, DumpTarget, RuntimeConfig};
use crate::vm::{Natives, Value, VirtualMachine, VmError};

/// Any failure along the load → compile → run pipeline.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Ast(#[from] AstError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("runtime error: {0}")]
    Vm(#[from] VmError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to write bytecode dump to {path}: {source}")]
    Dump {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("terminal error: {source}")]
    Terminal {
        #[source]
        source: io::Error,
    },
}

/// Load and compile a JSON syntax tree.
pub fn compile_file(path: &Path) -> Result<Compilation, RunError> {
    let root = ast::load_file(path)?;
    tracing::debug!(path = %path.display(), kind = root.kind(), "loaded syntax tree");
    Ok(compile_program(&root)?)
}

/// Write the listing of `compilation` where `target` says.
pub fn write_dump(compilation: &Compilation, target: &DumpTarget) -> Result<(), RunError> {
    let listing = dump::format_bytecode(&compilation.program, &compilation.symbols);
    match target {
        DumpTarget::Stderr(false) => {}
        DumpTarget::Stderr(true) => {
            eprintln!("{}", listing);
        }
        DumpTarget::File(path) => {
            fs::write(path, &listing).map_err(|source| RunError::Dump {
                path: path.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Bind the standard natives to a compilation and create a ready-to-run VM.
pub fn build_vm(
    compilation: Compilation,
    config: &RuntimeConfig,
    output: Box<dyn Write>,
) -> VirtualMachine<Natives> {
    let natives = Natives::standard_with_output(output).bind(&compilation.symbols.natives);
    VirtualMachine::with_config(natives, compilation.program, config)
}

/// Compile and run a tree, returning the final operand stack.
pub fn run_ast(
    root: &Node,
    config: &RuntimeConfig,
    output: Box<dyn Write>,
) -> Result<Vec<Value>, RunError> {
    let compilation = compile_program(root)?;
    if let Some(target) = &config.dump_bytecode {
        write_dump(&compilation, target)?;
    }

    let mut vm = build_vm(compilation, config, output);
    vm.execute_all()?;

    if let Some(profile) = vm.format_profile() {
        eprint!("{}", profile);
    }
    Ok(vm.stack().to_vec())
}

/// Compile and run a tree given as JSON text.
pub fn run_source(
    source: &str,
    config: &RuntimeConfig,
    output: Box<dyn Write>,
) -> Result<Vec<Value>, RunError> {
    let root = ast::from_json(source)?;
    run_ast(&root, config, output)
}
