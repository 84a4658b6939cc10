//! Lattice Compiler
//!
//! Translates a parsed [`Program`] into stack-VM bytecode chunks.
//! Three entry points mirror the three execution surfaces:
//!
//! - [`compile`]: script compilation; auto-invokes `main()` when the
//!   program defines one
//! - [`compile_module`]: module compilation; no auto-call, exports kept
//! - [`compile_repl`]: REPL compilation; the last bare expression's
//!   value becomes the chunk's result

pub mod ast;
pub mod config;
mod compile;

pub use ast::Program;
pub use compile::CompileMode;
pub use config::CompilerConfig;

use compile::Compiler;
use lattice_core::chunk::Chunk;
use lattice_core::error::CompileError;
use std::sync::Arc;

/// Compile for script execution.
pub fn compile(program: &Program) -> Result<Arc<Chunk>, CompileError> {
    compile_with_config(program, &CompilerConfig::new(), CompileMode::Script)
}

/// Compile a module: no auto-invocation, `export_names` preserved.
pub fn compile_module(program: &Program) -> Result<Arc<Chunk>, CompileError> {
    compile_with_config(program, &CompilerConfig::new(), CompileMode::Module)
}

/// Compile a REPL line: the last bare expression's value is preserved
/// as the chunk's result.
pub fn compile_repl(program: &Program) -> Result<Arc<Chunk>, CompileError> {
    compile_with_config(program, &CompilerConfig::new(), CompileMode::Repl)
}

/// Compile with explicit configuration and mode.
pub fn compile_with_config(
    program: &Program,
    config: &CompilerConfig,
    mode: CompileMode,
) -> Result<Arc<Chunk>, CompileError> {
    let mut compiler = Compiler::new(config);
    let chunk = compiler.compile_program(program, mode)?;
    tracing::debug!(
        code_bytes = chunk.code.len(),
        constants = chunk.constants.len(),
        exports = chunk.export_names.len(),
        ?mode,
        "compiled chunk"
    );
    Ok(chunk)
}
