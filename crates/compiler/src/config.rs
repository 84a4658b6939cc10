//! Compiler configuration
//!
//! The defaults match the standard runtime: the builtin name set is
//! sourced from the runtime's registry so direct calls to builtins can
//! be emitted as `INVOKE_GLOBAL` without the compiler and runtime ever
//! drifting apart.

use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Evaluate literal operator expressions at compile time
    pub fold_constants: bool,
    /// Emit the slot -> name debug table
    pub debug_locals: bool,
    /// Names callable as builtins through INVOKE_GLOBAL
    builtins: HashSet<String>,
}

impl CompilerConfig {
    pub fn new() -> Self {
        let builtins = lattice_runtime::Builtins::standard()
            .names()
            .into_iter()
            .map(String::from)
            .collect();
        CompilerConfig {
            fold_constants: true,
            debug_locals: true,
            builtins,
        }
    }

    /// Disable constant folding (diagnostics, folding tests).
    pub fn without_folding(mut self) -> Self {
        self.fold_constants = false;
        self
    }

    pub fn without_debug_locals(mut self) -> Self {
        self.debug_locals = false;
        self
    }

    /// Teach the compiler about a host-registered builtin.
    pub fn with_builtin(mut self, name: impl Into<String>) -> Self {
        self.builtins.insert(name.into());
        self
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains(name)
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::new()
    }
}
