//! Module registry: compiled module chunks by name
//!
//! Module file discovery is the host's concern; it compiles each module
//! with `compile_module` and registers the chunk here. `IMPORT` executes
//! a module at most once per VM and binds its exports into the importing
//! globals as `module::name`.

use lattice_core::chunk::Chunk;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Shared, thread-safe store of compiled module chunks.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    chunks: Mutex<HashMap<String, Arc<Chunk>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, chunk: Arc<Chunk>) {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), chunk);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Chunk>> {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
