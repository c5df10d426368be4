//! The library handle.
//!
//! An [`Engine`] owns a configuration snapshot and turns source text into
//! ready-to-run [`Vm`] instances. There is no process-wide state: every
//! registry a VM consults (functions, constants, stream devices) belongs to
//! that VM, seeded from the engine's configuration at compile time.

use crate::{error::CompileError, compile, vm::Vm};

/// Default maximum function recursion depth.
pub const DEFAULT_MAX_RECURSION: usize = 32;

/// Engine-level configuration, snapshotted into each compiled VM.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum function recursion depth (default 32).
    pub max_recursion: usize,
    /// Whether runtime errors are reported to the error consumer.
    pub error_reporting: bool,
    /// Directories searched by `include`/`import` for relative paths.
    pub import_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_recursion: DEFAULT_MAX_RECURSION,
            error_reporting: false,
            import_paths: Vec::new(),
        }
    }
}

/// Factory for virtual machines.
#[derive(Debug, Default)]
pub struct Engine {
    config: Config,
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self { config }
    }

    /// Mutable access to the configuration used by subsequent compiles.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Compiles `source` into a VM ready for [`Vm::exec`].
    ///
    /// `file_name` tags error reports; pass an empty string for anonymous
    /// buffers. On failure the accumulated diagnostics come back (at most
    /// the compile-error cap).
    pub fn compile(&self, file_name: &str, source: &str) -> Result<Vm, Vec<CompileError>> {
        let output = compile::compile_source(source, Vec::new(), 0)?;
        Ok(Vm::assemble(file_name.to_string(), output, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_reports_syntax_errors() {
        let engine = Engine::new();
        let err = engine.compile("bad.jx9", "$x = ;").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn compile_accepts_empty_program() {
        let engine = Engine::new();
        assert!(engine.compile("empty.jx9", "").is_ok());
    }
}
