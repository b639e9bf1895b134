//! Script compilers.
//!
//! The scripting language itself lives outside this crate. A compiler turns a
//! script and its variable bindings into postings plus metadata; the core only
//! consumes that normalized output. Two runtimes exist and a request picks one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_shared::types::Metadata;

use crate::error::LedgerError;
use crate::posting::Postings;

/// Script execution engine selected by a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    /// The legacy compiler.
    #[default]
    MachineV1,
    /// The alternate interpreter.
    Interpreter,
}

/// A script and its variable bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Source text.
    pub plain: String,
    /// Variable bindings.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Engine to run it with.
    #[serde(default)]
    pub runtime: Runtime,
}

impl Script {
    /// A script for the default runtime.
    pub fn new(plain: impl Into<String>) -> Self {
        Self {
            plain: plain.into(),
            vars: BTreeMap::new(),
            runtime: Runtime::default(),
        }
    }
}

/// Normalized output of a compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledScript {
    /// Postings in script order.
    pub postings: Postings,
    /// Transaction metadata set by the script.
    pub metadata: Metadata,
    /// Account metadata set by the script.
    pub account_metadata: BTreeMap<String, Metadata>,
}

/// Compiles and evaluates scripts. Must be free of side effects.
#[cfg_attr(test, mockall::automock)]
pub trait ScriptCompiler: Send + Sync {
    /// Compiles `script`; fails with [`LedgerError::CompilationFailed`] or
    /// [`LedgerError::Interpreter`].
    fn compile(&self, script: &Script) -> Result<CompiledScript, LedgerError>;
}

/// Compilers keyed by runtime.
#[derive(Clone, Default)]
pub struct CompilerRegistry {
    compilers: HashMap<Runtime, Arc<dyn ScriptCompiler>>,
}

impl std::fmt::Debug for CompilerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerRegistry")
            .field("runtimes", &self.compilers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CompilerRegistry {
    /// An empty registry: script requests fail until a compiler is registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `compiler` for `runtime`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, runtime: Runtime, compiler: Arc<dyn ScriptCompiler>) -> Self {
        self.compilers.insert(runtime, compiler);
        self
    }

    /// Compiles `script` with the compiler of its runtime.
    pub fn compile(&self, script: &Script) -> Result<CompiledScript, LedgerError> {
        let compiler = self.compilers.get(&script.runtime).ok_or_else(|| {
            LedgerError::CompilationFailed(format!(
                "no compiler registered for runtime {:?}",
                script.runtime
            ))
        })?;
        compiler.compile(script)
    }
}
