//! Embedded script runtime
//!
//! Compiles and evaluates the two step-script dialects: an imperative,
//! sandboxed Rhai dialect running on a bounded pool of evaluation engines,
//! and a pure functional S-expression dialect. Compilations are cached in a
//! process-wide LRU keyed by the wrapped source, so identical
//! (dialect, attribute names, source) triples share one entry.

pub mod cache;
pub mod rhai_dialect;
pub mod sexpr;

use std::sync::Arc;

use thiserror::Error;

use argyll_domain::{Args, Dialect, ScriptSpec, Value};

use cache::ScriptCache;
use rhai_dialect::RhaiPool;

// =============================================================================
// Errors
// =============================================================================

/// Script runtime errors
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Script failed to compile
    #[error("{dialect} compile error: {message}")]
    Compile { dialect: Dialect, message: String },

    /// Script failed at evaluation time
    #[error("{dialect} runtime error: {message}")]
    Runtime { dialect: Dialect, message: String },

    /// Evaluation-context pool is shut down
    #[error("script engine pool is closed")]
    PoolClosed,
}

// =============================================================================
// Compiled artifacts
// =============================================================================

/// A reusable compiled script
#[derive(Debug)]
pub enum CompiledScript {
    /// Compiled Rhai AST
    Rhai(rhai::AST),

    /// Parsed S-expression
    Sexpr(sexpr::Expr),
}

/// Cache key for a wrapped script.
///
/// The wrap is deterministic: the same dialect, the same lexicographically
/// sorted attribute names, and the same source always produce the same key.
#[must_use]
pub fn wrap_key(dialect: Dialect, names: &[&str], source: &str) -> String {
    format!("{dialect}|{}|{source}", names.join(","))
}

// =============================================================================
// Runtime configuration
// =============================================================================

/// Script runtime tuning knobs
#[derive(Debug, Clone)]
pub struct ScriptRuntimeConfig {
    /// Compiled-script LRU capacity per process
    pub cache_size: usize,

    /// Number of pooled Rhai evaluation engines
    pub pool_size: usize,
}

impl Default for ScriptRuntimeConfig {
    fn default() -> Self {
        Self {
            cache_size: 1024,
            pool_size: 10,
        }
    }
}

// =============================================================================
// Script runtime
// =============================================================================

/// Compiles, caches, and evaluates step scripts
pub struct ScriptRuntime {
    cache: ScriptCache,
    pool: RhaiPool,
}

impl ScriptRuntime {
    /// Create a runtime with the given configuration
    #[must_use]
    pub fn new(config: &ScriptRuntimeConfig) -> Self {
        Self {
            cache: ScriptCache::new(config.cache_size),
            pool: RhaiPool::new(config.pool_size),
        }
    }

    /// Compile a script against the sorted attribute-name list, returning the
    /// cached artifact when one exists.
    ///
    /// Compilation is side-effect free; a failure leaves the cache untouched.
    pub fn compile(
        &self,
        spec: &ScriptSpec,
        names: &[&str],
    ) -> Result<Arc<CompiledScript>, ScriptError> {
        let key = wrap_key(spec.dialect, names, &spec.source);

        if let Some(hit) = self.cache.lookup(&key) {
            return Ok(hit);
        }

        let compiled = match spec.dialect {
            Dialect::Rhai => CompiledScript::Rhai(self.pool.compile(&spec.source)?),
            Dialect::Sexpr => CompiledScript::Sexpr(sexpr::parse(&spec.source)?),
        };

        Ok(self.cache.insert(key, compiled))
    }

    /// Evaluate a script with the given inputs, bound by sorted name
    pub async fn eval(&self, spec: &ScriptSpec, args: &Args) -> Result<Value, ScriptError> {
        let names: Vec<&str> = args.keys().map(String::as_str).collect();
        let compiled = self.compile(spec, &names)?;

        match &*compiled {
            CompiledScript::Rhai(ast) => self.pool.eval(ast, args).await,
            CompiledScript::Sexpr(expr) => sexpr::eval(expr, args),
        }
    }

    /// Evaluate a predicate script to a boolean.
    ///
    /// Rhai follows standard truthiness (unit and `false` are falsy). The
    /// S-expression dialect treats anything but literal `false` as truthy.
    pub async fn eval_predicate(
        &self,
        spec: &ScriptSpec,
        args: &Args,
    ) -> Result<bool, ScriptError> {
        let value = self.eval(spec, args).await?;
        Ok(match spec.dialect {
            Dialect::Rhai => value.is_truthy(),
            Dialect::Sexpr => !matches!(value, Value::Bool(false)),
        })
    }

    /// Evaluate a step-body script to an output map.
    ///
    /// A returned keyed map becomes the outputs; any other value is wrapped
    /// under the `result` key.
    pub async fn eval_script(&self, spec: &ScriptSpec, args: &Args) -> Result<Args, ScriptError> {
        let value = self.eval(spec, args).await?;
        Ok(match value {
            Value::Map(entries) => entries,
            other => [("result".to_string(), other)].into_iter().collect(),
        })
    }

    /// Number of cached compilations (for introspection/tests)
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}
