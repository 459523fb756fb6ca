//! Imperative dialect: sandboxed Rhai on a bounded engine pool
//!
//! Engines are locked down before use: bounded operations, call depth, and
//! collection sizes, no module loading, and no filesystem/OS/debug
//! primitives registered. Only pure computation and data operations are
//! reachable from scripts.

use rhai::{Dynamic, Engine, Scope, AST};
use tokio::sync::{Mutex, Semaphore};

use argyll_domain::{Args, Dialect, Value};

use crate::ScriptError;

// =============================================================================
// Sandbox limits
// =============================================================================

const MAX_OPERATIONS: u64 = 100_000;
const MAX_CALL_DEPTH: usize = 64;
const MAX_ARRAY_SIZE: usize = 10_000;
const MAX_STRING_SIZE: usize = 1_000_000;

/// Build an engine with the sandbox limits applied
fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_call_levels(MAX_CALL_DEPTH);
    engine.set_max_array_size(MAX_ARRAY_SIZE);
    engine.set_max_string_size(MAX_STRING_SIZE);
    engine.set_max_modules(0);
    engine
}

// =============================================================================
// Engine pool
// =============================================================================

/// Bounded pool of reusable evaluation engines.
///
/// A permit is acquired per call; engines are recycled rather than rebuilt so
/// repeated evaluations avoid setup cost.
pub struct RhaiPool {
    permits: Semaphore,
    engines: Mutex<Vec<Engine>>,
    compiler: Engine,
}

impl RhaiPool {
    /// Create a pool with the given number of evaluation slots (minimum 1)
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let engines = (0..size).map(|_| build_engine()).collect();
        Self {
            permits: Semaphore::new(size),
            engines: Mutex::new(engines),
            compiler: build_engine(),
        }
    }

    /// Compile a source into a reusable AST.
    ///
    /// Side-effect free: nothing is executed at compile time.
    pub fn compile(&self, source: &str) -> Result<AST, ScriptError> {
        self.compiler
            .compile(source)
            .map_err(|e| ScriptError::Compile {
                dialect: Dialect::Rhai,
                message: e.to_string(),
            })
    }

    /// Evaluate a compiled script with inputs bound as scope variables
    pub async fn eval(&self, ast: &AST, args: &Args) -> Result<Value, ScriptError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ScriptError::PoolClosed)?;

        let engine = {
            let mut engines = self.engines.lock().await;
            engines.pop().unwrap_or_else(build_engine)
        };

        let mut scope = Scope::new();
        for (name, value) in args {
            scope.push_dynamic(name.as_str(), value_to_dynamic(value));
        }

        let result = engine.eval_ast_with_scope::<Dynamic>(&mut scope, ast);

        self.engines.lock().await.push(engine);

        match result {
            Ok(value) => Ok(dynamic_to_value(&value)),
            Err(e) => Err(ScriptError::Runtime {
                dialect: Dialect::Rhai,
                message: e.to_string(),
            }),
        }
    }
}

// =============================================================================
// Value marshaling
// =============================================================================

/// Convert an engine value into a Rhai dynamic
#[must_use]
pub fn value_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Int(i) => Dynamic::from(*i),
        Value::Float(x) => Dynamic::from(*x),
        Value::Str(s) => Dynamic::from(s.clone()),
        Value::Seq(items) => {
            let array: rhai::Array = items.iter().map(value_to_dynamic).collect();
            Dynamic::from(array)
        }
        Value::Map(entries) => {
            let mut map = rhai::Map::new();
            for (k, v) in entries {
                map.insert(k.clone().into(), value_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

/// Convert a Rhai dynamic back into an engine value.
///
/// Anything outside the narrow value model is stringified rather than leaked.
#[must_use]
pub fn dynamic_to_value(value: &Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Some(b) = value.clone().try_cast::<bool>() {
        Value::Bool(b)
    } else if let Some(i) = value.clone().try_cast::<i64>() {
        Value::Int(i)
    } else if let Some(x) = value.clone().try_cast::<f64>() {
        Value::Float(x)
    } else if let Some(s) = value.clone().try_cast::<String>() {
        Value::Str(s)
    } else if value.is_array() {
        let array = value.clone().cast::<rhai::Array>();
        Value::Seq(array.iter().map(dynamic_to_value).collect())
    } else if value.is_map() {
        let map = value.clone().cast::<rhai::Map>();
        Value::Map(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_value(v)))
                .collect(),
        )
    } else {
        Value::Str(value.to_string())
    }
}
