//! Embedded script references
//!
//! Steps can carry scripts in one of two dialects: an imperative Rhai
//! dialect and a pure functional S-expression dialect.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Script dialect selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Imperative dialect, sandboxed Rhai
    Rhai,

    /// Functional S-expression dialect, pure by construction
    Sexpr,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rhai => write!(f, "rhai"),
            Self::Sexpr => write!(f, "sexpr"),
        }
    }
}

/// A script source together with its dialect
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScriptSpec {
    /// Dialect the source is written in
    pub dialect: Dialect,

    /// Script source text
    pub source: String,
}

impl ScriptSpec {
    /// Create a new script spec
    #[must_use]
    pub fn new(dialect: Dialect, source: impl Into<String>) -> Self {
        Self {
            dialect,
            source: source.into(),
        }
    }

    /// Imperative-dialect script
    #[must_use]
    pub fn rhai(source: impl Into<String>) -> Self {
        Self::new(Dialect::Rhai, source)
    }

    /// Functional-dialect script
    #[must_use]
    pub fn sexpr(source: impl Into<String>) -> Self {
        Self::new(Dialect::Sexpr, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_serialization() {
        let spec = ScriptSpec::rhai("inputs + 1");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["dialect"], "rhai");

        let spec = ScriptSpec::sexpr("(+ a b)");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["dialect"], "sexpr");
    }
}
