//! Wire payload delivered by step endpoints
//!
//! The same shape is used by synchronous invocation responses and by
//! asynchronous webhook deliveries.

use serde::{Deserialize, Serialize};

use crate::value::Args;

/// Outcome reported by a step endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StepResult {
    /// Whether the work item succeeded
    pub success: bool,

    /// Produced outputs, keyed by attribute name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Args>,

    /// Error message for failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// Successful result with outputs
    #[must_use]
    pub fn ok(outputs: Args) -> Self {
        Self {
            success: true,
            outputs: Some(outputs),
            error: None,
        }
    }

    /// Successful result with no outputs
    #[must_use]
    pub fn empty() -> Self {
        Self {
            success: true,
            outputs: None,
            error: None,
        }
    }

    /// Failed result with an error message
    #[must_use]
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: None,
            error: Some(error.into()),
        }
    }

    /// Outputs or an empty map
    #[must_use]
    pub fn outputs_or_default(&self) -> Args {
        self.outputs.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_wire_shape() {
        let result = StepResult::ok(
            [("total".to_string(), Value::Int(42))].into_iter().collect(),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["outputs"]["total"], 42);
        assert!(json.get("error").is_none());

        let failure = StepResult::err("boom");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "boom");
    }
}
