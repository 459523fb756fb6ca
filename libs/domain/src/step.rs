//! Step definitions
//!
//! A step is a reusable unit of work declaring typed input/output attributes
//! and a body describing how it is invoked. Steps are immutable once
//! registered (modulo replacement).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attribute::{AttrRole, AttributeSpec};
use crate::script::ScriptSpec;
use crate::value::Args;
use crate::work::WorkConfig;

/// Step kind discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Synchronous HTTP endpoint: the invocation response carries the result
    SyncHttp,

    /// Asynchronous HTTP endpoint: the invocation is acknowledged and the
    /// result arrives later through a webhook
    AsyncHttp,

    /// Embedded script evaluated in-process
    Script,

    /// Child flow started with mapped inputs
    Flow,
}

/// Step body, one variant per kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepBody {
    /// Synchronous HTTP invocation target
    SyncHttp {
        endpoint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        health_endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Asynchronous HTTP invocation target
    AsyncHttp {
        endpoint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        health_endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Embedded script body
    Script { script: ScriptSpec },

    /// Child-flow body: goals of the child plus explicit attribute renames
    /// in both directions
    Flow {
        goals: Vec<String>,
        #[serde(default)]
        input_map: BTreeMap<String, String>,
        #[serde(default)]
        output_map: BTreeMap<String, String>,
    },
}

impl StepBody {
    /// Kind discriminant for this body
    #[must_use]
    pub fn kind(&self) -> StepKind {
        match self {
            Self::SyncHttp { .. } => StepKind::SyncHttp,
            Self::AsyncHttp { .. } => StepKind::AsyncHttp,
            Self::Script { .. } => StepKind::Script,
            Self::Flow { .. } => StepKind::Flow,
        }
    }

    /// Per-step invocation timeout, when declared
    #[must_use]
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Self::SyncHttp { timeout_ms, .. } | Self::AsyncHttp { timeout_ms, .. } => *timeout_ms,
            Self::Script { .. } | Self::Flow { .. } => None,
        }
    }

    /// Health-probe endpoint, when declared
    #[must_use]
    pub fn health_endpoint(&self) -> Option<&str> {
        match self {
            Self::SyncHttp {
                health_endpoint, ..
            }
            | Self::AsyncHttp {
                health_endpoint, ..
            } => health_endpoint.as_deref(),
            Self::Script { .. } | Self::Flow { .. } => None,
        }
    }
}

/// Errors found when validating a step definition in isolation
#[derive(Debug, Error)]
pub enum StepValidationError {
    /// Step id is empty
    #[error("step id must not be empty")]
    EmptyId,

    /// Const attribute missing its mandatory default
    #[error("const attribute '{0}' must declare a default")]
    ConstWithoutDefault(String),

    /// Default value does not conform to the declared type
    #[error("default for attribute '{name}' is {found}, declared type is {declared}")]
    DefaultTypeMismatch {
        name: String,
        declared: String,
        found: String,
    },

    /// For-each marked on an output attribute
    #[error("attribute '{0}' is an output and cannot be for_each")]
    ForEachOutput(String),

    /// Flow body with no goals
    #[error("flow step must declare at least one goal")]
    EmptyGoals,
}

/// A registered unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Step {
    /// Unique identifier in the catalog
    pub id: String,

    /// Declared attributes, input and output
    pub attributes: BTreeMap<String, AttributeSpec>,

    /// How the step is invoked
    pub body: StepBody,

    /// Optional predicate guarding execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<ScriptSpec>,

    /// Retry and parallelism configuration
    #[serde(default)]
    pub work: WorkConfig,

    /// Whether `(step, inputs) -> outputs` may be cached
    #[serde(default)]
    pub memoizable: bool,
}

impl Step {
    /// Kind discriminant
    #[must_use]
    pub fn kind(&self) -> StepKind {
        self.body.kind()
    }

    /// Iterate input attributes (required, optional, const)
    pub fn inputs(&self) -> impl Iterator<Item = (&str, &AttributeSpec)> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.is_input())
            .map(|(name, spec)| (name.as_str(), spec))
    }

    /// Iterate output attribute names
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.is_output())
            .map(|(name, _)| name.as_str())
    }

    /// Iterate required input attribute names
    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, spec)| matches!(spec.role, AttrRole::Required))
            .map(|(name, _)| name.as_str())
    }

    /// Names of for-each inputs
    pub fn for_each_inputs(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.is_input() && spec.for_each)
            .map(|(name, _)| name.as_str())
    }

    /// Scripts carried by this step (predicate and/or body), for
    /// compile-before-admit validation
    pub fn scripts(&self) -> impl Iterator<Item = &ScriptSpec> {
        let body_script = match &self.body {
            StepBody::Script { script } => Some(script),
            _ => None,
        };
        self.predicate.iter().chain(body_script)
    }

    /// Whether the step carries any script
    #[must_use]
    pub fn has_scripts(&self) -> bool {
        self.scripts().next().is_some()
    }

    /// Validate the definition in isolation (catalog-wide invariants are
    /// checked at registration)
    pub fn validate(&self) -> Result<(), StepValidationError> {
        if self.id.is_empty() {
            return Err(StepValidationError::EmptyId);
        }

        for (name, spec) in &self.attributes {
            if matches!(spec.role, AttrRole::Const) && spec.default.is_none() {
                return Err(StepValidationError::ConstWithoutDefault(name.clone()));
            }
            if spec.for_each && spec.is_output() {
                return Err(StepValidationError::ForEachOutput(name.clone()));
            }
            if let Some(default) = &spec.default {
                if !default.conforms_to(spec.attr_type) {
                    return Err(StepValidationError::DefaultTypeMismatch {
                        name: name.clone(),
                        declared: format!("{:?}", spec.attr_type).to_lowercase(),
                        found: default.type_name().to_string(),
                    });
                }
            }
        }

        if let StepBody::Flow { goals, .. } = &self.body {
            if goals.is_empty() {
                return Err(StepValidationError::EmptyGoals);
            }
        }

        Ok(())
    }
}

/// Remap argument names through a rename table, dropping unmapped entries
#[must_use]
pub fn remap_args(mapping: &BTreeMap<String, String>, source: &Args) -> Args {
    mapping
        .iter()
        .filter_map(|(from, to)| {
            source
                .get(from)
                .map(|value| (to.clone(), value.clone()))
        })
        .collect()
}
