//! Attribute specifications attached to steps
//!
//! Every step declares the attributes it consumes and produces. Attribute
//! names are global: the same name must carry the same type across the whole
//! catalog (enforced at registration).

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Role an attribute plays for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrRole {
    /// Input that must be present before the step can run
    Required,

    /// Input that is passed when available, omitted otherwise
    Optional,

    /// Input pinned to its declared default; supplied values are overridden
    Const,

    /// Value the step produces
    Output,
}

/// Declared type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrType {
    String,
    Number,
    Bool,
    Object,
    Array,
    /// No constraint
    Any,
}

/// Specification of one attribute on one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AttributeSpec {
    /// Role of the attribute for this step
    pub role: AttrRole,

    /// Declared type (global per attribute name)
    #[serde(rename = "type")]
    pub attr_type: AttrType,

    /// Default value, used when no value is supplied.
    /// Mandatory for `Const` attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Expand into one work item per element when the supplied value
    /// is an array
    #[serde(default)]
    pub for_each: bool,
}

impl AttributeSpec {
    /// Create an input spec with the given role
    #[must_use]
    pub fn input(role: AttrRole, attr_type: AttrType) -> Self {
        Self {
            role,
            attr_type,
            default: None,
            for_each: false,
        }
    }

    /// Create a required input spec
    #[must_use]
    pub fn required(attr_type: AttrType) -> Self {
        Self::input(AttrRole::Required, attr_type)
    }

    /// Create an optional input spec
    #[must_use]
    pub fn optional(attr_type: AttrType) -> Self {
        Self::input(AttrRole::Optional, attr_type)
    }

    /// Create an output spec
    #[must_use]
    pub fn output(attr_type: AttrType) -> Self {
        Self::input(AttrRole::Output, attr_type)
    }

    /// Create a const input spec pinned to a default
    #[must_use]
    pub fn constant(attr_type: AttrType, default: Value) -> Self {
        Self {
            role: AttrRole::Const,
            attr_type,
            default: Some(default),
            for_each: false,
        }
    }

    /// Attach a default value
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark the attribute as for-each expanded
    #[must_use]
    pub fn for_each(mut self) -> Self {
        self.for_each = true;
        self
    }

    /// Whether the attribute is consumed by the step
    #[must_use]
    pub fn is_input(&self) -> bool {
        !matches!(self.role, AttrRole::Output)
    }

    /// Whether the attribute is produced by the step
    #[must_use]
    pub fn is_output(&self) -> bool {
        matches!(self.role, AttrRole::Output)
    }
}
