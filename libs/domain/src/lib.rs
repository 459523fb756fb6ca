//! Core data model for the Argyll workflow engine
//!
//! Pure types shared by every other crate: the `Value` sum type that crosses
//! the script boundary, step definitions with typed attributes, work/retry
//! configuration, and stable fingerprints for memoization.

pub mod attribute;
pub mod fingerprint;
pub mod script;
pub mod step;
pub mod step_result;
pub mod value;
pub mod work;

pub use attribute::{AttrRole, AttrType, AttributeSpec};
pub use fingerprint::{args_fingerprint, sha256_hex, step_fingerprint};
pub use script::{Dialect, ScriptSpec};
pub use step::{remap_args, Step, StepBody, StepKind, StepValidationError};
pub use step_result::StepResult;
pub use value::{Args, Value};
pub use work::{BackoffKind, WorkConfig};
