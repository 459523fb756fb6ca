//! Step invocation seam
//!
//! HTTP step kinds are executed by an external `StepInvoker` implementation;
//! the engine only builds the request, enforces the deadline, and interprets
//! the outcome. Script and flow kinds never reach this seam.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use argyll_domain::{Args, StepResult};

/// Invocation errors, split by retry semantics
#[derive(Debug, Error)]
pub enum InvokeError {
    /// Transient failure: network error, 5xx, invoker-signalled incomplete.
    /// The retry path engages.
    #[error("transient invocation failure: {0}")]
    Transient(String),

    /// Permanent failure: the work item fails immediately
    #[error("permanent invocation failure: {0}")]
    Permanent(String),

    /// Deadline elapsed; treated as transient
    #[error("invocation timed out")]
    Timeout,
}

/// Where the invocation goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationTarget {
    /// Synchronous endpoint: the response carries the result
    SyncHttp { endpoint: String },

    /// Asynchronous endpoint: the call is acknowledged and the result
    /// arrives later at the webhook URL
    AsyncHttp {
        endpoint: String,
        webhook_url: String,
    },
}

/// One step invocation
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Owning flow
    pub flow_id: String,

    /// Step being invoked
    pub step_id: String,

    /// Work-item token routing the completion
    pub token: Uuid,

    /// Endpoint target
    pub target: InvocationTarget,

    /// Gathered arguments
    pub arguments: Args,

    /// Scoped deadline for the call
    pub timeout: Duration,
}

impl InvocationRequest {
    /// The metadata payload sent alongside the arguments
    #[must_use]
    pub fn metadata(&self) -> serde_json::Value {
        let webhook_url = match &self.target {
            InvocationTarget::AsyncHttp { webhook_url, .. } => Some(webhook_url.as_str()),
            InvocationTarget::SyncHttp { .. } => None,
        };
        serde_json::json!({
            "arguments": self.arguments,
            "metadata": {
                "flow_id": self.flow_id,
                "step_id": self.step_id,
                "receipt_token": self.token,
                "webhook_url": webhook_url,
            }
        })
    }
}

/// Outcome of an invocation
#[derive(Debug, Clone)]
pub enum InvocationOutcome {
    /// The endpoint returned a result synchronously
    Completed(StepResult),

    /// The endpoint acknowledged an asynchronous invocation; completion
    /// arrives later through the webhook
    Accepted,
}

/// Capability invoking step endpoints; implemented outside the engine
#[async_trait]
pub trait StepInvoker: Send + Sync {
    /// Invoke the endpoint described by the request
    async fn invoke(&self, request: InvocationRequest)
        -> Result<InvocationOutcome, InvokeError>;
}

/// Webhook URL for an async invocation:
/// `{webhook_base}/webhook/{flow_id}/{step_id}/{token}`
#[must_use]
pub fn webhook_url(webhook_base: &str, flow_id: &str, step_id: &str, token: Uuid) -> String {
    format!(
        "{}/webhook/{flow_id}/{step_id}/{token}",
        webhook_base.trim_end_matches('/')
    )
}
