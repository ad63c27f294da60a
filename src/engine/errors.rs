//! Error taxonomy for the coordination engine.
//!
//! Mirrors [`crate::tool_protocol::ToolError`]'s convention: a plain enum with
//! a hand-written [`std::fmt::Display`] impl rather than a derive macro.

use std::error::Error;
use std::fmt;

/// Everything that can cause a protocol run to fail outright.
///
/// Tool failures, parse failures, and scope misconfiguration are deliberately
/// *not* representable here — per the error handling design, those are
/// absorbed locally (tool executor, mechanical-stage parser, scoping filter)
/// and never propagate to this type.
#[derive(Debug, Clone)]
pub enum CoordinationError {
    /// Bad input at the run boundary: unknown protocol key, empty agent
    /// list, missing required agent, malformed pipeline step, etc.
    Validation(String),
    /// The LLM provider returned an error or the call could not complete.
    Provider(String),
    /// A stage executor failed for a reason other than a provider error
    /// (e.g. a required blackboard topic was never written).
    StageFailed { stage: String, reason: String },
    /// The run was cancelled by the consumer closing the event stream.
    Cancelled,
}

impl fmt::Display for CoordinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationError::Validation(msg) => write!(f, "validation error: {}", msg),
            CoordinationError::Provider(msg) => write!(f, "provider error: {}", msg),
            CoordinationError::StageFailed { stage, reason } => {
                write!(f, "stage '{}' failed: {}", stage, reason)
            }
            CoordinationError::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl Error for CoordinationError {}

impl From<Box<dyn Error + Send + Sync>> for CoordinationError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        CoordinationError::Provider(e.to_string())
    }
}
