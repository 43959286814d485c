//! Failure taxonomy shared by the bridge and the instance host.
//!
//! `BridgeError` is serialized as-is on the control channel, so a typed
//! failure raised on the host (an out-of-range index, an unknown kernel)
//! reaches the tool surface without being flattened into a string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every failure a tool call can surface.
///
/// Serialized with a `kind` tag so the same value can travel over the
/// control channel and be attached to MCP error payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeError {
    /// No matching instance, notebook, cell or kernel.
    #[error("{what} not found")]
    NotFound { what: String },

    /// More than one instance is running and the selector named none of them.
    #[error("{} instances are running ({}); pass an instance id or port", .candidates.len(), .candidates.join(", "))]
    AmbiguousInstance { candidates: Vec<String> },

    /// The transport could not be opened within the connect timeout.
    #[error("instance at {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// The instance rejected our credentials during the handshake.
    #[error("instance {instance_id} rejected the connection credentials")]
    Unauthorized { instance_id: String },

    /// The channel dropped and the transparent retry failed as well.
    #[error("connection to instance {instance_id} lost: {reason}")]
    ConnectionLost { instance_id: String, reason: String },

    #[error("cell index {index} out of range ({len} cells)")]
    IndexOutOfRange { index: usize, len: usize },

    /// The caller stopped waiting; the kernel request keeps running.
    #[error("execution {execution_id} still running after {waited_ms} ms")]
    TimedOut { execution_id: String, waited_ms: u64 },

    #[error("execution {execution_id} was interrupted")]
    Interrupted {
        execution_id: String,
        outputs: Vec<Value>,
    },

    #[error("variable introspection failed: {reason}")]
    IntrospectionFailed { reason: String },

    /// Code raised inside the kernel. `ename`/`evalue`/`traceback` are the
    /// kernel's own text; `outputs` holds everything produced before the error.
    #[error("{ename}: {evalue}")]
    KernelError {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
        outputs: Vec<Value>,
    },

    #[error("invalid parameters: {reason}")]
    InvalidParams { reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },
}

impl BridgeError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl ToString) -> Self {
        Self::Protocol {
            reason: reason.to_string(),
        }
    }

    /// Stable name of the failure kind, matching the serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AmbiguousInstance { .. } => "ambiguous_instance",
            Self::Unreachable { .. } => "unreachable",
            Self::Unauthorized { .. } => "unauthorized",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::IndexOutOfRange { .. } => "index_out_of_range",
            Self::TimedOut { .. } => "timed_out",
            Self::Interrupted { .. } => "interrupted",
            Self::IntrospectionFailed { .. } => "introspection_failed",
            Self::KernelError { .. } => "kernel_error",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Protocol { .. } => "protocol",
        }
    }

    /// Transport failures are the ones the session connector retries.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::ConnectionLost { .. }
        )
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
