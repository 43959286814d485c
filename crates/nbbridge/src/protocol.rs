//! Control-channel protocol between the bridge and an instance host.
//!
//! Frames are JSON, sent over length-prefixed frames (see `connection.rs`).
//! The bridge sends `ClientFrame`s; the host answers each with a
//! `ServerFrame::Response` carrying the same id and pushes execution
//! progress as `ServerFrame::Event`s.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

// ============================================================================
// Notebook model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl CellType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellType::Code => "code",
            CellType::Markdown => "markdown",
            CellType::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(CellType::Code),
            "markdown" => Some(CellType::Markdown),
            "raw" => Some(CellType::Raw),
            _ => None,
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cell as read from the document at one logical time.
///
/// `index` is positional and only valid until the next mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Cell {
    pub index: usize,
    pub id: String,
    pub cell_type: CellType,
    pub source: String,
    /// nbformat output objects, code cells only.
    #[serde(default)]
    pub outputs: Vec<Value>,
    pub execution_count: Option<i64>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NotebookSnapshot {
    pub path: String,
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// An open notebook on an instance, with the kernel attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NotebookInfo {
    pub path: String,
    pub name: String,
    pub kernel_id: Option<String>,
    pub kernel_name: Option<String>,
}

// ============================================================================
// Document operations
// ============================================================================

/// One incremental operation against a notebook document.
///
/// Indices are resolved by the host against the live document at the
/// moment the op is applied, never against a snapshot the client read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CellOp {
    Insert {
        index: usize,
        cell_type: CellType,
        source: String,
    },
    UpdateSource {
        index: usize,
        source: String,
    },
    Delete {
        index: usize,
    },
    Move {
        from: usize,
        to: usize,
    },
    /// Clear outputs (and execution counts) of one code cell or all of them.
    ClearOutputs {
        index: Option<usize>,
    },
    /// Write an execution result back into a cell, addressed by id so a
    /// concurrent move does not redirect it.
    WriteResult {
        cell_id: String,
        outputs: Vec<Value>,
        execution_count: Option<i64>,
    },
}

impl CellOp {
    pub fn name(&self) -> &'static str {
        match self {
            CellOp::Insert { .. } => "insert",
            CellOp::UpdateSource { .. } => "update",
            CellOp::Delete { .. } => "delete",
            CellOp::Move { .. } => "move",
            CellOp::ClearOutputs { .. } => "clear_outputs",
            CellOp::WriteResult { .. } => "write_result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MutationResult {
    pub success: bool,
    pub operation: String,
    pub cell_count: usize,
    /// The inserted cell, for `insert`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<Cell>,
}

// ============================================================================
// Kernel state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    Idle,
    Busy,
    Dead,
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelState::Idle => write!(f, "idle"),
            KernelState::Busy => write!(f, "busy"),
            KernelState::Dead => write!(f, "dead"),
        }
    }
}

/// How a kernel run ended, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Errored,
    Interrupted,
    /// The kernel died before the run finished.
    Lost,
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Requests the bridge (or an editor UI) can send on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,

    /// Number of connected control clients, for the editor's status display.
    Status,

    ListNotebooks,

    GetActiveNotebook,

    /// Sent by the editor UI whenever the human's focus changes.
    SetActiveNotebook { path: Option<String> },

    GetContent { path: String },

    Mutate { path: String, op: CellOp },

    /// Start a kernel run. Progress arrives as `ExecutionEvent`s tagged with
    /// `execution_id`.
    Execute {
        kernel_id: String,
        execution_id: String,
        code: String,
    },

    Interrupt { kernel_id: String },

    KernelStatus { kernel_id: String },
}

impl Request {
    /// Requests that can be replayed after a reconnect without side effects.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Request::Ping
                | Request::Status
                | Request::ListNotebooks
                | Request::GetActiveNotebook
                | Request::GetContent { .. }
                | Request::KernelStatus { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,

    Status {
        status: String,
        connected_clients: usize,
    },

    Notebooks {
        notebooks: Vec<NotebookInfo>,
    },

    ActiveNotebook {
        notebook: Option<NotebookInfo>,
        is_fallback: bool,
    },

    Content {
        snapshot: NotebookSnapshot,
    },

    Mutated {
        result: MutationResult,
    },

    ExecutionAccepted {
        execution_id: String,
    },

    /// `acknowledged` is true when the kernel confirmed the interrupt.
    InterruptSent {
        kernel_id: String,
        acknowledged: bool,
    },

    KernelStatus {
        kernel_id: String,
        execution_state: KernelState,
        is_alive: bool,
    },

    Ok,

    Error {
        error: BridgeError,
    },
}

/// Progress of one kernel run, pushed by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        execution_id: String,
        execution_count: Option<i64>,
    },
    Output {
        execution_id: String,
        output: Value,
    },
    Finished {
        execution_id: String,
        status: ExecutionStatus,
        execution_count: Option<i64>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::Output { execution_id, .. }
            | ExecutionEvent::Finished { execution_id, .. } => execution_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Response { id: u64, response: Response },
    Event { event: ExecutionEvent },
}
