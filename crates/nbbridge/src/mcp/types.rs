use std::collections::{BTreeMap, HashMap};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::{ExecutionState, VariableInfo};
use crate::protocol::{Cell, CellType, NotebookInfo};

// ── Params ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ListNotebooksParams {
    /// Talk to this instance instead of the configured one.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Talk to the instance listening on this port.
    #[serde(default)]
    pub port: Option<u16>,
}

/// Targets a notebook; the active notebook when `notebook_path` is absent.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct NotebookParams {
    #[serde(default)]
    pub notebook_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CellParams {
    pub cell_index: usize,
    #[serde(default)]
    pub notebook_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct InsertCellParams {
    /// Position of the new cell; equal to the cell count to append.
    pub cell_index: usize,
    pub source: String,
    /// `code` (default) or `markdown`.
    #[serde(default)]
    pub cell_type: Option<String>,
    #[serde(default)]
    pub notebook_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateCellParams {
    pub cell_index: usize,
    pub source: String,
    #[serde(default)]
    pub notebook_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MoveCellParams {
    pub from_index: usize,
    pub to_index: usize,
    #[serde(default)]
    pub notebook_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteCellParams {
    pub cell_index: usize,
    #[serde(default)]
    pub notebook_path: Option<String>,
    /// Seconds to wait for the kernel (default 30). The run continues past it.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteCodeParams {
    pub code: String,
    #[serde(default)]
    pub notebook_path: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ClearOutputsParams {
    /// Clear one cell; all code cells when absent.
    #[serde(default)]
    pub cell_index: Option<usize>,
    #[serde(default)]
    pub notebook_path: Option<String>,
}

// ── Responses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListNotebooksResponse {
    pub notebooks: Vec<NotebookInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActiveNotebookResponse {
    pub notebook: Option<NotebookInfo>,
    /// True when nothing was focused and the first open notebook was chosen.
    pub is_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NotebookContentResponse {
    pub path: String,
    pub cell_count: usize,
    pub cells: Vec<Cell>,
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CellResponse {
    pub cell: Cell,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MutationResponse {
    pub success: bool,
    pub operation: String,
    pub cell_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<Cell>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub status: ExecutionState,
    pub outputs: Vec<Value>,
    pub execution_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InterruptResponse {
    pub kernel_id: String,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VariablesResponse {
    pub variables: HashMap<String, VariableInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CellOutputsResponse {
    pub cell_index: usize,
    pub cell_type: CellType,
    pub outputs: Vec<Value>,
    pub execution_count: Option<i64>,
}

/// Which outputs were cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Cleared {
    All(AllMarker),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AllMarker {
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClearOutputsResponse {
    pub success: bool,
    pub cleared: Cleared,
}
