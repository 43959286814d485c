//! Document Bridge: cell-level reads and writes against a host's notebook.
//!
//! Every mutation is sent as one `CellOp`, which the host applies to its
//! Automerge document under the room lock. The bridge never ships a whole
//! notebook back, so a human's concurrent keystrokes are merged instead of
//! overwritten.
//!
//! Mutations against the same notebook are additionally serialized here,
//! per `(instance, path)`, so that a caller's read-then-write sequence made
//! through `with_notebook_lock` cannot interleave with another tool call.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{
    Cell, CellOp, CellType, MutationResult, NotebookInfo, NotebookSnapshot, Request, Response,
};
use crate::registry::InstanceSelector;
use crate::session::SessionConnector;

/// The notebook a tool call resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveNotebookInfo {
    pub notebook: Option<NotebookInfo>,
    pub is_fallback: bool,
}

pub struct DocumentBridge {
    connector: Arc<SessionConnector>,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl DocumentBridge {
    pub fn new(connector: Arc<SessionConnector>) -> Self {
        Self {
            connector,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn connector(&self) -> &Arc<SessionConnector> {
        &self.connector
    }

    // ── Discovery ───────────────────────────────────────────────────

    pub async fn list_notebooks(
        &self,
        selector: Option<&InstanceSelector>,
    ) -> BridgeResult<Vec<NotebookInfo>> {
        match self.connector.request(selector, Request::ListNotebooks).await? {
            Response::Notebooks { notebooks } => Ok(notebooks),
            other => Err(unexpected(other)),
        }
    }

    pub async fn active_notebook(
        &self,
        selector: Option<&InstanceSelector>,
    ) -> BridgeResult<ActiveNotebookInfo> {
        match self
            .connector
            .request(selector, Request::GetActiveNotebook)
            .await?
        {
            Response::ActiveNotebook {
                notebook,
                is_fallback,
            } => Ok(ActiveNotebookInfo {
                notebook,
                is_fallback,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// The notebook named by `path`, or the active one.
    pub async fn resolve_notebook(
        &self,
        selector: Option<&InstanceSelector>,
        path: Option<&str>,
    ) -> BridgeResult<NotebookInfo> {
        match path {
            Some(path) => self
                .list_notebooks(selector)
                .await?
                .into_iter()
                .find(|nb| nb.path == path)
                .ok_or_else(|| BridgeError::not_found(format!("notebook {}", path))),
            None => self
                .active_notebook(selector)
                .await?
                .notebook
                .ok_or_else(|| BridgeError::not_found("open notebook")),
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// All cells, read at one logical time on the host.
    pub async fn get_content(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
    ) -> BridgeResult<NotebookSnapshot> {
        let request = Request::GetContent {
            path: path.to_string(),
        };
        match self.connector.request(selector, request).await? {
            Response::Content { snapshot } => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_cell(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        index: usize,
    ) -> BridgeResult<Cell> {
        let snapshot = self.get_content(selector, path).await?;
        let len = snapshot.cells.len();
        snapshot
            .cells
            .into_iter()
            .nth(index)
            .ok_or(BridgeError::IndexOutOfRange { index, len })
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Hold the notebook's mutation lock for a compound operation.
    pub async fn with_notebook_lock(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
    ) -> BridgeResult<OwnedMutexGuard<()>> {
        let instance_id = self.connector.resolve(selector).await?.instance_id;
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry((instance_id, path.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        Ok(lock.lock_owned().await)
    }

    async fn mutate(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        op: CellOp,
    ) -> BridgeResult<MutationResult> {
        let _guard = self.with_notebook_lock(selector, path).await?;
        self.mutate_locked(selector, path, op).await
    }

    /// Apply `op` while the caller already holds the notebook's lock.
    pub async fn mutate_locked(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        op: CellOp,
    ) -> BridgeResult<MutationResult> {
        let operation = op.name();
        let request = Request::Mutate {
            path: path.to_string(),
            op,
        };
        match self.connector.request(selector, request).await? {
            Response::Mutated { result } => {
                debug!(
                    "[document] {} on {} ({} cells)",
                    operation, path, result.cell_count
                );
                Ok(result)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Insert a cell before `index`; `index` equal to the cell count appends.
    pub async fn insert_cell(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        index: usize,
        cell_type: CellType,
        source: &str,
    ) -> BridgeResult<Cell> {
        self.insert(selector, path, index, cell_type, source)
            .await?
            .cell
            .ok_or_else(|| BridgeError::protocol("insert returned no cell"))
    }

    /// Like `insert_cell`, keeping the host's cell count.
    pub async fn insert(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        index: usize,
        cell_type: CellType,
        source: &str,
    ) -> BridgeResult<MutationResult> {
        let op = CellOp::Insert {
            index,
            cell_type,
            source: source.to_string(),
        };
        self.mutate(selector, path, op).await
    }

    /// Replace a cell's source. Outputs and execution count stay as they are.
    pub async fn update_cell(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        index: usize,
        source: &str,
    ) -> BridgeResult<MutationResult> {
        let op = CellOp::UpdateSource {
            index,
            source: source.to_string(),
        };
        self.mutate(selector, path, op).await
    }

    pub async fn delete_cell(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        index: usize,
    ) -> BridgeResult<MutationResult> {
        self.mutate(selector, path, CellOp::Delete { index }).await
    }

    /// Move one cell as a single operation.
    pub async fn move_cell(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        from: usize,
        to: usize,
    ) -> BridgeResult<MutationResult> {
        self.mutate(selector, path, CellOp::Move { from, to }).await
    }

    /// Clear one code cell's outputs, or all of them when `index` is `None`.
    pub async fn clear_outputs(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        index: Option<usize>,
    ) -> BridgeResult<MutationResult> {
        self.mutate(selector, path, CellOp::ClearOutputs { index })
            .await
    }

    /// Store an execution result on the cell with `cell_id`.
    pub async fn write_result(
        &self,
        selector: Option<&InstanceSelector>,
        path: &str,
        cell_id: &str,
        outputs: Vec<Value>,
        execution_count: Option<i64>,
    ) -> BridgeResult<MutationResult> {
        let op = CellOp::WriteResult {
            cell_id: cell_id.to_string(),
            outputs,
            execution_count,
        };
        self.mutate(selector, path, op).await
    }
}

pub(crate) fn unexpected(response: Response) -> BridgeError {
    BridgeError::protocol(format!("unexpected response: {:?}", response))
}
