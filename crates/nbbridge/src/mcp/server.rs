use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::{Json, Parameters};
use rmcp::model::{ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData, ServerHandler, ServiceExt};

use crate::document::DocumentBridge;
use crate::error::BridgeError;
use crate::execution::{
    ExecutionHandle, ExecutionProxy, ExecutionResult, ExecutionState, KernelStatusReport,
};
use crate::protocol::{Cell, CellType, MutationResult, NotebookInfo};
use crate::registry::InstanceSelector;
use crate::session::SessionConnector;
use crate::DEFAULT_EXECUTION_TIMEOUT;

use super::types::*;

/// How long a timed-out `execute_cell` keeps waiting in the background to
/// write its result into the cell.
const BACKGROUND_WRITE_BACK_LIMIT: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct NotebookTools {
    documents: Arc<DocumentBridge>,
    executions: ExecutionProxy,
    execution_timeout: Duration,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl NotebookTools {
    pub fn new(connector: Arc<SessionConnector>) -> Self {
        Self {
            documents: Arc::new(DocumentBridge::new(connector.clone())),
            executions: ExecutionProxy::new(connector),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            tool_router: Self::tool_router(),
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub async fn serve_stdio(self) -> Result<(), rmcp::RmcpError> {
        let service = self.serve((tokio::io::stdin(), tokio::io::stdout())).await?;
        service.waiting().await?;
        Ok(())
    }

    /// List the notebooks open in the notebook server.
    #[tool(name = "list_notebooks")]
    pub async fn list_notebooks(
        &self,
        params: Parameters<ListNotebooksParams>,
    ) -> Result<Json<ListNotebooksResponse>, ErrorData> {
        let ListNotebooksParams { instance_id, port } = params.0;
        let selector = InstanceSelector { instance_id, port };
        let selector = (!selector.is_empty()).then_some(selector);
        let notebooks = self
            .documents
            .list_notebooks(selector.as_ref())
            .await
            .map_err(to_error_data)?;
        Ok(Json(ListNotebooksResponse { notebooks }))
    }

    /// The notebook the human is looking at.
    #[tool(name = "get_active_notebook")]
    pub async fn get_active_notebook(&self) -> Result<Json<ActiveNotebookResponse>, ErrorData> {
        let active = self
            .documents
            .active_notebook(None)
            .await
            .map_err(to_error_data)?;
        Ok(Json(ActiveNotebookResponse {
            notebook: active.notebook,
            is_fallback: active.is_fallback,
        }))
    }

    /// All cells of a notebook with their outputs.
    #[tool(name = "get_notebook_content")]
    pub async fn get_notebook_content(
        &self,
        params: Parameters<NotebookParams>,
    ) -> Result<Json<NotebookContentResponse>, ErrorData> {
        let notebook = self.notebook(params.0.notebook_path).await?;
        let snapshot = self
            .documents
            .get_content(None, &notebook.path)
            .await
            .map_err(to_error_data)?;
        Ok(Json(NotebookContentResponse {
            path: snapshot.path,
            cell_count: snapshot.cells.len(),
            cells: snapshot.cells,
            metadata: snapshot.metadata,
        }))
    }

    #[tool(name = "get_cell")]
    pub async fn get_cell(
        &self,
        params: Parameters<CellParams>,
    ) -> Result<Json<CellResponse>, ErrorData> {
        let CellParams {
            cell_index,
            notebook_path,
        } = params.0;
        let cell = self.cell(notebook_path, cell_index).await?.1;
        Ok(Json(CellResponse { cell }))
    }

    /// Insert a code or markdown cell. Later cells shift down by one.
    #[tool(name = "insert_cell")]
    pub async fn insert_cell(
        &self,
        params: Parameters<InsertCellParams>,
    ) -> Result<Json<MutationResponse>, ErrorData> {
        let InsertCellParams {
            cell_index,
            source,
            cell_type,
            notebook_path,
        } = params.0;
        let cell_type = match cell_type.as_deref() {
            None | Some("code") => CellType::Code,
            Some("markdown") => CellType::Markdown,
            Some(other) => {
                return Err(to_error_data(BridgeError::invalid_params(format!(
                    "cell_type must be \"code\" or \"markdown\", got {:?}",
                    other
                ))))
            }
        };
        let notebook = self.notebook(notebook_path).await?;
        let result = self
            .documents
            .insert(None, &notebook.path, cell_index, cell_type, &source)
            .await
            .map_err(to_error_data)?;
        Ok(Json(mutation_response(result)))
    }

    /// Replace a cell's source. Outputs stay until the cell is run again.
    #[tool(name = "update_cell")]
    pub async fn update_cell(
        &self,
        params: Parameters<UpdateCellParams>,
    ) -> Result<Json<MutationResponse>, ErrorData> {
        let UpdateCellParams {
            cell_index,
            source,
            notebook_path,
        } = params.0;
        let notebook = self.notebook(notebook_path).await?;
        let result = self
            .documents
            .update_cell(None, &notebook.path, cell_index, &source)
            .await
            .map_err(to_error_data)?;
        Ok(Json(mutation_response(result)))
    }

    /// Delete a cell. Later cells shift up by one.
    #[tool(name = "delete_cell")]
    pub async fn delete_cell(
        &self,
        params: Parameters<CellParams>,
    ) -> Result<Json<MutationResponse>, ErrorData> {
        let CellParams {
            cell_index,
            notebook_path,
        } = params.0;
        let notebook = self.notebook(notebook_path).await?;
        let result = self
            .documents
            .delete_cell(None, &notebook.path, cell_index)
            .await
            .map_err(to_error_data)?;
        Ok(Json(mutation_response(result)))
    }

    #[tool(name = "move_cell")]
    pub async fn move_cell(
        &self,
        params: Parameters<MoveCellParams>,
    ) -> Result<Json<MutationResponse>, ErrorData> {
        let MoveCellParams {
            from_index,
            to_index,
            notebook_path,
        } = params.0;
        let notebook = self.notebook(notebook_path).await?;
        let result = self
            .documents
            .move_cell(None, &notebook.path, from_index, to_index)
            .await
            .map_err(to_error_data)?;
        Ok(Json(mutation_response(result)))
    }

    /// Run a code cell on the notebook's kernel and store the result in it.
    #[tool(name = "execute_cell")]
    pub async fn execute_cell(
        &self,
        params: Parameters<ExecuteCellParams>,
    ) -> Result<Json<ExecutionResponse>, ErrorData> {
        let ExecuteCellParams {
            cell_index,
            notebook_path,
            timeout_secs,
        } = params.0;
        let (notebook, cell) = self.cell(notebook_path, cell_index).await?;
        if cell.cell_type != CellType::Code {
            return Err(to_error_data(BridgeError::invalid_params(format!(
                "cell {} is a {} cell",
                cell_index, cell.cell_type
            ))));
        }
        let kernel_id = kernel_for(&notebook)?;
        let handle = self
            .executions
            .submit(None, &kernel_id, &cell.source)
            .await
            .map_err(to_error_data)?;

        match handle.wait_settled(self.timeout(timeout_secs)).await {
            Ok(result) => {
                write_result(&self.documents, &notebook.path, &cell.id, &result).await;
                let result = result
                    .into_outcome(handle.instance_id())
                    .map_err(to_error_data)?;
                Ok(Json(execution_response(result, Some(cell_index))))
            }
            Err(err @ BridgeError::TimedOut { .. }) => {
                self.write_back_later(handle, notebook.path, cell.id);
                Err(to_error_data(err))
            }
            Err(err) => Err(to_error_data(err)),
        }
    }

    /// Run code on the notebook's kernel without touching any cell.
    #[tool(name = "execute_code")]
    pub async fn execute_code(
        &self,
        params: Parameters<ExecuteCodeParams>,
    ) -> Result<Json<ExecutionResponse>, ErrorData> {
        let ExecuteCodeParams {
            code,
            notebook_path,
            timeout_secs,
        } = params.0;
        let kernel_id = self.kernel(notebook_path).await?;
        let result = self
            .executions
            .execute_code(None, &kernel_id, &code, self.timeout(timeout_secs))
            .await
            .map_err(to_error_data)?;
        Ok(Json(execution_response(result, None)))
    }

    #[tool(name = "interrupt_kernel")]
    pub async fn interrupt_kernel(
        &self,
        params: Parameters<NotebookParams>,
    ) -> Result<Json<InterruptResponse>, ErrorData> {
        let kernel_id = self.kernel(params.0.notebook_path).await?;
        let acknowledged = self
            .executions
            .interrupt_kernel(None, &kernel_id)
            .await
            .map_err(to_error_data)?;
        Ok(Json(InterruptResponse {
            kernel_id,
            acknowledged,
        }))
    }

    #[tool(name = "get_kernel_status")]
    pub async fn get_kernel_status(
        &self,
        params: Parameters<NotebookParams>,
    ) -> Result<Json<KernelStatusReport>, ErrorData> {
        let kernel_id = self.kernel(params.0.notebook_path).await?;
        let report = self
            .executions
            .kernel_status(None, &kernel_id)
            .await
            .map_err(to_error_data)?;
        Ok(Json(report))
    }

    /// User variables in the kernel namespace with their types and reprs.
    #[tool(name = "list_variables")]
    pub async fn list_variables(
        &self,
        params: Parameters<NotebookParams>,
    ) -> Result<Json<VariablesResponse>, ErrorData> {
        let kernel_id = self.kernel(params.0.notebook_path).await?;
        let variables = self
            .executions
            .list_variables(None, &kernel_id, self.execution_timeout)
            .await
            .map_err(to_error_data)?;
        Ok(Json(VariablesResponse { variables }))
    }

    #[tool(name = "get_cell_outputs")]
    pub async fn get_cell_outputs(
        &self,
        params: Parameters<CellParams>,
    ) -> Result<Json<CellOutputsResponse>, ErrorData> {
        let CellParams {
            cell_index,
            notebook_path,
        } = params.0;
        let cell = self.cell(notebook_path, cell_index).await?.1;
        Ok(Json(CellOutputsResponse {
            cell_index,
            cell_type: cell.cell_type,
            outputs: cell.outputs,
            execution_count: cell.execution_count,
        }))
    }

    /// Clear outputs and execution counts of one code cell or all of them.
    #[tool(name = "clear_outputs")]
    pub async fn clear_outputs(
        &self,
        params: Parameters<ClearOutputsParams>,
    ) -> Result<Json<ClearOutputsResponse>, ErrorData> {
        let ClearOutputsParams {
            cell_index,
            notebook_path,
        } = params.0;
        let notebook = self.notebook(notebook_path).await?;
        self.documents
            .clear_outputs(None, &notebook.path, cell_index)
            .await
            .map_err(to_error_data)?;
        let cleared = match cell_index {
            Some(index) => Cleared::Index(index),
            None => Cleared::All(AllMarker::All),
        };
        Ok(Json(ClearOutputsResponse {
            success: true,
            cleared,
        }))
    }
}

impl NotebookTools {
    fn timeout(&self, timeout_secs: Option<u64>) -> Duration {
        timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.execution_timeout)
    }

    async fn notebook(&self, path: Option<String>) -> Result<NotebookInfo, ErrorData> {
        self.documents
            .resolve_notebook(None, path.as_deref())
            .await
            .map_err(to_error_data)
    }

    async fn kernel(&self, path: Option<String>) -> Result<String, ErrorData> {
        kernel_for(&self.notebook(path).await?)
    }

    async fn cell(&self, path: Option<String>, index: usize) -> Result<(NotebookInfo, Cell), ErrorData> {
        let notebook = self.notebook(path).await?;
        let cell = self
            .documents
            .get_cell(None, &notebook.path, index)
            .await
            .map_err(to_error_data)?;
        Ok((notebook, cell))
    }

    fn write_back_later(&self, handle: ExecutionHandle, path: String, cell_id: String) {
        let documents = self.documents.clone();
        tokio::spawn(async move {
            match handle.wait_settled(BACKGROUND_WRITE_BACK_LIMIT).await {
                Ok(result) => write_result(&documents, &path, &cell_id, &result).await,
                Err(e) => warn!(
                    "[mcp] Gave up on writing execution {} back: {}",
                    handle.execution_id(),
                    e
                ),
            }
        });
    }
}

/// Store a settled result in its cell. A lost run leaves the cell alone.
async fn write_result(documents: &DocumentBridge, path: &str, cell_id: &str, result: &ExecutionResult) {
    if result.status == ExecutionState::Lost {
        return;
    }
    let written = documents
        .write_result(
            None,
            path,
            cell_id,
            result.outputs.clone(),
            result.execution_count,
        )
        .await;
    match written {
        Ok(_) => info!(
            "[mcp] Wrote execution {} into cell {}",
            result.execution_id, cell_id
        ),
        // The human may have deleted the cell meanwhile.
        Err(e) => warn!("[mcp] Could not write result into cell {}: {}", cell_id, e),
    }
}

fn kernel_for(notebook: &NotebookInfo) -> Result<String, ErrorData> {
    notebook.kernel_id.clone().ok_or_else(|| {
        to_error_data(BridgeError::not_found(format!(
            "kernel for notebook {}",
            notebook.path
        )))
    })
}

fn mutation_response(result: MutationResult) -> MutationResponse {
    MutationResponse {
        success: result.success,
        operation: result.operation,
        cell_count: result.cell_count,
        cell: result.cell,
    }
}

fn execution_response(result: ExecutionResult, cell_index: Option<usize>) -> ExecutionResponse {
    ExecutionResponse {
        execution_id: result.execution_id,
        status: result.status,
        outputs: result.outputs,
        execution_count: result.execution_count,
        cell_index,
    }
}

/// Map a typed failure to an MCP error. `data` carries the failure as-is.
pub fn to_error_data(err: BridgeError) -> ErrorData {
    let message = err.to_string();
    let data = serde_json::to_value(&err).ok();
    match err {
        BridgeError::IndexOutOfRange { .. } | BridgeError::InvalidParams { .. } => {
            ErrorData::invalid_params(message, data)
        }
        BridgeError::NotFound { .. } => ErrorData::resource_not_found(message, data),
        _ => ErrorData::internal_error(message, data),
    }
}

#[tool_handler]
impl ServerHandler for NotebookTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Live notebook bridge (tools: list_notebooks, get_active_notebook, get_notebook_content, get_cell, insert_cell, update_cell, delete_cell, move_cell, execute_cell, execute_code, interrupt_kernel, get_kernel_status, list_variables, get_cell_outputs, clear_outputs). Cell indices are zero-based and shift after every insert, delete and move; re-read before reusing one. Tools without notebook_path act on the notebook the human has focused."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
