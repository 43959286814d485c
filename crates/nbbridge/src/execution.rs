//! Execution Proxy: runs code on a host's kernel and tracks each run.
//!
//! `submit` returns an `ExecutionHandle` immediately. A background task
//! waits for the kernel's previous run to finish (one run per kernel at a
//! time), sends the request, and folds the host's event stream into a
//! `watch` channel that every clone of the handle observes. Callers `wait` with a timeout; giving
//! up does not cancel the run, which keeps going and is still recorded as
//! the kernel's last execution.
//!
//! Only the host's `Finished` event settles a run, so an acknowledged
//! interrupt that crosses a completion leaves the run `Completed`. The first
//! terminal state wins; a channel that closes before `Finished` settles the
//! run as `Lost`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use uuid::Uuid;

use crate::document::unexpected;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{ExecutionEvent, ExecutionStatus, KernelState, Request, Response};
use crate::registry::InstanceSelector;
use crate::session::SessionConnector;

/// Lifecycle of one execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Submitted,
    Running,
    Completed,
    Errored,
    Interrupted,
    /// The control channel dropped before the kernel reported completion.
    Lost,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Errored | Self::Interrupted | Self::Lost
        )
    }
}

impl From<ExecutionStatus> for ExecutionState {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed => Self::Completed,
            ExecutionStatus::Errored => Self::Errored,
            ExecutionStatus::Interrupted => Self::Interrupted,
            ExecutionStatus::Lost => Self::Lost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionState,
    pub outputs: Vec<Value>,
    pub execution_count: Option<i64>,
}

impl ExecutionResult {
    /// `Ok` for a completed run, otherwise the matching typed failure. Partial
    /// outputs travel with the failure.
    pub fn into_outcome(self, instance_id: &str) -> BridgeResult<ExecutionResult> {
        match self.status {
            ExecutionState::Completed => Ok(self),
            ExecutionState::Errored => {
                let error = self
                    .outputs
                    .iter()
                    .rev()
                    .find(|o| o["output_type"] == "error")
                    .cloned()
                    .unwrap_or(Value::Null);
                let text = |key: &str, default: &str| {
                    error[key].as_str().unwrap_or(default).to_string()
                };
                let traceback = error["traceback"]
                    .as_array()
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(|l| l.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                Err(BridgeError::KernelError {
                    ename: text("ename", "ExecutionError"),
                    evalue: text("evalue", "execution failed"),
                    traceback,
                    outputs: self.outputs,
                })
            }
            ExecutionState::Interrupted => Err(BridgeError::Interrupted {
                execution_id: self.execution_id,
                outputs: self.outputs,
            }),
            ExecutionState::Lost | ExecutionState::Submitted | ExecutionState::Running => {
                Err(BridgeError::ConnectionLost {
                    instance_id: instance_id.to_string(),
                    reason: format!(
                        "execution {} was lost before it finished",
                        self.execution_id
                    ),
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Progress {
    state: ExecutionState,
    outputs: Vec<Value>,
    execution_count: Option<i64>,
    /// Set when the request could not be submitted at all.
    failure: Option<BridgeError>,
}

impl Progress {
    fn settled(&self) -> bool {
        self.state.is_terminal() || self.failure.is_some()
    }
}

/// Moves to `state` unless a terminal state was reached first.
fn settle(tx: &watch::Sender<Progress>, state: ExecutionState) -> bool {
    tx.send_if_modified(|p| {
        if p.settled() {
            false
        } else {
            p.state = state;
            true
        }
    })
}

/// The last execution submitted to a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub status: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KernelStatusReport {
    pub kernel_id: String,
    pub execution_state: KernelState,
    pub is_alive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<ExecutionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VariableInfo {
    #[serde(rename = "type")]
    pub type_name: String,
    pub repr: String,
}

#[derive(Clone)]
struct ExecutionRecord {
    execution_id: String,
    tx: Arc<watch::Sender<Progress>>,
}

/// Runs code on kernels behind the session connector.
#[derive(Clone)]
pub struct ExecutionProxy {
    connector: Arc<SessionConnector>,
    kernels: Arc<Mutex<HashMap<String, KernelQueue>>>,
}

/// Per-kernel bookkeeping. `tail` fires when the most recently submitted
/// run releases the kernel.
#[derive(Default)]
struct KernelQueue {
    tail: Option<oneshot::Receiver<()>>,
    last: Option<ExecutionRecord>,
}

/// A submitted execution. Clones observe the same run.
#[derive(Clone)]
pub struct ExecutionHandle {
    execution_id: String,
    kernel_id: String,
    selector: Option<InstanceSelector>,
    instance_id: String,
    rx: watch::Receiver<Progress>,
    proxy: ExecutionProxy,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Wait for a terminal state, whatever it is.
    ///
    /// `TimedOut` when `timeout` elapses first; the run keeps going.
    pub async fn wait_settled(&self, timeout: Duration) -> BridgeResult<ExecutionResult> {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(timeout, async {
            // A dropped sender still leaves the last value readable.
            let _ = rx.wait_for(Progress::settled).await;
            rx.borrow().clone()
        })
        .await;

        let progress = match waited {
            Ok(progress) => progress,
            Err(_) => {
                return Err(BridgeError::TimedOut {
                    execution_id: self.execution_id.clone(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        };
        if let Some(failure) = progress.failure {
            return Err(failure);
        }
        let status = if progress.state.is_terminal() {
            progress.state
        } else {
            ExecutionState::Lost
        };
        Ok(ExecutionResult {
            execution_id: self.execution_id.clone(),
            status,
            outputs: progress.outputs,
            execution_count: progress.execution_count,
        })
    }

    /// Wait for the run and convert non-completed states into failures.
    pub async fn wait(&self, timeout: Duration) -> BridgeResult<ExecutionResult> {
        self.wait_settled(timeout)
            .await?
            .into_outcome(&self.instance_id)
    }

    /// Ask the kernel to interrupt this run. Returns whether the kernel
    /// acknowledged.
    pub async fn cancel(&self) -> BridgeResult<bool> {
        self.proxy
            .interrupt_kernel(self.selector.as_ref(), &self.kernel_id)
            .await
    }
}

impl ExecutionProxy {
    pub fn new(connector: Arc<SessionConnector>) -> Self {
        Self {
            connector,
            kernels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue `code` on `kernel_id`. Runs on the same kernel execute in
    /// submission order, one at a time.
    pub async fn submit(
        &self,
        selector: Option<&InstanceSelector>,
        kernel_id: &str,
        code: &str,
    ) -> BridgeResult<ExecutionHandle> {
        let instance_id = self.connector.resolve(selector).await?.instance_id;
        let execution_id = Uuid::new_v4().to_string();
        let (tx, rx) = watch::channel(Progress {
            state: ExecutionState::Submitted,
            outputs: Vec::new(),
            execution_count: None,
            failure: None,
        });
        let tx = Arc::new(tx);

        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            tx: tx.clone(),
        };

        // Chain behind the previous run so submission order is run order.
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let previous = {
            let mut kernels = self.kernels.lock().await;
            let queue = kernels.entry(kernel_id.to_string()).or_default();
            queue.last = Some(record);
            queue.tail.replace(release_rx)
        };

        let task = RunTask {
            connector: self.connector.clone(),
            selector: selector.cloned(),
            kernel_id: kernel_id.to_string(),
            execution_id: execution_id.clone(),
            code: code.to_string(),
            tx,
        };
        tokio::spawn(async move {
            if let Some(previous) = previous {
                // Err means the previous task ended, which also frees the kernel.
                let _ = previous.await;
            }
            task.run().await;
            let _ = release_tx.send(());
        });

        Ok(ExecutionHandle {
            execution_id,
            kernel_id: kernel_id.to_string(),
            selector: selector.cloned(),
            instance_id,
            rx,
            proxy: self.clone(),
        })
    }

    /// Submit and wait up to `timeout`.
    pub async fn execute_code(
        &self,
        selector: Option<&InstanceSelector>,
        kernel_id: &str,
        code: &str,
        timeout: Duration,
    ) -> BridgeResult<ExecutionResult> {
        self.submit(selector, kernel_id, code)
            .await?
            .wait(timeout)
            .await
    }

    /// Interrupt whatever runs on `kernel_id`.
    ///
    /// The acknowledgement does not settle anything here: the run becomes
    /// `Interrupted` only if the host reports it finished that way.
    pub async fn interrupt_kernel(
        &self,
        selector: Option<&InstanceSelector>,
        kernel_id: &str,
    ) -> BridgeResult<bool> {
        let request = Request::Interrupt {
            kernel_id: kernel_id.to_string(),
        };
        let acknowledged = match self.connector.request(selector, request).await? {
            Response::InterruptSent { acknowledged, .. } => acknowledged,
            other => return Err(unexpected(other)),
        };
        if acknowledged {
            info!("[execution] Interrupt acknowledged by {}", kernel_id);
        }
        Ok(acknowledged)
    }

    /// Host-reported kernel state plus this proxy's last run on it.
    pub async fn kernel_status(
        &self,
        selector: Option<&InstanceSelector>,
        kernel_id: &str,
    ) -> BridgeResult<KernelStatusReport> {
        let request = Request::KernelStatus {
            kernel_id: kernel_id.to_string(),
        };
        let (execution_state, is_alive) = match self.connector.request(selector, request).await? {
            Response::KernelStatus {
                execution_state,
                is_alive,
                ..
            } => (execution_state, is_alive),
            other => return Err(unexpected(other)),
        };

        let last_execution = self
            .kernels
            .lock()
            .await
            .get(kernel_id)
            .and_then(|q| q.last.as_ref())
            .map(|record| ExecutionSummary {
                execution_id: record.execution_id.clone(),
                status: record.tx.borrow().state,
            });

        Ok(KernelStatusReport {
            kernel_id: kernel_id.to_string(),
            execution_state,
            is_alive,
            last_execution,
        })
    }

    /// Names, types and reprs of the user variables in the kernel namespace.
    pub async fn list_variables(
        &self,
        selector: Option<&InstanceSelector>,
        kernel_id: &str,
        timeout: Duration,
    ) -> BridgeResult<HashMap<String, VariableInfo>> {
        let result = match self
            .execute_code(selector, kernel_id, INTROSPECTION_SNIPPET, timeout)
            .await
        {
            Ok(result) => result,
            Err(BridgeError::KernelError { ename, evalue, .. }) => {
                return Err(BridgeError::IntrospectionFailed {
                    reason: format!("{}: {}", ename, evalue),
                })
            }
            Err(e) => return Err(e),
        };
        parse_variables(&result.outputs)
    }
}

/// Background half of one execution.
struct RunTask {
    connector: Arc<SessionConnector>,
    selector: Option<InstanceSelector>,
    kernel_id: String,
    execution_id: String,
    code: String,
    tx: Arc<watch::Sender<Progress>>,
}

impl RunTask {
    async fn run(self) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let request = Request::Execute {
            kernel_id: self.kernel_id.clone(),
            execution_id: self.execution_id.clone(),
            code: self.code.clone(),
        };

        let accepted = self
            .connector
            .request_with_events(self.selector.as_ref(), request, Some(events_tx))
            .await;
        match accepted {
            Ok(Response::ExecutionAccepted { .. }) => {
                settle(&self.tx, ExecutionState::Running);
            }
            Ok(other) => return self.fail(unexpected(other)),
            Err(e) => return self.fail(e),
        }
        debug!(
            "[execution] {} running on {}",
            self.execution_id, self.kernel_id
        );

        // Drain until the kernel is done. The next queued run waits for this
        // loop, even after a caller timed out or an interrupt settled the
        // handle.
        while let Some(event) = events_rx.recv().await {
            match event {
                ExecutionEvent::Started {
                    execution_count, ..
                } => {
                    self.tx.send_if_modified(|p| {
                        if p.settled() {
                            return false;
                        }
                        p.execution_count = execution_count;
                        true
                    });
                }
                ExecutionEvent::Output { output, .. } => {
                    self.tx.send_if_modified(|p| {
                        if p.settled() {
                            return false;
                        }
                        p.outputs.push(output);
                        true
                    });
                }
                ExecutionEvent::Finished {
                    status,
                    execution_count,
                    ..
                } => {
                    self.tx.send_if_modified(|p| {
                        if p.settled() {
                            return false;
                        }
                        p.state = status.into();
                        if execution_count.is_some() {
                            p.execution_count = execution_count;
                        }
                        true
                    });
                    debug!("[execution] {} finished: {:?}", self.execution_id, status);
                    return;
                }
            }
        }

        if settle(&self.tx, ExecutionState::Lost) {
            warn!(
                "[execution] Lost track of {} on {}",
                self.execution_id, self.kernel_id
            );
        }
    }

    fn fail(&self, error: BridgeError) {
        warn!(
            "[execution] Could not submit {} to {}: {}",
            self.execution_id, self.kernel_id, error
        );
        self.tx.send_if_modified(|p| {
            if p.settled() {
                return false;
            }
            p.failure = Some(error);
            true
        });
    }
}

/// Runs inside a function so no helper names leak into the user namespace.
const INTROSPECTION_SNIPPET: &str = r#"def __nbbridge_list_variables():
    import json
    ns = globals()
    found = {}
    for name, value in list(ns.items()):
        if name.startswith('_') or name in ('In', 'Out', 'exit', 'quit', 'get_ipython'):
            continue
        if type(value).__name__ in ('module', 'function', 'builtin_function_or_method', 'type'):
            continue
        try:
            found[name] = {'type': type(value).__name__, 'repr': repr(value)[:100]}
        except Exception:
            pass
    print(json.dumps(found))
__nbbridge_list_variables()
del __nbbridge_list_variables
"#;

/// Parse the snippet's stdout (possibly split over several stream outputs).
fn parse_variables(outputs: &[Value]) -> BridgeResult<HashMap<String, VariableInfo>> {
    let stdout: String = outputs
        .iter()
        .filter(|o| o["output_type"] == "stream" && o["name"] == "stdout")
        .filter_map(|o| match &o["text"] {
            Value::String(text) => Some(text.clone()),
            Value::Array(lines) => Some(
                lines
                    .iter()
                    .filter_map(|l| l.as_str())
                    .collect::<String>(),
            ),
            _ => None,
        })
        .collect();

    serde_json::from_str(stdout.trim()).map_err(|e| BridgeError::IntrospectionFailed {
        reason: format!("could not parse variable listing: {}", e),
    })
}
