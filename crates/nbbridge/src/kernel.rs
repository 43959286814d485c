//! Kernel execution service used by the instance host.
//!
//! `KernelDriver` is the seam between the host and an actual kernel: the
//! host only needs to submit code, stream the outputs back, interrupt, and
//! ask whether the kernel is alive. `JupyterDriver` implements it over the
//! Jupyter wire protocol for a kernel described by a connection file.
//!
//! `KernelSession` wraps a driver with the host-side bookkeeping: one run at
//! a time per kernel, and the kernel's last known execution state. While a
//! run is in flight the session polls the driver's liveness; a kernel that
//! dies mid-run ends the run as `Lost` and frees the kernel for the next one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, ExecutionState, InterruptRequest, JupyterMessage,
    JupyterMessageContent,
};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::protocol::{ExecutionStatus, KernelState};

/// How often a busy kernel's liveness is checked.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Something a running execution produced.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// The kernel accepted the code and assigned it an execution count.
    Started { execution_count: Option<i64> },
    /// One nbformat output object.
    Output(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub execution_count: Option<i64>,
}

/// A kernel the host can run code on.
pub trait KernelDriver: Send + Sync {
    /// Kernel name for display (e.g. `python3`).
    fn kernel_name(&self) -> &str;

    /// Run `code` to completion, sending events as they arrive.
    fn execute(
        &self,
        code: String,
        events: mpsc::UnboundedSender<KernelEvent>,
    ) -> BoxFuture<'_, Result<ExecutionOutcome>>;

    /// Ask the kernel to stop the current run. Resolves to whether the kernel
    /// acknowledged the request.
    fn interrupt(&self) -> BoxFuture<'_, Result<bool>>;

    fn is_alive(&self) -> BoxFuture<'_, bool>;
}

/// Convert a Jupyter iopub message into an nbformat output object.
pub fn message_content_to_nbformat(content: &JupyterMessageContent) -> Option<Value> {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(json!({
                "output_type": "stream",
                "name": name,
                "text": stream.text
            }))
        }
        JupyterMessageContent::DisplayData(data) => Some(json!({
            "output_type": "display_data",
            "data": data.data,
            "metadata": data.metadata
        })),
        JupyterMessageContent::ExecuteResult(result) => Some(json!({
            "output_type": "execute_result",
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0
        })),
        JupyterMessageContent::ErrorOutput(error) => Some(json!({
            "output_type": "error",
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        })),
        _ => None,
    }
}

/// nbformat error output for a failure outside the kernel.
pub fn error_output(ename: &str, evalue: &str) -> Value {
    json!({
        "output_type": "error",
        "ename": ename,
        "evalue": evalue,
        "traceback": []
    })
}

// ============================================================================
// Jupyter driver
// ============================================================================

/// Driver for an already-running Jupyter kernel.
pub struct JupyterDriver {
    kernel_name: String,
    connection_info: ConnectionInfo,
    session_id: String,
    interrupt_requested: AtomicBool,
    heartbeat_timeout: Duration,
}

impl JupyterDriver {
    pub fn new(kernel_name: impl Into<String>, connection_info: ConnectionInfo) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            connection_info,
            session_id: Uuid::new_v4().to_string(),
            interrupt_requested: AtomicBool::new(false),
            heartbeat_timeout: Duration::from_secs(2),
        }
    }

    /// Read a kernel connection file. Relative paths are resolved against
    /// the Jupyter runtime directory.
    pub async fn from_connection_file(path: &Path) -> Result<Self> {
        let path = resolve_connection_file(path);
        let content = tokio::fs::read_to_string(&path).await?;
        let info: ConnectionInfo = serde_json::from_str(&content)?;
        let name = info
            .kernel_name
            .clone()
            .unwrap_or_else(|| "python3".to_string());
        info!("[kernel] Loaded connection file {:?} ({})", path, name);
        Ok(Self::new(name, info))
    }
}

pub fn resolve_connection_file(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        runtimelib::runtime_dir().join(path)
    }
}

impl KernelDriver for JupyterDriver {
    fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    fn execute(
        &self,
        code: String,
        events: mpsc::UnboundedSender<KernelEvent>,
    ) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async move {
            // Subscribe before sending so no iopub message for this run is missed.
            let mut iopub = runtimelib::create_client_iopub_connection(
                &self.connection_info,
                "",
                &self.session_id,
            )
            .await?;
            let identity = runtimelib::peer_identity_for_session(&self.session_id)?;
            let mut shell = runtimelib::create_client_shell_connection_with_identity(
                &self.connection_info,
                &self.session_id,
                identity,
            )
            .await?;

            self.interrupt_requested.store(false, Ordering::SeqCst);
            let message: JupyterMessage = ExecuteRequest::new(code).into();
            let msg_id = message.header.msg_id.clone();
            shell.send(message).await?;
            debug!("[kernel] Sent execute_request msg_id={}", msg_id);

            let mut execution_count = None;
            let mut errored = false;
            loop {
                let message = iopub.read().await?;
                let parent = message.parent_header.as_ref().map(|h| h.msg_id.as_str());
                if parent != Some(msg_id.as_str()) {
                    continue;
                }
                match &message.content {
                    JupyterMessageContent::ExecuteInput(input) => {
                        execution_count = Some(input.execution_count.0 as i64);
                        let _ = events.send(KernelEvent::Started { execution_count });
                    }
                    JupyterMessageContent::Status(status)
                        if status.execution_state == ExecutionState::Idle =>
                    {
                        break;
                    }
                    content => {
                        if matches!(content, JupyterMessageContent::ErrorOutput(_)) {
                            errored = true;
                        }
                        if let Some(output) = message_content_to_nbformat(content) {
                            let _ = events.send(KernelEvent::Output(output));
                        }
                    }
                }
            }

            let status = match (errored, self.interrupt_requested.load(Ordering::SeqCst)) {
                (true, true) => ExecutionStatus::Interrupted,
                (true, false) => ExecutionStatus::Errored,
                (false, _) => ExecutionStatus::Completed,
            };
            Ok(ExecutionOutcome {
                status,
                execution_count,
            })
        })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            self.interrupt_requested.store(true, Ordering::SeqCst);
            let mut control = runtimelib::create_client_control_connection(
                &self.connection_info,
                &self.session_id,
            )
            .await?;
            let request: JupyterMessage = InterruptRequest {}.into();
            control.send(request).await?;
            info!("[kernel] Sent interrupt_request to {}", self.kernel_name);

            let acknowledged = matches!(
                tokio::time::timeout(Duration::from_secs(2), control.read()).await,
                Ok(Ok(_))
            );
            Ok(acknowledged)
        })
    }

    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let heartbeat = tokio::time::timeout(self.heartbeat_timeout, async {
                let mut hb =
                    runtimelib::create_client_heartbeat_connection(&self.connection_info).await?;
                hb.single_heartbeat().await
            })
            .await;
            matches!(heartbeat, Ok(Ok(())))
        })
    }
}

// ============================================================================
// Host-side kernel session
// ============================================================================

/// A kernel attached to the host.
pub struct KernelSession {
    kernel_id: String,
    driver: Arc<dyn KernelDriver>,
    state: watch::Sender<KernelState>,
    run_lock: Mutex<()>,
}

impl KernelSession {
    pub fn new(kernel_id: impl Into<String>, driver: Arc<dyn KernelDriver>) -> Self {
        let (state, _) = watch::channel(KernelState::Idle);
        Self {
            kernel_id: kernel_id.into(),
            driver,
            state,
            run_lock: Mutex::new(()),
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn kernel_name(&self) -> &str {
        self.driver.kernel_name()
    }

    /// Run `code`, waiting for any earlier run on this kernel to finish first.
    ///
    /// A driver failure is reported as an errored run with a synthetic error
    /// output, and a kernel that dies mid-run as a lost one, so callers
    /// always get a terminal outcome.
    pub async fn run(
        &self,
        code: String,
        events: mpsc::UnboundedSender<KernelEvent>,
    ) -> ExecutionOutcome {
        let _guard = self.run_lock.lock().await;
        self.state.send_replace(KernelState::Busy);

        let (outcome, state) = tokio::select! {
            result = self.driver.execute(code, events.clone()) => {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("[kernel] Execution on {} failed: {}", self.kernel_id, e);
                        let _ = events.send(KernelEvent::Output(error_output(
                            "KernelConnectionError",
                            &e.to_string(),
                        )));
                        ExecutionOutcome {
                            status: ExecutionStatus::Errored,
                            execution_count: None,
                        }
                    }
                };
                (outcome, KernelState::Idle)
            }
            () = self.wait_for_death() => {
                warn!("[kernel] {} died during a run", self.kernel_id);
                let _ = events.send(KernelEvent::Output(error_output(
                    "KernelDied",
                    "the kernel stopped responding before the run finished",
                )));
                let outcome = ExecutionOutcome {
                    status: ExecutionStatus::Lost,
                    execution_count: None,
                };
                (outcome, KernelState::Dead)
            }
        };

        self.state.send_replace(state);
        outcome
    }

    /// Resolves once the driver fails a liveness check.
    async fn wait_for_death(&self) {
        let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.driver.is_alive().await {
                return;
            }
        }
    }

    pub async fn interrupt(&self) -> bool {
        match self.driver.interrupt().await {
            Ok(acknowledged) => acknowledged,
            Err(e) => {
                warn!("[kernel] Interrupt of {} failed: {}", self.kernel_id, e);
                false
            }
        }
    }

    /// Current execution state and liveness.
    pub async fn status(&self) -> (KernelState, bool) {
        let alive = self.driver.is_alive().await;
        if !alive {
            self.state.send_replace(KernelState::Dead);
            return (KernelState::Dead, false);
        }
        let state = *self.state.borrow();
        let state = if state == KernelState::Dead {
            KernelState::Idle
        } else {
            state
        };
        (state, true)
    }
}
