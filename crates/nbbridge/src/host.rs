//! The instance host: a live notebook server the bridge connects to.
//!
//! A host owns the open notebooks (one room each), the kernels attached to
//! them, and the active-notebook slot written by the editor UI. It listens
//! on one TCP port; every connection begins with a handshake frame naming
//! the channel:
//!
//! - `control`: request/response traffic from the bridge or an editor UI
//! - `notebook_sync`: Automerge sync for one notebook (editor windows)
//!
//! While running, the host advertises itself in the instances directory so
//! bridges can find it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use uuid::Uuid;

use crate::active::ActiveNotebook;
use crate::connection::{self, Handshake, HandshakeReply};
use crate::error::{BridgeError, BridgeResult};
use crate::kernel::{JupyterDriver, KernelDriver, KernelEvent, KernelSession};
use crate::notebook_room::{self, NotebookRoom, NotebookRooms};
use crate::protocol::{ClientFrame, ExecutionEvent, Request, Response, ServerFrame};
use crate::registry::{InstanceDescriptor, InstanceRegistry};

/// A notebook the host opens at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookSpec {
    pub path: String,
    /// Kernel connection file; relative paths resolve against the Jupyter
    /// runtime directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_file: Option<PathBuf>,
}

/// Configuration for an instance host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Generated when unset.
    pub instance_id: Option<String>,
    pub bind_host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    /// Clients must present this token in the handshake.
    pub token: Option<String>,
    pub instances_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub notebooks: Vec<NotebookSpec>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            token: None,
            instances_dir: crate::default_instances_dir(),
            docs_dir: crate::default_docs_dir(),
            notebooks: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

pub struct Host {
    config: HostConfig,
    instance_id: String,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    rooms: NotebookRooms,
    kernels: RwLock<HashMap<String, Arc<KernelSession>>>,
    active: ActiveNotebook,
    connected_clients: AtomicUsize,
    shutdown: Mutex<bool>,
    shutdown_notify: Notify,
}

impl Host {
    /// Bind the listener and open the configured notebooks.
    ///
    /// A notebook whose kernel cannot be attached is still opened, without
    /// a kernel.
    pub async fn new(config: HostConfig) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind((config.bind_host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let host = Arc::new(Self {
            instance_id,
            local_addr,
            listener: Mutex::new(Some(listener)),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            kernels: RwLock::new(HashMap::new()),
            active: ActiveNotebook::new(),
            connected_clients: AtomicUsize::new(0),
            shutdown: Mutex::new(false),
            shutdown_notify: Notify::new(),
            config,
        });

        for spec in host.config.notebooks.clone() {
            let driver: Option<Arc<dyn KernelDriver>> = match &spec.connection_file {
                Some(file) => match JupyterDriver::from_connection_file(file).await {
                    Ok(driver) => Some(Arc::new(driver)),
                    Err(e) => {
                        warn!(
                            "[host] No kernel for {}: failed to load {:?}: {}",
                            spec.path, file, e
                        );
                        None
                    }
                },
                None => None,
            };
            host.open_notebook(&spec.path, driver).await?;
        }

        Ok(host)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active(&self) -> &ActiveNotebook {
        &self.active
    }

    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(Ordering::Relaxed)
    }

    /// The descriptor this host advertises.
    pub fn descriptor(&self) -> InstanceDescriptor {
        let mut descriptor = InstanceDescriptor::new(
            self.instance_id.clone(),
            self.local_addr.ip().to_string(),
            self.local_addr.port(),
        );
        descriptor.token = self.config.token.clone();
        descriptor
    }

    /// Open `path` (if not open yet), optionally with a kernel attached.
    pub async fn open_notebook(
        &self,
        path: &str,
        driver: Option<Arc<dyn KernelDriver>>,
    ) -> BridgeResult<Arc<NotebookRoom>> {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(path) {
            return Ok(room.clone());
        }

        let mut room = NotebookRoom::open(path, &self.config.docs_dir)?;
        if let Some(driver) = driver {
            let kernel_id = Uuid::new_v4().to_string();
            let session = Arc::new(KernelSession::new(kernel_id.clone(), driver));
            room = room.with_kernel(kernel_id.clone(), session.kernel_name());
            self.kernels.write().await.insert(kernel_id.clone(), session);
            info!("[host] Attached kernel {} to {}", kernel_id, path);
        }
        info!("[host] Opened notebook {}", path);
        let room = Arc::new(room);
        rooms.insert(path.to_string(), room.clone());
        Ok(room)
    }

    /// Advertise and serve connections until `shutdown` is called.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("host is already running"))?;

        let registry = InstanceRegistry::new(&self.config.instances_dir);
        let _advertisement = match registry.advertise(&self.descriptor()) {
            Ok(ad) => Some(ad),
            Err(e) => {
                error!("[host] Failed to write instance descriptor: {}", e);
                None
            }
        };

        let mut active_rx = self.active.subscribe();
        let watcher = tokio::spawn(async move {
            while active_rx.changed().await.is_ok() {
                let path = active_rx.borrow_and_update().clone();
                info!("[host] Active notebook is now {:?}", path);
            }
        });

        info!(
            "[host] Instance {} listening on {}",
            self.instance_id, self.local_addr
        );

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("[host] Connection from {}", peer);
                            let host = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = host.handle_connection(stream).await {
                                    warn!("[host] Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("[host] Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    if *self.shutdown.lock().await {
                        info!("[host] Shutting down");
                        break;
                    }
                }
            }
        }

        watcher.abort();
        Ok(())
    }

    pub async fn shutdown(&self) {
        *self.shutdown.lock().await = true;
        self.shutdown_notify.notify_one();
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let Some(handshake) = connection::recv_handshake(&mut reader).await? else {
            return Ok(());
        };

        if let Some(expected) = &self.config.token {
            if handshake.token() != Some(expected.as_str()) {
                warn!("[host] Rejected connection with bad token");
                connection::send_json_frame(&mut writer, &HandshakeReply::Unauthorized).await?;
                return Ok(());
            }
        }

        match handshake {
            Handshake::Control { .. } => {
                connection::send_json_frame(&mut writer, &HandshakeReply::Ok).await?;
                self.handle_control_connection(reader, writer).await
            }
            Handshake::NotebookSync { path, .. } => {
                let room = match notebook_room::find_room(&self.rooms, &path).await {
                    Ok(room) => room,
                    Err(_) => {
                        let reply = HandshakeReply::NotFound {
                            what: format!("notebook {}", path),
                        };
                        connection::send_json_frame(&mut writer, &reply).await?;
                        return Ok(());
                    }
                };
                connection::send_json_frame(&mut writer, &HandshakeReply::Ok).await?;
                notebook_room::handle_notebook_sync_connection(reader, writer, room).await
            }
        }
    }

    async fn handle_control_connection(
        self: Arc<Self>,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        mut writer: tokio::net::tcp::OwnedWriteHalf,
    ) -> anyhow::Result<()> {
        let clients = self.connected_clients.fetch_add(1, Ordering::Relaxed) + 1;
        info!("[host] Control client connected ({} connected)", clients);

        // Responses and execution events share the socket; one writer task
        // keeps frames whole.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = connection::send_json_frame(&mut writer, &frame).await {
                    debug!("[host] Control writer closed: {}", e);
                    break;
                }
            }
        });

        let result = loop {
            let data = match connection::recv_frame(&mut reader).await {
                Ok(Some(data)) => data,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            };
            let frame: ClientFrame = match serde_json::from_slice(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[host] Ignoring malformed control frame: {}", e);
                    continue;
                }
            };

            // Requests run concurrently; the id pairs each response with its request.
            let host = self.clone();
            let out = out_tx.clone();
            tokio::spawn(async move {
                let response = host.handle_request(frame.request, &out).await;
                let _ = out.send(ServerFrame::Response {
                    id: frame.id,
                    response,
                });
            });
        };

        let remaining = self.connected_clients.fetch_sub(1, Ordering::Relaxed) - 1;
        info!("[host] Control client disconnected ({} connected)", remaining);
        drop(out_tx);
        writer_task.abort();
        result
    }

    /// Handle a single control request.
    pub async fn handle_request(
        self: &Arc<Self>,
        request: Request,
        out: &mpsc::UnboundedSender<ServerFrame>,
    ) -> Response {
        match self.dispatch(request, out).await {
            Ok(response) => response,
            Err(error) => Response::Error { error },
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        request: Request,
        out: &mpsc::UnboundedSender<ServerFrame>,
    ) -> BridgeResult<Response> {
        match request {
            Request::Ping => Ok(Response::Pong),

            Request::Status => Ok(Response::Status {
                status: "ok".to_string(),
                connected_clients: self.connected_clients(),
            }),

            Request::ListNotebooks => {
                let rooms = self.rooms.read().await;
                let mut notebooks: Vec<_> = rooms.values().map(|room| room.info()).collect();
                notebooks.sort_by(|a, b| a.path.cmp(&b.path));
                Ok(Response::Notebooks { notebooks })
            }

            Request::GetActiveNotebook => {
                let rooms = self.rooms.read().await;
                if let Some(room) = self.active.get().and_then(|path| rooms.get(&path)) {
                    return Ok(Response::ActiveNotebook {
                        notebook: Some(room.info()),
                        is_fallback: false,
                    });
                }
                let fallback = rooms.keys().min().and_then(|path| rooms.get(path));
                Ok(Response::ActiveNotebook {
                    is_fallback: fallback.is_some(),
                    notebook: fallback.map(|room| room.info()),
                })
            }

            Request::SetActiveNotebook { path } => {
                if let Some(path) = &path {
                    notebook_room::find_room(&self.rooms, path).await?;
                }
                self.active.set(path);
                Ok(Response::Ok)
            }

            Request::GetContent { path } => {
                let room = notebook_room::find_room(&self.rooms, &path).await?;
                Ok(Response::Content {
                    snapshot: room.snapshot().await,
                })
            }

            Request::Mutate { path, op } => {
                let room = notebook_room::find_room(&self.rooms, &path).await?;
                let result = room.apply(op).await?;
                debug!(
                    "[host] Applied {} to {} ({} cells)",
                    result.operation, path, result.cell_count
                );
                Ok(Response::Mutated { result })
            }

            Request::Execute {
                kernel_id,
                execution_id,
                code,
            } => {
                let kernel = self.kernel(&kernel_id).await?;
                spawn_execution(kernel, execution_id.clone(), code, out.clone());
                Ok(Response::ExecutionAccepted { execution_id })
            }

            Request::Interrupt { kernel_id } => {
                let kernel = self.kernel(&kernel_id).await?;
                let acknowledged = kernel.interrupt().await;
                Ok(Response::InterruptSent {
                    kernel_id,
                    acknowledged,
                })
            }

            Request::KernelStatus { kernel_id } => {
                let kernel = self.kernel(&kernel_id).await?;
                let (execution_state, is_alive) = kernel.status().await;
                Ok(Response::KernelStatus {
                    kernel_id,
                    execution_state,
                    is_alive,
                })
            }
        }
    }

    async fn kernel(&self, kernel_id: &str) -> BridgeResult<Arc<KernelSession>> {
        self.kernels
            .read()
            .await
            .get(kernel_id)
            .cloned()
            .ok_or_else(|| BridgeError::not_found(format!("kernel {}", kernel_id)))
    }
}

/// Run `code` in the background, streaming events to the requesting client.
///
/// The run is not tied to the connection: if the client goes away the
/// kernel still finishes the request.
fn spawn_execution(
    kernel: Arc<KernelSession>,
    execution_id: String,
    code: String,
    out: mpsc::UnboundedSender<ServerFrame>,
) {
    tokio::spawn(async move {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let forward = {
            let out = out.clone();
            let execution_id = execution_id.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    let event = match event {
                        KernelEvent::Started { execution_count } => ExecutionEvent::Started {
                            execution_id: execution_id.clone(),
                            execution_count,
                        },
                        KernelEvent::Output(output) => ExecutionEvent::Output {
                            execution_id: execution_id.clone(),
                            output,
                        },
                    };
                    let _ = out.send(ServerFrame::Event { event });
                }
            })
        };

        let outcome = kernel.run(code, events_tx).await;
        // Every output goes out before the terminal event.
        let _ = forward.await;
        debug!(
            "[host] Execution {} on {} finished: {:?}",
            execution_id,
            kernel.kernel_id(),
            outcome.status
        );
        let _ = out.send(ServerFrame::Event {
            event: ExecutionEvent::Finished {
                execution_id,
                status: outcome.status,
                execution_count: outcome.execution_count,
            },
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CellOp, CellType};
    use tempfile::TempDir;

    async fn test_host(tmp: &TempDir, notebooks: &[&str]) -> Arc<Host> {
        let config = HostConfig {
            instance_id: Some("test-host".into()),
            instances_dir: tmp.path().join("instances"),
            docs_dir: tmp.path().join("docs"),
            notebooks: notebooks
                .iter()
                .map(|p| NotebookSpec {
                    path: p.to_string(),
                    connection_file: None,
                })
                .collect(),
            ..Default::default()
        };
        Host::new(config).await.unwrap()
    }

    async fn request(host: &Arc<Host>, request: Request) -> Response {
        let (out, _rx) = mpsc::unbounded_channel();
        host.handle_request(request, &out).await
    }

    #[test]
    fn test_host_config_defaults_and_partial_json() {
        let config: HostConfig =
            serde_json::from_str(r#"{"port": 9100, "notebooks": [{"path": "a.ipynb"}]}"#).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.notebooks[0].path, "a.ipynb");
        assert!(config.notebooks[0].connection_file.is_none());
        assert!(config.token.is_none());
    }

    #[tokio::test]
    async fn test_active_notebook_fallback() {
        let tmp = TempDir::new().unwrap();
        let host = test_host(&tmp, &["b.ipynb", "a.ipynb"]).await;

        match request(&host, Request::GetActiveNotebook).await {
            Response::ActiveNotebook {
                notebook: Some(nb),
                is_fallback: true,
            } => assert_eq!(nb.path, "a.ipynb"),
            other => panic!("unexpected {other:?}"),
        }

        let set = Request::SetActiveNotebook {
            path: Some("b.ipynb".into()),
        };
        assert_eq!(request(&host, set).await, Response::Ok);
        match request(&host, Request::GetActiveNotebook).await {
            Response::ActiveNotebook {
                notebook: Some(nb),
                is_fallback: false,
            } => assert_eq!(nb.path, "b.ipynb"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_active_unknown_path_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let host = test_host(&tmp, &["a.ipynb"]).await;
        let response = request(
            &host,
            Request::SetActiveNotebook {
                path: Some("nope.ipynb".into()),
            },
        )
        .await;
        match response {
            Response::Error { error } => assert_eq!(error.kind(), "not_found"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(host.active().get(), None);
    }

    #[tokio::test]
    async fn test_no_notebooks_has_no_active() {
        let tmp = TempDir::new().unwrap();
        let host = test_host(&tmp, &[]).await;
        assert_eq!(
            request(&host, Request::GetActiveNotebook).await,
            Response::ActiveNotebook {
                notebook: None,
                is_fallback: false
            }
        );
    }

    #[tokio::test]
    async fn test_mutate_and_read_content() {
        let tmp = TempDir::new().unwrap();
        let host = test_host(&tmp, &["a.ipynb"]).await;

        let response = request(
            &host,
            Request::Mutate {
                path: "a.ipynb".into(),
                op: CellOp::Insert {
                    index: 0,
                    cell_type: CellType::Markdown,
                    source: "# hi".into(),
                },
            },
        )
        .await;
        assert!(matches!(response, Response::Mutated { .. }));

        match request(&host, Request::GetContent { path: "a.ipynb".into() }).await {
            Response::Content { snapshot } => {
                assert_eq!(snapshot.cells.len(), 1);
                assert_eq!(snapshot.cells[0].source, "# hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_kernel_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let host = test_host(&tmp, &["a.ipynb"]).await;
        let response = request(
            &host,
            Request::KernelStatus {
                kernel_id: "missing".into(),
            },
        )
        .await;
        match response {
            Response::Error { error } => assert_eq!(error.kind(), "not_found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_advertises_and_withdraws() {
        let tmp = TempDir::new().unwrap();
        let host = test_host(&tmp, &["a.ipynb"]).await;
        let registry = InstanceRegistry::new(tmp.path().join("instances"));

        let task = tokio::spawn(host.clone().run());
        let mut advertised = false;
        for _ in 0..50 {
            if !registry.read_descriptors().is_empty() {
                advertised = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(advertised);
        assert_eq!(registry.list_instances().await[0].port, host.local_addr().port());

        host.shutdown().await;
        task.await.unwrap().unwrap();
        assert!(registry.read_descriptors().is_empty());
    }
}
