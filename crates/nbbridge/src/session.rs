//! Session Connector: control channels to instance hosts.
//!
//! A `Session` is one control connection. It is driven by two background
//! tasks: a reader that decodes server frames, and an IO task that owns the
//! write half, assigns request ids, and routes responses (by id) and
//! execution events (by execution id) back to their waiters. Callers talk to
//! it through a command channel and get replies over oneshot channels.
//!
//! `SessionConnector` keeps at most one live session per instance id and
//! hides reconnects: a request that failed on a dead channel is retried once
//! over a fresh connection when replaying it is safe. While a session is live,
//! selectors that resolved to its instance skip the registry scan.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::connection::{self, Handshake, HandshakeReply};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{ClientFrame, ExecutionEvent, Request, Response, ServerFrame};
use crate::registry::{InstanceDescriptor, InstanceRegistry, InstanceSelector};

/// A failed request, and whether it may have reached the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionError {
    pub error: BridgeError,
    pub delivered: bool,
}

impl SessionError {
    fn lost(instance_id: &str, reason: impl Into<String>, delivered: bool) -> Self {
        Self {
            error: BridgeError::ConnectionLost {
                instance_id: instance_id.to_string(),
                reason: reason.into(),
            },
            delivered,
        }
    }
}

struct Command {
    request: Request,
    reply: oneshot::Sender<Result<Response, SessionError>>,
    /// Receives the events of an `Execute` request.
    events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

struct Pending {
    reply: oneshot::Sender<Result<Response, SessionError>>,
    execution_id: Option<String>,
}

/// One control connection to an instance host.
pub struct Session {
    descriptor: InstanceDescriptor,
    cmd_tx: mpsc::Sender<Command>,
    alive: Arc<AtomicBool>,
    request_timeout: Duration,
    reader_task: JoinHandle<()>,
    io_task: JoinHandle<()>,
}

impl Session {
    /// Open a control channel. Fails with `Unreachable` when the host cannot
    /// be reached within `timeout` and `Unauthorized` when it rejects `token`.
    pub async fn connect(
        descriptor: &InstanceDescriptor,
        token: Option<&str>,
        timeout: Duration,
    ) -> BridgeResult<Self> {
        let endpoint = descriptor.endpoint();
        let unreachable = |reason: String| BridgeError::Unreachable {
            endpoint: endpoint.clone(),
            reason,
        };

        let opened = tokio::time::timeout(timeout, async {
            let stream = TcpStream::connect(&endpoint).await?;
            stream.set_nodelay(true)?;
            let (mut reader, mut writer) = stream.into_split();
            let handshake = Handshake::Control {
                token: token.map(str::to_string),
            };
            connection::send_json_frame(&mut writer, &handshake).await?;
            let reply: Option<HandshakeReply> = connection::recv_json_frame(&mut reader).await?;
            anyhow::Ok((reader, writer, reply))
        })
        .await;

        let (reader, writer) = match opened {
            Ok(Ok((reader, writer, Some(HandshakeReply::Ok)))) => (reader, writer),
            Ok(Ok((_, _, Some(HandshakeReply::Unauthorized)))) => {
                return Err(BridgeError::Unauthorized {
                    instance_id: descriptor.instance_id.clone(),
                })
            }
            Ok(Ok((_, _, Some(HandshakeReply::NotFound { what })))) => {
                return Err(BridgeError::not_found(what))
            }
            Ok(Ok((_, _, None))) => {
                return Err(unreachable("closed during handshake".to_string()))
            }
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => {
                return Err(unreachable(format!(
                    "no connection within {} ms",
                    timeout.as_millis()
                )))
            }
        };

        info!(
            "[session] Connected to {} at {}",
            descriptor.instance_id, endpoint
        );

        let alive = Arc::new(AtomicBool::new(true));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let reader_task = tokio::spawn(read_frames(reader, frame_tx));
        let io_task = tokio::spawn(run_io(
            writer,
            cmd_rx,
            frame_rx,
            alive.clone(),
            descriptor.instance_id.clone(),
        ));

        Ok(Self {
            descriptor: descriptor.clone(),
            cmd_tx,
            alive,
            request_timeout: Duration::from_secs(30),
            reader_task,
            io_task,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.descriptor.instance_id
    }

    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.io_task.is_finished()
    }

    /// Send one request and wait for its response.
    ///
    /// For `Execute`, `events` is registered before the request is written,
    /// so no event of the run can be missed.
    pub async fn send(
        &self,
        request: Request,
        events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
    ) -> Result<Response, SessionError> {
        let instance_id = self.instance_id();
        let (reply, reply_rx) = oneshot::channel();
        let command = Command {
            request,
            reply,
            events,
        };
        if self.cmd_tx.send(command).await.is_err() {
            return Err(SessionError::lost(instance_id, "session closed", false));
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::lost(instance_id, "session closed", true)),
            Err(_) => Err(SessionError::lost(
                instance_id,
                format!("no response within {} s", self.request_timeout.as_secs()),
                true,
            )),
        }
    }

    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader_task.abort();
        self.io_task.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_frames(mut reader: OwnedReadHalf, frames: mpsc::UnboundedSender<ServerFrame>) {
    loop {
        match connection::recv_json_frame::<_, ServerFrame>(&mut reader).await {
            Ok(Some(frame)) => {
                if frames.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("[session] Host closed the connection");
                break;
            }
            Err(e) => {
                warn!("[session] Read error: {}", e);
                break;
            }
        }
    }
}

async fn run_io(
    mut writer: OwnedWriteHalf,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut frame_rx: mpsc::UnboundedReceiver<ServerFrame>,
    alive: Arc<AtomicBool>,
    instance_id: String,
) {
    let mut next_id: u64 = 0;
    let mut pending: HashMap<u64, Pending> = HashMap::new();
    let mut subscribers: HashMap<String, mpsc::UnboundedSender<ExecutionEvent>> = HashMap::new();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                next_id += 1;
                let id = next_id;

                let execution_id = match &command.request {
                    Request::Execute { execution_id, .. } => Some(execution_id.clone()),
                    _ => None,
                };
                if let (Some(execution_id), Some(events)) = (&execution_id, command.events) {
                    subscribers.insert(execution_id.clone(), events);
                }

                let frame = ClientFrame { id, request: command.request };
                if let Err(e) = connection::send_json_frame(&mut writer, &frame).await {
                    warn!("[session] Write to {} failed: {}", instance_id, e);
                    if let Some(execution_id) = &execution_id {
                        subscribers.remove(execution_id);
                    }
                    let _ = command
                        .reply
                        .send(Err(SessionError::lost(&instance_id, e.to_string(), false)));
                    break;
                }
                pending.insert(id, Pending { reply: command.reply, execution_id });
            }

            frame = frame_rx.recv() => {
                match frame {
                    Some(ServerFrame::Response { id, response }) => {
                        let Some(waiter) = pending.remove(&id) else {
                            debug!("[session] Response for unknown request {}", id);
                            continue;
                        };
                        if let (Response::Error { .. }, Some(execution_id)) =
                            (&response, &waiter.execution_id)
                        {
                            subscribers.remove(execution_id);
                        }
                        let _ = waiter.reply.send(Ok(response));
                    }
                    Some(ServerFrame::Event { event }) => {
                        let execution_id = event.execution_id().to_string();
                        let finished = matches!(event, ExecutionEvent::Finished { .. });
                        if let Some(tx) = subscribers.get(&execution_id) {
                            let _ = tx.send(event);
                        }
                        if finished {
                            subscribers.remove(&execution_id);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    info!("[session] Control channel to {} closed", instance_id);
    for (_, waiter) in pending.drain() {
        let _ = waiter
            .reply
            .send(Err(SessionError::lost(&instance_id, "connection closed", true)));
    }
    // Dropping the subscribers tells in-flight executions the channel is gone.
}

/// Resolves instances and hands out shared sessions.
pub struct SessionConnector {
    registry: InstanceRegistry,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// Held while opening a session, one per instance id.
    connecting: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Instance id each selector last resolved to.
    resolved: Mutex<HashMap<InstanceSelector, String>>,
    connect_timeout: Duration,
    token: Option<String>,
    default_selector: InstanceSelector,
}

impl SessionConnector {
    pub fn new(registry: InstanceRegistry) -> Self {
        Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
            connect_timeout: crate::DEFAULT_CONNECT_TIMEOUT,
            token: None,
            default_selector: InstanceSelector::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use `token` instead of the one in the instance descriptor.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Selector used when a call does not name an instance.
    pub fn with_default_selector(mut self, selector: InstanceSelector) -> Self {
        self.default_selector = selector;
        self
    }

    /// Resolve `selector`, falling back to the default selector.
    ///
    /// A selector that already led to a live session resolves to it without
    /// reading the registry. Finding nothing is retried once: a host may be
    /// between restart and re-advertising.
    pub async fn resolve(&self, selector: Option<&InstanceSelector>) -> BridgeResult<InstanceDescriptor> {
        let selector = match selector {
            Some(selector) if !selector.is_empty() => selector,
            _ => &self.default_selector,
        };
        if let Some(descriptor) = self.cached_resolution(selector).await {
            return Ok(descriptor);
        }

        let descriptor = match self.registry.resolve(selector).await {
            Err(BridgeError::NotFound { .. }) => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.registry.resolve(selector).await
            }
            other => other,
        }?;
        self.resolved
            .lock()
            .await
            .insert(selector.clone(), descriptor.instance_id.clone());
        Ok(descriptor)
    }

    async fn cached_resolution(&self, selector: &InstanceSelector) -> Option<InstanceDescriptor> {
        let instance_id = self.resolved.lock().await.get(selector).cloned()?;
        let sessions = self.sessions.lock().await;
        sessions
            .get(&instance_id)
            .filter(|s| s.is_alive())
            .map(|s| s.descriptor().clone())
    }

    /// The live session for `descriptor`, connecting if there is none.
    pub async fn connect(&self, descriptor: &InstanceDescriptor) -> BridgeResult<Arc<Session>> {
        if let Some(session) = self.live_session(descriptor).await {
            return Ok(session);
        }

        let gate = self
            .connecting
            .lock()
            .await
            .entry(descriptor.instance_id.clone())
            .or_default()
            .clone();
        let _connecting = gate.lock().await;
        // Whoever held the gate before us may have connected already.
        if let Some(session) = self.live_session(descriptor).await {
            return Ok(session);
        }

        let token = self.token.clone().or_else(|| descriptor.token.clone());
        let session = Arc::new(
            Session::connect(descriptor, token.as_deref(), self.connect_timeout).await?,
        );
        self.sessions
            .lock()
            .await
            .insert(descriptor.instance_id.clone(), session.clone());
        Ok(session)
    }

    async fn live_session(&self, descriptor: &InstanceDescriptor) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&descriptor.instance_id)
            .filter(|s| s.is_alive() && s.descriptor().endpoint() == descriptor.endpoint())
            .cloned()
    }

    /// `session` if it is still usable, otherwise a fresh one.
    pub async fn ensure_live(&self, session: &Arc<Session>) -> BridgeResult<Arc<Session>> {
        if session.is_alive() {
            return Ok(session.clone());
        }
        info!("[session] Reconnecting to {}", session.instance_id());
        self.close(session.instance_id()).await;
        self.connect(session.descriptor()).await
    }

    pub async fn close(&self, instance_id: &str) {
        if let Some(session) = self.sessions.lock().await.remove(instance_id) {
            session.close();
            debug!("[session] Closed session to {}", instance_id);
        }
    }

    /// Send `request` to the selected instance.
    pub async fn request(
        &self,
        selector: Option<&InstanceSelector>,
        request: Request,
    ) -> BridgeResult<Response> {
        self.request_with_events(selector, request, None).await
    }

    /// Like `request`, additionally routing execution events to `events`.
    ///
    /// A transport failure is retried once over a fresh connection when the
    /// request is read-only or never reached the host. A host-side
    /// `Response::Error` is returned as `Err` without retrying.
    pub async fn request_with_events(
        &self,
        selector: Option<&InstanceSelector>,
        request: Request,
        events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
    ) -> BridgeResult<Response> {
        let descriptor = self.resolve(selector).await?;
        let instance_id = descriptor.instance_id.clone();

        let first = match self.attempt(&descriptor, &request, events.clone()).await {
            Ok(response) => return into_result(response),
            Err(failure) => failure,
        };
        if !first.error.is_transport() {
            return Err(first.error);
        }

        self.close(&instance_id).await;
        if first.delivered && !request.is_read_only() {
            warn!(
                "[session] {} lost after sending a non-replayable request",
                instance_id
            );
            return Err(BridgeError::ConnectionLost {
                instance_id,
                reason: first.error.to_string(),
            });
        }

        warn!("[session] Retrying request to {}: {}", instance_id, first.error);
        match self.attempt(&descriptor, &request, events).await {
            Ok(response) => into_result(response),
            Err(second) => match (&first.error, second.error) {
                (BridgeError::Unreachable { .. }, unreachable @ BridgeError::Unreachable { .. }) => {
                    Err(unreachable)
                }
                (_, error) if error.is_transport() => {
                    self.close(&instance_id).await;
                    Err(BridgeError::ConnectionLost {
                        instance_id,
                        reason: error.to_string(),
                    })
                }
                (_, error) => Err(error),
            },
        }
    }

    async fn attempt(
        &self,
        descriptor: &InstanceDescriptor,
        request: &Request,
        events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
    ) -> Result<Response, SessionError> {
        let session = self
            .connect(descriptor)
            .await
            .map_err(|error| SessionError {
                error,
                delivered: false,
            })?;
        session.send(request.clone(), events).await
    }
}

fn into_result(response: Response) -> BridgeResult<Response> {
    match response {
        Response::Error { error } => Err(error),
        response => Ok(response),
    }
}
