//! Host-side notebook rooms.
//!
//! Each open notebook gets one room holding the authoritative Automerge
//! document. Editor windows sync with the room over `notebook_sync`
//! connections; the bridge mutates it through control-channel ops. Both
//! paths take the room's write lock, so an op always sees the document as
//! it is at the moment it is applied.
//!
//! Documents persist to `{docs_dir}/{sha256(path)}.automerge` after every
//! change. Each save is stamped under the write lock and written through a
//! temp file, so an older save never lands on top of a newer one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use automerge::sync;
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::connection;
use crate::error::{BridgeError, BridgeResult};
use crate::notebook_doc::{notebook_doc_filename, NotebookDoc};
use crate::protocol::{CellOp, MutationResult, NotebookInfo, NotebookSnapshot};

pub struct NotebookRoom {
    path: String,
    /// The authoritative notebook document.
    pub doc: RwLock<NotebookDoc>,
    /// Notifies sync peers that the document changed.
    pub changed_tx: broadcast::Sender<()>,
    pub persist_path: PathBuf,
    /// Number of connected editor peers.
    pub active_peers: AtomicUsize,
    /// Bumped under the doc write lock for every save.
    save_seq: AtomicU64,
    /// Stamp of the save currently on disk.
    persisted_seq: Mutex<u64>,
    kernel_id: Option<String>,
    kernel_name: Option<String>,
}

impl NotebookRoom {
    /// Open the room for `path`, loading a persisted document if there is
    /// one. A fresh document for an existing `.ipynb` file imports its cells.
    pub fn open(path: &str, docs_dir: &Path) -> BridgeResult<Self> {
        let persist_path = docs_dir.join(notebook_doc_filename(path));
        let had_persisted = persist_path.exists();
        let mut doc = NotebookDoc::load_or_create(&persist_path, path)?;

        if !had_persisted && doc.cell_count() == 0 {
            if let Err(e) = import_ipynb(&mut doc, Path::new(path)) {
                warn!("[notebook-room] Could not import {}: {}", path, e);
            }
        }

        let (changed_tx, _) = broadcast::channel(16);
        Ok(Self {
            path: path.to_string(),
            doc: RwLock::new(doc),
            changed_tx,
            persist_path,
            active_peers: AtomicUsize::new(0),
            save_seq: AtomicU64::new(0),
            persisted_seq: Mutex::new(0),
            kernel_id: None,
            kernel_name: None,
        })
    }

    pub fn with_kernel(mut self, kernel_id: impl Into<String>, kernel_name: impl Into<String>) -> Self {
        self.kernel_id = Some(kernel_id.into());
        self.kernel_name = Some(kernel_name.into());
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kernel_id(&self) -> Option<&str> {
        self.kernel_id.as_deref()
    }

    pub fn info(&self) -> NotebookInfo {
        let name = Path::new(&self.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone());
        NotebookInfo {
            path: self.path.clone(),
            name,
            kernel_id: self.kernel_id.clone(),
            kernel_name: self.kernel_name.clone(),
        }
    }

    /// All cells and metadata, read under one lock.
    pub async fn snapshot(&self) -> NotebookSnapshot {
        let doc = self.doc.read().await;
        NotebookSnapshot {
            path: self.path.clone(),
            cells: doc.cells(),
            metadata: doc.metadata(),
        }
    }

    /// Apply one op against the live document, then persist and notify peers.
    pub async fn apply(&self, op: CellOp) -> BridgeResult<MutationResult> {
        let operation = op.name().to_string();
        let (cell, cell_count, save) = {
            let mut doc = self.doc.write().await;
            let cell = match op {
                CellOp::Insert {
                    index,
                    cell_type,
                    source,
                } => Some(doc.insert_cell(index, cell_type, &source)?),
                CellOp::UpdateSource { index, source } => {
                    doc.update_source(index, &source)?;
                    None
                }
                CellOp::Delete { index } => {
                    doc.delete_cell(index)?;
                    None
                }
                CellOp::Move { from, to } => {
                    doc.move_cell(from, to)?;
                    None
                }
                CellOp::ClearOutputs { index } => {
                    doc.clear_outputs(index)?;
                    None
                }
                CellOp::WriteResult {
                    cell_id,
                    outputs,
                    execution_count,
                } => {
                    doc.write_result(&cell_id, &outputs, execution_count)?;
                    None
                }
            };
            (cell, doc.cell_count(), self.stamped_save(&mut doc))
        };

        let _ = self.changed_tx.send(());
        self.persist(save).await;

        Ok(MutationResult {
            success: true,
            operation,
            cell_count,
            cell,
        })
    }

    /// Save the document and stamp the bytes. Call with the write lock held.
    fn stamped_save(&self, doc: &mut NotebookDoc) -> StampedSave {
        StampedSave {
            seq: self.save_seq.fetch_add(1, Ordering::SeqCst) + 1,
            bytes: doc.save(),
        }
    }

    /// Write a save to disk unless a newer one is already there.
    async fn persist(&self, save: StampedSave) {
        let mut persisted = self.persisted_seq.lock().await;
        if save.seq <= *persisted {
            return;
        }
        match persist_notebook_bytes(&save.bytes, &self.persist_path).await {
            Ok(()) => *persisted = save.seq,
            Err(e) => warn!(
                "[notebook-room] Failed to save notebook doc {:?}: {}",
                self.persist_path, e
            ),
        }
    }
}

struct StampedSave {
    seq: u64,
    bytes: Vec<u8>,
}

fn import_ipynb(doc: &mut NotebookDoc, path: &Path) -> anyhow::Result<()> {
    if path.extension().map_or(true, |ext| ext != "ipynb") || !path.exists() {
        return Ok(());
    }
    let content = std::fs::read_to_string(path)?;
    let notebook = match nbformat::parse_notebook(&content).map_err(|e| anyhow::anyhow!("{}", e))? {
        nbformat::Notebook::V4(nb) => nb,
        nbformat::Notebook::Legacy(legacy) => {
            nbformat::upgrade_legacy_notebook(legacy).map_err(|e| anyhow::anyhow!("{}", e))?
        }
    };
    doc.import_notebook(&notebook)?;
    info!(
        "[notebook-room] Imported {} cells from {:?}",
        doc.cell_count(),
        path
    );
    Ok(())
}

/// Open notebooks, keyed by path.
pub type NotebookRooms = Arc<RwLock<HashMap<String, Arc<NotebookRoom>>>>;

pub async fn find_room(rooms: &NotebookRooms, path: &str) -> BridgeResult<Arc<NotebookRoom>> {
    rooms
        .read()
        .await
        .get(path)
        .cloned()
        .ok_or_else(|| BridgeError::not_found(format!("notebook {}", path)))
}

/// Serve one editor peer after its handshake.
pub async fn handle_notebook_sync_connection<R, W>(
    mut reader: R,
    mut writer: W,
    room: Arc<NotebookRoom>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let peers = room.active_peers.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        "[notebook-room] Editor joined {} ({} peer{})",
        room.path,
        peers,
        if peers == 1 { "" } else { "s" }
    );

    let result = run_sync_loop(&mut reader, &mut writer, &room).await;

    let remaining = room.active_peers.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(
        "[notebook-room] Editor left {} ({} remaining)",
        room.path, remaining
    );
    result
}

async fn run_sync_loop<R, W>(
    reader: &mut R,
    writer: &mut W,
    room: &NotebookRoom,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut peer_state = sync::State::new();
    let mut changed_rx = room.changed_tx.subscribe();

    // Server speaks first.
    let greeting = {
        let mut doc = room.doc.write().await;
        doc.generate_sync_message(&mut peer_state)
    };
    if let Some(msg) = greeting {
        connection::send_frame(writer, &msg.encode()).await?;
    }

    loop {
        tokio::select! {
            result = connection::recv_frame(reader) => {
                let Some(data) = result? else {
                    return Ok(());
                };
                let message = sync::Message::decode(&data)
                    .map_err(|e| anyhow::anyhow!("decode error: {}", e))?;

                // Frames go out after the lock is released so a slow peer
                // never holds up other writers.
                let (save, reply) = {
                    let mut doc = room.doc.write().await;
                    doc.receive_sync_message(&mut peer_state, message)?;
                    let save = room.stamped_save(&mut doc);
                    (save, doc.generate_sync_message(&mut peer_state))
                };
                let _ = room.changed_tx.send(());
                if let Some(reply) = reply {
                    connection::send_frame(writer, &reply.encode()).await?;
                }
                room.persist(save).await;
            }

            // Lagged receivers still just mean "something changed".
            _ = changed_rx.recv() => {
                let msg = {
                    let mut doc = room.doc.write().await;
                    doc.generate_sync_message(&mut peer_state)
                };
                if let Some(msg) = msg {
                    connection::send_frame(writer, &msg.encode()).await?;
                }
            }
        }
    }
}

/// Write through a temp file and rename, so readers never see a torn
/// document.
async fn persist_notebook_bytes(data: &[u8], path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("automerge.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}
