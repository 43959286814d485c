//! Editor-side replica of one hosted notebook.
//!
//! A notebook window opens a `notebook_sync` channel and keeps its own
//! `NotebookDoc` in step with the host through the Automerge sync protocol.
//! Local edits are applied to the replica and pushed; edits from the bridge
//! or other windows arrive as sync messages and merge in.

use std::time::Duration;

use automerge::sync;
use log::{debug, info};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::connection::{self, Handshake, HandshakeReply};
use crate::notebook_doc::{DocError, NotebookDoc};
use crate::protocol::{Cell, CellType};
use crate::registry::InstanceDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum SyncClientError {
    #[error("Failed to connect: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Sync protocol error: {0}")]
    SyncError(String),

    #[error("Rejected by host: {0}")]
    Rejected(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Disconnected")]
    Disconnected,

    #[error(transparent)]
    Document(#[from] DocError),
}

/// A live replica of one notebook.
pub struct NotebookSyncClient {
    doc: NotebookDoc,
    peer_state: sync::State,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl NotebookSyncClient {
    /// Connect to `descriptor`'s host, join `path`, and pull the current
    /// document.
    pub async fn connect(
        descriptor: &InstanceDescriptor,
        path: &str,
        timeout: Duration,
    ) -> Result<Self, SyncClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(descriptor.endpoint()))
            .await
            .map_err(|_| SyncClientError::Timeout)??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let handshake = Handshake::NotebookSync {
            path: path.to_string(),
            token: descriptor.token.clone(),
        };
        connection::send_json_frame(&mut writer, &handshake)
            .await
            .map_err(|e| SyncClientError::SyncError(format!("handshake: {}", e)))?;
        let reply: Option<HandshakeReply> = connection::recv_json_frame(&mut reader)
            .await
            .map_err(|e| SyncClientError::SyncError(format!("handshake: {}", e)))?;
        match reply {
            Some(HandshakeReply::Ok) => {}
            Some(HandshakeReply::Unauthorized) => {
                return Err(SyncClientError::Rejected("unauthorized".to_string()))
            }
            Some(HandshakeReply::NotFound { what }) => {
                return Err(SyncClientError::Rejected(format!("{} not found", what)))
            }
            None => return Err(SyncClientError::Disconnected),
        }

        info!("[sync-client] Joined {} on {}", path, descriptor.instance_id);

        let mut client = Self {
            doc: NotebookDoc::replica(),
            peer_state: sync::State::new(),
            reader,
            writer,
        };
        client.initial_sync().await?;
        Ok(client)
    }

    /// The host speaks first; exchange rounds until it goes quiet.
    async fn initial_sync(&mut self) -> Result<(), SyncClientError> {
        let first = connection::recv_frame(&mut self.reader)
            .await?
            .ok_or(SyncClientError::Disconnected)?;
        self.apply(&first)?;
        self.push().await?;

        loop {
            match tokio::time::timeout(
                Duration::from_millis(100),
                connection::recv_frame(&mut self.reader),
            )
            .await
            {
                Ok(Ok(Some(data))) => {
                    self.apply(&data)?;
                    self.push().await?;
                }
                Ok(Ok(None)) => return Err(SyncClientError::Disconnected),
                Ok(Err(e)) => return Err(SyncClientError::ConnectionFailed(e)),
                Err(_) => break,
            }
        }

        debug!(
            "[sync-client] Initial sync complete ({} cells)",
            self.doc.cell_count()
        );
        Ok(())
    }

    fn apply(&mut self, data: &[u8]) -> Result<(), SyncClientError> {
        let message = sync::Message::decode(data)
            .map_err(|e| SyncClientError::SyncError(format!("decode: {}", e)))?;
        self.doc
            .receive_sync_message(&mut self.peer_state, message)
            .map_err(|e| SyncClientError::SyncError(format!("receive: {}", e)))
    }

    /// Send whatever the host has not seen yet.
    async fn push(&mut self) -> Result<(), SyncClientError> {
        if let Some(msg) = self.doc.generate_sync_message(&mut self.peer_state) {
            connection::send_frame(&mut self.writer, &msg.encode()).await?;
        }
        Ok(())
    }

    pub fn cells(&self) -> Vec<Cell> {
        self.doc.cells()
    }

    /// Type into a cell, as a human would.
    pub async fn edit_source(&mut self, index: usize, source: &str) -> Result<(), SyncClientError> {
        self.doc.update_source(index, source)?;
        self.push().await
    }

    pub async fn insert_cell(
        &mut self,
        index: usize,
        cell_type: CellType,
        source: &str,
    ) -> Result<Cell, SyncClientError> {
        let cell = self.doc.insert_cell(index, cell_type, source)?;
        self.push().await?;
        Ok(cell)
    }

    pub async fn delete_cell(&mut self, index: usize) -> Result<(), SyncClientError> {
        self.doc.delete_cell(index)?;
        self.push().await
    }

    /// Wait for the next sync message from the host, merge it, and return
    /// the replica's cells.
    pub async fn recv_changes(&mut self) -> Result<Vec<Cell>, SyncClientError> {
        let data = connection::recv_frame(&mut self.reader)
            .await?
            .ok_or(SyncClientError::Disconnected)?;
        self.apply(&data)?;
        self.push().await?;
        Ok(self.cells())
    }

    /// Keep merging until `predicate` holds on the replica's cells.
    pub async fn wait_until<F>(
        &mut self,
        timeout: Duration,
        mut predicate: F,
    ) -> Result<Vec<Cell>, SyncClientError>
    where
        F: FnMut(&[Cell]) -> bool,
    {
        let cells = self.cells();
        if predicate(&cells) {
            return Ok(cells);
        }
        tokio::time::timeout(timeout, async {
            loop {
                let cells = self.recv_changes().await?;
                if predicate(&cells) {
                    return Ok(cells);
                }
            }
        })
        .await
        .map_err(|_| SyncClientError::Timeout)?
    }
}
