//! Automerge-backed notebook document.
//!
//! The host holds one `NotebookDoc` per open notebook path; editor windows
//! hold replicas that sync with it via the Automerge sync protocol. All
//! changes are recorded as operations in the document's history, so a
//! human's in-flight edit merges with the bridge's edits instead of being
//! overwritten by them.
//!
//! ## Document schema
//!
//! ```text
//! ROOT/
//!   notebook_path: Str
//!   cells/                        ← Map keyed by cell id
//!     {id}/
//!       id: Str
//!       cell_type: Str            ← "code" | "markdown" | "raw"
//!       position: Str             ← fractional key, see `position.rs`
//!       source: Text              ← character-level merging
//!       execution_count: Str      ← JSON-encoded i64 or "null"
//!       outputs/                  ← List of Str
//!         [j]: Str                ← JSON-encoded nbformat output
//!       metadata: Str             ← JSON object
//!   metadata/                     ← Map of JSON-encoded values
//! ```
//!
//! Cell order is `(position, id)` ascending. Keeping cells in a map rather
//! than a list lets `move_cell` rewrite one `position` instead of deleting
//! and re-inserting the cell, so no peer ever observes the cell missing.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use automerge::sync;
use automerge::sync::SyncDoc;
use automerge::transaction::Transactable;
use automerge::{AutoCommit, AutomergeError, ObjId, ObjType, ReadDoc};
use log::{info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::position::{self, PositionError};
use crate::protocol::{Cell, CellType};

#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("cell index {index} out of range ({len} cells)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("cell {0} not found")]
    CellNotFound(String),

    #[error("document has no cells map")]
    MissingCells,

    #[error(transparent)]
    Automerge(#[from] AutomergeError),

    #[error(transparent)]
    Position(#[from] PositionError),
}

impl From<DocError> for BridgeError {
    fn from(err: DocError) -> Self {
        match err {
            DocError::IndexOutOfRange { index, len } => BridgeError::IndexOutOfRange { index, len },
            DocError::CellNotFound(id) => BridgeError::not_found(format!("cell {id}")),
            other => BridgeError::protocol(other),
        }
    }
}

/// A cell's place in the current order.
#[derive(Debug, Clone)]
struct Slot {
    position: String,
    id: String,
    obj: ObjId,
}

/// Wrapper around an Automerge document storing a notebook.
pub struct NotebookDoc {
    doc: AutoCommit,
}

impl NotebookDoc {
    /// Create a new empty notebook document for `notebook_path`.
    pub fn new(notebook_path: &str) -> Result<Self, DocError> {
        let mut doc = AutoCommit::new();
        doc.put(automerge::ROOT, "notebook_path", notebook_path)?;
        doc.put_object(automerge::ROOT, "cells", ObjType::Map)?;
        doc.put_object(automerge::ROOT, "metadata", ObjType::Map)?;
        Ok(Self { doc })
    }

    /// An empty replica that receives its content through sync.
    pub fn replica() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }

    pub fn load(data: &[u8]) -> Result<Self, AutomergeError> {
        let doc = AutoCommit::load(data)?;
        Ok(Self { doc })
    }

    /// Load from file or create a new document if the file doesn't exist.
    ///
    /// A file that exists but cannot be decoded is renamed to
    /// `{path}.corrupt` and a fresh document is created in its place.
    pub fn load_or_create(path: &Path, notebook_path: &str) -> Result<Self, DocError> {
        if path.exists() {
            match std::fs::read(path) {
                Ok(data) => match Self::load(&data) {
                    Ok(doc) => {
                        info!(
                            "[notebook-doc] Loaded {} from {:?}",
                            notebook_path, path
                        );
                        return Ok(doc);
                    }
                    Err(e) => {
                        warn!(
                            "[notebook-doc] Corrupt doc at {:?} for {}: {}",
                            path, notebook_path, e
                        );
                        Self::preserve_corrupt(path);
                    }
                },
                Err(e) => {
                    warn!(
                        "[notebook-doc] Failed to read {:?} for {}: {}",
                        path, notebook_path, e
                    );
                    Self::preserve_corrupt(path);
                }
            }
        }

        info!("[notebook-doc] Creating new doc for {}", notebook_path);
        Self::new(notebook_path)
    }

    fn preserve_corrupt(path: &Path) {
        let corrupt_path = path.with_extension("automerge.corrupt");
        match std::fs::rename(path, &corrupt_path) {
            Ok(()) => warn!("[notebook-doc] Corrupt file preserved at {:?}", corrupt_path),
            Err(e) => warn!(
                "[notebook-doc] Failed to rename corrupt file {:?}: {}",
                path, e
            ),
        }
    }

    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    pub fn notebook_path(&self) -> Option<String> {
        read_str(&self.doc, automerge::ROOT, "notebook_path")
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn cell_count(&self) -> usize {
        self.slots().len()
    }

    /// All cells in order, read at the document's current heads.
    pub fn cells(&self) -> Vec<Cell> {
        self.slots()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| self.read_cell(index, &slot.obj))
            .collect()
    }

    pub fn cell(&self, index: usize) -> Result<Cell, DocError> {
        let slots = self.slots();
        let slot = slots.get(index).ok_or(DocError::IndexOutOfRange {
            index,
            len: slots.len(),
        })?;
        self.read_cell(index, &slot.obj)
            .ok_or_else(|| DocError::CellNotFound(slot.id.clone()))
    }

    // ── Cell operations ─────────────────────────────────────────────

    /// Insert a new cell before `index`; `index == cell_count()` appends.
    pub fn insert_cell(
        &mut self,
        index: usize,
        cell_type: CellType,
        source: &str,
    ) -> Result<Cell, DocError> {
        let id = Uuid::new_v4().to_string();
        self.insert_cell_with_id(index, &id, cell_type, source)?;
        self.cell(index)
    }

    fn insert_cell_with_id(
        &mut self,
        index: usize,
        cell_id: &str,
        cell_type: CellType,
        source: &str,
    ) -> Result<ObjId, DocError> {
        let cells_id = self.cells_map_id().ok_or(DocError::MissingCells)?;
        let mut slots = self.slots();
        if index > slots.len() {
            return Err(DocError::IndexOutOfRange {
                index,
                len: slots.len(),
            });
        }
        let position = self.position_for(&mut slots, index)?;

        let cell = self.doc.put_object(&cells_id, cell_id, ObjType::Map)?;
        self.doc.put(&cell, "id", cell_id)?;
        self.doc.put(&cell, "cell_type", cell_type.as_str())?;
        self.doc.put(&cell, "position", position)?;
        let text = self.doc.put_object(&cell, "source", ObjType::Text)?;
        if !source.is_empty() {
            self.doc.update_text(&text, source)?;
        }
        self.doc.put(&cell, "execution_count", "null")?;
        self.doc.put_object(&cell, "outputs", ObjType::List)?;
        self.doc.put(&cell, "metadata", "{}")?;
        Ok(cell)
    }

    /// Replace a cell's source text.
    ///
    /// `update_text` diffs against the current text, so only the changed
    /// span becomes new operations and concurrent edits elsewhere survive.
    /// Outputs and execution count are left alone.
    pub fn update_source(&mut self, index: usize, source: &str) -> Result<(), DocError> {
        let slot = self.slot(index)?;
        let text = match text_id(&self.doc, &slot.obj, "source") {
            Some(text) => text,
            None => self.doc.put_object(&slot.obj, "source", ObjType::Text)?,
        };
        self.doc.update_text(&text, source)?;
        Ok(())
    }

    /// Remove the cell at `index`, returning what it contained.
    pub fn delete_cell(&mut self, index: usize) -> Result<Cell, DocError> {
        let cells_id = self.cells_map_id().ok_or(DocError::MissingCells)?;
        let slot = self.slot(index)?;
        let removed = self
            .read_cell(index, &slot.obj)
            .ok_or_else(|| DocError::CellNotFound(slot.id.clone()))?;
        self.doc.delete(&cells_id, slot.id.as_str())?;
        Ok(removed)
    }

    /// Move a cell: the result equals removing `from` and inserting the same
    /// cell at `to` in the shortened list (`to == cell_count()` appends).
    ///
    /// Only the moved cell's position changes.
    pub fn move_cell(&mut self, from: usize, to: usize) -> Result<(), DocError> {
        let mut slots = self.slots();
        let len = slots.len();
        if from >= len {
            return Err(DocError::IndexOutOfRange { index: from, len });
        }
        if to > len {
            return Err(DocError::IndexOutOfRange { index: to, len });
        }

        let moving = slots.remove(from);
        let target = to.min(slots.len());
        if target == from {
            return Ok(());
        }
        let position = self.position_for(&mut slots, target)?;
        self.doc.put(&moving.obj, "position", position)?;
        Ok(())
    }

    /// Clear outputs and execution counts of one code cell, or of every
    /// code cell when `index` is `None`. Other cell types are untouched.
    pub fn clear_outputs(&mut self, index: Option<usize>) -> Result<(), DocError> {
        let targets = match index {
            Some(index) => vec![self.slot(index)?],
            None => self.slots(),
        };
        for slot in targets {
            if read_str(&self.doc, &slot.obj, "cell_type").as_deref() == Some("code") {
                self.replace_outputs(&slot.obj, &[])?;
                self.doc.put(&slot.obj, "execution_count", "null")?;
            }
        }
        Ok(())
    }

    /// Store an execution result on the cell with `cell_id`.
    pub fn write_result(
        &mut self,
        cell_id: &str,
        outputs: &[Value],
        execution_count: Option<i64>,
    ) -> Result<(), DocError> {
        let obj = self
            .cell_obj(cell_id)
            .ok_or_else(|| DocError::CellNotFound(cell_id.to_string()))?;
        self.replace_outputs(&obj, outputs)?;
        let count = match execution_count {
            Some(n) => n.to_string(),
            None => "null".to_string(),
        };
        self.doc.put(&obj, "execution_count", count)?;
        Ok(())
    }

    // ── Metadata ────────────────────────────────────────────────────

    pub fn metadata(&self) -> BTreeMap<String, Value> {
        let Some(meta) = map_id(&self.doc, &automerge::ROOT, "metadata") else {
            return BTreeMap::new();
        };
        self.doc
            .keys(&meta)
            .filter_map(|key| {
                let raw = read_str(&self.doc, &meta, key.as_str())?;
                let value = serde_json::from_str(&raw).ok()?;
                Some((key, value))
            })
            .collect()
    }

    pub fn set_metadata(&mut self, key: &str, value: &Value) -> Result<(), DocError> {
        let meta = match map_id(&self.doc, &automerge::ROOT, "metadata") {
            Some(meta) => meta,
            None => self
                .doc
                .put_object(automerge::ROOT, "metadata", ObjType::Map)?,
        };
        self.doc.put(&meta, key, value.to_string())?;
        Ok(())
    }

    // ── Import ──────────────────────────────────────────────────────

    /// Append the cells and metadata of an nbformat v4 notebook.
    ///
    /// Cells keep their nbformat ids; a cell whose id is already taken gets
    /// a fresh one.
    pub fn import_notebook(&mut self, notebook: &nbformat::v4::Notebook) -> Result<(), DocError> {
        let mut taken: HashSet<String> = self.cells().into_iter().map(|c| c.id).collect();
        for cell in &notebook.cells {
            let (id, cell_type, source, outputs, execution_count) = match cell {
                nbformat::v4::Cell::Code {
                    id,
                    source,
                    execution_count,
                    outputs,
                    ..
                } => (
                    id.to_string(),
                    CellType::Code,
                    source.join(""),
                    outputs
                        .iter()
                        .filter_map(|o| serde_json::to_value(o).ok())
                        .collect::<Vec<_>>(),
                    execution_count.map(i64::from),
                ),
                nbformat::v4::Cell::Markdown { id, source, .. } => (
                    id.to_string(),
                    CellType::Markdown,
                    source.join(""),
                    Vec::new(),
                    None,
                ),
                nbformat::v4::Cell::Raw { id, source, .. } => (
                    id.to_string(),
                    CellType::Raw,
                    source.join(""),
                    Vec::new(),
                    None,
                ),
            };
            let id = if id.is_empty() || taken.contains(&id) {
                let fresh = Uuid::new_v4().to_string();
                warn!("[notebook-doc] Duplicate cell id {:?} on import, using {}", id, fresh);
                fresh
            } else {
                id
            };
            taken.insert(id.clone());
            let index = self.cell_count();
            self.insert_cell_with_id(index, &id, cell_type, &source)?;
            if cell_type == CellType::Code {
                self.write_result(&id, &outputs, execution_count)?;
            }
        }

        if let Ok(Value::Object(metadata)) = serde_json::to_value(&notebook.metadata) {
            for (key, value) in metadata {
                self.set_metadata(&key, &value)?;
            }
        }
        Ok(())
    }

    // ── Sync protocol ───────────────────────────────────────────────

    pub fn generate_sync_message(&mut self, peer_state: &mut sync::State) -> Option<sync::Message> {
        self.doc.sync().generate_sync_message(peer_state)
    }

    pub fn receive_sync_message(
        &mut self,
        peer_state: &mut sync::State,
        message: sync::Message,
    ) -> Result<(), AutomergeError> {
        self.doc.sync().receive_sync_message(peer_state, message)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn cells_map_id(&self) -> Option<ObjId> {
        map_id(&self.doc, &automerge::ROOT, "cells")
    }

    fn cell_obj(&self, cell_id: &str) -> Option<ObjId> {
        let cells_id = self.cells_map_id()?;
        map_id(&self.doc, &cells_id, cell_id)
    }

    /// Current cell order.
    fn slots(&self) -> Vec<Slot> {
        let Some(cells_id) = self.cells_map_id() else {
            return Vec::new();
        };
        let mut slots: Vec<Slot> = self
            .doc
            .keys(&cells_id)
            .filter_map(|id| {
                let obj = map_id(&self.doc, &cells_id, id.as_str())?;
                let position = read_str(&self.doc, &obj, "position").unwrap_or_default();
                Some(Slot { position, id, obj })
            })
            .collect();
        slots.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        slots
    }

    fn slot(&self, index: usize) -> Result<Slot, DocError> {
        let mut slots = self.slots();
        let len = slots.len();
        if index >= len {
            return Err(DocError::IndexOutOfRange { index, len });
        }
        Ok(slots.swap_remove(index))
    }

    /// A position key that sorts between `slots[index - 1]` and `slots[index]`.
    ///
    /// Concurrent inserts from different peers can leave two cells with the
    /// same key. When the neighbours leave no room, every cell in `slots` is
    /// given a fresh ascending key first.
    fn position_for(&mut self, slots: &mut [Slot], index: usize) -> Result<String, DocError> {
        let lower = index
            .checked_sub(1)
            .and_then(|i| slots.get(i))
            .map(|s| s.position.clone());
        let upper = slots.get(index).map(|s| s.position.clone());
        match position::between(lower.as_deref(), upper.as_deref()) {
            Ok(key) => Ok(key),
            Err(e) => {
                warn!("[notebook-doc] Re-spacing cell positions: {}", e);
                self.respace(slots)?;
                let lower = index.checked_sub(1).and_then(|i| slots.get(i));
                let upper = slots.get(index);
                Ok(position::between(
                    lower.map(|s| s.position.as_str()),
                    upper.map(|s| s.position.as_str()),
                )?)
            }
        }
    }

    fn respace(&mut self, slots: &mut [Slot]) -> Result<(), DocError> {
        let len = slots.len();
        for (slot, key) in slots.iter_mut().zip(position::sequence(len)) {
            self.doc.put(&slot.obj, "position", key.as_str())?;
            slot.position = key;
        }
        Ok(())
    }

    fn replace_outputs(&mut self, cell: &ObjId, outputs: &[Value]) -> Result<(), DocError> {
        if self.doc.get(cell, "outputs")?.is_some() {
            self.doc.delete(cell, "outputs")?;
        }
        let list = self.doc.put_object(cell, "outputs", ObjType::List)?;
        for (i, output) in outputs.iter().enumerate() {
            self.doc.insert(&list, i, output.to_string())?;
        }
        Ok(())
    }

    fn read_cell(&self, index: usize, cell: &ObjId) -> Option<Cell> {
        let id = read_str(&self.doc, cell, "id")?;
        let cell_type = read_str(&self.doc, cell, "cell_type")
            .and_then(|t| CellType::parse(&t))
            .unwrap_or(CellType::Code);
        let source = text_id(&self.doc, cell, "source")
            .and_then(|text| self.doc.text(&text).ok())
            .unwrap_or_default();
        let execution_count = read_str(&self.doc, cell, "execution_count")
            .and_then(|raw| serde_json::from_str::<Option<i64>>(&raw).ok())
            .flatten();
        let outputs = match list_id(&self.doc, cell, "outputs") {
            Some(list) => (0..self.doc.length(&list))
                .filter_map(|i| read_str(&self.doc, &list, i))
                .filter_map(|raw| serde_json::from_str(&raw).ok())
                .collect(),
            None => Vec::new(),
        };
        let metadata = read_str(&self.doc, cell, "metadata")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| Value::Object(Default::default()));

        Some(Cell {
            index,
            id,
            cell_type,
            source,
            outputs,
            execution_count,
            metadata,
        })
    }
}

// ── Free helpers ─────────────────────────────────────────────────────

fn read_str<O: AsRef<ObjId>, P: Into<automerge::Prop>>(
    doc: &AutoCommit,
    obj: O,
    prop: P,
) -> Option<String> {
    doc.get(obj, prop)
        .ok()
        .flatten()
        .and_then(|(value, _)| match value {
            automerge::Value::Scalar(s) => match s.as_ref() {
                automerge::ScalarValue::Str(s) => Some(s.to_string()),
                _ => None,
            },
            _ => None,
        })
}

fn object_id(doc: &AutoCommit, parent: &ObjId, key: &str, kind: ObjType) -> Option<ObjId> {
    doc.get(parent, key)
        .ok()
        .flatten()
        .and_then(|(value, id)| match value {
            automerge::Value::Object(t) if t == kind => Some(id),
            _ => None,
        })
}

fn map_id(doc: &AutoCommit, parent: &ObjId, key: &str) -> Option<ObjId> {
    object_id(doc, parent, key, ObjType::Map)
}

fn list_id(doc: &AutoCommit, parent: &ObjId, key: &str) -> Option<ObjId> {
    object_id(doc, parent, key, ObjType::List)
}

fn text_id(doc: &AutoCommit, parent: &ObjId, key: &str) -> Option<ObjId> {
    object_id(doc, parent, key, ObjType::Text)
}

/// Deterministic, filesystem-safe name for a notebook's persisted document.
pub fn notebook_doc_filename(notebook_path: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = hex::encode(Sha256::digest(notebook_path.as_bytes()));
    format!("{}.automerge", hash)
}
