//! The notebook the human is currently looking at.
//!
//! A single optional path: written by the editor UI whenever focus changes,
//! read by tool calls that do not name a notebook. Backed by a `watch`
//! channel so readers always see the latest value and interested parties can
//! await changes.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ActiveNotebook {
    tx: watch::Sender<Option<String>>,
}

impl Default for ActiveNotebook {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveNotebook {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Replace the active notebook. Returns whether the value changed;
    /// subscribers are only woken on a change.
    pub fn set(&self, path: Option<String>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == path {
                false
            } else {
                *current = path;
                true
            }
        })
    }

    pub fn get(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Receiver that is notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}
