//! Instance discovery.
//!
//! Every running host writes one JSON descriptor into a shared directory and
//! removes it again on exit. Readers never cache the directory: hosts come
//! and go between tool calls, and a host that crashed leaves its file behind,
//! so every listing re-reads the files and probes each endpoint.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Connection descriptor advertised by a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    /// Required in the handshake when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Process ID of the host.
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub version: String,
    pub advertised_at: DateTime<Utc>,
}

impl InstanceDescriptor {
    pub fn new(instance_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            token: None,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            advertised_at: Utc::now(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which instance a caller wants. Empty means "the only one running".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InstanceSelector {
    pub instance_id: Option<String>,
    pub port: Option<u16>,
}

impl InstanceSelector {
    pub fn by_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            port: None,
        }
    }

    pub fn by_port(port: u16) -> Self {
        Self {
            instance_id: None,
            port: Some(port),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instance_id.is_none() && self.port.is_none()
    }
}

/// Reads and writes instance descriptors in one directory.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    dir: PathBuf,
    probe_timeout: Duration,
}

impl InstanceRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            probe_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn descriptor_path(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", instance_id))
    }

    /// Write `descriptor` and return a guard that removes it on drop.
    pub fn advertise(&self, descriptor: &InstanceDescriptor) -> std::io::Result<Advertisement> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.descriptor_path(&descriptor.instance_id);
        let json = serde_json::to_string_pretty(descriptor)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        // Write-then-rename so readers never see a half-written file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        info!(
            "[registry] Advertised {} at {} ({:?})",
            descriptor.instance_id,
            descriptor.endpoint(),
            path
        );
        Ok(Advertisement { path })
    }

    /// Every descriptor on disk, reachable or not. Unparseable files are skipped.
    pub fn read_descriptors(&self) -> Vec<InstanceDescriptor> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("[registry] No instances dir {:?}: {}", self.dir, e);
                return Vec::new();
            }
        };

        let mut descriptors: Vec<InstanceDescriptor> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let content = std::fs::read_to_string(&path).ok()?;
                match serde_json::from_str(&content) {
                    Ok(descriptor) => Some(descriptor),
                    Err(e) => {
                        warn!("[registry] Ignoring malformed descriptor {:?}: {}", path, e);
                        None
                    }
                }
            })
            .collect();
        descriptors.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        descriptors
    }

    /// Reachable instances, re-read from disk on every call.
    pub async fn list_instances(&self) -> Vec<InstanceDescriptor> {
        let mut reachable = Vec::new();
        for descriptor in self.read_descriptors() {
            if self.probe(&descriptor).await {
                reachable.push(descriptor);
            } else {
                debug!(
                    "[registry] Discarding stale instance {} at {}",
                    descriptor.instance_id,
                    descriptor.endpoint()
                );
            }
        }
        reachable
    }

    async fn probe(&self, descriptor: &InstanceDescriptor) -> bool {
        let endpoint = descriptor.endpoint();
        matches!(
            tokio::time::timeout(self.probe_timeout, tokio::net::TcpStream::connect(&endpoint)).await,
            Ok(Ok(_))
        )
    }

    /// Pick one reachable instance.
    pub async fn resolve(&self, selector: &InstanceSelector) -> BridgeResult<InstanceDescriptor> {
        let instances = self.list_instances().await;
        select_instance(instances, selector)
    }
}

/// Selector precedence: instance id, then port, then the sole instance.
///
/// A lone instance is returned even when the selector names something else,
/// since there is nothing else it could have meant.
pub fn select_instance(
    mut instances: Vec<InstanceDescriptor>,
    selector: &InstanceSelector,
) -> BridgeResult<InstanceDescriptor> {
    if instances.is_empty() {
        return Err(BridgeError::not_found("running instance"));
    }

    if let Some(id) = &selector.instance_id {
        if let Some(i) = instances.iter().position(|d| &d.instance_id == id) {
            return Ok(instances.swap_remove(i));
        }
    }
    if let Some(port) = selector.port {
        if let Some(i) = instances.iter().position(|d| d.port == port) {
            return Ok(instances.swap_remove(i));
        }
    }

    if instances.len() == 1 {
        let sole = instances.swap_remove(0);
        if !selector.is_empty() {
            warn!(
                "[registry] Selector {:?} matched nothing; using sole instance {}",
                selector, sole.instance_id
            );
        }
        return Ok(sole);
    }

    if selector.is_empty() {
        return Err(BridgeError::AmbiguousInstance {
            candidates: instances.into_iter().map(|d| d.instance_id).collect(),
        });
    }

    let what = match (&selector.instance_id, selector.port) {
        (Some(id), _) => format!("instance {}", id),
        (None, Some(port)) => format!("instance on port {}", port),
        (None, None) => "instance".to_string(),
    };
    Err(BridgeError::not_found(what))
}

/// Removes the advertised descriptor when dropped.
#[derive(Debug)]
pub struct Advertisement {
    path: PathBuf,
}

impl Advertisement {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        if self.path.exists() {
            std::fs::remove_file(&self.path).ok();
        }
        info!("[registry] Withdrew advertisement {:?}", self.path);
    }
}
