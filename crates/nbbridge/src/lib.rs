//! nbbridge - Bridges MCP tool calls to live, collaboratively edited notebooks.
//!
//! An instance host (`host`) owns open notebooks as Automerge documents,
//! syncs them with the human's editor windows, and runs code on attached
//! kernels. The bridge side finds hosts through advertisement files
//! (`registry`), keeps one control channel per host (`session`), and exposes
//! notebook editing (`document`) and execution (`execution`) as MCP tools
//! (`mcp`).
//!
//! Hosts and bridges talk over TCP using length-prefixed frames with a
//! channel-based handshake (`connection`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod active;
pub mod connection;
pub mod document;
pub mod error;
pub mod execution;
pub mod host;
pub mod kernel;
pub mod mcp;
pub mod notebook_doc;
pub mod notebook_room;
pub mod position;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sync_client;

/// How long the bridge waits for a host's control channel to open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a tool call waits for an execution to finish.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Paths
// ============================================================================

/// Base directory for all bridge state: `~/.cache/nbbridge/`.
pub fn bridge_base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("nbbridge")
}

/// Where running hosts advertise themselves.
pub fn default_instances_dir() -> PathBuf {
    bridge_base_dir().join("instances")
}

/// Where hosts persist notebook Automerge documents.
pub fn default_docs_dir() -> PathBuf {
    bridge_base_dir().join("notebook-docs")
}

// ============================================================================
// Bridge configuration
// ============================================================================

/// Settings for the bridge side (the MCP server).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub instances_dir: PathBuf,
    /// Preferred instance when several are running.
    pub instance_id: Option<String>,
    pub port: Option<u16>,
    /// Overrides the token from the instance descriptor.
    pub token: Option<String>,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub execution_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            instances_dir: default_instances_dir(),
            instance_id: None,
            port: None,
            token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    pub fn selector(&self) -> registry::InstanceSelector {
        registry::InstanceSelector {
            instance_id: self.instance_id.clone(),
            port: self.port,
        }
    }

    pub fn connector(&self) -> session::SessionConnector {
        session::SessionConnector::new(registry::InstanceRegistry::new(&self.instances_dir))
            .with_connect_timeout(self.connect_timeout)
            .with_token(self.token.clone())
            .with_default_selector(self.selector())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
