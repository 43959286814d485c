//! Shared harness: a real host on an ephemeral port with a scripted kernel.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use nbbridge::host::{Host, HostConfig};
use nbbridge::kernel::{error_output, ExecutionOutcome, KernelDriver, KernelEvent};
use nbbridge::protocol::ExecutionStatus;
use nbbridge::registry::InstanceRegistry;
use nbbridge::session::SessionConnector;
use nbbridge::BridgeConfig;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A kernel that understands a handful of statements:
///
/// - `sleep:<ms>` runs that long (interruptible), then prints `done`
/// - `spin:<ms>` acknowledges interrupts but runs to completion anyway
/// - `die` kills the kernel mid-run and never finishes
/// - `raise` prints `partial` and fails with `ZeroDivisionError`
/// - `print(<text>)` prints the text
/// - `<name> = <value>` stores a variable
/// - the variable-listing snippet prints the stored variables as JSON
/// - anything else is echoed back as an `execute_result`
pub struct ScriptedKernel {
    count: AtomicI64,
    running: AtomicBool,
    interrupt_requested: AtomicBool,
    alive: AtomicBool,
    variables: Mutex<BTreeMap<String, (String, String)>>,
    garbled_listing: AtomicBool,
}

impl ScriptedKernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicI64::new(0),
            running: AtomicBool::new(false),
            interrupt_requested: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            variables: Mutex::new(BTreeMap::new()),
            garbled_listing: AtomicBool::new(false),
        })
    }

    /// Make the variable listing print something that is not JSON.
    pub fn garble_listing(&self) {
        self.garbled_listing.store(true, Ordering::SeqCst);
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Bring the kernel back as if it had been restarted.
    pub fn revive(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
    }

    fn stdout(text: &str) -> KernelEvent {
        KernelEvent::Output(json!({"output_type": "stream", "name": "stdout", "text": text}))
    }

    async fn run(
        &self,
        code: &str,
        count: i64,
        events: &mpsc::UnboundedSender<KernelEvent>,
    ) -> Result<ExecutionStatus> {
        let code = code.trim();

        if let Some(ms) = code.strip_prefix("sleep:") {
            let ms: u64 = ms.parse()?;
            let mut waited = 0;
            while waited < ms {
                if self.interrupt_requested.swap(false, Ordering::SeqCst) {
                    events.send(KernelEvent::Output(error_output(
                        "KeyboardInterrupt",
                        "",
                    )))?;
                    return Ok(ExecutionStatus::Interrupted);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                waited += 10;
            }
            events.send(Self::stdout("done\n"))?;
            return Ok(ExecutionStatus::Completed);
        }

        if let Some(ms) = code.strip_prefix("spin:") {
            tokio::time::sleep(Duration::from_millis(ms.parse()?)).await;
            events.send(Self::stdout("spun\n"))?;
            return Ok(ExecutionStatus::Completed);
        }

        if code == "die" {
            self.kill();
            std::future::pending::<()>().await;
        }

        if code == "raise" {
            events.send(Self::stdout("partial\n"))?;
            events.send(KernelEvent::Output(json!({
                "output_type": "error",
                "ename": "ZeroDivisionError",
                "evalue": "division by zero",
                "traceback": ["Traceback (most recent call last)", "ZeroDivisionError: division by zero"]
            })))?;
            return Ok(ExecutionStatus::Errored);
        }

        if code.contains("__nbbridge_list_variables") {
            if self.garbled_listing.load(Ordering::SeqCst) {
                events.send(Self::stdout("<<not json>>\n"))?;
                return Ok(ExecutionStatus::Completed);
            }
            let listing: BTreeMap<_, _> = self
                .variables
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .iter()
                .map(|(name, (ty, repr))| (name.clone(), json!({"type": ty, "repr": repr})))
                .collect();
            // Split across two stream messages like a real kernel may.
            let text = format!("{}\n", serde_json::to_string(&listing)?);
            let (head, tail) = text.split_at(text.len() / 2);
            events.send(Self::stdout(head))?;
            events.send(Self::stdout(tail))?;
            return Ok(ExecutionStatus::Completed);
        }

        if let Some(text) = code.strip_prefix("print(").and_then(|c| c.strip_suffix(')')) {
            events.send(Self::stdout(&format!("{}\n", text.trim_matches('"'))))?;
            return Ok(ExecutionStatus::Completed);
        }

        if let Some((name, value)) = code.split_once('=') {
            let (name, value) = (name.trim(), value.trim());
            let ty = if value.parse::<i64>().is_ok() {
                "int"
            } else if value.parse::<f64>().is_ok() {
                "float"
            } else {
                "str"
            };
            self.variables
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .insert(name.to_string(), (ty.to_string(), value.to_string()));
            return Ok(ExecutionStatus::Completed);
        }

        events.send(KernelEvent::Output(json!({
            "output_type": "execute_result",
            "execution_count": count,
            "data": {"text/plain": code},
            "metadata": {}
        })))?;
        Ok(ExecutionStatus::Completed)
    }
}

impl KernelDriver for ScriptedKernel {
    fn kernel_name(&self) -> &str {
        "scripted"
    }

    fn execute(
        &self,
        code: String,
        events: mpsc::UnboundedSender<KernelEvent>,
    ) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async move {
            let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            self.interrupt_requested.store(false, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            events.send(KernelEvent::Started {
                execution_count: Some(count),
            })?;
            let status = self.run(&code, count, &events).await;
            self.running.store(false, Ordering::SeqCst);
            Ok(ExecutionOutcome {
                status: status?,
                execution_count: Some(count),
            })
        })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let running = self.running.load(Ordering::SeqCst);
            if running {
                self.interrupt_requested.store(true, Ordering::SeqCst);
            }
            Ok(running)
        })
    }

    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.alive.load(Ordering::SeqCst) })
    }
}

pub struct TestHost {
    pub host: Arc<Host>,
    pub kernel: Arc<ScriptedKernel>,
    pub instances_dir: PathBuf,
    handle: JoinHandle<()>,
}

impl TestHost {
    /// Path of a notebook inside the temp dir.
    pub fn notebook_path(temp: &TempDir, name: &str) -> String {
        temp.path().join(name).to_string_lossy().into_owned()
    }

    /// Start a host in `temp` with `notebooks` open. The first notebook gets
    /// the scripted kernel.
    pub async fn start(temp: &TempDir, notebooks: &[&str]) -> Self {
        Self::start_with(temp, notebooks, |_| {}).await
    }

    pub async fn start_with(
        temp: &TempDir,
        notebooks: &[&str],
        configure: impl FnOnce(&mut HostConfig),
    ) -> Self {
        let instances_dir = temp.path().join("instances");
        let mut config = HostConfig {
            instances_dir: instances_dir.clone(),
            docs_dir: temp.path().join("docs"),
            ..Default::default()
        };
        configure(&mut config);

        let host = Host::new(config).await.unwrap();
        let kernel = ScriptedKernel::new();
        for (i, name) in notebooks.iter().enumerate() {
            let driver: Option<Arc<dyn KernelDriver>> =
                (i == 0).then(|| kernel.clone() as Arc<dyn KernelDriver>);
            host.open_notebook(&Self::notebook_path(temp, name), driver)
                .await
                .unwrap();
        }

        let runner = host.clone();
        let handle = tokio::spawn(async move {
            runner.run().await.ok();
        });
        assert!(
            wait_for_advertisement(&instances_dir, host.instance_id(), Duration::from_secs(5))
                .await,
            "host did not advertise"
        );

        Self {
            host,
            kernel,
            instances_dir,
            handle,
        }
    }

    pub fn connector(&self) -> Arc<SessionConnector> {
        Arc::new(
            BridgeConfig {
                instances_dir: self.instances_dir.clone(),
                ..Default::default()
            }
            .connector(),
        )
    }

    pub async fn stop(self) {
        self.host.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), self.handle).await;
    }
}

async fn wait_for_advertisement(dir: &Path, instance_id: &str, timeout: Duration) -> bool {
    let registry = InstanceRegistry::new(dir);
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if registry
            .read_descriptors()
            .iter()
            .any(|d| d.instance_id == instance_id)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Poll `check` until it returns true.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
