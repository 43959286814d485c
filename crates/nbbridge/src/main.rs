//! nbbridge CLI entry point.
//!
//! `nbbridge mcp` serves the notebook tools over stdio for an MCP client.
//! `nbbridge host` runs an instance host with notebooks and kernels. The
//! remaining commands inspect running hosts or stand in for the editor UI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use log::info;
use nbbridge::host::{Host, HostConfig, NotebookSpec};
use nbbridge::mcp::NotebookTools;
use nbbridge::protocol::{Request, Response};
use nbbridge::registry::InstanceRegistry;
use nbbridge::BridgeConfig;

#[derive(Parser, Debug)]
#[command(name = "nbbridge")]
#[command(about = "Bridge MCP tool calls to live notebook sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory where running hosts advertise themselves
    #[arg(long, global = true, env = "NBBRIDGE_INSTANCES_DIR")]
    instances_dir: Option<PathBuf>,
}

/// Which host to talk to.
#[derive(Args, Debug, Clone)]
struct TargetArgs {
    #[arg(long)]
    instance_id: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Overrides the token from the instance descriptor
    #[arg(long, env = "NBBRIDGE_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the notebook tools over MCP stdio
    Mcp {
        #[command(flatten)]
        target: TargetArgs,

        /// Default execution timeout in seconds
        #[arg(long, default_value = "30")]
        execution_timeout: u64,
    },

    /// Run an instance host
    Host {
        /// JSON host configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (0 = ephemeral)
        #[arg(long)]
        port: Option<u16>,

        /// Require clients to present this token
        #[arg(long, env = "NBBRIDGE_TOKEN")]
        token: Option<String>,

        /// Notebook to open, optionally with a kernel: PATH[=CONNECTION_FILE]
        #[arg(long = "notebook")]
        notebooks: Vec<String>,
    },

    /// List reachable hosts
    Instances {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show a host's connected client count
    Status {
        #[command(flatten)]
        target: TargetArgs,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Tell a host which notebook has focus
    NotifyActive {
        #[command(flatten)]
        target: TargetArgs,

        /// Notebook path; omit to clear
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the MCP transport; env_logger writes to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let instances_dir = cli
        .instances_dir
        .unwrap_or_else(nbbridge::default_instances_dir);

    match cli.command {
        Commands::Mcp {
            target,
            execution_timeout,
        } => {
            let mut config = bridge_config(instances_dir, target);
            config.execution_timeout = Duration::from_secs(execution_timeout);
            run_mcp(config).await
        }
        Commands::Host {
            config,
            port,
            token,
            notebooks,
        } => {
            let mut host_config = match config {
                Some(path) => HostConfig::load(&path)?,
                None => HostConfig::default(),
            };
            host_config.instances_dir = instances_dir;
            if let Some(port) = port {
                host_config.port = port;
            }
            if token.is_some() {
                host_config.token = token;
            }
            host_config
                .notebooks
                .extend(notebooks.iter().map(|arg| parse_notebook_arg(arg)));
            run_host(host_config).await
        }
        Commands::Instances { json } => instances(instances_dir, json).await,
        Commands::Status { target, json } => status(bridge_config(instances_dir, target), json).await,
        Commands::NotifyActive { target, path } => {
            notify_active(bridge_config(instances_dir, target), path).await
        }
    }
}

fn bridge_config(instances_dir: PathBuf, target: TargetArgs) -> BridgeConfig {
    BridgeConfig {
        instances_dir,
        instance_id: target.instance_id,
        port: target.port,
        token: target.token,
        ..Default::default()
    }
}

fn parse_notebook_arg(arg: &str) -> NotebookSpec {
    match arg.split_once('=') {
        Some((path, file)) => NotebookSpec {
            path: path.to_string(),
            connection_file: Some(PathBuf::from(file)),
        },
        None => NotebookSpec {
            path: arg.to_string(),
            connection_file: None,
        },
    }
}

async fn run_mcp(config: BridgeConfig) -> anyhow::Result<()> {
    info!(
        "[mcp] Serving notebook tools (instances in {:?})",
        config.instances_dir
    );
    let tools = NotebookTools::new(Arc::new(config.connector()))
        .with_execution_timeout(config.execution_timeout);
    tools.serve_stdio().await?;
    Ok(())
}

async fn run_host(config: HostConfig) -> anyhow::Result<()> {
    info!("nbbridge host starting...");
    info!("  Instances dir: {:?}", config.instances_dir);
    info!("  Docs dir: {:?}", config.docs_dir);
    info!("  Notebooks: {}", config.notebooks.len());

    let host = Host::new(config).await?;
    let server = tokio::spawn(host.clone().run());

    tokio::signal::ctrl_c().await?;
    host.shutdown().await;
    server.await??;
    Ok(())
}

async fn instances(instances_dir: PathBuf, json: bool) -> anyhow::Result<()> {
    let instances = InstanceRegistry::new(instances_dir).list_instances().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!("No running instances.");
        return Ok(());
    }
    for instance in instances {
        println!(
            "{}  {}  pid={}  since {}",
            instance.instance_id,
            instance.endpoint(),
            instance.pid,
            instance.advertised_at
        );
    }
    Ok(())
}

async fn status(config: BridgeConfig, json: bool) -> anyhow::Result<()> {
    let connector = config.connector();
    let descriptor = connector.resolve(None).await?;
    let (status, connected_clients) = match connector.request(None, Request::Status).await? {
        Response::Status {
            status,
            connected_clients,
        } => (status, connected_clients),
        other => bail!("unexpected response: {:?}", other),
    };

    if json {
        let output = serde_json::json!({
            "instance_id": descriptor.instance_id,
            "endpoint": descriptor.endpoint(),
            "status": status,
            "connected_clients": connected_clients,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Instance:          {}", descriptor.instance_id);
        println!("Endpoint:          {}", descriptor.endpoint());
        println!("Status:            {}", status);
        println!("Connected clients: {}", connected_clients);
    }
    Ok(())
}

async fn notify_active(config: BridgeConfig, path: Option<String>) -> anyhow::Result<()> {
    let connector = config.connector();
    connector
        .request(None, Request::SetActiveNotebook { path: path.clone() })
        .await?;
    match path {
        Some(path) => println!("Active notebook: {}", path),
        None => println!("Active notebook cleared"),
    }
    Ok(())
}
