//! Integration tests for the host and the bridge components.
//!
//! These tests start a real host on an ephemeral port and talk to it through
//! the registry, the session connector and the document bridge.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, TestHost};
use nbbridge::document::DocumentBridge;
use nbbridge::error::BridgeError;
use nbbridge::execution::{ExecutionProxy, ExecutionState};
use nbbridge::protocol::{CellType, Request, Response};
use nbbridge::registry::{InstanceRegistry, InstanceSelector};
use nbbridge::sync_client::NotebookSyncClient;
use tempfile::TempDir;

async fn seed(bridge: &DocumentBridge, path: &str, sources: &[&str]) {
    for (i, source) in sources.iter().enumerate() {
        bridge
            .insert_cell(None, path, i, CellType::Code, source)
            .await
            .unwrap();
    }
}

async fn sources(bridge: &DocumentBridge, path: &str) -> Vec<String> {
    bridge
        .get_content(None, path)
        .await
        .unwrap()
        .cells
        .into_iter()
        .map(|c| c.source)
        .collect()
}

#[tokio::test]
async fn test_host_advertises_and_withdraws() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let instance_id = host.host.instance_id().to_string();
    let registry = InstanceRegistry::new(&host.instances_dir);

    let instances = registry.list_instances().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, instance_id);
    assert_eq!(instances[0].port, host.host.local_addr().port());

    let resolved = registry
        .resolve(&InstanceSelector::by_port(host.host.local_addr().port()))
        .await
        .unwrap();
    assert_eq!(resolved.instance_id, instance_id);

    let dir = host.instances_dir.clone();
    host.stop().await;
    let registry = InstanceRegistry::new(dir);
    assert!(registry.read_descriptors().is_empty());
    assert_eq!(
        registry.resolve(&InstanceSelector::default()).await.unwrap_err().kind(),
        "not_found"
    );
}

#[tokio::test]
async fn test_stale_descriptor_is_filtered_out() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let registry = InstanceRegistry::new(&host.instances_dir);

    // A descriptor left behind by a host that is gone.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);
    let stale = nbbridge::registry::InstanceDescriptor::new("stale", "127.0.0.1", dead_port);
    let _ad = registry.advertise(&stale).unwrap();
    assert_eq!(registry.read_descriptors().len(), 2);

    let live = registry.list_instances().await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].instance_id, host.host.instance_id());

    // One live instance is picked even without a selector.
    let connector = host.connector();
    let resolved = connector.resolve(None).await.unwrap();
    assert_eq!(resolved.instance_id, host.host.instance_id());

    host.stop().await;
}

#[tokio::test]
async fn test_two_instances_without_selector_are_ambiguous() {
    let temp = TempDir::new().unwrap();
    let first = TestHost::start(&temp, &["a.ipynb"]).await;
    let second = TestHost::start(&temp, &["b.ipynb"]).await;

    let connector = first.connector();
    let err = connector.resolve(None).await.unwrap_err();
    assert!(matches!(err, BridgeError::AmbiguousInstance { ref candidates } if candidates.len() == 2));

    let by_id = InstanceSelector::by_id(second.host.instance_id());
    let resolved = connector.resolve(Some(&by_id)).await.unwrap();
    assert_eq!(resolved.instance_id, second.host.instance_id());

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn test_status_counts_connected_clients() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let connector = host.connector();

    match connector.request(None, Request::Status).await.unwrap() {
        Response::Status {
            status,
            connected_clients,
        } => {
            assert_eq!(status, "ok");
            assert_eq!(connected_clients, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Requests share the one session per instance.
    connector.request(None, Request::Ping).await.unwrap();
    assert_eq!(host.host.connected_clients(), 1);

    connector.close(host.host.instance_id()).await;
    assert!(eventually(Duration::from_secs(2), || async { host.host.connected_clients() == 0 }).await);

    host.stop().await;
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start_with(&temp, &["a.ipynb"], |config| {
        config.token = Some("secret".to_string());
    })
    .await;

    // The advertised token is used by default.
    let connector = host.connector();
    connector.request(None, Request::Ping).await.unwrap();

    let wrong = nbbridge::BridgeConfig {
        instances_dir: host.instances_dir.clone(),
        token: Some("guess".to_string()),
        ..Default::default()
    }
    .connector();
    let err = wrong.request(None, Request::Ping).await.unwrap_err();
    assert_eq!(err.kind(), "unauthorized");

    host.stop().await;
}

#[tokio::test]
async fn test_active_notebook_notification_and_fallback() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["b.ipynb", "a.ipynb"]).await;
    let bridge = DocumentBridge::new(host.connector());
    let a = TestHost::notebook_path(&temp, "a.ipynb");
    let b = TestHost::notebook_path(&temp, "b.ipynb");

    let active = bridge.active_notebook(None).await.unwrap();
    assert!(active.is_fallback);
    assert_eq!(active.notebook.unwrap().path, a);

    let connector = bridge.connector();
    connector
        .request(None, Request::SetActiveNotebook { path: Some(b.clone()) })
        .await
        .unwrap();
    let active = bridge.active_notebook(None).await.unwrap();
    assert!(!active.is_fallback);
    assert_eq!(active.notebook.as_ref().unwrap().path, b);
    assert_eq!(active.notebook.unwrap().name, "b.ipynb");
    assert_eq!(host.host.active().get(), Some(b.clone()));

    let err = connector
        .request(
            None,
            Request::SetActiveNotebook {
                path: Some("/nowhere.ipynb".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    connector
        .request(None, Request::SetActiveNotebook { path: None })
        .await
        .unwrap();
    assert!(bridge.active_notebook(None).await.unwrap().is_fallback);

    host.stop().await;
}

#[tokio::test]
async fn test_insert_then_get_cell_round_trip() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let bridge = DocumentBridge::new(host.connector());
    let path = TestHost::notebook_path(&temp, "a.ipynb");

    seed(&bridge, &path, &["a", "b", "c"]).await;
    bridge
        .insert_cell(None, &path, 2, CellType::Code, "x=1")
        .await
        .unwrap();

    let cell = bridge.get_cell(None, &path, 2).await.unwrap();
    assert_eq!(cell.source, "x=1");
    assert_eq!(cell.cell_type, CellType::Code);
    assert_eq!(cell.execution_count, None);
    assert_eq!(cell.index, 2);
    assert_eq!(sources(&bridge, &path).await, vec!["a", "b", "x=1", "c"]);

    let err = bridge.get_cell(None, &path, 4).await.unwrap_err();
    assert!(matches!(err, BridgeError::IndexOutOfRange { index: 4, len: 4 }));

    host.stop().await;
}

#[tokio::test]
async fn test_update_and_delete_keep_other_cells() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let bridge = DocumentBridge::new(host.connector());
    let path = TestHost::notebook_path(&temp, "a.ipynb");
    seed(&bridge, &path, &["a", "b", "c"]).await;

    let result = bridge.update_cell(None, &path, 1, "B").await.unwrap();
    assert_eq!(result.cell_count, 3);
    assert_eq!(sources(&bridge, &path).await, vec!["a", "B", "c"]);

    let result = bridge.delete_cell(None, &path, 0).await.unwrap();
    assert_eq!(result.cell_count, 2);
    assert_eq!(sources(&bridge, &path).await, vec!["B", "c"]);

    let err = bridge.delete_cell(None, &path, 2).await.unwrap_err();
    assert_eq!(err.kind(), "index_out_of_range");

    host.stop().await;
}

#[tokio::test]
async fn test_move_matches_delete_then_insert() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let bridge = DocumentBridge::new(host.connector());
    let path = TestHost::notebook_path(&temp, "a.ipynb");
    seed(&bridge, &path, &["c0", "c1", "c2", "c3", "c4"]).await;

    bridge.move_cell(None, &path, 0, 3).await.unwrap();

    let mut expected = vec!["c0", "c1", "c2", "c3", "c4"];
    let moved = expected.remove(0);
    expected.insert(3, moved);
    assert_eq!(sources(&bridge, &path).await, expected);

    host.stop().await;
}

#[tokio::test]
async fn test_concurrent_mutations_never_go_out_of_range() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let bridge = Arc::new(DocumentBridge::new(host.connector()));
    let path = TestHost::notebook_path(&temp, "a.ipynb");
    let initial: Vec<String> = (0..10).map(|i| format!("seed{i}")).collect();
    let initial_refs: Vec<&str> = initial.iter().map(String::as_str).collect();
    seed(&bridge, &path, &initial_refs).await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let bridge = bridge.clone();
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                // Read-then-write as one unit: delete whatever is last.
                let _guard = bridge.with_notebook_lock(None, &path).await?;
                let len = bridge.get_content(None, &path).await?.cells.len();
                bridge
                    .mutate_locked(
                        None,
                        &path,
                        nbbridge::protocol::CellOp::Delete { index: len - 1 },
                    )
                    .await
                    .map(|_| ())
            } else {
                bridge
                    .insert_cell(None, &path, 0, CellType::Markdown, &format!("new{i}"))
                    .await
                    .map(|_| ())
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let cells = bridge.get_content(None, &path).await.unwrap().cells;
    assert_eq!(cells.len(), 10);
    let indices: Vec<usize> = cells.iter().map(|c| c.index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());

    host.stop().await;
}

#[tokio::test]
async fn test_editor_and_bridge_edits_merge() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let connector = host.connector();
    let bridge = DocumentBridge::new(connector.clone());
    let path = TestHost::notebook_path(&temp, "a.ipynb");
    seed(&bridge, &path, &["import math", "print(1)"]).await;

    let descriptor = connector.resolve(None).await.unwrap();
    let mut editor = NotebookSyncClient::connect(&descriptor, &path, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(editor.cells().len(), 2);

    // The human types in cell 0 while the bridge rewrites cell 1.
    editor.edit_source(0, "import math\nimport os").await.unwrap();
    bridge.update_cell(None, &path, 1, "print(2)").await.unwrap();

    let cells = editor
        .wait_until(Duration::from_secs(2), |cells| {
            cells.len() == 2 && cells[1].source == "print(2)"
        })
        .await
        .unwrap();
    assert_eq!(cells[0].source, "import math\nimport os");

    assert!(
        eventually(Duration::from_secs(2), || async {
            sources(&bridge, &path).await == vec!["import math\nimport os", "print(2)"]
        })
        .await
    );

    // Bridge inserts show up in the editor.
    bridge
        .insert_cell(None, &path, 0, CellType::Markdown, "# Title")
        .await
        .unwrap();
    let cells = editor
        .wait_until(Duration::from_secs(2), |cells| cells.len() == 3)
        .await
        .unwrap();
    assert_eq!(cells[0].source, "# Title");
    assert_eq!(cells[0].cell_type, CellType::Markdown);

    host.stop().await;
}

#[tokio::test]
async fn test_sync_to_unknown_notebook_is_rejected() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let descriptor = host.connector().resolve(None).await.unwrap();

    let result =
        NotebookSyncClient::connect(&descriptor, "/missing.ipynb", Duration::from_secs(2)).await;
    assert!(matches!(
        result,
        Err(nbbridge::sync_client::SyncClientError::Rejected(_))
    ));

    host.stop().await;
}

#[tokio::test]
async fn test_ipynb_is_imported_on_open() {
    let temp = TempDir::new().unwrap();
    let path = TestHost::notebook_path(&temp, "existing.ipynb");
    let notebook = serde_json::json!({
        "nbformat": 4,
        "nbformat_minor": 5,
        "metadata": {
            "kernelspec": {"name": "python3", "display_name": "Python 3", "language": "python"}
        },
        "cells": [
            {"id": "intro", "cell_type": "markdown", "metadata": {}, "source": ["# Intro"]},
            {
                "id": "calc",
                "cell_type": "code",
                "metadata": {},
                "execution_count": 3,
                "source": ["1 + 1"],
                "outputs": [{
                    "output_type": "execute_result",
                    "execution_count": 3,
                    "data": {"text/plain": "2"},
                    "metadata": {}
                }]
            }
        ]
    });
    std::fs::write(&path, serde_json::to_string(&notebook).unwrap()).unwrap();

    let host = TestHost::start(&temp, &["existing.ipynb"]).await;
    let bridge = DocumentBridge::new(host.connector());
    let snapshot = bridge.get_content(None, &path).await.unwrap();

    assert_eq!(snapshot.cells.len(), 2);
    assert_eq!(snapshot.cells[0].cell_type, CellType::Markdown);
    assert_eq!(snapshot.cells[0].source, "# Intro");
    assert_eq!(snapshot.cells[1].source, "1 + 1");
    assert_eq!(snapshot.cells[1].execution_count, Some(3));
    assert_eq!(snapshot.cells[1].outputs.len(), 1);
    assert!(snapshot.metadata.contains_key("kernelspec"));

    host.stop().await;
}

#[tokio::test]
async fn test_execution_timeout_then_completion() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let connector = host.connector();
    let bridge = DocumentBridge::new(connector.clone());
    let proxy = ExecutionProxy::new(connector);
    let path = TestHost::notebook_path(&temp, "a.ipynb");
    let kernel_id = bridge
        .resolve_notebook(None, Some(&path))
        .await
        .unwrap()
        .kernel_id
        .unwrap();

    let err = proxy
        .execute_code(None, &kernel_id, "sleep:600", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timed_out");

    assert!(
        eventually(Duration::from_secs(5), || async {
            let report = proxy.kernel_status(None, &kernel_id).await.unwrap();
            report.last_execution.map(|e| e.status) == Some(ExecutionState::Completed)
        })
        .await
    );

    host.stop().await;
}

#[tokio::test]
async fn test_executions_on_one_kernel_run_in_order() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let connector = host.connector();
    let proxy = ExecutionProxy::new(connector.clone());
    let kernel_id = DocumentBridge::new(connector)
        .resolve_notebook(None, None)
        .await
        .unwrap()
        .kernel_id
        .unwrap();

    let slow = proxy.submit(None, &kernel_id, "sleep:300").await.unwrap();
    let fast = proxy.submit(None, &kernel_id, "print(second)").await.unwrap();

    let fast_result = fast.wait(Duration::from_secs(5)).await.unwrap();
    let slow_result = slow.wait(Duration::from_secs(5)).await.unwrap();
    assert!(slow_result.execution_count < fast_result.execution_count);
    assert_eq!(fast_result.outputs[0]["text"], "second\n");

    host.stop().await;
}

#[tokio::test]
async fn test_interrupt_cancels_running_execution() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let connector = host.connector();
    let proxy = ExecutionProxy::new(connector.clone());
    let kernel_id = DocumentBridge::new(connector)
        .resolve_notebook(None, None)
        .await
        .unwrap()
        .kernel_id
        .unwrap();

    let handle = proxy.submit(None, &kernel_id, "sleep:5000").await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), || async {
            proxy.kernel_status(None, &kernel_id).await.unwrap().execution_state
                == nbbridge::protocol::KernelState::Busy
        })
        .await
    );

    assert!(handle.cancel().await.unwrap());
    let err = handle.wait(Duration::from_secs(2)).await.unwrap_err();
    assert_eq!(err.kind(), "interrupted");

    // The kernel is free again afterwards.
    let result = proxy
        .execute_code(None, &kernel_id, "print(ok)", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionState::Completed);

    host.stop().await;
}

#[tokio::test]
async fn test_acknowledged_interrupt_does_not_override_completion() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let connector = host.connector();
    let proxy = ExecutionProxy::new(connector.clone());
    let kernel_id = DocumentBridge::new(connector)
        .resolve_notebook(None, None)
        .await
        .unwrap()
        .kernel_id
        .unwrap();

    let handle = proxy.submit(None, &kernel_id, "spin:300").await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), || async {
            proxy.kernel_status(None, &kernel_id).await.unwrap().execution_state
                == nbbridge::protocol::KernelState::Busy
        })
        .await
    );

    // The kernel acknowledges, but the run still completes.
    assert!(handle.cancel().await.unwrap());
    let result = handle.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.status, ExecutionState::Completed);
    assert_eq!(result.outputs[0]["text"], "spun\n");

    host.stop().await;
}

#[tokio::test]
async fn test_kernel_death_mid_run_is_lost_and_unblocks_the_queue() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let connector = host.connector();
    let proxy = ExecutionProxy::new(connector.clone());
    let kernel_id = DocumentBridge::new(connector)
        .resolve_notebook(None, None)
        .await
        .unwrap()
        .kernel_id
        .unwrap();

    let doomed = proxy.submit(None, &kernel_id, "die").await.unwrap();
    let settled = doomed.wait_settled(Duration::from_secs(5)).await.unwrap();
    assert_eq!(settled.status, ExecutionState::Lost);
    assert!(settled.outputs.iter().any(|o| o["ename"] == "KernelDied"));
    assert_eq!(
        doomed.wait(Duration::from_secs(1)).await.unwrap_err().kind(),
        "connection_lost"
    );

    host.kernel.revive();
    let result = proxy
        .execute_code(None, &kernel_id, "print(back)", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionState::Completed);
    assert_eq!(result.outputs[0]["text"], "back\n");

    host.stop().await;
}

#[tokio::test]
async fn test_unknown_kernel_is_not_found() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::start(&temp, &["a.ipynb"]).await;
    let proxy = ExecutionProxy::new(host.connector());

    let err = proxy
        .execute_code(None, "no-such-kernel", "1", Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    host.stop().await;
}
