// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![cfg(unix)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use herd_core::domain::protocol::ControlRequest;
use herd_core::infrastructure::ControlClient;
use herd_core::{exec, SupervisorConfig, WorkerStatus};
use serde_json::{json, Map, Value};

const LONG_RUNNING: &str = "trap 'exit 0' TERM\nwhile true; do sleep 1; done\n";

fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("worker.sh");
    std::fs::write(&path, body).unwrap();
    path
}

fn config(dir: &Path, body: &str) -> SupervisorConfig {
    SupervisorConfig::new(script(dir, body))
        .with_interpreter("sh")
        .with_run_dir(dir.join("run"))
        .with_kill_timeout(Duration::from_secs(2))
}

fn instance_nums(values: &[Value]) -> BTreeSet<u64> {
    values
        .iter()
        .map(|v| v["instanceNum"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_spawn_assigns_distinct_instance_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let handle = exec(config(dir.path(), LONG_RUNNING).with_instances(3))
        .await
        .unwrap();

    let report = handle.report();
    assert!(report.ok);
    assert!(report.errors.is_empty());
    let added = report.added.as_ref().unwrap();
    assert_eq!(added.len(), 3);
    assert_eq!(instance_nums(added), BTreeSet::from([1, 2, 3]));
    assert_eq!(handle.orchestrator().instance_nums(), vec![1, 2, 3]);
    assert!(handle.socket_path().exists());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_scale_is_idempotent_and_trims_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let handle = exec(config(dir.path(), LONG_RUNNING).with_instances(3))
        .await
        .unwrap();
    let orchestrator = handle.orchestrator().clone();

    let before = orchestrator.state(None, None);
    let same = orchestrator.scale(3).await;
    assert!(same.ok);
    assert!(same.added.is_none() && same.removed.is_none());
    let after = orchestrator.state(None, None);
    let pids = |list: &herd_core::StateList| -> Vec<Value> {
        list.state_list.iter().map(|s| s["pid"].clone()).collect()
    };
    assert_eq!(pids(&before), pids(&after));

    let down = orchestrator.scale(1).await;
    assert!(down.ok);
    let removed: BTreeSet<u64> = down
        .removed
        .as_ref()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    assert_eq!(removed, BTreeSet::from([2, 3]));
    assert_eq!(orchestrator.instance_nums(), vec![1]);

    // Numbers are allocated as max + 1.
    let up = orchestrator.scale(2).await;
    assert!(up.ok);
    assert_eq!(instance_nums(up.added.as_ref().unwrap()), BTreeSet::from([2]));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_crash_loop_settles_after_budget() {
    let dir = tempfile::tempdir().unwrap();
    let handle = exec(config(dir.path(), "exit 1\n").with_max_restarts(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let state = handle.orchestrator().state(None, None);
    assert_eq!(state.state_list.len(), 1);
    let monitor = &state.state_list[0]["monitor"];
    assert_eq!(monitor["crashes"], 2);
    assert_ne!(monitor["status"], WorkerStatus::Running.as_str());
    assert!(state.state_list[0]["pid"].is_null());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_shut_down_is_idempotent_and_drains_last_worker() {
    let dir = tempfile::tempdir().unwrap();
    let handle = exec(config(dir.path(), LONG_RUNNING).with_instances(2))
        .await
        .unwrap();
    let orchestrator = handle.orchestrator().clone();
    let pid_file = dir.path().join("run").join("worker.2.pid");
    assert!(pid_file.exists());

    orchestrator.shut_down(Some(2)).await.unwrap();
    orchestrator.shut_down(Some(2)).await.unwrap();
    assert_eq!(orchestrator.instance_nums(), vec![1]);
    assert!(!pid_file.exists());
    assert!(!orchestrator.is_terminated());

    orchestrator.shut_down(Some(1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait_drained())
        .await
        .unwrap();
    assert!(orchestrator.is_terminated());
    assert!(!handle.socket_path().exists());

    // A drained supervisor stays down.
    let report = orchestrator.spawn(1).await;
    assert!(!report.ok);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(orchestrator.worker_count(), 0);
    assert!(!handle.socket_path().exists());
}

#[tokio::test]
async fn test_set_state_round_trips_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let handle = exec(config(dir.path(), LONG_RUNNING).with_instances(2))
        .await
        .unwrap();

    let mut client = ControlClient::connect(handle.socket_path()).await.unwrap();
    let mut patch = Map::new();
    patch.insert("test".into(), json!("掂"));
    client
        .request(&ControlRequest::State {
            new_state: Some(patch),
            instance_num: Some(1),
        })
        .await
        .unwrap();

    let one = client
        .request(&ControlRequest::State {
            new_state: None,
            instance_num: Some(1),
        })
        .await
        .unwrap();
    assert_eq!(one["stateList"][0]["test"], "掂");
    assert!(one["stateList"][0].get("unset").is_none());

    let two = client
        .request(&ControlRequest::State {
            new_state: None,
            instance_num: Some(2),
        })
        .await
        .unwrap();
    assert!(two["stateList"][0].get("test").is_none());

    let restarted = client
        .request(&ControlRequest::Restart {
            instance_num: Some(9),
        })
        .await
        .unwrap();
    assert_eq!(restarted, json!(0));

    client.close().await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_rolling_restart_replaces_every_process() {
    let dir = tempfile::tempdir().unwrap();
    let handle = exec(config(dir.path(), LONG_RUNNING).with_instances(2))
        .await
        .unwrap();
    let orchestrator = handle.orchestrator().clone();

    let before = orchestrator.state(None, None);
    let restarted = orchestrator.rolling_restart().await;
    assert_eq!(restarted, 2);
    let after = orchestrator.state(None, None);
    for (old, new) in before.state_list.iter().zip(&after.state_list) {
        assert_eq!(old["instanceNum"], new["instanceNum"]);
        assert_ne!(old["pid"], new["pid"]);
        assert_eq!(new["monitor"]["crashes"], 0);
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unlaunchable_entry_fails_exec() {
    let dir = tempfile::tempdir().unwrap();
    let config = SupervisorConfig::new(dir.path().join("missing-binary"))
        .with_run_dir(dir.path().join("run"));

    let err = match exec(config).await {
        Err(e) => e,
        Ok(_) => panic!("exec should fail"),
    };
    assert!(matches!(err, herd_core::ExecError::Bootstrap(ref errors) if errors.len() == 1));
    assert!(!dir.path().join("run").join("missing-binary.sock").exists());
}
