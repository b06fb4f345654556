// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![cfg(unix)]

use std::time::Duration;

use herd_core::domain::protocol::ControlRequest;
use herd_core::infrastructure::ControlClient;
use herd_core::{exec, SupervisorConfig, WorkerEvent};

#[tokio::test]
async fn test_start_hook_and_event_subscription() {
    let dir = tempfile::tempdir().unwrap();
    let entry = dir.path().join("svc.sh");
    std::fs::write(&entry, "trap 'exit 0' TERM\nwhile true; do sleep 1; done\n").unwrap();
    let marker = dir.path().join("started");

    let config = SupervisorConfig::new(&entry)
        .with_interpreter("sh")
        .with_run_dir(dir.path().join("run"))
        .with_hook("START", format!("echo \"$HERD_NAME:$HERD_INSTANCE\" >> {}", marker.display()));
    let handle = exec(config).await.unwrap();

    let mut client = ControlClient::connect(handle.socket_path()).await.unwrap();
    client.request(&ControlRequest::Subscribe).await.unwrap();
    let restarted = client
        .request(&ControlRequest::Restart { instance_num: None })
        .await
        .unwrap();
    assert_eq!(restarted, 1);

    let saw_restart = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(event)) = client.next_event().await {
            if event.event == WorkerEvent::Restart {
                return event.instance_num;
            }
        }
        None
    })
    .await
    .unwrap();
    assert_eq!(saw_restart, Some(1));

    // Two STARTs, both tagged with the instance: the initial launch and the restart.
    let mut lines = 0;
    for _ in 0..50 {
        lines = std::fs::read_to_string(&marker)
            .map(|s| s.lines().filter(|l| *l == "svc:1").count())
            .unwrap_or(0);
        if lines == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(lines, 2);

    client.close().await;
    handle.shutdown().await;
}
