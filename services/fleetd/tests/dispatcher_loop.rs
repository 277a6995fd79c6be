//! Integration tests for the task-dispatch loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use kiln_fleetd::dispatcher::{
    Dispatcher, RecordingManager, ScriptedAuthority, Task, TaskAuthority,
};

/// Authority that serves the same batch forever.
struct SteadyAuthority(Vec<Task>);

#[async_trait]
impl TaskAuthority for SteadyAuthority {
    async fn fetch_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn loop_feeds_every_fetched_task_to_the_manager() {
    let authority = Arc::new(ScriptedAuthority::new(vec![
        vec![Task::new("1"), Task::new("2")],
        vec![Task::new("2"), Task::new("3")],
    ]));
    let manager = Arc::new(RecordingManager::new());
    let mut dispatcher = Dispatcher::new(
        "build",
        Duration::from_millis(5),
        authority,
        manager.clone(),
    );
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // the scripted authority fails once its batches run out, which ends the
    // loop: dispatch failures are not contained at this layer
    let result = dispatcher.run(shutdown_rx).await;
    assert!(result.is_err());

    let added: Vec<String> = manager.added().iter().map(|t| t.id.clone()).collect();
    assert_eq!(added, vec!["1", "2", "2", "3"]);
    assert_eq!(manager.run_count(), 2);
}

#[tokio::test]
async fn loop_stops_on_shutdown() {
    let authority = Arc::new(SteadyAuthority(vec![Task::new("1")]));
    let manager = Arc::new(RecordingManager::new());
    let mut dispatcher = Dispatcher::new(
        "action",
        Duration::from_millis(5),
        authority,
        manager.clone(),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown_tx.send(true).unwrap();

    handle.await.unwrap().unwrap();
    assert!(manager.run_count() >= 1);
}
