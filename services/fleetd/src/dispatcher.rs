//! Task dispatcher: feeds work from a remote authority into a bounded
//! worker manager.
//!
//! The loop is deliberately thin:
//!
//! 1. Fetch the full unfiltered task set (pending and running).
//! 2. Log which task ids are newly present since the previous fetch.
//! 3. Enqueue every fetched task into the worker manager.
//! 4. Run the worker manager for up to the configured interval.
//! 5. Sleep whatever remains of the interval.
//!
//! Fetch failures are not contained here; they propagate out of
//! [`Dispatcher::run`]. Hardening belongs to the authority client and the
//! worker manager.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// One unit of work from the remote authority.
///
/// The dispatcher only ever looks at the id; payload contents belong to the
/// worker manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Remote authority the dispatcher polls.
#[async_trait]
pub trait TaskAuthority: Send + Sync {
    /// Fetch the unfiltered set of current tasks, pending and running.
    async fn fetch_tasks(&self) -> Result<Vec<Task>>;
}

/// Bounded worker pool fed by the dispatcher.
///
/// Construction (store handle, worker bound, authority client) is the
/// owner's concern; the dispatcher only enqueues and runs.
#[async_trait]
pub trait WorkerManager: Send + Sync {
    /// Enqueue a task. Re-adding a known task is the manager's problem.
    async fn add_task(&self, task: Task);

    /// Process queued tasks for up to `timeout`.
    async fn run(&self, timeout: Duration);
}

/// Polling dispatcher for one task type.
pub struct Dispatcher {
    task_type: String,
    sleep_interval: Duration,
    authority: Arc<dyn TaskAuthority>,
    manager: Arc<dyn WorkerManager>,

    /// Ids seen in the previous fetch. Instance state: two dispatchers never
    /// share a diff baseline.
    previous_fetch_ids: HashSet<String>,
}

impl Dispatcher {
    pub fn new(
        task_type: impl Into<String>,
        sleep_interval: Duration,
        authority: Arc<dyn TaskAuthority>,
        manager: Arc<dyn WorkerManager>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            sleep_interval,
            authority,
            manager,
            previous_fetch_ids: HashSet::new(),
        }
    }

    /// Diff the fetched ids against the previous fetch, log additions, and
    /// remember the new set. Returns the newly appeared ids.
    fn note_added_tasks(&mut self, tasks: &[Task]) -> BTreeSet<String> {
        let ids: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let added: BTreeSet<String> = ids
            .difference(&self.previous_fetch_ids)
            .cloned()
            .collect();
        if !added.is_empty() {
            info!(task_type = %self.task_type, added = ?added, "got new tasks");
        }
        self.previous_fetch_ids = ids;
        added
    }

    /// Run the dispatch loop until shutdown.
    ///
    /// The cycle period stays approximately constant: time spent fetching
    /// and running the manager is subtracted from the final sleep.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(task_type = %self.task_type, "task dispatching started");

        while !*shutdown.borrow() {
            let started = Instant::now();

            debug!(task_type = %self.task_type, "fetching tasks from authority");
            let tasks = self.authority.fetch_tasks().await?;
            self.note_added_tasks(&tasks);
            for task in tasks {
                self.manager.add_task(task).await;
            }

            self.manager.run(self.sleep_interval).await;

            if let Some(remaining) = self.sleep_interval.checked_sub(started.elapsed()) {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(task_type = %self.task_type, "task dispatching stopped");
        Ok(())
    }
}

/// Authority that serves pre-scripted batches, then fails.
///
/// The trailing failure mirrors what a dead authority looks like and gives
/// loop tests a clean exit path.
pub struct ScriptedAuthority {
    batches: std::sync::Mutex<std::collections::VecDeque<Vec<Task>>>,
}

impl ScriptedAuthority {
    pub fn new(batches: Vec<Vec<Task>>) -> Self {
        Self {
            batches: std::sync::Mutex::new(batches.into()),
        }
    }
}

#[async_trait]
impl TaskAuthority for ScriptedAuthority {
    async fn fetch_tasks(&self) -> Result<Vec<Task>> {
        self.batches
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("authority unreachable"))
    }
}

/// Worker manager that records what it was fed.
#[derive(Default)]
pub struct RecordingManager {
    added: std::sync::Mutex<Vec<Task>>,
    runs: std::sync::atomic::AtomicUsize,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added(&self) -> Vec<Task> {
        self.added.lock().unwrap().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerManager for RecordingManager {
    async fn add_task(&self, task: Task) {
        self.added.lock().unwrap().push(task);
    }

    async fn run(&self, _timeout: Duration) {
        self.runs
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
