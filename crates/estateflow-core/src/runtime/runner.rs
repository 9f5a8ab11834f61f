//! Agent runtime - the execution loop wrapped around one [`Agent`].
//!
//! Each started runtime owns a spawned tokio task that repeats:
//!
//! 1. status `running`, scheduled check
//! 2. due tasks one at a time, in queue order, honoring stop between tasks
//! 3. status `sleeping` for the check interval
//!
//! A failed cycle publishes an error, switches to `error` and waits out the
//! cool-down before the next cycle. The loop only exits on stop. Panics
//! raised by hooks are caught and handled like returned errors.

use anyhow::{Result, anyhow};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::agent::{Agent, AgentContext, AgentServices};
use super::events::{AgentEvent, AgentEventKind, EventBus};
use super::queue::TaskQueue;
use super::retry::{RetryDecision, RetryPolicy};
use crate::error::AgentError;
use crate::models::{AgentStatus, AgentTask};
use crate::persist::{self, AgentSnapshot, StateStore};

/// Timing knobs for one runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between cycles
    pub check_interval: Duration,
    /// Wait after a failed cycle
    pub error_cooldown: Duration,
    pub retry: RetryPolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            error_cooldown: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl RuntimeOptions {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Result of one task attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Retrying { retry_count: u32 },
    Failed,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct AgentRuntime {
    name: String,
    agent: Arc<dyn Agent>,
    queue: Arc<TaskQueue>,
    status: Mutex<AgentStatus>,
    check_interval_ms: AtomicU64,
    error_cooldown: Duration,
    retry: RetryPolicy,
    services: RwLock<AgentServices>,
    store: Option<Arc<dyn StateStore>>,
    events: EventBus,
    worker: Mutex<Option<Worker>>,
}

impl AgentRuntime {
    /// Build a runtime. When `store` is set, the last snapshot for this agent
    /// is loaded before returning; unreadable snapshots mean a cold start.
    pub fn new(
        agent: Arc<dyn Agent>,
        options: RuntimeOptions,
        store: Option<Arc<dyn StateStore>>,
    ) -> Arc<Self> {
        let runtime = Self {
            name: agent.name().to_string(),
            agent,
            queue: Arc::new(TaskQueue::new()),
            status: Mutex::new(AgentStatus::Idle),
            check_interval_ms: AtomicU64::new(duration_millis(options.check_interval)),
            error_cooldown: options.error_cooldown,
            retry: options.retry,
            services: RwLock::new(AgentServices::default()),
            store,
            events: EventBus::new(),
            worker: Mutex::new(None),
        };
        runtime.load_state();
        Arc::new(runtime)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.lock()
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn enqueue(&self, task: AgentTask) {
        debug!(agent = %self.name, task_id = %task.id, task_type = %task.task_type, "Task queued");
        self.queue.enqueue(task);
    }

    pub fn can_handle_task(&self, task_type: &str) -> bool {
        self.agent.can_handle_task(task_type)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.load(Ordering::Relaxed))
    }

    /// Takes effect from the next sleep.
    pub fn set_check_interval(&self, interval: Duration) {
        self.check_interval_ms
            .store(duration_millis(interval), Ordering::Relaxed);
    }

    pub fn set_services(&self, services: AgentServices) {
        *self.services.write() = services;
    }

    pub fn services(&self) -> AgentServices {
        self.services.read().clone()
    }

    /// A loop has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// The spawned loop task has not finished.
    pub fn is_worker_alive(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Spawn the loop. The status is `running` when this returns.
    pub fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        let mut worker = self.worker.lock();
        if let Some(existing) = worker.as_ref()
            && !existing.handle.is_finished()
        {
            return Err(AgentError::AlreadyRunning(self.name.clone()));
        }

        self.set_status(AgentStatus::Running);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let runtime = Arc::clone(self);
        let handle = tokio::spawn(async move {
            runtime.run_loop(token).await;
        });
        *worker = Some(Worker { cancel, handle });

        info!(
            agent = %self.name,
            interval_ms = duration_millis(self.check_interval()),
            "Agent started"
        );
        Ok(())
    }

    /// Cancel the loop, wait for it to exit, then persist state.
    ///
    /// In-flight task execution is not interrupted; stop waits for it.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return Err(AgentError::NotRunning(self.name.clone()));
        };

        worker.cancel.cancel();
        if let Err(err) = worker.handle.await
            && err.is_panic()
        {
            error!(agent = %self.name, "Agent loop panicked: {}", err);
        }

        self.set_status(AgentStatus::Stopped);
        self.save_state();
        info!(agent = %self.name, "Agent stopped");
        Ok(())
    }

    /// Run a single cycle inline, without the sleep.
    pub async fn run_once(&self) -> Result<()> {
        self.run_cycle(&CancellationToken::new()).await
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        debug!(agent = %self.name, "Agent loop entered");

        while !cancel.is_cancelled() {
            self.set_status(AgentStatus::Running);

            match self.run_cycle(&cancel).await {
                Ok(()) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.set_status(AgentStatus::Sleeping);
                    let interval = self.check_interval();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(agent = %self.name, error = %message, "Agent cycle failed");
                    self.events.publish(AgentEvent::error(&self.name, message));
                    self.set_status(AgentStatus::Error);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.error_cooldown) => {}
                    }
                }
            }
        }

        debug!(agent = %self.name, "Agent loop exited");
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<()> {
        let ctx = self.context();

        guarded(self.agent.perform_scheduled_check(&ctx))
            .await
            .map_err(|err| err.context("Scheduled check failed"))?;

        for task in self.queue.due_tasks() {
            if cancel.is_cancelled() {
                break;
            }
            // Removed by an earlier task in this cycle.
            if !self.queue.contains(&task.id) {
                continue;
            }
            self.set_status(AgentStatus::Running);
            self.process_task(task, &ctx).await;
        }

        Ok(())
    }

    pub(crate) async fn process_task(&self, task: AgentTask, ctx: &AgentContext) -> TaskOutcome {
        debug!(agent = %self.name, task_id = %task.id, task_type = %task.task_type, "Executing task");

        match guarded(self.agent.execute_task(&task, ctx)).await {
            Ok(result) => {
                self.queue.remove(&task.id);
                info!(agent = %self.name, task_id = %task.id, task_type = %task.task_type, "Task completed");
                self.events.publish(AgentEvent::new(
                    &self.name,
                    AgentEventKind::TaskCompleted {
                        task_id: task.id.clone(),
                        task_type: task.task_type.clone(),
                        result: result.clone(),
                    },
                ));
                TaskOutcome::Completed(result)
            }
            Err(err) => {
                let mut task = task;
                match self.retry.record_failure(&mut task, Utc::now()) {
                    RetryDecision::Rescheduled { at } => {
                        warn!(
                            agent = %self.name,
                            task_id = %task.id,
                            retry_count = task.retry_count,
                            retry_at = %at.to_rfc3339(),
                            "Task failed, retrying: {:#}",
                            err
                        );
                        let retry_count = task.retry_count;
                        self.queue.update(task);
                        TaskOutcome::Retrying { retry_count }
                    }
                    RetryDecision::Exhausted => {
                        self.queue.remove(&task.id);
                        let message = format!(
                            "Task {} failed after {} retries: {:#}",
                            task.id, task.max_retries, err
                        );
                        error!(agent = %self.name, task_id = %task.id, "{}", message);
                        self.events.publish(AgentEvent::error(&self.name, message));
                        TaskOutcome::Failed
                    }
                }
            }
        }
    }

    pub(crate) fn context(&self) -> AgentContext {
        AgentContext::new(
            self.name.clone(),
            Arc::clone(&self.queue),
            self.services(),
            self.events.clone(),
        )
    }

    fn set_status(&self, status: AgentStatus) {
        let changed = {
            let mut current = self.status.lock();
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        };
        if changed {
            debug!(agent = %self.name, status = %status, "Agent status changed");
            self.events
                .publish(AgentEvent::status_changed(&self.name, status));
        }
    }

    fn load_state(&self) {
        let Some(store) = &self.store else {
            return;
        };

        match persist::read_snapshot(store.as_ref(), &self.name) {
            Ok(Some(snapshot)) => {
                let restored = snapshot.tasks.len();
                self.queue.restore(snapshot.tasks);
                let agent = &self.agent;
                let extra = snapshot.extra_state;
                if std::panic::catch_unwind(AssertUnwindSafe(|| agent.load_extra_state(extra)))
                    .is_err()
                {
                    warn!(agent = %self.name, "Agent rejected saved state, ignoring it");
                }
                info!(agent = %self.name, tasks = restored, "Restored agent state");
            }
            Ok(None) => {
                debug!(agent = %self.name, "No saved state, cold start");
            }
            Err(err) => {
                warn!(agent = %self.name, "Failed to load agent state, cold start: {:#}", err);
            }
        }
    }

    fn save_state(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let agent = &self.agent;
        let extra_state = std::panic::catch_unwind(AssertUnwindSafe(|| agent.extra_state()))
            .unwrap_or_else(|_| {
                warn!(agent = %self.name, "Agent panicked while exporting state");
                Value::Null
            });

        let snapshot = AgentSnapshot {
            name: self.name.clone(),
            status: self.status(),
            tasks: self.queue.snapshot(),
            extra_state,
            saved_at: Utc::now(),
        };

        match persist::write_snapshot(store.as_ref(), &snapshot) {
            Ok(()) => debug!(agent = %self.name, tasks = snapshot.tasks.len(), "Saved agent state"),
            Err(err) => error!(agent = %self.name, "Failed to save agent state: {:#}", err),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: AgentStatus) {
        self.set_status(status);
    }

    #[cfg(test)]
    pub(crate) fn abort_worker(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.handle.abort();
        }
    }
}

/// Await a hook, turning a panic into an error.
async fn guarded<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{ScriptedAgent, collect_until, create_test_store};
    use serde_json::{Map, json};

    fn fast_options() -> RuntimeOptions {
        RuntimeOptions::default()
            .with_check_interval(Duration::from_millis(50))
            .with_error_cooldown(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_retry_law_removes_task_after_three_failures() {
        let agent = Arc::new(ScriptedAgent::new("Flaky").failing("flaky"));
        let runtime = AgentRuntime::new(agent.clone(), RuntimeOptions::default(), None);
        let mut events = runtime.subscribe();
        let ctx = runtime.context();

        let task = AgentTask::new("flaky", Map::new()).with_id("t-1");
        runtime.enqueue(task);

        let before = Utc::now();
        let outcome = runtime.process_task(runtime.queue().get("t-1").unwrap(), &ctx).await;
        assert_eq!(outcome, TaskOutcome::Retrying { retry_count: 1 });
        let queued = runtime.queue().get("t-1").unwrap();
        let delay = queued.scheduled_for.unwrap() - before;
        assert!(delay >= chrono::Duration::seconds(120));
        assert!(delay < chrono::Duration::seconds(121));

        let outcome = runtime.process_task(runtime.queue().get("t-1").unwrap(), &ctx).await;
        assert_eq!(outcome, TaskOutcome::Retrying { retry_count: 2 });
        let queued = runtime.queue().get("t-1").unwrap();
        let delay = queued.scheduled_for.unwrap() - before;
        assert!(delay >= chrono::Duration::seconds(240));
        assert!(delay < chrono::Duration::seconds(241));

        let outcome = runtime.process_task(runtime.queue().get("t-1").unwrap(), &ctx).await;
        assert_eq!(outcome, TaskOutcome::Failed);
        assert!(runtime.queue().is_empty());
        assert_eq!(agent.calls_for("flaky"), 3);

        let event = events.recv().await.unwrap();
        match event.kind {
            AgentEventKind::Error { message } => {
                assert!(message.contains("t-1"));
                assert!(message.contains("3 retries"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_task_counts_as_failure() {
        let agent = Arc::new(ScriptedAgent::new("Panicky").panicking("explode"));
        let runtime = AgentRuntime::new(agent, RuntimeOptions::default(), None);
        let ctx = runtime.context();

        runtime.enqueue(AgentTask::new("explode", Map::new()).with_id("p-1"));
        let outcome = runtime.process_task(runtime.queue().get("p-1").unwrap(), &ctx).await;

        assert_eq!(outcome, TaskOutcome::Retrying { retry_count: 1 });
        assert!(runtime.queue().contains("p-1"));
    }

    #[tokio::test]
    async fn test_restored_high_retry_count_keeps_task_queued() {
        let agent = Arc::new(ScriptedAgent::new("Stubborn").failing("fetch"));
        let runtime = AgentRuntime::new(agent, RuntimeOptions::default(), None);
        let ctx = runtime.context();

        let mut task = AgentTask::new("fetch", Map::new())
            .with_id("r-60")
            .with_max_retries(100);
        task.retry_count = 60;
        runtime.enqueue(task);

        let outcome = runtime.process_task(runtime.queue().get("r-60").unwrap(), &ctx).await;

        assert_eq!(outcome, TaskOutcome::Retrying { retry_count: 61 });
        let queued = runtime.queue().get("r-60").unwrap();
        assert!(queued.scheduled_for.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_stop_during_error_cooldown_returns_promptly() {
        let agent = Arc::new(ScriptedAgent::new("Cooling"));
        agent.set_fail_scheduled_check(true);
        let options = RuntimeOptions::default()
            .with_check_interval(Duration::from_millis(50))
            .with_error_cooldown(Duration::from_secs(60));
        let runtime = AgentRuntime::new(agent.clone(), options, None);
        let mut events = runtime.subscribe();

        runtime.start().unwrap();
        collect_until(&mut events, Duration::from_secs(2), |event| {
            event.kind
                == AgentEventKind::StatusChanged {
                    status: AgentStatus::Error,
                }
        })
        .await;

        tokio::time::timeout(Duration::from_secs(2), runtime.stop())
            .await
            .expect("stop blocked on the cool-down")
            .unwrap();

        assert_eq!(runtime.status(), AgentStatus::Stopped);
        assert!(!runtime.is_running());
        assert_eq!(agent.scheduled_checks(), 1);
    }

    #[tokio::test]
    async fn test_run_once_completes_due_tasks_and_skips_future_ones() {
        let agent = Arc::new(ScriptedAgent::new("Worker"));
        let runtime = AgentRuntime::new(agent.clone(), RuntimeOptions::default(), None);

        runtime.enqueue(AgentTask::new("echo", Map::new()).with_id("now"));
        runtime.enqueue(
            AgentTask::new("echo", Map::new())
                .with_id("later")
                .scheduled_at(Utc::now() + chrono::Duration::hours(1)),
        );

        runtime.run_once().await.unwrap();

        assert_eq!(agent.scheduled_checks(), 1);
        assert_eq!(agent.calls_for("echo"), 1);
        assert!(!runtime.queue().contains("now"));
        assert!(runtime.queue().contains("later"));
    }

    #[tokio::test]
    async fn test_start_sets_running_and_rejects_double_start() {
        let runtime = AgentRuntime::new(Arc::new(ScriptedAgent::new("Twice")), fast_options(), None);

        runtime.start().unwrap();
        assert_eq!(runtime.status(), AgentStatus::Running);
        assert_eq!(
            runtime.start(),
            Err(AgentError::AlreadyRunning("Twice".to_string()))
        );

        runtime.stop().await.unwrap();
        assert_eq!(runtime.status(), AgentStatus::Stopped);
        assert!(!runtime.is_running());
        assert_eq!(
            runtime.stop().await,
            Err(AgentError::NotRunning("Twice".to_string()))
        );
    }

    #[tokio::test]
    async fn test_loop_sleeps_between_cycles() {
        let agent = Arc::new(ScriptedAgent::new("Sleeper"));
        let runtime = AgentRuntime::new(agent.clone(), fast_options(), None);
        let mut events = runtime.subscribe();

        runtime.start().unwrap();
        let seen = collect_until(&mut events, Duration::from_secs(2), |event| {
            event.kind
                == AgentEventKind::StatusChanged {
                    status: AgentStatus::Sleeping,
                }
        })
        .await;
        assert!(!seen.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        runtime.stop().await.unwrap();
        assert!(agent.scheduled_checks() >= 2);
    }

    #[tokio::test]
    async fn test_scheduled_check_failure_enters_error_and_recovers() {
        let agent = Arc::new(ScriptedAgent::new("Broken"));
        agent.set_fail_scheduled_check(true);
        let runtime = AgentRuntime::new(agent.clone(), fast_options(), None);
        let mut events = runtime.subscribe();

        runtime.start().unwrap();
        let seen = collect_until(&mut events, Duration::from_secs(2), |event| {
            event.kind
                == AgentEventKind::StatusChanged {
                    status: AgentStatus::Error,
                }
        })
        .await;
        assert!(seen.iter().any(AgentEvent::is_error));
        assert!(runtime.is_worker_alive());

        agent.set_fail_scheduled_check(false);
        collect_until(&mut events, Duration::from_secs(2), |event| {
            event.kind
                == AgentEventKind::StatusChanged {
                    status: AgentStatus::Sleeping,
                }
        })
        .await;
        assert_ne!(runtime.status(), AgentStatus::Error);

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_persists_queue_and_extra_state() {
        let (store, _dir) = create_test_store();
        let agent = Arc::new(ScriptedAgent::new("Market Monitor"));
        agent.set_extra_state(json!({"tracked": ["p-1", "p-2"]}));
        let runtime = AgentRuntime::new(agent, fast_options(), Some(store.clone()));

        let mut data = Map::new();
        data.insert("property_id".to_string(), json!("p-9"));
        let future = AgentTask::new("echo", data)
            .with_id("future")
            .with_priority(2)
            .scheduled_at(Utc::now() + chrono::Duration::hours(2));
        runtime.enqueue(future.clone());

        runtime.start().unwrap();
        runtime.stop().await.unwrap();
        assert!(!runtime.is_worker_alive());

        let reloaded_agent = Arc::new(ScriptedAgent::new("Market Monitor"));
        let reloaded = AgentRuntime::new(reloaded_agent.clone(), fast_options(), Some(store));

        assert_eq!(reloaded.queue().snapshot(), vec![future]);
        assert_eq!(
            reloaded_agent.loaded_state(),
            Some(json!({"tracked": ["p-1", "p-2"]}))
        );
        assert_eq!(reloaded.status(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_a_cold_start() {
        let (store, _dir) = create_test_store();
        store.put_raw("lead_scoring", b"{broken").unwrap();

        let agent = Arc::new(ScriptedAgent::new("Lead Scoring"));
        let runtime = AgentRuntime::new(agent.clone(), fast_options(), Some(store));

        assert!(runtime.queue().is_empty());
        assert_eq!(agent.loaded_state(), None);
    }

    #[tokio::test]
    async fn test_check_interval_updates_live() {
        let runtime = AgentRuntime::new(Arc::new(ScriptedAgent::new("Tunable")), fast_options(), None);
        runtime.set_check_interval(Duration::from_secs(600));
        assert_eq!(runtime.check_interval(), Duration::from_secs(600));
    }
}
