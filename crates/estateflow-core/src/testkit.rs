//! Test utilities: scripted agents, in-memory collaborators and temp stores.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use estateflow_storage::{AgentStateStorage, Storage};
use estateflow_traits::{
    AiProvider, ChatMessage, MarketStats, ModelHint, PropertyDataService, PropertyRecord,
    ServiceError, ServiceResult,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::models::AgentTask;
use crate::runtime::{Agent, AgentContext, AgentEvent};

/// Creates a temporary snapshot store.
pub fn create_test_store() -> (Arc<AgentStateStorage>, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let storage = Storage::new(temp_dir.path().join("agents-test.db"))
        .expect("failed to create storage");
    (Arc::new(storage.agent_state.clone()), temp_dir)
}

/// Receive events until `predicate` matches, returning everything seen.
///
/// Panics if nothing matches within `timeout`.
pub async fn collect_until(
    receiver: &mut broadcast::Receiver<AgentEvent>,
    timeout: Duration,
    predicate: impl Fn(&AgentEvent) -> bool,
) -> Vec<AgentEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Ok(event)) => {
                let done = predicate(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                panic!("event stream closed; saw {seen:?}")
            }
            Err(_) => panic!("timed out waiting for event; saw {seen:?}"),
        }
    }
}

/// Agent whose behavior is configured per task type.
///
/// Task types marked failing always return an error, panicking types panic,
/// anything else succeeds and echoes the task data.
pub struct ScriptedAgent {
    name: String,
    handled: HashSet<String>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    task_delay: Option<Duration>,
    fail_scheduled_check: AtomicBool,
    scheduled_checks: AtomicU32,
    calls: Mutex<Vec<(String, String)>>,
    extra_state: Mutex<Value>,
    loaded_state: Mutex<Option<Value>>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handled: HashSet::new(),
            failing: HashSet::new(),
            panicking: HashSet::new(),
            task_delay: None,
            fail_scheduled_check: AtomicBool::new(false),
            scheduled_checks: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
            extra_state: Mutex::new(Value::Null),
            loaded_state: Mutex::new(None),
        }
    }

    pub fn handling(mut self, task_types: &[&str]) -> Self {
        self.handled
            .extend(task_types.iter().map(|t| t.to_string()));
        self
    }

    pub fn failing(mut self, task_type: &str) -> Self {
        self.failing.insert(task_type.to_string());
        self
    }

    pub fn panicking(mut self, task_type: &str) -> Self {
        self.panicking.insert(task_type.to_string());
        self
    }

    pub fn with_task_delay(mut self, delay: Duration) -> Self {
        self.task_delay = Some(delay);
        self
    }

    pub fn set_fail_scheduled_check(&self, fail: bool) {
        self.fail_scheduled_check.store(fail, Ordering::SeqCst);
    }

    pub fn set_extra_state(&self, state: Value) {
        *self.extra_state.lock() = state;
    }

    pub fn loaded_state(&self) -> Option<Value> {
        self.loaded_state.lock().clone()
    }

    pub fn scheduled_checks(&self) -> u32 {
        self.scheduled_checks.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, task_type: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(t, _)| t == task_type)
            .count()
    }

    /// Executed task ids in call order.
    pub fn executed_ids(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, id)| id.clone()).collect()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform_scheduled_check(&self, _ctx: &AgentContext) -> Result<()> {
        self.scheduled_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_scheduled_check.load(Ordering::SeqCst) {
            bail!("scripted scheduled check failure");
        }
        Ok(())
    }

    async fn execute_task(&self, task: &AgentTask, _ctx: &AgentContext) -> Result<Value> {
        self.calls
            .lock()
            .push((task.task_type.clone(), task.id.clone()));

        if let Some(delay) = self.task_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panicking.contains(&task.task_type) {
            panic!("scripted panic for {}", task.task_type);
        }
        if self.failing.contains(&task.task_type) {
            bail!("scripted failure for {}", task.task_type);
        }
        Ok(json!({ "task_id": task.id, "echo": task.data }))
    }

    fn can_handle_task(&self, task_type: &str) -> bool {
        self.handled.contains(task_type)
    }

    fn extra_state(&self) -> Value {
        self.extra_state.lock().clone()
    }

    fn load_extra_state(&self, state: Value) {
        *self.loaded_state.lock() = Some(state);
    }
}

/// In-memory listing and market data.
#[derive(Default)]
pub struct MockPropertyData {
    properties: Mutex<HashMap<String, PropertyRecord>>,
    listings: Mutex<Vec<PropertyRecord>>,
    stats: Mutex<HashMap<String, MarketStats>>,
    unavailable: AtomicBool,
}

impl MockPropertyData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_property(&self, record: PropertyRecord) {
        self.properties.lock().insert(record.id.clone(), record);
    }

    pub fn set_listings(&self, listings: Vec<PropertyRecord>) {
        *self.listings.lock() = listings;
    }

    pub fn set_stats(&self, stats: MarketStats) {
        self.stats.lock().insert(stats.area.clone(), stats);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> ServiceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("mock property data offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PropertyDataService for MockPropertyData {
    async fn property_details(&self, property_id: &str) -> ServiceResult<Option<PropertyRecord>> {
        self.check_available()?;
        Ok(self.properties.lock().get(property_id).cloned())
    }

    async fn search_listings(&self, _criteria: &Value) -> ServiceResult<Vec<PropertyRecord>> {
        self.check_available()?;
        Ok(self.listings.lock().clone())
    }

    async fn market_statistics(&self, area: &str) -> ServiceResult<Option<MarketStats>> {
        self.check_available()?;
        Ok(self.stats.lock().get(area).cloned())
    }
}

/// AI provider returning a fixed reply.
pub struct MockAi {
    reply: String,
    calls: AtomicU32,
    last_model: Mutex<Option<ModelHint>>,
}

impl MockAi {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            calls: AtomicU32::new(0),
            last_model: Mutex::new(None),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_model(&self) -> Option<ModelHint> {
        *self.last_model.lock()
    }
}

#[async_trait]
impl AiProvider for MockAi {
    async fn send(&self, _messages: &[ChatMessage], model: ModelHint) -> ServiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_model.lock() = Some(model);
        Ok(self.reply.clone())
    }
}
