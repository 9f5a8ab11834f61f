//! Domain hooks implemented by each concrete agent.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use estateflow_traits::{AiProvider, KvStore, PropertyDataService};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::events::{AgentEvent, EventBus, NotificationLevel};
use super::queue::TaskQueue;
use crate::models::AgentTask;

/// Collaborators shared by every agent a manager owns.
#[derive(Clone, Default)]
pub struct AgentServices {
    pub ai: Option<Arc<dyn AiProvider>>,
    pub property_data: Option<Arc<dyn PropertyDataService>>,
    pub store: Option<Arc<dyn KvStore>>,
}

impl AgentServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiProvider>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_property_data(mut self, service: Arc<dyn PropertyDataService>) -> Self {
        self.property_data = Some(service);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn property_data(&self) -> Result<&Arc<dyn PropertyDataService>> {
        self.property_data
            .as_ref()
            .ok_or_else(|| anyhow!("Property data service not configured"))
    }
}

impl fmt::Debug for AgentServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentServices")
            .field("ai", &self.ai.is_some())
            .field("property_data", &self.property_data.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// What a hook sees while it runs.
#[derive(Clone)]
pub struct AgentContext {
    name: String,
    queue: Arc<TaskQueue>,
    services: AgentServices,
    events: EventBus,
}

impl AgentContext {
    pub(crate) fn new(
        name: impl Into<String>,
        queue: Arc<TaskQueue>,
        services: AgentServices,
        events: EventBus,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            services,
            events,
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Queue follow-up work on this agent. It runs no earlier than the next cycle.
    pub fn enqueue(&self, task: AgentTask) {
        self.queue.enqueue(task);
    }

    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.events
            .publish(AgentEvent::notification(&self.name, level, message));
    }

    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        self.events
            .publish(AgentEvent::progress(&self.name, percent, message));
    }
}

/// A long-lived background worker.
///
/// The runtime drives these hooks; implementations keep their own state
/// behind interior mutability since every hook takes `&self`.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry and persistence key.
    fn name(&self) -> &str;

    /// Runs once per cycle before due tasks. Typically enqueues periodic work.
    /// An error here puts the agent into the error state.
    async fn perform_scheduled_check(&self, ctx: &AgentContext) -> Result<()>;

    /// Execute one task. An error counts as a failed attempt.
    async fn execute_task(&self, task: &AgentTask, ctx: &AgentContext) -> Result<Value>;

    /// Whether broadcast tasks of this type should be delivered here.
    fn can_handle_task(&self, _task_type: &str) -> bool {
        false
    }

    /// Agent-specific state persisted alongside the queue.
    fn extra_state(&self) -> Value {
        Value::Null
    }

    /// Receives exactly what `extra_state` returned at the last save.
    fn load_extra_state(&self, _state: Value) {}
}
