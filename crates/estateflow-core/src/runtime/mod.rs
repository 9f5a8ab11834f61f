//! Agent execution machinery.
//!
//! - [`Agent`] - domain hooks a concrete agent implements
//! - [`AgentRuntime`] - status, queue, loop and persistence around one agent
//! - [`TaskQueue`] - per-agent priority queue
//! - [`RetryPolicy`] - backoff for failed tasks
//! - [`EventBus`] / [`AgentEvent`] - one-way event stream to the host

pub mod agent;
pub mod events;
pub mod queue;
pub mod retry;
pub mod runner;

pub use agent::{Agent, AgentContext, AgentServices};
pub use events::{AgentEvent, AgentEventKind, EventBus, NotificationLevel};
pub use queue::TaskQueue;
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{AgentRuntime, RuntimeOptions, TaskOutcome};
