pub mod status;
pub mod task;

pub use status::AgentStatus;
pub use task::{AgentTask, DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY};
