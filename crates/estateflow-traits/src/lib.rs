//! EstateFlow Traits - Collaborator interfaces for background agents.
//!
//! Agents never talk to concrete clients. Everything they need from the
//! outside world comes through the traits in this crate:
//! - [`AiProvider`] for chat-style completions
//! - [`PropertyDataService`] for listing and market data
//! - [`KvStore`] for generic persistent key/value state
//!
//! Implementations live in downstream crates (storage, daemon) or in tests.

pub mod ai;
pub mod error;
pub mod property;
pub mod store;

pub use ai::{AiProvider, ChatMessage, ChatRole, ModelHint};
pub use error::{ServiceError, ServiceResult};
pub use property::{MarketStats, PropertyDataService, PropertyRecord};
pub use store::KvStore;
