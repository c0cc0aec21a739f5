//! `eventbus-core`: foundation building blocks shared by the event bus crates.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ConsumerGroupId, EventId, MessageId};
