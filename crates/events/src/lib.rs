//! Event and broker mechanics for the transactional event bus.
//!
//! Pure transport concerns live here (event shapes, broker capability, commit
//! modes). Storage and background workers are in `eventbus-infra`.

pub mod broker;
pub mod commit_mode;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_broker;

pub use broker::{
    Broker, BrokerConsumer, BrokerError, Headers, Message, MessagePosition, ProducerRecord,
    PublishAck, SubscribeOptions,
};
pub use commit_mode::{
    BatchBoundary, CommitMode, ConsumerGroupState, ConsumerState, Directive, TransitionError,
};
pub use envelope::DecodeError;
pub use event::{EventInput, EventOutput, StoredEvent};
pub use handler::{FnHandler, HandlerError, MessageHandler, handler_fn};
pub use in_memory_broker::{InMemoryBroker, InMemoryConsumer};
