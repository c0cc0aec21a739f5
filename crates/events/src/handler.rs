use eventbus_core::ConsumerGroupId;

use crate::event::EventOutput;

/// Error returned by a consumer handler.
pub type HandlerError = anyhow::Error;

/// Processes delivered events for one subscription.
///
/// Delivery is at-least-once, so implementations must tolerate duplicates;
/// [`EventOutput::message_id`] is a stable idempotency key.
///
/// A returned error (or a panic) is never retried by the consumer runtime
/// directly. It aborts the current batch and the commit mode decides what the
/// broker redelivers.
///
/// Closures with the matching signature implement this trait; wrap them in
/// [`handler_fn`] to get argument types inferred:
///
/// ```ignore
/// provider.subscribe("orders", group, CommitMode::MessageCommit, handler_fn(|group, event| {
///     tracing::info!(%group, event_id = %event.event_id, "order received");
///     Ok(())
/// }))?;
/// ```
pub trait MessageHandler: Send + 'static {
    fn handle(&mut self, group: &ConsumerGroupId, event: &EventOutput) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&ConsumerGroupId, &EventOutput) -> Result<(), HandlerError> + Send + 'static,
{
    fn handle(&mut self, group: &ConsumerGroupId, event: &EventOutput) -> Result<(), HandlerError> {
        self(group, event)
    }
}

/// Handler built from a closure by [`handler_fn`].
#[derive(Debug, Clone)]
pub struct FnHandler<F>(F);

/// Wrap a closure as a [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&ConsumerGroupId, &EventOutput) -> Result<(), HandlerError> + Send + 'static,
{
    FnHandler(f)
}

impl<F> MessageHandler for FnHandler<F>
where
    F: FnMut(&ConsumerGroupId, &EventOutput) -> Result<(), HandlerError> + Send + 'static,
{
    fn handle(&mut self, group: &ConsumerGroupId, event: &EventOutput) -> Result<(), HandlerError> {
        (self.0)(group, event)
    }
}
