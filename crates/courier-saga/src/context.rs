//! Per-event execution context handed to activity steps.

use std::sync::Arc;
use std::time::Duration;

use courier_core::AnyMessage;

/// A message queued for delayed re-injection.
#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    pub message: Arc<dyn AnyMessage>,
    pub delay: Duration,
}

/// Context for one event flowing through one activity chain.
///
/// A fresh context is created for every consumed event and shared by every
/// step of the chain, including nested branches.
#[derive(Debug)]
pub struct EventContext<E> {
    event: Arc<E>,
    correlation_id: String,
    cancel_requested: bool,
    published: Vec<Arc<dyn AnyMessage>>,
    scheduled: Vec<ScheduledMessage>,
}

impl<E> EventContext<E> {
    pub(crate) fn new(event: Arc<E>, correlation_id: impl Into<String>) -> Self {
        Self {
            event,
            correlation_id: correlation_id.into(),
            cancel_requested: false,
            published: Vec::new(),
            scheduled: Vec::new(),
        }
    }

    /// The event being handled.
    pub fn data(&self) -> &E {
        &self.event
    }

    pub(crate) fn event(&self) -> &Arc<E> {
        &self.event
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Ask the engine to cancel the saga once the chain's steps have run.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Messages emitted by publish steps so far.
    pub fn published(&self) -> &[Arc<dyn AnyMessage>] {
        &self.published
    }

    /// Messages registered by schedule steps so far.
    pub fn scheduled(&self) -> &[ScheduledMessage] {
        &self.scheduled
    }

    pub(crate) fn record_published(&mut self, message: Arc<dyn AnyMessage>) {
        self.published.push(message);
    }

    pub(crate) fn record_scheduled(&mut self, message: Arc<dyn AnyMessage>, delay: Duration) {
        self.scheduled.push(ScheduledMessage { message, delay });
    }
}
