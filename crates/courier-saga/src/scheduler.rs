//! Delayed re-injection of messages into a saga engine.
//!
//! A schedule step hands its message to the engine's [`Scheduler`] together
//! with a weak [`MessageSink`] pointing back at the engine. When the delay
//! elapses the scheduler feeds the message into the sink, which runs the
//! engine's normal retrying `consume` path. Delivery is at-least-once with no
//! ordering guarantee between messages.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::AnyMessage;
use tracing::{debug, error};

use crate::error::SagaError;

/// Entry point a scheduler delivers due messages into.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn deliver(&self, message: Arc<dyn AnyMessage>) -> Result<(), SagaError>;
}

/// Delivers `message` into `sink` after `delay`.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, message: Arc<dyn AnyMessage>, delay: Duration, sink: Weak<dyn MessageSink>);
}

/// Scheduler backed by `tokio::time::sleep` on spawned tasks.
///
/// Pending deliveries are lost if the process stops. Must be used from within
/// a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, message: Arc<dyn AnyMessage>, delay: Duration, sink: Weak<dyn MessageSink>) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(sink) = sink.upgrade() else {
                debug!(message_type = message.message_type(), "engine gone, dropping scheduled message");
                return;
            };
            if let Err(e) = sink.deliver(message.clone()).await {
                error!(message_type = message.message_type(), error = %e, "scheduled message failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tick;

    courier_core::impl_message!(Tick);

    #[derive(Default)]
    struct CollectingSink {
        delivered: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl MessageSink for CollectingSink {
        async fn deliver(&self, message: Arc<dyn AnyMessage>) -> Result<(), SagaError> {
            self.delivered.lock().unwrap().push(message.message_type());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_after_delay() {
        let sink = Arc::new(CollectingSink::default());
        let weak: Weak<dyn MessageSink> = Arc::downgrade(&sink) as Weak<dyn MessageSink>;

        TokioScheduler.schedule(Arc::new(Tick), Duration::from_secs(10), weak);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(sink.delivered.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*sink.delivered.lock().unwrap(), vec!["Tick"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sink_is_skipped() {
        let sink = Arc::new(CollectingSink::default());
        let weak: Weak<dyn MessageSink> = Arc::downgrade(&sink) as Weak<dyn MessageSink>;
        drop(sink);

        TokioScheduler.schedule(Arc::new(Tick), Duration::from_millis(5), weak.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(weak.upgrade().is_none());
    }
}
