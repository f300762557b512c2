//! Outbound messages emitted by publish steps.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{AnyMessage, RequestEnvelope, RequestKind, Transport};
use tracing::debug;

/// Emits messages produced by saga publish steps.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, message: Arc<dyn AnyMessage>) -> anyhow::Result<()>;
}

/// Discards every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(&self, message: Arc<dyn AnyMessage>) -> anyhow::Result<()> {
        debug!(message_type = message.message_type(), "publish discarded");
        Ok(())
    }
}

/// Wraps each message in an event envelope and hands it to a [`Transport`].
pub struct TransportPublisher<T> {
    transport: T,
}

impl<T: Transport> TransportPublisher<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: Transport> Publisher for TransportPublisher<T> {
    async fn publish(&self, message: Arc<dyn AnyMessage>) -> anyhow::Result<()> {
        let envelope = RequestEnvelope::from_message(RequestKind::Event, message.as_ref())?;
        debug!(id = %envelope.id, message_type = %envelope.message_type, "publishing saga message");
        self.transport.send(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderShipped {
        order_id: String,
    }

    courier_core::impl_event!(OrderShipped);

    #[derive(Default, Clone)]
    struct CapturingTransport {
        sent: Arc<Mutex<Vec<RequestEnvelope>>>,
    }

    #[async_trait]
    impl Transport for CapturingTransport {
        async fn send(&self, request: RequestEnvelope) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(request);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transport_publisher_sends_event_envelopes() {
        let transport = CapturingTransport::default();
        let publisher = TransportPublisher::new(transport.clone());

        publisher
            .publish(Arc::new(OrderShipped {
                order_id: "o-1".into(),
            }))
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, RequestKind::Event);
        assert_eq!(sent[0].message_type, "OrderShipped");
        assert!(!sent[0].sync);
        assert_eq!(
            sent[0].decode::<OrderShipped>().unwrap(),
            OrderShipped {
                order_id: "o-1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_noop_publisher_accepts_everything() {
        assert!(NoopPublisher
            .publish(Arc::new(OrderShipped {
                order_id: "o-1".into(),
            }))
            .await
            .is_ok());
    }
}
