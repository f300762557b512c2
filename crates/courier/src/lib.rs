//! # Courier
//!
//! Request correlation, idempotent dispatch and deadline-bounded handler
//! execution for services that talk over a message broker.
//!
//! ## Core Concepts
//!
//! Courier moves three kinds of [`Message`]:
//! - [`Command`] = change something, exactly one handler, one result
//! - [`Query`] = read something, exactly one handler, one result
//! - [`Event`] = something happened, any number of handlers, no result
//!
//! Every message has a stable routing name ([`Message::MESSAGE_TYPE`]) and
//! travels inside a [`RequestEnvelope`] that carries its id, deadline and
//! callback target.
//!
//! ## Architecture
//!
//! ```text
//! caller                                   remote process
//!   │                                            │
//!   │ RemoteBus.send(cmd)                        │
//!   ├─► CorrelationRegistry.register(id)         │
//!   ├─► Transport.send(envelope) ──────────────► Dispatcher.dispatch(envelope)
//!   │                                            │
//!   │                                            ├─ past deadline?   → drop
//!   │                                            ├─ IdempotencyStore → replay
//!   │                                            ├─ HandlerRegistry  → handler
//!   │                                            │     (own task, bounded)
//!   │                                            ├─ store result
//!   │                                            ▼
//!   │  CorrelationRegistry.complete(resp) ◄──── CallbackSender.deliver
//!   ▼
//! PendingResponse.wait() → result | Timeout | Cancelled
//! ```
//!
//! ## Guarantees
//!
//! - **At most one execution per request id** while the id's result is held
//!   by the [`IdempotencyStore`] (bounded by size and TTL).
//! - **Deadlines are honoured on both sides**: the dispatcher drops requests
//!   whose sender has already given up and aborts handlers that overrun.
//! - **Every pending slot resolves exactly once**: response, failure,
//!   cancellation or timeout.
//! - **Subscriber isolation**: one failing or panicking event handler never
//!   stops the others.
//!
//! ## Example
//!
//! ```ignore
//! use courier_core::{impl_message, Command, CommandHandler, Dispatcher, IdempotencyStore, LocalBus};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct PlaceOrder { order_id: String, amount: u64 }
//! impl_message!(PlaceOrder);
//! impl Command for PlaceOrder { type Output = String; }
//!
//! struct PlaceOrderHandler;
//!
//! #[async_trait]
//! impl CommandHandler<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(&self, cmd: PlaceOrder) -> anyhow::Result<String> {
//!         Ok(format!("accepted {}", cmd.order_id))
//!     }
//! }
//!
//! let dispatcher = Dispatcher::new(IdempotencyStore::default());
//! dispatcher.register_command::<PlaceOrder, _>(PlaceOrderHandler)?;
//!
//! let bus = LocalBus::new(Arc::new(dispatcher));
//! let receipt = bus.send_with_key("order-7", &PlaceOrder { order_id: "7".into(), amount: 100 }).await?;
//! ```

// Core modules
mod bus;
mod callback;
mod dispatch;
mod envelope;
mod error;
mod handler;
mod message;
mod message_macro;

pub mod codec;
pub mod idempotency;
pub mod registry;

// Re-export message traits
pub use message::{AnyMessage, Command, Event, Message, Query};

// Re-export envelope types
pub use envelope::{RequestEnvelope, RequestKind, ResponseEnvelope};

// Re-export error types
pub use error::{CourierError, Result};

// Re-export correlation and deduplication
pub use idempotency::{IdempotencyStore, StoreConfig, StoreStats};
pub use registry::{CorrelationRegistry, PendingResponse, RegistryConfig};

// Re-export handler and dispatcher types
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use handler::{CommandHandler, EventHandler, HandlerId, HandlerRegistry, QueryHandler};

// Re-export delivery seams
pub use bus::{LocalBus, RemoteBus, Transport};
pub use callback::{
    resolve_target, CallbackSender, NoopCallbackSender, RegistryCallback, KIND_PLACEHOLDER,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
