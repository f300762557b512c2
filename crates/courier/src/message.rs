//! Message traits and type-erased message handles.
//!
//! Every message carries a stable string discriminant, [`Message::MESSAGE_TYPE`],
//! which is what travels in [`RequestEnvelope::message_type`] and what handler
//! registries and saga definitions key on. Rust type names are never used for
//! routing, so renaming a struct does not break messages already in flight.
//!
//! [`RequestEnvelope::message_type`]: crate::RequestEnvelope::message_type

use std::any::Any;
use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

/// A serializable message with a stable routing name.
///
/// Usually implemented through [`impl_message!`](crate::impl_message) or
/// [`impl_event!`](crate::impl_event).
pub trait Message: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Stable discriminant used on the wire and in handler lookups.
    const MESSAGE_TYPE: &'static str;
}

/// A request that changes state and produces exactly one result.
pub trait Command: Message {
    /// Value returned to the sender.
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// A read-only request that produces exactly one result.
pub trait Query: Message {
    /// Value returned to the sender.
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// A fact broadcast to any number of subscribers. Events have no response.
pub trait Event: Message {}

/// Object-safe view over any [`Message`].
///
/// Used wherever messages of different types share a queue: saga publish and
/// schedule steps, the publisher seam, and delayed re-injection.
pub trait AnyMessage: erased_serde::Serialize + Debug + Send + Sync + 'static {
    /// The message's stable discriminant.
    fn message_type(&self) -> &'static str;

    /// Downcasting access to the concrete message.
    fn as_any(&self) -> &dyn Any;
}

impl<M: Message> AnyMessage for M {
    fn message_type(&self) -> &'static str {
        M::MESSAGE_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

erased_serde::serialize_trait_object!(AnyMessage);

impl dyn AnyMessage {
    /// Returns the concrete message if it is an `M`.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }

    /// Returns true if the message is an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.as_any().is::<M>()
    }
}
