//! Structured errors for correlation, deduplication and dispatch.
//!
//! `CourierError` provides pattern-matchable failures instead of a generic
//! `anyhow::Error`. Handlers themselves return `anyhow::Result`; the dispatcher
//! wraps those failures in [`CourierError::Handler`] before they leave the crate.
//!
//! # Example
//!
//! ```ignore
//! use courier_core::CourierError;
//!
//! match bus.send(&PlaceOrder { .. }).await {
//!     Ok(receipt) => println!("placed {}", receipt.order_id),
//!     Err(CourierError::Timeout { id, .. }) => eprintln!("no reply for {id}"),
//!     Err(CourierError::CapacityExceeded { .. }) => eprintln!("back off and retry later"),
//!     Err(e) => eprintln!("request failed: {e}"),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the registry, the store, the dispatcher and the buses.
#[derive(Debug, Error)]
pub enum CourierError {
    /// The correlation registry is full and a reclaim sweep freed nothing.
    #[error("correlation registry is full ({capacity} pending requests)")]
    CapacityExceeded {
        /// Configured maximum number of pending slots.
        capacity: usize,
    },

    /// A live pending slot already exists for this request id.
    #[error("request {id} is already awaiting a response")]
    AlreadyRegistered {
        /// The duplicated request id.
        id: String,
    },

    /// The request was not answered before its deadline.
    #[error("request {id} timed out after {timeout:?}")]
    Timeout {
        /// The request id.
        id: String,
        /// The timeout the slot was registered with.
        timeout: Duration,
    },

    /// The pending slot was cancelled before a response arrived.
    #[error("request {id} was cancelled")]
    Cancelled {
        /// The request id.
        id: String,
    },

    /// The payload does not match the declared message type.
    #[error("failed to deserialize {message_type}: {source}")]
    Deserialization {
        /// Logical message type the payload was declared as.
        message_type: String,
        /// Underlying codec failure.
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be encoded for the wire.
    #[error("failed to serialize {message_type}: {source}")]
    Serialization {
        /// Logical type being encoded.
        message_type: String,
        /// Underlying codec failure.
        #[source]
        source: serde_json::Error,
    },

    /// No handler is registered for the message type.
    #[error("no handler registered for {message_type}")]
    NoHandler {
        /// The unroutable message type.
        message_type: String,
    },

    /// A command or query type already has its single handler.
    #[error("handler already registered for {message_type}")]
    HandlerAlreadyRegistered {
        /// The message type.
        message_type: String,
    },

    /// The message type is registered under a different request kind.
    #[error("{message_type} is registered as a {registered}, not a {requested}")]
    KindMismatch {
        /// The message type.
        message_type: String,
        /// Kind the type was first registered as.
        registered: &'static str,
        /// Kind of the rejected registration.
        requested: &'static str,
    },

    /// The handler returned an error or panicked.
    #[error("handler for {message_type} failed: {source}")]
    Handler {
        /// The message type being handled.
        message_type: String,
        /// Failure raised by the handler.
        #[source]
        source: anyhow::Error,
    },

    /// The transport could not hand the request to the broker.
    #[error("transport failed for request {id}: {source}")]
    Transport {
        /// The request id.
        id: String,
        /// Failure raised by the transport.
        #[source]
        source: anyhow::Error,
    },
}

impl CourierError {
    /// Returns true for failures the caller may reasonably retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CourierError::CapacityExceeded { .. }
                | CourierError::Timeout { .. }
                | CourierError::Transport { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = CourierError> = std::result::Result<T, E>;
