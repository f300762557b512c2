//! Typed handler traits and the runtime handler registry.
//!
//! Business code implements [`CommandHandler`], [`QueryHandler`] or
//! [`EventHandler`] for the exact message type it accepts. The registry stores
//! them type-erased under the message's [`MESSAGE_TYPE`](crate::Message::MESSAGE_TYPE),
//! together with a decoder for that type, so the dispatcher can route raw
//! envelopes without knowing any concrete type.
//!
//! Commands and queries get exactly one handler; events get any number, kept in
//! registration order. Handlers can be added and removed while the process is
//! running.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::codec;
use crate::envelope::RequestKind;
use crate::error::{CourierError, Result};
use crate::message::{Command, Event, Message, Query};

// =============================================================================
// Typed handler traits
// =============================================================================

/// Handles one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn handle(&self, command: C) -> anyhow::Result<C::Output>;
}

/// Handles one query type.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    async fn handle(&self, query: Q) -> anyhow::Result<Q::Output>;
}

/// Reacts to one event type. Many handlers may subscribe to the same event.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: &E) -> anyhow::Result<()>;
}

// =============================================================================
// Type erasure
// =============================================================================

/// A decoded payload, shared between the handlers of one dispatch.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

/// Handler with its message type erased. Returns the encoded result, if any.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn call(&self, payload: Payload) -> anyhow::Result<Option<String>>;
}

type Decoder = fn(&str, &str) -> Result<Payload>;

fn decode_payload<M: Message>(message_type: &str, payload: &str) -> Result<Payload> {
    let message: M = codec::decode(message_type, payload)?;
    Ok(Arc::new(message))
}

fn downcast<M: Message>(payload: &Payload) -> anyhow::Result<&M> {
    payload
        .downcast_ref::<M>()
        .ok_or_else(|| anyhow::anyhow!("payload is not a {}", M::MESSAGE_TYPE))
}

struct CommandAdapter<C, H> {
    handler: H,
    _marker: std::marker::PhantomData<fn(C)>,
}

#[async_trait]
impl<C: Command, H: CommandHandler<C>> ErasedHandler for CommandAdapter<C, H> {
    async fn call(&self, payload: Payload) -> anyhow::Result<Option<String>> {
        let command = downcast::<C>(&payload)?.clone();
        let output = self.handler.handle(command).await?;
        Ok(Some(codec::encode(C::MESSAGE_TYPE, &output)?))
    }
}

struct QueryAdapter<Q, H> {
    handler: H,
    _marker: std::marker::PhantomData<fn(Q)>,
}

#[async_trait]
impl<Q: Query, H: QueryHandler<Q>> ErasedHandler for QueryAdapter<Q, H> {
    async fn call(&self, payload: Payload) -> anyhow::Result<Option<String>> {
        let query = downcast::<Q>(&payload)?.clone();
        let output = self.handler.handle(query).await?;
        Ok(Some(codec::encode(Q::MESSAGE_TYPE, &output)?))
    }
}

struct EventAdapter<E, H> {
    handler: H,
    _marker: std::marker::PhantomData<fn(E)>,
}

#[async_trait]
impl<E: Event, H: EventHandler<E>> ErasedHandler for EventAdapter<E, H> {
    async fn call(&self, payload: Payload) -> anyhow::Result<Option<String>> {
        let event = downcast::<E>(&payload)?;
        self.handler.handle(event).await?;
        Ok(None)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Identifies one registered handler, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone)]
pub(crate) struct Registered {
    pub(crate) id: HandlerId,
    pub(crate) handler: Arc<dyn ErasedHandler>,
}

#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) kind: RequestKind,
    pub(crate) decode: Decoder,
    pub(crate) handlers: SmallVec<[Registered; 1]>,
}

/// Message type → handlers, mutable at runtime.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: DashMap<&'static str, Route>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single handler for command `C`.
    pub fn register_command<C, H>(&self, handler: H) -> Result<HandlerId>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let adapter = CommandAdapter::<C, H> {
            handler,
            _marker: std::marker::PhantomData,
        };
        self.insert_single::<C>(RequestKind::Command, Arc::new(adapter))
    }

    /// Register the single handler for query `Q`.
    pub fn register_query<Q, H>(&self, handler: H) -> Result<HandlerId>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        let adapter = QueryAdapter::<Q, H> {
            handler,
            _marker: std::marker::PhantomData,
        };
        self.insert_single::<Q>(RequestKind::Query, Arc::new(adapter))
    }

    /// Add a subscriber for event `E`. Subscribers run in registration order.
    pub fn subscribe<E, H>(&self, handler: H) -> Result<HandlerId>
    where
        E: Event,
        H: EventHandler<E>,
    {
        let adapter = EventAdapter::<E, H> {
            handler,
            _marker: std::marker::PhantomData,
        };
        let id = self.next_handler_id();
        let mut route = self.routes.entry(E::MESSAGE_TYPE).or_insert_with(|| Route {
            kind: RequestKind::Event,
            decode: decode_payload::<E>,
            handlers: SmallVec::new(),
        });
        if route.kind != RequestKind::Event {
            return Err(CourierError::KindMismatch {
                message_type: E::MESSAGE_TYPE.to_string(),
                registered: route.kind.as_str(),
                requested: RequestKind::Event.as_str(),
            });
        }
        route.handlers.push(Registered {
            id,
            handler: Arc::new(adapter),
        });
        debug!(message_type = E::MESSAGE_TYPE, subscribers = route.handlers.len(), "event handler subscribed");
        Ok(id)
    }

    fn insert_single<M: Message>(
        &self,
        kind: RequestKind,
        handler: Arc<dyn ErasedHandler>,
    ) -> Result<HandlerId> {
        let id = self.next_handler_id();
        let mut route = self.routes.entry(M::MESSAGE_TYPE).or_insert_with(|| Route {
            kind,
            decode: decode_payload::<M>,
            handlers: SmallVec::new(),
        });
        if route.kind != kind {
            return Err(CourierError::KindMismatch {
                message_type: M::MESSAGE_TYPE.to_string(),
                registered: route.kind.as_str(),
                requested: kind.as_str(),
            });
        }
        if !route.handlers.is_empty() {
            return Err(CourierError::HandlerAlreadyRegistered {
                message_type: M::MESSAGE_TYPE.to_string(),
            });
        }
        route.handlers.push(Registered { id, handler });
        debug!(message_type = M::MESSAGE_TYPE, %kind, "handler registered");
        Ok(id)
    }

    /// Remove a previously registered handler. Returns whether it was found.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut found = None;
        for mut route in self.routes.iter_mut() {
            let before = route.handlers.len();
            route.handlers.retain(|registered| registered.id != id);
            if route.handlers.len() != before {
                found = Some((*route.key(), route.handlers.is_empty()));
                break;
            }
        }
        match found {
            Some((message_type, now_empty)) => {
                if now_empty {
                    self.routes
                        .remove_if(message_type, |_, route| route.handlers.is_empty());
                }
                debug!(message_type, "handler removed");
                true
            }
            None => false,
        }
    }

    /// Whether any handler is bound to `message_type`.
    pub fn has_handler(&self, message_type: &str) -> bool {
        self.routes
            .get(message_type)
            .is_some_and(|route| !route.handlers.is_empty())
    }

    /// Number of handlers bound to `message_type`.
    pub fn handler_count(&self, message_type: &str) -> usize {
        self.routes
            .get(message_type)
            .map_or(0, |route| route.handlers.len())
    }

    /// Snapshot of the route for `message_type`, detached from the map lock.
    pub(crate) fn route(&self, message_type: &str) -> Option<Route> {
        self.routes
            .get(message_type)
            .filter(|route| !route.handlers.is_empty())
            .map(|route| route.clone())
    }

    fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: Vec<&'static str> = self.routes.iter().map(|r| *r.key()).collect();
        f.debug_struct("HandlerRegistry")
            .field("message_types", &types)
            .finish()
    }
}
