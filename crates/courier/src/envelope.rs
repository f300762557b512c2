//! Wire envelopes shared by every transport binding.
//!
//! A [`RequestEnvelope`] carries one command, query or event; a
//! [`ResponseEnvelope`] carries the result of a command or query back to the
//! waiting caller under the same id. Both serialize to JSON with a fixed shape.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::codec;
use crate::error::Result;
use crate::message::{AnyMessage, Command, Event, Message, Query};

/// Logical kind of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// State-changing request with a single handler and a result.
    Command,
    /// Read-only request with a single handler and a result.
    Query,
    /// Broadcast fact with any number of handlers and no result.
    Event,
}

impl RequestKind {
    /// Lowercase name, as substituted into callback targets.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Command => "command",
            RequestKind::Query => "query",
            RequestKind::Event => "event",
        }
    }

    /// Whether the sender expects a response envelope.
    pub fn expects_response(&self) -> bool {
        !matches!(self, RequestKind::Event)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Request id; doubles as the idempotency key.
    pub id: String,
    pub kind: RequestKind,
    /// Routing discriminant, see [`Message::MESSAGE_TYPE`].
    pub message_type: String,
    /// Encoded message.
    pub payload: String,
    /// Where to deliver the response. May contain a `{kind}` placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Whether a caller is blocked on the response.
    #[serde(default)]
    pub sync: bool,
    pub sent_at: DateTime<Utc>,
    /// Milliseconds after `sent_at` the caller stops waiting. `None` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
}

impl RequestEnvelope {
    /// Wrap an already type-erased message.
    pub fn from_message(kind: RequestKind, message: &dyn AnyMessage) -> Result<Self> {
        let message_type = message.message_type();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            message_type: message_type.to_string(),
            payload: codec::encode(message_type, message)?,
            callback_url: None,
            sync: false,
            sent_at: Utc::now(),
            timeout_ms: None,
            retry_count: 0,
        })
    }

    /// Envelope for a command.
    pub fn command<C: Command>(command: &C) -> Result<Self> {
        Self::typed(RequestKind::Command, command)
    }

    /// Envelope for a query.
    pub fn query<Q: Query>(query: &Q) -> Result<Self> {
        Self::typed(RequestKind::Query, query)
    }

    /// Envelope for an event.
    pub fn event<E: Event>(event: &E) -> Result<Self> {
        Self::typed(RequestKind::Event, event)
    }

    fn typed<M: Message>(kind: RequestKind, message: &M) -> Result<Self> {
        Self::from_message(kind, message)
    }

    /// Use `id` instead of a generated one (e.g. a caller-supplied idempotency key).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Mark the envelope as awaited by a blocked caller.
    pub fn synchronous(mut self) -> Self {
        self.sync = true;
        self
    }

    /// `sent_at + timeout`, or `None` when the request never expires.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::try_milliseconds(i64::try_from(self.timeout_ms?).ok()?)?;
        self.sent_at.checked_add_signed(timeout)
    }

    /// Time left before the deadline at `now`.
    ///
    /// `None` means unbounded; `Some(Duration::ZERO)` means already expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let deadline = self.deadline()?;
        Some((deadline - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.remaining_at(now).is_some_and(|left| left.is_zero())
    }

    /// Decode the payload as `M`.
    pub fn decode<M: Message>(&self) -> Result<M> {
        codec::decode(&self.message_type, &self.payload)
    }
}

/// The answer to one command or query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Id of the originating request.
    pub id: String,
    /// Encoded result. Absent for events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ResponseEnvelope {
    pub fn new(id: impl Into<String>, result: Option<String>) -> Self {
        Self {
            id: id.into(),
            result,
        }
    }

    /// A response with no result, recorded for events.
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, None)
    }

    /// Decode the result as `T`; an absent result decodes as JSON `null`.
    pub fn decode<T: DeserializeOwned>(&self, type_name: &str) -> Result<T> {
        codec::decode(type_name, self.result.as_deref().unwrap_or("null"))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ChargeCard {
        cents: u64,
    }
    crate::impl_message!(ChargeCard);
    impl Command for ChargeCard {
        type Output = bool;
    }

    #[test]
    fn test_command_envelope_fields() {
        let envelope = RequestEnvelope::command(&ChargeCard { cents: 250 })
            .unwrap()
            .with_callback("http://billing/{kind}/reply")
            .with_timeout(Duration::from_secs(2))
            .synchronous();

        assert_eq!(envelope.kind, RequestKind::Command);
        assert_eq!(envelope.message_type, "ChargeCard");
        assert_eq!(envelope.payload, r#"{"cents":250}"#);
        assert!(envelope.sync);
        assert_eq!(envelope.retry_count, 0);
        assert_eq!(envelope.decode::<ChargeCard>().unwrap().cents, 250);
    }

    #[test]
    fn test_deadline_and_expiry() {
        let envelope = RequestEnvelope::command(&ChargeCard { cents: 1 })
            .unwrap()
            .with_timeout(Duration::from_millis(500));
        let sent = envelope.sent_at;

        assert_eq!(
            envelope.deadline(),
            Some(sent + chrono::Duration::milliseconds(500))
        );
        assert!(!envelope.is_expired_at(sent + chrono::Duration::milliseconds(499)));
        assert!(envelope.is_expired_at(sent + chrono::Duration::milliseconds(500)));
        assert_eq!(
            envelope.remaining_at(sent + chrono::Duration::milliseconds(100)),
            Some(Duration::from_millis(400))
        );
    }

    #[test]
    fn test_no_timeout_never_expires() {
        let envelope = RequestEnvelope::command(&ChargeCard { cents: 1 }).unwrap();
        assert_eq!(envelope.deadline(), None);
        assert!(!envelope.is_expired_at(envelope.sent_at + chrono::Duration::days(365)));
    }

    #[test]
    fn test_wire_shape_is_stable() {
        let envelope = RequestEnvelope::command(&ChargeCard { cents: 9 })
            .unwrap()
            .with_id("req-1");
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["id"], "req-1");
        assert_eq!(json["kind"], "command");
        assert_eq!(json["message_type"], "ChargeCard");
        assert!(json.get("callback_url").is_none());

        let back: RequestEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_response_decode() {
        let response = ResponseEnvelope::new("req-1", Some("true".into()));
        assert!(response.decode::<bool>("bool").unwrap());
        let empty = ResponseEnvelope::empty("req-2");
        assert_eq!(empty.decode::<Option<u8>>("Option").unwrap(), None);
    }
}
