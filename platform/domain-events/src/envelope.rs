//! # Event Envelope
//!
//! Wire contract shared by every domain event the platform emits.
//!
//! ## Envelope Fields
//!
//! - `event_id`: Minted per publish attempt, never supplied by callers
//! - `event_type`: `<producer>.<domain>.<action>`, doubles as the routing key
//! - `schema_version`: Version of the `data` shape, independent of the envelope
//! - `occurred_at`: UTC time of the domain change (not of the publish attempt)
//! - `producer`: Static identifier of the emitting service
//! - `tenant_id`: Owning tenant, never nil
//! - `correlation_id` / `causation_id`: Causal chain, absent for root events
//! - `traceparent`: Optional W3C trace-context
//! - `data`: Domain payload
//!
//! ## Compatibility
//!
//! Fields are serialized in declaration order and optional fields are always
//! written (as `null` when absent). Decoding ignores unknown fields, so
//! producers may add fields without breaking older consumers.

use crate::context::EventContext;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Content type of every encoded envelope
pub const ENVELOPE_CONTENT_TYPE: &str = "application/json";

/// Payload schema version used when a domain does not declare one
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Errors raised while building, encoding or decoding envelopes
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("event type '{0}' must be <producer>.<domain>.<action> with non-empty segments")]
    MalformedEventType(String),

    #[error("tenant_id must not be nil")]
    MissingTenant,

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Fully-qualified event type, `<producer>.<domain>.<action>`
///
/// Construction validates the segment count, so a value of this type always
/// routes deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType {
    raw: String,
    domain_start: usize,
    action_start: usize,
}

impl EventType {
    /// Build an event type from its three segments
    pub fn new(producer: &str, domain: &str, action: &str) -> Result<Self, EnvelopeError> {
        Self::parse(&format!("{producer}.{domain}.{action}"))
    }

    /// Parse a dotted event type string
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let segments: Vec<&str> = raw.split('.').collect();
        let well_formed = segments.len() == 3
            && segments.iter().all(|s| {
                !s.is_empty()
                    && !s
                        .chars()
                        .any(|c| c.is_whitespace() || matches!(c, '*' | '#' | '>'))
            });

        if !well_formed {
            return Err(EnvelopeError::MalformedEventType(raw.to_string()));
        }

        let domain_start = segments[0].len() + 1;
        let action_start = domain_start + segments[1].len() + 1;

        Ok(Self {
            raw: raw.to_string(),
            domain_start,
            action_start,
        })
    }

    pub fn producer(&self) -> &str {
        &self.raw[..self.domain_start - 1]
    }

    pub fn domain(&self) -> &str {
        &self.raw[self.domain_start..self.action_start - 1]
    }

    pub fn action(&self) -> &str {
        &self.raw[self.action_start..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for EventType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EventType {
    type Error = EnvelopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.raw
    }
}

/// Standard envelope wrapping every published domain event
///
/// # Type Parameter
///
/// * `T` - The event-specific payload type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique per publish attempt; a retry mints a new envelope
    pub event_id: Uuid,

    /// Routing key and consumer dispatch key
    pub event_type: EventType,

    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// When the domain change happened
    pub occurred_at: DateTime<Utc>,

    pub producer: String,

    pub tenant_id: Uuid,

    pub correlation_id: Option<String>,

    pub causation_id: Option<String>,

    /// W3C trace-context of the publishing request
    pub traceparent: Option<String>,

    pub data: T,
}

fn default_schema_version() -> u32 {
    DEFAULT_SCHEMA_VERSION
}

/// An encoded envelope ready for the transport
#[derive(Debug, Clone)]
pub struct SealedEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub tenant_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub bytes: Vec<u8>,
}

/// Builds and serializes envelopes for a single producer
///
/// # Example
///
/// ```rust
/// use domain_events::{EnvelopeCodec, EventContext, EventType};
/// use serde_json::json;
/// use uuid::Uuid;
///
/// let codec = EnvelopeCodec::new("crm");
/// let event_type = EventType::parse("crm.ticket.created").unwrap();
/// let sealed = codec
///     .encode(&event_type, Uuid::new_v4(), 1, &json!({"id": "t1"}), &EventContext::default())
///     .unwrap();
///
/// let decoded = EnvelopeCodec::decode(&sealed.bytes).unwrap();
/// assert_eq!(decoded.event_type, event_type);
/// assert_eq!(decoded.data, json!({"id": "t1"}));
/// ```
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    producer: String,
}

impl EnvelopeCodec {
    pub fn new(producer: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// Wrap `data` in a fresh envelope
    ///
    /// `event_id` is always generated here. `occurred_at` comes from the
    /// context when the caller knows the domain timestamp, otherwise now.
    pub fn seal<T>(
        &self,
        event_type: &EventType,
        tenant_id: Uuid,
        schema_version: u32,
        data: T,
        context: &EventContext,
    ) -> Result<EventEnvelope<T>, EnvelopeError> {
        if tenant_id.is_nil() {
            return Err(EnvelopeError::MissingTenant);
        }

        let traceparent = match context.traceparent.as_deref() {
            Some(tp) if is_valid_traceparent(tp) => Some(tp.to_string()),
            Some(tp) => {
                tracing::warn!(
                    event_type = %event_type,
                    traceparent = %tp,
                    "Dropping malformed traceparent from envelope"
                );
                None
            }
            None => None,
        };

        Ok(EventEnvelope {
            event_id: Uuid::new_v4(),
            event_type: event_type.clone(),
            schema_version,
            occurred_at: context.occurred_at.unwrap_or_else(Utc::now),
            producer: self.producer.clone(),
            tenant_id,
            correlation_id: context.correlation_id.clone(),
            causation_id: context.causation_id.clone(),
            traceparent,
            data,
        })
    }

    /// Seal and serialize in one step
    pub fn encode<T: Serialize>(
        &self,
        event_type: &EventType,
        tenant_id: Uuid,
        schema_version: u32,
        data: &T,
        context: &EventContext,
    ) -> Result<SealedEvent, EnvelopeError> {
        let envelope = self.seal(event_type, tenant_id, schema_version, data, context)?;
        let bytes = serde_json::to_vec(&envelope)?;

        Ok(SealedEvent {
            event_id: envelope.event_id,
            event_type: envelope.event_type,
            tenant_id: envelope.tenant_id,
            occurred_at: envelope.occurred_at,
            correlation_id: envelope.correlation_id,
            causation_id: envelope.causation_id,
            bytes,
        })
    }

    /// Decode an envelope with an untyped payload (consumer side)
    pub fn decode(bytes: &[u8]) -> Result<EventEnvelope<serde_json::Value>, EnvelopeError> {
        Self::decode_as(bytes)
    }

    /// Decode an envelope into a typed payload
    pub fn decode_as<T: DeserializeOwned>(bytes: &[u8]) -> Result<EventEnvelope<T>, EnvelopeError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        validate_envelope_fields(&value).map_err(EnvelopeError::InvalidEnvelope)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Validate the envelope fields of a raw JSON message
///
/// # Validation Rules
///
/// - `event_id`: Must be present
/// - `event_type`: Must have three dot-separated segments
/// - `occurred_at`: Must be present
/// - `producer`: Must be non-empty
/// - `tenant_id`: Must be present and not the nil UUID
/// - `data`: Must be present (may be `null` only if explicitly written)
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    let event_type = envelope
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_type")?;

    EventType::parse(event_type).map_err(|e| e.to_string())?;

    envelope
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurred_at")?;

    let producer = envelope
        .get("producer")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid producer")?;

    if producer.is_empty() {
        return Err("producer cannot be empty".to_string());
    }

    let tenant_id = envelope
        .get("tenant_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid tenant_id")?;

    match Uuid::parse_str(tenant_id) {
        Ok(id) if !id.is_nil() => {}
        _ => return Err(format!("tenant_id is not a valid tenant: {tenant_id}")),
    }

    if envelope.get("data").is_none() {
        return Err("Missing data".to_string());
    }

    Ok(())
}

/// Check the shape of a W3C `traceparent` header value
///
/// `version-traceid-parentid-flags`, lowercase hex, with all-zero trace and
/// parent ids and version `ff` rejected.
pub fn is_valid_traceparent(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 4 {
        return false;
    }

    let lower_hex = |s: &str, len: usize| {
        s.len() == len && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    };

    let (version, trace_id, parent_id, flags) = (parts[0], parts[1], parts[2], parts[3]);

    lower_hex(version, 2)
        && version != "ff"
        && lower_hex(trace_id, 32)
        && trace_id.chars().any(|c| c != '0')
        && lower_hex(parent_id, 16)
        && parent_id.chars().any(|c| c != '0')
        && lower_hex(flags, 2)
}
