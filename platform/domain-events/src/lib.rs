//! # Domain Events
//!
//! Publishing backbone for domain lifecycle events. Service-layer code calls a
//! [`DomainProducer`] after its database transaction commits; the event is
//! wrapped in an [`EventEnvelope`], routed through a topic topology with
//! per-domain dead-letter queues, and handed to a broker [`Transport`].
//!
//! ## Failure Isolation
//!
//! A committed write must never be reported as failed because the broker is
//! down. Transport failures and publish timeouts are logged and counted by
//! the [`EventPublisher`] and swallowed by the producers. Producer bugs
//! (malformed event types, payloads violating the domain schema, undeclared
//! actions) fail fast instead.
//!
//! ## Transports
//!
//! - **NatsTransport**: Production transport on NATS JetStream
//! - **InMemoryTransport**: Test/dev transport evaluating the topology in-process
//!
//! ## Usage
//!
//! ```rust
//! use domain_events::{
//!     DomainDescriptor, EnvelopeCodec, EventPublisher, InMemoryTransport, Router,
//!     TopologyRegistry, Transport,
//! };
//! use serde_json::{json, Map};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut topology = TopologyRegistry::new("crm")?;
//! topology.register_domain("ticket")?;
//! let topology = Arc::new(topology);
//!
//! let transport = InMemoryTransport::new();
//! transport.open().await?;
//! transport.declare(&topology).await?;
//!
//! let publisher = EventPublisher::new(
//!     EnvelopeCodec::new("crm"),
//!     Router::new(topology),
//!     Arc::new(transport.clone()),
//!     Duration::from_secs(5),
//! );
//! let tickets = publisher.producer(DomainDescriptor::crud("ticket"))?;
//!
//! let mut snapshot = Map::new();
//! snapshot.insert("id".into(), json!("t1"));
//! tickets.send_created(Uuid::new_v4(), snapshot).await;
//!
//! assert_eq!(transport.queue_depth("crm.ticket"), 1);
//! # Ok(())
//! # }
//! ```

pub mod context;
mod envelope;
mod memory_transport;
pub mod metrics;
mod nats_transport;
mod producer;
mod publisher;
pub mod retry;
mod routing;
pub mod topology;

pub use context::EventContext;
pub use envelope::{
    is_valid_traceparent, validate_envelope_fields, EnvelopeCodec, EnvelopeError, EventEnvelope,
    EventType, SealedEvent, DEFAULT_SCHEMA_VERSION, ENVELOPE_CONTENT_TYPE,
};
pub use memory_transport::{DeliveredMessage, InMemoryTransport};
pub use metrics::PublisherMetrics;
pub use nats_transport::{stream_name, subject_for, NatsTransport, NatsTransportConfig};
pub use producer::{
    Action, CreatedData, CustomData, DeletedData, DomainDescriptor, DomainProducer, ProducerError,
    UpdatedData,
};
pub use publisher::{EventPublisher, PublishError, PublishReceipt, PublishRequest};
pub use routing::{Route, Router};
pub use topology::{TopologyError, TopologyRegistry};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Header names set on every outbound message
pub mod headers {
    pub const CONTENT_TYPE: &str = "content-type";
    pub const TENANT_ID: &str = "tenant_id";
    pub const MESSAGE_ID: &str = "message_id";
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const CAUSATION_ID: &str = "causation_id";
}

/// A serialized envelope addressed to an exchange
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    /// Envelope `event_id`, used for broker-side de-duplication
    pub message_id: Uuid,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

/// Errors that can occur in a broker transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to declare topology: {0}")]
    Declare(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("broker rejected message: {0}")]
    Nack(String),

    #[error("broker did not confirm within {0:?}")]
    Timeout(Duration),

    #[error("no queue bound on exchange '{exchange}' for routing key '{routing_key}'")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("transport is not open")]
    NotOpen,

    #[error("topology has not been declared")]
    NotDeclared,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Broker client abstraction
///
/// Lifecycle: [`open`](Transport::open) once at startup (idempotent,
/// retries while the broker comes up), [`declare`](Transport::declare) the
/// topology once, then [`publish`](Transport::publish) from any number of
/// concurrent requests, and [`close`](Transport::close) on shutdown.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the broker; later calls reuse the connection
    async fn open(&self) -> TransportResult<()>;

    /// Declare exchanges, queues and bindings; runs once per transport
    async fn declare(&self, topology: &TopologyRegistry) -> TransportResult<()>;

    /// Publish one message and wait for the broker's confirmation
    async fn publish(&self, message: OutboundMessage) -> TransportResult<()>;

    /// Flush pending work and release the connection
    async fn close(&self) -> TransportResult<()>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transport")
    }
}
