//! # Publisher Core
//!
//! Builds the envelope, resolves the route and hands the bytes to the
//! transport, bounded by a publish timeout.
//!
//! The publisher is the single place where the "never fail a committed
//! write" policy lives: [`EventPublisher::publish`] reports every outcome as
//! a `Result` and logs failures, and [`EventPublisher::publish_best_effort`]
//! swallows transient failures so call sites need no error handling.

use crate::context::{self, EventContext};
use crate::envelope::{
    EnvelopeCodec, EnvelopeError, EventType, DEFAULT_SCHEMA_VERSION, ENVELOPE_CONTENT_TYPE,
};
use crate::metrics::PublisherMetrics;
use crate::producer::{DomainDescriptor, DomainProducer, ProducerError};
use crate::routing::{Route, Router};
use crate::{headers, OutboundMessage, Transport, TransportError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Errors that can occur while publishing one event
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("payload for {event_type} violates its schema: {reason}")]
    Schema { event_type: String, reason: String },

    #[error("domain '{domain}' does not declare action '{action}'")]
    UndeclaredAction { domain: String, action: String },

    #[error("action '{action}' of domain '{domain}' has a typed send method")]
    TypedAction { domain: String, action: String },

    #[error("field '{field}' is reserved in the data of {event_type}")]
    ReservedField { event_type: String, field: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    /// Environment failures that are logged and swallowed
    ///
    /// Everything else is a producer bug.
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transport(_) | PublishError::Timeout(_))
    }

    /// Metric label for the failure
    pub fn reason(&self) -> &'static str {
        match self {
            PublishError::Envelope(_) => "encode",
            PublishError::Schema { .. } => "schema",
            PublishError::UndeclaredAction { .. } => "undeclared_action",
            PublishError::TypedAction { .. } => "typed_action",
            PublishError::ReservedField { .. } => "reserved_field",
            PublishError::Transport(TransportError::Timeout(_)) | PublishError::Timeout(_) => {
                "timeout"
            }
            PublishError::Transport(_) => "transport",
        }
    }
}

/// One event to publish
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub event_type: EventType,
    pub tenant_id: Uuid,
    pub schema_version: u32,
    pub data: Value,
    /// Explicit correlation; unset fields fall back to the ambient scope
    pub context: EventContext,
    /// Extra message headers
    pub headers: BTreeMap<String, String>,
}

impl PublishRequest {
    pub fn new(event_type: EventType, tenant_id: Uuid, data: Value) -> Self {
        Self {
            event_type,
            tenant_id,
            schema_version: DEFAULT_SCHEMA_VERSION,
            data,
            context: EventContext::default(),
            headers: BTreeMap::new(),
        }
    }

    /// Build a request from a raw event type string
    pub fn parse(event_type: &str, tenant_id: Uuid, data: Value) -> Result<Self, EnvelopeError> {
        Ok(Self::new(EventType::parse(event_type)?, tenant_id, data))
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Outcome of a confirmed publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub route: Route,
}

struct Inner {
    codec: EnvelopeCodec,
    router: Router,
    transport: Arc<dyn Transport>,
    publish_timeout: Duration,
}

/// Shared publisher; cheap to clone, safe to use from concurrent requests
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
    content_type: Arc<str>,
    metrics: PublisherMetrics,
}

impl EventPublisher {
    pub fn new(
        codec: EnvelopeCodec,
        router: Router,
        transport: Arc<dyn Transport>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                codec,
                router,
                transport,
                publish_timeout,
            }),
            content_type: Arc::from(ENVELOPE_CONTENT_TYPE),
            metrics: PublisherMetrics::new(),
        }
    }

    /// Content type header sent with every message
    ///
    /// Must be a JSON media type; parameters such as a charset are kept.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Arc::from(content_type.into());
        self
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn metrics(&self) -> &PublisherMetrics {
        &self.metrics
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.inner.codec
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Build a facade for one domain on top of this publisher
    pub fn producer(&self, descriptor: DomainDescriptor) -> Result<DomainProducer, ProducerError> {
        DomainProducer::new(self.clone(), descriptor)
    }

    /// Publish one event and wait for the broker confirmation
    ///
    /// Failures are logged and counted here; the error is returned for
    /// callers that want to inspect it.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        let event_type = request.event_type.clone();
        let tenant_id = request.tenant_id;

        match self.try_publish(request).await {
            Ok(receipt) => {
                self.metrics
                    .published_total
                    .with_label_values(&[event_type.as_str()])
                    .inc();
                tracing::debug!(
                    event_id = %receipt.event_id,
                    event_type = %event_type,
                    tenant_id = %tenant_id,
                    routing_key = %receipt.route.routing_key,
                    queue = %receipt.route.queue,
                    "Published domain event"
                );
                Ok(receipt)
            }
            Err(e) => {
                self.record_failure(&event_type, tenant_id, &e);
                Err(e)
            }
        }
    }

    /// Publish without ever failing the caller's write path
    ///
    /// Transient failures return `None`. Producer bugs panic.
    pub async fn publish_best_effort(&self, request: PublishRequest) -> Option<PublishReceipt> {
        match self.publish(request).await {
            Ok(receipt) => Some(receipt),
            Err(e) if e.is_transient() => None,
            Err(e) => panic!("domain event producer bug: {e}"),
        }
    }

    pub(crate) fn record_failure(
        &self,
        event_type: &EventType,
        tenant_id: Uuid,
        error: &PublishError,
    ) {
        self.metrics
            .publish_failures_total
            .with_label_values(&[event_type.as_str(), error.reason()])
            .inc();
        tracing::error!(
            event_type = %event_type,
            tenant_id = %tenant_id,
            reason = error.reason(),
            error = %error,
            "Failed to publish domain event"
        );
    }

    async fn try_publish(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        let inner = &self.inner;
        let context = request.context.merged_with(context::current());
        let route = inner.router.resolve(&request.event_type);

        let sealed = inner.codec.encode(
            &request.event_type,
            request.tenant_id,
            request.schema_version,
            &request.data,
            &context,
        )?;

        let mut message_headers = request.headers;
        message_headers.insert(headers::CONTENT_TYPE.to_string(), self.content_type.to_string());
        message_headers.insert(headers::TENANT_ID.to_string(), sealed.tenant_id.to_string());
        message_headers.insert(headers::MESSAGE_ID.to_string(), sealed.event_id.to_string());
        if let Some(correlation_id) = &sealed.correlation_id {
            message_headers.insert(headers::CORRELATION_ID.to_string(), correlation_id.clone());
        }
        if let Some(causation_id) = &sealed.causation_id {
            message_headers.insert(headers::CAUSATION_ID.to_string(), causation_id.clone());
        }

        let message = OutboundMessage {
            exchange: route.exchange.clone(),
            routing_key: route.routing_key.clone(),
            message_id: sealed.event_id,
            payload: sealed.bytes,
            headers: message_headers,
        };

        tokio::time::timeout(inner.publish_timeout, inner.transport.publish(message))
            .await
            .map_err(|_| PublishError::Timeout(inner.publish_timeout))??;

        context::record_published(sealed.event_id);

        Ok(PublishReceipt {
            event_id: sealed.event_id,
            event_type: sealed.event_type,
            route,
        })
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("producer", &self.inner.codec.producer())
            .field("publish_timeout", &self.inner.publish_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_transport::InMemoryTransport;
    use crate::topology::TopologyRegistry;
    use serde_json::json;

    async fn setup() -> (EventPublisher, InMemoryTransport) {
        let mut topology = TopologyRegistry::new("crm").unwrap();
        topology.register_domain("ticket").unwrap();
        topology.register_domain("contact").unwrap();
        let topology = Arc::new(topology);

        let transport = InMemoryTransport::new();
        transport.open().await.unwrap();
        transport.declare(&topology).await.unwrap();

        let publisher = EventPublisher::new(
            EnvelopeCodec::new("crm"),
            Router::new(topology),
            Arc::new(transport.clone()),
            Duration::from_secs(1),
        );
        (publisher, transport)
    }

    fn request(event_type: &str, tenant_id: Uuid, data: Value) -> PublishRequest {
        PublishRequest::parse(event_type, tenant_id, data).unwrap()
    }

    #[tokio::test]
    async fn test_publish_wraps_inputs_in_envelope() {
        let (publisher, transport) = setup().await;
        let tenant_id = Uuid::new_v4();

        let receipt = publisher
            .publish(request("crm.ticket.created", tenant_id, json!({"id": "t1"})))
            .await
            .unwrap();

        assert_eq!(receipt.route.queue, "crm.ticket");

        let messages = transport.queue_messages("crm.ticket");
        assert_eq!(messages.len(), 1);
        let envelope = messages[0].envelope().unwrap();
        assert_eq!(envelope.event_id, receipt.event_id);
        assert_eq!(envelope.event_type.as_str(), "crm.ticket.created");
        assert_eq!(envelope.tenant_id, tenant_id);
        assert_eq!(envelope.producer, "crm");
        assert_eq!(envelope.data, json!({"id": "t1"}));
        assert_eq!(messages[0].routing_key, "crm.ticket.created");
        assert_eq!(messages[0].message_id, receipt.event_id);
    }

    #[tokio::test]
    async fn test_identical_inputs_get_distinct_event_ids() {
        let (publisher, transport) = setup().await;
        let tenant_id = Uuid::new_v4();

        for _ in 0..3 {
            publisher
                .publish(request("crm.contact.updated", tenant_id, json!({"id": "c1"})))
                .await
                .unwrap();
        }

        let mut ids: Vec<Uuid> = transport
            .queue_messages("crm.contact")
            .iter()
            .map(|m| m.envelope().unwrap().event_id)
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_domain_goes_to_default_queue() {
        let (publisher, transport) = setup().await;

        let receipt = publisher
            .publish(request("crm.unknown_domain.created", Uuid::new_v4(), json!({})))
            .await
            .unwrap();

        assert_eq!(receipt.route.queue, "crm.default");
        assert_eq!(transport.queue_depth("crm.default"), 1);
        let envelope = transport.queue_messages("crm.default")[0].envelope().unwrap();
        assert_eq!(envelope.event_type.as_str(), "crm.unknown_domain.created");
    }

    #[tokio::test]
    async fn test_headers_carry_tenant_and_correlation() {
        let (publisher, transport) = setup().await;
        let tenant_id = Uuid::new_v4();

        let receipt = publisher
            .publish(
                request("crm.ticket.updated", tenant_id, json!({}))
                    .with_context(EventContext::new().with_correlation_id("req-42"))
                    .with_header("execution_id", "exec-1"),
            )
            .await
            .unwrap();

        let headers = &transport.queue_messages("crm.ticket")[0].headers;
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["tenant_id"], tenant_id.to_string());
        assert_eq!(headers["message_id"], receipt.event_id.to_string());
        assert_eq!(headers["correlation_id"], "req-42");
        assert_eq!(headers["execution_id"], "exec-1");
        assert!(!headers.contains_key("causation_id"));
    }

    #[tokio::test]
    async fn test_configured_content_type_reaches_header() {
        let (publisher, transport) = setup().await;
        let publisher = publisher.with_content_type("application/json; charset=utf-8");

        publisher
            .publish(request("crm.ticket.created", Uuid::new_v4(), json!({})))
            .await
            .unwrap();

        let headers = &transport.queue_messages("crm.ticket")[0].headers;
        assert_eq!(headers["content-type"], "application/json; charset=utf-8");
    }

    #[tokio::test]
    async fn test_scope_chains_causation() {
        let (publisher, transport) = setup().await;
        let tenant_id = Uuid::new_v4();

        let ctx = EventContext::new().with_correlation_id("req-1");
        let (first, second) = context::scope(ctx, async {
            let first = publisher
                .publish(request("crm.ticket.created", tenant_id, json!({})))
                .await
                .unwrap();
            let second = publisher
                .publish(request("crm.contact.updated", tenant_id, json!({})))
                .await
                .unwrap();
            (first, second)
        })
        .await;

        let ticket = transport.queue_messages("crm.ticket")[0].envelope().unwrap();
        let contact = transport.queue_messages("crm.contact")[0].envelope().unwrap();

        assert_eq!(ticket.event_id, first.event_id);
        assert_eq!(ticket.correlation_id.as_deref(), Some("req-1"));
        assert!(ticket.causation_id.is_none());

        assert_eq!(contact.event_id, second.event_id);
        assert_eq!(contact.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(contact.causation_id, Some(first.event_id.to_string()));
    }

    #[tokio::test]
    async fn test_transport_failure_is_transient() {
        let (publisher, transport) = setup().await;
        transport.set_unavailable(true);

        let err = publisher
            .publish(request("crm.ticket.created", Uuid::new_v4(), json!({})))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(err.reason(), "transport");
        assert_eq!(publisher.metrics().failures("crm.ticket.created", "transport"), 1);
        assert_eq!(publisher.metrics().published("crm.ticket.created"), 0);
    }

    #[tokio::test]
    async fn test_best_effort_swallows_outage() {
        let (publisher, transport) = setup().await;
        transport.set_unavailable(true);

        let receipt = publisher
            .publish_best_effort(request("crm.ticket.created", Uuid::new_v4(), json!({})))
            .await;

        assert!(receipt.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_broker_times_out() {
        let (publisher, transport) = setup().await;
        transport.set_publish_delay(Some(Duration::from_secs(30)));

        let err = publisher
            .publish(request("crm.ticket.created", Uuid::new_v4(), json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Timeout(d) if d == Duration::from_secs(1)));
        assert!(err.is_transient());
        assert_eq!(publisher.metrics().failures("crm.ticket.created", "timeout"), 1);
    }

    #[tokio::test]
    async fn test_nil_tenant_is_not_transient() {
        let (publisher, _transport) = setup().await;

        let err = publisher
            .publish(request("crm.ticket.created", Uuid::nil(), json!({})))
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(err.reason(), "encode");
    }

    #[tokio::test]
    #[should_panic(expected = "domain event producer bug")]
    async fn test_best_effort_panics_on_producer_bug() {
        let (publisher, _transport) = setup().await;

        publisher
            .publish_best_effort(request("crm.ticket.created", Uuid::nil(), json!({})))
            .await;
    }

    #[tokio::test]
    async fn test_successful_publish_is_counted() {
        let (publisher, _transport) = setup().await;

        publisher
            .publish(request("crm.ticket.created", Uuid::new_v4(), json!({})))
            .await
            .unwrap();

        assert_eq!(publisher.metrics().published("crm.ticket.created"), 1);
    }
}
