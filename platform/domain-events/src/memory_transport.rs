//! In-memory implementation of the Transport trait for testing and development

use crate::envelope::{EnvelopeCodec, EnvelopeError, EventEnvelope};
use crate::topology::{Binding, DeadLetterTarget, TopologyRegistry};
use crate::{OutboundMessage, Transport, TransportError, TransportResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A message as stored in one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Uuid,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// Times this message was dead-lettered
    pub death_count: u32,
}

impl DeliveredMessage {
    /// Decode the payload as an event envelope
    pub fn envelope(&self) -> Result<EventEnvelope<serde_json::Value>, EnvelopeError> {
        EnvelopeCodec::decode(&self.payload)
    }
}

#[derive(Default)]
struct State {
    open: bool,
    declared: bool,
    declare_calls: u32,
    exchanges: Vec<String>,
    bindings: Vec<Binding>,
    dead_letter: BTreeMap<String, DeadLetterTarget>,
    queues: BTreeMap<String, VecDeque<DeliveredMessage>>,
    unavailable: bool,
    publish_delay: Option<Duration>,
}

/// Transport implementation that evaluates the topology in-process
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without a broker
/// - Integration tests that need fast, isolated routing checks
///
/// Published messages are routed through the declared topic bindings and
/// stored per queue. Every stored message is also broadcast to queue
/// subscribers. A publish matching no binding fails with
/// [`TransportError::Unroutable`], the way a mandatory publish is returned
/// by a real broker.
///
/// # Example
/// ```rust
/// use domain_events::{InMemoryTransport, OutboundMessage, TopologyRegistry, Transport};
/// use std::collections::BTreeMap;
/// use uuid::Uuid;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut topology = TopologyRegistry::new("crm")?;
/// topology.register_domain("ticket")?;
///
/// let transport = InMemoryTransport::new();
/// transport.open().await?;
/// transport.declare(&topology).await?;
///
/// transport
///     .publish(OutboundMessage {
///         exchange: "crm".into(),
///         routing_key: "crm.ticket.created".into(),
///         message_id: Uuid::new_v4(),
///         payload: b"{}".to_vec(),
///         headers: BTreeMap::new(),
///     })
///     .await?;
///
/// assert_eq!(transport.queue_depth("crm.ticket"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryTransport {
    sender: Arc<broadcast::Sender<DeliveredMessage>>,
    state: Arc<Mutex<State>>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport
    ///
    /// Subscribers share a broadcast channel with a buffer of 1000 messages.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory transport with a custom subscriber buffer size
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // State stays consistent across a panicking holder: every mutation is a
        // single push/insert.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate a broker outage: open, declare and publish fail while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Delay every publish confirmation by `delay`
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.state().publish_delay = delay;
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Number of times `declare` actually declared the topology
    pub fn declare_count(&self) -> u32 {
        self.state().declare_calls
    }

    pub fn exchange_names(&self) -> Vec<String> {
        self.state().exchanges.clone()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state().queues.keys().cloned().collect()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.state().bindings.clone()
    }

    /// Snapshot of the messages waiting in `queue`
    pub fn queue_messages(&self, queue: &str) -> Vec<DeliveredMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Take the oldest message from `queue`
    pub fn pop(&self, queue: &str) -> Option<DeliveredMessage> {
        self.state().queues.get_mut(queue)?.pop_front()
    }

    /// Reject the oldest message of `queue` the way a consumer nack does
    ///
    /// The broker re-publishes it through the queue's dead-letter exchange
    /// and routing key. Returns the DLQ names it landed in; a queue without
    /// dead-letter arguments simply drops the message.
    pub fn reject(&self, queue: &str) -> TransportResult<Vec<String>> {
        let mut state = self.state();

        let Some(mut message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(Vec::new());
        };
        let Some(target) = state.dead_letter.get(queue).cloned() else {
            tracing::debug!(
                queue = %queue,
                "Rejected message dropped, queue has no dead-letter exchange"
            );
            return Ok(Vec::new());
        };

        message.exchange = target.exchange.clone();
        message.routing_key = target.routing_key.clone();
        message.death_count += 1;

        let delivered = route(&mut state, &self.sender, message);
        if delivered.is_empty() {
            return Err(TransportError::Unroutable {
                exchange: target.exchange,
                routing_key: target.routing_key,
            });
        }

        tracing::debug!(queue = %queue, dead_letter_queues = ?delivered, "Message dead-lettered");
        Ok(delivered)
    }

    /// Stream every message stored in `queue` from now on
    pub fn subscribe(&self, queue: &str) -> BoxStream<'static, DeliveredMessage> {
        let mut receiver = self.sender.subscribe();
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if msg.queue == queue {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            queue = %queue,
                            skipped,
                            "InMemoryTransport subscriber lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        };

        stream.boxed()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Store `message` in every queue bound to its exchange and routing key
fn route(
    state: &mut State,
    sender: &broadcast::Sender<DeliveredMessage>,
    message: DeliveredMessage,
) -> Vec<String> {
    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|b| {
            b.exchange == message.exchange
                && crate::topology::topic_matches(&b.pattern, &message.routing_key)
        })
        .map(|b| b.queue.clone())
        .collect();

    for queue in &targets {
        let copy = DeliveredMessage {
            queue: queue.clone(),
            ..message.clone()
        };
        state.queues.entry(queue.clone()).or_default().push_back(copy.clone());
        // No receivers is fine
        let _ = sender.send(copy);
    }

    targets
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open(&self) -> TransportResult<()> {
        let mut state = self.state();
        if state.unavailable {
            return Err(TransportError::Connection("broker unavailable".to_string()));
        }
        state.open = true;
        Ok(())
    }

    async fn declare(&self, topology: &TopologyRegistry) -> TransportResult<()> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.unavailable {
            return Err(TransportError::Declare("broker unavailable".to_string()));
        }
        if state.declared {
            return Ok(());
        }

        for exchange in topology.exchanges() {
            if !state.exchanges.contains(&exchange.name) {
                state.exchanges.push(exchange.name);
            }
        }
        for queue in topology.queues() {
            state.queues.entry(queue.name.clone()).or_default();
            if let Some(target) = queue.dead_letter {
                state.dead_letter.insert(queue.name, target);
            }
        }
        for binding in topology.bindings() {
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        }

        state.declared = true;
        state.declare_calls += 1;
        tracing::info!(
            exchanges = state.exchanges.len(),
            queues = state.queues.len(),
            bindings = state.bindings.len(),
            "Declared in-memory topology"
        );
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> TransportResult<()> {
        let delay = {
            let state = self.state();
            if state.unavailable {
                return Err(TransportError::Publish("broker unavailable".to_string()));
            }
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            if !state.declared {
                return Err(TransportError::NotDeclared);
            }
            state.publish_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let delivered = route(
            &mut state,
            &self.sender,
            DeliveredMessage {
                queue: String::new(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                message_id: message.message_id,
                payload: message.payload,
                headers: message.headers,
                death_count: 0,
            },
        );

        if delivered.is_empty() {
            return Err(TransportError::Unroutable {
                exchange: message.exchange,
                routing_key: message.routing_key,
            });
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.state().open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> TopologyRegistry {
        let mut topology = TopologyRegistry::new("crm").unwrap();
        topology.register_domain("ticket").unwrap();
        topology.register_domain("contact").unwrap();
        topology
    }

    fn message(routing_key: &str) -> OutboundMessage {
        OutboundMessage {
            exchange: "crm".to_string(),
            routing_key: routing_key.to_string(),
            message_id: Uuid::new_v4(),
            payload: format!("{{\"key\":\"{routing_key}\"}}").into_bytes(),
            headers: BTreeMap::new(),
        }
    }

    async fn ready() -> InMemoryTransport {
        let transport = InMemoryTransport::new();
        transport.open().await.unwrap();
        transport.declare(&topology()).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_declare_creates_topology_once() {
        let transport = ready().await;
        transport.declare(&topology()).await.unwrap();

        assert_eq!(transport.declare_count(), 1);
        assert_eq!(transport.exchange_names(), vec!["crm", "crm.dlx"]);
        assert_eq!(
            transport.queue_names(),
            vec!["crm.contact", "crm.contact.dlq", "crm.default", "crm.ticket", "crm.ticket.dlq"]
        );
        assert_eq!(transport.bindings().len(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_declare_runs_once() {
        let transport = InMemoryTransport::new();
        transport.open().await.unwrap();
        let topology = Arc::new(topology());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let transport = transport.clone();
                let topology = topology.clone();
                tokio::spawn(async move { transport.declare(&topology).await })
            })
            .collect();
        let (first, second) = tokio::join!(
            transport.declare(&topology),
            transport.declare(&topology)
        );

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        first.unwrap();
        second.unwrap();
        assert_eq!(transport.declare_count(), 1);
        assert_eq!(transport.bindings().len(), 5);
    }

    #[tokio::test]
    async fn test_publish_requires_open_and_declared() {
        let transport = InMemoryTransport::new();
        assert!(matches!(
            transport.publish(message("crm.ticket.created")).await,
            Err(TransportError::NotOpen)
        ));
        assert!(matches!(
            transport.declare(&topology()).await,
            Err(TransportError::NotOpen)
        ));

        transport.open().await.unwrap();
        assert!(matches!(
            transport.publish(message("crm.ticket.created")).await,
            Err(TransportError::NotDeclared)
        ));
    }

    #[tokio::test]
    async fn test_publish_routes_by_binding() {
        let transport = ready().await;

        transport.publish(message("crm.ticket.created")).await.unwrap();
        transport.publish(message("crm.ticket.updated")).await.unwrap();
        transport.publish(message("crm.contact.deleted")).await.unwrap();
        transport.publish(message("crm.default")).await.unwrap();

        assert_eq!(transport.queue_depth("crm.ticket"), 2);
        assert_eq!(transport.queue_depth("crm.contact"), 1);
        assert_eq!(transport.queue_depth("crm.default"), 1);
        assert_eq!(transport.queue_depth("crm.ticket.dlq"), 0);

        let keys: Vec<String> = transport
            .queue_messages("crm.ticket")
            .into_iter()
            .map(|m| m.routing_key)
            .collect();
        assert_eq!(keys, vec!["crm.ticket.created", "crm.ticket.updated"]);
    }

    #[tokio::test]
    async fn test_unbound_routing_key_is_unroutable() {
        let transport = ready().await;

        let result = transport.publish(message("crm.deal.created")).await;

        assert!(matches!(result, Err(TransportError::Unroutable { .. })));
    }

    #[tokio::test]
    async fn test_reject_dead_letters_into_domain_dlq() {
        let transport = ready().await;
        transport.publish(message("crm.ticket.created")).await.unwrap();

        let landed = transport.reject("crm.ticket").unwrap();

        assert_eq!(landed, vec!["crm.ticket.dlq"]);
        assert_eq!(transport.queue_depth("crm.ticket"), 0);

        let dead = transport.pop("crm.ticket.dlq").unwrap();
        assert_eq!(dead.exchange, "crm.dlx");
        assert_eq!(dead.routing_key, "crm.ticket.dlq");
        assert_eq!(dead.death_count, 1);
    }

    #[tokio::test]
    async fn test_reject_from_default_queue_drops() {
        let transport = ready().await;
        transport.publish(message("crm.default")).await.unwrap();

        assert!(transport.reject("crm.default").unwrap().is_empty());
        assert_eq!(transport.queue_depth("crm.default"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_publish() {
        let transport = ready().await;
        transport.set_unavailable(true);

        assert!(matches!(
            transport.publish(message("crm.ticket.created")).await,
            Err(TransportError::Publish(_))
        ));
        assert_eq!(transport.queue_depth("crm.ticket"), 0);

        transport.set_unavailable(false);
        transport.publish(message("crm.ticket.created")).await.unwrap();
        assert_eq!(transport.queue_depth("crm.ticket"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_to_queue() {
        let transport = ready().await;
        let mut stream = transport.subscribe("crm.contact");

        transport.publish(message("crm.ticket.created")).await.unwrap();
        transport.publish(message("crm.contact.created")).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(msg.queue, "crm.contact");
        assert_eq!(msg.routing_key, "crm.contact.created");

        let result = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(result.is_err(), "should timeout, no more messages");
    }

    #[tokio::test]
    async fn test_close_then_publish_fails() {
        let transport = ready().await;
        transport.close().await.unwrap();

        assert!(!transport.is_open());
        assert!(matches!(
            transport.publish(message("crm.ticket.created")).await,
            Err(TransportError::NotOpen)
        ));
    }
}
