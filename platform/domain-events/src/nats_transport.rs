//! NATS JetStream implementation of the Transport trait
//!
//! Topology mapping:
//! - message subject: `<exchange>.<routing_key>`
//! - binding pattern: topic `#` becomes `>`, `*` stays `*`
//! - queue: one stream named after the queue (`crm.ticket.dlq` -> `CRM_TICKET_DLQ`)
//!   capturing the subjects of its bindings; dead-letter arguments are kept
//!   in the stream metadata for consumers
//! - publisher confirm: the JetStream publish ack, bounded by `ack_timeout`

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::topology::{Binding, Queue, QueueRole, TopologyRegistry};
use crate::{OutboundMessage, Transport, TransportError, TransportResult};
use async_nats::jetstream::{self, stream::Config};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};

/// JetStream duplicate window for `Nats-Msg-Id` de-duplication
const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct NatsTransportConfig {
    pub url: String,
    /// Client name reported to the server
    pub connection_name: String,
    pub connect_retry: RetryConfig,
    pub connect_timeout: Duration,
    /// How long a publish waits for the JetStream ack
    pub ack_timeout: Duration,
    pub stream_max_age: Duration,
    pub dlq_max_age: Duration,
}

impl Default for NatsTransportConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            connection_name: "domain-events".to_string(),
            connect_retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            stream_max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
            dlq_max_age: Duration::from_secs(60 * 60 * 24 * 30),    // 30 days
        }
    }
}

impl NatsTransportConfig {
    /// Reject URLs the client could never connect to
    pub fn validate(&self) -> TransportResult<()> {
        self.url
            .parse::<async_nats::ServerAddr>()
            .map(|_| ())
            .map_err(|e| {
                TransportError::Connection(format!("invalid NATS URL '{}': {e}", self.url))
            })
    }
}

#[derive(Clone)]
struct Connection {
    client: Client,
    jetstream: jetstream::Context,
}

/// Transport implementation using NATS JetStream
///
/// The connection is opened once and shared by every concurrent publish;
/// `async_nats::Client` multiplexes internally. Topology declaration runs at
/// most once per transport. `close` drops the connection, after which
/// publishes fail with [`TransportError::NotOpen`] until `open` is called
/// again.
///
/// # Example
/// ```rust,no_run
/// use domain_events::{NatsTransport, NatsTransportConfig, TopologyRegistry, Transport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut topology = TopologyRegistry::new("crm")?;
/// topology.register_domain("ticket")?;
///
/// let transport = NatsTransport::new(NatsTransportConfig::default())?;
/// transport.open().await?;
/// transport.declare(&topology).await?;
/// # Ok(())
/// # }
/// ```
pub struct NatsTransport {
    config: NatsTransportConfig,
    connection: RwLock<Option<Connection>>,
    declared: OnceCell<()>,
}

impl NatsTransport {
    /// Create a transport; fails on a malformed URL without connecting
    pub fn new(config: NatsTransportConfig) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connection: RwLock::new(None),
            declared: OnceCell::new(),
        })
    }

    async fn connection(&self) -> TransportResult<Connection> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotOpen)
    }

    async fn connect(&self) -> TransportResult<Connection> {
        let client = retry_with_backoff(
            || async {
                async_nats::ConnectOptions::new()
                    .name(&self.config.connection_name)
                    .connection_timeout(self.config.connect_timeout)
                    .connect(self.config.url.as_str())
                    .await
            },
            &self.config.connect_retry,
            "nats_connect",
        )
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::info!(url = %self.config.url, "Connected to NATS");

        Ok(Connection {
            jetstream: jetstream::new(client.clone()),
            client,
        })
    }

    async fn ensure_stream(
        &self,
        jetstream: &jetstream::Context,
        config: Config,
    ) -> TransportResult<()> {
        if jetstream.get_stream(&config.name).await.is_ok() {
            tracing::debug!(stream = %config.name, "Stream already exists");
            return Ok(());
        }

        let name = config.name.clone();
        jetstream
            .create_stream(config)
            .await
            .map_err(|e| TransportError::Declare(format!("stream {name}: {e}")))?;

        tracing::info!(stream = %name, "Created stream");
        Ok(())
    }

    /// Stream configuration for every queue of `topology`
    pub fn stream_configs(&self, topology: &TopologyRegistry) -> Vec<Config> {
        let bindings = topology.bindings();

        topology
            .queues()
            .iter()
            .map(|queue| {
                let max_age = match queue.role {
                    QueueRole::DeadLetter => self.config.dlq_max_age,
                    QueueRole::Default | QueueRole::Primary => self.config.stream_max_age,
                };
                Config {
                    name: stream_name(&queue.name),
                    subjects: stream_subjects(queue, &bindings),
                    max_age,
                    duplicate_window: DUPLICATE_WINDOW,
                    metadata: queue.arguments().into_iter().collect::<HashMap<_, _>>(),
                    ..Default::default()
                }
            })
            .collect()
    }
}

/// Subject a message published to `exchange` with `routing_key` is sent on
pub fn subject_for(exchange: &str, routing_key: &str) -> String {
    format!("{exchange}.{routing_key}")
}

/// JetStream stream name for a queue
pub fn stream_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

fn binding_subject(binding: &Binding) -> String {
    let pattern: Vec<&str> = binding
        .pattern
        .split('.')
        .map(|word| if word == "#" { ">" } else { word })
        .collect();
    subject_for(&binding.exchange, &pattern.join("."))
}

fn stream_subjects(queue: &Queue, bindings: &[Binding]) -> Vec<String> {
    bindings
        .iter()
        .filter(|b| b.queue == queue.name)
        .map(binding_subject)
        .collect()
}

#[async_trait]
impl Transport for NatsTransport {
    async fn open(&self) -> TransportResult<()> {
        let mut slot = self.connection.write().await;
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        Ok(())
    }

    async fn declare(&self, topology: &TopologyRegistry) -> TransportResult<()> {
        let connection = self.connection().await?;

        self.declared
            .get_or_try_init(|| async {
                let configs = self.stream_configs(topology);
                let count = configs.len();
                for config in configs {
                    self.ensure_stream(&connection.jetstream, config).await?;
                }
                tracing::info!(
                    exchange = %topology.primary_exchange().name,
                    streams = count,
                    "Declared JetStream topology"
                );
                Ok::<_, TransportError>(())
            })
            .await?;

        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> TransportResult<()> {
        let connection = self.connection().await?;
        if !self.declared.initialized() {
            return Err(TransportError::NotDeclared);
        }

        let subject = subject_for(&message.exchange, &message.routing_key);

        let mut headers = HeaderMap::new();
        headers.insert(
            async_nats::header::NATS_MESSAGE_ID,
            message.message_id.to_string().as_str(),
        );
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        let ack = connection
            .jetstream
            .publish_with_headers(subject.clone(), headers, message.payload.into())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        match tokio::time::timeout(self.config.ack_timeout, ack).await {
            Ok(Ok(ack)) => {
                tracing::debug!(
                    subject = %subject,
                    stream = %ack.stream,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "JetStream publish acknowledged"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Nack(e.to_string())),
            Err(_) => Err(TransportError::Timeout(self.config.ack_timeout)),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        let Some(connection) = self.connection.write().await.take() else {
            return Ok(());
        };

        // The client shuts down once its last handle is dropped
        match tokio::time::timeout(self.config.ack_timeout, connection.client.flush()).await {
            Ok(Ok(())) => {
                tracing::info!(url = %self.config.url, "Closed NATS connection");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Connection(e.to_string())),
            Err(_) => Err(TransportError::Timeout(self.config.ack_timeout)),
        }
    }
}
