//! Startup wiring: topology, transport, publisher and producers
//!
//! Everything here runs once at process start and fails the process on
//! error; nothing is retried after startup except the broker connect.

use crate::config::{BusType, Config};
use crate::domains;
use crate::producers::CrmProducers;
use domain_events::{
    DomainDescriptor, EnvelopeCodec, EventPublisher, InMemoryTransport, NatsTransport,
    ProducerError, Router, TopologyError, TopologyRegistry, Transport, TransportError,
};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("invalid domain schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("broker error: {0}")]
    Transport(#[from] TransportError),

    #[error("producer error: {0}")]
    Producer(#[from] ProducerError),
}

/// Register every descriptor's domain under `exchange`
pub fn build_topology(
    exchange: &str,
    descriptors: &[DomainDescriptor],
) -> Result<TopologyRegistry, TopologyError> {
    let mut topology = TopologyRegistry::new(exchange)?;
    for descriptor in descriptors {
        topology.register_domain(descriptor.name())?;
    }
    Ok(topology)
}

/// A connected, declared event pipeline
#[derive(Debug)]
pub struct EventPipeline {
    topology: Arc<TopologyRegistry>,
    transport: Arc<dyn Transport>,
    producers: CrmProducers,
}

impl EventPipeline {
    /// Connect to the configured broker and declare the CRM topology
    pub async fn start(config: &Config) -> Result<Self, BootstrapError> {
        let transport: Arc<dyn Transport> = match config.bus_type {
            BusType::Nats => Arc::new(NatsTransport::new(config.nats_transport_config())?),
            BusType::InMemory => {
                tracing::warn!("BUS_TYPE=inmemory, events stay in this process");
                Arc::new(InMemoryTransport::new())
            }
        };
        Self::with_transport(config, transport).await
    }

    /// Same as [`start`](Self::start) on an existing transport
    pub async fn with_transport(
        config: &Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BootstrapError> {
        let descriptors = domains::descriptors()?;
        let topology = Arc::new(build_topology(&config.exchange_name, &descriptors)?);

        transport.open().await?;
        transport.declare(&topology).await?;

        let publisher = EventPublisher::new(
            EnvelopeCodec::new(config.exchange_name.clone()),
            Router::new(topology.clone()),
            transport.clone(),
            config.publish_timeout,
        )
        .with_content_type(config.content_type.clone());
        let producers = CrmProducers::new(publisher, descriptors)?;

        tracing::info!(
            exchange = %config.exchange_name,
            domains = topology.domains().count(),
            queues = topology.queues().len(),
            "Event pipeline ready"
        );

        Ok(Self {
            topology,
            transport,
            producers,
        })
    }

    pub fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn producers(&self) -> &CrmProducers {
        &self.producers
    }

    pub fn publisher(&self) -> &EventPublisher {
        self.producers.publisher()
    }

    /// Flush and release the broker connection
    ///
    /// The final publish counters are logged before the connection closes.
    pub async fn shutdown(self) -> Result<(), TransportError> {
        match self.publisher().metrics().render() {
            Ok(counters) => tracing::debug!(counters = %counters, "Final publish counters"),
            Err(e) => tracing::warn!(error = %e, "Failed to render publish counters"),
        }

        self.transport.close().await?;
        tracing::info!("Event pipeline closed");
        Ok(())
    }
}
