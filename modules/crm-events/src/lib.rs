//! CRM domain events
//!
//! Wires the platform `domain-events` backbone for the CRM: one producer per
//! domain built from a descriptor table, the `crm` topic topology with a
//! queue and dead-letter queue per domain, and environment configuration.
//!
//! Service code publishes after its transaction commits:
//!
//! ```rust,no_run
//! use crm_events::{Config, EventPipeline};
//! use serde_json::{json, Map};
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = EventPipeline::start(&Config::from_env()?).await?;
//!
//! let mut snapshot = Map::new();
//! snapshot.insert("id".into(), json!(Uuid::new_v4()));
//! if let Some(leads) = pipeline.producers().domain("lead") {
//!     leads.send_created(Uuid::new_v4(), snapshot).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod domains;
pub mod producers;

pub use bootstrap::{build_topology, BootstrapError, EventPipeline};
pub use config::{BusType, Config, ConfigError};
pub use producers::CrmProducers;
