//! Event type to exchange/routing-key resolution

use crate::envelope::{EnvelopeError, EventType};
use crate::topology::TopologyRegistry;
use serde::Serialize;
use std::sync::Arc;

/// Where a publish goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
    /// Queue the routing key is bound to
    pub queue: String,
}

/// Resolves event types against a registered topology
///
/// Resolution is pure: the registry is frozen behind an `Arc` once the
/// router exists.
#[derive(Debug, Clone)]
pub struct Router {
    topology: Arc<TopologyRegistry>,
}

impl Router {
    pub fn new(topology: Arc<TopologyRegistry>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    /// Resolve a well-formed event type; never fails
    ///
    /// The event type itself is the routing key when its domain is
    /// registered under this producer's prefix. Anything else (unknown
    /// domain, foreign producer segment) goes to the default queue's key.
    pub fn resolve(&self, event_type: &EventType) -> Route {
        let exchange = self.topology.primary_exchange().name.clone();

        let registered = (event_type.producer() == self.topology.prefix())
            .then(|| self.topology.domain(event_type.domain()))
            .flatten();

        match registered {
            Some(routes) => Route {
                exchange,
                routing_key: event_type.to_string(),
                queue: routes.queue.clone(),
            },
            None => {
                tracing::debug!(
                    event_type = %event_type,
                    default_queue = %self.topology.default_queue().name,
                    "No registered domain for event type, routing to default queue"
                );
                Route {
                    exchange,
                    routing_key: self.topology.default_routing_key().to_string(),
                    queue: self.topology.default_queue().name.clone(),
                }
            }
        }
    }

    /// Parse and resolve a raw event type string
    ///
    /// Malformed strings are producer bugs and are reported, not misrouted.
    pub fn resolve_str(&self, event_type: &str) -> Result<Route, EnvelopeError> {
        Ok(self.resolve(&EventType::parse(event_type)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        let mut topology = TopologyRegistry::new("crm").unwrap();
        topology.register_domain("ticket").unwrap();
        topology.register_domain("contact").unwrap();
        Router::new(Arc::new(topology))
    }

    #[test]
    fn test_registered_domain_routes_by_event_type() {
        let route = router().resolve_str("crm.ticket.created").unwrap();

        assert_eq!(route.exchange, "crm");
        assert_eq!(route.routing_key, "crm.ticket.created");
        assert_eq!(route.queue, "crm.ticket");
    }

    #[test]
    fn test_custom_action_routes_to_domain_queue() {
        let route = router().resolve_str("crm.ticket.status_changed").unwrap();
        assert_eq!(route.queue, "crm.ticket");
    }

    #[test]
    fn test_unregistered_domain_falls_back_to_default() {
        let route = router().resolve_str("crm.unknown_domain.created").unwrap();

        assert_eq!(route.exchange, "crm");
        assert_eq!(route.routing_key, "crm.default");
        assert_eq!(route.queue, "crm.default");
    }

    #[test]
    fn test_foreign_producer_falls_back_to_default() {
        let route = router().resolve_str("billing.ticket.created").unwrap();
        assert_eq!(route.queue, "crm.default");
    }

    #[test]
    fn test_malformed_event_type_fails_fast() {
        assert!(matches!(
            router().resolve_str("crm.ticket"),
            Err(EnvelopeError::MalformedEventType(_))
        ));
    }

    #[test]
    fn test_every_resolution_hits_a_declared_binding() {
        let router = router();
        let samples = [
            "crm.ticket.created",
            "crm.ticket.deleted",
            "crm.contact.updated",
            "crm.deal.created",
            "crm.default.created",
            "other.contact.created",
            "crm.ticket_tag.created",
        ];

        for raw in samples {
            let route = router.resolve_str(raw).unwrap();
            let queues = router
                .topology()
                .matching_queues(&route.exchange, &route.routing_key);
            assert_eq!(queues, vec![route.queue.clone()], "route for {raw} has no binding");
        }
    }
}
