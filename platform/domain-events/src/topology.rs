//! # Topology Registry
//!
//! Static description of the broker layout for one producer:
//!
//! - a primary topic exchange named after the prefix (`crm`)
//! - a dead-letter topic exchange (`crm.dlx`)
//! - a catch-all queue `crm.default` bound with the exact key `crm.default`
//! - per registered domain `D`:
//!   - queue `crm.D` bound to the primary exchange with `crm.D.#`, carrying
//!     dead-letter arguments that point at `crm.dlx` / `crm.D.dlq`
//!   - queue `crm.D.dlq` bound to the dead-letter exchange with `crm.D.dlq`
//!
//! The registry is built once at startup and shared read-only afterwards.

use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_QUEUE_SUFFIX: &str = "default";
pub const DEAD_LETTER_EXCHANGE_SUFFIX: &str = "dlx";
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = "dlq";

/// Queue argument naming the exchange a rejected message is re-routed to
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used for re-routing
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("invalid exchange name '{0}': use lowercase letters, digits, '_' or '-'")]
    InvalidExchangeName(String),

    #[error("invalid domain name '{0}': use lowercase letters, digits or '_'")]
    InvalidDomainName(String),

    #[error("domain name '{0}' is reserved")]
    ReservedDomainName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRole {
    /// Catch-all for event types of unregistered domains
    Default,
    Primary,
    DeadLetter,
}

/// Where the broker re-routes a message rejected from a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Queue {
    pub name: String,
    pub role: QueueRole,
    pub dead_letter: Option<DeadLetterTarget>,
}

impl Queue {
    /// Broker declaration arguments (`x-dead-letter-*`)
    pub fn arguments(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        if let Some(target) = &self.dead_letter {
            args.insert(DEAD_LETTER_EXCHANGE_ARG.to_string(), target.exchange.clone());
            args.insert(DEAD_LETTER_ROUTING_KEY_ARG.to_string(), target.routing_key.clone());
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    /// Topic pattern: `*` matches one word, `#` matches zero or more
    pub pattern: String,
}

/// Names produced by registering one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainRoutes {
    pub domain: String,
    pub queue: String,
    pub dlq: String,
    /// `<prefix>.<domain>`, the routing-key prefix of every action
    pub routing_prefix: String,
    pub binding_pattern: String,
    pub dead_letter_routing_key: String,
}

#[derive(Debug, Clone)]
pub struct TopologyRegistry {
    prefix: String,
    primary: Exchange,
    dead_letter: Exchange,
    default_queue: Queue,
    domains: BTreeMap<String, DomainRoutes>,
}

impl TopologyRegistry {
    /// Create a registry whose primary exchange is named `prefix`
    pub fn new(prefix: &str) -> Result<Self, TopologyError> {
        let valid = !prefix.is_empty()
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(TopologyError::InvalidExchangeName(prefix.to_string()));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            primary: Exchange {
                name: prefix.to_string(),
                kind: ExchangeKind::Topic,
            },
            dead_letter: Exchange {
                name: format!("{prefix}.{DEAD_LETTER_EXCHANGE_SUFFIX}"),
                kind: ExchangeKind::Topic,
            },
            default_queue: Queue {
                name: format!("{prefix}.{DEFAULT_QUEUE_SUFFIX}"),
                role: QueueRole::Default,
                dead_letter: None,
            },
            domains: BTreeMap::new(),
        })
    }

    /// Register a domain, returning its queue names
    ///
    /// Registering the same domain again returns the existing entry and
    /// adds nothing.
    pub fn register_domain(&mut self, name: &str) -> Result<DomainRoutes, TopologyError> {
        if let Some(existing) = self.domains.get(name) {
            return Ok(existing.clone());
        }

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(TopologyError::InvalidDomainName(name.to_string()));
        }
        if name == DEFAULT_QUEUE_SUFFIX || name == DEAD_LETTER_EXCHANGE_SUFFIX {
            return Err(TopologyError::ReservedDomainName(name.to_string()));
        }

        let routing_prefix = format!("{}.{name}", self.prefix);
        let routes = DomainRoutes {
            domain: name.to_string(),
            queue: routing_prefix.clone(),
            dlq: format!("{routing_prefix}.{DEAD_LETTER_QUEUE_SUFFIX}"),
            binding_pattern: format!("{routing_prefix}.#"),
            dead_letter_routing_key: format!("{routing_prefix}.{DEAD_LETTER_QUEUE_SUFFIX}"),
            routing_prefix,
        };

        tracing::debug!(domain = %name, queue = %routes.queue, "Registered domain topology");
        self.domains.insert(name.to_string(), routes.clone());
        Ok(routes)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn domain(&self, name: &str) -> Option<&DomainRoutes> {
        self.domains.get(name)
    }

    pub fn domains(&self) -> impl Iterator<Item = &DomainRoutes> {
        self.domains.values()
    }

    pub fn primary_exchange(&self) -> &Exchange {
        &self.primary
    }

    pub fn dead_letter_exchange(&self) -> &Exchange {
        &self.dead_letter
    }

    pub fn default_queue(&self) -> &Queue {
        &self.default_queue
    }

    /// Routing key that lands on the default queue
    pub fn default_routing_key(&self) -> &str {
        &self.default_queue.name
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        vec![self.primary.clone(), self.dead_letter.clone()]
    }

    /// Every queue: the default queue first, then primary/DLQ pairs by domain
    pub fn queues(&self) -> Vec<Queue> {
        let mut queues = vec![self.default_queue.clone()];
        for routes in self.domains.values() {
            queues.push(Queue {
                name: routes.queue.clone(),
                role: QueueRole::Primary,
                dead_letter: Some(DeadLetterTarget {
                    exchange: self.dead_letter.name.clone(),
                    routing_key: routes.dead_letter_routing_key.clone(),
                }),
            });
            queues.push(Queue {
                name: routes.dlq.clone(),
                role: QueueRole::DeadLetter,
                dead_letter: None,
            });
        }
        queues
    }

    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings = vec![Binding {
            exchange: self.primary.name.clone(),
            queue: self.default_queue.name.clone(),
            pattern: self.default_queue.name.clone(),
        }];
        for routes in self.domains.values() {
            bindings.push(Binding {
                exchange: self.primary.name.clone(),
                queue: routes.queue.clone(),
                pattern: routes.binding_pattern.clone(),
            });
            bindings.push(Binding {
                exchange: self.dead_letter.name.clone(),
                queue: routes.dlq.clone(),
                pattern: routes.dead_letter_routing_key.clone(),
            });
        }
        bindings
    }

    /// Queues that receive a message published to `exchange` with `routing_key`
    pub fn matching_queues(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = self
            .bindings()
            .into_iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue)
            .collect();
        queues.dedup();
        queues
    }
}

/// Match a routing key against a topic binding pattern
///
/// Words are separated by `.`:
/// - `*` matches exactly one word
/// - `#` matches zero or more words
///
/// # Examples
/// - `crm.ticket.#` matches `crm.ticket.created` and `crm.ticket`
/// - `crm.*.created` matches `crm.deal.created`
/// - `crm.*` does NOT match `crm.deal.created` (too many words)
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let key_tokens: Vec<&str> = routing_key.split('.').collect();
    match_tokens(&pattern_tokens, &key_tokens)
}

fn match_tokens(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_tokens(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_tokens(rest, &key[1..]),
        Some((token, rest)) => key.first() == Some(token) && match_tokens(rest, &key[1..]),
    }
}
