use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Publish outcome counters, owned by one publisher
#[derive(Clone)]
pub struct PublisherMetrics {
    registry: Registry,

    pub published_total: IntCounterVec,
    pub publish_failures_total: IntCounterVec,
}

impl PublisherMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let published_total = IntCounterVec::new(
            Opts::new("domain_events_published_total", "Domain events accepted by the broker"),
            &["event_type"],
        )
        .expect("metric");

        let publish_failures_total = IntCounterVec::new(
            Opts::new(
                "domain_events_publish_failures_total",
                "Domain events dropped after a failed publish",
            ),
            &["event_type", "reason"], // reason: transport|timeout|schema|encode|undeclared_action
        )
        .expect("metric");

        registry
            .register(Box::new(published_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(publish_failures_total.clone()))
            .expect("register metric");

        Self {
            registry,
            published_total,
            publish_failures_total,
        }
    }

    pub fn published(&self, event_type: &str) -> u64 {
        self.published_total.with_label_values(&[event_type]).get()
    }

    pub fn failures(&self, event_type: &str, reason: &str) -> u64 {
        self.publish_failures_total
            .with_label_values(&[event_type, reason])
            .get()
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for PublisherMetrics {
    fn default() -> Self {
        Self::new()
    }
}
