use crate::domains::{AUTOMATION_ACTION_EXECUTION, STATUS_CHANGED};
use chrono::{DateTime, Utc};
use domain_events::{
    DomainDescriptor, DomainProducer, EventPublisher, EventType, ProducerError, PublishReceipt,
    Route,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The producers the CRM service layer calls after committing a write
#[derive(Debug, Clone)]
pub struct CrmProducers {
    publisher: EventPublisher,
    domains: BTreeMap<String, DomainProducer>,
}

impl CrmProducers {
    pub fn new(
        publisher: EventPublisher,
        descriptors: Vec<DomainDescriptor>,
    ) -> Result<Self, ProducerError> {
        let domains = descriptors
            .into_iter()
            .map(|descriptor| {
                let name = descriptor.name().to_string();
                publisher.producer(descriptor).map(|producer| (name, producer))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Self { publisher, domains })
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Producer for one domain, e.g. `ticket`
    pub fn domain(&self, name: &str) -> Option<&DomainProducer> {
        self.domains.get(name)
    }

    pub fn domain_names(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// Every event type the CRM emits and where it is routed
    pub fn route_table(&self) -> Vec<(EventType, Route)> {
        self.domains.values().flat_map(DomainProducer::routes).collect()
    }

    /// Announce a status change of an automation action execution
    pub async fn send_execution_status_changed(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
        action_id: Uuid,
        status: &str,
        payload: Map<String, Value>,
        changed_dt: Option<DateTime<Utc>>,
    ) -> Option<PublishReceipt> {
        let Some(producer) = self.domain(AUTOMATION_ACTION_EXECUTION) else {
            panic!("domain event producer bug: {AUTOMATION_ACTION_EXECUTION} is not configured");
        };

        let mut fields = Map::new();
        fields.insert("execution_id".into(), json!(execution_id));
        fields.insert("action_id".into(), json!(action_id));
        fields.insert("status".into(), json!(status));
        fields.insert("payload".into(), Value::Object(payload));
        fields.insert("changed_dt".into(), json!(changed_dt));

        let mut headers = BTreeMap::new();
        headers.insert("action_id".to_string(), action_id.to_string());
        headers.insert("execution_id".to_string(), execution_id.to_string());

        producer.send_action(STATUS_CHANGED, tenant_id, fields, headers).await
    }
}
