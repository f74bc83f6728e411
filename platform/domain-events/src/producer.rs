//! # Domain Producer Facade
//!
//! One generic producer per domain, configured by a [`DomainDescriptor`]
//! instead of a hand-written class per entity. Each `send_*` call builds the
//! typed `data` for its action, validates the snapshot against the domain's
//! JSON Schema and publishes `<producer>.<domain>.<action>`.
//!
//! Send methods are meant to be called after the database commit and never
//! fail: a broker outage is logged and counted by the publisher and the
//! method returns `None`. Producer bugs (an action the domain does not
//! declare, a snapshot violating the schema) panic.

use crate::envelope::{EnvelopeError, EventType, DEFAULT_SCHEMA_VERSION};
use crate::publisher::{EventPublisher, PublishError, PublishReceipt, PublishRequest};
use crate::routing::Route;
use chrono::{DateTime, Utc};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle action, the last segment of an event type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Created,
    Updated,
    Deleted,
    /// Domain-specific action, e.g. `status_changed`
    Custom(String),
}

impl Action {
    pub fn custom(name: impl Into<String>) -> Self {
        Action::Custom(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
            Action::Custom(name) => name,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        match value {
            "created" => Action::Created,
            "updated" => Action::Updated,
            "deleted" => Action::Deleted,
            other => Action::Custom(other.to_string()),
        }
    }
}

/// Declarative description of one domain's events
#[derive(Debug, Clone, PartialEq)]
pub struct DomainDescriptor {
    name: String,
    actions: BTreeSet<Action>,
    schema: Option<Value>,
    schema_version: u32,
}

impl DomainDescriptor {
    /// A domain with no actions yet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: BTreeSet::new(),
            schema: None,
            schema_version: DEFAULT_SCHEMA_VERSION,
        }
    }

    /// A domain emitting created, updated and deleted
    pub fn crud(name: impl Into<String>) -> Self {
        Self::new(name)
            .with_action(Action::Created)
            .with_action(Action::Updated)
            .with_action(Action::Deleted)
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.insert(action);
        self
    }

    pub fn without_action(mut self, action: Action) -> Self {
        self.actions.remove(&action);
        self
    }

    /// JSON Schema every created/updated snapshot must satisfy
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub fn supports(&self, action: &Action) -> bool {
        self.actions.contains(action)
    }

    pub fn schema(&self) -> Option<&Value> {
        self.schema.as_ref()
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// `data` of a `created` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedData {
    pub tenant_id: Uuid,
    pub payload: Map<String, Value>,
}

/// `data` of an `updated` event: the applied changes and the new snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedData {
    pub tenant_id: Uuid,
    pub changes: Map<String, Value>,
    pub payload: Map<String, Value>,
}

/// `data` of a `deleted` event
///
/// `deleted_dt` is always written, as `null` when unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedData {
    pub tenant_id: Uuid,
    pub deleted_dt: Option<DateTime<Utc>>,
}

/// Field of every action's `data` naming the owning tenant
const TENANT_ID_FIELD: &str = "tenant_id";

/// `data` of a custom action: the tenant plus action-specific fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    pub tenant_id: Uuid,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("domain '{0}' is not registered in the topology")]
    UnregisteredDomain(String),

    #[error("domain '{0}' declares no actions")]
    NoActions(String),

    #[error("invalid schema for domain '{domain}': {reason}")]
    InvalidSchema { domain: String, reason: String },

    #[error(transparent)]
    EventType(#[from] EnvelopeError),
}

/// Publishes the events of one domain
#[derive(Clone)]
pub struct DomainProducer {
    publisher: EventPublisher,
    descriptor: DomainDescriptor,
    schema: Option<Arc<JSONSchema>>,
    event_types: BTreeMap<Action, EventType>,
}

impl DomainProducer {
    /// Build the facade; fails for domains missing from the topology
    pub fn new(
        publisher: EventPublisher,
        descriptor: DomainDescriptor,
    ) -> Result<Self, ProducerError> {
        if publisher.router().topology().domain(descriptor.name()).is_none() {
            return Err(ProducerError::UnregisteredDomain(descriptor.name().to_string()));
        }
        if descriptor.actions.is_empty() {
            return Err(ProducerError::NoActions(descriptor.name().to_string()));
        }

        let producer = publisher.codec().producer().to_string();
        let event_types = descriptor
            .actions()
            .map(|action| {
                EventType::new(&producer, descriptor.name(), action.as_str())
                    .map(|event_type| (action.clone(), event_type))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let schema = descriptor
            .schema()
            .map(|schema| {
                JSONSchema::compile(schema).map_err(|e| ProducerError::InvalidSchema {
                    domain: descriptor.name().to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?
            .map(Arc::new);

        Ok(Self {
            publisher,
            descriptor,
            schema,
            event_types,
        })
    }

    pub fn descriptor(&self) -> &DomainDescriptor {
        &self.descriptor
    }

    pub fn event_type(&self, action: &Action) -> Option<&EventType> {
        self.event_types.get(action)
    }

    /// Every event type of this domain and where it is routed
    pub fn routes(&self) -> Vec<(EventType, Route)> {
        self.event_types
            .values()
            .map(|event_type| (event_type.clone(), self.publisher.router().resolve(event_type)))
            .collect()
    }

    pub async fn send_created(
        &self,
        tenant_id: Uuid,
        payload: Map<String, Value>,
    ) -> Option<PublishReceipt> {
        let action = Action::Created;
        self.validate_snapshot(&action, tenant_id, &payload);
        self.dispatch(action, tenant_id, &CreatedData { tenant_id, payload }, BTreeMap::new())
            .await
    }

    pub async fn send_updated(
        &self,
        tenant_id: Uuid,
        changes: Map<String, Value>,
        payload: Map<String, Value>,
    ) -> Option<PublishReceipt> {
        let action = Action::Updated;
        self.validate_snapshot(&action, tenant_id, &payload);
        self.dispatch(
            action,
            tenant_id,
            &UpdatedData {
                tenant_id,
                changes,
                payload,
            },
            BTreeMap::new(),
        )
        .await
    }

    pub async fn send_deleted(
        &self,
        tenant_id: Uuid,
        deleted_dt: Option<DateTime<Utc>>,
    ) -> Option<PublishReceipt> {
        self.dispatch(
            Action::Deleted,
            tenant_id,
            &DeletedData {
                tenant_id,
                deleted_dt,
            },
            BTreeMap::new(),
        )
        .await
    }

    /// Publish a domain-specific action with extra message headers
    ///
    /// Only custom actions go through here; `created`, `updated` and
    /// `deleted` have typed send methods. `tenant_id` is set from the
    /// argument and may not appear in `fields`.
    pub async fn send_action(
        &self,
        action: &str,
        tenant_id: Uuid,
        fields: Map<String, Value>,
        headers: BTreeMap<String, String>,
    ) -> Option<PublishReceipt> {
        let action = Action::from(action);
        if !matches!(action, Action::Custom(_)) {
            self.fail_fast(
                &self.event_type_name(&action),
                tenant_id,
                PublishError::TypedAction {
                    domain: self.descriptor.name().to_string(),
                    action: action.to_string(),
                },
            );
        }
        if fields.contains_key(TENANT_ID_FIELD) {
            let event_type = self.event_type_name(&action);
            self.fail_fast(
                &event_type,
                tenant_id,
                PublishError::ReservedField {
                    event_type: event_type.clone(),
                    field: TENANT_ID_FIELD.to_string(),
                },
            );
        }

        self.dispatch(action, tenant_id, &CustomData { tenant_id, fields }, headers)
            .await
    }

    async fn dispatch<T: Serialize>(
        &self,
        action: Action,
        tenant_id: Uuid,
        data: &T,
        headers: BTreeMap<String, String>,
    ) -> Option<PublishReceipt> {
        let Some(event_type) = self.event_types.get(&action) else {
            self.fail_fast(
                &self.event_type_name(&action),
                tenant_id,
                PublishError::UndeclaredAction {
                    domain: self.descriptor.name().to_string(),
                    action: action.to_string(),
                },
            )
        };

        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                self.fail_fast(event_type.as_str(), tenant_id, PublishError::Envelope(e.into()))
            }
        };

        let mut request = PublishRequest::new(event_type.clone(), tenant_id, data)
            .with_schema_version(self.descriptor.schema_version());
        request.headers = headers;

        self.publisher.publish_best_effort(request).await
    }

    fn validate_snapshot(&self, action: &Action, tenant_id: Uuid, payload: &Map<String, Value>) {
        let Some(schema) = &self.schema else {
            return;
        };

        let instance = Value::Object(payload.clone());
        let reason = match schema.validate(&instance) {
            Ok(()) => return,
            Err(errors) => errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; "),
        };

        let event_type = self.event_type_name(action);
        self.fail_fast(
            &event_type,
            tenant_id,
            PublishError::Schema {
                event_type: event_type.clone(),
                reason,
            },
        );
    }

    /// `<producer>.<domain>.<action>` for an action that may not be declared
    fn event_type_name(&self, action: &Action) -> String {
        format!(
            "{}.{}.{}",
            self.publisher.codec().producer(),
            self.descriptor.name(),
            action
        )
    }

    fn fail_fast(&self, event_type: &str, tenant_id: Uuid, error: PublishError) -> ! {
        if let Ok(event_type) = EventType::parse(event_type) {
            self.publisher.record_failure(&event_type, tenant_id, &error);
        }
        panic!("domain event producer bug: {error}");
    }
}

impl fmt::Debug for DomainProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainProducer")
            .field("domain", &self.descriptor.name())
            .field("event_types", &self.event_types.values().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeCodec;
    use crate::memory_transport::InMemoryTransport;
    use crate::routing::Router;
    use crate::topology::TopologyRegistry;
    use crate::Transport;
    use serde_json::json;
    use std::time::Duration;

    async fn setup(domains: &[&str]) -> (EventPublisher, InMemoryTransport) {
        let mut topology = TopologyRegistry::new("crm").unwrap();
        for domain in domains {
            topology.register_domain(domain).unwrap();
        }
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

    fn snapshot(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn ticket_schema() -> Value {
        json!({
            "type": "object",
            "required": ["id", "subject"],
            "properties": {
                "id": {"type": "string"},
                "subject": {"type": "string"}
            }
        })
    }

    fn executions_descriptor() -> DomainDescriptor {
        DomainDescriptor::new("automation_action_execution")
            .with_action(Action::custom("status_changed"))
    }

    #[tokio::test]
    async fn test_send_created_shape() {
        let (publisher, transport) = setup(&["ticket"]).await;
        let tickets = publisher.producer(DomainDescriptor::crud("ticket")).unwrap();
        let tenant_id = Uuid::new_v4();

        let receipt = tickets
            .send_created(tenant_id, snapshot(json!({"id": "t1"})))
            .await
            .unwrap();

        assert_eq!(receipt.event_type.as_str(), "crm.ticket.created");
        let envelope = transport.queue_messages("crm.ticket")[0].envelope().unwrap();
        assert_eq!(
            envelope.data,
            json!({"tenant_id": tenant_id.to_string(), "payload": {"id": "t1"}})
        );
    }

    #[tokio::test]
    async fn test_send_updated_carries_changes_and_snapshot() {
        let (publisher, transport) = setup(&["contact"]).await;
        let contacts = publisher.producer(DomainDescriptor::crud("contact")).unwrap();
        let tenant_id = Uuid::new_v4();

        contacts
            .send_updated(
                tenant_id,
                snapshot(json!({"email": "new@example.com"})),
                snapshot(json!({"id": "c1", "email": "new@example.com"})),
            )
            .await
            .unwrap();

        let envelope = transport.queue_messages("crm.contact")[0].envelope().unwrap();
        assert_eq!(envelope.event_type.as_str(), "crm.contact.updated");
        assert_eq!(envelope.data["changes"], json!({"email": "new@example.com"}));
        assert_eq!(envelope.data["payload"]["id"], json!("c1"));
    }

    #[tokio::test]
    async fn test_send_deleted_writes_explicit_null() {
        let (publisher, transport) = setup(&["ticket"]).await;
        let tickets = publisher.producer(DomainDescriptor::crud("ticket")).unwrap();

        tickets.send_deleted(Uuid::new_v4(), None).await.unwrap();

        let message = &transport.queue_messages("crm.ticket")[0];
        let raw: Value = serde_json::from_slice(&message.payload).unwrap();
        let data = raw["data"].as_object().unwrap();
        assert!(data.contains_key("deleted_dt"));
        assert_eq!(data["deleted_dt"], Value::Null);
        assert_eq!(message.routing_key, "crm.ticket.deleted");
    }

    #[tokio::test]
    async fn test_send_deleted_with_timestamp() {
        let (publisher, transport) = setup(&["ticket"]).await;
        let tickets = publisher.producer(DomainDescriptor::crud("ticket")).unwrap();
        let deleted_dt = DateTime::parse_from_rfc3339("2024-05-01T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        tickets.send_deleted(Uuid::new_v4(), Some(deleted_dt)).await.unwrap();

        let envelope = transport.queue_messages("crm.ticket")[0].envelope().unwrap();
        let data: DeletedData = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(data.deleted_dt, Some(deleted_dt));
    }

    #[tokio::test]
    async fn test_custom_action_with_headers() {
        let (publisher, transport) = setup(&["automation_action_execution"]).await;
        let executions = publisher.producer(executions_descriptor()).unwrap();

        let mut headers = BTreeMap::new();
        headers.insert("execution_id".to_string(), "exec-1".to_string());

        executions
            .send_action(
                "status_changed",
                Uuid::new_v4(),
                snapshot(json!({"execution_id": "exec-1", "status": "succeeded"})),
                headers,
            )
            .await
            .unwrap();

        let message = &transport.queue_messages("crm.automation_action_execution")[0];
        assert_eq!(message.routing_key, "crm.automation_action_execution.status_changed");
        assert_eq!(message.headers["execution_id"], "exec-1");
        let envelope = message.envelope().unwrap();
        assert_eq!(envelope.data["status"], json!("succeeded"));
        assert!(envelope.data.get("tenant_id").is_some());
    }

    #[tokio::test]
    async fn test_outage_returns_none() {
        let (publisher, transport) = setup(&["ticket"]).await;
        let tickets = publisher.producer(DomainDescriptor::crud("ticket")).unwrap();
        transport.set_unavailable(true);

        let receipt = tickets.send_created(Uuid::new_v4(), snapshot(json!({"id": "t1"}))).await;

        assert!(receipt.is_none());
        assert_eq!(publisher.metrics().failures("crm.ticket.created", "transport"), 1);
    }

    #[tokio::test]
    async fn test_updated_outage_returns_none() {
        let (publisher, transport) = setup(&["contact"]).await;
        let contacts = publisher.producer(DomainDescriptor::crud("contact")).unwrap();
        transport.set_unavailable(true);

        let receipt = contacts
            .send_updated(
                Uuid::new_v4(),
                snapshot(json!({"email": "new@example.com"})),
                snapshot(json!({"id": "c1", "email": "new@example.com"})),
            )
            .await;

        assert!(receipt.is_none());
        assert_eq!(transport.queue_depth("crm.contact"), 0);
        assert_eq!(publisher.metrics().failures("crm.contact.updated", "transport"), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "has a typed send method")]
    async fn test_send_action_rejects_crud_actions() {
        let (publisher, _transport) = setup(&["ticket"]).await;
        let tickets = publisher
            .producer(DomainDescriptor::crud("ticket").with_schema(ticket_schema()))
            .unwrap();

        tickets
            .send_action(
                "created",
                Uuid::new_v4(),
                snapshot(json!({"garbage": 1})),
                BTreeMap::new(),
            )
            .await;
    }

    #[tokio::test]
    async fn test_crud_action_through_send_action_is_counted() {
        let (publisher, transport) = setup(&["ticket"]).await;
        let tickets = publisher.producer(DomainDescriptor::crud("ticket")).unwrap();

        let result = tokio::spawn(async move {
            tickets
                .send_action("deleted", Uuid::new_v4(), Map::new(), BTreeMap::new())
                .await
        })
        .await;

        assert!(result.unwrap_err().is_panic());
        assert_eq!(transport.queue_depth("crm.ticket"), 0);
        assert_eq!(publisher.metrics().failures("crm.ticket.deleted", "typed_action"), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "field 'tenant_id' is reserved")]
    async fn test_send_action_rejects_tenant_override() {
        let (publisher, _transport) = setup(&["automation_action_execution"]).await;
        let executions = publisher.producer(executions_descriptor()).unwrap();

        executions
            .send_action(
                "status_changed",
                Uuid::new_v4(),
                snapshot(json!({"tenant_id": Uuid::new_v4(), "status": "failed"})),
                BTreeMap::new(),
            )
            .await;
    }

    #[tokio::test]
    async fn test_custom_data_tenant_matches_envelope() {
        let (publisher, transport) = setup(&["automation_action_execution"]).await;
        let executions = publisher.producer(executions_descriptor()).unwrap();
        let tenant_id = Uuid::new_v4();

        executions
            .send_action(
                "status_changed",
                tenant_id,
                snapshot(json!({"status": "failed"})),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        let envelope = transport.queue_messages("crm.automation_action_execution")[0]
            .envelope()
            .unwrap();
        assert_eq!(envelope.tenant_id, tenant_id);
        assert_eq!(envelope.data["tenant_id"], json!(tenant_id));
    }

    #[tokio::test]
    #[should_panic(expected = "does not declare action 'updated'")]
    async fn test_undeclared_action_panics() {
        let (publisher, _transport) = setup(&["stage_history"]).await;
        let history = publisher
            .producer(DomainDescriptor::new("stage_history").with_action(Action::Created))
            .unwrap();

        history
            .send_updated(Uuid::new_v4(), Map::new(), Map::new())
            .await;
    }

    #[tokio::test]
    #[should_panic(expected = "violates its schema")]
    async fn test_schema_violation_panics() {
        let (publisher, _transport) = setup(&["ticket"]).await;
        let tickets = publisher
            .producer(DomainDescriptor::crud("ticket").with_schema(ticket_schema()))
            .unwrap();

        tickets.send_created(Uuid::new_v4(), snapshot(json!({"id": 7}))).await;
    }

    #[tokio::test]
    async fn test_schema_accepts_valid_snapshot() {
        let (publisher, transport) = setup(&["ticket"]).await;
        let tickets = publisher
            .producer(
                DomainDescriptor::crud("ticket")
                    .with_schema(ticket_schema())
                    .with_schema_version(2),
            )
            .unwrap();

        tickets
            .send_created(
                Uuid::new_v4(),
                snapshot(json!({"id": "t1", "subject": "Printer on fire"})),
            )
            .await
            .unwrap();

        let envelope = transport.queue_messages("crm.ticket")[0].envelope().unwrap();
        assert_eq!(envelope.schema_version, 2);
    }

    #[tokio::test]
    async fn test_unregistered_domain_is_rejected() {
        let (publisher, _transport) = setup(&["ticket"]).await;

        let result = publisher.producer(DomainDescriptor::crud("deal"));

        assert!(matches!(result, Err(ProducerError::UnregisteredDomain(d)) if d == "deal"));
    }

    #[tokio::test]
    async fn test_invalid_schema_is_rejected() {
        let (publisher, _transport) = setup(&["ticket"]).await;

        let descriptor = DomainDescriptor::crud("ticket").with_schema(json!({"type": 12}));

        let result = publisher.producer(descriptor);

        assert!(matches!(result, Err(ProducerError::InvalidSchema { .. })));
    }

    #[tokio::test]
    async fn test_route_table() {
        let (publisher, _transport) = setup(&["ticket_sla_state"]).await;
        let sla = publisher
            .producer(
                DomainDescriptor::crud("ticket_sla_state")
                    .without_action(Action::Created)
                    .without_action(Action::Deleted),
            )
            .unwrap();

        let routes = sla.routes();

        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].0.as_str(), "crm.ticket_sla_state.updated");
        assert_eq!(routes[0].1.queue, "crm.ticket_sla_state");
        assert!(sla.event_type(&Action::Created).is_none());
    }
}
