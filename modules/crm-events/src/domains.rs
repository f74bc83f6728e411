//! Event-emitting CRM domains
//!
//! Every domain the service layer announces changes for, with the actions it
//! emits and, for the core entities, the JSON Schema its snapshots follow.

use domain_events::{Action, DomainDescriptor};
use serde_json::Value;

pub const AUTOMATION_ACTION_EXECUTION: &str = "automation_action_execution";
pub const STATUS_CHANGED: &str = "status_changed";

/// Domains emitting created, updated and deleted
const CRUD: &[&str] = &[
    "activity",
    "automation_action",
    "company",
    "company_relationship",
    "contact",
    "contact_company_relationship",
    "csat_response",
    "csat_survey",
    "deal",
    "group_profile",
    "inbound_channel",
    "kb_article",
    "kb_category",
    "kb_section",
    "lead",
    "list",
    "pipeline",
    "pipeline_stage",
    "sla_policy",
    "sla_target",
    "support_macro",
    "support_view",
    "ticket",
    "ticket_ai_work_ref",
    "ticket_form",
    "ticket_form_field",
    "ticket_metrics",
    "ticket_status_duration",
    "ticket_task_mirror",
    "ticket_time_entry",
];

/// Links and immutable records: created and deleted, never updated
const CREATE_DELETE: &[&str] = &[
    "association",
    "kb_article_feedback",
    "kb_article_revision",
    "list_membership",
    "record_watcher",
    "ticket_attachment",
    "ticket_tag",
];

/// Append-only logs
const CREATE_ONLY: &[&str] = &[
    "stage_history",
    "ticket_assignment",
    "ticket_audit",
    "ticket_message",
];

/// Maintained by the SLA engine, created alongside the ticket
const UPDATE_ONLY: &[&str] = &["ticket_sla_state"];

/// Snapshot schemas by domain
const SCHEMAS: &[(&str, &str)] = &[
    ("ticket", include_str!("../schemas/crm.ticket.v1.json")),
    ("contact", include_str!("../schemas/crm.contact.v1.json")),
    ("company", include_str!("../schemas/crm.company.v1.json")),
    ("deal", include_str!("../schemas/crm.deal.v1.json")),
];

fn schema_for(domain: &str) -> Result<Option<Value>, serde_json::Error> {
    SCHEMAS
        .iter()
        .find(|(name, _)| *name == domain)
        .map(|(_, raw)| serde_json::from_str(raw))
        .transpose()
}

/// Every CRM domain descriptor
pub fn descriptors() -> Result<Vec<DomainDescriptor>, serde_json::Error> {
    let mut descriptors = Vec::new();

    for name in CRUD {
        descriptors.push(DomainDescriptor::crud(*name));
    }
    for name in CREATE_DELETE {
        descriptors.push(DomainDescriptor::crud(*name).without_action(Action::Updated));
    }
    for name in CREATE_ONLY {
        descriptors.push(DomainDescriptor::new(*name).with_action(Action::Created));
    }
    for name in UPDATE_ONLY {
        descriptors.push(DomainDescriptor::new(*name).with_action(Action::Updated));
    }
    descriptors.push(
        DomainDescriptor::new(AUTOMATION_ACTION_EXECUTION)
            .with_action(Action::custom(STATUS_CHANGED)),
    );

    descriptors
        .into_iter()
        .map(|descriptor| match schema_for(descriptor.name())? {
            Some(schema) => Ok(descriptor.with_schema(schema)),
            None => Ok(descriptor),
        })
        .collect()
}
