//! Correlation context for published events
//!
//! A request handler opens a [`scope`] carrying the inbound correlation id
//! and trace-context. Every event published inside the scope picks those up,
//! and each successful publish becomes the causation of the next one, so a
//! chain of events emitted by one request can be reconstructed downstream.

use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::future::Future;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: RefCell<EventContext>;
}

/// Causal metadata attached to an envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub traceparent: Option<String>,
    /// Domain timestamp of the change; defaults to publish time
    pub occurred_at: Option<DateTime<Utc>>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_traceparent(mut self, traceparent: impl Into<String>) -> Self {
        self.traceparent = Some(traceparent.into());
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Context for an event directly caused by `event_id`
    pub fn caused_by(&self, event_id: Uuid) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            causation_id: Some(event_id.to_string()),
            traceparent: self.traceparent.clone(),
            occurred_at: None,
        }
    }

    /// Fill unset fields from `ambient`; explicit values win
    pub fn merged_with(self, ambient: EventContext) -> Self {
        Self {
            correlation_id: self.correlation_id.or(ambient.correlation_id),
            causation_id: self.causation_id.or(ambient.causation_id),
            traceparent: self.traceparent.or(ambient.traceparent),
            occurred_at: self.occurred_at.or(ambient.occurred_at),
        }
    }
}

/// Run `fut` with `context` as the ambient correlation context
pub async fn scope<F: Future>(context: EventContext, fut: F) -> F::Output {
    CURRENT.scope(RefCell::new(context), fut).await
}

/// The ambient context, or an empty one outside any scope
pub fn current() -> EventContext {
    CURRENT
        .try_with(|ctx| ctx.borrow().clone())
        .unwrap_or_default()
}

/// Make `event_id` the causation of the next event published in this scope
pub(crate) fn record_published(event_id: Uuid) {
    let _ = CURRENT.try_with(|ctx| {
        ctx.borrow_mut().causation_id = Some(event_id.to_string());
    });
}
