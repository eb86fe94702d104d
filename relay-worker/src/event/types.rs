//! Event taxonomy and the immutable event record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;

/// Fixed set of event types collaborators may emit.
///
/// `SystemTest` is reserved for `test(id)` deliveries and cannot be
/// subscribed to through a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    EmailSent,
    EmailReplied,
    EmailBounced,
    TicketCreated,
    TicketResolved,
    CampaignStarted,
    CampaignCompleted,
    PlatformAction,
    SystemError,
    SystemRateLimit,
    SystemTest,
}

impl EventType {
    /// Every type a subscription filter may name.
    pub const SUBSCRIBABLE: [EventType; 13] = [
        EventType::WorkflowStarted,
        EventType::WorkflowCompleted,
        EventType::WorkflowFailed,
        EventType::EmailSent,
        EventType::EmailReplied,
        EventType::EmailBounced,
        EventType::TicketCreated,
        EventType::TicketResolved,
        EventType::CampaignStarted,
        EventType::CampaignCompleted,
        EventType::PlatformAction,
        EventType::SystemError,
        EventType::SystemRateLimit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "workflow.started",
            EventType::WorkflowCompleted => "workflow.completed",
            EventType::WorkflowFailed => "workflow.failed",
            EventType::EmailSent => "email.sent",
            EventType::EmailReplied => "email.replied",
            EventType::EmailBounced => "email.bounced",
            EventType::TicketCreated => "ticket.created",
            EventType::TicketResolved => "ticket.resolved",
            EventType::CampaignStarted => "campaign.started",
            EventType::CampaignCompleted => "campaign.completed",
            EventType::PlatformAction => "platform.action",
            EventType::SystemError => "system.error",
            EventType::SystemRateLimit => "system.rate_limit",
            EventType::SystemTest => "system.test",
        }
    }

    pub fn is_subscribable(&self) -> bool {
        !matches!(self, EventType::SystemTest)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == EventType::SystemTest.as_str() {
            return Ok(EventType::SystemTest);
        }
        EventType::SUBSCRIBABLE
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RelayError::Validation(format!("unknown event type '{s}'")))
    }
}

impl TryFrom<String> for EventType {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventType> for &'static str {
    fn from(value: EventType) -> Self {
        value.as_str()
    }
}

/// An immutable fact emitted by a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Receivers key their idempotency on this id; re-emitting an id is
    /// delivered again.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Name of the emitting collaborator
    pub source: String,
}

impl Event {
    /// Create an event with a fresh id and the current time.
    pub fn new(event_type: EventType, payload: serde_json::Value, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            payload,
            source: source.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
