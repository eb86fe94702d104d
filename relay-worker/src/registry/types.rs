//! Subscription records.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::event::EventType;

/// Prefix of generated secrets.
pub const GENERATED_SECRET_PREFIX: &str = "whsec_";

/// Shared signing secret of a subscription.
///
/// Opaque bytes. `Debug` is redacted and the value only leaves the process
/// hex-encoded inside the subscription store.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(Vec<u8>);

impl WebhookSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Generate `whsec_` followed by 32 random bytes in hex.
    pub fn generate() -> Self {
        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        Self(format!("{GENERATED_SECRET_PREFIX}{}", hex::encode(raw)).into_bytes())
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Secret as text, for handing back once at registration.
    pub fn reveal(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WebhookSecret(<{} bytes redacted>)", self.0.len())
    }
}

impl Serialize for WebhookSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for WebhookSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded)
            .map(WebhookSecret)
            .map_err(serde::de::Error::custom)
    }
}

/// Lifecycle of a subscription. `Deleted` is a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Disabled,
    Deleted,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Disabled => "disabled",
            SubscriptionStatus::Deleted => "deleted",
        }
    }
}

/// A registered endpoint. Records are immutable; every mutation produces a
/// new record with `version + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    pub secret: WebhookSecret,
    pub event_filter: BTreeSet<EventType>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl WebhookSubscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Whether an event of this type should be delivered here.
    pub fn wants(&self, event_type: EventType) -> bool {
        self.is_active() && self.event_filter.contains(&event_type)
    }

    /// Copy of this record with a new status and bumped version.
    pub(crate) fn with_status(&self, status: SubscriptionStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// Bytes describing the subscription for audit digests. Excludes the
    /// secret.
    pub(crate) fn audit_parts(&self) -> Vec<Vec<u8>> {
        let filter: Vec<&str> = self.event_filter.iter().map(|t| t.as_str()).collect();
        vec![
            self.id.as_bytes().to_vec(),
            self.url.as_bytes().to_vec(),
            filter.join(",").into_bytes(),
            self.status.as_str().as_bytes().to_vec(),
            self.version.to_be_bytes().to_vec(),
        ]
    }
}

/// Subscription without its secret, safe to list and log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub id: Uuid,
    pub url: String,
    pub event_filter: BTreeSet<EventType>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl From<&WebhookSubscription> for SubscriptionView {
    fn from(sub: &WebhookSubscription) -> Self {
        Self {
            id: sub.id,
            url: sub.url.clone(),
            event_filter: sub.event_filter.clone(),
            status: sub.status,
            created_at: sub.created_at,
            updated_at: sub.updated_at,
            version: sub.version,
        }
    }
}

/// Filter for `list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    pub status: Option<SubscriptionStatus>,
    pub event_type: Option<EventType>,
}

impl ListFilter {
    pub fn matches(&self, sub: &WebhookSubscription) -> bool {
        self.status.map_or(true, |s| sub.status == s)
            && self
                .event_type
                .map_or(true, |t| sub.event_filter.contains(&t))
    }
}

/// Input to `register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub url: String,
    pub event_filter: Vec<EventType>,
    /// Generated when omitted.
    #[serde(default)]
    pub secret: Option<String>,
}
