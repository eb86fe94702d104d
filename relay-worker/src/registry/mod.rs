//! Webhook subscription registry.
//!
//! Records are stored as `Arc<WebhookSubscription>` and replaced wholesale on
//! every mutation (copy-on-write). Readers clone the `Arc` they find, so a
//! concurrent delete can never show them a half-written record. Mutations of
//! one id are serialized by the map's entry lock; different ids proceed in
//! parallel.

pub mod types;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::event::EventType;
use crate::storage::JsonlStore;

pub use types::{
    ListFilter, RegisterRequest, SubscriptionStatus, SubscriptionView, WebhookSecret,
    WebhookSubscription,
};
pub use validate::{validate_filter, validate_secret, validate_url};

/// Result of a registry mutation.
#[derive(Debug, Clone)]
pub struct Transition {
    pub subscription: Arc<WebhookSubscription>,
    /// False when the call was a no-op (e.g. enabling an active subscription).
    pub changed: bool,
}

/// Store of webhook subscriptions.
pub struct WebhookRegistry {
    subscriptions: DashMap<Uuid, Arc<WebhookSubscription>>,
    store: Option<JsonlStore<WebhookSubscription>>,
    allow_insecure_urls: bool,
}

impl WebhookRegistry {
    /// Create an empty in-memory registry.
    pub fn new(allow_insecure_urls: bool) -> Self {
        Self {
            subscriptions: DashMap::new(),
            store: None,
            allow_insecure_urls,
        }
    }

    /// Open a persisted registry. The newest record per id wins.
    pub fn open(path: impl AsRef<Path>, allow_insecure_urls: bool) -> RelayResult<Self> {
        let (store, records) = JsonlStore::<WebhookSubscription>::open(path)?;

        let subscriptions: DashMap<Uuid, Arc<WebhookSubscription>> = DashMap::new();
        for record in records {
            let newer = subscriptions
                .get(&record.id)
                .map_or(true, |current| record.version >= current.version);
            if newer {
                subscriptions.insert(record.id, Arc::new(record));
            }
        }

        info!(subscriptions = subscriptions.len(), "registry_loaded");

        Ok(Self {
            subscriptions,
            store: Some(store),
            allow_insecure_urls,
        })
    }

    fn persist(&self, record: &WebhookSubscription) -> RelayResult<()> {
        if let Some(store) = &self.store {
            store.append(record)?;
        }
        Ok(())
    }

    /// Register a new endpoint. A random secret is generated when none is given.
    pub fn register(&self, request: RegisterRequest) -> RelayResult<Arc<WebhookSubscription>> {
        let subscription = self.prepare(request)?;
        self.insert(subscription)
    }

    /// Validate a registration and build the subscription without storing it.
    pub fn prepare(&self, request: RegisterRequest) -> RelayResult<WebhookSubscription> {
        let url = validate_url(&request.url, self.allow_insecure_urls)?;
        let event_filter = validate_filter(&request.event_filter)?;
        let secret = match request.secret {
            Some(secret) => {
                validate_secret(&secret)?;
                WebhookSecret::new(secret.into_bytes())
            }
            None => WebhookSecret::generate(),
        };

        let now = Utc::now();
        Ok(WebhookSubscription {
            id: Uuid::new_v4(),
            url,
            secret,
            event_filter,
            status: SubscriptionStatus::Active,
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }

    /// Store a subscription built by [`Self::prepare`] and make it live.
    pub fn insert(&self, subscription: WebhookSubscription) -> RelayResult<Arc<WebhookSubscription>> {
        if self.subscriptions.contains_key(&subscription.id) {
            return Err(RelayError::Validation(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }

        self.persist(&subscription)?;
        let subscription = Arc::new(subscription);
        self.subscriptions
            .insert(subscription.id, Arc::clone(&subscription));

        info!(
            webhook_id = %subscription.id,
            url = %subscription.url,
            filter_size = subscription.event_filter.len(),
            "webhook_registered"
        );

        Ok(subscription)
    }

    /// Snapshot of one subscription, including tombstones.
    pub fn get(&self, id: Uuid) -> RelayResult<Arc<WebhookSubscription>> {
        self.subscriptions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RelayError::not_found("subscription", id))
    }

    pub fn enable(&self, id: Uuid) -> RelayResult<Transition> {
        self.set_status(id, SubscriptionStatus::Active)
    }

    pub fn disable(&self, id: Uuid) -> RelayResult<Transition> {
        self.set_status(id, SubscriptionStatus::Disabled)
    }

    /// Tombstone a subscription. Deleting a tombstone is a no-op.
    pub fn delete(&self, id: Uuid) -> RelayResult<Transition> {
        self.set_status(id, SubscriptionStatus::Deleted)
    }

    /// Status change on top of [`Self::update_if`]. A concurrent writer
    /// only costs a re-read.
    fn set_status(&self, id: Uuid, status: SubscriptionStatus) -> RelayResult<Transition> {
        loop {
            let current = self.get(id)?;
            if current.status == status {
                return Ok(Transition {
                    subscription: current,
                    changed: false,
                });
            }
            if current.status == SubscriptionStatus::Deleted {
                return Err(RelayError::Validation(format!(
                    "subscription {id} is deleted"
                )));
            }

            match self.update_if(id, current.version, |sub| Ok(sub.with_status(status))) {
                Ok(transition) => {
                    info!(
                        webhook_id = %id,
                        from = current.status.as_str(),
                        to = status.as_str(),
                        version = transition.subscription.version,
                        "webhook_status_changed"
                    );
                    return Ok(transition);
                }
                Err(RelayError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Compare-and-swap update: applies `update` only if the stored version
    /// still equals `expected_version`.
    pub fn update_if<F>(&self, id: Uuid, expected_version: u64, update: F) -> RelayResult<Transition>
    where
        F: FnOnce(&WebhookSubscription) -> RelayResult<WebhookSubscription>,
    {
        let mut entry = self
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| RelayError::not_found("subscription", id))?;

        let current = Arc::clone(entry.value());
        if current.version != expected_version {
            warn!(
                webhook_id = %id,
                expected_version,
                found_version = current.version,
                "webhook_version_conflict"
            );
            return Err(RelayError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }

        let mut next = update(&current)?;
        next.id = current.id;
        next.created_at = current.created_at;
        next.version = current.version + 1;
        next.updated_at = Utc::now();

        self.persist(&next)?;
        let next = Arc::new(next);
        *entry.value_mut() = Arc::clone(&next);

        Ok(Transition {
            subscription: next,
            changed: true,
        })
    }

    /// Subscriptions matching `filter`, oldest first.
    pub fn list(&self, filter: &ListFilter) -> Vec<Arc<WebhookSubscription>> {
        let mut items: Vec<Arc<WebhookSubscription>> = self
            .subscriptions
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Active subscriptions whose filter contains `event_type`.
    pub fn matching(&self, event_type: EventType) -> Vec<Arc<WebhookSubscription>> {
        let mut items: Vec<Arc<WebhookSubscription>> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().wants(event_type))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
