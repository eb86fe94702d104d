//! Event fan-out.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::RelayResult;
use crate::event::Event;
use crate::ledger::{AttemptKind, DeliveryAttempt, DeliveryLedger};
use crate::registry::WebhookRegistry;
use crate::scheduler::RetryScheduler;

/// Entry point for collaborators emitting events.
pub struct Dispatcher {
    registry: Arc<WebhookRegistry>,
    ledger: Arc<DeliveryLedger>,
    scheduler: Arc<RetryScheduler>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WebhookRegistry>,
        ledger: Arc<DeliveryLedger>,
        scheduler: Arc<RetryScheduler>,
    ) -> Self {
        Self {
            registry,
            ledger,
            scheduler,
        }
    }

    /// Create a first attempt for every active subscription whose filter
    /// contains the event's type and queue it for immediate delivery.
    ///
    /// Never touches the network. Only a store failure is returned as an
    /// error; events with the same id are not deduplicated.
    pub fn emit(&self, event: Event) -> RelayResult<Vec<DeliveryAttempt>> {
        let targets = self.registry.matching(event.event_type);
        if targets.is_empty() {
            debug!(event_id = %event.id, event_type = %event.event_type, "event_no_subscribers");
            return Ok(Vec::new());
        }

        let event = Arc::new(event);
        let now = Utc::now();
        let mut attempts = Vec::with_capacity(targets.len());

        for subscription in &targets {
            let attempt = self.ledger.open_chain(
                Arc::clone(&event),
                subscription.id,
                AttemptKind::Standard,
                now,
            )?;
            self.scheduler
                .schedule(attempt.id, attempt.attempt_number, attempt.not_before);
            attempts.push(attempt);
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            subscribers = attempts.len(),
            "event_dispatched"
        );
        Ok(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::ledger::AttemptStatus;
    use crate::registry::RegisterRequest;

    fn setup() -> (Dispatcher, Arc<WebhookRegistry>, Arc<DeliveryLedger>, Arc<RetryScheduler>) {
        let registry = Arc::new(WebhookRegistry::new(false));
        let ledger = Arc::new(DeliveryLedger::new(3));
        let scheduler = Arc::new(RetryScheduler::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&ledger),
            Arc::clone(&scheduler),
        );
        (dispatcher, registry, ledger, scheduler)
    }

    fn register(registry: &WebhookRegistry, filter: Vec<EventType>) -> uuid::Uuid {
        registry
            .register(RegisterRequest {
                url: "https://ex.com/hook".to_string(),
                event_filter: filter,
                secret: None,
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_only_matching_active_subscriptions_get_attempts() {
        let (dispatcher, registry, ledger, scheduler) = setup();
        let wanted = register(&registry, vec![EventType::WorkflowCompleted]);
        let other = register(&registry, vec![EventType::EmailSent]);
        let disabled = register(&registry, vec![EventType::WorkflowCompleted]);
        registry.disable(disabled).unwrap();

        let event = Event::new(EventType::WorkflowCompleted, serde_json::json!({}), "tests")
            .with_id("E1");
        let attempts = dispatcher.emit(event).unwrap();

        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].webhook_id, wanted);
        assert_eq!(attempts[0].attempt_number, 1);
        assert_eq!(attempts[0].status, AttemptStatus::Pending);
        assert!(ledger.history(other).is_empty());
        assert!(ledger.history(disabled).is_empty());
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_reemitted_ids_are_delivered_again() {
        let (dispatcher, registry, ledger, _) = setup();
        let id = register(&registry, vec![EventType::EmailSent]);

        for _ in 0..2 {
            let event = Event::new(EventType::EmailSent, serde_json::json!({}), "tests").with_id("E7");
            dispatcher.emit(event).unwrap();
        }

        let history = ledger.history(id);
        assert_eq!(history.len(), 2);
        assert_ne!(history[0].chain_id, history[1].chain_id);
    }

    #[test]
    fn test_no_subscribers_is_not_an_error() {
        let (dispatcher, _, _, scheduler) = setup();
        let event = Event::new(EventType::SystemError, serde_json::json!({}), "tests");
        assert!(dispatcher.emit(event).unwrap().is_empty());
        assert!(scheduler.is_empty());
    }
}
