use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxEventId(pub String);

/// A durable domain event awaiting at-least-once processing.
///
/// `processed_at` is set at most once and is the sole marker preventing
/// an event from being leased again. Events are created by an external
/// publisher and mutated only by the outbox runner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub event_type: String,
    pub payload_json: String,
    pub dedup_key: String,
    pub error_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(
        id: OutboxEventId,
        event_type: impl Into<String>,
        payload_json: impl Into<String>,
        dedup_key: impl Into<String>,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            payload_json: payload_json.into(),
            dedup_key: dedup_key.into(),
            error_count: 0,
            next_retry_at: None,
            last_error: None,
            processed_at: None,
            created_at: Utc::now(),
        }
    }

    /// An event is leasable when it has never been processed and its
    /// retry window (if any) has elapsed.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        self.processed_at.is_none()
            && self.next_retry_at.map_or(true, |retry_at| retry_at <= now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{OutboxEvent, OutboxEventId};

    #[test]
    fn fresh_event_is_leasable() {
        let event =
            OutboxEvent::new(OutboxEventId("evt-1".to_string()), "manual", "{}", "key-1");
        assert!(event.is_leasable(Utc::now()));
    }

    #[test]
    fn processed_event_is_never_leasable() {
        let mut event =
            OutboxEvent::new(OutboxEventId("evt-2".to_string()), "manual", "{}", "key-2");
        event.processed_at = Some(Utc::now());
        assert!(!event.is_leasable(Utc::now() + Duration::days(1)));
    }

    #[test]
    fn retry_window_delays_leasing() {
        let now = Utc::now();
        let mut event =
            OutboxEvent::new(OutboxEventId("evt-3".to_string()), "manual", "{}", "key-3");
        event.next_retry_at = Some(now + Duration::minutes(5));
        assert!(!event.is_leasable(now));
        assert!(event.is_leasable(now + Duration::minutes(5)));
    }
}
