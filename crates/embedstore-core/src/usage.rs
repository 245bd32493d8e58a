//! External-call accounting.
//!
//! The engines report every embedding round trip to a [`UsageRecorder`].
//! Recording is fire-and-forget: the trait has no return value and
//! implementations swallow their own failures, so accounting can never fail
//! an upsert, search or refresh.

use std::sync::Mutex;

use crate::embedding::estimate_tokens;

/// One accounting event, e.g. `("openai", "input_tokens", 812)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub provider: String,
    pub metric: String,
    pub amount: i64,
    pub scope_id: Option<String>,
    pub endpoint: Option<String>,
    pub request_id: Option<String>,
}

/// Sink for [`UsageEvent`]s.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, event: UsageEvent);
}

/// Discards every event.
pub struct NoopUsage;

impl UsageRecorder for NoopUsage {
    fn record(&self, _event: UsageEvent) {}
}

/// Keeps events in memory; handy in tests and for short-lived tools.
#[derive(Default)]
pub struct MemoryUsage {
    events: Mutex<Vec<UsageEvent>>,
}

impl MemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl UsageRecorder for MemoryUsage {
    fn record(&self, event: UsageEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

/// Record `requests = 1` and the estimated `input_tokens` of one embedding call.
pub(crate) fn record_embedding_call(
    usage: &dyn UsageRecorder,
    provider: &str,
    endpoint: &str,
    scope_id: Option<&str>,
    texts: &[String],
) {
    let base = UsageEvent {
        provider: provider.to_string(),
        metric: "requests".to_string(),
        amount: 1,
        scope_id: scope_id.map(str::to_string),
        endpoint: Some(endpoint.to_string()),
        request_id: None,
    };
    usage.record(base.clone());
    usage.record(UsageEvent {
        metric: "input_tokens".to_string(),
        amount: estimate_tokens(texts),
        ..base
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_call_records_requests_and_tokens() {
        let usage = MemoryUsage::new();
        record_embedding_call(
            &usage,
            "openai",
            "embeddings.upsert",
            Some("123"),
            &["12345678".to_string()],
        );
        let events = usage.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].metric, "requests");
        assert_eq!(events[0].amount, 1);
        assert_eq!(events[1].metric, "input_tokens");
        assert_eq!(events[1].amount, 2);
        assert_eq!(events[1].scope_id.as_deref(), Some("123"));
    }
}
