use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::notifier::BatchConsolidatedEvent;

/// Consumer-side filter that accepts the first notification per `batch_id`
#[derive(Debug, Default)]
pub struct ConsolidatedEventDeduplicator {
    seen: DashMap<String, DateTime<Utc>>,
}

impl ConsolidatedEventDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` the first time a batch is seen, `false` for every repeat
    pub fn accept(&self, event: &BatchConsolidatedEvent) -> bool {
        let mut first = false;
        self.seen.entry(event.batch_id.clone()).or_insert_with(|| {
            first = true;
            event.timestamp
        });
        first
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Forget batches first seen before `cutoff`, returning how many were dropped
    pub fn evict_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, first_seen| *first_seen >= cutoff);
        before - self.seen.len()
    }
}
