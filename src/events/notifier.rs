//! Downstream "batch consolidated" notification transports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, error, instrument};

use crate::constants::system;
use crate::error::{BatchError, Result};

/// Payload delivered to downstream consumers once a batch is merged and verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConsolidatedEvent {
    pub batch_id: String,
    pub status: String,
    pub rows_merged: u64,
    pub timestamp: DateTime<Utc>,
}

impl BatchConsolidatedEvent {
    pub fn new(batch_id: impl Into<String>, rows_merged: u64) -> Self {
        Self {
            batch_id: batch_id.into(),
            status: system::CONSOLIDATED_STATUS.to_string(),
            rows_merged,
            timestamp: Utc::now(),
        }
    }
}

/// Transport for consolidated-batch notifications.
///
/// Delivery may be repeated for the same batch; consumers deduplicate by `batch_id`.
#[async_trait]
pub trait BatchNotifier: Send + Sync {
    async fn notify_consolidated(&self, event: &BatchConsolidatedEvent) -> Result<()>;
}

/// In-process notifier backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<BatchConsolidatedEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchConsolidatedEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl BatchNotifier for BroadcastNotifier {
    async fn notify_consolidated(&self, event: &BatchConsolidatedEvent) -> Result<()> {
        // No subscribers means nobody is listening yet, not a delivery failure
        let receivers = self.sender.send(event.clone()).unwrap_or(0);
        debug!(batch_id = %event.batch_id, receivers, "Broadcast consolidated notification");
        Ok(())
    }
}

/// Notifier using PostgreSQL `pg_notify` on a configured channel
pub struct PgNotifyNotifier {
    pool: PgPool,
    channel: String,
}

impl std::fmt::Debug for PgNotifyNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotifyNotifier")
            .field("channel", &self.channel)
            .field("pool", &"PgPool")
            .finish()
    }
}

impl PgNotifyNotifier {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Result<Self> {
        let channel = channel.into();
        if channel.trim().is_empty() {
            return Err(BatchError::Configuration(
                "notification channel must not be empty".to_string(),
            ));
        }
        Ok(Self { pool, channel })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Serialize the event, enforcing the NOTIFY payload limit
    fn build_payload(event: &BatchConsolidatedEvent) -> Result<String> {
        let payload = serde_json::to_string(event)?;
        if payload.len() > system::MAX_NOTIFY_PAYLOAD_BYTES {
            return Err(BatchError::Notification(format!(
                "payload size {} exceeds limit {}",
                payload.len(),
                system::MAX_NOTIFY_PAYLOAD_BYTES
            )));
        }
        Ok(payload)
    }
}

#[async_trait]
impl BatchNotifier for PgNotifyNotifier {
    #[instrument(skip(self, event), fields(batch_id = %event.batch_id, channel = %self.channel))]
    async fn notify_consolidated(&self, event: &BatchConsolidatedEvent) -> Result<()> {
        let payload = Self::build_payload(event)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to send notification to channel {}: {}", self.channel, e);
                BatchError::Notification(e.to_string())
            })?;

        debug!("Sent consolidated notification");
        Ok(())
    }
}
