//! # Batch Events
//!
//! In-process lifecycle events ([`EventPublisher`]) and the downstream
//! "batch consolidated" notification ([`BatchNotifier`]).
//!
//! Notifications are at-least-once: a crash between consolidation and delivery
//! bookkeeping causes a re-send from the recovery sweep, so consumers deduplicate
//! by `batch_id` ([`ConsolidatedEventDeduplicator`]).

pub mod dedup;
pub mod notifier;
pub mod publisher;

pub use dedup::ConsolidatedEventDeduplicator;
pub use notifier::{BatchConsolidatedEvent, BatchNotifier, BroadcastNotifier, PgNotifyNotifier};
pub use publisher::{EventPublisher, PublishedEvent};
