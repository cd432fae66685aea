//! # System Constants
//!
//! Table names, channel names, and event names shared by the batch coordinator
//! components and the PostgreSQL adapters.

/// Batch lifecycle events published through the in-process event publisher
pub mod events {
    pub const BATCH_STARTED: &str = "batch.started";
    pub const BATCH_UNIT_COMPLETED: &str = "batch.unit_completed";
    pub const BATCH_COMPLETED: &str = "batch.completed";
    pub const BATCH_CONSOLIDATION_STARTED: &str = "batch.consolidation_started";
    pub const BATCH_CONSOLIDATED: &str = "batch.consolidated";
    pub const BATCH_FAILED: &str = "batch.failed";
}

/// Table names used by the PostgreSQL store adapters
pub mod tables {
    pub const BATCHES: &str = "tasker_batches";
    pub const STAGED_UNITS: &str = "tasker_batch_staged_units";
    pub const CANONICAL_RECORDS: &str = "tasker_canonical_records";
    pub const SCHEMA_MIGRATIONS: &str = "tasker_batch_schema_migrations";
}

pub mod system {
    /// Default PostgreSQL NOTIFY channel for consolidated-batch notifications
    pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "tasker_batch_consolidated";

    /// Notification payload status value
    pub const CONSOLIDATED_STATUS: &str = "consolidated";

    /// pg_notify payload limit is 8000 bytes; keep headroom
    pub const MAX_NOTIFY_PAYLOAD_BYTES: usize = 7800;

    /// Advisory lock key guarding schema migrations
    pub const MIGRATION_LOCK_KEY: i64 = 7_361_024_118_550_001;

    /// Business key columns used when none are configured
    pub const DEFAULT_KEY_COLUMNS: [&str; 2] = ["item_date", "item_key"];
}
