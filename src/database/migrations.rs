//! # Database Migration System
//!
//! Schema migrations are compiled into the crate and applied in version order.
//! Concurrent coordinator processes starting together serialise on a PostgreSQL
//! advisory lock held on one dedicated connection:
//!
//! ```sql
//! SELECT pg_advisory_lock(7361024118550001);
//! -- apply outstanding migrations, recording each in tasker_batch_schema_migrations
//! SELECT pg_advisory_unlock(7361024118550001);
//! ```
//!
//! Migration versions use the `YYYYMMDDHHMMSS_description.sql` naming convention
//! of the files under `migrations/`.

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::constants::{system::MIGRATION_LOCK_KEY, tables::SCHEMA_MIGRATIONS};
use crate::error::{BatchError, Result};

/// A single embedded migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Version timestamp (YYYYMMDDHHMMSS format)
    pub version: &'static str,
    /// Human-readable migration name
    pub name: &'static str,
    pub sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: "20261001000000",
    name: "create batch coordination tables",
    sql: include_str!("../../migrations/20261001000000_create_batch_coordination_tables.sql"),
}];

/// Manages database schema migrations with concurrency safety.
pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Embedded migrations in application order
    pub fn all() -> &'static [Migration] {
        MIGRATIONS
    }

    /// Apply every outstanding migration, returning the versions applied by this call
    pub async fn run_all(pool: &PgPool) -> Result<Vec<&'static str>> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(BatchError::from_sqlx("migration_acquire"))?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .map_err(BatchError::from_sqlx("migration_lock"))?;

        let result = Self::run_outstanding(&mut conn).await;

        // Release on the same session that took the lock, whatever the outcome
        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
        {
            warn!(error = %e, "Failed to release migration advisory lock");
        }

        result
    }

    async fn run_outstanding(conn: &mut PoolConnection<Postgres>) -> Result<Vec<&'static str>> {
        Self::ensure_migration_table(conn).await?;
        let applied = Self::applied_versions(conn).await?;

        let mut newly_applied = Vec::new();
        for migration in Self::all() {
            if applied.contains(migration.version) {
                continue;
            }
            info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            sqlx::raw_sql(migration.sql)
                .execute(&mut **conn)
                .await
                .map_err(BatchError::from_sqlx("apply_migration"))?;

            sqlx::query(&format!(
                "INSERT INTO {SCHEMA_MIGRATIONS} (version) VALUES ($1) ON CONFLICT DO NOTHING"
            ))
            .bind(migration.version)
            .execute(&mut **conn)
            .await
            .map_err(BatchError::from_sqlx("record_migration"))?;

            newly_applied.push(migration.version);
        }

        Ok(newly_applied)
    }

    async fn ensure_migration_table(conn: &mut PoolConnection<Postgres>) -> Result<()> {
        sqlx::raw_sql(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {SCHEMA_MIGRATIONS} (
                version VARCHAR(14) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ))
        .execute(&mut **conn)
        .await
        .map_err(BatchError::from_sqlx("ensure_migration_table"))?;

        Ok(())
    }

    async fn applied_versions(conn: &mut PoolConnection<Postgres>) -> Result<HashSet<String>> {
        let rows = sqlx::query(&format!("SELECT version FROM {SCHEMA_MIGRATIONS}"))
            .fetch_all(&mut **conn)
            .await
            .map_err(BatchError::from_sqlx("applied_migrations"))?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("version"))
            .collect())
    }
}
