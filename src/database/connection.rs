use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{BatchError, Result};

pub struct DatabaseConnection {
    pool: PgPool,
}

impl DatabaseConnection {
    /// Build a pool from configuration; `DATABASE_URL` overrides the configured url
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.url.clone());

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&database_url)
            .await
            .map_err(BatchError::from_sqlx("connect"))?;

        let db = Self { pool };
        db.health_check().await?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database pool established"
        );

        Ok(db)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query so a misconfigured pool fails at startup
    pub async fn health_check(&self) -> Result<()> {
        let row = sqlx::query("SELECT 1 as health")
            .fetch_one(&self.pool)
            .await
            .map_err(BatchError::from_sqlx("health_check"))?;

        let health: i32 = row.get("health");
        if health != 1 {
            return Err(BatchError::persistence(
                "health_check",
                format!("unexpected health check result {health}"),
            ));
        }
        Ok(())
    }
}
