//! # Database Operations
//!
//! PostgreSQL pool construction and schema management for the PostgreSQL store adapters.
//!
//! - [`connection`] - Pool construction from [`DatabaseConfig`](crate::config::DatabaseConfig) and health checks
//! - [`migrations`] - Embedded schema migrations applied under an advisory lock
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tasker_batch::config::DatabaseConfig;
//! use tasker_batch::database::{DatabaseConnection, DatabaseMigrations};
//!
//! # async fn example() -> tasker_batch::Result<()> {
//! let db = DatabaseConnection::connect(&DatabaseConfig::default()).await?;
//! DatabaseMigrations::run_all(db.pool()).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::{DatabaseMigrations, Migration};
