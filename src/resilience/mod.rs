//! # Resilience Module
//!
//! Bounded retry for transient store and notification failures.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_batch::config::BackoffConfig;
//! use tasker_batch::resilience::RetryPolicy;
//!
//! # async fn example() -> tasker_batch::Result<()> {
//! let policy = RetryPolicy::from_config(&BackoffConfig::default());
//!
//! let value = policy
//!     .run("fetch_batch", || async {
//!         // Store operation here
//!         Ok::<_, tasker_batch::BatchError>(42)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod retry;

pub use retry::RetryPolicy;
