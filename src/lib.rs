#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Batch
//!
//! Durable fan-out/fan-in coordination for batches of independent work units.
//!
//! ## Overview
//!
//! A batch is registered with the number of work units it expects. Workers stage their
//! outputs and report completion; the coordinator records each report with commutative
//! atomic store operations, elects exactly one caller to trigger consolidation, merges
//! every staged output into the canonical dataset with one verified upsert, and only then
//! cleans up staging and notifies downstream consumers.
//!
//! All mutable batch state lives in the batch state store. Coordinator processes are
//! stateless between calls and may be restarted at any time; the recovery sweep picks
//! up whatever a crashed process left behind.
//!
//! ## Batch Lifecycle
//!
//! ```text
//! OPEN --(all units reported, CAS)--> COMPLETE --(claim, CAS)--> CONSOLIDATING
//! CONSOLIDATING --(merge verified)--> CONSOLIDATED
//! CONSOLIDATING --(no staged data / verification failed)--> FAILED
//! ```
//!
//! ## Module Organization
//!
//! - [`orchestration`] - Initiator, completion tracker, consolidator, recovery sweep
//! - [`store`] - Store traits with in-memory and PostgreSQL adapters
//! - [`state_machine`] - Batch status and compare-and-set transitions
//! - [`models`] - Batch records, work units, staged rows
//! - [`events`] - Lifecycle events and downstream notifications
//! - [`resilience`] - Bounded retry policy
//! - [`database`] - Pool construction and schema migrations
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tasker_batch::config::ConfigManager;
//! use tasker_batch::models::WorkUnitSpec;
//! use tasker_batch::orchestration::BatchCoordinator;
//!
//! # async fn example() -> tasker_batch::Result<()> {
//! tasker_batch::logging::init_structured_logging();
//! let manager = ConfigManager::load()?;
//! let coordinator = BatchCoordinator::connect_postgres(manager.config()).await?;
//!
//! let units = vec![WorkUnitSpec::bare("u1"), WorkUnitSpec::bare("u2")];
//! let batch_id = coordinator.start_batch(&units).await?;
//!
//! // Workers stage their rows, then report
//! let complete = coordinator.report_completion(&batch_id, "u1", 5).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod resilience;
pub mod state_machine;
pub mod store;

pub use config::{ConfigManager, CoordinatorConfig};
pub use error::{BatchError, Result};
pub use models::{BatchRecord, BusinessKey, StagedRow, StagedUnit, WorkUnitSpec};
pub use orchestration::{BatchCoordinator, ConsolidationResult, CoordinatorStores};
pub use state_machine::{BatchEvent, BatchStatus};
