//! # Orchestration
//!
//! Batch fan-out/fan-in coordination built on the store traits in [`crate::store`].
//!
//! ## Core Components
//!
//! - **BatchInitiator**: persists a new OPEN batch before any unit is dispatched
//! - **CompletionTracker**: applies completion reports and elects the single
//!   consolidation trigger
//! - **Consolidator**: merges staged outputs, verifies the effect, cleans up
//! - **NotificationService**: sends the consolidated notification and records delivery
//! - **RecoverySweep**: resumes abandoned consolidations and re-sends notifications
//! - **BatchCoordinator**: facade wiring all of the above over one set of stores

pub mod batch_initiator;
pub mod completion_tracker;
pub mod consolidator;
pub mod coordinator;
pub mod notification;
pub mod recovery;
pub mod types;

pub use batch_initiator::{BatchInitiator, WorkDispatcher};
pub use completion_tracker::{CompletionTracker, ConsolidationTrigger};
pub use consolidator::Consolidator;
pub use coordinator::{BatchCoordinator, ConsolidationPipeline, CoordinatorStores, PipelineTrigger};
pub use notification::NotificationService;
pub use recovery::RecoverySweep;
pub use types::{CompletionOutcome, ConsolidationResult, RecoveryReport};
