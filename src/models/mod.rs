pub mod batch_record;
pub mod staged_unit;
pub mod work_unit;

// Re-export core models for easy access
pub use batch_record::{BatchRecord, TransitionDetails};
pub use staged_unit::{BusinessKey, StagedRow, StagedUnit};
pub use work_unit::WorkUnitSpec;
