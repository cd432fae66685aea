// State machine module for batch lifecycle management
//
// Every transition is a single-field compare-and-set against the batch state store,
// so concurrent evaluators agree on exactly one winner per transition.

pub mod batch_state_machine;
pub mod events;
pub mod states;

// Re-export main types for convenient access
pub use batch_state_machine::BatchStateMachine;
pub use events::BatchEvent;
pub use states::BatchStatus;
