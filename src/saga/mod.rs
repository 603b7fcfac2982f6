//! # Saga Orchestration
//!
//! Multi-step distributed workflows over the messaging core: commands out,
//! events back, compensation on failure, every transition persisted.

pub mod coordinator;
pub mod definition;
pub mod states;
pub mod store;

pub use coordinator::{SagaCoordinator, COMPENSATION_REASON};
pub use definition::{SagaDefinition, SagaStep};
pub use states::{SagaState, StepStatus, StepType};
pub use store::{PgSagaStore, SagaStore};
