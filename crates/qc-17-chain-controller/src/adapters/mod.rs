//! Adapters for the outbound ports. They stand in for the execution
//! engine, authorization and resource subsystems, which live outside this
//! crate.

pub mod authorization;
pub mod execution;
pub mod resource_limits;

pub use authorization::PermissiveAuthorization;
pub use execution::{RecordingExecutionEngine, DEFAULT_BILLED_CPU_US, EXECUTED_TABLE, FAILING_ACTION};
pub use resource_limits::UnlimitedResources;

use crate::ports::ChainCollaborators;
use std::sync::Arc;

impl ChainCollaborators {
    /// Recording execution, permissive authorization, unlimited resources.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(RecordingExecutionEngine::new()),
            Arc::new(PermissiveAuthorization),
            Arc::new(UnlimitedResources::default()),
        )
    }
}
