//! Domain layer: block state, stages, protocol features and the state rows
//! the controller owns.

pub mod activation_handlers;
pub mod block_stage;
pub mod block_state;
pub mod deadline;
pub mod protocol_features;
pub mod state_objects;
pub mod transaction_metadata;
pub mod whitelist;

pub use activation_handlers::{ActivationContext, ActivationHandler, ActivationHandlers};
pub use block_stage::{
    AssembledBlock, BlockReport, BlockStage, BlockStatus, BuildingBlock, CompletedBlock,
    PendingState, RestorePoint, TrxMerkle,
};
pub use block_state::{
    BlockHeaderState, BlockState, PendingBlockHeaderState, PendingSchedule,
    ADDITIONAL_BLOCK_SIGNATURES_EXTENSION,
};
pub use deadline::TransactionDeadline;
pub use protocol_features::{
    BuiltinFeatureDescriptor, BuiltinProtocolFeature, ProtocolFeature, ProtocolFeatureManager,
    ProtocolFeatureSet, RecognizedStatus, SubjectiveRestrictions,
};
pub use state_objects::*;
pub use transaction_metadata::{
    signing_digest, ActionTrace, TransactionMetadata, TransactionTrace, TrxType,
};
