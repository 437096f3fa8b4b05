pub mod delete_state;
pub mod read_state;
pub mod state_lock;
pub mod write_state;

pub use delete_state::{
    DeleteStateOperation, DeleteStateOperationRequest, DeleteStateOperationResult,
};
pub use read_state::{
    ReadStateOperation, ReadStateOperationOutcome, ReadStateOperationRequest,
    ReadStateOperationResult,
};
pub use state_lock::{
    StateLockOperation, StateLockOperationRequest, StateLockOperationResult,
    StateUnlockOperationRequest,
};
pub use write_state::{WriteStateOperation, WriteStateOperationRequest, WriteStateOperationResult};
