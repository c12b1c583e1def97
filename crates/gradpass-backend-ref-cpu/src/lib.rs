pub mod executor;
pub mod kernels;
pub mod tensor;

pub use executor::{StepExecutor, StepOutputs};
pub use kernels::indexed_slices::{
    indexed_slices_lazy_adam_update, indexed_slices_momentum_update, indexed_slices_sgd_update,
    IndexedSlicesReduceSum, ReduceSumOutput, ReduceSumWorkspace, UniqueRows,
};
pub use kernels::{KernelError, RowRange};
pub use tensor::{HostTensor, IndexedSlices, TensorData, Value};
