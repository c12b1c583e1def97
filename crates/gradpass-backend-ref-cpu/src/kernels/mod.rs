//! Host kernels used by the step executor.

pub mod indexed_slices;
pub mod math;
pub mod optimizer;

use gradpass::job::DType;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("{values} values cannot be split into {indices} equal rows")]
    ValuesNotMultipleOfIndices { indices: usize, values: usize },
    #[error("workspace holds {actual} slots but {required} are required")]
    WorkspaceTooSmall { required: usize, actual: usize },
    #[error("output buffer {buffer} holds {actual} elements but {required} are required")]
    OutputTooSmall {
        buffer: &'static str,
        required: usize,
        actual: usize,
    },
    #[error("index {index} is outside [0, {rows})")]
    IndexOutOfRange { index: i64, rows: usize },
    #[error("{op}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("expected a {expected:?} tensor")]
    DTypeMismatch { expected: DType },
    #[error("no host kernel for operator type {op_type:?}")]
    Unsupported { op_type: String },
}

/// Half-open row range `[lower, upper)` held by one shard of a parameter with `rows` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub lower: usize,
    pub upper: usize,
    pub rows: usize,
}

impl RowRange {
    pub fn new(lower: usize, upper: usize, rows: usize) -> Self {
        Self { lower, upper, rows }
    }

    /// The full parameter on one device.
    pub fn all(rows: usize) -> Self {
        Self::new(0, rows, rows)
    }

    pub fn len(&self) -> usize {
        self.upper.saturating_sub(self.lower)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Local row of global `row`, when this shard holds it.
    pub fn local(&self, row: usize) -> Option<usize> {
        (self.lower..self.upper).contains(&row).then(|| row - self.lower)
    }
}
