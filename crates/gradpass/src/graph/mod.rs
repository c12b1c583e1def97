//! Forward graph view and the mutable job editor used by passes.

mod job_builder;
mod op_graph;

use thiserror::Error;

use crate::job::{LogicalBlobId, OpBlobArg};

pub use job_builder::JobBuilder;
pub use op_graph::{NodeId, OpGraph, OpNode};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("operator name {op_name:?} is defined more than once")]
    DuplicateOpName { op_name: String },
    #[error("input {oba} references {lbi}, which no operator produces")]
    DanglingInput { oba: OpBlobArg, lbi: LogicalBlobId },
    #[error("operator graph contains a cycle through {op_name:?}")]
    Cycle { op_name: String },
}
