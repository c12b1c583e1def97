pub use linkme;

pub mod autograd;
pub mod dump;
mod env;
pub mod gradient;
pub mod graph;
pub mod job;
pub mod optimizer;
pub mod passes;
pub mod sbp_hint;
pub mod train;

pub use job::{Job, LogicalBlobId, OpBlobArg, OperatorConf, SbpParallel};
pub use passes::{complete_job, JobPass, JobPassPipeline, PassResult};
