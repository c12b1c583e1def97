//! Whole-job rewrite passes and the pipeline that gates and records them.

mod generate_backward_and_optimizer;

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::dump;
use crate::job::Job;

pub use generate_backward_and_optimizer::GenerateBackwardAndOptimizerOpConfs;

/// Result returned by a [`JobPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the job.
    pub changed: bool,
    /// Operators appended by the pass.
    pub ops_added: usize,
    /// Passes skipped by their gate or because they already ran.
    pub skipped: usize,
}

impl PassResult {
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            ops_added: self.ops_added + other.ops_added,
            skipped: self.skipped + other.skipped,
        }
    }
}

/// A rewrite over a complete job.
pub trait JobPass {
    fn name(&self) -> &'static str;
    /// Whether the pass applies to `job` at all.
    fn is_enabled(&self, job: &Job) -> bool;
    fn apply(&self, job: &mut Job) -> Result<PassResult>;
}

/// Ordered job passes. Each pass runs at most once per job: completed pass names are
/// recorded in the job helper and consulted on later runs.
pub struct JobPassPipeline {
    passes: Vec<Box<dyn JobPass>>,
    dump_dir: Option<PathBuf>,
    log_stats: bool,
}

impl JobPassPipeline {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            dump_dir: crate::env::dump_dir(),
            log_stats: crate::env::pass_stats_enabled(),
        }
    }

    /// The training rewrite: backward, model-diff pipeline, optimizer, SBP hints.
    pub fn training() -> Self {
        let mut pipeline = Self::new();
        pipeline.pass(GenerateBackwardAndOptimizerOpConfs);
        pipeline
    }

    pub fn pass(&mut self, pass: impl JobPass + 'static) {
        self.passes.push(Box::new(pass));
    }

    pub fn with_dump_dir(mut self, dump_dir: Option<PathBuf>) -> Self {
        self.dump_dir = dump_dir;
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    pub fn run(&self, job: &mut Job) -> Result<PassResult> {
        let mut total = PassResult::default();
        for pass in &self.passes {
            let name = pass.name();
            if job.helper.completed_passes.contains(name) {
                log::info!("{name}: already applied to job {}", job.job_conf.job_name);
                total.skipped += 1;
                continue;
            }
            if !pass.is_enabled(job) {
                log::debug!("{name}: disabled for job {}", job.job_conf.job_name);
                total.skipped += 1;
                continue;
            }

            let snapshot = format!("{}-{name}", job.job_conf.job_name);
            dump::write_job_snapshot(self.dump_dir.as_deref(), &format!("{snapshot}-before"), job);
            let result = pass
                .apply(job)
                .with_context(|| format!("pass {name} failed on job {}", job.job_conf.job_name))?;
            job.helper.completed_passes.insert(name.to_string());
            dump::write_job_snapshot(self.dump_dir.as_deref(), &format!("{snapshot}-after"), job);

            if self.log_stats {
                log::info!(
                    "{name}: changed={} ops_added={}",
                    result.changed,
                    result.ops_added
                );
            }
            total = total.merge(result);
        }
        Ok(total)
    }
}

impl Default for JobPassPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the training pipeline over `job` in place.
pub fn complete_job(job: &mut Job) -> Result<PassResult> {
    JobPassPipeline::training().run(job)
}
