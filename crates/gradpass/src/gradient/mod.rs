//! Model-diff pipeline: rewrites of parameter gradients between autograd and the optimizer.
//!
//! Stages run in a fixed order. Each one receives the current `variable -> diff` map and
//! returns a map with the same keys whose values point at the rewritten gradients.

mod clip;
mod parallel_cast;
mod regularize;
mod scale;

use anyhow::{anyhow, bail, Context, Result};

use crate::autograd::GradientMap;
use crate::graph::{JobBuilder, OpGraph};
use crate::job::op_conf::VariableOpConf;
use crate::job::{LogicalBlobId, ParallelConf};
use crate::train::TrainConf;

pub use clip::ClipStage;
pub use parallel_cast::ParallelCastStage;
pub use regularize::RegularizeStage;
pub use scale::{LossInstanceNumStage, LossScaleStage};

/// One rewriting stage of the model-diff pipeline.
pub trait ModelDiffStage {
    fn name(&self) -> &'static str;
    fn apply(
        &self,
        op_graph: &OpGraph,
        builder: &mut JobBuilder<'_>,
        model_diffs: GradientMap,
    ) -> Result<GradientMap>;
}

pub struct GradientPipelineBuilder {
    stages: Vec<Box<dyn ModelDiffStage>>,
}

impl GradientPipelineBuilder {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn stage(&mut self, stage: impl ModelDiffStage + 'static) {
        self.stages.push(Box::new(stage));
    }

    pub fn finish(self) -> GradientPipeline {
        GradientPipeline {
            stages: self.stages,
            log_stats: crate::env::pass_stats_enabled(),
        }
    }
}

impl Default for GradientPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GradientPipeline {
    stages: Vec<Box<dyn ModelDiffStage>>,
    log_stats: bool,
}

impl GradientPipeline {
    /// Parallel cast, instance-count scaling, loss-scale scaling, regularization, then
    /// clipping when a clip policy is configured.
    pub fn for_train_conf(train_conf: &TrainConf) -> Self {
        let mut builder = GradientPipelineBuilder::new();
        builder.stage(ParallelCastStage);
        builder.stage(LossInstanceNumStage::new(train_conf.loss_lbn.clone()));
        builder.stage(LossScaleStage::new(train_conf.loss_scale_factor));
        builder.stage(RegularizeStage::new(train_conf.default_regularizer));
        if let Some(clip_conf) = train_conf.model_update_conf.clip_conf {
            builder.stage(ClipStage::new(clip_conf));
        }
        builder.finish()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn run(
        &self,
        op_graph: &OpGraph,
        builder: &mut JobBuilder<'_>,
        mut model_diffs: GradientMap,
    ) -> Result<GradientMap> {
        for stage in &self.stages {
            let op_count = builder.job().net.len();
            let next = stage
                .apply(op_graph, builder, model_diffs.clone())
                .with_context(|| format!("model diff stage {} failed", stage.name()))?;
            if !next.keys().eq(model_diffs.keys()) {
                bail!(
                    "model diff stage {} changed the set of parameters ({} -> {})",
                    stage.name(),
                    model_diffs.len(),
                    next.len()
                );
            }
            let added = builder.job().net.len() - op_count;
            if self.log_stats {
                log::info!("model diff stage {}: added {added} ops", stage.name());
            } else {
                log::debug!("model diff stage {}: added {added} ops", stage.name());
            }
            model_diffs = next;
        }
        Ok(model_diffs)
    }
}

/// Variable conf and placement behind a parameter tensor.
fn variable4model(
    builder: &JobBuilder<'_>,
    model: &LogicalBlobId,
) -> Result<(VariableOpConf, ParallelConf)> {
    let variable = builder
        .op_conf(&model.op_name)
        .and_then(|op| op.as_variable())
        .ok_or_else(|| anyhow!("{model} is not produced by a variable"))?
        .clone();
    let parallel_conf = builder.parallel_conf4op_name(&model.op_name).clone();
    Ok((variable, parallel_conf))
}

/// Placement for operators shared by all parameters.
fn shared_parallel_conf(builder: &JobBuilder<'_>) -> ParallelConf {
    builder.job().placement.default_parallel_conf.clone()
}
