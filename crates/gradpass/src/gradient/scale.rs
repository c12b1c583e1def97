use anyhow::Result;

use crate::autograd::GradientMap;
use crate::gradient::{shared_parallel_conf, variable4model, ModelDiffStage};
use crate::graph::{JobBuilder, OpGraph};
use crate::job::op_conf::{ScalarByTensorOpConf, ScalarOpConf, TotalLossInstanceNumOpConf};
use crate::job::{LogicalBlobId, OpConf};

/// Divides every gradient by the number of loss instances of the step.
pub struct LossInstanceNumStage {
    losses: Vec<LogicalBlobId>,
}

impl LossInstanceNumStage {
    pub fn new(losses: Vec<LogicalBlobId>) -> Self {
        Self { losses }
    }
}

impl ModelDiffStage for LossInstanceNumStage {
    fn name(&self) -> &'static str {
        "scale_model_diff_by_loss_instance_num"
    }

    fn apply(
        &self,
        _op_graph: &OpGraph,
        builder: &mut JobBuilder<'_>,
        mut model_diffs: GradientMap,
    ) -> Result<GradientMap> {
        if model_diffs.is_empty() {
            return Ok(model_diffs);
        }
        let shared = shared_parallel_conf(builder);
        let name = builder.fresh_op_name("System-Train-TotalLossInstanceNum");
        let total = builder.add_op(
            &shared,
            name,
            OpConf::TotalLossInstanceNum(TotalLossInstanceNumOpConf {
                losses: self.losses.clone(),
            }),
        )?;
        for (model, diff) in model_diffs.iter_mut() {
            let (_, parallel_conf) = variable4model(builder, model)?;
            let name = builder.fresh_op_name(&format!("{}-diff-scale-instance-num", model.op_name));
            *diff = builder.add_op(
                &parallel_conf,
                name,
                OpConf::ScalarDivByTensor(ScalarByTensorOpConf {
                    input: diff.clone(),
                    scalar: total.clone(),
                }),
            )?;
        }
        Ok(model_diffs)
    }
}

/// Removes the loss scale the autograd seed carried; a no-op for a factor of exactly 1.
pub struct LossScaleStage {
    loss_scale_factor: f32,
}

impl LossScaleStage {
    pub fn new(loss_scale_factor: f32) -> Self {
        Self { loss_scale_factor }
    }
}

impl ModelDiffStage for LossScaleStage {
    fn name(&self) -> &'static str {
        "scale_model_diff_by_loss_scale"
    }

    fn apply(
        &self,
        _op_graph: &OpGraph,
        builder: &mut JobBuilder<'_>,
        mut model_diffs: GradientMap,
    ) -> Result<GradientMap> {
        if self.loss_scale_factor == 1.0 {
            return Ok(model_diffs);
        }
        for (model, diff) in model_diffs.iter_mut() {
            let (_, parallel_conf) = variable4model(builder, model)?;
            let name = builder.fresh_op_name(&format!("{}-diff-scale-loss-scale", model.op_name));
            *diff = builder.add_op(
                &parallel_conf,
                name,
                OpConf::ScalarDiv(ScalarOpConf {
                    input: diff.clone(),
                    operand: self.loss_scale_factor,
                }),
            )?;
        }
        Ok(model_diffs)
    }
}
