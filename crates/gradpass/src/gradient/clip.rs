use anyhow::{bail, Result};

use crate::autograd::GradientMap;
use crate::gradient::{shared_parallel_conf, variable4model, ModelDiffStage};
use crate::graph::{JobBuilder, OpGraph};
use crate::job::op_conf::{
    AddOpConf, ClipByValueOpConf, GlobalNormClipFactorOpConf, ScalarByTensorOpConf, UnaryOpConf,
};
use crate::job::{LogicalBlobId, OpConf};
use crate::train::ClipConf;

pub struct ClipStage {
    clip_conf: ClipConf,
}

impl ClipStage {
    pub fn new(clip_conf: ClipConf) -> Self {
        Self { clip_conf }
    }

    fn clip_by_value(
        builder: &mut JobBuilder<'_>,
        mut model_diffs: GradientMap,
        min: f32,
        max: f32,
    ) -> Result<GradientMap> {
        if min.is_nan() || max.is_nan() || min > max {
            bail!("clip_by_value bounds are invalid: min = {min}, max = {max}");
        }
        for (model, diff) in model_diffs.iter_mut() {
            let (_, parallel_conf) = variable4model(builder, model)?;
            let name = builder.fresh_op_name(&format!("{}-diff-clip-by-value", model.op_name));
            *diff = builder.add_op(
                &parallel_conf,
                name,
                OpConf::ClipByValue(ClipByValueOpConf {
                    input: diff.clone(),
                    min,
                    max,
                }),
            )?;
        }
        Ok(model_diffs)
    }

    /// Scales all gradients by `clip_norm / max(global_norm, clip_norm)`.
    fn clip_by_global_norm(
        builder: &mut JobBuilder<'_>,
        mut model_diffs: GradientMap,
        clip_norm: f32,
        global_norm: Option<f32>,
    ) -> Result<GradientMap> {
        let shared = shared_parallel_conf(builder);
        let square_sum = match global_norm {
            Some(_) => None,
            None => {
                let mut square_sums: Vec<LogicalBlobId> = Vec::with_capacity(model_diffs.len());
                for (model, diff) in &model_diffs {
                    let (_, parallel_conf) = variable4model(builder, model)?;
                    let name = builder.fresh_op_name(&format!("{}-diff-square-sum", model.op_name));
                    square_sums.push(builder.add_op(
                        &parallel_conf,
                        name,
                        OpConf::SquareSum(UnaryOpConf {
                            input: diff.clone(),
                        }),
                    )?);
                }
                if square_sums.len() == 1 {
                    square_sums.pop()
                } else {
                    let name = builder.fresh_op_name("System-Train-GlobalSquareSum");
                    Some(builder.add_op(
                        &shared,
                        name,
                        OpConf::Add(AddOpConf {
                            inputs: square_sums,
                        }),
                    )?)
                }
            }
        };

        let name = builder.fresh_op_name("System-Train-GlobalNormClipFactor");
        let factor = builder.add_op(
            &shared,
            name,
            OpConf::GlobalNormClipFactor(GlobalNormClipFactorOpConf {
                square_sum,
                clip_norm,
                global_norm,
            }),
        )?;
        for (model, diff) in model_diffs.iter_mut() {
            let (_, parallel_conf) = variable4model(builder, model)?;
            let name = builder.fresh_op_name(&format!("{}-diff-clip-by-global-norm", model.op_name));
            *diff = builder.add_op(
                &parallel_conf,
                name,
                OpConf::ScalarMulByTensor(ScalarByTensorOpConf {
                    input: diff.clone(),
                    scalar: factor.clone(),
                }),
            )?;
        }
        Ok(model_diffs)
    }
}

impl ModelDiffStage for ClipStage {
    fn name(&self) -> &'static str {
        "clip_gradient"
    }

    fn apply(
        &self,
        _op_graph: &OpGraph,
        builder: &mut JobBuilder<'_>,
        model_diffs: GradientMap,
    ) -> Result<GradientMap> {
        if model_diffs.is_empty() {
            return Ok(model_diffs);
        }
        match self.clip_conf {
            ClipConf::ClipByValue { min, max } => Self::clip_by_value(builder, model_diffs, min, max),
            ClipConf::ClipByGlobalNorm {
                clip_norm,
                global_norm,
            } => Self::clip_by_global_norm(builder, model_diffs, clip_norm, global_norm),
        }
    }
}
