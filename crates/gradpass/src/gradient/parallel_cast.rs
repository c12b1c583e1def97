use anyhow::Result;

use crate::autograd::GradientMap;
use crate::gradient::{variable4model, ModelDiffStage};
use crate::graph::{JobBuilder, OpGraph};
use crate::job::op_conf::{ParallelCastOpConf, OUT};
use crate::job::{OpBlobArg, OpConf};

/// Casts each gradient to the SBP its parameter is kept in on a multi-device placement.
pub struct ParallelCastStage;

impl ModelDiffStage for ParallelCastStage {
    fn name(&self) -> &'static str {
        "add_diff_parallel_cast"
    }

    fn apply(
        &self,
        _op_graph: &OpGraph,
        builder: &mut JobBuilder<'_>,
        mut model_diffs: GradientMap,
    ) -> Result<GradientMap> {
        for (model, diff) in model_diffs.iter_mut() {
            let (variable, parallel_conf) = variable4model(builder, model)?;
            if parallel_conf.parallel_num <= 1 {
                continue;
            }
            let model_sbp = variable.model_sbp();
            if builder.sbp_parallel4lbi(diff) == Some(model_sbp) {
                continue;
            }
            let name = builder.fresh_op_name(&format!("{}-diff-parallel-cast", model.op_name));
            let cast = builder.add_op(
                &parallel_conf,
                name,
                OpConf::ParallelCast(ParallelCastOpConf {
                    input: diff.clone(),
                    sbp_parallel: Some(model_sbp),
                }),
            )?;
            builder.set_sbp_parallel4oba(&OpBlobArg::new(cast.op_name.clone(), OUT), model_sbp);
            log::debug!("cast diff of {model} to {model_sbp}");
            *diff = cast;
        }
        Ok(model_diffs)
    }
}
