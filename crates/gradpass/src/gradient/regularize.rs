use anyhow::Result;

use crate::autograd::GradientMap;
use crate::gradient::{variable4model, ModelDiffStage};
use crate::graph::{JobBuilder, OpGraph};
use crate::job::op_conf::L1L2RegularizeGradientOpConf;
use crate::job::OpConf;
use crate::train::RegularizerConf;

/// Adds `l1 * sign(w) + l2 * w` to each gradient. Variables may override the default.
pub struct RegularizeStage {
    default_regularizer: Option<RegularizerConf>,
}

impl RegularizeStage {
    pub fn new(default_regularizer: Option<RegularizerConf>) -> Self {
        Self {
            default_regularizer,
        }
    }
}

impl ModelDiffStage for RegularizeStage {
    fn name(&self) -> &'static str {
        "regularize_gradient"
    }

    fn apply(
        &self,
        _op_graph: &OpGraph,
        builder: &mut JobBuilder<'_>,
        mut model_diffs: GradientMap,
    ) -> Result<GradientMap> {
        for (model, diff) in model_diffs.iter_mut() {
            let (variable, parallel_conf) = variable4model(builder, model)?;
            let Some(regularizer) = variable.regularizer.or(self.default_regularizer) else {
                continue;
            };
            if regularizer.is_noop() {
                continue;
            }
            let name = builder.fresh_op_name(&format!("{}-diff-regularize", model.op_name));
            *diff = builder.add_op(
                &parallel_conf,
                name,
                OpConf::L1L2RegularizeGradient(L1L2RegularizeGradientOpConf {
                    model: model.clone(),
                    model_diff: diff.clone(),
                    l1: regularizer.l1,
                    l2: regularizer.l2,
                }),
            )?;
        }
        Ok(model_diffs)
    }
}
