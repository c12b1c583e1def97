use linkme::distributed_slice;

use crate::autograd::{AutogradError, BackwardCtx, GradCapability, GradRule, GRAD_RULES};
use crate::job::op_conf::{BroadcastLikeOpConf, OUT};
use crate::job::OpConf;

#[distributed_slice(GRAD_RULES)]
static REDUCE_SUM: GradRule = GradRule {
    op_type_name: "reduce_sum",
    capability: GradCapability::Differentiable(reduce_sum_grad),
};

fn reduce_sum_grad(ctx: &mut BackwardCtx<'_, '_>) -> Result<(), AutogradError> {
    let Some(dy) = ctx.out_diff(OUT).cloned() else {
        return Ok(());
    };
    let OpConf::ReduceSum(conf) = &ctx.op().op_type else {
        return Err(AutogradError::Rule {
            op_name: ctx.op_name().to_string(),
            message: "expected a reduce_sum operator".into(),
        });
    };
    if !ctx.needs_diff("in") {
        return Ok(());
    }
    // The reduced axes are broadcast back regardless of keepdims.
    let dx = ctx.add_op(
        "in",
        OpConf::BroadcastLike(BroadcastLikeOpConf {
            x: dy,
            like: conf.input.clone(),
            broadcast_axes: conf.axes.clone(),
        }),
    )?;
    ctx.bind_forward_port(&dx.op_name, "like", "in");
    ctx.set_in_diff("in", dx);
    Ok(())
}
