use linkme::distributed_slice;

use crate::autograd::{AutogradError, BackwardCtx, GradCapability, GradRule, GRAD_RULES};
use crate::job::op_conf::{IndexedSlicesFromGatherOpConf, UnsortedSegmentSumOpConf, OUT};
use crate::job::OpConf;

#[distributed_slice(GRAD_RULES)]
static GATHER: GradRule = GradRule {
    op_type_name: "gather",
    capability: GradCapability::Differentiable(gather_grad),
};

/// Embedding-style lookups of a trainable variable may keep their gradient sparse.
fn emits_indexed_slices(ctx: &BackwardCtx<'_, '_>, table: &crate::job::LogicalBlobId) -> bool {
    let Some(variable) = ctx.op_graph().producer(table) else {
        return false;
    };
    let trainable = variable
        .op_conf()
        .as_variable()
        .is_some_and(|conf| conf.trainable);
    trainable
        && ctx.op_graph().consumers(table).len() == 1
        && ctx
            .train_conf()
            .indexed_slices_optimizer_conf
            .is_enabled_for(variable.op_name())
}

fn gather_grad(ctx: &mut BackwardCtx<'_, '_>) -> Result<(), AutogradError> {
    let Some(dy) = ctx.out_diff(OUT).cloned() else {
        return Ok(());
    };
    if !ctx.needs_diff("in") {
        return Ok(());
    }
    let table = ctx.input("in")?;
    let indices = ctx.input("indices")?;

    let (diff, indices_bn) = if emits_indexed_slices(ctx, &table) {
        let diff = ctx.add_op(
            "in",
            OpConf::IndexedSlicesFromGather(IndexedSlicesFromGatherOpConf {
                indices,
                values: dy,
                like: table,
            }),
        )?;
        (diff, "indices")
    } else {
        let diff = ctx.add_op(
            "in",
            OpConf::UnsortedSegmentSum(UnsortedSegmentSumOpConf {
                data: dy,
                segment_ids: indices,
                like: table,
            }),
        )?;
        (diff, "segment_ids")
    };
    ctx.bind_forward_port(&diff.op_name, indices_bn, "indices");
    ctx.bind_forward_port(&diff.op_name, "like", "in");
    ctx.set_in_diff("in", diff);
    Ok(())
}
