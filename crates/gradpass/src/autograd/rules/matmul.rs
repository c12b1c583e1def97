use linkme::distributed_slice;

use crate::autograd::{AutogradError, BackwardCtx, GradCapability, GradRule, GRAD_RULES};
use crate::job::op_conf::{MatmulOpConf, OUT};
use crate::job::{LogicalBlobId, OpConf};

#[distributed_slice(GRAD_RULES)]
static MATMUL: GradRule = GradRule {
    op_type_name: "matmul",
    capability: GradCapability::Differentiable(matmul_grad),
};

/// Operand of a backward matmul: a forward input (bound to its forward port) or the out diff.
enum Operand<'a> {
    Forward(&'static str, &'a LogicalBlobId),
    Diff(&'a LogicalBlobId),
}

impl Operand<'_> {
    fn lbi(&self) -> LogicalBlobId {
        match self {
            Operand::Forward(_, lbi) | Operand::Diff(lbi) => (*lbi).clone(),
        }
    }
}

fn emit(
    ctx: &mut BackwardCtx<'_, '_>,
    suffix: &str,
    a: Operand<'_>,
    b: Operand<'_>,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<LogicalBlobId, AutogradError> {
    let out = ctx.add_op(
        suffix,
        OpConf::Matmul(MatmulOpConf {
            a: a.lbi(),
            b: b.lbi(),
            transpose_a,
            transpose_b,
        }),
    )?;
    for (bn, operand) in [("a", &a), ("b", &b)] {
        if let Operand::Forward(forward_bn, _) = operand {
            ctx.bind_forward_port(&out.op_name, bn, forward_bn);
        }
    }
    Ok(out)
}

// out = op(a) @ op(b), op being an optional transpose.
fn matmul_grad(ctx: &mut BackwardCtx<'_, '_>) -> Result<(), AutogradError> {
    let Some(dy) = ctx.out_diff(OUT).cloned() else {
        return Ok(());
    };
    let OpConf::Matmul(conf) = &ctx.op().op_type else {
        return Err(AutogradError::Rule {
            op_name: ctx.op_name().to_string(),
            message: "expected a matmul operator".into(),
        });
    };
    let (a, b) = (&conf.a, &conf.b);
    let dy = &dy;

    if ctx.needs_diff("a") {
        let da = match (conf.transpose_a, conf.transpose_b) {
            (false, false) => emit(ctx, "a", Operand::Diff(dy), Operand::Forward("b", b), false, true)?,
            (false, true) => emit(ctx, "a", Operand::Diff(dy), Operand::Forward("b", b), false, false)?,
            (true, false) => emit(ctx, "a", Operand::Forward("b", b), Operand::Diff(dy), false, true)?,
            (true, true) => emit(ctx, "a", Operand::Forward("b", b), Operand::Diff(dy), true, true)?,
        };
        ctx.set_in_diff("a", da);
    }
    if ctx.needs_diff("b") {
        let db = match (conf.transpose_a, conf.transpose_b) {
            (false, false) => emit(ctx, "b", Operand::Forward("a", a), Operand::Diff(dy), true, false)?,
            (false, true) => emit(ctx, "b", Operand::Diff(dy), Operand::Forward("a", a), true, false)?,
            (true, false) => emit(ctx, "b", Operand::Forward("a", a), Operand::Diff(dy), false, false)?,
            (true, true) => emit(ctx, "b", Operand::Diff(dy), Operand::Forward("a", a), true, true)?,
        };
        ctx.set_in_diff("b", db);
    }
    Ok(())
}
