use linkme::distributed_slice;

use crate::autograd::{AutogradError, BackwardCtx, GradCapability, GradRule, GRAD_RULES};
use crate::job::op_conf::{BinaryOpConf, ReluGradOpConf, ScalarOpConf, OUT};
use crate::job::OpConf;

#[distributed_slice(GRAD_RULES)]
static ADD: GradRule = GradRule {
    op_type_name: "add",
    capability: GradCapability::Differentiable(add_grad),
};

#[distributed_slice(GRAD_RULES)]
static MULTIPLY: GradRule = GradRule {
    op_type_name: "multiply",
    capability: GradCapability::Differentiable(multiply_grad),
};

#[distributed_slice(GRAD_RULES)]
static RELU: GradRule = GradRule {
    op_type_name: "relu",
    capability: GradCapability::Differentiable(relu_grad),
};

#[distributed_slice(GRAD_RULES)]
static IDENTITY: GradRule = GradRule {
    op_type_name: "identity",
    capability: GradCapability::Differentiable(identity_grad),
};

#[distributed_slice(GRAD_RULES)]
static SCALAR_MUL: GradRule = GradRule {
    op_type_name: "scalar_mul",
    capability: GradCapability::Differentiable(scalar_mul_grad),
};

fn add_grad(ctx: &mut BackwardCtx<'_, '_>) -> Result<(), AutogradError> {
    let Some(dy) = ctx.out_diff(OUT).cloned() else {
        return Ok(());
    };
    for ibn in ctx.op().input_bns() {
        ctx.set_in_diff(&ibn, dy.clone());
    }
    Ok(())
}

fn multiply_grad(ctx: &mut BackwardCtx<'_, '_>) -> Result<(), AutogradError> {
    let Some(dy) = ctx.out_diff(OUT).cloned() else {
        return Ok(());
    };
    // d(x * y)/dx = y and d(x * y)/dy = x
    for (ibn, other_bn) in [("x", "y"), ("y", "x")] {
        if !ctx.needs_diff(ibn) {
            continue;
        }
        let other = ctx.input(other_bn)?;
        let diff = ctx.add_op(
            ibn,
            OpConf::Multiply(BinaryOpConf {
                x: dy.clone(),
                y: other,
            }),
        )?;
        ctx.bind_forward_port(&diff.op_name, "y", other_bn);
        ctx.set_in_diff(ibn, diff);
    }
    Ok(())
}

fn relu_grad(ctx: &mut BackwardCtx<'_, '_>) -> Result<(), AutogradError> {
    let Some(dy) = ctx.out_diff(OUT).cloned() else {
        return Ok(());
    };
    if !ctx.needs_diff("in") {
        return Ok(());
    }
    let y = ctx.op().output_lbi(OUT);
    let dx = ctx.add_op("in", OpConf::ReluGrad(ReluGradOpConf { y, dy }))?;
    ctx.bind_forward_port(&dx.op_name, "y", OUT);
    ctx.set_in_diff("in", dx);
    Ok(())
}

fn identity_grad(ctx: &mut BackwardCtx<'_, '_>) -> Result<(), AutogradError> {
    if let Some(dy) = ctx.out_diff(OUT).cloned() {
        ctx.set_in_diff("in", dy);
    }
    Ok(())
}

fn scalar_mul_grad(ctx: &mut BackwardCtx<'_, '_>) -> Result<(), AutogradError> {
    let Some(dy) = ctx.out_diff(OUT).cloned() else {
        return Ok(());
    };
    let OpConf::ScalarMul(conf) = &ctx.op().op_type else {
        return Err(AutogradError::Rule {
            op_name: ctx.op_name().to_string(),
            message: "expected a scalar_mul operator".into(),
        });
    };
    if ctx.needs_diff("in") {
        let dx = ctx.add_op(
            "in",
            OpConf::ScalarMul(ScalarOpConf {
                input: dy,
                operand: conf.operand,
            }),
        )?;
        ctx.set_in_diff("in", dx);
    }
    Ok(())
}
