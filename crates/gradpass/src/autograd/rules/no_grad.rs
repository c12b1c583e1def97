use linkme::distributed_slice;

use crate::autograd::{GradCapability, GradRule, GRAD_RULES};

#[distributed_slice(GRAD_RULES)]
static VARIABLE: GradRule = GradRule {
    op_type_name: "variable",
    capability: GradCapability::NoGradient,
};

#[distributed_slice(GRAD_RULES)]
static INPUT: GradRule = GradRule {
    op_type_name: "input",
    capability: GradCapability::NoGradient,
};

#[distributed_slice(GRAD_RULES)]
static ARGMAX: GradRule = GradRule {
    op_type_name: "argmax",
    capability: GradCapability::NoGradient,
};
