use std::collections::HashMap;
use std::sync::OnceLock;

use crate::autograd::{AutogradError, BackwardCtx};

/// Gradient function: reads the out diffs from the context and reports input diffs.
pub type GradFn = fn(&mut BackwardCtx<'_, '_>) -> Result<(), AutogradError>;

/// What the differentiator may do with an operator type.
#[derive(Clone, Copy)]
pub enum GradCapability {
    Differentiable(GradFn),
    /// Gradients stop here; inputs receive nothing.
    NoGradient,
}

impl std::fmt::Debug for GradCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GradCapability::Differentiable(_) => f.write_str("Differentiable"),
            GradCapability::NoGradient => f.write_str("NoGradient"),
        }
    }
}

#[derive(Debug)]
pub struct GradRule {
    pub op_type_name: &'static str,
    pub capability: GradCapability,
}

/// Gradient rules contributed by any linked crate.
///
/// ```ignore
/// #[linkme::distributed_slice(gradpass::autograd::GRAD_RULES)]
/// static MY_OP_GRAD: GradRule = GradRule {
///     op_type_name: "my_op",
///     capability: GradCapability::Differentiable(my_op_grad),
/// };
/// ```
#[linkme::distributed_slice]
pub static GRAD_RULES: [GradRule] = [..];

static GRAD_RULE_TABLE: OnceLock<HashMap<&'static str, &'static GradRule>> = OnceLock::new();

fn grad_rule_table() -> &'static HashMap<&'static str, &'static GradRule> {
    GRAD_RULE_TABLE.get_or_init(|| {
        let mut table = HashMap::with_capacity(GRAD_RULES.len());
        for rule in GRAD_RULES.iter() {
            if table.insert(rule.op_type_name, rule).is_some() {
                log::warn!(
                    "duplicate gradient rule for op type {:?}; keeping the last one linked",
                    rule.op_type_name
                );
            }
        }
        table
    })
}

pub fn grad_rule(op_type_name: &str) -> Option<&'static GradRule> {
    grad_rule_table().get(op_type_name).copied()
}

pub fn registered_op_types() -> Vec<&'static str> {
    let mut names: Vec<_> = grad_rule_table().keys().copied().collect();
    names.sort_unstable();
    names
}
