//! Reverse-mode differentiation of a forward job.
//!
//! Operators are visited in reverse topological order. Every gradient contribution an
//! operator's rule reports for one of its inputs is queued on that input tensor; when the
//! tensor's producer is visited the queue is reduced (one contribution is used as is,
//! several are summed by an `add` operator) and handed to the producer's rule.

mod ctx;
mod registry;
mod rules;

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::graph::{GraphError, JobBuilder, OpGraph};
use crate::job::op_conf::{AddOpConf, ConstantLikeOpConf, ScalarOpConf};
use crate::job::{LogicalBlobId, OpBlobArg, OpConf, ParallelConf};
use crate::train::TrainConf;

pub use ctx::BackwardCtx;
pub use registry::{grad_rule, registered_op_types, GradCapability, GradFn, GradRule, GRAD_RULES};

/// Forward tensor to the tensor holding its gradient.
pub type GradientMap = BTreeMap<LogicalBlobId, LogicalBlobId>;

#[derive(Debug, Error)]
pub enum AutogradError {
    #[error("operator {op_name:?} ({op_type}) receives a gradient but has no registered gradient rule")]
    NoGradientRule { op_name: String, op_type: String },
    #[error("loss {lbi} is not produced by any operator")]
    UnknownLoss { lbi: LogicalBlobId },
    #[error("gradient rule of {op_name:?} references missing port {bn:?}")]
    MissingPort { op_name: String, bn: String },
    #[error("gradient rule of {op_name:?}: {message}")]
    Rule { op_name: String, message: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Differentiates every loss in `train_conf` with respect to all trainable variables.
///
/// The returned map covers every tensor lying on a path from a trainable variable to a
/// loss. Tensors off those paths are absent.
pub fn autograd(
    op_graph: &OpGraph,
    builder: &mut JobBuilder<'_>,
    train_conf: &TrainConf,
) -> Result<GradientMap, AutogradError> {
    let trainable = op_graph
        .nodes()
        .filter(|node| {
            node.op_conf()
                .as_variable()
                .is_some_and(|variable| variable.trainable)
        })
        .map(|node| node.id());
    let from_variables = op_graph.descendants_of(trainable);

    let mut losses: Vec<&LogicalBlobId> = Vec::new();
    for lbi in &train_conf.loss_lbn {
        let produced = op_graph
            .producer(lbi)
            .is_some_and(|node| node.op_conf().output_bns().contains(&lbi.blob_name));
        if !produced {
            return Err(AutogradError::UnknownLoss { lbi: lbi.clone() });
        }
        if !losses.contains(&lbi) {
            losses.push(lbi);
        }
    }
    let to_losses = op_graph.ancestors_of(
        losses
            .iter()
            .filter_map(|lbi| op_graph.producer(lbi))
            .map(|node| node.id()),
    );
    let participating: Vec<bool> = from_variables
        .iter()
        .zip(&to_losses)
        .map(|(from, to)| *from && *to)
        .collect();
    let is_participating = |op_name: &str| {
        op_graph
            .op_node4op_name(op_name)
            .is_some_and(|node| participating[node.id().0 as usize])
    };

    let mut contributions: BTreeMap<LogicalBlobId, Vec<LogicalBlobId>> = BTreeMap::new();
    for lbi in losses {
        if !is_participating(&lbi.op_name) {
            log::warn!("loss {lbi} does not depend on any trainable variable");
            continue;
        }
        let parallel_conf = builder.parallel_conf4op_name(&lbi.op_name).clone();
        let name = builder.fresh_op_name(&format!("{}-{}-grad-seed", lbi.op_name, lbi.blob_name));
        let seed = builder.add_op(
            &parallel_conf,
            name.clone(),
            OpConf::ConstantLike(ConstantLikeOpConf {
                like: lbi.clone(),
                value: train_conf.loss_scale_factor,
            }),
        )?;
        builder.bind_identical_sbp_oba_pair(
            OpBlobArg::new(name, "like"),
            OpBlobArg::new(lbi.op_name.clone(), lbi.blob_name.clone()),
        );
        contributions.entry(lbi.clone()).or_default().push(seed);
    }

    let mut gradients = GradientMap::new();
    for node in op_graph.reverse_topo_order() {
        if !participating[node.id().0 as usize] {
            continue;
        }
        let op = node.op_conf();

        let mut out_diffs = BTreeMap::new();
        for obn in op.output_bns() {
            let lbi = op.output_lbi(&obn);
            let Some(parts) = contributions.remove(&lbi) else {
                continue;
            };
            let diff = accumulate(builder, node.parallel_conf(), &lbi, parts)?;
            gradients.insert(lbi, diff.clone());
            out_diffs.insert(obn, diff);
        }
        if out_diffs.is_empty() {
            continue;
        }

        let participating_ibns: BTreeSet<String> = op
            .input_ports()
            .into_iter()
            .filter(|(_, lbi)| is_participating(&lbi.op_name))
            .filter(|(_, lbi)| {
                op_graph
                    .logical_blob_desc(lbi)
                    .map_or(true, |desc| desc.dtype.is_float())
            })
            .map(|(ibn, _)| ibn)
            .collect();
        if participating_ibns.is_empty() {
            continue;
        }

        let rule = grad_rule(op.op_type_name()).ok_or_else(|| AutogradError::NoGradientRule {
            op_name: op.name.clone(),
            op_type: op.op_type_name().to_string(),
        })?;
        let grad_fn = match rule.capability {
            GradCapability::Differentiable(grad_fn) => grad_fn,
            GradCapability::NoGradient => {
                log::debug!("{} ({}) propagates no gradient", op.name, op.op_type_name());
                continue;
            }
        };

        let mut ctx = BackwardCtx::new(
            op_graph,
            builder,
            train_conf,
            node,
            out_diffs,
            participating_ibns,
        );
        grad_fn(&mut ctx)?;
        for (ibn, diff) in ctx.into_in_diffs() {
            let input = op
                .bn_in_op2lbi(&ibn)
                .ok_or_else(|| AutogradError::MissingPort {
                    op_name: op.name.clone(),
                    bn: ibn.clone(),
                })?;
            contributions.entry(input).or_default().push(diff);
        }
    }

    for (lbi, diff) in &gradients {
        if builder.is_indexed_slices(diff) || builder.logical_blob_desc(diff).is_some() {
            continue;
        }
        if let Some(desc) = op_graph.logical_blob_desc(lbi) {
            builder.set_logical_blob_desc(diff.clone(), desc.clone());
        }
    }

    log::debug!(
        "autograd produced {} gradients for {} losses",
        gradients.len(),
        train_conf.loss_lbn.len()
    );
    Ok(gradients)
}

/// Reduces the gradient contributions of one tensor to a single tensor.
///
/// A contribution reported several times (e.g. `x + x`) is scaled by its multiplicity
/// rather than fed twice into the same `add`.
fn accumulate(
    builder: &mut JobBuilder<'_>,
    parallel_conf: &ParallelConf,
    lbi: &LogicalBlobId,
    parts: Vec<LogicalBlobId>,
) -> Result<LogicalBlobId, AutogradError> {
    if parts.len() == 1 {
        return Ok(parts.into_iter().next().unwrap_or_else(|| lbi.clone()));
    }

    let mut counted: Vec<(LogicalBlobId, usize)> = Vec::with_capacity(parts.len());
    for part in parts {
        match counted.iter_mut().find(|(seen, _)| *seen == part) {
            Some((_, count)) => *count += 1,
            None => counted.push((part, 1)),
        }
    }

    let mut terms = Vec::with_capacity(counted.len());
    for (part, count) in counted {
        if count == 1 {
            terms.push(part);
            continue;
        }
        let name = builder.fresh_op_name(&format!("{}-{}-grad-dup", lbi.op_name, lbi.blob_name));
        terms.push(builder.add_op(
            parallel_conf,
            name,
            OpConf::ScalarMul(ScalarOpConf {
                input: part,
                operand: count as f32,
            }),
        )?);
    }
    if terms.len() == 1 {
        return Ok(terms.remove(0));
    }

    let name = builder.fresh_op_name(&format!("{}-{}-grad-acc", lbi.op_name, lbi.blob_name));
    Ok(builder.add_op(parallel_conf, name, OpConf::Add(AddOpConf { inputs: terms }))?)
}
