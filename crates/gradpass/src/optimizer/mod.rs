//! Emits the model-update part of a training job.
//!
//! One job-wide train-step counter and learning-rate operator, then per parameter its
//! optimizer state variables and exactly one update operator, then the step increment.

use anyhow::{anyhow, bail, Context, Result};

use crate::autograd::GradientMap;
use crate::graph::{JobBuilder, OpGraph};
use crate::job::op_conf::{
    AdamUpdateOpConf, IncrementTrainStepOpConf, IndexedSlicesToDenseOpConf, Initializer,
    LarsUpdateOpConf, LearningRateOpConf, MomentumUpdateOpConf, RmsPropUpdateOpConf,
    SgdUpdateOpConf, VariableOpConf, OUT,
};
use crate::job::{DType, LogicalBlobId, OpBlobArg, OpConf, OperatorConf, ParallelConf};
use crate::train::{ModelUpdateConf, OptimizerConf, TrainConf};

pub const TRAIN_STEP_OP_NAME: &str = "System-Train-TrainStep";
pub const LEARNING_RATE_OP_NAME: &str = "System-Train-LearningRate";
pub const INCREMENT_TRAIN_STEP_OP_NAME: &str = "System-Train-IncrementTrainStep";

/// Operators the emitter appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerOps {
    pub train_step: Option<LogicalBlobId>,
    pub learning_rate: Option<LogicalBlobId>,
    /// Update operator name per parameter, in parameter order.
    pub update_ops: Vec<(LogicalBlobId, String)>,
    pub state_variables: Vec<String>,
}

/// Shared inputs of every update operator.
struct UpdateInputs {
    model: LogicalBlobId,
    model_diff: LogicalBlobId,
    learning_rate: LogicalBlobId,
    train_step: LogicalBlobId,
    weight_decay: f32,
}

pub fn add_optimizer_op_confs(
    _op_graph: &OpGraph,
    builder: &mut JobBuilder<'_>,
    model_diffs: &GradientMap,
    train_conf: &TrainConf,
) -> Result<OptimizerOps> {
    let mut emitted = OptimizerOps::default();
    if model_diffs.is_empty() {
        log::debug!("no parameter received a gradient; no optimizer ops emitted");
        return Ok(emitted);
    }
    let update_conf = &train_conf.model_update_conf;
    let shared = builder.job().placement.default_parallel_conf.clone();

    let train_step = train_step_lbi(builder, &shared)?;
    let lr_name = builder.fresh_op_name(LEARNING_RATE_OP_NAME);
    let learning_rate = builder.add_op(
        &shared,
        lr_name,
        OpConf::LearningRate(LearningRateOpConf {
            train_step: train_step.clone(),
            schedule: update_conf.learning_rate,
        }),
    )?;

    for (model, model_diff) in model_diffs {
        let variable = builder
            .op_conf(&model.op_name)
            .and_then(|op| op.as_variable())
            .ok_or_else(|| anyhow!("{model} is not produced by a variable"))?
            .clone();
        let parallel_conf = builder.parallel_conf4op_name(&model.op_name).clone();
        let inputs = UpdateInputs {
            model: model.clone(),
            model_diff: model_diff.clone(),
            learning_rate: learning_rate.clone(),
            train_step: train_step.clone(),
            weight_decay: update_conf.weight_decay,
        };
        let update_op = emit_update(
            builder,
            &variable,
            &parallel_conf,
            inputs,
            update_conf,
            &mut emitted.state_variables,
        )
        .with_context(|| format!("failed to emit the update of {model}"))?;
        log::debug!("{model}: {} via {}", update_op.op_type_name(), update_op.name);
        builder.bind_identical_sbp_oba_pair(
            OpBlobArg::new(update_op.name.clone(), "model"),
            OpBlobArg::new(model.op_name.clone(), model.blob_name.clone()),
        );
        emitted.update_ops.push((model.clone(), update_op.name.clone()));
        builder.add_ops(&parallel_conf, vec![update_op])?;
    }

    let increment_name = builder.fresh_op_name(INCREMENT_TRAIN_STEP_OP_NAME);
    builder.add_op(
        &shared,
        increment_name,
        OpConf::IncrementTrainStep(IncrementTrainStepOpConf {
            train_step: train_step.clone(),
        }),
    )?;

    log::info!(
        "emitted {} {} updates",
        emitted.update_ops.len(),
        update_conf.optimizer.name()
    );
    emitted.train_step = Some(train_step);
    emitted.learning_rate = Some(learning_rate);
    Ok(emitted)
}

/// Reuses an existing step counter variable or creates one.
fn train_step_lbi(builder: &mut JobBuilder<'_>, shared: &ParallelConf) -> Result<LogicalBlobId> {
    if let Some(op) = builder.op_conf(TRAIN_STEP_OP_NAME) {
        if op.as_variable().is_none() {
            bail!("{TRAIN_STEP_OP_NAME} exists but is not a variable");
        }
        return Ok(op.output_lbi(OUT));
    }
    let mut counter = VariableOpConf::new([1], Initializer::Zeros);
    counter.dtype = DType::I64;
    counter.trainable = false;
    Ok(builder.add_op(shared, TRAIN_STEP_OP_NAME, OpConf::Variable(counter))?)
}

/// Creates `{model}-{state}` with the model's shape, placement and SBP.
fn add_state_variable(
    builder: &mut JobBuilder<'_>,
    variable: &VariableOpConf,
    parallel_conf: &ParallelConf,
    model: &LogicalBlobId,
    state: &str,
    created: &mut Vec<String>,
) -> Result<LogicalBlobId> {
    let name = builder.fresh_op_name(&format!("{}-{state}", model.op_name));
    let state_conf = VariableOpConf {
        shape: variable.shape.clone(),
        dtype: variable.dtype,
        initializer: Initializer::Zeros,
        split_axis: variable.split_axis,
        trainable: false,
        regularizer: None,
    };
    let lbi = builder.add_op(parallel_conf, name.clone(), OpConf::Variable(state_conf))?;
    builder.set_sbp_parallel4oba(&OpBlobArg::new(name.clone(), OUT), variable.model_sbp());
    created.push(name);
    Ok(lbi)
}

fn emit_update(
    builder: &mut JobBuilder<'_>,
    variable: &VariableOpConf,
    parallel_conf: &ParallelConf,
    mut inputs: UpdateInputs,
    update_conf: &ModelUpdateConf,
    created: &mut Vec<String>,
) -> Result<OperatorConf> {
    let optimizer = update_conf.optimizer;
    let model = inputs.model.clone();
    let sparse = builder.is_indexed_slices(&inputs.model_diff);
    if sparse && !optimizer.supports_indexed_slices() {
        let name = builder.fresh_op_name(&format!("{}-diff-to-dense", model.op_name));
        inputs.model_diff = builder.add_op(
            parallel_conf,
            name,
            OpConf::IndexedSlicesToDense(IndexedSlicesToDenseOpConf {
                input: inputs.model_diff.clone(),
                like: model.clone(),
            }),
        )?;
    }
    let sparse = sparse && optimizer.supports_indexed_slices();

    let (suffix, op_type) = match optimizer {
        OptimizerConf::Sgd => {
            let conf = SgdUpdateOpConf {
                model: inputs.model,
                model_diff: inputs.model_diff,
                learning_rate: inputs.learning_rate,
                weight_decay: inputs.weight_decay,
            };
            if sparse {
                ("indexed-slices-sgd-update", OpConf::IndexedSlicesSgdUpdate(conf))
            } else {
                ("sgd-update", OpConf::SgdUpdate(conf))
            }
        }
        OptimizerConf::Momentum { beta } => {
            let conf = MomentumUpdateOpConf {
                momentum: add_state_variable(
                    builder,
                    variable,
                    parallel_conf,
                    &model,
                    "momentum",
                    created,
                )?,
                model: inputs.model,
                model_diff: inputs.model_diff,
                learning_rate: inputs.learning_rate,
                beta,
                weight_decay: inputs.weight_decay,
            };
            if sparse {
                (
                    "indexed-slices-momentum-update",
                    OpConf::IndexedSlicesMomentumUpdate(conf),
                )
            } else {
                ("momentum-update", OpConf::MomentumUpdate(conf))
            }
        }
        OptimizerConf::Adam {
            beta1,
            beta2,
            epsilon,
            do_bias_correction,
        }
        | OptimizerConf::LazyAdam {
            beta1,
            beta2,
            epsilon,
            do_bias_correction,
        } => {
            let conf = AdamUpdateOpConf {
                m: add_state_variable(
                    builder,
                    variable,
                    parallel_conf,
                    &model,
                    "m",
                    created,
                )?,
                v: add_state_variable(
                    builder,
                    variable,
                    parallel_conf,
                    &model,
                    "v",
                    created,
                )?,
                model: inputs.model,
                model_diff: inputs.model_diff,
                learning_rate: inputs.learning_rate,
                train_step: inputs.train_step,
                beta1,
                beta2,
                epsilon,
                do_bias_correction,
                weight_decay: inputs.weight_decay,
            };
            if sparse {
                (
                    "indexed-slices-lazy-adam-update",
                    OpConf::IndexedSlicesLazyAdamUpdate(conf),
                )
            } else {
                ("adam-update", OpConf::AdamUpdate(conf))
            }
        }
        OptimizerConf::RmsProp {
            decay_rate,
            epsilon,
        } => (
            "rms-prop-update",
            OpConf::RmsPropUpdate(RmsPropUpdateOpConf {
                mean_square: add_state_variable(
                    builder,
                    variable,
                    parallel_conf,
                    &model,
                    "mean_square",
                    created,
                )?,
                model: inputs.model,
                model_diff: inputs.model_diff,
                learning_rate: inputs.learning_rate,
                decay_rate,
                epsilon,
                weight_decay: inputs.weight_decay,
            }),
        ),
        OptimizerConf::Lars {
            momentum_beta,
            epsilon,
            lars_coefficient,
        } => (
            "lars-update",
            OpConf::LarsUpdate(LarsUpdateOpConf {
                momentum: add_state_variable(
                    builder,
                    variable,
                    parallel_conf,
                    &model,
                    "momentum",
                    created,
                )?,
                model: inputs.model,
                model_diff: inputs.model_diff,
                learning_rate: inputs.learning_rate,
                momentum_beta,
                epsilon,
                lars_coefficient,
                weight_decay: inputs.weight_decay,
            }),
        ),
    };

    let update_name = builder.fresh_op_name(&format!("{}-{suffix}", model.op_name));
    let update = OperatorConf::new(update_name, op_type);
    for (bn, state_lbi) in update.input_ports() {
        if created.iter().any(|name| *name == state_lbi.op_name) {
            builder.bind_identical_sbp_oba_pair(
                OpBlobArg::new(update.name.clone(), bn),
                OpBlobArg::new(state_lbi.op_name.clone(), OUT),
            );
        }
    }
    Ok(update)
}
