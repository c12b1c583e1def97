//! Runs one training step of a completed job on the host.
//!
//! Operators execute in job order. Variable operators publish a snapshot of the stored
//! tensor, so every forward and backward read sees the pre-step model; update operators
//! come after all readers and write the stored tensors back.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail, Context, Result};
use gradpass::job::op_conf::{
    AdamUpdateOpConf, Initializer, L1L2RegularizeGradientOpConf, MomentumUpdateOpConf,
    SgdUpdateOpConf, VariableOpConf, OUT,
};
use gradpass::job::{Job, LogicalBlobId, OpConf, OperatorConf};

use crate::kernels::indexed_slices::{
    indexed_slices_lazy_adam_update, indexed_slices_momentum_update, indexed_slices_sgd_update,
    IndexedSlicesReduceSum, ReduceSumWorkspace, UniqueRows,
};
use crate::kernels::optimizer::{
    adam_update, lars_update, momentum_update, rms_prop_update, sgd_update, AdamParams,
    LarsParams, MomentumParams, RmsPropParams, SgdParams,
};
use crate::kernels::{math, KernelError, RowRange};
use crate::tensor::{HostTensor, IndexedSlices, Value};

type ReduceSum = IndexedSlicesReduceSum<i64, f32>;

/// Values produced by one step, keyed by tensor.
#[derive(Debug, Default)]
pub struct StepOutputs {
    values: HashMap<LogicalBlobId, Value>,
}

impl StepOutputs {
    pub fn get(&self, lbi: &LogicalBlobId) -> Option<&Value> {
        self.values.get(lbi)
    }

    pub fn dense(&self, lbi: &LogicalBlobId) -> Result<HostTensor> {
        let value = self
            .get(lbi)
            .ok_or_else(|| anyhow!("step produced no value for {lbi}"))?;
        Ok(value.to_dense()?)
    }

    pub fn scalar(&self, lbi: &LogicalBlobId) -> Result<f32> {
        Ok(self.dense(lbi)?.scalar_value()?)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Holds the model and optimizer state of a job between steps.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    variables: BTreeMap<String, HostTensor>,
}

impl StepExecutor {
    /// Initializes every variable of `job` from its initializer.
    pub fn new(job: &Job) -> Result<Self> {
        let mut variables = BTreeMap::new();
        for op in &job.net {
            if let Some(conf) = op.as_variable() {
                variables.insert(op.name.clone(), init_variable(&op.name, conf)?);
            }
        }
        log::debug!(
            "initialized {} variables for job {}",
            variables.len(),
            job.job_conf.job_name
        );
        Ok(Self { variables })
    }

    pub fn variable(&self, name: &str) -> Option<&HostTensor> {
        self.variables.get(name)
    }

    /// Replaces the stored value of an existing variable; the shape must not change.
    pub fn set_variable(&mut self, name: &str, tensor: HostTensor) -> Result<()> {
        let slot = self
            .variables
            .get_mut(name)
            .ok_or_else(|| anyhow!("unknown variable `{name}`"))?;
        if slot.shape != tensor.shape || slot.dtype() != tensor.dtype() {
            bail!(
                "variable `{name}` is {:?} {:?}, got {:?} {:?}",
                slot.dtype(),
                slot.shape,
                tensor.dtype(),
                tensor.shape
            );
        }
        *slot = tensor;
        Ok(())
    }

    /// Runs every operator of `job` once. `feeds` maps input operator names to tensors.
    pub fn run_step(&mut self, job: &Job, feeds: &HashMap<String, HostTensor>) -> Result<StepOutputs> {
        let mut outputs = StepOutputs::default();
        for (index, op) in job.net.iter().enumerate() {
            let produced = self.run_op(op, &outputs.values, feeds).with_context(|| {
                format!(
                    "while executing op #{index} `{}` ({})",
                    op.name,
                    op.op_type_name()
                )
            })?;
            if let Some(value) = produced {
                outputs.values.insert(op.output_lbi(OUT), value);
            }
        }
        log::debug!(
            "step of job {} produced {} values",
            job.job_conf.job_name,
            outputs.len()
        );
        Ok(outputs)
    }

    fn run_op(
        &mut self,
        op: &OperatorConf,
        values: &HashMap<LogicalBlobId, Value>,
        feeds: &HashMap<String, HostTensor>,
    ) -> Result<Option<Value>> {
        let inputs = StepInputs(values);

        let out = match &op.op_type {
            OpConf::Variable(_) => Value::Dense(self.stored(&op.name)?.clone()),
            OpConf::Input(conf) => {
                let fed = feeds
                    .get(&op.name)
                    .ok_or_else(|| anyhow!("no feed for input `{}`", op.name))?;
                if fed.shape != conf.shape {
                    bail!(
                        "feed for `{}` has shape {:?}, expected {:?}",
                        op.name,
                        fed.shape,
                        conf.shape
                    );
                }
                Value::Dense(fed.clone())
            }
            OpConf::Matmul(conf) => Value::Dense(math::matmul(
                inputs.dense(&conf.a)?,
                inputs.dense(&conf.b)?,
                conf.transpose_a,
                conf.transpose_b,
            )?),
            OpConf::Add(conf) => {
                let summands = conf
                    .inputs
                    .iter()
                    .map(|lbi| Ok(inputs.value(lbi)?.to_dense()?))
                    .collect::<Result<Vec<_>>>()?;
                Value::Dense(math::add_n(&summands.iter().collect::<Vec<_>>())?)
            }
            OpConf::Multiply(conf) => {
                Value::Dense(math::multiply(inputs.dense(&conf.x)?, inputs.dense(&conf.y)?)?)
            }
            OpConf::Relu(conf) => Value::Dense(math::relu(inputs.dense(&conf.input)?)?),
            OpConf::Gather(conf) => {
                Value::Dense(math::gather(inputs.dense(&conf.input)?, inputs.dense(&conf.indices)?)?)
            }
            OpConf::ReduceSum(conf) => {
                Value::Dense(math::reduce_sum(inputs.dense(&conf.input)?, &conf.axes, conf.keepdims)?)
            }
            OpConf::Identity(conf) => inputs.value(&conf.input)?.clone(),
            OpConf::ParallelCast(conf) => inputs.value(&conf.input)?.clone(),
            OpConf::ScalarMul(conf) => map_value(inputs.value(&conf.input)?, |v| v * conf.operand)?,
            OpConf::ScalarDiv(conf) => map_value(inputs.value(&conf.input)?, |v| v / conf.operand)?,
            OpConf::Argmax(conf) => Value::Dense(math::argmax(inputs.dense(&conf.input)?)?),
            OpConf::User(conf) => {
                return Err(KernelError::Unsupported {
                    op_type: conf.op_type_name.clone(),
                }
                .into())
            }
            OpConf::ConstantLike(conf) => {
                Value::Dense(HostTensor::full(value_shape(inputs.value(&conf.like)?), conf.value))
            }
            OpConf::ReluGrad(conf) => {
                Value::Dense(math::relu_grad(inputs.dense(&conf.y)?, inputs.dense(&conf.dy)?)?)
            }
            OpConf::BroadcastLike(conf) => Value::Dense(math::broadcast_like(
                inputs.dense(&conf.x)?,
                &value_shape(inputs.value(&conf.like)?),
                &conf.broadcast_axes,
            )?),
            OpConf::UnsortedSegmentSum(conf) => Value::Dense(math::unsorted_segment_sum(
                inputs.dense(&conf.data)?,
                inputs.dense(&conf.segment_ids)?,
                &value_shape(inputs.value(&conf.like)?),
            )?),
            OpConf::IndexedSlicesFromGather(conf) => Value::Slices(IndexedSlices {
                indices: inputs.dense(&conf.indices)?.as_i64()?.to_vec(),
                values: inputs.dense(&conf.values)?.as_f32()?.to_vec(),
                dense_shape: value_shape(inputs.value(&conf.like)?),
            }),
            OpConf::TotalLossInstanceNum(conf) => {
                let mut total = 0usize;
                for loss in &conf.losses {
                    total += value_shape(inputs.value(loss)?).iter().product::<usize>();
                }
                Value::Dense(HostTensor::scalar(total as f32))
            }
            OpConf::ScalarDivByTensor(conf) => {
                let divisor = inputs.scalar(&conf.scalar)?;
                map_value(inputs.value(&conf.input)?, |v| v / divisor)?
            }
            OpConf::ScalarMulByTensor(conf) => {
                let factor = inputs.scalar(&conf.scalar)?;
                map_value(inputs.value(&conf.input)?, |v| v * factor)?
            }
            OpConf::L1L2RegularizeGradient(conf) => regularize(
                conf,
                inputs.dense(&conf.model)?,
                inputs.value(&conf.model_diff)?,
            )?,
            OpConf::ClipByValue(conf) => {
                let (min, max) = (conf.min, conf.max);
                match inputs.value(&conf.input)? {
                    Value::Dense(tensor) => Value::Dense(math::map(tensor, |v| v.max(min).min(max))?),
                    Value::Slices(slices) => {
                        Value::Slices(reduce_slices(slices)?.map_values(|v| v.max(min).min(max)))
                    }
                }
            }
            OpConf::SquareSum(conf) => match inputs.value(&conf.input)? {
                Value::Dense(tensor) => Value::Dense(math::square_sum(tensor.as_f32()?)),
                Value::Slices(slices) => Value::Dense(math::square_sum(&reduce_slices(slices)?.values)),
            },
            OpConf::GlobalNormClipFactor(conf) => {
                let global_norm = match (conf.global_norm, &conf.square_sum) {
                    (Some(norm), _) => norm,
                    (None, Some(square_sum)) => inputs.scalar(square_sum)?.sqrt(),
                    (None, None) => bail!("neither a global norm nor a square sum is configured"),
                };
                Value::Dense(HostTensor::scalar(conf.clip_norm / global_norm.max(conf.clip_norm)))
            }
            OpConf::LearningRate(conf) => {
                let step = train_step(inputs.dense(&conf.train_step)?)?;
                let step = usize::try_from(step).with_context(|| format!("negative train step {step}"))?;
                Value::Dense(HostTensor::scalar(conf.schedule.build().learning_rate(step)))
            }
            OpConf::IncrementTrainStep(conf) => {
                let counter = self.stored_mut(&conf.train_step.op_name)?.as_i64_mut()?;
                let slot = counter
                    .first_mut()
                    .ok_or_else(|| anyhow!("train step counter is empty"))?;
                *slot += 1;
                return Ok(None);
            }
            OpConf::SgdUpdate(conf) => {
                let params = sgd_params(conf, inputs.scalar(&conf.learning_rate)?);
                let diff = inputs.value(&conf.model_diff)?.to_dense()?;
                let mut model = self.stored(&conf.model.op_name)?.clone();
                sgd_update(model.as_f32_mut()?, diff.as_f32()?, &params)?;
                self.commit([(&conf.model, model)]);
                return Ok(None);
            }
            OpConf::IndexedSlicesSgdUpdate(conf) => {
                let params = sgd_params(conf, inputs.scalar(&conf.learning_rate)?);
                let slices = reduce_slices(sparse(inputs.value(&conf.model_diff)?)?)?;
                let mut model = self.stored(&conf.model.op_name)?.clone();
                let range = RowRange::all(slices.rows());
                indexed_slices_sgd_update(model.as_f32_mut()?, &unique_rows(&slices), range, &params)?;
                self.commit([(&conf.model, model)]);
                return Ok(None);
            }
            OpConf::MomentumUpdate(conf) => {
                let params = momentum_params(conf, inputs.scalar(&conf.learning_rate)?);
                let diff = inputs.value(&conf.model_diff)?.to_dense()?;
                let mut model = self.stored(&conf.model.op_name)?.clone();
                let mut momentum = self.stored(&conf.momentum.op_name)?.clone();
                momentum_update(model.as_f32_mut()?, momentum.as_f32_mut()?, diff.as_f32()?, &params)?;
                self.commit([(&conf.model, model), (&conf.momentum, momentum)]);
                return Ok(None);
            }
            OpConf::IndexedSlicesMomentumUpdate(conf) => {
                let params = momentum_params(conf, inputs.scalar(&conf.learning_rate)?);
                let slices = reduce_slices(sparse(inputs.value(&conf.model_diff)?)?)?;
                let mut model = self.stored(&conf.model.op_name)?.clone();
                let mut momentum = self.stored(&conf.momentum.op_name)?.clone();
                indexed_slices_momentum_update(
                    model.as_f32_mut()?,
                    momentum.as_f32_mut()?,
                    &unique_rows(&slices),
                    RowRange::all(slices.rows()),
                    &params,
                )?;
                self.commit([(&conf.model, model), (&conf.momentum, momentum)]);
                return Ok(None);
            }
            OpConf::AdamUpdate(conf) => {
                let params = adam_params(
                    conf,
                    inputs.scalar(&conf.learning_rate)?,
                    train_step(inputs.dense(&conf.train_step)?)?,
                );
                let diff = inputs.value(&conf.model_diff)?.to_dense()?;
                let mut model = self.stored(&conf.model.op_name)?.clone();
                let mut m = self.stored(&conf.m.op_name)?.clone();
                let mut v = self.stored(&conf.v.op_name)?.clone();
                adam_update(
                    model.as_f32_mut()?,
                    m.as_f32_mut()?,
                    v.as_f32_mut()?,
                    diff.as_f32()?,
                    &params,
                )?;
                self.commit([(&conf.model, model), (&conf.m, m), (&conf.v, v)]);
                return Ok(None);
            }
            OpConf::IndexedSlicesLazyAdamUpdate(conf) => {
                let params = adam_params(
                    conf,
                    inputs.scalar(&conf.learning_rate)?,
                    train_step(inputs.dense(&conf.train_step)?)?,
                );
                let slices = reduce_slices(sparse(inputs.value(&conf.model_diff)?)?)?;
                let mut model = self.stored(&conf.model.op_name)?.clone();
                let mut m = self.stored(&conf.m.op_name)?.clone();
                let mut v = self.stored(&conf.v.op_name)?.clone();
                let touched = indexed_slices_lazy_adam_update(
                    model.as_f32_mut()?,
                    m.as_f32_mut()?,
                    v.as_f32_mut()?,
                    &unique_rows(&slices),
                    RowRange::all(slices.rows()),
                    &params,
                )?;
                log::trace!("{}: lazy adam touched {touched} rows", op.name);
                self.commit([(&conf.model, model), (&conf.m, m), (&conf.v, v)]);
                return Ok(None);
            }
            OpConf::RmsPropUpdate(conf) => {
                let params = RmsPropParams {
                    learning_rate: inputs.scalar(&conf.learning_rate)?,
                    decay_rate: conf.decay_rate,
                    epsilon: conf.epsilon,
                    weight_decay: conf.weight_decay,
                };
                let diff = inputs.value(&conf.model_diff)?.to_dense()?;
                let mut model = self.stored(&conf.model.op_name)?.clone();
                let mut mean_square = self.stored(&conf.mean_square.op_name)?.clone();
                rms_prop_update(model.as_f32_mut()?, mean_square.as_f32_mut()?, diff.as_f32()?, &params)?;
                self.commit([(&conf.model, model), (&conf.mean_square, mean_square)]);
                return Ok(None);
            }
            OpConf::LarsUpdate(conf) => {
                let params = LarsParams {
                    learning_rate: inputs.scalar(&conf.learning_rate)?,
                    momentum_beta: conf.momentum_beta,
                    epsilon: conf.epsilon,
                    lars_coefficient: conf.lars_coefficient,
                    weight_decay: conf.weight_decay,
                };
                let diff = inputs.value(&conf.model_diff)?.to_dense()?;
                let mut model = self.stored(&conf.model.op_name)?.clone();
                let mut momentum = self.stored(&conf.momentum.op_name)?.clone();
                lars_update(model.as_f32_mut()?, momentum.as_f32_mut()?, diff.as_f32()?, &params)?;
                self.commit([(&conf.model, model), (&conf.momentum, momentum)]);
                return Ok(None);
            }
            OpConf::IndexedSlicesToDense(conf) => Value::Dense(inputs.value(&conf.input)?.to_dense()?),
        };
        Ok(Some(out))
    }

    fn stored(&self, name: &str) -> Result<&HostTensor> {
        self.variables
            .get(name)
            .ok_or_else(|| anyhow!("variable `{name}` was not initialized"))
    }

    fn stored_mut(&mut self, name: &str) -> Result<&mut HostTensor> {
        self.variables
            .get_mut(name)
            .ok_or_else(|| anyhow!("variable `{name}` was not initialized"))
    }

    /// Writes updated tensors back once every kernel of an update op succeeded.
    fn commit<const N: usize>(&mut self, updated: [(&LogicalBlobId, HostTensor); N]) {
        for (lbi, tensor) in updated {
            self.variables.insert(lbi.op_name.clone(), tensor);
        }
    }
}

/// Values already produced during the current step.
struct StepInputs<'v>(&'v HashMap<LogicalBlobId, Value>);

impl<'v> StepInputs<'v> {
    fn value(&self, lbi: &LogicalBlobId) -> Result<&'v Value> {
        self.0
            .get(lbi)
            .ok_or_else(|| anyhow!("input {lbi} has not been produced"))
    }

    fn dense(&self, lbi: &LogicalBlobId) -> Result<&'v HostTensor> {
        self.value(lbi)?
            .as_dense()
            .ok_or_else(|| anyhow!("input {lbi} is indexed slices, expected a dense tensor"))
    }

    fn scalar(&self, lbi: &LogicalBlobId) -> Result<f32> {
        Ok(self.dense(lbi)?.scalar_value()?)
    }
}

fn init_variable(name: &str, conf: &VariableOpConf) -> Result<HostTensor> {
    let len: usize = conf.shape.iter().product();
    let tensor = match &conf.initializer {
        Initializer::Zeros => HostTensor::zeros(conf.shape.clone(), conf.dtype),
        Initializer::Constant { value } if conf.dtype.is_float() => {
            HostTensor::full(conf.shape.clone(), *value)
        }
        Initializer::Constant { value } => HostTensor::i64(conf.shape.clone(), vec![*value as i64; len]),
        Initializer::Values { values } => {
            if values.len() != len {
                bail!(
                    "variable `{name}` has {} initial values for shape {:?}",
                    values.len(),
                    conf.shape
                );
            }
            if conf.dtype.is_float() {
                HostTensor::f32(conf.shape.clone(), values.clone())
            } else {
                HostTensor::i64(conf.shape.clone(), values.iter().map(|v| *v as i64).collect())
            }
        }
    };
    Ok(tensor)
}

fn value_shape(value: &Value) -> Vec<usize> {
    match value {
        Value::Dense(tensor) => tensor.shape.clone(),
        Value::Slices(slices) => slices.dense_shape.clone(),
    }
}

fn map_value(value: &Value, f: impl Fn(f32) -> f32) -> Result<Value, KernelError> {
    Ok(match value {
        Value::Dense(tensor) => Value::Dense(math::map(tensor, f)?),
        Value::Slices(slices) => Value::Slices(slices.map_values(f)),
    })
}

fn sparse(value: &Value) -> Result<&IndexedSlices> {
    value
        .as_slices()
        .ok_or_else(|| anyhow!("sparse update received a dense gradient"))
}

fn train_step(tensor: &HostTensor) -> Result<i64> {
    tensor
        .as_i64()?
        .first()
        .copied()
        .ok_or_else(|| anyhow!("train step counter is empty"))
}

/// Folds repeated indices so each row is visited once.
fn reduce_slices(slices: &IndexedSlices) -> Result<IndexedSlices, KernelError> {
    let n = slices.indices.len();
    let mut workspace = ReduceSumWorkspace::new(ReduceSum::workspace_len(n, slices.row_len()));
    let mut indices = vec![0i64; n];
    let mut values = vec![0.0f32; slices.values.len()];
    let output = ReduceSum::reduce_sum(
        &slices.indices,
        &slices.values,
        &mut indices,
        &mut values,
        &mut workspace,
    )?;
    indices.truncate(output.num_unique);
    values.truncate(output.num_unique * output.row_len);
    Ok(IndexedSlices {
        indices,
        values,
        dense_shape: slices.dense_shape.clone(),
    })
}

fn unique_rows(slices: &IndexedSlices) -> UniqueRows<'_, i64, f32> {
    UniqueRows {
        indices: &slices.indices,
        values: &slices.values,
        row_len: slices.row_len(),
    }
}

fn l1_l2(model: f32, diff: f32, l1: f32, l2: f32) -> f32 {
    let sign = if model > 0.0 {
        1.0
    } else if model < 0.0 {
        -1.0
    } else {
        0.0
    };
    diff + l1 * sign + l2 * model
}

fn regularize(
    conf: &L1L2RegularizeGradientOpConf,
    model: &HostTensor,
    diff: &Value,
) -> Result<Value, KernelError> {
    let weights = model.as_f32()?;
    match diff {
        Value::Dense(tensor) => {
            if tensor.shape != model.shape {
                return Err(KernelError::ShapeMismatch {
                    op: "l1_l2_regularize_gradient",
                    expected: model.shape.clone(),
                    actual: tensor.shape.clone(),
                });
            }
            let out = weights
                .iter()
                .zip(tensor.as_f32()?)
                .map(|(w, g)| l1_l2(*w, *g, conf.l1, conf.l2))
                .collect();
            Ok(Value::Dense(HostTensor::f32(tensor.shape.clone(), out)))
        }
        Value::Slices(slices) => {
            let mut reduced = reduce_slices(slices)?;
            let row_len = reduced.row_len();
            let rows = reduced.rows();
            for (pos, index) in reduced.indices.iter().enumerate() {
                let row = usize::try_from(*index)
                    .ok()
                    .filter(|row| *row < rows)
                    .ok_or(KernelError::IndexOutOfRange { index: *index, rows })?;
                let model_row = &weights[row * row_len..(row + 1) * row_len];
                for (g, w) in reduced.values[pos * row_len..(pos + 1) * row_len]
                    .iter_mut()
                    .zip(model_row)
                {
                    *g = l1_l2(*w, *g, conf.l1, conf.l2);
                }
            }
            Ok(Value::Slices(reduced))
        }
    }
}

fn sgd_params(conf: &SgdUpdateOpConf, learning_rate: f32) -> SgdParams<f32> {
    SgdParams {
        learning_rate,
        weight_decay: conf.weight_decay,
    }
}

fn momentum_params(conf: &MomentumUpdateOpConf, learning_rate: f32) -> MomentumParams<f32> {
    MomentumParams {
        learning_rate,
        beta: conf.beta,
        weight_decay: conf.weight_decay,
    }
}

fn adam_params(conf: &AdamUpdateOpConf, learning_rate: f32, train_step: i64) -> AdamParams<f32> {
    AdamParams {
        learning_rate,
        beta1: conf.beta1,
        beta2: conf.beta2,
        epsilon: conf.epsilon,
        weight_decay: conf.weight_decay,
        do_bias_correction: conf.do_bias_correction,
        train_step,
    }
}
