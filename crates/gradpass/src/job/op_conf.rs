//! Operator configurations.
//!
//! Every operator has a unique name and a typed configuration. Inputs are referenced by
//! [`LogicalBlobId`]; outputs are implicit: output blob `bn` of operator `name` is always
//! the tensor `name/bn`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::lbi::LogicalBlobId;
use crate::job::sbp::SbpParallel;
use crate::job::DType;
use crate::train::conf::RegularizerConf;
use crate::train::schedule::LrScheduleConf;

/// Output blob name shared by all single-output builtin operators.
pub const OUT: &str = "out";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConf {
    pub name: String,
    #[serde(flatten)]
    pub op_type: OpConf,
}

impl OperatorConf {
    pub fn new(name: impl Into<String>, op_type: OpConf) -> Self {
        Self {
            name: name.into(),
            op_type,
        }
    }

    pub fn op_type_name(&self) -> &str {
        self.op_type.op_type_name()
    }

    /// Ordered `(input blob name, tensor)` pairs.
    pub fn input_ports(&self) -> Vec<(String, &LogicalBlobId)> {
        self.op_type.input_ports()
    }

    pub fn input_bns(&self) -> Vec<String> {
        self.input_ports().into_iter().map(|(bn, _)| bn).collect()
    }

    pub fn output_bns(&self) -> Vec<String> {
        self.op_type.output_bns()
    }

    /// Resolves an input or output blob name to the tensor bound to it.
    pub fn bn_in_op2lbi(&self, bn: &str) -> Option<LogicalBlobId> {
        if let Some((_, lbi)) = self.input_ports().into_iter().find(|(ibn, _)| ibn == bn) {
            return Some(lbi.clone());
        }
        self.output_bns()
            .iter()
            .any(|obn| obn == bn)
            .then(|| LogicalBlobId::new(self.name.clone(), bn))
    }

    pub fn output_lbi(&self, obn: &str) -> LogicalBlobId {
        LogicalBlobId::new(self.name.clone(), obn)
    }

    pub fn output_lbis(&self) -> Vec<LogicalBlobId> {
        self.output_bns()
            .iter()
            .map(|obn| self.output_lbi(obn))
            .collect()
    }

    /// Returns the configuration of a variable operator.
    pub fn as_variable(&self) -> Option<&VariableOpConf> {
        match &self.op_type {
            OpConf::Variable(conf) => Some(conf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpConf {
    // forward
    Variable(VariableOpConf),
    Input(InputOpConf),
    Matmul(MatmulOpConf),
    Add(AddOpConf),
    Multiply(BinaryOpConf),
    Relu(UnaryOpConf),
    Gather(GatherOpConf),
    ReduceSum(ReduceSumOpConf),
    Identity(UnaryOpConf),
    ScalarMul(ScalarOpConf),
    Argmax(UnaryOpConf),
    User(UserOpConf),
    // backward
    ConstantLike(ConstantLikeOpConf),
    ReluGrad(ReluGradOpConf),
    BroadcastLike(BroadcastLikeOpConf),
    UnsortedSegmentSum(UnsortedSegmentSumOpConf),
    IndexedSlicesFromGather(IndexedSlicesFromGatherOpConf),
    // gradient pipeline
    ParallelCast(ParallelCastOpConf),
    TotalLossInstanceNum(TotalLossInstanceNumOpConf),
    ScalarDivByTensor(ScalarByTensorOpConf),
    ScalarDiv(ScalarOpConf),
    ScalarMulByTensor(ScalarByTensorOpConf),
    L1L2RegularizeGradient(L1L2RegularizeGradientOpConf),
    ClipByValue(ClipByValueOpConf),
    SquareSum(UnaryOpConf),
    GlobalNormClipFactor(GlobalNormClipFactorOpConf),
    // optimizer
    LearningRate(LearningRateOpConf),
    IncrementTrainStep(IncrementTrainStepOpConf),
    SgdUpdate(SgdUpdateOpConf),
    MomentumUpdate(MomentumUpdateOpConf),
    AdamUpdate(AdamUpdateOpConf),
    RmsPropUpdate(RmsPropUpdateOpConf),
    LarsUpdate(LarsUpdateOpConf),
    IndexedSlicesSgdUpdate(SgdUpdateOpConf),
    IndexedSlicesMomentumUpdate(MomentumUpdateOpConf),
    IndexedSlicesLazyAdamUpdate(AdamUpdateOpConf),
    IndexedSlicesToDense(IndexedSlicesToDenseOpConf),
}

impl OpConf {
    pub fn op_type_name(&self) -> &str {
        match self {
            OpConf::Variable(_) => "variable",
            OpConf::Input(_) => "input",
            OpConf::Matmul(_) => "matmul",
            OpConf::Add(_) => "add",
            OpConf::Multiply(_) => "multiply",
            OpConf::Relu(_) => "relu",
            OpConf::Gather(_) => "gather",
            OpConf::ReduceSum(_) => "reduce_sum",
            OpConf::Identity(_) => "identity",
            OpConf::ScalarMul(_) => "scalar_mul",
            OpConf::Argmax(_) => "argmax",
            OpConf::User(conf) => &conf.op_type_name,
            OpConf::ConstantLike(_) => "constant_like",
            OpConf::ReluGrad(_) => "relu_grad",
            OpConf::BroadcastLike(_) => "broadcast_like",
            OpConf::UnsortedSegmentSum(_) => "unsorted_segment_sum",
            OpConf::IndexedSlicesFromGather(_) => "indexed_slices_from_gather",
            OpConf::ParallelCast(_) => "parallel_cast",
            OpConf::TotalLossInstanceNum(_) => "total_loss_instance_num",
            OpConf::ScalarDivByTensor(_) => "scalar_div_by_tensor",
            OpConf::ScalarDiv(_) => "scalar_div",
            OpConf::ScalarMulByTensor(_) => "scalar_mul_by_tensor",
            OpConf::L1L2RegularizeGradient(_) => "l1_l2_regularize_gradient",
            OpConf::ClipByValue(_) => "clip_by_value",
            OpConf::SquareSum(_) => "square_sum",
            OpConf::GlobalNormClipFactor(_) => "global_norm_clip_factor",
            OpConf::LearningRate(_) => "learning_rate",
            OpConf::IncrementTrainStep(_) => "increment_train_step",
            OpConf::SgdUpdate(_) => "sgd_update",
            OpConf::MomentumUpdate(_) => "momentum_update",
            OpConf::AdamUpdate(_) => "adam_update",
            OpConf::RmsPropUpdate(_) => "rms_prop_update",
            OpConf::LarsUpdate(_) => "lars_update",
            OpConf::IndexedSlicesSgdUpdate(_) => "indexed_slices_sgd_update",
            OpConf::IndexedSlicesMomentumUpdate(_) => "indexed_slices_momentum_update",
            OpConf::IndexedSlicesLazyAdamUpdate(_) => "indexed_slices_lazy_adam_update",
            OpConf::IndexedSlicesToDense(_) => "indexed_slices_to_dense",
        }
    }

    fn input_ports(&self) -> Vec<(String, &LogicalBlobId)> {
        fn port<'a>(bn: &str, lbi: &'a LogicalBlobId) -> (String, &'a LogicalBlobId) {
            (bn.to_string(), lbi)
        }
        match self {
            OpConf::Variable(_) | OpConf::Input(_) => Vec::new(),
            OpConf::Matmul(conf) => vec![port("a", &conf.a), port("b", &conf.b)],
            OpConf::Add(conf) => conf
                .inputs
                .iter()
                .enumerate()
                .map(|(i, lbi)| (format!("in_{i}"), lbi))
                .collect(),
            OpConf::Multiply(conf) => vec![port("x", &conf.x), port("y", &conf.y)],
            OpConf::Relu(conf)
            | OpConf::Identity(conf)
            | OpConf::Argmax(conf)
            | OpConf::SquareSum(conf) => vec![port("in", &conf.input)],
            OpConf::Gather(conf) => vec![port("in", &conf.input), port("indices", &conf.indices)],
            OpConf::ReduceSum(conf) => vec![port("in", &conf.input)],
            OpConf::ScalarMul(conf) | OpConf::ScalarDiv(conf) => vec![port("in", &conf.input)],
            OpConf::User(conf) => conf
                .input
                .iter()
                .map(|(bn, lbi)| (bn.clone(), lbi))
                .collect(),
            OpConf::ConstantLike(conf) => vec![port("like", &conf.like)],
            OpConf::ReluGrad(conf) => vec![port("y", &conf.y), port("dy", &conf.dy)],
            OpConf::BroadcastLike(conf) => vec![port("x", &conf.x), port("like", &conf.like)],
            OpConf::UnsortedSegmentSum(conf) => vec![
                port("data", &conf.data),
                port("segment_ids", &conf.segment_ids),
                port("like", &conf.like),
            ],
            OpConf::IndexedSlicesFromGather(conf) => vec![
                port("indices", &conf.indices),
                port("values", &conf.values),
                port("like", &conf.like),
            ],
            OpConf::ParallelCast(conf) => vec![port("in", &conf.input)],
            OpConf::TotalLossInstanceNum(conf) => conf
                .losses
                .iter()
                .enumerate()
                .map(|(i, lbi)| (format!("loss_{i}"), lbi))
                .collect(),
            OpConf::ScalarDivByTensor(conf) | OpConf::ScalarMulByTensor(conf) => {
                vec![port("in", &conf.input), port("scalar", &conf.scalar)]
            }
            OpConf::L1L2RegularizeGradient(conf) => vec![
                port("model", &conf.model),
                port("model_diff", &conf.model_diff),
            ],
            OpConf::ClipByValue(conf) => vec![port("in", &conf.input)],
            OpConf::GlobalNormClipFactor(conf) => conf
                .square_sum
                .iter()
                .map(|lbi| port("square_sum", lbi))
                .collect(),
            OpConf::LearningRate(conf) => vec![port("train_step", &conf.train_step)],
            OpConf::IncrementTrainStep(conf) => vec![port("train_step", &conf.train_step)],
            OpConf::SgdUpdate(conf) | OpConf::IndexedSlicesSgdUpdate(conf) => vec![
                port("model", &conf.model),
                port("model_diff", &conf.model_diff),
                port("learning_rate", &conf.learning_rate),
            ],
            OpConf::MomentumUpdate(conf) | OpConf::IndexedSlicesMomentumUpdate(conf) => vec![
                port("model", &conf.model),
                port("model_diff", &conf.model_diff),
                port("learning_rate", &conf.learning_rate),
                port("momentum", &conf.momentum),
            ],
            OpConf::AdamUpdate(conf) | OpConf::IndexedSlicesLazyAdamUpdate(conf) => vec![
                port("model", &conf.model),
                port("model_diff", &conf.model_diff),
                port("learning_rate", &conf.learning_rate),
                port("train_step", &conf.train_step),
                port("m", &conf.m),
                port("v", &conf.v),
            ],
            OpConf::RmsPropUpdate(conf) => vec![
                port("model", &conf.model),
                port("model_diff", &conf.model_diff),
                port("learning_rate", &conf.learning_rate),
                port("mean_square", &conf.mean_square),
            ],
            OpConf::LarsUpdate(conf) => vec![
                port("model", &conf.model),
                port("model_diff", &conf.model_diff),
                port("learning_rate", &conf.learning_rate),
                port("momentum", &conf.momentum),
            ],
            OpConf::IndexedSlicesToDense(conf) => {
                vec![port("in", &conf.input), port("like", &conf.like)]
            }
        }
    }

    fn output_bns(&self) -> Vec<String> {
        match self {
            OpConf::User(conf) => conf.output.clone(),
            OpConf::IncrementTrainStep(_)
            | OpConf::SgdUpdate(_)
            | OpConf::MomentumUpdate(_)
            | OpConf::AdamUpdate(_)
            | OpConf::RmsPropUpdate(_)
            | OpConf::LarsUpdate(_)
            | OpConf::IndexedSlicesSgdUpdate(_)
            | OpConf::IndexedSlicesMomentumUpdate(_)
            | OpConf::IndexedSlicesLazyAdamUpdate(_) => Vec::new(),
            _ => vec![OUT.to_string()],
        }
    }

    /// Whether the operator mutates model state instead of producing tensors.
    pub fn is_model_update(&self) -> bool {
        matches!(
            self,
            OpConf::SgdUpdate(_)
                | OpConf::MomentumUpdate(_)
                | OpConf::AdamUpdate(_)
                | OpConf::RmsPropUpdate(_)
                | OpConf::LarsUpdate(_)
                | OpConf::IndexedSlicesSgdUpdate(_)
                | OpConf::IndexedSlicesMomentumUpdate(_)
                | OpConf::IndexedSlicesLazyAdamUpdate(_)
        )
    }
}

/// Initial value of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    #[default]
    Zeros,
    Constant {
        value: f32,
    },
    /// Explicit row-major values; length must equal the element count.
    Values {
        values: Vec<f32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableOpConf {
    pub shape: Vec<usize>,
    #[serde(default = "DType::default_float")]
    pub dtype: DType,
    #[serde(default)]
    pub initializer: Initializer,
    /// Model-parallel split axis; `None` means the variable is broadcast.
    #[serde(default)]
    pub split_axis: Option<usize>,
    #[serde(default = "default_true")]
    pub trainable: bool,
    #[serde(default)]
    pub regularizer: Option<RegularizerConf>,
}

impl VariableOpConf {
    pub fn new(shape: impl Into<Vec<usize>>, initializer: Initializer) -> Self {
        Self {
            shape: shape.into(),
            dtype: DType::F32,
            initializer,
            split_axis: None,
            trainable: true,
            regularizer: None,
        }
    }

    /// SBP the model keeps on its own placement.
    pub fn model_sbp(&self) -> SbpParallel {
        match self.split_axis {
            Some(axis) => SbpParallel::split(axis),
            None => SbpParallel::Broadcast,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputOpConf {
    pub shape: Vec<usize>,
    #[serde(default = "DType::default_float")]
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatmulOpConf {
    pub a: LogicalBlobId,
    pub b: LogicalBlobId,
    #[serde(default)]
    pub transpose_a: bool,
    #[serde(default)]
    pub transpose_b: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOpConf {
    pub inputs: Vec<LogicalBlobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryOpConf {
    pub x: LogicalBlobId,
    pub y: LogicalBlobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryOpConf {
    #[serde(rename = "in")]
    pub input: LogicalBlobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatherOpConf {
    /// Gathered table, indexed along axis 0.
    #[serde(rename = "in")]
    pub input: LogicalBlobId,
    pub indices: LogicalBlobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceSumOpConf {
    #[serde(rename = "in")]
    pub input: LogicalBlobId,
    pub axes: Vec<usize>,
    #[serde(default)]
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarOpConf {
    #[serde(rename = "in")]
    pub input: LogicalBlobId,
    pub operand: f32,
}

/// Operator outside the builtin set, identified by its type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserOpConf {
    pub op_type_name: String,
    #[serde(default)]
    pub input: BTreeMap<String, LogicalBlobId>,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub attr: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantLikeOpConf {
    pub like: LogicalBlobId,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReluGradOpConf {
    pub y: LogicalBlobId,
    pub dy: LogicalBlobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastLikeOpConf {
    pub x: LogicalBlobId,
    pub like: LogicalBlobId,
    pub broadcast_axes: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsortedSegmentSumOpConf {
    pub data: LogicalBlobId,
    pub segment_ids: LogicalBlobId,
    /// Tensor whose shape the result takes; the segment count is its first dimension.
    pub like: LogicalBlobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedSlicesFromGatherOpConf {
    pub indices: LogicalBlobId,
    pub values: LogicalBlobId,
    /// Gathered table; gives the dense shape of the slices.
    pub like: LogicalBlobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelCastOpConf {
    #[serde(rename = "in")]
    pub input: LogicalBlobId,
    #[serde(default)]
    pub sbp_parallel: Option<SbpParallel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalLossInstanceNumOpConf {
    pub losses: Vec<LogicalBlobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarByTensorOpConf {
    #[serde(rename = "in")]
    pub input: LogicalBlobId,
    pub scalar: LogicalBlobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L1L2RegularizeGradientOpConf {
    pub model: LogicalBlobId,
    pub model_diff: LogicalBlobId,
    pub l1: f32,
    pub l2: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipByValueOpConf {
    #[serde(rename = "in")]
    pub input: LogicalBlobId,
    pub min: f32,
    pub max: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalNormClipFactorOpConf {
    /// Total squared norm of all gradients; absent when `global_norm` is given.
    #[serde(default)]
    pub square_sum: Option<LogicalBlobId>,
    pub clip_norm: f32,
    #[serde(default)]
    pub global_norm: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRateOpConf {
    pub train_step: LogicalBlobId,
    pub schedule: LrScheduleConf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementTrainStepOpConf {
    pub train_step: LogicalBlobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdUpdateOpConf {
    pub model: LogicalBlobId,
    pub model_diff: LogicalBlobId,
    pub learning_rate: LogicalBlobId,
    #[serde(default)]
    pub weight_decay: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumUpdateOpConf {
    pub model: LogicalBlobId,
    pub model_diff: LogicalBlobId,
    pub learning_rate: LogicalBlobId,
    pub momentum: LogicalBlobId,
    pub beta: f32,
    #[serde(default)]
    pub weight_decay: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamUpdateOpConf {
    pub model: LogicalBlobId,
    pub model_diff: LogicalBlobId,
    pub learning_rate: LogicalBlobId,
    pub train_step: LogicalBlobId,
    pub m: LogicalBlobId,
    pub v: LogicalBlobId,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub do_bias_correction: bool,
    #[serde(default)]
    pub weight_decay: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmsPropUpdateOpConf {
    pub model: LogicalBlobId,
    pub model_diff: LogicalBlobId,
    pub learning_rate: LogicalBlobId,
    pub mean_square: LogicalBlobId,
    pub decay_rate: f32,
    pub epsilon: f32,
    #[serde(default)]
    pub weight_decay: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LarsUpdateOpConf {
    pub model: LogicalBlobId,
    pub model_diff: LogicalBlobId,
    pub learning_rate: LogicalBlobId,
    pub momentum: LogicalBlobId,
    pub momentum_beta: f32,
    pub epsilon: f32,
    pub lars_coefficient: f32,
    #[serde(default)]
    pub weight_decay: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedSlicesToDenseOpConf {
    #[serde(rename = "in")]
    pub input: LogicalBlobId,
    pub like: LogicalBlobId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_ports_are_numbered() {
        let op = OperatorConf::new(
            "sum",
            OpConf::Add(AddOpConf {
                inputs: vec![LogicalBlobId::new("a", OUT), LogicalBlobId::new("b", OUT)],
            }),
        );
        assert_eq!(op.input_bns(), vec!["in_0", "in_1"]);
        assert_eq!(op.bn_in_op2lbi("in_1"), Some(LogicalBlobId::new("b", OUT)));
        assert_eq!(op.bn_in_op2lbi(OUT), Some(LogicalBlobId::new("sum", OUT)));
        assert_eq!(op.bn_in_op2lbi("missing"), None);
    }

    #[test]
    fn update_ops_have_no_outputs() {
        let op = OperatorConf::new(
            "w-sgd",
            OpConf::SgdUpdate(SgdUpdateOpConf {
                model: LogicalBlobId::new("w", OUT),
                model_diff: LogicalBlobId::new("w-diff", OUT),
                learning_rate: LogicalBlobId::new("lr", OUT),
                weight_decay: 0.0,
            }),
        );
        assert!(op.output_bns().is_empty());
        assert!(op.op_type.is_model_update());
    }

    #[test]
    fn op_conf_json_uses_op_type_key() {
        let op = OperatorConf::new(
            "relu",
            OpConf::Relu(UnaryOpConf {
                input: LogicalBlobId::new("fc", OUT),
            }),
        );
        let json = serde_json::to_value(&op).expect("serialize op");
        assert_eq!(json["name"], "relu");
        assert_eq!(json["relu"]["in"], "fc/out");
        let back: OperatorConf = serde_json::from_value(json).expect("deserialize op");
        assert_eq!(back, op);
    }
}
