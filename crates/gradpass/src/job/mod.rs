//! Job definition: the serialized operator list plus its placement, SBP and helper tables.

pub mod lbi;
pub mod op_conf;
pub mod sbp;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::train::conf::TrainConf;

pub use lbi::{LbiPair, LogicalBlobId, OpBlobArg, OpBlobArgPair};
pub use op_conf::{OpConf, OperatorConf};
pub use sbp::{SbpParallel, SbpSignature};

/// Helper relation tag under which the pass publishes `lbi -> diff lbi`.
pub const PRODUCED_LBI2CONSUMED_DIFF_LBI: &str = "produced_lbi2consumed_diff_lbi";
/// Helper relation tag mapping each trained variable to the gradient its update consumes.
pub const MODEL_LBI2FINAL_DIFF_LBI: &str = "model_lbi2final_diff_lbi";

/// Element types a logical blob may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    I32,
    I64,
}

impl DType {
    pub(crate) fn default_float() -> Self {
        DType::F32
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }
}

/// Static shape and dtype of one logical tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalBlobDesc {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl LogicalBlobDesc {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Device set an operator runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConf {
    #[serde(default = "default_device_tag")]
    pub device_tag: String,
    #[serde(default = "default_parallel_num")]
    pub parallel_num: usize,
}

impl ParallelConf {
    pub fn new(device_tag: impl Into<String>, parallel_num: usize) -> Self {
        Self {
            device_tag: device_tag.into(),
            parallel_num,
        }
    }
}

impl Default for ParallelConf {
    fn default() -> Self {
        Self {
            device_tag: default_device_tag(),
            parallel_num: default_parallel_num(),
        }
    }
}

fn default_device_tag() -> String {
    "cpu".to_string()
}

fn default_parallel_num() -> usize {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default)]
    pub default_parallel_conf: ParallelConf,
    #[serde(default)]
    pub op_name2parallel_conf: BTreeMap<String, ParallelConf>,
}

impl Placement {
    pub fn parallel_conf4op_name(&self, op_name: &str) -> &ParallelConf {
        self.op_name2parallel_conf
            .get(op_name)
            .unwrap_or(&self.default_parallel_conf)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParallelViewConf {
    #[serde(default)]
    pub op_name2sbp_signature: BTreeMap<String, SbpSignature>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobHelperConf {
    #[serde(default)]
    pub tag2lbi_relations: BTreeMap<String, Vec<LbiPair>>,
    #[serde(default)]
    pub identical_sbp_oba_pairs: Vec<OpBlobArgPair>,
    #[serde(default)]
    pub lbn2logical_blob_desc: BTreeMap<LogicalBlobId, LogicalBlobDesc>,
    /// Passes that already rewrote this job.
    #[serde(default)]
    pub completed_passes: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_name: String,
    #[serde(default)]
    pub train_conf: Option<TrainConf>,
}

impl JobConfig {
    pub fn is_train(&self) -> bool {
        self.train_conf.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_conf: JobConfig,
    #[serde(default)]
    pub net: Vec<OperatorConf>,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub sbp_conf: JobParallelViewConf,
    #[serde(default)]
    pub helper: JobHelperConf,
}

impl Job {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse job definition")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read job file {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in job file {}", path.display()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize job definition")
    }

    pub fn op_conf(&self, op_name: &str) -> Option<&OperatorConf> {
        self.net.iter().find(|op| op.name == op_name)
    }

    pub fn is_train(&self) -> bool {
        self.job_conf.is_train()
    }

    pub fn lbi_relation(&self, tag: &str, lbi: &LogicalBlobId) -> Option<&LogicalBlobId> {
        self.helper
            .tag2lbi_relations
            .get(tag)?
            .iter()
            .find(|pair| &pair.first == lbi)
            .map(|pair| &pair.second)
    }

    /// Raw autograd diff of `lbi` published by a completed backward pass.
    pub fn diff_lbi4lbi(&self, lbi: &LogicalBlobId) -> Option<&LogicalBlobId> {
        self.lbi_relation(PRODUCED_LBI2CONSUMED_DIFF_LBI, lbi)
    }

    /// Gradient consumed by the update of variable output `lbi`, after all rewrites.
    pub fn final_model_diff4lbi(&self, lbi: &LogicalBlobId) -> Option<&LogicalBlobId> {
        self.lbi_relation(MODEL_LBI2FINAL_DIFF_LBI, lbi)
    }
}
