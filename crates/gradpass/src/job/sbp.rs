use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Data distribution of one logical tensor across the devices of its placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SbpParallel {
    /// Each device holds a slice along `axis`.
    Split { axis: usize },
    /// Each device holds a full copy.
    Broadcast,
    /// Each device holds a partial value; the logical tensor is their sum.
    PartialSum,
}

impl SbpParallel {
    pub fn split(axis: usize) -> Self {
        SbpParallel::Split { axis }
    }

    pub fn is_split(&self) -> bool {
        matches!(self, SbpParallel::Split { .. })
    }
}

impl fmt::Display for SbpParallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbpParallel::Split { axis } => write!(f, "S({axis})"),
            SbpParallel::Broadcast => write!(f, "B"),
            SbpParallel::PartialSum => write!(f, "P"),
        }
    }
}

/// Per-port SBP assignment of one operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbpSignature {
    #[serde(default)]
    pub bn_in_op2sbp_parallel: BTreeMap<String, SbpParallel>,
}

impl SbpSignature {
    pub fn with(mut self, bn: impl Into<String>, sbp: SbpParallel) -> Self {
        self.bn_in_op2sbp_parallel.insert(bn.into(), sbp);
        self
    }

    pub fn get(&self, bn: &str) -> Option<&SbpParallel> {
        self.bn_in_op2sbp_parallel.get(bn)
    }
}
