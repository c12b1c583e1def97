use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::job::LogicalBlobId;
use crate::train::schedule::LrScheduleConf;

/// Training-mode configuration; its presence on a job turns training on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConf {
    /// Loss tensors the backward pass differentiates.
    pub loss_lbn: Vec<LogicalBlobId>,
    pub model_update_conf: ModelUpdateConf,
    #[serde(default = "default_loss_scale_factor")]
    pub loss_scale_factor: f32,
    /// Regularizer applied to variables that do not configure their own.
    #[serde(default)]
    pub default_regularizer: Option<RegularizerConf>,
    #[serde(default)]
    pub indexed_slices_optimizer_conf: IndexedSlicesOptimizerConf,
}

impl TrainConf {
    pub fn new(loss_lbn: Vec<LogicalBlobId>, model_update_conf: ModelUpdateConf) -> Self {
        Self {
            loss_lbn,
            model_update_conf,
            loss_scale_factor: default_loss_scale_factor(),
            default_regularizer: None,
            indexed_slices_optimizer_conf: IndexedSlicesOptimizerConf::default(),
        }
    }

    /// Rejects settings that would turn every gradient into zero, inf or NaN.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.loss_scale_factor.is_finite() && self.loss_scale_factor > 0.0,
            "loss_scale_factor must be finite and positive, got {}",
            self.loss_scale_factor
        );
        Ok(())
    }
}

fn default_loss_scale_factor() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdateConf {
    pub optimizer: OptimizerConf,
    pub learning_rate: LrScheduleConf,
    /// Decoupled weight decay passed to every update op.
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default)]
    pub clip_conf: Option<ClipConf>,
}

impl ModelUpdateConf {
    pub fn new(optimizer: OptimizerConf, learning_rate: LrScheduleConf) -> Self {
        Self {
            optimizer,
            learning_rate,
            weight_decay: 0.0,
            clip_conf: None,
        }
    }
}

/// Update rule and its hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConf {
    Sgd,
    Momentum {
        beta: f32,
    },
    Adam {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        #[serde(default = "default_true")]
        do_bias_correction: bool,
    },
    /// Adam that only advances state for rows present in a sparse gradient.
    LazyAdam {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        #[serde(default = "default_true")]
        do_bias_correction: bool,
    },
    RmsProp {
        decay_rate: f32,
        epsilon: f32,
    },
    Lars {
        momentum_beta: f32,
        epsilon: f32,
        lars_coefficient: f32,
    },
}

impl OptimizerConf {
    pub fn adam() -> Self {
        OptimizerConf::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            do_bias_correction: true,
        }
    }

    pub fn lazy_adam() -> Self {
        OptimizerConf::LazyAdam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            do_bias_correction: true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConf::Sgd => "sgd",
            OptimizerConf::Momentum { .. } => "momentum",
            OptimizerConf::Adam { .. } => "adam",
            OptimizerConf::LazyAdam { .. } => "lazy_adam",
            OptimizerConf::RmsProp { .. } => "rms_prop",
            OptimizerConf::Lars { .. } => "lars",
        }
    }

    /// Whether the optimizer has an update op consuming indexed slices directly.
    pub fn supports_indexed_slices(&self) -> bool {
        matches!(
            self,
            OptimizerConf::Sgd | OptimizerConf::Momentum { .. } | OptimizerConf::LazyAdam { .. }
        )
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipConf {
    ClipByGlobalNorm {
        clip_norm: f32,
        /// Precomputed global norm; when absent it is computed from the gradients.
        #[serde(default)]
        global_norm: Option<f32>,
    },
    ClipByValue {
        min: f32,
        max: f32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegularizerConf {
    #[serde(default)]
    pub l1: f32,
    #[serde(default)]
    pub l2: f32,
}

impl RegularizerConf {
    pub fn is_noop(&self) -> bool {
        self.l1 == 0.0 && self.l2 == 0.0
    }
}

/// Selects which embedding-style variables receive indexed-slices gradients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexedSlicesOptimizerConf {
    #[serde(default)]
    pub enable: bool,
    /// Variable names eligible; empty means every variable.
    #[serde(default)]
    pub include_op_names: Vec<String>,
    #[serde(default)]
    pub exclude_op_names: Vec<String>,
}

impl IndexedSlicesOptimizerConf {
    pub fn is_enabled_for(&self, variable_op_name: &str) -> bool {
        if !self.enable {
            return false;
        }
        if self.exclude_op_names.iter().any(|name| name == variable_op_name) {
            return false;
        }
        self.include_op_names.is_empty()
            || self.include_op_names.iter().any(|name| name == variable_op_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_slices_include_exclude() {
        let conf = IndexedSlicesOptimizerConf {
            enable: true,
            include_op_names: vec!["embedding".into(), "other".into()],
            exclude_op_names: vec!["other".into()],
        };
        assert!(conf.is_enabled_for("embedding"));
        assert!(!conf.is_enabled_for("other"));
        assert!(!conf.is_enabled_for("fc_weight"));

        let disabled = IndexedSlicesOptimizerConf::default();
        assert!(!disabled.is_enabled_for("embedding"));
    }

    #[test]
    fn optimizer_conf_is_tagged_by_kind() {
        let conf: OptimizerConf =
            serde_json::from_str(r#"{"kind": "momentum", "beta": 0.9}"#).expect("parse");
        assert_eq!(conf, OptimizerConf::Momentum { beta: 0.9 });
        let adam: OptimizerConf =
            serde_json::from_str(r#"{"kind": "adam", "beta1": 0.9, "beta2": 0.99, "epsilon": 1e-6}"#)
                .expect("parse");
        assert!(matches!(
            adam,
            OptimizerConf::Adam {
                do_bias_correction: true,
                ..
            }
        ));
    }
}
