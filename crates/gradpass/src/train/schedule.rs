use serde::{Deserialize, Serialize};

pub trait LrSchedule {
    fn learning_rate(&self, step: usize) -> f32;
}

pub struct ConstantSchedule {
    pub lr: f32,
}

impl LrSchedule for ConstantSchedule {
    fn learning_rate(&self, _step: usize) -> f32 {
        self.lr
    }
}

/// Linear ramp from `lr * start_factor` to `lr` over `warmup_steps`.
pub struct LinearWarmupSchedule {
    pub lr: f32,
    pub warmup_steps: usize,
    pub start_factor: f32,
}

impl LrSchedule for LinearWarmupSchedule {
    fn learning_rate(&self, step: usize) -> f32 {
        if self.warmup_steps == 0 || step >= self.warmup_steps {
            return self.lr;
        }
        let progress = step as f32 / self.warmup_steps as f32;
        let factor = self.start_factor + (1.0 - self.start_factor) * progress;
        self.lr * factor
    }
}

/// Cosine decay from `lr` to `lr * alpha` over `decay_steps`, constant afterwards.
pub struct CosineDecaySchedule {
    pub lr: f32,
    pub decay_steps: usize,
    pub alpha: f32,
}

impl LrSchedule for CosineDecaySchedule {
    fn learning_rate(&self, step: usize) -> f32 {
        if self.decay_steps == 0 {
            return self.lr;
        }
        let progress = step.min(self.decay_steps) as f32 / self.decay_steps as f32;
        let cosine = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
        self.lr * ((1.0 - self.alpha) * cosine + self.alpha)
    }
}

/// Serialized learning-rate schedule carried by `LearningRate` ops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrScheduleConf {
    Constant {
        lr: f32,
    },
    LinearWarmup {
        lr: f32,
        warmup_steps: usize,
        #[serde(default)]
        start_factor: f32,
    },
    CosineDecay {
        lr: f32,
        decay_steps: usize,
        #[serde(default)]
        alpha: f32,
    },
}

impl LrScheduleConf {
    pub fn constant(lr: f32) -> Self {
        LrScheduleConf::Constant { lr }
    }

    pub fn build(&self) -> Box<dyn LrSchedule> {
        match *self {
            LrScheduleConf::Constant { lr } => Box::new(ConstantSchedule { lr }),
            LrScheduleConf::LinearWarmup {
                lr,
                warmup_steps,
                start_factor,
            } => Box::new(LinearWarmupSchedule {
                lr,
                warmup_steps,
                start_factor,
            }),
            LrScheduleConf::CosineDecay {
                lr,
                decay_steps,
                alpha,
            } => Box::new(CosineDecaySchedule {
                lr,
                decay_steps,
                alpha,
            }),
        }
    }
}
