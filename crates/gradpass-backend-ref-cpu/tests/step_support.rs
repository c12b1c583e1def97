#![allow(dead_code)]

use std::collections::HashMap;

use gradpass::job::op_conf::{
    GatherOpConf, Initializer, InputOpConf, MatmulOpConf, ReduceSumOpConf, VariableOpConf, OUT,
};
use gradpass::job::{DType, Job, LogicalBlobDesc, LogicalBlobId, OpConf, OperatorConf};
use gradpass::train::{LrScheduleConf, ModelUpdateConf, OptimizerConf, TrainConf};
use gradpass_backend_ref_cpu::{HostTensor, StepExecutor, StepOutputs};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn out(op_name: &str) -> LogicalBlobId {
    LogicalBlobId::new(op_name, OUT)
}

/// Forward job under construction, with blob descriptions for every output.
pub struct ForwardJob {
    job: Job,
}

impl ForwardJob {
    pub fn new(job_name: &str) -> Self {
        let mut job = Job::default();
        job.job_conf.job_name = job_name.to_string();
        Self { job }
    }

    pub fn op(&mut self, name: &str, op_type: OpConf, shape: &[usize], dtype: DType) -> LogicalBlobId {
        self.job.net.push(OperatorConf::new(name, op_type));
        self.job
            .helper
            .lbn2logical_blob_desc
            .insert(out(name), LogicalBlobDesc::new(shape, dtype));
        out(name)
    }

    pub fn input(&mut self, name: &str, shape: &[usize], dtype: DType) -> LogicalBlobId {
        let conf = InputOpConf {
            shape: shape.to_vec(),
            dtype,
        };
        self.op(name, OpConf::Input(conf), shape, dtype)
    }

    pub fn variable(&mut self, name: &str, shape: &[usize], values: Vec<f32>) -> LogicalBlobId {
        let conf = VariableOpConf::new(shape, Initializer::Values { values });
        self.op(name, OpConf::Variable(conf), shape, DType::F32)
    }

    pub fn matmul(&mut self, name: &str, a: &LogicalBlobId, b: &LogicalBlobId, shape: &[usize]) -> LogicalBlobId {
        let conf = MatmulOpConf {
            a: a.clone(),
            b: b.clone(),
            transpose_a: false,
            transpose_b: false,
        };
        self.op(name, OpConf::Matmul(conf), shape, DType::F32)
    }

    pub fn gather(&mut self, name: &str, table: &LogicalBlobId, ids: &LogicalBlobId, shape: &[usize]) -> LogicalBlobId {
        let conf = GatherOpConf {
            input: table.clone(),
            indices: ids.clone(),
        };
        self.op(name, OpConf::Gather(conf), shape, DType::F32)
    }

    pub fn reduce_sum(&mut self, name: &str, input: &LogicalBlobId, axes: &[usize], shape: &[usize]) -> LogicalBlobId {
        let conf = ReduceSumOpConf {
            input: input.clone(),
            axes: axes.to_vec(),
            keepdims: false,
        };
        self.op(name, OpConf::ReduceSum(conf), shape, DType::F32)
    }

    pub fn train(mut self, loss: &LogicalBlobId, optimizer: OptimizerConf, lr: f32) -> Job {
        self.job.job_conf.train_conf = Some(TrainConf::new(
            vec![loss.clone()],
            ModelUpdateConf::new(optimizer, LrScheduleConf::constant(lr)),
        ));
        self.job
    }
}

pub fn train_conf_mut(job: &mut Job) -> &mut TrainConf {
    job.job_conf.train_conf.as_mut().expect("training job")
}

pub fn feeds(entries: Vec<(&str, HostTensor)>) -> HashMap<String, HostTensor> {
    entries
        .into_iter()
        .map(|(name, tensor)| (name.to_string(), tensor))
        .collect()
}

pub fn run(executor: &mut StepExecutor, job: &Job, feeds: &HashMap<String, HostTensor>) -> StepOutputs {
    executor
        .run_step(job, feeds)
        .unwrap_or_else(|err| panic!("step failed: {err:#}"))
}

pub fn f32_values(executor: &StepExecutor, name: &str) -> Vec<f32> {
    executor
        .variable(name)
        .unwrap_or_else(|| panic!("no variable {name}"))
        .as_f32()
        .expect("f32 variable")
        .to_vec()
}

pub fn bits(values: &[f32]) -> Vec<u32> {
    values.iter().map(|v| v.to_bits()).collect()
}
