#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use gradpass::job::op_conf::{
    GatherOpConf, Initializer, InputOpConf, MatmulOpConf, ReduceSumOpConf, UnaryOpConf,
    VariableOpConf, OUT,
};
use gradpass::job::{DType, Job, LogicalBlobDesc, LogicalBlobId, OpConf, OperatorConf};
use gradpass::train::{LrScheduleConf, ModelUpdateConf, OptimizerConf, TrainConf};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn out(op_name: &str) -> LogicalBlobId {
    LogicalBlobId::new(op_name, OUT)
}

/// Incremental builder for forward jobs with their logical blob descriptions.
pub struct JobFixture {
    job: Job,
}

impl JobFixture {
    pub fn new(job_name: &str) -> Self {
        let mut job = Job::default();
        job.job_conf.job_name = job_name.to_string();
        Self { job }
    }

    pub fn op(&mut self, name: &str, op_type: OpConf, shape: &[usize]) -> LogicalBlobId {
        self.op_with_dtype(name, op_type, shape, DType::F32)
    }

    pub fn op_with_dtype(
        &mut self,
        name: &str,
        op_type: OpConf,
        shape: &[usize],
        dtype: DType,
    ) -> LogicalBlobId {
        self.job.net.push(OperatorConf::new(name, op_type));
        let lbi = out(name);
        self.job
            .helper
            .lbn2logical_blob_desc
            .insert(lbi.clone(), LogicalBlobDesc::new(shape, dtype));
        lbi
    }

    pub fn variable(&mut self, name: &str, shape: &[usize], values: Vec<f32>) -> LogicalBlobId {
        let initializer = if values.is_empty() {
            Initializer::Zeros
        } else {
            Initializer::Values { values }
        };
        self.op(
            name,
            OpConf::Variable(VariableOpConf::new(shape, initializer)),
            shape,
        )
    }

    pub fn variable_conf(&mut self, name: &str, conf: VariableOpConf) -> LogicalBlobId {
        let shape = conf.shape.clone();
        self.op(name, OpConf::Variable(conf), &shape)
    }

    pub fn input(&mut self, name: &str, shape: &[usize], dtype: DType) -> LogicalBlobId {
        self.op_with_dtype(
            name,
            OpConf::Input(InputOpConf {
                shape: shape.to_vec(),
                dtype,
            }),
            shape,
            dtype,
        )
    }

    pub fn matmul(
        &mut self,
        name: &str,
        a: &LogicalBlobId,
        b: &LogicalBlobId,
        shape: &[usize],
    ) -> LogicalBlobId {
        self.op(
            name,
            OpConf::Matmul(MatmulOpConf {
                a: a.clone(),
                b: b.clone(),
                transpose_a: false,
                transpose_b: false,
            }),
            shape,
        )
    }

    pub fn relu(&mut self, name: &str, input: &LogicalBlobId, shape: &[usize]) -> LogicalBlobId {
        self.op(
            name,
            OpConf::Relu(UnaryOpConf {
                input: input.clone(),
            }),
            shape,
        )
    }

    pub fn gather(
        &mut self,
        name: &str,
        table: &LogicalBlobId,
        indices: &LogicalBlobId,
        shape: &[usize],
    ) -> LogicalBlobId {
        self.op(
            name,
            OpConf::Gather(GatherOpConf {
                input: table.clone(),
                indices: indices.clone(),
            }),
            shape,
        )
    }

    /// Sums every axis into a single-element loss.
    pub fn reduce_all(&mut self, name: &str, input: &LogicalBlobId, rank: usize) -> LogicalBlobId {
        self.op(
            name,
            OpConf::ReduceSum(ReduceSumOpConf {
                input: input.clone(),
                axes: (0..rank).collect(),
                keepdims: false,
            }),
            &[1],
        )
    }

    pub fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    pub fn forward(self) -> Job {
        self.job
    }

    pub fn train(mut self, loss: &LogicalBlobId, optimizer: OptimizerConf) -> Job {
        self.job.job_conf.train_conf = Some(train_conf(loss, optimizer));
        self.job
    }
}

pub fn train_conf(loss: &LogicalBlobId, optimizer: OptimizerConf) -> TrainConf {
    TrainConf::new(
        vec![loss.clone()],
        ModelUpdateConf::new(optimizer, LrScheduleConf::constant(0.1)),
    )
}

/// x[2,3] -> matmul w1[3,4] -> relu -> matmul w2[4,1] -> reduce_sum.
pub fn mlp(optimizer: OptimizerConf) -> Job {
    let mut fixture = JobFixture::new("mlp");
    let x = fixture.input("x", &[2, 3], DType::F32);
    let w1 = fixture.variable("w1", &[3, 4], Vec::new());
    let h = fixture.matmul("h", &x, &w1, &[2, 4]);
    let r = fixture.relu("r", &h, &[2, 4]);
    let w2 = fixture.variable("w2", &[4, 1], Vec::new());
    let y = fixture.matmul("y", &r, &w2, &[2, 1]);
    let loss = fixture.reduce_all("loss", &y, 2);
    fixture.train(&loss, optimizer)
}

/// ids[3] -> gather table[5,2] -> matmul w[2,1] -> reduce_sum.
pub fn embedding(optimizer: OptimizerConf, indexed_slices: bool) -> Job {
    let mut fixture = JobFixture::new("embedding");
    let ids = fixture.input("ids", &[3], DType::I64);
    let table = fixture.variable("table", &[5, 2], Vec::new());
    let emb = fixture.gather("emb", &table, &ids, &[3, 2]);
    let w = fixture.variable("w", &[2, 1], Vec::new());
    let y = fixture.matmul("y", &emb, &w, &[3, 1]);
    let loss = fixture.reduce_all("loss", &y, 2);
    let mut job = fixture.train(&loss, optimizer);
    if let Some(train_conf) = job.job_conf.train_conf.as_mut() {
        train_conf.indexed_slices_optimizer_conf.enable = indexed_slices;
    }
    job
}

pub fn ops_of_type<'a>(job: &'a Job, op_type_name: &str) -> Vec<&'a OperatorConf> {
    job.net
        .iter()
        .filter(|op| op.op_type_name() == op_type_name)
        .collect()
}

pub fn producer<'a>(job: &'a Job, lbi: &LogicalBlobId) -> &'a OperatorConf {
    job.op_conf(&lbi.op_name)
        .unwrap_or_else(|| panic!("no producer for {lbi}"))
}

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn load_fixture(name: &str) -> Job {
    let path = fixture_path(name);
    let text = fs::read_to_string(&path).unwrap_or_else(|e| panic!("cannot read {path:?}: {e}"));
    Job::from_json_str(&text).expect("fixture job parses")
}
