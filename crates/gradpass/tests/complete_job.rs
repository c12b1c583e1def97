mod job_support;

use anyhow::Result;
use gradpass::graph::GraphError;
use gradpass::job::op_conf::{MatmulOpConf, SgdUpdateOpConf, UnaryOpConf, OUT};
use gradpass::job::{DType, Job, LogicalBlobId, OpConf, OperatorConf};
use gradpass::optimizer::INCREMENT_TRAIN_STEP_OP_NAME;
use gradpass::passes::GenerateBackwardAndOptimizerOpConfs;
use gradpass::train::OptimizerConf;
use gradpass::{complete_job, JobPass, JobPassPipeline, PassResult};
use job_support::{init_logging, load_fixture, mlp, ops_of_type, out, producer, JobFixture};

const PASS_NAME: &str = "generate_backward_and_optimizer_op_confs";

fn graph_error(err: &anyhow::Error) -> &GraphError {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<GraphError>())
        .unwrap_or_else(|| panic!("no graph error in {err:#}"))
}

#[test]
fn fixture_job_is_completed() {
    init_logging();
    let mut job = load_fixture("mlp_job.json");
    let forward_len = job.net.len();
    let result = complete_job(&mut job).expect("complete job");

    assert!(result.changed);
    assert_eq!(result.skipped, 0);
    assert_eq!(result.ops_added, job.net.len() - forward_len);
    assert!(job.helper.completed_passes.contains(PASS_NAME));
    assert_eq!(ops_of_type(&job, "momentum_update").len(), 2);
    assert_eq!(ops_of_type(&job, "global_norm_clip_factor").len(), 1);
    assert_eq!(ops_of_type(&job, "scalar_div").len(), 2);
    assert_eq!(ops_of_type(&job, "l1_l2_regularize_gradient").len(), 2);
    assert_eq!(
        job.net.last().map(|op| op.name.as_str()),
        Some(INCREMENT_TRAIN_STEP_OP_NAME)
    );
}

#[test]
fn second_run_is_a_no_op() {
    init_logging();
    let mut job = load_fixture("mlp_job.json");
    complete_job(&mut job).expect("first run");
    let completed = job.clone();

    let result = complete_job(&mut job).expect("second run");
    assert_eq!(
        result,
        PassResult {
            changed: false,
            ops_added: 0,
            skipped: 1,
        }
    );
    assert_eq!(job, completed);
}

#[test]
fn job_with_existing_update_ops_is_left_alone() {
    init_logging();
    let mut job = mlp(OptimizerConf::Sgd);
    job.net.push(OperatorConf::new(
        "w1-manual-update",
        OpConf::SgdUpdate(SgdUpdateOpConf {
            model: out("w1"),
            model_diff: out("y"),
            learning_rate: out("loss"),
            weight_decay: 0.0,
        }),
    ));
    let before = job.clone();
    assert!(!GenerateBackwardAndOptimizerOpConfs.is_enabled(&job));

    let result = complete_job(&mut job).expect("gated pass");
    assert_eq!(result.skipped, 1);
    assert_eq!(job, before);
}

#[test]
fn inference_job_is_unchanged() {
    init_logging();
    let mut fixture = JobFixture::new("inference");
    let x = fixture.input("x", &[2, 3], DType::F32);
    let w = fixture.variable("w", &[3, 1], Vec::new());
    fixture.matmul("y", &x, &w, &[2, 1]);
    let mut job = fixture.forward();
    let before = job.clone();

    let result = complete_job(&mut job).expect("inference job");
    assert!(!result.changed);
    assert_eq!(job, before);
}

#[test]
fn loss_without_trainable_inputs_adds_nothing() {
    init_logging();
    let mut fixture = JobFixture::new("frozen");
    let x = fixture.input("x", &[2, 3], DType::F32);
    let loss = fixture.reduce_all("loss", &x, 2);
    let mut job = fixture.train(&loss, OptimizerConf::Sgd);

    let result = complete_job(&mut job).expect("complete job");
    assert_eq!(result.ops_added, 0);
    assert!(job.net.iter().all(|op| !op.op_type.is_model_update()));
}

#[test]
fn completed_job_round_trips_through_json() {
    init_logging();
    let mut job = load_fixture("mlp_job.json");
    complete_job(&mut job).expect("complete job");

    let text = job.to_json_pretty().expect("serialize");
    let back = Job::from_json_str(&text).expect("parse");
    assert_eq!(back, job);
}

#[test]
fn relations_are_published_on_the_job() {
    init_logging();
    let mut job = mlp(OptimizerConf::Sgd);
    complete_job(&mut job).expect("complete job");

    let raw = job.diff_lbi4lbi(&out("r")).expect("diff of r").clone();
    assert_eq!(producer(&job, &raw).op_type_name(), "matmul");
    assert!(job.diff_lbi4lbi(&out("x")).is_none());

    let raw_w1 = job.diff_lbi4lbi(&out("w1")).expect("raw diff of w1").clone();
    let final_w1 = job.final_model_diff4lbi(&out("w1")).expect("final diff of w1");
    assert_ne!(&raw_w1, final_w1);
    let update = ops_of_type(&job, "sgd_update")
        .into_iter()
        .find(|op| matches!(&op.op_type, OpConf::SgdUpdate(conf) if conf.model == out("w1")))
        .expect("w1 update");
    let OpConf::SgdUpdate(conf) = &update.op_type else {
        unreachable!()
    };
    assert_eq!(&conf.model_diff, final_w1);

    let h_diff = job.diff_lbi4lbi(&out("h")).expect("diff of h");
    let descs = &job.helper.lbn2logical_blob_desc;
    assert_eq!(descs.get(h_diff), descs.get(&out("h")));
}

#[test]
fn snapshots_are_written_around_each_pass() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut job = mlp(OptimizerConf::Sgd);
    let forward = job.clone();
    let pipeline = JobPassPipeline::training().with_dump_dir(Some(dir.path().to_path_buf()));
    pipeline.run(&mut job).expect("complete job");

    let before = Job::load(dir.path().join(format!("mlp-{PASS_NAME}-before.json")))
        .expect("before snapshot");
    let after = Job::load(dir.path().join(format!("mlp-{PASS_NAME}-after.json")))
        .expect("after snapshot");
    assert_eq!(before, forward);
    assert_eq!(after, job);
}

#[test]
fn dangling_input_is_reported() {
    init_logging();
    let mut fixture = JobFixture::new("dangling");
    let x = fixture.input("x", &[2, 3], DType::F32);
    let y = fixture.op(
        "y",
        OpConf::Matmul(MatmulOpConf {
            a: x,
            b: LogicalBlobId::new("ghost", OUT),
            transpose_a: false,
            transpose_b: false,
        }),
        &[2, 1],
    );
    let loss = fixture.reduce_all("loss", &y, 2);
    let mut job = fixture.train(&loss, OptimizerConf::Sgd);

    let err = complete_job(&mut job).unwrap_err();
    match graph_error(&err) {
        GraphError::DanglingInput { oba, lbi } => {
            assert_eq!(oba.to_string(), "y:b");
            assert_eq!(lbi.lbn(), "ghost/out");
        }
        other => panic!("unexpected graph error {other}"),
    }
    assert!(!job.helper.completed_passes.contains(PASS_NAME));
}

#[test]
fn cyclic_job_is_rejected() {
    init_logging();
    let mut fixture = JobFixture::new("cycle");
    fixture.op("a", OpConf::Relu(UnaryOpConf { input: out("b") }), &[2]);
    let b = fixture.op("b", OpConf::Relu(UnaryOpConf { input: out("a") }), &[2]);
    let mut job = fixture.train(&b, OptimizerConf::Sgd);

    let err = complete_job(&mut job).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::Cycle { .. }));
}

struct CountOps;

impl JobPass for CountOps {
    fn name(&self) -> &'static str {
        "count_ops"
    }

    fn is_enabled(&self, _job: &Job) -> bool {
        true
    }

    fn apply(&self, job: &mut Job) -> Result<PassResult> {
        log::info!("{} ops", job.net.len());
        Ok(PassResult::default())
    }
}

#[test]
fn custom_passes_run_after_the_training_rewrite() {
    init_logging();
    let mut pipeline = JobPassPipeline::training();
    pipeline.pass(CountOps);
    assert_eq!(pipeline.pass_names(), vec![PASS_NAME, "count_ops"]);

    let mut job = mlp(OptimizerConf::Sgd);
    let result = pipeline.run(&mut job).expect("pipeline");
    assert!(result.changed);
    assert!(job.helper.completed_passes.contains("count_ops"));

    let again = pipeline.run(&mut job).expect("rerun");
    assert_eq!(again.skipped, 2);
}

#[test]
fn unusable_loss_scale_is_rejected_before_any_rewrite() {
    init_logging();
    for factor in [0.0, -2.0, f32::NAN, f32::INFINITY] {
        let mut job = mlp(OptimizerConf::Sgd);
        if let Some(train_conf) = job.job_conf.train_conf.as_mut() {
            train_conf.loss_scale_factor = factor;
        }
        let forward_len = job.net.len();
        let err = complete_job(&mut job).unwrap_err();
        assert!(
            format!("{err:#}").contains("loss_scale_factor must be finite and positive"),
            "unexpected error: {err:#}"
        );
        assert_eq!(job.net.len(), forward_len);
    }
}
