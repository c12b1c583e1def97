mod job_support;

use anyhow::Result;
use gradpass::autograd::{autograd, GradientMap};
use gradpass::gradient::{GradientPipeline, GradientPipelineBuilder, ModelDiffStage, ParallelCastStage};
use gradpass::graph::{JobBuilder, OpGraph};
use gradpass::job::op_conf::{VariableOpConf, OUT};
use gradpass::job::{Job, OpBlobArg, OpConf, ParallelConf, SbpParallel};
use gradpass::train::{ClipConf, OptimizerConf, RegularizerConf};
use job_support::{embedding, init_logging, mlp, ops_of_type, out, producer, JobFixture};

fn model_diffs(op_graph: &OpGraph, gradients: GradientMap) -> GradientMap {
    gradients
        .into_iter()
        .filter(|(lbi, _)| {
            op_graph
                .producer(lbi)
                .and_then(|node| node.op_conf().as_variable())
                .is_some_and(|variable| variable.trainable)
        })
        .collect()
}

/// Autograd followed by `pipeline` over the trainable parameters.
fn run_with(job: &mut Job, pipeline: &GradientPipeline) -> Result<GradientMap> {
    init_logging();
    let train_conf = job.job_conf.train_conf.clone().expect("training job");
    let op_graph = OpGraph::new(job)?;
    let mut builder = JobBuilder::new(job);
    let gradients = autograd(&op_graph, &mut builder, &train_conf)?;
    let diffs = model_diffs(&op_graph, gradients);
    pipeline.run(&op_graph, &mut builder, diffs)
}

fn run_default(job: &mut Job) -> Result<GradientMap> {
    let train_conf = job.job_conf.train_conf.clone().expect("training job");
    run_with(job, &GradientPipeline::for_train_conf(&train_conf))
}

fn configure(job: &mut Job, edit: impl FnOnce(&mut gradpass::train::TrainConf)) {
    edit(job.job_conf.train_conf.as_mut().expect("training job"));
}

#[test]
fn default_pipeline_skips_loss_scale_and_clip() {
    let mut job = mlp(OptimizerConf::Sgd);
    let train_conf = job.job_conf.train_conf.clone().expect("training job");
    let pipeline = GradientPipeline::for_train_conf(&train_conf);
    assert_eq!(
        pipeline.stage_names(),
        vec![
            "add_diff_parallel_cast",
            "scale_model_diff_by_loss_instance_num",
            "scale_model_diff_by_loss_scale",
            "regularize_gradient",
        ]
    );

    let diffs = run_with(&mut job, &pipeline).expect("pipeline");
    assert_eq!(diffs.len(), 2);
    assert!(ops_of_type(&job, "scalar_div").is_empty());
    assert!(ops_of_type(&job, "parallel_cast").is_empty());
    assert!(ops_of_type(&job, "l1_l2_regularize_gradient").is_empty());

    let totals = ops_of_type(&job, "total_loss_instance_num");
    assert_eq!(totals.len(), 1);
    let OpConf::TotalLossInstanceNum(conf) = &totals[0].op_type else {
        unreachable!()
    };
    assert_eq!(conf.losses, vec![out("loss")]);
    for diff in diffs.values() {
        assert_eq!(producer(&job, diff).op_type_name(), "scalar_div_by_tensor");
    }
}

#[test]
fn stages_chain_in_fixed_order() {
    let mut job = mlp(OptimizerConf::Sgd);
    configure(&mut job, |conf| {
        conf.loss_scale_factor = 4.0;
        conf.default_regularizer = Some(RegularizerConf { l1: 0.0, l2: 0.01 });
        conf.model_update_conf.clip_conf = Some(ClipConf::ClipByValue { min: -1.0, max: 1.0 });
    });
    let diffs = run_default(&mut job).expect("pipeline");

    let mut lbi = diffs[&out("w1")].clone();
    let mut chain = Vec::new();
    loop {
        let op = producer(&job, &lbi);
        let next = match &op.op_type {
            OpConf::ClipByValue(conf) => conf.input.clone(),
            OpConf::L1L2RegularizeGradient(conf) => {
                assert_eq!(conf.model, out("w1"));
                assert_eq!(conf.l2, 0.01);
                conf.model_diff.clone()
            }
            OpConf::ScalarDiv(conf) => {
                assert_eq!(conf.operand, 4.0);
                conf.input.clone()
            }
            OpConf::ScalarDivByTensor(conf) => conf.input.clone(),
            _ => break,
        };
        chain.push(op.op_type_name().to_string());
        lbi = next;
    }
    assert_eq!(
        chain,
        vec![
            "clip_by_value",
            "l1_l2_regularize_gradient",
            "scalar_div",
            "scalar_div_by_tensor",
        ]
    );
    assert_eq!(job.diff_lbi4lbi(&out("w1")), None, "relations are published by the pass");
}

#[test]
fn variable_regularizer_overrides_default() {
    let mut fixture = JobFixture::new("override");
    let x = fixture.input("x", &[2, 3], gradpass::job::DType::F32);
    let mut conf = VariableOpConf::new([3, 1], Default::default());
    conf.regularizer = Some(RegularizerConf::default());
    let w = fixture.variable_conf("w", conf);
    let y = fixture.matmul("y", &x, &w, &[2, 1]);
    let loss = fixture.reduce_all("loss", &y, 2);
    let mut job = fixture.train(&loss, OptimizerConf::Sgd);
    configure(&mut job, |conf| {
        conf.default_regularizer = Some(RegularizerConf { l1: 0.5, l2: 0.5 });
    });

    run_default(&mut job).expect("pipeline");
    assert!(ops_of_type(&job, "l1_l2_regularize_gradient").is_empty());
}

#[test]
fn global_norm_is_computed_from_all_gradients() {
    let mut job = mlp(OptimizerConf::Sgd);
    configure(&mut job, |conf| {
        conf.model_update_conf.clip_conf = Some(ClipConf::ClipByGlobalNorm {
            clip_norm: 1.0,
            global_norm: None,
        });
    });
    let diffs = run_default(&mut job).expect("pipeline");

    assert_eq!(ops_of_type(&job, "square_sum").len(), 2);
    let factors = ops_of_type(&job, "global_norm_clip_factor");
    assert_eq!(factors.len(), 1);
    let OpConf::GlobalNormClipFactor(conf) = &factors[0].op_type else {
        unreachable!()
    };
    let total = conf.square_sum.clone().expect("computed square sum");
    assert_eq!(total.op_name, "System-Train-GlobalSquareSum");
    assert_eq!(conf.clip_norm, 1.0);

    let factor = factors[0].output_lbi(OUT);
    for diff in diffs.values() {
        let OpConf::ScalarMulByTensor(conf) = &producer(&job, diff).op_type else {
            panic!("{diff} is not clipped");
        };
        assert_eq!(conf.scalar, factor);
    }
}

#[test]
fn precomputed_global_norm_skips_square_sums() {
    let mut job = mlp(OptimizerConf::Sgd);
    configure(&mut job, |conf| {
        conf.model_update_conf.clip_conf = Some(ClipConf::ClipByGlobalNorm {
            clip_norm: 1.0,
            global_norm: Some(5.0),
        });
    });
    run_default(&mut job).expect("pipeline");

    assert!(ops_of_type(&job, "square_sum").is_empty());
    let factors = ops_of_type(&job, "global_norm_clip_factor");
    let OpConf::GlobalNormClipFactor(conf) = &factors[0].op_type else {
        unreachable!()
    };
    assert_eq!(conf.square_sum, None);
    assert_eq!(conf.global_norm, Some(5.0));
}

#[test]
fn diffs_are_cast_to_model_sbp_on_multi_device_placement() {
    let mut fixture = JobFixture::new("parallel");
    let x = fixture.input("x", &[4, 3], gradpass::job::DType::F32);
    let mut split = VariableOpConf::new([3, 2], Default::default());
    split.split_axis = Some(1);
    let w1 = fixture.variable_conf("w1", split);
    let h = fixture.matmul("h", &x, &w1, &[4, 2]);
    let w2 = fixture.variable("w2", &[2, 1], Vec::new());
    let y = fixture.matmul("y", &h, &w2, &[4, 1]);
    let loss = fixture.reduce_all("loss", &y, 2);
    let mut job = fixture.train(&loss, OptimizerConf::Sgd);
    job.placement.default_parallel_conf = ParallelConf::new("cpu", 2);

    init_logging();
    let train_conf = job.job_conf.train_conf.clone().expect("training job");
    let op_graph = OpGraph::new(&job).expect("graph");
    let mut builder = JobBuilder::new(&mut job);
    let gradients = autograd(&op_graph, &mut builder, &train_conf).expect("autograd");
    let diffs = model_diffs(&op_graph, gradients);
    // w2's diff is already broadcast, matching the model.
    let w2_diff = diffs[&w2].clone();
    builder.set_sbp_parallel4oba(
        &OpBlobArg::new(w2_diff.op_name.clone(), w2_diff.blob_name.clone()),
        SbpParallel::Broadcast,
    );

    let mut stages = GradientPipelineBuilder::new();
    stages.stage(ParallelCastStage);
    let cast = stages
        .finish()
        .run(&op_graph, &mut builder, diffs)
        .expect("pipeline");
    drop(builder);

    assert_eq!(cast[&w2], w2_diff);
    let OpConf::ParallelCast(conf) = &producer(&job, &cast[&w1]).op_type else {
        panic!("w1 diff was not cast");
    };
    assert_eq!(conf.sbp_parallel, Some(SbpParallel::split(1)));
    let cast_port = OpBlobArg::new(cast[&w1].op_name.clone(), OUT);
    assert_eq!(
        job.sbp_conf.op_name2sbp_signature[&cast_port.op_name].get(OUT),
        Some(&SbpParallel::split(1))
    );
}

#[test]
fn single_device_placement_needs_no_cast() {
    let mut job = mlp(OptimizerConf::Sgd);
    let mut stages = GradientPipelineBuilder::new();
    stages.stage(ParallelCastStage);
    run_with(&mut job, &stages.finish()).expect("pipeline");
    assert!(ops_of_type(&job, "parallel_cast").is_empty());
}

struct DropFirstParameter;

impl ModelDiffStage for DropFirstParameter {
    fn name(&self) -> &'static str {
        "drop_first_parameter"
    }

    fn apply(
        &self,
        _op_graph: &OpGraph,
        _builder: &mut JobBuilder<'_>,
        mut model_diffs: GradientMap,
    ) -> Result<GradientMap> {
        model_diffs.pop_first();
        Ok(model_diffs)
    }
}

#[test]
fn stage_must_keep_the_parameter_set() {
    let mut job = mlp(OptimizerConf::Sgd);
    let mut stages = GradientPipelineBuilder::new();
    stages.stage(DropFirstParameter);
    let err = run_with(&mut job, &stages.finish()).unwrap_err();
    assert!(
        format!("{err:#}").contains("changed the set of parameters"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn sparse_gradients_stay_sparse_through_the_pipeline() {
    let mut job = embedding(OptimizerConf::Sgd, true);
    configure(&mut job, |conf| {
        conf.loss_scale_factor = 2.0;
        conf.default_regularizer = Some(RegularizerConf { l1: 0.1, l2: 0.0 });
        conf.model_update_conf.clip_conf = Some(ClipConf::ClipByValue { min: -1.0, max: 1.0 });
    });
    let diffs = run_default(&mut job).expect("pipeline");

    let table_diff = diffs[&out("table")].clone();
    let w_diff = diffs[&out("w")].clone();
    let builder = JobBuilder::new(&mut job);
    assert!(builder.is_indexed_slices(&table_diff));
    assert!(!builder.is_indexed_slices(&w_diff));
}

#[test]
fn inverted_or_nan_clip_bounds_are_rejected() {
    for (min, max) in [(1.0, -1.0), (f32::NAN, 1.0), (-1.0, f32::NAN)] {
        let mut job = mlp(OptimizerConf::Sgd);
        configure(&mut job, |conf| {
            conf.model_update_conf.clip_conf = Some(ClipConf::ClipByValue { min, max });
        });
        let err = run_default(&mut job).unwrap_err();
        let message = format!("{err:#}");
        assert!(
            message.contains(&format!("min = {min}, max = {max}")),
            "unexpected error: {message}"
        );
        assert!(ops_of_type(&job, "clip_by_value").is_empty());
    }
}
