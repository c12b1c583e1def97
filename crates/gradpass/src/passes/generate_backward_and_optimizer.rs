use anyhow::{anyhow, Context, Result};

use crate::autograd::{autograd, GradientMap};
use crate::gradient::GradientPipeline;
use crate::graph::{JobBuilder, OpGraph};
use crate::job::{Job, LbiPair, MODEL_LBI2FINAL_DIFF_LBI, PRODUCED_LBI2CONSUMED_DIFF_LBI};
use crate::optimizer::add_optimizer_op_confs;
use crate::passes::{JobPass, PassResult};
use crate::sbp_hint::update_op_sbp_signature_hint;

/// Turns a forward job into a training job.
///
/// Runs autograd, publishes the `lbi -> diff` relation, narrows it to trainable
/// variables, runs the model-diff pipeline, emits optimizer ops and finally resolves the
/// identical-SBP pairs into hints.
pub struct GenerateBackwardAndOptimizerOpConfs;

impl JobPass for GenerateBackwardAndOptimizerOpConfs {
    fn name(&self) -> &'static str {
        "generate_backward_and_optimizer_op_confs"
    }

    /// Training jobs that contain no model-update operator yet.
    fn is_enabled(&self, job: &Job) -> bool {
        job.is_train() && !job.net.iter().any(|op| op.op_type.is_model_update())
    }

    fn apply(&self, job: &mut Job) -> Result<PassResult> {
        let train_conf = job
            .job_conf
            .train_conf
            .clone()
            .ok_or_else(|| anyhow!("job {} has no train conf", job.job_conf.job_name))?;
        train_conf.validate()?;
        let op_graph = OpGraph::new(job).context("invalid forward job")?;
        let ops_before = job.net.len();

        let mut builder = JobBuilder::new(job);
        let lbi2diff_lbi = autograd(&op_graph, &mut builder, &train_conf)?;
        builder.add_lbi_relations(PRODUCED_LBI2CONSUMED_DIFF_LBI, relation_pairs(&lbi2diff_lbi));

        let model_diffs = filter_model_diffs(&op_graph, &lbi2diff_lbi);
        let pipeline = GradientPipeline::for_train_conf(&train_conf);
        log::debug!("model diff stages: {:?}", pipeline.stage_names());
        let model_diffs = pipeline.run(&op_graph, &mut builder, model_diffs)?;
        builder.add_lbi_relations(MODEL_LBI2FINAL_DIFF_LBI, relation_pairs(&model_diffs));

        add_optimizer_op_confs(&op_graph, &mut builder, &model_diffs, &train_conf)?;
        update_op_sbp_signature_hint(&op_graph, &mut builder)?;
        drop(builder);

        let ops_added = job.net.len() - ops_before;
        Ok(PassResult {
            changed: ops_added > 0,
            ops_added,
            skipped: 0,
        })
    }
}

fn relation_pairs(map: &GradientMap) -> Vec<LbiPair> {
    map.iter()
        .map(|(first, second)| LbiPair {
            first: first.clone(),
            second: second.clone(),
        })
        .collect()
}

/// Keeps the gradients of trainable variable outputs.
fn filter_model_diffs(op_graph: &OpGraph, lbi2diff_lbi: &GradientMap) -> GradientMap {
    lbi2diff_lbi
        .iter()
        .filter(|(lbi, _)| {
            op_graph
                .producer(lbi)
                .and_then(|node| node.op_conf().as_variable())
                .is_some_and(|variable| variable.trainable)
        })
        .map(|(lbi, diff)| (lbi.clone(), diff.clone()))
        .collect()
}
