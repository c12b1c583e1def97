use std::collections::{BTreeMap, BTreeSet};

use crate::autograd::AutogradError;
use crate::graph::{JobBuilder, OpGraph, OpNode};
use crate::job::{LogicalBlobDesc, LogicalBlobId, OpBlobArg, OpConf, OperatorConf, SbpParallel};
use crate::train::TrainConf;

/// Everything a gradient rule may see and do while differentiating one operator.
pub struct BackwardCtx<'a, 'j> {
    op_graph: &'a OpGraph,
    builder: &'a mut JobBuilder<'j>,
    train_conf: &'a TrainConf,
    node: &'a OpNode,
    out_diffs: BTreeMap<String, LogicalBlobId>,
    participating_ibns: BTreeSet<String>,
    in_diffs: Vec<(String, LogicalBlobId)>,
}

impl<'a, 'j> BackwardCtx<'a, 'j> {
    pub(crate) fn new(
        op_graph: &'a OpGraph,
        builder: &'a mut JobBuilder<'j>,
        train_conf: &'a TrainConf,
        node: &'a OpNode,
        out_diffs: BTreeMap<String, LogicalBlobId>,
        participating_ibns: BTreeSet<String>,
    ) -> Self {
        Self {
            op_graph,
            builder,
            train_conf,
            node,
            out_diffs,
            participating_ibns,
            in_diffs: Vec::new(),
        }
    }

    pub fn op(&self) -> &'a OperatorConf {
        self.node.op_conf()
    }

    pub fn op_name(&self) -> &'a str {
        self.node.op_name()
    }

    pub fn node(&self) -> &'a OpNode {
        self.node
    }

    pub fn op_graph(&self) -> &'a OpGraph {
        self.op_graph
    }

    pub fn train_conf(&self) -> &'a TrainConf {
        self.train_conf
    }

    /// Accumulated gradient of output `obn`, if any consumer produced one.
    pub fn out_diff(&self, obn: &str) -> Option<&LogicalBlobId> {
        self.out_diffs.get(obn)
    }

    /// Forward tensor bound to input `ibn`.
    pub fn input(&self, ibn: &str) -> Result<LogicalBlobId, AutogradError> {
        self.op()
            .bn_in_op2lbi(ibn)
            .ok_or_else(|| AutogradError::MissingPort {
                op_name: self.op_name().to_string(),
                bn: ibn.to_string(),
            })
    }

    /// Whether input `ibn` lies on a path from a trainable variable.
    pub fn needs_diff(&self, ibn: &str) -> bool {
        self.participating_ibns.contains(ibn)
    }

    pub fn set_in_diff(&mut self, ibn: &str, diff: LogicalBlobId) {
        if self.needs_diff(ibn) {
            self.in_diffs.push((ibn.to_string(), diff));
        }
    }

    /// Appends a backward operator placed with the forward operator and returns its output.
    pub fn add_op(&mut self, suffix: &str, op_type: OpConf) -> Result<LogicalBlobId, AutogradError> {
        let name = self
            .builder
            .fresh_op_name(&format!("{}-grad-{suffix}", self.op_name()));
        let parallel_conf = self.node.parallel_conf().clone();
        Ok(self.builder.add_op(&parallel_conf, name, op_type)?)
    }

    /// Requires port `backward_bn` of `backward_op` to use the SBP of forward port `forward_bn`.
    pub fn bind_forward_port(&mut self, backward_op: &str, backward_bn: &str, forward_bn: &str) {
        self.builder.bind_identical_sbp_oba_pair(
            OpBlobArg::new(backward_op, backward_bn),
            OpBlobArg::new(self.op_name(), forward_bn),
        );
    }

    pub fn logical_blob_desc(&self, lbi: &LogicalBlobId) -> Option<&LogicalBlobDesc> {
        self.op_graph.logical_blob_desc(lbi)
    }

    pub fn sbp_parallel4bn(&self, bn: &str) -> Option<&SbpParallel> {
        self.node.sbp_parallel4bn(bn)
    }

    pub fn builder(&self) -> &JobBuilder<'j> {
        &*self.builder
    }

    pub(crate) fn into_in_diffs(self) -> Vec<(String, LogicalBlobId)> {
        self.in_diffs
    }
}
