use std::collections::HashMap;

use crate::graph::GraphError;
use crate::job::{
    Job, LbiPair, LogicalBlobDesc, LogicalBlobId, OpBlobArg, OpBlobArgPair, OpConf, OperatorConf,
    ParallelConf, SbpParallel,
};

/// Mutable job editor: the only handle through which a pass changes a job.
///
/// Operators are append-only. Lookups see both the forward operators and everything
/// appended so far.
pub struct JobBuilder<'a> {
    job: &'a mut Job,
    op_name2index: HashMap<String, usize>,
}

impl<'a> JobBuilder<'a> {
    pub fn new(job: &'a mut Job) -> Self {
        let op_name2index = job
            .net
            .iter()
            .enumerate()
            .map(|(index, op)| (op.name.clone(), index))
            .collect();
        Self { job, op_name2index }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn op_conf(&self, op_name: &str) -> Option<&OperatorConf> {
        self.op_name2index
            .get(op_name)
            .map(|index| &self.job.net[*index])
    }

    pub fn contains_op(&self, op_name: &str) -> bool {
        self.op_name2index.contains_key(op_name)
    }

    pub fn parallel_conf4op_name(&self, op_name: &str) -> &ParallelConf {
        self.job.placement.parallel_conf4op_name(op_name)
    }

    /// Appends `ops` placed on `parallel_conf`. Names must be fresh.
    pub fn add_ops(
        &mut self,
        parallel_conf: &ParallelConf,
        ops: Vec<OperatorConf>,
    ) -> Result<(), GraphError> {
        for op in &ops {
            if self.op_name2index.contains_key(&op.name) {
                return Err(GraphError::DuplicateOpName {
                    op_name: op.name.clone(),
                });
            }
        }
        for op in ops {
            log::trace!("add op {} ({})", op.name, op.op_type_name());
            if *parallel_conf != self.job.placement.default_parallel_conf {
                self.job
                    .placement
                    .op_name2parallel_conf
                    .insert(op.name.clone(), parallel_conf.clone());
            }
            self.op_name2index.insert(op.name.clone(), self.job.net.len());
            self.job.net.push(op);
        }
        Ok(())
    }

    /// Appends one single-output operator and returns its `out` tensor.
    pub fn add_op(
        &mut self,
        parallel_conf: &ParallelConf,
        name: impl Into<String>,
        op_type: OpConf,
    ) -> Result<LogicalBlobId, GraphError> {
        let op = OperatorConf::new(name, op_type);
        let out = op.output_lbi(crate::job::op_conf::OUT);
        self.add_ops(parallel_conf, vec![op])?;
        Ok(out)
    }

    /// Returns `base` if unused, otherwise the first free `base-{n}`.
    pub fn fresh_op_name(&self, base: &str) -> String {
        if !self.contains_op(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{base}-{n}"))
            .find(|name| !self.contains_op(name))
            .unwrap_or_else(|| base.to_string())
    }

    /// Declares that two ports must carry the same SBP. Repeated pairs are ignored.
    pub fn bind_identical_sbp_oba_pair(&mut self, first: OpBlobArg, second: OpBlobArg) {
        if first == second {
            return;
        }
        let pairs = &mut self.job.helper.identical_sbp_oba_pairs;
        let exists = pairs.iter().any(|pair| {
            (pair.first == first && pair.second == second)
                || (pair.first == second && pair.second == first)
        });
        if !exists {
            pairs.push(OpBlobArgPair { first, second });
        }
    }

    pub fn identical_sbp_oba_pairs(&self) -> &[OpBlobArgPair] {
        &self.job.helper.identical_sbp_oba_pairs
    }

    pub fn sbp_parallel4oba(&self, oba: &OpBlobArg) -> Option<SbpParallel> {
        self.job
            .sbp_conf
            .op_name2sbp_signature
            .get(&oba.op_name)?
            .get(&oba.bn_in_op)
            .copied()
    }

    pub fn set_sbp_parallel4oba(&mut self, oba: &OpBlobArg, sbp: SbpParallel) {
        self.job
            .sbp_conf
            .op_name2sbp_signature
            .entry(oba.op_name.clone())
            .or_default()
            .bn_in_op2sbp_parallel
            .insert(oba.bn_in_op.clone(), sbp);
    }

    /// SBP hint recorded on the producing port of `lbi`.
    pub fn sbp_parallel4lbi(&self, lbi: &LogicalBlobId) -> Option<SbpParallel> {
        self.sbp_parallel4oba(&OpBlobArg::new(
            lbi.op_name.clone(),
            lbi.blob_name.clone(),
        ))
    }

    pub fn add_lbi_relations(&mut self, tag: &str, pairs: impl IntoIterator<Item = LbiPair>) {
        self.job
            .helper
            .tag2lbi_relations
            .entry(tag.to_string())
            .or_default()
            .extend(pairs);
    }

    pub fn logical_blob_desc(&self, lbi: &LogicalBlobId) -> Option<&LogicalBlobDesc> {
        self.job.helper.lbn2logical_blob_desc.get(lbi)
    }

    pub fn set_logical_blob_desc(&mut self, lbi: LogicalBlobId, desc: LogicalBlobDesc) {
        self.job.helper.lbn2logical_blob_desc.insert(lbi, desc);
    }

    /// Whether `lbi` holds a sparse (indices, values) gradient rather than a dense tensor.
    ///
    /// Sparse gradients originate at `IndexedSlicesFromGather` and stay sparse through
    /// the value-rewriting gradient pipeline operators.
    pub fn is_indexed_slices(&self, lbi: &LogicalBlobId) -> bool {
        let mut current = lbi.clone();
        loop {
            let Some(op) = self.op_conf(&current.op_name) else {
                return false;
            };
            let next = match &op.op_type {
                OpConf::IndexedSlicesFromGather(_) => return true,
                OpConf::ParallelCast(conf) => &conf.input,
                OpConf::ScalarDivByTensor(conf) | OpConf::ScalarMulByTensor(conf) => &conf.input,
                OpConf::ScalarDiv(conf) => &conf.input,
                OpConf::L1L2RegularizeGradient(conf) => &conf.model_diff,
                OpConf::ClipByValue(conf) => &conf.input,
                _ => return false,
            };
            current = next.clone();
        }
    }

    /// Name of the variable behind `lbi`, when `lbi` is a variable output.
    pub fn variable_name4lbi(&self, lbi: &LogicalBlobId) -> Option<&str> {
        self.op_conf(&lbi.op_name)
            .filter(|op| op.as_variable().is_some())
            .map(|op| op.name.as_str())
    }
}
