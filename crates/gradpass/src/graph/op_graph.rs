use std::collections::{BTreeMap, HashMap, VecDeque};

use smallvec::SmallVec;

use crate::graph::GraphError;
use crate::job::{
    Job, LogicalBlobDesc, LogicalBlobId, OpBlobArg, OperatorConf, ParallelConf, SbpParallel,
    SbpSignature,
};

/// Stable identifier of a node: its position in the job's op list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct NodeId(pub u32);

/// One forward operator with its placement and SBP signature.
#[derive(Debug, Clone)]
pub struct OpNode {
    id: NodeId,
    op_conf: OperatorConf,
    parallel_conf: ParallelConf,
    sbp_signature: SbpSignature,
}

impl OpNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn op_name(&self) -> &str {
        &self.op_conf.name
    }

    pub fn op_conf(&self) -> &OperatorConf {
        &self.op_conf
    }

    pub fn parallel_conf(&self) -> &ParallelConf {
        &self.parallel_conf
    }

    pub fn sbp_signature(&self) -> &SbpSignature {
        &self.sbp_signature
    }

    pub fn sbp_parallel4bn(&self, bn: &str) -> Option<&SbpParallel> {
        self.sbp_signature.get(bn)
    }

    /// SBP of `lbi` as seen by this operator, through whichever port binds it.
    pub fn sbp_parallel4lbi(&self, lbi: &LogicalBlobId) -> Option<&SbpParallel> {
        let op = &self.op_conf;
        op.input_bns()
            .into_iter()
            .chain(op.output_bns())
            .filter(|bn| op.bn_in_op2lbi(bn).as_ref() == Some(lbi))
            .find_map(|bn| self.sbp_signature.get(&bn))
    }

    pub fn is_variable(&self) -> bool {
        self.op_conf.as_variable().is_some()
    }
}

/// Immutable view of a forward job: nodes, producer/consumer edges, topological order.
///
/// The graph owns a snapshot of the operator confs it was built from, so the job itself
/// can be mutated through a [`crate::graph::JobBuilder`] while the view is alive.
#[derive(Debug, Clone)]
pub struct OpGraph {
    nodes: Vec<OpNode>,
    op_name2node: HashMap<String, NodeId>,
    consumers: HashMap<LogicalBlobId, SmallVec<[(NodeId, String); 2]>>,
    logical_blob_descs: BTreeMap<LogicalBlobId, LogicalBlobDesc>,
    topo_order: Vec<NodeId>,
}

impl OpGraph {
    /// Indexes `job` and validates that every input has a producer and the graph is acyclic.
    ///
    /// Single-device operators without an explicit SBP signature default every port to
    /// broadcast, since all layouts coincide on one device.
    pub fn new(job: &Job) -> Result<Self, GraphError> {
        let mut nodes = Vec::with_capacity(job.net.len());
        let mut op_name2node = HashMap::with_capacity(job.net.len());
        for (index, op_conf) in job.net.iter().enumerate() {
            let id = NodeId(index as u32);
            if op_name2node.insert(op_conf.name.clone(), id).is_some() {
                return Err(GraphError::DuplicateOpName {
                    op_name: op_conf.name.clone(),
                });
            }
            let parallel_conf = job.placement.parallel_conf4op_name(&op_conf.name).clone();
            let mut sbp_signature = job
                .sbp_conf
                .op_name2sbp_signature
                .get(&op_conf.name)
                .cloned()
                .unwrap_or_default();
            if parallel_conf.parallel_num <= 1 {
                for bn in op_conf.input_bns().into_iter().chain(op_conf.output_bns()) {
                    sbp_signature
                        .bn_in_op2sbp_parallel
                        .entry(bn)
                        .or_insert(SbpParallel::Broadcast);
                }
            }
            nodes.push(OpNode {
                id,
                op_conf: op_conf.clone(),
                parallel_conf,
                sbp_signature,
            });
        }

        let mut consumers: HashMap<LogicalBlobId, SmallVec<[(NodeId, String); 2]>> =
            HashMap::new();
        let mut in_degree = vec![0usize; nodes.len()];
        let mut successors: Vec<Vec<NodeId>> = vec![Vec::new(); nodes.len()];
        for node in &nodes {
            for (ibn, lbi) in node.op_conf.input_ports() {
                let producer = *op_name2node.get(&lbi.op_name).ok_or_else(|| {
                    GraphError::DanglingInput {
                        oba: OpBlobArg::new(node.op_name(), ibn.clone()),
                        lbi: lbi.clone(),
                    }
                })?;
                let produces = nodes[producer.0 as usize]
                    .op_conf
                    .output_bns()
                    .iter()
                    .any(|obn| *obn == lbi.blob_name);
                if !produces {
                    return Err(GraphError::DanglingInput {
                        oba: OpBlobArg::new(node.op_name(), ibn.clone()),
                        lbi: lbi.clone(),
                    });
                }
                consumers
                    .entry(lbi.clone())
                    .or_default()
                    .push((node.id, ibn));
                successors[producer.0 as usize].push(node.id);
                in_degree[node.id.0 as usize] += 1;
            }
        }

        let mut ready: VecDeque<NodeId> = nodes
            .iter()
            .filter(|node| in_degree[node.id.0 as usize] == 0)
            .map(|node| node.id)
            .collect();
        let mut topo_order = Vec::with_capacity(nodes.len());
        while let Some(id) = ready.pop_front() {
            topo_order.push(id);
            for succ in &successors[id.0 as usize] {
                let degree = &mut in_degree[succ.0 as usize];
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*succ);
                }
            }
        }
        if topo_order.len() != nodes.len() {
            let op_name = nodes
                .iter()
                .find(|node| in_degree[node.id.0 as usize] > 0)
                .map(|node| node.op_name().to_string())
                .unwrap_or_default();
            return Err(GraphError::Cycle { op_name });
        }

        Ok(Self {
            nodes,
            op_name2node,
            consumers,
            logical_blob_descs: job.helper.lbn2logical_blob_desc.clone(),
            topo_order,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &OpNode {
        &self.nodes[id.0 as usize]
    }

    pub fn op_node4op_name(&self, op_name: &str) -> Option<&OpNode> {
        self.op_name2node.get(op_name).map(|id| self.node(*id))
    }

    pub fn producer(&self, lbi: &LogicalBlobId) -> Option<&OpNode> {
        self.op_node4op_name(&lbi.op_name)
    }

    /// Consumers of `lbi` as `(node, input blob name)`; one entry per consuming port.
    pub fn consumers(&self, lbi: &LogicalBlobId) -> &[(NodeId, String)] {
        self.consumers
            .get(lbi)
            .map(|entries| entries.as_slice())
            .unwrap_or(&[])
    }

    pub fn logical_blob_desc(&self, lbi: &LogicalBlobId) -> Option<&LogicalBlobDesc> {
        self.logical_blob_descs.get(lbi)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &OpNode> {
        self.nodes.iter()
    }

    pub fn topo_order(&self) -> impl Iterator<Item = &OpNode> {
        self.topo_order.iter().map(|id| self.node(*id))
    }

    pub fn reverse_topo_order(&self) -> impl Iterator<Item = &OpNode> {
        self.topo_order.iter().rev().map(|id| self.node(*id))
    }

    /// SBP bound to a port of a forward operator.
    pub fn sbp_parallel4oba(&self, oba: &OpBlobArg) -> Option<&SbpParallel> {
        let node = self.op_node4op_name(&oba.op_name)?;
        let lbi = node.op_conf.bn_in_op2lbi(&oba.bn_in_op)?;
        node.sbp_parallel4lbi(&lbi)
    }

    /// Nodes reachable from `seeds` following consumer edges, seeds included.
    pub fn descendants_of(&self, seeds: impl IntoIterator<Item = NodeId>) -> Vec<bool> {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = seeds.into_iter().collect();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut visited[id.0 as usize], true) {
                continue;
            }
            for lbi in self.node(id).op_conf.output_lbis() {
                for (consumer, _) in self.consumers(&lbi) {
                    if !visited[consumer.0 as usize] {
                        stack.push(*consumer);
                    }
                }
            }
        }
        visited
    }

    /// Nodes reachable from `seeds` following producer edges, seeds included.
    pub fn ancestors_of(&self, seeds: impl IntoIterator<Item = NodeId>) -> Vec<bool> {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = seeds.into_iter().collect();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut visited[id.0 as usize], true) {
                continue;
            }
            for (_, lbi) in self.node(id).op_conf.input_ports() {
                if let Some(producer) = self.op_name2node.get(&lbi.op_name) {
                    if !visited[producer.0 as usize] {
                        stack.push(*producer);
                    }
                }
            }
        }
        visited
    }
}
