//! Resolution of identical-SBP port pairs into per-port SBP hints.
//!
//! Pairs declared during rewriting, plus pairs between input ports of one operator that
//! read the same tensor, are merged into equivalence classes. Every class must end up
//! with exactly one SBP: values known on any member propagate to all members, disagreeing
//! values are an error and a class with no known value is an error.

use std::collections::HashMap;

use thiserror::Error;

use crate::graph::{JobBuilder, OpGraph};
use crate::job::{LogicalBlobId, OpBlobArg, SbpParallel};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SbpError {
    #[error("identical-SBP ports disagree: {first} is {first_sbp} but {second} is {second_sbp}")]
    SbpMismatch {
        first: OpBlobArg,
        first_sbp: SbpParallel,
        second: OpBlobArg,
        second_sbp: SbpParallel,
    },
    #[error("no SBP is known for any of the identical ports [{ports}]")]
    SbpUnresolved { ports: String },
}

/// Binds every input port of an operator to the first of its ports reading the same tensor.
pub fn bind_identical_sbp_oba_pairs_between_ibns(builder: &mut JobBuilder<'_>) {
    let mut pairs = Vec::new();
    for op in &builder.job().net {
        let mut groups: Vec<(&LogicalBlobId, Vec<String>)> = Vec::new();
        for (ibn, lbi) in op.input_ports() {
            match groups.iter_mut().find(|(seen, _)| *seen == lbi) {
                Some((_, ibns)) => ibns.push(ibn),
                None => groups.push((lbi, vec![ibn])),
            }
        }
        for (_, ibns) in groups {
            let Some((first, rest)) = ibns.split_first() else {
                continue;
            };
            for ibn in rest {
                pairs.push((
                    OpBlobArg::new(op.name.clone(), first.clone()),
                    OpBlobArg::new(op.name.clone(), ibn.clone()),
                ));
            }
        }
    }
    for (first, second) in pairs {
        builder.bind_identical_sbp_oba_pair(first, second);
    }
}

/// Disjoint sets over port indices.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Resolves all declared pairs and writes the resolved SBP onto every port of every pair.
pub fn resolve_identical_sbp_oba_pairs(
    op_graph: &OpGraph,
    builder: &mut JobBuilder<'_>,
) -> Result<usize, SbpError> {
    let mut obas: Vec<OpBlobArg> = Vec::new();
    let mut index_of: HashMap<OpBlobArg, usize> = HashMap::new();
    let mut intern = |oba: &OpBlobArg, obas: &mut Vec<OpBlobArg>| -> usize {
        *index_of.entry(oba.clone()).or_insert_with(|| {
            obas.push(oba.clone());
            obas.len() - 1
        })
    };
    let mut edges = Vec::with_capacity(builder.identical_sbp_oba_pairs().len());
    for pair in builder.identical_sbp_oba_pairs() {
        let a = intern(&pair.first, &mut obas);
        let b = intern(&pair.second, &mut obas);
        edges.push((a, b));
    }

    let mut sets = UnionFind::new(obas.len());
    for (a, b) in edges {
        sets.union(a, b);
    }
    let mut classes: Vec<Vec<usize>> = Vec::new();
    let mut class_of_root: HashMap<usize, usize> = HashMap::new();
    for index in 0..obas.len() {
        let root = sets.find(index);
        let class = *class_of_root.entry(root).or_insert_with(|| {
            classes.push(Vec::new());
            classes.len() - 1
        });
        classes[class].push(index);
    }

    for members in &classes {
        let mut resolved: Option<(usize, SbpParallel)> = None;
        for &member in members {
            let oba = &obas[member];
            let known = op_graph
                .sbp_parallel4oba(oba)
                .copied()
                .or_else(|| builder.sbp_parallel4oba(oba));
            let Some(sbp) = known else {
                continue;
            };
            let Some((first, first_sbp)) = resolved else {
                resolved = Some((member, sbp));
                continue;
            };
            if first_sbp != sbp {
                return Err(SbpError::SbpMismatch {
                    first: obas[first].clone(),
                    first_sbp,
                    second: oba.clone(),
                    second_sbp: sbp,
                });
            }
        }
        let Some((_, sbp)) = resolved else {
            let ports = members
                .iter()
                .map(|member| obas[*member].to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(SbpError::SbpUnresolved { ports });
        };
        for &member in members {
            builder.set_sbp_parallel4oba(&obas[member], sbp);
        }
    }
    log::debug!(
        "resolved {} identical-SBP classes over {} ports",
        classes.len(),
        obas.len()
    );
    Ok(classes.len())
}

/// Final step of the training rewrite: alias binding then pair resolution.
pub fn update_op_sbp_signature_hint(
    op_graph: &OpGraph,
    builder: &mut JobBuilder<'_>,
) -> Result<usize, SbpError> {
    bind_identical_sbp_oba_pairs_between_ibns(builder);
    resolve_identical_sbp_oba_pairs(op_graph, builder)
}
