//! Priority heuristics for the list scheduler.
//!
//! Ordering rules:
//!  1. maximum delay (the longest path to the graph leaf), which is the
//!     order of the candidate list;
//!  2. an instruction that frees a register (holds the last use of some
//!     live variable);
//!  3. the instruction with the most dependent instructions.
//! Rules 2 and 3 only matter when issue conflicts prevent choosing by
//! rule 1.

use crate::fx::{FxHashMap, FxHashSet};
use crate::isa::MOp;
use crate::mir::MirFunction;
use crate::sched::graph::{SchedGraph, SgNode};
use crate::traverse;
use kestrel_entity::EntityRef;
use log::trace;

/// A large sentinel for "not ready for a long time".
const HUGE_LATENCY: i64 = i64::MAX / 2;

/// The ready list and priority state for one block's schedule.
pub struct SchedPriorities {
    cur_time: i64,
    /// Longest path to the leaf, per node.
    delays: Vec<i64>,
    /// Earliest cycle each node can start.
    earliest: Vec<i64>,
    earliest_ready_time: i64,
    /// Ready candidates ordered by decreasing delay.
    cands: Vec<(SgNode, i64)>,
    cands_set: FxHashSet<SgNode>,
    /// Indexes into `cands` of the current max-delay group.
    mcands: Vec<usize>,
    next_to_try: usize,
    /// Whether each node's MI holds a last use of some live value.
    last_use: FxHashMap<SgNode, bool>,
}

impl SchedPriorities {
    /// Compute delays and set up the (empty) ready list.
    ///
    /// `last_use` maps the nodes whose instruction frees a register.
    pub fn new(graph: &SchedGraph, last_use: FxHashMap<SgNode, bool>) -> Self {
        let n = graph.num_nodes();
        let mut prio = Self {
            cur_time: 0,
            delays: vec![0; n],
            earliest: vec![0; n],
            earliest_ready_time: 0,
            cands: Vec::new(),
            cands_set: FxHashSet::default(),
            mcands: Vec::new(),
            next_to_try: 0,
            last_use,
        };
        prio.compute_delays(graph);
        prio
    }

    /// Insert the initial ready nodes: the real roots hanging off the entry
    /// sentinel.
    pub fn initialize(&mut self, graph: &SchedGraph) {
        let succs: Vec<SgNode> = graph
            .out_edges(graph.root)
            .map(|e| graph.edge(e).sink)
            .collect();
        for s in succs {
            self.insert_ready(graph, s);
        }
    }

    fn compute_delays(&mut self, graph: &SchedGraph) {
        // Longest path to the leaf: walk in post-order over successors so
        // every sink's delay is final before its sources are visited.
        let order = traverse::post_order(graph.root.index(), graph.num_nodes(), |n, visit| {
            for e in graph.out_edges(SgNode::new(n)) {
                visit(graph.edge(e).sink.index());
            }
        });
        for idx in order {
            let node = SgNode::new(idx);
            let mut delay = 0i64;
            let mut has_out = false;
            for e in graph.out_edges(node) {
                has_out = true;
                let edge = graph.edge(e);
                delay = delay.max(self.delays[edge.sink.index()] + edge.min_delay as i64);
            }
            if !has_out {
                delay = graph.node(node).latency as i64;
            }
            self.delays[idx] = delay;
        }
    }

    /// The current time.
    pub fn time(&self) -> i64 {
        self.cur_time
    }

    /// Earliest cycle at which some ready candidate can start.
    pub fn earliest_ready_time(&self) -> i64 {
        self.earliest_ready_time
    }

    /// Number of ready candidates.
    pub fn num_ready(&self) -> usize {
        self.cands.len()
    }

    /// Is `node` in the ready list?
    pub fn node_is_ready(&self, node: SgNode) -> bool {
        self.cands_set.contains(&node)
    }

    /// Advance to cycle `c`: restart the max-delay scan.
    pub fn update_time(&mut self, c: i64) {
        self.cur_time = c;
        self.next_to_try = 0;
        self.mcands.clear();
    }

    /// Add `node` to the ready list, keeping the list sorted by decreasing
    /// delay.
    pub fn insert_ready(&mut self, graph: &SchedGraph, node: SgNode) {
        let delay = self.delays[node.index()];
        let pos = self
            .cands
            .iter()
            .position(|&(_, d)| d < delay)
            .unwrap_or(self.cands.len());
        self.cands.insert(pos, (node, delay));
        self.cands_set.insert(node);
        self.earliest_ready_time = self
            .earliest_ready_time
            .min(self.earliest[node.index()]);
        let _ = graph;
        trace!(
            "ready: {} delay {} earliest {}",
            node,
            delay,
            self.earliest[node.index()]
        );
    }

    /// Note that `node` issued at `time`: drop it from the ready list and
    /// push its successors' earliest start times forward.
    pub fn issued_ready_node_at(&mut self, graph: &SchedGraph, time: i64, node: SgNode) {
        if let Some(pos) = self.cands.iter().position(|&(n, _)| n == node) {
            self.cands.remove(pos);
        }
        self.cands_set.remove(&node);
        self.mcands.clear();
        self.next_to_try = 0;

        if self.earliest_ready_time == self.earliest[node.index()] {
            // The removed node may have defined the earliest ready time.
            self.earliest_ready_time = self
                .cands
                .iter()
                .map(|&(n, _)| self.earliest[n.index()])
                .min()
                .unwrap_or(HUGE_LATENCY);
        }

        let updates: Vec<(SgNode, i64)> = graph
            .out_edges(node)
            .map(|e| {
                let edge = graph.edge(e);
                (edge.sink, time + edge.min_delay as i64)
            })
            .collect();
        for (sink, t) in updates {
            let e = &mut self.earliest[sink.index()];
            *e = (*e).max(t);
        }
    }

    /// The earliest start time recorded for `node`.
    pub fn earliest_for(&self, node: SgNode) -> i64 {
        self.earliest[node.index()]
    }

    /// Pick the next highest-priority candidate that is ready in the
    /// current cycle and feasible per `feasible`.
    pub fn next_highest(
        &mut self,
        graph: &SchedGraph,
        mir: &MirFunction,
        cur_time: i64,
        feasible: impl Fn(MOp) -> bool,
    ) -> Option<SgNode> {
        loop {
            if self.mcands.is_empty() {
                self.find_set_with_max_delay();
                if self.mcands.is_empty() {
                    return None;
                }
            }

            // Rule 1: a unique max-delay candidate wins outright.
            let mut next_idx = if self.mcands.len() == 1 { Some(0) } else { None };

            // Rule 2: prefer an instruction holding a last use.
            if next_idx.is_none() {
                next_idx = self
                    .mcands
                    .iter()
                    .position(|&ci| *self.last_use.get(&self.cands[ci].0).unwrap_or(&false));
            }

            // Rule 3: otherwise the candidate with the most dependents.
            if next_idx.is_none() {
                let mut best = 0usize;
                let mut best_uses = usize::MIN;
                for (i, &ci) in self.mcands.iter().enumerate() {
                    let uses = graph.out_edges(self.cands[ci].0).count();
                    if uses > best_uses {
                        best_uses = uses;
                        best = i;
                    }
                }
                next_idx = Some(best);
            }

            let idx = next_idx.unwrap();
            let node = self.cands[self.mcands[idx]].0;
            if self.earliest[node.index()] > cur_time || !feasible(graph.op(mir, node)) {
                self.mcands.remove(idx);
                continue;
            }
            self.mcands.remove(idx);
            return Some(node);
        }
    }

    fn find_set_with_max_delay(&mut self) {
        if !self.mcands.is_empty() || self.next_to_try >= self.cands.len() {
            return;
        }
        // Collect the group of candidates sharing the next highest delay.
        let max_delay = self.cands[self.next_to_try].1;
        let mut next = self.next_to_try;
        while next < self.cands.len() && self.cands[next].1 == max_delay {
            self.mcands.push(next);
            next += 1;
        }
        self.next_to_try = next;
        trace!(
            "cycle {}: {} candidates at delay {}",
            self.cur_time,
            self.mcands.len(),
            max_delay
        );
    }

    /// The computed delay of `node` (longest path to the leaf).
    pub fn delay_of(&self, node: SgNode) -> i64 {
        self.delays[node.index()]
    }
}
