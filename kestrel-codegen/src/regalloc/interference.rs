//! The interference graph of one register class.
//!
//! One IG node per live range of the class. Adjacency lists are updated
//! only by appending; removal from the graph is simulated by decrementing
//! the effective degree, so the colouring loop sees the shrinking graph
//! without mutating the lists. A symmetric bit matrix answers pairwise
//! interference queries, and coalescing nulls an entry out of the node list
//! without shrinking it, preserving indexes.

use crate::fx::FxHashMap;
use crate::isa::RegClassId;
use crate::regalloc::live_ranges::LrId;
use log::trace;

/// One node of an interference graph.
#[derive(Clone, Debug)]
pub struct IgNode {
    /// The live range this node stands for.
    pub lr: LrId,
    /// Adjacent node indexes; append-only.
    pub adj: Vec<usize>,
    /// Effective degree: decremented as neighbours go on the stack, never
    /// incremented afterwards.
    pub cur_degree: i32,
    /// On the colouring stack (conceptually removed from the graph).
    pub on_stack: bool,
}

/// The interference graph of one register class.
pub struct InterferenceGraph {
    /// The class this graph allocates.
    pub class: RegClassId,
    /// Node list; coalescing nulls entries out, never shrinks.
    pub nodes: Vec<Option<IgNode>>,
    /// Symmetric bit matrix over node index pairs, lower triangle.
    matrix: Vec<bool>,
    ig_of_lr: FxHashMap<LrId, usize>,
}

impl InterferenceGraph {
    /// Create an empty graph for `class`.
    pub fn new(class: RegClassId) -> Self {
        Self {
            class,
            nodes: Vec::new(),
            matrix: Vec::new(),
            ig_of_lr: FxHashMap::default(),
        }
    }

    /// Add a live range to the graph. All ranges must be added before the
    /// matrix is created.
    pub fn add_lr(&mut self, lr: LrId) {
        debug_assert!(self.matrix.is_empty(), "graph already frozen");
        let index = self.nodes.len();
        self.nodes.push(Some(IgNode {
            lr,
            adj: Vec::new(),
            cur_degree: -1,
            on_stack: false,
        }));
        self.ig_of_lr.insert(lr, index);
    }

    /// Number of node slots (including nulled entries).
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// The node index of `lr`, if the range lives in this graph.
    pub fn node_of_lr(&self, lr: LrId) -> Option<usize> {
        self.ig_of_lr.get(&lr).copied()
    }

    /// Allocate the bit matrix once the node set is final.
    pub fn create_matrix(&mut self) {
        let n = self.nodes.len();
        self.matrix = vec![false; n * (n + 1) / 2];
    }

    fn matrix_index(&self, a: usize, b: usize) -> usize {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        hi * (hi + 1) / 2 + lo
    }

    /// Record that `l1` and `l2` interfere.
    pub fn set_interference(&mut self, l1: LrId, l2: LrId) {
        let (Some(a), Some(b)) = (self.node_of_lr(l1), self.node_of_lr(l2)) else {
            return;
        };
        if a == b {
            return;
        }
        let idx = self.matrix_index(a, b);
        if self.matrix[idx] {
            return;
        }
        self.matrix[idx] = true;
        // Adjacency is symmetric and append-only.
        self.nodes[a].as_mut().unwrap().adj.push(b);
        self.nodes[b].as_mut().unwrap().adj.push(a);
    }

    /// Do `l1` and `l2` interfere?
    pub fn interferes(&self, l1: LrId, l2: LrId) -> bool {
        match (self.node_of_lr(l1), self.node_of_lr(l2)) {
            (Some(a), Some(b)) if a != b => self.matrix[self.matrix_index(a, b)],
            _ => false,
        }
    }

    /// Number of neighbours of the node behind `lr`.
    pub fn num_neighbors(&self, lr: LrId) -> usize {
        self.node_of_lr(lr)
            .and_then(|i| self.nodes[i].as_ref())
            .map(|n| n.adj.len())
            .unwrap_or(0)
    }

    /// Merge the IG node of `l2` into the node of `l1` ahead of a live
    /// range union. `l2`'s entry is nulled out; its adjacencies transfer.
    pub fn merge_ig_nodes(&mut self, l1: LrId, l2: LrId) {
        let a = self.node_of_lr(l1).expect("l1 not in graph");
        let b = self.node_of_lr(l2).expect("l2 not in graph");
        debug_assert_ne!(a, b);
        trace!("coalesce ig nodes {} <- {}", a, b);

        let b_node = self.nodes[b].take().expect("l2 already merged");
        for &nbr in &b_node.adj {
            if nbr == a {
                continue;
            }
            // Drop b from the neighbour's adjacency.
            if let Some(nbr_node) = self.nodes[nbr].as_mut() {
                nbr_node.adj.retain(|&x| x != b);
            }
            // Wire a <-> nbr unless already present.
            let idx = self.matrix_index(a, nbr);
            if !self.matrix[idx] {
                self.matrix[idx] = true;
                self.nodes[a].as_mut().unwrap().adj.push(nbr);
                if let Some(nbr_node) = self.nodes[nbr].as_mut() {
                    nbr_node.adj.push(a);
                }
            }
        }
        // a no longer interferes with the vanished b.
        if let Some(a_node) = self.nodes[a].as_mut() {
            a_node.adj.retain(|&x| x != b);
        }
        self.ig_of_lr.remove(&l2);
    }

    /// Set every node's effective degree from its adjacency length. Must be
    /// called after all graph mutations and before colouring.
    pub fn set_cur_degrees(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            node.cur_degree = node.adj.len() as i32;
        }
    }

    /// Push `index` on the conceptual stack: mark it and decrement its
    /// neighbours' effective degrees.
    pub fn push_on_stack(&mut self, index: usize) {
        let adj = {
            let node = self.nodes[index].as_mut().expect("nulled node");
            debug_assert!(!node.on_stack);
            node.on_stack = true;
            node.adj.clone()
        };
        for nbr in adj {
            if let Some(n) = self.nodes[nbr].as_mut() {
                if !n.on_stack && n.cur_degree > 0 {
                    n.cur_degree -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_entity::EntityRef;

    fn lr(i: usize) -> LrId {
        LrId::new(i)
    }

    #[test]
    fn set_and_query() {
        let mut ig = InterferenceGraph::new(RegClassId::Int);
        for i in 0..3 {
            ig.add_lr(lr(i));
        }
        ig.create_matrix();
        ig.set_interference(lr(0), lr(1));
        ig.set_interference(lr(1), lr(2));
        assert!(ig.interferes(lr(0), lr(1)));
        assert!(ig.interferes(lr(1), lr(0)));
        assert!(!ig.interferes(lr(0), lr(2)));
        assert_eq!(ig.num_neighbors(lr(1)), 2);
        // Setting the same pair twice doesn't duplicate adjacency.
        ig.set_interference(lr(0), lr(1));
        assert_eq!(ig.num_neighbors(lr(0)), 1);
    }

    #[test]
    fn merge_transfers_adjacency() {
        let mut ig = InterferenceGraph::new(RegClassId::Int);
        for i in 0..4 {
            ig.add_lr(lr(i));
        }
        ig.create_matrix();
        ig.set_interference(lr(0), lr(2));
        ig.set_interference(lr(1), lr(3));
        // Merge 1 into 0: 0 inherits 3.
        ig.merge_ig_nodes(lr(0), lr(1));
        assert!(ig.interferes(lr(0), lr(3)));
        assert_eq!(ig.node_of_lr(lr(1)), None);
        assert_eq!(ig.num_neighbors(lr(0)), 2);
        // The nulled slot stays in the list.
        assert_eq!(ig.num_nodes(), 4);
        assert!(ig.nodes[1].is_none());
    }

    #[test]
    fn degrees_decrement_on_push() {
        let mut ig = InterferenceGraph::new(RegClassId::Int);
        for i in 0..3 {
            ig.add_lr(lr(i));
        }
        ig.create_matrix();
        ig.set_interference(lr(0), lr(1));
        ig.set_interference(lr(0), lr(2));
        ig.set_cur_degrees();
        assert_eq!(ig.nodes[0].as_ref().unwrap().cur_degree, 2);
        ig.push_on_stack(1);
        assert_eq!(ig.nodes[0].as_ref().unwrap().cur_degree, 1);
    }
}
