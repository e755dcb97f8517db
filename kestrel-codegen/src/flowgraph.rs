//! The control-flow graph of a function.
//!
//! Predecessor and successor lists are computed once from the terminators
//! and stored in secondary maps. Loop depth per block is derived from DFS
//! back edges and weights the allocator's spill costs.

use crate::ir::{Block, Function};
use crate::traverse;
use kestrel_entity::{EntityRef, SecondaryMap};

/// Pred/succ lists and loop depths for one function.
pub struct ControlFlowGraph {
    /// Successor blocks, in terminator order.
    pub succs: SecondaryMap<Block, Vec<Block>>,
    /// Predecessor blocks, unordered.
    pub preds: SecondaryMap<Block, Vec<Block>>,
    /// Loop nesting depth; 0 outside any loop.
    pub loop_depth: SecondaryMap<Block, u32>,
}

impl ControlFlowGraph {
    /// Compute the CFG of `func`.
    pub fn compute(func: &Function) -> Self {
        let mut succs: SecondaryMap<Block, Vec<Block>> = SecondaryMap::new();
        let mut preds: SecondaryMap<Block, Vec<Block>> = SecondaryMap::new();

        for &block in func.layout.blocks() {
            if let Some(term) = func.layout.terminator(block) {
                for succ in func.dfg.successors(term) {
                    succs[block].push(succ);
                    preds[succ].push(block);
                }
            }
        }

        let loop_depth = compute_loop_depth(func, &succs);
        Self {
            succs,
            preds,
            loop_depth,
        }
    }

    /// Post-order over blocks reachable from the entry.
    pub fn post_order(&self, func: &Function) -> Vec<Block> {
        let entry = match func.entry_block() {
            Some(e) => e,
            None => return Vec::new(),
        };
        let n = func.layout.blocks().len();
        traverse::post_order(entry.index(), n, |b, visit| {
            for s in &self.succs[Block::new(b)] {
                visit(s.index());
            }
        })
        .into_iter()
        .map(Block::new)
        .collect()
    }
}

// Natural-loop depth from DFS back edges: for each back edge (tail, head),
// the loop body is everything that reaches tail without passing head.
fn compute_loop_depth(
    func: &Function,
    succs: &SecondaryMap<Block, Vec<Block>>,
) -> SecondaryMap<Block, u32> {
    let mut depth: SecondaryMap<Block, u32> = SecondaryMap::new();
    let entry = match func.entry_block() {
        Some(e) => e,
        None => return depth,
    };

    // DFS with an on-stack marker to find back edges.
    let nblocks = func.layout.blocks().len();
    let mut state = vec![0u8; nblocks]; // 0 unvisited, 1 on stack, 2 done
    let mut back_edges: Vec<(Block, Block)> = Vec::new();
    let mut stack: Vec<(Block, usize)> = vec![(entry, 0)];
    state[entry.index()] = 1;

    while let Some(&mut (block, ref mut pos)) = stack.last_mut() {
        if let Some(&succ) = succs[block].get(*pos) {
            *pos += 1;
            match state[succ.index()] {
                0 => {
                    state[succ.index()] = 1;
                    stack.push((succ, 0));
                }
                1 => back_edges.push((block, succ)),
                _ => {}
            }
        } else {
            state[block.index()] = 2;
            stack.pop();
        }
    }

    // Collect each natural loop body by walking predecessors from the tail.
    let mut preds: SecondaryMap<Block, Vec<Block>> = SecondaryMap::new();
    for &block in func.layout.blocks() {
        for &s in &succs[block] {
            preds[s].push(block);
        }
    }

    for &(tail, head) in &back_edges {
        let mut body = vec![head, tail];
        let mut work = vec![tail];
        while let Some(b) = work.pop() {
            if b == head {
                continue;
            }
            for &p in &preds[b] {
                if !body.contains(&p) {
                    body.push(p);
                    work.push(p);
                }
            }
        }
        for b in body {
            depth[b] += 1;
        }
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, InstructionData, Signature, Type};

    fn branch_to(func: &mut Function, from: Block, to: Block) {
        func.append_inst(
            from,
            InstructionData::Branch {
                cond: None,
                then_dest: to,
                else_dest: None,
            },
            Type::VOID,
        );
    }

    #[test]
    fn diamond_cfg() {
        let mut func = Function::new("f", Signature::new(vec![], Type::VOID));
        let b0 = func.create_block();
        let b1 = func.create_block();
        let b2 = func.create_block();
        let b3 = func.create_block();
        let c = func.dfg.iconst(Type::BOOL, 1);
        func.append_inst(
            b0,
            InstructionData::Branch {
                cond: Some(c),
                then_dest: b1,
                else_dest: Some(b2),
            },
            Type::VOID,
        );
        branch_to(&mut func, b1, b3);
        branch_to(&mut func, b2, b3);
        func.append_inst(b3, InstructionData::Return { value: None }, Type::VOID);

        let cfg = ControlFlowGraph::compute(&func);
        assert_eq!(cfg.succs[b0], vec![b1, b2]);
        assert_eq!(cfg.preds[b3], vec![b1, b2]);
        assert_eq!(cfg.loop_depth[b1], 0);

        let po = cfg.post_order(&func);
        assert_eq!(po.last(), Some(&b0));
    }

    #[test]
    fn single_loop_depth() {
        let mut func = Function::new("f", Signature::new(vec![], Type::VOID));
        let b0 = func.create_block();
        let b1 = func.create_block();
        let b2 = func.create_block();
        let c = func.dfg.iconst(Type::BOOL, 1);
        branch_to(&mut func, b0, b1);
        func.append_inst(
            b1,
            InstructionData::Branch {
                cond: Some(c),
                then_dest: b1,
                else_dest: Some(b2),
            },
            Type::VOID,
        );
        func.append_inst(b2, InstructionData::Return { value: None }, Type::VOID);

        let cfg = ControlFlowGraph::compute(&func);
        assert_eq!(cfg.loop_depth[b0], 0);
        assert_eq!(cfg.loop_depth[b1], 1);
        assert_eq!(cfg.loop_depth[b2], 0);
    }
}
