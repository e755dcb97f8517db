//! Live-variable analysis over the machine IR.
//!
//! Classic backward data-flow, one def/use set per basic block, iterated to
//! a fixed point over the predecessors. Values flowing into a phi are live
//! only on the edge from their source block; the per-block phi-argument map
//! filters the propagation accordingly.

use crate::flowgraph::ControlFlowGraph;
use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{Block, Function, InstructionData, Opcode, Value};
use crate::mir::{MachInst, MirFunction};
use kestrel_entity::SecondaryMap;
use log::trace;

/// The result of live-variable analysis for one function.
pub struct LiveVarInfo {
    /// Values live at block entry.
    pub live_in: SecondaryMap<Block, FxHashSet<Value>>,
    /// Values live at block exit.
    pub live_out: SecondaryMap<Block, FxHashSet<Value>>,
    phi_arg_map: SecondaryMap<Block, FxHashMap<Value, Block>>,
}

/// Per-instruction live sets inside one block, in machine-code order.
pub struct BlockLiveSets {
    /// `after[i]` is the set of values live immediately after the `i`th MI.
    pub after: Vec<FxHashSet<Value>>,
    /// `before[i]` is the set live immediately before the `i`th MI.
    pub before: Vec<FxHashSet<Value>>,
}

impl LiveVarInfo {
    /// Run the analysis.
    pub fn compute(func: &Function, mir: &MirFunction, cfg: &ControlFlowGraph) -> Self {
        let mut info = LiveVarInfo {
            live_in: SecondaryMap::new(),
            live_out: SecondaryMap::new(),
            phi_arg_map: SecondaryMap::new(),
        };

        // A value flowing into a phi of block b from predecessor p is live
        // out of p only.
        for &block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                if func.dfg.opcode(inst) != Opcode::Phi {
                    break;
                }
                if let InstructionData::Phi { args, blocks } = func.dfg.inst(inst) {
                    for (&arg, &pred) in args.iter().zip(blocks.iter()) {
                        info.phi_arg_map[block].insert(arg, pred);
                    }
                }
            }
        }

        // Per-block gen (used before defined) and kill (defined) sets.
        let mut gen: SecondaryMap<Block, FxHashSet<Value>> = SecondaryMap::new();
        let mut kill: SecondaryMap<Block, FxHashSet<Value>> = SecondaryMap::new();
        for &block in func.layout.blocks() {
            let (g, k) = block_gen_kill(mir, block);
            gen[block] = g;
            kill[block] = k;
        }

        // Iterate to a fixed point. Process in reverse layout order, which
        // approximates post-order and converges quickly.
        let blocks: Vec<Block> = func.layout.blocks().to_vec();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in blocks.iter().rev() {
                let mut new_in = info.live_out[block].clone();
                for v in &kill[block] {
                    new_in.remove(v);
                }
                for v in &gen[block] {
                    new_in.insert(*v);
                }
                if new_in != info.live_in[block] {
                    info.live_in[block] = new_in;
                }
                // Propagate into predecessors' out sets, filtering phi
                // arguments by their source edge.
                for &pred in &cfg.preds[block] {
                    for v in info.live_in[block].clone() {
                        let ok = match info.phi_arg_map[block].get(&v) {
                            Some(&src) => src == pred,
                            None => true,
                        };
                        if ok && info.live_out[pred].insert(v) {
                            changed = true;
                        }
                    }
                }
            }
        }

        for &block in &blocks {
            trace!(
                "liveness {}: in={} out={}",
                block,
                info.live_in[block].len(),
                info.live_out[block].len()
            );
        }
        info
    }

    /// Compute the live set before and after every MI of `block`.
    pub fn block_live_sets(&self, mir: &MirFunction, block: Block) -> BlockLiveSets {
        let code = &mir.block_code[block];
        let n = code.len();
        let mut after = vec![FxHashSet::default(); n];
        let mut before = vec![FxHashSet::default(); n];
        let mut live = self.live_out[block].clone();
        for i in (0..n).rev() {
            after[i] = live.clone();
            apply_mi_backward(mir, code[i], &mut live);
            before[i] = live.clone();
        }
        BlockLiveSets { after, before }
    }

    /// Does the `i`th MI of `block` contain the last use of some value?
    pub fn mi_has_last_use(&self, mir: &MirFunction, block: Block, sets: &BlockLiveSets, i: usize) -> bool {
        let mi = mir.block_code[block][i];
        let mut last = false;
        mir.mi(mi).for_each_value_operand(|_, v, is_def| {
            if !is_def && !sets.after[i].contains(&v) {
                last = true;
            }
        });
        for r in &mir.mi(mi).implicit {
            if !r.is_def && !sets.after[i].contains(&r.value) {
                last = true;
            }
        }
        last
    }
}

fn block_gen_kill(mir: &MirFunction, block: Block) -> (FxHashSet<Value>, FxHashSet<Value>) {
    let mut gen = FxHashSet::default();
    let mut kill = FxHashSet::default();
    // Reverse scan: a def kills later uses; a use after the scan point
    // re-gens.
    for &mi in mir.block_code[block].iter().rev() {
        for_defs(mir, mi, |v| {
            gen.remove(&v);
            kill.insert(v);
        });
        for_uses(mir, mi, |v| {
            gen.insert(v);
        });
    }
    (gen, kill)
}

fn apply_mi_backward(mir: &MirFunction, mi: MachInst, live: &mut FxHashSet<Value>) {
    for_defs(mir, mi, |v| {
        live.remove(&v);
    });
    for_uses(mir, mi, |v| {
        live.insert(v);
    });
}

fn for_defs(mir: &MirFunction, mi: MachInst, mut f: impl FnMut(Value)) {
    let data = mir.mi(mi);
    data.for_each_value_operand(|_, v, is_def| {
        if is_def {
            f(v);
        }
    });
    for r in &data.implicit {
        if r.is_def {
            f(r.value);
        }
    }
}

fn for_uses(mir: &MirFunction, mi: MachInst, mut f: impl FnMut(Value)) {
    let data = mir.mi(mi);
    for op in &data.operands {
        if let Some(v) = op.value() {
            if !op.is_def || op.is_def_and_use {
                f(v);
            }
        }
    }
    for r in &data.implicit {
        if !r.is_def || r.is_def_and_use {
            f(r.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Signature, Type};
    use crate::isa::MOp;
    use crate::mir::MachInstData;

    #[test]
    fn straight_line_liveness() {
        let mut func = Function::new("f", Signature::new(vec![Type::I64], Type::I64));
        let x = func.args[0];
        let block = func.create_block();
        let (add, _) = func.append_inst(
            block,
            InstructionData::Return { value: Some(x) },
            Type::VOID,
        );

        let mut mir = MirFunction::new();
        // add x, 1 -> t; ret-ish use of t.
        let t = func.dfg.make_value(Type::I64, crate::ir::ValueDef::Temp(add));
        let m1 = mir.create(MachInstData::new(MOp::Add).vreg_use(x).simm(1).vreg_def(t));
        let m2 = mir.create(MachInstData::new(MOp::Sub).vreg_use(t).simm(0).vreg_def(t));
        mir.append_to_block(block, m1);
        mir.append_to_block(block, m2);

        let cfg = ControlFlowGraph::compute(&func);
        let lvi = LiveVarInfo::compute(&func, &mir, &cfg);
        assert!(lvi.live_in[block].contains(&x));
        assert!(!lvi.live_in[block].contains(&t));
        assert!(lvi.live_out[block].is_empty());

        let sets = lvi.block_live_sets(&mir, block);
        // x dies at the first MI, t is live between the two.
        assert!(sets.before[0].contains(&x));
        assert!(sets.after[0].contains(&t));
        assert!(!sets.after[0].contains(&x));
        assert!(lvi.mi_has_last_use(&mir, block, &sets, 0));
        assert!(lvi.mi_has_last_use(&mir, block, &sets, 1));
    }

    #[test]
    fn value_live_across_blocks() {
        let mut func = Function::new("f", Signature::new(vec![Type::I64], Type::VOID));
        let x = func.args[0];
        let b0 = func.create_block();
        let b1 = func.create_block();
        func.append_inst(
            b0,
            InstructionData::Branch {
                cond: None,
                then_dest: b1,
                else_dest: None,
            },
            Type::VOID,
        );
        let (ret, _) = func.append_inst(b1, InstructionData::Return { value: None }, Type::VOID);

        let mut mir = MirFunction::new();
        let t = func.dfg.make_value(Type::I64, crate::ir::ValueDef::Temp(ret));
        let m = mir.create(MachInstData::new(MOp::Add).vreg_use(x).simm(0).vreg_def(t));
        mir.append_to_block(b1, m);

        let cfg = ControlFlowGraph::compute(&func);
        let lvi = LiveVarInfo::compute(&func, &mir, &cfg);
        assert!(lvi.live_out[b0].contains(&x));
        assert!(lvi.live_in[b0].contains(&x));
        assert!(lvi.live_in[b1].contains(&x));
    }
}
