//! The per-basic-block scheduling graph.
//!
//! Nodes are the block's machine instructions plus two sentinels; edges
//! capture every ordering constraint the schedule must honour: control
//! dependences around the terminator and delay slots, memory ordering,
//! condition-code traffic around calls, SSA def-use, multiple machine-level
//! definitions of one IR value, and machine-register conflicts.

use crate::fx::FxHashMap;
use crate::ir::{Block, Function, Opcode, Value};
use crate::isa::{MOp, RegNum, TargetIsa, ZERO_REG};
use crate::mir::{MachInst, MirFunction, OperandKind};
use kestrel_entity::{entity_impl, packed_option::PackedOption, PrimaryMap};
use log::trace;
use core::fmt;

/// An opaque reference to a scheduling-graph node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SgNode(u32);
entity_impl!(SgNode, "sn");

/// An opaque reference to a scheduling-graph edge.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SgEdge(u32);
entity_impl!(SgEdge, "se");

/// The dependence family of an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepKind {
    /// Control dependence.
    Control,
    /// Memory ordering.
    Memory,
    /// SSA def-use.
    DefUse,
    /// Conflict on a physical register.
    MachineReg,
    /// Conflict on a machine resource (condition codes around calls).
    MachineResource,
}

/// Order flag: true (read-after-write) dependence.
pub const DEP_TRUE: u8 = 0x1;
/// Order flag: anti (write-after-read) dependence.
pub const DEP_ANTI: u8 = 0x2;
/// Order flag: output (write-after-write) dependence.
pub const DEP_OUTPUT: u8 = 0x4;
/// Order flag: ordering only, no data flows.
pub const DEP_NON_DATA: u8 = 0x8;

/// The resource id used for condition-code ordering around calls.
pub const CC_RESOURCE: i32 = -2;

/// Extra information carried by an edge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EdgePayload {
    /// Nothing.
    None,
    /// The SSA value flowing along a def-use edge.
    Value(Value),
    /// The machine register of a register-conflict edge.
    Reg(RegNum),
    /// The resource of a machine-resource edge.
    Resource(i32),
}

/// One scheduling-graph node.
pub struct SgNodeData {
    /// The machine instruction, none for the two sentinels.
    pub mi: PackedOption<MachInst>,
    /// The owning basic block.
    pub block: Block,
    /// Original position of the MI in the block, -1 for sentinels.
    pub orig_index: i32,
    /// Result latency of the instruction.
    pub latency: i32,
    /// Incoming edges, in insertion order.
    pub in_edges: Vec<SgEdge>,
    /// Outgoing edges, in insertion order.
    pub out_edges: Vec<SgEdge>,
}

impl SgNodeData {
    /// Is this one of the two sentinels?
    pub fn is_dummy(&self) -> bool {
        self.mi.is_none()
    }
}

/// One scheduling-graph edge.
pub struct SgEdgeData {
    /// Source node.
    pub src: SgNode,
    /// Sink node.
    pub sink: SgNode,
    /// Dependence family.
    pub kind: DepKind,
    /// `DEP_*` order flags.
    pub order: u8,
    /// Minimum number of cycles between the starts of src and sink.
    pub min_delay: i32,
    /// Extra payload.
    pub payload: EdgePayload,
    /// Tombstone set when the edge is erased.
    pub dead: bool,
}

/// The scheduling graph of one basic block.
pub struct SchedGraph {
    nodes: PrimaryMap<SgNode, SgNodeData>,
    edges: PrimaryMap<SgEdge, SgEdgeData>,
    /// The entry sentinel.
    pub root: SgNode,
    /// The exit sentinel.
    pub leaf: SgNode,
    node_of_mi: FxHashMap<MachInst, SgNode>,
    /// The block this graph covers.
    pub block: Block,
}

impl SchedGraph {
    /// Number of nodes including the sentinels.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Node data.
    pub fn node(&self, n: SgNode) -> &SgNodeData {
        &self.nodes[n]
    }

    /// Edge data.
    pub fn edge(&self, e: SgEdge) -> &SgEdgeData {
        &self.edges[e]
    }

    /// The node for `mi`, if it is in the graph.
    pub fn node_for_mi(&self, mi: MachInst) -> Option<SgNode> {
        self.node_of_mi.get(&mi).copied()
    }

    /// The opcode behind a non-dummy node.
    pub fn op(&self, mir: &MirFunction, n: SgNode) -> MOp {
        mir.op(self.nodes[n].mi.unwrap())
    }

    /// All node ids, sentinels included.
    pub fn node_ids(&self) -> impl Iterator<Item = SgNode> {
        self.nodes.keys()
    }

    /// Live outgoing edges of `n`.
    pub fn out_edges(&self, n: SgNode) -> impl Iterator<Item = SgEdge> + '_ {
        self.nodes[n]
            .out_edges
            .iter()
            .copied()
            .filter(move |&e| !self.edges[e].dead)
    }

    /// Live incoming edges of `n`.
    pub fn in_edges(&self, n: SgNode) -> impl Iterator<Item = SgEdge> + '_ {
        self.nodes[n]
            .in_edges
            .iter()
            .copied()
            .filter(move |&e| !self.edges[e].dead)
    }

    fn add_node(&mut self, mi: Option<MachInst>, block: Block, index: i32, latency: i32) -> SgNode {
        let node = self.nodes.push(SgNodeData {
            mi: mi.into(),
            block,
            orig_index: index,
            latency,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
        });
        if let Some(mi) = mi {
            self.node_of_mi.insert(mi, node);
        }
        node
    }

    fn add_edge(
        &mut self,
        src: SgNode,
        sink: SgNode,
        kind: DepKind,
        order: u8,
        min_delay: Option<i32>,
        payload: EdgePayload,
    ) -> SgEdge {
        debug_assert_ne!(src, sink);
        let min_delay = min_delay.unwrap_or(self.nodes[src].latency);
        let e = self.edges.push(SgEdgeData {
            src,
            sink,
            kind,
            order,
            min_delay,
            payload,
            dead: false,
        });
        self.nodes[src].out_edges.push(e);
        self.nodes[sink].in_edges.push(e);
        e
    }

    /// Erase one edge, detaching it from both endpoints.
    pub fn erase_edge(&mut self, e: SgEdge) {
        let (src, sink) = (self.edges[e].src, self.edges[e].sink);
        self.edges[e].dead = true;
        self.nodes[src].out_edges.retain(|&x| x != e);
        self.nodes[sink].in_edges.retain(|&x| x != e);
    }

    /// Erase every edge touching `node`. Endpoints left without real edges
    /// get a dummy edge from the root or to the leaf so the rest of the
    /// graph stays anchored.
    pub fn erase_incident_edges(&mut self, node: SgNode, add_dummy_edges: bool) {
        let in_edges: Vec<SgEdge> = self.in_edges(node).collect();
        for e in in_edges {
            let src = self.edges[e].src;
            self.erase_edge(e);
            if add_dummy_edges && src != self.root && self.out_edges(src).next().is_none() {
                self.add_edge(
                    src,
                    self.leaf,
                    DepKind::Control,
                    DEP_NON_DATA,
                    Some(0),
                    EdgePayload::None,
                );
            }
        }
        let out_edges: Vec<SgEdge> = self.out_edges(node).collect();
        for e in out_edges {
            let sink = self.edges[e].sink;
            self.erase_edge(e);
            if add_dummy_edges && sink != self.leaf && self.in_edges(sink).next().is_none() {
                self.add_edge(
                    self.root,
                    sink,
                    DepKind::Control,
                    DEP_NON_DATA,
                    Some(0),
                    EdgePayload::None,
                );
            }
        }
    }

    /// Build the graph for `block`.
    pub fn build(
        isa: &TargetIsa,
        func: &Function,
        mir: &MirFunction,
        block: Block,
    ) -> SchedGraph {
        let mut g = SchedGraph {
            nodes: PrimaryMap::new(),
            edges: PrimaryMap::new(),
            root: SgNode::from_u32(0),
            leaf: SgNode::from_u32(0),
            node_of_mi: FxHashMap::default(),
            block,
        };
        g.root = g.add_node(None, block, -1, 0);
        g.leaf = g.add_node(None, block, -1, 0);

        // Nodes for every MI except the dummy phi markers, gathering
        // memory nodes, machine-register references, and value definitions
        // in the same pass.
        let mut mem_nodes: Vec<SgNode> = Vec::new();
        let mut reg_refs: FxHashMap<RegNum, Vec<(SgNode, usize)>> = FxHashMap::default();
        let mut value_defs: FxHashMap<Value, Vec<(SgNode, usize)>> = FxHashMap::default();

        for (index, &mi) in mir.block_code[block].iter().enumerate() {
            let op = mir.op(mi);
            if op.desc().is_pseudo() {
                continue;
            }
            let node = g.add_node(Some(mi), block, index as i32, op.desc().latency() as i32);
            g.find_def_use_info(mir, node, &mut mem_nodes, &mut reg_refs, &mut value_defs);
        }

        // (1) Control dependences around the terminator and delay slots.
        if let Some(term) = func.layout.terminator(block) {
            g.add_cd_edges(mir, block, term);
        }
        // (2) Memory ordering.
        g.add_mem_edges(mir, &mem_nodes);
        // (3) Condition codes cannot move across calls.
        g.add_call_cc_edges(mir, &mem_nodes, block);
        // (4) SSA def-use edges.
        let node_list: Vec<SgNode> = g.nodes.keys().skip(2).collect();
        for node in node_list {
            g.add_edges_for_instruction(mir, node, &value_defs);
        }
        // (5) Anti/output dependences among multiple defs of one value.
        for &inst in func.layout.block_insts(block) {
            if func.dfg.opcode(inst) != Opcode::Phi {
                g.add_non_ssa_edges_for_inst(mir, inst);
            }
        }
        // (6) Machine-register conflicts.
        g.add_machine_reg_edges(&reg_refs, mir);
        // (7) Anchor nodes without real edges.
        g.add_dummy_edges();

        let _ = isa;
        trace!(
            "sched graph for {}: {} nodes, {} edges",
            block,
            g.nodes.len(),
            g.edges.len()
        );
        g
    }

    fn find_def_use_info(
        &mut self,
        mir: &MirFunction,
        node: SgNode,
        mem_nodes: &mut Vec<SgNode>,
        reg_refs: &mut FxHashMap<RegNum, Vec<(SgNode, usize)>>,
        value_defs: &mut FxHashMap<Value, Vec<(SgNode, usize)>>,
    ) {
        let mi = self.nodes[node].mi.unwrap();
        let desc = mir.op(mi).desc();
        if desc.is_load() || desc.is_store() || desc.is_call() {
            mem_nodes.push(node);
        }
        let data = mir.mi(mi);
        for (i, operand) in data.operands.iter().enumerate() {
            match operand.kind {
                OperandKind::MReg(r) if r != ZERO_REG => {
                    reg_refs.entry(r).or_default().push((node, i));
                }
                OperandKind::VReg(v) | OperandKind::CcReg(v) if operand.is_def => {
                    value_defs.entry(v).or_default().push((node, i));
                }
                _ => {}
            }
        }
        for (i, r) in data.implicit.iter().enumerate() {
            if r.is_def {
                value_defs.entry(r.value).or_default().push((node, i));
            }
        }
    }

    fn add_cd_edges(&mut self, mir: &MirFunction, block: Block, term: crate::ir::Inst) {
        let term_mvec = &mir.inst_code[term].mis;

        // Find the first branch in the terminator expansion.
        let first = match term_mvec
            .iter()
            .position(|&mi| mir.op(mi).desc().is_branch())
        {
            Some(f) => f,
            None => return,
        };
        let first_br = self.node_of_mi[&term_mvec[first]];

        // Each later instruction in the expansion depends on the last
        // preceding branch; latency 0 prevents out-of-order issue only.
        for i in (first + 1..term_mvec.len()).rev() {
            let to = self.node_of_mi[&term_mvec[i]];
            for j in (0..i).rev() {
                if mir.op(term_mvec[j]).desc().is_branch() {
                    let br = self.node_of_mi[&term_mvec[j]];
                    self.add_edge(
                        br,
                        to,
                        DepKind::Control,
                        DEP_NON_DATA,
                        Some(0),
                        EdgePayload::None,
                    );
                    break;
                }
            }
        }
        // Instructions of the expansion before the first branch.
        for i in 0..first {
            let from = self.node_of_mi[&term_mvec[i]];
            self.add_edge(
                from,
                first_br,
                DepKind::Control,
                DEP_NON_DATA,
                Some(0),
                EdgePayload::None,
            );
        }

        // Every other instruction in the block precedes the first branch,
        // and instructions with delay slots bind the instructions occupying
        // them.
        let code = mir.block_code[block].clone();
        for (i, &mi) in code.iter().enumerate() {
            if term_mvec.contains(&mi) {
                continue;
            }
            let from = match self.node_of_mi.get(&mi) {
                Some(&n) => n,
                None => continue, // dummy phi
            };
            self.add_edge(
                from,
                first_br,
                DepKind::Control,
                DEP_NON_DATA,
                Some(0),
                EdgePayload::None,
            );

            let d = mir.op(mi).desc().delay_slots as usize;
            debug_assert!(i + d < code.len(), "insufficient delay slots in block");
            for j in 1..=d {
                if let Some(&to) = self.node_of_mi.get(&code[i + j]) {
                    self.add_edge(
                        from,
                        to,
                        DepKind::Control,
                        DEP_NON_DATA,
                        Some(0),
                        EdgePayload::None,
                    );
                }
            }
        }
    }

    fn add_mem_edges(&mut self, mir: &MirFunction, mem_nodes: &[SgNode]) {
        // Dependence order flags for each ordered {load,store,call} pair.
        // Calls count as both a load and a store. No load-to-load edge.
        const LOAD: usize = 0;
        const STORE: usize = 1;
        const CALL: usize = 2;
        const ORDER: [[u8; 3]; 3] = [
            [DEP_NON_DATA, DEP_ANTI, DEP_ANTI],
            [DEP_TRUE, DEP_OUTPUT, DEP_TRUE | DEP_OUTPUT],
            [DEP_TRUE, DEP_ANTI | DEP_OUTPUT, DEP_TRUE | DEP_ANTI | DEP_OUTPUT],
        ];

        let class = |desc: &crate::isa::InstrDesc| {
            if desc.is_call() {
                CALL
            } else if desc.is_load() {
                LOAD
            } else {
                STORE
            }
        };

        for (i, &from) in mem_nodes.iter().enumerate() {
            let fc = class(self.op(mir, from).desc());
            for &to in &mem_nodes[i + 1..] {
                let tc = class(self.op(mir, to).desc());
                if fc == LOAD && tc == LOAD {
                    continue;
                }
                // Latency 1 only orders the operations; true dependences
                // carry the real latencies.
                self.add_edge(
                    from,
                    to,
                    DepKind::Memory,
                    ORDER[fc][tc],
                    Some(1),
                    EdgePayload::None,
                );
            }
        }
    }

    fn add_call_cc_edges(&mut self, mir: &MirFunction, mem_nodes: &[SgNode], block: Block) {
        let call_nodes: Vec<SgNode> = mem_nodes
            .iter()
            .copied()
            .filter(|&n| self.op(mir, n).desc().is_call())
            .collect();
        if call_nodes.is_empty() {
            return;
        }

        // Walk the block in order; each CC instruction gets an edge from
        // every earlier call and to every later call. Latency 0: this only
        // prevents reordering across the call.
        let mut last_call = 0usize;
        for &mi in mir.block_code[block].iter() {
            let Some(&node) = self.node_of_mi.get(&mi) else {
                continue;
            };
            let desc = mir.op(mi).desc();
            if desc.is_call() {
                while last_call < call_nodes.len() && call_nodes[last_call] != node {
                    last_call += 1;
                }
                last_call += 1;
            } else if desc.is_cc_instr() {
                for &call in &call_nodes[..last_call.min(call_nodes.len())] {
                    self.add_edge(
                        call,
                        node,
                        DepKind::MachineResource,
                        DEP_NON_DATA,
                        Some(0),
                        EdgePayload::Resource(CC_RESOURCE),
                    );
                }
                for &call in &call_nodes[last_call.min(call_nodes.len())..] {
                    self.add_edge(
                        node,
                        call,
                        DepKind::MachineResource,
                        DEP_NON_DATA,
                        Some(0),
                        EdgePayload::Resource(CC_RESOURCE),
                    );
                }
            }
        }
    }

    fn add_edges_for_instruction(
        &mut self,
        mir: &MirFunction,
        node: SgNode,
        value_defs: &FxHashMap<Value, Vec<(SgNode, usize)>>,
    ) {
        let mi = self.nodes[node].mi.unwrap();
        let data = mir.mi(mi);
        let mut used: Vec<Value> = Vec::new();
        for operand in &data.operands {
            if let Some(v) = operand.value() {
                if !operand.is_def || operand.is_def_and_use {
                    used.push(v);
                }
            }
        }
        for r in &data.implicit {
            if !r.is_def {
                used.push(r.value);
            }
        }
        for v in used {
            if let Some(defs) = value_defs.get(&v) {
                for &(def_node, _) in defs {
                    if self.nodes[def_node].orig_index < self.nodes[node].orig_index {
                        self.add_edge(
                            def_node,
                            node,
                            DepKind::DefUse,
                            DEP_TRUE,
                            None,
                            EdgePayload::Value(v),
                        );
                    }
                }
            }
        }
    }

    /// When several machine instructions generated for one IR instruction
    /// define or use one of its values (the result or a back-end
    /// temporary), order them with anti- and output-dependence edges.
    fn add_non_ssa_edges_for_inst(&mut self, mir: &MirFunction, inst: crate::ir::Inst) {
        let code = &mir.inst_code[inst];
        let mut values: Vec<Value> = code.temps.clone();
        for &mi in &code.mis {
            if let Some(&node) = self.node_of_mi.get(&mi) {
                let _ = node;
                mir.mi(mi).for_each_value_operand(|_, v, is_def| {
                    if is_def && !values.contains(&v) {
                        values.push(v);
                    }
                });
            }
        }

        for v in values {
            // References to v among this instruction's MIs, in program
            // order.
            let mut refs: Vec<(SgNode, bool)> = Vec::new();
            for &mi in &code.mis {
                let Some(&node) = self.node_of_mi.get(&mi) else {
                    continue;
                };
                mir.mi(mi).for_each_value_operand(|_, ov, is_def| {
                    if ov == v {
                        refs.push((node, is_def));
                    }
                });
            }
            // A def gets output edges from earlier defs and anti edges from
            // earlier uses.
            for i in 0..refs.len() {
                let (node, is_def) = refs[i];
                if !is_def {
                    continue;
                }
                for &(prev, prev_is_def) in &refs[..i] {
                    if prev == node {
                        continue;
                    }
                    let order = if prev_is_def { DEP_OUTPUT } else { DEP_ANTI };
                    self.add_edge(prev, node, DepKind::DefUse, order, None, EdgePayload::None);
                }
            }
        }
    }

    fn add_machine_reg_edges(
        &mut self,
        reg_refs: &FxHashMap<RegNum, Vec<(SgNode, usize)>>,
        mir: &MirFunction,
    ) {
        for (&reg, refs) in reg_refs {
            // refs is in control-flow order within the block.
            for i in 0..refs.len() {
                let (node, opnum) = refs[i];
                let mi = self.nodes[node].mi.unwrap();
                let is_def = mir.mi(mi).operands[opnum].is_def;
                for &(prev, prev_opnum) in &refs[..i] {
                    if prev == node {
                        continue;
                    }
                    let prev_mi = self.nodes[prev].mi.unwrap();
                    let prev_is_def = mir.mi(prev_mi).operands[prev_opnum].is_def;
                    if is_def {
                        self.add_edge(
                            prev,
                            node,
                            DepKind::MachineReg,
                            if prev_is_def { DEP_OUTPUT } else { DEP_ANTI },
                            None,
                            EdgePayload::Reg(reg),
                        );
                    } else if prev_is_def {
                        self.add_edge(
                            prev,
                            node,
                            DepKind::MachineReg,
                            DEP_TRUE,
                            None,
                            EdgePayload::Reg(reg),
                        );
                    }
                }
            }
        }
    }

    /// Display the graph's nodes and edges for debugging.
    pub fn display<'a>(&'a self, mir: &'a MirFunction) -> DisplaySchedGraph<'a> {
        DisplaySchedGraph { graph: self, mir }
    }

    fn add_dummy_edges(&mut self) {
        let ids: Vec<SgNode> = self.nodes.keys().collect();
        for node in ids {
            if node == self.root || node == self.leaf {
                continue;
            }
            if self.in_edges(node).next().is_none() {
                self.add_edge(
                    self.root,
                    node,
                    DepKind::Control,
                    DEP_NON_DATA,
                    Some(0),
                    EdgePayload::None,
                );
            }
            if self.out_edges(node).next().is_none() {
                self.add_edge(
                    node,
                    self.leaf,
                    DepKind::Control,
                    DEP_NON_DATA,
                    Some(0),
                    EdgePayload::None,
                );
            }
        }
    }
}

/// Displays a scheduling graph: one line per node with its edges.
pub struct DisplaySchedGraph<'a> {
    graph: &'a SchedGraph,
    mir: &'a MirFunction,
}

impl fmt::Display for DisplaySchedGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "sched graph for {}:", self.graph.block)?;
        for n in self.graph.node_ids() {
            let node = self.graph.node(n);
            match node.mi.expand() {
                Some(mi) => writeln!(f, "  {} [{}]: {}", n, node.latency, self.mir.display(mi))?,
                None => writeln!(
                    f,
                    "  {} ({})",
                    n,
                    if n == self.graph.root { "root" } else { "leaf" }
                )?,
            }
            for e in self.graph.out_edges(n) {
                let edge = self.graph.edge(e);
                writeln!(
                    f,
                    "    -> {} {:?} delay {}",
                    edge.sink, edge.kind, edge.min_delay
                )?;
            }
        }
        Ok(())
    }
}
