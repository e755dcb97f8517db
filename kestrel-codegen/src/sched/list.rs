//! The forward list scheduler.
//!
//! Cycle-accurate and cooperative: each cycle the scheduler picks at most
//! `num_slots` ready instructions that respect per-opcode minimum issue
//! gaps, per-class issue limits, and single-issue opcodes, then issues them
//! and marks newly ready successors. Delayed branches reserve the
//! highest-numbered usable slot so their delay slots follow immediately.

use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{Block, Function};
use crate::isa::{IssueClass, MOp, TargetIsa, NUM_ISSUE_CLASSES};
use crate::liveness::LiveVarInfo;
use crate::mir::{MachInst, MirFunction};
use crate::sched::graph::{DepKind, SchedGraph, SgNode};
use crate::sched::priorities::SchedPriorities;
use kestrel_entity::EntityRef;
use log::{debug, trace};

/// The chosen schedule of one basic block: instruction groups per cycle.
pub struct InstrSchedule {
    nslots: usize,
    groups: Vec<Vec<Option<SgNode>>>,
    start_time: Vec<i64>,
    num_scheduled: usize,
}

impl InstrSchedule {
    fn new(nslots: usize, num_nodes: usize) -> Self {
        Self {
            nslots,
            groups: Vec::new(),
            start_time: vec![-1; num_nodes],
            num_scheduled: 0,
        }
    }

    fn group_mut(&mut self, cycle: i64) -> &mut Vec<Option<SgNode>> {
        let c = cycle as usize;
        while self.groups.len() <= c {
            self.groups.push(vec![None; self.nslots]);
        }
        &mut self.groups[c]
    }

    /// The node at `(slot, cycle)`, if one was placed there.
    pub fn instr_at(&self, slot: usize, cycle: i64) -> Option<SgNode> {
        self.groups
            .get(cycle as usize)
            .and_then(|g| g[slot])
    }

    /// The cycle `node` was issued in, or -1.
    pub fn start_time(&self, node: SgNode) -> i64 {
        self.start_time[node.index()]
    }

    /// Number of instructions scheduled so far.
    pub fn num_instructions(&self) -> usize {
        self.num_scheduled
    }

    fn place(&mut self, node: SgNode, slot: usize, cycle: i64) {
        let nslots = self.nslots;
        let group = self.group_mut(cycle);
        debug_assert!(slot < nslots);
        debug_assert!(group[slot].is_none(), "slot already filled");
        group[slot] = Some(node);
        self.start_time[node.index()] = cycle;
        self.num_scheduled += 1;
    }

    /// All scheduled nodes in (cycle, slot) order.
    pub fn in_order(&self) -> Vec<SgNode> {
        let mut out = Vec::with_capacity(self.num_scheduled);
        for group in &self.groups {
            for &slot in group {
                if let Some(n) = slot {
                    out.push(n);
                }
            }
        }
        out
    }

    /// Number of instructions issued in `cycle`.
    pub fn issued_in_cycle(&self, cycle: i64) -> usize {
        self.groups
            .get(cycle as usize)
            .map(|g| g.iter().filter(|s| s.is_some()).count())
            .unwrap_or(0)
    }
}

/// Delay-slot bookkeeping for one delayed branch.
struct DelaySlotInfo {
    ndelays: usize,
    delay_nodes: Vec<SgNode>,
    chosen_cycle: i64,
    chosen_slot: usize,
}

/// The per-block scheduling state.
pub struct SchedulingManager<'a> {
    isa: &'a TargetIsa,
    mir: &'a MirFunction,
    graph: &'a SchedGraph,
    prio: SchedPriorities,
    /// The schedule under construction.
    pub isched: InstrSchedule,
    cur_time: i64,
    next_earliest_issue_time: i64,
    choices: Vec<SgNode>,
    choices_for_slot: Vec<FxHashSet<SgNode>>,
    num_in_class: [usize; NUM_ISSUE_CLASSES],
    next_earliest_start: Vec<i64>,
    delay_infos: FxHashMap<SgNode, DelaySlotInfo>,
    /// Issued since successors were last marked ready.
    newly_issued: Vec<SgNode>,
}

impl<'a> SchedulingManager<'a> {
    fn new(
        isa: &'a TargetIsa,
        mir: &'a MirFunction,
        graph: &'a SchedGraph,
        prio: SchedPriorities,
    ) -> Self {
        let nslots = isa.sched.num_slots;
        Self {
            isa,
            mir,
            graph,
            prio,
            isched: InstrSchedule::new(nslots, graph.num_nodes()),
            cur_time: 0,
            next_earliest_issue_time: 0,
            choices: Vec::new(),
            choices_for_slot: vec![FxHashSet::default(); nslots],
            num_in_class: [0; NUM_ISSUE_CLASSES],
            next_earliest_start: vec![0; MOp::COUNT],
            delay_infos: FxHashMap::default(),
            newly_issued: Vec::new(),
        }
    }

    fn nslots(&self) -> usize {
        self.isa.sched.num_slots
    }

    fn time(&self) -> i64 {
        self.cur_time
    }

    fn update_time(&mut self, c: i64) {
        self.cur_time = c;
        self.prio.update_time(c);
    }

    fn is_scheduled(&self, node: SgNode) -> bool {
        self.isched.start_time(node) >= 0
    }

    fn op_of(&self, node: SgNode) -> MOp {
        self.graph.op(self.mir, node)
    }

    fn class_index(class: IssueClass) -> usize {
        match class {
            IssueClass::Int => 0,
            IssueClass::Mem => 1,
            IssueClass::Branch => 2,
            IssueClass::Fp => 3,
            IssueClass::Pseudo => 4,
        }
    }

    /// Minimum-gap check against instructions issued in earlier cycles.
    fn violates_minimum_gap(&self, op: MOp, in_cycle: i64) -> bool {
        in_cycle < self.next_earliest_start[op.index()]
    }

    fn add_choice(&mut self, node: SgNode) {
        self.choices.push(node);
        let sc = self.op_of(node).desc().iclass;
        self.num_in_class[Self::class_index(sc)] += 1;
    }

    fn add_choice_to_slot(&mut self, slot: usize, node: SgNode) {
        self.choices_for_slot[slot].insert(node);
    }

    fn reset_choices(&mut self) {
        self.choices.clear();
        for s in &mut self.choices_for_slot {
            s.clear();
        }
        self.num_in_class = [0; NUM_ISSUE_CLASSES];
    }

    fn schedule_instr(&mut self, node: SgNode, slot: usize, cycle: i64) {
        debug_assert!(!self.is_scheduled(node));
        trace!(
            "cycle {} slot {}: issue {} ({})",
            cycle,
            slot,
            node,
            self.op_of(node)
        );
        self.isched.place(node, slot, cycle);
        self.newly_issued.push(node);
        self.update_earliest_start_times(node, cycle);
        for s in &mut self.choices_for_slot {
            s.remove(&node);
        }
        let sc = self.op_of(node).desc().iclass;
        let idx = Self::class_index(sc);
        self.num_in_class[idx] = self.num_in_class[idx].saturating_sub(1);
        self.prio.issued_ready_node_at(self.graph, cycle, node);
    }

    fn update_earliest_start_times(&mut self, node: SgNode, sched_time: i64) {
        let op = self.op_of(node);
        let bubbles = self.isa.sched.num_bubbles_after(op) as i64;
        if bubbles > 0 {
            // Nothing at all can issue until the bubbles drain.
            self.next_earliest_issue_time = self
                .next_earliest_issue_time
                .max(self.cur_time + 1 + bubbles);
        }
        for &to in self.isa.sched.conflict_list(op) {
            let est = sched_time + self.isa.sched.min_issue_gap(op, to) as i64;
            let slot = &mut self.next_earliest_start[to.index()];
            *slot = (*slot).max(est);
        }
    }

    fn mark_successors_ready(&mut self, node: SgNode) {
        let succs: Vec<SgNode> = self
            .graph
            .out_edges(node)
            .map(|e| self.graph.edge(e).sink)
            .collect();
        for succ in succs {
            if self.graph.node(succ).is_dummy()
                || self.is_scheduled(succ)
                || self.prio.node_is_ready(succ)
            {
                continue;
            }
            let all_preds_done = self
                .graph
                .in_edges(succ)
                .map(|e| self.graph.edge(e).src)
                .all(|p| self.graph.node(p).is_dummy() || self.is_scheduled(p));
            if all_preds_done {
                self.prio.insert_ready(self.graph, succ);
            }
        }
    }

    // ---------------- slot choosing -------------------------------------

    /// Choose up to `nslots` feasible instructions for the current cycle
    /// and record their possible slots. Returns the number chosen and the
    /// branch whose delay slots must be scheduled along with it, if any.
    fn find_slot_choices(&mut self) -> (usize, Option<SgNode>) {
        self.reset_choices();

        // Slots already filled this cycle (by delay slots spilling over).
        let mut start_slot = 0;
        for s in (0..self.nslots()).rev() {
            if self.isched.instr_at(s, self.cur_time).is_some() {
                start_slot = s + 1;
                break;
            }
        }
        if start_slot >= self.nslots() {
            return (0, None);
        }

        let mut index_for_breaking: Option<usize> = None;
        let mut delayed: Option<SgNode> = None;

        // Choose in priority order; each accepted choice participates in
        // the feasibility tests of later ones.
        while self.choices.len() < self.nslots() - start_slot {
            let next = {
                let graph = self.graph;
                let mir = self.mir;
                let gaps = &self.next_earliest_start;
                let num_in_class = self.num_in_class;
                let nchoices = self.choices.len();
                let isa = self.isa;
                let time = self.cur_time;
                self.prio.next_highest(graph, mir, time, |op| {
                    if time < gaps[op.index()] {
                        return false;
                    }
                    if nchoices > 0 && op.desc().is_single_issue() {
                        return false;
                    }
                    let sc = op.desc().iclass;
                    num_in_class[Self::class_index(sc)] < isa.sched.max_issue_for_class(sc)
                })
            };
            let Some(node) = next else { break };

            let op = self.op_of(node);
            let mut accepted = true;
            if op.desc().delay_slots > 0 && self.delay_infos.contains_key(&node) {
                if index_for_breaking.is_some() || delayed.is_some() {
                    // A delayed instruction cannot share a cycle with a
                    // group breaker or another delayed instruction.
                    accepted = false;
                } else {
                    delayed = Some(node);
                }
            } else if op.desc().breaks_group() {
                if index_for_breaking.is_some() || delayed.is_some() {
                    accepted = false;
                } else {
                    index_for_breaking = Some(self.choices.len());
                }
            }

            if !accepted {
                // The candidate stays unscheduled this cycle.
                continue;
            }
            self.add_choice(node);
            if self.op_of(node).desc().is_single_issue() {
                debug_assert_eq!(self.choices.len(), 1);
                break;
            }
            if delayed.is_some() {
                // Leave the remaining slots for the delay slots.
                break;
            }
        }

        let num_choices = self.choices.len();
        if num_choices == 0 {
            return (0, None);
        }

        if let Some(dnode) = delayed {
            // Put every other choice in the earliest slots it can use, then
            // reserve the highest-numbered usable slot for the delayed
            // instruction so its delay slots follow immediately after.
            let mut highest_used: i64 = -1;
            let others: Vec<SgNode> = self
                .choices
                .iter()
                .copied()
                .filter(|&n| n != dnode)
                .collect();
            for node in others {
                let op = self.op_of(node);
                let mut placed = false;
                for s in start_slot..self.nslots() {
                    if self.isa.sched.instr_can_use_slot(op, s) {
                        self.add_choice_to_slot(s, node);
                        highest_used = highest_used.max(s as i64);
                        placed = true;
                        break;
                    }
                }
                debug_assert!(placed, "no feasible slot for {}", op);
            }

            let dop = self.op_of(dnode);
            let mut dslot = None;
            for s in (start_slot..self.nslots()).rev() {
                if self.isa.sched.instr_can_use_slot(dop, s) && s as i64 > highest_used {
                    dslot = Some(s);
                    break;
                }
            }
            let (dcycle, dslot) = match dslot {
                Some(s) => (self.cur_time, s),
                None => {
                    // No room left this cycle: the delayed instruction opens
                    // the next one in its first usable slot.
                    let s = (0..self.nslots())
                        .find(|&s| self.isa.sched.instr_can_use_slot(dop, s))
                        .unwrap_or(0);
                    (self.cur_time + 1, s)
                }
            };
            if let Some(info) = self.delay_infos.get_mut(&dnode) {
                info.chosen_cycle = dcycle;
                info.chosen_slot = dslot;
            }
            return (num_choices, Some(dnode));
        }

        if let Some(break_idx) = index_for_breaking {
            // The group breaker takes the last usable slot; everything of
            // lower priority only goes below it.
            let breaking = self.choices[break_idx];
            let bop = self.op_of(breaking);
            let mut breaking_slot = None;
            for s in (start_slot..self.nslots()).rev() {
                if self.isa.sched.instr_can_use_slot(bop, s) {
                    breaking_slot = Some(s);
                    break;
                }
            }
            let limit = breaking_slot.unwrap_or(self.nslots());
            let choices = self.choices.clone();
            for (i, node) in choices.iter().enumerate() {
                if i == break_idx {
                    continue;
                }
                let op = self.op_of(*node);
                let upper = if i > break_idx { limit } else { self.nslots() };
                for s in start_slot..upper {
                    if self.isa.sched.instr_can_use_slot(op, s) {
                        self.add_choice_to_slot(s, *node);
                    }
                }
            }
            if let Some(bs) = breaking_slot {
                self.add_choice_to_slot(bs, breaking);
            }
            return (num_choices, None);
        }

        // Common case: no delayed or breaking instruction. Offer every
        // choice to every slot it can occupy.
        let choices = self.choices.clone();
        for node in choices {
            let op = self.op_of(node);
            for s in start_slot..self.nslots() {
                if self.isa.sched.instr_can_use_slot(op, s) {
                    self.add_choice_to_slot(s, node);
                }
            }
        }
        (num_choices, None)
    }

    /// Commit the chosen instructions to concrete slots.
    fn assign_instructions_to_slots(&mut self, max_issue: usize) {
        let cur_time = self.cur_time;
        let nslots = self.nslots();

        for _ in 0..max_issue {
            // Prefer a slot with exactly one choice; otherwise take the
            // first slot that has any.
            let mut chosen_slot = None;
            for s in 0..nslots {
                if self.isched.instr_at(s, cur_time).is_none()
                    && self.choices_for_slot[s].len() == 1
                {
                    chosen_slot = Some(s);
                    break;
                }
            }
            if chosen_slot.is_none() {
                for s in 0..nslots {
                    if self.isched.instr_at(s, cur_time).is_none()
                        && !self.choices_for_slot[s].is_empty()
                    {
                        chosen_slot = Some(s);
                        break;
                    }
                }
            }
            let Some(slot) = chosen_slot else { break };
            let node = *self.choices_for_slot[slot].iter().next().unwrap();
            self.schedule_instr(node, slot, cur_time);
        }
    }

    /// Schedule the delayed branch at its recorded position, then its delay
    /// slots in the positions immediately following.
    fn schedule_delayed_node(&mut self, brnode: SgNode) {
        let info = self.delay_infos.get(&brnode).unwrap();
        let (mut cycle, mut slot) = (info.chosen_cycle, info.chosen_slot);
        let ndelays = info.ndelays;
        let delay_nodes = info.delay_nodes.clone();

        debug_assert!(self.isched.instr_at(slot, cycle).is_none());
        self.schedule_instr(brnode, slot, cycle);

        let mut scheduled_count = 0usize;
        for _ in 0..ndelays {
            slot += 1;
            if slot == self.nslots() {
                slot = 0;
                cycle += 1;
            }
            // Take the first unscheduled delay candidate that can use the
            // slot; pipeline interlocks resolve flow dependences.
            for &dnode in &delay_nodes {
                if !self.is_scheduled(dnode)
                    && self.isa.sched.instr_can_use_slot(self.op_of(dnode), slot)
                    && !self.violates_minimum_gap(self.op_of(dnode), cycle)
                {
                    self.schedule_instr(dnode, slot, cycle);
                    scheduled_count += 1;
                    break;
                }
            }
        }
        if cycle > self.time() {
            self.update_time(cycle);
        }

        // Any remaining candidates go into the next empty slots; needed for
        // correctness even if suboptimal.
        for &dnode in &delay_nodes {
            if self.is_scheduled(dnode) {
                continue;
            }
            let (mut c, mut s) = (self.delay_infos[&brnode].chosen_cycle, self.delay_infos[&brnode].chosen_slot);
            loop {
                s += 1;
                if s == self.nslots() {
                    s = 0;
                    c += 1;
                }
                if self.isched.instr_at(s, c).is_none() {
                    break;
                }
            }
            self.schedule_instr(dnode, s, c);
            scheduled_count += 1;
        }
        let _ = scheduled_count;
    }

    fn choose_one_group(&mut self) -> usize {
        debug_assert!(self.prio.num_ready() > 0);
        let (mut num_issued, mut delayed) = self.find_slot_choices();
        while num_issued == 0 {
            let t = self.time() + 1;
            self.update_time(t);
            let r = self.find_slot_choices();
            num_issued = r.0;
            delayed = r.1;
        }
        self.assign_instructions_to_slots(num_issued);
        if let Some(d) = delayed {
            self.schedule_delayed_node(d);
        }
        num_issued
    }

    fn forward_list_schedule(&mut self) {
        self.prio.initialize(self.graph);
        while self.prio.num_ready() > 0 {
            let num_issued = self.choose_one_group();
            debug_assert!(num_issued > 0, "deadlock in list scheduling");

            // Mark successors of everything issued by this group, including
            // delay-slot instructions placed in later cycles.
            let issued = std::mem::take(&mut self.newly_issued);
            for node in issued {
                self.mark_successors_ready(node);
            }

            let t = (self.time() + 1)
                .max(self.next_earliest_issue_time)
                .max(self.prio.earliest_ready_time());
            self.update_time(t);
        }
    }
}

// ---------------- delay-slot candidate selection -------------------------

fn node_can_fill_delay_slot(
    mir: &MirFunction,
    graph: &SchedGraph,
    node: SgNode,
    brnode: SgNode,
) -> bool {
    debug_assert!(!graph.node(node).is_dummy());
    let desc = graph.op(mir, node).desc();

    // No branch in the delay slot of another branch, and no single-issue
    // instruction either.
    if desc.is_branch() || desc.is_single_issue() {
        return false;
    }

    // No load-use dependence may reach into the branch's delay slot.
    for e in graph.in_edges(node) {
        let edge = graph.edge(e);
        if !graph.node(edge.src).is_dummy()
            && graph.op(mir, edge.src).desc().is_load()
            && edge.kind == DepKind::DefUse
        {
            return false;
        }
    }

    // The instruction must be reorderable relative to the branch: its only
    // outgoing edge is the control-dependence edge to the branch.
    for e in graph.out_edges(node) {
        let edge = graph.edge(e);
        if !graph.node(edge.sink).is_dummy()
            && (edge.sink != brnode || edge.kind != DepKind::Control)
        {
            return false;
        }
    }
    true
}

/// Pick instructions for the delay slots of the block's delayed branches,
/// removing them (and the NOPs they replace) from the graph.
fn choose_instructions_for_delay_slots(
    mir: &MirFunction,
    graph: &mut SchedGraph,
    func: &Function,
    block: Block,
    delay_infos: &mut FxHashMap<SgNode, DelaySlotInfo>,
) {
    let Some(term) = func.layout.terminator(block) else {
        return;
    };
    let term_mvec = &mir.inst_code[term].mis;
    let Some(first) = term_mvec
        .iter()
        .position(|&mi| mir.op(mi).desc().is_branch())
    else {
        return;
    };
    let brnode = match graph.node_for_mi(term_mvec[first]) {
        Some(n) => n,
        None => return,
    };
    let ndelays = graph.op(mir, brnode).desc().delay_slots as usize;
    if ndelays == 0 {
        return;
    }

    // Prefer single-cycle candidates; remember multi-cycle ones separately
    // and fall back to the cheapest of them.
    let mut sdelay: Vec<SgNode> = Vec::new();
    let mut mdelay: Vec<SgNode> = Vec::new();
    let preds: Vec<SgNode> = graph
        .in_edges(brnode)
        .map(|e| graph.edge(e).src)
        .collect();
    for p in preds {
        if sdelay.len() >= ndelays {
            break;
        }
        if !graph.node(p).is_dummy()
            && !graph.op(mir, p).desc().is_nop()
            && node_can_fill_delay_slot(mir, graph, p, brnode)
        {
            if graph.op(mir, p).desc().max_latency > 1 {
                mdelay.push(p);
            } else {
                sdelay.push(p);
            }
        }
    }
    while sdelay.len() < ndelays && !mdelay.is_empty() {
        let mut min_idx = 0;
        for i in 1..mdelay.len() {
            if graph.op(mir, mdelay[i]).desc().max_latency
                <= graph.op(mir, mdelay[min_idx]).desc().max_latency
            {
                min_idx = i;
            }
        }
        sdelay.push(mdelay.remove(min_idx));
    }

    // The NOPs currently in the delay slots: reuse them for any unfilled
    // slots and erase the rest from the graph.
    let mut unused_nops: Vec<SgNode> = Vec::new();
    let succs: Vec<SgNode> = graph
        .out_edges(brnode)
        .map(|e| graph.edge(e).sink)
        .collect();
    for s in succs {
        if !graph.node(s).is_dummy() && graph.op(mir, s).desc().is_nop() {
            if sdelay.len() < ndelays {
                sdelay.push(s);
            } else {
                unused_nops.push(s);
            }
        }
    }

    for &node in &sdelay {
        graph.erase_incident_edges(node, true);
    }
    for nop in unused_nops {
        graph.erase_incident_edges(nop, true);
    }

    delay_infos.insert(
        brnode,
        DelaySlotInfo {
            ndelays,
            delay_nodes: sdelay,
            chosen_cycle: 0,
            chosen_slot: 0,
        },
    );
}

// ---------------- entry point --------------------------------------------

/// Schedule the machine code of `block` and rewrite its instruction list in
/// issue order. Leading dummy phi instructions stay in place. Returns the
/// chosen schedule together with the scheduled instructions in issue order.
pub fn schedule_block(
    isa: &TargetIsa,
    func: &Function,
    mir: &mut MirFunction,
    lvi: &LiveVarInfo,
    block: Block,
) -> Option<(InstrSchedule, Vec<MachInst>)> {
    if mir.block_code[block].is_empty() {
        return None;
    }
    debug!("scheduling {} ({} MIs)", block, mir.block_code[block].len());

    let mut graph = SchedGraph::build(isa, func, mir, block);

    let mut delay_infos = FxHashMap::default();
    choose_instructions_for_delay_slots(mir, &mut graph, func, block, &mut delay_infos);

    // Last-use information for the priority tie-break, computed on the
    // original instruction order.
    let sets = lvi.block_live_sets(mir, block);
    let mut last_use: FxHashMap<SgNode, bool> = FxHashMap::default();
    for (i, &mi) in mir.block_code[block].iter().enumerate() {
        if let Some(node) = graph.node_for_mi(mi) {
            last_use.insert(node, lvi.mi_has_last_use(mir, block, &sets, i));
        }
    }

    let prio = SchedPriorities::new(&graph, last_use);
    let mut mgr = SchedulingManager::new(isa, mir, &graph, prio);
    mgr.delay_infos = delay_infos;
    mgr.forward_list_schedule();
    let SchedulingManager { isched, .. } = mgr;

    let order = isched.in_order();
    let start_times: Vec<(SgNode, i64)> =
        order.iter().map(|&n| (n, isched.start_time(n))).collect();
    trace!("schedule for {}: {:?}", block, start_times);

    let scheduled: Vec<MachInst> = order.iter().map(|&n| graph.node(n).mi.unwrap()).collect();

    // Rewrite the block: keep the leading dummy phi instructions, then the
    // scheduled order. Unused NOPs are dropped.
    let mut new_code: Vec<MachInst> = Vec::with_capacity(order.len());
    for &mi in mir.block_code[block].iter() {
        if mir.op(mi).desc().is_pseudo() {
            new_code.push(mi);
        } else {
            break;
        }
    }
    new_code.extend(scheduled.iter().copied());
    mir.block_code[block] = new_code;
    Some((isched, scheduled))
}
