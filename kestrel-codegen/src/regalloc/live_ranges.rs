//! Live ranges: the unit of register allocation.
//!
//! A live range is a set of SSA values that must share a register. One range
//! is created per defining machine instruction or function argument; the
//! multiple machine-level definitions an instruction selection can produce
//! for a single IR value are unioned into one range, and coalescing merges
//! copy-related ranges later.

use crate::flowgraph::ControlFlowGraph;
use crate::fx::FxHashMap;
use crate::ir::{Function, TypePool, Value};
use crate::isa::{RegClassId, RegType, TargetIsa};
use crate::mir::{ArgPlace, MachInst, MirFunction, OperandKind};
use kestrel_entity::{entity_impl, PrimaryMap};
use log::{debug, trace};

/// An opaque reference to a live range.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LrId(u32);
entity_impl!(LrId, "lr");

/// One live range.
#[derive(Clone, Debug)]
pub struct LiveRange {
    /// The values sharing this range.
    pub values: Vec<Value>,
    /// The register class the range allocates from.
    pub class: RegClassId,
    /// The register type, refining the class for doubles and CCs.
    pub reg_type: RegType,
    /// The chosen colour, once colouring has run.
    pub color: Option<usize>,
    /// The colour the calling convention would like.
    pub suggested: Option<usize>,
    /// Whether the suggested colour may actually be taken.
    pub suggested_usable: bool,
    /// Offset from the frame pointer of the spill slot, when spilled.
    pub spill_offset: Option<i32>,
    /// Accumulated spill cost, weighted by loop depth.
    pub spill_cost: u64,
    /// The range is live across at least one call.
    pub call_interference: bool,
    /// Got a volatile colour despite spanning calls; needs save/restore.
    pub must_save_across_calls: bool,
    /// Marked for spilling by the colouring loop.
    pub spilled: bool,
    /// Merged into another range; kept for index stability.
    pub dead: bool,
}

impl LiveRange {
    fn new(class: RegClassId, reg_type: RegType) -> Self {
        Self {
            values: Vec::new(),
            class,
            reg_type,
            color: None,
            suggested: None,
            suggested_usable: true,
            spill_offset: None,
            spill_cost: 0,
            call_interference: false,
            must_save_across_calls: false,
            spilled: false,
            dead: false,
        }
    }

    /// Does the range have a colour?
    pub fn has_color(&self) -> bool {
        self.color.is_some()
    }
}

/// All live ranges of one function.
pub struct LiveRangeInfo {
    /// The ranges; merged-away entries stay in place, marked dead.
    pub ranges: PrimaryMap<LrId, LiveRange>,
    lr_of_value: FxHashMap<Value, LrId>,
    /// Call and return machine instructions, for the suggestion and copy
    /// passes.
    pub call_ret_mis: Vec<MachInst>,
}

impl LiveRangeInfo {
    /// The range a value belongs to, if it has one. Pinned temporaries and
    /// constants have none.
    pub fn lr_of(&self, v: Value) -> Option<LrId> {
        self.lr_of_value.get(&v).copied()
    }

    /// Construct the live ranges of `func`.
    pub fn construct(
        isa: &TargetIsa,
        pool: &TypePool,
        func: &Function,
        mir: &MirFunction,
        cfg: &ControlFlowGraph,
    ) -> Self {
        let mut lri = LiveRangeInfo {
            ranges: PrimaryMap::new(),
            lr_of_value: FxHashMap::default(),
            call_ret_mis: Vec::new(),
        };

        // Ranges for the incoming arguments: they start at function entry
        // and carry the argument-register suggestions.
        for (i, &arg) in func.args.iter().enumerate() {
            let ty = func.dfg.value_type(arg);
            let reg_type = isa.regs.reg_type_of(pool, ty, false);
            let lr = lri.make_lr(arg, reg_type);
            let suggestion = match reg_type {
                RegType::Int => isa.regs.int_arg_color(i),
                RegType::FloatSingle | RegType::FloatDouble => isa.regs.float_arg_color(i),
                _ => None,
            };
            lri.ranges[lr].suggested = suggestion;
        }

        // Ranges for every definition in the machine code. A second def of
        // the same value joins the existing range.
        for &block in func.layout.blocks() {
            let weight = 8u64.saturating_pow(cfg.loop_depth[block].min(8));
            for &mi in &mir.block_code[block] {
                let desc = mir.op(mi).desc();
                if desc.is_call() || mir.op(mi) == crate::isa::MOp::RetJ {
                    lri.call_ret_mis.push(mi);
                }

                let data = mir.mi(mi);
                for operand in &data.operands {
                    let Some(v) = operand.value() else { continue };
                    if mir.pinned_regs.contains_key(&v) {
                        continue;
                    }
                    let is_cc = matches!(operand.kind, OperandKind::CcReg(_));
                    if operand.is_def {
                        let reg_type =
                            isa.regs.reg_type_of(pool, func.dfg.value_type(v), is_cc);
                        lri.note_def(v, reg_type);
                    }
                    if let Some(lr) = lri.lr_of(v) {
                        lri.ranges[lr].spill_cost =
                            lri.ranges[lr].spill_cost.saturating_add(weight);
                    }
                }
                for r in &data.implicit {
                    if mir.pinned_regs.contains_key(&r.value) {
                        continue;
                    }
                    if r.is_def {
                        let reg_type =
                            isa.regs
                                .reg_type_of(pool, func.dfg.value_type(r.value), false);
                        lri.note_def(r.value, reg_type);
                    }
                    if let Some(lr) = lri.lr_of(r.value) {
                        lri.ranges[lr].spill_cost =
                            lri.ranges[lr].spill_cost.saturating_add(weight);
                    }
                }
            }
        }

        // Calling-convention suggestions for call arguments, call return
        // values, and returned values.
        lri.suggest_colors_for_call_rets(isa, pool, func, mir);

        debug!("constructed {} live ranges", lri.ranges.len());
        lri
    }

    fn make_lr(&mut self, v: Value, reg_type: RegType) -> LrId {
        let mut lr = LiveRange::new(reg_type.class(), reg_type);
        lr.values.push(v);
        let id = self.ranges.push(lr);
        self.lr_of_value.insert(v, id);
        id
    }

    fn note_def(&mut self, v: Value, reg_type: RegType) {
        if self.lr_of_value.contains_key(&v) {
            return; // multiple defs of one value share the range
        }
        self.make_lr(v, reg_type);
    }

    fn suggest_colors_for_call_rets(
        &mut self,
        isa: &TargetIsa,
        pool: &TypePool,
        func: &Function,
        mir: &MirFunction,
    ) {
        let _ = pool;
        for &mi in &self.call_ret_mis.clone() {
            let data = mir.mi(mi);
            if let Some(desc) = &data.call_desc {
                // Outgoing arguments take the registers their places name.
                let infos: Vec<(Value, Option<usize>)> = data
                    .implicit
                    .iter()
                    .filter(|r| !r.is_def)
                    .zip_longest_places(&desc.args);
                for (v, place) in infos {
                    if let (Some(c), Some(lr)) = (place, self.lr_of(v)) {
                        if self.ranges[lr].suggested.is_none() {
                            self.ranges[lr].suggested = Some(c);
                            trace!("suggest colour {} for {} (call arg)", c, v);
                        }
                    }
                }
                // The return value gets the return register of its class.
                if let Some(rv) = desc.ret_val {
                    if let Some(lr) = self.lr_of(rv) {
                        let c = match self.ranges[lr].reg_type {
                            RegType::Int => isa.regs.int_ret_color(),
                            _ => isa.regs.float_ret_color(),
                        };
                        self.ranges[lr].suggested = Some(c);
                    }
                }
            } else {
                // A return: its value goes in the result register.
                for r in &data.implicit {
                    if let Some(lr) = self.lr_of(r.value) {
                        let c = match self.ranges[lr].reg_type {
                            RegType::Int => isa.regs.int_ret_color(),
                            _ => isa.regs.float_ret_color(),
                        };
                        if self.ranges[lr].suggested.is_none() {
                            self.ranges[lr].suggested = Some(c);
                        }
                    }
                }
            }
        }
        let _ = func;
    }

    /// Union two live ranges; `l2` is absorbed into `l1` and tombstoned.
    /// The caller guarantees the merge conditions (no interference, same
    /// register type, not both suggested).
    pub fn union_and_update(&mut self, l1: LrId, l2: LrId) {
        debug_assert_ne!(l1, l2);
        let (class, reg_type) = (self.ranges[l2].class, self.ranges[l2].reg_type);
        let mut tombstone = LiveRange::new(class, reg_type);
        tombstone.dead = true;
        let absorbed = std::mem::replace(&mut self.ranges[l2], tombstone);
        for &v in &absorbed.values {
            self.lr_of_value.insert(v, l1);
        }
        let dst = &mut self.ranges[l1];
        dst.values.extend(absorbed.values);
        if absorbed.suggested.is_some() && dst.suggested.is_none() {
            dst.suggested = absorbed.suggested;
        }
        if absorbed.call_interference {
            dst.call_interference = true;
        }
        dst.spill_cost = dst.spill_cost.saturating_add(absorbed.spill_cost);
        self.ranges[l2].dead = true;
    }

    /// Mark suggested colours unusable when they name a volatile register
    /// and the range spans a call.
    pub fn mark_unusable_suggested_colors(&mut self, isa: &TargetIsa) {
        for lr in self.ranges.values_mut() {
            if lr.dead {
                continue;
            }
            if let Some(sug) = lr.suggested {
                let rc = isa.regs.class(lr.class);
                lr.suggested_usable = !(rc.is_volatile(sug) && lr.call_interference);
            }
        }
    }
}

// Pair each non-def implicit ref of a call with its argument-place record.
// The implicit refs of a call are [arg copies and args in order]; the
// descriptor's records align with the *argument* refs, so walk both lists
// keeping copies attached to their argument's place.
trait ZipPlaces<'a> {
    fn zip_longest_places(
        self,
        args: &'a [crate::mir::ArgInfo],
    ) -> Vec<(Value, Option<usize>)>;
}

impl<'a, I> ZipPlaces<'a> for I
where
    I: Iterator<Item = &'a crate::mir::ImplicitRef>,
{
    fn zip_longest_places(
        self,
        args: &'a [crate::mir::ArgInfo],
    ) -> Vec<(Value, Option<usize>)> {
        let refs: Vec<Value> = self.map(|r| r.value).collect();
        let mut out = Vec::new();
        let mut arg_idx = 0usize;
        let mut i = 0usize;
        while i < refs.len() && arg_idx < args.len() {
            let info = &args[arg_idx];
            if let Some(copy) = info.arg_copy {
                if refs[i] == copy {
                    // The integer-side copy of a float argument takes the
                    // integer register of the pair.
                    let int_place = match info.place {
                        ArgPlace::FloatAndIntReg { int, .. } => Some(int),
                        ArgPlace::IntReg(c) => Some(c),
                        _ => None,
                    };
                    out.push((refs[i], int_place));
                    i += 1;
                    continue;
                }
            }
            let place = match info.place {
                ArgPlace::IntReg(c) => {
                    // A float argument passed through the integer side has
                    // its place carried by the copy, not the original.
                    if info.arg_copy.is_some() {
                        None
                    } else {
                        Some(c)
                    }
                }
                ArgPlace::FloatReg(c) => Some(c),
                ArgPlace::FloatAndIntReg { fp, .. } => Some(fp),
                ArgPlace::Stack => None,
            };
            out.push((refs[i], place));
            arg_idx += 1;
            i += 1;
        }
        out
    }
}
