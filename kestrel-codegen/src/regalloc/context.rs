//! The register-allocation driver.
//!
//! Builds live ranges and per-class interference graphs from the scheduled
//! machine code, coalesces copy-related ranges, colours each class, and then
//! patches the code: caller-save pairs around calls, copies for
//! mis-assigned argument and return registers, and load/store sequences for
//! spilled operands. Code added after an instruction with delay slots lands
//! after its delay-slot instructions.

use crate::flowgraph::ControlFlowGraph;
use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{Function, TypePool, Value};
use crate::isa::{
    MOp, RegClassId, RegNum, RegType, TargetIsa, FP_REG, INVALID_REG, SP_REG, ZERO_REG,
};
use crate::liveness::LiveVarInfo;
use crate::mir::{ArgPlace, MachInst, MachInstData, MirFunction, OperandKind};
use crate::regalloc::coloring::color_class;
use crate::regalloc::interference::InterferenceGraph;
use crate::regalloc::live_ranges::{LiveRangeInfo, LrId};
use crate::result::CodegenResult;
use log::{debug, trace};

/// Instructions to splice in around an existing MI.
#[derive(Default)]
struct AddedInstrs {
    before: Vec<MachInstData>,
    after: Vec<MachInstData>,
}

/// Allocate registers for `func`'s machine code and patch it in place.
pub fn allocate_registers(
    isa: &TargetIsa,
    pool: &TypePool,
    func: &Function,
    mir: &mut MirFunction,
    cfg: &ControlFlowGraph,
    lvi: &LiveVarInfo,
) -> CodegenResult<()> {
    debug!("allocating registers for {}", func.name);

    let mut lri = LiveRangeInfo::construct(isa, pool, func, mir, cfg);

    // One interference graph per register class.
    let mut igs: Vec<InterferenceGraph> = RegClassId::ALL
        .iter()
        .map(|&c| InterferenceGraph::new(c))
        .collect();
    for (id, lr) in lri.ranges.iter() {
        if !lr.dead {
            igs[lr.class.index()].add_lr(id);
        }
    }
    for ig in &mut igs {
        ig.create_matrix();
    }

    build_interference_graphs(func, mir, lvi, &mut lri, &mut igs);
    coalesce_live_ranges(isa, func, mir, &mut lri, &mut igs);
    lri.mark_unusable_suggested_colors(isa);

    for class in RegClassId::ALL {
        color_class(
            &mut igs[class.index()],
            &mut lri,
            isa.regs.class(class),
        )?;
    }

    // Frame slots for everything the colouring loop marked for spilling.
    for lr in lri.ranges.values_mut() {
        if lr.spilled && !lr.dead && lr.spill_offset.is_none() {
            lr.spill_offset = Some(mir.frame.new_spill_slot());
        }
    }

    update_machine_code(isa, func, mir, lvi, &mut lri);
    Ok(())
}

// ---------------- interference construction ------------------------------

fn build_interference_graphs(
    func: &Function,
    mir: &MirFunction,
    lvi: &LiveVarInfo,
    lri: &mut LiveRangeInfo,
    igs: &mut [InterferenceGraph],
) {
    for &block in func.layout.blocks() {
        let sets = lvi.block_live_sets(mir, block);
        for (i, &mi) in mir.block_code[block].iter().enumerate() {
            let is_call = mir.op(mi).desc().is_call();
            if is_call {
                set_call_interferences(mir, mi, &sets.after[i], lri);
            }
            let data = mir.mi(mi);
            data.for_each_value_operand(|_, v, is_def| {
                if is_def {
                    add_interference(lri, igs, v, &sets.after[i]);
                }
            });
            for r in &data.implicit {
                if r.is_def {
                    add_interference(lri, igs, r.value, &sets.after[i]);
                }
            }
        }
    }

    // Arguments have no defining MI; they interfere with everything live
    // into the entry block.
    if let Some(entry) = func.entry_block() {
        let live_in = lvi.live_in[entry].clone();
        for &arg in &func.args {
            add_interference(lri, igs, arg, &live_in);
        }
    }
}

/// Add an interference edge between the defined value's range and every
/// range live after the defining instruction, within one register class.
fn add_interference(
    lri: &LiveRangeInfo,
    igs: &mut [InterferenceGraph],
    def: Value,
    live_after: &FxHashSet<Value>,
) {
    let Some(def_lr) = lri.lr_of(def) else { return };
    let class = lri.ranges[def_lr].class;
    for &v in live_after {
        let Some(v_lr) = lri.lr_of(v) else { continue };
        if v_lr == def_lr {
            continue;
        }
        if lri.ranges[v_lr].class == class {
            igs[class.index()].set_interference(def_lr, v_lr);
        }
    }
}

/// Every range live across a call must avoid volatile registers, except
/// the call's own return value, which is defined by the call itself.
fn set_call_interferences(
    mir: &MirFunction,
    mi: MachInst,
    live_after: &FxHashSet<Value>,
    lri: &mut LiveRangeInfo,
) {
    let ret_lr = mir
        .mi(mi)
        .call_desc
        .as_ref()
        .and_then(|d| d.ret_val)
        .and_then(|v| lri.lr_of(v));
    for &v in live_after {
        let Some(lr) = lri.lr_of(v) else { continue };
        if Some(lr) == ret_lr {
            continue;
        }
        lri.ranges[lr].call_interference = true;
        trace!("call interference for {:?}", lr);
    }
}

// ---------------- coalescing ---------------------------------------------

/// Merge def and use ranges related by a machine instruction when they have
/// the same register type, do not interfere, their combined effective
/// degree leaves room in the class, and at most one carries a suggestion.
fn coalesce_live_ranges(
    isa: &TargetIsa,
    func: &Function,
    mir: &MirFunction,
    lri: &mut LiveRangeInfo,
    igs: &mut [InterferenceGraph],
) {
    for &block in func.layout.blocks() {
        for &mi in &mir.block_code[block] {
            let data = mir.mi(mi);
            let mut defs: Vec<Value> = Vec::new();
            let mut uses: Vec<Value> = Vec::new();
            data.for_each_value_operand(|_, v, is_def| {
                if is_def {
                    defs.push(v);
                } else {
                    uses.push(v);
                }
            });
            for &d in &defs {
                for &u in &uses {
                    let (Some(ld), Some(lu)) = (lri.lr_of(d), lri.lr_of(u)) else {
                        continue;
                    };
                    if ld == lu {
                        continue;
                    }
                    if lri.ranges[ld].reg_type != lri.ranges[lu].reg_type {
                        continue;
                    }
                    let class = lri.ranges[ld].class;
                    let ig = &mut igs[class.index()];
                    if ig.interferes(ld, lu) {
                        continue;
                    }
                    let combined = ig.num_neighbors(ld) + ig.num_neighbors(lu);
                    if combined > isa.regs.class(class).num_colors {
                        continue;
                    }
                    if lri.ranges[ld].suggested.is_some()
                        && lri.ranges[lu].suggested.is_some()
                    {
                        continue;
                    }
                    trace!("coalescing {:?} and {:?} at {}", ld, lu, mi);
                    ig.merge_ig_nodes(ld, lu);
                    lri.union_and_update(ld, lu);
                }
            }
        }
    }
}

// ---------------- code patching ------------------------------------------

fn unified_of(isa: &TargetIsa, lri: &LiveRangeInfo, lr: LrId) -> Option<RegNum> {
    let range = &lri.ranges[lr];
    range
        .color
        .map(|c| isa.regs.class(range.class).unified(c))
}

fn copy_reg_to_reg(reg_type: RegType, src: RegNum, dst: RegNum) -> MachInstData {
    match reg_type {
        RegType::FloatSingle => MachInstData::new(MOp::FmovS)
            .mreg(src, false)
            .mreg(dst, true),
        RegType::FloatDouble => MachInstData::new(MOp::FmovD)
            .mreg(src, false)
            .mreg(dst, true),
        _ => MachInstData::new(MOp::Add)
            .mreg(src, false)
            .mreg(ZERO_REG, false)
            .mreg(dst, true),
    }
}

fn store_reg_to_mem(reg_type: RegType, reg: RegNum, base: RegNum, off: i32) -> MachInstData {
    let op = match reg_type {
        RegType::FloatSingle => MOp::Stf,
        RegType::FloatDouble => MOp::Stdf,
        _ => MOp::Stx,
    };
    MachInstData::new(op)
        .mreg(reg, false)
        .mreg(base, false)
        .simm(off as i64)
}

fn load_mem_to_reg(reg_type: RegType, base: RegNum, off: i32, reg: RegNum) -> MachInstData {
    let op = match reg_type {
        RegType::FloatSingle => MOp::Ldf,
        RegType::FloatDouble => MOp::Lddf,
        _ => MOp::Ldx,
    };
    MachInstData::new(op)
        .mreg(base, false)
        .simm(off as i64)
        .mreg(reg, true)
}

fn push_added(map: &mut FxHashMap<MachInst, AddedInstrs>, mi: MachInst) -> &mut AddedInstrs {
    map.entry(mi).or_default()
}

/// The main patching walk.
fn update_machine_code(
    isa: &TargetIsa,
    func: &Function,
    mir: &mut MirFunction,
    lvi: &LiveVarInfo,
    lri: &mut LiveRangeInfo,
) {
    let mut added: FxHashMap<MachInst, AddedInstrs> = FxHashMap::default();

    color_incoming_args(isa, func, mir, lri, &mut added);
    color_call_ret_args(isa, mir, lri, &mut added);

    // Caller-saving and spill patches need per-MI live information. The
    // scratch cursor resets once per MI so caller-save slots and spill
    // temporaries around the same call stay disjoint.
    for &block in func.layout.blocks() {
        let sets = lvi.block_live_sets(mir, block);
        let code = mir.block_code[block].clone();
        for (i, &mi) in code.iter().enumerate() {
            mir.frame.reset_tmp_pos();
            if mir.op(mi).desc().is_call() {
                insert_caller_saving(isa, mir, lri, mi, &sets.after[i], &mut added);
            }
            assign_operand_registers(isa, mir, lri, mi, &sets.before[i], &mut added);
        }
    }

    // Splice the added code into the block lists. Added-after sequences of
    // an instruction with delay slots move past its delay-slot
    // instructions.
    for &block in func.layout.blocks() {
        let code = mir.block_code[block].clone();
        let n = code.len();
        let mut after_at: Vec<Vec<MachInstData>> = (0..n).map(|_| Vec::new()).collect();
        let mut new_code: Vec<MachInst> = Vec::new();

        for (i, &mi) in code.iter().enumerate() {
            if let Some(a) = added.get_mut(&mi) {
                let d = mir.op(mi).desc().delay_slots as usize;
                let target = (i + d).min(n - 1);
                after_at[target].append(&mut a.after);
            }
        }
        for (i, &mi) in code.iter().enumerate() {
            if let Some(a) = added.get_mut(&mi) {
                for data in a.before.drain(..) {
                    let new_mi = mir.create(data);
                    new_code.push(new_mi);
                }
            }
            new_code.push(mi);
            for data in after_at[i].drain(..) {
                let new_mi = mir.create(data);
                new_code.push(new_mi);
            }
        }
        mir.block_code[block] = new_code;
    }
}

/// Copies or slot rewrites for incoming arguments that did not land in
/// their convention register.
fn color_incoming_args(
    isa: &TargetIsa,
    func: &Function,
    mir: &MirFunction,
    lri: &mut LiveRangeInfo,
    added: &mut FxHashMap<MachInst, AddedInstrs>,
) {
    let Some(entry) = func.entry_block() else { return };
    let Some(&first_mi) = mir.block_code[entry].first() else {
        return;
    };

    for (i, &arg) in func.args.iter().enumerate() {
        let Some(lr) = lri.lr_of(arg) else { continue };
        let reg_type = lri.ranges[lr].reg_type;
        let rc = isa.regs.class(lri.ranges[lr].class);
        let arg_color = match reg_type {
            RegType::Int => isa.regs.int_arg_color(i),
            RegType::FloatSingle | RegType::FloatDouble => isa.regs.float_arg_color(i),
            _ => None,
        };

        match (arg_color, lri.ranges[lr].color) {
            (Some(ac), Some(c)) if ac == c => {}
            (Some(ac), Some(_)) => {
                // The range got some other register: copy out of the
                // argument register at entry.
                let src = rc.unified(ac);
                let dst = unified_of(isa, lri, lr).unwrap();
                push_added(added, first_mi)
                    .before
                    .push(copy_reg_to_reg(reg_type, src, dst));
            }
            (Some(_), None) | (None, None) => {
                // Spilled: the incoming-argument home slot becomes the
                // spill slot.
                if lri.ranges[lr].spilled {
                    lri.ranges[lr].spill_offset = Some(isa.incoming_arg_offset(i));
                }
            }
            (None, Some(_)) => {
                // Passed on the stack but allocated a register: load from
                // the caller's slot.
                let dst = unified_of(isa, lri, lr).unwrap();
                push_added(added, first_mi).before.push(load_mem_to_reg(
                    reg_type,
                    FP_REG,
                    isa.incoming_arg_offset(i),
                    dst,
                ));
            }
        }
    }
}

/// Copies for outgoing call arguments, call return values, and returned
/// values that did not land in their convention register.
fn color_call_ret_args(
    isa: &TargetIsa,
    mir: &MirFunction,
    lri: &mut LiveRangeInfo,
    added: &mut FxHashMap<MachInst, AddedInstrs>,
) {
    for &mi in &lri.call_ret_mis.clone() {
        let data = mir.mi(mi);
        let Some(desc) = data.call_desc.clone() else {
            // A return: move the returned value into the result register.
            for r in data.implicit.clone() {
                let Some(lr) = lri.lr_of(r.value) else { continue };
                let reg_type = lri.ranges[lr].reg_type;
                let rc = isa.regs.class(lri.ranges[lr].class);
                let want = match reg_type {
                    RegType::Int => isa.regs.int_ret_color(),
                    _ => isa.regs.float_ret_color(),
                };
                match lri.ranges[lr].color {
                    Some(c) if c == want => {}
                    Some(c) => {
                        push_added(added, mi).before.push(copy_reg_to_reg(
                            reg_type,
                            rc.unified(c),
                            rc.unified(want),
                        ));
                    }
                    None => {
                        if let Some(off) = lri.ranges[lr].spill_offset {
                            push_added(added, mi).before.push(load_mem_to_reg(
                                reg_type,
                                FP_REG,
                                off,
                                rc.unified(want),
                            ));
                        }
                    }
                }
            }
            continue;
        };

        // Outgoing arguments.
        let arg_values: Vec<Value> = data
            .implicit
            .iter()
            .filter(|r| !r.is_def)
            .map(|r| r.value)
            .collect();
        let mut vi = 0usize;
        for (argi, info) in desc.args.iter().enumerate() {
            // Skip the integer-side copy entry; it is handled through its
            // own live range and place.
            if let Some(copy) = info.arg_copy {
                if vi < arg_values.len() && arg_values[vi] == copy {
                    place_call_arg(
                        isa,
                        lri,
                        added,
                        mi,
                        copy,
                        int_place_of(info.place),
                        argi,
                    );
                    vi += 1;
                }
            }
            if vi >= arg_values.len() {
                break;
            }
            let place = match info.place {
                ArgPlace::IntReg(c) if info.arg_copy.is_none() => Some((RegClassId::Int, c)),
                ArgPlace::IntReg(_) => None,
                ArgPlace::FloatReg(c) => Some((RegClassId::Float, c)),
                ArgPlace::FloatAndIntReg { fp, .. } => Some((RegClassId::Float, fp)),
                ArgPlace::Stack => None,
            };
            place_call_arg(isa, lri, added, mi, arg_values[vi], place, argi);
            if place.is_none() && matches!(info.place, ArgPlace::Stack) {
                store_stack_arg(isa, lri, added, mi, arg_values[vi], argi);
            }
            vi += 1;
        }

        // The return value.
        if let Some(rv) = desc.ret_val {
            if let Some(lr) = lri.lr_of(rv) {
                let reg_type = lri.ranges[lr].reg_type;
                let rc = isa.regs.class(lri.ranges[lr].class);
                let want = match reg_type {
                    RegType::Int => isa.regs.int_ret_color(),
                    _ => isa.regs.float_ret_color(),
                };
                match lri.ranges[lr].color {
                    Some(c) if c == want => {}
                    Some(c) => {
                        push_added(added, mi).after.push(copy_reg_to_reg(
                            reg_type,
                            rc.unified(want),
                            rc.unified(c),
                        ));
                    }
                    None => {
                        if let Some(off) = lri.ranges[lr].spill_offset {
                            push_added(added, mi).after.push(store_reg_to_mem(
                                reg_type,
                                rc.unified(want),
                                FP_REG,
                                off,
                            ));
                        }
                    }
                }
            }
        }
    }
}

fn int_place_of(place: ArgPlace) -> Option<(RegClassId, usize)> {
    match place {
        ArgPlace::IntReg(c) => Some((RegClassId::Int, c)),
        ArgPlace::FloatAndIntReg { int, .. } => Some((RegClassId::Int, int)),
        _ => None,
    }
}

/// Copy one call argument into its convention register when the allocator
/// put it elsewhere.
fn place_call_arg(
    isa: &TargetIsa,
    lri: &LiveRangeInfo,
    added: &mut FxHashMap<MachInst, AddedInstrs>,
    mi: MachInst,
    value: Value,
    place: Option<(RegClassId, usize)>,
    _argi: usize,
) {
    let Some((class, want)) = place else { return };
    let Some(lr) = lri.lr_of(value) else { return };
    let reg_type = lri.ranges[lr].reg_type;
    let rc = isa.regs.class(class);
    match lri.ranges[lr].color {
        Some(c) if c == want && lri.ranges[lr].class == class => {}
        Some(c) => {
            push_added(added, mi).before.push(copy_reg_to_reg(
                reg_type,
                isa.regs.class(lri.ranges[lr].class).unified(c),
                rc.unified(want),
            ));
        }
        None => {
            if let Some(off) = lri.ranges[lr].spill_offset {
                push_added(added, mi).before.push(load_mem_to_reg(
                    reg_type,
                    FP_REG,
                    off,
                    rc.unified(want),
                ));
            }
        }
    }
}

/// Store a stack-passed call argument into the outgoing argument area.
fn store_stack_arg(
    isa: &TargetIsa,
    lri: &LiveRangeInfo,
    added: &mut FxHashMap<MachInst, AddedInstrs>,
    mi: MachInst,
    value: Value,
    argi: usize,
) {
    let Some(lr) = lri.lr_of(value) else { return };
    let reg_type = lri.ranges[lr].reg_type;
    let off = isa.incoming_arg_offset(argi);
    if let Some(reg) = unified_of(isa, lri, lr) {
        push_added(added, mi)
            .before
            .push(store_reg_to_mem(reg_type, reg, SP_REG, off));
    }
    // A spilled stack argument would need a shuttle register; the assembler
    // temporary r7 is reserved for exactly this.
    else if let Some(spill) = lri.ranges[lr].spill_offset {
        let shuttle: RegNum = 7;
        push_added(added, mi)
            .before
            .push(load_mem_to_reg(reg_type, FP_REG, spill, shuttle));
        push_added(added, mi)
            .before
            .push(store_reg_to_mem(reg_type, shuttle, SP_REG, off));
    }
}

/// Save volatile registers that are live across a call and restore them
/// afterwards. The call's own return register is skipped.
fn insert_caller_saving(
    isa: &TargetIsa,
    mir: &mut MirFunction,
    lri: &LiveRangeInfo,
    mi: MachInst,
    live_after: &FxHashSet<Value>,
    added: &mut FxHashMap<MachInst, AddedInstrs>,
) {
    let mut pushed: FxHashSet<RegNum> = FxHashSet::default();

    // Never save/restore the register carrying the return value.
    if let Some(ret_lr) = mir
        .mi(mi)
        .call_desc
        .as_ref()
        .and_then(|d| d.ret_val)
        .and_then(|v| lri.lr_of(v))
    {
        if let Some(reg) = unified_of(isa, lri, ret_lr) {
            pushed.insert(reg);
        }
    }

    let mut live: Vec<Value> = live_after.iter().copied().collect();
    live.sort_unstable();
    for v in live {
        let Some(lr) = lri.lr_of(v) else { continue };
        let range = &lri.ranges[lr];
        let Some(color) = range.color else { continue };
        let rc = isa.regs.class(range.class);
        if !rc.is_volatile(color) {
            continue;
        }
        let reg = rc.unified(color);
        if !pushed.insert(reg) {
            continue;
        }
        let off = mir.frame.new_tmp_offset();
        let a = push_added(added, mi);
        // Saves go in front of any argument copies already queued, so the
        // saved value is the one live across the call.
        a.before
            .insert(0, store_reg_to_mem(range.reg_type, reg, SP_REG, off));
        a.after
            .push(load_mem_to_reg(range.reg_type, SP_REG, off, reg));
        trace!("caller-save {} around {}", reg, mi);
    }
}

/// Write the physical register of every value operand, inserting spill
/// loads and stores where the range has no register.
fn assign_operand_registers(
    isa: &TargetIsa,
    mir: &mut MirFunction,
    lri: &LiveRangeInfo,
    mi: MachInst,
    live_before: &FxHashSet<Value>,
    added: &mut FxHashMap<MachInst, AddedInstrs>,
) {
    // Registers this instruction already touches; spill temporaries must
    // avoid them.
    let mut used_regs: FxHashSet<RegNum> = FxHashSet::default();
    for operand in &mir.mi(mi).operands {
        match operand.kind {
            OperandKind::MReg(r) => {
                used_regs.insert(r);
            }
            OperandKind::VReg(v) | OperandKind::CcReg(v) => {
                if let Some(&r) = mir.pinned_regs.get(&v) {
                    used_regs.insert(r);
                } else if let Some(lr) = lri.lr_of(v) {
                    if let Some(r) = unified_of(isa, lri, lr) {
                        used_regs.insert(r);
                    }
                }
            }
            _ => {}
        }
    }

    let operand_count = mir.mi(mi).operands.len();
    for idx in 0..operand_count {
        let operand = mir.mi(mi).operands[idx];
        let Some(v) = operand.value() else { continue };

        if let Some(&pinned) = mir.pinned_regs.get(&v) {
            mir.mi_mut(mi).operands[idx].assigned = pinned;
            continue;
        }
        let Some(lr) = lri.lr_of(v) else {
            mir.mi_mut(mi).operands[idx].assigned = INVALID_REG;
            continue;
        };

        if let Some(reg) = unified_of(isa, lri, lr) {
            mir.mi_mut(mi).operands[idx].assigned = reg;
            continue;
        }

        // Spilled: find a register of the class that is free at this point,
        // load the value before a use and store it after a def.
        let range = &lri.ranges[lr];
        let spill_off = range
            .spill_offset
            .expect("spilled range without a frame slot");
        let rc = isa.regs.class(range.class);

        let mut live_colors: FxHashSet<usize> = FxHashSet::default();
        for &lv in live_before {
            if let Some(llr) = lri.lr_of(lv) {
                if lri.ranges[llr].class == range.class {
                    if let Some(c) = lri.ranges[llr].color {
                        live_colors.insert(c);
                        if lri.ranges[llr].reg_type == RegType::FloatDouble {
                            live_colors.insert(c + 1);
                        }
                    }
                }
            }
        }

        let free_color = (0..rc.num_colors).find(|&c| {
            !live_colors.contains(&c) && !used_regs.contains(&rc.unified(c))
        });

        let (tmp_reg, needs_save) = match free_color {
            Some(c) => (rc.unified(c), false),
            None => {
                // Nothing free: borrow a register the instruction itself
                // does not touch and save it around the MI.
                let c = (0..rc.num_colors)
                    .find(|&c| !used_regs.contains(&rc.unified(c)))
                    .expect("no register in class free of this instruction");
                (rc.unified(c), true)
            }
        };
        used_regs.insert(tmp_reg);

        // Save the borrowed register first, restore it last, with the
        // spill traffic in between.
        let save_off = if needs_save {
            Some(mir.frame.new_tmp_offset())
        } else {
            None
        };
        let a = push_added(added, mi);
        if let Some(off) = save_off {
            a.before
                .push(store_reg_to_mem(range.reg_type, tmp_reg, SP_REG, off));
        }
        let is_use = !operand.is_def || operand.is_def_and_use;
        if is_use {
            a.before
                .push(load_mem_to_reg(range.reg_type, FP_REG, spill_off, tmp_reg));
        }
        if operand.is_def {
            a.after
                .push(store_reg_to_mem(range.reg_type, tmp_reg, FP_REG, spill_off));
        }
        if let Some(off) = save_off {
            a.after
                .push(load_mem_to_reg(range.reg_type, SP_REG, off, tmp_reg));
        }
        mir.mi_mut(mi).operands[idx].assigned = tmp_reg;
        trace!(
            "spill patch for {} at {}: temp {}",
            v,
            mi,
            tmp_reg
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstructionData, Module, Opcode, Signature, Type, ValueDef};
    use crate::select::select_function;
    use smallvec::smallvec;

    // Build, select, and allocate a function that keeps several values live
    // across a call, then check the colouring invariants directly.
    #[test]
    fn interfering_ranges_get_distinct_colors() {
        let mut module = Module::new();
        let callee = module.add_function(crate::ir::Function::declare(
            "ext",
            Signature::new(vec![], Type::VOID),
        ));
        let isa = crate::isa::k64();

        let mut func = crate::ir::Function::new(
            "t",
            Signature::new(vec![Type::I64, Type::I64], Type::I64),
        );
        let (a, b) = (func.args[0], func.args[1]);
        let ptr_ty = module.types.ptr_to(Type::VOID);
        let callee_val = func.dfg.make_value(ptr_ty, ValueDef::FuncAddr(callee));
        let block = func.create_block();
        let (_, s) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [a, b],
            },
            Type::I64,
        );
        func.append_inst(
            block,
            InstructionData::Call {
                callee: callee_val,
                args: smallvec![],
            },
            Type::VOID,
        );
        let (_, t) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Mul,
                args: [s.unwrap(), b],
            },
            Type::I64,
        );
        func.append_inst(
            block,
            InstructionData::Return { value: t },
            Type::VOID,
        );
        let fr = module.add_function(func);

        let crate::ir::Module { types, funcs, .. } = &mut module;
        let func = &mut funcs[fr];
        let callee_info = crate::fx::FxHashMap::default();
        let mut mir = select_function(&isa, types, func, &callee_info).unwrap();

        let cfg = ControlFlowGraph::compute(func);
        let lvi = LiveVarInfo::compute(func, &mir, &cfg);

        let mut lri = LiveRangeInfo::construct(&isa, types, func, &mir, &cfg);
        let mut igs: Vec<InterferenceGraph> = RegClassId::ALL
            .iter()
            .map(|&c| InterferenceGraph::new(c))
            .collect();
        for (id, lr) in lri.ranges.iter() {
            if !lr.dead {
                igs[lr.class.index()].add_lr(id);
            }
        }
        for ig in &mut igs {
            ig.create_matrix();
        }
        build_interference_graphs(func, &mir, &lvi, &mut lri, &mut igs);
        coalesce_live_ranges(&isa, func, &mir, &mut lri, &mut igs);
        lri.mark_unusable_suggested_colors(&isa);
        for class in RegClassId::ALL {
            color_class(&mut igs[class.index()], &mut lri, isa.regs.class(class)).unwrap();
        }

        // Interfering ranges never share a colour.
        for class in RegClassId::ALL {
            let ig = &igs[class.index()];
            for i in 0..ig.num_nodes() {
                let Some(node) = ig.nodes[i].as_ref() else { continue };
                let Some(ci) = lri.ranges[node.lr].color else { continue };
                for &j in &node.adj {
                    let Some(nbr) = ig.nodes[j].as_ref() else { continue };
                    if let Some(cj) = lri.ranges[nbr.lr].color {
                        assert_ne!(
                            ci, cj,
                            "interfering ranges {:?} and {:?} share colour {}",
                            node.lr, nbr.lr, ci
                        );
                    }
                }
            }
        }

        // Ranges live across the call either sit in a non-volatile register
        // or carry the save-across-calls mark.
        let mut saw_call_spanning = false;
        for lr in lri.ranges.values() {
            if lr.dead || !lr.call_interference {
                continue;
            }
            saw_call_spanning = true;
            if let Some(c) = lr.color {
                let rc = isa.regs.class(lr.class);
                assert!(
                    !rc.is_volatile(c) || lr.must_save_across_calls,
                    "call-spanning range got a bare volatile colour"
                );
            }
        }
        assert!(saw_call_spanning, "test should create a call-spanning range");

        // The full driver leaves every operand assigned.
        allocate_registers(&isa, types, func, &mut mir, &cfg, &lvi).unwrap();
    }
}
