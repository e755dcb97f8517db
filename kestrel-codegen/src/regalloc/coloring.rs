//! Graph colouring for one register class.
//!
//! Briggs-style simplify/select: unconstrained nodes (degree below the
//! register count) go on the stack first; when only constrained nodes
//! remain, the one with the lowest spill-cost/degree ratio is pushed as a
//! potential spill. Popping assigns colours, preferring volatile registers
//! for call-free ranges and non-volatile registers for call-spanning ones;
//! a call-spanning range that only finds a volatile colour is marked for
//! save/restore around calls, and a range with no colour at all spills.

use crate::isa::{RegClassData, RegType};
use crate::regalloc::interference::InterferenceGraph;
use crate::regalloc::live_ranges::{LiveRangeInfo, LrId};
use crate::result::{CodegenError, CodegenResult};
use log::trace;

/// Colour every live range of one class.
pub fn color_class(
    ig: &mut InterferenceGraph,
    lri: &mut LiveRangeInfo,
    rc: &RegClassData,
) -> CodegenResult<()> {
    ig.set_cur_degrees();

    let mut stack: Vec<usize> = Vec::new();
    push_all_ig_nodes(ig, lri, rc, &mut stack);

    // Pop and colour.
    while let Some(index) = stack.pop() {
        let lr_id = ig.nodes[index].as_ref().unwrap().lr;
        if lri.ranges[lr_id].has_color() {
            continue;
        }
        color_ig_node(ig, lri, rc, index)?;
    }
    Ok(())
}

/// Push the whole graph: unconstrained nodes freely, constrained ones by
/// minimum spill-cost/degree.
fn push_all_ig_nodes(
    ig: &mut InterferenceGraph,
    lri: &LiveRangeInfo,
    rc: &RegClassData,
    stack: &mut Vec<usize>,
) {
    let mut pushed_all = push_unconstrained(ig, rc, stack);
    while !pushed_all {
        // Constrained nodes remain: push the cheapest spill candidate, then
        // try again for newly unconstrained ones.
        let spill_index = ig_node_with_min_spill_cost(ig, lri);
        trace!("constrained ig node {} pushed as spill candidate", spill_index);
        stack.push(spill_index);
        ig.push_on_stack(spill_index);
        pushed_all = push_unconstrained(ig, rc, stack);
    }
}

fn push_unconstrained(
    ig: &mut InterferenceGraph,
    rc: &RegClassData,
    stack: &mut Vec<usize>,
) -> bool {
    let mut pushed_all = true;
    let mut progress = true;
    while progress {
        progress = false;
        for index in 0..ig.num_nodes() {
            let Some(node) = ig.nodes[index].as_ref() else {
                continue;
            };
            if node.on_stack {
                continue;
            }
            if (node.cur_degree as usize) < rc.num_colors {
                stack.push(index);
                ig.push_on_stack(index);
                progress = true;
            }
        }
        // Another pass may find nodes whose degree just dropped.
        if !progress {
            break;
        }
    }
    for index in 0..ig.num_nodes() {
        if let Some(node) = ig.nodes[index].as_ref() {
            if !node.on_stack {
                pushed_all = false;
            }
        }
    }
    pushed_all
}

fn ig_node_with_min_spill_cost(ig: &InterferenceGraph, lri: &LiveRangeInfo) -> usize {
    let mut best: Option<(usize, f64)> = None;
    for index in 0..ig.num_nodes() {
        let Some(node) = ig.nodes[index].as_ref() else {
            continue;
        };
        if node.on_stack {
            continue;
        }
        let cost =
            lri.ranges[node.lr].spill_cost as f64 / (node.cur_degree as f64 + 1.0);
        if best.map_or(true, |(_, c)| cost < c) {
            best = Some((index, cost));
        }
    }
    best.expect("no ig node to spill").0
}

/// The colours already claimed by the neighbours of `index`, including
/// usable suggestions.
fn neighbor_colors(
    ig: &InterferenceGraph,
    lri: &LiveRangeInfo,
    rc: &RegClassData,
    index: usize,
) -> Vec<bool> {
    let mut used = vec![false; rc.num_colors];
    let node = ig.nodes[index].as_ref().unwrap();
    for &nbr in &node.adj {
        let Some(nbr_node) = ig.nodes[nbr].as_ref() else {
            continue;
        };
        let nlr = &lri.ranges[nbr_node.lr];
        let mark = |used: &mut Vec<bool>, c: usize| {
            if c < used.len() {
                used[c] = true;
            }
            // A double occupies its odd partner as well.
            if nlr.reg_type == RegType::FloatDouble && c + 1 < used.len() {
                used[c + 1] = true;
            }
        };
        if let Some(c) = nlr.color {
            mark(&mut used, c);
        } else if let Some(c) = nlr.suggested {
            if nlr.suggested_usable {
                mark(&mut used, c);
            }
        }
    }
    used
}

fn color_ig_node(
    ig: &InterferenceGraph,
    lri: &mut LiveRangeInfo,
    rc: &RegClassData,
    index: usize,
) -> CodegenResult<()> {
    let lr_id = ig.nodes[index].as_ref().unwrap().lr;
    let used = neighbor_colors(ig, lri, rc, index);
    let lr = &lri.ranges[lr_id];

    // The suggested colour wins when it is usable and free.
    if let Some(sug) = lr.suggested {
        if lr.suggested_usable && !used[sug] && fits_reg_type(lr.reg_type, sug, &used) {
            trace!("lr {:?} takes suggested colour {}", lr_id, sug);
            lri.ranges[lr_id].color = Some(sug);
            return Ok(());
        }
    }

    let chosen = match lr.reg_type {
        RegType::FloatDouble => color_double(rc, lr.call_interference, &used),
        RegType::FloatSingle => color_single_float(rc, lr.call_interference, &used),
        _ => color_scalar(rc, lr.call_interference, &used),
    };

    match chosen {
        Some((color, needs_save)) => {
            let lr = &mut lri.ranges[lr_id];
            lr.color = Some(color);
            if needs_save {
                lr.must_save_across_calls = true;
            }
            Ok(())
        }
        None => {
            // A node only reaches the stack uncoloured when constrained; a
            // failure on an unconstrained call-free range means the
            // interference graph is inconsistent.
            let degree = ig.nodes[index].as_ref().unwrap().adj.len();
            if !lri.ranges[lr_id].call_interference && degree < rc.num_colors {
                return Err(CodegenError::Allocator { class: rc.name });
            }
            trace!("lr {:?} spills", lr_id);
            lri.ranges[lr_id].spilled = true;
            Ok(())
        }
    }
}

fn fits_reg_type(reg_type: RegType, color: usize, used: &[bool]) -> bool {
    match reg_type {
        RegType::FloatDouble => {
            color % 2 == 0 && color + 1 < used.len() && !used[color + 1]
        }
        _ => true,
    }
}

/// Colour search for integer and condition-code ranges: volatiles first for
/// call-free ranges, non-volatiles first for call-spanning ones, and as a
/// last resort a volatile with a save-across-calls mark.
fn color_scalar(
    rc: &RegClassData,
    call_interference: bool,
    used: &[bool],
) -> Option<(usize, bool)> {
    let start = if call_interference {
        rc.start_of_nonvolatile
    } else {
        0
    };
    for c in start..rc.num_colors {
        if !used[c] {
            return Some((c, false));
        }
    }
    if call_interference {
        for c in 0..rc.start_of_nonvolatile {
            if !used[c] {
                return Some((c, true));
            }
        }
    }
    None
}

/// Single-precision ranges allocate only the directly addressable region
/// below the double-only colours.
fn color_single_float(
    rc: &RegClassData,
    call_interference: bool,
    used: &[bool],
) -> Option<(usize, bool)> {
    let limit = rc.double_region_start.unwrap_or(rc.num_colors);
    let start = if call_interference {
        rc.start_of_nonvolatile
    } else {
        0
    };
    for c in start..limit {
        if !used[c] {
            return Some((c, false));
        }
    }
    if call_interference {
        for c in 0..rc.start_of_nonvolatile {
            if !used[c] {
                return Some((c, true));
            }
        }
    }
    None
}

/// Doubles try the double-only region first so the directly addressable
/// registers stay available for singles, then fall back to even pairs in
/// the shared region.
fn color_double(
    rc: &RegClassData,
    call_interference: bool,
    used: &[bool],
) -> Option<(usize, bool)> {
    let pair_free = |c: usize| c + 1 < used.len() && !used[c] && !used[c + 1];

    if let Some(dstart) = rc.double_region_start {
        let mut c = dstart;
        while c + 1 < rc.num_colors {
            if pair_free(c) {
                return Some((c, false));
            }
            c += 2;
        }
    }
    let limit = rc.double_region_start.unwrap_or(rc.num_colors);
    let start = if call_interference {
        // Round the non-volatile boundary up to an even pair.
        (rc.start_of_nonvolatile + 1) & !1
    } else {
        0
    };
    let mut c = start;
    while c + 1 < limit {
        if pair_free(c) {
            return Some((c, false));
        }
        c += 2;
    }
    if call_interference {
        let mut c = 0;
        while c + 1 < rc.start_of_nonvolatile.min(limit) {
            if pair_free(c) {
                return Some((c, true));
            }
            c += 2;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{RegClassId, RegInfo};

    #[test]
    fn scalar_color_orders() {
        let regs = RegInfo::k64();
        let rc = regs.class(RegClassId::Int);
        let used = vec![false; rc.num_colors];
        // Call-free ranges start from the volatile end.
        assert_eq!(color_scalar(rc, false, &used), Some((0, false)));
        // Call-spanning ranges prefer non-volatiles.
        assert_eq!(
            color_scalar(rc, true, &used),
            Some((rc.start_of_nonvolatile, false))
        );
        // With all non-volatiles taken, a volatile colour comes back with
        // the save-across-calls mark.
        let mut used = vec![false; rc.num_colors];
        for c in rc.start_of_nonvolatile..rc.num_colors {
            used[c] = true;
        }
        assert_eq!(color_scalar(rc, true, &used), Some((0, true)));
        // Nothing free at all spills.
        let used = vec![true; rc.num_colors];
        assert_eq!(color_scalar(rc, true, &used), None);
    }

    #[test]
    fn doubles_prefer_upper_region() {
        let regs = RegInfo::k64();
        let rc = regs.class(RegClassId::Float);
        let used = vec![false; rc.num_colors];
        let (c, _) = color_double(rc, false, &used).unwrap();
        assert_eq!(c, rc.double_region_start.unwrap());

        // With the upper region full, an even pair below is used.
        let mut used = vec![false; rc.num_colors];
        for c in rc.double_region_start.unwrap()..rc.num_colors {
            used[c] = true;
        }
        let (c, _) = color_double(rc, false, &used).unwrap();
        assert_eq!(c % 2, 0);
        assert!(c < rc.double_region_start.unwrap());
    }

    #[test]
    fn singles_stay_below_double_region() {
        let regs = RegInfo::k64();
        let rc = regs.class(RegClassId::Float);
        let mut used = vec![false; rc.num_colors];
        for c in 0..rc.double_region_start.unwrap() {
            used[c] = true;
        }
        // Everything addressable by singles is taken; the double-only
        // region must not be offered.
        assert_eq!(color_single_float(rc, false, &used), None);
    }
}
