//! Issue model of the k64 pipeline.
//!
//! k64 issues up to two instructions per cycle: one may be a memory
//! operation (slot 0 only) and one a branch (slot 1 only). A handful of
//! opcode pairs carry minimum issue gaps, and the divides stall the front
//! end for a few cycles after issue.

use crate::isa::opcodes::{IssueClass, MOp, NUM_ISSUE_CLASSES};

/// The issue model.
pub struct SchedInfo {
    /// Total issue width per cycle.
    pub num_slots: usize,
    max_per_class: [usize; NUM_ISSUE_CLASSES],
}

impl SchedInfo {
    /// The k64 issue model.
    pub fn k64() -> Self {
        Self {
            num_slots: 2,
            // Indexed by IssueClass order: Int, Mem, Branch, Fp, Pseudo.
            max_per_class: [2, 1, 1, 1, 0],
        }
    }

    /// Maximum number of instructions of `class` that can issue per cycle.
    pub fn max_issue_for_class(&self, class: IssueClass) -> usize {
        self.max_per_class[class_index(class)]
    }

    /// Can `op` occupy issue slot `slot`?
    pub fn instr_can_use_slot(&self, op: MOp, slot: usize) -> bool {
        debug_assert!(slot < self.num_slots);
        op.desc().slot_mask() & (1 << slot) != 0
    }

    /// Minimum number of cycles between issuing `from` and issuing `to`.
    ///
    /// Zero means the pair may issue in the same cycle (subject to slot and
    /// class limits).
    pub fn min_issue_gap(&self, from: MOp, to: MOp) -> usize {
        use MOp::*;
        match (from, to) {
            // A float compare must be separated from the branch that uses
            // its condition code.
            (FcmpS | FcmpD, Fbe | Fbne | Fbl | Fble | Fbg | Fbge) => 2,
            // Back-to-back divides contend for the single divider.
            (Sdivx | Udivx, Sdivx | Udivx) => 6,
            _ => 0,
        }
    }

    /// The opcodes that have a non-zero minimum gap after `op`, if any.
    ///
    /// Used by the scheduler to update earliest start times without probing
    /// the whole opcode space.
    pub fn conflict_list(&self, op: MOp) -> &'static [MOp] {
        use MOp::*;
        static FCMP_CONFLICTS: [MOp; 6] = [Fbe, Fbne, Fbl, Fble, Fbg, Fbge];
        static DIV_CONFLICTS: [MOp; 2] = [Sdivx, Udivx];
        match op {
            FcmpS | FcmpD => &FCMP_CONFLICTS,
            Sdivx | Udivx => &DIV_CONFLICTS,
            _ => &[],
        }
    }

    /// Cycles during which nothing at all can issue after `op`.
    pub fn num_bubbles_after(&self, op: MOp) -> usize {
        use MOp::*;
        match op {
            Sdivx | Udivx => 2,
            _ => 0,
        }
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_and_classes() {
        let si = SchedInfo::k64();
        assert_eq!(si.num_slots, 2);
        assert!(si.instr_can_use_slot(MOp::Ldx, 0));
        assert!(!si.instr_can_use_slot(MOp::Ldx, 1));
        assert!(si.instr_can_use_slot(MOp::Ba, 1));
        assert!(!si.instr_can_use_slot(MOp::Ba, 0));
        assert_eq!(si.max_issue_for_class(IssueClass::Mem), 1);
        assert_eq!(si.max_issue_for_class(IssueClass::Int), 2);
    }

    #[test]
    fn gaps() {
        let si = SchedInfo::k64();
        assert_eq!(si.min_issue_gap(MOp::FcmpS, MOp::Fbl), 2);
        assert_eq!(si.min_issue_gap(MOp::Add, MOp::Add), 0);
        assert_eq!(si.min_issue_gap(MOp::Sdivx, MOp::Udivx), 6);
        assert!(si.conflict_list(MOp::FcmpD).contains(&MOp::Fbe));
        assert!(si.conflict_list(MOp::Add).is_empty());
    }
}
