//! Target description for the k64 reference architecture.
//!
//! Everything the passes know about the machine comes from the read-only
//! tables bundled in [`TargetIsa`]: the per-opcode descriptor table, the
//! issue model, the register file, and the calling convention. A `TargetIsa`
//! is constructed once at start-up and passed by reference into every pass.

mod opcodes;
mod registers;
mod sched_info;

pub use self::opcodes::{
    InstrDesc, IssueClass, MOp, F_BRANCH, F_BREAKS_GROUP, F_CALL, F_CC, F_LOAD, F_NOP, F_PSEUDO,
    F_SINGLE_ISSUE, F_STORE, NO_RESULT, NUM_ISSUE_CLASSES,
};
pub use self::registers::{
    RegClassData, RegClassId, RegInfo, RegNum, RegType, FCC_BASE, FLOAT_BASE, FP_REG, ICC_BASE,
    INVALID_REG, LINK_REG, NUM_REG_CLASSES, SP_REG, ZERO_REG,
};
pub use self::sched_info::SchedInfo;

/// The bundled target description.
pub struct TargetIsa {
    /// Register file and calling-convention registers.
    pub regs: RegInfo,
    /// Issue model.
    pub sched: SchedInfo,
}

impl TargetIsa {
    /// Offset from the frame pointer of the incoming argument save area.
    /// Argument `i`'s home slot is at `incoming_arg_offset(i)`.
    pub fn incoming_arg_offset(&self, i: usize) -> i32 {
        64 + 8 * i as i32
    }

    /// Offset from the stack pointer of the dynamically-sized area used by
    /// variable-size allocas. The k64 stack grows down.
    pub fn dynamic_area_offset(&self) -> i32 {
        128
    }
}

/// Construct the k64 target description.
pub fn k64() -> TargetIsa {
    TargetIsa {
        regs: RegInfo::k64(),
        sched: SchedInfo::k64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct() {
        let isa = k64();
        assert_eq!(isa.sched.num_slots, 2);
        assert_eq!(isa.regs.class(RegClassId::Int).num_colors, 24);
        assert_eq!(isa.incoming_arg_offset(2), 80);
    }
}
