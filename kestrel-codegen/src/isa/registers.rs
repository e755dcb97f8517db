//! Registers and register classes of the k64 reference target.
//!
//! Physical registers are partitioned into four disjoint classes: integer,
//! float, integer condition code, and float condition code. The allocator
//! works in terms of *colours*: indexes into a class's preferred allocation
//! order. A colour maps to a physical register through the class's order
//! table, and volatile (caller-saved) registers come first in that order so
//! call-free live ranges pick them up cheaply.

use crate::ir::{Type, TypePool};
use core::fmt;

/// A unified physical register number across all classes.
pub type RegNum = u16;

/// Identifier of a register class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegClassId {
    /// General-purpose 64-bit integer registers.
    Int,
    /// Floating-point registers (64 singles, pairable into 32 doubles).
    Float,
    /// The integer condition-code register.
    IntCc,
    /// The float condition-code registers fcc0..fcc3.
    FloatCc,
}

/// Number of register classes.
pub const NUM_REG_CLASSES: usize = 4;

impl RegClassId {
    /// All classes, in index order.
    pub const ALL: [RegClassId; NUM_REG_CLASSES] = [
        RegClassId::Int,
        RegClassId::Float,
        RegClassId::IntCc,
        RegClassId::FloatCc,
    ];

    /// Dense index of this class.
    pub fn index(self) -> usize {
        match self {
            RegClassId::Int => 0,
            RegClassId::Float => 1,
            RegClassId::IntCc => 2,
            RegClassId::FloatCc => 3,
        }
    }
}

/// The register type a value occupies, refining the class for allocation
/// and copy-code purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegType {
    /// An integer or pointer register.
    Int,
    /// A single-precision float register.
    FloatSingle,
    /// A double-precision register pair.
    FloatDouble,
    /// The integer condition code.
    IntCc,
    /// A float condition code.
    FloatCc,
}

impl RegType {
    /// The class this register type allocates from.
    pub fn class(self) -> RegClassId {
        match self {
            RegType::Int => RegClassId::Int,
            RegType::FloatSingle | RegType::FloatDouble => RegClassId::Float,
            RegType::IntCc => RegClassId::IntCc,
            RegType::FloatCc => RegClassId::FloatCc,
        }
    }
}

/// Static description of one register class.
pub struct RegClassData {
    /// Class name for diagnostics.
    pub name: &'static str,
    /// The class identifier.
    pub id: RegClassId,
    /// Number of allocatable colours.
    pub num_colors: usize,
    /// Colours `0..start_of_nonvolatile` map to caller-saved registers.
    pub start_of_nonvolatile: usize,
    /// First colour of the double-only region, if the class has one.
    pub double_region_start: Option<usize>,
    /// Preferred allocation order: colour -> physical register number within
    /// the class.
    pub order: &'static [u16],
    /// Unified register number of the class's first register.
    pub unified_base: RegNum,
}

impl RegClassData {
    /// Is the register behind `color` caller-saved?
    pub fn is_volatile(&self, color: usize) -> bool {
        color < self.start_of_nonvolatile
    }

    /// The physical register (within the class) behind `color`.
    pub fn reg_of_color(&self, color: usize) -> u16 {
        self.order[color]
    }

    /// Unified register number behind `color`.
    pub fn unified(&self, color: usize) -> RegNum {
        self.unified_base + self.reg_of_color(color)
    }
}

impl fmt::Display for RegClassData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}

// Integer registers. r0 is the hardwired zero, r7 the assembler temporary,
// r14 the stack pointer, r15 the link register, r30 the frame pointer, and
// r28/r29/r31 are reserved to the runtime. The remaining 24 are allocatable:
// r8..r13 (argument registers) and r1..r6 are caller-saved, r16..r27 are
// callee-saved.
static INT_ORDER: [u16; 24] = [
    8, 9, 10, 11, 12, 13, // argument registers, volatile
    1, 2, 3, 4, 5, 6, // scratch, volatile
    16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, // callee-saved
];

// Float registers are allocated by their own number: colour f equals
// register f. f0..f7 are caller-saved, f8..f31 callee-saved, and f32..f63
// are addressable only as double pairs.
static FLOAT_ORDER: [u16; 64] = {
    let mut a = [0u16; 64];
    let mut i = 0;
    while i < 64 {
        a[i] = i as u16;
        i += 1;
    }
    a
};

static ICC_ORDER: [u16; 1] = [0];
static FCC_ORDER: [u16; 4] = [0, 1, 2, 3];

/// The hardwired zero register's unified number.
pub const ZERO_REG: RegNum = 0;
/// The stack pointer's unified number.
pub const SP_REG: RegNum = 14;
/// The link (return address) register's unified number.
pub const LINK_REG: RegNum = 15;
/// The frame pointer's unified number.
pub const FP_REG: RegNum = 30;

/// First unified number of the float registers.
pub const FLOAT_BASE: RegNum = 32;
/// Unified number of the integer condition-code register.
pub const ICC_BASE: RegNum = 96;
/// First unified number of the float condition-code registers.
pub const FCC_BASE: RegNum = 97;

/// An invalid unified register number, used before allocation has run.
pub const INVALID_REG: RegNum = u16::MAX;

static INT_CLASS: RegClassData = RegClassData {
    name: "int",
    id: RegClassId::Int,
    num_colors: 24,
    start_of_nonvolatile: 12,
    double_region_start: None,
    order: &INT_ORDER,
    unified_base: 0,
};

static FLOAT_CLASS: RegClassData = RegClassData {
    name: "float",
    id: RegClassId::Float,
    num_colors: 64,
    start_of_nonvolatile: 8,
    double_region_start: Some(32),
    order: &FLOAT_ORDER,
    unified_base: FLOAT_BASE,
};

static ICC_CLASS: RegClassData = RegClassData {
    name: "icc",
    id: RegClassId::IntCc,
    num_colors: 1,
    start_of_nonvolatile: 1,
    double_region_start: None,
    order: &ICC_ORDER,
    unified_base: ICC_BASE,
};

static FCC_CLASS: RegClassData = RegClassData {
    name: "fcc",
    id: RegClassId::FloatCc,
    num_colors: 4,
    start_of_nonvolatile: 4,
    double_region_start: None,
    order: &FCC_ORDER,
    unified_base: FCC_BASE,
};

/// Register information for the whole target.
pub struct RegInfo {
    classes: [&'static RegClassData; NUM_REG_CLASSES],
    /// Number of integer argument registers.
    pub num_int_arg_regs: usize,
    /// Number of float argument registers.
    pub num_float_arg_regs: usize,
}

impl RegInfo {
    /// The k64 register file.
    pub fn k64() -> Self {
        Self {
            classes: [&INT_CLASS, &FLOAT_CLASS, &ICC_CLASS, &FCC_CLASS],
            num_int_arg_regs: 6,
            num_float_arg_regs: 8,
        }
    }

    /// The data for `class`.
    pub fn class(&self, class: RegClassId) -> &'static RegClassData {
        self.classes[class.index()]
    }

    /// The register class a value of type `ty` allocates from.
    ///
    /// `is_cc` selects the condition-code class for the boolean temporaries
    /// the selector creates to model condition codes.
    pub fn class_of_type(&self, pool: &TypePool, ty: Type, is_cc: bool) -> RegClassId {
        self.reg_type_of(pool, ty, is_cc).class()
    }

    /// The register type of a value of type `ty`.
    pub fn reg_type_of(&self, pool: &TypePool, ty: Type, is_cc: bool) -> RegType {
        if is_cc {
            if pool.is_float(ty) {
                RegType::FloatCc
            } else {
                RegType::IntCc
            }
        } else if ty == Type::F64 {
            RegType::FloatDouble
        } else if ty == Type::F32 {
            RegType::FloatSingle
        } else {
            RegType::Int
        }
    }

    /// The suggested colour for integer argument `i`, if it is passed in a
    /// register.
    pub fn int_arg_color(&self, i: usize) -> Option<usize> {
        (i < self.num_int_arg_regs).then_some(i)
    }

    /// The suggested colour for float argument `i`. Doubles occupy an even
    /// pair, so argument positions map to even colours.
    pub fn float_arg_color(&self, i: usize) -> Option<usize> {
        (i < self.num_float_arg_regs).then_some(2 * i)
    }

    /// Colour of the integer return-value register.
    pub fn int_ret_color(&self) -> usize {
        0
    }

    /// Colour of the float return-value register.
    pub fn float_ret_color(&self) -> usize {
        0
    }

    /// Display name of a unified register number.
    pub fn unified_name(&self, reg: RegNum) -> String {
        if reg == INVALID_REG {
            "<invalid>".to_string()
        } else if reg < FLOAT_BASE {
            format!("r{}", reg)
        } else if reg < ICC_BASE {
            format!("f{}", reg - FLOAT_BASE)
        } else if reg == ICC_BASE {
            "icc".to_string()
        } else {
            format!("fcc{}", reg - FCC_BASE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_class_shape() {
        let regs = RegInfo::k64();
        let rc = regs.class(RegClassId::Int);
        assert_eq!(rc.num_colors, 24);
        assert!(rc.is_volatile(0));
        assert!(rc.is_volatile(11));
        assert!(!rc.is_volatile(12));
        // Colour 0 is the first argument register.
        assert_eq!(rc.unified(0), 8);
        // First callee-saved colour.
        assert_eq!(rc.unified(12), 16);
    }

    #[test]
    fn float_class_shape() {
        let regs = RegInfo::k64();
        let rc = regs.class(RegClassId::Float);
        assert_eq!(rc.num_colors, 64);
        assert_eq!(rc.double_region_start, Some(32));
        assert_eq!(rc.unified(3), FLOAT_BASE + 3);
    }

    #[test]
    fn arg_colors() {
        let regs = RegInfo::k64();
        assert_eq!(regs.int_arg_color(0), Some(0));
        assert_eq!(regs.int_arg_color(5), Some(5));
        assert_eq!(regs.int_arg_color(6), None);
        assert_eq!(regs.float_arg_color(1), Some(2));
        assert_eq!(regs.float_arg_color(8), None);
    }

    #[test]
    fn unified_names() {
        let regs = RegInfo::k64();
        assert_eq!(regs.unified_name(0), "r0");
        assert_eq!(regs.unified_name(FLOAT_BASE + 2), "f2");
        assert_eq!(regs.unified_name(ICC_BASE), "icc");
        assert_eq!(regs.unified_name(FCC_BASE + 1), "fcc1");
    }
}
