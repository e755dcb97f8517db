//! Machine opcodes of the k64 reference target and their descriptors.
//!
//! k64 is a 64-bit in-order RISC with branch delay slots, a shared integer
//! condition-code register, four float condition-code registers, and dual
//! issue. The descriptor table is the single source of truth for latencies,
//! delay slots, immediate-field widths, and issue behaviour.

use core::fmt;

/// Issue class of an opcode. At most a fixed number of instructions of each
/// class can issue per cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueClass {
    /// Integer ALU pipeline.
    Int,
    /// Load/store pipeline.
    Mem,
    /// Branch unit.
    Branch,
    /// Floating-point pipeline.
    Fp,
    /// Pseudo instructions that never issue (phi placeholders).
    Pseudo,
}

/// Number of issue classes with per-cycle limits.
pub const NUM_ISSUE_CLASSES: usize = 5;

/// Descriptor flag: reads memory.
pub const F_LOAD: u16 = 0x0001;
/// Descriptor flag: writes memory.
pub const F_STORE: u16 = 0x0002;
/// Descriptor flag: is a call (treated as both load and store for ordering).
pub const F_CALL: u16 = 0x0004;
/// Descriptor flag: is a branch.
pub const F_BRANCH: u16 = 0x0008;
/// Descriptor flag: reads or writes a condition-code register.
pub const F_CC: u16 = 0x0010;
/// Descriptor flag: must issue alone in its cycle.
pub const F_SINGLE_ISSUE: u16 = 0x0020;
/// Descriptor flag: ends the issue group it is placed in.
pub const F_BREAKS_GROUP: u16 = 0x0040;
/// Descriptor flag: the canonical no-operation.
pub const F_NOP: u16 = 0x0080;
/// Descriptor flag: dummy instruction that never issues.
pub const F_PSEUDO: u16 = 0x0100;

/// Static description of one machine opcode.
#[derive(Debug)]
pub struct InstrDesc {
    /// Assembly mnemonic.
    pub name: &'static str,
    /// Issue class.
    pub iclass: IssueClass,
    /// Result latency when the consumer is interlocked.
    pub min_latency: u8,
    /// Worst-case result latency.
    pub max_latency: u8,
    /// Number of architectural delay slots following this instruction.
    pub delay_slots: u8,
    /// Width in bits of the immediate field, 0 if none.
    pub imm_bits: u8,
    /// Index of the result operand in the canonical operand order, or `!0`
    /// when the opcode produces no explicit result.
    pub result_pos: u8,
    /// `F_*` flags.
    pub flags: u16,
}

/// Marker for "no result operand".
pub const NO_RESULT: u8 = !0;

impl InstrDesc {
    /// Does this opcode read memory?
    pub fn is_load(&self) -> bool {
        self.flags & F_LOAD != 0
    }
    /// Does this opcode write memory?
    pub fn is_store(&self) -> bool {
        self.flags & F_STORE != 0
    }
    /// Is this a call?
    pub fn is_call(&self) -> bool {
        self.flags & F_CALL != 0
    }
    /// Is this a branch?
    pub fn is_branch(&self) -> bool {
        self.flags & F_BRANCH != 0
    }
    /// Does this opcode touch a condition-code register?
    pub fn is_cc_instr(&self) -> bool {
        self.flags & F_CC != 0
    }
    /// Must this opcode issue alone?
    pub fn is_single_issue(&self) -> bool {
        self.flags & F_SINGLE_ISSUE != 0
    }
    /// Does this opcode end its issue group?
    pub fn breaks_group(&self) -> bool {
        self.flags & F_BREAKS_GROUP != 0
    }
    /// Is this the no-op?
    pub fn is_nop(&self) -> bool {
        self.flags & F_NOP != 0
    }
    /// Is this a dummy instruction that never issues (phi placeholder)?
    pub fn is_pseudo(&self) -> bool {
        self.flags & F_PSEUDO != 0
    }

    /// The latency used for scheduling edges: consumers are interlocked on
    /// k64, so the minimum applies.
    pub fn latency(&self) -> u8 {
        self.min_latency
    }

    /// Bit mask of issue slots this opcode may occupy.
    ///
    /// Memory operations use the first slot, branches the last, everything
    /// else either.
    pub fn slot_mask(&self) -> u8 {
        match self.iclass {
            IssueClass::Mem => 0b01,
            IssueClass::Branch => 0b10,
            IssueClass::Pseudo => 0,
            _ => 0b11,
        }
    }

    /// Can a constant `c` be encoded in this opcode's immediate field?
    ///
    /// Immediate fields are sign-extended.
    pub fn fits_imm(&self, c: i64) -> bool {
        if self.imm_bits == 0 || self.imm_bits >= 64 {
            return self.imm_bits != 0;
        }
        let half = 1i64 << (self.imm_bits - 1);
        c >= -half && c < half
    }
}

macro_rules! mops {
    ( $( $op:ident = ($name:expr, $class:ident, $minl:expr, $maxl:expr,
                      $delay:expr, $imm:expr, $res:expr, $flags:expr); )* ) => {
        /// A k64 machine opcode.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[allow(missing_docs)]
        pub enum MOp {
            $( $op, )*
        }

        impl MOp {
            /// Number of opcodes.
            pub const COUNT: usize = 0 $( + { let _ = MOp::$op; 1 } )*;

            /// The static descriptor for this opcode.
            pub fn desc(self) -> &'static InstrDesc {
                match self {
                    $( MOp::$op => {
                        const D: InstrDesc = InstrDesc {
                            name: $name,
                            iclass: IssueClass::$class,
                            min_latency: $minl,
                            max_latency: $maxl,
                            delay_slots: $delay,
                            imm_bits: $imm,
                            result_pos: $res,
                            flags: $flags,
                        };
                        &D
                    } )*
                }
            }

            /// Dense index of this opcode, usable as a table key.
            pub fn index(self) -> usize {
                self as usize
            }
        }
    };
}

mops! {
    // Integer ALU.
    Add    = ("add",    Int, 1, 1, 0, 13, 2, 0);
    Sub    = ("sub",    Int, 1, 1, 0, 13, 2, 0);
    SubCc  = ("subcc",  Int, 1, 1, 0, 13, 2, F_CC);
    Mulx   = ("mulx",   Int, 3, 3, 0, 13, 2, 0);
    Sdivx  = ("sdivx",  Int, 8, 8, 0, 13, 2, F_SINGLE_ISSUE);
    Udivx  = ("udivx",  Int, 8, 8, 0, 13, 2, F_SINGLE_ISSUE);
    And    = ("and",    Int, 1, 1, 0, 13, 2, 0);
    Andn   = ("andn",   Int, 1, 1, 0, 13, 2, 0);
    Or     = ("or",     Int, 1, 1, 0, 13, 2, 0);
    Orn    = ("orn",    Int, 1, 1, 0, 13, 2, 0);
    Xor    = ("xor",    Int, 1, 1, 0, 13, 2, 0);
    Xnor   = ("xnor",   Int, 1, 1, 0, 13, 2, 0);
    Sll    = ("sll",    Int, 1, 1, 0, 6, 2, 0);
    Srl    = ("srl",    Int, 1, 1, 0, 6, 2, 0);
    Sra    = ("sra",    Int, 1, 1, 0, 6, 2, 0);
    Sllx   = ("sllx",   Int, 1, 1, 0, 6, 2, 0);
    Srlx   = ("srlx",   Int, 1, 1, 0, 6, 2, 0);
    Srax   = ("srax",   Int, 1, 1, 0, 6, 2, 0);
    SetHi  = ("sethi",  Int, 1, 1, 0, 22, 1, 0);

    // Conditional moves on the integer condition codes.
    MovE   = ("move",   Int, 1, 1, 0, 11, 2, F_CC);
    MovL   = ("movl",   Int, 1, 1, 0, 11, 2, F_CC);
    MovLe  = ("movle",  Int, 1, 1, 0, 11, 2, F_CC);
    MovG   = ("movg",   Int, 1, 1, 0, 11, 2, F_CC);
    MovGe  = ("movge",  Int, 1, 1, 0, 11, 2, F_CC);

    // Conditional moves on the float condition codes.
    MovFe  = ("movfe",  Int, 1, 1, 0, 11, 2, F_CC);
    MovFne = ("movfne", Int, 1, 1, 0, 11, 2, F_CC);
    MovFl  = ("movfl",  Int, 1, 1, 0, 11, 2, F_CC);
    MovFle = ("movfle", Int, 1, 1, 0, 11, 2, F_CC);
    MovFg  = ("movfg",  Int, 1, 1, 0, 11, 2, F_CC);
    MovFge = ("movfge", Int, 1, 1, 0, 11, 2, F_CC);

    // Loads. Result is available to an interlocked consumer after 2 cycles.
    Ldsb   = ("ldsb",   Mem, 2, 3, 0, 13, 2, F_LOAD);
    Ldub   = ("ldub",   Mem, 2, 3, 0, 13, 2, F_LOAD);
    Ldsh   = ("ldsh",   Mem, 2, 3, 0, 13, 2, F_LOAD);
    Lduh   = ("lduh",   Mem, 2, 3, 0, 13, 2, F_LOAD);
    Ldsw   = ("ldsw",   Mem, 2, 3, 0, 13, 2, F_LOAD);
    Lduw   = ("lduw",   Mem, 2, 3, 0, 13, 2, F_LOAD);
    Ldx    = ("ldx",    Mem, 2, 3, 0, 13, 2, F_LOAD);
    Ldf    = ("ldf",    Mem, 2, 3, 0, 13, 2, F_LOAD);
    Lddf   = ("lddf",   Mem, 2, 3, 0, 13, 2, F_LOAD);

    // Stores.
    Stb    = ("stb",    Mem, 1, 1, 0, 13, NO_RESULT, F_STORE);
    Sth    = ("sth",    Mem, 1, 1, 0, 13, NO_RESULT, F_STORE);
    Stw    = ("stw",    Mem, 1, 1, 0, 13, NO_RESULT, F_STORE);
    Stx    = ("stx",    Mem, 1, 1, 0, 13, NO_RESULT, F_STORE);
    Stf    = ("stf",    Mem, 1, 1, 0, 13, NO_RESULT, F_STORE);
    Stdf   = ("stdf",   Mem, 1, 1, 0, 13, NO_RESULT, F_STORE);

    // Branches on an integer register, one delay slot each.
    Brz    = ("brz",    Branch, 1, 1, 1, 16, NO_RESULT, F_BRANCH);
    Brnz   = ("brnz",   Branch, 1, 1, 1, 16, NO_RESULT, F_BRANCH);
    Brlz   = ("brlz",   Branch, 1, 1, 1, 16, NO_RESULT, F_BRANCH);
    Brlez  = ("brlez",  Branch, 1, 1, 1, 16, NO_RESULT, F_BRANCH);
    Brgz   = ("brgz",   Branch, 1, 1, 1, 16, NO_RESULT, F_BRANCH);
    Brgez  = ("brgez",  Branch, 1, 1, 1, 16, NO_RESULT, F_BRANCH);

    // Branches on the integer condition codes.
    Be     = ("be",     Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Bne    = ("bne",    Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Bl     = ("bl",     Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Ble    = ("ble",    Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Bg     = ("bg",     Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Bge    = ("bge",    Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Blu    = ("blu",    Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Bleu   = ("bleu",   Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Bgu    = ("bgu",    Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Bgeu   = ("bgeu",   Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);

    // Branches on a float condition-code register.
    Fbe    = ("fbe",    Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Fbne   = ("fbne",   Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Fbl    = ("fbl",    Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Fble   = ("fble",   Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Fbg    = ("fbg",    Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);
    Fbge   = ("fbge",   Branch, 1, 1, 1, 19, NO_RESULT, F_BRANCH | F_CC);

    // Unconditional control transfer.
    Ba     = ("ba",     Branch, 1, 1, 1, 22, NO_RESULT, F_BRANCH);
    Call   = ("call",   Branch, 1, 1, 1, 30, NO_RESULT, F_BRANCH | F_CALL);
    Jmpl   = ("jmpl",   Branch, 1, 1, 1, 13, 2, F_BRANCH | F_CALL | F_BREAKS_GROUP);
    RetJ   = ("retj",   Branch, 1, 1, 1, 13, NO_RESULT, F_BRANCH | F_BREAKS_GROUP);

    Nop    = ("nop",    Int, 1, 1, 0, 0, NO_RESULT, F_NOP);

    // Floating point.
    FaddS  = ("fadds",  Fp, 3, 3, 0, 0, 2, 0);
    FaddD  = ("faddd",  Fp, 3, 3, 0, 0, 2, 0);
    FsubS  = ("fsubs",  Fp, 3, 3, 0, 0, 2, 0);
    FsubD  = ("fsubd",  Fp, 3, 3, 0, 0, 2, 0);
    FmulS  = ("fmuls",  Fp, 3, 3, 0, 0, 2, 0);
    FmulD  = ("fmuld",  Fp, 3, 3, 0, 0, 2, 0);
    FsmulD = ("fsmuld", Fp, 3, 3, 0, 0, 2, 0);
    FdivS  = ("fdivs",  Fp, 12, 12, 0, 0, 2, 0);
    FdivD  = ("fdivd",  Fp, 15, 15, 0, 0, 2, 0);
    FnegS  = ("fnegs",  Fp, 1, 1, 0, 0, 1, 0);
    FnegD  = ("fnegd",  Fp, 1, 1, 0, 0, 1, 0);
    FmovS  = ("fmovs",  Fp, 1, 1, 0, 0, 1, 0);
    FmovD  = ("fmovd",  Fp, 1, 1, 0, 0, 1, 0);
    FcmpS  = ("fcmps",  Fp, 1, 1, 0, 0, NO_RESULT, F_CC);
    FcmpD  = ("fcmpd",  Fp, 1, 1, 0, 0, NO_RESULT, F_CC);

    // FP <-> int conversions. The int side goes through memory.
    FstoI  = ("fstoi",  Fp, 3, 3, 0, 0, 1, 0);
    FdtoI  = ("fdtoi",  Fp, 3, 3, 0, 0, 1, 0);
    FstoX  = ("fstox",  Fp, 3, 3, 0, 0, 1, 0);
    FdtoX  = ("fdtox",  Fp, 3, 3, 0, 0, 1, 0);
    FitoS  = ("fitos",  Fp, 3, 3, 0, 0, 1, 0);
    FitoD  = ("fitod",  Fp, 3, 3, 0, 0, 1, 0);
    FxtoS  = ("fxtos",  Fp, 3, 3, 0, 0, 1, 0);
    FxtoD  = ("fxtod",  Fp, 3, 3, 0, 0, 1, 0);
    FstoD  = ("fstod",  Fp, 3, 3, 0, 0, 1, 0);
    FdtoS  = ("fdtos",  Fp, 3, 3, 0, 0, 1, 0);

    // Dummy phi marker; carries def/use information only and never issues.
    Phi    = ("phi",    Pseudo, 0, 0, 0, 0, 0, F_PSEUDO);
}

impl fmt::Display for MOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.desc().name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_flags() {
        assert!(MOp::Ldx.desc().is_load());
        assert!(!MOp::Ldx.desc().is_store());
        assert!(MOp::Stx.desc().is_store());
        assert!(MOp::Call.desc().is_call());
        assert!(MOp::Call.desc().is_branch());
        assert!(MOp::SubCc.desc().is_cc_instr());
        assert!(MOp::Sdivx.desc().is_single_issue());
        assert!(MOp::Nop.desc().is_nop());
        assert!(MOp::Phi.desc().is_pseudo());
        assert_eq!(MOp::Ba.desc().delay_slots, 1);
        assert_eq!(MOp::Add.desc().delay_slots, 0);
    }

    #[test]
    fn immediate_fits() {
        let d = MOp::Add.desc();
        assert!(d.fits_imm(0));
        assert!(d.fits_imm(4095));
        assert!(d.fits_imm(-4096));
        assert!(!d.fits_imm(4096));
        assert!(!d.fits_imm(-4097));
        assert!(!MOp::FaddS.desc().fits_imm(0));
    }

    #[test]
    fn slot_masks() {
        assert_eq!(MOp::Ldx.desc().slot_mask(), 0b01);
        assert_eq!(MOp::Ba.desc().slot_mask(), 0b10);
        assert_eq!(MOp::Add.desc().slot_mask(), 0b11);
    }
}
