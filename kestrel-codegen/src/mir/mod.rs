//! Target-level machine IR.
//!
//! Machine instructions are mutable objects: the scheduler reorders them and
//! the register allocator patches operands and inserts save/restore and spill
//! code around them. They live in a per-function arena and are referred to by
//! [`MachInst`] indexes; the per-block code is an ordered list of such
//! indexes, and each IR instruction keeps the list of MIs generated for it
//! together with the back-end temporaries those MIs introduced.

use crate::fx::FxHashMap;
use crate::ir::{Block, FuncRef, Inst, Value};
use crate::isa::{MOp, RegNum, INVALID_REG};
use kestrel_entity::{entity_impl, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;
use core::fmt;

/// An opaque reference to a machine instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachInst(u32);
entity_impl!(MachInst, "mi");

/// Target of a PC-relative displacement operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disp {
    /// A basic block label.
    Block(Block),
    /// A function symbol.
    Func(FuncRef),
    /// A global symbol.
    Global(crate::ir::GlobalRef),
    /// A raw displacement.
    Imm(i64),
}

/// The payload of a machine operand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OperandKind {
    /// A virtual register holding an IR value of integer, pointer, or float
    /// register class.
    VReg(Value),
    /// A condition-code register holding an IR value of a CC class.
    CcReg(Value),
    /// A hardwired physical register.
    MReg(RegNum),
    /// A sign-extended immediate.
    SImm(i64),
    /// An unextended immediate.
    UImm(u64),
    /// A PC-relative displacement.
    PcRel(Disp),
}

/// One machine operand with its def/use role.
#[derive(Clone, Copy, Debug)]
pub struct MOperand {
    /// The operand payload.
    pub kind: OperandKind,
    /// True if the instruction writes this operand.
    pub is_def: bool,
    /// True if the instruction both reads and writes this operand
    /// (conditional moves keep the old value on a false condition).
    pub is_def_and_use: bool,
    /// The physical register assigned by allocation; `INVALID_REG` before.
    pub assigned: RegNum,
}

impl MOperand {
    fn new(kind: OperandKind, is_def: bool) -> Self {
        Self {
            kind,
            is_def,
            is_def_and_use: false,
            assigned: INVALID_REG,
        }
    }

    /// The IR value behind a vreg or CC-reg operand.
    pub fn value(&self) -> Option<Value> {
        match self.kind {
            OperandKind::VReg(v) | OperandKind::CcReg(v) => Some(v),
            _ => None,
        }
    }
}

/// An implicit reference: a value read or written by the instruction without
/// occupying an encoded operand slot (call arguments, return values).
#[derive(Clone, Copy, Debug)]
pub struct ImplicitRef {
    /// The referenced value.
    pub value: Value,
    /// True if the instruction writes the value.
    pub is_def: bool,
    /// True if the instruction both reads and writes the value.
    pub is_def_and_use: bool,
}

/// Where one call argument is passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgPlace {
    /// In the integer argument register with this colour.
    IntReg(usize),
    /// In the float argument register with this colour.
    FloatReg(usize),
    /// On the stack.
    Stack,
    /// In both a float and an integer register (unprototyped varargs).
    FloatAndIntReg {
        /// Float register colour.
        fp: usize,
        /// Integer register colour.
        int: usize,
    },
}

/// Per-argument record in a call-args descriptor.
#[derive(Clone, Debug)]
pub struct ArgInfo {
    /// Where the argument is passed.
    pub place: ArgPlace,
    /// The integer-register copy of a float argument, when one was made.
    pub arg_copy: Option<Value>,
}

/// Annotation attached to call MIs describing argument placement for the
/// register allocator.
#[derive(Clone, Debug)]
pub struct CallArgsDescriptor {
    /// One record per call argument, in order.
    pub args: Vec<ArgInfo>,
    /// The temporary holding the return address.
    pub ret_addr: Value,
    /// The call's return value, if the callee produces one.
    pub ret_val: Option<Value>,
    /// Whether the callee is variadic.
    pub is_varargs: bool,
    /// Variadic with no prototype: FP args are passed in both register
    /// files.
    pub no_prototype: bool,
}

/// One machine instruction.
#[derive(Clone, Debug)]
pub struct MachInstData {
    /// The opcode.
    pub op: MOp,
    /// Ordered operand vector.
    pub operands: SmallVec<[MOperand; 4]>,
    /// Ordered implicit references.
    pub implicit: SmallVec<[ImplicitRef; 2]>,
    /// Call-argument annotation; only on call MIs.
    pub call_desc: Option<Box<CallArgsDescriptor>>,
}

impl MachInstData {
    /// Create an instruction with no operands yet.
    pub fn new(op: MOp) -> Self {
        Self {
            op,
            operands: SmallVec::new(),
            implicit: SmallVec::new(),
            call_desc: None,
        }
    }

    /// Append a virtual-register use.
    pub fn vreg_use(mut self, v: Value) -> Self {
        self.operands.push(MOperand::new(OperandKind::VReg(v), false));
        self
    }

    /// Append a virtual-register def.
    pub fn vreg_def(mut self, v: Value) -> Self {
        self.operands.push(MOperand::new(OperandKind::VReg(v), true));
        self
    }

    /// Append a virtual-register def that also reads its previous value.
    pub fn vreg_def_use(mut self, v: Value) -> Self {
        let mut op = MOperand::new(OperandKind::VReg(v), true);
        op.is_def_and_use = true;
        self.operands.push(op);
        self
    }

    /// Append a condition-code register operand.
    pub fn cc(mut self, v: Value, is_def: bool) -> Self {
        self.operands.push(MOperand::new(OperandKind::CcReg(v), is_def));
        self
    }

    /// Append a hardwired machine-register operand.
    pub fn mreg(mut self, r: RegNum, is_def: bool) -> Self {
        self.operands.push(MOperand::new(OperandKind::MReg(r), is_def));
        self
    }

    /// Append a sign-extended immediate.
    pub fn simm(mut self, c: i64) -> Self {
        self.operands.push(MOperand::new(OperandKind::SImm(c), false));
        self
    }

    /// Append an unextended immediate.
    pub fn uimm(mut self, c: u64) -> Self {
        self.operands.push(MOperand::new(OperandKind::UImm(c), false));
        self
    }

    /// Append a PC-relative displacement.
    pub fn pcrel(mut self, d: Disp) -> Self {
        self.operands.push(MOperand::new(OperandKind::PcRel(d), false));
        self
    }

    /// Append an implicit reference.
    pub fn add_implicit_ref(&mut self, value: Value, is_def: bool) {
        self.implicit.push(ImplicitRef {
            value,
            is_def,
            is_def_and_use: false,
        });
    }

    /// Visit every operand that names an IR value, with its def flag.
    pub fn for_each_value_operand(&self, mut f: impl FnMut(usize, Value, bool)) {
        for (i, op) in self.operands.iter().enumerate() {
            if let Some(v) = op.value() {
                f(i, v, op.is_def);
            }
        }
    }

    /// Substitute `to` for `from` in every operand and implicit ref.
    /// Returns the number of substitutions.
    pub fn substitute_value(&mut self, from: Value, to: Value) -> usize {
        let mut n = 0;
        for op in &mut self.operands {
            match &mut op.kind {
                OperandKind::VReg(v) | OperandKind::CcReg(v) if *v == from => {
                    *v = to;
                    n += 1;
                }
                _ => {}
            }
        }
        for ir in &mut self.implicit {
            if ir.value == from {
                ir.value = to;
                n += 1;
            }
        }
        n
    }

    /// The defining operand positions of this instruction.
    pub fn def_positions(&self) -> SmallVec<[usize; 2]> {
        self.operands
            .iter()
            .enumerate()
            .filter(|(_, op)| op.is_def && op.value().is_some())
            .map(|(i, _)| i)
            .collect()
    }
}

/// The machine code generated for one IR instruction: the MI sequence plus
/// the back-end temporaries created for it. Temporaries are owned by this
/// record and die with it.
#[derive(Clone, Default)]
pub struct InstCode {
    /// The ordered MI sequence.
    pub mis: Vec<MachInst>,
    /// Temporaries whose lifetime is tied to this record.
    pub temps: Vec<Value>,
}

/// Stack-frame bookkeeping for one function.
///
/// Locals and spill slots are allocated at negative offsets from the frame
/// pointer, growing down. Scratch slots used to shuffle values between the
/// register files live in a small region addressed from the stack pointer
/// and are recycled per machine instruction.
#[derive(Clone, Default)]
pub struct FrameLayout {
    local_size: u32,
    tmp_pos: u32,
    max_tmp_size: u32,
}

/// Offset from SP of the first scratch slot.
const TMP_AREA_BASE: i32 = 176;

impl FrameLayout {
    /// Allocate a local of `size` bytes with `align` alignment. Returns the
    /// offset from the frame pointer (negative).
    pub fn allocate_local(&mut self, size: u64, align: u64) -> i32 {
        let align = align.max(1) as u32;
        let size = size.max(1) as u32;
        self.local_size = (self.local_size + size + align - 1) / align * align;
        -(self.local_size as i32)
    }

    /// Allocate an 8-byte spill slot. Offset 0 is valid only for the first
    /// slot of an empty frame; spill offsets are otherwise negative.
    pub fn new_spill_slot(&mut self) -> i32 {
        self.allocate_local(8, 8)
    }

    /// Reset the scratch-slot cursor. Called before processing each machine
    /// instruction that may need scratch slots.
    pub fn reset_tmp_pos(&mut self) {
        self.tmp_pos = 0;
    }

    /// Claim a fresh 8-byte scratch slot; returns its offset from SP.
    pub fn new_tmp_offset(&mut self) -> i32 {
        let off = TMP_AREA_BASE + self.tmp_pos as i32;
        self.tmp_pos += 8;
        self.max_tmp_size = self.max_tmp_size.max(self.tmp_pos);
        off
    }

    /// Total bytes of locals and spills.
    pub fn local_area_size(&self) -> u32 {
        self.local_size
    }

    /// High-water mark of the scratch region.
    pub fn tmp_area_size(&self) -> u32 {
        self.max_tmp_size
    }
}

/// The machine code of one function.
pub struct MirFunction {
    insts: PrimaryMap<MachInst, MachInstData>,
    /// Ordered machine code per basic block.
    pub block_code: SecondaryMap<Block, Vec<MachInst>>,
    /// Machine code per IR instruction.
    pub inst_code: SecondaryMap<Inst, InstCode>,
    /// The stack frame.
    pub frame: FrameLayout,
    /// Back-end temporaries bound to a fixed physical register (return
    /// address temporaries). These get no live range; allocation writes the
    /// pinned register straight into their operands.
    pub pinned_regs: FxHashMap<Value, RegNum>,
}

impl MirFunction {
    /// Create an empty machine function.
    pub fn new() -> Self {
        Self {
            insts: PrimaryMap::new(),
            block_code: SecondaryMap::new(),
            inst_code: SecondaryMap::new(),
            frame: FrameLayout::default(),
            pinned_regs: FxHashMap::default(),
        }
    }

    /// Intern a machine instruction.
    pub fn create(&mut self, data: MachInstData) -> MachInst {
        self.insts.push(data)
    }

    /// The body of `mi`.
    pub fn mi(&self, mi: MachInst) -> &MachInstData {
        &self.insts[mi]
    }

    /// The mutable body of `mi`.
    pub fn mi_mut(&mut self, mi: MachInst) -> &mut MachInstData {
        &mut self.insts[mi]
    }

    /// The opcode of `mi`.
    pub fn op(&self, mi: MachInst) -> MOp {
        self.insts[mi].op
    }

    /// Number of machine instructions created.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Append `mi` to the machine code of `block`.
    pub fn append_to_block(&mut self, block: Block, mi: MachInst) {
        self.block_code[block].push(mi);
    }

    /// Display one MI.
    pub fn display(&self, mi: MachInst) -> DisplayMi {
        DisplayMi { mir: self, mi }
    }
}

impl Default for MirFunction {
    fn default() -> Self {
        Self::new()
    }
}

/// Displays a machine instruction with its operands.
pub struct DisplayMi<'a> {
    mir: &'a MirFunction,
    mi: MachInst,
}

impl fmt::Display for DisplayMi<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let data = self.mir.mi(self.mi);
        write!(f, "{}", data.op)?;
        for (i, op) in data.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match op.kind {
                OperandKind::VReg(v) if op.assigned != INVALID_REG => {
                    write!(f, "{}%{}({})", sep, op.assigned, v)?
                }
                OperandKind::VReg(v) => write!(f, "{}{}", sep, v)?,
                OperandKind::CcReg(v) => write!(f, "{}cc:{}", sep, v)?,
                OperandKind::MReg(r) => write!(f, "{}%r{}", sep, r)?,
                OperandKind::SImm(c) => write!(f, "{}{}", sep, c)?,
                OperandKind::UImm(c) => write!(f, "{}{}", sep, c)?,
                OperandKind::PcRel(Disp::Block(b)) => write!(f, "{}{}", sep, b)?,
                OperandKind::PcRel(Disp::Func(func)) => write!(f, "{}{}", sep, func)?,
                OperandKind::PcRel(Disp::Global(g)) => write!(f, "{}{}", sep, g)?,
                OperandKind::PcRel(Disp::Imm(c)) => write!(f, "{}pc{:+}", sep, c)?,
            }
            if op.is_def {
                write!(f, "!")?;
            }
        }
        if !data.implicit.is_empty() {
            write!(f, " [implicit")?;
            for ir in &data.implicit {
                write!(f, " {}{}", ir.value, if ir.is_def { "!" } else { "" })?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataFlowGraph, Type};

    #[test]
    fn build_and_display() {
        let mut dfg = DataFlowGraph::new();
        let a = dfg.iconst(Type::I32, 1);
        let b = dfg.iconst(Type::I32, 2);
        let mut mir = MirFunction::new();
        let mi = mir.create(
            MachInstData::new(MOp::Add)
                .vreg_use(a)
                .simm(5)
                .vreg_def(b),
        );
        assert_eq!(mir.op(mi), MOp::Add);
        let mut defs = Vec::new();
        mir.mi(mi).for_each_value_operand(|i, v, d| defs.push((i, v, d)));
        assert_eq!(defs, vec![(0, a, false), (2, b, true)]);
        let s = format!("{}", mir.display(mi));
        assert!(s.starts_with("add "), "{}", s);
        assert!(s.ends_with('!'), "{}", s);
    }

    #[test]
    fn frame_offsets() {
        let mut frame = FrameLayout::default();
        let o1 = frame.allocate_local(4, 4);
        let o2 = frame.allocate_local(8, 8);
        assert_eq!(o1, -4);
        assert_eq!(o2, -16);
        frame.reset_tmp_pos();
        let t1 = frame.new_tmp_offset();
        let t2 = frame.new_tmp_offset();
        assert_eq!(t2 - t1, 8);
        frame.reset_tmp_pos();
        assert_eq!(frame.new_tmp_offset(), t1);
        assert_eq!(frame.tmp_area_size(), 16);
    }

    #[test]
    fn substitute() {
        let mut dfg = DataFlowGraph::new();
        let a = dfg.iconst(Type::I64, 1);
        let b = dfg.iconst(Type::I64, 2);
        let mut data = MachInstData::new(MOp::Sub).vreg_use(a).vreg_use(a).vreg_def(b);
        data.add_implicit_ref(a, false);
        assert_eq!(data.substitute_value(a, b), 3);
    }
}
