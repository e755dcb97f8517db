//! The data-flow graph: values, their definitions, and their uses.
//!
//! The `DataFlowGraph` owns every SSA value of a function and every
//! instruction body. A value knows its type, how it came into existence, and
//! the exact set of places it is used. Use records are maintained by the
//! attach/detach methods here, so a use is reachable from the used value's
//! use list exactly once and is never dangling.

use crate::ir::entities::{Block, FuncRef, GlobalRef, Inst, Value};
use crate::ir::instructions::{InstructionData, Opcode};
use crate::ir::types::Type;
use kestrel_entity::PrimaryMap;
use smallvec::SmallVec;

/// How a value came into existence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueDef {
    /// The result of an instruction.
    Inst(Inst),
    /// The `index`th argument of the function.
    Arg(u32),
    /// An integer (or boolean, or pointer-null) constant; the payload is the
    /// sign-extended bit pattern.
    ConstInt(i64),
    /// A floating-point constant.
    ConstFloat(f64),
    /// The address of a global symbol.
    Global(GlobalRef),
    /// The address of a function.
    FuncAddr(FuncRef),
    /// A basic block used as a branch target or data label.
    BlockAddr(Block),
    /// A temporary created by the back-end, owned by the machine code record
    /// of `origin`.
    Temp(Inst),
}

/// A single use of a value: operand `index` of `inst`.
///
/// Implicit machine-level uses are not recorded here; this tracks IR operand
/// slots only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UseSite {
    /// The using instruction.
    pub inst: Inst,
    /// The operand index within the instruction's flattened operand order.
    pub index: u16,
}

/// Everything the graph knows about one value.
#[derive(Clone, Debug)]
pub struct ValueData {
    /// The value's type.
    pub ty: Type,
    /// How the value is defined.
    pub def: ValueDef,
    /// All use sites, unordered.
    uses: SmallVec<[UseSite; 4]>,
}

/// The data-flow graph of a function.
#[derive(Clone, Default)]
pub struct DataFlowGraph {
    values: PrimaryMap<Value, ValueData>,
    insts: PrimaryMap<Inst, InstNode>,
}

#[derive(Clone)]
struct InstNode {
    data: InstructionData,
    /// The value holding this instruction's result, if it produces one.
    result: Option<Value>,
    /// The block the instruction is attached to.
    block: Option<Block>,
}

impl DataFlowGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of values created.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Number of instructions created.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Iterate over all values.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.keys()
    }

    /// The type of `value`.
    pub fn value_type(&self, value: Value) -> Type {
        self.values[value].ty
    }

    /// The definition of `value`.
    pub fn value_def(&self, value: Value) -> ValueDef {
        self.values[value].def
    }

    /// The unordered use sites of `value`.
    pub fn uses(&self, value: Value) -> &[UseSite] {
        &self.values[value].uses
    }

    /// Number of uses of `value`.
    pub fn num_uses(&self, value: Value) -> usize {
        self.values[value].uses.len()
    }

    /// Create a value with the given type and definition.
    pub fn make_value(&mut self, ty: Type, def: ValueDef) -> Value {
        self.values.push(ValueData {
            ty,
            def,
            uses: SmallVec::new(),
        })
    }

    /// Create an integer constant of type `ty`.
    pub fn iconst(&mut self, ty: Type, bits: i64) -> Value {
        self.make_value(ty, ValueDef::ConstInt(bits))
    }

    /// Create a floating-point constant of type `ty`.
    pub fn fconst(&mut self, ty: Type, v: f64) -> Value {
        self.make_value(ty, ValueDef::ConstFloat(v))
    }

    /// Is `value` a constant?
    pub fn is_const(&self, value: Value) -> bool {
        matches!(
            self.value_def(value),
            ValueDef::ConstInt(_) | ValueDef::ConstFloat(_)
        )
    }

    /// The constant integer payload of `value`, if it is one.
    pub fn const_int(&self, value: Value) -> Option<i64> {
        match self.value_def(value) {
            ValueDef::ConstInt(c) => Some(c),
            _ => None,
        }
    }

    /// The constant float payload of `value`, if it is one.
    pub fn const_float(&self, value: Value) -> Option<f64> {
        match self.value_def(value) {
            ValueDef::ConstFloat(c) => Some(c),
            _ => None,
        }
    }

    /// Create an instruction from `data`, producing a result value of type
    /// `ty` unless `ty` is void. Links a use record for every value operand.
    pub fn make_inst(&mut self, data: InstructionData, ty: Type) -> Inst {
        let inst = self.insts.push(InstNode {
            data,
            result: None,
            block: None,
        });
        if ty != Type::VOID {
            let result = self.make_value(ty, ValueDef::Inst(inst));
            self.insts[inst].result = Some(result);
        }
        self.attach_uses(inst);
        inst
    }

    fn attach_uses(&mut self, inst: Inst) {
        let args = self.insts[inst].data.args();
        for (index, &arg) in args.iter().enumerate() {
            self.values[arg].uses.push(UseSite {
                inst,
                index: index as u16,
            });
        }
    }

    fn detach_uses(&mut self, inst: Inst) {
        let args = self.insts[inst].data.args();
        for &arg in &args {
            self.values[arg].uses.retain(|u| u.inst != inst);
        }
    }

    /// The instruction body.
    pub fn inst(&self, inst: Inst) -> &InstructionData {
        &self.insts[inst].data
    }

    /// The opcode of `inst`.
    pub fn opcode(&self, inst: Inst) -> Opcode {
        self.insts[inst].data.opcode()
    }

    /// The result value of `inst`, if it produces one.
    pub fn inst_result(&self, inst: Inst) -> Option<Value> {
        self.insts[inst].result
    }

    /// The block `inst` is attached to.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.insts[inst].block
    }

    /// Record the attachment of `inst` to `block`. Called by the layout.
    pub(crate) fn set_inst_block(&mut self, inst: Inst, block: Block) {
        debug_assert!(
            self.insts[inst].block.is_none(),
            "{} already attached",
            inst
        );
        self.insts[inst].block = Some(block);
    }

    /// Replace every use of `from` with `to`, rewriting operand vectors and
    /// moving the use records.
    pub fn replace_uses(&mut self, from: Value, to: Value) {
        debug_assert_ne!(from, to);
        let sites = std::mem::take(&mut self.values[from].uses);
        for site in &sites {
            self.insts[site.inst].data.replace_arg(from, to);
        }
        self.values[to].uses.extend(sites);
    }

    /// Rewrite the operands of `inst` in place through `rewrite`, keeping the
    /// use records consistent.
    pub fn map_inst_args(&mut self, inst: Inst, rewrite: impl Fn(Value) -> Value) {
        self.detach_uses(inst);
        let old = self.insts[inst].data.args();
        for v in old {
            let nv = rewrite(v);
            if nv != v {
                self.insts[inst].data.replace_arg(v, nv);
            }
        }
        self.attach_uses(inst);
    }

    /// The ordered successor blocks of `inst` if it is a terminator.
    pub fn successors(&self, inst: Inst) -> SmallVec<[Block; 2]> {
        self.insts[inst].data.successors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instructions::InstructionData;

    #[test]
    fn uses_track_operands() {
        let mut dfg = DataFlowGraph::new();
        let a = dfg.iconst(Type::I32, 1);
        let b = dfg.iconst(Type::I32, 2);
        let add = dfg.make_inst(
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [a, b],
            },
            Type::I32,
        );
        let sum = dfg.inst_result(add).unwrap();
        assert_eq!(dfg.num_uses(a), 1);
        assert_eq!(dfg.num_uses(b), 1);
        assert_eq!(dfg.num_uses(sum), 0);

        let add2 = dfg.make_inst(
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [sum, sum],
            },
            Type::I32,
        );
        assert_eq!(dfg.num_uses(sum), 2);
        assert_eq!(dfg.uses(sum)[0].inst, add2);
    }

    #[test]
    fn replace_uses_moves_sites() {
        let mut dfg = DataFlowGraph::new();
        let a = dfg.iconst(Type::I32, 1);
        let b = dfg.iconst(Type::I32, 2);
        let c = dfg.iconst(Type::I32, 3);
        dfg.make_inst(
            InstructionData::Binary {
                opcode: Opcode::Mul,
                args: [a, a],
            },
            Type::I32,
        );
        dfg.make_inst(
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [a, b],
            },
            Type::I32,
        );
        assert_eq!(dfg.num_uses(a), 3);
        dfg.replace_uses(a, c);
        assert_eq!(dfg.num_uses(a), 0);
        assert_eq!(dfg.num_uses(c), 3);
    }
}
