//! Instruction selection: forest construction, tree-pattern matching, and
//! machine-code production.
//!
//! Selection runs per function. The forest partitions the basic blocks into
//! single-use-chain trees, the matcher labels every node with a state, and
//! the lowering pass walks each tree root and emits the machine code for its
//! instructions. The per-block machine code is then assembled from the
//! per-instruction sequences in program order.

pub mod burs;
pub mod forest;
pub mod lower;

pub use self::burs::{Matcher, Nt, Rule};
pub use self::forest::{InstrForest, OpLabel, TreeNode, TreeNodeKind};
pub use self::lower::{CalleeInfo, Lowering};

use crate::fx::FxHashMap;
use crate::ir::{FuncRef, Function, TypePool};
use crate::isa::TargetIsa;
use crate::mir::MirFunction;
use crate::result::CodegenResult;
use log::debug;

/// Select machine instructions for `func`.
///
/// `callee_info` summarises the signatures of the module's functions so call
/// lowering can classify variadic callees without holding the whole module.
pub fn select_function(
    isa: &TargetIsa,
    pool: &mut TypePool,
    func: &mut Function,
    callee_info: &FxHashMap<FuncRef, CalleeInfo>,
) -> CodegenResult<MirFunction> {
    debug!("selecting instructions for {}", func.name);

    let mut forest = InstrForest::build(func, pool);
    let matcher = Matcher::label(&mut forest, func);
    let mut mir = MirFunction::new();

    {
        let mut lowering = Lowering::new(isa, pool, func, &mut mir, &matcher, callee_info);
        let roots: Vec<TreeNode> = forest.roots().to_vec();
        for root in roots {
            lowering.select_for_tree(&mut forest, root, Nt::Stmt)?;
        }
    }

    // Assemble the per-block machine code from the per-instruction
    // sequences, in program order. Phis come first in well-formed input, so
    // their dummy instructions lead the block.
    for &block in func.layout.blocks() {
        for &inst in func.layout.block_insts(block) {
            let mis = mir.inst_code[inst].mis.clone();
            for mi in mis {
                mir.append_to_block(block, mi);
            }
        }
    }

    Ok(mir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, InstructionData, Opcode, Signature, Type};
    use crate::isa::MOp;

    fn lower_simple(func: &mut Function) -> MirFunction {
        let isa = crate::isa::k64();
        let mut pool = TypePool::new();
        let callee_info = FxHashMap::default();
        select_function(&isa, &mut pool, func, &callee_info).expect("selection failed")
    }

    #[test]
    fn add_then_shift_from_mul_by_four() {
        // %r = add i32 %x, 1; %s = mul i32 %r, 4 -> add + sll, no mulx.
        let mut func = Function::new("f", Signature::new(vec![Type::I32], Type::I32));
        let x = func.args[0];
        let block = func.create_block();
        let one = func.dfg.iconst(Type::I32, 1);
        let (_, r) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [x, one],
            },
            Type::I32,
        );
        let four = func.dfg.iconst(Type::I32, 4);
        let (_, s) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Mul,
                args: [r.unwrap(), four],
            },
            Type::I32,
        );
        func.append_inst(block, InstructionData::Return { value: s }, Type::VOID);

        let mir = lower_simple(&mut func);
        let ops: Vec<MOp> = mir.block_code[block].iter().map(|&mi| mir.op(mi)).collect();
        assert!(ops.contains(&MOp::Add));
        assert!(ops.contains(&MOp::Sll));
        assert!(!ops.contains(&MOp::Mulx));
    }

    #[test]
    fn division_by_power_of_two_is_a_shift() {
        let mut func = Function::new("f", Signature::new(vec![Type::I32], Type::I32));
        let x = func.args[0];
        let block = func.create_block();
        let eight = func.dfg.iconst(Type::I32, 8);
        let (_, q) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Div,
                args: [x, eight],
            },
            Type::I32,
        );
        func.append_inst(block, InstructionData::Return { value: q }, Type::VOID);

        let mir = lower_simple(&mut func);
        let ops: Vec<MOp> = mir.block_code[block].iter().map(|&mi| mir.op(mi)).collect();
        assert!(ops.contains(&MOp::Sra), "signed divide by 8 -> sra: {:?}", ops);
        assert!(!ops.contains(&MOp::Sdivx));
    }

    #[test]
    fn and_with_not_fuses() {
        let mut func = Function::new(
            "f",
            Signature::new(vec![Type::U64, Type::U64], Type::U64),
        );
        let (x, y) = (func.args[0], func.args[1]);
        let block = func.create_block();
        let (_, ny) = func.append_inst(
            block,
            InstructionData::Unary {
                opcode: Opcode::Not,
                arg: y,
            },
            Type::U64,
        );
        let (_, r) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::And,
                args: [x, ny.unwrap()],
            },
            Type::U64,
        );
        func.append_inst(block, InstructionData::Return { value: r }, Type::VOID);

        let mir = lower_simple(&mut func);
        let ops: Vec<MOp> = mir.block_code[block].iter().map(|&mi| mir.op(mi)).collect();
        assert!(ops.contains(&MOp::Andn), "not folded into and-not: {:?}", ops);
        assert!(!ops.contains(&MOp::Xnor), "the not still emitted: {:?}", ops);
    }

    #[test]
    fn multi_use_setcc_materialises_boolean() {
        // The comparison result is returned, so it cannot live only in the
        // condition codes: subtract-cc, clear, conditional move.
        let mut func = Function::new("f", Signature::new(vec![Type::I64], Type::BOOL));
        let x = func.args[0];
        let block = func.create_block();
        let ten = func.dfg.iconst(Type::I64, 10);
        let (_, c) = func.append_inst(
            block,
            InstructionData::SetCmp {
                cond: crate::ir::CondCode::Lt,
                args: [x, ten],
            },
            Type::BOOL,
        );
        func.append_inst(block, InstructionData::Return { value: c }, Type::VOID);

        let mir = lower_simple(&mut func);
        let ops: Vec<MOp> = mir.block_code[block].iter().map(|&mi| mir.op(mi)).collect();
        assert!(ops.contains(&MOp::SubCc));
        assert!(ops.contains(&MOp::SetHi), "no clear before the move: {:?}", ops);
        assert!(ops.contains(&MOp::MovL), "no conditional move: {:?}", ops);
    }

    #[test]
    fn unsigned_narrowing_cast_masks() {
        let mut func = Function::new("f", Signature::new(vec![Type::U64], Type::U8));
        let x = func.args[0];
        let block = func.create_block();
        let (cast, r) = func.append_inst(
            block,
            InstructionData::Unary {
                opcode: Opcode::Cast,
                arg: x,
            },
            Type::U8,
        );
        func.append_inst(block, InstructionData::Return { value: r }, Type::VOID);

        let mir = lower_simple(&mut func);
        let ops: Vec<MOp> = mir.inst_code[cast].mis.iter().map(|&mi| mir.op(mi)).collect();
        assert_eq!(ops, vec![MOp::And], "narrowing to u8 is one and-mask");
    }

    #[test]
    fn fixed_alloca_is_frame_pointer_add() {
        let mut module = crate::ir::Module::new();
        let i64ptr = module.types.ptr_to(Type::I64);
        let mut func = Function::new("f", Signature::new(vec![], i64ptr));
        let block = func.create_block();
        let (alloca, p) = func.append_inst(
            block,
            InstructionData::Alloca { count: None },
            i64ptr,
        );
        func.append_inst(block, InstructionData::Return { value: p }, Type::VOID);

        let isa = crate::isa::k64();
        let callee_info = FxHashMap::default();
        let mir =
            select_function(&isa, &mut module.types, &mut func, &callee_info).unwrap();
        let ops: Vec<MOp> = mir.inst_code[alloca].mis.iter().map(|&mi| mir.op(mi)).collect();
        assert_eq!(ops, vec![MOp::Add]);
        // The frame gained a local for the allocation.
        assert!(mir.frame.local_area_size() >= 8);
    }

    #[test]
    fn fp_add_of_zero_becomes_move() {
        let mut func = Function::new("f", Signature::new(vec![Type::F64], Type::F64));
        let x = func.args[0];
        let block = func.create_block();
        let zero = func.dfg.fconst(Type::F64, 0.0);
        let (add, r) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [x, zero],
            },
            Type::F64,
        );
        func.append_inst(block, InstructionData::Return { value: r }, Type::VOID);

        let mir = lower_simple(&mut func);
        let ops: Vec<MOp> = mir.inst_code[add].mis.iter().map(|&mi| mir.op(mi)).collect();
        assert_eq!(ops, vec![MOp::FmovD]);
    }

    #[test]
    fn large_constant_uses_four_instruction_expansion() {
        // A 64-bit constant with a small low word: set-high, or, shift, or.
        let mut func = Function::new("f", Signature::new(vec![Type::I64], Type::I64));
        let x = func.args[0];
        let block = func.create_block();
        let big = func.dfg.iconst(Type::I64, 0x0123_4567_0000_0042);
        let (mul, r) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Mul,
                args: [x, big],
            },
            Type::I64,
        );
        func.append_inst(block, InstructionData::Return { value: r }, Type::VOID);

        let mir = lower_simple(&mut func);
        let ops: Vec<MOp> = mir.inst_code[mul].mis.iter().map(|&mi| mir.op(mi)).collect();
        // Not a power of two, so the constant is materialised for a real
        // multiply: sethi, or, sllx, or, mulx.
        assert_eq!(
            ops,
            vec![MOp::SetHi, MOp::Or, MOp::Sllx, MOp::Or, MOp::Mulx],
            "unexpected expansion {:?}",
            ops
        );
    }

    #[test]
    fn remainder_expands_to_three_instructions() {
        let mut func = Function::new(
            "f",
            Signature::new(vec![Type::I64, Type::I64], Type::I64),
        );
        let (x, y) = (func.args[0], func.args[1]);
        let block = func.create_block();
        let (rem, r) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Rem,
                args: [x, y],
            },
            Type::I64,
        );
        func.append_inst(block, InstructionData::Return { value: r }, Type::VOID);

        let mir = lower_simple(&mut func);
        let ops: Vec<MOp> = mir.inst_code[rem].mis.iter().map(|&mi| mir.op(mi)).collect();
        assert_eq!(ops, vec![MOp::Sdivx, MOp::Mulx, MOp::Sub]);
        assert_eq!(mir.inst_code[rem].temps.len(), 2);
    }
}
