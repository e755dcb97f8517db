//! Checks of the quantified scheduling properties and the idempotence law.

use kestrel_codegen::flowgraph::ControlFlowGraph;
use kestrel_codegen::ir::{
    Block, Function, InstructionData, Module, Opcode, Signature, Type,
};
use kestrel_codegen::isa::{self, MOp};
use kestrel_codegen::liveness::LiveVarInfo;
use kestrel_codegen::mir::MirFunction;
use kestrel_codegen::sched::schedule_block;
use kestrel_codegen::select::select_function;
use rustc_hash::FxHashMap;

fn build_straight_line() -> (Module, kestrel_codegen::ir::FuncRef, Block) {
    let mut module = Module::new();
    let mut func = Function::new(
        "t",
        Signature::new(vec![Type::I64, Type::I64], Type::I64),
    );
    let (a, b) = (func.args[0], func.args[1]);
    let block = func.create_block();
    let (_, s) = func.append_inst(
        block,
        InstructionData::Binary {
            opcode: Opcode::Add,
            args: [a, b],
        },
        Type::I64,
    );
    let (_, p) = func.append_inst(
        block,
        InstructionData::Binary {
            opcode: Opcode::Mul,
            args: [s.unwrap(), b],
        },
        Type::I64,
    );
    let (_, q) = func.append_inst(
        block,
        InstructionData::Binary {
            opcode: Opcode::Sub,
            args: [p.unwrap(), a],
        },
        Type::I64,
    );
    func.append_inst(block, InstructionData::Return { value: q }, Type::VOID);
    let fr = module.add_function(func);
    (module, fr, block)
}

fn select_only(module: &mut Module, fr: kestrel_codegen::ir::FuncRef) -> MirFunction {
    let isa = isa::k64();
    let Module { types, funcs, .. } = module;
    select_function(&isa, types, &mut funcs[fr], &FxHashMap::default())
        .expect("selection failed")
}

#[test]
fn issue_width_and_edge_delays_hold() {
    let (mut module, fr, block) = build_straight_line();
    let mut mir = select_only(&mut module, fr);
    let isa = isa::k64();
    let func = &module.funcs[fr];

    let cfg = ControlFlowGraph::compute(func);
    let lvi = LiveVarInfo::compute(func, &mir, &cfg);
    let (sched, scheduled) =
        schedule_block(&isa, func, &mut mir, &lvi, block).expect("nothing scheduled");

    // Invariant: no cycle issues more than the machine width.
    let last_cycle = scheduled
        .iter()
        .enumerate()
        .map(|(i, _)| sched.start_time(sched.in_order()[i]))
        .max()
        .unwrap();
    for c in 0..=last_cycle {
        assert!(
            sched.issued_in_cycle(c) <= isa.sched.num_slots,
            "cycle {} over-issued",
            c
        );
    }

    // Invariant: the rewritten block is in non-decreasing cycle order, so
    // it is a topological order of the dependence edges.
    let order = sched.in_order();
    for pair in order.windows(2) {
        assert!(sched.start_time(pair[0]) <= sched.start_time(pair[1]));
    }

    // The multiply consumes the add with a latency-1 edge, and the
    // subtract consumes the multiply with the multiply's 3-cycle latency.
    let pos_of = |op: MOp| {
        scheduled
            .iter()
            .position(|&mi| mir.op(mi) == op)
            .expect("missing op")
    };
    let add_cycle = sched.start_time(order[pos_of(MOp::Add)]);
    let mul_cycle = sched.start_time(order[pos_of(MOp::Mulx)]);
    let sub_cycle = sched.start_time(order[pos_of(MOp::Sub)]);
    assert!(mul_cycle >= add_cycle + 1);
    assert!(sub_cycle >= mul_cycle + 3);
}

#[test]
fn delayed_branch_owns_following_slots() {
    let (mut module, fr, block) = build_straight_line();
    let mut mir = select_only(&mut module, fr);
    let isa = isa::k64();
    let func = &module.funcs[fr];

    let cfg = ControlFlowGraph::compute(func);
    let lvi = LiveVarInfo::compute(func, &mir, &cfg);
    let (sched, scheduled) =
        schedule_block(&isa, func, &mut mir, &lvi, block).expect("nothing scheduled");

    let order = sched.in_order();
    let br_pos = scheduled
        .iter()
        .position(|&mi| mir.op(mi).desc().is_branch())
        .expect("no branch scheduled");
    let ndelays = mir.op(scheduled[br_pos]).desc().delay_slots as usize;
    assert_eq!(ndelays, 1);
    // The delay-slot instruction is next in issue order, in the cycle
    // immediately after the branch.
    assert!(br_pos + 1 < scheduled.len(), "delay slot missing");
    let br_cycle = sched.start_time(order[br_pos]);
    let delay_cycle = sched.start_time(order[br_pos + 1]);
    assert_eq!(delay_cycle, br_cycle + 1);
}

#[test]
fn scheduling_an_already_scheduled_block_is_stable() {
    let (mut module, fr, block) = build_straight_line();
    let mut mir = select_only(&mut module, fr);
    let isa = isa::k64();
    let func = &module.funcs[fr];

    let cfg = ControlFlowGraph::compute(func);
    let lvi = LiveVarInfo::compute(func, &mir, &cfg);
    let first =
        schedule_block(&isa, func, &mut mir, &lvi, block).expect("nothing scheduled");
    let order_once: Vec<MOp> = mir.block_code[block].iter().map(|&mi| mir.op(mi)).collect();
    let cycles_once: Vec<i64> = first
        .1
        .iter()
        .enumerate()
        .map(|(i, _)| first.0.start_time(first.0.in_order()[i]))
        .collect();

    // Run the scheduler again over its own output.
    let lvi = LiveVarInfo::compute(func, &mir, &cfg);
    let second =
        schedule_block(&isa, func, &mut mir, &lvi, block).expect("nothing scheduled");
    let order_twice: Vec<MOp> = mir.block_code[block].iter().map(|&mi| mir.op(mi)).collect();
    let cycles_twice: Vec<i64> = second
        .1
        .iter()
        .enumerate()
        .map(|(i, _)| second.0.start_time(second.0.in_order()[i]))
        .collect();

    assert_eq!(order_once, order_twice);
    assert_eq!(cycles_once, cycles_twice);
}

#[test]
fn terminator_only_block_schedules_in_one_cycle() {
    let mut module = Module::new();
    let mut func = Function::new("t", Signature::new(vec![], Type::VOID));
    let block = func.create_block();
    func.append_inst(block, InstructionData::Return { value: None }, Type::VOID);
    let fr = module.add_function(func);

    let mut mir = select_only(&mut module, fr);
    let isa = isa::k64();
    let func = &module.funcs[fr];
    let cfg = ControlFlowGraph::compute(func);
    let lvi = LiveVarInfo::compute(func, &mir, &cfg);
    let (sched, scheduled) =
        schedule_block(&isa, func, &mut mir, &lvi, block).expect("nothing scheduled");

    // The return issues in cycle zero; its delay slot follows.
    let order = sched.in_order();
    assert_eq!(sched.start_time(order[0]), 0);
    assert!(scheduled.len() <= 2);
}

#[test]
fn function_without_instructions_compiles_to_nothing() {
    let mut module = Module::new();
    let func = Function::new("empty", Signature::new(vec![], Type::VOID));
    let fr = module.add_function(func);

    let isa = isa::k64();
    let ctx = kestrel_codegen::Context::new();
    let mir = ctx.compile_function(&isa, &mut module, fr).unwrap();
    assert_eq!(mir.num_insts(), 0);
}
