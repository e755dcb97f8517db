//! Integration checks of the data-structure analysis: local graph shapes,
//! the bottom-up closure, and the handle invariants.

use kestrel_codegen::dsa::{local_graph, BuDataStructures, F_ALLOCA, F_HEAP, F_INCOMPLETE};
use kestrel_codegen::ir::{
    Function, InstructionData, Module, Signature, Type, ValueDef,
};
use smallvec::smallvec;

#[test]
fn local_graph_tracks_alloca_and_store() {
    let mut module = Module::new();
    let i64ptr = module.types.ptr_to(Type::I64);
    let pptr = module.types.ptr_to(i64ptr);

    // fn f(q: *i64) { let p: **i64 = alloca; *p = q; }
    let mut func = Function::new("f", Signature::new(vec![i64ptr], Type::VOID));
    let q = func.args[0];
    let block = func.create_block();
    let (_, p) = func.append_inst(
        block,
        InstructionData::Alloca { count: None },
        pptr,
    );
    func.append_inst(
        block,
        InstructionData::Store {
            value: q,
            ptr: p.unwrap(),
            indices: smallvec![],
        },
        Type::VOID,
    );
    func.append_inst(block, InstructionData::Return { value: None }, Type::VOID);
    let fr = module.add_function(func);

    let g = local_graph(&module, fr);
    let p = module.funcs[fr]
        .dfg
        .inst_result(module.funcs[fr].layout.block_insts(block)[0])
        .unwrap();
    let ph = g.handle_of(p).expect("alloca result untracked");
    assert_ne!(g.nodes[ph.node].flags & F_ALLOCA, 0);

    // The store created an edge from the alloca node to q's node.
    let qh = g.handle_of(module.funcs[fr].args[0]).unwrap();
    let link = g.nodes[ph.node].links.get(&0).copied().expect("no store edge");
    assert_eq!(g.node_of(link), qh.node);

    // Both values in the scalar map resolve to nodes in the arena.
    g.assert_ok();
    // The allocas of this function may not alias distinct incoming memory
    // unless something merged them.
    assert!(g.may_alias(p, p));
}

#[test]
fn bottom_up_closure_inlines_callee_heap() {
    let mut module = Module::new();
    let i64ptr = module.types.ptr_to(Type::I64);

    // malloc is an external heap allocator.
    let malloc = module.add_function(Function::declare(
        "malloc",
        Signature::new(vec![Type::U64], i64ptr),
    ));

    // fn mk() -> *i64 { return malloc(8); }
    let mut mk = Function::new("mk", Signature::new(vec![], i64ptr));
    let size = mk.dfg.iconst(Type::U64, 8);
    let ptr_ty = module.types.ptr_to(Type::VOID);
    let malloc_val = mk.dfg.make_value(ptr_ty, ValueDef::FuncAddr(malloc));
    let b = mk.create_block();
    let (_, h) = mk.append_inst(
        b,
        InstructionData::Call {
            callee: malloc_val,
            args: smallvec![size],
        },
        i64ptr,
    );
    mk.append_inst(b, InstructionData::Return { value: h }, Type::VOID);
    let mk_ref = module.add_function(mk);

    // fn use_it() { let p = mk(); }
    let mut user = Function::new("use_it", Signature::new(vec![], Type::VOID));
    let mk_val = user.dfg.make_value(ptr_ty, ValueDef::FuncAddr(mk_ref));
    let b2 = user.create_block();
    let (call_inst, _p) = user.append_inst(
        b2,
        InstructionData::Call {
            callee: mk_val,
            args: smallvec![],
        },
        i64ptr,
    );
    user.append_inst(b2, InstructionData::Return { value: None }, Type::VOID);
    let user_ref = module.add_function(user);

    let bu = BuDataStructures::run(&module);

    // mk's graph has the heap node behind its return value.
    let mk_graph = bu.graph(mk_ref).expect("no graph for mk");
    let ret = mk_graph.returns[&mk_ref];
    assert_ne!(
        mk_graph.nodes[mk_graph.node_of(ret)].flags & F_HEAP,
        0,
        "mk's return is not a heap node"
    );

    // After the closure, the caller sees the heap object through the
    // inlined graph: its call site's return handle reaches a heap node.
    let user_graph = bu.graph(user_ref).expect("no graph for use_it");
    let cs = user_graph
        .calls
        .iter()
        .find(|cs| cs.inst == call_inst)
        .expect("call site lost");
    assert!(cs.resolving_caller.is_some(), "call site was not resolved");
    let ret_h = cs.ret.expect("pointer return untracked");
    assert_ne!(
        user_graph.nodes[user_graph.node_of(ret_h)].flags & F_HEAP,
        0,
        "heap node did not propagate into the caller"
    );
    user_graph.assert_ok();
}

#[test]
fn unresolved_external_calls_stay_auxiliary() {
    let mut module = Module::new();
    let i64ptr = module.types.ptr_to(Type::I64);
    let ext = module.add_function(Function::declare(
        "opaque",
        Signature::new(vec![i64ptr], Type::VOID),
    ));

    let mut func = Function::new("f", Signature::new(vec![i64ptr], Type::VOID));
    let p = func.args[0];
    let ptr_ty = module.types.ptr_to(Type::VOID);
    let ext_val = func.dfg.make_value(ptr_ty, ValueDef::FuncAddr(ext));
    let b = func.create_block();
    func.append_inst(
        b,
        InstructionData::Call {
            callee: ext_val,
            args: smallvec![p],
        },
        Type::VOID,
    );
    func.append_inst(b, InstructionData::Return { value: None }, Type::VOID);
    let fr = module.add_function(func);

    let bu = BuDataStructures::run(&module);
    let g = bu.graph(fr).unwrap();
    assert_eq!(g.aux_calls.len(), 1, "external call should stay unresolved");
    // The argument escapes into unanalysed code, so its node is
    // incomplete.
    let ah = g.handle_of(p).unwrap();
    assert_ne!(g.nodes[g.node_of(ah)].flags & F_INCOMPLETE, 0);
}

#[test]
fn self_recursion_merges_formals_and_actuals() {
    let mut module = Module::new();
    let i64ptr = module.types.ptr_to(Type::I64);

    // fn walk(p: *i64) { walk(p); }
    let mut func = Function::new("walk", Signature::new(vec![i64ptr], Type::VOID));
    let fr_placeholder = {
        // The function must exist in the module to name itself; insert a
        // declaration first and fill in the body after.
        let decl = Function::declare("walk", Signature::new(vec![i64ptr], Type::VOID));
        module.add_function(decl)
    };
    let p = func.args[0];
    let ptr_ty = module.types.ptr_to(Type::VOID);
    let self_val = func.dfg.make_value(ptr_ty, ValueDef::FuncAddr(fr_placeholder));
    let b = func.create_block();
    func.append_inst(
        b,
        InstructionData::Call {
            callee: self_val,
            args: smallvec![p],
        },
        Type::VOID,
    );
    func.append_inst(b, InstructionData::Return { value: None }, Type::VOID);
    func.is_external = false;
    module.funcs[fr_placeholder] = func;

    let bu = BuDataStructures::run(&module);
    let g = bu.graph(fr_placeholder).expect("no graph for walk");
    // The recursive call resolved against the function's own formals.
    assert!(g.calls.iter().all(|cs| cs.resolving_caller.is_some()));
    g.assert_ok();
}
