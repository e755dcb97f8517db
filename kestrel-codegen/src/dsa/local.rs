//! The local data-structure graph of one function.
//!
//! Walks the instruction stream once: allocations create nodes, pointer
//! assignments merge them, loads and stores add and traverse edges, and
//! every call is recorded as a call site for the bottom-up closure to
//! resolve.

use crate::dsa::graph::{DsCallSite, DsGraph};
use crate::dsa::node::{DsHandle, F_ALLOCA, F_GLOBAL, F_HEAP, F_MODIFIED, F_READ, F_UNKNOWN};
use crate::ir::{
    FuncRef, Function, Inst, InstructionData, Module, Opcode, Type, TypePool, Value, ValueDef,
};
use log::debug;

/// Names treated as heap allocators when called as external functions.
const HEAP_ALLOCATORS: [&str; 3] = ["malloc", "calloc", "realloc"];

/// Does the analysis track values of this type?
pub fn is_pointer_type(pool: &TypePool, ty: Type) -> bool {
    pool.holds_pointer(ty)
}

/// Build the local graph of the function `fr` of `module`.
pub fn local_graph(module: &Module, fr: FuncRef) -> DsGraph {
    let func = &module.funcs[fr];
    let pool = &module.types;
    let mut g = DsGraph::new();

    // Formal pointer arguments point at something the caller owns.
    for &arg in &func.args {
        if is_pointer_type(pool, func.dfg.value_type(arg)) {
            let h = g.new_node(0);
            g.scalar_map.insert(arg, h);
        }
    }

    for &block in func.layout.blocks() {
        for &inst in func.layout.block_insts(block) {
            visit_inst(module, func, fr, &mut g, inst);
        }
    }

    debug!(
        "local ds-graph for {}: {} nodes, {} call sites",
        func.name,
        g.num_live_nodes(),
        g.calls.len()
    );
    g.assert_ok();
    g
}

fn handle_for_operand(module: &Module, func: &Function, g: &mut DsGraph, v: Value) -> DsHandle {
    if let Some(h) = g.handle_of(v) {
        return h;
    }
    let h = match func.dfg.value_def(v) {
        ValueDef::Global(gr) => {
            let h = g.new_node(F_GLOBAL);
            g.nodes[h.node].globals.push(gr);
            let ty = module.globals[gr].ty;
            g.nodes[h.node].add_type(0, ty, false);
            h
        }
        ValueDef::FuncAddr(fr) => {
            let h = g.new_node(F_GLOBAL);
            g.nodes[h.node].funcs.push(fr);
            h
        }
        ValueDef::ConstInt(_) | ValueDef::ConstFloat(_) => g.new_node(F_UNKNOWN),
        _ => g.new_node(0),
    };
    g.scalar_map.insert(v, h);
    h
}

fn visit_inst(module: &Module, func: &Function, fr: FuncRef, g: &mut DsGraph, inst: Inst) {
    let pool = &module.types;
    let result = func.dfg.inst_result(inst);
    let result_is_ptr =
        result.is_some_and(|r| is_pointer_type(pool, func.dfg.value_type(r)));

    match func.dfg.inst(inst).clone() {
        InstructionData::Alloca { .. } => {
            let h = g.new_node(F_ALLOCA);
            let r = result.unwrap();
            if let Some(pointee) = pool.pointee(func.dfg.value_type(r)) {
                g.nodes[h.node].add_type(0, pointee, false);
            }
            g.scalar_map.insert(r, h);
        }

        InstructionData::Call { callee, args } => {
            // A call to a known allocator creates a heap object; everything
            // else becomes a call site for the closure.
            if let ValueDef::FuncAddr(fr) = func.dfg.value_def(callee) {
                if is_heap_allocator(module, fr) {
                    let h = g.new_node(F_HEAP);
                    if let Some(r) = result {
                        g.scalar_map.insert(r, h);
                    }
                    return;
                }
            }
            let callee_h = handle_for_operand(module, func, g, callee);
            let ret = if result_is_ptr {
                let r = result.unwrap();
                Some(handle_for_operand(module, func, g, r))
            } else {
                None
            };
            let ptr_args: Vec<DsHandle> = args
                .iter()
                .filter(|&&a| is_pointer_type(pool, func.dfg.value_type(a)))
                .map(|&a| handle_for_operand(module, func, g, a))
                .collect();
            g.calls.push(DsCallSite {
                inst,
                ret,
                callee: callee_h,
                args: ptr_args,
                resolving_caller: None,
            });
        }

        InstructionData::Load { ptr, indices } => {
            let ph = handle_for_operand(module, func, g, ptr);
            let ph = offset_handle(func, g, ph, &indices, pool);
            let id = g.node_of(ph);
            g.nodes[id].flags |= F_READ;
            if result_is_ptr {
                let target = g.get_or_make_link(ph);
                let r = result.unwrap();
                match g.handle_of(r) {
                    Some(existing) => g.merge(existing, target),
                    None => {
                        g.scalar_map.insert(r, target);
                    }
                }
            }
        }

        InstructionData::Store {
            value,
            ptr,
            indices,
        } => {
            let ph = handle_for_operand(module, func, g, ptr);
            let ph = offset_handle(func, g, ph, &indices, pool);
            let id = g.node_of(ph);
            g.nodes[id].flags |= F_MODIFIED;
            if is_pointer_type(pool, func.dfg.value_type(value)) {
                let vh = handle_for_operand(module, func, g, value);
                g.add_link(ph, vh);
            }
        }

        InstructionData::GetElementPtr { ptr, indices } => {
            let ph = handle_for_operand(module, func, g, ptr);
            let h = offset_handle(func, g, ph, &indices, pool);
            let r = result.unwrap();
            match g.handle_of(r) {
                Some(existing) => g.merge(existing, h),
                None => {
                    g.scalar_map.insert(r, h);
                }
            }
        }

        InstructionData::Unary {
            opcode: Opcode::Cast,
            arg,
        } if result_is_ptr => {
            // A pointer produced from another value shares its node.
            let ah = handle_for_operand(module, func, g, arg);
            let r = result.unwrap();
            match g.handle_of(r) {
                Some(existing) => g.merge(existing, ah),
                None => {
                    g.scalar_map.insert(r, ah);
                }
            }
        }

        InstructionData::Phi { args, .. } if result_is_ptr => {
            let r = result.unwrap();
            let rh = handle_for_operand(module, func, g, r);
            for &a in args.iter() {
                let ah = handle_for_operand(module, func, g, a);
                g.merge(rh, ah);
            }
        }

        InstructionData::Return { value: Some(v) } => {
            if is_pointer_type(pool, func.dfg.value_type(v)) {
                let vh = handle_for_operand(module, func, g, v);
                // All returns of the function merge into one return node.
                match g.returns.get(&fr).copied() {
                    Some(existing) => g.merge(existing, vh),
                    None => {
                        g.returns.insert(fr, vh);
                    }
                }
            }
        }

        // Arithmetic on pointer-sized integers can smuggle pointers; a
        // binary op over a tracked value merges into its node.
        InstructionData::Binary { args, .. } if result_is_ptr => {
            let r = result.unwrap();
            for a in args {
                if g.handle_of(a).is_some() {
                    let ah = handle_for_operand(module, func, g, a);
                    match g.handle_of(r) {
                        Some(existing) => g.merge(existing, ah),
                        None => {
                            g.scalar_map.insert(r, ah);
                        }
                    }
                }
            }
        }

        _ => {}
    }
}

/// Apply an index vector to a handle: constant indices advance the offset,
/// a variable index folds the node (an unknown element is touched).
fn offset_handle(
    func: &Function,
    g: &mut DsGraph,
    h: DsHandle,
    indices: &[Value],
    pool: &TypePool,
) -> DsHandle {
    if indices.is_empty() {
        return h;
    }
    let all_const = indices.iter().all(|&i| func.dfg.is_const(i));
    if !all_const {
        let id = g.node_of(h);
        g.collapse(id);
        return g.resolve(h);
    }
    // Reuse the selection-side layout rules: the offset of an all-constant
    // index vector is a plain byte count.
    let mut offset = h.offset as i64;
    let mut ty = None;
    for (n, &idx) in indices.iter().enumerate() {
        let c = func.dfg.const_int(idx).unwrap_or(0);
        if n == 0 {
            // The first index scales the pointee as a whole; the node's
            // type record, if any, tells the element size.
            let elem = g.nodes[g.node_of(h)]
                .types
                .first()
                .map(|r| r.ty);
            if let Some(e) = elem {
                offset += c * pool.size_of(e) as i64;
                ty = Some(e);
            }
        } else if let Some(t) = ty {
            match pool.data(t) {
                crate::ir::TypeData::Array { elem, .. } => {
                    offset += c * pool.size_of(*elem) as i64;
                    ty = Some(*elem);
                }
                crate::ir::TypeData::Struct(_) => {
                    if let Some(o) = pool.field_offset(t, c as usize) {
                        offset += o as i64;
                    }
                    ty = pool.indexed_type(t, Some(c as u64));
                }
                _ => {}
            }
        }
    }
    g.resolve(DsHandle {
        node: h.node,
        offset: offset.max(0) as u32,
    })
}

fn is_heap_allocator(module: &Module, fr: FuncRef) -> bool {
    let f = &module.funcs[fr];
    f.is_external && HEAP_ALLOCATORS.contains(&f.name.as_str())
}
