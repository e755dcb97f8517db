//! The bottom-up interprocedural closure of the data-structure graphs.
//!
//! Functions are processed in call-graph post-order so a callee's graph is
//! complete before any caller inlines it. Mutually recursive functions form
//! one strongly connected component and share a single graph: each member's
//! local graph is cloned in, and intra-component calls resolve by merging
//! formals with actuals, the same way self-recursion does. Calls whose
//! callees are external stay on the auxiliary unresolved list.

use crate::dsa::graph::{
    DsCallSite, DsGraph, CLONE_DONT_COPY_AUX, CLONE_DONT_COPY_CALLS, CLONE_STRIP_ALLOCA,
};
use crate::dsa::local::{is_pointer_type, local_graph};
use crate::dsa::node::DsHandle;
use crate::fx::FxHashMap;
use crate::ir::{FuncRef, Module, Value, ValueDef};
use kestrel_entity::EntityRef;
use log::{debug, trace};

/// The result of the closure: one graph per function, shared within
/// strongly connected components of the call graph.
pub struct BuDataStructures {
    graphs: Vec<DsGraph>,
    graph_of: FxHashMap<FuncRef, usize>,
}

impl BuDataStructures {
    /// The closed graph of `fr`, if the function had a body to analyse.
    pub fn graph(&self, fr: FuncRef) -> Option<&DsGraph> {
        self.graph_of.get(&fr).map(|&i| &self.graphs[i])
    }

    /// Run the closure over every function of `module`.
    pub fn run(module: &Module) -> Self {
        let mut bu = BuDataStructures {
            graphs: Vec::new(),
            graph_of: FxHashMap::default(),
        };

        // The direct-call graph and its strongly connected components.
        let callees = direct_callees(module);
        let sccs = condense(module, &callees);

        // `condense` returns components in callee-before-caller order.
        for component in sccs {
            bu.process_component(module, &component);
        }
        bu
    }

    fn process_component(&mut self, module: &Module, component: &[FuncRef]) {
        let index = self.graphs.len();
        let mut graph = DsGraph::new();

        // Clone every member's local graph into the shared graph. For a
        // single non-recursive function this is just its local graph.
        for &fr in component {
            if module.funcs[fr].is_external {
                continue;
            }
            let local = local_graph(module, fr);
            let map = graph.clone_into(&local, 0);
            // Carry the scalar map and return node across; within the
            // component the scalars are all distinct values.
            for (&v, &h) in &local.scalar_map {
                if let Some(t) = graph.translate(&local, h, &map) {
                    graph.scalar_map.insert(v, t);
                }
            }
            for (&f, &h) in &local.returns {
                if let Some(t) = graph.translate(&local, h, &map) {
                    graph.returns.insert(f, t);
                }
            }
        }

        // Resolve call sites until no more inlining is possible. Each
        // (call, target) pair is inlined at most once; a site with any
        // target left over (an external function) stays unresolved.
        let mut done_inlines: crate::fx::FxHashSet<(crate::ir::Inst, FuncRef)> =
            crate::fx::FxHashSet::default();
        let mut inlined = true;
        while inlined {
            inlined = false;
            let pending: Vec<DsCallSite> = graph
                .calls
                .iter()
                .cloned()
                .filter(|cs| cs.resolving_caller.is_none())
                .collect();

            for mut cs in pending {
                let callee_node = graph.node_of(cs.callee);
                let targets: Vec<FuncRef> = graph.nodes[callee_node].funcs.clone();
                if targets.is_empty() {
                    continue; // unknown callee: stays unresolved below
                }

                let mut all_resolved = true;
                for target in targets {
                    if !done_inlines.insert((cs.inst, target)) {
                        continue; // already merged this callee here
                    }
                    if component.contains(&target) {
                        // Self or mutual recursion: link formals to actuals
                        // inside the shared graph.
                        trace!("self-inlining {} in component", target);
                        self.resolve_arguments_in_graph(module, &mut graph, &cs, target);
                        inlined = true;
                    } else if let Some(&gi) = self.graph_of.get(&target) {
                        // A callee processed earlier: clone its closed
                        // graph in and merge.
                        trace!("inlining graph of {}", target);
                        let callee_graph = &self.graphs[gi];
                        inline_graph(module, &mut graph, callee_graph, &cs, target);
                        inlined = true;
                    } else {
                        // External or otherwise unanalysed.
                        done_inlines.remove(&(cs.inst, target));
                        all_resolved = false;
                    }
                }
                if all_resolved {
                    cs.resolving_caller = Some(component[0]);
                    // Record the resolution on the original list.
                    for orig in &mut graph.calls {
                        if orig.inst == cs.inst {
                            orig.resolving_caller = cs.resolving_caller;
                        }
                    }
                }
            }

            // Recompute incompleteness after each inlining round.
            if inlined {
                graph.mask_incomplete_markers();
                let args = component_args(module, component);
                graph.mark_incomplete_nodes(true, &args);
                graph.remove_dead_nodes();
            }
        }

        // Whatever still has an unknown callee lands on the auxiliary
        // unresolved list.
        graph.aux_calls = graph
            .calls
            .iter()
            .filter(|cs| cs.resolving_caller.is_none())
            .cloned()
            .collect();

        graph.mask_incomplete_markers();
        let args = component_args(module, component);
        graph.mark_incomplete_nodes(true, &args);
        graph.remove_dead_nodes();
        graph.assert_ok();

        debug!(
            "bu closure of component {:?}: {} live nodes, {} unresolved calls",
            component,
            graph.num_live_nodes(),
            graph.aux_calls.len()
        );

        self.graphs.push(graph);
        for &fr in component {
            self.graph_of.insert(fr, index);
        }
    }

    /// Resolve a recursive call by merging the call site's handles with the
    /// callee's own return node and formal arguments (which live in the
    /// same graph).
    fn resolve_arguments_in_graph(
        &self,
        module: &Module,
        graph: &mut DsGraph,
        cs: &DsCallSite,
        callee: FuncRef,
    ) {
        let fret = graph.returns.get(&callee).copied();
        if let (Some(csret), Some(fret)) = (cs.ret, fret) {
            graph.merge(fret, csret);
        }
        let formals = pointer_formals(module, callee);
        for (i, formal) in formals.into_iter().enumerate() {
            if let (Some(&fh), Some(&ah)) =
                (graph.scalar_map.get(&formal), cs.args.get(i))
            {
                graph.merge(fh, ah);
            }
        }
    }
}

/// Clone `callee_graph` into `graph` (stripping allocas and skipping its
/// call lists) and merge the call site's handles with the clone's return
/// node and formal arguments.
fn inline_graph(
    module: &Module,
    graph: &mut DsGraph,
    callee_graph: &DsGraph,
    cs: &DsCallSite,
    callee: FuncRef,
) {
    let map = graph.clone_into(
        callee_graph,
        CLONE_STRIP_ALLOCA | CLONE_DONT_COPY_CALLS | CLONE_DONT_COPY_AUX,
    );

    if let (Some(csret), Some(&fret)) = (cs.ret, callee_graph.returns.get(&callee)) {
        if let Some(t) = graph.translate(callee_graph, fret, &map) {
            graph.merge(t, csret);
        }
    }
    let formals = pointer_formals(module, callee);
    for (i, formal) in formals.into_iter().enumerate() {
        let Some(&fh) = callee_graph.scalar_map.get(&formal) else {
            continue;
        };
        let (Some(t), Some(&ah)) = (graph.translate(callee_graph, fh, &map), cs.args.get(i))
        else {
            continue;
        };
        graph.merge(t, ah);
    }
}

/// The pointer-typed formal argument values of `fr`, in order.
fn pointer_formals(module: &Module, fr: FuncRef) -> Vec<Value> {
    let func = &module.funcs[fr];
    func.args
        .iter()
        .copied()
        .filter(|&a| is_pointer_type(&module.types, func.dfg.value_type(a)))
        .collect()
}

fn component_args(module: &Module, component: &[FuncRef]) -> Vec<Value> {
    component
        .iter()
        .flat_map(|&fr| module.funcs[fr].args.iter().copied())
        .collect()
}

/// Direct callees per function (the local call graph edges).
fn direct_callees(module: &Module) -> FxHashMap<FuncRef, Vec<FuncRef>> {
    let mut out: FxHashMap<FuncRef, Vec<FuncRef>> = FxHashMap::default();
    for (fr, func) in module.funcs.iter() {
        let list = out.entry(fr).or_default();
        if func.is_external {
            continue;
        }
        for (_, inst) in func.layout.all_insts() {
            if let crate::ir::InstructionData::Call { callee, .. } = func.dfg.inst(inst) {
                if let ValueDef::FuncAddr(target) = func.dfg.value_def(*callee) {
                    if !module.funcs[target].is_external && !list.contains(&target) {
                        list.push(target);
                    }
                }
            }
        }
    }
    out
}

/// Condense the call graph into strongly connected components, returned in
/// callee-before-caller order. Components are discovered from the call
/// graph's post-order with a second pass grouping cycles.
fn condense(
    module: &Module,
    callees: &FxHashMap<FuncRef, Vec<FuncRef>>,
) -> Vec<Vec<FuncRef>> {
    let n = module.funcs.len();

    // Kosaraju: finish order over the forward graph with one shared
    // visited set, then components from the transposed graph in reverse
    // finish order.
    let mut order: Vec<usize> = Vec::new();
    let mut seen = vec![false; n];
    for (fr, func) in module.funcs.iter() {
        if func.is_external || seen[fr.index()] {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(fr.index(), 0)];
        seen[fr.index()] = true;
        while let Some(&mut (node, ref mut pos)) = stack.last_mut() {
            let succ = callees
                .get(&FuncRef::from_u32(node as u32))
                .and_then(|list| list.get(*pos))
                .map(|c| c.index());
            match succ {
                Some(next) => {
                    *pos += 1;
                    if !seen[next] {
                        seen[next] = true;
                        stack.push((next, 0));
                    }
                }
                None => {
                    order.push(node);
                    stack.pop();
                }
            }
        }
    }

    let mut preds: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
    for (&fr, list) in callees {
        for c in list {
            preds.entry(c.index()).or_default().push(fr.index());
        }
    }

    let mut component_of = vec![usize::MAX; n];
    let mut components: Vec<Vec<FuncRef>> = Vec::new();
    for &start in order.iter().rev() {
        if component_of[start] != usize::MAX {
            continue;
        }
        let cidx = components.len();
        let mut members = Vec::new();
        let mut work = vec![start];
        component_of[start] = cidx;
        while let Some(i) = work.pop() {
            members.push(FuncRef::from_u32(i as u32));
            for &p in preds.get(&i).map(|v| v.as_slice()).unwrap_or(&[]) {
                if component_of[p] == usize::MAX && seen[p] {
                    component_of[p] = cidx;
                    work.push(p);
                }
            }
        }
        components.push(members);
    }

    // Reverse-post-order component discovery yields callers first; the
    // closure wants callees first.
    components.reverse();
    components
}
