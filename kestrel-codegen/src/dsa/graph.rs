//! The per-function data-structure graph.
//!
//! Nodes live in an arena and are referred to by index-based handles, so
//! merging is a forwarding-pointer update and cloning a graph is an index
//! remap. A unification that would require two different layouts for one
//! node folds the node to a single zero-offset record.

use crate::dsa::node::{
    DsHandle, DsNode, DsNodeId, DsTypeRec, F_COLLAPSED, F_DEAD, F_GLOBAL, F_INCOMPLETE,
    MODREF_FLAGS,
};
use crate::fx::FxHashMap;
use crate::ir::{FuncRef, Inst, Value};
use kestrel_entity::{EntityRef, PrimaryMap};
use log::trace;

/// Clone flag: drop alloca markers (caller and callee frames are disjoint).
pub const CLONE_STRIP_ALLOCA: u16 = 0x1;
/// Clone flag: do not copy the original call-site list.
pub const CLONE_DONT_COPY_CALLS: u16 = 0x2;
/// Clone flag: do not copy the auxiliary call-site list.
pub const CLONE_DONT_COPY_AUX: u16 = 0x4;
/// Clone flag: drop mod/ref bits.
pub const CLONE_STRIP_MODREF: u16 = 0x8;

/// One call site recorded by the local pass.
#[derive(Clone, Debug)]
pub struct DsCallSite {
    /// The IR call instruction.
    pub inst: Inst,
    /// Handle for the returned value, when the call returns a pointer.
    pub ret: Option<DsHandle>,
    /// Handle for the callee; its node lists the known function targets.
    pub callee: DsHandle,
    /// Handles for the pointer arguments, in argument order.
    pub args: Vec<DsHandle>,
    /// The function whose processing resolved this call site.
    pub resolving_caller: Option<FuncRef>,
}

/// The data-structure graph of one function (or of one mutually-recursive
/// group of functions).
pub struct DsGraph {
    /// The node arena. Merged-away nodes stay as forwarding tombstones.
    pub nodes: PrimaryMap<DsNodeId, DsNode>,
    /// Pointer-bearing scalars of the function -> what they point at.
    pub scalar_map: FxHashMap<Value, DsHandle>,
    /// The return-value node of every function merged into this graph.
    pub returns: FxHashMap<FuncRef, DsHandle>,
    /// Call sites from the local pass; never modified afterwards.
    pub calls: Vec<DsCallSite>,
    /// Call sites the closure could not resolve.
    pub aux_calls: Vec<DsCallSite>,
}

impl DsGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: PrimaryMap::new(),
            scalar_map: FxHashMap::default(),
            returns: FxHashMap::default(),
            calls: Vec::new(),
            aux_calls: Vec::new(),
        }
    }

    /// Add a fresh node with `flags`.
    pub fn new_node(&mut self, flags: u16) -> DsHandle {
        DsHandle::new(self.nodes.push(DsNode::with_flags(flags)))
    }

    /// Follow forwarding pointers to the canonical handle. A collapsed
    /// target clamps the offset to zero.
    pub fn resolve(&self, mut h: DsHandle) -> DsHandle {
        while let Some((target, delta)) = self.nodes[h.node].forward {
            h = DsHandle {
                node: target,
                offset: h.offset.wrapping_add(delta),
            };
        }
        if self.nodes[h.node].is_collapsed() {
            h.offset = 0;
        }
        h
    }

    /// The canonical node behind `h`.
    pub fn node_of(&self, h: DsHandle) -> DsNodeId {
        self.resolve(h).node
    }

    /// Fold a node: collapse all offsets to zero, merging its outgoing
    /// edges into a single link.
    pub fn collapse(&mut self, id: DsNodeId) {
        let id = self.node_of(DsHandle::new(id));
        if self.nodes[id].is_collapsed() {
            return;
        }
        trace!("collapsing {}", id);
        self.nodes[id].flags |= F_COLLAPSED;

        // All type records land at offset zero.
        let types: Vec<DsTypeRec> = self.nodes[id].types.drain(..).collect();
        for t in types {
            self.nodes[id].add_type(0, t.ty, true);
        }

        // All links merge into the link at offset zero.
        let links: Vec<DsHandle> = self.nodes[id].links.values().copied().collect();
        self.nodes[id].links.clear();
        let mut merged: Option<DsHandle> = None;
        for l in links {
            merged = Some(match merged {
                None => l,
                Some(m) => {
                    self.merge(m, l);
                    self.resolve(m)
                }
            });
        }
        if let Some(m) = merged {
            let m = self.resolve(m);
            // Merging the links may have forwarded the node itself.
            let id = self.node_of(DsHandle::new(id));
            self.nodes[id].links.insert(0, m);
        }
    }

    /// Merge the logical targets of two handles. After the merge every
    /// handle to either node observes one combined node; incompatible
    /// layouts fold to a single zero-offset node.
    pub fn merge(&mut self, a: DsHandle, b: DsHandle) {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a.node == b.node {
            if a.offset != b.offset {
                // One node reached at two different offsets: the layouts
                // clash, so fold.
                self.collapse(a.node);
            }
            return;
        }

        // Keep the node reached at the smaller offset as the target so the
        // forwarding delta stays non-negative.
        let (keep, lose) = if a.offset <= b.offset { (a, b) } else { (b, a) };
        let delta = lose.offset - keep.offset;
        trace!("merging {} into {} (delta {})", lose.node, keep.node, delta);

        // Detach the loser's state before forwarding it.
        let lose_node = std::mem::take(&mut self.nodes[lose.node]);
        self.nodes[lose.node].forward = Some((keep.node, delta));

        // Combine flags, globals, and function targets.
        self.nodes[keep.node].flags |= lose_node.flags & !F_COLLAPSED;
        for g in lose_node.globals {
            if !self.nodes[keep.node].globals.contains(&g) {
                self.nodes[keep.node].globals.push(g);
            }
        }
        for f in lose_node.funcs {
            if !self.nodes[keep.node].funcs.contains(&f) {
                self.nodes[keep.node].funcs.push(f);
            }
        }

        // Type records shift by the delta. A type conflict at one offset
        // folds the combined node.
        let mut clash = false;
        for t in lose_node.types {
            let off = t.offset + delta;
            if self
                .nodes[keep.node]
                .types
                .iter()
                .any(|r| r.offset == off && r.ty != t.ty)
            {
                clash = true;
            }
            self.nodes[keep.node].add_type(off, t.ty, t.is_array);
        }
        if lose_node.flags & F_COLLAPSED != 0 {
            clash = true;
        }

        // Re-add the loser's links at shifted offsets, unifying with any
        // existing links there.
        for (off, h) in lose_node.links {
            self.add_link(DsHandle::new(keep.node).with_offset(off + delta), h);
        }

        if clash {
            self.collapse(keep.node);
        }
    }

    /// Install (or unify with) the link at `from`'s offset.
    pub fn add_link(&mut self, from: DsHandle, to: DsHandle) {
        let from = self.resolve(from);
        let to = self.resolve(to);
        match self.nodes[from.node].links.get(&from.offset).copied() {
            Some(existing) => self.merge(existing, to),
            None => {
                self.nodes[from.node].links.insert(from.offset, to);
            }
        }
    }

    /// The link at `h`'s offset, creating a fresh node when absent.
    pub fn get_or_make_link(&mut self, h: DsHandle) -> DsHandle {
        let h = self.resolve(h);
        if let Some(&l) = self.nodes[h.node].links.get(&h.offset) {
            return self.resolve(l);
        }
        let fresh = self.new_node(0);
        self.nodes[h.node].links.insert(h.offset, fresh);
        fresh
    }

    /// The handle a scalar points at, if any, resolved.
    pub fn handle_of(&self, v: Value) -> Option<DsHandle> {
        self.scalar_map.get(&v).map(|&h| self.resolve(h))
    }

    /// May the objects behind `v1` and `v2` alias?
    ///
    /// Conservative: unknown or incomplete nodes alias anything.
    pub fn may_alias(&self, v1: Value, v2: Value) -> bool {
        match (self.handle_of(v1), self.handle_of(v2)) {
            (Some(a), Some(b)) => {
                if a.node == b.node {
                    return true;
                }
                let fa = self.nodes[a.node].flags;
                let fb = self.nodes[b.node].flags;
                (fa | fb) & (F_INCOMPLETE | crate::dsa::node::F_UNKNOWN) != 0
            }
            // A value the graph knows nothing about may point anywhere.
            _ => true,
        }
    }

    /// Clone `src`'s nodes into this graph, returning the node map from
    /// `src` node ids to handles here. Only canonical (non-forwarded) nodes
    /// are copied; the `CLONE_*` flags control stripping.
    pub fn clone_into(&mut self, src: &DsGraph, flags: u16) -> FxHashMap<DsNodeId, DsHandle> {
        let mut map: FxHashMap<DsNodeId, DsHandle> = FxHashMap::default();

        // First pass: allocate a twin for every canonical live source node.
        for (id, node) in src.nodes.iter() {
            if node.forward.is_some() || node.flags & F_DEAD != 0 {
                continue;
            }
            let mut flags_new = node.flags;
            if flags & CLONE_STRIP_ALLOCA != 0 {
                flags_new &= !crate::dsa::node::F_ALLOCA;
            }
            if flags & CLONE_STRIP_MODREF != 0 {
                flags_new &= !MODREF_FLAGS;
            }
            let twin = self.nodes.push(DsNode {
                flags: flags_new,
                types: node.types.clone(),
                globals: node.globals.clone(),
                funcs: node.funcs.clone(),
                links: Default::default(),
                forward: None,
            });
            map.insert(id, DsHandle::new(twin));
        }

        // Second pass: rebuild edges through the map.
        for (id, node) in src.nodes.iter() {
            if node.forward.is_some() || node.flags & F_DEAD != 0 {
                continue;
            }
            let twin = map[&id];
            for (&off, &target) in &node.links {
                let t = src.resolve(target);
                if let Some(&tw) = map.get(&t.node) {
                    let dest = DsHandle {
                        node: tw.node,
                        offset: tw.offset + t.offset,
                    };
                    self.add_link(twin.with_offset(off), dest);
                }
            }
        }

        if flags & CLONE_DONT_COPY_CALLS == 0 {
            for cs in &src.calls {
                self.calls.push(translate_call_site(src, cs, &map));
            }
        }
        if flags & CLONE_DONT_COPY_AUX == 0 {
            for cs in &src.aux_calls {
                self.aux_calls.push(translate_call_site(src, cs, &map));
            }
        }
        map
    }

    /// Translate a handle of `src` through a clone map into this graph.
    pub fn translate(
        &self,
        src: &DsGraph,
        h: DsHandle,
        map: &FxHashMap<DsNodeId, DsHandle>,
    ) -> Option<DsHandle> {
        let r = src.resolve(h);
        map.get(&r.node).map(|&tw| DsHandle {
            node: tw.node,
            offset: tw.offset + r.offset,
        })
    }

    /// Clear all incomplete markers.
    pub fn mask_incomplete_markers(&mut self) {
        for node in self.nodes.values_mut() {
            node.flags &= !F_INCOMPLETE;
        }
    }

    /// Mark everything reachable from globals, unresolved call sites, and
    /// (optionally) incoming formal arguments as incomplete.
    pub fn mark_incomplete_nodes(&mut self, mark_formal_args: bool, arg_values: &[Value]) {
        let mut work: Vec<DsNodeId> = Vec::new();
        for (id, node) in self.nodes.iter() {
            if node.forward.is_none() && node.flags & F_GLOBAL != 0 {
                work.push(id);
            }
        }
        for cs in &self.aux_calls {
            work.push(self.node_of(cs.callee));
            if let Some(r) = cs.ret {
                work.push(self.node_of(r));
            }
            for &a in &cs.args {
                work.push(self.node_of(a));
            }
        }
        if mark_formal_args {
            for &arg in arg_values {
                if let Some(h) = self.handle_of(arg) {
                    work.push(h.node);
                }
            }
        }

        while let Some(id) = work.pop() {
            let id = self.node_of(DsHandle::new(id));
            if self.nodes[id].flags & F_INCOMPLETE != 0 {
                continue;
            }
            self.nodes[id].flags |= F_INCOMPLETE;
            let succs: Vec<DsNodeId> =
                self.nodes[id].links.values().map(|&h| self.node_of(h)).collect();
            work.extend(succs);
        }
    }

    /// Mark nodes unreachable from the scalar map, returns, and call sites
    /// as dead and drop their edges. Forwarding tombstones are dead by
    /// definition.
    pub fn remove_dead_nodes(&mut self) {
        let mut reachable = vec![false; self.nodes.len()];
        let mut work: Vec<DsNodeId> = Vec::new();

        let roots: Vec<DsHandle> = self
            .scalar_map
            .values()
            .copied()
            .chain(self.returns.values().copied())
            .chain(self.calls.iter().flat_map(call_site_handles))
            .chain(self.aux_calls.iter().flat_map(call_site_handles))
            .collect();
        for h in roots {
            work.push(self.node_of(h));
        }
        // Globals stay anchored.
        for (id, node) in self.nodes.iter() {
            if node.forward.is_none() && node.flags & F_GLOBAL != 0 {
                work.push(id);
            }
        }

        while let Some(id) = work.pop() {
            let idx = id.index();
            if reachable[idx] {
                continue;
            }
            reachable[idx] = true;
            let succs: Vec<DsNodeId> =
                self.nodes[id].links.values().map(|&h| self.node_of(h)).collect();
            work.extend(succs);
        }

        for (id, node) in self.nodes.iter_mut() {
            if node.forward.is_none() && !reachable[id.index()] {
                node.flags |= F_DEAD;
                node.links.clear();
            }
        }
    }

    /// Number of live (canonical, non-dead) nodes.
    pub fn num_live_nodes(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.forward.is_none() && n.flags & F_DEAD == 0)
            .count()
    }

    /// Check the well-formedness invariants: every handle in the scalar
    /// map, return map, and call-site lists resolves to a node in the
    /// arena.
    pub fn assert_ok(&self) {
        for (&v, &h) in &self.scalar_map {
            let r = self.resolve(h);
            debug_assert!(self.nodes.is_valid(r.node), "dangling handle for {}", v);
        }
        for cs in self.calls.iter().chain(self.aux_calls.iter()) {
            for h in call_site_handles(cs) {
                debug_assert!(self.nodes.is_valid(self.resolve(h).node));
            }
        }
    }
}

impl Default for DsGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn call_site_handles(cs: &DsCallSite) -> Vec<DsHandle> {
    let mut out = vec![cs.callee];
    out.extend(cs.ret);
    out.extend(cs.args.iter().copied());
    out
}

fn translate_call_site(
    src: &DsGraph,
    cs: &DsCallSite,
    map: &FxHashMap<DsNodeId, DsHandle>,
) -> DsCallSite {
    let tr = |h: DsHandle| -> DsHandle {
        let r = src.resolve(h);
        let tw = map[&r.node];
        DsHandle {
            node: tw.node,
            offset: tw.offset + r.offset,
        }
    };
    DsCallSite {
        inst: cs.inst,
        ret: cs.ret.map(tr),
        callee: tr(cs.callee),
        args: cs.args.iter().map(|&a| tr(a)).collect(),
        resolving_caller: cs.resolving_caller,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_entity::EntityRef;

    #[test]
    fn merge_composes_offsets() {
        let mut g = DsGraph::new();
        let a = g.new_node(0);
        let b = g.new_node(0);
        // Point a@8 and b@0 at the same object: b forwards into a with a
        // delta of 8.
        g.merge(a.with_offset(8), b);
        let rb = g.resolve(b);
        assert_eq!(rb.node, a.node);
        assert_eq!(rb.offset, 8);
        assert_eq!(g.num_live_nodes(), 1);
    }

    #[test]
    fn merge_same_node_different_offsets_folds() {
        let mut g = DsGraph::new();
        let a = g.new_node(0);
        g.merge(a, a.with_offset(4));
        assert!(g.nodes[a.node].is_collapsed());
        assert_eq!(g.resolve(a.with_offset(12)).offset, 0);
    }

    #[test]
    fn links_unify_on_merge() {
        let mut g = DsGraph::new();
        let a = g.new_node(0);
        let b = g.new_node(0);
        let x = g.new_node(0);
        let y = g.new_node(0);
        g.add_link(a, x);
        g.add_link(b, y);
        g.merge(a, b);
        // x and y must have been unified.
        assert_eq!(g.node_of(x), g.node_of(y));
    }

    #[test]
    fn clone_roundtrip_preserves_structure() {
        let mut g = DsGraph::new();
        let a = g.new_node(crate::dsa::node::F_ALLOCA);
        let b = g.new_node(crate::dsa::node::F_HEAP);
        g.add_link(a.with_offset(8), b);

        let mut h = DsGraph::new();
        let map = h.clone_into(&g, 0);
        assert_eq!(h.num_live_nodes(), 2);
        let ha = map[&a.node];
        let hb = map[&b.node];
        let link = h.nodes[ha.node].links[&8];
        assert_eq!(h.node_of(link), hb.node);

        // Cloning back yields a structurally equal graph.
        let mut g2 = DsGraph::new();
        let map2 = g2.clone_into(&h, 0);
        assert_eq!(g2.num_live_nodes(), g.num_live_nodes());
        let g2a = map2[&ha.node];
        assert!(g2.nodes[g2a.node].links.contains_key(&8));
        assert_eq!(g2.nodes[g2a.node].flags, g.nodes[a.node].flags);
    }

    #[test]
    fn strip_alloca_on_clone() {
        let mut g = DsGraph::new();
        let a = g.new_node(crate::dsa::node::F_ALLOCA);
        let mut h = DsGraph::new();
        let map = h.clone_into(&g, CLONE_STRIP_ALLOCA);
        let twin = map[&a.node];
        assert_eq!(h.nodes[twin.node].flags & crate::dsa::node::F_ALLOCA, 0);
    }

    #[test]
    fn dead_nodes_are_marked() {
        let mut g = DsGraph::new();
        let _orphan = g.new_node(0);
        let kept = g.new_node(0);
        let v = Value::new(0);
        g.scalar_map.insert(v, kept);
        g.remove_dead_nodes();
        assert_eq!(g.num_live_nodes(), 1);
        assert_eq!(g.nodes[kept.node].flags & F_DEAD, 0);
    }
}

impl core::fmt::Display for DsGraph {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        writeln!(f, "ds-graph: {} live nodes", self.num_live_nodes())?;
        for (id, node) in self.nodes.iter() {
            if node.forward.is_some() || node.flags & F_DEAD != 0 {
                continue;
            }
            write!(f, "  {} flags {:#x}", id, node.flags)?;
            if !node.globals.is_empty() {
                write!(f, " globals {:?}", node.globals)?;
            }
            if !node.funcs.is_empty() {
                write!(f, " funcs {:?}", node.funcs)?;
            }
            for (off, h) in &node.links {
                let r = self.resolve(*h);
                write!(f, " [{}]->{}+{}", off, r.node, r.offset)?;
            }
            writeln!(f)?;
        }
        writeln!(f, "  {} calls, {} unresolved", self.calls.len(), self.aux_calls.len())
    }
}
