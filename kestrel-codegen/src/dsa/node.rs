//! Nodes of the data-structure graph.

use crate::ir::{FuncRef, GlobalRef, Type};
use kestrel_entity::entity_impl;
use std::collections::BTreeMap;

/// An opaque reference to a node in a `DsGraph`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DsNodeId(u32);
entity_impl!(DsNodeId, "dsn");

/// Node flag: the object is a stack allocation.
pub const F_ALLOCA: u16 = 0x01;
/// Node flag: the object is a heap allocation.
pub const F_HEAP: u16 = 0x02;
/// Node flag: the object is (or contains) a global.
pub const F_GLOBAL: u16 = 0x04;
/// Node flag: something untrackable flowed into the node.
pub const F_UNKNOWN: u16 = 0x08;
/// Node flag: the node may be affected by unanalysed code.
pub const F_INCOMPLETE: u16 = 0x10;
/// Node flag: the object is written somewhere.
pub const F_MODIFIED: u16 = 0x20;
/// Node flag: the object is read somewhere.
pub const F_READ: u16 = 0x40;
/// Node flag: field structure has been folded away; all offsets are zero.
pub const F_COLLAPSED: u16 = 0x80;
/// Node flag: unreachable after dead-node removal.
pub const F_DEAD: u16 = 0x100;

/// The mod/ref flags, strippable when cloning.
pub const MODREF_FLAGS: u16 = F_MODIFIED | F_READ;

/// A pointer into a `DsGraph`: a node plus a byte offset into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DsHandle {
    /// The target node.
    pub node: DsNodeId,
    /// Byte offset within the target.
    pub offset: u32,
}

impl DsHandle {
    /// A handle to offset 0 of `node`.
    pub fn new(node: DsNodeId) -> Self {
        Self { node, offset: 0 }
    }

    /// The same handle shifted by `delta` bytes.
    pub fn with_offset(self, offset: u32) -> Self {
        Self {
            node: self.node,
            offset,
        }
    }
}

/// A record of one type observed at an offset within a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DsTypeRec {
    /// Byte offset of the field.
    pub offset: u32,
    /// The observed type.
    pub ty: Type,
    /// Whether an array of elements was accessed here.
    pub is_array: bool,
}

/// One points-to node: a memory object or a set of merged objects.
#[derive(Clone, Debug, Default)]
pub struct DsNode {
    /// `F_*` flags.
    pub flags: u16,
    /// Observed field types, kept sorted by offset.
    pub types: Vec<DsTypeRec>,
    /// Globals merged into this node.
    pub globals: Vec<GlobalRef>,
    /// Function targets merged into this node (callees of indirect calls).
    pub funcs: Vec<FuncRef>,
    /// Outgoing edges: byte offset -> target handle. Multiple offsets may
    /// point into the same target node.
    pub links: BTreeMap<u32, DsHandle>,
    /// Set once the node has been merged away: all handles forward to the
    /// target with the offset delta added.
    pub forward: Option<(DsNodeId, u32)>,
}

impl DsNode {
    /// Create a node with the given flags.
    pub fn with_flags(flags: u16) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Has the node's field structure been folded to offset zero?
    pub fn is_collapsed(&self) -> bool {
        self.flags & F_COLLAPSED != 0
    }

    /// Record a type observation, keeping the list offset-sorted.
    pub fn add_type(&mut self, offset: u32, ty: Type, is_array: bool) {
        let rec = DsTypeRec {
            offset,
            ty,
            is_array,
        };
        if self.types.contains(&rec) {
            return;
        }
        let pos = self
            .types
            .iter()
            .position(|r| r.offset > offset)
            .unwrap_or(self.types.len());
        self.types.insert(pos, rec);
    }
}
