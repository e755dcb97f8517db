//! Data-structure analysis: a context-sensitive points-to graph.
//!
//! Each function gets a local graph relating its pointer-bearing scalars to
//! abstract memory objects; the bottom-up closure inlines callee graphs
//! into callers along the call-graph post-order. The closed graphs answer
//! may-alias queries for the rest of the back-end.

pub mod bottom_up;
pub mod graph;
pub mod local;
pub mod node;

pub use self::bottom_up::BuDataStructures;
pub use self::graph::{
    DsCallSite, DsGraph, CLONE_DONT_COPY_AUX, CLONE_DONT_COPY_CALLS, CLONE_STRIP_ALLOCA,
    CLONE_STRIP_MODREF,
};
pub use self::local::local_graph;
pub use self::node::{
    DsHandle, DsNode, DsNodeId, DsTypeRec, F_ALLOCA, F_COLLAPSED, F_DEAD, F_GLOBAL, F_HEAP,
    F_INCOMPLETE, F_MODIFIED, F_READ, F_UNKNOWN,
};
