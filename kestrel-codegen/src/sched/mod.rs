//! Instruction scheduling: the per-block dependency graph and the forward
//! list scheduler with delay-slot filling.

pub mod graph;
pub mod list;
pub mod priorities;

pub use self::graph::{
    DepKind, EdgePayload, SchedGraph, SgEdge, SgNode, CC_RESOURCE, DEP_ANTI, DEP_NON_DATA,
    DEP_OUTPUT, DEP_TRUE,
};
pub use self::list::{schedule_block, InstrSchedule};
pub use self::priorities::SchedPriorities;
