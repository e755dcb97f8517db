//! Graph-colouring register allocation.
//!
//! The last pass of the pipeline: build live ranges over the scheduled
//! machine code, construct one interference graph per register class,
//! coalesce, colour, and patch the code with caller-save, spill, and
//! argument-copy sequences.

mod coloring;
mod context;
mod interference;
mod live_ranges;

pub use self::coloring::color_class;
pub use self::context::allocate_registers;
pub use self::interference::{IgNode, InterferenceGraph};
pub use self::live_ranges::{LiveRange, LiveRangeInfo, LrId};
