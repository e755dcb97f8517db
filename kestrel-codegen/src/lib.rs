//! Kestrel code generation library.
//!
//! This crate lowers a typed SSA intermediate representation to machine
//! instructions for the k64 reference target: instruction selection by
//! bottom-up tree-pattern matching, cycle-accurate list scheduling with
//! branch-delay-slot filling, and graph-colouring register allocation. A
//! context-sensitive data-structure (points-to) analysis supplies may-alias
//! information.
//!
//! The pass pipeline per function is driven by [`Context`]: build machine IR
//! by pattern selection, run live-variable analysis, schedule each basic
//! block, then allocate registers and patch the code with caller-save, spill,
//! and argument-copy sequences.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use kestrel_entity as entity;

pub mod dsa;
pub mod flowgraph;
pub mod ir;
pub mod isa;
pub mod liveness;
pub mod mir;
pub mod regalloc;
pub mod sched;
pub mod select;
pub mod traverse;

mod context;
mod fx;
mod result;

pub use crate::context::{CompileOptions, Context, DumpFlags};
pub use crate::result::{CodegenError, CodegenResult};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
