//! Representation of the input SSA IR.
//!
//! The core does not define or validate the IR; this module is the read-only
//! view it consumes, plus the builder methods the test suite uses to
//! construct inputs. Instructions are a single tagged variant with per-opcode
//! payloads, values carry their use sets, and everything is referred to by
//! dense entity indexes.

mod dfg;
mod entities;
mod function;
mod instructions;
mod layout;
mod types;

pub use self::dfg::{DataFlowGraph, UseSite, ValueData, ValueDef};
pub use self::entities::{Block, FuncRef, GlobalRef, Inst, Value};
pub use self::function::{Function, GlobalData, Module, Signature};
pub use self::instructions::{CondCode, InstructionData, Opcode, ValueList};
pub use self::layout::Layout;
pub use self::types::{Type, TypeData, TypePool, POINTER_BYTES};
