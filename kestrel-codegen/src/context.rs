//! The per-function compilation pipeline.
//!
//! A `Context` owns the pass options and drives the fixed sequence per
//! function: instruction selection, live-variable analysis, per-block
//! scheduling, and register allocation. Module compilation additionally
//! runs the bottom-up points-to closure up front.

use crate::dsa::BuDataStructures;
use crate::flowgraph::ControlFlowGraph;
use crate::fx::FxHashMap;
use crate::ir::{FuncRef, Module};
use crate::isa::TargetIsa;
use crate::liveness::LiveVarInfo;
use crate::mir::MirFunction;
use crate::regalloc::allocate_registers;
use crate::result::CodegenResult;
use crate::sched::schedule_block;
use crate::select::{select_function, CalleeInfo};
use log::info;

/// What to dump while compiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpFlags {
    /// No debugging output.
    None,
    /// Print machine code after each pass.
    MachineCode,
    /// Print a trace of scheduling decisions.
    SchedTrace,
    /// Print the scheduling graphs.
    Graphs,
}

/// Options controlling a compilation.
#[derive(Clone, Copy, Debug)]
pub struct CompileOptions {
    /// Debug-dump selection.
    pub dump: DumpFlags,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            dump: DumpFlags::None,
        }
    }
}

/// The compilation context: pass options plus per-compilation state.
pub struct Context {
    /// The options in effect.
    pub options: CompileOptions,
}

impl Context {
    /// Create a context with default options.
    pub fn new() -> Self {
        Self {
            options: CompileOptions::default(),
        }
    }

    /// Compile one function of `module` to scheduled, register-allocated
    /// machine code.
    pub fn compile_function(
        &self,
        isa: &TargetIsa,
        module: &mut Module,
        fr: FuncRef,
    ) -> CodegenResult<MirFunction> {
        let callee_info = gather_callee_info(module);

        // Split the module borrow: the type pool and the function table are
        // disjoint.
        let Module { types, funcs, .. } = module;
        let func = &mut funcs[fr];
        info!("compiling {}", func.name);

        let mut mir = select_function(isa, types, func, &callee_info)?;

        let cfg = ControlFlowGraph::compute(func);
        let lvi = LiveVarInfo::compute(func, &mir, &cfg);
        for &block in func.layout.blocks() {
            let _ = schedule_block(isa, func, &mut mir, &lvi, block);
        }

        // Scheduling reordered the code; the allocator needs fresh live
        // information.
        let lvi = LiveVarInfo::compute(func, &mir, &cfg);
        allocate_registers(isa, types, func, &mut mir, &cfg, &lvi)?;

        if self.options.dump == DumpFlags::MachineCode {
            for &block in func.layout.blocks() {
                println!("{}:", block);
                for &mi in &mir.block_code[block] {
                    println!("    {}", mir.display(mi));
                }
            }
        }
        Ok(mir)
    }

    /// Compile every defined function of `module`, running the points-to
    /// closure first. Returns the machine code in function order alongside
    /// the closed graphs.
    pub fn compile_module(
        &self,
        isa: &TargetIsa,
        module: &mut Module,
    ) -> CodegenResult<(Vec<(FuncRef, MirFunction)>, BuDataStructures)> {
        let bu = BuDataStructures::run(module);

        let mut out = Vec::new();
        let func_refs: Vec<FuncRef> = module.funcs.keys().collect();
        for fr in func_refs {
            if module.funcs[fr].is_external {
                continue;
            }
            let mir = self.compile_function(isa, module, fr)?;
            out.push((fr, mir));
        }
        Ok((out, bu))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Summarise callee signatures for call lowering.
fn gather_callee_info(module: &Module) -> FxHashMap<FuncRef, CalleeInfo> {
    let mut out = FxHashMap::default();
    for (fr, func) in module.funcs.iter() {
        out.insert(
            fr,
            CalleeInfo {
                varargs: func.sig.varargs,
                no_prototype: func.sig.varargs && func.sig.params.is_empty(),
            },
        );
    }
    out
}
