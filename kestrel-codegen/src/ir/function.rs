//! Functions and modules.

use crate::ir::dfg::{DataFlowGraph, ValueDef};
use crate::ir::entities::{Block, FuncRef, GlobalRef, Inst, Value};
use crate::ir::instructions::InstructionData;
use crate::ir::layout::Layout;
use crate::ir::types::{Type, TypePool};
use kestrel_entity::PrimaryMap;

/// The signature of a function: parameter and return types.
#[derive(Clone, Debug)]
pub struct Signature {
    /// Parameter types in order.
    pub params: Vec<Type>,
    /// The return type; `Type::VOID` for none.
    pub ret: Type,
    /// Whether the function accepts variadic arguments.
    pub varargs: bool,
}

impl Signature {
    /// Create a signature with the given parameters and return type.
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self {
            params,
            ret,
            varargs: false,
        }
    }
}

/// A function: ordered basic blocks over a data-flow graph.
pub struct Function {
    /// The function's symbol name.
    pub name: String,
    /// The signature.
    pub sig: Signature,
    /// Values and instruction bodies.
    pub dfg: DataFlowGraph,
    /// Block and instruction order.
    pub layout: Layout,
    /// The values bound to the incoming arguments, in order.
    pub args: Vec<Value>,
    /// True for a declaration with no body (an external function).
    pub is_external: bool,
    next_block: u32,
}

impl Function {
    /// Create a function with argument values bound to the signature.
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        let mut dfg = DataFlowGraph::new();
        let args = sig
            .params
            .iter()
            .enumerate()
            .map(|(i, &ty)| dfg.make_value(ty, ValueDef::Arg(i as u32)))
            .collect();
        Self {
            name: name.into(),
            sig,
            dfg,
            layout: Layout::new(),
            args,
            is_external: false,
            next_block: 0,
        }
    }

    /// Create an external declaration.
    pub fn declare(name: impl Into<String>, sig: Signature) -> Self {
        let mut f = Self::new(name, sig);
        f.is_external = true;
        f
    }

    /// Create a new basic block and append it to the layout.
    pub fn create_block(&mut self) -> Block {
        let block = Block::from_u32(self.next_block);
        self.next_block += 1;
        self.layout.append_block(block);
        block
    }

    /// Append an instruction built from `data` to `block`. The result value
    /// has type `ty` (`Type::VOID` for no result). Returns the instruction
    /// and its result value, if any.
    pub fn append_inst(
        &mut self,
        block: Block,
        data: InstructionData,
        ty: Type,
    ) -> (Inst, Option<Value>) {
        let inst = self.dfg.make_inst(data, ty);
        self.dfg.set_inst_block(inst, block);
        self.layout.append_inst(block, inst);
        (inst, self.dfg.inst_result(inst))
    }

    /// The entry block.
    pub fn entry_block(&self) -> Option<Block> {
        self.layout.entry_block()
    }
}

/// Data describing a global symbol.
#[derive(Clone, Debug)]
pub struct GlobalData {
    /// The symbol name.
    pub name: String,
    /// The type of the global object (not the pointer to it).
    pub ty: Type,
}

/// A module: the unit the core consumes.
pub struct Module {
    /// The interned types of the module.
    pub types: TypePool,
    /// Functions in definition order.
    pub funcs: PrimaryMap<FuncRef, Function>,
    /// Global symbols.
    pub globals: PrimaryMap<GlobalRef, GlobalData>,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Self {
            types: TypePool::new(),
            funcs: PrimaryMap::new(),
            globals: PrimaryMap::new(),
        }
    }

    /// Add a function.
    pub fn add_function(&mut self, func: Function) -> FuncRef {
        self.funcs.push(func)
    }

    /// Add a global symbol.
    pub fn add_global(&mut self, name: impl Into<String>, ty: Type) -> GlobalRef {
        self.globals.push(GlobalData {
            name: name.into(),
            ty,
        })
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instructions::{InstructionData, Opcode};

    #[test]
    fn build_simple_function() {
        let sig = Signature::new(vec![Type::I32], Type::I32);
        let mut func = Function::new("double_it", sig);
        let x = func.args[0];
        let block = func.create_block();
        let (_, sum) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [x, x],
            },
            Type::I32,
        );
        func.append_inst(
            block,
            InstructionData::Return { value: sum },
            Type::VOID,
        );

        assert_eq!(func.entry_block(), Some(block));
        assert_eq!(func.layout.block_insts(block).len(), 2);
        let term = func.layout.terminator(block).unwrap();
        assert!(func.dfg.opcode(term).is_terminator());
        assert_eq!(func.dfg.num_uses(x), 2);
    }
}
