//! Block and instruction ordering.
//!
//! The layout determines the order of basic blocks in a function and the
//! order of instructions within each block, separate from the data-flow
//! information kept in the `DataFlowGraph`.

use crate::ir::entities::{Block, Inst};
use kestrel_entity::SecondaryMap;

/// The layout of blocks and instructions in a function.
#[derive(Clone, Default)]
pub struct Layout {
    /// Blocks in program order. The first is the entry block.
    blocks: Vec<Block>,
    insts: SecondaryMap<Block, Vec<Inst>>,
}

impl Layout {
    /// Create a new empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `block` to the end of the function.
    pub fn append_block(&mut self, block: Block) {
        debug_assert!(!self.blocks.contains(&block));
        self.blocks.push(block);
    }

    /// Append `inst` to the end of `block`.
    pub fn append_inst(&mut self, block: Block, inst: Inst) {
        self.insts[block].push(inst);
    }

    /// The entry block, if any blocks exist.
    pub fn entry_block(&self) -> Option<Block> {
        self.blocks.first().copied()
    }

    /// Blocks in program order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Instructions of `block` in program order.
    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.insts[block]
    }

    /// The last instruction of `block`, which must be its terminator in a
    /// well-formed function.
    pub fn terminator(&self, block: Block) -> Option<Inst> {
        self.insts[block].last().copied()
    }

    /// Iterate over every instruction in layout order.
    pub fn all_insts(&self) -> impl Iterator<Item = (Block, Inst)> + '_ {
        self.blocks
            .iter()
            .flat_map(move |&b| self.insts[b].iter().map(move |&i| (b, i)))
    }
}
