//! Grouping SSA instructions into trees for pattern matching.
//!
//! The goal is to group instructions into a single tree whenever they might
//! be combined into one target instruction. Two instructions `O` and `I` are
//! grouped when `O` computes an operand of `I`, both are in the same basic
//! block, and `O` has no use other than `I`. Calls and phis are never folded
//! into a parent. The grouping is machine-independent, so it is done as
//! aggressively as those conditions allow.

use crate::fx::FxHashMap;
use crate::ir::{Block, CondCode, Function, Inst, InstructionData, Opcode, Type, TypePool, Value, ValueDef};
use kestrel_entity::{entity_impl, packed_option::PackedOption, PrimaryMap};

/// An opaque reference to an instruction-tree node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeNode(u32);
entity_impl!(TreeNode, "tn");

/// The label driving pattern matching on a tree node.
///
/// Most instruction nodes are labelled with their IR opcode; the variants
/// below distinguish the cases the patterns must tell apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpLabel {
    /// A plain IR opcode.
    Op(Opcode),
    /// `ret` with a value.
    RetValue,
    /// `br` with a condition.
    CondBranch,
    /// Any of the six set-comparisons.
    SetCc,
    /// `alloca` with a non-constant size operand.
    AllocaN,
    /// `load` with a non-empty index vector.
    LoadIdx,
    /// `getelementptr` with a non-empty index vector.
    GepIdx,
    /// `cast` to a primitive type.
    CastTo(Type),
    /// `cast` to a pointer type.
    CastToPtr,
    /// `cast` to an array type.
    CastToArray,
    /// Bitwise `and` on non-boolean operands.
    BAnd,
    /// Bitwise `or` on non-boolean operands.
    BOr,
    /// Bitwise `xor` on non-boolean operands.
    BXor,
    /// Bitwise `not` on non-boolean operands.
    BNot,
    /// Synthetic interior node chaining operands of wide instructions.
    VRegList,
    /// Constant leaf.
    Constant,
    /// Virtual-register leaf.
    VReg,
    /// Basic-block label leaf.
    Label,
}

/// What a tree node represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeNodeKind {
    /// An IR instruction (interior or root).
    Instruction(Inst),
    /// A synthetic list node.
    List,
    /// A constant operand leaf.
    Const(Value),
    /// A virtual-register operand leaf.
    Leaf(Value),
}

/// One node of an instruction tree.
pub struct TreeNodeData {
    /// What the node represents.
    pub kind: TreeNodeKind,
    /// The matcher label.
    pub label: OpLabel,
    /// Parent node, none for roots.
    pub parent: PackedOption<TreeNode>,
    /// Left child.
    pub left: PackedOption<TreeNode>,
    /// Right child.
    pub right: PackedOption<TreeNode>,
    /// Matcher state, filled in by the labelling pass.
    pub state: i32,
    /// Set when the parent's pattern consumed this node; it then generates
    /// no code of its own.
    pub folded_into_parent: bool,
}

impl TreeNodeData {
    /// The IR instruction behind this node, if it is an instruction node.
    pub fn inst(&self) -> Option<Inst> {
        match self.kind {
            TreeNodeKind::Instruction(inst) => Some(inst),
            _ => None,
        }
    }

    /// The IR value this node stands for, if any.
    pub fn value(&self, func: &Function) -> Option<Value> {
        match self.kind {
            TreeNodeKind::Instruction(inst) => func.dfg.inst_result(inst),
            TreeNodeKind::Const(v) | TreeNodeKind::Leaf(v) => Some(v),
            TreeNodeKind::List => None,
        }
    }
}

/// A forest of instruction trees covering one function.
pub struct InstrForest {
    nodes: PrimaryMap<TreeNode, TreeNodeData>,
    node_of_inst: FxHashMap<Inst, TreeNode>,
    roots: Vec<TreeNode>,
}

impl InstrForest {
    /// Build the forest for every instruction of `func`.
    pub fn build(func: &Function, pool: &TypePool) -> Self {
        let mut forest = Self {
            nodes: PrimaryMap::new(),
            node_of_inst: FxHashMap::default(),
            roots: Vec::new(),
        };
        for &block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                forest.build_tree_for_inst(func, pool, inst);
            }
        }
        forest
    }

    /// The tree roots, in creation order.
    pub fn roots(&self) -> &[TreeNode] {
        &self.roots
    }

    /// The node built for `inst`, if any.
    pub fn node_for_inst(&self, inst: Inst) -> Option<TreeNode> {
        self.node_of_inst.get(&inst).copied()
    }

    /// Shared access to a node.
    pub fn node(&self, n: TreeNode) -> &TreeNodeData {
        &self.nodes[n]
    }

    /// Mutable access to a node (the matcher writes states, the selector
    /// marks folded nodes).
    pub fn node_mut(&mut self, n: TreeNode) -> &mut TreeNodeData {
        &mut self.nodes[n]
    }

    /// All nodes in creation order.
    pub fn node_ids(&self) -> impl Iterator<Item = TreeNode> {
        self.nodes.keys()
    }

    /// Is `n` a root of its tree?
    pub fn is_root(&self, n: TreeNode) -> bool {
        self.nodes[n].parent.is_none()
    }

    fn new_node(&mut self, kind: TreeNodeKind, label: OpLabel) -> TreeNode {
        self.nodes.push(TreeNodeData {
            kind,
            label,
            parent: None.into(),
            left: None.into(),
            right: None.into(),
            state: 0,
            folded_into_parent: false,
        })
    }

    fn note_tree_node_for_inst(&mut self, inst: Inst, node: TreeNode) {
        debug_assert!(matches!(
            self.nodes[node].kind,
            TreeNodeKind::Instruction(_)
        ));
        self.node_of_inst.insert(inst, node);
        self.roots.push(node);
    }

    fn set_left_child(&mut self, parent: TreeNode, child: TreeNode) {
        self.nodes[parent].left = child.into();
        self.nodes[child].parent = parent.into();
        if matches!(self.nodes[child].kind, TreeNodeKind::Instruction(_)) {
            self.roots.retain(|&r| r != child);
        }
    }

    fn set_right_child(&mut self, parent: TreeNode, child: TreeNode) {
        self.nodes[parent].right = child.into();
        self.nodes[child].parent = parent.into();
        if matches!(self.nodes[child].kind, TreeNodeKind::Instruction(_)) {
            self.roots.retain(|&r| r != child);
        }
    }

    fn build_tree_for_inst(&mut self, func: &Function, pool: &TypePool, inst: Inst) -> TreeNode {
        if let Some(&node) = self.node_of_inst.get(&inst) {
            return node;
        }

        let label = op_label(func, pool, inst);
        let node = self.new_node(TreeNodeKind::Instruction(inst), label);
        self.note_tree_node_for_inst(inst, node);

        // Build a tree node for every data operand. Branch targets and phi
        // predecessor blocks are not values and never appear here.
        let mut children = Vec::new();
        func.dfg.inst(inst).for_each_arg(|operand| {
            children.push(self.build_tree_for_operand(func, pool, inst, operand));
        });

        // Operands of a call, phi, or indexed memory operation can exceed
        // two; chain them into a right-leaning binary tree with list nodes
        // as the interior.
        if children.len() > 2 {
            debug_assert!(matches!(
                func.dfg.opcode(inst),
                Opcode::Phi
                    | Opcode::Call
                    | Opcode::Load
                    | Opcode::Store
                    | Opcode::GetElementPtr
            ));
        }

        let n = children.len();
        if n >= 1 {
            self.set_left_child(node, children[0]);
        }
        let mut parent = node;
        for i in 1..n.saturating_sub(1) {
            let list = self.new_node(TreeNodeKind::List, OpLabel::VRegList);
            self.set_right_child(parent, list);
            self.set_left_child(list, children[i]);
            parent = list;
        }
        if n >= 2 {
            self.set_right_child(parent, children[n - 1]);
        }

        node
    }

    fn build_tree_for_operand(
        &mut self,
        func: &Function,
        pool: &TypePool,
        user: Inst,
        operand: Value,
    ) -> TreeNode {
        // An instruction that computes the operand becomes a subtree when
        // the operand has a single use and both instructions share a basic
        // block. The single use makes it safe to move the def right before
        // the user. Calls and phis stay roots, and nothing folds into a
        // phi or call user.
        let user_op = func.dfg.opcode(user);
        if let ValueDef::Inst(def_inst) = func.dfg.value_def(operand) {
            let def_op = func.dfg.opcode(def_inst);
            if func.dfg.num_uses(operand) == 1
                && func.dfg.inst_block(def_inst) == func.dfg.inst_block(user)
                && !matches!(user_op, Opcode::Phi | Opcode::Call)
                && !matches!(def_op, Opcode::Phi | Opcode::Call)
            {
                return self.build_tree_for_inst(func, pool, def_inst);
            }
        }
        if func.dfg.is_const(operand) {
            self.new_node(TreeNodeKind::Const(operand), OpLabel::Constant)
        } else {
            self.new_node(TreeNodeKind::Leaf(operand), OpLabel::VReg)
        }
    }
}

/// Compute the matcher label of `inst`.
fn op_label(func: &Function, pool: &TypePool, inst: Inst) -> OpLabel {
    let data = func.dfg.inst(inst);
    match data {
        InstructionData::Return { value: Some(_) } => OpLabel::RetValue,
        InstructionData::Branch { cond: Some(_), .. } => OpLabel::CondBranch,
        InstructionData::SetCmp { .. } => OpLabel::SetCc,
        InstructionData::Alloca { count: Some(_) } => OpLabel::AllocaN,
        InstructionData::Load { indices, .. } if !indices.is_empty() => OpLabel::LoadIdx,
        InstructionData::GetElementPtr { indices, .. } if !indices.is_empty() => OpLabel::GepIdx,
        InstructionData::Unary {
            opcode: Opcode::Cast,
            ..
        } => {
            let ty = func
                .dfg
                .inst_result(inst)
                .map(|v| func.dfg.value_type(v))
                .unwrap_or(Type::VOID);
            if pool.is_ptr(ty) {
                OpLabel::CastToPtr
            } else if matches!(pool.data(ty), crate::ir::TypeData::Array { .. }) {
                OpLabel::CastToArray
            } else {
                OpLabel::CastTo(ty)
            }
        }
        InstructionData::Binary { opcode, args } => {
            // Bitwise and logical and/or/xor/not get separate labels; the
            // logical forms only apply to booleans.
            let bool_args = func.dfg.value_type(args[0]) == Type::BOOL;
            match (opcode, bool_args) {
                (Opcode::And, false) => OpLabel::BAnd,
                (Opcode::Or, false) => OpLabel::BOr,
                (Opcode::Xor, false) => OpLabel::BXor,
                _ => OpLabel::Op(*opcode),
            }
        }
        InstructionData::Unary {
            opcode: Opcode::Not,
            arg,
        } if func.dfg.value_type(*arg) != Type::BOOL => OpLabel::BNot,
        _ => OpLabel::Op(data.opcode()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Signature};
    use smallvec::smallvec;

    fn setup() -> (Function, TypePool) {
        (
            Function::new("t", Signature::new(vec![Type::I32, Type::I32], Type::I32)),
            TypePool::new(),
        )
    }

    #[test]
    fn single_use_chain_folds() {
        let (mut func, pool) = setup();
        let x = func.args[0];
        let block = func.create_block();
        let one = func.dfg.iconst(Type::I32, 1);
        let (add, r) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [x, one],
            },
            Type::I32,
        );
        let four = func.dfg.iconst(Type::I32, 4);
        let (mul, s) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Mul,
                args: [r.unwrap(), four],
            },
            Type::I32,
        );
        func.append_inst(
            block,
            InstructionData::Return { value: s },
            Type::VOID,
        );

        let forest = InstrForest::build(&func, &pool);
        // The add is folded under the mul; the mul under nothing (its result
        // feeds the return across... the return uses it, so the mul folds
        // under the return's tree as well).
        assert!(!forest.is_root(forest.node_for_inst(add).unwrap()));
        assert!(!forest.is_root(forest.node_for_inst(mul).unwrap()));
        let mul_node = forest.node_for_inst(mul).unwrap();
        let left = forest.node(mul_node).left.expand().unwrap();
        assert_eq!(forest.node(left).inst(), Some(add));
        // Right child of mul is the constant leaf.
        let right = forest.node(mul_node).right.expand().unwrap();
        assert_eq!(forest.node(right).label, OpLabel::Constant);
    }

    #[test]
    fn multiply_used_value_stays_root() {
        let (mut func, pool) = setup();
        let x = func.args[0];
        let block = func.create_block();
        let one = func.dfg.iconst(Type::I32, 1);
        let (add, r) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [x, one],
            },
            Type::I32,
        );
        let r = r.unwrap();
        let (_mul, s) = func.append_inst(
            block,
            InstructionData::Binary {
                opcode: Opcode::Mul,
                args: [r, r],
            },
            Type::I32,
        );
        func.append_inst(block, InstructionData::Return { value: s }, Type::VOID);

        let forest = InstrForest::build(&func, &pool);
        // r has two uses, so the add must remain a root.
        assert!(forest.is_root(forest.node_for_inst(add).unwrap()));
    }

    #[test]
    fn call_operands_build_list_nodes() {
        let mut module = crate::ir::Module::new();
        let callee_sig = Signature::new(vec![Type::I32, Type::I32, Type::I32], Type::VOID);
        let callee = module.add_function(Function::declare("callee", callee_sig));
        let (mut func, pool) = setup();
        let fnty = Type::I64; // placeholder function-address type
        let callee_val = func.dfg.make_value(fnty, ValueDef::FuncAddr(callee));
        let block = func.create_block();
        let a = func.args[0];
        let b = func.args[1];
        let c = func.dfg.iconst(Type::I32, 7);
        let (call, _) = func.append_inst(
            block,
            InstructionData::Call {
                callee: callee_val,
                args: smallvec![a, b, c],
            },
            Type::VOID,
        );
        func.append_inst(block, InstructionData::Return { value: None }, Type::VOID);

        let forest = InstrForest::build(&func, &pool);
        let node = forest.node_for_inst(call).unwrap();
        assert!(forest.is_root(node));
        // Four data operands (callee + 3 args): left is the callee leaf,
        // right is a chain of two list nodes.
        let right = forest.node(node).right.expand().unwrap();
        assert_eq!(forest.node(right).label, OpLabel::VRegList);
        let right2 = forest.node(right).right.expand().unwrap();
        assert_eq!(forest.node(right2).label, OpLabel::VRegList);
    }

    #[test]
    fn setcc_label_is_shared() {
        let (mut func, pool) = setup();
        let x = func.args[0];
        let y = func.args[1];
        let block = func.create_block();
        let (lt, c) = func.append_inst(
            block,
            InstructionData::SetCmp {
                cond: CondCode::Lt,
                args: [x, y],
            },
            Type::BOOL,
        );
        func.append_inst(block, InstructionData::Return { value: c }, Type::VOID);
        let forest = InstrForest::build(&func, &pool);
        let n = forest.node_for_inst(lt).unwrap();
        assert_eq!(forest.node(n).label, OpLabel::SetCc);
    }
}
