//! Bottom-up rewrite-system labelling of instruction trees.
//!
//! The matcher walks each tree bottom-up and computes, per node, an opaque
//! state holding the rule number to use for each non-terminal. Chain rules
//! (a single non-terminal on the right-hand side) emit no code; the selector
//! re-queries the state with the chained non-terminal and recurses.
//! Production rules drive machine-code emission in `lower`.

use crate::ir::{Function, Opcode, Type};
use crate::select::forest::{InstrForest, OpLabel, TreeNode, TreeNodeKind};

/// Grammar non-terminals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Nt {
    /// A statement: code executed for effect.
    Stmt,
    /// A value computed into a register.
    Reg,
}

/// Number of non-terminals.
pub const NUM_NT: usize = 2;

impl Nt {
    fn index(self) -> usize {
        match self {
            Nt::Stmt => 0,
            Nt::Reg => 1,
        }
    }
}

/// Rule numbers. The discriminants are the rule numbering the productions in
/// `lower` dispatch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Rule {
    Ret = 1,
    RetValue = 2,
    Store = 3,
    BrUncond = 5,
    BrCond = 6,
    BrCondBoolReg = 8,
    VRegList = 10,
    ToArray = 19,
    ToPtr = 20,
    NotBool = 21,
    ToBool = 22,
    ToUnsigned = 23,
    ToSigned = 24,
    ToFloat = 31,
    ToDouble = 32,
    Add = 33,
    Sub = 34,
    Mul = 35,
    Div = 36,
    Rem = 37,
    AndBool = 38,
    OrBool = 39,
    XorBool = 40,
    SetCcConst = 41,
    SetCc = 42,
    Load = 51,
    Gep = 55,
    Alloca = 57,
    AllocaN = 58,
    Call = 61,
    Shl = 62,
    Shr = 63,
    Phi = 64,
    VRegLeaf = 71,
    ConstLeaf = 72,
    StmtFromReg = 111,
    MulBothCast = 135,
    AndNotBool = 138,
    OrNotBool = 139,
    XorNotBool = 140,
    BrCondSetCc = 206,
    BrCondBoolConst = 208,
    AddConst = 233,
    SubConst = 234,
    MulConst = 235,
    DivConst = 236,
    RemConst = 237,
    AndBoolConst = 238,
    OrBoolConst = 239,
    XorBoolConst = 240,
    MulBothCastConst = 335,
    BAnd = 338,
    BOr = 339,
    BXor = 340,
    BNot = 421,
    BAndNot = 438,
    BOrNot = 439,
    BXorNot = 440,
    BAndConst = 538,
    BOrConst = 539,
    BXorConst = 540,
}

/// Is `rule` a chain rule (single non-terminal right-hand side, no code)?
pub fn is_chain_rule(rule: Rule) -> bool {
    matches!(rule, Rule::StmtFromReg)
}

/// The right-hand-side non-terminal of a chain rule.
pub fn chain_nt(rule: Rule) -> Nt {
    debug_assert!(is_chain_rule(rule));
    Nt::Reg
}

/// One matcher state: the chosen rule per non-terminal.
#[derive(Clone, Copy, Default)]
struct StateEntry {
    rules: [Option<Rule>; NUM_NT],
}

/// The labelled match result for a forest.
pub struct Matcher {
    states: Vec<StateEntry>,
}

impl Matcher {
    /// Label every tree of `forest`, writing the state of each node.
    pub fn label(forest: &mut InstrForest, func: &Function) -> Matcher {
        let mut matcher = Matcher { states: Vec::new() };
        // A state depends only on the node's label and its children's
        // labels, never on their states, so one pass in any order labels
        // the whole forest.
        let nodes: Vec<TreeNode> = forest.node_ids().collect();
        for n in nodes {
            let entry = matcher.compute_state(forest, func, n);
            let state = matcher.states.len() as i32;
            matcher.states.push(entry);
            forest.node_mut(n).state = state;
        }
        matcher
    }

    /// The rule for non-terminal `nt` at `state`, if the state derives it.
    pub fn rule(&self, state: i32, nt: Nt) -> Option<Rule> {
        self.states[state as usize].rules[nt.index()]
    }

    /// Resolve chain rules starting from `nt` at `state` until a production
    /// rule is reached.
    pub fn production(&self, state: i32, mut nt: Nt) -> Option<Rule> {
        let mut rule = self.rule(state, nt)?;
        while is_chain_rule(rule) {
            nt = chain_nt(rule);
            rule = self.rule(state, nt)?;
        }
        Some(rule)
    }

    fn compute_state(&self, forest: &InstrForest, func: &Function, n: TreeNode) -> StateEntry {
        let mut entry = StateEntry::default();
        let node = forest.node(n);

        let mut set_reg = |entry: &mut StateEntry, rule: Rule| {
            entry.rules[Nt::Reg.index()] = Some(rule);
            entry.rules[Nt::Stmt.index()] = Some(Rule::StmtFromReg);
        };
        let set_stmt = |entry: &mut StateEntry, rule: Rule| {
            entry.rules[Nt::Stmt.index()] = Some(rule);
        };

        match node.kind {
            TreeNodeKind::Leaf(_) => set_reg(&mut entry, Rule::VRegLeaf),
            TreeNodeKind::Const(_) => set_reg(&mut entry, Rule::ConstLeaf),
            TreeNodeKind::List => {
                entry.rules[Nt::Reg.index()] = Some(Rule::VRegList);
            }
            TreeNodeKind::Instruction(_) => {
                let left = node.left.expand();
                let right = node.right.expand();
                let right_is_const =
                    right.is_some_and(|r| forest.node(r).label == OpLabel::Constant);
                let right_is_not = right.is_some_and(|r| {
                    matches!(
                        forest.node(r).label,
                        OpLabel::BNot | OpLabel::Op(Opcode::Not)
                    ) && forest.node(r).inst().is_some()
                });
                let both_cast_to_double = left.is_some_and(|l| {
                    forest.node(l).label == OpLabel::CastTo(Type::F64)
                        && forest.node(l).inst().is_some()
                }) && right.is_some_and(|r| {
                    forest.node(r).label == OpLabel::CastTo(Type::F64)
                        && forest.node(r).inst().is_some()
                });

                match node.label {
                    OpLabel::Op(Opcode::Ret) => set_stmt(&mut entry, Rule::Ret),
                    OpLabel::RetValue => set_stmt(&mut entry, Rule::RetValue),
                    OpLabel::Op(Opcode::Br) => set_stmt(&mut entry, Rule::BrUncond),
                    OpLabel::CondBranch => {
                        let rule = match left.map(|l| forest.node(l).label) {
                            Some(OpLabel::SetCc) if forest.node(left.unwrap()).inst().is_some() => {
                                let sc = forest.node(left.unwrap());
                                let sc_right_const = sc
                                    .right
                                    .expand()
                                    .is_some_and(|r| forest.node(r).label == OpLabel::Constant);
                                if sc_right_const {
                                    Rule::BrCondSetCc
                                } else {
                                    Rule::BrCond
                                }
                            }
                            Some(OpLabel::Constant) => Rule::BrCondBoolConst,
                            _ => Rule::BrCondBoolReg,
                        };
                        set_stmt(&mut entry, rule);
                    }
                    OpLabel::Op(Opcode::Store) => set_stmt(&mut entry, Rule::Store),
                    OpLabel::SetCc => set_reg(
                        &mut entry,
                        if right_is_const {
                            Rule::SetCcConst
                        } else {
                            Rule::SetCc
                        },
                    ),
                    OpLabel::Op(Opcode::Add) => set_reg(
                        &mut entry,
                        if right_is_const { Rule::AddConst } else { Rule::Add },
                    ),
                    OpLabel::Op(Opcode::Sub) => set_reg(
                        &mut entry,
                        if right_is_const { Rule::SubConst } else { Rule::Sub },
                    ),
                    OpLabel::Op(Opcode::Mul) => {
                        let left_cast_to_double = left.is_some_and(|l| {
                            forest.node(l).label == OpLabel::CastTo(Type::F64)
                                && forest.node(l).inst().is_some()
                        });
                        set_reg(
                            &mut entry,
                            if both_cast_to_double {
                                Rule::MulBothCast
                            } else if left_cast_to_double && right_is_const {
                                Rule::MulBothCastConst
                            } else if right_is_const {
                                Rule::MulConst
                            } else {
                                Rule::Mul
                            },
                        )
                    }
                    OpLabel::Op(Opcode::Div) => set_reg(
                        &mut entry,
                        if right_is_const { Rule::DivConst } else { Rule::Div },
                    ),
                    OpLabel::Op(Opcode::Rem) => set_reg(
                        &mut entry,
                        if right_is_const { Rule::RemConst } else { Rule::Rem },
                    ),
                    OpLabel::Op(Opcode::And) => set_reg(
                        &mut entry,
                        if right_is_not {
                            Rule::AndNotBool
                        } else if right_is_const {
                            Rule::AndBoolConst
                        } else {
                            Rule::AndBool
                        },
                    ),
                    OpLabel::Op(Opcode::Or) => set_reg(
                        &mut entry,
                        if right_is_not {
                            Rule::OrNotBool
                        } else if right_is_const {
                            Rule::OrBoolConst
                        } else {
                            Rule::OrBool
                        },
                    ),
                    OpLabel::Op(Opcode::Xor) => set_reg(
                        &mut entry,
                        if right_is_not {
                            Rule::XorNotBool
                        } else if right_is_const {
                            Rule::XorBoolConst
                        } else {
                            Rule::XorBool
                        },
                    ),
                    OpLabel::BAnd => set_reg(
                        &mut entry,
                        if right_is_not {
                            Rule::BAndNot
                        } else if right_is_const {
                            Rule::BAndConst
                        } else {
                            Rule::BAnd
                        },
                    ),
                    OpLabel::BOr => set_reg(
                        &mut entry,
                        if right_is_not {
                            Rule::BOrNot
                        } else if right_is_const {
                            Rule::BOrConst
                        } else {
                            Rule::BOr
                        },
                    ),
                    OpLabel::BXor => set_reg(
                        &mut entry,
                        if right_is_not {
                            Rule::BXorNot
                        } else if right_is_const {
                            Rule::BXorConst
                        } else {
                            Rule::BXor
                        },
                    ),
                    OpLabel::Op(Opcode::Not) => set_reg(&mut entry, Rule::NotBool),
                    OpLabel::BNot => set_reg(&mut entry, Rule::BNot),
                    OpLabel::Op(Opcode::Shl) => set_reg(&mut entry, Rule::Shl),
                    OpLabel::Op(Opcode::Shr) => set_reg(&mut entry, Rule::Shr),
                    OpLabel::Op(Opcode::Load) | OpLabel::LoadIdx => {
                        set_reg(&mut entry, Rule::Load)
                    }
                    OpLabel::Op(Opcode::GetElementPtr) | OpLabel::GepIdx => {
                        set_reg(&mut entry, Rule::Gep)
                    }
                    OpLabel::Op(Opcode::Alloca) => set_reg(&mut entry, Rule::Alloca),
                    OpLabel::AllocaN => set_reg(&mut entry, Rule::AllocaN),
                    OpLabel::Op(Opcode::Call) => {
                        // A call is a statement and, when it returns a value,
                        // also a reg production; both resolve to one rule.
                        set_reg(&mut entry, Rule::Call);
                        set_stmt(&mut entry, Rule::Call);
                    }
                    OpLabel::Op(Opcode::Phi) => set_reg(&mut entry, Rule::Phi),
                    OpLabel::CastTo(ty) => {
                        let pool_is_signed = matches!(
                            ty,
                            Type::I8 | Type::I16 | Type::I32 | Type::I64
                        );
                        let rule = match ty {
                            Type::BOOL => Rule::ToBool,
                            Type::F32 => Rule::ToFloat,
                            Type::F64 => Rule::ToDouble,
                            _ if pool_is_signed => Rule::ToSigned,
                            _ => Rule::ToUnsigned,
                        };
                        set_reg(&mut entry, rule);
                    }
                    OpLabel::CastToPtr => set_reg(&mut entry, Rule::ToPtr),
                    OpLabel::CastToArray => set_reg(&mut entry, Rule::ToArray),
                    // Anything else would be an unrecognised construct; the
                    // selector reports it as a missing pattern.
                    _ => {}
                }
            }
        }
        let _ = func;
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CondCode, InstructionData, Signature, TypePool};

    #[test]
    fn labels_pick_const_rules() {
        let mut func = Function::new("t", Signature::new(vec![Type::I32], Type::I32));
        let pool = TypePool::new();
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
        func.append_inst(block, InstructionData::Return { value: r }, Type::VOID);

        let mut forest = InstrForest::build(&func, &pool);
        let matcher = Matcher::label(&mut forest, &func);
        let n = forest.node_for_inst(add).unwrap();
        let state = forest.node(n).state;
        assert_eq!(matcher.rule(state, Nt::Reg), Some(Rule::AddConst));
        // Chain resolution: Stmt derives through StmtFromReg to the same
        // production.
        assert_eq!(matcher.rule(state, Nt::Stmt), Some(Rule::StmtFromReg));
        assert_eq!(matcher.production(state, Nt::Stmt), Some(Rule::AddConst));
    }

    #[test]
    fn branch_on_folded_setcc_const() {
        let mut func = Function::new("t", Signature::new(vec![Type::I32], Type::VOID));
        let pool = TypePool::new();
        let x = func.args[0];
        let b0 = func.create_block();
        let b1 = func.create_block();
        let b2 = func.create_block();
        let five = func.dfg.iconst(Type::I32, 5);
        let (_, c) = func.append_inst(
            b0,
            InstructionData::SetCmp {
                cond: CondCode::Lt,
                args: [x, five],
            },
            Type::BOOL,
        );
        let (br, _) = func.append_inst(
            b0,
            InstructionData::Branch {
                cond: c,
                then_dest: b1,
                else_dest: Some(b2),
            },
            Type::VOID,
        );
        func.append_inst(b1, InstructionData::Return { value: None }, Type::VOID);
        func.append_inst(b2, InstructionData::Return { value: None }, Type::VOID);

        let mut forest = InstrForest::build(&func, &pool);
        let matcher = Matcher::label(&mut forest, &func);
        let n = forest.node_for_inst(br).unwrap();
        assert_eq!(
            matcher.rule(forest.node(n).state, Nt::Stmt),
            Some(Rule::BrCondSetCc)
        );
    }
}
