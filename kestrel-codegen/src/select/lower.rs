//! Machine-code productions for the k64 target.
//!
//! `get_instructions_by_rule` chooses the machine instructions for one tree
//! node according to the rule the matcher picked. Constants fold into
//! immediate fields when they fit and are materialised otherwise,
//! multiplication and division by powers of two strength-reduce to shifts,
//! and set-comparisons feeding branches fuse with them through a shared
//! condition-code temporary.

use crate::fx::FxHashMap;
use crate::ir::{
    Block, CondCode, FuncRef, Function, Inst, InstructionData, Opcode, Type, TypePool, Value,
    ValueDef, POINTER_BYTES,
};
use crate::isa::{MOp, TargetIsa, FP_REG, LINK_REG, SP_REG, ZERO_REG};
use crate::mir::{ArgInfo, ArgPlace, CallArgsDescriptor, Disp, MachInstData, MirFunction};
use crate::result::{CodegenError, CodegenResult};
use crate::select::burs::{Matcher, Nt, Rule};
use crate::select::forest::{InstrForest, OpLabel, TreeNode, TreeNodeKind};
use log::trace;

/// What a pass needs to know about a callee without holding its `Function`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CalleeInfo {
    /// The callee is variadic.
    pub varargs: bool,
    /// Variadic with an empty prototype.
    pub no_prototype: bool,
}

/// Per-function scratch state of the selection pass. Discarded when the
/// pass finishes.
pub struct Lowering<'a> {
    isa: &'a TargetIsa,
    pool: &'a mut TypePool,
    func: &'a mut Function,
    mir: &'a mut MirFunction,
    matcher: &'a Matcher,
    callee_info: &'a FxHashMap<FuncRef, CalleeInfo>,
    /// boolean value -> the CC temporary standing for its condition codes.
    cc_tmps: FxHashMap<Value, Value>,
}

/// A source operand: either an immediate that fits the field, or a value in
/// a register.
enum Src {
    Imm(i64),
    Reg(Value),
}

impl<'a> Lowering<'a> {
    /// Create the scratch state for one function.
    pub fn new(
        isa: &'a TargetIsa,
        pool: &'a mut TypePool,
        func: &'a mut Function,
        mir: &'a mut MirFunction,
        matcher: &'a Matcher,
        callee_info: &'a FxHashMap<FuncRef, CalleeInfo>,
    ) -> Self {
        Self {
            isa,
            pool,
            func,
            mir,
            matcher,
            callee_info,
            cc_tmps: FxHashMap::default(),
        }
    }

    /// Generate machine code for the tree rooted at `root` and all
    /// instruction nodes inside it, parents before children.
    pub fn select_for_tree(
        &mut self,
        forest: &mut InstrForest,
        root: TreeNode,
        goal: Nt,
    ) -> CodegenResult<()> {
        let state = forest.node(root).state;
        let rule = self
            .matcher
            .production(state, goal)
            .ok_or_else(|| self.no_pattern(forest, root))?;

        self.get_instructions_by_rule(forest, root, rule)?;

        // Now the sub-trees. Instruction nodes inside this tree each get
        // their own production; list nodes and leaves are walked through.
        let mut children = Vec::new();
        collect_child_insts(forest, root, &mut children);
        for child in children {
            self.select_for_tree(forest, child, Nt::Reg)?;
        }
        Ok(())
    }

    fn no_pattern(&self, forest: &InstrForest, node: TreeNode) -> CodegenError {
        let what = format!("{:?}", forest.node(node).label);
        let value = forest
            .node(node)
            .value(self.func)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "<none>".to_string());
        CodegenError::NoPattern { what, value }
    }

    // ---------------- helpers -------------------------------------------

    fn inst_of(&self, forest: &InstrForest, node: TreeNode) -> Inst {
        forest.node(node).inst().expect("instruction node expected")
    }

    fn node_value(&self, forest: &InstrForest, node: TreeNode) -> Value {
        forest
            .node(node)
            .value(self.func)
            .expect("node has no value")
    }

    fn left(&self, forest: &InstrForest, node: TreeNode) -> TreeNode {
        forest.node(node).left.expand().expect("missing left child")
    }

    fn right(&self, forest: &InstrForest, node: TreeNode) -> TreeNode {
        forest
            .node(node)
            .right
            .expand()
            .expect("missing right child")
    }

    fn new_temp(&mut self, origin: Inst, ty: Type) -> Value {
        let v = self.func.dfg.make_value(ty, ValueDef::Temp(origin));
        self.mir.inst_code[origin].temps.push(v);
        v
    }

    fn ty_of(&self, v: Value) -> Type {
        self.func.dfg.value_type(v)
    }

    /// The CC temporary keyed by a boolean value; both the set-comparison
    /// and the branch consuming it go through this cache so they name the
    /// same condition-code register.
    fn tmp_for_cc(&mut self, origin: Inst, bool_val: Value, is_fp: bool) -> Value {
        if let Some(&t) = self.cc_tmps.get(&bool_val) {
            return t;
        }
        let ty = if is_fp { Type::F32 } else { Type::I64 };
        let t = self.new_temp(origin, ty);
        self.cc_tmps.insert(bool_val, t);
        t
    }

    /// Turn an operand value into an immediate (when it is a constant that
    /// fits `op`'s field) or a register source, materialising out-of-range
    /// constants.
    fn src_operand(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        op: MOp,
        v: Value,
    ) -> Src {
        if let Some(c) = self.func.dfg.const_int(v) {
            if op.desc().fits_imm(c) {
                return Src::Imm(c);
            }
            let ty = self.ty_of(v);
            let tmp = self.new_temp(origin, ty);
            self.emit_set_const(mvec, origin, c, tmp);
            return Src::Reg(tmp);
        }
        if let Some(f) = self.func.dfg.const_float(v) {
            let ty = self.ty_of(v);
            let tmp = self.new_temp(origin, ty);
            self.emit_fp_const(mvec, origin, f, ty, tmp);
            return Src::Reg(tmp);
        }
        if let Some(disp) = self.symbol_disp(v) {
            let tmp = self.new_temp(origin, self.ty_of(v));
            self.emit_set_address(mvec, disp, tmp);
            return Src::Reg(tmp);
        }
        Src::Reg(v)
    }

    fn push_src(data: MachInstData, src: Src) -> MachInstData {
        match src {
            Src::Imm(c) => data.simm(c),
            Src::Reg(v) => data.vreg_use(v),
        }
    }

    /// Materialise an integer constant into `dest`.
    ///
    /// Small constants take one `or`, 32-bit constants a set-high/or pair,
    /// and 64-bit constants the four-instruction expansion (high pair,
    /// shift, low or). A 64-bit constant whose low word does not fit the
    /// immediate field needs a second temporary and two more instructions.
    fn emit_set_const(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        c: i64,
        dest: Value,
    ) {
        if MOp::Or.desc().fits_imm(c) {
            mvec.push(
                MachInstData::new(MOp::Or)
                    .mreg(ZERO_REG, false)
                    .simm(c)
                    .vreg_def(dest),
            );
            return;
        }
        if c == c as i32 as i64 {
            let hi = ((c as u32) >> 10) as u64;
            let lo = (c as u32 & 0x3ff) as i64;
            mvec.push(MachInstData::new(MOp::SetHi).uimm(hi).vreg_def(dest));
            if lo != 0 {
                mvec.push(
                    MachInstData::new(MOp::Or)
                        .vreg_use(dest)
                        .simm(lo)
                        .vreg_def(dest),
                );
            }
            return;
        }
        let hi32 = (c >> 32) as u32;
        let lo32 = c as u32;
        mvec.push(
            MachInstData::new(MOp::SetHi)
                .uimm((hi32 >> 10) as u64)
                .vreg_def(dest),
        );
        mvec.push(
            MachInstData::new(MOp::Or)
                .vreg_use(dest)
                .simm((hi32 & 0x3ff) as i64)
                .vreg_def(dest),
        );
        mvec.push(
            MachInstData::new(MOp::Sllx)
                .vreg_use(dest)
                .simm(32)
                .vreg_def(dest),
        );
        if MOp::Or.desc().fits_imm(lo32 as i64) {
            mvec.push(
                MachInstData::new(MOp::Or)
                    .vreg_use(dest)
                    .simm(lo32 as i64)
                    .vreg_def(dest),
            );
        } else {
            // The low word needs its own pair and a merge.
            let lo_tmp = self.new_temp(origin, Type::U64);
            mvec.push(
                MachInstData::new(MOp::SetHi)
                    .uimm((lo32 >> 10) as u64)
                    .vreg_def(lo_tmp),
            );
            if lo32 & 0x3ff != 0 {
                mvec.push(
                    MachInstData::new(MOp::Or)
                        .vreg_use(lo_tmp)
                        .simm((lo32 & 0x3ff) as i64)
                        .vreg_def(lo_tmp),
                );
            }
            mvec.push(
                MachInstData::new(MOp::Or)
                    .vreg_use(dest)
                    .vreg_use(lo_tmp)
                    .vreg_def(dest),
            );
        }
    }

    /// Materialise a floating-point constant into an FP register by building
    /// its bit pattern in an integer temporary and moving it through memory.
    fn emit_fp_const(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        c: f64,
        ty: Type,
        dest: Value,
    ) {
        let (bits, store_op, load_op) = if ty == Type::F32 {
            ((c as f32).to_bits() as i64, MOp::Stw, MOp::Ldf)
        } else {
            (c.to_bits() as i64, MOp::Stx, MOp::Lddf)
        };
        let int_tmp = self.new_temp(origin, Type::I64);
        self.emit_set_const(mvec, origin, bits, int_tmp);
        let slot = self.mir.frame.allocate_local(8, 8);
        mvec.push(
            MachInstData::new(store_op)
                .vreg_use(int_tmp)
                .mreg(FP_REG, false)
                .simm(slot as i64),
        );
        mvec.push(
            MachInstData::new(load_op)
                .mreg(FP_REG, false)
                .simm(slot as i64)
                .vreg_def(dest),
        );
    }

    /// Type-appropriate register copy: integer add-with-zero or FP move.
    fn emit_copy(&mut self, mvec: &mut Vec<MachInstData>, src: Value, dest: Value) {
        let ty = self.ty_of(dest);
        if ty == Type::F32 {
            mvec.push(MachInstData::new(MOp::FmovS).vreg_use(src).vreg_def(dest));
        } else if ty == Type::F64 {
            mvec.push(MachInstData::new(MOp::FmovD).vreg_use(src).vreg_def(dest));
        } else {
            mvec.push(
                MachInstData::new(MOp::Add)
                    .vreg_use(src)
                    .mreg(ZERO_REG, false)
                    .vreg_def(dest),
            );
        }
    }

    /// Sign-extend the low `src_bits` bits of `src` into `dest`
    /// (left-shift then arithmetic right-shift).
    fn emit_sign_extend(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        src: Value,
        src_bits: u32,
        dest: Value,
    ) {
        let src = self.reg_or_materialize(mvec, origin, src);
        let shift = 64 - src_bits as i64;
        let mid = self.new_temp(origin, self.ty_of(src));
        mvec.push(
            MachInstData::new(MOp::Sllx)
                .vreg_use(src)
                .simm(shift)
                .vreg_def(mid),
        );
        mvec.push(
            MachInstData::new(MOp::Srax)
                .vreg_use(mid)
                .simm(shift)
                .vreg_def(dest),
        );
    }

    /// Move an FP value into an integer register through a frame slot.
    /// The store and load sizes follow the integer width.
    fn emit_copy_float_to_int(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        fval: Value,
        ival: Value,
    ) {
        let fp_ty = self.ty_of(fval);
        let int_bytes = self.pool.size_of(self.ty_of(ival)).max(1);
        let store_op = if fp_ty == Type::F32 { MOp::Stf } else { MOp::Stdf };
        let load_op = if int_bytes > 4 { MOp::Ldx } else { MOp::Ldsw };
        let slot = self.mir.frame.allocate_local(8, 8);
        mvec.push(
            MachInstData::new(store_op)
                .vreg_use(fval)
                .mreg(FP_REG, false)
                .simm(slot as i64),
        );
        mvec.push(
            MachInstData::new(load_op)
                .mreg(FP_REG, false)
                .simm(slot as i64)
                .vreg_def(ival),
        );
    }

    /// Move an integer value into an FP register through a frame slot.
    fn emit_copy_int_to_float(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        ival: Value,
        fval: Value,
    ) {
        let int_bytes = self.pool.size_of(self.ty_of(ival)).max(1);
        let store_op = if int_bytes > 4 { MOp::Stx } else { MOp::Stw };
        let load_op = if self.ty_of(fval) == Type::F32 {
            MOp::Ldf
        } else {
            MOp::Lddf
        };
        let slot = self.mir.frame.allocate_local(8, 8);
        mvec.push(
            MachInstData::new(store_op)
                .vreg_use(ival)
                .mreg(FP_REG, false)
                .simm(slot as i64),
        );
        mvec.push(
            MachInstData::new(load_op)
                .mreg(FP_REG, false)
                .simm(slot as i64)
                .vreg_def(fval),
        );
    }

    /// `dest = 0 - src`.
    fn emit_int_neg(&mut self, mvec: &mut Vec<MachInstData>, src: Value, dest: Value) {
        mvec.push(
            MachInstData::new(MOp::Sub)
                .mreg(ZERO_REG, false)
                .vreg_use(src)
                .vreg_def(dest),
        );
    }

    /// Shift with sign-extension fixup: a left shift of an operand narrower
    /// than the integer register puts the result in a temporary and
    /// sign-extends it into `dest`.
    #[allow(clippy::too_many_arguments)]
    fn emit_shift(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        shift_op: MOp,
        arg: Value,
        count: Src,
        dest: Value,
    ) {
        let op_size = self.pool.size_of(self.ty_of(arg)).max(1) as u32;
        let needs_extend = matches!(shift_op, MOp::Sll | MOp::Sllx) && op_size < 8;
        let shift_dest = if needs_extend {
            self.new_temp(origin, self.ty_of(arg))
        } else {
            dest
        };
        let data = MachInstData::new(shift_op).vreg_use(arg);
        let data = Self::push_src(data, count).vreg_def(shift_dest);
        mvec.push(data);
        if needs_extend {
            self.emit_sign_extend(mvec, origin, shift_dest, 8 * op_size, dest);
        }
    }

    // ---------------- strength reduction --------------------------------

    /// Try to lower `lval * rval -> dest` exploiting a constant `rval`.
    /// Returns the approximate cost (summed minimum latency) of whatever was
    /// emitted, or the full multiply cost if nothing was.
    fn emit_mul_const(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        lval: Value,
        rval: Value,
        dest: Value,
    ) -> u32 {
        let full_cost = MOp::Mulx.desc().latency() as u32;
        let first_new = mvec.len();
        let result_ty = self.ty_of(dest);

        if self.pool.is_integral(result_ty) || self.pool.is_ptr(result_ty) {
            let Some(mut c) = self.func.dfg.const_int(rval) else {
                return full_cost;
            };
            let need_neg = c < 0;
            if need_neg {
                c = -c;
            }
            if c == 0 {
                mvec.push(
                    MachInstData::new(MOp::Add)
                        .mreg(ZERO_REG, false)
                        .mreg(ZERO_REG, false)
                        .vreg_def(dest),
                );
            } else if c == 1 {
                let lval = self.reg_or_materialize(mvec, origin, lval);
                mvec.push(
                    MachInstData::new(MOp::Add)
                        .vreg_use(lval)
                        .mreg(ZERO_REG, false)
                        .vreg_def(dest),
                );
            } else if c.count_ones() == 1 {
                let pow = c.trailing_zeros() as i64;
                let op_size = self.pool.size_of(result_ty);
                let shift_op = if op_size <= 4 { MOp::Sll } else { MOp::Sllx };
                let lval = self.reg_or_materialize(mvec, origin, lval);
                self.emit_shift(mvec, origin, shift_op, lval, Src::Imm(pow), dest);
            }
            if mvec.len() > first_new && need_neg {
                self.emit_int_neg(mvec, dest, dest);
            }
        } else if let Some(f) = self.func.dfg.const_float(rval) {
            if f.abs() == 1.0 {
                let single = result_ty == Type::F32;
                let op = if f < 0.0 {
                    if single { MOp::FnegS } else { MOp::FnegD }
                } else if single {
                    MOp::FmovS
                } else {
                    MOp::FmovD
                };
                let lval = self.reg_or_materialize(mvec, origin, lval);
                mvec.push(MachInstData::new(op).vreg_use(lval).vreg_def(dest));
            }
        }

        if mvec.len() > first_new {
            mvec[first_new..]
                .iter()
                .map(|m| m.op.desc().latency() as u32)
                .sum()
        } else {
            full_cost
        }
    }

    /// Lower a multiply, trying both operand orders when both are constant
    /// and keeping the cheaper sequence.
    fn emit_mul(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        lval: Value,
        rval: Value,
        dest: Value,
        force_op: Option<MOp>,
    ) {
        let before = mvec.len();
        if self.func.dfg.is_const(lval) && self.func.dfg.is_const(rval) {
            let mut mvec1 = Vec::new();
            let mut mvec2 = Vec::new();
            let lcost = self.emit_mul_const(&mut mvec1, origin, lval, rval, dest);
            let rcost = self.emit_mul_const(&mut mvec2, origin, rval, lval, dest);
            let chosen = if lcost <= rcost { mvec1 } else { mvec2 };
            mvec.extend(chosen);
        } else if self.func.dfg.is_const(rval) {
            self.emit_mul_const(mvec, origin, lval, rval, dest);
        } else if self.func.dfg.is_const(lval) {
            self.emit_mul_const(mvec, origin, rval, lval, dest);
        }

        if mvec.len() == before {
            let op = force_op.unwrap_or_else(|| choose_mul_op(self.pool, self.ty_of(dest)));
            let l = self.reg_or_materialize(mvec, origin, lval);
            let r = self.reg_or_materialize(mvec, origin, rval);
            mvec.push(
                MachInstData::new(op)
                    .vreg_use(l)
                    .vreg_use(r)
                    .vreg_def(dest),
            );
        }
    }

    /// Force `v` into a register, materialising constants and symbol
    /// addresses.
    fn reg_or_materialize(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        v: Value,
    ) -> Value {
        if let Some(c) = self.func.dfg.const_int(v) {
            let tmp = self.new_temp(origin, self.ty_of(v));
            self.emit_set_const(mvec, origin, c, tmp);
            tmp
        } else if let Some(f) = self.func.dfg.const_float(v) {
            let ty = self.ty_of(v);
            let tmp = self.new_temp(origin, ty);
            self.emit_fp_const(mvec, origin, f, ty, tmp);
            tmp
        } else if let Some(disp) = self.symbol_disp(v) {
            let tmp = self.new_temp(origin, self.ty_of(v));
            self.emit_set_address(mvec, disp, tmp);
            tmp
        } else {
            v
        }
    }

    fn symbol_disp(&self, v: Value) -> Option<Disp> {
        match self.func.dfg.value_def(v) {
            ValueDef::Global(g) => Some(Disp::Global(g)),
            ValueDef::FuncAddr(f) => Some(Disp::Func(f)),
            _ => None,
        }
    }

    /// Materialise the address of a symbol with a set-high/or pair; the
    /// displacement operands carry the relocation for the printer.
    fn emit_set_address(&mut self, mvec: &mut Vec<MachInstData>, disp: Disp, dest: Value) {
        mvec.push(MachInstData::new(MOp::SetHi).pcrel(disp).vreg_def(dest));
        mvec.push(
            MachInstData::new(MOp::Or)
                .vreg_use(dest)
                .pcrel(disp)
                .vreg_def(dest),
        );
    }

    /// Try to lower a division by a constant. Emits nothing when the
    /// constant offers no advantage.
    fn emit_div_const(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        lval: Value,
        rval: Value,
        dest: Value,
    ) {
        let result_ty = self.ty_of(dest);
        if self.pool.is_integral(result_ty) {
            let Some(mut c) = self.func.dfg.const_int(rval) else {
                return;
            };
            let need_neg = c < 0;
            if need_neg {
                c = -c;
            }
            let before = mvec.len();
            if c == 1 {
                let lval = self.reg_or_materialize(mvec, origin, lval);
                mvec.push(
                    MachInstData::new(MOp::Add)
                        .vreg_use(lval)
                        .mreg(ZERO_REG, false)
                        .vreg_def(dest),
                );
            } else if c.count_ones() == 1 {
                let pow = c.trailing_zeros() as i64;
                let signed = self.pool.is_signed(result_ty);
                let wide = self.pool.size_of(result_ty) > 4;
                let op = match (signed, wide) {
                    (true, true) => MOp::Srax,
                    (true, false) => MOp::Sra,
                    (false, true) => MOp::Srlx,
                    (false, false) => MOp::Srl,
                };
                let lval = self.reg_or_materialize(mvec, origin, lval);
                mvec.push(
                    MachInstData::new(op)
                        .vreg_use(lval)
                        .simm(pow)
                        .vreg_def(dest),
                );
            }
            if mvec.len() > before && need_neg {
                self.emit_int_neg(mvec, dest, dest);
            }
        } else if let Some(f) = self.func.dfg.const_float(rval) {
            if f.abs() == 1.0 {
                let single = result_ty == Type::F32;
                let op = if f < 0.0 {
                    if single { MOp::FnegS } else { MOp::FnegD }
                } else if single {
                    MOp::FmovS
                } else {
                    MOp::FmovD
                };
                let lval = self.reg_or_materialize(mvec, origin, lval);
                mvec.push(MachInstData::new(op).vreg_use(lval).vreg_def(dest));
            }
        }
    }

    // ---------------- memory addressing ---------------------------------

    /// Resolve the pointer and index vector of a memory node, folding a
    /// single-use address computation child into the access.
    fn mem_inst_args(
        &mut self,
        forest: &mut InstrForest,
        node: TreeNode,
    ) -> (Value, Vec<Value>) {
        let inst = self.inst_of(forest, node);
        let (own_ptr, own_indices): (Value, Vec<Value>) = match self.func.dfg.inst(inst) {
            InstructionData::Load { ptr, indices } => (*ptr, indices.to_vec()),
            InstructionData::Store { ptr, indices, .. } => (*ptr, indices.to_vec()),
            InstructionData::GetElementPtr { ptr, indices } => (*ptr, indices.to_vec()),
            _ => unreachable!("not a memory instruction"),
        };

        // The pointer child may be a folded address computation.
        let ptr_child = match self.func.dfg.inst(inst) {
            InstructionData::Store { .. } => forest.node(node).right.expand(),
            _ => forest.node(node).left.expand(),
        };
        if let Some(child) = ptr_child {
            // A store's right child may be a list node when the store has
            // indices of its own; the ptr is then the list's left leaf and
            // cannot be a folded address computation. Folding an address
            // computation also requires the access to have no indices of
            // its own.
            if let Some(child_inst) = forest.node(child).inst() {
                if own_indices.is_empty()
                    && matches!(
                        forest.node(child).label,
                        OpLabel::Op(Opcode::GetElementPtr) | OpLabel::GepIdx
                    )
                {
                    forest.node_mut(child).folded_into_parent = true;
                    if let InstructionData::GetElementPtr { ptr, indices } =
                        self.func.dfg.inst(child_inst)
                    {
                        return (*ptr, indices.to_vec());
                    }
                }
            }
        }
        (own_ptr, own_indices)
    }

    /// Compute the byte offset of an all-constant index vector.
    fn const_indexed_offset(&self, ptr_ty: Type, indices: &[Value]) -> Option<i64> {
        let mut offset: i64 = 0;
        let mut ty = self.pool.pointee(ptr_ty)?;
        for (n, &idx) in indices.iter().enumerate() {
            let c = self.func.dfg.const_int(idx)?;
            if n == 0 {
                offset += c * self.pool.size_of(ty) as i64;
            } else {
                match self.pool.data(ty) {
                    crate::ir::TypeData::Array { elem, .. } => {
                        offset += c * self.pool.size_of(*elem) as i64;
                        ty = *elem;
                    }
                    crate::ir::TypeData::Struct(_) => {
                        offset += self.pool.field_offset(ty, c as usize)? as i64;
                        ty = self.pool.indexed_type(ty, Some(c as u64))?;
                    }
                    _ => return None,
                }
            }
        }
        Some(offset)
    }

    /// Build the (ptr, offset) operand pair for a memory instruction and
    /// attach them to `data` in the canonical order.
    fn set_mem_operands(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        op: MOp,
        ptr: Value,
        indices: &[Value],
        mut data: MachInstData,
    ) -> MachInstData {
        let ptr_ty = self.ty_of(ptr);
        let ptr = self.reg_or_materialize(mvec, origin, ptr);
        if indices.is_empty() {
            return data.vreg_use(ptr).simm(0);
        }
        let all_const = indices.iter().all(|&i| self.func.dfg.is_const(i));
        if all_const {
            let offset = self
                .const_indexed_offset(ptr_ty, indices)
                .unwrap_or_default();
            if op.desc().fits_imm(offset) {
                return data.vreg_use(ptr).simm(offset);
            }
            let tmp = self.new_temp(origin, Type::I64);
            self.emit_set_const(mvec, origin, offset, tmp);
            return data.vreg_use(ptr).vreg_use(tmp);
        }

        // A single non-constant index (an extra leading zero is allowed).
        // Scale it by the element size and sign-extend to pointer width.
        let first_is_zero = self.func.dfg.const_int(indices[0]) == Some(0);
        let idx = indices[if first_is_zero { 1 } else { 0 }];
        let elem_ty = if first_is_zero {
            self.pool
                .pointee(ptr_ty)
                .and_then(|t| self.pool.indexed_type(t, None))
        } else {
            self.pool.pointee(ptr_ty)
        }
        .unwrap_or(Type::I8);
        let elem_size = self.pool.size_of(elem_ty).max(1);

        let addr = self.new_temp(origin, Type::U64);
        let size_const = self.func.dfg.iconst(Type::U64, elem_size as i64);
        self.emit_mul(mvec, origin, idx, size_const, addr, None);
        let ext = self.new_temp(origin, Type::U64);
        self.emit_sign_extend(mvec, origin, addr, 32, ext);
        data = data.vreg_use(ptr).vreg_use(ext);
        data
    }

    // ---------------- post-production fixups ----------------------------

    /// Substitute the forwarded operand for the node's own result in the
    /// machine code of its (possibly transitive) parent instruction node.
    fn forward_operand(
        &mut self,
        forest: &InstrForest,
        node: TreeNode,
        fwd: Value,
    ) {
        let unused = match forest.node(node).value(self.func) {
            Some(v) => v,
            None => return,
        };
        let mut parent = forest.node(node).parent.expand();
        while let Some(p) = parent {
            match forest.node(p).kind {
                TreeNodeKind::Instruction(pinst) => {
                    let mis = self.mir.inst_code[pinst].mis.clone();
                    if mis.is_empty() {
                        // Parent was itself forwarded; keep walking up.
                        parent = forest.node(p).parent.expand();
                        continue;
                    }
                    for mi in mis {
                        self.mir.mi_mut(mi).substitute_value(unused, fwd);
                    }
                    return;
                }
                _ => parent = forest.node(p).parent.expand(),
            }
        }
    }

    /// After an operation whose IR result is unsigned and narrower than an
    /// integer register, zero the upper bits of the result.
    fn mask_unsigned_result(&mut self, mvec: &mut Vec<MachInstData>, inst: Inst) {
        let Some(dest) = self.func.dfg.inst_result(inst) else {
            return;
        };
        let ty = self.ty_of(dest);
        if !self.pool.is_unsigned(ty) {
            return;
        }
        let size = self.pool.size_of(ty);
        if size >= POINTER_BYTES {
            return;
        }
        // Re-route the already-generated code into a temporary and mask it
        // into the real destination.
        let tmp = self.new_temp(inst, ty);
        for m in mvec.iter_mut() {
            m.substitute_value(dest, tmp);
        }
        match size {
            4 => {
                // The 32-bit logical right shift clears the upper word; the
                // count field holds reg-bits - 32, which the hardware wraps
                // to zero.
                mvec.push(
                    MachInstData::new(MOp::Srl)
                        .vreg_use(tmp)
                        .simm(32)
                        .vreg_def(dest),
                );
            }
            1 => {
                mvec.push(
                    MachInstData::new(MOp::And)
                        .vreg_use(tmp)
                        .simm(0xff)
                        .vreg_def(dest),
                );
            }
            _ => {
                let shift = 64 - 8 * size as i64;
                let mid = self.new_temp(inst, ty);
                mvec.push(
                    MachInstData::new(MOp::Sllx)
                        .vreg_use(tmp)
                        .simm(shift)
                        .vreg_def(mid),
                );
                mvec.push(
                    MachInstData::new(MOp::Srlx)
                        .vreg_use(mid)
                        .simm(shift)
                        .vreg_def(dest),
                );
            }
        }
    }

    /// Convert an FP value to a (signed or unsigned) integer: convert in an
    /// FP register, then copy to the integer side through memory.
    fn emit_convert_float_to_int(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        src: Value,
        dest: Value,
    ) {
        let src = self.reg_or_materialize(mvec, origin, src);
        let dest_size = self.pool.size_of(self.ty_of(dest));
        let fp_tmp_ty = if dest_size > 4 { Type::F64 } else { Type::F32 };
        let fp_tmp = self.new_temp(origin, fp_tmp_ty);
        let src_is_double = self.ty_of(src) == Type::F64;
        let op = match (src_is_double, dest_size > 4) {
            (false, false) => MOp::FstoI,
            (true, false) => MOp::FdtoI,
            (false, true) => MOp::FstoX,
            (true, true) => MOp::FdtoX,
        };
        mvec.push(MachInstData::new(op).vreg_use(src).vreg_def(fp_tmp));
        self.emit_copy_float_to_int(mvec, fp_tmp, dest);
    }

    // ---------------- the productions -----------------------------------

    /// Emit the machine instructions for `node` according to `rule`.
    pub fn get_instructions_by_rule(
        &mut self,
        forest: &mut InstrForest,
        node: TreeNode,
        rule: Rule,
    ) -> CodegenResult<()> {
        // If the code for this instruction was folded into the parent, do
        // nothing.
        if forest.node(node).folded_into_parent {
            return Ok(());
        }
        let inst = match forest.node(node).kind {
            TreeNodeKind::Instruction(inst) => inst,
            // Leaf rules produce no code of their own.
            TreeNodeKind::Const(_) | TreeNodeKind::Leaf(_) | TreeNodeKind::List => return Ok(()),
        };

        trace!("select: {} by rule {:?}", inst, rule);

        let mut mvec: Vec<MachInstData> = Vec::new();
        let mut forward: Option<Value> = None;
        let mut mask_unsigned = false;

        match rule {
            Rule::VRegLeaf | Rule::ConstLeaf | Rule::VRegList | Rule::StmtFromReg => {}

            Rule::Ret | Rule::RetValue => self.lower_ret(&mut mvec, inst),

            Rule::BrUncond => {
                let dest = self.func.dfg.successors(inst)[0];
                self.emit_branch_pair(&mut mvec, MOp::Ba, None, dest, None);
            }

            Rule::BrCondBoolConst => {
                let cond = self.branch_cond(inst).unwrap();
                let taken = if self.func.dfg.const_int(cond).unwrap_or(0) != 0 {
                    0
                } else {
                    1
                };
                let dest = self.func.dfg.successors(inst)[taken];
                self.emit_branch_pair(&mut mvec, MOp::Ba, None, dest, None);
            }

            Rule::BrCondBoolReg => {
                let cond = self.branch_cond(inst).unwrap();
                let succs = self.func.dfg.successors(inst);
                self.emit_branch_pair(
                    &mut mvec,
                    MOp::Brnz,
                    Some(Src::Reg(cond)),
                    succs[0],
                    Some(succs[1]),
                );
            }

            Rule::BrCondSetCc => self.lower_br_setcc_const(forest, node, inst, &mut mvec)?,

            Rule::BrCond => self.lower_br_setcc(forest, node, inst, &mut mvec),

            Rule::SetCc | Rule::SetCcConst => {
                self.lower_setcc(forest, node, inst, &mut mvec);
            }

            Rule::Store => {
                let (ptr, indices) = self.mem_inst_args(forest, node);
                let value = match self.func.dfg.inst(inst) {
                    InstructionData::Store { value, .. } => *value,
                    _ => unreachable!(),
                };
                let op = choose_store_op(self.pool, self.ty_of(value));
                let value = self.reg_or_materialize(&mut mvec, inst, value);
                let data = MachInstData::new(op).vreg_use(value);
                let data = self.set_mem_operands(&mut mvec, inst, op, ptr, &indices, data);
                mvec.push(data);
            }

            Rule::Load => {
                let (ptr, indices) = self.mem_inst_args(forest, node);
                let dest = self.func.dfg.inst_result(inst).unwrap();
                let op = choose_load_op(self.pool, self.ty_of(dest));
                let data = MachInstData::new(op);
                let data = self.set_mem_operands(&mut mvec, inst, op, ptr, &indices, data);
                mvec.push(data.vreg_def(dest));
            }

            Rule::Gep => {
                let (ptr, indices) = self.mem_inst_args(forest, node);
                let dest = self.func.dfg.inst_result(inst).unwrap();
                let data = MachInstData::new(MOp::Add);
                let data =
                    self.set_mem_operands(&mut mvec, inst, MOp::Add, ptr, &indices, data);
                mvec.push(data.vreg_def(dest));
            }

            Rule::Alloca => self.lower_fixed_alloca(&mut mvec, inst),
            Rule::AllocaN => self.lower_variable_alloca(&mut mvec, inst),

            Rule::Call => self.lower_call(&mut mvec, inst),

            Rule::Phi => {
                let dest = self.func.dfg.inst_result(inst).unwrap();
                let mut data = MachInstData::new(MOp::Phi).vreg_def(dest);
                if let InstructionData::Phi { args, .. } = self.func.dfg.inst(inst) {
                    for &a in args.clone().iter() {
                        if !self.func.dfg.is_const(a) {
                            data = data.vreg_use(a);
                        }
                    }
                }
                mvec.push(data);
            }

            Rule::Add | Rule::AddConst => {
                mask_unsigned = true;
                if rule == Rule::AddConst {
                    if let Some(m) = self.fp_add_sub_zero(forest, node, inst) {
                        mvec.push(m);
                    }
                }
                if mvec.is_empty() {
                    let op = choose_add_op(self.pool, self.result_ty(inst));
                    let data = self.three_operand(&mut mvec, forest, node, inst, op);
                    mvec.push(data);
                }
            }

            Rule::Sub | Rule::SubConst => {
                mask_unsigned = true;
                if rule == Rule::SubConst {
                    if let Some(m) = self.fp_add_sub_zero(forest, node, inst) {
                        mvec.push(m);
                    }
                }
                if mvec.is_empty() {
                    let op = choose_sub_op(self.pool, self.result_ty(inst));
                    let data = self.three_operand(&mut mvec, forest, node, inst, op);
                    mvec.push(data);
                }
            }

            Rule::Mul | Rule::MulConst | Rule::MulBothCast | Rule::MulBothCastConst => {
                mask_unsigned = true;
                let force = if matches!(rule, Rule::MulBothCast | Rule::MulBothCastConst)
                    && self.both_children_float_to_double(forest, node)
                {
                    Some(MOp::FsmulD)
                } else {
                    None
                };
                let (l, r) = self.binary_args(inst);
                let dest = self.func.dfg.inst_result(inst).unwrap();
                self.emit_mul(&mut mvec, inst, l, r, dest, force);
            }

            Rule::Div | Rule::DivConst => {
                mask_unsigned = true;
                let (l, r) = self.binary_args(inst);
                let dest = self.func.dfg.inst_result(inst).unwrap();
                self.emit_div_const(&mut mvec, inst, l, r, dest);
                if mvec.is_empty() {
                    let op = choose_div_op(self.pool, self.result_ty(inst));
                    let data = self.three_operand(&mut mvec, forest, node, inst, op);
                    mvec.push(data);
                }
            }

            Rule::Rem | Rule::RemConst => {
                mask_unsigned = true;
                self.lower_rem(&mut mvec, inst);
            }

            Rule::AndBool | Rule::AndBoolConst | Rule::BAnd | Rule::BAndConst => {
                let data = self.three_operand(&mut mvec, forest, node, inst, MOp::And);
                mvec.push(data);
            }
            Rule::OrBool | Rule::OrBoolConst | Rule::BOr | Rule::BOrConst => {
                let data = self.three_operand(&mut mvec, forest, node, inst, MOp::Or);
                mvec.push(data);
            }
            Rule::XorBool | Rule::XorBoolConst | Rule::BXor | Rule::BXorConst => {
                let data = self.three_operand(&mut mvec, forest, node, inst, MOp::Xor);
                mvec.push(data);
            }

            Rule::AndNotBool | Rule::BAndNot => {
                self.lower_op_with_not(forest, node, inst, MOp::Andn, &mut mvec)
            }
            Rule::OrNotBool | Rule::BOrNot => {
                self.lower_op_with_not(forest, node, inst, MOp::Orn, &mut mvec)
            }
            Rule::XorNotBool | Rule::BXorNot => {
                self.lower_op_with_not(forest, node, inst, MOp::Xnor, &mut mvec)
            }

            Rule::NotBool | Rule::BNot => {
                let arg = match self.func.dfg.inst(inst) {
                    InstructionData::Unary { arg, .. } => *arg,
                    _ => unreachable!(),
                };
                let dest = self.func.dfg.inst_result(inst).unwrap();
                let arg = self.reg_or_materialize(&mut mvec, inst, arg);
                mvec.push(
                    MachInstData::new(MOp::Xnor)
                        .vreg_use(arg)
                        .mreg(ZERO_REG, false)
                        .vreg_def(dest),
                );
            }

            Rule::Shl => {
                let (l, r) = self.binary_args(inst);
                let dest = self.func.dfg.inst_result(inst).unwrap();
                let wide = self.pool.size_of(self.ty_of(l)) > 4;
                let op = if wide { MOp::Sllx } else { MOp::Sll };
                let count = self.src_operand(&mut mvec, inst, op, r);
                let l = self.reg_or_materialize(&mut mvec, inst, l);
                self.emit_shift(&mut mvec, inst, op, l, count, dest);
            }

            Rule::Shr => {
                let (l, r) = self.binary_args(inst);
                let dest = self.func.dfg.inst_result(inst).unwrap();
                let ty = self.ty_of(l);
                let wide = self.pool.size_of(ty) > 4;
                let op = match (self.pool.is_signed(ty) || self.pool.is_ptr(ty), wide) {
                    (true, true) => MOp::Srax,
                    (true, false) => MOp::Sra,
                    (false, true) => MOp::Srlx,
                    (false, false) => MOp::Srl,
                };
                let count = self.src_operand(&mut mvec, inst, op, r);
                let l = self.reg_or_materialize(&mut mvec, inst, l);
                let data = MachInstData::new(op).vreg_use(l);
                mvec.push(Self::push_src(data, count).vreg_def(dest));
            }

            Rule::ToBool | Rule::ToPtr | Rule::ToArray => {
                forward = Some(self.cast_arg(inst));
            }

            Rule::ToUnsigned => {
                let src = self.cast_arg(inst);
                let src_ty = self.ty_of(src);
                let dest = self.func.dfg.inst_result(inst).unwrap();
                if self.pool.is_integral(src_ty) || self.pool.is_ptr(src_ty) {
                    let op_size = self.pool.size_of(src_ty);
                    let dest_size = self.pool.size_of(self.ty_of(dest));
                    if op_size > dest_size
                        || (self.pool.is_signed(src_ty) && dest_size < POINTER_BYTES)
                    {
                        let mask = (1u64 << (8 * dest_size)).wrapping_sub(1);
                        self.emit_and_mask(&mut mvec, inst, src, mask, dest);
                    } else {
                        forward = Some(src);
                    }
                } else {
                    self.emit_convert_float_to_int(&mut mvec, inst, src, dest);
                    mask_unsigned = true;
                }
            }

            Rule::ToSigned => {
                let src = self.cast_arg(inst);
                let src_ty = self.ty_of(src);
                let dest = self.func.dfg.inst_result(inst).unwrap();
                if self.pool.is_integral(src_ty) || self.pool.is_ptr(src_ty) {
                    let op_size = self.pool.size_of(src_ty);
                    let dest_size = self.pool.size_of(self.ty_of(dest));
                    if op_size < dest_size
                        || (op_size == dest_size && op_size == POINTER_BYTES)
                    {
                        forward = Some(src);
                    } else {
                        let mut ext_src = src;
                        let mut ext_bits = 8 * op_size as u32;
                        if op_size > dest_size {
                            let mask = (1u64 << (8 * dest_size)).wrapping_sub(1);
                            let masked = self.new_temp(inst, self.ty_of(dest));
                            self.emit_and_mask(&mut mvec, inst, src, mask, masked);
                            ext_src = masked;
                            ext_bits = 8 * dest_size as u32;
                        }
                        self.emit_sign_extend(&mut mvec, inst, ext_src, ext_bits, dest);
                    }
                } else {
                    self.emit_convert_float_to_int(&mut mvec, inst, src, dest);
                }
            }

            Rule::ToFloat | Rule::ToDouble => {
                self.lower_to_float(forest, node, inst, &mut mvec, &mut forward);
            }
        }

        if let Some(fwd) = forward {
            debug_assert!(mvec.is_empty());
            if forest.node(node).parent.is_some() {
                self.intern_mvec(inst, mvec);
                self.forward_operand(forest, node, fwd);
                return Ok(());
            } else {
                let dest = self.func.dfg.inst_result(inst).unwrap();
                let src = self.reg_or_materialize(&mut mvec, inst, fwd);
                self.emit_copy(&mut mvec, src, dest);
            }
        }

        if mask_unsigned {
            self.mask_unsigned_result(&mut mvec, inst);
        }

        self.intern_mvec(inst, mvec);
        Ok(())
    }

    fn intern_mvec(&mut self, inst: Inst, mvec: Vec<MachInstData>) {
        for data in mvec {
            let mi = self.mir.create(data);
            self.mir.inst_code[inst].mis.push(mi);
        }
    }

    fn result_ty(&self, inst: Inst) -> Type {
        self.func
            .dfg
            .inst_result(inst)
            .map(|v| self.ty_of(v))
            .unwrap_or(Type::VOID)
    }

    fn binary_args(&self, inst: Inst) -> (Value, Value) {
        match self.func.dfg.inst(inst) {
            InstructionData::Binary { args, .. } | InstructionData::SetCmp { args, .. } => {
                (args[0], args[1])
            }
            _ => unreachable!("binary instruction expected"),
        }
    }

    fn cast_arg(&self, inst: Inst) -> Value {
        match self.func.dfg.inst(inst) {
            InstructionData::Unary { arg, .. } => *arg,
            _ => unreachable!("cast expected"),
        }
    }

    fn branch_cond(&self, inst: Inst) -> Option<Value> {
        match self.func.dfg.inst(inst) {
            InstructionData::Branch { cond, .. } => *cond,
            _ => None,
        }
    }

    /// Build `op lhs, rhs, dest` from the node's children, folding a
    /// constant right operand into the immediate field.
    fn three_operand(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        _forest: &InstrForest,
        _node: TreeNode,
        inst: Inst,
        op: MOp,
    ) -> MachInstData {
        let (l, r) = self.binary_args(inst);
        let dest = self.func.dfg.inst_result(inst).unwrap();
        let l = self.reg_or_materialize(mvec, inst, l);
        let r = self.src_operand(mvec, inst, op, r);
        let data = MachInstData::new(op).vreg_use(l);
        Self::push_src(data, r).vreg_def(dest)
    }

    /// FP add/sub with a ±0 constant folds to an FP move.
    fn fp_add_sub_zero(
        &mut self,
        _forest: &InstrForest,
        _node: TreeNode,
        inst: Inst,
    ) -> Option<MachInstData> {
        let (l, r) = self.binary_args(inst);
        if self.func.dfg.is_const(l) {
            return None;
        }
        let c = self.func.dfg.const_float(r)?;
        if c != 0.0 {
            return None;
        }
        let dest = self.func.dfg.inst_result(inst)?;
        let op = if self.ty_of(dest) == Type::F32 {
            MOp::FmovS
        } else {
            MOp::FmovD
        };
        Some(MachInstData::new(op).vreg_use(l).vreg_def(dest))
    }

    fn emit_and_mask(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        origin: Inst,
        src: Value,
        mask: u64,
        dest: Value,
    ) {
        let src = self.reg_or_materialize(mvec, origin, src);
        if MOp::And.desc().fits_imm(mask as i64) {
            mvec.push(
                MachInstData::new(MOp::And)
                    .vreg_use(src)
                    .simm(mask as i64)
                    .vreg_def(dest),
            );
        } else {
            let tmp = self.new_temp(origin, Type::U64);
            self.emit_set_const(mvec, origin, mask as i64, tmp);
            mvec.push(
                MachInstData::new(MOp::And)
                    .vreg_use(src)
                    .vreg_use(tmp)
                    .vreg_def(dest),
            );
        }
    }

    fn lower_op_with_not(
        &mut self,
        forest: &mut InstrForest,
        node: TreeNode,
        inst: Inst,
        op: MOp,
        mvec: &mut Vec<MachInstData>,
    ) {
        // Use the argument of the NOT as the second argument and mark the
        // NOT node so no code is generated for it.
        let not_node = self.right(forest, node);
        let not_inst = self.inst_of(forest, not_node);
        forest.node_mut(not_node).folded_into_parent = true;
        let not_arg = match self.func.dfg.inst(not_inst) {
            InstructionData::Unary { arg, .. } => *arg,
            _ => unreachable!("not expected"),
        };
        let (l, _) = self.binary_args(inst);
        let dest = self.func.dfg.inst_result(inst).unwrap();
        let l = self.reg_or_materialize(mvec, inst, l);
        let not_arg = self.reg_or_materialize(mvec, inst, not_arg);
        mvec.push(
            MachInstData::new(op)
                .vreg_use(l)
                .vreg_use(not_arg)
                .vreg_def(dest),
        );
    }

    fn both_children_float_to_double(&self, forest: &InstrForest, node: TreeNode) -> bool {
        let check = |n: Option<TreeNode>| {
            n.and_then(|n| forest.node(n).inst())
                .map(|i| {
                    let arg = match self.func.dfg.inst(i) {
                        InstructionData::Unary {
                            opcode: Opcode::Cast,
                            arg,
                        } => *arg,
                        _ => return false,
                    };
                    self.ty_of(arg) == Type::F32
                })
                .unwrap_or(false)
        };
        check(forest.node(node).left.expand()) && check(forest.node(node).right.expand())
    }

    // ---------------- compound productions ------------------------------

    fn emit_branch_pair(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        op: MOp,
        cond_src: Option<Src>,
        taken: Block,
        not_taken: Option<Block>,
    ) {
        let mut data = MachInstData::new(op);
        if let Some(src) = cond_src {
            data = Self::push_src(data, src);
        }
        mvec.push(data.pcrel(Disp::Block(taken)));
        mvec.push(MachInstData::new(MOp::Nop));
        if let Some(else_dest) = not_taken {
            mvec.push(MachInstData::new(MOp::Ba).pcrel(Disp::Block(else_dest)));
            mvec.push(MachInstData::new(MOp::Nop));
        }
    }

    /// Conditional branch whose condition is a set-comparison against a
    /// constant. A zero constant uses the branch-on-register forms and
    /// folds the comparison away entirely; any other constant goes through
    /// the subtract-cc path.
    fn lower_br_setcc_const(
        &mut self,
        forest: &mut InstrForest,
        node: TreeNode,
        inst: Inst,
        mvec: &mut Vec<MachInstData>,
    ) -> CodegenResult<()> {
        let setcc_node = self.left(forest, node);
        let setcc_inst = self.inst_of(forest, setcc_node);
        let const_node = self.right(forest, setcc_node);
        let const_val = self.node_value(forest, const_node);

        let is_int_zero = {
            let ty = self.ty_of(const_val);
            (self.pool.is_integral(ty) || self.pool.is_ptr(ty))
                && self.func.dfg.const_int(const_val) == Some(0)
        };

        if is_int_zero {
            forest.node_mut(setcc_node).folded_into_parent = true;
            let cond = match self.func.dfg.inst(setcc_inst) {
                InstructionData::SetCmp { cond, .. } => *cond,
                _ => unreachable!(),
            };
            let op = choose_br_on_reg_op(cond);
            let (sl, _) = self.binary_args(setcc_inst);
            let succs = self.func.dfg.successors(inst);
            let sl = self.reg_or_materialize(mvec, inst, sl);
            self.emit_branch_pair(mvec, op, Some(Src::Reg(sl)), succs[0], Some(succs[1]));
            Ok(())
        } else {
            self.lower_br_setcc(forest, node, inst, mvec);
            Ok(())
        }
    }

    /// Conditional branch on a set-comparison through the shared CC
    /// temporary. The comparison itself is a separate production; both
    /// sides pull the same temporary out of the per-function cache.
    fn lower_br_setcc(
        &mut self,
        forest: &mut InstrForest,
        node: TreeNode,
        inst: Inst,
        mvec: &mut Vec<MachInstData>,
    ) {
        let setcc_node = self.left(forest, node);
        let setcc_inst = self.inst_of(forest, setcc_node);
        let (cond, args) = match self.func.dfg.inst(setcc_inst) {
            InstructionData::SetCmp { cond, args } => (*cond, *args),
            _ => unreachable!(),
        };
        let operand_ty = self.ty_of(args[0]);
        let is_fp = self.pool.is_float(operand_ty);
        let signed = self.pool.is_signed(operand_ty) || self.pool.is_ptr(operand_ty);
        let op = if is_fp {
            choose_fbcc_op(cond)
        } else {
            choose_bcc_op(cond, signed)
        };

        let setcc_val = self.func.dfg.inst_result(setcc_inst).unwrap();
        let cc = self.tmp_for_cc(setcc_inst, setcc_val, is_fp);
        let succs = self.func.dfg.successors(inst);
        mvec.push(
            MachInstData::new(op)
                .cc(cc, false)
                .pcrel(Disp::Block(succs[0])),
        );
        mvec.push(MachInstData::new(MOp::Nop));
        mvec.push(MachInstData::new(MOp::Ba).pcrel(Disp::Block(succs[1])));
        mvec.push(MachInstData::new(MOp::Nop));
    }

    /// A set-comparison: subtract-cc (or FP compare) defining the shared CC
    /// temporary, plus boolean materialisation when the result is used by
    /// anything but branches.
    fn lower_setcc(
        &mut self,
        forest: &mut InstrForest,
        node: TreeNode,
        inst: Inst,
        mvec: &mut Vec<MachInstData>,
    ) {
        let (cond, args) = match self.func.dfg.inst(inst) {
            InstructionData::SetCmp { cond, args } => (*cond, *args),
            _ => unreachable!(),
        };
        let dest = self.func.dfg.inst_result(inst).unwrap();
        let is_fp = self.pool.is_float(self.ty_of(args[0]));

        let parent_exists = forest.node(node).parent.is_some();
        let keep_bool = !parent_exists || !self.all_uses_are_branches(inst);
        let sub_val_is_bool = cond == CondCode::Ne;
        let keep_sub = keep_bool && sub_val_is_bool;
        let compute_bool = keep_bool && !sub_val_is_bool;

        let cc = self.tmp_for_cc(inst, dest, is_fp);

        if !is_fp {
            let l = self.reg_or_materialize(mvec, inst, args[0]);
            let r = self.src_operand(mvec, inst, MOp::SubCc, args[1]);
            let mut data = MachInstData::new(MOp::SubCc).vreg_use(l);
            data = Self::push_src(data, r);
            data = if keep_sub {
                data.vreg_def(dest)
            } else {
                data.mreg(ZERO_REG, true)
            };
            mvec.push(data.cc(cc, true));
            if compute_bool {
                // Clear the register, then conditionally move a one in.
                mvec.push(MachInstData::new(MOp::SetHi).uimm(0).vreg_def(dest));
                mvec.push(
                    MachInstData::new(choose_movcc_op(cond))
                        .cc(cc, false)
                        .simm(1)
                        .vreg_def_use(dest),
                );
            }
        } else {
            let l = self.reg_or_materialize(mvec, inst, args[0]);
            let r = self.reg_or_materialize(mvec, inst, args[1]);
            let op = if self.ty_of(args[0]) == Type::F32 {
                MOp::FcmpS
            } else {
                MOp::FcmpD
            };
            mvec.push(
                MachInstData::new(op)
                    .cc(cc, true)
                    .vreg_use(l)
                    .vreg_use(r),
            );
            if compute_bool {
                mvec.push(MachInstData::new(MOp::SetHi).uimm(0).vreg_def(dest));
                mvec.push(
                    MachInstData::new(choose_movfcc_op(cond))
                        .cc(cc, false)
                        .simm(1)
                        .vreg_def_use(dest),
                );
            }
        }
    }

    fn all_uses_are_branches(&self, setcc: Inst) -> bool {
        let Some(result) = self.func.dfg.inst_result(setcc) else {
            return true;
        };
        self.func
            .dfg
            .uses(result)
            .iter()
            .all(|u| self.func.dfg.opcode(u.inst) == Opcode::Br)
    }

    /// Remainder as `a - (a / b) * b` over three instructions.
    fn lower_rem(&mut self, mvec: &mut Vec<MachInstData>, inst: Inst) {
        let (l, r) = self.binary_args(inst);
        let dest = self.func.dfg.inst_result(inst).unwrap();
        let ty = self.result_ty(inst);
        let quot = self.new_temp(inst, ty);
        let prod = self.new_temp(inst, ty);

        let div_op = choose_div_op(self.pool, ty);
        let l = self.reg_or_materialize(mvec, inst, l);
        let r_src = self.src_operand(mvec, inst, div_op, r);
        let data = MachInstData::new(div_op).vreg_use(l);
        mvec.push(Self::push_src(data, r_src).vreg_def(quot));

        let mul_op = choose_mul_op(self.pool, ty);
        let r_src = self.src_operand(mvec, inst, mul_op, r);
        let data = MachInstData::new(mul_op).vreg_use(quot);
        mvec.push(Self::push_src(data, r_src).vreg_def(prod));

        let sub_op = choose_sub_op(self.pool, ty);
        mvec.push(
            MachInstData::new(sub_op)
                .vreg_use(l)
                .vreg_use(prod)
                .vreg_def(dest),
        );
    }

    fn lower_ret(&mut self, mvec: &mut Vec<MachInstData>, inst: Inst) {
        let ret_addr = {
            let ptr_ty = self.pool.ptr_to(Type::VOID);
            let v = self.new_temp(inst, ptr_ty);
            self.mir.pinned_regs.insert(v, LINK_REG);
            v
        };
        let mut data = MachInstData::new(MOp::RetJ).vreg_use(ret_addr).simm(8);
        if let InstructionData::Return { value: Some(v) } = self.func.dfg.inst(inst) {
            let v = *v;
            let v = self.reg_or_materialize(mvec, inst, v);
            data.add_implicit_ref(v, false);
        }
        mvec.push(data);
        mvec.push(MachInstData::new(MOp::Nop));
    }

    fn lower_fixed_alloca(&mut self, mvec: &mut Vec<MachInstData>, inst: Inst) {
        let dest = self.func.dfg.inst_result(inst).unwrap();
        let elem_ty = self
            .pool
            .pointee(self.ty_of(dest))
            .unwrap_or(Type::I8);
        let size = self.pool.size_of(elem_ty).max(1);
        let align = self.pool.align_of(elem_ty);
        let offset = self.mir.frame.allocate_local(size, align);
        if MOp::Add.desc().fits_imm(offset as i64) {
            mvec.push(
                MachInstData::new(MOp::Add)
                    .mreg(FP_REG, false)
                    .simm(offset as i64)
                    .vreg_def(dest),
            );
        } else {
            let count = self.func.dfg.iconst(Type::U64, 1);
            self.emit_variable_alloca(mvec, inst, count, size, dest);
        }
    }

    fn lower_variable_alloca(&mut self, mvec: &mut Vec<MachInstData>, inst: Inst) {
        let dest = self.func.dfg.inst_result(inst).unwrap();
        let count = match self.func.dfg.inst(inst) {
            InstructionData::Alloca { count: Some(c) } => *c,
            _ => unreachable!(),
        };
        let elem_ty = self.pool.pointee(self.ty_of(dest)).unwrap_or(Type::I8);
        let size = self.pool.size_of(elem_ty).max(1);
        self.emit_variable_alloca(mvec, inst, count, size, dest);
    }

    /// mul count, size -> t; sub sp, t -> sp; add sp, dyn-offset -> dest.
    fn emit_variable_alloca(
        &mut self,
        mvec: &mut Vec<MachInstData>,
        inst: Inst,
        count: Value,
        elem_size: u64,
        dest: Value,
    ) {
        let size_const = self.func.dfg.iconst(Type::U64, elem_size as i64);
        let prod = self.new_temp(inst, Type::U64);
        self.emit_mul(mvec, inst, count, size_const, prod, None);
        mvec.push(
            MachInstData::new(MOp::Sub)
                .mreg(SP_REG, false)
                .vreg_use(prod)
                .mreg(SP_REG, true),
        );
        mvec.push(
            MachInstData::new(MOp::Add)
                .mreg(SP_REG, false)
                .simm(self.isa.dynamic_area_offset() as i64)
                .vreg_def(dest),
        );
    }

    fn lower_call(&mut self, mvec: &mut Vec<MachInstData>, inst: Inst) {
        let (callee, args) = match self.func.dfg.inst(inst) {
            InstructionData::Call { callee, args } => (*callee, args.clone()),
            _ => unreachable!(),
        };
        let direct_callee = match self.func.dfg.value_def(callee) {
            ValueDef::FuncAddr(fr) => Some(fr),
            _ => None,
        };
        let info = direct_callee
            .and_then(|fr| self.callee_info.get(&fr).copied())
            .unwrap_or_default();

        // The return-address temporary is pinned to the link register.
        let ret_addr = {
            let ptr_ty = self.pool.ptr_to(Type::VOID);
            let v = self.new_temp(inst, ptr_ty);
            self.mir.pinned_regs.insert(v, LINK_REG);
            v
        };

        let mut call = match direct_callee {
            Some(fr) => MachInstData::new(MOp::Call).pcrel(Disp::Func(fr)),
            None => {
                let callee = self.reg_or_materialize(mvec, inst, callee);
                MachInstData::new(MOp::Jmpl)
                    .vreg_use(callee)
                    .simm(0)
                    .vreg_def(ret_addr)
            }
        };

        // Argument placement, recorded in the descriptor. Float arguments to
        // a variadic callee in the first integer-register positions are also
        // copied to the integer side.
        let mut arg_infos = Vec::with_capacity(args.len());
        let mut copy_code: Vec<MachInstData> = Vec::new();
        for (i, &arg) in args.iter().enumerate() {
            let ty = self.ty_of(arg);
            let is_float = self.pool.is_float(ty);
            let mut arg_copy = None;
            let place = if !is_float {
                match self.isa.regs.int_arg_color(i) {
                    Some(color) => ArgPlace::IntReg(color),
                    None => ArgPlace::Stack,
                }
            } else if info.varargs {
                if i < self.isa.regs.num_int_arg_regs {
                    let int_tmp = self.new_temp(inst, Type::I64);
                    self.emit_copy_float_to_int(&mut copy_code, arg, int_tmp);
                    arg_copy = Some(int_tmp);
                    if info.no_prototype {
                        ArgPlace::FloatAndIntReg {
                            fp: self.isa.regs.float_arg_color(i).unwrap_or(0),
                            int: i,
                        }
                    } else {
                        ArgPlace::IntReg(i)
                    }
                } else {
                    ArgPlace::Stack
                }
            } else {
                match self.isa.regs.float_arg_color(i) {
                    Some(color) => ArgPlace::FloatReg(color),
                    None => ArgPlace::Stack,
                }
            };
            if let Some(copy) = arg_copy {
                call.add_implicit_ref(copy, false);
            }
            let arg = self.reg_or_materialize(&mut copy_code, inst, arg);
            call.add_implicit_ref(arg, false);
            arg_infos.push(ArgInfo { place, arg_copy });
        }
        mvec.extend(copy_code);

        let ret_val = self.func.dfg.inst_result(inst);
        if let Some(rv) = ret_val {
            call.add_implicit_ref(rv, true);
        }
        if direct_callee.is_some() {
            call.add_implicit_ref(ret_addr, true);
        }

        call.call_desc = Some(Box::new(CallArgsDescriptor {
            args: arg_infos,
            ret_addr,
            ret_val,
            is_varargs: info.varargs,
            no_prototype: info.no_prototype,
        }));
        mvec.push(call);
        mvec.push(MachInstData::new(MOp::Nop));
    }

    fn lower_to_float(
        &mut self,
        forest: &mut InstrForest,
        node: TreeNode,
        inst: Inst,
        mvec: &mut Vec<MachInstData>,
        forward: &mut Option<Value>,
    ) {
        // If the user is translated as the single-precision-pair multiply,
        // the cast is unnecessary.
        if let Some(parent) = parent_inst_node(forest, node) {
            let pinst = forest.node(parent).inst().unwrap();
            let pmis = &self.mir.inst_code[pinst].mis;
            if pmis.is_empty() || self.mir.op(pmis[0]) == MOp::FsmulD {
                *forward = Some(self.cast_arg(inst));
                return;
            }
        }

        let src = self.cast_arg(inst);
        let src_ty = self.ty_of(src);
        let dest = self.func.dfg.inst_result(inst).unwrap();
        let dest_ty = self.ty_of(dest);

        if src_ty == dest_ty {
            *forward = Some(src);
            return;
        }
        if self.pool.is_float(src_ty) {
            let op = if dest_ty == Type::F64 { MOp::FstoD } else { MOp::FdtoS };
            let src = self.reg_or_materialize(mvec, inst, src);
            mvec.push(MachInstData::new(op).vreg_use(src).vreg_def(dest));
            return;
        }

        // Integer source: copy to the FP side through memory, then convert
        // in the FP registers. Sources of four bytes or less travel as
        // 32-bit values, larger ones as 64-bit.
        let src_size = self.pool.size_of(src_ty).max(1);
        let bits_ty = if src_size <= 4 { Type::F32 } else { Type::F64 };
        let bits_tmp = self.new_temp(inst, bits_ty);
        let src = self.reg_or_materialize(mvec, inst, src);
        self.emit_copy_int_to_float(mvec, src, bits_tmp);
        let op = match (src_size <= 4, dest_ty == Type::F32) {
            (true, true) => MOp::FitoS,
            (true, false) => MOp::FitoD,
            (false, true) => MOp::FxtoS,
            (false, false) => MOp::FxtoD,
        };
        mvec.push(MachInstData::new(op).vreg_use(bits_tmp).vreg_def(dest));
    }
}

/// Walk upward to the closest parent that is an instruction node.
fn parent_inst_node(forest: &InstrForest, node: TreeNode) -> Option<TreeNode> {
    let mut p = forest.node(node).parent.expand();
    while let Some(n) = p {
        if forest.node(n).inst().is_some() {
            return Some(n);
        }
        p = forest.node(n).parent.expand();
    }
    None
}

/// Collect the instruction nodes directly below `node` (crossing list nodes
/// but not other instruction nodes).
fn collect_child_insts(forest: &InstrForest, node: TreeNode, out: &mut Vec<TreeNode>) {
    let walk = |child: Option<TreeNode>, out: &mut Vec<TreeNode>| {
        if let Some(c) = child {
            match forest.node(c).kind {
                TreeNodeKind::Instruction(_) => out.push(c),
                TreeNodeKind::List => collect_child_insts(forest, c, out),
                _ => {}
            }
        }
    };
    walk(forest.node(node).left.expand(), out);
    walk(forest.node(node).right.expand(), out);
}

// ---------------- opcode choosers ---------------------------------------

fn choose_load_op(pool: &TypePool, ty: Type) -> MOp {
    match pool.size_of(ty) {
        1 => {
            if pool.is_signed(ty) {
                MOp::Ldsb
            } else {
                MOp::Ldub
            }
        }
        2 => {
            if pool.is_signed(ty) {
                MOp::Ldsh
            } else {
                MOp::Lduh
            }
        }
        4 => {
            if ty == Type::F32 {
                MOp::Ldf
            } else if pool.is_signed(ty) {
                MOp::Ldsw
            } else {
                MOp::Lduw
            }
        }
        _ => {
            if ty == Type::F64 {
                MOp::Lddf
            } else {
                MOp::Ldx
            }
        }
    }
}

fn choose_store_op(pool: &TypePool, ty: Type) -> MOp {
    match pool.size_of(ty) {
        1 => MOp::Stb,
        2 => MOp::Sth,
        4 => {
            if ty == Type::F32 {
                MOp::Stf
            } else {
                MOp::Stw
            }
        }
        _ => {
            if ty == Type::F64 {
                MOp::Stdf
            } else {
                MOp::Stx
            }
        }
    }
}

fn choose_add_op(pool: &TypePool, ty: Type) -> MOp {
    if ty == Type::F32 {
        MOp::FaddS
    } else if ty == Type::F64 {
        MOp::FaddD
    } else {
        let _ = pool;
        MOp::Add
    }
}

fn choose_sub_op(pool: &TypePool, ty: Type) -> MOp {
    if ty == Type::F32 {
        MOp::FsubS
    } else if ty == Type::F64 {
        MOp::FsubD
    } else {
        let _ = pool;
        MOp::Sub
    }
}

fn choose_mul_op(pool: &TypePool, ty: Type) -> MOp {
    if ty == Type::F32 {
        MOp::FmulS
    } else if ty == Type::F64 {
        MOp::FmulD
    } else {
        let _ = pool;
        MOp::Mulx
    }
}

fn choose_div_op(pool: &TypePool, ty: Type) -> MOp {
    if ty == Type::F32 {
        MOp::FdivS
    } else if ty == Type::F64 {
        MOp::FdivD
    } else if pool.is_signed(ty) {
        MOp::Sdivx
    } else {
        MOp::Udivx
    }
}

fn choose_br_on_reg_op(cond: CondCode) -> MOp {
    match cond {
        CondCode::Eq => MOp::Brz,
        CondCode::Ne => MOp::Brnz,
        CondCode::Lt => MOp::Brlz,
        CondCode::Le => MOp::Brlez,
        CondCode::Gt => MOp::Brgz,
        CondCode::Ge => MOp::Brgez,
    }
}

fn choose_bcc_op(cond: CondCode, signed: bool) -> MOp {
    if signed {
        match cond {
            CondCode::Eq => MOp::Be,
            CondCode::Ne => MOp::Bne,
            CondCode::Lt => MOp::Bl,
            CondCode::Le => MOp::Ble,
            CondCode::Gt => MOp::Bg,
            CondCode::Ge => MOp::Bge,
        }
    } else {
        match cond {
            CondCode::Eq => MOp::Be,
            CondCode::Ne => MOp::Bne,
            CondCode::Lt => MOp::Blu,
            CondCode::Le => MOp::Bleu,
            CondCode::Gt => MOp::Bgu,
            CondCode::Ge => MOp::Bgeu,
        }
    }
}

fn choose_fbcc_op(cond: CondCode) -> MOp {
    match cond {
        CondCode::Eq => MOp::Fbe,
        CondCode::Ne => MOp::Fbne,
        CondCode::Lt => MOp::Fbl,
        CondCode::Le => MOp::Fble,
        CondCode::Gt => MOp::Fbg,
        CondCode::Ge => MOp::Fbge,
    }
}

fn choose_movcc_op(cond: CondCode) -> MOp {
    match cond {
        CondCode::Eq => MOp::MovE,
        CondCode::Lt => MOp::MovL,
        CondCode::Le => MOp::MovLe,
        CondCode::Gt => MOp::MovG,
        CondCode::Ge => MOp::MovGe,
        CondCode::Ne => unreachable!("setne reuses the subtract result"),
    }
}

fn choose_movfcc_op(cond: CondCode) -> MOp {
    match cond {
        CondCode::Eq => MOp::MovFe,
        CondCode::Ne => MOp::MovFne,
        CondCode::Lt => MOp::MovFl,
        CondCode::Le => MOp::MovFle,
        CondCode::Gt => MOp::MovFg,
        CondCode::Ge => MOp::MovFge,
    }
}
