//! Per-function compilation state and the bytecode emitter.
//!
//! A [`FuncState`] owns the [`Proto`] under construction and every piece of
//! bookkeeping the single-pass compiler needs: the symbolic operand-stack
//! level, the active-local stack, upvalue descriptors, break frames, and the
//! jump patch lists.
//!
//! Patch lists are the subtle part. A forward jump is emitted with the
//! [`NO_JUMP`] sentinel in its offset field; until it is resolved, that
//! field threads an intrusive singly-linked list of all jumps waiting for
//! the same target (each entry encodes the pc of the previous entry the way
//! a resolved offset encodes its destination). Patching walks the chain and
//! writes real offsets. When a list is patched at a point where the tested
//! value is not wanted — conditions, loop exits — the value-keeping jumps
//! `JumpOnTrue`/`JumpOnFalse` are rewritten to their popping duals.

use std::collections::HashMap;

use crate::bytecode::{LocVar, MAXARG_U, MULT_RET, Op, Proto};
use crate::error::{Error, Result};

/// Sentinel marking the end of a patch list / an unresolved jump offset.
pub const NO_JUMP: i32 = -1;

/// Most locals a function may have in scope at once (hidden loop-control
/// variables included).
pub const MAX_LOCALS: usize = 32;

/// Most declared parameters (the implicit `self` counts).
pub const MAX_PARAMS: usize = 32;

/// Most values a closure may capture.
pub const MAX_UPVALUES: usize = 16;

/// Most targets on the left of one multiple assignment.
pub const MAX_ASSIGN_VARS: usize = 16;

// ---------------------------------------------------------------------------
// Expression descriptors
// ---------------------------------------------------------------------------

/// What the just-parsed expression denotes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpKind {
    /// A local variable in the current function, by stack slot.
    Local(u32),
    /// A global variable, by name index in the string pool.
    Global(u32),
    /// A table/key pair already pushed on the stack (table under key).
    Indexed,
    /// A computed value: already on the stack, or pending in the
    /// descriptor's short-circuit patch lists.
    Value,
}

/// Result of parsing an expression, consumed by the emitter.
///
/// `true_list`/`false_list` are patch-list heads of conditional jumps taken
/// when the expression turned out true/false; [`NO_JUMP`] when empty.
#[derive(Debug, Clone, Copy)]
pub struct ExpDesc {
    pub kind: ExpKind,
    pub true_list: i32,
    pub false_list: i32,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> Self {
        Self {
            kind,
            true_list: NO_JUMP,
            false_list: NO_JUMP,
        }
    }

    pub fn value() -> Self {
        Self::new(ExpKind::Value)
    }
}

/// Binary operators of the expression grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Unary operators (`not`, unary `-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Minus,
    Not,
}

/// How a closure capture is sourced from the immediately enclosing
/// function: one of its locals (by slot) or a global (by name index in the
/// *enclosing* function's string pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalDesc {
    Local(u32),
    Global(u32),
}

/// An active loop: the jumps its `break`s emitted so far, and the stack
/// level to restore on the way out.
struct BreakFrame {
    break_list: i32,
    stack_level: u32,
}

// ---------------------------------------------------------------------------
// FuncState
// ---------------------------------------------------------------------------

/// Compilation state for one function. The parser keeps these in a stack —
/// the top entry is the function whose body is being compiled.
pub struct FuncState {
    /// The prototype being built.
    pub proto: Proto,

    /// Source line attributed to instructions emitted next; the parser
    /// refreshes this as it consumes tokens.
    pub line: u32,

    /// pc of the last jump target. No peephole replacement may touch an
    /// instruction at or before this point.
    last_target: usize,

    /// Patch list of jumps waiting for the next emitted instruction.
    jpc: i32,

    /// Symbolic height of the runtime operand stack.
    pub stack_level: u32,
    max_stack: u32,

    /// Indices into `proto.locvars` for every registered local; the first
    /// `nactloc` are active (visible to name resolution), the rest are
    /// registered-but-initializing.
    actloc: Vec<usize>,
    pub nactloc: usize,

    /// Capture descriptors, in capture order.
    pub upvalues: Vec<UpvalDesc>,

    breaks: Vec<BreakFrame>,

    /// Memo of `proto.strings` for O(1) interning.
    string_index: HashMap<String, u32>,
}

impl FuncState {
    pub fn new(source: &str, line_defined: u32) -> Self {
        Self {
            proto: Proto::new(source.to_string(), line_defined),
            line: line_defined.max(1),
            last_target: 0,
            jpc: NO_JUMP,
            stack_level: 0,
            max_stack: 0,
            actloc: Vec::new(),
            nactloc: 0,
            upvalues: Vec::new(),
            breaks: Vec::new(),
            string_index: HashMap::new(),
        }
    }

    /// Index of the next instruction to be emitted.
    pub fn pc(&self) -> usize {
        self.proto.code.len()
    }

    fn limit_error(&self, what: &'static str, limit: usize) -> Error {
        Error::Limit {
            chunk: self.proto.source.clone(),
            line: self.line,
            what,
            limit,
        }
    }

    // -----------------------------------------------------------------------
    // Emission and stack tracking
    // -----------------------------------------------------------------------

    /// Fixed stack effect of an instruction, or `None` when the emitting
    /// code must account for it itself (calls, returns, closures, flushes).
    fn stack_effect(op: &Op) -> Option<i32> {
        Some(match op {
            Op::PushNil(n) => *n as i32,
            Op::Pop(n) => -(*n as i32),
            Op::PushInt(_)
            | Op::PushNum(_)
            | Op::PushString(_)
            | Op::GetLocal(_)
            | Op::GetGlobal(_)
            | Op::GetUpvalue(_)
            | Op::PushSelf(_)
            | Op::CreateTable(_) => 1,
            Op::GetTable => -1,
            Op::GetDotted(_) | Op::Negate | Op::Not | Op::Jump(_) | Op::ForPrep(_) => 0,
            Op::SetLocal(_)
            | Op::SetGlobal(_)
            | Op::SetTable(_)
            | Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Pow
            | Op::Concat
            | Op::Equal
            | Op::NotEqual
            | Op::Less
            | Op::LessEq
            | Op::Greater
            | Op::GreaterEq
            | Op::JumpIfFalse(_)
            | Op::JumpIfTrue(_)
            | Op::JumpOnTrue(_)
            | Op::JumpOnFalse(_) => -1,
            Op::SetTablePop => -3,
            Op::ForLoop(_) => -3,
            Op::TForPrep(_) => 3,
            Op::TForLoop(_) => -4,
            Op::SetList { .. } | Op::SetMap { .. } | Op::Call { .. } | Op::Return(_)
            | Op::Closure { .. } => return None,
        })
    }

    /// Record a stack-height change and keep the watermark current.
    pub fn delta_stack(&mut self, delta: i32) {
        let level = self.stack_level as i32 + delta;
        debug_assert!(level >= 0, "operand stack underflow at pc {}", self.pc());
        self.stack_level = level as u32;
        if self.stack_level > self.max_stack {
            self.max_stack = self.stack_level;
        }
    }

    /// Append an instruction, resolving any jumps pending on it and
    /// applying its fixed stack effect. Returns its pc.
    pub fn emit(&mut self, op: Op) -> usize {
        let delta = Self::stack_effect(&op);
        self.discharge_jpc();
        let pc = self.pc();
        self.proto.code.push(op);
        self.proto.lines.push(self.line);
        if let Some(d) = delta {
            self.delta_stack(d);
        }
        pc
    }

    fn discharge_jpc(&mut self) {
        if self.jpc != NO_JUMP {
            let list = std::mem::replace(&mut self.jpc, NO_JUMP);
            let target = self.pc();
            self.patch_list_aux(list, target, false);
            self.last_target = target;
        }
    }

    // -----------------------------------------------------------------------
    // Jumps and patch lists
    // -----------------------------------------------------------------------

    /// Emit an unconditional forward jump, adopting any jumps that were
    /// pending on the next instruction (they will go wherever this one
    /// goes). Returns the patch-list head.
    pub fn jump(&mut self) -> i32 {
        let pending = std::mem::replace(&mut self.jpc, NO_JUMP);
        let j = self.emit(Op::Jump(NO_JUMP)) as i32;
        self.concat(j, pending)
    }

    /// pc of the next instruction as a jump target: collects pending jumps
    /// and raises the peephole barrier.
    pub fn get_label(&mut self) -> usize {
        let pc = self.pc();
        if self.jpc != NO_JUMP {
            let list = std::mem::replace(&mut self.jpc, NO_JUMP);
            self.patch_list_aux(list, pc, false);
        }
        self.last_target = pc;
        pc
    }

    /// Destination of the jump at `pc`, or `NO_JUMP` while unresolved.
    fn get_jump(&self, pc: usize) -> i32 {
        let offset = self.proto.code[pc]
            .jump_offset()
            .expect("patch list entry is not a jump");
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc as i32 + 1 + offset
        }
    }

    fn fix_jump(&mut self, pc: usize, dest: usize) {
        let offset = dest as i32 - (pc as i32 + 1);
        assert!(offset != NO_JUMP, "jump at {pc} cannot target itself");
        self.proto.code[pc].set_jump_offset(offset);
    }

    /// Join two patch lists, returning the head of the combined list.
    pub fn concat(&mut self, l1: i32, l2: i32) -> i32 {
        if l2 == NO_JUMP {
            return l1;
        }
        if l1 == NO_JUMP {
            return l2;
        }
        let mut tail = l1 as usize;
        loop {
            let next = self.get_jump(tail);
            if next == NO_JUMP {
                break;
            }
            tail = next as usize;
        }
        self.fix_jump(tail, l2 as usize);
        l1
    }

    fn patch_list_aux(&mut self, mut list: i32, target: usize, keep_values: bool) {
        debug_assert!(target <= self.pc());
        while list != NO_JUMP {
            let pc = list as usize;
            let next = self.get_jump(pc);
            if !keep_values {
                match self.proto.code[pc] {
                    Op::JumpOnTrue(_) => self.proto.code[pc] = Op::JumpIfTrue(NO_JUMP),
                    Op::JumpOnFalse(_) => self.proto.code[pc] = Op::JumpIfFalse(NO_JUMP),
                    _ => {}
                }
            }
            self.fix_jump(pc, target);
            list = next;
        }
    }

    /// Resolve every jump in `list` to `target`, a point where the tested
    /// value is not wanted (conditions, loop exits).
    pub fn patch_list(&mut self, list: i32, target: usize) {
        self.patch_list_aux(list, target, false);
    }

    /// Queue `list` to be resolved to the next emitted instruction.
    pub fn patch_to_here(&mut self, list: i32) {
        self.jpc = self.concat(self.jpc, list);
    }

    // -----------------------------------------------------------------------
    // Constants
    // -----------------------------------------------------------------------

    /// Index of `s` in the string pool, interning it on first sight.
    pub fn string_constant(&mut self, s: &str) -> Result<u32> {
        if let Some(&i) = self.string_index.get(s) {
            return Ok(i);
        }
        if self.proto.strings.len() >= MAXARG_U {
            return Err(self.limit_error("string constants", MAXARG_U));
        }
        let i = self.proto.strings.len() as u32;
        self.proto.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), i);
        Ok(i)
    }

    /// Index of `n` in the numeric pool (bit-exact dedup).
    pub fn number_constant(&mut self, n: f64) -> Result<u32> {
        if let Some(i) = self
            .proto
            .numbers
            .iter()
            .position(|v| v.to_bits() == n.to_bits())
        {
            return Ok(i as u32);
        }
        if self.proto.numbers.len() >= MAXARG_U {
            return Err(self.limit_error("numeric constants", MAXARG_U));
        }
        let i = self.proto.numbers.len() as u32;
        self.proto.numbers.push(n);
        Ok(i)
    }

    /// Push a numeric literal, preferring the immediate form when the value
    /// is integral and fits the operand field.
    pub fn push_number(&mut self, n: f64) -> Result<()> {
        if n.fract() == 0.0 && (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&n) {
            self.emit(Op::PushInt(n as i32));
        } else {
            let k = self.number_constant(n)?;
            self.emit(Op::PushNum(k));
        }
        Ok(())
    }

    pub fn push_string(&mut self, s: &str) -> Result<()> {
        let k = self.string_constant(s)?;
        self.emit(Op::PushString(k));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Open calls
    // -----------------------------------------------------------------------

    /// Emit the call for a function sitting at stack slot `base` with its
    /// arguments above it. The call starts *open* (result count
    /// [`MULT_RET`]) and is provisionally counted as one result.
    pub fn emit_call(&mut self, base: u32) {
        self.emit(Op::Call {
            base,
            results: MULT_RET,
        });
        self.stack_level = base + 1;
    }

    /// Whether the last emitted instruction is a call whose result count is
    /// still open (and not hidden behind a jump target).
    pub fn last_is_open(&self) -> bool {
        self.pc() > self.last_target
            && matches!(
                self.proto.code.last(),
                Some(Op::Call {
                    results: MULT_RET,
                    ..
                })
            )
    }

    /// Fix the result count of an open trailing call.
    pub fn set_call_returns(&mut self, results: u32) {
        if results != MULT_RET && self.last_is_open() {
            let pc = self.pc() - 1;
            if let Op::Call { results: r, .. } = &mut self.proto.code[pc] {
                *r = results;
            }
            // the open call was provisionally counted as one result
            self.delta_stack(results as i32 - 1);
        }
    }

    // -----------------------------------------------------------------------
    // Expression discharge
    // -----------------------------------------------------------------------

    /// Turn a variable reference into a stack value. `Indexed` reads fuse a
    /// literal key into `GetDotted` when the key push is still fair game
    /// for the peephole.
    pub fn discharge(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Local(i) => {
                self.emit(Op::GetLocal(i));
            }
            ExpKind::Global(k) => {
                self.emit(Op::GetGlobal(k));
            }
            ExpKind::Indexed => {
                if self.pc() > self.last_target
                    && let Some(&Op::PushString(k)) = self.proto.code.last()
                {
                    let pc = self.pc() - 1;
                    self.proto.code[pc] = Op::GetDotted(k);
                    self.delta_stack(-1);
                } else {
                    self.emit(Op::GetTable);
                }
            }
            ExpKind::Value => {}
        }
        e.kind = ExpKind::Value;
    }

    /// Materialize `e` as stack values: discharge it, close a trailing open
    /// call to `results` values, and land its short-circuit patch lists
    /// here (every pending jump kept its value, so all paths join with the
    /// expression result on top).
    pub fn tostack(&mut self, e: &mut ExpDesc, results: u32) {
        self.discharge(e);
        self.set_call_returns(results);
        if e.true_list != NO_JUMP || e.false_list != NO_JUMP {
            let label = self.get_label();
            self.patch_list_aux(e.true_list, label, true);
            self.patch_list_aux(e.false_list, label, true);
            e.true_list = NO_JUMP;
            e.false_list = NO_JUMP;
        }
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    /// Arrange to fall through when `e` is true: emits a jump-on-false
    /// recorded in the false list, and lands the true list here. With
    /// `keep` the jump preserves the tested value (short-circuit `and`);
    /// without it, a trailing `Not` folds into the inverted popping jump.
    pub fn go_if_true(&mut self, e: &mut ExpDesc, keep: bool) {
        self.discharge(e);
        self.set_call_returns(1);
        let j = if !keep
            && self.pc() > self.last_target
            && matches!(self.proto.code.last(), Some(Op::Not))
        {
            let pc = self.pc() - 1;
            self.proto.code[pc] = Op::JumpIfTrue(NO_JUMP);
            self.delta_stack(-1);
            pc as i32
        } else {
            self.emit(if keep {
                Op::JumpOnFalse(NO_JUMP)
            } else {
                Op::JumpIfFalse(NO_JUMP)
            }) as i32
        };
        e.false_list = self.concat(e.false_list, j);
        self.patch_to_here(e.true_list);
        e.true_list = NO_JUMP;
    }

    /// Dual of [`Self::go_if_true`]: fall through when `e` is false.
    pub fn go_if_false(&mut self, e: &mut ExpDesc, keep: bool) {
        self.discharge(e);
        self.set_call_returns(1);
        let j = if !keep
            && self.pc() > self.last_target
            && matches!(self.proto.code.last(), Some(Op::Not))
        {
            let pc = self.pc() - 1;
            self.proto.code[pc] = Op::JumpIfFalse(NO_JUMP);
            self.delta_stack(-1);
            pc as i32
        } else {
            self.emit(if keep {
                Op::JumpOnTrue(NO_JUMP)
            } else {
                Op::JumpIfTrue(NO_JUMP)
            }) as i32
        };
        e.true_list = self.concat(e.true_list, j);
        self.patch_to_here(e.false_list);
        e.false_list = NO_JUMP;
    }

    // -----------------------------------------------------------------------
    // Operator hooks
    // -----------------------------------------------------------------------

    /// Apply a unary operator to the parsed operand. Unary minus on a
    /// just-pushed numeric constant folds into the constant.
    pub fn prefix(&mut self, op: UnOp, e: &mut ExpDesc) -> Result<()> {
        self.tostack(e, 1);
        match op {
            UnOp::Minus => {
                if self.pc() > self.last_target {
                    match self.proto.code.last() {
                        Some(&Op::PushInt(i)) if i != i32::MIN => {
                            let pc = self.pc() - 1;
                            self.proto.code[pc] = Op::PushInt(-i);
                            return Ok(());
                        }
                        Some(&Op::PushNum(k)) => {
                            let negated = -self.proto.numbers[k as usize];
                            let k2 = self.number_constant(negated)?;
                            let pc = self.pc() - 1;
                            self.proto.code[pc] = Op::PushNum(k2);
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                self.emit(Op::Negate);
            }
            UnOp::Not => {
                self.emit(Op::Not);
            }
        }
        Ok(())
    }

    /// Called after the operator token, before the right operand.
    pub fn infix(&mut self, op: BinOp, e: &mut ExpDesc) {
        match op {
            BinOp::And => self.go_if_true(e, true),
            BinOp::Or => self.go_if_false(e, true),
            _ => self.tostack(e, 1),
        }
    }

    /// Called once the right operand is parsed; leaves the combined
    /// expression in `e1`.
    pub fn posfix(&mut self, op: BinOp, e1: &mut ExpDesc, e2: &mut ExpDesc) {
        match op {
            BinOp::And => {
                debug_assert_eq!(e1.true_list, NO_JUMP, "true list left by go_if_true");
                self.discharge(e2);
                self.set_call_returns(1);
                e2.false_list = self.concat(e2.false_list, e1.false_list);
                *e1 = *e2;
            }
            BinOp::Or => {
                debug_assert_eq!(e1.false_list, NO_JUMP, "false list left by go_if_false");
                self.discharge(e2);
                self.set_call_returns(1);
                e2.true_list = self.concat(e2.true_list, e1.true_list);
                *e1 = *e2;
            }
            _ => {
                self.tostack(e2, 1);
                self.emit(match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Pow => Op::Pow,
                    BinOp::Concat => Op::Concat,
                    BinOp::Eq => Op::Equal,
                    BinOp::Ne => Op::NotEqual,
                    BinOp::Lt => Op::Less,
                    BinOp::Le => Op::LessEq,
                    BinOp::Gt => Op::Greater,
                    BinOp::Ge => Op::GreaterEq,
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                });
                *e1 = ExpDesc::value();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stores and stack adjustment
    // -----------------------------------------------------------------------

    /// Store TOS into the variable `e` denotes, popping what the store
    /// consumes.
    pub fn store_var(&mut self, e: &ExpDesc) {
        match e.kind {
            ExpKind::Local(i) => {
                self.emit(Op::SetLocal(i));
            }
            ExpKind::Global(k) => {
                self.emit(Op::SetGlobal(k));
            }
            ExpKind::Indexed => {
                self.emit(Op::SetTablePop);
            }
            ExpKind::Value => unreachable!("store into a computed expression"),
        }
    }

    /// Emit code popping `n` values (n > 0) or pushing `-n` nils (n < 0).
    pub fn adjust_stack(&mut self, n: i32) {
        if n > 0 {
            self.emit(Op::Pop(n as u32));
        } else if n < 0 {
            self.emit(Op::PushNil((-n) as u32));
        }
    }

    // -----------------------------------------------------------------------
    // Locals
    // -----------------------------------------------------------------------

    /// Register a local-variable record. The variable is *not* yet visible
    /// to name resolution: it activates with [`Self::adjust_local_vars`]
    /// once its initializer has been compiled.
    pub fn register_local(&mut self, name: &str) -> Result<()> {
        if self.actloc.len() >= MAX_LOCALS {
            return Err(self.limit_error("local variables", MAX_LOCALS));
        }
        let idx = self.proto.locvars.len();
        self.proto.locvars.push(LocVar {
            name: name.to_string(),
            start_pc: 0,
            end_pc: 0,
        });
        self.actloc.push(idx);
        Ok(())
    }

    /// Activate the last `n` registered locals; their scope starts at the
    /// current pc.
    pub fn adjust_local_vars(&mut self, n: usize) {
        let pc = self.pc() as u32;
        for k in self.nactloc..self.nactloc + n {
            self.proto.locvars[self.actloc[k]].start_pc = pc;
        }
        self.nactloc += n;
    }

    /// Deactivate the top `n` active locals, closing their debug spans.
    pub fn remove_local_vars(&mut self, n: usize) {
        debug_assert_eq!(self.actloc.len(), self.nactloc, "pending locals at scope exit");
        let pc = self.pc() as u32;
        for _ in 0..n {
            self.nactloc -= 1;
            let idx = self.actloc.pop().expect("active-local stack underflow");
            self.proto.locvars[idx].end_pc = pc;
        }
    }

    /// Slot of the innermost *active* local named `name`, if any.
    pub fn search_local(&self, name: &str) -> Option<u32> {
        self.actloc[..self.nactloc]
            .iter()
            .rposition(|&idx| self.proto.locvars[idx].name == name)
            .map(|slot| slot as u32)
    }

    // -----------------------------------------------------------------------
    // Break frames
    // -----------------------------------------------------------------------

    pub fn enter_break(&mut self) {
        self.breaks.push(BreakFrame {
            break_list: NO_JUMP,
            stack_level: self.stack_level,
        });
    }

    /// Whether a `break` is currently legal.
    pub fn in_loop(&self) -> bool {
        !self.breaks.is_empty()
    }

    /// Compile a `break`: pop down to the loop's entry level, jump out, and
    /// keep tracking the (unreachable) code after it as if the break had
    /// not occurred.
    pub fn emit_break(&mut self) {
        let frame_level = self
            .breaks
            .last()
            .expect("break outside a loop frame")
            .stack_level;
        let saved = self.stack_level;
        self.adjust_stack(saved as i32 - frame_level as i32);
        let j = self.jump();
        let idx = self.breaks.len() - 1;
        let list = self.concat(self.breaks[idx].break_list, j);
        self.breaks[idx].break_list = list;
        self.stack_level = saved;
    }

    /// Close the loop: every pending `break` lands on the next instruction.
    pub fn leave_break(&mut self) {
        let frame = self.breaks.pop().expect("unbalanced break frame");
        assert_eq!(
            frame.stack_level, self.stack_level,
            "loop exits with unbalanced stack"
        );
        self.patch_to_here(frame.break_list);
    }

    // -----------------------------------------------------------------------
    // Upvalues, tables, closures
    // -----------------------------------------------------------------------

    /// Index of `desc` in the capture list, reusing an identical existing
    /// capture.
    pub fn index_upvalue(&mut self, desc: UpvalDesc) -> Result<u32> {
        if let Some(i) = self.upvalues.iter().position(|&u| u == desc) {
            return Ok(i as u32);
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(self.limit_error("upvalues", MAX_UPVALUES));
        }
        self.upvalues.push(desc);
        Ok(self.upvalues.len() as u32 - 1)
    }

    /// Back-patch a for-loop pair: the prep instruction at `prep` skips to
    /// the latch at `loop_pc` when the range is empty, and the latch jumps
    /// back to the body start just after the prep. With an empty body the
    /// latch targets itself, so the offsets are written directly — a self
    /// target encodes as -1 and must not be mistaken for [`NO_JUMP`].
    pub fn fix_for(&mut self, prep: usize, loop_pc: usize) {
        let skip = loop_pc as i32 - (prep as i32 + 1);
        self.proto.code[prep].set_jump_offset(skip);
        let back = (prep as i32 + 1) - (loop_pc as i32 + 1);
        self.proto.code[loop_pc].set_jump_offset(back);
    }

    /// Flush accumulated list items into the table at `table_slot`.
    pub fn emit_setlist(&mut self, batch: u32, table_slot: u32) {
        self.emit(Op::SetList {
            batch,
            table: table_slot,
        });
        self.stack_level = table_slot + 1;
    }

    /// Flush accumulated record pairs into the table at `table_slot`.
    pub fn emit_setmap(&mut self, table_slot: u32) {
        self.emit(Op::SetMap { table: table_slot });
        self.stack_level = table_slot + 1;
    }

    /// Emit the closure instruction; the `upvalues` captured values were
    /// pushed by the caller and are consumed here.
    pub fn emit_closure(&mut self, proto: u32, upvalues: u32) {
        self.emit(Op::Closure { proto, upvalues });
        self.delta_stack(1 - upvalues as i32);
    }

    // -----------------------------------------------------------------------
    // Function close
    // -----------------------------------------------------------------------

    /// Seal the function: final `Return`, pending jumps resolved, remaining
    /// locals closed, line-info sentinel appended, metadata filled in.
    pub fn finish(mut self) -> (Proto, Vec<UpvalDesc>) {
        assert!(self.breaks.is_empty(), "function closed inside a loop frame");
        self.emit(Op::Return(self.nactloc as u32));
        self.remove_local_vars(self.nactloc);
        self.proto.lines.push(u32::MAX);
        self.proto.max_stack = self.max_stack;
        self.proto.num_upvalues = self.upvalues.len() as u32;
        self.proto.code.shrink_to_fit();
        self.proto.lines.shrink_to_fit();
        self.proto.locvars.shrink_to_fit();
        #[cfg(debug_assertions)]
        self.assert_jumps_resolved();
        (self.proto, self.upvalues)
    }

    /// Every jump must resolve inside the code buffer once a function is
    /// closed; a surviving `NO_JUMP` is a compiler bug.
    #[cfg(debug_assertions)]
    fn assert_jumps_resolved(&self) {
        let len = self.proto.code.len() as i32;
        for (pc, op) in self.proto.code.iter().enumerate() {
            if let Some(offset) = op.jump_offset() {
                let dest = pc as i32 + 1 + offset;
                // A loop latch may target itself (empty body), which
                // encodes as -1; anywhere else -1 is an unresolved jump.
                let latch = matches!(op, Op::ForLoop(_) | Op::TForLoop(_));
                assert!(
                    (latch || offset != NO_JUMP) && dest >= 0 && dest < len,
                    "unresolved or out-of-range jump at pc {pc}: {op:?}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FuncState {
        FuncState::new("test", 0)
    }

    #[test]
    fn patch_list_threads_through_operands() {
        let mut f = fs();
        f.delta_stack(3); // pretend three values exist for the pops
        let j1 = f.jump();
        f.emit(Op::Pop(1));
        let j2 = f.jump();
        f.emit(Op::Pop(1));
        let list = f.concat(j1, j2);
        let j3 = f.jump();
        let list = f.concat(list, j3);
        f.emit(Op::Pop(1));
        let target = f.get_label();
        f.patch_list(list, target);
        for pc in [0usize, 2, 4] {
            let dest = pc as i32 + 1 + f.proto.code[pc].jump_offset().unwrap();
            assert_eq!(dest as usize, target);
        }
    }

    #[test]
    fn condition_patch_rewrites_keeping_jumps() {
        let mut f = fs();
        f.emit(Op::PushInt(1));
        let j = f.emit(Op::JumpOnFalse(NO_JUMP)) as i32;
        f.emit(Op::PushInt(2));
        let target = f.get_label();
        f.patch_list(j, target);
        assert!(matches!(f.proto.code[j as usize], Op::JumpIfFalse(_)));
    }

    #[test]
    fn string_constants_are_interned() {
        let mut f = fs();
        let a = f.string_constant("x").unwrap();
        let b = f.string_constant("y").unwrap();
        let c = f.string_constant("x").unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(f.proto.strings.len(), 2);
    }

    #[test]
    fn integral_numbers_use_the_immediate_form() {
        let mut f = fs();
        f.push_number(7.0).unwrap();
        f.push_number(0.5).unwrap();
        assert_eq!(f.proto.code[0], Op::PushInt(7));
        assert_eq!(f.proto.code[1], Op::PushNum(0));
        assert_eq!(f.proto.numbers, vec![0.5]);
    }

    #[test]
    fn unary_minus_folds_into_constants() {
        let mut f = fs();
        let mut e = ExpDesc::value();
        f.push_number(4.0).unwrap();
        f.prefix(UnOp::Minus, &mut e).unwrap();
        assert_eq!(f.proto.code, vec![Op::PushInt(-4)]);
        assert_eq!(f.stack_level, 1);
    }

    #[test]
    fn minus_fold_respects_the_jump_target_barrier() {
        let mut f = fs();
        f.push_number(4.0).unwrap();
        f.get_label();
        let mut e = ExpDesc::value();
        f.prefix(UnOp::Minus, &mut e).unwrap();
        assert_eq!(f.proto.code, vec![Op::PushInt(4), Op::Negate]);
    }

    #[test]
    fn dotted_read_fuses_the_key_push() {
        let mut f = fs();
        f.emit(Op::GetGlobal(0));
        f.push_string("field").unwrap();
        let mut e = ExpDesc::new(ExpKind::Indexed);
        f.discharge(&mut e);
        assert_eq!(f.proto.code, vec![Op::GetGlobal(0), Op::GetDotted(0)]);
        assert_eq!(f.stack_level, 1);
    }

    #[test]
    fn open_call_results_can_be_rewritten() {
        let mut f = fs();
        f.emit(Op::GetGlobal(0));
        f.emit(Op::PushInt(1));
        f.emit_call(0);
        assert_eq!(f.stack_level, 1);
        assert!(f.last_is_open());
        f.set_call_returns(3);
        assert_eq!(
            f.proto.code.last(),
            Some(&Op::Call {
                base: 0,
                results: 3
            })
        );
        assert_eq!(f.stack_level, 3);
        assert!(!f.last_is_open());
    }

    #[test]
    fn break_restores_the_symbolic_stack() {
        let mut f = fs();
        f.enter_break();
        f.emit(Op::PushInt(1)); // a temporary the break must discard
        let before = f.stack_level;
        f.emit_break();
        assert_eq!(f.stack_level, before);
        assert_eq!(f.proto.code[1], Op::Pop(1));
        f.delta_stack(-1); // leave the loop balanced
        f.leave_break();
    }

    #[test]
    fn finish_appends_return_and_line_sentinel() {
        let mut f = fs();
        f.emit(Op::PushNil(1));
        f.delta_stack(-1);
        let (proto, upvalues) = f.finish();
        assert!(upvalues.is_empty());
        assert_eq!(proto.code.last(), Some(&Op::Return(0)));
        assert_eq!(proto.lines.len(), proto.code.len() + 1);
        assert_eq!(proto.lines.last(), Some(&u32::MAX));
    }
}
