//! Recursive-descent parser and code-generation driver.
//!
//! The grammar is LL(1): the cursor keeps the current token plus at most one
//! token of lookahead, needed at exactly two points (a `NAME` opening a
//! constructor part, and the token after `function` in statement position).
//! Each production drives the emitter in [`crate::codegen`] directly; there
//! is no AST. Function compilation states form a stack — the top entry is
//! the function whose body is being compiled — torn down as `function`
//! bodies close.

use crate::bytecode::{LFIELDS_PER_FLUSH, MAXARG_U, MULT_RET, Op, Proto, RFIELDS_PER_FLUSH};
use crate::codegen::{
    BinOp, ExpDesc, ExpKind, FuncState, MAX_ASSIGN_VARS, MAX_PARAMS, NO_JUMP, UnOp, UpvalDesc,
};
use crate::error::{Error, Result};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

/// Compile-time guards configurable by the embedder.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum nesting of syntactic constructs, bounding parser recursion
    /// on hostile inputs.
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_depth: 200 }
    }
}

/// Binding power of unary operators (`not`, unary `-`).
const UNARY_PRIORITY: u8 = 7;

/// Left/right binding powers of a binary operator token. Right-associative
/// operators (`^`, `..`) have `right < left`.
fn binary_op(kind: &TokenKind) -> Option<(BinOp, u8, u8)> {
    let entry = match kind {
        TokenKind::Plus => (BinOp::Add, 5, 5),
        TokenKind::Minus => (BinOp::Sub, 5, 5),
        TokenKind::Star => (BinOp::Mul, 6, 6),
        TokenKind::Slash => (BinOp::Div, 6, 6),
        TokenKind::Caret => (BinOp::Pow, 9, 8),
        TokenKind::Concat => (BinOp::Concat, 4, 3),
        TokenKind::Eq => (BinOp::Eq, 2, 2),
        TokenKind::Ne => (BinOp::Ne, 2, 2),
        TokenKind::Lt => (BinOp::Lt, 2, 2),
        TokenKind::Le => (BinOp::Le, 2, 2),
        TokenKind::Gt => (BinOp::Gt, 2, 2),
        TokenKind::Ge => (BinOp::Ge, 2, 2),
        TokenKind::And => (BinOp::And, 1, 1),
        TokenKind::Or => (BinOp::Or, 1, 1),
        _ => return None,
    };
    Some(entry)
}

/// Which kind of part a constructor section turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    List,
    Record,
}

/// Compile `source` into the prototype of its main chunk.
pub fn compile(source: &str, chunk_name: &str) -> Result<Proto> {
    compile_with_limits(source, chunk_name, &Limits::default())
}

/// As [`compile`], with explicit [`Limits`].
pub fn compile_with_limits(source: &str, chunk_name: &str, limits: &Limits) -> Result<Proto> {
    let mut lexer = Lexer::new(source, chunk_name);
    let first = lexer.next_token()?;
    let mut parser = Parser {
        lexer,
        token: first,
        lookahead: None,
        last_line: 1,
        chunk: chunk_name.to_string(),
        fs: vec![FuncState::new(chunk_name, 0)],
        depth: 0,
        limits: limits.clone(),
    };
    parser.chunk()?;
    if parser.token.kind != TokenKind::Eos {
        return Err(parser.error_expected(&TokenKind::Eos));
    }
    let (proto, upvalues) = parser.fs.pop().expect("main chunk state").finish();
    debug_assert!(upvalues.is_empty(), "captures escaped the main chunk");
    debug_assert_eq!(proto.num_params, 0);
    debug_assert!(!proto.is_vararg);
    Ok(proto)
}

struct Parser<'src> {
    lexer: Lexer<'src>,
    /// The current token.
    token: Token,
    /// At most one buffered token of lookahead.
    lookahead: Option<Token>,
    /// Line of the last consumed token; emitted instructions are attributed
    /// to it.
    last_line: u32,
    chunk: String,
    /// Function-compilation states, innermost last.
    fs: Vec<FuncState>,
    depth: usize,
    limits: Limits,
}

impl Parser<'_> {
    // -----------------------------------------------------------------------
    // Token cursor
    // -----------------------------------------------------------------------

    fn fs(&mut self) -> &mut FuncState {
        self.fs.last_mut().expect("empty function-state stack")
    }

    fn fs_ref(&self) -> &FuncState {
        self.fs.last().expect("empty function-state stack")
    }

    fn advance(&mut self) -> Result<()> {
        self.last_line = self.token.line;
        let line = self.last_line;
        self.fs().line = line;
        self.token = match self.lookahead.take() {
            Some(tok) => tok,
            None => self.lexer.next_token()?,
        };
        Ok(())
    }

    /// Buffer one token of lookahead. Must only be called when the buffer
    /// is empty.
    fn peek(&mut self) -> Result<&Token> {
        debug_assert!(self.lookahead.is_none(), "second token of lookahead");
        if self.lookahead.is_none() {
            self.lookahead = Some(self.lexer.next_token()?);
        }
        Ok(self.lookahead.as_ref().unwrap())
    }

    fn syntax_error(&self, message: &str) -> Error {
        Error::Syntax {
            chunk: self.chunk.clone(),
            line: self.token.line,
            message: message.to_string(),
            near: self.token.kind.to_string(),
        }
    }

    fn limit_error(&self, what: &'static str, limit: usize) -> Error {
        Error::Limit {
            chunk: self.chunk.clone(),
            line: self.token.line,
            what,
            limit,
        }
    }

    fn error_expected(&self, kind: &TokenKind) -> Error {
        self.syntax_error(&format!("'{kind}' expected"))
    }

    /// Consume the expected token or fail with `'X' expected`.
    fn check(&mut self, kind: TokenKind) -> Result<()> {
        if self.token.kind != kind {
            return Err(self.error_expected(&kind));
        }
        self.advance()
    }

    /// Consume `kind` if it is the current token.
    fn optional(&mut self, kind: &TokenKind) -> Result<bool> {
        if self.token.kind == *kind {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Expect `close`; on mismatch, name the still-open construct unless it
    /// started on the current line.
    fn check_match(&mut self, close: TokenKind, open: TokenKind, open_line: u32) -> Result<()> {
        if self.token.kind == close {
            return self.advance();
        }
        if open_line == self.token.line {
            Err(self.error_expected(&close))
        } else {
            Err(self.syntax_error(&format!(
                "'{close}' expected (to close '{open}' at line {open_line})"
            )))
        }
    }

    fn check_name(&mut self) -> Result<String> {
        match &self.token.kind {
            TokenKind::Name(s) => {
                let name = s.clone();
                self.advance()?;
                Ok(name)
            }
            _ => Err(self.syntax_error("<name> expected")),
        }
    }

    fn enter_level(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > self.limits.max_depth {
            return Err(self.limit_error("syntax levels", self.limits.max_depth));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.depth -= 1;
    }

    // -----------------------------------------------------------------------
    // Name resolution
    // -----------------------------------------------------------------------

    /// Find `name` as an active local, returning (distance from the current
    /// function, slot). Distance 0 is the current function.
    fn search_var(&self, name: &str) -> Option<(usize, u32)> {
        for (level, fs) in self.fs.iter().rev().enumerate() {
            if let Some(slot) = fs.search_local(name) {
                return Some((level, slot));
            }
        }
        None
    }

    /// Resolve a plain `NAME`: a local of the current function or a global.
    /// Locals of enclosing functions are reachable only through `%name`.
    fn single_var(&mut self, name: &str) -> Result<ExpDesc> {
        match self.search_var(name) {
            Some((0, slot)) => Ok(ExpDesc::new(ExpKind::Local(slot))),
            Some(_) => Err(self.syntax_error("cannot access a variable in outer function")),
            None => {
                let k = self.fs().string_constant(name)?;
                Ok(ExpDesc::new(ExpKind::Global(k)))
            }
        }
    }

    /// `%name`: capture a local or global of the immediately enclosing
    /// function and push its frozen value.
    fn push_upvalue(&mut self, name: &str) -> Result<()> {
        if self.fs.len() < 2 {
            return Err(self.syntax_error("cannot access an upvalue at top level"));
        }
        let enclosing = self.fs.len() - 2;
        let desc = if let Some(slot) = self.fs[enclosing].search_local(name) {
            UpvalDesc::Local(slot)
        } else if self.fs[..enclosing]
            .iter()
            .any(|fs| fs.search_local(name).is_some())
        {
            return Err(
                self.syntax_error("upvalue must be global or local to immediately outer function")
            );
        } else {
            let k = self.fs[enclosing].string_constant(name)?;
            UpvalDesc::Global(k)
        };
        let index = self.fs().index_upvalue(desc)?;
        self.fs().emit(Op::GetUpvalue(index));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expr(&mut self) -> Result<ExpDesc> {
        self.subexpr(0)
    }

    /// Precedence climbing over the binary-operator table; unary operators
    /// bind at [`UNARY_PRIORITY`].
    fn subexpr(&mut self, limit: u8) -> Result<ExpDesc> {
        self.enter_level()?;
        let mut e = match self.token.kind {
            TokenKind::Not => {
                self.advance()?;
                let mut e = self.subexpr(UNARY_PRIORITY)?;
                self.fs().prefix(UnOp::Not, &mut e)?;
                e
            }
            TokenKind::Minus => {
                self.advance()?;
                let mut e = self.subexpr(UNARY_PRIORITY)?;
                self.fs().prefix(UnOp::Minus, &mut e)?;
                e
            }
            _ => self.simple_exp()?,
        };
        while let Some((op, left, right)) = binary_op(&self.token.kind) {
            if left <= limit {
                break;
            }
            self.advance()?;
            self.fs().infix(op, &mut e);
            let mut rhs = self.subexpr(right)?;
            self.fs().posfix(op, &mut e, &mut rhs);
        }
        self.leave_level();
        Ok(e)
    }

    /// Parse an expression and materialize exactly one value.
    fn exp1(&mut self) -> Result<()> {
        let mut e = self.expr()?;
        self.fs().tostack(&mut e, 1);
        Ok(())
    }

    /// explist1 — one or more comma-separated expressions. Every expression
    /// but the last yields exactly one value; a trailing call is left open.
    fn exp_list(&mut self) -> Result<u32> {
        let mut n = 1u32;
        let mut e = self.expr()?;
        while self.optional(&TokenKind::Comma)? {
            self.fs().tostack(&mut e, 1);
            e = self.expr()?;
            n += 1;
        }
        self.fs().tostack(&mut e, MULT_RET);
        Ok(n)
    }

    /// A primary expression followed by any chain of postfixes: field
    /// access, subscript, method call, direct call.
    fn simple_exp(&mut self) -> Result<ExpDesc> {
        let mut e = self.primary_exp()?;
        loop {
            match self.token.kind {
                TokenKind::Dot => {
                    self.advance()?;
                    let field = self.check_name()?;
                    self.fs().tostack(&mut e, 1);
                    self.fs().push_string(&field)?;
                    e = ExpDesc::new(ExpKind::Indexed);
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    self.fs().tostack(&mut e, 1);
                    self.exp1()?;
                    self.check(TokenKind::RBracket)?;
                    e = ExpDesc::new(ExpKind::Indexed);
                }
                TokenKind::Colon => {
                    self.advance()?;
                    let method = self.check_name()?;
                    self.fs().tostack(&mut e, 1);
                    let k = self.fs().string_constant(&method)?;
                    self.fs().emit(Op::PushSelf(k));
                    let base = self.fs_ref().stack_level - 2;
                    self.func_args(base)?;
                    e = ExpDesc::value();
                }
                TokenKind::LParen | TokenKind::LBrace | TokenKind::Str(_) => {
                    self.fs().tostack(&mut e, 1);
                    let base = self.fs_ref().stack_level - 1;
                    self.func_args(base)?;
                    e = ExpDesc::value();
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn primary_exp(&mut self) -> Result<ExpDesc> {
        let kind = self.token.kind.clone();
        match kind {
            TokenKind::Number(n) => {
                self.advance()?;
                self.fs().push_number(n)?;
                Ok(ExpDesc::value())
            }
            TokenKind::Str(s) => {
                self.advance()?;
                self.fs().push_string(&s)?;
                Ok(ExpDesc::value())
            }
            TokenKind::Nil => {
                self.advance()?;
                self.fs().emit(Op::PushNil(1));
                Ok(ExpDesc::value())
            }
            TokenKind::LBrace => {
                self.constructor()?;
                Ok(ExpDesc::value())
            }
            TokenKind::Function => {
                let line = self.token.line;
                self.advance()?;
                self.body(false, line)?;
                Ok(ExpDesc::value())
            }
            TokenKind::LParen => {
                let line = self.token.line;
                self.advance()?;
                let mut e = self.expr()?;
                self.check_match(TokenKind::RParen, TokenKind::LParen, line)?;
                // parentheses truncate a call to exactly one value
                self.fs().tostack(&mut e, 1);
                Ok(e)
            }
            TokenKind::Name(name) => {
                self.advance()?;
                self.single_var(&name)
            }
            TokenKind::Percent => {
                self.advance()?;
                let name = self.check_name()?;
                self.push_upvalue(&name)?;
                Ok(ExpDesc::value())
            }
            _ => Err(self.syntax_error("unexpected symbol")),
        }
    }

    /// Call arguments: `(explist)`, a single string literal, or a single
    /// constructor. Emits the (open) call for the function at `base`.
    fn func_args(&mut self, base: u32) -> Result<()> {
        let line = self.token.line;
        match self.token.kind {
            TokenKind::LParen => {
                self.advance()?;
                if self.token.kind != TokenKind::RParen {
                    self.exp_list()?;
                }
                self.check_match(TokenKind::RParen, TokenKind::LParen, line)?;
            }
            TokenKind::Str(_) => {
                let TokenKind::Str(s) = self.token.kind.clone() else {
                    unreachable!()
                };
                self.advance()?;
                self.fs().push_string(&s)?;
            }
            TokenKind::LBrace => {
                self.constructor()?;
            }
            _ => return Err(self.syntax_error("function arguments expected")),
        }
        self.fs().emit_call(base);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Table constructors
    // -----------------------------------------------------------------------

    /// `'{' part [';' part] '}'`. The `CreateTable` operand is back-patched
    /// to the total element count so the runtime can pre-size the table.
    fn constructor(&mut self) -> Result<()> {
        let line = self.token.line;
        self.check(TokenKind::LBrace)?;
        let create_pc = self.fs().emit(Op::CreateTable(0));
        let table_slot = self.fs_ref().stack_level - 1;
        let mut total = 0u32;
        let first = self.constructor_part(table_slot, &mut total)?;
        if self.optional(&TokenKind::Semi)? {
            let second = self.constructor_part(table_slot, &mut total)?;
            if first.is_some() && first == second {
                return Err(self.syntax_error("invalid constructor syntax"));
            }
        }
        self.check_match(TokenKind::RBrace, TokenKind::LBrace, line)?;
        if total as usize > MAXARG_U {
            return Err(self.limit_error("items in a constructor", MAXARG_U));
        }
        self.fs().proto.code[create_pc] = Op::CreateTable(total);
        Ok(())
    }

    /// One constructor part, dispatched by its first token: `NAME =` or
    /// `[` opens record fields, anything else list fields. The `NAME`
    /// ambiguity is the first of the grammar's two lookahead points.
    fn constructor_part(&mut self, table_slot: u32, total: &mut u32) -> Result<Option<PartKind>> {
        match self.token.kind {
            TokenKind::RBrace | TokenKind::Semi => Ok(None),
            TokenKind::LBracket => {
                self.record_fields(table_slot, total)?;
                Ok(Some(PartKind::Record))
            }
            TokenKind::Name(_) => {
                if self.peek()?.kind == TokenKind::Assign {
                    self.record_fields(table_slot, total)?;
                    Ok(Some(PartKind::Record))
                } else {
                    self.list_fields(table_slot, total)?;
                    Ok(Some(PartKind::List))
                }
            }
            _ => {
                self.list_fields(table_slot, total)?;
                Ok(Some(PartKind::List))
            }
        }
    }

    /// `NAME = exp` / `[exp] = exp` pairs, flushed into the table every
    /// [`RFIELDS_PER_FLUSH`] pairs.
    fn record_fields(&mut self, table_slot: u32, total: &mut u32) -> Result<()> {
        let mut pending = 0u32;
        loop {
            match &self.token.kind {
                TokenKind::Name(s) => {
                    let key = s.clone();
                    self.advance()?;
                    self.fs().push_string(&key)?;
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    self.exp1()?;
                    self.check(TokenKind::RBracket)?;
                }
                _ => return Err(self.syntax_error("<name> or '[' expected")),
            }
            self.check(TokenKind::Assign)?;
            self.exp1()?;
            pending += 1;
            *total += 1;
            if pending == RFIELDS_PER_FLUSH {
                self.fs().emit_setmap(table_slot);
                pending = 0;
            }
            if !self.optional(&TokenKind::Comma)? {
                break;
            }
            if matches!(self.token.kind, TokenKind::RBrace | TokenKind::Semi) {
                break;
            }
        }
        if pending > 0 {
            self.fs().emit_setmap(table_slot);
        }
        Ok(())
    }

    /// Positional items, flushed every [`LFIELDS_PER_FLUSH`]. The final
    /// flush carries the last expression still open, so a trailing call can
    /// supply several items.
    fn list_fields(&mut self, table_slot: u32, total: &mut u32) -> Result<()> {
        let mut pending = 1u32;
        let mut batch = 0u32;
        let mut e = self.expr()?;
        *total += 1;
        loop {
            if !self.optional(&TokenKind::Comma)? {
                break;
            }
            if matches!(self.token.kind, TokenKind::RBrace | TokenKind::Semi) {
                break;
            }
            self.fs().tostack(&mut e, 1);
            if pending == LFIELDS_PER_FLUSH {
                self.fs().emit_setlist(batch, table_slot);
                batch += 1;
                pending = 0;
            }
            e = self.expr()?;
            pending += 1;
            *total += 1;
        }
        self.fs().tostack(&mut e, MULT_RET);
        self.fs().emit_setlist(batch, table_slot);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    /// chunk -> { stat [';'] }. `return` and `break` end their chunk.
    fn chunk(&mut self) -> Result<()> {
        self.enter_level()?;
        loop {
            if self.block_follow() {
                break;
            }
            let terminated = self.statement()?;
            let fs = self.fs_ref();
            assert_eq!(
                fs.stack_level as usize, fs.nactloc,
                "statement left the operand stack unbalanced"
            );
            self.optional(&TokenKind::Semi)?;
            if terminated {
                break;
            }
        }
        self.leave_level();
        Ok(())
    }

    fn block_follow(&self) -> bool {
        matches!(
            self.token.kind,
            TokenKind::Else | TokenKind::ElseIf | TokenKind::End | TokenKind::Until | TokenKind::Eos
        )
    }

    /// Returns true when the statement must be the last of its chunk.
    fn statement(&mut self) -> Result<bool> {
        let line = self.token.line;
        match self.token.kind {
            TokenKind::If => {
                self.if_stat(line)?;
                Ok(false)
            }
            TokenKind::While => {
                self.while_stat(line)?;
                Ok(false)
            }
            TokenKind::Do => {
                self.advance()?;
                self.block()?;
                self.check_match(TokenKind::End, TokenKind::Do, line)?;
                Ok(false)
            }
            TokenKind::For => {
                self.for_stat(line)?;
                Ok(false)
            }
            TokenKind::Repeat => {
                self.repeat_stat(line)?;
                Ok(false)
            }
            TokenKind::Function => {
                // Second lookahead point: `function (` is an anonymous
                // function in an expression statement.
                let anonymous = self.peek()?.kind == TokenKind::LParen;
                if anonymous {
                    self.expr_stat()?;
                } else {
                    self.func_stat(line)?;
                }
                Ok(false)
            }
            TokenKind::Local => {
                self.local_stat()?;
                Ok(false)
            }
            TokenKind::Return => {
                self.return_stat()?;
                Ok(true)
            }
            TokenKind::Break => {
                self.break_stat()?;
                Ok(true)
            }
            _ => {
                self.expr_stat()?;
                Ok(false)
            }
        }
    }

    /// A lexical block: locals introduced inside are popped and their debug
    /// spans closed on exit.
    fn block(&mut self) -> Result<()> {
        let saved = self.fs_ref().nactloc;
        self.chunk()?;
        let fs = self.fs();
        let introduced = fs.nactloc - saved;
        fs.adjust_stack(introduced as i32);
        fs.remove_local_vars(introduced);
        Ok(())
    }

    /// Condition, `then`, block; returns the condition's false list.
    fn test_then_block(&mut self) -> Result<i32> {
        let mut cond = self.expr()?;
        self.fs().go_if_true(&mut cond, false);
        self.check(TokenKind::Then)?;
        self.block()?;
        Ok(cond.false_list)
    }

    fn if_stat(&mut self, line: u32) -> Result<()> {
        self.advance()?;
        let mut false_list = self.test_then_block()?;
        let mut escapes = NO_JUMP;
        loop {
            match self.token.kind {
                TokenKind::ElseIf => {
                    self.advance()?;
                    let j = self.fs().jump();
                    escapes = self.fs().concat(escapes, j);
                    let label = self.fs().get_label();
                    self.fs().patch_list(false_list, label);
                    false_list = self.test_then_block()?;
                }
                TokenKind::Else => {
                    self.advance()?;
                    let j = self.fs().jump();
                    escapes = self.fs().concat(escapes, j);
                    let label = self.fs().get_label();
                    self.fs().patch_list(false_list, label);
                    false_list = NO_JUMP;
                    self.block()?;
                    break;
                }
                _ => break,
            }
        }
        self.check_match(TokenKind::End, TokenKind::If, line)?;
        self.fs().patch_to_here(false_list);
        self.fs().patch_to_here(escapes);
        Ok(())
    }

    fn while_stat(&mut self, line: u32) -> Result<()> {
        self.advance()?;
        self.fs().enter_break();
        let init = self.fs().get_label();
        let mut cond = self.expr()?;
        self.fs().go_if_true(&mut cond, false);
        self.check(TokenKind::Do)?;
        self.block()?;
        let back = self.fs().jump();
        self.fs().patch_list(back, init);
        self.check_match(TokenKind::End, TokenKind::While, line)?;
        self.fs().patch_to_here(cond.false_list);
        self.fs().leave_break();
        Ok(())
    }

    fn repeat_stat(&mut self, line: u32) -> Result<()> {
        self.advance()?;
        self.fs().enter_break();
        let init = self.fs().get_label();
        self.block()?;
        self.check_match(TokenKind::Until, TokenKind::Repeat, line)?;
        let mut cond = self.expr()?;
        self.fs().go_if_true(&mut cond, false);
        self.fs().patch_list(cond.false_list, init);
        self.fs().leave_break();
        Ok(())
    }

    fn for_stat(&mut self, line: u32) -> Result<()> {
        self.advance()?;
        let name = self.check_name()?;
        match self.token.kind {
            TokenKind::Assign => self.numeric_for(&name, line),
            TokenKind::Comma => self.generic_for(&name, line),
            _ => Err(self.syntax_error("'=' or ',' expected")),
        }
    }

    /// `for NAME = init, limit [, step] do B end`. Three control values
    /// become the hidden locals `NAME`, `(limit)`, `(step)`.
    fn numeric_for(&mut self, name: &str, line: u32) -> Result<()> {
        self.fs().enter_break();
        self.advance()?; // '='
        self.exp1()?;
        self.check(TokenKind::Comma)?;
        self.exp1()?;
        if self.optional(&TokenKind::Comma)? {
            self.exp1()?;
        } else {
            self.fs().emit(Op::PushInt(1));
        }
        self.fs().register_local(name)?;
        self.fs().register_local("(limit)")?;
        self.fs().register_local("(step)")?;
        let prep = self.fs().emit(Op::ForPrep(NO_JUMP));
        self.fs().adjust_local_vars(3);
        self.check(TokenKind::Do)?;
        self.block()?;
        self.check_match(TokenKind::End, TokenKind::For, line)?;
        let latch = self.fs().emit(Op::ForLoop(NO_JUMP));
        self.fs().fix_for(prep, latch);
        self.fs().remove_local_vars(3);
        self.fs().leave_break();
        Ok(())
    }

    /// `for NAME, NAME in exp do B end` over a table. `in` is matched by
    /// name — it is not a reserved word.
    fn generic_for(&mut self, key_name: &str, line: u32) -> Result<()> {
        self.fs().enter_break();
        self.advance()?; // ','
        let value_name = self.check_name()?;
        match &self.token.kind {
            TokenKind::Name(s) if s == "in" => self.advance()?,
            _ => return Err(self.syntax_error("'in' expected")),
        }
        self.exp1()?;
        self.fs().register_local("(table)")?;
        self.fs().register_local("(index)")?;
        self.fs().register_local(key_name)?;
        self.fs().register_local(&value_name)?;
        let prep = self.fs().emit(Op::TForPrep(NO_JUMP));
        self.fs().adjust_local_vars(4);
        self.check(TokenKind::Do)?;
        self.block()?;
        self.check_match(TokenKind::End, TokenKind::For, line)?;
        let latch = self.fs().emit(Op::TForLoop(NO_JUMP));
        self.fs().fix_for(prep, latch);
        self.fs().remove_local_vars(4);
        self.fs().leave_break();
        Ok(())
    }

    fn break_stat(&mut self) -> Result<()> {
        if !self.fs_ref().in_loop() {
            return Err(self.syntax_error("no loop to break"));
        }
        self.advance()?;
        self.fs().emit_break();
        Ok(())
    }

    fn return_stat(&mut self) -> Result<()> {
        self.advance()?;
        if !(self.block_follow() || self.token.kind == TokenKind::Semi) {
            self.exp_list()?;
        }
        let base = self.fs_ref().nactloc as u32;
        self.fs().emit(Op::Return(base));
        // everything above the active locals is consumed as results
        self.fs().stack_level = base;
        Ok(())
    }

    /// An expression statement: either a call, or the first target of an
    /// assignment.
    fn expr_stat(&mut self) -> Result<()> {
        let e = self.simple_exp()?;
        if matches!(self.token.kind, TokenKind::Assign | TokenKind::Comma) {
            let leftover = self.assignment(&e, 1)?;
            self.fs().adjust_stack(leftover);
        } else {
            if !(e.kind == ExpKind::Value && self.fs_ref().last_is_open()) {
                return Err(self.syntax_error("syntax error"));
            }
            // a call statement discards all results
            self.fs().set_call_returns(0);
        }
        Ok(())
    }

    /// `target {',' target} '=' explist`, collected right-recursively.
    /// Stores run in reverse target order; returns how many table/key pairs
    /// were left on the stack for the caller to pop.
    fn assignment(&mut self, target: &ExpDesc, nvars: u32) -> Result<i32> {
        if target.kind == ExpKind::Value {
            return Err(self.syntax_error("syntax error"));
        }
        if nvars as usize > MAX_ASSIGN_VARS {
            return Err(self.limit_error(
                "variables in a multiple assignment",
                MAX_ASSIGN_VARS,
            ));
        }
        let mut leftover = 0i32;
        if self.optional(&TokenKind::Comma)? {
            let next = self.simple_exp()?;
            leftover = self.assignment(&next, nvars + 1)?;
        } else {
            self.check(TokenKind::Assign)?;
            let nexps = self.exp_list()?;
            self.adjust_mult_assign(nvars, nexps);
        }
        let between = leftover + (nvars as i32 - 1);
        if target.kind != ExpKind::Indexed || between == 0 {
            self.fs().store_var(target);
        } else {
            // the pair stays buried; reach under the remaining values
            self.fs().emit(Op::SetTable(between as u32));
            leftover += 2;
        }
        Ok(leftover)
    }

    /// Reconcile value count with target count: an open trailing call
    /// supplies the deficit (or is told to produce nothing), otherwise nils
    /// are pushed or extras popped.
    fn adjust_mult_assign(&mut self, nvars: u32, nexps: u32) {
        let fs = self.fs();
        let mut diff = nexps as i32 - nvars as i32;
        if fs.last_is_open() {
            diff -= 1; // don't count the call itself
            if diff <= 0 {
                fs.set_call_returns((-diff) as u32);
                diff = 0;
            } else {
                fs.set_call_returns(0);
            }
        }
        fs.adjust_stack(diff);
    }

    /// `local NAME {',' NAME} ['=' explist]`. All names are registered
    /// (invisible) before the initializers run, and activated after.
    fn local_stat(&mut self) -> Result<()> {
        self.advance()?;
        let mut nvars = 0usize;
        loop {
            let name = self.check_name()?;
            self.fs().register_local(&name)?;
            nvars += 1;
            if !self.optional(&TokenKind::Comma)? {
                break;
            }
        }
        let nexps = if self.optional(&TokenKind::Assign)? {
            self.exp_list()?
        } else {
            0
        };
        self.adjust_mult_assign(nvars as u32, nexps);
        self.fs().adjust_local_vars(nvars);
        Ok(())
    }

    /// `function NAME {'.' NAME} [':' NAME] body` — the store target is
    /// built by chained indexing; a final `:` method name adds the implicit
    /// `self` parameter.
    fn func_stat(&mut self, line: u32) -> Result<()> {
        self.advance()?;
        let name = self.check_name()?;
        let mut target = self.single_var(&name)?;
        let mut needself = false;
        loop {
            match self.token.kind {
                TokenKind::Dot => {
                    self.advance()?;
                    let field = self.check_name()?;
                    self.fs().tostack(&mut target, 1);
                    self.fs().push_string(&field)?;
                    target = ExpDesc::new(ExpKind::Indexed);
                }
                TokenKind::Colon => {
                    self.advance()?;
                    let field = self.check_name()?;
                    self.fs().tostack(&mut target, 1);
                    self.fs().push_string(&field)?;
                    target = ExpDesc::new(ExpKind::Indexed);
                    needself = true;
                    break;
                }
                _ => break,
            }
        }
        self.body(needself, line)?;
        self.fs().store_var(&target);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Function bodies and closures
    // -----------------------------------------------------------------------

    /// Compile a function body into a fresh prototype and emit the closure
    /// in the enclosing function.
    fn body(&mut self, needself: bool, line: u32) -> Result<()> {
        self.enter_level()?;
        let source = self.chunk.clone();
        self.fs.push(FuncState::new(&source, line));
        self.check(TokenKind::LParen)?;
        if needself {
            self.fs().register_local("self")?;
        }
        self.par_list(needself)?;
        self.check(TokenKind::RParen)?;
        self.chunk()?;
        self.check_match(TokenKind::End, TokenKind::Function, line)?;
        let (proto, upvalues) = self.fs.pop().expect("function state").finish();
        self.push_closure(proto, &upvalues)?;
        self.leave_level();
        Ok(())
    }

    /// Parameter names and an optional trailing `...`. Parameters are
    /// activated at once; a vararg function gets the extra `arg` local. The
    /// caller has already placed the parameters on the stack.
    fn par_list(&mut self, needself: bool) -> Result<()> {
        let mut nparams = usize::from(needself);
        let mut vararg = false;
        if self.token.kind != TokenKind::RParen {
            loop {
                match self.token.kind {
                    TokenKind::Dots => {
                        self.advance()?;
                        vararg = true;
                        break;
                    }
                    TokenKind::Name(_) => {
                        let name = self.check_name()?;
                        self.fs().register_local(&name)?;
                        nparams += 1;
                    }
                    _ => return Err(self.syntax_error("<name> or '...' expected")),
                }
                if !self.optional(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        if nparams > MAX_PARAMS {
            return Err(self.limit_error("parameters", MAX_PARAMS));
        }
        let fs = self.fs();
        fs.adjust_local_vars(nparams);
        fs.proto.num_params = nparams as u32;
        fs.proto.is_vararg = vararg;
        if vararg {
            fs.register_local("arg")?;
            fs.adjust_local_vars(1);
        }
        let level = fs.nactloc as i32;
        fs.delta_stack(level);
        Ok(())
    }

    /// Push the captured values in the enclosing function, then the
    /// closure instruction over the just-finished prototype.
    fn push_closure(&mut self, proto: Proto, upvalues: &[UpvalDesc]) -> Result<()> {
        if self.fs_ref().proto.protos.len() >= MAXARG_U {
            return Err(self.limit_error("nested functions", MAXARG_U));
        }
        let fs = self.fs();
        for up in upvalues {
            match *up {
                UpvalDesc::Local(slot) => {
                    fs.emit(Op::GetLocal(slot));
                }
                UpvalDesc::Global(k) => {
                    fs.emit(Op::GetGlobal(k));
                }
            }
        }
        let index = fs.proto.protos.len() as u32;
        fs.proto.protos.push(proto);
        fs.emit_closure(index, upvalues.len() as u32);
        Ok(())
    }
}
