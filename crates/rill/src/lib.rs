//! Rill — a single-pass bytecode compiler for a small embeddable
//! scripting language.
//!
//! Rill source is lexed, parsed and compiled to stack-machine bytecode in
//! one pass; there is no AST. The recursive-descent parser drives the
//! bytecode emitter directly while it recognizes the grammar, tracking a
//! symbolic operand stack, threading forward jumps through intrusive patch
//! lists, and resolving every name to a local slot, an explicit `%upvalue`
//! capture, or a global. Compiling a chunk yields a [`Proto`]: code,
//! constant pools, nested prototypes and debug metadata, ready for a
//! virtual machine.
//!
//! # Quick start
//!
//! ```
//! use rill::compile;
//!
//! let proto = compile("local x = 1\nreturn x + 2", "demo").unwrap();
//! assert_eq!(proto.num_params, 0);
//! assert_eq!(proto.locvars.len(), 1);
//! println!("{}", rill::disassemble(&proto));
//! ```
//!
//! # The language
//!
//! - Values: `nil`, numbers, strings, tables, functions
//! - `local` declarations and multiple assignment (`a, b = b, a`)
//! - `if`/`elseif`/`else`, `while`, `repeat`/`until`, numeric and generic
//!   `for`, `break`
//! - Table constructors `{10, 20; a = 1, [k] = v}` with list and record
//!   parts
//! - Function statements (`function t.a:m(x) ... end`), anonymous function
//!   expressions, method-call sugar (`t:m(x)`)
//! - Explicit upvalue captures: `%name` freezes a value from the
//!   immediately enclosing function at closure creation
//! - Operators `+ - * / ^ ..`, comparisons, and short-circuiting
//!   `and`/`or`/`not`
//!
//! # What this crate is not
//!
//! There is no interpreter here, no optimizer beyond the emitter's peephole
//! fusions, no type checking, and no persistent compiled format. Errors are
//! fatal to the compilation and carry the chunk name and source line:
//!
//! ```
//! let err = rill::compile("x = ", "demo").unwrap_err();
//! assert_eq!(err.to_string(), "demo:1: unexpected symbol near '<eof>'");
//! ```

mod bytecode;
mod codegen;
mod dis;
mod error;
mod lexer;
mod parser;
mod token;

pub use bytecode::{LFIELDS_PER_FLUSH, LocVar, MAXARG_U, MULT_RET, Op, Proto, RFIELDS_PER_FLUSH};
pub use dis::disassemble;
pub use error::{Error, Result};
pub use parser::{Limits, compile, compile_with_limits};
