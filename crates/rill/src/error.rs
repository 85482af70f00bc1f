//! Compilation errors.
//!
//! Every failure is fatal to the compilation: the parser propagates it
//! straight out of [`crate::compile`] and no partial prototype escapes.
//! Errors carry the chunk name and the source line of the offending token.

use thiserror::Error;

/// An error produced while compiling a chunk.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A malformed token: unfinished string, bad escape, malformed number.
    #[error("{chunk}:{line}: {message} near '{near}'")]
    Lexical {
        chunk: String,
        line: u32,
        message: String,
        near: String,
    },

    /// A syntactic or semantic error: unexpected token, `'X' expected`,
    /// `cannot access a variable in outer function`, `no loop to break`, …
    #[error("{chunk}:{line}: {message} near '{near}'")]
    Syntax {
        chunk: String,
        line: u32,
        message: String,
        near: String,
    },

    /// A compile-time resource limit was exceeded (locals, parameters,
    /// upvalues, constants, assignment targets, nesting depth).
    #[error("{chunk}:{line}: too many {what} (limit is {limit})")]
    Limit {
        chunk: String,
        line: u32,
        what: &'static str,
        limit: usize,
    },
}

impl Error {
    /// The source line the error points at.
    pub fn line(&self) -> u32 {
        match self {
            Error::Lexical { line, .. } | Error::Syntax { line, .. } | Error::Limit { line, .. } => {
                *line
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
