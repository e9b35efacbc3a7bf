//! Compiler error types.

use std::fmt;

use crate::ast::Loc;
use jab_runtime::AsmError;

/// Error of any compiler stage. Parse, type and analysis errors carry the
/// source location of the offending construct.
#[derive(Debug)]
pub enum CompileError {
    Parse { loc: Loc, msg: String },
    Type { loc: Loc, msg: String },
    Anal { loc: Loc, msg: String },
    /// Assembly-edit error from the program builder.
    Asm(AsmError),
    Io(std::io::Error),
    /// An exception escaped while running support code (e.g. the
    /// standard prelude), rendered to text.
    Runtime(String),
}

impl CompileError {
    pub fn parse(loc: Loc, msg: impl Into<String>) -> Self {
        CompileError::Parse {
            loc,
            msg: msg.into(),
        }
    }

    pub fn ty(loc: Loc, msg: impl Into<String>) -> Self {
        CompileError::Type {
            loc,
            msg: msg.into(),
        }
    }

    pub fn anal(loc: Loc, msg: impl Into<String>) -> Self {
        CompileError::Anal {
            loc,
            msg: msg.into(),
        }
    }

    /// Numeric code in the parser-contract convention: 1 for syntax
    /// errors, 2 for everything else.
    pub fn code(&self) -> i32 {
        match self {
            CompileError::Parse { .. } => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Parse { loc, msg } => write!(f, "{}: syntax error: {}", loc, msg),
            CompileError::Type { loc, msg } => write!(f, "{}: type error: {}", loc, msg),
            CompileError::Anal { loc, msg } => write!(f, "{}: error: {}", loc, msg),
            CompileError::Asm(e) => write!(f, "assembly error: {}", e),
            CompileError::Io(e) => write!(f, "io error: {}", e),
            CompileError::Runtime(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<AsmError> for CompileError {
    fn from(e: AsmError) -> Self {
        CompileError::Asm(e)
    }
}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::Io(e)
    }
}
