//! Jab Compiler Library
//!
//! Compiles Jab source - a language for describing, querying and
//! mutating binary data - into programs for the Jab virtual machine, and
//! drives their execution.
//!
//! The pipeline: tokenize, parse (binding names against the compile-time
//! environment), analyse, type, transform, fold, and generate bytecode.
//! The [`Compiler`] driver makes each compile transactional over the
//! environment: declarations from failed compiles never leak.
//!
//! ```no_run
//! use jab_runtime::Vm;
//! use jabc::Compiler;
//!
//! let mut vm = Vm::new();
//! let mut compiler = Compiler::new(&mut vm, 0).unwrap();
//! let v = compiler.execute_expression(&mut vm, "2 + 3 * 4").unwrap();
//! ```

pub mod ast;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod passes;

pub use config::JabConfig;
pub use driver::{describe_exception, Compiler, JabError, FLAG_NOSTDTYPES};
pub use error::CompileError;
pub use parser::{AlienLit, StartSymbol};
