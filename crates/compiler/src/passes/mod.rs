//! The pass pipeline
//!
//! Each pass is one walk over the tree; the runner stops at the first
//! error. Order: structural analysis, typing (with promotion), the
//! bit-concatenation rewrite, constant folding, the post-typing sanity
//! check, and code generation.

pub mod anal;
pub mod fold;
pub mod gen;
pub mod trans;
pub mod typify;

use std::rc::Rc;

use jab_runtime::program::Program;
use jab_runtime::Vm;
use tracing::debug;

use crate::ast::{AstCtx, Node};
use crate::env::CEnv;
use crate::error::CompileError;
use crate::parser::StartSymbol;

/// Run the whole pipeline over a parsed tree, producing an executable
/// program. `ntop_new` is the number of top-level declarations the parse
/// added to the environment.
pub fn run(
    ast: &mut Node,
    env: &mut CEnv,
    ctx: &Rc<AstCtx>,
    vm: &mut Vm,
    start: StartSymbol,
    ntop_new: usize,
) -> Result<Rc<Program>, CompileError> {
    anal::anal1(ast)?;
    debug!("anal1 done");
    typify::typify(ast, env, ctx, ntop_new)?;
    debug!("typify done");
    trans::trans(ast, ctx)?;
    debug!("trans done");
    fold::fold(ast);
    debug!("fold done");
    anal::anal2(ast)?;
    let p = gen::generate(ast, vm, start)?;
    debug!(len = p.len(), "generated");
    Ok(p)
}
