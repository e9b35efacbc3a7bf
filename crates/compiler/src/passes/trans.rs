//! Tree transformations
//!
//! The one structural rewrite of the front-end: an assignment whose
//! target is a bit-concatenation,
//!
//! ```text
//! a:::b = E;
//! ```
//!
//! becomes a compound statement that evaluates `E` once into a temporary
//! and assigns each operand its shifted slice:
//!
//! ```text
//! { var t = E; a = (t >> 8) as uint<8>; b = t as uint<8>; }
//! ```
//!
//! The rewrite runs after typing, so the synthesized nodes carry their
//! types. Because the replacement introduces a scope frame for the
//! temporary, free variable references moved into it have their `back`
//! coordinates bumped by one.

use std::rc::Rc;

use crate::ast::{AstCtx, BinOp, DeclKind, Node, NodeKind};
use crate::error::CompileError;

pub fn trans(ast: &mut Node, ctx: &Rc<AstCtx>) -> Result<(), CompileError> {
    rewrite(ast, ctx)
}

fn rewrite(n: &mut Node, ctx: &Rc<AstCtx>) -> Result<(), CompileError> {
    // Rewrite this node if it is a bconc assignment...
    let replacement = match &mut n.kind {
        NodeKind::AssStmt { lvalue, exp } if is_bconc(lvalue) => {
            Some(build_compound(ctx, lvalue, exp, n.loc)?)
        }
        _ => None,
    };
    if let Some(r) = replacement {
        *n = r;
        return Ok(());
    }
    // ...otherwise recurse.
    crate::passes::anal::visit_children_mut(n, &mut |c| rewrite(c, ctx))
}

fn is_bconc(n: &Node) -> bool {
    matches!(
        n.kind,
        NodeKind::Binary {
            op: BinOp::BConc,
            ..
        }
    )
}

fn build_compound(
    ctx: &Rc<AstCtx>,
    lvalue: &mut Node,
    exp: &mut Node,
    loc: crate::ast::Loc,
) -> Result<Node, CompileError> {
    // Left-to-right operand list of the (left-associated) concatenation.
    let mut operands: Vec<Node> = Vec::new();
    flatten(std::mem::replace(lvalue, Node::new(ctx, NodeKind::NullStmt, loc)), &mut operands);
    let mut rhs = std::mem::replace(exp, Node::new(ctx, NodeKind::NullStmt, loc));

    // Everything moves under one new frame (the temporary's).
    for o in operands.iter_mut() {
        bump_free_vars(o, 0);
    }
    bump_free_vars(&mut rhs, 0);

    let rhs_ty = rhs
        .ty
        .as_deref()
        .cloned()
        .ok_or_else(|| CompileError::ty(loc, "untyped bit-concatenation source"))?;
    if !matches!(rhs_ty.kind, NodeKind::TypeIntegral { .. }) {
        return Err(CompileError::ty(
            loc,
            "bit-concatenation source must be integral",
        ));
    }

    let sizes: Vec<u32> = operands
        .iter()
        .map(|o| match o.ty.as_deref().map(|t| &t.kind) {
            Some(NodeKind::TypeIntegral { size, .. }) => Ok(*size),
            _ => Err(CompileError::ty(
                o.loc,
                "bit-concatenation operand must be integral",
            )),
        })
        .collect::<Result<_, _>>()?;

    let mut stmts = Vec::with_capacity(operands.len() + 1);
    stmts.push(Node::new(
        ctx,
        NodeKind::Decl {
            kind: DeclKind::Var,
            name: "__bconc".to_string(),
            init: Box::new(rhs),
        },
        loc,
    ));

    // Operand i takes the slice above the operands to its right.
    let mut shift: u32 = sizes.iter().sum();
    for (o, osize) in operands.into_iter().zip(sizes) {
        shift -= osize;
        let oty = o
            .ty
            .as_deref()
            .cloned()
            .ok_or_else(|| CompileError::ty(loc, "untyped bit-concatenation operand"))?;
        let mut tmp = Node::new(
            ctx,
            NodeKind::Var {
                name: "__bconc".to_string(),
                back: 0,
                over: 0,
            },
            loc,
        );
        tmp.ty = Some(Box::new(rhs_ty.clone()));
        let src = if shift > 0 {
            let mut amount = Node::int_lit(ctx, shift as i64, 32, true, loc);
            amount.ty = Some(Box::new(Node::new(
                ctx,
                NodeKind::TypeIntegral {
                    size: 32,
                    signed: true,
                },
                loc,
            )));
            let mut sh = Node::new(
                ctx,
                NodeKind::Binary {
                    op: BinOp::Shr,
                    left: Box::new(tmp),
                    right: Box::new(amount),
                },
                loc,
            );
            sh.ty = Some(Box::new(rhs_ty.clone()));
            sh
        } else {
            tmp
        };
        let mut cast = Node::new(
            ctx,
            NodeKind::Cast {
                ty: Box::new(oty.clone()),
                exp: Box::new(src),
            },
            loc,
        );
        cast.ty = Some(Box::new(oty));
        stmts.push(Node::new(
            ctx,
            NodeKind::AssStmt {
                lvalue: Box::new(o),
                exp: Box::new(cast),
            },
            loc,
        ));
    }
    Ok(Node::new(ctx, NodeKind::CompStmt(stmts), loc))
}

fn flatten(n: Node, out: &mut Vec<Node>) {
    match n.kind {
        NodeKind::Binary {
            op: BinOp::BConc,
            left,
            right,
        } => {
            flatten(*left, out);
            flatten(*right, out);
        }
        _ => out.push(n),
    }
}

/// Bump the `back` coordinate of references that escape this subtree by
/// one frame. `depth` is the number of frames opened between the subtree
/// root and the node under inspection.
fn bump_free_vars(n: &mut Node, depth: u32) {
    match &mut n.kind {
        NodeKind::Var { back, .. } | NodeKind::TypeNamed { back, .. } => {
            if *back >= depth {
                *back += 1;
            }
        }
        NodeKind::CompStmt(stmts) => {
            let mut d = depth;
            for s in stmts {
                // A compound opens its frame at its first declaration.
                if d == depth && matches!(s.kind, NodeKind::Decl { .. }) {
                    d += 1;
                }
                bump_free_vars(s, d);
            }
            return;
        }
        NodeKind::Func { body, .. } => {
            bump_free_vars(body, depth + 1);
            return;
        }
        NodeKind::ForInStmt {
            container, body, ..
        } => {
            bump_free_vars(container, depth);
            bump_free_vars(body, depth + 1);
            return;
        }
        NodeKind::TryStmt {
            body,
            cond,
            handler,
            else_handler,
            ..
        } => {
            bump_free_vars(body, depth);
            if let Some(c) = cond {
                bump_free_vars(c, depth + 1);
            }
            bump_free_vars(handler, depth + 1);
            if let Some(e) = else_handler {
                bump_free_vars(e, depth + 1);
            }
            return;
        }
        NodeKind::TypeStruct {
            fields, methods, ..
        } => {
            for f in fields {
                bump_free_vars(&mut f.ty, depth + 1);
                for e in [
                    f.constraint.as_mut(),
                    f.init.as_mut(),
                    f.label.as_mut(),
                    f.optcond.as_mut(),
                ]
                .into_iter()
                .flatten()
                {
                    bump_free_vars(e, depth + 1);
                }
            }
            for m in methods {
                bump_free_vars(&mut m.body, depth + 1);
            }
            return;
        }
        _ => {}
    }
    // Default: visit children at the same depth.
    let _ = crate::passes::anal::visit_children_mut(n, &mut |c| {
        bump_free_vars(c, depth);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstCtx;
    use crate::env::CEnv;
    use crate::parser::{parse, StartSymbol};
    use crate::passes::typify::typify;

    #[test]
    fn test_bconc_assignment_rewrites() {
        let ctx = AstCtx::new();
        let mut env = CEnv::new();
        let mut ast = parse(
            "var a = 0UB; var b = 0UB; a:::b = 0x1234UH;",
            &ctx,
            &mut env,
            StartSymbol::Program,
            false,
            None,
        )
        .unwrap();
        typify(&mut ast, &mut env, &ctx, 2).unwrap();
        trans(&mut ast, &ctx).unwrap();

        match &ast.kind {
            NodeKind::Program(stmts) => match &stmts[2].kind {
                NodeKind::CompStmt(inner) => {
                    assert_eq!(inner.len(), 3);
                    assert!(matches!(inner[0].kind, NodeKind::Decl { .. }));
                    // The moved operands now sit under the temporary's
                    // frame: their back coordinates were bumped.
                    match &inner[1].kind {
                        NodeKind::AssStmt { lvalue, .. } => match &lvalue.kind {
                            NodeKind::Var { back, .. } => assert_eq!(*back, 1),
                            other => panic!("expected a variable, got {:?}", other),
                        },
                        other => panic!("expected an assignment, got {:?}", other),
                    }
                }
                other => panic!("expected the rewrite compound, got {:?}", other),
            },
            other => panic!("expected a program, got {:?}", other),
        }
    }
}
