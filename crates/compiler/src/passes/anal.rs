//! Structural analysis
//!
//! `anal1` runs on the raw parse tree: break/continue must sit inside a
//! loop, return inside a function or method, assignment targets must be
//! lvalues. `anal2` runs after typing and transformation and asserts that
//! every expression ended up with a type, catching gaps before code
//! generation.

use crate::ast::{lvalue_p, FormatPart, Node, NodeKind};
use crate::error::CompileError;

pub fn anal1(ast: &Node) -> Result<(), CompileError> {
    let mut a = Anal {
        loop_depth: 0,
        func_depth: 0,
    };
    a.stmt(ast)
}

struct Anal {
    loop_depth: u32,
    func_depth: u32,
}

impl Anal {
    fn stmt(&mut self, n: &Node) -> Result<(), CompileError> {
        match &n.kind {
            NodeKind::Program(stmts) | NodeKind::CompStmt(stmts) => {
                for s in stmts {
                    self.stmt(s)?;
                }
                Ok(())
            }
            NodeKind::BreakStmt | NodeKind::ContinueStmt => {
                if self.loop_depth == 0 {
                    return Err(CompileError::anal(
                        n.loc,
                        "break/continue outside a loop",
                    ));
                }
                Ok(())
            }
            NodeKind::ReturnStmt(e) => {
                if self.func_depth == 0 {
                    return Err(CompileError::anal(n.loc, "return outside a function"));
                }
                if let Some(e) = e {
                    self.exp(e)?;
                }
                Ok(())
            }
            NodeKind::WhileStmt { cond, body } => {
                self.exp(cond)?;
                self.loop_depth += 1;
                let r = self.stmt(body);
                self.loop_depth -= 1;
                r
            }
            NodeKind::ForInStmt {
                container, body, ..
            } => {
                self.exp(container)?;
                self.loop_depth += 1;
                let r = self.stmt(body);
                self.loop_depth -= 1;
                r
            }
            NodeKind::IfStmt {
                cond,
                then_s,
                else_s,
            } => {
                self.exp(cond)?;
                self.stmt(then_s)?;
                if let Some(e) = else_s {
                    self.stmt(e)?;
                }
                Ok(())
            }
            NodeKind::AssStmt { lvalue, exp } => {
                if !lvalue_p(lvalue) {
                    return Err(CompileError::anal(
                        lvalue.loc,
                        "left side of assignment is not assignable",
                    ));
                }
                self.exp(lvalue)?;
                self.exp(exp)
            }
            NodeKind::Decl { init, .. } => self.exp(init),
            NodeKind::TryStmt {
                body,
                cond,
                handler,
                else_handler,
                ..
            } => {
                self.stmt(body)?;
                if let Some(c) = cond {
                    self.exp(c)?;
                }
                self.stmt(handler)?;
                if let Some(e) = else_handler {
                    self.stmt(e)?;
                }
                Ok(())
            }
            NodeKind::RaiseStmt(e) => {
                if let Some(e) = e {
                    self.exp(e)?;
                }
                Ok(())
            }
            NodeKind::PrintStmt { parts, .. } => self.parts(parts),
            NodeKind::ExpStmt(e) | NodeKind::IncrDecr { exp: e, .. } => self.exp(e),
            NodeKind::NullStmt | NodeKind::AsmStmt(_) => Ok(()),
            // Types can appear as declaration initializers.
            _ => self.exp(n),
        }
    }

    fn parts(&mut self, parts: &[FormatPart]) -> Result<(), CompileError> {
        for p in parts {
            match p {
                FormatPart::Lit(_) => {}
                FormatPart::Val(e) | FormatPart::Str(e) => self.exp(e)?,
            }
        }
        Ok(())
    }

    fn exp(&mut self, n: &Node) -> Result<(), CompileError> {
        match &n.kind {
            NodeKind::Unary { operand, .. } => self.exp(operand),
            NodeKind::Binary { left, right, .. } => {
                self.exp(left)?;
                self.exp(right)
            }
            NodeKind::Ternary {
                cond,
                then_e,
                else_e,
            } => {
                self.exp(cond)?;
                self.exp(then_e)?;
                self.exp(else_e)
            }
            NodeKind::Funcall { func, args } => {
                self.exp(func)?;
                for a in args {
                    self.exp(a)?;
                }
                Ok(())
            }
            NodeKind::StructRef { base, .. } => self.exp(base),
            NodeKind::Indexer { entity, index } => {
                self.exp(entity)?;
                self.exp(index)
            }
            NodeKind::Trimmer { entity, from, to } => {
                self.exp(entity)?;
                self.exp(from)?;
                self.exp(to)
            }
            NodeKind::Cast { ty, exp } | NodeKind::Isa { ty, exp } => {
                self.exp(ty)?;
                self.exp(exp)
            }
            NodeKind::MapExp { ty, ios, offset, .. } => {
                self.exp(ty)?;
                if let Some(i) = ios {
                    self.exp(i)?;
                }
                self.exp(offset)
            }
            NodeKind::ArrayLit(inits) => {
                for e in inits {
                    self.exp(e)?;
                }
                Ok(())
            }
            NodeKind::ArrayCons { ty, inits } => {
                self.exp(ty)?;
                for e in inits {
                    self.exp(e)?;
                }
                Ok(())
            }
            NodeKind::StructCons { ty, fields } => {
                self.exp(ty)?;
                for (_, v) in fields {
                    self.exp(v)?;
                }
                Ok(())
            }
            NodeKind::Lambda(f) => self.exp(f),
            NodeKind::Func { body, .. } => {
                self.func_depth += 1;
                let in_loop = std::mem::replace(&mut self.loop_depth, 0);
                let r = self.stmt(body);
                self.loop_depth = in_loop;
                self.func_depth -= 1;
                r
            }
            NodeKind::FormatExp(parts) => self.parts(parts),
            NodeKind::OffsetLit { magnitude, .. } => self.exp(magnitude),
            NodeKind::TypeStruct {
                fields, methods, ..
            } => {
                for f in fields {
                    self.exp(&f.ty)?;
                    for e in [&f.constraint, &f.init, &f.label, &f.optcond]
                        .into_iter()
                        .flatten()
                    {
                        self.exp(e)?;
                    }
                }
                for m in methods {
                    self.func_depth += 1;
                    let in_loop = std::mem::replace(&mut self.loop_depth, 0);
                    let r = self.stmt(&m.body);
                    self.loop_depth = in_loop;
                    self.func_depth -= 1;
                    r?;
                }
                Ok(())
            }
            NodeKind::TypeArray { elem, bound } => {
                self.exp(elem)?;
                if let Some(b) = bound {
                    self.exp(b)?;
                }
                Ok(())
            }
            NodeKind::TypeOffset { base, .. } => self.exp(base),
            NodeKind::TypeFunction { ret, args } => {
                self.exp(ret)?;
                for a in args {
                    self.exp(a)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Post-typify sanity: every expression must carry a type by now.
pub fn anal2(ast: &Node) -> Result<(), CompileError> {
    check_typed(ast)
}

fn check_typed(n: &Node) -> Result<(), CompileError> {
    if is_expression(n) && n.ty.is_none() {
        return Err(CompileError::anal(
            n.loc,
            "internal: expression left untyped by the front-end",
        ));
    }
    visit_children(n, &mut |c| check_typed(c))
}

fn is_expression(n: &Node) -> bool {
    matches!(
        n.kind,
        NodeKind::Int { .. }
            | NodeKind::Str(_)
            | NodeKind::OffsetLit { .. }
            | NodeKind::Var { .. }
            | NodeKind::Unary { .. }
            | NodeKind::Binary { .. }
            | NodeKind::Ternary { .. }
            | NodeKind::Funcall { .. }
            | NodeKind::StructRef { .. }
            | NodeKind::Indexer { .. }
            | NodeKind::Trimmer { .. }
            | NodeKind::Cast { .. }
            | NodeKind::Isa { .. }
            | NodeKind::MapExp { .. }
            | NodeKind::ArrayLit(_)
            | NodeKind::ArrayCons { .. }
            | NodeKind::StructCons { .. }
            | NodeKind::Lambda(_)
            | NodeKind::FormatExp(_)
    )
}

/// Apply `f` to every child node.
pub fn visit_children(
    n: &Node,
    f: &mut dyn FnMut(&Node) -> Result<(), CompileError>,
) -> Result<(), CompileError> {
    let mut go = |c: &Node| f(c);
    match &n.kind {
        NodeKind::Program(xs) | NodeKind::CompStmt(xs) | NodeKind::ArrayLit(xs) => {
            for x in xs {
                go(x)?;
            }
        }
        NodeKind::OffsetLit { magnitude: a, .. }
        | NodeKind::Unary { operand: a, .. }
        | NodeKind::ExpStmt(a)
        | NodeKind::Lambda(a)
        | NodeKind::IncrDecr { exp: a, .. }
        | NodeKind::TypeOffset { base: a, .. }
        | NodeKind::StructRef { base: a, .. } => go(a)?,
        NodeKind::Binary { left, right, .. } => {
            go(left)?;
            go(right)?;
        }
        NodeKind::Ternary {
            cond,
            then_e,
            else_e,
        } => {
            go(cond)?;
            go(then_e)?;
            go(else_e)?;
        }
        NodeKind::Funcall { func, args } => {
            go(func)?;
            for a in args {
                go(a)?;
            }
        }
        NodeKind::Indexer { entity, index } => {
            go(entity)?;
            go(index)?;
        }
        NodeKind::Trimmer { entity, from, to } => {
            go(entity)?;
            go(from)?;
            go(to)?;
        }
        NodeKind::Cast { ty, exp } | NodeKind::Isa { ty, exp } => {
            go(ty)?;
            go(exp)?;
        }
        NodeKind::MapExp { ty, ios, offset, .. } => {
            go(ty)?;
            if let Some(i) = ios {
                go(i)?;
            }
            go(offset)?;
        }
        NodeKind::ArrayCons { ty, inits } => {
            go(ty)?;
            for x in inits {
                go(x)?;
            }
        }
        NodeKind::StructCons { ty, fields } => {
            go(ty)?;
            for (_, v) in fields {
                go(v)?;
            }
        }
        NodeKind::Func { ret, args, body } => {
            go(ret)?;
            for a in args {
                go(&a.ty)?;
            }
            go(body)?;
        }
        NodeKind::FormatExp(parts) | NodeKind::PrintStmt { parts, .. } => {
            for p in parts {
                match p {
                    FormatPart::Lit(_) => {}
                    FormatPart::Val(e) | FormatPart::Str(e) => go(e)?,
                }
            }
        }
        NodeKind::Decl { init, .. } => go(init)?,
        NodeKind::AssStmt { lvalue, exp } => {
            go(lvalue)?;
            go(exp)?;
        }
        NodeKind::IfStmt {
            cond,
            then_s,
            else_s,
        } => {
            go(cond)?;
            go(then_s)?;
            if let Some(e) = else_s {
                go(e)?;
            }
        }
        NodeKind::WhileStmt { cond, body } => {
            go(cond)?;
            go(body)?;
        }
        NodeKind::ForInStmt {
            container, body, ..
        } => {
            go(container)?;
            go(body)?;
        }
        NodeKind::ReturnStmt(e) | NodeKind::RaiseStmt(e) => {
            if let Some(e) = e {
                go(e)?;
            }
        }
        NodeKind::TryStmt {
            body,
            cond,
            handler,
            else_handler,
            ..
        } => {
            go(body)?;
            if let Some(c) = cond {
                go(c)?;
            }
            go(handler)?;
            if let Some(e) = else_handler {
                go(e)?;
            }
        }
        NodeKind::TypeArray { elem, bound } => {
            go(elem)?;
            if let Some(b) = bound {
                go(b)?;
            }
        }
        NodeKind::TypeStruct {
            fields, methods, ..
        } => {
            for fd in fields {
                go(&fd.ty)?;
                for e in [&fd.constraint, &fd.init, &fd.label, &fd.optcond]
                    .into_iter()
                    .flatten()
                {
                    go(e)?;
                }
            }
            for m in methods {
                go(&m.ret)?;
                go(&m.body)?;
            }
        }
        NodeKind::TypeFunction { ret, args } => {
            go(ret)?;
            for a in args {
                go(a)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Mutable counterpart of [`visit_children`].
pub fn visit_children_mut(
    n: &mut Node,
    f: &mut dyn FnMut(&mut Node) -> Result<(), CompileError>,
) -> Result<(), CompileError> {
    use crate::ast::FormatPart;
    match &mut n.kind {
        NodeKind::Program(xs) | NodeKind::CompStmt(xs) | NodeKind::ArrayLit(xs) => {
            for x in xs {
                f(x)?;
            }
        }
        NodeKind::OffsetLit { magnitude: a, .. }
        | NodeKind::Unary { operand: a, .. }
        | NodeKind::ExpStmt(a)
        | NodeKind::Lambda(a)
        | NodeKind::IncrDecr { exp: a, .. }
        | NodeKind::TypeOffset { base: a, .. }
        | NodeKind::StructRef { base: a, .. } => f(a)?,
        NodeKind::Binary { left, right, .. } => {
            f(left)?;
            f(right)?;
        }
        NodeKind::Ternary {
            cond,
            then_e,
            else_e,
        } => {
            f(cond)?;
            f(then_e)?;
            f(else_e)?;
        }
        NodeKind::Funcall { func, args } => {
            f(func)?;
            for a in args {
                f(a)?;
            }
        }
        NodeKind::Indexer { entity, index } => {
            f(entity)?;
            f(index)?;
        }
        NodeKind::Trimmer { entity, from, to } => {
            f(entity)?;
            f(from)?;
            f(to)?;
        }
        NodeKind::Cast { ty, exp } | NodeKind::Isa { ty, exp } => {
            f(ty)?;
            f(exp)?;
        }
        NodeKind::MapExp { ty, ios, offset, .. } => {
            f(ty)?;
            if let Some(i) = ios {
                f(i)?;
            }
            f(offset)?;
        }
        NodeKind::ArrayCons { ty, inits } => {
            f(ty)?;
            for x in inits {
                f(x)?;
            }
        }
        NodeKind::StructCons { ty, fields } => {
            f(ty)?;
            for (_, v) in fields {
                f(v)?;
            }
        }
        NodeKind::Func { ret, args, body } => {
            f(ret)?;
            for a in args {
                f(&mut a.ty)?;
            }
            f(body)?;
        }
        NodeKind::FormatExp(parts) | NodeKind::PrintStmt { parts, .. } => {
            for p in parts {
                match p {
                    FormatPart::Lit(_) => {}
                    FormatPart::Val(e) | FormatPart::Str(e) => f(e)?,
                }
            }
        }
        NodeKind::Decl { init, .. } => f(init)?,
        NodeKind::AssStmt { lvalue, exp } => {
            f(lvalue)?;
            f(exp)?;
        }
        NodeKind::IfStmt {
            cond,
            then_s,
            else_s,
        } => {
            f(cond)?;
            f(then_s)?;
            if let Some(e) = else_s {
                f(e)?;
            }
        }
        NodeKind::WhileStmt { cond, body } => {
            f(cond)?;
            f(body)?;
        }
        NodeKind::ForInStmt {
            container, body, ..
        } => {
            f(container)?;
            f(body)?;
        }
        NodeKind::ReturnStmt(e) | NodeKind::RaiseStmt(e) => {
            if let Some(e) = e {
                f(e)?;
            }
        }
        NodeKind::TryStmt {
            body,
            cond,
            handler,
            else_handler,
            ..
        } => {
            f(body)?;
            if let Some(c) = cond {
                f(c)?;
            }
            f(handler)?;
            if let Some(e) = else_handler {
                f(e)?;
            }
        }
        NodeKind::TypeArray { elem, bound } => {
            f(elem)?;
            if let Some(b) = bound {
                f(b)?;
            }
        }
        NodeKind::TypeStruct {
            fields, methods, ..
        } => {
            for fd in fields {
                f(&mut fd.ty)?;
                for e in [
                    fd.constraint.as_mut(),
                    fd.init.as_mut(),
                    fd.label.as_mut(),
                    fd.optcond.as_mut(),
                ]
                .into_iter()
                .flatten()
                {
                    f(e)?;
                }
            }
            for m in methods {
                f(&mut m.ret)?;
                f(&mut m.body)?;
            }
        }
        NodeKind::TypeFunction { ret, args } => {
            f(ret)?;
            for a in args {
                f(a)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstCtx;
    use crate::env::CEnv;
    use crate::parser::{parse, StartSymbol};

    fn anal_of(src: &str) -> Result<(), CompileError> {
        let ctx = AstCtx::new();
        let mut env = CEnv::new();
        let ast = parse(src, &ctx, &mut env, StartSymbol::Program, false, None)
            .expect("must parse");
        anal1(&ast)
    }

    #[test]
    fn test_break_outside_loop() {
        assert!(anal_of("break;").is_err());
        assert!(anal_of("while (1) { break; }").is_ok());
    }

    #[test]
    fn test_return_outside_function() {
        assert!(anal_of("return 1;").is_err());
        assert!(anal_of("fun f = int<32>: { return 1; }").is_ok());
    }

    #[test]
    fn test_loop_does_not_leak_into_lambda() {
        // A lambda body is not "inside" the enclosing loop.
        assert!(anal_of("while (1) { var f = lambda void: { break; }; }").is_err());
    }

    #[test]
    fn test_bad_lvalue() {
        assert!(anal_of("var a = 1; a + 1 = 2;").is_err());
        assert!(anal_of("var a = 1; a = 2;").is_ok());
    }
}
