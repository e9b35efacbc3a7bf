//! Type assignment
//!
//! Walks the tree once, attaching a type to every expression node and
//! inserting explicit casts where implicit promotion is allowed: integral
//! widening/narrowing, offset unit changes, array bound adjustments, and
//! anything into `any`. Scope frames are pushed and popped in exactly the
//! parser's discipline so `(back, over)` coordinates resolve to the same
//! declarations.
//!
//! Top-level declarations were already registered by the parser; this
//! pass fills in their inferred types instead of re-registering them.

use std::rc::Rc;

use crate::ast::{
    lvalue_p, type_equal_p, type_incr_step, type_integrable_p, type_integral_promote,
    type_is_exception, type_mappable_p, type_promoteable_p, AstCtx, BinOp, DeclKind, FormatPart,
    Loc, Node, NodeKind, UnOp,
};
use crate::env::{CEnv, Decl};
use crate::error::CompileError;

pub fn typify(
    ast: &mut Node,
    env: &mut CEnv,
    ctx: &Rc<AstCtx>,
    ntop_new: usize,
) -> Result<(), CompileError> {
    let top_base = env.toplevel_len() - ntop_new;
    let mut t = Typify {
        env,
        ctx: ctx.clone(),
        ret_stack: Vec::new(),
        top_base,
        top_seen: 0,
        at_top: true,
    };
    t.stmt(ast)
}

struct Typify<'e> {
    env: &'e mut CEnv,
    ctx: Rc<AstCtx>,
    /// Return types of the enclosing functions, innermost last.
    ret_stack: Vec<Node>,
    /// First top-level slot belonging to this compile.
    top_base: usize,
    top_seen: usize,
    /// Whether the walk is at program nesting depth (declarations update
    /// existing top-level slots instead of registering).
    at_top: bool,
}

fn terr(loc: Loc, msg: impl Into<String>) -> CompileError {
    CompileError::ty(loc, msg)
}

impl<'e> Typify<'e> {
    // -- helpers -----------------------------------------------------------

    fn ity(&self, size: u32, signed: bool, loc: Loc) -> Node {
        Node::new(&self.ctx, NodeKind::TypeIntegral { size, signed }, loc)
    }

    fn int32(&self, loc: Loc) -> Node {
        self.ity(32, true, loc)
    }

    /// Resolve named types to their definitions (for classification).
    ///
    /// Resolution is by name in the scope of the use site: type nodes are
    /// copied into inferred variable types and inspected at arbitrary
    /// nesting depths, where declaration-relative coordinates would no
    /// longer line up.
    fn resolve(&self, t: &Node) -> Result<Node, CompileError> {
        let mut cur = t.clone();
        for _ in 0..32 {
            match &cur.kind {
                NodeKind::TypeNamed { name, .. } => match self.env.lookup(name) {
                    Some((_, _, d)) if d.kind == DeclKind::Type => match d.ty.clone() {
                        Some(def) => cur = def,
                        None => {
                            return Err(terr(
                                t.loc,
                                format!("type '{}' has no definition here", name),
                            ))
                        }
                    },
                    _ => {
                        return Err(terr(
                            t.loc,
                            format!("type '{}' is not declared here", name),
                        ))
                    }
                },
                _ => return Ok(cur),
            }
        }
        Err(terr(t.loc, "type alias chain too deep"))
    }

    fn exp_type(&self, e: &Node) -> Result<Node, CompileError> {
        e.ty.as_deref()
            .cloned()
            .ok_or_else(|| terr(e.loc, "expression has no type"))
    }

    /// Promote `e` to `to`, inserting a cast when allowed.
    fn promote(&self, e: Node, to: &Node) -> Result<Node, CompileError> {
        let et = self.exp_type(&e)?;
        if type_equal_p(&et, to) {
            return Ok(e);
        }
        let ret = self.resolve(&et)?;
        let rto = self.resolve(to)?;
        if type_equal_p(&ret, &rto) || type_promoteable_p(&ret, &rto, true) {
            let loc = e.loc;
            let literal = e.literal;
            // The cast carries the representation type so the generated
            // conversion is concrete even for named targets; the node
            // keeps the nominal type.
            let cast_ty = representation_type(to, &rto);
            let mut c = Node::new(
                &self.ctx,
                NodeKind::Cast {
                    ty: Box::new(cast_ty),
                    exp: Box::new(e),
                },
                loc,
            );
            c.ty = Some(Box::new(to.clone()));
            c.literal = literal;
            return Ok(c);
        }
        Err(terr(
            e.loc,
            "operand type cannot be promoted to the expected type",
        ))
    }

    fn promote_in_place(&self, slot: &mut Box<Node>, to: &Node) -> Result<(), CompileError> {
        let e = std::mem::replace(
            slot.as_mut(),
            Node::new(&self.ctx, NodeKind::NullStmt, Loc::default()),
        );
        *slot = Box::new(self.promote(e, to)?);
        Ok(())
    }

    fn expect_integral(&self, e: &Node) -> Result<(u32, bool), CompileError> {
        let t = self.resolve(&self.exp_type(e)?)?;
        if !type_integrable_p(&t) {
            return Err(terr(e.loc, "expected an integral value"));
        }
        match t.kind {
            NodeKind::TypeIntegral { size, signed } => Ok((size, signed)),
            _ => Err(terr(e.loc, "expected an integral value")),
        }
    }

    // -- statements --------------------------------------------------------

    fn stmt(&mut self, n: &mut Node) -> Result<(), CompileError> {
        match &mut n.kind {
            NodeKind::Program(stmts) => {
                for s in stmts {
                    self.stmt(s)?;
                }
                Ok(())
            }
            NodeKind::CompStmt(stmts) => {
                let was_top = self.at_top;
                self.at_top = false;
                let mut framed = false;
                let mut r = Ok(());
                for s in stmts.iter_mut() {
                    if !framed && matches!(s.kind, NodeKind::Decl { .. }) {
                        self.env.push_frame();
                        framed = true;
                    }
                    r = self.stmt(s);
                    if r.is_err() {
                        break;
                    }
                }
                if framed {
                    self.env.pop_frame();
                }
                self.at_top = was_top;
                r
            }
            NodeKind::Decl { kind, name, init } => {
                let kind = *kind;
                let name = name.clone();
                match kind {
                    DeclKind::Var => {
                        self.exp(init)?;
                        let ty = self.exp_type(init)?;
                        self.register_or_update(&name, DeclKind::Var, Some(ty));
                    }
                    DeclKind::Type => {
                        // The definition itself may contain constrained
                        // fields to type-check.
                        self.register_or_update(&name, DeclKind::Type, Some((**init).clone()));
                        self.type_spec(init)?;
                        // Re-store with the typified definition.
                        self.update_last(&name, (**init).clone());
                    }
                    DeclKind::Fun => {
                        // Bind the signature before the body for
                        // recursion.
                        let fty = self.func_signature(init)?;
                        self.register_or_update(&name, DeclKind::Fun, Some(fty));
                        self.exp(init)?;
                    }
                }
                Ok(())
            }
            NodeKind::AssStmt { lvalue, exp } => {
                self.exp(lvalue)?;
                self.exp(exp)?;
                if !lvalue_p(lvalue) {
                    return Err(terr(lvalue.loc, "not assignable"));
                }
                let lt = self.exp_type(lvalue)?;
                // Bit-concatenation targets are handled by the rewrite
                // pass; each operand is assigned separately there.
                if !matches!(
                    lvalue.kind,
                    NodeKind::Binary {
                        op: BinOp::BConc,
                        ..
                    }
                ) {
                    self.promote_in_place(exp, &lt)?;
                } else {
                    self.expect_integral(exp)?;
                }
                Ok(())
            }
            NodeKind::IfStmt {
                cond,
                then_s,
                else_s,
            } => {
                self.exp(cond)?;
                self.expect_integral(cond)?;
                self.stmt(then_s)?;
                if let Some(e) = else_s {
                    self.stmt(e)?;
                }
                Ok(())
            }
            NodeKind::WhileStmt { cond, body } => {
                self.exp(cond)?;
                self.expect_integral(cond)?;
                self.stmt(body)
            }
            NodeKind::ForInStmt {
                var,
                container,
                body,
            } => {
                self.exp(container)?;
                let ct = self.resolve(&self.exp_type(container)?)?;
                let elem = match &ct.kind {
                    NodeKind::TypeArray { elem, .. } => (**elem).clone(),
                    _ => return Err(terr(container.loc, "can only iterate arrays")),
                };
                let var = var.clone();
                self.env.push_frame();
                self.hidden_slot();
                self.hidden_slot();
                self.env.register(Decl {
                    name: var,
                    kind: DeclKind::Var,
                    ty: Some(elem),
                });
                let r = self.in_block(|t| t.stmt(body));
                self.env.pop_frame();
                r
            }
            NodeKind::ReturnStmt(e) => {
                let ret = match self.ret_stack.last() {
                    Some(r) => r.clone(),
                    None => return Err(terr(n.loc, "return outside a function")),
                };
                if let Some(e) = e {
                    self.exp(e)?;
                    if !matches!(ret.kind, NodeKind::TypeVoid) {
                        self.promote_in_place(e, &ret)?;
                    }
                }
                Ok(())
            }
            NodeKind::TryStmt {
                body,
                arg,
                cond,
                handler,
                else_handler,
            } => {
                self.stmt(body)?;
                // The handler scope binds the exception.
                let exc_ty = self.exception_type(n.loc);
                let arg = arg.clone();
                self.env.push_frame();
                self.env.register(Decl {
                    name: arg,
                    kind: DeclKind::Var,
                    ty: Some(exc_ty),
                });
                let r = self.in_block(|t| {
                    if let Some(c) = cond {
                        t.exp(c)?;
                        t.expect_integral(c)?;
                    }
                    t.stmt(handler)?;
                    if let Some(e) = else_handler {
                        t.stmt(e)?;
                    }
                    Ok(())
                });
                self.env.pop_frame();
                r
            }
            NodeKind::RaiseStmt(e) => {
                if let Some(e) = e {
                    self.exp(e)?;
                    // Struct values can only be raised when they are
                    // exceptions; integers raise by code.
                    let t = self.exp_type(e)?;
                    let rt = self.resolve(&t)?;
                    if matches!(rt.kind, NodeKind::TypeStruct { .. }) && !type_is_exception(&t) {
                        return Err(terr(e.loc, "only Exception values can be raised"));
                    }
                }
                Ok(())
            }
            NodeKind::PrintStmt { parts, .. } => self.format_parts(parts),
            NodeKind::IncrDecr { exp, .. } => {
                self.exp(exp)?;
                if !matches!(exp.kind, NodeKind::Var { .. }) {
                    return Err(terr(exp.loc, "++/-- needs a variable"));
                }
                let t = self.resolve(&self.exp_type(exp)?)?;
                match type_incr_step(&self.ctx, &t) {
                    Some(_) => Ok(()),
                    None => Err(terr(exp.loc, "++/-- needs an integer or offset")),
                }
            }
            NodeKind::ExpStmt(e) => self.exp(e),
            NodeKind::BreakStmt | NodeKind::ContinueStmt | NodeKind::NullStmt => Ok(()),
            NodeKind::AsmStmt(_) => Ok(()),
            other => Err(terr(
                n.loc,
                format!("unexpected node in statement position: {:?}", kind_name(other)),
            )),
        }
    }

    fn in_block(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let was_top = self.at_top;
        self.at_top = false;
        let r = f(self);
        self.at_top = was_top;
        r
    }

    fn hidden_slot(&mut self) {
        self.env.register(Decl {
            name: String::new(),
            kind: DeclKind::Var,
            ty: None,
        });
    }

    /// Register a declaration in the current frame, or update the slot
    /// the parser already created for a top-level one.
    fn register_or_update(&mut self, name: &str, kind: DeclKind, ty: Option<Node>) {
        if self.at_top {
            let over = (self.top_base + self.top_seen) as u32;
            self.top_seen += 1;
            if let Some(ty) = ty {
                self.env.set_type_at(0, over, ty);
            }
        } else {
            self.env.register(Decl {
                name: name.to_string(),
                kind,
                ty,
            });
        }
    }

    fn update_last(&mut self, name: &str, ty: Node) {
        if let Some((back, over, _)) = self.env.lookup(name) {
            self.env.set_type_at(back, over, ty);
        }
    }

    fn exception_type(&self, loc: Loc) -> Node {
        match self.env.lookup("Exception") {
            Some((back, over, d)) if d.kind == DeclKind::Type => Node::new(
                &self.ctx,
                NodeKind::TypeNamed {
                    name: "Exception".to_string(),
                    back,
                    over,
                },
                loc,
            ),
            _ => Node::new(&self.ctx, NodeKind::TypeAny, loc),
        }
    }

    fn func_signature(&mut self, f: &Node) -> Result<Node, CompileError> {
        match &f.kind {
            NodeKind::Func { ret, args, .. } => {
                let args = args.iter().map(|a| a.ty.clone()).collect();
                Ok(Node::new(
                    &self.ctx,
                    NodeKind::TypeFunction {
                        ret: ret.clone(),
                        args,
                    },
                    f.loc,
                ))
            }
            _ => Err(terr(f.loc, "expected a function")),
        }
    }

    /// Walk a type specification: array bounds and the field closures of
    /// struct types are expressions that need types themselves.
    fn type_spec(&mut self, t: &mut Node) -> Result<(), CompileError> {
        self.type_spec_in(t, false)
    }

    fn type_spec_in(&mut self, t: &mut Node, in_struct: bool) -> Result<(), CompileError> {
        match &mut t.kind {
            NodeKind::TypeArray { elem, bound } => {
                self.type_spec_in(elem, in_struct)?;
                if let Some(b) = bound {
                    self.exp(b)?;
                    let bt = self.resolve(&self.exp_type(b)?)?;
                    if !matches!(
                        bt.kind,
                        NodeKind::TypeIntegral { .. } | NodeKind::TypeOffset { .. }
                    ) {
                        return Err(terr(b.loc, "array bound must be a count or a size"));
                    }
                    // Field array types are built outside the struct
                    // scope, so their bounds must be constant.
                    if in_struct
                        && !matches!(
                            b.kind,
                            NodeKind::Int { .. } | NodeKind::OffsetLit { .. }
                        )
                    {
                        return Err(terr(
                            b.loc,
                            "array bounds in struct fields must be constant",
                        ));
                    }
                }
                Ok(())
            }
            NodeKind::TypeOffset { base, .. } => self.type_spec(base),
            NodeKind::TypeStruct {
                fields, methods, ..
            } => {
                // Mirror the parser's struct frame: a hidden slot for the
                // value, then one slot per field.
                self.env.push_frame();
                self.hidden_slot();
                let r = (|| {
                    for i in 0..fields.len() {
                        // Work around simultaneous borrows of the list.
                        let mut f = fields[i].clone();
                        self.type_spec_in(&mut f.ty, true)?;
                        self.env.register(Decl {
                            name: f.name.clone(),
                            kind: DeclKind::Var,
                            ty: Some(f.ty.clone()),
                        });
                        if let Some(c) = &mut f.constraint {
                            self.exp(c)?;
                            self.expect_integral(c)?;
                        }
                        if let Some(init) = &mut f.init {
                            self.exp(init)?;
                            let ft = f.ty.clone();
                            let e = std::mem::replace(
                                init,
                                Node::new(&self.ctx, NodeKind::NullStmt, Loc::default()),
                            );
                            *init = self.promote(e, &ft)?;
                        }
                        if let Some(l) = &mut f.label {
                            self.exp(l)?;
                            let lt = self.resolve(&self.exp_type(l)?)?;
                            if !matches!(
                                lt.kind,
                                NodeKind::TypeIntegral { .. } | NodeKind::TypeOffset { .. }
                            ) {
                                return Err(terr(l.loc, "field label must be an offset"));
                            }
                        }
                        if let Some(o) = &mut f.optcond {
                            self.exp(o)?;
                            self.expect_integral(o)?;
                        }
                        fields[i] = f;
                    }
                    for m in methods.iter_mut() {
                        self.type_spec(&mut m.ret)?;
                        self.ret_stack.push((*m.ret).clone());
                        let r = self.in_block(|t| t.stmt(&mut m.body));
                        self.ret_stack.pop();
                        r?;
                    }
                    Ok(())
                })();
                self.env.pop_frame();
                r
            }
            NodeKind::TypeFunction { ret, args } => {
                self.type_spec(ret)?;
                for a in args {
                    self.type_spec(a)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // -- expressions -------------------------------------------------------

    fn exp(&mut self, n: &mut Node) -> Result<(), CompileError> {
        let loc = n.loc;
        let ty: Node = match &mut n.kind {
            NodeKind::Int { size, signed, .. } => self.ity(*size, *signed, loc),
            NodeKind::Str(_) => Node::new(&self.ctx, NodeKind::TypeString, loc),
            NodeKind::OffsetLit { magnitude, unit } => {
                self.exp(magnitude)?;
                let (size, signed) = self.expect_integral(magnitude)?;
                Node::new(
                    &self.ctx,
                    NodeKind::TypeOffset {
                        base: Box::new(self.ity(size, signed, loc)),
                        unit: *unit,
                    },
                    loc,
                )
            }
            NodeKind::Var { name, back, over } => {
                match self.env.lookup_at(*back, *over).and_then(|d| d.ty.clone()) {
                    Some(t) => t,
                    None => {
                        return Err(terr(
                            loc,
                            format!("variable '{}' has no known type yet", name),
                        ))
                    }
                }
            }
            NodeKind::Unary { op, operand } => {
                self.exp(operand)?;
                let (size, signed) = self.expect_integral(operand)?;
                match op {
                    UnOp::Not => self.int32(loc),
                    _ => self.ity(size, signed, loc),
                }
            }
            NodeKind::Binary { op, left, right } => {
                let op = *op;
                self.exp(left)?;
                self.exp(right)?;
                self.binary(loc, op, left, right)?
            }
            NodeKind::Ternary {
                cond,
                then_e,
                else_e,
            } => {
                self.exp(cond)?;
                self.expect_integral(cond)?;
                self.exp(then_e)?;
                self.exp(else_e)?;
                let tt = self.resolve(&self.exp_type(then_e)?)?;
                let et = self.resolve(&self.exp_type(else_e)?)?;
                if type_equal_p(&tt, &et) {
                    tt
                } else if let Some((size, signed)) = type_integral_promote(&tt, &et) {
                    let t = self.ity(size, signed, loc);
                    self.promote_in_place(then_e, &t)?;
                    self.promote_in_place(else_e, &t)?;
                    t
                } else {
                    return Err(terr(loc, "branches of ?: have incompatible types"));
                }
            }
            NodeKind::Funcall { func, args } => {
                self.exp(func)?;
                let ft = self.resolve(&self.exp_type(func)?)?;
                match ft.kind {
                    NodeKind::TypeFunction { ret, args: fargs } => {
                        if args.len() != fargs.len() {
                            return Err(terr(
                                loc,
                                format!(
                                    "call with {} arguments to a function of {}",
                                    args.len(),
                                    fargs.len()
                                ),
                            ));
                        }
                        for (a, want) in args.iter_mut().zip(&fargs) {
                            self.exp(a)?;
                            let e = std::mem::replace(
                                a,
                                Node::new(&self.ctx, NodeKind::NullStmt, Loc::default()),
                            );
                            *a = self.promote(e, want)?;
                        }
                        (*ret).clone()
                    }
                    _ => return Err(terr(func.loc, "called value is not a function")),
                }
            }
            NodeKind::StructRef { base, field } => {
                self.exp(base)?;
                let bt = self.resolve(&self.exp_type(base)?)?;
                match &bt.kind {
                    NodeKind::TypeStruct {
                        fields, methods, ..
                    } => {
                        if let Some(f) = fields.iter().find(|f| f.name == *field) {
                            f.ty.clone()
                        } else if let Some(m) = methods.iter().find(|m| m.name == *field) {
                            Node::new(
                                &self.ctx,
                                NodeKind::TypeFunction {
                                    ret: m.ret.clone(),
                                    args: Vec::new(),
                                },
                                loc,
                            )
                        } else {
                            return Err(terr(
                                loc,
                                format!("no field or method '{}' in the struct", field),
                            ));
                        }
                    }
                    _ => return Err(terr(base.loc, "field reference into a non-struct")),
                }
            }
            NodeKind::Indexer { entity, index } => {
                self.exp(entity)?;
                self.exp(index)?;
                self.expect_integral(index)?;
                let et = self.resolve(&self.exp_type(entity)?)?;
                match &et.kind {
                    NodeKind::TypeArray { elem, .. } => (**elem).clone(),
                    NodeKind::TypeString => self.ity(8, false, loc),
                    _ => return Err(terr(entity.loc, "indexing a non-array")),
                }
            }
            NodeKind::Trimmer { entity, from, to } => {
                self.exp(entity)?;
                self.exp(from)?;
                self.exp(to)?;
                self.expect_integral(from)?;
                self.expect_integral(to)?;
                let et = self.resolve(&self.exp_type(entity)?)?;
                match &et.kind {
                    NodeKind::TypeArray { elem, .. } => Node::new(
                        &self.ctx,
                        NodeKind::TypeArray {
                            elem: elem.clone(),
                            bound: None,
                        },
                        loc,
                    ),
                    NodeKind::TypeString => Node::new(&self.ctx, NodeKind::TypeString, loc),
                    _ => return Err(terr(entity.loc, "trimming a non-array")),
                }
            }
            NodeKind::Cast { ty, exp } => {
                self.exp(exp)?;
                self.type_spec(ty)?;
                let from = self.resolve(&self.exp_type(exp)?)?;
                let to = self.resolve(ty)?;
                let ok = type_promoteable_p(&from, &to, true)
                    || matches!(from.kind, NodeKind::TypeAny)
                    || matches!(to.kind, NodeKind::TypeAny);
                if !ok {
                    return Err(terr(loc, "invalid cast"));
                }
                let nominal = (**ty).clone();
                // Concrete representation for the generated conversion.
                **ty = representation_type(&nominal, &to);
                nominal
            }
            NodeKind::Isa { ty, exp } => {
                self.exp(exp)?;
                self.type_spec(ty)?;
                self.int32(loc)
            }
            NodeKind::MapExp {
                ty, ios, offset, ..
            } => {
                self.type_spec(ty)?;
                let rt = self.resolve(ty)?;
                if !type_mappable_p(&rt) {
                    return Err(terr(loc, "type cannot be mapped"));
                }
                if let Some(i) = ios {
                    self.exp(i)?;
                    self.expect_integral(i)?;
                }
                self.exp(offset)?;
                let ot = self.resolve(&self.exp_type(offset)?)?;
                if !matches!(ot.kind, NodeKind::TypeOffset { .. }) {
                    return Err(terr(offset.loc, "map offset must be an offset"));
                }
                (**ty).clone()
            }
            NodeKind::ArrayLit(inits) => {
                if inits.is_empty() {
                    return Err(terr(loc, "cannot infer the type of an empty array"));
                }
                for e in inits.iter_mut() {
                    self.exp(e)?;
                }
                let elem = self.exp_type(&inits[0])?;
                for e in inits.iter_mut().skip(1) {
                    let x = std::mem::replace(
                        e,
                        Node::new(&self.ctx, NodeKind::NullStmt, Loc::default()),
                    );
                    *e = self.promote(x, &elem)?;
                }
                let n = inits.len() as i64;
                Node::new(
                    &self.ctx,
                    NodeKind::TypeArray {
                        elem: Box::new(elem),
                        bound: Some(Box::new(Node::int_lit(&self.ctx, n, 64, false, loc))),
                    },
                    loc,
                )
            }
            NodeKind::ArrayCons { ty, inits } => {
                self.type_spec(ty)?;
                let rt = self.resolve(ty)?;
                let (elem, bound) = match &rt.kind {
                    NodeKind::TypeArray { elem, bound } => ((**elem).clone(), bound.clone()),
                    _ => return Err(terr(loc, "array constructor needs an array type")),
                };
                for e in inits.iter_mut() {
                    self.exp(e)?;
                    let x = std::mem::replace(
                        e,
                        Node::new(&self.ctx, NodeKind::NullStmt, Loc::default()),
                    );
                    *e = self.promote(x, &elem)?;
                }
                if let (Some(b), true) = (&bound, inits.len() > 1) {
                    if let NodeKind::Int { value, .. } = b.kind {
                        if value as usize != inits.len() {
                            return Err(terr(
                                loc,
                                "initializer count does not match the array bound",
                            ));
                        }
                    }
                }
                (**ty).clone()
            }
            NodeKind::StructCons { ty, fields } => {
                self.type_spec(ty)?;
                let rt = self.resolve(ty)?;
                let tfields = match &rt.kind {
                    NodeKind::TypeStruct { fields, .. } => fields.clone(),
                    _ => return Err(terr(loc, "struct constructor needs a struct type")),
                };
                for (name, v) in fields.iter_mut() {
                    let want = tfields
                        .iter()
                        .find(|f| f.name == *name)
                        .map(|f| f.ty.clone())
                        .ok_or_else(|| {
                            terr(v.loc, format!("no field '{}' in the struct type", name))
                        })?;
                    self.exp(v)?;
                    let x = std::mem::replace(
                        v,
                        Node::new(&self.ctx, NodeKind::NullStmt, Loc::default()),
                    );
                    *v = self.promote(x, &want)?;
                }
                (**ty).clone()
            }
            NodeKind::Lambda(f) => {
                let sig = self.func_signature(f)?;
                self.exp(f)?;
                sig
            }
            NodeKind::Func { ret, args, body } => {
                self.type_spec(ret)?;
                for a in args.iter_mut() {
                    self.type_spec(&mut a.ty)?;
                }
                let sig = Node::new(
                    &self.ctx,
                    NodeKind::TypeFunction {
                        ret: ret.clone(),
                        args: args.iter().map(|a| a.ty.clone()).collect(),
                    },
                    loc,
                );
                // Formals in reverse, matching the parser and the callee
                // prologue.
                self.env.push_frame();
                for a in args.iter().rev() {
                    self.env.register(Decl {
                        name: a.name.clone(),
                        kind: DeclKind::Var,
                        ty: Some(a.ty.clone()),
                    });
                }
                self.ret_stack.push((**ret).clone());
                let r = self.in_block(|t| t.stmt(body));
                self.ret_stack.pop();
                self.env.pop_frame();
                r?;
                sig
            }
            NodeKind::FormatExp(parts) => {
                self.format_parts(parts)?;
                Node::new(&self.ctx, NodeKind::TypeString, loc)
            }
            other => {
                return Err(terr(
                    loc,
                    format!("unexpected node in expression position: {}", kind_name(other)),
                ))
            }
        };
        n.ty = Some(Box::new(ty));
        Ok(())
    }

    fn format_parts(&mut self, parts: &mut [FormatPart]) -> Result<(), CompileError> {
        for p in parts {
            match p {
                FormatPart::Lit(_) => {}
                FormatPart::Val(e) => self.exp(e)?,
                FormatPart::Str(e) => {
                    self.exp(e)?;
                    let t = self.resolve(&self.exp_type(e)?)?;
                    if !matches!(t.kind, NodeKind::TypeString) {
                        return Err(terr(e.loc, "%s needs a string"));
                    }
                }
            }
        }
        Ok(())
    }

    fn binary(
        &mut self,
        loc: Loc,
        op: BinOp,
        left: &mut Box<Node>,
        right: &mut Box<Node>,
    ) -> Result<Node, CompileError> {
        let lt = self.resolve(&self.exp_type(left)?)?;
        let rt = self.resolve(&self.exp_type(right)?)?;
        let l_int = matches!(lt.kind, NodeKind::TypeIntegral { .. });
        let r_int = matches!(rt.kind, NodeKind::TypeIntegral { .. });
        let l_off = matches!(lt.kind, NodeKind::TypeOffset { .. });
        let r_off = matches!(rt.kind, NodeKind::TypeOffset { .. });
        let l_str = matches!(lt.kind, NodeKind::TypeString);
        let r_str = matches!(rt.kind, NodeKind::TypeString);

        use BinOp::*;
        match op {
            Add | Sub | Mul | Div | CeilDiv | Mod | Pow => {
                if op == Add && l_str && r_str {
                    return Ok(Node::new(&self.ctx, NodeKind::TypeString, loc));
                }
                if l_int && r_int {
                    let (size, signed) =
                        type_integral_promote(&lt, &rt).expect("both integral");
                    let t = self.ity(size, signed, loc);
                    self.promote_in_place(left, &t)?;
                    self.promote_in_place(right, &t)?;
                    return Ok(t);
                }
                if l_off && r_off {
                    return match op {
                        Add | Sub => {
                            let signed = offset_signed(&lt) && offset_signed(&rt);
                            Ok(Node::new(
                                &self.ctx,
                                NodeKind::TypeOffset {
                                    base: Box::new(self.ity(64, signed, loc)),
                                    unit: 1,
                                },
                                loc,
                            ))
                        }
                        Div | CeilDiv => {
                            let signed = offset_signed(&lt) || offset_signed(&rt);
                            Ok(self.ity(64, signed, loc))
                        }
                        Mod => {
                            let signed = offset_signed(&lt) || offset_signed(&rt);
                            Ok(Node::new(
                                &self.ctx,
                                NodeKind::TypeOffset {
                                    base: Box::new(self.ity(64, signed, loc)),
                                    unit: 1,
                                },
                                loc,
                            ))
                        }
                        _ => Err(terr(loc, "offsets cannot be multiplied together")),
                    };
                }
                // Offset scaling by an integer, either side.
                if op == Mul && (l_off && r_int || l_int && r_off) {
                    let t = if l_off { &lt } else { &rt };
                    return Ok(t.clone());
                }
                Err(terr(loc, "invalid operand types"))
            }
            Eq | Ne | Lt | Le | Gt | Ge => {
                let ok = (l_int && r_int)
                    || (l_off && r_off)
                    || (l_str && r_str)
                    // Structural equality covers composite values too.
                    || (matches!(op, Eq | Ne) && type_equal_p(&lt, &rt));
                if !ok {
                    return Err(terr(loc, "invalid operand types in comparison"));
                }
                if l_int && r_int {
                    let (size, signed) =
                        type_integral_promote(&lt, &rt).expect("both integral");
                    let t = self.ity(size, signed, loc);
                    self.promote_in_place(left, &t)?;
                    self.promote_in_place(right, &t)?;
                }
                Ok(self.int32(loc))
            }
            And | Or => {
                if !(l_int && r_int) {
                    return Err(terr(loc, "logical operators need integers"));
                }
                Ok(self.int32(loc))
            }
            BAnd | BOr | BXor => {
                if !(l_int && r_int) {
                    return Err(terr(loc, "bit operators need integers"));
                }
                let (size, signed) = type_integral_promote(&lt, &rt).expect("both integral");
                let t = self.ity(size, signed, loc);
                self.promote_in_place(left, &t)?;
                self.promote_in_place(right, &t)?;
                Ok(t)
            }
            Shl | Shr => {
                if !(l_int && r_int) {
                    return Err(terr(loc, "shifts need integers"));
                }
                Ok(lt)
            }
            BConc => {
                if !(l_int && r_int) {
                    return Err(terr(loc, "bit-concatenation needs integers"));
                }
                let (s1, s2) = (integral_size(&lt), integral_size(&rt));
                if s1 + s2 > 64 {
                    return Err(terr(loc, "bit-concatenation wider than 64 bits"));
                }
                Ok(self.ity(s1 + s2, false, loc))
            }
        }
    }
}

/// The type a cast should convert to at runtime: the resolved definition
/// for scalar representation kinds (whose nodes carry no scope-relative
/// references), the nominal spelling otherwise.
fn representation_type(nominal: &Node, resolved: &Node) -> Node {
    match resolved.kind {
        NodeKind::TypeIntegral { .. } | NodeKind::TypeOffset { .. } => resolved.clone(),
        _ => nominal.clone(),
    }
}

fn integral_size(t: &Node) -> u32 {
    match t.kind {
        NodeKind::TypeIntegral { size, .. } => size,
        _ => 0,
    }
}

fn offset_signed(t: &Node) -> bool {
    match &t.kind {
        NodeKind::TypeOffset { base, .. } => {
            matches!(base.kind, NodeKind::TypeIntegral { signed: true, .. })
        }
        _ => false,
    }
}

fn kind_name(k: &NodeKind) -> &'static str {
    match k {
        NodeKind::Program(_) => "program",
        NodeKind::TypeStruct { .. } => "struct type",
        NodeKind::TypeIntegral { .. }
        | NodeKind::TypeString
        | NodeKind::TypeVoid
        | NodeKind::TypeAny
        | NodeKind::TypeNamed { .. }
        | NodeKind::TypeArray { .. }
        | NodeKind::TypeOffset { .. }
        | NodeKind::TypeFunction { .. } => "type",
        _ => "node",
    }
}

// The pass has no unit tests of its own: it is exercised end to end
// through the driver tests, which compile and run full programs.
