//! Code generation
//!
//! One walk over the typed tree, appending instructions to a program
//! builder. Environment handling mirrors the parser's frame discipline:
//! compounds open a frame at their first declaration, function prologues
//! register their formals in stack order, struct-type field closures
//! materialise the value's fields into a frame before evaluating the
//! user expression.
//!
//! Simple types become literal type values in the program's literal
//! table; struct types are built at runtime (`mkst`) because their
//! constraints, labels, initializers, optional-field conditions and
//! methods are closures over the enclosing environment.

use std::rc::Rc;

use jab_runtime::asm;
use jab_runtime::exception::{EC_CONSTRAINT, EC_ELEM, EC_GENERIC, EC_NO_RETURN};
use jab_runtime::program::{Insn, Label, Program, ProgramBuilder};
use jab_runtime::value::{make_integral, make_string, Object, TypeVal, Value};
use jab_runtime::Vm;

use crate::ast::{
    BinOp, DeclKind, FieldDecl, FormatPart, Loc, MethodDecl, Node, NodeKind, UnOp,
};
use crate::error::CompileError;
use crate::parser::StartSymbol;

pub fn generate(
    ast: &Node,
    vm: &mut Vm,
    start: StartSymbol,
) -> Result<Rc<Program>, CompileError> {
    let mut g = Gen {
        vm,
        b: ProgramBuilder::new(),
        loops: Vec::new(),
        env_depth: 0,
        try_depth: 0,
        func_try_base: 0,
    };
    match (start, &ast.kind) {
        (StartSymbol::Expression, _) => {
            g.exp(ast)?;
            g.emit(Insn::Return)?;
        }
        (StartSymbol::Statement, _) | (StartSymbol::Declaration, _) => {
            // A lone expression statement yields its value.
            if let NodeKind::ExpStmt(e) = &ast.kind {
                g.exp(e)?;
            } else {
                g.stmt(ast)?;
                g.b.push_val(Value::Null).map_err(CompileError::from)?;
            }
            g.emit(Insn::Return)?;
        }
        (StartSymbol::Program, NodeKind::Program(stmts)) => {
            for s in stmts {
                g.stmt(s)?;
            }
            g.b.push_val(Value::Null).map_err(CompileError::from)?;
            g.emit(Insn::Return)?;
        }
        (StartSymbol::Program, _) => {
            g.stmt(ast)?;
            g.b.push_val(Value::Null).map_err(CompileError::from)?;
            g.emit(Insn::Return)?;
        }
    }
    let Gen { vm, b, .. } = g;
    vm.make_program(b).map_err(CompileError::from)
}

struct LoopCtx {
    brk: Label,
    cont: Label,
    depth: u32,
    /// Handlers installed when the loop was entered.
    tries: u32,
}

struct Gen<'v> {
    vm: &'v mut Vm,
    b: ProgramBuilder,
    loops: Vec<LoopCtx>,
    /// Frames opened since program entry, for break/continue unwinding.
    env_depth: u32,
    /// Handlers installed on the normal path, for break/continue/return
    /// unwinding out of try bodies.
    try_depth: u32,
    /// `try_depth` at entry of the function being generated.
    func_try_base: u32,
}

fn gerr(loc: Loc, msg: impl Into<String>) -> CompileError {
    CompileError::anal(loc, msg)
}

impl<'v> Gen<'v> {
    fn emit(&mut self, i: Insn) -> Result<(), CompileError> {
        self.b.emit(i).map_err(CompileError::from)
    }

    fn push(&mut self, v: Value) -> Result<(), CompileError> {
        self.b.push_val(v).map_err(CompileError::from)
    }

    fn push_str(&mut self, s: &str) -> Result<(), CompileError> {
        let v = make_string(self.vm.heap_mut(), s);
        self.push(v)
    }

    fn label(&mut self) -> Label {
        self.b.fresh_label()
    }

    fn place(&mut self, l: Label) -> Result<(), CompileError> {
        self.b.append_label(l).map_err(CompileError::from)
    }

    // -- statements --------------------------------------------------------

    fn stmt(&mut self, n: &Node) -> Result<(), CompileError> {
        match &n.kind {
            NodeKind::Program(stmts) => {
                for s in stmts {
                    self.stmt(s)?;
                }
                Ok(())
            }
            NodeKind::CompStmt(stmts) => {
                let mut framed = false;
                for s in stmts {
                    if !framed && matches!(s.kind, NodeKind::Decl { .. }) {
                        self.emit(Insn::PushEnv)?;
                        self.env_depth += 1;
                        framed = true;
                    }
                    self.stmt(s)?;
                }
                if framed {
                    self.emit(Insn::PopEnv)?;
                    self.env_depth -= 1;
                }
                Ok(())
            }
            NodeKind::NullStmt => Ok(()),
            NodeKind::BreakStmt => self.loop_jump(n.loc, true),
            NodeKind::ContinueStmt => self.loop_jump(n.loc, false),
            NodeKind::ExpStmt(e) => {
                self.exp(e)?;
                self.emit(Insn::Drop)
            }
            NodeKind::Decl { kind, name, init } => match kind {
                DeclKind::Var => {
                    self.exp(init)?;
                    self.emit(Insn::Regvar)
                }
                DeclKind::Fun => {
                    self.exp(init)?;
                    self.emit(Insn::Regvar)
                }
                DeclKind::Type => {
                    self.type_decl_value(name, init)?;
                    self.emit(Insn::Regvar)
                }
            },
            NodeKind::AssStmt { lvalue, exp } => self.assign(lvalue, exp),
            NodeKind::IfStmt {
                cond,
                then_s,
                else_s,
            } => {
                let lelse = self.label();
                self.exp(cond)?;
                self.emit(Insn::Bzi(lelse.0))?;
                self.stmt(then_s)?;
                match else_s {
                    Some(e) => {
                        let lend = self.label();
                        self.emit(Insn::Ba(lend.0))?;
                        self.place(lelse)?;
                        self.stmt(e)?;
                        self.place(lend)
                    }
                    None => self.place(lelse),
                }
            }
            NodeKind::WhileStmt { cond, body } => {
                let lcond = self.label();
                let lend = self.label();
                self.place(lcond)?;
                self.exp(cond)?;
                self.emit(Insn::Bzi(lend.0))?;
                self.loops.push(LoopCtx {
                    brk: lend,
                    cont: lcond,
                    depth: self.env_depth,
                    tries: self.try_depth,
                });
                let r = self.stmt(body);
                self.loops.pop();
                r?;
                self.emit(Insn::Ba(lcond.0))?;
                self.place(lend)
            }
            NodeKind::ForInStmt {
                container, body, ..
            } => self.for_in(container, body),
            NodeKind::ReturnStmt(e) => {
                match e {
                    Some(e) => self.exp(e)?,
                    None => self.push(Value::Null)?,
                }
                // Returning from inside try bodies discards their
                // handlers first.
                for _ in self.func_try_base..self.try_depth {
                    self.emit(Insn::Pope)?;
                }
                self.emit(Insn::Return)
            }
            NodeKind::RaiseStmt(e) => {
                match e {
                    Some(e) => self.exp(e)?,
                    None => {
                        let exc = self.vm.exception(EC_GENERIC, "raise");
                        self.push(exc)?;
                    }
                }
                self.emit(Insn::Raise)
            }
            NodeKind::TryStmt {
                body,
                cond,
                handler,
                else_handler,
                ..
            } => self.try_stmt(body, cond.as_deref(), handler, else_handler.as_deref()),
            NodeKind::PrintStmt { parts, .. } => {
                for p in parts {
                    self.format_part(p, true)?;
                }
                Ok(())
            }
            NodeKind::IncrDecr { exp, incr } => self.incr_decr(exp, *incr),
            NodeKind::AsmStmt(template) => {
                let text = asm::expand_template(template);
                asm::parse_from_string(&text, &mut self.b, self.vm.heap_mut())
                    .map_err(CompileError::from)
            }
            other => Err(gerr(
                n.loc,
                format!("internal: no code for statement {:?}", std::mem::discriminant(other)),
            )),
        }
    }

    fn loop_jump(&mut self, loc: Loc, is_break: bool) -> Result<(), CompileError> {
        let (target, depth, tries) = match self.loops.last() {
            Some(l) => (if is_break { l.brk } else { l.cont }, l.depth, l.tries),
            None => return Err(gerr(loc, "break/continue outside a loop")),
        };
        // Unwind handlers and scope frames opened since the loop head.
        for _ in tries..self.try_depth {
            self.emit(Insn::Pope)?;
        }
        for _ in depth..self.env_depth {
            self.emit(Insn::PopEnv)?;
        }
        self.emit(Insn::Ba(target.0))
    }

    fn assign(&mut self, lvalue: &Node, exp: &Node) -> Result<(), CompileError> {
        match &lvalue.kind {
            NodeKind::Var { back, over, .. } => {
                self.exp(exp)?;
                self.emit(Insn::Popvar {
                    back: *back as u16,
                    over: *over as u16,
                })
            }
            NodeKind::StructRef { base, field } => {
                self.exp(base)?;
                self.push_str(field)?;
                self.exp(exp)?;
                self.emit(Insn::SsetC)?;
                self.emit(Insn::Drop)
            }
            NodeKind::Indexer { entity, index } => {
                self.exp(entity)?;
                self.exp(index)?;
                self.exp(exp)?;
                self.emit(Insn::Aset)?;
                self.emit(Insn::Drop)
            }
            NodeKind::MapExp { ios, offset, .. } => {
                // Poking: write the value at the mapped location.
                self.exp(exp)?;
                match ios {
                    Some(i) => self.exp(i)?,
                    None => self.push(Value::Null)?,
                }
                self.exp(offset)?;
                self.emit(Insn::Poke)
            }
            _ => Err(gerr(lvalue.loc, "unsupported assignment target")),
        }
    }

    fn for_in(&mut self, container: &Node, body: &Node) -> Result<(), CompileError> {
        self.emit(Insn::PushEnv)?;
        self.env_depth += 1;
        // Slot 0: the container; slot 1: the index; slot 2: the loop
        // variable.
        self.exp(container)?;
        self.emit(Insn::Regvar)?;
        self.push(Value::ulong(0))?;
        self.emit(Insn::Regvar)?;
        self.push(Value::Null)?;
        self.emit(Insn::Regvar)?;

        let lcond = self.label();
        let lcont = self.label();
        let lend = self.label();
        self.place(lcond)?;
        self.emit(Insn::Pushvar { back: 0, over: 1 })?;
        self.emit(Insn::Pushvar { back: 0, over: 0 })?;
        self.emit(Insn::Sel)?;
        self.emit(Insn::Nip)?;
        self.emit(Insn::LtI)?;
        self.emit(Insn::Bzi(lend.0))?;
        self.emit(Insn::Pushvar { back: 0, over: 0 })?;
        self.emit(Insn::Pushvar { back: 0, over: 1 })?;
        self.emit(Insn::Aref)?;
        self.emit(Insn::Popvar { back: 0, over: 2 })?;

        self.loops.push(LoopCtx {
            brk: lend,
            cont: lcont,
            depth: self.env_depth,
            tries: self.try_depth,
        });
        let r = self.stmt(body);
        self.loops.pop();
        r?;

        self.place(lcont)?;
        self.emit(Insn::Pushvar { back: 0, over: 1 })?;
        self.push(Value::ulong(1))?;
        self.emit(Insn::Add)?;
        self.emit(Insn::Popvar { back: 0, over: 1 })?;
        self.emit(Insn::Ba(lcond.0))?;
        self.place(lend)?;
        self.emit(Insn::PopEnv)?;
        self.env_depth -= 1;
        Ok(())
    }

    fn try_stmt(
        &mut self,
        body: &Node,
        cond: Option<&Node>,
        handler: &Node,
        else_handler: Option<&Node>,
    ) -> Result<(), CompileError> {
        let lhandler = self.label();
        let ldone = self.label();
        self.emit(Insn::Pushe {
            target: lhandler.0,
            code: -1,
        })?;
        self.try_depth += 1;
        let r = self.stmt(body);
        self.try_depth -= 1;
        r?;
        self.emit(Insn::Pope)?;
        self.emit(Insn::Ba(ldone.0))?;

        // Handler entry: the exception value is on the stack; bind it.
        self.place(lhandler)?;
        self.emit(Insn::PushEnv)?;
        self.env_depth += 1;
        self.emit(Insn::Regvar)?;
        match cond {
            Some(c) => {
                let lelse = self.label();
                let lhend = self.label();
                self.exp(c)?;
                self.emit(Insn::Bzi(lelse.0))?;
                self.stmt(handler)?;
                self.emit(Insn::Ba(lhend.0))?;
                self.place(lelse)?;
                match else_handler {
                    Some(e) => self.stmt(e)?,
                    None => {
                        // No else: the exception continues outward.
                        self.emit(Insn::Pushvar { back: 0, over: 0 })?;
                        self.emit(Insn::Raise)?;
                    }
                }
                self.place(lhend)?;
            }
            None => self.stmt(handler)?,
        }
        self.emit(Insn::PopEnv)?;
        self.env_depth -= 1;
        self.place(ldone)
    }

    fn incr_decr(&mut self, exp: &Node, incr: bool) -> Result<(), CompileError> {
        let (back, over) = match &exp.kind {
            NodeKind::Var { back, over, .. } => (*back as u16, *over as u16),
            _ => return Err(gerr(exp.loc, "++/-- needs a variable")),
        };
        let ty = exp.ty.as_deref();
        self.emit(Insn::Pushvar { back, over })?;
        match ty.map(|t| &t.kind) {
            Some(NodeKind::TypeIntegral { size, signed }) => {
                let one = make_integral(1, *size, *signed).unwrap_or(Value::Null);
                self.push(one)?;
                self.emit(if incr { Insn::AddOv } else { Insn::SubOv })?;
            }
            Some(NodeKind::TypeOffset { base, unit }) => {
                let (size, signed) = match base.kind {
                    NodeKind::TypeIntegral { size, signed } => (size, signed),
                    _ => (64, false),
                };
                let one = make_integral(1, size, signed).unwrap_or(Value::Null);
                self.push(one)?;
                self.push(Value::ulong(*unit))?;
                self.emit(Insn::Mko)?;
                self.emit(if incr { Insn::AddO } else { Insn::SubO })?;
            }
            _ => return Err(gerr(exp.loc, "++/-- needs an integer or offset")),
        }
        self.emit(Insn::Popvar { back, over })
    }

    fn format_part(&mut self, p: &FormatPart, print: bool) -> Result<(), CompileError> {
        match p {
            FormatPart::Lit(s) => {
                self.push_str(s)?;
                if print {
                    self.emit(Insn::Prints)
                } else {
                    self.emit(Insn::Sconc)
                }
            }
            FormatPart::Str(e) => {
                self.exp(e)?;
                if print {
                    self.emit(Insn::Prints)
                } else {
                    self.emit(Insn::Sconc)
                }
            }
            FormatPart::Val(e) => {
                self.exp(e)?;
                // Strings print raw, like %s.
                let is_str = matches!(
                    e.ty.as_deref().map(|t| &t.kind),
                    Some(NodeKind::TypeString)
                );
                if print {
                    if is_str {
                        self.emit(Insn::Prints)
                    } else {
                        self.emit(Insn::Print)
                    }
                } else {
                    if !is_str {
                        self.emit(Insn::Vtos)?;
                    }
                    self.emit(Insn::Sconc)
                }
            }
        }
    }

    // -- expressions -------------------------------------------------------

    fn exp(&mut self, n: &Node) -> Result<(), CompileError> {
        match &n.kind {
            NodeKind::Int {
                value,
                size,
                signed,
            } => {
                let v = make_integral(*value as u64, *size, *signed)
                    .ok_or_else(|| gerr(n.loc, "bad integer literal width"))?;
                self.push(v)
            }
            NodeKind::Str(s) => {
                let s = s.clone();
                self.push_str(&s)
            }
            NodeKind::OffsetLit { magnitude, unit } => {
                self.exp(magnitude)?;
                self.push(Value::ulong(*unit))?;
                self.emit(Insn::Mko)
            }
            NodeKind::Var { back, over, .. } => self.emit(Insn::Pushvar {
                back: *back as u16,
                over: *over as u16,
            }),
            NodeKind::Unary { op, operand } => {
                self.exp(operand)?;
                match op {
                    UnOp::Neg => self.emit(Insn::Neg),
                    UnOp::Pos => Ok(()),
                    UnOp::BNot => self.emit(Insn::BNot),
                    UnOp::Not => {
                        // x == 0 at the operand's width.
                        let (size, signed) = integral_of(operand)
                            .ok_or_else(|| gerr(n.loc, "! needs an integer"))?;
                        let zero = make_integral(0, size, signed).unwrap_or(Value::Null);
                        self.push(zero)?;
                        self.emit(Insn::EqI)
                    }
                }
            }
            NodeKind::Binary { op, left, right } => self.binary(n, *op, left, right),
            NodeKind::Ternary {
                cond,
                then_e,
                else_e,
            } => {
                let lelse = self.label();
                let lend = self.label();
                self.exp(cond)?;
                self.emit(Insn::Bzi(lelse.0))?;
                self.exp(then_e)?;
                self.emit(Insn::Ba(lend.0))?;
                self.place(lelse)?;
                self.exp(else_e)?;
                self.place(lend)
            }
            NodeKind::Funcall { func, args } => {
                // Method call: the receiver is the single closure
                // argument.
                if let NodeKind::StructRef { base, field } = &func.kind {
                    if args.is_empty() && is_method_ref(func, base) {
                        self.exp(base)?;
                        self.emit(Insn::Dup)?;
                        self.push_str(field)?;
                        self.emit(Insn::Smeth)?;
                        return self.emit(Insn::Call);
                    }
                }
                for a in args {
                    self.exp(a)?;
                }
                self.exp(func)?;
                self.emit(Insn::Call)
            }
            NodeKind::StructRef { base, field } => {
                self.exp(base)?;
                self.push_str(field)?;
                if is_method_ref(n, base) {
                    self.emit(Insn::Smeth)
                } else {
                    self.emit(Insn::Sref)
                }
            }
            NodeKind::Indexer { entity, index } => {
                self.exp(entity)?;
                self.exp(index)?;
                let is_string = matches!(
                    entity.ty.as_deref().map(|t| &t.kind),
                    Some(NodeKind::TypeString)
                );
                self.emit(if is_string { Insn::Strref } else { Insn::Aref })
            }
            NodeKind::Trimmer { entity, from, to } => {
                self.exp(entity)?;
                self.exp(from)?;
                self.exp(to)?;
                self.emit(Insn::Atrim)
            }
            NodeKind::Cast { ty, exp } => self.cast(ty, exp),
            NodeKind::Isa { ty, exp } => {
                self.exp(exp)?;
                self.emit_type(ty)?;
                self.emit(Insn::Isa)
            }
            NodeKind::MapExp {
                strict,
                ty,
                ios,
                offset,
            } => {
                self.emit_type(ty)?;
                match ios {
                    Some(i) => self.exp(i)?,
                    None => self.push(Value::Null)?,
                }
                self.exp(offset)?;
                self.emit(Insn::Map { strict: *strict })
            }
            NodeKind::ArrayLit(inits) => {
                let aty = n
                    .ty
                    .as_deref()
                    .ok_or_else(|| gerr(n.loc, "untyped array literal"))?;
                self.emit_type(aty)?;
                self.push(Value::ulong(inits.len() as u64))?;
                self.emit(Insn::Mka)?;
                for (i, e) in inits.iter().enumerate() {
                    self.push(Value::ulong(i as u64))?;
                    self.exp(e)?;
                    self.emit(Insn::Ains)?;
                }
                Ok(())
            }
            NodeKind::ArrayCons { ty, inits } => {
                if inits.is_empty() {
                    self.emit_type(ty)?;
                    return self.emit(Insn::Cons);
                }
                let bound = array_bound(ty);
                if inits.len() == 1 && bound != Some(1) {
                    // One initializer fills the whole array.
                    self.emit_type(ty)?;
                    self.emit(Insn::Cons)?;
                    self.exp(&inits[0])?;
                    return self.emit(Insn::Afill);
                }
                self.emit_type(ty)?;
                self.push(Value::ulong(inits.len() as u64))?;
                self.emit(Insn::Mka)?;
                for (i, e) in inits.iter().enumerate() {
                    self.push(Value::ulong(i as u64))?;
                    self.exp(e)?;
                    self.emit(Insn::Ains)?;
                }
                Ok(())
            }
            NodeKind::StructCons { ty, fields } => {
                self.emit_type(ty)?;
                self.emit(Insn::Cons)?;
                for (name, v) in fields {
                    self.push_str(name)?;
                    self.exp(v)?;
                    self.emit(Insn::Sset)?;
                }
                self.emit(Insn::Sck)
            }
            NodeKind::Lambda(f) => self.exp(f),
            NodeKind::Func { ret, args, body } => self.function(ret, args.len(), body),
            NodeKind::FormatExp(parts) => {
                self.push_str("")?;
                for p in parts {
                    self.format_part(p, false)?;
                }
                Ok(())
            }
            other => Err(gerr(
                n.loc,
                format!(
                    "internal: no code for expression {:?}",
                    std::mem::discriminant(other)
                ),
            )),
        }
    }

    /// A function body as a closure value on the stack.
    fn function(&mut self, ret: &Node, nargs: usize, body: &Node) -> Result<(), CompileError> {
        self.closure(|g| {
            g.emit(Insn::PushEnv)?;
            for _ in 0..nargs {
                g.emit(Insn::Regvar)?;
            }
            let saved_loops = std::mem::take(&mut g.loops);
            let saved_depth = g.env_depth;
            let saved_try_base = g.func_try_base;
            g.env_depth = 0;
            g.func_try_base = g.try_depth;
            let r = g.stmt(body);
            g.loops = saved_loops;
            g.env_depth = saved_depth;
            g.func_try_base = saved_try_base;
            r?;
            // Fallthrough: void functions return null, others have
            // missed their return.
            if matches!(ret.kind, NodeKind::TypeVoid) {
                g.b.push_val(Value::Null).map_err(CompileError::from)?;
            } else {
                let exc = g.vm.exception(EC_NO_RETURN, "function did not return a value");
                g.push(exc)?;
                g.emit(Insn::Raise)?;
            }
            g.emit(Insn::Return)
        })
    }

    /// Emit a closure body out of line and leave the closure value,
    /// bound to the current environment, on the stack.
    fn closure(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let lafter = self.label();
        let lentry = self.label();
        self.emit(Insn::Ba(lafter.0))?;
        self.place(lentry)?;
        body(self)?;
        self.place(lafter)?;
        self.emit(Insn::MkCls { entry: lentry.0 })?;
        self.emit(Insn::Pec)
    }

    // -- operators ---------------------------------------------------------

    fn binary(
        &mut self,
        n: &Node,
        op: BinOp,
        left: &Node,
        right: &Node,
    ) -> Result<(), CompileError> {
        let lk = operand_class(left);
        let rk = operand_class(right);

        use BinOp::*;
        match (op, lk, rk) {
            (And, _, _) | (Or, _, _) => self.logical(op == And, left, right),
            (Add, Class::Str, Class::Str) => {
                self.exp(left)?;
                self.exp(right)?;
                self.emit(Insn::Sconc)
            }
            (_, Class::Str, Class::Str) => {
                self.exp(left)?;
                self.exp(right)?;
                self.emit(match op {
                    Eq => Insn::EqS,
                    Ne => Insn::NeS,
                    Lt => Insn::LtS,
                    Le => Insn::LeS,
                    Gt => Insn::GtS,
                    Ge => Insn::GeS,
                    _ => return Err(gerr(n.loc, "invalid string operation")),
                })
            }
            (_, Class::Off, Class::Off) => {
                match op {
                    Add | Sub | Div | CeilDiv | Mod => {
                        self.exp(left)?;
                        self.exp(right)?;
                        self.emit(match op {
                            Add => Insn::AddO,
                            Sub => Insn::SubO,
                            Div => Insn::DivO,
                            CeilDiv => Insn::CDivO,
                            _ => Insn::ModO,
                        })
                    }
                    Eq | Ne | Lt | Le | Gt | Ge => {
                        // Compare as total bit counts.
                        self.offset_bits(left)?;
                        self.offset_bits(right)?;
                        self.emit(match op {
                            Eq => Insn::EqI,
                            Ne => Insn::NeI,
                            Lt => Insn::LtI,
                            Le => Insn::LeI,
                            Gt => Insn::GtI,
                            _ => Insn::GeI,
                        })
                    }
                    _ => Err(gerr(n.loc, "invalid offset operation")),
                }
            }
            (Mul, Class::Off, Class::Int) => {
                self.exp(left)?;
                self.exp(right)?;
                self.emit(Insn::MulO)
            }
            (Mul, Class::Int, Class::Off) => {
                self.exp(right)?;
                self.exp(left)?;
                self.emit(Insn::MulO)
            }
            // Structural equality for composite operands.
            (Eq, Class::Other, Class::Other) => {
                self.exp(left)?;
                self.exp(right)?;
                self.emit(Insn::Eqa)
            }
            (Ne, Class::Other, Class::Other) => {
                self.exp(left)?;
                self.exp(right)?;
                self.emit(Insn::Eqa)?;
                self.push(Value::int32(0))?;
                self.emit(Insn::EqI)
            }
            _ => {
                self.exp(left)?;
                self.exp(right)?;
                self.emit(match op {
                    Add => Insn::AddOv,
                    Sub => Insn::SubOv,
                    Mul => Insn::MulOv,
                    Div => Insn::Div,
                    CeilDiv => Insn::CDiv,
                    Mod => Insn::Mod,
                    Pow => Insn::PowOv,
                    Eq => Insn::EqI,
                    Ne => Insn::NeI,
                    Lt => Insn::LtI,
                    Le => Insn::LeI,
                    Gt => Insn::GtI,
                    Ge => Insn::GeI,
                    BAnd => Insn::BAnd,
                    BOr => Insn::BOr,
                    BXor => Insn::BXor,
                    Shl => Insn::Shl,
                    Shr => Insn::Shr,
                    BConc => Insn::Bconc,
                    And | Or => unreachable!("handled above"),
                })
            }
        }
    }

    /// Short-circuit `&&`/`||` yielding an `int<32>` 0/1.
    fn logical(&mut self, is_and: bool, left: &Node, right: &Node) -> Result<(), CompileError> {
        let lshort = self.label();
        let lend = self.label();
        let short = |l: Label| if is_and { Insn::Bzi(l.0) } else { Insn::Bnzi(l.0) };
        self.exp(left)?;
        self.emit(short(lshort))?;
        self.exp(right)?;
        self.emit(short(lshort))?;
        self.push(Value::int32(if is_and { 1 } else { 0 }))?;
        self.emit(Insn::Ba(lend.0))?;
        self.place(lshort)?;
        self.push(Value::int32(if is_and { 0 } else { 1 }))?;
        self.place(lend)
    }

    /// Total bit count of an offset expression, as an `int<64>`.
    fn offset_bits(&mut self, e: &Node) -> Result<(), CompileError> {
        self.exp(e)?;
        self.emit(Insn::Ogetm)?;
        self.emit(Insn::Swap)?;
        self.emit(Insn::Ogetu)?;
        self.emit(Insn::Nip)?;
        self.emit(Insn::IConv {
            size: 64,
            signed: true,
        })?;
        self.emit(Insn::Swap)?;
        self.emit(Insn::IConv {
            size: 64,
            signed: true,
        })?;
        self.emit(Insn::Mul)
    }

    fn cast(&mut self, ty: &Node, exp: &Node) -> Result<(), CompileError> {
        let from = exp.ty.as_deref();
        match (&ty.kind, from.map(|t| &t.kind)) {
            (NodeKind::TypeIntegral { size, signed }, _) => {
                self.exp(exp)?;
                self.emit(Insn::IConv {
                    size: *size as u8,
                    signed: *signed,
                })
            }
            (
                NodeKind::TypeOffset { base, unit },
                Some(NodeKind::TypeOffset { .. }),
            ) => {
                // Rescale: bits / new-unit, in the new base type.
                let (size, signed) = match base.kind {
                    NodeKind::TypeIntegral { size, signed } => (size, signed),
                    _ => (64, false),
                };
                self.offset_bits(exp)?;
                let u = make_integral(*unit, 64, true).unwrap_or(Value::Null);
                self.push(u)?;
                self.emit(Insn::Div)?;
                self.emit(Insn::IConv {
                    size: size as u8,
                    signed,
                })?;
                self.push(Value::ulong(*unit))?;
                self.emit(Insn::Mko)
            }
            (NodeKind::TypeArray { bound, .. }, _) => {
                self.exp(exp)?;
                if let Some(b) = bound {
                    if let NodeKind::Int { value, .. } = b.kind {
                        self.push(Value::ulong(value as u64))?;
                        self.emit(Insn::ArrConvSel)?;
                    }
                }
                Ok(())
            }
            // Everything else is representation-free at runtime.
            _ => self.exp(exp),
        }
    }

    // -- types as values ---------------------------------------------------

    /// Literal value for a type with no runtime parts.
    fn type_literal(&mut self, ty: &Node) -> Option<Value> {
        match &ty.kind {
            NodeKind::TypeIntegral { size, signed } => Some(self.vm.itype(*size, *signed)),
            NodeKind::TypeString => Some(self.vm.string_type()),
            NodeKind::TypeVoid => Some(self.vm.void_type()),
            NodeKind::TypeAny => Some(self.vm.any_type()),
            NodeKind::TypeOffset { base, unit } => {
                let b = self.type_literal(base)?;
                Some(
                    self.vm
                        .alloc(Object::Typ(TypeVal::Offset { base: b, unit: *unit })),
                )
            }
            NodeKind::TypeArray { elem, bound } => {
                let e = self.type_literal(elem)?;
                let b = match bound.as_deref() {
                    None => Value::Null,
                    Some(Node {
                        kind: NodeKind::Int { value, .. },
                        literal: true,
                        ..
                    }) => Value::ulong(*value as u64),
                    Some(_) => return None,
                };
                Some(
                    self.vm
                        .alloc(Object::Typ(TypeVal::Array { bound: b, elem: e })),
                )
            }
            _ => None,
        }
    }

    /// Push a type value: a literal when possible, otherwise code that
    /// builds it (or fetches it from its declaration).
    fn emit_type(&mut self, ty: &Node) -> Result<(), CompileError> {
        if let Some(v) = self.type_literal(ty) {
            return self.push(v);
        }
        match &ty.kind {
            NodeKind::TypeNamed { back, over, .. } => self.emit(Insn::Pushvar {
                back: *back as u16,
                over: *over as u16,
            }),
            NodeKind::TypeArray { elem, bound } => {
                self.emit_type(elem)?;
                match bound.as_deref() {
                    Some(b) => self.exp(b)?,
                    None => self.push(Value::Null)?,
                }
                self.push(Value::Null)?; // no bounder closure
                self.emit(Insn::Mkat)
            }
            NodeKind::TypeStruct {
                fields,
                methods,
                pinned,
                union_,
            } => self.struct_type(None, fields, methods, *pinned, *union_),
            _ => Err(gerr(ty.loc, "type has no runtime representation")),
        }
    }

    /// Value of a `type` declaration: named struct types get their name
    /// attached for nominal equality.
    fn type_decl_value(&mut self, name: &str, ty: &Node) -> Result<(), CompileError> {
        if let NodeKind::TypeStruct {
            fields,
            methods,
            pinned,
            union_,
        } = &ty.kind
        {
            return self.struct_type(Some(name), fields, methods, *pinned, *union_);
        }
        self.emit_type(ty)
    }

    /// Build a struct type value at runtime, closures and all.
    fn struct_type(
        &mut self,
        name: Option<&str>,
        fields: &[FieldDecl],
        methods: &[MethodDecl],
        pinned: bool,
        union_: bool,
    ) -> Result<(), CompileError> {
        match name {
            Some(n) => self.push_str(n)?,
            None => self.push(Value::Null)?,
        }
        for (k, f) in fields.iter().enumerate() {
            self.push_str(&f.name)?;
            // Field types were bound inside the struct's scope frame but
            // are built here, outside it: unwind one frame from their
            // named references.
            let fty = unbind_struct_frame(&f.ty);
            self.emit_type(&fty)?;

            // Label: a constant when it folded, a closure otherwise.
            match &f.label {
                None => self.push(Value::Null)?,
                Some(l) => match label_bits(l) {
                    Some(bits) => self.push(Value::ulong(bits))?,
                    None => {
                        let l = l.clone();
                        self.field_closure(fields, k, move |g| {
                            g.exp(&l)?;
                            g.emit(Insn::Return)
                        })?;
                    }
                },
            }
            match &f.constraint {
                None => self.push(Value::Null)?,
                Some(c) => {
                    let c = c.clone();
                    let fname = f.name.clone();
                    self.field_closure(fields, k + 1, move |g| {
                        let lok = g.label();
                        g.exp(&c)?;
                        g.emit(Insn::Bnzi(lok.0))?;
                        let exc = g.vm.exception(
                            EC_CONSTRAINT,
                            &format!("constraint on field '{}' failed", fname),
                        );
                        g.push(exc)?;
                        g.emit(Insn::Raise)?;
                        g.place(lok)?;
                        g.b.push_val(Value::Null).map_err(CompileError::from)?;
                        g.emit(Insn::Return)
                    })?;
                }
            }
            match &f.init {
                None => self.push(Value::Null)?,
                Some(i) => {
                    let i = i.clone();
                    self.field_closure(fields, k, move |g| {
                        g.exp(&i)?;
                        g.emit(Insn::Return)
                    })?;
                }
            }
            match &f.optcond {
                None => self.push(Value::Null)?,
                Some(o) => {
                    let o = o.clone();
                    self.field_closure(fields, k, move |g| {
                        g.exp(&o)?;
                        g.emit(Insn::Return)
                    })?;
                }
            }
            let endian = match f.endian {
                None => 0u64,
                Some(jab_core::bits::Endian::Little) => 1,
                Some(jab_core::bits::Endian::Big) => 2,
            };
            self.push(Value::ULong {
                v: endian,
                size: 64,
            })?;
        }
        for m in methods {
            self.push_str(&m.name)?;
            let body = (*m.body).clone();
            let ret_void = matches!(m.ret.kind, NodeKind::TypeVoid);
            self.field_closure(fields, fields.len(), move |g| {
                let saved_loops = std::mem::take(&mut g.loops);
                let saved_depth = g.env_depth;
                let saved_try_base = g.func_try_base;
                g.env_depth = 0;
                g.func_try_base = g.try_depth;
                let r = g.stmt(&body);
                g.loops = saved_loops;
                g.env_depth = saved_depth;
                g.func_try_base = saved_try_base;
                r?;
                if ret_void {
                    g.b.push_val(Value::Null).map_err(CompileError::from)?;
                } else {
                    let exc = g
                        .vm
                        .exception(EC_NO_RETURN, "method did not return a value");
                    g.push(exc)?;
                    g.emit(Insn::Raise)?;
                }
                g.emit(Insn::Return)
            })?;
        }
        self.emit(Insn::Mkst {
            nfields: fields.len() as u32,
            nmethods: methods.len() as u32,
            pinned,
            union_,
        })
    }

    /// A closure over a struct value: the prologue binds the value to
    /// slot 0 and materialises the first `nfields` fields into slots
    /// 1.., absent fields as null.
    fn field_closure(
        &mut self,
        fields: &[FieldDecl],
        nfields: usize,
        body: impl FnOnce(&mut Self) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let names: Vec<String> = fields
            .iter()
            .take(nfields)
            .map(|f| f.name.clone())
            .collect();
        self.closure(move |g| {
            g.emit(Insn::PushEnv)?;
            g.emit(Insn::Regvar)?;
            for fname in &names {
                let labsent = g.label();
                let ldone = g.label();
                g.emit(Insn::Pushe {
                    target: labsent.0,
                    code: EC_ELEM,
                })?;
                g.emit(Insn::Pushvar { back: 0, over: 0 })?;
                g.push_str(fname)?;
                g.emit(Insn::Sref)?;
                g.emit(Insn::Pope)?;
                g.emit(Insn::Ba(ldone.0))?;
                g.place(labsent)?;
                g.emit(Insn::Drop)?;
                g.b.push_val(Value::Null).map_err(CompileError::from)?;
                g.place(ldone)?;
                g.emit(Insn::Regvar)?;
            }
            body(g)
        })
    }
}

/// Adjust the named references of a struct field's type for emission
/// outside the struct scope frame: every `back` shrinks by one. The
/// frame itself holds no type declarations, so no reference can point
/// into it.
fn unbind_struct_frame(ty: &Node) -> Node {
    let mut t = ty.clone();
    unbind(&mut t);
    return t;

    fn unbind(t: &mut Node) {
        match &mut t.kind {
            NodeKind::TypeNamed { back, .. } => *back = back.saturating_sub(1),
            NodeKind::TypeArray { elem, bound } => {
                unbind(elem);
                // Bounds are constant inside struct specs (enforced by
                // the typing pass); nothing to rebind there.
                let _ = bound;
            }
            NodeKind::TypeOffset { base, .. } => unbind(base),
            _ => {}
        }
    }
}

/// Whether a struct reference resolves to a method (typify attaches a
/// function type to those; fields can never be function-typed).
fn is_method_ref(sref: &Node, _base: &Node) -> bool {
    matches!(
        sref.ty.as_deref().map(|t| &t.kind),
        Some(NodeKind::TypeFunction { .. })
    )
}

enum Class {
    Int,
    Off,
    Str,
    Other,
}

fn operand_class(e: &Node) -> Class {
    match e.ty.as_deref().map(|t| &t.kind) {
        Some(NodeKind::TypeIntegral { .. }) => Class::Int,
        Some(NodeKind::TypeOffset { .. }) => Class::Off,
        Some(NodeKind::TypeString) => Class::Str,
        _ => Class::Other,
    }
}

fn integral_of(e: &Node) -> Option<(u32, bool)> {
    match e.ty.as_deref().map(|t| &t.kind) {
        Some(NodeKind::TypeIntegral { size, signed }) => Some((*size, *signed)),
        _ => None,
    }
}

fn array_bound(ty: &Node) -> Option<u64> {
    match &ty.kind {
        NodeKind::TypeArray { bound, .. } => match bound.as_deref() {
            Some(Node {
                kind: NodeKind::Int { value, .. },
                ..
            }) => Some(*value as u64),
            _ => None,
        },
        _ => None,
    }
}

fn label_bits(l: &Node) -> Option<u64> {
    match &l.kind {
        NodeKind::Int { value, .. } if l.literal => Some(*value as u64),
        NodeKind::OffsetLit { magnitude, unit } if l.literal || magnitude.literal => {
            match magnitude.kind {
                NodeKind::Int { value, .. } => Some(value as u64 * unit),
                _ => None,
            }
        }
        _ => None,
    }
}
