//! Parser
//!
//! Recursive descent with precedence climbing. Names are bound as the
//! tree is built: variable and named-type references carry `(back, over)`
//! environment coordinates assigned against the compile-time environment,
//! so scope frames are pushed and popped here in exactly the discipline
//! the code generator emits (`pushenv`/`regvar`/`popenv`):
//!
//! - compound statements open a frame lazily, at their first declaration;
//! - function bodies open a frame holding the formals, registered in
//!   reverse so the callee can pop its arguments in stack order;
//! - struct type specs open a frame holding a hidden slot for the value
//!   itself followed by one slot per field, which is how field names are
//!   in scope inside constraints, initializers and methods;
//! - `for (x in c)` opens a frame with two hidden slots (container and
//!   index) before `x`;
//! - `catch` handlers open a frame binding the exception.
//!
//! The start symbol is selectable: a whole program, one statement, one
//! expression, or one declaration.

use std::rc::Rc;

use jab_core::bits::Endian;

use crate::ast::{
    AstCtx, BinOp, DeclKind, FieldDecl, FormatPart, FuncArg, Loc, MethodDecl, Node, NodeKind,
    UnOp,
};
use crate::env::{CEnv, Decl};
use crate::error::CompileError;
use crate::lexer::{Lexer, TokKind, Token};

/// What a registered alien-token callback may splice in.
#[derive(Debug, Clone)]
pub enum AlienLit {
    Int { value: i64, size: u32, signed: bool },
    Str(String),
}

pub type AlienFn<'a> = &'a dyn Fn(&str) -> Option<AlienLit>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSymbol {
    Program,
    Statement,
    Expression,
    Declaration,
}

/// Parse `src` against `env` with the given start symbol.
pub fn parse(
    src: &str,
    ctx: &Rc<AstCtx>,
    env: &mut CEnv,
    start: StartSymbol,
    cuckolding: bool,
    alien: Option<AlienFn>,
) -> Result<Node, CompileError> {
    let toks = Lexer::new(src, cuckolding).tokenize()?;
    let mut p = Parser {
        toks,
        pos: 0,
        ctx: ctx.clone(),
        env,
        alien,
    };
    let node = match start {
        StartSymbol::Program => p.parse_program()?,
        StartSymbol::Statement => {
            let s = p.parse_stmt()?;
            p.expect_eof()?;
            s
        }
        StartSymbol::Expression => {
            let e = p.parse_exp()?;
            p.expect_eof()?;
            e
        }
        StartSymbol::Declaration => {
            let d = p.parse_stmt()?;
            if !matches!(d.kind, NodeKind::Decl { .. }) {
                return Err(CompileError::parse(d.loc, "expected a declaration"));
            }
            p.expect_eof()?;
            d
        }
    };
    Ok(node)
}

struct Parser<'e, 'a> {
    toks: Vec<Token>,
    pos: usize,
    ctx: Rc<AstCtx>,
    env: &'e mut CEnv,
    alien: Option<AlienFn<'a>>,
}

impl<'e, 'a> Parser<'e, 'a> {
    // -- token plumbing ----------------------------------------------------

    fn cur(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    fn loc(&self) -> Loc {
        self.cur().loc
    }

    fn bump(&mut self) -> Token {
        let t = self.cur().clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn at_punct(&self, p: &str) -> bool {
        matches!(&self.cur().kind, TokKind::Punct(q) if *q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), CompileError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(CompileError::parse(
                self.loc(),
                format!("expected '{}'", p),
            ))
        }
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(&self.cur().kind, TokKind::Ident(s) if s == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String, CompileError> {
        match &self.cur().kind {
            TokKind::Ident(s) => {
                let s = s.clone();
                self.bump();
                Ok(s)
            }
            _ => Err(CompileError::parse(self.loc(), "expected an identifier")),
        }
    }

    fn expect_eof(&mut self) -> Result<(), CompileError> {
        if matches!(self.cur().kind, TokKind::Eof) {
            Ok(())
        } else {
            Err(CompileError::parse(self.loc(), "trailing input"))
        }
    }

    fn node(&self, kind: NodeKind, loc: Loc) -> Node {
        Node::new(&self.ctx, kind, loc)
    }

    // -- programs and statements -------------------------------------------

    fn parse_program(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();
        let mut stmts = Vec::new();
        while !matches!(self.cur().kind, TokKind::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        Ok(self.node(NodeKind::Program(stmts), loc))
    }

    fn parse_stmt(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();
        if self.eat_punct(";") {
            return Ok(self.node(NodeKind::NullStmt, loc));
        }
        if self.at_punct("{") {
            return self.parse_compound();
        }
        if self.at_kw("var") || self.at_kw("type") || self.at_kw("fun") {
            return self.parse_decl();
        }
        if self.eat_kw("if") {
            self.expect_punct("(")?;
            let cond = self.parse_exp()?;
            self.expect_punct(")")?;
            let then_s = self.parse_stmt()?;
            let else_s = if self.eat_kw("else") {
                Some(Box::new(self.parse_stmt()?))
            } else {
                None
            };
            return Ok(self.node(
                NodeKind::IfStmt {
                    cond: Box::new(cond),
                    then_s: Box::new(then_s),
                    else_s,
                },
                loc,
            ));
        }
        if self.eat_kw("while") {
            self.expect_punct("(")?;
            let cond = self.parse_exp()?;
            self.expect_punct(")")?;
            let body = self.parse_stmt()?;
            return Ok(self.node(
                NodeKind::WhileStmt {
                    cond: Box::new(cond),
                    body: Box::new(body),
                },
                loc,
            ));
        }
        if self.eat_kw("for") {
            self.expect_punct("(")?;
            let var = self.expect_ident()?;
            if !self.eat_kw("in") {
                return Err(CompileError::parse(self.loc(), "expected 'in'"));
            }
            let container = self.parse_exp()?;
            self.expect_punct(")")?;
            // Two hidden slots before the loop variable, mirroring the
            // generated frame.
            self.env.push_frame();
            self.env.register(Decl {
                name: String::new(),
                kind: DeclKind::Var,
                ty: None,
            });
            self.env.register(Decl {
                name: String::new(),
                kind: DeclKind::Var,
                ty: None,
            });
            self.env.register(Decl {
                name: var.clone(),
                kind: DeclKind::Var,
                ty: None,
            });
            let body = self.parse_stmt();
            self.env.pop_frame();
            return Ok(self.node(
                NodeKind::ForInStmt {
                    var,
                    container: Box::new(container),
                    body: Box::new(body?),
                },
                loc,
            ));
        }
        if self.eat_kw("break") {
            self.expect_punct(";")?;
            return Ok(self.node(NodeKind::BreakStmt, loc));
        }
        if self.eat_kw("continue") {
            self.expect_punct(";")?;
            return Ok(self.node(NodeKind::ContinueStmt, loc));
        }
        if self.eat_kw("return") {
            let e = if self.at_punct(";") {
                None
            } else {
                Some(Box::new(self.parse_exp()?))
            };
            self.expect_punct(";")?;
            return Ok(self.node(NodeKind::ReturnStmt(e), loc));
        }
        if self.eat_kw("raise") {
            let e = if self.at_punct(";") {
                None
            } else {
                Some(Box::new(self.parse_exp()?))
            };
            self.expect_punct(";")?;
            return Ok(self.node(NodeKind::RaiseStmt(e), loc));
        }
        if self.eat_kw("try") {
            return self.parse_try(loc);
        }
        if self.eat_kw("print") {
            let e = self.parse_exp()?;
            self.expect_punct(";")?;
            return Ok(self.node(
                NodeKind::PrintStmt {
                    printf: false,
                    parts: vec![FormatPart::Val(e)],
                },
                loc,
            ));
        }
        if self.eat_kw("printf") {
            let fmt = match &self.cur().kind {
                TokKind::Str(s) => {
                    let s = s.clone();
                    self.bump();
                    s
                }
                _ => {
                    return Err(CompileError::parse(
                        self.loc(),
                        "printf needs a format string",
                    ))
                }
            };
            let mut args = Vec::new();
            while self.eat_punct(",") {
                args.push(self.parse_exp()?);
            }
            self.expect_punct(";")?;
            let parts = build_format(&fmt, args, loc)?;
            return Ok(self.node(
                NodeKind::PrintStmt {
                    printf: true,
                    parts,
                },
                loc,
            ));
        }
        if self.eat_kw("asm") {
            self.expect_punct("(")?;
            let template = match &self.cur().kind {
                TokKind::Str(s) => {
                    let s = s.clone();
                    self.bump();
                    s
                }
                _ => {
                    return Err(CompileError::parse(
                        self.loc(),
                        "asm needs a template string",
                    ))
                }
            };
            self.expect_punct(")")?;
            self.expect_punct(";")?;
            return Ok(self.node(NodeKind::AsmStmt(template), loc));
        }

        // Expression statement, assignment, or ++/--.
        let e = self.parse_exp()?;
        if self.eat_punct("=") {
            let rhs = self.parse_exp()?;
            self.expect_punct(";")?;
            return Ok(self.node(
                NodeKind::AssStmt {
                    lvalue: Box::new(e),
                    exp: Box::new(rhs),
                },
                loc,
            ));
        }
        if self.at_punct("++") || self.at_punct("--") {
            let incr = self.at_punct("++");
            self.bump();
            self.expect_punct(";")?;
            return Ok(self.node(
                NodeKind::IncrDecr {
                    exp: Box::new(e),
                    incr,
                },
                loc,
            ));
        }
        self.expect_punct(";")?;
        Ok(self.node(NodeKind::ExpStmt(Box::new(e)), loc))
    }

    /// Compound statement. The scope frame opens at the first
    /// declaration, matching the generated code.
    fn parse_compound(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();
        self.expect_punct("{")?;
        let mut stmts = Vec::new();
        let mut framed = false;
        let r = loop {
            if self.eat_punct("}") {
                break Ok(());
            }
            if matches!(self.cur().kind, TokKind::Eof) {
                break Err(CompileError::parse(self.loc(), "unterminated block"));
            }
            if !framed && (self.at_kw("var") || self.at_kw("type") || self.at_kw("fun")) {
                self.env.push_frame();
                framed = true;
            }
            match self.parse_stmt() {
                Ok(s) => stmts.push(s),
                Err(e) => break Err(e),
            }
        };
        if framed {
            self.env.pop_frame();
        }
        r?;
        Ok(self.node(NodeKind::CompStmt(stmts), loc))
    }

    fn parse_try(&mut self, loc: Loc) -> Result<Node, CompileError> {
        let body = self.parse_stmt()?;
        if !self.eat_kw("catch") {
            return Err(CompileError::parse(self.loc(), "expected 'catch'"));
        }

        if self.eat_kw("if") {
            // catch if EXPR { ... } [else { ... }] with 'e' bound.
            self.env.push_frame();
            self.env.register(Decl {
                name: "e".to_string(),
                kind: DeclKind::Var,
                ty: None,
            });
            let r: Result<(Node, Node, Option<Box<Node>>), CompileError> = (|| {
                let cond = self.parse_exp()?;
                let handler = self.parse_compound()?;
                let else_handler = if self.eat_kw("else") {
                    Some(Box::new(self.parse_compound()?))
                } else {
                    None
                };
                Ok((cond, handler, else_handler))
            })();
            self.env.pop_frame();
            let (cond, handler, else_handler) = r?;
            return Ok(self.node(
                NodeKind::TryStmt {
                    body: Box::new(body),
                    arg: "e".to_string(),
                    cond: Some(Box::new(cond)),
                    handler: Box::new(handler),
                    else_handler,
                },
                loc,
            ));
        }

        let arg = if self.eat_punct("(") {
            let a = self.expect_ident()?;
            self.expect_punct(")")?;
            a
        } else {
            "e".to_string()
        };
        self.env.push_frame();
        self.env.register(Decl {
            name: arg.clone(),
            kind: DeclKind::Var,
            ty: None,
        });
        let handler = self.parse_compound();
        self.env.pop_frame();
        Ok(self.node(
            NodeKind::TryStmt {
                body: Box::new(body),
                arg,
                cond: None,
                handler: Box::new(handler?),
                else_handler: None,
            },
            loc,
        ))
    }

    // -- declarations ------------------------------------------------------

    fn parse_decl(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();
        if self.eat_kw("var") {
            let name = self.expect_ident()?;
            self.expect_punct("=")?;
            let init = self.parse_exp()?;
            self.expect_punct(";")?;
            self.env.register(Decl {
                name: name.clone(),
                kind: DeclKind::Var,
                ty: None,
            });
            return Ok(self.node(
                NodeKind::Decl {
                    kind: DeclKind::Var,
                    name,
                    init: Box::new(init),
                },
                loc,
            ));
        }
        if self.eat_kw("type") {
            let name = self.expect_ident()?;
            self.expect_punct("=")?;
            // Enumerations desugar into an int<32> alias plus one
            // constant per enumerator.
            if self.at_kw("enum") {
                return self.parse_enum(name, loc);
            }
            let ty = self.parse_type()?;
            self.expect_punct(";")?;
            self.env.register(Decl {
                name: name.clone(),
                kind: DeclKind::Type,
                ty: Some(ty.clone()),
            });
            return Ok(self.node(
                NodeKind::Decl {
                    kind: DeclKind::Type,
                    name,
                    init: Box::new(ty),
                },
                loc,
            ));
        }
        // fun NAME = [(args)] RET: { ... }
        if self.eat_kw("fun") {
            let name = self.expect_ident()?;
            self.expect_punct("=")?;
            // Bind the name first so the body can recurse.
            self.env.register(Decl {
                name: name.clone(),
                kind: DeclKind::Fun,
                ty: None,
            });
            let func = self.parse_func_tail(loc)?;
            return Ok(self.node(
                NodeKind::Decl {
                    kind: DeclKind::Fun,
                    name,
                    init: Box::new(func),
                },
                loc,
            ));
        }
        Err(CompileError::parse(loc, "expected a declaration"))
    }

    /// `enum { A, B = 3, C };` after `type NAME =`: the type becomes an
    /// `int<32>` alias and each enumerator a constant, counting up from
    /// the previous value.
    fn parse_enum(&mut self, name: String, loc: Loc) -> Result<Node, CompileError> {
        self.eat_kw("enum");
        self.expect_punct("{")?;
        let ity = self.node(
            NodeKind::TypeIntegral {
                size: 32,
                signed: true,
            },
            loc,
        );
        self.env.register(Decl {
            name: name.clone(),
            kind: DeclKind::Type,
            ty: Some(ity.clone()),
        });
        let mut decls = vec![self.node(
            NodeKind::Decl {
                kind: DeclKind::Type,
                name,
                init: Box::new(ity),
            },
            loc,
        )];
        let mut next: i64 = 0;
        loop {
            let eloc = self.loc();
            let ename = self.expect_ident()?;
            if self.eat_punct("=") {
                next = self.expect_int()?;
            }
            self.env.register(Decl {
                name: ename.clone(),
                kind: DeclKind::Var,
                ty: None,
            });
            decls.push(self.node(
                NodeKind::Decl {
                    kind: DeclKind::Var,
                    name: ename,
                    init: Box::new(Node::int_lit(&self.ctx, next, 32, true, eloc)),
                },
                eloc,
            ));
            next += 1;
            if self.eat_punct("}") {
                break;
            }
            self.expect_punct(",")?;
            // Trailing comma.
            if self.eat_punct("}") {
                break;
            }
        }
        self.expect_punct(";")?;
        Ok(self.node(NodeKind::Program(decls), loc))
    }

    /// `[(T a, ...)] RET: { body }`, after the `=`.
    fn parse_func_tail(&mut self, loc: Loc) -> Result<Node, CompileError> {
        let mut args = Vec::new();
        if self.eat_punct("(") {
            if !self.eat_punct(")") {
                loop {
                    let ty = self.parse_type()?;
                    let name = self.expect_ident()?;
                    args.push(FuncArg { name, ty });
                    if self.eat_punct(")") {
                        break;
                    }
                    self.expect_punct(",")?;
                }
            }
        }
        let ret = self.parse_type()?;
        self.expect_punct(":")?;

        // Formals are registered in reverse: the callee pops its
        // arguments from the stack top down.
        self.env.push_frame();
        for a in args.iter().rev() {
            self.env.register(Decl {
                name: a.name.clone(),
                kind: DeclKind::Var,
                ty: Some(a.ty.clone()),
            });
        }
        let body = self.parse_compound();
        self.env.pop_frame();

        Ok(self.node(
            NodeKind::Func {
                ret: Box::new(ret),
                args,
                body: Box::new(body?),
            },
            loc,
        ))
    }

    // -- types -------------------------------------------------------------

    fn at_type_start(&self) -> bool {
        match &self.cur().kind {
            TokKind::Ident(s) => match s.as_str() {
                "int" | "uint" | "string" | "void" | "any" | "offset" | "struct" | "union"
                | "pinned" => true,
                name => matches!(
                    self.env.lookup(name),
                    Some((_, _, d)) if d.kind == DeclKind::Type
                ),
            },
            _ => false,
        }
    }

    fn parse_type(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();
        let mut t = if self.eat_kw("string") {
            self.node(NodeKind::TypeString, loc)
        } else if self.eat_kw("void") {
            self.node(NodeKind::TypeVoid, loc)
        } else if self.eat_kw("any") {
            self.node(NodeKind::TypeAny, loc)
        } else if self.at_kw("int") || self.at_kw("uint") {
            let signed = self.at_kw("int");
            self.bump();
            let size = if self.eat_punct("<") {
                let n = self.expect_int()?;
                self.expect_punct(">")?;
                n as u32
            } else {
                32
            };
            if size == 0 || size > 64 {
                return Err(CompileError::parse(loc, "integral width must be 1..64"));
            }
            self.node(NodeKind::TypeIntegral { size, signed }, loc)
        } else if self.eat_kw("offset") {
            self.expect_punct("<")?;
            let base = self.parse_type()?;
            self.expect_punct(",")?;
            let unit = self.parse_unit()?;
            self.expect_punct(">")?;
            self.node(
                NodeKind::TypeOffset {
                    base: Box::new(base),
                    unit,
                },
                loc,
            )
        } else if self.at_kw("struct") || self.at_kw("union") || self.at_kw("pinned") {
            self.parse_struct_type(loc)?
        } else {
            let name = self.expect_ident()?;
            match self.env.lookup(&name) {
                Some((back, over, d)) if d.kind == DeclKind::Type => {
                    self.node(NodeKind::TypeNamed { name, back, over }, loc)
                }
                _ => {
                    return Err(CompileError::parse(
                        loc,
                        format!("'{}' does not name a type", name),
                    ))
                }
            }
        };

        // Array type postfix: T[], T[n].
        while self.at_punct("[") {
            // Leave `[` for the expression parser when this is actually
            // an index into a value; types only reach here through
            // parse_type, where `[` always means an array bound.
            self.bump();
            let bound = if self.eat_punct("]") {
                None
            } else {
                let b = self.parse_exp()?;
                self.expect_punct("]")?;
                Some(Box::new(b))
            };
            t = self.node(
                NodeKind::TypeArray {
                    elem: Box::new(t),
                    bound,
                },
                loc,
            );
        }
        Ok(t)
    }

    fn expect_int(&mut self) -> Result<i64, CompileError> {
        match self.cur().kind {
            TokKind::Int { value, .. } => {
                self.bump();
                Ok(value)
            }
            _ => Err(CompileError::parse(self.loc(), "expected an integer")),
        }
    }

    fn parse_unit(&mut self) -> Result<u64, CompileError> {
        let loc = self.loc();
        match &self.cur().kind {
            TokKind::Ident(name) => {
                let u = unit_bits(name).ok_or_else(|| {
                    CompileError::parse(loc, format!("unknown unit '{}'", name))
                })?;
                self.bump();
                Ok(u)
            }
            TokKind::Int { value, .. } => {
                let v = *value;
                self.bump();
                if v <= 0 {
                    return Err(CompileError::parse(loc, "unit must be positive"));
                }
                Ok(v as u64)
            }
            _ => Err(CompileError::parse(loc, "expected a unit")),
        }
    }

    fn parse_struct_type(&mut self, loc: Loc) -> Result<Node, CompileError> {
        let pinned = self.eat_kw("pinned");
        let union_ = if pinned {
            self.eat_kw("struct");
            false
        } else if self.eat_kw("union") {
            true
        } else {
            self.eat_kw("struct");
            false
        };
        self.expect_punct("{")?;

        // Scope frame: hidden slot for the value itself, then one slot
        // per field as it is declared.
        self.env.push_frame();
        let r = self.parse_struct_body(pinned, union_, loc);
        self.env.pop_frame();
        r
    }

    fn parse_struct_body(
        &mut self,
        pinned: bool,
        union_: bool,
        loc: Loc,
    ) -> Result<Node, CompileError> {
        self.env.register(Decl {
            name: String::new(),
            kind: DeclKind::Var,
            ty: None,
        });
        let mut fields: Vec<FieldDecl> = Vec::new();
        let mut methods: Vec<MethodDecl> = Vec::new();
        while !self.eat_punct("}") {
            if matches!(self.cur().kind, TokKind::Eof) {
                return Err(CompileError::parse(self.loc(), "unterminated struct type"));
            }
            let floc = self.loc();
            if self.eat_kw("method") {
                let name = self.expect_ident()?;
                self.expect_punct("=")?;
                let ret = self.parse_type()?;
                self.expect_punct(":")?;
                let body = self.parse_compound()?;
                methods.push(MethodDecl {
                    name,
                    ret: Box::new(ret),
                    body: Box::new(body),
                    loc: floc,
                });
                continue;
            }
            let endian = if self.eat_kw("little") {
                Some(Endian::Little)
            } else if self.eat_kw("big") {
                Some(Endian::Big)
            } else {
                None
            };
            let ty = self.parse_type()?;
            let name = self.expect_ident()?;
            // The field is in scope inside its own constraint.
            self.env.register(Decl {
                name: name.clone(),
                kind: DeclKind::Var,
                ty: Some(ty.clone()),
            });
            let mut field = FieldDecl {
                name,
                ty,
                constraint: None,
                init: None,
                label: None,
                optcond: None,
                endian,
                loc: floc,
            };
            loop {
                if self.eat_punct("@") {
                    field.label = Some(self.parse_binary(PREC_ADD)?);
                } else if self.eat_punct("=") {
                    field.init = Some(self.parse_exp()?);
                } else if self.eat_punct(":") {
                    field.constraint = Some(self.parse_exp()?);
                } else if self.eat_kw("if") {
                    field.optcond = Some(self.parse_exp()?);
                } else {
                    break;
                }
            }
            self.expect_punct(";")?;
            fields.push(field);
        }
        Ok(self.node(
            NodeKind::TypeStruct {
                fields,
                methods,
                pinned,
                union_,
            },
            loc,
        ))
    }

    // -- expressions -------------------------------------------------------

    fn parse_exp(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();
        let cond = self.parse_binary(0)?;
        if self.eat_punct("?") {
            let then_e = self.parse_exp()?;
            self.expect_punct(":")?;
            let else_e = self.parse_exp()?;
            return Ok(self.node(
                NodeKind::Ternary {
                    cond: Box::new(cond),
                    then_e: Box::new(then_e),
                    else_e: Box::new(else_e),
                },
                loc,
            ));
        }
        Ok(cond)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Node, CompileError> {
        let loc = self.loc();
        let mut lhs = self.parse_unary()?;
        loop {
            let (op, prec) = match self.cur().kind {
                TokKind::Punct(p) => match binop_of(p) {
                    Some(x) => x,
                    None => break,
                },
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            self.bump();
            let rhs = self.parse_binary(prec + 1)?;
            lhs = self.node(
                NodeKind::Binary {
                    op,
                    left: Box::new(lhs),
                    right: Box::new(rhs),
                },
                loc,
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();
        let op = if self.eat_punct("-") {
            Some(UnOp::Neg)
        } else if self.eat_punct("+") {
            Some(UnOp::Pos)
        } else if self.eat_punct("~") {
            Some(UnOp::BNot)
        } else if self.eat_punct("!") {
            Some(UnOp::Not)
        } else {
            None
        };
        if let Some(op) = op {
            let operand = self.parse_unary()?;
            return Ok(self.node(
                NodeKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Node, CompileError> {
        let mut e = self.parse_primary()?;
        loop {
            let loc = self.loc();
            if self.eat_punct(".") {
                let field = self.expect_ident()?;
                e = self.node(
                    NodeKind::StructRef {
                        base: Box::new(e),
                        field,
                    },
                    loc,
                );
            } else if self.at_punct("[") && !e.is_type() {
                self.bump();
                let from = self.parse_exp()?;
                if self.eat_punct(":") {
                    let to = self.parse_exp()?;
                    self.expect_punct("]")?;
                    e = self.node(
                        NodeKind::Trimmer {
                            entity: Box::new(e),
                            from: Box::new(from),
                            to: Box::new(to),
                        },
                        loc,
                    );
                } else {
                    self.expect_punct("]")?;
                    e = self.node(
                        NodeKind::Indexer {
                            entity: Box::new(e),
                            index: Box::new(from),
                        },
                        loc,
                    );
                }
            } else if self.at_punct("(") && !e.is_type() {
                self.bump();
                let mut args = Vec::new();
                if !self.eat_punct(")") {
                    loop {
                        args.push(self.parse_exp()?);
                        if self.eat_punct(")") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                e = self.node(
                    NodeKind::Funcall {
                        func: Box::new(e),
                        args,
                    },
                    loc,
                );
            } else if self.eat_punct("#") {
                let unit = self.parse_unit()?;
                e = self.node(
                    NodeKind::OffsetLit {
                        magnitude: Box::new(e),
                        unit,
                    },
                    loc,
                );
            } else if self.at_kw("as") {
                self.bump();
                let ty = self.parse_type()?;
                e = self.node(
                    NodeKind::Cast {
                        ty: Box::new(ty),
                        exp: Box::new(e),
                    },
                    loc,
                );
            } else if self.at_kw("isa") {
                self.bump();
                let ty = self.parse_type()?;
                e = self.node(
                    NodeKind::Isa {
                        ty: Box::new(ty),
                        exp: Box::new(e),
                    },
                    loc,
                );
            } else {
                return Ok(e);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();

        if self.at_type_start() {
            return self.parse_type_construct(loc);
        }

        match self.cur().kind.clone() {
            TokKind::Int {
                value,
                size,
                signed,
            } => {
                self.bump();
                Ok(Node::int_lit(&self.ctx, value, size, signed, loc))
            }
            TokKind::Str(s) => {
                self.bump();
                let mut n = self.node(NodeKind::Str(s), loc);
                n.literal = true;
                Ok(n)
            }
            TokKind::Alien(text) => {
                self.bump();
                let resolve = self
                    .alien
                    .ok_or_else(|| CompileError::parse(loc, "no alien token handler"))?;
                match resolve(&text) {
                    Some(AlienLit::Int {
                        value,
                        size,
                        signed,
                    }) => Ok(Node::int_lit(&self.ctx, value, size, signed, loc)),
                    Some(AlienLit::Str(s)) => {
                        let mut n = self.node(NodeKind::Str(s), loc);
                        n.literal = true;
                        Ok(n)
                    }
                    None => Err(CompileError::parse(
                        loc,
                        format!("alien token '{}' not recognised", text),
                    )),
                }
            }
            TokKind::Punct("(") => {
                self.bump();
                let e = self.parse_exp()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            TokKind::Punct("[") => {
                self.bump();
                let mut inits = Vec::new();
                if !self.eat_punct("]") {
                    loop {
                        inits.push(self.parse_exp()?);
                        if self.eat_punct("]") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(self.node(NodeKind::ArrayLit(inits), loc))
            }
            TokKind::Ident(name) => {
                if name == "lambda" {
                    self.bump();
                    let f = self.parse_func_tail(loc)?;
                    return Ok(self.node(NodeKind::Lambda(Box::new(f)), loc));
                }
                if name == "format" {
                    self.bump();
                    self.expect_punct("(")?;
                    let fmt = match &self.cur().kind {
                        TokKind::Str(s) => {
                            let s = s.clone();
                            self.bump();
                            s
                        }
                        _ => {
                            return Err(CompileError::parse(
                                self.loc(),
                                "format needs a format string",
                            ))
                        }
                    };
                    let mut args = Vec::new();
                    while self.eat_punct(",") {
                        args.push(self.parse_exp()?);
                    }
                    self.expect_punct(")")?;
                    let parts = build_format(&fmt, args, loc)?;
                    return Ok(self.node(NodeKind::FormatExp(parts), loc));
                }
                self.bump();
                match self.env.lookup(&name) {
                    Some((back, over, _)) => {
                        Ok(self.node(NodeKind::Var { name, back, over }, loc))
                    }
                    None => Err(CompileError::parse(
                        loc,
                        format!("undeclared identifier '{}'", name),
                    )),
                }
            }
            _ => Err(CompileError::parse(loc, "expected an expression")),
        }
    }

    /// A construct introduced by a type: a map `T @ off`, an array
    /// constructor `T[n] { ... }`, or a struct constructor `T { ... }`.
    fn parse_type_construct(&mut self, loc: Loc) -> Result<Node, CompileError> {
        let ty = self.parse_type()?;

        if self.eat_punct("@") {
            let first = self.parse_binary(PREC_ADD)?;
            // `T @ ios : off` names the space explicitly.
            if self.eat_punct(":") {
                let off = self.parse_binary(PREC_ADD)?;
                return Ok(self.node(
                    NodeKind::MapExp {
                        strict: true,
                        ty: Box::new(ty),
                        ios: Some(Box::new(first)),
                        offset: Box::new(off),
                    },
                    loc,
                ));
            }
            return Ok(self.node(
                NodeKind::MapExp {
                    strict: true,
                    ty: Box::new(ty),
                    ios: None,
                    offset: Box::new(first),
                },
                loc,
            ));
        }

        if self.at_punct("{") {
            self.bump();
            if matches!(ty.kind, NodeKind::TypeArray { .. }) {
                let mut inits = Vec::new();
                if !self.eat_punct("}") {
                    loop {
                        inits.push(self.parse_exp()?);
                        if self.eat_punct("}") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                return Ok(self.node(
                    NodeKind::ArrayCons {
                        ty: Box::new(ty),
                        inits,
                    },
                    loc,
                ));
            }
            let mut fields = Vec::new();
            if !self.eat_punct("}") {
                loop {
                    let name = self.expect_ident()?;
                    self.expect_punct("=")?;
                    let v = self.parse_exp()?;
                    fields.push((name, v));
                    if self.eat_punct("}") {
                        break;
                    }
                    self.expect_punct(",")?;
                }
            }
            return Ok(self.node(
                NodeKind::StructCons {
                    ty: Box::new(ty),
                    fields,
                },
                loc,
            ));
        }

        // A bare type is only useful as an operand of as/isa handled by
        // the callers; let it through for them.
        Ok(ty)
    }
}

/// Additive precedence, used for map offsets and field labels where a
/// following `:` must stay available to the surrounding construct.
const PREC_ADD: u8 = 8;

fn binop_of(p: &str) -> Option<(BinOp, u8)> {
    Some(match p {
        "||" => (BinOp::Or, 1),
        "&&" => (BinOp::And, 2),
        "|" => (BinOp::BOr, 3),
        "^" => (BinOp::BXor, 4),
        "&" => (BinOp::BAnd, 5),
        "==" => (BinOp::Eq, 6),
        "!=" => (BinOp::Ne, 6),
        "<" => (BinOp::Lt, 6),
        "<=" => (BinOp::Le, 6),
        ">" => (BinOp::Gt, 6),
        ">=" => (BinOp::Ge, 6),
        ":::" => (BinOp::BConc, 7),
        "<<" => (BinOp::Shl, 7),
        ">>" => (BinOp::Shr, 7),
        "+" => (BinOp::Add, PREC_ADD),
        "-" => (BinOp::Sub, PREC_ADD),
        "*" => (BinOp::Mul, 9),
        "/" => (BinOp::Div, 9),
        "/^" => (BinOp::CeilDiv, 9),
        "%" => (BinOp::Mod, 9),
        "**" => (BinOp::Pow, 10),
        _ => return None,
    })
}

fn unit_bits(name: &str) -> Option<u64> {
    Some(match name {
        "b" => 1,
        "N" => 4,
        "B" => 8,
        "Kb" => 1024,
        "KB" => 8192,
        "Mb" => 1024 * 1024,
        "MB" => 8 * 1024 * 1024,
        "Gb" => 1024 * 1024 * 1024,
        "GB" => 8 * 1024 * 1024 * 1024,
        "kb" => 1000,
        "kB" => 8000,
        "mb" => 1000 * 1000,
        "mB" => 8 * 1000 * 1000,
        "gb" => 1000 * 1000 * 1000,
        "gB" => 8 * 1000 * 1000 * 1000,
        _ => return None,
    })
}

/// Split a printf/format template into literal and argument parts.
/// Directives: `%v` (any value), `%s` (string), `%d`/`%u`/`%i` (rendered
/// like `%v`), `%%`.
fn build_format(
    fmt: &str,
    args: Vec<Node>,
    loc: Loc,
) -> Result<Vec<FormatPart>, CompileError> {
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut args = args.into_iter();
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            lit.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => lit.push('%'),
            Some(d @ ('v' | 's' | 'd' | 'u' | 'i')) => {
                if !lit.is_empty() {
                    parts.push(FormatPart::Lit(std::mem::take(&mut lit)));
                }
                let arg = args.next().ok_or_else(|| {
                    CompileError::parse(loc, "not enough arguments for the format string")
                })?;
                parts.push(if d == 's' {
                    FormatPart::Str(arg)
                } else {
                    FormatPart::Val(arg)
                });
            }
            _ => return Err(CompileError::parse(loc, "bad format directive")),
        }
    }
    if !lit.is_empty() {
        parts.push(FormatPart::Lit(lit));
    }
    if args.next().is_some() {
        return Err(CompileError::parse(
            loc,
            "too many arguments for the format string",
        ));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str, start: StartSymbol) -> Node {
        let ctx = AstCtx::new();
        let mut env = CEnv::new();
        parse(src, &ctx, &mut env, start, false, None).expect("must parse")
    }

    fn parse_exp_with_env(src: &str, env: &mut CEnv) -> Result<Node, CompileError> {
        let ctx = AstCtx::new();
        parse(src, &ctx, env, StartSymbol::Expression, false, None)
    }

    #[test]
    fn test_arithmetic_precedence() {
        let e = parse_ok("2 + 3 * 4", StartSymbol::Expression);
        match e.kind {
            NodeKind::Binary {
                op: BinOp::Add,
                right,
                ..
            } => {
                assert!(matches!(
                    right.kind,
                    NodeKind::Binary { op: BinOp::Mul, .. }
                ));
            }
            other => panic!("expected an addition at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_offset_literal() {
        let e = parse_ok("8#B + 4#b", StartSymbol::Expression);
        match e.kind {
            NodeKind::Binary { left, right, .. } => {
                assert!(matches!(
                    left.kind,
                    NodeKind::OffsetLit { unit: 8, .. }
                ));
                assert!(matches!(
                    right.kind,
                    NodeKind::OffsetLit { unit: 1, .. }
                ));
            }
            other => panic!("expected offset addition, got {:?}", other),
        }
    }

    #[test]
    fn test_array_constructor() {
        let e = parse_ok("int<8>[3] { 1, 2, 3 }", StartSymbol::Expression);
        match e.kind {
            NodeKind::ArrayCons { ty, inits } => {
                assert_eq!(inits.len(), 3);
                assert!(matches!(ty.kind, NodeKind::TypeArray { .. }));
            }
            other => panic!("expected an array constructor, got {:?}", other),
        }
    }

    #[test]
    fn test_undeclared_variable_is_an_error() {
        let mut env = CEnv::new();
        assert!(parse_exp_with_env("nope + 1", &mut env).is_err());
    }

    #[test]
    fn test_declared_variable_binds_coordinates() {
        let mut env = CEnv::new();
        env.register(Decl {
            name: "a".to_string(),
            kind: DeclKind::Var,
            ty: None,
        });
        let e = parse_exp_with_env("a", &mut env).unwrap();
        assert!(matches!(
            e.kind,
            NodeKind::Var { back: 0, over: 0, .. }
        ));
    }

    #[test]
    fn test_bconc_assignment_statement() {
        let s = parse_ok(
            "{ var a = 0UB; var b = 0UB; a:::b = 0x1234UH; }",
            StartSymbol::Statement,
        );
        match s.kind {
            NodeKind::CompStmt(stmts) => {
                assert_eq!(stmts.len(), 3);
                match &stmts[2].kind {
                    NodeKind::AssStmt { lvalue, .. } => {
                        assert!(matches!(
                            lvalue.kind,
                            NodeKind::Binary {
                                op: BinOp::BConc,
                                ..
                            }
                        ));
                    }
                    other => panic!("expected an assignment, got {:?}", other),
                }
            }
            other => panic!("expected a block, got {:?}", other),
        }
    }

    #[test]
    fn test_struct_type_with_constraint_and_label() {
        let s = parse_ok(
            "type Hdr = struct { uint<8> a; uint<16> b @ 8#b : b > 0; };",
            StartSymbol::Declaration,
        );
        match s.kind {
            NodeKind::Decl { kind, init, .. } => {
                assert_eq!(kind, DeclKind::Type);
                match &init.kind {
                    NodeKind::TypeStruct { fields, .. } => {
                        assert_eq!(fields.len(), 2);
                        assert!(fields[1].label.is_some());
                        assert!(fields[1].constraint.is_some());
                    }
                    other => panic!("expected a struct type, got {:?}", other),
                }
            }
            other => panic!("expected a type declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_function_declaration_and_call() {
        let p = parse_ok(
            "fun add1 = (int<32> x) int<32>: { return x + 1; } var r = add1(5);",
            StartSymbol::Program,
        );
        match p.kind {
            NodeKind::Program(stmts) => {
                assert_eq!(stmts.len(), 2);
                assert!(matches!(
                    stmts[0].kind,
                    NodeKind::Decl {
                        kind: DeclKind::Fun,
                        ..
                    }
                ));
            }
            other => panic!("expected a program, got {:?}", other),
        }
    }

    #[test]
    fn test_map_expression() {
        let mut env = CEnv::new();
        let e = parse_exp_with_env("uint<8>[2] @ 4#B", &mut env).unwrap();
        match e.kind {
            NodeKind::MapExp { ty, ios, .. } => {
                assert!(ios.is_none());
                assert!(matches!(ty.kind, NodeKind::TypeArray { .. }));
            }
            other => panic!("expected a map, got {:?}", other),
        }
    }

    #[test]
    fn test_try_catch_if() {
        let s = parse_ok(
            "try raise 1; catch if e.code == 42 { ; } else { ; }",
            StartSymbol::Statement,
        );
        match s.kind {
            NodeKind::TryStmt {
                cond, else_handler, ..
            } => {
                assert!(cond.is_some());
                assert!(else_handler.is_some());
            }
            other => panic!("expected try/catch, got {:?}", other),
        }
    }

    #[test]
    fn test_format_parts() {
        let parts = build_format(
            "a %v b %% %s",
            vec![
                Node::int_lit(&AstCtx::new(), 1, 32, true, Loc::default()),
                Node::int_lit(&AstCtx::new(), 2, 32, true, Loc::default()),
            ],
            Loc::default(),
        )
        .unwrap();
        assert_eq!(parts.len(), 4);
        assert!(matches!(parts[0], FormatPart::Lit(_)));
        assert!(matches!(parts[1], FormatPart::Val(_)));
        assert!(matches!(parts[3], FormatPart::Str(_)));
    }

    #[test]
    fn test_alien_tokens_splice_literals() {
        let ctx = AstCtx::new();
        let mut env = CEnv::new();
        let resolver = |text: &str| {
            if text == "mem" {
                Some(AlienLit::Int {
                    value: 3,
                    size: 32,
                    signed: true,
                })
            } else {
                None
            }
        };
        let e = parse(
            "$<mem> + 1",
            &ctx,
            &mut env,
            StartSymbol::Expression,
            true,
            Some(&resolver),
        )
        .unwrap();
        assert!(matches!(e.kind, NodeKind::Binary { .. }));

        let err = parse(
            "$<other>",
            &ctx,
            &mut env,
            StartSymbol::Expression,
            true,
            Some(&resolver),
        );
        assert!(err.is_err());
    }
}
