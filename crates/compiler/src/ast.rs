//! Abstract syntax tree
//!
//! Nodes are uniquely owned. Every node carries a stable uid (issued by
//! the shared [`AstCtx`]), its source location, an optional attached type
//! (filled in by the typify pass) and a literal flag (maintained by the
//! fold pass). Variable and named-type references hold `(back, over)`
//! coordinates bound at parse time instead of pointers into the
//! declaration tree.

use std::cell::Cell;
use std::rc::Rc;

use jab_core::bits::Endian;

/// Shared context issuing node uids.
#[derive(Debug, Default)]
pub struct AstCtx {
    next_uid: Cell<u32>,
}

impl AstCtx {
    pub fn new() -> Rc<Self> {
        Rc::new(AstCtx::default())
    }

    pub fn uid(&self) -> u32 {
        let u = self.next_uid.get();
        self.next_uid.set(u + 1);
        u
    }
}

/// Source position, 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Loc {
    pub line: u32,
    pub col: u32,
}

impl std::fmt::Display for Loc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    CeilDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    BConc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Pos,
    BNot,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Type,
    Fun,
}

/// One field of a struct type spec.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub ty: Node,
    pub constraint: Option<Node>,
    pub init: Option<Node>,
    pub label: Option<Node>,
    pub optcond: Option<Node>,
    pub endian: Option<Endian>,
    pub loc: Loc,
}

/// A method of a struct type spec. Methods take no explicit arguments;
/// the value itself and its fields are in scope in the body.
#[derive(Debug, Clone)]
pub struct MethodDecl {
    pub name: String,
    pub ret: Box<Node>,
    pub body: Box<Node>,
    pub loc: Loc,
}

/// Formal argument of a function.
#[derive(Debug, Clone)]
pub struct FuncArg {
    pub name: String,
    pub ty: Node,
}

/// One piece of a format/print template.
#[derive(Debug, Clone)]
pub enum FormatPart {
    Lit(String),
    /// `%v`/`%d`/`%u` - render through the printer.
    Val(Node),
    /// `%s` - the value must be a string.
    Str(Node),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub uid: u32,
    pub loc: Loc,
    /// Attached type, filled by typify for expression nodes.
    pub ty: Option<Box<Node>>,
    /// Known constant, maintained by fold.
    pub literal: bool,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Program(Vec<Node>),

    // Literals.
    Int {
        value: i64,
        size: u32,
        signed: bool,
    },
    Str(String),
    OffsetLit {
        magnitude: Box<Node>,
        unit: u64,
    },

    // Types.
    TypeIntegral {
        size: u32,
        signed: bool,
    },
    TypeString,
    TypeVoid,
    TypeAny,
    /// Reference to a `type` declaration, bound at parse time.
    TypeNamed {
        name: String,
        back: u32,
        over: u32,
    },
    TypeArray {
        elem: Box<Node>,
        bound: Option<Box<Node>>,
    },
    TypeOffset {
        base: Box<Node>,
        unit: u64,
    },
    TypeStruct {
        fields: Vec<FieldDecl>,
        methods: Vec<MethodDecl>,
        pinned: bool,
        union_: bool,
    },
    TypeFunction {
        ret: Box<Node>,
        args: Vec<Node>,
    },

    // Expressions.
    Unary {
        op: UnOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Ternary {
        cond: Box<Node>,
        then_e: Box<Node>,
        else_e: Box<Node>,
    },
    Var {
        name: String,
        back: u32,
        over: u32,
    },
    Funcall {
        func: Box<Node>,
        args: Vec<Node>,
    },
    StructRef {
        base: Box<Node>,
        field: String,
    },
    Indexer {
        entity: Box<Node>,
        index: Box<Node>,
    },
    Trimmer {
        entity: Box<Node>,
        from: Box<Node>,
        to: Box<Node>,
    },
    Cast {
        ty: Box<Node>,
        exp: Box<Node>,
    },
    Isa {
        ty: Box<Node>,
        exp: Box<Node>,
    },
    MapExp {
        strict: bool,
        ty: Box<Node>,
        ios: Option<Box<Node>>,
        offset: Box<Node>,
    },
    /// `[a, b, c]`
    ArrayLit(Vec<Node>),
    /// `int<8>[3] { 1, 2, 3 }`
    ArrayCons {
        ty: Box<Node>,
        inits: Vec<Node>,
    },
    /// `Foo { a = 1 }`
    StructCons {
        ty: Box<Node>,
        fields: Vec<(String, Node)>,
    },
    Lambda(Box<Node>),
    Func {
        ret: Box<Node>,
        args: Vec<FuncArg>,
        body: Box<Node>,
    },
    FormatExp(Vec<FormatPart>),

    // Statements.
    CompStmt(Vec<Node>),
    Decl {
        kind: DeclKind,
        name: String,
        init: Box<Node>,
    },
    AssStmt {
        lvalue: Box<Node>,
        exp: Box<Node>,
    },
    IfStmt {
        cond: Box<Node>,
        then_s: Box<Node>,
        else_s: Option<Box<Node>>,
    },
    WhileStmt {
        cond: Box<Node>,
        body: Box<Node>,
    },
    ForInStmt {
        var: String,
        container: Box<Node>,
        body: Box<Node>,
    },
    ReturnStmt(Option<Box<Node>>),
    BreakStmt,
    ContinueStmt,
    NullStmt,
    ExpStmt(Box<Node>),
    TryStmt {
        body: Box<Node>,
        /// Name the exception is bound to in the handler.
        arg: String,
        /// `catch if` condition, if any.
        cond: Option<Box<Node>>,
        handler: Box<Node>,
        else_handler: Option<Box<Node>>,
    },
    RaiseStmt(Option<Box<Node>>),
    PrintStmt {
        printf: bool,
        parts: Vec<FormatPart>,
    },
    AsmStmt(String),
    /// `v++;` / `v--;`
    IncrDecr {
        exp: Box<Node>,
        incr: bool,
    },
}

impl Node {
    pub fn new(ctx: &AstCtx, kind: NodeKind, loc: Loc) -> Node {
        Node {
            uid: ctx.uid(),
            loc,
            ty: None,
            literal: false,
            kind,
        }
    }

    pub fn int_lit(ctx: &AstCtx, value: i64, size: u32, signed: bool, loc: Loc) -> Node {
        let mut n = Node::new(ctx, NodeKind::Int { value, size, signed }, loc);
        n.literal = true;
        n
    }

    /// The attached type, after typify.
    pub fn type_node(&self) -> Option<&Node> {
        self.ty.as_deref()
    }

    pub fn is_type(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::TypeIntegral { .. }
                | NodeKind::TypeString
                | NodeKind::TypeVoid
                | NodeKind::TypeAny
                | NodeKind::TypeNamed { .. }
                | NodeKind::TypeArray { .. }
                | NodeKind::TypeOffset { .. }
                | NodeKind::TypeStruct { .. }
                | NodeKind::TypeFunction { .. }
        )
    }

    /// Number of nodes in a statement list (programs and compounds).
    pub fn chain_length(&self) -> usize {
        match &self.kind {
            NodeKind::Program(stmts) | NodeKind::CompStmt(stmts) => stmts.len(),
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Type predicates and algebra
//
// These operate on *resolved* type nodes: named references must have been
// substituted by their definitions (the typify pass does this before
// calling in here).

/// Structural type equality. Two struct types are compared by their
/// resolved spelling; anonymity is handled at the typify level, where
/// named struct types keep their declaration identity.
pub fn type_equal_p(a: &Node, b: &Node) -> bool {
    match (&a.kind, &b.kind) {
        (
            NodeKind::TypeIntegral { size: s1, signed: g1 },
            NodeKind::TypeIntegral { size: s2, signed: g2 },
        ) => s1 == s2 && g1 == g2,
        (NodeKind::TypeString, NodeKind::TypeString) => true,
        (NodeKind::TypeVoid, NodeKind::TypeVoid) => true,
        (NodeKind::TypeAny, NodeKind::TypeAny) => true,
        (
            NodeKind::TypeNamed { name: n1, .. },
            NodeKind::TypeNamed { name: n2, .. },
        ) => n1 == n2,
        (
            NodeKind::TypeArray { elem: e1, bound: b1 },
            NodeKind::TypeArray { elem: e2, bound: b2 },
        ) => {
            type_equal_p(e1, e2)
                && match (b1, b2) {
                    (None, None) => true,
                    (Some(x), Some(y)) => match (literal_int(x), literal_int(y)) {
                        (Some(i), Some(j)) => i == j,
                        _ => false,
                    },
                    _ => false,
                }
        }
        (
            NodeKind::TypeOffset { base: t1, unit: u1 },
            NodeKind::TypeOffset { base: t2, unit: u2 },
        ) => u1 == u2 && type_equal_p(t1, t2),
        (NodeKind::TypeFunction { ret: r1, args: a1 }, NodeKind::TypeFunction { ret: r2, args: a2 }) => {
            type_equal_p(r1, r2)
                && a1.len() == a2.len()
                && a1.iter().zip(a2).all(|(x, y)| type_equal_p(x, y))
        }
        // Anonymous struct types never compare equal; named ones go
        // through TypeNamed above.
        (NodeKind::TypeStruct { .. }, NodeKind::TypeStruct { .. }) => false,
        _ => false,
    }
}

/// Whether a value of `from` can be used where `to` is expected, possibly
/// through an implicit conversion.
pub fn type_promoteable_p(from: &Node, to: &Node, promote_array_of_any: bool) -> bool {
    if type_equal_p(from, to) {
        return true;
    }
    match (&from.kind, &to.kind) {
        (_, NodeKind::TypeAny) => true,
        (NodeKind::TypeIntegral { .. }, NodeKind::TypeIntegral { .. }) => true,
        (NodeKind::TypeOffset { .. }, NodeKind::TypeOffset { .. }) => true,
        (
            NodeKind::TypeArray { elem: e1, bound: b1 },
            NodeKind::TypeArray { elem: e2, bound: b2 },
        ) => {
            if promote_array_of_any && matches!(e2.kind, NodeKind::TypeAny) {
                return true;
            }
            if !type_equal_p(e1, e2) {
                return false;
            }
            match (b1, b2) {
                // Dropping the bound is always allowed.
                (_, None) => true,
                (Some(x), Some(y)) => match (literal_int(x), literal_int(y)) {
                    (Some(i), Some(j)) => i == j,
                    // Non-literal bounds are checked at runtime.
                    _ => true,
                },
                (None, Some(_)) => true,
            }
        }
        _ => false,
    }
}

/// Promoted type of a binary integral operation: widest size, signed only
/// when both operands are.
pub fn type_integral_promote(a: &Node, b: &Node) -> Option<(u32, bool)> {
    match (&a.kind, &b.kind) {
        (
            NodeKind::TypeIntegral { size: s1, signed: g1 },
            NodeKind::TypeIntegral { size: s2, signed: g2 },
        ) => Some(((*s1).max(*s2), *g1 && *g2)),
        _ => None,
    }
}

pub fn type_integrable_p(t: &Node) -> bool {
    matches!(t.kind, NodeKind::TypeIntegral { .. })
}

/// Types whose values can back an IO space.
pub fn type_mappable_p(t: &Node) -> bool {
    matches!(
        t.kind,
        NodeKind::TypeIntegral { .. }
            | NodeKind::TypeString
            | NodeKind::TypeOffset { .. }
            | NodeKind::TypeArray { .. }
            | NodeKind::TypeStruct { .. }
            | NodeKind::TypeNamed { .. }
    )
}

/// Whether evaluating a value of this type can raise: constrained or
/// optional fields, unions, `any`, or containers of such.
pub fn type_is_fallible(t: &Node) -> bool {
    match &t.kind {
        NodeKind::TypeAny => true,
        NodeKind::TypeArray { elem, .. } => type_is_fallible(elem),
        NodeKind::TypeStruct {
            fields, union_, ..
        } => {
            *union_
                || fields.iter().any(|f| {
                    f.constraint.is_some() || f.optcond.is_some() || type_is_fallible(&f.ty)
                })
        }
        _ => false,
    }
}

/// Bit size of a complete type; `None` when the size is not knowable at
/// compile time.
pub fn sizeof_type(t: &Node) -> Option<u64> {
    match &t.kind {
        NodeKind::TypeIntegral { size, .. } => Some(*size as u64),
        NodeKind::TypeVoid => Some(0),
        NodeKind::TypeFunction { .. } => Some(0),
        NodeKind::TypeOffset { base, .. } => sizeof_type(base),
        NodeKind::TypeArray { elem, bound } => {
            let b = bound.as_deref()?;
            let n = match &b.kind {
                NodeKind::Int { value, .. } => *value as u64,
                NodeKind::OffsetLit { magnitude, unit } => {
                    let m = literal_int(magnitude)?;
                    return Some(m as u64 * unit);
                }
                _ => return None,
            };
            Some(n * sizeof_type(elem)?)
        }
        NodeKind::TypeStruct {
            fields,
            pinned,
            union_,
            ..
        } => {
            let mut size: u64 = 0;
            for f in fields {
                if f.optcond.is_some() {
                    return None;
                }
                let fsize = sizeof_type(&f.ty)?;
                if *union_ {
                    // Complete unions have equal-size alternatives.
                    size = size.max(fsize);
                } else if *pinned {
                    size = size.max(fsize);
                } else if let Some(l) = &f.label {
                    let bits = label_bits(l)?;
                    size = size.max(bits + fsize);
                } else {
                    size += fsize;
                }
            }
            Some(size)
        }
        _ => None,
    }
}

fn label_bits(l: &Node) -> Option<u64> {
    match &l.kind {
        NodeKind::Int { value, .. } => Some(*value as u64),
        NodeKind::OffsetLit { magnitude, unit } => {
            Some(literal_int(magnitude)? as u64 * unit)
        }
        _ => None,
    }
}

/// Whether the type's size is knowable at compile time.
pub fn type_is_complete(t: &Node) -> bool {
    sizeof_type(t).is_some()
}

/// Whether the type is the distinguished `Exception` struct type.
pub fn type_is_exception(t: &Node) -> bool {
    matches!(&t.kind, NodeKind::TypeNamed { name, .. } if name == "Exception")
}

/// Step for `++`/`--`: one for integrals, one unit for offsets.
pub fn type_incr_step(ctx: &AstCtx, t: &Node) -> Option<Node> {
    match &t.kind {
        NodeKind::TypeIntegral { size, signed } => {
            Some(Node::int_lit(ctx, 1, *size, *signed, t.loc))
        }
        NodeKind::TypeOffset { base, unit } => {
            let mag = match &base.kind {
                NodeKind::TypeIntegral { size, signed } => {
                    Node::int_lit(ctx, 1, *size, *signed, t.loc)
                }
                _ => return None,
            };
            let mut n = Node::new(
                ctx,
                NodeKind::OffsetLit {
                    magnitude: Box::new(mag),
                    unit: *unit,
                },
                t.loc,
            );
            n.literal = true;
            Some(n)
        }
        _ => None,
    }
}

/// Drop array bounds, recursively. Used when promoting to unbounded
/// array types.
pub fn array_type_remove_bounders(t: &mut Node) {
    if let NodeKind::TypeArray { elem, bound } = &mut t.kind {
        *bound = None;
        array_type_remove_bounders(elem);
    }
}

/// Whether a node can appear on the left of an assignment: variables,
/// map expressions, field references of lvalues, indexers of lvalues,
/// and bit-concatenations of two lvalues.
pub fn lvalue_p(n: &Node) -> bool {
    match &n.kind {
        NodeKind::Var { .. } => true,
        NodeKind::MapExp { .. } => true,
        NodeKind::StructRef { base, .. } => lvalue_p(base),
        NodeKind::Indexer { entity, .. } => lvalue_p(entity),
        NodeKind::Binary {
            op: BinOp::BConc,
            left,
            right,
        } => lvalue_p(left) && lvalue_p(right),
        _ => false,
    }
}

/// Literal integer value of a node, if it is one.
pub fn literal_int(n: &Node) -> Option<i64> {
    match &n.kind {
        NodeKind::Int { value, .. } => Some(*value),
        _ => None,
    }
}

/// The type of the field reached by a dotted path through struct types,
/// e.g. `a.b.c`.
pub fn struct_type_traverse<'a>(mut t: &'a Node, path: &str) -> Option<&'a Node> {
    for part in path.split('.') {
        t = get_struct_type_field(t, part)?;
    }
    Some(t)
}

/// The type of a named field of a struct type.
pub fn get_struct_type_field<'a>(t: &'a Node, name: &str) -> Option<&'a Node> {
    match &t.kind {
        NodeKind::TypeStruct { fields, .. } => {
            fields.iter().find(|f| f.name == name).map(|f| &f.ty)
        }
        _ => None,
    }
}

/// A named method of a struct type.
pub fn get_struct_type_method<'a>(t: &'a Node, name: &str) -> Option<&'a MethodDecl> {
    match &t.kind {
        NodeKind::TypeStruct { methods, .. } => methods.iter().find(|m| m.name == name),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Rc<AstCtx> {
        AstCtx::new()
    }

    fn ity(ctx: &AstCtx, size: u32, signed: bool) -> Node {
        Node::new(ctx, NodeKind::TypeIntegral { size, signed }, Loc::default())
    }

    #[test]
    fn test_uids_are_stable_and_unique() {
        let c = ctx();
        let a = Node::int_lit(&c, 1, 32, true, Loc::default());
        let b = Node::int_lit(&c, 1, 32, true, Loc::default());
        assert_ne!(a.uid, b.uid);
    }

    #[test]
    fn test_integral_promotion() {
        let c = ctx();
        let i8 = ity(&c, 8, true);
        let u16 = ity(&c, 16, false);
        assert_eq!(type_integral_promote(&i8, &u16), Some((16, false)));
        assert_eq!(type_integral_promote(&i8, &i8), Some((8, true)));
    }

    #[test]
    fn test_array_bounds_in_equality() {
        let c = ctx();
        let mk = |bound: Option<i64>| {
            Node::new(
                &c,
                NodeKind::TypeArray {
                    elem: Box::new(ity(&c, 8, false)),
                    bound: bound
                        .map(|v| Box::new(Node::int_lit(&c, v, 32, true, Loc::default()))),
                },
                Loc::default(),
            )
        };
        assert!(type_equal_p(&mk(Some(3)), &mk(Some(3))));
        assert!(!type_equal_p(&mk(Some(3)), &mk(Some(4))));
        assert!(!type_equal_p(&mk(Some(3)), &mk(None)));
        // Promotion may drop a bound but not change it.
        assert!(type_promoteable_p(&mk(Some(3)), &mk(None), false));
        assert!(!type_promoteable_p(&mk(Some(3)), &mk(Some(4)), false));
    }

    #[test]
    fn test_sizeof_struct() {
        let c = ctx();
        let field = |name: &str, size: u32| FieldDecl {
            name: name.to_string(),
            ty: ity(&c, size, false),
            constraint: None,
            init: None,
            label: None,
            optcond: None,
            endian: None,
            loc: Loc::default(),
        };
        let plain = Node::new(
            &c,
            NodeKind::TypeStruct {
                fields: vec![field("a", 8), field("b", 16)],
                methods: Vec::new(),
                pinned: false,
                union_: false,
            },
            Loc::default(),
        );
        assert_eq!(sizeof_type(&plain), Some(24));

        let pinned = Node::new(
            &c,
            NodeKind::TypeStruct {
                fields: vec![field("a", 8), field("b", 16)],
                methods: Vec::new(),
                pinned: true,
                union_: false,
            },
            Loc::default(),
        );
        assert_eq!(sizeof_type(&pinned), Some(16));
    }

    #[test]
    fn test_fallibility() {
        let c = ctx();
        let plain = ity(&c, 8, false);
        assert!(!type_is_fallible(&plain));

        let constrained = Node::new(
            &c,
            NodeKind::TypeStruct {
                fields: vec![FieldDecl {
                    name: "a".to_string(),
                    ty: ity(&c, 8, false),
                    constraint: Some(Node::int_lit(&c, 1, 32, true, Loc::default())),
                    init: None,
                    label: None,
                    optcond: None,
                    endian: None,
                    loc: Loc::default(),
                }],
                methods: Vec::new(),
                pinned: false,
                union_: false,
            },
            Loc::default(),
        );
        assert!(type_is_fallible(&constrained));
    }

    #[test]
    fn test_struct_type_traversal() {
        let c = ctx();
        let inner = Node::new(
            &c,
            NodeKind::TypeStruct {
                fields: vec![FieldDecl {
                    name: "x".to_string(),
                    ty: ity(&c, 16, true),
                    constraint: None,
                    init: None,
                    label: None,
                    optcond: None,
                    endian: None,
                    loc: Loc::default(),
                }],
                methods: Vec::new(),
                pinned: false,
                union_: false,
            },
            Loc::default(),
        );
        let outer = Node::new(
            &c,
            NodeKind::TypeStruct {
                fields: vec![FieldDecl {
                    name: "a".to_string(),
                    ty: inner,
                    constraint: None,
                    init: None,
                    label: None,
                    optcond: None,
                    endian: None,
                    loc: Loc::default(),
                }],
                methods: vec![MethodDecl {
                    name: "m".to_string(),
                    ret: Box::new(Node::new(&c, NodeKind::TypeVoid, Loc::default())),
                    body: Box::new(Node::new(&c, NodeKind::CompStmt(Vec::new()), Loc::default())),
                    loc: Loc::default(),
                }],
                pinned: false,
                union_: false,
            },
            Loc::default(),
        );
        let x = struct_type_traverse(&outer, "a.x").unwrap();
        assert!(matches!(x.kind, NodeKind::TypeIntegral { size: 16, .. }));
        assert!(struct_type_traverse(&outer, "a.y").is_none());
        assert_eq!(get_struct_type_method(&outer, "m").unwrap().name, "m");
    }

    #[test]
    fn test_completeness_and_chains() {
        let c = ctx();
        let bounded = Node::new(
            &c,
            NodeKind::TypeArray {
                elem: Box::new(ity(&c, 8, false)),
                bound: Some(Box::new(Node::int_lit(&c, 4, 32, true, Loc::default()))),
            },
            Loc::default(),
        );
        assert!(type_is_complete(&bounded));
        assert_eq!(sizeof_type(&bounded), Some(32));

        let mut unbounded = Node::new(
            &c,
            NodeKind::TypeArray {
                elem: Box::new(bounded),
                bound: None,
            },
            Loc::default(),
        );
        assert!(!type_is_complete(&unbounded));
        array_type_remove_bounders(&mut unbounded);
        if let NodeKind::TypeArray { elem, bound } = &unbounded.kind {
            assert!(bound.is_none());
            assert!(matches!(&elem.kind, NodeKind::TypeArray { bound: None, .. }));
        }

        let prog = Node::new(
            &c,
            NodeKind::Program(vec![Node::new(&c, NodeKind::NullStmt, Loc::default())]),
            Loc::default(),
        );
        assert_eq!(prog.chain_length(), 1);
    }

    #[test]
    fn test_incr_step() {
        let c = ctx();
        let i = ity(&c, 32, true);
        let step = type_incr_step(&c, &i).unwrap();
        assert!(matches!(step.kind, NodeKind::Int { value: 1, .. }));

        let off = Node::new(
            &c,
            NodeKind::TypeOffset {
                base: Box::new(ity(&c, 32, true)),
                unit: 8,
            },
            Loc::default(),
        );
        let step = type_incr_step(&c, &off).unwrap();
        assert!(matches!(step.kind, NodeKind::OffsetLit { unit: 8, .. }));

        let s = Node::new(&c, NodeKind::TypeString, Loc::default());
        assert!(type_incr_step(&c, &s).is_none());
    }

    #[test]
    fn test_lvalues() {
        let c = ctx();
        let var = Node::new(
            &c,
            NodeKind::Var {
                name: "x".to_string(),
                back: 0,
                over: 0,
            },
            Loc::default(),
        );
        assert!(lvalue_p(&var));

        let lit = Node::int_lit(&c, 3, 32, true, Loc::default());
        assert!(!lvalue_p(&lit));

        let sref = Node::new(
            &c,
            NodeKind::StructRef {
                base: Box::new(var.clone()),
                field: "f".to_string(),
            },
            Loc::default(),
        );
        assert!(lvalue_p(&sref));

        let bconc = Node::new(
            &c,
            NodeKind::Binary {
                op: BinOp::BConc,
                left: Box::new(var.clone()),
                right: Box::new(lit),
            },
            Loc::default(),
        );
        assert!(!lvalue_p(&bconc));
    }
}
