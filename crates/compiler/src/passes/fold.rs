//! Compile-time constant folding
//!
//! Folds integer arithmetic, comparisons, bit operations, casts and
//! string concatenation over literal operands. Evaluation respects the
//! size and signedness of the result type attached by typify; overflow
//! wraps silently, as the runtime's overflow-checking instructions are
//! the authority on whether an overflow is an error.

use crate::ast::{BinOp, Node, NodeKind, UnOp};
use crate::passes::anal::visit_children_mut;

pub fn fold(ast: &mut Node) {
    let _ = visit_children_mut(ast, &mut |c| {
        fold(c);
        Ok(())
    });
    fold_one(ast);
}

fn mask(size: u32) -> u64 {
    if size >= 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    }
}

/// Wrap a wide value into a literal of the given width.
fn wrap(value: i128, size: u32, signed: bool) -> i64 {
    let raw = (value as u64) & mask(size);
    if signed {
        let sh = 64 - size;
        ((raw << sh) as i64) >> sh
    } else {
        raw as i64
    }
}

fn int_of(n: &Node) -> Option<(i64, u32, bool)> {
    match n.kind {
        NodeKind::Int {
            value,
            size,
            signed,
        } if n.literal => Some((value, size, signed)),
        _ => None,
    }
}

fn result_int(n: &Node) -> Option<(u32, bool)> {
    match n.ty.as_deref().map(|t| &t.kind) {
        Some(NodeKind::TypeIntegral { size, signed }) => Some((*size, *signed)),
        _ => None,
    }
}

fn num(v: i64, signed: bool) -> i128 {
    if signed {
        v as i128
    } else {
        (v as u64) as i128
    }
}

fn fold_one(n: &mut Node) {
    let replacement: Option<NodeKind> = match &n.kind {
        NodeKind::Binary { op, left, right } => {
            fold_binary(*op, left, right, n)
        }
        NodeKind::Unary { op, operand } => {
            let (v, _osize, osigned) = match int_of(operand) {
                Some(x) => x,
                None => return,
            };
            let (size, signed) = match result_int(n) {
                Some(x) => x,
                None => return,
            };
            let wide = match op {
                UnOp::Neg => -num(v, osigned),
                UnOp::Pos => num(v, osigned),
                UnOp::BNot => !num(v, osigned),
                UnOp::Not => (num(v, osigned) == 0) as i128,
            };
            Some(NodeKind::Int {
                value: wrap(wide, size, signed),
                size,
                signed,
            })
        }
        NodeKind::Cast { ty, exp } => {
            let (v, _osize, osigned) = match int_of(exp) {
                Some(x) => x,
                None => return,
            };
            match ty.kind {
                NodeKind::TypeIntegral { size, signed } => Some(NodeKind::Int {
                    value: wrap(num(v, osigned), size, signed),
                    size,
                    signed,
                }),
                _ => None,
            }
        }
        _ => None,
    };
    if let Some(kind) = replacement {
        n.kind = kind;
        n.literal = true;
    }
}

fn fold_binary(op: BinOp, left: &Node, right: &Node, n: &Node) -> Option<NodeKind> {
    // String concatenation folds too.
    if let (NodeKind::Str(a), NodeKind::Str(b), BinOp::Add) = (&left.kind, &right.kind, op) {
        if left.literal && right.literal {
            let mut s = a.clone();
            s.push_str(b);
            return Some(NodeKind::Str(s));
        }
    }

    let (lv, lsize, lsigned) = int_of(left)?;
    let (rv, _rsize, rsigned) = int_of(right)?;
    let (size, signed) = result_int(n)?;
    let (x, y) = (num(lv, lsigned), num(rv, rsigned));

    use BinOp::*;
    let wide: i128 = match op {
        Add => x + y,
        Sub => x - y,
        Mul => x * y,
        Div => {
            if y == 0 {
                return None;
            }
            x / y
        }
        CeilDiv => {
            if y == 0 {
                return None;
            }
            let q = x / y;
            let r = x % y;
            if r != 0 && (r < 0) == (y < 0) {
                q + 1
            } else {
                q
            }
        }
        Mod => {
            if y == 0 {
                return None;
            }
            x % y
        }
        Pow => {
            if y < 0 || y > u32::MAX as i128 {
                return None;
            }
            // Wrapping exponentiation over the result width.
            let m = mask(size);
            let mut acc: u64 = 1;
            let mut b = (x as u64) & m;
            let mut e = y as u32;
            while e > 0 {
                if e & 1 == 1 {
                    acc = acc.wrapping_mul(b) & m;
                }
                b = b.wrapping_mul(b) & m;
                e >>= 1;
            }
            acc as i128
        }
        Eq => (x == y) as i128,
        Ne => (x != y) as i128,
        Lt => (x < y) as i128,
        Le => (x <= y) as i128,
        Gt => (x > y) as i128,
        Ge => (x >= y) as i128,
        And => ((x != 0) && (y != 0)) as i128,
        Or => ((x != 0) || (y != 0)) as i128,
        BAnd => ((lv as u64) & (rv as u64)) as i128,
        BOr => ((lv as u64) | (rv as u64)) as i128,
        BXor => ((lv as u64) ^ (rv as u64)) as i128,
        Shl => {
            let c = y as u32;
            if c >= lsize {
                0
            } else {
                (((lv as u64) & mask(lsize)) << c) as i128
            }
        }
        Shr => {
            let c = y as u32;
            if c >= lsize {
                if lsigned && lv < 0 {
                    -1
                } else {
                    0
                }
            } else if lsigned {
                (lv >> c) as i128
            } else {
                (((lv as u64) & mask(lsize)) >> c) as i128
            }
        }
        BConc => {
            let sb = right
                .ty
                .as_deref()
                .and_then(|t| match t.kind {
                    NodeKind::TypeIntegral { size, .. } => Some(size),
                    _ => None,
                })
                .unwrap_or(0);
            ((((lv as u64) & mask(lsize)) << sb) | ((rv as u64) & mask(sb))) as i128
        }
    };
    Some(NodeKind::Int {
        value: wrap(wide, size, signed),
        size,
        signed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstCtx;
    use crate::env::CEnv;
    use crate::parser::{parse, StartSymbol};
    use crate::passes::typify::typify;

    fn folded(src: &str) -> Node {
        let ctx = AstCtx::new();
        let mut env = CEnv::new();
        let mut ast = parse(src, &ctx, &mut env, StartSymbol::Expression, false, None)
            .expect("must parse");
        typify(&mut ast, &mut env, &ctx, 0).expect("must type");
        fold(&mut ast);
        ast
    }

    #[test]
    fn test_fold_arithmetic() {
        let n = folded("2 + 3 * 4");
        assert!(matches!(
            n.kind,
            NodeKind::Int {
                value: 14,
                size: 32,
                signed: true
            }
        ));
        assert!(n.literal);
    }

    #[test]
    fn test_fold_wraps_to_width() {
        // 255 + 1 wraps to 0 at 8 bits unsigned.
        let n = folded("255UB + 1UB");
        assert!(matches!(
            n.kind,
            NodeKind::Int {
                value: 0,
                size: 8,
                signed: false
            }
        ));
    }

    #[test]
    fn test_fold_signed_wrap_is_not_an_error() {
        let n = folded("127B + 1B");
        assert!(matches!(
            n.kind,
            NodeKind::Int {
                value: -128,
                size: 8,
                signed: true
            }
        ));
    }

    #[test]
    fn test_division_by_zero_is_left_to_the_runtime() {
        let n = folded("1 / 0");
        assert!(matches!(n.kind, NodeKind::Binary { .. }));
    }

    #[test]
    fn test_fold_cast() {
        let n = folded("0x1234UH as uint<8>");
        assert!(matches!(
            n.kind,
            NodeKind::Int {
                value: 0x34,
                size: 8,
                signed: false
            }
        ));
    }

    #[test]
    fn test_fold_comparison_and_strings() {
        let n = folded("3 < 4");
        assert!(matches!(n.kind, NodeKind::Int { value: 1, .. }));

        let n = folded("\"a\" + \"b\"");
        match n.kind {
            NodeKind::Str(s) => assert_eq!(s, "ab"),
            other => panic!("expected a folded string, got {:?}", other),
        }
    }

    #[test]
    fn test_fold_bconc() {
        let n = folded("0x12UB ::: 0x34UB");
        assert!(matches!(
            n.kind,
            NodeKind::Int {
                value: 0x1234,
                size: 16,
                signed: false
            }
        ));
    }
}
