//! Runtime lexical environments
//!
//! Frames are heap objects linked upwards; a variable is addressed by
//! `(back, over)`: walk `back` parent links, then index `over` within the
//! frame. The top-level frame has a `Null` up link and holds the global
//! variables in registration order.

use jab_core::heap::Heap;

use crate::value::{EnvFrame, Object, Value};

/// A fresh frame linked over `up` (`Null` for a top-level frame).
pub fn make_env(heap: &mut Heap<Object>, up: Value) -> Value {
    Value::Ref(heap.alloc(Object::Env(EnvFrame {
        up,
        vals: Vec::new(),
    })))
}

/// Push a frame on top of `env`.
pub fn push_frame(heap: &mut Heap<Object>, env: Value) -> Value {
    make_env(heap, env)
}

/// Drop the top frame, yielding the enclosing one. `None` when `env` is
/// already the top level.
pub fn pop_frame(heap: &Heap<Object>, env: Value) -> Option<Value> {
    match frame(heap, env) {
        Some(f) if !f.up.is_null() => Some(f.up),
        _ => None,
    }
}

/// Append a value to the frame, returning its `over` index.
pub fn register(heap: &mut Heap<Object>, env: Value, v: Value) -> Option<usize> {
    let r = env.as_ref()?;
    match heap.get_mut(r) {
        Object::Env(f) => {
            f.vals.push(v);
            Some(f.vals.len() - 1)
        }
        _ => None,
    }
}

pub fn lookup(heap: &Heap<Object>, env: Value, back: usize, over: usize) -> Option<Value> {
    let f = walk(heap, env, back)?;
    f.vals.get(over).copied()
}

pub fn set(heap: &mut Heap<Object>, env: Value, back: usize, over: usize, v: Value) -> bool {
    let mut cur = env;
    for _ in 0..back {
        cur = match frame(heap, cur) {
            Some(f) => f.up,
            None => return false,
        };
    }
    let r = match cur.as_ref() {
        Some(r) => r,
        None => return false,
    };
    match heap.get_mut(r) {
        Object::Env(f) if over < f.vals.len() => {
            f.vals[over] = v;
            true
        }
        _ => false,
    }
}

pub fn toplevel_p(heap: &Heap<Object>, env: Value) -> bool {
    matches!(frame(heap, env), Some(f) if f.up.is_null())
}

/// Walk the up links to the top-level frame.
pub fn toplevel(heap: &Heap<Object>, env: Value) -> Value {
    let mut cur = env;
    while let Some(f) = frame(heap, cur) {
        if f.up.is_null() {
            return cur;
        }
        cur = f.up;
    }
    cur
}

/// Number of values registered in the frame.
pub fn frame_len(heap: &Heap<Object>, env: Value) -> usize {
    frame(heap, env).map(|f| f.vals.len()).unwrap_or(0)
}

/// Truncate the frame to `len` values. Used to roll back global
/// registrations after a failed execution.
pub fn truncate(heap: &mut Heap<Object>, env: Value, len: usize) {
    if let Some(r) = env.as_ref() {
        if let Object::Env(f) = heap.get_mut(r) {
            f.vals.truncate(len);
        }
    }
}

fn frame<'h>(heap: &'h Heap<Object>, env: Value) -> Option<&'h EnvFrame> {
    match env.as_ref().map(|r| heap.get(r)) {
        Some(Object::Env(f)) => Some(f),
        _ => None,
    }
}

fn walk<'h>(heap: &'h Heap<Object>, env: Value, back: usize) -> Option<&'h EnvFrame> {
    let mut f = frame(heap, env)?;
    for _ in 0..back {
        f = frame(heap, f.up)?;
    }
    Some(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut h: Heap<Object> = Heap::new();
        let top = make_env(&mut h, Value::Null);
        assert_eq!(register(&mut h, top, Value::int32(1)), Some(0));
        assert_eq!(register(&mut h, top, Value::int32(2)), Some(1));

        let inner = push_frame(&mut h, top);
        register(&mut h, inner, Value::int32(10));

        assert_eq!(lookup(&h, inner, 0, 0), Some(Value::int32(10)));
        assert_eq!(lookup(&h, inner, 1, 1), Some(Value::int32(2)));
        assert_eq!(lookup(&h, inner, 1, 5), None);
    }

    #[test]
    fn test_set_walks_back_links() {
        let mut h: Heap<Object> = Heap::new();
        let top = make_env(&mut h, Value::Null);
        register(&mut h, top, Value::int32(1));
        let inner = push_frame(&mut h, top);

        assert!(set(&mut h, inner, 1, 0, Value::int32(9)));
        assert_eq!(lookup(&h, top, 0, 0), Some(Value::int32(9)));
        assert!(!set(&mut h, inner, 2, 0, Value::Null));
    }

    #[test]
    fn test_toplevel_walk() {
        let mut h: Heap<Object> = Heap::new();
        let top = make_env(&mut h, Value::Null);
        let a = push_frame(&mut h, top);
        let b = push_frame(&mut h, a);

        assert!(toplevel_p(&h, top));
        assert!(!toplevel_p(&h, b));
        assert_eq!(toplevel(&h, b), top);
        assert_eq!(pop_frame(&h, b), Some(a));
        assert_eq!(pop_frame(&h, top), None);
    }
}
