//! Exceptions
//!
//! An exception is an ordinary struct value of the distinguished type
//! `Exception`. The first five fields and their order are wire-fixed and
//! relied upon by the standard library: `code`, `name`, `exit_status`,
//! `location`, `msg`.

use jab_core::heap::Heap;

use crate::value::{
    make_field, make_integral_type, make_string, make_struct, Method, Object, StructType,
    StructTypeField, TypeVal, Value,
};

// Standard exception codes.
pub const EC_GENERIC: i32 = 0;
pub const EC_DIV_BY_ZERO: i32 = 1;
pub const EC_NO_IOS: i32 = 2;
pub const EC_NO_RETURN: i32 = 3;
pub const EC_OUT_OF_BOUNDS: i32 = 4;
pub const EC_ELEM: i32 = 5;
pub const EC_EOF: i32 = 6;
pub const EC_CONSTRAINT: i32 = 7;
pub const EC_CONV: i32 = 8;
pub const EC_MAP_BOUNDS: i32 = 9;
pub const EC_MAP: i32 = 10;
pub const EC_INVAL: i32 = 11;
pub const EC_SIGNAL: i32 = 12;
pub const EC_OVERFLOW: i32 = 13;
pub const EC_IO: i32 = 14;

/// `(code, symbolic name)` for every standard exception, in code order.
pub const STANDARD_EXCEPTIONS: &[(i32, &str)] = &[
    (EC_GENERIC, "generic"),
    (EC_DIV_BY_ZERO, "division by zero"),
    (EC_NO_IOS, "no IO space"),
    (EC_NO_RETURN, "no return"),
    (EC_OUT_OF_BOUNDS, "out of bounds"),
    (EC_ELEM, "invalid element"),
    (EC_EOF, "EOF"),
    (EC_CONSTRAINT, "constraint violation"),
    (EC_CONV, "conversion error"),
    (EC_MAP_BOUNDS, "out of map bounds"),
    (EC_MAP, "no map"),
    (EC_INVAL, "invalid argument"),
    (EC_SIGNAL, "signal"),
    (EC_OVERFLOW, "overflow"),
    (EC_IO, "generic IO"),
];

/// Symbolic name of a standard exception code.
pub fn standard_name(code: i32) -> &'static str {
    STANDARD_EXCEPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, n)| *n)
        .unwrap_or("generic")
}

/// Build the `Exception` struct type. Field order is fixed; do not
/// reorder.
pub fn build_exception_type(heap: &mut Heap<Object>) -> Value {
    let int32 = make_integral_type(heap, 32, true);
    let strty = Value::Ref(heap.alloc(Object::Typ(TypeVal::StringT)));
    let name = make_string(heap, "Exception");
    let field = |heap: &mut Heap<Object>, fname: &str, ftype: Value| StructTypeField {
        name: make_string(heap, fname),
        ftype,
        label: Value::Null,
        check: Value::Null,
        init: Value::Null,
        optcond: Value::Null,
        endian: None,
    };
    let fields = vec![
        field(heap, "code", int32),
        field(heap, "name", strty),
        field(heap, "exit_status", int32),
        field(heap, "location", strty),
        field(heap, "msg", strty),
    ];
    Value::Ref(heap.alloc(Object::Typ(TypeVal::Struct(StructType {
        name,
        fields,
        methods: Vec::<Method>::new(),
        pinned: false,
        union_: false,
        mapper: Value::Null,
        writer: Value::Null,
        constructor: Value::Null,
    }))))
}

/// Build an exception value of the given type.
pub fn make_exception(
    heap: &mut Heap<Object>,
    exc_type: Value,
    code: i32,
    name: &str,
    exit_status: i32,
    msg: &str,
) -> Value {
    let fnames: Vec<Value> = ["code", "name", "exit_status", "location", "msg"]
        .iter()
        .map(|n| make_string(heap, *n))
        .collect();
    let name_v = make_string(heap, name);
    let loc_v = make_string(heap, "");
    let msg_v = make_string(heap, msg);
    let fields = vec![
        make_field(fnames[0], Value::int32(code), Value::Null),
        make_field(fnames[1], name_v, Value::Null),
        make_field(fnames[2], Value::int32(exit_status), Value::Null),
        make_field(fnames[3], loc_v, Value::Null),
        make_field(fnames[4], msg_v, Value::Null),
    ];
    make_struct(heap, exc_type, fields, Vec::new())
}

/// Code of an exception value: the `code` field of an exception struct,
/// or the numeric value itself when a bare integer was raised.
pub fn exception_code(heap: &Heap<Object>, exc: Value) -> i32 {
    if let Some(i) = exc.as_i64() {
        return i as i32;
    }
    if let Some(r) = exc.as_ref() {
        if let Object::Sct(s) = heap.get(r) {
            if let Some(idx) = s.field_index(heap, "code") {
                if let Some(c) = s.fields[idx].val.as_i64() {
                    return c as i32;
                }
            }
        }
    }
    EC_GENERIC
}

/// The `msg` field of an exception struct, if present and non-empty.
pub fn exception_msg(heap: &Heap<Object>, exc: Value) -> Option<String> {
    let r = exc.as_ref()?;
    if let Object::Sct(s) = heap.get(r) {
        let idx = s.field_index(heap, "msg")?;
        if let Some(vr) = s.fields[idx].val.as_ref() {
            let m = heap.get(vr).as_str()?;
            if !m.is_empty() {
                return Some(m.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{elemsof, type_equal};

    #[test]
    fn test_exception_layout() {
        let mut h: Heap<Object> = Heap::new();
        let ty = build_exception_type(&mut h);
        let exc = make_exception(&mut h, ty, EC_OVERFLOW, "overflow", 1, "too big");

        assert_eq!(elemsof(&h, exc), 5);
        assert_eq!(exception_code(&h, exc), EC_OVERFLOW);
        assert_eq!(exception_msg(&h, exc), Some("too big".to_string()));

        let r = exc.as_ref().unwrap();
        if let Object::Sct(s) = h.get(r) {
            let names: Vec<&str> = s
                .fields
                .iter()
                .map(|f| h.get(f.name.as_ref().unwrap()).as_str().unwrap())
                .collect();
            assert_eq!(names, ["code", "name", "exit_status", "location", "msg"]);
        } else {
            panic!("not a struct");
        }
    }

    #[test]
    fn test_exception_types_compare_by_name() {
        let mut h: Heap<Object> = Heap::new();
        let t1 = build_exception_type(&mut h);
        let t2 = build_exception_type(&mut h);
        assert!(type_equal(&h, t1, t2));
    }

    #[test]
    fn test_bare_integer_code() {
        let h: Heap<Object> = Heap::new();
        assert_eq!(exception_code(&h, Value::int32(42)), 42);
    }
}
