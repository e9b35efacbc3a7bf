//! Runtime values
//!
//! A [`Value`] is a machine-word sized, `Copy` cell. Integers up to 32 bits
//! live unboxed in the cell together with their declared bit-size; wider
//! integers keep their size alongside a 64-bit payload; everything else is
//! a reference into the VM heap, where an [`Object`] holds the data.
//!
//! Arrays and structs are *mappable*: they carry a [`MapInfo`] tying them
//! to an IO space at a bit offset, plus backup copies so a relocation can
//! be undone transactionally (see [`reloc`] / [`ureloc`]).

use std::rc::Rc;

use jab_core::bits::Endian;
use jab_core::heap::{GcRef, Heap, Shape};

use crate::program::Program;

/// A dynamically-typed value cell.
///
/// `size` is the declared width in bits: 1..=32 for `Int`/`UInt`,
/// 33..=64 for `Long`/`ULong`. `Int` payloads are kept sign-extended,
/// `UInt`/`ULong` payloads masked to their width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Null,
    Int { v: i32, size: u8 },
    UInt { v: u32, size: u8 },
    Long { v: i64, size: u8 },
    ULong { v: u64, size: u8 },
    Ref(GcRef),
}

impl Value {
    /// A 32-bit signed int, the default integer type of the language.
    pub fn int32(v: i32) -> Value {
        Value::Int { v, size: 32 }
    }

    /// An unsigned 64-bit value, used for sizes and bit offsets.
    pub fn ulong(v: u64) -> Value {
        Value::ULong { v, size: 64 }
    }

    pub fn is_null(self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            Value::Int { .. } | Value::UInt { .. } | Value::Long { .. } | Value::ULong { .. }
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Value::Int { .. } | Value::Long { .. })
    }

    /// Declared width in bits of an integral value.
    pub fn int_size(self) -> Option<u32> {
        match self {
            Value::Int { size, .. } | Value::UInt { size, .. } => Some(size as u32),
            Value::Long { size, .. } | Value::ULong { size, .. } => Some(size as u32),
            _ => None,
        }
    }

    /// Raw payload bits, masked to the declared width.
    pub fn raw_bits(self) -> Option<u64> {
        match self {
            Value::Int { v, size } => Some((v as i64 as u64) & size_mask(size as u32)),
            Value::UInt { v, .. } => Some(v as u64),
            Value::Long { v, size } => Some((v as u64) & size_mask(size as u32)),
            Value::ULong { v, .. } => Some(v),
            _ => None,
        }
    }

    /// Numeric value as a signed 64-bit quantity.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Value::Int { v, .. } => Some(v as i64),
            Value::UInt { v, .. } => Some(v as i64),
            Value::Long { v, .. } => Some(v),
            Value::ULong { v, .. } => Some(v as i64),
            _ => None,
        }
    }

    /// Numeric value as an unsigned 64-bit quantity (signed values are
    /// reinterpreted).
    pub fn as_u64(self) -> Option<u64> {
        self.raw_bits()
    }

    pub fn as_ref(self) -> Option<GcRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Variant name for diagnostics.
    pub fn kind_name(self, heap: &Heap<Object>) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int { .. } => "int",
            Value::UInt { .. } => "uint",
            Value::Long { .. } => "long",
            Value::ULong { .. } => "ulong",
            Value::Ref(r) => match heap.get(r) {
                Object::Str(_) => "string",
                Object::Arr(_) => "array",
                Object::Sct(_) => "struct",
                Object::Off(_) => "offset",
                Object::Typ(_) => "type",
                Object::Cls(_) => "closure",
                Object::Env(_) => "environment",
                Object::IArr(_) => "internal array",
            },
        }
    }
}

/// Mask with the low `size` bits set (`size` 1..=64).
pub fn size_mask(size: u32) -> u64 {
    if size >= 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    }
}

/// Build an integral value of the given width from raw bits.
///
/// Returns `None` when the width is zero or above 64. Signed values are
/// sign-extended from bit `size - 1`; unsigned values are masked.
pub fn make_integral(bits: u64, size: u32, signed: bool) -> Option<Value> {
    if size == 0 || size > 64 {
        return None;
    }
    let masked = bits & size_mask(size);
    if signed {
        let sh = 64 - size;
        let v = ((masked << sh) as i64) >> sh;
        if size <= 32 {
            Some(Value::Int {
                v: v as i32,
                size: size as u8,
            })
        } else {
            Some(Value::Long {
                v,
                size: size as u8,
            })
        }
    } else if size <= 32 {
        Some(Value::UInt {
            v: masked as u32,
            size: size as u8,
        })
    } else {
        Some(Value::ULong {
            v: masked,
            size: size as u8,
        })
    }
}

// ---------------------------------------------------------------------------
// Boxed objects

/// Heap-allocated value payloads.
#[derive(Debug)]
pub enum Object {
    Str(String),
    Arr(ArrayVal),
    Sct(StructVal),
    Off(OffsetVal),
    Typ(TypeVal),
    Cls(ClosureVal),
    Env(EnvFrame),
    /// Heterogeneous vector, used for program literal tables.
    IArr(Vec<Value>),
}

impl Object {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Mapping state of an array or struct value.
///
/// `ios` is an `Int(32)` space id or `Null`; `offset` a `ULong(64)` bit
/// offset or `Null`. `sel`/`siz` are the optional element-count and
/// byte-size bounds of arrays. `mapper`/`writer` are closures overriding
/// the structural IO paths. The `back_*` fields hold the pre-relocation
/// state.
#[derive(Debug, Clone, Copy)]
pub struct MapInfo {
    pub mapped: bool,
    pub strict: bool,
    pub ios: Value,
    pub offset: Value,
    pub sel: Value,
    pub siz: Value,
    pub mapper: Value,
    pub writer: Value,
    pub back_mapped: bool,
    pub back_ios: Value,
    pub back_offset: Value,
}

impl Default for MapInfo {
    fn default() -> Self {
        MapInfo {
            mapped: false,
            strict: true,
            ios: Value::Null,
            offset: Value::Null,
            sel: Value::Null,
            siz: Value::Null,
            mapper: Value::Null,
            writer: Value::Null,
            back_mapped: false,
            back_ios: Value::Null,
            back_offset: Value::Null,
        }
    }
}

impl MapInfo {
    fn visit(&mut self, f: &mut dyn FnMut(&mut GcRef)) {
        visit_value(&mut self.ios, f);
        visit_value(&mut self.offset, f);
        visit_value(&mut self.sel, f);
        visit_value(&mut self.siz, f);
        visit_value(&mut self.mapper, f);
        visit_value(&mut self.writer, f);
        visit_value(&mut self.back_ios, f);
        visit_value(&mut self.back_offset, f);
    }
}

/// One array element: the value plus its bit offset when mapped.
#[derive(Debug, Clone, Copy)]
pub struct Elem {
    pub val: Value,
    /// `ULong(64)` bit offset or `Null`.
    pub off: Value,
    pub back_off: Value,
}

#[derive(Debug)]
pub struct ArrayVal {
    /// The array's own type (`Object::Typ`, `TypeVal::Array`).
    pub atype: Value,
    pub elems: Vec<Elem>,
    pub map: MapInfo,
}

/// One struct field. A `Null` name marks the field absent; absent fields
/// are invisible to lookup and skipped by size and IO operations.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: Value,
    pub val: Value,
    /// `ULong(64)` bit offset or `Null`.
    pub off: Value,
    /// Written since the value was mapped.
    pub modified: bool,
    pub back_val: Value,
    pub back_off: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct Method {
    pub name: Value,
    pub closure: Value,
}

#[derive(Debug)]
pub struct StructVal {
    /// The struct's type (`Object::Typ`, `TypeVal::Struct`).
    pub stype: Value,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub map: MapInfo,
}

impl StructVal {
    /// Index of the present field called `name`.
    pub fn field_index(&self, heap: &Heap<Object>, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| match f.name {
            Value::Ref(r) => heap.get(r).as_str() == Some(name),
            _ => false,
        })
    }

    pub fn method(&self, heap: &Heap<Object>, name: &str) -> Option<Value> {
        self.methods
            .iter()
            .find(|m| match m.name {
                Value::Ref(r) => heap.get(r).as_str() == Some(name),
                _ => false,
            })
            .map(|m| m.closure)
    }
}

/// An offset: an integral magnitude and a unit in bits-per-unit.
#[derive(Debug, Clone, Copy)]
pub struct OffsetVal {
    pub magnitude: Value,
    /// Strictly positive.
    pub unit: u64,
}

impl OffsetVal {
    /// Total width in bits, magnitude times unit.
    pub fn in_bits(&self) -> i128 {
        let m = if self.magnitude.is_signed() {
            self.magnitude.as_i64().unwrap_or(0) as i128
        } else {
            self.magnitude.as_u64().unwrap_or(0) as i128
        };
        m * self.unit as i128
    }
}

/// A closure: an entry point into a program plus a captured environment.
///
/// The program's literal table is kept alive through the VM's program
/// registry, so only the environment is a heap edge here.
#[derive(Debug, Clone)]
pub struct ClosureVal {
    pub program: Rc<Program>,
    pub entry: u32,
    pub env: Value,
}

/// A lexical frame of the runtime environment. `up` is the enclosing
/// frame or `Null` at the top level.
#[derive(Debug)]
pub struct EnvFrame {
    pub up: Value,
    pub vals: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Type values

/// Per-field metadata of a struct type. The `label`, `check`, `init` and
/// `optcond` slots hold closures (or a `ULong` for constant labels, or
/// `Null`); each receives the partially-built struct and yields the field
/// offset, a constraint verdict, a default value, or a presence verdict.
#[derive(Debug, Clone, Copy)]
pub struct StructTypeField {
    pub name: Value,
    pub ftype: Value,
    pub label: Value,
    pub check: Value,
    pub init: Value,
    pub optcond: Value,
    pub endian: Option<Endian>,
}

#[derive(Debug)]
pub struct StructType {
    /// `Object::Str` name or `Null` for anonymous types.
    pub name: Value,
    pub fields: Vec<StructTypeField>,
    /// Methods attached to every value of this type.
    pub methods: Vec<Method>,
    pub pinned: bool,
    pub union_: bool,
    /// Optional closure overrides for the structural IO paths.
    pub mapper: Value,
    pub writer: Value,
    pub constructor: Value,
}

/// First-class type reifiers.
#[derive(Debug)]
pub enum TypeVal {
    Integral { size: u8, signed: bool },
    StringT,
    Void,
    Any,
    /// `bound` is a `ULong` element count, an offset value, a bounder
    /// closure, or `Null` for unbounded arrays. `elem` is the element
    /// type.
    Array { bound: Value, elem: Value },
    Offset { base: Value, unit: u64 },
    Struct(StructType),
    Function { ret: Value, args: Vec<Value> },
}

// ---------------------------------------------------------------------------
// GC shape

/// Apply `f` to the heap reference inside `v`, if any. Used by root
/// tracing and the object shape.
pub fn visit_value(v: &mut Value, f: &mut dyn FnMut(&mut GcRef)) {
    if let Value::Ref(r) = v {
        f(r);
    }
}

impl Shape for Object {
    fn update_refs(&mut self, f: &mut dyn FnMut(&mut GcRef)) {
        match self {
            Object::Str(_) => {}
            Object::Arr(a) => {
                visit_value(&mut a.atype, f);
                for e in &mut a.elems {
                    visit_value(&mut e.val, f);
                    visit_value(&mut e.off, f);
                    visit_value(&mut e.back_off, f);
                }
                a.map.visit(f);
            }
            Object::Sct(s) => {
                visit_value(&mut s.stype, f);
                for fld in &mut s.fields {
                    visit_value(&mut fld.name, f);
                    visit_value(&mut fld.val, f);
                    visit_value(&mut fld.off, f);
                    visit_value(&mut fld.back_val, f);
                    visit_value(&mut fld.back_off, f);
                }
                for m in &mut s.methods {
                    visit_value(&mut m.name, f);
                    visit_value(&mut m.closure, f);
                }
                s.map.visit(f);
            }
            Object::Off(o) => visit_value(&mut o.magnitude, f),
            Object::Typ(t) => match t {
                TypeVal::Integral { .. } | TypeVal::StringT | TypeVal::Void | TypeVal::Any => {}
                TypeVal::Array { bound, elem } => {
                    visit_value(bound, f);
                    visit_value(elem, f);
                }
                TypeVal::Offset { base, .. } => visit_value(base, f),
                TypeVal::Struct(st) => {
                    visit_value(&mut st.name, f);
                    for fld in &mut st.fields {
                        visit_value(&mut fld.name, f);
                        visit_value(&mut fld.ftype, f);
                        visit_value(&mut fld.label, f);
                        visit_value(&mut fld.check, f);
                        visit_value(&mut fld.init, f);
                        visit_value(&mut fld.optcond, f);
                    }
                    for m in &mut st.methods {
                        visit_value(&mut m.name, f);
                        visit_value(&mut m.closure, f);
                    }
                    visit_value(&mut st.mapper, f);
                    visit_value(&mut st.writer, f);
                    visit_value(&mut st.constructor, f);
                }
                TypeVal::Function { ret, args } => {
                    visit_value(ret, f);
                    for a in args {
                        visit_value(a, f);
                    }
                }
            },
            Object::Cls(c) => visit_value(&mut c.env, f),
            Object::Env(e) => {
                visit_value(&mut e.up, f);
                for v in &mut e.vals {
                    visit_value(v, f);
                }
            }
            Object::IArr(vs) => {
                for v in vs {
                    visit_value(v, f);
                }
            }
        }
    }

    fn retained_size(&self) -> usize {
        match self {
            Object::Str(s) => s.len(),
            Object::Arr(a) => a.elems.len() * std::mem::size_of::<Elem>(),
            Object::Sct(s) => s.fields.len() * std::mem::size_of::<Field>(),
            Object::Typ(TypeVal::Struct(st)) => {
                st.fields.len() * std::mem::size_of::<StructTypeField>()
            }
            Object::Env(e) => e.vals.len() * std::mem::size_of::<Value>(),
            Object::IArr(vs) => vs.len() * std::mem::size_of::<Value>(),
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Constructors over the heap

pub fn make_string(heap: &mut Heap<Object>, s: impl Into<String>) -> Value {
    Value::Ref(heap.alloc(Object::Str(s.into())))
}

/// Build an offset value. The unit must be strictly positive and the
/// magnitude integral; otherwise no value is constructed.
pub fn make_offset(heap: &mut Heap<Object>, magnitude: Value, unit: u64) -> Option<Value> {
    if unit == 0 || !magnitude.is_integral() {
        return None;
    }
    Some(Value::Ref(heap.alloc(Object::Off(OffsetVal {
        magnitude,
        unit,
    }))))
}

pub fn make_array(heap: &mut Heap<Object>, atype: Value) -> Value {
    Value::Ref(heap.alloc(Object::Arr(ArrayVal {
        atype,
        elems: Vec::new(),
        map: MapInfo::default(),
    })))
}

pub fn make_struct(
    heap: &mut Heap<Object>,
    stype: Value,
    fields: Vec<Field>,
    methods: Vec<Method>,
) -> Value {
    Value::Ref(heap.alloc(Object::Sct(StructVal {
        stype,
        fields,
        methods,
        map: MapInfo::default(),
    })))
}

pub fn make_integral_type(heap: &mut Heap<Object>, size: u32, signed: bool) -> Value {
    Value::Ref(heap.alloc(Object::Typ(TypeVal::Integral {
        size: size as u8,
        signed,
    })))
}

pub fn make_field(name: Value, val: Value, off: Value) -> Field {
    Field {
        name,
        val,
        off,
        modified: false,
        back_val: Value::Null,
        back_off: Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Structural queries

/// Number of elements: array length, count of present struct fields,
/// string byte length; one for everything else.
pub fn elemsof(heap: &Heap<Object>, v: Value) -> u64 {
    match v {
        Value::Ref(r) => match heap.get(r) {
            Object::Arr(a) => a.elems.len() as u64,
            Object::Sct(s) => s.fields.iter().filter(|f| !f.name.is_null()).count() as u64,
            Object::Str(s) => s.len() as u64,
            _ => 1,
        },
        _ => 1,
    }
}

/// Size of a value in bits.
pub fn size_of(heap: &Heap<Object>, v: Value) -> u64 {
    match v {
        Value::Null => 0,
        Value::Int { size, .. }
        | Value::UInt { size, .. }
        | Value::Long { size, .. }
        | Value::ULong { size, .. } => size as u64,
        Value::Ref(r) => match heap.get(r) {
            Object::Str(s) => (s.len() as u64 + 1) * 8,
            Object::Off(o) => size_of(heap, o.magnitude),
            Object::Arr(a) => a.elems.iter().map(|e| size_of(heap, e.val)).sum(),
            Object::Sct(s) => struct_size(heap, s),
            Object::Typ(_) | Object::Cls(_) | Object::Env(_) | Object::IArr(_) => 0,
        },
    }
}

fn struct_size(heap: &Heap<Object>, s: &StructVal) -> u64 {
    let (pinned, union_) = match s.stype {
        Value::Ref(r) => match heap.get(r) {
            Object::Typ(TypeVal::Struct(st)) => (st.pinned, st.union_),
            _ => (false, false),
        },
        _ => (false, false),
    };
    let base = s.map.offset.as_u64().unwrap_or(0);
    let mut size: u64 = 0;
    let mut sum: u64 = 0;
    for f in s.fields.iter().filter(|f| !f.name.is_null()) {
        let fsize = size_of(heap, f.val);
        let candidate = match f.off.as_u64() {
            // Known layout: distance from the struct base plus the field.
            Some(off) => off.saturating_sub(base) + fsize,
            None => {
                if pinned || union_ {
                    fsize
                } else {
                    sum + fsize
                }
            }
        };
        sum += fsize;
        size = size.max(candidate);
    }
    size
}

/// Structural type equality. Named struct types compare by name only;
/// anonymous struct types never compare equal.
pub fn type_equal(heap: &Heap<Object>, a: Value, b: Value) -> bool {
    let (ra, rb) = match (a.as_ref(), b.as_ref()) {
        (Some(ra), Some(rb)) => (ra, rb),
        _ => return a.is_null() && b.is_null(),
    };
    match (heap.get(ra), heap.get(rb)) {
        (
            Object::Typ(TypeVal::Integral { size: s1, signed: g1 }),
            Object::Typ(TypeVal::Integral { size: s2, signed: g2 }),
        ) => s1 == s2 && g1 == g2,
        (Object::Typ(TypeVal::StringT), Object::Typ(TypeVal::StringT)) => true,
        (Object::Typ(TypeVal::Void), Object::Typ(TypeVal::Void)) => true,
        (Object::Typ(TypeVal::Any), Object::Typ(TypeVal::Any)) => true,
        (
            Object::Typ(TypeVal::Array { bound: b1, elem: e1 }),
            Object::Typ(TypeVal::Array { bound: b2, elem: e2 }),
        ) => equal(heap, *b1, *b2) && type_equal(heap, *e1, *e2),
        (
            Object::Typ(TypeVal::Offset { base: t1, unit: u1 }),
            Object::Typ(TypeVal::Offset { base: t2, unit: u2 }),
        ) => u1 == u2 && type_equal(heap, *t1, *t2),
        (Object::Typ(TypeVal::Struct(s1)), Object::Typ(TypeVal::Struct(s2))) => {
            match (s1.name.as_ref(), s2.name.as_ref()) {
                (Some(n1), Some(n2)) => heap.get(n1).as_str() == heap.get(n2).as_str(),
                _ => false,
            }
        }
        (
            Object::Typ(TypeVal::Function { ret: r1, args: a1 }),
            Object::Typ(TypeVal::Function { ret: r2, args: a2 }),
        ) => {
            type_equal(heap, *r1, *r2)
                && a1.len() == a2.len()
                && a1.iter().zip(a2).all(|(x, y)| type_equal(heap, *x, *y))
        }
        _ => false,
    }
}

/// Structural value equality.
///
/// Integers must agree in signedness, size and bits. Offsets compare after
/// promotion to bits. Arrays and structs compare their mapping identity
/// (IO space, offset, bounds), their types, and their contents pointwise.
pub fn equal(heap: &Heap<Object>, a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Ref(ra), Value::Ref(rb)) => {
            if ra == rb {
                return true;
            }
            match (heap.get(ra), heap.get(rb)) {
                (Object::Str(x), Object::Str(y)) => x == y,
                (Object::Off(x), Object::Off(y)) => {
                    x.in_bits() == y.in_bits()
                }
                (Object::Arr(x), Object::Arr(y)) => {
                    let (ex, ey) = (array_elem_type(heap, x), array_elem_type(heap, y));
                    x.elems.len() == y.elems.len()
                        && type_equal(heap, ex, ey)
                        && x.map.ios == y.map.ios
                        && equal(heap, x.map.offset, y.map.offset)
                        && equal(heap, x.map.sel, y.map.sel)
                        && equal(heap, x.map.siz, y.map.siz)
                        && x.elems.iter().zip(&y.elems).all(|(p, q)| {
                            equal(heap, p.val, q.val) && equal(heap, p.off, q.off)
                        })
                }
                (Object::Sct(x), Object::Sct(y)) => {
                    x.fields.len() == y.fields.len()
                        && x.methods.len() == y.methods.len()
                        && x.map.ios == y.map.ios
                        && equal(heap, x.map.offset, y.map.offset)
                        && type_equal(heap, x.stype, y.stype)
                        && x.fields.iter().zip(&y.fields).all(|(p, q)| {
                            equal(heap, p.name, q.name)
                                && equal(heap, p.val, q.val)
                                && equal(heap, p.off, q.off)
                        })
                        && x.methods
                            .iter()
                            .zip(&y.methods)
                            .all(|(p, q)| equal(heap, p.name, q.name))
                }
                (Object::Typ(_), Object::Typ(_)) => type_equal(heap, a, b),
                (Object::Cls(x), Object::Cls(y)) => {
                    Rc::ptr_eq(&x.program, &y.program) && x.entry == y.entry && x.env == y.env
                }
                (Object::IArr(x), Object::IArr(y)) => {
                    x.len() == y.len() && x.iter().zip(y).all(|(p, q)| equal(heap, *p, *q))
                }
                _ => false,
            }
        }
        // Unboxed cells: derived equality is tag + size + bits.
        _ => a == b,
    }
}

/// Element type of an array value, from its array type.
pub fn array_elem_type(heap: &Heap<Object>, a: &ArrayVal) -> Value {
    match a.atype {
        Value::Ref(r) => match heap.get(r) {
            Object::Typ(TypeVal::Array { elem, .. }) => *elem,
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Mapping transformations

/// Clear the mapped flag of `v`, recursing into array elements and struct
/// field values. The IO space and offsets are retained.
pub fn unmap(heap: &mut Heap<Object>, v: Value) {
    let r = match v.as_ref() {
        Some(r) => r,
        None => return,
    };
    let children: Vec<Value> = match heap.get_mut(r) {
        Object::Arr(a) => {
            a.map.mapped = false;
            a.elems.iter().map(|e| e.val).collect()
        }
        Object::Sct(s) => {
            s.map.mapped = false;
            s.fields.iter().map(|f| f.val).collect()
        }
        _ => return,
    };
    for c in children {
        unmap(heap, c);
    }
}

/// Relocate `v` to `ios` at bit offset `new_off`.
///
/// The current mapping info is saved into the backup slots, the value is
/// marked mapped at the new location, and every element/field offset is
/// translated by the delta. Fields are marked modified; absent fields are
/// skipped. Children that are themselves composite follow recursively.
pub fn reloc(heap: &mut Heap<Object>, v: Value, ios: Value, new_off: u64) {
    let r = match v.as_ref() {
        Some(r) => r,
        None => return,
    };
    let mut children: Vec<(Value, Option<u64>)> = Vec::new();
    match heap.get_mut(r) {
        Object::Arr(a) => {
            let delta = new_off as i64 - a.map.offset.as_u64().unwrap_or(new_off) as i64;
            a.map.back_mapped = a.map.mapped;
            a.map.back_ios = a.map.ios;
            a.map.back_offset = a.map.offset;
            a.map.mapped = true;
            a.map.ios = ios;
            a.map.offset = Value::ulong(new_off);
            for e in &mut a.elems {
                e.back_off = e.off;
                if let Some(off) = e.off.as_u64() {
                    let moved = (off as i64 + delta) as u64;
                    e.off = Value::ulong(moved);
                    children.push((e.val, Some(moved)));
                } else {
                    children.push((e.val, None));
                }
            }
        }
        Object::Sct(s) => {
            let delta = new_off as i64 - s.map.offset.as_u64().unwrap_or(new_off) as i64;
            s.map.back_mapped = s.map.mapped;
            s.map.back_ios = s.map.ios;
            s.map.back_offset = s.map.offset;
            s.map.mapped = true;
            s.map.ios = ios;
            s.map.offset = Value::ulong(new_off);
            for f in &mut s.fields {
                if f.name.is_null() {
                    continue;
                }
                f.back_val = f.val;
                f.back_off = f.off;
                f.modified = true;
                if let Some(off) = f.off.as_u64() {
                    let moved = (off as i64 + delta) as u64;
                    f.off = Value::ulong(moved);
                    children.push((f.val, Some(moved)));
                } else {
                    children.push((f.val, None));
                }
            }
        }
        _ => return,
    }
    for (c, off) in children {
        if let Some(off) = off {
            if matches!(
                c.as_ref().map(|r| heap.get(r)),
                Some(Object::Arr(_)) | Some(Object::Sct(_))
            ) {
                reloc(heap, c, ios, off);
            }
        }
    }
}

/// Undo a [`reloc`]: swap the backup mapping info and element/field
/// offsets back into place.
pub fn ureloc(heap: &mut Heap<Object>, v: Value) {
    let r = match v.as_ref() {
        Some(r) => r,
        None => return,
    };
    let mut children: Vec<Value> = Vec::new();
    match heap.get_mut(r) {
        Object::Arr(a) => {
            std::mem::swap(&mut a.map.mapped, &mut a.map.back_mapped);
            std::mem::swap(&mut a.map.ios, &mut a.map.back_ios);
            std::mem::swap(&mut a.map.offset, &mut a.map.back_offset);
            for e in &mut a.elems {
                std::mem::swap(&mut e.off, &mut e.back_off);
                children.push(e.val);
            }
        }
        Object::Sct(s) => {
            std::mem::swap(&mut s.map.mapped, &mut s.map.back_mapped);
            std::mem::swap(&mut s.map.ios, &mut s.map.back_ios);
            std::mem::swap(&mut s.map.offset, &mut s.map.back_offset);
            for f in &mut s.fields {
                if f.name.is_null() {
                    continue;
                }
                std::mem::swap(&mut f.off, &mut f.back_off);
                children.push(f.val);
            }
        }
        _ => return,
    }
    for c in children {
        if matches!(
            c.as_ref().map(|r| heap.get(r)),
            Some(Object::Arr(_)) | Some(Object::Sct(_))
        ) {
            ureloc(heap, c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap<Object> {
        Heap::new()
    }

    #[test]
    fn test_make_integral_widths() {
        assert!(make_integral(1, 0, true).is_none());
        assert!(make_integral(1, 65, false).is_none());

        assert_eq!(
            make_integral(14, 32, true),
            Some(Value::Int { v: 14, size: 32 })
        );
        // Sign extension from the declared width.
        assert_eq!(
            make_integral(0xff, 8, true),
            Some(Value::Int { v: -1, size: 8 })
        );
        assert_eq!(
            make_integral(0xff, 8, false),
            Some(Value::UInt { v: 0xff, size: 8 })
        );
        assert!(matches!(
            make_integral(0x1_0000_0000, 33, false),
            Some(Value::ULong { .. })
        ));
    }

    #[test]
    fn test_integer_equality_needs_size_and_sign() {
        let h = heap();
        let a = make_integral(7, 32, true).unwrap();
        let b = make_integral(7, 32, true).unwrap();
        let c = make_integral(7, 16, true).unwrap();
        let d = make_integral(7, 32, false).unwrap();
        assert!(equal(&h, a, b));
        assert!(!equal(&h, a, c));
        assert!(!equal(&h, a, d));
    }

    #[test]
    fn test_integer_equality_modulo_width() {
        let h = heap();
        // 0x1ff and 0xff agree on the low 8 bits.
        let a = make_integral(0x1ff, 8, false).unwrap();
        let b = make_integral(0xff, 8, false).unwrap();
        assert!(equal(&h, a, b));
    }

    #[test]
    fn test_string_equality_and_size() {
        let mut h = heap();
        let a = make_string(&mut h, "abc");
        let b = make_string(&mut h, "abc");
        let c = make_string(&mut h, "abd");
        assert!(equal(&h, a, b));
        assert!(!equal(&h, a, c));
        // Terminating NUL included.
        assert_eq!(size_of(&h, a), 32);
        assert_eq!(elemsof(&h, a), 3);
    }

    #[test]
    fn test_offset_construction_and_equality() {
        let mut h = heap();
        assert!(make_offset(&mut h, Value::int32(8), 0).is_none());
        assert!(make_offset(&mut h, Value::Null, 8).is_none());

        let bytes = make_offset(&mut h, Value::int32(8), 8).unwrap();
        let bits = make_offset(&mut h, Value::int32(64), 1).unwrap();
        // 8 bytes and 64 bits promote to the same quantity.
        assert!(equal(&h, bytes, bits));
        assert!(equal(&h, bytes, bytes));
        assert_eq!(size_of(&h, bytes), 32);
    }

    #[test]
    fn test_array_size_and_elems() {
        let mut h = heap();
        let et = make_integral_type(&mut h, 8, false);
        let at = Value::Ref(h.alloc(Object::Typ(TypeVal::Array {
            bound: Value::Null,
            elem: et,
        })));
        let arr = make_array(&mut h, at);
        let r = arr.as_ref().unwrap();
        for i in 0..3u64 {
            let v = make_integral(i, 8, false).unwrap();
            if let Object::Arr(a) = h.get_mut(r) {
                a.elems.push(Elem {
                    val: v,
                    off: Value::Null,
                    back_off: Value::Null,
                });
            }
        }
        assert_eq!(elemsof(&h, arr), 3);
        assert_eq!(size_of(&h, arr), 24);
    }

    #[test]
    fn test_struct_size_sums_present_fields() {
        let mut h = heap();
        let a = make_string(&mut h, "a");
        let b = make_string(&mut h, "b");
        let sct = make_struct(
            &mut h,
            Value::Null,
            vec![
                make_field(a, make_integral(1, 8, false).unwrap(), Value::Null),
                make_field(b, make_integral(2, 16, false).unwrap(), Value::Null),
                // Absent field does not contribute.
                make_field(Value::Null, Value::Null, Value::Null),
            ],
            Vec::new(),
        );
        assert_eq!(size_of(&h, sct), 24);
        assert_eq!(elemsof(&h, sct), 2);
    }

    #[test]
    fn test_named_struct_types_compare_by_name() {
        let mut h = heap();
        let n1 = make_string(&mut h, "Elf_Hdr");
        let n2 = make_string(&mut h, "Elf_Hdr");
        let n3 = make_string(&mut h, "Other");
        let mk = |h: &mut Heap<Object>, name: Value| {
            Value::Ref(h.alloc(Object::Typ(TypeVal::Struct(StructType {
                name,
                fields: Vec::new(),
                methods: Vec::new(),
                pinned: false,
                union_: false,
                mapper: Value::Null,
                writer: Value::Null,
                constructor: Value::Null,
            }))))
        };
        let t1 = mk(&mut h, n1);
        let t2 = mk(&mut h, n2);
        let t3 = mk(&mut h, n3);
        let anon1 = mk(&mut h, Value::Null);
        let anon2 = mk(&mut h, Value::Null);
        assert!(type_equal(&h, t1, t2));
        assert!(!type_equal(&h, t1, t3));
        // Structurally identical anonymous types stay distinct.
        assert!(!type_equal(&h, anon1, anon2));
    }

    #[test]
    fn test_reloc_ureloc_roundtrip() {
        let mut h = heap();
        let a = make_string(&mut h, "a");
        let b = make_string(&mut h, "b");
        let sct = make_struct(
            &mut h,
            Value::Null,
            vec![
                make_field(a, make_integral(1, 8, false).unwrap(), Value::ulong(0)),
                make_field(b, make_integral(2, 8, false).unwrap(), Value::ulong(8)),
            ],
            Vec::new(),
        );
        let r = sct.as_ref().unwrap();
        if let Object::Sct(s) = h.get_mut(r) {
            s.map.mapped = true;
            s.map.ios = Value::int32(1);
            s.map.offset = Value::ulong(0);
        }

        reloc(&mut h, sct, Value::int32(2), 16);
        if let Object::Sct(s) = h.get(r) {
            assert!(s.map.mapped);
            assert_eq!(s.map.ios, Value::int32(2));
            assert_eq!(s.map.offset, Value::ulong(16));
            assert_eq!(s.fields[0].off, Value::ulong(16));
            assert_eq!(s.fields[1].off, Value::ulong(24));
            assert!(s.fields.iter().all(|f| f.modified));
        } else {
            panic!("not a struct");
        }

        ureloc(&mut h, sct);
        if let Object::Sct(s) = h.get(r) {
            assert!(s.map.mapped);
            assert_eq!(s.map.ios, Value::int32(1));
            assert_eq!(s.map.offset, Value::ulong(0));
            assert_eq!(s.fields[0].off, Value::ulong(0));
            assert_eq!(s.fields[1].off, Value::ulong(8));
        } else {
            panic!("not a struct");
        }
    }

    #[test]
    fn test_unmap_recurses() {
        let mut h = heap();
        let et = make_integral_type(&mut h, 8, false);
        let at = Value::Ref(h.alloc(Object::Typ(TypeVal::Array {
            bound: Value::Null,
            elem: et,
        })));
        let inner = make_array(&mut h, at);
        if let Object::Arr(a) = h.get_mut(inner.as_ref().unwrap()) {
            a.map.mapped = true;
        }
        let outer = make_array(&mut h, at);
        if let Object::Arr(a) = h.get_mut(outer.as_ref().unwrap()) {
            a.map.mapped = true;
            a.elems.push(Elem {
                val: inner,
                off: Value::Null,
                back_off: Value::Null,
            });
        }

        unmap(&mut h, outer);
        for v in [outer, inner] {
            if let Object::Arr(a) = h.get(v.as_ref().unwrap()) {
                assert!(!a.map.mapped);
            }
        }
    }
}
