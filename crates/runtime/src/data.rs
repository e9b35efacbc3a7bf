//! Composite-value instructions and structural IO
//!
//! This is the second half of the dispatch: arrays, structs, type
//! construction, default construction, mapping and write-back, the
//! mapping-info accessors and the IO-space instructions.
//!
//! Mapping is structural by default: integrals, strings, offsets, arrays
//! and structs are read field by field honouring labels, per-field
//! endianness, optional-field conditions and constraints. A struct type
//! can override the structural paths with mapper/writer closures; those
//! run through the VM's re-entrant closure call.

use jab_core::heap::{GcRef, Heap};

use crate::exception::{
    exception_code, EC_CONSTRAINT, EC_CONV, EC_ELEM, EC_EOF, EC_INVAL, EC_IO, EC_MAP,
    EC_MAP_BOUNDS, EC_NO_IOS, EC_OUT_OF_BOUNDS,
};
use crate::program::Insn;
use crate::value::{
    elemsof, make_array, make_field, make_integral, make_offset, make_string, make_struct,
    size_of, type_equal, ArrayVal, Elem, Field, MapInfo, Method, Object, StructType,
    StructTypeField, TypeVal, Value,
};
use crate::vm::{Ctl, Vm};

use jab_core::bits::Endian;

/// Hard guard against runaway gap-filling inserts.
const AINS_GAP_LIMIT: u64 = 1024;

fn minfo(heap: &mut Heap<Object>, r: GcRef) -> &mut MapInfo {
    match heap.get_mut(r) {
        Object::Arr(a) => &mut a.map,
        Object::Sct(s) => &mut s.map,
        _ => panic!("minfo on a non-mappable object"),
    }
}

impl Vm {
    pub(crate) fn step_data(&mut self, insn: Insn) -> Result<(), Ctl> {
        match insn {
            // -- arrays ----------------------------------------------------
            Insn::Mka => {
                let n = self.pop_count("array size must be integral")?;
                let typ = self.pop()?;
                let arr = make_array(&mut self.heap, typ);
                if let Some(r) = arr.as_ref() {
                    if let Object::Arr(a) = self.heap.get_mut(r) {
                        a.elems.reserve(n as usize);
                    }
                }
                self.stack.push(arr);
            }
            Insn::Ains => {
                let v = self.pop()?;
                let i = self.pop_count("array index must be integral")?;
                let arr = self.pop()?;
                let r = self.array_ref(arr)?;
                let len = match self.heap.get(r) {
                    Object::Arr(a) => a.elems.len() as u64,
                    _ => 0,
                };
                if i > len + AINS_GAP_LIMIT {
                    return Err(self.ex(EC_OUT_OF_BOUNDS, "insertion too far past the end"));
                }
                let elem = Elem {
                    val: v,
                    off: Value::Null,
                    back_off: Value::Null,
                };
                if let Object::Arr(a) = self.heap.get_mut(r) {
                    if i >= len {
                        // Fill the gap with copies, as insertion past the
                        // end extends the array.
                        while (a.elems.len() as u64) <= i {
                            a.elems.push(elem);
                        }
                    } else {
                        a.elems.insert(i as usize, elem);
                    }
                }
                self.stack.push(arr);
            }
            Insn::Aref => {
                let i = self.pop_count("array index must be integral")?;
                let arr = self.pop()?;
                let r = self.array_ref(arr)?;
                let v = match self.heap.get(r) {
                    Object::Arr(a) => a.elems.get(i as usize).map(|e| e.val),
                    _ => None,
                };
                match v {
                    Some(v) => self.stack.push(v),
                    None => return Err(self.ex(EC_OUT_OF_BOUNDS, "array index out of bounds")),
                }
            }
            Insn::Arefo => {
                let i = self.pop_count("array index must be integral")?;
                let arr = self.pop()?;
                let r = self.array_ref(arr)?;
                let bits = match self.heap.get(r) {
                    Object::Arr(a) => {
                        if i as usize >= a.elems.len() {
                            None
                        } else {
                            match a.elems[i as usize].off.as_u64() {
                                Some(o) => Some(o),
                                // Unmapped: the layout offset is the sum
                                // of the preceding element sizes.
                                None => Some(
                                    a.elems[..i as usize]
                                        .iter()
                                        .map(|e| size_of(&self.heap, e.val))
                                        .sum(),
                                ),
                            }
                        }
                    }
                    _ => None,
                };
                match bits {
                    Some(b) => {
                        let o = self.bits_offset(b);
                        self.stack.push(o);
                    }
                    None => return Err(self.ex(EC_OUT_OF_BOUNDS, "array index out of bounds")),
                }
            }
            Insn::Aset => {
                let v = self.pop()?;
                let i = self.pop_count("array index must be integral")?;
                let arr = self.pop()?;
                let r = self.array_ref(arr)?;
                let ok = match self.heap.get_mut(r) {
                    Object::Arr(a) => match a.elems.get_mut(i as usize) {
                        Some(e) => {
                            e.val = v;
                            true
                        }
                        None => false,
                    },
                    _ => false,
                };
                if !ok {
                    return Err(self.ex(EC_OUT_OF_BOUNDS, "array index out of bounds"));
                }
                self.stack.push(arr);
            }
            Insn::Atrim => {
                let hi = self.pop_count("trim bound must be integral")?;
                let lo = self.pop_count("trim bound must be integral")?;
                let arr = self.pop()?;
                // Strings trim to substrings.
                if let Some(sr) = arr.as_ref() {
                    if let Object::Str(s) = self.heap.get(sr) {
                        if lo > hi || hi > s.len() as u64 {
                            return Err(self.ex(EC_OUT_OF_BOUNDS, "trim out of bounds"));
                        }
                        let sub = s[lo as usize..hi as usize].to_string();
                        let v = make_string(&mut self.heap, sub);
                        self.stack.push(v);
                        return Ok(());
                    }
                }
                let r = self.array_ref(arr)?;
                let (atype, elems) = match self.heap.get(r) {
                    Object::Arr(a) => {
                        if lo > hi || hi > a.elems.len() as u64 {
                            (Value::Null, None)
                        } else {
                            let taken: Vec<Elem> = a.elems[lo as usize..hi as usize]
                                .iter()
                                .map(|e| Elem {
                                    val: e.val,
                                    off: Value::Null,
                                    back_off: Value::Null,
                                })
                                .collect();
                            (a.atype, Some(taken))
                        }
                    }
                    _ => (Value::Null, None),
                };
                match elems {
                    Some(elems) => {
                        let trimmed = self.alloc(Object::Arr(ArrayVal {
                            atype,
                            elems,
                            map: MapInfo::default(),
                        }));
                        self.stack.push(trimmed);
                    }
                    None => return Err(self.ex(EC_OUT_OF_BOUNDS, "trim out of bounds")),
                }
            }
            Insn::Aconc => {
                let b = self.pop()?;
                let a = self.pop()?;
                let (ra, rb) = (self.array_ref(a)?, self.array_ref(b)?);
                let (ta, tb) = {
                    let ea = match self.heap.get(ra) {
                        Object::Arr(x) => crate::value::array_elem_type(&self.heap, x),
                        _ => Value::Null,
                    };
                    let eb = match self.heap.get(rb) {
                        Object::Arr(x) => crate::value::array_elem_type(&self.heap, x),
                        _ => Value::Null,
                    };
                    (ea, eb)
                };
                if !type_equal(&self.heap, ta, tb) {
                    return Err(self.ex(EC_CONV, "concatenation of unlike arrays"));
                }
                let mut elems: Vec<Elem> = Vec::new();
                for r in [ra, rb] {
                    if let Object::Arr(x) = self.heap.get(r) {
                        elems.extend(x.elems.iter().map(|e| Elem {
                            val: e.val,
                            off: Value::Null,
                            back_off: Value::Null,
                        }));
                    }
                }
                let atype = self.alloc(Object::Typ(TypeVal::Array {
                    bound: Value::Null,
                    elem: ta,
                }));
                let out = self.alloc(Object::Arr(ArrayVal {
                    atype,
                    elems,
                    map: MapInfo::default(),
                }));
                self.stack.push(out);
            }
            Insn::Afill => {
                let v = self.pop()?;
                let arr = self.pop()?;
                let r = self.array_ref(arr)?;
                if let Object::Arr(a) = self.heap.get_mut(r) {
                    for e in &mut a.elems {
                        e.val = v;
                    }
                }
                self.stack.push(arr);
            }
            Insn::ArrConvSel => {
                let n = self.pop_count("conversion bound must be integral")?;
                let arr = self.pop()?;
                if elemsof(&self.heap, arr) != n {
                    return Err(self.ex(EC_CONV, "array does not have the expected length"));
                }
                self.stack.push(arr);
            }
            Insn::ArrConvSiz => {
                let bound = self.pop()?;
                let bits = self.bits_of(bound)?;
                let arr = self.pop()?;
                if size_of(&self.heap, arr) != bits {
                    return Err(self.ex(EC_CONV, "array does not have the expected size"));
                }
                self.stack.push(arr);
            }

            // -- structs ---------------------------------------------------
            Insn::Mksct { nfields, nmethods } => {
                let mut methods = Vec::with_capacity(nmethods as usize);
                for _ in 0..nmethods {
                    let closure = self.pop()?;
                    let name = self.pop()?;
                    methods.push(Method { name, closure });
                }
                methods.reverse();
                let mut fields = Vec::with_capacity(nfields as usize);
                for _ in 0..nfields {
                    let val = self.pop()?;
                    let off = self.pop()?;
                    let name = self.pop()?;
                    fields.push(make_field(name, val, off));
                }
                fields.reverse();
                let stype = self.pop()?;
                let sct = make_struct(&mut self.heap, stype, fields, methods);
                self.stack.push(sct);
            }
            Insn::Sref => {
                let name = self.pop_str()?;
                let sct = self.pop()?;
                let r = self.struct_ref(sct)?;
                let v = match self.heap.get(r) {
                    Object::Sct(s) => s
                        .field_index(&self.heap, &name)
                        .map(|i| s.fields[i].val),
                    _ => None,
                };
                match v {
                    Some(v) => self.stack.push(v),
                    None => return Err(self.ex(EC_ELEM, "no such field")),
                }
            }
            Insn::Srefo => {
                let name = self.pop_str()?;
                let sct = self.pop()?;
                let r = self.struct_ref(sct)?;
                let bits = match self.heap.get(r) {
                    Object::Sct(s) => s.field_index(&self.heap, &name).map(|i| {
                        match s.fields[i].off.as_u64() {
                            Some(o) => o,
                            None => s.fields[..i]
                                .iter()
                                .filter(|f| !f.name.is_null())
                                .map(|f| size_of(&self.heap, f.val))
                                .sum(),
                        }
                    }),
                    _ => None,
                };
                match bits {
                    Some(b) => {
                        let o = self.bits_offset(b);
                        self.stack.push(o);
                    }
                    None => return Err(self.ex(EC_ELEM, "no such field")),
                }
            }
            Insn::Sset => {
                self.struct_set(false)?;
            }
            Insn::SsetC => {
                self.struct_set(true)?;
            }
            Insn::Smeth => {
                let name = self.pop_str()?;
                let sct = self.pop()?;
                let r = self.struct_ref(sct)?;
                let m = match self.heap.get(r) {
                    Object::Sct(s) => s.method(&self.heap, &name),
                    _ => None,
                };
                match m {
                    Some(m) => self.stack.push(m),
                    None => return Err(self.ex(EC_ELEM, "no such method")),
                }
            }
            Insn::Sck => {
                let sct = self.peek_value()?;
                let r = self.struct_ref(sct)?;
                let checks: Vec<Value> = {
                    let tfields = self.struct_type_fields(r);
                    let present: Vec<bool> = match self.heap.get(r) {
                        Object::Sct(s) => s.fields.iter().map(|f| !f.name.is_null()).collect(),
                        _ => Vec::new(),
                    };
                    tfields
                        .iter()
                        .enumerate()
                        .filter(|(i, tf)| {
                            !tf.check.is_null() && present.get(*i).copied().unwrap_or(false)
                        })
                        .map(|(_, tf)| tf.check)
                        .collect()
                };
                for chk in checks {
                    self.call_closure(chk, &[sct])?;
                }
            }

            // -- types -----------------------------------------------------
            Insn::Typof => {
                let v = self.pop()?;
                let t = self.type_of(v);
                self.stack.push(t);
            }
            Insn::Isa => {
                let typ = self.pop()?;
                let v = self.pop()?;
                let is_any = matches!(
                    typ.as_ref().map(|r| self.heap.get(r)),
                    Some(Object::Typ(TypeVal::Any))
                );
                let vt = self.type_of(v);
                let r = is_any || type_equal(&self.heap, vt, typ);
                self.stack.push(Value::int32(r as i32));
            }
            Insn::Mkit => {
                let signed = self.pop_count("signedness flag must be integral")? != 0;
                let size = self.pop_count("type width must be integral")?;
                if size == 0 || size > 64 {
                    return Err(self.ex(EC_INVAL, "integral type width out of range"));
                }
                let t = self.itype(size as u32, signed);
                self.stack.push(t);
            }
            Insn::Mkat => {
                let bounder = self.pop()?;
                let bound = self.pop()?;
                let elem = self.pop()?;
                let bound = if bounder.is_null() { bound } else { bounder };
                let t = self.alloc(Object::Typ(TypeVal::Array { bound, elem }));
                self.stack.push(t);
            }
            Insn::Mkot => {
                let unit = self.pop_count("offset unit must be integral")?;
                let base = self.pop()?;
                if unit == 0 {
                    return Err(self.ex(EC_INVAL, "offset unit must be positive"));
                }
                let t = self.alloc(Object::Typ(TypeVal::Offset { base, unit }));
                self.stack.push(t);
            }
            Insn::Mkst {
                nfields,
                nmethods,
                pinned,
                union_,
            } => {
                let mut methods = Vec::with_capacity(nmethods as usize);
                for _ in 0..nmethods {
                    let closure = self.pop()?;
                    let name = self.pop()?;
                    methods.push(Method { name, closure });
                }
                methods.reverse();
                let mut fields = Vec::with_capacity(nfields as usize);
                for _ in 0..nfields {
                    let endian = match self.pop()?.as_u64() {
                        Some(1) => Some(Endian::Little),
                        Some(2) => Some(Endian::Big),
                        _ => None,
                    };
                    let optcond = self.pop()?;
                    let init = self.pop()?;
                    let check = self.pop()?;
                    let label = self.pop()?;
                    let ftype = self.pop()?;
                    let name = self.pop()?;
                    fields.push(StructTypeField {
                        name,
                        ftype,
                        label,
                        check,
                        init,
                        optcond,
                        endian,
                    });
                }
                fields.reverse();
                let name = self.pop()?;
                let t = self.alloc(Object::Typ(TypeVal::Struct(StructType {
                    name,
                    fields,
                    methods,
                    pinned,
                    union_,
                    mapper: Value::Null,
                    writer: Value::Null,
                    constructor: Value::Null,
                })));
                self.stack.push(t);
            }
            Insn::Cons => {
                let typ = self.pop()?;
                let v = self.cons_value(typ)?;
                self.stack.push(v);
            }

            // -- mapping ---------------------------------------------------
            Insn::Map { strict } => {
                let off = self.pop()?;
                let bits = self.bits_of(off)?;
                let ios = self.pop()?;
                let id = self.ios_id(ios)?;
                let typ = self.pop()?;
                let (v, _) = self.map_value(typ, id, bits, strict)?;
                self.stack.push(v);
            }
            Insn::Remap => {
                let v = self.peek_value()?;
                self.remap_value(v)?;
            }
            Insn::WriteV => {
                let v = self.peek_value()?;
                self.write_value(v)?;
            }
            Insn::UnmapV => {
                let v = self.peek_value()?;
                crate::value::unmap(&mut self.heap, v);
            }
            Insn::Poke => {
                let off = self.pop()?;
                let bits = self.bits_of(off)?;
                let ios = self.pop()?;
                let id = self.ios_id(ios)?;
                let v = self.pop()?;
                self.write_at(v, id, bits)?;
            }

            // -- mapping info accessors ------------------------------------
            Insn::Mm => {
                let v = self.peek_value()?;
                let r = self.mappable_ref(v)?;
                let m = minfo(&mut self.heap, r).mapped;
                self.stack.push(Value::int32(m as i32));
            }
            Insn::Mgeto => self.map_get(|m| m.offset)?,
            Insn::Mseto => {
                let x = self.pop()?;
                let bits = self.bits_of(x)?;
                self.map_set(|m| m.offset = Value::ulong(bits))?;
            }
            Insn::Mgetios => self.map_get(|m| m.ios)?,
            Insn::Msetios => {
                let x = self.pop()?;
                self.map_set(|m| m.ios = x)?;
            }
            Insn::Mgetm => self.map_get(|m| m.mapper)?,
            Insn::Msetm => {
                let x = self.pop()?;
                self.map_set(|m| m.mapper = x)?;
            }
            Insn::Mgetw => self.map_get(|m| m.writer)?,
            Insn::Msetw => {
                let x = self.pop()?;
                self.map_set(|m| m.writer = x)?;
            }
            Insn::Mgets => self.map_get(|m| Value::int32(m.strict as i32))?,
            Insn::Msets => {
                let x = self.pop()?;
                let strict = x.as_i64().unwrap_or(0) != 0;
                self.map_set(|m| m.strict = strict)?;
            }
            Insn::Mgetsel => self.map_get(|m| m.sel)?,
            Insn::Msetsel => {
                let x = self.pop()?;
                self.map_set(|m| m.sel = x)?;
            }
            Insn::Mgetsiz => self.map_get(|m| m.siz)?,
            Insn::Msetsiz => {
                let x = self.pop()?;
                self.map_set(|m| m.siz = x)?;
            }

            // -- IO spaces -------------------------------------------------
            Insn::Open => {
                let flags = self.pop_count("open flags must be integral")?;
                let handler = self.pop_str()?;
                match self.ios.open(&handler, flags as u32, false) {
                    Ok(id) => self.stack.push(Value::Int { v: id, size: 32 }),
                    Err(e) => {
                        let msg = e.to_string();
                        return Err(self.ex(EC_IO, &msg));
                    }
                }
            }
            Insn::CloseIos => {
                let id = self.pop_ios_id()?;
                if let Err(e) = self.ios.close(id) {
                    let msg = e.to_string();
                    return Err(self.ex(EC_IO, &msg));
                }
            }
            Insn::IosCur => match self.ios.cur() {
                Some(id) => self.stack.push(Value::Int { v: id, size: 32 }),
                None => self.stack.push(Value::Null),
            },
            Insn::IosSetCur => {
                let id = self.pop_ios_id()?;
                if let Err(e) = self.ios.set_cur(id) {
                    let msg = e.to_string();
                    return Err(self.ex(EC_IO, &msg));
                }
            }
            Insn::IosSearch => {
                let handler = self.pop_str()?;
                match self.ios.search(&handler) {
                    Some(id) => self.stack.push(Value::Int { v: id, size: 32 }),
                    None => self.stack.push(Value::Null),
                }
            }
            Insn::IosHandler => {
                let id = self.pop_ios_id()?;
                match self.ios.handler(id) {
                    Ok(h) => {
                        let s = h.to_string();
                        let v = make_string(&mut self.heap, s);
                        self.stack.push(v);
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        return Err(self.ex(EC_IO, &msg));
                    }
                }
            }
            Insn::IosSize => {
                let id = self.pop_ios_id()?;
                match self.ios.size(id) {
                    Ok(bytes) => {
                        let mag = Value::ulong(bytes);
                        match make_offset(&mut self.heap, mag, 8) {
                            Some(o) => self.stack.push(o),
                            None => self.stack.push(Value::Null),
                        }
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        return Err(self.ex(EC_IO, &msg));
                    }
                }
            }

            // -- printing --------------------------------------------------
            Insn::Print => {
                let v = self.pop()?;
                let s = self.fmt_val(v, 0)?;
                self.out.push_str(&s);
            }
            Insn::Prints => {
                let s = self.pop_str()?;
                self.out.push_str(&s);
            }

            Insn::Sel => {
                let v = self.peek_value()?;
                let n = elemsof(&self.heap, v);
                self.stack.push(Value::ulong(n));
            }
            Insn::Siz => {
                let v = self.peek_value()?;
                let bits = size_of(&self.heap, v);
                let o = self.bits_offset(bits);
                self.stack.push(o);
            }
            Insn::Nop => {}

            other => {
                let msg = format!("unimplemented instruction '{}'", other.name());
                return Err(self.ex(EC_INVAL, &msg));
            }
        }
        Ok(())
    }

    // -- small helpers -----------------------------------------------------

    fn peek_value(&mut self) -> Result<Value, Ctl> {
        match self.stack.last() {
            Some(v) => Ok(*v),
            None => Err(self.ex(EC_INVAL, "stack underflow")),
        }
    }

    fn pop_count(&mut self, what: &str) -> Result<u64, Ctl> {
        let v = self.pop()?;
        match v.as_u64() {
            Some(n) => Ok(n),
            None => Err(self.ex(EC_INVAL, what)),
        }
    }

    fn pop_ios_id(&mut self) -> Result<i32, Ctl> {
        let v = self.pop()?;
        self.ios_id(v)
    }

    /// IO space id from a value: `Null` selects the current space.
    fn ios_id(&mut self, v: Value) -> Result<i32, Ctl> {
        if v.is_null() {
            match self.ios.cur() {
                Some(id) => Ok(id),
                None => Err(self.ex(EC_NO_IOS, "no current IO space")),
            }
        } else {
            match v.as_i64() {
                Some(id) => Ok(id as i32),
                None => Err(self.ex(EC_INVAL, "IO space id must be integral")),
            }
        }
    }

    fn array_ref(&mut self, v: Value) -> Result<GcRef, Ctl> {
        match v.as_ref() {
            Some(r) if matches!(self.heap.get(r), Object::Arr(_)) => Ok(r),
            _ => Err(self.ex(EC_INVAL, "expected an array")),
        }
    }

    fn struct_ref(&mut self, v: Value) -> Result<GcRef, Ctl> {
        match v.as_ref() {
            Some(r) if matches!(self.heap.get(r), Object::Sct(_)) => Ok(r),
            _ => Err(self.ex(EC_INVAL, "expected a struct")),
        }
    }

    fn mappable_ref(&mut self, v: Value) -> Result<GcRef, Ctl> {
        match v.as_ref() {
            Some(r) if matches!(self.heap.get(r), Object::Arr(_) | Object::Sct(_)) => Ok(r),
            _ => Err(self.ex(EC_INVAL, "value is not mappable")),
        }
    }

    fn map_get(&mut self, f: impl FnOnce(&MapInfo) -> Value) -> Result<(), Ctl> {
        let v = self.peek_value()?;
        let r = self.mappable_ref(v)?;
        let x = f(minfo(&mut self.heap, r));
        self.stack.push(x);
        Ok(())
    }

    fn map_set(&mut self, f: impl FnOnce(&mut MapInfo)) -> Result<(), Ctl> {
        let v = self.peek_value()?;
        let r = self.mappable_ref(v)?;
        f(minfo(&mut self.heap, r));
        Ok(())
    }

    /// A bit quantity as an offset value with unit 1.
    pub(crate) fn bits_offset(&mut self, bits: u64) -> Value {
        let mag = Value::ulong(bits);
        make_offset(&mut self.heap, mag, 1).unwrap_or(Value::Null)
    }

    /// Type fields of a struct value's type, copied out.
    fn struct_type_fields(&self, r: GcRef) -> Vec<StructTypeField> {
        let stype = match self.heap.get(r) {
            Object::Sct(s) => s.stype,
            _ => Value::Null,
        };
        match stype.as_ref().map(|tr| self.heap.get(tr)) {
            Some(Object::Typ(TypeVal::Struct(st))) => st.fields.clone(),
            _ => Vec::new(),
        }
    }

    /// Shared body of `sset`/`ssetc`.
    fn struct_set(&mut self, checked: bool) -> Result<(), Ctl> {
        let v = self.pop()?;
        let name = self.pop_str()?;
        let sct = self.pop()?;
        let r = self.struct_ref(sct)?;
        let idx = match self.heap.get(r) {
            Object::Sct(s) => s.field_index(&self.heap, &name),
            _ => None,
        };
        let idx = match idx {
            Some(i) => i,
            None => return Err(self.ex(EC_ELEM, "no such field")),
        };
        let old = match self.heap.get_mut(r) {
            Object::Sct(s) => {
                let f = &mut s.fields[idx];
                let old = f.val;
                f.back_val = old;
                f.val = v;
                f.modified = true;
                old
            }
            _ => Value::Null,
        };
        if checked {
            let chk = self
                .struct_type_fields(r)
                .iter()
                .find(|tf| match tf.name.as_ref() {
                    Some(nr) => self.heap.get(nr).as_str() == Some(name.as_str()),
                    None => false,
                })
                .map(|tf| tf.check)
                .unwrap_or(Value::Null);
            if !chk.is_null() {
                if let Err(ctl) = self.call_closure(chk, &[sct]) {
                    // Constraint failed: restore the previous value, then
                    // let the exception continue.
                    if let Object::Sct(s) = self.heap.get_mut(r) {
                        s.fields[idx].val = old;
                    }
                    return Err(ctl);
                }
            }
        }
        self.stack.push(sct);
        Ok(())
    }

    // -- default construction ----------------------------------------------

    /// Default-construct a value of `typ`.
    pub(crate) fn cons_value(&mut self, typ: Value) -> Result<Value, Ctl> {
        let tr = match typ.as_ref() {
            Some(tr) => tr,
            None => return Err(self.ex(EC_INVAL, "construction of a non-type")),
        };
        enum Plan {
            Int { size: u32, signed: bool },
            Str,
            Null,
            Off { base: Value, unit: u64 },
            Arr { bound: Value, elem: Value },
            Sct {
                fields: Vec<StructTypeField>,
                methods: Vec<Method>,
                constructor: Value,
            },
        }
        let plan = match self.heap.get(tr) {
            Object::Typ(TypeVal::Integral { size, signed }) => Plan::Int {
                size: *size as u32,
                signed: *signed,
            },
            Object::Typ(TypeVal::StringT) => Plan::Str,
            Object::Typ(TypeVal::Void) | Object::Typ(TypeVal::Any) => Plan::Null,
            Object::Typ(TypeVal::Function { .. }) => Plan::Null,
            Object::Typ(TypeVal::Offset { base, unit }) => Plan::Off {
                base: *base,
                unit: *unit,
            },
            Object::Typ(TypeVal::Array { bound, elem }) => Plan::Arr {
                bound: *bound,
                elem: *elem,
            },
            Object::Typ(TypeVal::Struct(st)) => Plan::Sct {
                fields: st.fields.clone(),
                methods: st.methods.clone(),
                constructor: st.constructor,
            },
            _ => return Err(self.ex(EC_INVAL, "construction of a non-type")),
        };
        match plan {
            Plan::Int { size, signed } => {
                Ok(make_integral(0, size, signed).unwrap_or(Value::Null))
            }
            Plan::Str => Ok(make_string(&mut self.heap, "")),
            Plan::Null => Ok(Value::Null),
            Plan::Off { base, unit } => {
                let mag = self.cons_value(base)?;
                Ok(make_offset(&mut self.heap, mag, unit).unwrap_or(Value::Null))
            }
            Plan::Arr { bound, elem } => {
                let n = bound.as_u64().unwrap_or(0);
                let mut elems = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let v = self.cons_value(elem)?;
                    elems.push(Elem {
                        val: v,
                        off: Value::Null,
                        back_off: Value::Null,
                    });
                }
                Ok(self.alloc(Object::Arr(ArrayVal {
                    atype: typ,
                    elems,
                    map: MapInfo::default(),
                })))
            }
            Plan::Sct {
                fields: tfields,
                methods,
                constructor,
            } => {
                if !constructor.is_null() {
                    return self.call_closure(constructor, &[]);
                }
                let mut fields: Vec<Field> = Vec::with_capacity(tfields.len());
                for tf in &tfields {
                    let val = if !tf.init.is_null() {
                        // Initializers see the fields built so far.
                        let partial =
                            make_struct(&mut self.heap, typ, fields.clone(), Vec::new());
                        self.call_closure(tf.init, &[partial])?
                    } else {
                        self.cons_value(tf.ftype)?
                    };
                    fields.push(make_field(tf.name, val, Value::Null));
                }
                Ok(make_struct(&mut self.heap, typ, fields, methods))
            }
        }
    }

    // -- structural mapping ------------------------------------------------

    /// Map a value of `typ` at bit offset `off` of space `ios`. Returns
    /// the value and the number of bits consumed.
    pub(crate) fn map_value(
        &mut self,
        typ: Value,
        ios: i32,
        off: u64,
        strict: bool,
    ) -> Result<(Value, u64), Ctl> {
        let tr = match typ.as_ref() {
            Some(tr) => tr,
            None => return Err(self.ex(EC_MAP, "mapping of a non-type")),
        };
        enum Plan {
            Int { size: u32, signed: bool },
            Str,
            Off { base: Value, unit: u64 },
            Arr { bound: Value, elem: Value },
            Sct(Box<SctPlan>),
        }
        struct SctPlan {
            fields: Vec<StructTypeField>,
            methods: Vec<Method>,
            pinned: bool,
            union_: bool,
            mapper: Value,
        }
        let plan = match self.heap.get(tr) {
            Object::Typ(TypeVal::Integral { size, signed }) => Plan::Int {
                size: *size as u32,
                signed: *signed,
            },
            Object::Typ(TypeVal::StringT) => Plan::Str,
            Object::Typ(TypeVal::Offset { base, unit }) => Plan::Off {
                base: *base,
                unit: *unit,
            },
            Object::Typ(TypeVal::Array { bound, elem }) => Plan::Arr {
                bound: *bound,
                elem: *elem,
            },
            Object::Typ(TypeVal::Struct(st)) => Plan::Sct(Box::new(SctPlan {
                fields: st.fields.clone(),
                methods: st.methods.clone(),
                pinned: st.pinned,
                union_: st.union_,
                mapper: st.mapper,
            })),
            _ => return Err(self.ex(EC_MAP, "type cannot be mapped")),
        };
        match plan {
            Plan::Int { size, signed } => {
                let v = self.read_integral(ios, off, size, signed)?;
                Ok((v, size as u64))
            }
            Plan::Str => {
                let mut bytes = Vec::new();
                let mut cur = off;
                loop {
                    let b = self.read_raw(ios, cur, 8)?;
                    cur += 8;
                    if b == 0 {
                        break;
                    }
                    bytes.push(b as u8);
                }
                let s = String::from_utf8_lossy(&bytes).into_owned();
                let v = make_string(&mut self.heap, s);
                Ok((v, cur - off))
            }
            Plan::Off { base, unit } => {
                let (mag, sz) = self.map_value(base, ios, off, strict)?;
                let v = make_offset(&mut self.heap, mag, unit).unwrap_or(Value::Null);
                Ok((v, sz))
            }
            Plan::Arr { bound, elem } => self.map_array(typ, bound, elem, ios, off, strict),
            Plan::Sct(p) => {
                if !p.mapper.is_null() {
                    let ios_v = Value::Int { v: ios, size: 32 };
                    let off_v = self.bits_offset(off);
                    let v = self.call_closure(p.mapper, &[ios_v, off_v])?;
                    let sz = size_of(&self.heap, v);
                    Ok((v, sz))
                } else {
                    self.map_struct(typ, &p.fields, &p.methods, p.pinned, p.union_, ios, off, strict)
                }
            }
        }
    }

    fn read_raw(&mut self, ios: i32, off: u64, size: u32) -> Result<u64, Ctl> {
        let endian = self.knobs.endian;
        match self.ios.read_bits(ios, off, size, endian) {
            Ok(raw) => Ok(raw),
            Err(e) => {
                let msg = e.to_string();
                Err(self.ex(EC_EOF, &msg))
            }
        }
    }

    fn read_integral(&mut self, ios: i32, off: u64, size: u32, signed: bool) -> Result<Value, Ctl> {
        let raw = self.read_raw(ios, off, size)?;
        let bits = if signed {
            jab_core::bits::decode_signed(raw, size, self.knobs.nenc) as u64
        } else {
            raw
        };
        Ok(make_integral(bits, size, signed).unwrap_or(Value::Null))
    }

    fn map_array(
        &mut self,
        atype: Value,
        bound: Value,
        elem: Value,
        ios: i32,
        off: u64,
        strict: bool,
    ) -> Result<(Value, u64), Ctl> {
        // Resolve a bounder closure first; it yields a count or a size.
        let bound = if matches!(
            bound.as_ref().map(|r| self.heap.get(r)),
            Some(Object::Cls(_))
        ) {
            self.call_closure(bound, &[])?
        } else {
            bound
        };
        let count_bound = if bound.is_integral() { bound.as_u64() } else { None };
        let size_bound = match bound.as_ref().map(|r| self.heap.get(r)) {
            Some(Object::Off(o)) => {
                let b = o.in_bits();
                if b < 0 {
                    return Err(self.ex(EC_MAP_BOUNDS, "negative array size bound"));
                }
                Some(b as u64)
            }
            _ => None,
        };

        let mut elems = Vec::new();
        let mut consumed = 0u64;
        loop {
            if let Some(n) = count_bound {
                if elems.len() as u64 >= n {
                    break;
                }
            }
            if let Some(limit) = size_bound {
                if consumed >= limit {
                    break;
                }
            }
            match self.map_value(elem, ios, off + consumed, strict) {
                Ok((v, sz)) => {
                    elems.push(Elem {
                        val: v,
                        off: Value::ulong(off + consumed),
                        back_off: Value::Null,
                    });
                    consumed += sz;
                }
                Err(Ctl::Ex(e))
                    if count_bound.is_none()
                        && size_bound.is_none()
                        && exception_code(&self.heap, e) == EC_EOF =>
                {
                    // Unbounded arrays map until the space runs out.
                    break;
                }
                Err(other) => return Err(other),
            }
        }
        if let Some(limit) = size_bound {
            if consumed != limit {
                return Err(self.ex(EC_MAP_BOUNDS, "array does not fill its size bound"));
            }
        }

        let arr = self.alloc(Object::Arr(ArrayVal {
            atype,
            elems,
            map: MapInfo {
                mapped: true,
                strict,
                ios: Value::Int { v: ios, size: 32 },
                offset: Value::ulong(off),
                sel: count_bound.map(Value::ulong).unwrap_or(Value::Null),
                siz: size_bound.map(Value::ulong).unwrap_or(Value::Null),
                ..MapInfo::default()
            },
        }));
        Ok((arr, consumed))
    }

    #[allow(clippy::too_many_arguments)]
    fn map_struct(
        &mut self,
        stype: Value,
        tfields: &[StructTypeField],
        methods: &[Method],
        pinned: bool,
        union_: bool,
        ios: i32,
        off: u64,
        strict: bool,
    ) -> Result<(Value, u64), Ctl> {
        let mut fields: Vec<Field> = Vec::with_capacity(tfields.len());
        let mut extent = 0u64;

        if union_ {
            // Alternatives are tried in order; the first that maps and
            // satisfies its constraint is the present one.
            for k in 0..tfields.len() {
                match self.map_union_alt(stype, tfields, k, ios, off, strict) {
                    Ok((field, sz)) => {
                        for j in 0..tfields.len() {
                            if j == k {
                                fields.push(field);
                            } else {
                                fields.push(make_field(Value::Null, Value::Null, Value::Null));
                            }
                        }
                        extent = sz;
                        break;
                    }
                    Err(Ctl::Ex(e))
                        if matches!(
                            exception_code(&self.heap, e),
                            EC_CONSTRAINT | EC_EOF | EC_MAP_BOUNDS
                        ) => {}
                    Err(other) => return Err(other),
                }
            }
            if fields.is_empty() {
                return Err(self.ex(EC_CONSTRAINT, "no alternative of the union matched"));
            }
        } else {
            let mut running = 0u64;
            for tf in tfields {
                // Optional-field condition, over the fields mapped so far.
                if !tf.optcond.is_null() {
                    let partial =
                        make_struct(&mut self.heap, stype, fields.clone(), Vec::new());
                    let verdict = self.call_closure(tf.optcond, &[partial])?;
                    if verdict.as_i64() == Some(0) {
                        fields.push(make_field(Value::Null, Value::Null, Value::Null));
                        continue;
                    }
                }
                let rel = if pinned {
                    0
                } else {
                    self.field_label_bits(tf, stype, &fields)?.unwrap_or(running)
                };
                let foff = off + rel;
                let (val, sz) = self.map_field_value(tf, ios, foff, strict)?;
                fields.push(Field {
                    name: tf.name,
                    val,
                    off: Value::ulong(foff),
                    modified: false,
                    back_val: Value::Null,
                    back_off: Value::Null,
                });
                if strict && !tf.check.is_null() {
                    let partial =
                        make_struct(&mut self.heap, stype, fields.clone(), Vec::new());
                    self.call_closure(tf.check, &[partial])?;
                }
                running = rel + sz;
                extent = extent.max(rel + sz);
            }
        }

        let sct = self.alloc(Object::Sct(crate::value::StructVal {
            stype,
            fields,
            methods: methods.to_vec(),
            map: MapInfo {
                mapped: true,
                strict,
                ios: Value::Int { v: ios, size: 32 },
                offset: Value::ulong(off),
                ..MapInfo::default()
            },
        }));
        Ok((sct, extent))
    }

    /// Map one union alternative and run its constraint.
    fn map_union_alt(
        &mut self,
        stype: Value,
        tfields: &[StructTypeField],
        k: usize,
        ios: i32,
        off: u64,
        strict: bool,
    ) -> Result<(Field, u64), Ctl> {
        let tf = &tfields[k];
        let (val, sz) = self.map_field_value(tf, ios, off, strict)?;
        let field = Field {
            name: tf.name,
            val,
            off: Value::ulong(off),
            modified: false,
            back_val: Value::Null,
            back_off: Value::Null,
        };
        if strict && !tf.check.is_null() {
            let partial = make_struct(&mut self.heap, stype, vec![field], Vec::new());
            self.call_closure(tf.check, &[partial])?;
        }
        Ok((field, sz))
    }

    /// Map a field value honouring its endianness override.
    fn map_field_value(
        &mut self,
        tf: &StructTypeField,
        ios: i32,
        off: u64,
        strict: bool,
    ) -> Result<(Value, u64), Ctl> {
        match tf.endian {
            Some(e) => {
                let saved = self.knobs.endian;
                self.knobs.endian = e;
                let r = self.map_value(tf.ftype, ios, off, strict);
                self.knobs.endian = saved;
                r
            }
            None => self.map_value(tf.ftype, ios, off, strict),
        }
    }

    /// Label of a field as a bit displacement from the struct base, if
    /// the field carries one.
    fn field_label_bits(
        &mut self,
        tf: &StructTypeField,
        stype: Value,
        built: &[Field],
    ) -> Result<Option<u64>, Ctl> {
        if tf.label.is_null() {
            return Ok(None);
        }
        if let Some(n) = tf.label.as_u64() {
            return Ok(Some(n));
        }
        if matches!(
            tf.label.as_ref().map(|r| self.heap.get(r)),
            Some(Object::Cls(_))
        ) {
            let partial = make_struct(&mut self.heap, stype, built.to_vec(), Vec::new());
            let v = self.call_closure(tf.label, &[partial])?;
            let bits = self.bits_of(v)?;
            return Ok(Some(bits));
        }
        let v = tf.label;
        let bits = self.bits_of(v)?;
        Ok(Some(bits))
    }

    // -- write-back and remap ----------------------------------------------

    /// Re-read a mapped value from its IO space, in place.
    fn remap_value(&mut self, v: Value) -> Result<(), Ctl> {
        let r = match v.as_ref() {
            Some(r) => r,
            None => return Ok(()),
        };
        let (typ, ios, off, strict, mapper) = match self.heap.get(r) {
            Object::Arr(a) if a.map.mapped => (
                a.atype,
                a.map.ios,
                a.map.offset,
                a.map.strict,
                a.map.mapper,
            ),
            Object::Sct(s) if s.map.mapped => (
                s.stype,
                s.map.ios,
                s.map.offset,
                s.map.strict,
                s.map.mapper,
            ),
            _ => return Ok(()),
        };
        let id = self.ios_id(ios)?;
        let bits = match off.as_u64() {
            Some(b) => b,
            None => return Err(self.ex(EC_MAP, "mapped value without an offset")),
        };
        let fresh = if !mapper.is_null() {
            let ios_v = Value::Int { v: id, size: 32 };
            let off_v = self.bits_offset(bits);
            self.call_closure(mapper, &[ios_v, off_v])?
        } else {
            self.map_value(typ, id, bits, strict)?.0
        };
        // Move the fresh contents into the old object so existing
        // references observe the update.
        if let Some(fr) = fresh.as_ref() {
            if fr != r {
                let obj = std::mem::replace(self.heap.get_mut(fr), Object::Str(String::new()));
                *self.heap.get_mut(r) = obj;
            }
        }
        Ok(())
    }

    /// Write a mapped value back to its IO space.
    pub(crate) fn write_value(&mut self, v: Value) -> Result<(), Ctl> {
        let r = match v.as_ref() {
            Some(r) => r,
            None => return Ok(()),
        };
        enum Plan {
            Arr {
                ios: Value,
                writer: Value,
                parts: Vec<(Value, Value)>,
            },
            Sct {
                ios: Value,
                writer: Value,
                parts: Vec<(Value, Value)>,
            },
            Skip,
        }
        let plan = match self.heap.get(r) {
            Object::Arr(a) if a.map.mapped => Plan::Arr {
                ios: a.map.ios,
                writer: a.map.writer,
                parts: a.elems.iter().map(|e| (e.val, e.off)).collect(),
            },
            Object::Sct(s) if s.map.mapped => Plan::Sct {
                ios: s.map.ios,
                writer: s.map.writer,
                parts: s
                    .fields
                    .iter()
                    .filter(|f| !f.name.is_null())
                    .map(|f| (f.val, f.off))
                    .collect(),
            },
            _ => Plan::Skip,
        };
        match plan {
            Plan::Skip => Ok(()),
            Plan::Arr { ios, writer, parts } | Plan::Sct { ios, writer, parts } => {
                if !writer.is_null() {
                    self.call_closure(writer, &[v])?;
                    return Ok(());
                }
                let id = self.ios_id(ios)?;
                for (val, off) in parts {
                    if let Some(bits) = off.as_u64() {
                        self.write_at(val, id, bits)?;
                    }
                }
                if let Object::Sct(s) = self.heap.get_mut(r) {
                    for f in &mut s.fields {
                        f.modified = false;
                    }
                }
                Ok(())
            }
        }
    }

    /// Write a single value at a bit offset: scalars directly, composites
    /// through their own mapping info.
    pub(crate) fn write_at(&mut self, v: Value, ios: i32, off: u64) -> Result<(), Ctl> {
        match v {
            Value::Null => Ok(()),
            Value::Int { .. } | Value::UInt { .. } | Value::Long { .. } | Value::ULong { .. } => {
                let size = v.int_size().unwrap_or(0);
                let bits = if v.is_signed() {
                    jab_core::bits::encode_signed(
                        v.as_i64().unwrap_or(0),
                        size,
                        self.knobs.nenc,
                    )
                } else {
                    v.raw_bits().unwrap_or(0)
                };
                self.write_raw(ios, off, size, bits)
            }
            Value::Ref(r) => {
                enum P {
                    Str(Vec<u8>),
                    Off(Value),
                    Composite,
                    Other,
                }
                let p = match self.heap.get(r) {
                    Object::Str(s) => P::Str(s.as_bytes().to_vec()),
                    Object::Off(o) => P::Off(o.magnitude),
                    Object::Arr(_) | Object::Sct(_) => P::Composite,
                    _ => P::Other,
                };
                match p {
                    P::Str(bytes) => {
                        let mut cur = off;
                        for b in bytes.iter().chain(std::iter::once(&0u8)) {
                            self.write_raw(ios, cur, 8, *b as u64)?;
                            cur += 8;
                        }
                        Ok(())
                    }
                    P::Off(mag) => self.write_at(mag, ios, off),
                    P::Composite => self.write_value(v),
                    P::Other => Err(self.ex(EC_INVAL, "value cannot be written")),
                }
            }
        }
    }

    fn write_raw(&mut self, ios: i32, off: u64, size: u32, bits: u64) -> Result<(), Ctl> {
        let endian = self.knobs.endian;
        match self.ios.write_bits(ios, off, size, endian, bits) {
            Ok(()) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                Err(self.ex(EC_IO, &msg))
            }
        }
    }
}
