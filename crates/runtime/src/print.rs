//! Formatted value printing
//!
//! Rendering follows the VM knobs: numeric base, flat or tree layout,
//! indentation, depth and array cutoffs, and whether mapping offsets are
//! shown. Integers carry a base prefix and a type suffix (`0x7FUL`,
//! `255UB`); widths without a suffix letter print with an explicit cast
//! prefix.
//!
//! When pretty-printing is enabled and a struct value has a `_print`
//! method, that method is invoked instead of the structural rendering;
//! whatever it prints becomes the rendering.

use crate::value::{Object, TypeVal, Value};
use crate::vm::{Ctl, OMode, Vm};

/// Named offset units, bits-per-unit to spelling.
const UNIT_NAMES: &[(u64, &str)] = &[
    (1, "b"),
    (4, "N"),
    (8, "B"),
    (1024, "Kb"),
    (8192, "KB"),
    (1024 * 1024, "Mb"),
    (8 * 1024 * 1024, "MB"),
    (1024 * 1024 * 1024, "Gb"),
    (8 * 1024 * 1024 * 1024, "GB"),
    (1000, "kb"),
    (8000, "kB"),
    (1000 * 1000, "mb"),
    (8 * 1000 * 1000, "mB"),
    (1000 * 1000 * 1000, "gb"),
    (8 * 1000 * 1000 * 1000, "gB"),
];

impl Vm {
    /// Render a value according to the current knobs. The error is the
    /// exception raised by a `_print` method, if any.
    pub fn format_value(&mut self, v: Value) -> Result<String, Value> {
        self.fmt_val(v, 0).map_err(Ctl::into_exception)
    }

    /// Print a value to the VM output.
    pub fn print_value(&mut self, v: Value) -> Result<(), Value> {
        let s = self.format_value(v)?;
        self.out.push_str(&s);
        Ok(())
    }

    pub(crate) fn fmt_val(&mut self, v: Value, depth: u32) -> Result<String, Ctl> {
        match v {
            Value::Null => Ok("null".to_string()),
            Value::Int { .. } | Value::UInt { .. } | Value::Long { .. } | Value::ULong { .. } => {
                Ok(self.fmt_int(v))
            }
            Value::Ref(r) => match self.heap.get(r) {
                Object::Str(s) => Ok(fmt_string(s)),
                Object::Off(o) => {
                    let (mag, unit) = (o.magnitude, o.unit);
                    let m = self.fmt_int(mag);
                    Ok(format!("{}#{}", m, fmt_unit(unit)))
                }
                Object::Arr(_) => self.fmt_array(r, depth),
                Object::Sct(_) => self.fmt_struct(r, depth),
                Object::Typ(_) => Ok(self.fmt_type(Value::Ref(r))),
                Object::Cls(_) => Ok("#<closure>".to_string()),
                Object::Env(_) => Ok("#<environment>".to_string()),
                Object::IArr(_) => Ok("#<internal>".to_string()),
            },
        }
    }

    fn fmt_int(&self, v: Value) -> String {
        let size = v.int_size().unwrap_or(32);
        let signed = v.is_signed();
        let raw = v.raw_bits().unwrap_or(0);
        let digits = match self.knobs.obase {
            2 => format!("0b{:b}", raw),
            8 => format!("0o{:o}", raw),
            16 => format!("0x{:X}", raw),
            _ => {
                if signed {
                    format!("{}", v.as_i64().unwrap_or(0))
                } else {
                    format!("{}", raw)
                }
            }
        };
        let suffix = match (size, signed) {
            (8, true) => "B",
            (8, false) => "UB",
            (16, true) => "H",
            (16, false) => "UH",
            (32, true) => "",
            (32, false) => "U",
            (64, true) => "L",
            (64, false) => "UL",
            _ => {
                let kw = if signed { "int" } else { "uint" };
                return format!("({}<{}>) {}", kw, size, digits);
            }
        };
        format!("{}{}", digits, suffix)
    }

    fn fmt_array(&mut self, r: jab_core::heap::GcRef, depth: u32) -> Result<String, Ctl> {
        if self.knobs.odepth > 0 && depth >= self.knobs.odepth {
            return Ok("[...]".to_string());
        }
        let (elems, moff): (Vec<Value>, Option<u64>) = match self.heap.get(r) {
            Object::Arr(a) => (
                a.elems.iter().map(|e| e.val).collect(),
                if a.map.mapped { a.map.offset.as_u64() } else { None },
            ),
            _ => (Vec::new(), None),
        };
        let cutoff = self.knobs.oacutoff as usize;
        let tree = self.knobs.omode == OMode::Tree;
        let mut parts = Vec::new();
        for (i, e) in elems.iter().enumerate() {
            if cutoff > 0 && i >= cutoff {
                parts.push("...".to_string());
                break;
            }
            parts.push(self.fmt_val(*e, depth + 1)?);
        }
        let body = if tree {
            let pad = indent(self.knobs.oindent, depth + 1);
            let close = indent(self.knobs.oindent, depth);
            format!("[\n{}{}\n{}]", pad, parts.join(&format!(",\n{}", pad)), close)
        } else {
            format!("[{}]", parts.join(","))
        };
        Ok(self.with_map_suffix(body, moff))
    }

    fn fmt_struct(&mut self, r: jab_core::heap::GcRef, depth: u32) -> Result<String, Ctl> {
        // A `_print` method takes over the rendering entirely.
        if self.knobs.pretty_print {
            let m = match self.heap.get(r) {
                Object::Sct(s) => s.method(&self.heap, "_print"),
                _ => None,
            };
            if let Some(m) = m {
                return self.call_print_method(m, Value::Ref(r));
            }
        }

        if self.knobs.odepth > 0 && depth >= self.knobs.odepth {
            return Ok("struct {...}".to_string());
        }
        struct FieldView {
            name: String,
            val: Value,
        }
        let (tag, fields, moff): (String, Vec<FieldView>, Option<u64>) = match self.heap.get(r) {
            Object::Sct(s) => {
                let tag = match s.stype.as_ref().map(|tr| self.heap.get(tr)) {
                    Some(Object::Typ(TypeVal::Struct(st))) => match st.name.as_ref() {
                        Some(nr) => self
                            .heap
                            .get(nr)
                            .as_str()
                            .unwrap_or("struct")
                            .to_string(),
                        None => "struct".to_string(),
                    },
                    _ => "struct".to_string(),
                };
                let fields: Vec<FieldView> = s
                    .fields
                    .iter()
                    .filter(|f| !f.name.is_null())
                    .map(|f| FieldView {
                        name: f
                            .name
                            .as_ref()
                            .and_then(|nr| self.heap.get(nr).as_str())
                            .unwrap_or("?")
                            .to_string(),
                        val: f.val,
                    })
                    .collect();
                (
                    tag,
                    fields,
                    if s.map.mapped { s.map.offset.as_u64() } else { None },
                )
            }
            _ => ("struct".to_string(), Vec::new(), None),
        };

        let tree = self.knobs.omode == OMode::Tree;
        let mut parts = Vec::new();
        for f in &fields {
            let v = self.fmt_val(f.val, depth + 1)?;
            parts.push(format!("{}={}", f.name, v));
        }
        let body = if tree {
            let pad = indent(self.knobs.oindent, depth + 1);
            let close = indent(self.knobs.oindent, depth);
            format!(
                "{} {{\n{}{}\n{}}}",
                tag,
                pad,
                parts.join(&format!(",\n{}", pad)),
                close
            )
        } else {
            format!("{} {{{}}}", tag, parts.join(","))
        };
        Ok(self.with_map_suffix(body, moff))
    }

    fn with_map_suffix(&self, body: String, moff: Option<u64>) -> String {
        match moff {
            Some(off) if self.knobs.omaps => {
                let digits = match self.knobs.obase {
                    2 => format!("0b{:b}", off),
                    8 => format!("0o{:o}", off),
                    16 => format!("0x{:X}", off),
                    _ => format!("{}", off),
                };
                format!("{} @ {}#b", body, digits)
            }
            _ => body,
        }
    }

    /// Run a `_print` method capturing what it prints.
    fn call_print_method(&mut self, method: Value, sct: Value) -> Result<String, Ctl> {
        let saved = std::mem::take(&mut self.out);
        let r = self.call_closure(method, &[sct]);
        let printed = std::mem::replace(&mut self.out, saved);
        r.map(|_| printed)
    }

    /// Spelling of a type value.
    pub fn fmt_type(&self, t: Value) -> String {
        let tr = match t.as_ref() {
            Some(tr) => tr,
            None => return "null".to_string(),
        };
        match self.heap.get(tr) {
            Object::Typ(TypeVal::Integral { size, signed }) => {
                format!("{}<{}>", if *signed { "int" } else { "uint" }, size)
            }
            Object::Typ(TypeVal::StringT) => "string".to_string(),
            Object::Typ(TypeVal::Void) => "void".to_string(),
            Object::Typ(TypeVal::Any) => "any".to_string(),
            Object::Typ(TypeVal::Array { bound, elem }) => {
                let b = match bound.as_u64() {
                    Some(n) => format!("{}", n),
                    None => String::new(),
                };
                format!("{}[{}]", self.fmt_type(*elem), b)
            }
            Object::Typ(TypeVal::Offset { base, unit }) => {
                format!("offset<{},{}>", self.fmt_type(*base), fmt_unit(*unit))
            }
            Object::Typ(TypeVal::Struct(st)) => match st.name.as_ref() {
                Some(nr) => self
                    .heap
                    .get(nr)
                    .as_str()
                    .unwrap_or("struct")
                    .to_string(),
                None => "struct".to_string(),
            },
            Object::Typ(TypeVal::Function { ret, args }) => {
                let parts: Vec<String> = args.iter().map(|a| self.fmt_type(*a)).collect();
                format!("({}){}", parts.join(","), self.fmt_type(*ret))
            }
            _ => "#<not-a-type>".to_string(),
        }
    }
}

fn indent(step: u32, depth: u32) -> String {
    " ".repeat((step * depth) as usize)
}

fn fmt_unit(unit: u64) -> String {
    for (u, name) in UNIT_NAMES {
        if *u == unit {
            return (*name).to_string();
        }
    }
    format!("{}", unit)
}

fn fmt_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::make_string;

    #[test]
    fn test_format_integers() {
        let mut vm = Vm::new();
        assert_eq!(vm.format_value(Value::int32(14)).ok(), Some("14".into()));
        assert_eq!(
            vm.format_value(Value::UInt { v: 255, size: 8 }).ok(),
            Some("255UB".into())
        );
        assert_eq!(
            vm.format_value(Value::ULong { v: 0x7f, size: 64 }).ok(),
            Some("127UL".into())
        );

        vm.knobs.obase = 16;
        assert_eq!(
            vm.format_value(Value::ULong { v: 0x7f, size: 64 }).ok(),
            Some("0x7FUL".into())
        );
        // Negative values print their raw bits outside base 10.
        assert_eq!(
            vm.format_value(Value::Int { v: -1, size: 8 }).ok(),
            Some("0xFFB".into())
        );

        vm.knobs.obase = 2;
        assert_eq!(
            vm.format_value(Value::UInt { v: 5, size: 8 }).ok(),
            Some("0b101UB".into())
        );
    }

    #[test]
    fn test_format_odd_width_integer() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.format_value(Value::UInt { v: 3, size: 3 }).ok(),
            Some("(uint<3>) 3".into())
        );
    }

    #[test]
    fn test_format_string_escapes() {
        let mut vm = Vm::new();
        let s = make_string(vm.heap_mut(), "a\"b\n");
        assert_eq!(vm.format_value(s).ok(), Some("\"a\\\"b\\n\"".into()));
    }

    #[test]
    fn test_format_offset() {
        let mut vm = Vm::new();
        let mag = Value::int32(8);
        let o = crate::value::make_offset(vm.heap_mut(), mag, 8).unwrap();
        assert_eq!(vm.format_value(o).ok(), Some("8#B".into()));
    }
}
