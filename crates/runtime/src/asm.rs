//! Textual assembly
//!
//! A small language for writing routines by hand: one statement per line,
//! either a label definition `$name:` or an instruction
//! `mnemonic arg, arg, ...`. Macro templates write `;` for newline and
//! `.` for the `$` label marker; [`expand_template`] rewrites them.
//!
//! Arguments are unsigned constant expressions (the four usual bases,
//! parenthesised arithmetic, `BytesPerWord`-style symbols and the
//! `INT_MIN`/`INT_MAX`/`UINT_MAX` constants), label references `$name`,
//! register references `%cN` (accepted, though no instruction of this VM
//! takes one), typed integer literals `int<32>42` / `uint<8>255`, and
//! double-quoted strings.
//!
//! ```text
//!     push int<32>42
//!     push int<32>1
//!     add
//!     return
//! ```

use std::collections::HashMap;

use jab_core::heap::Heap;

use crate::program::{AsmError, Label, ProgramBuilder};
use crate::value::{make_integral, make_string, Object, Value};

/// Rewrite a macro template into plain assembly: `;` separates
/// statements, `.` marks labels.
pub fn expand_template(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ';' => '\n',
            '.' => '$',
            other => other,
        })
        .collect()
}

/// Parse assembly text, appending to the builder.
pub fn parse_from_string(
    src: &str,
    b: &mut ProgramBuilder,
    heap: &mut Heap<Object>,
) -> Result<(), AsmError> {
    let mut labels: HashMap<String, Label> = HashMap::new();
    for (lineno, line) in src.lines().enumerate() {
        let lineno = lineno + 1;
        let toks = lex_line(line, lineno)?;
        if toks.is_empty() {
            continue;
        }
        parse_line(&toks, lineno, b, heap, &mut labels)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(u64),
    Str(String),
    Lbl(String),
    Reg(char, u32),
    Punct(char),
}

fn perr(line: usize, msg: impl Into<String>) -> AsmError {
    AsmError::Parse {
        line,
        msg: msg.into(),
    }
}

fn lex_line(line: &str, lineno: usize) -> Result<Vec<Tok>, AsmError> {
    let mut toks = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '$' => {
                chars.next();
                let name = lex_ident(&mut chars);
                if name.is_empty() {
                    return Err(perr(lineno, "label marker without a name"));
                }
                toks.push(Tok::Lbl(name));
            }
            '%' => {
                chars.next();
                let class = match chars.next() {
                    Some(c) if c.is_ascii_alphabetic() => c,
                    _ => return Err(perr(lineno, "register reference without a class")),
                };
                let digits = lex_while(&mut chars, |c| c.is_ascii_digit());
                let id = digits
                    .parse::<u32>()
                    .map_err(|_| perr(lineno, "register reference without an id"))?;
                toks.push(Tok::Reg(class, id));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('\\') => s.push('\\'),
                            Some('"') => s.push('"'),
                            _ => return Err(perr(lineno, "bad string escape")),
                        },
                        Some(c) => s.push(c),
                        None => return Err(perr(lineno, "unterminated string")),
                    }
                }
                toks.push(Tok::Str(s));
            }
            c if c.is_ascii_digit() => {
                toks.push(Tok::Num(lex_number(&mut chars, lineno)?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                toks.push(Tok::Ident(lex_ident(&mut chars)));
            }
            '<' | '>' | '(' | ')' | '+' | '-' | '*' | '/' | '%' | '&' | '|' | '^' | '~' | ','
            | ':' => {
                chars.next();
                toks.push(Tok::Punct(c));
            }
            other => return Err(perr(lineno, format!("unexpected character '{}'", other))),
        }
    }
    Ok(toks)
}

fn lex_ident(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    lex_while(chars, |c| c.is_ascii_alphanumeric() || c == '_')
}

fn lex_while(
    chars: &mut std::iter::Peekable<std::str::Chars>,
    pred: impl Fn(char) -> bool,
) -> String {
    let mut s = String::new();
    while let Some(&c) = chars.peek() {
        if pred(c) {
            s.push(c);
            chars.next();
        } else {
            break;
        }
    }
    s
}

fn lex_number(
    chars: &mut std::iter::Peekable<std::str::Chars>,
    lineno: usize,
) -> Result<u64, AsmError> {
    let body = lex_while(chars, |c| c.is_ascii_alphanumeric() || c == '_');
    let body = body.replace('_', "");
    let (digits, radix) = if let Some(hex) = body.strip_prefix("0x").or(body.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(bin) = body.strip_prefix("0b").or(body.strip_prefix("0B")) {
        (bin, 2)
    } else if let Some(oct) = body.strip_prefix("0o").or(body.strip_prefix("0O")) {
        (oct, 8)
    } else {
        (body.as_str(), 10)
    };
    // Size-marker suffixes ([U][NBHL]) are accepted and ignored; values
    // are plain machine words here. Digits win over suffix letters, so
    // 0x1B is a number while 0x1BUL carries a suffix.
    u64::from_str_radix(digits, radix)
        .ok()
        .or_else(|| {
            let d = digits
                .strip_suffix(|c| matches!(c, 'N' | 'B' | 'H' | 'L' | 'n' | 'h' | 'l'))
                .unwrap_or(digits);
            let d = d.strip_suffix(['U', 'u']).unwrap_or(d);
            u64::from_str_radix(d, radix).ok()
        })
        .ok_or_else(|| perr(lineno, "bad integer literal"))
}

fn parse_line(
    toks: &[Tok],
    lineno: usize,
    b: &mut ProgramBuilder,
    heap: &mut Heap<Object>,
    labels: &mut HashMap<String, Label>,
) -> Result<(), AsmError> {
    // Label definition: `$name:`
    if let Tok::Lbl(name) = &toks[0] {
        if toks.get(1) == Some(&Tok::Punct(':')) && toks.len() == 2 {
            let l = label_for(b, labels, name);
            return b.append_label(l);
        }
        return Err(perr(lineno, "label reference outside an instruction"));
    }

    let mnemonic = match &toks[0] {
        Tok::Ident(n) => n.clone(),
        _ => return Err(perr(lineno, "expected an instruction mnemonic")),
    };
    b.append_instruction(&mnemonic)?;

    let mut pos = 1;
    while pos < toks.len() {
        pos = parse_arg(toks, pos, lineno, b, heap, labels)?;
        match toks.get(pos) {
            Some(Tok::Punct(',')) => pos += 1,
            None => break,
            _ => return Err(perr(lineno, "expected ',' between parameters")),
        }
    }
    Ok(())
}

fn label_for(b: &mut ProgramBuilder, labels: &mut HashMap<String, Label>, name: &str) -> Label {
    if let Some(l) = labels.get(name) {
        return *l;
    }
    let l = b.fresh_label();
    labels.insert(name.to_string(), l);
    l
}

fn parse_arg(
    toks: &[Tok],
    pos: usize,
    lineno: usize,
    b: &mut ProgramBuilder,
    heap: &mut Heap<Object>,
    labels: &mut HashMap<String, Label>,
) -> Result<usize, AsmError> {
    match &toks[pos] {
        Tok::Lbl(name) => {
            let l = label_for(b, labels, name);
            b.append_label_parameter(l)?;
            Ok(pos + 1)
        }
        Tok::Reg(class, id) => {
            b.append_register_parameter(*class, *id)?;
            Ok(pos + 1)
        }
        Tok::Str(s) => {
            let v = make_string(heap, s.clone());
            b.append_val_parameter(v)?;
            Ok(pos + 1)
        }
        // Typed integer literal: `int<32>42` / `uint<8>255`.
        Tok::Ident(kw) if (kw == "int" || kw == "uint") && toks.get(pos + 1) == Some(&Tok::Punct('<')) => {
            let size = match toks.get(pos + 2) {
                Some(Tok::Num(n)) => *n,
                _ => return Err(perr(lineno, "expected a width in the literal type")),
            };
            if toks.get(pos + 3) != Some(&Tok::Punct('>')) {
                return Err(perr(lineno, "expected '>' in the literal type"));
            }
            let (neg, vpos) = match toks.get(pos + 4) {
                Some(Tok::Punct('-')) => (true, pos + 5),
                _ => (false, pos + 4),
            };
            let raw = match toks.get(vpos) {
                Some(Tok::Num(n)) => *n,
                _ => return Err(perr(lineno, "expected a value after the literal type")),
            };
            let bits = if neg { (raw as i64).wrapping_neg() as u64 } else { raw };
            let v = make_integral(bits, size as u32, kw == "int")
                .ok_or_else(|| perr(lineno, "literal width out of range"))?;
            b.append_val_parameter(v)?;
            Ok(vpos + 1)
        }
        _ => {
            let mut p = Parser { toks, pos, lineno };
            let n = p.expr()?;
            b.append_unsigned_parameter(n)?;
            Ok(p.pos)
        }
    }
}

/// Constant-expression evaluator over the token stream.
struct Parser<'t> {
    toks: &'t [Tok],
    pos: usize,
    lineno: usize,
}

impl<'t> Parser<'t> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Tok::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<u64, AsmError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<u64, AsmError> {
        let mut v = self.xor_expr()?;
        while self.eat_punct('|') {
            v |= self.xor_expr()?;
        }
        Ok(v)
    }

    fn xor_expr(&mut self) -> Result<u64, AsmError> {
        let mut v = self.and_expr()?;
        while self.eat_punct('^') {
            v ^= self.and_expr()?;
        }
        Ok(v)
    }

    fn and_expr(&mut self) -> Result<u64, AsmError> {
        let mut v = self.add_expr()?;
        while self.eat_punct('&') {
            v &= self.add_expr()?;
        }
        Ok(v)
    }

    fn add_expr(&mut self) -> Result<u64, AsmError> {
        let mut v = self.mul_expr()?;
        loop {
            if self.eat_punct('+') {
                v = v.wrapping_add(self.mul_expr()?);
            } else if self.eat_punct('-') {
                v = v.wrapping_sub(self.mul_expr()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn mul_expr(&mut self) -> Result<u64, AsmError> {
        let mut v = self.pow_expr()?;
        loop {
            if self.peek() == Some(&Tok::Punct('*')) && self.toks.get(self.pos + 1) != Some(&Tok::Punct('*')) {
                self.pos += 1;
                v = v.wrapping_mul(self.pow_expr()?);
            } else if self.eat_punct('/') {
                let d = self.pow_expr()?;
                if d == 0 {
                    return Err(perr(self.lineno, "division by zero in a constant"));
                }
                v /= d;
            } else if self.eat_punct('%') {
                let d = self.pow_expr()?;
                if d == 0 {
                    return Err(perr(self.lineno, "division by zero in a constant"));
                }
                v %= d;
            } else {
                return Ok(v);
            }
        }
    }

    fn pow_expr(&mut self) -> Result<u64, AsmError> {
        let base = self.unary()?;
        if self.peek() == Some(&Tok::Punct('*')) && self.toks.get(self.pos + 1) == Some(&Tok::Punct('*')) {
            self.pos += 2;
            let exp = self.pow_expr()?;
            let mut acc: u64 = 1;
            for _ in 0..exp {
                acc = acc.wrapping_mul(base);
            }
            return Ok(acc);
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<u64, AsmError> {
        if self.eat_punct('-') {
            Ok(self.unary()?.wrapping_neg())
        } else if self.eat_punct('~') {
            Ok(!self.unary()?)
        } else {
            self.atom()
        }
    }

    fn atom(&mut self) -> Result<u64, AsmError> {
        match self.peek().cloned() {
            Some(Tok::Num(n)) => {
                self.pos += 1;
                Ok(n)
            }
            Some(Tok::Ident(name)) => {
                self.pos += 1;
                match name.as_str() {
                    "BytesPerWord" => Ok(8),
                    "LgBytesPerWord" => Ok(3),
                    "BitsPerWord" => Ok(64),
                    "INT_MIN" => Ok(i32::MIN as i64 as u64),
                    "INT_MAX" => Ok(i32::MAX as u64),
                    "UINT_MAX" => Ok(u32::MAX as u64),
                    other => Err(perr(self.lineno, format!("unknown symbol '{}'", other))),
                }
            }
            Some(Tok::Punct('(')) => {
                self.pos += 1;
                let v = self.expr()?;
                if !self.eat_punct(')') {
                    return Err(perr(self.lineno, "expected ')'"));
                }
                Ok(v)
            }
            _ => Err(perr(self.lineno, "expected a constant expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    fn assemble_and_run(vm: &mut Vm, src: &str) -> Result<Value, Value> {
        let mut b = ProgramBuilder::new();
        parse_from_string(src, &mut b, vm.heap_mut()).expect("assembly must parse");
        let p = vm.make_program(b).expect("assembly must finalize");
        vm.run(&p)
    }

    #[test]
    fn test_example_routine() {
        let mut vm = Vm::new();
        let src = "    push int<32>42\n    push int<32>1\n    add\n    return\n";
        let r = assemble_and_run(&mut vm, src).unwrap();
        assert_eq!(r, Value::int32(43));
    }

    #[test]
    fn test_template_expansion() {
        assert_eq!(expand_template("a;b"), "a\nb");
        assert_eq!(expand_template(".l:"), "$l:");
    }

    #[test]
    fn test_labels_and_branches() {
        let mut vm = Vm::new();
        let src = expand_template(
            "push int<32>0;bnzi .yes;push int<32>7;ba .done;.yes:;push int<32>9;.done:;return",
        );
        let r = assemble_and_run(&mut vm, &src).unwrap();
        assert_eq!(r, Value::int32(7));
    }

    #[test]
    fn test_constant_expressions() {
        let mut vm = Vm::new();
        // revn (2 + 1) reverses the three pushed values.
        let src = "push int<32>1\npush int<32>2\npush int<32>3\nrevn (2 + 1)\nreturn\n";
        let r = assemble_and_run(&mut vm, src).unwrap();
        assert_eq!(r, Value::int32(1));
    }

    #[test]
    fn test_symbols() {
        let toks = lex_line("BytesPerWord * 2", 1).unwrap();
        let mut p = Parser {
            toks: &toks,
            pos: 0,
            lineno: 1,
        };
        assert_eq!(p.expr().unwrap(), 16);

        let toks = lex_line("INT_MAX", 1).unwrap();
        let mut p = Parser {
            toks: &toks,
            pos: 0,
            lineno: 1,
        };
        assert_eq!(p.expr().unwrap(), i32::MAX as u64);
    }

    #[test]
    fn test_number_bases_and_suffixes() {
        for (src, want) in [
            ("0x10", 16),
            ("0b101", 5),
            ("0o17", 15),
            ("32N", 32),
            ("7UL", 7),
        ] {
            let toks = lex_line(src, 1).unwrap();
            assert_eq!(toks, vec![Tok::Num(want)]);
        }
    }

    #[test]
    fn test_bad_mnemonic_is_reported() {
        let mut vm = Vm::new();
        let mut b = ProgramBuilder::new();
        let e = parse_from_string("florp 1\n", &mut b, vm.heap_mut()).unwrap_err();
        assert!(matches!(e, AsmError::BadInstruction(_)));
    }

    #[test]
    fn test_string_parameter() {
        let mut vm = Vm::new();
        let src = "push \"hi\"\nprints\nreturn\n";
        assemble_and_run(&mut vm, src).unwrap();
        assert_eq!(vm.take_output(), "hi");
    }
}
