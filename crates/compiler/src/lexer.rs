//! Tokenizer for Jab source
//!
//! Hand-rolled with line/column tracking. Integer literals accept the
//! four bases and the size suffixes (`B`/`H`/`L`, with a leading `U` for
//! unsigned); hexadecimal digits win over suffix letters, so `0x1B` is a
//! number and `0x1BUB` carries a suffix. Character literals are `uint<8>`
//! values. Delimited alien tokens `$<...>` are produced only when the
//! compiler has lexical cuckolding enabled.

use crate::ast::Loc;
use crate::error::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokKind {
    Ident(String),
    Int {
        value: i64,
        size: u32,
        signed: bool,
    },
    Str(String),
    /// Delimited alien token: the text between `$<` and `>`.
    Alien(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokKind,
    pub loc: Loc,
}

/// All multi-character punctuators, longest first.
const PUNCTS: &[&str] = &[
    ":::", "**", "==", "!=", "<=", ">=", "&&", "||", "<<", ">>", "++", "--", "/^", "(", ")", "{",
    "}", "[", "]", ",", ";", ":", ".", "+", "-", "*", "/", "%", "=", "!", "<", ">", "&", "|", "^",
    "~", "?", "@", "#",
];

pub struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
    line: u32,
    col: u32,
    cuckolding: bool,
}

impl<'s> Lexer<'s> {
    pub fn new(src: &'s str, cuckolding: bool) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            cuckolding,
        }
    }

    /// Tokenize the whole input, ending with an EOF token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, CompileError> {
        let mut toks = Vec::new();
        loop {
            let t = self.next_token()?;
            let done = t.kind == TokKind::Eof;
            toks.push(t);
            if done {
                return Ok(toks);
            }
        }
    }

    fn loc(&self) -> Loc {
        Loc {
            line: self.line,
            col: self.col,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.bump();
                }
                Some(b'/') if self.peek2() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek2() == Some(b'*') => {
                    let start = self.loc();
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            Some(b'*') if self.peek2() == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                            None => {
                                return Err(CompileError::parse(start, "unterminated comment"))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, CompileError> {
        self.skip_trivia()?;
        let loc = self.loc();
        let c = match self.peek() {
            Some(c) => c,
            None => {
                return Ok(Token {
                    kind: TokKind::Eof,
                    loc,
                })
            }
        };

        if c == b'$' {
            return self.lex_alien(loc);
        }
        if c == b'"' {
            return self.lex_string(loc);
        }
        if c == b'\'' {
            return self.lex_char(loc);
        }
        if c.is_ascii_digit() {
            return self.lex_number(loc);
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            let mut s = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() || c == b'_' {
                    s.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
            return Ok(Token {
                kind: TokKind::Ident(s),
                loc,
            });
        }

        for p in PUNCTS {
            if self.src[self.pos..].starts_with(p.as_bytes()) {
                for _ in 0..p.len() {
                    self.bump();
                }
                return Ok(Token {
                    kind: TokKind::Punct(p),
                    loc,
                });
            }
        }
        Err(CompileError::parse(
            loc,
            format!("unexpected character '{}'", c as char),
        ))
    }

    fn lex_alien(&mut self, loc: Loc) -> Result<Token, CompileError> {
        if !self.cuckolding {
            return Err(CompileError::parse(loc, "alien tokens are not enabled"));
        }
        self.bump();
        if self.peek() != Some(b'<') {
            return Err(CompileError::parse(loc, "expected '<' after '$'"));
        }
        self.bump();
        let mut s = String::new();
        loop {
            match self.bump() {
                Some(b'>') => break,
                Some(c) => s.push(c as char),
                None => return Err(CompileError::parse(loc, "unterminated alien token")),
            }
        }
        Ok(Token {
            kind: TokKind::Alien(s),
            loc,
        })
    }

    fn lex_string(&mut self, loc: Loc) -> Result<Token, CompileError> {
        self.bump();
        let mut s = String::new();
        loop {
            match self.bump() {
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'n') => s.push('\n'),
                    Some(b't') => s.push('\t'),
                    Some(b'\\') => s.push('\\'),
                    Some(b'"') => s.push('"'),
                    _ => return Err(CompileError::parse(loc, "bad string escape")),
                },
                Some(c) => s.push(c as char),
                None => return Err(CompileError::parse(loc, "unterminated string literal")),
            }
        }
        Ok(Token {
            kind: TokKind::Str(s),
            loc,
        })
    }

    fn lex_char(&mut self, loc: Loc) -> Result<Token, CompileError> {
        self.bump();
        let v = match self.bump() {
            Some(b'\\') => match self.bump() {
                Some(b'n') => b'\n',
                Some(b't') => b'\t',
                Some(b'\\') => b'\\',
                Some(b'\'') => b'\'',
                Some(b'0') => 0,
                _ => return Err(CompileError::parse(loc, "bad character escape")),
            },
            Some(c) => c,
            None => return Err(CompileError::parse(loc, "unterminated character literal")),
        };
        if self.bump() != Some(b'\'') {
            return Err(CompileError::parse(loc, "unterminated character literal"));
        }
        Ok(Token {
            kind: TokKind::Int {
                value: v as i64,
                size: 8,
                signed: false,
            },
            loc,
        })
    }

    fn lex_number(&mut self, loc: Loc) -> Result<Token, CompileError> {
        let mut body = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                body.push(c as char);
                self.bump();
            } else {
                break;
            }
        }
        let body = body.replace('_', "");
        let (digits, radix) = if let Some(h) = body.strip_prefix("0x").or(body.strip_prefix("0X"))
        {
            (h, 16)
        } else if let Some(b) = body.strip_prefix("0b").or(body.strip_prefix("0B")) {
            (b, 2)
        } else if let Some(o) = body.strip_prefix("0o").or(body.strip_prefix("0O")) {
            (o, 8)
        } else {
            (body.as_str(), 10)
        };

        // Digits win over suffix letters: try the bare spelling first.
        if let Ok(v) = u64::from_str_radix(digits, radix) {
            return Ok(Token {
                kind: default_sized(v),
                loc,
            });
        }
        for suffix in ["UL", "UB", "UH", "U", "L", "B", "H"] {
            if let Some(d) = digits.strip_suffix(suffix) {
                if let Ok(v) = u64::from_str_radix(d, radix) {
                    let (size, signed) = match suffix {
                        "B" => (8, true),
                        "UB" => (8, false),
                        "H" => (16, true),
                        "UH" => (16, false),
                        "U" => (32, false),
                        "L" => (64, true),
                        "UL" => (64, false),
                        _ => (32, true),
                    };
                    return Ok(Token {
                        kind: TokKind::Int {
                            value: v as i64,
                            size,
                            signed,
                        },
                        loc,
                    });
                }
            }
        }
        Err(CompileError::parse(loc, "bad integer literal"))
    }
}

/// An unsuffixed literal is `int<32>` when it fits, otherwise `int<64>`.
fn default_sized(v: u64) -> TokKind {
    if v <= i32::MAX as u64 {
        TokKind::Int {
            value: v as i64,
            size: 32,
            signed: true,
        }
    } else {
        TokKind::Int {
            value: v as i64,
            size: 64,
            signed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokKind> {
        Lexer::new(src, false)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            kinds("var a = 1;"),
            vec![
                TokKind::Ident("var".into()),
                TokKind::Ident("a".into()),
                TokKind::Punct("="),
                TokKind::Int {
                    value: 1,
                    size: 32,
                    signed: true
                },
                TokKind::Punct(";"),
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn test_integer_suffixes() {
        assert_eq!(
            kinds("0UB 0x12UB 7L 0x1B"),
            vec![
                TokKind::Int {
                    value: 0,
                    size: 8,
                    signed: false
                },
                TokKind::Int {
                    value: 0x12,
                    size: 8,
                    signed: false
                },
                TokKind::Int {
                    value: 7,
                    size: 64,
                    signed: true
                },
                // Hex digits win over the B suffix.
                TokKind::Int {
                    value: 0x1b,
                    size: 32,
                    signed: true
                },
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn test_wide_literal_defaults_to_64_bits() {
        assert_eq!(
            kinds("4294967295"),
            vec![
                TokKind::Int {
                    value: 4294967295,
                    size: 64,
                    signed: true
                },
                TokKind::Eof
            ]
        );
    }

    #[test]
    fn test_punct_maximal_munch() {
        assert_eq!(
            kinds("a:::b :: :"),
            vec![
                TokKind::Ident("a".into()),
                TokKind::Punct(":::"),
                TokKind::Ident("b".into()),
                TokKind::Punct(":"),
                TokKind::Punct(":"),
                TokKind::Punct(":"),
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_locations() {
        let toks = Lexer::new("// one\n/* two\n */ x", false).tokenize().unwrap();
        assert_eq!(toks[0].kind, TokKind::Ident("x".into()));
        assert_eq!(toks[0].loc.line, 3);
    }

    #[test]
    fn test_char_literal() {
        assert_eq!(
            kinds("'A' '\\n'"),
            vec![
                TokKind::Int {
                    value: 65,
                    size: 8,
                    signed: false
                },
                TokKind::Int {
                    value: 10,
                    size: 8,
                    signed: false
                },
                TokKind::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\n\"b""#),
            vec![TokKind::Str("a\n\"b".into()), TokKind::Eof]
        );
    }

    #[test]
    fn test_alien_token_gate() {
        assert!(Lexer::new("$<mem>", false).tokenize().is_err());
        let toks = Lexer::new("$<mem://x>", true).tokenize().unwrap();
        assert_eq!(toks[0].kind, TokKind::Alien("mem://x".into()));
    }
}
