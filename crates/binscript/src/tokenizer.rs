//! Splits schema text into typed tokens.
//!
//! The grammar is free-form: whitespace and line breaks are
//! interchangeable, `;` terminates field declarations, `{`/`}` delimit
//! structures and `//` starts a line comment. Comments are emitted as
//! tokens so callers can skip them uniformly.

use std::fmt;

use crate::bits::ByteOrder;
use crate::errors::{Error, Result};

/// One lexical item of a schema with its byte offset in the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Comment(String),
    Atom(AtomToken),
    StructStart(StructToken),
    StructEnd,
}

/// A field declaration: `[order]? type [':' extra]? ['[' size ']']? name? ';'`.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomToken {
    pub type_name: String,
    pub byte_order: ByteOrder,
    pub extra: Option<Extra>,
    pub array_size: Option<ArraySize>,
    pub name: Option<String>,
}

/// A structure opening: `[name]? ['[' size ']']? '{'`.
#[derive(Debug, Clone, PartialEq)]
pub struct StructToken {
    pub name: Option<String>,
    pub array_size: Option<ArraySize>,
}

/// Extra-data clause after `:` — a literal or a parenthesised expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Extra {
    Literal(i32),
    Expression(String),
}

/// Array-size clause between `[` and `]`.
#[derive(Debug, Clone, PartialEq)]
pub enum ArraySize {
    Literal(i32),
    Expression(String),
    /// The `_` sentinel: read until end of stream.
    WholeStream,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TokenKind::Comment(_) => write!(f, "comment at offset {}", self.position),
            TokenKind::StructEnd => write!(f, "'}}' at offset {}", self.position),
            TokenKind::StructStart(s) => match &s.name {
                Some(name) => write!(f, "structure '{}' at offset {}", name, self.position),
                None => write!(f, "structure at offset {}", self.position),
            },
            TokenKind::Atom(a) => match &a.name {
                Some(name) => write!(
                    f,
                    "field '{} {}' at offset {}",
                    a.type_name, name, self.position
                ),
                None => write!(f, "field '{}' at offset {}", a.type_name, self.position),
            },
        }
    }
}

/// Lazy tokenizer over schema source text.
pub struct Tokenizer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(script: &'a str) -> Self {
        Self {
            src: script.as_bytes(),
            pos: 0,
        }
    }

    fn err(&self, offset: usize, message: impl Into<String>) -> Error {
        Error::Tokenization {
            offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_separators(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() || c == b';' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn ident(&mut self, allow_dots: bool) -> Option<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == b'_' || c == b'$' => self.pos += 1,
            _ => return None,
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || (allow_dots && c == b'.') {
                self.pos += 1;
            } else {
                break;
            }
        }
        Some(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn extra(&mut self) -> Result<Extra> {
        self.skip_ws();
        let start = self.pos;
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let inner_start = self.pos;
            let mut depth = 1usize;
            while let Some(c) = self.peek() {
                match c {
                    b'(' => depth += 1,
                    b')' => {
                        depth -= 1;
                        if depth == 0 {
                            let text =
                                String::from_utf8_lossy(&self.src[inner_start..self.pos]).into_owned();
                            self.pos += 1;
                            return Ok(Extra::Expression(text.trim().to_string()));
                        }
                    }
                    _ => {}
                }
                self.pos += 1;
            }
            return Err(self.err(start, "unclosed '(' in extra data"));
        }

        let mut end = self.pos;
        if self.src.get(end) == Some(&b'-') {
            end += 1;
        }
        while self.src.get(end).is_some_and(|c| c.is_ascii_digit()) {
            end += 1;
        }
        let text = std::str::from_utf8(&self.src[self.pos..end]).unwrap_or("");
        let value: i32 = text
            .parse()
            .map_err(|_| self.err(start, "extra data must be numeric or a parenthesised expression"))?;
        self.pos = end;
        Ok(Extra::Literal(value))
    }

    fn array_size(&mut self) -> Result<ArraySize> {
        let start = self.pos;
        self.pos += 1; // consume '['
        let inner_start = self.pos;
        while let Some(c) = self.peek() {
            if c == b']' {
                let text = String::from_utf8_lossy(&self.src[inner_start..self.pos]).into_owned();
                self.pos += 1;
                let text = text.trim();
                if text.is_empty() {
                    return Err(self.err(start, "empty array size"));
                }
                if text == "_" {
                    return Ok(ArraySize::WholeStream);
                }
                if is_number(text) {
                    return text
                        .parse::<i32>()
                        .map(ArraySize::Literal)
                        .map_err(|_| self.err(start, format!("array size out of range [{text}]")));
                }
                return Ok(ArraySize::Expression(text.to_string()));
            }
            self.pos += 1;
        }
        Err(self.err(start, "unclosed '[' in array size"))
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_separators();

        let position = self.pos;
        let Some(first) = self.peek() else {
            return Ok(None);
        };

        if first == b'/' && self.src.get(self.pos + 1) == Some(&b'/') {
            self.pos += 2;
            let start = self.pos;
            while self.peek().is_some_and(|c| c != b'\n') {
                self.pos += 1;
            }
            let text = String::from_utf8_lossy(&self.src[start..self.pos])
                .trim()
                .to_string();
            return Ok(Some(Token {
                kind: TokenKind::Comment(text),
                position,
            }));
        }

        if first == b'}' {
            self.pos += 1;
            return Ok(Some(Token {
                kind: TokenKind::StructEnd,
                position,
            }));
        }

        let byte_order = match first {
            b'<' => {
                self.pos += 1;
                ByteOrder::LittleEndian
            }
            b'>' => {
                self.pos += 1;
                ByteOrder::BigEndian
            }
            _ => ByteOrder::BigEndian,
        };

        self.skip_ws();
        let first_ident = self.ident(false);

        self.skip_ws();
        let extra = if first_ident.is_some() && self.peek() == Some(b':') {
            self.pos += 1;
            Some(self.extra()?)
        } else {
            None
        };

        self.skip_ws();
        let array_size = if self.peek() == Some(b'[') {
            Some(self.array_size()?)
        } else {
            None
        };

        self.skip_ws();
        let second_ident = self.ident(true);

        self.skip_ws();
        match self.peek() {
            Some(b';') => {
                self.pos += 1;
                let type_name = first_ident
                    .ok_or_else(|| self.err(position, "field declaration without a type"))?;
                Ok(Some(Token {
                    kind: TokenKind::Atom(AtomToken {
                        type_name,
                        byte_order,
                        extra,
                        array_size,
                        name: second_ident,
                    }),
                    position,
                }))
            }
            Some(b'{') => {
                self.pos += 1;
                if extra.is_some() {
                    return Err(self.err(position, "structure can't have extra data"));
                }
                if second_ident.is_some() {
                    return Err(self.err(position, "malformed structure declaration"));
                }
                Ok(Some(Token {
                    kind: TokenKind::StructStart(StructToken {
                        name: first_ident,
                        array_size,
                    }),
                    position,
                }))
            }
            Some(c) => Err(self.err(
                self.pos,
                format!("unrecognised character '{}'", c as char),
            )),
            None => Err(self.err(self.pos, "unexpected end of schema")),
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token().transpose()
    }
}

/// True for an optionally negative decimal integer.
pub(crate) fn is_number(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(script: &str) -> Vec<Token> {
        Tokenizer::new(script).collect::<Result<Vec<_>>>().unwrap()
    }

    fn atom(token: &Token) -> &AtomToken {
        match &token.kind {
            TokenKind::Atom(a) => a,
            other => panic!("expected atom, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_fields() {
        let toks = tokens("ubyte len; byte[len] data;");
        assert_eq!(toks.len(), 2);

        let len = atom(&toks[0]);
        assert_eq!(len.type_name, "ubyte");
        assert_eq!(len.name.as_deref(), Some("len"));
        assert_eq!(len.array_size, None);

        let data = atom(&toks[1]);
        assert_eq!(data.type_name, "byte");
        assert_eq!(
            data.array_size,
            Some(ArraySize::Expression("len".to_string()))
        );
        assert_eq!(data.name.as_deref(), Some("data"));
    }

    #[test]
    fn test_byte_order_prefix() {
        let toks = tokens("<int a; >short b; long c;");
        assert_eq!(atom(&toks[0]).byte_order, ByteOrder::LittleEndian);
        assert_eq!(atom(&toks[1]).byte_order, ByteOrder::BigEndian);
        assert_eq!(atom(&toks[2]).byte_order, ByteOrder::BigEndian);
    }

    #[test]
    fn test_extra_forms() {
        let toks = tokens("bit:4 flags; bit:(n+1) v; skip:-2;");
        assert_eq!(atom(&toks[0]).extra, Some(Extra::Literal(4)));
        assert_eq!(
            atom(&toks[1]).extra,
            Some(Extra::Expression("n+1".to_string()))
        );
        assert_eq!(atom(&toks[2]).extra, Some(Extra::Literal(-2)));
    }

    #[test]
    fn test_array_forms() {
        let toks = tokens("byte[3] a; byte[_] b; byte[x*2] c;");
        assert_eq!(atom(&toks[0]).array_size, Some(ArraySize::Literal(3)));
        assert_eq!(atom(&toks[1]).array_size, Some(ArraySize::WholeStream));
        assert_eq!(
            atom(&toks[2]).array_size,
            Some(ArraySize::Expression("x*2".to_string()))
        );
    }

    #[test]
    fn test_struct_tokens() {
        let toks = tokens("chunk [_] { int length; } { byte; }");
        match &toks[0].kind {
            TokenKind::StructStart(s) => {
                assert_eq!(s.name.as_deref(), Some("chunk"));
                assert_eq!(s.array_size, Some(ArraySize::WholeStream));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(toks[2].kind, TokenKind::StructEnd);
        match &toks[3].kind {
            TokenKind::StructStart(s) => {
                assert_eq!(s.name, None);
                assert_eq!(s.array_size, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_comments_are_emitted() {
        let toks = tokens("// header\nint a; // trailing\n");
        assert_eq!(toks[0].kind, TokenKind::Comment("header".to_string()));
        assert!(matches!(toks[1].kind, TokenKind::Atom(_)));
        assert_eq!(toks[2].kind, TokenKind::Comment("trailing".to_string()));
    }

    #[test]
    fn test_reset_counter_type_name() {
        let toks = tokens("reset$$;");
        assert_eq!(atom(&toks[0]).type_name, "reset$$");
    }

    #[test]
    fn test_name_with_dots_is_scanned() {
        // Dots are accepted lexically; the compiler rejects them later.
        let toks = tokens("byte a.b;");
        assert_eq!(atom(&toks[0]).name.as_deref(), Some("a.b"));
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(Tokenizer::new("@;").collect::<Result<Vec<_>>>().is_err());
        assert!(Tokenizer::new("byte[2")
            .collect::<Result<Vec<_>>>()
            .is_err());
        assert!(Tokenizer::new("bit:(1 a;")
            .collect::<Result<Vec<_>>>()
            .is_err());
        assert!(Tokenizer::new("bit:x a;")
            .collect::<Result<Vec<_>>>()
            .is_err());
        assert!(Tokenizer::new("[2] x;").collect::<Result<Vec<_>>>().is_err());
        assert!(Tokenizer::new("byte a")
            .collect::<Result<Vec<_>>>()
            .is_err());
        assert!(Tokenizer::new("s:2 { byte; }")
            .collect::<Result<Vec<_>>>()
            .is_err());
    }

    #[test]
    fn test_empty_and_separator_only() {
        assert!(tokens("").is_empty());
        assert!(tokens(" ;; \n ; ").is_empty());
    }
}
