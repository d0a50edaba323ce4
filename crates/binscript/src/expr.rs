//! Arithmetic expressions used for computed array lengths and extra data.
//!
//! Expressions are compiled once, together with the schema, into a small
//! postfix tape; field references are resolved against the named fields
//! visible at that point. Evaluation is a plain stack machine over the
//! per-parse numeric field map and needs no allocation beyond the stack.
//!
//! Semantics are signed 32-bit two's complement with wrapping overflow.
//! Precedence, highest first: unary `~` `-`; `*` `/` `%`; `+` `-`;
//! `<<` `>>` `>>>`; `&`; `|`; `^`.

use crate::compiled::NamedFieldInfo;
use crate::errors::{Error, Result};

/// Resolver for `$name` references supplied by the caller of a parse.
pub trait ExternalValueProvider {
    fn provide(&self, name: &str) -> Option<i32>;
}

impl<F> ExternalValueProvider for F
where
    F: Fn(&str) -> Option<i32>,
{
    fn provide(&self, name: &str) -> Option<i32> {
        self(name)
    }
}

/// Insertion-ordered map from dotted field paths to their most recently
/// parsed numeric values. Lookup is a linear scan; field counts are small
/// and the map is rebuilt per parse.
#[derive(Debug, Default)]
pub struct NumericMap {
    entries: Vec<(String, i64)>,
}

impl NumericMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, path: &str, value: i64) {
        match self.entries.iter_mut().find(|(p, _)| p == path) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((path.to_string(), value)),
        }
    }

    pub fn get(&self, path: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| *v)
    }
}

/// Evaluation environment for one expression evaluation.
pub struct EvalEnv<'a> {
    pub named_fields: &'a [NamedFieldInfo],
    pub numeric: &'a NumericMap,
    pub external: Option<&'a dyn ExternalValueProvider>,
    /// Current byte counter of the input stream, the `$$` pseudo-variable.
    pub counter: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Const(i32),
    /// Index into the named-field side table; the value is looked up by
    /// that entry's dotted path at evaluation time.
    Field(usize),
    External(String),
    StreamCounter,
    Neg,
    BitNot,
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

/// A compiled expression: postfix tape plus the original source text.
#[derive(Debug)]
pub struct Expr {
    source: String,
    ops: Vec<Op>,
}

impl Expr {
    /// Compiles `source`, resolving identifiers against the named fields
    /// defined so far. Resolution searches backwards, so the most recent
    /// field with a matching path wins.
    pub(crate) fn compile(source: &str, named_fields: &[NamedFieldInfo]) -> Result<Expr> {
        let tokens = lex(source)?;
        if tokens.is_empty() {
            return Err(Error::expression(format!("empty expression [{source}]")));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            named_fields,
            ops: Vec::new(),
            source,
        };
        parser.parse_bp(0)?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::expression(format!(
                "unexpected trailing input in expression [{source}]"
            )));
        }
        Ok(Expr {
            source: source.to_string(),
            ops: parser.ops,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn eval(&self, env: &EvalEnv<'_>) -> Result<i32> {
        let mut stack: Vec<i32> = Vec::with_capacity(8);

        for op in &self.ops {
            match op {
                Op::Const(v) => stack.push(*v),
                Op::StreamCounter => stack.push(env.counter as i32),
                Op::Field(index) => {
                    let info = &env.named_fields[*index];
                    let value = env.numeric.get(&info.path).ok_or_else(|| {
                        Error::expression(format!(
                            "no value parsed yet for field '{}'",
                            info.path
                        ))
                    })?;
                    stack.push(value as i32);
                }
                Op::External(name) => {
                    let provider = env.external.ok_or_else(|| {
                        Error::expression(format!(
                            "no external value provider for '${name}'"
                        ))
                    })?;
                    let value = provider.provide(name).ok_or_else(|| {
                        Error::expression(format!("unresolved external name '${name}'"))
                    })?;
                    stack.push(value);
                }
                Op::Neg | Op::BitNot => {
                    let v = pop(&mut stack)?;
                    stack.push(match op {
                        Op::Neg => v.wrapping_neg(),
                        _ => !v,
                    });
                }
                _ => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    let value = match op {
                        Op::Mul => lhs.wrapping_mul(rhs),
                        Op::Div => {
                            if rhs == 0 {
                                return Err(Error::expression(format!(
                                    "division by zero [{}]",
                                    self.source
                                )));
                            }
                            lhs.wrapping_div(rhs)
                        }
                        Op::Rem => {
                            if rhs == 0 {
                                return Err(Error::expression(format!(
                                    "modulus by zero [{}]",
                                    self.source
                                )));
                            }
                            lhs.wrapping_rem(rhs)
                        }
                        Op::Add => lhs.wrapping_add(rhs),
                        Op::Sub => lhs.wrapping_sub(rhs),
                        Op::Shl => lhs.wrapping_shl(rhs as u32),
                        Op::Shr => lhs.wrapping_shr(rhs as u32),
                        Op::Ushr => ((lhs as u32).wrapping_shr(rhs as u32)) as i32,
                        Op::And => lhs & rhs,
                        Op::Or => lhs | rhs,
                        Op::Xor => lhs ^ rhs,
                        _ => {
                            return Err(Error::Internal {
                                message: "malformed expression tape".to_string(),
                            })
                        }
                    };
                    stack.push(value);
                }
            }
        }

        match (stack.pop(), stack.is_empty()) {
            (Some(v), true) => Ok(v),
            _ => Err(Error::Internal {
                message: format!("unbalanced expression tape [{}]", self.source),
            }),
        }
    }
}

fn pop(stack: &mut Vec<i32>) -> Result<i32> {
    stack.pop().ok_or_else(|| Error::Internal {
        message: "expression stack underflow".to_string(),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum ExprToken {
    Num(i32),
    Ident(String),
    External(String),
    Counter,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Shl,
    Shr,
    Ushr,
    Amp,
    Pipe,
    Caret,
    Tilde,
    LParen,
    RParen,
}

fn lex(source: &str) -> Result<Vec<ExprToken>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    let ident_at = |start: usize| -> usize {
        let mut end = start;
        while bytes.get(end).is_some_and(|c| {
            c.is_ascii_alphanumeric() || *c == b'_' || *c == b'.' || *c == b'$'
        }) {
            end += 1;
        }
        end
    };

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'0'..=b'9' => {
                let start = i;
                while bytes.get(i).is_some_and(|c| c.is_ascii_digit()) {
                    i += 1;
                }
                let text = &source[start..i];
                let value: i32 = text.parse().map_err(|_| {
                    Error::expression(format!("integer literal out of range [{text}]"))
                })?;
                tokens.push(ExprToken::Num(value));
            }
            b'$' => {
                if bytes.get(i + 1) == Some(&b'$') {
                    tokens.push(ExprToken::Counter);
                    i += 2;
                } else {
                    let end = ident_at(i + 1);
                    if end == i + 1 {
                        return Err(Error::expression(format!(
                            "dangling '$' in expression [{source}]"
                        )));
                    }
                    tokens.push(ExprToken::External(source[i + 1..end].to_ascii_lowercase()));
                    i = end;
                }
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let end = ident_at(i);
                tokens.push(ExprToken::Ident(source[i..end].to_ascii_lowercase()));
                i = end;
            }
            b'+' => {
                tokens.push(ExprToken::Plus);
                i += 1;
            }
            b'-' => {
                tokens.push(ExprToken::Minus);
                i += 1;
            }
            b'*' => {
                tokens.push(ExprToken::Star);
                i += 1;
            }
            b'/' => {
                tokens.push(ExprToken::Slash);
                i += 1;
            }
            b'%' => {
                tokens.push(ExprToken::Percent);
                i += 1;
            }
            b'~' => {
                tokens.push(ExprToken::Tilde);
                i += 1;
            }
            b'&' => {
                tokens.push(ExprToken::Amp);
                i += 1;
            }
            b'|' => {
                tokens.push(ExprToken::Pipe);
                i += 1;
            }
            b'^' => {
                tokens.push(ExprToken::Caret);
                i += 1;
            }
            b'(' => {
                tokens.push(ExprToken::LParen);
                i += 1;
            }
            b')' => {
                tokens.push(ExprToken::RParen);
                i += 1;
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'<') {
                    tokens.push(ExprToken::Shl);
                    i += 2;
                } else {
                    return Err(Error::expression(format!(
                        "unexpected '<' in expression [{source}]"
                    )));
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'>') {
                    if bytes.get(i + 2) == Some(&b'>') {
                        tokens.push(ExprToken::Ushr);
                        i += 3;
                    } else {
                        tokens.push(ExprToken::Shr);
                        i += 2;
                    }
                } else {
                    return Err(Error::expression(format!(
                        "unexpected '>' in expression [{source}]"
                    )));
                }
            }
            other => {
                return Err(Error::expression(format!(
                    "unexpected char '{}' in expression [{source}]",
                    other as char
                )))
            }
        }
    }

    Ok(tokens)
}

/// Binding powers, higher binds tighter. Left and right of each infix op.
#[derive(Debug, Clone, Copy)]
struct Bp(u8, u8);

const BP_XOR: Bp = Bp(1, 2);
const BP_OR: Bp = Bp(3, 4);
const BP_AND: Bp = Bp(5, 6);
const BP_SHIFT: Bp = Bp(7, 8);
const BP_ADD: Bp = Bp(9, 10);
const BP_MUL: Bp = Bp(11, 12);
const BP_PREFIX: u8 = 13;

struct Parser<'a> {
    tokens: Vec<ExprToken>,
    pos: usize,
    named_fields: &'a [NamedFieldInfo],
    ops: Vec<Op>,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&ExprToken> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<ExprToken> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_prefix(&mut self) -> Result<()> {
        match self.next() {
            Some(ExprToken::Num(v)) => self.ops.push(Op::Const(v)),
            Some(ExprToken::Counter) => self.ops.push(Op::StreamCounter),
            Some(ExprToken::External(name)) => self.ops.push(Op::External(name)),
            Some(ExprToken::Ident(name)) => {
                let index = self
                    .named_fields
                    .iter()
                    .rposition(|f| f.path == name)
                    .ok_or_else(|| {
                        Error::expression(format!(
                            "unresolved name '{name}' in expression [{}]",
                            self.source
                        ))
                    })?;
                self.ops.push(Op::Field(index));
            }
            Some(ExprToken::Minus) => {
                self.parse_bp(BP_PREFIX)?;
                self.ops.push(Op::Neg);
            }
            Some(ExprToken::Tilde) => {
                self.parse_bp(BP_PREFIX)?;
                self.ops.push(Op::BitNot);
            }
            Some(ExprToken::LParen) => {
                self.parse_bp(0)?;
                match self.next() {
                    Some(ExprToken::RParen) => {}
                    _ => {
                        return Err(Error::expression(format!(
                            "missing ')' in expression [{}]",
                            self.source
                        )))
                    }
                }
            }
            other => {
                return Err(Error::expression(format!(
                    "unexpected token {other:?} in expression [{}]",
                    self.source
                )))
            }
        }
        Ok(())
    }

    fn parse_bp(&mut self, min_bp: u8) -> Result<()> {
        self.parse_prefix()?;

        while let Some(tok) = self.peek() {
            let (bp, op) = match tok {
                ExprToken::Star => (BP_MUL, Op::Mul),
                ExprToken::Slash => (BP_MUL, Op::Div),
                ExprToken::Percent => (BP_MUL, Op::Rem),
                ExprToken::Plus => (BP_ADD, Op::Add),
                ExprToken::Minus => (BP_ADD, Op::Sub),
                ExprToken::Shl => (BP_SHIFT, Op::Shl),
                ExprToken::Shr => (BP_SHIFT, Op::Shr),
                ExprToken::Ushr => (BP_SHIFT, Op::Ushr),
                ExprToken::Amp => (BP_AND, Op::And),
                ExprToken::Pipe => (BP_OR, Op::Or),
                ExprToken::Caret => (BP_XOR, Op::Xor),
                _ => break,
            };
            if bp.0 < min_bp {
                break;
            }
            self.pos += 1;
            self.parse_bp(bp.1)?;
            self.ops.push(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(paths: &[&str]) -> Vec<NamedFieldInfo> {
        paths
            .iter()
            .enumerate()
            .map(|(i, p)| NamedFieldInfo {
                path: p.to_string(),
                name: p.rsplit('.').next().unwrap().to_string(),
                offset: i,
            })
            .collect()
    }

    fn eval(source: &str, fields: &[(&str, i64)], external: Option<&dyn ExternalValueProvider>) -> Result<i32> {
        let infos = named(&fields.iter().map(|(p, _)| *p).collect::<Vec<_>>());
        let expr = Expr::compile(source, &infos)?;
        let mut numeric = NumericMap::new();
        for (path, value) in fields {
            numeric.put(path, *value);
        }
        expr.eval(&EvalEnv {
            named_fields: &infos,
            numeric: &numeric,
            external,
            counter: 0,
        })
    }

    #[test]
    fn test_literals_and_precedence() {
        assert_eq!(eval("2+3*4", &[], None).unwrap(), 14);
        assert_eq!(eval("(2+3)*4", &[], None).unwrap(), 20);
        assert_eq!(eval("1<<4+1", &[], None).unwrap(), 32);
        assert_eq!(eval("255&15|16", &[], None).unwrap(), 31);
        // `^` binds loosest of all.
        assert_eq!(eval("1^2|4", &[], None).unwrap(), 1 ^ (2 | 4));
        assert_eq!(eval("3&1^1", &[], None).unwrap(), (3 & 1) ^ 1);
    }

    #[test]
    fn test_unary_ops() {
        assert_eq!(eval("-5+2", &[], None).unwrap(), -3);
        assert_eq!(eval("~0", &[], None).unwrap(), -1);
        assert_eq!(eval("-(2*3)", &[], None).unwrap(), -6);
        assert_eq!(eval("~-1", &[], None).unwrap(), 0);
    }

    #[test]
    fn test_wrapping_semantics() {
        assert_eq!(
            eval("2147483647+1", &[], None).unwrap(),
            i32::MIN
        );
        assert_eq!(eval("-2147483647-2", &[], None).unwrap(), i32::MAX);
        // Shift counts wrap modulo 32.
        assert_eq!(eval("1<<33", &[], None).unwrap(), 2);
        assert_eq!(eval("-8>>1", &[], None).unwrap(), -4);
        assert_eq!(eval("-8>>>1", &[], None).unwrap(), ((-8i32 as u32) >> 1) as i32);
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(
            eval("10/0", &[], None),
            Err(Error::Expression { .. })
        ));
        assert!(matches!(
            eval("10%0", &[], None),
            Err(Error::Expression { .. })
        ));
    }

    #[test]
    fn test_field_references() {
        assert_eq!(eval("len*2", &[("len", 21)], None).unwrap(), 42);
        assert_eq!(
            eval("hdr.size-4", &[("hdr.size", 10)], None).unwrap(),
            6
        );
        // Case-insensitive: identifiers are lowercased at compile time.
        assert_eq!(eval("LEN", &[("len", 7)], None).unwrap(), 7);
    }

    #[test]
    fn test_shadowing_resolves_to_latest() {
        let infos = named(&["n", "s.n", "n"]);
        let expr = Expr::compile("n", &infos).unwrap();
        let mut numeric = NumericMap::new();
        numeric.put("n", 9);
        let env = EvalEnv {
            named_fields: &infos,
            numeric: &numeric,
            external: None,
            counter: 0,
        };
        assert_eq!(expr.eval(&env).unwrap(), 9);
    }

    #[test]
    fn test_unresolved_name_is_compile_error() {
        assert!(matches!(
            Expr::compile("missing+1", &[]),
            Err(Error::Expression { .. })
        ));
    }

    #[test]
    fn test_external_and_counter() {
        let provider = |name: &str| (name == "limit").then_some(100);
        assert_eq!(
            eval("$limit/4", &[], Some(&provider)).unwrap(),
            25
        );
        assert!(matches!(
            eval("$other", &[], Some(&provider)),
            Err(Error::Expression { .. })
        ));
        assert!(matches!(eval("$limit", &[], None), Err(Error::Expression { .. })));

        let infos = named(&[]);
        let expr = Expr::compile("$$+2", &infos).unwrap();
        let numeric = NumericMap::new();
        let env = EvalEnv {
            named_fields: &infos,
            numeric: &numeric,
            external: None,
            counter: 7,
        };
        assert_eq!(expr.eval(&env).unwrap(), 9);
    }

    #[test]
    fn test_missing_runtime_value() {
        let infos = named(&["ghost"]);
        let expr = Expr::compile("ghost", &infos).unwrap();
        let numeric = NumericMap::new();
        let env = EvalEnv {
            named_fields: &infos,
            numeric: &numeric,
            external: None,
            counter: 0,
        };
        assert!(matches!(expr.eval(&env), Err(Error::Expression { .. })));
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(Expr::compile("", &[]).is_err());
        assert!(Expr::compile("1+", &[]).is_err());
        assert!(Expr::compile("(1", &[]).is_err());
        assert!(Expr::compile("1 2", &[]).is_err());
        assert!(Expr::compile("$", &[]).is_err());
        assert!(Expr::compile("1<2", &[]).is_err());
    }

    #[test]
    fn test_large_mixed_expression() {
        let fields: &[(&str, i64)] = &[
            ("lrn", 1000),
            ("aaa", 5),
            ("somevar", 3),
            ("bitf", 0),
            ("kkk", 7),
            ("bbb", 99),
        ];
        let provider = |name: &str| (name == "joomla").then_some(255);
        let result = eval(
            "(lrn/aaa*1*(2*somevar-4)&$joomla)/(100%9>>bitf)&56|~kkk^78&bbb",
            fields,
            Some(&provider),
        )
        .unwrap();

        let a = (1000 / 5 * 1 * (2 * 3 - 4)) & 255;
        let b = (100 % 9) >> 0;
        let expected = ((a / b & 56) | !7) ^ (78 & 99);
        assert_eq!(result, expected);
    }
}
