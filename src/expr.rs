//! Boolean expression trees over event predicates.
//!
//! Queries arrive as a normalized tree of conjunctions, disjunctions,
//! negations, and predicates. A predicate pairs an extractor (which
//! columns to look at) with a relational operator and a constant value.
//! The meta-index, partition indexes, and the final row filter all walk
//! the same tree.
//!
//! The text form accepted by [`Expression::parse`]:
//!
//! ```text
//! expr      := conj ('||' conj)*
//! conj      := primary ('&&' primary)*
//! primary   := '!' primary | '(' expr ')' | predicate
//! predicate := lhs op literal
//! lhs       := '#timestamp' | '#type' | ':' typename | field.path
//! op        := == != < <= > >= in !in ni !ni ~ !~
//! ```
//!
//! Literals: integers, floats, `true`/`false`, double-quoted strings,
//! `/regex/` patterns, addresses, subnets (`10.0.0.0/8`), ports
//! (`80/tcp`), and `@N` timestamps (nanoseconds).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::{Field, RecordType, Type, ATTR_TIMESTAMP};
use crate::value::{self, RelOp, Value};

// -- Tree -----------------------------------------------------------------

/// Selects the columns a predicate applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Extractor {
    /// Columns whose field carries the `timestamp` attribute.
    Timestamp,
    /// The layout name itself, not a column.
    EventType,
    /// Columns whose name ends with the given key.
    Key(String),
    /// Columns of exactly the given type.
    Type(Type),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub lhs: Extractor,
    pub op: RelOp,
    pub rhs: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Conjunction(Vec<Expression>),
    Disjunction(Vec<Expression>),
    Negation(Box<Expression>),
    Predicate(Predicate),
}

impl Expression {
    /// Does this field match the predicate's extractor? `EventType` never
    /// matches a field; callers handle it against the layout name.
    pub fn field_matches(extractor: &Extractor, field: &Field) -> bool {
        match extractor {
            Extractor::Timestamp => field.has_attribute(ATTR_TIMESTAMP),
            Extractor::EventType => false,
            Extractor::Key(key) => field.name.ends_with(key.as_str()),
            Extractor::Type(ty) => field.ty.resolve() == ty.resolve(),
        }
    }

    /// Evaluate the expression against one flattened event row.
    pub fn matches_event(&self, layout: &RecordType, row: &[Value]) -> bool {
        match self {
            Expression::Conjunction(xs) => xs.iter().all(|x| x.matches_event(layout, row)),
            Expression::Disjunction(xs) => xs.iter().any(|x| x.matches_event(layout, row)),
            Expression::Negation(x) => !x.matches_event(layout, row),
            Expression::Predicate(p) => {
                if let Extractor::EventType = p.lhs {
                    let name = Value::String(layout.name.clone());
                    return value::evaluate(&name, p.op, &p.rhs);
                }
                layout
                    .fields
                    .iter()
                    .zip(row)
                    .filter(|(f, _)| Self::field_matches(&p.lhs, f))
                    .any(|(_, cell)| value::evaluate(cell, p.op, &p.rhs))
            }
        }
    }

    /// Parse the textual expression form.
    pub fn parse(input: &str) -> Result<Expression> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::InvalidArgument(format!(
                "trailing input after expression: {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }
}

// -- Tokenizer ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    AndAnd,
    OrOr,
    Bang,
    Op(RelOp),
    /// Bare word: field path, literal, extractor, number, address, ...
    Word(String),
    Str(String),
    Regex(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(Error::InvalidArgument("expected '&&'".into()));
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(Error::InvalidArgument("expected '||'".into()));
                }
                tokens.push(Token::OrOr);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(Error::InvalidArgument("expected '=='".into()));
                }
                tokens.push(Token::Op(RelOp::Equal));
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(RelOp::LessEqual));
                } else {
                    tokens.push(Token::Op(RelOp::Less));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(RelOp::GreaterEqual));
                } else {
                    tokens.push(Token::Op(RelOp::Greater));
                }
            }
            '~' => {
                chars.next();
                tokens.push(Token::Op(RelOp::Match));
            }
            '!' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::Op(RelOp::NotEqual));
                    }
                    Some('~') => {
                        chars.next();
                        tokens.push(Token::Op(RelOp::NotMatch));
                    }
                    Some(c2) if c2.is_alphabetic() => {
                        // "!in" / "!ni"
                        let word = take_word(&mut chars);
                        match word.as_str() {
                            "in" => tokens.push(Token::Op(RelOp::NotIn)),
                            "ni" => tokens.push(Token::Op(RelOp::NotNi)),
                            other => {
                                return Err(Error::InvalidArgument(format!(
                                    "unknown operator: !{other}"
                                )))
                            }
                        }
                    }
                    _ => tokens.push(Token::Bang),
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e) => s.push(e),
                            None => {
                                return Err(Error::InvalidArgument(
                                    "unterminated string literal".into(),
                                ))
                            }
                        },
                        Some(c2) => s.push(c2),
                        None => {
                            return Err(Error::InvalidArgument(
                                "unterminated string literal".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '/' if matches!(tokens.last(), Some(Token::Op(_))) => {
                // A regex literal can only follow an operator.
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('/') => break,
                        Some(c2) => s.push(c2),
                        None => {
                            return Err(Error::InvalidArgument(
                                "unterminated pattern literal".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Regex(s));
            }
            _ => {
                let word = take_word(&mut chars);
                if word.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "unexpected character: {c:?}"
                    )));
                }
                match word.as_str() {
                    "in" => tokens.push(Token::Op(RelOp::In)),
                    "ni" => tokens.push(Token::Op(RelOp::Ni)),
                    _ => tokens.push(Token::Word(word)),
                }
            }
        }
    }
    Ok(tokens)
}

fn take_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || matches!(c, '.' | '_' | ':' | '#' | '-' | '/' | '@' | '+') {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

// -- Parser ---------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expression(&mut self) -> Result<Expression> {
        let mut terms = vec![self.conjunction()?];
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            terms.push(self.conjunction()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Expression::Disjunction(terms)
        })
    }

    fn conjunction(&mut self) -> Result<Expression> {
        let mut terms = vec![self.primary()?];
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            terms.push(self.primary()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Expression::Conjunction(terms)
        })
    }

    fn primary(&mut self) -> Result<Expression> {
        match self.next() {
            Some(Token::Bang) => Ok(Expression::Negation(Box::new(self.primary()?))),
            Some(Token::LParen) => {
                let expr = self.expression()?;
                if self.next() != Some(Token::RParen) {
                    return Err(Error::InvalidArgument("expected ')'".into()));
                }
                Ok(expr)
            }
            Some(Token::Word(lhs)) => {
                let extractor = parse_extractor(&lhs)?;
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "expected operator after {lhs:?}, got {other:?}"
                        )))
                    }
                };
                let rhs = match self.next() {
                    Some(Token::Word(w)) => parse_literal(&w)?,
                    Some(Token::Str(s)) => Value::String(s),
                    Some(Token::Regex(r)) => Value::Pattern(crate::value::Pattern::new(r)?),
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "expected literal, got {other:?}"
                        )))
                    }
                };
                Ok(Expression::Predicate(Predicate {
                    lhs: extractor,
                    op,
                    rhs,
                }))
            }
            other => Err(Error::InvalidArgument(format!(
                "expected predicate, got {other:?}"
            ))),
        }
    }
}

fn parse_extractor(word: &str) -> Result<Extractor> {
    if word == "#timestamp" {
        return Ok(Extractor::Timestamp);
    }
    if word == "#type" {
        return Ok(Extractor::EventType);
    }
    if let Some(name) = word.strip_prefix(':') {
        let ty = match name {
            "bool" => Type::Bool,
            "int" | "integer" => Type::Integer,
            "count" => Type::Count,
            "real" => Type::Real,
            "duration" => Type::Duration,
            "time" => Type::Time,
            "string" => Type::String,
            "addr" | "address" => Type::Address,
            "subnet" => Type::Subnet,
            "port" => Type::Port,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unknown type extractor: :{other}"
                )))
            }
        };
        return Ok(Extractor::Type(ty));
    }
    Ok(Extractor::Key(word.to_string()))
}

/// Parse a bare-word literal: timestamp, bool, port, subnet, address, or
/// number. Falls back to a string.
fn parse_literal(word: &str) -> Result<Value> {
    if let Some(ns) = word.strip_prefix('@') {
        let ns: i64 = ns
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad timestamp: {word}")))?;
        return Ok(Value::Time(ns));
    }
    match word {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "nil" => return Ok(Value::Nil),
        _ => {}
    }
    if word.contains('/') {
        if let Ok(port) = word.parse::<crate::value::Port>() {
            return Ok(Value::Port(port));
        }
        if let Ok(subnet) = word.parse::<crate::value::Subnet>() {
            return Ok(Value::Subnet(subnet));
        }
    }
    if let Ok(addr) = word.parse::<crate::value::Address>() {
        return Ok(Value::Address(addr));
    }
    if let Ok(x) = word.parse::<i64>() {
        return Ok(Value::Integer(x));
    }
    if let Ok(x) = word.parse::<u64>() {
        return Ok(Value::Count(x));
    }
    if let Ok(x) = word.parse::<f64>() {
        return Ok(Value::real(x));
    }
    Ok(Value::String(word.to_string()))
}

// -- Tests ----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;

    fn layout() -> RecordType {
        RecordType::new(
            "conn",
            vec![
                Field::new("ts", Type::Time).with_attributes(vec![Attribute::flag(ATTR_TIMESTAMP)]),
                Field::new("orig_h", Type::Address),
                Field::new("msg", Type::String),
                Field::new("bytes", Type::Integer),
            ],
        )
    }

    fn row() -> Vec<Value> {
        vec![
            Value::Time(1000),
            Value::Address("10.0.0.1".parse().unwrap()),
            Value::String("GET /index".into()),
            Value::Integer(512),
        ]
    }

    #[test]
    fn test_parse_predicate() {
        let e = Expression::parse("bytes > 100").unwrap();
        match e {
            Expression::Predicate(p) => {
                assert_eq!(p.lhs, Extractor::Key("bytes".into()));
                assert_eq!(p.op, RelOp::Greater);
                assert_eq!(p.rhs, Value::Integer(100));
            }
            other => panic!("expected predicate, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_boolean_structure() {
        let e = Expression::parse("bytes > 100 && msg == \"x\" || ! (ts < @5)").unwrap();
        match e {
            Expression::Disjunction(terms) => {
                assert_eq!(terms.len(), 2);
                assert!(matches!(terms[0], Expression::Conjunction(_)));
                assert!(matches!(terms[1], Expression::Negation(_)));
            }
            other => panic!("expected disjunction, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_literals() {
        let cases = [
            ("x == 10.0.0.1", Value::Address("10.0.0.1".parse().unwrap())),
            ("x in 10.0.0.0/8", Value::Subnet("10.0.0.0/8".parse().unwrap())),
            ("x == 80/tcp", Value::Port(crate::value::Port::new(80, crate::value::Proto::Tcp))),
            ("x == true", Value::Bool(true)),
            ("x == -3", Value::Integer(-3)),
            ("x == 2.5", Value::real(2.5)),
            ("x == @99", Value::Time(99)),
        ];
        for (input, want) in cases {
            match Expression::parse(input).unwrap() {
                Expression::Predicate(p) => assert_eq!(p.rhs, want, "for {input}"),
                other => panic!("expected predicate for {input}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_extractors() {
        let e = Expression::parse("#timestamp > @0").unwrap();
        assert!(
            matches!(e, Expression::Predicate(Predicate { lhs: Extractor::Timestamp, .. }))
        );
        let e = Expression::parse("#type == \"conn\"").unwrap();
        assert!(
            matches!(e, Expression::Predicate(Predicate { lhs: Extractor::EventType, .. }))
        );
        let e = Expression::parse(":addr == 10.0.0.1").unwrap();
        assert!(matches!(
            e,
            Expression::Predicate(Predicate { lhs: Extractor::Type(Type::Address), .. })
        ));
    }

    #[test]
    fn test_parse_regex_literal() {
        let e = Expression::parse("msg ~ /GET .*/").unwrap();
        match e {
            Expression::Predicate(p) => {
                assert_eq!(p.op, RelOp::Match);
                assert!(matches!(p.rhs, Value::Pattern(_)));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("").is_err());
        assert!(Expression::parse("a ==").is_err());
        assert!(Expression::parse("a == 1 &&").is_err());
        assert!(Expression::parse("(a == 1").is_err());
        assert!(Expression::parse("a == 1 extra").is_err());
    }

    #[test]
    fn test_matches_event() {
        let layout = layout();
        let row = row();
        let cases = [
            ("bytes > 100", true),
            ("bytes > 1000", false),
            ("orig_h in 10.0.0.0/8", true),
            ("orig_h in 192.168.0.0/16", false),
            ("msg ~ /GET .*/", true),
            ("#type == \"conn\"", true),
            ("#type == \"dns\"", false),
            ("#timestamp >= @1000", true),
            ("bytes > 100 && msg ~ /POST .*/", false),
            ("bytes > 100 || msg ~ /POST .*/", true),
            ("!(bytes > 1000)", true),
            ("nonexistent == 1", false),
        ];
        for (input, want) in cases {
            let e = Expression::parse(input).unwrap();
            assert_eq!(e.matches_event(&layout, &row), want, "for {input}");
        }
    }

    #[test]
    fn test_key_extractor_suffix_match() {
        // Dotted field names match by suffix.
        let layout = RecordType::new(
            "conn",
            vec![Field::new("id.orig_h", Type::Address)],
        );
        let row = vec![Value::Address("10.0.0.1".parse().unwrap())];
        let e = Expression::parse("orig_h == 10.0.0.1").unwrap();
        assert!(e.matches_event(&layout, &row));
    }
}
