//! Search expressions.
//!
//! Backends hand the cache s-expressions such as
//! `(and (contains "full_name" "brown") (exists "email"))`. A parsed
//! [`Query`] can be evaluated in memory against a record's summary fields
//! (for live cursor updates) or compiled to an SQL predicate over the
//! `summary` table. Both paths share one set of matching rules.

use rusqlite::types::Value;

use crate::error::{CacheError, Result};
use crate::record::MetaFields;
use crate::search;

/// Pseudo-field matching any summary field.
pub const ANY_FIELD: &str = "x-evolution-any-field";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTest {
    Contains,
    Is,
    BeginsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRef {
    Any,
    Uid,
    Named(String),
}

impl FieldRef {
    fn parse(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            ANY_FIELD => FieldRef::Any,
            "uid" | "id" => FieldRef::Uid,
            _ => FieldRef::Named(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    True,
    False,
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
    Test {
        test: FieldTest,
        field: FieldRef,
        /// Normalized needle; raw for uid tests.
        value: String,
    },
    Exists(FieldRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Str(String),
    Symbol(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some(escaped) => s.push(escaped),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err(CacheError::InvalidQuery(
                        "unterminated string literal".to_string(),
                    ));
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut sym = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    sym.push(c);
                    chars.next();
                }
                tokens.push(Token::Symbol(sym));
            }
        }
    }
    Ok(tokens)
}

/// Deepest nesting of calls accepted from a client.
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<Query> {
        match self.next() {
            Some(Token::Symbol(sym)) if sym == "#t" => Ok(Query::True),
            Some(Token::Symbol(sym)) if sym == "#f" => Ok(Query::False),
            Some(Token::Open) => {
                if self.depth >= MAX_DEPTH {
                    return Err(CacheError::InvalidQuery(
                        "expression nested too deeply".to_string(),
                    ));
                }
                self.depth += 1;
                let query = self.call();
                self.depth -= 1;
                query
            }
            Some(other) => Err(CacheError::InvalidQuery(format!(
                "unexpected token {:?}",
                other
            ))),
            None => Err(CacheError::InvalidQuery(
                "unexpected end of expression".to_string(),
            )),
        }
    }

    fn string_arg(&mut self, function: &str) -> Result<String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            _ => Err(CacheError::InvalidQuery(format!(
                "`{}` expects string arguments",
                function
            ))),
        }
    }

    fn close(&mut self, function: &str) -> Result<()> {
        match self.next() {
            Some(Token::Close) => Ok(()),
            _ => Err(CacheError::InvalidQuery(format!(
                "wrong number of arguments to `{}`",
                function
            ))),
        }
    }

    fn call(&mut self) -> Result<Query> {
        let function = match self.next() {
            Some(Token::Symbol(sym)) => sym,
            _ => {
                return Err(CacheError::InvalidQuery(
                    "expected a function name after `(`".to_string(),
                ))
            }
        };

        match function.as_str() {
            "and" | "or" => {
                let mut args = Vec::new();
                while self.peek() != Some(&Token::Close) {
                    if self.peek().is_none() {
                        return Err(CacheError::InvalidQuery(format!(
                            "unbalanced parentheses in `{}`",
                            function
                        )));
                    }
                    args.push(self.expr()?);
                }
                self.next();
                Ok(if function == "and" {
                    Query::And(args)
                } else {
                    Query::Or(args)
                })
            }
            "not" => {
                let inner = self.expr()?;
                self.close(&function)?;
                Ok(Query::Not(Box::new(inner)))
            }
            "exists" => {
                let field = self.string_arg(&function)?;
                self.close(&function)?;
                Ok(Query::Exists(FieldRef::parse(&field)))
            }
            "contains" | "is" | "beginswith" | "endswith" => {
                let test = match function.as_str() {
                    "contains" => FieldTest::Contains,
                    "is" => FieldTest::Is,
                    "beginswith" => FieldTest::BeginsWith,
                    _ => FieldTest::EndsWith,
                };
                let field = FieldRef::parse(&self.string_arg(&function)?);
                let raw = self.string_arg(&function)?;
                self.close(&function)?;
                let value = match field {
                    FieldRef::Uid => raw,
                    _ => search::normalize(&raw),
                };
                Ok(Query::Test { test, field, value })
            }
            other => Err(CacheError::InvalidQuery(format!(
                "unknown function `{}`",
                other
            ))),
        }
    }
}

impl Query {
    /// Parse an expression. Empty input means "match everything" and
    /// yields `None`.
    pub fn parse(input: &str) -> Result<Option<Query>> {
        if input.trim().is_empty() {
            return Ok(None);
        }
        let mut parser = Parser {
            tokens: tokenize(input)?,
            pos: 0,
            depth: 0,
        };
        let query = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(CacheError::InvalidQuery(
                "trailing input after expression".to_string(),
            ));
        }
        Ok(Some(query))
    }

    /// Evaluate against a record held in memory.
    pub fn matches(&self, uid: &str, meta: &MetaFields) -> bool {
        match self {
            Query::True => true,
            Query::False => false,
            Query::And(args) => args.iter().all(|q| q.matches(uid, meta)),
            Query::Or(args) => args.iter().any(|q| q.matches(uid, meta)),
            Query::Not(inner) => !inner.matches(uid, meta),
            Query::Exists(FieldRef::Uid) => !uid.is_empty(),
            Query::Exists(FieldRef::Any) => meta.iter().any(|m| !m.value.is_empty()),
            Query::Exists(FieldRef::Named(name)) => meta.values(name).any(|v| !v.is_empty()),
            Query::Test { test, field, value } => match field {
                FieldRef::Uid => test_text(*test, uid, value),
                FieldRef::Any => {
                    (*test == FieldTest::Contains && value.is_empty())
                        || meta
                            .iter()
                            .any(|m| test_text(*test, &search::normalize(&m.value), value))
                }
                FieldRef::Named(name) => meta
                    .values(name)
                    .any(|v| test_text(*test, &search::normalize(v), value)),
            },
        }
    }

    /// Compile to an SQL predicate over the objects table aliased `o`,
    /// appending bound parameters to `params`.
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        match self {
            Query::True => "1".to_string(),
            Query::False => "0".to_string(),
            Query::And(args) if args.is_empty() => "1".to_string(),
            Query::Or(args) if args.is_empty() => "0".to_string(),
            Query::And(args) => join_sql(args, " AND ", params),
            Query::Or(args) => join_sql(args, " OR ", params),
            Query::Not(inner) => format!("NOT ({})", inner.to_sql(params)),
            Query::Exists(FieldRef::Uid) => "o.uid != ''".to_string(),
            Query::Exists(FieldRef::Any) => {
                "EXISTS (SELECT 1 FROM summary s WHERE s.uid = o.uid AND s.value != '')"
                    .to_string()
            }
            Query::Exists(FieldRef::Named(name)) => {
                params.push(Value::Text(name.clone()));
                "EXISTS (SELECT 1 FROM summary s WHERE s.uid = o.uid AND s.field = ? AND s.value != '')"
                    .to_string()
            }
            Query::Test { test, field, value } => {
                let (op, pattern) = match test {
                    FieldTest::Is => ("=", value.clone()),
                    FieldTest::Contains => ("LIKE", search::contains_pattern(value)),
                    FieldTest::BeginsWith => ("LIKE", search::prefix_pattern(value)),
                    FieldTest::EndsWith => ("LIKE", search::suffix_pattern(value)),
                };
                let escape = if op == "LIKE" { " ESCAPE '\\'" } else { "" };
                match field {
                    FieldRef::Uid => {
                        params.push(Value::Text(pattern));
                        format!("o.uid {} ?{}", op, escape)
                    }
                    FieldRef::Any if *test == FieldTest::Contains && value.is_empty() => {
                        "1".to_string()
                    }
                    FieldRef::Any => {
                        params.push(Value::Text(pattern));
                        format!(
                            "EXISTS (SELECT 1 FROM summary s WHERE s.uid = o.uid AND s.value_norm {} ?{})",
                            op, escape
                        )
                    }
                    FieldRef::Named(name) => {
                        params.push(Value::Text(name.clone()));
                        params.push(Value::Text(pattern));
                        format!(
                            "EXISTS (SELECT 1 FROM summary s WHERE s.uid = o.uid AND s.field = ? AND s.value_norm {} ?{})",
                            op, escape
                        )
                    }
                }
            }
        }
    }
}

fn join_sql(args: &[Query], sep: &str, params: &mut Vec<Value>) -> String {
    let parts: Vec<String> = args
        .iter()
        .map(|q| format!("({})", q.to_sql(params)))
        .collect();
    parts.join(sep)
}

fn test_text(test: FieldTest, haystack: &str, needle: &str) -> bool {
    match test {
        FieldTest::Contains => haystack.contains(needle),
        FieldTest::Is => haystack == needle,
        FieldTest::BeginsWith => haystack.starts_with(needle),
        FieldTest::EndsWith => haystack.ends_with(needle),
    }
}
