//! An SQL subset over dataset-backed relations.
//!
//! Supports `SELECT <cols|*> FROM user/name [AS alias] [WHERE col op lit
//! [AND …]] [ORDER BY col [ASC|DESC]] [LIMIT n [OFFSET m]]`. Table
//! identifiers are dataset refs, resolved through the loader by the method
//! layer; this module owns parsing and execution over an in-memory table.

use serde_json::Value;

use crate::dataset::{schema_columns, Dataset};
use crate::error::Error;

// ── Tokens ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Star,
    Comma,
    Slash,
    Dot,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(input: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(Error::validation("sql: expected != "));
                }
                tokens.push(Token::Ne);
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => s.push(ch),
                        None => return Err(Error::validation("sql: unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = s
                    .parse::<f64>()
                    .map_err(|_| Error::validation(format!("sql: bad number {s:?}")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => {
                return Err(Error::validation(format!(
                    "sql: unexpected character {other:?}"
                )))
            }
        }
    }
    Ok(tokens)
}

// ── AST ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Select {
    All,
    Columns(Vec<SelectColumn>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub column: String,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Cmp {
        column: String,
        op: CmpOp,
        value: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub select: Select,
    /// The table's dataset ref, `username/name`.
    pub table: String,
    pub alias: Option<String>,
    pub filter: Option<Expr>,
    pub order_by: Option<(String, bool)>,
    pub limit: Option<usize>,
    pub offset: usize,
}

// ── Parser ───────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, Error> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(Error::validation(format!(
                "sql: expected {what}, got {other:?}"
            ))),
        }
    }

    fn keyword(&mut self, word: &str) -> bool {
        if let Some(Token::Ident(s)) = self.peek() {
            if s.eq_ignore_ascii_case(word) {
                self.pos += 1;
                return true;
            }
        }
        false
    }
}

/// Parse a query string.
pub fn parse(input: &str) -> Result<Query, Error> {
    let mut p = Parser {
        tokens: tokenize(input)?,
        pos: 0,
    };
    if !p.keyword("select") {
        return Err(Error::validation("sql: expected SELECT"));
    }

    let select = if p.peek() == Some(&Token::Star) {
        p.next();
        Select::All
    } else {
        let mut columns = Vec::new();
        loop {
            let mut column = p.expect_ident("column name")?;
            // alias.col qualification: keep the column part.
            if p.peek() == Some(&Token::Dot) {
                p.next();
                column = p.expect_ident("column name")?;
            }
            let output_name = if p.keyword("as") {
                p.expect_ident("output name")?
            } else {
                column.clone()
            };
            columns.push(SelectColumn {
                column,
                output_name,
            });
            if p.peek() == Some(&Token::Comma) {
                p.next();
            } else {
                break;
            }
        }
        Select::Columns(columns)
    };

    if !p.keyword("from") {
        return Err(Error::validation("sql: expected FROM"));
    }
    let username = p.expect_ident("table ref")?;
    if p.next() != Some(Token::Slash) {
        return Err(Error::validation(
            "sql: table must be a dataset ref like username/name",
        ));
    }
    let name = p.expect_ident("table ref")?;
    let table = format!("{username}/{name}");

    let alias = if p.keyword("as") {
        Some(p.expect_ident("table alias")?)
    } else {
        None
    };

    let filter = if p.keyword("where") {
        Some(parse_conjunction(&mut p)?)
    } else {
        None
    };

    let order_by = if p.keyword("order") {
        if !p.keyword("by") {
            return Err(Error::validation("sql: expected BY after ORDER"));
        }
        let mut column = p.expect_ident("order column")?;
        if p.peek() == Some(&Token::Dot) {
            p.next();
            column = p.expect_ident("order column")?;
        }
        let ascending = if p.keyword("desc") {
            false
        } else {
            p.keyword("asc");
            true
        };
        Some((column, ascending))
    } else {
        None
    };

    let limit = if p.keyword("limit") {
        match p.next() {
            Some(Token::Number(n)) if n >= 0.0 => Some(n as usize),
            other => {
                return Err(Error::validation(format!(
                    "sql: expected LIMIT count, got {other:?}"
                )))
            }
        }
    } else {
        None
    };

    let offset = if p.keyword("offset") {
        match p.next() {
            Some(Token::Number(n)) if n >= 0.0 => n as usize,
            other => {
                return Err(Error::validation(format!(
                    "sql: expected OFFSET count, got {other:?}"
                )))
            }
        }
    } else {
        0
    };

    if let Some(extra) = p.peek() {
        return Err(Error::validation(format!(
            "sql: unexpected trailing input at {extra:?}"
        )));
    }

    Ok(Query {
        select,
        table,
        alias,
        filter,
        order_by,
        limit,
        offset,
    })
}

fn parse_conjunction(p: &mut Parser) -> Result<Expr, Error> {
    let mut expr = parse_comparison(p)?;
    while p.keyword("and") {
        let rhs = parse_comparison(p)?;
        expr = Expr::And(Box::new(expr), Box::new(rhs));
    }
    Ok(expr)
}

fn parse_comparison(p: &mut Parser) -> Result<Expr, Error> {
    let mut column = p.expect_ident("column name")?;
    if p.peek() == Some(&Token::Dot) {
        p.next();
        column = p.expect_ident("column name")?;
    }
    let op = match p.next() {
        Some(Token::Eq) => CmpOp::Eq,
        Some(Token::Ne) => CmpOp::Ne,
        Some(Token::Lt) => CmpOp::Lt,
        Some(Token::Le) => CmpOp::Le,
        Some(Token::Gt) => CmpOp::Gt,
        Some(Token::Ge) => CmpOp::Ge,
        other => {
            return Err(Error::validation(format!(
                "sql: expected comparison operator, got {other:?}"
            )))
        }
    };
    let value = match p.next() {
        Some(Token::Number(n)) => serde_json::json!(n),
        Some(Token::Str(s)) => Value::String(s),
        Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => Value::Bool(true),
        Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => Value::Bool(false),
        Some(Token::Ident(word)) if word.eq_ignore_ascii_case("null") => Value::Null,
        other => {
            return Err(Error::validation(format!(
                "sql: expected literal, got {other:?}"
            )))
        }
    };
    Ok(Expr::Cmp { column, op, value })
}

// ── Execution ────────────────────────────────────────────────────────────

/// An in-memory relation.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Build a relation from a dataset body.
pub fn table_from_dataset(dataset: &Dataset) -> Result<Table, Error> {
    let rows = dataset.body_rows()?;
    let schema = dataset.structure.as_ref().and_then(|s| s.schema.as_ref());
    let columns = match schema.and_then(schema_columns) {
        Some(cols) => cols,
        None => match rows.first() {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(Value::Array(first)) => (0..first.len()).map(|i| format!("col_{i}")).collect(),
            _ => Vec::new(),
        },
    };
    let materialized: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| match row {
            Value::Array(cells) => cells.clone(),
            Value::Object(map) => columns
                .iter()
                .map(|c| map.get(c).cloned().unwrap_or(Value::Null))
                .collect(),
            other => vec![other.clone()],
        })
        .collect();
    Ok(Table {
        columns,
        rows: materialized,
    })
}

impl Table {
    fn column_index(&self, name: &str) -> Result<usize, Error> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::validation(format!("sql: unknown column {name:?}")))
    }
}

/// Run a parsed query over its table.
pub fn execute(query: &Query, table: &Table) -> Result<Table, Error> {
    let mut rows: Vec<Vec<Value>> = match &query.filter {
        Some(expr) => {
            let mut kept = Vec::new();
            for row in &table.rows {
                if eval(expr, table, row)? {
                    kept.push(row.clone());
                }
            }
            kept
        }
        None => table.rows.clone(),
    };

    if let Some((column, ascending)) = &query.order_by {
        let index = table.column_index(column)?;
        rows.sort_by(|a, b| {
            let ord = compare(a.get(index), b.get(index));
            if *ascending {
                ord
            } else {
                ord.reverse()
            }
        });
    }

    let rows: Vec<Vec<Value>> = rows
        .into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();

    match &query.select {
        Select::All => Ok(Table {
            columns: table.columns.clone(),
            rows,
        }),
        Select::Columns(columns) => {
            let mut indices = Vec::with_capacity(columns.len());
            for selected in columns {
                indices.push(table.column_index(&selected.column)?);
            }
            let projected = rows
                .into_iter()
                .map(|row| {
                    indices
                        .iter()
                        .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect();
            Ok(Table {
                columns: columns.iter().map(|c| c.output_name.clone()).collect(),
                rows: projected,
            })
        }
    }
}

fn eval(expr: &Expr, table: &Table, row: &[Value]) -> Result<bool, Error> {
    match expr {
        Expr::And(lhs, rhs) => Ok(eval(lhs, table, row)? && eval(rhs, table, row)?),
        Expr::Cmp { column, op, value } => {
            let index = table.column_index(column)?;
            let cell = row.get(index).unwrap_or(&Value::Null);
            let ord = compare(Some(cell), Some(value));
            Ok(match op {
                CmpOp::Eq => values_equal(cell, value),
                CmpOp::Ne => !values_equal(cell, value),
                CmpOp::Lt => ord == std::cmp::Ordering::Less,
                CmpOp::Le => ord != std::cmp::Ordering::Greater,
                CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                CmpOp::Ge => ord != std::cmp::Ordering::Less,
            })
        }
    }
}

/// Equality with numeric coercion: literals lex as floats, bodies often
/// carry integers.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Null), Some(Value::Null)) => Ordering::Equal,
        (Some(Value::Null), Some(_)) | (None, Some(_)) => Ordering::Less,
        (Some(_), Some(Value::Null)) | (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Rows as JSON objects keyed by output column name.
pub fn table_to_json(table: &Table) -> Value {
    let rows: Vec<Value> = table
        .rows
        .iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for (i, column) in table.columns.iter().enumerate() {
                object.insert(
                    column.clone(),
                    row.get(i).cloned().unwrap_or(Value::Null),
                );
            }
            Value::Object(object)
        })
        .collect();
    Value::Array(rows)
}
