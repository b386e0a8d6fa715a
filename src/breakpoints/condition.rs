//! Restricted condition language for breakpoints.
//!
//! Conditions read a fixed set of execution-state fields and never run
//! caller code. Example: `tool == file_operations AND tool_usage.shell >= 2`.
//!
//! ```text
//! expr       := or
//! or         := and ("OR" and)*
//! and        := unary ("AND" unary)*
//! unary      := "NOT" unary | "(" expr ")" | comparison
//! comparison := field op literal | field
//! ```

use crate::engine::ExecutionState;
use crate::plan::Sensitivity;
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    StepIndex,
    HistoryLen,
    PlanVersion,
    Tool,
    Sensitivity,
    ToolUsage(String),
    Var(Vec<String>),
}

impl Field {
    fn parse(word: &str) -> Result<Self, ConditionError> {
        match word {
            "step_index" => return Ok(Self::StepIndex),
            "history_len" => return Ok(Self::HistoryLen),
            "plan_version" => return Ok(Self::PlanVersion),
            "tool" => return Ok(Self::Tool),
            "sensitivity" => return Ok(Self::Sensitivity),
            _ => {}
        }
        if let Some(tool) = word.strip_prefix("tool_usage.")
            && !tool.is_empty()
            && !tool.contains('.')
        {
            return Ok(Self::ToolUsage(tool.to_string()));
        }
        if let Some(path) = word.strip_prefix("var.") {
            let segments: Vec<String> = path.split('.').map(str::to_string).collect();
            if segments.iter().all(|segment| !segment.is_empty()) {
                return Ok(Self::Var(segments));
            }
        }
        Err(ConditionError::UnknownField(word.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl Literal {
    fn from_word(word: &str) -> Self {
        match word.to_ascii_lowercase().as_str() {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            "null" => return Self::Null,
            _ => {}
        }
        word.parse::<f64>()
            .map_or_else(|_| Self::Str(word.to_string()), Self::Number)
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::Str(s) => Value::String(s.clone()),
            Self::Bool(b) => Value::Bool(*b),
            Self::Null => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        field: Field,
        op: Operator,
        literal: Literal,
    },
    Truthy(Field),
}

/// What a condition can see at one checkpoint.
pub struct ConditionContext<'a> {
    pub state: &'a ExecutionState,
    pub tool: Option<&'a str>,
    pub sensitivity: Option<Sensitivity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConditionError::Syntax("empty condition".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(ConditionError::Syntax(format!(
                "unexpected token {token:?}"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> Result<bool, ConditionError> {
        eval(&self.expr, ctx)
    }
}

// ── Lexer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Op(Operator),
    Word(String),
    Quoted(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
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
            '"' | '\'' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == c {
                        closed = true;
                        break;
                    }
                    text.push(next);
                }
                if !closed {
                    return Err(ConditionError::Syntax("unterminated string".into()));
                }
                tokens.push(Token::Quoted(text));
            }
            '=' | '!' | '<' | '>' => {
                chars.next();
                let followed_by_eq = chars.peek() == Some(&'=');
                let op = match (c, followed_by_eq) {
                    ('=', true) => Operator::Eq,
                    ('!', true) => Operator::NotEq,
                    ('<', true) => Operator::LtEq,
                    ('>', true) => Operator::GtEq,
                    ('<', false) => Operator::Lt,
                    ('>', false) => Operator::Gt,
                    _ => {
                        return Err(ConditionError::Syntax(format!(
                            "unexpected character '{c}'"
                        )));
                    }
                };
                if followed_by_eq {
                    chars.next();
                }
                tokens.push(Token::Op(op));
            }
            _ => {
                let mut word = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || "()\"'=!<>".contains(next) {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "CONTAINS" => Token::Op(Operator::Contains),
                    _ => Token::Word(word),
                });
            }
        }
    }
    Ok(tokens)
}

// ── Parser ───────────────────────────────────────────────────────

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
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ConditionError::Syntax("missing ')'".into())),
                }
            }
            Some(Token::Word(word)) => self.parse_comparison(&word),
            Some(token) => Err(ConditionError::Syntax(format!(
                "expected a field, found {token:?}"
            ))),
            None => Err(ConditionError::Syntax("unexpected end of condition".into())),
        }
    }

    fn parse_comparison(&mut self, word: &str) -> Result<Expr, ConditionError> {
        let field = Field::parse(word)?;
        let Some(Token::Op(op)) = self.peek().cloned() else {
            return Ok(Expr::Truthy(field));
        };
        self.pos += 1;
        let literal = match self.next() {
            Some(Token::Word(word)) => Literal::from_word(&word),
            Some(Token::Quoted(text)) => Literal::Str(text),
            Some(token) => {
                return Err(ConditionError::Syntax(format!(
                    "expected a literal, found {token:?}"
                )));
            }
            None => return Err(ConditionError::Syntax("missing literal".into())),
        };
        Ok(Expr::Compare { field, op, literal })
    }
}

// ── Evaluation ───────────────────────────────────────────────────

fn resolve(field: &Field, ctx: &ConditionContext<'_>) -> Value {
    let state = ctx.state;
    match field {
        Field::StepIndex => Value::from(state.step_index),
        Field::HistoryLen => Value::from(state.history.len()),
        Field::PlanVersion => Value::from(state.plan_version.0),
        Field::Tool => ctx.tool.map_or(Value::Null, Value::from),
        Field::Sensitivity => ctx
            .sensitivity
            .map_or(Value::Null, |s| Value::from(s.to_string())),
        Field::ToolUsage(tool) => Value::from(state.tool_usage.get(tool).copied().unwrap_or(0)),
        Field::Var(path) => {
            let Some((first, rest)) = path.split_first() else {
                return Value::Null;
            };
            let mut current = state.variables.get(first);
            for segment in rest {
                current = current.and_then(|value| match value {
                    Value::Object(map) => map.get(segment),
                    Value::Array(items) => segment
                        .parse::<usize>()
                        .ok()
                        .and_then(|index| items.get(index)),
                    _ => None,
                });
            }
            current.cloned().unwrap_or(Value::Null)
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn equals(left: &Value, right: &Value) -> Result<bool, ConditionError> {
    match (left, right) {
        (Value::Null, other) | (other, Value::Null) => Ok(other.is_null()),
        (Value::Number(a), Value::Number(b)) => Ok(a.as_f64() == b.as_f64()),
        (Value::String(a), Value::String(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (a, b) => Err(ConditionError::TypeMismatch(format!(
            "cannot compare {} with {}",
            kind_of(a),
            kind_of(b)
        ))),
    }
}

fn order(field: &Field, left: &Value, right: &Value) -> Result<Ordering, ConditionError> {
    if let (Value::Number(a), Value::Number(b)) = (left, right)
        && let (Some(a), Some(b)) = (a.as_f64(), b.as_f64())
        && let Some(ordering) = a.partial_cmp(&b)
    {
        return Ok(ordering);
    }
    if *field == Field::Sensitivity
        && let (Value::String(a), Value::String(b)) = (left, right)
        && let (Ok(a), Ok(b)) = (Sensitivity::from_str(a), Sensitivity::from_str(b))
    {
        return Ok(a.cmp(&b));
    }
    Err(ConditionError::TypeMismatch(format!(
        "cannot order {} against {}",
        kind_of(left),
        kind_of(right)
    )))
}

fn contains(left: &Value, right: &Value) -> Result<bool, ConditionError> {
    match (left, right) {
        (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Array(items), needle) => Ok(items
            .iter()
            .any(|item| equals(item, needle).unwrap_or(false))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        (Value::Null, _) => Ok(false),
        (a, b) => Err(ConditionError::TypeMismatch(format!(
            "{} cannot contain {}",
            kind_of(a),
            kind_of(b)
        ))),
    }
}

fn eval(expr: &Expr, ctx: &ConditionContext<'_>) -> Result<bool, ConditionError> {
    match expr {
        Expr::Or(terms) => {
            for term in terms {
                if eval(term, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::And(terms) => {
            for term in terms {
                if !eval(term, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Not(inner) => Ok(!eval(inner, ctx)?),
        Expr::Truthy(field) => Ok(truthy(&resolve(field, ctx))),
        Expr::Compare { field, op, literal } => {
            let left = resolve(field, ctx);
            let right = literal.to_value();
            match op {
                Operator::Eq => equals(&left, &right),
                Operator::NotEq => equals(&left, &right).map(|eq| !eq),
                Operator::Contains => contains(&left, &right),
                Operator::Gt => order(field, &left, &right).map(Ordering::is_gt),
                Operator::Lt => order(field, &left, &right).map(Ordering::is_lt),
                Operator::GtEq => order(field, &left, &right).map(Ordering::is_ge),
                Operator::LtEq => order(field, &left, &right).map(Ordering::is_le),
            }
        }
    }
}
