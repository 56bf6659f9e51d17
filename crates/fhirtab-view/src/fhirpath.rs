//! FHIRPath expression evaluation over JSON resources.
//!
//! This module implements the expression subset ViewDefinitions rely on:
//! dotted path navigation with collection semantics, indexing, a fixed
//! function vocabulary (`first`, `last`, `exists`, `empty`, `count`,
//! `distinct`, `join`, `where`, `ofType`, `not`, `hasValue`, `contains`,
//! `startsWith`, `endsWith`, `extension`), the view-layer helpers
//! `getResourceKey()` / `getReferenceKey()`, `%constant` references,
//! `$this`, and `=`/`!=`/ordering comparisons combined with `and`/`or`.
//!
//! Evaluation never fails outward: any parse or evaluation error yields the
//! empty collection and a structured log event, so a bad expression costs a
//! null column value rather than a row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Number, Value};
use thiserror::Error;

/// Internal evaluation failure; surfaces only as a log event.
#[derive(Debug, Error)]
pub(crate) enum FhirPathError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("unknown constant: %{0}")]
    UnknownConstant(String),
}

type EvalResult<T> = std::result::Result<T, FhirPathError>;

/// A parsed FHIRPath segment.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// A simple field access (e.g., "name", "family").
    Field(String),
    /// Collection index access via `[n]`.
    Index(usize),
    /// The current iteration scope.
    This,
    /// A `%name` constant reference.
    Constant(String),
    /// A function invocation.
    Call(Function),
}

/// The function vocabulary understood by the evaluator.
#[derive(Debug, Clone, PartialEq)]
enum Function {
    First,
    Last,
    Exists(Option<Box<Expr>>),
    Empty,
    Count,
    Distinct,
    Not,
    HasValue,
    Join(Option<Box<Expr>>),
    Where(Box<Expr>),
    OfType(String),
    Contains(Box<Expr>),
    StartsWith(Box<Expr>),
    EndsWith(Box<Expr>),
    Extension(Box<Expr>),
    GetResourceKey,
    GetReferenceKey(Option<String>),
}

/// Comparison and logical operators usable in where clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Path(Vec<Segment>),
    Literal(Value),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Evaluates FHIRPath expressions against JSON resources.
///
/// The engine carries the per-view invocation environment: the declared
/// constants (exposed as `%name`) alongside the built-in view helpers.
/// Parsed expressions are cached, so repeated evaluation across a resource
/// stream parses each distinct expression once.
pub struct FhirPathEngine {
    constants: HashMap<String, Value>,
    cache: Mutex<HashMap<String, Arc<Expr>>>,
}

impl Default for FhirPathEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FhirPathEngine {
    /// Create an engine with no constants.
    pub fn new() -> Self {
        Self::with_constants(HashMap::new())
    }

    /// Create an engine exposing the given constants as `%name` references.
    pub fn with_constants(constants: HashMap<String, Value>) -> Self {
        Self {
            constants,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate an expression against a scope value, returning the ordered
    /// result collection.
    ///
    /// Never fails: parse or evaluation errors are logged and produce the
    /// empty collection.
    pub fn evaluate(&self, expression: &str, scope: &Value) -> Vec<Value> {
        match self.try_evaluate(expression, scope) {
            Ok(items) => items,
            Err(error) => {
                tracing::warn!(expression, error = %error, "fhirpath evaluation failed");
                Vec::new()
            }
        }
    }

    /// Evaluate a where-clause expression: true iff the result is a
    /// non-empty collection whose first element is boolean `true`.
    pub fn evaluate_predicate(&self, expression: &str, scope: &Value) -> bool {
        matches!(
            self.evaluate(expression, scope).first(),
            Some(Value::Bool(true))
        )
    }

    fn try_evaluate(&self, expression: &str, scope: &Value) -> EvalResult<Vec<Value>> {
        let expr = self.parse_cached(expression)?;
        self.eval_expr(&expr, scope)
    }

    fn parse_cached(&self, expression: &str) -> EvalResult<Arc<Expr>> {
        if let Some(expr) = self
            .cache
            .lock()
            .expect("fhirpath cache lock")
            .get(expression)
        {
            return Ok(expr.clone());
        }
        let expr = Arc::new(Parser::new(expression)?.parse()?);
        self.cache
            .lock()
            .expect("fhirpath cache lock")
            .insert(expression.to_string(), expr.clone());
        Ok(expr)
    }

    fn eval_expr(&self, expr: &Expr, scope: &Value) -> EvalResult<Vec<Value>> {
        match expr {
            Expr::Literal(value) => Ok(vec![value.clone()]),
            Expr::Path(segments) => self.eval_path(segments, scope),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval_expr(lhs, scope)?;
                let rhs = self.eval_expr(rhs, scope)?;
                Ok(eval_binary(*op, &lhs, &rhs))
            }
        }
    }

    fn eval_path(&self, segments: &[Segment], scope: &Value) -> EvalResult<Vec<Value>> {
        let mut items: Vec<Value> = if scope.is_null() {
            Vec::new()
        } else {
            vec![scope.clone()]
        };

        let mut segments = segments;

        // A leading capitalized field names the resource type; navigation
        // starts at the resource itself.
        if let Some(Segment::Field(first)) = segments.first()
            && first.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        {
            segments = &segments[1..];
        }

        for segment in segments {
            items = self.apply_segment(segment, items, scope)?;
        }
        Ok(items)
    }

    fn apply_segment(
        &self,
        segment: &Segment,
        items: Vec<Value>,
        scope: &Value,
    ) -> EvalResult<Vec<Value>> {
        match segment {
            Segment::Field(name) => Ok(navigate_field(&items, name)),
            Segment::Index(index) => Ok(items.into_iter().nth(*index).into_iter().collect()),
            Segment::This => Ok(if scope.is_null() {
                Vec::new()
            } else {
                vec![scope.clone()]
            }),
            Segment::Constant(name) => self
                .constants
                .get(name)
                .map(|v| vec![v.clone()])
                .ok_or_else(|| FhirPathError::UnknownConstant(name.clone())),
            Segment::Call(function) => self.apply_function(function, items),
        }
    }

    fn apply_function(&self, function: &Function, items: Vec<Value>) -> EvalResult<Vec<Value>> {
        match function {
            Function::First => Ok(items.into_iter().next().into_iter().collect()),
            Function::Last => Ok(items.into_iter().next_back().into_iter().collect()),
            Function::Count => Ok(vec![Value::Number(Number::from(items.len()))]),
            Function::Empty => Ok(vec![Value::Bool(items.is_empty())]),
            Function::Exists(criteria) => {
                let survivors = match criteria {
                    Some(cond) => self.filter_items(items, cond)?,
                    None => items,
                };
                Ok(vec![Value::Bool(!survivors.is_empty())])
            }
            Function::Distinct => {
                let mut out: Vec<Value> = Vec::new();
                for item in items {
                    if !out.contains(&item) {
                        out.push(item);
                    }
                }
                Ok(out)
            }
            Function::Not => Ok(match collection_truth(&items) {
                Some(b) => vec![Value::Bool(!b)],
                None => Vec::new(),
            }),
            Function::HasValue => {
                Ok(vec![Value::Bool(items.len() == 1 && !items[0].is_null())])
            }
            Function::Join(separator) => {
                if items.is_empty() {
                    return Ok(Vec::new());
                }
                let sep = match separator {
                    Some(expr) => self
                        .eval_expr(expr, &Value::Null)?
                        .first()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default(),
                    None => String::new(),
                };
                let parts: Vec<String> = items.iter().filter_map(scalar_to_string).collect();
                Ok(vec![Value::String(parts.join(&sep))])
            }
            Function::Where(cond) => self.filter_items(items, cond),
            Function::OfType(type_name) => Ok(filter_of_type(items, type_name)),
            Function::Contains(arg) => self.string_test(items, arg, |s, n| s.contains(n)),
            Function::StartsWith(arg) => self.string_test(items, arg, |s, n| s.starts_with(n)),
            Function::EndsWith(arg) => self.string_test(items, arg, |s, n| s.ends_with(n)),
            Function::Extension(url_expr) => {
                let url = self
                    .eval_expr(url_expr, &Value::Null)?
                    .first()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                Ok(filter_extensions(&items, &url))
            }
            Function::GetResourceKey => Ok(items
                .iter()
                .map(|item| item.get("id").cloned().unwrap_or(Value::Null))
                .collect()),
            Function::GetReferenceKey(expected_type) => Ok(items
                .iter()
                .filter_map(|item| reference_key(item, expected_type.as_deref()))
                .collect()),
        }
    }

    fn filter_items(&self, items: Vec<Value>, cond: &Expr) -> EvalResult<Vec<Value>> {
        let mut out = Vec::new();
        for item in items {
            let result = self.eval_expr(cond, &item)?;
            if collection_truth(&result) == Some(true) {
                out.push(item);
            }
        }
        Ok(out)
    }

    fn string_test(
        &self,
        items: Vec<Value>,
        arg: &Expr,
        test: impl Fn(&str, &str) -> bool,
    ) -> EvalResult<Vec<Value>> {
        let needle = match self
            .eval_expr(arg, &Value::Null)?
            .first()
            .and_then(|v| v.as_str().map(str::to_string))
        {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        match items.first().and_then(|v| v.as_str()) {
            Some(s) => Ok(vec![Value::Bool(test(s, &needle))]),
            None => Ok(Vec::new()),
        }
    }
}

/// Field navigation with collection flattening: arrays encountered along
/// the way contribute their elements individually.
fn navigate_field(items: &[Value], name: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for item in items {
        let targets: Vec<&Value> = match item {
            Value::Array(elements) => elements.iter().collect(),
            other => vec![other],
        };
        for target in targets {
            if let Some(value) = target.get(name) {
                match value {
                    Value::Array(elements) => out.extend(elements.iter().cloned()),
                    Value::Null => {}
                    other => out.push(other.clone()),
                }
            }
        }
    }
    out
}

/// Truth of a collection: empty is unknown, a boolean head speaks for
/// itself, any other non-empty result is existence.
fn collection_truth(items: &[Value]) -> Option<bool> {
    match items.first() {
        None => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => Some(true),
    }
}

fn eval_binary(op: BinaryOp, lhs: &[Value], rhs: &[Value]) -> Vec<Value> {
    match op {
        BinaryOp::And => match (collection_truth(lhs), collection_truth(rhs)) {
            (Some(false), _) | (_, Some(false)) => vec![Value::Bool(false)],
            (Some(true), Some(true)) => vec![Value::Bool(true)],
            _ => Vec::new(),
        },
        BinaryOp::Or => match (collection_truth(lhs), collection_truth(rhs)) {
            (Some(true), _) | (_, Some(true)) => vec![Value::Bool(true)],
            (Some(false), Some(false)) => vec![Value::Bool(false)],
            _ => Vec::new(),
        },
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let (Some(a), Some(b)) = (lhs.first(), rhs.first()) else {
                return Vec::new();
            };
            match op {
                BinaryOp::Eq => vec![Value::Bool(values_equal(a, b))],
                BinaryOp::Ne => vec![Value::Bool(!values_equal(a, b))],
                _ => match values_order(a, b) {
                    Some(ordering) => {
                        let holds = match op {
                            BinaryOp::Lt => ordering.is_lt(),
                            BinaryOp::Le => ordering.is_le(),
                            BinaryOp::Gt => ordering.is_gt(),
                            _ => ordering.is_ge(),
                        };
                        vec![Value::Bool(holds)]
                    }
                    None => Vec::new(),
                },
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn values_order(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn filter_of_type(items: Vec<Value>, type_name: &str) -> Vec<Value> {
    items
        .into_iter()
        .filter(|item| match type_name.to_lowercase().as_str() {
            "string" | "code" | "uri" | "url" | "id" | "markdown" | "uuid" => item.is_string(),
            "boolean" => item.is_boolean(),
            "integer" | "positiveint" | "unsignedint" | "integer64" => {
                item.is_i64() || item.is_u64()
            }
            "decimal" => item.is_number(),
            _ => item
                .get("resourceType")
                .and_then(Value::as_str)
                .is_some_and(|rt| rt == type_name),
        })
        .collect()
}

fn filter_extensions(items: &[Value], url: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for item in items {
        if let Some(extensions) = item.get("extension").and_then(Value::as_array) {
            for ext in extensions {
                if ext.get("url").and_then(Value::as_str) == Some(url) {
                    out.push(ext.clone());
                }
            }
        }
    }
    out
}

/// Extract the id half of a `"ResourceType/id"` reference, honoring an
/// optional expected resource type. Accepts a reference object or the
/// reference string itself; anything malformed resolves to nothing.
fn reference_key(item: &Value, expected_type: Option<&str>) -> Option<Value> {
    let reference = match item {
        Value::String(s) => s.as_str(),
        Value::Object(_) => item.get("reference").and_then(Value::as_str)?,
        _ => return None,
    };
    let (resource_type, id) = reference.split_once('/')?;
    if resource_type.is_empty() || id.is_empty() || id.contains('/') {
        return None;
    }
    if let Some(expected) = expected_type
        && expected != resource_type
    {
        return None;
    }
    Some(Value::String(id.to_string()))
}

// ---------------------------------------------------------------------------
// Lexer and parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    This,
    Percent(String),
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Op(&'static str),
}

fn tokenize(input: &str) -> EvalResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Op("="));
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op("!="));
                } else {
                    return Err(FhirPathError::Syntax("dangling `!`".to_string()));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op("<="));
                } else {
                    tokens.push(Token::Op("<"));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(">="));
                } else {
                    tokens.push(Token::Op(">"));
                }
            }
            '$' => {
                chars.next();
                let word = take_identifier(&mut chars);
                if word != "this" {
                    return Err(FhirPathError::Syntax(format!("unknown variable ${word}")));
                }
                tokens.push(Token::This);
            }
            '%' => {
                chars.next();
                let word = take_identifier(&mut chars);
                if word.is_empty() {
                    return Err(FhirPathError::Syntax("dangling `%`".to_string()));
                }
                tokens.push(Token::Percent(word));
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(FhirPathError::Syntax(
                                "unterminated string literal".to_string(),
                            ));
                        }
                        Some(ch) if ch == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some('r') => text.push('\r'),
                            Some('f') => text.push('\u{c}'),
                            Some('\\') => text.push('\\'),
                            Some('\'') => text.push('\''),
                            Some('"') => text.push('"'),
                            Some('`') => text.push('`'),
                            other => {
                                return Err(FhirPathError::Syntax(format!(
                                    "unsupported escape: \\{}",
                                    other.map(String::from).unwrap_or_default()
                                )));
                            }
                        },
                        Some(ch) => text.push(ch),
                    }
                }
                tokens.push(Token::Str(text));
            }
            '0'..='9' | '-' => {
                let mut number = String::new();
                if c == '-' {
                    number.push(c);
                    chars.next();
                    if !chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                        return Err(FhirPathError::Syntax("dangling `-`".to_string()));
                    }
                }
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        // A trailing `.ident` is navigation, not a decimal point.
                        if d == '.' {
                            let mut ahead = chars.clone();
                            ahead.next();
                            if !ahead.peek().is_some_and(|n| n.is_ascii_digit()) {
                                break;
                            }
                        }
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                tokens.push(Token::Ident(take_identifier(&mut chars)));
            }
            other => {
                return Err(FhirPathError::Syntax(format!(
                    "unexpected character `{other}`"
                )));
            }
        }
    }

    Ok(tokens)
}

fn take_identifier(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> EvalResult<Self> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    fn parse(mut self) -> EvalResult<Expr> {
        let expr = self.parse_or()?;
        if self.pos != self.tokens.len() {
            return Err(FhirPathError::Syntax(format!(
                "trailing tokens at position {}",
                self.pos
            )));
        }
        Ok(expr)
    }

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

    fn expect(&mut self, expected: &Token) -> EvalResult<()> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(FhirPathError::Syntax(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> EvalResult<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Ident(w)) if w == "or") {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> EvalResult<Expr> {
        let mut lhs = self.parse_comparison()?;
        while matches!(self.peek(), Some(Token::Ident(w)) if w == "and") {
            self.next();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> EvalResult<Expr> {
        let lhs = self.parse_term()?;
        let op = match self.peek() {
            Some(Token::Op("=")) => BinaryOp::Eq,
            Some(Token::Op("!=")) => BinaryOp::Ne,
            Some(Token::Op("<")) => BinaryOp::Lt,
            Some(Token::Op("<=")) => BinaryOp::Le,
            Some(Token::Op(">")) => BinaryOp::Gt,
            Some(Token::Op(">=")) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.parse_term()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_term(&mut self) -> EvalResult<Expr> {
        match self.peek() {
            Some(Token::Str(_)) => {
                let Some(Token::Str(text)) = self.next() else {
                    unreachable!()
                };
                Ok(Expr::Literal(Value::String(text)))
            }
            Some(Token::Number(_)) => {
                let Some(Token::Number(text)) = self.next() else {
                    unreachable!()
                };
                Ok(Expr::Literal(parse_number(&text)?))
            }
            Some(Token::Ident(word)) if (word == "true" || word == "false") => {
                // A bare boolean keyword is a literal unless invoked as a
                // function or navigated into.
                let is_call = matches!(self.tokens.get(self.pos + 1), Some(Token::LParen));
                if is_call {
                    self.parse_path()
                } else {
                    let literal = word == "true";
                    self.next();
                    Ok(Expr::Literal(Value::Bool(literal)))
                }
            }
            Some(Token::LParen) => {
                self.next();
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            _ => self.parse_path(),
        }
    }

    fn parse_path(&mut self) -> EvalResult<Expr> {
        let mut segments = Vec::new();
        segments.push(self.parse_path_root()?);

        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(FhirPathError::Syntax(format!(
                                "expected identifier after `.`, found {other:?}"
                            )));
                        }
                    };
                    segments.push(self.finish_segment(name)?);
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = match self.next() {
                        Some(Token::Number(text)) => {
                            text.parse::<usize>().map_err(|_| {
                                FhirPathError::Syntax(format!("invalid index: {text}"))
                            })?
                        }
                        other => {
                            return Err(FhirPathError::Syntax(format!(
                                "expected index, found {other:?}"
                            )));
                        }
                    };
                    self.expect(&Token::RBracket)?;
                    segments.push(Segment::Index(index));
                }
                _ => break,
            }
        }

        Ok(Expr::Path(segments))
    }

    fn parse_path_root(&mut self) -> EvalResult<Segment> {
        match self.next() {
            Some(Token::This) => Ok(Segment::This),
            Some(Token::Percent(name)) => Ok(Segment::Constant(name)),
            Some(Token::Ident(name)) => self.finish_segment(name),
            other => Err(FhirPathError::Syntax(format!(
                "expected path, found {other:?}"
            ))),
        }
    }

    /// An identifier segment is either a field or, when followed by
    /// parentheses, a function invocation.
    fn finish_segment(&mut self, name: String) -> EvalResult<Segment> {
        if self.peek() != Some(&Token::LParen) {
            return Ok(Segment::Field(name));
        }
        self.next();

        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.peek() == Some(&Token::Comma) {
                    self.next();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        self.build_function(name, args).map(Segment::Call)
    }

    fn build_function(&self, name: String, mut args: Vec<Expr>) -> EvalResult<Function> {
        let arity = args.len();
        let wrong_arity = |expected: &str| {
            Err(FhirPathError::Syntax(format!(
                "{name}() takes {expected} argument(s), got {arity}"
            )))
        };

        match name.as_str() {
            "first" if arity == 0 => Ok(Function::First),
            "last" if arity == 0 => Ok(Function::Last),
            "empty" if arity == 0 => Ok(Function::Empty),
            "count" if arity == 0 => Ok(Function::Count),
            "distinct" if arity == 0 => Ok(Function::Distinct),
            "not" if arity == 0 => Ok(Function::Not),
            "hasValue" if arity == 0 => Ok(Function::HasValue),
            "getResourceKey" if arity == 0 => Ok(Function::GetResourceKey),
            "exists" => match arity {
                0 => Ok(Function::Exists(None)),
                1 => Ok(Function::Exists(Some(Box::new(args.remove(0))))),
                _ => wrong_arity("0 or 1"),
            },
            "join" => match arity {
                0 => Ok(Function::Join(None)),
                1 => Ok(Function::Join(Some(Box::new(args.remove(0))))),
                _ => wrong_arity("0 or 1"),
            },
            "where" if arity == 1 => Ok(Function::Where(Box::new(args.remove(0)))),
            "ofType" if arity == 1 => match type_name_arg(&args[0]) {
                Some(type_name) => Ok(Function::OfType(type_name)),
                None => Err(FhirPathError::Syntax(
                    "ofType() expects a type name".to_string(),
                )),
            },
            "contains" if arity == 1 => Ok(Function::Contains(Box::new(args.remove(0)))),
            "startsWith" if arity == 1 => Ok(Function::StartsWith(Box::new(args.remove(0)))),
            "endsWith" if arity == 1 => Ok(Function::EndsWith(Box::new(args.remove(0)))),
            "extension" if arity == 1 => Ok(Function::Extension(Box::new(args.remove(0)))),
            "getReferenceKey" => match arity {
                0 => Ok(Function::GetReferenceKey(None)),
                1 => match type_name_arg(&args[0]) {
                    Some(type_name) => Ok(Function::GetReferenceKey(Some(type_name))),
                    None => Err(FhirPathError::Syntax(
                        "getReferenceKey() expects a resource type".to_string(),
                    )),
                },
                _ => wrong_arity("0 or 1"),
            },
            "first" | "last" | "empty" | "count" | "distinct" | "not" | "hasValue"
            | "getResourceKey" | "where" | "ofType" | "contains" | "startsWith" | "endsWith"
            | "extension" => Err(FhirPathError::Syntax(format!(
                "wrong number of arguments for {name}(): {arity}"
            ))),
            _ => Err(FhirPathError::UnknownFunction(name)),
        }
    }
}

/// A type argument may be written bare (`ofType(Quantity)`) or quoted
/// (`getReferenceKey('Patient')`).
fn type_name_arg(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Literal(Value::String(s)) => Some(s.clone()),
        Expr::Path(segments) => match segments.as_slice() {
            [Segment::Field(name)] => Some(name.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn parse_number(text: &str) -> EvalResult<Value> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::Number(Number::from(int)));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| FhirPathError::Syntax(format!("invalid number: {text}")))
}
