use std::collections::BTreeMap;

use pr_columnar::{ArithmeticOp, ComparisonOp};
use pr_expr::{ExpressionDescriptor, INTERN_FN};
use pr_types::{DType, NullKind, Scalar, cast_scalar_owned, common_dtype};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A compile failure, positioned at the offending token of the canonical
/// text (zero-based line and column).
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{error_message} (line {line}, column {column})")]
pub struct ExpressionError {
    pub error_message: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    Intern,
    Upper,
    Lower,
    Length,
    Concat,
    Abs,
    Sqrt,
    Min,
    Max,
    If,
    Bucket,
    Match,
    MatchAll,
    Search,
    IndexOf,
    Replace,
    ReplaceAll,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            INTERN_FN => Self::Intern,
            "upper" => Self::Upper,
            "lower" => Self::Lower,
            "length" => Self::Length,
            "concat" => Self::Concat,
            "abs" => Self::Abs,
            "sqrt" => Self::Sqrt,
            "min" => Self::Min,
            "max" => Self::Max,
            "if" => Self::If,
            "bucket" => Self::Bucket,
            "match" => Self::Match,
            "match_all" => Self::MatchAll,
            "search" => Self::Search,
            "indexof" => Self::IndexOf,
            "replace" => Self::Replace,
            "replace_all" => Self::ReplaceAll,
            _ => return None,
        })
    }

    fn arity(self) -> Option<usize> {
        match self {
            Self::Intern | Self::Upper | Self::Lower | Self::Length | Self::Abs | Self::Sqrt => {
                Some(1)
            }
            Self::Min
            | Self::Max
            | Self::Bucket
            | Self::Match
            | Self::MatchAll
            | Self::Search
            | Self::IndexOf => Some(2),
            Self::If | Self::Replace | Self::ReplaceAll => Some(3),
            Self::Concat => None,
        }
    }

    /// Functions whose second argument must be a raw string literal.
    fn takes_pattern(self) -> bool {
        matches!(
            self,
            Self::Match
                | Self::MatchAll
                | Self::Search
                | Self::IndexOf
                | Self::Replace
                | Self::ReplaceAll
        )
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Column {
        name: String,
        dtype: DType,
    },
    Literal {
        value: Scalar,
    },
    Negate {
        expr: Box<Expr>,
    },
    Not {
        expr: Box<Expr>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: ComparisonOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
        pattern: Option<Regex>,
    },
}

/// A type-checked expression ready to evaluate row by row.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    pub alias: String,
    pub expr: Expr,
    pub dtype: DType,
}

impl CompiledExpression {
    /// Evaluates against one row; `lookup` resolves real column names.
    /// The result is cast to the compiled dtype, missing on failure.
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Scalar) -> Scalar {
        let value = evaluate(&self.expr, lookup);
        cast_scalar_owned(value, self.dtype).unwrap_or_else(|_| Scalar::missing_for_dtype(self.dtype))
    }
}

/// Parses and type-checks the canonical text of `descriptor` against the
/// table `schema`.
pub fn compile_expression(
    descriptor: &ExpressionDescriptor,
    schema: &[(String, DType)],
) -> Result<CompiledExpression, ExpressionError> {
    let tokens = tokenize(&descriptor.canonical)?;
    if tokens.is_empty() {
        return Err(ExpressionError {
            error_message: "Parser Error - empty expression".to_owned(),
            line: 0,
            column: 0,
        });
    }

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        column_ids: &descriptor.column_ids,
        schema,
    };
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.tokens.get(parser.pos) {
        return Err(extra.error(format!("Parser Error - unexpected token {:?}", extra.kind)));
    }
    let dtype = infer_type(&expr, &tokens[0])?;

    Ok(CompiledExpression {
        alias: descriptor.alias.clone(),
        expr,
        dtype,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    EqEq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

impl Token {
    fn error(&self, error_message: String) -> ExpressionError {
        ExpressionError {
            error_message,
            line: self.line,
            column: self.column,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let (mut line, mut line_start) = (0, 0);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let column = i - line_start;
        let at = move |kind| Token { kind, line, column };
        let fail = move |error_message: String| ExpressionError {
            error_message,
            line,
            column,
        };

        if c == '\n' {
            line += 1;
            line_start = i + 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = chars.get(i + 1).copied();
        match c {
            '/' if two == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '+' => tokens.push(at(TokenKind::Plus)),
            '-' => tokens.push(at(TokenKind::Minus)),
            '*' => tokens.push(at(TokenKind::Star)),
            '/' => tokens.push(at(TokenKind::Slash)),
            '(' => tokens.push(at(TokenKind::LParen)),
            ')' => tokens.push(at(TokenKind::RParen)),
            ',' => tokens.push(at(TokenKind::Comma)),
            '=' if two == Some('=') => {
                tokens.push(at(TokenKind::EqEq));
                i += 1;
            }
            '!' if two == Some('=') => {
                tokens.push(at(TokenKind::NotEq));
                i += 1;
            }
            '>' | '<' => {
                let or_equal = two == Some('=');
                tokens.push(at(match (c, or_equal) {
                    ('>', true) => TokenKind::Ge,
                    ('>', false) => TokenKind::Gt,
                    (_, true) => TokenKind::Le,
                    (_, false) => TokenKind::Lt,
                }));
                if or_equal {
                    i += 1;
                }
            }
            '&' if two == Some('&') => {
                tokens.push(at(TokenKind::And));
                i += 1;
            }
            '|' if two == Some('|') => {
                tokens.push(at(TokenKind::Or));
                i += 1;
            }
            '\'' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(fail("Parser Error - unterminated string literal".to_owned()));
                        }
                        Some('\'') => break,
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('\'') => text.push('\''),
                                Some('\\') => text.push('\\'),
                                Some(other) => {
                                    text.push('\\');
                                    text.push(*other);
                                }
                                None => text.push('\\'),
                            }
                            i += 2;
                            continue;
                        }
                        Some(other) => text.push(*other),
                    }
                    i += 1;
                }
                tokens.push(at(TokenKind::Str(text)));
            }
            _ if c.is_ascii_digit() || (c == '.' && two.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                while i + 1 < chars.len() && (chars[i + 1].is_ascii_digit() || chars[i + 1] == '.') {
                    i += 1;
                }
                let text: String = chars[start..=i].iter().collect();
                let kind = if text.contains('.') {
                    text.parse().map(TokenKind::Float).ok()
                } else {
                    text.parse().map(TokenKind::Int).ok()
                };
                let Some(kind) = kind else {
                    return Err(fail(format!("Parser Error - invalid number {text}")));
                };
                tokens.push(at(kind));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i + 1 < chars.len() && (chars[i + 1].is_alphanumeric() || chars[i + 1] == '_') {
                    i += 1;
                }
                let word: String = chars[start..=i].iter().collect();
                tokens.push(at(match word.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    _ => TokenKind::Ident(word),
                }));
            }
            _ => {
                return Err(fail(format!("Parser Error - unexpected character '{c}'")));
            }
        }
        i += 1;
    }

    Ok(tokens)
}

/// Recursive descent over the canonical grammar:
///
///   or_expr    → and_expr ( "or" and_expr )*
///   and_expr   → not_expr ( "and" not_expr )*
///   not_expr   → "not" not_expr | comparison
///   comparison → add_expr ( ("==" | "!=" | ">" | ">=" | "<" | "<=") add_expr )?
///   add_expr   → mul_expr ( ("+" | "-") mul_expr )*
///   mul_expr   → unary ( ("*" | "/") unary )*
///   unary      → "-" unary | atom
///   atom       → NUMBER | STRING | True | False | COLUMNn | IDENT "(" args ")" | "(" or_expr ")"
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    column_ids: &'a BTreeMap<String, String>,
    schema: &'a [(String, DType)],
}

impl Parser<'_> {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|token| &token.kind)
    }

    fn end_error(&self, error_message: String) -> ExpressionError {
        let last = self.tokens.last();
        ExpressionError {
            error_message,
            line: last.map_or(0, |token| token.line),
            column: last.map_or(0, |token| token.column + 1),
        }
    }

    fn current(&self) -> Result<&Token, ExpressionError> {
        self.tokens
            .get(self.pos)
            .ok_or_else(|| self.end_error("Parser Error - unexpected end of expression".to_owned()))
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), ExpressionError> {
        let message = format!("Parser Error - expected {what}");
        match self.tokens.get(self.pos) {
            Some(token) if &token.kind == kind => {
                self.pos += 1;
                Ok(())
            }
            Some(token) => Err(token.error(message)),
            None => Err(self.end_error(message)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&TokenKind::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&TokenKind::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&TokenKind::Not) {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Expr::Not {
                expr: Box::new(inner),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            Some(TokenKind::EqEq) => ComparisonOp::Eq,
            Some(TokenKind::NotEq) => ComparisonOp::Ne,
            Some(TokenKind::Gt) => ComparisonOp::Gt,
            Some(TokenKind::Ge) => ComparisonOp::Ge,
            Some(TokenKind::Lt) => ComparisonOp::Lt,
            Some(TokenKind::Le) => ComparisonOp::Le,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_add()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_add(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => ArithmeticOp::Add,
                Some(TokenKind::Minus) => ArithmeticOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            left = Expr::Arithmetic {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => ArithmeticOp::Mul,
                Some(TokenKind::Slash) => ArithmeticOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Arithmetic {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&TokenKind::Minus) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Negate {
                expr: Box::new(inner),
            });
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.current()?.clone();
        self.pos += 1;
        match token.kind {
            TokenKind::Int(value) => Ok(literal(Scalar::Int64(value))),
            TokenKind::Float(value) => Ok(literal(Scalar::Float64(value))),
            TokenKind::Str(value) => Ok(literal(Scalar::Utf8(value))),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(ref word) => {
                if self.peek() == Some(&TokenKind::LParen) {
                    self.pos += 1;
                    return self.parse_call(&token, &word);
                }
                match word.as_str() {
                    "True" => Ok(literal(Scalar::Bool(true))),
                    "False" => Ok(literal(Scalar::Bool(false))),
                    _ => self.resolve_column(&token, &word),
                }
            }
            ref other => Err(token.error(format!("Parser Error - unexpected token {other:?}"))),
        }
    }

    fn resolve_column(&self, token: &Token, word: &str) -> Result<Expr, ExpressionError> {
        let Some(name) = self.column_ids.get(word) else {
            return Err(token.error(format!("Parser Error - unknown identifier {word}")));
        };
        let Some((_, dtype)) = self.schema.iter().find(|(column, _)| column == name) else {
            return Err(token.error(format!("Value Error - column \"{name}\" does not exist")));
        };
        Ok(Expr::Column {
            name: name.clone(),
            dtype: *dtype,
        })
    }

    fn parse_call(&mut self, token: &Token, name: &str) -> Result<Expr, ExpressionError> {
        let Some(function) = Function::lookup(name) else {
            return Err(token.error(format!("Parser Error - unknown function {name}")));
        };

        let mut args = Vec::new();
        if self.peek() != Some(&TokenKind::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.peek() == Some(&TokenKind::Comma) {
                    self.pos += 1;
                    continue;
                }
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;

        let arity_ok = match function.arity() {
            Some(arity) => args.len() == arity,
            None => !args.is_empty(),
        };
        if !arity_ok {
            return Err(token.error(format!(
                "Parser Error - wrong number of arguments to {name}: {}",
                args.len()
            )));
        }

        let pattern = if function.takes_pattern() {
            let Some(Expr::Literal {
                value: Scalar::Utf8(raw),
            }) = args.get(1)
            else {
                return Err(token.error(format!(
                    "Type Error - {name} expects a string literal pattern"
                )));
            };
            let regex = Regex::new(raw)
                .map_err(|err| token.error(format!("Value Error - invalid pattern: {err}")))?;
            Some(regex)
        } else {
            None
        };

        Ok(Expr::Call {
            function,
            args,
            pattern,
        })
    }
}

fn literal(value: Scalar) -> Expr {
    Expr::Literal { value }
}

fn type_error(at: &Token) -> ExpressionError {
    at.error("Type Error - inputs do not resolve to a valid expression.".to_owned())
}

fn infer_type(expr: &Expr, at: &Token) -> Result<DType, ExpressionError> {
    let numeric = |dtype: DType| dtype.is_numeric() || dtype == DType::Null;
    match expr {
        Expr::Column { dtype, .. } => Ok(*dtype),
        Expr::Literal { value } => Ok(value.dtype()),
        Expr::Negate { expr } => {
            let inner = infer_type(expr, at)?;
            match inner {
                DType::Int64 | DType::Float64 | DType::Null => Ok(inner),
                DType::Bool => Ok(DType::Int64),
                _ => Err(type_error(at)),
            }
        }
        Expr::Not { expr } => {
            if numeric(infer_type(expr, at)?) {
                Ok(DType::Bool)
            } else {
                Err(type_error(at))
            }
        }
        Expr::And { left, right } | Expr::Or { left, right } => {
            if numeric(infer_type(left, at)?) && numeric(infer_type(right, at)?) {
                Ok(DType::Bool)
            } else {
                Err(type_error(at))
            }
        }
        Expr::Arithmetic { op, left, right } => {
            let (l, r) = (infer_type(left, at)?, infer_type(right, at)?);
            if !numeric(l) || !numeric(r) {
                return Err(type_error(at));
            }
            if *op == ArithmeticOp::Div || l == DType::Float64 || r == DType::Float64 {
                Ok(DType::Float64)
            } else {
                Ok(DType::Int64)
            }
        }
        Expr::Compare { left, right, .. } => {
            let (l, r) = (infer_type(left, at)?, infer_type(right, at)?);
            let comparable = l == r
                || l == DType::Null
                || r == DType::Null
                || (l.is_numeric() && r.is_numeric())
                || (l.is_temporal() && r.is_temporal());
            if comparable {
                Ok(DType::Bool)
            } else {
                Err(type_error(at))
            }
        }
        Expr::Call { function, args, .. } => {
            let types = args
                .iter()
                .map(|arg| infer_type(arg, at))
                .collect::<Result<Vec<_>, _>>()?;
            let text = |dtype: DType| dtype == DType::Utf8 || dtype == DType::Null;
            match function {
                Function::Intern | Function::Upper | Function::Lower => {
                    if text(types[0]) {
                        Ok(DType::Utf8)
                    } else {
                        Err(type_error(at))
                    }
                }
                Function::Length => {
                    if text(types[0]) {
                        Ok(DType::Int64)
                    } else {
                        Err(type_error(at))
                    }
                }
                Function::Concat => Ok(DType::Utf8),
                Function::Abs => {
                    if numeric(types[0]) {
                        Ok(if types[0] == DType::Int64 { DType::Int64 } else { DType::Float64 })
                    } else {
                        Err(type_error(at))
                    }
                }
                Function::Sqrt => {
                    if numeric(types[0]) {
                        Ok(DType::Float64)
                    } else {
                        Err(type_error(at))
                    }
                }
                Function::Min | Function::Max => {
                    if numeric(types[0]) && numeric(types[1]) {
                        common_dtype(types[0], types[1]).map_err(|_| type_error(at))
                    } else {
                        Err(type_error(at))
                    }
                }
                Function::If => {
                    if !numeric(types[0]) {
                        return Err(type_error(at));
                    }
                    common_dtype(types[1], types[2]).map_err(|_| type_error(at))
                }
                Function::Bucket => {
                    if numeric(types[0]) && numeric(types[1]) {
                        Ok(if types[0] == DType::Int64 && types[1] == DType::Int64 {
                            DType::Int64
                        } else {
                            DType::Float64
                        })
                    } else {
                        Err(type_error(at))
                    }
                }
                Function::Match | Function::MatchAll => {
                    if text(types[0]) {
                        Ok(DType::Bool)
                    } else {
                        Err(type_error(at))
                    }
                }
                Function::Search => {
                    if text(types[0]) {
                        Ok(DType::Utf8)
                    } else {
                        Err(type_error(at))
                    }
                }
                Function::IndexOf => {
                    if text(types[0]) {
                        Ok(DType::Int64)
                    } else {
                        Err(type_error(at))
                    }
                }
                Function::Replace | Function::ReplaceAll => {
                    if text(types[0]) && text(types[2]) {
                        Ok(DType::Utf8)
                    } else {
                        Err(type_error(at))
                    }
                }
            }
        }
    }
}

fn missing() -> Scalar {
    Scalar::Null(NullKind::Null)
}

fn truthy(value: &Scalar) -> Option<bool> {
    if value.is_missing() {
        return None;
    }
    value.to_f64().ok().map(|v| v != 0.0)
}

fn evaluate(expr: &Expr, lookup: &dyn Fn(&str) -> Scalar) -> Scalar {
    match expr {
        Expr::Column { name, .. } => lookup(name),
        Expr::Literal { value } => value.clone(),
        Expr::Negate { expr } => match evaluate(expr, lookup) {
            Scalar::Int64(v) => v.checked_neg().map_or_else(missing, Scalar::Int64),
            Scalar::Bool(v) => Scalar::Int64(-i64::from(v)),
            Scalar::Float64(v) => Scalar::Float64(-v),
            _ => missing(),
        },
        Expr::Not { expr } => truthy(&evaluate(expr, lookup)).map_or_else(missing, |v| Scalar::Bool(!v)),
        Expr::And { left, right } => {
            match (truthy(&evaluate(left, lookup)), truthy(&evaluate(right, lookup))) {
                (Some(false), _) | (_, Some(false)) => Scalar::Bool(false),
                (Some(true), Some(true)) => Scalar::Bool(true),
                _ => missing(),
            }
        }
        Expr::Or { left, right } => {
            match (truthy(&evaluate(left, lookup)), truthy(&evaluate(right, lookup))) {
                (Some(true), _) | (_, Some(true)) => Scalar::Bool(true),
                (Some(false), Some(false)) => Scalar::Bool(false),
                _ => missing(),
            }
        }
        Expr::Arithmetic { op, left, right } => {
            arithmetic(*op, &evaluate(left, lookup), &evaluate(right, lookup))
        }
        Expr::Compare { op, left, right } => {
            let (l, r) = (evaluate(left, lookup), evaluate(right, lookup));
            if l.is_missing() || r.is_missing() {
                missing()
            } else {
                Scalar::Bool(op.holds(l.total_cmp(&r)))
            }
        }
        Expr::Call {
            function,
            args,
            pattern,
        } => {
            let values = args.iter().map(|arg| evaluate(arg, lookup)).collect::<Vec<_>>();
            call(*function, &values, pattern.as_ref())
        }
    }
}

fn arithmetic(op: ArithmeticOp, left: &Scalar, right: &Scalar) -> Scalar {
    if left.is_missing() || right.is_missing() {
        return missing();
    }
    let ints = match (left, right) {
        (Scalar::Int64(l), Scalar::Int64(r)) => Some((*l, *r)),
        _ => None,
    };
    if let Some((l, r)) = ints {
        let out = match op {
            ArithmeticOp::Add => l.checked_add(r),
            ArithmeticOp::Sub => l.checked_sub(r),
            ArithmeticOp::Mul => l.checked_mul(r),
            ArithmeticOp::Div => None,
        };
        if let Some(value) = out {
            return Scalar::Int64(value);
        }
    }

    let (Ok(l), Ok(r)) = (left.to_f64(), right.to_f64()) else {
        return missing();
    };
    let out = match op {
        ArithmeticOp::Add => l + r,
        ArithmeticOp::Sub => l - r,
        ArithmeticOp::Mul => l * r,
        ArithmeticOp::Div if r == 0.0 => return missing(),
        ArithmeticOp::Div => l / r,
    };
    Scalar::Float64(out)
}

fn text_of(value: &Scalar) -> Option<&str> {
    match value {
        Scalar::Utf8(text) => Some(text),
        _ => None,
    }
}

fn call(function: Function, values: &[Scalar], pattern: Option<&Regex>) -> Scalar {
    let first = &values[0];
    match function {
        Function::Intern => first.clone(),
        Function::Upper => text_of(first).map_or_else(missing, |t| Scalar::Utf8(t.to_uppercase())),
        Function::Lower => text_of(first).map_or_else(missing, |t| Scalar::Utf8(t.to_lowercase())),
        Function::Length => text_of(first).map_or_else(missing, |t| {
            Scalar::Int64(i64::try_from(t.chars().count()).unwrap_or(i64::MAX))
        }),
        Function::Concat => {
            if values.iter().any(Scalar::is_missing) {
                return missing();
            }
            Scalar::Utf8(values.iter().map(Scalar::to_string).collect())
        }
        Function::Abs => match first {
            Scalar::Int64(v) => v.checked_abs().map_or_else(missing, Scalar::Int64),
            other => other.to_f64().map_or_else(|_| missing(), |v| Scalar::Float64(v.abs())),
        },
        Function::Sqrt => match first.to_f64() {
            Ok(v) if v >= 0.0 && !first.is_missing() => Scalar::Float64(v.sqrt()),
            _ => missing(),
        },
        Function::Min | Function::Max => {
            let second = &values[1];
            if first.is_missing() || second.is_missing() {
                return missing();
            }
            let first_wins = match function {
                Function::Min => first.total_cmp(second).is_le(),
                _ => first.total_cmp(second).is_ge(),
            };
            if first_wins { first.clone() } else { second.clone() }
        }
        Function::If => match truthy(first) {
            Some(true) => values[1].clone(),
            Some(false) => values[2].clone(),
            None => missing(),
        },
        Function::Bucket => bucket(first, &values[1]),
        Function::Match | Function::MatchAll | Function::Search | Function::IndexOf => {
            let (Some(text), Some(regex)) = (text_of(first), pattern) else {
                return missing();
            };
            match function {
                Function::Match => Scalar::Bool(regex.is_match(text)),
                Function::MatchAll => Scalar::Bool(
                    regex
                        .find(text)
                        .is_some_and(|found| found.start() == 0 && found.end() == text.len()),
                ),
                Function::Search => regex
                    .captures(text)
                    .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                    .map_or_else(missing, |found| Scalar::Utf8(found.as_str().to_owned())),
                _ => regex.find(text).map_or_else(missing, |found| {
                    Scalar::Int64(i64::try_from(found.start()).unwrap_or(i64::MAX))
                }),
            }
        }
        Function::Replace | Function::ReplaceAll => {
            let (Some(text), Some(regex), Some(replacement)) =
                (text_of(first), pattern, text_of(&values[2]))
            else {
                return missing();
            };
            let out = if function == Function::Replace {
                regex.replacen(text, 1, replacement)
            } else {
                regex.replace_all(text, replacement)
            };
            Scalar::Utf8(out.into_owned())
        }
    }
}

fn bucket(value: &Scalar, width: &Scalar) -> Scalar {
    if value.is_missing() || width.is_missing() {
        return missing();
    }
    if let (Scalar::Int64(v), Scalar::Int64(w)) = (value, width) {
        if *w == 0 {
            return missing();
        }
        return Scalar::Int64(v.div_euclid(*w) * w);
    }
    match (value.to_f64(), width.to_f64()) {
        (Ok(v), Ok(w)) if w != 0.0 => Scalar::Float64((v / w).floor() * w),
        _ => missing(),
    }
}
