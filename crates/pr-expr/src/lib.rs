#![forbid(unsafe_code)]

//! Canonicalization of user-authored expression strings.
//!
//! Before an expression reaches the engine's compiler it is rewritten into a
//! canonical form: double-quoted column references become synthetic ids
//! (`COLUMN0`, `COLUMN1`, ...), single-quoted string literals are wrapped in
//! `intern(...)`, and the bare words `true` / `false` are spelled `True` /
//! `False`. Each expression also gets an alias, taken from a leading `//`
//! comment line when one is present.
//!
//! The rewrite is done by a small lexer with explicit states rather than
//! by sequential substitution, so quoting inside comments and string
//! literals is left alone.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of the synthetic column ids substituted for quoted references.
pub const COLUMN_ID_PREFIX: &str = "COLUMN";

/// Name of the engine function that interns string literals.
pub const INTERN_FN: &str = "intern";

/// Functions whose second argument must stay a raw string literal.
pub const RAW_LITERAL_FUNCTIONS: &[&str] = &[
    "bucket",
    "match",
    "match_all",
    "search",
    "indexof",
    "replace",
    "replace_all",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionDescriptor {
    /// Label shown to users and used as the computed column's name.
    pub alias: String,
    /// The expression exactly as it was written.
    pub expression: String,
    /// The engine-safe rewrite of `expression`.
    pub canonical: String,
    /// Synthetic id -> real column name.
    pub column_ids: BTreeMap<String, String>,
}

impl ExpressionDescriptor {
    #[must_use]
    pub fn column_name(&self, column_id: &str) -> Option<&str> {
        self.column_ids.get(column_id).map(String::as_str)
    }

    /// Referenced column names, in synthetic id order.
    #[must_use]
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut ids = self.column_ids.iter().collect::<Vec<_>>();
        ids.sort_by_key(|(id, _)| column_id_ordinal(id));
        ids.into_iter().map(|(_, name)| name.as_str()).collect()
    }
}

fn column_id_ordinal(id: &str) -> usize {
    id.strip_prefix(COLUMN_ID_PREFIX)
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalizeError {
    #[error("skipping expression {expression:?}: it references an empty column name")]
    EmptyColumnReference { expression: String },
    #[error("unterminated column reference at offset {offset} in {expression:?}")]
    UnterminatedColumnReference { expression: String, offset: usize },
    #[error("unterminated string literal at offset {offset} in {expression:?}")]
    UnterminatedStringLiteral { expression: String, offset: usize },
}

impl CanonicalizeError {
    #[must_use]
    pub fn expression(&self) -> &str {
        match self {
            Self::EmptyColumnReference { expression }
            | Self::UnterminatedColumnReference { expression, .. }
            | Self::UnterminatedStringLiteral { expression, .. } => expression,
        }
    }
}

/// Result of canonicalizing one batch. Expressions that produced a
/// diagnostic are absent from `descriptors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canonicalized {
    pub descriptors: Vec<ExpressionDescriptor>,
    pub diagnostics: Vec<CanonicalizeError>,
}

impl Canonicalized {
    #[must_use]
    pub fn aliases(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.alias.as_str()).collect()
    }

    #[must_use]
    pub fn get(&self, alias: &str) -> Option<&ExpressionDescriptor> {
        self.descriptors.iter().find(|d| d.alias == alias)
    }
}

/// Canonicalize a batch of expressions.
///
/// Order is preserved except that a repeated alias replaces the earlier
/// descriptor at the earlier position.
pub fn canonicalize<S: AsRef<str>>(expressions: &[S]) -> Canonicalized {
    let mut out = Canonicalized::default();
    let mut alias_positions = HashMap::<String, usize>::new();

    for expression in expressions {
        let descriptor = match canonicalize_one(expression.as_ref()) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                out.diagnostics.push(err);
                continue;
            }
        };

        match alias_positions.get(&descriptor.alias) {
            Some(&idx) => out.descriptors[idx] = descriptor,
            None => {
                alias_positions.insert(descriptor.alias.clone(), out.descriptors.len());
                out.descriptors.push(descriptor);
            }
        }
    }

    out
}

/// Canonicalize a single expression.
pub fn canonicalize_one(expression: &str) -> Result<ExpressionDescriptor, CanonicalizeError> {
    if expression.contains("\"\"") {
        return Err(CanonicalizeError::EmptyColumnReference {
            expression: expression.to_owned(),
        });
    }

    let alias = extract_alias(expression);
    let tokens = tokenize(expression)?;
    let (canonical, column_ids) = render(&tokens);

    Ok(ExpressionDescriptor {
        alias,
        expression: expression.to_owned(),
        canonical,
        column_ids,
    })
}

/// The trimmed text of a leading `//` comment line, or the whole
/// expression when there is no such line or it is blank.
#[must_use]
pub fn extract_alias(expression: &str) -> String {
    expression
        .strip_prefix("//")
        .and_then(|rest| rest.split_once('\n'))
        .map(|(line, _)| line.trim())
        .filter(|alias| !alias.is_empty())
        .map_or_else(|| expression.to_owned(), str::to_owned)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Whitespace, operators, numbers: copied through verbatim.
    Verbatim(String),
    Ident(String),
    /// Unescaped column name.
    Column(String),
    /// Raw text between single quotes, escapes intact.
    Literal(String),
    Comment(String),
    OpenParen,
    CloseParen,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Outside,
    InColumn { start: usize },
    InLiteral { start: usize },
    Escaped { column: bool, start: usize },
    InComment,
}

fn tokenize(input: &str) -> Result<Vec<Token>, CanonicalizeError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut state = LexState::Outside;
    let mut buf = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match state {
            LexState::Outside => match c {
                '"' => {
                    flush_verbatim(&mut buf, &mut tokens);
                    state = LexState::InColumn { start: i };
                }
                '\'' => {
                    flush_verbatim(&mut buf, &mut tokens);
                    state = LexState::InLiteral { start: i };
                }
                '/' if chars.get(i + 1) == Some(&'/') => {
                    flush_verbatim(&mut buf, &mut tokens);
                    buf.push_str("//");
                    i += 1;
                    state = LexState::InComment;
                }
                '(' | ')' | ',' => {
                    flush_verbatim(&mut buf, &mut tokens);
                    tokens.push(match c {
                        '(' => Token::OpenParen,
                        ')' => Token::CloseParen,
                        _ => Token::Comma,
                    });
                }
                _ if c.is_alphabetic() || c == '_' => {
                    flush_verbatim(&mut buf, &mut tokens);
                    let start = i;
                    while i + 1 < chars.len() && (chars[i + 1].is_alphanumeric() || chars[i + 1] == '_')
                    {
                        i += 1;
                    }
                    tokens.push(Token::Ident(chars[start..=i].iter().collect()));
                }
                _ if c.is_ascii_digit() => {
                    // Numbers (including `1e5`, `2.5`) are opaque so that a
                    // trailing word is never read as an identifier.
                    buf.push(c);
                    while i + 1 < chars.len()
                        && (chars[i + 1].is_alphanumeric() || chars[i + 1] == '_' || chars[i + 1] == '.')
                    {
                        i += 1;
                        buf.push(chars[i]);
                    }
                }
                _ => buf.push(c),
            },
            LexState::InColumn { start } => match c {
                '\\' => state = LexState::Escaped { column: true, start },
                '"' => {
                    tokens.push(Token::Column(std::mem::take(&mut buf)));
                    state = LexState::Outside;
                }
                _ => buf.push(c),
            },
            LexState::InLiteral { start } => match c {
                '\\' => state = LexState::Escaped { column: false, start },
                '\'' => {
                    tokens.push(Token::Literal(std::mem::take(&mut buf)));
                    state = LexState::Outside;
                }
                _ => buf.push(c),
            },
            LexState::Escaped { column: true, start } => {
                // `\"` unescapes to a quote; any other escape is kept as written.
                if c != '"' {
                    buf.push('\\');
                }
                buf.push(c);
                state = LexState::InColumn { start };
            }
            LexState::Escaped { column: false, start } => {
                buf.push('\\');
                buf.push(c);
                state = LexState::InLiteral { start };
            }
            LexState::InComment => {
                buf.push(c);
                if c == '\n' {
                    tokens.push(Token::Comment(std::mem::take(&mut buf)));
                    state = LexState::Outside;
                }
            }
        }
        i += 1;
    }

    match state {
        LexState::Outside => flush_verbatim(&mut buf, &mut tokens),
        LexState::InComment => tokens.push(Token::Comment(buf)),
        LexState::InColumn { start } | LexState::Escaped { column: true, start } => {
            return Err(CanonicalizeError::UnterminatedColumnReference {
                expression: input.to_owned(),
                offset: start,
            });
        }
        LexState::InLiteral { start } | LexState::Escaped { column: false, start } => {
            return Err(CanonicalizeError::UnterminatedStringLiteral {
                expression: input.to_owned(),
                offset: start,
            });
        }
    }

    Ok(tokens)
}

fn flush_verbatim(buf: &mut String, tokens: &mut Vec<Token>) {
    if !buf.is_empty() {
        tokens.push(Token::Verbatim(std::mem::take(buf)));
    }
}

/// An open call while rendering: the callee name (if the paren followed an
/// identifier) and the index of the argument currently being written.
#[derive(Debug)]
struct CallFrame {
    callee: Option<String>,
    arg: usize,
}

fn render(tokens: &[Token]) -> (String, BTreeMap<String, String>) {
    let mut out = String::new();
    let mut name_to_id = HashMap::<&str, String>::new();
    let mut column_ids = BTreeMap::new();
    let mut frames: Vec<CallFrame> = Vec::new();
    let mut last_ident: Option<&str> = None;

    for (pos, token) in tokens.iter().enumerate() {
        match token {
            Token::Verbatim(text) => {
                out.push_str(text);
                if !text.chars().all(char::is_whitespace) {
                    last_ident = None;
                }
                continue;
            }
            Token::Comment(text) => out.push_str(text),
            Token::Ident(word) => {
                out.push_str(match word.as_str() {
                    "true" => "True",
                    "false" => "False",
                    other => other,
                });
                last_ident = Some(word.as_str());
                continue;
            }
            Token::Column(name) => {
                let next_id = name_to_id.len();
                let id = name_to_id.entry(name.as_str()).or_insert_with(|| {
                    let id = format!("{COLUMN_ID_PREFIX}{next_id}");
                    column_ids.insert(id.clone(), name.clone());
                    id
                });
                out.push_str(id);
            }
            Token::Literal(raw) => {
                if raw.is_empty() || literal_stays_raw(&frames, tokens, pos) {
                    out.push('\'');
                    out.push_str(raw);
                    out.push('\'');
                } else {
                    out.push_str(INTERN_FN);
                    out.push_str("('");
                    out.push_str(raw);
                    out.push_str("')");
                }
            }
            Token::OpenParen => {
                frames.push(CallFrame {
                    callee: last_ident.map(str::to_owned),
                    arg: 0,
                });
                out.push('(');
            }
            Token::CloseParen => {
                frames.pop();
                out.push(')');
            }
            Token::Comma => {
                if let Some(frame) = frames.last_mut() {
                    frame.arg += 1;
                }
                out.push(',');
            }
        }
        last_ident = None;
    }

    (out, column_ids)
}

/// A literal is left un-interned when it is already the argument of
/// `intern(...)`, or when it is the whole second argument of one of the
/// [`RAW_LITERAL_FUNCTIONS`] in the innermost open call.
fn literal_stays_raw(frames: &[CallFrame], tokens: &[Token], pos: usize) -> bool {
    let Some(frame) = frames.last() else {
        return false;
    };
    let Some(callee) = frame.callee.as_deref() else {
        return false;
    };
    if callee == INTERN_FN {
        return true;
    }
    if frame.arg != 1 || !RAW_LITERAL_FUNCTIONS.contains(&callee) {
        return false;
    }

    let is_blank = |token: &Token| matches!(token, Token::Verbatim(text) if text.trim().is_empty());
    let before = tokens[..pos].iter().rev().find(|t| !is_blank(t));
    let after = tokens[pos + 1..].iter().find(|t| !is_blank(t));
    matches!(before, Some(Token::Comma))
        && matches!(after, Some(Token::Comma | Token::CloseParen))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::{CanonicalizeError, canonicalize, canonicalize_one, extract_alias};

    fn ids(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(id, name)| ((*id).to_owned(), (*name).to_owned()))
            .collect()
    }

    #[test]
    fn alias_comes_from_leading_comment_or_whole_text() {
        let out = canonicalize(&["1 + 1", "// sum\n\"x\" + \"y\""]);
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.descriptors.len(), 2);

        let first = &out.descriptors[0];
        assert_eq!(first.alias, "1 + 1");
        assert_eq!(first.canonical, "1 + 1");
        assert!(first.column_ids.is_empty());

        let second = &out.descriptors[1];
        assert_eq!(second.alias, "sum");
        assert_eq!(second.canonical, "// sum\nCOLUMN0 + COLUMN1");
        assert_eq!(second.column_ids, ids(&[("COLUMN0", "x"), ("COLUMN1", "y")]));
    }

    #[test]
    fn blank_or_unterminated_comment_falls_back_to_text() {
        assert_eq!(extract_alias("//   \n1"), "//   \n1");
        assert_eq!(extract_alias("// only a comment"), "// only a comment");
        assert_eq!(extract_alias("  // not leading\n1"), "  // not leading\n1");
    }

    #[test]
    fn repeated_column_reuses_its_id_and_unescapes_quotes() {
        let d = canonicalize_one(r#""a\"b" * 2 + "a\"b" - "c""#).expect("canonical");
        assert_eq!(d.canonical, "COLUMN0 * 2 + COLUMN0 - COLUMN1");
        assert_eq!(d.column_ids, ids(&[("COLUMN0", "a\"b"), ("COLUMN1", "c")]));
        assert_eq!(d.referenced_columns(), vec!["a\"b", "c"]);
    }

    #[test]
    fn booleans_are_respelled_outside_quotes_only() {
        let d = canonicalize_one(r#"if ("true" == true) { false } else { truely }"#).expect("ok");
        assert_eq!(d.canonical, "if (COLUMN0 == True) { False } else { truely }");
        assert_eq!(d.column_name("COLUMN0"), Some("true"));
    }

    #[test]
    fn string_literals_are_interned() {
        let d = canonicalize_one(r#"concat("name", ' ', 'x')"#).expect("ok");
        assert_eq!(d.canonical, "concat(COLUMN0, intern(' '), intern('x'))");
    }

    #[test]
    fn raw_literal_functions_keep_their_second_argument() {
        let d = canonicalize_one(r#"match("name", 'ab.*')"#).expect("ok");
        assert_eq!(d.canonical, "match(COLUMN0, 'ab.*')");

        let d = canonicalize_one(r#"bucket("ts", 'M')"#).expect("ok");
        assert_eq!(d.canonical, "bucket(COLUMN0, 'M')");

        let d = canonicalize_one(r#"replace("s", 'a', 'b')"#).expect("ok");
        assert_eq!(d.canonical, "replace(COLUMN0, 'a', intern('b'))");

        let d = canonicalize_one(r#"replace_all("s", 'a', 'b')"#).expect("ok");
        assert_eq!(d.canonical, "replace_all(COLUMN0, 'a', intern('b'))");
    }

    #[test]
    fn nested_calls_use_the_innermost_function() {
        let d = canonicalize_one(r#"concat('x', match(lower("s"), 'y'))"#).expect("ok");
        assert_eq!(
            d.canonical,
            "concat(intern('x'), match(lower(COLUMN0), 'y'))"
        );
    }

    #[test]
    fn comment_text_is_not_rewritten() {
        let d = canonicalize_one("// \"true\" 'x'\n\"a\"").expect("ok");
        assert_eq!(d.alias, "\"true\" 'x'");
        assert_eq!(d.canonical, "// \"true\" 'x'\nCOLUMN0");
    }

    #[test]
    fn empty_column_reference_is_rejected_without_failing_the_batch() {
        let out = canonicalize(&["\"\" + 1", "\"x\""]);
        assert_eq!(out.descriptors.len(), 1);
        assert_eq!(out.descriptors[0].canonical, "COLUMN0");
        assert!(matches!(
            out.diagnostics.as_slice(),
            [CanonicalizeError::EmptyColumnReference { .. }]
        ));
    }

    #[test]
    fn unterminated_quotes_are_diagnosed() {
        let err = canonicalize_one("\"abc + 1").expect_err("must fail");
        assert_eq!(
            err,
            CanonicalizeError::UnterminatedColumnReference {
                expression: "\"abc + 1".to_owned(),
                offset: 0
            }
        );
        let err = canonicalize_one("1 + 'abc").expect_err("must fail");
        assert!(matches!(err, CanonicalizeError::UnterminatedStringLiteral { offset: 4, .. }));
    }

    #[test]
    fn duplicate_alias_replaces_in_place() {
        let out = canonicalize(&["// a\n1", "// b\n2", "// a\n3"]);
        assert_eq!(out.aliases(), vec!["a", "b"]);
        assert_eq!(out.get("a").expect("a").canonical, "// a\n3");
    }

    #[test]
    fn canonical_form_is_a_fixed_point() {
        let d = canonicalize_one(r#"if ("x" > 1 and true) { concat("y", 'z') } else { match("y", 'q') }"#)
            .expect("ok");
        let again = canonicalize_one(&d.canonical).expect("ok");
        assert_eq!(again.canonical, d.canonical);
    }

    proptest! {
        #[test]
        fn canonicalize_is_idempotent_on_canonical_text(
            parts in proptest::collection::vec(
                prop_oneof![
                    "[a-z]{1,4}".prop_map(|s| format!("\"{s}\"")),
                    "[a-z ]{1,4}".prop_map(|s| format!("'{s}'")),
                    Just("true".to_owned()),
                    Just("false".to_owned()),
                    "[0-9]{1,3}",
                    Just("match(\"c\", 'r')".to_owned()),
                ],
                1..6,
            )
        ) {
            let text = parts.join(" + ");
            let first = canonicalize_one(&text).expect("generated text is well formed");
            let second = canonicalize_one(&first.canonical).expect("canonical text is well formed");
            prop_assert_eq!(&second.canonical, &first.canonical);
            prop_assert!(second.column_ids.is_empty());
        }

        #[test]
        fn duplicate_aliases_keep_first_position_and_last_content(
            aliases in proptest::collection::vec("[a-c]", 1..8)
        ) {
            let exprs = aliases
                .iter()
                .enumerate()
                .map(|(idx, alias)| format!("// {alias}\n{idx}"))
                .collect::<Vec<_>>();
            let out = canonicalize(&exprs);

            let mut expected_order = Vec::<&str>::new();
            for alias in &aliases {
                if !expected_order.contains(&alias.as_str()) {
                    expected_order.push(alias);
                }
            }
            prop_assert_eq!(out.aliases(), expected_order);

            for alias in &out.aliases() {
                let last = aliases.iter().rposition(|a| a == alias).expect("alias present");
                let descriptor = out.get(alias).expect("descriptor present");
                prop_assert_eq!(descriptor.canonical.clone(), format!("// {alias}\n{last}"));
            }
        }
    }
}
