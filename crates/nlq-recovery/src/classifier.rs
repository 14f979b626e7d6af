//! Dialect-aware classification of SQL execution errors.
//!
//! Patterns are compiled once per classifier. The caller's dialect is tried
//! first, then the other dialect at reduced confidence, then generic
//! phrasing; anything left over is `unknown_error` at the lowest confidence.

use std::fmt;

use nlq_core::types::SqlDialect;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlErrorKind {
    SyntaxError,
    FieldNotExists,
    TableNotExists,
    TypeMismatch,
    PermissionError,
    ConnectionError,
    UnknownError,
}

impl SqlErrorKind {
    /// Fixed strategy for each kind.
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            SqlErrorKind::SyntaxError
            | SqlErrorKind::FieldNotExists
            | SqlErrorKind::TypeMismatch
            | SqlErrorKind::UnknownError => RetryStrategy::RegenerateSql,
            SqlErrorKind::TableNotExists => RetryStrategy::ClarifyIntent,
            SqlErrorKind::PermissionError => RetryStrategy::NoRetry,
            SqlErrorKind::ConnectionError => RetryStrategy::BackoffRetry,
        }
    }
}

impl fmt::Display for SqlErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SqlErrorKind::SyntaxError => "syntax_error",
            SqlErrorKind::FieldNotExists => "field_not_exists",
            SqlErrorKind::TableNotExists => "table_not_exists",
            SqlErrorKind::TypeMismatch => "type_mismatch",
            SqlErrorKind::PermissionError => "permission_error",
            SqlErrorKind::ConnectionError => "connection_error",
            SqlErrorKind::UnknownError => "unknown_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    RegenerateSql,
    ClarifyIntent,
    BackoffRetry,
    NoRetry,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryStrategy::RegenerateSql => "regenerate_sql",
            RetryStrategy::ClarifyIntent => "clarify_intent",
            RetryStrategy::BackoffRetry => "backoff_retry",
            RetryStrategy::NoRetry => "no_retry",
        };
        f.write_str(s)
    }
}

/// Byte range of the offending identifier within the failing SQL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub start: usize,
    pub end: usize,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub error_type: SqlErrorKind,
    pub confidence: f32,
    pub retry_strategy: RetryStrategy,
    pub suggested_fields: Vec<String>,
    pub suggested_tables: Vec<String>,
    pub error_location: Option<ErrorLocation>,
    /// Raw driver message.
    pub message: String,
    /// Dialect whose phrasing matched, if any.
    pub dialect: Option<SqlDialect>,
}

/// What a pattern's first capture group names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Nothing,
    Field,
    Table,
    /// SQL fragment quoted by the driver ("near ...").
    Fragment,
}

struct ErrorPattern {
    regex: Regex,
    kind: SqlErrorKind,
    capture: Capture,
    base_confidence: f32,
}

type PatternSpec = (&'static str, SqlErrorKind, Capture, f32);

const FOREIGN_DIALECT_PENALTY: f32 = 0.9;
const UNKNOWN_CONFIDENCE: f32 = 0.2;

fn compile(specs: &[PatternSpec]) -> Vec<ErrorPattern> {
    specs
        .iter()
        .map(|(pat, kind, capture, conf)| ErrorPattern {
            regex: Regex::new(pat).expect("Invalid SQL error regex"),
            kind: *kind,
            capture: *capture,
            base_confidence: *conf,
        })
        .collect()
}

/// Classifies raw execution errors.
pub struct SqlErrorClassifier {
    mysql: Vec<ErrorPattern>,
    postgres: Vec<ErrorPattern>,
    generic: Vec<ErrorPattern>,
    table_ref: Regex,
}

impl Default for SqlErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlErrorClassifier {
    pub fn new() -> Self {
        use Capture::*;
        use SqlErrorKind::*;

        // =====================================================================
        // MySQL / MariaDB phrasing
        // =====================================================================
        let mysql: Vec<PatternSpec> = vec![
            (r"(?i)unknown column '([^']+)'", FieldNotExists, Field, 0.95),
            (r"(?i)table '([^']+)' doesn't exist", TableNotExists, Table, 0.95),
            (r"(?is)error in your sql syntax.*?near '(.*?)' at line", SyntaxError, Fragment, 0.92),
            (r"(?i)error in your sql syntax", SyntaxError, Nothing, 0.88),
            (r"(?i)\w+ command denied to user .*? for table '([^']+)'", PermissionError, Table, 0.95),
            (r"(?i)access denied for user", PermissionError, Nothing, 0.95),
            (r"(?i)incorrect \w+ value: '[^']*' for column '([^']+)'", TypeMismatch, Field, 0.9),
            (r"(?i)truncated incorrect \w+ value", TypeMismatch, Nothing, 0.85),
            (r"(?i)illegal mix of collations", TypeMismatch, Nothing, 0.8),
            (r"(?i)lost connection to mysql server", ConnectionError, Nothing, 0.92),
            (r"(?i)mysql server has gone away", ConnectionError, Nothing, 0.92),
            (r"(?i)can't connect to mysql server", ConnectionError, Nothing, 0.92),
            (r"(?i)too many connections", ConnectionError, Nothing, 0.9),
            (r"(?i)lock wait timeout exceeded", ConnectionError, Nothing, 0.8),
        ];

        // =====================================================================
        // PostgreSQL phrasing
        // =====================================================================
        let postgres: Vec<PatternSpec> = vec![
            (r#"(?i)column "([^"]+)"(?: of relation "[^"]+")? does not exist"#, FieldNotExists, Field, 0.95),
            (r#"(?i)relation "([^"]+)" does not exist"#, TableNotExists, Table, 0.95),
            (r#"(?i)syntax error at or near "([^"]*)""#, SyntaxError, Fragment, 0.92),
            (r"(?i)syntax error at end of input", SyntaxError, Nothing, 0.88),
            (r#"(?i)permission denied for (?:table|relation|view|sequence) "?([\w.]+)"?"#, PermissionError, Table, 0.95),
            (r"(?i)permission denied for (?:schema|database)", PermissionError, Nothing, 0.93),
            (r#"(?i)column "([^"]+)" is of type \w+.* but expression is of type"#, TypeMismatch, Field, 0.9),
            (r"(?i)operator does not exist", TypeMismatch, Nothing, 0.88),
            (r"(?i)invalid input syntax for(?: type)? \w+", TypeMismatch, Nothing, 0.88),
            (r"(?i)could not connect to server", ConnectionError, Nothing, 0.92),
            (r"(?i)server closed the connection unexpectedly", ConnectionError, Nothing, 0.92),
            (r"(?i)terminating connection due to", ConnectionError, Nothing, 0.9),
            (r"(?i)canceling statement due to statement timeout", ConnectionError, Nothing, 0.85),
        ];

        // =====================================================================
        // Dialect-neutral fallbacks
        // =====================================================================
        let generic: Vec<PatternSpec> = vec![
            (r#"(?i)(?:no such|unknown) (?:column|field)[: ]+["'`]?([\w.]+)"#, FieldNotExists, Field, 0.65),
            (r#"(?i)no such table[: ]+["'`]?([\w.]+)"#, TableNotExists, Table, 0.65),
            (r"(?i)syntax error", SyntaxError, Nothing, 0.6),
            (r"(?i)permission denied|not authori[sz]ed|insufficient privilege", PermissionError, Nothing, 0.7),
            (r"(?i)type mismatch|cannot be cast|invalid cast|data type", TypeMismatch, Nothing, 0.55),
            (
                r"(?i)\b(?:timed out|timeout|connection refused|connection reset|broken pipe|network is unreachable)\b",
                ConnectionError,
                Nothing,
                0.7,
            ),
        ];

        Self {
            mysql: compile(&mysql),
            postgres: compile(&postgres),
            generic: compile(&generic),
            table_ref: Regex::new(
                r#"(?i)\b(?:from|join|into|update)\s+[`"\[]?([A-Za-z_][\w$]*(?:[`"\]]?\.[`"\[]?[A-Za-z_][\w$]*)?)"#,
            )
            .expect("Invalid table reference regex"),
        }
    }

    fn patterns_for(&self, dialect: SqlDialect) -> &[ErrorPattern] {
        match dialect {
            SqlDialect::MySql => &self.mysql,
            SqlDialect::Postgres => &self.postgres,
        }
    }

    /// Classify a raw error message raised while executing `sql`.
    pub fn classify(&self, message: &str, sql: &str, dialect: SqlDialect) -> ClassifiedError {
        let foreign = SqlDialect::ALL
            .into_iter()
            .filter(|d| *d != dialect)
            .map(|d| (Some(d), FOREIGN_DIALECT_PENALTY, self.patterns_for(d)));
        let passes = std::iter::once((Some(dialect), 1.0f32, self.patterns_for(dialect)))
            .chain(foreign)
            .chain(std::iter::once((None, 1.0f32, self.generic.as_slice())));

        for (matched_dialect, factor, patterns) in passes {
            for pattern in patterns {
                if let Some(caps) = pattern.regex.captures(message) {
                    let captured = caps.get(1).map(|m| m.as_str().trim().to_string());
                    let classified = self.build(
                        pattern.kind,
                        pattern.base_confidence * factor,
                        pattern.capture,
                        captured,
                        message,
                        sql,
                        matched_dialect,
                    );
                    debug!(
                        error_type = %classified.error_type,
                        confidence = classified.confidence,
                        "sql error classified"
                    );
                    return classified;
                }
            }
        }

        self.build(
            SqlErrorKind::UnknownError,
            UNKNOWN_CONFIDENCE,
            Capture::Nothing,
            None,
            message,
            sql,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        kind: SqlErrorKind,
        confidence: f32,
        capture: Capture,
        captured: Option<String>,
        message: &str,
        sql: &str,
        dialect: Option<SqlDialect>,
    ) -> ClassifiedError {
        let mut fields = Vec::new();
        let mut tables = Vec::new();
        let mut needle: Option<String> = None;

        match (capture, captured) {
            (Capture::Field, Some(raw)) => {
                let bare = bare_identifier(&raw);
                needle = Some(bare.clone());
                fields.push(bare);
            }
            (Capture::Table, Some(raw)) => {
                let bare = bare_identifier(&raw);
                needle = Some(bare.clone());
                tables.push(bare);
            }
            (Capture::Fragment, Some(raw)) if !raw.is_empty() => {
                needle = Some(raw);
            }
            _ => {}
        }

        // Tables the statement touches help the generator or the user.
        let wants_sql_tables = match kind {
            SqlErrorKind::FieldNotExists => true,
            SqlErrorKind::TableNotExists | SqlErrorKind::PermissionError => tables.is_empty(),
            _ => false,
        };
        if wants_sql_tables {
            for t in self.tables_in(sql) {
                if !tables.contains(&t) {
                    tables.push(t);
                }
            }
        }

        ClassifiedError {
            error_type: kind,
            confidence: confidence.clamp(0.0, 1.0),
            retry_strategy: kind.retry_strategy(),
            suggested_fields: fields,
            suggested_tables: tables,
            error_location: needle.and_then(|n| locate(sql, &n)),
            message: message.to_string(),
            dialect,
        }
    }

    /// Bare table names referenced by `FROM`, `JOIN`, `INTO` and `UPDATE`.
    pub fn tables_in(&self, sql: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for caps in self.table_ref.captures_iter(sql) {
            if let Some(m) = caps.get(1) {
                let name = bare_identifier(m.as_str());
                if !out.contains(&name) {
                    out.push(name);
                }
            }
        }
        out
    }
}

/// Strip quoting and any schema or table qualifier: `db.t.col` -> `col`.
fn bare_identifier(raw: &str) -> String {
    let unquoted: String = raw
        .chars()
        .filter(|c| !matches!(c, '`' | '"' | '[' | ']'))
        .collect();
    unquoted
        .rsplit('.')
        .next()
        .unwrap_or(&unquoted)
        .trim()
        .to_string()
}

/// Case-insensitive position of `needle` in `sql`.
fn locate(sql: &str, needle: &str) -> Option<ErrorLocation> {
    if needle.is_empty() {
        return None;
    }
    let re = Regex::new(&format!("(?i){}", regex::escape(needle))).ok()?;
    re.find(sql).map(|m| ErrorLocation {
        start: m.start(),
        end: m.end(),
        snippet: m.as_str().to_string(),
    })
}
