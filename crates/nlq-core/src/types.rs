//! Value types shared across the workspace.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Timestamp
// =============================================================================

/// Unix timestamp in seconds.
///
/// Compared by value. Two Timestamps with the same inner value are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    /// Seconds elapsed since this timestamp (never negative).
    pub fn age_secs(&self) -> i64 {
        (Timestamp::now().0 - self.0).max(0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

// =============================================================================
// SQL dialect
// =============================================================================

/// SQL dialect of a data source. Drives generation hints and error phrasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    #[serde(rename = "mysql")]
    MySql,
    Postgres,
}

impl SqlDialect {
    pub const ALL: [SqlDialect; 2] = [SqlDialect::MySql, SqlDialect::Postgres];
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDialect::MySql => write!(f, "mysql"),
            SqlDialect::Postgres => write!(f, "postgres"),
        }
    }
}

impl std::str::FromStr for SqlDialect {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(SqlDialect::MySql),
            "postgres" | "postgresql" | "pg" => Ok(SqlDialect::Postgres),
            _ => Err(format!("Unknown SQL dialect: {}", s)),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

// =============================================================================
// Query results
// =============================================================================

/// Tabular result of an executed SQL statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn new(
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
        execution_time_ms: u64,
    ) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            execution_time_ms,
        }
    }

    /// Human-readable status that carries no cell content.
    pub fn status_line(&self) -> String {
        let noun = if self.row_count == 1 { "row" } else { "rows" };
        format!(
            "returned {} {} in {} ms",
            self.row_count, noun, self.execution_time_ms
        )
    }

    /// Every non-null cell rendered as plain text.
    pub fn cell_texts(&self) -> impl Iterator<Item = String> + '_ {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .filter_map(render_cell)
    }
}

/// Render a JSON cell the way it would appear in prose.
fn render_cell(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_result() -> QueryResult {
        QueryResult::new(
            vec!["region".to_string(), "revenue".to_string()],
            vec![
                vec![json!("Northwind"), json!(1234.5)],
                vec![json!("Contoso"), json!(null)],
            ],
            42,
        )
    }

    #[test]
    fn test_timestamp_now_is_recent() {
        let ts = Timestamp::now();
        assert!(ts.age_secs() < 2);
    }

    #[test]
    fn test_timestamp_to_datetime_roundtrip() {
        let now = Utc::now();
        let ts = Timestamp::from_datetime(now);
        assert_eq!(ts.to_datetime().timestamp(), now.timestamp());
    }

    #[test]
    fn test_age_never_negative() {
        let future = Timestamp(Timestamp::now().0 + 3600);
        assert_eq!(future.age_secs(), 0);
    }

    #[test]
    fn test_dialect_from_str_aliases() {
        assert_eq!("MySQL".parse::<SqlDialect>().unwrap(), SqlDialect::MySql);
        assert_eq!("mariadb".parse::<SqlDialect>().unwrap(), SqlDialect::MySql);
        assert_eq!(
            "postgresql".parse::<SqlDialect>().unwrap(),
            SqlDialect::Postgres
        );
        assert!("oracle".parse::<SqlDialect>().is_err());
    }

    #[test]
    fn test_dialect_serde_names() {
        assert_eq!(
            serde_json::to_string(&SqlDialect::MySql).unwrap(),
            "\"mysql\""
        );
        assert_eq!(
            serde_json::to_string(&SqlDialect::Postgres).unwrap(),
            "\"postgres\""
        );
    }

    #[test]
    fn test_query_result_row_count_derived() {
        assert_eq!(sample_result().row_count, 2);
    }

    #[test]
    fn test_status_line_has_no_cells() {
        let status = sample_result().status_line();
        assert_eq!(status, "returned 2 rows in 42 ms");
        assert!(!status.contains("Northwind"));
    }

    #[test]
    fn test_status_line_singular() {
        let result = QueryResult::new(vec!["n".to_string()], vec![vec![json!(7)]], 3);
        assert_eq!(result.status_line(), "returned 1 row in 3 ms");
    }

    #[test]
    fn test_cell_texts_skip_nulls() {
        let cells: Vec<String> = sample_result().cell_texts().collect();
        assert_eq!(cells, vec!["Northwind", "1234.5", "Contoso"]);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }
}
