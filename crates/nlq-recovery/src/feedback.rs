//! Corrective text handed back to SQL generation, and questions for the user.

use crate::classifier::{ClassifiedError, SqlErrorKind};

/// Structured feedback for the next generation attempt.
///
/// Carries the original question, the failing SQL, the error type, and the
/// candidate identifiers. Suggested fields are phrased as columns to avoid.
pub fn build_feedback(question: &str, failed_sql: &str, error: &ClassifiedError) -> String {
    let mut lines = vec![
        "The previous SQL failed. Write a corrected query.".to_string(),
        format!("Question: {}", question.trim()),
        format!("Failed SQL: {}", failed_sql.trim()),
        format!("Error type: {}", error.error_type),
        format!("Error message: {}", error.message.trim()),
    ];
    if !error.suggested_fields.is_empty() {
        lines.push(format!(
            "Do not reference these columns: {}",
            error.suggested_fields.join(", ")
        ));
    }
    if !error.suggested_tables.is_empty() {
        lines.push(format!(
            "Candidate tables: {}",
            error.suggested_tables.join(", ")
        ));
    }
    if let Some(loc) = &error.error_location {
        lines.push(format!("Problem near: {}", loc.snippet));
    }
    lines.join("\n")
}

/// Question put to the user when an error needs their input.
pub fn clarification_question(error: &ClassifiedError) -> String {
    match (error.error_type, error.suggested_tables.first()) {
        (SqlErrorKind::TableNotExists, Some(table)) => format!(
            "The table `{}` does not exist in this data source. Which table holds the data you are asking about?",
            table
        ),
        (SqlErrorKind::TableNotExists, None) => {
            "One of the tables in the query does not exist. Which table holds the data you are asking about?"
                .to_string()
        }
        _ => "I could not build a working query for that. Could you rephrase the question or name the tables to use?"
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SqlErrorClassifier;
    use nlq_core::types::SqlDialect;

    #[test]
    fn test_feedback_has_all_parts() {
        let sql = "SELECT foo FROM orders";
        let error = SqlErrorClassifier::new().classify(
            "Unknown column 'foo' in 'field list'",
            sql,
            SqlDialect::MySql,
        );
        let text = build_feedback("total sales by foo", sql, &error);
        assert!(text.contains("Question: total sales by foo"));
        assert!(text.contains("Failed SQL: SELECT foo FROM orders"));
        assert!(text.contains("Error type: field_not_exists"));
        assert!(text.contains("Do not reference these columns: foo"));
        assert!(text.contains("Candidate tables: orders"));
    }

    #[test]
    fn test_feedback_omits_empty_sections() {
        let error = SqlErrorClassifier::new().classify("weird", "SELECT 1", SqlDialect::MySql);
        let text = build_feedback("q", "SELECT 1", &error);
        assert!(!text.contains("Do not reference"));
        assert!(!text.contains("Candidate tables"));
        assert!(text.contains("Error type: unknown_error"));
    }

    #[test]
    fn test_clarification_names_missing_table() {
        let error = SqlErrorClassifier::new().classify(
            "Table 'shop.refunds' doesn't exist",
            "SELECT * FROM refunds",
            SqlDialect::MySql,
        );
        let q = clarification_question(&error);
        assert!(q.contains("`refunds`"));
    }
}
