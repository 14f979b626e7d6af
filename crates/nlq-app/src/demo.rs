//! In-memory demo catalog.
//!
//! Two small tables (`orders`, `customers`) with keyword-driven table
//! selection, template SQL generation, a tiny executor for the templates and
//! a one-line analyzer. Enough to drive every stage of a dialogue without a
//! model or a database.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use nlq_context::LocalMessage;
use nlq_core::types::{QueryResult, SqlDialect};
use nlq_dialogue::{
    Analysis, Analyzer, CapabilityError, GeneratedSql, Intent, SqlExecutor, SqlGenerator,
    TableCandidate, TableSelector,
};
use nlq_semantic::{ModuleKind, StaticModuleProvider};
use regex::Regex;
use serde_json::{json, Value};

struct DemoTable {
    name: &'static str,
    columns: &'static [&'static str],
    /// Extra words that point at this table.
    keywords: &'static [&'static str],
    description: &'static str,
}

const TABLES: [DemoTable; 2] = [
    DemoTable {
        name: "orders",
        columns: &["id", "region", "customer_id", "revenue"],
        keywords: &["order", "revenue", "sales", "region", "regions"],
        description: "One row per order. revenue is the order total in USD.",
    },
    DemoTable {
        name: "customers",
        columns: &["id", "name", "country"],
        keywords: &["customer", "client", "clients", "buyer", "buyers"],
        description: "One row per customer.",
    },
];

const CUSTOMERS: [(i64, &str, &str); 4] = [
    (1, "Northwind Traders", "DE"),
    (2, "Contoso", "US"),
    (3, "Fabrikam", "JP"),
    (4, "Tailspin Toys", "GB"),
];

// (id, region, customer_id, revenue)
const ORDERS: [(i64, &str, i64, f64); 8] = [
    (1, "EMEA", 1, 1200.0),
    (2, "EMEA", 4, 310.5),
    (3, "AMER", 2, 980.0),
    (4, "AMER", 2, 455.0),
    (5, "APAC", 3, 1530.0),
    (6, "APAC", 3, 220.0),
    (7, "EMEA", 1, 640.0),
    (8, "AMER", 4, 75.25),
];

pub struct DemoCatalog {
    table_ref: Regex,
}

impl Default for DemoCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoCatalog {
    pub fn new() -> Self {
        Self {
            table_ref: Regex::new(r"(?i)\b(?:from|join)\s+([A-Za-z_][A-Za-z0-9_]*)")
                .expect("Invalid table reference regex"),
        }
    }

    /// Semantic modules describing the catalog.
    pub fn module_providers(&self) -> Vec<StaticModuleProvider> {
        let mut structure = StaticModuleProvider::new(ModuleKind::TableStructure);
        for table in &TABLES {
            structure = structure.with_table_text(
                table.name,
                format!("{}({}) -- {}", table.name, table.columns.join(", "), table.description),
            );
        }
        vec![
            StaticModuleProvider::new(ModuleKind::DataSource)
                .with_text("demo: in-memory sales data, MySQL syntax"),
            structure,
            StaticModuleProvider::new(ModuleKind::TableRelation)
                .with_text("orders.customer_id references customers.id"),
            StaticModuleProvider::new(ModuleKind::Dictionary)
                .with_text("region codes: EMEA, AMER, APAC"),
            StaticModuleProvider::new(ModuleKind::Knowledge)
                .with_text("revenue means the sum of order totals; sales is a synonym of revenue"),
        ]
    }

    fn customer_name(id: i64) -> &'static str {
        CUSTOMERS
            .iter()
            .find(|(cid, _, _)| *cid == id)
            .map(|(_, name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Sum revenue per key, largest first.
    fn revenue_by(key: impl Fn(&(i64, &'static str, i64, f64)) -> String) -> Vec<Vec<Value>> {
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for order in &ORDERS {
            *totals.entry(key(order)).or_default() += order.3;
        }
        let mut rows: Vec<(String, f64)> = totals.into_iter().collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1));
        rows.into_iter()
            .map(|(k, v)| vec![json!(k), json!(v)])
            .collect()
    }

    fn run(&self, sql: &str) -> Result<QueryResult, CapabilityError> {
        for caps in self.table_ref.captures_iter(sql) {
            let table = &caps[1];
            if !TABLES.iter().any(|t| t.name.eq_ignore_ascii_case(table)) {
                return Err(CapabilityError::Failed(format!(
                    "Table 'demo.{}' doesn't exist",
                    table
                )));
            }
        }

        let started = Instant::now();
        let upper = sql.to_uppercase();
        let (columns, rows) = if upper.contains("GROUP BY C.NAME") {
            (
                vec!["name".to_string(), "revenue".to_string()],
                Self::revenue_by(|o| Self::customer_name(o.2).to_string()),
            )
        } else if upper.contains("GROUP BY REGION") {
            (
                vec!["region".to_string(), "revenue".to_string()],
                Self::revenue_by(|o| o.1.to_string()),
            )
        } else if upper.contains("COUNT(*)") {
            (vec!["orders".to_string()], vec![vec![json!(ORDERS.len())]])
        } else if upper.starts_with("SELECT * FROM ORDERS") {
            (
                TABLES[0].columns.iter().map(|c| c.to_string()).collect(),
                ORDERS
                    .iter()
                    .map(|(id, region, customer, revenue)| {
                        vec![json!(id), json!(region), json!(customer), json!(revenue)]
                    })
                    .collect(),
            )
        } else {
            return Err(CapabilityError::Failed(format!(
                "You have an error in your SQL syntax; the demo executor cannot run '{}'",
                sql
            )));
        };
        Ok(QueryResult::new(
            columns,
            rows,
            started.elapsed().as_millis() as u64,
        ))
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl TableSelector for DemoCatalog {
    async fn select(
        &self,
        question: &str,
        _data_source_id: Option<&str>,
    ) -> Result<Vec<TableCandidate>, CapabilityError> {
        let words = words(question);
        let mut candidates: Vec<TableCandidate> = TABLES
            .iter()
            .map(|table| {
                let hits = words
                    .iter()
                    .filter(|w| {
                        let stem = w.trim_end_matches('s');
                        table.name.trim_end_matches('s') == stem
                            || table.keywords.contains(&w.as_str())
                            || table.columns.contains(&w.as_str())
                    })
                    .count();
                TableCandidate::new(table.name, (hits as f32 * 0.4).min(1.0))
            })
            .collect();
        candidates.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

        let relevant = candidates.iter().filter(|c| c.relevance > 0.0).count();
        if relevant > 1 {
            for c in candidates.iter_mut() {
                c.join_hints.push("orders.customer_id = customers.id".to_string());
            }
        }
        Ok(candidates)
    }
}

#[async_trait]
impl SqlGenerator for DemoCatalog {
    async fn generate(
        &self,
        question: &str,
        _context: &str,
        _dialect: SqlDialect,
    ) -> Result<GeneratedSql, CapabilityError> {
        // The templates are valid in both dialects.
        let q = question.to_lowercase();
        let sql = if ["customer", "client", "buyer"].iter().any(|w| q.contains(w)) {
            "SELECT c.name, SUM(o.revenue) AS revenue FROM orders o JOIN customers c ON o.customer_id = c.id GROUP BY c.name ORDER BY revenue DESC".to_string()
        } else if q.contains("region") {
            "SELECT region, SUM(revenue) AS revenue FROM orders GROUP BY region ORDER BY revenue DESC".to_string()
        } else if q.contains("how many") || q.contains("count") {
            "SELECT COUNT(*) AS orders FROM orders".to_string()
        } else {
            "SELECT * FROM orders LIMIT 10".to_string()
        };
        Ok(GeneratedSql {
            sql,
            confidence: 0.7,
        })
    }
}

#[async_trait]
impl SqlExecutor for DemoCatalog {
    async fn execute(
        &self,
        sql: &str,
        _data_source_id: Option<&str>,
    ) -> Result<QueryResult, CapabilityError> {
        self.run(sql)
    }
}

#[async_trait]
impl Analyzer for DemoCatalog {
    async fn analyze(
        &self,
        _question: &str,
        intent: Intent,
        result: &QueryResult,
        _transcript: &[LocalMessage],
    ) -> Result<Analysis, CapabilityError> {
        let prefix = if intent == Intent::DataFollowup {
            "Looking at the previous result: "
        } else {
            ""
        };
        let Some(first) = result.rows.first() else {
            return Ok(Analysis {
                text: format!("{}the query returned no rows.", prefix),
                data: None,
            });
        };

        let text = match (first.first(), first.get(1).and_then(Value::as_f64)) {
            (Some(label), Some(value)) if result.columns.len() == 2 => {
                let total: f64 = result
                    .rows
                    .iter()
                    .filter_map(|r| r.get(1).and_then(Value::as_f64))
                    .sum();
                let label = label.as_str().map(str::to_string).unwrap_or_else(|| label.to_string());
                format!(
                    "{}{} leads with {:.2} of {:.2} total {} across {} rows.",
                    prefix, label, value, total, result.columns[1], result.row_count
                )
            }
            _ => format!("{}{}.", prefix, result.status_line()),
        };
        Ok(Analysis {
            text,
            data: Some(json!({ "columns": result.columns, "row_count": result.row_count })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_selector_ranks_orders_for_revenue() {
        let catalog = DemoCatalog::new();
        let candidates = catalog.select("total revenue by region", None).await.unwrap();
        assert_eq!(candidates[0].name, "orders");
        assert!(candidates[0].relevance >= 0.8);
        assert_eq!(candidates[1].relevance, 0.0);
    }

    #[tokio::test]
    async fn test_selector_joins_when_both_tables_match() {
        let catalog = DemoCatalog::new();
        let candidates = catalog.select("revenue per customer", None).await.unwrap();
        assert!(candidates.iter().all(|c| c.relevance > 0.0));
        assert!(!candidates[0].join_hints.is_empty());
    }

    #[tokio::test]
    async fn test_generated_sql_runs() {
        let catalog = DemoCatalog::new();
        for question in [
            "revenue by region",
            "top customers by revenue",
            "how many orders",
            "show orders",
        ] {
            let generated = catalog
                .generate(question, "", SqlDialect::MySql)
                .await
                .unwrap();
            let result = catalog.execute(&generated.sql, None).await;
            assert!(result.is_ok(), "{question}: {:?}", result.err());
        }
    }

    #[test]
    fn test_region_totals() {
        let result = DemoCatalog::new()
            .run("SELECT region, SUM(revenue) AS revenue FROM orders GROUP BY region")
            .unwrap();
        assert_eq!(result.row_count, 3);
        assert_eq!(result.rows[0][0], json!("EMEA"));
        assert_eq!(result.rows[0][1], json!(2150.5));
    }

    #[test]
    fn test_unknown_table_error_is_mysql_shaped() {
        let err = DemoCatalog::new()
            .run("SELECT * FROM refunds")
            .unwrap_err();
        assert_eq!(
            err,
            CapabilityError::Failed("Table 'demo.refunds' doesn't exist".into())
        );
    }

    #[tokio::test]
    async fn test_analysis_names_leader() {
        let catalog = DemoCatalog::new();
        let result = catalog
            .run("SELECT region, SUM(revenue) FROM orders GROUP BY region")
            .unwrap();
        let analysis = catalog
            .analyze("q", Intent::SmartQuery, &result, &[])
            .await
            .unwrap();
        assert!(analysis.text.starts_with("EMEA leads"));
    }
}
