//! Statement analysis: which tables must be resolved before a query can run,
//! and whether analysis alone answers the statement.

use std::collections::HashSet;
use std::ops::ControlFlow;

use sqlparser::ast::{Query, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;

use crate::error::QueryError;
use crate::metadata::{ColumnMetadata, TableReference};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzedStatement {
    /// `EXPLAIN` / `DESCRIBE`: finished once metadata is resolved.
    pub explain_only: bool,
    /// Base tables in order of first appearance. Table functions and CTE
    /// names are not included.
    pub tables: Vec<TableReference>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Analyzer;

impl Analyzer {
    pub fn new() -> Self {
        Analyzer
    }

    pub fn analyze(&self, sql: &str) -> Result<AnalyzedStatement, QueryError> {
        let statements = Parser::parse_sql(&DuckDbDialect {}, sql)
            .map_err(|e| QueryError::AnalysisFailure(format!("Failed to parse statement: {e}")))?;

        let statement = match statements.as_slice() {
            [statement] => statement,
            [] => return Err(QueryError::AnalysisFailure("Empty statement".to_string())),
            many => {
                return Err(QueryError::AnalysisFailure(format!(
                    "Expected a single statement, found {}",
                    many.len()
                )))
            }
        };

        let explain_only = matches!(
            statement,
            Statement::Explain { .. } | Statement::ExplainTable { .. }
        );

        let mut collector = RelationCollector::default();
        if let Statement::ExplainTable { table_name, .. } = statement {
            collector.add(table_name.0.iter().map(|i| i.value.clone()).collect());
        }
        let _ = statement.visit(&mut collector);

        Ok(AnalyzedStatement {
            explain_only,
            tables: collector.finish(),
        })
    }
}

#[derive(Default)]
struct RelationCollector {
    cte_names: HashSet<String>,
    seen: HashSet<TableReference>,
    tables: Vec<TableReference>,
}

impl RelationCollector {
    fn add(&mut self, parts: Vec<String>) {
        if let Some(table) = TableReference::from_parts(&parts) {
            if self.seen.insert(table.clone()) {
                self.tables.push(table);
            }
        }
    }

    fn finish(self) -> Vec<TableReference> {
        let cte_names = self.cte_names;
        self.tables
            .into_iter()
            .filter(|t| {
                t.schema.is_some() || !cte_names.contains(&t.table.to_lowercase())
            })
            .collect()
    }
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        // `trex_queries()` and friends carry arguments; only base tables need metadata.
        if let TableFactor::Table {
            name, args: None, ..
        } = table_factor
        {
            self.add(name.0.iter().map(|i| i.value.clone()).collect());
        }
        ControlFlow::Continue(())
    }
}

/// Textual plan returned by explain-only statements.
pub fn render_plan(sql: &str, resolved: &[(TableReference, Vec<ColumnMetadata>)]) -> String {
    let mut plan = format!("Analyzed: {}", sql.trim());
    if resolved.is_empty() {
        plan.push_str("\n  (no table references)");
    }
    for (table, columns) in resolved {
        let cols = columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        plan.push_str(&format!("\n  Table {}: [{}]", table, cols));
    }
    plan
}
