use duckdb::types::Value;
use duckdb::Connection;

use crate::error::QueryError;

/// Fully materialized rows of one finished statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryOutput {
    /// Execute a query and materialize all rows into memory.
    pub fn from_query(conn: &Connection, sql: &str) -> Result<Self, QueryError> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| QueryError::ExecutionFailure(e.to_string()))?;
        let mut rows_iter = stmt
            .query([])
            .map_err(|e| QueryError::ExecutionFailure(e.to_string()))?;

        // Column info is only available once the statement has executed.
        let (column_count, column_names) = match rows_iter.as_ref() {
            Some(s) => (s.column_count(), s.column_names()),
            None => {
                return Err(QueryError::Internal(
                    "statement unavailable after execution".to_string(),
                ))
            }
        };

        let mut rows = Vec::new();
        while let Some(row) = rows_iter
            .next()
            .map_err(|e| QueryError::ExecutionFailure(e.to_string()))?
        {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let val = row
                    .get_ref(i)
                    .map(|v| v.to_owned())
                    .unwrap_or(Value::Null);
                values.push(val);
            }
            rows.push(values);
        }

        Ok(QueryOutput { column_names, rows })
    }

    /// Single VARCHAR cell, used for explain-only statements.
    pub fn text(column: &str, value: String) -> Self {
        QueryOutput {
            column_names: vec![column.to_string()],
            rows: vec![vec![Value::Text(value)]],
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn is_null(&self, row: usize, col: usize) -> bool {
        matches!(self.value(row, col), Some(Value::Null) | None)
    }

    /// `None` for NULL or out-of-range cells.
    pub fn get_string(&self, row: usize, col: usize) -> Option<String> {
        match self.value(row, col)? {
            Value::Null => None,
            v => Some(value_to_string(v)),
        }
    }

    pub fn get_long(&self, row: usize, col: usize) -> i64 {
        self.value(row, col).map(value_to_long).unwrap_or(0)
    }

    pub fn get_bool(&self, row: usize, col: usize) -> Option<bool> {
        match self.value(row, col)? {
            Value::Boolean(b) => Some(*b),
            Value::Null => None,
            v => Some(value_to_long(v) != 0),
        }
    }

    /// Every cell of the named column rendered as text.
    pub fn column_strings(&self, name: &str) -> Vec<Option<String>> {
        match self.column_index(name) {
            Some(col) => (0..self.rows.len())
                .map(|row| self.get_string(row, col))
                .collect(),
            None => Vec::new(),
        }
    }

    fn value(&self, row: usize, col: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(col))
    }
}

pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Boolean(b) => b.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::HugeInt(i) => i.to_string(),
        Value::UTinyInt(i) => i.to_string(),
        Value::USmallInt(i) => i.to_string(),
        Value::UInt(i) => i.to_string(),
        Value::UBigInt(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(f) => f.to_string(),
        Value::Decimal(d) => format!("{d}"),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => hex::encode(b),
        Value::Timestamp(_, us) => format!("{us}"),
        Value::Date32(d) => d.to_string(),
        Value::Time64(_, t) => t.to_string(),
        _ => format!("{v:?}"),
    }
}

fn value_to_long(v: &Value) -> i64 {
    match v {
        Value::Boolean(b) => *b as i64,
        Value::TinyInt(i) => *i as i64,
        Value::SmallInt(i) => *i as i64,
        Value::Int(i) => *i as i64,
        Value::BigInt(i) => *i,
        Value::HugeInt(i) => *i as i64,
        Value::UTinyInt(i) => *i as i64,
        Value::USmallInt(i) => *i as i64,
        Value::UInt(i) => *i as i64,
        Value::UBigInt(i) => *i as i64,
        Value::Float(f) => *f as i64,
        Value::Double(f) => *f as i64,
        _ => 0,
    }
}
