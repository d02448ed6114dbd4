//! Typed tabular records exchanged between jobs and the warehouse.
//!
//! A [`RecordBatch`] fixes its column list once and validates every row
//! against it at construction time.

use std::collections::HashSet;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{EtlError, Result};

/// One cell of a record.
///
/// Equality is structural and `Null == Null`, which matches SQL
/// `IS NOT DISTINCT FROM`.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn from_json(column: &str, value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value;
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Int(i)),
                None => n.as_f64().map(Self::Float).ok_or_else(|| {
                    EtlError::InvalidBatch(format!("column {column}: number {n} out of range"))
                }),
            },
            Value::String(s) => Ok(Self::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(EtlError::InvalidBatch(format!(
                "column {column}: nested values are not supported"
            ))),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Date(d) => write!(f, "{d}"),
            Self::Timestamp(ts) => write!(f, "{ts}"),
        }
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for CellValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for CellValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Column-homogeneous set of rows produced by one job for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl RecordBatch {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Result<Self> {
        if columns.is_empty() {
            return Err(EtlError::InvalidBatch(
                "a batch needs at least one column".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(EtlError::InvalidBatch(format!(
                    "duplicate column {column}"
                )));
            }
        }
        let mut batch = Self {
            columns,
            rows: Vec::with_capacity(rows.len()),
        };
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    /// Build from a JSON array of objects that all share the same keys.
    pub fn from_json_rows(value: &serde_json::Value) -> Result<Self> {
        let items = value.as_array().ok_or_else(|| {
            EtlError::InvalidBatch("expected a JSON array of objects".to_string())
        })?;
        let first = items
            .first()
            .and_then(|v| v.as_object())
            .ok_or_else(|| {
                EtlError::InvalidBatch("expected at least one JSON object".to_string())
            })?;
        let columns: Vec<String> = first.keys().cloned().collect();

        let mut rows = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let object = item.as_object().ok_or_else(|| {
                EtlError::InvalidBatch(format!("row {index} is not a JSON object"))
            })?;
            if object.len() != columns.len() {
                return Err(EtlError::InvalidBatch(format!(
                    "row {index} has {} fields, expected {}",
                    object.len(),
                    columns.len()
                )));
            }
            let row = columns
                .iter()
                .map(|column| {
                    let value = object.get(column).ok_or_else(|| {
                        EtlError::InvalidBatch(format!("row {index} is missing column {column}"))
                    })?;
                    CellValue::from_json(column, value)
                })
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }

        Self::new(columns, rows)
    }

    pub fn push_row(&mut self, row: Vec<CellValue>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(EtlError::InvalidBatch(format!(
                "row {} has {} values, expected {}",
                self.rows.len(),
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&CellValue> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }
}

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let table = Self {
            schema: schema.into(),
            name: name.into(),
        };
        validate_ident(&table.schema)?;
        validate_ident(&table.name)?;
        Ok(table)
    }

    /// Parse `schema.table`; a bare name takes `default_schema`.
    pub fn parse(qualified: &str, default_schema: &str) -> Result<Self> {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new(default_schema, qualified),
        }
    }

    /// Quoted `"schema"."name"` form for SQL text.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

pub fn validate_ident(ident: &str) -> Result<()> {
    if ident.trim().is_empty() || ident.contains('\0') {
        return Err(EtlError::InvalidIdentifier(ident.to_string()));
    }
    Ok(())
}

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
