//! Statements, bound values, and normalized responses.

use std::sync::Arc;

use crate::error::DbError;

/// A value bound to a statement or read from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// A 64-bit signed integer.
    Integer(i64),
    /// A double precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Returns the integer if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns `true` for `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// The kind of operation a statement performs.
///
/// Drives how a dialect normalizes the driver's response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Method {
    /// Return every row.
    Select,
    /// Return the first row, if any.
    First,
    /// Return one column from every row.
    Pluck(String),
    /// Return the affected count and last insert id.
    Insert,
    /// Return the affected count.
    Update,
    /// Return the affected count.
    Delete,
    /// Return the unnormalized driver response.
    #[default]
    Raw,
}

/// A statement with `?` placeholders and the values bound to them.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text using `?` placeholders.
    pub sql: String,
    /// Values for the placeholders, in order.
    pub bindings: Vec<Value>,
    /// Response normalization to apply.
    pub method: Method,
}

impl Statement {
    /// Creates a statement whose response is returned as-is.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: Vec::new(),
            method: Method::Raw,
        }
    }

    /// Creates a row-returning statement.
    pub fn select(sql: impl Into<String>) -> Self {
        Self::raw(sql).method(Method::Select)
    }

    /// Creates an insert statement.
    pub fn insert(sql: impl Into<String>) -> Self {
        Self::raw(sql).method(Method::Insert)
    }

    /// Creates an update statement.
    pub fn update(sql: impl Into<String>) -> Self {
        Self::raw(sql).method(Method::Update)
    }

    /// Creates a delete statement.
    pub fn delete(sql: impl Into<String>) -> Self {
        Self::raw(sql).method(Method::Delete)
    }

    /// Sets the response normalization.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a bound value.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.bindings.push(value.into());
        self
    }
}

/// A single result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row. `values` must be parallel to `columns`.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Column names, in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values, in select order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Looks up a value by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    /// Reads an integer column.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Decode` if the column is missing or not an integer.
    pub fn get_i64(&self, column: &str) -> Result<i64, DbError> {
        self.get(column)
            .and_then(Value::as_i64)
            .ok_or_else(|| decode_error(column, "integer"))
    }

    /// Reads a text column.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Decode` if the column is missing or not text.
    pub fn get_str(&self, column: &str) -> Result<&str, DbError> {
        self.get(column)
            .and_then(Value::as_str)
            .ok_or_else(|| decode_error(column, "text"))
    }

    /// Reads a nullable integer column.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Decode` if the column is missing or holds a
    /// non-integer, non-null value.
    pub fn get_opt_i64(&self, column: &str) -> Result<Option<i64>, DbError> {
        match self.get(column) {
            Some(Value::Null) => Ok(None),
            Some(Value::Integer(v)) => Ok(Some(*v)),
            _ => Err(decode_error(column, "integer or null")),
        }
    }
}

fn decode_error(column: &str, expected: &'static str) -> DbError {
    DbError::Decode {
        column: column.to_string(),
        expected,
    }
}

/// A driver response normalized according to the statement's [`Method`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    /// Every returned row.
    Rows(Vec<Row>),
    /// The first returned row.
    Row(Option<Row>),
    /// One column from every returned row.
    Values(Vec<Value>),
    /// Result of an insert.
    Inserted {
        /// Rows written.
        affected: u64,
        /// Id of the last inserted row, when the driver reports one.
        last_insert_id: Option<i64>,
    },
    /// Rows changed by an update or delete.
    Affected(u64),
    /// The driver response, untouched.
    Raw(crate::dialect::RawResponse),
}

impl QueryResponse {
    /// Returns the rows, whatever shape the response took.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Row(row) => row.into_iter().collect(),
            Self::Raw(raw) => raw.rows,
            Self::Values(_) | Self::Inserted { .. } | Self::Affected(_) => Vec::new(),
        }
    }

    /// Returns the number of rows written, or zero for reads.
    pub fn affected(&self) -> u64 {
        match self {
            Self::Inserted { affected, .. } | Self::Affected(affected) => *affected,
            Self::Raw(raw) => raw.changes,
            Self::Rows(_) | Self::Row(_) | Self::Values(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_values_bind_as_null() {
        let stmt = Statement::select("SELECT ?, ?")
            .bind(None::<i64>)
            .bind(Some("x"));
        assert_eq!(stmt.bindings, vec![Value::Null, Value::Text("x".into())]);
        assert_eq!(stmt.method, Method::Select);
    }

    #[test]
    fn row_accessors_report_type_mismatch() {
        let columns: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();
        let row = Row::new(columns, vec![Value::Integer(7), Value::Text("a".into())]);

        assert_eq!(row.get_i64("id").expect("id is an integer"), 7);
        assert_eq!(row.get_str("name").expect("name is text"), "a");
        assert!(matches!(
            row.get_i64("name"),
            Err(DbError::Decode { ref column, .. }) if column == "name"
        ));
        assert!(row.get("missing").is_none());
    }
}
