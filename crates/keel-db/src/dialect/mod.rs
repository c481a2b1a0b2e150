//! The dialect interface: per-database text rules and connection hooks.
//!
//! [`Grammar`] covers the parts that only produce text (quoting, placeholder
//! positions, transaction statements) and is object safe, so code that
//! just needs to build SQL can hold a `&dyn Grammar`. [`Dialect`] adds the
//! raw connection type and the driver calls the client needs.
//!
//! Every `Grammar` method has an ANSI flavoured default. A dialect
//! overrides only what differs from it.

pub mod sqlite;

use crate::error::DriverError;
use crate::value::{Method, QueryResponse, Row, Value};

/// An unnormalized driver response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
    /// Returned rows, if the statement produced any.
    pub rows: Vec<Row>,
    /// Rows changed by the statement.
    pub changes: u64,
    /// Id of the last inserted row, when the driver reports one.
    pub last_insert_id: Option<i64>,
}

/// Dialect text rules.
pub trait Grammar: Send + Sync {
    /// Short dialect name used in logs.
    fn name(&self) -> &'static str;

    /// Character used to quote identifiers.
    fn quote_char(&self) -> char {
        '"'
    }

    /// Quotes an identifier. Dotted paths are quoted per segment and `*`
    /// is left bare.
    fn wrap_identifier(&self, ident: &str) -> String {
        wrap_segments(ident, self.quote_char())
    }

    /// Rewrites `?` placeholders into the dialect's positional form.
    fn position_bindings(&self, sql: &str) -> String {
        sql.to_string()
    }

    /// Renders a value as a literal. Used for diagnostics only.
    fn escape_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Integer(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Text(v) => format!("'{}'", v.replace('\'', "''")),
            Value::Blob(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                format!("X'{hex}'")
            }
        }
    }

    /// Statement opening a transaction.
    fn begin_transaction_sql(&self) -> &'static str {
        "BEGIN"
    }

    /// Statement committing a transaction.
    fn commit_sql(&self) -> &'static str {
        "COMMIT"
    }

    /// Statement rolling back a transaction.
    fn rollback_sql(&self) -> &'static str {
        "ROLLBACK"
    }

    /// Whether nested transactions can be expressed as savepoints.
    fn supports_savepoints(&self) -> bool {
        true
    }

    fn savepoint_sql(&self, name: &str) -> String {
        format!("SAVEPOINT {}", self.wrap_identifier(name))
    }

    fn release_savepoint_sql(&self, name: &str) -> String {
        format!("RELEASE SAVEPOINT {}", self.wrap_identifier(name))
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", self.wrap_identifier(name))
    }

    /// Clause appended to a select to lock the rows it reads until the
    /// enclosing transaction ends.
    ///
    /// `None` means the dialect already serializes writers when the
    /// transaction begins, so a plain read is sufficient.
    fn locking_read_clause(&self) -> Option<&'static str> {
        Some("FOR UPDATE")
    }

    /// Column definition for an auto-incrementing primary key.
    fn increments_type(&self) -> &'static str {
        "serial primary key"
    }

    /// Column type for timestamps.
    fn timestamp_type(&self) -> &'static str {
        "timestamptz"
    }
}

/// Database specific connection handling and statement execution.
pub trait Dialect: Grammar + 'static {
    /// The driver's connection handle.
    type Raw: Send + 'static;

    /// Opens a new raw connection. Called by the pool.
    fn acquire_raw_connection(&self) -> Result<Self::Raw, DriverError>;

    /// Closes a raw connection the pool is evicting.
    fn destroy_raw_connection(&self, raw: Self::Raw) {
        drop(raw);
    }

    /// Checks a connection before the pool lends it out.
    fn validate_connection(&self, raw: &mut Self::Raw) -> Result<(), DriverError>;

    /// Runs one statement. `sql` has already been through
    /// [`Grammar::position_bindings`].
    fn query(
        &self,
        raw: &mut Self::Raw,
        sql: &str,
        bindings: &[Value],
        method: &Method,
    ) -> Result<RawResponse, DriverError>;

    /// Runs a multi-statement script without bindings.
    fn execute_script(&self, raw: &mut Self::Raw, sql: &str) -> Result<(), DriverError>;

    /// Whether `error` means another session holds a lock this one waited
    /// on and gave up.
    fn is_busy(&self, _error: &DriverError) -> bool {
        false
    }

    /// Shapes a driver response according to the statement's method.
    fn process_response(&self, method: &Method, raw: RawResponse) -> QueryResponse {
        match method {
            Method::Select => QueryResponse::Rows(raw.rows),
            Method::First => QueryResponse::Row(raw.rows.into_iter().next()),
            Method::Pluck(column) => QueryResponse::Values(
                raw.rows
                    .iter()
                    .filter_map(|row| row.get(column).cloned())
                    .collect(),
            ),
            Method::Insert => QueryResponse::Inserted {
                affected: raw.changes,
                last_insert_id: raw.last_insert_id,
            },
            Method::Update | Method::Delete => QueryResponse::Affected(raw.changes),
            Method::Raw => QueryResponse::Raw(raw),
        }
    }
}

fn wrap_segments(ident: &str, quote: char) -> String {
    let doubled = format!("{quote}{quote}");
    ident
        .split('.')
        .map(|segment| {
            let segment = segment.trim();
            if segment == "*" {
                segment.to_string()
            } else {
                format!(
                    "{quote}{}{quote}",
                    segment.replace(quote, &doubled)
                )
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Walks `sql` and replaces every placeholder `?` with `replace(index)`.
///
/// Question marks inside quoted strings or identifiers are left alone and
/// `??` is an escaped literal `?`.
fn rewrite_placeholders(sql: &str, mut replace: impl FnMut(usize) -> String) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    let mut index = 0;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' if chars.peek() == Some(&'?') => {
                    chars.next();
                    out.push('?');
                }
                '?' => {
                    out.push_str(&replace(index));
                    index += 1;
                }
                _ => out.push(c),
            },
        }
    }

    out
}

/// Numbers `?` placeholders as `{prefix}1`, `{prefix}2`, ...
pub fn number_placeholders(sql: &str, prefix: &str) -> String {
    rewrite_placeholders(sql, |idx| format!("{prefix}{}", idx + 1))
}

/// Substitutes escaped bindings for the placeholders in `sql`.
///
/// The result is for error messages and logs only and is never sent to a
/// database. Placeholders without a matching binding stay as `?`.
pub fn render_sql(grammar: &dyn Grammar, sql: &str, bindings: &[Value]) -> String {
    rewrite_placeholders(sql, |idx| match bindings.get(idx) {
        Some(value) => grammar.escape_value(value),
        None => "?".to_string(),
    })
}
