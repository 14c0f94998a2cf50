//! Resilient access to an SQLite file shared between processes
//!
//! Every call opens its own connection, runs under a [RetryPolicy] and closes the connection
//! again. Workers that write a lot get a private shard file through [Store::shard], which is
//! merged back into the primary file with [Store::merge] once the worker is done.

mod retry;

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database is busy: {0}")]
    Busy(#[source] rusqlite::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
    #[error("{operation} gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: i64,
        #[source]
        source: Box<StoreError>,
    },
    #[error("shard {0} does not exist")]
    MissingShard(PathBuf),
    #[error("table '{table}': {reason}")]
    Schema { table: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error is a lock conflict that a later attempt may not hit
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StoreError::Busy(err),
            _ => StoreError::Sqlite(err),
        }
    }
}

/// How [Store::write] treats an existing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Drop and recreate the table before inserting
    Replace,
    /// Insert into the table, creating it when missing
    #[default]
    Append,
}

/// An SQL statement with positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    sql: String,
    params: Vec<Value>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Query::new(sql)
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Query::new(sql)
    }
}

/// One output row, an ordered list of named values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Append a column, replacing the value if the column already exists
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.columns.iter().position(|c| *c == column) {
            Some(i) => self.values[i] = value,
            None => {
                self.columns.push(column);
                self.values.push(value);
            }
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Numeric value of `column`, integers are widened
    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(as_f64)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Numeric view of an SQLite value
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Real(v) => Some(*v),
        Value::Integer(v) => Some(*v as f64),
        _ => None,
    }
}

/// Quote an SQL identifier, column names such as `generic_params.r_scale` contain dots
pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Identity of the worker owning a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardId {
    /// The current OS process
    Process,
    /// A worker of an in-process pool
    Worker(usize),
}

/// Handle on an SQLite file
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    policy: RetryPolicy,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.policy.timeout)?;
        Ok(conn)
    }

    /// Run `queries` in one transaction and return the rows of the last one
    pub fn execute(&self, queries: &[Query]) -> Result<Vec<Vec<Value>>, StoreError> {
        self.policy.run("execute", || {
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;
            let mut rows = Vec::new();
            for query in queries {
                rows = run_query(&tx, query)?;
            }
            tx.commit()?;
            Ok(rows)
        })
    }

    /// First column of the first row returned by `query`
    pub fn fetch_one(&self, query: Query) -> Result<Option<Value>, StoreError> {
        let rows = self.execute(&[query])?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
    }

    /// Rows of `query` as named [Row]s
    pub fn select(&self, query: Query) -> Result<Vec<Row>, StoreError> {
        self.policy.run("select", || {
            let conn = self.connect()?;
            let mut stmt = conn.prepare(query.sql())?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let values = (0..columns.len())
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<Result<Vec<_>, _>>()?;
                out.push(Row::from_parts(columns.clone(), values));
            }
            Ok(out)
        })
    }

    /// Column names of `table`, empty when the table does not exist
    pub fn columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows = self.execute(&[Query::new("SELECT name FROM pragma_table_info(?1)").bind(table.to_string())])?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(Value::Text(name)) => Some(name),
                _ => None,
            })
            .collect())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let count = self.fetch_one(
            Query::new("SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(table.to_string()),
        )?;
        Ok(matches!(count, Some(Value::Integer(n)) if n > 0))
    }

    /// Write `rows` to `table`, creating it from the first row's columns when needed
    ///
    /// Every row must carry the columns of the first row, in the same order.
    pub fn write(&self, table: &str, rows: &[Row], mode: WriteMode) -> Result<usize, StoreError> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        if let Some(row) = rows.iter().find(|row| row.columns() != first.columns()) {
            return Err(StoreError::Schema {
                table: table.to_string(),
                reason: format!(
                    "row columns {:?} differ from {:?}",
                    row.columns(),
                    first.columns()
                ),
            });
        }

        let create = create_table_sql(table, first);
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(table),
            first
                .columns()
                .iter()
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=first.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.policy.run(&format!("write {}", table), || {
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;
            if mode == WriteMode::Replace {
                tx.execute(&format!("DROP TABLE IF EXISTS {}", quote(table)), [])?;
            }
            tx.execute(&create, [])?;
            {
                let mut stmt = tx.prepare(&insert)?;
                for row in rows {
                    stmt.execute(params_from_iter(row.values().iter()))?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
    }

    /// A private store next to this one, see [ShardId]
    ///
    /// Shards are named `<primary>.<pid>` or `<primary>.<pid>-<worker>`.
    pub fn shard(&self, id: ShardId) -> Store {
        let pid = std::process::id();
        let name = match id {
            ShardId::Process => format!("{}.{}", self.path.display(), pid),
            ShardId::Worker(worker) => format!("{}.{}-{}", self.path.display(), pid, worker),
        };
        Store::new(name, self.policy)
    }

    /// Remove the file backing this store, if any
    pub fn discard(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            tracing::debug!("Discarding stale database {}", self.path.display());
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Copy `table` from `shard` into this store and delete the shard file
    ///
    /// Only safe once the worker owning the shard has finished writing. A shard is consumed by a
    /// successful merge, merging it a second time fails with [StoreError::MissingShard].
    pub fn merge(&self, shard: &Store, table: &str) -> Result<usize, StoreError> {
        if !shard.path.exists() {
            return Err(StoreError::MissingShard(shard.path.clone()));
        }

        let columns = shard.columns(table)?;
        if columns.is_empty() {
            tracing::debug!(
                "Shard {} has no table {}, nothing to merge",
                shard.path.display(),
                table
            );
            std::fs::remove_file(&shard.path)?;
            return Ok(0);
        }
        let column_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let shard_path = shard.path.display().to_string();

        let merged = self.policy.run(&format!("merge {}", table), || {
            let mut conn = self.connect()?;
            conn.execute("ATTACH DATABASE ?1 AS shard", [&shard_path])?;
            let result = (|| {
                let tx = conn.transaction()?;
                let exists: i64 = tx.query_row(
                    "SELECT count(*) FROM main.sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    tx.execute(
                        &format!(
                            "CREATE TABLE main.{} AS SELECT * FROM shard.{} WHERE 0",
                            quote(table),
                            quote(table)
                        ),
                        [],
                    )?;
                }
                let n = tx.execute(
                    &format!(
                        "INSERT INTO main.{} ({}) SELECT {} FROM shard.{}",
                        quote(table),
                        column_list,
                        column_list,
                        quote(table)
                    ),
                    [],
                )?;
                tx.commit()?;
                Ok::<usize, StoreError>(n)
            })();
            conn.execute("DETACH DATABASE shard", [])?;
            result
        })?;

        std::fs::remove_file(&shard.path)?;
        tracing::debug!(
            "Merged {} rows of {} from {} into {}",
            merged,
            table,
            shard.path.display(),
            self.path.display()
        );
        Ok(merged)
    }
}

fn run_query(conn: &Connection, query: &Query) -> Result<Vec<Vec<Value>>, StoreError> {
    let mut stmt = conn.prepare(query.sql())?;
    let ncols = stmt.column_count();
    let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..ncols)
            .map(|i| row.get::<_, Value>(i))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(values);
    }
    Ok(out)
}

fn create_table_sql(table: &str, row: &Row) -> String {
    let columns = row
        .columns()
        .iter()
        .zip(row.values())
        .map(|(name, value)| {
            let affinity = match value {
                Value::Integer(_) => " INTEGER",
                Value::Real(_) => " REAL",
                Value::Text(_) => " TEXT",
                Value::Blob(_) => " BLOB",
                Value::Null => "",
            };
            format!("{}{}", quote(name), affinity)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(table), columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("generic_params.r_scale"), "\"generic_params.r_scale\"");
        assert_eq!(quote("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_row_push_replaces() {
        let mut row = Row::new().with("id", 1i64).with("sys", 120.0);
        row.push("sys", 118.0);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get_f64("sys"), Some(118.0));
        assert_eq!(row.get_f64("id"), Some(1.0));
    }

    #[test]
    fn test_create_table_affinity() {
        let row = Row::new()
            .with("id", 3i64)
            .with("temp", "hot".to_string())
            .with("sys", 121.5);
        assert_eq!(
            create_table_sql("out", &row),
            "CREATE TABLE IF NOT EXISTS \"out\" (\"id\" INTEGER, \"temp\" TEXT, \"sys\" REAL)"
        );
    }

    #[test]
    fn test_busy_is_transient() {
        let busy = StoreError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        ));
        assert!(busy.is_transient());
        let missing = StoreError::MissingShard(PathBuf::from("x"));
        assert!(!missing.is_transient());
    }
}
