//! Query execution engine.
//!
//! Runs a statement batch against one SQLite connection, draining the side
//! channel after every statement and running whatever side-effect commands
//! trigger logic queued there.

use serde_json::{Map, Number, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, SqliteConnection, TypeInfo, ValueRef};
use tracing::{debug, error, info, warn};

use crate::config::LogConfig;
use crate::error::{ShimError, ShimResult};
use crate::jsexec::{SideEffectProcessor, parse_queue};
use crate::meta::{self, DbMessage, Severity};
use crate::params::{text_as_bool, to_hex};
use crate::splitter::{Statement, StatementKind, split_sql};

/// Column suffix asking for the value to be returned as a boolean.
pub const BOOLEAN_CAST_SUFFIX: &str = "__cast_as_boolean";

/// One result row, columns in select order.
pub type DbRow = Map<String, Value>;

pub type Recordset = Vec<DbRow>;

/// Everything a batch produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutput {
    pub results: Vec<Recordset>,
    pub messages: Vec<DbMessage>,
}

/// Sequential statement runner.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    log: LogConfig,
}

impl Executor {
    pub fn new(log: LogConfig) -> Self {
        Self { log }
    }

    /// Run a batch. Statements before the init sentinel are bootstrap: their
    /// rows are discarded and the side channel is not checked after them.
    pub async fn run(&self, conn: &mut SqliteConnection, batch: &str) -> ShimResult<BatchOutput> {
        let mut statements = split_sql(batch);
        let start_idx = match statements.iter().position(Statement::is_init_complete) {
            Some(idx) => {
                statements.remove(idx);
                idx
            }
            None => 0,
        };

        let mut output = BatchOutput::default();
        for (idx, stmt) in statements.iter().enumerate() {
            self.run_statement(conn, stmt, idx >= start_idx, &mut output)
                .await
                .inspect_err(|e| self.log_failure(&stmt.sql, e))?;
        }

        post_process(&mut output.results);
        Ok(output)
    }

    async fn run_statement(
        &self,
        conn: &mut SqliteConnection,
        stmt: &Statement,
        checked: bool,
        output: &mut BatchOutput,
    ) -> ShimResult<()> {
        self.log_raw_sql(&stmt.sql);
        let rows = sqlx::query(&stmt.sql)
            .persistent(false)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ShimError::statement(&stmt.sql, e))?;
        if !checked {
            return Ok(());
        }
        if stmt.returns_rows() && (!rows.is_empty() || stmt.kind != StatementKind::Pragma) {
            output.results.push(rows.iter().map(row_to_map).collect());
        }

        let drained = meta::drain(conn).await?;
        if let Some(message) = drained.message {
            self.log_message(&message);
            output.messages.push(message);
        }
        if let Some((code, message)) = drained.error {
            return Err(ShimError::SideChannel {
                code,
                message,
                statement: stmt.sql.clone(),
            });
        }
        if !drained.jsexec.trim().is_empty() {
            let commands = parse_queue(&drained.jsexec)?;
            debug!(target: "sqlshim::engine", "running {} queued side-effect command(s)", commands.len());
            SideEffectProcessor::new(conn).run_all(&commands).await?;
            meta::clear_jsexec(conn).await?;
        }
        Ok(())
    }

    fn log_raw_sql(&self, sql: &str) {
        if self.log.raw_sql {
            debug!(target: "sqlshim::raw_sql", "{}", sql);
        }
    }

    fn log_message(&self, message: &DbMessage) {
        match message.severity {
            Severity::Notice if self.log.notices => {
                info!(target: "sqlshim::engine", "NOTICE: {}", message.message)
            }
            Severity::Warning if self.log.warnings => {
                warn!(target: "sqlshim::engine", "WARNING: {}", message.message)
            }
            _ => {}
        }
    }

    fn log_failure(&self, sql: &str, err: &ShimError) {
        if self.log.error_sql_state {
            error!(target: "sqlshim::engine", "SQL Error: {} :: {}", sql, err);
        }
    }
}

/// Convert a SQLite row into a JSON map keyed by column name.
pub fn row_to_map(row: &SqliteRow) -> DbRow {
    let mut map = DbRow::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match row.try_get_raw(i) {
            Ok(raw) if !raw.is_null() => match raw.type_info().name() {
                "INTEGER" => row
                    .try_get_unchecked::<i64, _>(i)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                "REAL" => row
                    .try_get_unchecked::<f64, _>(i)
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => row
                    .try_get_unchecked::<Vec<u8>, _>(i)
                    .map(|bytes| Value::String(to_hex(&bytes)))
                    .unwrap_or(Value::Null),
                _ => row
                    .try_get_unchecked::<String, _>(i)
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            },
            _ => Value::Null,
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

fn json_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => text_as_bool(s),
        _ => false,
    }
}

/// Replace `<col>__cast_as_boolean` columns with a boolean `<col>`.
pub fn post_process(results: &mut [Recordset]) {
    for row in results.iter_mut().flatten() {
        if !row.keys().any(|k| k.ends_with(BOOLEAN_CAST_SUFFIX)) {
            continue;
        }
        let mut casts = Vec::new();
        let mut rebuilt = DbRow::new();
        for (key, value) in std::mem::take(row) {
            match key.strip_suffix(BOOLEAN_CAST_SUFFIX) {
                Some(base) => casts.push((base.to_string(), json_as_bool(&value))),
                None => {
                    rebuilt.insert(key, value);
                }
            }
        }
        for (base, flag) in casts {
            rebuilt.insert(base, Value::Bool(flag));
        }
        *row = rebuilt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> DbRow {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_post_process_boolean_cast() {
        let mut results = vec![vec![row(json!({
            "id": 1,
            "active__cast_as_boolean": "1",
            "locked__cast_as_boolean": 0,
        }))]];
        post_process(&mut results);
        assert_eq!(
            Value::Object(results[0][0].clone()),
            json!({"id": 1, "active": true, "locked": false})
        );
        let keys: Vec<&String> = results[0][0].keys().collect();
        assert_eq!(keys, vec!["id", "active", "locked"]);
    }

    #[test]
    fn test_post_process_leaves_plain_rows() {
        let mut results = vec![vec![row(json!({"a": "x"}))], vec![]];
        post_process(&mut results);
        assert_eq!(Value::Object(results[0][0].clone()), json!({"a": "x"}));
    }
}
