//! Database driver.
//!
//! Entry points used by the data-access layer: one-shot executions shaped by a
//! [`ReturnShape`], and transactions that pin one pooled connection for the
//! lifetime of a task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use crate::config::{DbTarget, DriverConfig};
use crate::engine::{BatchOutput, DbRow, Executor, Recordset};
use crate::error::{ShimError, ShimResult};
use crate::meta::{self, Severity};
use crate::params::{SqlParams, apply_params};
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};

/// How the caller wants results back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    /// First row of the first result set.
    Row,
    /// First result set.
    Recordset,
    /// Every result set.
    MultiRecordset,
    /// Last column of the first row of the first result set.
    Scalar,
}

impl std::str::FromStr for ReturnShape {
    type Err = ShimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "row" => Ok(ReturnShape::Row),
            "recordset" => Ok(ReturnShape::Recordset),
            "multirecordset" => Ok(ReturnShape::MultiRecordset),
            "scalar" => Ok(ReturnShape::Scalar),
            other => Err(ShimError::Config(format!("unknown return shape: {other}"))),
        }
    }
}

/// A shaped execution result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Row(Option<DbRow>),
    Recordset(Option<Recordset>),
    MultiRecordset(Vec<Recordset>),
    Scalar(Option<Value>),
}

impl QueryResult {
    fn shape(shape: ReturnShape, results: Vec<Recordset>) -> Self {
        let mut results = results.into_iter();
        match shape {
            ReturnShape::Row => {
                QueryResult::Row(results.next().and_then(|rs| rs.into_iter().next()))
            }
            ReturnShape::Recordset => QueryResult::Recordset(results.next()),
            ReturnShape::MultiRecordset => QueryResult::MultiRecordset(results.collect()),
            ReturnShape::Scalar => QueryResult::Scalar(
                results
                    .next()
                    .and_then(|rs| rs.into_iter().next())
                    .and_then(|row| row.into_iter().last().map(|(_, v)| v)),
            ),
        }
    }

    /// The scalar value, when this is a scalar result.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            QueryResult::Scalar(value) => value.as_ref(),
            _ => None,
        }
    }

    pub fn as_row(&self) -> Option<&DbRow> {
        match self {
            QueryResult::Row(row) => row.as_ref(),
            _ => None,
        }
    }

    pub fn as_recordset(&self) -> Option<&Recordset> {
        match self {
            QueryResult::Recordset(rs) => rs.as_ref(),
            _ => None,
        }
    }

    pub fn as_recordsets(&self) -> Option<&[Recordset]> {
        match self {
            QueryResult::MultiRecordset(sets) => Some(sets),
            _ => None,
        }
    }
}

/// Result of one execution, with the notices and warnings it raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecOutput {
    pub result: QueryResult,
    pub notices: Vec<String>,
    pub warnings: Vec<String>,
}

impl ExecOutput {
    fn new(shape: ReturnShape, batch: BatchOutput) -> Self {
        let (warnings, notices): (Vec<_>, Vec<_>) = batch
            .messages
            .into_iter()
            .partition(|m| m.severity == Severity::Warning);
        Self {
            result: QueryResult::shape(shape, batch.results),
            notices: notices.into_iter().map(|m| m.message).collect(),
            warnings: warnings.into_iter().map(|m| m.message).collect(),
        }
    }
}

/// Future returned by a transaction task.
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = ShimResult<T>> + Send + 't>>;

/// Execution settings shared by the driver and its transactions.
#[derive(Debug, Clone)]
struct Session {
    executor: Executor,
}

impl Session {
    async fn execute(
        &self,
        conn: &mut SqliteConnection,
        presql: &str,
        context: Option<&str>,
        shape: ReturnShape,
        sql: &str,
        params: &SqlParams,
    ) -> ShimResult<ExecOutput> {
        let batch = format!("{presql}{}{sql}", meta::context_sql(context));
        let batch = apply_params(&batch, params);
        let output = self.executor.run(conn, &batch).await?;
        let output = ExecOutput::new(shape, output);
        debug!(
            target: "sqlshim::driver",
            notices = output.notices.len(),
            warnings = output.warnings.len(),
            "executed batch"
        );
        Ok(output)
    }
}

/// An open transaction on one target.
pub struct Transaction {
    conn: PooledConnection,
    target: DbTarget,
    session: Session,
}

impl Transaction {
    pub fn target(&self) -> &DbTarget {
        &self.target
    }

    /// Run `sql` inside the transaction.
    pub async fn execute(
        &mut self,
        context: Option<&str>,
        shape: ReturnShape,
        sql: &str,
        params: &SqlParams,
    ) -> ShimResult<ExecOutput> {
        self.session
            .execute(&mut self.conn, "", context, shape, sql, params)
            .await
    }

    async fn finish(&mut self, sql: &str) -> ShimResult<BatchOutput> {
        self.session.executor.run(&mut self.conn, sql).await
    }
}

/// SQLite driver: a connection pool plus the execution pipeline.
#[derive(Clone)]
pub struct Driver {
    pool: ConnectionPool,
    session: Arc<Session>,
    config: Arc<DriverConfig>,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new(DriverConfig::default())
    }
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            pool: ConnectionPool::new(config.idle_timeout()),
            session: Arc::new(Session {
                executor: Executor::new(config.log.clone()),
            }),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn presql(target: &DbTarget) -> String {
        let mut presql = meta::init_sql();
        if let Some(extra) = &target.presql {
            presql.push_str(extra);
            if !extra.trim_end().ends_with(';') {
                presql.push(';');
            }
            presql.push('\n');
        }
        presql
    }

    /// Execute `sql` against `target`, or inside `tx` when one is given.
    pub async fn execute(
        &self,
        tx: Option<&mut Transaction>,
        target: &DbTarget,
        context: Option<&str>,
        shape: ReturnShape,
        sql: &str,
        params: &SqlParams,
    ) -> ShimResult<ExecOutput> {
        if let Some(tx) = tx {
            if tx.target != *target {
                return Err(ShimError::TransactionSpansConnections);
            }
            return tx.execute(context, shape, sql, params).await;
        }
        let mut conn = self.pool.acquire(&target.database).await?;
        self.session
            .execute(&mut conn, &Self::presql(target), context, shape, sql, params)
            .await
    }

    /// Execute against a target named in the configuration.
    pub async fn execute_named(
        &self,
        name: &str,
        context: Option<&str>,
        shape: ReturnShape,
        sql: &str,
        params: &SqlParams,
    ) -> ShimResult<ExecOutput> {
        let target = self.config.target(name)?.clone();
        self.execute(None, &target, context, shape, sql, params).await
    }

    /// Run `task` inside a transaction: committed when it succeeds, rolled back
    /// when it fails.
    ///
    /// ```ignore
    /// let count = driver
    ///     .execute_transaction(&target, |tx| {
    ///         Box::pin(async move {
    ///             tx.execute(None, ReturnShape::Scalar, "select count(*) from t", &SqlParams::new())
    ///                 .await
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute_transaction<T, F>(&self, target: &DbTarget, task: F) -> ShimResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> TxFuture<'t, T>,
    {
        let mut conn = self.pool.acquire(&target.database).await?;
        let begin = format!("{}begin transaction", Self::presql(target));
        self.session.executor.run(&mut conn, &begin).await?;

        let mut tx = Transaction {
            conn,
            target: target.clone(),
            session: Session::clone(&self.session),
        };
        match task(&mut tx).await {
            Ok(value) => {
                tx.finish("commit transaction").await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.finish("rollback transaction").await {
                    warn!(target: "sqlshim::driver", "rollback failed: {}", rollback);
                }
                Err(err)
            }
        }
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
