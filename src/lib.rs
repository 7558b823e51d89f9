//! # sqlshim
//!
//! A SQLite compatibility layer for applications written against a
//! server-class database.
//!
//! SQLite has no way for a trigger to hand a message back to the caller, so
//! trigger logic writes into a single-row side-channel table (`shim_meta`)
//! instead. After every statement the engine drains that row: notices and
//! warnings are collected, an error code aborts the batch, and queued
//! side-effect commands (hashing, soundex, follow-up SQL) run on the same
//! connection.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use sqlshim::prelude::*;
//!
//! let driver = Driver::new(DriverConfig::default());
//! let target = DbTarget::new("app.db");
//! let params = SqlParams::new().bind("name", "Ada");
//!
//! let out = driver
//!     .execute(None, &target, None, ReturnShape::Scalar,
//!              "select count(*) from cust where cust_name=@name;", &params)
//!     .await?;
//! ```
//!
//! ## Text conventions
//!
//! | Marker                        | Meaning                                  |
//! |-------------------------------|------------------------------------------|
//! | `\;`                          | Literal semicolon inside a statement     |
//! | `%%%INITCOMPLETE%%%`          | End of the bootstrap section of a batch  |
//! | `%%%JSEXEC_ESCAPE(expr)%%%`   | Expression escaped for a string literal  |
//! | `%%%copy_file:SRC>DST%%%`     | Data file copy request in a result row   |
//! | `%%%SOUNDEX%%%`               | Soundex code in a queued `dest` statement |
//! | `@name`                       | Named parameter                          |

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod jsexec;
pub mod meta;
pub mod params;
pub mod pool;
pub mod schema;
pub mod splitter;

pub mod prelude {
    pub use crate::config::{DbTarget, DriverConfig, LogConfig};
    pub use crate::driver::{Driver, ExecOutput, QueryResult, ReturnShape, Transaction};
    pub use crate::engine::{BatchOutput, DbRow, Executor, Recordset};
    pub use crate::error::{ShimError, ShimResult};
    pub use crate::meta::{DbMessage, Severity};
    pub use crate::params::{DateParam, DbType, DbValue, SqlParams};
    pub use crate::pool::{ConnectionPool, PooledConnection};
    pub use crate::schema::{CompilerConfig, CopyFileMarker, SchemaCompiler, SchemaObject};
    pub use crate::splitter::{Statement, split_sql};
}

/// Split a SQL blob into executable statements.
///
/// # Example
///
/// ```
/// let stmts = sqlshim::split_sql("insert into t values('a\\;b');select 1;");
/// assert_eq!(stmts.len(), 2);
/// assert_eq!(stmts[0].sql, "insert into t values('a;b')");
/// ```
pub fn split_sql(sql: &str) -> Vec<splitter::Statement> {
    splitter::split_sql(sql)
}
