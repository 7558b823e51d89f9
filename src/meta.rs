//! Side channel ("meta row").
//!
//! SQLite triggers cannot return messages to the caller, so trigger logic
//! writes them into a single row of `shim_meta` instead. After every statement
//! the executor calls [`drain`]: it reads the row, acknowledges notices and
//! warnings, and hands back a [`Drained`] describing what to do next.

use sqlx::{Row, SqliteConnection};
use tracing::debug;

use crate::error::{ShimError, ShimResult};
use crate::splitter::{INIT_COMPLETE, escape};

pub const META_TABLE: &str = "shim_meta";

/// Context recorded when the caller does not name one.
pub const DEFAULT_CONTEXT: &str = "USystem";

/// Context that leaves the stored context untouched.
const LOGIN_CONTEXT: &str = "login";

/// Run once when a connection is opened.
pub fn connect_sql() -> String {
    format!("drop table if exists {META_TABLE};")
}

/// Bootstrap prepended to every session; ends with the init sentinel.
pub fn init_sql() -> String {
    format!(
        "pragma foreign_keys = ON;\n\
         create table if not exists {META_TABLE} as select '{DEFAULT_CONTEXT}' context,0 errcode,'' errmsg,'' jsexec,null as audit_seq,0 extra_changes,null last_insert_rowid_override;\n\
         {INIT_COMPLETE};\n"
    )
}

/// Reset the meta row for a new logical execution.
pub fn context_sql(context: Option<&str>) -> String {
    let context = escape(context.unwrap_or(DEFAULT_CONTEXT));
    let track_context = context != LOGIN_CONTEXT;
    let mut sql = format!("update {META_TABLE} set errcode=0,errmsg=''");
    if track_context {
        sql.push_str(&format!(",context='{context}'"));
    }
    sql.push_str(
        ",jsexec='',audit_seq=null,extra_changes=0,last_insert_rowid_override=null where (errcode<>0) or (errmsg<>'')",
    );
    if track_context {
        sql.push_str(&format!(" or (context<>'{context}')"));
    }
    sql.push_str(
        " or (jsexec<>'') or (audit_seq is not null) or (extra_changes<>0) or (last_insert_rowid_override is not null);\n",
    );
    sql
}

/// Severity of a non-fatal message raised through the meta row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Notice,
    Warning,
}

impl Severity {
    pub fn code(self) -> i64 {
        match self {
            Severity::Notice => -1,
            Severity::Warning => -2,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Severity::Notice),
            -2 => Some(Severity::Warning),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Notice => write!(f, "NOTICE"),
            Severity::Warning => write!(f, "WARNING"),
        }
    }
}

/// A notice or warning returned alongside results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbMessage {
    pub severity: Severity,
    pub message: String,
}

/// The fields of the meta row the executor acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaRow {
    pub errcode: i64,
    pub errmsg: String,
    pub jsexec: String,
}

/// Outcome of draining the side channel after a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drained {
    pub message: Option<DbMessage>,
    /// Non-zero code other than a notice or warning.
    pub error: Option<(i64, String)>,
    /// Raw queued jsexec payload, empty when nothing is queued.
    pub jsexec: String,
}

impl MetaRow {
    pub fn classify(self) -> Drained {
        let mut drained = Drained {
            message: None,
            error: None,
            jsexec: self.jsexec,
        };
        if self.errcode != 0 {
            match Severity::from_code(self.errcode) {
                Some(severity) => {
                    drained.message = Some(DbMessage {
                        severity,
                        message: self.errmsg,
                    })
                }
                None => drained.error = Some((self.errcode, self.errmsg)),
            }
        }
        drained
    }
}

/// Read the meta row and acknowledge any notice or warning it carries.
pub async fn drain(conn: &mut SqliteConnection) -> ShimResult<Drained> {
    let sql = format!("select errcode, errmsg, jsexec from {META_TABLE}");
    let rows = sqlx::query(&sql)
        .persistent(false)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ShimError::statement(&sql, e))?;
    let row = rows.first().ok_or(ShimError::MetaMissing)?;

    let meta = MetaRow {
        errcode: row.try_get_unchecked::<Option<i64>, _>(0)?.unwrap_or(0),
        errmsg: row.try_get_unchecked::<Option<String>, _>(1)?.unwrap_or_default(),
        jsexec: row.try_get_unchecked::<Option<String>, _>(2)?.unwrap_or_default(),
    };
    let drained = meta.classify();

    if drained.message.is_some() {
        let ack = format!("update {META_TABLE} set errcode=0,errmsg='' where errcode in (-1,-2)");
        sqlx::query(&ack)
            .persistent(false)
            .execute(&mut *conn)
            .await
            .map_err(|e| ShimError::statement(&ack, e))?;
    }
    Ok(drained)
}

/// Clear the queued jsexec payload once every command has run.
pub async fn clear_jsexec(conn: &mut SqliteConnection) -> ShimResult<()> {
    let sql = format!("update {META_TABLE} set jsexec=''");
    debug!(target: "sqlshim::meta", "{}", sql);
    sqlx::query(&sql)
        .persistent(false)
        .execute(&mut *conn)
        .await
        .map_err(|e| ShimError::statement(&sql, e))?;
    Ok(())
}
