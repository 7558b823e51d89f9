//! Side-effect commands queued by trigger logic.
//!
//! Triggers append JSON objects to `shim_meta.jsexec`:
//!
//! ```text
//! {"function":"sha256","table":"users","rowid":7,"source":"user_id||user_pw","dest":"user_hash"},
//! {"function":"soundex","source":"(select name from c where id=7)","dest":"insert into sdx(code) values(%%%SOUNDEX%%%)"},
//! {"function":"exec","sql":"update users set user_pw=null where rowid=7"},
//! ```
//!
//! The payload is validated into [`SideEffectCommand`]s before anything runs.

use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteConnection, ValueRef};
use tracing::debug;

use crate::error::{ShimError, ShimResult};
use crate::params::{DbType, DbValue, render};
use crate::splitter::split_sql;

/// Placeholder replaced by the computed code in a soundex `dest` statement.
pub const SOUNDEX_PLACEHOLDER: &str = "%%%SOUNDEX%%%";

const SALT_CHARS: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*()_+-=][}{|~,.<>?";
const SALT_LEN: usize = 256;
const MAX_HASH_ATTEMPTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(HashAlgorithm::Sha1),
            "sha256" => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Where a hash command takes its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashSource {
    /// Scalar expression evaluated against the target row.
    Expr(String),
    /// Random salt, retried until the hash is unique in `dest`.
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCommand {
    pub algorithm: HashAlgorithm,
    pub table: String,
    pub rowid: i64,
    pub source: HashSource,
    pub dest: String,
    /// Truncate the digest to this many bytes.
    pub substring: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffectCommand {
    Hash(HashCommand),
    Soundex { source: String, dest: String },
    Exec { sql: String },
}

/// Loose wire shape; every field is checked in [`SideEffectCommand::from_json`].
#[derive(Debug, Default, Deserialize)]
struct RawCommand {
    function: Option<String>,
    algorithm: Option<String>,
    table: Option<String>,
    rowid: Option<Value>,
    source: Option<String>,
    random: Option<Value>,
    dest: Option<String>,
    substring: Option<Value>,
    sql: Option<String>,
}

fn truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl SideEffectCommand {
    /// Validate one queued command object.
    pub fn from_json(value: &Value) -> ShimResult<Self> {
        let payload = value.to_string();
        let raw: RawCommand = serde_json::from_value(value.clone())
            .map_err(|_| ShimError::JsexecParse(payload.clone()))?;
        let function = non_empty(raw.function.clone())
            .ok_or_else(|| ShimError::JsexecMissingFunction(payload.clone()))?;

        match function.as_str() {
            "hash" | "sha1" | "sha256" => {
                let algorithm_name = if function == "hash" {
                    raw.algorithm.as_deref().unwrap_or("sha1")
                } else {
                    function.as_str()
                };
                let algorithm = HashAlgorithm::from_name(algorithm_name)
                    .ok_or_else(|| ShimError::JsexecInvalidFunction(payload.clone()))?;
                let table = non_empty(raw.table)
                    .ok_or_else(|| ShimError::missing_param("table", &payload))?;
                let rowid = raw
                    .rowid
                    .as_ref()
                    .and_then(as_integer)
                    .ok_or_else(|| ShimError::missing_param("rowid", &payload))?;
                let source = if truthy(&raw.random) {
                    HashSource::Random
                } else {
                    HashSource::Expr(
                        non_empty(raw.source)
                            .ok_or_else(|| ShimError::missing_param("source", &payload))?,
                    )
                };
                let dest = non_empty(raw.dest)
                    .ok_or_else(|| ShimError::missing_param("dest", &payload))?;
                let substring = raw
                    .substring
                    .as_ref()
                    .and_then(as_integer)
                    .filter(|n| *n > 0)
                    .map(|n| n as usize);
                Ok(SideEffectCommand::Hash(HashCommand {
                    algorithm,
                    table,
                    rowid,
                    source,
                    dest,
                    substring,
                }))
            }
            "soundex" => Ok(SideEffectCommand::Soundex {
                source: non_empty(raw.source)
                    .ok_or_else(|| ShimError::missing_param("source", &payload))?,
                dest: non_empty(raw.dest)
                    .ok_or_else(|| ShimError::missing_param("dest", &payload))?,
            }),
            "exec" => Ok(SideEffectCommand::Exec {
                sql: non_empty(raw.sql).ok_or_else(|| ShimError::missing_param("sql", &payload))?,
            }),
            _ => Err(ShimError::JsexecInvalidFunction(payload)),
        }
    }
}

/// Parse the `jsexec` column: comma-separated objects, trailing comma allowed.
pub fn parse_queue(jsexec: &str) -> ShimResult<Vec<SideEffectCommand>> {
    let mut payload = jsexec.trim();
    if let Some(stripped) = payload.strip_suffix(',') {
        payload = stripped;
    }
    let wrapped = format!("[{}]", payload);
    let values: Vec<Value> =
        serde_json::from_str(&wrapped).map_err(|_| ShimError::JsexecParse(wrapped.clone()))?;
    values
        .iter()
        .filter(|v| !v.is_null())
        .map(SideEffectCommand::from_json)
        .collect()
}

/// American Soundex code (`Robert` → `R163`). Empty when the input has no
/// ASCII letters.
pub fn soundex(input: &str) -> String {
    fn digit(c: u8) -> u8 {
        match c {
            b'B' | b'F' | b'P' | b'V' => b'1',
            b'C' | b'G' | b'J' | b'K' | b'Q' | b'S' | b'X' | b'Z' => b'2',
            b'D' | b'T' => b'3',
            b'L' => b'4',
            b'M' | b'N' => b'5',
            b'R' => b'6',
            b'H' | b'W' => b'-',
            _ => b'0',
        }
    }

    let letters: Vec<u8> = input
        .bytes()
        .filter(u8::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let Some(&first) = letters.first() else {
        return String::new();
    };

    let mut code = vec![first];
    let mut last = digit(first);
    for &c in &letters[1..] {
        let d = digit(c);
        match d {
            // H and W do not separate letters with the same code.
            b'-' => continue,
            b'0' => last = b'0',
            _ if d != last => {
                code.push(d);
                last = d;
            }
            _ => {}
        }
        if code.len() == 4 {
            break;
        }
    }
    while code.len() < 4 {
        code.push(b'0');
    }
    String::from_utf8_lossy(&code).into_owned()
}

fn random_salt() -> String {
    let mut rng = rand::rng();
    (0..SALT_LEN)
        .map(|_| SALT_CHARS[rng.random_range(0..SALT_CHARS.len())] as char)
        .collect()
}

/// Bytes hashed for a source value, following SQLite's text conversion.
fn value_bytes(row: &sqlx::sqlite::SqliteRow) -> ShimResult<Vec<u8>> {
    let raw = row.try_get_raw(0)?;
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let bytes = if raw.type_info().to_string() == "BLOB" {
        row.try_get_unchecked::<Vec<u8>, _>(0)?
    } else {
        row.try_get_unchecked::<String, _>(0)?.into_bytes()
    };
    Ok(bytes)
}

/// Runs queued side-effect commands against a connection.
pub struct SideEffectProcessor<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> SideEffectProcessor<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Run every command in queue order, stopping at the first failure.
    pub async fn run_all(&mut self, commands: &[SideEffectCommand]) -> ShimResult<()> {
        for command in commands {
            self.run(command).await?;
        }
        Ok(())
    }

    pub async fn run(&mut self, command: &SideEffectCommand) -> ShimResult<()> {
        match command {
            SideEffectCommand::Hash(hash) => self.hash(hash).await,
            SideEffectCommand::Soundex { source, dest } => self.soundex(source, dest).await,
            SideEffectCommand::Exec { sql } => self.exec(sql).await,
        }
    }

    async fn fetch(&mut self, sql: &str) -> ShimResult<Vec<sqlx::sqlite::SqliteRow>> {
        debug!(target: "sqlshim::jsexec", "{}", sql);
        sqlx::query(sql)
            .persistent(false)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| ShimError::statement(sql, e))
    }

    async fn hash(&mut self, cmd: &HashCommand) -> ShimResult<()> {
        let digest = |seed: &[u8]| {
            let mut hash = cmd.algorithm.digest(seed);
            if let Some(len) = cmd.substring {
                hash.truncate(len);
            }
            hash
        };
        let rowid = render(&DbType::BigInt, &DbValue::Int(cmd.rowid));

        let hash = match &cmd.source {
            HashSource::Expr(source) => {
                let sql = format!(
                    "select ({}) as hash from {} where rowid={}",
                    source, cmd.table, rowid
                );
                let rows = self.fetch(&sql).await?;
                let row = rows.first().ok_or(ShimError::JsexecNoResults("hash"))?;
                digest(&value_bytes(row)?)
            }
            HashSource::Random => {
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    if attempts > MAX_HASH_ATTEMPTS {
                        return Err(ShimError::HashRetriesExhausted {
                            table: cmd.table.clone(),
                            dest: cmd.dest.clone(),
                            attempts: MAX_HASH_ATTEMPTS,
                        });
                    }
                    let candidate = digest(random_salt().as_bytes());
                    let sql = format!(
                        "select ({dest}) as hash from {table} where {dest}={value}",
                        dest = cmd.dest,
                        table = cmd.table,
                        value = render(&DbType::varbinary_max(), &DbValue::Bytes(candidate.clone())),
                    );
                    if self.fetch(&sql).await?.is_empty() {
                        break candidate;
                    }
                }
            }
        };

        let sql = format!(
            "update {} set {}={} where rowid={}",
            cmd.table,
            cmd.dest,
            render(&DbType::varbinary_max(), &DbValue::Bytes(hash)),
            rowid
        );
        self.fetch(&sql).await?;
        Ok(())
    }

    async fn soundex(&mut self, source: &str, dest: &str) -> ShimResult<()> {
        let rows = self.fetch(&format!("select ({}) as soundex", source)).await?;
        let row = rows.first().ok_or(ShimError::JsexecNoResults("soundex"))?;
        let text = String::from_utf8_lossy(&value_bytes(row)?).into_owned();
        let code = soundex(&text);
        let sql = dest.replace(
            SOUNDEX_PLACEHOLDER,
            &render(&DbType::varchar_max(), &DbValue::Text(code)),
        );
        self.fetch(&sql).await?;
        Ok(())
    }

    async fn exec(&mut self, sql: &str) -> ShimResult<()> {
        for stmt in split_sql(sql) {
            self.fetch(&stmt.sql).await?;
        }
        Ok(())
    }
}
