//! Idempotent seed inserts and data-file markers.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use super::{SchemaObject, SeedRow};
use crate::engine::Recordset;
use crate::error::{ShimError, ShimResult};
use crate::meta::META_TABLE;
use crate::splitter::escape;

/// Seed row key listing data files to copy.
pub const FILES_KEY: &str = "_FILES";

const COPY_FILE_PREFIX: &str = "%%%copy_file:";
const COPY_FILE_SUFFIX: &str = "%%%";

/// Render a seed value as a SQL literal.
fn seed_literal(obj: &SchemaObject, column: &str, value: &Value) -> ShimResult<String> {
    match value {
        Value::Null => Ok("null".to_string()),
        Value::String(s) => Ok(format!("'{}'", escape(s))),
        Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Ok(escape(&n.to_string())),
        Value::Object(map) => match map.get("sql") {
            Some(Value::String(sql)) => Ok(sql.clone()),
            Some(Value::Array(lines)) => Ok(lines
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n")),
            _ => Err(unsupported(obj, column, value)),
        },
        Value::Array(_) => Err(unsupported(obj, column, value)),
    }
}

fn unsupported(obj: &SchemaObject, column: &str, value: &Value) -> ShimError {
    ShimError::UnsupportedSeedValue {
        object: obj.name.clone(),
        column: column.to_string(),
        value: value.to_string(),
    }
}

/// `k=v`, or `k is null` for a null key.
fn key_match(obj: &SchemaObject, key: &str, value: Option<&Value>) -> ShimResult<String> {
    match value {
        None | Some(Value::Null) => Ok(format!("{key} is null")),
        Some(value) => Ok(format!("{key}={}", seed_literal(obj, key, value)?)),
    }
}

fn multiline_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Unexpanded SQL for one seed row.
pub fn row_insert_sql(obj: &SchemaObject, row: &SeedRow, data_dir: &Path) -> ShimResult<String> {
    let files = match row.get(FILES_KEY) {
        Some(Value::Object(files)) => files.clone(),
        _ => Map::new(),
    };
    let row: SeedRow = row
        .iter()
        .filter(|(key, _)| key.as_str() != FILES_KEY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let mut sql = String::new();
    let mut has_insert = false;
    if row.len() == 1 && row.contains_key("sql") {
        let stmt = multiline_text(&row["sql"]);
        sql.push_str(stmt.trim());
        if !sql.ends_with(';') {
            sql.push(';');
        }
        sql.push('\n');
    } else if !row.is_empty() {
        has_insert = true;
        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let values = row
            .iter()
            .map(|(col, val)| seed_literal(obj, col, val))
            .collect::<ShimResult<Vec<_>>>()?;
        let keys: Vec<String> = match &obj.data_keys {
            Some(keys) => keys.clone(),
            None => row.keys().cloned().collect(),
        };
        let conditions = keys
            .iter()
            .map(|key| key_match(obj, key, row.get(key)))
            .collect::<ShimResult<Vec<_>>>()?;
        sql.push_str(&format!(
            "insert into {name}({cols}) select {vals} where not exists (select * from {name} where {cond});\n",
            name = obj.name,
            cols = columns.join(","),
            vals = values.join(","),
            cond = conditions.join(" and "),
        ));
    }

    let data_files = obj
        .path
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new(""))
        .join("data_files");
    for (src, dst) in &files {
        let dst = multiline_text(dst);
        let source = escape(&data_files.join(src).to_string_lossy());
        let dest = escape(&data_dir.join(&dst).to_string_lossy())
            .replace("{{", "'||")
            .replace("}}", "||'");
        if has_insert {
            sql.push_str(&format!(
                "select '{COPY_FILE_PREFIX}{source}>{dest}{COPY_FILE_SUFFIX}' from {name} where rowid=(select ifnull(last_insert_rowid_override,last_insert_rowid()) from {META_TABLE});\n",
                name = obj.name,
            ));
        } else {
            sql.push_str(&format!(
                "select '{COPY_FILE_PREFIX}{source}>{dest}{COPY_FILE_SUFFIX}';\n"
            ));
        }
    }
    Ok(sql)
}

/// A request, returned as a result value, to copy a data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFileMarker {
    pub source: PathBuf,
    pub dest: PathBuf,
}

impl CopyFileMarker {
    /// Recognize `%%%copy_file:SRC>DST%%%`.
    pub fn parse(text: &str) -> Option<Self> {
        let inner = text
            .trim()
            .strip_prefix(COPY_FILE_PREFIX)?
            .strip_suffix(COPY_FILE_SUFFIX)?;
        let (source, dest) = inner.split_once('>')?;
        if source.is_empty() || dest.is_empty() {
            return None;
        }
        Some(Self {
            source: PathBuf::from(source),
            dest: PathBuf::from(dest),
        })
    }

    /// Every marker found in string values of `results`.
    pub fn collect(results: &[Recordset]) -> Vec<Self> {
        results
            .iter()
            .flatten()
            .flat_map(|row| row.values())
            .filter_map(Value::as_str)
            .filter_map(Self::parse)
            .collect()
    }

    /// Copy the file, creating the destination directory when needed.
    pub fn copy(&self) -> ShimResult<u64> {
        if let Some(parent) = self.dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(target: "sqlshim::schema", "copy {} > {}", self.source.display(), self.dest.display());
        Ok(std::fs::copy(&self.source, &self.dest)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(json: &str) -> SchemaObject {
        SchemaObject::from_json(json).unwrap()
    }

    fn row(value: Value) -> SeedRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_insert_keyed_by_all_columns() {
        let obj = object(r#"{"name": "cust", "type": "table"}"#);
        let sql = row_insert_sql(
            &obj,
            &row(json!({"cust_name": "O'Neil", "cust_sts": true, "cust_note": null})),
            Path::new(""),
        )
        .unwrap();
        assert_eq!(
            sql,
            "insert into cust(cust_name,cust_sts,cust_note) select 'O''Neil',1,null where not exists (select * from cust where cust_name='O''Neil' and cust_sts=1 and cust_note is null);\n"
        );
    }

    #[test]
    fn test_insert_keyed_by_data_keys() {
        let obj = object(r#"{"name": "t", "type": "table", "data_keys": ["code"]}"#);
        let sql = row_insert_sql(
            &obj,
            &row(json!({"code": 7, "created": {"sql": "datetime('now')"}})),
            Path::new(""),
        )
        .unwrap();
        assert_eq!(
            sql,
            "insert into t(code,created) select 7,datetime('now') where not exists (select * from t where code=7);\n"
        );
    }

    #[test]
    fn test_sql_only_row() {
        let obj = object(r#"{"name": "t", "type": "table"}"#);
        let sql = row_insert_sql(&obj, &row(json!({"sql": ["update t", "set a=1 "]})), Path::new("")).unwrap();
        assert_eq!(sql, "update t\nset a=1;\n");
    }

    #[test]
    fn test_unsupported_value() {
        let obj = object(r#"{"name": "t", "type": "table"}"#);
        let err = row_insert_sql(&obj, &row(json!({"a": [1, 2]})), Path::new("")).unwrap_err();
        assert!(matches!(err, ShimError::UnsupportedSeedValue { .. }));
    }

    #[test]
    fn test_file_markers() {
        let obj = object(r#"{"name": "doc", "type": "table", "path": "/app/models/doc.json"}"#);
        let sql = row_insert_sql(
            &obj,
            &row(json!({"doc_name": "a", "_FILES": {"a.pdf": "doc/{{doc_id}}.pdf"}})),
            Path::new("/data"),
        )
        .unwrap();
        assert!(sql.ends_with(
            "select '%%%copy_file:/app/models/data_files/a.pdf>/data/doc/'||doc_id||'.pdf%%%' from doc where rowid=(select ifnull(last_insert_rowid_override,last_insert_rowid()) from shim_meta);\n"
        ));

        let files_only = row_insert_sql(
            &obj,
            &row(json!({"_FILES": {"b.png": "img/b.png"}})),
            Path::new("/data"),
        )
        .unwrap();
        assert_eq!(
            files_only,
            "select '%%%copy_file:/app/models/data_files/b.png>/data/img/b.png%%%';\n"
        );
    }

    #[test]
    fn test_copy_file_marker_parse() {
        assert_eq!(
            CopyFileMarker::parse("%%%copy_file:/a/b.pdf>/data/7.pdf%%%"),
            Some(CopyFileMarker {
                source: PathBuf::from("/a/b.pdf"),
                dest: PathBuf::from("/data/7.pdf"),
            })
        );
        assert_eq!(CopyFileMarker::parse("plain text"), None);
        assert_eq!(CopyFileMarker::parse("%%%copy_file:>x%%%"), None);
    }

    #[test]
    fn test_copy_file_marker_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        std::fs::write(&source, "hello").unwrap();
        let marker = CopyFileMarker {
            source,
            dest: dir.path().join("nested").join("dst.txt"),
        };
        assert_eq!(marker.copy().unwrap(), 5);
        assert_eq!(std::fs::read_to_string(&marker.dest).unwrap(), "hello");
    }
}
