//! Schema objects and the SQLite schema compiler.
//!
//! Schema objects are declarative JSON descriptions of tables, views and code
//! tables. The compiler turns them into SQLite DDL, emulated triggers and
//! idempotent seed inserts.
//!
//! # Example
//! ```
//! use sqlshim::schema::{CompilerConfig, SchemaCompiler, SchemaObject};
//!
//! let obj: SchemaObject = serde_json::from_str(r#"{
//!     "name": "cust",
//!     "type": "table",
//!     "columns": [
//!         { "name": "cust_id", "type": "bigint", "key": true, "identity": true },
//!         { "name": "cust_name", "type": "varchar", "length": 50 }
//!     ]
//! }"#).unwrap();
//!
//! let sql = SchemaCompiler::new(CompilerConfig::default()).init(&obj).unwrap();
//! assert!(sql.starts_with("create table cust(\n"));
//! ```

pub mod compiler;
pub mod macros;
pub mod seed;
pub mod triggers;

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

pub use compiler::SchemaCompiler;
pub use macros::{MacroSet, SqlMacro};
pub use seed::CopyFileMarker;
pub use triggers::TriggerHook;

/// Text given either as one string or as a list of lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MultiLine {
    Text(String),
    Lines(Vec<String>),
}

impl MultiLine {
    pub fn to_text(&self) -> String {
        match self {
            MultiLine::Text(text) => text.clone(),
            MultiLine::Lines(lines) => lines.join("\n"),
        }
    }
}

impl From<&str> for MultiLine {
    fn from(text: &str) -> Self {
        MultiLine::Text(text.to_string())
    }
}

/// A value given either alone or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }
}

/// Kind of schema object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Table,
    View,
    Code,
    Code2,
    /// Object types this compiler has no DDL for.
    #[serde(other)]
    Other,
}

/// Caption: one string, or `[singular?, singular, plural]`-style lists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Caption {
    Text(String),
    List(Vec<Value>),
}

impl Caption {
    /// The plural form, used as a description.
    pub fn description(&self) -> String {
        let text = |v: &Value| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match self {
            Caption::Text(s) => s.clone(),
            Caption::List(items) => match items.len() {
                0 => String::new(),
                1 => text(&items[0]),
                2 => text(&items[1]),
                _ => text(&items[2]),
            },
        }
    }
}

/// Column default value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ColumnDefault {
    /// Computed by the insert hook.
    Sql { sql: MultiLine },
    Bool(bool),
    Number(Number),
    Text(String),
    Null,
}

/// A foreign key reference on a single column.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ForeignKeyTarget {
    Column(String),
    Reference {
        column: String,
        #[serde(default)]
        on_delete: Option<String>,
        #[serde(default)]
        on_update: Option<String>,
    },
}

impl ForeignKeyTarget {
    pub fn column(&self) -> &str {
        match self {
            ForeignKeyTarget::Column(column) | ForeignKeyTarget::Reference { column, .. } => column,
        }
    }

    pub fn on_delete(&self) -> Option<&str> {
        match self {
            ForeignKeyTarget::Reference { on_delete, .. } => on_delete.as_deref(),
            ForeignKeyTarget::Column(_) => None,
        }
    }

    pub fn on_update(&self) -> Option<&str> {
        match self {
            ForeignKeyTarget::Reference { on_update, .. } => on_update.as_deref(),
            ForeignKeyTarget::Column(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type", default)]
    pub typ: Option<String>,
    #[serde(default)]
    pub length: Option<Value>,
    #[serde(default)]
    pub key: bool,
    #[serde(default)]
    pub identity: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub null: bool,
    /// `None` when absent; `Some(ColumnDefault::Null)` for an explicit null.
    #[serde(default, deserialize_with = "present")]
    pub default: Option<ColumnDefault>,
    /// Referenced table name to target, in declaration order.
    #[serde(default, deserialize_with = "ordered_map")]
    pub foreignkey: Vec<(String, ForeignKeyTarget)>,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl ColumnDef {
    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

/// Table-level foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForeignKeyDef {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub foreign_table: Option<String>,
    #[serde(default)]
    pub foreign_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: Option<String>,
    #[serde(default)]
    pub on_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexDef {
    #[serde(default)]
    pub columns: Vec<String>,
}

/// One item of a trigger's `exec` list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ExecItem {
    Statement(String),
    Lines(Vec<String>),
}

/// User trigger logic attached to one or more hooks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TriggerDef {
    pub on: OneOrMany<String>,
    #[serde(default)]
    pub sql: Option<MultiLine>,
    #[serde(default)]
    pub exec: Option<OneOrMany<ExecItem>>,
}

impl TriggerDef {
    pub fn fires_on(&self, hook: TriggerHook) -> bool {
        self.on.as_slice().iter().any(|on| on == hook.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ViewColumn {
    pub name: String,
    #[serde(default)]
    pub sqlselect: Option<MultiLine>,
}

/// A source table of a view.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ViewTable {
    #[serde(default)]
    pub columns: Vec<ViewColumn>,
    #[serde(default)]
    pub join_type: Option<String>,
    #[serde(default, deserialize_with = "ordered_map")]
    pub join_columns: Vec<(String, String)>,
}

/// A seed row; `_FILES` maps data files to destinations.
pub type SeedRow = Map<String, Value>;

/// A declarative database object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchemaObject {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde(default)]
    pub caption: Option<Caption>,
    /// Source file of the object, used to locate its `data_files`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub foreignkeys: Vec<ForeignKeyDef>,
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
    #[serde(default)]
    pub index: Vec<IndexDef>,
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
    #[serde(default, deserialize_with = "ordered_map")]
    pub tables: Vec<(String, ViewTable)>,
    #[serde(rename = "where", default)]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub code_type: Option<String>,
    #[serde(default)]
    pub data_keys: Option<Vec<String>>,
    #[serde(default)]
    pub init: Vec<SeedRow>,
    #[serde(default)]
    pub init_data: Vec<SeedRow>,
    #[serde(default)]
    pub sample_data: Vec<SeedRow>,
}

impl SchemaObject {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Parse one object or an array of objects.
    pub fn list_from_json(json: &str) -> Result<Vec<Self>, serde_json::Error> {
        match serde_json::from_str::<OneOrMany<SchemaObject>>(json)? {
            OneOrMany::One(obj) => Ok(vec![obj]),
            OneOrMany::Many(objs) => Ok(objs),
        }
    }

    pub fn description(&self) -> String {
        self.caption
            .as_ref()
            .map(Caption::description)
            .unwrap_or_default()
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.key)
    }

    /// `(schema, name)` split at the first dot.
    pub fn split_name(&self) -> (&str, &str) {
        self.name.split_once('.').unwrap_or(("", self.name.as_str()))
    }
}

/// Registry tables that code objects register themselves in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryTables {
    pub code_sys: String,
    pub code_app: String,
    pub code2_sys: String,
    pub code2_app: String,
}

impl Default for RegistryTables {
    fn default() -> Self {
        Self {
            code_sys: "code_sys".to_string(),
            code_app: "code_app".to_string(),
            code2_sys: "code2_sys".to_string(),
            code2_app: "code2_app".to_string(),
        }
    }
}

/// Schema compiler settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Substituted for `{schema}`; empty drops `{schema}.` qualifiers.
    pub schema: String,
    /// Prefix for registry tables and registry creation macros.
    pub factory_schema: String,
    /// Base directory for seed file destinations.
    pub data_dir: PathBuf,
    pub registry: RegistryTables,
    pub macros: BTreeMap<String, SqlMacro>,
}

impl CompilerConfig {
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn factory_schema(mut self, schema: impl Into<String>) -> Self {
        self.factory_schema = schema.into();
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_macro(mut self, name: impl Into<String>, sql_macro: SqlMacro) -> Self {
        self.macros.insert(name.into(), sql_macro);
        self
    }
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Deserialize a JSON object into entries, keeping order and every key.
fn ordered_map<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct EntriesVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for EntriesVisitor<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::new();
            while let Some(entry) = map.next_entry::<String, V>()? {
                entries.push(entry);
            }
            Ok(entries)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_map(EntriesVisitor(PhantomData))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_column_default_forms() {
        let cols: Vec<ColumnDef> = serde_json::from_str(
            r#"[
                {"name": "a", "type": "int"},
                {"name": "b", "type": "int", "default": null},
                {"name": "c", "type": "varchar", "default": "x"},
                {"name": "d", "type": "boolean", "default": true},
                {"name": "e", "type": "datetime", "default": {"sql": "datetime('now')"}}
            ]"#,
        )
        .unwrap();
        assert_eq!(cols[0].default, None);
        assert_eq!(cols[1].default, Some(ColumnDefault::Null));
        assert_eq!(cols[2].default, Some(ColumnDefault::Text("x".into())));
        assert_eq!(cols[3].default, Some(ColumnDefault::Bool(true)));
        assert_eq!(
            cols[4].default,
            Some(ColumnDefault::Sql {
                sql: MultiLine::from("datetime('now')")
            })
        );
    }

    #[test]
    fn test_foreignkey_entries_keep_order() {
        let col: ColumnDef = serde_json::from_str(
            r#"{"name": "c", "type": "int", "foreignkey": {"t1": "id", "t2": {"column": "id", "on_delete": "cascade"}}}"#,
        )
        .unwrap();
        assert_eq!(col.foreignkey.len(), 2);
        assert_eq!(col.foreignkey[0].0, "t1");
        assert_eq!(col.foreignkey[1].1.on_delete(), Some("cascade"));
    }

    #[test]
    fn test_caption_description() {
        let desc = |json: &str| serde_json::from_str::<Caption>(json).unwrap().description();
        assert_eq!(desc(r#""Customer""#), "Customer");
        assert_eq!(desc(r#"["Customer"]"#), "Customer");
        assert_eq!(desc(r#"["Customer", "Customers"]"#), "Customers");
        assert_eq!(desc(r#"["", "Customer", "Customers"]"#), "Customers");
    }

    #[test]
    fn test_object_list() {
        let objs = SchemaObject::list_from_json(
            r#"[{"name": "a", "type": "table"}, {"name": "b", "type": "function"}]"#,
        )
        .unwrap();
        assert_eq!(objs[0].kind, ObjectKind::Table);
        assert_eq!(objs[1].kind, ObjectKind::Other);
        assert_eq!(SchemaObject::list_from_json(r#"{"name": "a", "type": "view"}"#).unwrap().len(), 1);
    }

    #[test]
    fn test_split_name() {
        let obj = SchemaObject::from_json(r#"{"name": "jsharmony.code_country", "type": "code"}"#).unwrap();
        assert_eq!(obj.split_name(), ("jsharmony", "code_country"));
    }
}
