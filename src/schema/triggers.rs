//! Emulated triggers.
//!
//! Each table or view gets at most one SQLite trigger per hook. The body is
//! assembled from column-derived logic (computed defaults, `prevent_update`)
//! followed by the user triggers registered for that hook.

use super::macros::SqlMacro;
use super::{ColumnDefault, ExecItem, ObjectKind, SchemaObject};
use crate::error::{ShimError, ShimResult};
use crate::splitter::escape;

/// A point in a row's lifecycle that trigger logic can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerHook {
    ValidateInsert,
    ValidateUpdate,
    Insert,
    Update,
    Delete,
}

impl TriggerHook {
    pub const ALL: [TriggerHook; 5] = [
        TriggerHook::ValidateInsert,
        TriggerHook::ValidateUpdate,
        TriggerHook::Insert,
        TriggerHook::Update,
        TriggerHook::Delete,
    ];

    /// Name used in a trigger definition's `on` list.
    pub fn name(self) -> &'static str {
        match self {
            TriggerHook::ValidateInsert => "validate_insert",
            TriggerHook::ValidateUpdate => "validate_update",
            TriggerHook::Insert => "insert",
            TriggerHook::Update => "update",
            TriggerHook::Delete => "delete",
        }
    }

    /// Trigger name suffix and timing clause, if this hook applies to `kind`.
    fn definition(self, kind: ObjectKind) -> Option<(&'static str, &'static str)> {
        match (kind, self) {
            (ObjectKind::Table, TriggerHook::ValidateInsert) => Some(("_before_insert", "before insert")),
            (ObjectKind::Table, TriggerHook::ValidateUpdate) => Some(("_before_update", "before update")),
            (ObjectKind::Table, TriggerHook::Insert) => Some(("_after_insert", "after insert")),
            (ObjectKind::Table, TriggerHook::Update) => Some(("_after_update", "after update")),
            (ObjectKind::Table, TriggerHook::Delete) => Some(("_before_delete", "before delete")),
            (ObjectKind::View, TriggerHook::Insert) => Some(("_insert", "instead of insert")),
            (ObjectKind::View, TriggerHook::Update) => Some(("_update", "instead of update")),
            (ObjectKind::View, TriggerHook::Delete) => Some(("_delete", "instead of delete")),
            _ => None,
        }
    }

    fn is_insert(self) -> bool {
        matches!(self, TriggerHook::Insert | TriggerHook::ValidateInsert)
    }
}

/// A trigger ready to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedTrigger {
    pub hook: TriggerHook,
    pub name: String,
    /// Unexpanded body.
    pub body: String,
    timing: &'static str,
    table: String,
}

impl EmulatedTrigger {
    pub fn create_sql(&self, body: &str) -> String {
        format!(
            "create trigger {} {} on {}\nbegin\n{}\nend;\n",
            self.name, self.timing, self.table, body
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("drop trigger if exists {};\n", self.name)
    }

    /// Macros bound to this trigger's object and hook.
    pub fn object_macros(&self) -> Vec<(&'static str, SqlMacro)> {
        let mut macros = vec![
            ("TABLENAME", SqlMacro::text(self.table.clone())),
            ("INSERTTABLEKEYJOIN", SqlMacro::text("rowid = new.rowid")),
            ("INSERTDELETEKEYJOIN", SqlMacro::text("rowid = new.rowid")),
        ];
        if self.hook.is_insert() {
            macros.push(("update", SqlMacro::func(&["COL"], "(1=1)")));
        }
        macros
    }
}

/// `<t1>.<k>=<t2>.<k>` for every key column.
pub fn key_join(obj: &SchemaObject, left: &str, right: &str) -> ShimResult<Vec<String>> {
    let join: Vec<String> = obj
        .key_columns()
        .map(|col| format!("{left}.{name}={right}.{name}", name = col.name))
        .collect();
    if join.is_empty() {
        return Err(ShimError::MissingPrimaryKey(obj.name.clone()));
    }
    Ok(join)
}

fn normalize_exec(item: &ExecItem) -> String {
    let mut sql = match item {
        ExecItem::Statement(sql) => sql.clone(),
        ExecItem::Lines(lines) => lines
            .iter()
            .map(|line| {
                let line = line.trim();
                match line.strip_suffix(';') {
                    Some(stmt) => format!("{stmt}\\; "),
                    None => format!("{line} "),
                }
            })
            .collect(),
    };
    sql = sql.trim().to_string();
    loop {
        if sql.ends_with("\\;") {
            sql.truncate(sql.len() - 2);
        } else if sql.ends_with(';') {
            sql.pop();
        } else {
            return sql.trim_end().to_string();
        }
    }
}

/// Unexpanded body for one hook; empty when the hook has no logic.
pub fn trigger_body(obj: &SchemaObject, hook: TriggerHook) -> ShimResult<String> {
    let mut sql = String::new();

    if hook == TriggerHook::Insert {
        for col in &obj.columns {
            if let Some(ColumnDefault::Sql { sql: default }) = &col.default {
                sql.push_str(&format!(
                    "update {table} set {col}={default} where {table}.{col} is null and {join}\\;\n",
                    table = obj.name,
                    col = col.name,
                    default = default.to_text(),
                    join = key_join(obj, &obj.name, "new")?.join(" and "),
                ));
            }
        }
    }

    if hook == TriggerHook::ValidateUpdate {
        for col in obj.columns.iter().filter(|c| c.has_action("prevent_update")) {
            sql.push_str(&format!(
                "select case when (update({col})) then raise(FAIL, 'Cannot update column {msg}') end\\;\n",
                col = col.name,
                msg = escape(&col.name),
            ));
        }
    }

    for trigger in obj.triggers.iter().filter(|t| t.fires_on(hook)) {
        if let Some(user_sql) = &trigger.sql {
            sql.push_str(&user_sql.to_text());
            sql.push('\n');
        }
        if let Some(exec) = &trigger.exec {
            let exec_sql: Vec<String> = exec.as_slice().iter().map(normalize_exec).collect();
            sql.push_str(&exec_sql.join("\\;\n"));
            sql.push_str("\\;\n");
        }
    }
    Ok(sql)
}

/// Every trigger `obj` needs, in hook order.
pub fn emulated_triggers(obj: &SchemaObject) -> ShimResult<Vec<EmulatedTrigger>> {
    let mut triggers = Vec::new();
    for hook in TriggerHook::ALL {
        let Some((suffix, timing)) = hook.definition(obj.kind) else {
            continue;
        };
        let body = trigger_body(obj, hook)?;
        if body.is_empty() {
            continue;
        }
        triggers.push(EmulatedTrigger {
            hook,
            name: format!("{}{}", obj.name, suffix),
            body,
            timing,
            table: obj.name.clone(),
        });
    }
    Ok(triggers)
}
