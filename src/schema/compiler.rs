//! SQLite DDL generation for schema objects.

use tracing::debug;

use super::macros::{MacroSet, SqlMacro, builtin_macros};
use super::seed::row_insert_sql;
use super::triggers::emulated_triggers;
use super::{
    ColumnDef, ColumnDefault, CompilerConfig, ForeignKeyTarget, ObjectKind, SchemaObject, SeedRow,
};
use crate::error::{ShimError, ShimResult};
use crate::splitter::escape;

/// Map a declared column type to its SQLite storage type.
pub fn sqlite_type(column: &ColumnDef) -> ShimResult<&'static str> {
    let Some(typ) = column.typ.as_deref() else {
        return Err(ShimError::MissingColumnType(column.name.clone()));
    };
    match typ {
        "varchar" | "char" | "date" | "time" | "datetime" => Ok("text"),
        "binary" => Ok("blob"),
        "bigint" | "int" | "smallint" | "tinyint" | "boolean" => Ok("integer"),
        "decimal" | "float" => Ok("real"),
        other => Err(ShimError::UnsupportedColumnType {
            column: column.name.clone(),
            datatype: other.to_string(),
        }),
    }
}

fn fk_action(
    table: &str,
    target: &str,
    action: &'static str,
    value: Option<&str>,
) -> ShimResult<String> {
    let clause = if action == "on_delete" { "on delete" } else { "on update" };
    match value {
        None => Ok(String::new()),
        Some("cascade") => Ok(format!(" {clause} cascade")),
        Some("null") => Ok(format!(" {clause} set null")),
        Some(other) => Err(ShimError::UnsupportedFkAction {
            table: table.to_string(),
            target: target.to_string(),
            action,
            value: other.to_string(),
        }),
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Code and code2 registry naming.
struct CodeNames<'a> {
    schema: &'a str,
    name: &'a str,
    code_type: &'static str,
    registry: String,
    create_macro: String,
}

/// Compiles schema objects into SQLite SQL.
#[derive(Debug, Clone)]
pub struct SchemaCompiler {
    config: CompilerConfig,
    macros: MacroSet,
}

impl SchemaCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        let mut macros = builtin_macros();
        macros.extend(&config.macros);
        Self { config, macros }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Expand macros, then resolve `{schema}`.
    fn finish(&self, sql: &str, macros: &MacroSet) -> ShimResult<String> {
        let sql = macros.expand(sql)?;
        Ok(self.resolve_schema(&sql))
    }

    fn resolve_schema(&self, sql: &str) -> String {
        if self.config.schema.is_empty() {
            sql.replace("{schema}.", "").replace("{schema}", "")
        } else {
            sql.replace("{schema}", &self.config.schema)
        }
    }

    fn factory_prefix(&self) -> String {
        if self.config.factory_schema.is_empty() {
            String::new()
        } else {
            format!("{}.", self.config.factory_schema)
        }
    }

    fn code_names<'a>(&self, obj: &'a SchemaObject) -> CodeNames<'a> {
        let (schema, name) = obj.split_name();
        let (prefix, family) = match obj.kind {
            ObjectKind::Code2 => ("code2_", "code2"),
            _ => ("code_", "code"),
        };
        let name = name.strip_prefix(prefix).unwrap_or(name);
        let app = obj.code_type.as_deref() == Some("app");
        let code_type = if app { "app" } else { "sys" };
        let registry = &self.config.registry;
        let table = match (family, app) {
            ("code2", true) => &registry.code2_app,
            ("code2", false) => &registry.code2_sys,
            (_, true) => &registry.code_app,
            (_, false) => &registry.code_sys,
        };
        CodeNames {
            schema,
            name,
            code_type,
            registry: format!("{}{}", self.factory_prefix(), table),
            create_macro: format!("{}create_{family}_{code_type}", self.factory_prefix()),
        }
    }

    fn table_sql(&self, obj: &SchemaObject) -> ShimResult<String> {
        let mut cols = Vec::new();
        let mut foreign_keys = Vec::new();

        for column in &obj.columns {
            let mut line = format!("  {} {}", column.name, sqlite_type(column)?);
            if column.key {
                line.push_str(" primary key");
            }
            if column.identity {
                line.push_str(" autoincrement");
            }
            if column.unique {
                line.push_str(" unique");
            }
            if !column.null {
                line.push_str(" not null");
            }
            let default = match &column.default {
                Some(ColumnDefault::Null) => Some("null".to_string()),
                Some(ColumnDefault::Text(s)) => Some(format!("'{}'", escape(s))),
                Some(ColumnDefault::Number(n)) => Some(escape(&n.to_string())),
                Some(ColumnDefault::Bool(b)) => Some(if *b { "1" } else { "0" }.to_string()),
                Some(ColumnDefault::Sql { .. }) | None => None,
            };
            if let Some(default) = default {
                line.push_str(" default ");
                line.push_str(&default);
            }
            cols.push(line);

            if column.foreignkey.len() > 1 {
                return Err(ShimError::MultipleForeignKeys {
                    table: obj.name.clone(),
                    column: column.name.clone(),
                });
            }
            if let Some((table, target)) = column.foreignkey.first() {
                foreign_keys.push(self.column_foreign_key(obj, column, table, target)?);
            }
        }

        for fk in &obj.foreignkeys {
            if fk.columns.is_empty() {
                return Err(ShimError::InvalidForeignKey {
                    table: obj.name.clone(),
                    detail: "missing \"columns\" property".to_string(),
                });
            }
            let columns = fk.columns.join(",");
            let Some(foreign_table) = fk.foreign_table.as_deref().filter(|t| !t.is_empty()) else {
                return Err(ShimError::InvalidForeignKey {
                    table: obj.name.clone(),
                    detail: format!("({columns}) missing \"foreign_table\" property"),
                });
            };
            if fk.foreign_columns.is_empty() {
                return Err(ShimError::InvalidForeignKey {
                    table: obj.name.clone(),
                    detail: format!("({columns}) missing \"foreign_columns\" property"),
                });
            }
            let target = format!("Foreign Key ({columns})");
            let mut sql = format!(
                " foreign key ({columns}) references {foreign_table}({})",
                fk.foreign_columns.join(",")
            );
            sql.push_str(&fk_action(&obj.name, &target, "on_delete", fk.on_delete.as_deref())?);
            sql.push_str(&fk_action(&obj.name, &target, "on_update", fk.on_update.as_deref())?);
            foreign_keys.push(sql);
        }

        let has_cols = !(cols.is_empty() && foreign_keys.is_empty());
        cols.extend(foreign_keys);

        let mut sql = format!("create table {}(\n", obj.name);
        sql.push_str(&cols.join(",\n"));
        sql.push('\n');
        let cname = sanitize_name(&obj.name);
        for (i, unique) in obj.unique.iter().enumerate() {
            if unique.is_empty() {
                continue;
            }
            if has_cols {
                sql.push_str("  , ");
            }
            sql.push_str(&format!(
                "constraint unique_{cname}_{} unique ({})\n",
                i + 1,
                unique.join(",")
            ));
        }
        sql.push_str(");\n");

        for (i, index) in obj.index.iter().enumerate() {
            if index.columns.is_empty() {
                continue;
            }
            sql.push_str(&format!(
                "create index index_{cname}_{} on {}({});\n",
                i + 1,
                obj.name,
                index.columns.join(",")
            ));
        }
        Ok(sql)
    }

    fn column_foreign_key(
        &self,
        obj: &SchemaObject,
        column: &ColumnDef,
        table: &str,
        target: &ForeignKeyTarget,
    ) -> ShimResult<String> {
        let label = format!("Column {}", column.name);
        let mut sql = format!(
            " foreign key ({}) references {table}({})",
            column.name,
            target.column()
        );
        sql.push_str(&fk_action(&obj.name, &label, "on_delete", target.on_delete())?);
        sql.push_str(&fk_action(&obj.name, &label, "on_update", target.on_update())?);
        Ok(sql)
    }

    fn view_sql(&self, obj: &SchemaObject) -> ShimResult<String> {
        let mut cols = Vec::new();
        let mut from = Vec::new();
        for (table_name, table) in &obj.tables {
            for col in &table.columns {
                match &col.sqlselect {
                    Some(select) => cols.push(format!("({}) as {}", select.to_text(), col.name)),
                    None => {
                        let mut name = col.name.clone();
                        if !name.contains('.') {
                            name = format!("{table_name}.{name}");
                        }
                        if name.matches('.').count() < 2 {
                            name = format!("{{schema}}.{name}");
                        }
                        cols.push(name);
                    }
                }
            }
            match table.join_type.as_deref() {
                None => from.push(table_name.clone()),
                Some(join_type) => {
                    let join = match join_type {
                        "inner" => "inner join",
                        "left" => "left outer join",
                        "right" => "right outer join",
                        _ => {
                            return Err(ShimError::InvalidJoinType {
                                view: obj.name.clone(),
                                table: table_name.clone(),
                            });
                        }
                    };
                    let mut join = format!("{join} {table_name}");
                    if !table.join_columns.is_empty() {
                        let on: Vec<String> = table
                            .join_columns
                            .iter()
                            .map(|(left, right)| format!("{left}={right}"))
                            .collect();
                        join.push_str(" on ");
                        join.push_str(&on.join(" and "));
                    }
                    from.push(join);
                }
            }
        }
        let mut sql = format!(
            "create view {} as select \n{} from {}",
            obj.name,
            cols.join(","),
            from.join(" ")
        );
        if let Some(where_clause) = &obj.where_clause {
            sql.push_str(" where ");
            sql.push_str(where_clause);
        }
        sql.push_str(";\n");
        Ok(sql)
    }

    fn code_sql(&self, obj: &SchemaObject) -> String {
        let names = self.code_names(obj);
        let desc = escape(&obj.description());
        format!(
            "insert into {registry} (code_name, code_desc, code_schema, code_type) VALUES ('{name}', '{desc}', '{{schema}}', '{code_type}');\n\
             {create}('{schema}','{name}','{desc}');\n",
            registry = names.registry,
            name = escape(names.name),
            code_type = names.code_type,
            create = names.create_macro,
            schema = escape(names.schema),
        )
    }

    fn seed_sql(&self, obj: &SchemaObject, rows: &[SeedRow]) -> ShimResult<String> {
        let macros = self
            .macros
            .clone()
            .with("TABLENAME", SqlMacro::text(obj.name.clone()));
        let mut sql = String::new();
        for row in rows {
            let insert = row_insert_sql(obj, row, &self.config.data_dir)?;
            sql.push_str(&macros.expand(&insert)?);
        }
        Ok(self.resolve_schema(&sql))
    }

    /// Creation SQL followed by the `init` rows.
    pub fn init(&self, obj: &SchemaObject) -> ShimResult<String> {
        debug!(target: "sqlshim::schema", "init {}", obj.name);
        let mut sql = match obj.kind {
            ObjectKind::Table => self.table_sql(obj)?,
            ObjectKind::View => self.view_sql(obj)?,
            ObjectKind::Code | ObjectKind::Code2 => self.code_sql(obj),
            ObjectKind::Other => String::new(),
        };
        sql = self.finish(&sql, &self.macros)?;
        sql.push_str(&self.seed_sql(obj, &obj.init)?);
        Ok(sql)
    }

    /// Create the emulated triggers.
    pub fn restructure_init(&self, obj: &SchemaObject) -> ShimResult<String> {
        let mut sql = String::new();
        for trigger in emulated_triggers(obj)? {
            let mut macros = self.macros.clone();
            for (name, sql_macro) in trigger.object_macros() {
                macros.insert(name, sql_macro);
            }
            let body = macros.expand(&trigger.body)?;
            sql.push_str(&trigger.create_sql(&body));
        }
        Ok(self.resolve_schema(&sql))
    }

    /// Drop the triggers `restructure_init` creates.
    pub fn restructure_drop(&self, obj: &SchemaObject) -> ShimResult<String> {
        Ok(emulated_triggers(obj)?
            .iter()
            .map(|t| t.drop_sql())
            .collect())
    }

    pub fn init_data(&self, obj: &SchemaObject) -> ShimResult<String> {
        self.seed_sql(obj, &obj.init_data)
    }

    pub fn sample_data(&self, obj: &SchemaObject) -> ShimResult<String> {
        self.seed_sql(obj, &obj.sample_data)
    }

    /// Idempotent insert for a single row.
    pub fn row_insert(&self, obj: &SchemaObject, row: &SeedRow) -> ShimResult<String> {
        self.seed_sql(obj, std::slice::from_ref(row))
    }

    pub fn drop(&self, obj: &SchemaObject) -> ShimResult<String> {
        let sql = match obj.kind {
            ObjectKind::Table => format!("drop table if exists {};\n", obj.name),
            ObjectKind::View => format!("drop view if exists {};\n", obj.name),
            ObjectKind::Code | ObjectKind::Code2 => {
                let names = self.code_names(obj);
                format!(
                    "drop table if exists {};\ndelete from {} where code_name='{}' and code_schema='{{schema}}';\n",
                    obj.name,
                    names.registry,
                    escape(names.name)
                )
            }
            ObjectKind::Other => String::new(),
        };
        Ok(self.resolve_schema(&sql))
    }
}
