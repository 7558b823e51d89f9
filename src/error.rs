//! Error types for sqlshim.

use thiserror::Error;

/// The main error type for sqlshim operations.
#[derive(Debug, Error)]
pub enum ShimError {
    /// The database target could not be opened.
    #[error("DB Connect Error: {0}")]
    Connect(String),

    /// The target still carries the template placeholder name.
    #[error("Unconfigured database: {0}")]
    UnconfiguredDatabase(String),

    /// The engine rejected a statement.
    #[error("SQL Error: {statement} :: {source}")]
    Statement {
        statement: String,
        #[source]
        source: sqlx::Error,
    },

    /// An application-level error signaled through the meta row.
    #[error("SQL Error: {statement} :: Error {code}: {message}")]
    SideChannel {
        code: i64,
        message: String,
        statement: String,
    },

    /// The meta row could not be read back after a statement.
    #[error("No data returned from shim_meta")]
    MetaMissing,

    /// The queued jsexec payload is not valid JSON.
    #[error("Error parsing shim_meta jsexec command: {0}")]
    JsexecParse(String),

    #[error("shim_meta jsexec command missing function: {0}")]
    JsexecMissingFunction(String),

    #[error("shim_meta jsexec command missing \"{param}\" parameter: {command}")]
    JsexecMissingParam { param: &'static str, command: String },

    #[error("shim_meta jsexec invalid function: {0}")]
    JsexecInvalidFunction(String),

    #[error("shim_meta jsexec No results for {0} source")]
    JsexecNoResults(&'static str),

    #[error("shim_meta jsexec could not generate a unique hash for {table}.{dest} after {attempts} attempts")]
    HashRetriesExhausted {
        table: String,
        dest: String,
        attempts: usize,
    },

    /// A parameter type could not be resolved.
    #[error("Invalid datatype: {0}")]
    InvalidDatatype(String),

    #[error("No primary key in table {0}")]
    MissingPrimaryKey(String),

    #[error("Table {table} > Column {column} cannot have multiple foreign keys")]
    MultipleForeignKeys { table: String, column: String },

    #[error("Table {table} > {target} - {action} action not supported: {value}")]
    UnsupportedFkAction {
        table: String,
        target: String,
        action: &'static str,
        value: String,
    },

    #[error("Table {table} > Foreign Key {detail}")]
    InvalidForeignKey { table: String, detail: String },

    #[error("Column {column} datatype not supported: {datatype}")]
    UnsupportedColumnType { column: String, datatype: String },

    #[error("Column {0} missing type")]
    MissingColumnType(String),

    #[error("View {view} > {table} join_type must be inner, left, or right")]
    InvalidJoinType { view: String, table: String },

    #[error("Object {object} > column {column}: unsupported seed value {value}")]
    UnsupportedSeedValue {
        object: String,
        column: String,
        value: String,
    },

    #[error("SQL macro expansion exceeded {0} passes")]
    MacroRecursion(usize),

    #[error("Transaction cannot span multiple database connections")]
    TransactionSpansConnections,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error outside statement execution.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShimError {
    /// Wrap an engine error with the statement that produced it.
    pub fn statement(statement: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Statement {
            statement: statement.into(),
            source,
        }
    }

    /// Create a missing jsexec parameter error.
    pub fn missing_param(param: &'static str, command: impl Into<String>) -> Self {
        Self::JsexecMissingParam {
            param,
            command: command.into(),
        }
    }

    /// The side-channel code, when this error was signaled through the meta row.
    pub fn side_channel_code(&self) -> Option<i64> {
        match self {
            Self::SideChannel { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for sqlshim operations.
pub type ShimResult<T> = Result<T, ShimError>;
