//! sqlshim: run SQL batches and compile schema objects for SQLite.
//!
//! # Usage
//!
//! ```bash
//! # Run a batch against a database file
//! sqlshim exec --database app.db "select * from cust where cust_id=@id;" --param id:bigint=7
//!
//! # Compile schema objects to SQL
//! sqlshim compile models/cust.json --phase init
//! ```

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use sqlshim::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sqlshim")]
#[command(version)]
#[command(about = "SQLite compatibility layer: batch runner and schema compiler", long_about = None)]
#[command(after_help = "EXAMPLES:
    sqlshim exec --database app.db 'select 1 as x;' --shape scalar
    sqlshim exec --target app -f seed.sql --tx
    sqlshim compile models/cust.json --phase restructure")]
struct Cli {
    /// Configuration file (defaults to ./sqlshim.toml, then the user config dir)
    #[arg(long, global = true, env = "SQLSHIM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a SQL batch
    Exec(ExecArgs),
    /// Compile schema objects into SQL
    Compile(CompileArgs),
}

#[derive(clap::Args)]
struct ExecArgs {
    /// SQL to execute
    sql: Option<String>,

    /// Read SQL from a file
    #[arg(short, long, conflicts_with = "sql")]
    file: Option<PathBuf>,

    /// Database file, or :memory:
    #[arg(short, long, conflicts_with = "target")]
    database: Option<String>,

    /// Named target from the configuration file
    #[arg(short, long)]
    target: Option<String>,

    #[arg(short, long, value_enum, default_value = "multirecordset")]
    shape: Shape,

    /// Execution context recorded in the side channel
    #[arg(short, long)]
    context: Option<String>,

    /// Parameter as name=value or name:type=value
    #[arg(short, long = "param")]
    params: Vec<String>,

    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Run inside a transaction
    #[arg(long)]
    tx: bool,

    /// Copy data files requested by result rows
    #[arg(long)]
    copy_files: bool,
}

#[derive(clap::Args)]
struct CompileArgs {
    /// Schema JSON file: one object or an array of objects
    file: PathBuf,

    #[arg(short, long, value_enum, default_value = "init")]
    phase: Phase,

    /// Value substituted for {schema}
    #[arg(long, default_value = "")]
    schema: String,

    /// Schema holding the code registry tables
    #[arg(long, default_value = "")]
    factory_schema: String,

    /// Base directory for seed data file destinations
    #[arg(long, default_value = "")]
    data_dir: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum Shape {
    Row,
    Recordset,
    Multirecordset,
    Scalar,
}

impl From<Shape> for ReturnShape {
    fn from(shape: Shape) -> Self {
        match shape {
            Shape::Row => ReturnShape::Row,
            Shape::Recordset => ReturnShape::Recordset,
            Shape::Multirecordset => ReturnShape::MultiRecordset,
            Shape::Scalar => ReturnShape::Scalar,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Phase {
    Init,
    Restructure,
    DropTriggers,
    InitData,
    SampleData,
    Drop,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SQLSHIM_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Exec(args) => exec(args, &cli).await,
        Commands::Compile(args) => compile(args),
    };
    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn parse_param(arg: &str) -> anyhow::Result<(String, Option<DbType>, DbValue)> {
    let Some((name, value)) = arg.split_once('=') else {
        bail!("parameter must be name=value: {arg}");
    };
    let (name, ty) = match name.split_once(':') {
        Some((name, ty)) => (name, Some(DbType::from_name(ty, None)?)),
        None => (name, None),
    };
    Ok((name.to_string(), ty, DbValue::Text(value.to_string())))
}

async fn exec(args: &ExecArgs, cli: &Cli) -> anyhow::Result<()> {
    let config = DriverConfig::load(cli.config.as_deref())?;
    let sql = match (&args.sql, &args.file) {
        (Some(sql), _) => sql.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => bail!("no SQL given: pass it inline or with --file"),
    };
    let target = match (&args.database, &args.target) {
        (Some(database), _) => DbTarget::new(database.clone()),
        (None, Some(name)) => config.target(name)?.clone(),
        (None, None) => bail!("no database given: use --database or --target"),
    };
    let mut params = SqlParams::new();
    for arg in &args.params {
        let (name, ty, value) = parse_param(arg)?;
        params.push(name, ty, value);
    }

    let driver = Driver::new(config);
    let shape = ReturnShape::from(args.shape);
    let output = if args.tx {
        let context = args.context.clone();
        driver
            .execute_transaction(&target, move |tx| {
                Box::pin(async move { tx.execute(context.as_deref(), shape, &sql, &params).await })
            })
            .await?
    } else {
        driver
            .execute(None, &target, args.context.as_deref(), shape, &sql, &params)
            .await?
    };
    driver.close().await;

    for notice in &output.notices {
        eprintln!("{} {}", "NOTICE:".cyan().bold(), notice);
    }
    for warning in &output.warnings {
        eprintln!("{} {}", "WARNING:".yellow().bold(), warning);
    }
    if args.copy_files {
        copy_files(&output.result)?;
    }
    print_result(&output.result, args.format);
    Ok(())
}

fn copy_files(result: &QueryResult) -> anyhow::Result<()> {
    let recordsets: Vec<Recordset> = match result {
        QueryResult::Row(row) => row.iter().map(|r| vec![r.clone()]).collect(),
        QueryResult::Recordset(rs) => rs.iter().cloned().collect(),
        QueryResult::MultiRecordset(sets) => sets.clone(),
        QueryResult::Scalar(_) => Vec::new(),
    };
    for marker in CopyFileMarker::collect(&recordsets) {
        marker.copy().with_context(|| {
            format!("copying {} to {}", marker.source.display(), marker.dest.display())
        })?;
        println!(
            "{} {} {} {}",
            "Copied".green(),
            marker.source.display(),
            "→".dimmed(),
            marker.dest.display()
        );
    }
    Ok(())
}

fn compile(args: &CompileArgs) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let mut objects = SchemaObject::list_from_json(&json)?;
    for obj in &mut objects {
        if obj.path.is_none() {
            obj.path = Some(args.file.clone());
        }
    }
    let compiler = SchemaCompiler::new(
        CompilerConfig::default()
            .schema(args.schema.clone())
            .factory_schema(args.factory_schema.clone())
            .data_dir(args.data_dir.clone()),
    );

    for obj in &objects {
        let sql = match args.phase {
            Phase::Init => compiler.init(obj)?,
            Phase::Restructure => compiler.restructure_init(obj)?,
            Phase::DropTriggers => compiler.restructure_drop(obj)?,
            Phase::InitData => compiler.init_data(obj)?,
            Phase::SampleData => compiler.sample_data(obj)?,
            Phase::Drop => compiler.drop(obj)?,
        };
        if !sql.is_empty() {
            println!("{}", format!("-- {}", obj.name).dimmed());
            print!("{sql}");
        }
    }
    Ok(())
}

fn print_result(result: &QueryResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
        }
        OutputFormat::Table => match result {
            QueryResult::Scalar(value) => {
                println!("{}", value.as_ref().map(val_to_string).unwrap_or_else(|| "NULL".into()))
            }
            QueryResult::Row(row) => print_table(row.as_slice()),
            QueryResult::Recordset(rs) => print_table(rs.as_deref().unwrap_or_default()),
            QueryResult::MultiRecordset(sets) => {
                for (i, rs) in sets.iter().enumerate() {
                    if i > 0 {
                        println!();
                    }
                    print_table(rs);
                }
                if sets.is_empty() {
                    println!("{}", "(no results)".dimmed());
                }
            }
        },
    }
}

fn print_table(rows: &[DbRow]) {
    if rows.is_empty() {
        println!("{}", "(no results)".dimmed());
        return;
    }

    let columns: Vec<&String> = rows[0].keys().collect();
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, col) in columns.iter().enumerate() {
            let len = row.get(*col).map(val_to_string).unwrap_or_default().chars().count();
            widths[i] = widths[i].max(len);
        }
    }

    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:width$}", c, width = w))
        .collect();
    println!("{}", header.join(" │ ").white().bold());
    let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    println!("{}", sep.join("─┼─").dimmed());

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .zip(&widths)
            .map(|(c, w)| {
                let val = row.get(*c).map(val_to_string).unwrap_or_default();
                format!("{:width$}", val, width = w)
            })
            .collect();
        println!("{}", cells.join(" │ "));
    }

    println!();
    println!("{} row(s) returned", rows.len().to_string().cyan());
}

fn val_to_string(val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => val.to_string(),
    }
}
