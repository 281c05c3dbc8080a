use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value as JsonValue};
use tagstore_core::fragments::{get_fragment, SCHEMAS_TABLE_NAME};
use tagstore_core::{
    encode, parse_key_mappings, Column, FragmentType, Inserter, KernelError, RowData, Schema,
    Table, TaggedValues, TupleSelection, TypeKind, Value, VersionedRoot,
};
use tagstore_store_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "TAGSTORE_LOG";

#[derive(Debug, Parser)]
#[command(name = "ts")]
#[command(about = "Tagstore CLI")]
struct Cli {
    #[arg(long, env = "TAGSTORE_DB", default_value = "./tagstore.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Table {
        #[command(subcommand)]
        command: TableCommand,
    },
    Row {
        #[command(subcommand)]
        command: RowCommand,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Fragments {
        #[command(subcommand)]
        command: FragmentsCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TableCommand {
    Create(TableCreateArgs),
    Drop(TableNameArgs),
    List,
}

#[derive(Debug, Args)]
struct TableCreateArgs {
    name: String,
    /// Column as `name:kind:tag[:pk][:null]`.
    #[arg(long = "column", required = true)]
    columns: Vec<String>,
}

#[derive(Debug, Args)]
struct TableNameArgs {
    name: String,
}

#[derive(Debug, Subcommand)]
enum RowCommand {
    Insert(RowInsertArgs),
    Get(RowGetArgs),
}

#[derive(Debug, Args)]
struct RowInsertArgs {
    table: String,
    /// Values as `column=value`.
    #[arg(required = true)]
    assignments: Vec<String>,
}

#[derive(Debug, Args)]
struct RowGetArgs {
    table: String,
    /// Optional header (`col1,col2`) followed by key tokens.
    keys: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum SchemaCommand {
    Tags(SchemaTagsArgs),
}

#[derive(Debug, Args)]
struct SchemaTagsArgs {
    tables: Vec<String>,
    #[arg(short = 'r', long = "result-format", value_enum, default_value_t = ResultFormat::Tabular)]
    result_format: ResultFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResultFormat {
    Tabular,
    Csv,
    Json,
}

#[derive(Debug, Subcommand)]
enum FragmentsCommand {
    Status,
    Migrate,
    Get(FragmentGetArgs),
}

#[derive(Debug, Args)]
struct FragmentGetArgs {
    #[arg(long = "type", value_enum)]
    fragment_type: FragmentTypeArg,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FragmentTypeArg {
    View,
    Trigger,
    Procedure,
}

impl From<FragmentTypeArg> for FragmentType {
    fn from(value: FragmentTypeArg) -> Self {
        match value {
            FragmentTypeArg::View => Self::View,
            FragmentTypeArg::Trigger => Self::Trigger,
            FragmentTypeArg::Procedure => Self::Procedure,
        }
    }
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Verify,
}

fn with_contract_version(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                JsonValue::String(CLI_CONTRACT_VERSION.to_string()),
            );
            JsonValue::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    tracing::debug!(db = %cli.db.display(), "opening store");
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Table { command } => run_table(command, &mut store),
        Command::Row { command } => run_row(command, &mut store),
        Command::Schema { command } => run_schema(command, &store),
        Command::Fragments { command } => run_fragments(command, &mut store),
        Command::Db { command } => run_db(command, &store),
    }
}

fn run_table(command: TableCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        TableCommand::Create(args) => {
            let schema = parse_schema(&args.columns)?;
            let root = store.update_working_root(|root| root.create_table(&args.name, schema))?;
            let table = require_table(&root, &args.name)?;
            emit_json(serde_json::json!({
                "table": table.name(),
                "columns": table.schema().columns(),
                "content_hash": table.content_hash()
            }))
        }
        TableCommand::Drop(args) => {
            store.update_working_root(|root| root.drop_table(&args.name))?;
            emit_json(serde_json::json!({ "dropped": args.name }))
        }
        TableCommand::List => {
            let root = store.working_root()?;
            let tables = root
                .tables()
                .map(|table| {
                    serde_json::json!({
                        "name": table.name(),
                        "columns": table.schema().len(),
                        "rows": table.row_count(),
                        "content_hash": table.content_hash()
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "tables": tables }))
        }
    }
}

fn run_row(command: RowCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        RowCommand::Insert(args) => {
            let root = store.working_root()?;
            let table = require_table(&root, &args.table)?;
            let values = parse_assignments(table.schema(), &args.assignments)?;
            let key = encode(table.schema(), &values, TupleSelection::Key)?;

            let updated = store.update_working_root(|root| {
                let table =
                    root.get_table(&args.table).ok_or_else(|| KernelError::TableNotFound(args.table.clone()))?;
                let mut editor = table.editor();
                editor.insert(&values)?;
                Ok(root.put_table(editor.close()?))
            })?;
            let table = require_table(&updated, &args.table)?;
            emit_json(serde_json::json!({
                "table": table.name(),
                "key": key.to_hex(),
                "row": row_json(table.schema(), &values),
                "rows": table.row_count()
            }))
        }
        RowCommand::Get(args) => {
            let root = store.working_root()?;
            let table = require_table(&root, &args.table)?;
            let rows = find_rows(table, &args.keys)?;
            emit_json(serde_json::json!({
                "table": table.name(),
                "count": rows.len(),
                "rows": rows
            }))
        }
    }
}

fn run_schema(command: SchemaCommand, store: &SqliteStore) -> Result<()> {
    match command {
        SchemaCommand::Tags(args) => run_schema_tags(&args, store),
    }
}

fn run_schema_tags(args: &SchemaTagsArgs, store: &SqliteStore) -> Result<()> {
    let root = store.working_root()?;
    let tables: Vec<&Table> = if args.tables.is_empty() {
        let tables = root
            .tables()
            .filter(|table| !table.name().eq_ignore_ascii_case(SCHEMAS_TABLE_NAME))
            .collect::<Vec<_>>();
        if tables.is_empty() {
            println!("No tables in working set");
            return Ok(());
        }
        tables
    } else {
        args.tables.iter().filter_map(|name| root.get_table(name)).collect()
    };

    let entries = tables
        .iter()
        .flat_map(|table| {
            table.schema().columns().iter().map(move |column| (table.name(), column))
        })
        .collect::<Vec<_>>();

    match args.result_format {
        ResultFormat::Tabular => {
            println!("table | column | tag");
            for (table, column) in &entries {
                println!("{table} | {} | {}", column.name, column.tag);
            }
            Ok(())
        }
        ResultFormat::Csv => {
            println!("table,column,tag");
            for (table, column) in &entries {
                println!("{},{},{}", csv_field(table), csv_field(&column.name), column.tag);
            }
            Ok(())
        }
        ResultFormat::Json => {
            let tags = entries
                .iter()
                .map(|(table, column)| {
                    serde_json::json!({ "table": table, "column": column.name, "tag": column.tag })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "tags": tags }))
        }
    }
}

fn run_fragments(command: FragmentsCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        FragmentsCommand::Status => {
            let status = store.schemas_status()?;
            emit_json(serde_json::to_value(&status).context("failed to serialize schemas status")?)
        }
        FragmentsCommand::Migrate => {
            let (table, report) = store.open_schemas_table()?;
            emit_json(serde_json::json!({
                "table": table.name(),
                "rows": table.row_count(),
                "report": report
            }))
        }
        FragmentsCommand::Get(args) => {
            let (table, _) = store.open_schemas_table()?;
            let fragment = get_fragment(&table, args.fragment_type.into(), &args.name)?;
            emit_json(serde_json::json!({
                "found": fragment.is_some(),
                "fragment": fragment
            }))
        }
    }
}

fn run_db(command: DbCommand, store: &SqliteStore) -> Result<()> {
    match command {
        DbCommand::Verify => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn require_table<'a>(root: &'a VersionedRoot, name: &str) -> Result<&'a Table> {
    root.get_table(name).ok_or_else(|| anyhow!("table not found: {name}"))
}

fn parse_schema(specs: &[String]) -> Result<Schema> {
    let columns = specs.iter().map(|spec| parse_column(spec)).collect::<Result<Vec<_>>>()?;
    Ok(Schema::new(columns)?)
}

fn parse_column(spec: &str) -> Result<Column> {
    let mut parts = spec.split(':');
    let (Some(name), Some(kind), Some(tag)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("column `{spec}` must be name:kind:tag[:pk][:null]"));
    };
    let kind = TypeKind::parse(kind).ok_or_else(|| anyhow!("unknown column kind `{kind}`"))?;
    let tag = tag.parse::<u64>().with_context(|| format!("invalid tag `{tag}` for `{name}`"))?;

    let mut is_primary_key = false;
    let mut nullable = false;
    for flag in parts {
        match flag {
            "pk" => is_primary_key = true,
            "null" => nullable = true,
            other => return Err(anyhow!("unknown column flag `{other}` in `{spec}`")),
        }
    }

    let mut column = Column::new(name, tag, kind, is_primary_key);
    column.nullable = nullable;
    Ok(column)
}

fn parse_assignments(schema: &Schema, assignments: &[String]) -> Result<TaggedValues> {
    let mut values = TaggedValues::new();
    for assignment in assignments {
        let (name, raw) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow!("expected column=value, got `{assignment}`"))?;
        let column = schema
            .column_by_name(name)
            .ok_or_else(|| KernelError::UnknownColumn(name.to_string()))?;
        if values.insert(column.tag, Value::parse(column, raw)?).is_some() {
            return Err(anyhow!("column `{}` assigned more than once", column.name));
        }
    }
    Ok(values)
}

fn find_rows(table: &Table, keys: &[String]) -> Result<Vec<JsonValue>> {
    let schema = table.schema();
    if keys.is_empty() {
        return table.iter_rows().map(|row| Ok(row_json(schema, &row.decode(schema)?))).collect();
    }

    let key_tags = schema.pk_columns().iter().map(|column| column.tag).collect::<Vec<_>>();
    let mut found = Vec::new();
    for mapping in parse_key_mappings(schema, keys)? {
        if mapping.keys().copied().eq(key_tags.iter().copied()) {
            let key = encode(schema, &mapping, TupleSelection::Key)?;
            if let Some(row) = table.get(&key) {
                found.push(row_json(schema, &row.decode(schema)?));
            }
            continue;
        }

        for row in table.iter_rows() {
            let values = row.decode(schema)?;
            if mapping.iter().all(|(tag, value)| values.get(tag) == Some(value)) {
                found.push(row_json(schema, &values));
            }
        }
    }
    Ok(found)
}

fn row_json(schema: &Schema, values: &TaggedValues) -> JsonValue {
    let mut object = Map::new();
    for column in schema.columns() {
        let value = values.get(&column.tag).map_or(JsonValue::Null, Value::to_json);
        object.insert(column.name.clone(), value);
    }
    JsonValue::Object(object)
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
