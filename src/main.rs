//! Purpose: `colpage` CLI entry point for inspecting stored datasets.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit stable JSON on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: The CLI only reads; datasets are written through the library.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use colpage::api::{
    to_exit_code, validate_dataset, ClusterSize, Column, ColumnModel, ColumnType, ConnectColumns,
    DirStore, Element, Error, ErrorKind, PageSource, SourceOptions, ValidationIssue,
    ValidationReport, ValidationStatus,
};

const DEFAULT_DUMP_COUNT: u64 = 100;

#[derive(Parser, Debug)]
#[command(name = "colpage", version, about = "Inspect columnar page datasets")]
struct Cli {
    #[arg(
        long,
        default_value = ".",
        help = "Record directory holding the datasets",
        value_hint = ValueHint::DirPath
    )]
    dir: PathBuf,
    #[arg(
        long,
        default_value_t = colpage::api::DEFAULT_POOL_IDLE_PAGES,
        help = "Unreferenced pages kept cached while reading"
    )]
    pool_pages: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show columns, clusters and entry counts of a dataset.
    Info { dataset: String },
    /// Read every page and check page tiling and offset columns.
    Verify { dataset: String },
    /// Print the elements of one column.
    Dump {
        dataset: String,
        column: String,
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long, default_value_t = DEFAULT_DUMP_COUNT)]
        count: u64,
    },
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(exit_code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `colpage --help`."));
            }
        },
    };

    let options = SourceOptions::new().with_pool_idle_pages(cli.pool_pages);
    let store = Arc::new(DirStore::open(&cli.dir)?);
    match cli.command {
        Command::Info { dataset } => {
            let source = PageSource::attach(store, &dataset, options).map_err(add_corrupt_hint)?;
            emit_json(info_json(&source));
            Ok(0)
        }
        Command::Verify { dataset } => {
            let report = match PageSource::attach(store, &dataset, options) {
                Ok(source) => validate_dataset(&source),
                Err(err) if err.kind() == ErrorKind::Corrupt => {
                    ValidationReport::corrupt(dataset.clone(), ValidationIssue::from_error(&err))
                }
                Err(err) => return Err(err),
            };
            emit_json(report_json(&report));
            Ok(match report.status {
                ValidationStatus::Ok => 0,
                ValidationStatus::Corrupt => to_exit_code(ErrorKind::Corrupt),
            })
        }
        Command::Dump {
            dataset,
            column,
            start,
            count,
        } => {
            let source = PageSource::attach(store, &dataset, options).map_err(add_corrupt_hint)?;
            let value = dump_json(&source, &column, start, count).map_err(add_corrupt_hint)?;
            emit_json(value);
            Ok(0)
        }
    }
}

fn info_json(source: &PageSource) -> Value {
    let columns = source
        .columns()
        .filter_map(|model| {
            let handle = source.column_handle(model.name()).ok()?;
            let locators = source.page_locators(handle).ok()?;
            Some(json!({
                "id": handle.id(),
                "name": model.name(),
                "type": model.column_type().name(),
                "sorted": model.is_sorted(),
                "offset_column": model.offset_column(),
                "elements": source.n_elements(handle).ok()?,
                "pages": locators.len(),
            }))
        })
        .collect::<Vec<_>>();
    let fields = source
        .fields()
        .iter()
        .map(|field| {
            json!({
                "name": field.name,
                "type": field.type_name,
                "parent": field.parent,
            })
        })
        .collect::<Vec<_>>();
    let clusters = source
        .clusters()
        .iter()
        .map(|cluster| {
            json!({
                "id": cluster.cluster_id,
                "entry_start": cluster.entry_range_start,
                "entries": cluster.n_entries,
            })
        })
        .collect::<Vec<_>>();
    json!({
        "dataset": source.dataset(),
        "entries": source.n_entries(),
        "root_fields": source.root_fields().map(|field| field.name.as_str()).collect::<Vec<_>>(),
        "fields": fields,
        "columns": columns,
        "clusters": clusters,
    })
}

fn report_json(report: &ValidationReport) -> Value {
    serde_json::to_value(report).unwrap_or_else(|_| {
        json!({
            "dataset": report.dataset,
            "status": "corrupt",
            "issue_count": report.issue_count,
        })
    })
}

fn dump_json(source: &PageSource, column: &str, start: u64, count: u64) -> Result<Value, Error> {
    let handle = source.column_handle(column)?;
    let model = source.column_model(handle)?.clone();
    let total = source.n_elements(handle)?;
    let start = start.min(total);
    let count = count.min(total - start);
    let values = match model.column_type() {
        ColumnType::Index => read_values(source, model.clone(), start, count, |v: ClusterSize| {
            json!(v.0)
        })?,
        ColumnType::Byte => read_values(source, model.clone(), start, count, |v: u8| json!(v))?,
        ColumnType::Bit => read_values(source, model.clone(), start, count, |v: bool| json!(v))?,
        ColumnType::Real64 => read_values(source, model.clone(), start, count, |v: f64| json!(v))?,
        ColumnType::Real32 => read_values(source, model.clone(), start, count, |v: f32| json!(v))?,
        ColumnType::Int64 => read_values(source, model.clone(), start, count, |v: i64| json!(v))?,
        ColumnType::Int32 => read_values(source, model.clone(), start, count, |v: i32| json!(v))?,
        ColumnType::Int16 => read_values(source, model.clone(), start, count, |v: i16| json!(v))?,
    };
    Ok(json!({
        "dataset": source.dataset(),
        "column": model.name(),
        "type": model.column_type().name(),
        "elements": total,
        "start": start,
        "values": values,
    }))
}

fn read_values<T: Element>(
    source: &PageSource,
    model: ColumnModel,
    start: u64,
    count: u64,
    to_json: impl Fn(T) -> Value,
) -> Result<Vec<Value>, Error> {
    let mut column = Column::<T>::from_model(model);
    column.connect_source(source)?;
    Ok(column
        .read_v(source, start, count)?
        .into_iter()
        .map(to_json)
        .collect())
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("Run `colpage verify` for a full report; the dataset may need rewriting.")
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Capacity => "page capacity exceeded".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(column) = err.column() {
        inner.insert("column".to_string(), json!(column));
    }
    if let Some(cluster) = err.cluster() {
        inner.insert("cluster".to_string(), json!(cluster));
    }
    if let Some(page) = err.page() {
        inner.insert("page".to_string(), json!(page));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(key) = err.key() {
        lines.push(format!("key: {key}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{clap_error_summary, error_json, Cli, Command};
    use clap::Parser;
    use colpage::api::{Error, ErrorKind};

    #[test]
    fn dump_defaults_apply() {
        let cli = Cli::try_parse_from(["colpage", "dump", "events", "pt"]).expect("parse");
        match cli.command {
            Command::Dump { start, count, .. } => {
                assert_eq!(start, 0);
                assert_eq!(count, super::DEFAULT_DUMP_COUNT);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn error_json_carries_page_context() {
        let err = Error::new(ErrorKind::Corrupt)
            .with_message("bad page")
            .with_column(1)
            .with_cluster(2)
            .with_page(3)
            .with_key("d/NPP2_1_3");
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Corrupt");
        assert_eq!(value["error"]["column"], 1);
        assert_eq!(value["error"]["cluster"], 2);
        assert_eq!(value["error"]["page"], 3);
        assert_eq!(value["error"]["key"], "d/NPP2_1_3");
    }

    #[test]
    fn clap_summary_strips_prefix() {
        let err = Cli::try_parse_from(["colpage", "bogus"]).expect_err("unknown");
        assert!(!clap_error_summary(&err).starts_with("error:"));
    }
}
