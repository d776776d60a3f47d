//! Purpose: `streamgate` CLI entry point.
//! Role: Binary crate root; parses args, runs the gateway or a one-shot pipeline, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout on success.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};

mod command_dispatch;
mod serve;

use streamgate::core::error::{Error, ErrorKind, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
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
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `streamgate --help`."));
            }
        },
    };

    command_dispatch::dispatch_command(cli.command, cli.root)
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
}

#[derive(Parser, Debug)]
#[command(
    name = "streamgate",
    version,
    about = "Streaming file gateway: ranged playback, uploads, gzip transforms, CSV ingestion",
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = ".",
        help = "Root directory holding videos/, data/, uploads/, public/",
        value_hint = ValueHint::DirPath
    )]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(
        about = "Run the HTTP gateway",
        after_help = r#"EXAMPLES
  $ streamgate serve
  $ streamgate --root ./site serve --bind 127.0.0.1:8080
  $ curl -H 'Range: bytes=0-' http://127.0.0.1:8000/video -o part.mp4

NOTES
  - Non-loopback binds require --allow-non-loopback
  - RUST_LOG controls log verbosity (default: info)"#
    )]
    Serve(ServeArgs),
    #[command(
        arg_required_else_help = true,
        about = "Ingest a CSV file into the record store",
        after_help = r#"EXAMPLES
  $ streamgate ingest data/sample.csv
  $ streamgate ingest users.csv --store /tmp/users.db"#
    )]
    Ingest {
        #[arg(help = "CSV file with an id,name,email,age header", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long, value_name = "PATH", help = "Store path (default: <root>/data.db)", value_hint = ValueHint::FilePath)]
        store: Option<PathBuf>,
        #[arg(long, default_value_t = 64 * 1024, help = "Longest accepted row in bytes")]
        max_row_bytes: usize,
    },
    #[command(
        arg_required_else_help = true,
        about = "Gzip a file through a streaming pipeline"
    )]
    Compress {
        #[arg(value_hint = ValueHint::FilePath)]
        src: PathBuf,
        #[arg(help = "Destination (default: <SRC>.gz)", value_hint = ValueHint::FilePath)]
        dest: Option<PathBuf>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Gunzip a file through a streaming pipeline"
    )]
    Decompress {
        #[arg(value_hint = ValueHint::FilePath)]
        src: PathBuf,
        #[arg(value_hint = ValueHint::FilePath)]
        dest: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8000", help = "Bind address")]
    bind: String,
    #[arg(long, value_name = "PATH", help = "Store path (default: <root>/data.db)", value_hint = ValueHint::FilePath)]
    store: Option<PathBuf>,
    #[arg(long, default_value_t = 64 * 1024, help = "Largest chunk read from a file")]
    chunk_bytes: usize,
    #[arg(
        long,
        default_value_t = 1_000_000,
        help = "Bytes past the requested start served per range response"
    )]
    range_budget: u64,
    #[arg(long, default_value_t = 250, help = "Telemetry feed tick period")]
    feed_interval_ms: u64,
    #[arg(long, default_value_t = 2_000, help = "Telemetry feed lifetime")]
    feed_duration_ms: u64,
    #[arg(long, help = "Allow non-loopback binds")]
    allow_non_loopback: bool,
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

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        ErrorKind::Store => err.with_hint("Store error. Check that --store points at a writable SQLite file."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    let corrupt = err.kind() == ErrorKind::Corrupt
        || error_causes(&err)
            .iter()
            .any(|cause| cause.starts_with("Corrupt"));
    if !corrupt {
        return err;
    }
    err.with_hint("Input is not a complete gzip stream.")
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::RangeRequired => "range required".to_string(),
        ErrorKind::MalformedRange => "malformed range".to_string(),
        ErrorKind::RangeNotSatisfiable => "range not satisfiable".to_string(),
        ErrorKind::Pipeline => "pipeline failed".to_string(),
        ErrorKind::Cancelled => "cancelled".to_string(),
        ErrorKind::RowRejected => "row rejected".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Store => "store error".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
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
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
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
    if let Some(path) = err.path() {
        lines.push(format!("  path: {}", path.display()));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("  offset: {offset}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("  caused by: {cause}"));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
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
