//! Spyglass CLI.
//!
//! Usage:
//!   spyglass import json [--dir=PATH] [--slice-size=N]
//!   spyglass export json [--dir=PATH] <expression>
//!   spyglass status [--dir=PATH]
//!
//! `import` consumes newline-delimited JSON records on stdin; the layout
//! is inferred from the first record. `export` prints matching records
//! as JSON lines. The state directory defaults to $SPYGLASS_DIR, then
//! the current directory; $SPYGLASS_LOG_LEVEL selects the log filter.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use spyglass::error::{Error, Result};
use spyglass::expr::Expression;
use spyglass::importer::{Importer, ImporterConfig, LocalConsensus};
use spyglass::index::{IndexFactory, Partition};
use spyglass::meta_index::MetaIndex;
use spyglass::schema::{to_json_typed, Attribute, Field, RecordType, Type, ATTR_TIMESTAMP};
use spyglass::segment::SegmentStore;
use spyglass::slice::{TableSlice, TableSliceBuilder};
use spyglass::synopsis::SynopsisFactory;
use spyglass::value::Value;
use spyglass::Bitmap;

const DEFAULT_SLICE_SIZE: u64 = 100;
const DEFAULT_SEGMENT_SIZE: u64 = 128 << 20;
const IN_MEMORY_SEGMENTS: usize = 10;
/// Slices requested per credit round during import.
const CREDIT_BATCH: i32 = 32;

fn main() {
    let filter = std::env::var("SPYGLASS_LOG_LEVEL").unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") || args.is_empty() {
        usage();
        std::process::exit(if args.is_empty() { 2 } else { 0 });
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("spyglass {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }
    match run(&args) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn usage() {
    eprintln!("Usage:");
    eprintln!("  spyglass import json [--dir=PATH] [--slice-size=N]");
    eprintln!("  spyglass export json [--dir=PATH] <expression>");
    eprintln!("  spyglass status [--dir=PATH]");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  SPYGLASS_DIR        default state directory");
    eprintln!("  SPYGLASS_LOG_LEVEL  log filter (error, warn, info, debug, trace)");
}

fn run(args: &[String]) -> Result<()> {
    match args[0].as_str() {
        "import" => import(&args[1..]),
        "export" => export(&args[1..]),
        "status" => status(&args[1..]),
        other => Err(Error::InvalidArgument(format!("unknown command: {other}"))),
    }
}

// -- Argument helpers -----------------------------------------------------

fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    args.iter()
        .find_map(|a| a.strip_prefix(&prefix).map(str::to_string))
}

fn state_dir(args: &[String]) -> PathBuf {
    flag_value(args, "--dir")
        .or_else(|| std::env::var("SPYGLASS_DIR").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn check_format(args: &[String]) -> Result<()> {
    match args.first().map(String::as_str) {
        Some("json") => Ok(()),
        Some(other) => Err(Error::InvalidArgument(format!("unknown format: {other}"))),
        None => Err(Error::InvalidArgument("missing format argument".into())),
    }
}

// -- Layout inference -----------------------------------------------------

fn infer_type(name: &str, value: &serde_json::Value) -> Type {
    match value {
        serde_json::Value::Bool(_) => Type::Bool,
        serde_json::Value::Number(n) => {
            if n.is_i64() {
                if name == "ts" || name == "timestamp" {
                    Type::Time
                } else {
                    Type::Integer
                }
            } else if n.is_u64() {
                Type::Count
            } else {
                Type::Real
            }
        }
        serde_json::Value::String(s) => {
            if s.parse::<spyglass::value::Address>().is_ok() {
                Type::Address
            } else if s.contains('/') && s.parse::<spyglass::value::Subnet>().is_ok() {
                Type::Subnet
            } else if s.contains('/') && s.parse::<spyglass::value::Port>().is_ok() {
                Type::Port
            } else {
                Type::String
            }
        }
        serde_json::Value::Array(xs) => {
            let element = xs
                .first()
                .map(|x| infer_type("", x))
                .unwrap_or(Type::String);
            Type::Vector(Box::new(element))
        }
        serde_json::Value::Object(fields) => Type::Record(infer_record("record", fields)),
        serde_json::Value::Null => Type::String,
    }
}

fn infer_record(name: &str, fields: &serde_json::Map<String, serde_json::Value>) -> RecordType {
    let fields = fields
        .iter()
        .map(|(key, value)| {
            let ty = infer_type(key, value);
            let mut field = Field::new(key.clone(), ty);
            if matches!(field.ty, Type::Time) {
                field = field.with_attributes(vec![Attribute::flag(ATTR_TIMESTAMP)]);
            }
            field
        })
        .collect();
    RecordType::new(name, fields)
}

/// Convert a JSON value to the expected column type; mismatches become
/// nil rather than aborting the import.
fn convert(ty: &Type, value: Option<&serde_json::Value>) -> Value {
    let Some(value) = value else { return Value::Nil };
    match (ty, value) {
        (_, serde_json::Value::Null) => Value::Nil,
        (Type::Bool, serde_json::Value::Bool(b)) => Value::Bool(*b),
        (Type::Integer, serde_json::Value::Number(n)) => {
            n.as_i64().map(Value::Integer).unwrap_or(Value::Nil)
        }
        (Type::Count, serde_json::Value::Number(n)) => {
            n.as_u64().map(Value::Count).unwrap_or(Value::Nil)
        }
        (Type::Real, serde_json::Value::Number(n)) => {
            n.as_f64().map(Value::real).unwrap_or(Value::Nil)
        }
        (Type::Time, serde_json::Value::Number(n)) => {
            n.as_i64().map(Value::Time).unwrap_or(Value::Nil)
        }
        (Type::Duration, serde_json::Value::Number(n)) => {
            n.as_i64().map(Value::Duration).unwrap_or(Value::Nil)
        }
        (Type::Address, serde_json::Value::String(s)) => {
            s.parse().map(Value::Address).unwrap_or(Value::Nil)
        }
        (Type::Subnet, serde_json::Value::String(s)) => {
            s.parse().map(Value::Subnet).unwrap_or(Value::Nil)
        }
        (Type::Port, serde_json::Value::String(s)) => {
            s.parse().map(Value::Port).unwrap_or(Value::Nil)
        }
        (Type::String, serde_json::Value::String(s)) => Value::String(s.clone()),
        (Type::Vector(element), serde_json::Value::Array(xs)) => {
            Value::Vector(xs.iter().map(|x| convert(element, Some(x))).collect())
        }
        _ => Value::Nil,
    }
}

/// Fetch the JSON value at a dot-joined field path.
fn at_path<'a>(
    record: &'a serde_json::Map<String, serde_json::Value>,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// -- import ---------------------------------------------------------------

fn import(args: &[String]) -> Result<()> {
    check_format(args)?;
    let dir = state_dir(args);
    let slice_size: u64 = match flag_value(args, "--slice-size") {
        Some(v) => v
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad slice size: {v}")))?,
        None => DEFAULT_SLICE_SIZE,
    };
    if slice_size == 0 {
        return Err(Error::InvalidArgument("slice size must be positive".into()));
    }

    let mut store = SegmentStore::new(&dir, DEFAULT_SEGMENT_SIZE, IN_MEMORY_SEGMENTS)?;
    let mut meta = MetaIndex::load_or_default(&dir.join("index").join("meta"), SynopsisFactory::standard());
    let mut partition = Partition::new(Uuid::new_v4(), IndexFactory::standard());

    let consensus = Arc::new(LocalConsensus::new(dir.join("importer").join("counter")));
    let (sink, stamped) = crossbeam_channel::unbounded::<Arc<TableSlice>>();
    let mut config = ImporterConfig::new(dir.join("importer"));
    config.max_table_slice_size = slice_size;
    let importer = Importer::spawn(config, consensus, vec![sink])?;

    let mut builder: Option<TableSliceBuilder> = None;
    // Flattened leaf fields of the inferred layout, fixed after the
    // first record.
    let mut leaf_fields: Vec<Field> = Vec::new();
    let mut pending: Vec<TableSlice> = Vec::new();
    let mut credit: i32 = 0;
    let mut events: u64 = 0;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: serde_json::Value = serde_json::from_str(&line)
            .map_err(|e| Error::InvalidArgument(format!("bad input record: {e}")))?;
        let Some(object) = record.as_object() else {
            return Err(Error::InvalidArgument(
                "input records must be JSON objects".into(),
            ));
        };
        let builder = builder.get_or_insert_with(|| {
            let b = TableSliceBuilder::new(&infer_record("event", object));
            leaf_fields = b.layout().fields.clone();
            b
        });
        for field in &leaf_fields {
            builder.append(convert(&field.ty, at_path(object, &field.name)))?;
        }
        if builder.rows() as u64 >= slice_size {
            pending.push(builder.finish());
        }
        drain_and_apply(
            &stamped,
            &mut store,
            &mut meta,
            &mut partition,
            &mut events,
        )?;
        flush_pending(&importer, &mut pending, &mut credit, false)?;
    }
    if let Some(mut b) = builder.take() {
        let tail = b.finish();
        if tail.rows() > 0 {
            pending.push(tail);
        }
    }
    flush_pending(&importer, &mut pending, &mut credit, true)?;
    importer.exit();
    drain_and_apply(
        &stamped,
        &mut store,
        &mut meta,
        &mut partition,
        &mut events,
    )?;

    store.flush()?;
    meta.save(&dir.join("index").join("meta"))?;
    partition.save(&dir.join("index").join(partition.id().to_string()))?;
    eprintln!("imported {events} events into partition {}", partition.id());
    Ok(())
}

/// Push pending slices downstream under granted credit. With `block`,
/// keep retrying until everything is sent.
fn flush_pending(
    importer: &Importer,
    pending: &mut Vec<TableSlice>,
    credit: &mut i32,
    block: bool,
) -> Result<()> {
    loop {
        if pending.is_empty() {
            return Ok(());
        }
        if *credit == 0 {
            *credit = importer.request_credit(CREDIT_BATCH.max(pending.len() as i32))?;
            if *credit == 0 {
                if !block && pending.len() < CREDIT_BATCH as usize {
                    return Ok(());
                }
                // Replenishment is in flight; IDs arrive shortly.
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
        }
        let take = (*credit as usize).min(pending.len());
        let batch: Vec<TableSlice> = pending.drain(..take).collect();
        *credit -= take as i32;
        importer.send_batch(batch)?;
    }
}

fn drain_and_apply(
    stamped: &crossbeam_channel::Receiver<Arc<TableSlice>>,
    store: &mut SegmentStore,
    meta: &mut MetaIndex,
    partition: &mut Partition,
    events: &mut u64,
) -> Result<()> {
    for slice in stamped.try_iter() {
        *events += slice.rows();
        store.put(slice.clone())?;
        meta.add(partition.id(), &slice);
        partition.add(&slice)?;
    }
    Ok(())
}

// -- export ---------------------------------------------------------------

fn export(args: &[String]) -> Result<()> {
    check_format(args)?;
    let dir = state_dir(args);
    let expression: Vec<&String> = args[1..]
        .iter()
        .filter(|a| !a.starts_with("--"))
        .collect();
    if expression.is_empty() {
        return Err(Error::InvalidArgument("missing query expression".into()));
    }
    let text = expression
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let expr = Expression::parse(&text)?;

    let index_dir = dir.join("index");
    let meta = MetaIndex::load_or_default(&index_dir.join("meta"), SynopsisFactory::standard());
    let store = SegmentStore::new(&dir, DEFAULT_SEGMENT_SIZE, IN_MEMORY_SEGMENTS)?;

    // Candidate partitions, then candidate IDs per partition. A failing
    // partition is skipped with a warning rather than failing the query.
    let mut ids = Bitmap::new();
    for candidate in meta.lookup(&expr) {
        let path = index_dir.join(candidate.to_string());
        let partition = match Partition::load(&path, IndexFactory::standard()) {
            Ok(p) => p,
            Err(e) => {
                warn!(partition = %candidate, error = %e, "skipping unreadable partition");
                continue;
            }
        };
        match partition.lookup(&expr) {
            Ok(hits) => ids |= &hits,
            Err(e) => {
                warn!(partition = %candidate, error = %e, "skipping partition after index lookup failure");
            }
        }
    }

    use std::io::Write;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for slice in store.extract(&ids) {
        let slice = match slice {
            Ok(slice) => slice,
            Err(e) => {
                warn!(error = %e, "skipping unreadable segment");
                continue;
            }
        };
        let row_type = Type::Record(slice.layout().clone());
        for row in 0..slice.rows() as usize {
            if !ids.get(slice.offset() + row as u64) {
                continue;
            }
            if !expr.matches_event(slice.layout(), slice.row(row)) {
                continue;
            }
            let value = Value::Vector(slice.row(row).to_vec());
            let json = to_json_typed(&value, &row_type);
            writeln!(out, "{json}")?;
        }
    }
    Ok(())
}

// -- status ---------------------------------------------------------------

fn status(args: &[String]) -> Result<()> {
    let dir = state_dir(args);
    let store = SegmentStore::new(&dir, DEFAULT_SEGMENT_SIZE, IN_MEMORY_SEGMENTS)?;
    let index_dir = dir.join("index");
    let meta = MetaIndex::load_or_default(&index_dir.join("meta"), SynopsisFactory::standard());
    let available_ids = std::fs::read_to_string(dir.join("importer").join("available_ids"))
        .map(|text| {
            text.lines()
                .filter_map(|line| {
                    let mut parts = line.split_whitespace();
                    let first: u64 = parts.next()?.parse().ok()?;
                    let last: u64 = parts.next()?.parse().ok()?;
                    Some(last - first)
                })
                .sum::<u64>()
        })
        .unwrap_or(0);
    let status = serde_json::json!({
        "dir": dir.display().to_string(),
        "store": store.status(),
        "partitions": meta.partitions(),
        "importer": { "available-ids": available_ids },
    });
    print_flat("", &status);
    Ok(())
}

fn print_flat(prefix: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(fields) => {
            for (key, inner) in fields {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                print_flat(&path, inner);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, inner) in items.iter().enumerate() {
                print_flat(&format!("{prefix}[{i}]"), inner);
            }
        }
        other => println!("{prefix}: {other}"),
    }
}
