//=====================================================
// File: main.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript command-line runner
// Objective: Load a JSON program or a binary image, run one entry function and
//            print every value it yields or returns
//=====================================================

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Parser as ClapParser;
use tracing_subscriber::EnvFilter;

use marinescript::ast::ProgramUnit;
use marinescript::config::flag_enabled;
use marinescript::host::stdlib::register_stdlib;
use marinescript::image::DecodeOptions;
use marinescript::{Marine, MarineError, RunOutcome, RuntimeOptions, Value};

#[derive(Debug, ClapParser)]
#[command(
    name = "marinescript",
    about = "Runs MarineScript programs (.json units) or compiled images (.mrn).",
    version
)]
struct Args {
    /// Path to a JSON program unit (or array of units) or a binary image.
    program: PathBuf,

    /// Entry function to run.
    #[arg(long, default_value = "main")]
    entry: String,

    /// Dotted namespace of the entry function, e.g. `app.tools`.
    #[arg(long)]
    namespace: Option<String>,

    /// Enable instruction tracing (equivalent to setting MARINE_TRACE=1).
    #[arg(long)]
    trace: bool,

    /// marine.toml with a `[runtime]` section.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Arguments passed to the entry function. Ints, floats and booleans are
    /// recognised; anything else is passed as a string.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let trace = args.trace || trace_from_env();
    init_tracing(trace);

    let mut options = match &args.config {
        Some(path) => RuntimeOptions::load(path)?,
        None => RuntimeOptions::default(),
    };
    if trace {
        options.trace = true;
    }

    let mut marine = Marine::with_options(options);
    register_stdlib(marine.registry());

    match file_kind(&args.program) {
        Some(FileKind::Units) => {
            for unit in read_units(&args.program)? {
                marine.load_unit(unit);
            }
            marine
                .compile()
                .map_err(|err| anyhow!("compile error: {err}"))?;
        }
        Some(FileKind::Image) => {
            let bytes = fs::read(&args.program)
                .with_context(|| format!("failed to read {}", args.program.display()))?;
            marine
                .load_image(&bytes, DecodeOptions::default())
                .map_err(|err| anyhow!("image error: {err}"))?;
        }
        None => {
            return Err(anyhow!(
                "unsupported input extension for {}",
                args.program.display()
            ));
        }
    }

    let namespace: Vec<String> = args
        .namespace
        .as_deref()
        .map(|path| path.split('.').map(str::to_string).collect())
        .unwrap_or_default();
    let call_args = args.args.iter().map(|arg| parse_arg(arg)).collect();

    match marine.run_in(namespace, &args.entry, call_args) {
        Ok(RunOutcome::Value(value)) => {
            print_value(&value);
            Ok(())
        }
        Ok(RunOutcome::Sequence(sequence)) => {
            for item in sequence {
                match item {
                    Ok(value) => print_value(&value),
                    Err(fault) => {
                        eprintln!("{fault}");
                        return Err(anyhow!("runtime error"));
                    }
                }
            }
            Ok(())
        }
        Err(MarineError::Fault(fault)) => {
            eprintln!("{fault}");
            Err(anyhow!("runtime error"))
        }
        Err(err) => Err(err.into()),
    }
}

fn init_tracing(trace: bool) {
    let filter = if trace {
        EnvFilter::new("marinescript=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn trace_from_env() -> bool {
    env::var("MARINE_TRACE")
        .map(|value| flag_enabled(&value))
        .unwrap_or(false)
}

fn read_units(path: &Path) -> Result<Vec<ProgramUnit>> {
    let source =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    ProgramUnit::list_from_json(&source)
        .with_context(|| format!("{} does not hold program units", path.display()))
}

fn parse_arg(raw: &str) -> Value {
    if let Ok(value) = raw.parse::<i64>() {
        return Value::Int(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        return Value::Float(value);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::string(raw),
    }
}

fn print_value(value: &Value) {
    if !matches!(value, Value::Unit) {
        println!("{value}");
    }
}

enum FileKind {
    Units,
    Image,
}

fn file_kind(path: &Path) -> Option<FileKind> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Some(FileKind::Units),
        Some("mrn") => Some(FileKind::Image),
        _ => None,
    }
}

//=====================================================
// End of file
//=====================================================
