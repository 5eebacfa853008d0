//=====================================================
// File: bin/marine_compile.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript image compiler
// Objective: Compile JSON program units against the default host library and
//            write the resulting binary image
//=====================================================

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser as ClapParser;

use marinescript::Marine;
use marinescript::ast::ProgramUnit;
use marinescript::host::stdlib::register_stdlib;
use marinescript::image::EncodeOptions;

#[derive(Debug, ClapParser)]
#[command(
    name = "marine_compile",
    about = "Compiles MarineScript program units (.json) into a binary image (.mrn).",
    version
)]
struct Args {
    /// JSON program unit or array of units.
    input: PathBuf,

    /// Output path; defaults to the input path with a `.mrn` extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Omit the header and metadata. Such images can only be loaded as trusted.
    #[arg(long)]
    compact: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let source = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let units = ProgramUnit::list_from_json(&source)
        .with_context(|| format!("{} does not hold program units", args.input.display()))?;

    let mut marine = Marine::new();
    register_stdlib(marine.registry());
    for unit in units {
        marine.load_unit(unit);
    }
    marine
        .compile()
        .map_err(|err| anyhow!("compile error: {err}"))?;
    let bytes = marine.encode_image(EncodeOptions {
        compact: args.compact,
    })?;

    let output = args
        .output
        .unwrap_or_else(|| args.input.with_extension("mrn"));
    fs::write(&output, &bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}

//=====================================================
// End of file
//=====================================================
