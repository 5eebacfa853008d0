//=====================================================
// File: bin/marine_disasm.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript image disassembler
// Objective: Print the metadata, globals, namespace table and instruction listing of
//            a binary image without binding it to a host
//=====================================================

use std::collections::BTreeMap;
use std::{env, fs};

use anyhow::{Context, Result, anyhow};
use marinescript::image::{self, DecodeOptions};

fn main() -> Result<()> {
    let mut trusted = false;
    let mut input = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--trusted" => trusted = true,
            _ => input = Some(arg),
        }
    }
    let input = input.ok_or_else(|| anyhow!("no input file provided"))?;
    let data = fs::read(&input).with_context(|| format!("failed to read {input}"))?;
    let program = image::read(&data, DecodeOptions { trusted })
        .map_err(|err| anyhow!("image error: {err}"))?;

    for (key, value) in &program.metadata {
        println!("; {key} = {value}");
    }
    for (slot, name) in program.globals.iter().enumerate() {
        println!("global {slot}: {name}");
    }

    let mut headers = BTreeMap::new();
    for (path, name, entry) in program.namespaces.functions() {
        let qualified = if path.is_empty() {
            name
        } else {
            format!("{}.{}", path.join("."), name)
        };
        headers.insert(entry.offset, (qualified, entry.arity));
    }

    for (offset, instruction) in program.instructions.iter().enumerate() {
        if let Some((name, arity)) = headers.get(&offset) {
            println!();
            println!("function {name} (arity {arity}):");
        }
        println!("  {offset:04}: {instruction}");
    }

    Ok(())
}

//=====================================================
// End of file
//=====================================================
