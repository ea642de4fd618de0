//! Safetensors inspection tool
//!
//! Prints tensor names, shapes and dtypes of a weight file, e.g. one written
//! by `burn-bench export`.

use std::path::PathBuf;

use anyhow::Context;
use burn_models_convert::SafeTensorFile;
use clap::Parser;

#[derive(Parser)]
#[command(name = "inspect-safetensors")]
#[command(about = "Inspect safetensors files")]
struct Args {
    /// Path to safetensors file
    path: PathBuf,

    /// Filter tensor names (substring match)
    #[arg(short, long)]
    filter: Option<String>,

    /// Show only shapes, not dtypes
    #[arg(long)]
    shapes_only: bool,

    /// Also print the file metadata
    #[arg(long)]
    metadata: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let file = SafeTensorFile::open(&args.path).with_context(|| format!("Failed to open {}", args.path.display()))?;

    let mut names = file.names();
    names.sort();

    println!("File: {}", args.path.display());
    println!("Total tensors: {}\n", file.len());

    if args.metadata {
        let mut metadata: Vec<_> = file.metadata().iter().collect();
        metadata.sort();
        for (key, value) in metadata {
            println!("{key} = {value}");
        }
        println!();
    }

    for name in names {
        if let Some(ref filter) = args.filter {
            if !name.contains(filter) {
                continue;
            }
        }

        let shape = file.shape(name).unwrap_or_default();
        if args.shapes_only {
            println!("{}: {:?}", name, shape);
        } else if let Some(dtype) = file.dtype(name) {
            println!("{}: {:?} ({:?})", name, shape, dtype);
        }
    }

    Ok(())
}
