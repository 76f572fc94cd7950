//! Background-removal worker
//!
//! Reads a raw photo on stdin and writes the cleaned PNG to stdout, or
//! reads and writes the files named as `<input> [output]` instead.
//! Exit status 0 on success, 1 on failure with the reason on stderr.
//! Usable as the `subprocess` processor:
//!
//! ```toml
//! [processor]
//! kind = "subprocess"
//! program = "idcard-photo-worker"
//! args = ["--max-dimension", "{max_dimension}", "--canvas-color", "{canvas_color}"]
//! ```

use anyhow::Context;
use clap::Parser;
use idcard_photo::processor::{clean_photo, BorderKeySegmenter, ProcessOptions};
use idcard_photo::CanvasColor;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "idcard-photo-worker")]
#[command(about = "Remove the background of a photo")]
struct Args {
    /// Raw photo to read instead of stdin
    input: Option<PathBuf>,

    /// Where to write the PNG instead of stdout
    output: Option<PathBuf>,

    /// Neither side of the output exceeds this many pixels
    #[arg(long, default_value_t = 800)]
    max_dimension: u32,

    /// Canvas colour as #rrggbb or #rrggbbaa
    #[arg(long, default_value = "#eff6ffff")]
    canvas_color: CanvasColor,

    /// Colour distance treated as pure backdrop
    #[arg(long, default_value_t = 40.0)]
    tolerance: f32,

    /// Width of the soft edge above the tolerance
    #[arg(long, default_value_t = 30.0)]
    feather: f32,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let input = match &args.input {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut input = Vec::new();
            std::io::stdin().lock().read_to_end(&mut input)?;
            input
        }
    };
    if input.is_empty() {
        anyhow::bail!("no input photo");
    }

    let options = ProcessOptions {
        max_dimension: args.max_dimension,
        canvas_color: args.canvas_color,
    };
    let segmenter = BorderKeySegmenter {
        tolerance: args.tolerance,
        feather: args.feather,
        ..Default::default()
    };

    let output = clean_photo(&input, &options, &segmenter)?;
    drop(input);

    match &args.output {
        Some(path) => std::fs::write(path, &output)
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&output)?;
            stdout.flush()?;
        }
    }

    debug!(size = output.len(), "Wrote cleaned photo");
    Ok(())
}

fn main() -> ExitCode {
    // stdout carries image bytes; logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("idcard-photo-worker: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
