//! `ocrd-batch` — parallel OCR over files and directories.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use ocrd::batch::{self, BatchOptions, DiscoveryOptions};
use ocrd::pipeline::Engine;
use ocrd::{output, parse_memory_limit, Pipeline, PipelineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Csv,
}

#[derive(Debug, Parser)]
#[command(name = "ocrd-batch", version, about = "Run OCR over files and directories")]
struct Args {
    /// Files or directories to process.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Walk directories recursively.
    #[arg(long)]
    recursive: bool,

    /// Basename globs a file must match, comma separated.
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Basename globs that skip a file, comma separated.
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Worker threads; 0 uses one per CPU.
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Output file; stdout when omitted.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write `<stem>_overlay.png` per image into this directory.
    #[arg(long)]
    overlay_dir: Option<PathBuf>,

    /// Minimum detection confidence a region must reach.
    #[arg(long, default_value_t = 0.0)]
    confidence: f64,

    /// Minimum recognition confidence a region must reach.
    #[arg(long, default_value_t = 0.0)]
    min_rec_conf: f64,

    /// Directory holding model files.
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Recognition language tag.
    #[arg(long, default_value = "en")]
    language: String,

    /// Character dictionaries, comma separated.
    #[arg(long, value_delimiter = ',')]
    dict: Vec<PathBuf>,

    /// Languages whose bundled dictionaries to load, comma separated.
    #[arg(long, value_delimiter = ',')]
    dict_langs: Vec<String>,

    /// Soft memory budget, e.g. `512MB` or `2GB`.
    #[arg(long)]
    memory_limit: Option<String>,

    /// Only log errors.
    #[arg(long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.quiet);

    let mut config = PipelineConfig {
        models_dir: args.models_dir.clone(),
        language: args.language.clone(),
        parallel_workers: args.workers,
        ..PipelineConfig::default()
    };
    config.dictionary_paths = args.dict.clone();
    for lang in &args.dict_langs {
        config
            .dictionary_paths
            .push(PathBuf::from(format!("dicts/{lang}.txt")));
    }
    if let Some(limit) = &args.memory_limit {
        config.memory_limit = parse_memory_limit(limit);
    }

    let paths = batch::discover(
        &args.inputs,
        &DiscoveryOptions {
            recursive: args.recursive,
            include: args.include.clone(),
            exclude: args.exclude.clone(),
        },
    )?;
    if paths.is_empty() {
        anyhow::bail!("no input files matched");
    }

    let pipeline = Pipeline::new(&config).context("building pipeline")?;
    let outcome = batch::process_paths(
        &pipeline,
        &paths,
        &BatchOptions {
            workers: args.workers,
            min_det_confidence: args.confidence,
            min_rec_confidence: args.min_rec_conf,
            overlay_dir: args.overlay_dir.clone(),
        },
    );
    let close_result = pipeline.close();
    let outcome = outcome?;
    close_result.context("closing pipeline")?;

    // Formatters only see the successful items; failures were already
    // logged per image and do not fail the run.
    let labels: Vec<String> = outcome
        .items
        .iter()
        .map(|i| i.path.display().to_string())
        .collect();
    let entries: Vec<(&str, &ocrd::ImageResult)> = outcome
        .items
        .iter()
        .zip(&labels)
        .filter_map(|(item, label)| item.result.as_ref().map(|r| (label.as_str(), r)))
        .collect();

    let rendered = match args.format {
        OutputFormat::Text => output::format_text(&entries),
        OutputFormat::Json => output::format_json(&entries)?,
        OutputFormat::Csv => output::format_csv(&entries)?,
    };

    match &args.output {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(rendered.as_bytes())?;
            if !rendered.ends_with('\n') {
                stdout.write_all(b"\n")?;
            }
        }
    }

    if !args.quiet {
        eprintln!(
            "processed {} files ({} ok, {} failed) with {} workers in {:.2}s",
            outcome.stats.total,
            outcome.stats.succeeded,
            outcome.stats.failed,
            outcome.stats.workers,
            outcome.stats.elapsed.as_secs_f64()
        );
    }
    Ok(())
}

fn init_logging(quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
