use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::{Rgb, RgbImage};
use swatch_contracts::error::InvalidInput;
use swatch_contracts::palette::parse_hex;
use swatch_contracts::settings::{Credentials, RunSettings, DEFAULT_COLORS, DEFAULT_PALETTES};
use swatch_contracts::sources::SourceId;
use swatch_engine::{
    default_source_registry, dryrun_source_registry, PaletteEngine, RunOutcome, SourceRegistry,
    DEFAULT_HTTP_TIMEOUT, DEFAULT_WORKERS,
};

#[derive(Debug, Parser)]
#[command(name = "swatch-rs", version, about = "Stock-photo palette extraction CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Upload(UploadArgs),
    Sources,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "unsplash,pexels,pixabay")]
    sources: String,
    #[arg(long, default_value_t = DEFAULT_COLORS)]
    colors: usize,
    #[arg(long, default_value_t = DEFAULT_PALETTES)]
    palettes: usize,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    #[arg(long, default_value_t = DEFAULT_HTTP_TIMEOUT.as_secs())]
    timeout_seconds: u64,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct UploadArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value_t = DEFAULT_COLORS)]
    colors: usize,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

const SWATCH_CELL_DIM: u32 = 80;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("swatch-rs error: {err:#}");
            let code = if err.downcast_ref::<InvalidInput>().is_some() {
                2
            } else {
                1
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Upload(args) => run_upload(args),
        Command::Sources => run_sources(),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let sources = parse_source_list(&args.sources)?;
    let timeout = Duration::from_secs(args.timeout_seconds.max(1));
    let registry = if args.dryrun {
        dryrun_source_registry()
    } else {
        default_source_registry(&Credentials::from_env(), timeout)
    };

    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = PaletteEngine::new(&args.out, &events_path, registry, timeout, args.workers)?;

    let mut settings = RunSettings::search(args.prompt, sources);
    settings.num_colors = args.colors;
    settings.num_palettes = args.palettes;

    let outcome = engine.run(&settings)?;
    render_outcome(&outcome, &args.out)?;
    Ok(0)
}

fn run_upload(args: UploadArgs) -> Result<i32> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = PaletteEngine::new(
        &args.out,
        &events_path,
        SourceRegistry::new(),
        DEFAULT_HTTP_TIMEOUT,
        1,
    )?;

    let mut settings = RunSettings::upload(&args.image);
    settings.num_colors = args.colors;

    let outcome = engine.run(&settings)?;
    render_outcome(&outcome, &args.out)?;
    Ok(0)
}

fn run_sources() -> Result<i32> {
    let credentials = Credentials::from_env();
    for source in SourceId::ALL {
        let state = if credentials.is_configured(source) {
            "configured".to_string()
        } else {
            format!("missing {}", source.key_env())
        };
        println!(
            "{:<9} min_request={} {}",
            source.name(),
            source.min_request_size(),
            state
        );
    }
    Ok(0)
}

fn render_outcome(outcome: &RunOutcome, out_dir: &Path) -> Result<()> {
    for palette in &outcome.palettes {
        println!("[{}] {}", palette.source, palette.colors.join(" "));
        if let Some(url) = &palette.url {
            println!("    {url}");
        }
        let strip_path = out_dir.join(format!("palette-{:02}.png", palette.position));
        write_palette_strip(&strip_path, &palette.colors)
            .with_context(|| format!("failed writing {}", strip_path.display()))?;
        println!("    saved {}", strip_path.display());
    }
    if outcome.palettes.is_empty() {
        println!("no palettes extracted");
    }
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    println!("report: {}", outcome.report_path.display());
    Ok(())
}

/// One square cell per color, in palette order.
fn write_palette_strip(path: &Path, colors: &[String]) -> Result<()> {
    let parsed: Vec<[u8; 3]> = colors.iter().filter_map(|color| parse_hex(color)).collect();
    if parsed.is_empty() {
        bail!("palette has no renderable colors");
    }
    let mut canvas = RgbImage::new(SWATCH_CELL_DIM * parsed.len() as u32, SWATCH_CELL_DIM);
    for (x, _y, pixel) in canvas.enumerate_pixels_mut() {
        let cell = (x / SWATCH_CELL_DIM) as usize;
        *pixel = Rgb(parsed[cell]);
    }
    canvas.save(path)?;
    Ok(())
}

fn parse_source_list(raw: &str) -> Result<Vec<SourceId>> {
    let mut sources = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let source: SourceId = part.parse()?;
        if !sources.contains(&source) {
            sources.push(source);
        }
    }
    if sources.is_empty() {
        return Err(InvalidInput::NoSources.into());
    }
    Ok(sources)
}
