use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bananagen_contracts::batch::{format_duration, write_summary};
use bananagen_contracts::events::EventWriter;
use bananagen_contracts::request::{
    AspectRatio, GenerationRequest, ResolutionTier, ResponseFormat, ServiceConfig,
};
use bananagen_engine::{
    resize_to_max_dimension, GenerationClient, RateLimiter, ResampleMethod,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use image::DynamicImage;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

const API_KEY_ENV: &str = "BANANAGEN_API_KEY";

#[derive(Debug, Parser)]
#[command(name = "bananagen", version, about = "Image generation client and batch runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one image (or several in parallel) from a single prompt.
    Generate(GenerateArgs),
    /// Run a paced batch over a file of prompts, one request at a time.
    Batch(BatchArgs),
}

#[derive(Debug, Args)]
struct ConnectionArgs {
    /// Bearer credential; falls back to $BANANAGEN_API_KEY.
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    proxy: Option<String>,
    /// Origin (scheme://host[:port]) whose certificate is accepted unverified.
    /// Repeatable. Everything not listed is verified normally.
    #[arg(long = "insecure-origin")]
    insecure_origins: Vec<String>,
}

#[derive(Debug, Args)]
struct RenderArgs {
    #[arg(long, default_value = "gemini-2.5-flash-image")]
    model: String,
    /// One of 1:1, 2:3, 3:2, 3:4, 4:3, 4:5, 5:4, 9:16, 16:9, 21:9.
    #[arg(long, default_value = "1:1")]
    aspect: String,
    /// Output tier: 1K, 2K, or 4K.
    #[arg(long, default_value = "2K")]
    size: String,
    /// Reference image file, repeatable (at most nine).
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    #[arg(long)]
    seed: Option<i64>,
    /// Advisory encoding preference: b64_json or url.
    #[arg(long, default_value = "b64_json")]
    response_format: String,
    /// Shrink saved images so the longer side is at most this many pixels.
    #[arg(long)]
    max_dim: Option<u32>,
    /// nearest, bilinear, bicubic, box, hamming, or lanczos.
    #[arg(long, default_value = "lanczos")]
    resample: String,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    /// Parallel attempts for this one prompt; the first success satisfies
    /// the request, extras are saved too.
    #[arg(long, default_value_t = 1)]
    count: usize,
    #[arg(long, default_value = "out")]
    out: PathBuf,
    /// File stem for saved images; collisions get _1, _2, … appended.
    #[arg(long, default_value = "bananagen")]
    name: String,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    connection: ConnectionArgs,
    #[command(flatten)]
    render: RenderArgs,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    /// Text file with one prompt per line; blank lines and #-comments skipped.
    #[arg(long)]
    prompts: PathBuf,
    /// Baseline seconds between requests; widens automatically on throttling.
    #[arg(long, default_value_t = 2.0)]
    interval: f64,
    #[arg(long, default_value = "out")]
    out: PathBuf,
    #[arg(long, default_value = "bananagen")]
    name: String,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Where to write the final summary JSON; defaults to OUT/summary.json.
    #[arg(long)]
    summary: Option<PathBuf>,
    #[command(flatten)]
    connection: ConnectionArgs,
    #[command(flatten)]
    render: RenderArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("bananagen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Batch(args) => run_batch(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = build_config(&args.connection)?;
    let client = GenerationClient::new(config)?;
    let request = build_request(&args.render, &args.prompt)?;
    let resample: ResampleMethod = args.render.resample.parse()?;

    let run_id = new_run_id();
    let events = args
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, run_id.clone()));
    if let Some(events) = &events {
        events.emit_value(
            "run_started",
            json!({
                "prompt": request.prompt,
                "model": request.model,
                "count": args.count.max(1),
                "seed": request.seed,
            }),
        )?;
    }

    let outcome = client.generate_many(&request, args.count)?;
    for warning in &outcome.warnings {
        eprintln!("bananagen: warning: {warning}");
        if let Some(events) = &events {
            events.emit_value("attempt_failed", json!({"warning": warning}))?;
        }
    }

    for (index, image) in outcome.images.into_iter().enumerate() {
        let image = maybe_resize(image, args.render.max_dim, resample);
        let path = save_image(&args.out, &args.name, &image)?;
        eprintln!("bananagen: saved {}", path.display());
        if let Some(events) = &events {
            events.emit_value(
                "artifact_saved",
                json!({
                    "index": index,
                    "path": path.display().to_string(),
                    "sha256": file_digest(&path)?,
                }),
            )?;
        }
    }
    Ok(0)
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let config = build_config(&args.connection)?;
    let client = GenerationClient::new(config)?;
    let resample: ResampleMethod = args.render.resample.parse()?;

    let text = fs::read_to_string(&args.prompts)
        .with_context(|| format!("failed to read prompts file {}", args.prompts.display()))?;
    let prompts = read_prompts(&text);
    if prompts.is_empty() {
        bail!("prompts file {} contains no prompts", args.prompts.display());
    }
    let requests = prompts
        .iter()
        .map(|prompt| build_request(&args.render, prompt))
        .collect::<Result<Vec<_>>>()?;

    if args.interval < 0.0 {
        bail!("--interval must be non-negative");
    }
    let mut limiter = RateLimiter::new(Duration::from_secs_f64(args.interval));

    let run_id = new_run_id();
    let events = args
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, run_id.clone()));
    if let Some(events) = &events {
        events.emit_value(
            "batch_started",
            json!({
                "total": requests.len(),
                "model": args.render.model,
                "interval_secs": args.interval,
            }),
        )?;
    }

    let outcome = client.run_batch(&requests, &mut limiter, |progress, eta| {
        let eta_text = eta.map(|eta| format!(", ~{eta} left")).unwrap_or_default();
        eprintln!(
            "bananagen: {}/{} processed ({} ok, {} failed){eta_text}",
            progress.processed, progress.total, progress.succeeded, progress.failed
        );
        if let Some(events) = &events {
            // the progress callback cannot propagate, so surface write faults here
            if let Err(err) = events.emit_value(
                "batch_progress",
                json!({
                    "processed": progress.processed,
                    "total": progress.total,
                    "succeeded": progress.succeeded,
                    "failed": progress.failed,
                    "eta": eta,
                }),
            ) {
                eprintln!("bananagen: could not record progress event: {err:#}");
            }
        }
    })?;

    for (index, err) in &outcome.failures {
        eprintln!("bananagen: prompt #{index} failed: {err}");
        if let Some(events) = &events {
            events.emit_value(
                "item_failed",
                json!({"index": index, "error": err.to_string()}),
            )?;
        }
    }

    for (index, image) in outcome.images.into_iter() {
        let image = maybe_resize(image, args.render.max_dim, resample);
        let stem = format!("{}_{index:03}", args.name);
        let path = save_image(&args.out, &stem, &image)?;
        eprintln!("bananagen: saved {}", path.display());
        if let Some(events) = &events {
            events.emit_value(
                "artifact_saved",
                json!({
                    "index": index,
                    "path": path.display().to_string(),
                    "sha256": file_digest(&path)?,
                }),
            )?;
        }
    }

    let summary = outcome.summary;
    let summary_path = args
        .summary
        .clone()
        .unwrap_or_else(|| args.out.join("summary.json"));
    let mut extra = Map::new();
    extra.insert("run_id".to_string(), Value::String(run_id));
    extra.insert(
        "out_dir".to_string(),
        Value::String(args.out.display().to_string()),
    );
    write_summary(&summary_path, &summary, Some(&extra))?;
    eprintln!(
        "bananagen: batch done: {}/{} succeeded in {}",
        summary.succeeded,
        summary.total,
        format_duration(summary.elapsed_secs)
    );
    Ok(if summary.failed > 0 { 2 } else { 0 })
}

fn build_config(connection: &ConnectionArgs) -> Result<ServiceConfig> {
    let api_key = match &connection.api_key {
        Some(key) if !key.trim().is_empty() => key.clone(),
        _ => match env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("no API key: pass --api-key or set {API_KEY_ENV}"),
        },
    };
    let mut config = ServiceConfig::new(api_key);
    if let Some(base_url) = &connection.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(proxy) = &connection.proxy {
        config = config.with_proxy(proxy);
    }
    for origin in &connection.insecure_origins {
        config = config.with_insecure_origin(origin);
    }
    Ok(config)
}

fn build_request(render: &RenderArgs, prompt: &str) -> Result<GenerationRequest> {
    let aspect: AspectRatio = render.aspect.parse()?;
    let resolution: ResolutionTier = render.size.parse()?;
    let response_format: ResponseFormat = render.response_format.parse()?;

    let mut request = GenerationRequest::new(prompt, render.model.clone());
    request.aspect_ratio = aspect;
    request.resolution = resolution;
    request.response_format = response_format;
    request.seed = render.seed;
    for path in &render.references {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read reference image {}", path.display()))?;
        request.reference_images.push(bytes);
    }
    request.validate()?;
    Ok(request)
}

fn read_prompts(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn maybe_resize(image: DynamicImage, max_dim: Option<u32>, method: ResampleMethod) -> DynamicImage {
    match max_dim {
        Some(dim) if dim > 0 => resize_to_max_dimension(&image, dim, method),
        _ => image,
    }
}

/// Saves as PNG under `dir`, appending `_1`, `_2`, … when the name is taken.
fn save_image(dir: &Path, stem: &str, image: &DynamicImage) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let mut candidate = dir.join(format!("{stem}.png"));
    let mut counter = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{counter}.png"));
        counter += 1;
    }
    image
        .save(&candidate)
        .with_context(|| format!("failed to write {}", candidate.display()))?;
    Ok(candidate)
}

fn file_digest(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read back {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

fn new_run_id() -> String {
    format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}
