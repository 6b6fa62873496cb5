use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use framepipe::observability::log_snapshot;
use framepipe::pipeline::{PipelineContext, build_pipeline, build_stages};
use framepipe::recipe::Recipe;
use framepipe::sink::{FileSink, MemorySink, Sink};
use framepipe::stages::default_registry;
use framepipe::validation::validate_recipe;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run {
            recipe,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            report,
        } => run_recipe(
            &recipe,
            RunOutputs {
                print_metrics,
                metrics_json,
                metrics_prometheus,
                report,
            },
        ),
        Commands::Plan { recipe } => plan_recipe(&recipe),
        Commands::Validate { recipe } => validate_recipe_cmd(&recipe),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct RunOutputs {
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    report: Option<PathBuf>,
}

fn recipe_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn load_valid_recipe(path: &Path) -> Result<Recipe> {
    let recipe = Recipe::load(path)?;
    let report = validate_recipe(&recipe, default_registry());
    for warning in &report.warnings {
        warn!(recipe = %path.display(), "{warning}");
    }
    if !report.is_ok() {
        for message in &report.errors {
            error!(recipe = %path.display(), "{message}");
        }
        bail!(
            "Recipe '{}' is invalid ({} error(s))",
            path.display(),
            report.errors.len()
        );
    }
    Ok(recipe)
}

fn run_recipe(recipe_path: &Path, outputs: RunOutputs) -> Result<()> {
    let recipe = load_valid_recipe(recipe_path)?;
    let base = recipe_dir(recipe_path);
    let mut source = recipe.open_source(&base)?;

    let pipeline = build_pipeline(
        default_registry(),
        &recipe.pipeline,
        &recipe.to_config(),
        source.frame_info(),
    )?;
    let metrics = pipeline.metrics();

    let mut sink: Box<dyn Sink> = match &recipe.output {
        Some(output) => {
            let path = if output.path.is_absolute() {
                output.path.clone()
            } else {
                base.join(&output.path)
            };
            Box::new(
                FileSink::create(&path)
                    .with_context(|| format!("Failed to create output: {}", path.display()))?,
            )
        }
        None => Box::new(MemorySink::new()),
    };

    let report = pipeline.run(source.as_mut(), sink.as_mut())?;
    info!(
        delivered = report.tasks_delivered,
        bytes = report.sink.bytes,
        sha256 = report.sink.sha256.as_deref().unwrap_or("-"),
        "Run completed"
    );
    println!(
        "{} unit(s), {} byte(s) from {} frame(s)",
        report.tasks_delivered, report.sink.bytes, report.frames_read
    );

    if let Some(path) = outputs.report {
        ensure_parent(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        to_writer_pretty(file, &report)
            .with_context(|| format!("Failed to write report JSON: {}", path.display()))?;
        info!(report = %path.display(), "Run report written");
    }

    if outputs.print_metrics || outputs.metrics_json.is_some() || outputs.metrics_prometheus.is_some()
    {
        let snapshot = metrics.snapshot();
        if outputs.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = outputs.metrics_json {
            ensure_parent(&path)?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = outputs.metrics_prometheus {
            ensure_parent(&path)?;
            fs::write(&path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    Ok(())
}

fn plan_recipe(recipe_path: &Path) -> Result<()> {
    let recipe = load_valid_recipe(recipe_path)?;
    let stages = build_stages(default_registry(), &recipe.pipeline)?;
    let ctx = PipelineContext::prepare(&stages, &recipe.to_config())?;
    println!("async depth: {}", ctx.depth);
    println!("bitstream buffer: {} bytes", ctx.bitstream_bytes);
    for boundary in &ctx.plan.boundaries {
        println!(
            "{}: {} surface(s) (reserve {})",
            boundary.name, boundary.size, boundary.reserve
        );
    }
    println!("total surfaces: {}", ctx.plan.total_surfaces());
    Ok(())
}

fn validate_recipe_cmd(recipe_path: &Path) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let report = validate_recipe(&recipe, default_registry());

    for warning in &report.warnings {
        warn!(recipe = %recipe_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(recipe = %recipe_path.display(), "Recipe validated successfully");
        println!("Recipe '{}' is valid", recipe_path.display());
        Ok(())
    } else {
        for message in &report.errors {
            error!(recipe = %recipe_path.display(), "{message}");
            eprintln!("error: {message}");
        }
        bail!("Recipe validation failed")
    }
}

fn list_stages() {
    for name in default_registry().known_stages() {
        println!("{name}");
    }
}

#[derive(Parser)]
#[command(
    name = "framepipe",
    version,
    about = "Media transcoding pipeline driver"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a recipe to completion.
    Run {
        recipe: PathBuf,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        /// Write the run report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the surface pool plan without running.
    Plan { recipe: PathBuf },
    Validate { recipe: PathBuf },
    ListStages,
}
