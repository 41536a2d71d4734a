use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};

use bikeclf::artifacts;
use bikeclf::classifier::{Classifier, GeminiBackend, IssueCategory, RelevanceLabel};
use bikeclf::config::{self, dotenv_candidates, resolve_model, AppConfig, TaskPaths, SUPPORTED_MODELS};
use bikeclf::dataset::Dataset;
use bikeclf::metrics::Metrics;
use bikeclf::prompts::PromptStore;
use bikeclf::remote::{self, PipelineModel, PipelineOptions, RemotePipeline, Screening, SupabaseStore};
use bikeclf::report;
use bikeclf::runner::{EvaluationRunner, RunSettings};
use bikeclf::sql;
use bikeclf::telemetry;

#[derive(Parser)]
#[command(author, version, about = "Bike relevance and bike issue classification for service reports", long_about = None)]
struct Cli {
    /// Which classifier to use
    #[arg(long, value_enum, default_value_t = Task::Relevance, global = true)]
    task: Task,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Task {
    /// Is the report about cycling? (true / false / uncertain)
    Relevance,
    /// Which kind of bike issue is it? (9 categories)
    Category,
}

#[derive(Subcommand)]
enum Command {
    /// Run an evaluation over a gold dataset
    Evaluate {
        /// Gold dataset (.csv or .jsonl)
        #[arg(short, long)]
        dataset: PathBuf,
        /// Prompt version, e.g. v001
        #[arg(short, long)]
        prompt: String,
        /// Model id (defaults per task)
        #[arg(short, long)]
        model: Option<String>,
        /// Sampling temperature (0.0 for determinism)
        #[arg(short, long, default_value_t = config::DEFAULT_TEMPERATURE)]
        temperature: f32,
        #[arg(long, default_value_t = config::DEFAULT_MAX_OUTPUT_TOKENS)]
        max_tokens: u32,
    },
    /// List available prompt versions
    ListPrompts,
    /// List supported models
    ListModels,
    /// Compare the predictions of two runs
    Diff {
        /// First run directory or predictions.jsonl
        run_a: PathBuf,
        /// Second run directory or predictions.jsonl
        run_b: PathBuf,
    },
    /// Regenerate the misclassification report of a run
    Report {
        run_dir: PathBuf,
        /// Defaults to misclassifications.md inside the run directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Summarise several runs side by side
    Compare {
        #[arg(required = true)]
        run_dirs: Vec<PathBuf>,
    },
    /// Classify rows of the remote events table and write results back
    Pipeline(PipelineArgs),
    /// Turn a predictions file into SQL UPDATE statements
    ExportSql {
        #[arg(long)]
        predictions: PathBuf,
        #[arg(long, default_value = "migrations/update_bike_classifications.sql")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// Prompt version (not needed with --prefilter-only)
    #[arg(short, long)]
    prompt: Option<String>,
    #[arg(short, long)]
    model: Option<String>,
    #[arg(short, long, default_value_t = config::DEFAULT_TEMPERATURE)]
    temperature: f32,
    #[arg(long, default_value_t = config::DEFAULT_MAX_OUTPUT_TOKENS)]
    max_tokens: u32,
    /// Rows per fetch (defaults per task)
    #[arg(long)]
    batch_size: Option<usize>,
    /// Pause between model calls
    #[arg(long, default_value_t = 100)]
    sleep_ms: u64,
    /// Stop after this many rows
    #[arg(long)]
    limit: Option<usize>,
    /// Stop after this many batches (counted across resumes)
    #[arg(long)]
    max_batches: Option<usize>,
    /// Only rows that have not been classified yet
    #[arg(long)]
    only_unclassified: bool,
    /// Classify but do not write back
    #[arg(long)]
    dry_run: bool,
    /// Write excluded categories back as not bike related
    #[arg(long)]
    write_prefiltered: bool,
    /// Only write excluded categories, no model calls
    #[arg(long)]
    prefilter_only: bool,
    /// Directory name under the runs directory (needed for --resume)
    #[arg(long)]
    run_name: Option<String>,
    /// Continue from the run's checkpoint
    #[arg(long, requires = "run_name")]
    resume: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let home = std::env::var("BIKECLF_HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
    let mut loaded = Vec::new();
    for candidate in dotenv_candidates(&home) {
        if candidate.exists() {
            dotenvy::from_path(&candidate).with_context(|| format!("Failed to read {:?}", candidate))?;
            loaded.push(candidate);
        }
    }
    bikeclf::init_logger();
    for path in &loaded {
        info!("Loaded environment from {:?}", path);
    }

    let config = AppConfig::from_env()?;
    match cli.task {
        Task::Relevance => run::<RelevanceLabel>(cli.command, &config).await,
        Task::Category => run::<IssueCategory>(cli.command, &config).await,
    }
}

async fn run<L: TaskPaths + Screening>(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::Evaluate {
            dataset,
            prompt,
            model,
            temperature,
            max_tokens,
        } => evaluate::<L>(config, &dataset, &prompt, model.as_deref(), temperature, max_tokens).await,
        Command::ListPrompts => list_prompts::<L>(config),
        Command::ListModels => {
            list_models::<L>();
            Ok(())
        }
        Command::Diff { run_a, run_b } => diff::<L>(&run_a, &run_b),
        Command::Report { run_dir, output } => regenerate_report::<L>(&run_dir, output),
        Command::Compare { run_dirs } => compare::<L>(&run_dirs),
        Command::Pipeline(args) => pipeline::<L>(config, args).await,
        Command::ExportSql { predictions, output } => export_sql::<L>(&predictions, &output),
    }
}

/// Raised once Ctrl-C arrives; workers check it between rows.
fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current row...");
            handler.store(true, Ordering::SeqCst);
        }
    });
    flag
}

fn classifier_for<L: TaskPaths>(config: &AppConfig) -> Result<Classifier<L>> {
    let api_key = config.require_api_key()?;
    let backend = GeminiBackend::new(api_key, config.gemini_base_url.clone(), config.request_timeout)?;
    Ok(Classifier::new(Arc::new(backend)))
}

async fn evaluate<L: TaskPaths>(
    config: &AppConfig,
    dataset_path: &Path,
    prompt_version: &str,
    model: Option<&str>,
    temperature: f32,
    max_tokens: u32,
) -> Result<()> {
    let model = resolve_model(model.unwrap_or(L::DEFAULT_MODEL))?;
    let classifier = classifier_for::<L>(config)?;

    let prompt = PromptStore::new(config.prompts_dir::<L>()).load(prompt_version)?;
    let dataset = Dataset::load::<L, _>(dataset_path)
        .with_context(|| format!("Failed to load dataset {:?}", dataset_path))?;
    info!(
        "Evaluating {} rows with {} / prompt {} ({})",
        dataset.len(),
        model.display_name,
        prompt.version,
        L::TASK
    );

    let runner = EvaluationRunner::<L>::builder()
        .classifier(classifier)
        .prompt(prompt)
        .settings(RunSettings {
            model,
            temperature,
            max_output_tokens: max_tokens,
        })
        .tracer(telemetry::from_config(config.langfuse.as_ref(), config.request_timeout))
        .runs_dir(config.runs_dir::<L>())
        .cancel_flag(interrupt_flag())
        .build()?;

    let start = Instant::now();
    let artifacts = runner.run(&dataset).await?;

    println!();
    println!(
        "Processed {}/{} rows: {} predictions, {} errors ({:.1?})",
        artifacts.config.processed_rows,
        artifacts.config.dataset_rows,
        artifacts.predictions.len(),
        artifacts.errors.len(),
        start.elapsed()
    );
    match &artifacts.metrics {
        Some(metrics) => print_metrics(metrics),
        None => println!("⚠ No successful predictions to compute metrics"),
    }
    if artifacts.config.interrupted {
        println!("Run was interrupted; artifacts hold every row processed so far.");
    }
    println!("Run complete: {}", artifacts.run_dir.display());
    Ok(())
}

fn print_metrics(metrics: &Metrics) {
    println!("Accuracy:  {:.3}", metrics.accuracy);
    println!("Macro F1:  {:.3}", metrics.macro_f1);
    println!();

    let width = metrics
        .per_class
        .iter()
        .map(|(label, _)| label.chars().count())
        .max()
        .unwrap_or(5)
        .max(5);
    println!("{:<width$}  {:>9}  {:>9}  {:>9}  {:>7}", "Class", "Precision", "Recall", "F1", "Support");
    for (label, scores) in metrics.per_class.iter() {
        println!(
            "{:<width$}  {:>9.3}  {:>9.3}  {:>9.3}  {:>7}",
            label, scores.precision, scores.recall, scores.f1, scores.support
        );
    }
}

fn list_prompts<L: TaskPaths>(config: &AppConfig) -> Result<()> {
    let store = PromptStore::new(config.prompts_dir::<L>());
    let versions = store.list_versions()?;
    if versions.is_empty() {
        println!("No prompts found in {}", store.dir().display());
        println!("Create a prompt file at: {}", store.prompt_path("v001").display());
        return Ok(());
    }
    println!("Available prompts ({}):", L::TASK);
    for version in versions {
        println!("  {:<8} {}", version, store.prompt_path(&version).display());
    }
    Ok(())
}

fn list_models<L: TaskPaths>() {
    println!("Supported models:");
    for model in SUPPORTED_MODELS {
        let marker = if model.id == L::DEFAULT_MODEL { " (default)" } else { "" };
        println!("  {:<24} {}{}", model.id, model.display_name, marker);
    }
}

fn diff<L: TaskPaths>(run_a: &Path, run_b: &Path) -> Result<()> {
    let preds_a = artifacts::read_predictions::<L>(run_a).context("Failed to load predictions for run A")?;
    let preds_b = artifacts::read_predictions::<L>(run_b).context("Failed to load predictions for run B")?;
    println!("Run A: {} predictions", preds_a.len());
    println!("Run B: {} predictions", preds_b.len());
    println!();

    let differences = report::diff_runs(&preds_a, &preds_b);
    if differences.is_empty() {
        println!("✓ No differences found! Predictions are identical.");
        return Ok(());
    }

    println!("Prediction differences ({} total):", differences.len());
    for entry in &differences {
        let mark = |label: &str| if label == entry.gold { format!("{} ✓", label) } else { label.to_string() };
        println!(
            "  {:<12} gold={:<12} A={:<14} B={:<14} {}",
            entry.id,
            entry.gold,
            mark(&entry.run_a),
            mark(&entry.run_b),
            report::shorten(&entry.subject, 50)
        );
    }
    println!();
    println!("{} differences found", differences.len());
    Ok(())
}

fn regenerate_report<L: TaskPaths>(run_dir: &Path, output: Option<PathBuf>) -> Result<()> {
    let predictions = artifacts::read_predictions::<L>(run_dir)?;
    let output = output.unwrap_or_else(|| run_dir.join(artifacts::REPORT_FILE));
    let count = report::write_misclassification_report(&predictions, &output)?;
    println!(
        "Wrote {} misclassified cases out of {} predictions to {}",
        count,
        predictions.len(),
        output.display()
    );
    Ok(())
}

fn compare<L: TaskPaths>(run_dirs: &[PathBuf]) -> Result<()> {
    let runs = report::compare_runs::<L>(run_dirs)?;

    println!("{:<45} {:>6} {:>8} {:>9} {:>7}", "Run", "Rows", "Accuracy", "Macro F1", "Errors");
    for run in &runs {
        let (accuracy, macro_f1) = match &run.metrics {
            Some(metrics) => (format!("{:.3}", metrics.accuracy), format!("{:.3}", metrics.macro_f1)),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<45} {:>6} {:>8} {:>9} {:>7}",
            run.name(),
            run.total,
            accuracy,
            macro_f1,
            run.misclassified_ids.len()
        );
    }

    println!();
    for run in &runs {
        let model = run.config.as_ref().map(|c| c.model_id.as_str()).unwrap_or("?");
        let ids = if run.misclassified_ids.is_empty() {
            "none".to_string()
        } else {
            run.misclassified_ids.join(", ")
        };
        println!("{} ({}): {}", run.name(), model, ids);
    }

    if runs.len() > 1 {
        let persistent = report::persistent_errors(&runs);
        println!();
        println!("Misclassified in every run: {}", if persistent.is_empty() { "none".to_string() } else { persistent.join(", ") });
    }
    Ok(())
}

async fn pipeline<L: TaskPaths + Screening>(config: &AppConfig, args: PipelineArgs) -> Result<()> {
    let store = SupabaseStore::new(&config.require_supabase()?, config.request_timeout)?;

    let model = if args.prefilter_only {
        None
    } else {
        let Some(version) = args.prompt.as_deref() else {
            bail!("--prompt is required unless --prefilter-only is set");
        };
        let model = resolve_model(args.model.as_deref().unwrap_or(L::DEFAULT_MODEL))?;
        Some(PipelineModel {
            classifier: classifier_for::<L>(config)?,
            prompt: PromptStore::new(config.prompts_dir::<L>()).load(version)?,
            settings: RunSettings {
                model,
                temperature: args.temperature,
                max_output_tokens: args.max_tokens,
            },
        })
    };

    let default_name = format!(
        "supabase_{}_{}_{}",
        L::TASK,
        Local::now().format("%Y%m%d_%H%M%S"),
        args.prompt.as_deref().unwrap_or("prefilter")
    );
    let (run_dir, checkpoint) = remote::open_run_dir(
        &config.runs_dir::<L>(),
        args.run_name.as_deref(),
        &default_name,
        args.resume,
    )?;
    info!("Pipeline run directory: {:?}", run_dir);

    let mut options = PipelineOptions::for_task::<L>();
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size.max(1);
    }
    options.sleep = Duration::from_millis(args.sleep_ms);
    options.limit = args.limit;
    options.max_batches = args.max_batches;
    options.only_unclassified = args.only_unclassified;
    options.dry_run = args.dry_run;
    options.write_prefiltered = args.write_prefiltered;
    options.prefilter_only = args.prefilter_only;

    let pipeline = RemotePipeline::<L>::new(Arc::new(store), model, options)?
        .with_tracer(telemetry::from_config(config.langfuse.as_ref(), config.request_timeout))
        .with_cancel_flag(interrupt_flag());
    let summary = pipeline.run(&run_dir, checkpoint).await?;

    let stats = &summary.checkpoint.stats;
    println!();
    println!("{}", if summary.interrupted { "Pipeline interrupted" } else { "Pipeline complete" });
    println!("Run directory:  {}", summary.run_dir.display());
    println!("Last id:        {}", summary.checkpoint.last_id.as_deref().unwrap_or("-"));
    println!("Batches:        {}", stats.batches);
    println!("Fetched:        {}", stats.fetched);
    println!("Prefiltered:    {}", stats.prefiltered);
    println!("Skipped:        {}", stats.skipped);
    println!("Classified:     {}", stats.classified);
    println!("Errors:         {}", stats.errors);
    println!("Updated:        {}", stats.updated);
    println!("Write failures: {}", stats.write_failures);
    if summary.interrupted {
        println!("Resume with: --run-name {} --resume", run_dir_name(&summary.run_dir));
    }
    Ok(())
}

fn run_dir_name(run_dir: &Path) -> String {
    run_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn export_sql<L: Screening>(predictions_path: &Path, output: &Path) -> Result<()> {
    let predictions = artifacts::read_predictions::<L>(predictions_path)?;
    println!("Loaded {} predictions from {}", predictions.len(), predictions_path.display());

    let total = predictions.len().max(1) as f64;
    println!("Label distribution:");
    for (label, count) in sql::label_distribution(&predictions) {
        println!("  {:<55} {:>5} ({:>5.1}%)", label, count, count as f64 / total * 100.0);
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, sql::generate_update_sql(&predictions))?;
    println!("Saved SQL statements to {}", output.display());
    Ok(())
}
