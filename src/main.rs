use anyhow::{Context, Result};
use bidscan::core::progress::{CompareProgress, ComparePhase};
use bidscan::core::report::PairResult;
use bidscan::settings::{Settings, WorkerMode};
use bidscan::{ComparisonService, ContentCache, ParserRegistry, Workers};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "bidscan", version, about = "Find shared text, images and metadata across competing documents")]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cache directory (overrides the settings file)
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Worker pool size: single or multi
    #[arg(long, global = true, value_name = "MODE")]
    workers: Option<WorkerMode>,

    /// More logging (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare every pair of the given documents
    Compare(CompareArgs),

    /// Parse documents into the cache ahead of a run
    Preload {
        /// Documents to cache
        #[arg(required = true, value_name = "FILES")]
        files: Vec<PathBuf>,
    },

    /// Inspect persisted runs
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Args, Debug)]
struct CompareArgs {
    /// Documents to compare (at least two)
    #[arg(required = true, num_args = 2.., value_name = "FILES")]
    files: Vec<PathBuf>,

    /// Tender document whose content is ignored
    #[arg(short, long, value_name = "FILE")]
    exclude: Option<PathBuf>,

    /// Text similarity threshold in [0, 1]
    #[arg(long)]
    threshold: Option<f64>,

    /// Ignore sentences shorter than this
    #[arg(long)]
    min_length: Option<usize>,

    /// Image bit agreement a match must exceed
    #[arg(long)]
    image_similarity: Option<f64>,

    /// Ignore images smaller than this in either dimension
    #[arg(long)]
    min_size: Option<u32>,

    /// Print the results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List persisted runs
    List,

    /// Show the results of one run
    Show {
        /// Group id printed by `compare` or `history list`
        group: String,
        /// Print the results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => LevelFilter::ERROR,
        (false, 0) => LevelFilter::WARN,
        (false, 1) => LevelFilter::INFO,
        (false, 2) => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    // `log` records from the library are bridged into this subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    if let Some(dir) = &cli.cache_dir {
        settings.cache_dir = dir.clone();
    }
    if let Some(mode) = cli.workers {
        settings.workers = mode;
    }

    if let Commands::Compare(args) = &cli.command {
        if let Some(threshold) = args.threshold {
            settings.text.threshold = threshold;
        }
        if let Some(min_length) = args.min_length {
            settings.text.min_length = min_length;
        }
        if let Some(similarity) = args.image_similarity {
            settings.image.similarity = similarity;
        }
        if let Some(min_size) = args.min_size {
            settings.image.min_size = min_size;
        }
    }

    settings.validate()?;
    Ok(settings)
}

fn open_cache(settings: &Settings) -> Result<Arc<ContentCache>> {
    let cache = ContentCache::open(&settings.cache_dir, settings.hash_algorithm)
        .with_context(|| format!("Failed to open cache at {}", settings.cache_dir.display()))?;
    Ok(Arc::new(cache))
}

fn build_service(settings: &Settings) -> Result<ComparisonService> {
    Ok(ComparisonService::new(
        open_cache(settings)?,
        Arc::new(ParserRegistry::with_builtin()),
        Arc::new(Workers::new(settings.workers).context("Failed to start worker pools")?),
        settings.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let settings = load_settings(&cli)?;

    match cli.command {
        Commands::Compare(args) => run_compare(&settings, args).await?,

        Commands::Preload { files } => {
            let service = build_service(&settings)?;
            for file in &files {
                let document = service
                    .ingest(file)
                    .with_context(|| format!("Failed to cache {}", file.display()))?;
                println!(
                    "✔ {} → {} ({} text units, {} images)",
                    file.display(),
                    document.file_hash,
                    document.texts.len(),
                    document.images.len()
                );
            }
        }

        Commands::History { command } => {
            let cache = open_cache(&settings)?;
            match command {
                HistoryCmd::List => {
                    let grouped = cache.read_all_results()?;
                    if grouped.is_empty() {
                        println!("No persisted runs in {}", settings.cache_dir.display());
                        return Ok(());
                    }

                    println!("🗂️  Runs:");
                    for (group_id, results) in &grouped.groups {
                        let started = results.iter().map(|r| r.start_time).min().unwrap_or_default();
                        println!(
                            "  {}  {}  {} pair(s)",
                            format_millis(started),
                            group_id,
                            results.len()
                        );
                    }
                    if !grouped.ungrouped.is_empty() {
                        println!("  ({} result(s) without a group id)", grouped.ungrouped.len());
                    }
                }

                HistoryCmd::Show { group, json } => {
                    let results = cache.read_results(&group)?;
                    if results.is_empty() {
                        anyhow::bail!("No results for group {}", group);
                    }
                    if json {
                        println!("{}", serde_json::to_string_pretty(&results)?);
                    } else {
                        print_results(&results);
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run_compare(settings: &Settings, args: CompareArgs) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut service = build_service(settings)?.with_progress_sender(tx);

    let exclusion = match &args.exclude {
        Some(path) => Some(
            service
                .ingest(path)
                .with_context(|| format!("Failed to read exclusion document {}", path.display()))?,
        ),
        None => None,
    };

    let pairs = benchmark("building comparison matrix", || service.build_matrix(&args.files))?;

    let bar = ProgressBar::new(pairs.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} pairs {msg}")?
            .progress_chars("=> "),
    );
    let reporter = tokio::spawn(render_progress(rx, bar.clone()));

    let start = Instant::now();
    let outcome = service.run_matrix(exclusion.as_ref()).await?;
    bar.finish_with_message(format!("done in {:.2?}", start.elapsed()));

    // The service owns the sender; dropping it ends the reporter.
    drop(service);
    let _ = reporter.await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    print_results(&outcome.results);
    if !outcome.failed.is_empty() {
        eprintln!("⚠️  {} pair(s) failed and are not reported", outcome.failed.len());
    }
    println!("\n✅ Results stored under group {}", outcome.group_id);
    Ok(())
}

async fn render_progress(mut rx: mpsc::UnboundedReceiver<CompareProgress>, bar: ProgressBar) {
    while let Some(event) = rx.recv().await {
        match event.phase {
            ComparePhase::Pair => {
                let done = event.label.split_once('/').and_then(|(done, _)| done.parse::<u64>().ok());
                if let Some(done) = done {
                    bar.set_position(done);
                }
            }
            phase => bar.set_message(format!("{:?} {}", phase, event.label)),
        }
    }
}

fn print_results(results: &[PairResult]) {
    for result in results {
        println!("\n✨ {} ↔ {}", result.names[0], result.names[1]);
        println!(
            "   {} similar sentence(s), {} similar image(s), {}ms",
            result.text_similarities.len(),
            result.image_matches.len(),
            result.duration
        );

        for m in result.text_similarities.iter().take(5) {
            println!(
                "   📄 p{} / p{} ({:.0}%): {}",
                m.a.page_number,
                m.b.page_number,
                m.similarity * 100.0,
                m.a.text
            );
        }
        if result.text_similarities.len() > 5 {
            println!("   … {} more", result.text_similarities.len() - 5);
        }

        for m in &result.image_matches {
            println!(
                "   🖼️  p{} / p{} ({:.0}%): {} ↔ {}",
                m.pages[0],
                m.pages[1],
                m.similarity * 100.0,
                m.images[0].display(),
                m.images[1].display()
            );
        }

        let shared: Vec<&str> = result
            .metadata_matches
            .iter()
            .filter(|m| m.same && m.a.is_some())
            .map(|m| m.label.as_str())
            .collect();
        if !shared.is_empty() {
            println!("   🏷️  Same metadata: {}", shared.join(", "));
        }
    }
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown time".to_string())
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
