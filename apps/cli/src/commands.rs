//! CLI command definitions, routing, and tracing setup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use leadscope_core::{JobHandle, Orchestrator, ProgressReporter, RunSummary};
use leadscope_llm::OpenAiCompatClient;
use leadscope_search::TavilyClient;
use leadscope_shared::{
    AnalysisResult, AppConfig, PipelineConfig, config_dir, init_config, load_config,
    normalize_entity_name, validate_api_keys,
};
use leadscope_storage::{EvidenceStore, MemoryStore, RunRecorder, Storage};

use crate::report;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Leadscope: research companies from web evidence and rank them by GPU need.
#[derive(Parser)]
#[command(
    name = "leadscope",
    version,
    about = "Enrich a list of companies with verified web evidence and score them.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Enrich and score entities from a file and/or `--entity` flags.
    Run(RunArgs),

    /// Inspect the evidence cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
pub(crate) struct RunArgs {
    /// File with one entity name per line; blank lines and `#` comments are skipped.
    #[arg(short, long, required_unless_present = "entity")]
    pub input: Option<PathBuf>,

    /// Entity to enrich; repeat for several. Combined with `--input` when both are given.
    #[arg(short, long, value_name = "NAME")]
    pub entity: Vec<String>,

    /// Run name (defaults to the input file stem, or the entity for a single lookup).
    #[arg(short, long)]
    pub name: Option<String>,

    /// Evidence database path (defaults to ~/.leadscope/leadscope.db).
    #[arg(long, conflicts_with = "in_memory")]
    pub db: Option<PathBuf>,

    /// Keep evidence in memory only; nothing is cached across runs.
    #[arg(long)]
    pub in_memory: bool,

    /// Write the run summary and results as JSON.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Maximum concurrent evidence fetches.
    #[arg(long)]
    pub fetch_concurrency: Option<u32>,

    /// Entities scored concurrently per batch.
    #[arg(long)]
    pub batch_size: Option<u32>,

    /// Minimum validator confidence to accept evidence.
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Total fetch+validate attempts per entity.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Search for the exact name only, without guessed domains.
    #[arg(long)]
    pub no_domain_guesses: bool,
}

#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Show the cached evidence for an entity.
    Show {
        /// Entity name (matched case- and whitespace-insensitively).
        name: String,

        /// Evidence database path (defaults to ~/.leadscope/leadscope.db).
        #[arg(long)]
        db: Option<PathBuf>,

        /// Print the full evidence text.
        #[arg(long)]
        full: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "leadscope=info",
        1 => "leadscope=debug",
        _ => "leadscope=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Cache { action } => match action {
            CacheAction::Show { name, db, full } => cmd_cache_show(&name, db, full).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(args: RunArgs) -> Result<()> {
    let mut config = load_config()?;
    validate_api_keys(&config)?;
    apply_overrides(&mut config, &args);
    let pipeline = PipelineConfig::from(&config);
    pipeline.validate()?;

    let entities = collect_entities(&args)?;
    let run_name = run_name(&args, &entities);

    let (store, recorder) = open_store(&config, args.db.as_deref(), args.in_memory).await?;
    let search = Arc::new(TavilyClient::new(
        &config.search.base_url,
        api_key(&config.search.api_key_env)?,
        pipeline.fetch_timeout,
    )?);
    let classifier_key = api_key(&config.classifier.api_key_env)?;
    let validator_llm = Arc::new(OpenAiCompatClient::new(
        &config.classifier.base_url,
        classifier_key.clone(),
        pipeline.validation_timeout,
    )?);
    let scoring_llm = Arc::new(OpenAiCompatClient::new(
        &config.classifier.base_url,
        classifier_key,
        pipeline.scoring_timeout,
    )?);

    let orchestrator = Orchestrator::from_config(
        &pipeline,
        search,
        validator_llm,
        scoring_llm,
        store,
        recorder,
    )?;

    let handle = orchestrator.start_job(&run_name, entities);
    info!(
        run_id = %handle.run_id(),
        name = %run_name,
        entities = handle.entries().len(),
        "starting run"
    );

    let watchers = [
        tokio::spawn(cancel_on_ctrl_c(handle.clone())),
        tokio::spawn(watch_for_stall(handle.clone(), pipeline.stall_threshold)),
    ];

    let reporter = CliProgress::new();
    let outcome = orchestrator.run(&handle, &reporter).await;
    for watcher in &watchers {
        watcher.abort();
    }
    let summary = outcome?;

    report::print_summary(&summary);
    if let Some(path) = &args.output {
        write_output(path, &summary)?;
        println!("  Results written to {}", path.display());
    }
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, args: &RunArgs) {
    let pipeline = &mut config.pipeline;
    if let Some(n) = args.fetch_concurrency {
        pipeline.fetch_concurrency = n;
    }
    if let Some(n) = args.batch_size {
        pipeline.batch_size = n;
    }
    if let Some(t) = args.threshold {
        pipeline.validation_threshold = t;
    }
    if let Some(n) = args.retries {
        pipeline.max_validation_retries = n;
    }
    if args.no_domain_guesses {
        config.search.domain_guesses = false;
    }
}

/// Entity names from `--input` then `--entity`, in order, without duplicates.
fn collect_entities(args: &RunArgs) -> Result<Vec<String>> {
    let contents = match &args.input {
        Some(path) => std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?,
        None => String::new(),
    };
    let names = input_lines(&contents).chain(args.entity.iter().map(|n| n.trim()));
    let entities = dedupe_entities(names);
    if entities.is_empty() {
        return Err(eyre!("no entity names given; pass --input FILE or --entity NAME"));
    }
    Ok(entities)
}

fn run_name(args: &RunArgs, entities: &[String]) -> String {
    if let Some(name) = &args.name {
        return name.clone();
    }
    if let Some(stem) = args.input.as_deref().and_then(Path::file_stem) {
        return stem.to_string_lossy().to_string();
    }
    match entities {
        [single] => single.clone(),
        _ => "run".to_string(),
    }
}

/// Non-blank, non-comment lines of an input file, trimmed.
fn input_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

fn dedupe_entities<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut entities = Vec::new();
    for name in names {
        if name.is_empty() {
            continue;
        }
        if seen.insert(normalize_entity_name(name)) {
            entities.push(name.to_string());
        } else {
            warn!(entity = name, "duplicate entity name skipped");
        }
    }
    entities
}

fn api_key(var: &str) -> Result<String> {
    std::env::var(var).wrap_err_with(|| format!("{var} is not set"))
}

fn default_db_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("leadscope.db"))
}

fn resolve_db_path(config: &AppConfig, flag: Option<&Path>) -> Result<PathBuf> {
    match (flag, config.pipeline.database_path.as_deref()) {
        (Some(path), _) => Ok(path.to_path_buf()),
        (None, Some(path)) => Ok(PathBuf::from(path)),
        (None, None) => default_db_path(),
    }
}

async fn open_store(
    config: &AppConfig,
    flag: Option<&Path>,
    in_memory: bool,
) -> Result<(Arc<dyn EvidenceStore>, Arc<dyn RunRecorder>)> {
    if in_memory {
        let store = Arc::new(MemoryStore::new());
        let evidence: Arc<dyn EvidenceStore> = store.clone();
        return Ok((evidence, store));
    }
    let path = resolve_db_path(config, flag)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }
    let storage = Arc::new(Storage::open(&path).await?);
    info!(path = %path.display(), "evidence database opened");
    let evidence: Arc<dyn EvidenceStore> = storage.clone();
    Ok((evidence, storage))
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    ForceExit,
}

/// First press cancels the run cooperatively; any later press exits.
fn on_interrupt(handle: &JobHandle) -> Interrupt {
    if handle.is_cancelled() {
        return Interrupt::ForceExit;
    }
    handle.cancel();
    Interrupt::Cancelled
}

async fn cancel_on_ctrl_c(handle: JobHandle) {
    while tokio::signal::ctrl_c().await.is_ok() {
        match on_interrupt(&handle) {
            Interrupt::Cancelled => eprintln!(
                "\n  Cancelling: in-flight entities will finish, nothing new starts. \
                 Press Ctrl-C again to exit now."
            ),
            Interrupt::ForceExit => {
                eprintln!("\n  Interrupted.");
                std::process::exit(130);
            }
        }
    }
}

async fn watch_for_stall(handle: JobHandle, threshold: Duration) {
    let period = (threshold / 4).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if handle.is_stalled(threshold) {
            warn!(
                run_id = %handle.run_id(),
                idle_secs = handle.idle_for().as_secs(),
                "run appears stalled"
            );
        }
    }
}

fn write_output(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(&report::summary_json(summary))?;
    std::fs::write(path, json).wrap_err_with(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Progress bar over the entities of the current phase.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style =
            ProgressStyle::with_template("{spinner:.cyan} {prefix} [{bar:30}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> ");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str, entities: usize) {
        self.bar.set_prefix(name.to_string());
        self.bar.set_length(entities as u64);
        self.bar.set_position(0);
        self.bar.set_message("");
    }

    fn entity_resolved(&self, name: &str, from_cache: bool) {
        let source = if from_cache { "cached" } else { "fetched" };
        self.bar.set_message(format!("{name} ({source})"));
        self.bar.inc(1);
    }

    fn entity_failed(&self, name: &str, message: &str) {
        self.bar.println(format!("  ✗ {name}: {message}"));
        self.bar.inc(1);
    }

    fn entity_scored(&self, result: &AnalysisResult) {
        self.bar.set_message(format!(
            "{} {} ({})",
            result.entity_name, result.tier, result.total_score
        ));
        self.bar.inc(1);
    }

    fn done(&self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// cache / config
// ---------------------------------------------------------------------------

async fn cmd_cache_show(name: &str, db: Option<PathBuf>, full: bool) -> Result<()> {
    let config = load_config()?;
    let path = resolve_db_path(&config, db.as_deref())?;
    if !path.exists() {
        return Err(eyre!("no evidence database at {}", path.display()));
    }
    let storage = Storage::open_readonly(&path).await?;
    let key = normalize_entity_name(name);

    let Some(record) = storage.find_latest_verified(&key).await? else {
        println!("No verified evidence cached for \"{name}\".");
        return Ok(());
    };

    println!();
    println!("  Entity:     {}", record.entity_name);
    println!("  Key:        {}", record.entity_key);
    println!("  Cached at:  {}", record.cached_at.to_rfc3339());
    println!("  Confidence: {:.2}", record.confidence);
    println!("  Validation: {}", record.validation_message);
    if !record.issues.is_empty() {
        println!("  Issues:     {}", record.issues.join("; "));
    }
    println!("  Credits:    {}", record.credits_used);
    println!("  Bytes:      {}", record.formatted_text.len());
    println!("  SHA-256:    {}", record.content_hash);
    println!();
    if full {
        println!("{}", record.formatted_text);
    } else {
        let preview: String = record.formatted_text.chars().take(800).collect();
        println!("{preview}");
        if preview.len() < record.formatted_text.len() {
            println!(
                "\n  ... ({} more bytes, use --full)",
                record.formatted_text.len() - preview.len()
            );
        }
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let cli = Cli::parse_from(["leadscope", "run"].into_iter().chain(argv.iter().copied()));
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        args
    }

    #[test]
    fn input_parsing_skips_comments_blanks_and_duplicates() {
        let input = "# prospects\nAcme Robotics\n\n  Initech  \nacme   robotics\n# Globex\nGlobex Corp\n";
        assert_eq!(
            dedupe_entities(input_lines(input)),
            vec!["Acme Robotics", "Initech", "Globex Corp"]
        );
    }

    #[test]
    fn single_entity_needs_no_input_file() {
        let args = run_args(&["--entity", "Acme Robotics"]);
        assert!(args.input.is_none());
        let entities = collect_entities(&args).unwrap();
        assert_eq!(entities, vec!["Acme Robotics"]);
        assert_eq!(run_name(&args, &entities), "Acme Robotics");
    }

    #[test]
    fn repeated_entities_are_deduped() {
        let args = run_args(&["-e", "Acme", "--entity", " acme ", "-e", "Initech", "--name", "q3"]);
        let entities = collect_entities(&args).unwrap();
        assert_eq!(entities, vec!["Acme", "Initech"]);
        assert_eq!(run_name(&args, &entities), "q3");
    }

    #[test]
    fn file_and_entity_flags_combine() {
        let dir = std::env::temp_dir().join(format!("leadscope-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("prospects.txt");
        std::fs::write(&path, "Acme\n# skip\nInitech\n").unwrap();

        let args = run_args(&["--input", path.to_str().unwrap(), "--entity", "Globex", "-e", "ACME"]);
        let entities = collect_entities(&args).unwrap();
        assert_eq!(entities, vec!["Acme", "Initech", "Globex"]);
        assert_eq!(run_name(&args, &entities), "prospects");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn run_requires_input_or_entity() {
        assert!(Cli::try_parse_from(["leadscope", "run"]).is_err());
        assert!(collect_entities(&run_args(&["--entity", "  "])).is_err());
    }

    #[test]
    fn second_interrupt_forces_exit() {
        let config = PipelineConfig::from(&AppConfig::default());
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(
            OpenAiCompatClient::new("http://127.0.0.1:9", "key", Duration::from_secs(1)).unwrap(),
        );
        let orchestrator = Orchestrator::from_config(
            &config,
            Arc::new(TavilyClient::new("http://127.0.0.1:9", "key", Duration::from_secs(1)).unwrap()),
            llm.clone(),
            llm,
            store.clone(),
            store,
        )
        .unwrap();
        let handle = orchestrator.start_job("interrupts", vec!["Acme".into()]);

        assert_eq!(on_interrupt(&handle), Interrupt::Cancelled);
        assert!(handle.is_cancelled());
        assert_eq!(on_interrupt(&handle), Interrupt::ForceExit);
    }

    #[test]
    fn flags_override_file_values() {
        let mut config = AppConfig::default();
        let cli = Cli::parse_from([
            "leadscope",
            "run",
            "--input",
            "names.txt",
            "--batch-size",
            "3",
            "--threshold",
            "0.75",
            "--retries",
            "4",
            "--no-domain-guesses",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        apply_overrides(&mut config, &args);
        let pipeline = PipelineConfig::from(&config);
        assert_eq!(pipeline.batch_size, 3);
        assert_eq!(pipeline.validation_threshold, 0.75);
        assert_eq!(pipeline.max_validation_retries, 4);
        assert!(!pipeline.domain_guesses);
        assert_eq!(pipeline.fetch_concurrency, 50);
    }

    #[test]
    fn db_flag_wins_over_config() {
        let mut config = AppConfig::default();
        config.pipeline.database_path = Some("/tmp/from-config.db".into());
        let flag = PathBuf::from("/tmp/from-flag.db");
        assert_eq!(resolve_db_path(&config, Some(&flag)).unwrap(), flag);
        assert_eq!(
            resolve_db_path(&config, None).unwrap(),
            PathBuf::from("/tmp/from-config.db")
        );
    }
}
