//! CLI binary for running intent-to-pipeline selection rounds.

mod config;
mod monitor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use intentflow_llm::{
    CandidateGenerator, Embedder, FeatureBuilder, HashingEmbedder, LlmClient, LoggingMiddleware,
    OpenAiEmbedder, ReplayGenerator,
};
use intentflow_pipeline::{
    validate, ArgoSubmitter, BlacklistStore, CompileOptions, ControllerParts, ControllerSettings,
    DirManifestRegistry, Evaluator, EventEmitter, FeedbackCorpus, FeedbackLedger,
    JsonBlacklistStore, JsonlCorpus, LlmGenerator, MetricsLog, PhaseConfig, PromptBuilder,
    RetryPolicy, RetryingEmbedder, RoundController, RoundEvent, Severity, Submitter, TaskGraph,
    WorkflowCompiler,
};
use intentflow_plan::{CandidateParser, ModuleCatalog};
use intentflow_policy::{BinaryFileStore, PolicyParams, PolicyStore};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigLoader, Settings};
use crate::monitor::UtilizationSampler;

#[derive(Parser)]
#[command(name = "intentflow", version, about = "Learns which service pipeline satisfies a network intent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ./intentflow.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format; overrides `logging.format`
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Phase {
    Train,
    Test,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trial loop over a phase's intents
    Run {
        #[arg(long, value_enum, default_value = "train")]
        phase: Phase,

        /// Intent to run; repeatable. Defaults to the phase's intents from the catalog.
        #[arg(long = "intent")]
        intents: Vec<String>,

        /// Sampling seed; also used as the run id in the metrics log
        #[arg(long, env = "SEED")]
        seed: Option<u64>,

        /// Replay candidate rounds from a file instead of calling the LLM
        #[arg(long)]
        offline: Option<PathBuf>,

        /// Write promoted manifests without submitting them
        #[arg(long)]
        no_submit: bool,

        /// Sample process and host utilization into this CSV file
        #[arg(long)]
        util_log: Option<PathBuf>,

        /// Seconds between utilization samples
        #[arg(long)]
        util_interval: Option<f64>,
    },

    /// Delete learned state: transcript, run metrics, policy, blacklist and feedback documents
    Reset,

    /// Score every candidate in a file against an intent
    Evaluate {
        #[arg(long)]
        intent: String,

        /// File with one or more `Candidate-<n>:` blocks
        candidates: PathBuf,
    },

    /// Show the graph and validation diagnostics for each candidate in a file
    Graph {
        candidates: PathBuf,
    },

    /// Compile the first candidate in a file into an Argo workflow
    Compile {
        candidates: PathBuf,

        /// Workflow name prefix
        #[arg(long)]
        name: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List the intents known to the catalog
    Intents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = ConfigLoader::load(cli.config.as_deref())?;

    let level = if cli.verbose {
        "debug"
    } else {
        settings.logging.level.as_str()
    };
    let json = match cli.log_format {
        Some(LogFormat::Json) => true,
        Some(LogFormat::Pretty) => false,
        None => settings.logging.format == "json",
    };
    init_tracing(level, json);

    match cli.command {
        Commands::Run {
            phase,
            intents,
            seed,
            offline,
            no_submit,
            util_log,
            util_interval,
        } => {
            let options = RunOptions {
                phase,
                intents,
                seed: seed.or(settings.policy.seed),
                offline,
                no_submit,
                util_log: util_log.or_else(|| settings.monitor.csv.clone()),
                util_interval: util_interval.unwrap_or(settings.monitor.interval_secs),
            };
            cmd_run(&settings, options).await?;
        }
        Commands::Reset => {
            cmd_reset(&settings)?;
        }
        Commands::Evaluate { intent, candidates } => {
            cmd_evaluate(&settings, &intent, &candidates)?;
        }
        Commands::Graph { candidates } => {
            cmd_graph(&settings, &candidates)?;
        }
        Commands::Compile {
            candidates,
            name,
            out,
        } => {
            cmd_compile(&settings, &candidates, &name, out.as_deref())?;
        }
        Commands::Intents => {
            cmd_intents(&settings)?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let default_level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_parser(settings: &Settings) -> anyhow::Result<Arc<CandidateParser>> {
    let catalog = match &settings.catalog.path {
        Some(path) => ModuleCatalog::load(path)
            .with_context(|| format!("loading catalog {}", path.display()))?,
        None => ModuleCatalog::builtin()?,
    };
    Ok(Arc::new(
        CandidateParser::new(Arc::new(catalog)).with_matching(settings.catalog.label_matching),
    ))
}

fn read_candidates(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn compile_options(settings: &Settings) -> CompileOptions {
    CompileOptions {
        namespace: settings.workflow.namespace.clone(),
        wait_for_dependencies: settings.workflow.wait_for_dependencies,
        service_account: settings.workflow.service_account.clone(),
    }
}

struct RunOptions {
    phase: Phase,
    intents: Vec<String>,
    seed: Option<u64>,
    offline: Option<PathBuf>,
    no_submit: bool,
    util_log: Option<PathBuf>,
    util_interval: f64,
}

async fn cmd_run(settings: &Settings, options: RunOptions) -> anyhow::Result<()> {
    let parser = load_parser(settings)?;
    let catalog = parser.catalog().clone();

    let mut phase = match options.phase {
        Phase::Train => PhaseConfig::train(),
        Phase::Test => PhaseConfig::test(),
    };
    phase.success_threshold = settings.trials.success_threshold;
    phase.stop_on_success = settings.trials.stop_on_success;

    let intents = if options.intents.is_empty() {
        let all: Vec<String> = catalog.intents().map(str::to_string).collect();
        phase.default_intents(&all)
    } else {
        options.intents
    };
    if intents.is_empty() {
        bail!("No intents to run for phase {}", phase.name);
    }

    std::fs::create_dir_all(&settings.paths.state_dir)
        .with_context(|| format!("creating {}", settings.paths.state_dir.display()))?;

    let corpus: Arc<dyn FeedbackCorpus> = Arc::new(JsonlCorpus::new(settings.paths.corpus()));
    let blacklist: Arc<dyn BlacklistStore> =
        Arc::new(JsonBlacklistStore::new(settings.paths.blacklist()));
    let ledger = FeedbackLedger::open(
        parser.clone(),
        corpus.clone(),
        blacklist,
        settings.paths.transcript(),
    )?;

    let retry = RetryPolicy {
        max_retries: settings.llm.max_retries,
        timeout: Some(Duration::from_secs(settings.llm.timeout_secs)),
        ..RetryPolicy::default()
    };

    let (generator, embedder): (Arc<dyn CandidateGenerator>, Arc<dyn Embedder>) =
        match &options.offline {
            Some(path) => {
                let replay = ReplayGenerator::load(path)
                    .with_context(|| format!("loading offline rounds {}", path.display()))?;
                println!("Offline mode: {} rounds from {}", replay.rounds(), path.display());
                (
                    Arc::new(replay),
                    Arc::new(HashingEmbedder::new(settings.embedding.dim)),
                )
            }
            None => {
                let client = Arc::new(LlmClient::from_env()?.with_middleware(LoggingMiddleware));
                let prompt = PromptBuilder::new(catalog.clone(), settings.trials.candidates);
                let generator = LlmGenerator::new(
                    client.clone(),
                    settings.llm.model.clone(),
                    prompt,
                    corpus.clone(),
                )
                .with_retry(retry.clone())
                .with_context_docs(settings.llm.context_docs);
                let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(
                    client,
                    settings.embedding.model.clone(),
                    settings.embedding.dim,
                ));
                (
                    Arc::new(generator),
                    Arc::new(RetryingEmbedder::new(embedder, retry)),
                )
            }
        };

    let submitter: Option<Arc<dyn Submitter>> = if options.no_submit {
        None
    } else {
        Some(Arc::new(ArgoSubmitter::new(
            settings.workflow.submit_command.clone(),
            Duration::from_secs(settings.workflow.submit_timeout_secs),
        )))
    };

    let parts = ControllerParts {
        parser: parser.clone(),
        generator,
        features: FeatureBuilder::new(embedder, settings.embedding.cache_capacity),
        ledger,
        policy_store: Arc::new(BinaryFileStore::new(
            settings.paths.policy_state(),
            settings.policy.scope,
        )),
        compiler: WorkflowCompiler::new(Arc::new(DirManifestRegistry::new(
            settings.paths.manifests_dir.clone(),
            catalog.clone(),
        ))),
        submitter,
        metrics: Some(MetricsLog::new(settings.paths.run_metrics())),
    };
    let controller_settings = ControllerSettings {
        max_trials: settings.trials.max_trials,
        run_id: options
            .seed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "0".to_string()),
        seed: options.seed,
        policy: PolicyParams {
            lambda: settings.policy.lambda,
            sigma: settings.policy.sigma,
        },
        compile: compile_options(settings),
        submit_namespace: settings.workflow.submit_namespace.clone(),
        output_dir: settings.paths.output_dir.clone(),
    };

    let events = EventEmitter::default();
    let printer = tokio::spawn(print_progress(events.subscribe(), settings.trials.max_trials));
    let mut controller = RoundController::new(controller_settings, parts).with_events(events);

    let sampler = match &options.util_log {
        Some(path) => {
            let interval = Duration::from_secs_f64(options.util_interval.max(0.001));
            Some(UtilizationSampler::new(path, interval).start()?)
        }
        None => None,
    };

    println!("Phase: {} ({} intents)", phase.name, intents.len());
    let result = controller.run_phase(&intents, &phase).await;
    drop(controller);
    let _ = printer.await;

    if let Some(handle) = sampler {
        let path = handle.path().to_path_buf();
        let rows = handle.stop().await?;
        println!("Utilization: {rows} samples written to {}", path.display());
    }

    let records = result?;
    println!("\nSummary:");
    for record in &records {
        let status = if record.succeeded(settings.trials.max_trials) {
            format!("ATS {}", record.ats)
        } else {
            "not reached".to_string()
        };
        println!(
            "  {:<60} {:>12}  |w| {:.4}",
            record.intent, status, record.final_posterior_norm
        );
    }
    println!("Metrics: {}", settings.paths.run_metrics().display());
    Ok(())
}

async fn print_progress(
    mut events: tokio::sync::broadcast::Receiver<RoundEvent>,
    max_trials: usize,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Progress printer fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            RoundEvent::IntentStarted { phase, intent } => {
                println!("\n[{phase}] {intent}");
            }
            RoundEvent::TrialCompleted {
                trial,
                reward,
                label,
                posterior_norm,
                pipeline,
                ..
            } => {
                println!(
                    "  t={trial:<4} {label:<8} r={reward:.1} |w|={posterior_norm:.4}  {pipeline}"
                );
            }
            RoundEvent::TrialSkipped { trial, reason, .. } => {
                println!("  t={trial:<4} skipped: {reason}");
            }
            RoundEvent::ThresholdReached { trial, .. } => {
                println!("  threshold reached at t={trial}");
            }
            RoundEvent::PromotionRejected { diagnostics, .. } => {
                println!("  promotion rejected:");
                for d in diagnostics {
                    println!("    - {d}");
                }
            }
            RoundEvent::ManifestWritten { path, .. } => {
                println!("  manifest: {path}");
            }
            RoundEvent::Submission { outcome, .. } => {
                println!("  submission: {outcome:?}");
            }
            RoundEvent::IntentFinished { ats, succeeded, .. } => {
                if succeeded {
                    println!("  done: ATS {ats}");
                } else {
                    println!("  done: no success within {max_trials} trials");
                }
            }
        }
    }
}

fn cmd_reset(settings: &Settings) -> anyhow::Result<()> {
    let paths = &settings.paths;
    for file in [paths.transcript(), paths.run_metrics()] {
        match std::fs::remove_file(&file) {
            Ok(()) => println!("Removed {}", file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing {}", file.display())),
        }
    }

    let policy = BinaryFileStore::new(paths.policy_state(), settings.policy.scope);
    let removed = policy.clear()?;
    println!("Removed {removed} policy state file(s)");

    if JsonBlacklistStore::new(paths.blacklist()).clear()? {
        println!("Removed {}", paths.blacklist().display());
    }

    let purged = JsonlCorpus::new(paths.corpus()).purge_feedback()?;
    println!("Purged {purged} feedback document(s)");
    Ok(())
}

fn cmd_evaluate(settings: &Settings, intent: &str, path: &Path) -> anyhow::Result<()> {
    let parser = load_parser(settings)?;
    let evaluator = Evaluator::new(parser.clone());
    let text = read_candidates(path)?;

    for candidate in parser.split(&text) {
        let verdict = evaluator.evaluate(intent, &candidate.text)?;
        println!(
            "{:<16} {:<8} r={:.1}  {}",
            candidate.id,
            verdict.label,
            verdict.reward,
            parser.pipeline_key(&candidate.text)
        );
    }
    Ok(())
}

fn cmd_graph(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    let parser = load_parser(settings)?;
    let text = read_candidates(path)?;
    let mut has_error = false;

    for candidate in parser.split(&text) {
        let graph = TaskGraph::from_parsed(&parser.parse_to_graph(&candidate.text));
        println!("{}:", candidate.id);
        println!("  Nodes: {}", graph.nodes().join(", "));
        for edge in graph.edges() {
            println!("  {} -> {}", edge.from, edge.to);
        }

        let diagnostics = validate(&graph, &**parser.catalog());
        if diagnostics.is_empty() {
            println!("  Graph is valid");
        }
        for diag in &diagnostics {
            let severity = match diag.severity {
                Severity::Error => {
                    has_error = true;
                    "ERROR"
                }
                Severity::Warning => "WARN",
                Severity::Info => "INFO",
            };
            println!("  [{}] {}: {}", severity, diag.rule, diag.message);
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_compile(settings: &Settings, path: &Path, name: &str, out: Option<&Path>) -> anyhow::Result<()> {
    let parser = load_parser(settings)?;
    let text = read_candidates(path)?;
    let Some(candidate) = parser.split(&text).into_iter().next() else {
        bail!("No candidate found in {}", path.display());
    };

    let graph = TaskGraph::from_parsed(&parser.parse_to_graph(&candidate.text));
    let errors: Vec<String> = validate(&graph, &**parser.catalog())
        .into_iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message)
        .collect();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("[ERROR] {e}");
        }
        bail!("{} is not a valid pipeline", candidate.id);
    }

    let compiler = WorkflowCompiler::new(Arc::new(DirManifestRegistry::new(
        settings.paths.manifests_dir.clone(),
        parser.catalog().clone(),
    )));
    let workflow = compiler.compile(name, &graph, &compile_options(settings))?;

    match out {
        Some(file) => {
            workflow.write_to(file)?;
            println!("Wrote {}", file.display());
        }
        None => print!("{}", workflow.to_yaml()?),
    }
    Ok(())
}

fn cmd_intents(settings: &Settings) -> anyhow::Result<()> {
    let parser = load_parser(settings)?;
    for intent in parser.catalog().intents() {
        println!("{intent}");
    }
    Ok(())
}
