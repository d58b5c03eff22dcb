use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use draftwright::llm::{
    AnthropicClient, AnthropicConfig, CircuitBreaker, LlmClient, ResilientClient, api_key_from_env,
};
use draftwright::orchestrator::{DirectoryKnowledge, GenerationService, Pipeline};
use draftwright::prompt::PromptRenderer;
use draftwright::protocol::{Phase, StreamFrame};
use draftwright::rules::{EvaluatorRegistry, PackError, RulePack};
use draftwright::server::HttpServer;
use draftwright::validation::{SelfReviewer, Severity, validate};

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

fn setup_logging(log_stderr: bool, level: &str) -> Result<()> {
    let env = env_logger::Env::default().default_filter_or(level);

    if log_stderr {
        env_logger::Builder::from_env(env)
            .target(env_logger::Target::Stderr)
            .init();
        return Ok(());
    }

    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("draftwright")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("draftwright.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn load_pack(path: Option<&Path>) -> std::result::Result<RulePack, PackError> {
    match path {
        Some(path) => RulePack::from_file(path, &EvaluatorRegistry::with_builtins()),
        None => RulePack::builtin(),
    }
}

fn anthropic_client(config: &Config, api_key: &str, model: &str) -> Result<Arc<dyn LlmClient>> {
    let mut client_config = AnthropicConfig {
        model: model.to_string(),
        max_tokens: config.llm.max_tokens,
        timeout: Duration::from_millis(config.llm.timeout_ms),
        ..AnthropicConfig::default()
    };
    if let Some(base_url) = &config.llm.base_url {
        client_config.base_url = base_url.clone();
    }
    let client = AnthropicClient::with_api_key(api_key, client_config).context("Failed to create LLM client")?;
    Ok(Arc::new(client))
}

fn build_pipeline(config: &Config, api_key: &str) -> Result<Pipeline> {
    let renderer = PromptRenderer::try_new().context("Built-in prompt templates failed to compile")?;
    let renderer = match &config.orchestrator.prompt_dir {
        Some(dir) => renderer
            .with_overrides(dir)
            .context(format!("Failed to load prompt overrides from {}", dir.display()))?,
        None => renderer,
    };
    let renderer = Arc::new(renderer);

    let breaker = Arc::new(CircuitBreaker::new(config.resilience.breaker()));
    let mut drafter = ResilientClient::new(anthropic_client(config, api_key, &config.llm.model)?, breaker)
        .with_retry_policy(config.resilience.retry_policy());
    if let Some(fallback) = &config.llm.fallback_model {
        drafter = drafter.with_fallback(anthropic_client(config, api_key, fallback)?);
    }

    let reviewer = if config.review.enabled {
        let model = config.review.model.as_deref().unwrap_or(&config.llm.model);
        SelfReviewer::new(anthropic_client(config, api_key, model)?, Arc::clone(&renderer))
            .with_timeout(Duration::from_millis(config.review.timeout_ms))
            .with_max_tokens(config.review.max_tokens)
    } else {
        info!("Self-review disabled");
        SelfReviewer::disabled()
    };

    let mut pipeline = Pipeline::new(drafter, reviewer)
        .with_renderer(renderer)
        .with_draft_max_tokens(config.llm.max_tokens);
    if let Some(dir) = &config.knowledge.dir {
        pipeline = pipeline.with_knowledge(Arc::new(DirectoryKnowledge::new(dir, config.knowledge.max_chars)));
    }
    Ok(pipeline)
}

fn build_service(config: &Config) -> Result<GenerationService> {
    let pack = load_pack(config.rules.pack_path.as_deref());
    if let Ok(pack) = &pack {
        info!(
            "Rule pack {} v{} loaded (fingerprint {})",
            pack.id(),
            pack.version(),
            pack.fingerprint()
        );
    }

    let pipeline = match api_key_from_env(&config.llm.api_key_env) {
        Ok(api_key) => Ok(build_pipeline(config, &api_key)?),
        Err(_) => Err(config.llm.api_key_env.clone()),
    };

    Ok(GenerationService::new(pack, pipeline).with_max_spec_chars(config.orchestrator.max_spec_chars))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn run_application(cli: &Cli, config: &Config) -> Result<bool> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Serve { bind } => handle_serve_command(bind.as_deref(), config),
        Commands::Generate {
            spec,
            max_attempts,
            ndjson,
        } => handle_generate_command(spec, *max_attempts, *ndjson, config),
        Commands::CheckPack { pack } => handle_check_pack_command(pack.as_deref(), config),
        Commands::Validate { file, pack } => handle_validate_command(file, pack.as_deref(), config),
    }
}

fn handle_serve_command(bind: Option<&str>, config: &Config) -> Result<bool> {
    let mut server_config = config.server.to_server_config();
    if let Some(bind) = bind {
        server_config.bind = bind.to_string();
    }
    let service = Arc::new(build_service(config)?);

    runtime()?.block_on(async move {
        let server = HttpServer::bind(server_config, service).await?;
        let addr = server.local_addr()?;
        println!("{} http://{}{}", "Listening on".green(), addr, config.server.generate_path);
        server
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await
    })?;

    println!("{}", "Server stopped".cyan());
    Ok(true)
}

fn handle_generate_command(spec: &Path, max_attempts: Option<u32>, ndjson: bool, config: &Config) -> Result<bool> {
    let spec_text = fs::read_to_string(spec).context(format!("Failed to read {}", spec.display()))?;
    let body = serde_json::to_vec(&json!({ "specText": spec_text, "maxAttempts": max_attempts }))?;
    let service = Arc::new(build_service(config)?);

    runtime()?.block_on(async move {
        let mut frames = service.spawn(body);
        let mut success = false;
        while let Some(frame) = frames.recv().await {
            if ndjson {
                println!("{}", serde_json::to_string(&frame)?);
            } else {
                print_frame(&frame);
            }
            match &frame {
                StreamFrame::Result(result) => success = result.success,
                StreamFrame::Error(_) => success = false,
                _ => {}
            }
        }
        Ok::<bool, eyre::Report>(success)
    })
}

fn print_frame(frame: &StreamFrame) {
    match frame {
        StreamFrame::Phase(p) => {
            let label = format!("[{} {}/{}]", p.phase, p.attempt, p.max_attempts);
            let label = match p.phase {
                Phase::Done => label.green(),
                Phase::Failed | Phase::Error => label.red(),
                _ => label.cyan(),
            };
            match &p.message {
                Some(message) => eprintln!("{} {}", label, message),
                None => eprintln!("{}", label),
            }
        }
        StreamFrame::Generation(g) => {
            print!("{}", g.delta);
            let _ = std::io::stdout().flush();
        }
        StreamFrame::Validation(v) => {
            println!();
            eprintln!(
                "{} {} blocking, {} advisory ({} ms)",
                "validation:".bold(),
                v.report.blocking_count(),
                v.report.advisory_count(),
                v.duration_ms
            );
            for issue in &v.report.issues {
                eprintln!("  {}", format_issue(issue.severity, &issue.rule_id, &issue.message));
            }
        }
        StreamFrame::SelfReview(r) => {
            let note = if r.failed_open { " (failed open)" } else { "" };
            eprintln!(
                "{} {} confirmed, {} filtered{}",
                "self-review:".bold(),
                r.confirmed.len(),
                r.filtered.len(),
                note
            );
        }
        StreamFrame::Healing(h) => {
            eprintln!("{} {} issue(s) sent back", "healing:".bold(), h.issue_count);
        }
        StreamFrame::Result(r) => {
            let verdict = if r.success { "success".green() } else { "best effort".yellow() };
            eprintln!(
                "{} {} after {} attempt(s) in {} ms, {} tokens",
                "result:".bold(),
                verdict,
                r.attempts,
                r.total_duration_ms,
                r.usage.total()
            );
        }
        StreamFrame::Error(e) => {
            eprintln!("{} {} {}", "error:".red().bold(), e.code, e.message);
        }
    }
}

fn format_issue(severity: Severity, rule_id: &str, message: &str) -> String {
    let tag = match severity {
        Severity::Blocking => "blocking".red(),
        Severity::Advisory => "advisory".yellow(),
    };
    format!("[{}] {}: {}", tag, rule_id, message)
}

fn handle_check_pack_command(pack: Option<&Path>, config: &Config) -> Result<bool> {
    let path = pack.or(config.rules.pack_path.as_deref());
    let pack = load_pack(path).map_err(|e| eyre!("{}", e))?;

    println!("{} {} v{}", "Rule pack OK:".green(), pack.id(), pack.version());
    if let Some(description) = pack.description() {
        println!("  {}", description);
    }
    println!("  fingerprint: {}", pack.fingerprint());
    let policy = pack.heal_policy();
    println!(
        "  attempts: default {}, max {}",
        policy.default_max_attempts, policy.max_attempts
    );
    for rule in pack.rules() {
        let d = &rule.definition;
        println!("  - {} ({}, {})", d.id, d.kind, d.severity.as_str());
    }
    Ok(true)
}

fn handle_validate_command(file: &Path, pack: Option<&Path>, config: &Config) -> Result<bool> {
    let text = fs::read_to_string(file).context(format!("Failed to read {}", file.display()))?;
    let path = pack.or(config.rules.pack_path.as_deref());
    let pack = load_pack(path).map_err(|e| eyre!("{}", e))?;

    let report = validate(&text, &pack);
    for issue in &report.issues {
        println!("{}", format_issue(issue.severity, &issue.rule_id, &issue.message));
        if let Some(evidence) = &issue.evidence {
            println!("    found: {}", evidence.dimmed());
        }
    }
    if report.ok {
        println!("{} {} advisory issue(s)", "PASS".green().bold(), report.advisory_count());
    } else {
        println!("{} {} blocking issue(s)", "FAIL".red().bold(), report.blocking_count());
    }
    Ok(report.ok)
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging before any work
    let level = config.log_level.as_deref().unwrap_or("info");
    setup_logging(cli.log_stderr, level).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    let ok = run_application(&cli, &config).context("Application failed")?;
    if !ok {
        std::process::exit(1);
    }

    Ok(())
}
