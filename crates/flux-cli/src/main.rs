use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use flux_contracts::config::{non_empty_env, LayeredConfig};
use flux_contracts::events::{object_fields, EventWriter};
use flux_contracts::logging::{LogLevel, Logger};
use flux_contracts::models::{DimensionPolicy, ModelRegistry, ModelSpec};
use flux_contracts::redact::scrub_secret;
use flux_contracts::tasks::{SubmittedTask, TaskSnapshot};
use flux_engine::origin::Resolver;
use flux_engine::poller::{DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
use flux_engine::{
    resolve_image_reference, CancellationToken, ClientConfig, FluxClient, GenerationRequest,
    InputError, OriginClassification, OriginValidator, OutputFormat, PollOptions,
    TaskPoller,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const DEFAULT_MODEL: &str = "flux-pro-1.1";

#[derive(Debug, Parser)]
#[command(name = "flux-rs", version, about = "Flux image generation CLI")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// API key; falls back to BFL_API_KEY, FLUX_API_KEY and the config files.
    #[arg(long, global = true)]
    api_key: Option<String>,
    /// Overall poll timeout in seconds.
    #[arg(long, global = true)]
    timeout: Option<f64>,
    #[arg(long, global = true)]
    poll_interval: Option<f64>,
    #[arg(long, global = true)]
    max_retries: Option<u32>,
    /// Hide per-poll progress lines.
    #[arg(long, global = true)]
    quiet: bool,
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    /// Append JSONL events to this file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Wait(WaitArgs),
    Validate(ValidateArgs),
    Models,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    seed: Option<i64>,
    /// Local image path, https URL or data URL.
    #[arg(long)]
    input_image: Option<String>,
    #[arg(long, default_value = "jpeg")]
    output_format: String,
    #[arg(long, default_value_t = 1)]
    n: usize,
    #[arg(long, default_value = "outputs")]
    out: PathBuf,
    /// Cancel the remaining polls as soon as one task fails.
    #[arg(long)]
    fail_fast: bool,
}

#[derive(Debug, Parser)]
struct WaitArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    polling_url: Option<String>,
    /// Download the finished image into this directory.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ValidateArgs {
    #[arg(required = true)]
    targets: Vec<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("flux-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = LayeredConfig::load_default().context("failed loading config")?;
    let level = resolve_log_level(&cli.common, &config)?;
    init_tracing(level)?;
    let logger = build_logger(level, cli.common.events.as_deref());
    match cli.command {
        Command::Generate(args) => run_generate(&cli.common, &config, logger, args),
        Command::Wait(args) => run_wait(&cli.common, &config, logger, args),
        Command::Validate(args) => Ok(run_validate(&args.targets, &OriginValidator::new(), &logger)),
        Command::Models => {
            print_models(&ModelRegistry::default());
            Ok(0)
        }
    }
}

fn resolve_log_level(common: &CommonArgs, config: &LayeredConfig) -> Result<LogLevel> {
    if let Some(level) = common.log_level {
        return Ok(level);
    }
    if common.quiet {
        return Ok(LogLevel::Warn);
    }
    Ok(config.log_level()?.unwrap_or(LogLevel::Info))
}

fn init_tracing(level: LogLevel) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(level.filter_directive())
            .with_context(|| format!("invalid log level '{level}'"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn build_logger(level: LogLevel, events: Option<&Path>) -> Logger {
    let logger = Logger::new(level);
    match events {
        Some(path) => logger.with_events(EventWriter::for_new_run(path)),
        None => logger,
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{flag} must be a non-negative number of seconds, got {value}"))
}

fn poll_options(common: &CommonArgs, config: &LayeredConfig) -> Result<PollOptions> {
    let timeout = match common.timeout.or_else(|| config.timeout_s()) {
        Some(value) => seconds(value, "--timeout")?,
        None => DEFAULT_TIMEOUT,
    };
    let poll_interval = match common.poll_interval.or_else(|| config.poll_interval_s()) {
        Some(value) => seconds(value, "--poll-interval")?,
        None => DEFAULT_POLL_INTERVAL,
    };
    Ok(PollOptions {
        timeout,
        poll_interval,
        max_retries: common
            .max_retries
            .or_else(|| config.max_retries())
            .unwrap_or(DEFAULT_MAX_RETRIES),
        show_progress: !common.quiet,
        ..PollOptions::default()
    })
}

fn build_client(common: &CommonArgs, config: &LayeredConfig, logger: Logger) -> Result<FluxClient> {
    let api_key = config.resolve_api_key(common.api_key.as_deref(), non_empty_env)?;
    let mut client_config = ClientConfig::new(api_key)
        .with_api_base(config.api_base(non_empty_env))
        .with_environment(config.environment(non_empty_env));
    if let Some(value) = config.request_timeout_s() {
        client_config = client_config.with_request_timeout(seconds(value, "request_timeout_s")?);
    }
    Ok(FluxClient::new(client_config, logger)?)
}

fn run_generate(
    common: &CommonArgs,
    config: &LayeredConfig,
    logger: Logger,
    args: GenerateArgs,
) -> Result<i32> {
    if args.n == 0 {
        bail!("--n must be at least 1");
    }
    let model = ModelRegistry::default().resolve(&args.model);
    model
        .check_dimensions(args.width, args.height)
        .map_err(|message| anyhow!(message))?;
    if model.requires_input_image && args.input_image.is_none() {
        bail!("model '{}' requires --input-image", model.name);
    }
    let output_format = OutputFormat::from_name(&args.output_format)
        .ok_or_else(|| anyhow!("unsupported --output-format '{}'", args.output_format))?;

    let input_image = match args.input_image.as_deref() {
        Some(raw) => Some(
            resolve_input_image(raw, &OriginValidator::new(), &logger)
                .with_context(|| format!("invalid --input-image {}", display_target(raw)))?,
        ),
        None => None,
    };

    let base_request = GenerationRequest {
        input_image,
        width: args.width,
        height: args.height,
        aspect_ratio: args.aspect_ratio.clone(),
        output_format: Some(output_format),
        ..GenerationRequest::new(args.prompt.clone())
    };
    let options = poll_options(common, config)?;
    let client = Arc::new(build_client(common, config, logger.clone())?);

    let mut failures = 0usize;
    let mut submitted: Vec<(usize, SubmittedTask)> = Vec::new();
    for index in 0..args.n {
        let request = GenerationRequest {
            seed: seed_for(args.seed, index),
            ..base_request.clone()
        };
        match client.submit(&model.endpoint, &request) {
            Ok(task) => {
                logger.event(
                    "task_submitted",
                    object_fields(json!({
                        "index": index,
                        "task_id": task.id,
                        "polling_url": task.polling_url,
                        "model": model.name,
                        "request": Value::Object(request.manifest()),
                    })),
                );
                submitted.push((index, task));
            }
            Err(err) => {
                failures += 1;
                report_failure(
                    &client,
                    &format!("submission {} failed: {err}", index + 1),
                    err.user_hint(),
                );
                if args.fail_fast {
                    break;
                }
            }
        }
    }

    let cancel = CancellationToken::new();
    let (results, lost) = thread::scope(|scope| {
        let handles: Vec<_> = submitted
            .into_iter()
            .map(|(index, task)| {
                let client = Arc::clone(&client);
                let logger = logger.clone();
                let cancel = cancel.clone();
                let options = options
                    .clone()
                    .with_status_endpoint(task.polling_url.clone());
                let fail_fast = args.fail_fast;
                scope.spawn(move || {
                    let poller = TaskPoller::new(client, logger).with_cancellation(cancel.clone());
                    let result = poller.wait_for_result(&task.id, &options);
                    if result.is_err() && fail_fast {
                        cancel.cancel();
                    }
                    (index, task, result)
                })
            })
            .collect();
        join_polls(handles)
    });
    if lost > 0 {
        failures += lost;
        eprintln!("error: {lost} poll thread(s) stopped without a result");
    }

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    for (index, task, result) in results {
        match result {
            Ok(snapshot) => {
                match save_artifact(&client, &logger, &snapshot, &args.out, index, output_format) {
                    Ok(path) => println!("{}", path.display()),
                    Err(err) => {
                        failures += 1;
                        report_failure(
                            &client,
                            &format!("task {} finished but saving failed: {err:#}", task.id),
                            "Check the output directory and network access.",
                        );
                    }
                }
            }
            Err(err) => {
                failures += 1;
                report_failure(&client, &err.to_string(), err.user_hint());
            }
        }
    }

    if failures > 0 {
        eprintln!("{failures} of {} generation(s) failed", args.n);
        return Ok(1);
    }
    Ok(0)
}

fn run_wait(
    common: &CommonArgs,
    config: &LayeredConfig,
    logger: Logger,
    args: WaitArgs,
) -> Result<i32> {
    let options = poll_options(common, config)?.with_status_endpoint(args.polling_url.clone());
    let client = Arc::new(build_client(common, config, logger.clone())?);
    let poller = TaskPoller::new(client.clone(), logger.clone());
    let snapshot = match poller.wait_for_result(&args.task_id, &options) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            report_failure(&client, &err.to_string(), err.user_hint());
            return Ok(1);
        }
    };
    match args.out.as_deref() {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
            let format = snapshot
                .artifact
                .as_deref()
                .and_then(format_from_url)
                .unwrap_or(OutputFormat::Jpeg);
            let path = save_artifact(&client, &logger, &snapshot, dir, 0, format)?;
            println!("{}", path.display());
        }
        None => println!("{}", snapshot.artifact.unwrap_or_default()),
    }
    Ok(0)
}

fn run_validate<R: Resolver>(
    targets: &[String],
    validator: &OriginValidator<R>,
    logger: &Logger,
) -> i32 {
    let mut rejected = 0usize;
    for target in targets {
        let verdict = if looks_like_url(target) {
            validator.validate_remote_origin(target)
        } else {
            validator.validate_local_path(Path::new(target.trim()))
        };
        match verdict {
            OriginClassification::Allowed => println!("allowed   {target}"),
            OriginClassification::Rejected(rejection) => {
                rejected += 1;
                println!(
                    "rejected  {target} [{}] {}",
                    rejection.reason, rejection.message
                );
                emit_origin_rejected(logger, target, &rejection.reason.to_string(), &rejection.message);
            }
        }
    }
    if rejected > 0 {
        1
    } else {
        0
    }
}

fn resolve_input_image<R: Resolver>(
    raw: &str,
    validator: &OriginValidator<R>,
    logger: &Logger,
) -> Result<String> {
    match resolve_image_reference(raw, validator) {
        Ok(reference) => {
            logger.info(format!("input image: {}", reference.source_label()));
            Ok(reference.payload_value().to_string())
        }
        Err(err) => {
            if let InputError::Rejected(rejection) = &err {
                emit_origin_rejected(logger, raw, &rejection.reason.to_string(), &rejection.message);
            }
            Err(err.into())
        }
    }
}

fn emit_origin_rejected(logger: &Logger, target: &str, reason: &str, message: &str) {
    logger.warn(format!("rejected {target}: {message}"));
    logger.event(
        "origin_rejected",
        object_fields(json!({
            "target": display_target(target),
            "reason": reason,
            "message": message,
        })),
    );
}

fn save_artifact(
    client: &FluxClient,
    logger: &Logger,
    snapshot: &TaskSnapshot,
    out_dir: &Path,
    index: usize,
    format: OutputFormat,
) -> Result<PathBuf> {
    let url = snapshot
        .artifact
        .as_deref()
        .ok_or_else(|| anyhow!("task {} has no artifact", snapshot.id))?;
    let bytes = client.download(url)?;
    let path = out_dir.join(artifact_file_name(&snapshot.id, index, format));
    fs::write(&path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
    logger.event(
        "artifact_saved",
        object_fields(json!({
            "task_id": snapshot.id,
            "index": index,
            "path": path.to_string_lossy(),
            "bytes": bytes.len(),
        })),
    );
    Ok(path)
}

fn report_failure(client: &FluxClient, message: &str, hint: &str) {
    let secret = client.config().api_key.expose();
    eprintln!("error: {}", scrub_secret(message, secret));
    eprintln!("  hint: {hint}");
}

fn print_models(registry: &ModelRegistry) {
    for model in registry.list() {
        println!("{}", describe_model(model));
    }
}

fn describe_model(model: &ModelSpec) -> String {
    let size = match model.dimensions {
        DimensionPolicy::Limited(limits) => {
            format!("{}-{}px step {}", limits.min, limits.max, limits.step)
        }
        DimensionPolicy::AspectRatioOnly => "aspect ratio".to_string(),
        DimensionPolicy::Unchecked => "unchecked".to_string(),
    };
    let mut line = format!(
        "{:<22} {:<22} {}",
        model.name,
        size,
        model.capabilities.join(",")
    );
    if model.requires_input_image {
        line.push_str(" (input image required)");
    }
    line
}

fn seed_for(seed: Option<i64>, index: usize) -> Option<i64> {
    seed.map(|base| base.wrapping_add(index as i64))
}

fn artifact_file_name(task_id: &str, index: usize, format: OutputFormat) -> String {
    let stem: String = task_id
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-')
        .take(12)
        .collect();
    let stem = if stem.is_empty() { "task" } else { stem.as_str() };
    format!("flux-{stem}-{index}.{}", format.extension())
}

fn format_from_url(url: &str) -> Option<OutputFormat> {
    let path = url.split(['?', '#']).next()?;
    let ext = path.rsplit_once('.')?.1;
    OutputFormat::from_name(ext)
}

fn looks_like_url(target: &str) -> bool {
    target.trim().contains("://")
}

fn display_target(target: &str) -> String {
    if target.trim_start().starts_with("data:") {
        return format!("<data url, {} chars>", target.len());
    }
    target.to_string()
}

/// Joins poll threads. A thread that panicked has no result to report, so it
/// is counted separately instead of disappearing from the summary.
fn join_polls<'scope, T>(handles: Vec<ScopedJoinHandle<'scope, T>>) -> (Vec<T>, usize) {
    let mut finished = Vec::with_capacity(handles.len());
    let mut lost = 0usize;
    for handle in handles {
        match handle.join() {
            Ok(value) => finished.push(value),
            Err(_) => lost += 1,
        }
    }
    (finished, lost)
}
