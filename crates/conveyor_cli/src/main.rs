//! Conveyor CLI
//!
//! Schedules payloads into an in-process pipeline: processors stamp each
//! payload, output handlers print the results as JSON lines.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod stages;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use conveyor_core::IntervalSpec;
use conveyor_runtime::{
    Composer, IterSource, PeriodicScheduler, Pipeline, RunnerReport, TaskSource, WorkStage, task_queue,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{ENV_TARGETS_FILE, Settings, Target, TargetsFile, getenv};
use crate::stages::{JsonLinesSink, ScheduledTask, StampStage, StampedRecord};

#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(about = "Conveyor - scheduled payloads through an async stage pipeline", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schedule payloads and run the pipeline
    Run(RunArgs),
    /// Validate a targets file
    CheckTargets {
        /// Path to targets file
        file: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to a targets file: YAML, or JSON with a `.json` extension
    #[arg(long, conflicts_with = "payload")]
    targets_file: Option<PathBuf>,

    /// Single payload to schedule; parsed as JSON, otherwise taken as a string
    #[arg(long)]
    payload: Option<String>,

    /// Pattern searched for in the payload
    #[arg(long, requires = "payload")]
    pattern: Option<String>,

    /// Repeat interval for --payload, in seconds
    #[arg(long, default_value_t = 60, requires = "payload")]
    seconds: u32,

    /// Repeat interval for --payload in compact form, e.g. `1h30m` or `1mo`
    #[arg(long, requires = "payload", conflicts_with = "seconds")]
    every: Option<IntervalSpec>,

    /// Process every target once and exit
    #[arg(long)]
    once: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, conflicts_with = "once")]
    duration: Option<u64>,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("conveyor={}", level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::CheckTargets { file } => check_targets(&file),
    }
}

fn check_targets(path: &Path) -> Result<()> {
    let targets = TargetsFile::load(path)?;
    for (index, target) in targets.sites.iter().enumerate() {
        println!("#{} every {}: {}", index, target.interval, target.payload);
    }
    println!("{} target(s) OK", targets.sites.len());
    Ok(())
}

/// Targets from the command line, the given file, or the file named in the
/// environment, in that order
fn resolve_targets(args: &RunArgs) -> Result<Vec<Target>> {
    if let Some(raw) = &args.payload {
        let payload =
            serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
        let interval = args.every.unwrap_or(IntervalSpec::every_seconds(args.seconds));
        let target = Target::new(payload, args.pattern.clone(), interval);
        let file = TargetsFile { sites: vec![target] };
        file.validate()?;
        return Ok(file.sites);
    }

    let path = match &args.targets_file {
        Some(path) => path.clone(),
        None => PathBuf::from(
            getenv(&|name: &str| std::env::var(name).ok(), ENV_TARGETS_FILE, None)
                .context("--payload, --targets-file or a targets file in the environment is required")?,
        ),
    };
    Ok(TargetsFile::load(&path)?.sites)
}

type Processors = Vec<Box<dyn WorkStage<ScheduledTask, Output = StampedRecord>>>;
type Handlers = Vec<Box<dyn WorkStage<StampedRecord, Output = ()>>>;

fn build_stages(settings: &Settings) -> (Processors, Handlers) {
    let processors = (0..settings.processors)
        .map(|i| Box::new(StampStage::new(i)) as Box<dyn WorkStage<ScheduledTask, Output = StampedRecord>>)
        .collect();

    let sink = JsonLinesSink::stdout();
    let handlers = (0..settings.handlers)
        .map(|i| Box::new(sink.named(format!("json-lines-{}", i))) as Box<dyn WorkStage<StampedRecord, Output = ()>>)
        .collect();

    (processors, handlers)
}

async fn run(args: RunArgs) -> Result<()> {
    let settings = Settings::from_env()?;
    let targets = resolve_targets(&args)?;
    let composer = Composer::new(settings.composer_config());
    let (processors, handlers) = build_stages(&settings);

    info!(
        targets = targets.len(),
        processors = settings.processors,
        handlers = settings.handlers,
        queue = %settings.queue_capacity,
        "starting conveyor"
    );

    if args.once {
        let source: Arc<dyn TaskSource<ScheduledTask>> = Arc::new(IterSource::new(targets.iter().map(Target::task)));
        let pipeline = composer.run_with_handlers(source, processors, handlers);
        return finish(pipeline.join().await);
    }

    let (sender, queue) = task_queue::<ScheduledTask>(settings.queue_capacity);
    let pipeline = composer.run_with_handlers(Arc::new(queue), processors, handlers);

    let scheduler = PeriodicScheduler::new();
    let mut jobs = Vec::with_capacity(targets.len());
    for target in &targets {
        jobs.push(scheduler.schedule_enqueue(target.interval, sender.clone(), target.task())?);
    }
    drop(sender);

    wait_for_stop(args.duration).await?;

    scheduler.shutdown();
    for job in jobs {
        let id = job.id();
        let fires = job.fire_count();
        if let Err(err) = job.join().await {
            warn!(job = %id, error = %err, "job ended with error");
        }
        info!(job = %id, fires, "job stopped");
    }

    pipeline.abort();
    report_metrics(&pipeline);
    finish(pipeline.join().await)
}

async fn wait_for_stop(duration: Option<u64>) -> Result<()> {
    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("interrupted, shutting down");
        }
        () = deadline => info!("duration elapsed, shutting down"),
    }
    Ok(())
}

fn report_metrics(pipeline: &Pipeline) {
    let metrics = pipeline.metrics();
    info!(
        processed = metrics.processors.processed,
        failed = metrics.processors.failed,
        success_rate = metrics.processors.success_rate(),
        written = metrics.output_handlers.processed,
        abandoned = metrics.processors.in_flight() + metrics.output_handlers.in_flight(),
        queued = metrics.queue_depth.unwrap_or(0),
        queue_fill = metrics.queue_fill.unwrap_or(0.0),
        "pipeline stopped"
    );
}

/// Fail if any runner stopped for a reason other than end-of-stream or abort
fn finish(reports: Vec<RunnerReport>) -> Result<()> {
    let failed: Vec<_> = reports
        .iter()
        .filter(|r| matches!(r.outcome, Err(ref err) if !matches!(err, conveyor_runtime::RunnerError::Aborted { .. })))
        .collect();

    for report in &failed {
        if let Err(err) = &report.outcome {
            error!(runner = %report.id, stage = %report.stage, group = %report.group, error = %err, "runner failed");
        }
    }
    if !failed.is_empty() {
        bail!("{} runner(s) failed", failed.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_payload() {
        let cli = Cli::try_parse_from([
            "conveyor", "run", "--payload", r#"{"url":"x"}"#, "--pattern", "ok", "--seconds", "5", "--once",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.seconds, 5);
        assert!(args.once);

        let targets = resolve_targets(&args).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].payload["url"], "x");
        assert_eq!(targets[0].pattern.as_deref(), Some("ok"));
    }

    #[test]
    fn test_plain_payload_is_a_string() {
        let cli = Cli::try_parse_from(["conveyor", "run", "--payload", "hello world"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let targets = resolve_targets(&args).unwrap();
        assert_eq!(targets[0].payload, serde_json::json!("hello world"));
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        assert!(Cli::try_parse_from(["conveyor", "run", "--payload", "a", "--targets-file", "t.json"]).is_err());
        assert!(Cli::try_parse_from(["conveyor", "run", "--payload", "a", "--once", "--duration", "5"]).is_err());
        assert!(Cli::try_parse_from(["conveyor", "run", "--pattern", "x"]).is_err());
    }

    #[test]
    fn test_parse_compact_interval() {
        let cli = Cli::try_parse_from(["conveyor", "run", "--payload", "a", "--every", "1h 30m"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let targets = resolve_targets(&args).unwrap();
        assert_eq!(targets[0].interval, IntervalSpec::new().with_hours(1).with_minutes(30));

        assert!(Cli::try_parse_from(["conveyor", "run", "--payload", "a", "--every", "soon"]).is_err());
        assert!(Cli::try_parse_from(["conveyor", "run", "--payload", "a", "--every", "1m", "--seconds", "5"]).is_err());
    }

    #[test]
    fn test_zero_seconds_payload_rejected() {
        let cli = Cli::try_parse_from(["conveyor", "run", "--payload", "a", "--seconds", "0"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(resolve_targets(&args).is_err());
    }

    #[tokio::test]
    async fn test_once_pipeline_drains() {
        let settings = Settings {
            processors: 2,
            handlers: 2,
            ..Settings::default()
        };
        let (processors, _) = build_stages(&settings);
        let sink = JsonLinesSink::new(Vec::new());
        let handlers: Handlers = vec![Box::new(sink.named("a")), Box::new(sink.named("b"))];

        let targets: Vec<Target> = (0..5)
            .map(|i| Target::new(serde_json::json!({ "n": i }), None, IntervalSpec::every_seconds(60)))
            .collect();
        let source: Arc<dyn TaskSource<ScheduledTask>> = Arc::new(IterSource::new(targets.iter().map(Target::task)));
        let pipeline = Composer::new(settings.composer_config()).run_with_handlers(source, processors, handlers);

        finish(pipeline.join().await).unwrap();
        let out = String::from_utf8(sink.writer().lock().unwrap().clone()).unwrap();
        assert_eq!(out.lines().count(), 5);
    }

    #[test]
    fn test_check_targets() {
        use std::io::Write;

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "sites:\n  - url: https://example.com\n    interval: {{hours: 1}}").unwrap();
        check_targets(file.path()).unwrap();

        let mut bad = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(bad, r#"{{"sites": [{{"payload": "p", "interval": {{}}}}]}}"#).unwrap();
        assert!(check_targets(bad.path()).is_err());
    }
}
