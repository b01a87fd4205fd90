//! streamctl command line front end.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use streamctl::config::{CliOverrides, Config};
use streamctl::engine::{create_engine, Engine};
use streamctl::{
    check_element_availability, ElementKind, EngineKind, PipelineBuilder, PipelineEvent, PushMode,
};

/// streamctl - control running tensor stream pipelines
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine used to build pipelines (gstreamer, loopback)
    #[arg(long, global = true)]
    engine: Option<EngineKind>,

    /// Behaviour of pushes into a full source queue
    #[arg(long, global = true, value_enum)]
    push_mode: Option<PushModeArg>,

    /// Bound for synchronous state waits, in milliseconds
    #[arg(long, global = true)]
    state_timeout_ms: Option<u64>,

    /// Log level or filter directive (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Construct and play a pipeline, printing its events as JSON lines
    Launch {
        /// Stop after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Graph description, e.g. `appsrc name=src ! appsink name=sink`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        description: Vec<String>,
    },
    /// List the elements of a pipeline with their kind and caps
    Inspect {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        description: Vec<String>,
    },
    /// Check that element factories are available on this host
    Check {
        #[arg(required = true)]
        factories: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PushModeArg {
    Block,
    FailFast,
}

impl From<PushModeArg> for PushMode {
    fn from(arg: PushModeArg) -> Self {
        match arg {
            PushModeArg::Block => PushMode::Block,
            PushModeArg::FailFast => PushMode::FailFast,
        }
    }
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            engine: self.engine,
            push_mode: self.push_mode.map(PushMode::from),
            state_timeout_ms: self.state_timeout_ms,
            log_level: self.log_level.clone(),
            log_file: self.log_file.clone(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_figment(args.overrides())?;
    let _log_guard = init_logging(&config)?;

    let engine = create_engine(config.engine)?;
    info!("Using the {} engine", engine.name());

    match args.command {
        Command::Launch {
            timeout_secs,
            description,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(launch(
                engine,
                &config,
                &description.join(" "),
                timeout_secs.map(Duration::from_secs),
            ))
        }
        Command::Inspect { description } => inspect(&engine, &config, &description.join(" ")),
        Command::Check { factories } => check(engine.as_ref(), &factories),
    }
}

/// Initialize logging: compact output on stderr, plus an optional plain
/// file written from a background thread. The returned guard flushes the
/// file on drop.
fn init_logging(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = match &config.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file path {} has no file name", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn launch(
    engine: Arc<dyn Engine>,
    config: &Config,
    description: &str,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let pipeline = PipelineBuilder::new(description)
        .options(config.pipeline.clone())
        .build(&engine)
        .context("failed to construct pipeline")?;
    let events = pipeline.event_stream();
    tokio::pin!(events);

    pipeline.start()?;
    info!("Pipeline {} started", pipeline.id());

    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    match event {
                        PipelineEvent::Eos { .. } => break Ok(()),
                        PipelineEvent::Error { error, .. } => {
                            break Err(anyhow!("pipeline failed: {}", error))
                        }
                        _ => {}
                    }
                }
                None => break Ok(()),
            },
            _ = &mut deadline => {
                info!("Timeout reached, stopping");
                break Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break Ok(());
            }
        }
    };

    // Teardown waits for in-flight callbacks, keep it off the runtime threads
    let result = tokio::task::spawn_blocking(move || pipeline.destroy()).await?;
    if let Err(e) = result {
        error!("Failed to destroy pipeline: {}", e);
    }
    outcome
}

fn inspect(engine: &Arc<dyn Engine>, config: &Config, description: &str) -> anyhow::Result<()> {
    let pipeline = PipelineBuilder::new(description)
        .options(config.pipeline.clone())
        .build(engine)
        .context("failed to construct pipeline")?;

    {
        let graph = pipeline.graph()?;
        println!("{:<20} {:<16} {:<14} CAPS", "NAME", "FACTORY", "KIND");
        for node in graph.nodes() {
            let caps = node
                .caps()
                .map(|caps| caps.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<20} {:<16} {:<14} {}",
                node.name(),
                node.factory(),
                ElementKind::from_factory(node.factory()).to_string(),
                caps
            );
        }
    }

    pipeline.destroy()?;
    Ok(())
}

fn check(engine: &dyn Engine, factories: &[String]) -> anyhow::Result<()> {
    let mut missing = 0;
    for factory in factories {
        match check_element_availability(engine, factory) {
            Ok(()) => println!("{}: available", factory),
            Err(e) => {
                println!("{}: {}", factory, e);
                missing += 1;
            }
        }
    }
    if missing > 0 {
        bail!("{} of {} factories are unavailable", missing, factories.len());
    }
    Ok(())
}
