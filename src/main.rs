use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use speaker_bridge::engine::{JOB_TIMEOUT, Job, JobContext};
use speaker_bridge::speaker::{ConsoleHistory, ConsoleSpeaker, EchoChat, MessageJob};
use speaker_bridge::{
    ChatClient, CircuitBreaker, Config, Dispatcher, GuardedSpeaker, MessagePoller, Priority,
    QueryMessage, RecoveryManager, SpeakerDevice,
};

/// Interval between status log lines when metrics are enabled
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Speaker Bridge - answer smart-speaker queries with a chat assistant
#[derive(Parser)]
#[command(name = "speaker-bridge", version, about)]
struct Cli {
    /// Path to a TOML config file (defaults to the platform config dir)
    #[arg(short, long, env = "SPEAKER_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Read queries from stdin and answer them (default)
    Run,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,speaker_bridge=info",
        1 => "info,speaker_bridge=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run => serve(config).await,
    }
}

/// Answer stdin queries until EOF or Ctrl-C
async fn serve(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let chat: Arc<dyn ChatClient> = Arc::new(EchoChat);
    let speaker: Arc<dyn SpeakerDevice> = Arc::new(GuardedSpeaker::new(
        Arc::new(ConsoleSpeaker),
        RecoveryManager::new(config.recovery.clone()),
        CircuitBreaker::from_config(&config.breaker),
        shutdown.clone(),
    ));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    if config.concurrency.enabled {
        tracing::info!(
            workers = config.concurrency.worker_count,
            queue = config.concurrency.queue_size,
            "concurrent processing enabled"
        );
        serve_concurrent(config, chat, speaker, shutdown).await
    } else {
        tracing::info!("serial processing mode");
        serve_serial(chat, speaker, shutdown).await
    }
}

async fn serve_concurrent(
    config: Config,
    chat: Arc<dyn ChatClient>,
    speaker: Arc<dyn SpeakerDevice>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(config.concurrency.clone(), chat, speaker));
    dispatcher.start()?;

    let history = Arc::new(ConsoleHistory::default());
    let poller = MessagePoller::new(
        config.poller.clone(),
        Arc::clone(&history) as _,
        Arc::clone(&dispatcher),
    );
    poller.start()?;
    tracing::info!("speaker bridge ready - type a query, or /say <text>");

    if config.concurrency.enable_metrics {
        let dispatcher = Arc::clone(&dispatcher);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = dispatcher.status();
                        tracing::info!(
                            status = %serde_json::to_string(&status).unwrap_or_default(),
                            "dispatcher status"
                        );
                    }
                }
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(text) = line.strip_prefix("/say ") {
            if let Err(e) = dispatcher.submit_tts(text, Priority::URGENT).await {
                tracing::warn!(error = %e, "tts request rejected");
            }
        } else {
            history.record(line);
        }
    }

    if !shutdown.is_cancelled() {
        // Give the poller a chance to pick up the last typed queries
        tokio::select! {
            () = shutdown.cancelled() => {}
            () = tokio::time::sleep(config.poller.interval * 2) => {}
        }
        drain(&dispatcher, &shutdown).await;
    }

    poller.stop().await;
    dispatcher.stop().await;
    shutdown.cancel();
    Ok(())
}

/// Wait until buffered and queued work has been picked up
async fn drain(dispatcher: &Dispatcher, shutdown: &CancellationToken) {
    loop {
        let status = dispatcher.status();
        if status.message_buffer == 0 && status.pending_batch == 0 && status.pool.queue_length == 0 {
            // Let the processor hand its last message to the batcher
            tokio::time::sleep(Duration::from_millis(200)).await;
            let status = dispatcher.status();
            if status.message_buffer == 0 && status.pending_batch == 0 && status.pool.queue_length == 0 {
                return;
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

async fn serve_serial(
    chat: Arc<dyn ChatClient>,
    speaker: Arc<dyn SpeakerDevice>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!("speaker bridge ready - type a query");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let job = MessageJob::new(
            QueryMessage::new(line),
            Priority::NORMAL,
            Arc::clone(&chat),
            Arc::clone(&speaker),
        );
        let deadline = tokio::time::Instant::now() + JOB_TIMEOUT;
        let ctx = JobContext::new(0, deadline, shutdown.child_token());

        match tokio::time::timeout(JOB_TIMEOUT, job.execute(&ctx)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(job_id = %job.id(), error = %e, "query failed"),
            Err(_) => tracing::error!(job_id = %job.id(), "query timed out"),
        }
    }

    shutdown.cancel();
    Ok(())
}
