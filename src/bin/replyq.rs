//! replyq CLI: run the worker pool, the HTTP front door, or send one request.

use clap::{Parser, Subcommand};
use replyq::broker::Broker;
use replyq::broker::amqp::AmqpBroker;
use replyq::config::Config;
use replyq::correlator::ReplyCorrelator;
use replyq::http::{self, AppState};
use replyq::model::{Payload, ReplyOutcome};
use replyq::shutdown::ShutdownCoordinator;
use replyq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use replyq::worker::{EchoProcessor, PoolConfig, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::error;

#[derive(Parser)]
#[command(name = "replyq", about = "Request-reply over an AMQP broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool until SIGINT/SIGTERM
    Server {
        /// Number of workers (defaults to WORKER_POOL_SIZE)
        #[arg(long)]
        workers: Option<usize>,
        /// Upper bound of the simulated processing latency
        #[arg(long, default_value_t = 400)]
        max_latency_ms: u64,
        /// Seed for the workers' random generators
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run the HTTP front door
    Client {
        /// Listen port (defaults to HTTP_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Caller deadline (defaults to REQUEST_TIMEOUT_SECS)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Send one request and print the reply
    Send {
        /// Message text
        message: String,
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = telemetry(&config)?;

    match cli.command {
        Command::Server {
            workers,
            max_latency_ms,
            seed,
        } => {
            let workers = workers.unwrap_or(config.pool_size);
            cmd_server(&config, workers, Duration::from_millis(max_latency_ms), seed).await
        }
        Command::Client { port, timeout_secs } => {
            let port = port.unwrap_or(config.http_port);
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(config.request_timeout);
            cmd_client(&config, port, timeout).await
        }
        Command::Send {
            message,
            timeout_secs,
        } => cmd_send(&config, message, Duration::from_secs(timeout_secs)).await,
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "replyq".to_string(),
        log_level: config.log_level.clone(),
    })?)
}

fn spawn_signal_listener(shutdown: &ShutdownCoordinator) {
    let listener = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = listener.listen_for_signals().await {
            error!("signal listener failed: {e}");
            listener.trigger();
        }
    });
}

async fn cmd_server(
    config: &Config,
    workers: usize,
    max_latency: Duration,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let broker = Arc::new(AmqpBroker::connect(&config.broker).await?);
    let shutdown = ShutdownCoordinator::new();
    spawn_signal_listener(&shutdown);

    let mut pool_config = PoolConfig::new(&config.queue_name)
        .decode_failure_policy(config.decode_failure_policy);
    if let Some(seed) = seed {
        pool_config = pool_config.seed(seed);
    }
    let pool = WorkerPool::new(
        Arc::clone(&broker),
        Arc::new(EchoProcessor::new(max_latency)),
        pool_config,
    );

    let token = shutdown.token();
    let handle = tokio::spawn(async move { pool.run(workers, token).await });
    let report = shutdown.drain(handle, broker.as_ref()).await?;

    for worker in &report.workers {
        println!(
            "{}: processed {}, replies failed {}, rejected {} ({:?})",
            worker.worker_id,
            worker.processed,
            worker.replies_failed,
            worker.rejected,
            worker.stop_reason
        );
    }
    Ok(())
}

async fn cmd_client(config: &Config, port: u16, timeout: Duration) -> anyhow::Result<()> {
    let broker = Arc::new(AmqpBroker::connect(&config.broker).await?);
    let shutdown = ShutdownCoordinator::new();
    spawn_signal_listener(&shutdown);

    let correlator = ReplyCorrelator::new(
        Arc::clone(&broker),
        &config.queue_name,
        config.reply_mode,
        shutdown.token(),
    );
    let router = http::router(AppState {
        correlator,
        request_timeout: timeout,
    });

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    http::serve(listener, router, shutdown.token()).await?;
    broker.close().await?;
    Ok(())
}

async fn cmd_send(config: &Config, message: String, timeout: Duration) -> anyhow::Result<()> {
    let broker = Arc::new(AmqpBroker::connect(&config.broker).await?);
    let correlator = ReplyCorrelator::new(
        Arc::clone(&broker),
        &config.queue_name,
        config.reply_mode,
        ShutdownCoordinator::new().token(),
    );

    let outcome = correlator.send(&Payload::new(message), timeout).await;
    broker.close().await?;

    match outcome? {
        ReplyOutcome::Replied(reply) => {
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(())
        }
        ReplyOutcome::TimedOut { correlation_id, .. } => {
            anyhow::bail!("no reply for {correlation_id} within {}s", timeout.as_secs())
        }
    }
}
