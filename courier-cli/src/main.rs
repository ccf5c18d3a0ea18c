//! Courier CLI
//!
//! Runs a tick-polling demo route, or validates a configuration file.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use courier_core::{
    endpoint_cache, Context, CourierConfig, CourierEvent, DefaultEndpoint, Endpoint, EventNotifier,
    Exchange, ExchangeResult, NotifierError, ScheduledExecutor, TimeoutMap, TimeoutMapEvent,
};
use courier_poll::{PollResult, Poller, ScheduledPollConsumer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const TICK_URI: &str = "timer:tick";

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier - integration runtime support layer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tick-polling demo route
    Run {
        /// Configuration file (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log level, overridden by RUST_LOG
        #[arg(short, long, default_value = "info")]
        log_level: String,

        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            log_level,
            duration,
        } => {
            setup_logging(&log_level)?;
            let config = load_config(config.as_deref())?;
            run_demo(config, duration.map(Duration::from_secs)).await?;
        }
        Commands::Validate { config } => {
            setup_logging("info")?;
            validate_config(&config)?;
        }
    }

    Ok(())
}

fn setup_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CourierConfig> {
    match path {
        Some(path) => CourierConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(CourierConfig::default()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    info!("Validating config in {}", path.display());
    let config = CourierConfig::load(path)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    info!("Validation complete");
    Ok(())
}

/// Logs lifecycle events
struct LoggingNotifier;

impl EventNotifier for LoggingNotifier {
    fn notify(&self, event: &CourierEvent) -> Result<(), NotifierError> {
        match event {
            CourierEvent::ExchangeCompleted {
                exchange_id,
                elapsed_ms,
            } => debug!(exchange_id = %exchange_id, elapsed_ms, "Exchange completed"),
            other if other.is_exchange_event() => debug!(event = other.kind(), "{:?}", other),
            other => info!(event = other.kind(), "{:?}", other),
        }
        Ok(())
    }
}

/// Emits one exchange per poll carrying an increasing tick number
struct TickPoller {
    ticks: AtomicU64,
}

#[async_trait]
impl Poller for TickPoller {
    async fn poll(&self, consumer: &ScheduledPollConsumer) -> PollResult<usize> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let mut exchange = consumer.endpoint().create_exchange();
        exchange.in_message_mut().set_header("tick", tick as i64);
        exchange.in_message_mut().set_body(format!("tick {tick}"));

        let result = consumer.process(&mut exchange).await;
        exchange.done();
        result?;
        Ok(1)
    }
}

async fn run_demo(config: CourierConfig, duration: Option<Duration>) -> Result<()> {
    info!(context = %config.context.name, "Starting Courier demo route");

    let context = Context::from_config(&config.context);
    context.events().add_notifier(Arc::new(LoggingNotifier));

    let executor = ScheduledExecutor::new(format!("{}-scheduler", context.name()))?;
    let recent: TimeoutMap<String, String> =
        TimeoutMap::with_clock(config.timeout_map.purge_poll_time(), context.clock().clone());
    recent.add_listener(|event: TimeoutMapEvent, id: &String, _: &String| {
        if event == TimeoutMapEvent::Evict {
            debug!(exchange_id = %id, "Forgot processed exchange");
        }
    });
    recent.start(&executor)?;

    let endpoints = endpoint_cache(config.cache.max_size);
    let endpoint: Arc<dyn Endpoint> = endpoints.get_or_insert_with(TICK_URI.to_string(), || -> Arc<dyn Endpoint> {
        Arc::new(DefaultEndpoint::new(&context, TICK_URI))
    });

    let retention = config.consumer.delay() * 10;
    let seen = recent.clone();
    let processor = move |exchange: &mut Exchange| -> ExchangeResult<()> {
        let body = exchange.in_message().body().to_string();
        info!(exchange_id = %exchange.id(), body = %body, "Received");
        seen.put(exchange.id().to_string(), body, retention);
        Ok(())
    };

    let consumer = ScheduledPollConsumer::builder(
        endpoint,
        Arc::new(TickPoller {
            ticks: AtomicU64::new(0),
        }),
    )
    .config(config.consumer.clone())
    .processor(Arc::new(processor))
    .executor(executor.clone())
    .build()?;
    consumer.start()?;

    match duration {
        Some(duration) => {
            info!(seconds = duration.as_secs(), "Demo running");
            tokio::time::sleep(duration).await;
        }
        None => {
            info!("Demo running. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await?;
        }
    }

    info!("Shutting down");
    let stats = consumer.stats();
    consumer.stop();
    info!(
        cycles = stats.counter,
        remembered = recent.len(),
        "Demo stopped"
    );
    recent.stop();
    executor.shutdown();

    Ok(())
}
