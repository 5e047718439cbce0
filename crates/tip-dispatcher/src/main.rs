//! Outbox dispatcher entry point.

use std::error::Error;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tip_bus::queue::RedriveAllowPolicy;
use tip_bus::redis_streams::{RedisStreamBus, RedisStreamConfig};
use tip_core::clock::{Clock, SystemClock};
use tip_core::store::{OutboxRepository, ReplayAxis};
use tip_dispatcher::config::DispatcherConfig;
use tip_dispatcher::dispatcher::Dispatcher;
use tip_dispatcher::error::DispatchError;
use tip_dispatcher::replay;
use tip_event_store::pg_event_store::PgEventStore;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tip-dispatcher", about = "Publish outbox rows to the event bus")]
struct Cli {
    /// Postgres connection URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Stream events are published to.
    #[arg(long, env = "TIP_QUEUE", default_value = "tip-events")]
    queue: String,

    /// Dead-letter stream; defaults to `<queue>-dlq`.
    #[arg(long, env = "TIP_DEAD_LETTER_QUEUE")]
    dead_letter_queue: Option<String>,

    /// Source streams the dead-letter stream accepts: `*`, `none`, or a
    /// comma-separated list.
    #[arg(long, env = "TIP_DEAD_LETTER_ALLOW", default_value = "tip-events")]
    dead_letter_allow: RedriveAllowPolicy,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dispatch until interrupted.
    Run,
    /// Run a single cycle and print its report.
    Once,
    /// Republish recorded events from a recent window.
    Replay {
        /// Length of the window ending now.
        #[arg(long, default_value_t = 60)]
        minutes: i64,
        /// Timestamp the window applies to.
        #[arg(long, value_enum, default_value_t = Axis::Ingested)]
        by: Axis,
    },
    /// Print outbox backlog statistics.
    Backlog,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Axis {
    Ingested,
    Event,
}

impl From<Axis> for ReplayAxis {
    fn from(axis: Axis) -> Self {
        match axis {
            Axis::Ingested => Self::IngestedTime,
            Axis::Event => Self::EventTime,
        }
    }
}

impl Cli {
    async fn connect_bus(&self) -> Result<Arc<RedisStreamBus>, DispatchError> {
        let mut bus_config = RedisStreamConfig::new(self.redis_url.clone(), self.queue.clone());
        if let Some(dlq) = &self.dead_letter_queue {
            bus_config.redrive.dead_letter_queue.clone_from(dlq);
        }
        let bus = RedisStreamBus::connect(bus_config, &self.dead_letter_allow).await?;
        Ok(Arc::new(bus))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = DispatcherConfig::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cli.database_url)
        .await?;
    let store = Arc::new(PgEventStore::new(pool));

    match cli.command {
        Command::Run => {
            let dispatcher = Dispatcher::new(store, cli.connect_bus().await?, clock, config)?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    let _ = shutdown_tx.send(true);
                }
            });
            let totals = dispatcher.run(shutdown_rx).await;
            tracing::info!(?totals, "dispatcher stopped");
        }
        Command::Once => {
            let dispatcher = Dispatcher::new(store, cli.connect_bus().await?, clock, config)?;
            let report = dispatcher.dispatch_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Replay { minutes, by } => {
            let window = replay::last_minutes(minutes, by.into(), clock.now())?;
            let bus = cli.connect_bus().await?;
            let report =
                replay::replay(store.as_ref(), bus.as_ref(), window, config.publish_timeout)
                    .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Backlog => {
            let stats = store.backlog_stats(clock.now()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_allow_list_is_read_from_its_own_setting() {
        // Act
        let cli = Cli::try_parse_from([
            "tip-dispatcher",
            "--database-url",
            "postgres://localhost/tip",
            "--queue",
            "tip-scratch",
            "--dead-letter-allow",
            "tip-events,tip-replay",
            "once",
        ])
        .unwrap();

        // Assert
        assert!(!cli.dead_letter_allow.allows(&cli.queue));
        assert!(cli.dead_letter_allow.allows("tip-replay"));
    }

    #[test]
    fn test_dead_letter_allow_list_defaults_to_the_default_queue() {
        // Act
        let cli =
            Cli::try_parse_from(["tip-dispatcher", "--database-url", "postgres://x", "backlog"])
                .unwrap();

        // Assert
        assert_eq!(
            cli.dead_letter_allow,
            RedriveAllowPolicy::ByQueue(vec!["tip-events".into()])
        );
    }
}
