//! Stream Bus CLI
//!
//! Publish envelopes, run a consumer that prints each envelope as a JSON line,
//! and inspect a group's pending ledger. Connection settings come from the
//! environment (see `BusConfig`); flags override them per command.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use stream_bus::{
    join_with_retry, BusConfig, ConsumerLoop, DedupeStore, DeliveryMode, Envelope,
    EnvelopeHandler, LogStore, Producer, RedisLogStore, RetryPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stream-bus")]
#[command(about = "At-least-once messaging over Redis Streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a JSON object to a topic
    Publish { topic: String, payload: String },

    /// Consume a topic as a member of a consumer group
    Consume {
        topic: String,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        consumer: Option<String>,
        #[arg(long)]
        count: Option<usize>,
        #[arg(long)]
        block_ms: Option<u64>,
        #[arg(long)]
        delivery: Option<DeliveryMode>,
        /// Seconds to remember processed envelope ids
        #[arg(long)]
        dedupe_ttl: Option<u64>,
        /// Run a single fetch and exit
        #[arg(long)]
        once: bool,
        /// Leave handled entries pending
        #[arg(long)]
        no_ack: bool,
        #[arg(long)]
        stop_on_error: bool,
    },

    /// List entries delivered but not yet acknowledged
    Pending {
        topic: String,
        #[arg(long)]
        group: Option<String>,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

#[derive(Serialize)]
struct Published<'a> {
    stream: &'a str,
    sequence_id: String,
    envelope_id: &'a str,
}

#[derive(Serialize)]
struct Delivered<'a> {
    stream: &'a str,
    envelope: &'a Envelope,
}

#[derive(Serialize)]
struct PendingLine {
    sequence_id: String,
    consumer: String,
    idle_ms: u128,
    delivery_count: u64,
}

/// Prints every envelope to stdout.
struct PrintHandler {
    stream: String,
}

#[stream_bus::async_trait]
impl EnvelopeHandler for PrintHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let line = serde_json::to_string(&Delivered {
            stream: &self.stream,
            envelope,
        })?;
        println!("{}", line);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stream_bus=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    let config = BusConfig::from_env()?;

    match cli.command {
        Commands::Publish { topic, payload } => cmd_publish(&config, &topic, &payload).await,
        Commands::Consume {
            topic,
            group,
            consumer,
            count,
            block_ms,
            delivery,
            dedupe_ttl,
            once,
            no_ack,
            stop_on_error,
        } => {
            let mut config = config;
            if let Some(group) = group {
                config.group = group;
            }
            if let Some(consumer) = consumer {
                config.consumer = consumer;
            }
            if let Some(count) = count {
                config.batch_size = count;
            }
            if let Some(block_ms) = block_ms {
                config.block_timeout = std::time::Duration::from_millis(block_ms);
            }
            if let Some(delivery) = delivery {
                config.delivery = delivery;
            }
            if let Some(ttl) = dedupe_ttl {
                config.dedupe_ttl = std::time::Duration::from_secs(ttl);
            }
            cmd_consume(&config, &topic, once, !no_ack, stop_on_error).await
        }
        Commands::Pending {
            topic,
            group,
            count,
        } => {
            let group = group.unwrap_or_else(|| config.group.clone());
            cmd_pending(&config, &topic, &group, count).await
        }
    }
}

async fn connect(config: &BusConfig) -> Result<Arc<RedisLogStore>> {
    let store = RedisLogStore::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    Ok(Arc::new(store))
}

async fn cmd_publish(config: &BusConfig, topic: &str, raw: &str) -> Result<()> {
    let payload = match serde_json::from_str::<Value>(raw).context("Payload is not valid JSON")? {
        Value::Object(map) => map,
        other => bail!("Payload must be a JSON object, got {}", other),
    };

    let stream = config.stream_key(topic);
    let producer = Producer::new(connect(config).await?);
    let envelope = Envelope::new(payload);
    let envelope_id = envelope.id.clone();
    let sequence_id = producer.send_envelope(&stream, envelope).await?;

    println!(
        "{}",
        serde_json::to_string(&Published {
            stream: &stream,
            sequence_id: sequence_id.to_string(),
            envelope_id: &envelope_id,
        })?
    );
    Ok(())
}

async fn cmd_consume(
    config: &BusConfig,
    topic: &str,
    once: bool,
    acknowledge: bool,
    stop_on_error: bool,
) -> Result<()> {
    let stream = config.stream_key(topic);
    let store = connect(config).await?;
    let consumer = join_with_retry(
        store,
        &stream,
        &config.group,
        &config.consumer,
        &RetryPolicy::default().with_max_attempts(5),
    )
    .await?;

    let mut consumer_config = config.consumer_config();
    consumer_config.acknowledge = acknowledge;
    consumer_config.stop_on_error = stop_on_error;

    let handler = PrintHandler {
        stream: stream.clone(),
    };
    let mut consumer_loop = ConsumerLoop::new(consumer, handler, consumer_config);
    if config.delivery == DeliveryMode::EffectivelyOnce {
        // Separate connection so dedupe lookups never queue behind a blocking read.
        let dedupe: Arc<dyn DedupeStore> = connect(config).await?;
        consumer_loop = consumer_loop.with_dedupe(dedupe);
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
            on_signal.cancel();
        }
    });

    let stats = if once {
        consumer_loop.run_once(&shutdown).await?
    } else {
        consumer_loop.run(shutdown).await?
    };
    tracing::info!(
        handled = stats.handled,
        acknowledged = stats.acknowledged,
        handler_failures = stats.handler_failures,
        malformed = stats.malformed,
        duplicates = stats.duplicates,
        "consumer finished"
    );
    Ok(())
}

async fn cmd_pending(config: &BusConfig, topic: &str, group: &str, count: usize) -> Result<()> {
    let stream = config.stream_key(topic);
    let store = connect(config).await?;

    for entry in store.pending(&stream, group, count).await? {
        println!(
            "{}",
            serde_json::to_string(&PendingLine {
                sequence_id: entry.id.to_string(),
                consumer: entry.consumer,
                idle_ms: entry.idle.as_millis(),
                delivery_count: entry.delivery_count,
            })?
        );
    }
    Ok(())
}
