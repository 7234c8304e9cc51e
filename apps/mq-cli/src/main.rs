//! MQ CLI
//!
//! Sends messages to a topic or listens on one, using the mq client with a
//! YAML configuration (URL or path) or `MQ_*` environment variables.

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::Result;
use mq_client::{
    ConsumerClient, ErrorCallback, InitCallback, InitReport, MqConfig, MqError, NatsConnector,
    ProducerClient, TopicMessage,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mq-cli")]
#[command(about = "Send and receive messages through the mq client")]
struct Cli {
    /// URL or path of the YAML configuration. Falls back to MQ_* variables.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message
    Send {
        #[arg(short, long)]
        topic: String,

        /// Message body
        #[arg(short, long)]
        body: String,

        #[arg(long)]
        tag: Option<String>,

        /// Message key, may be repeated
        #[arg(short, long = "key")]
        keys: Vec<String>,

        /// Messages with the same sharding key share a queue
        #[arg(long)]
        sharding_key: Option<String>,

        /// Do not wait for the broker acknowledgement
        #[arg(long)]
        one_way: bool,
    },

    /// Print messages of a topic until Ctrl-C
    Listen {
        #[arg(short, long)]
        topic: String,

        /// Print message metadata as well as the body
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();
    init_tracing(&Environment::from_env());

    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            topic,
            body,
            tag,
            keys,
            sharding_key,
            one_way,
        } => {
            let producer = ProducerClient::new(Arc::new(NatsConnector));
            match &cli.config {
                Some(location) => producer.init(location).await?,
                None => producer.init_with_config(MqConfig::from_env()?, None).await?,
            }

            let mut message = TopicMessage::new(topic, body).with_keys(keys);
            if let Some(tag) = tag {
                message = message.with_tag(tag);
            }
            if let Some(key) = sharding_key {
                message = message.with_sharding_key(key);
            }

            let result = if one_way {
                producer.send_one_way(&message).await.map(|()| {
                    info!(topic = %message.topic, "Message sent without acknowledgement");
                })
            } else {
                producer.send_sync(&message).await.map(|receipt| {
                    println!(
                        "{} {} queue={} offset={}",
                        receipt.topic, receipt.msg_id, receipt.queue_id, receipt.queue_offset
                    );
                })
            };

            producer.close().await?;
            result?;
        }

        Commands::Listen { topic, full } => {
            let consumer = ConsumerClient::new(Arc::new(NatsConnector));
            let on_init: InitCallback = Arc::new(|report: InitReport| {
                if let Some(e) = &report.check_error {
                    warn!(error = %e, "Connection check");
                }
                match (&report.init_error, &report.version) {
                    (Some(e), _) => error!(error = %e, "Consumer initialization failed"),
                    (None, Some(version)) => info!(version = %version, "Consumer initialized"),
                    (None, None) => {}
                }
            });

            match &cli.config {
                Some(location) => consumer.init(location, Some(on_init)).await?,
                None => {
                    consumer
                        .init_with_config(MqConfig::from_env()?, Some(on_init))
                        .await?
                }
            }

            let (stop, shutdown) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, stopping listener");
                }
                let _ = stop.send(true);
            });

            let on_error: ErrorCallback = Arc::new(|e: &MqError| {
                error!(error = %e, kind = %e.kind(), "Listener failed");
            });

            let result = if full {
                consumer
                    .message_listener_full(
                        &topic,
                        |message| {
                            println!(
                                "{} tag={} keys={:?} queue={} offset={} reconsumed={} {}",
                                message.msg_id,
                                message.tag().unwrap_or("-"),
                                message.keys(),
                                message.queue_id,
                                message.queue_offset,
                                message.reconsume_times,
                                String::from_utf8_lossy(message.body())
                            );
                        },
                        Some(on_error),
                        shutdown,
                    )
                    .await
            } else {
                consumer
                    .message_listener(
                        &topic,
                        |body| println!("{}", String::from_utf8_lossy(&body)),
                        Some(on_error),
                        shutdown,
                    )
                    .await
            };

            consumer.close().await?;
            result?;
        }
    }

    Ok(())
}
