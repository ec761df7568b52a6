// src/bin/producer.rs
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use joke_stream::backoff::Backoff;
use joke_stream::config::ProducerArgs;
use joke_stream::kafka::{ensure_topic, KafkaPublisher};
use joke_stream::logging;
use joke_stream::producer::{JokeProducer, JokeSource};
use joke_stream::shutdown::{wait_for_signal, Shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = ProducerArgs::parse().validate()?;
    logging::init(config.log_file.as_deref())?;

    info!(brokers = %config.brokers, topic = %config.topic, "starting producer");
    ensure_topic(&config.brokers, &config.topic, config.partitions, config.replication).await?;

    let publisher = KafkaPublisher::new(&config.brokers, &config.topic)?;
    let source = JokeSource::new(config.source_url.clone(), config.insecure_tls)?
        .with_retries(config.fetch_retries, Backoff::new(Duration::from_secs(1), Duration::from_secs(30)));
    let producer = JokeProducer::new(source, publisher, config.interval);

    let shutdown = Shutdown::new();
    let signals = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(signal) => {
                    info!(signal, "termination signal received");
                    shutdown.trigger();
                }
                Err(e) => error!(error = %e, "could not listen for signals"),
            }
        })
    };

    let result = producer
        .run_and_flush(shutdown.listener(), Duration::from_secs(5))
        .await;
    signals.abort();

    match result {
        Ok(published) => {
            info!(published, "producer finished");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "producer stopped");
            Err(e.into())
        }
    }
}
