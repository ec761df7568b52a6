//! Command line and environment configuration.
//!
//! Every option can also come from the environment, and both binaries load
//! a `.env` file first. Arguments are validated into plain config structs
//! before anything connects to the cluster.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};
use url::Url;

use crate::error::ConfigError;
use crate::message_log::DEFAULT_CAPACITY;
use crate::persist::DEFAULT_MESSAGES_FILE;
use crate::producer::DEFAULT_SOURCE_URL;

pub const DEFAULT_BROKERS: &str = "localhost:29092,localhost:39092,localhost:49092";
pub const DEFAULT_TOPIC: &str = "random-jokes";
pub const DEFAULT_GROUP: &str = "cli-consumer";

/// Log file used by the terminal view when none is given, since the view
/// owns the terminal.
pub const DEFAULT_VIEW_LOG_FILE: &str = "consumer.log";

#[derive(Debug, Clone, Args)]
pub struct BrokerArgs {
    /// Comma-separated Kafka bootstrap servers
    #[arg(long, env = "KAFKA_SERVER", default_value = DEFAULT_BROKERS)]
    pub brokers: String,

    /// Topic carrying the jokes
    #[arg(long, env = "KAFKA_TOPIC", default_value = DEFAULT_TOPIC)]
    pub topic: String,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl BrokerArgs {
    /// Validated bootstrap server list, joined the way librdkafka expects.
    pub fn bootstrap_servers(&self) -> Result<String, ConfigError> {
        let brokers: Vec<&str> = self.brokers.split(',').map(str::trim).collect();
        if brokers.iter().all(|broker| broker.is_empty()) {
            return Err(ConfigError::EmptyBrokers);
        }
        if brokers.iter().any(|broker| broker.is_empty()) {
            return Err(ConfigError::Empty("broker address"));
        }
        Ok(brokers.join(","))
    }

    fn topic(&self) -> Result<String, ConfigError> {
        non_empty(&self.topic, "topic")
    }
}

fn non_empty(value: &str, name: &'static str) -> Result<String, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Empty(name));
    }
    Ok(value.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ViewKind {
    /// Clear the screen and print a table on every message
    Table,
    /// Persistent full-screen view
    Tui,
}

/// Reads jokes from a consumer group and shows the latest ones
#[derive(Debug, Parser)]
#[command(name = "consumer", version, about)]
pub struct ConsumerArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Consumer group id
    #[arg(long, env = "KAFKA_GROUP", default_value = DEFAULT_GROUP)]
    pub group: String,

    /// Number of messages retained and displayed
    #[arg(long, env = "RETAIN_MESSAGES", default_value_t = DEFAULT_CAPACITY as i64, allow_negative_numbers = true)]
    pub capacity: i64,

    /// How to display the retained messages
    #[arg(long, env = "CONSUMER_VIEW", value_enum, default_value_t = ViewKind::Table)]
    pub view: ViewKind,

    /// File the retained messages are appended to
    #[arg(long, env = "MESSAGES_FILE", default_value = DEFAULT_MESSAGES_FILE)]
    pub output: PathBuf,

    /// Do not write messages to a file
    #[arg(long)]
    pub no_output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub brokers: String,
    pub topic: String,
    pub group: String,
    pub capacity: usize,
    pub view: ViewKind,
    pub output: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl ConsumerArgs {
    pub fn validate(&self) -> Result<ConsumerConfig, ConfigError> {
        let capacity = match usize::try_from(self.capacity) {
            Ok(capacity) if capacity >= 1 => capacity,
            _ => return Err(ConfigError::InvalidCapacity(self.capacity)),
        };
        let log_file = match (&self.broker.log_file, self.view) {
            (Some(path), _) => Some(path.clone()),
            (None, ViewKind::Tui) => Some(PathBuf::from(DEFAULT_VIEW_LOG_FILE)),
            (None, ViewKind::Table) => None,
        };
        Ok(ConsumerConfig {
            brokers: self.broker.bootstrap_servers()?,
            topic: self.broker.topic()?,
            group: non_empty(&self.group, "group")?,
            capacity,
            view: self.view,
            output: (!self.no_output).then(|| self.output.clone()),
            log_file,
        })
    }
}

/// Fetches jokes over HTTP and publishes them to Kafka
#[derive(Debug, Parser)]
#[command(name = "producer", version, about)]
pub struct ProducerArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Endpoint returning a JSON joke with `id` and `value`
    #[arg(long, env = "JOKE_SOURCE_URL", default_value = DEFAULT_SOURCE_URL)]
    pub source_url: String,

    /// Seconds between published jokes
    #[arg(long, env = "PUBLISH_INTERVAL_SECS", default_value_t = 5)]
    pub interval_secs: u64,

    /// Partitions used when the topic has to be created
    #[arg(long, default_value_t = 1)]
    pub partitions: i32,

    /// Replication factor used when the topic has to be created
    #[arg(long, default_value_t = 1)]
    pub replication: i32,

    /// Extra attempts for a failed fetch before the producer gives up
    #[arg(long, env = "FETCH_RETRIES", default_value_t = 0)]
    pub fetch_retries: u32,

    /// Skip TLS certificate verification for the joke source
    #[arg(long, env = "INSECURE_TLS")]
    pub insecure_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub brokers: String,
    pub topic: String,
    pub source_url: Url,
    pub interval: Duration,
    pub partitions: i32,
    pub replication: i32,
    pub fetch_retries: u32,
    pub insecure_tls: bool,
    pub log_file: Option<PathBuf>,
}

impl ProducerArgs {
    pub fn validate(&self) -> Result<ProducerConfig, ConfigError> {
        let source_url = Url::parse(&self.source_url).map_err(|e| ConfigError::SourceUrl {
            url: self.source_url.clone(),
            reason: e.to_string(),
        })?;
        if self.interval_secs == 0 {
            return Err(ConfigError::NotPositive("interval"));
        }
        if self.partitions < 1 {
            return Err(ConfigError::NotPositive("partitions"));
        }
        if self.replication < 1 {
            return Err(ConfigError::NotPositive("replication"));
        }
        Ok(ProducerConfig {
            brokers: self.broker.bootstrap_servers()?,
            topic: self.broker.topic()?,
            source_url,
            interval: Duration::from_secs(self.interval_secs),
            partitions: self.partitions,
            replication: self.replication,
            fetch_retries: self.fetch_retries,
            insecure_tls: self.insecure_tls,
            log_file: self.broker.log_file.clone(),
        })
    }
}
