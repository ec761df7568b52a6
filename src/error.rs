use rdkafka::error::KafkaError;
use thiserror::Error;

/// Problems with static configuration. Always fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: message log capacity must be at least 1, got {0}")]
    InvalidCapacity(i64),
    #[error("invalid configuration: broker list is empty")]
    EmptyBrokers,
    #[error("invalid configuration: {0} must not be empty")]
    Empty(&'static str),
    #[error("invalid configuration: {0} must be at least 1")]
    NotPositive(&'static str),
    #[error("invalid configuration: bad source url {url}: {reason}")]
    SourceUrl { url: String, reason: String },
}

/// Broker connectivity failures on the consumer side. These end the current
/// group generation and prompt a rejoin.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer connection closed")]
    Closed,
}

/// HTTP or decoding failures while fetching a joke.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("joke source answered with HTTP {0}")]
    Status(u16),
    #[error("could not decode joke: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures writing the snapshot file. Logged, never propagated past the
/// claim processor.
#[derive(Debug, Error)]
#[error("could not persist messages to {path}: {source}")]
pub struct PersistenceError {
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

/// Failures writing to the broker on the producer side.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("could not create topic {topic}: {reason}")]
    CreateTopic { topic: String, reason: String },
    #[error("could not encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures installing the log subscriber. Fatal at startup.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("could not open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not install log subscriber: {0}")]
    Install(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
