use serde::{Deserialize, Serialize};

pub mod backoff;
pub mod config;
pub mod consumer;
pub mod error;
pub mod kafka;
pub mod logging;
pub mod message_log;
pub mod persist;
pub mod producer;
pub mod render;
pub mod shutdown;

pub use error::{Error, Result};

/// A joke as served by the HTTP source and published to the topic.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Joke {
    pub id: String,
    pub value: String,
}
