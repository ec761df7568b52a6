use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::error::{Error, FetchError, PublishError};
use crate::shutdown::ShutdownListener;
use crate::Joke;

/// Default HTTP source of random jokes.
pub const DEFAULT_SOURCE_URL: &str = "https://api.chucknorris.io/jokes/random";

/// Sent once before the publish loop to fail fast when the cluster is
/// unreachable.
const CONNECTIVITY_KEY: &str = "connectivity-check";
const CONNECTIVITY_PAYLOAD: &[u8] = b"Test message";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes payloads to the configured topic.
pub trait Publish: Send + Sync {
    fn publish(&self, key: &str, payload: &[u8]) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// Waits up to `timeout` for in-flight messages to be delivered.
    fn flush(&self, timeout: Duration) -> Result<(), PublishError>;
}

/// Fetches jokes from an HTTP endpoint returning `{"id": .., "value": ..}`.
pub struct JokeSource {
    client: Client,
    url: Url,
    retries: u32,
    backoff: Backoff,
}

impl JokeSource {
    /// Builds a source that fetches without retries.
    ///
    /// # Arguments
    /// * `url` - The endpoint answering GET with a JSON joke.
    /// * `insecure_tls` - Skips TLS certificate verification; a warning is
    ///   logged when set.
    pub fn new(url: Url, insecure_tls: bool) -> Result<Self, FetchError> {
        if insecure_tls {
            warn!(%url, "TLS certificate verification is disabled for the joke source");
        }
        let client = Client::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url,
            retries: 0,
            backoff: Backoff::default(),
        })
    }

    /// Retries failed fetches `retries` times before giving up.
    pub fn with_retries(mut self, retries: u32, backoff: Backoff) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    pub async fn fetch(&self) -> Result<Joke, FetchError> {
        let mut backoff = self.backoff.clone();
        let mut attempt = 0;
        loop {
            match self.fetch_once().await {
                Ok(joke) => return Ok(joke),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    let delay = backoff.next_delay();
                    warn!(error = %e, attempt, ?delay, "joke fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self) -> Result<Joke, FetchError> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Periodically fetches a joke and publishes it as JSON keyed by its id.
pub struct JokeProducer<P: Publish> {
    source: JokeSource,
    publisher: P,
    interval: Duration,
}

impl<P: Publish> JokeProducer<P> {
    pub fn new(source: JokeSource, publisher: P, interval: Duration) -> Self {
        Self {
            source,
            publisher,
            interval,
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Runs until shutdown and returns how many jokes were published. Fetch
    /// and publish failures stop the producer.
    pub async fn run(&self, shutdown: ShutdownListener) -> Result<u64, Error> {
        self.publisher.publish(CONNECTIVITY_KEY, CONNECTIVITY_PAYLOAD).await?;
        info!("connected to kafka");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut published = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }

            let joke = self.source.fetch().await?;
            let payload = serde_json::to_vec(&joke).map_err(PublishError::from)?;
            self.publisher.publish(&joke.id, &payload).await?;
            info!(id = %joke.id, joke = %joke.value, "joke published");
            published += 1;
        }
        Ok(published)
    }

    /// Like [`JokeProducer::run`], then flushes the publisher. A flush failure
    /// is logged and does not replace the error that stopped the producer.
    pub async fn run_and_flush(&self, shutdown: ShutdownListener, timeout: Duration) -> Result<u64, Error> {
        let result = self.run(shutdown).await;
        info!("flushing producer");
        if let Err(e) = self.publisher.flush(timeout) {
            warn!(error = %e, "failed to flush producer");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use parking_lot::Mutex;
    use rdkafka::error::KafkaError;
    use rdkafka::types::RDKafkaErrorCode;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_joke() -> serde_json::Value {
        serde_json::json!({
            "categories": [],
            "created_at": "2020-01-05 13:42:19.324003",
            "icon_url": "https://api.chucknorris.io/img/avatar/chuck-norris.png",
            "id": "abc123",
            "updated_at": "2020-01-05 13:42:19.324003",
            "url": "https://api.chucknorris.io/jokes/abc123",
            "value": "Chuck Norris can divide by zero."
        })
    }

    async fn source_for(server: &MockServer) -> JokeSource {
        let url = Url::parse(&format!("{}/jokes/random", server.uri())).unwrap();
        JokeSource::new(url, false).unwrap()
    }

    /// Records publishes and requests shutdown after `stop_after` of them.
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        shutdown: Shutdown,
        stop_after: usize,
        flushes: Mutex<usize>,
        flush_fails: bool,
    }

    impl RecordingPublisher {
        fn new(shutdown: &Shutdown, stop_after: usize) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                shutdown: shutdown.clone(),
                stop_after,
                flushes: Mutex::new(0),
                flush_fails: false,
            }
        }
    }

    impl Publish for RecordingPublisher {
        async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), PublishError> {
            let count = {
                let mut sent = self.sent.lock();
                sent.push((key.to_string(), payload.to_vec()));
                sent.len()
            };
            if count >= self.stop_after {
                self.shutdown.trigger();
            }
            Ok(())
        }

        fn flush(&self, _timeout: Duration) -> Result<(), PublishError> {
            *self.flushes.lock() += 1;
            if self.flush_fails {
                return Err(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut).into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn fetch_decodes_joke() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jokes/random"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_joke()))
            .expect(1)
            .mount(&server)
            .await;

        let joke = source_for(&server).await.fetch().await.unwrap();
        assert_eq!(
            joke,
            Joke {
                id: "abc123".to_string(),
                value: "Chuck Norris can divide by zero.".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn fetch_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = source_for(&server).await.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Status(503)), "got {err:?}");
    }

    #[tokio::test]
    async fn fetch_reports_bad_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = source_for(&server).await.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn fetch_retries_when_allowed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_joke()))
            .mount(&server)
            .await;

        let source = source_for(&server)
            .await
            .with_retries(2, Backoff::new(Duration::from_millis(1), Duration::from_millis(5)));
        assert_eq!(source.fetch().await.unwrap().id, "abc123");
    }

    #[tokio::test]
    async fn producer_checks_connectivity_then_publishes_until_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_joke()))
            .mount(&server)
            .await;

        let shutdown = Shutdown::new();
        let publisher = RecordingPublisher::new(&shutdown, 3);
        let producer = JokeProducer::new(source_for(&server).await, publisher, Duration::from_millis(5));

        let published = producer.run(shutdown.listener()).await.unwrap();
        assert_eq!(published, 2);

        let sent = producer.publisher().sent.lock().clone();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], (CONNECTIVITY_KEY.to_string(), CONNECTIVITY_PAYLOAD.to_vec()));
        assert_eq!(sent[1].0, "abc123");
        let decoded: Joke = serde_json::from_slice(&sent[1].1).unwrap();
        assert_eq!(decoded.value, "Chuck Norris can divide by zero.");
    }

    #[tokio::test]
    async fn producer_stops_on_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let shutdown = Shutdown::new();
        let publisher = RecordingPublisher::new(&shutdown, usize::MAX);
        let producer = JokeProducer::new(source_for(&server).await, publisher, Duration::from_millis(5));

        let err = producer.run(shutdown.listener()).await.unwrap_err();
        assert!(matches!(err, Error::Fetch(FetchError::Status(500))), "got {err:?}");
        assert_eq!(producer.publisher().sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn flush_failure_keeps_the_stopping_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let shutdown = Shutdown::new();
        let publisher = RecordingPublisher {
            flush_fails: true,
            ..RecordingPublisher::new(&shutdown, usize::MAX)
        };
        let producer = JokeProducer::new(source_for(&server).await, publisher, Duration::from_millis(5));

        let err = producer
            .run_and_flush(shutdown.listener(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch(FetchError::Status(500))), "got {err:?}");
        assert_eq!(*producer.publisher().flushes.lock(), 1);
    }

    #[tokio::test]
    async fn flushes_after_clean_shutdown() {
        let shutdown = Shutdown::new();
        let url = Url::parse("http://127.0.0.1:9/jokes/random").unwrap();
        let producer = JokeProducer::new(
            JokeSource::new(url, false).unwrap(),
            RecordingPublisher::new(&shutdown, 1),
            Duration::from_millis(5),
        );

        let published = producer
            .run_and_flush(shutdown.listener(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(published, 0);
        assert_eq!(*producer.publisher().flushes.lock(), 1);
    }
}
