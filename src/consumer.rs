//! Consumer group membership and per-partition claim processing.
//!
//! [`GroupLoop`] keeps the process in the consumer group: it joins, runs a
//! generation until the broker revokes the assignment or fails, and rejoins
//! until shutdown is requested. Inside a generation every assigned partition
//! gets its own [`ClaimProcessor`] task fed in offset order, and all of them
//! fold records into one [`SharedLog`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::ConsumerError;
use crate::message_log::SharedLog;
use crate::persist::Persister;
use crate::render::Presenter;
use crate::shutdown::ShutdownListener;

/// Header a producer may set to tell consumers which broker it wrote to.
pub const BROKER_IP_HEADER: &str = "broker-ip";

/// Records buffered per partition claim before the poll loop waits.
const DEFAULT_CLAIM_BUFFER: usize = 64;

/// One message read from the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, Vec<u8>>,
}

impl Record {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Out-of-band details shown next to the retained messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Only present when the producer set [`BROKER_IP_HEADER`].
    pub broker_ip: Option<String>,
    pub headers: HashMap<String, Vec<u8>>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl RecordMetadata {
    pub fn from_record(record: &Record) -> Self {
        Self {
            broker_ip: record
                .headers
                .get(BROKER_IP_HEADER)
                .map(|value| String::from_utf8_lossy(value).into_owned()),
            headers: record.headers.clone(),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        }
    }
}

/// Marks a record as processed so it is not redelivered after a rebalance.
pub trait Acknowledge {
    fn acknowledge(&self, record: &Record) -> Result<(), ConsumerError>;
}

/// What the broker hands the group loop while a generation is running.
#[derive(Debug)]
pub enum GroupEvent {
    Record(Record),
    /// The assignment was revoked; the generation is over.
    Revoked,
    Error(ConsumerError),
    /// The underlying connection is gone.
    Closed,
}

/// The consumer group client seen by [`GroupLoop`].
pub trait GroupConsumer: Acknowledge + Send + Sync + 'static {
    /// Joins, or rejoins, the group for the configured topics.
    fn join(&self) -> impl Future<Output = Result<(), ConsumerError>> + Send;

    /// Waits for the next event of the current generation.
    fn poll(&self) -> impl Future<Output = GroupEvent> + Send;

    /// Releases the broker connection.
    fn close(&self);
}

/// Owns the broker connection for the lifetime of the group loop and closes
/// it exactly once when dropped.
pub struct ConnectionGuard<C: GroupConsumer> {
    consumer: Arc<C>,
}

impl<C: GroupConsumer> ConnectionGuard<C> {
    pub fn new(consumer: C) -> Self {
        Self {
            consumer: Arc::new(consumer),
        }
    }

    fn consumer(&self) -> &Arc<C> {
        &self.consumer
    }
}

impl<C: GroupConsumer> Drop for ConnectionGuard<C> {
    fn drop(&mut self) {
        self.consumer.close();
        info!("broker connection closed");
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClaimSummary {
    pub partition: i32,
    pub processed: u64,
    pub last_offset: Option<i64>,
}

/// Folds the records of one partition claim into the shared log and hands
/// every new window to the presentation and persistence sinks.
#[derive(Clone)]
pub struct ClaimProcessor {
    log: SharedLog<Vec<u8>>,
    presenter: Arc<dyn Presenter>,
    persister: Option<Arc<dyn Persister>>,
}

impl ClaimProcessor {
    pub fn new(log: SharedLog<Vec<u8>>, presenter: Arc<dyn Presenter>, persister: Option<Arc<dyn Persister>>) -> Self {
        Self {
            log,
            presenter,
            persister,
        }
    }

    pub fn log(&self) -> &SharedLog<Vec<u8>> {
        &self.log
    }

    /// Handles a single record. Returns once the record has been folded in,
    /// presented, persisted and acknowledged.
    pub fn handle<A: Acknowledge + ?Sized>(&self, record: &Record, acknowledger: &A) {
        let snapshot = self.log.append_and_snapshot(record.payload.clone());
        let metadata = RecordMetadata::from_record(record);
        self.presenter.render(&snapshot, &metadata);

        if let Some(persister) = &self.persister {
            if let Err(e) = persister.persist(&snapshot) {
                warn!(error = %e, "failed to persist messages");
            }
        }

        if let Err(e) = acknowledger.acknowledge(record) {
            warn!(
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "failed to acknowledge record"
            );
        }
    }

    /// Drains a claim until it is closed or shutdown is requested. Shutdown
    /// is only observed between records, so nothing is acknowledged halfway.
    pub async fn process<A: Acknowledge + ?Sized>(
        &self,
        partition: i32,
        mut claim: mpsc::Receiver<Record>,
        acknowledger: &A,
        shutdown: &ShutdownListener,
    ) -> ClaimSummary {
        let mut summary = ClaimSummary {
            partition,
            ..Default::default()
        };
        loop {
            let record = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                record = claim.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };
            debug!(partition, offset = record.offset, "processing record");
            self.handle(&record, acknowledger);
            summary.processed += 1;
            summary.last_offset = Some(record.offset);
        }
        debug!(partition, processed = summary.processed, "claim finished");
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Joining,
    Consuming,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GenerationEnd {
    Revoked,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GroupReport {
    pub joins: u64,
    pub generations: u64,
    pub records: u64,
    pub failures: u64,
}

/// Keeps the process a member of the consumer group until shutdown.
pub struct GroupLoop<C: GroupConsumer> {
    connection: ConnectionGuard<C>,
    processor: ClaimProcessor,
    shutdown: ShutdownListener,
    backoff: Backoff,
    claim_buffer: usize,
    state: GroupState,
}

impl<C: GroupConsumer> GroupLoop<C> {
    /// Creates a loop that has not joined yet; nothing happens until
    /// [`GroupLoop::run`] is awaited.
    ///
    /// # Arguments
    /// * `consumer` - The group client. It is closed when the loop finishes.
    /// * `processor` - Shared by every partition claimed in any generation.
    /// * `shutdown` - Stops the loop between records, joins and backoffs.
    pub fn new(consumer: C, processor: ClaimProcessor, shutdown: ShutdownListener) -> Self {
        Self {
            connection: ConnectionGuard::new(consumer),
            processor,
            shutdown,
            backoff: Backoff::default(),
            claim_buffer: DEFAULT_CLAIM_BUFFER,
            state: GroupState::Idle,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_claim_buffer(mut self, claim_buffer: usize) -> Self {
        self.claim_buffer = claim_buffer.max(1);
        self
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    fn transition(&mut self, next: GroupState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "group state change");
            self.state = next;
        }
    }

    /// Runs until shutdown. The broker connection is closed once, when the
    /// loop is dropped on return.
    pub async fn run(mut self) -> GroupReport {
        let mut report = GroupReport::default();

        while !self.shutdown.is_triggered() {
            self.transition(GroupState::Joining);
            report.joins += 1;

            let consumer = Arc::clone(self.connection.consumer());
            let joined = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                joined = consumer.join() => joined,
            };

            let end = match joined {
                Ok(()) => {
                    info!("joined consumer group");
                    self.transition(GroupState::Consuming);
                    report.generations += 1;
                    self.run_generation(&mut report).await
                }
                Err(e) => {
                    warn!(error = %e, "failed to join consumer group");
                    GenerationEnd::Failed
                }
            };

            // Checked before any rejoin so a failing broker cannot keep the
            // loop spinning after shutdown.
            if self.shutdown.is_triggered() {
                break;
            }

            match end {
                GenerationEnd::Revoked => {
                    info!("assignment revoked, rejoining");
                    self.backoff.reset();
                }
                GenerationEnd::Failed => {
                    report.failures += 1;
                    let delay = self.backoff.next_delay();
                    info!(?delay, "rejoining after backoff");
                    tokio::select! {
                        biased;
                        _ = self.shutdown.triggered() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                GenerationEnd::Cancelled => break,
            }
        }

        self.transition(GroupState::Terminated);
        info!(
            joins = report.joins,
            generations = report.generations,
            records = report.records,
            "left consumer group"
        );
        report
    }

    async fn run_generation(&mut self, report: &mut GroupReport) -> GenerationEnd {
        let consumer = Arc::clone(self.connection.consumer());
        let mut claims: HashMap<i32, mpsc::Sender<Record>> = HashMap::new();
        let mut tasks = JoinSet::new();

        let end = loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break GenerationEnd::Cancelled,
                event = consumer.poll() => event,
            };

            match event {
                GroupEvent::Record(record) => {
                    let claim = claims.entry(record.partition).or_insert_with(|| {
                        let (sender, receiver) = mpsc::channel(self.claim_buffer);
                        let processor = self.processor.clone();
                        let acknowledger = Arc::clone(&consumer);
                        let shutdown = self.shutdown.clone();
                        let partition = record.partition;
                        info!(partition, "claimed partition");
                        tasks.spawn(async move {
                            processor
                                .process(partition, receiver, acknowledger.as_ref(), &shutdown)
                                .await
                        });
                        sender
                    });
                    if claim.send(record).await.is_err() {
                        // The claim only stops early on shutdown.
                        break GenerationEnd::Cancelled;
                    }
                }
                GroupEvent::Revoked => break GenerationEnd::Revoked,
                GroupEvent::Error(e) => {
                    warn!(error = %e, "consumer error, ending generation");
                    break GenerationEnd::Failed;
                }
                GroupEvent::Closed => {
                    warn!("consumer connection closed, ending generation");
                    break GenerationEnd::Failed;
                }
            }
        };

        // Closing the senders lets every claim drain what it already holds.
        drop(claims);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(summary) => report.records += summary.processed,
                Err(e) => warn!(error = %e, "claim task failed"),
            }
        }
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RecordingPresenter;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Acks(Mutex<Vec<(i32, i64)>>);

    impl Acknowledge for Acks {
        fn acknowledge(&self, record: &Record) -> Result<(), ConsumerError> {
            self.0.lock().push((record.partition, record.offset));
            Ok(())
        }
    }

    fn processor(capacity: usize) -> (ClaimProcessor, Arc<RecordingPresenter>) {
        let presenter = Arc::new(RecordingPresenter::default());
        let processor = ClaimProcessor::new(SharedLog::new(capacity).unwrap(), presenter.clone(), None);
        (processor, presenter)
    }

    fn texts(snapshot: &[Vec<u8>]) -> Vec<String> {
        snapshot.iter().map(|entry| String::from_utf8_lossy(entry).into_owned()).collect()
    }

    #[test]
    fn metadata_reads_broker_header() {
        let record = Record::new("jokes", 2, 7, "hi").with_header(BROKER_IP_HEADER, "10.0.0.5");
        let metadata = RecordMetadata::from_record(&record);
        assert_eq!(metadata.broker_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(metadata.partition, 2);
        assert_eq!(metadata.offset, 7);

        let bare = RecordMetadata::from_record(&Record::new("jokes", 0, 0, "hi"));
        assert_eq!(bare.broker_ip, None);
        assert!(bare.headers.is_empty());
    }

    #[test]
    fn every_header_reaches_the_presenter() {
        let (processor, presenter) = processor(3);
        let record = Record::new("jokes", 0, 3, "hi")
            .with_header(BROKER_IP_HEADER, "10.0.0.5")
            .with_header("trace-id", vec![0xde, 0xad]);
        processor.handle(&record, &Acks::default());

        let frames = presenter.frames();
        let metadata = &frames[0].1;
        assert_eq!(metadata.broker_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(metadata.headers.len(), 2);
        assert_eq!(metadata.headers["trace-id"], vec![0xde, 0xad]);
        assert_eq!(metadata.headers[BROKER_IP_HEADER], b"10.0.0.5");
    }

    #[test]
    fn payload_bytes_are_kept_and_persisted_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.txt");
        let presenter = Arc::new(RecordingPresenter::default());
        let processor = ClaimProcessor::new(
            SharedLog::new(3).unwrap(),
            presenter.clone(),
            Some(Arc::new(crate::persist::FileSink::new(&path))),
        );

        processor.handle(&Record::new("jokes", 0, 0, vec![0xff, b'a']), &Acks::default());

        assert_eq!(processor.log().snapshot(), vec![vec![0xff, b'a']]);
        assert_eq!(presenter.frames()[0].0, vec![vec![0xff, b'a']]);
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xff, b'a', b'\n']);
    }

    #[test]
    fn handle_renders_then_acknowledges() {
        let (processor, presenter) = processor(2);
        let acks = Acks::default();
        for (offset, payload) in ["a", "b", "c"].iter().enumerate() {
            processor.handle(&Record::new("jokes", 0, offset as i64, *payload), &acks);
        }
        let frames = presenter.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(texts(&frames[2].0), vec!["b", "c"]);
        assert_eq!(*acks.0.lock(), vec![(0, 0), (0, 1), (0, 2)]);
    }

    #[tokio::test]
    async fn process_drains_until_claim_closes() {
        let (processor, _presenter) = processor(3);
        let acks = Acks::default();
        let shutdown = crate::shutdown::Shutdown::new();
        let (sender, receiver) = mpsc::channel(8);
        for offset in 0..5 {
            sender.send(Record::new("jokes", 1, offset, format!("m{offset}"))).await.unwrap();
        }
        drop(sender);

        let summary = processor.process(1, receiver, &acks, &shutdown.listener()).await;
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.last_offset, Some(4));
        let offsets: Vec<i64> = acks.0.lock().iter().map(|(_, offset)| *offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert_eq!(texts(&processor.log().snapshot()), vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn process_stops_on_shutdown_without_acknowledging() {
        let (processor, _presenter) = processor(3);
        let acks = Acks::default();
        let shutdown = crate::shutdown::Shutdown::new();
        let (sender, receiver) = mpsc::channel(8);
        sender.send(Record::new("jokes", 0, 0, "late")).await.unwrap();
        shutdown.trigger();

        let summary = processor.process(0, receiver, &acks, &shutdown.listener()).await;
        assert_eq!(summary.processed, 0);
        assert!(acks.0.lock().is_empty());
        assert!(processor.log().snapshot().is_empty());
    }
}
