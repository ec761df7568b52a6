// src/bin/consumer.rs
use std::io;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use joke_stream::config::{ConsumerArgs, ViewKind};
use joke_stream::consumer::{ClaimProcessor, GroupLoop};
use joke_stream::kafka::KafkaGroup;
use joke_stream::logging;
use joke_stream::message_log::SharedLog;
use joke_stream::persist::{FileSink, Persister};
use joke_stream::render::{Presenter, TablePresenter, ViewPresenter};
use joke_stream::shutdown::{wait_for_signal, Shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = ConsumerArgs::parse().validate()?;
    logging::init(config.log_file.as_deref())?;

    let log = SharedLog::new(config.capacity)?;
    let shutdown = Shutdown::new();

    // Connect before the view takes over the terminal, so a failure here is
    // printed to a usable terminal.
    let consumer = KafkaGroup::new(&config.brokers, &config.group, &config.topic)?;

    // --- Presentation ---
    let mut view = None;
    let presenter: Arc<dyn Presenter> = match config.view {
        ViewKind::Table => Arc::new(TablePresenter::stdout(config.capacity)),
        ViewKind::Tui => {
            let (presenter, terminal_view) = ViewPresenter::new(&config.topic, config.capacity);
            view = Some(terminal_view.spawn(shutdown.clone())?);
            Arc::new(presenter)
        }
    };
    let persister = config
        .output
        .as_ref()
        .map(|path| Arc::new(FileSink::new(path)) as Arc<dyn Persister>);

    // --- Consumer group ---
    info!(
        brokers = %config.brokers,
        group = %config.group,
        topic = %config.topic,
        capacity = config.capacity,
        "starting consumer"
    );
    let processor = ClaimProcessor::new(log, presenter, persister);
    let group = tokio::spawn(GroupLoop::new(consumer, processor, shutdown.listener()).run());

    // Either a signal or the view ends the process.
    let listener = shutdown.listener();
    let signalled = tokio::select! {
        signal = wait_for_signal() => signal.map(|signal| info!(signal, "termination signal received")),
        _ = listener.triggered() => Ok(()),
    };
    shutdown.trigger();

    // The view gives the terminal back before anything else can fail.
    let viewed = close_view(view).await;
    let report = group.await?;
    signalled?;
    viewed?;

    info!(
        records = report.records,
        generations = report.generations,
        "consumer stopped"
    );
    Ok(())
}

async fn close_view(view: Option<thread::JoinHandle<io::Result<()>>>) -> Result<()> {
    let Some(view) = view else {
        return Ok(());
    };
    match tokio::task::spawn_blocking(move || view.join()).await? {
        Ok(result) => Ok(result?),
        Err(_) => bail!("terminal view thread panicked"),
    }
}
