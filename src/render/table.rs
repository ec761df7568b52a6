use std::io::{self, Write};

use chrono::Local;
use parking_lot::Mutex;
use tabled::builder::Builder;
use tracing::warn;

use super::{entry_text, Presenter};
use crate::consumer::RecordMetadata;

const CLEAR_SCREEN: &str = "\x1b[H\x1b[2J";

/// Redraws the whole screen as a single-row table on every message: the
/// broker column followed by one column per retained message.
pub struct TablePresenter<W: Write + Send = io::Stdout> {
    out: Mutex<W>,
    columns: usize,
    clear: bool,
}

impl TablePresenter<io::Stdout> {
    pub fn stdout(columns: usize) -> Self {
        Self::new(io::stdout(), columns)
    }
}

impl<W: Write + Send> TablePresenter<W> {
    pub fn new(out: W, columns: usize) -> Self {
        Self {
            out: Mutex::new(out),
            columns,
            clear: true,
        }
    }

    /// Skips the clear-screen escape, for writers that are not terminals.
    pub fn without_clear(mut self) -> Self {
        self.clear = false;
        self
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn table(&self, snapshot: &[Vec<u8>], metadata: &RecordMetadata) -> String {
        let columns = self.columns.max(snapshot.len());
        let mut builder = Builder::default();

        let mut header = vec!["Broker IP".to_string()];
        header.extend((1..=columns).map(|n| format!("Message {n}")));
        builder.push_record(header);

        let mut row = vec![metadata.broker_ip.clone().unwrap_or_default()];
        row.extend(snapshot.iter().map(|entry| entry_text(entry).into_owned()));
        row.resize(columns + 1, String::new());
        builder.push_record(row);

        builder.build().to_string()
    }

    fn write_frame(&self, snapshot: &[Vec<u8>], metadata: &RecordMetadata) -> io::Result<()> {
        let table = self.table(snapshot, metadata);
        let mut out = self.out.lock();
        if self.clear {
            write!(out, "{CLEAR_SCREEN}")?;
        }
        writeln!(out, "{table}")?;
        writeln!(
            out,
            "{} | {} partition {} offset {}",
            Local::now().format("%H:%M:%S"),
            metadata.topic,
            metadata.partition,
            metadata.offset
        )?;
        out.flush()
    }
}

impl<W: Write + Send> Presenter for TablePresenter<W> {
    fn render(&self, snapshot: &[Vec<u8>], metadata: &RecordMetadata) {
        if let Err(e) = self.write_frame(snapshot, metadata) {
            warn!(error = %e, "failed to draw message table");
        }
    }
}
