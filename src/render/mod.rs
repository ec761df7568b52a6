//! Presentation of the retained message window.
//!
//! - [`table`] - clears the terminal and prints a one-row table per message
//! - [`view`] - persistent ratatui view redrawn from a watch channel

pub mod table;
pub mod view;

use std::borrow::Cow;

use crate::consumer::RecordMetadata;

pub use table::TablePresenter;
pub use view::{TerminalView, ViewPresenter};

/// Receives every new window of retained messages, oldest first. Entries are
/// the raw payload bytes.
///
/// Called on the claim processing task, so implementations must return
/// quickly and never wait on the terminal.
pub trait Presenter: Send + Sync {
    fn render(&self, snapshot: &[Vec<u8>], metadata: &RecordMetadata);
}

/// Display form of a payload; invalid UTF-8 is replaced, not rejected.
pub fn entry_text(entry: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(entry)
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingPresenter {
    frames: parking_lot::Mutex<Vec<(Vec<Vec<u8>>, RecordMetadata)>>,
}

#[cfg(test)]
impl RecordingPresenter {
    pub(crate) fn frames(&self) -> Vec<(Vec<Vec<u8>>, RecordMetadata)> {
        self.frames.lock().clone()
    }
}

#[cfg(test)]
impl Presenter for RecordingPresenter {
    fn render(&self, snapshot: &[Vec<u8>], metadata: &RecordMetadata) {
        self.frames.lock().push((snapshot.to_vec(), metadata.clone()));
    }
}
