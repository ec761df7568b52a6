//! Fixed-capacity retention of the most recent messages.
//!
//! [`MessageLog`] keeps at most `capacity` entries and evicts the oldest one
//! first once full. Reads never change the order. [`SharedLog`] puts a single
//! log behind a mutex so every partition claim in the process feeds the same
//! window.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ConfigError;

/// Default number of messages retained by a consumer.
pub const DEFAULT_CAPACITY: usize = 3;

#[derive(Debug, Clone)]
pub struct MessageLog<T = String> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T: Clone> MessageLog<T> {
    /// Creates an empty log. A capacity of zero is rejected.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity(0));
        }
        Ok(Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        })
    }

    /// Appends `payload`, dropping the oldest entry first if the log is full.
    pub fn append(&mut self, payload: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(payload);
    }

    /// Copy of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A [`MessageLog`] shared between claim processors.
#[derive(Debug)]
pub struct SharedLog<T = String> {
    inner: Arc<Mutex<MessageLog<T>>>,
}

impl<T> Clone for SharedLog<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> SharedLog<T> {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        Ok(Self {
            inner: Arc::new(Mutex::new(MessageLog::new(capacity)?)),
        })
    }

    /// Appends and returns the resulting snapshot under one lock acquisition,
    /// so the caller renders exactly the window its own append produced.
    pub fn append_and_snapshot(&self, payload: T) -> Vec<T> {
        let mut log = self.inner.lock();
        log.append(payload);
        log.snapshot()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().snapshot()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }
}
