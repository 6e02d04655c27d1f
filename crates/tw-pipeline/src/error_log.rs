//! Bounded rolling error log.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tw_core::SourceToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    /// Reporting source, if any.
    pub source: Option<SourceToken>,
    pub message: String,
}

/// Keeps the most recent `capacity` records, oldest trimmed first.
#[derive(Debug)]
pub struct ErrorLog {
    capacity: usize,
    entries: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, source: Option<SourceToken>, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(ErrorRecord {
            at: Utc::now(),
            source,
            message: message.into(),
        });
    }

    /// Records, oldest first.
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_trimmed_first() {
        let log = ErrorLog::new(3);
        for n in 0..5 {
            log.push(Some(SourceToken::new(n)), format!("error {n}"));
        }
        let messages: Vec<String> = log.snapshot().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["error 2", "error 3", "error 4"]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let log = ErrorLog::new(0);
        log.push(None, "a");
        log.push(None, "b");
        assert_eq!(log.snapshot()[0].message, "b");
    }
}
