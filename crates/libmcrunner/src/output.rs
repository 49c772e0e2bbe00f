use chrono::{DateTime, Utc};
use mc_runner_protocol::OutputStream;
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

/// One newline-framed line read from the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    /// Line text including its trailing newline, if the child wrote one.
    pub content: String,
    pub time: DateTime<Utc>,
}

impl OutputLine {
    pub fn new(stream: OutputStream, content: impl Into<String>) -> Self {
        Self {
            stream,
            content: content.into(),
            time: Utc::now(),
        }
    }
}

/// Fixed-capacity log of the most recent console lines, replayed to newly
/// connected clients.
#[derive(Debug)]
pub struct LineRing {
    lines: RwLock<VecDeque<String>>,
    capacity: usize,
}

impl LineRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        while lines.len() >= self.capacity {
            let _ = lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Oldest to newest.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
