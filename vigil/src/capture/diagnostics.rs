//! Bounded capture of a subprocess's diagnostic output.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Default number of stderr lines retained for failure reports.
pub const DEFAULT_TAIL_LINES: usize = 40;

/// Ring buffer holding the last few diagnostic lines.
///
/// Only the most recent `capacity` lines are kept no matter how chatty the
/// process is.
#[derive(Debug)]
pub struct StderrTail {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a line, dropping the oldest once full. Blank lines are ignored.
    pub fn push(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    /// Lines currently held, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Lines joined with ` | `, or `(none)` when nothing was captured.
    pub fn summary(&self) -> String {
        let lines = self.lines.lock();
        if lines.is_empty() {
            return "(none)".to_string();
        }
        lines.iter().map(String::as_str).collect::<Vec<_>>().join(" | ")
    }
}

impl Default for StderrTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}
