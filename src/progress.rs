//! Human-readable progress for multi-step operations

use std::io::Write;
use std::time::Instant;

use parking_lot::Mutex;

/// Receives step updates from the orchestrator
pub trait Progress: Send + Sync {
    /// A new operation with `total` steps begins
    fn start(&self, operation: &str, total: usize);
    /// The next step begins
    fn step(&self, message: &str);
    /// A best-effort action failed and was skipped over
    fn warn(&self, message: &str);
    /// The operation ended
    fn finish(&self, success: bool, message: &str);
}

/// Discards all updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&self, _operation: &str, _total: usize) {}
    fn step(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn finish(&self, _success: bool, _message: &str) {}
}

struct BarState {
    total: usize,
    current: usize,
    started: Instant,
}

/// Single-line progress bar on stderr
pub struct ConsoleProgress {
    width: usize,
    state: Mutex<BarState>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            width: 40,
            state: Mutex::new(BarState {
                total: 1,
                current: 0,
                started: Instant::now(),
            }),
        }
    }

    fn render(&self, state: &BarState, message: &str) -> String {
        let fraction = (state.current as f64 / state.total.max(1) as f64).min(1.0);
        let filled = (fraction * self.width as f64) as usize;
        format!(
            "[{}{}] {:>5.1}% {} ({}s elapsed)",
            "=".repeat(filled),
            " ".repeat(self.width - filled),
            fraction * 100.0,
            message,
            state.started.elapsed().as_secs()
        )
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for ConsoleProgress {
    fn start(&self, _operation: &str, total: usize) {
        let mut state = self.state.lock();
        state.total = total.max(1);
        state.current = 0;
        state.started = Instant::now();
    }

    fn step(&self, message: &str) {
        let mut state = self.state.lock();
        state.current = (state.current + 1).min(state.total);
        let line = self.render(&state, message);
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r\x1b[K{}", line);
        let _ = err.flush();
    }

    fn warn(&self, message: &str) {
        let _ = writeln!(std::io::stderr().lock(), "\r\x1b[K  warning: {}", message);
    }

    fn finish(&self, success: bool, message: &str) {
        let mut err = std::io::stderr().lock();
        let mark = if success { "done" } else { "failed" };
        let _ = writeln!(err);
        let _ = writeln!(err, "{}: {}", mark, message);
    }
}

/// An update captured by [`RecordingProgress`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Start { operation: String, total: usize },
    Step(String),
    Warn(String),
    Finish { success: bool, message: String },
}

/// Keeps every update in memory
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// Messages of all step events, in order
    pub fn steps(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Step(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Warn(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Progress for RecordingProgress {
    fn start(&self, operation: &str, total: usize) {
        self.events.lock().push(ProgressEvent::Start {
            operation: operation.to_string(),
            total,
        });
    }

    fn step(&self, message: &str) {
        self.events.lock().push(ProgressEvent::Step(message.to_string()));
    }

    fn warn(&self, message: &str) {
        self.events.lock().push(ProgressEvent::Warn(message.to_string()));
    }

    fn finish(&self, success: bool, message: &str) {
        self.events.lock().push(ProgressEvent::Finish {
            success,
            message: message.to_string(),
        });
    }
}
