//! Packet-path diagnostics
//!
//! Every rewrite decision produces a [`DiagEvent`]. Events are handed to a
//! [`DiagnosticSink`] and their rendered lines are kept in a small backlog
//! ring. An error-severity event flushes the backlog to the sink's `dump`, so
//! the lines leading up to a failure are available without logging every
//! packet at full verbosity.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;

use crate::metrics::RelayMetrics;
use crate::state::{ConnectionKey, Direction};

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagCategory {
    /// Connection state entry created
    StateInit,
    /// Routine per-packet trace
    Trace,
    /// Protocol or ordering anomaly
    Anomaly,
    /// Packet dropped
    Drop,
    CipherFailure,
    /// State entry removed between lookup and merge
    StateRace,
    /// Connection closed by FIN exchange or RST
    Close,
    /// Connection evicted after idle timeout
    Evicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Trace,
    Info,
    Warn,
    Error,
}

/// One diagnostic record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagEvent {
    pub category: DiagCategory,
    pub severity: Severity,
    pub direction: Option<Direction>,
    pub key: Option<ConnectionKey>,
    pub message: String,
}

impl DiagEvent {
    pub fn new(category: DiagCategory, severity: Severity, message: impl Into<String>) -> Self {
        DiagEvent {
            category,
            severity,
            direction: None,
            key: None,
            message: message.into(),
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_key(mut self, key: ConnectionKey) -> Self {
        self.key = Some(key);
        self
    }
}

impl fmt::Display for DiagEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.category)?;
        if let Some(direction) = self.direction {
            write!(f, " {}", direction)?;
        }
        if let Some(key) = self.key {
            write!(f, " [{}]", key)?;
        }
        write!(f, ": {}", self.message)
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Consumer of diagnostic events
pub trait DiagnosticSink: Send + Sync {
    /// Called for every event
    fn record(&self, event: &DiagEvent);

    /// Called when an error-severity event flushes the backlog. `backlog`
    /// holds the recent lines, oldest first, ending with the trigger.
    fn dump(&self, trigger: &DiagEvent, backlog: &[String]);
}

impl Severity {
    /// `log` level a line of this severity is written at
    pub fn level(self) -> log::Level {
        match self {
            Severity::Trace => log::Level::Trace,
            Severity::Info => log::Level::Debug,
            Severity::Warn => log::Level::Warn,
            Severity::Error => log::Level::Error,
        }
    }
}

fn log_line(severity: Severity, line: &str) {
    log::log!(severity.level(), "{}", line);
}

fn format_dump(trigger: &DiagEvent, backlog: &[String]) -> String {
    let mut out = format!("{} (last {} lines):", trigger.message, backlog.len());
    for line in backlog {
        out.push_str("\n    ");
        out.push_str(line);
    }
    out
}

/// Writes through the `log` facade on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn record(&self, event: &DiagEvent) {
        log_line(event.severity, &event.to_string());
    }

    fn dump(&self, trigger: &DiagEvent, backlog: &[String]) {
        log::error!("{}", format_dump(trigger, backlog));
    }
}

enum DiagLine {
    Record(Severity, String),
    Dump(String),
}

/// Hands lines to a dedicated logging thread over a bounded channel
///
/// The packet path never blocks on logging: when the channel is full the line
/// is dropped and counted in [`RelayMetrics::diagnostics_dropped`].
pub struct ChannelSink {
    tx: Option<Sender<DiagLine>>,
    worker: Option<JoinHandle<()>>,
    metrics: Arc<RelayMetrics>,
}

impl ChannelSink {
    pub fn spawn(capacity: usize, metrics: Arc<RelayMetrics>) -> io::Result<Self> {
        let (tx, rx) = bounded::<DiagLine>(capacity);

        let worker = thread::Builder::new()
            .name("relay-diag".into())
            .spawn(move || {
                for line in rx {
                    match line {
                        DiagLine::Record(severity, text) => log_line(severity, &text),
                        DiagLine::Dump(text) => log::error!("{}", text),
                    }
                }
            })?;

        Ok(ChannelSink {
            tx: Some(tx),
            worker: Some(worker),
            metrics,
        })
    }

    fn send(&self, line: DiagLine) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.metrics.diagnostics_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl DiagnosticSink for ChannelSink {
    fn record(&self, event: &DiagEvent) {
        // Lines the logger would discard never take a channel slot
        if !log::log_enabled!(event.severity.level()) {
            return;
        }
        self.send(DiagLine::Record(event.severity, event.to_string()));
    }

    fn dump(&self, trigger: &DiagEvent, backlog: &[String]) {
        self.send(DiagLine::Dump(format_dump(trigger, backlog)));
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once it has drained
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Keeps every event in memory; used by tests and embedding hosts that poll
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DiagEvent>>,
    dumps: Mutex<Vec<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagEvent> {
        self.events.lock().clone()
    }

    pub fn dumps(&self) -> Vec<Vec<String>> {
        self.dumps.lock().clone()
    }

    pub fn count(&self, category: DiagCategory) -> usize {
        self.events.lock().iter().filter(|e| e.category == category).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
        self.dumps.lock().clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&self, event: &DiagEvent) {
        self.events.lock().push(event.clone());
    }

    fn dump(&self, _trigger: &DiagEvent, backlog: &[String]) {
        self.dumps.lock().push(backlog.to_vec());
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Sink plus backlog ring shared by both traffic directions
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
    backlog: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn DiagnosticSink>, capacity: usize) -> Self {
        Diagnostics {
            sink,
            backlog: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
        }
    }

    pub fn emit(&self, event: DiagEvent) {
        self.sink.record(&event);

        let mut backlog = self.backlog.lock();
        backlog.push_back(event.to_string());

        if event.severity == Severity::Error {
            let lines: Vec<String> = backlog.drain(..).collect();
            drop(backlog);
            self.sink.dump(&event, &lines);
            return;
        }

        while backlog.len() > self.capacity {
            backlog.pop_front();
        }
    }

    /// Lines currently held in the backlog, oldest first
    pub fn backlog(&self) -> Vec<String> {
        self.backlog.lock().iter().cloned().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
