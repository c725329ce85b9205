//! Activity logger: a dedicated thread owns the [`JsonlWriter`]; everything
//! else sends [`ActivityEvent`]s through a bounded crossbeam channel.
//!
//! `try_send` keeps the coordinator from ever blocking on logging. Events
//! that do not fit are counted and reported on the next written line.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{EmrtError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, SeriesLengths, Severity};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 256;

/// Events the session reports.
///
/// Fields are limited to identifiers, sizes, counts and codes.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    SessionStarted {
        version: String,
        config_hash: String,
    },
    SessionStopped {
        jobs: u64,
    },
    EngineReady {
        generation: u32,
    },
    /// Boot timeout or crash. `code` is the EMRT code.
    EngineFailed {
        generation: u32,
        code: &'static str,
    },
    EngineRestarted {
        generation: u32,
        restarts_left: u32,
    },
    EngineFatal {
        code: &'static str,
    },
    FileRejected {
        bytes: u64,
        code: &'static str,
    },
    SubmissionIgnored {
        in_flight: Option<u64>,
    },
    JobDispatched {
        job: u64,
        bytes: u64,
    },
    JobCompleted {
        job: u64,
        duration_ms: u64,
        series: SeriesLengths,
        fingerprint: String,
    },
    /// `reason` is the protocol reason code, never the technical detail.
    JobFailed {
        job: u64,
        duration_ms: u64,
        reason: String,
    },
    PayloadRejected {
        job: u64,
    },
    StaleResponse {
        job: u64,
    },
    /// Sentinel to stop the logger thread.
    Shutdown,
}

/// Cloneable handle for sending log events. Never blocks.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Option<Sender<ActivityEvent>>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Handle that discards everything; used when logging is off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an event. Drops it (and counts the drop) when the channel is full.
    pub fn send(&self, event: ActivityEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(TrySendError::Full(_)) = tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Drops not yet reported by the logger thread.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks only if the channel is full.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ActivityEvent::Shutdown);
        }
    }
}

/// Options for the logger thread.
#[derive(Debug, Clone)]
pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl Default for ActivityLoggerConfig {
    fn default() -> Self {
        Self {
            jsonl: JsonlConfig::default(),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the `emrt-logger` thread.
///
/// It runs until `handle.shutdown()` is called or every handle is dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx: Some(tx),
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("emrt-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl, &dropped_clone))
        .map_err(|e| EmrtError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

#[allow(clippy::needless_pass_by_value)]
fn logger_thread_main(rx: &Receiver<ActivityEvent>, jsonl_config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(jsonl_config);

    while let Ok(event) = rx.recv() {
        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        let mut entry = event_to_log_entry(&event);
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            entry.dropped = Some(d);
        }
        jsonl.write_entry(&entry);
    }

    jsonl.flush();
}

fn event_to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::SessionStarted {
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::SessionStart, Severity::Info);
            e.version = Some(version.clone());
            e.config_hash = Some(config_hash.clone());
            e
        }
        ActivityEvent::SessionStopped { jobs } => {
            let mut e = LogEntry::new(EventType::SessionStop, Severity::Info);
            e.jobs = Some(*jobs);
            e
        }
        ActivityEvent::EngineReady { generation } => {
            let mut e = LogEntry::new(EventType::EngineReady, Severity::Info);
            e.generation = Some(*generation);
            e
        }
        ActivityEvent::EngineFailed { generation, code } => {
            let mut e = LogEntry::new(EventType::EngineFailure, Severity::Warning);
            e.generation = Some(*generation);
            e.error_code = Some((*code).to_string());
            e
        }
        ActivityEvent::EngineRestarted {
            generation,
            restarts_left,
        } => {
            let mut e = LogEntry::new(EventType::EngineRestart, Severity::Warning);
            e.generation = Some(*generation);
            e.restarts_left = Some(*restarts_left);
            e
        }
        ActivityEvent::EngineFatal { code } => {
            let mut e = LogEntry::new(EventType::EngineFatal, Severity::Critical);
            e.error_code = Some((*code).to_string());
            e.restarts_left = Some(0);
            e
        }
        ActivityEvent::FileRejected { bytes, code } => {
            let mut e = LogEntry::new(EventType::FileRejected, Severity::Warning);
            e.bytes = Some(*bytes);
            e.error_code = Some((*code).to_string());
            e.phase = Some("INVALID".to_string());
            e
        }
        ActivityEvent::SubmissionIgnored { in_flight } => {
            let mut e = LogEntry::new(EventType::SubmissionIgnored, Severity::Info);
            e.job = *in_flight;
            e
        }
        ActivityEvent::JobDispatched { job, bytes } => {
            let mut e = LogEntry::new(EventType::JobDispatched, Severity::Info);
            e.job = Some(*job);
            e.bytes = Some(*bytes);
            e.phase = Some("PROCESSING".to_string());
            e
        }
        ActivityEvent::JobCompleted {
            job,
            duration_ms,
            series,
            fingerprint,
        } => {
            let mut e = LogEntry::new(EventType::JobComplete, Severity::Info);
            e.job = Some(*job);
            e.duration_ms = Some(*duration_ms);
            e.series = Some(*series);
            e.fingerprint = Some(fingerprint.clone());
            e.phase = Some("VALID".to_string());
            e
        }
        ActivityEvent::JobFailed {
            job,
            duration_ms,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::JobFailed, Severity::Warning);
            e.job = Some(*job);
            e.duration_ms = Some(*duration_ms);
            e.error_code = Some(reason.clone());
            e.phase = Some("INVALID".to_string());
            e
        }
        ActivityEvent::PayloadRejected { job } => {
            let mut e = LogEntry::new(EventType::PayloadRejected, Severity::Warning);
            e.job = Some(*job);
            e.error_code = Some("EMRT-2201".to_string());
            e.phase = Some("INVALID".to_string());
            e
        }
        ActivityEvent::StaleResponse { job } => {
            let mut e = LogEntry::new(EventType::StaleResponse, Severity::Info);
            e.job = Some(*job);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::SessionStop, Severity::Info),
    }
}
