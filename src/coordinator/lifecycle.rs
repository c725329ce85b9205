//! File-processing lifecycle state machine.
//!
//! `IDLE → RECEIVED → PROCESSING → {VALID | INVALID}`; the next file selection
//! re-enters `RECEIVED`. Transitions happen only through [`Lifecycle::apply`],
//! which enforces the single in-flight job rule and rejects responses for any
//! job other than the active one.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinator::messages;
use crate::engine::protocol::JobId;

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Received,
    Processing,
    Valid,
    Invalid,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Received => "RECEIVED",
            Self::Processing => "PROCESSING",
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
        }
    }

    /// A job exists from acceptance until it resolves.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Received | Self::Processing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// User picked a file of `len` bytes. Nothing has been read yet.
    FileSelected { len: u64 },
    /// Bytes are in memory and the job id is assigned.
    ReadComplete { job: JobId, engine_ready: bool },
    ReadFailed { detail: String },
    /// Engine answered and the payload passed validation.
    JobSucceeded { job: JobId },
    PayloadRejected { job: JobId, reason: String },
    /// Engine answered with a reason code.
    JobFailed {
        job: JobId,
        reason: String,
        detail: Option<String>,
    },
    /// Boot timeout or crash. `fatal` once the restart budget is spent.
    EngineFault { fatal: bool, detail: Option<String> },
}

impl LifecycleEvent {
    const fn name(&self) -> &'static str {
        match self {
            Self::FileSelected { .. } => "file_selected",
            Self::ReadComplete { .. } => "read_complete",
            Self::ReadFailed { .. } => "read_failed",
            Self::JobSucceeded { .. } => "job_succeeded",
            Self::PayloadRejected { .. } => "payload_rejected",
            Self::JobFailed { .. } => "job_failed",
            Self::EngineFault { .. } => "engine_fault",
        }
    }
}

/// Why an event did not produce a transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// A job is already between acceptance and resolution.
    #[error("submission ignored: job in flight ({phase})")]
    Busy {
        phase: Phase,
        in_flight: Option<JobId>,
    },
    #[error("event {event} is not valid in phase {phase}")]
    Illegal { phase: Phase, event: &'static str },
    /// Response for a job that is no longer (or never was) active.
    #[error("response for {got} discarded; active job is {active:?}")]
    StaleJob { got: JobId, active: Option<JobId> },
}

/// User-visible status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub phase: Phase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The lifecycle of one session.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    phase: Phase,
    message: String,
    detail: Option<String>,
    active_job: Option<JobId>,
    max_file_bytes: u64,
    fatal: bool,
}

impl Lifecycle {
    #[must_use]
    pub fn new(max_file_bytes: u64) -> Self {
        Self {
            phase: Phase::Idle,
            message: messages::MSG_IDLE.to_string(),
            detail: None,
            active_job: None,
            max_file_bytes,
            fatal: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    pub fn active_job(&self) -> Option<JobId> {
        self.active_job
    }

    /// True once automated recovery has given up.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    #[must_use]
    pub fn status(&self) -> Status {
        Status {
            phase: self.phase,
            message: self.message.clone(),
            detail: self.detail.clone(),
        }
    }

    /// Apply one event. Returns the phase after the event.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<Phase, TransitionError> {
        let name = event.name();
        match event {
            LifecycleEvent::FileSelected { len } => {
                if self.phase.is_busy() {
                    return Err(TransitionError::Busy {
                        phase: self.phase,
                        in_flight: self.active_job,
                    });
                }
                if self.fatal {
                    self.enter(Phase::Invalid, messages::MSG_FATAL.to_string(), None);
                } else if len > self.max_file_bytes {
                    self.enter(
                        Phase::Invalid,
                        messages::oversized(len, self.max_file_bytes),
                        Some("FILE EXCEEDS CAPACITY".to_string()),
                    );
                } else if len == 0 {
                    self.enter(
                        Phase::Invalid,
                        messages::MSG_EMPTY_FILE.to_string(),
                        Some("EMPTY FILE".to_string()),
                    );
                } else {
                    self.enter(Phase::Received, messages::received(len), None);
                }
            }
            LifecycleEvent::ReadComplete { job, engine_ready } => {
                self.require(Phase::Received, name)?;
                if engine_ready {
                    self.active_job = Some(job);
                    self.phase = Phase::Processing;
                    self.message = messages::MSG_PROCESSING.to_string();
                    self.detail = None;
                } else if self.fatal {
                    self.enter(Phase::Invalid, messages::MSG_FATAL.to_string(), None);
                } else {
                    self.enter(
                        Phase::Invalid,
                        messages::MSG_ENGINE_UNAVAILABLE.to_string(),
                        Some("WORKER NOT READY".to_string()),
                    );
                }
            }
            LifecycleEvent::ReadFailed { detail } => {
                self.require(Phase::Received, name)?;
                self.enter(
                    Phase::Invalid,
                    messages::MSG_READ_FAILED.to_string(),
                    Some(detail),
                );
            }
            LifecycleEvent::JobSucceeded { job } => {
                self.require_job(job)?;
                self.enter(Phase::Valid, messages::MSG_VALID.to_string(), None);
            }
            LifecycleEvent::PayloadRejected { job, reason } => {
                self.require_job(job)?;
                self.enter(
                    Phase::Invalid,
                    messages::MSG_PAYLOAD_INVALID.to_string(),
                    Some(reason),
                );
            }
            LifecycleEvent::JobFailed {
                job,
                reason,
                detail,
            } => {
                self.require_job(job)?;
                let message = messages::for_reason(&reason).to_string();
                self.enter(Phase::Invalid, message, detail.or(Some(reason)));
            }
            LifecycleEvent::EngineFault { fatal, detail } => {
                self.fatal |= fatal;
                if self.phase.is_busy() {
                    let message = if self.fatal {
                        messages::MSG_FATAL
                    } else {
                        messages::MSG_ENGINE_RESTARTED
                    };
                    self.enter(Phase::Invalid, message.to_string(), detail);
                } else if self.fatal {
                    self.enter(Phase::Invalid, messages::MSG_FATAL.to_string(), detail);
                }
            }
        }
        Ok(self.phase)
    }

    fn enter(&mut self, phase: Phase, message: String, detail: Option<String>) {
        self.phase = phase;
        self.message = message;
        self.detail = detail;
        self.active_job = None;
    }

    fn require(&self, phase: Phase, event: &'static str) -> Result<(), TransitionError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(TransitionError::Illegal {
                phase: self.phase,
                event,
            })
        }
    }

    fn require_job(&self, job: JobId) -> Result<(), TransitionError> {
        if self.phase == Phase::Processing && self.active_job == Some(job) {
            Ok(())
        } else {
            Err(TransitionError::StaleJob {
                got: job,
                active: self.active_job,
            })
        }
    }
}
