//! Coordinator ⇄ worker message protocol.
//!
//! Every request and response that concerns a job carries its [`JobId`], so
//! the coordinator can discard late responses instead of relying on there
//! being only one job at a time.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Monotonic per-session job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Coordinator → worker.
#[derive(Debug)]
pub enum EngineRequest {
    /// Analyze an export. The buffer moves into the worker; the sender keeps
    /// no copy.
    Analyze { job: JobId, buffer: Vec<u8> },
    /// Finish the current job (if any) and exit.
    Shutdown,
}

/// Worker → coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Sent once, after the engine initialized.
    Ready,
    /// Serialized `AggregateResult`. Untrusted until validated.
    AnalysisComplete { job: JobId, payload: Value },
    /// `error` is a protocol reason code (`NO TABLES FOUND`, ...); `detail`
    /// is the technical message, kept for tooltip-level display only.
    Error {
        job: Option<JobId>,
        error: String,
        detail: Option<String>,
    },
}

impl EngineEvent {
    /// Job this event answers, if any.
    #[must_use]
    pub const fn job(&self) -> Option<JobId> {
        match self {
            Self::Ready => None,
            Self::AnalysisComplete { job, .. } => Some(*job),
            Self::Error { job, .. } => *job,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_displays_with_prefix() {
        assert_eq!(JobId(7).to_string(), "job-7");
    }

    #[test]
    fn events_report_their_job() {
        assert_eq!(EngineEvent::Ready.job(), None);
        let done = EngineEvent::AnalysisComplete {
            job: JobId(3),
            payload: Value::Null,
        };
        assert_eq!(done.job(), Some(JobId(3)));
        let init = EngineEvent::Error {
            job: None,
            error: "INIT FAILED".to_string(),
            detail: None,
        };
        assert_eq!(init.job(), None);
    }
}
