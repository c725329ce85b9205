//! Session context: owns the lifecycle, the engine supervisor, and the
//! in-flight job.
//!
//! One session is one run of the analyzer. Raw file bytes pass through here
//! exactly once, moving from the reader into the `ANALYZE` request; the
//! session keeps only the byte length.

#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::coordinator::lifecycle::{Lifecycle, LifecycleEvent, Phase, Status, TransitionError};
use crate::coordinator::supervisor::{EngineHealth, EngineSupervisor, Fault, SupervisorEvent};
use crate::coordinator::validate::{Dashboard, normalize};
use crate::core::config::Config;
use crate::core::errors::{EmrtError, Result};
use crate::engine::aggregate::{AggregateLimits, AggregateResult};
use crate::engine::database::DatabaseEngine;
use crate::engine::protocol::{EngineEvent, JobId};
use crate::engine::worker::WorkerSettings;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::logger::jsonl::SeriesLengths;

/// What happened to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Sent to the engine as `job`.
    Dispatched(JobId),
    /// Resolved to `INVALID` without reaching the engine.
    Rejected,
    /// A job was already in flight; nothing changed.
    Ignored { in_flight: Option<JobId> },
}

pub struct Session {
    lifecycle: Lifecycle,
    supervisor: EngineSupervisor,
    logger: ActivityLoggerHandle,
    next_job: u64,
    jobs_run: u64,
    job_started: Option<Instant>,
    dashboard: Option<Dashboard>,
    fingerprint: Option<String>,
    poll_interval: Duration,
}

impl Session {
    /// Start the engine and wait for it to come up (or give up).
    pub fn start(
        config: &Config,
        engine: Arc<dyn DatabaseEngine>,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        logger.send(ActivityEvent::SessionStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: config.stable_hash()?,
        });

        let settings = WorkerSettings {
            limits: AggregateLimits::from(&config.limits),
            max_input_bytes: config.limits.max_file_bytes,
        };
        let supervisor = EngineSupervisor::new(engine, settings, &config.engine, logger.clone());

        let mut session = Self {
            lifecycle: Lifecycle::new(config.limits.max_file_bytes),
            supervisor,
            logger,
            next_job: 1,
            jobs_run: 0,
            job_started: None,
            dashboard: None,
            fingerprint: None,
            poll_interval: Duration::from_millis(config.engine.health_check_interval_ms),
        };
        if let Some(fault) = session.supervisor.start() {
            session.on_fault(fault);
        }
        Ok(session)
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    pub fn engine_health(&self) -> EngineHealth {
        self.supervisor.health()
    }

    /// Normalized result of the last successful job.
    pub fn dashboard(&self) -> Option<&Dashboard> {
        self.dashboard.as_ref()
    }

    /// Fingerprint of the last successful job's aggregate.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Jobs handed to the engine so far.
    pub fn jobs_run(&self) -> u64 {
        self.jobs_run
    }

    /// Submit a file from disk. The size is checked before anything is read.
    pub fn submit_file(&mut self, path: &Path) -> Result<Submission> {
        let len = fs::metadata(path)
            .map_err(|source| EmrtError::io(path, source))?
            .len();
        if let Some(early) = self.select(len) {
            return Ok(early);
        }
        match fs::read(path) {
            Ok(bytes) => Ok(self.dispatch(bytes)),
            Err(source) => {
                let err = EmrtError::io(path, source);
                self.transition(LifecycleEvent::ReadFailed {
                    detail: err.to_string(),
                });
                Ok(Submission::Rejected)
            }
        }
    }

    /// Submit bytes already in memory. Ownership moves to the engine.
    pub fn submit_bytes(&mut self, bytes: Vec<u8>) -> Submission {
        if let Some(early) = self.select(bytes.len() as u64) {
            return early;
        }
        self.dispatch(bytes)
    }

    /// Process at most one engine event, waiting up to `timeout`.
    ///
    /// Returns the new phase when the event changed the lifecycle.
    pub fn poll(&mut self, timeout: Duration) -> Option<Phase> {
        match self.supervisor.next_event(timeout)? {
            SupervisorEvent::Fault(fault) => {
                self.on_fault(fault);
                Some(self.lifecycle.phase())
            }
            SupervisorEvent::Job(EngineEvent::AnalysisComplete { job, payload }) => {
                if self.is_stale(job) {
                    return None;
                }
                let elapsed = self.take_elapsed_ms();
                match normalize(&payload) {
                    Ok(dashboard) => {
                        let fingerprint = serde_json::from_value::<AggregateResult>(payload)
                            .ok()
                            .and_then(|result| result.fingerprint().ok());
                        self.logger.send(ActivityEvent::JobCompleted {
                            job: job.0,
                            duration_ms: elapsed,
                            series: SeriesLengths {
                                visits: dashboard.visits.len(),
                                duration: dashboard.duration.len(),
                                states: dashboard.states.len(),
                                operators: dashboard.operators.len(),
                            },
                            fingerprint: fingerprint.clone().unwrap_or_default(),
                        });
                        self.dashboard = Some(dashboard);
                        self.fingerprint = fingerprint;
                        self.transition(LifecycleEvent::JobSucceeded { job })
                    }
                    Err(err) => {
                        self.logger.send(ActivityEvent::PayloadRejected { job: job.0 });
                        let reason = match err {
                            EmrtError::PayloadRejected { reason } => reason,
                            other => other.to_string(),
                        };
                        self.transition(LifecycleEvent::PayloadRejected { job, reason })
                    }
                }
            }
            SupervisorEvent::Job(EngineEvent::Error {
                job: Some(job),
                error,
                detail,
            }) => {
                if self.is_stale(job) {
                    return None;
                }
                let elapsed = self.take_elapsed_ms();
                self.logger.send(ActivityEvent::JobFailed {
                    job: job.0,
                    duration_ms: elapsed,
                    reason: error.clone(),
                });
                self.transition(LifecycleEvent::JobFailed {
                    job,
                    reason: error,
                    detail,
                })
            }
            SupervisorEvent::Job(_) => None,
        }
    }

    /// Block until the current job (if any) resolves. There is no wall-clock
    /// limit; the engine's row caps bound the work.
    pub fn wait(&mut self) -> Phase {
        while self.lifecycle.phase().is_busy() {
            if self.poll(self.poll_interval).is_none()
                && self.supervisor.health() == EngineHealth::Fatal
            {
                self.transition(LifecycleEvent::EngineFault {
                    fatal: true,
                    detail: None,
                });
            }
        }
        self.lifecycle.phase()
    }

    /// Stop the engine and log the session summary.
    pub fn shutdown(mut self) {
        self.supervisor.shutdown();
        self.logger.send(ActivityEvent::SessionStopped {
            jobs: self.jobs_run,
        });
    }

    /// Returns `Some` when the selection resolved without a read.
    fn select(&mut self, len: u64) -> Option<Submission> {
        match self.lifecycle.apply(LifecycleEvent::FileSelected { len }) {
            Ok(Phase::Received) => {
                self.dashboard = None;
                self.fingerprint = None;
                None
            }
            Ok(_) => {
                self.dashboard = None;
                self.fingerprint = None;
                let code = if self.lifecycle.is_fatal() {
                    EmrtError::RestartBudgetExhausted {
                        budget: self.supervisor.max_restarts(),
                    }
                    .code()
                } else if len == 0 {
                    EmrtError::EmptyInput.code()
                } else {
                    EmrtError::CapacityExceeded {
                        len,
                        cap: self.lifecycle.max_file_bytes(),
                    }
                    .code()
                };
                self.logger.send(ActivityEvent::FileRejected { bytes: len, code });
                Some(Submission::Rejected)
            }
            Err(TransitionError::Busy { in_flight, .. }) => {
                self.logger.send(ActivityEvent::SubmissionIgnored {
                    in_flight: in_flight.map(|job| job.0),
                });
                Some(Submission::Ignored { in_flight })
            }
            Err(err) => {
                eprintln!("[EMRT-SESSION] {err}");
                Some(Submission::Rejected)
            }
        }
    }

    fn dispatch(&mut self, bytes: Vec<u8>) -> Submission {
        let job = JobId(self.next_job);
        self.next_job += 1;
        let len = bytes.len() as u64;
        let engine_ready = self.supervisor.is_ready();

        self.transition(LifecycleEvent::ReadComplete { job, engine_ready });
        if !engine_ready {
            drop(bytes);
            if self.supervisor.health() != EngineHealth::Fatal {
                let fault = self.supervisor.recover(EmrtError::EngineNotReady);
                self.on_fault(fault);
            }
            return Submission::Rejected;
        }

        match self.supervisor.dispatch(job, bytes) {
            Ok(()) => {
                self.jobs_run += 1;
                self.job_started = Some(Instant::now());
                self.logger.send(ActivityEvent::JobDispatched { job: job.0, bytes: len });
                Submission::Dispatched(job)
            }
            Err(err) => {
                let fault = self.supervisor.recover(err);
                self.on_fault(fault);
                Submission::Rejected
            }
        }
    }

    fn on_fault(&mut self, fault: Fault) {
        self.job_started = None;
        self.transition(LifecycleEvent::EngineFault {
            fatal: fault.is_fatal(),
            detail: Some(fault.cause.to_string()),
        });
    }

    fn is_stale(&self, job: JobId) -> bool {
        let stale = self.lifecycle.active_job() != Some(job);
        if stale {
            self.logger.send(ActivityEvent::StaleResponse { job: job.0 });
        }
        stale
    }

    fn take_elapsed_ms(&mut self) -> u64 {
        self.job_started
            .take()
            .map_or(0, |start| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    fn transition(&mut self, event: LifecycleEvent) -> Option<Phase> {
        match self.lifecycle.apply(event) {
            Ok(phase) => Some(phase),
            Err(err) => {
                eprintln!("[EMRT-SESSION] {err}");
                None
            }
        }
    }
}
