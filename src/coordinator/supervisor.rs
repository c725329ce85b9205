//! Engine-health supervision.
//!
//! The supervisor owns the worker handle. It waits a bounded time for
//! `READY`, notices when the worker thread dies, and restarts it at most
//! `max_restarts` times per session. Once the budget is spent the engine is
//! `Fatal` and stays down until the user starts a new session.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, TrySendError};

use crate::core::config::EngineConfig;
use crate::core::errors::{EmrtError, Result};
use crate::engine::database::DatabaseEngine;
use crate::engine::protocol::{EngineEvent, EngineRequest, JobId};
use crate::engine::worker::{WorkerHandle, WorkerSettings, spawn_worker};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// Health of the supervised engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineHealth {
    /// Spawned, waiting for `READY`.
    Booting,
    Ready,
    /// Down, restart budget remains.
    Failed,
    /// Down for the rest of the session.
    Fatal,
}

/// An engine failure and what the supervisor did about it.
#[derive(Debug)]
pub struct Fault {
    pub cause: EmrtError,
    /// False when the restart budget was exhausted.
    pub restarted: bool,
}

impl Fault {
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.restarted
    }
}

/// What [`EngineSupervisor::next_event`] observed.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Completion or error for a job.
    Job(EngineEvent),
    Fault(Fault),
}

pub struct EngineSupervisor {
    engine: Arc<dyn DatabaseEngine>,
    settings: WorkerSettings,
    boot_timeout: Duration,
    max_restarts: u32,
    restarts_used: u32,
    generation: u32,
    worker: Option<WorkerHandle>,
    health: EngineHealth,
    logger: ActivityLoggerHandle,
}

impl EngineSupervisor {
    #[must_use]
    pub fn new(
        engine: Arc<dyn DatabaseEngine>,
        settings: WorkerSettings,
        config: &EngineConfig,
        logger: ActivityLoggerHandle,
    ) -> Self {
        Self {
            engine,
            settings,
            boot_timeout: Duration::from_millis(config.boot_timeout_ms),
            max_restarts: config.max_restarts,
            restarts_used: 0,
            generation: 0,
            worker: None,
            health: EngineHealth::Failed,
            logger,
        }
    }

    pub fn health(&self) -> EngineHealth {
        self.health
    }

    pub fn is_ready(&self) -> bool {
        self.health == EngineHealth::Ready
    }

    /// Generation of the current worker; 0 is the first boot.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    pub fn restarts_left(&self) -> u32 {
        self.max_restarts.saturating_sub(self.restarts_used)
    }

    /// First boot. `None` when the engine came up on the first try.
    pub fn start(&mut self) -> Option<Fault> {
        match self.boot() {
            Ok(()) => None,
            Err(cause) => Some(self.recover(cause)),
        }
    }

    /// Handle a failure: restart if budget remains, otherwise go fatal.
    ///
    /// A restart that itself fails to boot consumes further budget.
    pub fn recover(&mut self, cause: EmrtError) -> Fault {
        self.logger.send(ActivityEvent::EngineFailed {
            generation: self.generation,
            code: cause.code(),
        });
        self.retire();

        let mut cause = cause;
        loop {
            if self.health == EngineHealth::Fatal || self.restarts_left() == 0 {
                self.health = EngineHealth::Fatal;
                eprintln!(
                    "[EMRT-SUPERVISOR] engine down ({}), restart budget of {} exhausted",
                    cause.code(),
                    self.max_restarts
                );
                self.logger.send(ActivityEvent::EngineFatal { code: cause.code() });
                return Fault {
                    cause: EmrtError::RestartBudgetExhausted {
                        budget: self.max_restarts,
                    },
                    restarted: false,
                };
            }

            self.restarts_used += 1;
            self.generation += 1;
            eprintln!(
                "[EMRT-SUPERVISOR] engine down ({}), restarting as generation {}",
                cause.code(),
                self.generation
            );
            self.logger.send(ActivityEvent::EngineRestarted {
                generation: self.generation,
                restarts_left: self.restarts_left(),
            });

            match self.boot() {
                Ok(()) => {
                    return Fault {
                        cause,
                        restarted: true,
                    };
                }
                Err(next) => {
                    self.logger.send(ActivityEvent::EngineFailed {
                        generation: self.generation,
                        code: next.code(),
                    });
                    self.retire();
                    cause = next;
                }
            }
        }
    }

    /// Send a job. The buffer moves into the request.
    pub fn dispatch(&mut self, job: JobId, buffer: Vec<u8>) -> Result<()> {
        if !self.is_ready() {
            return Err(EmrtError::EngineNotReady);
        }
        let worker = self.worker.as_ref().ok_or(EmrtError::EngineNotReady)?;
        match worker.requests.try_send(EngineRequest::Analyze { job, buffer }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EmrtError::WorkerBusy { in_flight: job.0 }),
            Err(TrySendError::Disconnected(_)) => Err(EmrtError::EngineCrashed),
        }
    }

    /// Wait up to `timeout` for something to happen.
    ///
    /// A dead worker is detected either by its event channel disconnecting or
    /// by its thread having finished; both trigger [`Self::recover`].
    pub fn next_event(&mut self, timeout: Duration) -> Option<SupervisorEvent> {
        let worker = self.worker.as_ref()?;
        let received = worker.events.recv_timeout(timeout);
        match received {
            Ok(EngineEvent::Ready) => None,
            Ok(EngineEvent::Error {
                job: None,
                error,
                detail,
            }) => {
                let cause = EmrtError::EngineInit {
                    details: detail.unwrap_or(error),
                };
                Some(SupervisorEvent::Fault(self.recover(cause)))
            }
            Ok(event) => Some(SupervisorEvent::Job(event)),
            Err(RecvTimeoutError::Timeout) => {
                if worker.is_finished() {
                    Some(SupervisorEvent::Fault(self.recover(EmrtError::EngineCrashed)))
                } else {
                    None
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                Some(SupervisorEvent::Fault(self.recover(EmrtError::EngineCrashed)))
            }
        }
    }

    /// Stop the worker. Waits for a healthy worker to finish its current job.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.requests.try_send(EngineRequest::Shutdown);
            drop(worker.requests);
            if self.health == EngineHealth::Ready || worker.join.is_finished() {
                let _ = worker.join.join();
            }
        }
        if self.health != EngineHealth::Fatal {
            self.health = EngineHealth::Failed;
        }
    }

    fn boot(&mut self) -> Result<()> {
        self.health = EngineHealth::Booting;
        let worker = match spawn_worker(Arc::clone(&self.engine), self.settings, self.generation) {
            Ok(worker) => worker,
            Err(err) => {
                self.health = EngineHealth::Failed;
                return Err(err);
            }
        };

        let outcome = match worker.events.recv_timeout(self.boot_timeout) {
            Ok(EngineEvent::Ready) => Ok(()),
            Ok(EngineEvent::Error { error, detail, .. }) => Err(EmrtError::EngineInit {
                details: detail.unwrap_or(error),
            }),
            Ok(other) => Err(EmrtError::EngineInit {
                details: format!("unexpected event before READY: {other:?}"),
            }),
            Err(RecvTimeoutError::Timeout) => Err(EmrtError::EngineBootTimeout {
                timeout_ms: u64::try_from(self.boot_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(EmrtError::EngineCrashed),
        };

        self.worker = Some(worker);
        match outcome {
            Ok(()) => {
                self.health = EngineHealth::Ready;
                self.logger.send(ActivityEvent::EngineReady {
                    generation: self.generation,
                });
                Ok(())
            }
            Err(err) => {
                self.health = EngineHealth::Failed;
                Err(err)
            }
        }
    }

    /// Drop the current worker without waiting on it. A hung thread is left
    /// detached; it exits on its own once its channels close.
    fn retire(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.requests.try_send(EngineRequest::Shutdown);
        }
        if self.health != EngineHealth::Fatal {
            self.health = EngineHealth::Failed;
        }
    }
}

impl Drop for EngineSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::Result as EmrtResult;
    use crate::engine::aggregate::AggregateLimits;
    use crate::engine::database::{DatabaseHandle, SqliteEngine};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            limits: AggregateLimits::default(),
            max_input_bytes: 1024 * 1024,
        }
    }

    fn engine_config(boot_timeout_ms: u64, max_restarts: u32) -> EngineConfig {
        EngineConfig {
            boot_timeout_ms,
            max_restarts,
            health_check_interval_ms: 20,
        }
    }

    /// Initializes slowly for the first `slow_boots` boots.
    struct SlowBoot {
        slow_boots: u32,
        boots: AtomicU32,
    }

    impl DatabaseEngine for SlowBoot {
        fn initialize(&self) -> EmrtResult<()> {
            if self.boots.fetch_add(1, Ordering::SeqCst) < self.slow_boots {
                thread::sleep(Duration::from_millis(400));
            }
            Ok(())
        }

        fn open(&self, bytes: Vec<u8>) -> EmrtResult<Box<dyn DatabaseHandle>> {
            SqliteEngine.open(bytes)
        }
    }

    struct PanicOnOpen;

    impl DatabaseEngine for PanicOnOpen {
        fn initialize(&self) -> EmrtResult<()> {
            Ok(())
        }

        fn open(&self, _bytes: Vec<u8>) -> EmrtResult<Box<dyn DatabaseHandle>> {
            panic!("engine fault");
        }
    }

    fn wait_for_event(sup: &mut EngineSupervisor) -> SupervisorEvent {
        for _ in 0..500 {
            if let Some(event) = sup.next_event(Duration::from_millis(20)) {
                return event;
            }
        }
        panic!("no supervisor event");
    }

    #[test]
    fn healthy_engine_boots_ready() {
        let mut sup = EngineSupervisor::new(
            Arc::new(SqliteEngine),
            settings(),
            &engine_config(5000, 1),
            ActivityLoggerHandle::disabled(),
        );
        assert!(sup.start().is_none());
        assert!(sup.is_ready());
        assert_eq!(sup.generation(), 0);
        assert_eq!(sup.restarts_left(), 1);
    }

    #[test]
    fn boot_timeout_recovers_with_one_restart() {
        let engine = Arc::new(SlowBoot {
            slow_boots: 1,
            boots: AtomicU32::new(0),
        });
        let mut sup = EngineSupervisor::new(
            engine,
            settings(),
            &engine_config(50, 1),
            ActivityLoggerHandle::disabled(),
        );
        let fault = sup.start().expect("first boot times out");
        assert!(fault.restarted);
        assert_eq!(fault.cause.code(), "EMRT-3004");
        assert!(sup.is_ready());
        assert_eq!(sup.generation(), 1);
        assert_eq!(sup.restarts_left(), 0);
    }

    #[test]
    fn repeated_boot_timeout_is_fatal() {
        let engine = Arc::new(SlowBoot {
            slow_boots: u32::MAX,
            boots: AtomicU32::new(0),
        });
        let mut sup = EngineSupervisor::new(
            engine,
            settings(),
            &engine_config(30, 1),
            ActivityLoggerHandle::disabled(),
        );
        let fault = sup.start().expect("boot fails");
        assert!(fault.is_fatal());
        assert!(matches!(
            fault.cause,
            EmrtError::RestartBudgetExhausted { budget: 1 }
        ));
        assert_eq!(sup.health(), EngineHealth::Fatal);
        assert!(matches!(
            sup.dispatch(JobId(1), vec![1]),
            Err(EmrtError::EngineNotReady)
        ));
    }

    #[test]
    fn zero_budget_goes_fatal_immediately() {
        let engine = Arc::new(SlowBoot {
            slow_boots: 1,
            boots: AtomicU32::new(0),
        });
        let mut sup = EngineSupervisor::new(
            engine,
            settings(),
            &engine_config(30, 0),
            ActivityLoggerHandle::disabled(),
        );
        let fault = sup.start().unwrap();
        assert!(fault.is_fatal());
        assert_eq!(fault.cause.code(), "EMRT-3006");
        assert_eq!(sup.generation(), 0);
    }

    #[test]
    fn crash_mid_job_is_detected_and_restarted() {
        let mut sup = EngineSupervisor::new(
            Arc::new(PanicOnOpen),
            settings(),
            &engine_config(5000, 1),
            ActivityLoggerHandle::disabled(),
        );
        assert!(sup.start().is_none());
        sup.dispatch(JobId(1), vec![1, 2, 3]).unwrap();
        match wait_for_event(&mut sup) {
            SupervisorEvent::Fault(fault) => {
                assert!(fault.restarted);
                assert_eq!(fault.cause.code(), "EMRT-3005");
            }
            SupervisorEvent::Job(event) => panic!("unexpected job event: {event:?}"),
        }
        assert!(sup.is_ready());

        sup.dispatch(JobId(2), vec![1, 2, 3]).unwrap();
        match wait_for_event(&mut sup) {
            SupervisorEvent::Fault(fault) => {
                assert!(fault.is_fatal());
                assert!(fault.cause.to_string().contains("restart budget of 1 exhausted"));
            }
            SupervisorEvent::Job(event) => panic!("unexpected job event: {event:?}"),
        }
        assert_eq!(sup.health(), EngineHealth::Fatal);
    }

    #[test]
    fn job_events_are_forwarded() {
        let mut sup = EngineSupervisor::new(
            Arc::new(SqliteEngine),
            settings(),
            &engine_config(5000, 1),
            ActivityLoggerHandle::disabled(),
        );
        assert!(sup.start().is_none());
        sup.dispatch(JobId(4), b"not a database at all".to_vec()).unwrap();
        match wait_for_event(&mut sup) {
            SupervisorEvent::Job(event) => assert_eq!(event.job(), Some(JobId(4))),
            SupervisorEvent::Fault(fault) => panic!("unexpected fault: {fault:?}"),
        }
        sup.shutdown();
        assert_eq!(sup.health(), EngineHealth::Failed);
    }
}
