//! Isolated worker thread hosting the analysis engine.
//!
//! The worker owns the [`AnalysisEngine`] and therefore the only database
//! handle; the coordinator reaches it exclusively through the protocol
//! channels. Boot sequence: build engine → initialize → `READY`. A failed
//! initialization is reported as `ERROR { job: None, "INIT FAILED" }` and the
//! thread exits.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};

use crate::core::errors::{EmrtError, Result};
use crate::engine::aggregate::AggregateLimits;
use crate::engine::analysis::AnalysisEngine;
use crate::engine::database::DatabaseEngine;
use crate::engine::protocol::{EngineEvent, EngineRequest, JobId};

/// Coordinator → worker. Small: the coordinator never has more than one job
/// outstanding.
const REQUEST_CHANNEL_CAP: usize = 4;
/// Worker → coordinator.
const EVENT_CHANNEL_CAP: usize = 16;

/// What the worker needs to build its engine.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub limits: AggregateLimits,
    pub max_input_bytes: u64,
}

/// Coordinator-side ends of a running worker.
pub struct WorkerHandle {
    pub requests: Sender<EngineRequest>,
    pub events: Receiver<EngineEvent>,
    pub join: thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// True once the worker thread has exited, cleanly or by panic.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Spawn the worker thread. Readiness arrives later as [`EngineEvent::Ready`].
pub fn spawn_worker(
    engine: Arc<dyn DatabaseEngine>,
    settings: WorkerSettings,
    generation: u32,
) -> Result<WorkerHandle> {
    let (req_tx, req_rx) = bounded::<EngineRequest>(REQUEST_CHANNEL_CAP);
    let (evt_tx, evt_rx) = bounded::<EngineEvent>(EVENT_CHANNEL_CAP);

    let join = thread::Builder::new()
        .name(format!("emrt-worker-{generation}"))
        .spawn(move || worker_main(engine, settings, &req_rx, &evt_tx))
        .map_err(|source| EmrtError::Runtime {
            details: format!("failed to spawn worker thread: {source}"),
        })?;

    Ok(WorkerHandle {
        requests: req_tx,
        events: evt_rx,
        join,
    })
}

#[allow(clippy::needless_pass_by_value)]
fn worker_main(
    engine: Arc<dyn DatabaseEngine>,
    settings: WorkerSettings,
    requests: &Receiver<EngineRequest>,
    events: &Sender<EngineEvent>,
) {
    let analysis = match AnalysisEngine::new(engine, settings.limits, settings.max_input_bytes)
        .and_then(|analysis| analysis.initialize().map(|()| analysis))
    {
        Ok(analysis) => analysis,
        Err(err) => {
            let init = if matches!(err, EmrtError::EngineInit { .. }) {
                err
            } else {
                EmrtError::EngineInit {
                    details: err.to_string(),
                }
            };
            let _ = events.send(error_event(None, &init));
            return;
        }
    };

    if events.send(EngineEvent::Ready).is_err() {
        return;
    }

    while let Ok(request) = requests.recv() {
        let (job, buffer) = match request {
            EngineRequest::Analyze { job, buffer } => (job, buffer),
            EngineRequest::Shutdown => return,
        };

        let event = match analysis
            .analyze(job, buffer)
            .and_then(|result| serde_json::to_value(&result).map_err(EmrtError::from))
        {
            Ok(payload) => EngineEvent::AnalysisComplete { job, payload },
            Err(err) => error_event(Some(job), &err),
        };
        if events.send(event).is_err() {
            return;
        }

        // Anything that queued up while the job ran was sent to a busy worker.
        loop {
            match requests.try_recv() {
                Ok(EngineRequest::Analyze { job: late, buffer }) => {
                    drop(buffer);
                    let busy = EmrtError::WorkerBusy { in_flight: job.0 };
                    if events.send(error_event(Some(late), &busy)).is_err() {
                        return;
                    }
                }
                Ok(EngineRequest::Shutdown) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => break,
            }
        }
    }
}

fn error_event(job: Option<JobId>, err: &EmrtError) -> EngineEvent {
    EngineEvent::Error {
        job,
        error: err.reason_code().to_string(),
        detail: Some(err.to_string()),
    }
}
