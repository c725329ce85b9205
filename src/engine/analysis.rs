//! Analysis engine: one end-to-end job per call, single-job concurrency,
//! and a database handle that is closed on every exit path.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::errors::{EmrtError, Result};
use crate::engine::aggregate::{AggregateLimits, AggregateResult, aggregate};
use crate::engine::database::{DatabaseEngine, DatabaseHandle};
use crate::engine::protocol::JobId;
use crate::engine::schema::SchemaProber;

const IDLE: u64 = 0;

/// Runs analysis jobs against an opaque [`DatabaseEngine`].
pub struct AnalysisEngine {
    engine: Arc<dyn DatabaseEngine>,
    prober: SchemaProber,
    limits: AggregateLimits,
    max_input_bytes: u64,
    ready: AtomicBool,
    in_flight: AtomicU64,
    /// The only open handle, if any. Replaced per job.
    current: Mutex<Option<Box<dyn DatabaseHandle>>>,
}

/// Clears the in-flight marker when the job ends, including by panic.
struct BusyGuard<'a> {
    slot: &'a AtomicU64,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(IDLE, Ordering::Release);
    }
}

impl AnalysisEngine {
    pub fn new(
        engine: Arc<dyn DatabaseEngine>,
        limits: AggregateLimits,
        max_input_bytes: u64,
    ) -> Result<Self> {
        Ok(Self {
            engine,
            prober: SchemaProber::new()?,
            limits,
            max_input_bytes,
            ready: AtomicBool::new(false),
            in_flight: AtomicU64::new(IDLE),
            current: Mutex::new(None),
        })
    }

    /// Bring the database capability up. Jobs fail with `EngineNotReady` until
    /// this succeeds.
    pub fn initialize(&self) -> Result<()> {
        self.engine.initialize()?;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Job currently executing, if any.
    pub fn in_flight(&self) -> Option<JobId> {
        match self.in_flight.load(Ordering::Acquire) {
            IDLE => None,
            id => Some(JobId(id)),
        }
    }

    /// Analyze one export.
    ///
    /// A call that arrives while another is executing fails immediately with
    /// `WorkerBusy` and does no work. `job` must be non-zero.
    pub fn analyze(&self, job: JobId, bytes: Vec<u8>) -> Result<AggregateResult> {
        let _busy = self.try_begin(job)?;

        if !self.is_ready() {
            return Err(EmrtError::EngineNotReady);
        }
        let len = bytes.len() as u64;
        if len == 0 {
            return Err(EmrtError::EmptyInput);
        }
        if len > self.max_input_bytes {
            return Err(EmrtError::CapacityExceeded {
                len,
                cap: self.max_input_bytes,
            });
        }

        let mut slot = self.current.lock();
        if let Some(stale) = slot.take() {
            // Left behind by a job that unwound; close before opening anew.
            let _ = stale.close();
        }
        *slot = Some(self.engine.open(bytes)?);

        let outcome = match slot.as_deref() {
            Some(handle) => self.run(handle),
            None => Err(EmrtError::EngineNotReady),
        };
        let closed = slot.take().map_or(Ok(()), |handle| handle.close());
        drop(slot);

        let result = outcome?;
        closed?;
        Ok(result)
    }

    fn run(&self, handle: &dyn DatabaseHandle) -> Result<AggregateResult> {
        let candidate = self.prober.probe(handle)?;
        aggregate(handle, &candidate, &self.limits)
    }

    fn try_begin(&self, job: JobId) -> Result<BusyGuard<'_>> {
        if job.0 == IDLE {
            return Err(EmrtError::Runtime {
                details: "job id 0 is reserved".to_string(),
            });
        }
        match self
            .in_flight
            .compare_exchange(IDLE, job.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(BusyGuard {
                slot: &self.in_flight,
            }),
            Err(in_flight) => Err(EmrtError::WorkerBusy { in_flight }),
        }
    }
}

impl Drop for AnalysisEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.current.get_mut().take() {
            let _ = handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::synthetic::{SyntheticExport, generate};
    use crate::engine::database::{SqliteEngine, export_bytes};
    use crossbeam_channel::{Receiver, Sender, bounded};
    use rusqlite::Connection;
    use std::sync::atomic::AtomicUsize;

    /// Wraps SQLite and records handle open/close counts.
    #[derive(Default)]
    struct CountingEngine {
        opened: AtomicUsize,
        closed: AtomicUsize,
        open_now: AtomicUsize,
        peak_open: AtomicUsize,
    }

    struct CountingHandle {
        inner: Box<dyn DatabaseHandle>,
        engine: Arc<CountingEngine>,
    }

    impl DatabaseHandle for CountingHandle {
        fn query(
            &self,
            sql: &str,
            params: &[crate::engine::database::SqlValue],
        ) -> Result<Vec<crate::engine::database::Row>> {
            self.inner.query(sql, params)
        }

        fn close(self: Box<Self>) -> Result<()> {
            self.engine.closed.fetch_add(1, Ordering::SeqCst);
            self.engine.open_now.fetch_sub(1, Ordering::SeqCst);
            self.inner.close()
        }
    }

    struct SharedCounting(Arc<CountingEngine>);

    impl DatabaseEngine for SharedCounting {
        fn initialize(&self) -> Result<()> {
            SqliteEngine.initialize()
        }

        fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn DatabaseHandle>> {
            let inner = SqliteEngine.open(bytes)?;
            self.0.opened.fetch_add(1, Ordering::SeqCst);
            let now = self.0.open_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak_open.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(CountingHandle {
                inner,
                engine: Arc::clone(&self.0),
            }))
        }
    }

    /// Blocks inside `open` until released, so a job can be held in flight.
    struct GatedEngine {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl DatabaseEngine for GatedEngine {
        fn initialize(&self) -> Result<()> {
            Ok(())
        }

        fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn DatabaseHandle>> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            SqliteEngine.open(bytes)
        }
    }

    fn ready_engine(engine: Arc<dyn DatabaseEngine>) -> AnalysisEngine {
        let analysis =
            AnalysisEngine::new(engine, AggregateLimits::default(), 100 * 1024 * 1024).unwrap();
        analysis.initialize().unwrap();
        analysis
    }

    fn db(ddl: &str) -> Vec<u8> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(ddl).unwrap();
        export_bytes(&conn).unwrap()
    }

    fn demo_bytes() -> Vec<u8> {
        generate(&SyntheticExport::fixed(300, 7)).unwrap()
    }

    #[test]
    fn not_ready_until_initialized() {
        let analysis =
            AnalysisEngine::new(Arc::new(SqliteEngine), AggregateLimits::default(), 1024).unwrap();
        let err = analysis.analyze(JobId(1), vec![1]).unwrap_err();
        assert!(matches!(err, EmrtError::EngineNotReady));
        assert_eq!(analysis.in_flight(), None);
    }

    #[test]
    fn empty_input_rejected() {
        let analysis = ready_engine(Arc::new(SqliteEngine));
        let err = analysis.analyze(JobId(1), Vec::new()).unwrap_err();
        assert_eq!(err.reason_code(), "EMPTY FILE");
    }

    #[test]
    fn engine_side_capacity_check() {
        let analysis =
            AnalysisEngine::new(Arc::new(SqliteEngine), AggregateLimits::default(), 16).unwrap();
        analysis.initialize().unwrap();
        let err = analysis.analyze(JobId(1), vec![0; 17]).unwrap_err();
        assert!(matches!(err, EmrtError::CapacityExceeded { len: 17, cap: 16 }));
        assert_eq!(err.reason_code(), "FILE EXCEEDS CAPACITY");
    }

    #[test]
    fn database_without_tables_reports_no_tables() {
        let analysis = ready_engine(Arc::new(SqliteEngine));
        let bytes = db("PRAGMA user_version = 3;");
        let err = analysis.analyze(JobId(1), bytes).unwrap_err();
        assert_eq!(err.reason_code(), "NO TABLES FOUND");
    }

    #[test]
    fn unmatched_tables_report_invalid_schema() {
        let analysis = ready_engine(Arc::new(SqliteEngine));
        let bytes = db("CREATE TABLE billing (amount REAL); CREATE TABLE wards (name TEXT);");
        let err = analysis.analyze(JobId(1), bytes).unwrap_err();
        assert_eq!(err.reason_code(), "INVALID SCHEMA");
    }

    #[test]
    fn candidate_without_role_columns_yields_empty_series() {
        let analysis = ready_engine(Arc::new(SqliteEngine));
        let bytes = db(
            "CREATE TABLE patient_visits (id INTEGER PRIMARY KEY, ward TEXT, note TEXT);
             INSERT INTO patient_visits (ward, note) VALUES ('A', 'x'), ('B', 'y');",
        );
        let result = analysis.analyze(JobId(1), bytes).unwrap();
        assert_eq!(result, AggregateResult::default());
    }

    #[test]
    fn demo_export_is_bounded_and_deterministic() {
        let analysis = ready_engine(Arc::new(SqliteEngine));
        let first = analysis.analyze(JobId(1), demo_bytes()).unwrap();
        let second = analysis.analyze(JobId(2), demo_bytes()).unwrap();
        assert!(first.is_within(&AggregateLimits::default()));
        assert!(!first.visits.is_empty());
        assert!(!first.states.is_empty());
        assert!(!first.operators.is_empty());
        assert!(!first.duration.is_empty());
        assert_eq!(first, second);
        assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
    }

    #[test]
    fn every_job_opens_and_closes_exactly_once() {
        let counts = Arc::new(CountingEngine::default());
        let analysis = ready_engine(Arc::new(SharedCounting(Arc::clone(&counts))));

        analysis.analyze(JobId(1), demo_bytes()).unwrap();
        analysis
            .analyze(JobId(2), db("CREATE TABLE billing (x);"))
            .unwrap_err();
        analysis.analyze(JobId(3), db("")).unwrap_err();
        analysis
            .analyze(JobId(4), b"not a database at all, just text".to_vec())
            .unwrap_err();

        let opened = counts.opened.load(Ordering::SeqCst);
        assert_eq!(opened, counts.closed.load(Ordering::SeqCst));
        assert_eq!(counts.open_now.load(Ordering::SeqCst), 0);
        assert_eq!(counts.peak_open.load(Ordering::SeqCst), 1);
        assert!(opened >= 2);
    }

    #[test]
    fn concurrent_call_fails_fast_with_busy() {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let analysis = Arc::new(ready_engine(Arc::new(GatedEngine {
            entered: entered_tx,
            release: release_rx,
        })));

        let worker = {
            let analysis = Arc::clone(&analysis);
            std::thread::spawn(move || analysis.analyze(JobId(1), demo_bytes()))
        };
        entered_rx.recv().unwrap();
        assert_eq!(analysis.in_flight(), Some(JobId(1)));

        let err = analysis.analyze(JobId(2), demo_bytes()).unwrap_err();
        assert!(matches!(err, EmrtError::WorkerBusy { in_flight: 1 }));

        release_tx.send(()).unwrap();
        let first = worker.join().unwrap().expect("first job unaffected");
        assert!(!first.visits.is_empty());
        assert_eq!(analysis.in_flight(), None);
    }
}
