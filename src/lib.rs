#![forbid(unsafe_code)]

//! EMR export telemetry (emrt): turns an untrusted EMR database export into a
//! small set of aggregate-only series, entirely offline.
//!
//! Pipeline:
//! 1. **Coordinator** checks the file size, reads the bytes, and moves them to
//!    the isolated worker under an explicit job id.
//! 2. **Engine** loads the export from memory, picks a visit/event table by
//!    name, infers column roles, and runs bounded aggregations.
//! 3. **Validator** checks the result shape before anything renders it.
//!
//! Nothing but counts and groupings ever leaves the worker.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use emr_telemetry::prelude::*;
//!
//! let config = Config::load(None)?;
//! let mut session = Session::start(&config, Arc::new(SqliteEngine), ActivityLoggerHandle::disabled())?;
//! session.submit_file(std::path::Path::new("export.sqlite"))?;
//! let phase = session.wait();
//! println!("{phase}: {}", session.lifecycle().message());
//! # Ok::<(), EmrtError>(())
//! ```

pub mod prelude;

pub mod coordinator;
pub mod core;
pub mod demo;
pub mod engine;
pub mod logger;
