//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use emr_telemetry::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{EmrtError, Result};

// Engine
pub use crate::engine::aggregate::{AggregateLimits, AggregateResult};
pub use crate::engine::analysis::AnalysisEngine;
pub use crate::engine::database::{DatabaseEngine, DatabaseHandle, SqliteEngine};
pub use crate::engine::protocol::{EngineEvent, EngineRequest, JobId};
pub use crate::engine::schema::{ColumnRoles, SchemaCandidate, SchemaProber};

// Coordinator
pub use crate::coordinator::lifecycle::{Lifecycle, LifecycleEvent, Phase};
pub use crate::coordinator::session::{Session, Submission};
pub use crate::coordinator::supervisor::EngineHealth;
pub use crate::coordinator::validate::{Dashboard, Validation, normalize, validate};

// Logging
pub use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};
