//! EMRT-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, EmrtError>;

/// Protocol reason code for failures that have no dedicated code.
pub const REASON_PROCESSING_FAILED: &str = "PROCESSING FAILED";

/// Top-level error type for the EMR telemetry analyzer.
#[derive(Debug, Error)]
pub enum EmrtError {
    #[error("[EMRT-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[EMRT-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[EMRT-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[EMRT-2001] input is empty")]
    EmptyInput,

    #[error("[EMRT-2002] input of {len} bytes exceeds capacity of {cap} bytes")]
    CapacityExceeded { len: u64, cap: u64 },

    #[error("[EMRT-2003] analysis engine not ready")]
    EngineNotReady,

    #[error("[EMRT-2004] database contains no tables")]
    NoTablesFound,

    #[error("[EMRT-2005] none of {table_count} tables matches a visit/event pattern")]
    NoCandidateTable { table_count: usize },

    #[error("[EMRT-2006] analysis engine busy with job {in_flight}")]
    WorkerBusy { in_flight: u64 },

    #[error("[EMRT-2007] analysis engine failed to initialize: {details}")]
    EngineInit { details: String },

    #[error("[EMRT-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[EMRT-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[EMRT-2201] payload rejected: {reason}")]
    PayloadRejected { reason: String },

    #[error("[EMRT-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[EMRT-3004] analysis engine did not signal readiness within {timeout_ms} ms")]
    EngineBootTimeout { timeout_ms: u64 },

    #[error("[EMRT-3005] analysis engine terminated abnormally")]
    EngineCrashed,

    #[error("[EMRT-3006] analysis engine restart budget of {budget} exhausted")]
    RestartBudgetExhausted { budget: u32 },

    #[error("[EMRT-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl EmrtError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "EMRT-1001",
            Self::MissingConfig { .. } => "EMRT-1002",
            Self::ConfigParse { .. } => "EMRT-1003",
            Self::EmptyInput => "EMRT-2001",
            Self::CapacityExceeded { .. } => "EMRT-2002",
            Self::EngineNotReady => "EMRT-2003",
            Self::NoTablesFound => "EMRT-2004",
            Self::NoCandidateTable { .. } => "EMRT-2005",
            Self::WorkerBusy { .. } => "EMRT-2006",
            Self::EngineInit { .. } => "EMRT-2007",
            Self::Serialization { .. } => "EMRT-2101",
            Self::Sql { .. } => "EMRT-2102",
            Self::PayloadRejected { .. } => "EMRT-2201",
            Self::Io { .. } => "EMRT-3002",
            Self::EngineBootTimeout { .. } => "EMRT-3004",
            Self::EngineCrashed => "EMRT-3005",
            Self::RestartBudgetExhausted { .. } => "EMRT-3006",
            Self::Runtime { .. } => "EMRT-3900",
        }
    }

    /// Reason string carried by an `ERROR` message from the analysis engine.
    ///
    /// The coordinator maps these to user-facing text; anything without a
    /// dedicated reason collapses to [`REASON_PROCESSING_FAILED`].
    #[must_use]
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyInput => "EMPTY FILE",
            Self::CapacityExceeded { .. } => "FILE EXCEEDS CAPACITY",
            Self::EngineNotReady => "WORKER NOT READY",
            Self::NoTablesFound => "NO TABLES FOUND",
            Self::NoCandidateTable { .. } => "INVALID SCHEMA",
            Self::WorkerBusy { .. } => "WORKER BUSY",
            Self::EngineInit { .. } => "INIT FAILED",
            _ => REASON_PROCESSING_FAILED,
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Busy rejections clear on their own once the in-flight job resolves.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerBusy { .. }
                | Self::EngineNotReady
                | Self::Io { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<rusqlite::Error> for EmrtError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for EmrtError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for EmrtError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_variant() -> Vec<EmrtError> {
        vec![
            EmrtError::InvalidConfig {
                details: String::new(),
            },
            EmrtError::MissingConfig {
                path: PathBuf::new(),
            },
            EmrtError::ConfigParse {
                context: "",
                details: String::new(),
            },
            EmrtError::EmptyInput,
            EmrtError::CapacityExceeded { len: 2, cap: 1 },
            EmrtError::EngineNotReady,
            EmrtError::NoTablesFound,
            EmrtError::NoCandidateTable { table_count: 3 },
            EmrtError::WorkerBusy { in_flight: 1 },
            EmrtError::EngineInit {
                details: String::new(),
            },
            EmrtError::Serialization {
                context: "",
                details: String::new(),
            },
            EmrtError::Sql {
                context: "",
                details: String::new(),
            },
            EmrtError::PayloadRejected {
                reason: String::new(),
            },
            EmrtError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            EmrtError::EngineBootTimeout { timeout_ms: 10 },
            EmrtError::EngineCrashed,
            EmrtError::RestartBudgetExhausted { budget: 1 },
            EmrtError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = every_variant();
        let codes: Vec<&str> = errors.iter().map(EmrtError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_starts_with_bracketed_code() {
        for err in every_variant() {
            let msg = err.to_string();
            assert!(
                msg.starts_with(&format!("[{}]", err.code())),
                "display should lead with code: {msg}"
            );
        }
    }

    #[test]
    fn analysis_failures_have_distinct_reason_codes() {
        let analysis = [
            EmrtError::EmptyInput,
            EmrtError::CapacityExceeded { len: 2, cap: 1 },
            EmrtError::EngineNotReady,
            EmrtError::NoTablesFound,
            EmrtError::NoCandidateTable { table_count: 0 },
            EmrtError::WorkerBusy { in_flight: 7 },
        ];
        let reasons: std::collections::HashSet<&str> =
            analysis.iter().map(EmrtError::reason_code).collect();
        assert_eq!(reasons.len(), analysis.len());
        assert!(!reasons.contains(REASON_PROCESSING_FAILED));
    }

    #[test]
    fn protocol_reason_strings_are_stable() {
        assert_eq!(EmrtError::NoTablesFound.reason_code(), "NO TABLES FOUND");
        assert_eq!(
            EmrtError::NoCandidateTable { table_count: 2 }.reason_code(),
            "INVALID SCHEMA"
        );
        assert_eq!(
            EmrtError::CapacityExceeded { len: 2, cap: 1 }.reason_code(),
            "FILE EXCEEDS CAPACITY"
        );
        assert_eq!(
            EmrtError::Sql {
                context: "",
                details: "file is not a database".to_string()
            }
            .reason_code(),
            REASON_PROCESSING_FAILED
        );
    }

    #[test]
    fn busy_is_retryable_schema_errors_are_not() {
        assert!(EmrtError::WorkerBusy { in_flight: 1 }.is_retryable());
        assert!(!EmrtError::NoTablesFound.is_retryable());
        assert!(!EmrtError::NoCandidateTable { table_count: 1 }.is_retryable());
        assert!(!EmrtError::CapacityExceeded { len: 2, cap: 1 }.is_retryable());
        assert!(!EmrtError::RestartBudgetExhausted { budget: 1 }.is_retryable());
    }

    #[test]
    fn io_convenience_constructor() {
        let err = EmrtError::io(
            "/tmp/export.sqlite",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "EMRT-3002");
        assert!(err.to_string().contains("/tmp/export.sqlite"));
    }

    #[test]
    fn from_rusqlite_error() {
        let sql_err =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some("test".to_string()));
        let err: EmrtError = sql_err.into();
        assert_eq!(err.code(), "EMRT-2102");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: EmrtError = json_err.into();
        assert_eq!(err.code(), "EMRT-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: EmrtError = toml_err.into();
        assert_eq!(err.code(), "EMRT-1003");
    }
}
