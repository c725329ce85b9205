//! Synthetic EMR export generator for demos and test fixtures.
//!
//! Output is a SQLite image with an unrelated `ward_config` table followed by
//! a `patient_visits` table whose columns exercise every schema role, plus the
//! messy values real exports contain (nulls, text in numeric columns).

#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::{Connection, params};

use crate::core::errors::{EmrtError, Result};
use crate::engine::database::export_bytes;

const STAFF: &[&str] = &[
    "dr_okafor",
    "dr_lindqvist",
    "nurse_mbeki",
    "nurse_tanaka",
    "nurse_alvarez",
    "pa_reyes",
];
const STATUSES: &[(&str, u32)] = &[
    ("DISCHARGED", 40),
    ("ADMITTED", 20),
    ("TRIAGE", 15),
    ("WAITING", 12),
    ("TRANSFERRED", 6),
    ("LWBS", 4),
];
/// 2024-03-05T12:00:00Z, used by [`SyntheticExport::fixed`].
const FIXED_END_EPOCH: i64 = 1_709_640_000;

/// Parameters for one synthetic export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticExport {
    pub rows: usize,
    /// Arrivals are spread over this many hours before `end`.
    pub hours: u32,
    pub seed: u64,
    pub end: DateTime<Utc>,
}

impl SyntheticExport {
    /// Arrivals over the 24 hours up to the current hour.
    #[must_use]
    pub fn recent(rows: usize, seed: u64) -> Self {
        let now = Utc::now();
        let top = now.timestamp() - now.timestamp().rem_euclid(3600);
        Self {
            rows,
            hours: 24,
            seed,
            end: DateTime::from_timestamp(top, 0).unwrap_or(now),
        }
    }

    /// Clock-independent variant for reproducible fixtures.
    #[must_use]
    pub fn fixed(rows: usize, seed: u64) -> Self {
        Self {
            rows,
            hours: 24,
            seed,
            end: DateTime::from_timestamp(FIXED_END_EPOCH, 0).unwrap_or_default(),
        }
    }
}

/// Build the export and return its serialized bytes.
pub fn generate(spec: &SyntheticExport) -> Result<Vec<u8>> {
    if spec.hours == 0 {
        return Err(EmrtError::InvalidConfig {
            details: "synthetic export needs at least one hour".to_string(),
        });
    }

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let mut conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "CREATE TABLE ward_config (ward TEXT NOT NULL, beds INTEGER NOT NULL);
         INSERT INTO ward_config VALUES ('ED-A', 18), ('ED-B', 12), ('OBS', 8);
         CREATE TABLE patient_visits (
             id INTEGER PRIMARY KEY,
             arrival_time TEXT NOT NULL,
             duration_min,
             attending_staff TEXT,
             status TEXT
         );",
    )?;

    let start = spec.end - Duration::hours(i64::from(spec.hours));
    let status_total: u32 = STATUSES.iter().map(|(_, w)| w).sum();

    let tx = conn.transaction()?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO patient_visits (arrival_time, duration_min, attending_staff, status)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for _ in 0..spec.rows {
            let offset = rng.random_range(0..i64::from(spec.hours) * 3600);
            let arrival = (start + Duration::seconds(offset))
                .to_rfc3339_opts(SecondsFormat::Secs, true);

            let duration: rusqlite::types::Value = match rng.random_range(0..100) {
                0..=7 => rusqlite::types::Value::Null,
                8..=11 => rusqlite::types::Value::Text("n/a".to_string()),
                _ => rusqlite::types::Value::Integer(rng.random_range(5..240)),
            };

            let staff = if rng.random_bool(0.08) {
                None
            } else {
                Some(STAFF[rng.random_range(0..STAFF.len())])
            };

            let status = if rng.random_bool(0.03) {
                None
            } else {
                let mut pick = rng.random_range(0..status_total);
                STATUSES
                    .iter()
                    .find(|(_, weight)| {
                        if pick < *weight {
                            true
                        } else {
                            pick -= weight;
                            false
                        }
                    })
                    .map(|(name, _)| *name)
            };

            insert.execute(params![arrival, duration, staff, status])?;
        }
    }
    tx.commit()?;

    export_bytes(&conn)
}

/// Write a synthetic export to `path`. Refuses to overwrite an existing file.
pub fn write_export(path: &Path, spec: &SyntheticExport) -> Result<u64> {
    let bytes = generate(spec)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| EmrtError::io(path, source))?;
    file.write_all(&bytes)
        .and_then(|()| file.sync_all())
        .map_err(|source| EmrtError::io(path, source))?;
    Ok(bytes.len() as u64)
}
