//! Schema prober: table discovery, candidate selection, and column role inference.
//!
//! Exports come from many EMR vendors with no shared schema, so the prober
//! never assumes a column exists. Roles are inferred from column names alone
//! and any role may be absent.

#![allow(missing_docs)]

use regex::Regex;
use serde::Serialize;

use crate::core::errors::{EmrtError, Result};
use crate::engine::database::{DatabaseHandle, SqlValue};

const CANDIDATE_TABLE_PATTERN: &str = r"(?i)event|visit|patient|log|telemetry";
const TIME_PATTERN: &str = r"(?i)time|date|created|timestamp";
const DURATION_PATTERN: &str = r"(?i)duration|min|ms|length";
const OPERATOR_PATTERN: &str = r"(?i)staff|user|operator|agent|doctor|nurse";
const STATUS_PATTERN: &str = r"(?i)status|state|type|category";

/// Semantic role a column may play in the aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Time,
    Duration,
    Operator,
    Status,
}

/// First column (in declared order) matching each role. `None` = absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColumnRoles {
    pub time: Option<String>,
    pub duration: Option<String>,
    pub operator: Option<String>,
    pub status: Option<String>,
}

impl ColumnRoles {
    /// Column assigned to `role`, if any.
    #[must_use]
    pub fn get(&self, role: ColumnRole) -> Option<&str> {
        match role {
            ColumnRole::Time => self.time.as_deref(),
            ColumnRole::Duration => self.duration.as_deref(),
            ColumnRole::Operator => self.operator.as_deref(),
            ColumnRole::Status => self.status.as_deref(),
        }
    }

    /// True when no role resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_none()
            && self.duration.is_none()
            && self.operator.is_none()
            && self.status.is_none()
    }
}

/// The table chosen for aggregation and its resolved roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaCandidate {
    pub table: String,
    pub roles: ColumnRoles,
}

/// Compiled name heuristics.
#[derive(Debug, Clone)]
pub struct SchemaProber {
    candidate: Regex,
    roles: [(ColumnRole, Regex); 4],
}

impl SchemaProber {
    pub fn new() -> Result<Self> {
        Ok(Self {
            candidate: compile(CANDIDATE_TABLE_PATTERN)?,
            roles: [
                (ColumnRole::Time, compile(TIME_PATTERN)?),
                (ColumnRole::Duration, compile(DURATION_PATTERN)?),
                (ColumnRole::Operator, compile(OPERATOR_PATTERN)?),
                (ColumnRole::Status, compile(STATUS_PATTERN)?),
            ],
        })
    }

    /// First table whose name matches the candidate pattern.
    pub fn select_candidate_table<'a>(&self, tables: &'a [String]) -> Result<&'a str> {
        if tables.is_empty() {
            return Err(EmrtError::NoTablesFound);
        }
        tables
            .iter()
            .find(|name| self.candidate.is_match(name))
            .map(String::as_str)
            .ok_or(EmrtError::NoCandidateTable {
                table_count: tables.len(),
            })
    }

    /// Assign each role independently to the first matching column.
    #[must_use]
    pub fn resolve_roles(&self, columns: &[String]) -> ColumnRoles {
        let mut roles = ColumnRoles::default();
        for (role, pattern) in &self.roles {
            let found = columns.iter().find(|c| pattern.is_match(c)).cloned();
            match role {
                ColumnRole::Time => roles.time = found,
                ColumnRole::Duration => roles.duration = found,
                ColumnRole::Operator => roles.operator = found,
                ColumnRole::Status => roles.status = found,
            }
        }
        roles
    }

    /// Discover tables, pick the candidate, and resolve its column roles.
    pub fn probe(&self, handle: &dyn DatabaseHandle) -> Result<SchemaCandidate> {
        let tables = list_tables(handle)?;
        let table = self.select_candidate_table(&tables)?.to_string();
        let columns = list_columns(handle, &table)?;
        Ok(SchemaCandidate {
            roles: self.resolve_roles(&columns),
            table,
        })
    }
}

/// User tables in engine-reported order, excluding `sqlite_*` internals.
pub fn list_tables(handle: &dyn DatabaseHandle) -> Result<Vec<String>> {
    let rows = handle.query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
        &[],
    )?;
    Ok(rows.into_iter().filter_map(first_text).collect())
}

/// Column names of `table` in declared order.
pub fn list_columns(handle: &dyn DatabaseHandle, table: &str) -> Result<Vec<String>> {
    let sql = format!("SELECT name FROM pragma_table_info({})", sql_literal(table));
    let rows = handle.query(&sql, &[])?;
    Ok(rows.into_iter().filter_map(first_text).collect())
}

fn first_text(row: Vec<SqlValue>) -> Option<String> {
    match row.into_iter().next() {
        Some(SqlValue::Text(name)) => Some(name),
        _ => None,
    }
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| EmrtError::Runtime {
        details: format!("invalid schema pattern {pattern:?}: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::database::{DatabaseEngine, SqliteEngine, export_bytes};
    use rusqlite::Connection;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn open(ddl: &str) -> Box<dyn DatabaseHandle> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(ddl).unwrap();
        SqliteEngine.open(export_bytes(&conn).unwrap()).unwrap()
    }

    #[test]
    fn candidate_is_first_match_in_order() {
        let prober = SchemaProber::new().unwrap();
        let tables = names(&["config", "Staff", "PATIENT_VISITS", "event_log"]);
        assert_eq!(
            prober.select_candidate_table(&tables).unwrap(),
            "PATIENT_VISITS"
        );
    }

    #[test]
    fn empty_table_list_is_no_tables() {
        let prober = SchemaProber::new().unwrap();
        let err = prober.select_candidate_table(&[]).unwrap_err();
        assert!(matches!(err, EmrtError::NoTablesFound));
    }

    #[test]
    fn unmatched_tables_are_no_candidate() {
        let prober = SchemaProber::new().unwrap();
        let err = prober
            .select_candidate_table(&names(&["billing", "inventory"]))
            .unwrap_err();
        assert!(matches!(err, EmrtError::NoCandidateTable { table_count: 2 }));
    }

    #[test]
    fn roles_resolve_independently_in_declared_order() {
        let prober = SchemaProber::new().unwrap();
        let roles = prober.resolve_roles(&names(&[
            "id",
            "Arrival_Time",
            "created_at",
            "duration_min",
            "attending_doctor",
            "nurse_id",
            "visit_status",
        ]));
        assert_eq!(roles.time.as_deref(), Some("Arrival_Time"));
        assert_eq!(roles.duration.as_deref(), Some("duration_min"));
        assert_eq!(roles.operator.as_deref(), Some("attending_doctor"));
        assert_eq!(roles.status.as_deref(), Some("visit_status"));
    }

    #[test]
    fn unmatched_columns_leave_roles_absent() {
        let prober = SchemaProber::new().unwrap();
        let roles = prober.resolve_roles(&names(&["id", "note", "ward"]));
        assert!(roles.is_empty());
        assert_eq!(roles.get(ColumnRole::Time), None);
    }

    #[test]
    fn list_tables_skips_internal_tables() {
        let handle = open(
            "CREATE TABLE patient_log (id INTEGER PRIMARY KEY AUTOINCREMENT, ts TEXT);
             INSERT INTO patient_log (ts) VALUES ('x');
             CREATE TABLE staff (name TEXT);",
        );
        let tables = list_tables(handle.as_ref()).unwrap();
        assert_eq!(tables, names(&["patient_log", "staff"]));
        handle.close().unwrap();
    }

    #[test]
    fn list_columns_preserves_declared_order() {
        let handle = open("CREATE TABLE \"odd'name\" (b TEXT, a TEXT, c INTEGER);");
        let columns = list_columns(handle.as_ref(), "odd'name").unwrap();
        assert_eq!(columns, names(&["b", "a", "c"]));
        handle.close().unwrap();
    }

    #[test]
    fn probe_reports_candidate_and_roles() {
        let handle = open(
            "CREATE TABLE billing (amount REAL);
             CREATE TABLE ed_events (event_time TEXT, state TEXT, agent TEXT);",
        );
        let prober = SchemaProber::new().unwrap();
        let candidate = prober.probe(handle.as_ref()).unwrap();
        assert_eq!(candidate.table, "ed_events");
        assert_eq!(candidate.roles.time.as_deref(), Some("event_time"));
        assert_eq!(candidate.roles.status.as_deref(), Some("state"));
        assert_eq!(candidate.roles.operator.as_deref(), Some("agent"));
        assert_eq!(candidate.roles.duration, None);
        handle.close().unwrap();
    }
}
