#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_emrt") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "emrt.exe" } else { "emrt" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve emrt binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_with_env(case_name, args, &[])
}

/// Run the binary with an isolated config home plus `env`.
pub fn run_cli_case_with_env(case_name: &str, args: &[&str], env: &[(&str, &str)]) -> CmdResult {
    let root = std::env::temp_dir().join("emrt-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();
    let config_home = tempfile::tempdir().expect("create config home");

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env("XDG_CONFIG_HOME", config_home.path())
        .env_remove("EMRT_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1");
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command.output().expect("execute emrt command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Build an in-memory database from `sql` and return its serialized image.
pub fn export_from_sql(sql: &str) -> Vec<u8> {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(sql).expect("apply fixture sql");
    emr_telemetry::engine::database::export_bytes(&conn).expect("serialize fixture")
}

/// Write a fixture export built from `sql` into `dir`.
pub fn write_export_file(dir: &Path, name: &str, sql: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, export_from_sql(sql)).expect("write fixture export");
    path
}

/// 30 visits across three hours on 2024-03-05: 08h x5, 09h x10, 11h x15.
pub const THREE_HOUR_VISITS_SQL: &str = "
    CREATE TABLE patient_visits (id INTEGER PRIMARY KEY, timestamp TEXT, status TEXT);
    WITH RECURSIVE n(i) AS (SELECT 0 UNION ALL SELECT i + 1 FROM n WHERE i < 29)
    INSERT INTO patient_visits (timestamp, status)
    SELECT CASE
             WHEN i < 5 THEN printf('2024-03-05T08:%02d:00Z', i)
             WHEN i < 15 THEN printf('2024-03-05T09:%02d:00Z', i)
             ELSE printf('2024-03-05T11:%02d:00Z', i)
           END,
           'ADMIT'
    FROM n;
";
