//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use emr_telemetry::coordinator::lifecycle::{Phase, Status};
use emr_telemetry::coordinator::session::{Session, Submission};
use emr_telemetry::coordinator::validate::Dashboard;
use emr_telemetry::core::config::Config;
use emr_telemetry::core::errors::EmrtError;
use emr_telemetry::demo::synthetic::{SyntheticExport, write_export};
use emr_telemetry::engine::database::SqliteEngine;
use emr_telemetry::logger::activity::{ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger};
use emr_telemetry::logger::jsonl::JsonlConfig;

/// Width of the longest text bar in human output.
const BAR_WIDTH: u64 = 32;

/// EMR export telemetry: offline, aggregate-only analysis of EMR database exports.
#[derive(Debug, Parser)]
#[command(
    name = "emrt",
    author,
    version,
    about = "EMR export telemetry - offline aggregate analysis",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Write activity events to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Analyze one EMR database export.
    Analyze(AnalyzeArgs),
    /// Write a synthetic EMR export for demos.
    Demo(DemoArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct AnalyzeArgs {
    /// Export file (SQLite database).
    #[arg(value_name = "FILE")]
    file: PathBuf,
    /// Show the technical detail behind the status message.
    #[arg(long)]
    detail: bool,
    /// High-contrast, uncoloured layout for field hardware.
    #[arg(long)]
    field_mode: bool,
}

#[derive(Debug, Clone, Args)]
struct DemoArgs {
    /// Output path; must not exist yet.
    #[arg(value_name = "OUT")]
    out: PathBuf,
    /// RNG seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Number of visit rows.
    #[arg(long, default_value_t = 600)]
    rows: usize,
    /// Anchor arrivals to a fixed date instead of the current hour.
    #[arg(long)]
    fixed_clock: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Target shell.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input: bad path, bad config.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// The export was analyzed (or refused) and ended `INVALID`.
    #[error("{0}")]
    Rejected(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Rejected(_) => 4,
        }
    }
}

impl From<EmrtError> for CliError {
    fn from(err: EmrtError) -> Self {
        match err {
            EmrtError::InvalidConfig { .. }
            | EmrtError::MissingConfig { .. }
            | EmrtError::ConfigParse { .. }
            | EmrtError::Io { .. } => Self::User(err.to_string()),
            EmrtError::Serialization { .. } => Self::Internal(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Analyze(args) => run_analyze(cli, args),
        Command::Demo(args) => run_demo(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// analyze
// ---------------------------------------------------------------------------

fn run_analyze(cli: &Cli, args: &AnalyzeArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let field_mode = args.field_mode || config.display.field_mode;
    if field_mode {
        control::set_override(false);
    }

    let (logger, logger_join) = start_logger(&config, cli.verbose)?;
    let outcome = analyze_file(&config, &args.file, logger.clone());
    logger.shutdown();
    if let Some(join) = logger_join {
        let _ = join.join();
    }
    let report = outcome?;

    match output_mode(cli) {
        OutputMode::Human => {
            let mut stdout = io::stdout().lock();
            render_human(&mut stdout, &report, args.detail, field_mode)?;
        }
        OutputMode::Json => {
            let mut payload = json!({
                "command": "analyze",
                "file": args.file.to_string_lossy(),
                "phase": report.status.phase,
                "message": report.status.message,
                "ignored": report.ignored,
                "fingerprint": report.fingerprint,
                "dashboard": report.dashboard,
            });
            if args.detail {
                payload["detail"] = json!(report.status.detail);
            }
            write_json_line(&payload)?;
        }
    }

    if report.status.phase == Phase::Valid {
        Ok(())
    } else {
        Err(CliError::Rejected(report.status.message))
    }
}

/// Result of one `analyze` run, detached from the session.
struct AnalyzeReport {
    status: Status,
    dashboard: Option<Dashboard>,
    fingerprint: Option<String>,
    ignored: bool,
}

fn analyze_file(
    config: &Config,
    file: &Path,
    logger: ActivityLoggerHandle,
) -> Result<AnalyzeReport, CliError> {
    let mut session = Session::start(config, Arc::new(SqliteEngine), logger)?;
    let submission = session.submit_file(file);
    let ignored = matches!(submission, Ok(Submission::Ignored { .. }));
    if matches!(submission, Ok(Submission::Dispatched(_))) {
        session.wait();
    }
    let report = AnalyzeReport {
        status: session.status(),
        dashboard: session.dashboard().cloned(),
        fingerprint: session.fingerprint().map(str::to_string),
        ignored,
    };
    session.shutdown();
    submission?;
    Ok(report)
}

fn start_logger(
    config: &Config,
    verbose: bool,
) -> Result<(ActivityLoggerHandle, Option<JoinHandle<()>>), CliError> {
    let jsonl = if verbose {
        JsonlConfig {
            path: None,
            ..JsonlConfig::from(&config.logging)
        }
    } else if config.logging.enabled {
        JsonlConfig::from(&config.logging)
    } else {
        return Ok((ActivityLoggerHandle::disabled(), None));
    };

    let (handle, join) = spawn_logger(ActivityLoggerConfig {
        jsonl,
        ..ActivityLoggerConfig::default()
    })?;
    Ok((handle, Some(join)))
}

fn render_human(
    out: &mut impl Write,
    report: &AnalyzeReport,
    show_detail: bool,
    field_mode: bool,
) -> io::Result<()> {
    let phase = report.status.phase.as_str();
    let badge = match report.status.phase {
        Phase::Valid => phase.green().bold(),
        Phase::Invalid => phase.red().bold(),
        _ => phase.yellow().bold(),
    };
    writeln!(out, "[{badge}] {}", report.status.message)?;
    if report.ignored {
        writeln!(out, "  (a job was already in flight; this file was ignored)")?;
    }
    if show_detail {
        if let Some(detail) = &report.status.detail {
            writeln!(out, "  detail: {detail}")?;
        }
    }

    let Some(dash) = &report.dashboard else {
        return Ok(());
    };
    let fill = if field_mode { '#' } else { '█' };

    section(out, "Visits per hour (UTC)", dash.visits.len(), field_mode)?;
    let max = dash.visits.iter().map(|p| p.value).max().unwrap_or(0);
    for point in &dash.visits {
        writeln!(
            out,
            "  {}  {:<width$} {}",
            point.date.format("%Y-%m-%d %H:%M"),
            bar(point.value, max, fill),
            point.value,
            width = BAR_WIDTH as usize,
        )?;
    }
    if dash.coerced_dates > 0 {
        writeln!(out, "  ({} bucket dates could not be read)", dash.coerced_dates)?;
    }

    section(out, "Duration samples", dash.duration.len(), field_mode)?;
    let min = dash.duration.iter().map(|s| s.value).reduce(f64::min);
    let max_duration = dash.duration.iter().map(|s| s.value).reduce(f64::max);
    if let (Some(lo), Some(hi)) = (min, max_duration) {
        writeln!(out, "  range {lo} .. {hi}")?;
    }

    section(out, "States", dash.states.len(), field_mode)?;
    let rows: Vec<(&str, u64)> = dash
        .states
        .iter()
        .map(|c| (c.category.as_str(), c.value))
        .collect();
    grouped(out, &rows, fill)?;

    section(out, "Operators", dash.operators.len(), field_mode)?;
    let rows: Vec<(&str, u64)> = dash
        .operators
        .iter()
        .map(|c| (c.name.as_str(), c.value))
        .collect();
    grouped(out, &rows, fill)?;

    if let Some(fp) = &report.fingerprint {
        writeln!(out)?;
        writeln!(out, "fingerprint {}", fp.dimmed())?;
    }
    Ok(())
}

fn section(out: &mut impl Write, title: &str, len: usize, field_mode: bool) -> io::Result<()> {
    writeln!(out)?;
    if field_mode {
        writeln!(out, "== {} ({len}) ==", title.to_uppercase())
    } else {
        writeln!(out, "{} ({len})", title.bold())
    }
}

fn grouped(out: &mut impl Write, rows: &[(&str, u64)], fill: char) -> io::Result<()> {
    let label_width = rows.iter().map(|(label, _)| label.chars().count()).max().unwrap_or(0);
    let max = rows.iter().map(|(_, value)| *value).max().unwrap_or(0);
    for (label, value) in rows {
        writeln!(
            out,
            "  {label:<label_width$}  {:<width$} {value}",
            bar(*value, max, fill),
            width = BAR_WIDTH as usize,
        )?;
    }
    Ok(())
}

/// Proportional bar; any non-zero value gets at least one cell.
fn bar(value: u64, max: u64, fill: char) -> String {
    if max == 0 || value == 0 {
        return String::new();
    }
    let cells = (value.saturating_mul(BAR_WIDTH) / max).max(1);
    std::iter::repeat_n(fill, usize::try_from(cells).unwrap_or(0)).collect()
}

// ---------------------------------------------------------------------------
// demo
// ---------------------------------------------------------------------------

fn run_demo(cli: &Cli, args: &DemoArgs) -> Result<(), CliError> {
    let spec = if args.fixed_clock {
        SyntheticExport::fixed(args.rows, args.seed)
    } else {
        SyntheticExport::recent(args.rows, args.seed)
    };
    let bytes = write_export(&args.out, &spec)?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "Wrote synthetic export to {} ({bytes} bytes, {} rows, seed {})",
                args.out.display(),
                spec.rows,
                spec.seed
            );
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "demo",
                "path": args.out.to_string_lossy(),
                "bytes": bytes,
                "rows": spec.rows,
                "seed": spec.seed,
                "end": spec.end.to_rfc3339(),
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                let source = config
                    .source_path
                    .as_ref()
                    .map_or_else(|| "(defaults)".to_string(), |p| p.display().to_string());

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {source}");
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": source,
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ---------------------------------------------------------------------------
// output helpers
// ---------------------------------------------------------------------------

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("EMRT_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
