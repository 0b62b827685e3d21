//! Report and event rendering for stdout.

use std::io::{self, Write};
use std::path::Path;

use chrono::{TimeZone, Utc};
use serde::Serialize;

use shardrun_core::{
    DispatchEvent, DispatchEventType, ErrorKind, HostId, RunId, RunMode, RunReport, RunSummary,
    TaskResult, TaskStatus,
};

/// How the final report is printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// One line per host plus a summary line.
    #[default]
    Text,
    /// The whole report as one JSON document.
    Json,
    /// One JSON record per host, then a summary record.
    JsonLines,
}

/// Per-host record with captured output cut down to a tail.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRecord {
    pub host_id: HostId,
    pub index: usize,
    pub status: TaskStatus,
    pub succeeded: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub attempts: usize,
}

impl ReportRecord {
    pub fn from_result(result: &TaskResult, limit: usize) -> Self {
        let (stdout, stdout_truncated) = truncate_tail(&result.stdout, limit);
        let (stderr, stderr_truncated) = truncate_tail(&result.stderr, limit);
        Self {
            host_id: result.host_id.clone(),
            index: result.index,
            status: result.status,
            succeeded: result.succeeded,
            exit_code: result.exit_code,
            stdout,
            stdout_truncated,
            stderr,
            stderr_truncated,
            error: result.error.clone(),
            error_kind: result.error_kind,
            attempts: result.attempt_count(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReportDocument {
    run_id: RunId,
    mode: Option<RunMode>,
    started_at: String,
    finished_at: String,
    summary: RunSummary,
    results: Vec<ReportRecord>,
}

impl ReportDocument {
    fn new(report: &RunReport, limit: usize) -> Self {
        Self {
            run_id: report.run_id.clone(),
            mode: report.mode,
            started_at: report.started_at.to_rfc3339(),
            finished_at: report.finished_at.to_rfc3339(),
            summary: report.summary(),
            results: report
                .results
                .iter()
                .map(|r| ReportRecord::from_result(r, limit))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SummaryRecord<'a> {
    run_id: &'a RunId,
    summary: RunSummary,
}

/// Keep at most the last `limit` bytes of `text`, moving the cut forward to
/// the next char boundary. Returns the tail and whether anything was dropped.
pub fn truncate_tail(text: &str, limit: usize) -> (String, bool) {
    if text.len() <= limit {
        return (text.to_string(), false);
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    (text[start..].to_string(), true)
}

/// Render a report in the requested format.
pub fn render_report(
    report: &RunReport,
    format: OutputFormat,
    limit: usize,
) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Text => Ok(render_text(report)),
        OutputFormat::Json => serde_json::to_string_pretty(&ReportDocument::new(report, limit)),
        OutputFormat::JsonLines => {
            let mut out = String::new();
            for result in &report.results {
                out.push_str(&serde_json::to_string(&ReportRecord::from_result(result, limit))?);
                out.push('\n');
            }
            out.push_str(&serde_json::to_string(&SummaryRecord {
                run_id: &report.run_id,
                summary: report.summary(),
            })?);
            Ok(out)
        }
    }
}

fn render_text(report: &RunReport) -> String {
    let mut out = String::new();
    for result in &report.results {
        out.push_str(&format!("[{}] {}", result.status.label(), result.host_id));
        if let Some(error) = &result.error {
            out.push_str(&format!(": {}", error));
        }
        out.push('\n');
    }
    out.push_str(&report.summary().to_string());
    out
}

/// Print a report to stdout.
pub fn print_report(report: &RunReport, format: OutputFormat, limit: usize) -> io::Result<()> {
    let rendered = render_report(report, format, limit).map_err(io::Error::other)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", rendered)?;
    stdout.flush()
}

/// Write the full JSON report to `path`.
pub fn write_report_file(report: &RunReport, path: &Path, limit: usize) -> io::Result<()> {
    let json = render_report(report, OutputFormat::Json, limit).map_err(io::Error::other)?;
    std::fs::write(path, json)
}

/// Where `--events` lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStream {
    Stdout,
    Stderr,
}

impl EventStream {
    /// Events share stdout only with the text report, so a JSON report stays
    /// a single parseable stream.
    pub fn for_output(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => Self::Stdout,
            OutputFormat::Json | OutputFormat::JsonLines => Self::Stderr,
        }
    }
}

/// A dispatch event as printed by `--events`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent {
    pub event: DispatchEventType,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl From<&DispatchEvent> for JsonEvent {
    fn from(event: &DispatchEvent) -> Self {
        let timestamp = Utc
            .timestamp_millis_opt(event.timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        Self {
            event: event.event_type,
            timestamp,
            data: serde_json::json!({
                "run_id": event.run_id,
                "host_id": event.host_id,
                "index": event.index,
                "metadata": event.metadata,
            }),
        }
    }
}

impl JsonEvent {
    /// Output this event as a JSON line.
    pub fn emit(&self, stream: EventStream) {
        let Ok(json) = serde_json::to_string(self) else {
            return;
        };
        match stream {
            EventStream::Stdout => {
                let mut stdout = io::stdout().lock();
                let _ = writeln!(stdout, "{}", json);
                let _ = stdout.flush();
            }
            EventStream::Stderr => {
                let mut stderr = io::stderr().lock();
                let _ = writeln!(stderr, "{}", json);
            }
        }
    }
}
