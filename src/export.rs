//! JSON/CSV export of connection tables, duration series and summaries.

use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::durations::{DurationSeries, DurationSummary, WindowSummary};
use crate::tracker::ConnectionTable;

#[derive(Debug)]
pub enum ExportError {
    Io { path: PathBuf, source: std::io::Error },
    Json { path: PathBuf, source: serde_json::Error },
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Io { path, source } => {
                write!(f, "export to {} failed: {}", path.display(), source)
            }
            ExportError::Json { path, source } => {
                write!(f, "export to {} failed: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Io { source, .. } => Some(source),
            ExportError::Json { source, .. } => Some(source),
        }
    }
}

/// Summary document written by [`write_summary_json`].
#[derive(Debug, Serialize)]
pub struct SummaryReport<'a> {
    pub summary: &'a DurationSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_window: Option<&'a WindowSummary>,
    /// True when tracking was interrupted before all packets were seen.
    pub partial: bool,
}

fn create(path: &Path) -> Result<BufWriter<File>, ExportError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ExportError> {
    let mut writer = create(path)?;
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| ExportError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn with_path(path: &Path) -> impl Fn(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn write_connections_json(path: &Path, table: &ConnectionTable) -> Result<(), ExportError> {
    write_json(path, table.records())
}

pub fn write_connections_csv(path: &Path, table: &ConnectionTable) -> Result<(), ExportError> {
    let mut writer = create(path)?;
    write_connections_to(&mut writer, table).map_err(with_path(path))
}

fn write_connections_to<W: Write>(writer: &mut W, table: &ConnectionTable) -> std::io::Result<()> {
    writeln!(
        writer,
        "client_ip,client_port,server_ip,server_port,start_time,end_time,end_reason,duration_secs"
    )?;
    for rec in table {
        let end_time = rec
            .end_time
            .map(|value| format!("{:.6}", value))
            .unwrap_or_default();
        let end_reason = rec
            .end_reason
            .map(|reason| reason.to_string())
            .unwrap_or_default();
        let duration = rec
            .duration()
            .map(|value| format!("{:.6}", value))
            .unwrap_or_default();
        writeln!(
            writer,
            "{},{},{},{},{:.6},{},{},{}",
            csv_escape(&rec.key.client.ip.to_string()),
            rec.key.client.port,
            csv_escape(&rec.key.server.ip.to_string()),
            rec.key.server.port,
            rec.start_time,
            end_time,
            end_reason,
            duration
        )?;
    }
    writer.flush()
}

pub fn write_series_csv(path: &Path, series: &DurationSeries) -> Result<(), ExportError> {
    let mut writer = create(path)?;
    write_series_to(&mut writer, series).map_err(with_path(path))
}

fn write_series_to<W: Write>(writer: &mut W, series: &DurationSeries) -> std::io::Result<()> {
    writeln!(writer, "relative_start,duration,end_reason,timed_out")?;
    for point in series.points() {
        let end_reason = point
            .end_reason
            .map(|reason| reason.to_string())
            .unwrap_or_default();
        writeln!(
            writer,
            "{:.6},{:.6},{},{}",
            point.relative_start, point.duration, end_reason, point.timed_out
        )?;
    }
    writer.flush()
}

pub fn write_summary_json(path: &Path, report: &SummaryReport<'_>) -> Result<(), ExportError> {
    write_json(path, report)
}

/// Escape a CSV field: wrap in double quotes if it contains comma, quote, or newline.
fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
