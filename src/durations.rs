//! Duration aggregation over a finalized [`ConnectionTable`].
//!
//! Produces two aligned sequences, relative start and duration, in table
//! order. Connections with no observed end get the timeout sentinel instead
//! of a measured duration. The sentinel is a policy value: it puts every
//! unresolved (typically starved) connection on one visible plateau.

use serde::Serialize;

use crate::tracker::{ConnectionTable, EndReason};

/// Default duration assigned to connections that never closed.
pub const DEFAULT_TIMEOUT_SENTINEL_SECS: f64 = 100.0;

/// Aligned per-connection series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurationSeries {
    /// Minimum start time in the table (t = 0). `None` for an empty table.
    pub reference_time: Option<f64>,
    pub relative_start: Vec<f64>,
    pub duration: Vec<f64>,
    pub end_reason: Vec<Option<EndReason>>,
    /// True where `duration` holds the sentinel rather than a measurement.
    pub timed_out: Vec<bool>,
    pub timeout_sentinel_secs: f64,
}

impl DurationSeries {
    pub fn len(&self) -> usize {
        self.duration.len()
    }

    pub fn is_empty(&self) -> bool {
        self.duration.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = SeriesPoint> + '_ {
        (0..self.len()).map(move |i| SeriesPoint {
            relative_start: self.relative_start[i],
            duration: self.duration[i],
            end_reason: self.end_reason[i],
            timed_out: self.timed_out[i],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub relative_start: f64,
    pub duration: f64,
    pub end_reason: Option<EndReason>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DurationAggregator {
    timeout_sentinel_secs: f64,
}

impl Default for DurationAggregator {
    fn default() -> Self {
        DurationAggregator::new(DEFAULT_TIMEOUT_SENTINEL_SECS)
    }
}

impl DurationAggregator {
    pub fn new(timeout_sentinel_secs: f64) -> Self {
        DurationAggregator {
            timeout_sentinel_secs,
        }
    }

    pub fn timeout_sentinel_secs(&self) -> f64 {
        self.timeout_sentinel_secs
    }

    pub fn aggregate(&self, table: &ConnectionTable) -> DurationSeries {
        let reference_time = match table.reference_time() {
            Some(ts) => ts,
            None => {
                return DurationSeries {
                    timeout_sentinel_secs: self.timeout_sentinel_secs,
                    ..DurationSeries::default()
                }
            }
        };

        let n = table.len();
        let mut series = DurationSeries {
            reference_time: Some(reference_time),
            relative_start: Vec::with_capacity(n),
            duration: Vec::with_capacity(n),
            end_reason: Vec::with_capacity(n),
            timed_out: Vec::with_capacity(n),
            timeout_sentinel_secs: self.timeout_sentinel_secs,
        };

        for rec in table {
            let (duration, timed_out) = match rec.duration() {
                Some(measured) => (measured, false),
                None => (self.timeout_sentinel_secs, true),
            };
            series.relative_start.push(rec.start_time - reference_time);
            series.duration.push(duration);
            series.end_reason.push(rec.end_reason);
            series.timed_out.push(timed_out);
        }

        tracing::info!(connections = n, "calculated connection durations");
        series
    }
}

/// Aggregate figures over a series (or a slice of one).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurationSummary {
    pub total: usize,
    pub normal: usize,
    pub reset: usize,
    pub timed_out: usize,
    pub timed_out_pct: f64,
    /// Mean over every point, sentinel values included.
    pub mean_duration: Option<f64>,
    /// Mean over measured (closed) connections only.
    pub mean_measured: Option<f64>,
    pub min_measured: Option<f64>,
    pub max_measured: Option<f64>,
    pub timeout_sentinel_secs: f64,
}

pub fn summarize(series: &DurationSeries) -> DurationSummary {
    summarize_points(series.points(), series.timeout_sentinel_secs)
}

fn summarize_points<I>(points: I, timeout_sentinel_secs: f64) -> DurationSummary
where
    I: Iterator<Item = SeriesPoint>,
{
    let mut summary = DurationSummary {
        timeout_sentinel_secs,
        ..DurationSummary::default()
    };
    let mut sum_all = 0.0;
    let mut sum_measured = 0.0;
    let mut measured = 0usize;

    for p in points {
        summary.total += 1;
        sum_all += p.duration;
        if p.timed_out {
            summary.timed_out += 1;
            continue;
        }
        match p.end_reason {
            Some(EndReason::NormalClose) => summary.normal += 1,
            Some(EndReason::Reset) => summary.reset += 1,
            None => {}
        }
        measured += 1;
        sum_measured += p.duration;
        summary.min_measured = Some(summary.min_measured.map_or(p.duration, |m| m.min(p.duration)));
        summary.max_measured = Some(summary.max_measured.map_or(p.duration, |m| m.max(p.duration)));
    }

    if summary.total > 0 {
        summary.mean_duration = Some(sum_all / summary.total as f64);
        summary.timed_out_pct = summary.timed_out as f64 / summary.total as f64 * 100.0;
    }
    if measured > 0 {
        summary.mean_measured = Some(sum_measured / measured as f64);
    }
    summary
}

/// Relative-time window during which an attack was run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AttackWindow {
    pub start: f64,
    pub end: f64,
}

impl AttackWindow {
    /// `None` unless both bounds are given and `start <= end`.
    pub fn new(start: Option<f64>, end: Option<f64>) -> Option<Self> {
        match (start, end) {
            (Some(start), Some(end)) if start <= end => Some(AttackWindow { start, end }),
            _ => None,
        }
    }
}

/// Summaries split by where each connection started relative to the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSummary {
    pub window: AttackWindow,
    pub before: DurationSummary,
    /// Connections that started inside `[start, end]`.
    pub during: DurationSummary,
    pub after: DurationSummary,
}

pub fn window_summary(series: &DurationSeries, window: AttackWindow) -> WindowSummary {
    let sentinel = series.timeout_sentinel_secs;
    WindowSummary {
        window,
        before: summarize_points(
            series.points().filter(|p| p.relative_start < window.start),
            sentinel,
        ),
        during: summarize_points(
            series
                .points()
                .filter(|p| p.relative_start >= window.start && p.relative_start <= window.end),
            sentinel,
        ),
        after: summarize_points(
            series.points().filter(|p| p.relative_start > window.end),
            sentinel,
        ),
    }
}
