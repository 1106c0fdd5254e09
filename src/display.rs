//! Console summary for an analysis run.
//!
//! The summary is a [`fmt::Display`] impl so the text can be checked in tests.

use std::fmt;

use crate::durations::{DurationSummary, WindowSummary};
use crate::flow::Endpoint;
use crate::tracker::TrackerStats;

/// Everything the end-of-run summary shows.
pub struct RunReport<'a> {
    pub server: Endpoint,
    /// `None` when the table came from a checkpoint instead of packets.
    pub stats: Option<&'a TrackerStats>,
    pub summary: &'a DurationSummary,
    pub window: Option<&'a WindowSummary>,
    pub malformed: u64,
    pub workers: usize,
    pub partial: bool,
}

pub fn print_report(report: &RunReport<'_>) {
    print!("{}", report);
}

impl fmt::Display for RunReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(50);
        let thin = "-".repeat(50);
        let s = self.summary;

        writeln!(f, "{}", rule)?;
        writeln!(f, "Analysis complete (server {}).", self.server)?;
        if self.partial {
            writeln!(f, "  PARTIAL: interrupted before every packet was tracked")?;
        }
        match self.stats {
            Some(stats) => {
                writeln!(f, "  Packets examined:     {}", stats.packets)?;
                writeln!(f, "  Unrelated packets:    {}", stats.unrelated)?;
            }
            None => writeln!(f, "  Connections loaded from checkpoint")?,
        }
        if self.malformed > 0 {
            writeln!(f, "  Malformed records:    {}", self.malformed)?;
        }
        if self.workers > 1 {
            writeln!(f, "  Tracker workers:      {}", self.workers)?;
        }
        writeln!(f, "{}", thin)?;

        if s.total == 0 {
            writeln!(f, "  No connections to the server were observed.")?;
            return writeln!(f, "{}", rule);
        }

        write_summary_lines(f, s, "  ")?;

        if let Some(window) = self.window {
            writeln!(f, "{}", thin)?;
            writeln!(
                f,
                "  Attack window {:.1}s .. {:.1}s (relative)",
                window.window.start, window.window.end
            )?;
            for (label, part) in [
                ("before", &window.before),
                ("during", &window.during),
                ("after", &window.after),
            ] {
                writeln!(f, "  [{}]", label)?;
                if part.total == 0 {
                    writeln!(f, "    no connections")?;
                } else {
                    write_summary_lines(f, part, "    ")?;
                }
            }
        }

        writeln!(f, "{}", rule)
    }
}

fn write_summary_lines(
    f: &mut fmt::Formatter<'_>,
    s: &DurationSummary,
    indent: &str,
) -> fmt::Result {
    writeln!(f, "{}Total connections:    {}", indent, s.total)?;
    writeln!(f, "{}  closed normally:    {}", indent, s.normal)?;
    writeln!(f, "{}  reset:              {}", indent, s.reset)?;
    writeln!(
        f,
        "{}  timed out:          {} ({:.1}%)",
        indent, s.timed_out, s.timed_out_pct
    )?;
    if let Some(mean) = s.mean_duration {
        writeln!(
            f,
            "{}Average duration:     {:.2} s (timeouts counted as {} s policy value)",
            indent, mean, s.timeout_sentinel_secs
        )?;
    }
    match (s.mean_measured, s.min_measured, s.max_measured) {
        (Some(mean), Some(min), Some(max)) => writeln!(
            f,
            "{}Measured duration:    mean {:.3} s, min {:.3} s, max {:.3} s",
            indent, mean, min, max
        ),
        _ => writeln!(f, "{}Measured duration:    none closed", indent),
    }
}
