use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use connscope::capture::{self, DecodeOptions};
use connscope::durations::{self, AttackWindow, DurationAggregator};
use connscope::tracker::TrackerStats;
use connscope::{checkpoint, cli, config, display, export, pipeline, FlowResolver};

fn main() {
    let args = cli::Cli::parse();

    // Initialize tracing/logging
    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    // Ctrl-C stops tracking; whatever was tracked so far is still reported.
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
        eprintln!("\nInterrupt received, finishing with the packets tracked so far...");
    }) {
        tracing::warn!(error = %err, "could not install Ctrl-C handler");
    }

    if let Err(e) = run(&args.input, &config, &running) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// Connection table plus how it was obtained.
struct Tracked {
    table: connscope::ConnectionTable,
    stats: Option<TrackerStats>,
    malformed: u64,
    workers: usize,
    partial: bool,
}

/// Where checkpoints live and which run they must belong to.
struct Checkpoints<'a> {
    dir: &'a Path,
    source: checkpoint::Provenance,
}

fn run(
    input: &Path,
    config: &config::Config,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let server = config.server.endpoint();
    tracing::info!(%server, "tracking connections to server");

    let checkpoints = if config.checkpoint.enabled {
        std::fs::create_dir_all(&config.checkpoint.dir)?;
        Some(Checkpoints {
            dir: config.checkpoint.dir.as_path(),
            source: checkpoint::Provenance::new(input, server),
        })
    } else {
        None
    };

    let tracked = track(input, config, checkpoints.as_ref(), running)?;

    let aggregator = DurationAggregator::new(config.analysis.timeout_sentinel_secs);
    let series = aggregator.aggregate(&tracked.table);
    let summary = durations::summarize(&series);
    let window = AttackWindow::new(config.analysis.attack_start, config.analysis.attack_end)
        .map(|w| durations::window_summary(&series, w));

    let output = &config.output;
    if let Some(path) = &output.export_json {
        export::write_connections_json(path, &tracked.table)?;
        tracing::info!(path = %path.display(), "connections exported (JSON)");
    }
    if let Some(path) = &output.export_csv {
        export::write_connections_csv(path, &tracked.table)?;
        tracing::info!(path = %path.display(), "connections exported (CSV)");
    }
    if let Some(path) = &output.series_csv {
        export::write_series_csv(path, &series)?;
        tracing::info!(path = %path.display(), "duration series exported (CSV)");
    }
    if let Some(path) = &output.summary_json {
        let report = export::SummaryReport {
            summary: &summary,
            attack_window: window.as_ref(),
            partial: tracked.partial,
        };
        export::write_summary_json(path, &report)?;
        tracing::info!(path = %path.display(), "summary exported (JSON)");
    }

    if !output.quiet {
        display::print_report(&display::RunReport {
            server,
            stats: tracked.stats.as_ref(),
            summary: &summary,
            window: window.as_ref(),
            malformed: tracked.malformed,
            workers: tracked.workers,
            partial: tracked.partial,
        });
    }

    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "analysis finished");
    Ok(())
}

/// Load the connection table from a checkpoint, or decode and track.
fn track(
    input: &Path,
    config: &config::Config,
    checkpoints: Option<&Checkpoints<'_>>,
    running: &AtomicBool,
) -> Result<Tracked, Box<dyn std::error::Error>> {
    if let Some(cp) = checkpoints {
        let path = cp.dir.join(checkpoint::CONNECTIONS_FILE);
        if let Some(table) = checkpoint::try_load_table(&path, &cp.source)? {
            return Ok(Tracked {
                table,
                stats: None,
                malformed: 0,
                workers: 0,
                partial: false,
            });
        }
    }

    let (packets, malformed) = load_packets(input, config, checkpoints)?;

    let resolver = FlowResolver::new(config.server.endpoint());
    let outcome = pipeline::track(&packets, resolver, &config.pipeline, running);

    if outcome.partial {
        tracing::warn!(
            connections = outcome.table.len(),
            "interrupted: results cover only the packets tracked before the stop"
        );
    } else if let Some(cp) = checkpoints {
        let path = cp.dir.join(checkpoint::CONNECTIONS_FILE);
        checkpoint::save_table(&path, &cp.source, &outcome.table)?;
    }

    Ok(Tracked {
        table: outcome.table,
        stats: Some(outcome.stats),
        malformed,
        workers: outcome.workers,
        partial: outcome.partial,
    })
}

fn load_packets(
    input: &Path,
    config: &config::Config,
    checkpoints: Option<&Checkpoints<'_>>,
) -> Result<(Vec<connscope::PacketRecord>, u64), Box<dyn std::error::Error>> {
    if let Some(cp) = checkpoints {
        let path = cp.dir.join(checkpoint::PACKETS_FILE);
        if let Some(packets) = checkpoint::try_load_packets(&path, &cp.source)? {
            return Ok((packets, 0));
        }
    }

    let options = DecodeOptions {
        tshark_path: config.input.tshark_path.clone(),
    };
    let decoded = capture::decode(config.input.decoder, input, &options)?;
    if decoded.records.is_empty() {
        tracing::warn!(input = %input.display(), "0 TCP records decoded");
    }

    if let Some(cp) = checkpoints {
        let path = cp.dir.join(checkpoint::PACKETS_FILE);
        checkpoint::save_packets(&path, &cp.source, &decoded.records)?;
    }
    Ok((decoded.records, decoded.malformed))
}

fn load_config(args: &cli::Cli) -> Result<config::Config, config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => config::Config::load(path)?,
        None => config::Config::default(),
    };

    if let Some(value) = args.server_ip {
        config.server.address = value;
    }
    if let Some(value) = args.server_port {
        config.server.port = value;
    }
    if let Some(value) = args.decoder {
        config.input.decoder = value;
    }
    if let Some(value) = &args.tshark_path {
        config.input.tshark_path = value.clone();
    }
    if let Some(value) = args.timeout_sentinel {
        config.analysis.timeout_sentinel_secs = value;
    }
    if let Some(value) = args.attack_start {
        config.analysis.attack_start = Some(value);
    }
    if let Some(value) = args.attack_end {
        config.analysis.attack_end = Some(value);
    }
    if args.no_attack_window {
        config.analysis.attack_start = None;
        config.analysis.attack_end = None;
    }
    if let Some(value) = args.workers {
        config.pipeline.workers = value;
    }
    if args.checkpoints {
        config.checkpoint.enabled = true;
    }
    if args.no_checkpoints {
        config.checkpoint.enabled = false;
    }
    if let Some(value) = &args.checkpoint_dir {
        config.checkpoint.dir = value.clone();
    }

    let output = &mut config.output;
    for (flag, slot) in [
        (&args.export_json, &mut output.export_json),
        (&args.export_csv, &mut output.export_csv),
        (&args.series_csv, &mut output.series_csv),
        (&args.summary_json, &mut output.summary_json),
    ] {
        if let Some(value) = flag {
            // An empty path on the command line disables a file-configured export.
            *slot = if value.as_os_str().is_empty() {
                None
            } else {
                Some(value.clone())
            };
        }
    }
    if args.quiet {
        output.quiet = true;
    }
    if args.no_quiet {
        output.quiet = false;
    }

    config.validate()?;
    Ok(config)
}
