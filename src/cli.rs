use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::capture::DecoderKind;

/// connscope: reconstruct TCP connection lifecycles toward one server and
/// report how long each connection lived
#[derive(Parser, Debug)]
#[command(name = "connscope", version, about)]
pub struct Cli {
    /// Input to analyze: a tab-separated field file ("-" for stdin), or a
    /// capture file for the tshark/pcap decoders
    pub input: PathBuf,

    /// Load settings from a TOML file (flags below override it)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server IP address whose connections are tracked
    #[arg(long = "server-ip")]
    pub server_ip: Option<IpAddr>,

    /// Server port whose connections are tracked
    #[arg(long = "server-port")]
    pub server_port: Option<u16>,

    /// How to read the input
    #[arg(short, long, value_enum)]
    pub decoder: Option<DecoderKind>,

    /// Path to the tshark binary (tshark decoder only)
    #[arg(long)]
    pub tshark_path: Option<String>,

    /// Duration (seconds) reported for connections that never closed
    #[arg(long = "timeout-sentinel")]
    pub timeout_sentinel: Option<f64>,

    /// Attack start, seconds relative to the first connection
    #[arg(long)]
    pub attack_start: Option<f64>,

    /// Attack end, seconds relative to the first connection
    #[arg(long)]
    pub attack_end: Option<f64>,

    /// Do not split the summary by attack window
    #[arg(long, default_value_t = false)]
    pub no_attack_window: bool,

    /// Tracker worker threads (1 = single pass, 0 = auto)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Save decoded packets and connections, and reuse them on later runs
    #[arg(long, default_value_t = false)]
    pub checkpoints: bool,

    /// Disable checkpoints even if the config file enables them
    #[arg(long, default_value_t = false)]
    pub no_checkpoints: bool,

    /// Directory holding checkpoint files
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Write connection records as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Write connection records as CSV
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Write the relative start / duration series as CSV
    #[arg(long)]
    pub series_csv: Option<PathBuf>,

    /// Write the summary as JSON
    #[arg(long)]
    pub summary_json: Option<PathBuf>,

    /// Suppress the printed summary
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,

    /// Print the summary even if the config file sets quiet
    #[arg(long, default_value_t = false)]
    pub no_quiet: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::try_parse_from([
            "connscope",
            "capture.pcap",
            "--decoder",
            "pcap",
            "--server-ip",
            "10.0.0.2",
            "--server-port",
            "80",
            "--timeout-sentinel",
            "60",
            "-w",
            "0",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.input, PathBuf::from("capture.pcap"));
        assert_eq!(cli.decoder, Some(DecoderKind::Pcap));
        assert_eq!(cli.server_ip, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(cli.server_port, Some(80));
        assert_eq!(cli.timeout_sentinel, Some(60.0));
        assert_eq!(cli.workers, Some(0));
        assert_eq!(cli.verbose, 2);
        assert!(!cli.checkpoints);
    }

    #[test]
    fn input_is_required() {
        assert!(Cli::try_parse_from(["connscope"]).is_err());
    }
}
