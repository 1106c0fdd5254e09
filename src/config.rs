use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use crate::capture::DecoderKind;
use crate::durations::DEFAULT_TIMEOUT_SENTINEL_SECS;
use crate::flow::Endpoint;

fn empty_path_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(opt.filter(|path| !path.as_os_str().is_empty()))
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    /// Values that parse but cannot be used together.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config io error: {}", err),
            ConfigError::Parse(err) => write!(f, "config parse error: {}", err),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub input: InputConfig,
    pub analysis: AnalysisConfig,
    pub pipeline: PipelineConfig,
    pub checkpoint: CheckpointConfig,
    pub output: OutputConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(ConfigError::Parse)
    }

    /// Reject combinations the analysis cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sentinel = self.analysis.timeout_sentinel_secs;
        if !sentinel.is_finite() || sentinel < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "timeout_sentinel_secs must be a finite, non-negative number (got {})",
                sentinel
            )));
        }
        if let (Some(start), Some(end)) = (self.analysis.attack_start, self.analysis.attack_end) {
            if start > end {
                return Err(ConfigError::Invalid(format!(
                    "attack_start ({}) is after attack_end ({})",
                    start, end
                )));
            }
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
}

impl ServerConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 56, 104)),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub decoder: DecoderKind,
    pub tshark_path: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            decoder: DecoderKind::Fields,
            tshark_path: "tshark".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Duration reported for connections that never closed.
    pub timeout_sentinel_secs: f64,
    /// Attack window bounds in seconds relative to the first connection.
    pub attack_start: Option<f64>,
    pub attack_end: Option<f64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            timeout_sentinel_secs: DEFAULT_TIMEOUT_SENTINEL_SECS,
            attack_start: Some(20.0),
            attack_end: Some(120.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tracker shards. 1 runs a single pass on the calling thread, 0 picks
    /// a count from the available cores.
    pub workers: usize,
    /// Per-worker bounded queue length.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: 1,
            channel_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            enabled: false,
            dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(deserialize_with = "empty_path_none")]
    pub export_json: Option<PathBuf>,
    #[serde(deserialize_with = "empty_path_none")]
    pub export_csv: Option<PathBuf>,
    #[serde(deserialize_with = "empty_path_none")]
    pub series_csv: Option<PathBuf>,
    #[serde(deserialize_with = "empty_path_none")]
    pub summary_json: Option<PathBuf>,
    pub quiet: bool,
}
