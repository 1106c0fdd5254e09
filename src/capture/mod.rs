//! Decoders that turn an input source into [`PacketRecord`]s.
//!
//! Three sources are supported:
//! - `fields`: tab-separated text in `tshark -T fields` order, from a file
//!   or stdin (`-`).
//! - `tshark`: runs `tshark` on a capture file and reads its field output.
//! - `pcap`: reads a capture file directly through libpcap.
//!
//! Malformed records are skipped with a warning naming their index. A source
//! that cannot be read at all is a [`DecodeError`], which is fatal and kept
//! distinct from a successful decode that produced zero records.

pub mod fields;
pub mod pcap_file;
pub mod tshark;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::record::PacketRecord;

/// Which decoder reads the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    Fields,
    Tshark,
    Pcap,
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderKind::Fields => write!(f, "fields"),
            DecoderKind::Tshark => write!(f, "tshark"),
            DecoderKind::Pcap => write!(f, "pcap"),
        }
    }
}

/// The input source could not produce records at all.
#[derive(Debug)]
pub enum DecodeError {
    /// Input path does not exist.
    MissingInput(PathBuf),
    Io { path: PathBuf, source: std::io::Error },
    /// tshark could not be started.
    TsharkSpawn { program: String, source: std::io::Error },
    /// tshark ran but exited unsuccessfully.
    TsharkFailed { status: std::process::ExitStatus, stderr: String },
    Pcap(pcap::Error),
    UnsupportedLinkType(i32),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decode failed: ")?;
        match self {
            DecodeError::MissingInput(path) => {
                write!(f, "input '{}' not found", path.display())
            }
            DecodeError::Io { path, source } => {
                write!(f, "cannot read '{}': {}", path.display(), source)
            }
            DecodeError::TsharkSpawn { program, source } => {
                write!(f, "cannot run '{}': {}", program, source)
            }
            DecodeError::TsharkFailed { status, stderr } => {
                write!(f, "tshark exited with {}: {}", status, stderr.trim())
            }
            DecodeError::Pcap(e) => write!(f, "pcap error: {}", e),
            DecodeError::UnsupportedLinkType(lt) => {
                write!(f, "unsupported pcap link type {}", lt)
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Io { source, .. } | DecodeError::TsharkSpawn { source, .. } => {
                Some(source)
            }
            DecodeError::Pcap(e) => Some(e),
            _ => None,
        }
    }
}

impl From<pcap::Error> for DecodeError {
    fn from(e: pcap::Error) -> Self {
        DecodeError::Pcap(e)
    }
}

/// Records produced by one decode run.
#[derive(Debug, Clone, Default)]
pub struct DecodeOutput {
    pub records: Vec<PacketRecord>,
    /// Records skipped as malformed.
    pub malformed: u64,
    /// Records examined (valid + malformed).
    pub examined: u64,
}

impl DecodeOutput {
    pub(crate) fn skip(&mut self, index: u64, reason: &dyn fmt::Display) {
        self.examined += 1;
        self.malformed += 1;
        tracing::warn!(index, error = %reason, "skipping malformed record");
    }

    pub(crate) fn push(&mut self, record: PacketRecord) {
        self.examined += 1;
        self.records.push(record);
    }
}

/// Decoder settings beyond the input path.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub tshark_path: String,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            tshark_path: "tshark".into(),
        }
    }
}

/// Decode `input` with the selected decoder.
pub fn decode(
    kind: DecoderKind,
    input: &Path,
    options: &DecodeOptions,
) -> Result<DecodeOutput, DecodeError> {
    let is_stdin = kind == DecoderKind::Fields && input == Path::new("-");
    if !is_stdin && !input.exists() {
        return Err(DecodeError::MissingInput(input.to_path_buf()));
    }

    tracing::info!(decoder = %kind, input = %input.display(), "decoding packets");

    let output = match kind {
        DecoderKind::Fields if is_stdin => fields::read_stdin()?,
        DecoderKind::Fields => fields::read_file(input)?,
        DecoderKind::Tshark => tshark::extract(&options.tshark_path, input)?,
        DecoderKind::Pcap => pcap_file::read_file(input)?,
    };

    tracing::info!(
        records = output.records.len(),
        malformed = output.malformed,
        "decoded TCP packet records"
    );
    Ok(output)
}
