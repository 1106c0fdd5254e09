//! On-disk checkpoints for long analyses.
//!
//! A checkpoint is a JSON document `{ "version", "kind", "source", "data" }`.
//! Decoded packets and the finished connection table are stored separately so
//! a rerun can skip decoding, tracking, or both. Loading checks `version`,
//! `kind` and `source` before touching `data`: a packets checkpoint is only
//! reused for the same input, a connections checkpoint only for the same
//! input and server.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::flow::Endpoint;
use crate::record::PacketRecord;
use crate::tracker::ConnectionTable;

pub const CHECKPOINT_VERSION: u32 = 2;

pub const PACKETS_FILE: &str = "packets_checkpoint.json";
pub const CONNECTIONS_FILE: &str = "connections_checkpoint.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Packets,
    Connections,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointKind::Packets => write!(f, "packets"),
            CheckpointKind::Connections => write!(f, "connections"),
        }
    }
}

/// What a checkpoint was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub input: PathBuf,
    pub server: Endpoint,
}

impl Provenance {
    pub fn new(input: &Path, server: Endpoint) -> Self {
        // Compare absolute paths when the input exists; stdin stays "-".
        let input = std::fs::canonicalize(input).unwrap_or_else(|_| input.to_path_buf());
        Provenance { input, server }
    }

    /// Whether `kind` data stored under `stored` is valid for this run.
    /// Decoded packets do not depend on the server.
    fn accepts(&self, stored: &Provenance, kind: CheckpointKind) -> bool {
        self.input == stored.input
            && (kind == CheckpointKind::Packets || self.server == stored.server)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input '{}', server {}", self.input.display(), self.server)
    }
}

#[derive(Debug)]
pub enum CheckpointError {
    Io { path: PathBuf, source: std::io::Error },
    Json { path: PathBuf, source: serde_json::Error },
    WrongKind { path: PathBuf, expected: CheckpointKind, found: CheckpointKind },
    UnsupportedVersion { path: PathBuf, found: u32 },
    /// Written for a different input or server than the current run.
    Mismatch { path: PathBuf, expected: Provenance, found: Provenance },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Io { path, source } => {
                write!(f, "checkpoint io error ({}): {}", path.display(), source)
            }
            CheckpointError::Json { path, source } => {
                write!(f, "checkpoint format error ({}): {}", path.display(), source)
            }
            CheckpointError::WrongKind { path, expected, found } => write!(
                f,
                "checkpoint {} holds {} data, expected {}",
                path.display(),
                found,
                expected
            ),
            CheckpointError::UnsupportedVersion { path, found } => write!(
                f,
                "checkpoint {} has version {}, this build reads version {}",
                path.display(),
                found,
                CHECKPOINT_VERSION
            ),
            CheckpointError::Mismatch { path, expected, found } => write!(
                f,
                "checkpoint {} was written for {}, this run uses {}",
                path.display(),
                found,
                expected
            ),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::Io { source, .. } => Some(source),
            CheckpointError::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct DocumentRef<'a, T: ?Sized> {
    version: u32,
    kind: CheckpointKind,
    source: &'a Provenance,
    data: &'a T,
}

#[derive(Deserialize)]
struct Document {
    version: u32,
    kind: CheckpointKind,
    // Absent in version 1 documents; read once the version has been checked.
    #[serde(default)]
    source: serde_json::Value,
    data: serde_json::Value,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_err(path: &Path) -> impl FnOnce(serde_json::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    }
}

fn save<T: Serialize + ?Sized>(
    path: &Path,
    kind: CheckpointKind,
    source: &Provenance,
    data: &T,
) -> Result<(), CheckpointError> {
    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = BufWriter::new(file);
    let doc = DocumentRef {
        version: CHECKPOINT_VERSION,
        kind,
        source,
        data,
    };
    serde_json::to_writer(&mut writer, &doc).map_err(json_err(path))?;
    writer.flush().map_err(io_err(path))?;
    tracing::info!(path = %path.display(), %kind, "checkpoint saved");
    Ok(())
}

fn load<T: DeserializeOwned>(
    path: &Path,
    kind: CheckpointKind,
    source: &Provenance,
) -> Result<T, CheckpointError> {
    let file = File::open(path).map_err(io_err(path))?;
    let doc: Document = serde_json::from_reader(BufReader::new(file)).map_err(json_err(path))?;

    if doc.version != CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: doc.version,
        });
    }
    if doc.kind != kind {
        return Err(CheckpointError::WrongKind {
            path: path.to_path_buf(),
            expected: kind,
            found: doc.kind,
        });
    }
    let stored: Provenance = serde_json::from_value(doc.source).map_err(json_err(path))?;
    if !source.accepts(&stored, kind) {
        return Err(CheckpointError::Mismatch {
            path: path.to_path_buf(),
            expected: source.clone(),
            found: stored,
        });
    }

    let data = serde_json::from_value(doc.data).map_err(json_err(path))?;
    tracing::info!(path = %path.display(), %kind, "checkpoint loaded");
    Ok(data)
}

fn try_load<T: DeserializeOwned>(
    path: &Path,
    kind: CheckpointKind,
    source: &Provenance,
) -> Result<Option<T>, CheckpointError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "checkpoint file not found");
        return Ok(None);
    }
    match load(path, kind, source) {
        Err(CheckpointError::Mismatch { found, .. }) => {
            tracing::warn!(
                path = %path.display(),
                stored = %found,
                "checkpoint belongs to another run, recomputing"
            );
            Ok(None)
        }
        other => other.map(Some),
    }
}

pub fn save_packets(
    path: &Path,
    source: &Provenance,
    packets: &[PacketRecord],
) -> Result<(), CheckpointError> {
    save(path, CheckpointKind::Packets, source, packets)
}

pub fn load_packets(
    path: &Path,
    source: &Provenance,
) -> Result<Vec<PacketRecord>, CheckpointError> {
    load(path, CheckpointKind::Packets, source)
}

/// `Ok(None)` when the file does not exist or was written for another input.
pub fn try_load_packets(
    path: &Path,
    source: &Provenance,
) -> Result<Option<Vec<PacketRecord>>, CheckpointError> {
    try_load(path, CheckpointKind::Packets, source)
}

pub fn save_table(
    path: &Path,
    source: &Provenance,
    table: &ConnectionTable,
) -> Result<(), CheckpointError> {
    save(path, CheckpointKind::Connections, source, table)
}

pub fn load_table(path: &Path, source: &Provenance) -> Result<ConnectionTable, CheckpointError> {
    load(path, CheckpointKind::Connections, source)
}

/// `Ok(None)` when the file does not exist or was written for another input
/// or server.
pub fn try_load_table(
    path: &Path,
    source: &Provenance,
) -> Result<Option<ConnectionTable>, CheckpointError> {
    try_load(path, CheckpointKind::Connections, source)
}
