//! Field extraction through an external `tshark` process.

use std::io::Cursor;
use std::path::Path;
use std::process::Command;

use super::{fields, DecodeError, DecodeOutput};

/// Fields requested from tshark. IPv4 and IPv6 addresses come in separate
/// columns; only the pair matching the packet's IP version is populated.
pub const TSHARK_FIELDS: [&str; 11] = [
    "frame.time_epoch",
    "ip.src",
    "ip.dst",
    "ipv6.src",
    "ipv6.dst",
    "tcp.srcport",
    "tcp.dstport",
    "tcp.flags.syn",
    "tcp.flags.ack",
    "tcp.flags.fin",
    "tcp.flags.reset",
];

/// Argument list for one extraction run.
pub fn command_args(capture: &Path) -> Vec<String> {
    let mut args = vec![
        "-r".to_string(),
        capture.display().to_string(),
        "-Y".to_string(),
        "tcp".to_string(),
        "-T".to_string(),
        "fields".to_string(),
        // Tunnelled packets repeat ip.* fields; keep the outer header only.
        "-E".to_string(),
        "occurrence=f".to_string(),
    ];
    for field in TSHARK_FIELDS {
        args.push("-e".to_string());
        args.push(field.to_string());
    }
    args
}

pub fn extract(program: &str, capture: &Path) -> Result<DecodeOutput, DecodeError> {
    tracing::info!(program, capture = %capture.display(), "extracting TCP packets with tshark");

    let output = Command::new(program)
        .args(command_args(capture))
        .output()
        .map_err(|source| DecodeError::TsharkSpawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(DecodeError::TsharkFailed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let rows = fold_output(&output.stdout);
    fields::read(Cursor::new(rows), capture)
}

/// Rewrite raw tshark output into [`crate::record::parse_fields`] order,
/// one row per input line so record indices stay line numbers.
pub fn fold_output(stdout: &[u8]) -> String {
    let text = String::from_utf8_lossy(stdout);
    let mut rows = String::with_capacity(text.len());
    for line in text.lines() {
        rows.push_str(&fold_address_columns(line));
        rows.push('\n');
    }
    rows
}

/// Replace the four address columns of one row with the populated pair,
/// IPv4 first. Rows too short to carry every column pass through unchanged
/// and are rejected by the field parser.
fn fold_address_columns(line: &str) -> String {
    let cols: Vec<&str> = line.split('\t').collect();
    if cols.len() < TSHARK_FIELDS.len() {
        return line.to_string();
    }
    let (src, dst) = if cols[1].trim().is_empty() && cols[2].trim().is_empty() {
        (cols[3], cols[4])
    } else {
        (cols[1], cols[2])
    };
    let mut folded = Vec::with_capacity(cols.len() - 2);
    folded.extend_from_slice(&[cols[0], src, dst]);
    folded.extend_from_slice(&cols[5..]);
    folded.join("\t")
}
