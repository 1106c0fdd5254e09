//! Tab-separated field reader.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::{DecodeError, DecodeOutput};
use crate::record::{parse_fields, RecordError};

pub fn read_file(path: &Path) -> Result<DecodeOutput, DecodeError> {
    let file = File::open(path).map_err(|source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read(BufReader::new(file), path)
}

pub fn read_stdin() -> Result<DecodeOutput, DecodeError> {
    let stdin = io::stdin();
    read(stdin.lock(), Path::new("-"))
}

/// Read records from any buffered source. `origin` only labels errors.
///
/// Blank lines, `#` comment lines and rows with neither address (non-IP
/// frames) are skipped without counting. Record indices in warnings are
/// 1-based line numbers.
pub fn read<R: BufRead>(reader: R, origin: &Path) -> Result<DecodeOutput, DecodeError> {
    let mut out = DecodeOutput::default();
    for (line_idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| DecodeError::Io {
            path: PathBuf::from(origin),
            source,
        })?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_fields(&line) {
            Ok(record) => out.push(record),
            Err(RecordError::NoAddress) => {
                tracing::trace!(index = line_idx + 1, "skipping record without IP addresses");
            }
            Err(e) => out.skip(line_idx as u64 + 1, &e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn skips_malformed_lines_and_keeps_the_rest() {
        let input = "\
# exported with tshark
0.0\t10.0.0.1\t10.0.0.2\t40000\t8000\t1\t0\t0\t0
garbage line
0.1\t10.0.0.2\t10.0.0.1\t8000\t40000\t1\t1\t0\t0

bad\t10.0.0.1\t10.0.0.2\t40000\t8000\t0\t1\t0\t0
0.2\t10.0.0.1\t10.0.0.2\t40000\t8000\t0\t1\t0\t0
";
        let out = read(Cursor::new(input), Path::new("test")).unwrap();
        assert_eq!(out.records.len(), 3);
        assert_eq!(out.malformed, 2);
        assert_eq!(out.examined, 5);
        assert_eq!(out.records[2].timestamp, 0.2);
    }

    #[test]
    fn rows_without_addresses_are_not_malformed() {
        let input = "\
1.0\t\t\t40000\t443\t1\t0\t0\t0
1.1\t10.0.0.1\t10.0.0.2\t40000\t443\t1\t0\t0\t0
1.2\t\t10.0.0.2\t40000\t443\t1\t0\t0\t0
";
        let out = read(Cursor::new(input), Path::new("test")).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.malformed, 1);
        assert_eq!(out.examined, 2);
    }

    #[test]
    fn malformed_warning_names_the_line() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let input = "\
0.0\t10.0.0.1\t10.0.0.2\t40000\t8000\t1\t0\t0\t0
# comment

0.3\t10.0.0.1\t10.0.0.2\tnope\t8000\t0\t1\t0\t0
";
        let out = tracing::subscriber::with_default(subscriber, || {
            read(Cursor::new(input), Path::new("test")).unwrap()
        });
        assert_eq!(out.malformed, 1);

        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let warning = text
            .lines()
            .find(|line| line.contains("skipping malformed record"))
            .unwrap();
        assert!(warning.contains("WARN"));
        assert!(warning.contains("index=4"));
        assert!(warning.contains("invalid port 'nope'"));
    }

    #[test]
    fn empty_input_is_an_empty_result() {
        let out = read(Cursor::new(""), Path::new("test")).unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.examined, 0);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_file(Path::new("/nonexistent/connscope/input.tsv")).unwrap_err();
        assert!(matches!(err, DecodeError::Io { .. }));
        assert!(err.to_string().starts_with("decode failed:"));
    }
}
