//! Chunked line sources over plain or gzip files.
//!
//! Guess files routinely exceed memory, so everything downstream consumes
//! fixed-size batches of decoded lines. Gzip input goes through
//! `MultiGzDecoder`: guess files are written in append mode and therefore
//! consist of several gzip members back to back.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use flate2::bufread::MultiGzDecoder;

use crate::error::{BenchError, Result};

/// Lines per batch when the caller has no preference.
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// True when the file starts with the gzip magic bytes. A file that cannot
/// be read falls back to its `.gz` extension.
pub fn is_gzip(path: &Path) -> bool {
    let mut head = [0u8; 2];
    match File::open(path).and_then(|mut f| f.read_exact(&mut head)) {
        Ok(()) => head == GZIP_MAGIC,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => false,
        Err(_) => path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz")),
    }
}

/// Open a file for buffered line reading, transparently decompressing gzip.
///
/// Compression is decided by content, not by name.
pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).map_err(|e| BenchError::stream(path, format!("cannot open: {}", e)))?;
    let mut reader = BufReader::new(file);
    let head = reader.fill_buf().map_err(|e| BenchError::stream(path, e))?;
    if head.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// Iterator over batches of at most `chunk_size` lines.
///
/// Line terminators (`\n`, `\r\n`) are stripped; nothing else is trimmed.
/// A decode failure is yielded once and ends the iteration.
pub struct ChunkedLines {
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
    chunk_size: usize,
    buf: Vec<u8>,
    finished: bool,
}

impl ChunkedLines {
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            reader: open_reader(path)?,
            chunk_size: chunk_size.max(1),
            buf: Vec::new(),
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|e| BenchError::stream(&self.path, e))?;
        if read == 0 {
            return Ok(None);
        }

        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }

        String::from_utf8(std::mem::take(&mut self.buf))
            .map(Some)
            .map_err(|e| BenchError::stream(&self.path, format!("invalid UTF-8: {}", e)))
    }
}

impl Iterator for ChunkedLines {
    type Item = Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            match self.next_line() {
                Ok(Some(line)) => chunk.push(line),
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }

        if chunk.is_empty() { None } else { Some(Ok(chunk)) }
    }
}

/// Read every non-empty line of a file.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for chunk in ChunkedLines::open(path, DEFAULT_CHUNK_SIZE)? {
        lines.extend(chunk?.into_iter().filter(|l| !l.is_empty()));
    }
    Ok(lines)
}

/// Parse a scored guess line: `password probability`.
///
/// Lines that do not have exactly two space-separated fields, or whose second
/// field is not a number, are skipped by returning `None`.
pub fn parse_scored_line(line: &str) -> Option<(&str, f64)> {
    let mut fields = line.split(' ');
    let password = fields.next()?;
    let probability = fields.next()?.trim().parse::<f64>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some((password, probability))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn append_gz(path: &Path, lines: &[&str]) {
        let file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        for line in lines {
            writeln!(enc, "{}", line).unwrap();
        }
        enc.finish().unwrap();
    }

    #[test]
    fn test_chunks_plain_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guesses.txt");
        std::fs::write(&path, "a\nb\r\nc\nd\ne").unwrap();

        let chunks: Vec<Vec<String>> = ChunkedLines::open(&path, 2)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks, vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
    }

    #[test]
    fn test_multi_member_gzip_reads_fully() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guesses.gz");
        append_gz(&path, &["one", "two"]);
        append_gz(&path, &["three"]);

        assert_eq!(read_lines(&path).unwrap(), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_corrupt_gzip_is_stream_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.gz");
        std::fs::write(&path, b"\x1f\x8bdefinitely not gzip").unwrap();

        let result: Result<Vec<_>> = ChunkedLines::open(&path, 8).unwrap().collect();
        assert!(matches!(result, Err(BenchError::StreamFormat { .. })));
    }

    #[test]
    fn test_gzip_detected_by_content() {
        let dir = TempDir::new().unwrap();
        let packed = dir.path().join("guesses.txt");
        append_gz(&packed, &["one", "two"]);
        assert!(is_gzip(&packed));
        assert_eq!(read_lines(&packed).unwrap(), vec!["one", "two"]);

        let plain = dir.path().join("plain.gz");
        std::fs::write(&plain, "one\ntwo\n").unwrap();
        assert!(!is_gzip(&plain));
        assert_eq!(read_lines(&plain).unwrap(), vec!["one", "two"]);

        assert!(is_gzip(Path::new("/nonexistent/guesses.gz")));
        assert!(!is_gzip(Path::new("/nonexistent/guesses.txt")));
    }

    #[test]
    fn test_missing_file_is_stream_error() {
        let err = ChunkedLines::open(Path::new("/nonexistent/guesses.gz"), 8).err().unwrap();
        assert!(err.to_string().contains("/nonexistent/guesses.gz"));
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "").unwrap();
        assert_eq!(ChunkedLines::open(&path, 4).unwrap().count(), 0);

        let gz = dir.path().join("empty.gz");
        std::fs::write(&gz, "").unwrap();
        assert!(read_lines(&gz).unwrap().is_empty());
    }

    #[test]
    fn test_parse_scored_line() {
        assert_eq!(parse_scored_line("pass~ 0.25"), Some(("pass~", 0.25)));
        assert_eq!(parse_scored_line("pass 1e-8"), Some(("pass", 1e-8)));
        assert_eq!(parse_scored_line("no-score"), None);
        assert_eq!(parse_scored_line("two words 0.1"), None);
        assert_eq!(parse_scored_line("pass abc"), None);
    }
}
