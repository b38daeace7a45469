//! Byte sources the backend demuxes from.
//!
//! One portable file implementation plus in-memory buffers; anything that
//! is `Read + Seek + Send + Sync` can be wrapped by the host.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A seekable stream of container bytes.
pub trait ByteSource: Read + Seek + Send + Sync {
    /// Total length in bytes, when known.
    fn byte_len(&self) -> Option<u64>;

    /// Whether `seek` can be used. Forward-only sources return false.
    fn is_seekable(&self) -> bool {
        true
    }

    /// Current read position.
    fn position(&mut self) -> io::Result<u64> {
        self.stream_position()
    }

    /// Extension-style hint for format probing ("mkv", "mp3", ...).
    fn hint(&self) -> Option<&str> {
        None
    }
}

// ============================================================================
// File Source
// ============================================================================

pub struct FileSource {
    reader: BufReader<File>,
    len: u64,
    path: PathBuf,
    extension: Option<String>,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        Ok(Self {
            reader: BufReader::new(file),
            len,
            path: path.to_path_buf(),
            extension,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl ByteSource for FileSource {
    fn byte_len(&self) -> Option<u64> {
        Some(self.len)
    }

    fn hint(&self) -> Option<&str> {
        self.extension.as_deref()
    }
}

// ============================================================================
// Memory Source
// ============================================================================

/// Container bytes already in memory.
pub struct MemorySource {
    cursor: Cursor<Vec<u8>>,
    hint: Option<String>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            cursor: Cursor::new(data),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hint = Some(hint.to_ascii_lowercase());
        self
    }
}

impl Read for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemorySource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl ByteSource for MemorySource {
    fn byte_len(&self) -> Option<u64> {
        Some(self.cursor.get_ref().len() as u64)
    }

    fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_source_reports_length_and_hint() {
        let mut file = tempfile::Builder::new().suffix(".MKV").tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        let mut source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.byte_len(), Some(10));
        assert_eq!(source.hint(), Some("mkv"));

        let mut buf = [0u8; 4];
        source.seek(SeekFrom::Start(6)).unwrap();
        source.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"6789");
        assert_eq!(source.position().unwrap(), 10);
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(FileSource::open("/definitely/not/here.mp4").is_err());
    }

    #[test]
    fn test_memory_source() {
        let mut source = MemorySource::new(b"abcdef".to_vec()).with_hint("WAV");
        assert_eq!(source.hint(), Some("wav"));
        assert_eq!(source.byte_len(), Some(6));
        let mut out = String::new();
        source.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcdef");
    }
}
