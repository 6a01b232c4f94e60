//! Reading zip-family archives (jar, war, aar, ...) entry by entry.
//!
//! Callers care about one distinction above all: is the archive *structurally*
//! broken (fall back to hashing the whole file), or did the underlying I/O fail
//! (fatal)? [`ArchiveError`] keeps the two apart.

use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::Path;

use zip::result::ZipError;
use zip::ZipArchive;

/// File extensions treated as archives, compared case-insensitively.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "jar", "war", "ear", "aar", "apk"];

/// Returns whether `name` (a path or archive entry name) names an archive.
pub fn is_archive_name(name: &str) -> bool {
    let name = name.trim_end_matches('/');
    let Some((_, ext)) = name.rsplit_once('.') else {
        return false;
    };
    if ext.contains(['/', '\\']) {
        return false;
    }
    ARCHIVE_EXTENSIONS
        .iter()
        .any(|candidate| ext.eq_ignore_ascii_case(candidate))
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The bytes are not a readable zip archive (bad headers, truncated
    /// central directory, corrupt compressed stream, CRC mismatch).
    #[error("malformed archive: {message}")]
    Malformed { message: String },

    #[error("archive i/o error: {0}")]
    Io(io::Error),
}

impl ArchiveError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, ArchiveError::Malformed { .. })
    }

    /// Classifies an I/O error raised while decoding archive content.
    ///
    /// Decompressors report corrupt streams through `io::Error`, so data and
    /// truncation errors count as structural.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::UnexpectedEof => ArchiveError::Malformed {
                message: err.to_string(),
            },
            _ if err.to_string().contains("checksum") => ArchiveError::Malformed {
                message: err.to_string(),
            },
            _ => ArchiveError::Io(err),
        }
    }
}

impl From<ZipError> for ArchiveError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(err) => ArchiveError::from_io(err),
            other => ArchiveError::Malformed {
                message: other.to_string(),
            },
        }
    }
}

/// One entry of an archive, handed to the visitor of
/// [`ArchiveReader::for_each_entry`].
pub struct ArchiveEntry<'a> {
    name: &'a str,
    is_directory: bool,
    size: u64,
    reader: &'a mut dyn Read,
}

impl<'a> ArchiveEntry<'a> {
    /// Full entry name inside its archive, `/`-separated.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Declared uncompressed size.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn reader(&mut self) -> &mut dyn Read {
        self.reader
    }

    pub fn read_to_vec(&mut self) -> Result<Vec<u8>, ArchiveError> {
        // The declared size is attacker-controlled; only use it as a hint.
        let mut buf = Vec::with_capacity(self.size.min(1 << 20) as usize);
        self.reader
            .read_to_end(&mut buf)
            .map_err(ArchiveError::from_io)?;
        Ok(buf)
    }
}

/// Sequential reader over the entries of a zip archive.
pub struct ArchiveReader<R> {
    zip: ZipArchive<R>,
}

impl ArchiveReader<File> {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(ArchiveError::Io)?;
        Self::new(file)
    }
}

impl ArchiveReader<io::Cursor<Vec<u8>>> {
    /// Reads an archive held in memory, e.g. a jar nested inside another jar.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ArchiveError> {
        Self::new(io::Cursor::new(bytes))
    }
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn new(reader: R) -> Result<Self, ArchiveError> {
        Ok(Self {
            zip: ZipArchive::new(reader)?,
        })
    }

    pub fn len(&self) -> usize {
        self.zip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zip.is_empty()
    }

    /// Visits every entry in physical (central directory) order.
    ///
    /// The visitor's error type must be able to absorb [`ArchiveError`] so
    /// decoding failures propagate through the same channel.
    pub fn for_each_entry<E, F>(&mut self, mut visit: F) -> Result<(), E>
    where
        E: From<ArchiveError>,
        F: FnMut(ArchiveEntry<'_>) -> Result<(), E>,
    {
        for index in 0..self.zip.len() {
            let mut file = self.zip.by_index(index).map_err(ArchiveError::from)?;
            let name = file.name().to_owned();
            let is_directory = file.is_dir();
            let size = file.size();
            visit(ArchiveEntry {
                name: &name,
                is_directory,
                size,
                reader: &mut file,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(name.trim_end_matches('/'), FileOptions::<()>::default())
                    .unwrap();
            } else {
                writer.start_file(*name, FileOptions::<()>::default()).unwrap();
                writer.write_all(contents).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn archive_names_are_detected_case_insensitively() {
        assert!(is_archive_name("lib/guava.jar"));
        assert!(is_archive_name("LIB/APP.WAR"));
        assert!(is_archive_name("nested/inner.zip"));
        assert!(!is_archive_name("Main.class"));
        assert!(!is_archive_name("dir.jar/child"));
        assert!(!is_archive_name("jar"));
    }

    #[test]
    fn visits_entries_in_stream_order() {
        let bytes = zip_bytes(&[("b.txt", b"bee"), ("a/", b""), ("a/c.txt", b"sea")]);
        let mut reader = ArchiveReader::from_bytes(bytes).unwrap();
        assert_eq!(reader.len(), 3);

        let mut seen = Vec::new();
        reader
            .for_each_entry(|mut entry| -> Result<(), ArchiveError> {
                let contents = entry.read_to_vec()?;
                seen.push((entry.name().to_owned(), entry.is_directory(), contents));
                Ok(())
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![
                ("b.txt".to_owned(), false, b"bee".to_vec()),
                ("a/".to_owned(), true, Vec::new()),
                ("a/c.txt".to_owned(), false, b"sea".to_vec()),
            ]
        );
    }

    #[test]
    fn garbage_is_malformed_not_io() {
        let err = ArchiveReader::from_bytes(b"definitely not a zip file".to_vec())
            .err()
            .unwrap();
        assert!(err.is_malformed(), "{err}");
    }

    #[test]
    fn truncated_archive_is_malformed() {
        let mut bytes = zip_bytes(&[("a.txt", b"hello world")]);
        bytes.truncate(bytes.len() / 2);
        let err = ArchiveReader::from_bytes(bytes).err().unwrap();
        assert!(err.is_malformed(), "{err}");
    }

    #[test]
    fn missing_file_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArchiveReader::open(&dir.path().join("absent.jar"))
            .err()
            .unwrap();
        assert!(matches!(err, ArchiveError::Io(_)));
    }

    #[test]
    fn permission_errors_stay_fatal() {
        let err = ArchiveError::from_io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!err.is_malformed());
        let err = ArchiveError::from_io(io::Error::new(io::ErrorKind::InvalidData, "bad deflate"));
        assert!(err.is_malformed());
    }
}
