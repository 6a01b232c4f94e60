use std::collections::HashSet;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_archive::{is_archive_name, ArchiveError, ArchiveReader};
use keel_core::{HashBuilder, HashCode};
use parking_lot::Mutex;

use crate::error::HashError;
use crate::resource::{ResourceEntry, ResourceHasher};

/// Hash contributed by every archive, keyed by the archive's path prefix.
///
/// It makes an archive whose entries are all filtered out differ from no
/// archive at all.
fn empty_archive_marker() -> HashCode {
    HashCode::from_bytes([])
}

/// Hashes a zip-family archive by the semantic hashes of its entries.
///
/// Entries are hashed through the resource pipeline, nested archives are
/// expanded recursively, and the results are folded in full-entry-name order
/// so the physical order inside the archive does not matter.
pub struct ZipHasher {
    resources: Arc<dyn ResourceHasher>,
    reported_malformed: Mutex<HashSet<PathBuf>>,
}

enum WalkError {
    Archive(ArchiveError),
    Hash(HashError),
}

impl From<ArchiveError> for WalkError {
    fn from(err: ArchiveError) -> Self {
        WalkError::Archive(err)
    }
}

impl From<HashError> for WalkError {
    fn from(err: HashError) -> Self {
        WalkError::Hash(err)
    }
}

impl ZipHasher {
    pub fn new(resources: Arc<dyn ResourceHasher>) -> Self {
        Self {
            resources,
            reported_malformed: Mutex::new(HashSet::new()),
        }
    }

    pub fn configuration_hash(&self) -> HashCode {
        let mut hasher = HashBuilder::new();
        hasher
            .put_str("zip")
            .put_hash(&self.resources.configuration_hash());
        hasher.finish()
    }

    /// Hashes the archive at `path`.
    ///
    /// A structurally broken archive is hashed as `whole_file_hash` instead,
    /// with a warning logged once per path. I/O failures are returned.
    pub fn hash_archive(&self, path: &Path, whole_file_hash: HashCode) -> Result<HashCode, HashError> {
        let result = ArchiveReader::open(path)
            .map_err(WalkError::Archive)
            .and_then(|reader| self.fold_archive(reader));
        match result {
            Ok(hash) => Ok(hash),
            Err(WalkError::Archive(err)) if err.is_malformed() => {
                if self.reported_malformed.lock().insert(path.to_path_buf()) {
                    tracing::warn!(
                        target = "keel.fingerprint",
                        path = %path.display(),
                        error = %err,
                        "malformed archive; falling back to the whole-file hash"
                    );
                }
                Ok(whole_file_hash)
            }
            Err(WalkError::Archive(source)) => Err(HashError::Archive {
                path: path.to_path_buf(),
                source,
            }),
            Err(WalkError::Hash(err)) => Err(err),
        }
    }

    fn fold_archive<R: Read + Seek>(&self, reader: ArchiveReader<R>) -> Result<HashCode, WalkError> {
        let mut fingerprints = Vec::new();
        self.collect_entries(reader, "", &mut fingerprints)?;
        fingerprints.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut hasher = HashBuilder::new();
        hasher.put_u64(fingerprints.len() as u64);
        for (name, hash) in &fingerprints {
            hasher.put_str(name).put_hash(hash);
        }
        Ok(hasher.finish())
    }

    fn collect_entries<R: Read + Seek>(
        &self,
        mut reader: ArchiveReader<R>,
        prefix: &str,
        out: &mut Vec<(String, HashCode)>,
    ) -> Result<(), WalkError> {
        out.push((prefix.to_owned(), empty_archive_marker()));
        reader.for_each_entry(|mut entry| -> Result<(), WalkError> {
            if entry.is_directory() {
                return Ok(());
            }
            let name = entry.name().to_owned();
            let bytes = entry.read_to_vec()?;
            let full_name = format!("{prefix}{name}");
            if is_archive_name(&name) {
                let nested = ArchiveReader::from_bytes(bytes)?;
                return self.collect_entries(nested, &format!("{full_name}/"), out);
            }
            if let Some(hash) = self.resources.hash(&ResourceEntry::new(&name, &bytes))? {
                out.push((full_name, hash));
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for ZipHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipHasher")
            .field("configuration_hash", &self.configuration_hash())
            .finish()
    }
}
