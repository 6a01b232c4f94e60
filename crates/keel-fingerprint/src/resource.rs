use std::error::Error;
use std::fmt;
use std::sync::Arc;

use keel_core::{HashBuilder, HashCode};

use crate::error::HashError;

/// A single classpath resource: a file below a classpath directory or an entry
/// inside a (possibly nested) archive.
#[derive(Clone, Copy)]
pub struct ResourceEntry<'a> {
    path: &'a str,
    bytes: &'a [u8],
    content_hash: HashCode,
}

impl<'a> ResourceEntry<'a> {
    /// `path` is relative to the classpath directory or to the innermost
    /// archive, `/`-separated.
    pub fn new(path: &'a str, bytes: &'a [u8]) -> Self {
        Self {
            path,
            bytes,
            content_hash: HashCode::from_bytes(bytes),
        }
    }

    pub fn path(&self) -> &'a str {
        self.path
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Hash of the raw bytes, used as the memoization key for derived hashes.
    pub fn content_hash(&self) -> HashCode {
        self.content_hash
    }

    pub fn file_name(&self) -> &'a str {
        self.path.rsplit('/').next().unwrap_or(self.path)
    }
}

impl fmt::Debug for ResourceEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("path", &self.path)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Anything that turns a resource into its semantic hash.
///
/// `Ok(None)` means the resource contributes nothing to the fingerprint.
pub trait ResourceHasher: Send + Sync {
    /// Identity and parameters of the hasher, mixed into every cache key.
    fn configuration_hash(&self) -> HashCode;

    fn hash(&self, entry: &ResourceEntry<'_>) -> Result<Option<HashCode>, HashError>;
}

/// One step of the resource pipeline.
///
/// A stage either answers on its own (a hash, or `None` to drop the entry) or
/// hands the entry to the rest of the pipeline through `next`.
pub trait ResourceStage: Send + Sync {
    fn append_configuration_to(&self, hasher: &mut HashBuilder);

    fn hash(&self, entry: &ResourceEntry<'_>, next: Next<'_>)
        -> Result<Option<HashCode>, HashError>;
}

/// The terminal stage of the pipeline.
pub trait BaseHasher: Send + Sync {
    fn append_configuration_to(&self, hasher: &mut HashBuilder);

    fn hash(&self, entry: &ResourceEntry<'_>) -> Result<Option<HashCode>, HashError>;
}

/// The remainder of a pipeline, as seen from a stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Box<dyn ResourceStage>],
    base: &'a dyn BaseHasher,
}

impl Next<'_> {
    pub fn hash(self, entry: &ResourceEntry<'_>) -> Result<Option<HashCode>, HashError> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.hash(
                entry,
                Next {
                    stages: rest,
                    base: self.base,
                },
            ),
            None => self.base.hash(entry),
        }
    }
}

/// An ordered list of [`ResourceStage`]s ending in a [`BaseHasher`].
pub struct ResourcePipeline {
    stages: Vec<Box<dyn ResourceStage>>,
    base: Box<dyn BaseHasher>,
    configuration_hash: HashCode,
}

impl ResourcePipeline {
    pub fn new(stages: Vec<Box<dyn ResourceStage>>, base: Box<dyn BaseHasher>) -> Self {
        let mut hasher = HashBuilder::new();
        hasher.put_str("keel.resource-pipeline").put_u64(stages.len() as u64);
        for stage in &stages {
            stage.append_configuration_to(&mut hasher);
        }
        base.append_configuration_to(&mut hasher);
        Self {
            stages,
            base,
            configuration_hash: hasher.finish(),
        }
    }
}

impl ResourceHasher for ResourcePipeline {
    fn configuration_hash(&self) -> HashCode {
        self.configuration_hash
    }

    fn hash(&self, entry: &ResourceEntry<'_>) -> Result<Option<HashCode>, HashError> {
        Next {
            stages: &self.stages,
            base: &*self.base,
        }
        .hash(entry)
    }
}

impl fmt::Debug for ResourcePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePipeline")
            .field("stages", &self.stages.len())
            .field("configuration_hash", &self.configuration_hash)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LineEndingSensitivity {
    #[default]
    Default,
    /// Treat `\r\n` and `\r` as `\n` in text content.
    NormalizeLineEndings,
}

/// Hashes the raw bytes of a resource.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawContentHasher {
    line_endings: LineEndingSensitivity,
}

impl RawContentHasher {
    pub fn new(line_endings: LineEndingSensitivity) -> Self {
        Self { line_endings }
    }

    pub fn hash_bytes(&self, bytes: &[u8]) -> HashCode {
        match self.line_endings {
            LineEndingSensitivity::NormalizeLineEndings if is_text(bytes) => {
                HashCode::from_bytes(normalize_line_endings(bytes))
            }
            _ => HashCode::from_bytes(bytes),
        }
    }
}

impl BaseHasher for RawContentHasher {
    fn append_configuration_to(&self, hasher: &mut HashBuilder) {
        hasher
            .put_str("raw")
            .put_bool(self.line_endings == LineEndingSensitivity::NormalizeLineEndings);
    }

    fn hash(&self, entry: &ResourceEntry<'_>) -> Result<Option<HashCode>, HashError> {
        Ok(Some(self.hash_bytes(entry.bytes())))
    }
}

/// Control bytes other than common whitespace mark content as binary.
fn is_text(bytes: &[u8]) -> bool {
    !bytes
        .iter()
        .any(|&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c))
}

fn normalize_line_endings(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b == b'\r' {
            if iter.peek() == Some(&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    out
}

/// Extracts the public API surface of a compiled class.
///
/// `Ok(Some(bytes))` is a canonical encoding of the class ABI, `Ok(None)`
/// excludes the class (e.g. private or synthetic), and an error means the
/// class cannot be analyzed and its raw bytes should be used instead.
pub trait AbiExtractor: Send + Sync {
    /// Name and version of the extractor, mixed into the configuration hash.
    fn identity(&self) -> &str;

    fn extract(&self, class_bytes: &[u8]) -> Result<Option<Vec<u8>>, Box<dyn Error + Send + Sync>>;
}

/// Hashes `.class` resources by their ABI and everything else by content.
pub struct AbiHasher {
    extractor: Arc<dyn AbiExtractor>,
    raw: RawContentHasher,
}

impl AbiHasher {
    pub fn new(extractor: Arc<dyn AbiExtractor>, raw: RawContentHasher) -> Self {
        Self { extractor, raw }
    }
}

impl BaseHasher for AbiHasher {
    fn append_configuration_to(&self, hasher: &mut HashBuilder) {
        hasher.put_str("abi").put_str(self.extractor.identity());
        self.raw.append_configuration_to(hasher);
    }

    fn hash(&self, entry: &ResourceEntry<'_>) -> Result<Option<HashCode>, HashError> {
        if !entry.path().ends_with(".class") {
            return self.raw.hash(entry);
        }
        match self.extractor.extract(entry.bytes()) {
            Ok(Some(abi)) => Ok(Some(HashCode::from_bytes(abi))),
            Ok(None) => Ok(None),
            Err(err) => {
                tracing::debug!(
                    target = "keel.fingerprint",
                    path = entry.path(),
                    error = %err,
                    "ABI extraction failed; hashing class bytes"
                );
                self.raw.hash(entry)
            }
        }
    }
}

impl fmt::Debug for AbiHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbiHasher")
            .field("extractor", &self.extractor.identity())
            .field("raw", &self.raw)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl ResourceStage for Upper {
        fn append_configuration_to(&self, hasher: &mut HashBuilder) {
            hasher.put_str("upper");
        }

        fn hash(
            &self,
            entry: &ResourceEntry<'_>,
            next: Next<'_>,
        ) -> Result<Option<HashCode>, HashError> {
            if entry.path().starts_with("skip/") {
                return Ok(None);
            }
            let upper = entry.bytes().to_ascii_uppercase();
            next.hash(&ResourceEntry::new(entry.path(), &upper))
        }
    }

    #[test]
    fn stages_run_in_order_before_the_base() {
        let pipeline = ResourcePipeline::new(
            vec![Box::new(Upper)],
            Box::new(RawContentHasher::default()),
        );
        assert_eq!(
            pipeline.hash(&ResourceEntry::new("a.txt", b"abc")).unwrap(),
            Some(HashCode::from_bytes(b"ABC"))
        );
        assert_eq!(
            pipeline.hash(&ResourceEntry::new("skip/a.txt", b"abc")).unwrap(),
            None
        );
    }

    #[test]
    fn configuration_hash_depends_on_stages_and_base() {
        let raw = ResourcePipeline::new(Vec::new(), Box::new(RawContentHasher::default()));
        let staged = ResourcePipeline::new(
            vec![Box::new(Upper)],
            Box::new(RawContentHasher::default()),
        );
        let normalized = ResourcePipeline::new(
            Vec::new(),
            Box::new(RawContentHasher::new(LineEndingSensitivity::NormalizeLineEndings)),
        );
        assert_ne!(raw.configuration_hash(), staged.configuration_hash());
        assert_ne!(raw.configuration_hash(), normalized.configuration_hash());
    }

    #[test]
    fn line_endings_are_normalized_for_text_only() {
        let hasher = RawContentHasher::new(LineEndingSensitivity::NormalizeLineEndings);
        assert_eq!(hasher.hash_bytes(b"a\r\nb\rc\n"), hasher.hash_bytes(b"a\nb\nc\n"));
        assert_ne!(
            hasher.hash_bytes(b"\0bin\r\n"),
            hasher.hash_bytes(b"\0bin\n")
        );
        let strict = RawContentHasher::default();
        assert_ne!(strict.hash_bytes(b"a\r\n"), strict.hash_bytes(b"a\n"));
    }
}
