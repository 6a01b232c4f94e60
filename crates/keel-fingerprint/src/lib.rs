//! Content fingerprints of file collections.
//!
//! Raw snapshots from `keel-vfs` are normalized ([`PathNormalization`]) into
//! [`FileCollectionFingerprint`]s, which can be hashed and diffed under a
//! [`CompareStrategy`]. Classpaths additionally run every resource through a
//! [`ResourcePipeline`] so that irrelevant differences (manifest attribute
//! order, class method bodies on a compile classpath, ignored files) do not
//! register as changes.

mod archive;
mod classpath;
mod compare;
mod error;
mod fingerprint;
mod fingerprinter;
mod normalization;
mod resource;
pub mod stages;

pub use archive::ZipHasher;
pub use classpath::{
    ClasspathHasher, ClasspathMode, DerivedHashCache, NoDerivedHashCache, ResourceNormalization,
};
pub use compare::{Change, ChangeKind, CompareStrategy, FingerprintEntries};
pub use error::HashError;
pub use fingerprint::{FileCollectionFingerprint, FingerprintRoot, FingerprintingStrategy};
pub use fingerprinter::{FileCollection, Fingerprinter};
pub use normalization::{NormalizedKey, NormalizedSnapshot, PathNormalization};
pub use resource::{
    AbiExtractor, AbiHasher, BaseHasher, LineEndingSensitivity, Next, RawContentHasher,
    ResourceEntry, ResourceHasher, ResourcePipeline, ResourceStage,
};
