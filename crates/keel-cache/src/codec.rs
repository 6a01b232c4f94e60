use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;

/// Largest stored value or entry file we decode; a corrupt length prefix
/// becomes an error instead of an allocation.
pub(crate) const PAYLOAD_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

fn options() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CacheError> {
    Ok(options().serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    Ok(options().with_limit(PAYLOAD_LIMIT_BYTES).deserialize(bytes)?)
}
