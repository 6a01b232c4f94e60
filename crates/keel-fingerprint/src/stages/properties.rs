use std::collections::BTreeSet;
use std::fmt;

use globset::GlobSet;
use keel_core::{HashBuilder, HashCode};

use crate::error::HashError;
use crate::resource::{Next, ResourceEntry, ResourceStage};

pub const DEFAULT_PROPERTIES_PATTERNS: &[&str] = &["META-INF/*.properties"];

/// Hashes Java `.properties` resources by their key/value pairs.
///
/// Comments, blank lines, entry order and escaping style do not affect the
/// hash. Keys stay case-sensitive, like `java.util.Properties`. Ignored keys
/// are dropped. Files that fail to parse are passed down the pipeline.
#[derive(Debug, Clone)]
pub struct PropertiesStage {
    patterns: Vec<String>,
    set: GlobSet,
    ignored_keys: BTreeSet<String>,
}

impl PropertiesStage {
    pub fn new<K>(patterns: Vec<String>, ignored_keys: K) -> Result<Self, HashError>
    where
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let mut patterns = patterns;
        patterns.sort();
        patterns.dedup();
        let set = super::compile_globs(&patterns)?;
        Ok(Self {
            patterns,
            set,
            ignored_keys: ignored_keys.into_iter().map(Into::into).collect(),
        })
    }

    pub fn with_default_patterns<K>(ignored_keys: K) -> Result<Self, HashError>
    where
        K: IntoIterator,
        K::Item: Into<String>,
    {
        Self::new(
            DEFAULT_PROPERTIES_PATTERNS
                .iter()
                .map(|p| (*p).to_owned())
                .collect(),
            ignored_keys,
        )
    }

    fn hash_properties(&self, mut entries: Vec<(String, String)>) -> HashCode {
        // Later duplicates win, as in `Properties::load`.
        entries.reverse();
        let mut seen = BTreeSet::new();
        entries.retain(|(key, _)| seen.insert(key.clone()));
        entries.retain(|(key, _)| !self.ignored_keys.contains(key));
        entries.sort();

        let mut hasher = HashBuilder::new();
        hasher.put_str("properties").put_u64(entries.len() as u64);
        for (key, value) in &entries {
            hasher.put_str(key).put_str(value);
        }
        hasher.finish()
    }
}

impl ResourceStage for PropertiesStage {
    fn append_configuration_to(&self, hasher: &mut HashBuilder) {
        hasher
            .put_str("properties")
            .put_u64(self.patterns.len() as u64);
        for pattern in &self.patterns {
            hasher.put_str(pattern);
        }
        hasher.put_u64(self.ignored_keys.len() as u64);
        for key in &self.ignored_keys {
            hasher.put_str(key);
        }
    }

    fn hash(
        &self,
        entry: &ResourceEntry<'_>,
        next: Next<'_>,
    ) -> Result<Option<HashCode>, HashError> {
        if !self.set.is_match(entry.path()) {
            return next.hash(entry);
        }
        match parse_properties(entry.bytes()) {
            Ok(entries) => Ok(Some(self.hash_properties(entries))),
            Err(err) => {
                tracing::warn!(
                    target = "keel.fingerprint",
                    path = entry.path(),
                    error = %err,
                    "could not parse properties file; hashing it as a regular resource"
                );
                next.hash(entry)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct PropertiesError {
    line: usize,
}

impl fmt::Display for PropertiesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed \\uxxxx escape on line {}", self.line)
    }
}

/// Parses ISO-8859-1 `.properties` content into `(key, value)` pairs in file
/// order.
fn parse_properties(bytes: &[u8]) -> Result<Vec<(String, String)>, PropertiesError> {
    let mut offset = 0usize;
    let mut line = 0usize;
    let mut entries = Vec::new();

    while offset < bytes.len() {
        line += 1;
        let logical = read_logical_line(bytes, &mut offset);
        if let Some((key, value)) = split_logical_line(&logical) {
            let key = unescape(key).ok_or(PropertiesError { line })?;
            let value = unescape(value).ok_or(PropertiesError { line })?;
            entries.push((key, value));
        }
    }
    Ok(entries)
}

fn read_logical_line(bytes: &[u8], offset: &mut usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let start = *offset;
        let mut end = start;
        while end < bytes.len() && bytes[end] != b'\n' && bytes[end] != b'\r' {
            end += 1;
        }
        // Consume one line terminator: `\n`, `\r` or `\r\n`.
        *offset = end;
        if *offset < bytes.len() && bytes[*offset] == b'\r' {
            *offset += 1;
        }
        if *offset < bytes.len() && bytes[*offset] == b'\n' {
            *offset += 1;
        }

        let segment = &bytes[start..end];
        let continues = ends_with_unescaped_backslash(segment) && !is_comment(&out, segment);
        if continues {
            out.extend_from_slice(&segment[..segment.len() - 1]);
        } else {
            out.extend_from_slice(segment);
            return out;
        }
        if *offset >= bytes.len() {
            return out;
        }
        while *offset < bytes.len() && is_whitespace(bytes[*offset]) {
            *offset += 1;
        }
    }
}

fn is_comment(previous: &[u8], segment: &[u8]) -> bool {
    if !previous.is_empty() {
        return false;
    }
    matches!(
        segment.iter().find(|b| !is_whitespace(**b)),
        Some(b'#') | Some(b'!')
    )
}

fn ends_with_unescaped_backslash(line: &[u8]) -> bool {
    line.iter().rev().take_while(|&&b| b == b'\\').count() % 2 == 1
}

fn split_logical_line(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut i = 0usize;
    while i < line.len() && is_whitespace(line[i]) {
        i += 1;
    }
    if i >= line.len() || line[i] == b'#' || line[i] == b'!' {
        return None;
    }

    let key_start = i;
    while i < line.len() {
        match line[i] {
            b'\\' => i += 2,
            b'=' | b':' => break,
            b if is_whitespace(b) => break,
            _ => i += 1,
        }
    }
    let key_end = i.min(line.len());

    while i < line.len() && is_whitespace(line[i]) {
        i += 1;
    }
    if i < line.len() && (line[i] == b'=' || line[i] == b':') {
        i += 1;
    }
    while i < line.len() && is_whitespace(line[i]) {
        i += 1;
    }
    Some((&line[key_start..key_end], &line[i.min(line.len())..]))
}

fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\x0C')
}

/// Resolves escapes. Returns `None` for a malformed `\uxxxx` sequence.
fn unescape(bytes: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            out.push(char::from(b));
            i += 1;
            continue;
        }
        i += 1;
        let Some(&escaped) = bytes.get(i) else {
            break;
        };
        match escaped {
            b't' => out.push('\t'),
            b'n' => out.push('\n'),
            b'r' => out.push('\r'),
            b'f' => out.push('\x0C'),
            b'u' => {
                let digits = bytes.get(i + 1..i + 5)?;
                let mut value = 0u32;
                for &digit in digits {
                    value = (value << 4) | char::from(digit).to_digit(16)?;
                }
                // Lone surrogates cannot be represented; keep a replacement.
                out.push(char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER));
                i += 4;
            }
            other => out.push(char::from(other)),
        }
        i += 1;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{RawContentHasher, ResourceHasher, ResourcePipeline};
    use pretty_assertions::assert_eq;

    fn pipeline(ignored: &[&str]) -> ResourcePipeline {
        ResourcePipeline::new(
            vec![Box::new(
                PropertiesStage::with_default_patterns(ignored.iter().copied()).unwrap(),
            )],
            Box::new(RawContentHasher::default()),
        )
    }

    fn hash(pipeline: &ResourcePipeline, path: &str, text: &str) -> HashCode {
        pipeline
            .hash(&ResourceEntry::new(path, text.as_bytes()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn parses_escapes_and_continuations() {
        let parsed =
            parse_properties(b"# header\nkey = a\\\n    b\nother:\\u0041\\tz\n! bang\nempty\n")
                .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("key".to_owned(), "ab".to_owned()),
                ("other".to_owned(), "A\tz".to_owned()),
                ("empty".to_owned(), String::new()),
            ]
        );
    }

    #[test]
    fn formatting_and_order_are_irrelevant() {
        let pipeline = pipeline(&[]);
        let path = "META-INF/build.properties";
        assert_eq!(
            hash(&pipeline, path, "# generated\nb=2\na=1\n"),
            hash(&pipeline, path, "a : 1\r\nb   2\r\n"),
        );
    }

    #[test]
    fn key_case_is_significant() {
        let pipeline = pipeline(&[]);
        let path = "META-INF/build.properties";
        assert_ne!(
            hash(&pipeline, path, "Version=1\n"),
            hash(&pipeline, path, "version=1\n"),
        );
    }

    #[test]
    fn ignored_keys_are_dropped() {
        let pipeline = pipeline(&["timestamp"]);
        let path = "META-INF/build.properties";
        assert_eq!(
            hash(&pipeline, path, "version=1\ntimestamp=100\n"),
            hash(&pipeline, path, "version=1\ntimestamp=200\n"),
        );
    }

    #[test]
    fn malformed_unicode_escape_falls_back_to_raw_bytes() {
        let pipeline = pipeline(&[]);
        let path = "META-INF/bad.properties";
        let text = "key=\\u00zz\n";
        assert_eq!(hash(&pipeline, path, text), HashCode::from_bytes(text.as_bytes()));
    }

    #[test]
    fn only_matching_paths_are_parsed() {
        let pipeline = pipeline(&[]);
        let text = "b=2\na=1\n";
        assert_eq!(
            hash(&pipeline, "config/app.properties", text),
            HashCode::from_bytes(text.as_bytes())
        );
    }
}
