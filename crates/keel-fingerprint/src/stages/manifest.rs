use std::collections::BTreeSet;
use std::fmt;

use keel_core::{HashBuilder, HashCode};

use crate::error::HashError;
use crate::resource::{Next, ResourceEntry, ResourceStage};

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// Hashes `META-INF/MANIFEST.MF` by its attributes rather than its bytes.
///
/// Attribute names are compared case-insensitively and order does not
/// matter. Ignored attributes and ignored named sections are dropped, and a
/// section left empty by that contributes nothing. A manifest that cannot be
/// parsed is passed down the pipeline unchanged.
#[derive(Debug, Clone, Default)]
pub struct ManifestStage {
    ignored_attributes: BTreeSet<String>,
    ignored_sections: BTreeSet<String>,
}

impl ManifestStage {
    pub fn new<A, S>(ignored_attributes: A, ignored_sections: S) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        Self {
            ignored_attributes: ignored_attributes
                .into_iter()
                .map(|name| name.as_ref().to_ascii_lowercase())
                .collect(),
            ignored_sections: ignored_sections
                .into_iter()
                .map(|name| name.as_ref().to_owned())
                .collect(),
        }
    }

    fn hash_manifest(&self, manifest: &Manifest) -> HashCode {
        let mut hasher = HashBuilder::new();
        hasher.put_str("manifest");

        let main = self.normalized_attributes(&manifest.main);
        if !main.is_empty() {
            hasher.put_str("main");
            put_attributes(&mut hasher, &main);
        }

        let mut sections: Vec<(&str, Vec<(String, &str)>)> = manifest
            .sections
            .iter()
            .filter(|section| !self.ignored_sections.contains(&section.name))
            .map(|section| {
                (
                    section.name.as_str(),
                    self.normalized_attributes(&section.attributes),
                )
            })
            .filter(|(_, attributes)| !attributes.is_empty())
            .collect();
        sections.sort();
        for (name, attributes) in &sections {
            hasher.put_str("section").put_str(name);
            put_attributes(&mut hasher, attributes);
        }
        hasher.finish()
    }

    fn normalized_attributes<'m>(&self, attributes: &'m [(String, String)]) -> Vec<(String, &'m str)> {
        let mut out: Vec<(String, &str)> = attributes
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .filter(|(name, _)| name != "name" && !self.ignored_attributes.contains(name))
            .collect();
        out.sort();
        out
    }
}

fn put_attributes(hasher: &mut HashBuilder, attributes: &[(String, &str)]) {
    hasher.put_u64(attributes.len() as u64);
    for (name, value) in attributes {
        hasher.put_str(name).put_str(value);
    }
}

impl ResourceStage for ManifestStage {
    fn append_configuration_to(&self, hasher: &mut HashBuilder) {
        hasher
            .put_str("manifest")
            .put_u64(self.ignored_attributes.len() as u64);
        for name in &self.ignored_attributes {
            hasher.put_str(name);
        }
        hasher.put_u64(self.ignored_sections.len() as u64);
        for name in &self.ignored_sections {
            hasher.put_str(name);
        }
    }

    fn hash(
        &self,
        entry: &ResourceEntry<'_>,
        next: Next<'_>,
    ) -> Result<Option<HashCode>, HashError> {
        if !entry.path().eq_ignore_ascii_case(MANIFEST_PATH) {
            return next.hash(entry);
        }
        match parse_manifest(entry.bytes()) {
            Ok(manifest) => Ok(Some(self.hash_manifest(&manifest))),
            Err(err) => {
                tracing::warn!(
                    target = "keel.fingerprint",
                    path = entry.path(),
                    error = %err,
                    "could not parse manifest; hashing it as a regular resource"
                );
                next.hash(entry)
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Manifest {
    main: Vec<(String, String)>,
    sections: Vec<Section>,
}

#[derive(Debug, PartialEq, Eq)]
struct Section {
    name: String,
    attributes: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq)]
struct ManifestError {
    line: usize,
    message: &'static str,
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

fn parse_manifest(bytes: &[u8]) -> Result<Manifest, ManifestError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ManifestError {
        line: 0,
        message: "manifest is not valid UTF-8",
    })?;

    let mut main: Option<Vec<(String, String)>> = None;
    let mut sections = Vec::new();
    let mut current: Vec<(String, String)> = Vec::new();

    let mut finish_section = |attributes: Vec<(String, String)>,
                              line: usize,
                              main: &mut Option<Vec<(String, String)>>|
     -> Result<(), ManifestError> {
        if main.is_none() {
            *main = Some(attributes);
            return Ok(());
        }
        if attributes.is_empty() {
            return Ok(());
        }
        let name = attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("name"))
            .map(|(_, value)| value.clone())
            .ok_or(ManifestError {
                line,
                message: "section is missing a Name attribute",
            })?;
        sections.push(Section { name, attributes });
        Ok(())
    };

    let mut line_no = 0;
    for line in text.split('\n') {
        line_no += 1;
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if !current.is_empty() || main.is_none() {
                finish_section(std::mem::take(&mut current), line_no, &mut main)?;
            }
            continue;
        }
        if let Some(continuation) = line.strip_prefix(' ') {
            let Some((_, value)) = current.last_mut() else {
                return Err(ManifestError {
                    line: line_no,
                    message: "continuation line without a preceding attribute",
                });
            };
            value.push_str(continuation);
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ManifestError {
                line: line_no,
                message: "expected `Name: value`",
            });
        };
        if name.is_empty() || name.contains(' ') {
            return Err(ManifestError {
                line: line_no,
                message: "invalid attribute name",
            });
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        current.push((name.to_owned(), value.to_owned()));
    }
    if !current.is_empty() || main.is_none() {
        finish_section(current, line_no, &mut main)?;
    }

    Ok(Manifest {
        main: main.unwrap_or_default(),
        sections,
    })
}
