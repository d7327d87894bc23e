//! `MANIFEST`: one `path=sha256` line per archived file.

use std::collections::BTreeMap;

use crate::error::{CartonError, Result};

use super::{is_sha256_hex, sha256_hex};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, sha256: impl Into<String>) {
        self.entries.insert(path.into(), sha256.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (path, sha) = line.rsplit_once('=').ok_or_else(|| {
                CartonError::Validation(format!("MANIFEST line {}: missing '='", lineno + 1))
            })?;
            if path.is_empty() || !is_sha256_hex(sha) {
                return Err(CartonError::Validation(format!(
                    "MANIFEST line {}: malformed entry '{line}'",
                    lineno + 1
                )));
            }
            entries.insert(path.to_string(), sha.to_string());
        }
        Ok(Self { entries })
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (path, sha) in &self.entries {
            out.push_str(path);
            out.push('=');
            out.push_str(sha);
            out.push('\n');
        }
        out
    }

    /// Hash of the serialized manifest; identifies an archive's content.
    pub fn digest(&self) -> String {
        sha256_hex(self.to_text().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_text_is_sorted() {
        let mut m = Manifest::new();
        m.insert("model/b", A);
        m.insert("carton.toml", A);
        let text = m.to_text();
        assert!(text.starts_with("carton.toml="));
        assert_eq!(Manifest::parse(&text).unwrap(), m);
    }

    #[test]
    fn test_parse_rejects_bad_hash() {
        assert!(Manifest::parse("model/a=xyz\n").is_err());
        assert!(Manifest::parse("model/a\n").is_err());
    }

    #[test]
    fn test_paths_may_contain_equals() {
        let m = Manifest::parse(&format!("model/a=b.bin={A}\n")).unwrap();
        assert_eq!(m.get("model/a=b.bin"), Some(A));
    }
}
