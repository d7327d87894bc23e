//! `LINKS`: sha256 -> mirror URLs for payload files stored by reference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CartonError, Result};
use crate::types::LinkedFile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    pub version: u64,
    pub urls: BTreeMap<String, Vec<String>>,
}

impl Default for Links {
    fn default() -> Self {
        Self {
            version: 1,
            urls: BTreeMap::new(),
        }
    }
}

impl Links {
    pub fn from_linked_files(files: &[LinkedFile]) -> Self {
        let mut links = Self::default();
        links.merge(files);
        links
    }

    pub fn parse(text: &str) -> Result<Self> {
        let links: Links = toml::from_str(text)?;
        if links.version != 1 {
            return Err(CartonError::Validation(format!(
                "unsupported LINKS version {}",
                links.version
            )));
        }
        Ok(links)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Union with `files`. URLs keep first-seen order with duplicates removed.
    pub fn merge(&mut self, files: &[LinkedFile]) {
        for file in files {
            let urls = self.urls.entry(file.sha256.clone()).or_default();
            for url in &file.urls {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
        }
    }

    pub fn get(&self, sha256: &str) -> Option<&[String]> {
        self.urls.get(sha256).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn to_linked_files(&self) -> Vec<LinkedFile> {
        self.urls
            .iter()
            .map(|(sha256, urls)| LinkedFile {
                sha256: sha256.clone(),
                urls: urls.clone(),
            })
            .collect()
    }
}
