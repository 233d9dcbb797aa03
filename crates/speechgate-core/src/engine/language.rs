//! Language allow-list policy

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Accepted request languages, compared on the primary subtag
/// (`en-US` and `en_GB` both match `en`).
#[derive(Debug, Clone)]
pub struct LanguagePolicy {
    allowed: BTreeSet<String>,
    default: Option<String>,
}

impl LanguagePolicy {
    pub fn new<I, S>(allowed: I, default: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|tag| primary_subtag(tag.as_ref()))
                .filter(|tag| !tag.is_empty())
                .collect(),
            default: default.map(primary_subtag),
        }
    }

    /// Normalized language for a request, or `UnsupportedLanguage`
    pub fn check(&self, language: Option<&str>) -> Result<String> {
        let tag = match language.map(str::trim).filter(|l| !l.is_empty()) {
            Some(raw) => primary_subtag(raw),
            None => self
                .default
                .clone()
                .ok_or_else(|| Error::UnsupportedLanguage("<none>".to_string()))?,
        };

        if self.allowed.contains(&tag) {
            Ok(tag)
        } else {
            Err(Error::UnsupportedLanguage(language.unwrap_or(&tag).to_string()))
        }
    }

    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

fn primary_subtag(tag: &str) -> String {
    tag.trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}
