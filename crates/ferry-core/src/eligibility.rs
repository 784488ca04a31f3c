//! Eligibility filtering.
//!
//! Decides whether a resolved target may have its content rewritten. The
//! policy is allow-by-default: a blacklist match makes the target ineligible
//! regardless of the whitelist, and whitelist matches are only logged.
//! Ineligible targets are still proxied, just never modified.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::ConfigError;

/// Whether an entry's `url` is a regular expression.
///
/// Accepts JSON booleans or the strings `true`/`yes`/`on` and `false`/`no`/`off`.
/// Any other string, or a missing field, means regex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegexSetting {
    Flag(bool),
    Text(String),
}

impl Default for RegexSetting {
    fn default() -> Self {
        Self::Flag(true)
    }
}

impl RegexSetting {
    /// Returns true if the pattern should be compiled as a regex.
    pub fn is_regex(&self) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::Text(text) => !matches!(
                text.trim().to_ascii_lowercase().as_str(),
                "false" | "no" | "off"
            ),
        }
    }
}

/// One whitelist or blacklist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowDenyEntry {
    /// Pattern or substring.
    pub url: String,
    /// Regex or substring matching.
    #[serde(default)]
    pub regex: RegexSetting,
    /// JavaScript-style regex flags (`i`, `m`, `s`, `x` are honored).
    #[serde(default)]
    pub flags: String,
}

impl AllowDenyEntry {
    /// A regex entry.
    pub fn regex(pattern: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            url: pattern.into(),
            regex: RegexSetting::Flag(true),
            flags: flags.into(),
        }
    }

    /// A substring entry.
    pub fn substring(needle: impl Into<String>) -> Self {
        Self {
            url: needle.into(),
            regex: RegexSetting::Flag(false),
            flags: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    Contains(String),
}

#[derive(Debug, Clone)]
struct CompiledEntry {
    pattern: String,
    matcher: Matcher,
}

impl CompiledEntry {
    fn compile(entry: &AllowDenyEntry) -> Result<Self, ConfigError> {
        let matcher = if entry.regex.is_regex() {
            let regex = RegexBuilder::new(&entry.url)
                .case_insensitive(entry.flags.contains('i'))
                .multi_line(entry.flags.contains('m'))
                .dot_matches_new_line(entry.flags.contains('s'))
                .ignore_whitespace(entry.flags.contains('x'))
                .build()
                .map_err(|source| ConfigError::InvalidPattern {
                    pattern: entry.url.clone(),
                    source,
                })?;
            Matcher::Regex(regex)
        } else {
            Matcher::Contains(entry.url.clone())
        };

        Ok(Self {
            pattern: entry.url.clone(),
            matcher,
        })
    }

    fn matches(&self, url: &str) -> bool {
        match &self.matcher {
            Matcher::Regex(regex) => regex.is_match(url),
            Matcher::Contains(needle) => url.contains(needle.as_str()),
        }
    }
}

/// Compiled whitelist and blacklist.
#[derive(Debug, Clone, Default)]
pub struct EligibilityFilter {
    whitelist: Vec<CompiledEntry>,
    blacklist: Vec<CompiledEntry>,
}

impl EligibilityFilter {
    /// Compiles both lists. Fails on the first invalid pattern.
    pub fn new(
        whitelist: &[AllowDenyEntry],
        blacklist: &[AllowDenyEntry],
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            whitelist: whitelist
                .iter()
                .map(CompiledEntry::compile)
                .collect::<Result<_, _>>()?,
            blacklist: blacklist
                .iter()
                .map(CompiledEntry::compile)
                .collect::<Result<_, _>>()?,
        })
    }

    /// Compiles the lists carried by a config.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        Self::new(&config.whitelist, &config.blacklist)
    }

    /// Returns true if content fetched from `url` may be rewritten.
    pub fn is_eligible(&self, url: &str) -> bool {
        if let Some(entry) = self.blacklist.iter().find(|e| e.matches(url)) {
            tracing::warn!(
                "Not modifying blacklisted target {} (matched {:?})",
                url,
                entry.pattern
            );
            return false;
        }

        if let Some(entry) = self.whitelist.iter().find(|e| e.matches(url)) {
            tracing::debug!("Whitelisted target {} (matched {:?})", url, entry.pattern);
        }

        true
    }
}
