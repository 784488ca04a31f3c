//! `Content-Security-Policy` patching.
//!
//! Pages served through the proxy load assets from the proxy origin and from
//! the vendor hosts. Policies that restrict those directives get the missing
//! origins appended. A policy is parsed once into an ordered directive list,
//! patched in place and serialized again.

use std::fmt;

/// Directives that receive the extra origins when present.
pub const REWRITABLE_DIRECTIVES: &[&str] = &[
    "default-src",
    "script-src",
    "connect-src",
    "img-src",
    "style-src",
    "font-src",
    "media-src",
    "object-src",
    "child-src",
    "frame-ancestors",
    "form-action",
    "base-uri",
    "manifest-src",
    "sandbox",
    "report-uri",
    "reflected-xss",
    "referrer",
];

/// One `name source source ...` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Lowercased directive name.
    pub name: String,
    pub sources: Vec<String>,
    raw: String,
    modified: bool,
}

impl Directive {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let mut tokens = raw.split_ascii_whitespace();
        let name = tokens.next()?.to_ascii_lowercase();
        Some(Self {
            name,
            sources: tokens.map(str::to_string).collect(),
            raw: raw.to_string(),
            modified: false,
        })
    }

    fn append(&mut self, source: &str) -> bool {
        if self.sources.iter().any(|s| s.eq_ignore_ascii_case(source)) {
            return false;
        }
        self.sources.push(source.to_string());
        self.modified = true;
        true
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.modified {
            return f.write_str(&self.raw);
        }
        f.write_str(&self.name)?;
        for source in &self.sources {
            write!(f, " {source}")?;
        }
        Ok(())
    }
}

/// A parsed policy header value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CspDirectiveSet {
    directives: Vec<Directive>,
    trailing_semicolon: bool,
}

impl CspDirectiveSet {
    /// Parses a header value. Empty directives are dropped.
    pub fn parse(value: &str) -> Self {
        Self {
            directives: value.split(';').filter_map(Directive::parse).collect(),
            trailing_semicolon: value.trim_end().ends_with(';'),
        }
    }

    /// Directives in header order.
    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Looks up a directive by name.
    pub fn get(&self, name: &str) -> Option<&Directive> {
        let name = name.to_ascii_lowercase();
        self.directives.iter().find(|d| d.name == name)
    }

    /// Appends `origins` to every rewritable directive already present.
    /// Sources already listed are skipped. Returns true if anything changed.
    pub fn patch<S: AsRef<str>>(&mut self, origins: &[S]) -> bool {
        let mut changed = false;
        for directive in &mut self.directives {
            if !REWRITABLE_DIRECTIVES.contains(&directive.name.as_str()) {
                continue;
            }
            for origin in origins {
                changed |= directive.append(origin.as_ref());
            }
        }
        changed
    }
}

impl fmt::Display for CspDirectiveSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, directive) in self.directives.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{directive}")?;
        }
        if self.trailing_semicolon {
            f.write_str(";")?;
        }
        Ok(())
    }
}

/// Patches one header value. Values that need no change come back as is.
pub fn patch_header<S: AsRef<str>>(value: &str, origins: &[S]) -> String {
    let mut policy = CspDirectiveSet::parse(value);
    if policy.patch(origins) {
        policy.to_string()
    } else {
        value.to_string()
    }
}
