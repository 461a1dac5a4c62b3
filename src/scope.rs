//! Operating mode and scope definitions

use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Global safety level gating side-effecting actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Nothing potentially dangerous is allowed, including following redirects
    Safe,
    /// Potentially dangerous actions only against in-scope URLs
    Protect,
    /// No restrictions
    #[default]
    Standard,
    /// Standard plus active scanning of newly found in-scope nodes
    Attack,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Safe => "safe",
            Mode::Protect => "protect",
            Mode::Standard => "standard",
            Mode::Attack => "attack",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "safe" => Ok(Mode::Safe),
            "protect" => Ok(Mode::Protect),
            "standard" => Ok(Mode::Standard),
            "attack" => Ok(Mode::Attack),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of URLs described by include and exclude regular expressions
///
/// A URL is in scope when it matches at least one include pattern and no
/// exclude pattern. Patterns are anchored to the whole URL.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an include pattern
    pub fn include(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.include.push(anchored(pattern)?);
        Ok(self)
    }

    /// Add an exclude pattern
    pub fn exclude(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.exclude.push(anchored(pattern)?);
        Ok(self)
    }

    /// Scope covering everything under a URL prefix
    pub fn with_prefix(prefix: &str) -> Self {
        let mut scope = Scope::new();
        if let Ok(re) = anchored(&format!("{}.*", regex::escape(prefix))) {
            scope.include.push(re);
        }
        scope
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }

    pub fn is_in_scope(&self, url: &str) -> bool {
        self.include.iter().any(|re| re.is_match(url))
            && !self.exclude.iter().any(|re| re.is_match(url))
    }
}
