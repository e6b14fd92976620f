use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two document collections served by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// A project's source tree
    Codebase,
    /// A curated corpus of notes and reference documents
    Knowledge,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Codebase, Domain::Knowledge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Codebase => "codebase",
            Domain::Knowledge => "knowledge",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "codebase" | "code" => Ok(Domain::Codebase),
            "knowledge" | "docs" => Ok(Domain::Knowledge),
            other => Err(format!(
                "unknown domain '{}': expected 'codebase' or 'knowledge'",
                other
            )),
        }
    }
}
