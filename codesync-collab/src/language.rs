//! Submission languages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Cpp,
    Python,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Cpp, Language::Python, Language::JavaScript];

    /// Judge0 `language_id` (GCC 9.2, Python 3.8, Node.js 12).
    pub fn judge0_id(self) -> u32 {
        match self {
            Language::Cpp => 54,
            Language::Python => 71,
            Language::JavaScript => 63,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Python => "python",
            Language::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .into_iter()
            .find(|language| language.as_str() == s)
            .ok_or_else(|| UnknownLanguage(s.to_owned()))
    }
}
