//! Canonical language set and tag normalization.

use std::fmt;

use serde::{Serialize, Serializer};

/// Canonical languages a fragment can be dispatched to.
///
/// Tags that do not normalize to a supported language are kept verbatim in
/// [`Language::Unsupported`] so failure messages can name what was asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Language {
    Python,
    Shell,
    Javascript,
    Android,
    AndroidRoot,
    Html,
    Unsupported(String),
}

impl Language {
    /// Normalize a fence tag (`py`, `bash`, `node`, ...) to its canonical language.
    pub fn from_tag(tag: &str) -> Self {
        let normalized = tag.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "python" | "py" | "python3" => Self::Python,
            "shell" | "sh" | "bash" | "zsh" => Self::Shell,
            "javascript" | "js" | "node" => Self::Javascript,
            "android" | "android-shell" | "adb" => Self::Android,
            "android-root" | "android-su" | "host" => Self::AndroidRoot,
            "html" | "htm" => Self::Html,
            _ => Self::Unsupported(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Python => "python",
            Self::Shell => "shell",
            Self::Javascript => "javascript",
            Self::Android => "android",
            Self::AndroidRoot => "android-root",
            Self::Html => "html",
            Self::Unsupported(_) => "unsupported",
        }
    }

    /// The tag as written by the caller for unsupported languages, otherwise the canonical name.
    pub fn requested_tag(&self) -> &str {
        match self {
            Self::Unsupported(tag) => tag,
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Language {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
