use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Matcher errors
// ---------------------------------------------------------------------------

/// A malformed matcher expression. Caught per matcher; the remaining
/// matchers of the same lookup are still evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bad matcher '{matcher}': {reason}")]
pub struct MatcherError {
    pub matcher: String,
    pub reason: String,
}

impl MatcherError {
    pub fn new(matcher: &str, reason: impl Into<String>) -> Self {
        MatcherError {
            matcher: matcher.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Action errors
// ---------------------------------------------------------------------------

/// The executor refused or could not perform an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("target node {0} no longer exists")]
    StaleNode(u64),
    #[error("action rejected: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("scenario '{scenario}': invalid pattern '{pattern}': {source}")]
    InvalidRegex {
        scenario: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate scenario id '{0}'")]
    DuplicateScenario(String),
    #[error("unknown selector {category}.{name}")]
    UnknownSelector { category: String, name: String },
}

impl ConfigError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_error_display() {
        let e = MatcherError::new("a..b", "empty tag");
        assert_eq!(e.to_string(), "bad matcher 'a..b': empty tag");
    }

    #[test]
    fn config_error_from_yaml() {
        let err = serde_yaml::from_str::<Vec<u32>>("{not: [a list").unwrap_err();
        let e: ConfigError = err.into();
        assert!(e.to_string().starts_with("invalid YAML"));
    }

    #[test]
    fn unknown_selector_display() {
        let e = ConfigError::UnknownSelector {
            category: "widgets".into(),
            name: "x".into(),
        };
        assert_eq!(e.to_string(), "unknown selector widgets.x");
    }
}
