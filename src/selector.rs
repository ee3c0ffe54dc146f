use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum SelectorError {
    MissingEquals(String),
    EmptyKey(String),
}

impl std::error::Error for SelectorError {}
impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorError::MissingEquals(fragment) => {
                write!(f, "selector fragment needs k=v: {}", fragment)
            }
            SelectorError::EmptyKey(fragment) => {
                write!(f, "selector fragment has an empty key: {}", fragment)
            }
        }
    }
}

/// Equality-based label selector, a conjunction of `key=value` pairs.
///
/// Parsed once at startup; a malformed selector is a configuration error and
/// never surfaces per-event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    required: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Parses a `"k=v,k2=v2"` conjunction. Whitespace around keys, values and
    /// fragments is ignored; empty fragments are skipped.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let mut required = BTreeMap::new();
        for fragment in input.split(',') {
            let fragment = fragment.trim();
            if fragment.is_empty() {
                continue;
            }
            let (key, value) = fragment
                .split_once('=')
                .ok_or_else(|| SelectorError::MissingEquals(fragment.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(SelectorError::EmptyKey(fragment.to_string()));
            }
            required.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self { required })
    }

    /// True when every required pair is present with an equal value. A missing
    /// label and a mismatched value both reject.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// Selector string for server-side filtering on the watch.
    pub fn to_query(&self) -> String {
        self.required
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_query())
    }
}
