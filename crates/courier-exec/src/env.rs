//! `KEY=VALUE` environment bindings applied before a command runs

use tracing::debug;

/// A single environment variable assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvBinding {
    pub key: String,
    pub value: String,
}

impl EnvBinding {
    /// Parse a `KEY=VALUE` entry.
    ///
    /// Returns `None` unless the entry holds exactly one `=` with non-empty
    /// text on both sides.
    #[must_use]
    pub fn parse(entry: &str) -> Option<Self> {
        let (key, value) = entry.split_once('=')?;
        if key.is_empty() || value.is_empty() || value.contains('=') {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// Parse every well-formed entry, skipping the rest
pub fn parse_bindings<I, S>(entries: I) -> Vec<EnvBinding>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.as_ref();
            let binding = EnvBinding::parse(entry);
            if binding.is_none() {
                debug!(entry = %entry, "skipping malformed env entry");
            }
            binding
        })
        .collect()
}
