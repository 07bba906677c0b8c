//! Tunable limits for command validation

use serde::{Deserialize, Serialize};

/// Ledger configuration
///
/// Hosts typically deserialize this from their own configuration source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Maximum length of a ledger transaction description
    pub max_description_length: usize,
    /// Maximum number of metadata pairs attached to a ledger transaction
    pub max_metadata_entries: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_description_length: 500,
            max_metadata_entries: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{ "max_description_length": 120 }"#).unwrap();

        assert_eq!(config.max_description_length, 120);
        assert_eq!(config.max_metadata_entries, 50);
    }
}
