use crate::error::PassthroughError;
use std::collections::HashSet;

/// Configuration for a simulated stripe.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// One simulated server per name. Default: ["server-0"].
    pub server_names: Vec<String>,
    /// Seed for the election RNG. `None` seeds from entropy. Default: None.
    pub election_seed: Option<u64>,
    /// Whether the first active loads persisted storage when the stripe
    /// starts. Default: false.
    pub load_storage_on_start: bool,
    /// Whether servers keep their storage across restarts. When false every
    /// server persists nothing and always restarts empty. Default: true.
    pub durable_storage: bool,
}

impl StripeConfig {
    /// A config with one server per name and everything else defaulted.
    pub fn with_servers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            server_names: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Validate configuration values, returning an error for invalid settings.
    pub fn validate(&self) -> Result<(), PassthroughError> {
        if self.server_names.is_empty() {
            return Err(PassthroughError::InvalidConfig {
                reason: "server_names must name at least one server".to_string(),
            });
        }
        let mut seen = HashSet::with_capacity(self.server_names.len());
        for name in &self.server_names {
            if name.is_empty() {
                return Err(PassthroughError::InvalidConfig {
                    reason: "server_names must not contain an empty name".to_string(),
                });
            }
            if !seen.insert(name.as_str()) {
                return Err(PassthroughError::InvalidConfig {
                    reason: format!("server_names contains duplicate name {name}"),
                });
            }
        }
        Ok(())
    }
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            server_names: vec!["server-0".to_string()],
            election_seed: None,
            load_storage_on_start: false,
            durable_storage: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = StripeConfig::default();
        assert_eq!(config.server_names, vec!["server-0".to_string()]);
        assert_eq!(config.election_seed, None);
        assert!(!config.load_storage_on_start);
        assert!(config.durable_storage);
    }

    #[test]
    fn custom_config() {
        let config = StripeConfig {
            election_seed: Some(7),
            ..StripeConfig::with_servers(["a", "b", "c"])
        };
        assert_eq!(config.server_names.len(), 3);
        assert_eq!(config.election_seed, Some(7));
        // Other fields keep defaults
        assert!(!config.load_storage_on_start);
    }

    #[test]
    fn default_config_is_valid() {
        StripeConfig::default().validate().unwrap();
    }

    #[test]
    fn validate_no_servers() {
        let config = StripeConfig {
            server_names: Vec::new(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("server_names"), "got: {msg}");
    }

    #[test]
    fn validate_empty_name() {
        let config = StripeConfig::with_servers(["a", ""]);
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("empty name"), "got: {msg}");
    }

    #[test]
    fn validate_duplicate_name() {
        let config = StripeConfig::with_servers(["a", "b", "a"]);
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate name a"), "got: {msg}");
    }
}
