//! Registry configuration types.

use serde::Deserialize;

/// SQLite registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Database file path, or `:memory:` for a private in-memory database.
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: "eventrelay.db".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".to_string(),
        }
    }

    /// The sqlx connection URL for this registry.
    pub fn url(&self) -> String {
        if self.path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}", self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_url() {
        assert_eq!(RegistryConfig::default().url(), "sqlite:eventrelay.db");
        assert_eq!(RegistryConfig::in_memory().url(), "sqlite::memory:");
    }
}
