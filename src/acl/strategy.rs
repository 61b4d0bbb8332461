//! Strategy-based admin tag predicate.
//!
//! The strategy details document maps each strategy to the tags held by
//! each user:
//!
//! ```json
//! { "s1": { "users": { "alice": ["admin"], "bob": ["viewer"] } } }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use super::{AclPredicate, PredicateError};
use crate::event::Event;

/// Registry reference of the admin tag predicate.
pub const ADMIN_TAG_CHECK: &str = "admin_tag_check";
/// Strategy details file used when none is configured.
pub const DEFAULT_STRATEGY_FILE: &str = "all_strategy_details.json";
/// Payload field naming the strategy an event concerns.
pub const STRATEGY_FIELD: &str = "strategy";
/// Tag granting access.
pub const ADMIN_TAG: &str = "admin";

#[derive(Debug, Default, Deserialize)]
struct StrategyDetails {
    #[serde(default)]
    users: HashMap<String, Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
enum StrategyError {
    #[error("Failed to read strategy details from {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed strategy details in {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Strategy not found: {0}")]
    UnknownStrategy(String),

    #[error("Field 'strategy' must be a string")]
    InvalidStrategyField,
}

/// Grants access iff the subscriber holds the `admin` tag for the strategy
/// named in the event payload.
///
/// An event without a `strategy` field is rejected. A strategy that is not
/// in the document is a fault. The document is re-read on every check so
/// edits apply without a restart.
#[derive(Debug, Clone)]
pub struct AdminTagCheck {
    path: PathBuf,
}

impl AdminTagCheck {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<HashMap<String, StrategyDetails>, StrategyError> {
        let display = self.path.display().to_string();
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| StrategyError::Read {
                path: display.clone(),
                source,
            })?;
        serde_json::from_slice(&raw).map_err(|source| StrategyError::Parse {
            path: display,
            source,
        })
    }
}

#[async_trait]
impl AclPredicate for AdminTagCheck {
    async fn check(&self, subscriber: &str, event: &Event) -> Result<bool, PredicateError> {
        let strategy = match event.payload.get(STRATEGY_FIELD) {
            None => return Ok(false),
            Some(value) => value.as_str().ok_or(StrategyError::InvalidStrategyField)?,
        };

        let details = self.load().await?;
        let entry = details
            .get(strategy)
            .ok_or_else(|| StrategyError::UnknownStrategy(strategy.to_string()))?;

        Ok(entry
            .users
            .get(subscriber)
            .is_some_and(|tags| tags.iter().any(|t| t == ADMIN_TAG)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn strategy_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "s1": {{"users": {{"alice": ["admin", "ops"], "bob": ["viewer"]}}}},
                "s2": {{"users": {{}}}}
            }}"#
        )
        .unwrap();
        file
    }

    fn event(body: &str) -> Event {
        Event::parse(body.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_admin_tag_grants() {
        let file = strategy_file();
        let check = AdminTagCheck::new(file.path());
        let e = event(r#"{"event_type":"t2","strategy":"s1"}"#);

        assert!(check.check("alice", &e).await.unwrap());
        assert!(!check.check("bob", &e).await.unwrap());
        assert!(!check.check("carol", &e).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_strategy_field_rejects() {
        let check = AdminTagCheck::new("/nonexistent/strategies.json");
        let e = event(r#"{"event_type":"t2"}"#);
        assert!(!check.check("alice", &e).await.unwrap());
    }

    #[tokio::test]
    async fn test_strategy_without_users_rejects() {
        let file = strategy_file();
        let check = AdminTagCheck::new(file.path());
        let e = event(r#"{"event_type":"t2","strategy":"s2"}"#);
        assert!(!check.check("alice", &e).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_fault() {
        let file = strategy_file();
        let check = AdminTagCheck::new(file.path());
        let e = event(r#"{"event_type":"t2","strategy":"s9"}"#);
        let err = check.check("alice", &e).await.unwrap_err();
        assert!(err.to_string().contains("s9"));
    }

    #[tokio::test]
    async fn test_missing_file_is_fault() {
        let check = AdminTagCheck::new("/nonexistent/strategies.json");
        let e = event(r#"{"event_type":"t2","strategy":"s1"}"#);
        assert!(check.check("alice", &e).await.is_err());
    }
}
