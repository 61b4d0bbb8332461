//! Access control for event fan-out.
//!
//! This module contains:
//! - `AclPredicate` trait: a named boolean check over `(subscriber, event)`
//! - `PredicateRegistry`: the explicit table of predicates, populated at startup
//! - `AclEngine`: evaluates an ordered chain with AND semantics
//!
//! A chain authorizes a subscriber iff every predicate returns true. An
//! empty chain authorizes everyone. Evaluation stops at the first false.
//! Any fault (unknown reference, predicate error, timeout) is returned as an
//! `AclError` so the caller can deny that one subscriber.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::AclConfig;
use crate::event::Event;
use crate::registry::AclFunction;

pub mod strategy;

pub use strategy::{AdminTagCheck, ADMIN_TAG_CHECK, DEFAULT_STRATEGY_FILE};

/// Error type returned by predicate implementations.
pub type PredicateError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for ACL evaluation.
pub type Result<T> = std::result::Result<T, AclError>;

/// Faults raised while evaluating an ACL chain.
#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("Unknown ACL predicate: {0}")]
    UnknownPredicate(String),

    #[error("ACL predicate '{name}' failed: {message}")]
    PredicateFailed { name: String, message: String },

    #[error("ACL predicate '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// A named access-control check.
///
/// Implementations must be side-effect free. The engine never inspects a
/// predicate beyond its boolean answer.
#[async_trait]
pub trait AclPredicate: Send + Sync {
    async fn check(
        &self,
        subscriber: &str,
        event: &Event,
    ) -> std::result::Result<bool, PredicateError>;
}

/// Adapter that turns a plain function into an `AclPredicate`.
pub struct FnPredicate<F>(pub F);

#[async_trait]
impl<F> AclPredicate for FnPredicate<F>
where
    F: Fn(&str, &Event) -> std::result::Result<bool, PredicateError> + Send + Sync,
{
    async fn check(
        &self,
        subscriber: &str,
        event: &Event,
    ) -> std::result::Result<bool, PredicateError> {
        (self.0)(subscriber, event)
    }
}

/// Named predicates available to ACL chains.
#[derive(Default, Clone)]
pub struct PredicateRegistry {
    predicates: BTreeMap<String, Arc<dyn AclPredicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in predicate.
    pub fn with_builtins(config: &AclConfig) -> Self {
        let path = config
            .strategy_file
            .clone()
            .unwrap_or_else(|| DEFAULT_STRATEGY_FILE.to_string());

        let mut registry = Self::new();
        registry.register(ADMIN_TAG_CHECK, AdminTagCheck::new(path));
        registry
    }

    /// Register a predicate under a reference, replacing any previous one.
    pub fn register(&mut self, reference: impl Into<String>, predicate: impl AclPredicate + 'static) {
        self.predicates.insert(reference.into(), Arc::new(predicate));
    }

    /// Register a plain function as a predicate.
    pub fn register_fn<F>(&mut self, reference: impl Into<String>, f: F)
    where
        F: Fn(&str, &Event) -> std::result::Result<bool, PredicateError> + Send + Sync + 'static,
    {
        self.register(reference, FnPredicate(f));
    }

    pub fn get(&self, reference: &str) -> Option<Arc<dyn AclPredicate>> {
        self.predicates.get(reference).cloned()
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.predicates.contains_key(reference)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.predicates.keys().map(String::as_str)
    }

    /// Check that every function of a chain resolves.
    ///
    /// Returns the names of the functions whose reference is unknown.
    pub fn validate<'a>(&self, chain: impl IntoIterator<Item = &'a AclFunction>) -> Vec<String> {
        chain
            .into_iter()
            .filter(|f| !self.contains(&f.reference))
            .map(|f| f.name.clone())
            .collect()
    }
}

/// Evaluates ACL chains against a predicate registry.
#[derive(Clone)]
pub struct AclEngine {
    predicates: Arc<PredicateRegistry>,
    timeout: Duration,
}

impl AclEngine {
    pub fn new(predicates: PredicateRegistry, timeout: Duration) -> Self {
        Self {
            predicates: Arc::new(predicates),
            timeout,
        }
    }

    pub fn predicates(&self) -> &PredicateRegistry {
        &self.predicates
    }

    /// Evaluate a chain for one subscriber.
    ///
    /// `Ok(true)` when every predicate accepts, `Ok(false)` at the first one
    /// that rejects. Later predicates are not invoked after a rejection.
    pub async fn evaluate(
        &self,
        chain: &[AclFunction],
        subscriber: &str,
        event: &Event,
    ) -> Result<bool> {
        for function in chain {
            let predicate = self
                .predicates
                .get(&function.reference)
                .ok_or_else(|| AclError::UnknownPredicate(function.reference.clone()))?;

            let outcome = tokio::time::timeout(self.timeout, predicate.check(subscriber, event))
                .await
                .map_err(|_| AclError::Timeout {
                    name: function.name.clone(),
                    timeout: self.timeout,
                })?;

            match outcome {
                Ok(true) => continue,
                Ok(false) => {
                    debug!(
                        subscriber = %subscriber,
                        predicate = %function.name,
                        "ACL predicate rejected"
                    );
                    return Ok(false);
                }
                Err(e) => {
                    warn!(
                        subscriber = %subscriber,
                        predicate = %function.name,
                        error = %e,
                        "ACL predicate failed"
                    );
                    return Err(AclError::PredicateFailed {
                        name: function.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(true)
    }
}
