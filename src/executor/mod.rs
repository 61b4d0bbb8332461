//! Subscriber-side command resolution and execution.
//!
//! This module contains:
//! - `CommandCache`: `(username, event_type)` → template, warmed from the registry
//! - `render_command`: `<key>` placeholder substitution from the event payload
//! - `spawn_command`: detached `<shell> -c` execution in its own process group
//! - `SubscriptionService`: write-through subscription management

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

mod cache;
mod process;
mod subscriptions;
mod template;

pub use cache::{CacheWriter, CommandCache};
pub use process::{spawn_command, DEFAULT_SHELL};
pub use subscriptions::{SubscriptionError, SubscriptionService};
pub use template::{render_command, RenderedCommand};

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur while executing a subscription's command.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Command not found for event type: {event_type} and username: {username}")]
    TemplateNotFound {
        username: String,
        event_type: String,
    },

    #[error("Failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A started command.
#[derive(Debug, Clone)]
pub struct Execution {
    pub pid: Option<u32>,
    /// Present only when the caller waited for completion.
    pub output: Option<ExecutionOutput>,
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// `None` when the command was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Resolves a subscription's template and runs it.
pub struct CommandExecutor {
    cache: Arc<CommandCache>,
    wait: bool,
    shell: String,
}

impl CommandExecutor {
    /// With `wait`, `handle` returns after the command exits.
    pub fn new(cache: Arc<CommandCache>, wait: bool) -> Self {
        Self {
            cache,
            wait,
            shell: DEFAULT_SHELL.to_string(),
        }
    }

    /// Interpret commands with `shell` instead of `sh`.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn cache(&self) -> &Arc<CommandCache> {
        &self.cache
    }

    /// Render and spawn the command subscribed for `(username, event_type)`.
    #[instrument(name = "executor.handle", skip(self, payload))]
    pub async fn handle(
        &self,
        event_type: &str,
        username: &str,
        payload: &Map<String, Value>,
    ) -> Result<Execution> {
        let Some(template) = self.cache.get(username, event_type).await else {
            info!("No command subscribed");
            return Err(ExecutorError::TemplateNotFound {
                username: username.to_string(),
                event_type: event_type.to_string(),
            });
        };

        let rendered = render_command(&template, payload);
        if !rendered.unresolved.is_empty() {
            warn!(
                unresolved = ?rendered.unresolved,
                "Command has placeholders without payload fields"
            );
        }

        spawn_command(&self.shell, &rendered.command, self.wait).await
    }
}
