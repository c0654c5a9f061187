//! Command envelope, context, and completion results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail and correlation information without polluting the
/// `Command` or `DomainEvent` types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
}

impl CommandContext {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// A type-erased command envelope.
///
/// The `payload` field is a `serde_json::Value` because the routing and
/// mailbox layers do not know the concrete command type at compile time;
/// the registered handler proxy deserializes it into the aggregate's
/// `Command` type at execution time.
///
/// The `command_id` is the idempotence key: the store commits each
/// `(aggregate_id, command_id)` pair at most once. A fresh UUID v4 is
/// assigned by [`Command::new`]; callers retrying a delivery must reuse
/// the original id (via [`with_command_id`](Command::with_command_id)) to
/// get the idempotent-replay behaviour instead of a second execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Unique id of this logical operation.
    pub command_id: String,
    /// Target aggregate instance identifier.
    pub aggregate_id: String,
    /// Target aggregate type name (must match `Aggregate::AGGREGATE_TYPE`).
    pub aggregate_type: String,
    /// JSON-serialized command payload.
    pub payload: Value,
    /// Cross-cutting metadata forwarded to the command handler.
    pub context: CommandContext,
}

impl Command {
    /// Build an envelope from a typed command, assigning a fresh command id.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the typed command cannot be
    /// serialized.
    pub fn new<A: Aggregate>(
        aggregate_id: impl Into<String>,
        cmd: &A::Command,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            command_id: Uuid::new_v4().to_string(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            payload: serde_json::to_value(cmd)?,
            context: CommandContext::default(),
        })
    }

    /// Replace the auto-assigned command id, e.g. when retrying a delivery
    /// of the same logical operation.
    pub fn with_command_id(mut self, id: impl Into<String>) -> Self {
        self.command_id = id.into();
        self
    }

    /// Attach a command context.
    pub fn with_context(mut self, context: CommandContext) -> Self {
        self.context = context;
        self
    }
}

/// Terminal status of a processed command.
///
/// Every classifiable failure is converted into a status rather than an
/// error crossing component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// The command's events were committed and handed to the publishing
    /// pipeline (or were found already committed by an earlier delivery).
    Success,
    /// The handler accepted the command but produced no events; nothing
    /// was persisted.
    NothingChanged,
    /// The command failed: handler resolution, domain rejection, payload
    /// decode, exhausted store/publish retries, or exhausted conflict
    /// recovery.
    Failed,
    /// The caller's wait elapsed before the command finished. The
    /// underlying work continues and will still complete asynchronously.
    Timeout,
}

/// The result delivered back to the original caller of a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Terminal status.
    pub status: CommandStatus,
    /// Id of the command this result belongs to.
    pub command_id: String,
    /// Aggregate the command targeted.
    pub aggregate_id: String,
    /// Human-readable detail, populated for failures.
    pub message: Option<String>,
}

impl CommandResult {
    /// A successful completion.
    pub fn success(command_id: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Success,
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            message: None,
        }
    }

    /// The handler ran but produced no events.
    pub fn nothing_changed(
        command_id: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        Self {
            status: CommandStatus::NothingChanged,
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            message: None,
        }
    }

    /// A failed completion with detail.
    pub fn failed(
        command_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: CommandStatus::Failed,
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            message: Some(message.into()),
        }
    }

    /// The synchronous wait timed out; the work continues.
    pub fn timeout(command_id: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Timeout,
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            message: Some("timed out waiting for command completion".to_string()),
        }
    }
}
