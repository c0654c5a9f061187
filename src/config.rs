//! Explicit configuration structs and the bounded-retry helper.
//!
//! Every component receives its configuration through its constructor;
//! there is no ambient global state. [`SequentConfig`] aggregates the
//! per-component structs for the top-level builder.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential-backoff retry policy for transient I/O.
///
/// Used for commit-log appends, publish calls, and published-version
/// updates. A failed attempt doubles the delay up to `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Clamped to at
    /// least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// Logs each failed attempt at warn severity with the `what` label and
/// sleeps the backoff delay between attempts. The final error is returned
/// to the caller, never swallowed.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.base_delay;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(e);
                }
                tracing::warn!(attempt, error = %e, "{what} failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }
}

/// Idle-sweep settings for the per-aggregate command mailboxes.
#[derive(Debug, Clone)]
pub struct MailboxSweepConfig {
    /// How long a mailbox may sit with no activity before the sweep
    /// removes it. Removal requires zero unhandled and zero buffered
    /// messages.
    pub idle_timeout: Duration,
    /// How often the sweep task scans the mailbox map.
    pub sweep_interval: Duration,
}

impl Default for MailboxSweepConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Settings for the event committing pool.
#[derive(Debug, Clone)]
pub struct CommittingConfig {
    /// Number of committing mailboxes. Uncommitted streams are routed by
    /// aggregate-id hash, so one aggregate always lands in the same
    /// mailbox. Clamped to at least 1.
    pub mailbox_count: usize,
    /// Maximum number of streams drained into one `batch_append` call.
    pub batch_size: usize,
}

impl Default for CommittingConfig {
    fn default() -> Self {
        Self {
            mailbox_count: 4,
            batch_size: 64,
        }
    }
}

/// Settings for the ordered publishing pipeline.
#[derive(Debug, Clone)]
pub struct PublishingConfig {
    /// How long an aggregate may hold a non-empty waiting set before the
    /// sweep re-queries the durable published version and resets
    /// expectations.
    pub problem_timeout: Duration,
    /// How often the sweep task scans publish mailboxes.
    pub sweep_interval: Duration,
    /// How long an empty, idle publish mailbox is kept before removal.
    pub idle_timeout: Duration,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            problem_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Aggregated configuration for [`CommandServiceBuilder`](crate::CommandServiceBuilder).
#[derive(Debug, Clone, Default)]
pub struct SequentConfig {
    /// Command mailbox idle-sweep settings.
    pub command_sweep: MailboxSweepConfig,
    /// Committing pool settings.
    pub committing: CommittingConfig,
    /// Publishing pipeline settings.
    pub publishing: PublishingConfig,
    /// Retry policy for transient store and publish I/O.
    pub retry: RetryPolicy,
    /// How long [`CommandService::execute`](crate::CommandService::execute)
    /// waits for a result before reporting a timeout. The underlying work
    /// continues and still completes asynchronously.
    pub execute_timeout: ExecuteTimeout,
}

/// Newtype around the execute wait so `SequentConfig` can derive `Default`.
#[derive(Debug, Clone)]
pub struct ExecuteTimeout(pub Duration);

impl Default for ExecuteTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(30))
    }
}
