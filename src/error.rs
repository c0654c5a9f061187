//! Crate-level error types for command routing, handler resolution, and
//! event store access.

/// Error returned when a command cannot be accepted for processing.
///
/// Failures that occur *after* a command has been accepted (domain
/// rejections, store conflicts, publish failures) are reported through
/// [`CommandResult`](crate::CommandResult) instead, never as errors.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command carried an empty aggregate id, so it cannot be routed
    /// to a mailbox.
    #[error("command is missing an aggregate id")]
    MissingAggregateId,
}

/// Error returned when resolving a command handler from the registry.
///
/// The two variants are deliberately distinct: "nothing registered" and
/// "ambiguous registration" call for different operator fixes, so they
/// are reported separately rather than collapsed into one failure.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No handler has been registered for the aggregate type.
    #[error("no command handler registered for aggregate type '{aggregate_type}'")]
    NoHandler {
        /// The aggregate type name the lookup was performed with.
        aggregate_type: String,
    },

    /// More than one handler has been registered for the aggregate type.
    #[error(
        "{count} command handlers registered for aggregate type \
         '{aggregate_type}', expected exactly one"
    )]
    DuplicateHandler {
        /// The aggregate type name the lookup was performed with.
        aggregate_type: String,
        /// Number of registrations found.
        count: usize,
    },
}

/// Error returned by the event store.
///
/// Duplicate commands and version conflicts are *not* errors: they are
/// ordinary [`AppendResult`](crate::store::AppendResult) values. `StoreError`
/// is reserved for genuine faults in the underlying commit log or for
/// detected store inconsistencies.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying commit log failed.
    #[error("commit log error: {0}")]
    Log(#[from] anyhow::Error),

    /// The version chain references a commit the log cannot produce.
    ///
    /// Indicates a store consistency bug; logged at error severity by
    /// callers and surfaced for operator investigation.
    #[error(
        "event stream at version {version} of aggregate '{aggregate_id}' \
         is indexed but missing from the commit log"
    )]
    MissingStream {
        /// The aggregate whose chain holds the dangling reference.
        aggregate_id: String,
        /// The indexed version with no backing commit.
        version: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_handler_display_names_the_type() {
        let err = RegistryError::NoHandler {
            aggregate_type: "account".to_string(),
        };
        assert!(err.to_string().contains("account"));
    }

    #[test]
    fn duplicate_handler_display_includes_count() {
        let err = RegistryError::DuplicateHandler {
            aggregate_type: "account".to_string(),
            count: 2,
        };
        let text = err.to_string();
        assert!(text.contains('2'), "display should include the count: {text}");
        assert!(text.contains("account"));
    }

    #[test]
    fn store_error_from_anyhow() {
        let err = StoreError::from(anyhow::anyhow!("disk on fire"));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn missing_stream_display_names_aggregate_and_version() {
        let err = StoreError::MissingStream {
            aggregate_id: "a-1".to_string(),
            version: 7,
        };
        let text = err.to_string();
        assert!(text.contains("a-1"));
        assert!(text.contains('7'));
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross thread
    // boundaries, which is required for use with `tokio` channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<CommandError>();
            assert_send_sync::<RegistryError>();
            assert_send_sync::<StoreError>();
        }
    };
}
