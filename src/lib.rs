//! Event-sourced command processing with ordered mailboxes, optimistic
//! concurrency, and in-order publishing.
//!
//! `sequent` is the runtime core of an event-sourcing system built on
//! CQRS: commands are routed to per-aggregate mailboxes and executed
//! one at a time against cached state, the events they produce are
//! committed in batches to an append-only store that enforces a dense
//! per-aggregate version chain, and committed streams are delivered to
//! subscribers strictly in version order.
//!
//! # Architecture
//!
//! A command moves through three stages, each backed by mailboxes keyed
//! on the aggregate id:
//!
//! 1. **Processing** ([`processor`]): every aggregate gets a command
//!    mailbox that executes one command at a time and will not consume
//!    the next until the previous result is final. Execution reads the
//!    cached snapshot, runs the aggregate's handler, and emits an
//!    uncommitted event stream.
//! 2. **Committing** ([`committing`]): streams are routed by aggregate
//!    hash into a small pool of mailboxes that batch appends to the
//!    [`store::EventStore`]. Each append is classified as a success, a
//!    duplicate command (idempotent replay), or a version conflict; on
//!    conflict the command mailbox is paused, the aggregate reloaded
//!    from the store, and the colliding command replayed against fresh
//!    state.
//! 3. **Publishing** ([`publishing`]): committed streams are buffered
//!    per aggregate and dispatched to subscribers gaplessly in version
//!    order, tracked by a durable published-version high-water mark.
//!
//! # Quick start
//!
//! Implement [`Aggregate`] for your state type, then build a service:
//!
//! ```ignore
//! let service = CommandServiceBuilder::new()
//!     .aggregate::<Account>()
//!     .subscriber(projection)
//!     .build()
//!     .await?;
//!
//! let result = service
//!     .execute(Command::new::<Account>("acc-1", &OpenAccount)?)
//!     .await?;
//! ```
//!
//! Everything runs in memory by default; plug in durable
//! [`store::CommitLog`] and [`publishing::PublishedVersionStore`]
//! implementations for production use.

pub mod aggregate;
pub mod cache;
pub mod command;
pub mod committing;
pub mod config;
pub mod error;
pub mod event;
pub mod mailbox;
pub mod processor;
pub mod publishing;
pub mod registry;
pub mod service;
pub mod store;

pub use aggregate::Aggregate;
pub use cache::{AggregateCache, AggregateSnapshot};
pub use command::{Command, CommandContext, CommandResult, CommandStatus};
pub use config::{
    CommittingConfig, ExecuteTimeout, MailboxSweepConfig, PublishingConfig, RetryPolicy,
    SequentConfig,
};
pub use error::{CommandError, RegistryError, StoreError};
pub use event::{EventRecord, EventStream};
pub use mailbox::{Mailbox, MailboxHandler, MailboxMessage, MailboxOptions};
pub use publishing::{
    EventPublishingPipeline, EventSubscriber, InMemoryPublishedVersionStore, MessagePublisher,
    PublishedVersionStore,
};
pub use registry::{AggregateRuntime, Decision, HandlerRegistry, TypedAggregate};
pub use service::{CommandService, CommandServiceBuilder};
pub use store::{
    AppendResult, BatchAppendResult, CommitLog, CommitRecord, EventStore, InMemoryCommitLog,
};
