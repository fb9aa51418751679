//! Core of the subscription migration service.
//!
//! Moves message subscriptions for a table of identities from one messageset
//! to another, resumably and cancellably, and reverts single identities on
//! optout.
//!
//! # Components
//!
//! - [`SequenceMapper`]: pure translation of sequence positions between
//!   messagesets, in both directions.
//! - [`IdentityReader`]: ordered, chunked, resumable stream of identity keys
//!   from an [`IdentitySource`] (PostgreSQL server-side cursor in production).
//! - [`SubscriptionGateway`] and [`ContactDirectory`]: contracts for the
//!   remote services, with a per-run [`MessagesetCache`].
//! - [`RunStore`]: migration runs, their audit log and identity records, with
//!   compare-and-swap status transitions.
//! - [`MigrationTask`]: the orchestrator that executes one run.
//! - [`Dispatcher`]: spawns orchestrators and applies retry and cancel.
//! - [`OptoutService`]: reverts the latest migration of one identity.

pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod model;
pub mod optout;
pub mod sequence;
pub mod source;
pub mod store;
pub mod task;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use dispatch::{Dispatcher, DEFAULT_MAX_CONCURRENT_RUNS};
pub use error::{Error, ErrorContext, Result};
pub use gateway::{
    Contact, ContactDirectory, GatewayError, Messageset, MessagesetCache, NewSubscription,
    Subscription, SubscriptionFilter, SubscriptionGateway,
};
pub use model::{IdentityRecord, LogEntry, LogLevel, MigrationRun, NewRun, RunId, RunStatus};
pub use optout::{OptoutError, OptoutService, OptoutSummary, ScheduleSource, DEFAULT_IDENTITY_FIELD};
pub use sequence::{MappingError, Sequence, SequenceMapper, SequenceRule, Transform};
pub use source::{IdentityCursor, IdentityReader, IdentitySource, PgIdentitySource, DEFAULT_CHUNK_SIZE};
pub use store::RunStore;
pub use task::{CancellationCheck, MigrationTask, RunOutcome, StatusCheck, TaskConfig};
