//! Tessera - event-sourced aggregate persistence
//!
//! Aggregates are rebuilt by folding their event stream and saved by
//! appending new events under an optimistic version check. Read models
//! follow streams and categories through catch-up or consumer-group
//! subscriptions.

pub mod aggregate;
pub mod client;
pub mod codec;
pub mod config;
pub mod record;
pub mod repository;
pub mod storage;
pub mod subscription;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use aggregate::{fold, Aggregate, AggregateRoot, Deletable};
pub use client::{ClientError, ExpectedRevision, InMemoryClient, NackAction, StoreClient};
#[cfg(feature = "eventstoredb")]
pub use client::EventStoreDbClient;
pub use codec::{DecodeError, Decoded, DomainEvent, EncodeError};
pub use config::Config;
pub use record::{AckToken, AckableEventRecord, EventDescriptor, EventRecord, RawEventRecord};
pub use repository::{DeleteMode, Repository, RepositoryError};
pub use storage::{ConcurrencyConflict, EventStore, LogEventStore, StorageError};
pub use subscription::{
    CatchUpSubscription, Observed, PersistentSubscription, Selector, SubscriptionError,
};
