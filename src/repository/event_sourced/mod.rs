//! Event-sourcing repository.
//!
//! Rebuilds aggregates from their stream on read and appends pending events
//! under an optimistic version check on write. Removal follows the
//! configured [`DeleteMode`].

use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{DeleteMode, RepositoryError, Result};
use crate::aggregate::{fold, Aggregate, AggregateRoot, Deletable};
use crate::codec::{decode_record, Decoded};
use crate::config::{RepositoryConfig, DEFAULT_SOFT_DELETE_METHOD};
use crate::record::{EventDescriptor, EventRecord};
use crate::storage::{EventStore, StorageError};

/// Soft-delete operation: the event that marks the aggregate as deleted.
pub type SoftDeleter<A> = fn(&A) -> <A as Aggregate>::Event;

/// Repository for one aggregate type, keyed by `K`.
///
/// Streams are named `{category}-{id}`; the category defaults to
/// [`Aggregate::KIND`].
pub struct Repository<A: Aggregate, K> {
    store: Arc<dyn EventStore>,
    category: String,
    delete_mode: DeleteMode,
    soft_delete_method: String,
    /// Deletion method resolved against `soft_delete_method`.
    deleter: Option<SoftDeleter<A>>,
    _key: PhantomData<fn() -> K>,
}

impl<A, K> Repository<A, K>
where
    A: Aggregate,
    K: Display + Clone + Send + Sync,
{
    /// A repository with deletion disabled.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            category: A::KIND.to_string(),
            delete_mode: DeleteMode::Disabled,
            soft_delete_method: DEFAULT_SOFT_DELETE_METHOD.to_string(),
            deleter: None,
            _key: PhantomData,
        }
    }

    pub fn for_config(store: Arc<dyn EventStore>, config: &RepositoryConfig) -> Self {
        Self {
            store,
            category: config
                .category
                .clone()
                .unwrap_or_else(|| A::KIND.to_string()),
            delete_mode: config.delete_mode,
            soft_delete_method: config.soft_delete_method.clone(),
            deleter: None,
            _key: PhantomData,
        }
    }

    pub fn with_delete_mode(mut self, mode: DeleteMode) -> Self {
        self.delete_mode = mode;
        self
    }

    /// Register a named deletion method.
    ///
    /// Only the method whose name matches the configured soft-delete method
    /// is kept.
    pub fn with_deletion_method(mut self, name: &str, method: SoftDeleter<A>) -> Self {
        if name == self.soft_delete_method {
            self.deleter = Some(method);
        } else {
            debug!(
                aggregate_type = A::KIND,
                method = %name,
                configured = %self.soft_delete_method,
                "Ignoring deletion method that does not match configuration"
            );
        }
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn delete_mode(&self) -> DeleteMode {
        self.delete_mode
    }

    /// Stream name for an aggregate id.
    pub fn stream_id(&self, id: &K) -> String {
        format!("{}-{}", self.category, id)
    }

    /// Load an aggregate by folding its stream.
    ///
    /// An empty (or deleted) stream is [`RepositoryError::NotFound`].
    #[tracing::instrument(name = "repository.get", skip_all, fields(stream = %self.stream_id(id)))]
    pub async fn get(&self, id: &K) -> Result<AggregateRoot<A, K>> {
        let stream = self.stream_id(id);

        let records = match self.store.read(&stream, 0).await {
            Ok(records) => records,
            Err(StorageError::StreamDeleted(_)) => return Err(RepositoryError::NotFound { stream }),
            Err(e) => return Err(e.into()),
        };

        // The store's last position is the version, even if some records
        // fail to decode below.
        let Some(version) = records.last().map(|r| r.stream_position + 1) else {
            return Err(RepositoryError::NotFound { stream });
        };

        let mut events: Vec<EventRecord<A::Event>> = Vec::with_capacity(records.len());
        for record in records {
            let position = record.stream_position;
            match decode_record::<A::Event>(record) {
                Decoded::Event(event) => events.push(event),
                Decoded::Skip => debug!(position, "Event ignored by decoder"),
                Decoded::Error(e) => {
                    warn!(position, error = %e, "Failed to decode event, skipping")
                }
            }
        }

        let state: A = fold(&events);
        debug!(version, "Aggregate loaded");
        Ok(AggregateRoot::rehydrated(id.clone(), version, state))
    }

    /// Whether the aggregate's stream has any events. Does not fold.
    pub async fn exists(&self, id: &K) -> Result<bool> {
        match self.store.stream_version(&self.stream_id(id)).await {
            Ok(version) => Ok(version > 0),
            Err(StorageError::StreamDeleted(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a new aggregate's pending events.
    pub async fn add(&self, root: &mut AggregateRoot<A, K>) -> Result<()> {
        self.save(root).await
    }

    /// Persist pending events of a loaded aggregate.
    pub async fn update(&self, root: &mut AggregateRoot<A, K>) -> Result<()> {
        self.save(root).await
    }

    /// Remove an aggregate according to the delete mode.
    #[tracing::instrument(name = "repository.remove", skip_all, fields(stream = %self.stream_id(id), mode = ?self.delete_mode))]
    pub async fn remove(&self, id: &K) -> Result<()> {
        match self.delete_mode {
            DeleteMode::Disabled => Err(RepositoryError::DeletionDisabled {
                aggregate_type: A::KIND.to_string(),
            }),
            DeleteMode::Soft => {
                let mut root = self.get(id).await?;
                let Some(deleter) = self.deleter else {
                    return Err(RepositoryError::DeletionMisconfigured {
                        aggregate_type: A::KIND.to_string(),
                        method: self.soft_delete_method.clone(),
                    });
                };
                root.raise(deleter(root.state()));
                self.update(&mut root).await?;
                info!("Aggregate soft-deleted");
                Ok(())
            }
            DeleteMode::Hard => {
                let stream = self.stream_id(id);
                match self.store.delete(&stream).await {
                    Ok(()) => {
                        info!("Aggregate hard-deleted");
                        Ok(())
                    }
                    Err(StorageError::StreamDeleted(_)) => Err(RepositoryError::NotFound { stream }),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    #[tracing::instrument(name = "repository.save", skip_all, fields(stream = %self.stream_id(root.id()), expected = root.version()))]
    async fn save(&self, root: &mut AggregateRoot<A, K>) -> Result<()> {
        if !root.has_pending_events() {
            return Ok(());
        }

        let descriptors = root
            .pending_events()
            .iter()
            .map(|event| EventDescriptor::from_event(event, &self.category))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let count = descriptors.len();

        let version = self
            .store
            .append(&self.stream_id(root.id()), descriptors, root.version())
            .await?;

        root.commit(version);
        debug!(count, version, "Pending events persisted");
        Ok(())
    }
}

impl<A, K> Repository<A, K>
where
    A: Deletable,
    K: Display + Clone + Send + Sync,
{
    /// Register [`Deletable::mark_as_deleted`] under its default name.
    pub fn with_soft_delete(self) -> Self {
        self.with_deletion_method(DEFAULT_SOFT_DELETE_METHOD, A::mark_as_deleted)
    }
}
