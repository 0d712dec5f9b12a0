//! Aggregates and the replay fold.
//!
//! Aggregate state is never stored. It is rebuilt by folding a stream's
//! events, in stream order, into a fresh zero-value instance.

use crate::codec::DomainEvent;
use crate::record::EventRecord;

/// Event-sourced aggregate state.
///
/// `Default` is the zero-value state that replay starts from.
pub trait Aggregate: Default + Send + Sync + 'static {
    /// Aggregate type name; the stream id is `{KIND}-{id}`.
    const KIND: &'static str;

    type Event: DomainEvent;

    /// Evolve state from a single event. Must be deterministic and free of I/O.
    fn apply(&mut self, event: &Self::Event);
}

/// Capability for aggregates that support soft deletion.
///
/// The returned event expresses the deletion; it is persisted like any other
/// state change, so history is kept for audit.
pub trait Deletable: Aggregate {
    fn mark_as_deleted(&self) -> Self::Event;
}

/// Rebuild aggregate state from an ordered sequence of records.
///
/// Records are applied in `stream_position` order regardless of input order.
/// Empty input yields the zero-value state.
pub fn fold<'a, A, I>(records: I) -> A
where
    A: Aggregate,
    I: IntoIterator<Item = &'a EventRecord<A::Event>>,
{
    let mut ordered: Vec<&EventRecord<A::Event>> = records.into_iter().collect();
    ordered.sort_by_key(|r| r.stream_position);

    let mut state = A::default();
    for record in ordered {
        state.apply(&record.data);
    }
    state
}

/// An aggregate instance with its identity, known version, and pending events.
///
/// The known version is the stream version observed at load (or after the
/// last successful save). It is advisory: the store re-validates it on every
/// append.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate, K> {
    id: K,
    version: u64,
    state: A,
    pending: Vec<A::Event>,
}

impl<A: Aggregate, K> AggregateRoot<A, K> {
    /// A brand-new aggregate with no stream yet.
    pub fn new(id: K) -> Self {
        Self {
            id,
            version: 0,
            state: A::default(),
            pending: Vec::new(),
        }
    }

    /// An aggregate rehydrated from a stream at `version`.
    pub fn rehydrated(id: K, version: u64, state: A) -> Self {
        Self {
            id,
            version,
            state,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> &K {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn pending_events(&self) -> &[A::Event] {
        &self.pending
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply an event to the state and queue it for persistence.
    pub fn raise(&mut self, event: A::Event) {
        self.state.apply(&event);
        self.pending.push(event);
    }

    /// Raise the events produced by a decision function over current state.
    pub fn execute<E>(
        &mut self,
        decide: impl FnOnce(&A) -> Result<Vec<A::Event>, E>,
    ) -> Result<(), E> {
        for event in decide(&self.state)? {
            self.raise(event);
        }
        Ok(())
    }

    /// Mark pending events as persisted at the store-assigned `version`.
    pub(crate) fn commit(&mut self, version: u64) {
        self.pending.clear();
        self.version = version;
    }
}
