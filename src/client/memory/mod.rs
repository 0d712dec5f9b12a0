//! In-memory log store client.
//!
//! Honors the same protocol as the external log: per-stream revisions with
//! optimistic appends, a global commit order, `$ce-{category}` projections,
//! `$all`, hard deletes leaving `$$` tombstones, catch-up subscriptions, and
//! consumer groups with in-flight tracking, redelivery after the message
//! timeout, and parking.
//!
//! Also exposes call counters and fault injection for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AckHandle, ClientError, Delivery, ExpectedRevision, NackAction, PersistentConnection,
    PersistentSettings, RecordStream, Result, StoreClient, CATEGORY_STREAM_PREFIX,
};
use crate::record::{EventDescriptor, EventRecord, RawEventRecord, TOMBSTONE_PREFIX};

/// Stream name addressing every record in commit order.
pub const ALL_STREAM: &str = "$all";

/// Event type written into tombstone records.
pub const STREAM_DELETED_EVENT: &str = "$streamDeleted";

/// Live fan-out capacity. Slow catch-up readers beyond this are dropped.
const LIVE_CAPACITY: usize = 1024;

/// Upper bound on how long a persistent reader sleeps between checks.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Settled ids kept per consumer group for inspection; older ones are
/// forgotten.
pub const SETTLED_HISTORY: usize = 1024;

/// Which records a read or subscription addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    All,
    Category(String),
    Stream(String),
}

impl Target {
    fn parse(stream: &str) -> Self {
        if stream == ALL_STREAM {
            Target::All
        } else if let Some(category) = stream.strip_prefix(CATEGORY_STREAM_PREFIX) {
            Target::Category(category.to_string())
        } else {
            Target::Stream(stream.to_string())
        }
    }

    /// Position of `entry` within this target, if it belongs to it.
    fn position_of(&self, entry: &LogEntry) -> Option<u64> {
        match self {
            Target::All => Some(entry.record.commit_position),
            Target::Category(category) => match &entry.category {
                Some((c, pos)) if c == category => Some(*pos),
                _ => None,
            },
            Target::Stream(stream) => {
                (entry.record.stream_name == *stream).then_some(entry.record.stream_position)
            }
        }
    }
}

/// Category of a stream: the part before the first `-`.
///
/// Tombstones count toward the category of the stream they replace; other
/// `$`-prefixed streams belong to none.
fn category_of(stream: &str) -> Option<&str> {
    let name = stream.strip_prefix(TOMBSTONE_PREFIX).unwrap_or(stream);
    if name.starts_with('$') {
        return None;
    }
    name.split_once('-').map(|(category, _)| category)
}

#[derive(Debug, Clone)]
struct LogEntry {
    record: RawEventRecord,
    /// Category name and position within the category projection.
    category: Option<(String, u64)>,
}

#[derive(Debug)]
struct InFlight {
    delivery: Delivery,
    sent_at: Instant,
}

#[derive(Debug)]
struct GroupState {
    target: Target,
    settings: PersistentSettings,
    /// Next position to hand out; the store-tracked checkpoint.
    cursor: u64,
    in_flight: HashMap<Uuid, InFlight>,
    retry: VecDeque<Delivery>,
    parked: Vec<Delivery>,
    acked: VecDeque<Uuid>,
    skipped: VecDeque<Uuid>,
}

/// Append to a bounded settled-id history.
fn remember(history: &mut VecDeque<Uuid>, id: Uuid) {
    if history.len() == SETTLED_HISTORY {
        history.pop_front();
    }
    history.push_back(id);
}

impl GroupState {
    fn requeue_in_flight(&mut self) {
        let mut pending: Vec<Delivery> = self.in_flight.drain().map(|(_, f)| f.delivery).collect();
        pending.sort_by_key(|d| d.position);
        for delivery in pending.into_iter().rev() {
            self.retry.push_front(delivery);
        }
    }

    /// Take an in-flight or queued delivery out of the group.
    fn take(&mut self, id: &Uuid) -> Option<Delivery> {
        if let Some(f) = self.in_flight.remove(id) {
            return Some(f.delivery);
        }
        let idx = self.retry.iter().position(|d| d.ack_id == *id)?;
        self.retry.remove(idx)
    }
}

#[derive(Debug, Default)]
struct State {
    log: Vec<LogEntry>,
    versions: HashMap<String, u64>,
    deleted: HashSet<String>,
    category_heads: HashMap<String, u64>,
    next_commit: u64,
    groups: HashMap<(String, String), GroupState>,
}

impl State {
    fn push(&mut self, record: RawEventRecord) -> LogEntry {
        let category = category_of(&record.stream_name).map(|c| {
            let head = self.category_heads.entry(c.to_string()).or_insert(0);
            let pos = *head;
            *head += 1;
            (c.to_string(), pos)
        });
        let entry = LogEntry { record, category };
        self.log.push(entry.clone());
        entry
    }

    fn resolve(&self, target: &Target, from: u64) -> Vec<(u64, &LogEntry)> {
        self.log
            .iter()
            .filter_map(|e| target.position_of(e).map(|p| (p, e)))
            .filter(|(p, _)| *p >= from)
            .collect()
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut GroupState> {
        self.groups
            .get_mut(&(stream.to_string(), group.to_string()))
            .ok_or_else(|| ClientError::SubscriptionNotFound {
                stream: stream.to_string(),
                group: group.to_string(),
            })
    }
}

/// Per-operation call counts.
#[derive(Debug, Default)]
struct CallCounts {
    appends: AtomicUsize,
    reads: AtomicUsize,
    deletes: AtomicUsize,
}

/// In-process log store.
#[derive(Clone)]
pub struct InMemoryClient {
    state: Arc<Mutex<State>>,
    live: broadcast::Sender<LogEntry>,
    changed: Arc<Notify>,
    /// Connection epoch; bumping it drops every open subscription.
    epoch: Arc<watch::Sender<u64>>,
    failing_subscribes: Arc<AtomicUsize>,
    calls: Arc<CallCounts>,
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClient {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        let (epoch, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            live,
            changed: Arc::new(Notify::new()),
            epoch: Arc::new(epoch),
            failing_subscribes: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(CallCounts::default()),
        }
    }

    /// Number of `read_stream` calls served.
    pub fn read_calls(&self) -> usize {
        self.calls.reads.load(Ordering::SeqCst)
    }

    /// Number of `append_to_stream` calls served (including rejected ones).
    pub fn append_calls(&self) -> usize {
        self.calls.appends.load(Ordering::SeqCst)
    }

    /// Number of `tombstone_stream` calls served.
    pub fn delete_calls(&self) -> usize {
        self.calls.deletes.load(Ordering::SeqCst)
    }

    /// Drop every open subscription with a connection error.
    ///
    /// Records in flight on persistent subscriptions go back to the front of
    /// their group's retry queue.
    pub async fn drop_connections(&self) {
        {
            let mut state = self.state.lock().await;
            for group in state.groups.values_mut() {
                group.requeue_in_flight();
            }
        }
        self.epoch.send_modify(|e| *e += 1);
        self.changed.notify_waiters();
        warn!("Dropped all subscription connections");
    }

    /// Make the next `count` subscribe attempts fail with a connection error.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Ids acknowledged on a consumer group, in ack order. Only the most
    /// recent [`SETTLED_HISTORY`] are kept.
    pub async fn acknowledged(&self, stream: &str, group: &str) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.acked.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ids parked on a consumer group.
    pub async fn parked(&self, stream: &str, group: &str) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.parked.iter().map(|d| d.ack_id).collect())
            .unwrap_or_default()
    }

    /// Ids dropped from a consumer group with [`NackAction::Skip`]. Bounded
    /// like [`acknowledged`](Self::acknowledged).
    pub async fn skipped(&self, stream: &str, group: &str) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.skipped.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Records delivered on a consumer group and not yet settled.
    pub async fn in_flight(&self, stream: &str, group: &str) -> usize {
        let state = self.state.lock().await;
        state
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.in_flight.len() + g.retry.len())
            .unwrap_or(0)
    }

    fn take_subscribe_failure(&self) -> bool {
        self.failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn broadcast(&self, entry: LogEntry) {
        // No live subscribers is fine.
        let _ = self.live.send(entry);
    }
}

#[async_trait]
impl StoreClient for InMemoryClient {
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        events: Vec<EventDescriptor>,
    ) -> Result<u64> {
        self.calls.appends.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if state.deleted.contains(stream) {
            return Err(ClientError::StreamDeleted(stream.to_string()));
        }

        let existing = state.versions.get(stream).copied();
        let version = existing.unwrap_or(0);
        if !expected.matches(version) {
            return Err(ClientError::WrongExpectedVersion {
                stream: stream.to_string(),
                expected,
                actual: existing,
            });
        }

        let count = events.len() as u64;
        let recorded_at = Utc::now();
        for (offset, event) in events.into_iter().enumerate() {
            let commit_position = state.next_commit;
            state.next_commit += 1;
            let entry = state.push(EventRecord {
                stream_name: stream.to_string(),
                event_type: event.event_type,
                id: Uuid::new_v4(),
                stream_position: version + offset as u64,
                commit_position,
                recorded_at,
                data: event.data,
                metadata: event.metadata,
            });
            self.broadcast(entry);
        }

        let next = version + count;
        if count > 0 {
            state.versions.insert(stream.to_string(), next);
        }
        drop(state);

        self.changed.notify_waiters();
        debug!(stream = %stream, count, version = next, "Appended events");
        Ok(next)
    }

    async fn read_stream(&self, stream: &str, from: u64) -> Result<Vec<RawEventRecord>> {
        self.calls.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;

        if state.deleted.contains(stream) {
            return Err(ClientError::StreamDeleted(stream.to_string()));
        }

        let target = Target::parse(stream);
        Ok(state
            .resolve(&target, from)
            .into_iter()
            .map(|(_, e)| e.record.clone())
            .collect())
    }

    async fn stream_version(&self, stream: &str) -> Result<Option<u64>> {
        let state = self.state.lock().await;
        if state.deleted.contains(stream) {
            return Err(ClientError::StreamDeleted(stream.to_string()));
        }
        Ok(state.versions.get(stream).copied())
    }

    async fn tombstone_stream(&self, stream: &str) -> Result<()> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if !state.deleted.insert(stream.to_string()) {
            return Err(ClientError::StreamDeleted(stream.to_string()));
        }

        state.log.retain(|e| e.record.stream_name != stream);
        state.versions.remove(stream);

        let commit_position = state.next_commit;
        state.next_commit += 1;
        let entry = state.push(EventRecord {
            stream_name: format!("{}{}", TOMBSTONE_PREFIX, stream),
            event_type: STREAM_DELETED_EVENT.to_string(),
            id: Uuid::new_v4(),
            stream_position: 0,
            commit_position,
            recorded_at: Utc::now(),
            data: Default::default(),
            metadata: Default::default(),
        });
        self.broadcast(entry);
        drop(state);

        self.changed.notify_waiters();
        info!(stream = %stream, "Stream tombstoned");
        Ok(())
    }

    async fn subscribe_to_stream(
        &self,
        stream: &str,
        from: Option<u64>,
    ) -> Result<Box<dyn RecordStream>> {
        if self.take_subscribe_failure() {
            return Err(ClientError::Connection("subscribe refused".to_string()));
        }

        let target = Target::parse(stream);
        // Subscribe to the live feed under the lock so no append falls between
        // the historical snapshot and the first live record.
        let state = self.state.lock().await;
        let live = self.live.subscribe();
        let backlog: VecDeque<Delivery> = state
            .resolve(&target, from.unwrap_or(0))
            .into_iter()
            .map(|(position, e)| Delivery {
                record: e.record.clone(),
                position,
                ack_id: e.record.id,
                retry_count: 0,
            })
            .collect();
        drop(state);

        let epoch = self.epoch.subscribe();
        let connected_epoch = *epoch.borrow();

        debug!(stream = %stream, from = ?from, backlog = backlog.len(), "Catch-up subscription opened");

        Ok(Box::new(CatchUpStream {
            target,
            backlog,
            live,
            epoch,
            connected_epoch,
        }))
    }

    async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &PersistentSettings,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (stream.to_string(), group.to_string());
        if state.groups.contains_key(&key) {
            return Ok(());
        }
        state.groups.insert(
            key,
            GroupState {
                target: Target::parse(stream),
                settings: settings.clone(),
                cursor: settings.start_from,
                in_flight: HashMap::new(),
                retry: VecDeque::new(),
                parked: Vec::new(),
                acked: VecDeque::new(),
                skipped: VecDeque::new(),
            },
        );
        info!(stream = %stream, group = %group, "Persistent subscription created");
        Ok(())
    }

    async fn subscribe_to_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        buffer_size: usize,
    ) -> Result<PersistentConnection> {
        if self.take_subscribe_failure() {
            return Err(ClientError::Connection("subscribe refused".to_string()));
        }

        {
            let mut state = self.state.lock().await;
            state.group_mut(stream, group)?;
        }

        let epoch = self.epoch.subscribe();
        let connected_epoch = *epoch.borrow();
        let stopped = Arc::new(AtomicBool::new(false));

        debug!(stream = %stream, group = %group, buffer_size, "Persistent subscription connected");

        let stream_handle = PersistentStream {
            state: self.state.clone(),
            changed: self.changed.clone(),
            stream: stream.to_string(),
            group: group.to_string(),
            epoch: epoch.clone(),
            connected_epoch,
            stopped: stopped.clone(),
        };
        let acks = MemoryAcks {
            state: self.state.clone(),
            changed: self.changed.clone(),
            stream: stream.to_string(),
            group: group.to_string(),
            epoch,
            connected_epoch,
            stopped,
        };

        Ok(PersistentConnection {
            stream: Box::new(stream_handle),
            acks: Arc::new(acks),
        })
    }
}

// ============================================================================
// Catch-up subscription
// ============================================================================

struct CatchUpStream {
    target: Target,
    backlog: VecDeque<Delivery>,
    live: broadcast::Receiver<LogEntry>,
    epoch: watch::Receiver<u64>,
    connected_epoch: u64,
}

impl CatchUpStream {
    fn check_connected(&self) -> Result<()> {
        if *self.epoch.borrow() != self.connected_epoch {
            return Err(ClientError::SubscriptionDropped(
                "connection reset".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStream for CatchUpStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        self.check_connected()?;

        if let Some(delivery) = self.backlog.pop_front() {
            return Ok(Some(delivery));
        }

        loop {
            tokio::select! {
                received = self.live.recv() => match received {
                    Ok(entry) => {
                        if let Some(position) = self.target.position_of(&entry) {
                            return Ok(Some(Delivery {
                                ack_id: entry.record.id,
                                record: entry.record,
                                position,
                                retry_count: 0,
                            }));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Err(ClientError::SubscriptionDropped(format!(
                            "reader lagged by {n} records"
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                },
                changed = self.epoch.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                    self.check_connected()?;
                }
            }
        }
    }
}

// ============================================================================
// Persistent subscription
// ============================================================================

struct PersistentStream {
    state: Arc<Mutex<State>>,
    changed: Arc<Notify>,
    stream: String,
    group: String,
    epoch: watch::Receiver<u64>,
    connected_epoch: u64,
    stopped: Arc<AtomicBool>,
}

impl PersistentStream {
    fn check_connected(&self) -> Result<()> {
        if *self.epoch.borrow() != self.connected_epoch {
            return Err(ClientError::SubscriptionDropped(
                "connection reset".to_string(),
            ));
        }
        Ok(())
    }

    /// Hand out the next delivery for this group, if any is due.
    async fn poll_once(&self) -> Result<Option<Delivery>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let group = state
            .groups
            .get_mut(&(self.stream.clone(), self.group.clone()))
            .ok_or_else(|| ClientError::SubscriptionNotFound {
                stream: self.stream.clone(),
                group: self.group.clone(),
            })?;
        let now = Instant::now();

        // Explicit retries first.
        while let Some(mut delivery) = group.retry.pop_front() {
            delivery.retry_count += 1;
            if delivery.retry_count > group.settings.max_retry_count {
                warn!(id = %delivery.ack_id, "Retry limit reached, parking record");
                group.parked.push(delivery);
                continue;
            }
            group.in_flight.insert(
                delivery.ack_id,
                InFlight {
                    delivery: delivery.clone(),
                    sent_at: now,
                },
            );
            return Ok(Some(delivery));
        }

        // Then anything whose ack never arrived.
        let timeout = group.settings.message_timeout;
        let expired: Option<Uuid> = group
            .in_flight
            .iter()
            .filter(|(_, f)| now.duration_since(f.sent_at) >= timeout)
            .min_by_key(|(_, f)| f.delivery.position)
            .map(|(id, _)| *id);
        if let Some(id) = expired {
            if let Some(InFlight { mut delivery, .. }) = group.in_flight.remove(&id) {
                delivery.retry_count += 1;
                if delivery.retry_count > group.settings.max_retry_count {
                    warn!(id = %id, "Retry limit reached, parking record");
                    group.parked.push(delivery);
                    return Ok(None);
                }
                debug!(id = %id, retry = delivery.retry_count, "Message timeout, redelivering");
                group.in_flight.insert(
                    id,
                    InFlight {
                        delivery: delivery.clone(),
                        sent_at: now,
                    },
                );
                return Ok(Some(delivery));
            }
        }

        // Then the next new record after the checkpoint.
        let next = state
            .log
            .iter()
            .filter_map(|e| group.target.position_of(e).map(|p| (p, e)))
            .find(|(p, _)| *p >= group.cursor);
        if let Some((position, entry)) = next {
            group.cursor = position + 1;
            let delivery = Delivery {
                record: entry.record.clone(),
                position,
                ack_id: entry.record.id,
                retry_count: 0,
            };
            group.in_flight.insert(
                delivery.ack_id,
                InFlight {
                    delivery: delivery.clone(),
                    sent_at: now,
                },
            );
            return Ok(Some(delivery));
        }

        Ok(None)
    }
}

#[async_trait]
impl RecordStream for PersistentStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            self.check_connected()?;
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let notified = self.changed.notified();
            if let Some(delivery) = self.poll_once().await? {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                changed = self.epoch.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

struct MemoryAcks {
    state: Arc<Mutex<State>>,
    changed: Arc<Notify>,
    stream: String,
    group: String,
    epoch: watch::Receiver<u64>,
    connected_epoch: u64,
    stopped: Arc<AtomicBool>,
}

impl MemoryAcks {
    fn check_connected(&self) -> Result<()> {
        if *self.epoch.borrow() != self.connected_epoch {
            return Err(ClientError::SubscriptionDropped(
                "connection reset".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AckHandle for MemoryAcks {
    async fn ack(&self, ids: &[Uuid]) -> Result<()> {
        self.check_connected()?;
        let mut state = self.state.lock().await;
        let group = state.group_mut(&self.stream, &self.group)?;
        for id in ids {
            if group.take(id).is_some() {
                remember(&mut group.acked, *id);
            }
        }
        Ok(())
    }

    async fn nack(&self, ids: &[Uuid], action: NackAction, reason: &str) -> Result<()> {
        self.check_connected()?;
        let mut state = self.state.lock().await;
        let group = state.group_mut(&self.stream, &self.group)?;
        for id in ids {
            let Some(delivery) = group.take(id) else {
                continue;
            };
            debug!(id = %id, action = ?action, reason = %reason, "Record nacked");
            match action {
                NackAction::Park => group.parked.push(delivery),
                NackAction::Retry => group.retry.push_back(delivery),
                NackAction::Skip => remember(&mut group.skipped, *id),
                NackAction::Stop => {
                    group.retry.push_front(delivery);
                    self.stopped.store(true, Ordering::SeqCst);
                }
            }
        }
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }
}
