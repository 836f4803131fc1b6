//! The ingestion engine: folds store loads and push deliveries into one live
//! thread index and fans every change out to subscribers.
//!
//! Locking: `store` and `state` are separate mutexes and are never held at
//! the same time. Store I/O happens first, the result is merged under the
//! state lock afterwards. Events are published while the state lock is held
//! so subscribers observe changes in the order they were applied.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use core_model::{
    Message, MessageStore, Origin, RawPush, Risk, ScoringInput, StoreError, ThreadSummary,
};
use events::{Publisher, Subscription};
use serde::Serialize;
use serde_json::Value;
use threads::{ThreadIndex, thread_key_of};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("risk score {0} is outside [0.0, 1.0]")]
    InvalidScore(f64),
}

impl EngineError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Unavailable(_)))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-subscriber mailbox size.
    pub subscriber_capacity: usize,
    /// How long a push record may wait for its store row before it is
    /// declared orphaned.
    pub reconcile_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: events::DEFAULT_CAPACITY,
            reconcile_window: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    MessageReceived(Message),
    Reconciled {
        provisional_id: String,
        id: String,
        thread_key: String,
    },
    Orphaned {
        id: String,
    },
    RiskAnnotated {
        id: String,
        risk: Risk,
    },
    MessageRead {
        id: String,
    },
    MessageDeleted {
        id: String,
        thread_key: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub loaded: usize,
    pub reconciled: usize,
    pub pending: usize,
    pub orphaned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushState {
    Pending,
    Orphaned,
}

#[derive(Debug, Clone)]
struct Provisional {
    id: String,
    received: Instant,
    state: PushState,
}

/// A store write that finished while a load was in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreWrite {
    Deleted(String),
    Read(String),
}

#[derive(Debug, Default)]
struct EngineState {
    index: ThreadIndex,
    /// Push records not (yet) matched to a store row, in delivery order.
    provisional: Vec<Provisional>,
    /// Provisional id -> store id, for records that were reconciled.
    aliases: HashMap<String, String>,
    next_load: u64,
    /// Loads whose snapshot may predate these writes, keyed by ticket.
    loads: HashMap<u64, Vec<StoreWrite>>,
}

impl EngineState {
    fn begin_load(&mut self) -> u64 {
        self.next_load += 1;
        self.loads.insert(self.next_load, Vec::new());
        self.next_load
    }

    fn record(&mut self, write: StoreWrite) {
        for writes in self.loads.values_mut() {
            writes.push(write.clone());
        }
    }

    fn resolve(&self, message_id: &str) -> String {
        self.aliases
            .get(message_id)
            .cloned()
            .unwrap_or_else(|| message_id.to_string())
    }

    fn is_provisional(&self, message_id: &str) -> bool {
        self.index
            .get(message_id)
            .is_some_and(|m| m.origin == Origin::Push)
    }
}

/// Hands out millisecond timestamps as ids, bumped so that two pushes in the
/// same millisecond still get distinct ids. Called under the state lock, so
/// ids also follow publish order.
#[derive(Debug, Default)]
struct ProvisionalIds {
    last: AtomicI64,
}

impl ProvisionalIds {
    fn next(&self, now_ms: i64) -> i64 {
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_ms.max(last + 1))
            })
            .unwrap_or(now_ms);
        now_ms.max(prev + 1)
    }
}

pub struct Engine<S> {
    store: Mutex<S>,
    state: Mutex<EngineState>,
    publisher: Publisher<EngineEvent>,
    config: EngineConfig,
    ids: ProvisionalIds,
}

impl<S: MessageStore> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store: Mutex::new(store),
            state: Mutex::new(EngineState::default()),
            publisher: Publisher::new(config.subscriber_capacity),
            config,
            ids: ProvisionalIds::default(),
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `f` with exclusive access to the store, outside the state lock.
    pub fn with_store<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&self.lock_store())
    }

    pub fn subscribe(&self) -> Subscription<EngineEvent> {
        self.publisher.subscribe()
    }

    pub fn unsubscribe(&self, subscription: Subscription<EngineEvent>) -> bool {
        self.publisher.unsubscribe(subscription)
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }

    /// Push listener entry point. The normalized record is indexed under a
    /// synthetic thread and published before any store access.
    pub fn handle_push(&self, raw: RawPush) -> Message {
        let mut state = self.lock_state();
        let received_at = Utc::now().timestamp_millis();
        let id = self.ids.next(received_at).to_string();
        let missing = raw.missing_fields();
        if !missing.is_empty() {
            warn!(provisional_id = %id, ?missing, "malformed push, coercing missing fields");
        }
        let message = Message::from_push(raw, id, received_at);
        info!(
            provisional_id = %message.id,
            sender = %message.sender,
            kind = %message.kind,
            "push received"
        );

        state.index.insert(message.clone());
        state.provisional.push(Provisional {
            id: message.id.clone(),
            received: Instant::now(),
            state: PushState::Pending,
        });
        self.publisher.publish(EngineEvent::MessageReceived(message.clone()));
        message
    }

    pub fn handle_push_value(&self, payload: &Value) -> Message {
        self.handle_push(RawPush::from_value(payload))
    }

    /// Everything the engine can see, newest first: the store's rows in the
    /// store's order with unreconciled push records merged in by timestamp.
    /// A failed load leaves the current index untouched.
    pub fn load_all(&self) -> Result<Vec<Message>, EngineError> {
        let (messages, _) = self.load_and_merge()?;
        Ok(messages)
    }

    /// Reloads the store and reconciles pending push records.
    pub fn refresh(&self) -> Result<ReconcileReport, EngineError> {
        let (_, report) = self.load_and_merge()?;
        Ok(report)
    }

    fn load_and_merge(&self) -> Result<(Vec<Message>, ReconcileReport), EngineError> {
        let ticket = self.lock_state().begin_load();
        let loaded = self.lock_store().load_all();
        let rows = match loaded {
            Ok(rows) => rows,
            Err(err) => {
                self.lock_state().loads.remove(&ticket);
                return Err(err.into());
            }
        };
        self.finish_load(ticket, rows)
    }

    fn finish_load(
        &self,
        ticket: u64,
        mut rows: Vec<Message>,
    ) -> Result<(Vec<Message>, ReconcileReport), EngineError> {
        let (messages, report, read_backfill) = {
            let mut state = self.lock_state();
            let missed = state.loads.remove(&ticket).unwrap_or_default();
            if !missed.is_empty() {
                debug!(writes = missed.len(), "replaying writes newer than the snapshot");
                apply_writes(&mut rows, &missed);
            }
            self.merge(&mut state, rows)
        };
        if !read_backfill.is_empty() {
            let mut carried = Vec::with_capacity(read_backfill.len());
            {
                let store = self.lock_store();
                for id in read_backfill {
                    match store.mark_read(&id) {
                        Ok(_) => carried.push(id),
                        Err(err) => {
                            warn!(id = %id, error = %err, "could not carry read flag to store")
                        }
                    }
                }
            }
            let mut state = self.lock_state();
            for id in carried {
                state.record(StoreWrite::Read(id));
            }
        }
        info!(
            loaded = report.loaded,
            reconciled = report.reconciled,
            pending = report.pending,
            orphaned = report.orphaned,
            "store merged"
        );
        Ok((messages, report))
    }

    fn merge(
        &self,
        state: &mut EngineState,
        mut rows: Vec<Message>,
    ) -> (Vec<Message>, ReconcileReport, Vec<String>) {
        let now = Instant::now();
        let previous = std::mem::take(&mut state.index);
        let mut report = ReconcileReport {
            loaded: rows.len(),
            ..ReconcileReport::default()
        };

        for row in rows.iter_mut() {
            if let Some(known) = previous.get(&row.id) {
                row.risk = known.risk.clone();
            }
        }

        let mut claimed: HashSet<String> = state.aliases.values().cloned().collect();
        let mut read_backfill = Vec::new();
        let mut outbox = Vec::new();
        let mut kept = Vec::with_capacity(state.provisional.len());
        let mut unreconciled = Vec::new();

        for entry in std::mem::take(&mut state.provisional) {
            let Some(pushed) = previous.get(&entry.id) else {
                continue;
            };
            if entry.state == PushState::Pending
                && let Some(row) = rows
                    .iter_mut()
                    .find(|r| !claimed.contains(&r.id) && r.same_content(pushed))
            {
                if pushed.risk.is_scored() && !row.risk.is_scored() {
                    row.risk = pushed.risk.clone();
                }
                if pushed.is_read && !row.is_read {
                    row.is_read = true;
                    read_backfill.push(row.id.clone());
                }
                claimed.insert(row.id.clone());
                state.aliases.insert(entry.id.clone(), row.id.clone());
                debug!(provisional_id = %entry.id, id = %row.id, "push reconciled");
                outbox.push(EngineEvent::Reconciled {
                    provisional_id: entry.id.clone(),
                    id: row.id.clone(),
                    thread_key: row.thread_key.clone(),
                });
                report.reconciled += 1;
                continue;
            }

            let mut entry = entry;
            if entry.state == PushState::Pending
                && now.duration_since(entry.received) >= self.config.reconcile_window
            {
                entry.state = PushState::Orphaned;
                report.orphaned += 1;
                info!(id = %entry.id, sender = %pushed.sender, "push orphaned");
                outbox.push(EngineEvent::Orphaned {
                    id: entry.id.clone(),
                });
            }
            if entry.state == PushState::Pending {
                report.pending += 1;
            }
            unreconciled.push(pushed.clone());
            kept.push(entry);
        }
        state.provisional = kept;

        let merged = merge_newest_first(&rows, &unreconciled);
        let mut index = ThreadIndex::from_messages(rows);
        for message in unreconciled {
            index.insert(message);
        }
        state.index = index;
        let live: HashSet<&str> = state.index.messages().map(|m| m.id.as_str()).collect();
        state.aliases.retain(|_, id| live.contains(id.as_str()));

        for event in outbox {
            self.publisher.publish(event);
        }
        (merged, report, read_backfill)
    }

    /// Messages of one thread, oldest first. Synthetic thread keys are
    /// answered from memory, store thread keys from the store.
    pub fn load_thread(&self, thread_key: &str) -> Result<Vec<Message>, EngineError> {
        if threads::is_synthetic(thread_key) {
            return Ok(self.lock_state().index.thread_messages(thread_key));
        }
        let mut rows = self.lock_store().load_by_thread(thread_key)?;
        let state = self.lock_state();
        for row in rows.iter_mut() {
            if let Some(known) = state.index.get(&row.id) {
                row.risk = known.risk.clone();
            }
        }
        Ok(rows)
    }

    /// Current thread summaries, most recent first.
    pub fn threads(&self, risk_threshold: f64) -> Vec<ThreadSummary> {
        self.lock_state().index.summaries(risk_threshold)
    }

    pub fn thread(&self, thread_key: &str, risk_threshold: f64) -> Option<ThreadSummary> {
        self.lock_state().index.summary(thread_key, risk_threshold)
    }

    pub fn get(&self, message_id: &str) -> Option<Message> {
        let state = self.lock_state();
        let id = state.resolve(message_id);
        state.index.get(&id).cloned()
    }

    /// Messages whose score exceeds `risk_threshold`, highest score first.
    pub fn flagged(&self, risk_threshold: f64) -> Vec<Message> {
        let state = self.lock_state();
        let mut out: Vec<Message> = state
            .index
            .messages()
            .filter(|m| m.risk.exceeds(risk_threshold))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            let sa = a.risk.score().unwrap_or_default();
            let sb = b.risk.score().unwrap_or_default();
            sb.total_cmp(&sa).then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        out
    }

    /// What an external scorer needs for every message it has not scored
    /// yet, newest first.
    pub fn scoring_inputs(&self) -> Vec<ScoringInput> {
        let state = self.lock_state();
        let mut out: Vec<ScoringInput> = state
            .index
            .messages()
            .filter(|m| !m.risk.is_scored())
            .map(Message::scoring_input)
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Push records still waiting for a store row.
    pub fn pending_count(&self) -> usize {
        self.lock_state()
            .provisional
            .iter()
            .filter(|p| p.state == PushState::Pending)
            .count()
    }

    /// Sets the risk of a known message. Accepts provisional ids of records
    /// that have since been reconciled.
    pub fn annotate(
        &self,
        message_id: &str,
        score: f64,
        reason: impl Into<String>,
    ) -> Result<bool, EngineError> {
        let risk = Risk::scored(score, reason).ok_or(EngineError::InvalidScore(score))?;
        let mut state = self.lock_state();
        let id = state.resolve(message_id);
        if !state.index.annotate(&id, risk.clone()) {
            debug!(id = %message_id, "annotation for unknown message ignored");
            return Ok(false);
        }
        self.publisher.publish(EngineEvent::RiskAnnotated { id, risk });
        Ok(true)
    }

    pub fn mark_read(&self, message_id: &str) -> Result<bool, EngineError> {
        let id = {
            let mut state = self.lock_state();
            let id = state.resolve(message_id);
            if state.is_provisional(&id) {
                if state.index.mark_read(&id) == Some(true) {
                    self.publisher.publish(EngineEvent::MessageRead { id });
                }
                return Ok(true);
            }
            id
        };

        let found = self.lock_store().mark_read(&id)?;
        if found {
            let mut state = self.lock_state();
            state.record(StoreWrite::Read(id.clone()));
            if state.index.mark_read(&id) == Some(true) {
                self.publisher.publish(EngineEvent::MessageRead { id });
            }
        }
        Ok(found)
    }

    /// Deletes from the store and drops the message from its thread. Push
    /// records that never reached the store are only dropped from memory.
    pub fn delete(&self, message_id: &str) -> Result<bool, EngineError> {
        let id = {
            let mut state = self.lock_state();
            let id = state.resolve(message_id);
            if state.is_provisional(&id) {
                state.provisional.retain(|p| p.id != id);
                if let Some(removed) = state.index.remove(&id) {
                    self.publisher.publish(EngineEvent::MessageDeleted {
                        thread_key: thread_key_of(&removed),
                        id,
                    });
                }
                return Ok(true);
            }
            id
        };

        let removed = self.lock_store().delete(&id)?;
        let mut state = self.lock_state();
        state.record(StoreWrite::Deleted(id.clone()));
        if let Some(message) = state.index.remove(&id) {
            self.publisher.publish(EngineEvent::MessageDeleted {
                thread_key: thread_key_of(&message),
                id,
            });
        }
        Ok(removed)
    }
}

/// Patches a store snapshot with writes that landed after it was taken.
fn apply_writes(rows: &mut Vec<Message>, writes: &[StoreWrite]) {
    for write in writes {
        match write {
            StoreWrite::Deleted(id) => rows.retain(|m| &m.id != id),
            StoreWrite::Read(id) => {
                if let Some(row) = rows.iter_mut().find(|m| &m.id == id) {
                    row.is_read = true;
                }
            }
        }
    }
}

/// Both inputs newest first. Store rows win ties so the store's order is
/// kept for equal timestamps.
fn merge_newest_first(rows: &[Message], pushed: &[Message]) -> Vec<Message> {
    let mut pushed: Vec<&Message> = pushed.iter().collect();
    pushed.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let mut out = Vec::with_capacity(rows.len() + pushed.len());
    let mut rows = rows.iter().peekable();
    let mut pushed = pushed.into_iter().peekable();
    loop {
        let take_row = match (rows.peek(), pushed.peek()) {
            (Some(r), Some(p)) => r.timestamp >= p.timestamp,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_row { rows.next() } else { pushed.next() };
        out.extend(next.cloned());
    }
    out
}
