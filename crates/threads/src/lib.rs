//! Folding messages into conversation threads.
//!
//! [`aggregate`] is the pure left fold over a message sequence. [`ThreadIndex`]
//! keeps the same fold live so single messages can be added, removed, marked
//! read or annotated without re-reading the whole store.

use std::collections::{HashMap, HashSet};

use core_model::{Message, Risk, ThreadSummary};
use tracing::debug;

const SYNTHETIC_PREFIX: &str = "push:";

/// Key for a sender whose messages have no store thread yet.
pub fn synthetic_key(sender: &str) -> String {
    format!("{SYNTHETIC_PREFIX}{sender}")
}

pub fn is_synthetic(thread_key: &str) -> bool {
    thread_key.starts_with(SYNTHETIC_PREFIX)
}

/// The key a message is grouped under.
pub fn thread_key_of(message: &Message) -> String {
    if message.thread_key.is_empty() {
        synthetic_key(&message.sender)
    } else {
        message.thread_key.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub thread_key: String,
    pub peer_address: String,
    pub last_snippet: String,
    pub last_timestamp: i64,
    pub message_count: usize,
    pub unread_count: usize,
    members: Vec<String>,
}

impl Thread {
    fn start(thread_key: String, message: &Message) -> Self {
        Thread {
            thread_key,
            peer_address: message.sender.clone(),
            last_snippet: message.body.clone(),
            last_timestamp: message.timestamp,
            message_count: 1,
            unread_count: usize::from(!message.is_read),
            members: vec![message.id.clone()],
        }
    }

    // Equal timestamps: the later message in fold order takes the snippet.
    fn fold(&mut self, message: &Message) {
        self.message_count += 1;
        if !message.is_read {
            self.unread_count += 1;
        }
        if message.timestamp >= self.last_timestamp {
            self.last_timestamp = message.timestamp;
            self.last_snippet = message.body.clone();
        }
        if self.peer_address.is_empty() {
            self.peer_address = message.sender.clone();
        }
        self.members.push(message.id.clone());
    }

    pub fn summary(&self, thread_risk: bool) -> ThreadSummary {
        ThreadSummary {
            thread_key: self.thread_key.clone(),
            peer_address: self.peer_address.clone(),
            last_snippet: self.last_snippet.clone(),
            last_timestamp: self.last_timestamp,
            message_count: self.message_count,
            unread_count: self.unread_count,
            thread_risk,
        }
    }
}

/// Folds `messages` in input order. A message id seen twice is counted once.
pub fn aggregate<'a>(messages: impl IntoIterator<Item = &'a Message>) -> HashMap<String, Thread> {
    let mut threads: HashMap<String, Thread> = HashMap::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for message in messages {
        if !seen.insert(message.id.as_str()) {
            continue;
        }
        let key = thread_key_of(message);
        match threads.get_mut(&key) {
            Some(thread) => thread.fold(message),
            None => {
                threads.insert(key.clone(), Thread::start(key, message));
            }
        }
    }
    threads
}

/// Live thread aggregate plus the member messages it was built from.
#[derive(Debug, Default)]
pub struct ThreadIndex {
    threads: HashMap<String, Thread>,
    messages: HashMap<String, Message>,
}

impl ThreadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        let threads = aggregate(&messages);
        let mut by_id = HashMap::with_capacity(messages.len());
        for message in messages {
            by_id.entry(message.id.clone()).or_insert(message);
        }
        debug!(threads = threads.len(), messages = by_id.len(), "thread index built");
        Self {
            threads,
            messages: by_id,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.contains_key(message_id)
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.get(message_id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    pub fn thread(&self, thread_key: &str) -> Option<&Thread> {
        self.threads.get(thread_key)
    }

    /// Folds one more message in. Returns `false` if the id is already known.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.messages.contains_key(&message.id) {
            return false;
        }
        let key = thread_key_of(&message);
        match self.threads.get_mut(&key) {
            Some(thread) => thread.fold(&message),
            None => {
                self.threads.insert(key.clone(), Thread::start(key, &message));
            }
        }
        self.messages.insert(message.id.clone(), message);
        true
    }

    /// Removes a message and recomputes its thread from the remaining
    /// members. The thread is dropped once it has no members left.
    pub fn remove(&mut self, message_id: &str) -> Option<Message> {
        let message = self.messages.remove(message_id)?;
        let key = thread_key_of(&message);
        let Some(thread) = self.threads.remove(&key) else {
            return Some(message);
        };
        let mut rebuilt: Option<Thread> = None;
        for member in thread.members.iter().filter(|id| id.as_str() != message_id) {
            let Some(m) = self.messages.get(member) else {
                continue;
            };
            match rebuilt.as_mut() {
                Some(t) => t.fold(m),
                None => rebuilt = Some(Thread::start(key.clone(), m)),
            }
        }
        match rebuilt {
            Some(t) => {
                self.threads.insert(key, t);
            }
            None => debug!(thread_key = %key, "thread emptied"),
        }
        Some(message)
    }

    /// `None` for unknown ids, `Some(true)` if the flag flipped, `Some(false)`
    /// if the message was already read.
    pub fn mark_read(&mut self, message_id: &str) -> Option<bool> {
        let message = self.messages.get_mut(message_id)?;
        if message.is_read {
            return Some(false);
        }
        message.is_read = true;
        let key = thread_key_of(message);
        if let Some(thread) = self.threads.get_mut(&key) {
            thread.unread_count = thread.unread_count.saturating_sub(1);
        }
        Some(true)
    }

    /// Overwrites the risk of a known message. Unknown ids are left alone.
    pub fn annotate(&mut self, message_id: &str, risk: Risk) -> bool {
        match self.messages.get_mut(message_id) {
            Some(message) => {
                message.risk = risk;
                true
            }
            None => false,
        }
    }

    /// Computed from current member annotations on every call.
    pub fn thread_risk(&self, thread_key: &str, threshold: f64) -> Option<bool> {
        let thread = self.threads.get(thread_key)?;
        Some(
            thread
                .members
                .iter()
                .filter_map(|id| self.messages.get(id))
                .any(|m| m.risk.exceeds(threshold)),
        )
    }

    pub fn summary(&self, thread_key: &str, threshold: f64) -> Option<ThreadSummary> {
        let thread = self.threads.get(thread_key)?;
        let risk = self.thread_risk(thread_key, threshold).unwrap_or(false);
        Some(thread.summary(risk))
    }

    /// All threads, most recent first.
    pub fn summaries(&self, threshold: f64) -> Vec<ThreadSummary> {
        let mut out: Vec<ThreadSummary> = self
            .threads
            .keys()
            .filter_map(|key| self.summary(key, threshold))
            .collect();
        out.sort_by(|a, b| {
            b.last_timestamp
                .cmp(&a.last_timestamp)
                .then_with(|| a.thread_key.cmp(&b.thread_key))
        });
        out
    }

    /// Members of one thread, oldest first; equal timestamps keep fold order.
    pub fn thread_messages(&self, thread_key: &str) -> Vec<Message> {
        let Some(thread) = self.threads.get(thread_key) else {
            return Vec::new();
        };
        let mut out: Vec<Message> = thread
            .members
            .iter()
            .filter_map(|id| self.messages.get(id).cloned())
            .collect();
        out.sort_by_key(|m| m.timestamp);
        out
    }
}
