//! Cross-subscriber stream sharing and reference-counted disposal.

use std::any::TypeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::schedule::{TaskHandle, TaskPool};
use crate::stream::EventStream;

/// Sharing protocol went wrong. All of these are wiring bugs in a
/// subscriber, caught loudly instead of leaking or double-freeing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ShareError {
    #[error("no subscribers registered")]
    NoSubscribers,
    #[error("subscriber {0:?} is not registered")]
    NotSubscribed(SubscriberId),
    #[error("subscriber {0:?} does not owe a read on this stream")]
    NotOwed(SubscriberId),
    #[error("subscriber {0:?} must release its shared streams before unsubscribing")]
    OutstandingReads(SubscriberId),
}

/// Identity of a registered consumer. Unique across all share
/// instances, so wiring a subscriber to the wrong context is caught as
/// `NotSubscribed` instead of aliasing someone else's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(0);

/// Streams queued for one subscriber, to be merged into its container
/// at that subscriber's next write phase.
pub struct PendingStreams {
    pub type_key: TypeId,
    pub streams: Vec<Arc<EventStream>>,
    /// Completes when the streams are safe to read.
    pub gate: TaskHandle,
}

struct OwingEntry {
    owed: FxHashSet<SubscriberId>,
    /// Every handle a releaser (or the distributor) has surrendered;
    /// disposal depends on all of them.
    gates: Vec<TaskHandle>,
    stream: Arc<EventStream>,
}

/// Registry that fans finished streams out to subscribers and frees
/// each stream exactly once, after the last subscriber releases it.
///
/// One instance per isolated execution context, owned by whoever owns
/// the context and passed by reference; there is no ambient global.
/// All methods take `&mut self`: the owing map is mutated only from the
/// orchestration thread, and the borrow checker enforces it.
pub struct StreamShare {
    subscribers: Vec<SubscriberId>,
    mailboxes: FxHashMap<SubscriberId, Vec<PendingStreams>>,
    owing: FxHashMap<usize, OwingEntry>,
}

impl StreamShare {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            mailboxes: FxHashMap::default(),
            owing: FxHashMap::default(),
        }
    }

    /// Registers a consumer and returns its identity.
    pub fn subscribe(&mut self) -> SubscriberId {
        let id = SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed));
        self.subscribers.push(id);
        self.mailboxes.insert(id, Vec::new());
        tracing::debug!(subscriber = id.0, "subscribed");
        id
    }

    /// Deregisters a consumer. Fails while the consumer still owes a
    /// read on any tracked stream: release first, then unsubscribe.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> Result<(), ShareError> {
        if !self.subscribers.contains(&id) {
            return Err(ShareError::NotSubscribed(id));
        }
        if self.owing.values().any(|entry| entry.owed.contains(&id)) {
            return Err(ShareError::OutstandingReads(id));
        }
        self.subscribers.retain(|s| *s != id);
        self.mailboxes.remove(&id);
        tracing::debug!(subscriber = id.0, "unsubscribed");
        Ok(())
    }

    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Streams currently tracked as owed by someone.
    #[inline]
    pub fn owed_count(&self) -> usize {
        self.owing.len()
    }

    /// Fans `streams` out to every subscriber except `owner`.
    ///
    /// `handle` must complete when the streams become safe to read
    /// (producers done) and the owner's own readers are done with them.
    /// With no other subscriber the data has no audience: disposal is
    /// scheduled directly against `handle` and nothing enters the owing
    /// map. Otherwise every non-owner is recorded as owing a read and
    /// receives the streams in its mailbox; ownership of "when to free"
    /// moves to the owing set and the input handle is returned as-is.
    pub fn distribute(
        &mut self,
        owner: SubscriberId,
        type_key: TypeId,
        streams: Vec<Arc<EventStream>>,
        handle: &TaskHandle,
        pool: &TaskPool,
    ) -> Result<TaskHandle, ShareError> {
        if streams.is_empty() {
            return Ok(handle.clone());
        }
        if self.subscribers.is_empty() {
            return Err(ShareError::NoSubscribers);
        }
        if !self.subscribers.contains(&owner) {
            return Err(ShareError::NotSubscribed(owner));
        }

        if self.subscribers.len() == 1 {
            let mut handles = vec![handle.clone()];
            for stream in streams {
                handles.push(dispose(pool, handle, stream));
            }
            return Ok(TaskHandle::combine(&handles));
        }

        tracing::trace!(
            owner = owner.0,
            streams = streams.len(),
            subscribers = self.subscribers.len(),
            "distributing streams"
        );
        for stream in &streams {
            let owed: FxHashSet<SubscriberId> = self
                .subscribers
                .iter()
                .copied()
                .filter(|s| *s != owner)
                .collect();
            self.owing.insert(
                stream_key(stream),
                OwingEntry {
                    owed,
                    gates: vec![handle.clone()],
                    stream: Arc::clone(stream),
                },
            );
        }
        for index in 0..self.subscribers.len() {
            let subscriber = self.subscribers[index];
            if subscriber == owner {
                continue;
            }
            if let Some(mailbox) = self.mailboxes.get_mut(&subscriber) {
                mailbox.push(PendingStreams {
                    type_key,
                    streams: streams.clone(),
                    gate: handle.clone(),
                });
            }
        }
        Ok(handle.clone())
    }

    /// Reports that `owner` is done reading `streams`.
    ///
    /// `handle` must complete when the owner's readers have finished.
    /// Releasing a stream the owner does not owe (including releasing
    /// twice) is an error. When the last owing subscriber releases,
    /// the stream's disposal is scheduled against every surrendered
    /// handle and folded into the returned handle.
    pub fn release(
        &mut self,
        owner: SubscriberId,
        streams: &[Arc<EventStream>],
        handle: &TaskHandle,
        pool: &TaskPool,
    ) -> Result<TaskHandle, ShareError> {
        let mut out = vec![handle.clone()];
        for stream in streams {
            let key = stream_key(stream);
            let mut entry = match self.owing.remove(&key) {
                Some(entry) => entry,
                None => return Err(ShareError::NotOwed(owner)),
            };
            if !entry.owed.remove(&owner) {
                self.owing.insert(key, entry);
                return Err(ShareError::NotOwed(owner));
            }
            entry.gates.push(handle.clone());
            if entry.owed.is_empty() {
                // Last one out frees the stream.
                let gate = TaskHandle::combine(&entry.gates);
                out.push(dispose(pool, &gate, entry.stream));
            } else {
                self.owing.insert(key, entry);
            }
        }
        Ok(TaskHandle::combine(&out))
    }

    /// Drains the streams queued for `id` since its last write phase.
    pub fn take_pending(&mut self, id: SubscriberId) -> Vec<PendingStreams> {
        self.mailboxes
            .get_mut(&id)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

impl Default for StreamShare {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn stream_key(stream: &Arc<EventStream>) -> usize {
    Arc::as_ptr(stream) as usize
}

/// Schedules the drop of the final broker-side reference to `stream`.
fn dispose(pool: &TaskPool, gate: &TaskHandle, stream: Arc<EventStream>) -> TaskHandle {
    pool.spawn(std::slice::from_ref(gate), move || {
        tracing::trace!(blocks = stream.block_count(), "disposing shared stream");
        drop(stream);
    })
}
