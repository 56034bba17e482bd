//! Per-context event façade: one container per event type, wired to a
//! [`StreamShare`] for cross-system sharing.

mod container;
mod share;

pub use container::EventContainer;
pub use share::{PendingStreams, ShareError, StreamShare, SubscriberId};

use std::any::TypeId;
use std::collections::hash_map::Entry;

use fxhash::FxHashMap;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::schedule::{TaskHandle, TaskPool};
use crate::stream::{StreamError, StreamReader, StreamWriter};

/// A plain-data event record: fixed layout, no pointers, safe to copy
/// between lanes and threads byte-for-byte.
pub trait Event: IntoBytes + FromBytes + Immutable + KnownLayout + Send + Sync + 'static {}

impl<T> Event for T where T: IntoBytes + FromBytes + Immutable + KnownLayout + Send + Sync + 'static {}

/// Event protocol went wrong. Producer/consumer call sites are spread
/// across systems and frames; every variant here is a wiring bug that
/// would otherwise surface as intermittent corruption, so nothing is
/// silently repaired.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    #[error("create_writers must be balanced by an add_producer_handle call")]
    UnbalancedProducer,
    #[error("get_readers must be balanced by an add_consumer_handle call")]
    UnbalancedConsumer,
    #[error("only legal in read mode")]
    ReadModeRequired,
    #[error("not legal in read mode")]
    WriteModeRequired,
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Share(#[from] ShareError),
}

/// One subsystem's view of the frame's events.
///
/// Containers are created on first use of an event type and live until
/// shutdown; [`update`] recycles them every frame. Several systems can
/// coexist on one [`StreamShare`]; each sees the others' events of the
/// types it reads, one frame after they were produced.
///
/// [`update`]: EventSystem::update
pub struct EventSystem {
    id: SubscriberId,
    containers: FxHashMap<TypeId, EventContainer>,
    /// Container creation order; map iteration order would make frame
    /// updates nondeterministic.
    order: Vec<TypeId>,
}

impl EventSystem {
    pub fn new(share: &mut StreamShare) -> Self {
        Self {
            id: share.subscribe(),
            containers: FxHashMap::default(),
            order: Vec::new(),
        }
    }

    #[inline]
    pub fn subscriber_id(&self) -> SubscriberId {
        self.id
    }

    /// Opens a fresh stream for `E` and returns one writer per lane.
    /// Balance with [`add_producer_handle`].
    ///
    /// [`add_producer_handle`]: EventSystem::add_producer_handle
    pub fn create_writers<E: Event>(
        &mut self,
        lane_count: u32,
    ) -> Result<Vec<StreamWriter>, EventError> {
        self.container(TypeId::of::<E>()).create_stream(lane_count)
    }

    /// Merges the handle covering all writers from the matching
    /// [`create_writers`] call.
    ///
    /// [`create_writers`]: EventSystem::create_writers
    pub fn add_producer_handle<E: Event>(&mut self, handle: TaskHandle) -> Result<(), EventError> {
        self.container(TypeId::of::<E>()).add_producer_handle(handle)
    }

    /// Readers over every stream of `E` this frame (own streams first,
    /// then streams shared in by sibling systems), plus the handle
    /// reader tasks must depend on. Flips the container to read mode on
    /// first call. Balance with [`add_consumer_handle`].
    ///
    /// [`add_consumer_handle`]: EventSystem::add_consumer_handle
    pub fn get_readers<E: Event>(
        &mut self,
        input: &TaskHandle,
    ) -> Result<(TaskHandle, Vec<StreamReader>), EventError> {
        let container = self.container(TypeId::of::<E>());
        if !container.is_reading() {
            container.set_read_mode()?;
        }
        container.get_readers(input)
    }

    /// Whether any events of `E` exist to read this frame. Flips to
    /// read mode like [`get_readers`].
    ///
    /// [`get_readers`]: EventSystem::get_readers
    pub fn has_readers<E: Event>(&mut self) -> Result<bool, EventError> {
        let container = self.container(TypeId::of::<E>());
        if !container.is_reading() {
            container.set_read_mode()?;
        }
        container.has_readers()
    }

    /// Merges the handle covering all reader tasks from the matching
    /// [`get_readers`] call.
    ///
    /// [`get_readers`]: EventSystem::get_readers
    pub fn add_consumer_handle<E: Event>(&mut self, handle: TaskHandle) -> Result<(), EventError> {
        self.container(TypeId::of::<E>()).add_consumer_handle(handle)
    }

    /// Schedules `consume` once per stream of `E`, gated on the merged
    /// producer handle, and registers the combined handle as this
    /// system's consumer handle. The closure receives the stream's
    /// position in reader order and its reader.
    pub fn schedule_consumer<E, F>(
        &mut self,
        pool: &TaskPool,
        input: &TaskHandle,
        consume: F,
    ) -> Result<TaskHandle, EventError>
    where
        E: Event,
        F: Fn(usize, StreamReader) + Send + Sync + Clone + 'static,
    {
        let (gate, readers) = self.get_readers::<E>(input)?;
        let mut handles = Vec::with_capacity(readers.len());
        for (index, reader) in readers.into_iter().enumerate() {
            let consume = consume.clone();
            handles.push(pool.spawn(std::slice::from_ref(&gate), move || {
                consume(index, reader);
            }));
        }
        let handle = TaskHandle::combine(&handles);
        self.add_consumer_handle::<E>(handle.clone())?;
        Ok(handle)
    }

    /// Frame boundary. For every container, in creation order: hand the
    /// frame's own streams to the broker, release the externally-shared
    /// ones, and reset; then accept the streams sibling systems shared
    /// since last time, to be read next cycle. Returns the combined
    /// handle for everything this frame set in motion.
    pub fn update(
        &mut self,
        share: &mut StreamShare,
        pool: &TaskPool,
    ) -> Result<TaskHandle, EventError> {
        let mut frame = Vec::new();
        for key in &self.order {
            let container = match self.containers.get_mut(key) {
                Some(container) => container,
                None => continue,
            };
            // A container whose events were never consumed this frame
            // has a trivial consumer aggregate; combining in the
            // producer aggregate keeps sharing and disposal behind the
            // writers in that case too.
            let gate = TaskHandle::combine(&[
                container.producer_handle(),
                container.consumer_handle(),
            ]);
            let streams = container.take_streams();
            let external = container.take_external();
            container.reset();

            frame.push(share.distribute(self.id, *key, streams, &gate, pool)?);
            if !external.is_empty() {
                frame.push(share.release(self.id, &external, &gate, pool)?);
            }
        }

        for pending in share.take_pending(self.id) {
            let PendingStreams {
                type_key,
                streams,
                gate,
            } = pending;
            self.container(type_key).add_external(streams, &gate)?;
        }

        Ok(TaskHandle::combine(&frame))
    }

    /// Tears the system down: disposes still-owned streams, releases
    /// every outstanding external debt, and unsubscribes. Fails if the
    /// system cannot settle its debts, which means a protocol bug
    /// elsewhere.
    pub fn shutdown(
        mut self,
        share: &mut StreamShare,
        pool: &TaskPool,
    ) -> Result<TaskHandle, EventError> {
        let mut frame = Vec::new();
        for key in &self.order {
            let container = match self.containers.get_mut(key) {
                Some(container) => container,
                None => continue,
            };
            let gate = TaskHandle::combine(&[
                container.producer_handle(),
                container.consumer_handle(),
            ]);
            for stream in container.take_streams() {
                frame.push(pool.spawn(std::slice::from_ref(&gate), move || drop(stream)));
            }
            let external = container.take_external();
            if !external.is_empty() {
                frame.push(share.release(self.id, &external, &gate, pool)?);
            }
            container.reset();
        }

        // Streams delivered but never yet accepted into a container are
        // still owed; settle them before leaving.
        for pending in share.take_pending(self.id) {
            frame.push(share.release(self.id, &pending.streams, &pending.gate, pool)?);
        }

        share.unsubscribe(self.id)?;
        tracing::debug!(subscriber = ?self.id, "event system shut down");
        Ok(TaskHandle::combine(&frame))
    }

    fn container(&mut self, key: TypeId) -> &mut EventContainer {
        match self.containers.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.order.push(key);
                entry.insert(EventContainer::new())
            }
        }
    }
}

impl core::fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSystem")
            .field("subscriber", &self.id)
            .field("event_types", &self.order.len())
            .finish()
    }
}
