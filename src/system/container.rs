//! Per-event-type write/read protocol and handle aggregation.

use std::sync::Arc;

use crate::schedule::TaskHandle;
use crate::stream::{EventStream, StreamReader, StreamWriter};

use super::EventError;

/// One write-then-read cycle per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Writing,
    Reading,
}

/// Holds the streams for one event type across one frame cycle.
///
/// Producers open a stream with [`create_stream`] and must balance it
/// with [`add_producer_handle`]; consumers open with [`get_readers`]
/// and balance with [`add_consumer_handle`]. Unbalanced or wrong-mode
/// calls are errors: producers and consumers run asynchronously across
/// many call sites, and an unbalanced pair is the classic source of
/// use-after-free and lost-dependency bugs here, so the container
/// refuses instead of guessing.
///
/// [`create_stream`]: EventContainer::create_stream
/// [`add_producer_handle`]: EventContainer::add_producer_handle
/// [`get_readers`]: EventContainer::get_readers
/// [`add_consumer_handle`]: EventContainer::add_consumer_handle
pub struct EventContainer {
    mode: Mode,
    streams: Vec<Arc<EventStream>>,
    external: Vec<Arc<EventStream>>,
    /// Reader source list frozen at `set_read_mode`: owned streams in
    /// creation order, then external streams in arrival order. The
    /// order is observable; consumers index readers positionally.
    snapshot: Vec<Arc<EventStream>>,
    producer_handle: TaskHandle,
    consumer_handle: TaskHandle,
    producer_open: bool,
    consumer_open: bool,
}

impl EventContainer {
    pub fn new() -> Self {
        Self {
            mode: Mode::Idle,
            streams: Vec::new(),
            external: Vec::new(),
            snapshot: Vec::new(),
            producer_handle: TaskHandle::ready(),
            consumer_handle: TaskHandle::ready(),
            producer_open: false,
            consumer_open: false,
        }
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.mode == Mode::Reading
    }

    /// Creates a fresh stream for this frame's events and returns its
    /// lane writers. Enters write mode from idle.
    pub fn create_stream(&mut self, lane_count: u32) -> Result<Vec<StreamWriter>, EventError> {
        if self.producer_open {
            return Err(EventError::UnbalancedProducer);
        }
        if self.mode == Mode::Reading {
            return Err(EventError::WriteModeRequired);
        }
        self.producer_open = true;
        self.mode = Mode::Writing;

        let stream = Arc::new(EventStream::new(lane_count as usize));
        let writers = (0..lane_count)
            .map(|lane| stream.writer(lane))
            .collect::<Result<Vec<_>, _>>()?;
        self.streams.push(stream);
        Ok(writers)
    }

    /// Merges a producer completion handle. Balances [`create_stream`].
    ///
    /// [`create_stream`]: EventContainer::create_stream
    pub fn add_producer_handle(&mut self, handle: TaskHandle) -> Result<(), EventError> {
        if !self.producer_open {
            return Err(EventError::UnbalancedProducer);
        }
        self.producer_open = false;
        self.add_producer_handle_unbalanced(handle)
    }

    /// Merges a producer handle without touching the balance flag, for
    /// callers that pair calls themselves.
    pub fn add_producer_handle_unbalanced(&mut self, handle: TaskHandle) -> Result<(), EventError> {
        if self.mode == Mode::Reading {
            return Err(EventError::WriteModeRequired);
        }
        self.producer_handle = TaskHandle::combine(&[self.producer_handle.clone(), handle]);
        Ok(())
    }

    /// Accepts streams produced by a sibling container. `gate` is the
    /// handle after which the streams are safe to read; it joins the
    /// producer aggregate so readers start no earlier.
    pub fn add_external(
        &mut self,
        streams: Vec<Arc<EventStream>>,
        gate: &TaskHandle,
    ) -> Result<(), EventError> {
        if self.mode == Mode::Reading {
            return Err(EventError::WriteModeRequired);
        }
        self.external.extend(streams);
        self.producer_handle = TaskHandle::combine(&[self.producer_handle.clone(), gate.clone()]);
        Ok(())
    }

    /// Flips to read mode and freezes the reader source list for the
    /// rest of the frame.
    pub fn set_read_mode(&mut self) -> Result<(), EventError> {
        if self.mode == Mode::Reading {
            return Err(EventError::WriteModeRequired);
        }
        self.mode = Mode::Reading;
        self.snapshot.clear();
        self.snapshot
            .extend(self.streams.iter().chain(self.external.iter()).cloned());
        Ok(())
    }

    /// Returns a reader per stream (snapshot order) and the given
    /// handle combined with the producer aggregate, the earliest point
    /// any reader task may start. Balances [`add_consumer_handle`].
    ///
    /// [`add_consumer_handle`]: EventContainer::add_consumer_handle
    pub fn get_readers(
        &mut self,
        input: &TaskHandle,
    ) -> Result<(TaskHandle, Vec<StreamReader>), EventError> {
        if self.consumer_open {
            return Err(EventError::UnbalancedConsumer);
        }
        if self.mode != Mode::Reading {
            return Err(EventError::ReadModeRequired);
        }
        self.consumer_open = true;
        let gate = TaskHandle::combine(&[input.clone(), self.producer_handle.clone()]);
        let readers = self.snapshot.iter().map(|s| s.reader()).collect();
        Ok((gate, readers))
    }

    /// Whether any reader sources exist this frame. Read mode only.
    pub fn has_readers(&self) -> Result<bool, EventError> {
        if self.consumer_open {
            return Err(EventError::UnbalancedConsumer);
        }
        if self.mode != Mode::Reading {
            return Err(EventError::ReadModeRequired);
        }
        Ok(!self.snapshot.is_empty())
    }

    /// Merges a consumer completion handle. Balances [`get_readers`].
    ///
    /// [`get_readers`]: EventContainer::get_readers
    pub fn add_consumer_handle(&mut self, handle: TaskHandle) -> Result<(), EventError> {
        if !self.consumer_open {
            return Err(EventError::UnbalancedConsumer);
        }
        self.consumer_open = false;
        if self.mode != Mode::Reading {
            return Err(EventError::ReadModeRequired);
        }
        self.consumer_handle = TaskHandle::combine(&[self.consumer_handle.clone(), handle]);
        Ok(())
    }

    pub fn producer_handle(&self) -> TaskHandle {
        self.producer_handle.clone()
    }

    pub fn consumer_handle(&self) -> TaskHandle {
        self.consumer_handle.clone()
    }

    pub(crate) fn take_streams(&mut self) -> Vec<Arc<EventStream>> {
        std::mem::take(&mut self.streams)
    }

    pub(crate) fn take_external(&mut self) -> Vec<Arc<EventStream>> {
        std::mem::take(&mut self.external)
    }

    /// Clears the container for the next frame. Stream lifetimes are
    /// not this container's concern: owned streams should have been
    /// handed to the share broker, external ones are the broker's.
    pub fn reset(&mut self) {
        self.mode = Mode::Idle;
        self.streams.clear();
        self.external.clear();
        self.snapshot.clear();
        self.producer_handle = TaskHandle::ready();
        self.consumer_handle = TaskHandle::ready();
        self.producer_open = false;
        self.consumer_open = false;
    }
}

impl Default for EventContainer {
    fn default() -> Self {
        Self::new()
    }
}
