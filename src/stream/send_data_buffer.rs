use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::ring_index::SafeStreamRingIndex;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Identifies a single write on a stream. Ids are allocated per stream, starting at 1.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
pub struct SendRequestId(u64);
impl Display for SendRequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SendStatus {
    Pending,
    /// every byte was confirmed by the receiver
    Confirmed,
    /// the retry budget was exhausted before the data was confirmed
    Failed,
    /// explicitly cancelled, or the stream was closed
    Stopped,
}

/// The application's view of a write. The status changes on later stream updates; it can be polled
///  or awaited.
#[derive(Debug, Clone)]
pub struct SendHandle {
    id: SendRequestId,
    status: watch::Receiver<SendStatus>,
}
impl SendHandle {
    pub fn id(&self) -> SendRequestId {
        self.id
    }

    pub fn status(&self) -> SendStatus {
        *self.status.borrow()
    }

    /// Waits for the write to reach a terminal status. If the stream goes away while the write
    ///  is still pending, it counts as stopped.
    pub async fn completion(&mut self) -> SendStatus {
        loop {
            let status = *self.status.borrow_and_update();
            if status != SendStatus::Pending {
                return status;
            }
            if self.status.changed().await.is_err() {
                return match *self.status.borrow() {
                    SendStatus::Pending => SendStatus::Stopped,
                    status => status,
                };
            }
        }
    }
}

/// One write's bytes, starting at `offset`
#[derive(Debug)]
pub struct SendingData {
    pub id: SendRequestId,
    pub offset: SafeStreamRingIndex,
    pub data: Bytes,
    status: watch::Sender<SendStatus>,
}
impl SendingData {
    pub fn len(&self) -> u32 {
        self.data.len().prechecked_cast()
    }

    pub fn end(&self) -> SafeStreamRingIndex {
        self.offset + self.len()
    }

    fn complete(&self, status: SendStatus) {
        debug!("write {} [{}, {}) completed: {:?}", self.id, self.offset, self.end(), status);
        self.status.send_replace(status);
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StopOutcome {
    Stopped,
    /// some of the data is on the wire already, so the receiver expects it
    AlreadySending,
    /// the write completed or never existed
    NotFound,
}

/// Holds written data from the moment it is handed to the stream until it is confirmed, failed
///  or stopped. Offsets are consecutive across writes. The total number of bytes held is bounded
///  by the buffer capacity, which is less than the ring size, so offsets are compared by their
///  distance from the oldest held byte.
pub struct SendDataBuffer {
    capacity: u32,
    buffered: u32,
    next_id: u64,
    next_offset: SafeStreamRingIndex,
    entries: VecDeque<SendingData>,
}

impl SendDataBuffer {
    pub fn new(capacity: u16, initial_offset: SafeStreamRingIndex) -> SendDataBuffer {
        SendDataBuffer {
            capacity: capacity.safe_cast(),
            buffered: 0,
            next_id: 1,
            next_offset: initial_offset,
            entries: Default::default(),
        }
    }

    /// the offset the next write will start at
    pub fn next_offset(&self) -> SafeStreamRingIndex {
        self.next_offset
    }

    pub fn buffered(&self) -> u32 {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn rel(&self, offset: SafeStreamRingIndex) -> u32 {
        match self.entries.front() {
            Some(front) => front.offset.distance(offset),
            None => 0,
        }
    }

    pub fn add(&mut self, data: &[u8]) -> anyhow::Result<SendHandle> {
        if data.is_empty() {
            bail!("empty write");
        }
        let len: u32 = match u32::try_from(data.len()) {
            Ok(len) if self.buffered.checked_add(len).is_some_and(|total| total <= self.capacity) => len,
            _ => bail!("send buffer capacity exceeded: {} bytes buffered, capacity {}, write of {} bytes", self.buffered, self.capacity, data.len()),
        };

        let id = SendRequestId(self.next_id);
        self.next_id += 1;

        let (status_sender, status_receiver) = watch::channel(SendStatus::Pending);
        let entry = SendingData {
            id,
            offset: self.next_offset,
            data: Bytes::copy_from_slice(data),
            status: status_sender,
        };
        trace!("buffering write {} at [{}, {})", id, entry.offset, entry.end());

        self.next_offset += len;
        self.buffered += len;
        self.entries.push_back(entry);

        Ok(SendHandle {
            id,
            status: status_receiver,
        })
    }

    /// Copies `len` bytes starting at `begin`, which may span several writes. The range must be
    ///  held by the buffer.
    pub fn slice(&self, begin: SafeStreamRingIndex, len: u32) -> Bytes {
        let rel_begin = self.rel(begin);
        let rel_end = rel_begin + len;

        let mut parts = self.entries.iter()
            .filter_map(|entry| {
                let entry_begin = self.rel(entry.offset);
                let entry_end = entry_begin + entry.len();
                let from = rel_begin.max(entry_begin);
                let to = rel_end.min(entry_end);
                if from >= to {
                    return None;
                }
                let slice_from: usize = (from - entry_begin).safe_cast();
                let slice_to: usize = (to - entry_begin).safe_cast();
                Some(entry.data.slice(slice_from..slice_to))
            });

        let first = parts.next().unwrap_or_default();
        match parts.next() {
            None => first,
            Some(second) => {
                let mut joined = BytesMut::with_capacity(len.safe_cast());
                joined.extend_from_slice(&first);
                joined.extend_from_slice(&second);
                for part in parts {
                    joined.extend_from_slice(&part);
                }
                joined.freeze()
            }
        }
    }

    /// Completes all writes that end at or before `up_to`
    pub fn confirm(&mut self, up_to: SafeStreamRingIndex) {
        let base = match self.entries.front() {
            Some(front) => front.offset,
            None => return,
        };
        let rel_up_to = base.distance(up_to);
        while let Some(front) = self.entries.front() {
            if base.distance(front.end()) > rel_up_to {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                self.buffered -= entry.len();
                entry.complete(SendStatus::Confirmed);
            }
        }
    }

    /// Fails every write that overlaps `[begin, end)` and returns their ranges. Offsets of the
    ///  remaining writes do not change, so the failed data leaves a gap.
    pub fn fail_overlapping(&mut self, begin: SafeStreamRingIndex, end: SafeStreamRingIndex) -> Vec<(SafeStreamRingIndex, SafeStreamRingIndex)> {
        let Some(base) = self.entries.front().map(|e| e.offset) else {
            return Vec::new();
        };
        let rel_begin = base.distance(begin);
        let rel_end = rel_begin + begin.distance(end);

        let mut failed = Vec::new();
        let mut buffered = self.buffered;
        self.entries.retain(|entry| {
            let entry_begin = base.distance(entry.offset);
            let entry_end = entry_begin + entry.len();
            if entry_begin >= rel_end || entry_end <= rel_begin {
                return true;
            }
            buffered -= entry.len();
            entry.complete(SendStatus::Failed);
            failed.push((entry.offset, entry.end()));
            false
        });
        self.buffered = buffered;
        failed
    }

    /// Stops a write, provided none of its bytes were sent yet, i.e. it starts at or after
    ///  `first_unsent`. Later writes move down to close the gap, and the offset of the next write
    ///  moves down accordingly.
    pub fn stop(&mut self, id: SendRequestId, first_unsent: SafeStreamRingIndex) -> StopOutcome {
        let Some(idx) = self.entries.iter().position(|e| e.id == id) else {
            return StopOutcome::NotFound;
        };
        if self.rel(self.entries[idx].offset) < self.rel(first_unsent) {
            return StopOutcome::AlreadySending;
        }

        let Some(entry) = self.entries.remove(idx) else {
            return StopOutcome::NotFound;
        };
        let len = entry.len();
        for later in self.entries.iter_mut().skip(idx) {
            later.offset -= len;
        }
        self.next_offset -= len;
        self.buffered -= len;
        entry.complete(SendStatus::Stopped);
        StopOutcome::Stopped
    }

    /// completes every held write with `Stopped`
    pub fn stop_all(&mut self) {
        for entry in self.entries.drain(..) {
            entry.complete(SendStatus::Stopped);
        }
        self.buffered = 0;
    }
}
