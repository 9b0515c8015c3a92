use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::action::{earliest, Action, ActionStatus};
use crate::api::SafeStreamMessage;
use crate::config::SafeStreamConfig;
use crate::ring_index::SafeStreamRingIndex;
use crate::stream::OutgoingMessage;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReceiveError {
    /// the gap starting at `offset` was requested the maximum number of times without being
    ///  filled, so the stream can not continue past it
    RepeatCountExceeded { offset: SafeStreamRingIndex },
}
impl Display for ReceiveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveError::RepeatCountExceeded { offset } => write!(f, "missing data at offset {} was not resent", offset),
        }
    }
}
impl std::error::Error for ReceiveError {}

#[derive(Debug)]
struct ReceivingChunk {
    offset: SafeStreamRingIndex,
    data: Bytes,
}
impl ReceivingChunk {
    fn len(&self) -> u32 {
        self.data.len().prechecked_cast()
    }
}

/// a gap in the received data, starting at `offset`
#[derive(Debug)]
struct ExpectedChunk {
    offset: SafeStreamRingIndex,
    repeat_count: u16,
    since: Instant,
    last_request: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum AddOutcome {
    Stored,
    Duplicate,
    /// all of the data was delivered already
    Late,
    OutOfWindow,
}

/// The receiving half of a stream.
///
/// Fragments are held until they join the contiguous prefix of the stream; each contiguous run is
///  delivered exactly once, in order. The receiver confirms the end of the delivered prefix and
///  asks for gaps that stay open too long.
pub struct SafeStreamReceivingAction {
    config: Arc<SafeStreamConfig>,
    window_size: u32,

    /// the next offset to be delivered
    last_confirmed_offset: SafeStreamRingIndex,
    /// sorted by offset, non-overlapping, all after `last_confirmed_offset`
    received_chunks: Vec<ReceivingChunk>,
    expected_chunks: Vec<ExpectedChunk>,

    pending_confirm: Option<SafeStreamRingIndex>,
    last_confirm_sent: Option<Instant>,
    repeat_requests: Vec<SafeStreamRingIndex>,
    failure: Option<ReceiveError>,

    received: VecDeque<Bytes>,
    outgoing: Vec<OutgoingMessage>,
}

impl SafeStreamReceivingAction {
    pub fn new(config: Arc<SafeStreamConfig>) -> SafeStreamReceivingAction {
        SafeStreamReceivingAction {
            window_size: config.window_size.safe_cast(),
            last_confirmed_offset: SafeStreamRingIndex::ZERO,
            received_chunks: Default::default(),
            expected_chunks: Default::default(),
            pending_confirm: None,
            last_confirm_sent: None,
            repeat_requests: Default::default(),
            failure: None,
            received: Default::default(),
            outgoing: Default::default(),
            config,
        }
    }

    pub fn receive_send(&mut self, offset: SafeStreamRingIndex, data: Bytes, now: Instant) {
        trace!("received data [{}, +{})", offset, data.len());
        self.add_data_chunk(offset, data, now);
    }

    pub fn receive_repeat(&mut self, offset: SafeStreamRingIndex, repeat_count: u16, data: Bytes, now: Instant) {
        trace!("received repeated data [{}, +{}), repeat count {}", offset, data.len(), repeat_count);
        if self.add_data_chunk(offset, data, now) == AddOutcome::Late {
            // the sender evidently missed the confirmation
            self.pending_confirm = Some(self.last_confirmed_offset.prev());
        }
    }

    /// the last offset that was delivered, which is what a `Confirm` or `PutReport` carries
    pub fn confirmed_offset(&self) -> SafeStreamRingIndex {
        self.last_confirmed_offset.prev()
    }

    /// contiguous runs of data in stream order, each byte exactly once
    pub fn drain_received(&mut self) -> Vec<Bytes> {
        self.received.drain(..).collect()
    }

    pub fn drain_outgoing(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.outgoing)
    }

    fn rel(&self, offset: SafeStreamRingIndex) -> u32 {
        self.last_confirmed_offset.distance(offset)
    }

    fn add_data_chunk(&mut self, offset: SafeStreamRingIndex, mut data: Bytes, now: Instant) -> AddOutcome {
        if self.failure.is_some() {
            trace!("receiving side failed - dropping data at offset {}", offset);
            return AddOutcome::OutOfWindow;
        }
        if data.is_empty() {
            return AddOutcome::Duplicate;
        }

        let mut rel_begin = self.rel(offset);
        if rel_begin >= self.window_size {
            let behind: usize = offset.distance(self.last_confirmed_offset).safe_cast();
            if behind > self.window_size.safe_cast() {
                debug!("data at offset {} is outside the receive window starting at {} - dropping", offset, self.last_confirmed_offset);
                return AddOutcome::OutOfWindow;
            }
            if behind >= data.len() {
                debug!("data [{}, +{}) was delivered already - dropping", offset, data.len());
                return AddOutcome::Late;
            }
            trace!("data at offset {} overlaps delivered data - keeping the last {} bytes", offset, data.len() - behind);
            data = data.slice(behind..);
            rel_begin = 0;
        }

        let room: usize = (self.window_size - rel_begin).safe_cast();
        if data.len() > room {
            debug!("data [{}, +{}) reaches beyond the receive window - keeping the first {} bytes", offset, data.len(), room);
            data.truncate(room);
        }
        let len: u32 = data.len().prechecked_cast();
        let rel_end = rel_begin + len;

        // the parts of the new data that are not held already
        let mut pieces = Vec::new();
        let mut cursor = rel_begin;
        for chunk in &self.received_chunks {
            let chunk_begin = self.rel(chunk.offset);
            let chunk_end = chunk_begin + chunk.len();
            if chunk_end <= cursor {
                continue;
            }
            if chunk_begin >= rel_end {
                break;
            }
            if chunk_begin > cursor {
                pieces.push((cursor, chunk_begin));
            }
            cursor = cursor.max(chunk_end);
        }
        if cursor < rel_end {
            pieces.push((cursor, rel_end));
        }

        if pieces.is_empty() {
            debug!("data [{}, +{}) is a duplicate - dropping", offset, data.len());
            return AddOutcome::Duplicate;
        }

        for (from, to) in pieces {
            let slice_from: usize = (from - rel_begin).safe_cast();
            let slice_to: usize = (to - rel_begin).safe_cast();
            self.received_chunks.push(ReceivingChunk {
                offset: self.last_confirmed_offset + from,
                data: data.slice(slice_from..slice_to),
            });
        }
        let frontier = self.last_confirmed_offset;
        self.received_chunks.sort_by_key(|c| frontier.distance(c.offset));

        self.refresh_expected(now);
        AddOutcome::Stored
    }

    /// Brings the expected chunks in line with the gaps between the received chunks. Gaps that
    ///  were known before keep their repeat count.
    fn refresh_expected(&mut self, now: Instant) {
        let mut gaps = Vec::new();
        let mut cursor = self.last_confirmed_offset;
        for chunk in &self.received_chunks {
            if chunk.offset != cursor {
                gaps.push(cursor);
            }
            cursor = chunk.offset + chunk.len();
        }

        self.expected_chunks.retain(|e| gaps.contains(&e.offset));
        for gap in gaps {
            if !self.expected_chunks.iter().any(|e| e.offset == gap) {
                trace!("missing data at offset {}", gap);
                self.expected_chunks.push(ExpectedChunk {
                    offset: gap,
                    repeat_count: 0,
                    since: now,
                    last_request: None,
                });
            }
        }
    }

    fn deliver_completed_chains(&mut self) {
        let mut num_contiguous = 0;
        let mut cursor = self.last_confirmed_offset;
        for chunk in &self.received_chunks {
            if chunk.offset != cursor {
                break;
            }
            cursor = chunk.offset + chunk.len();
            num_contiguous += 1;
        }
        if num_contiguous == 0 {
            return;
        }

        let mut chain = self.received_chunks.drain(..num_contiguous).collect::<Vec<_>>();
        let run = if chain.len() == 1 {
            chain.pop().map(|c| c.data).unwrap_or_default()
        }
        else {
            let mut joined = BytesMut::new();
            for chunk in chain {
                joined.extend_from_slice(&chunk.data);
            }
            joined.freeze()
        };

        trace!("delivering [{}, {})", self.last_confirmed_offset, cursor);
        self.received.push_back(run);
        self.last_confirmed_offset = cursor;
        self.pending_confirm = Some(cursor.prev());

        let frontier = self.last_confirmed_offset;
        let window_size = self.window_size;
        self.expected_chunks.retain(|e| frontier.distance(e.offset) < window_size);
    }

    fn check_missed_offsets(&mut self, now: Instant) {
        let timeout = self.config.send_repeat_timeout;
        for expected in &mut self.expected_chunks {
            let due = expected.last_request.unwrap_or(expected.since) + timeout;
            if now < due {
                continue;
            }

            if expected.repeat_count >= self.config.max_repeat_count {
                error!("data at offset {} is still missing after {} repeat requests - giving up", expected.offset, expected.repeat_count);
                self.failure = Some(ReceiveError::RepeatCountExceeded { offset: expected.offset });
                return;
            }
            expected.repeat_count += 1;
            expected.last_request = Some(now);
            trace!("requesting repeat of offset {} (#{})", expected.offset, expected.repeat_count);
            self.repeat_requests.push(expected.offset);
        }
    }

    fn flush_responses(&mut self, now: Instant) {
        let confirm_due = self.last_confirm_sent
            .map_or(true, |t| t + self.config.send_confirm_timeout <= now);

        if confirm_due {
            if let Some(offset) = self.pending_confirm.take() {
                self.outgoing.push(OutgoingMessage { message: SafeStreamMessage::Confirm { offset }, time: now });
                self.last_confirm_sent = Some(now);
            }
        }
        for offset in self.repeat_requests.drain(..) {
            self.outgoing.push(OutgoingMessage { message: SafeStreamMessage::RequestRepeat { offset }, time: now });
        }
    }

    fn next_update(&self) -> Option<Instant> {
        let confirm = self.pending_confirm
            .and(self.last_confirm_sent)
            .map(|t| t + self.config.send_confirm_timeout);
        let repeat = self.expected_chunks.iter()
            .map(|e| e.last_request.unwrap_or(e.since) + self.config.send_repeat_timeout)
            .min();
        earliest(confirm, repeat)
    }
}

impl Action for SafeStreamReceivingAction {
    type Error = ReceiveError;

    fn update(&mut self, now: Instant) -> ActionStatus<ReceiveError> {
        if let Some(failure) = self.failure {
            return ActionStatus::Failed(failure);
        }

        self.deliver_completed_chains();
        self.check_missed_offsets(now);
        if let Some(failure) = self.failure {
            self.repeat_requests.clear();
            self.flush_responses(now);
            return ActionStatus::Failed(failure);
        }
        self.flush_responses(now);

        ActionStatus::Pending {
            next_update: self.next_update(),
        }
    }
}
