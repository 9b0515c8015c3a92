use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::trace;

use crate::offset_range::{OffsetPosition, OffsetRange};
use crate::ring_index::SafeStreamRingIndex;

/// A range of bytes that was transmitted at least once and is not confirmed yet, covering the
///  half-open interval `[begin_offset, end_offset)`
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SendingChunk {
    pub begin_offset: SafeStreamRingIndex,
    pub end_offset: SafeStreamRingIndex,
    pub repeat_count: u16,
    pub send_time: Instant,
}

impl SendingChunk {
    pub fn len(&self) -> u32 {
        self.begin_offset.distance(self.end_offset)
    }

    fn range(&self, window_size: u32) -> OffsetRange {
        OffsetRange::from_half_open(self.begin_offset, self.end_offset, window_size)
    }
}

/// The in-flight chunks of a stream. Chunks never overlap, and they are ordered by the time they
///  were last sent: the front is the chunk that has waited for confirmation longest.
pub struct SendingChunkList {
    window_size: u32,
    chunks: VecDeque<SendingChunk>,
}

impl SendingChunkList {
    pub fn new(window_size: u32) -> SendingChunkList {
        SendingChunkList {
            window_size,
            chunks: Default::default(),
        }
    }

    /// Records that `[begin, end)` was sent at `send_time`, returning the chunk representing it.
    ///
    /// If the range matches an existing chunk exactly, that chunk is refreshed. If an existing
    ///  chunk starts inside the range, it takes the range's bounds and keeps its repeat count;
    ///  otherwise a new chunk with repeat count 0 is created. Any other chunk overlapping the
    ///  range is clipped, split around it or removed. Either way, the resulting chunk moves to
    ///  the back of the list.
    pub fn register(&mut self, begin: SafeStreamRingIndex, end: SafeStreamRingIndex, send_time: Instant) -> &mut SendingChunk {
        let range = OffsetRange::from_half_open(begin, end, self.window_size);

        let matching = self.chunks.iter()
            .position(|c| range.in_range(c.begin_offset));

        let repeat_count = match matching {
            Some(idx) if self.chunks[idx].begin_offset == begin && self.chunks[idx].end_offset == end => {
                trace!("refreshing chunk [{}, {})", begin, end);
                if let Some(mut chunk) = self.chunks.remove(idx) {
                    chunk.send_time = send_time;
                    self.chunks.push_back(chunk);
                }
                return self.back_mut();
            }
            Some(idx) => self.chunks[idx].repeat_count,
            None => 0,
        };

        trace!("registering chunk [{}, {}) with repeat count {}", begin, end, repeat_count);
        self.clear_range(range);
        self.chunks.push_back(SendingChunk {
            begin_offset: begin,
            end_offset: end,
            repeat_count,
            send_time,
        });
        self.back_mut()
    }

    fn back_mut(&mut self) -> &mut SendingChunk {
        let last = self.chunks.len() - 1;
        &mut self.chunks[last]
    }

    /// removes everything inside `range` from the existing chunks
    fn clear_range(&mut self, range: OffsetRange) {
        let end = range.end.next();
        let mut cleared = VecDeque::with_capacity(self.chunks.len() + 1);

        for chunk in self.chunks.drain(..) {
            let first = range.classify(chunk.begin_offset);
            let last = range.classify(chunk.end_offset.prev());

            match (first, last) {
                (OffsetPosition::InRange, OffsetPosition::InRange) => {
                    trace!("dropping chunk [{}, {}): covered by [{}, {})", chunk.begin_offset, chunk.end_offset, range.begin, end);
                }
                (OffsetPosition::InRange, _) => {
                    cleared.push_back(SendingChunk { begin_offset: end, ..chunk });
                }
                (OffsetPosition::Before, OffsetPosition::InRange) => {
                    cleared.push_back(SendingChunk { end_offset: range.begin, ..chunk });
                }
                (OffsetPosition::Before, OffsetPosition::After) => {
                    trace!("splitting chunk [{}, {}) around [{}, {})", chunk.begin_offset, chunk.end_offset, range.begin, end);
                    cleared.push_back(SendingChunk { end_offset: range.begin, ..chunk });
                    cleared.push_back(SendingChunk { begin_offset: end, ..chunk });
                }
                _ => cleared.push_back(chunk),
            }
        }
        self.chunks = cleared;
    }

    /// Everything before `offset` is confirmed: drops chunks that end at or before it, and
    ///  trims a chunk that straddles it.
    pub fn remove_up_to(&mut self, offset: SafeStreamRingIndex) {
        let window_size = self.window_size;
        self.chunks.retain_mut(|chunk| {
            match chunk.range(window_size).classify(offset) {
                OffsetPosition::After => false,
                OffsetPosition::InRange => {
                    chunk.begin_offset = offset;
                    chunk.begin_offset != chunk.end_offset
                }
                OffsetPosition::Before => true,
            }
        });
    }

    /// the chunk containing `offset`, if any
    pub fn find_containing(&self, offset: SafeStreamRingIndex) -> Option<&SendingChunk> {
        self.chunks.iter()
            .find(|c| c.range(self.window_size).in_range(offset))
    }

    pub fn find_containing_mut(&mut self, offset: SafeStreamRingIndex) -> Option<&mut SendingChunk> {
        let window_size = self.window_size;
        self.chunks.iter_mut()
            .find(|c| c.range(window_size).in_range(offset))
    }

    /// Removes `[begin, end)` from the in-flight chunks. Chunks reaching into the range from
    ///  either side are clipped, so bytes outside the range stay in flight.
    pub fn remove_range(&mut self, begin: SafeStreamRingIndex, end: SafeStreamRingIndex) {
        if begin != end {
            self.clear_range(OffsetRange::from_half_open(begin, end, self.window_size));
        }
    }

    pub fn front(&self) -> Option<&SendingChunk> {
        self.chunks.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendingChunk> {
        self.chunks.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}
