use std::cmp::min;
use std::collections::VecDeque;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::action::{Action, ActionStatus};
use crate::api::SafeStreamMessage;
use crate::config::SafeStreamConfig;
use crate::ring_index::SafeStreamRingIndex;
use crate::stream::send_data_buffer::{SendDataBuffer, SendHandle, SendRequestId, StopOutcome};
use crate::stream::sending_chunk_list::SendingChunkList;
use crate::stream::OutgoingMessage;
use crate::util::safe_converter::SafeCast;

/// The sending half of a stream.
///
/// Written data gets consecutive offsets and is transmitted in slices of at most `max_data_size`
///  bytes, but never more than `window_size` bytes beyond the first unconfirmed offset. Chunks
///  that are not confirmed within `wait_confirm_timeout` are sent again as `Repeat`, and so are
///  chunks the receiver requests explicitly.
pub struct SafeStreamSendingAction {
    config: Arc<SafeStreamConfig>,
    max_data_size: u32,

    buffer: SendDataBuffer,
    chunks: SendingChunkList,
    /// offsets to resend from on the next update, and whether the resend raises the repeat count
    repeat_queue: VecDeque<(SafeStreamRingIndex, bool)>,

    /// the first offset that is not confirmed yet
    last_confirmed: SafeStreamRingIndex,
    /// the first offset that was never transmitted
    next_to_send: SafeStreamRingIndex,

    outgoing: Vec<OutgoingMessage>,
}

impl SafeStreamSendingAction {
    pub fn new(config: Arc<SafeStreamConfig>) -> SafeStreamSendingAction {
        SafeStreamSendingAction {
            max_data_size: config.max_data_size.safe_cast(),
            buffer: SendDataBuffer::new(config.buffer_capacity, SafeStreamRingIndex::ZERO),
            chunks: SendingChunkList::new(config.window_size.safe_cast()),
            repeat_queue: Default::default(),
            last_confirmed: SafeStreamRingIndex::ZERO,
            next_to_send: SafeStreamRingIndex::ZERO,
            outgoing: Default::default(),
            config,
        }
    }

    /// Buffers `data` for sending. The returned handle completes on a later call, once all of
    ///  `data` is confirmed or it can no longer be delivered.
    pub fn send_data(&mut self, data: &[u8]) -> anyhow::Result<SendHandle> {
        self.buffer.add(data)
    }

    /// The receiver has everything up to and including `offset`
    pub fn confirm(&mut self, offset: SafeStreamRingIndex) {
        let confirmed_end = offset.next();
        let advance = self.last_confirmed.distance(confirmed_end);
        let in_flight = self.last_confirmed.distance(self.next_to_send);

        if advance == 0 {
            trace!("confirmation of offset {} is a duplicate - ignoring", offset);
            return;
        }
        if advance > in_flight {
            debug!("confirmation of offset {} is outside the range of sent data [{}, {}) - ignoring", offset, self.last_confirmed, self.next_to_send);
            return;
        }

        trace!("confirmed up to offset {}", offset);
        self.last_confirmed = confirmed_end;
        self.chunks.remove_up_to(confirmed_end);
        self.buffer.confirm(confirmed_end);
    }

    /// The receiver is missing data starting at `offset`: it is resent on the next update,
    ///  regardless of the confirmation timeout
    pub fn request_repeat_send(&mut self, offset: SafeStreamRingIndex) {
        if self.is_repeat_scheduled(offset) {
            trace!("repeat of offset {} is already scheduled", offset);
            return;
        }

        match self.chunks.find_containing(offset) {
            Some(chunk) => {
                trace!("scheduling repeat of offset {} in chunk [{}, {})", offset, chunk.begin_offset, chunk.end_offset);
                self.repeat_queue.push_back((offset, true));
            }
            None => {
                debug!("repeat requested for offset {} which is not in flight - ignoring", offset);
            }
        }
    }

    /// Cancels a write that has not started transmission yet. Returns false if some of its data
    ///  was sent already, or if it completed already.
    pub fn stop(&mut self, id: SendRequestId) -> bool {
        match self.buffer.stop(id, self.next_to_send) {
            StopOutcome::Stopped => true,
            StopOutcome::AlreadySending => {
                warn!("write {} is partially sent already - can not stop it", id);
                false
            }
            StopOutcome::NotFound => {
                debug!("write {} is not pending - nothing to stop", id);
                false
            }
        }
    }

    /// stops all pending writes and forgets everything in flight
    pub fn stop_all(&mut self) {
        self.buffer.stop_all();
        self.chunks.clear();
        self.repeat_queue.clear();
        self.next_to_send = self.buffer.next_offset();
        self.last_confirmed = self.next_to_send;
    }

    pub fn set_max_data_size(&mut self, max_data_size: u16) -> anyhow::Result<()> {
        if max_data_size == 0 || max_data_size > self.config.window_size {
            anyhow::bail!("max data size must be in 1..={}, was {}", self.config.window_size, max_data_size);
        }
        debug!("max data size changed from {} to {}", self.max_data_size, max_data_size);
        self.max_data_size = max_data_size.safe_cast();
        Ok(())
    }

    pub fn drain_outgoing(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.outgoing)
    }

    /// true if written data is neither confirmed nor completed otherwise
    pub fn has_pending_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn is_repeat_scheduled(&self, offset: SafeStreamRingIndex) -> bool {
        self.repeat_queue.iter().any(|(o, _)| *o == offset)
    }

    fn handle_timeouts(&mut self, now: Instant) {
        let timeout = self.config.wait_confirm_timeout;
        let expired = self.chunks.iter()
            .filter(|c| c.send_time + timeout <= now)
            .map(|c| c.begin_offset)
            .filter(|offset| !self.is_repeat_scheduled(*offset))
            .collect::<Vec<_>>();

        for offset in expired {
            let Some(chunk) = self.chunks.find_containing_mut(offset) else {
                // evicted along with a failed write
                continue;
            };
            if chunk.begin_offset != offset {
                continue;
            }

            chunk.repeat_count = chunk.repeat_count.saturating_add(1);
            if chunk.repeat_count > self.config.max_repeat_count {
                error!("chunk [{}, {}) is still unconfirmed after {} retransmissions - failing", chunk.begin_offset, chunk.end_offset, self.config.max_repeat_count);
                let end = chunk.end_offset;
                self.fail_chunk(offset, end);
            }
            else {
                trace!("chunk [{}, {}) timed out - scheduling retransmission #{}", chunk.begin_offset, chunk.end_offset, chunk.repeat_count);
                self.repeat_queue.push_back((offset, false));
            }
        }
    }

    /// Fails the writes overlapping the chunk `[begin, end)` and forgets everything in flight for
    ///  them. Other writes are not affected.
    fn fail_chunk(&mut self, begin: SafeStreamRingIndex, end: SafeStreamRingIndex) {
        for (write_begin, write_end) in self.buffer.fail_overlapping(begin, end) {
            self.chunks.remove_range(write_begin, write_end);
        }

        let chunks = &self.chunks;
        self.repeat_queue.retain(|(offset, _)| chunks.find_containing(*offset).is_some());
    }

    fn send_repeats(&mut self, now: Instant) {
        while let Some((offset, raise_count)) = self.repeat_queue.pop_front() {
            let Some(chunk) = self.chunks.find_containing(offset) else {
                trace!("offset {} is no longer in flight - skipping repeat", offset);
                continue;
            };
            let end = chunk.end_offset;
            let repeat_count = if raise_count {
                chunk.repeat_count.saturating_add(1)
            }
            else {
                chunk.repeat_count
            };

            let mut begin = offset;
            while begin != end {
                let len = min(self.max_data_size, begin.distance(end));
                let slice_end = begin + len;

                let chunk = self.chunks.register(begin, slice_end, now);
                chunk.repeat_count = chunk.repeat_count.max(repeat_count);
                let message = SafeStreamMessage::Repeat {
                    repeat_count: chunk.repeat_count,
                    offset: begin,
                    data: self.buffer.slice(begin, len),
                };
                self.outgoing.push(OutgoingMessage { message, time: now });

                begin = slice_end;
            }
        }
    }

    fn send_new_data(&mut self, now: Instant) {
        let window_size: u32 = self.config.window_size.safe_cast();
        while self.next_to_send != self.buffer.next_offset() {
            let in_flight = self.last_confirmed.distance(self.next_to_send);
            if in_flight >= window_size {
                trace!("send window is full at offset {}", self.next_to_send);
                break;
            }

            let len = min(
                min(self.max_data_size, window_size - in_flight),
                self.next_to_send.distance(self.buffer.next_offset()),
            );
            let begin = self.next_to_send;
            let end = begin + len;

            self.chunks.register(begin, end, now);
            let message = SafeStreamMessage::Send {
                offset: begin,
                data: self.buffer.slice(begin, len),
            };
            self.outgoing.push(OutgoingMessage { message, time: now });
            self.next_to_send = end;
        }
    }

    fn next_timeout(&self) -> Option<Instant> {
        self.chunks.iter()
            .map(|c| c.send_time + self.config.wait_confirm_timeout)
            .min()
    }
}

impl Action for SafeStreamSendingAction {
    type Error = ();

    fn update(&mut self, now: Instant) -> ActionStatus<()> {
        self.handle_timeouts(now);
        self.send_repeats(now);
        self.send_new_data(now);

        ActionStatus::Pending {
            next_update: self.next_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::send_data_buffer::SendStatus;
    use crate::test_util::*;
    use rstest::*;
    use std::time::Duration;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn sending_with(modifier: impl FnOnce(&mut SafeStreamConfig)) -> SafeStreamSendingAction {
        let mut config = test_config();
        modifier(&mut config);
        SafeStreamSendingAction::new(Arc::new(config))
    }

    fn sending() -> SafeStreamSendingAction {
        sending_with(|_| {})
    }

    fn update(sending: &mut SafeStreamSendingAction, now: Instant) -> Vec<SafeStreamMessage> {
        sending.update(now);
        messages(sending.drain_outgoing())
    }

    #[test]
    fn test_send_and_confirm() {
        let mut sending = sending();
        let t0 = Instant::now();
        let data = test_data(0, 250);

        let handle = sending.send_data(&data).unwrap();
        assert!(sending.drain_outgoing().is_empty());

        assert_eq!(update(&mut sending, t0), vec![
            send(0, &data[..100]),
            send(100, &data[100..200]),
            send(200, &data[200..]),
        ]);
        assert_eq!(handle.status(), SendStatus::Pending);

        sending.confirm(idx(199));
        assert_eq!(handle.status(), SendStatus::Pending);
        sending.confirm(idx(249));
        assert_eq!(handle.status(), SendStatus::Confirmed);
        assert!(!sending.has_pending_data());

        assert!(update(&mut sending, t0 + ms(1000)).is_empty());
    }

    #[test]
    fn test_slices_span_writes() {
        let mut sending = sending();
        let first = sending.send_data(&test_data(0, 60)).unwrap();
        let second = sending.send_data(&test_data(60, 60)).unwrap();

        assert_eq!(update(&mut sending, Instant::now()), vec![
            send(0, &test_data(0, 100)),
            send(100, &test_data(100, 20)),
        ]);

        sending.confirm(idx(99));
        assert_eq!(first.status(), SendStatus::Confirmed);
        assert_eq!(second.status(), SendStatus::Pending);
    }

    #[test]
    fn test_repeat_until_failure() {
        let mut sending = sending();
        let t0 = Instant::now();
        let data = test_data(0, 100);
        let handle = sending.send_data(&data).unwrap();

        assert_eq!(update(&mut sending, t0), vec![send(0, &data)]);
        assert!(update(&mut sending, t0 + ms(49)).is_empty());
        assert_eq!(update(&mut sending, t0 + ms(52)), vec![repeat(1, 0, &data)]);
        assert!(update(&mut sending, t0 + ms(60)).is_empty());
        assert_eq!(update(&mut sending, t0 + ms(104)), vec![repeat(2, 0, &data)]);
        assert_eq!(handle.status(), SendStatus::Pending);

        assert!(update(&mut sending, t0 + ms(156)).is_empty());
        assert_eq!(handle.status(), SendStatus::Failed);
        assert!(update(&mut sending, t0 + ms(1000)).is_empty());

        sending.send_data(b"more").unwrap();
        assert_eq!(update(&mut sending, t0 + ms(1001)), vec![send(100, b"more")]);
    }

    #[test]
    fn test_failure_only_affects_overlapping_writes() {
        let mut sending = sending();
        let t0 = Instant::now();
        let a = sending.send_data(&test_data(0, 100)).unwrap();
        update(&mut sending, t0);
        let b = sending.send_data(&test_data(100, 100)).unwrap();
        assert_eq!(update(&mut sending, t0 + ms(40)), vec![send(100, &test_data(100, 100))]);

        update(&mut sending, t0 + ms(50));
        update(&mut sending, t0 + ms(100));
        assert_eq!(update(&mut sending, t0 + ms(150)), vec![repeat(2, 100, &test_data(100, 100))]);
        assert_eq!(a.status(), SendStatus::Failed);
        assert_eq!(b.status(), SendStatus::Pending);

        // the failed data is gone, later writes keep going
        sending.request_repeat_send(idx(0));
        let c = sending.send_data(&test_data(200, 50)).unwrap();
        assert_eq!(update(&mut sending, t0 + ms(151)), vec![send(200, &test_data(200, 50))]);
        assert_eq!(c.status(), SendStatus::Pending);
    }

    #[test]
    fn test_failure_keeps_earlier_writes() {
        let mut sending = sending();
        let t0 = Instant::now();
        let first = sending.send_data(&test_data(0, 100)).unwrap();
        update(&mut sending, t0);

        let second = sending.send_data(&test_data(100, 100)).unwrap();
        update(&mut sending, t0 + ms(30));

        // the first chunk keeps being refreshed by repeat requests, the second one times out
        for t in [40, 90, 140, 190] {
            sending.request_repeat_send(idx(0));
            update(&mut sending, t0 + ms(t));
        }
        assert_eq!(first.status(), SendStatus::Pending);
        assert_eq!(second.status(), SendStatus::Failed);

        sending.confirm(idx(99));
        assert_eq!(first.status(), SendStatus::Confirmed);
    }

    #[test]
    fn test_request_repeat() {
        let mut sending = sending();
        let t0 = Instant::now();
        let data = test_data(0, 400);
        sending.send_data(&data).unwrap();
        assert_eq!(update(&mut sending, t0).len(), 4);

        sending.request_repeat_send(idx(0));
        assert_eq!(update(&mut sending, t0 + ms(1)), vec![repeat(1, 0, &data[..100])]);

        sending.request_repeat_send(idx(0));
        sending.request_repeat_send(idx(0));
        assert_eq!(update(&mut sending, t0 + ms(2)), vec![repeat(2, 0, &data[..100])]);

        sending.request_repeat_send(idx(300));
        assert_eq!(update(&mut sending, t0 + ms(3)), vec![repeat(1, 300, &data[300..])]);

        assert!(update(&mut sending, t0 + ms(4)).is_empty());
    }

    #[test]
    fn test_request_repeat_inside_chunk() {
        let mut sending = sending();
        let t0 = Instant::now();
        let data = test_data(0, 100);
        sending.send_data(&data).unwrap();
        update(&mut sending, t0);

        sending.request_repeat_send(idx(40));
        assert_eq!(update(&mut sending, t0 + ms(1)), vec![repeat(1, 40, &data[40..])]);

        // [0, 40) keeps its original send time and repeat count
        assert_eq!(update(&mut sending, t0 + ms(50)), vec![repeat(1, 0, &data[..40])]);
    }

    #[test]
    fn test_request_repeat_inside_chunk_keeps_retry_budget() {
        let mut sending = sending();
        let t0 = Instant::now();
        let data = test_data(0, 100);
        let handle = sending.send_data(&data).unwrap();
        update(&mut sending, t0);

        sending.request_repeat_send(idx(40));
        assert_eq!(update(&mut sending, t0 + ms(2)), vec![repeat(1, 40, &data[40..])]);
        assert_eq!(update(&mut sending, t0 + ms(50)), vec![repeat(1, 0, &data[..40])]);
        assert_eq!(update(&mut sending, t0 + ms(52)), vec![repeat(2, 40, &data[40..])]);
        assert_eq!(update(&mut sending, t0 + ms(100)), vec![repeat(2, 0, &data[..40])]);
        assert_eq!(handle.status(), SendStatus::Pending);

        assert!(update(&mut sending, t0 + ms(102)).is_empty());
        assert_eq!(handle.status(), SendStatus::Failed);
    }

    #[rstest]
    #[case::not_sent_yet(500)]
    #[case::confirmed(50)]
    fn test_request_repeat_not_in_flight(#[case] offset: u32) {
        let mut sending = sending();
        let t0 = Instant::now();
        sending.send_data(&test_data(0, 200)).unwrap();
        update(&mut sending, t0);
        sending.confirm(idx(99));

        sending.request_repeat_send(idx(offset));
        assert!(update(&mut sending, t0 + ms(1)).is_empty());
    }

    #[test]
    fn test_window() {
        let mut sending = sending_with(|c| c.window_size = 250);
        let t0 = Instant::now();
        let data = test_data(0, 500);
        sending.send_data(&data).unwrap();

        assert_eq!(update(&mut sending, t0), vec![
            send(0, &data[..100]),
            send(100, &data[100..200]),
            send(200, &data[200..250]),
        ]);
        assert!(update(&mut sending, t0 + ms(1)).is_empty());

        sending.confirm(idx(149));
        assert_eq!(update(&mut sending, t0 + ms(2)), vec![
            send(250, &data[250..350]),
            send(350, &data[350..400]),
        ]);
    }

    #[rstest]
    #[case::duplicate(vec![99, 99], 99)]
    #[case::stale(vec![149, 99], 149)]
    #[case::beyond_sent_data(vec![99, 300], 99)]
    #[case::far_away(vec![99, 40000], 99)]
    fn test_confirm_no_op(#[case] confirms: Vec<u32>, #[case] expected_confirmed: u32) {
        let mut sending = sending();
        let t0 = Instant::now();
        sending.send_data(&test_data(0, 200)).unwrap();
        update(&mut sending, t0);

        for offset in confirms {
            sending.confirm(idx(offset));
        }
        assert_eq!(sending.last_confirmed, idx(expected_confirmed + 1));
    }

    #[test]
    fn test_capacity() {
        let mut sending = sending_with(|c| c.buffer_capacity = 300);
        sending.send_data(&test_data(0, 200)).unwrap();
        assert!(sending.send_data(&test_data(200, 101)).is_err());
        sending.send_data(&test_data(200, 100)).unwrap();

        update(&mut sending, Instant::now());
        sending.confirm(idx(199));
        assert!(sending.send_data(&test_data(300, 200)).is_ok());
    }

    #[test]
    fn test_stop() {
        let mut sending = sending_with(|c| c.window_size = 200);
        let t0 = Instant::now();
        let a = sending.send_data(&test_data(0, 200)).unwrap();
        let b = sending.send_data(&test_data(1000, 100)).unwrap();
        let c = sending.send_data(&test_data(2000, 50)).unwrap();
        assert_eq!(update(&mut sending, t0).len(), 2);

        assert!(!sending.stop(a.id()));
        assert!(sending.stop(b.id()));
        assert!(!sending.stop(b.id()));
        assert_eq!(a.status(), SendStatus::Pending);
        assert_eq!(b.status(), SendStatus::Stopped);
        assert_eq!(c.status(), SendStatus::Pending);

        sending.confirm(idx(199));
        assert_eq!(update(&mut sending, t0 + ms(1)), vec![send(200, &test_data(2000, 50))]);
        sending.confirm(idx(249));
        assert_eq!(a.status(), SendStatus::Confirmed);
        assert_eq!(c.status(), SendStatus::Confirmed);
    }

    #[test]
    fn test_stop_all() {
        let mut sending = sending();
        let t0 = Instant::now();
        let a = sending.send_data(&test_data(0, 200)).unwrap();
        update(&mut sending, t0);

        sending.stop_all();
        assert_eq!(a.status(), SendStatus::Stopped);
        assert!(update(&mut sending, t0 + ms(100)).is_empty());
    }

    #[test]
    fn test_set_max_data_size() {
        let mut sending = sending();
        assert!(sending.set_max_data_size(0).is_err());
        assert!(sending.set_max_data_size(10 * 1024 + 1).is_err());
        sending.set_max_data_size(60).unwrap();

        let data = test_data(0, 100);
        sending.send_data(&data).unwrap();
        assert_eq!(update(&mut sending, Instant::now()), vec![
            send(0, &data[..60]),
            send(60, &data[60..]),
        ]);
    }

    #[test]
    fn test_repeat_resliced() {
        let mut sending = sending();
        let t0 = Instant::now();
        let data = test_data(0, 100);
        sending.send_data(&data).unwrap();
        update(&mut sending, t0);

        sending.set_max_data_size(40).unwrap();
        assert_eq!(update(&mut sending, t0 + ms(50)), vec![
            repeat(1, 0, &data[..40]),
            repeat(1, 40, &data[40..80]),
            repeat(1, 80, &data[80..]),
        ]);
    }

    #[test]
    fn test_next_update() {
        let mut sending = sending();
        let t0 = Instant::now();
        assert_eq!(sending.update(t0).next_update(), None);

        sending.send_data(&test_data(0, 10)).unwrap();
        assert_eq!(sending.update(t0).next_update(), Some(t0 + ms(50)));
    }
}
