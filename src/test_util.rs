use std::time::Duration;

use bytes::Bytes;

use crate::api::SafeStreamMessage;
use crate::config::SafeStreamConfig;
use crate::ring_index::SafeStreamRingIndex;
use crate::stream::OutgoingMessage;

pub fn test_config() -> SafeStreamConfig {
    SafeStreamConfig {
        buffer_capacity: 20 * 1024,
        window_size: 10 * 1024,
        max_data_size: 100,
        max_repeat_count: 2,
        wait_confirm_timeout: Duration::from_millis(50),
        send_confirm_timeout: Duration::ZERO,
        send_repeat_timeout: Duration::from_millis(10),
    }
}

/// recognizable, position dependent payload
pub fn test_data(offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len)
        .map(|i| (i % 251) as u8)
        .collect()
}

pub fn idx(value: u32) -> SafeStreamRingIndex {
    SafeStreamRingIndex::new(value)
}

pub fn messages(outgoing: Vec<OutgoingMessage>) -> Vec<SafeStreamMessage> {
    outgoing.into_iter()
        .map(|o| o.message)
        .collect()
}

pub fn send(offset: u32, data: &[u8]) -> SafeStreamMessage {
    SafeStreamMessage::Send { offset: idx(offset), data: Bytes::copy_from_slice(data) }
}

pub fn repeat(repeat_count: u16, offset: u32, data: &[u8]) -> SafeStreamMessage {
    SafeStreamMessage::Repeat { repeat_count, offset: idx(offset), data: Bytes::copy_from_slice(data) }
}

pub fn confirm(offset: u32) -> SafeStreamMessage {
    SafeStreamMessage::Confirm { offset: idx(offset) }
}

pub fn request_repeat(offset: u32) -> SafeStreamMessage {
    SafeStreamMessage::RequestRepeat { offset: idx(offset) }
}
