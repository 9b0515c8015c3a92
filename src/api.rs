use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ring_index::SafeStreamRingIndex;
use crate::util::buf_ext::{BufExt, BufMutExt};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageCode {
    Close = 2,
    RequestReport = 3,
    PutReport = 4,
    Confirm = 5,
    RequestRepeat = 6,
    Send = 7,
    Repeat = 8,
}

/// The messages two SafeStream endpoints exchange.
///
/// Offsets are ring offsets. `Confirm` names the last byte of the contiguously received prefix,
///  `RequestRepeat` the first byte of a gap, `PutReport` the receiver's last confirmed byte.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SafeStreamMessage {
    Close,
    RequestReport,
    PutReport { offset: SafeStreamRingIndex },
    Confirm { offset: SafeStreamRingIndex },
    RequestRepeat { offset: SafeStreamRingIndex },
    Send { offset: SafeStreamRingIndex, data: Bytes },
    Repeat { repeat_count: u16, offset: SafeStreamRingIndex, data: Bytes },
}

impl SafeStreamMessage {
    pub fn code(&self) -> MessageCode {
        match self {
            SafeStreamMessage::Close => MessageCode::Close,
            SafeStreamMessage::RequestReport => MessageCode::RequestReport,
            SafeStreamMessage::PutReport { .. } => MessageCode::PutReport,
            SafeStreamMessage::Confirm { .. } => MessageCode::Confirm,
            SafeStreamMessage::RequestRepeat { .. } => MessageCode::RequestRepeat,
            SafeStreamMessage::Send { .. } => MessageCode::Send,
            SafeStreamMessage::Repeat { .. } => MessageCode::Repeat,
        }
    }

    /// true for the messages carrying stream data, as opposed to control messages
    pub fn is_data(&self) -> bool {
        matches!(self, SafeStreamMessage::Send { .. } | SafeStreamMessage::Repeat { .. })
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code().into());

        match self {
            SafeStreamMessage::Close | SafeStreamMessage::RequestReport => {}
            SafeStreamMessage::PutReport { offset } |
            SafeStreamMessage::Confirm { offset } |
            SafeStreamMessage::RequestRepeat { offset } => {
                buf.put_u16(offset.to_wire());
            }
            SafeStreamMessage::Send { offset, data } => {
                buf.put_u16(offset.to_wire());
                buf.put_bytes_with_len(data);
            }
            SafeStreamMessage::Repeat { repeat_count, offset, data } => {
                buf.put_u16(*repeat_count);
                buf.put_u16(offset.to_wire());
                buf.put_bytes_with_len(data);
            }
        }
    }

    /// Reads a single message, advancing `buf` past it. Several messages can be read from the
    ///  same buffer back to back.
    pub fn deser(buf: &mut &[u8]) -> anyhow::Result<SafeStreamMessage> {
        let raw_code = buf.checked_get_u8()?;
        let code = MessageCode::try_from(raw_code)
            .map_err(|_| anyhow!("invalid message code {}", raw_code))?;

        let msg = match code {
            MessageCode::Close => SafeStreamMessage::Close,
            MessageCode::RequestReport => SafeStreamMessage::RequestReport,
            MessageCode::PutReport => SafeStreamMessage::PutReport { offset: Self::deser_offset(buf)? },
            MessageCode::Confirm => SafeStreamMessage::Confirm { offset: Self::deser_offset(buf)? },
            MessageCode::RequestRepeat => SafeStreamMessage::RequestRepeat { offset: Self::deser_offset(buf)? },
            MessageCode::Send => {
                let offset = Self::deser_offset(buf)?;
                let data = buf.checked_get_bytes()?;
                SafeStreamMessage::Send { offset, data }
            }
            MessageCode::Repeat => {
                let repeat_count = buf.checked_get_u16()?;
                let offset = Self::deser_offset(buf)?;
                let data = buf.checked_get_bytes()?;
                SafeStreamMessage::Repeat { repeat_count, offset, data }
            }
        };
        Ok(msg)
    }

    fn deser_offset(buf: &mut &[u8]) -> anyhow::Result<SafeStreamRingIndex> {
        Ok(SafeStreamRingIndex::from_wire(buf.checked_get_u16()?))
    }
}
