use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};

use crate::api::SafeStreamMessage;
use crate::util::buf_ext::BufExt;

const CHECKSUM_ALGORITHM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u32);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x?}", self.0)
    }
}
impl Checksum {
    pub fn new(msg: &[u8]) -> Checksum {
        Checksum(CHECKSUM_ALGORITHM.checksum(msg))
    }
}

/// A packet as it goes over the transport: a CRC-32 checksum of the rest of the packet,
///  followed by one or more messages.
///
/// The transport may corrupt data, and a corrupted packet is treated exactly like a lost one.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SafeStreamPacket {
    pub messages: Vec<SafeStreamMessage>,
}

impl SafeStreamPacket {
    pub fn new(messages: Vec<SafeStreamMessage>) -> SafeStreamPacket {
        SafeStreamPacket { messages }
    }

    pub fn ser(&self) -> Bytes {
        let mut body = BytesMut::new();
        for msg in &self.messages {
            msg.ser(&mut body);
        }

        let mut buf = BytesMut::with_capacity(body.len() + size_of::<u32>());
        buf.put_u32(Checksum::new(&body).0);
        buf.put_slice(&body);
        buf.freeze()
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<SafeStreamPacket> {
        let checksum = Checksum(buf.checked_get_u32()?);
        let actual = Checksum::new(buf);
        if checksum != actual {
            bail!("checksum mismatch: packet has {:?}, content has {:?}", checksum, actual);
        }

        let mut messages = Vec::new();
        while !buf.is_empty() {
            messages.push(SafeStreamMessage::deser(&mut buf)?);
        }
        if messages.is_empty() {
            bail!("packet without messages");
        }
        Ok(SafeStreamPacket { messages })
    }
}
