pub mod receiving;
pub mod send_data_buffer;
pub mod sending;
pub mod sending_chunk_list;

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::action::{earliest, Action, ActionStatus};
use crate::api::SafeStreamMessage;
use crate::config::SafeStreamConfig;
use crate::packet::SafeStreamPacket;
use crate::stream::receiving::{ReceiveError, SafeStreamReceivingAction};
use crate::stream::send_data_buffer::SendHandle;
use crate::stream::sending::SafeStreamSendingAction;

/// A message produced by one of the state machines, with the time it was produced
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OutgoingMessage {
    pub message: SafeStreamMessage,
    pub time: Instant,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SafeStreamError {
    Receive(ReceiveError),
}
impl Display for SafeStreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SafeStreamError::Receive(e) => write!(f, "receiving failed: {}", e),
        }
    }
}
impl std::error::Error for SafeStreamError {}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum StreamState {
    Open,
    ClosedLocally,
    ClosedByPeer,
}

/// One endpoint of a bidirectional SafeStream, combining a sending and a receiving state machine.
///
/// Incoming packets are passed to [SafeStream::on_packet], and [Action::update] must be called
///  periodically (at least at the returned `next_update`). Outgoing packets and received data
///  accumulate until they are drained.
pub struct SafeStream {
    sending: SafeStreamSendingAction,
    receiving: SafeStreamReceivingAction,
    state: StreamState,
    /// control messages generated outside of `update`
    pending_control: Vec<SafeStreamMessage>,
    outgoing_packets: VecDeque<Bytes>,
    received: VecDeque<Bytes>,
}

impl SafeStream {
    pub fn new(config: SafeStreamConfig) -> anyhow::Result<SafeStream> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(SafeStream {
            sending: SafeStreamSendingAction::new(config.clone()),
            receiving: SafeStreamReceivingAction::new(config),
            state: StreamState::Open,
            pending_control: Vec::new(),
            outgoing_packets: Default::default(),
            received: Default::default(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn write(&mut self, data: &[u8]) -> anyhow::Result<SendHandle> {
        if !self.is_open() {
            bail!("stream is closed");
        }
        self.sending.send_data(data)
    }

    /// Cancels a write that has not started transmission. Returns false if that is no longer
    ///  possible.
    pub fn stop(&mut self, handle: &SendHandle) -> bool {
        self.sending.stop(handle.id())
    }

    pub fn set_max_data_size(&mut self, max_data_size: u16) -> anyhow::Result<()> {
        self.sending.set_max_data_size(max_data_size)
    }

    /// asks the peer for the offset up to which it received our data
    pub fn request_report(&mut self) {
        self.pending_control.push(SafeStreamMessage::RequestReport);
    }

    /// Closes the stream: pending writes are stopped, and the peer is notified
    pub fn close(&mut self) {
        if self.is_open() {
            debug!("closing stream");
            self.state = StreamState::ClosedLocally;
            self.sending.stop_all();
            self.pending_control.push(SafeStreamMessage::Close);
        }
    }

    pub fn on_packet(&mut self, buf: &[u8], now: Instant) -> anyhow::Result<()> {
        let packet = SafeStreamPacket::deser(buf)?;
        for message in packet.messages {
            self.on_message(message, now);
        }
        Ok(())
    }

    pub fn on_message(&mut self, message: SafeStreamMessage, now: Instant) {
        if !self.is_open() {
            trace!("stream is closed - ignoring {:?}", message.code());
            return;
        }

        match message {
            SafeStreamMessage::Close => {
                debug!("stream closed by peer");
                self.state = StreamState::ClosedByPeer;
                self.sending.stop_all();
            }
            SafeStreamMessage::RequestReport => {
                self.pending_control.push(SafeStreamMessage::PutReport { offset: self.receiving.confirmed_offset() });
            }
            SafeStreamMessage::PutReport { offset } => self.sending.confirm(offset),
            SafeStreamMessage::Confirm { offset } => self.sending.confirm(offset),
            SafeStreamMessage::RequestRepeat { offset } => self.sending.request_repeat_send(offset),
            SafeStreamMessage::Send { offset, data } => self.receiving.receive_send(offset, data, now),
            SafeStreamMessage::Repeat { repeat_count, offset, data } => self.receiving.receive_repeat(offset, repeat_count, data, now),
        }
    }

    /// serialized packets for the transport, in the order they should be sent
    pub fn drain_packets(&mut self) -> Vec<Bytes> {
        self.outgoing_packets.drain(..).collect()
    }

    /// received data in stream order
    pub fn drain_received(&mut self) -> Vec<Bytes> {
        self.received.drain(..).collect()
    }

    /// Each data message goes into a packet of its own since its size is limited by the
    ///  transport; control messages of the same round share a packet.
    fn pack(&mut self, messages: Vec<SafeStreamMessage>) {
        let mut control = Vec::new();
        for message in messages {
            if message.is_data() {
                self.outgoing_packets.push_back(SafeStreamPacket::new(vec![message]).ser());
            }
            else {
                control.push(message);
            }
        }
        if !control.is_empty() {
            self.outgoing_packets.push_back(SafeStreamPacket::new(control).ser());
        }
    }
}

impl Action for SafeStream {
    type Error = SafeStreamError;

    fn update(&mut self, now: Instant) -> ActionStatus<SafeStreamError> {
        if self.state != StreamState::Open {
            let control = std::mem::take(&mut self.pending_control);
            self.pack(control);
            return ActionStatus::Stopped;
        }

        let sending_status = self.sending.update(now);
        let receiving_status = self.receiving.update(now);

        self.received.extend(self.receiving.drain_received());

        let mut messages = std::mem::take(&mut self.pending_control);
        messages.extend(self.receiving.drain_outgoing().into_iter().map(|o| o.message));
        messages.extend(self.sending.drain_outgoing().into_iter().map(|o| o.message));
        self.pack(messages);

        match receiving_status {
            ActionStatus::Failed(e) => {
                warn!("stream failed: {}", e);
                ActionStatus::Failed(SafeStreamError::Receive(e))
            }
            _ => ActionStatus::Pending {
                next_update: earliest(sending_status.next_update(), receiving_status.next_update()),
            },
        }
    }
}
