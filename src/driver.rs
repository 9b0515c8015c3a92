use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use crate::action::{Action, ActionStatus};
use crate::config::SafeStreamConfig;
use crate::stream::send_data_buffer::SendHandle;
use crate::stream::SafeStream;

/// The transport below a stream. Packets may be lost, reordered or duplicated on their way.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn send_packet(&self, packet: &[u8]);
}

/// Runs a [SafeStream] in a tokio task: the stream is updated on every tick, as well as right
///  after writes and incoming packets. Outgoing packets go to a [PacketSink], received data goes to
///  the channel returned by [SafeStreamDriver::new]. The channel closes when the stream is closed
///  or fails.
pub struct SafeStreamDriver {
    stream: Arc<RwLock<SafeStream>>,
    wake: Arc<Notify>,
    active_handle: JoinHandle<()>,
}

impl Drop for SafeStreamDriver {
    fn drop(&mut self) {
        self.active_handle.abort();
    }
}

impl SafeStreamDriver {
    pub fn new(config: SafeStreamConfig, tick: Duration, sink: Arc<dyn PacketSink>) -> anyhow::Result<(SafeStreamDriver, mpsc::UnboundedReceiver<Bytes>)> {
        let stream = Arc::new(RwLock::new(SafeStream::new(config)?));
        let wake = Arc::new(Notify::new());
        let (received_sender, received_receiver) = mpsc::unbounded_channel();

        let active_handle = tokio::spawn(Self::do_loop(tick, stream.clone(), wake.clone(), sink, received_sender));

        Ok((SafeStreamDriver {
            stream,
            wake,
            active_handle,
        }, received_receiver))
    }

    pub async fn write(&self, data: &[u8]) -> anyhow::Result<SendHandle> {
        let handle = self.stream.write().await
            .write(data)?;
        self.wake.notify_one();
        Ok(handle)
    }

    pub async fn stop(&self, handle: &SendHandle) -> bool {
        self.stream.write().await
            .stop(handle)
    }

    pub async fn close(&self) {
        self.stream.write().await
            .close();
        self.wake.notify_one();
    }

    pub async fn is_open(&self) -> bool {
        self.stream.read().await
            .is_open()
    }

    /// Passes a packet from the transport to the stream. Invalid packets are dropped.
    pub async fn on_packet(&self, packet: &[u8]) {
        if let Err(e) = self.stream.write().await.on_packet(packet, Instant::now()) {
            warn!("dropping invalid packet: {}", e);
            return;
        }
        self.wake.notify_one();
    }

    /// Active loop - runs until the stream is closed or fails, or until the driver is dropped
    async fn do_loop(tick: Duration, stream: Arc<RwLock<SafeStream>>, wake: Arc<Notify>, sink: Arc<dyn PacketSink>, received_sender: mpsc::UnboundedSender<Bytes>) {
        let mut tick_interval = interval(tick);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = tick_interval.tick() => {}
                _ = wake.notified() => {}
            }

            let (status, packets, received) = {
                let mut stream = stream.write().await;
                let status = stream.update(Instant::now());
                (status, stream.drain_packets(), stream.drain_received())
            };

            trace!("sending {} packets", packets.len());
            for packet in packets {
                sink.send_packet(&packet).await;
            }
            for data in received {
                if received_sender.send(data).is_err() {
                    debug!("received data is not consumed - dropping it");
                }
            }

            match status {
                ActionStatus::Pending { .. } => {}
                ActionStatus::Failed(e) => {
                    error!("stream failed: {}", e);
                    break;
                }
                ActionStatus::Stopped => {
                    debug!("stream closed");
                    break;
                }
            }
        }
    }
}

impl Debug for SafeStreamDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SafeStreamDriver")
    }
}
