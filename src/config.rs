use std::time::Duration;
use anyhow::bail;

/// Largest window for which wraparound of `u16` offsets can still be disambiguated
pub const MAX_WINDOW_SIZE: u16 = 32768;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SafeStreamConfig {
    /// This is the maximum number of bytes the sender accepts from the application and holds
    ///  until they are confirmed, whether they were transmitted already or not. Writes that would
    ///  exceed this are rejected rather than buffered, so this is the application's backpressure
    ///  signal.
    pub buffer_capacity: u16,

    /// The maximum number of bytes in flight beyond the first unconfirmed offset, i.e. the fixed
    ///  flow-control window. The receiver uses the same value to decide which offsets it accepts,
    ///  so both sides of a stream must agree on it.
    ///
    /// Offsets go over the wire as `u16`; comparisons are only unambiguous if the window is at most
    ///  half of that range.
    pub window_size: u16,

    /// Maximum payload of a single `Send` or `Repeat` message. This must fit into a transport
    ///  packet together with the packet and message headers.
    pub max_data_size: u16,

    /// The number of retransmissions (sender) or repeat requests (receiver) for the same range
    ///  before the range is considered lost for good
    pub max_repeat_count: u16,

    /// The time the sender waits for a chunk's confirmation before resending it
    pub wait_confirm_timeout: Duration,
    /// Confirmations are coalesced: the receiver sends at most one `Confirm` per interval
    pub send_confirm_timeout: Duration,
    /// A gap must be open for this long before the receiver requests it, and requests for the
    ///  same gap are repeated at this interval
    pub send_repeat_timeout: Duration,
}

impl SafeStreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size == 0 {
            bail!("window size must not be 0");
        }
        if self.window_size > MAX_WINDOW_SIZE {
            bail!("window size {} exceeds the maximum of {}", self.window_size, MAX_WINDOW_SIZE);
        }
        if self.max_data_size == 0 {
            bail!("max data size must not be 0");
        }
        if self.max_data_size > self.window_size {
            bail!("max data size {} is bigger than the window size {}", self.max_data_size, self.window_size);
        }
        if self.buffer_capacity < self.max_data_size {
            bail!("buffer capacity {} is smaller than max data size {}", self.buffer_capacity, self.max_data_size);
        }
        if self.max_repeat_count == 0 {
            bail!("max repeat count must not be 0");
        }

        Ok(())
    }
}
