//! SafeStream is a reliable, ordered byte stream on top of an unreliable packet transport. The
//!  transport may lose, reorder, duplicate or corrupt packets, and it limits packet size; SafeStream
//!  adds ordering, gap detection, retransmission, a fixed flow-control window and coalesced
//!  acknowledgements on top of it.
//!
//! ## Offsets
//!
//! Every byte of the stream has an offset. Offsets go over the wire as `u16` and wrap around, so
//!  all comparisons are done relative to a reference point with a window of at most half the ring
//!  (see [ring_index] and [offset_range]). The sender never has more than `window_size` bytes
//!  in flight beyond the first unconfirmed offset, which keeps every comparison unambiguous.
//!
//! ## Messages
//!
//! The sender transmits data as `Send` (first transmission) and `Repeat` (retransmission,
//!  carrying its repeat count). The receiver answers with `Confirm` (everything up to and including
//!  an offset arrived) and `RequestRepeat` (there is a gap starting at an offset). `Close`,
//!  `RequestReport` and `PutReport` manage the stream as a whole. See [api] for the
//!  catalogue and [packet] for the checksummed framing.
//!
//! ## Send side
//!
//! Data handed to the sender is buffered (bounded by `buffer_capacity`) and assigned consecutive
//!  offsets. It is sliced into messages of at most `max_data_size` bytes as the window permits.
//!  In-flight ranges are tracked as chunks; a chunk that is not confirmed within
//!  `wait_confirm_timeout` is resent, and once it was resent `max_repeat_count` times without
//!  confirmation, the writes covering it fail. Receiver requests trigger an immediate resend.
//!
//! ## Receive side
//!
//! Received fragments are stored until they join the contiguous frontier; each contiguous run is
//!  delivered exactly once, in order. Confirmations are coalesced (`send_confirm_timeout`), and
//!  gaps that stay open for `send_repeat_timeout` are requested from the sender. A gap that is
//!  still open after `max_repeat_count` requests makes the stream fail.
//!
//! ## Execution model
//!
//! The state machines are synchronous and never read the clock: they are driven by
//!  [action::Action::update] calls with an explicit current time. [stream::SafeStream] combines
//!  both directions, and [driver::SafeStreamDriver] runs one inside a tokio task.

pub mod action;
pub mod api;
pub mod config;
pub mod driver;
pub mod offset_range;
pub mod packet;
pub mod ring_index;
pub mod stream;
pub mod util;

#[cfg(test)]
pub mod test_util;
