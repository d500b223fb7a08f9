//! Full-duplex HDLC link protocol (asynchronous balanced mode).
//!
//! This crate frames user payloads, delivers them in order and without loss
//! over an unreliable byte-oriented channel (typically a UART or a socket),
//! and lets either peer initiate, send and disconnect.
//!
//! The crate is layered:
//!
//! * [`hdlc`] — low-level framing only: flag delimiters, byte stuffing and
//!   frame checksums. Usable on its own.
//! * [`frame`] — the HDLC control-field codec (I/S/U frames, modulo-8
//!   sequence numbers).
//! * [`link`] — the reliable link engine: sliding-window send queue,
//!   acknowledgements, retransmission and the SABM/UA/DISC connection state
//!   machine.
//!
//! The engine never performs I/O itself. The caller pushes received bytes
//! into [`Link::on_rx_data`] and pulls outgoing bytes from
//! [`Link::get_tx_data`], or uses the [`Link::run_rx`]/[`Link::run_tx`]
//! helpers to pump a `std::io` transport.

pub mod crc;
pub mod frame;
pub mod hdlc;
pub mod link;

pub use crc::CrcMode;
pub use link::clock::{Clock, ManualClock, SystemClock};
pub use link::{buffer_size_by_mtu, Config, Link, LinkHandler, LinkState, Stats};

/// Semantic error codes surfaced by the link API.
///
/// Framer and protocol errors are never surfaced as values; they only
/// influence the connection state. These codes cover the caller-visible
/// failure surface of `send_packet`, `send` and `disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The operation failed or was cancelled, e.g. the link was closed or
    /// the peer is unreachable.
    Failed,
    /// An argument or the handle state is invalid for this operation.
    InvalidData,
    /// The deadline elapsed before the operation could complete.
    Timeout,
    /// The payload exceeds the configured MTU.
    DataTooLarge,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Error::Failed => "operation failed or was cancelled",
            Error::InvalidData => "invalid argument or handle state",
            Error::Timeout => "operation timed out",
            Error::DataTooLarge => "payload exceeds the link MTU",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}
