//! Reliable full-duplex link engine.
//!
//! [`Link`] is the protocol handle. It owns no transport: the rx domain
//! pushes received bytes in via [`Link::on_rx_data`] (or [`Link::run_rx`]),
//! the tx domain pulls outgoing bytes via [`Link::get_tx_data`] (or
//! [`Link::run_tx`]). The two domains may run on separate threads; calls
//! within one domain must be serialized by the caller.
//!
//! Protocol timers are polled: they advance whenever one of the pumping
//! entry points runs, using the injected [`Clock`]. There are no timer
//! threads.

pub mod clock;
mod queue;
mod state;

use std::io;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, BytesMut};

use crate::crc::CrcMode;
use crate::frame::ADDR_ABM;
use crate::hdlc::{self, DecodeError};
use crate::Error;

use self::clock::{Clock, SystemClock};
use self::state::{Enqueue, Session};

/// Connection state of a link handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }
}

/// Frame counters, readable via [`Link::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub frames_rx: u64,
    pub frames_tx: u64,
    pub crc_errors: u64,
    pub framing_errors: u64,
    pub out_of_order: u64,
}

/// Event sink for a link.
///
/// `on_frame` runs in the rx-processing context, `on_sent` in the
/// tx-processing context; with the two domains on separate threads both
/// methods may run concurrently on the same handler (it sits behind its
/// own lock, independent of the protocol state). Neither is ever invoked
/// re-entrantly from within `send_packet`/`send`.
pub trait LinkHandler: Send {
    /// A validated in-order payload from the peer. Payloads arrive in the
    /// exact order the peer enqueued them.
    fn on_frame(&mut self, addr: u8, payload: &[u8]);

    /// Final outcome of a queued payload: `acked` is true once the peer
    /// acknowledged it, false when it was dropped because the link failed
    /// or the handle was closed.
    fn on_sent(&mut self, addr: u8, payload: &[u8], acked: bool) {
        let _ = (addr, payload, acked);
    }
}

impl LinkHandler for () {
    fn on_frame(&mut self, _addr: u8, _payload: &[u8]) {}
}

/// Link configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum payload bytes per I-frame.
    pub mtu: usize,
    /// I-frames allowed in flight, 1 to 7.
    pub window: u8,
    /// Frame check sequence appended to every frame.
    pub crc: CrcMode,
    /// Blocking budget of `send_packet`/`send`, in milliseconds.
    pub send_timeout: u64,
    /// Retry timeout per transmitted frame, in milliseconds. Zero derives
    /// `send_timeout / (retries + 1)`.
    pub retry_timeout: u64,
    /// Retransmissions per frame before the link is declared dead.
    pub retries: u8,
    /// Idle interval after which an RR probe is sent, in milliseconds.
    /// Zero disables keep-alive.
    pub ka_timeout: u64,
    /// Accept payloads while disconnected; queued data triggers the
    /// connection handshake.
    pub queue_on_disconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 128,
            window: 7,
            crc: CrcMode::default(),
            send_timeout: 1000,
            retry_timeout: 0,
            retries: 2,
            ka_timeout: 5000,
            queue_on_disconnect: true,
        }
    }
}

/// Memory footprint of a link with the given parameters, in bytes: one
/// send slot per window entry plus the receive reassembly buffer and
/// fixed bookkeeping. Pure function of its arguments.
pub fn buffer_size_by_mtu(mtu: usize, window: u8, crc: CrcMode) -> usize {
    const SLOT_OVERHEAD: usize = 32;
    const FIXED_OVERHEAD: usize = 160;

    let frame = mtu + hdlc::HEADER_LEN + crc.len();
    window as usize * (mtu + SLOT_OVERHEAD) + frame + FIXED_OVERHEAD
}

struct RxPath {
    decoder: hdlc::Decoder,
    buf: BytesMut,
}

struct TxPath {
    stage: BytesMut,
    /// The last byte handed out was a flag; the next frame omits its
    /// opening flag.
    trailing_flag: bool,
}

/// Full-duplex reliable link handle.
///
/// All methods take `&self`; share the handle between the tx and rx
/// threads with an `Arc`.
pub struct Link<H: LinkHandler> {
    session: Mutex<Session>,
    slot_free: Condvar,
    rx: Mutex<RxPath>,
    tx: Mutex<TxPath>,
    handler: Mutex<H>,
    clock: Box<dyn Clock>,
    mtu: usize,
    crc: CrcMode,
    send_timeout: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<H: LinkHandler> Link<H> {
    pub fn new(config: Config, handler: H) -> Result<Self, Error> {
        Self::with_clock(config, handler, SystemClock::new())
    }

    pub fn with_clock(
        config: Config,
        handler: H,
        clock: impl Clock + 'static,
    ) -> Result<Self, Error> {
        if config.mtu == 0 || !(1..=7).contains(&config.window) {
            return Err(Error::Failed);
        }

        let retry_timeout = if config.retry_timeout == 0 {
            (config.send_timeout / (config.retries as u64 + 1)).max(1)
        } else {
            config.retry_timeout
        };

        let reassembly = config.mtu + hdlc::HEADER_LEN + config.crc.len();

        Ok(Self {
            session: Mutex::new(Session::new(&config, retry_timeout)),
            slot_free: Condvar::new(),
            rx: Mutex::new(RxPath {
                decoder: hdlc::Decoder::with_capacity(config.crc, reassembly),
                buf: BytesMut::with_capacity(512),
            }),
            tx: Mutex::new(TxPath {
                stage: BytesMut::new(),
                trailing_flag: false,
            }),
            handler: Mutex::new(handler),
            clock: Box::new(clock),
            mtu: config.mtu,
            crc: config.crc,
            send_timeout: config.send_timeout,
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn status(&self) -> LinkState {
        lock(&self.session).state
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn stats(&self) -> Stats {
        lock(&self.session).stats
    }

    pub fn set_ka_timeout(&self, ms: u64) {
        lock(&self.session).set_ka_timeout(ms);
    }

    /// Queues a DISC command. Returns as soon as the command is queued;
    /// it does not wait for the peer's UA. Fails while a handshake is
    /// already in progress.
    pub fn disconnect(&self) -> Result<(), Error> {
        let mut session = lock(&self.session);

        if session.closing {
            return Err(Error::Failed);
        }

        session.request_disconnect()
    }

    /// Sends a single payload of at most [`Link::mtu`] bytes, blocking
    /// until a send slot is free or `send_timeout` elapses.
    ///
    /// Success means the payload is queued for reliable delivery, not that
    /// it has been acknowledged yet; the handler's `on_sent` reports the
    /// final outcome. While disconnected, queued data triggers the
    /// connection handshake.
    pub fn send_packet(&self, data: &[u8]) -> Result<(), Error> {
        let deadline = self.clock.now().saturating_add(self.send_timeout);
        self.send_packet_deadline(data, deadline)
    }

    fn send_packet_deadline(&self, data: &[u8], deadline: u64) -> Result<(), Error> {
        if data.len() > self.mtu {
            return Err(Error::DataTooLarge);
        }

        let mut session = lock(&self.session);

        loop {
            if session.closing {
                return Err(Error::Failed);
            }

            match session.try_enqueue(self.clock.now(), data) {
                Enqueue::Ok => return Ok(()),
                Enqueue::Refused => return Err(Error::Failed),
                Enqueue::Full => {}
            }

            let now = self.clock.now();
            if now >= deadline {
                return Err(Error::Timeout);
            }

            let (guard, _) = self
                .slot_free
                .wait_timeout(session, Duration::from_millis(deadline - now))
                .unwrap_or_else(|e| e.into_inner());
            session = guard;
        }
    }

    /// Sends an arbitrary amount of data, fragmenting at MTU boundaries.
    ///
    /// Fragment boundaries are not preserved on delivery: the peer sees
    /// each fragment as an independent `on_frame` payload. Returns the
    /// number of bytes enqueued, which is less than `data.len()` when the
    /// send timeout elapses or the link fails midway.
    pub fn send(&self, data: &[u8]) -> usize {
        let deadline = self.clock.now().saturating_add(self.send_timeout);
        let mut sent = 0;

        for chunk in data.chunks(self.mtu) {
            if self.send_packet_deadline(chunk, deadline).is_err() {
                break;
            }
            sent += chunk.len();
        }

        sent
    }

    /// Fills `out` with pending tx bytes and returns how many were
    /// written. Zero means the link has nothing to send right now.
    ///
    /// This is a tx-domain entry point: it advances the protocol timers,
    /// so it should be called regularly even when the last call returned
    /// zero.
    pub fn get_tx_data(&self, out: &mut [u8]) -> usize {
        let mut tx = lock(&self.tx);
        let now = self.clock.now();

        let (events, notify) = {
            let mut session = lock(&self.session);

            while tx.stage.len() < out.len() {
                match session.next_tx_frame(now) {
                    Some(frame) => {
                        let continued = tx.stage.last() == Some(&hdlc::consts::FLAG)
                            || (tx.stage.is_empty() && tx.trailing_flag);

                        if continued {
                            hdlc::encode_continued(&mut tx.stage, &frame, self.crc);
                        } else {
                            hdlc::encode(&mut tx.stage, &frame, self.crc);
                        }
                    }
                    None => break,
                }
            }

            let events: Vec<_> = session.sent_events.drain(..).collect();
            (events, session.take_notify())
        };

        let n = out.len().min(tx.stage.len());
        if n > 0 {
            out[..n].copy_from_slice(&tx.stage[..n]);
            tx.trailing_flag = tx.stage[n - 1] == hdlc::consts::FLAG;
            tx.stage.advance(n);
        }
        drop(tx);

        if notify {
            self.slot_free.notify_all();
        }

        if !events.is_empty() {
            let mut handler = lock(&self.handler);
            for (payload, acked) in events {
                handler.on_sent(ADDR_ABM, &payload, acked);
            }
        }

        n
    }

    /// Feeds received bytes to the framer. Complete valid frames drive the
    /// protocol; payloads are delivered to the handler before this call
    /// returns.
    pub fn on_rx_data(&self, data: &[u8]) {
        let mut rx = lock(&self.rx);
        rx.buf.extend_from_slice(data);

        let now = self.clock.now();
        let mut deliveries: Vec<Vec<u8>> = Vec::new();
        let mut notify = false;

        let RxPath { decoder, buf } = &mut *rx;
        loop {
            match decoder.process(buf) {
                Ok(Some(frame)) => {
                    let mut session = lock(&self.session);
                    deliveries.append(&mut session.on_frame(now, frame));
                    notify |= session.take_notify();
                }
                Ok(None) => break,
                Err(DecodeError::Junk) => {
                    log::trace!("skipping bytes outside any frame");
                }
                Err(e) => {
                    log::warn!("framer error: {e}");

                    let mut session = lock(&self.session);
                    if e == DecodeError::Checksum {
                        session.stats.crc_errors += 1;
                    } else {
                        session.stats.framing_errors += 1;
                    }
                }
            }
        }
        drop(rx);

        if notify {
            self.slot_free.notify_all();
        }

        if !deliveries.is_empty() {
            let mut handler = lock(&self.handler);
            for payload in deliveries {
                handler.on_frame(ADDR_ABM, &payload);
            }
        }
    }

    /// Pumps pending tx bytes into `io` in small chunks until nothing is
    /// left to send, the writer reports EOF, or the handle closes. Returns
    /// the number of bytes written.
    ///
    /// Bytes already pulled from the engine when a write fails are lost on
    /// this transport; the retransmission machinery recovers them.
    pub fn run_tx<W: io::Write + ?Sized>(&self, io: &mut W) -> io::Result<usize> {
        let mut total = 0;

        loop {
            if lock(&self.session).closing {
                break;
            }

            let mut chunk = [0u8; 4];
            let n = self.get_tx_data(&mut chunk);
            if n == 0 {
                break;
            }

            let mut off = 0;
            while off < n {
                match io.write(&chunk[off..n]) {
                    Ok(0) => return Ok(total),
                    Ok(written) => {
                        off += written;
                        total += written;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(total)
    }

    /// Reads from `io` in small chunks and feeds them to the framer until
    /// the reader has no more data (EOF, `WouldBlock` or `TimedOut`) or
    /// the handle closes. Returns the number of bytes consumed.
    pub fn run_rx<R: io::Read + ?Sized>(&self, io: &mut R) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; 4];

        loop {
            if lock(&self.session).closing {
                break;
            }

            match io.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.on_rx_data(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    break
                }
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Closes the handle. Blocked `send_packet`/`send` calls wake up with
    /// a failure, and every payload still queued is reported through
    /// `on_sent` with `acked = false` before this returns.
    pub fn close(&self) {
        let events: Vec<_> = {
            let mut session = lock(&self.session);
            session.close();
            session.sent_events.drain(..).collect()
        };

        self.slot_free.notify_all();

        let mut handler = lock(&self.handler);
        for (payload, acked) in events {
            handler.on_sent(ADDR_ABM, &payload, acked);
        }
    }
}

impl<H: LinkHandler> Drop for Link<H> {
    fn drop(&mut self) {
        self.close();
    }
}
