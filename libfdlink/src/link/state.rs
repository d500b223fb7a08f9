//! Connection state machine, receive sequencing and acknowledgement
//! policy. `Session` is the single-threaded heart of the link: the public
//! handle in [`super`] wraps it in a mutex and feeds it decoded frames
//! (rx domain) or polls it for the next frame to transmit (tx domain).

use std::collections::VecDeque;

use crate::frame::{seq, Control, SKind, UKind, ADDR_ABM};
use crate::hdlc::Frame;
use crate::Error;

use super::queue::TxQueue;
use super::{Config, LinkState, Stats};

/// Result of placing a payload into the send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Ok,
    /// No free slot; the caller may block and retry.
    Full,
    /// The link is disconnected and not configured to queue.
    Refused,
}

pub(crate) struct Session {
    pub queue: TxQueue,
    pub state: LinkState,
    pub stats: Stats,
    pub closing: bool,

    retries: u8,
    retry_timeout: u64,
    ack_defer: u64,
    ka_timeout: u64,
    queue_on_disconnect: bool,

    /// Next N(S) we expect from the peer.
    next_nr: u8,
    /// Most recent N(R) we told the peer about.
    last_nr_sent: u8,
    /// A REJ went out and in-order delivery has not resumed yet.
    rej_armed: bool,
    /// A REJ is scheduled for transmission.
    rej_pending: bool,
    peer_busy: bool,
    /// Deadline for a standalone RR when no I-frame picks the ack up.
    ack_due: Option<u64>,
    /// The peer polled us (P bit); answer with an immediate ack.
    force_ack: bool,

    /// Outstanding SABM or DISC command.
    u_cmd: Option<UKind>,
    u_awaiting: bool,
    u_sent_at: u64,
    u_retries: u8,
    ua_pending: bool,
    ua_pf: bool,
    frmr_pending: bool,

    last_tx: u64,

    /// Acknowledged/failed payloads waiting for `on_sent` delivery from
    /// the tx-processing context.
    pub sent_events: VecDeque<(Vec<u8>, bool)>,
    notify: bool,
}

impl Session {
    pub fn new(config: &Config, retry_timeout: u64) -> Self {
        Self {
            queue: TxQueue::new(config.window as usize),
            state: LinkState::Disconnected,
            stats: Stats::default(),
            closing: false,
            retries: config.retries,
            retry_timeout,
            ack_defer: (retry_timeout / 2).max(1),
            ka_timeout: config.ka_timeout,
            queue_on_disconnect: config.queue_on_disconnect,
            next_nr: 0,
            last_nr_sent: 0,
            rej_armed: false,
            rej_pending: false,
            peer_busy: false,
            ack_due: None,
            force_ack: false,
            u_cmd: None,
            u_awaiting: false,
            u_sent_at: 0,
            u_retries: 0,
            ua_pending: false,
            ua_pf: false,
            frmr_pending: false,
            last_tx: 0,
            sent_events: VecDeque::new(),
            notify: false,
        }
    }

    pub fn set_ka_timeout(&mut self, ms: u64) {
        self.ka_timeout = ms;
    }

    /// True when slots were freed, the link failed or the handle is
    /// closing; the caller wakes blocked senders.
    pub fn take_notify(&mut self) -> bool {
        std::mem::take(&mut self.notify)
    }

    pub fn try_enqueue(&mut self, now: u64, data: &[u8]) -> Enqueue {
        if self.state == LinkState::Disconnected && !self.queue_on_disconnect {
            return Enqueue::Refused;
        }

        if !self.queue.enqueue(data) {
            return Enqueue::Full;
        }

        if self.state == LinkState::Disconnected {
            self.request_connect();
        }

        Enqueue::Ok
    }

    pub fn request_disconnect(&mut self) -> Result<(), Error> {
        match self.state {
            // Nothing to tear down, or a DISC is already on its way.
            LinkState::Disconnected | LinkState::Disconnecting => Ok(()),
            LinkState::Connecting => Err(Error::Failed),
            LinkState::Connected => {
                if self.u_cmd.is_some() {
                    return Err(Error::Failed);
                }

                self.state = LinkState::Disconnecting;
                self.u_cmd = Some(UKind::Disc);
                self.u_awaiting = false;
                self.u_retries = self.retries;
                Ok(())
            }
        }
    }

    pub fn close(&mut self) {
        self.closing = true;
        self.fail_pending();
        self.state = LinkState::Disconnected;
        self.u_cmd = None;
        self.ua_pending = false;
        self.frmr_pending = false;
        self.notify = true;
    }

    fn request_connect(&mut self) {
        self.state = LinkState::Connecting;
        self.u_cmd = Some(UKind::Sabm);
        self.u_awaiting = false;
        self.u_retries = self.retries;
    }

    fn fail_pending(&mut self) {
        for payload in self.queue.fail_all() {
            self.sent_events.push_back((payload, false));
        }
        self.notify = true;
    }

    fn enter_disconnected(&mut self, fail: bool) {
        self.state = LinkState::Disconnected;
        self.u_cmd = None;
        self.peer_busy = false;
        self.rej_armed = false;
        self.rej_pending = false;
        self.ack_due = None;
        self.force_ack = false;
        if fail {
            self.fail_pending();
        }
        self.notify = true;
    }

    fn enter_connected(&mut self, now: u64) {
        // Unacknowledged frames of a previous session do not survive the
        // sequence reset.
        for payload in self.queue.reset_sequences() {
            self.sent_events.push_back((payload, false));
        }

        self.state = LinkState::Connected;
        self.next_nr = 0;
        self.last_nr_sent = 0;
        self.rej_armed = false;
        self.rej_pending = false;
        self.peer_busy = false;
        self.ack_due = None;
        self.force_ack = false;
        self.u_cmd = None;
        self.last_tx = now;
        self.notify = true;
    }

    /// Processes one validated frame from the peer. Returns the payloads to
    /// deliver via `on_frame`, in order.
    pub fn on_frame(&mut self, now: u64, frame: Frame) -> Vec<Vec<u8>> {
        self.stats.frames_rx += 1;

        if frame.address != ADDR_ABM {
            log::warn!("dropping frame with unexpected address 0x{:02X}", frame.address);
            self.stats.framing_errors += 1;
            return Vec::new();
        }

        let control = match Control::decode(frame.control) {
            Ok(control) => control,
            Err(e) => {
                log::warn!("{e}");
                self.stats.framing_errors += 1;
                if self.state != LinkState::Disconnected {
                    self.frmr_pending = true;
                }
                return Vec::new();
            }
        };

        match control {
            Control::U { kind, pf } => {
                self.on_u_frame(now, kind, pf);
                Vec::new()
            }
            Control::S { kind, nr, pf } => {
                // Sequenced traffic is only meaningful on an open link.
                if self.state == LinkState::Connected {
                    self.on_s_frame(kind, nr, pf);
                }
                Vec::new()
            }
            Control::I { ns, nr, pf } => {
                if self.state != LinkState::Connected {
                    return Vec::new();
                }
                self.on_i_frame(now, ns, nr, pf, frame.data)
            }
        }
    }

    fn on_u_frame(&mut self, now: u64, kind: UKind, pf: bool) {
        match kind {
            UKind::Sabm => {
                // The peer (re)established the session; anything still
                // outstanding on our side is void.
                self.fail_pending();
                self.enter_connected(now);
                self.ua_pending = true;
                self.ua_pf = pf;
            }
            UKind::Ua => match self.state {
                LinkState::Connecting => self.enter_connected(now),
                LinkState::Disconnecting => self.enter_disconnected(false),
                _ => log::debug!("ignoring unexpected UA"),
            },
            UKind::Disc => {
                self.ua_pending = true;
                self.ua_pf = pf;
                if self.state != LinkState::Disconnected {
                    self.enter_disconnected(true);
                }
            }
            UKind::Frmr => {
                log::warn!("peer rejected a frame (FRMR), resetting the link");
                if self.state == LinkState::Connected {
                    self.fail_pending();
                    self.request_connect();
                }
            }
        }
    }

    fn on_s_frame(&mut self, kind: SKind, nr: u8, pf: bool) {
        match kind {
            SKind::Rr => {
                self.peer_busy = false;
                self.process_ack(nr, false);
            }
            SKind::Rej => {
                self.peer_busy = false;
                self.process_ack(nr, true);
            }
            SKind::Rnr => {
                self.peer_busy = true;
                self.process_ack(nr, false);
            }
        }

        if pf {
            self.force_ack = true;
        }
    }

    fn on_i_frame(&mut self, now: u64, ns: u8, nr: u8, pf: bool, data: Box<[u8]>) -> Vec<Vec<u8>> {
        // The piggybacked N(R) is valid regardless of N(S) ordering.
        self.process_ack(nr, false);

        if pf {
            self.force_ack = true;
        }

        if ns == self.next_nr {
            self.next_nr = seq(self.next_nr.wrapping_add(1));
            self.rej_armed = false;
            self.rej_pending = false;

            if self.ack_due.is_none() {
                self.ack_due = Some(now + self.ack_defer);
            }

            vec![data.into_vec()]
        } else {
            self.stats.out_of_order += 1;

            // One REJ per gap; everything else is dropped until the peer
            // rewinds to our expected N(S).
            if !self.rej_armed {
                self.rej_armed = true;
                self.rej_pending = true;
            }

            Vec::new()
        }
    }

    fn process_ack(&mut self, nr: u8, rewind: bool) {
        let result = if rewind {
            self.queue.rewind(nr)
        } else {
            self.queue.ack(nr)
        };

        match result {
            Ok(freed) => {
                if !freed.is_empty() {
                    for payload in freed {
                        self.sent_events.push_back((payload, true));
                    }
                    self.notify = true;
                }
            }
            Err(_) => {
                log::warn!("received N(R)={nr} outside the send window");
                self.stats.framing_errors += 1;
                self.frmr_pending = true;
            }
        }
    }

    /// Produces at most one frame, in transmit priority order: unnumbered
    /// traffic, owed acknowledgements, new I-frames, retransmissions,
    /// keep-alive.
    pub fn next_tx_frame(&mut self, now: u64) -> Option<Frame> {
        if self.closing {
            return None;
        }

        self.tick(now);

        if self.ua_pending {
            self.ua_pending = false;
            let pf = self.ua_pf;
            return Some(self.u_frame(UKind::Ua, pf, now));
        }

        if self.frmr_pending {
            self.frmr_pending = false;
            return Some(self.u_frame(UKind::Frmr, false, now));
        }

        if let Some(kind) = self.u_cmd {
            if !self.u_awaiting {
                self.u_awaiting = true;
                self.u_sent_at = now;
                return Some(self.u_frame(kind, false, now));
            }
        }

        if self.state != LinkState::Connected {
            return None;
        }

        if self.rej_pending {
            self.rej_pending = false;
            return Some(self.s_frame(SKind::Rej, false, now));
        }

        // A standalone RR only goes out if no I-frame is about to carry the
        // acknowledgement anyway.
        let i_ready = !self.peer_busy && self.queue.has_sendable();
        let owes_ack = self.last_nr_sent != self.next_nr;
        let ack_elapsed = self.ack_due.map_or(false, |due| now >= due);

        if !i_ready && (self.force_ack || (owes_ack && ack_elapsed)) {
            self.force_ack = false;
            return Some(self.s_frame(SKind::Rr, false, now));
        }

        if !self.peer_busy {
            if let Some(idx) = self.queue.next_send(now, self.retries) {
                return Some(self.i_frame(idx, now));
            }

            if let Some(idx) = self.queue.expired(now, self.retry_timeout) {
                if self.queue.retransmit(idx, now) {
                    return Some(self.i_frame(idx, now));
                }

                log::warn!("retry budget exhausted, dropping the connection");
                self.enter_disconnected(true);
                return None;
            }
        }

        if self.ka_timeout > 0 && now.saturating_sub(self.last_tx) >= self.ka_timeout {
            return Some(self.s_frame(SKind::Rr, true, now));
        }

        None
    }

    fn tick(&mut self, now: u64) {
        // A disconnected link with queued data re-initiates the handshake.
        if self.state == LinkState::Disconnected && !self.queue.is_empty() {
            self.request_connect();
        }

        if self.u_cmd.is_some()
            && self.u_awaiting
            && now >= self.u_sent_at.saturating_add(self.retry_timeout)
        {
            if self.u_retries == 0 {
                log::warn!("handshake retries exhausted");
                match self.state {
                    LinkState::Connecting => self.enter_disconnected(true),
                    LinkState::Disconnecting => self.enter_disconnected(false),
                    _ => self.u_cmd = None,
                }
            } else {
                self.u_retries -= 1;
                self.u_awaiting = false;
            }
        }
    }

    fn u_frame(&mut self, kind: UKind, pf: bool, now: u64) -> Frame {
        self.last_tx = now;
        self.stats.frames_tx += 1;

        Frame {
            address: ADDR_ABM,
            control: Control::U { kind, pf }.encode(),
            data: Box::default(),
        }
    }

    fn s_frame(&mut self, kind: SKind, pf: bool, now: u64) -> Frame {
        self.last_tx = now;
        self.last_nr_sent = self.next_nr;
        self.ack_due = None;
        self.stats.frames_tx += 1;

        Frame {
            address: ADDR_ABM,
            control: Control::S { kind, nr: self.next_nr, pf }.encode(),
            data: Box::default(),
        }
    }

    fn i_frame(&mut self, idx: usize, now: u64) -> Frame {
        self.last_tx = now;
        self.last_nr_sent = self.next_nr;
        self.ack_due = None;
        self.force_ack = false;
        self.stats.frames_tx += 1;

        let slot = self.queue.slot(idx);
        Frame {
            address: ADDR_ABM,
            control: Control::I {
                ns: slot.ns,
                nr: self.next_nr,
                pf: false,
            }
            .encode(),
            data: slot.payload.clone().into(),
        }
    }
}
