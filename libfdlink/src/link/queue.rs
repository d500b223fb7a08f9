//! Outbound I-frame queue and sliding-window accounting.
//!
//! Slots form a ring in first-in first-out order: the transmitted prefix
//! (awaiting acknowledgement) is followed by queued payloads that have not
//! been assigned a sequence number yet. Acknowledgements always free slots
//! from the front; a REJ turns the transmitted prefix back into
//! retransmission candidates without disturbing the order.

use crate::frame::seq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    /// Holds a payload that has never been transmitted; no N(S) assigned.
    Queued,
    /// Transmitted, awaiting acknowledgement.
    InFlight,
    /// Transmitted, scheduled for retransmission after a REJ.
    Resend,
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub payload: Vec<u8>,
    pub state: SlotState,
    pub ns: u8,
    pub sent_at: u64,
    pub retries_left: u8,
}

/// Received N(R) outside the span of outstanding sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InvalidNr;

#[derive(Debug)]
pub(crate) struct TxQueue {
    slots: Box<[Slot]>,
    head: usize,
    occupied: usize,
    /// Length of the transmitted prefix (`InFlight` or `Resend` slots).
    in_flight: usize,
    pub next_ns: u8,
    pub confirm_ns: u8,
}

impl TxQueue {
    pub fn new(window: usize) -> Self {
        let slots = (0..window)
            .map(|_| Slot {
                payload: Vec::new(),
                state: SlotState::Free,
                ns: 0,
                sent_at: 0,
                retries_left: 0,
            })
            .collect();

        Self {
            slots,
            head: 0,
            occupied: 0,
            in_flight: 0,
            next_ns: 0,
            confirm_ns: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.occupied == self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Outstanding sequence numbers, `(next_ns - confirm_ns) mod 8`.
    pub fn outstanding(&self) -> u8 {
        seq(self.next_ns.wrapping_sub(self.confirm_ns))
    }

    pub fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    /// A payload is ready for (re)transmission.
    pub fn has_sendable(&self) -> bool {
        (0..self.occupied).any(|i| {
            matches!(
                self.slots[self.idx(i)].state,
                SlotState::Queued | SlotState::Resend
            )
        })
    }

    fn idx(&self, i: usize) -> usize {
        (self.head + i) % self.slots.len()
    }

    /// Copies `data` into the next free slot. False when the ring is full.
    pub fn enqueue(&mut self, data: &[u8]) -> bool {
        if self.is_full() {
            return false;
        }

        let idx = self.idx(self.occupied);
        let slot = &mut self.slots[idx];
        slot.payload.clear();
        slot.payload.extend_from_slice(data);
        slot.state = SlotState::Queued;
        self.occupied += 1;

        true
    }

    /// Selects the next slot to transmit: rewound slots first (keeping
    /// their N(S)), then the oldest queued payload, which gets the next
    /// N(S) and a fresh retry budget.
    pub fn next_send(&mut self, now: u64, retries: u8) -> Option<usize> {
        for i in 0..self.occupied {
            let idx = self.idx(i);

            match self.slots[idx].state {
                SlotState::InFlight => continue,
                SlotState::Resend => {
                    let slot = &mut self.slots[idx];
                    slot.state = SlotState::InFlight;
                    slot.sent_at = now;
                    return Some(idx);
                }
                SlotState::Queued => {
                    let ns = self.next_ns;
                    self.next_ns = seq(self.next_ns.wrapping_add(1));
                    self.in_flight += 1;

                    let slot = &mut self.slots[idx];
                    slot.state = SlotState::InFlight;
                    slot.ns = ns;
                    slot.sent_at = now;
                    slot.retries_left = retries;
                    return Some(idx);
                }
                SlotState::Free => return None,
            }
        }

        None
    }

    /// Oldest transmitted slot whose retry deadline has passed.
    pub fn expired(&self, now: u64, retry_timeout: u64) -> Option<usize> {
        if self.in_flight == 0 {
            return None;
        }

        let slot = &self.slots[self.head];
        if slot.state == SlotState::InFlight && now >= slot.sent_at.saturating_add(retry_timeout) {
            Some(self.head)
        } else {
            None
        }
    }

    /// Retry bookkeeping for an expired slot. False when the retry budget
    /// is exhausted.
    pub fn retransmit(&mut self, idx: usize, now: u64) -> bool {
        let slot = &mut self.slots[idx];

        if slot.retries_left == 0 {
            return false;
        }

        slot.retries_left -= 1;
        slot.sent_at = now;
        true
    }

    /// Frees every slot with N(S) in `[confirm_ns, nr)`, returning the
    /// acknowledged payloads in send order.
    pub fn ack(&mut self, nr: u8) -> Result<Vec<Vec<u8>>, InvalidNr> {
        let span = seq(nr.wrapping_sub(self.confirm_ns)) as usize;

        if span > self.in_flight {
            return Err(InvalidNr);
        }

        let mut freed = Vec::with_capacity(span);
        for _ in 0..span {
            let slot = &mut self.slots[self.head];
            slot.state = SlotState::Free;
            freed.push(std::mem::take(&mut slot.payload));

            self.head = (self.head + 1) % self.slots.len();
            self.occupied -= 1;
            self.in_flight -= 1;
        }

        self.confirm_ns = seq(nr);
        Ok(freed)
    }

    /// REJ recovery: acknowledge up to `nr`, then schedule the remaining
    /// transmitted slots for retransmission in order.
    pub fn rewind(&mut self, nr: u8) -> Result<Vec<Vec<u8>>, InvalidNr> {
        let freed = self.ack(nr)?;

        for i in 0..self.in_flight {
            let idx = self.idx(i);
            if self.slots[idx].state == SlotState::InFlight {
                self.slots[idx].state = SlotState::Resend;
            }
        }

        Ok(freed)
    }

    /// Drops every pending payload, returning them for failure
    /// notification. Sequence counters restart at zero.
    pub fn fail_all(&mut self) -> Vec<Vec<u8>> {
        let mut failed = Vec::with_capacity(self.occupied);

        while self.occupied > 0 {
            let slot = &mut self.slots[self.head];
            slot.state = SlotState::Free;
            failed.push(std::mem::take(&mut slot.payload));

            self.head = (self.head + 1) % self.slots.len();
            self.occupied -= 1;
        }

        self.in_flight = 0;
        self.next_ns = 0;
        self.confirm_ns = 0;
        failed
    }

    /// Sequence reset on (re)connect. Untransmitted payloads stay queued;
    /// transmitted-but-unacknowledged ones are returned as failed.
    pub fn reset_sequences(&mut self) -> Vec<Vec<u8>> {
        let mut failed = Vec::new();

        while self.in_flight > 0 {
            let slot = &mut self.slots[self.head];
            slot.state = SlotState::Free;
            failed.push(std::mem::take(&mut slot.payload));

            self.head = (self.head + 1) % self.slots.len();
            self.occupied -= 1;
            self.in_flight -= 1;
        }

        self.next_ns = 0;
        self.confirm_ns = 0;
        failed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(q: &mut TxQueue, now: u64) -> Vec<u8> {
        let mut sent = Vec::new();
        while let Some(idx) = q.next_send(now, 2) {
            sent.push(q.slot(idx).ns);
        }
        sent
    }

    #[test]
    fn test_enqueue_and_send_order() {
        let mut q = TxQueue::new(3);

        assert!(q.enqueue(b"a"));
        assert!(q.enqueue(b"b"));
        assert!(q.enqueue(b"c"));
        assert!(!q.enqueue(b"d"));
        assert!(q.is_full());

        assert_eq!(drain(&mut q, 0), [0, 1, 2]);
        assert_eq!(q.outstanding(), 3);
        assert_eq!(q.next_send(0, 2), None);
    }

    #[test]
    fn test_ack_frees_in_order() {
        let mut q = TxQueue::new(3);
        q.enqueue(b"a");
        q.enqueue(b"b");
        drain(&mut q, 0);

        let freed = q.ack(1).unwrap();
        assert_eq!(freed, [b"a".to_vec()]);
        assert_eq!(q.confirm_ns, 1);
        assert_eq!(q.outstanding(), 1);

        // Space opened up again.
        assert!(q.enqueue(b"c"));

        let freed = q.ack(2).unwrap();
        assert_eq!(freed, [b"b".to_vec()]);
        assert_eq!(q.outstanding(), 0);
    }

    #[test]
    fn test_ack_rejects_invalid_nr() {
        let mut q = TxQueue::new(2);
        q.enqueue(b"a");
        drain(&mut q, 0);

        // Only N(S)=0 is outstanding; nr=2 would acknowledge the future.
        assert_eq!(q.ack(2), Err(InvalidNr));
        assert_eq!(q.confirm_ns, 0);
    }

    #[test]
    fn test_sequence_wrap() {
        let mut q = TxQueue::new(2);

        // 256 consecutive frames, 32 full trips around the mod-8 space.
        for round in 0..256u16 {
            let byte = round as u8;
            assert!(q.enqueue(&[byte]));
            let idx = q.next_send(0, 2).unwrap();
            assert_eq!(q.slot(idx).ns, seq(byte));
            assert_eq!(q.ack(seq(byte.wrapping_add(1))).unwrap().len(), 1);
        }

        assert_eq!(q.outstanding(), 0);
    }

    #[test]
    fn test_rewind_resends_in_order() {
        let mut q = TxQueue::new(3);
        q.enqueue(b"a");
        q.enqueue(b"b");
        q.enqueue(b"c");
        assert_eq!(drain(&mut q, 0), [0, 1, 2]);

        // REJ with N(R)=1: "a" is acknowledged, "b" and "c" go again.
        let freed = q.rewind(1).unwrap();
        assert_eq!(freed, [b"a".to_vec()]);

        let idx = q.next_send(5, 2).unwrap();
        assert_eq!(q.slot(idx).ns, 1);
        assert_eq!(&q.slot(idx).payload, b"b");

        let idx = q.next_send(5, 2).unwrap();
        assert_eq!(q.slot(idx).ns, 2);
        assert_eq!(&q.slot(idx).payload, b"c");

        assert_eq!(q.next_send(5, 2), None);
    }

    #[test]
    fn test_expired_retransmit_budget() {
        let mut q = TxQueue::new(1);
        q.enqueue(b"a");
        let idx = q.next_send(0, 1).unwrap();

        assert_eq!(q.expired(50, 100), None);
        assert_eq!(q.expired(100, 100), Some(idx));

        assert!(q.retransmit(idx, 100));
        assert_eq!(q.expired(150, 100), None);
        assert_eq!(q.expired(200, 100), Some(idx));

        // Budget of one retry is now spent.
        assert!(!q.retransmit(idx, 200));
    }

    #[test]
    fn test_fail_all() {
        let mut q = TxQueue::new(3);
        q.enqueue(b"a");
        q.enqueue(b"b");
        q.next_send(0, 2);

        let failed = q.fail_all();
        assert_eq!(failed, [b"a".to_vec(), b"b".to_vec()]);
        assert!(q.is_empty());
        assert_eq!(q.outstanding(), 0);
        assert_eq!(q.next_ns, 0);
    }

    #[test]
    fn test_reset_sequences_keeps_queued() {
        let mut q = TxQueue::new(3);
        q.enqueue(b"a");
        q.enqueue(b"b");
        q.next_send(0, 2); // only "a" is transmitted

        let failed = q.reset_sequences();
        assert_eq!(failed, [b"a".to_vec()]);
        assert_eq!(q.next_ns, 0);

        // "b" is still queued and gets N(S)=0 in the new session.
        let idx = q.next_send(0, 2).unwrap();
        assert_eq!(q.slot(idx).ns, 0);
        assert_eq!(&q.slot(idx).payload, b"b");
    }
}
