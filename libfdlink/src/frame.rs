//! HDLC control-field codec: information, supervisory and unnumbered
//! frames with modulo-8 sequence numbers.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Address octet used on a single point-to-point ABM link. Both command and
/// response frames carry the same address.
pub const ADDR_ABM: u8 = 0xFF;

/// Sequence numbers are 3 bits wide.
pub const SEQ_MODULO: u8 = 8;

/// Poll/final bit.
const PF: u8 = 0x10;

/// Masks `n` to the modulo-8 sequence space.
#[inline]
pub fn seq(n: u8) -> u8 {
    n & (SEQ_MODULO - 1)
}

/// Supervisory frame types (control bits 2..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SKind {
    /// Receive ready: acknowledges frames up to N(R) - 1.
    Rr = 0b00,
    /// Reject: requests retransmission starting at N(R).
    Rej = 0b01,
    /// Receive not ready: acknowledges like RR and asks the peer to pause.
    Rnr = 0b10,
}

/// Unnumbered frame types, identified by the control octet with the P/F
/// bit masked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum UKind {
    /// Set asynchronous balanced mode: connection request.
    Sabm = 0x2F,
    /// Unnumbered acknowledgement.
    Ua = 0x63,
    /// Disconnect request.
    Disc = 0x43,
    /// Frame reject: the peer received an undecodable frame.
    Frmr = 0x87,
}

/// Decoded HDLC control octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    I { ns: u8, nr: u8, pf: bool },
    S { kind: SKind, nr: u8, pf: bool },
    U { kind: UKind, pf: bool },
}

/// Control octet that does not decode to any supported frame type. The
/// receiver answers such frames with FRMR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidControl(pub u8);

impl std::fmt::Display for InvalidControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid control octet 0x{:02X}", self.0)
    }
}

impl std::error::Error for InvalidControl {}

impl Control {
    pub fn encode(self) -> u8 {
        match self {
            Control::I { ns, nr, pf } => {
                (seq(ns) << 1) | ((pf as u8) << 4) | (seq(nr) << 5)
            }
            Control::S { kind, nr, pf } => {
                0b01 | (u8::from(kind) << 2) | ((pf as u8) << 4) | (seq(nr) << 5)
            }
            Control::U { kind, pf } => u8::from(kind) | ((pf as u8) << 4),
        }
    }

    pub fn decode(byte: u8) -> Result<Control, InvalidControl> {
        let pf = byte & PF != 0;

        if byte & 0b1 == 0 {
            return Ok(Control::I {
                ns: (byte >> 1) & 0b111,
                nr: byte >> 5,
                pf,
            });
        }

        if byte & 0b11 == 0b01 {
            let kind = SKind::try_from((byte >> 2) & 0b11)
                .map_err(|_| InvalidControl(byte))?;

            return Ok(Control::S {
                kind,
                nr: byte >> 5,
                pf,
            });
        }

        let kind = UKind::try_from(byte & !PF).map_err(|_| InvalidControl(byte))?;
        Ok(Control::U { kind, pf })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_iframe_layout() {
        assert_eq!(Control::I { ns: 0, nr: 0, pf: false }.encode(), 0x00);
        assert_eq!(Control::I { ns: 1, nr: 0, pf: false }.encode(), 0x02);
        assert_eq!(Control::I { ns: 0, nr: 1, pf: false }.encode(), 0x20);
        assert_eq!(Control::I { ns: 7, nr: 7, pf: true }.encode(), 0xFE);

        assert_eq!(
            Control::decode(0x20),
            Ok(Control::I { ns: 0, nr: 1, pf: false })
        );
        assert_eq!(
            Control::decode(0xFE),
            Ok(Control::I { ns: 7, nr: 7, pf: true })
        );
    }

    #[test]
    fn test_sframe_layout() {
        assert_eq!(Control::S { kind: SKind::Rr, nr: 1, pf: false }.encode(), 0x21);
        assert_eq!(Control::S { kind: SKind::Rr, nr: 0, pf: true }.encode(), 0x11);
        assert_eq!(Control::S { kind: SKind::Rej, nr: 2, pf: false }.encode(), 0x45);
        assert_eq!(Control::S { kind: SKind::Rnr, nr: 0, pf: false }.encode(), 0x09);

        assert_eq!(
            Control::decode(0x45),
            Ok(Control::S { kind: SKind::Rej, nr: 2, pf: false })
        );
        assert_eq!(
            Control::decode(0x11),
            Ok(Control::S { kind: SKind::Rr, nr: 0, pf: true })
        );
    }

    #[test]
    fn test_uframe_layout() {
        assert_eq!(Control::U { kind: UKind::Sabm, pf: false }.encode(), 0x2F);
        assert_eq!(Control::U { kind: UKind::Sabm, pf: true }.encode(), 0x3F);
        assert_eq!(Control::U { kind: UKind::Ua, pf: false }.encode(), 0x63);
        assert_eq!(Control::U { kind: UKind::Disc, pf: false }.encode(), 0x43);
        assert_eq!(Control::U { kind: UKind::Frmr, pf: false }.encode(), 0x87);

        assert_eq!(
            Control::decode(0x3F),
            Ok(Control::U { kind: UKind::Sabm, pf: true })
        );
        assert_eq!(
            Control::decode(0x63),
            Ok(Control::U { kind: UKind::Ua, pf: false })
        );
    }

    #[test]
    fn test_invalid_controls() {
        // SREJ is not supported, and neither are unknown U types.
        assert_eq!(Control::decode(0x0D), Err(InvalidControl(0x0D)));
        assert_eq!(Control::decode(0x03), Err(InvalidControl(0x03)));
        assert_eq!(Control::decode(0xEF), Err(InvalidControl(0xEF)));
    }

    #[test]
    fn test_roundtrip() {
        for byte in 0..=u8::MAX {
            if let Ok(control) = Control::decode(byte) {
                assert_eq!(control.encode(), byte);
            }
        }
    }
}
