use bytes::{Buf, BytesMut};

use crate::crc::CrcMode;

use super::{consts, Frame, HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes outside any frame were skipped while hunting for a flag.
    Junk,
    /// An escape octet was followed by a flag or another escape.
    InvalidEscape,
    /// A complete frame was shorter than header plus checksum.
    Truncated,
    /// The frame check sequence did not match.
    Checksum,
    /// The frame did not fit into the reassembly buffer.
    Overflow,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            DecodeError::Junk => "bytes outside any frame",
            DecodeError::InvalidEscape => "invalid escape sequence",
            DecodeError::Truncated => "frame shorter than header and checksum",
            DecodeError::Checksum => "frame check sequence mismatch",
            DecodeError::Overflow => "frame exceeds reassembly buffer",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Skipping input until the next flag octet.
    Hunt,
    /// Accumulating de-stuffed frame bytes.
    Read,
}

enum Scan {
    NeedMore,
    Empty,
    Complete,
}

/// Streaming HDLC decoder.
///
/// Input bytes are pushed in arbitrary chunks via [`Decoder::process`];
/// framing state is kept across calls. The reassembly buffer is bounded:
/// frames larger than the configured capacity are dropped with
/// [`DecodeError::Overflow`].
#[derive(Debug)]
pub struct Decoder {
    buf: Vec<u8>,
    cap: usize,
    state: State,
    esc: bool,
    frame_len: usize,
    crc: CrcMode,
}

impl Decoder {
    pub fn new(crc: CrcMode) -> Self {
        Self::with_capacity(crc, 4096)
    }

    pub fn with_capacity(crc: CrcMode, cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            cap,
            state: State::Hunt,
            esc: false,
            frame_len: 0,
            crc,
        }
    }

    /// Consumes bytes from `src` until a complete frame is decoded, a
    /// framing error is detected, or the input is exhausted.
    ///
    /// On error the offending bytes have already been consumed; calling
    /// again continues with the remaining input. `Ok(None)` means all input
    /// was consumed without completing a frame.
    pub fn process(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }

            match self.state {
                State::Hunt => match src.iter().position(|b| *b == consts::FLAG) {
                    Some(i) => {
                        src.advance(i + 1);
                        self.state = State::Read;
                        self.esc = false;

                        if i > 0 {
                            return Err(DecodeError::Junk);
                        }
                    }
                    None => {
                        let n = src.len();
                        src.advance(n);
                        return Err(DecodeError::Junk);
                    }
                },
                State::Read => match self.scan(src)? {
                    Scan::NeedMore => return Ok(None),
                    Scan::Empty => continue,
                    Scan::Complete => return self.finish().map(Some),
                },
            }
        }
    }

    fn scan(&mut self, src: &mut BytesMut) -> Result<Scan, DecodeError> {
        let mut i = 0;

        while i < src.len() {
            let b = src[i];
            i += 1;

            if self.esc {
                self.esc = false;

                match b {
                    consts::FLAG => {
                        // Aborted frame. The flag also opens the next one.
                        src.advance(i);
                        self.restart();
                        return Err(DecodeError::InvalidEscape);
                    }
                    consts::ESCAPE => {
                        src.advance(i);
                        self.restart();
                        self.state = State::Hunt;
                        return Err(DecodeError::InvalidEscape);
                    }
                    _ => self.push(b ^ consts::ESCAPE_MASK),
                }
            } else {
                match b {
                    consts::ESCAPE => self.esc = true,
                    consts::FLAG => {
                        src.advance(i);

                        if self.frame_len == 0 {
                            // Back-to-back flags, or one flag shared between
                            // two frames.
                            return Ok(Scan::Empty);
                        }

                        return Ok(Scan::Complete);
                    }
                    _ => self.push(b),
                }
            }
        }

        let n = src.len();
        src.advance(n);
        Ok(Scan::NeedMore)
    }

    fn finish(&mut self) -> Result<Frame, DecodeError> {
        // The decoder stays in `Read`: the closing flag may already have
        // opened the next frame.
        if self.frame_len > self.buf.len() {
            self.restart();
            return Err(DecodeError::Overflow);
        }

        let crc_len = self.crc.len();
        if self.buf.len() < HEADER_LEN + crc_len {
            self.restart();
            return Err(DecodeError::Truncated);
        }

        let body_len = self.buf.len() - crc_len;

        if !self.crc.is_empty() {
            let mut digest = self.crc.digest();
            digest.put(&self.buf[..body_len]);

            let mut tail = [0u8; 4];
            tail[..crc_len].copy_from_slice(&self.buf[body_len..]);

            if digest.value() != u32::from_le_bytes(tail) {
                self.restart();
                return Err(DecodeError::Checksum);
            }
        }

        let frame = Frame {
            address: self.buf[0],
            control: self.buf[1],
            data: self.buf[HEADER_LEN..body_len].into(),
        };

        self.restart();
        Ok(frame)
    }

    fn push(&mut self, byte: u8) {
        if self.buf.len() < self.cap {
            self.buf.push(byte);
        }
        self.frame_len += 1;
    }

    fn restart(&mut self) {
        self.buf.clear();
        self.frame_len = 0;
        self.esc = false;
    }
}

#[cfg(test)]
mod test {
    use bytes::BufMut;

    use super::super::{encode, encode_bytes};
    use super::*;

    fn frame(address: u8, control: u8, data: &[u8]) -> Frame {
        Frame {
            address,
            control,
            data: data.into(),
        }
    }

    #[test]
    fn test_decode_crc16() {
        let wire = [
            0x7E, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0xB1, 0x29, 0x7E,
        ];

        let mut dec = Decoder::new(CrcMode::Crc16);
        let mut buf = BytesMut::from(&wire[..]);

        assert_eq!(dec.process(&mut buf), Ok(Some(frame(b'1', b'2', b"3456789"))));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_partial_feed() {
        // Escaped 0x7E in the payload, split right after the escape octet.
        let wire = [0x7E, 0xFF, 0x20, 0x7D, 0x5E, 0x7E];

        let mut dec = Decoder::new(CrcMode::None);

        let mut head = BytesMut::from(&wire[..4]);
        assert_eq!(dec.process(&mut head), Ok(None));

        let mut tail = BytesMut::from(&wire[4..]);
        assert_eq!(
            dec.process(&mut tail),
            Ok(Some(frame(0xFF, 0x20, &[0x7E])))
        );
    }

    #[test]
    fn test_decode_skips_junk() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x01, 0x02, 0x03]);
        buf.put_slice(&[0x7E, 0xFF, 0x20, 0x7E]);

        let mut dec = Decoder::new(CrcMode::None);
        assert_eq!(dec.process(&mut buf), Err(DecodeError::Junk));
        assert_eq!(dec.process(&mut buf), Ok(Some(frame(0xFF, 0x20, &[]))));
    }

    #[test]
    fn test_decode_shared_flag() {
        // Two frames, the middle flag closes the first and opens the second.
        let wire = [0x7E, 0xFF, 0x01, 0x7E, 0xFF, 0x02, 0x7E];

        let mut dec = Decoder::new(CrcMode::None);
        let mut buf = BytesMut::from(&wire[..]);

        assert_eq!(dec.process(&mut buf), Ok(Some(frame(0xFF, 0x01, &[]))));
        assert_eq!(dec.process(&mut buf), Ok(Some(frame(0xFF, 0x02, &[]))));
        assert_eq!(dec.process(&mut buf), Ok(None));
    }

    #[test]
    fn test_decode_idle_flags() {
        let mut dec = Decoder::new(CrcMode::None);
        let mut buf = BytesMut::from(&[0x7E, 0x7E, 0x7E, 0x7E][..]);

        assert_eq!(dec.process(&mut buf), Ok(None));
    }

    #[test]
    fn test_decode_truncated() {
        // One interior byte cannot hold address and control; the frame is
        // dropped and the next one decodes.
        let wire = [0x7E, 0x31, 0x7E, 0xFF, 0x20, 0x7E];

        let mut dec = Decoder::new(CrcMode::None);
        let mut buf = BytesMut::from(&wire[..]);

        assert_eq!(dec.process(&mut buf), Err(DecodeError::Truncated));
        assert_eq!(dec.process(&mut buf), Ok(Some(frame(0xFF, 0x20, &[]))));

        // With a checksum configured, header alone is short as well.
        let mut dec = Decoder::new(CrcMode::Crc16);
        let mut buf = BytesMut::from(&[0x7E, 0xFF, 0x20, 0x7E][..]);
        assert_eq!(dec.process(&mut buf), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_checksum_mismatch_then_recover() {
        let good = encode_bytes(&frame(0xFF, 0x00, b"hello"), CrcMode::Crc16);

        let mut corrupted = BytesMut::new();
        corrupted.put_slice(&good);
        corrupted[2] ^= 0x01;

        let mut buf = BytesMut::new();
        buf.put_slice(&corrupted);
        buf.put_slice(&good[1..]); // shared flag with the corrupted frame

        let mut dec = Decoder::new(CrcMode::Crc16);
        assert_eq!(dec.process(&mut buf), Err(DecodeError::Checksum));
        assert_eq!(
            dec.process(&mut buf),
            Ok(Some(frame(0xFF, 0x00, b"hello")))
        );
    }

    #[test]
    fn test_decode_invalid_escape() {
        // Escape followed by a flag aborts the frame; the next one decodes.
        let wire = [0x7E, 0xFF, 0x20, 0x7D, 0x7E, 0xFF, 0x01, 0x7E];

        let mut dec = Decoder::new(CrcMode::None);
        let mut buf = BytesMut::from(&wire[..]);

        assert_eq!(dec.process(&mut buf), Err(DecodeError::InvalidEscape));
        assert_eq!(dec.process(&mut buf), Ok(Some(frame(0xFF, 0x01, &[]))));
    }

    #[test]
    fn test_decode_overflow() {
        let big = encode_bytes(&frame(0xFF, 0x00, &[0x55; 64]), CrcMode::Crc16);

        let mut dec = Decoder::with_capacity(CrcMode::Crc16, 16);
        let mut buf = BytesMut::from(&big[..]);

        assert_eq!(dec.process(&mut buf), Err(DecodeError::Overflow));

        // A frame that fits still decodes afterwards.
        let small = encode_bytes(&frame(0xFF, 0x00, b"ok"), CrcMode::Crc16);
        let mut buf = BytesMut::from(&small[..]);
        assert_eq!(dec.process(&mut buf), Ok(Some(frame(0xFF, 0x00, b"ok"))));
    }

    #[test]
    fn test_roundtrip_stuffing_stress() {
        let payloads: [&[u8]; 4] = [
            &[0x7E; 32],
            &[0x7D; 32],
            &[0x7E, 0x7D, 0x7E, 0x7D, 0x20, 0x5E, 0x5D],
            &[],
        ];

        for payload in payloads {
            let original = frame(0xFF, 0x20, payload);

            let mut buf = BytesMut::new();
            encode(&mut buf, &original, CrcMode::Crc32);

            let mut dec = Decoder::new(CrcMode::Crc32);
            assert_eq!(dec.process(&mut buf), Ok(Some(original)));
        }
    }
}
