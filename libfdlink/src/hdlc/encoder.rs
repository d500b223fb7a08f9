use bytes::{BufMut, BytesMut};

use crate::crc::{CrcMode, Digest};

use super::{consts, Frame};

struct ByteEscape<B: BufMut> {
    buf: B,
}

impl<B: BufMut> ByteEscape<B> {
    fn new(buf: B) -> Self {
        Self { buf }
    }

    fn put_u8(&mut self, byte: u8) {
        match byte {
            consts::ESCAPE | consts::FLAG => self
                .buf
                .put_slice(&[consts::ESCAPE, consts::ESCAPE_MASK ^ byte]),
            _ => self.buf.put_u8(byte),
        }
    }

    fn put_flag(&mut self) {
        self.buf.put_u8(consts::FLAG)
    }
}

struct FrameWriter<B: BufMut> {
    buf: ByteEscape<B>,
    crc: Digest,
    crc_len: usize,
}

impl<B: BufMut> FrameWriter<B> {
    fn new(buf: B, crc: CrcMode) -> Self {
        Self {
            buf: ByteEscape::new(buf),
            crc: crc.digest(),
            crc_len: crc.len(),
        }
    }

    fn flag(&mut self) -> &mut Self {
        self.buf.put_flag();
        self
    }

    fn put_u8(&mut self, byte: u8) -> &mut Self {
        self.crc.put_u8(byte);
        self.buf.put_u8(byte);
        self
    }

    fn put(&mut self, bytes: &[u8]) -> &mut Self {
        for b in bytes {
            self.put_u8(*b);
        }
        self
    }

    fn finish(&mut self) {
        let value = self.crc.value().to_le_bytes();
        for b in &value[..self.crc_len] {
            self.buf.put_u8(*b);
        }
        self.flag();
    }
}

/// Encodes one frame including the opening flag.
pub fn encode(dst: &mut BytesMut, frame: &Frame, crc: CrcMode) {
    // Worst case every octet is escaped, plus flags and checksum.
    dst.reserve((frame.data.len() + super::HEADER_LEN + crc.len()) * 2 + 2);

    let mut w = FrameWriter::new(dst, crc);
    w.flag();
    w.put_u8(frame.address);
    w.put_u8(frame.control);
    w.put(&frame.data);
    w.finish();
}

/// Encodes one frame without an opening flag, for transmission directly
/// after a previous frame. The closing flag of the preceding frame doubles
/// as the opening flag of this one.
pub fn encode_continued(dst: &mut BytesMut, frame: &Frame, crc: CrcMode) {
    dst.reserve((frame.data.len() + super::HEADER_LEN + crc.len()) * 2 + 1);

    let mut w = FrameWriter::new(dst, crc);
    w.put_u8(frame.address);
    w.put_u8(frame.control);
    w.put(&frame.data);
    w.finish();
}

pub fn encode_bytes(frame: &Frame, crc: CrcMode) -> BytesMut {
    let mut buf = BytesMut::new();
    encode(&mut buf, frame, crc);
    buf
}
