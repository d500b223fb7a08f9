//! Adapter exposing the raw framer as a [`tokio_util::codec`] pair, for
//! driving the framing layer over any `AsyncRead + AsyncWrite` transport.
//! Only framing is provided here; the reliable link engine is synchronous
//! and lives in [`crate::link`].

use bytes::BytesMut;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::crc::CrcMode;

use super::{decoder, encoder, Frame};

#[derive(Debug)]
pub struct Codec {
    dec: decoder::Decoder,
    crc: CrcMode,
}

impl Codec {
    pub fn new(crc: CrcMode) -> Self {
        Self {
            dec: decoder::Decoder::new(crc),
            crc,
        }
    }

    pub fn with_capacity(crc: CrcMode, cap: usize) -> Self {
        Self {
            dec: decoder::Decoder::with_capacity(crc, cap),
            crc,
        }
    }

    pub fn wrap<T>(self, io: T) -> Framed<T, Codec>
    where
        T: AsyncRead + AsyncWrite,
    {
        Framed::with_capacity(io, self, 4096)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CrcMode::default())
    }
}

impl tokio_util::codec::Encoder<&Frame> for Codec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encoder::encode(dst, frame, self.crc);
        Ok(())
    }
}

impl tokio_util::codec::Encoder<Frame> for Codec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(&frame, dst)
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.dec.process(src) {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    log::warn!("error decoding frame: {e}");

                    if src.is_empty() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use futures::{SinkExt, StreamExt};

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn test_framed_roundtrip() {
        let (a, b) = tokio::io::duplex(256);

        let mut tx = Codec::new(CrcMode::Crc16).wrap(a);
        let mut rx = Codec::new(CrcMode::Crc16).wrap(b);

        let frame = Frame {
            address: 0xFF,
            control: 0x20,
            data: vec![0x7E, 0x7D, 0x01, 0x02].into(),
        };

        tx.send(&frame).await.unwrap();
        SinkExt::<&Frame>::flush(&mut tx).await.unwrap();

        let received = rx.next().await.unwrap().unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_framed_skips_corrupt_frame() {
        let (a, b) = tokio::io::duplex(256);

        let mut tx = Codec::new(CrcMode::Crc16).wrap(a);
        let mut rx = Codec::new(CrcMode::Crc16).wrap(b);

        let good = Frame {
            address: 0xFF,
            control: 0x01,
            data: vec![0xAA].into(),
        };

        let mut corrupt = encoder::encode_bytes(&good, CrcMode::Crc16);
        corrupt[2] ^= 0xFF;

        use tokio::io::AsyncWriteExt;
        tx.get_mut().write_all(&corrupt).await.unwrap();
        tx.send(&good).await.unwrap();
        SinkExt::<&Frame>::flush(&mut tx).await.unwrap();

        let received = rx.next().await.unwrap().unwrap();
        assert_eq!(received, good);
    }
}
