//! # Envelope Codec
//!
//! Frames are a 4-byte big-endian length followed by the bincode-encoded
//! [`Envelope`]:
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| bincode(Envelope)         |
//! +----------------+---------------------------+
//! ```
//!
//! Unlike a plain length-delimited codec the decoder does not fail the
//! stream on every bad frame. An oversized frame is skipped and reported as
//! [`InboundFrame::Oversized`]; a frame whose body does not decode (unknown
//! message discriminant, truncated fields) is reported as
//! [`InboundFrame::Undecodable`]. The connection turns both into rule
//! violations and decides whether to close. Only a length so large that
//! skipping it is unreasonable is a hard stream error.

use bincode::Options;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::NetworkError;
use super::message::Envelope;
use crate::config::MAX_MESSAGE_SIZE;

const LENGTH_PREFIX: usize = 4;

/// Multiple of the message limit up to which an oversized frame is skipped
/// instead of killing the stream.
const SKIPPABLE_FACTOR: usize = 10;

/// One decoded unit from the wire.
#[derive(Debug)]
pub enum InboundFrame {
    Envelope { envelope: Envelope, size: usize },
    Oversized { size: usize },
    Undecodable { size: usize, reason: String },
}

#[derive(Debug)]
pub struct EnvelopeCodec {
    max_message_size: usize,
    current_length: Option<usize>,
    /// Bytes of an oversized frame still to be thrown away.
    discard_remaining: usize,
}

impl EnvelopeCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            current_length: None,
            discard_remaining: 0,
        }
    }

    fn max_skippable(&self) -> usize {
        self.max_message_size.saturating_mul(SKIPPABLE_FACTOR)
    }

    fn discard(&mut self, src: &mut BytesMut) {
        let n = self.discard_remaining.min(src.len());
        src.advance(n);
        self.discard_remaining -= n;
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

/// Encode an envelope body with the wire options.
pub fn encode_envelope(envelope: &Envelope, limit: usize) -> Result<Vec<u8>, NetworkError> {
    wire_options(limit)
        .serialize(envelope)
        .map_err(|e| match *e {
            bincode::ErrorKind::SizeLimit => NetworkError::MessageTooLarge {
                size: limit.saturating_add(1),
                max: limit,
            },
            other => NetworkError::Serialization(other.to_string()),
        })
}

/// Decode an envelope body with the wire options. The limit stops a hostile
/// length field inside the body from allocating unbounded memory.
pub fn decode_envelope(bytes: &[u8], limit: usize) -> Result<Envelope, NetworkError> {
    Ok(wire_options(limit).deserialize(bytes)?)
}

/// Size of the frame body `envelope` would produce, without the prefix.
pub fn encoded_len(envelope: &Envelope) -> usize {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialized_size(envelope)
        .map(|n| n as usize)
        .unwrap_or(0)
}

fn wire_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(limit as u64)
}

impl Decoder for EnvelopeCodec {
    type Item = InboundFrame;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.discard_remaining > 0 {
            self.discard(src);
            if self.discard_remaining > 0 {
                return Ok(None);
            }
        }

        let length = match self.current_length {
            Some(length) => length,
            None => {
                if src.len() < LENGTH_PREFIX {
                    return Ok(None);
                }
                let length = src.get_u32() as usize;

                if length > self.max_skippable() {
                    return Err(NetworkError::FrameTooLarge {
                        size: length,
                        max: self.max_skippable(),
                    });
                }

                if length > self.max_message_size {
                    self.discard_remaining = length;
                    self.discard(src);
                    return Ok(Some(InboundFrame::Oversized { size: length }));
                }

                self.current_length = Some(length);
                length
            }
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let body = src.split_to(length);
        self.current_length = None;

        let frame = match decode_envelope(&body, self.max_message_size) {
            Ok(envelope) => InboundFrame::Envelope {
                envelope,
                size: length,
            },
            Err(e) => InboundFrame::Undecodable {
                size: length,
                reason: e.to_string(),
            },
        };
        Ok(Some(frame))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = NetworkError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_envelope(&envelope, self.max_message_size)?;
        if body.len() > self.max_message_size {
            return Err(NetworkError::MessageTooLarge {
                size: body.len(),
                max: self.max_message_size,
            });
        }

        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Message;

    fn ping(nonce: u64) -> Envelope {
        Envelope::new(1, Message::Ping { nonce })
    }

    fn expect_envelope(frame: Option<InboundFrame>) -> Envelope {
        match frame {
            Some(InboundFrame::Envelope { envelope, .. }) => envelope,
            other => panic!("expected envelope, got {:?}", other),
        }
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = EnvelopeCodec::default();
        let mut full = BytesMut::new();
        codec.encode(ping(7), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[3..full.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[full.len() - 1..]);

        assert_eq!(expect_envelope(codec.decode(&mut buf).unwrap()), ping(7));
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(ping(1), &mut buf).unwrap();
        codec.encode(ping(2), &mut buf).unwrap();

        assert_eq!(expect_envelope(codec.decode(&mut buf).unwrap()), ping(1));
        assert_eq!(expect_envelope(codec.decode(&mut buf).unwrap()), ping(2));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_skipped_and_stream_continues() {
        let mut codec = EnvelopeCodec::new(64);
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        buf.put_slice(&[0xAB; 40]);

        match codec.decode(&mut buf).unwrap() {
            Some(InboundFrame::Oversized { size }) => assert_eq!(size, 100),
            other => panic!("expected oversized, got {:?}", other),
        }
        assert!(buf.is_empty());

        // Remainder of the oversized body arrives together with a good frame.
        buf.put_slice(&[0xAB; 60]);
        let mut good = BytesMut::new();
        codec.encode(ping(9), &mut good).unwrap();
        buf.extend_from_slice(&good);

        assert_eq!(expect_envelope(codec.decode(&mut buf).unwrap()), ping(9));
    }

    #[test]
    fn garbage_body_is_undecodable_not_fatal() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(8);
        // protocol_version, then an enum discriminant no message uses
        buf.put_u32_le(1);
        buf.put_u32_le(0xFFFF);

        match codec.decode(&mut buf).unwrap() {
            Some(InboundFrame::Undecodable { size, .. }) => assert_eq!(size, 8),
            other => panic!("expected undecodable, got {:?}", other),
        }

        let mut good = BytesMut::new();
        codec.encode(ping(3), &mut good).unwrap();
        buf.extend_from_slice(&good);
        assert_eq!(expect_envelope(codec.decode(&mut buf).unwrap()), ping(3));
    }

    #[test]
    fn absurd_length_is_fatal() {
        let mut codec = EnvelopeCodec::new(64);
        let mut buf = BytesMut::new();
        buf.put_u32(64 * 10 + 1);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn encoder_refuses_oversized_messages() {
        let mut codec = EnvelopeCodec::new(32);
        let envelope = Envelope::new(
            1,
            Message::CloseConnection {
                reason: "x".repeat(100),
            },
        );
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(envelope, &mut buf),
            Err(NetworkError::MessageTooLarge { .. })
        ));
        assert!(buf.is_empty());
    }
}
