//! UDP voice datagrams: the audio/ping packet layout and the codec that
//! pairs it with the OCB2 crypto layer for use with [`UdpFramed`].
//!
//! [`UdpFramed`]: tokio_util::udp::UdpFramed

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::crypt::{CryptState, HEADER_SIZE};
use crate::varint;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 1;
pub const FRAMES_PER_SECOND: usize = 100;

/// Samples per 10 ms frame at 48 kHz.
pub const FRAME_SIZE: usize = (SAMPLE_RATE as usize) / FRAMES_PER_SECOND;

/// A subframe length field is 7 bits wide.
pub const MAX_SUBFRAME_LEN: usize = 0x7F;

/// Voice packet destination selectors (the 5-bit target field).
pub mod target {
    pub const NORMAL: u8 = 0;
    pub const WHISPER_CHANNEL: u8 = 1;
    pub const WHISPER_INCOMING: u8 = 2;
    pub const LOOPBACK: u8 = 31;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketType {
    CeltAlpha = 0,
    Ping = 1,
    Speex = 2,
    CeltBeta = 3,
}

impl PacketType {
    fn from_bits(bits: u8) -> Option<PacketType> {
        match bits {
            0 => Some(PacketType::CeltAlpha),
            1 => Some(PacketType::Ping),
            2 => Some(PacketType::Speex),
            3 => Some(PacketType::CeltBeta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    pub typ: PacketType,
    pub target: u8,
    pub payload: AudioPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioPayload {
    Ping {
        timestamp: u64,
    },
    Voice {
        /// Speaker session id; present on packets from the server, absent
        /// on packets we send.
        session: Option<u64>,
        sequence: u64,
        /// Encoded subframes, at most [`MAX_SUBFRAME_LEN`] bytes each. An
        /// empty trailing frame is the end-of-transmission terminator.
        frames: Vec<Vec<u8>>,
        position: Option<[f32; 3]>,
    },
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum VoiceError {
    #[error("truncated packet")]
    Truncated,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

impl AudioPacket {
    pub fn ping(timestamp: u64) -> AudioPacket {
        AudioPacket {
            typ: PacketType::Ping,
            target: 0,
            payload: AudioPayload::Ping { timestamp },
        }
    }

    pub fn is_ping(&self) -> bool {
        self.typ == PacketType::Ping
    }

    pub fn serialize(&self, dst: &mut impl BufMut) {
        dst.put_u8((self.typ as u8) << 5 | (self.target & 0x1F));

        match &self.payload {
            AudioPayload::Ping { timestamp } => {
                varint::encode(dst, *timestamp);
            }
            AudioPayload::Voice {
                session,
                sequence,
                frames,
                position,
            } => {
                if let Some(session) = session {
                    varint::encode(dst, *session);
                }
                varint::encode(dst, *sequence);

                for (i, frame) in frames.iter().enumerate() {
                    let len = frame.len().min(MAX_SUBFRAME_LEN) as u8;
                    let more = i + 1 < frames.len();
                    dst.put_u8(if more { 0x80 | len } else { len });
                    dst.put_slice(&frame[..len as usize]);
                }

                if let Some([x, y, z]) = position {
                    dst.put_slice(&x.to_le_bytes());
                    dst.put_slice(&y.to_le_bytes());
                    dst.put_slice(&z.to_le_bytes());
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize(&mut buf);
        buf
    }

    /// Parses a packet. `has_session` is true for server-to-client packets,
    /// which carry the speaker's session id before the sequence number.
    pub fn parse(src: &[u8], has_session: bool) -> Result<AudioPacket, VoiceError> {
        let mut src = src;

        if !src.has_remaining() {
            return Err(VoiceError::Truncated);
        }

        let head = src.get_u8();
        let typ = PacketType::from_bits(head >> 5).ok_or(VoiceError::UnknownType(head >> 5))?;
        let target = head & 0x1F;

        let payload = if typ == PacketType::Ping {
            AudioPayload::Ping {
                timestamp: varint::decode(&mut src).ok_or(VoiceError::Truncated)?,
            }
        } else {
            let session = if has_session {
                Some(varint::decode(&mut src).ok_or(VoiceError::Truncated)?)
            } else {
                None
            };
            let sequence = varint::decode(&mut src).ok_or(VoiceError::Truncated)?;

            let mut frames = Vec::new();
            loop {
                if !src.has_remaining() {
                    return Err(VoiceError::Truncated);
                }
                let head = src.get_u8();
                let len = (head & 0x7F) as usize;
                if src.remaining() < len {
                    return Err(VoiceError::Truncated);
                }
                let mut frame = vec![0; len];
                src.copy_to_slice(&mut frame);
                frames.push(frame);

                if head & 0x80 == 0 {
                    break;
                }
            }

            let position = if src.remaining() >= 12 {
                Some([
                    f32::from_le_bytes([src.get_u8(), src.get_u8(), src.get_u8(), src.get_u8()]),
                    f32::from_le_bytes([src.get_u8(), src.get_u8(), src.get_u8(), src.get_u8()]),
                    f32::from_le_bytes([src.get_u8(), src.get_u8(), src.get_u8(), src.get_u8()]),
                ])
            } else {
                None
            };

            AudioPayload::Voice {
                session,
                sequence,
                frames,
                position,
            }
        };

        Ok(AudioPacket {
            typ,
            target,
            payload,
        })
    }
}

/// Codec for the voice socket: serializes outgoing packets through
/// [`CryptState::encrypt`] and runs incoming datagrams through
/// [`CryptState::decrypt`] before parsing.
///
/// Until the server's CryptSetup arrives there is no cipher state; both
/// directions drop packets in that window.
#[derive(Default)]
pub struct VoiceCodec {
    crypt: Option<CryptState>,
}

impl VoiceCodec {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_crypt(&mut self, crypt: CryptState) {
        self.crypt = Some(crypt);
    }

    pub fn crypt_mut(&mut self) -> Option<&mut CryptState> {
        self.crypt.as_mut()
    }

    pub fn ready(&self) -> bool {
        self.crypt.is_some()
    }
}

impl Decoder for VoiceCodec {
    type Item = AudioPacket;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let datagram = src.split();

        // anything shorter than the crypto header cannot be valid
        if datagram.len() <= HEADER_SIZE {
            return Ok(None);
        }

        let crypt = match &mut self.crypt {
            Some(crypt) => crypt,
            None => return Ok(None),
        };

        let plain = match crypt.decrypt(&datagram) {
            Ok(plain) => plain,
            Err(e) => {
                log::debug!("dropping datagram: {}", e);
                return Ok(None);
            }
        };

        match AudioPacket::parse(&plain, true) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => {
                log::debug!("dropping malformed voice packet: {}", e);
                Ok(None)
            }
        }
    }
}

impl Encoder<AudioPacket> for VoiceCodec {
    type Error = io::Error;

    fn encode(&mut self, item: AudioPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let crypt = self
            .crypt
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "crypto not initialized"))?;

        let datagram = crypt.encrypt(&item.to_bytes());
        dst.put_slice(&datagram);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(
        session: Option<u64>,
        sequence: u64,
        frames: Vec<Vec<u8>>,
        position: Option<[f32; 3]>,
    ) -> AudioPacket {
        AudioPacket {
            typ: PacketType::CeltAlpha,
            target: target::NORMAL,
            payload: AudioPayload::Voice {
                session,
                sequence,
                frames,
                position,
            },
        }
    }

    #[test]
    fn header_bits() {
        let p = AudioPacket {
            typ: PacketType::CeltBeta,
            target: target::LOOPBACK,
            payload: AudioPayload::Voice {
                session: None,
                sequence: 0,
                frames: vec![vec![]],
                position: None,
            },
        };
        let bytes = p.to_bytes();
        assert_eq!(bytes[0], 3 << 5 | 31);
    }

    #[test]
    fn ping_roundtrip() {
        let p = AudioPacket::ping(0xDEAD_BEEF);
        let parsed = AudioPacket::parse(&p.to_bytes(), true).unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn voice_roundtrip_matrix() {
        let lens = [0usize, 1, 60, 127];

        for count in 1..=10 {
            for &len in &lens {
                for positional in [false, true] {
                    let frames: Vec<Vec<u8>> = (0..count)
                        .map(|i| (0..len).map(|j| (i * 31 + j) as u8).collect())
                        .collect();
                    let position = positional.then(|| [1.0f32, -2.5, 100.0]);

                    let p = voice(Some(9), 1337, frames, position);
                    let parsed = AudioPacket::parse(&p.to_bytes(), true).unwrap();
                    assert_eq!(parsed, p, "count={} len={}", count, len);
                }
            }
        }
    }

    #[test]
    fn outgoing_packet_has_no_session() {
        let p = voice(None, 42, vec![vec![1, 2, 3], vec![]], None);
        let bytes = p.to_bytes();
        let parsed = AudioPacket::parse(&bytes, false).unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn terminator_frame_survives() {
        // a transmission's last packet carries a zero-length terminator
        let p = voice(Some(1), 10, vec![vec![0xAB; 20], vec![]], None);
        let parsed = AudioPacket::parse(&p.to_bytes(), true).unwrap();

        match parsed.payload {
            AudioPayload::Voice { frames, .. } => {
                assert_eq!(frames.len(), 2);
                assert!(frames[1].is_empty());
            }
            _ => panic!("not a voice payload"),
        }
    }

    #[test]
    fn truncated_subframe_rejected() {
        let p = voice(Some(1), 0, vec![vec![7; 50]], None);
        let bytes = p.to_bytes();
        assert_eq!(
            AudioPacket::parse(&bytes[..bytes.len() - 1], true),
            Err(VoiceError::Truncated)
        );
    }
}
