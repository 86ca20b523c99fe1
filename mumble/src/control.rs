//! Control channel framing.
//!
//! Every TLS frame is a 6-byte big-endian header (16-bit packet id, 32-bit
//! payload length) followed by a protobuf body — except UDPTunnel, whose
//! body is a raw [`AudioPacket`] as it would have travelled over UDP.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::msgs::{self, id};
use crate::voice::AudioPacket;

const HEADER_LEN: usize = 6;

/// Upper bound on a sane control frame, matching the reference clients.
const MAX_PAYLOAD_LEN: usize = 0x7F_FFFF;

macro_rules! control_packets {
    ( $( $name:ident = $id:path => $body:ty, )* ) => {
        /// A parsed control packet.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ControlPacket {
            $( $name($body), )*
            /// The tunneled voice path: an audio packet moved over TCP.
            UdpTunnel(AudioPacket),
            /// Packet id outside the known set; dropped by the dispatcher.
            Other(u16, Bytes),
        }

        $(
            impl From<$body> for ControlPacket {
                fn from(msg: $body) -> Self {
                    ControlPacket::$name(msg)
                }
            }
        )*

        impl ControlPacket {
            pub fn name(&self) -> &'static str {
                match self {
                    $( ControlPacket::$name(_) => stringify!($name), )*
                    ControlPacket::UdpTunnel(_) => "UDPTunnel",
                    ControlPacket::Other(..) => "unknown",
                }
            }

            fn id(&self) -> u16 {
                match self {
                    $( ControlPacket::$name(_) => $id, )*
                    ControlPacket::UdpTunnel(_) => id::UDP_TUNNEL,
                    ControlPacket::Other(id, _) => *id,
                }
            }

            fn encode_body(&self, dst: &mut BytesMut) {
                match self {
                    $( ControlPacket::$name(msg) => msg.encode_raw(dst), )*
                    ControlPacket::UdpTunnel(packet) => packet.serialize(dst),
                    ControlPacket::Other(_, bytes) => dst.put_slice(bytes),
                }
            }

            fn decode_body(id: u16, body: Bytes) -> io::Result<ControlPacket> {
                Ok(match id {
                    $( $id => ControlPacket::$name(
                        <$body>::decode(body).map_err(invalid_data)?,
                    ), )*
                    id::UDP_TUNNEL => ControlPacket::UdpTunnel(
                        // the server always includes the speaker session
                        AudioPacket::parse(&body, true).map_err(invalid_data)?,
                    ),
                    _ => ControlPacket::Other(id, body),
                })
            }
        }
    };
}

control_packets! {
    Version = id::VERSION => msgs::Version,
    Authenticate = id::AUTHENTICATE => msgs::Authenticate,
    Ping = id::PING => msgs::Ping,
    Reject = id::REJECT => msgs::Reject,
    ServerSync = id::SERVER_SYNC => msgs::ServerSync,
    ChannelRemove = id::CHANNEL_REMOVE => msgs::ChannelRemove,
    ChannelState = id::CHANNEL_STATE => msgs::ChannelState,
    UserRemove = id::USER_REMOVE => msgs::UserRemove,
    UserState = id::USER_STATE => msgs::UserState,
    BanList = id::BAN_LIST => msgs::BanList,
    TextMessage = id::TEXT_MESSAGE => msgs::TextMessage,
    PermissionDenied = id::PERMISSION_DENIED => msgs::PermissionDenied,
    Acl = id::ACL => msgs::Acl,
    QueryUsers = id::QUERY_USERS => msgs::QueryUsers,
    CryptSetup = id::CRYPT_SETUP => msgs::CryptSetup,
    ContextActionModify = id::CONTEXT_ACTION_MODIFY => msgs::ContextActionModify,
    ContextAction = id::CONTEXT_ACTION => msgs::ContextAction,
    UserList = id::USER_LIST => msgs::UserList,
    VoiceTarget = id::VOICE_TARGET => msgs::VoiceTarget,
    PermissionQuery = id::PERMISSION_QUERY => msgs::PermissionQuery,
    CodecVersion = id::CODEC_VERSION => msgs::CodecVersion,
    UserStats = id::USER_STATS => msgs::UserStats,
    RequestBlob = id::REQUEST_BLOB => msgs::RequestBlob,
    ServerConfig = id::SERVER_CONFIG => msgs::ServerConfig,
    SuggestConfig = id::SUGGEST_CONFIG => msgs::SuggestConfig,
}

fn invalid_data(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Length-prefixed control frame codec for the TLS stream.
#[derive(Debug, Default)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlPacket;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let id = header.get_u16();
        let len = header.get_u32() as usize;

        if len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too long"));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();

        ControlPacket::decode_body(id, body).map(Some)
    }
}

impl Encoder<ControlPacket> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ControlPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        item.encode_body(&mut body);

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u16(item.id());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::{AudioPayload, PacketType};

    fn roundtrip(packet: ControlPacket) -> ControlPacket {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(packet, &mut buf).unwrap();
        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        out
    }

    #[test]
    fn version_roundtrip() {
        let msg = msgs::Version {
            version: Some(0x0001_0204),
            release: Some("brumble".into()),
            os: Some("linux".into()),
            os_version: None,
        };
        match roundtrip(msg.clone().into()) {
            ControlPacket::Version(v) => assert_eq!(v, msg),
            other => panic!("wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn incremental_decode() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        let msg = msgs::ServerSync {
            session: Some(7),
            max_bandwidth: Some(72000),
            welcome_text: None,
            permissions: None,
        };
        codec.encode(msg.clone().into(), &mut buf).unwrap();

        // feed the frame one byte at a time
        let bytes = buf.split();
        let mut partial = BytesMut::new();
        let mut result = None;
        for b in bytes {
            partial.put_u8(b);
            if let Some(pkt) = codec.decode(&mut partial).unwrap() {
                result = Some(pkt);
            }
        }
        match result.unwrap() {
            ControlPacket::ServerSync(v) => assert_eq!(v, msg),
            other => panic!("wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn unknown_id_is_preserved_as_other() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u16(999);
        buf.put_u32(3);
        buf.put_slice(&[1, 2, 3]);

        match codec.decode(&mut buf).unwrap().unwrap() {
            ControlPacket::Other(id, body) => {
                assert_eq!(id, 999);
                assert_eq!(&body[..], &[1, 2, 3]);
            }
            other => panic!("wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn tunnel_carries_audio_packet() {
        let packet = AudioPacket {
            typ: PacketType::CeltAlpha,
            target: 0,
            payload: AudioPayload::Voice {
                session: Some(3),
                sequence: 12,
                frames: vec![vec![9; 40], vec![]],
                position: None,
            },
        };

        match roundtrip(ControlPacket::UdpTunnel(packet.clone())) {
            ControlPacket::UdpTunnel(p) => assert_eq!(p, packet),
            other => panic!("wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u16(0);
        buf.put_u32(0x0100_0000);
        assert!(codec.decode(&mut buf).is_err());
    }
}
