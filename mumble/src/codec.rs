//! CELT codec selection.
//!
//! The concrete CELT implementations live behind the [`CeltCodec`] trait:
//! the process that embeds this crate resolves whatever CELT builds it has
//! (typically the 0.7.0 and 0.11.0 bitstreams) and registers one entry per
//! variant before connecting. The two ABI generations differ in how the
//! encode call is shaped; the trait absorbs that difference so the rest of
//! the client only ever deals in bitstream versions.

use std::fmt;
use std::sync::Arc;

use log::warn;
use thiserror::Error;

use crate::voice::PacketType;

#[derive(Debug, Error)]
#[error("codec error: {0}")]
pub struct CodecError(pub String);

pub trait CeltCodec: Send + Sync {
    /// The wire-compatibility id this build reports; advertised to the
    /// server during authentication.
    fn bitstream_version(&self) -> i32;

    fn new_encoder(&self) -> Box<dyn CeltEncoder>;

    fn new_decoder(&self) -> Box<dyn CeltDecoder>;
}

pub trait CeltEncoder: Send {
    fn set_prediction(&mut self, enabled: bool);

    fn set_bitrate(&mut self, bits_per_second: u32);

    /// Encodes one 10 ms frame into at most `max_len` bytes.
    fn encode(&mut self, pcm: &[i16], max_len: usize) -> Result<Vec<u8>, CodecError>;
}

pub trait CeltDecoder: Send {
    /// Decodes one subframe back to a 10 ms frame of PCM.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError>;
}

/// The set of CELT variants available in this process, in preference order.
/// Filled once at startup; read-only afterwards.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn CeltCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&mut self, codec: Arc<dyn CeltCodec>) {
        self.codecs.push(codec);
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Bitstream versions of every available variant, in registration order.
    pub fn versions(&self) -> Vec<i32> {
        self.codecs.iter().map(|c| c.bitstream_version()).collect()
    }

    /// Returns the variant matching `bitstream_version`, or the first
    /// available one when no version is requested.
    pub fn select(&self, bitstream_version: Option<i32>) -> Option<&Arc<dyn CeltCodec>> {
        match bitstream_version {
            None => self.codecs.first(),
            Some(v) => self.codecs.iter().find(|c| c.bitstream_version() == v),
        }
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("versions", &self.versions())
            .finish()
    }
}

/// Which of the server's two advertised codec slots we encode with.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CodecSlot {
    Alpha,
    Beta,
}

impl CodecSlot {
    pub fn packet_type(self) -> PacketType {
        match self {
            CodecSlot::Alpha => PacketType::CeltAlpha,
            CodecSlot::Beta => PacketType::CeltBeta,
        }
    }
}

/// Outcome of the CodecVersion exchange: the versions the server assigned
/// to the alpha and beta slots, and the slot we picked.
#[derive(Debug, Clone, Copy)]
pub struct CodecNegotiation {
    alpha: i32,
    beta: i32,
    slot: CodecSlot,
}

impl Default for CodecNegotiation {
    fn default() -> Self {
        CodecNegotiation {
            alpha: -1,
            beta: -1,
            slot: CodecSlot::Alpha,
        }
    }
}

impl CodecNegotiation {
    /// Applies a CodecVersion message: take the preferred slot when we have
    /// a matching build, fall back to the other, and keep going without a
    /// codec (warning once) when neither matches.
    pub fn apply(
        &mut self,
        registry: &CodecRegistry,
        alpha: i32,
        beta: i32,
        prefer_alpha: bool,
    ) {
        if prefer_alpha && registry.select(Some(alpha)).is_some() {
            *self = CodecNegotiation {
                alpha,
                beta: -1,
                slot: CodecSlot::Alpha,
            };
        } else if registry.select(Some(beta)).is_some() {
            *self = CodecNegotiation {
                alpha: -1,
                beta,
                slot: CodecSlot::Beta,
            };
        } else if !prefer_alpha && registry.select(Some(alpha)).is_some() {
            *self = CodecNegotiation {
                alpha,
                beta: -1,
                slot: CodecSlot::Alpha,
            };
        } else {
            *self = CodecNegotiation {
                alpha: -1,
                beta: -1,
                slot: CodecSlot::Alpha,
            };
            warn!("unable to find a CELT codec matching other clients");
        }
    }

    /// The active slot and its bitstream version.
    pub fn current(&self) -> (CodecSlot, i32) {
        match self.slot {
            CodecSlot::Alpha => (CodecSlot::Alpha, self.alpha),
            CodecSlot::Beta => (CodecSlot::Beta, self.beta),
        }
    }

    /// Bitstream version to decode a received packet of `typ` with.
    pub fn version_for(&self, typ: PacketType) -> i32 {
        match typ {
            PacketType::CeltBeta => self.beta,
            _ => self.alpha,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A stand-in codec: "encoding" truncates PCM bytes into the length
    /// budget and "decoding" yields silence, which is all the pipeline
    /// tests need.
    pub struct StubCodec(pub i32);

    struct StubEncoder;
    struct StubDecoder;

    impl CeltCodec for StubCodec {
        fn bitstream_version(&self) -> i32 {
            self.0
        }

        fn new_encoder(&self) -> Box<dyn CeltEncoder> {
            Box::new(StubEncoder)
        }

        fn new_decoder(&self) -> Box<dyn CeltDecoder> {
            Box::new(StubDecoder)
        }
    }

    impl CeltEncoder for StubEncoder {
        fn set_prediction(&mut self, _enabled: bool) {}

        fn set_bitrate(&mut self, _bits_per_second: u32) {}

        fn encode(&mut self, pcm: &[i16], max_len: usize) -> Result<Vec<u8>, CodecError> {
            Ok(pcm.iter().map(|&s| s as u8).take(max_len).collect())
        }
    }

    impl CeltDecoder for StubDecoder {
        fn decode(&mut self, _data: &[u8]) -> Result<Vec<i16>, CodecError> {
            Ok(vec![0; crate::voice::FRAME_SIZE])
        }
    }

    pub fn registry_with(versions: &[i32]) -> CodecRegistry {
        let mut registry = CodecRegistry::new();
        for &v in versions {
            registry.register(Arc::new(StubCodec(v)));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::testing::registry_with;
    use super::*;

    const ALPHA: i32 = -2147483637; // CELT 0.7.0 bitstream
    const BETA: i32 = -2147483632; // CELT 0.11.0 bitstream

    #[test]
    fn selection_by_version_and_default() {
        let registry = registry_with(&[BETA, ALPHA]);

        assert_eq!(
            registry.select(Some(ALPHA)).unwrap().bitstream_version(),
            ALPHA
        );
        assert_eq!(registry.select(None).unwrap().bitstream_version(), BETA);
        assert!(registry.select(Some(123)).is_none());
    }

    #[test]
    fn negotiation_prefers_alpha_when_available() {
        let registry = registry_with(&[ALPHA, BETA]);
        let mut n = CodecNegotiation::default();

        n.apply(&registry, ALPHA, BETA, true);
        assert_eq!(n.current(), (CodecSlot::Alpha, ALPHA));
    }

    #[test]
    fn negotiation_falls_back_to_beta() {
        let registry = registry_with(&[BETA]);
        let mut n = CodecNegotiation::default();

        n.apply(&registry, ALPHA, BETA, true);
        assert_eq!(n.current(), (CodecSlot::Beta, BETA));
    }

    #[test]
    fn negotiation_takes_alpha_when_not_preferred_but_only_match() {
        let registry = registry_with(&[ALPHA]);
        let mut n = CodecNegotiation::default();

        n.apply(&registry, ALPHA, BETA, false);
        assert_eq!(n.current(), (CodecSlot::Alpha, ALPHA));
    }

    #[test]
    fn negotiation_without_any_match() {
        let registry = registry_with(&[]);
        let mut n = CodecNegotiation::default();

        n.apply(&registry, ALPHA, BETA, true);
        assert_eq!(n.current(), (CodecSlot::Alpha, -1));
    }

    #[test]
    fn decode_version_follows_packet_type() {
        let registry = registry_with(&[BETA]);
        let mut n = CodecNegotiation::default();
        n.apply(&registry, ALPHA, BETA, false);

        assert_eq!(n.version_for(PacketType::CeltBeta), BETA);
        assert_eq!(n.version_for(PacketType::CeltAlpha), -1);
    }
}
