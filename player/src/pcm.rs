//! Raw sample buffer helpers.

/// Reinterprets a little-endian 16-bit byte stream as samples. A trailing
/// odd byte is dropped.
pub fn from_s16le(raw: &[u8]) -> Vec<i16> {
    raw.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_le_pairs() {
        let raw = [0x00, 0x00, 0xFF, 0x7F, 0x00, 0x80, 0x01];
        assert_eq!(from_s16le(&raw), vec![0, i16::MAX, i16::MIN]);
    }

    #[test]
    fn empty_input() {
        assert!(from_s16le(&[]).is_empty());
    }
}
