//! Outgoing audio quality versus the server's bandwidth ceiling, and the
//! UDP link-quality policy.

use std::time::Duration;

/// Minimum bitrate we will degrade to before giving up.
const MIN_BITRATE: u32 = 8_000;

/// Grace period after connecting before the link-quality policy may turn
/// UDP off.
const UDP_GRACE: Duration = Duration::from_secs(20);

/// Tunable audio transmission parameters, shared between the engine (which
/// adjusts them when the server announces a cap) and the senders (which
/// read them per packet).
#[derive(Debug, Clone, Copy)]
pub struct AudioConfig {
    pub bitrate: u32,
    pub frames_per_packet: usize,
    pub max_bandwidth: Option<u32>,
    /// Whether outgoing packets carry the 12-byte positional suffix.
    pub transmit_position: bool,
}

impl AudioConfig {
    pub fn new(bitrate: u32, frames_per_packet: usize) -> Self {
        AudioConfig {
            bitrate,
            frames_per_packet: frames_per_packet.max(1),
            max_bandwidth: None,
            transmit_position: false,
        }
    }

    /// Total outgoing bits per second including per-packet overhead:
    /// IP (20) + UDP (8) + crypto header (4) + packet type (1) + sequence
    /// (2) + optional positional data, plus the tunneling surcharge when
    /// voice goes over TCP, times `800 / frames` packets per second.
    pub fn bandwidth(&self, udp: bool) -> u32 {
        let frames = self.frames_per_packet as u32;
        let mut overhead = 20 + 8 + 4 + 1 + 2 + frames;
        if self.transmit_position {
            overhead += 12;
        }
        if !udp {
            overhead += 12;
        }
        overhead * (800 / frames) + self.bitrate
    }

    /// Applies a server-announced bandwidth ceiling: first relax frames per
    /// packet, then walk the bitrate down in 1 kbit steps until the total
    /// fits, clamped at 8 kbit/s. Returns true if anything changed.
    pub fn apply_max_bandwidth(&mut self, max_bandwidth: u32, udp: bool) -> bool {
        if self.max_bandwidth == Some(max_bandwidth) {
            return false;
        }
        self.max_bandwidth = Some(max_bandwidth);

        let old = (self.bitrate, self.frames_per_packet);

        if self.bandwidth(udp) > max_bandwidth {
            if self.frames_per_packet <= 4 && max_bandwidth <= 32_000 {
                self.frames_per_packet = 4;
            } else if self.frames_per_packet == 1 && max_bandwidth <= 64_000 {
                self.frames_per_packet = 2;
            } else if self.frames_per_packet == 2 && max_bandwidth <= 48_000 {
                self.frames_per_packet = 4;
            }

            while self.bitrate > MIN_BITRATE && self.bandwidth(udp) > max_bandwidth {
                self.bitrate -= 1_000;
            }
        }

        self.bitrate = self.bitrate.max(MIN_BITRATE);

        (self.bitrate, self.frames_per_packet) != old
    }
}

/// Decision of the periodic link-quality check, fed by the counters both
/// sides report in their Ping messages.
///
/// Returns `Some(false)` to fall back to TCP, `Some(true)` to return to
/// UDP, `None` to stay put. After 20 s of connection, a zero good-packet
/// count on either side kills UDP; once both sides have seen more than 3
/// good packets it comes back.
pub fn evaluate_voice_link(
    udp_enabled: bool,
    connected_for: Duration,
    server_good: u32,
    local_good: u32,
) -> Option<bool> {
    if (server_good == 0 || local_good == 0) && udp_enabled && connected_for > UDP_GRACE {
        Some(false)
    } else if !udp_enabled && server_good > 3 && local_good > 3 {
        Some(true)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_formula() {
        let config = AudioConfig::new(40_000, 2);
        // (20+8+4+1+2+2) * 400 + 40000
        assert_eq!(config.bandwidth(true), 14_800 + 40_000);
        // tunneled voice pays for the TCP wrapping
        assert_eq!(config.bandwidth(false), (37 + 12) * 400 + 40_000);
    }

    /// The adjusted (bitrate, frames) must be the maximum configuration
    /// that satisfies the overhead formula for each cap.
    #[test]
    fn downshift_is_maximal() {
        for max in [32_000u32, 48_000, 64_000, 100_000] {
            let mut config = AudioConfig::new(40_000, 2);
            config.apply_max_bandwidth(max, true);

            assert!(
                config.bandwidth(true) <= max || config.bitrate == 8_000,
                "cap {} violated: {:?}",
                max,
                config
            );

            // one more kilobit would break the cap (unless untouched)
            if config.bitrate < 40_000 {
                let mut bigger = config;
                bigger.bitrate += 1_000;
                assert!(bigger.bandwidth(true) > max, "cap {} not maximal", max);
            }
        }
    }

    #[test]
    fn downshift_expected_values() {
        let cases = [
            (32_000u32, (24_000u32, 4usize)),
            (48_000, (40_000, 4)),
            (64_000, (40_000, 2)),
            (100_000, (40_000, 2)),
        ];

        for (max, (bitrate, frames)) in cases {
            let mut config = AudioConfig::new(40_000, 2);
            config.apply_max_bandwidth(max, true);
            assert_eq!(
                (config.bitrate, config.frames_per_packet),
                (bitrate, frames),
                "cap {}",
                max
            );
        }
    }

    #[test]
    fn bitrate_floor() {
        let mut config = AudioConfig::new(40_000, 2);
        config.apply_max_bandwidth(1_000, true);
        assert_eq!(config.bitrate, 8_000);
        assert_eq!(config.frames_per_packet, 4);
    }

    #[test]
    fn repeated_cap_is_ignored() {
        let mut config = AudioConfig::new(40_000, 2);
        assert!(config.apply_max_bandwidth(32_000, true));
        assert!(!config.apply_max_bandwidth(32_000, true));
    }

    #[test]
    fn link_fallback_transitions() {
        let young = Duration::from_secs(5);
        let old = Duration::from_secs(25);

        // nothing happens during the grace period
        assert_eq!(evaluate_voice_link(true, young, 0, 0), None);

        // after 25 s with no good packets on the server side: drop to TCP
        assert_eq!(evaluate_voice_link(true, old, 0, 10), Some(false));
        // or on our side
        assert_eq!(evaluate_voice_link(true, old, 10, 0), Some(false));

        // disabled and recovering: back to UDP once both sides exceed 3
        assert_eq!(evaluate_voice_link(false, old, 4, 4), Some(true));
        assert_eq!(evaluate_voice_link(false, old, 4, 2), None);

        // healthy link stays put
        assert_eq!(evaluate_voice_link(true, old, 10, 10), None);
    }
}
