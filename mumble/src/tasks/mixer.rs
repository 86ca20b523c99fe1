//! The mixing stream: decodes every remote speaker into a shared,
//! time-indexed ring of 10 ms frames and plays the mix back out as a
//! whisper-channel transmission.
//!
//! Each speaker owns a private decoder. CELT decoders carry prediction
//! state, so routing two speakers through one decoder would corrupt both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::bandwidth::AudioConfig;
use crate::codec::{CeltDecoder, CodecNegotiation, CodecRegistry};
use crate::tasks::playback::{scale_frame, EncoderState, Frame};
use crate::tasks::Command;
use crate::voice::{target, AudioPacket, AudioPayload, PacketType, FRAMES_PER_SECOND, FRAME_SIZE};

const ZERO_FRAME: Frame = [0; FRAME_SIZE];

const FRAME_MILLIS: u64 = 1000 / FRAMES_PER_SECOND as u64;

/// The delay-line ring. `timestamp` is when the frame at `index` is due to
/// play, in milliseconds on the mixer's clock.
struct Ring {
    frames: Vec<Frame>,
    index: usize,
    timestamp: u64,
}

struct Track {
    decoder: Box<dyn CeltDecoder>,
    version: i32,
    /// Sequence number the track was (re)based at.
    sequence: u64,
    /// Ring slot that sequence maps to.
    index: usize,
}

pub struct MixerInner {
    enabled: AtomicBool,
    /// Mixing delay in seconds; also the initial ring length.
    delay: u64,
    epoch: Instant,
    buffer: Mutex<Ring>,
    tracks: Mutex<HashMap<u64, Track>>,
    volume: Mutex<f32>,
    negotiation: Arc<Mutex<CodecNegotiation>>,
    registry: Arc<CodecRegistry>,
}

pub struct Mixer {
    inner: Arc<MixerInner>,
    writer: JoinHandle<()>,
}

impl Mixer {
    pub fn create(
        delay: u32,
        volume: f32,
        tx: mpsc::UnboundedSender<Command>,
        audio: Arc<Mutex<AudioConfig>>,
        negotiation: Arc<Mutex<CodecNegotiation>>,
        registry: Arc<CodecRegistry>,
    ) -> Mixer {
        let size = (delay as usize).max(1) * FRAMES_PER_SECOND;

        let inner = Arc::new(MixerInner {
            enabled: AtomicBool::new(true),
            delay: delay as u64,
            epoch: Instant::now(),
            buffer: Mutex::new(Ring {
                frames: vec![ZERO_FRAME; size],
                index: 0,
                timestamp: 0,
            }),
            tracks: Mutex::new(HashMap::new()),
            volume: Mutex::new(volume),
            negotiation,
            registry,
        });

        let writer = tokio::spawn(writer(inner.clone(), tx, audio));

        Mixer { inner, writer }
    }

    pub fn feed(&self, typ: PacketType, session: u64, sequence: u64, frames: &[Vec<u8>]) {
        self.inner.feed(typ, session, sequence, frames);
    }

    pub fn scale_volume(&self, factor: f32) {
        let mut volume = self.inner.volume.lock().unwrap();
        *volume *= factor;
    }

    pub async fn destroy(self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        if let Err(e) = self.writer.await {
            error!("mixer writer failed: {}", e);
        }
    }
}

impl MixerInner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Ring slot that plays at time `t` (ms).
    fn slot_at(ring: &Ring, t: u64) -> usize {
        let ahead = (t.saturating_sub(ring.timestamp) / FRAME_MILLIS) as usize;
        (ahead + ring.index) % ring.frames.len()
    }

    fn feed(&self, typ: PacketType, session: u64, sequence: u64, frames: &[Vec<u8>]) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let decoded = {
            let mut tracks = self.tracks.lock().unwrap();

            let track = match tracks.entry(session) {
                std::collections::hash_map::Entry::Occupied(e) => {
                    let track = e.into_mut();
                    if sequence == 0 {
                        // transmission restart, rebase onto "now + delay"
                        track.sequence = 0;
                        track.index = {
                            let ring = self.buffer.lock().unwrap();
                            Self::slot_at(&ring, self.now_ms() + self.delay * 1000)
                        };
                    }
                    track
                }
                std::collections::hash_map::Entry::Vacant(e) => {
                    let index = {
                        let ring = self.buffer.lock().unwrap();
                        Self::slot_at(&ring, self.now_ms() + self.delay * 1000)
                    };
                    e.insert(Track {
                        decoder: Box::new(NullDecoder),
                        version: i32::MIN,
                        sequence,
                        index,
                    })
                }
            };

            if !self.update_decoder(typ, track) {
                return;
            }

            let mut decoded = Vec::new();
            for data in frames {
                if data.is_empty() {
                    // terminator
                    break;
                }
                match track.decoder.decode(data) {
                    Ok(pcm) => {
                        let mut frame = ZERO_FRAME;
                        let n = pcm.len().min(FRAME_SIZE);
                        frame[..n].copy_from_slice(&pcm[..n]);
                        decoded.push(frame);
                    }
                    Err(e) => {
                        error!("failed to decode frame from {}: {}", session, e);
                        return;
                    }
                }
            }

            (track.index, track.sequence, decoded)
        };

        let (track_index, track_sequence, frames) = decoded;
        if frames.is_empty() {
            return;
        }

        self.add_frames(track_index, track_sequence, sequence, &frames);
    }

    /// Swaps in a decoder for the bitstream the packet was encoded with
    /// whenever it differs from the track's current one.
    fn update_decoder(&self, typ: PacketType, track: &mut Track) -> bool {
        let version = self.negotiation.lock().unwrap().version_for(typ);
        let wanted = if version == -1 { None } else { Some(version) };

        let codec = match self.registry.select(wanted) {
            Some(codec) => codec,
            None => {
                warn!("no CELT codec for incoming bitstream {}", version);
                return false;
            }
        };

        let resolved = codec.bitstream_version();
        if track.version != resolved {
            track.decoder = codec.new_decoder();
            track.version = resolved;
        }

        true
    }

    /// Mixes decoded frames into the ring at the position the packet's
    /// sequence number maps to. Grows the ring when a write would land
    /// beyond its end.
    fn add_frames(&self, track_index: usize, track_sequence: u64, sequence: u64, frames: &[Frame]) {
        let mut ring = self.buffer.lock().unwrap();

        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let t = self.now_ms() + self.delay * 1000;
        while t + frames.len() as u64 * FRAME_MILLIS
            >= ring.timestamp + (ring.frames.len() as u64) * FRAME_MILLIS
        {
            grow(&mut ring);
        }

        let size = ring.frames.len() as i128;
        for (i, frame) in frames.iter().enumerate() {
            let offset = track_index as i128
                + i as i128
                + (sequence as i128 - track_sequence as i128);
            let index = offset.rem_euclid(size) as usize;
            mix_frame(&mut ring.frames[index], frame);
        }
    }

    /// Pops `count` frames from the play position once it is due, zeroing
    /// the slots behind it. Returns `None` when the mixer is shutting down.
    async fn pull_frames(&self, count: usize) -> Option<Vec<Frame>> {
        loop {
            {
                let mut ring = self.buffer.lock().unwrap();
                if !self.enabled.load(Ordering::SeqCst) {
                    return None;
                }

                if self.now_ms() >= ring.timestamp {
                    let mut out = Vec::with_capacity(count);
                    for _ in 0..count {
                        let index = ring.index;
                        out.push(ring.frames[index]);
                        ring.frames[index] = ZERO_FRAME;
                        ring.index = (ring.index + 1) % ring.frames.len();
                        ring.timestamp += FRAME_MILLIS;
                    }
                    return Some(out);
                }
            }

            sleep(Duration::from_millis(1)).await;
        }
    }
}

/// A placeholder decoder for freshly created tracks; replaced before the
/// first decode by `update_decoder`.
struct NullDecoder;

impl CeltDecoder for NullDecoder {
    fn decode(&mut self, _data: &[u8]) -> Result<Vec<i16>, crate::codec::CodecError> {
        Ok(vec![0; FRAME_SIZE])
    }
}

/// Averages the new frame into the ring slot. Slots still holding silence
/// take the new samples as-is.
fn mix_frame(slot: &mut Frame, new: &Frame) {
    for i in 0..FRAME_SIZE {
        let divisor = if slot[i] != 0 { 2 } else { 1 };
        let mixed = (slot[i] as i32 + new[i] as i32) / divisor;
        slot[i] = mixed.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

/// Extends the ring by one second of silence, keeping `index` pointing at
/// the live play head. The wrapped-around head (slots before `index`) is
/// the most distant future; it moves into the new space and the slots it
/// vacates are zeroed so stale frames are never replayed.
fn grow(ring: &mut Ring) {
    let old_size = ring.frames.len();
    let index = ring.index;

    ring.frames.extend([ZERO_FRAME; FRAMES_PER_SECOND]);

    if index == 0 {
        return;
    }

    let moved = index.min(FRAMES_PER_SECOND);
    for i in 0..moved {
        ring.frames[old_size + i] = ring.frames[i];
        ring.frames[i] = ZERO_FRAME;
    }

    if index > FRAMES_PER_SECOND {
        ring.frames
            .copy_within(FRAMES_PER_SECOND..index, 0);
        for frame in &mut ring.frames[index - FRAMES_PER_SECOND..index] {
            *frame = ZERO_FRAME;
        }
    }
}

/// The writer task: pulls due frames, encodes them as whisper-target
/// packets and hands them to the engine.
async fn writer(
    inner: Arc<MixerInner>,
    tx: mpsc::UnboundedSender<Command>,
    audio: Arc<Mutex<AudioConfig>>,
) {
    let mut encoder = EncoderState::default();
    let mut seq = 0u64;

    while inner.enabled.load(Ordering::SeqCst) {
        let (bitrate, count) = {
            let audio = audio.lock().unwrap();
            (audio.bitrate, audio.frames_per_packet)
        };

        let mut frames = match inner.pull_frames(count).await {
            Some(frames) => frames,
            None => break,
        };

        let typ = match encoder.update(&inner.registry, &inner.negotiation) {
            Some(typ) => typ,
            None => {
                error!("no CELT codec available, stopping mixer stream");
                break;
            }
        };

        let volume = *inner.volume.lock().unwrap();
        let max_len = ((bitrate / 800) as usize).min(crate::voice::MAX_SUBFRAME_LEN);

        let enc = encoder.encoder();
        enc.set_prediction(false);
        enc.set_bitrate(bitrate);

        let mut subframes = Vec::with_capacity(count + 1);
        for frame in &mut frames {
            scale_frame(frame, volume);
            match enc.encode(frame, max_len) {
                Ok(data) => subframes.push(data),
                Err(e) => error!("failed to encode mixed frame: {}", e),
            }
        }

        if !inner.enabled.load(Ordering::SeqCst) {
            subframes.push(Vec::new());
        }

        if !subframes.is_empty() {
            let packet = AudioPacket {
                typ,
                target: target::WHISPER_CHANNEL,
                payload: AudioPayload::Voice {
                    session: None,
                    sequence: seq,
                    frames: subframes,
                    position: None,
                },
            };
            let _ = tx.send(Command::SendAudio(packet));
        }

        seq += count as u64;
    }

    debug!("mixer writer exit");
}
