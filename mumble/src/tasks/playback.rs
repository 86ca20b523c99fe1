//! Queued playback: decode a media input to PCM, cut it into 10 ms frames,
//! CELT-encode and hand packets to the engine at real-time pace.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{sleep_until, Instant as TokioInstant};

use crate::bandwidth::AudioConfig;
use crate::codec::{CeltEncoder, CodecNegotiation, CodecRegistry};
use crate::event::Event;
use crate::tasks::Command;
use crate::voice::{
    target, AudioPacket, AudioPayload, PacketType, FRAMES_PER_SECOND, FRAME_SIZE,
    MAX_SUBFRAME_LEN, SAMPLE_RATE,
};

pub type Frame = [i16; FRAME_SIZE];

/// One queued playback request.
pub struct PlaybackInput {
    pub source: InputSource,
    /// Optional [from, to] slice of the decoded audio, in seconds.
    pub window: Option<(f32, f32)>,
    /// Plugin that queued this input; it gets the Playback event.
    pub origin: Option<String>,
}

pub enum InputSource {
    File(PathBuf),
    Buffer { name: String, data: Vec<u8> },
}

impl PlaybackInput {
    fn name(&self) -> &str {
        match &self.source {
            InputSource::File(path) => path.to_str().unwrap_or("<file>"),
            InputSource::Buffer { name, .. } => name,
        }
    }
}

struct QueueState {
    queue: VecDeque<PlaybackInput>,
    enabled: bool,
    /// Truncates the current input at the next frame boundary.
    next: bool,
    volume: f32,
}

/// Playback queue shared between the client handle (producers) and the
/// worker (consumer).
pub struct PlaybackShared {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PlaybackShared {
    pub fn new(volume: f32) -> Self {
        PlaybackShared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                enabled: true,
                next: false,
                volume,
            }),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, input: PlaybackInput, volume: Option<f32>) {
        let mut state = self.state.lock().unwrap();
        if let Some(volume) = volume {
            state.volume = volume;
        }
        state.queue.push_back(input);
        drop(state);

        self.notify.notify_one();
    }

    /// Skips the rest of the current input.
    pub fn stop(&self) {
        self.state.lock().unwrap().next = true;
    }

    /// Drops everything still queued, then skips the current input. (The
    /// playing input is not in the queue any more, so it survives until
    /// the `next` flag catches it.)
    pub fn clear(&self) {
        self.state.lock().unwrap().queue.clear();
        self.stop();
    }

    pub fn volume_up(&self) {
        self.state.lock().unwrap().volume *= 2.0;
    }

    pub fn volume_down(&self) {
        self.state.lock().unwrap().volume *= 0.5;
    }

    /// Ends the worker; called once on teardown.
    pub fn shutdown(&self) {
        self.state.lock().unwrap().enabled = false;
        self.notify.notify_one();
    }

    fn flags(&self) -> (bool, bool, f32) {
        let state = self.state.lock().unwrap();
        (state.enabled, state.next, state.volume)
    }

    /// Blocks until an input is available. Returns `None` on shutdown.
    async fn next_input(&self) -> Option<PlaybackInput> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.enabled {
                    return None;
                }
                if let Some(input) = state.queue.pop_front() {
                    state.next = false;
                    return Some(input);
                }
            }

            self.notify.notified().await;
        }
    }
}

/// Worker-local encoder, recreated whenever codec negotiation moves to a
/// different bitstream.
#[derive(Default)]
pub struct EncoderState {
    current: Option<(i32, Box<dyn CeltEncoder>)>,
}

impl EncoderState {
    /// Resolves the active codec and makes sure the encoder matches it.
    /// Returns the packet type to mark outgoing audio with.
    pub fn update(
        &mut self,
        registry: &CodecRegistry,
        negotiation: &Mutex<CodecNegotiation>,
    ) -> Option<PacketType> {
        let (slot, version) = negotiation.lock().unwrap().current();

        let wanted = if version == -1 { None } else { Some(version) };
        let codec = registry.select(wanted)?;
        let resolved = codec.bitstream_version();

        let stale = match &self.current {
            Some((v, _)) => *v != resolved,
            None => true,
        };
        if stale {
            self.current = Some((resolved, codec.new_encoder()));
        }

        Some(slot.packet_type())
    }

    pub(crate) fn encoder(&mut self) -> &mut Box<dyn CeltEncoder> {
        &mut self
            .current
            .as_mut()
            .expect("update() succeeded before use")
            .1
    }
}

pub fn scale_frame(frame: &mut [i16], volume: f32) {
    if volume == 1.0 {
        return;
    }
    for sample in frame {
        *sample = (*sample as f32 * volume) as i16;
    }
}

/// Splits a sample buffer into 10 ms frames, zero-padding the tail.
pub fn to_frames(samples: &[i16]) -> Vec<Frame> {
    let mut frames = Vec::with_capacity((samples.len() + FRAME_SIZE - 1) / FRAME_SIZE);

    for chunk in samples.chunks(FRAME_SIZE) {
        let mut frame = [0; FRAME_SIZE];
        frame[..chunk.len()].copy_from_slice(chunk);
        frames.push(frame);
    }

    frames
}

/// Cuts `frames` down to the [from, to] second window, or rejects windows
/// that fall outside the input.
pub fn slice_window(frames: Vec<Frame>, from: f32, to: f32) -> Option<Vec<Frame>> {
    let n = frames.len();
    let start = (from * FRAMES_PER_SECOND as f32) as isize;
    let end = (to * FRAMES_PER_SECOND as f32) as isize;
    let len = ((to - from) * FRAMES_PER_SECOND as f32) as isize;

    if len <= 0 || start < 0 || start as usize > n || end as usize > n {
        return None;
    }

    let start = start as usize;
    let len = len as usize;
    Some(frames[start..start + len].to_vec())
}

/// The playback worker. Lives for the whole session; one input at a time.
pub async fn run(
    shared: Arc<PlaybackShared>,
    tx: mpsc::UnboundedSender<Command>,
    audio: Arc<Mutex<AudioConfig>>,
    negotiation: Arc<Mutex<CodecNegotiation>>,
    registry: Arc<CodecRegistry>,
    events: broadcast::Sender<Event>,
) {
    let mut encoder = EncoderState::default();

    while let Some(input) = shared.next_input().await {
        let name = input.name().to_string();

        if input.origin.is_some() {
            let _ = events.send(Event::Playback {
                name: name.clone(),
                origin: input.origin.clone(),
            });
        }

        let samples = match &input.source {
            InputSource::File(path) => player::read_file(path, SAMPLE_RATE).await,
            InputSource::Buffer { name, data } => {
                player::read_buffer(name, data, SAMPLE_RATE).await
            }
        };

        let samples = match samples {
            Ok(samples) => samples,
            Err(e) => {
                error!("failed to decode {}: {}", name, e);
                continue;
            }
        };

        let mut frames = to_frames(&samples);

        if let Some((from, to)) = input.window {
            frames = match slice_window(frames, from, to) {
                Some(frames) => frames,
                None => {
                    warn!("window [{}, {}] outside of input {}", from, to, name);
                    continue;
                }
            };
        }

        debug!("playing {} ({} frames)", name, frames.len());
        stream_frames(&shared, &tx, &audio, &negotiation, &registry, &mut encoder, &frames).await;
    }

    debug!("playback worker exit");
}

/// Encodes and sends `frames` as normal-target voice packets, paced at
/// 10 ms per frame against an absolute deadline so encoding time does not
/// accumulate as drift.
pub async fn stream_frames(
    shared: &PlaybackShared,
    tx: &mpsc::UnboundedSender<Command>,
    audio: &Mutex<AudioConfig>,
    negotiation: &Mutex<CodecNegotiation>,
    registry: &CodecRegistry,
    encoder: &mut EncoderState,
    frames: &[Frame],
) -> usize {
    let start = TokioInstant::now();
    let mut packets = 0;
    let mut sent = 0u64;
    let mut seq = 0u64;
    let mut idx = 0;

    while idx < frames.len() {
        let (enabled, next, volume) = shared.flags();
        if !enabled || next {
            break;
        }

        let (bitrate, per_packet) = {
            let audio = audio.lock().unwrap();
            (audio.bitrate, audio.frames_per_packet)
        };
        let count = per_packet.min(frames.len() - idx);

        let typ = match encoder.update(registry, negotiation) {
            Some(typ) => typ,
            None => {
                error!("no CELT codec available, aborting playback");
                break;
            }
        };

        let max_len = ((bitrate / 800) as usize).min(MAX_SUBFRAME_LEN);
        let enc = encoder.encoder();
        enc.set_prediction(false);
        enc.set_bitrate(bitrate);

        let mut subframes = Vec::with_capacity(count + 1);
        for frame in &frames[idx..idx + count] {
            let mut pcm = *frame;
            scale_frame(&mut pcm, volume);

            match enc.encode(&pcm, max_len) {
                Ok(data) => subframes.push(data),
                Err(e) => error!("failed to encode frame: {}", e),
            }
        }

        let last = idx + count == frames.len();
        if last {
            // zero-length terminator tells receivers the stream ended
            subframes.push(Vec::new());
        }

        if !subframes.is_empty() {
            let packet = AudioPacket {
                typ,
                target: target::NORMAL,
                payload: AudioPayload::Voice {
                    session: None,
                    sequence: seq,
                    frames: subframes,
                    position: None,
                },
            };
            let _ = tx.send(Command::SendAudio(packet));
            packets += 1;
        }

        seq += count as u64;
        sent += count as u64;
        idx += count;

        sleep_until(start + Duration::from_millis(10 * sent)).await;
    }

    packets
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::codec::testing::registry_with;

    #[test]
    fn frames_are_zero_padded() {
        let samples = vec![5i16; FRAME_SIZE + 10];
        let frames = to_frames(&samples);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1][9], 5);
        assert_eq!(frames[1][10], 0);
    }

    #[test]
    fn window_slicing() {
        let frames = vec![[0i16; FRAME_SIZE]; 300]; // three seconds

        assert_eq!(slice_window(frames.clone(), 1.0, 2.0).unwrap().len(), 100);
        assert_eq!(slice_window(frames.clone(), 0.0, 3.0).unwrap().len(), 300);

        // degenerate or out-of-range windows
        assert!(slice_window(frames.clone(), 2.0, 1.0).is_none());
        assert!(slice_window(frames.clone(), 1.0, 4.0).is_none());
        assert!(slice_window(frames, 3.5, 4.0).is_none());
    }

    #[test]
    fn volume_scaling_saturates() {
        let mut frame = [16_000i16, -16_000, 100];
        scale_frame(&mut frame, 4.0);
        assert_eq!(frame, [i16::MAX, i16::MIN, 400]);
    }

    #[test]
    fn clear_keeps_nothing_queued() {
        let shared = PlaybackShared::new(1.0);
        for i in 0..3 {
            shared.enqueue(
                PlaybackInput {
                    source: InputSource::Buffer {
                        name: format!("buf{}", i),
                        data: Vec::new(),
                    },
                    window: None,
                    origin: None,
                },
                None,
            );
        }

        shared.clear();

        let state = shared.state.lock().unwrap();
        assert!(state.queue.is_empty());
        assert!(state.next);
    }

    /// One second of audio leaves at real-time pace: 100 packets with one
    /// frame each, roughly a second of wall clock.
    #[tokio::test]
    async fn pacing_one_second_of_silence() {
        let shared = PlaybackShared::new(1.0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let audio = Mutex::new(AudioConfig::new(40_000, 1));
        let negotiation = Mutex::new(CodecNegotiation::default());
        let registry = registry_with(&[-2147483637]);
        let mut encoder = EncoderState::default();

        let frames = vec![[0i16; FRAME_SIZE]; 100];

        let begin = Instant::now();
        let packets = stream_frames(
            &shared,
            &tx,
            &audio,
            &negotiation,
            &registry,
            &mut encoder,
            &frames,
        )
        .await;
        let took = begin.elapsed();

        assert_eq!(packets, 100);
        assert!(
            took >= Duration::from_millis(950) && took <= Duration::from_millis(1100),
            "pacing off: {:?}",
            took
        );

        // every packet arrived, the last one carries the terminator
        let mut received = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::SendAudio(pkt) => received.push(pkt),
                _ => panic!("unexpected command"),
            }
        }
        assert_eq!(received.len(), 100);

        match &received[99].payload {
            AudioPayload::Voice {
                sequence, frames, ..
            } => {
                assert_eq!(*sequence, 99);
                assert!(frames.last().unwrap().is_empty());
            }
            _ => panic!("not a voice packet"),
        }

        match &received[0].payload {
            AudioPayload::Voice { frames, .. } => {
                assert_eq!(frames.len(), 1);
            }
            _ => panic!("not a voice packet"),
        }
    }

    #[tokio::test]
    async fn stop_flag_interrupts_stream() {
        let shared = PlaybackShared::new(1.0);
        let (tx, _rx) = mpsc::unbounded_channel();
        let audio = Mutex::new(AudioConfig::new(40_000, 2));
        let negotiation = Mutex::new(CodecNegotiation::default());
        let registry = registry_with(&[-2147483637]);
        let mut encoder = EncoderState::default();

        shared.stop();

        let frames = vec![[0i16; FRAME_SIZE]; 100];
        let packets = stream_frames(
            &shared,
            &tx,
            &audio,
            &negotiation,
            &registry,
            &mut encoder,
            &frames,
        )
        .await;

        assert_eq!(packets, 0);
    }
}
