//! A Mumble client for the CELT-era 1.2.x protocol: dual-channel session
//! (TLS control + OCB2-encrypted UDP voice with transparent TCP fallback),
//! server state tracking, queued media playback, and a channel mixer that
//! re-broadcasts every speaker as one whisper stream.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::SinkExt;
use log::{info, warn};
use sysinfo::SystemExt;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::udp::UdpFramed;

pub mod bandwidth;
pub mod codec;
mod connect;
pub mod control;
pub mod crypt;
pub mod event;
pub mod msgs;
pub mod server_state;
mod tasks;
pub mod varint;
pub mod voice;

pub use connect::ConnectError;
pub use event::Event;
pub use server_state::{Channel, ServerState, User};
pub use tasks::playback::{InputSource, PlaybackInput};

use bandwidth::AudioConfig;
use codec::{CodecNegotiation, CodecRegistry};
use control::{ControlCodec, ControlPacket};
use tasks::playback::PlaybackShared;
use tasks::{Command, Engine, PingTracker};
use voice::VoiceCodec;

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version we announce: 1.2.4 packed as major.minor.patch.
pub const PROTOCOL_VERSION: u32 = 0x0001_0204;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Renders a packed protocol version as `MAJOR.MINOR.PATCH`.
pub fn version_string(v: u32) -> String {
    format!("{}.{}.{}", (v >> 16) & 0xFFFF, (v >> 8) & 0xFF, v & 0xFF)
}

#[derive(Debug, Clone)]
pub struct MumbleConfig {
    pub username: String,
    pub password: String,
    /// Initial audio bitrate in bits per second; lowered automatically
    /// when the server announces a ceiling.
    pub bitrate: u32,
    /// Frames bundled into one voice packet.
    pub frames_per_packet: usize,
    /// Default volume for playback and mixer streams.
    pub volume: f32,
}

impl MumbleConfig {
    pub fn new(username: impl Into<String>) -> Self {
        MumbleConfig {
            username: username.into(),
            password: String::new(),
            bitrate: 40_000,
            frames_per_packet: 2,
            volume: 0.10,
        }
    }
}

/// Handle to a running session. Cheap to clone; all methods enqueue work
/// for the engine task, which is the only task touching the sockets.
#[derive(Clone)]
pub struct MumbleClient {
    tx: mpsc::UnboundedSender<Command>,
    state: Arc<ServerState>,
    events: broadcast::Sender<Event>,
    playback: Arc<PlaybackShared>,
    session: Arc<AtomicU32>,
}

impl MumbleClient {
    /// Connects and authenticates, spawns the engine task and returns the
    /// client handle together with the engine's join handle. The join
    /// handle resolves to the restart verdict once the session ends.
    pub async fn connect(
        host: &str,
        port: u16,
        certfile: Option<impl AsRef<Path>>,
        config: MumbleConfig,
        registry: Arc<CodecRegistry>,
    ) -> Result<(MumbleClient, JoinHandle<bool>), ConnectError> {
        info!("connecting to {}, port {}", host, port);

        if let Some(certfile) = &certfile {
            info!("using certificate '{}'", certfile.as_ref().display());
        }

        let stream = timeout(
            CONNECT_TIMEOUT,
            connect::connect(host, port, certfile.as_ref().map(|p| p.as_ref())),
        )
        .await
        .map_err(|_| ConnectError::Timeout)??;

        let peer = stream.get_ref().0.peer_addr()?;
        let mut tcp = Framed::new(stream, ControlCodec::new());

        // the protocol requires Version first, then Authenticate with our
        // supported bitstream versions
        tcp.send(version_packet().into()).await?;

        info!("authenticating as {}...", config.username);
        let auth = msgs::Authenticate {
            username: Some(config.username.clone()),
            password: Some(config.password.clone()),
            celt_versions: registry.versions(),
            ..Default::default()
        };
        tcp.send(auth.into()).await?;

        let udp = open_voice_socket(peer).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(ServerState::new());
        let session = Arc::new(AtomicU32::new(0));
        let audio = Arc::new(Mutex::new(AudioConfig::new(
            config.bitrate,
            config.frames_per_packet,
        )));
        let negotiation = Arc::new(Mutex::new(CodecNegotiation::default()));
        let playback = Arc::new(PlaybackShared::new(config.volume));

        let playback_worker = tokio::spawn(tasks::playback::run(
            playback.clone(),
            tx.clone(),
            audio.clone(),
            negotiation.clone(),
            registry.clone(),
            events.clone(),
        ));

        let engine = Engine {
            rx,
            tx: tx.clone(),
            tcp,
            udp,
            peer,
            udp_enabled: false,
            session: session.clone(),
            state: state.clone(),
            events: events.clone(),
            audio,
            negotiation,
            registry,
            playback: playback.clone(),
            playback_worker,
            default_volume: config.volume,
            epoch: Instant::now(),
            tcp_ping: PingTracker::default(),
            udp_ping: PingTracker::default(),
            mixer: None,
            restart: true,
        };

        let handle = tokio::spawn(engine.run());

        let client = MumbleClient {
            tx,
            state,
            events,
            playback,
            session,
        };

        Ok((client, handle))
    }

    /// Our session id, once the server has synchronized us.
    pub fn session(&self) -> Option<u32> {
        match self.session.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Asks the engine to end the session. `connect`'s join handle
    /// resolves once teardown is complete.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    fn send(&self, packet: ControlPacket) {
        let _ = self.tx.send(Command::Send(packet));
    }

    pub fn send_text_to_user(&self, session: u32, text: impl Into<String>) {
        self.send(
            msgs::TextMessage {
                session: vec![session],
                message: Some(text.into()),
                ..Default::default()
            }
            .into(),
        );
    }

    pub fn send_text_to_channel(&self, channel_id: u32, text: impl Into<String>) {
        self.send(
            msgs::TextMessage {
                channel_id: vec![channel_id],
                message: Some(text.into()),
                ..Default::default()
            }
            .into(),
        );
    }

    pub fn request_user_stats(&self, session: u32) {
        self.send(
            msgs::UserStats {
                session: Some(session),
                ..Default::default()
            }
            .into(),
        );
    }

    /// Moves our own user into a channel.
    pub fn join_channel(&self, channel_id: u32) {
        let session = match self.session() {
            Some(session) => session,
            None => return,
        };
        self.send(
            msgs::UserState {
                session: Some(session),
                channel_id: Some(channel_id),
                ..Default::default()
            }
            .into(),
        );
    }

    pub fn create_channel(
        &self,
        parent: u32,
        name: impl Into<String>,
        description: impl Into<String>,
        temporary: bool,
    ) {
        self.send(
            msgs::ChannelState {
                parent: Some(parent),
                name: Some(name.into()),
                description: Some(description.into()),
                temporary: Some(temporary),
                ..Default::default()
            }
            .into(),
        );
    }

    pub fn remove_channel(&self, channel_id: u32) {
        self.send(
            msgs::ChannelRemove {
                channel_id: Some(channel_id),
            }
            .into(),
        );
    }

    /// Queues a media file for playback. `window` selects a [from, to]
    /// range in seconds; `volume` overrides the sticky playback volume.
    pub fn play_file(
        &self,
        path: impl Into<PathBuf>,
        window: Option<(f32, f32)>,
        volume: Option<f32>,
        origin: Option<String>,
    ) {
        self.playback.enqueue(
            PlaybackInput {
                source: InputSource::File(path.into()),
                window,
                origin,
            },
            volume,
        );
    }

    /// Queues an in-memory media buffer for playback.
    pub fn play_buffer(
        &self,
        name: impl Into<String>,
        data: Vec<u8>,
        window: Option<(f32, f32)>,
        volume: Option<f32>,
        origin: Option<String>,
    ) {
        self.playback.enqueue(
            PlaybackInput {
                source: InputSource::Buffer {
                    name: name.into(),
                    data,
                },
                window,
                origin,
            },
            volume,
        );
    }

    /// Skips the currently playing input.
    pub fn stop_playback(&self) {
        self.playback.stop();
    }

    /// Drops all queued inputs and skips the current one.
    pub fn clear_playback(&self) {
        self.playback.clear();
    }

    pub fn playback_volume_up(&self) {
        self.playback.volume_up();
    }

    pub fn playback_volume_down(&self) {
        self.playback.volume_down();
    }

    /// Starts mixing received voice into a whisper stream towards
    /// `channel_id`, delayed by `delay` seconds.
    pub fn create_stream(&self, channel_id: u32, delay: u32) {
        let _ = self.tx.send(Command::CreateStream { channel_id, delay });
    }

    pub fn destroy_stream(&self) {
        let _ = self.tx.send(Command::DestroyStream);
    }

    pub fn stream_volume_up(&self) {
        let _ = self.tx.send(Command::StreamVolumeUp);
    }

    pub fn stream_volume_down(&self) {
        let _ = self.tx.send(Command::StreamVolumeDown);
    }
}

/// Binds the voice socket. Failure is not fatal: the session continues
/// with voice tunneled over TCP.
async fn open_voice_socket(peer: SocketAddr) -> Option<UdpFramed<VoiceCodec>> {
    let bind_addr: SocketAddr = if peer.is_ipv6() {
        "[::]:0".parse().expect("literal address")
    } else {
        "0.0.0.0:0".parse().expect("literal address")
    };

    match UdpSocket::bind(bind_addr).await {
        Ok(socket) => Some(UdpFramed::new(socket, VoiceCodec::new())),
        Err(e) => {
            warn!("failed to open voice socket: {}", e);
            warn!("UDP mode disabled");
            None
        }
    }
}

fn version_packet() -> msgs::Version {
    let system = sysinfo::System::new();

    msgs::Version {
        version: Some(PROTOCOL_VERSION),
        release: Some(format!("brumble {}", CRATE_VERSION)),
        os: system.name(),
        os_version: system.os_version(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_unpacks_fields() {
        assert_eq!(version_string(0x0001_0204), "1.2.4");
        assert_eq!(version_string(0x0002_0000), "2.0.0");
        assert_eq!(version_string((3 << 16) | (1 << 8) | 7), "3.1.7");
    }
}
