//! The engine task: owner of both sockets.
//!
//! Exactly one task performs TLS and UDP I/O. Every other part of the
//! client (the playback worker, the mixer writer, the public handle) talks
//! to it through the command channel, which both serializes control-frame
//! writes and keeps them in FIFO order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant as TokioInstant};
use tokio_rustls::client::TlsStream;
use tokio_util::codec::Framed;
use tokio_util::udp::UdpFramed;

use crate::bandwidth::{evaluate_voice_link, AudioConfig};
use crate::codec::{CodecNegotiation, CodecRegistry};
use crate::control::{ControlCodec, ControlPacket};
use crate::crypt::{CryptState, BLOCK_SIZE};
use crate::event::Event;
use crate::msgs;
use crate::server_state::ServerState;
use crate::version_string;
use crate::voice::{AudioPacket, AudioPayload, PacketType};

pub mod mixer;
pub mod playback;

use mixer::Mixer;
use playback::PlaybackShared;

const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Whisper voice-target slot we claim for mixer streams.
const WHISPER_TARGET_ID: u32 = 1;

/// Work for the engine task.
pub enum Command {
    /// Send a control message, in enqueue order.
    Send(ControlPacket),
    /// Transmit an audio packet over UDP, or tunneled when UDP is off.
    SendAudio(AudioPacket),
    CreateStream { channel_id: u32, delay: u32 },
    DestroyStream,
    StreamVolumeUp,
    StreamVolumeDown,
    Close,
}

/// Running mean/deviation of round-trip times, fed from pong timestamps.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingTracker {
    pub n: u32,
    pub avg: f32,
    s: f32,
    pub var: f32,
}

impl PingTracker {
    pub fn update(&mut self, elapsed_us: u64, sent_ts: u64) {
        let ping = elapsed_us.saturating_sub(sent_ts) as f32 / 1000.0;
        let prev_avg = self.avg;

        self.n = self.n.wrapping_add(1);
        if self.n == 0 {
            // counter wrapped, start a fresh window
            self.n = 1;
            self.avg = 0.0;
            self.s = 0.0;
            self.var = 0.0;
        }

        self.avg += (ping - prev_avg) / self.n as f32;
        self.s += (ping - prev_avg) * (ping - self.avg);
        self.var = (self.s / self.n as f32).sqrt();
    }
}

type ControlStream = Framed<TlsStream<TcpStream>, ControlCodec>;
type VoiceStream = UdpFramed<crate::voice::VoiceCodec>;

pub struct Engine {
    pub rx: mpsc::UnboundedReceiver<Command>,
    pub tx: mpsc::UnboundedSender<Command>,
    pub tcp: ControlStream,
    pub udp: Option<VoiceStream>,
    pub peer: SocketAddr,
    /// Voice goes over UDP only while this is set; cleared by the
    /// link-quality policy, set by a complete CryptSetup.
    pub udp_enabled: bool,
    pub session: Arc<AtomicU32>,
    pub state: Arc<ServerState>,
    pub events: broadcast::Sender<Event>,
    pub audio: Arc<Mutex<AudioConfig>>,
    pub negotiation: Arc<Mutex<CodecNegotiation>>,
    pub registry: Arc<CodecRegistry>,
    pub playback: Arc<PlaybackShared>,
    pub playback_worker: JoinHandle<()>,
    pub default_volume: f32,
    pub epoch: Instant,
    pub tcp_ping: PingTracker,
    pub udp_ping: PingTracker,
    pub mixer: Option<Mixer>,
    pub restart: bool,
}

async fn recv_voice(
    udp: &mut Option<VoiceStream>,
) -> Option<std::io::Result<(AudioPacket, SocketAddr)>> {
    match udp {
        Some(udp) => udp.next().await,
        None => std::future::pending().await,
    }
}

impl Engine {
    /// Runs the session to completion. The return value is the restart
    /// verdict: false when the server rejected or banned us.
    pub async fn run(mut self) -> bool {
        let mut ping_timer = interval_at(TokioInstant::now() + PING_INTERVAL, PING_INTERVAL);

        loop {
            select! {
                _ = ping_timer.tick() => {
                    if !self.send_ping().await {
                        break;
                    }
                }
                cmd = self.rx.recv() => {
                    match cmd {
                        None | Some(Command::Close) => break,
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                    }
                }
                msg = self.tcp.next() => {
                    match msg {
                        None => {
                            info!("connection shutdown by peer");
                            break;
                        }
                        Some(Err(e)) => {
                            error!("error on control channel: {}", e);
                            break;
                        }
                        Some(Ok(packet)) => {
                            if !self.handle_control(packet).await {
                                break;
                            }
                        }
                    }
                }
                msg = recv_voice(&mut self.udp) => {
                    match msg {
                        None => {
                            warn!("voice socket closed, UDP mode disabled");
                            self.udp = None;
                            self.udp_enabled = false;
                        }
                        Some(Err(e)) => debug!("error on voice channel: {}", e),
                        Some(Ok((packet, addr))) => self.handle_voice(packet, addr),
                    }
                }
            }

            if !self.flush_crypt_request().await {
                break;
            }
        }

        self.shutdown().await
    }

    async fn shutdown(mut self) -> bool {
        if let Some(mixer) = self.mixer.take() {
            mixer.destroy().await;
        }

        self.playback.shutdown();
        if let Err(e) = self.playback_worker.await {
            error!("playback worker failed: {}", e);
        }

        // voice first, then a clean TLS shutdown
        self.udp = None;
        let _ = self.tcp.close().await;

        info!("session ended (restart: {})", self.restart);
        self.restart
    }

    fn timestamp(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn crypt_mut(&mut self) -> Option<&mut CryptState> {
        self.udp.as_mut().and_then(|u| u.codec_mut().crypt_mut())
    }

    async fn send_ping(&mut self) -> bool {
        let ts = self.timestamp();

        if !self.send_audio(AudioPacket::ping(ts)).await {
            return false;
        }

        let (good, late, lost, resync) = match self.crypt_mut() {
            Some(c) => (c.good, c.late, c.lost, c.resync),
            None => (0, 0, 0, 0),
        };

        let mut msg = msgs::Ping {
            timestamp: Some(ts),
            good: Some(good),
            late: Some(late),
            lost: Some(lost),
            resync: Some(resync),
            udp_packets: Some(self.udp_ping.n),
            tcp_packets: Some(self.tcp_ping.n),
            ..Default::default()
        };

        if self.udp_ping.n > 0 {
            msg.udp_ping_avg = Some(self.udp_ping.avg);
            msg.udp_ping_var = Some(self.udp_ping.var);
        }
        if self.tcp_ping.n > 0 {
            msg.tcp_ping_avg = Some(self.tcp_ping.avg);
            msg.tcp_ping_var = Some(self.tcp_ping.var);
        }

        self.send_control(msg.into()).await
    }

    async fn send_control(&mut self, packet: ControlPacket) -> bool {
        if let Err(e) = self.tcp.send(packet).await {
            error!("failed to send control message: {}", e);
            return false;
        }
        true
    }

    /// Transmits audio the way the reference client does: pings and voice
    /// take UDP whenever it is enabled, voice falls back to the TCP tunnel
    /// otherwise. With no cipher state yet, UDP packets are dropped.
    async fn send_audio(&mut self, packet: AudioPacket) -> bool {
        if packet.is_ping() || self.udp_enabled {
            if let Some(udp) = &mut self.udp {
                if udp.codec().ready() {
                    let peer = self.peer;
                    if let Err(e) = udp.send((packet, peer)).await {
                        warn!("failed to send voice datagram: {}", e);
                    }
                }
            }
            true
        } else {
            self.send_control(ControlPacket::UdpTunnel(packet)).await
        }
    }

    async fn flush_crypt_request(&mut self) -> bool {
        let iv = match self.crypt_mut() {
            Some(crypt) => {
                if crypt.take_resync_request() {
                    *crypt.encrypt_iv()
                } else {
                    return true;
                }
            }
            None => return true,
        };

        debug!("requesting crypt resync");
        let msg = msgs::CryptSetup {
            client_nonce: Some(iv.to_vec()),
            ..Default::default()
        };
        self.send_control(msg.into()).await
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Send(packet) => self.send_control(packet).await,
            Command::SendAudio(packet) => self.send_audio(packet).await,
            Command::CreateStream { channel_id, delay } => {
                self.create_stream(channel_id, delay).await
            }
            Command::DestroyStream => {
                if let Some(mixer) = self.mixer.take() {
                    mixer.destroy().await;
                }
                true
            }
            Command::StreamVolumeUp => {
                if let Some(mixer) = &self.mixer {
                    mixer.scale_volume(2.0);
                }
                true
            }
            Command::StreamVolumeDown => {
                if let Some(mixer) = &self.mixer {
                    mixer.scale_volume(0.5);
                }
                true
            }
            Command::Close => false,
        }
    }

    async fn create_stream(&mut self, channel_id: u32, delay: u32) -> bool {
        if self.mixer.is_some() {
            warn!("mixer stream already active");
            return true;
        }

        // claim the whisper target slot for the destination channel
        let msg = msgs::VoiceTarget {
            id: Some(WHISPER_TARGET_ID),
            targets: vec![msgs::voice_target::Target {
                channel_id: Some(channel_id),
                ..Default::default()
            }],
        };
        if !self.send_control(msg.into()).await {
            return false;
        }

        info!("streaming to channel {} with {} s delay", channel_id, delay);

        self.mixer = Some(Mixer::create(
            delay,
            self.default_volume,
            self.tx.clone(),
            self.audio.clone(),
            self.negotiation.clone(),
            self.registry.clone(),
        ));
        true
    }

    async fn handle_control(&mut self, packet: ControlPacket) -> bool {
        match packet {
            ControlPacket::Version(msg) => self.handle_version(msg),
            ControlPacket::Ping(msg) => self.handle_ping(msg),
            ControlPacket::Reject(msg) => self.handle_reject(msg),
            ControlPacket::ServerSync(msg) => self.handle_server_sync(msg),
            ControlPacket::ServerConfig(msg) => self.handle_server_config(msg),
            ControlPacket::CryptSetup(msg) => return self.handle_crypt_setup(msg).await,
            ControlPacket::CodecVersion(msg) => self.handle_codec_version(msg),
            ControlPacket::UserState(msg) => self.handle_user_state(msg),
            ControlPacket::UserRemove(msg) => self.handle_user_remove(msg),
            ControlPacket::ChannelState(msg) => self.state.update_channel(msg),
            ControlPacket::ChannelRemove(msg) => {
                if let Some(id) = msg.channel_id {
                    self.state.remove_channel(id);
                }
            }
            ControlPacket::TextMessage(msg) => self.handle_text_message(msg),
            ControlPacket::UserStats(msg) => self.handle_user_stats(msg),
            ControlPacket::PermissionDenied(msg) => {
                warn!(
                    "permission denied{}",
                    msg.reason.map(|r| format!(": {}", r)).unwrap_or_default()
                );
            }
            ControlPacket::UdpTunnel(packet) => self.handle_voice_packet(packet),
            other => debug!("unhandled message {}", other.name()),
        }

        true
    }

    fn handle_version(&self, msg: msgs::Version) {
        if let Some(version) = msg.version {
            info!("server protocol version: {}", version_string(version));
        }
        if let Some(release) = msg.release {
            info!("server release: {}", release);
        }
    }

    fn handle_ping(&mut self, msg: msgs::Ping) {
        let elapsed = self.timestamp();
        self.tcp_ping.update(elapsed, msg.timestamp.unwrap_or(0));

        let server_good = msg.good.unwrap_or(0);
        let local_good = match self.crypt_mut() {
            Some(c) => c.good,
            None => 0,
        };

        if self.udp.is_none() {
            return;
        }

        match evaluate_voice_link(
            self.udp_enabled,
            self.epoch.elapsed(),
            server_good,
            local_good,
        ) {
            Some(false) => {
                self.udp_enabled = false;
                if server_good == 0 && local_good == 0 {
                    warn!("UDP packets cannot be sent to or received from the server");
                } else if server_good == 0 {
                    warn!("UDP packets cannot be sent to the server");
                } else {
                    warn!("UDP packets cannot be received from the server");
                }
                info!("switching to TCP mode");
            }
            Some(true) => {
                self.udp_enabled = true;
                info!("switching back to UDP mode");
            }
            None => {}
        }
    }

    fn handle_reject(&mut self, msg: msgs::Reject) {
        self.restart = false;
        error!(
            "server rejected connection{}",
            msg.reason.map(|r| format!(": {}", r)).unwrap_or_default()
        );
    }

    fn handle_server_sync(&mut self, msg: msgs::ServerSync) {
        if let Some(session) = msg.session {
            self.session.store(session, Ordering::SeqCst);
            info!("synchronized, session id {}", session);
        }
        if let Some(text) = msg.welcome_text {
            info!("welcome message: {}", text);
        }
        if let Some(max) = msg.max_bandwidth {
            self.apply_max_bandwidth(max);
        }
    }

    fn handle_server_config(&mut self, msg: msgs::ServerConfig) {
        if let Some(text) = msg.welcome_text {
            info!("welcome message: {}", text);
        }
        if let Some(len) = msg.message_length {
            self.state.set_max_message_length(len);
        }
        if let Some(max) = msg.max_bandwidth {
            self.apply_max_bandwidth(max);
        }
    }

    fn apply_max_bandwidth(&mut self, max: u32) {
        let mut audio = self.audio.lock().unwrap();
        if audio.apply_max_bandwidth(max, self.udp_enabled) {
            info!("server bandwidth is only {} kbit/s", max / 1000);
            info!(
                "audio quality adjusted to {} kbit/s ({} ms)",
                audio.bitrate / 1000,
                audio.frames_per_packet * 10
            );
        }
    }

    async fn handle_crypt_setup(&mut self, msg: msgs::CryptSetup) -> bool {
        fn block(v: &Option<Vec<u8>>) -> Option<[u8; BLOCK_SIZE]> {
            v.as_deref().and_then(|v| v.try_into().ok())
        }

        match (block(&msg.key), block(&msg.client_nonce), block(&msg.server_nonce)) {
            (Some(key), Some(client_nonce), Some(server_nonce)) => {
                if let Some(udp) = &mut self.udp {
                    udp.codec_mut()
                        .set_crypt(CryptState::new(&key, &client_nonce, &server_nonce));
                    self.udp_enabled = true;
                    debug!("crypt state initialized");
                }
                true
            }
            (None, None, Some(server_nonce)) => {
                if let Some(crypt) = self.crypt_mut() {
                    crypt.set_decrypt_iv(&server_nonce);
                    debug!("crypt state resynchronized");
                }
                true
            }
            _ => {
                // server asks for our IV
                let iv = match self.crypt_mut() {
                    Some(crypt) => *crypt.encrypt_iv(),
                    None => return true,
                };
                let reply = msgs::CryptSetup {
                    client_nonce: Some(iv.to_vec()),
                    ..Default::default()
                };
                self.send_control(reply.into()).await
            }
        }
    }

    fn handle_codec_version(&mut self, msg: msgs::CodecVersion) {
        let alpha = msg.alpha.unwrap_or(-1);
        let beta = msg.beta.unwrap_or(-1);
        let prefer_alpha = msg.prefer_alpha.unwrap_or(true);

        self.negotiation
            .lock()
            .unwrap()
            .apply(&self.registry, alpha, beta, prefer_alpha);
    }

    fn handle_user_state(&mut self, msg: msgs::UserState) {
        if let Some(user) = self.state.update_user(msg) {
            if user.session != self.session.load(Ordering::SeqCst) {
                let _ = self.events.send(Event::UserJoined {
                    session: user.session,
                    name: user.name,
                });
            }
        }
    }

    fn handle_user_remove(&mut self, msg: msgs::UserRemove) {
        let session = match msg.session {
            Some(session) => session,
            None => return,
        };

        if session == self.session.load(Ordering::SeqCst) {
            let reason = msg.reason.map(|r| format!(" ({})", r)).unwrap_or_default();
            if msg.ban.unwrap_or(false) {
                warn!("banned from server{}", reason);
                self.restart = false;
            } else {
                warn!("kicked from server{}", reason);
            }
        }

        self.state.remove_user(session);
    }

    fn handle_text_message(&mut self, msg: msgs::TextMessage) {
        let message = match msg.message {
            Some(message) => message,
            None => return,
        };

        let _ = self.events.send(Event::Message {
            actor: msg.actor,
            receivers: msg.session,
            channels: msg.channel_id,
            message,
        });
    }

    fn handle_user_stats(&mut self, msg: msgs::UserStats) {
        let session = match msg.session {
            Some(session) => session,
            None => return,
        };

        if let Some(address) = &msg.address {
            self.state.set_user_address(session, address);
        }

        let _ = self.events.send(Event::UserStats { session });
    }

    fn handle_voice(&mut self, packet: AudioPacket, addr: SocketAddr) {
        // only the registered remote may feed us datagrams
        if addr != self.peer {
            return;
        }

        self.handle_voice_packet(packet);
    }

    /// Voice dispatch shared by the UDP path and the TCP tunnel.
    fn handle_voice_packet(&mut self, packet: AudioPacket) {
        match &packet.payload {
            AudioPayload::Ping { timestamp } => {
                let elapsed = self.timestamp();
                self.udp_ping.update(elapsed, *timestamp);
            }
            AudioPayload::Voice {
                session: Some(session),
                sequence,
                frames,
                ..
            } => {
                if packet.typ == PacketType::Speex {
                    debug!("dropping unsupported speex packet");
                    return;
                }
                if let Some(mixer) = &self.mixer {
                    mixer.feed(packet.typ, *session, *sequence, frames);
                }
            }
            AudioPayload::Voice { session: None, .. } => {
                debug!("dropping voice packet without speaker session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_tracker_statistics() {
        let mut tracker = PingTracker::default();

        // three pongs with 10 ms, 20 ms, 30 ms round trips
        tracker.update(10_000, 0);
        tracker.update(30_000, 10_000);
        tracker.update(60_000, 30_000);

        assert_eq!(tracker.n, 3);
        assert!((tracker.avg - 20.0).abs() < 1e-3);
        // population standard deviation of {10, 20, 30}
        assert!((tracker.var - 8.1649).abs() < 1e-3);
    }

    #[test]
    fn ping_tracker_ignores_clock_skew() {
        let mut tracker = PingTracker::default();
        tracker.update(5_000, 10_000);
        assert_eq!(tracker.avg, 0.0);
    }
}
