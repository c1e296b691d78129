//! Media/track controller for the active call.
//!
//! Mute and hold never renegotiate the session: both flip the `enabled` flag
//! of the outbound audio track, which the RTP send loop checks every frame.
//! A disabled track keeps its clock running but sends nothing.
//!
//! The `AudioChannel` ties RTP framing and UDP transport into a running
//! stream. There is no capture device behind it, so enabled tracks send G.711
//! silence; inbound packets are surfaced as a remote track, which is attached
//! to exactly one playback sink per call.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::time;

use super::rtp;
use super::sdp::{self, SessionDescription};

/// Outbound audio track.
#[derive(Debug)]
pub struct LocalAudioTrack {
    enabled: AtomicBool,
}

impl LocalAudioTrack {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Inbound audio stream detected on the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTrack {
    pub call_id: String,
    pub source: SocketAddr,
    pub ssrc: u32,
    pub payload_type: u8,
}

/// Destination for remote audio.
pub trait PlaybackSink: Send + Sync {
    fn attach(&self, track: &RemoteTrack);
    fn detach(&self, call_id: &str);
}

/// Sink that only logs; used when no playback device is configured.
pub struct LoggingSink;

impl PlaybackSink for LoggingSink {
    fn attach(&self, track: &RemoteTrack) {
        tracing::info!(
            "Playback attached for call {} (ssrc={:#010x}, pt={}, from {})",
            track.call_id,
            track.ssrc,
            track.payload_type,
            track.source
        );
    }

    fn detach(&self, call_id: &str) {
        tracing::info!("Playback detached for call {}", call_id);
    }
}

#[derive(Default)]
struct MediaState {
    call_id: Option<String>,
    tracks: Vec<Arc<LocalAudioTrack>>,
    muted: bool,
    held: bool,
    remote: Option<SessionDescription>,
    early_media: bool,
    active: bool,
    /// Remote track seen before we were ready to play it.
    pending: Option<RemoteTrack>,
    attached: bool,
    channel: Option<AudioChannel>,
    session_version: u64,
}

pub struct MediaController {
    state: Mutex<MediaState>,
    sink: Arc<dyn PlaybackSink>,
    local_ip: String,
}

impl MediaController {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Arc<Self> {
        Self::with_local_ip(sink, sdp::get_local_ip())
    }

    pub fn with_local_ip(sink: Arc<dyn PlaybackSink>, local_ip: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MediaState::default()),
            sink,
            local_ip: local_ip.into(),
        })
    }

    /// Reset for a new call and create its outbound audio track.
    pub fn begin(&self, call_id: &str) {
        let old = {
            let mut st = self.lock();
            let old = st.channel.take();
            let version = st.session_version + 1;
            *st = MediaState {
                call_id: Some(call_id.to_string()),
                tracks: vec![Arc::new(LocalAudioTrack::new())],
                session_version: version,
                ..MediaState::default()
            };
            old
        };
        drop(old);
    }

    /// Bind the RTP channel for the current call. Returns the local port.
    pub async fn open_channel(self: &Arc<Self>) -> Result<u16> {
        let (call_id, track) = {
            let st = self.lock();
            let call_id = st.call_id.clone().context("No call prepared for media")?;
            let track = st.tracks.first().cloned().context("No local audio track")?;
            (call_id, track)
        };

        let channel = AudioChannel::bind(call_id.clone(), track, Arc::downgrade(self)).await?;
        let port = channel.local_port;

        let mut st = self.lock();
        if st.call_id.as_deref() != Some(call_id.as_str()) {
            // Call changed while binding; the channel drops here.
            anyhow::bail!("Call {} no longer current", call_id);
        }
        if let Some(remote) = st.remote.as_ref() {
            channel.set_target(remote);
        }
        st.channel = Some(channel);
        Ok(port)
    }

    fn local_port(&self) -> u16 {
        self.lock()
            .channel
            .as_ref()
            .map(|c| c.local_port)
            .unwrap_or(0)
    }

    /// SDP offer for an outgoing INVITE.
    pub fn local_offer(&self) -> String {
        let version = self.lock().session_version;
        sdp::generate_offer(&self.local_ip, self.local_port(), version)
    }

    /// Apply the remote offer of an incoming call and produce our answer.
    pub fn answer_offer(&self, remote_sdp: &str) -> Result<String> {
        let offer = sdp::parse(remote_sdp).context("Invalid remote offer")?;
        let answer = sdp::generate_answer(
            &self.local_ip,
            self.local_port(),
            self.lock().session_version,
            &offer,
        )?;
        self.set_remote(offer);
        Ok(answer)
    }

    fn set_remote(&self, remote: SessionDescription) {
        let mut st = self.lock();
        if let Some(channel) = st.channel.as_ref() {
            channel.set_target(&remote);
        }
        st.remote = Some(remote);
    }

    /// Apply a session description from a provisional response so ringback
    /// plays before the call is answered.
    pub fn apply_early_media(&self, call_id: &str, remote_sdp: &str) -> Result<()> {
        let remote = sdp::parse(remote_sdp).context("Invalid early media description")?;
        let pending = {
            let mut st = self.lock();
            if st.call_id.as_deref() != Some(call_id) {
                return Ok(());
            }
            if let Some(channel) = st.channel.as_ref() {
                channel.set_target(&remote);
            }
            st.remote = Some(remote);
            st.early_media = true;
            st.pending.take()
        };
        tracing::info!("Early media applied for call {}", call_id);
        if let Some(track) = pending {
            self.on_remote_track(track);
        }
        Ok(())
    }

    /// The call reached Active. `remote_sdp` is the final answer, if any.
    pub fn on_active(&self, call_id: &str, remote_sdp: Option<&str>) -> Result<()> {
        let remote = remote_sdp
            .map(sdp::parse)
            .transpose()
            .context("Invalid remote answer")?;
        let pending = {
            let mut st = self.lock();
            if st.call_id.as_deref() != Some(call_id) {
                return Ok(());
            }
            if let Some(remote) = remote {
                if let Some(channel) = st.channel.as_ref() {
                    channel.set_target(&remote);
                }
                st.remote = Some(remote);
            }
            st.active = true;
            st.pending.take()
        };
        if let Some(track) = pending {
            self.on_remote_track(track);
        }
        Ok(())
    }

    /// Remote track event from the channel.
    pub fn on_remote_track(&self, track: RemoteTrack) {
        {
            let mut st = self.lock();
            if st.call_id.as_deref() != Some(track.call_id.as_str()) || st.attached {
                return;
            }
            if !(st.active || st.early_media) {
                st.pending = Some(track);
                return;
            }
            st.attached = true;
        }
        self.sink.attach(&track);
    }

    pub fn set_muted(&self, muted: bool) -> bool {
        let mut st = self.lock();
        st.muted = muted;
        Self::sync_tracks(&st)
    }

    pub fn set_held(&self, held: bool) -> bool {
        let mut st = self.lock();
        st.held = held;
        Self::sync_tracks(&st)
    }

    fn sync_tracks(st: &MediaState) -> bool {
        let enabled = !(st.muted || st.held);
        for track in &st.tracks {
            track.set_enabled(enabled);
        }
        enabled
    }

    /// Whether the outbound track of `call_id` is currently sending.
    pub fn track_enabled(&self) -> Option<bool> {
        self.lock().tracks.first().map(|t| t.is_enabled())
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    /// Stop tracks, close the channel and detach playback.
    pub fn release(&self, call_id: &str) {
        let (channel, was_attached) = {
            let mut st = self.lock();
            if st.call_id.as_deref() != Some(call_id) {
                return;
            }
            for track in &st.tracks {
                track.set_enabled(false);
            }
            let channel = st.channel.take();
            let attached = st.attached;
            let version = st.session_version;
            *st = MediaState {
                session_version: version,
                ..MediaState::default()
            };
            (channel, attached)
        };
        if let Some(channel) = channel {
            channel.log_stats();
        }
        if was_attached {
            self.sink.detach(call_id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MediaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Default)]
struct ChannelStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Target {
    addr: SocketAddr,
    payload_type: u8,
}

/// RTP over UDP for one call.
struct AudioChannel {
    call_id: String,
    local_port: u16,
    target: Arc<Mutex<Option<Target>>>,
    stats: Arc<ChannelStats>,
    send_handle: Option<tokio::task::JoinHandle<()>>,
    recv_handle: Option<tokio::task::JoinHandle<()>>,
}

impl AudioChannel {
    async fn bind(
        call_id: String,
        track: Arc<LocalAudioTrack>,
        controller: Weak<MediaController>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind RTP socket")?;
        let local_port = socket.local_addr()?.port();
        tracing::info!("Audio channel for call {} bound on port {}", call_id, local_port);

        let socket = Arc::new(socket);
        let target = Arc::new(Mutex::new(None));
        let stats = Arc::new(ChannelStats::default());

        let send_handle = tokio::spawn(send_loop(
            socket.clone(),
            target.clone(),
            track,
            stats.clone(),
        ));
        let recv_handle = tokio::spawn(recv_loop(
            socket,
            call_id.clone(),
            stats.clone(),
            controller,
        ));

        Ok(Self {
            call_id,
            local_port,
            target,
            stats,
            send_handle: Some(send_handle),
            recv_handle: Some(recv_handle),
        })
    }

    fn set_target(&self, remote: &SessionDescription) {
        let (Some(addr), Some(payload_type)) = (remote.remote_addr(), remote.audio_codec()) else {
            tracing::debug!("Remote description has no usable audio target");
            return;
        };
        tracing::debug!("Call {} sending RTP to {} (pt={})", self.call_id, addr, payload_type);
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(Target { addr, payload_type });
    }

    fn log_stats(&self) {
        tracing::info!(
            "Audio channel for call {} closed. Sent: {}, Received: {} ({} bytes)",
            self.call_id,
            self.stats.packets_sent.load(Ordering::Relaxed),
            self.stats.packets_received.load(Ordering::Relaxed),
            self.stats.bytes_received.load(Ordering::Relaxed)
        );
    }
}

impl Drop for AudioChannel {
    fn drop(&mut self) {
        if let Some(h) = self.send_handle.take() {
            h.abort();
        }
        if let Some(h) = self.recv_handle.take() {
            h.abort();
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    target: Arc<Mutex<Option<Target>>>,
    track: Arc<LocalAudioTrack>,
    stats: Arc<ChannelStats>,
) {
    let mut interval = time::interval(Duration::from_millis(rtp::PACKET_INTERVAL_MS));
    let mut stream: Option<rtp::RtpStream> = None;

    loop {
        interval.tick().await;

        let current = {
            let guard = target.lock().unwrap_or_else(|e| e.into_inner());
            *guard
        };
        let Some(target) = current else {
            continue;
        };
        if stream.as_ref().map(|s| s.payload_type) != Some(target.payload_type) {
            stream = Some(rtp::RtpStream::new(target.payload_type));
        }
        let Some(rtp_stream) = stream.as_mut() else {
            continue;
        };

        if !track.is_enabled() {
            rtp_stream.skip_frame();
            continue;
        }

        let packet = rtp_stream.next_packet(&rtp::silence(target.payload_type));
        match socket.send_to(&packet, target.addr).await {
            Ok(_) => {
                stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::debug!("RTP send to {} failed: {}", target.addr, e),
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    call_id: String,
    stats: Arc<ChannelStats>,
    controller: Weak<MediaController>,
) {
    let mut buf = [0u8; 2048];
    let mut announced = false;

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("RTP recv error: {:#}", e);
                time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let Ok((header, payload)) = rtp::decode(&buf[..len]) else {
            continue;
        };
        stats.packets_received.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        if !announced {
            announced = true;
            let Some(controller) = controller.upgrade() else {
                return;
            };
            controller.on_remote_track(RemoteTrack {
                call_id: call_id.clone(),
                source: from,
                ssrc: header.ssrc,
                payload_type: header.payload_type,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        attached: Mutex<Vec<RemoteTrack>>,
        detached: Mutex<Vec<String>>,
    }

    impl PlaybackSink for RecordingSink {
        fn attach(&self, track: &RemoteTrack) {
            self.attached.lock().unwrap().push(track.clone());
        }
        fn detach(&self, call_id: &str) {
            self.detached.lock().unwrap().push(call_id.to_string());
        }
    }

    fn remote(call_id: &str) -> RemoteTrack {
        RemoteTrack {
            call_id: call_id.into(),
            source: "10.0.0.1:4000".parse().unwrap(),
            ssrc: 42,
            payload_type: rtp::PT_PCMU,
        }
    }

    const ANSWER: &str = "v=0\r\nc=IN IP4 127.0.0.1\r\nm=audio 4000 RTP/AVP 0\r\n";

    #[test]
    fn test_mute_round_trip_restores_track() {
        let media = MediaController::with_local_ip(Arc::new(LoggingSink), "127.0.0.1");
        media.begin("c1");
        assert_eq!(media.track_enabled(), Some(true));

        assert!(!media.set_muted(true));
        assert_eq!(media.track_enabled(), Some(false));
        assert!(media.set_muted(false));
        assert_eq!(media.track_enabled(), Some(true));
    }

    #[test]
    fn test_hold_and_mute_share_the_track_flag() {
        let media = MediaController::with_local_ip(Arc::new(LoggingSink), "127.0.0.1");
        media.begin("c1");
        media.set_held(true);
        media.set_muted(true);
        media.set_muted(false);
        assert_eq!(media.track_enabled(), Some(false), "still held");
        media.set_held(false);
        assert_eq!(media.track_enabled(), Some(true));
    }

    #[test]
    fn test_remote_track_waits_for_active_then_attaches_once() {
        let sink = Arc::new(RecordingSink::default());
        let media = MediaController::with_local_ip(sink.clone(), "127.0.0.1");
        media.begin("c1");

        media.on_remote_track(remote("c1"));
        assert!(sink.attached.lock().unwrap().is_empty());

        media.on_active("c1", Some(ANSWER)).unwrap();
        media.on_remote_track(remote("c1"));
        media.on_remote_track(remote("c1"));
        assert_eq!(sink.attached.lock().unwrap().len(), 1);

        media.release("c1");
        assert_eq!(*sink.detached.lock().unwrap(), vec!["c1".to_string()]);
        assert!(!media.is_attached());
    }

    #[test]
    fn test_early_media_attaches_before_active() {
        let sink = Arc::new(RecordingSink::default());
        let media = MediaController::with_local_ip(sink.clone(), "127.0.0.1");
        media.begin("c1");
        media.apply_early_media("c1", ANSWER).unwrap();
        media.on_remote_track(remote("c1"));
        assert_eq!(sink.attached.lock().unwrap().len(), 1);

        media.on_active("c1", None).unwrap();
        assert_eq!(sink.attached.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_events_for_other_calls_are_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let media = MediaController::with_local_ip(sink.clone(), "127.0.0.1");
        media.begin("c2");
        media.on_active("c2", None).unwrap();
        media.on_remote_track(remote("c1"));
        assert!(sink.attached.lock().unwrap().is_empty());
        media.release("c1");
        assert_eq!(media.track_enabled(), Some(true));
    }

    #[test]
    fn test_answer_offer_requires_common_codec() {
        let media = MediaController::with_local_ip(Arc::new(LoggingSink), "127.0.0.1");
        media.begin("c1");
        let bad = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 9\r\n";
        assert!(media.answer_offer(bad).is_err());
        let answer = media.answer_offer(ANSWER).unwrap();
        assert!(answer.contains("RTP/AVP 0"));
    }

    #[tokio::test]
    async fn test_channel_surfaces_inbound_rtp_as_remote_track() {
        let sink = Arc::new(RecordingSink::default());
        let media = MediaController::with_local_ip(sink.clone(), "127.0.0.1");
        media.begin("c1");
        let port = media.open_channel().await.unwrap();
        media.on_active("c1", None).unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut stream = rtp::RtpStream::new(rtp::PT_PCMU);
        let pkt = stream.next_packet(&rtp::silence(rtp::PT_PCMU));
        peer.send_to(&pkt, ("127.0.0.1", port)).await.unwrap();

        for _ in 0..50 {
            if !sink.attached.lock().unwrap().is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        let attached = sink.attached.lock().unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].ssrc, stream.ssrc);
    }
}
