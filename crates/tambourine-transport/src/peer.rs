//! WebRTC-backed transport session.
//!
//! One peer connection per session carrying an Opus audio track and an
//! ordered data channel. The session sends the RTVI `client-ready` handshake
//! when the channel opens and reports readiness when the backend answers
//! with `bot-ready`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use tambourine_core::config::TransportConfig;
use tambourine_core::types::ClientIdentity;
use tambourine_session::protocol::{client_ready_envelope, decode_frame, InboundFrame};
use tambourine_session::{
    CaptureStream, ClientMessage, SessionParams, TransportError, TransportEvent,
    TransportEventSink, TransportSession,
};

use crate::signalling::SignallingClient;

/// Upper bound on waiting for ICE gathering before sending the offer.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

fn peer_err(e: webrtc::Error) -> TransportError {
    TransportError::PeerConnection(e.to_string())
}

/// State shared with the peer connection and data channel callbacks.
struct Shared {
    generation: u64,
    ready: AtomicBool,
    closed: AtomicBool,
    audio_enabled: AtomicBool,
    events: TransportEventSink,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            self.events.emit(event);
        }
    }

    fn on_peer_state(&self, state: RTCPeerConnectionState) {
        debug!(generation = self.generation, state = %state, "Peer connection state changed");
        match state {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                self.ready.store(false, Ordering::SeqCst);
                self.emit(TransportEvent::Disconnected {
                    reason: format!("Peer connection {}", state),
                });
            }
            RTCPeerConnectionState::Disconnected => {
                self.ready.store(false, Ordering::SeqCst);
                self.emit(TransportEvent::Degraded);
            }
            _ => {}
        }
    }

    fn on_channel_closed(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Degraded);
    }

    fn on_frame(&self, data: &[u8]) {
        match decode_frame(data) {
            Ok(InboundFrame::BotReady) => {
                if !self.ready.swap(true, Ordering::SeqCst) {
                    info!(generation = self.generation, "Backend ready");
                    self.emit(TransportEvent::Ready);
                }
            }
            Ok(InboundFrame::BotText(text)) => self.emit(TransportEvent::BotText(text)),
            Ok(InboundFrame::Server(message)) => self.emit(TransportEvent::Message(message)),
            Ok(InboundFrame::Ignored(kind)) => trace!(kind = %kind, "Ignoring frame"),
            Err(e) => warn!(error = %e, "Undecodable data-channel frame"),
        }
    }
}

pub struct WebRtcSession {
    server_url: String,
    identity: ClientIdentity,
    signalling: SignallingClient,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    track: Arc<TrackLocalStaticSample>,
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcSession {
    /// Build the peer connection, audio track and data channel. Nothing is
    /// sent to the backend until `connect`.
    pub async fn open(
        params: SessionParams,
        events: TransportEventSink,
        config: &TransportConfig,
        signalling: SignallingClient,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(peer_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(peer_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(peer_err)?);

        let shared = Arc::new(Shared {
            generation: params.generation,
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            audio_enabled: AtomicBool::new(false),
            events,
        });

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "tambourine".to_string(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Audio(e.to_string()))?;

        let channel = pc
            .create_data_channel(
                &config.data_channel_label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(peer_err)?;

        let on_state = Arc::clone(&shared);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            on_state.on_peer_state(state);
            Box::pin(async {})
        }));

        let weak_channel = Arc::downgrade(&channel);
        let generation = params.generation;
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                let Some(channel) = weak_channel.upgrade() else {
                    return;
                };
                let result = match client_ready_envelope() {
                    Ok(bytes) => channel.send(&Bytes::from(bytes)).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                match result {
                    Ok(_) => debug!(generation, "Data channel open, sent client-ready"),
                    Err(e) => warn!(generation, error = %e, "Failed to send client-ready"),
                }
            })
        }));

        let on_message = Arc::clone(&shared);
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            on_message.on_frame(&msg.data);
            Box::pin(async {})
        }));

        let on_close = Arc::clone(&shared);
        channel.on_close(Box::new(move || {
            on_close.on_channel_closed();
            Box::pin(async {})
        }));

        Ok(Self {
            server_url: params.server_url,
            identity: params.identity,
            signalling,
            pc,
            channel,
            track,
            shared,
            pump: Mutex::new(None),
        })
    }
}

#[async_trait]
impl TransportSession for WebRtcSession {
    fn generation(&self) -> u64 {
        self.shared.generation
    }

    fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
            && self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let offer = self.pc.create_offer(None).await.map_err(peer_err)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await.map_err(peer_err)?;
        if tokio::time::timeout(ICE_GATHER_TIMEOUT, gathered.recv()).await.is_err() {
            warn!("ICE gathering incomplete, sending partial offer");
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::PeerConnection("No local description".into()))?;
        let answer = self
            .signalling
            .exchange(&self.server_url, &self.identity, &local.sdp)
            .await?;
        let remote = RTCSessionDescription::answer(answer.sdp).map_err(peer_err)?;
        self.pc.set_remote_description(remote).await.map_err(peer_err)?;

        info!(generation = self.shared.generation, "Peer connection negotiated");
        Ok(())
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        let bytes = message.to_envelope()?;
        self.channel
            .send(&Bytes::from(bytes))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    async fn attach_audio(&self, stream: CaptureStream) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let CaptureStream {
            device_id,
            mut frames,
        } = stream;
        let track = Arc::clone(&self.track);
        let shared = Arc::clone(&self.shared);
        let pump = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if !shared.audio_enabled.load(Ordering::SeqCst) {
                    continue;
                }
                let sample = Sample {
                    data: Bytes::from(frame.data),
                    duration: frame.duration,
                    timestamp: SystemTime::now(),
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    trace!(error = %e, "Dropped audio sample");
                }
            }
            debug!("Capture stream ended");
        });

        if let Some(previous) = self.pump.lock().await.replace(pump) {
            previous.abort();
        }
        debug!(device = ?device_id, "Capture attached to audio track");
        Ok(())
    }

    async fn set_audio_enabled(&self, enabled: bool) {
        self.shared.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.ready.store(false, Ordering::SeqCst);
        self.shared.audio_enabled.store(false, Ordering::SeqCst);

        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Data channel close failed");
        }
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Peer connection close failed");
        }
        info!(generation = self.shared.generation, "Peer connection closed");
    }
}
