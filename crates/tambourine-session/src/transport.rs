//! The transport seam: one real-time peer connection per connect attempt.
//!
//! The connection machine only talks to sessions through these traits, so
//! the peer-connection stack stays swappable and the machine stays testable
//! with scripted fakes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tambourine_core::types::ClientIdentity;

use crate::error::TransportError;
use crate::protocol::{ClientMessage, ServerMessage};

/// One encoded audio frame produced by the platform capture bridge.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub duration: Duration,
}

/// A live capture stream. Dropping the receiver stops consumption; the
/// bridge owns the device and stops it on release.
#[derive(Debug)]
pub struct CaptureStream {
    pub device_id: Option<String>,
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Notifications a session reports about itself.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The data channel is usable for application messages.
    Ready,
    /// The peer connection closed or failed.
    Disconnected { reason: String },
    /// Readiness was lost without an explicit disconnect.
    Degraded,
    /// A chunk of formatted transcript text.
    BotText(String),
    Message(ServerMessage),
}

/// Callback through which a session delivers its `TransportEvent`s.
///
/// Sessions must call it in data-channel arrival order.
#[derive(Clone)]
pub struct TransportEventSink {
    inner: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportEventSink {
    pub fn new(f: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.inner)(event)
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink").finish()
    }
}

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub server_url: String,
    pub identity: ClientIdentity,
    /// Monotonic id of the connect attempt this session belongs to.
    pub generation: u64,
}

/// A single real-time session with the backend.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn generation(&self) -> u64;

    /// Whether the data channel is currently usable.
    fn is_ready(&self) -> bool;

    /// Negotiate with the backend. Readiness is reported later through the
    /// event sink, not by this call returning.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError>;

    /// Route a capture stream into the outbound audio track.
    async fn attach_audio(&self, stream: CaptureStream) -> Result<(), TransportError>;

    async fn set_audio_enabled(&self, enabled: bool);

    /// Stop media and close the peer connection. Idempotent.
    async fn close(&self);
}

/// Creates sessions. Called only by the connection machine, after any prior
/// session has been closed.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        params: SessionParams,
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_sink_delivers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sink = TransportEventSink::new(move |e| seen_clone.lock().unwrap().push(e));

        sink.emit(TransportEvent::BotText("a".into()));
        sink.clone().emit(TransportEvent::Ready);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TransportEvent::BotText("a".into()), TransportEvent::Ready]
        );
    }
}
