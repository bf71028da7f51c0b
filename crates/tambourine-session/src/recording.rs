//! Recording turn orchestration.
//!
//! Owns the capture stream for the duration of one turn: acquire (or reuse
//! the pre-warmed stream), attach it to the session, enable outbound audio,
//! then tell the backend a turn started. Release runs in the opposite order.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::messenger::{SafeMessenger, SendOutcome};
use crate::protocol::ClientMessage;
use crate::transport::{CaptureStream, TransportSession};

/// Platform microphone access.
#[async_trait]
pub trait AudioBridge: Send + Sync {
    /// Start capturing from the selected device.
    async fn acquire(&self) -> Result<CaptureStream, CaptureError>;

    /// Stop capturing and free the device. Must be safe to call when idle.
    async fn release(&self);
}

/// Receives the finished transcript of a turn.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn deliver(&self, text: String);
}

pub struct RecordingOrchestrator {
    audio: Arc<dyn AudioBridge>,
    prewarmed: Option<CaptureStream>,
    capturing: bool,
}

impl RecordingOrchestrator {
    pub fn new(audio: Arc<dyn AudioBridge>) -> Self {
        Self {
            audio,
            prewarmed: None,
            capturing: false,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing || self.prewarmed.is_some()
    }

    /// Acquire capture ahead of the turn so the first words are not lost.
    pub async fn prewarm(&mut self) -> Result<(), CaptureError> {
        if self.is_capturing() {
            return Ok(());
        }
        let stream = self.audio.acquire().await?;
        debug!(device = ?stream.device_id, "Capture pre-warmed");
        self.prewarmed = Some(stream);
        Ok(())
    }

    /// Start a turn on `session`.
    ///
    /// Capture errors come back as `Err` and leave nothing held. A failed
    /// `start-recording` send is reported through the messenger and returned
    /// as the outcome; capture is still held and is released when the
    /// machine leaves the recording state.
    pub async fn begin(
        &mut self,
        session: &dyn TransportSession,
        messenger: &SafeMessenger,
    ) -> Result<SendOutcome, CaptureError> {
        let stream = match self.prewarmed.take() {
            Some(stream) => stream,
            None => self.audio.acquire().await?,
        };
        self.capturing = true;

        if let Err(e) = session.attach_audio(stream).await {
            self.release(Some(session)).await;
            return Err(e.into());
        }
        session.set_audio_enabled(true).await;

        let outcome = messenger.send(session, &ClientMessage::StartRecording {}).await;
        if outcome.is_sent() {
            info!(generation = session.generation(), "Recording started");
        }
        Ok(outcome)
    }

    /// Disable outbound audio and release the device. Idempotent.
    pub async fn release(&mut self, session: Option<&dyn TransportSession>) {
        if !self.is_capturing() {
            return;
        }
        if let Some(session) = session {
            session.set_audio_enabled(false).await;
        }
        self.prewarmed = None;
        self.capturing = false;
        self.audio.release().await;
        debug!("Capture released");
    }
}

impl Drop for RecordingOrchestrator {
    fn drop(&mut self) {
        if self.is_capturing() {
            warn!("Recording orchestrator dropped while capture was held");
        }
    }
}
