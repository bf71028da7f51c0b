//! Error types for the session subsystem.

use tambourine_core::error::TambourineError;

/// Errors from identity verification and registration.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Registration request failed: {0}")]
    Registration(String),
    #[error("Backend returned an invalid identity response: {0}")]
    InvalidResponse(String),
    #[error("Identity storage error: {0}")]
    Storage(#[from] TambourineError),
}

/// Errors from a transport session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Backend rejected the client identity")]
    IdentityRejected,
    #[error("Transport is not ready")]
    NotReady,
    #[error("Signalling failed: {0}")]
    Signalling(String),
    #[error("Peer connection failed: {0}")]
    PeerConnection(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Audio attach failed: {0}")]
    Audio(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Transport closed")]
    Closed,
}

/// Errors from the audio capture bridge.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("No capture device available")]
    NoDevice,
    #[error("Capture device busy")]
    Busy,
    #[error("Capture failed: {0}")]
    Failed(String),
    #[error("Attaching capture to the session failed: {0}")]
    Attach(#[from] TransportError),
}

/// Errors from the connection machine handle.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("Connection machine has stopped")]
    Stopped,
    #[error("No server URL configured")]
    NoServerUrl,
}

impl From<MachineError> for TambourineError {
    fn from(err: MachineError) -> Self {
        match err {
            MachineError::Stopped => TambourineError::ShuttingDown,
            MachineError::NoServerUrl => TambourineError::Config(err.to_string()),
        }
    }
}
