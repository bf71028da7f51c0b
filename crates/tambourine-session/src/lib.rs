//! Connection and session lifecycle for the Tambourine dictation client.
//!
//! The connection machine (`state` + `machine`) owns the lifecycle of one
//! transport session at a time: identity resolution, negotiation, health
//! checks, recording turns and reconnects with backoff. Everything with
//! side effects sits behind a trait (`IdentityService`, `TransportFactory`,
//! `AudioBridge`, `TranscriptSink`).

pub mod backoff;
pub mod config_sync;
pub mod error;
pub mod identity;
pub mod machine;
pub mod messenger;
pub mod protocol;
pub mod recording;
pub mod state;
pub mod transport;

pub use backoff::Backoff;
pub use config_sync::{compute_delta, ConfigSync, SyncOutcome};
pub use error::{CaptureError, IdentityError, MachineError, TransportError};
pub use identity::{IdentityRegistry, IdentityService, IDENTITY_KEY};
pub use machine::{ConnectionMachine, MachineDeps, MachineHandle, MachineSnapshot};
pub use messenger::{SafeMessenger, SendFailure, SendOutcome};
pub use protocol::{decode_frame, ClientMessage, InboundFrame, ServerMessage};
pub use recording::{AudioBridge, RecordingOrchestrator, TranscriptSink};
pub use state::{ConnectionContext, Effect, Machine, MachineEvent, Timing};
pub use transport::{
    AudioFrame, CaptureStream, SessionParams, TransportEvent, TransportEventSink,
    TransportFactory, TransportSession,
};
