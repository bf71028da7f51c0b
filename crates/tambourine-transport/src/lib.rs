//! WebRTC transport for the Tambourine connection machine.
//!
//! Implements `TransportFactory`/`TransportSession` on top of webrtc-rs:
//! SDP is exchanged over HTTP with the backend, protocol messages travel on
//! an ordered data channel and microphone audio on an Opus track.

pub mod factory;
pub mod peer;
pub mod signalling;

pub use factory::WebRtcTransportFactory;
pub use peer::WebRtcSession;
pub use signalling::{Answer, SignallingClient, CLIENT_UUID_HEADER};
