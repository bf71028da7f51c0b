//! Guarded data-channel sends.
//!
//! `SafeMessenger` never lets a send error escape as an `Err`: it checks
//! readiness, captures failures into a `SendOutcome`, and reports every
//! failure once through its error callback. The connection machine installs
//! a callback that turns failures into a retry.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::ClientMessage;
use crate::transport::TransportSession;

/// Result of a guarded send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    NotReady,
    Failed(String),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

/// A failed send, as reported to the error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub generation: u64,
    pub message_type: &'static str,
    pub reason: String,
}

type ErrorCallback = Arc<dyn Fn(SendFailure) + Send + Sync>;

#[derive(Clone)]
pub struct SafeMessenger {
    on_error: ErrorCallback,
}

impl fmt::Debug for SafeMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeMessenger").finish()
    }
}

impl SafeMessenger {
    pub fn new(on_error: impl Fn(SendFailure) + Send + Sync + 'static) -> Self {
        Self {
            on_error: Arc::new(on_error),
        }
    }

    pub async fn send(&self, session: &dyn TransportSession, message: &ClientMessage) -> SendOutcome {
        let message_type = message.message_type();

        if !session.is_ready() {
            warn!(message_type, generation = session.generation(), "Send skipped: transport not ready");
            self.fail(session, message_type, "Transport not ready".to_string());
            return SendOutcome::NotReady;
        }

        match session.send(message).await {
            Ok(()) => {
                debug!(message_type, "Sent message");
                SendOutcome::Sent
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(message_type, error = %reason, "Send failed");
                self.fail(session, message_type, reason.clone());
                SendOutcome::Failed(reason)
            }
        }
    }

    fn fail(&self, session: &dyn TransportSession, message_type: &'static str, reason: String) {
        (self.on_error)(SendFailure {
            generation: session.generation(),
            message_type,
            reason,
        });
    }
}
