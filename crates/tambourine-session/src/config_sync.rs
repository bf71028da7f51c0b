//! Configuration synchronization over the data channel.
//!
//! The backend keeps per-session configuration, so every new session gets a
//! full sync and every later settings change sends only the fields that
//! differ from what was last delivered.

use tracing::{debug, info, warn};

use tambourine_core::types::ConfigSnapshot;

use crate::messenger::{SafeMessenger, SendOutcome};
use crate::protocol::ClientMessage;
use crate::transport::TransportSession;

/// Messages needed to bring the backend from `previous` to `current`.
///
/// `None` for `previous` means nothing was sent yet on this session, so
/// every non-null field is included. Order is fixed: prompt sections, STT
/// provider, LLM provider, STT timeout.
pub fn compute_delta(current: &ConfigSnapshot, previous: Option<&ConfigSnapshot>) -> Vec<ClientMessage> {
    let mut messages = Vec::new();

    if let Some(sections) = &current.prompt_sections {
        if previous.map_or(true, |p| p.prompt_sections.as_ref() != Some(sections)) {
            messages.push(ClientMessage::SetPromptSections {
                sections: sections.clone(),
            });
        }
    }
    if let Some(provider) = &current.stt_provider {
        if previous.map_or(true, |p| p.stt_provider.as_ref() != Some(provider)) {
            messages.push(ClientMessage::SetSttProvider {
                provider: provider.clone(),
            });
        }
    }
    if let Some(provider) = &current.llm_provider {
        if previous.map_or(true, |p| p.llm_provider.as_ref() != Some(provider)) {
            messages.push(ClientMessage::SetLlmProvider {
                provider: provider.clone(),
            });
        }
    }
    if let Some(timeout) = current.stt_timeout_seconds {
        if previous.map_or(true, |p| p.stt_timeout_seconds != Some(timeout)) {
            messages.push(ClientMessage::SetSttTimeout {
                timeout_seconds: timeout,
            });
        }
    }

    messages
}

/// How a batch went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// All messages were sent.
    Complete { sent: usize },
    /// The batch stopped at the first failure; later messages were not attempted.
    Aborted {
        sent: usize,
        failed: &'static str,
        outcome: SendOutcome,
    },
}

impl SyncOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, SyncOutcome::Complete { .. })
    }
}

/// Send `messages` one at a time, stopping at the first failure.
pub async fn send_all(
    messenger: &SafeMessenger,
    session: &dyn TransportSession,
    messages: &[ClientMessage],
) -> SyncOutcome {
    for (sent, message) in messages.iter().enumerate() {
        let outcome = messenger.send(session, message).await;
        if !outcome.is_sent() {
            warn!(
                sent,
                remaining = messages.len() - sent,
                failed = message.message_type(),
                "Config sync aborted"
            );
            return SyncOutcome::Aborted {
                sent,
                failed: message.message_type(),
                outcome,
            };
        }
    }
    SyncOutcome::Complete {
        sent: messages.len(),
    }
}

/// Per-session record of the last snapshot fully delivered to the backend.
#[derive(Debug, Default)]
pub struct ConfigSync {
    last_sent: Option<ConfigSnapshot>,
}

impl ConfigSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget what was sent, so the next sync is a full one.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }

    pub fn last_sent(&self) -> Option<&ConfigSnapshot> {
        self.last_sent.as_ref()
    }

    /// Send the delta between `current` and the last delivered snapshot.
    ///
    /// The record only advances when the whole batch went through; an aborted
    /// batch is caught up by the next sync.
    pub async fn sync(
        &mut self,
        messenger: &SafeMessenger,
        session: &dyn TransportSession,
        current: &ConfigSnapshot,
    ) -> SyncOutcome {
        let full = self.last_sent.is_none();
        let messages = compute_delta(current, self.last_sent.as_ref());
        if messages.is_empty() {
            debug!("Config already in sync");
            self.last_sent = Some(current.clone());
            return SyncOutcome::Complete { sent: 0 };
        }

        let outcome = send_all(messenger, session, &messages).await;
        if outcome.is_complete() {
            info!(full, messages = messages.len(), "Config synced");
            self.last_sent = Some(current.clone());
        }
        outcome
    }
}
