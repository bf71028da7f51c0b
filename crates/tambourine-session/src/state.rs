//! Connection state machine, free of I/O.
//!
//! `Machine::handle` maps `(state, event)` to a new state plus a list of
//! `Effect`s. The driver in `machine.rs` executes the effects: it starts and
//! cancels background work strictly on state entry and exit, and feeds the
//! results back in as events.
//!
//! Lifecycle:
//! - Disconnected -> Initializing (connect)
//! - Initializing -> Connecting (identity resolved, session created)
//! - Connecting -> Idle (transport ready)
//! - Idle -> Recording -> Processing -> Idle
//! - any failure -> Retrying -> Initializing (after backoff)
//!
//! Results of background work carry the `generation` of the connect attempt
//! that started them, and timers carry the `epoch` of the state that armed
//! them. Anything that does not match the current value is stale and dropped.

use std::time::Duration;

use tracing::{debug, trace};

use tambourine_core::config::ConnectionConfig;
use tambourine_core::events::RelayEvent;
use tambourine_core::types::{ClientIdentity, ConfigSnapshot, ConnectionState};

use crate::backoff::Backoff;
use crate::protocol::ServerMessage;

pub const CONNECT_TIMEOUT_ERROR: &str = "Connection timeout";
pub const DEGRADED_ERROR: &str = "Transport degraded";
pub const IDENTITY_REJECTED_ERROR: &str = "Client identity rejected";

/// Consecutive identity rejections answered by re-registering at once.
/// Further rejections go through `Retrying` and its backoff.
const IMMEDIATE_REJECTIONS: u32 = 1;

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    // User intents.
    Connect { server_url: String },
    Disconnect,
    Reconnect,
    ServerChanged { server_url: String },
    StartRecording,
    StopRecording,
    /// Hold hotkey pressed: acquire capture ahead of `StartRecording`.
    PrepareRecording,
    ConfigChanged(ConfigSnapshot),
    RequestProviders,

    // Results of background work for one connect attempt.
    IdentityResolved { generation: u64, identity: ClientIdentity },
    SessionCreated { generation: u64 },
    InitFailed { generation: u64, error: String },
    IdentityRejected { generation: u64 },
    TransportReady { generation: u64 },
    TransportDisconnected { generation: u64, reason: String },
    TransportDegraded { generation: u64 },
    SendFailed { generation: u64, reason: String },
    CaptureFailed { generation: u64, error: String },
    Inbound { generation: u64, message: ServerMessage },
    BotText { generation: u64, text: String },

    // Timers.
    ConnectTimeout { epoch: u64 },
    ResponseTimeout { epoch: u64 },
    RetryElapsed { epoch: u64 },
}

impl MachineEvent {
    fn generation(&self) -> Option<u64> {
        match self {
            MachineEvent::IdentityResolved { generation, .. }
            | MachineEvent::SessionCreated { generation }
            | MachineEvent::InitFailed { generation, .. }
            | MachineEvent::IdentityRejected { generation }
            | MachineEvent::TransportReady { generation }
            | MachineEvent::TransportDisconnected { generation, .. }
            | MachineEvent::TransportDegraded { generation }
            | MachineEvent::SendFailed { generation, .. }
            | MachineEvent::CaptureFailed { generation, .. }
            | MachineEvent::Inbound { generation, .. }
            | MachineEvent::BotText { generation, .. } => Some(*generation),
            _ => None,
        }
    }

    fn epoch(&self) -> Option<u64> {
        match self {
            MachineEvent::ConnectTimeout { epoch }
            | MachineEvent::ResponseTimeout { epoch }
            | MachineEvent::RetryElapsed { epoch } => Some(*epoch),
            _ => None,
        }
    }
}

/// State-scoped timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Connect,
    Response,
    Retry,
}

impl Timer {
    /// The event delivered when the timer fires.
    pub fn event(self, epoch: u64) -> MachineEvent {
        match self {
            Timer::Connect => MachineEvent::ConnectTimeout { epoch },
            Timer::Response => MachineEvent::ResponseTimeout { epoch },
            Timer::Retry => MachineEvent::RetryElapsed { epoch },
        }
    }
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Broadcast(RelayEvent),
    /// Abort every task and timer scoped to the state being left.
    CancelStateTasks,
    /// Stop capture, abort session tasks, close the session, forget it.
    TeardownSession,
    /// Background: verify or register an identity.
    ResolveIdentity { generation: u64, server_url: String },
    /// Inline: create the transport session for this attempt.
    CreateSession {
        generation: u64,
        server_url: String,
        identity: ClientIdentity,
    },
    ForgetIdentity,
    /// Background: negotiate the transport.
    OpenTransport { generation: u64 },
    StartTimer { timer: Timer, epoch: u64, after: Duration },
    /// Background: poll session readiness while connected.
    StartWatchdog { generation: u64 },
    /// Acquire capture, attach it, enable audio, send `start-recording`.
    BeginCapture { generation: u64 },
    /// Disable outbound audio and release the capture device.
    EndCapture,
    PrewarmCapture,
    NotifyStopRecording,
    SyncConfig { snapshot: ConfigSnapshot, full: bool },
    RequestProviders,
    AppendTranscript(String),
    DeliverTranscript,
    /// Drop the accumulated turn text without delivering it.
    DiscardTranscript,
}

/// Data owned by the machine for the lifetime of the process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionContext {
    pub server_url: Option<String>,
    pub identity: Option<ClientIdentity>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Id of the current connect attempt; bumped on every entry into `Initializing`.
    pub generation: u64,
    /// Bumped on every state entry.
    pub epoch: u64,
    /// Set while a retry cycle is in progress.
    pub reconnecting: bool,
    /// Identity rejections since the last ready transport.
    pub rejections: u32,
    pub config: ConfigSnapshot,
}

/// Timer settings the transition function needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for Timing {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for Timing {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            backoff: Backoff::from(config),
        }
    }
}

/// Outcome of a matched event: an optional state change plus actions that
/// run between the exit and entry effects.
struct Transition {
    target: Option<ConnectionState>,
    actions: Vec<Effect>,
}

impl Transition {
    fn to(target: ConnectionState) -> Self {
        Self {
            target: Some(target),
            actions: Vec::new(),
        }
    }

    fn stay(actions: Vec<Effect>) -> Self {
        Self {
            target: None,
            actions,
        }
    }

    fn with(mut self, action: Effect) -> Self {
        self.actions.push(action);
        self
    }
}

/// The connection machine's state and context.
#[derive(Debug, Clone)]
pub struct Machine {
    state: ConnectionState,
    ctx: ConnectionContext,
    timing: Timing,
}

impl Machine {
    pub fn new(timing: Timing) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            ctx: ConnectionContext::default(),
            timing,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    #[cfg(test)]
    pub(crate) fn context_mut(&mut self) -> &mut ConnectionContext {
        &mut self.ctx
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Apply one event. Returns the effects to execute, in order.
    pub fn handle(&mut self, event: MachineEvent) -> Vec<Effect> {
        if let Some(generation) = event.generation() {
            if generation != self.ctx.generation {
                trace!(generation, current = self.ctx.generation, "Dropping stale event");
                return Vec::new();
            }
        }
        if let Some(epoch) = event.epoch() {
            if epoch != self.ctx.epoch {
                trace!(epoch, current = self.ctx.epoch, "Dropping stale timer");
                return Vec::new();
            }
        }

        let Some(transition) = self.transition(event) else {
            return Vec::new();
        };

        let Some(target) = transition.target else {
            return transition.actions;
        };

        let from = self.state;
        let mut effects = exit_effects(from, target);
        effects.extend(transition.actions);

        debug!("Connection state: {} -> {}", from, target);
        self.state = target;
        self.ctx.epoch += 1;
        effects.push(Effect::Broadcast(RelayEvent::ConnectionStateChanged { state: target }));
        effects.extend(self.entry_effects(target));
        effects
    }

    /// Match an event against the current state. `None` means ignored.
    fn transition(&mut self, event: MachineEvent) -> Option<Transition> {
        use ConnectionState as S;
        use MachineEvent as E;

        let state = self.state;
        let ctx = &mut self.ctx;

        // Intents that behave the same in every state.
        match &event {
            E::ConfigChanged(snapshot) => {
                ctx.config = snapshot.clone();
                if state.is_connected() {
                    return Some(Transition::stay(vec![Effect::SyncConfig {
                        snapshot: snapshot.clone(),
                        full: false,
                    }]));
                }
                return Some(Transition::stay(Vec::new()));
            }
            E::Disconnect if state != S::Disconnected => {
                return Some(Transition::to(S::Disconnected));
            }
            E::Reconnect => {
                if ctx.server_url.is_none() {
                    return None;
                }
                ctx.retry_count = 0;
                ctx.rejections = 0;
                return Some(Transition::to(S::Initializing));
            }
            E::ServerChanged { server_url } => {
                ctx.server_url = Some(server_url.clone());
                if state == S::Disconnected {
                    return Some(Transition::stay(Vec::new()));
                }
                return Some(Transition::to(S::Initializing));
            }
            E::StopRecording if state != S::Recording => {
                // Always release capture, even outside a turn.
                return Some(Transition::stay(vec![Effect::EndCapture]));
            }
            E::BotText { text, .. } if matches!(state, S::Connecting | S::Recording) => {
                return Some(Transition::stay(vec![Effect::AppendTranscript(text.clone())]));
            }
            E::Inbound { message, .. } if state.holds_session() => {
                if let Some(response) = message.config_response() {
                    return Some(Transition::stay(vec![Effect::Broadcast(
                        RelayEvent::ConfigResponse(response),
                    )]));
                }
                if let ServerMessage::AvailableProviders { stt, llm } = message {
                    return Some(Transition::stay(vec![Effect::Broadcast(
                        RelayEvent::AvailableProviders {
                            stt: stt.clone(),
                            llm: llm.clone(),
                        },
                    )]));
                }
            }
            E::TransportDisconnected { reason, .. } if state.holds_session() => {
                ctx.last_error = Some(reason.clone());
                return Some(Transition::to(S::Retrying));
            }
            E::SendFailed { reason, .. } if state.holds_session() => {
                ctx.last_error = Some(reason.clone());
                return Some(Transition::to(S::Retrying));
            }
            E::TransportDegraded { .. } if state.is_connected() => {
                ctx.last_error = Some(DEGRADED_ERROR.to_string());
                return Some(Transition::to(S::Retrying));
            }
            _ => {}
        }

        match (state, event) {
            (S::Disconnected, E::Connect { server_url }) => {
                ctx.server_url = Some(server_url);
                ctx.rejections = 0;
                Some(Transition::to(S::Initializing))
            }

            (S::Initializing, E::IdentityResolved { generation, identity }) => {
                ctx.identity = Some(identity.clone());
                let server_url = ctx.server_url.clone()?;
                Some(Transition::stay(vec![Effect::CreateSession {
                    generation,
                    server_url,
                    identity,
                }]))
            }
            (S::Initializing, E::SessionCreated { .. }) => Some(Transition::to(S::Connecting)),
            (S::Initializing, E::InitFailed { error, .. }) => {
                ctx.last_error = Some(error);
                Some(Transition::to(S::Retrying))
            }
            (S::Initializing | S::Connecting, E::IdentityRejected { .. }) => {
                ctx.identity = None;
                ctx.rejections = ctx.rejections.saturating_add(1);
                if ctx.rejections > IMMEDIATE_REJECTIONS {
                    ctx.last_error = Some(IDENTITY_REJECTED_ERROR.to_string());
                    return Some(Transition::to(S::Retrying).with(Effect::ForgetIdentity));
                }
                Some(Transition::to(S::Initializing).with(Effect::ForgetIdentity))
            }

            (S::Connecting, E::TransportReady { generation }) => {
                ctx.retry_count = 0;
                ctx.rejections = 0;
                ctx.last_error = None;
                let mut t = Transition::to(S::Idle);
                if ctx.reconnecting {
                    ctx.reconnecting = false;
                    t = t.with(Effect::Broadcast(RelayEvent::ReconnectResult {
                        success: true,
                        error: None,
                    }));
                }
                Some(
                    t.with(Effect::StartWatchdog { generation })
                        .with(Effect::SyncConfig {
                            snapshot: ctx.config.clone(),
                            full: true,
                        })
                        .with(Effect::RequestProviders),
                )
            }
            (S::Connecting, E::ConnectTimeout { .. }) => {
                ctx.last_error = Some(CONNECT_TIMEOUT_ERROR.to_string());
                Some(Transition::to(S::Retrying))
            }

            (S::Idle, E::StartRecording) => Some(Transition::to(S::Recording)),
            (S::Idle, E::PrepareRecording) => Some(Transition::stay(vec![Effect::PrewarmCapture])),
            (S::Idle, E::RequestProviders) => Some(Transition::stay(vec![Effect::RequestProviders])),
            (S::Idle, E::BotText { text, .. }) => {
                // Rest of a streamed reply, or a reply after the response timeout.
                Some(Transition::stay(vec![
                    Effect::AppendTranscript(text),
                    Effect::DeliverTranscript,
                ]))
            }
            (
                S::Idle,
                E::Inbound {
                    message: ServerMessage::RecordingComplete { has_content },
                    ..
                },
            ) => {
                // Late reply after the response timer already resolved the turn.
                if has_content == Some(false) {
                    return Some(Transition::stay(Vec::new()));
                }
                Some(Transition::stay(vec![Effect::DeliverTranscript]))
            }

            (S::Recording, E::StopRecording) => {
                Some(Transition::to(S::Processing).with(Effect::NotifyStopRecording))
            }
            (S::Recording, E::CaptureFailed { error, .. }) => {
                ctx.last_error = Some(error);
                Some(Transition::to(S::Idle))
            }
            (S::Recording | S::Processing, E::RequestProviders) => {
                Some(Transition::stay(vec![Effect::RequestProviders]))
            }

            // The backend answers a turn with speech by its LLM text and an
            // empty turn by `recording-complete{hasContent:false}`.
            (S::Processing, E::BotText { text, .. }) => Some(
                Transition::to(S::Idle)
                    .with(Effect::AppendTranscript(text))
                    .with(Effect::DeliverTranscript),
            ),
            (
                S::Processing,
                E::Inbound {
                    message: ServerMessage::RecordingComplete { has_content },
                    ..
                },
            ) => {
                if has_content == Some(false) {
                    return Some(Transition::to(S::Idle).with(Effect::DiscardTranscript));
                }
                Some(Transition::to(S::Idle).with(Effect::DeliverTranscript))
            }
            (S::Processing, E::ResponseTimeout { .. }) => {
                Some(Transition::to(S::Idle).with(Effect::DeliverTranscript))
            }

            (S::Retrying, E::RetryElapsed { .. }) => Some(Transition::to(S::Initializing)),

            (state, event) => {
                trace!(state = %state, event = ?event, "Event ignored");
                None
            }
        }
    }

    fn entry_effects(&mut self, state: ConnectionState) -> Vec<Effect> {
        let ctx = &mut self.ctx;
        match state {
            ConnectionState::Disconnected => {
                ctx.reconnecting = false;
                Vec::new()
            }
            ConnectionState::Initializing => {
                ctx.generation += 1;
                match ctx.server_url.clone() {
                    Some(server_url) => vec![Effect::ResolveIdentity {
                        generation: ctx.generation,
                        server_url,
                    }],
                    None => Vec::new(),
                }
            }
            ConnectionState::Connecting => vec![
                Effect::OpenTransport {
                    generation: ctx.generation,
                },
                Effect::StartTimer {
                    timer: Timer::Connect,
                    epoch: ctx.epoch,
                    after: self.timing.connect_timeout,
                },
            ],
            ConnectionState::Idle => Vec::new(),
            ConnectionState::Recording => vec![Effect::BeginCapture {
                generation: ctx.generation,
            }],
            ConnectionState::Processing => vec![Effect::StartTimer {
                timer: Timer::Response,
                epoch: ctx.epoch,
                after: self.timing.response_timeout,
            }],
            ConnectionState::Retrying => {
                let delay = self.timing.backoff.delay(ctx.retry_count);
                ctx.retry_count = ctx.retry_count.saturating_add(1);
                let mut effects = Vec::new();
                if ctx.reconnecting {
                    effects.push(Effect::Broadcast(RelayEvent::ReconnectResult {
                        success: false,
                        error: ctx.last_error.clone(),
                    }));
                }
                ctx.reconnecting = true;
                effects.push(Effect::Broadcast(RelayEvent::ReconnectStarted {}));
                effects.push(Effect::StartTimer {
                    timer: Timer::Retry,
                    epoch: ctx.epoch,
                    after: delay,
                });
                effects
            }
        }
    }
}

/// Effects of leaving `from` for `to`.
fn exit_effects(from: ConnectionState, to: ConnectionState) -> Vec<Effect> {
    let mut effects = vec![Effect::CancelStateTasks];
    if from == ConnectionState::Recording {
        effects.push(Effect::EndCapture);
    }
    if from.holds_session() && !to.holds_session() {
        effects.push(Effect::TeardownSession);
    }
    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState as S;
    use MachineEvent as E;

    const URL: &str = "http://127.0.0.1:8765";

    fn machine() -> Machine {
        Machine::new(Timing::default())
    }

    fn id() -> ClientIdentity {
        ClientIdentity("client-1".into())
    }

    /// Drive a fresh machine to `Idle`.
    fn idle_machine() -> Machine {
        let mut m = machine();
        m.handle(E::Connect {
            server_url: URL.into(),
        });
        let g = m.context().generation;
        m.handle(E::IdentityResolved {
            generation: g,
            identity: id(),
        });
        m.handle(E::SessionCreated { generation: g });
        m.handle(E::TransportReady { generation: g });
        assert_eq!(m.state(), S::Idle);
        m
    }

    fn has(effects: &[Effect], pred: impl Fn(&Effect) -> bool) -> bool {
        effects.iter().any(pred)
    }

    fn timer_epoch(effects: &[Effect], kind: Timer) -> Option<(u64, Duration)> {
        effects.iter().find_map(|e| match e {
            Effect::StartTimer {
                timer,
                epoch,
                after,
            } if *timer == kind => Some((*epoch, *after)),
            _ => None,
        })
    }

    // =========================================================================
    // Happy path
    // =========================================================================

    #[test]
    fn test_connect_records_url_and_resolves_identity() {
        let mut m = machine();
        let effects = m.handle(E::Connect {
            server_url: URL.into(),
        });

        assert_eq!(m.state(), S::Initializing);
        assert_eq!(m.context().server_url.as_deref(), Some(URL));
        assert_eq!(m.context().generation, 1);
        assert!(effects.contains(&Effect::ResolveIdentity {
            generation: 1,
            server_url: URL.into()
        }));
        assert!(effects.contains(&Effect::Broadcast(RelayEvent::ConnectionStateChanged {
            state: S::Initializing
        })));
    }

    #[test]
    fn test_identity_then_session_then_connecting() {
        let mut m = machine();
        m.handle(E::Connect {
            server_url: URL.into(),
        });
        let effects = m.handle(E::IdentityResolved {
            generation: 1,
            identity: id(),
        });
        assert_eq!(m.state(), S::Initializing);
        assert_eq!(
            effects,
            vec![Effect::CreateSession {
                generation: 1,
                server_url: URL.into(),
                identity: id()
            }]
        );

        let effects = m.handle(E::SessionCreated { generation: 1 });
        assert_eq!(m.state(), S::Connecting);
        assert!(effects.contains(&Effect::OpenTransport { generation: 1 }));
        let (_, after) = timer_epoch(&effects, Timer::Connect).unwrap();
        assert_eq!(after, Duration::from_secs(30));
        // Initializing -> Connecting keeps nothing to tear down.
        assert!(!effects.contains(&Effect::TeardownSession));
    }

    #[test]
    fn test_ready_resets_retries_and_syncs() {
        let mut m = machine();
        m.handle(E::Connect {
            server_url: URL.into(),
        });
        m.context_mut().retry_count = 3;
        m.context_mut().last_error = Some("old".into());
        m.handle(E::IdentityResolved {
            generation: 1,
            identity: id(),
        });
        m.handle(E::SessionCreated { generation: 1 });
        let effects = m.handle(E::TransportReady { generation: 1 });

        assert_eq!(m.state(), S::Idle);
        assert_eq!(m.context().retry_count, 0);
        assert_eq!(m.context().last_error, None);
        assert!(has(&effects, |e| matches!(e, Effect::SyncConfig { full: true, .. })));
        assert!(effects.contains(&Effect::StartWatchdog { generation: 1 }));
        assert!(effects.contains(&Effect::RequestProviders));
        assert!(!effects.contains(&Effect::TeardownSession));
    }

    #[test]
    fn test_connect_ignored_outside_disconnected() {
        let mut m = idle_machine();
        assert!(m
            .handle(E::Connect {
                server_url: "http://elsewhere".into()
            })
            .is_empty());
        assert_eq!(m.state(), S::Idle);
        assert_eq!(m.context().server_url.as_deref(), Some(URL));
    }

    // =========================================================================
    // Recording
    // =========================================================================

    #[test]
    fn test_recording_round_trip() {
        let mut m = idle_machine();
        let g = m.context().generation;

        let effects = m.handle(E::StartRecording);
        assert_eq!(m.state(), S::Recording);
        assert!(effects.contains(&Effect::BeginCapture { generation: g }));

        let effects = m.handle(E::StopRecording);
        assert_eq!(m.state(), S::Processing);
        let end = effects.iter().position(|e| *e == Effect::EndCapture).unwrap();
        let notify = effects
            .iter()
            .position(|e| *e == Effect::NotifyStopRecording)
            .unwrap();
        assert!(end < notify, "capture must be released before notifying");
        let (_, after) = timer_epoch(&effects, Timer::Response).unwrap();
        assert_eq!(after, Duration::from_secs(10));

        let effects = m.handle(E::BotText {
            generation: g,
            text: "Hello world.".into(),
        });
        assert_eq!(m.state(), S::Idle);
        let append = effects
            .iter()
            .position(|e| *e == Effect::AppendTranscript("Hello world.".into()))
            .unwrap();
        let deliver = effects
            .iter()
            .position(|e| *e == Effect::DeliverTranscript)
            .unwrap();
        assert!(effects[0] == Effect::CancelStateTasks && append < deliver);
    }

    #[test]
    fn test_bot_text_while_recording_is_buffered() {
        let mut m = idle_machine();
        let g = m.context().generation;
        m.handle(E::StartRecording);

        let effects = m.handle(E::BotText {
            generation: g,
            text: "partial".into(),
        });

        assert_eq!(m.state(), S::Recording);
        assert_eq!(effects, vec![Effect::AppendTranscript("partial".into())]);
    }

    #[test]
    fn test_empty_turn_discards_buffer() {
        let mut m = idle_machine();
        let g = m.context().generation;
        m.handle(E::StartRecording);
        m.handle(E::StopRecording);

        let effects = m.handle(E::Inbound {
            generation: g,
            message: ServerMessage::RecordingComplete {
                has_content: Some(false),
            },
        });

        assert_eq!(m.state(), S::Idle);
        assert!(effects.contains(&Effect::DiscardTranscript));
        assert!(!effects.contains(&Effect::DeliverTranscript));
    }

    #[test]
    fn test_recording_complete_with_content_delivers() {
        let mut m = idle_machine();
        let g = m.context().generation;
        m.handle(E::StartRecording);
        m.handle(E::StopRecording);

        let effects = m.handle(E::Inbound {
            generation: g,
            message: ServerMessage::RecordingComplete { has_content: None },
        });

        assert_eq!(m.state(), S::Idle);
        assert!(effects.contains(&Effect::DeliverTranscript));
    }

    #[test]
    fn test_late_bot_text_in_idle_is_delivered() {
        let mut m = idle_machine();
        let g = m.context().generation;
        m.handle(E::StartRecording);
        let effects = m.handle(E::StopRecording);
        let (epoch, _) = timer_epoch(&effects, Timer::Response).unwrap();
        m.handle(E::ResponseTimeout { epoch });
        assert_eq!(m.state(), S::Idle);

        let effects = m.handle(E::BotText {
            generation: g,
            text: "Slow reply.".into(),
        });

        assert_eq!(m.state(), S::Idle);
        assert_eq!(
            effects,
            vec![
                Effect::AppendTranscript("Slow reply.".into()),
                Effect::DeliverTranscript
            ]
        );
    }

    #[test]
    fn test_stop_outside_recording_only_releases() {
        let mut m = idle_machine();
        assert_eq!(m.handle(E::StopRecording), vec![Effect::EndCapture]);
        assert_eq!(m.state(), S::Idle);

        let mut m = machine();
        assert_eq!(m.handle(E::StopRecording), vec![Effect::EndCapture]);
    }

    #[test]
    fn test_response_timeout_resolves_to_idle() {
        let mut m = idle_machine();
        m.handle(E::StartRecording);
        let effects = m.handle(E::StopRecording);
        let (epoch, _) = timer_epoch(&effects, Timer::Response).unwrap();

        let effects = m.handle(E::ResponseTimeout { epoch });
        assert_eq!(m.state(), S::Idle);
        assert!(effects.contains(&Effect::DeliverTranscript));
    }

    #[test]
    fn test_stale_response_timer_ignored_in_next_turn() {
        let mut m = idle_machine();
        m.handle(E::StartRecording);
        let effects = m.handle(E::StopRecording);
        let (old_epoch, _) = timer_epoch(&effects, Timer::Response).unwrap();
        let g = m.context().generation;
        m.handle(E::Inbound {
            generation: g,
            message: ServerMessage::RecordingComplete { has_content: None },
        });

        m.handle(E::StartRecording);
        m.handle(E::StopRecording);
        assert_eq!(m.state(), S::Processing);
        assert!(m.handle(E::ResponseTimeout { epoch: old_epoch }).is_empty());
        assert_eq!(m.state(), S::Processing);
    }

    #[test]
    fn test_capture_failure_returns_to_idle() {
        let mut m = idle_machine();
        let g = m.context().generation;
        m.handle(E::StartRecording);
        let effects = m.handle(E::CaptureFailed {
            generation: g,
            error: "No capture device available".into(),
        });
        assert_eq!(m.state(), S::Idle);
        assert!(effects.contains(&Effect::EndCapture));
        assert!(!effects.contains(&Effect::TeardownSession));
    }

    #[test]
    fn test_prepare_recording_only_in_idle() {
        let mut m = idle_machine();
        assert_eq!(m.handle(E::PrepareRecording), vec![Effect::PrewarmCapture]);
        m.handle(E::StartRecording);
        assert!(m.handle(E::PrepareRecording).is_empty());
    }

    // =========================================================================
    // Failures and retries
    // =========================================================================

    #[test]
    fn test_connect_timeout_sets_error_and_retries() {
        let mut m = machine();
        m.handle(E::Connect {
            server_url: URL.into(),
        });
        m.handle(E::IdentityResolved {
            generation: 1,
            identity: id(),
        });
        let effects = m.handle(E::SessionCreated { generation: 1 });
        let (epoch, _) = timer_epoch(&effects, Timer::Connect).unwrap();

        let effects = m.handle(E::ConnectTimeout { epoch });
        assert_eq!(m.state(), S::Retrying);
        assert_eq!(m.context().last_error.as_deref(), Some("Connection timeout"));
        assert!(effects.contains(&Effect::TeardownSession));
        assert!(effects.contains(&Effect::Broadcast(RelayEvent::ReconnectStarted {})));
    }

    #[test]
    fn test_retry_delay_uses_count_before_increment() {
        let mut m = idle_machine();
        let g = m.context().generation;
        let effects = m.handle(E::TransportDisconnected {
            generation: g,
            reason: "peer closed".into(),
        });
        let (_, after) = timer_epoch(&effects, Timer::Retry).unwrap();
        assert_eq!(after, Duration::from_millis(1000));
        assert_eq!(m.context().retry_count, 1);

        // Next cycle fails during initialization.
        let (epoch, _) = timer_epoch(&effects, Timer::Retry).unwrap();
        m.handle(E::RetryElapsed { epoch });
        let g = m.context().generation;
        let effects = m.handle(E::InitFailed {
            generation: g,
            error: "registration failed".into(),
        });
        let (_, after) = timer_epoch(&effects, Timer::Retry).unwrap();
        assert_eq!(after, Duration::from_millis(2000));
        assert_eq!(m.context().retry_count, 2);
        assert!(effects.contains(&Effect::Broadcast(RelayEvent::ReconnectResult {
            success: false,
            error: Some("registration failed".into()),
        })));
    }

    #[test]
    fn test_successful_reconnect_broadcasts_result() {
        let mut m = idle_machine();
        let g = m.context().generation;
        let effects = m.handle(E::TransportDegraded { generation: g });
        assert_eq!(m.state(), S::Retrying);
        assert_eq!(m.context().last_error.as_deref(), Some(DEGRADED_ERROR));
        let (epoch, _) = timer_epoch(&effects, Timer::Retry).unwrap();

        m.handle(E::RetryElapsed { epoch });
        let g = m.context().generation;
        m.handle(E::IdentityResolved {
            generation: g,
            identity: id(),
        });
        m.handle(E::SessionCreated { generation: g });
        let effects = m.handle(E::TransportReady { generation: g });
        assert!(effects.contains(&Effect::Broadcast(RelayEvent::ReconnectResult {
            success: true,
            error: None
        })));
        assert!(!m.context().reconnecting);
    }

    #[test]
    fn test_manual_reconnect_short_circuits_backoff() {
        let mut m = machine();
        m.context_mut().server_url = Some(URL.into());
        m.context_mut().retry_count = 4;
        m.force_state(S::Retrying);
        let before = m.context().generation;

        let effects = m.handle(E::Reconnect);

        assert_eq!(m.state(), S::Initializing);
        assert_eq!(m.context().retry_count, 0);
        assert_eq!(m.context().generation, before + 1);
        assert!(effects.contains(&Effect::CancelStateTasks));
        assert!(has(&effects, |e| matches!(e, Effect::ResolveIdentity { .. })));
    }

    #[test]
    fn test_reconnect_from_idle_tears_down() {
        let mut m = idle_machine();
        let effects = m.handle(E::Reconnect);
        assert_eq!(m.state(), S::Initializing);
        assert!(effects.contains(&Effect::TeardownSession));
    }

    #[test]
    fn test_identity_rejection_clears_and_reinitializes() {
        let mut m = machine();
        m.handle(E::Connect {
            server_url: URL.into(),
        });
        m.handle(E::IdentityResolved {
            generation: 1,
            identity: id(),
        });
        m.handle(E::SessionCreated { generation: 1 });

        let effects = m.handle(E::IdentityRejected { generation: 1 });
        assert_eq!(m.state(), S::Initializing);
        assert_eq!(m.context().identity, None);
        let forget = effects.iter().position(|e| *e == Effect::ForgetIdentity).unwrap();
        let resolve = effects
            .iter()
            .position(|e| matches!(e, Effect::ResolveIdentity { .. }))
            .unwrap();
        let teardown = effects
            .iter()
            .position(|e| *e == Effect::TeardownSession)
            .unwrap();
        assert!(teardown < forget && forget < resolve);
    }

    #[test]
    fn test_repeated_identity_rejection_backs_off() {
        let mut m = machine();
        m.handle(E::Connect {
            server_url: URL.into(),
        });
        m.handle(E::IdentityRejected { generation: 1 });
        assert_eq!(m.state(), S::Initializing);
        assert_eq!(m.context().retry_count, 0);

        let effects = m.handle(E::IdentityRejected { generation: 2 });

        assert_eq!(m.state(), S::Retrying);
        assert_eq!(m.context().retry_count, 1);
        assert_eq!(
            m.context().last_error.as_deref(),
            Some(IDENTITY_REJECTED_ERROR)
        );
        assert!(effects.contains(&Effect::ForgetIdentity));
        let (_, after) = timer_epoch(&effects, Timer::Retry).unwrap();
        assert_eq!(after, Duration::from_secs(1));
    }

    #[test]
    fn test_ready_transport_resets_rejection_count() {
        let mut m = machine();
        m.handle(E::Connect {
            server_url: URL.into(),
        });
        m.handle(E::IdentityRejected { generation: 1 });
        m.handle(E::IdentityResolved {
            generation: 2,
            identity: id(),
        });
        m.handle(E::SessionCreated { generation: 2 });
        m.handle(E::TransportReady { generation: 2 });
        assert_eq!(m.context().rejections, 0);

        m.handle(E::Reconnect);
        m.handle(E::IdentityRejected { generation: 3 });
        assert_eq!(m.state(), S::Initializing);
    }

    #[test]
    fn test_send_failure_retries() {
        let mut m = idle_machine();
        let g = m.context().generation;
        m.handle(E::SendFailed {
            generation: g,
            reason: "Transport not ready".into(),
        });
        assert_eq!(m.state(), S::Retrying);
    }

    #[test]
    fn test_degraded_during_negotiation_waits_for_timer() {
        let mut m = machine();
        m.handle(E::Connect {
            server_url: URL.into(),
        });
        m.handle(E::IdentityResolved {
            generation: 1,
            identity: id(),
        });
        m.handle(E::SessionCreated { generation: 1 });
        assert!(m.handle(E::TransportDegraded { generation: 1 }).is_empty());
        assert_eq!(m.state(), S::Connecting);
    }

    #[test]
    fn test_disconnect_keeps_retry_count() {
        let mut m = idle_machine();
        let g = m.context().generation;
        m.handle(E::TransportDisconnected {
            generation: g,
            reason: "x".into(),
        });
        let effects = m.handle(E::Disconnect);
        assert_eq!(m.state(), S::Disconnected);
        assert_eq!(m.context().retry_count, 1);
        assert!(!m.context().reconnecting);
        assert!(effects.contains(&Effect::CancelStateTasks));
    }

    // =========================================================================
    // Staleness
    // =========================================================================

    #[test]
    fn test_stale_generation_dropped() {
        let mut m = idle_machine();
        let old = m.context().generation;
        m.handle(E::Reconnect);
        assert!(m
            .handle(E::TransportDisconnected {
                generation: old,
                reason: "late".into()
            })
            .is_empty());
        assert_eq!(m.state(), S::Initializing);
    }

    #[test]
    fn test_stale_retry_timer_dropped_after_manual_reconnect() {
        let mut m = idle_machine();
        let g = m.context().generation;
        let effects = m.handle(E::TransportDisconnected {
            generation: g,
            reason: "x".into(),
        });
        let (epoch, _) = timer_epoch(&effects, Timer::Retry).unwrap();
        m.handle(E::Reconnect);
        let gen_after = m.context().generation;
        assert!(m.handle(E::RetryElapsed { epoch }).is_empty());
        assert_eq!(m.context().generation, gen_after);
    }

    // =========================================================================
    // Config and inbound messages
    // =========================================================================

    #[test]
    fn test_config_change_syncs_only_when_connected() {
        let snapshot = ConfigSnapshot {
            stt_provider: Some("B".into()),
            ..ConfigSnapshot::default()
        };

        let mut m = machine();
        assert!(m.handle(E::ConfigChanged(snapshot.clone())).is_empty());
        assert_eq!(m.context().config, snapshot);

        let mut m = idle_machine();
        assert_eq!(
            m.handle(E::ConfigChanged(snapshot.clone())),
            vec![Effect::SyncConfig {
                snapshot,
                full: false
            }]
        );
    }

    #[test]
    fn test_server_change_reinitializes_when_active() {
        let mut m = idle_machine();
        let effects = m.handle(E::ServerChanged {
            server_url: "http://10.0.0.9:8765".into(),
        });
        assert_eq!(m.state(), S::Initializing);
        assert!(effects.contains(&Effect::TeardownSession));
        assert!(effects.contains(&Effect::ResolveIdentity {
            generation: m.context().generation,
            server_url: "http://10.0.0.9:8765".into()
        }));

        let mut m = machine();
        assert!(m
            .handle(E::ServerChanged {
                server_url: "http://10.0.0.9:8765".into()
            })
            .is_empty());
        assert_eq!(m.state(), S::Disconnected);
    }

    #[test]
    fn test_config_error_relayed_without_state_change() {
        let mut m = idle_machine();
        let g = m.context().generation;
        let effects = m.handle(E::Inbound {
            generation: g,
            message: ServerMessage::ConfigError {
                setting: "stt-provider".into(),
                error: "Unknown provider: foo".into(),
            },
        });
        assert_eq!(m.state(), S::Idle);
        assert_eq!(effects.len(), 1);
        assert!(matches!(
            &effects[0],
            Effect::Broadcast(RelayEvent::ConfigResponse(r)) if r.is_error()
        ));
    }

    #[test]
    fn test_late_empty_recording_complete_in_idle() {
        let mut m = idle_machine();
        let g = m.context().generation;
        assert!(m
            .handle(E::Inbound {
                generation: g,
                message: ServerMessage::RecordingComplete {
                    has_content: Some(false)
                },
            })
            .is_empty());
    }
}
