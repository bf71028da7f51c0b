//! Connection machine driver.
//!
//! A single tokio task owns the `Machine`, the active transport session and
//! every background task. Callers talk to it through a cloneable
//! `MachineHandle`; background work reports back over an internal channel,
//! tagged with the connect attempt that spawned it.
//!
//! Tasks are scoped two ways:
//! - state tasks (timers, identity resolution) are aborted on every state change
//! - session tasks (negotiation, watchdog) are aborted when the session is torn down

use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tambourine_core::config::ConnectionConfig;
use tambourine_core::events::EventRelay;
use tambourine_core::types::{ClientIdentity, ConfigSnapshot, ConnectionState};

use crate::config_sync::ConfigSync;
use crate::error::{MachineError, TransportError};
use crate::identity::IdentityService;
use crate::messenger::SafeMessenger;
use crate::protocol::ClientMessage;
use crate::recording::{AudioBridge, RecordingOrchestrator, TranscriptSink};
use crate::state::{Effect, Machine, MachineEvent, Timing};
use crate::transport::{
    SessionParams, TransportEvent, TransportEventSink, TransportFactory, TransportSession,
};

/// Collaborators the machine drives.
pub struct MachineDeps {
    pub identity: Arc<dyn IdentityService>,
    pub transports: Arc<dyn TransportFactory>,
    pub audio: Arc<dyn AudioBridge>,
    pub transcripts: Arc<dyn TranscriptSink>,
    pub relay: EventRelay,
    pub config: ConnectionConfig,
}

/// Read-only view of the machine, published after every processed event.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSnapshot {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub generation: u64,
    pub identity: Option<ClientIdentity>,
    pub server_url: Option<String>,
}

impl From<&Machine> for MachineSnapshot {
    fn from(machine: &Machine) -> Self {
        let ctx = machine.context();
        Self {
            state: machine.state(),
            retry_count: ctx.retry_count,
            last_error: ctx.last_error.clone(),
            generation: ctx.generation,
            identity: ctx.identity.clone(),
            server_url: ctx.server_url.clone(),
        }
    }
}

enum Command {
    Event(MachineEvent),
    Shutdown(oneshot::Sender<()>),
}

pub struct ConnectionMachine;

impl ConnectionMachine {
    /// Start the driver task. Must be called from within a tokio runtime.
    pub fn spawn(deps: MachineDeps) -> MachineHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let machine = Machine::new(Timing::from(&deps.config));
        let (snapshot_tx, snapshot_rx) = watch::channel(MachineSnapshot::from(&machine));

        let failures = event_tx.clone();
        let messenger = SafeMessenger::new(move |failure| {
            let _ = failures.send(MachineEvent::SendFailed {
                generation: failure.generation,
                reason: failure.reason,
            });
        });

        // One consumer keeps deliveries in arrival order. Chunks already
        // queued behind a slow delivery are merged into the next one.
        let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<String>();
        let sink = Arc::clone(&deps.transcripts);
        tokio::spawn(async move {
            while let Some(mut text) = delivery_rx.recv().await {
                while let Ok(more) = delivery_rx.try_recv() {
                    text.push_str(&more);
                }
                sink.deliver(text).await;
            }
        });

        let driver = Driver {
            machine,
            health_interval: deps.config.health_check_interval(),
            recording: RecordingOrchestrator::new(Arc::clone(&deps.audio)),
            deps,
            events: event_tx,
            session: None,
            state_tasks: Vec::new(),
            session_tasks: Vec::new(),
            config_sync: ConfigSync::new(),
            messenger,
            transcript: String::new(),
            deliveries: delivery_tx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(driver.run(command_rx, event_rx));

        MachineHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }
}

/// Cloneable handle to a running connection machine.
#[derive(Clone)]
pub struct MachineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<MachineSnapshot>,
}

impl MachineHandle {
    fn send(&self, event: MachineEvent) -> Result<(), MachineError> {
        self.commands
            .send(Command::Event(event))
            .map_err(|_| MachineError::Stopped)
    }

    /// Start connecting to `server_url`. Ignored unless disconnected.
    pub fn connect(&self, server_url: impl Into<String>) -> Result<(), MachineError> {
        let server_url = server_url.into();
        if server_url.trim().is_empty() {
            return Err(MachineError::NoServerUrl);
        }
        self.send(MachineEvent::Connect { server_url })
    }

    pub fn disconnect(&self) -> Result<(), MachineError> {
        self.send(MachineEvent::Disconnect)
    }

    /// Tear down and reconnect immediately, skipping any backoff.
    pub fn reconnect(&self) -> Result<(), MachineError> {
        self.send(MachineEvent::Reconnect)
    }

    pub fn start_recording(&self) -> Result<(), MachineError> {
        self.send(MachineEvent::StartRecording)
    }

    pub fn stop_recording(&self) -> Result<(), MachineError> {
        self.send(MachineEvent::StopRecording)
    }

    /// Acquire the microphone ahead of a hold-to-record turn.
    pub fn prepare_recording(&self) -> Result<(), MachineError> {
        self.send(MachineEvent::PrepareRecording)
    }

    /// Record the latest synced settings; pushed to the backend when connected.
    pub fn update_config(&self, snapshot: ConfigSnapshot) -> Result<(), MachineError> {
        self.send(MachineEvent::ConfigChanged(snapshot))
    }

    /// Point the machine at a different backend.
    pub fn change_server(&self, server_url: impl Into<String>) -> Result<(), MachineError> {
        let server_url = server_url.into();
        if server_url.trim().is_empty() {
            return Err(MachineError::NoServerUrl);
        }
        self.send(MachineEvent::ServerChanged { server_url })
    }

    pub fn request_providers(&self) -> Result<(), MachineError> {
        self.send(MachineEvent::RequestProviders)
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<MachineSnapshot> {
        self.snapshot.clone()
    }

    /// Close the session, release capture and stop the driver task.
    pub async fn shutdown(&self) -> Result<(), MachineError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(done_tx))
            .map_err(|_| MachineError::Stopped)?;
        done_rx.await.map_err(|_| MachineError::Stopped)
    }
}

struct Driver {
    machine: Machine,
    deps: MachineDeps,
    health_interval: Duration,
    events: mpsc::UnboundedSender<MachineEvent>,
    session: Option<Arc<dyn TransportSession>>,
    state_tasks: Vec<JoinHandle<()>>,
    session_tasks: Vec<JoinHandle<()>>,
    recording: RecordingOrchestrator,
    config_sync: ConfigSync,
    messenger: SafeMessenger,
    transcript: String,
    deliveries: mpsc::UnboundedSender<String>,
    snapshot: watch::Sender<MachineSnapshot>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<MachineEvent>,
    ) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Event(event)) => event,
                    Some(Command::Shutdown(done)) => {
                        self.stop().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.stop().await;
                        return;
                    }
                },
                Some(event) = events.recv() => event,
            };
            self.dispatch(event).await;
        }
    }

    async fn dispatch(&mut self, event: MachineEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
            self.publish();
        }
    }

    fn publish(&self) {
        let next = MachineSnapshot::from(&self.machine);
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    async fn execute(&mut self, effect: Effect) -> Option<MachineEvent> {
        match effect {
            Effect::Broadcast(event) => {
                self.deps.relay.emit(event);
            }
            Effect::CancelStateTasks => {
                for task in self.state_tasks.drain(..) {
                    task.abort();
                }
            }
            Effect::TeardownSession => self.teardown().await,
            Effect::ResolveIdentity {
                generation,
                server_url,
            } => {
                let identity = Arc::clone(&self.deps.identity);
                let events = self.events.clone();
                self.spawn_state_task(async move {
                    let event = match identity.ensure_identity(&server_url).await {
                        Ok(identity) => MachineEvent::IdentityResolved {
                            generation,
                            identity,
                        },
                        Err(e) => MachineEvent::InitFailed {
                            generation,
                            error: e.to_string(),
                        },
                    };
                    let _ = events.send(event);
                });
            }
            Effect::CreateSession {
                generation,
                server_url,
                identity,
            } => return Some(self.create_session(generation, server_url, identity).await),
            Effect::ForgetIdentity => {
                if let Err(e) = self.deps.identity.clear() {
                    warn!(error = %e, "Failed to clear rejected identity");
                }
            }
            Effect::OpenTransport { generation } => {
                let Some(session) = self.session.clone() else {
                    return Some(MachineEvent::TransportDisconnected {
                        generation,
                        reason: "No active session".into(),
                    });
                };
                let events = self.events.clone();
                self.spawn_session_task(async move {
                    let event = match session.connect().await {
                        Ok(()) => return,
                        Err(TransportError::IdentityRejected) => {
                            MachineEvent::IdentityRejected { generation }
                        }
                        Err(e) => MachineEvent::TransportDisconnected {
                            generation,
                            reason: e.to_string(),
                        },
                    };
                    let _ = events.send(event);
                });
            }
            Effect::StartTimer {
                timer,
                epoch,
                after,
            } => {
                let events = self.events.clone();
                self.spawn_state_task(async move {
                    tokio::time::sleep(after).await;
                    let _ = events.send(timer.event(epoch));
                });
            }
            Effect::StartWatchdog { generation } => {
                if let Some(session) = self.session.clone() {
                    let events = self.events.clone();
                    let interval = self.health_interval;
                    self.spawn_session_task(async move {
                        loop {
                            tokio::time::sleep(interval).await;
                            if !session.is_ready() {
                                warn!(generation, "Health check: transport no longer ready");
                                let _ = events.send(MachineEvent::TransportDegraded { generation });
                                return;
                            }
                        }
                    });
                }
            }
            Effect::BeginCapture { generation } => {
                self.transcript.clear();
                let Some(session) = self.session.clone() else {
                    return Some(MachineEvent::CaptureFailed {
                        generation,
                        error: "No active session".into(),
                    });
                };
                if let Err(e) = self.recording.begin(session.as_ref(), &self.messenger).await {
                    warn!(error = %e, "Could not start capture");
                    return Some(MachineEvent::CaptureFailed {
                        generation,
                        error: e.to_string(),
                    });
                }
            }
            Effect::EndCapture => {
                self.recording.release(self.session.as_deref()).await;
            }
            Effect::PrewarmCapture => {
                if let Err(e) = self.recording.prewarm().await {
                    warn!(error = %e, "Capture pre-warm failed");
                }
            }
            Effect::NotifyStopRecording => {
                if let Some(session) = self.session.clone() {
                    self.messenger
                        .send(session.as_ref(), &ClientMessage::StopRecording {})
                        .await;
                }
            }
            Effect::SyncConfig { snapshot, full } => {
                if full {
                    self.config_sync.reset();
                }
                if let Some(session) = self.session.clone() {
                    self.config_sync
                        .sync(&self.messenger, session.as_ref(), &snapshot)
                        .await;
                }
            }
            Effect::RequestProviders => {
                if let Some(session) = self.session.clone() {
                    self.messenger
                        .send(session.as_ref(), &ClientMessage::GetAvailableProviders {})
                        .await;
                }
            }
            Effect::AppendTranscript(text) => self.transcript.push_str(&text),
            Effect::DeliverTranscript => {
                // Streamed chunks keep their spacing, so only blank text is dropped.
                let text = mem::take(&mut self.transcript);
                if text.trim().is_empty() {
                    debug!("Turn finished without transcript text");
                } else if self.deliveries.send(text).is_err() {
                    warn!("Transcript delivery task has stopped");
                }
            }
            Effect::DiscardTranscript => {
                if !self.transcript.is_empty() {
                    debug!(len = self.transcript.len(), "Discarding text of an empty turn");
                }
                self.transcript.clear();
            }
        }
        None
    }

    /// Create the session for `generation`, closing any previous one first.
    async fn create_session(
        &mut self,
        generation: u64,
        server_url: String,
        identity: ClientIdentity,
    ) -> MachineEvent {
        if self.session.is_some() {
            self.teardown().await;
        }

        let events = self.events.clone();
        let sink = TransportEventSink::new(move |event| {
            let event = match event {
                TransportEvent::Ready => MachineEvent::TransportReady { generation },
                TransportEvent::Disconnected { reason } => {
                    MachineEvent::TransportDisconnected { generation, reason }
                }
                TransportEvent::Degraded => MachineEvent::TransportDegraded { generation },
                TransportEvent::BotText(text) => MachineEvent::BotText { generation, text },
                TransportEvent::Message(message) => MachineEvent::Inbound {
                    generation,
                    message,
                },
            };
            let _ = events.send(event);
        });

        let params = SessionParams {
            server_url,
            identity,
            generation,
        };
        match self.deps.transports.create(params, sink).await {
            Ok(session) => {
                info!(generation, "Transport session created");
                self.session = Some(session);
                self.config_sync.reset();
                MachineEvent::SessionCreated { generation }
            }
            Err(TransportError::IdentityRejected) => MachineEvent::IdentityRejected { generation },
            Err(e) => MachineEvent::InitFailed {
                generation,
                error: e.to_string(),
            },
        }
    }

    async fn teardown(&mut self) {
        for task in self.session_tasks.drain(..) {
            task.abort();
        }
        let session = self.session.take();
        self.recording.release(session.as_deref()).await;
        if let Some(session) = session {
            session.close().await;
            info!(generation = session.generation(), "Transport session closed");
        }
        self.config_sync.reset();
    }

    async fn stop(&mut self) {
        for task in self.state_tasks.drain(..) {
            task.abort();
        }
        self.teardown().await;
        debug!("Connection machine stopped");
    }

    fn spawn_state_task(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        self.state_tasks.retain(|t| !t.is_finished());
        self.state_tasks.push(tokio::spawn(task));
    }

    fn spawn_session_task(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        self.session_tasks.retain(|t| !t.is_finished());
        self.session_tasks.push(tokio::spawn(task));
    }
}
