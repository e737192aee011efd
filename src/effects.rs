//! Session loop and effect execution
//!
//! The session loop is the single writer for one connection: it consumes one
//! ordered input channel (caller commands, socket signals, timer ticks),
//! feeds lifecycle events through [`reduce`] and executes the resulting
//! effects. Data-plane work (writing frames, routing inbound frames to the
//! accumulator) happens here too, one input at a time, so a two-frame send
//! can never interleave with anything else.
//!
//! Socket reading, keepalive and the reconnect backoff run as separate tokio
//! tasks that only post inputs back to the loop. Every socket or keepalive
//! input carries the connection id it belongs to; inputs from a superseded
//! attempt are dropped.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connection::{SessionError, SessionStatus};
use crate::diagnostics::Diagnostics;
use crate::settings::SessionSettings;
use crate::state_machine::{reduce, ConnectionState, Effect, Event, Machine, Notice};
use crate::streaming::{
    ClientMessage, Connector, FrameSink, Message, MessageAccumulator, Routed, ServerMessage,
    Socket, SocketSignal,
};

/// Upper bound on a graceful close handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Requests from the [`ConnectionManager`](crate::ConnectionManager) handle
pub(crate) enum Command {
    Connect,
    Send {
        message: ClientMessage,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Everything the session loop reacts to
pub(crate) enum Input {
    Command(Command),
    /// Lifecycle event for the reducer
    Event(Event),
    /// The socket for `id` is open; its reader keeps running in the socket task
    Opened { id: Uuid, sink: Box<dyn FrameSink> },
    /// Inbound text frame on socket `id`
    Frame { id: Uuid, text: String },
    KeepaliveTick { id: Uuid },
}

/// Channels the loop publishes through
pub(crate) struct Outputs {
    pub status: watch::Sender<SessionStatus>,
    pub transcript: watch::Sender<Vec<Message>>,
    pub notices: mpsc::UnboundedSender<Notice>,
    pub diagnostics: Arc<Mutex<Diagnostics>>,
}

pub(crate) struct SessionLoop {
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    machine: Machine,
    accumulator: MessageAccumulator,
    outputs: Outputs,

    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs_rx: mpsc::UnboundedReceiver<Input>,

    sink: Option<Box<dyn FrameSink>>,
    /// Credential the current attempt connected with; repeated in the auth frame
    credential: Option<String>,
    /// Opens the socket, then reads it until close
    socket_task: Option<JoinHandle<()>>,
    keepalive: CancellationToken,
    reconnect: CancellationToken,
    /// Pings sent since the last pong
    outstanding_pings: u32,
}

impl SessionLoop {
    pub(crate) fn new(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        accumulator: MessageAccumulator,
        outputs: Outputs,
        inputs_tx: mpsc::UnboundedSender<Input>,
        inputs_rx: mpsc::UnboundedReceiver<Input>,
    ) -> Self {
        let machine = Machine::new(settings.reconnect);
        Self {
            settings,
            connector,
            machine,
            accumulator,
            outputs,
            inputs_tx,
            inputs_rx,
            sink: None,
            credential: None,
            socket_task: None,
            keepalive: CancellationToken::new(),
            reconnect: CancellationToken::new(),
            outstanding_pings: 0,
        }
    }

    /// Run until shutdown
    pub(crate) async fn run(mut self) {
        log::info!("Session loop started");
        self.publish_status();

        while let Some(input) = self.inputs_rx.recv().await {
            if let Input::Command(Command::Shutdown) = input {
                log::info!("Shutdown requested, closing session");
                self.dispatch(Event::UserClose).await;
                break;
            }
            self.handle(input).await;
        }

        self.teardown();
        log::info!("Session loop ended");
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Command(Command::Connect) => self.dispatch(Event::Connect).await,
            Input::Command(Command::Send { message, reply }) => {
                let result = self.send_message(message).await;
                let _ = reply.send(result);
            }
            Input::Command(Command::Close { reply }) => {
                self.dispatch(Event::UserClose).await;
                let _ = reply.send(());
            }
            Input::Command(Command::Shutdown) => {}

            Input::Opened { id, sink } => {
                if !self.is_current(id) {
                    log::debug!("Dropping socket from superseded attempt {}", id);
                    return;
                }
                self.sink = Some(sink);
                self.outputs.diagnostics.lock().await.connected(id);
                self.dispatch(Event::Opened { id }).await;
            }
            Input::Frame { id, text } => {
                if self.is_current(id) && self.machine.state == ConnectionState::Open {
                    self.handle_frame(&text).await;
                }
            }
            Input::KeepaliveTick { id } => {
                if self.is_current(id) && self.machine.state == ConnectionState::Open {
                    self.keepalive_tick(id).await;
                }
            }
            Input::Event(event) => {
                if let Event::Closed { id, reason, .. } = &event {
                    if self.is_current(*id) {
                        self.outputs.diagnostics.lock().await.disconnected(reason);
                    }
                }
                self.dispatch(event).await;
            }
        }
    }

    fn is_current(&self, id: Uuid) -> bool {
        self.machine.connection_id == Some(id)
    }

    async fn dispatch(&mut self, event: Event) {
        log::debug!("Received event: {:?}", event);

        let (next, effects) = reduce(&self.machine, event);

        // Log state transitions
        if next.state != self.machine.state {
            log::info!(
                "State transition: {} -> {} (attempt {})",
                self.machine.state,
                next.state,
                next.attempt.count
            );
        }

        self.machine = next;

        for effect in effects {
            self.run_effect(effect).await;
        }
    }

    async fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::OpenSocket { id } => {
                self.outputs.diagnostics.lock().await.connect_started(id);
                self.spawn_socket_task(id);
            }

            Effect::StartKeepalive { id } => self.start_keepalive(id),

            Effect::StopKeepalive => {
                self.keepalive.cancel();
                self.outstanding_pings = 0;
            }

            Effect::SendSessionInit => {
                let message = ClientMessage::session_update(self.settings.session_config());
                if let Err(e) = self.write_frame(&message).await {
                    log::warn!("Failed to send session init: {}", e);
                }
            }

            Effect::SendAuth => {
                let Some(credential) = self.credential.clone() else {
                    log::warn!("No credential for this connection, auth frame not sent");
                    return;
                };
                let message = ClientMessage::auth(&credential);
                if let Err(e) = self.write_frame(&message).await {
                    log::warn!("Failed to send auth: {}", e);
                }
            }

            Effect::CloseSocket => {
                if let Some(mut sink) = self.sink.take() {
                    if timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                        log::warn!("Socket close timed out");
                    }
                }
                self.stop_socket_task();
            }

            Effect::DropSocket => {
                self.sink = None;
                self.stop_socket_task();
            }

            Effect::ScheduleReconnect { delay } => {
                self.outputs
                    .diagnostics
                    .lock()
                    .await
                    .reconnect_scheduled(self.machine.attempt.count, delay.as_millis() as u64);
                self.schedule_reconnect(delay);
            }

            Effect::CancelReconnect => self.reconnect.cancel(),

            Effect::Notify(notice) => self.notify(notice),

            Effect::RecordError { kind, message } => {
                self.outputs
                    .diagnostics
                    .lock()
                    .await
                    .record_error(kind, message, None);
            }

            Effect::EmitStatus => self.publish_status(),
        }
    }

    // -----------------
    // Socket
    // -----------------

    fn spawn_socket_task(&mut self, id: Uuid) {
        self.stop_socket_task();

        let tx = self.inputs_tx.clone();
        let url = match self.settings.endpoint() {
            Ok(endpoint) => {
                self.credential = Some(endpoint.credential);
                endpoint.url
            }
            Err(e) => {
                self.credential = None;
                let _ = tx.send(Input::Event(Event::OpenFailed {
                    id,
                    err: e.to_string(),
                }));
                return;
            }
        };
        let connector = self.connector.clone();

        self.socket_task = Some(tokio::spawn(async move {
            let Socket { sink, mut stream } = match connector.open(&url).await {
                Ok(socket) => socket,
                Err(e) => {
                    let _ = tx.send(Input::Event(Event::OpenFailed {
                        id,
                        err: e.to_string(),
                    }));
                    return;
                }
            };

            if tx.send(Input::Opened { id, sink }).is_err() {
                return;
            }

            while let Some(signal) = stream.next().await {
                let input = match signal {
                    SocketSignal::Text(text) => Input::Frame { id, text },
                    SocketSignal::Error(err) => Input::Event(Event::SocketError { id, err }),
                    SocketSignal::Closed { was_clean, reason } => {
                        let _ = tx.send(Input::Event(Event::Closed {
                            id,
                            was_clean,
                            reason,
                        }));
                        return;
                    }
                };
                if tx.send(input).is_err() {
                    return;
                }
            }

            log::debug!("Socket stream for {} ended without close frame", id);
            let _ = tx.send(Input::Event(Event::Closed {
                id,
                was_clean: false,
                reason: "stream ended".to_string(),
            }));
        }));
    }

    fn stop_socket_task(&mut self) {
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
    }

    async fn write_frame(&mut self, message: &ClientMessage) -> Result<(), SessionError> {
        let sink = self.sink.as_mut().ok_or(SessionError::NotConnected)?;
        let text =
            serde_json::to_string(message).map_err(|e| SessionError::Encode(e.to_string()))?;
        sink.send_text(text).await?;
        self.outputs
            .diagnostics
            .lock()
            .await
            .frame_sent(message.kind());
        Ok(())
    }

    /// Content frame, then `response.create` for user turns
    async fn send_message(&mut self, message: ClientMessage) -> Result<(), SessionError> {
        if self.machine.state != ConnectionState::Open {
            return Err(SessionError::NotConnected);
        }

        self.write_frame(&message).await?;

        if !message.is_user_message() {
            return Ok(());
        }

        // The turn reached the backend even if the trigger frame fails
        if let Some(text) = message.transcript_text() {
            self.accumulator.append_user_message(&text);
            self.publish_transcript();
        }

        self.write_frame(&ClientMessage::ResponseCreate).await?;
        self.outputs.diagnostics.lock().await.response_requested();
        Ok(())
    }

    async fn handle_frame(&mut self, text: &str) {
        let event = match ServerMessage::parse(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping malformed frame: {}", e);
                self.outputs
                    .diagnostics
                    .lock()
                    .await
                    .malformed_frame(&e.to_string());
                self.notify(Notice::MalformedFrame {
                    error: e.to_string(),
                });
                return;
            }
        };

        let mut diagnostics = self.outputs.diagnostics.lock().await;
        diagnostics.frame_received(event.kind());

        match &event {
            ServerMessage::Error { .. } => {
                let message = event
                    .error_message()
                    .unwrap_or_else(|| "unknown error".to_string());
                log::warn!("Server error: {}", message);
                diagnostics.server_error(&message);
                drop(diagnostics);
                self.notify(Notice::ServerError { message });
            }
            ServerMessage::Pong => {
                self.outstanding_pings = 0;
                if let Some(rtt) = diagnostics.pong_received() {
                    log::debug!("Pong after {}ms", rtt);
                }
            }
            ServerMessage::AuthAck
            | ServerMessage::SessionCreated
            | ServerMessage::SessionUpdated
            | ServerMessage::ResponseCreated => {
                log::debug!("Server acknowledged: {}", event.kind());
            }
            _ => {
                if event.transcript_delta().is_some() {
                    diagnostics.delta_received();
                }
                drop(diagnostics);
                if self.accumulator.on_event(&event) == Routed::Transcript {
                    self.publish_transcript();
                }
            }
        }
    }

    // -----------------
    // Keepalive
    // -----------------

    fn start_keepalive(&mut self, id: Uuid) {
        self.keepalive.cancel();
        self.outstanding_pings = 0;

        let period = self.settings.keepalive_interval();
        if period.is_zero() {
            log::info!("Keepalive disabled");
            return;
        }

        let token = CancellationToken::new();
        self.keepalive = token.clone();
        let tx = self.inputs_tx.clone();

        tokio::spawn(async move {
            // First tick one period after open
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(Input::KeepaliveTick { id }).is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Keepalive for {} stopped", id);
        });
    }

    async fn keepalive_tick(&mut self, id: Uuid) {
        let max_missed = self.settings.max_missed_pongs;

        if max_missed > 0 && self.outstanding_pings > 0 {
            let missed = self.outstanding_pings;
            self.outputs.diagnostics.lock().await.missed_pong(missed);
            self.notify(Notice::KeepaliveMissed { missed });

            if missed >= max_missed {
                self.dispatch(Event::KeepaliveLapsed { id, missed }).await;
                return;
            }
        }

        match self.write_frame(&ClientMessage::Ping).await {
            Ok(()) => {
                self.outstanding_pings += 1;
                self.outputs.diagnostics.lock().await.ping_sent();
            }
            Err(e) => log::warn!("Failed to send ping: {}", e),
        }
    }

    // -----------------
    // Reconnect
    // -----------------

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.reconnect.cancel();

        let token = CancellationToken::new();
        self.reconnect = token.clone();
        let tx = self.inputs_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    log::debug!("Pending reconnect cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Input::Event(Event::ReconnectDue));
                }
            }
        });
    }

    // -----------------
    // Outputs
    // -----------------

    fn notify(&self, notice: Notice) {
        log::info!("Notice: {}", notice);
        // Nobody listening is fine
        let _ = self.outputs.notices.send(notice);
    }

    fn publish_status(&self) {
        let status = SessionStatus {
            state: self.machine.state,
            attempt: self.machine.attempt,
        };
        self.outputs.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn publish_transcript(&self) {
        self.outputs
            .transcript
            .send_replace(self.accumulator.transcript().to_vec());
    }

    fn teardown(&mut self) {
        self.keepalive.cancel();
        self.reconnect.cancel();
        self.sink = None;
        self.credential = None;
        self.stop_socket_task();
    }
}
