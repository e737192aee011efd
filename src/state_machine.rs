//! Connection state machine for the realtime session
//!
//! This module implements the connection lifecycle using a single-writer
//! pattern. All state transitions go through the `reduce()` function, which
//! returns a new machine and a list of effects for the session loop to execute.

use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::reconnect::{ReconnectAttempt, ReconnectPolicy};

/// Lifecycle of the realtime connection.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
    /// Reconnect attempts exhausted; only an explicit `connect()` leaves this state
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    /// States from which `connect()` starts a fresh attempt cycle
    fn accepts_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Failed
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-visible conditions raised by the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notice {
    Connected,
    Reconnecting { attempt: u32, max: u32, delay_ms: u64 },
    ReconnectFailed { attempts: u32 },
    Disconnected { reason: String },
    ServerError { message: String },
    MalformedFrame { error: String },
    KeepaliveMissed { missed: u32 },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::Connected => write!(f, "Connected"),
            Notice::Reconnecting {
                attempt,
                max,
                delay_ms,
            } => write!(
                f,
                "Connection lost, reconnecting (attempt {}/{}) in {}ms",
                attempt, max, delay_ms
            ),
            Notice::ReconnectFailed { attempts } => {
                write!(f, "Could not reconnect after {} attempts", attempts)
            }
            Notice::Disconnected { reason } => write!(f, "Disconnected: {}", reason),
            Notice::ServerError { message } => write!(f, "Server error: {}", message),
            Notice::MalformedFrame { error } => write!(f, "Dropped malformed frame: {}", error),
            Notice::KeepaliveMissed { missed } => {
                write!(f, "No pong from server ({} missed)", missed)
            }
        }
    }
}

/// Everything the reducer decides on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Machine {
    pub state: ConnectionState,
    pub attempt: ReconnectAttempt,
    /// Id of the socket attempt currently owned; events carrying another id are stale
    pub connection_id: Option<Uuid>,
    pub policy: ReconnectPolicy,
}

impl Machine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    fn with_state(&self, state: ConnectionState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    fn is_current(&self, id: Uuid) -> bool {
        self.connection_id == Some(id)
    }
}

/// Events that can trigger state transitions.
/// Socket and timer events carry the connection id they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller requested a connection
    Connect,
    /// Caller requested close
    UserClose,
    /// The backoff timer fired
    ReconnectDue,

    // Socket events
    Opened {
        id: Uuid,
    },
    OpenFailed {
        id: Uuid,
        err: String,
    },
    Closed {
        id: Uuid,
        was_clean: bool,
        reason: String,
    },
    SocketError {
        id: Uuid,
        err: String,
    },

    /// Too many pings went unanswered
    KeepaliveLapsed {
        id: Uuid,
        missed: u32,
    },
}

/// Effects to be executed after a state transition.
/// The session loop handles these in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenSocket { id: Uuid },
    StartKeepalive { id: Uuid },
    StopKeepalive,
    SendSessionInit,
    SendAuth,
    /// Close the socket gracefully and stop reading it
    CloseSocket,
    /// The socket is already gone; release its handles
    DropSocket,
    ScheduleReconnect { delay: Duration },
    CancelReconnect,
    Notify(Notice),
    RecordError { kind: &'static str, message: String },
    /// Publish the state snapshot to observers
    EmitStatus,
}

/// Reducer function: (machine, event) -> (next_machine, effects)
///
/// Key rules:
/// - Never mutate the machine directly
/// - Ignore socket/timer events with stale connection ids
/// - Always emit EmitStatus after state changes
pub fn reduce(machine: &Machine, event: Event) -> (Machine, Vec<Effect>) {
    use ConnectionState::*;
    use Effect::*;

    match (machine.state, event) {
        // -----------------
        // connect()
        // -----------------
        (state, Event::Connect) if state.accepts_connect() => {
            let id = Uuid::new_v4();
            (
                Machine {
                    state: Connecting,
                    attempt: ReconnectAttempt::default(),
                    connection_id: Some(id),
                    policy: machine.policy,
                },
                vec![OpenSocket { id }, EmitStatus],
            )
        }
        // Connecting, Open, or a reconnect already scheduled
        (_, Event::Connect) => (machine.clone(), vec![]),

        // -----------------
        // close()
        // -----------------
        (Connecting | Open | Reconnecting, Event::UserClose) => (
            Machine {
                state: Closed,
                connection_id: None,
                ..machine.clone()
            },
            vec![
                // Cancel first so a pending timer can never reopen the socket
                CancelReconnect,
                StopKeepalive,
                CloseSocket,
                Notify(Notice::Disconnected {
                    reason: "closed by user".to_string(),
                }),
                EmitStatus,
            ],
        ),
        (_, Event::UserClose) => (machine.clone(), vec![]),

        // -----------------
        // Reconnecting
        // -----------------
        (Reconnecting, Event::ReconnectDue) => {
            let id = Uuid::new_v4();
            (
                Machine {
                    state: Connecting,
                    connection_id: Some(id),
                    ..machine.clone()
                },
                vec![OpenSocket { id }, EmitStatus],
            )
        }
        // Tick queued before close() cancelled the timer
        (_, Event::ReconnectDue) => (machine.clone(), vec![]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting, Event::Opened { id }) if machine.is_current(id) => (
            Machine {
                state: Open,
                attempt: ReconnectAttempt::default(),
                ..machine.clone()
            },
            vec![
                StartKeepalive { id },
                SendSessionInit,
                SendAuth,
                Notify(Notice::Connected),
                EmitStatus,
            ],
        ),
        (Connecting, Event::OpenFailed { id, err }) if machine.is_current(id) => {
            let mut effects = vec![RecordError {
                kind: "connect",
                message: err.clone(),
            }];
            let (next, lost) = connection_lost(machine, false);
            effects.extend(lost);
            log::warn!("Connection attempt failed: {}", err);
            (next, effects)
        }

        // -----------------
        // Connecting | Open
        // -----------------
        (
            Connecting | Open,
            Event::Closed {
                id,
                was_clean,
                reason,
            },
        ) if machine.is_current(id) => {
            if was_clean {
                log::info!("Server closed the connection cleanly: {}", reason);
                (
                    Machine {
                        state: Closed,
                        connection_id: None,
                        ..machine.clone()
                    },
                    vec![
                        StopKeepalive,
                        DropSocket,
                        Notify(Notice::Disconnected { reason }),
                        EmitStatus,
                    ],
                )
            } else {
                log::warn!("Connection closed abnormally: {}", reason);
                let mut effects = vec![RecordError {
                    kind: "close",
                    message: reason,
                }];
                let (next, lost) = connection_lost(machine, false);
                effects.extend(lost);
                (next, effects)
            }
        }
        (Open, Event::KeepaliveLapsed { id, missed }) if machine.is_current(id) => {
            log::warn!("Keepalive lapsed after {} missed pongs", missed);
            let mut effects = vec![RecordError {
                kind: "keepalive",
                message: format!("{} pings without pong", missed),
            }];
            let (next, lost) = connection_lost(machine, true);
            effects.extend(lost);
            (next, effects)
        }

        // Errors are recorded only; the close that follows drives the transition
        (_, Event::SocketError { id, err }) if machine.is_current(id) => (
            machine.clone(),
            vec![RecordError {
                kind: "socket",
                message: err,
            }],
        ),

        // -----------------
        // Stale or unhandled: no transition
        // -----------------
        (state, event) => {
            log::trace!("Ignoring {:?} in state {}", event, state);
            (machine.clone(), vec![])
        }
    }
}

/// Abnormal loss of the current socket: back off or give up
fn connection_lost(machine: &Machine, socket_still_open: bool) -> (Machine, Vec<Effect>) {
    use Effect::*;

    let mut effects = vec![
        StopKeepalive,
        if socket_still_open {
            CloseSocket
        } else {
            DropSocket
        },
    ];

    let policy = machine.policy;
    let count = machine.attempt.count;

    let next = if policy.should_retry(count) {
        let delay_ms = policy.delay_for(count);
        let attempt = machine.attempt.advance(delay_ms);
        effects.push(ScheduleReconnect {
            delay: Duration::from_millis(delay_ms),
        });
        effects.push(Notify(Notice::Reconnecting {
            attempt: attempt.count,
            max: policy.max_attempts,
            delay_ms,
        }));
        Machine {
            state: ConnectionState::Reconnecting,
            attempt,
            connection_id: None,
            policy,
        }
    } else {
        log::error!("Giving up after {} reconnect attempts", count);
        effects.push(Notify(Notice::ReconnectFailed { attempts: count }));
        Machine {
            connection_id: None,
            ..machine.with_state(ConnectionState::Failed)
        }
    };

    effects.push(EmitStatus);
    (next, effects)
}
