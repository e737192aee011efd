//! Session diagnostics
//!
//! Tracks connection lifecycle events, error history, frame counters and
//! latencies (connect, ping round trip, request to first delta).
//! Every recorded event is also written to the log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::Instant;
use uuid::Uuid;

/// Maximum number of events to retain in history
const MAX_EVENT_HISTORY: usize = 100;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// One entry of the structured event log
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEvent {
    pub timestamp: DateTime<Utc>,
    /// Short event name (e.g. "connect", "open", "reconnect", "close")
    pub kind: String,
    pub detail: String,
    /// Socket attempt the event belongs to, if any
    pub connection_id: Option<String>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Category of error (e.g., "connect", "socket", "keepalive", "server")
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
    pub connection_id: Option<String>,
}

/// Running latency statistic
#[derive(Debug, Clone, Copy, Default)]
struct Latency {
    last_ms: Option<u64>,
    sum_ms: u64,
    count: u64,
}

impl Latency {
    fn record(&mut self, ms: u64) {
        self.last_ms = Some(ms);
        self.sum_ms = self.sum_ms.saturating_add(ms);
        self.count += 1;
    }

    fn average(&self) -> Option<u64> {
        (self.count > 0).then(|| self.sum_ms / self.count)
    }
}

/// Summary statistics for the session so far
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSummary {
    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub reconnects_scheduled: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub server_errors: u64,
    pub missed_pongs: u64,
    pub last_connect_latency_ms: Option<u64>,
    pub avg_connect_latency_ms: Option<u64>,
    pub last_ping_rtt_ms: Option<u64>,
    pub last_first_delta_latency_ms: Option<u64>,
    pub avg_first_delta_latency_ms: Option<u64>,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Collects diagnostics for one session
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Event history (newest first)
    events: VecDeque<DiagnosticEvent>,
    /// Error history (newest first)
    errors: VecDeque<ErrorRecord>,
    summary: DiagnosticsSummary,

    connect_started: Option<(Uuid, Instant)>,
    connect_latency: Latency,
    ping_sent: Option<Instant>,
    response_requested: Option<Instant>,
    first_delta_latency: Latency,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A socket attempt started
    pub fn connect_started(&mut self, id: Uuid) {
        self.connect_started = Some((id, Instant::now()));
        self.summary.connect_attempts += 1;
        self.push_event("connect", "opening socket".to_string(), Some(id));
    }

    /// A socket attempt opened; records connect latency when it matches the pending attempt
    pub fn connected(&mut self, id: Uuid) {
        self.summary.connect_successes += 1;
        let latency = match self.connect_started.take() {
            Some((started_id, started)) if started_id == id => {
                let ms = started.elapsed().as_millis() as u64;
                self.connect_latency.record(ms);
                Some(ms)
            }
            _ => None,
        };
        self.summary.last_connect_latency_ms = self.connect_latency.last_ms;
        self.summary.avg_connect_latency_ms = self.connect_latency.average();

        let detail = match latency {
            Some(ms) => format!("socket open after {}ms", ms),
            None => "socket open".to_string(),
        };
        self.push_event("open", detail, Some(id));
    }

    pub fn reconnect_scheduled(&mut self, attempt: u32, delay_ms: u64) {
        self.summary.reconnects_scheduled += 1;
        self.push_event(
            "reconnect",
            format!("attempt {} in {}ms", attempt, delay_ms),
            None,
        );
    }

    pub fn disconnected(&mut self, reason: &str) {
        self.connect_started = None;
        self.ping_sent = None;
        self.response_requested = None;
        self.push_event("close", reason.to_string(), None);
    }

    /// An outbound frame was written
    pub fn frame_sent(&mut self, kind: &str) {
        self.summary.frames_sent += 1;
        log::trace!("Diagnostics: sent {}", kind);
    }

    /// An inbound frame was read
    pub fn frame_received(&mut self, kind: &str) {
        self.summary.frames_received += 1;
        log::trace!("Diagnostics: received {}", kind);
    }

    pub fn malformed_frame(&mut self, error: &str) {
        self.summary.malformed_frames += 1;
        self.record_error("malformed_frame", error.to_string(), None);
    }

    pub fn server_error(&mut self, message: &str) {
        self.summary.server_errors += 1;
        self.record_error("server", message.to_string(), None);
    }

    pub fn ping_sent(&mut self) {
        // Keep the oldest unanswered ping so RTT reflects the full wait
        if self.ping_sent.is_none() {
            self.ping_sent = Some(Instant::now());
        }
    }

    /// Returns the round trip of the oldest outstanding ping
    pub fn pong_received(&mut self) -> Option<u64> {
        let rtt = self
            .ping_sent
            .take()
            .map(|sent| sent.elapsed().as_millis() as u64);
        if rtt.is_some() {
            self.summary.last_ping_rtt_ms = rtt;
        }
        rtt
    }

    pub fn missed_pong(&mut self, missed: u32) {
        self.summary.missed_pongs += 1;
        self.push_event("keepalive", format!("{} pongs missed", missed), None);
    }

    /// A response was requested; the next transcript delta closes the measurement
    pub fn response_requested(&mut self) {
        self.response_requested = Some(Instant::now());
    }

    pub fn delta_received(&mut self) {
        if let Some(requested) = self.response_requested.take() {
            let ms = requested.elapsed().as_millis() as u64;
            self.first_delta_latency.record(ms);
            self.summary.last_first_delta_latency_ms = self.first_delta_latency.last_ms;
            self.summary.avg_first_delta_latency_ms = self.first_delta_latency.average();
            self.push_event("first_delta", format!("{}ms after request", ms), None);
        }
    }

    /// Record an error (not necessarily tied to a connection attempt)
    pub fn record_error(&mut self, error_type: &str, message: String, connection_id: Option<Uuid>) {
        let error = ErrorRecord {
            timestamp: Utc::now(),
            error_type: error_type.to_string(),
            message,
            connection_id: connection_id.map(|id| id.to_string()),
        };

        log::warn!(
            "Diagnostics: {} error - {}",
            error.error_type,
            error.message
        );

        // Add to front (newest first)
        self.errors.push_front(error);

        // Trim if over limit
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    /// Get summary statistics
    pub fn summary(&self) -> DiagnosticsSummary {
        DiagnosticsSummary {
            last_error: self.errors.front().cloned(),
            ..self.summary.clone()
        }
    }

    /// Get the event history (newest first)
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.iter().cloned().collect()
    }

    /// Get the error history (newest first)
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    fn push_event(&mut self, kind: &str, detail: String, connection_id: Option<Uuid>) {
        log::info!("Diagnostics: {} - {}", kind, detail);

        self.events.push_front(DiagnosticEvent {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            detail,
            connection_id: connection_id.map(|id| id.to_string()),
        });

        while self.events.len() > MAX_EVENT_HISTORY {
            self.events.pop_back();
        }
    }
}
