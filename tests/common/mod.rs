//! In-memory realtime backend for session tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

use voicelink::streaming::{Connector, FrameSink, Socket, SocketSignal};
use voicelink::{ConnectionManager, ConnectionState, Notice, SessionSettings, StreamingError};

/// Generous bound for anything a test waits on (virtual time)
pub const WAIT: Duration = Duration::from_secs(120);

/// Outcome of the next `open()` call
#[derive(Debug, Clone, Copy)]
pub enum Script {
    Accept,
    Reject,
}

/// The backend's end of one accepted socket
pub struct ServerSide {
    /// Frames written by the client
    pub outbound: mpsc::UnboundedReceiver<String>,
    /// Signals delivered to the client
    pub inbound: mpsc::UnboundedSender<SocketSignal>,
    /// Set when the client closed the socket gracefully
    pub closed: Arc<AtomicBool>,
    /// Writes the client may still make before sends start failing
    write_budget: Arc<Mutex<Option<usize>>>,
}

impl ServerSide {
    pub fn send_json(&self, value: Value) {
        self.inbound
            .send(SocketSignal::Text(value.to_string()))
            .expect("client stream dropped");
    }

    pub fn send_raw(&self, text: &str) {
        self.inbound
            .send(SocketSignal::Text(text.to_string()))
            .expect("client stream dropped");
    }

    pub fn drop_connection(&self) {
        self.inbound
            .send(SocketSignal::Closed {
                was_clean: false,
                reason: "1006 abnormal closure".to_string(),
            })
            .expect("client stream dropped");
    }

    /// Accept `writes` more client frames, then fail every send
    pub fn fail_writes_after(&self, writes: usize) {
        *self.write_budget.lock().unwrap() = Some(writes);
    }

    /// Wait until the client closes the socket gracefully
    pub async fn wait_closed(&self) {
        timeout(WAIT, async {
            while !self.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("socket was never closed");
    }

    /// Next client frame, skipping keepalive pings
    pub async fn next_frame(&mut self) -> Value {
        loop {
            let text = timeout(WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client sink dropped");
            let value: Value = serde_json::from_str(&text).expect("client sent invalid JSON");
            if value["type"] != "ping" {
                return value;
            }
        }
    }

    /// Consume the session.update and auth frames sent on open
    pub async fn expect_handshake(&mut self) {
        assert_eq!(self.next_frame().await["type"], "session.update");
        assert_eq!(self.next_frame().await["type"], "auth");
    }
}

pub struct MockConnector {
    script: Mutex<VecDeque<Script>>,
    opens: AtomicUsize,
    urls: Mutex<Vec<Url>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl MockConnector {
    /// Connector plus the stream of server ends for accepted sockets.
    /// An empty script accepts.
    pub fn new(script: &[Script]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            opens: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            servers,
        });
        (connector, rx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &Url) -> Result<Socket, StreamingError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());

        let next = self.script.lock().unwrap().pop_front().unwrap_or(Script::Accept);
        if let Script::Reject = next {
            return Err(StreamingError::ConnectionFailed("connection refused".to_string()));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SocketSignal>();
        let closed = Arc::new(AtomicBool::new(false));
        let write_budget = Arc::new(Mutex::new(None));

        let stream = futures_util::stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|signal| (signal, rx))
        })
        .boxed();

        let _ = self.servers.send(ServerSide {
            outbound: outbound_rx,
            inbound: inbound_tx,
            closed: closed.clone(),
            write_budget: write_budget.clone(),
        });

        Ok(Socket {
            sink: Box::new(ChannelSink {
                tx: outbound_tx,
                closed,
                write_budget,
            }),
            stream,
        })
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
    write_budget: Arc<Mutex<Option<usize>>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), StreamingError> {
        if let Some(left) = self.write_budget.lock().unwrap().as_mut() {
            if *left == 0 {
                return Err(StreamingError::SendFailed("connection reset".to_string()));
            }
            *left -= 1;
        }
        self.tx
            .send(text)
            .map_err(|_| StreamingError::SendFailed("server gone".to_string()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Settings that keep timers out of the way unless a test opts in
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        endpoint_url: "ws://mock.test/realtime".to_string(),
        api_key: "sk-test".to_string(),
        keepalive_interval_ms: 3_600_000,
        max_missed_pongs: 0,
        ..Default::default()
    }
}

pub async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    timeout(WAIT, servers.recv())
        .await
        .expect("timed out waiting for a socket")
        .expect("connector dropped")
}

pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut status = manager.subscribe();
    timeout(WAIT, status.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .expect("session loop ended");
}

/// Next notice that is not `Connected`
pub async fn next_notice(notices: &mut mpsc::UnboundedReceiver<Notice>) -> Notice {
    loop {
        let notice = timeout(WAIT, notices.recv())
            .await
            .expect("timed out waiting for a notice")
            .expect("notice channel closed");
        if notice != Notice::Connected {
            return notice;
        }
    }
}
