//! Live event stream from the backend.
//!
//! The backend speaks Socket.IO (Engine.IO v4) over a WebSocket. Only the
//! text packets the client needs are implemented: open/ping/pong, namespace
//! connect/disconnect and events. On every (re)connect the client announces
//! its role with `set_role`, then forwards decoded events to the sync core
//! through a channel. Reconnection uses a fixed delay and gives up after a
//! bounded number of consecutive failures.
//!
//! At most one connection may be open per process; `StreamSlot` closes the
//! previous connection before opening the next one.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::events::RemoteEvent;
use crate::models::Role;

// ---------------------------------------------------------------------------
// Packet codec
// ---------------------------------------------------------------------------

/// One Engine.IO text frame, with Socket.IO message packets unpacked.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `0{...}` handshake from the server.
    Open(Value),
    /// `1`
    Close,
    /// `2`
    Ping,
    /// `3`
    Pong,
    /// `6`
    Noop,
    /// `40` / `40{"sid":...}`
    Connect(Option<Value>),
    /// `41`
    Disconnect,
    /// `42["name",data]`
    Event { name: String, data: Value },
    /// `44{...}`
    ConnectError(Value),
    /// Acks, binary packets and upgrades; not used by this client.
    Unsupported(String),
}

impl Packet {
    pub fn event(name: &str, data: Value) -> Packet {
        Packet::Event {
            name: name.to_string(),
            data,
        }
    }

    pub fn decode(frame: &str) -> Result<Packet> {
        let mut chars = frame.chars();
        let engine_type = chars
            .next()
            .ok_or_else(|| SyncError::Decode("empty frame".into()))?;
        let rest = chars.as_str();

        match engine_type {
            '0' => Ok(Packet::Open(parse_json(rest)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_message(rest),
            '6' => Ok(Packet::Noop),
            _ => Ok(Packet::Unsupported(frame.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(v) => format!("0{v}"),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Connect(None) => "40".to_string(),
            Packet::Connect(Some(v)) => format!("40{v}"),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { name, data } => {
                let args = if data.is_null() {
                    Value::Array(vec![Value::String(name.clone())])
                } else {
                    Value::Array(vec![Value::String(name.clone()), data.clone()])
                };
                format!("42{args}")
            }
            Packet::ConnectError(v) => format!("44{v}"),
            Packet::Unsupported(raw) => raw.clone(),
        }
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| SyncError::Decode(format!("frame payload: {e}")))
}

fn decode_message(body: &str) -> Result<Packet> {
    let mut chars = body.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| SyncError::Decode("empty message packet".into()))?;
    let mut rest = chars.as_str();

    // Non-default namespace: "/admin,..."
    if rest.starts_with('/') {
        rest = match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        };
    }
    // Optional ack id before the payload.
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    match socket_type {
        '0' => {
            if rest.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(parse_json(rest)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let args = match parse_json(rest)? {
                Value::Array(args) => args,
                other => {
                    return Err(SyncError::Decode(format!(
                        "event payload is not an array: {other}"
                    )))
                }
            };
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name,
                _ => return Err(SyncError::Decode("event without a name".into())),
            };
            let data = args.next().unwrap_or(Value::Null);
            Ok(Packet::Event { name, data })
        }
        '4' => Ok(Packet::ConnectError(if rest.is_empty() {
            Value::Null
        } else {
            parse_json(rest)?
        })),
        _ => Ok(Packet::Unsupported(format!("4{body}"))),
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Full WebSocket URL including the Engine.IO query.
    pub url: String,
    /// Consecutive failed attempts tolerated before giving up.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl StreamConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: socket_url(&config.backend_url, &config.socket_path),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// `http://host:8001` + `socket.io` -> `ws://host:8001/socket.io/?EIO=4&transport=websocket`
pub fn socket_url(backend_url: &str, socket_path: &str) -> String {
    let origin = crate::api::normalize_backend_url(backend_url);
    let ws_origin = if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        origin
    };
    format!(
        "{ws_origin}/{}/?EIO=4&transport=websocket",
        socket_path.trim_matches('/')
    )
}

/// What the stream reports to the sync core.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Namespace joined and role announced. `reconnect` is false only for
    /// the first successful connection of this stream.
    Connected { reconnect: bool },
    Disconnected,
    Event(RemoteEvent),
    /// Reconnect attempts exhausted; no more live updates from this stream.
    GaveUp,
}

enum SessionEnd {
    Cancelled,
    Dropped { established: bool },
}

/// Handle to one running stream connection task.
pub struct EventStream {
    role: Role,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EventStream {
    pub fn open(config: StreamConfig, role: Role, sink: mpsc::UnboundedSender<StreamMessage>) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_stream(config, role, sink, cancel.clone()));
        Self { role, cancel, task }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Stop the connection and wait for the task to finish.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(role = %self.role, error = %e, "event stream task ended abnormally");
        }
    }
}

/// Holds the single active stream connection.
#[derive(Default)]
pub struct StreamSlot {
    active: tokio::sync::Mutex<Option<EventStream>>,
}

impl StreamSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the current connection (if any), then open one for `role`.
    pub async fn open(
        &self,
        config: StreamConfig,
        role: Role,
        sink: mpsc::UnboundedSender<StreamMessage>,
    ) {
        let mut guard = self.active.lock().await;
        if let Some(previous) = guard.take() {
            info!(previous_role = %previous.role(), next_role = %role, "closing event stream before role switch");
            previous.close().await;
        }
        *guard = Some(EventStream::open(config, role, sink));
    }

    pub async fn close(&self) {
        let mut guard = self.active.lock().await;
        if let Some(stream) = guard.take() {
            stream.close().await;
        }
    }
}

async fn run_stream(
    config: StreamConfig,
    role: Role,
    sink: mpsc::UnboundedSender<StreamMessage>,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;
    let mut connected_before = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        debug!(url = %config.url, %role, "connecting event stream");
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = connect_async(config.url.as_str()) => attempt,
        };

        match attempt {
            Ok((ws, _)) => match run_session(ws, role, &sink, &cancel, connected_before).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Dropped { established } => {
                    if established {
                        failures = 0;
                        connected_before = true;
                        info!(%role, "event stream disconnected");
                        if sink.send(StreamMessage::Disconnected).is_err() {
                            break;
                        }
                    }
                }
            },
            Err(e) => {
                warn!(url = %config.url, error = %e, "event stream connect failed");
            }
        }

        failures += 1;
        if failures > config.reconnect_attempts {
            warn!(%role, attempts = failures, "event stream giving up after repeated failures");
            let _ = sink.send(StreamMessage::GaveUp);
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    debug!(%role, "event stream task finished");
}

async fn run_session<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    role: Role,
    sink: &mpsc::UnboundedSender<StreamMessage>,
    cancel: &CancellationToken,
    connected_before: bool,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let mut established = false;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Text(Packet::Disconnect.encode())).await;
                let _ = write.close().await;
                return SessionEnd::Cancelled;
            }
            frame = read.next() => frame,
        };

        let text = match frame {
            None => return SessionEnd::Dropped { established },
            Some(Err(e)) => {
                warn!(%role, error = %e, "event stream read failed");
                return SessionEnd::Dropped { established };
            }
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) => return SessionEnd::Dropped { established },
            Some(Ok(_)) => continue,
        };

        let packet = match Packet::decode(&text) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "dropping undecodable stream frame");
                continue;
            }
        };

        let reply = match packet {
            Packet::Open(_) => Some(Packet::Connect(None)),
            Packet::Ping => Some(Packet::Pong),
            Packet::Connect(_) => {
                established = true;
                info!(%role, reconnect = connected_before, "event stream connected");
                let announce = Packet::event("set_role", serde_json::json!({ "role": role }));
                if write.send(Message::Text(announce.encode())).await.is_err() {
                    return SessionEnd::Dropped { established };
                }
                if sink
                    .send(StreamMessage::Connected {
                        reconnect: connected_before,
                    })
                    .is_err()
                {
                    return SessionEnd::Cancelled;
                }
                None
            }
            Packet::Event { name, data } => {
                match RemoteEvent::decode(&name, data) {
                    Ok(Some(event)) => {
                        if sink.send(StreamMessage::Event(event)).is_err() {
                            return SessionEnd::Cancelled;
                        }
                    }
                    Ok(None) => debug!(event = %name, "ignoring stream event"),
                    Err(e) => warn!(event = %name, error = %e, "dropping malformed stream event"),
                }
                None
            }
            Packet::ConnectError(detail) => {
                warn!(%role, %detail, "event stream namespace connect rejected");
                return SessionEnd::Dropped { established };
            }
            Packet::Disconnect | Packet::Close => return SessionEnd::Dropped { established },
            Packet::Pong | Packet::Noop | Packet::Unsupported(_) => None,
        };

        if let Some(reply) = reply {
            if write.send(Message::Text(reply.encode())).await.is_err() {
                return SessionEnd::Dropped { established };
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
