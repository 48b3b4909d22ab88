//! Socket factory: authenticated connect URLs and the connector seam.
//!
//! The connection layer talks to the socket through [`SocketHandle`], an
//! unbounded writer plus an event stream, so the production tungstenite
//! connector and the in-memory test connector are interchangeable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use url::Url;

use crate::config::{parse_socket_origin, ConfigError};

/// Writer half of an open socket. Sends are best-effort; a dropped receiver
/// means the connection is gone and the watchdog will rebuild it.
pub type SocketSender = mpsc::UnboundedSender<String>;

#[derive(Debug)]
pub enum SocketEvent {
    Message(String),
    Closed,
}

/// An open duplex socket, already split and bridged to channels.
pub struct SocketHandle {
    pub outgoing: SocketSender,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Everything needed to build an authenticated connect request.
#[derive(Debug)]
pub struct ConnectParams<'a> {
    pub origin: &'a str,
    pub room_id: &'a str,
    pub client_id: &'a str,
    pub base_cookie: Option<u64>,
    pub last_mutation_id_received: u64,
    pub auth: &'a str,
}

/// A fully-formed connect request: URL plus the optional sub-protocol that
/// carries the auth token.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Url,
    pub protocol: Option<String>,
}

/// Builds the `/connect` URL. The base cookie serializes as an empty string
/// at genesis; `ts` is the local wall clock (the only place wall time is
/// used), `lmid` resumes the server from the last acknowledged mutation.
pub fn build_connect_request(params: &ConnectParams<'_>) -> Result<ConnectRequest, ConfigError> {
    let mut url = parse_socket_origin(params.origin)?;
    url.set_path("/connect");
    let base_cookie = params
        .base_cookie
        .map(|c| c.to_string())
        .unwrap_or_default();
    url.query_pairs_mut()
        .append_pair("clientID", params.client_id)
        .append_pair("roomID", params.room_id)
        .append_pair("baseCookie", &base_cookie)
        .append_pair("ts", &wall_clock_ms().to_string())
        .append_pair("lmid", &params.last_mutation_id_received.to_string());
    let protocol = if params.auth.is_empty() {
        None
    } else {
        Some(utf8_percent_encode(params.auth, NON_ALPHANUMERIC).to_string())
    };
    Ok(ConnectRequest { url, protocol })
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("socket setup failed: {0}")]
    Setup(String),
    #[error("socket closed")]
    ChannelClosed,
    #[error("ping timed out")]
    PingTimeout,
}

/// Opens sockets. Production uses [`TungsteniteConnector`]; tests inject
/// [`MemoryConnector`].
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<SocketHandle, TransportError>;
}

/// Production connector: opens a websocket, splits it, and bridges both
/// halves to channels with a writer task and a reader task.
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<SocketHandle, TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Setup(format!("invalid connect request: {err}")))?;
        if let Some(protocol) = &request.protocol {
            let value = protocol
                .parse()
                .map_err(|_| TransportError::Setup("auth token is not header-safe".into()))?;
            ws_request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        let (ws_stream, _) = connect_async(ws_request)
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(SocketEvent::Message(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            if event_tx.send(SocketEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = event_tx.send(SocketEvent::Closed);
        });

        Ok(SocketHandle {
            outgoing: out_tx,
            events: event_rx,
        })
    }
}

/// The server side of a socket handed out by [`MemoryConnector`]: receives
/// what the client wrote and injects downstream events.
pub struct MemorySocket {
    pub sent: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl MemorySocket {
    pub fn send_downstream(&self, text: impl Into<String>) {
        let _ = self.events.send(SocketEvent::Message(text.into()));
    }

    pub fn close(&self) {
        let _ = self.events.send(SocketEvent::Closed);
    }

    /// Next frame the client wrote, if any.
    pub fn try_next_sent(&mut self) -> Option<String> {
        self.sent.try_recv().ok()
    }

    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }
}

/// In-memory connector for tests: records every connect request and hands
/// the paired server side to the receiver returned by [`MemoryConnector::new`].
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemorySocket>,
    requests: Mutex<Vec<ConnectRequest>>,
    failures: Mutex<VecDeque<TransportError>>,
    refuse_all: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemorySocket>) {
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                requests: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                refuse_all: AtomicBool::new(false),
            },
            accepted_rx,
        )
    }

    /// Every connect request observed so far, in order.
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Queues a failure for the next connect attempt.
    pub fn fail_next_connect(&self, error: TransportError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Makes every subsequent connect attempt fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<SocketHandle, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(TransportError::Setup("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = self.accepted.send(MemorySocket {
            sent: out_rx,
            events: event_tx,
        });
        Ok(SocketHandle {
            outgoing: out_tx,
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn query_map(url: &Url) -> HashMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn connect_url_carries_identity_and_resume_state() {
        let request = build_connect_request(&ConnectParams {
            origin: "wss://sync.example.com",
            room_id: "lobby",
            client_id: "c-9",
            base_cookie: Some(17),
            last_mutation_id_received: 42,
            auth: "",
        })
        .unwrap();

        assert_eq!(request.url.scheme(), "wss");
        assert_eq!(request.url.path(), "/connect");
        let query = query_map(&request.url);
        assert_eq!(query["clientID"], "c-9");
        assert_eq!(query["roomID"], "lobby");
        assert_eq!(query["baseCookie"], "17");
        assert_eq!(query["lmid"], "42");
        assert!(query.contains_key("ts"));
        assert!(request.protocol.is_none());
    }

    #[test]
    fn genesis_base_cookie_serializes_empty() {
        let request = build_connect_request(&ConnectParams {
            origin: "ws://localhost:8080",
            room_id: "r",
            client_id: "c",
            base_cookie: None,
            last_mutation_id_received: 0,
            auth: "",
        })
        .unwrap();
        assert_eq!(query_map(&request.url)["baseCookie"], "");
    }

    #[test]
    fn auth_token_becomes_encoded_subprotocol() {
        let request = build_connect_request(&ConnectParams {
            origin: "ws://localhost:8080",
            room_id: "r",
            client_id: "c",
            base_cookie: None,
            last_mutation_id_received: 0,
            auth: "tok/with space",
        })
        .unwrap();
        let protocol = request.protocol.unwrap();
        assert!(!protocol.contains(' '));
        assert!(!protocol.contains('/'));
        assert!(protocol.contains("tok"));
    }

    #[test]
    fn http_origin_is_rejected() {
        let err = build_connect_request(&ConnectParams {
            origin: "http://sync.example.com",
            room_id: "r",
            client_id: "c",
            base_cookie: None,
            last_mutation_id_received: 0,
            auth: "",
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::SocketScheme(_)));
    }

    #[tokio::test]
    async fn memory_connector_pairs_client_and_server_sides() {
        let (connector, mut accepted) = MemoryConnector::new();
        let request = build_connect_request(&ConnectParams {
            origin: "ws://localhost:8080",
            room_id: "r",
            client_id: "c",
            base_cookie: None,
            last_mutation_id_received: 0,
            auth: "",
        })
        .unwrap();

        let mut handle = connector.connect(&request).await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        handle.outgoing.send("[\"ping\",{}]".to_string()).unwrap();
        assert_eq!(server.next_sent().await.unwrap(), "[\"ping\",{}]");

        server.send_downstream("[\"pong\",{}]");
        match handle.events.recv().await.unwrap() {
            SocketEvent::Message(text) => assert_eq!(text, "[\"pong\",{}]"),
            SocketEvent::Closed => panic!("unexpected close"),
        }
        assert_eq!(connector.requests().len(), 1);
    }
}
