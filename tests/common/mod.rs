//! Shared scenario-test harness: a client wired to an in-memory replica and
//! an in-memory socket, driven under paused tokio time.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{advance, timeout};

use riptide::{
    ClientOptions, MemoryConnector, MemoryReplica, MemorySocket, Replica, RoomClient,
};

pub struct Harness {
    pub client: RoomClient,
    pub replica: Arc<MemoryReplica>,
    pub connector: Arc<MemoryConnector>,
    pub accepted: mpsc::UnboundedReceiver<MemorySocket>,
    pub online: Arc<Mutex<Vec<bool>>>,
}

pub fn harness(buffer_ms: u64) -> Harness {
    harness_with(|options| {
        options.buffer_ms = buffer_ms;
    })
}

pub fn harness_with(customize: impl FnOnce(&mut ClientOptions)) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let replica = MemoryReplica::with_client_id("c-local", "1");
    let (connector, accepted) = MemoryConnector::new();
    let connector = Arc::new(connector);
    let online = Arc::new(Mutex::new(Vec::new()));

    let mut options = ClientOptions::new("user-1", "room-1", "ws://sync.test");
    options.schema_version = "1".to_string();
    options.on_online_change = Some({
        let online = Arc::clone(&online);
        Arc::new(move |value| online.lock().unwrap().push(value))
    });
    customize(&mut options);

    let client = RoomClient::with_connector(
        options,
        Arc::clone(&replica) as Arc<dyn Replica>,
        Arc::clone(&connector) as Arc<dyn riptide::SocketConnector>,
    )
    .expect("options are valid");

    Harness {
        client,
        replica,
        connector,
        accepted,
        online,
    }
}

impl Harness {
    /// Waits for the watchdog's next connect attempt to reach the server.
    pub async fn accept(&mut self) -> MemorySocket {
        timeout(Duration::from_secs(30), self.accepted.recv())
            .await
            .expect("client connects within the deadline")
            .expect("connector stays alive")
    }

    /// Accepts the next socket and completes the handshake.
    pub async fn connect(&mut self) -> MemorySocket {
        let server = self.accept().await;
        server.send_downstream(r#"["connected",{}]"#);
        spin().await;
        server
    }

    pub fn online_log(&self) -> Vec<bool> {
        self.online.lock().unwrap().clone()
    }
}

/// Lets every ready task run without advancing the clock.
pub async fn spin() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Advances paused time and lets woken tasks run.
pub async fn tick(ms: u64) {
    advance(Duration::from_millis(ms)).await;
    spin().await;
}

pub fn poke_body(
    base: Option<u64>,
    cookie: u64,
    lmid: u64,
    patch: Value,
    timestamp: i64,
    client_id: Option<&str>,
) -> Value {
    let mut body = json!({
        "baseCookie": base,
        "cookie": cookie,
        "lastMutationID": lmid,
        "patch": patch,
        "timestamp": timestamp,
    });
    if let Some(client_id) = client_id {
        body["clientID"] = json!(client_id);
    }
    body
}

pub fn poke_frame(bodies: Vec<Value>) -> String {
    serde_json::to_string(&json!(["poke", bodies])).expect("frame serializes")
}

/// Splits a captured upstream frame into its tag and payload.
pub fn decode_frame(text: &str) -> (String, Value) {
    serde_json::from_str(text).expect("upstream frame is a [tag, payload] tuple")
}
