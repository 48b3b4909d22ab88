//! Connection lifecycle: the state machine, downstream dispatch, the
//! frame-paced playback loop and the watchdog.
//!
//! All shared state hangs off one [`ConnectionInner`]. Transitions are driven
//! only by explicit calls, socket events and the watchdog; a generation
//! counter keeps events from a superseded socket away from its successor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientOptions;
use crate::playback::{self, PlaybackState};
use crate::protocol::{Downstream, PokeBody, Upstream};
use crate::puller;
use crate::socket::{
    build_connect_request, ConnectParams, SocketConnector, SocketEvent, SocketSender,
    TransportError,
};
use crate::store::Replica;
use crate::util::{self, Deferred};

/// Watchdog cadence: ping when connected, reconnect otherwise.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(5000);
/// How long a ping may go unanswered before the connection is torn down.
pub const PING_TIMEOUT: Duration = Duration::from_millis(2000);

const FRAME_TICK_FLOOR_MS: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time diagnostics for the facade's `stats()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub buffered_pokes: usize,
    pub last_mutation_id_sent: i64,
    pub last_mutation_id_received: u64,
}

struct ConnState {
    phase: ConnectionState,
    socket: Option<SocketSender>,
    reader: Option<JoinHandle<()>>,
    /// Resolved with the live socket writer on CONNECTED; replaced with a
    /// fresh deferred on every Connected -> Disconnected transition.
    pending_connect: Arc<Deferred<SocketSender>>,
    ping: Option<Arc<Deferred<()>>>,
    generation: u64,
}

pub(crate) struct ConnectionInner {
    options: ClientOptions,
    store: Arc<dyn Replica>,
    connector: Arc<dyn SocketConnector>,
    epoch: Instant,
    frame_tick: Duration,
    auth: Mutex<String>,
    auth_stale: AtomicBool,
    state: Mutex<ConnState>,
    playback: AsyncMutex<PlaybackState>,
    /// Highest mutation id forwarded on the current connection; -1 after
    /// every disconnect.
    last_mutation_id_sent: Mutex<i64>,
    /// Highest server-acknowledged mutation id, read from applied pokes.
    /// Survives reconnects within the session.
    last_mutation_id_received: AtomicU64,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl ConnectionInner {
    pub(crate) fn new(
        options: ClientOptions,
        store: Arc<dyn Replica>,
        connector: Arc<dyn SocketConnector>,
    ) -> Arc<Self> {
        let frame_tick = Duration::from_millis(FRAME_TICK_FLOOR_MS.max(options.buffer_ms / 4));
        let auth = options.auth.clone();
        Arc::new(Self {
            options,
            store,
            connector,
            epoch: Instant::now(),
            frame_tick,
            auth: Mutex::new(auth),
            auth_stale: AtomicBool::new(false),
            state: Mutex::new(ConnState {
                phase: ConnectionState::Disconnected,
                socket: None,
                reader: None,
                pending_connect: Deferred::new(),
                ping: None,
                generation: 0,
            }),
            playback: AsyncMutex::new(PlaybackState::new()),
            last_mutation_id_sent: Mutex::new(-1),
            last_mutation_id_received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        })
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Monotonic milliseconds since this client was created. Wall time is
    /// only used in the connect URL.
    pub(crate) fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().phase
    }

    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    pub(crate) fn has_socket(&self) -> bool {
        self.state.lock().unwrap().socket.is_some()
    }

    pub(crate) fn auth(&self) -> String {
        self.auth.lock().unwrap().clone()
    }

    pub(crate) fn mark_auth_stale(&self) {
        self.auth_stale.store(true, Ordering::SeqCst);
    }

    pub(crate) fn max_random_push_latency_ms(&self) -> u64 {
        self.options.max_random_push_latency_ms
    }

    pub(crate) fn send_guard(&self) -> MutexGuard<'_, i64> {
        self.last_mutation_id_sent.lock().unwrap()
    }

    pub(crate) async fn stats(&self) -> ConnectionStats {
        let buffered_pokes = self.playback.lock().await.buffer.len();
        ConnectionStats {
            state: self.state(),
            buffered_pokes,
            last_mutation_id_sent: *self.last_mutation_id_sent.lock().unwrap(),
            last_mutation_id_received: self.last_mutation_id_received.load(Ordering::SeqCst),
        }
    }

    fn fire_online(&self, online: bool) {
        if let Some(on_online_change) = &self.options.on_online_change {
            on_online_change(online);
        }
    }

    /// Awaits the pending-connect rendezvous and returns the live socket
    /// writer together with the generation it belongs to. A disconnect that
    /// races the rendezvous replaces the deferred, so the loop re-waits on
    /// the fresh one. Returns `None` if the client closes while waiting.
    pub(crate) async fn connected_socket(&self) -> Option<(SocketSender, u64)> {
        loop {
            let pending = {
                let st = self.state.lock().unwrap();
                Arc::clone(&st.pending_connect)
            };
            let closed = self.closed_notify.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if self.closed() {
                return None;
            }
            tokio::select! {
                _ = pending.wait() => {}
                _ = &mut closed => return None,
            }
            let st = self.state.lock().unwrap();
            if st.phase == ConnectionState::Connected {
                if let Some(socket) = st.socket.clone() {
                    return Some((socket, st.generation));
                }
            }
        }
    }

    async fn handle_connected(&self, generation: u64) {
        let resolve = {
            let mut st = self.state.lock().unwrap();
            if st.generation != generation || st.phase != ConnectionState::Connecting {
                return;
            }
            st.phase = ConnectionState::Connected;
            *self.last_mutation_id_sent.lock().unwrap() = -1;
            st.socket
                .clone()
                .map(|socket| (Arc::clone(&st.pending_connect), socket))
        };
        if let Some((pending, socket)) = resolve {
            pending.resolve(socket).await;
            info!("connected");
            self.fire_online(true);
        }
    }

    async fn handle_pong(&self, generation: u64) {
        let rendezvous = {
            let mut st = self.state.lock().unwrap();
            if st.generation != generation {
                return;
            }
            st.ping.take()
        };
        if let Some(rendezvous) = rendezvous {
            rendezvous.resolve(()).await;
        }
    }

    /// Tears the connection down. `expected_generation` limits the teardown
    /// to a specific socket era (`None` is unconditional, used by close).
    /// Readers tearing themselves down pass `from_reader` so their own task
    /// is not aborted out from under the cleanup.
    pub(crate) async fn disconnect(
        &self,
        expected_generation: Option<u64>,
        from_reader: bool,
        reason: &str,
    ) {
        let (had_connection, was_connected, reader) = {
            let mut st = self.state.lock().unwrap();
            if let Some(generation) = expected_generation {
                if st.generation != generation {
                    return;
                }
            }
            let had_connection = st.socket.is_some()
                || st.reader.is_some()
                || st.phase != ConnectionState::Disconnected;
            let was_connected = st.phase == ConnectionState::Connected;
            if had_connection {
                st.generation += 1;
            }
            st.phase = ConnectionState::Disconnected;
            st.socket = None;
            st.ping = None;
            if was_connected {
                st.pending_connect = Deferred::new();
            }
            (had_connection, was_connected, st.reader.take())
        };
        if let Some(handle) = reader {
            if !from_reader {
                handle.abort();
            }
        }
        self.playback.lock().await.clear();
        *self.last_mutation_id_sent.lock().unwrap() = -1;
        if had_connection {
            info!(reason, "disconnected");
        }
        if was_connected {
            self.fire_online(false);
        }
    }

    /// Sends a ping and waits for the pong rendezvous or the deadline.
    pub(crate) async fn ping(&self, generation: u64) {
        let (rendezvous, socket) = {
            let mut st = self.state.lock().unwrap();
            if st.generation != generation || st.phase != ConnectionState::Connected {
                return;
            }
            let rendezvous = Deferred::new();
            st.ping = Some(Arc::clone(&rendezvous));
            (rendezvous, st.socket.clone())
        };
        let Some(socket) = socket else {
            return;
        };
        let frame = match Upstream::Ping.encode() {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, "failed to encode ping");
                return;
            }
        };
        trace!("ping");
        if socket.send(frame).is_err() {
            self.disconnect(Some(generation), false, "socket gone during ping")
                .await;
            return;
        }
        match tokio::time::timeout(PING_TIMEOUT, rendezvous.wait()).await {
            Ok(()) => {
                let mut st = self.state.lock().unwrap();
                if st.generation == generation {
                    st.ping = None;
                }
            }
            Err(_) => {
                warn!("pong deadline expired");
                self.disconnect(Some(generation), false, "ping timeout").await;
            }
        }
    }

    /// One frame tick: batch every ripe poke, merge, hand to the store.
    /// Holding the playback lock across `poke` serializes applications and
    /// preserves the base-cookie chain.
    async fn drain_step(&self) -> DrainOutcome {
        let mut pb = self.playback.lock().await;
        let now = self.now_ms();
        let batch = playback::take_ripe_batch(&mut pb, now, self.options.buffer_ms as i64);
        if batch.is_empty() {
            if pb.buffer.is_empty() {
                pb.loop_running = false;
                return DrainOutcome::Idle;
            }
            return DrainOutcome::Continue;
        }
        let generation = self.generation();
        let Some(combined) = playback::merge_batch(batch) else {
            return DrainOutcome::Continue;
        };
        let acked = combined.pull_response.last_mutation_id;
        trace!(
            cookie = combined.pull_response.cookie,
            patch_len = combined.pull_response.patch.len(),
            "applying poke"
        );
        match self.store.poke(combined).await {
            Ok(()) => {
                self.last_mutation_id_received
                    .fetch_max(acked, Ordering::SeqCst);
                DrainOutcome::Continue
            }
            Err(err) if err.is_unexpected_base_cookie() => {
                info!(error = %err, "replica rejected poke; recovering via reconnect");
                DrainOutcome::Recover(generation)
            }
            Err(err) => {
                // A background drain has no caller to surface this to; tear
                // the connection down and let the server re-issue from lmid.
                error!(error = %err, "replica failed to apply poke");
                DrainOutcome::Recover(generation)
            }
        }
    }

    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed_notify.notify_waiters();
        self.disconnect(None, false, "client closed").await;
    }
}

enum DrainOutcome {
    Continue,
    Idle,
    Recover(u64),
}

pub(crate) fn spawn_connect(inner: &Arc<ConnectionInner>) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        if let Err(err) = connect(&inner).await {
            debug!(error = %err, "background connect attempt failed");
        }
    });
}

/// Disconnected -> Connecting -> (on `connected` envelope) Connected.
/// A no-op while already connecting or connected.
pub(crate) async fn connect(inner: &Arc<ConnectionInner>) -> Result<(), TransportError> {
    if inner.closed() {
        return Ok(());
    }
    let generation = {
        let mut st = inner.state.lock().unwrap();
        if st.phase != ConnectionState::Disconnected {
            return Ok(());
        }
        st.phase = ConnectionState::Connecting;
        st.generation
    };
    match connect_attempt(inner, generation).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let mut st = inner.state.lock().unwrap();
            if st.generation == generation && st.phase == ConnectionState::Connecting {
                st.phase = ConnectionState::Disconnected;
            }
            Err(err)
        }
    }
}

async fn connect_attempt(
    inner: &Arc<ConnectionInner>,
    generation: u64,
) -> Result<(), TransportError> {
    if inner.auth_stale.swap(false, Ordering::SeqCst) {
        if let Some(get_auth) = &inner.options.get_auth {
            let token = get_auth().await;
            *inner.auth.lock().unwrap() = token;
        }
    }

    let base_cookie = puller::current_base_cookie(&inner.store).await;
    let client_id = inner.store.client_id();
    let auth = inner.auth();
    let request = build_connect_request(&ConnectParams {
        origin: &inner.options.socket_origin,
        room_id: &inner.options.room_id,
        client_id: &client_id,
        base_cookie,
        last_mutation_id_received: inner.last_mutation_id_received.load(Ordering::SeqCst),
        auth: &auth,
    })
    .map_err(|err| TransportError::Setup(err.to_string()))?;

    debug!(url = %request.url, "opening socket");
    let handle = inner.connector.connect(&request).await?;

    let mut st = inner.state.lock().unwrap();
    if st.generation != generation || st.phase != ConnectionState::Connecting || inner.closed() {
        // Superseded while the socket was opening; let it drop.
        return Ok(());
    }
    st.socket = Some(handle.outgoing);
    st.reader = Some(tokio::spawn(read_loop(
        Arc::clone(inner),
        generation,
        handle.events,
    )));
    Ok(())
}

/// Appends pokes to the buffer and makes sure a playback loop is ticking.
async fn enqueue_pokes(inner: &Arc<ConnectionInner>, generation: u64, pokes: Vec<PokeBody>) {
    if pokes.is_empty() {
        return;
    }
    let mut pb = inner.playback.lock().await;
    // A disconnect bumps the generation before it clears the buffer, so a
    // stale reader cannot repopulate it.
    if inner.generation() != generation {
        return;
    }
    playback::record_offsets(&mut pb, &pokes, inner.now_ms());
    pb.buffer.extend(pokes);
    if !pb.loop_running {
        pb.loop_running = true;
        tokio::spawn(playback_loop(Arc::clone(inner)));
    }
}

async fn playback_loop(inner: Arc<ConnectionInner>) {
    loop {
        tokio::time::sleep(inner.frame_tick).await;
        match inner.drain_step().await {
            DrainOutcome::Continue => {}
            DrainOutcome::Idle => return,
            DrainOutcome::Recover(generation) => {
                inner
                    .disconnect(Some(generation), false, "poke out of order")
                    .await;
            }
        }
    }
}

/// Dispatches downstream envelopes for one socket era.
async fn read_loop(
    inner: Arc<ConnectionInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
) {
    while let Some(event) = events.recv().await {
        if inner.generation() != generation || inner.closed() {
            return;
        }
        match event {
            SocketEvent::Message(text) => match Downstream::decode(&text) {
                Ok(Downstream::Connected) => inner.handle_connected(generation).await,
                Ok(Downstream::Pong) => inner.handle_pong(generation).await,
                Ok(Downstream::Poke(pokes)) => enqueue_pokes(&inner, generation, pokes).await,
                Ok(Downstream::Error(message)) => {
                    warn!(message = %message, "server reported a fatal error");
                    if message.to_ascii_lowercase().contains("auth") {
                        inner.mark_auth_stale();
                    }
                    inner.disconnect(Some(generation), true, "server error").await;
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "protocol violation");
                    inner
                        .disconnect(Some(generation), true, "protocol violation")
                        .await;
                    return;
                }
            },
            SocketEvent::Closed => {
                inner.disconnect(Some(generation), true, "socket closed").await;
                return;
            }
        }
    }
    inner
        .disconnect(Some(generation), true, "socket stream ended")
        .await;
}

/// Supervises the connection: pings while connected, reconnects otherwise.
/// Runs until `close()` cancels its sleep.
pub(crate) async fn watchdog_loop(inner: Arc<ConnectionInner>) {
    loop {
        if inner.closed() {
            return;
        }
        let (phase, generation) = {
            let st = inner.state.lock().unwrap();
            (st.phase, st.generation)
        };
        match phase {
            ConnectionState::Connected => inner.ping(generation).await,
            _ => {
                if let Err(err) = connect(&inner).await {
                    debug!(error = %err, "connect attempt failed; watchdog will retry");
                }
            }
        }
        if !util::sleep_cancellable(WATCHDOG_INTERVAL, &inner.closed_notify).await {
            return;
        }
    }
}
