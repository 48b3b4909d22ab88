//! The public facade: a room-scoped sync client wrapped around a replica
//! store.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{ClientOptions, ConfigError};
use crate::connection::{self, ConnectionInner, ConnectionState, ConnectionStats};
use crate::protocol::ProtocolError;
use crate::pusher::MutationPusher;
use crate::socket::{SocketConnector, TransportError, TungsteniteConnector};
use crate::store::{Replica, StoreError, Subscription, SubscriptionCallback, WatchCallback};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A real-time sync client for one room.
///
/// Wraps an offline-first replica store with a supervised websocket: pokes
/// stream from the server into the store, the store's mutations stream back
/// through the pusher hook. The watchdog keeps the connection alive; reads
/// and writes against the store keep working while offline.
pub struct RoomClient {
    inner: Arc<ConnectionInner>,
    store: Arc<dyn Replica>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl RoomClient {
    /// Validates the options, wires the store's pusher hook and starts the
    /// watchdog. The first connect happens immediately.
    pub fn new(options: ClientOptions, store: Arc<dyn Replica>) -> Result<Self, ConfigError> {
        Self::with_connector(options, store, Arc::new(TungsteniteConnector))
    }

    /// Same as [`RoomClient::new`] with an injected socket connector. Tests
    /// pass a [`crate::MemoryConnector`] here.
    pub fn with_connector(
        options: ClientOptions,
        store: Arc<dyn Replica>,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<Self, ConfigError> {
        let options = options.validate()?;
        let inner = ConnectionInner::new(options, Arc::clone(&store), connector);
        store.set_pusher(Arc::new(MutationPusher::new(Arc::clone(&inner))));
        let watchdog = tokio::spawn(connection::watchdog_loop(Arc::clone(&inner)));
        Ok(Self {
            inner,
            store,
            watchdog: Mutex::new(Some(watchdog)),
        })
    }

    pub fn subscribe(&self, body: Value, on_data: SubscriptionCallback) -> Subscription {
        self.store.subscribe(body, on_data)
    }

    pub async fn query(&self, body: Value) -> Result<Value, ClientError> {
        Ok(self.store.query(body).await?)
    }

    pub fn watch(&self, on_change: WatchCallback) -> Subscription {
        self.store.watch(on_change)
    }

    pub async fn mutate(&self, name: &str, args: Value) -> Result<Value, ClientError> {
        Ok(self.store.mutate(name, args).await?)
    }

    pub fn client_id(&self) -> String {
        self.store.client_id()
    }

    pub fn auth(&self) -> String {
        self.inner.auth()
    }

    pub fn room_id(&self) -> &str {
        &self.inner.options().room_id
    }

    pub fn store_name(&self) -> &str {
        &self.inner.options().store_name
    }

    pub fn schema_version(&self) -> &str {
        &self.inner.options().schema_version
    }

    pub fn closed(&self) -> bool {
        self.inner.closed()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn online(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.inner.stats().await
    }

    /// Disconnects and closes the store. Idempotent; pending work observes
    /// the closed flag instead of blocking shutdown.
    pub async fn close(&self) {
        self.inner.shutdown().await;
        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.abort();
        }
        self.store.close().await;
    }
}
