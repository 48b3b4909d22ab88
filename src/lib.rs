//! Room-scoped real-time synchronization client.
//!
//! `riptide` keeps a persistent websocket to a sync server, streams ordered
//! state deltas ("pokes") into a local offline-first replica store, and
//! pushes the store's optimistic mutations back upstream. The store itself
//! (persistence, mutators, conflict semantics) is an external collaborator
//! reached through the [`Replica`] trait.
//!
//! The two load-bearing pieces:
//!
//! - **Connection & push lifecycle**: a watchdog-supervised state machine
//!   (Disconnected / Connecting / Connected) over an authenticated socket,
//!   with a pending-connect rendezvous and a mutation pusher that guarantees
//!   each mutation id is transmitted at most once per connection, in order.
//! - **Poke playback**: received pokes are buffered, paced by a per-source
//!   clock-offset estimate plus a jitter buffer, merged per display frame and
//!   applied to the store serially so the base-cookie chain holds. A broken
//!   chain tears the connection down; the server resumes from the last
//!   acknowledged mutation on reconnect.
//!
//! ```no_run
//! use std::sync::Arc;
//! use riptide::{ClientOptions, MemoryReplica, RoomClient};
//!
//! # async fn run() -> Result<(), riptide::ConfigError> {
//! let store = MemoryReplica::new("1");
//! let client = RoomClient::new(
//!     ClientOptions::new("user-7", "lobby", "wss://sync.example.com"),
//!     store,
//! )?;
//! let _ = client.mutate("increment", serde_json::json!({ "by": 1 })).await;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod playback;
mod protocol;
mod puller;
mod pusher;
mod socket;
mod store;
mod util;

pub use client::{ClientError, RoomClient};
pub use config::{AuthRefreshCallback, ClientOptions, ConfigError, OnlineChangeCallback,
    DEFAULT_BUFFER_MS};
pub use connection::{ConnectionState, ConnectionStats, PING_TIMEOUT, WATCHDOG_INTERVAL};
pub use protocol::{Downstream, Mutation, PokeBody, ProtocolError, PushBody, Upstream,
    PUSH_VERSION};
pub use socket::{
    build_connect_request, ConnectParams, ConnectRequest, MemoryConnector, MemorySocket,
    SocketConnector, SocketEvent, SocketHandle, SocketSender, TransportError,
    TungsteniteConnector,
};
pub use store::{
    MemoryReplica, Poke, PullOutbox, Puller, PullerResult, PullResponse, Pusher, PusherResult,
    PushOutbox, Replica, StoreError, Subscription, SubscriptionCallback, WatchCallback,
};
pub use util::Deferred;
