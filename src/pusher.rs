//! Outbound mutation pipeline.
//!
//! The store hands its pending mutations to [`MutationPusher`] (its pusher
//! hook). Delivery is best-effort over the socket: the store re-drives the
//! hook on its own retry cycles, and the monotonic id guard keeps each
//! mutation to at most one transmission per connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::connection::{self, ConnectionInner};
use crate::protocol::{PushBody, Upstream};
use crate::store::{PushOutbox, Pusher, PusherResult};

pub(crate) struct MutationPusher {
    connection: Arc<ConnectionInner>,
}

impl MutationPusher {
    pub(crate) fn new(connection: Arc<ConnectionInner>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Pusher for MutationPusher {
    async fn push(&self, request: PushOutbox) -> PusherResult {
        let conn = &self.connection;
        if conn.closed() {
            return PusherResult::ok();
        }
        if !conn.has_socket() {
            connection::spawn_connect(conn);
        }

        // Wait for the handshake; a close while waiting abandons the push.
        let Some((socket, generation)) = conn.connected_socket().await else {
            return PusherResult::ok();
        };

        let max_latency = conn.max_random_push_latency_ms();
        if max_latency > 0 {
            let delay = rand::thread_rng().gen_range(0..max_latency);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut transmitted = 0usize;
        {
            // The guard is held across the whole batch so concurrent
            // re-drives cannot interleave ids out of order.
            let mut sent = conn.send_guard();
            // The latency sleep may have outlived the connection the socket
            // belongs to. Advancing the guard then would mark mutations as
            // sent on a dead socket and re-drives would skip them forever;
            // a disconnect resets the guard only after this lock is free.
            if conn.generation() != generation {
                debug!("connection changed during push; leaving re-drive to the store");
                return PusherResult::ok();
            }
            for mutation in &request.mutations {
                if (mutation.id as i64) <= *sent {
                    continue;
                }
                *sent = mutation.id as i64;
                let body = PushBody {
                    client_id: request.client_id.clone(),
                    mutations: vec![mutation.clone()],
                    push_version: request.push_version,
                    schema_version: request.schema_version.clone(),
                    timestamp: conn.now_ms(),
                };
                let frame = match Upstream::Push(body).encode() {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "failed to encode push envelope");
                        continue;
                    }
                };
                if socket.send(frame).is_err() {
                    // Socket died mid-batch; the reconnect resets the guard
                    // and the store's next re-drive picks these up again.
                    debug!(mutation_id = mutation.id, "socket gone during push");
                    break;
                }
                transmitted += 1;
            }
        }
        trace!(transmitted, total = request.mutations.len(), "push handled");
        PusherResult::ok()
    }
}
