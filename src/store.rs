//! The seam to the local offline-first replica store.
//!
//! The store is an external collaborator: it owns persistence, mutators and
//! conflict semantics. This crate drives it through [`Replica`] and is driven
//! by it through the pluggable [`Pusher`] and [`Puller`] hooks.
//! [`MemoryReplica`] is an in-process implementation used by the crate's
//! tests and usable as a reference for wiring a real store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::Mutation;

/// A merged state delta handed to the store. The store applies it as an
/// atomic transition from `base_cookie` to `pull_response.cookie`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poke {
    pub base_cookie: Option<u64>,
    pub pull_response: PullResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub cookie: u64,
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
    pub patch: Vec<Value>,
}

/// A batch the store asks its pusher to transmit. Mutations are ordered by
/// id and may include already-sent entries on re-drives.
#[derive(Debug, Clone)]
pub struct PushOutbox {
    pub client_id: String,
    pub mutations: Vec<Mutation>,
    pub push_version: u32,
    pub schema_version: String,
}

/// Outcome reported back to the store. Delivery over the socket is
/// best-effort, so a handled request is a 200 regardless of transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PusherResult {
    pub http_status_code: u16,
    pub error_message: String,
}

impl PusherResult {
    pub fn ok() -> Self {
        Self {
            http_status_code: 200,
            error_message: String::new(),
        }
    }
}

/// A pull request the store hands to its puller. Carries the replica's
/// current position.
#[derive(Debug, Clone)]
pub struct PullOutbox {
    pub client_id: String,
    pub cookie: Option<u64>,
    pub last_mutation_id: u64,
}

#[derive(Debug, Clone)]
pub struct PullerResult {
    pub cookie: Option<u64>,
    pub last_mutation_id_changed: bool,
    pub patch: Vec<Value>,
}

/// The store's outbound plugin: hands pending mutations to the transport.
#[async_trait]
pub trait Pusher: Send + Sync {
    async fn push(&self, request: PushOutbox) -> PusherResult;
}

/// The store's inbound plugin: materializes a pull response.
#[async_trait]
pub trait Puller: Send + Sync {
    async fn pull(&self, request: PullOutbox) -> PullerResult;
}

pub type SubscriptionCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type WatchCallback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Cancels a subscription when dropped, or explicitly via `unsubscribe`.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// The poke's base cookie does not match the replica's current cookie.
    /// Recoverable: the connection is torn down and the server re-issues
    /// pokes from the last acknowledged mutation.
    #[error("unexpected base cookie for poke: expected {expected:?}, got {got:?}")]
    UnexpectedBaseCookie {
        expected: Option<u64>,
        got: Option<u64>,
    },
    #[error("unknown mutator: {0}")]
    UnknownMutator(String),
    #[error("store is closed")]
    Closed,
    #[error("{0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_unexpected_base_cookie(&self) -> bool {
        matches!(self, StoreError::UnexpectedBaseCookie { .. })
    }
}

/// The local replica store.
#[async_trait]
pub trait Replica: Send + Sync {
    fn client_id(&self) -> String;

    /// Applies a merged poke atomically. Must reject with
    /// [`StoreError::UnexpectedBaseCookie`] when the base cookie does not
    /// match the replica's current cookie.
    async fn poke(&self, poke: Poke) -> Result<(), StoreError>;

    async fn query(&self, body: Value) -> Result<Value, StoreError>;

    fn subscribe(&self, body: Value, on_data: SubscriptionCallback) -> Subscription;

    fn watch(&self, on_change: WatchCallback) -> Subscription;

    /// Runs a registered mutator and queues the mutation for push.
    async fn mutate(&self, name: &str, args: Value) -> Result<Value, StoreError>;

    /// Triggers one pull cycle through the installed puller.
    async fn pull(&self);

    fn set_pusher(&self, pusher: Arc<dyn Pusher>);

    fn set_puller(&self, puller: Arc<dyn Puller>);

    async fn close(&self);
}

struct MemoryReplicaInner {
    cookie: Option<u64>,
    last_mutation_id: u64,
    next_mutation_id: u64,
    pending: Vec<Mutation>,
    applied: Vec<Poke>,
    patches: Vec<Value>,
    subscriptions: HashMap<u64, SubscriptionCallback>,
    watchers: HashMap<u64, WatchCallback>,
    closed: bool,
}

/// An in-memory replica: enforces the base-cookie chain, accumulates applied
/// patches, buffers mutations while offline and re-drives the pusher with the
/// full pending set on every mutate.
pub struct MemoryReplica {
    client_id: String,
    schema_version: String,
    epoch: Instant,
    inner: Arc<Mutex<MemoryReplicaInner>>,
    pusher: RwLock<Option<Arc<dyn Pusher>>>,
    puller: RwLock<Option<Arc<dyn Puller>>>,
    next_subscription_id: AtomicU64,
}

impl MemoryReplica {
    pub fn new(schema_version: impl Into<String>) -> Arc<Self> {
        Self::with_client_id(Uuid::new_v4().to_string(), schema_version)
    }

    pub fn with_client_id(
        client_id: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.into(),
            schema_version: schema_version.into(),
            epoch: Instant::now(),
            inner: Arc::new(Mutex::new(MemoryReplicaInner {
                cookie: None,
                last_mutation_id: 0,
                next_mutation_id: 1,
                pending: Vec::new(),
                applied: Vec::new(),
                patches: Vec::new(),
                subscriptions: HashMap::new(),
                watchers: HashMap::new(),
                closed: false,
            })),
            pusher: RwLock::new(None),
            puller: RwLock::new(None),
            next_subscription_id: AtomicU64::new(1),
        })
    }

    /// Seeds the replica at a known cookie, as if it had synced before.
    pub fn seed(&self, cookie: Option<u64>, last_mutation_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.cookie = cookie;
        inner.last_mutation_id = last_mutation_id;
        inner.next_mutation_id = last_mutation_id + 1;
    }

    pub fn cookie(&self) -> Option<u64> {
        self.inner.lock().unwrap().cookie
    }

    pub fn last_mutation_id(&self) -> u64 {
        self.inner.lock().unwrap().last_mutation_id
    }

    pub fn applied_pokes(&self) -> Vec<Poke> {
        self.inner.lock().unwrap().applied.clone()
    }

    pub fn applied_patches(&self) -> Vec<Value> {
        self.inner.lock().unwrap().patches.clone()
    }

    pub fn pending_mutations(&self) -> Vec<Mutation> {
        self.inner.lock().unwrap().pending.clone()
    }

    /// The installed pusher hook, if any. Tests drive re-delivery through
    /// this the same way the store does.
    pub fn pusher(&self) -> Option<Arc<dyn Pusher>> {
        self.pusher.read().unwrap().clone()
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

#[async_trait]
impl Replica for MemoryReplica {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn poke(&self, poke: Poke) -> Result<(), StoreError> {
        let (subscribers, watchers, new_patch) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(StoreError::Closed);
            }
            if poke.base_cookie != inner.cookie {
                return Err(StoreError::UnexpectedBaseCookie {
                    expected: inner.cookie,
                    got: poke.base_cookie,
                });
            }
            inner.cookie = Some(poke.pull_response.cookie);
            inner.last_mutation_id = inner.last_mutation_id.max(poke.pull_response.last_mutation_id);
            let acked = poke.pull_response.last_mutation_id;
            inner.pending.retain(|m| m.id > acked);
            inner.patches.extend(poke.pull_response.patch.iter().cloned());
            inner.applied.push(poke.clone());
            (
                inner.subscriptions.values().cloned().collect::<Vec<_>>(),
                inner.watchers.values().cloned().collect::<Vec<_>>(),
                poke.pull_response.patch,
            )
        };
        for on_data in subscribers {
            on_data(json!({ "patch": new_patch }));
        }
        for on_change in watchers {
            on_change(new_patch.clone());
        }
        Ok(())
    }

    async fn query(&self, _body: Value) -> Result<Value, StoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(json!({ "cookie": inner.cookie, "patch": inner.patches }))
    }

    fn subscribe(&self, _body: Value, on_data: SubscriptionCallback) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().unwrap().subscriptions.insert(id, on_data);
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner.lock().unwrap().subscriptions.remove(&id);
        })
    }

    fn watch(&self, on_change: WatchCallback) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().unwrap().watchers.insert(id, on_change);
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner.lock().unwrap().watchers.remove(&id);
        })
    }

    async fn mutate(&self, name: &str, args: Value) -> Result<Value, StoreError> {
        let (outbox, pusher) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(StoreError::Closed);
            }
            let id = inner.next_mutation_id;
            inner.next_mutation_id += 1;
            inner.pending.push(Mutation {
                id,
                client_id: self.client_id.clone(),
                name: name.to_string(),
                args,
                timestamp: self.now_ms(),
            });
            (
                PushOutbox {
                    client_id: self.client_id.clone(),
                    mutations: inner.pending.clone(),
                    push_version: crate::protocol::PUSH_VERSION,
                    schema_version: self.schema_version.clone(),
                },
                self.pusher.read().unwrap().clone(),
            )
        };
        if let Some(pusher) = pusher {
            tokio::spawn(async move {
                pusher.push(outbox).await;
            });
        }
        Ok(Value::Null)
    }

    async fn pull(&self) {
        let puller = self.puller.read().unwrap().clone();
        let Some(puller) = puller else {
            return;
        };
        let request = {
            let inner = self.inner.lock().unwrap();
            PullOutbox {
                client_id: self.client_id.clone(),
                cookie: inner.cookie,
                last_mutation_id: inner.last_mutation_id,
            }
        };
        let response = puller.pull(request).await;
        if response.last_mutation_id_changed || !response.patch.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            inner.cookie = response.cookie;
            inner.patches.extend(response.patch);
        }
    }

    fn set_pusher(&self, pusher: Arc<dyn Pusher>) {
        *self.pusher.write().unwrap() = Some(pusher);
    }

    fn set_puller(&self, puller: Arc<dyn Puller>) {
        *self.puller.write().unwrap() = Some(puller);
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.subscriptions.clear();
        inner.watchers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poke(base: Option<u64>, cookie: u64, lmid: u64, patch: Vec<Value>) -> Poke {
        Poke {
            base_cookie: base,
            pull_response: PullResponse {
                cookie,
                last_mutation_id: lmid,
                patch,
            },
        }
    }

    #[tokio::test]
    async fn enforces_the_base_cookie_chain() {
        let replica = MemoryReplica::with_client_id("c1", "1");
        replica.poke(poke(None, 1, 1, vec![json!("a")])).await.unwrap();
        replica.poke(poke(Some(1), 2, 2, vec![json!("b")])).await.unwrap();

        let err = replica
            .poke(poke(Some(9), 3, 3, vec![json!("c")]))
            .await
            .unwrap_err();
        assert!(err.is_unexpected_base_cookie());
        assert!(err.to_string().contains("unexpected base cookie for poke"));
        assert_eq!(replica.cookie(), Some(2));
        assert_eq!(replica.applied_patches(), vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn acked_mutations_are_pruned_from_pending() {
        let replica = MemoryReplica::with_client_id("c1", "1");
        replica.mutate("put", json!({"k": 1})).await.unwrap();
        replica.mutate("put", json!({"k": 2})).await.unwrap();
        replica.mutate("put", json!({"k": 3})).await.unwrap();
        assert_eq!(replica.pending_mutations().len(), 3);

        replica.poke(poke(None, 1, 2, vec![])).await.unwrap();
        let pending = replica.pending_mutations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 3);
    }

    #[tokio::test]
    async fn mutation_ids_are_strictly_increasing() {
        let replica = MemoryReplica::with_client_id("c1", "1");
        replica.mutate("a", Value::Null).await.unwrap();
        replica.mutate("b", Value::Null).await.unwrap();
        let ids: Vec<u64> = replica.pending_mutations().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn subscriptions_fire_until_cancelled() {
        let replica = MemoryReplica::with_client_id("c1", "1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = replica.subscribe(Value::Null, {
            let seen = Arc::clone(&seen);
            Arc::new(move |value| seen.lock().unwrap().push(value))
        });

        replica.poke(poke(None, 1, 0, vec![json!("a")])).await.unwrap();
        subscription.unsubscribe();
        replica.poke(poke(Some(1), 2, 0, vec![json!("b")])).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let replica = MemoryReplica::with_client_id("c1", "1");
        replica.close().await;
        assert!(matches!(
            replica.mutate("a", Value::Null).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            replica.poke(poke(None, 1, 0, vec![])).await,
            Err(StoreError::Closed)
        ));
    }
}
