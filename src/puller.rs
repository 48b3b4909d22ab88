//! Base-cookie extraction.
//!
//! The store exposes no getter for its current cookie, so each connect
//! installs a one-shot puller that captures the cookie from the pull request
//! the store builds, then answers with a stub response so the store makes no
//! progress.

use std::sync::Arc;

use async_trait::async_trait;

use crate::store::{PullOutbox, Puller, PullerResult, Replica};
use crate::util::Deferred;

struct BaseCookiePuller {
    captured: Arc<Deferred<Option<u64>>>,
}

#[async_trait]
impl Puller for BaseCookiePuller {
    async fn pull(&self, request: PullOutbox) -> PullerResult {
        self.captured.resolve(request.cookie).await;
        PullerResult {
            cookie: request.cookie,
            last_mutation_id_changed: false,
            patch: Vec::new(),
        }
    }
}

/// Reads the replica's current cookie by round-tripping a pull through the
/// shim. Installed fresh on every connect.
pub(crate) async fn current_base_cookie(store: &Arc<dyn Replica>) -> Option<u64> {
    let captured = Deferred::new();
    store.set_puller(Arc::new(BaseCookiePuller {
        captured: Arc::clone(&captured),
    }));
    store.pull().await;
    captured.wait().await
}
