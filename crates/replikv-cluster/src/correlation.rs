//! Request/response correlation
//!
//! Every command that expects an answer carries a token minted here. The
//! reply handler resolves the token; the requester waits on it with a
//! timeout. Late replies for tokens that are no longer registered are
//! dropped.

use dashmap::DashMap;
use parking_lot::Mutex;
use replikv_common::{Error, Result};
use replikv_proto::{LoadedState, ResponseToken};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{trace, warn};

/// Payload delivered to a waiting requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Loaded(Option<LoadedState>),
    Count(u64),
}

type CombineFn = Box<dyn Fn(u64, u64) -> u64 + Send + Sync>;

enum Pending {
    Single(oneshot::Sender<Reply>),
    Cumulative(Arc<CumulativeResponse>),
}

/// Registry of outstanding requests, keyed by token
pub struct ResponseRegistry {
    next: AtomicU64,
    pending: DashMap<u64, Pending>,
}

impl ResponseRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    fn mint(&self) -> ResponseToken {
        ResponseToken(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a request answered by exactly one reply
    pub fn register(&self) -> PendingReply {
        let token = self.mint();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token.0, Pending::Single(tx));
        PendingReply { token, rx }
    }

    /// Register a request answered by `expected` count replies, folded
    /// together with `combine`
    pub fn register_cumulative(
        &self,
        expected: usize,
        combine: impl Fn(u64, u64) -> u64 + Send + Sync + 'static,
    ) -> (ResponseToken, Arc<CumulativeResponse>) {
        let token = self.mint();
        let response = Arc::new(CumulativeResponse::new(expected, Box::new(combine)));
        if !response.is_complete() {
            self.pending
                .insert(token.0, Pending::Cumulative(Arc::clone(&response)));
        }
        (token, response)
    }

    /// Deliver a reply. Returns false if the token is unknown or was
    /// already resolved.
    pub fn resolve(&self, token: ResponseToken, reply: Reply) -> bool {
        let cumulative = match self.pending.get(&token.0) {
            None => {
                trace!(token = token.0, "dropping reply for unknown token");
                return false;
            }
            Some(pending) => match pending.value() {
                Pending::Cumulative(response) => Some(Arc::clone(response)),
                Pending::Single(_) => None,
            },
        };

        match cumulative {
            None => match self.pending.remove(&token.0) {
                Some((_, Pending::Single(tx))) => {
                    // requester may have given up already
                    let _ = tx.send(reply);
                    true
                }
                _ => false,
            },
            Some(response) => {
                let Reply::Count(count) = reply else {
                    warn!(token = token.0, ?reply, "non-count reply to cumulative request");
                    return false;
                };
                if response.add(count) {
                    self.pending.remove(&token.0);
                }
                true
            }
        }
    }

    /// Deregister a token; a reply arriving later is dropped
    pub fn cancel(&self, token: ResponseToken) {
        self.pending.remove(&token.0);
    }

    /// Number of requests still waiting
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResponseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseRegistry")
            .field("outstanding", &self.pending.len())
            .finish()
    }
}

/// Handle for a single-reply request
#[derive(Debug)]
pub struct PendingReply {
    token: ResponseToken,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    pub fn token(&self) -> ResponseToken {
        self.token
    }

    /// Wait for the reply. On timeout the token is deregistered and
    /// [`Error::Timeout`] returned.
    pub async fn wait(self, registry: &ResponseRegistry, timeout: Duration) -> Result<Reply> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // sender dropped: the token was cancelled
            Ok(Err(_)) => Err(Error::Timeout),
            Err(_) => {
                registry.cancel(self.token);
                Err(Error::Timeout)
            }
        }
    }
}

struct CumulativeState {
    remaining: usize,
    total: u64,
    received: usize,
}

/// Aggregates replies from several members into one total
pub struct CumulativeResponse {
    state: Mutex<CumulativeState>,
    combine: CombineFn,
    done: Notify,
}

impl CumulativeResponse {
    fn new(expected: usize, combine: CombineFn) -> Self {
        Self {
            state: Mutex::new(CumulativeState {
                remaining: expected,
                total: 0,
                received: 0,
            }),
            combine,
            done: Notify::new(),
        }
    }

    /// Fold in one reply; returns true when this was the last one expected
    fn add(&self, count: u64) -> bool {
        let mut state = self.state.lock();
        if state.remaining == 0 {
            return false;
        }
        state.total = (self.combine)(state.total, count);
        state.received += 1;
        state.remaining -= 1;
        if state.remaining == 0 {
            self.done.notify_one();
            true
        } else {
            false
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().remaining == 0
    }

    /// Total folded so far
    pub fn total(&self) -> u64 {
        self.state.lock().total
    }

    /// Replies folded so far
    pub fn received(&self) -> usize {
        self.state.lock().received
    }

    /// Wait until every reply arrived or `timeout` elapsed.
    ///
    /// Returns the total so far and whether it is complete.
    pub async fn wait(&self, timeout: Duration) -> (u64, bool) {
        if !self.is_complete() {
            let _ = tokio::time::timeout(timeout, self.done.notified()).await;
        }
        let state = self.state.lock();
        (state.total, state.remaining == 0)
    }
}

impl std::fmt::Debug for CumulativeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CumulativeResponse")
            .field("remaining", &state.remaining)
            .field("total", &state.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_nonzero() {
        let registry = ResponseRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert!(!a.token().is_none());
        assert_ne!(a.token(), b.token());
        assert_eq!(registry.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_single_first_resolution_wins() {
        let registry = ResponseRegistry::new();
        let pending = registry.register();
        let token = pending.token();

        assert!(registry.resolve(token, Reply::Count(1)));
        assert!(!registry.resolve(token, Reply::Count(2)));
        assert_eq!(registry.outstanding(), 0);

        let reply = pending.wait(&registry, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, Reply::Count(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timeout_deregisters() {
        let registry = ResponseRegistry::new();
        let pending = registry.register();
        let token = pending.token();

        let err = pending
            .wait(&registry, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_no_answer());
        assert_eq!(registry.outstanding(), 0);
        // late reply is dropped
        assert!(!registry.resolve(token, Reply::Ack));
    }

    #[tokio::test]
    async fn test_cancelled_request_gives_no_answer() {
        let registry = ResponseRegistry::new();
        let pending = registry.register();
        registry.cancel(pending.token());
        let err = pending
            .wait(&registry, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_cumulative_resolves_once() {
        let registry = ResponseRegistry::new();
        let (token, response) = registry.register_cumulative(3, |a, b| a + b);

        assert!(registry.resolve(token, Reply::Count(2)));
        assert!(registry.resolve(token, Reply::Count(5)));
        assert!(!response.is_complete());
        assert!(registry.resolve(token, Reply::Count(1)));

        // fourth reply: token already deregistered
        assert!(!registry.resolve(token, Reply::Count(100)));
        assert_eq!(response.wait(Duration::from_secs(1)).await, (8, true));
        assert_eq!(response.received(), 3);
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cumulative_partial_after_timeout() {
        let registry = ResponseRegistry::new();
        let (token, response) = registry.register_cumulative(3, |a, b| a + b);
        registry.resolve(token, Reply::Count(4));

        let (total, complete) = response.wait(Duration::from_millis(100)).await;
        assert_eq!(total, 4);
        assert!(!complete);
        assert_eq!(registry.outstanding(), 1);
        registry.cancel(token);
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cumulative_with_no_members_is_complete() {
        let registry = ResponseRegistry::new();
        let (_, response) = registry.register_cumulative(0, |a, b| a + b);
        assert_eq!(response.wait(Duration::from_secs(1)).await, (0, true));
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cumulative_wakes_waiter() {
        let registry = Arc::new(ResponseRegistry::new());
        let (token, response) = registry.register_cumulative(2, u64::max);

        let waiter = {
            let response = Arc::clone(&response);
            tokio::spawn(async move { response.wait(Duration::from_secs(10)).await })
        };
        registry.resolve(token, Reply::Count(3));
        registry.resolve(token, Reply::Count(7));
        assert_eq!(waiter.await.unwrap(), (7, true));
    }
}
