//! Replicated cache facade
//!
//! Every member keeps its own entries as primary copies and ships each
//! write to exactly one other member, chosen by the membership's
//! placement. Reads are served locally when possible and otherwise loaded
//! from the cluster: first from the likely replica holders, then from
//! everyone.
//!
//! A read/write gate makes `close` wait for operations already running;
//! anything started after `close` fails with [`Error::AlreadyClosed`].

use crate::codec::{BincodeCodec, ValueCodec};
use crate::correlation::Reply;
use crate::dispatcher::Dispatcher;
use crate::transport::{InboundHandler, Transport};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use replikv_common::config::MergeMode;
use replikv_common::{now_millis, Config, Error, InstanceId, Result, Version, INITIAL_VERSION};
use replikv_placement::Membership;
use replikv_proto::{Command, CommandBody, LoadedState, ResponseToken, SaveBody, TouchBody};
use replikv_store::{DirtyFieldMerge, MergeEngine, ReplicaStore};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, trace, warn};

/// Result of recording a write in the local store
struct LocalWrite {
    version: Version,
    now: i64,
    max_idle_ms: i64,
    payload: Bytes,
    partial: bool,
    /// Previous replica holder that must drop its copy
    stale: Option<InstanceId>,
}

pub struct ReplicatedCache<V, C = BincodeCodec<V>> {
    config: Config,
    membership: Arc<dyn Membership>,
    dispatcher: Arc<Dispatcher>,
    codec: C,
    closed: RwLock<bool>,
    _value: PhantomData<fn() -> V>,
}

impl<V, C: ValueCodec<V>> ReplicatedCache<V, C> {
    /// Create a cache member. Must be called inside a tokio runtime.
    ///
    /// Inbound frames must be routed to [`inbound`](Self::inbound) by
    /// whatever owns the receiving side of `transport`.
    pub fn new(
        config: Config,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn Transport>,
        codec: C,
    ) -> Result<Self> {
        Self::new_with(config, membership, transport, codec, |dispatcher| dispatcher)
    }

    /// Like [`new`](Self::new), letting `setup` add interceptors or
    /// replace handlers on the dispatcher
    pub fn new_with(
        config: Config,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn Transport>,
        codec: C,
        setup: impl FnOnce(Dispatcher) -> Dispatcher,
    ) -> Result<Self> {
        config.validate()?;
        if membership.local_instance() != &config.node.instance {
            return Err(Error::configuration(format!(
                "membership is for {}, node is {}",
                membership.local_instance(),
                config.node.instance
            )));
        }

        let merge = match config.replication.merge {
            MergeMode::Full => MergeEngine::default(),
            MergeMode::DirtyFields => MergeEngine::new(Arc::new(DirtyFieldMerge)),
        };
        let store = Arc::new(ReplicaStore::new(merge));
        let dispatcher = Arc::new(setup(Dispatcher::new(&config, store, transport)));

        info!(
            member = %config.node.instance,
            store = %config.node.store_name,
            merge = dispatcher.store().merge_engine().strategy().name(),
            synchronous = config.replication.synchronous_writes,
            "replicated cache started"
        );

        Ok(Self {
            config,
            membership,
            dispatcher,
            codec,
            closed: RwLock::new(false),
            _value: PhantomData,
        })
    }

    /// Handler to feed every frame received for this member
    pub fn inbound(&self) -> Weak<dyn InboundHandler> {
        let inbound: Arc<dyn InboundHandler> = self.dispatcher.clone();
        Arc::downgrade(&inbound)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// This member's local store
    pub fn store(&self) -> &ReplicaStore {
        self.dispatcher.store()
    }

    fn store_name(&self) -> &str {
        &self.config.node.store_name
    }

    async fn enter(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let guard = self.closed.read().await;
        if *guard {
            return Err(Error::AlreadyClosed);
        }
        Ok(guard)
    }

    /// Store `value` under `key` and replicate it.
    ///
    /// Returns the member the replica was sent to, or `None` when this
    /// member has no peer. With synchronous writes this waits for the
    /// replica's acknowledgement and fails with [`Error::Timeout`] if none
    /// arrives.
    pub async fn put(&self, key: &str, value: &V) -> Result<Option<InstanceId>> {
        let _open = self.enter().await?;
        let raw = self.codec.encode(value)?;
        self.replicate(key, raw).await
    }

    async fn replicate(&self, key: &str, raw: Bytes) -> Result<Option<InstanceId>> {
        let target = match self.membership.mapped_instance(self.store_name(), key) {
            Ok(target) => Some(target),
            Err(Error::NoViableTarget) => None,
            Err(e) => return Err(e),
        };
        let write = self.record_write(key, raw, target.as_ref())?;
        let Some(target) = target else {
            trace!(key, version = write.version, "no peer, write kept local");
            return Ok(None);
        };

        self.ship(key, &target, |ack_token| {
            CommandBody::Save(SaveBody {
                version: write.version,
                last_accessed_at: write.now,
                max_idle_ms: write.max_idle_ms,
                partial: write.partial,
                ack_token,
                payload: write.payload.clone(),
            })
        })
        .await?;

        if let Some(stale) = write.stale {
            debug!(key, from = %stale, to = %target, "replica moved");
            self.dispatcher
                .send_async(self.command(key, CommandBody::StaleCopyRemove).to(stale))
                .await?;
        }
        Ok(Some(target))
    }

    fn record_write(
        &self,
        key: &str,
        raw: Bytes,
        target: Option<&InstanceId>,
    ) -> Result<LocalWrite> {
        let now = now_millis();
        let max_idle_ms = self.config.replication.default_max_idle_ms;
        let store = self.store();
        loop {
            let entry = store.get_or_create(key);
            let mut state = entry.lock();
            // removed under us; the next lookup finds a fresh entry
            if state.is_removed() {
                continue;
            }
            let previous = state.raw_value.clone();
            let version = state.record_local_write(raw.clone(), now, max_idle_ms);

            let Some(target) = target else {
                return Ok(LocalWrite {
                    version,
                    now,
                    max_idle_ms,
                    payload: raw,
                    partial: false,
                    stale: None,
                });
            };
            let (payload, partial) = if state.replica_location.as_ref() == Some(target) {
                store
                    .merge_engine()
                    .outgoing_payload(previous.as_ref(), &raw)?
            } else {
                (raw, false)
            };
            let stale = state
                .replica_location
                .replace(target.clone())
                .filter(|old| old != target);
            return Ok(LocalWrite {
                version,
                now,
                max_idle_ms,
                payload,
                partial,
                stale,
            });
        }
    }

    /// Send a Save/Touch, waiting for the acknowledgement with synchronous
    /// writes
    async fn ship(
        &self,
        key: &str,
        target: &InstanceId,
        body: impl FnOnce(ResponseToken) -> CommandBody,
    ) -> Result<()> {
        if !self.config.replication.synchronous_writes {
            let command = self.command(key, body(ResponseToken::NONE)).to(target.clone());
            return self.dispatcher.send_async(command).await;
        }
        let reply = self
            .dispatcher
            .request(
                |token| self.command(key, body(token)).to(target.clone()),
                self.config.replication.ack_timeout(),
            )
            .await?;
        match reply {
            Reply::Ack => Ok(()),
            other => Err(Error::protocol(format!("expected an ack, got {other:?}"))),
        }
    }

    fn command(&self, key: &str, body: CommandBody) -> Command {
        self.dispatcher.command(key, body)
    }

    /// Read `key`, loading it from the cluster on a local miss
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        self.get_with_hint(key, None).await
    }

    /// Read `key`, trying `hint` first on a local miss
    pub async fn get_with_hint(&self, key: &str, hint: Option<&InstanceId>) -> Result<Option<V>> {
        let _open = self.enter().await?;

        let mut min_version = INITIAL_VERSION;
        if let Some(entry) = self.store().get(key) {
            let local = {
                let mut state = entry.lock();
                if state.is_live() {
                    state.last_accessed_at = now_millis();
                    state.raw_value.clone()
                } else {
                    if !state.is_removed() {
                        min_version = state.version;
                    }
                    None
                }
            };
            if let Some(raw) = local {
                return self.codec.decode(&raw).map(Some);
            }
        }

        let Some((holder, loaded)) = self.load_from_cluster(key, hint, min_version).await else {
            trace!(key, "not found in cluster");
            return Ok(None);
        };
        let value = self.codec.decode(&loaded.payload)?;
        debug!(key, version = loaded.version, from = %holder, "loaded from cluster");
        self.adopt(key, &holder, &loaded);

        if self.config.replication.save_on_load {
            if let Err(e) = self.replicate(key, loaded.payload).await {
                warn!(key, error = %e, "save after load failed");
            }
        }
        Ok(Some(value))
    }

    fn adopt(&self, key: &str, holder: &InstanceId, loaded: &LoadedState) {
        loop {
            let entry = self.store().get_or_create(key);
            let mut state = entry.lock();
            if state.is_removed() {
                continue;
            }
            if self.store().merge_engine().adopt_loaded(
                &mut state,
                loaded.version,
                loaded.payload.clone(),
                loaded.last_accessed_at,
                loaded.max_idle_ms,
                holder.clone(),
            ) {
                state.last_accessed_at = now_millis();
            }
            return;
        }
    }

    async fn load_from_cluster(
        &self,
        key: &str,
        hint: Option<&InstanceId>,
        min_version: Version,
    ) -> Option<(InstanceId, LoadedState)> {
        let local = self.membership.local_instance();
        let mut candidates: Vec<InstanceId> = Vec::new();
        let choices = self.membership.replica_choices(self.store_name(), key);
        for candidate in hint.cloned().into_iter().chain(choices) {
            if !candidate.is_empty() && &candidate != local && !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        candidates.truncate(self.config.replication.max_replica_tries);

        for target in candidates {
            match self.load_from(key, &target, min_version).await {
                Ok(Some(state)) => return Some((target, state)),
                Ok(None) => trace!(key, %target, "replica candidate has no copy"),
                Err(e) => debug!(key, %target, error = %e, "replica candidate did not answer"),
            }
        }

        let peers = self.membership.peers();
        if peers.is_empty() {
            return None;
        }
        trace!(key, peers = peers.len(), "asking every member");
        let mut inflight: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| async move {
                let result = self.load_from(key, &peer, min_version).await;
                (peer, result)
            })
            .collect();
        while let Some((peer, result)) = inflight.next().await {
            if let Ok(Some(state)) = result {
                return Some((peer, state));
            }
        }
        None
    }

    async fn load_from(
        &self,
        key: &str,
        target: &InstanceId,
        min_version: Version,
    ) -> Result<Option<LoadedState>> {
        let reply = self
            .dispatcher
            .request(
                |token| {
                    self.command(key, CommandBody::LoadRequest { token, min_version })
                        .to(target.clone())
                },
                self.config.replication.load_timeout(),
            )
            .await?;
        match reply {
            Reply::Loaded(state) => Ok(state.filter(|s| s.version >= min_version)),
            other => Err(Error::protocol(format!("expected a load response, got {other:?}"))),
        }
    }

    /// Record an access and propagate it to the replica.
    ///
    /// `version` should be newer than the replica's; an older one is
    /// ignored there. Returns where the touch was sent.
    pub async fn touch(
        &self,
        key: &str,
        version: Version,
        timestamp: i64,
        ttl_ms: i64,
    ) -> Result<Option<InstanceId>> {
        let _open = self.enter().await?;

        let location = self.store().get(key).and_then(|entry| {
            let mut state = entry.lock();
            if !state.is_live() {
                return None;
            }
            state.last_accessed_at = state.last_accessed_at.max(timestamp);
            state.max_idle_ms = ttl_ms;
            state.version = state.version.max(version);
            state.replica_location.clone()
        });
        let target = match location {
            Some(target) => target,
            None => match self.membership.mapped_instance(self.store_name(), key) {
                Ok(target) => target,
                Err(Error::NoViableTarget) => return Ok(None),
                Err(e) => return Err(e),
            },
        };

        self.ship(key, &target, |ack_token| {
            CommandBody::Touch(TouchBody {
                version,
                last_accessed_at: timestamp,
                max_idle_ms: ttl_ms,
                ack_token,
            })
        })
        .await?;
        Ok(Some(target))
    }

    /// Remove `key` here and from the member holding its counterpart
    pub async fn remove(&self, key: &str) -> Result<()> {
        let _open = self.enter().await?;

        let location = self
            .store()
            .get(key)
            .and_then(|entry| entry.lock().replica_location.clone());
        self.store().remove(key);

        let target = match location {
            Some(target) => Some(target),
            None => self.membership.mapped_instance(self.store_name(), key).ok(),
        };
        if let Some(target) = target {
            self.dispatcher
                .send_async(self.command(key, CommandBody::Remove).to(target))
                .await?;
        }
        Ok(())
    }

    /// Number of entries in the cluster.
    ///
    /// Every entry has exactly one replica copy, so this sums the replica
    /// counts of all members, asking each one separately. Alone, the local
    /// entry count is returned. Members that do not answer in time are
    /// left out.
    pub async fn size(&self) -> Result<u64> {
        let _open = self.enter().await?;

        let peers = self.membership.peers();
        if peers.is_empty() {
            return Ok(self.store().live_count() as u64);
        }
        let timeout = self.config.replication.size_timeout();
        let mut inflight: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| async move {
                let reply = self
                    .dispatcher
                    .request(
                        |token| {
                            self.command("", CommandBody::SizeRequest { token })
                                .to(peer.clone())
                        },
                        timeout,
                    )
                    .await;
                (peer, reply)
            })
            .collect();

        let mut total = self.store().replica_count() as u64;
        while let Some((peer, reply)) = inflight.next().await {
            match reply {
                Ok(Reply::Count(count)) => total = total.saturating_add(count),
                Ok(other) => warn!(%peer, ?other, "unexpected reply to size request"),
                Err(e) => debug!(%peer, error = %e, "member left out of size"),
            }
        }
        Ok(total)
    }

    /// Remove entries idle for longer than `idle_for_ms` here and, if
    /// configured, on every member. Returns how many were removed.
    pub async fn remove_idle_entries(&self, idle_for_ms: i64) -> Result<u64> {
        let _open = self.enter().await?;

        let local = self.store().remove_expired(now_millis(), idle_for_ms) as u64;
        if !self.config.replication.broadcast_remove_expired {
            return Ok(local);
        }
        let peers = self.membership.peers().len();
        if peers == 0 {
            return Ok(local);
        }

        // one cumulative token for every member's answer
        let responses = self.dispatcher.responses();
        let (token, response) = responses.register_cumulative(peers, u64::saturating_add);
        let request = CommandBody::RemoveExpiredRequest { token, idle_for_ms };
        if let Err(e) = self.dispatcher.broadcast(self.command("", request)).await {
            responses.cancel(token);
            warn!(error = %e, "idle sweep broadcast failed");
            return Ok(local);
        }
        let (remote, complete) = response
            .wait(self.config.replication.remove_expired_timeout())
            .await;
        if !complete {
            responses.cancel(token);
            debug!(
                received = response.received(),
                expected = peers,
                remote,
                "idle sweep timed out, returning partial total"
            );
        }
        Ok(local.saturating_add(remote))
    }

    /// Reject new operations and wait for running ones. Idempotent.
    pub async fn close(&self) {
        let mut closed = self.closed.write().await;
        if !*closed {
            *closed = true;
            info!(member = %self.config.node.instance, store = %self.store_name(), "cache closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    /// Close, stop the dispatcher and drop every local entry
    pub async fn destroy(&self) {
        self.close().await;
        self.dispatcher.shutdown();
        self.store().clear();
        info!(member = %self.config.node.instance, store = %self.store_name(), "cache destroyed");
    }
}

impl<V, C> std::fmt::Debug for ReplicatedCache<V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedCache")
            .field("member", &self.config.node.instance)
            .field("store", &self.config.node.store_name)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
