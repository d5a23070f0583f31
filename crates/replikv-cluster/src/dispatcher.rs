//! Command dispatcher
//!
//! Single entry point for everything that crosses the bus: outgoing
//! commands pass the interceptor chain, get encoded and are routed to one
//! member or to all of them; incoming frames are decoded, filtered by
//! store name and executed by the handler registered for their opcode.
//! A command that fails or panics is logged and processing continues.

use crate::correlation::{Reply, ResponseRegistry};
use crate::handler::{ExecContext, HandlerRegistry};
use crate::interceptor::CommandInterceptor;
use crate::pool::WorkerPool;
use crate::transport::{InboundHandler, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use replikv_common::{Config, Error, InstanceId, Result};
use replikv_proto::{decode, encode, Command, CommandBody, ResponseToken};
use replikv_store::ReplicaStore;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// By opcode: broadcast requests fan out, everything else is targeted
    Auto,
    All,
}

pub struct Dispatcher {
    local: InstanceId,
    store_name: String,
    store: Arc<ReplicaStore>,
    responses: ResponseRegistry,
    transport: Arc<dyn Transport>,
    handlers: HandlerRegistry,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
    pool: WorkerPool,
    detached: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher with the default handlers. Must be called inside
    /// a tokio runtime.
    pub fn new(config: &Config, store: Arc<ReplicaStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            local: config.node.instance.clone(),
            store_name: config.node.store_name.clone(),
            store,
            responses: ResponseRegistry::new(),
            transport,
            handlers: HandlerRegistry::with_defaults(),
            interceptors: Vec::new(),
            pool: WorkerPool::new(&config.dispatcher),
            detached: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Append an interceptor; interceptors run in the order added
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn local(&self) -> &InstanceId {
        &self.local
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn responses(&self) -> &ResponseRegistry {
        &self.responses
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Build a command originating at this member
    pub fn command(&self, key: impl Into<String>, body: CommandBody) -> Command {
        Command::new(self.store_name.clone(), self.local.clone(), key, body)
    }

    /// Run the transmit interceptors and encode. None if vetoed.
    fn prepare(&self, mut command: Command) -> Result<Option<(Command, Bytes)>> {
        for interceptor in &self.interceptors {
            if !interceptor.on_transmit(&mut command) {
                debug!(
                    interceptor = interceptor.name(),
                    opcode = %command.opcode(),
                    key = %command.key,
                    "transmit vetoed"
                );
                return Ok(None);
            }
        }
        let frame = encode(&command)?;
        Ok(Some((command, frame)))
    }

    async fn transmit(&self, command: Command, route: Route) -> Result<bool> {
        let Some((command, frame)) = self.prepare(command)? else {
            return Ok(false);
        };
        deliver(self.transport.as_ref(), &command, frame, route).await?;
        Ok(true)
    }

    /// Send on the caller's task
    pub async fn send(&self, command: Command) -> Result<()> {
        self.transmit(command, Route::Auto).await.map(|_| ())
    }

    /// Send to every member except this one
    pub async fn broadcast(&self, command: Command) -> Result<()> {
        self.transmit(command, Route::All).await.map(|_| ())
    }

    /// Hand the send to the worker pool.
    ///
    /// Returns once the command is queued; delivery failures are logged.
    pub async fn send_async(&self, command: Command) -> Result<()> {
        let Some((command, frame)) = self.prepare(command)? else {
            return Ok(());
        };
        let transport = Arc::clone(&self.transport);
        self.pool
            .submit(
                async move {
                    if let Err(e) = deliver(transport.as_ref(), &command, frame, Route::Auto).await
                    {
                        warn!(
                            opcode = %command.opcode(),
                            key = %command.key,
                            target = %command.target,
                            error = %e,
                            "asynchronous send failed"
                        );
                    }
                }
                .boxed(),
            )
            .await
    }

    /// Send a command that expects exactly one reply and wait for it.
    ///
    /// `build` receives the token the reply must carry. On timeout, veto or
    /// send failure the token is deregistered.
    pub async fn request(
        &self,
        build: impl FnOnce(ResponseToken) -> Command,
        timeout: Duration,
    ) -> Result<Reply> {
        let pending = self.responses.register();
        let token = pending.token();
        match self.transmit(build(token), Route::Auto).await {
            Ok(true) => pending.wait(&self.responses, timeout).await,
            Ok(false) => {
                self.responses.cancel(token);
                Err(Error::Timeout)
            }
            Err(e) => {
                self.responses.cancel(token);
                Err(e)
            }
        }
    }

    /// Execute a decoded command against the local store, replying to its
    /// origin if the handler produced a reply
    pub async fn execute(&self, command: Command) {
        if command.store != self.store_name {
            trace!(store = %command.store, "ignoring command for another store");
            return;
        }
        for interceptor in &self.interceptors {
            if !interceptor.on_receive(&command) {
                debug!(
                    interceptor = interceptor.name(),
                    opcode = %command.opcode(),
                    key = %command.key,
                    "receive vetoed"
                );
                return;
            }
        }
        let Some(handler) = self.handlers.get(command.opcode()) else {
            warn!(opcode = %command.opcode(), "no handler registered");
            return;
        };

        let ctx = ExecContext {
            local: &self.local,
            store: &self.store,
            responses: &self.responses,
        };
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx, &command)));
        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(
                    opcode = %command.opcode(),
                    key = %command.key,
                    origin = %command.origin,
                    error = %e,
                    "command failed"
                );
                return;
            }
            Err(_) => {
                error!(opcode = %command.opcode(), key = %command.key, "command handler panicked");
                return;
            }
        };

        if let Some(body) = reply {
            let reply = command.reply(&self.local, body);
            if let Err(e) = self.send(reply).await {
                warn!(to = %command.origin, error = %e, "failed to send reply");
            }
        }
    }

    /// Stop handling inbound frames
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Detach and stop the worker pool. Queued sends still go out.
    pub fn shutdown(&self) {
        self.detach();
        self.pool.shutdown();
        debug!(member = %self.local, store = %self.store_name, "dispatcher shut down");
    }
}

async fn deliver(
    transport: &dyn Transport,
    command: &Command,
    frame: Bytes,
    route: Route,
) -> Result<()> {
    if route == Route::All || command.opcode().is_broadcast() {
        return transport.broadcast(frame).await;
    }
    if command.target.is_empty() {
        return Err(Error::NoViableTarget);
    }
    transport.send(&command.target, frame).await
}

#[async_trait]
impl InboundHandler for Dispatcher {
    async fn on_receive(&self, sender: InstanceId, frame: Bytes) {
        if self.is_detached() {
            trace!(%sender, "detached, dropping frame");
            return;
        }
        match decode(frame) {
            Ok(command) => self.execute(command).await,
            Err(e) => warn!(%sender, error = %e, "dropping malformed frame"),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("local", &self.local)
            .field("store_name", &self.store_name)
            .field("handlers", &self.handlers)
            .field("interceptors", &self.interceptors.len())
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::CommandHandler;
    use crate::transport::MemoryNetwork;
    use parking_lot::Mutex;
    use replikv_proto::{Opcode, SaveBody, TouchBody};
    use replikv_store::{MergeEngine, Update};

    fn node(network: &Arc<MemoryNetwork>, id: &str, store_name: &str) -> Arc<Dispatcher> {
        build(network, id, store_name, |d| d)
    }

    fn build(
        network: &Arc<MemoryNetwork>,
        id: &str,
        store_name: &str,
        customize: impl FnOnce(Dispatcher) -> Dispatcher,
    ) -> Arc<Dispatcher> {
        let config = Config::new(id, store_name);
        let store = Arc::new(ReplicaStore::new(MergeEngine::default()));
        let dispatcher = Arc::new(customize(Dispatcher::new(
            &config,
            store,
            Arc::new(network.endpoint(id)),
        )));
        let inbound: Arc<dyn InboundHandler> = dispatcher.clone();
        network.attach(id, Arc::downgrade(&inbound));
        dispatcher
    }

    fn seed(dispatcher: &Dispatcher, key: &str, version: i64, value: &'static str) {
        dispatcher
            .store()
            .apply(key, Update::save(version, 1, 0, Bytes::from_static(value.as_bytes())))
            .unwrap();
    }

    fn load(from: &Dispatcher, to: &str, key: &str) -> impl FnOnce(ResponseToken) -> Command {
        let command = from.command(key, CommandBody::NoOp).to(InstanceId::from(to));
        move |token| Command {
            body: CommandBody::LoadRequest {
                token,
                min_version: 0,
            },
            ..command
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", "sessions");
        let b = node(&network, "b", "sessions");
        seed(&b, "k1", 4, "v4");

        let reply = a
            .request(load(&a, "b", "k1"), Duration::from_secs(2))
            .await
            .unwrap();
        let Reply::Loaded(Some(state)) = reply else {
            panic!("expected a loaded value, got {reply:?}");
        };
        assert_eq!(state.version, 4);
        assert_eq!(state.payload, Bytes::from_static(b"v4"));
        assert_eq!(a.responses().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_other_store_is_ignored() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", "sessions");
        let b = node(&network, "b", "carts");
        seed(&b, "k1", 1, "v1");

        let err = a
            .request(load(&a, "b", "k1"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_no_answer());
        assert_eq!(a.responses().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_targeted_send_needs_a_target() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", "sessions");
        let err = a.send(a.command("k", CommandBody::Remove)).await.unwrap_err();
        assert!(matches!(err, Error::NoViableTarget));
    }

    #[tokio::test]
    async fn test_async_save_and_broadcast() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", "sessions");
        let b = node(&network, "b", "sessions");
        let c = node(&network, "c", "sessions");

        let save = CommandBody::Save(SaveBody {
            version: 1,
            last_accessed_at: 1,
            max_idle_ms: 0,
            partial: false,
            ack_token: ResponseToken::NONE,
            payload: Bytes::from_static(b"x"),
        });
        a.send_async(a.command("k", save).to(InstanceId::from("b")))
            .await
            .unwrap();
        settle().await;
        assert!(b.store().get("k").is_some());
        assert!(c.store().get("k").is_none());

        a.broadcast(a.command("k", CommandBody::Remove)).await.unwrap();
        settle().await;
        assert!(b.store().get("k").is_none());
    }

    #[tokio::test]
    async fn test_shuffled_delivery_converges_on_replica() {
        use rand::seq::SliceRandom;

        let network = MemoryNetwork::new();
        let a = node(&network, "a", "sessions");
        let b = node(&network, "b", "sessions");

        let mut bodies: Vec<CommandBody> = (1..=30)
            .map(|version| {
                if version % 4 == 0 {
                    CommandBody::Touch(TouchBody {
                        version,
                        last_accessed_at: version * 100,
                        max_idle_ms: 0,
                        ack_token: ResponseToken::NONE,
                    })
                } else {
                    CommandBody::Save(SaveBody {
                        version,
                        last_accessed_at: version * 100,
                        max_idle_ms: 0,
                        partial: false,
                        ack_token: ResponseToken::NONE,
                        payload: Bytes::from(format!("v{version}")),
                    })
                }
            })
            .collect();
        // redelivered copies
        bodies.extend(bodies.clone().into_iter().step_by(3));
        bodies.shuffle(&mut rand::thread_rng());

        for body in bodies {
            a.send(a.command("k", body).to(InstanceId::from("b")))
                .await
                .unwrap();
        }
        settle().await;

        let state = b.store().get("k").unwrap().snapshot();
        assert_eq!(state.version, 30);
        assert_eq!(state.raw_value, Some(Bytes::from_static(b"v30")));
        assert_eq!(state.last_accessed_at, 3_000);
        assert_eq!(state.pending_len(), 0);
        assert_eq!(state.replica_location, Some(InstanceId::from("a")));
    }

    struct Counter {
        seen: Mutex<Vec<Opcode>>,
        veto: Option<Opcode>,
    }

    impl CommandInterceptor for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn on_receive(&self, command: &Command) -> bool {
            self.seen.lock().push(command.opcode());
            Some(command.opcode()) != self.veto
        }
    }

    #[tokio::test]
    async fn test_receive_veto() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", "sessions");
        let counter = Arc::new(Counter {
            seen: Mutex::new(Vec::new()),
            veto: Some(Opcode::Remove),
        });
        let b = build(&network, "b", "sessions", |d| {
            d.with_interceptor(counter.clone())
        });
        seed(&b, "k", 1, "v1");

        a.send(a.command("k", CommandBody::Remove).to(InstanceId::from("b")))
            .await
            .unwrap();
        settle().await;
        assert!(b.store().get("k").is_some());
        assert_eq!(*counter.seen.lock(), vec![Opcode::Remove]);
    }

    struct Panics;

    impl CommandHandler for Panics {
        fn execute(&self, _: &ExecContext<'_>, _: &Command) -> Result<Option<CommandBody>> {
            panic!("handler bug")
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_processing() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", "sessions");
        let b = build(&network, "b", "sessions", |d| {
            let mut handlers = HandlerRegistry::with_defaults();
            handlers.register(Opcode::NoOp, Arc::new(Panics));
            d.with_handlers(handlers)
        });
        seed(&b, "k", 1, "v1");
        let to_b = InstanceId::from("b");

        // garbage, a panicking handler, then a real request
        network
            .endpoint("a")
            .send(&to_b, Bytes::from_static(b"not a frame"))
            .await
            .unwrap();
        a.send(a.command("k", CommandBody::NoOp).to(to_b.clone()))
            .await
            .unwrap();
        let reply = a
            .request(load(&a, "b", "k"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Loaded(Some(_))));
    }

    #[tokio::test]
    async fn test_shutdown_detaches() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", "sessions");
        let b = node(&network, "b", "sessions");
        seed(&b, "k", 1, "v1");

        b.shutdown();
        assert!(b.is_detached());
        let err = a
            .request(load(&a, "b", "k"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_no_answer());

        let err = b
            .send_async(b.command("k", CommandBody::Remove).to(InstanceId::from("a")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyClosed));
    }
}
