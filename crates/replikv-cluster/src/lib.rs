//! replikv Cluster - replication over an asynchronous message bus
//!
//! This crate turns cache operations into replication commands, ships them
//! over a pluggable [`Transport`], executes received commands against the
//! local [`ReplicaStore`](replikv_store::ReplicaStore) and correlates
//! replies with the requests that caused them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   ReplicatedCache    │  put / get / remove / touch / size / remove_idle_entries
//! └──────────┬───────────┘
//!            │ commands
//! ┌──────────▼───────────┐      ┌──────────────────┐
//! │      Dispatcher      │─────▶│ ResponseRegistry │  token → pending reply
//! │ interceptors, pool,  │      └──────────────────┘
//! │ handler registry     │
//! └──────────┬───────────┘
//!            │ frames
//! ┌──────────▼───────────┐
//! │      Transport       │  (external; MemoryNetwork in-process)
//! └──────────────────────┘
//! ```
//!
//! Delivery is at-least-once and unordered; per-key versions make every
//! state change idempotent.

pub mod cache;
pub mod codec;
pub mod correlation;
pub mod dispatcher;
pub mod handler;
pub mod interceptor;
pub mod pool;
pub mod transport;

pub use cache::ReplicatedCache;
pub use codec::{BincodeCodec, FieldMapCodec, RawCodec, ValueCodec};
pub use correlation::{CumulativeResponse, PendingReply, Reply, ResponseRegistry};
pub use dispatcher::Dispatcher;
pub use handler::{CommandHandler, ExecContext, HandlerRegistry};
pub use interceptor::{CommandInterceptor, TracingInterceptor};
pub use pool::WorkerPool;
pub use transport::{InboundHandler, MemoryNetwork, MemoryTransport, Transport};
