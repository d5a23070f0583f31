//! Per-opcode command execution
//!
//! Each opcode has one handler. A handler works on the local store and
//! may return a reply body, which the dispatcher sends back to the
//! command's origin.

use crate::correlation::{Reply, ResponseRegistry};
use replikv_common::{now_millis, InstanceId, Result};
use replikv_proto::{
    Command, CommandBody, LoadedState, Opcode, ResponseToken, SaveBody, TouchBody,
};
use replikv_store::{ReplicaStore, Update};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// What a handler may touch while executing
pub struct ExecContext<'a> {
    pub local: &'a InstanceId,
    pub store: &'a ReplicaStore,
    pub responses: &'a ResponseRegistry,
}

pub trait CommandHandler: Send + Sync {
    /// Execute `command`, returning the body of a reply to send back
    fn execute(&self, ctx: &ExecContext<'_>, command: &Command) -> Result<Option<CommandBody>>;
}

fn ack(token: ResponseToken) -> Option<CommandBody> {
    (!token.is_none()).then_some(CommandBody::SimpleAck { token })
}

struct NoOpHandler;

impl CommandHandler for NoOpHandler {
    fn execute(&self, _: &ExecContext<'_>, _: &Command) -> Result<Option<CommandBody>> {
        Ok(None)
    }
}

struct SaveHandler;

impl CommandHandler for SaveHandler {
    fn execute(&self, ctx: &ExecContext<'_>, command: &Command) -> Result<Option<CommandBody>> {
        let CommandBody::Save(SaveBody {
            version,
            last_accessed_at,
            max_idle_ms,
            partial,
            ack_token,
            ref payload,
        }) = command.body
        else {
            return Ok(None);
        };
        let update = if partial {
            Update::partial_save(version, last_accessed_at, max_idle_ms, payload.clone())
        } else {
            Update::save(version, last_accessed_at, max_idle_ms, payload.clone())
        };
        let outcome = ctx
            .store
            .apply_from(&command.key, update, Some(&command.origin))?;
        trace!(key = %command.key, version, ?outcome, "save");
        Ok(ack(ack_token))
    }
}

struct TouchHandler;

impl CommandHandler for TouchHandler {
    fn execute(&self, ctx: &ExecContext<'_>, command: &Command) -> Result<Option<CommandBody>> {
        let CommandBody::Touch(TouchBody {
            version,
            last_accessed_at,
            max_idle_ms,
            ack_token,
        }) = command.body
        else {
            return Ok(None);
        };
        let update = Update::touch(version, last_accessed_at, max_idle_ms);
        let outcome = ctx
            .store
            .apply_from(&command.key, update, Some(&command.origin))?;
        trace!(key = %command.key, version, ?outcome, "touch");
        Ok(ack(ack_token))
    }
}

struct RemoveHandler;

impl CommandHandler for RemoveHandler {
    fn execute(&self, ctx: &ExecContext<'_>, command: &Command) -> Result<Option<CommandBody>> {
        ctx.store.remove(&command.key);
        Ok(None)
    }
}

struct StaleCopyRemoveHandler;

impl CommandHandler for StaleCopyRemoveHandler {
    fn execute(&self, ctx: &ExecContext<'_>, command: &Command) -> Result<Option<CommandBody>> {
        if ctx.store.remove_replica(&command.key) {
            debug!(key = %command.key, from = %command.origin, "dropped stale replica copy");
        }
        Ok(None)
    }
}

struct LoadRequestHandler;

impl CommandHandler for LoadRequestHandler {
    fn execute(&self, ctx: &ExecContext<'_>, command: &Command) -> Result<Option<CommandBody>> {
        let CommandBody::LoadRequest { token, min_version } = command.body else {
            return Ok(None);
        };
        let state = ctx.store.get(&command.key).and_then(|entry| {
            let state = entry.lock();
            let raw = state.raw_value.as_ref().filter(|_| state.is_live())?;
            (state.version >= min_version).then(|| LoadedState {
                version: state.version,
                last_accessed_at: state.last_accessed_at,
                max_idle_ms: state.max_idle_ms,
                payload: raw.clone(),
            })
        });
        Ok(Some(CommandBody::LoadResponse { token, state }))
    }
}

struct SizeRequestHandler;

impl CommandHandler for SizeRequestHandler {
    fn execute(&self, ctx: &ExecContext<'_>, command: &Command) -> Result<Option<CommandBody>> {
        let CommandBody::SizeRequest { token } = command.body else {
            return Ok(None);
        };
        let count = ctx.store.replica_count() as u64;
        Ok(Some(CommandBody::SizeResponse { token, count }))
    }
}

struct RemoveExpiredHandler;

impl CommandHandler for RemoveExpiredHandler {
    fn execute(&self, ctx: &ExecContext<'_>, command: &Command) -> Result<Option<CommandBody>> {
        let CommandBody::RemoveExpiredRequest { token, idle_for_ms } = command.body else {
            return Ok(None);
        };
        let removed = ctx.store.remove_expired(now_millis(), idle_for_ms) as u64;
        Ok(Some(CommandBody::RemoveExpiredResult { token, removed }))
    }
}

/// Resolves the pending request a reply belongs to
struct ReplyHandler;

impl CommandHandler for ReplyHandler {
    fn execute(&self, ctx: &ExecContext<'_>, command: &Command) -> Result<Option<CommandBody>> {
        let (token, reply) = match &command.body {
            CommandBody::SimpleAck { token } => (*token, Reply::Ack),
            CommandBody::LoadResponse { token, state } => (*token, Reply::Loaded(state.clone())),
            CommandBody::SizeResponse { token, count } => (*token, Reply::Count(*count)),
            CommandBody::RemoveExpiredResult { token, removed } => {
                (*token, Reply::Count(*removed))
            }
            _ => return Ok(None),
        };
        if !ctx.responses.resolve(token, reply) {
            trace!(%token, from = %command.origin, "late or duplicate reply");
        }
        Ok(None)
    }
}

/// Opcode to handler table
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Opcode, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    /// Empty table; every command is dropped until handlers are registered
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Table with the built-in handler for every opcode
    pub fn with_defaults() -> Self {
        let reply: Arc<dyn CommandHandler> = Arc::new(ReplyHandler);
        let mut registry = Self::empty();
        registry.register(Opcode::NoOp, Arc::new(NoOpHandler));
        registry.register(Opcode::Save, Arc::new(SaveHandler));
        registry.register(Opcode::Touch, Arc::new(TouchHandler));
        registry.register(Opcode::Remove, Arc::new(RemoveHandler));
        registry.register(Opcode::StaleCopyRemove, Arc::new(StaleCopyRemoveHandler));
        registry.register(Opcode::LoadRequest, Arc::new(LoadRequestHandler));
        registry.register(Opcode::SizeRequest, Arc::new(SizeRequestHandler));
        registry.register(Opcode::RemoveExpiredRequest, Arc::new(RemoveExpiredHandler));
        for opcode in Opcode::ALL.into_iter().filter(|op| op.is_reply()) {
            registry.register(opcode, Arc::clone(&reply));
        }
        registry
    }

    /// Install `handler` for `opcode`, replacing any previous one
    pub fn register(&mut self, opcode: Opcode, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(opcode, handler);
    }

    pub fn get(&self, opcode: Opcode) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(&opcode)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<_> = self.handlers.keys().map(|op| op.as_u8()).collect();
        opcodes.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("opcodes", &opcodes)
            .finish()
    }
}
