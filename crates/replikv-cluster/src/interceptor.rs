//! Command interceptors
//!
//! Interceptors see every command on its way out and on its way in, in
//! registration order. Returning false vetoes the command.

use replikv_proto::Command;
use tracing::debug;

pub trait CommandInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called before a command is encoded and sent. May rewrite it.
    fn on_transmit(&self, _command: &mut Command) -> bool {
        true
    }

    /// Called after a command is decoded, before it executes
    fn on_receive(&self, _command: &Command) -> bool {
        true
    }
}

/// Logs every command at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInterceptor;

impl CommandInterceptor for TracingInterceptor {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn on_transmit(&self, command: &mut Command) -> bool {
        debug!(
            opcode = %command.opcode(),
            store = %command.store,
            key = %command.key,
            target = %command.target,
            "transmit"
        );
        true
    }

    fn on_receive(&self, command: &Command) -> bool {
        debug!(
            opcode = %command.opcode(),
            store = %command.store,
            key = %command.key,
            origin = %command.origin,
            "receive"
        );
        true
    }
}
