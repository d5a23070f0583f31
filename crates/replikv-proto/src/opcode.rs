//! Command opcodes

use std::fmt;

/// One opcode per command type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    /// Keep-alive / padding
    NoOp = 0,
    /// Full or partial state write
    Save = 1,
    /// Metadata-only update
    Touch = 2,
    /// Delete a key on the replica
    Remove = 3,
    /// Pull the current value from a holder
    LoadRequest = 4,
    /// Value (or absence) sent back to a loader
    LoadResponse = 5,
    /// Drop a replica left behind after placement moved
    StaleCopyRemove = 6,
    /// Acknowledge a synchronous write
    SimpleAck = 7,
    /// Ask a member for its replica count
    SizeRequest = 8,
    /// Replica count answer
    SizeResponse = 9,
    /// Ask a member to sweep idle entries
    RemoveExpiredRequest = 10,
    /// Number of entries a sweep removed
    RemoveExpiredResult = 11,
}

impl Opcode {
    /// Every opcode, in wire order
    pub const ALL: [Self; 12] = [
        Self::NoOp,
        Self::Save,
        Self::Touch,
        Self::Remove,
        Self::LoadRequest,
        Self::LoadResponse,
        Self::StaleCopyRemove,
        Self::SimpleAck,
        Self::SizeRequest,
        Self::SizeResponse,
        Self::RemoveExpiredRequest,
        Self::RemoveExpiredResult,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(usize::from(v)).copied()
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Replies resolve a token on the node that sent the request
    #[must_use]
    pub const fn is_reply(self) -> bool {
        matches!(
            self,
            Self::LoadResponse | Self::SimpleAck | Self::SizeResponse | Self::RemoveExpiredResult
        )
    }

    /// Requests that are fanned out to every member under one token
    #[must_use]
    pub const fn is_broadcast(self) -> bool {
        matches!(self, Self::RemoveExpiredRequest)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoOp => "noop",
            Self::Save => "save",
            Self::Touch => "touch",
            Self::Remove => "remove",
            Self::LoadRequest => "load_request",
            Self::LoadResponse => "load_response",
            Self::StaleCopyRemove => "stale_copy_remove",
            Self::SimpleAck => "simple_ack",
            Self::SizeRequest => "size_request",
            Self::SizeResponse => "size_response",
            Self::RemoveExpiredRequest => "remove_expired_request",
            Self::RemoveExpiredResult => "remove_expired_result",
        };
        f.write_str(name)
    }
}
