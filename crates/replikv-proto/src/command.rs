//! Typed replication commands

use crate::opcode::Opcode;
use bytes::Bytes;
use replikv_common::{InstanceId, Version};
use std::fmt;

/// Correlates a request with its asynchronous reply.
///
/// Zero is reserved for "no reply wanted".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ResponseToken(pub u64);

impl ResponseToken {
    /// The absent token
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ResponseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

impl fmt::Display for ResponseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full or partial state write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveBody {
    pub version: Version,
    pub last_accessed_at: i64,
    pub max_idle_ms: i64,
    /// Payload holds only the changed fields
    pub partial: bool,
    /// Set when the sender waits for a `SimpleAck`
    pub ack_token: ResponseToken,
    pub payload: Bytes,
}

/// Metadata-only update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchBody {
    pub version: Version,
    pub last_accessed_at: i64,
    pub max_idle_ms: i64,
    pub ack_token: ResponseToken,
}

/// Value and metadata carried back by a `LoadResponse`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedState {
    pub version: Version,
    pub last_accessed_at: i64,
    pub max_idle_ms: i64,
    pub payload: Bytes,
}

/// Opcode-specific command fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    NoOp,
    Save(SaveBody),
    Touch(TouchBody),
    Remove,
    LoadRequest {
        token: ResponseToken,
        min_version: Version,
    },
    LoadResponse {
        token: ResponseToken,
        state: Option<LoadedState>,
    },
    StaleCopyRemove,
    SimpleAck {
        token: ResponseToken,
    },
    SizeRequest {
        token: ResponseToken,
    },
    SizeResponse {
        token: ResponseToken,
        count: u64,
    },
    RemoveExpiredRequest {
        token: ResponseToken,
        idle_for_ms: i64,
    },
    RemoveExpiredResult {
        token: ResponseToken,
        removed: u64,
    },
}

impl CommandBody {
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::NoOp => Opcode::NoOp,
            Self::Save(_) => Opcode::Save,
            Self::Touch(_) => Opcode::Touch,
            Self::Remove => Opcode::Remove,
            Self::LoadRequest { .. } => Opcode::LoadRequest,
            Self::LoadResponse { .. } => Opcode::LoadResponse,
            Self::StaleCopyRemove => Opcode::StaleCopyRemove,
            Self::SimpleAck { .. } => Opcode::SimpleAck,
            Self::SizeRequest { .. } => Opcode::SizeRequest,
            Self::SizeResponse { .. } => Opcode::SizeResponse,
            Self::RemoveExpiredRequest { .. } => Opcode::RemoveExpiredRequest,
            Self::RemoveExpiredResult { .. } => Opcode::RemoveExpiredResult,
        }
    }

    /// The token this command carries, if any.
    ///
    /// For requests it is the token the reply must echo; for replies it is
    /// the token being resolved.
    #[must_use]
    pub const fn token(&self) -> Option<ResponseToken> {
        let token = match self {
            Self::Save(body) => body.ack_token,
            Self::Touch(body) => body.ack_token,
            Self::LoadRequest { token, .. }
            | Self::LoadResponse { token, .. }
            | Self::SimpleAck { token }
            | Self::SizeRequest { token }
            | Self::SizeResponse { token, .. }
            | Self::RemoveExpiredRequest { token, .. }
            | Self::RemoveExpiredResult { token, .. } => *token,
            Self::NoOp | Self::Remove | Self::StaleCopyRemove => return None,
        };
        if token.is_none() { None } else { Some(token) }
    }
}

/// A routed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Replicated store (group) the command belongs to
    pub store: String,
    /// Node that created the command
    pub origin: InstanceId,
    /// Node the command is addressed to (empty for broadcasts)
    pub target: InstanceId,
    /// Key the command applies to (empty for store-wide requests)
    pub key: String,
    pub body: CommandBody,
}

impl Command {
    /// Create a command with no target yet
    pub fn new(
        store: impl Into<String>,
        origin: InstanceId,
        key: impl Into<String>,
        body: CommandBody,
    ) -> Self {
        Self {
            store: store.into(),
            origin,
            target: InstanceId::new(""),
            key: key.into(),
            body,
        }
    }

    /// Address the command to a member
    #[must_use]
    pub fn to(mut self, target: InstanceId) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    /// Build a reply addressed back to this command's origin
    #[must_use]
    pub fn reply(&self, local: &InstanceId, body: CommandBody) -> Self {
        Self {
            store: self.store.clone(),
            origin: local.clone(),
            target: self.origin.clone(),
            key: self.key.clone(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_extraction() {
        let save = CommandBody::Save(SaveBody {
            version: 3,
            last_accessed_at: 10,
            max_idle_ms: 0,
            partial: false,
            ack_token: ResponseToken::NONE,
            payload: Bytes::from_static(b"v"),
        });
        assert_eq!(save.token(), None);
        assert_eq!(save.opcode(), Opcode::Save);

        let ack = CommandBody::SimpleAck {
            token: ResponseToken(9),
        };
        assert_eq!(ack.token(), Some(ResponseToken(9)));
        assert_eq!(CommandBody::Remove.token(), None);
    }

    #[test]
    fn test_reply_swaps_direction() {
        let request = Command::new(
            "sessions",
            InstanceId::from("a"),
            "k1",
            CommandBody::SizeRequest {
                token: ResponseToken(4),
            },
        )
        .to(InstanceId::from("b"));

        let reply = request.reply(
            &InstanceId::from("b"),
            CommandBody::SizeResponse {
                token: ResponseToken(4),
                count: 7,
            },
        );
        assert_eq!(reply.origin.as_str(), "b");
        assert_eq!(reply.target.as_str(), "a");
        assert_eq!(reply.store, "sessions");
        assert_eq!(reply.key, "k1");
        assert_eq!(reply.opcode(), Opcode::SizeResponse);
    }
}
