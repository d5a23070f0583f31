//! Binary encoding of commands
//!
//! Body layouts per opcode:
//! ```text
//! Save                  version:i64 accessed:i64 max_idle:i64 flags:u8 ack:u64 payload
//! Touch                 version:i64 accessed:i64 max_idle:i64 ack:u64
//! LoadRequest           token:u64 min_version:i64
//! LoadResponse          token:u64 found:u8 [version:i64 accessed:i64 max_idle:i64 payload]
//! SimpleAck             token:u64
//! SizeRequest           token:u64
//! SizeResponse          token:u64 count:u64
//! RemoveExpiredRequest  token:u64 idle_for:i64
//! RemoveExpiredResult   token:u64 removed:u64
//! NoOp, Remove, StaleCopyRemove carry no body.
//! ```

use crate::command::{Command, CommandBody, LoadedState, ResponseToken, SaveBody, TouchBody};
use crate::opcode::Opcode;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use replikv_common::{Error, InstanceId, Result};

/// Frame magic ("RK")
pub const FRAME_MAGIC: u16 = 0x524B;

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// magic + proto + opcode + four empty strings
const MIN_FRAME_SIZE: usize = 2 + 1 + 1 + 4 * 4;

/// Save flag: payload is a partial (dirty-field) update
const FLAG_PARTIAL: u8 = 0x01;

/// Encode a command into a frame.
///
/// Fails with [`Error::Protocol`] if a string or payload does not fit a
/// `u32` length prefix.
pub fn encode(command: &Command) -> Result<Bytes> {
    let payload_len = match &command.body {
        CommandBody::Save(body) => body.payload.len(),
        CommandBody::LoadResponse {
            state: Some(state), ..
        } => state.payload.len(),
        _ => 0,
    };
    let mut buf = BytesMut::with_capacity(
        MIN_FRAME_SIZE
            + command.store.len()
            + command.origin.as_str().len()
            + command.target.as_str().len()
            + command.key.len()
            + 48
            + payload_len,
    );

    buf.put_u16_le(FRAME_MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(command.opcode().as_u8());
    put_str(&mut buf, &command.store)?;
    put_str(&mut buf, command.origin.as_str())?;
    put_str(&mut buf, command.target.as_str())?;
    put_str(&mut buf, &command.key)?;

    match &command.body {
        CommandBody::NoOp | CommandBody::Remove | CommandBody::StaleCopyRemove => {}
        CommandBody::Save(body) => {
            buf.put_i64_le(body.version);
            buf.put_i64_le(body.last_accessed_at);
            buf.put_i64_le(body.max_idle_ms);
            buf.put_u8(if body.partial { FLAG_PARTIAL } else { 0 });
            buf.put_u64_le(body.ack_token.0);
            put_bytes(&mut buf, &body.payload)?;
        }
        CommandBody::Touch(body) => {
            buf.put_i64_le(body.version);
            buf.put_i64_le(body.last_accessed_at);
            buf.put_i64_le(body.max_idle_ms);
            buf.put_u64_le(body.ack_token.0);
        }
        CommandBody::LoadRequest { token, min_version } => {
            buf.put_u64_le(token.0);
            buf.put_i64_le(*min_version);
        }
        CommandBody::LoadResponse { token, state } => {
            buf.put_u64_le(token.0);
            match state {
                Some(state) => {
                    buf.put_u8(1);
                    buf.put_i64_le(state.version);
                    buf.put_i64_le(state.last_accessed_at);
                    buf.put_i64_le(state.max_idle_ms);
                    put_bytes(&mut buf, &state.payload)?;
                }
                None => buf.put_u8(0),
            }
        }
        CommandBody::SimpleAck { token } | CommandBody::SizeRequest { token } => {
            buf.put_u64_le(token.0);
        }
        CommandBody::SizeResponse { token, count } => {
            buf.put_u64_le(token.0);
            buf.put_u64_le(*count);
        }
        CommandBody::RemoveExpiredRequest { token, idle_for_ms } => {
            buf.put_u64_le(token.0);
            buf.put_i64_le(*idle_for_ms);
        }
        CommandBody::RemoveExpiredResult { token, removed } => {
            buf.put_u64_le(token.0);
            buf.put_u64_le(*removed);
        }
    }

    Ok(buf.freeze())
}

/// Decode a frame into a command
pub fn decode(frame: Bytes) -> Result<Command> {
    if frame.len() < MIN_FRAME_SIZE {
        return Err(Error::protocol(format!(
            "frame too small: {} bytes",
            frame.len()
        )));
    }

    let mut r = Reader { buf: frame };
    let magic = r.u16()?;
    if magic != FRAME_MAGIC {
        return Err(Error::protocol(format!("bad frame magic {magic:#06x}")));
    }
    let version = r.u8()?;
    if version != PROTOCOL_VERSION {
        return Err(Error::protocol(format!(
            "unsupported protocol version {version}"
        )));
    }
    let raw_opcode = r.u8()?;
    let opcode = Opcode::from_u8(raw_opcode)
        .ok_or_else(|| Error::protocol(format!("unknown opcode {raw_opcode}")))?;

    let store = r.string()?;
    let origin = InstanceId::new(r.string()?);
    let target = InstanceId::new(r.string()?);
    let key = r.string()?;

    let body = match opcode {
        Opcode::NoOp => CommandBody::NoOp,
        Opcode::Remove => CommandBody::Remove,
        Opcode::StaleCopyRemove => CommandBody::StaleCopyRemove,
        Opcode::Save => {
            let version = r.i64()?;
            let last_accessed_at = r.i64()?;
            let max_idle_ms = r.i64()?;
            let flags = r.u8()?;
            let ack_token = ResponseToken(r.u64()?);
            let payload = r.bytes()?;
            CommandBody::Save(SaveBody {
                version,
                last_accessed_at,
                max_idle_ms,
                partial: flags & FLAG_PARTIAL != 0,
                ack_token,
                payload,
            })
        }
        Opcode::Touch => CommandBody::Touch(TouchBody {
            version: r.i64()?,
            last_accessed_at: r.i64()?,
            max_idle_ms: r.i64()?,
            ack_token: ResponseToken(r.u64()?),
        }),
        Opcode::LoadRequest => CommandBody::LoadRequest {
            token: ResponseToken(r.u64()?),
            min_version: r.i64()?,
        },
        Opcode::LoadResponse => {
            let token = ResponseToken(r.u64()?);
            let state = match r.u8()? {
                0 => None,
                1 => Some(LoadedState {
                    version: r.i64()?,
                    last_accessed_at: r.i64()?,
                    max_idle_ms: r.i64()?,
                    payload: r.bytes()?,
                }),
                other => {
                    return Err(Error::protocol(format!("bad load response flag {other}")));
                }
            };
            CommandBody::LoadResponse { token, state }
        }
        Opcode::SimpleAck => CommandBody::SimpleAck {
            token: ResponseToken(r.u64()?),
        },
        Opcode::SizeRequest => CommandBody::SizeRequest {
            token: ResponseToken(r.u64()?),
        },
        Opcode::SizeResponse => CommandBody::SizeResponse {
            token: ResponseToken(r.u64()?),
            count: r.u64()?,
        },
        Opcode::RemoveExpiredRequest => CommandBody::RemoveExpiredRequest {
            token: ResponseToken(r.u64()?),
            idle_for_ms: r.i64()?,
        },
        Opcode::RemoveExpiredResult => CommandBody::RemoveExpiredResult {
            token: ResponseToken(r.u64()?),
            removed: r.u64()?,
        },
    };

    if r.buf.has_remaining() {
        return Err(Error::protocol(format!(
            "{} trailing bytes after {opcode} body",
            r.buf.remaining()
        )));
    }

    Ok(Command {
        store,
        origin,
        target,
        key,
        body,
    })
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    put_bytes(buf, s.as_bytes())
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) -> Result<()> {
    buf.put_u32_le(length_prefix(b.len())?);
    buf.put_slice(b);
    Ok(())
}

fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::protocol(format!("field of {len} bytes exceeds the u32 length prefix")))
}

/// Bounds-checked reads over a frame
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::protocol(format!(
                "truncated frame: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn bytes(&mut self) -> Result<Bytes> {
        self.need(4)?;
        let len = self.buf.get_u32_le() as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|e| Error::protocol(format!("invalid utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(body: CommandBody) -> Command {
        Command::new("sessions", InstanceId::from("node-a"), "user:42", body)
            .to(InstanceId::from("node-b"))
    }

    #[test]
    fn test_save_frame_layout() {
        let cmd = command(CommandBody::Save(SaveBody {
            version: 7,
            last_accessed_at: 1000,
            max_idle_ms: 30_000,
            partial: true,
            ack_token: ResponseToken(5),
            payload: Bytes::from_static(b"hello"),
        }));
        let frame = encode(&cmd).unwrap();

        assert_eq!(&frame[0..2], &FRAME_MAGIC.to_le_bytes());
        assert_eq!(frame[2], PROTOCOL_VERSION);
        assert_eq!(frame[3], Opcode::Save.as_u8());
        // store length prefix
        assert_eq!(&frame[4..8], &8u32.to_le_bytes());
        assert_eq!(&frame[8..16], b"sessions");
        assert!(frame.ends_with(b"hello"));

        assert_eq!(decode(frame).unwrap(), cmd);
    }

    #[test]
    fn test_every_opcode_decodes() {
        let bodies = vec![
            CommandBody::NoOp,
            CommandBody::Touch(TouchBody {
                version: 2,
                last_accessed_at: 5,
                max_idle_ms: -1,
                ack_token: ResponseToken::NONE,
            }),
            CommandBody::Remove,
            CommandBody::LoadRequest {
                token: ResponseToken(1),
                min_version: 3,
            },
            CommandBody::LoadResponse {
                token: ResponseToken(1),
                state: None,
            },
            CommandBody::LoadResponse {
                token: ResponseToken(1),
                state: Some(LoadedState {
                    version: 3,
                    last_accessed_at: 8,
                    max_idle_ms: 0,
                    payload: Bytes::from_static(b"v1"),
                }),
            },
            CommandBody::StaleCopyRemove,
            CommandBody::SimpleAck {
                token: ResponseToken(u64::MAX),
            },
            CommandBody::SizeRequest {
                token: ResponseToken(2),
            },
            CommandBody::SizeResponse {
                token: ResponseToken(2),
                count: 99,
            },
            CommandBody::RemoveExpiredRequest {
                token: ResponseToken(3),
                idle_for_ms: 60_000,
            },
            CommandBody::RemoveExpiredResult {
                token: ResponseToken(3),
                removed: 4,
            },
        ];

        for body in bodies {
            let cmd = command(body);
            assert_eq!(decode(encode(&cmd).unwrap()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let frame = encode(&command(CommandBody::NoOp)).unwrap();

        let mut bad = frame.to_vec();
        bad[0] = 0;
        assert!(matches!(decode(Bytes::from(bad)), Err(Error::Protocol(_))));

        let mut bad = frame.to_vec();
        bad[2] = PROTOCOL_VERSION + 1;
        assert!(matches!(decode(Bytes::from(bad)), Err(Error::Protocol(_))));

        let mut bad = frame.to_vec();
        bad[3] = 200;
        assert!(matches!(decode(Bytes::from(bad)), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let frame = encode(&command(CommandBody::SizeResponse {
            token: ResponseToken(1),
            count: 10,
        }))
        .unwrap();

        for cut in 0..frame.len() {
            assert!(decode(frame.slice(..cut)).is_err(), "cut at {cut} decoded");
        }

        let mut long = frame.to_vec();
        long.push(0);
        assert!(matches!(decode(Bytes::from(long)), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversized_field_is_rejected() {
        assert_eq!(length_prefix(7).unwrap(), 7);
        assert_eq!(length_prefix(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            length_prefix(u32::MAX as usize + 1),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_random_garbage_never_panics() {
        for _ in 0..500 {
            let len = rand::random::<usize>() % 64;
            let mut junk: Vec<u8> = (0..len).map(|_| rand::random()).collect();
            if junk.len() >= 2 {
                junk[0..2].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
            }
            let _ = decode(Bytes::from(junk));
        }
    }
}
