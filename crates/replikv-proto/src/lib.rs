//! replikv Proto - replication commands and their wire format
//!
//! Commands are the only unit of cross-node communication. Each one is
//! framed independently so the transport may deliver them in any order,
//! more than once, or not at all.
//!
//! Frame format (all integers little-endian):
//! ```text
//! +-------+-------+--------+-------+--------+--------+-----+------+
//! | Magic | Proto | Opcode | Store | Origin | Target | Key | Body |
//! | 2B    | 1B    | 1B     | str   | str    | str    | str | var  |
//! +-------+-------+--------+-------+--------+--------+-----+------+
//! ```
//! `str` and payload bytes are a `u32` length followed by the bytes.

pub mod command;
pub mod opcode;
pub mod wire;

pub use command::{Command, CommandBody, LoadedState, ResponseToken, SaveBody, TouchBody};
pub use opcode::Opcode;
pub use wire::{decode, encode, FRAME_MAGIC, PROTOCOL_VERSION};
