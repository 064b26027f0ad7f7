//! Conductor Protocol - Newline-delimited text protocol
//!
//! The wire format is deliberately plain so a server can be driven from
//! telnet or netcat:
//! - every message is one UTF-8 line terminated by `\n`
//! - a stray `\r` at either end of a line is tolerated and stripped
//! - no length prefix, no binary framing
//!
//! This crate provides line framing helpers, client command parsing and the
//! lines the server sends.

pub mod command;
pub mod line;
pub mod message;

pub use command::{ClientCommand, QUIT_COMMAND};
pub use line::{ensure_terminated, strip_terminator, LINE_TERMINATOR};
pub use message::ServerMessage;
