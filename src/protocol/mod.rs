//! Pixelflut wire protocol.
//!
//! Two protocol families share one TCP stream and are told apart by the
//! first byte of every frame:
//! - text: `H`, `I`, `P` or `S` starts a newline-terminated command line
//! - binary: the high nibble is an opcode with a fixed frame length, the low
//!   nibble addresses a grid
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  SIZE\n
//! Response: SIZE 800 600\n
//!
//! Request:  PX 10 10 ff0000\n
//! Request:  PX 10 10\n
//! Response: PX 10 10 ff0000\n
//!
//! Request:  b3 00 0a 00 0a ff 00 00     (SetRGB on grid 3)
//! ```

pub mod command;
pub mod framer;

pub use command::{BlendMode, Command, ReplyForm};
pub use framer::{Framer, Scan};

use crate::color::ColorError;

/// Malformed frame errors. Any of these closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command")]
    UnknownCommand,

    #[error("expected 2 or 3 arguments, got {0}")]
    WrongTokenCount(usize),

    #[error("invalid coordinate")]
    InvalidNumber,

    #[error("invalid color: {0}")]
    Color(#[from] ColorError),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
}
