//! Incremental frame scanner.
//!
//! The scanner never consumes anything itself: it looks at the bytes
//! buffered so far and reports either a complete frame together with its
//! length, or that more bytes are needed. The caller advances its buffer.

use super::ProtocolError;

/// Default cap on a text line, terminator included.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024;

/// Binary opcodes, taken from the high nibble of the first frame byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Info,
    Size,
    GetPixel,
    SetGrayscale,
    SetHalfRgba,
    SetRgb,
    SetRgba,
    SoundLoop,
    SoundOnce,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte >> 4 {
            0x1 => Some(Opcode::Info),
            0x2 => Some(Opcode::Size),
            0x8 => Some(Opcode::GetPixel),
            0x9 => Some(Opcode::SetGrayscale),
            0xA => Some(Opcode::SetHalfRgba),
            0xB => Some(Opcode::SetRgb),
            0xC => Some(Opcode::SetRgba),
            0xE => Some(Opcode::SoundLoop),
            0xF => Some(Opcode::SoundOnce),
            _ => None,
        }
    }

    /// Total frame length, opcode byte included.
    pub fn frame_len(self) -> usize {
        match self {
            Opcode::Info | Opcode::Size => 1,
            Opcode::GetPixel | Opcode::SoundLoop | Opcode::SoundOnce => 5,
            Opcode::SetGrayscale => 6,
            Opcode::SetHalfRgba => 7,
            Opcode::SetRgb => 8,
            Opcode::SetRgba => 9,
        }
    }
}

/// First bytes that start a text command line.
fn is_text_marker(byte: u8) -> bool {
    matches!(byte, b'H' | b'I' | b'P' | b'S')
}

/// One complete command frame, borrowed from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// The whole fixed-length binary frame.
    Binary(&'a [u8]),
    /// A text line without its `\n` or `\r\n` terminator.
    Text(&'a [u8]),
}

/// Outcome of scanning the read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Scan<'a> {
    /// A complete frame and the number of buffered bytes it spans.
    Frame(Frame<'a>, usize),
    /// Not enough bytes buffered yet.
    Incomplete,
    /// The first byte is neither a text marker nor a known opcode.
    Unrecognized,
    /// The buffered bytes can never form a valid frame.
    Invalid(ProtocolError),
}

/// Per-connection frame scanner.
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    max_line_length: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Framer {
    pub fn new(max_line_length: usize) -> Self {
        Self { max_line_length }
    }

    /// Scan the front of `input` for one frame.
    ///
    /// `eof` tells the scanner the peer has finished sending, in which case
    /// an unterminated text line is returned as the final frame.
    pub fn next_frame<'a>(&self, input: &'a [u8], eof: bool) -> Scan<'a> {
        let Some(&first) = input.first() else {
            return Scan::Incomplete;
        };

        if is_text_marker(first) {
            return self.next_line(input, eof);
        }

        match Opcode::from_byte(first) {
            Some(opcode) => {
                let len = opcode.frame_len();
                if input.len() < len {
                    Scan::Incomplete
                } else {
                    Scan::Frame(Frame::Binary(&input[..len]), len)
                }
            }
            None => Scan::Unrecognized,
        }
    }

    fn next_line<'a>(&self, input: &'a [u8], eof: bool) -> Scan<'a> {
        let window = &input[..input.len().min(self.max_line_length)];

        match window.iter().position(|&b| b == b'\n') {
            Some(pos) => Scan::Frame(Frame::Text(strip_cr(&input[..pos])), pos + 1),
            None if input.len() >= self.max_line_length => {
                Scan::Invalid(ProtocolError::LineTooLong(self.max_line_length))
            }
            None if eof => Scan::Frame(Frame::Text(strip_cr(input)), input.len()),
            None => Scan::Incomplete,
        }
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
