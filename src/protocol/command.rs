//! Command decoding for both protocol families.

use super::framer::{Frame, Opcode};
use super::ProtocolError;
use crate::color::{decode_hex_color, decode_nibble_rgba, Color};

/// Grid addressed by `SIZE` and `PX`.
pub const MAIN_GRID: u8 = 0;
/// Grid addressed by `ISIZE` and `IPX`.
pub const ICON_GRID: u8 = 1;

/// How a pixel write combines with the stored color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    /// Store the color verbatim.
    Replace,
    /// Composite the color over the stored one using its alpha.
    AlphaBlend,
}

/// Protocol family a reply is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyForm {
    Binary,
    /// Text reply led by the request's keyword.
    Text(&'static str),
}

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Info,
    Size {
        grid: u8,
        form: ReplyForm,
    },
    GetPixel {
        grid: u8,
        x: u16,
        y: u16,
        form: ReplyForm,
    },
    SetPixel {
        grid: u8,
        x: u16,
        y: u16,
        color: Color,
        mode: BlendMode,
    },
    /// Framed but unused opcodes (the sound commands).
    Reserved {
        opcode: Opcode,
    },
}

impl Command {
    pub fn decode(frame: Frame<'_>) -> Result<Command, ProtocolError> {
        match frame {
            Frame::Binary(bytes) => decode_binary(bytes),
            Frame::Text(line) => decode_text(line),
        }
    }
}

fn decode_binary(cmd: &[u8]) -> Result<Command, ProtocolError> {
    let opcode = Opcode::from_byte(cmd[0]).ok_or(ProtocolError::UnknownCommand)?;
    if cmd.len() != opcode.frame_len() {
        return Err(ProtocolError::UnknownCommand);
    }

    let grid = cmd[0] & 0x0f;
    let set = |color: Color, mode: BlendMode| Command::SetPixel {
        grid,
        x: u16::from_be_bytes([cmd[1], cmd[2]]),
        y: u16::from_be_bytes([cmd[3], cmd[4]]),
        color,
        mode,
    };

    Ok(match opcode {
        Opcode::Info => Command::Info,
        Opcode::Size => Command::Size {
            grid,
            form: ReplyForm::Binary,
        },
        Opcode::GetPixel => Command::GetPixel {
            grid,
            x: u16::from_be_bytes([cmd[1], cmd[2]]),
            y: u16::from_be_bytes([cmd[3], cmd[4]]),
            form: ReplyForm::Binary,
        },
        Opcode::SetGrayscale => set(Color::gray(cmd[5]), BlendMode::Replace),
        Opcode::SetHalfRgba => set(decode_nibble_rgba(cmd[5], cmd[6]), BlendMode::AlphaBlend),
        Opcode::SetRgb => set(Color::rgb(cmd[5], cmd[6], cmd[7]), BlendMode::Replace),
        Opcode::SetRgba => set(
            Color::rgba(cmd[5], cmd[6], cmd[7], cmd[8]),
            BlendMode::AlphaBlend,
        ),
        Opcode::SoundLoop | Opcode::SoundOnce => Command::Reserved { opcode },
    })
}

fn decode_text(line: &[u8]) -> Result<Command, ProtocolError> {
    let end = line
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |pos| pos + 1);
    let line = &line[..end];

    match line {
        b"HELP" => Ok(Command::Help),
        b"SIZE" => Ok(Command::Size {
            grid: MAIN_GRID,
            form: ReplyForm::Text("SIZE"),
        }),
        b"ISIZE" => Ok(Command::Size {
            grid: ICON_GRID,
            form: ReplyForm::Text("ISIZE"),
        }),
        _ => {
            if let Some(args) = line.strip_prefix(b"PX ") {
                decode_pixel(MAIN_GRID, "PX", args)
            } else if let Some(args) = line.strip_prefix(b"IPX ") {
                decode_pixel(ICON_GRID, "IPX", args)
            } else {
                Err(ProtocolError::UnknownCommand)
            }
        }
    }
}

/// Decode `<x> <y>[ <hex>]`. Without a color the command is a read.
fn decode_pixel(grid: u8, keyword: &'static str, args: &[u8]) -> Result<Command, ProtocolError> {
    let count = args.split(|&b| b == b' ').count();
    if !(2..=3).contains(&count) {
        return Err(ProtocolError::WrongTokenCount(count));
    }

    let mut tokens = args.split(|&b| b == b' ');
    let x = parse_coord(tokens.next())?;
    let y = parse_coord(tokens.next())?;

    match tokens.next() {
        None => Ok(Command::GetPixel {
            grid,
            x,
            y,
            form: ReplyForm::Text(keyword),
        }),
        Some(hex) => {
            let color = decode_hex_color(hex)?;
            let mode = if hex.len() == 8 {
                BlendMode::AlphaBlend
            } else {
                BlendMode::Replace
            };
            Ok(Command::SetPixel {
                grid,
                x,
                y,
                color,
                mode,
            })
        }
    }
}

fn parse_coord(token: Option<&[u8]>) -> Result<u16, ProtocolError> {
    let token = token.ok_or(ProtocolError::InvalidNumber)?;
    if token.is_empty() || !token.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::InvalidNumber);
    }
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError::InvalidNumber)
}
