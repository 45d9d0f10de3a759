//! Command execution against the canvases.
//!
//! Replies are appended to a caller-owned buffer so that a whole read batch
//! can be answered with one socket write.

use crate::canvas::{CanvasError, Canvases};
use crate::color::write_hex_color;
use crate::protocol::{BlendMode, Command, ReplyForm};
use bytes::{BufMut, BytesMut};
use std::fmt::Write;
use std::sync::Arc;
use tracing::trace;

pub const HELP_TEXT: &[u8] = b"\
This is flutgrid, a pixelflut server.
Text commands (one per line):
  HELP                this message
  SIZE / ISIZE        canvas size of the main / icon grid
  PX <x> <y>          read a pixel, replies PX <x> <y> <rrggbb>
  PX <x> <y> <hex>    write a pixel, hex is gg, rrggbb or rrggbbaa
  IPX ...             the same on the icon grid
The binary protocol is also supported, see the README.
";

/// Executes decoded commands.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    canvases: Arc<Canvases>,
}

impl Dispatcher {
    pub fn new(canvases: Arc<Canvases>) -> Self {
        Self { canvases }
    }

    #[cfg(test)]
    pub fn canvases(&self) -> &Arc<Canvases> {
        &self.canvases
    }

    /// Run one command, appending its reply (if any) to `out`.
    ///
    /// Nothing is appended when the command fails.
    pub fn dispatch(&self, command: &Command, out: &mut BytesMut) -> Result<(), CanvasError> {
        match *command {
            Command::Help => out.extend_from_slice(HELP_TEXT),

            Command::Info => {
                let _ = writeln!(out, "There are {} grids", self.canvases.len());
            }

            Command::Size { grid, form } => {
                let canvas = self.canvases.get(grid)?;
                match form {
                    ReplyForm::Binary => {
                        out.put_u16(canvas.width());
                        out.put_u16(canvas.height());
                    }
                    ReplyForm::Text(keyword) => {
                        let _ = writeln!(out, "{} {} {}", keyword, canvas.width(), canvas.height());
                    }
                }
            }

            Command::GetPixel { grid, x, y, form } => {
                let color = self.canvases.get(grid)?.get(x, y)?;
                match form {
                    ReplyForm::Binary => out.extend_from_slice(&[color.r(), color.g(), color.b()]),
                    ReplyForm::Text(keyword) => {
                        let _ = write!(out, "{} {} {} ", keyword, x, y);
                        write_hex_color(color, out);
                        out.put_u8(b'\n');
                    }
                }
            }

            Command::SetPixel {
                grid,
                x,
                y,
                color,
                mode,
            } => {
                let canvas = self.canvases.get(grid)?;
                match mode {
                    BlendMode::Replace => canvas.set_exact(x, y, color)?,
                    BlendMode::AlphaBlend => canvas.set(x, y, color)?,
                }
            }

            Command::Reserved { opcode } => {
                trace!(?opcode, "Ignoring reserved opcode");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Fill;
    use crate::color::Color;
    use crate::protocol::framer::Frame;
    use crate::protocol::Command;

    fn dispatcher() -> Dispatcher {
        let mut canvases = Canvases::new();
        canvases.create(800, 600, Fill::Solid(Color::BLACK)).unwrap();
        canvases.create(32, 32, Fill::Solid(Color::BLACK)).unwrap();
        Dispatcher::new(Arc::new(canvases))
    }

    fn run(d: &Dispatcher, line: &[u8]) -> Result<BytesMut, CanvasError> {
        let mut out = BytesMut::new();
        let command = Command::decode(Frame::Text(line)).unwrap();
        d.dispatch(&command, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_text_size() {
        let d = dispatcher();
        assert_eq!(&run(&d, b"SIZE").unwrap()[..], b"SIZE 800 600\n");
        assert_eq!(&run(&d, b"ISIZE").unwrap()[..], b"ISIZE 32 32\n");
    }

    #[test]
    fn test_text_write_then_read() {
        let d = dispatcher();
        assert!(run(&d, b"PX 10 10 ff0000").unwrap().is_empty());
        assert_eq!(&run(&d, b"PX 10 10").unwrap()[..], b"PX 10 10 ff0000\n");
        assert_eq!(&run(&d, b"IPX 10 10").unwrap()[..], b"IPX 10 10 000000\n");
    }

    #[test]
    fn test_read_is_opaque() {
        let d = dispatcher();
        run(&d, b"PX 1 1 ffffff80").unwrap();
        // (0 * 127 + 255 * 128) / 255 = 128
        assert_eq!(&run(&d, b"PX 1 1").unwrap()[..], b"PX 1 1 808080\n");
    }

    #[test]
    fn test_binary_replies() {
        let d = dispatcher();
        let mut out = BytesMut::new();

        let size = Command::decode(Frame::Binary(&[0x20])).unwrap();
        d.dispatch(&size, &mut out).unwrap();
        assert_eq!(&out[..], &[0x03, 0x20, 0x02, 0x58]);

        out.clear();
        let set = Command::decode(Frame::Binary(&[0xB0, 0, 5, 0, 6, 1, 2, 3])).unwrap();
        d.dispatch(&set, &mut out).unwrap();
        assert!(out.is_empty());

        let get = Command::decode(Frame::Binary(&[0x80, 0, 5, 0, 6])).unwrap();
        d.dispatch(&get, &mut out).unwrap();
        assert_eq!(&out[..], &[1, 2, 3]);

        out.clear();
        d.dispatch(&Command::Info, &mut out).unwrap();
        assert_eq!(&out[..], b"There are 2 grids\n");
    }

    #[test]
    fn test_help() {
        let d = dispatcher();
        assert_eq!(&run(&d, b"HELP").unwrap()[..], HELP_TEXT);
    }

    #[test]
    fn test_errors_emit_nothing() {
        let d = dispatcher();
        let mut out = BytesMut::new();

        let get = Command::decode(Frame::Text(b"PX 800 0")).unwrap();
        assert!(matches!(
            d.dispatch(&get, &mut out),
            Err(CanvasError::OutOfBounds { x: 800, .. })
        ));

        let unknown = Command::decode(Frame::Binary(&[0x25])).unwrap();
        assert_eq!(d.dispatch(&unknown, &mut out), Err(CanvasError::UnknownGrid(5)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_writes_count_mutations() {
        let d = dispatcher();
        run(&d, b"PX 0 0 ff").unwrap();
        run(&d, b"IPX 0 0 ff").unwrap();
        run(&d, b"PX 0 0").unwrap();
        let canvases = d.canvases();
        assert_eq!(canvases.get(0).unwrap().mutations(), 1);
        assert_eq!(canvases.get(1).unwrap().mutations(), 1);
    }
}
