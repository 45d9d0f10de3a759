//! Packed RGBA colors and their wire encodings.
//!
//! The text protocol carries colors as 2, 6 or 8 hex digits (gray, RGB,
//! RGBA). The binary protocol carries them as raw channel bytes or as two
//! nibble-packed bytes. Read replies never carry alpha.

use bytes::BytesMut;
use std::fmt;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// A packed RGBA color, red in the most significant byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color(u32);

impl Color {
    #[cfg(test)]
    pub const BLACK: Color = Color::rgb(0, 0, 0);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Color((r as u32) << 24 | (g as u32) << 16 | (b as u32) << 8 | a as u32)
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Color::rgba(r, g, b, 0xff)
    }

    pub const fn gray(v: u8) -> Self {
        Color::rgb(v, v, v)
    }

    pub const fn from_packed(packed: u32) -> Self {
        Color(packed)
    }

    pub const fn packed(self) -> u32 {
        self.0
    }

    pub const fn r(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub const fn g(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn b(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn a(self) -> u8 {
        self.0 as u8
    }

    /// The same color with alpha forced to 255.
    pub const fn opaque(self) -> Self {
        Color(self.0 | 0xff)
    }

    /// Composite `self` over `dst` (source-over), weighted by our own alpha.
    ///
    /// The result is always opaque.
    pub fn over(self, dst: Color) -> Color {
        let a = self.a() as u32;
        let s = 255 - a;
        let mix = |stored: u8, incoming: u8| ((stored as u32 * s + incoming as u32 * a) / 255) as u8;
        Color::rgb(
            mix(dst.r(), self.r()),
            mix(dst.g(), self.g()),
            mix(dst.b(), self.b()),
        )
    }
}

impl fmt::Debug for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Color(#{:08x})", self.0)
    }
}

/// Color decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ColorError {
    #[error("color must be 2, 6 or 8 hex digits, got {0}")]
    InvalidColorLength(usize),

    #[error("color is not valid hex")]
    InvalidHexEncoding,
}

fn hex_value(digit: u8) -> Result<u8, ColorError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(ColorError::InvalidHexEncoding),
    }
}

/// Decode a text-protocol hex color.
///
/// One byte is gray, three bytes are RGB and four bytes are RGBA.
pub fn decode_hex_color(text: &[u8]) -> Result<Color, ColorError> {
    if !matches!(text.len(), 2 | 6 | 8) {
        return Err(ColorError::InvalidColorLength(text.len()));
    }

    let mut channels = [0u8; 4];
    for (slot, pair) in channels.iter_mut().zip(text.chunks_exact(2)) {
        *slot = hex_value(pair[0])? << 4 | hex_value(pair[1])?;
    }

    Ok(match text.len() {
        2 => Color::gray(channels[0]),
        6 => Color::rgb(channels[0], channels[1], channels[2]),
        _ => Color::rgba(channels[0], channels[1], channels[2], channels[3]),
    })
}

/// Decode the two-byte nibble form: `RG BA`, each nibble doubled to a byte.
pub fn decode_nibble_rgba(b1: u8, b2: u8) -> Color {
    let widen = |nibble: u8| nibble << 4 | nibble;
    Color::rgba(widen(b1 >> 4), widen(b1 & 0x0f), widen(b2 >> 4), widen(b2 & 0x0f))
}

/// Lower-case hex of R, G and B. Alpha is omitted.
pub fn encode_hex_color(color: Color) -> String {
    let mut buf = BytesMut::with_capacity(6);
    write_hex_color(color, &mut buf);
    // Only ASCII hex digits were written.
    String::from_utf8_lossy(&buf).into_owned()
}

/// Append the six hex digits of [`encode_hex_color`] to `out`.
pub fn write_hex_color(color: Color, out: &mut BytesMut) {
    for channel in [color.r(), color.g(), color.b()] {
        out.extend_from_slice(&[
            HEX_DIGITS[(channel >> 4) as usize],
            HEX_DIGITS[(channel & 0x0f) as usize],
        ]);
    }
}
