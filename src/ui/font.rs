//! Fixed-width bitmap fonts

use font8x8::{UnicodeFonts, BASIC_FONTS};

use super::surface::PixelBuffer;
use super::GraphicsError;

/// First printable character in an atlas
pub const FIRST_GLYPH: char = ' ';
/// Printable characters per atlas row (ASCII 32..=127)
pub const GLYPH_COUNT: usize = 96;

/// Returned by [`measure`] and [`font_size`] when no font is given
pub const NO_FONT: i32 = -1;

/// One alpha texture holding every printable glyph side by side
///
/// Each texel is one byte of coverage. Glyph `c` lives at column
/// `(c - ' ') * char_width` of the first row of cells.
#[derive(Debug)]
pub struct GlyphAtlas {
    texture: PixelBuffer,
    char_width: usize,
    char_height: usize,
}

impl GlyphAtlas {
    pub fn new(
        texture: PixelBuffer,
        char_width: usize,
        char_height: usize,
    ) -> Result<Self, GraphicsError> {
        if texture.pixel_bytes() != 1 {
            return Err(GraphicsError::PixelSizeMismatch {
                expected: 1,
                actual: texture.pixel_bytes(),
            });
        }
        if char_width == 0 || char_height == 0 {
            return Err(GraphicsError::InvalidGeometry(format!(
                "glyph cell {char_width}x{char_height}"
            )));
        }
        if texture.width() < GLYPH_COUNT * char_width || texture.height() % char_height != 0 {
            return Err(GraphicsError::InvalidGeometry(format!(
                "texture {}x{} cannot hold {} glyphs of {}x{}",
                texture.width(),
                texture.height(),
                GLYPH_COUNT,
                char_width,
                char_height
            )));
        }

        Ok(Self {
            texture,
            char_width,
            char_height,
        })
    }

    /// Font image packed as one row of normal glyphs above one row of bold
    /// glyphs; only the normal row is sampled.
    pub fn from_texture(texture: PixelBuffer) -> Result<Self, GraphicsError> {
        let char_width = texture.width() / GLYPH_COUNT;
        let char_height = texture.height() / 2;
        Self::new(texture, char_width, char_height)
    }

    /// Built-in 8x8 font, each texel repeated `scale` times in both axes
    pub fn builtin(scale: usize) -> Result<Self, GraphicsError> {
        let scale = scale.max(1);
        let too_large = || GraphicsError::InvalidGeometry(format!("font scale {scale}"));
        let cell = scale.checked_mul(8).ok_or_else(too_large)?;
        let width = cell.checked_mul(GLYPH_COUNT).ok_or_else(too_large)?;
        let mut texture = PixelBuffer::new(width, cell, width, 1)?;

        for index in 0..GLYPH_COUNT {
            let Some(c) = char::from_u32(FIRST_GLYPH as u32 + index as u32) else {
                continue;
            };
            let Some(rows) = BASIC_FONTS.get(c) else {
                continue;
            };
            for (gy, bits) in rows.iter().enumerate() {
                for gx in 0..8 {
                    if bits & (1 << gx) == 0 {
                        continue;
                    }
                    for sy in 0..scale {
                        let row = texture.row_mut(gy * scale + sy);
                        let start = index * cell + gx * scale;
                        row[start..start + scale].fill(0xff);
                    }
                }
            }
        }

        Self::new(texture, cell, cell)
    }

    pub fn char_width(&self) -> usize {
        self.char_width
    }

    pub fn char_height(&self) -> usize {
        self.char_height
    }

    pub fn texture(&self) -> &PixelBuffer {
        &self.texture
    }

    /// Texture column where `c` starts, `None` for unprintable characters
    pub(crate) fn glyph_column(&self, c: char) -> Option<usize> {
        let offset = (c as u32).checked_sub(FIRST_GLYPH as u32)? as usize;
        (offset < GLYPH_COUNT).then(|| offset * self.char_width)
    }

    /// Coverage of glyph texel (`x`, `y`) counted from `column`
    pub(crate) fn coverage(&self, column: usize, x: usize, y: usize) -> u8 {
        self.texture.row(y)[column + x]
    }
}

/// Width in pixels of `s` rendered in `font`, or [`NO_FONT`]
pub fn measure(font: Option<&GlyphAtlas>, s: &str) -> i32 {
    match font {
        Some(font) => to_i32(s.chars().count().saturating_mul(font.char_width)),
        None => NO_FONT,
    }
}

/// Glyph cell (width, height) of `font`, or ([`NO_FONT`], [`NO_FONT`])
pub fn font_size(font: Option<&GlyphAtlas>) -> (i32, i32) {
    match font {
        Some(font) => (to_i32(font.char_width), to_i32(font.char_height)),
        None => (NO_FONT, NO_FONT),
    }
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
