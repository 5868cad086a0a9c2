//! Drawing primitives over a backend's back buffer

use super::font::GlyphAtlas;
use super::surface::PixelBuffer;
use super::{Color, GraphicsError, PixelFormat, Rotation};

const BPP: usize = PixelFormat::BYTES_PER_PIXEL;

/// Stateful view onto the current back buffer
///
/// Coordinates are logical: (0, 0) is the top-left corner after rotation,
/// and [`Canvas::width`]/[`Canvas::height`] match [`super::Graphics::geometry`].
/// Rotation is applied per pixel as content is written.
pub struct Canvas<'a> {
    surface: &'a mut PixelBuffer,
    format: PixelFormat,
    rotation: Rotation,
    color: &'a mut Color,
}

impl<'a> Canvas<'a> {
    pub(crate) fn new(
        surface: &'a mut PixelBuffer,
        format: PixelFormat,
        rotation: Rotation,
        color: &'a mut Color,
    ) -> Self {
        Self {
            surface,
            format,
            rotation,
            color,
        }
    }

    pub fn width(&self) -> usize {
        if self.rotation.swaps_axes() {
            self.surface.height()
        } else {
            self.surface.width()
        }
    }

    pub fn height(&self) -> usize {
        if self.rotation.swaps_axes() {
            self.surface.width()
        } else {
            self.surface.height()
        }
    }

    pub fn color(&self) -> Color {
        *self.color
    }

    /// Color for subsequent clear, fill and text calls
    pub fn set_color(&mut self, r: u8, g: u8, b: u8, a: u8) {
        *self.color = Color::new(r, g, b, a);
    }

    /// Overwrite the whole buffer with the current color
    pub fn clear(&mut self) {
        let px = self.format.pack(*self.color);
        for y in 0..self.surface.height() {
            for chunk in self.surface.row_mut(y).chunks_exact_mut(BPP) {
                chunk.copy_from_slice(&px);
            }
        }
    }

    /// Fill `[x1, x2) x [y1, y2)`, clamped to the buffer
    pub fn fill(&mut self, x1: i32, y1: i32, x2: i32, y2: i32) {
        let (x1, x2) = clamp_span(x1, x2, self.width());
        let (y1, y2) = clamp_span(y1, y2, self.height());
        if x1 >= x2 || y1 >= y2 {
            return;
        }

        let px = self.format.pack(*self.color);
        let alpha = self.color.a;
        for y in y1..y2 {
            for x in x1..x2 {
                self.put(x, y, px, alpha);
            }
        }
    }

    /// Copy a `w x h` region of `source` at (`sx`, `sy`) to (`dx`, `dy`).
    ///
    /// The source rectangle must lie inside `source`; nothing is written
    /// otherwise. The destination is clipped to the buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn blit(
        &mut self,
        source: &PixelBuffer,
        sx: usize,
        sy: usize,
        w: usize,
        h: usize,
        dx: i32,
        dy: i32,
    ) -> Result<(), GraphicsError> {
        if source.pixel_bytes() != BPP {
            return Err(GraphicsError::PixelSizeMismatch {
                expected: BPP,
                actual: source.pixel_bytes(),
            });
        }
        let fits = |start: usize, len: usize, limit: usize| {
            start.checked_add(len).is_some_and(|end| end <= limit)
        };
        if !fits(sx, w, source.width()) || !fits(sy, h, source.height()) {
            return Err(GraphicsError::BlitOutOfBounds {
                sx,
                sy,
                w,
                h,
                src_width: source.width(),
                src_height: source.height(),
            });
        }

        for row in 0..h {
            let Some(y) = offset(dy, row, self.height()) else {
                continue;
            };
            let src_row = source.row(sy + row);
            for col in 0..w {
                let Some(x) = offset(dx, col, self.width()) else {
                    continue;
                };
                let start = (sx + col) * BPP;
                let mut px = [0u8; BPP];
                px.copy_from_slice(&src_row[start..start + BPP]);
                self.put(x, y, px, u8::MAX);
            }
        }
        Ok(())
    }

    /// Stamp `s` with its top-left corner at (`x`, `y`).
    ///
    /// Stops at the first glyph that would not fit entirely. Bold text is
    /// stamped a second time one pixel to the right.
    pub fn text(
        &mut self,
        font: Option<&GlyphAtlas>,
        x: i32,
        y: i32,
        s: &str,
        bold: bool,
    ) -> Result<(), GraphicsError> {
        let font = font.ok_or(GraphicsError::NoFont)?;
        let (cw, ch) = (font.char_width(), font.char_height());

        let mut x = i64::from(x);
        let y = i64::from(y);
        for c in s.chars() {
            if !self.fits(x, y, cw, ch) {
                break;
            }
            if let Some(column) = font.glyph_column(c) {
                // fits() guarantees both coordinates are non-negative.
                let (gx, gy) = (x as usize, y as usize);
                self.stamp(gx, gy, cw, ch, |tx, ty| font.coverage(column, tx, ty));
                if bold {
                    self.stamp(gx + 1, gy, cw, ch, |tx, ty| font.coverage(column, tx, ty));
                }
            }
            x += cw as i64;
        }
        Ok(())
    }

    /// Stamp an alpha surface (one byte per pixel) in the current color
    pub fn texticon(&mut self, x: i32, y: i32, icon: &PixelBuffer) -> Result<(), GraphicsError> {
        if icon.pixel_bytes() != 1 {
            return Err(GraphicsError::PixelSizeMismatch {
                expected: 1,
                actual: icon.pixel_bytes(),
            });
        }
        let (w, h) = (icon.width(), icon.height());
        if !self.fits(i64::from(x), i64::from(y), w, h) {
            return Ok(());
        }
        self.stamp(x as usize, y as usize, w, h, |tx, ty| icon.row(ty)[tx]);
        Ok(())
    }

    fn fits(&self, x: i64, y: i64, w: usize, h: usize) -> bool {
        x >= 0
            && y >= 0
            && x + w as i64 <= self.width() as i64
            && y + h as i64 <= self.height() as i64
    }

    fn stamp<F>(&mut self, x: usize, y: usize, w: usize, h: usize, coverage: F)
    where
        F: Fn(usize, usize) -> u8,
    {
        let px = self.format.pack(*self.color);
        let color_alpha = u32::from(self.color.a);
        for ty in 0..h {
            for tx in 0..w {
                let (lx, ly) = (x + tx, y + ty);
                if lx >= self.width() || ly >= self.height() {
                    continue;
                }
                let alpha = (u32::from(coverage(tx, ty)) * color_alpha / 255) as u8;
                if alpha > 0 {
                    self.put(lx, ly, px, alpha);
                }
            }
        }
    }

    /// Map a logical coordinate to the physical buffer
    fn physical(&self, x: usize, y: usize) -> (usize, usize) {
        let (w, h) = (self.surface.width(), self.surface.height());
        match self.rotation {
            Rotation::None => (x, y),
            Rotation::Right => (w - 1 - y, x),
            Rotation::Down => (w - 1 - x, h - 1 - y),
            Rotation::Left => (y, h - 1 - x),
        }
    }

    fn put(&mut self, x: usize, y: usize, px: [u8; BPP], alpha: u8) {
        let (px_x, px_y) = self.physical(x, y);
        let start = px_y * self.surface.row_bytes() + px_x * BPP;
        let dst = &mut self.surface.data_mut()[start..start + BPP];
        if alpha == u8::MAX {
            dst.copy_from_slice(&px);
            return;
        }
        let a = u32::from(alpha);
        for (d, s) in dst.iter_mut().zip(px) {
            *d = ((u32::from(s) * a + u32::from(*d) * (255 - a)) / 255) as u8;
        }
    }
}

fn clamp_span(start: i32, end: i32, limit: usize) -> (usize, usize) {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let clamp = |v: i32| i64::from(v).clamp(0, limit) as usize;
    (clamp(start), clamp(end))
}

fn offset(base: i32, delta: usize, limit: usize) -> Option<usize> {
    let pos = i64::from(base) + i64::try_from(delta).ok()?;
    usize::try_from(pos).ok().filter(|&p| p < limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(width: usize, height: usize) -> PixelBuffer {
        PixelBuffer::new(width, height, width * BPP, BPP).unwrap()
    }

    fn pixel(buffer: &PixelBuffer, x: usize, y: usize) -> [u8; 4] {
        let start = y * buffer.row_bytes() + x * BPP;
        let mut px = [0u8; 4];
        px.copy_from_slice(&buffer.data()[start..start + BPP]);
        px
    }

    #[test]
    fn clear_and_fill_use_current_color() {
        let mut buffer = surface(4, 3);
        let mut color = Color::default();
        let mut canvas = Canvas::new(&mut buffer, PixelFormat::Bgra, Rotation::None, &mut color);

        canvas.set_color(10, 20, 30, 255);
        canvas.clear();
        canvas.set_color(255, 0, 0, 255);
        canvas.fill(1, 1, 3, 2);

        assert_eq!(pixel(&buffer, 0, 0), [30, 20, 10, 255]);
        assert_eq!(pixel(&buffer, 1, 1), [0, 0, 255, 255]);
        assert_eq!(pixel(&buffer, 2, 1), [0, 0, 255, 255]);
        assert_eq!(pixel(&buffer, 3, 1), [30, 20, 10, 255]);
        assert_eq!(color, Color::new(255, 0, 0, 255));
    }

    #[test]
    fn degenerate_fills_are_no_ops() {
        let mut buffer = surface(4, 4);
        let mut color = Color::new(1, 1, 1, 255);
        let mut canvas = Canvas::new(&mut buffer, PixelFormat::Abgr, Rotation::None, &mut color);
        canvas.fill(2, 2, 2, 4);
        canvas.fill(3, 3, 1, 1);
        canvas.fill(10, 10, 20, 20);
        canvas.fill(-5, -5, -1, -1);
        assert!(buffer.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn fill_is_clamped() {
        let mut buffer = surface(4, 4);
        let mut color = Color::new(9, 9, 9, 255);
        let mut canvas = Canvas::new(&mut buffer, PixelFormat::Abgr, Rotation::None, &mut color);
        canvas.fill(-10, -10, 100, 100);
        assert!(buffer.data().iter().all(|&b| b == 9 || b == 255));
    }

    #[test]
    fn translucent_fill_blends() {
        let mut buffer = surface(1, 1);
        let mut color = Color::default();
        let mut canvas = Canvas::new(&mut buffer, PixelFormat::Abgr, Rotation::None, &mut color);
        canvas.set_color(0, 0, 0, 255);
        canvas.clear();
        canvas.set_color(255, 255, 255, 51);
        canvas.fill(0, 0, 1, 1);
        assert_eq!(pixel(&buffer, 0, 0)[0], 51);
    }

    #[test]
    fn oversized_blit_source_writes_nothing() {
        let mut buffer = surface(8, 8);
        let mut source = surface(4, 4);
        source.data_mut().fill(0xaa);
        let mut color = Color::default();
        let mut canvas = Canvas::new(&mut buffer, PixelFormat::Bgra, Rotation::None, &mut color);

        let err = canvas.blit(&source, 2, 0, 3, 4, 0, 0).unwrap_err();
        assert!(matches!(err, GraphicsError::BlitOutOfBounds { .. }));
        assert!(canvas.blit(&source, 0, 0, 4, 5, 0, 0).is_err());
        assert!(canvas.blit(&source, usize::MAX, 0, 2, 1, 0, 0).is_err());
        assert!(buffer.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn blit_copies_and_clips_destination() {
        let mut buffer = surface(4, 4);
        let mut source = surface(2, 2);
        source.data_mut().fill(0x11);
        let mut color = Color::default();
        let mut canvas = Canvas::new(&mut buffer, PixelFormat::Bgra, Rotation::None, &mut color);

        canvas.blit(&source, 0, 0, 2, 2, 3, -1).unwrap();
        assert_eq!(pixel(&buffer, 3, 0), [0x11; 4]);
        assert_eq!(pixel(&buffer, 2, 0), [0; 4]);
        assert_eq!(pixel(&buffer, 3, 1), [0; 4]);
    }

    #[test]
    fn rotation_maps_logical_origin() {
        let cases = [
            (Rotation::None, (0, 0)),
            (Rotation::Right, (3, 0)),
            (Rotation::Down, (3, 1)),
            (Rotation::Left, (0, 1)),
        ];
        for (rotation, (px, py)) in cases {
            let mut buffer = surface(4, 2);
            let mut color = Color::new(1, 2, 3, 255);
            let mut canvas = Canvas::new(&mut buffer, PixelFormat::Abgr, rotation, &mut color);
            if rotation.swaps_axes() {
                assert_eq!((canvas.width(), canvas.height()), (2, 4));
            }
            canvas.fill(0, 0, 1, 1);
            assert_eq!(pixel(&buffer, px, py), [1, 2, 3, 255], "{rotation:?}");
        }
    }

    #[test]
    fn text_requires_a_font() {
        let mut buffer = surface(4, 4);
        let mut color = Color::default();
        let mut canvas = Canvas::new(&mut buffer, PixelFormat::Abgr, Rotation::None, &mut color);
        assert!(matches!(
            canvas.text(None, 0, 0, "hi", false),
            Err(GraphicsError::NoFont)
        ));
    }

    #[test]
    fn bold_text_covers_more_pixels() {
        let font = GlyphAtlas::builtin(1).unwrap();
        let inked = |bold: bool| {
            let mut buffer = surface(32, 8);
            let mut color = Color::new(255, 255, 255, 255);
            let mut canvas =
                Canvas::new(&mut buffer, PixelFormat::Abgr, Rotation::None, &mut color);
            canvas.text(Some(&font), 0, 0, "Hi", bold).unwrap();
            buffer.data().chunks(BPP).filter(|px| px[0] != 0).count()
        };
        let regular = inked(false);
        assert!(regular > 0);
        assert!(inked(true) > regular);
    }

    #[test]
    fn text_stops_at_the_edge() {
        let font = GlyphAtlas::builtin(1).unwrap();
        let mut buffer = surface(12, 8);
        let mut color = Color::new(255, 255, 255, 255);
        let mut canvas = Canvas::new(&mut buffer, PixelFormat::Abgr, Rotation::None, &mut color);
        canvas.text(Some(&font), 0, 0, "MM", false).unwrap();
        for y in 0..8 {
            for x in 8..12 {
                assert_eq!(pixel(&buffer, x, y), [0; 4]);
            }
        }
    }

    #[test]
    fn texticon_stamps_alpha_mask() {
        let mut icon = PixelBuffer::new(2, 1, 2, 1).unwrap();
        icon.data_mut().copy_from_slice(&[255, 0]);
        let mut buffer = surface(2, 1);
        let mut color = Color::new(7, 8, 9, 255);
        let mut canvas = Canvas::new(&mut buffer, PixelFormat::Abgr, Rotation::None, &mut color);
        canvas.texticon(0, 0, &icon).unwrap();

        // Four-byte pixels are not an alpha mask.
        let colour = surface(1, 1);
        assert!(canvas.texticon(0, 0, &colour).is_err());

        assert_eq!(pixel(&buffer, 0, 0), [7, 8, 9, 255]);
        assert_eq!(pixel(&buffer, 1, 0), [0; 4]);
    }
}
