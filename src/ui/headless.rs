//! In-memory display backend
//!
//! Nothing reaches a physical display. Used when no device is available and
//! by tests.

use anyhow::{anyhow, Result};
use tracing::debug;

use super::surface::PixelBuffer;
use super::{BackendKind, DisplayBackend, GraphicsError, PixelFormat};

/// Two memory surfaces swapped on every present
pub struct HeadlessBackend {
    front: PixelBuffer,
    back: PixelBuffer,
    format: PixelFormat,
    blanked: Vec<bool>,
    frames: u64,
}

impl HeadlessBackend {
    pub fn new(width: usize, height: usize, format: PixelFormat) -> Result<Self, GraphicsError> {
        Self::with_connectors(width, height, format, 1)
    }

    pub fn with_connectors(
        width: usize,
        height: usize,
        format: PixelFormat,
        connectors: usize,
    ) -> Result<Self, GraphicsError> {
        let bpp = PixelFormat::BYTES_PER_PIXEL;
        let row_bytes = width
            .checked_mul(bpp)
            .ok_or_else(|| GraphicsError::InvalidGeometry(format!("width {width}")))?;
        let front = PixelBuffer::new(width, height, row_bytes, bpp)?;
        let back = front.try_clone()?;
        Ok(Self {
            front,
            back,
            format,
            blanked: vec![false; connectors.max(1)],
            frames: 0,
        })
    }

    /// The buffer most recently presented
    pub fn front(&self) -> &PixelBuffer {
        &self.front
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    pub fn is_blanked(&self, connector: usize) -> bool {
        self.blanked.get(connector).copied().unwrap_or(false)
    }
}

impl DisplayBackend for HeadlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn size(&self) -> (usize, usize) {
        (self.back.width(), self.back.height())
    }

    fn draw_buffer(&mut self) -> &mut PixelBuffer {
        &mut self.back
    }

    fn present(&mut self) -> Result<()> {
        std::mem::swap(&mut self.front, &mut self.back);
        self.frames += 1;
        debug!("Headless frame {} presented", self.frames);
        Ok(())
    }

    fn blank(&mut self, blank: bool, connector: usize) -> Result<()> {
        let count = self.blanked.len();
        let slot = self
            .blanked
            .get_mut(connector)
            .ok_or_else(|| anyhow!("connector {connector} out of range ({count})"))?;
        *slot = blank;
        Ok(())
    }

    fn connector_count(&self) -> usize {
        self.blanked.len()
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn exit(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_swaps_buffers() {
        let mut backend = HeadlessBackend::new(2, 2, PixelFormat::Bgra).unwrap();
        backend.draw_buffer().data_mut().fill(5);
        backend.present().unwrap();

        assert_eq!(backend.frames_presented(), 1);
        assert!(backend.front().data().iter().all(|&b| b == 5));

        // Drawing into the new back buffer leaves the visible frame alone.
        backend.draw_buffer().data_mut().fill(9);
        assert!(backend.front().data().iter().all(|&b| b == 5));
    }

    #[test]
    fn blank_tracks_each_connector() {
        let mut backend = HeadlessBackend::with_connectors(2, 2, PixelFormat::Bgra, 2).unwrap();
        backend.blank(true, 1).unwrap();
        assert!(backend.is_blanked(1));
        assert!(!backend.is_blanked(0));
        assert!(backend.blank(true, 2).is_err());
    }
}
