//! Owned pixel memory

use std::fmt;

use super::GraphicsError;

/// A block of pixel memory with its geometry
///
/// Storage is a `Vec<u64>`, so the first byte is always 8-byte aligned.
/// Bounds inside the block are the caller's business; the drawing
/// primitives clip before they touch it.
pub struct PixelBuffer {
    width: usize,
    height: usize,
    row_bytes: usize,
    pixel_bytes: usize,
    words: Vec<u64>,
    data_size: usize,
}

impl PixelBuffer {
    /// Alignment of the first byte of [`PixelBuffer::data`]
    pub const DATA_ALIGNMENT: usize = std::mem::align_of::<u64>();

    /// Allocate a buffer able to hold `row_bytes * height` bytes
    pub fn new(
        width: usize,
        height: usize,
        row_bytes: usize,
        pixel_bytes: usize,
    ) -> Result<Self, GraphicsError> {
        if width == 0 || height == 0 || row_bytes == 0 || pixel_bytes == 0 {
            return Err(GraphicsError::InvalidGeometry(format!(
                "zero dimension in {width}x{height}, stride {row_bytes}, {pixel_bytes} bytes/pixel"
            )));
        }

        let min_row = width.checked_mul(pixel_bytes).ok_or_else(|| {
            GraphicsError::InvalidGeometry(format!(
                "row of {width} x {pixel_bytes} bytes overflows"
            ))
        })?;
        if row_bytes < min_row {
            return Err(GraphicsError::InvalidGeometry(format!(
                "stride {row_bytes} shorter than {width} pixels x {pixel_bytes} bytes"
            )));
        }

        let data_size = row_bytes
            .checked_mul(height)
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or_else(|| {
                GraphicsError::InvalidGeometry(format!(
                    "stride {row_bytes} x height {height} overflows"
                ))
            })?;

        let words = alloc_words(data_size)?;
        Ok(Self {
            width,
            height,
            row_bytes,
            pixel_bytes,
            words,
            data_size,
        })
    }

    /// Independent copy with identical geometry and contents
    pub fn try_clone(&self) -> Result<Self, GraphicsError> {
        let mut words = alloc_words(self.data_size)?;
        words.copy_from_slice(&self.words);
        Ok(Self {
            width: self.width,
            height: self.height,
            row_bytes: self.row_bytes,
            pixel_bytes: self.pixel_bytes,
            words,
            data_size: self.data_size,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Bytes between the starts of two consecutive rows
    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn pixel_bytes(&self) -> usize {
        self.pixel_bytes
    }

    /// `row_bytes * height`
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn data(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.data_size]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.data_size]
    }

    /// Pixel bytes of row `y`, without stride padding
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.row_bytes;
        &self.data()[start..start + self.width * self.pixel_bytes]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.row_bytes;
        let len = self.width * self.pixel_bytes;
        &mut self.data_mut()[start..start + len]
    }
}

fn alloc_words(data_size: usize) -> Result<Vec<u64>, GraphicsError> {
    let count = data_size.div_ceil(PixelBuffer::DATA_ALIGNMENT);
    let mut words = Vec::new();
    words
        .try_reserve_exact(count)
        .map_err(|_| GraphicsError::Alloc(data_size))?;
    words.resize(count, 0);
    Ok(words)
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_bytes", &self.row_bytes)
            .field("pixel_bytes", &self.pixel_bytes)
            .finish_non_exhaustive()
    }
}
