//! Image resources
//!
//! Turns decoded images into surfaces the canvas can draw. Decoding itself
//! is delegated to an [`ImageDecoder`].
//!
//! A *display* surface holds 4-byte pixels in the backend's [`PixelFormat`]
//! and is drawn with [`Canvas::blit`](crate::ui::Canvas::blit). An *alpha*
//! surface holds one coverage byte per pixel and is drawn in the current
//! color with [`Canvas::texticon`](crate::ui::Canvas::texticon).

use std::collections::HashMap;
use std::io;
use thiserror::Error;
use tracing::debug;

use crate::ui::{Color, GraphicsError, PixelBuffer, PixelFormat};

/// Frame rate assumed when an animation does not specify one
pub const DEFAULT_FPS: u32 = 20;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource {0} not found")]
    NotFound(String),

    #[error("failed to read resource: {0}")]
    Io(#[from] io::Error),

    #[error("malformed image: {0}")]
    Format(String),

    #[error("no image for locale {0}")]
    NoLocale(String),

    #[error(transparent)]
    Alloc(GraphicsError),
}

impl From<GraphicsError> for ResourceError {
    fn from(e: GraphicsError) -> Self {
        match e {
            // Bad dimensions come from the image, not from memory pressure.
            GraphicsError::InvalidGeometry(detail) => ResourceError::Format(detail),
            other => ResourceError::Alloc(other),
        }
    }
}

impl ResourceError {
    /// Negative status code for callers that only carry an integer
    pub fn code(&self) -> i32 {
        match self {
            ResourceError::NotFound(_) => -1,
            ResourceError::Io(_) => -2,
            ResourceError::Format(_) => -3,
            ResourceError::NoLocale(_) => -4,
            ResourceError::Alloc(_) => -8,
        }
    }
}

/// Tightly packed 8-bit image straight out of a decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: usize,
    pub height: usize,
    /// 1 (gray), 3 (RGB) or 4 (RGBA)
    pub channels: usize,
    pub data: Vec<u8>,
    /// Frames interlaced by row, 1 for a still image
    pub frames: usize,
    pub fps: u32,
}

impl DecodedImage {
    pub fn new(width: usize, height: usize, channels: usize, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            data,
            frames: 1,
            fps: DEFAULT_FPS,
        }
    }

    pub fn with_frames(mut self, frames: usize, fps: u32) -> Self {
        self.frames = frames;
        self.fps = fps;
        self
    }

    fn validate(&self) -> Result<(), ResourceError> {
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(ResourceError::Format(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        let expected = self.width * self.height * self.channels;
        if self.data.len() != expected {
            return Err(ResourceError::Format(format!(
                "expected {expected} bytes of pixel data, got {}",
                self.data.len()
            )));
        }
        Ok(())
    }

    fn row(&self, y: usize) -> &[u8] {
        let stride = self.width * self.channels;
        &self.data[y * stride..(y + 1) * stride]
    }

    fn color_at(&self, row: &[u8], x: usize) -> Color {
        let px = &row[x * self.channels..(x + 1) * self.channels];
        match self.channels {
            1 => Color::new(px[0], px[0], px[0], 0xff),
            3 => Color::new(px[0], px[1], px[2], 0xff),
            _ => Color::new(px[0], px[1], px[2], px[3]),
        }
    }
}

/// Source of decoded images, looked up by resource name
pub trait ImageDecoder {
    fn decode(&self, name: &str) -> Result<DecodedImage, ResourceError>;
}

/// Decoder over images already held in memory
#[derive(Debug, Default)]
pub struct MemoryImages {
    images: HashMap<String, DecodedImage>,
}

impl MemoryImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, image: DecodedImage) {
        self.images.insert(name.into(), image);
    }
}

impl ImageDecoder for MemoryImages {
    fn decode(&self, name: &str) -> Result<DecodedImage, ResourceError> {
        self.images
            .get(name)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(name.to_string()))
    }
}

/// Frames of an animation plus its suggested rate
#[derive(Debug)]
pub struct Animation {
    pub frames: Vec<PixelBuffer>,
    pub fps: u32,
}

/// Surface factory bound to one decoder and one display pixel format
pub struct Resources<D> {
    decoder: D,
    format: PixelFormat,
}

impl<D: ImageDecoder> Resources<D> {
    pub fn new(decoder: D, format: PixelFormat) -> Self {
        Self { decoder, format }
    }

    pub fn display_surface(&self, name: &str) -> Result<PixelBuffer, ResourceError> {
        let image = self.load(name)?;
        self.convert_rows(&image, image.height, |y| y)
    }

    /// Split an image whose rows are interlaced by frame: row `y` belongs to
    /// frame `y % frames`.
    pub fn multi_display_surface(&self, name: &str) -> Result<Animation, ResourceError> {
        let image = self.load(name)?;
        let frames = image.frames;
        if frames == 0 || image.height % frames != 0 {
            return Err(ResourceError::Format(format!(
                "height {} is not a multiple of {} frames",
                image.height, frames
            )));
        }

        let frame_height = image.height / frames;
        let surfaces = (0..frames)
            .map(|frame| self.convert_rows(&image, frame_height, |y| y * frames + frame))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Loaded {} frame(s) of {} at {} fps", frames, name, image.fps);

        Ok(Animation {
            frames: surfaces,
            fps: if image.fps > 0 { image.fps } else { DEFAULT_FPS },
        })
    }

    pub fn alpha_surface(&self, name: &str) -> Result<PixelBuffer, ResourceError> {
        let image = self.load_gray(name)?;
        alpha_region(&image, 0, image.width, image.height)
    }

    /// Pick the first sub-image of a localized composite whose locale
    /// matches `locale`.
    pub fn localized_alpha_surface(
        &self,
        name: &str,
        locale: &str,
    ) -> Result<PixelBuffer, ResourceError> {
        let image = self.load_gray(name)?;
        for header in LocaleHeaders::new(&image) {
            let header = header?;
            if matches_locale(&header.locale, locale) {
                debug!(
                    "Using {}x{} {} image for locale {}",
                    header.width, header.height, header.locale, locale
                );
                return alpha_region(&image, header.row + 1, header.width, header.height);
            }
        }
        Err(ResourceError::NoLocale(locale.to_string()))
    }

    /// Locales embedded in a localized composite, in file order
    pub fn locales(&self, name: &str) -> Result<Vec<String>, ResourceError> {
        let image = self.load_gray(name)?;
        LocaleHeaders::new(&image)
            .map(|header| header.map(|h| h.locale))
            .collect()
    }

    fn load(&self, name: &str) -> Result<DecodedImage, ResourceError> {
        let image = self.decoder.decode(name)?;
        image.validate()?;
        Ok(image)
    }

    fn load_gray(&self, name: &str) -> Result<DecodedImage, ResourceError> {
        let image = self.load(name)?;
        if image.channels != 1 {
            return Err(ResourceError::Format(format!(
                "{name} has {} channels, alpha surfaces need grayscale",
                image.channels
            )));
        }
        Ok(image)
    }

    fn convert_rows<F>(
        &self,
        image: &DecodedImage,
        height: usize,
        source_row: F,
    ) -> Result<PixelBuffer, ResourceError>
    where
        F: Fn(usize) -> usize,
    {
        let bpp = PixelFormat::BYTES_PER_PIXEL;
        let mut surface = PixelBuffer::new(image.width, height, image.width * bpp, bpp)?;
        for y in 0..height {
            let src = image.row(source_row(y));
            let dst = surface.row_mut(y);
            for x in 0..image.width {
                let packed = self.format.pack(image.color_at(src, x));
                dst[x * bpp..(x + 1) * bpp].copy_from_slice(&packed);
            }
        }
        Ok(surface)
    }
}

fn alpha_region(
    image: &DecodedImage,
    first_row: usize,
    width: usize,
    height: usize,
) -> Result<PixelBuffer, ResourceError> {
    let mut surface = PixelBuffer::new(width, height, width, 1)?;
    for y in 0..height {
        let src = image.row(first_row + y);
        surface.row_mut(y)[..width].copy_from_slice(&src[..width]);
    }
    Ok(surface)
}

struct LocaleHeader {
    row: usize,
    width: usize,
    height: usize,
    locale: String,
}

/// Walks the header rows of a localized composite.
///
/// Each sub-image is preceded by one row starting with: width (u16 LE),
/// height (u16 LE), locale length (u8), locale bytes.
struct LocaleHeaders<'a> {
    image: &'a DecodedImage,
    row: usize,
    failed: bool,
}

impl<'a> LocaleHeaders<'a> {
    fn new(image: &'a DecodedImage) -> Self {
        Self {
            image,
            row: 0,
            failed: false,
        }
    }

    fn parse(&self) -> Result<LocaleHeader, ResourceError> {
        let bytes = self.image.row(self.row);
        if bytes.len() < 5 {
            return Err(ResourceError::Format("image too narrow for locale header".into()));
        }
        let width = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let height = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        let len = bytes[4] as usize;

        let locale = bytes
            .get(5..5 + len)
            .ok_or_else(|| {
                ResourceError::Format(format!("locale header at row {} truncated", self.row))
            })?;
        let locale = String::from_utf8_lossy(locale).into_owned();

        if width > self.image.width || self.row + 1 + height > self.image.height {
            return Err(ResourceError::Format(format!(
                "sub-image {locale} ({width}x{height}) exceeds the composite"
            )));
        }

        Ok(LocaleHeader {
            row: self.row,
            width,
            height,
            locale,
        })
    }
}

impl Iterator for LocaleHeaders<'_> {
    type Item = Result<LocaleHeader, ResourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.row >= self.image.height {
            return None;
        }
        match self.parse() {
            Ok(header) => {
                self.row += header.height + 1;
                Some(Ok(header))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Whether an image tagged `prefix` serves `locale`: `prefix` must be the
/// whole of `locale` or be followed by `-` or `_`.
///
/// `"en"` serves `"en"`, `"en-US"` and `"en_GB"` but not `"eng"`.
pub fn matches_locale(prefix: &str, locale: &str) -> bool {
    if prefix.is_empty() || !locale.starts_with(prefix) {
        return false;
    }
    matches!(locale[prefix.len()..].chars().next(), None | Some('-') | Some('_'))
}
