//! Display module
//!
//! Owns the display device for the initramfs environment: backend selection
//! between DRM and fbdev, double-buffered presentation, rotation and pixel
//! format negotiation. Drawing goes through [`Canvas`], which is bound to the
//! selected backend's current back buffer.

pub mod canvas;
pub mod drm;
pub mod fb;
pub mod font;
pub mod headless;
pub mod surface;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::GraphicsConfig;

pub use canvas::Canvas;
pub use font::{font_size, measure, GlyphAtlas};
pub use surface::PixelBuffer;

/// Errors reported by the display layer
#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error("invalid surface geometry: {0}")]
    InvalidGeometry(String),

    #[error("failed to allocate {0} bytes of pixel memory")]
    Alloc(usize),

    #[error("no usable display backend (tried {0:?})")]
    NoBackend(Vec<BackendKind>),

    #[error("no font loaded")]
    NoFont,

    #[error("connector index {index} out of range ({count} connectors)")]
    ConnectorOutOfRange { index: usize, count: usize },

    #[error(
        "blit source {w}x{h}+{sx}+{sy} exceeds source surface {src_width}x{src_height}"
    )]
    BlitOutOfBounds {
        sx: usize,
        sy: usize,
        w: usize,
        h: usize,
        src_width: usize,
        src_height: usize,
    },

    #[error("surface has {actual} bytes per pixel, expected {expected}")]
    PixelSizeMismatch { expected: usize, actual: usize },

    #[error("display backend has exited")]
    Exited,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Identifies one concrete display mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// DRM/KMS dumb buffers with page flipping
    Drm,
    /// Linux framebuffer device
    Fbdev,
    /// In-memory surface, nothing reaches a physical display
    Headless,
}

impl BackendKind {
    /// Order tried when the caller supplies no candidates
    pub const DEFAULT_ORDER: [BackendKind; 2] = [BackendKind::Drm, BackendKind::Fbdev];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Drm => write!(f, "drm"),
            BackendKind::Fbdev => write!(f, "fbdev"),
            BackendKind::Headless => write!(f, "headless"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drm" => Ok(BackendKind::Drm),
            "fbdev" | "fb" => Ok(BackendKind::Fbdev),
            "headless" | "memory" => Ok(BackendKind::Headless),
            other => Err(format!("unknown display backend '{other}'")),
        }
    }
}

/// Byte order of the four channels of one pixel in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Unknown,
    /// Bytes R, G, B, A
    Abgr,
    /// Bytes R, G, B, X
    Rgbx,
    /// Bytes B, G, R, A
    Bgra,
    /// Same memory layout as `Bgra`
    Argb,
    /// Bytes A, B, G, R (alpha in the lowest byte of a big-endian word)
    Rgba,
}

impl PixelFormat {
    /// Bytes per pixel of every surface a backend hands to the canvas
    pub const BYTES_PER_PIXEL: usize = 4;

    /// Lay out `color` the way this format stores it in memory
    pub fn pack(self, color: Color) -> [u8; 4] {
        let Color { r, g, b, a } = color;
        match self {
            PixelFormat::Bgra | PixelFormat::Argb => [b, g, r, a],
            PixelFormat::Rgba => [a, b, g, r],
            PixelFormat::Abgr | PixelFormat::Rgbx | PixelFormat::Unknown => [r, g, b, a],
        }
    }

    /// Inverse of [`PixelFormat::pack`]
    pub fn unpack(self, px: [u8; 4]) -> Color {
        match self {
            PixelFormat::Bgra | PixelFormat::Argb => Color::new(px[2], px[1], px[0], px[3]),
            PixelFormat::Rgba => Color::new(px[3], px[2], px[1], px[0]),
            PixelFormat::Abgr | PixelFormat::Rgbx | PixelFormat::Unknown => {
                Color::new(px[0], px[1], px[2], px[3])
            }
        }
    }
}

/// Draw color, 8 bits per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

/// Display rotation, clockwise quarter turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    /// 90 degrees clockwise
    Right,
    /// 180 degrees
    Down,
    /// 270 degrees clockwise
    Left,
}

impl Rotation {
    fn quarter_turns(self) -> u8 {
        match self {
            Rotation::None => 0,
            Rotation::Right => 1,
            Rotation::Down => 2,
            Rotation::Left => 3,
        }
    }

    fn from_quarter_turns(turns: u8) -> Self {
        match turns % 4 {
            0 => Rotation::None,
            1 => Rotation::Right,
            2 => Rotation::Down,
            _ => Rotation::Left,
        }
    }

    /// Rotation obtained by applying `other` after `self`
    pub fn compose(self, other: Rotation) -> Rotation {
        Rotation::from_quarter_turns(self.quarter_turns() + other.quarter_turns())
    }

    /// True when width and height trade places
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Right | Rotation::Left)
    }
}

impl FromStr for Rotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(Rotation::None),
            "90" | "right" => Ok(Rotation::Right),
            "180" | "down" => Ok(Rotation::Down),
            "270" | "left" => Ok(Rotation::Left),
            other => Err(format!("unknown rotation '{other}'")),
        }
    }
}

/// Capability set every display mechanism provides
///
/// Geometry reported here is physical (pre-rotation); [`Graphics`] applies the
/// rotation on top.
pub trait DisplayBackend {
    /// Which mechanism this is
    fn kind(&self) -> BackendKind;

    /// Physical (width, height) of the display surface
    fn size(&self) -> (usize, usize);

    /// The buffer the next frame is drawn into
    fn draw_buffer(&mut self) -> &mut PixelBuffer;

    /// Make the draw buffer visible and hand out a fresh one.
    /// Blocks until the display reports the swap.
    fn present(&mut self) -> anyhow::Result<()>;

    /// Power one connector's output off (`true`) or on (`false`)
    fn blank(&mut self, blank: bool, connector: usize) -> anyhow::Result<()>;

    /// Number of physical outputs driven by this backend
    fn connector_count(&self) -> usize;

    /// Fixed for the lifetime of the backend
    fn pixel_format(&self) -> PixelFormat;

    /// Release device resources. Must be safe to call repeatedly.
    fn exit(&mut self);
}

/// Open one backend of the given kind using paths from `config`
pub fn open_backend(
    kind: BackendKind,
    config: &GraphicsConfig,
) -> anyhow::Result<Box<dyn DisplayBackend>> {
    match kind {
        BackendKind::Drm => drm::DrmBackend::open(&config.drm_device)
            .map(|b| Box::new(b) as Box<dyn DisplayBackend>),
        BackendKind::Fbdev => fb::FramebufferBackend::open(&config.fb_device)
            .map(|b| Box::new(b) as Box<dyn DisplayBackend>),
        BackendKind::Headless => {
            let (width, height) = config.headless_size;
            headless::HeadlessBackend::new(width, height, PixelFormat::Bgra)
                .map(|b| Box::new(b) as Box<dyn DisplayBackend>)
                .map_err(anyhow::Error::from)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialized,
    Exited,
}

/// Display context: the selected backend plus drawing state
///
/// Created by backend selection; torn down by [`Graphics::exit`] or on drop.
pub struct Graphics {
    backend: Box<dyn DisplayBackend>,
    kind: BackendKind,
    rotation: Rotation,
    color: Color,
    sys_font: Option<GlyphAtlas>,
    font_error: Option<GraphicsError>,
    state: State,
}

impl Graphics {
    /// Select a backend from `config.backends` and load the built-in font
    pub fn init(config: &GraphicsConfig) -> Result<Self, GraphicsError> {
        let mut graphics = Self::init_with(&config.backends, |kind| open_backend(kind, config))?;

        match GlyphAtlas::builtin(config.font_scale) {
            Ok(font) => graphics.sys_font = Some(font),
            Err(e) => {
                // Text becomes unavailable; graphics stay usable.
                warn!("Failed to load system font: {}", e);
                graphics.font_error = Some(e);
            }
        }

        graphics.set_rotation(config.rotation);
        Ok(graphics)
    }

    /// Try each candidate in order; the first successful probe wins.
    /// An empty list means [`BackendKind::DEFAULT_ORDER`].
    pub fn init_with<F>(candidates: &[BackendKind], mut probe: F) -> Result<Self, GraphicsError>
    where
        F: FnMut(BackendKind) -> anyhow::Result<Box<dyn DisplayBackend>>,
    {
        let order: &[BackendKind] = if candidates.is_empty() {
            &BackendKind::DEFAULT_ORDER
        } else {
            candidates
        };

        for &kind in order {
            debug!("Probing {} display backend", kind);
            match probe(kind) {
                Ok(backend) => {
                    let mut graphics = Self {
                        backend,
                        kind,
                        rotation: Rotation::None,
                        color: Color::default(),
                        sys_font: None,
                        font_error: None,
                        state: State::Initialized,
                    };
                    let (width, height) = graphics.geometry();
                    info!(
                        "Display backend {} selected: {}x{}, {:?}, {} connector(s)",
                        kind,
                        width,
                        height,
                        graphics.pixel_format(),
                        graphics.connector_count()
                    );
                    // Start from a known frame.
                    graphics.backend.draw_buffer().data_mut().fill(0);
                    return Ok(graphics);
                }
                Err(e) => warn!("Display backend {} unavailable: {:#}", kind, e),
            }
        }

        Err(GraphicsError::NoBackend(order.to_vec()))
    }

    /// Variant selected at initialization
    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// (width, height) after rotation
    pub fn geometry(&self) -> (usize, usize) {
        let (width, height) = self.backend.size();
        if self.rotation.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    pub fn width(&self) -> usize {
        self.geometry().0
    }

    pub fn height(&self) -> usize {
        self.geometry().1
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Set the absolute rotation for later geometry queries and draw calls
    pub fn set_rotation(&mut self, rotation: Rotation) {
        if rotation != self.rotation {
            debug!("Rotation {:?} -> {:?}", self.rotation, rotation);
        }
        self.rotation = rotation;
    }

    /// Rotate further by `by` relative to the current rotation
    pub fn rotate(&mut self, by: Rotation) {
        self.set_rotation(self.rotation.compose(by));
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.backend.pixel_format()
    }

    pub fn connector_count(&self) -> usize {
        self.backend.connector_count()
    }

    pub fn has_multiple_connectors(&self) -> bool {
        self.connector_count() > 1
    }

    /// Blank or unblank the primary connector
    pub fn blank(&mut self, blank: bool) -> Result<(), GraphicsError> {
        self.blank_connector(blank, 0)
    }

    /// Blank or unblank one connector
    pub fn blank_connector(&mut self, blank: bool, index: usize) -> Result<(), GraphicsError> {
        self.ensure_live()?;
        let count = self.connector_count();
        if index >= count {
            return Err(GraphicsError::ConnectorOutOfRange { index, count });
        }
        self.backend.blank(blank, index)?;
        Ok(())
    }

    /// Swap back and front buffers, blocking until the swap is visible
    pub fn present(&mut self) -> Result<(), GraphicsError> {
        self.ensure_live()?;
        self.backend.present()?;
        Ok(())
    }

    /// Drawing view onto the current back buffer
    pub fn canvas(&mut self) -> Result<Canvas<'_>, GraphicsError> {
        self.ensure_live()?;
        let format = self.backend.pixel_format();
        Ok(Canvas::new(
            self.backend.draw_buffer(),
            format,
            self.rotation,
            &mut self.color,
        ))
    }

    /// Canvas together with the default font, for drawing text
    pub fn canvas_with_font(
        &mut self,
    ) -> Result<(Canvas<'_>, Option<&GlyphAtlas>), GraphicsError> {
        self.ensure_live()?;
        let format = self.backend.pixel_format();
        let canvas = Canvas::new(
            self.backend.draw_buffer(),
            format,
            self.rotation,
            &mut self.color,
        );
        Ok((canvas, self.sys_font.as_ref()))
    }

    /// Default font, `None` when font initialization failed
    pub fn sys_font(&self) -> Option<&GlyphAtlas> {
        self.sys_font.as_ref()
    }

    /// Why the default font is missing, if it is
    pub fn font_error(&self) -> Option<&GraphicsError> {
        self.font_error.as_ref()
    }

    /// Replace the default font with a caller-loaded one
    pub fn set_sys_font(&mut self, font: GlyphAtlas) {
        self.sys_font = Some(font);
        self.font_error = None;
    }

    /// Release the backend. Idempotent.
    pub fn exit(&mut self) {
        if self.state == State::Exited {
            return;
        }
        self.backend.exit();
        self.state = State::Exited;
        info!("Display backend {} shut down", self.kind);
    }

    fn ensure_live(&self) -> Result<(), GraphicsError> {
        match self.state {
            State::Initialized => Ok(()),
            State::Exited => Err(GraphicsError::Exited),
        }
    }
}

impl Drop for Graphics {
    fn drop(&mut self) {
        self.exit();
    }
}
