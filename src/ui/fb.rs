//! Linux framebuffer display backend

use anyhow::{anyhow, bail, Context, Result};
use nix::libc;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::io::{AsFd, AsRawFd};
use std::path::Path;
use std::ptr::NonNull;
use tracing::{debug, info, warn};

use super::surface::PixelBuffer;
use super::{BackendKind, DisplayBackend, PixelFormat};

const FBIOGET_VSCREENINFO: u32 = 0x4600;
const FBIOPUT_VSCREENINFO: u32 = 0x4601;
const FBIOGET_FSCREENINFO: u32 = 0x4602;
const FBIOPAN_DISPLAY: u32 = 0x4606;
const FBIOBLANK: u32 = 0x4611;

const FB_BLANK_UNBLANK: libc::c_int = 0;
const FB_BLANK_POWERDOWN: libc::c_int = 4;

/// Linux framebuffer fixed screen info
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    type_: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

/// Linux framebuffer variable screen info
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

nix::ioctl_read_bad!(fbioget_vscreeninfo, FBIOGET_VSCREENINFO, FbVarScreeninfo);
nix::ioctl_write_ptr_bad!(fbioput_vscreeninfo, FBIOPUT_VSCREENINFO, FbVarScreeninfo);
nix::ioctl_read_bad!(fbioget_fscreeninfo, FBIOGET_FSCREENINFO, FbFixScreeninfo);
nix::ioctl_write_ptr_bad!(fbiopan_display, FBIOPAN_DISPLAY, FbVarScreeninfo);
nix::ioctl_write_int_bad!(fbioblank, FBIOBLANK);
nix::ioctl_write_ptr!(fbio_waitforvsync, b'F', 0x20, u32);

/// A shared, writable mapping of device memory
pub(super) struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl Mapping {
    pub(super) fn new<F: AsFd>(fd: F, len: usize, offset: libc::off_t) -> Result<Self> {
        let length = NonZeroUsize::new(len).ok_or_else(|| anyhow!("cannot map zero bytes"))?;
        // SAFETY: fresh shared mapping of a device fd; nothing else aliases it
        // inside this process.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset,
            )
        }
        .context("mmap failed")?;
        Ok(Self { ptr, len })
    }

    pub(super) fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is `len` bytes long and lives as long as self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("munmap failed: {}", e);
        }
    }
}

/// Framebuffer backend implementation
///
/// Draws into a memory back buffer and copies it to the device on present.
/// When the driver offers a virtual resolution of two screens, the copy goes
/// to the hidden page and the display is panned to it.
pub struct FramebufferBackend {
    fb_file: Option<File>,
    map: Option<Mapping>,
    vinfo: FbVarScreeninfo,
    width: usize,
    height: usize,
    bits_per_pixel: u32,
    line_length: usize,
    pages: usize,
    displayed: usize,
    buffer: PixelBuffer,
    format: PixelFormat,
}

impl FramebufferBackend {
    /// Open and initialize the framebuffer device at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let fb_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let fd = fb_file.as_raw_fd();

        // SAFETY: the structs are plain data matching the kernel layout.
        let mut vinfo: FbVarScreeninfo = unsafe { std::mem::zeroed() };
        unsafe { fbioget_vscreeninfo(fd, &mut vinfo) }
            .context("FBIOGET_VSCREENINFO ioctl failed")?;
        let mut finfo: FbFixScreeninfo = unsafe { std::mem::zeroed() };
        unsafe { fbioget_fscreeninfo(fd, &mut finfo) }
            .context("FBIOGET_FSCREENINFO ioctl failed")?;

        if !matches!(vinfo.bits_per_pixel, 16 | 24 | 32) {
            bail!("unsupported framebuffer depth: {} bpp", vinfo.bits_per_pixel);
        }

        let pages = Self::try_double_buffer(fd, &mut vinfo, &mut finfo);

        let width = vinfo.xres as usize;
        let height = vinfo.yres as usize;
        let line_length = finfo.line_length as usize;
        let needed = line_length * height * pages;
        if (finfo.smem_len as usize) < needed {
            bail!(
                "framebuffer memory too small: {} bytes, need {}",
                finfo.smem_len,
                needed
            );
        }

        let map = Mapping::new(&fb_file, finfo.smem_len as usize, 0)?;
        let format = pixel_format_of(&vinfo);
        let bpp = PixelFormat::BYTES_PER_PIXEL;
        let buffer = PixelBuffer::new(width, height, width * bpp, bpp)?;

        info!(
            "Framebuffer initialized: {}x{} @ {} bpp, line_length={}, pages={}, format={:?}",
            width, height, vinfo.bits_per_pixel, line_length, pages, format
        );

        Ok(Self {
            fb_file: Some(fb_file),
            map: Some(map),
            vinfo,
            width,
            height,
            bits_per_pixel: vinfo.bits_per_pixel,
            line_length,
            pages,
            displayed: 0,
            buffer,
            format,
        })
    }

    /// Ask for a virtual screen twice as tall; returns the page count
    fn try_double_buffer(
        fd: libc::c_int,
        vinfo: &mut FbVarScreeninfo,
        finfo: &mut FbFixScreeninfo,
    ) -> usize {
        let wanted = vinfo.yres * 2;
        if vinfo.yres_virtual < wanted {
            let mut request = *vinfo;
            request.yres_virtual = wanted;
            request.yoffset = 0;
            // SAFETY: plain data ioctls on an open framebuffer fd.
            let applied = unsafe { fbioput_vscreeninfo(fd, &request) }.is_ok()
                && unsafe { fbioget_vscreeninfo(fd, vinfo) }.is_ok()
                && unsafe { fbioget_fscreeninfo(fd, finfo) }.is_ok();
            if !applied {
                debug!("Framebuffer refused a double-height virtual screen");
            }
        }

        let page_bytes = finfo.line_length as usize * vinfo.yres as usize;
        if vinfo.yres_virtual >= wanted && finfo.smem_len as usize >= page_bytes * 2 {
            2
        } else {
            1
        }
    }

    /// Copy the back buffer into device page `page`, converting the depth
    fn copy_to_page(&mut self, page: usize) -> Result<()> {
        let map = self.map.as_mut().ok_or_else(|| anyhow!("framebuffer not mapped"))?;
        let base = page * self.line_length * self.height;
        let dst = map.bytes_mut();
        let out_bpp = (self.bits_per_pixel / 8) as usize;

        for y in 0..self.height {
            let src = self.buffer.row(y);
            let start = base + y * self.line_length;
            let dst_row = &mut dst[start..start + self.width * out_bpp];
            convert_row(&self.vinfo, src, dst_row)?;
        }
        Ok(())
    }

    fn raw_fd(&self) -> Result<libc::c_int> {
        self.fb_file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| anyhow!("framebuffer device closed"))
    }
}

/// Convert one row of BGRA pixels into the device depth and channel order
fn convert_row(vinfo: &FbVarScreeninfo, src: &[u8], dst: &mut [u8]) -> Result<()> {
    match vinfo.bits_per_pixel {
        32 => dst.copy_from_slice(src),
        24 => {
            // Red at bit 0 means the bytes go R, G, B in memory.
            let red_first = vinfo.red.offset == 0;
            for (out, px) in dst.chunks_exact_mut(3).zip(src.chunks_exact(4)) {
                let (b, g, r) = (px[0], px[1], px[2]);
                out.copy_from_slice(&if red_first { [r, g, b] } else { [b, g, r] });
            }
        }
        16 => {
            for (out, px) in dst.chunks_exact_mut(2).zip(src.chunks_exact(4)) {
                let (b, g, r) = (px[0], px[1], px[2]);
                // RGB565 format
                let rgb565 = ((r as u16 & 0xF8) << 8)
                    | ((g as u16 & 0xFC) << 3)
                    | ((b as u16 & 0xF8) >> 3);
                out.copy_from_slice(&rgb565.to_le_bytes());
            }
        }
        other => bail!("unsupported framebuffer depth: {other} bpp"),
    }
    Ok(())
}

/// Channel order of a 32 bpp mode; lower depths are converted from BGRA
fn pixel_format_of(vinfo: &FbVarScreeninfo) -> PixelFormat {
    if vinfo.bits_per_pixel != 32 {
        return PixelFormat::Bgra;
    }
    match vinfo.red.offset {
        0 => PixelFormat::Abgr,
        24 => PixelFormat::Rgba,
        _ => PixelFormat::Bgra,
    }
}

impl DisplayBackend for FramebufferBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fbdev
    }

    fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn draw_buffer(&mut self) -> &mut PixelBuffer {
        &mut self.buffer
    }

    fn present(&mut self) -> Result<()> {
        let fd = self.raw_fd()?;

        if self.pages < 2 {
            self.copy_to_page(0)?;
        } else {
            let page = 1 - self.displayed;
            self.copy_to_page(page)?;
            self.vinfo.yoffset = (page * self.height) as u32;
            // SAFETY: plain data ioctl on an open framebuffer fd.
            unsafe { fbiopan_display(fd, &self.vinfo) }
                .context("FBIOPAN_DISPLAY ioctl failed")?;
            self.displayed = page;
        }

        // Not every driver implements vsync waits; panning already blocks on most.
        let crtc: u32 = 0;
        // SAFETY: plain data ioctl on an open framebuffer fd.
        if let Err(e) = unsafe { fbio_waitforvsync(fd, &crtc) } {
            debug!("FBIO_WAITFORVSYNC unavailable: {}", e);
        }

        debug!("Frame presented");
        Ok(())
    }

    fn blank(&mut self, blank: bool, connector: usize) -> Result<()> {
        if connector != 0 {
            bail!("framebuffer has a single output, connector {connector} requested");
        }
        let fd = self.raw_fd()?;
        let mode = if blank { FB_BLANK_POWERDOWN } else { FB_BLANK_UNBLANK };
        // SAFETY: integer ioctl on an open framebuffer fd.
        unsafe { fbioblank(fd, mode) }.context("FBIOBLANK ioctl failed")?;
        Ok(())
    }

    fn connector_count(&self) -> usize {
        1
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn exit(&mut self) {
        let was_open = self.map.take().is_some() | self.fb_file.take().is_some();
        if was_open {
            info!("Framebuffer backend cleaned up");
        }
    }
}

impl Drop for FramebufferBackend {
    fn drop(&mut self) {
        self.exit();
    }
}
