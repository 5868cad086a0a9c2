//! DRM/KMS display backend
//!
//! Uses two dumb buffers scanned out by the CRTC of each connected output.
//! Frames are drawn into a memory back buffer, copied into the hidden dumb
//! buffer and made visible with a page flip; presentation waits for the
//! flip-complete event of every output.

use anyhow::{anyhow, bail, Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::fb::Mapping;
use super::surface::PixelBuffer;
use super::{BackendKind, DisplayBackend, PixelFormat};

const DRM_IOCTL_BASE: u8 = b'd';

const DRM_CAP_DUMB_BUFFER: u64 = 0x1;
const DRM_MODE_CONNECTED: u32 = 1;
const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;
const DRM_MODE_PAGE_FLIP_EVENT: u32 = 0x01;
const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;

const DRM_MODE_CONNECTOR_LVDS: u32 = 7;
const DRM_MODE_CONNECTOR_EDP: u32 = 14;
const DRM_MODE_CONNECTOR_DSI: u32 = 16;

/// Upper bound on a single vblank wait
const FLIP_TIMEOUT_MS: u16 = 1000;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmGetCap {
    capability: u64,
    value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeCardRes {
    fb_id_ptr: u64,
    crtc_id_ptr: u64,
    connector_id_ptr: u64,
    encoder_id_ptr: u64,
    count_fbs: u32,
    count_crtcs: u32,
    count_connectors: u32,
    count_encoders: u32,
    min_width: u32,
    max_width: u32,
    min_height: u32,
    max_height: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeModeinfo {
    clock: u32,
    hdisplay: u16,
    hsync_start: u16,
    hsync_end: u16,
    htotal: u16,
    hskew: u16,
    vdisplay: u16,
    vsync_start: u16,
    vsync_end: u16,
    vtotal: u16,
    vscan: u16,
    vrefresh: u32,
    flags: u32,
    type_: u32,
    name: [u8; 32],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeCrtc {
    set_connectors_ptr: u64,
    count_connectors: u32,
    crtc_id: u32,
    fb_id: u32,
    x: u32,
    y: u32,
    gamma_size: u32,
    mode_valid: u32,
    mode: DrmModeModeinfo,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeGetEncoder {
    encoder_id: u32,
    encoder_type: u32,
    crtc_id: u32,
    possible_crtcs: u32,
    possible_clones: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeGetConnector {
    encoders_ptr: u64,
    modes_ptr: u64,
    props_ptr: u64,
    prop_values_ptr: u64,
    count_modes: u32,
    count_props: u32,
    count_encoders: u32,
    encoder_id: u32,
    connector_id: u32,
    connector_type: u32,
    connector_type_id: u32,
    connection: u32,
    mm_width: u32,
    mm_height: u32,
    subpixel: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeFbCmd {
    fb_id: u32,
    width: u32,
    height: u32,
    pitch: u32,
    bpp: u32,
    depth: u32,
    handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeCrtcPageFlip {
    crtc_id: u32,
    fb_id: u32,
    flags: u32,
    reserved: u32,
    user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeCreateDumb {
    height: u32,
    width: u32,
    bpp: u32,
    flags: u32,
    handle: u32,
    pitch: u32,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeMapDumb {
    handle: u32,
    pad: u32,
    offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmModeDestroyDumb {
    handle: u32,
}

nix::ioctl_readwrite!(drm_get_cap, DRM_IOCTL_BASE, 0x0c, DrmGetCap);
nix::ioctl_none!(drm_set_master, DRM_IOCTL_BASE, 0x1e);
nix::ioctl_readwrite!(drm_mode_getresources, DRM_IOCTL_BASE, 0xa0, DrmModeCardRes);
nix::ioctl_readwrite!(drm_mode_setcrtc, DRM_IOCTL_BASE, 0xa2, DrmModeCrtc);
nix::ioctl_readwrite!(drm_mode_getencoder, DRM_IOCTL_BASE, 0xa6, DrmModeGetEncoder);
nix::ioctl_readwrite!(drm_mode_getconnector, DRM_IOCTL_BASE, 0xa7, DrmModeGetConnector);
nix::ioctl_readwrite!(drm_mode_addfb, DRM_IOCTL_BASE, 0xae, DrmModeFbCmd);
nix::ioctl_readwrite!(drm_mode_rmfb, DRM_IOCTL_BASE, 0xaf, u32);
nix::ioctl_readwrite!(drm_mode_page_flip, DRM_IOCTL_BASE, 0xb0, DrmModeCrtcPageFlip);
nix::ioctl_readwrite!(drm_mode_create_dumb, DRM_IOCTL_BASE, 0xb2, DrmModeCreateDumb);
nix::ioctl_readwrite!(drm_mode_map_dumb, DRM_IOCTL_BASE, 0xb3, DrmModeMapDumb);
nix::ioctl_readwrite!(drm_mode_destroy_dumb, DRM_IOCTL_BASE, 0xb4, DrmModeDestroyDumb);

#[derive(Debug)]
struct ConnectorInfo {
    id: u32,
    connector_type: u32,
    connection: u32,
    encoder_id: u32,
    encoders: Vec<u32>,
    modes: Vec<DrmModeModeinfo>,
}

impl ConnectorInfo {
    fn is_internal(&self) -> bool {
        matches!(
            self.connector_type,
            DRM_MODE_CONNECTOR_LVDS | DRM_MODE_CONNECTOR_EDP | DRM_MODE_CONNECTOR_DSI
        )
    }

    fn preferred_mode(&self) -> Option<DrmModeModeinfo> {
        self.modes
            .iter()
            .find(|m| m.type_ & DRM_MODE_TYPE_PREFERRED != 0)
            .or_else(|| self.modes.first())
            .copied()
    }

    fn mode_of_size(&self, width: u16, height: u16) -> Option<DrmModeModeinfo> {
        self.modes
            .iter()
            .find(|m| m.hdisplay == width && m.vdisplay == height)
            .copied()
    }
}

/// One connector driven by one CRTC
#[derive(Debug)]
struct Output {
    connector_id: u32,
    crtc_id: u32,
    mode: DrmModeModeinfo,
    blanked: bool,
}

/// A dumb buffer registered as a framebuffer and mapped into memory
struct DumbBuffer {
    handle: u32,
    fb_id: u32,
    pitch: usize,
    size: (u32, u32),
    map: Option<Mapping>,
}

/// DRM backend implementation
pub struct DrmBackend {
    file: Option<File>,
    outputs: Vec<Output>,
    buffers: Vec<DumbBuffer>,
    front: usize,
    draw: PixelBuffer,
    width: usize,
    height: usize,
    flip_supported: bool,
    /// Flips queued with an event that has not arrived yet
    flips_pending: usize,
}

impl DrmBackend {
    /// Open the DRM card at `path` and light up every connected output
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let fd = file.as_raw_fd();

        // SAFETY: argument-less ioctl on an open DRM fd.
        if let Err(e) = unsafe { drm_set_master(fd) } {
            debug!("DRM_IOCTL_SET_MASTER failed ({}), continuing", e);
        }

        let mut cap = DrmGetCap {
            capability: DRM_CAP_DUMB_BUFFER,
            value: 0,
        };
        // SAFETY: plain data ioctl on an open DRM fd.
        unsafe { drm_get_cap(fd, &mut cap) }.context("DRM_IOCTL_GET_CAP failed")?;
        if cap.value == 0 {
            bail!("{} does not support dumb buffers", path.display());
        }

        let (crtcs, connector_ids) = get_resources(fd)?;
        let mut connectors: Vec<ConnectorInfo> = connector_ids
            .iter()
            .filter_map(|&id| match get_connector(fd, id) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!("Skipping DRM connector {}: {:#}", id, e);
                    None
                }
            })
            .filter(|c| c.connection == DRM_MODE_CONNECTED && !c.modes.is_empty())
            .collect();
        if connectors.is_empty() {
            bail!("no connected DRM connector with a usable mode");
        }
        // Built-in panels first.
        connectors.sort_by_key(|c| !c.is_internal());

        let primary_mode = connectors[0]
            .preferred_mode()
            .ok_or_else(|| anyhow!("connector {} has no modes", connectors[0].id))?;

        let mut outputs: Vec<Output> = Vec::new();
        for connector in &connectors {
            let mode = if outputs.is_empty() {
                primary_mode
            } else {
                match connector.mode_of_size(primary_mode.hdisplay, primary_mode.vdisplay) {
                    Some(mode) => mode,
                    None => {
                        info!(
                            "DRM connector {} cannot mirror {}x{}, leaving it off",
                            connector.id, primary_mode.hdisplay, primary_mode.vdisplay
                        );
                        continue;
                    }
                }
            };
            let taken: Vec<u32> = outputs.iter().map(|o| o.crtc_id).collect();
            match find_crtc(fd, connector, &crtcs, &taken) {
                Ok(crtc_id) => outputs.push(Output {
                    connector_id: connector.id,
                    crtc_id,
                    mode,
                    blanked: false,
                }),
                Err(e) => warn!("No CRTC for DRM connector {}: {:#}", connector.id, e),
            }
        }
        if outputs.is_empty() {
            bail!("no CRTC available for any connected connector");
        }

        let width = primary_mode.hdisplay as usize;
        let height = primary_mode.vdisplay as usize;
        let mut backend = Self {
            file: Some(file),
            outputs,
            buffers: Vec::new(),
            front: 0,
            draw: PixelBuffer::new(
                width,
                height,
                width * PixelFormat::BYTES_PER_PIXEL,
                PixelFormat::BYTES_PER_PIXEL,
            )?,
            width,
            height,
            flip_supported: true,
            flips_pending: 0,
        };

        // On error the partially built backend is dropped, which releases
        // whatever buffers were already created.
        for _ in 0..2 {
            let buffer = create_buffer(fd, width as u32, height as u32)?;
            backend.buffers.push(buffer);
        }

        for index in 0..backend.outputs.len() {
            backend.set_crtc(index, Some(backend.buffers[0].fb_id))?;
        }

        info!(
            "DRM initialized: {}x{} on {} output(s)",
            width,
            height,
            backend.outputs.len()
        );
        Ok(backend)
    }

    fn fd(&self) -> Result<libc::c_int> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| anyhow!("DRM device closed"))
    }

    /// Point output `index` at `fb_id`, or switch it off with `None`
    fn set_crtc(&self, index: usize, fb_id: Option<u32>) -> Result<()> {
        let fd = self.fd()?;
        let output = &self.outputs[index];
        let mut connectors = [output.connector_id];
        let mut crtc = DrmModeCrtc {
            crtc_id: output.crtc_id,
            ..Default::default()
        };
        if let Some(fb_id) = fb_id {
            crtc.fb_id = fb_id;
            crtc.set_connectors_ptr = connectors.as_mut_ptr() as u64;
            crtc.count_connectors = 1;
            crtc.mode = output.mode;
            crtc.mode_valid = 1;
        }
        // SAFETY: `connectors` outlives the call; the struct is plain data.
        unsafe { drm_mode_setcrtc(fd, &mut crtc) }
            .with_context(|| format!("DRM_IOCTL_MODE_SETCRTC failed on crtc {}", output.crtc_id))?;
        Ok(())
    }

    fn copy_to_buffer(&mut self, index: usize) -> Result<()> {
        let buffer = &mut self.buffers[index];
        let pitch = buffer.pitch;
        let map = buffer
            .map
            .as_mut()
            .ok_or_else(|| anyhow!("dumb buffer not mapped"))?;
        let dst = map.bytes_mut();
        for y in 0..self.height {
            let src = self.draw.row(y);
            dst[y * pitch..y * pitch + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    /// Queue a flip to `fb_id` on every lit output and wait until all of
    /// them have completed.
    fn page_flip(&mut self, fb_id: u32) -> Result<()> {
        let fd = self.fd()?;
        // Flips left over from a timed out frame would make the kernel
        // reject the new ones with EBUSY.
        if let Err(e) = self.wait_for_flips() {
            warn!("Dropping stale page flips: {:#}", e);
            self.flips_pending = 0;
        }

        let mut queued: Result<()> = Ok(());
        for output in self.outputs.iter().filter(|o| !o.blanked) {
            let mut flip = DrmModeCrtcPageFlip {
                crtc_id: output.crtc_id,
                fb_id,
                flags: DRM_MODE_PAGE_FLIP_EVENT,
                ..Default::default()
            };
            // SAFETY: plain data ioctl on an open DRM fd.
            if let Err(e) = unsafe { drm_mode_page_flip(fd, &mut flip) } {
                queued = Err(e)
                    .with_context(|| format!("page flip failed on crtc {}", output.crtc_id));
                break;
            }
            self.flips_pending += 1;
        }

        // Outputs that did flip still deliver an event.
        let waited = self.wait_for_flips();
        queued.and(waited)
    }

    /// Read DRM events until every queued flip has completed
    fn wait_for_flips(&mut self) -> Result<()> {
        let mut file = self.file.as_ref().ok_or_else(|| anyhow!("DRM device closed"))?;
        let mut buf = [0u8; 1024];
        while self.flips_pending > 0 {
            let ready = {
                let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
                poll(&mut fds, PollTimeout::from(FLIP_TIMEOUT_MS))
                    .context("poll on DRM fd failed")?
            };
            if ready == 0 {
                return Err(FlipTimeout(self.flips_pending).into());
            }

            let len = file.read(&mut buf).context("reading DRM events failed")?;
            let completed = count_flip_events(&buf[..len]);
            self.flips_pending = self.flips_pending.saturating_sub(completed);
        }
        Ok(())
    }

    fn release_buffers(&mut self) {
        let Some(fd) = self.file.as_ref().map(|f| f.as_raw_fd()) else {
            self.buffers.clear();
            return;
        };
        for mut buffer in self.buffers.drain(..) {
            buffer.map = None;
            // SAFETY: plain data ioctls on an open DRM fd; ids came from the kernel.
            if let Err(e) = unsafe { drm_mode_rmfb(fd, &mut buffer.fb_id) } {
                warn!("DRM_IOCTL_MODE_RMFB failed: {}", e);
            }
            let mut destroy = DrmModeDestroyDumb {
                handle: buffer.handle,
            };
            if let Err(e) = unsafe { drm_mode_destroy_dumb(fd, &mut destroy) } {
                warn!("DRM_IOCTL_MODE_DESTROY_DUMB failed: {}", e);
            }
        }
    }
}

fn get_resources(fd: libc::c_int) -> Result<(Vec<u32>, Vec<u32>)> {
    let mut res = DrmModeCardRes::default();
    // SAFETY: first call only fills in counts.
    unsafe { drm_mode_getresources(fd, &mut res) }
        .context("DRM_IOCTL_MODE_GETRESOURCES failed")?;

    let mut crtcs = vec![0u32; res.count_crtcs as usize];
    let mut connectors = vec![0u32; res.count_connectors as usize];
    let mut encoders = vec![0u32; res.count_encoders as usize];
    let mut fill = DrmModeCardRes {
        crtc_id_ptr: crtcs.as_mut_ptr() as u64,
        connector_id_ptr: connectors.as_mut_ptr() as u64,
        encoder_id_ptr: encoders.as_mut_ptr() as u64,
        count_crtcs: res.count_crtcs,
        count_connectors: res.count_connectors,
        count_encoders: res.count_encoders,
        ..Default::default()
    };
    // SAFETY: every pointer refers to a vector sized by the matching count.
    unsafe { drm_mode_getresources(fd, &mut fill) }
        .context("DRM_IOCTL_MODE_GETRESOURCES failed")?;

    crtcs.truncate(fill.count_crtcs as usize);
    connectors.truncate(fill.count_connectors as usize);
    Ok((crtcs, connectors))
}

fn get_connector(fd: libc::c_int, id: u32) -> Result<ConnectorInfo> {
    let mut probe = DrmModeGetConnector {
        connector_id: id,
        ..Default::default()
    };
    // SAFETY: first call only fills in counts (and forces a probe).
    unsafe { drm_mode_getconnector(fd, &mut probe) }
        .context("DRM_IOCTL_MODE_GETCONNECTOR failed")?;

    let mut modes = vec![DrmModeModeinfo::default(); probe.count_modes as usize];
    let mut encoders = vec![0u32; probe.count_encoders as usize];
    let mut fill = DrmModeGetConnector {
        connector_id: id,
        modes_ptr: modes.as_mut_ptr() as u64,
        encoders_ptr: encoders.as_mut_ptr() as u64,
        count_modes: probe.count_modes,
        count_encoders: probe.count_encoders,
        ..Default::default()
    };
    // SAFETY: pointers refer to vectors sized by the matching counts.
    unsafe { drm_mode_getconnector(fd, &mut fill) }
        .context("DRM_IOCTL_MODE_GETCONNECTOR failed")?;

    modes.truncate(fill.count_modes.min(probe.count_modes) as usize);
    encoders.truncate(fill.count_encoders.min(probe.count_encoders) as usize);
    Ok(ConnectorInfo {
        id,
        connector_type: fill.connector_type,
        connection: fill.connection,
        encoder_id: fill.encoder_id,
        encoders,
        modes,
    })
}

fn get_encoder(fd: libc::c_int, id: u32) -> Result<DrmModeGetEncoder> {
    let mut encoder = DrmModeGetEncoder {
        encoder_id: id,
        ..Default::default()
    };
    // SAFETY: plain data ioctl on an open DRM fd.
    unsafe { drm_mode_getencoder(fd, &mut encoder) }
        .with_context(|| format!("DRM_IOCTL_MODE_GETENCODER failed for {id}"))?;
    Ok(encoder)
}

/// Prefer the CRTC already driving the connector, else any compatible free one
fn find_crtc(
    fd: libc::c_int,
    connector: &ConnectorInfo,
    crtcs: &[u32],
    taken: &[u32],
) -> Result<u32> {
    if connector.encoder_id != 0 {
        let encoder = get_encoder(fd, connector.encoder_id)?;
        if encoder.crtc_id != 0 && !taken.contains(&encoder.crtc_id) {
            return Ok(encoder.crtc_id);
        }
    }

    for &encoder_id in &connector.encoders {
        let encoder = match get_encoder(fd, encoder_id) {
            Ok(e) => e,
            Err(e) => {
                debug!("{:#}", e);
                continue;
            }
        };
        for (index, &crtc_id) in crtcs.iter().enumerate() {
            if index < 32
                && encoder.possible_crtcs & (1 << index) != 0
                && !taken.contains(&crtc_id)
            {
                return Ok(crtc_id);
            }
        }
    }

    Err(anyhow!("no free CRTC for connector {}", connector.id))
}

fn create_buffer(fd: libc::c_int, width: u32, height: u32) -> Result<DumbBuffer> {
    let mut create = DrmModeCreateDumb {
        width,
        height,
        bpp: 32,
        ..Default::default()
    };
    // SAFETY: plain data ioctl on an open DRM fd.
    unsafe { drm_mode_create_dumb(fd, &mut create) }
        .context("DRM_IOCTL_MODE_CREATE_DUMB failed")?;

    let mut buffer = DumbBuffer {
        handle: create.handle,
        fb_id: 0,
        pitch: create.pitch as usize,
        size: (width, height),
        map: None,
    };

    match register_buffer(fd, &mut buffer, create.size as usize) {
        Ok(mapping) => {
            buffer.map = Some(mapping);
            Ok(buffer)
        }
        Err(e) => {
            if buffer.fb_id != 0 {
                // SAFETY: fb id was returned by ADDFB.
                let _ = unsafe { drm_mode_rmfb(fd, &mut buffer.fb_id) };
            }
            let mut destroy = DrmModeDestroyDumb {
                handle: buffer.handle,
            };
            // SAFETY: handle was returned by CREATE_DUMB above.
            let _ = unsafe { drm_mode_destroy_dumb(fd, &mut destroy) };
            Err(e)
        }
    }
}

/// Add the dumb buffer as an XRGB8888 framebuffer and map it
fn register_buffer(fd: libc::c_int, buffer: &mut DumbBuffer, size: usize) -> Result<Mapping> {
    let (width, height) = buffer.size;
    // XRGB8888: bytes B, G, R, X in memory.
    let mut fb = DrmModeFbCmd {
        width,
        height,
        pitch: buffer.pitch as u32,
        bpp: 32,
        depth: 24,
        handle: buffer.handle,
        ..Default::default()
    };
    // SAFETY: plain data ioctl on an open DRM fd.
    unsafe { drm_mode_addfb(fd, &mut fb) }.context("DRM_IOCTL_MODE_ADDFB failed")?;
    buffer.fb_id = fb.fb_id;

    let mut map = DrmModeMapDumb {
        handle: buffer.handle,
        ..Default::default()
    };
    // SAFETY: plain data ioctl on an open DRM fd.
    unsafe { drm_mode_map_dumb(fd, &mut map) }
        .context("DRM_IOCTL_MODE_MAP_DUMB failed")?;

    // SAFETY: fd stays open for the duration of the call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    Mapping::new(borrowed, size, map.offset as libc::off_t)
}

/// A page flip whose completion event never arrived
#[derive(Debug, Error)]
#[error("timed out waiting for {0} page flip(s)")]
struct FlipTimeout(usize);

/// Whether a failed flip should only skip the current frame
fn is_transient_flip_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<FlipTimeout>().is_some()
        || e.downcast_ref::<Errno>().is_some_and(|&errno| errno == Errno::EBUSY)
}

/// Count flip-complete records in a buffer of DRM events
///
/// Each record starts with a native-endian `{ type: u32, length: u32 }`
/// header where `length` covers the whole record.
fn count_flip_events(events: &[u8]) -> usize {
    let word = |at: usize| {
        u32::from_ne_bytes([events[at], events[at + 1], events[at + 2], events[at + 3]])
    };
    let mut count = 0;
    let mut offset = 0;
    while offset + 8 <= events.len() {
        if word(offset) == DRM_EVENT_FLIP_COMPLETE {
            count += 1;
        }
        offset += (word(offset + 4) as usize).max(8);
    }
    count
}

impl DisplayBackend for DrmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Drm
    }

    fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn draw_buffer(&mut self) -> &mut PixelBuffer {
        &mut self.draw
    }

    fn present(&mut self) -> Result<()> {
        if self.buffers.len() < 2 {
            bail!("DRM buffers released");
        }
        let back = 1 - self.front;
        self.copy_to_buffer(back)?;
        let fb_id = self.buffers[back].fb_id;

        let mut flipped = false;
        if self.flip_supported {
            match self.page_flip(fb_id) {
                Ok(()) => flipped = true,
                Err(e) if is_transient_flip_error(&e) => {
                    warn!("Page flip did not complete, using SETCRTC for this frame: {:#}", e);
                }
                Err(e) => {
                    warn!("Page flip unavailable, falling back to SETCRTC: {:#}", e);
                    self.flip_supported = false;
                }
            }
        }
        if !flipped {
            for index in 0..self.outputs.len() {
                if !self.outputs[index].blanked {
                    self.set_crtc(index, Some(fb_id))?;
                }
            }
        }

        self.front = back;
        debug!("Frame presented");
        Ok(())
    }

    fn blank(&mut self, blank: bool, connector: usize) -> Result<()> {
        if connector >= self.outputs.len() {
            bail!(
                "connector {connector} out of range ({} outputs)",
                self.outputs.len()
            );
        }
        let fb_id = self
            .buffers
            .get(self.front)
            .map(|b| b.fb_id)
            .ok_or_else(|| anyhow!("DRM buffers released"))?;
        self.set_crtc(connector, if blank { None } else { Some(fb_id) })?;
        self.outputs[connector].blanked = blank;
        Ok(())
    }

    fn connector_count(&self) -> usize {
        self.outputs.len()
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Bgra
    }

    fn exit(&mut self) {
        if self.file.is_none() {
            return;
        }
        self.release_buffers();
        self.file = None;
        info!("DRM backend cleaned up");
    }
}

impl Drop for DrmBackend {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(width: u16, height: u16, type_: u32) -> DrmModeModeinfo {
        DrmModeModeinfo {
            hdisplay: width,
            vdisplay: height,
            type_,
            ..Default::default()
        }
    }

    fn connector(connector_type: u32, modes: Vec<DrmModeModeinfo>) -> ConnectorInfo {
        ConnectorInfo {
            id: 1,
            connector_type,
            connection: DRM_MODE_CONNECTED,
            encoder_id: 0,
            encoders: Vec::new(),
            modes,
        }
    }

    #[test]
    fn preferred_mode_wins_over_first() {
        let c = connector(
            11,
            vec![mode(640, 480, 0), mode(1920, 1080, DRM_MODE_TYPE_PREFERRED)],
        );
        assert_eq!(c.preferred_mode().unwrap().hdisplay, 1920);

        let plain = connector(11, vec![mode(800, 600, 0)]);
        assert_eq!(plain.preferred_mode().unwrap().vdisplay, 600);
    }

    #[test]
    fn mirror_mode_must_match_size() {
        let c = connector(11, vec![mode(1280, 720, 0), mode(1920, 1080, 0)]);
        assert!(c.mode_of_size(1920, 1080).is_some());
        assert!(c.mode_of_size(1024, 768).is_none());
    }

    #[test]
    fn panels_are_internal() {
        assert!(connector(DRM_MODE_CONNECTOR_EDP, vec![]).is_internal());
        assert!(connector(DRM_MODE_CONNECTOR_DSI, vec![]).is_internal());
        assert!(!connector(11, vec![]).is_internal());
    }

    #[test]
    fn struct_layouts_match_the_kernel_abi() {
        assert_eq!(std::mem::size_of::<DrmModeModeinfo>(), 68);
        assert_eq!(std::mem::size_of::<DrmModeCrtc>(), 104);
        assert_eq!(std::mem::size_of::<DrmModeGetConnector>(), 80);
        assert_eq!(std::mem::size_of::<DrmModeCardRes>(), 64);
        assert_eq!(std::mem::size_of::<DrmModeCreateDumb>(), 32);
    }

    fn event(type_: u32, length: u32) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend_from_slice(&type_.to_ne_bytes());
        record.extend_from_slice(&length.to_ne_bytes());
        record.resize(length.max(8) as usize, 0);
        record
    }

    #[test]
    fn every_flip_complete_record_is_counted() {
        // drm_event_vblank is 32 bytes; a vblank event (type 1) sits between.
        let mut events = event(DRM_EVENT_FLIP_COMPLETE, 32);
        events.extend(event(0x01, 32));
        events.extend(event(DRM_EVENT_FLIP_COMPLETE, 32));
        assert_eq!(count_flip_events(&events), 2);

        assert_eq!(count_flip_events(&[]), 0);
        // A truncated header is ignored.
        assert_eq!(count_flip_events(&events[..4]), 0);
    }

    #[test]
    fn busy_and_timed_out_flips_are_transient() {
        let busy = Err::<(), _>(Errno::EBUSY).context("page flip failed on crtc 7");
        assert!(is_transient_flip_error(&busy.unwrap_err()));
        assert!(is_transient_flip_error(&FlipTimeout(2).into()));

        let unsupported = Err::<(), _>(Errno::EINVAL).context("page flip failed on crtc 7");
        assert!(!is_transient_flip_error(&unsupported.unwrap_err()));
    }

    #[test]
    fn opening_a_missing_card_fails() {
        let temp = tempfile::tempdir().unwrap();
        assert!(DrmBackend::open(&temp.path().join("card0")).is_err());
    }
}
