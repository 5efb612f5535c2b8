//! DRM device selection and the real scanout source.
//!
//! The capture target defaults to the secondary display-controller
//! node (`/dev/dri/card1` on the target hardware) — the GPU render
//! node belongs to the video player and is never opened here. The
//! device is resolved once at startup and immutable thereafter.

use std::fs::{File, OpenOptions};
use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use drm::control::{Device as ControlDevice, framebuffer};
use drm::{ClientCapability, Device, DriverCapability, buffer};

use crate::capture::{FbDescriptor, PlaneDesc, ScanoutSource};
use crate::error::LumenError;
use crate::handles::PrimeFd;

/// Display-controller node used when no override is configured.
pub const DEFAULT_DEVICE: &str = "/dev/dri/card1";

// DRM_PRIME_CAP_* bits of the Prime driver capability.
const PRIME_CAP_IMPORT: u64 = 0x1;
const PRIME_CAP_EXPORT: u64 = 0x2;

bitflags::bitflags! {
    /// Capabilities verified at selection time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCaps: u32 {
        const DUMB_BUFFER  = 1 << 0;
        const PRIME_EXPORT = 1 << 1;
        const PRIME_IMPORT = 1 << 2;
    }
}

/// Whether we hold the privileged DRM master role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStatus {
    /// Full client; mode-setting would be permitted.
    Master,
    /// Capture-only: another client (the video player) is master.
    Auxiliary,
}

// ── DrmDevice ────────────────────────────────────────────────────

/// An opened, validated DRM device.
#[derive(Debug)]
pub struct DrmDevice {
    file: File,
    path: PathBuf,
    caps: DeviceCaps,
    master: MasterStatus,
}

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Device for DrmDevice {}
impl ControlDevice for DrmDevice {}

impl DrmDevice {
    /// Open and validate the capture device.
    ///
    /// Verifies dumb-buffer and prime-export capabilities, enables
    /// universal planes, and attempts to become DRM master — falling
    /// back to auxiliary capture-only mode if the player already holds
    /// that role.
    pub fn select(preferred: Option<&Path>) -> Result<Self, LumenError> {
        let path = preferred.unwrap_or_else(|| Path::new(DEFAULT_DEVICE));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LumenError::DeviceNotFound(path.to_path_buf()),
                std::io::ErrorKind::PermissionDenied => {
                    LumenError::AuthFailed(format!("{}: {e}", path.display()))
                }
                _ => LumenError::AuthFailed(format!("{}: {e}", path.display())),
            })?;

        let mut device = Self {
            file,
            path: path.to_path_buf(),
            caps: DeviceCaps::empty(),
            master: MasterStatus::Auxiliary,
        };

        if device
            .get_driver_capability(DriverCapability::DumbBuffer)
            .unwrap_or(0)
            != 0
        {
            device.caps |= DeviceCaps::DUMB_BUFFER;
        }
        let prime = device
            .get_driver_capability(DriverCapability::Prime)
            .unwrap_or(0);
        if prime & PRIME_CAP_EXPORT != 0 {
            device.caps |= DeviceCaps::PRIME_EXPORT;
        }
        if prime & PRIME_CAP_IMPORT != 0 {
            device.caps |= DeviceCaps::PRIME_IMPORT;
        }

        if !device.caps.contains(DeviceCaps::DUMB_BUFFER) {
            return Err(LumenError::CapabilityMissing("dumb buffer"));
        }
        if !device.caps.contains(DeviceCaps::PRIME_EXPORT) {
            return Err(LumenError::CapabilityMissing("prime export"));
        }

        // Plane-backed scanout is invisible without this.
        device
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|e| LumenError::AuthFailed(format!("universal planes: {e}")))?;

        device.master = match device.acquire_master_lock() {
            Ok(()) => MasterStatus::Master,
            Err(_) => {
                // The player holds master; capture still works.
                tracing::info!("DRM master taken; continuing as auxiliary client");
                MasterStatus::Auxiliary
            }
        };

        Ok(device)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }

    pub fn master(&self) -> MasterStatus {
        self.master
    }

    /// Find the framebuffer currently scanned out: first via CRTCs
    /// with an active mode, then via attached planes.
    fn find_scanout_fb(&self) -> Result<framebuffer::Handle, LumenError> {
        let resources = self.resource_handles().map_err(map_busy)?;

        for &crtc in resources.crtcs() {
            let info = self.get_crtc(crtc).map_err(map_busy)?;
            if info.mode().is_some() {
                if let Some(fb) = info.framebuffer() {
                    return Ok(fb);
                }
            }
        }

        for plane in self.plane_handles().map_err(map_busy)? {
            let info = self.get_plane(plane).map_err(map_busy)?;
            if info.crtc().is_some() {
                if let Some(fb) = info.framebuffer() {
                    return Ok(fb);
                }
            }
        }

        Err(LumenError::NoFramebuffer)
    }

    /// Describe `fb` via the planar query, falling back to the legacy
    /// single-plane query on drivers without GETFB2.
    fn describe_fb(&self, fb: framebuffer::Handle) -> Result<FbDescriptor, LumenError> {
        match self.get_planar_framebuffer(fb) {
            Ok(info) => {
                let (width, height) = info.size();
                let mut planes = Vec::new();
                let buffers = info.buffers();
                let pitches = info.pitches();
                let offsets = info.offsets();
                for i in 0..buffers.len() {
                    if let Some(handle) = buffers[i] {
                        planes.push(PlaneDesc {
                            handle: u32::from(handle),
                            pitch: pitches[i],
                            offset: offsets[i],
                        });
                    }
                }
                if planes.is_empty() {
                    return Err(LumenError::NoFramebuffer);
                }
                Ok(FbDescriptor {
                    fb_id: u32::from(fb),
                    width,
                    height,
                    fourcc: info.pixel_format() as u32,
                    planes,
                })
            }
            Err(_) => {
                // Legacy query: one plane, format inferred from bpp.
                let info = self.get_framebuffer(fb).map_err(map_busy)?;
                let (width, height) = info.size();
                let handle = info.buffer().ok_or(LumenError::NoFramebuffer)?;
                let fourcc = match info.bpp() {
                    32 => crate::pixel::PixelFormat::Xrgb8888.fourcc(),
                    16 => crate::pixel::PixelFormat::Rgb565.fourcc(),
                    other => return Err(LumenError::DecodeUnsupported(other)),
                };
                Ok(FbDescriptor {
                    fb_id: u32::from(fb),
                    width,
                    height,
                    fourcc,
                    planes: vec![PlaneDesc {
                        handle: u32::from(handle),
                        pitch: info.pitch(),
                        offset: 0,
                    }],
                })
            }
        }
    }

    /// Close a GEM handle via the raw ioctl (not wrapped by the
    /// high-level API).
    pub fn close_gem_handle(&self, handle: u32) -> Result<(), LumenError> {
        drm_ffi::gem::close(self.file.as_fd(), handle)
            .map_err(|e| LumenError::Other(format!("GEM close {handle}: {e}")))?;
        Ok(())
    }
}

impl ScanoutSource for DrmDevice {
    fn active_framebuffer(&mut self) -> Result<FbDescriptor, LumenError> {
        let fb = self.find_scanout_fb()?;
        self.describe_fb(fb)
    }

    fn export_handle(&mut self, handle: u32, cycle: u64) -> Result<PrimeFd, LumenError> {
        let nz = NonZeroU32::new(handle)
            .ok_or_else(|| LumenError::Other("zero GEM handle in framebuffer".into()))?;
        let buffer_handle = buffer::Handle::from(nz);

        let fd: OwnedFd = self
            .buffer_to_prime_fd(buffer_handle, 0)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ResourceBusy | std::io::ErrorKind::WouldBlock => {
                    LumenError::Busy
                }
                _ => LumenError::HandleExport { handle, source: e },
            })?;

        Ok(PrimeFd::new(File::from(fd), cycle))
    }

    fn read_plane(
        &mut self,
        fd: &PrimeFd,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), LumenError> {
        let file = fd
            .file()
            .ok_or_else(|| LumenError::Other("read on closed prime fd".into()))?;

        // dma-buf mappings must start page-aligned; map from zero and
        // slice at the plane offset instead.
        let end = offset as usize + out.len();
        let mapping = unsafe { memmap2::MmapOptions::new().len(end).map(file) }
            .map_err(LumenError::PlaneMap)?;
        out.copy_from_slice(&mapping[offset as usize..end]);
        Ok(())
    }

    fn close_handle(&mut self, handle: u32) -> Result<(), LumenError> {
        self.close_gem_handle(handle)
    }
}

fn map_busy(e: std::io::Error) -> LumenError {
    match e.kind() {
        std::io::ErrorKind::ResourceBusy | std::io::ErrorKind::WouldBlock => LumenError::Busy,
        _ => LumenError::Io(e),
    }
}

// ── Tests ────────────────────────────────────────────────────────
