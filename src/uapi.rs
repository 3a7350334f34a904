//! Kernel DRM ABI
//!
//! Manual Rust bindings for the etnaviv-style DRM interface the exerciser
//! submits through. These match the C structure layouts the kernel expects;
//! `device` wraps them in safe handles.

use std::mem::size_of;

// =============================================================================
// ioctl request encoding
// =============================================================================

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

const fn iow(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ioc(IOC_WRITE, ty, nr, size)
}

const fn iowr(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

/// DRM ioctl type byte.
const DRM_IOCTL_BASE: u8 = b'd';
/// Driver-private ioctls start here.
const DRM_COMMAND_BASE: u8 = 0x40;

// =============================================================================
// Core DRM: version query, GEM close
// =============================================================================

#[repr(C)]
pub struct DrmVersion {
    pub version_major: libc::c_int,
    pub version_minor: libc::c_int,
    pub version_patchlevel: libc::c_int,
    pub name_len: libc::size_t,
    pub name: *mut libc::c_char,
    pub date_len: libc::size_t,
    pub date: *mut libc::c_char,
    pub desc_len: libc::size_t,
    pub desc: *mut libc::c_char,
}

#[repr(C)]
pub struct GemClose {
    pub handle: u32,
    pub pad: u32,
}

pub const DRM_IOCTL_VERSION: libc::c_ulong = iowr(DRM_IOCTL_BASE, 0x00, size_of::<DrmVersion>());
pub const DRM_IOCTL_GEM_CLOSE: libc::c_ulong = iow(DRM_IOCTL_BASE, 0x09, size_of::<GemClose>());

// =============================================================================
// Driver parameters
// =============================================================================

pub const PARAM_GPU_MODEL: u32 = 0x1;
pub const PARAM_GPU_REVISION: u32 = 0x2;
pub const PARAM_GPU_FEATURES_0: u32 = 0x3;

#[repr(C)]
pub struct GetParam {
    pub pipe: u32,
    pub param: u32,
    pub value: u64,
}

// =============================================================================
// Buffer objects
// =============================================================================

// Cacheability of the CPU mapping; exactly one of these per allocation.
pub const BO_CACHED: u32 = 0x0001;
pub const BO_WC: u32 = 0x0002;
pub const BO_UNCACHED: u32 = 0x0004;

#[repr(C)]
pub struct GemNew {
    pub size: u64,
    pub flags: u32,
    pub handle: u32,
}

#[repr(C)]
pub struct GemInfo {
    pub handle: u32,
    pub pad: u32,
    /// Fake mmap offset to pass to `mmap(2)` on the device fd.
    pub offset: u64,
}

// =============================================================================
// Submission
// =============================================================================

/// Execution pipes. The exerciser only drives the 3D front-end.
pub const PIPE_3D: u32 = 0x00;
pub const PIPE_2D: u32 = 0x01;
pub const PIPE_VG: u32 = 0x02;

// Per-buffer access direction; selects the cache/barrier class the kernel
// applies around the submit.
pub const SUBMIT_BO_READ: u32 = 0x0001;
pub const SUBMIT_BO_WRITE: u32 = 0x0002;

/// Readback gated by a performance-counter selector write.
pub const READBACK_PERF: u32 = 0x0001;

/// Largest stream the kernel accepts in one submit (128 KiB of words).
pub const FE_STREAM_MAX_WORDS: usize = 0x8000;

#[repr(C)]
pub struct SubmitBo {
    pub flags: u32,
    pub handle: u32,
    pub presumed: u64,
}

#[repr(C)]
pub struct SubmitReloc {
    /// Byte offset of the word to patch within the stream.
    pub submit_offset: u32,
    /// Index into the submit's buffer table.
    pub reloc_idx: u32,
    /// Byte offset added to the buffer's device address.
    pub reloc_offset: u64,
    pub flags: u32,
    pub pad: u32,
}

#[repr(C)]
pub struct SubmitReadback {
    pub flags: u32,
    /// Register to copy into the destination buffer.
    pub reg: u32,
    /// Selector register and value armed before the copy.
    pub perf_reg: u32,
    pub perf_value: u32,
    /// Destination byte offset and buffer-table index.
    pub read_offset: u32,
    pub read_idx: u32,
}

#[repr(C)]
pub struct GemSubmit {
    /// Out: fence to pass to WAIT_FENCE.
    pub fence: u32,
    pub pipe: u32,
    pub exec_state: u32,
    pub nr_bos: u32,
    pub nr_relocs: u32,
    pub stream_size: u32,
    pub bos: u64,
    pub relocs: u64,
    pub stream: u64,
    pub flags: u32,
    pub nr_readbacks: u32,
    pub readbacks: u64,
}

#[repr(C)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

#[repr(C)]
pub struct WaitFence {
    pub pipe: u32,
    pub fence: u32,
    pub flags: u32,
    pub pad: u32,
    pub timeout: Timespec,
}

const ETNAVIV_GET_PARAM: u8 = 0x00;
const ETNAVIV_GEM_NEW: u8 = 0x01;
const ETNAVIV_GEM_INFO: u8 = 0x02;
const ETNAVIV_GEM_SUBMIT: u8 = 0x05;
const ETNAVIV_WAIT_FENCE: u8 = 0x06;

pub const DRM_IOCTL_ETNAVIV_GET_PARAM: libc::c_ulong =
    iowr(DRM_IOCTL_BASE, DRM_COMMAND_BASE + ETNAVIV_GET_PARAM, size_of::<GetParam>());
pub const DRM_IOCTL_ETNAVIV_GEM_NEW: libc::c_ulong =
    iowr(DRM_IOCTL_BASE, DRM_COMMAND_BASE + ETNAVIV_GEM_NEW, size_of::<GemNew>());
pub const DRM_IOCTL_ETNAVIV_GEM_INFO: libc::c_ulong =
    iowr(DRM_IOCTL_BASE, DRM_COMMAND_BASE + ETNAVIV_GEM_INFO, size_of::<GemInfo>());
pub const DRM_IOCTL_ETNAVIV_GEM_SUBMIT: libc::c_ulong =
    iowr(DRM_IOCTL_BASE, DRM_COMMAND_BASE + ETNAVIV_GEM_SUBMIT, size_of::<GemSubmit>());
pub const DRM_IOCTL_ETNAVIV_WAIT_FENCE: libc::c_ulong =
    iow(DRM_IOCTL_BASE, DRM_COMMAND_BASE + ETNAVIV_WAIT_FENCE, size_of::<WaitFence>());

// Verify the C layouts at compile time.
const _: () = assert!(size_of::<GetParam>() == 16);
const _: () = assert!(size_of::<GemNew>() == 16);
const _: () = assert!(size_of::<GemInfo>() == 16);
const _: () = assert!(size_of::<SubmitBo>() == 16);
const _: () = assert!(size_of::<SubmitReloc>() == 24);
const _: () = assert!(size_of::<SubmitReadback>() == 24);
const _: () = assert!(size_of::<GemSubmit>() == 64);
const _: () = assert!(size_of::<WaitFence>() == 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_fields_round_trip() {
        // nr byte of a driver-private request sits above DRM_COMMAND_BASE.
        assert_eq!(DRM_IOCTL_ETNAVIV_GEM_SUBMIT & 0xFF, (DRM_COMMAND_BASE + 0x05) as libc::c_ulong);
        assert_eq!((DRM_IOCTL_ETNAVIV_GEM_SUBMIT >> 8) & 0xFF, DRM_IOCTL_BASE as libc::c_ulong);
        assert_eq!(
            (DRM_IOCTL_ETNAVIV_GEM_SUBMIT >> 16) & 0x3FFF,
            size_of::<GemSubmit>() as libc::c_ulong
        );
    }

    #[test]
    fn wait_fence_is_write_only() {
        assert_eq!(DRM_IOCTL_ETNAVIV_WAIT_FENCE >> 30, IOC_WRITE);
        assert_eq!(DRM_IOCTL_ETNAVIV_GEM_NEW >> 30, IOC_READ | IOC_WRITE);
    }
}
