//! Device plumbing
//!
//! Safe handles over the kernel interface in [`crate::uapi`]: the DRM
//! device node, per-core GPU handle, execution pipe, and mappable buffer
//! objects. Mapped memory is only reachable through bounds-checked
//! read/write accessors; the raw pointer never escapes this module.

use std::cell::RefCell;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info};

use crate::stream::{StreamBatch, SubmitBackend};
use crate::uapi;

/// Everything that can go wrong talking to the device. Setup variants map
/// onto the distinct process exit codes of the tools.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open device node: {0}")]
    Open(#[source] io::Error),
    #[error("device version query failed: {0}")]
    Version(#[source] io::Error),
    #[error("GPU core {core} unavailable: {source}")]
    Gpu {
        core: u32,
        #[source]
        source: io::Error,
    },
    #[error("pipe creation failed: {0}")]
    Pipe(#[source] io::Error),
    #[error("buffer allocation of {size} bytes failed: {source}")]
    Alloc {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("command stream submission failed: {0}")]
    Submit(#[source] io::Error),
    #[error("fence wait failed: {0}")]
    WaitFence(#[source] io::Error),
}

impl DeviceError {
    /// Process exit code for a failed setup stage. Runtime submission
    /// failures have no dedicated code and fall back to a generic failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeviceError::Open(_) => 1,
            DeviceError::Version(_) => 2,
            DeviceError::Gpu { .. } => 3,
            DeviceError::Pipe(_) => 4,
            DeviceError::Alloc { .. } => 5,
            DeviceError::Submit(_) | DeviceError::WaitFence(_) => 1,
        }
    }
}

/// Retry-on-EINTR ioctl wrapper.
fn drm_ioctl<T>(fd: RawFd, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: `arg` is a live, exclusively borrowed repr(C) struct of
        // the size encoded in `request`.
        let rc = unsafe { libc::ioctl(fd, request, arg as *mut T) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Owns the device fd; shared by every handle derived from it so teardown
/// happens after all buffers and pipes are gone.
struct DeviceShared {
    fd: RawFd,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        debug!("closing device fd {}", self.fd);
        // SAFETY: fd was returned by open(2) and is owned by this struct.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Driver identity as reported by the kernel.
#[derive(Debug, Clone)]
pub struct DriverVersion {
    pub major: i32,
    pub minor: i32,
    pub patchlevel: i32,
    pub name: String,
    pub date: String,
    pub desc: String,
}

/// An open DRM device node.
pub struct Device {
    shared: Rc<DeviceShared>,
}

impl Device {
    /// Open the device node at `path` read-write.
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let cpath = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| DeviceError::Open(io::Error::from(io::ErrorKind::InvalidInput)))?;
        // SAFETY: cpath is a valid NUL-terminated string.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(DeviceError::Open(io::Error::last_os_error()));
        }
        info!("opened {} as fd {}", path.display(), fd);
        Ok(Self {
            shared: Rc::new(DeviceShared { fd }),
        })
    }

    /// Query driver name/version/date via the two-call string protocol.
    pub fn version(&self) -> Result<DriverVersion, DeviceError> {
        let fd = self.shared.fd;
        let mut ver: uapi::DrmVersion = unsafe { std::mem::zeroed() };
        drm_ioctl(fd, uapi::DRM_IOCTL_VERSION, &mut ver).map_err(DeviceError::Version)?;

        let mut name = vec![0u8; ver.name_len];
        let mut date = vec![0u8; ver.date_len];
        let mut desc = vec![0u8; ver.desc_len];
        ver.name = name.as_mut_ptr() as *mut libc::c_char;
        ver.date = date.as_mut_ptr() as *mut libc::c_char;
        ver.desc = desc.as_mut_ptr() as *mut libc::c_char;
        drm_ioctl(fd, uapi::DRM_IOCTL_VERSION, &mut ver).map_err(DeviceError::Version)?;

        let to_string = |buf: Vec<u8>| String::from_utf8_lossy(&buf).trim_end_matches('\0').to_string();
        Ok(DriverVersion {
            major: ver.version_major,
            minor: ver.version_minor,
            patchlevel: ver.version_patchlevel,
            name: to_string(name),
            date: to_string(date),
            desc: to_string(desc),
        })
    }

    fn get_param(&self, core: u32, param: u32) -> io::Result<u64> {
        let mut req = uapi::GetParam {
            pipe: core,
            param,
            value: 0,
        };
        drm_ioctl(self.shared.fd, uapi::DRM_IOCTL_ETNAVIV_GET_PARAM, &mut req)?;
        Ok(req.value)
    }

    /// Allocate a buffer object and map it into the process.
    pub fn alloc_buffer(&self, size: usize, flags: u32) -> Result<BufferObject, DeviceError> {
        let fd = self.shared.fd;
        let mut new = uapi::GemNew {
            size: size as u64,
            flags,
            handle: 0,
        };
        drm_ioctl(fd, uapi::DRM_IOCTL_ETNAVIV_GEM_NEW, &mut new)
            .map_err(|source| DeviceError::Alloc { size, source })?;

        let mut inf = uapi::GemInfo {
            handle: new.handle,
            pad: 0,
            offset: 0,
        };
        if let Err(source) = drm_ioctl(fd, uapi::DRM_IOCTL_ETNAVIV_GEM_INFO, &mut inf) {
            gem_close(fd, new.handle);
            return Err(DeviceError::Alloc { size, source });
        }

        // SAFETY: the kernel hands out a fake offset dedicated to this
        // buffer; mapping it shared gives us its backing pages.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                inf.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            let source = io::Error::last_os_error();
            gem_close(fd, new.handle);
            return Err(DeviceError::Alloc { size, source });
        }

        debug!("allocated bo handle {} ({} bytes)", new.handle, size);
        Ok(BufferObject {
            inner: Rc::new(BoInner {
                handle: new.handle,
                len: size,
                mem: BoMemory::Mapped {
                    ptr: ptr as *mut u8,
                },
                dev: Some(self.shared.clone()),
            }),
        })
    }
}

fn gem_close(fd: RawFd, handle: u32) {
    let mut close = uapi::GemClose { handle, pad: 0 };
    let _ = drm_ioctl(fd, uapi::DRM_IOCTL_GEM_CLOSE, &mut close);
}

/// Handle to one GPU core on the device.
pub struct Gpu {
    device: Rc<DeviceShared>,
    core: u32,
    pub model: u32,
    pub revision: u32,
}

impl Gpu {
    pub fn new(device: &Device, core: u32) -> Result<Self, DeviceError> {
        let model = device
            .get_param(core, uapi::PARAM_GPU_MODEL)
            .map_err(|source| DeviceError::Gpu { core, source })?;
        let revision = device
            .get_param(core, uapi::PARAM_GPU_REVISION)
            .map_err(|source| DeviceError::Gpu { core, source })?;
        info!("core {}: model 0x{:x} revision 0x{:x}", core, model, revision);
        Ok(Self {
            device: device.shared.clone(),
            core,
            model: model as u32,
            revision: revision as u32,
        })
    }

    pub fn core(&self) -> u32 {
        self.core
    }
}

/// Which front-end a pipe submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeId {
    Pipe3D,
    Pipe2D,
    PipeVg,
}

impl PipeId {
    fn exec_state(self) -> u32 {
        match self {
            PipeId::Pipe3D => uapi::PIPE_3D,
            PipeId::Pipe2D => uapi::PIPE_2D,
            PipeId::PipeVg => uapi::PIPE_VG,
        }
    }
}

/// Execution pipe bound to one GPU core. Implements [`SubmitBackend`]:
/// submission blocks until the kernel reports the fence signalled, so a
/// completed `submit_and_wait` guarantees every readback destination has
/// been written.
pub struct Pipe {
    device: Rc<DeviceShared>,
    core: u32,
    exec_state: u32,
}

impl Pipe {
    pub fn new(gpu: &Gpu, id: PipeId) -> Result<Self, DeviceError> {
        // The features word doubles as a liveness probe for the chosen core.
        let mut req = uapi::GetParam {
            pipe: gpu.core,
            param: uapi::PARAM_GPU_FEATURES_0,
            value: 0,
        };
        drm_ioctl(gpu.device.fd, uapi::DRM_IOCTL_ETNAVIV_GET_PARAM, &mut req)
            .map_err(DeviceError::Pipe)?;
        Ok(Self {
            device: gpu.device.clone(),
            core: gpu.core,
            exec_state: id.exec_state(),
        })
    }
}

impl SubmitBackend for Pipe {
    fn submit_and_wait(&mut self, batch: StreamBatch<'_>) -> Result<(), DeviceError> {
        let fd = self.device.fd;

        // Buffer table shared by relocations and readbacks; one entry per
        // distinct handle, access flags merged.
        let mut bos: Vec<uapi::SubmitBo> = Vec::new();
        let bo_index = |handle: u32, flags: u32, bos: &mut Vec<uapi::SubmitBo>| -> u32 {
            if let Some(idx) = bos.iter().position(|b| b.handle == handle) {
                bos[idx].flags |= flags;
                return idx as u32;
            }
            bos.push(uapi::SubmitBo {
                flags,
                handle,
                presumed: 0,
            });
            (bos.len() - 1) as u32
        };

        let relocs: Vec<uapi::SubmitReloc> = batch
            .relocs
            .iter()
            .map(|r| uapi::SubmitReloc {
                submit_offset: (r.word_index * 4) as u32,
                reloc_idx: bo_index(r.bo.handle(), r.access.submit_flags(), &mut bos),
                reloc_offset: 0,
                flags: r.access.submit_flags(),
                pad: 0,
            })
            .collect();

        let readbacks: Vec<uapi::SubmitReadback> = batch
            .readbacks
            .iter()
            .map(|r| uapi::SubmitReadback {
                flags: r.flags,
                reg: r.reg,
                perf_reg: r.select_reg,
                perf_value: r.select_value,
                read_offset: r.offset,
                read_idx: bo_index(r.bo.handle(), uapi::SUBMIT_BO_WRITE, &mut bos),
            })
            .collect();

        let mut submit = uapi::GemSubmit {
            fence: 0,
            pipe: self.core,
            exec_state: self.exec_state,
            nr_bos: bos.len() as u32,
            nr_relocs: relocs.len() as u32,
            stream_size: (batch.words.len() * 4) as u32,
            bos: bos.as_ptr() as u64,
            relocs: relocs.as_ptr() as u64,
            stream: batch.words.as_ptr() as u64,
            flags: 0,
            nr_readbacks: readbacks.len() as u32,
            readbacks: readbacks.as_ptr() as u64,
        };
        drm_ioctl(fd, uapi::DRM_IOCTL_ETNAVIV_GEM_SUBMIT, &mut submit)
            .map_err(DeviceError::Submit)?;

        let mut wait = uapi::WaitFence {
            pipe: self.core,
            fence: submit.fence,
            flags: 0,
            pad: 0,
            timeout: uapi::Timespec {
                tv_sec: 3600,
                tv_nsec: 0,
            },
        };
        drm_ioctl(fd, uapi::DRM_IOCTL_ETNAVIV_WAIT_FENCE, &mut wait)
            .map_err(DeviceError::WaitFence)?;
        Ok(())
    }
}

/// Access direction declared for a buffer referenced from a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoAccess {
    Read,
    Write,
    ReadWrite,
}

impl BoAccess {
    pub fn submit_flags(self) -> u32 {
        match self {
            BoAccess::Read => uapi::SUBMIT_BO_READ,
            BoAccess::Write => uapi::SUBMIT_BO_WRITE,
            BoAccess::ReadWrite => uapi::SUBMIT_BO_READ | uapi::SUBMIT_BO_WRITE,
        }
    }
}

enum BoMemory {
    /// Device pages mapped into the process.
    Mapped { ptr: *mut u8 },
    /// Heap-backed stand-in used by the recording backend in tests.
    #[allow(dead_code)]
    Host(RefCell<Vec<u8>>),
}

struct BoInner {
    handle: u32,
    len: usize,
    mem: BoMemory,
    /// Keeps the fd alive for unmap/close; `None` for host-backed buffers.
    dev: Option<Rc<DeviceShared>>,
}

impl Drop for BoInner {
    fn drop(&mut self) {
        if let BoMemory::Mapped { ptr } = self.mem {
            // SAFETY: ptr/len came from a successful mmap in alloc_buffer.
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, self.len);
            }
        }
        if let Some(dev) = &self.dev {
            gem_close(dev.fd, self.handle);
        }
    }
}

/// A device-resident buffer with a bounds-checked host view. Cheap to
/// clone; clones refer to the same memory. Out-of-range access is a
/// caller bug and panics.
#[derive(Clone)]
pub struct BufferObject {
    inner: Rc<BoInner>,
}

impl BufferObject {
    /// Heap-backed buffer for unit tests; never touches the kernel.
    #[cfg(test)]
    pub(crate) fn host(handle: u32, len: usize) -> Self {
        Self {
            inner: Rc::new(BoInner {
                handle,
                len,
                mem: BoMemory::Host(RefCell::new(vec![0u8; len])),
                dev: None,
            }),
        }
    }

    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    fn check_range(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.inner.len),
            "buffer access out of range: {}+{} > {}",
            offset,
            len,
            self.inner.len
        );
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.check_range(offset, data.len());
        match &self.inner.mem {
            BoMemory::Mapped { ptr } => {
                // SAFETY: range checked against the mapping length above.
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
                }
            }
            BoMemory::Host(mem) => {
                mem.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
            }
        }
    }

    /// Copy `out.len()` bytes from the buffer at `offset`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        self.check_range(offset, out.len());
        match &self.inner.mem {
            BoMemory::Mapped { ptr } => {
                // SAFETY: range checked against the mapping length above.
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr.add(offset), out.as_mut_ptr(), out.len());
                }
            }
            BoMemory::Host(mem) => {
                out.copy_from_slice(&mem.borrow()[offset..offset + out.len()]);
            }
        }
    }

    /// Read one little-endian word the device deposited at `offset`.
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        self.read_bytes(offset, &mut word);
        u32::from_le_bytes(word)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Zero the whole buffer.
    pub fn clear(&self) {
        let zeros = vec![0u8; self.inner.len];
        self.write_bytes(0, &zeros);
    }

    /// Copy out the full contents.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.inner.len];
        self.read_bytes(0, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_buffer_round_trip() {
        let bo = BufferObject::host(7, 16);
        bo.write_u32(4, 0xdead_beef);
        assert_eq!(bo.read_u32(4), 0xdead_beef);
        assert_eq!(bo.read_u32(0), 0);
        assert_eq!(bo.handle(), 7);
        assert_eq!(bo.len(), 16);
    }

    #[test]
    fn clones_share_memory() {
        let bo = BufferObject::host(1, 8);
        let view = bo.clone();
        bo.write_u32(0, 42);
        assert_eq!(view.read_u32(0), 42);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn write_past_end_panics() {
        let bo = BufferObject::host(1, 8);
        bo.write_bytes(6, &[0u8; 4]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn read_with_overflowing_offset_panics() {
        let bo = BufferObject::host(1, 8);
        let mut out = [0u8; 4];
        bo.read_bytes(usize::MAX, &mut out);
    }

    #[test]
    fn access_flags() {
        assert_eq!(BoAccess::Read.submit_flags(), 0x1);
        assert_eq!(BoAccess::Write.submit_flags(), 0x2);
        assert_eq!(BoAccess::ReadWrite.submit_flags(), 0x3);
    }

    #[test]
    fn setup_errors_map_to_exit_codes() {
        let io = || io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(DeviceError::Open(io()).exit_code(), 1);
        assert_eq!(DeviceError::Version(io()).exit_code(), 2);
        assert_eq!(DeviceError::Gpu { core: 0, source: io() }.exit_code(), 3);
        assert_eq!(DeviceError::Pipe(io()).exit_code(), 4);
        assert_eq!(DeviceError::Alloc { size: 4, source: io() }.exit_code(), 5);
    }
}
