//! Thin wrapper over the raw `perf_event_open(2)` syscall and the mmap
//! setup that follows it. Attribute construction (which counters, which
//! sample format) belongs to the session/config layer, not the core; this
//! module only owns the fd and its ring geometry once opened.

use std::os::fd::{AsRawFd, RawFd};

use perf_event_open_sys::bindings::perf_event_attr;

use super::mmap::{page_size, MmapRegion, PerfRingbufferMmap};

pub struct PerfEventFd {
    fd: RawFd,
}

impl PerfEventFd {
    /// Opens a perf event for `cpu` (-1 for any) and `pid` (-1 for
    /// system-wide), per `perf_event_open(2)`.
    pub fn open(attr: &mut perf_event_attr, pid: i32, cpu: i32, group_fd: i32, flags: u64) -> std::io::Result<Self> {
        let fd = unsafe { perf_event_open_sys::perf_event_open(attr, pid, cpu, group_fd, flags as libc::c_ulong) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { fd: fd as RawFd })
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Maps `data_pages` pages of DATA ring (plus the control header page)
    /// and, if `aux_pages > 0`, a separate AUX ring.
    pub fn mmap_rings(&self, data_pages: usize, aux_pages: usize) -> std::io::Result<PerfRingbufferMmap> {
        let page = page_size();
        let data_len = (1 + data_pages) * page;
        let data_region = MmapRegion::map(self.fd, data_len, 0)?;
        let mut ring = PerfRingbufferMmap::new(data_region);

        if aux_pages > 0 {
            // aux_offset/aux_size must be populated in the control page
            // before mapping; the caller is expected to have set them via
            // the attr (AUX_WATERMARK) or a prior ioctl before calling this.
            let aux_len = aux_pages * page;
            let header = ring.header_ref();
            let aux_offset = header.aux_offset as i64 / page as i64;
            let aux_region = MmapRegion::map(self.fd, aux_len, aux_offset)?;
            ring.set_aux_mapping(aux_region);
        }

        Ok(ring)
    }
}

impl AsRawFd for PerfEventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for PerfEventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
