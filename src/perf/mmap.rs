//! Perf ring mapping: the `(data_mapping, aux_mapping)` pair backing one
//! per-CPU perf event fd.
//!
//! `data_mapping` is `(1 + 2^n)` pages, the first page being the kernel's
//! `perf_event_mmap_page` control header; `aux_mapping`, if present, is
//! `2^m` pages addressed via `aux_head`/`aux_tail` in that same header.
//! Both regions are unmapped on drop.

use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, Ordering};

use memmap2::MmapRaw;
use perf_event_open_sys::bindings::perf_event_mmap_page;

/// RAII wrapper around one `mmap` region backing a perf ring. Mirrors the
/// move-only, auto-`munmap`-on-drop semantics of the original's
/// `mmap_ptr_t`, but delegates the mapping itself to [`memmap2::MmapRaw`] —
/// the same wrapper `perf-event`'s own sampler uses, since the ring's
/// control header must stay writable by the kernel underneath us and a
/// safe `Mmap`/`MmapMut` borrow model doesn't fit that.
pub struct MmapRegion {
    mmap: MmapRaw,
    len: usize,
}

unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// Maps `len` bytes of `fd` at the given page offset, `MAP_SHARED`.
    pub fn map(fd: RawFd, len: usize, page_offset: i64) -> std::io::Result<Self> {
        use std::os::unix::io::FromRawFd;
        let offset = (page_offset * page_size() as i64) as u64;
        // `fd` is owned by the caller (the perf event fd outlives the
        // mapping); we borrow it for the duration of the mmap call only.
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(borrowed.as_raw_fd()) });
        let mmap = memmap2::MmapOptions::new().offset(offset).len(len).map_raw(&*file)?;
        Ok(Self { mmap, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }
}

#[cfg(test)]
impl MmapRegion {
    /// Builds a region over an anonymous memfd so other modules' tests can
    /// exercise a [`PerfRingbufferMmap`] without a real perf fd.
    pub(crate) fn anonymous_for_test(len: usize) -> Self {
        let mmap = memmap2::MmapOptions::new().len(len).map_anon().expect("anonymous mmap");
        Self { mmap: mmap.into(), len }
    }
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A `(data_mapping, aux_mapping)` pair over one perf event fd.
pub struct PerfRingbufferMmap {
    page_size: usize,
    data_mapping: MmapRegion,
    aux_mapping: Option<MmapRegion>,
}

impl PerfRingbufferMmap {
    pub fn new(data_mapping: MmapRegion) -> Self {
        Self {
            page_size: page_size(),
            data_mapping,
            aux_mapping: None,
        }
    }

    pub fn has_data(&self) -> bool {
        !self.data_mapping.is_empty()
    }

    pub fn has_aux(&self) -> bool {
        self.has_data() && self.aux_mapping.as_ref().is_some_and(|m| !m.is_empty())
    }

    pub fn set_aux_mapping(&mut self, mapping: MmapRegion) {
        assert!(self.has_data(), "data region must be mapped before aux");
        self.aux_mapping = Some(mapping);
    }

    fn header(&self) -> *mut perf_event_mmap_page {
        self.data_mapping.as_mut_ptr() as *mut perf_event_mmap_page
    }

    /// The kernel-visible control page. Reading through this requires the
    /// acquire/release discipline documented on [`Self::data_head`] et al.
    pub fn header_ref(&self) -> &perf_event_mmap_page {
        unsafe { &*self.header() }
    }

    /// Acquire-load of `data_head`; must be read before consuming any bytes
    /// the kernel has written.
    pub fn data_head(&self) -> u64 {
        let value = unsafe { std::ptr::read_volatile(&(*self.header()).data_head) };
        fence(Ordering::Acquire);
        value
    }

    /// Release-store of `data_tail`, publishing how much the consumer has
    /// read back to the kernel.
    pub fn set_data_tail(&self, tail: u64) {
        fence(Ordering::Release);
        unsafe { std::ptr::write_volatile(&mut (*self.header()).data_tail, tail) };
    }

    pub fn aux_head(&self) -> u64 {
        let value = unsafe { std::ptr::read_volatile(&(*self.header()).aux_head) };
        fence(Ordering::Acquire);
        value
    }

    pub fn set_aux_tail(&self, tail: u64) {
        fence(Ordering::Release);
        unsafe { std::ptr::write_volatile(&mut (*self.header()).aux_tail, tail) };
    }

    pub fn data_offset(&self) -> u64 {
        self.header_ref().data_offset
    }

    pub fn data_size(&self) -> u64 {
        self.header_ref().data_size
    }

    pub fn aux_offset(&self) -> u64 {
        self.header_ref().aux_offset
    }

    pub fn aux_size(&self) -> u64 {
        self.header_ref().aux_size
    }

    /// The data ring, skipping the control-page-sized prefix.
    pub fn data_span(&self) -> &[u8] {
        if !self.has_data() {
            return &[];
        }
        unsafe {
            std::slice::from_raw_parts(
                self.data_mapping.as_ptr().add(self.page_size),
                self.data_mapping.len() - self.page_size,
            )
        }
    }

    pub fn aux_span(&self) -> &[u8] {
        match &self.aux_mapping {
            Some(mapping) => unsafe { std::slice::from_raw_parts(mapping.as_ptr(), mapping.len()) },
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_region_round_trips_head_tail() {
        // Use an anonymous mapping (no real perf fd) purely to exercise the
        // cursor bookkeeping; page content is whatever the kernel zero-fills.
        let len = page_size() * 2;
        let region = MmapRegion::anonymous_for_test(len);
        let ring = PerfRingbufferMmap::new(region);

        assert!(ring.has_data());
        assert!(!ring.has_aux());
        assert_eq!(ring.data_head(), 0);

        ring.set_data_tail(128);
        assert_eq!(ring.header_ref().data_tail, 128);
    }
}
