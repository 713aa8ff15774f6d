//! The outbound buffer: a fixed-capacity SPSC byte ring that frames are
//! written into and drained out of to a socket or file.
//!
//! The ring distinguishes full from empty by always leaving one byte of
//! slack, so `committed - read <= write - read <= capacity - 1` holds at
//! all times; `capacity` must be a power of two so index arithmetic can use
//! a mask instead of a modulo.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::codec;
use crate::frame::{FrameType, MAX_RESPONSE_LENGTH, RESPONSE_HEADER_LEN, RESPONSE_TYPE_APC_DATA};

/// `1 + size_of::<i32>() + MAX_PACK32`: the worst-case bytes a frame header
/// can occupy (response type + length placeholder + frame-type varint).
pub const MAX_FRAME_HEADER_SIZE: usize = RESPONSE_HEADER_LEN + codec::MAX_PACK32;

/// Buffer capacities selected by a session's `buffer_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Streaming,
    Normal,
    Large,
}

impl BufferMode {
    pub const fn capacity(self) -> usize {
        match self {
            BufferMode::Streaming => 1 << 20,
            BufferMode::Normal => 4 << 20,
            BufferMode::Large => 16 << 20,
        }
    }
}

struct OpenFrame {
    /// Index of the response-record header (response_type byte) in the ring.
    record_start: usize,
    /// Index of the 4-byte length placeholder.
    length_field: usize,
    /// Running count of payload bytes written since `begin_frame`.
    payload_len: usize,
}

/// The shared inner state of an [`OutboundBuffer`]; cheap to clone via `Arc`
/// so a producer half and a sender half can each hold one.
pub struct OutboundBuffer {
    data: Box<[u8]>,
    mask: usize,

    write: AtomicUsize,
    read: AtomicUsize,
    committed: AtomicUsize,

    done: AtomicBool,
    full: AtomicBool,
    one_shot: bool,

    /// Posted by the sender after a drain; producers wait on it for space.
    space_available: Semaphore,

    open_frame: std::sync::Mutex<Option<OpenFrame>>,
}

impl OutboundBuffer {
    pub fn new(mode: BufferMode, one_shot: bool) -> Arc<Self> {
        let capacity = mode.capacity();
        assert!(capacity.is_power_of_two());
        Arc::new(Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            mask: capacity - 1,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            full: AtomicBool::new(false),
            one_shot,
            space_available: Semaphore::new(0),
            open_frame: std::sync::Mutex::new(None),
        })
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Free bytes between `write` and `read`, reserving one byte of slack
    /// so a full ring is distinguishable from an empty one.
    pub fn bytes_available(&self) -> i32 {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        let used = write.wrapping_sub(read);
        (self.capacity() - 1 - used) as i32
    }

    pub fn supports_write_of_size(&self, bytes: usize) -> bool {
        bytes <= self.capacity() - MAX_FRAME_HEADER_SIZE
    }

    pub fn needs_flush(&self) -> bool {
        let committed = self.committed.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        committed.wrapping_sub(read) >= self.capacity() / 2
    }

    /// Wakes the sender so it drains whatever has been committed so far.
    /// Must not be called while a frame is open.
    pub fn flush(&self) {
        self.space_available.add_permits(1);
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    pub fn set_done(&self) {
        self.done.store(true, Ordering::Release);
        self.space_available.add_permits(1);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Blocks until at least `n` bytes are free, or returns `false` if the
    /// buffer is done or operating in one-shot mode and already full.
    /// Must only be called with no frame open.
    pub async fn wait_for_space(&self, n: usize) -> bool {
        loop {
            if self.bytes_available() as usize >= n {
                return true;
            }
            if self.done.load(Ordering::Acquire) {
                return false;
            }
            if self.one_shot {
                self.full.store(true, Ordering::Release);
                return false;
            }
            // Block on a drain signal from the sender.
            let permit = self.space_available.acquire().await;
            drop(permit);
        }
    }

    /// Starts a new frame. Panics if a frame is already open (caller bug,
    /// matching the original's precondition-style contract).
    pub fn begin_frame(&self, frame_type: FrameType) {
        let mut guard = self.open_frame.lock().unwrap();
        assert!(guard.is_none(), "begin_frame called with a frame already open");

        let write = self.write.load(Ordering::Acquire);
        let record_start = write & self.mask;
        let length_field = (write + 1) & self.mask;
        let type_pos = (write + RESPONSE_HEADER_LEN) & self.mask;

        self.raw_write_at(record_start, &[RESPONSE_TYPE_APC_DATA]);

        let mut tmp = [0u8; codec::MAX_PACK32];
        let mut p = 0usize;
        let n = codec::pack_i32(&mut tmp, &mut p, frame_type.value());
        self.raw_write_at(type_pos, &tmp[..n]);

        self.write.store((type_pos + n) & self.mask, Ordering::Release);

        *guard = Some(OpenFrame {
            record_start,
            length_field,
            // `length` covers the frame-type varint plus the body (§6.1), so
            // the n bytes just written for `frame_type` count from the start.
            payload_len: n,
        });
    }

    fn raw_write_at(&self, index: usize, bytes: &[u8]) {
        let data = self.data.as_ptr() as *mut u8;
        let cap = self.capacity();
        for (i, &b) in bytes.iter().enumerate() {
            let idx = (index + i) & self.mask;
            unsafe {
                debug_assert!(idx < cap);
                *data.add(idx) = b;
            }
        }
    }

    fn raw_read_at(&self, index: usize, out: &mut [u8]) {
        for (i, slot) in out.iter_mut().enumerate() {
            let idx = (index + i) & self.mask;
            *slot = self.data[idx];
        }
    }

    pub fn pack_int(&self, value: i32) -> usize {
        let mut tmp = [0u8; codec::MAX_PACK32];
        let mut p = 0usize;
        let n = codec::pack_i32(&mut tmp, &mut p, value);
        self.write_bytes(&tmp[..n]);
        n
    }

    pub fn pack_i64(&self, value: i64) -> usize {
        let mut tmp = [0u8; codec::MAX_PACK64];
        let mut p = 0usize;
        let n = codec::pack_i64(&mut tmp, &mut p, value);
        self.write_bytes(&tmp[..n]);
        n
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        let write = self.write.load(Ordering::Acquire);
        self.raw_write_at(write, bytes);
        self.write.store((write + bytes.len()) & self.mask, Ordering::Release);

        let mut guard = self.open_frame.lock().unwrap();
        if let Some(frame) = guard.as_mut() {
            frame.payload_len += bytes.len();
        }
    }

    pub fn write_string(&self, s: &str) {
        self.pack_int(s.len() as i32);
        self.write_bytes(s.as_bytes());
    }

    /// Rewinds the write cursor to the frame start, discarding the frame.
    pub fn abort_frame(&self) {
        let mut guard = self.open_frame.lock().unwrap();
        let frame = guard.take().expect("abort_frame called with no open frame");
        self.write.store(frame.record_start, Ordering::Release);
    }

    /// Patches the length field, advances the committed marker, and closes
    /// the frame.
    pub fn end_frame(&self) {
        let mut guard = self.open_frame.lock().unwrap();
        let frame = guard.take().expect("end_frame called with no open frame");

        let len_bytes = (frame.payload_len as u32).to_le_bytes();
        self.raw_write_at(frame.length_field, &len_bytes);

        let write = self.write.load(Ordering::Acquire);
        self.committed.store(write, Ordering::Release);
    }

    /// Current write index, for direct-access producers (the perf adapter)
    /// that patch a length field after streaming a variable-sized body.
    pub fn write_index(&self) -> usize {
        self.write.load(Ordering::Acquire)
    }

    pub fn advance_write(&self, bytes: usize) {
        let write = self.write.load(Ordering::Acquire);
        self.write.store((write + bytes) & self.mask, Ordering::Release);
        let mut guard = self.open_frame.lock().unwrap();
        if let Some(frame) = guard.as_mut() {
            frame.payload_len += bytes;
        }
    }

    pub fn write_direct(&self, index: usize, bytes: &[u8]) {
        self.raw_write_at(index, bytes);
    }

    /// Drains committed bytes into `sink`, returning `true` once the buffer
    /// is both `done` and fully drained.
    pub fn write(&self, sink: &mut dyn std::io::Write) -> std::io::Result<bool> {
        let committed = self.committed.load(Ordering::Acquire);
        let mut read = self.read.load(Ordering::Acquire);
        let mut drained_any = false;

        while read != committed {
            let contiguous = contiguous_run(read, committed, self.capacity());
            let mut chunk = vec![0u8; contiguous];
            self.raw_read_at(read, &mut chunk);
            sink.write_all(&chunk)?;
            read = (read + contiguous) & self.mask;
            self.read.store(read, Ordering::Release);
            drained_any = true;
        }

        if drained_any {
            // Freed ring space; wake any producer parked in `wait_for_space`.
            self.space_available.add_permits(1);
        }

        let write = self.write.load(Ordering::Acquire);
        Ok(self.done.load(Ordering::Acquire) && read == write)
    }
}

fn contiguous_run(read: usize, committed: usize, capacity: usize) -> usize {
    let to_end = capacity - (read % capacity);
    let available = committed.wrapping_sub(read);
    to_end.min(available).min(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_write_end_round_trips_through_write() {
        let buf = OutboundBuffer::new(BufferMode::Streaming, false);
        buf.begin_frame(FrameType::BlockCounter);
        buf.pack_int(0); // core
        buf.pack_int(42);
        buf.pack_i64(7);
        buf.end_frame();
        buf.set_done();

        let mut out = Vec::new();
        let drained = buf.write(&mut out).unwrap();
        assert!(drained);
        assert_eq!(out[0], RESPONSE_TYPE_APC_DATA);
        let len = u32::from_le_bytes(out[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, out.len() - RESPONSE_HEADER_LEN);
    }

    #[test]
    fn abort_frame_rewinds_write_cursor() {
        let buf = OutboundBuffer::new(BufferMode::Streaming, false);
        let before = buf.write_index();
        buf.begin_frame(FrameType::Idle);
        buf.pack_int(1234);
        buf.abort_frame();
        assert_eq!(buf.write_index(), before);
        assert_eq!(buf.committed.load(Ordering::Acquire), 0);
    }

    #[test]
    fn needs_flush_triggers_past_watermark() {
        let buf = OutboundBuffer::new(BufferMode::Streaming, false);
        assert!(!buf.needs_flush());
        buf.begin_frame(FrameType::Idle);
        let big = vec![0u8; buf.capacity() / 2];
        buf.write_bytes(&big);
        buf.end_frame();
        assert!(buf.needs_flush());
    }

    #[tokio::test]
    async fn one_shot_mode_marks_full_instead_of_blocking() {
        let buf = OutboundBuffer::new(BufferMode::Streaming, true);
        // Fill past capacity without ever draining.
        let ok = buf.wait_for_space(buf.capacity()).await;
        assert!(!ok);
        assert!(buf.is_full());
    }

    #[test]
    fn supports_write_of_size_reserves_frame_header() {
        let buf = OutboundBuffer::new(BufferMode::Streaming, false);
        assert!(buf.supports_write_of_size(buf.capacity() - MAX_FRAME_HEADER_SIZE));
        assert!(!buf.supports_write_of_size(buf.capacity() - MAX_FRAME_HEADER_SIZE + 1));
    }
}
