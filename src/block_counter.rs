//! Block-counter encoder and consumer: turns timestamped per-core/per-thread
//! counter samples into delta-encoded `BLOCK_COUNTER` frames.

use std::sync::Arc;

use crate::buffer::{OutboundBuffer, MAX_FRAME_HEADER_SIZE};
use crate::codec::{MAX_PACK32, MAX_PACK64};
use crate::frame::FrameType;

/// `time >= next_commit` or `force` triggers a commit; a `commit_rate_ns`
/// of zero disables the time-based trigger entirely, leaving `force` as the
/// only way to close a frame.
pub struct CommitTimeChecker {
    commit_rate_ns: u64,
    next_commit_ns: u64,
}

impl CommitTimeChecker {
    pub fn new(commit_rate_ns: u64) -> Self {
        Self {
            commit_rate_ns,
            next_commit_ns: commit_rate_ns,
        }
    }

    pub fn check(&mut self, time_ns: u64, force: bool) -> bool {
        if force || (self.commit_rate_ns > 0 && time_ns >= self.next_commit_ns) {
            self.next_commit_ns = time_ns + self.commit_rate_ns;
            true
        } else {
            false
        }
    }
}

/// Wraps the raw outbound buffer, opening/closing `BLOCK_COUNTER` frames and
/// writing delta-encoded events into them.
pub struct BlockCounterFrameBuilder {
    raw: Arc<OutboundBuffer>,
    checker: CommitTimeChecker,
    is_frame_started: bool,
}

impl BlockCounterFrameBuilder {
    pub fn new(raw: Arc<OutboundBuffer>, commit_rate_ns: u64) -> Self {
        Self {
            raw,
            checker: CommitTimeChecker::new(commit_rate_ns),
            is_frame_started: false,
        }
    }

    fn check_space(&self, bytes: usize) -> bool {
        self.raw.bytes_available() as i64 >= bytes as i64
    }

    fn ensure_frame_started(&mut self) -> bool {
        if self.is_frame_started {
            return true;
        }
        if !self.check_space(MAX_FRAME_HEADER_SIZE + MAX_PACK32) {
            return false;
        }
        self.raw.begin_frame(FrameType::BlockCounter);
        self.raw.pack_int(0); // core, fixed at zero on frame entry
        self.is_frame_started = true;
        true
    }

    fn end_frame_if_started(&mut self) -> bool {
        if self.is_frame_started {
            self.raw.end_frame();
            self.is_frame_started = false;
            true
        } else {
            false
        }
    }

    pub fn event_header(&mut self, time_ns: u64) -> bool {
        if !self.ensure_frame_started() {
            return false;
        }
        if self.check_space(MAX_PACK32 + MAX_PACK64) {
            self.raw.pack_int(0);
            self.raw.pack_i64(time_ns as i64);
            true
        } else {
            false
        }
    }

    pub fn event_core(&mut self, core: i32) -> bool {
        if !self.ensure_frame_started() {
            return false;
        }
        if self.check_space(2 * MAX_PACK32) {
            self.raw.pack_int(2);
            self.raw.pack_int(core);
            true
        } else {
            false
        }
    }

    pub fn event_tid(&mut self, tid: i32) -> bool {
        if !self.ensure_frame_started() {
            return false;
        }
        if self.check_space(2 * MAX_PACK32) {
            self.raw.pack_int(1);
            self.raw.pack_int(tid);
            true
        } else {
            false
        }
    }

    pub fn event64(&mut self, key: i32, value: i64) -> bool {
        if !self.ensure_frame_started() {
            return false;
        }
        if self.check_space(MAX_PACK64 + MAX_PACK32) {
            self.raw.pack_int(key);
            self.raw.pack_i64(value);
            true
        } else {
            false
        }
    }

    /// Closes the frame iff the checker decides a commit is due (or the raw
    /// buffer's own watermark is over, which is passed in as `force`).
    pub fn check(&mut self, time_ns: u64) -> bool {
        let force = self.raw.needs_flush();
        if self.checker.check(time_ns, force) {
            self.flush_frame_only()
        } else {
            false
        }
    }

    fn flush_frame_only(&mut self) -> bool {
        self.end_frame_if_started()
    }

    /// Unconditionally closes the frame and drains the raw builder.
    pub fn flush(&mut self) -> bool {
        let ended = self.end_frame_if_started();
        self.raw.flush();
        ended
    }
}

impl Drop for BlockCounterFrameBuilder {
    fn drop(&mut self) {
        self.end_frame_if_started();
    }
}

const INVALID_LAST_EVENT_TIME: u64 = u64::MAX;

/// Sits above [`BlockCounterFrameBuilder`], tracking `(last_t, last_core,
/// last_tid)` so that only changed context fields are re-emitted.
pub struct BlockCounterMessageConsumer {
    builder: BlockCounterFrameBuilder,
    last_event_time: u64,
    last_event_core: i32,
    last_event_tid: i32,
}

impl BlockCounterMessageConsumer {
    pub fn new(builder: BlockCounterFrameBuilder) -> Self {
        Self {
            builder,
            last_event_time: INVALID_LAST_EVENT_TIME,
            last_event_core: 0,
            last_event_tid: 0,
        }
    }

    /// Convenience wrapper for single-threaded counters (`tid` defaults to 0).
    pub fn counter_message(&mut self, time_ns: u64, core: i32, key: i32, value: i64) -> bool {
        self.thread_counter_message(time_ns, core, 0, key, value)
    }

    pub fn thread_counter_message(
        &mut self,
        time_ns: u64,
        core: i32,
        tid: i32,
        key: i32,
        value: i64,
    ) -> bool {
        if self.last_event_time != time_ns || self.last_event_time == INVALID_LAST_EVENT_TIME {
            if !self.builder.event_header(time_ns) {
                return false;
            }
            self.last_event_time = time_ns;
            // A new timestamp implicitly resets the running TID.
            self.last_event_tid = 0;
        }

        if self.last_event_core != core {
            if !self.builder.event_core(core) {
                return false;
            }
            self.last_event_core = core;
        }

        if self.last_event_tid != tid {
            if !self.builder.event_tid(tid) {
                return false;
            }
            self.last_event_tid = tid;
        }

        if !self.builder.event64(key, value) {
            return false;
        }

        if self.builder.check(time_ns) {
            self.last_event_time = INVALID_LAST_EVENT_TIME;
            self.last_event_core = 0;
            self.last_event_tid = 0;
        }

        true
    }

    pub fn flush(&mut self) -> bool {
        self.builder.flush()
    }
}

/// The seam concrete out-of-core polled drivers (disk/net/meminfo/...) plug
/// into: anything that can produce `(key, value)` counter samples on demand.
pub trait PolledCounterSource: Send {
    fn poll(&mut self, now_ns: u64) -> Vec<(i32, i64)>;
    fn core(&self) -> i32 {
        0
    }
}

/// Drives an arbitrary set of [`PolledCounterSource`]s on a fixed tick,
/// feeding their output into a shared consumer.
pub struct PolledDriverRunner {
    sources: Vec<Box<dyn PolledCounterSource>>,
}

impl PolledDriverRunner {
    pub fn new(sources: Vec<Box<dyn PolledCounterSource>>) -> Self {
        Self { sources }
    }

    pub fn poll_all(&mut self, consumer: &mut BlockCounterMessageConsumer, now_ns: u64) {
        for source in &mut self.sources {
            let core = source.core();
            for (key, value) in source.poll(now_ns) {
                consumer.counter_message(now_ns, core, key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferMode;
    use crate::codec;

    fn new_consumer(commit_rate_ns: u64) -> (Arc<OutboundBuffer>, BlockCounterMessageConsumer) {
        let raw = OutboundBuffer::new(BufferMode::Streaming, false);
        let builder = BlockCounterFrameBuilder::new(raw.clone(), commit_rate_ns);
        (raw, BlockCounterMessageConsumer::new(builder))
    }

    fn drain(raw: &OutboundBuffer) -> Vec<u8> {
        raw.set_done();
        let mut out = Vec::new();
        raw.write(&mut out).unwrap();
        out
    }

    #[test]
    fn e1_single_counter_frame_body() {
        let (raw, mut consumer) = new_consumer(0);
        assert!(consumer.thread_counter_message(1000, 0, 0, 42, 7));
        drop(consumer);

        let out = drain(&raw);
        // response_type + u32_le length header
        assert_eq!(out[0], 1);
        let len = u32::from_le_bytes(out[1..5].try_into().unwrap()) as usize;
        let body = &out[5..5 + len];

        let mut pos = 0usize;
        let frame_type = codec::unpack_i32(body, &mut pos);
        assert_eq!(frame_type, FrameType::BlockCounter.value());
        let core = codec::unpack_i32(body, &mut pos);
        assert_eq!(core, 0);
        let key0 = codec::unpack_i32(body, &mut pos);
        assert_eq!(key0, 0);
        let time = codec::unpack_i64(body, &mut pos);
        assert_eq!(time, 1000);
        let key1 = codec::unpack_i32(body, &mut pos);
        assert_eq!(key1, 42);
        let value = codec::unpack_i64(body, &mut pos);
        assert_eq!(value, 7);
        assert_eq!(pos, body.len());
    }

    #[test]
    fn e2_delta_encoding_across_core_change() {
        let (raw, mut consumer) = new_consumer(0);
        assert!(consumer.thread_counter_message(1000, 0, 0, 42, 7));
        assert!(consumer.thread_counter_message(1000, 1, 0, 42, 9));
        drop(consumer);

        let out = drain(&raw);
        let len = u32::from_le_bytes(out[1..5].try_into().unwrap()) as usize;
        let body = &out[5..5 + len];
        let mut pos = 0usize;
        let _ft = codec::unpack_i32(body, &mut pos);
        let _core0 = codec::unpack_i32(body, &mut pos);
        // first event: header(0) + time(1000), value(42, 7)
        assert_eq!(codec::unpack_i32(body, &mut pos), 0);
        assert_eq!(codec::unpack_i64(body, &mut pos), 1000);
        assert_eq!(codec::unpack_i32(body, &mut pos), 42);
        assert_eq!(codec::unpack_i64(body, &mut pos), 7);
        // second event: no repeated timestamp, only core(1) then value(42,9)
        assert_eq!(codec::unpack_i32(body, &mut pos), 2);
        assert_eq!(codec::unpack_i32(body, &mut pos), 1);
        assert_eq!(codec::unpack_i32(body, &mut pos), 42);
        assert_eq!(codec::unpack_i64(body, &mut pos), 9);
        assert_eq!(pos, body.len());
    }

    #[test]
    fn e3_explicit_flush_resets_delta_state_between_events() {
        let (raw, mut consumer) = new_consumer(0);
        for i in 0..5 {
            assert!(consumer.thread_counter_message(1000, 0, 0, 42, i));
        }
        // commit_rate_ns = 0 never self-triggers; force a boundary explicitly.
        consumer.flush();
        for i in 5..10 {
            assert!(consumer.thread_counter_message(1000, 0, 0, 42, i));
        }
        drop(consumer);

        let out = drain(&raw);
        // Two independent APC_DATA records, each re-emitting the full preamble.
        let mut cursor = 0usize;
        let mut records = 0;
        while cursor < out.len() {
            assert_eq!(out[cursor], 1);
            let len = u32::from_le_bytes(out[cursor + 1..cursor + 5].try_into().unwrap()) as usize;
            let body = &out[cursor + 5..cursor + 5 + len];
            let mut pos = 0usize;
            let _ft = codec::unpack_i32(body, &mut pos);
            let _core = codec::unpack_i32(body, &mut pos);
            let key = codec::unpack_i32(body, &mut pos);
            assert_eq!(key, 0, "each record must re-emit the timestamp preamble");
            cursor += 5 + len;
            records += 1;
        }
        assert_eq!(records, 2);
    }

    #[test]
    fn commit_time_checker_zero_rate_never_self_triggers() {
        let mut checker = CommitTimeChecker::new(0);
        assert!(!checker.check(0, false));
        assert!(!checker.check(1_000_000, false));
        assert!(checker.check(1_000_000, true));
    }

    #[test]
    fn commit_time_checker_advances_schedule() {
        let mut checker = CommitTimeChecker::new(100);
        assert!(!checker.check(50, false));
        assert!(checker.check(100, false));
        assert!(!checker.check(150, false));
        assert!(checker.check(200, false));
    }
}
