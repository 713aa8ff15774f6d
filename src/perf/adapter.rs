//! `PerfToMemoryBuffer`: forwards chunks read from the perf ring mmap into
//! the outbound buffer as `PERF_AUX` and `PERF_DATA` frames.

use std::sync::Arc;

use crate::buffer::OutboundBuffer;
use crate::frame::{FrameType, MAX_RESPONSE_LENGTH};

use super::consumer::{take_aux_chunk, take_data_chunk, Chunk};
use super::mmap::PerfRingbufferMmap;

/// Rough per-frame header budget reserved before computing how much of a
/// chunk fits in one `PERF_AUX` frame: cpu varint + tail varint64 + length
/// varint, each at worst-case width.
const AUX_HEADER_BUDGET: usize = crate::codec::MAX_PACK32 * 2 + crate::codec::MAX_PACK64;

/// Bytes the adapter waits to have free before opening any new frame.
const BACKPRESSURE_THRESHOLD: usize = 4096;

pub struct PerfToMemoryBuffer {
    buffer: Arc<OutboundBuffer>,
    full: bool,
    max_response_length: usize,
}

impl PerfToMemoryBuffer {
    pub fn new(buffer: Arc<OutboundBuffer>) -> Self {
        Self::with_max_response_length(buffer, MAX_RESPONSE_LENGTH)
    }

    /// Exposed so tests can exercise AUX fragmentation without allocating a
    /// multi-megabyte record; production callers use [`Self::new`].
    pub fn with_max_response_length(buffer: Arc<OutboundBuffer>, max_response_length: usize) -> Self {
        Self {
            buffer,
            full: false,
            max_response_length,
        }
    }

    pub fn is_full(&self) -> bool {
        self.full || self.buffer.is_full()
    }

    pub fn set_done(&self) {
        self.buffer.set_done();
    }

    async fn wait_for(&mut self, bytes: usize) -> bool {
        if self.buffer.wait_for_space(bytes).await {
            true
        } else {
            self.full = true;
            false
        }
    }

    /// Drains whatever is newly available in the DATA ring for `cpu` into
    /// one or more `PERF_DATA` frames, one frame per physical ring window,
    /// splitting on `MAX_RESPONSE_LENGTH`.
    pub async fn consume_data(&mut self, cpu: i32, ring: &PerfRingbufferMmap) -> bool {
        if self.is_full() {
            return false;
        }
        let Some(chunk) = take_data_chunk(ring) else {
            return true;
        };

        if !self.wait_for(BACKPRESSURE_THRESHOLD).await {
            return false;
        }

        self.write_data_frame(cpu, &chunk);
        true
    }

    fn write_data_frame(&self, cpu: i32, chunk: &Chunk<'_>) {
        self.buffer.begin_frame(FrameType::PerfData);
        self.buffer.pack_int(cpu);

        let length_index = self.buffer.write_index();
        // Placeholder length field, patched with `write_direct` once the
        // body has actually been streamed.
        self.buffer.write_bytes(&[0u8; 4]);

        let mut written = 0usize;
        for word in iter_u64_words(chunk) {
            written += self.buffer.pack_i64(word as i64);
        }

        self.buffer
            .write_direct(length_index, &(written as u32).to_le_bytes());
        self.buffer.end_frame();
    }

    /// Drains whatever is newly available in the AUX ring for `cpu`,
    /// possibly emitting many `PERF_AUX` frames with strictly monotonic
    /// `tail` values.
    pub async fn consume_aux(&mut self, cpu: i32, ring: &PerfRingbufferMmap) -> bool {
        if self.is_full() {
            return false;
        }
        let Some((start_tail, chunk)) = take_aux_chunk(ring) else {
            return true;
        };

        let mut tail = start_tail;
        let mut offset = 0usize;
        let total = chunk.len();

        while offset < total {
            if !self.wait_for(BACKPRESSURE_THRESHOLD).await {
                return false;
            }

            let budget = self.max_response_length - AUX_HEADER_BUDGET;
            let remaining = total - offset;
            let take = remaining.min(budget);

            self.buffer.begin_frame(FrameType::PerfAux);
            self.buffer.pack_int(cpu);
            self.buffer.pack_i64(tail as i64);
            self.buffer.pack_int(take as i32);

            write_chunk_range(&self.buffer, &chunk, offset, take);

            self.buffer.end_frame();

            offset += take;
            tail += take as u64;
            ring.set_aux_tail(tail);
        }

        true
    }
}

fn iter_u64_words(chunk: &Chunk<'_>) -> impl Iterator<Item = u64> + '_ {
    let bytes: Vec<u8> = chunk
        .primary
        .iter()
        .chain(chunk.secondary.iter())
        .copied()
        .collect();
    (0..bytes.len() / 8).map(move |i| {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
        u64::from_le_bytes(word)
    })
}

fn write_chunk_range(buffer: &OutboundBuffer, chunk: &Chunk<'_>, offset: usize, len: usize) {
    let primary_len = chunk.primary.len();
    let mut remaining = len;
    let mut pos = offset;

    if pos < primary_len {
        let take = remaining.min(primary_len - pos);
        buffer.write_bytes(&chunk.primary[pos..pos + take]);
        remaining -= take;
        pos += take;
    }

    if remaining > 0 {
        let sec_pos = pos - primary_len;
        buffer.write_bytes(&chunk.secondary[sec_pos..sec_pos + remaining]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferMode;
    use crate::codec;

    #[tokio::test]
    async fn aux_split_emits_monotonic_tails_summing_to_total() {
        // Build a synthetic AUX ring (anonymous mapping) with a 3000-byte
        // record sitting at tail 0, matching scenario E5.
        let page_size = super::super::mmap::page_size();
        let data_len = page_size * 2;
        let data_region = super::super::mmap::MmapRegion::anonymous_for_test(data_len);

        let aux_size = 4096usize;
        let aux_region = super::super::mmap::MmapRegion::anonymous_for_test(aux_size);

        let mut ring = PerfRingbufferMmap::new(data_region);
        ring.set_aux_mapping(aux_region);

        let header = ring.header_ref() as *const _ as *mut perf_event_open_sys::bindings::perf_event_mmap_page;
        let record_len = 3000u64;
        unsafe {
            (*header).aux_offset = 0;
            (*header).aux_size = aux_size as u64;
            (*header).aux_head = record_len;
            (*header).aux_tail = 0;
        }

        let buffer = OutboundBuffer::new(BufferMode::Streaming, false);
        let mut adapter = PerfToMemoryBuffer::with_max_response_length(buffer.clone(), 1024);
        adapter.consume_aux(2, &ring).await;
        buffer.set_done();

        let mut out = Vec::new();
        buffer.write(&mut out).unwrap();

        let mut cursor = 0usize;
        let mut tails = Vec::new();
        let mut total_bytes = 0usize;
        while cursor < out.len() {
            assert_eq!(out[cursor], 1);
            let len = u32::from_le_bytes(out[cursor + 1..cursor + 5].try_into().unwrap()) as usize;
            let body = &out[cursor + 5..cursor + 5 + len];
            let mut pos = 0usize;
            let frame_type = codec::unpack_i32(body, &mut pos);
            assert_eq!(frame_type, FrameType::PerfAux.value());
            let cpu = codec::unpack_i32(body, &mut pos);
            assert_eq!(cpu, 2);
            let tail = codec::unpack_i64(body, &mut pos);
            let length = codec::unpack_i32(body, &mut pos);
            tails.push(tail as u64);
            total_bytes += length as usize;
            cursor += 5 + len;
        }

        assert!(tails.len() >= 3);
        assert_eq!(total_bytes, record_len as usize);
        for pair in tails.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert_eq!(*tails.first().unwrap(), 0);
    }
}
