//! Reads new records out of a [`PerfRingbufferMmap`] and presents them as
//! chunk tuples, splitting a record into `(primary, secondary)` spans
//! whenever it wraps the physical end of the ring.

use super::mmap::PerfRingbufferMmap;

/// One physically contiguous slice of ring bytes, plus the (possibly empty)
/// continuation if the record wrapped the ring.
pub struct Chunk<'a> {
    pub primary: &'a [u8],
    pub secondary: &'a [u8],
}

impl<'a> Chunk<'a> {
    pub fn len(&self) -> usize {
        self.primary.len() + self.secondary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drains whatever is new in the DATA ring since the last `data_tail`,
/// returning it as a single chunk (callers that need smaller windows slice
/// further themselves) and advancing `data_tail`.
pub fn take_data_chunk<'a>(ring: &'a PerfRingbufferMmap) -> Option<Chunk<'a>> {
    let head = ring.data_head();
    let tail_marker = ring.header_ref().data_tail;
    if head == tail_marker {
        return None;
    }

    let span = ring.data_span();
    let size = ring.data_size() as usize;
    if size == 0 {
        return None;
    }
    let mask = size - 1;

    let start = (tail_marker as usize) & mask;
    let avail = (head - tail_marker) as usize;

    let chunk = if start + avail <= span.len() {
        Chunk {
            primary: &span[start..start + avail],
            secondary: &[],
        }
    } else {
        let first_len = span.len() - start;
        Chunk {
            primary: &span[start..start + first_len],
            secondary: &span[0..avail - first_len],
        }
    };

    ring.set_data_tail(head);
    Some(chunk)
}

/// Like [`take_data_chunk`], but for the AUX ring, which is an opaque byte
/// stream (no perf_event record framing) rather than a sequence of fixed
/// headers.
pub fn take_aux_chunk<'a>(ring: &'a PerfRingbufferMmap) -> Option<(u64, Chunk<'a>)> {
    if !ring.has_aux() {
        return None;
    }

    let head = ring.aux_head();
    let tail_marker = ring.header_ref().aux_tail;
    if head == tail_marker {
        return None;
    }

    let span = ring.aux_span();
    let size = ring.aux_size() as usize;
    if size == 0 {
        return None;
    }
    let mask = size - 1;

    let start = (tail_marker as usize) & mask;
    let avail = (head - tail_marker) as usize;

    let chunk = if start + avail <= span.len() {
        Chunk {
            primary: &span[start..start + avail],
            secondary: &[],
        }
    } else {
        let first_len = span.len() - start;
        Chunk {
            primary: &span[start..start + first_len],
            secondary: &span[0..avail - first_len],
        }
    };

    Some((tail_marker, chunk))
}
