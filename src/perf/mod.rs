//! Perf ring-buffer consumer and APC adapter (§4.4).
//!
//! `open` wraps the raw `perf_event_open` syscall and ring mmap setup;
//! `mmap` models the `(data_mapping, aux_mapping)` control-page geometry;
//! `consumer` turns ring content into chunk tuples; `adapter` forwards
//! those chunks into the outbound buffer as `PERF_AUX`/`PERF_DATA` frames.

pub mod adapter;
pub mod consumer;
pub mod mmap;
pub mod open;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::time::{sleep, Duration};

use crate::buffer::OutboundBuffer;

use adapter::PerfToMemoryBuffer;
use mmap::PerfRingbufferMmap;
use open::PerfEventFd;

/// Drives one CPU's perf ring: waits for the fd to become readable (or
/// polls on a short interval, since perf fds are not always edge-ready),
/// then drains whatever arrived into the outbound buffer.
pub struct PerfRingConsumer {
    cpu: i32,
    fd: PerfEventFd,
    ring: PerfRingbufferMmap,
    adapter: PerfToMemoryBuffer,
    stop: Arc<AtomicBool>,
}

impl PerfRingConsumer {
    pub fn new(cpu: i32, fd: PerfEventFd, ring: PerfRingbufferMmap, buffer: Arc<OutboundBuffer>) -> Self {
        Self {
            cpu,
            fd,
            ring,
            adapter: PerfToMemoryBuffer::new(buffer),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs until `stop` is set or the adapter latches `full` in one-shot
    /// mode and the producer side has nothing left to flush.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let async_fd = AsyncFd::new(self.fd.as_raw())?;

        while !self.stop.load(Ordering::Acquire) {
            // perf fds signal readability on overflow wakeup events, but we
            // also want to drain partially-filled rings promptly, so cap
            // the wait rather than blocking indefinitely.
            let wait = tokio::time::timeout(Duration::from_millis(100), async_fd.readable());
            match wait.await {
                Ok(Ok(mut guard)) => {
                    guard.clear_ready();
                }
                Ok(Err(err)) => {
                    log::error!("perf fd for cpu {} errored: {err}", self.cpu);
                    return Err(err.into());
                }
                Err(_timeout) => {}
            }

            if !self.adapter.consume_data(self.cpu, &self.ring).await {
                log::warn!("perf DATA adapter for cpu {} is full, dropping", self.cpu);
            }
            if self.ring.has_aux() && !self.adapter.consume_aux(self.cpu, &self.ring).await {
                log::warn!("perf AUX adapter for cpu {} is full, dropping", self.cpu);
            }

            if self.adapter.is_full() {
                sleep(Duration::from_millis(50)).await;
            }
        }

        self.adapter.set_done();
        Ok(())
    }
}
