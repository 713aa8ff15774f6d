//! Wall-clock ↔ monotonic ↔ architectural-timer synchronization subsystem
//! (§4.5): one pinned, best-effort-SCHED_FIFO thread per CPU that needs
//! timer correlation, publishing a `PERF_SYNC` sample every 500ms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::OutboundBuffer;
use crate::frame::FrameType;
use crate::timebase;

const SYNC_INTERVAL: Duration = Duration::from_millis(500);

/// Decides how many sync threads a capture needs.
pub fn required_sync_thread_count(spe_requested: bool, kernel_supports_clock_id: bool, num_cpus: usize) -> usize {
    if spe_requested {
        num_cpus
    } else if !kernel_supports_clock_id {
        1
    } else {
        0
    }
}

/// One pinned sync thread for CPU `cpu`. `read_timer` selects whether
/// `CNTFRQ_EL0`/`CNTVCT_EL0` are actually read (aarch64 only) or reported
/// as zero.
pub struct SyncThread {
    cpu: i32,
    terminate: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SyncThread {
    /// `monotonic_base` is the capture's session-start timestamp (the same
    /// value sent to the agent as `AgentMessage::Start::monotonic_start`);
    /// CPU 0's thread uses it to derive the `gds-<micros>-` name below.
    pub fn spawn(cpu: i32, read_timer: bool, raw: Arc<OutboundBuffer>, monotonic_base: u64) -> Self {
        let terminate = Arc::new(AtomicBool::new(false));
        let terminate_for_thread = terminate.clone();

        let handle = std::thread::Builder::new()
            .name(format!("gator-sync-{cpu}"))
            .spawn(move || {
                sync_thread_main(cpu, read_timer, raw, terminate_for_thread, monotonic_base);
            })
            .expect("failed to spawn sync thread");

        Self {
            cpu,
            terminate,
            handle: Some(handle),
        }
    }

    pub fn terminate(&mut self) {
        self.terminate.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn cpu(&self) -> i32 {
        self.cpu
    }
}

impl Drop for SyncThread {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn sync_thread_main(cpu: i32, read_timer: bool, raw: Arc<OutboundBuffer>, terminate: Arc<AtomicBool>, monotonic_base: u64) {
    pin_to_cpu(cpu);
    if cpu == 0 {
        rename_cpu0_thread(monotonic_base);
    }
    raise_priority_best_effort();
    mask_all_signals();
    std::thread::yield_now();

    let pid = std::process::id() as i32;
    let tid = nix::unistd::gettid().as_raw();

    while !terminate.load(Ordering::Acquire) {
        let t_ns = timebase::monotonic_raw_now_ns();
        let (cntfrq, cntvct) = if read_timer {
            timebase::read_architectural_timer()
        } else {
            (0, 0)
        };

        emit_sync_record(&raw, pid, tid, cntfrq, t_ns, cntvct);

        std::thread::sleep(SYNC_INTERVAL);
    }
}

/// Packs and immediately commits a `PERF_SYNC` frame with body
/// `{pid, tid, cntfrq, monotonic_raw, cntvct}`. Sync records bypass the
/// delta-encoded block-counter path entirely; each sample is self-contained.
fn emit_sync_record(raw: &OutboundBuffer, pid: i32, tid: i32, cntfrq: u64, monotonic_raw: u64, cntvct: u64) {
    raw.begin_frame(FrameType::PerfSync);
    raw.pack_int(pid);
    raw.pack_int(tid);
    raw.pack_i64(cntfrq as i64);
    raw.pack_i64(monotonic_raw as i64);
    raw.pack_i64(cntvct as i64);
    raw.end_frame();
    raw.flush();
}

fn pin_to_cpu(cpu: i32) {
    let mut set = nix::sched::CpuSet::new();
    if set.set(cpu as usize).is_ok() {
        // Best-effort: an invalid or offline CPU just leaves this thread
        // unpinned rather than failing the whole capture.
        let _ = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set);
    }
}

fn raise_priority_best_effort() {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let param = libc::sched_param {
            sched_priority: max,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            // Fall back to SCHED_OTHER; it only supports priority 0, so
            // there is nothing further to raise.
            let other_param = libc::sched_param { sched_priority: 0 };
            libc::sched_setscheduler(0, libc::SCHED_OTHER, &other_param);
        }
    }
}

fn mask_all_signals() {
    let all = nix::sys::signal::SigSet::all();
    let _ = nix::sys::signal::pthread_sigmask(nix::sys::signal::SigmaskHow::SIG_BLOCK, Some(&all), None);
}

/// CPU 0's sync thread identifies itself by the micros elapsed since the
/// session's monotonic base instead of the generic `gator-sync-0` name
/// (§4.5 step 5), so a thread dump alone carries a capture-relative
/// timestamp. Once `micros` no longer fits `TASK_COMM_LEN` alongside the
/// `gds-`/`-` decoration, the rename is skipped and the static name stands.
fn cpu0_thread_name(monotonic_base: u64) -> String {
    cpu0_thread_name_at(timebase::monotonic_raw_now_ns(), monotonic_base)
}

fn cpu0_thread_name_at(now: u64, monotonic_base: u64) -> String {
    let micros = now.saturating_sub(monotonic_base) / 1000;
    let candidate = format!("gds-{micros}-");
    if micros.to_string().len() > 10 || candidate.len() > 15 {
        "gator-sync-0".to_string()
    } else {
        candidate
    }
}

fn rename_cpu0_thread(monotonic_base: u64) {
    let name = cpu0_thread_name(monotonic_base);
    if let Ok(c_name) = std::ffi::CString::new(name) {
        unsafe {
            libc::prctl(libc::PR_SET_NAME, c_name.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferMode;
    use crate::codec;

    #[test]
    fn thread_count_follows_spe_and_clock_id_rules() {
        assert_eq!(required_sync_thread_count(true, true, 8), 8);
        assert_eq!(required_sync_thread_count(false, false, 8), 1);
        assert_eq!(required_sync_thread_count(false, true, 8), 0);
    }

    #[test]
    fn e4_sync_record_frame_body() {
        let raw = OutboundBuffer::new(BufferMode::Streaming, false);
        emit_sync_record(&raw, 100, 101, 100_000_000, 2_000_000_000, 12345);
        raw.set_done();

        let mut out = Vec::new();
        raw.write(&mut out).unwrap();

        let len = u32::from_le_bytes(out[1..5].try_into().unwrap()) as usize;
        let body = &out[5..5 + len];
        let mut pos = 0usize;
        assert_eq!(codec::unpack_i32(body, &mut pos), FrameType::PerfSync.value());
        assert_eq!(codec::unpack_i32(body, &mut pos), 100);
        assert_eq!(codec::unpack_i32(body, &mut pos), 101);
        assert_eq!(codec::unpack_i64(body, &mut pos), 100_000_000);
        assert_eq!(codec::unpack_i64(body, &mut pos), 2_000_000_000);
        assert_eq!(codec::unpack_i64(body, &mut pos), 12345);
        assert_eq!(pos, body.len());
    }

    #[test]
    fn cpu0_name_uses_elapsed_micros_since_base() {
        let base = timebase::monotonic_raw_now_ns();
        let name = cpu0_thread_name(base);
        assert!(name.starts_with("gds-"));
        assert!(name.ends_with('-'));
        assert!(name.len() <= 15);
    }

    #[test]
    fn cpu0_name_falls_back_once_micros_overflow_ten_digits() {
        let name = cpu0_thread_name_at(10_000_000_000_000, 0); // 1e10 micros, 11 digits
        assert_eq!(name, "gator-sync-0");
    }

    #[test]
    fn cpu0_name_stays_within_ten_digits_of_micros() {
        let name = cpu0_thread_name_at(9_999_999_999_000, 0); // 9,999,999,999 micros, 10 digits
        assert_eq!(name, "gds-9999999999-");
    }
}
