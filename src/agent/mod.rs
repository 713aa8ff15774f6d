//! Agent IPC worker state machine (§4.6): the parent-side state machine
//! that owns the child agent process holding the privileged perf handles.
//! Dispatch runs on a strand — here a `tokio::sync::Mutex<()>` guard held
//! for the duration of each message handler, so handlers never interleave
//! even though they may each await.

pub mod ipc;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use ipc::AgentMessage;

/// Forward-only lifecycle. Ordinal order matters: a CAS transition is only
/// accepted if the new state's ordinal is greater than the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    Initial = 0,
    Ready = 1,
    ShutdownRequested = 2,
    ShutdownReceived = 3,
    TerminatedPendingMessageLoop = 4,
    Terminated = 5,
}

impl AgentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AgentState::Initial,
            1 => AgentState::Ready,
            2 => AgentState::ShutdownRequested,
            3 => AgentState::ShutdownReceived,
            4 => AgentState::TerminatedPendingMessageLoop,
            _ => AgentState::Terminated,
        }
    }
}

/// Atomic, CAS-guarded state cell enforcing the forward-only transition
/// rule described in §4.6: a transition that does not strictly advance the
/// ordinal is a silent no-op, matching the original's "not a forward move"
/// contract.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(AgentState::Initial as u8))
    }

    fn get(&self) -> AgentState {
        AgentState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempts to move to `target`; returns `true` iff the transition was
    /// actually applied.
    fn advance_to(&self, target: AgentState) -> bool {
        loop {
            let current = self.0.load(Ordering::Acquire);
            if target as u8 <= current {
                return false;
            }
            if self
                .0
                .compare_exchange(current, target as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Reasons a capture can fail, surfaced via [`CaptureObserver::on_capture_failed`].
#[derive(Debug, Clone)]
pub enum CaptureFailureReason {
    CommandExecFailed(String),
}

/// Callbacks the rest of the daemon implements to learn about agent
/// lifecycle events. Exactly mirrors the dispatch table in §4.6.
pub trait CaptureObserver: Send {
    fn on_capture_ready(&mut self, pids: Vec<i32>);
    fn on_capture_started(&mut self);
    fn on_capture_failed(&mut self, reason: CaptureFailureReason);
    fn on_apc_frame_received(&mut self, bytes: Vec<u8>);
    fn exec_target_app(&mut self);
    fn on_capture_completed(&mut self);
    fn set_controller(&mut self, controller: Arc<dyn CaptureController>);
}

/// The handle the rest of the daemon uses to start/stop a capture without a
/// cyclic dependency on the worker or the observer (`perf_capture_controller_t`
/// in the original).
#[async_trait::async_trait]
pub trait CaptureController: Send + Sync {
    /// Sends `Start{monotonic_start}`; resolves once the message has been
    /// *sent* — not once the capture has actually begun.
    async fn start_capture(&self, monotonic_start: u64) -> bool;

    /// Initiates shutdown by sending `Shutdown`.
    async fn stop_capture(&self) -> bool;
}

struct Controller {
    outbound: mpsc::UnboundedSender<AgentMessage>,
    state: Arc<StateCell>,
}

#[async_trait::async_trait]
impl CaptureController for Controller {
    async fn start_capture(&self, monotonic_start: u64) -> bool {
        self.outbound
            .send(AgentMessage::Start { monotonic_start })
            .is_ok()
    }

    async fn stop_capture(&self) -> bool {
        request_shutdown(&self.state, &self.outbound)
    }
}

fn request_shutdown(state: &StateCell, outbound: &mpsc::UnboundedSender<AgentMessage>) -> bool {
    state.advance_to(AgentState::ShutdownRequested);
    outbound.send(AgentMessage::Shutdown).is_ok()
}

/// The parent-side worker. `O` is the observer the daemon supplies;
/// `capture_config` is the bytes sent once the agent reports `Ready`.
pub struct AgentWorker<O: CaptureObserver> {
    state: Arc<StateCell>,
    outbound: mpsc::UnboundedSender<AgentMessage>,
    strand: Mutex<()>,
    observer: O,
    capture_config: Vec<u8>,
}

impl<O: CaptureObserver> AgentWorker<O> {
    pub fn new(outbound: mpsc::UnboundedSender<AgentMessage>, observer: O, capture_config: Vec<u8>) -> Self {
        Self {
            state: Arc::new(StateCell::new()),
            outbound,
            strand: Mutex::new(()),
            observer,
            capture_config,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state.get()
    }

    /// Hands the observer its controller, then drains `inbound` until it
    /// closes or a `Shutdown`/SIGCHLD terminal transition is reached.
    /// Mirrors the original's `start()`: construct the controller, publish
    /// it to the observer, then run the receive loop, finally tearing down
    /// on exit regardless of how the loop ended.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<AgentMessage>) {
        let controller = Arc::new(Controller {
            outbound: self.outbound.clone(),
            state: self.state.clone(),
        });
        self.observer.set_controller(controller);

        while let Some(message) = inbound.recv().await {
            let _guard = self.strand.lock().await;
            if self.dispatch(message).await {
                break;
            }
        }

        self.state.advance_to(AgentState::TerminatedPendingMessageLoop);
        if self.state.get() != AgentState::Terminated {
            request_shutdown(&self.state, &self.outbound);
        }
    }

    /// Returns `true` once the receive loop should stop.
    async fn dispatch(&mut self, message: AgentMessage) -> bool {
        match message {
            AgentMessage::Ready => {
                self.state.advance_to(AgentState::Ready);
                if self.outbound.send(AgentMessage::CaptureConfig(self.capture_config.clone())).is_err() {
                    request_shutdown(&self.state, &self.outbound);
                }
                false
            }
            AgentMessage::CaptureReady { pids } => {
                self.observer.on_capture_ready(pids);
                false
            }
            AgentMessage::CaptureStarted => {
                self.observer.on_capture_started();
                false
            }
            AgentMessage::CaptureFailed { reason } => {
                self.observer.on_capture_failed(CaptureFailureReason::CommandExecFailed(reason));
                false
            }
            AgentMessage::ApcFrame { bytes } => {
                self.observer.on_apc_frame_received(bytes);
                false
            }
            AgentMessage::ExecTargetApp => {
                self.observer.exec_target_app();
                false
            }
            AgentMessage::Shutdown => {
                self.state.advance_to(AgentState::ShutdownReceived);
                false
            }
            AgentMessage::Start { .. } | AgentMessage::CaptureConfig(_) => {
                // Outgoing-only variants; never received by the parent.
                false
            }
        }
    }

    /// Called on `SIGCHLD` for this agent's pid: transitions straight to
    /// `terminated`, notifies the observer, and signals the receive loop
    /// should stop (by closing `inbound` — the caller drops its sender).
    pub fn on_sigchild(&mut self) {
        self.state.advance_to(AgentState::Terminated);
        self.observer.on_capture_completed();
    }
}

/// Spawns a one-shot task that resolves once `controller.start_capture`
/// would be acknowledged; exists purely to mirror the "resolve a
/// continuation with a boolean" idiom from the original without requiring
/// every caller to hold an executor handle directly.
pub async fn start_capture_and_wait(controller: Arc<dyn CaptureController>, monotonic_start: u64) -> bool {
    let (tx, rx) = oneshot::channel();
    let sent = controller.start_capture(monotonic_start).await;
    let _ = tx.send(sent);
    rx.await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        ready_pids: Vec<i32>,
        started: bool,
        failed: Option<String>,
        frames: Vec<Vec<u8>>,
        completed: bool,
    }

    impl CaptureObserver for RecordingObserver {
        fn on_capture_ready(&mut self, pids: Vec<i32>) {
            self.ready_pids = pids;
        }
        fn on_capture_started(&mut self) {
            self.started = true;
        }
        fn on_capture_failed(&mut self, reason: CaptureFailureReason) {
            self.failed = Some(match reason {
                CaptureFailureReason::CommandExecFailed(s) => s,
            });
        }
        fn on_apc_frame_received(&mut self, bytes: Vec<u8>) {
            self.frames.push(bytes);
        }
        fn exec_target_app(&mut self) {}
        fn on_capture_completed(&mut self) {
            self.completed = true;
        }
        fn set_controller(&mut self, _controller: Arc<dyn CaptureController>) {}
    }

    #[tokio::test]
    async fn e6_shutdown_initiated_on_capture_config_send_failure() {
        let (tx, rx) = mpsc::unbounded_channel();
        // Dropping the receiver immediately means the worker's first send
        // (CaptureConfig, on Ready) fails and must trigger a shutdown.
        let (_keep_alive_tx, inbound_rx) = mpsc::unbounded_channel();
        drop(rx);

        let worker = AgentWorker::new(tx, RecordingObserver::default(), vec![1, 2, 3]);
        let state = worker.state.clone();

        let outbound_for_send = worker.outbound.clone();
        outbound_for_send.send(AgentMessage::Ready).unwrap();
        drop(outbound_for_send);
        drop(inbound_rx);

        // Run directly against a fresh channel carrying just the one Ready
        // message so `run` observes exactly the failure path.
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        feed_tx.send(AgentMessage::Ready).unwrap();
        drop(feed_tx);

        worker.run(feed_rx).await;

        assert_eq!(state.get(), AgentState::TerminatedPendingMessageLoop);
    }

    #[tokio::test]
    async fn worker_lifecycle_reaches_terminal_state_on_shutdown_message() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = AgentWorker::new(tx, RecordingObserver::default(), vec![]);
        let state = worker.state.clone();

        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        feed_tx.send(AgentMessage::Shutdown).unwrap();
        drop(feed_tx);

        worker.run(feed_rx).await;

        assert_eq!(state.get(), AgentState::TerminatedPendingMessageLoop);
    }

    #[test]
    fn state_cell_rejects_backward_transitions() {
        let cell = StateCell::new();
        assert!(cell.advance_to(AgentState::Ready));
        assert!(!cell.advance_to(AgentState::Initial));
        assert_eq!(cell.get(), AgentState::Ready);
        assert!(cell.advance_to(AgentState::Terminated));
        assert!(!cell.advance_to(AgentState::Ready));
    }
}
