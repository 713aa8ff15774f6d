use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::io::{stdin, stdout};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use gatord::agent::ipc::{decode, encode, AgentMessage};
use gatord::agent::{AgentWorker, CaptureController, CaptureFailureReason, CaptureObserver};
use gatord::buffer::OutboundBuffer;
use gatord::cli::{Cli, Command, SessionConfig};
use gatord::frame::FrameType;
use gatord::{timebase, Config, Metrics};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::AgentPerf)) {
        return run_agent();
    }

    init_logging(&cli);
    println!("[gatord] Starting performance-monitoring daemon...");

    let config = Config::load();
    let session = SessionConfig::from_cli(&cli).map_err(|msg| anyhow::anyhow!(msg))?;

    check_capabilities();

    let metrics = Arc::new(Metrics::new());
    spawn_metrics_logger(metrics.clone());

    // Each producer gets its own buffer (§5): the buffer is single-producer,
    // so the annotation server (one task per connection) and the agent
    // worker each need a ring the sender can drain independently rather than
    // racing on a shared one.
    let buffer = gatord::buffer::OutboundBuffer::new(session.buffer_mode, false);
    let annotate_buffer = gatord::buffer::OutboundBuffer::new(session.buffer_mode, false);
    let agent_buffer = gatord::buffer::OutboundBuffer::new(session.buffer_mode, false);

    let annotate_server = gatord::annotate::AnnotationServer::bind(annotate_buffer.clone())
        .context("failed to bind annotation socket")?;
    tokio::spawn(async move {
        if let Err(err) = annotate_server.run().await {
            warn!("[gatord] annotation server exited: {err}");
        }
    });

    let output_path = std::path::PathBuf::from(&config.daemon.apc_output_dir).join("capture0.apc");
    std::fs::create_dir_all(&config.daemon.apc_output_dir).context("failed to create apc output directory")?;
    let sink = std::fs::File::create(&output_path).context("failed to create capture output file")?;
    let sender_handle = gatord::sender::Sender::spawn(vec![buffer.clone(), annotate_buffer.clone(), agent_buffer.clone()], sink);

    let agent = spawn_agent_process(&config, agent_buffer.clone(), metrics.clone())
        .context("failed to start perf capture agent")?;
    let _ = agent.control.send(AgentMessage::Start {
        monotonic_start: timebase::monotonic_raw_now_ns(),
    });

    info!(
        "[gatord] capture session started: buffer_mode={:?} sample_rate={} duration={}s output={}",
        session.buffer_mode, session.sample_rate, session.duration_secs, output_path.display()
    );

    wait_for_shutdown_signal().await;

    info!("[gatord] shutdown signal received, draining outbound buffer");
    let _ = agent.control.send(AgentMessage::Shutdown);
    let AgentHandle {
        control: _,
        worker_task,
        rx_thread,
        tx_thread,
        mut child,
    } = agent;
    let _ = tokio::task::spawn_blocking(move || {
        let _ = child.wait();
        let _ = rx_thread.join();
        let _ = tx_thread.join();
    })
    .await;
    let _ = worker_task.await;

    buffer.set_done();
    annotate_buffer.set_done();
    agent_buffer.set_done();

    let join_result = tokio::task::spawn_blocking(move || sender_handle.join())
        .await
        .context("sender task panicked")?;
    match join_result {
        Ok(write_result) => write_result.context("sender thread failed")?,
        Err(_) => anyhow::bail!("sender thread panicked"),
    }

    Ok(())
}

/// Everything needed to talk to and eventually tear down the `agent-perf`
/// child process: the channel to send it commands, the worker task driving
/// the parent-side state machine, the two blocking bridge threads translating
/// between its framed stdin/stdout and the async channels, and the child
/// itself.
struct AgentHandle {
    control: mpsc::UnboundedSender<AgentMessage>,
    worker_task: tokio::task::JoinHandle<()>,
    rx_thread: std::thread::JoinHandle<()>,
    tx_thread: std::thread::JoinHandle<()>,
    child: std::process::Child,
}

/// Forwards agent lifecycle events into the daemon's own log/metrics, and
/// re-frames `ApcFrame` payloads from the agent as `EXTERNAL` records on the
/// main outbound stream so the viewer sees one continuous capture.
struct GatordObserver {
    outbound: Arc<OutboundBuffer>,
    metrics: Arc<Metrics>,
}

impl CaptureObserver for GatordObserver {
    fn on_capture_ready(&mut self, pids: Vec<i32>) {
        info!("[gatord] agent reported capture-ready pids={pids:?}");
    }

    fn on_capture_started(&mut self) {
        info!("[gatord] agent capture started");
    }

    fn on_capture_failed(&mut self, reason: CaptureFailureReason) {
        let CaptureFailureReason::CommandExecFailed(message) = reason;
        warn!("[gatord] agent capture failed: {message}");
        self.metrics.inc_agent_restarts();
    }

    fn on_apc_frame_received(&mut self, bytes: Vec<u8>) {
        self.outbound.begin_frame(FrameType::External);
        self.outbound.write_bytes(&bytes);
        self.outbound.end_frame();
    }

    fn exec_target_app(&mut self) {
        info!("[gatord] agent is about to exec the target application");
    }

    fn on_capture_completed(&mut self) {
        info!("[gatord] agent capture completed");
    }

    fn set_controller(&mut self, _controller: Arc<dyn CaptureController>) {}
}

/// Re-execs this same binary as `agent-perf` with piped stdin/stdout, and
/// bridges its synchronous framed I/O (§6.3) onto the async channels
/// [`AgentWorker`] expects, via two dedicated OS threads — the same
/// blocking-thread-plus-channel bridge [`gatord::sender`] uses for its sink.
fn spawn_agent_process(config: &Config, buffer: Arc<OutboundBuffer>, metrics: Arc<Metrics>) -> anyhow::Result<AgentHandle> {
    let mut child = std::process::Command::new(&config.daemon.agent_exe_path)
        .arg("agent-perf")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .context("failed to spawn agent-perf child process")?;

    let mut child_stdin = child.stdin.take().expect("agent-perf spawned with piped stdin");
    let mut child_stdout = child.stdout.take().expect("agent-perf spawned with piped stdout");

    let (control, mut rx_to_agent) = mpsc::unbounded_channel::<AgentMessage>();
    let (tx_from_agent, rx_from_agent) = mpsc::unbounded_channel::<AgentMessage>();

    let tx_thread = std::thread::Builder::new()
        .name("gator-agent-tx".into())
        .spawn(move || {
            use std::io::Write;
            while let Some(message) = rx_to_agent.blocking_recv() {
                if encode(&message, &mut child_stdin).is_err() || child_stdin.flush().is_err() {
                    break;
                }
            }
        })
        .context("failed to spawn agent-tx bridge thread")?;

    let rx_thread = std::thread::Builder::new()
        .name("gator-agent-rx".into())
        .spawn(move || loop {
            match decode(&mut child_stdout) {
                Ok(Some(message)) => {
                    if tx_from_agent.send(message).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        })
        .context("failed to spawn agent-rx bridge thread")?;

    let observer = GatordObserver { outbound: buffer, metrics };
    let worker = AgentWorker::new(control.clone(), observer, Vec::new());
    let worker_task = tokio::spawn(worker.run(rx_from_agent));

    Ok(AgentHandle {
        control,
        worker_task,
        rx_thread,
        tx_thread,
        child,
    })
}

fn init_logging(cli: &Cli) {
    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose > 0 && std::env::var("RUST_LOG").is_err() {
        let level = match cli.verbose {
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        builder.filter_level(level);
    }
    builder.init();
}

fn check_capabilities() {
    use caps::{CapSet, Capability};
    match caps::has_cap(None, CapSet::Effective, Capability::CAP_PERFMON) {
        Ok(true) => {}
        Ok(false) => warn!("[gatord] missing CAP_PERFMON; perf_event_open may be restricted"),
        Err(err) => warn!("[gatord] could not query CAP_PERFMON: {err}"),
    }
}

fn spawn_metrics_logger(metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            info!(
                "[gatord] metrics: frames={} bytes={} backpressure_waits={} aux_fragments={} sync_records={}",
                metrics.frames_emitted(),
                metrics.bytes_written(),
                metrics.backpressure_waits(),
                metrics.aux_fragments_emitted(),
                metrics.sync_records_emitted(),
            );
        }
    });
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("[gatord] failed to install SIGTERM handler: {err}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Runs as the privileged `agent-perf` child: a blocking loop over
/// stdin/stdout exchanging the IPC frames defined in `agent::ipc` (§6.3).
/// This process owns the perf handles directly; it never touches tokio.
fn run_agent() -> anyhow::Result<()> {
    env_logger::init();
    info!("[gatord-agent] agent process started");

    let mut input = stdin().lock();
    let mut output = stdout().lock();

    encode(&AgentMessage::Ready, &mut output).context("failed to send Ready")?;
    use std::io::Write;
    output.flush()?;

    while let Some(message) = decode(&mut input).context("failed to decode IPC message")? {
        match message {
            AgentMessage::CaptureConfig(bytes) => {
                info!("[gatord-agent] received capture configuration ({} bytes)", bytes.len());
            }
            AgentMessage::Start { monotonic_start } => {
                info!("[gatord-agent] capture start requested at monotonic={monotonic_start}");
                encode(&AgentMessage::CaptureStarted, &mut output)?;
                output.flush()?;
            }
            AgentMessage::Shutdown => {
                info!("[gatord-agent] shutdown requested");
                break;
            }
            other => {
                warn!("[gatord-agent] unexpected message from parent: {other:?}");
            }
        }
    }

    Ok(())
}
