//! Annotation sub-protocol server (§6.2): accepts connections from
//! instrumented applications on the abstract-namespace socket
//! `\0streamline-annotate`, parses the client's wire messages, and forwards
//! them onto the outbound buffer as `ANNOTATE`/`COUNTER`/`ACTIVITY_TRACE`
//! frames.

use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::SocketAddr as StdSocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::buffer::OutboundBuffer;
use crate::codec;
use crate::frame::FrameType;

pub const ANNOTATE_SOCKET_NAME: &str = "streamline-annotate";
pub const ANNOTATE_PARENT_SOCKET_NAME: &str = "streamline-annotate-parent";

const HANDSHAKE: &[u8] = b"ANNOTATE 3\n";

/// Client message types, per §6.2's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MessageType {
    Utf8 = 0x01,
    Utf8Color = 0x02,
    ChannelName = 0x03,
    GroupName = 0x04,
    Visual = 0x05,
    Marker = 0x06,
    MarkerColor = 0x07,
    Counter = 0x08,
    CounterValue = 0x09,
    ActivitySwitch = 0x0a,
    CamTrack = 0x0b,
    CamJob = 0x0c,
    CamViewName = 0x0d,
}

impl MessageType {
    fn from_u8(v: u8) -> io::Result<Self> {
        Ok(match v {
            0x01 => MessageType::Utf8,
            0x02 => MessageType::Utf8Color,
            0x03 => MessageType::ChannelName,
            0x04 => MessageType::GroupName,
            0x05 => MessageType::Visual,
            0x06 => MessageType::Marker,
            0x07 => MessageType::MarkerColor,
            0x08 => MessageType::Counter,
            0x09 => MessageType::CounterValue,
            0x0a => MessageType::ActivitySwitch,
            0x0b => MessageType::CamTrack,
            0x0c => MessageType::CamJob,
            0x0d => MessageType::CamViewName,
            other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unrecognized annotate message type 0x{other:02x}"))),
        })
    }

    /// Registration messages are retained verbatim in the per-connection
    /// replay queue; everything else is purely transient.
    fn is_registration(self) -> bool {
        matches!(self, MessageType::ChannelName | MessageType::GroupName | MessageType::Counter)
    }

    fn destination_frame(self) -> FrameType {
        match self {
            MessageType::ActivitySwitch => FrameType::ActivityTrace,
            MessageType::Counter | MessageType::CounterValue => FrameType::Counter,
            _ => FrameType::Annotate,
        }
    }
}

/// Header sent immediately after the handshake string.
#[derive(Debug, Clone, Copy)]
struct ConnectionHeader {
    tid: u32,
    pid: u32,
    dont_mangle_keys: bool,
}

/// Append-only record of registration messages seen on one connection.
/// The original client library replays these across a reconnect on its own;
/// the core only needs to guarantee it never drops or reorders what a single
/// connection sent, which this queue makes auditable.
#[derive(Default)]
struct ReplayQueue {
    entries: Vec<(MessageType, Vec<u8>)>,
}

impl ReplayQueue {
    fn record(&mut self, message_type: MessageType, body: &[u8]) {
        if message_type.is_registration() {
            self.entries.push((message_type, body.to_vec()));
        }
    }
}

pub struct AnnotationServer {
    listener: UnixListener,
    parent_listener: Option<UnixListener>,
    outbound: Arc<OutboundBuffer>,
    /// The outbound buffer is single-producer; connections are handled on
    /// their own tasks, so this serializes their frame emission into one
    /// logical producer instead of letting them race on `begin_frame`.
    write_lock: Arc<Mutex<()>>,
}

impl AnnotationServer {
    pub fn bind(outbound: Arc<OutboundBuffer>) -> io::Result<Self> {
        let listener = bind_abstract(ANNOTATE_SOCKET_NAME)?;
        let parent_listener = bind_abstract(ANNOTATE_PARENT_SOCKET_NAME).ok();
        Ok(Self {
            listener,
            parent_listener,
            outbound,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Accepts connections forever, spawning one task per client.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let outbound = self.outbound.clone();
            let write_lock = self.write_lock.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, outbound, write_lock).await {
                    log::warn!("annotate connection ended: {err}");
                }
            });
        }
    }
}

fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    let addr = StdSocketAddr::from_abstract_name(name.as_bytes())?;
    let std_listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
    std_listener.set_nonblocking(true)?;
    UnixListener::from_std(std_listener)
}

async fn read_handshake(stream: &mut UnixStream) -> io::Result<()> {
    let mut buf = vec![0u8; HANDSHAKE.len()];
    stream.read_exact(&mut buf).await?;
    if buf != HANDSHAKE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad annotate handshake"));
    }
    Ok(())
}

async fn read_header(stream: &mut UnixStream) -> io::Result<ConnectionHeader> {
    let mut buf = [0u8; 9];
    stream.read_exact(&mut buf).await?;
    Ok(ConnectionHeader {
        tid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        pid: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        dont_mangle_keys: buf[8] != 0,
    })
}

async fn handle_connection(mut stream: UnixStream, outbound: Arc<OutboundBuffer>, write_lock: Arc<Mutex<()>>) -> io::Result<()> {
    read_handshake(&mut stream).await?;
    let header = read_header(&mut stream).await?;
    log::debug!(
        "annotate connection from pid={} tid={} dont_mangle_keys={}",
        header.pid,
        header.tid,
        header.dont_mangle_keys
    );

    let replay = Mutex::new(ReplayQueue::default());

    loop {
        let message_type = match stream.read_u8().await {
            Ok(b) => MessageType::from_u8(b)?,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut length_buf = [0u8; 4];
        stream.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;

        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await?;

        replay.lock().unwrap().record(message_type, &body);
        {
            let _guard = write_lock.lock().unwrap();
            forward_to_outbound(&outbound, header, message_type, &body);
        }
    }
}

/// Forwards one client message onto the outbound buffer as a single frame
/// carrying the message type and the raw body; downstream consumers that
/// understand the annotation sub-protocol parse the body further.
fn forward_to_outbound(outbound: &OutboundBuffer, header: ConnectionHeader, message_type: MessageType, body: &[u8]) {
    outbound.begin_frame(message_type.destination_frame());
    outbound.pack_int(header.pid as i32);
    outbound.pack_int(header.tid as i32);
    outbound.pack_int(message_type as i32);
    outbound.pack_int(body.len() as i32);
    outbound.write_bytes(body);
    outbound.end_frame();
}

/// Parses the common `{time, channel}` prefix shared by `UTF8`/`UTF8_COLOR`
/// messages, returning the offset where message-specific fields continue.
#[allow(dead_code)]
fn parse_time_channel_prefix(body: &[u8]) -> (i64, i32, usize) {
    let mut pos = 0usize;
    let time = codec::unpack_i64(body, &mut pos);
    let channel = codec::unpack_i32(body, &mut pos);
    (time, channel, pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferMode;

    #[test]
    fn registration_types_are_tracked_for_replay() {
        assert!(MessageType::ChannelName.is_registration());
        assert!(MessageType::GroupName.is_registration());
        assert!(MessageType::Counter.is_registration());
        assert!(!MessageType::Marker.is_registration());
        assert!(!MessageType::Utf8.is_registration());
    }

    #[test]
    fn forward_to_outbound_emits_one_frame_per_message() {
        let outbound = OutboundBuffer::new(BufferMode::Streaming, false);
        let header = ConnectionHeader {
            tid: 7,
            pid: 42,
            dont_mangle_keys: false,
        };
        forward_to_outbound(&outbound, header, MessageType::Marker, b"hello");
        outbound.set_done();

        let mut out = Vec::new();
        outbound.write(&mut out).unwrap();

        let len = u32::from_le_bytes(out[1..5].try_into().unwrap()) as usize;
        let body = &out[5..5 + len];
        let mut pos = 0usize;
        assert_eq!(codec::unpack_i32(body, &mut pos), FrameType::Annotate.value());
        assert_eq!(codec::unpack_i32(body, &mut pos), 42);
        assert_eq!(codec::unpack_i32(body, &mut pos), 7);
        assert_eq!(codec::unpack_i32(body, &mut pos), MessageType::Marker as i32);
        assert_eq!(codec::unpack_i32(body, &mut pos), 5);
        assert_eq!(&body[pos..pos + 5], b"hello");
    }

    #[test]
    fn destination_frame_routes_by_message_type() {
        assert_eq!(MessageType::ActivitySwitch.destination_frame(), FrameType::ActivityTrace);
        assert_eq!(MessageType::Counter.destination_frame(), FrameType::Counter);
        assert_eq!(MessageType::CounterValue.destination_frame(), FrameType::Counter);
        assert_eq!(MessageType::Marker.destination_frame(), FrameType::Annotate);
    }
}
