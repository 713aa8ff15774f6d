//! Agent IPC wire framing (§4.7): each message crosses the pipe as a fixed
//! `{u32 kind, u32 length}` header followed by an opaque body. The body
//! schema itself is not the core's concern — callers that need structured
//! payloads (pid lists, capture config) encode/decode them before handing
//! bytes to [`encode`]/after reading them from [`decode`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Typed union of messages exchanged between the parent worker and the
/// agent process, per the dispatch table in §4.6.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Ready,
    CaptureReady { pids: Vec<i32> },
    CaptureStarted,
    CaptureFailed { reason: String },
    ApcFrame { bytes: Vec<u8> },
    ExecTargetApp,
    Shutdown,
    /// Outgoing only: instructs the agent to begin capturing at the given
    /// monotonic timestamp.
    Start { monotonic_start: u64 },
    /// Outgoing only: the bundled session configuration, sent once on `Ready`.
    CaptureConfig(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Kind {
    Ready = 0,
    CaptureReady = 1,
    CaptureStarted = 2,
    CaptureFailed = 3,
    ApcFrame = 4,
    ExecTargetApp = 5,
    Shutdown = 6,
    Start = 7,
    CaptureConfig = 8,
}

impl Kind {
    fn from_u32(v: u32) -> io::Result<Self> {
        Ok(match v {
            0 => Kind::Ready,
            1 => Kind::CaptureReady,
            2 => Kind::CaptureStarted,
            3 => Kind::CaptureFailed,
            4 => Kind::ApcFrame,
            5 => Kind::ExecTargetApp,
            6 => Kind::Shutdown,
            7 => Kind::Start,
            8 => Kind::CaptureConfig,
            other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown IPC message kind {other}"))),
        })
    }
}

/// Writes `{u32 kind, u32 length}` followed by the body.
pub fn encode(message: &AgentMessage, out: &mut impl Write) -> io::Result<()> {
    let (kind, body) = match message {
        AgentMessage::Ready => (Kind::Ready, Vec::new()),
        AgentMessage::CaptureReady { pids } => {
            let mut body = Vec::with_capacity(4 + pids.len() * 4);
            body.write_u32::<LittleEndian>(pids.len() as u32)?;
            for pid in pids {
                body.write_i32::<LittleEndian>(*pid)?;
            }
            (Kind::CaptureReady, body)
        }
        AgentMessage::CaptureStarted => (Kind::CaptureStarted, Vec::new()),
        AgentMessage::CaptureFailed { reason } => (Kind::CaptureFailed, reason.clone().into_bytes()),
        AgentMessage::ApcFrame { bytes } => (Kind::ApcFrame, bytes.clone()),
        AgentMessage::ExecTargetApp => (Kind::ExecTargetApp, Vec::new()),
        AgentMessage::Shutdown => (Kind::Shutdown, Vec::new()),
        AgentMessage::Start { monotonic_start } => {
            let mut body = Vec::with_capacity(8);
            body.write_u64::<LittleEndian>(*monotonic_start)?;
            (Kind::Start, body)
        }
        AgentMessage::CaptureConfig(bytes) => (Kind::CaptureConfig, bytes.clone()),
    };

    out.write_u32::<LittleEndian>(kind as u32)?;
    out.write_u32::<LittleEndian>(body.len() as u32)?;
    out.write_all(&body)?;
    Ok(())
}

/// Reads one framed message. Returns `Ok(None)` on a clean EOF between
/// messages (the header itself was not present), matching the usual
/// framed-reader convention for detecting peer shutdown.
pub fn decode(input: &mut impl Read) -> io::Result<Option<AgentMessage>> {
    let kind = match input.read_u32::<LittleEndian>() {
        Ok(v) => v,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    let kind = Kind::from_u32(kind)?;
    let length = input.read_u32::<LittleEndian>()? as usize;

    let mut body = vec![0u8; length];
    input.read_exact(&mut body)?;

    let message = match kind {
        Kind::Ready => AgentMessage::Ready,
        Kind::CaptureReady => {
            let mut cursor = io::Cursor::new(&body);
            let count = cursor.read_u32::<LittleEndian>()? as usize;
            let mut pids = Vec::with_capacity(count);
            for _ in 0..count {
                pids.push(cursor.read_i32::<LittleEndian>()?);
            }
            AgentMessage::CaptureReady { pids }
        }
        Kind::CaptureStarted => AgentMessage::CaptureStarted,
        Kind::CaptureFailed => AgentMessage::CaptureFailed {
            reason: String::from_utf8_lossy(&body).into_owned(),
        },
        Kind::ApcFrame => AgentMessage::ApcFrame { bytes: body },
        Kind::ExecTargetApp => AgentMessage::ExecTargetApp,
        Kind::Shutdown => AgentMessage::Shutdown,
        Kind::Start => {
            let mut cursor = io::Cursor::new(&body);
            let monotonic_start = cursor.read_u64::<LittleEndian>()?;
            AgentMessage::Start { monotonic_start }
        }
        Kind::CaptureConfig => AgentMessage::CaptureConfig(body),
    };

    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: AgentMessage) -> AgentMessage {
        let mut buf = Vec::new();
        encode(&message, &mut buf).unwrap();
        decode(&mut io::Cursor::new(buf)).unwrap().unwrap()
    }

    #[test]
    fn capture_ready_round_trips_pid_list() {
        match round_trip(AgentMessage::CaptureReady { pids: vec![10, 20, 30] }) {
            AgentMessage::CaptureReady { pids } => assert_eq!(pids, vec![10, 20, 30]),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn apc_frame_round_trips_bytes() {
        match round_trip(AgentMessage::ApcFrame { bytes: vec![1, 2, 3, 4] }) {
            AgentMessage::ApcFrame { bytes } => assert_eq!(bytes, vec![1, 2, 3, 4]),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decode_returns_none_on_clean_eof() {
        let mut empty = io::Cursor::new(Vec::new());
        assert!(decode(&mut empty).unwrap().is_none());
    }

    #[test]
    fn start_round_trips_monotonic_start() {
        match round_trip(AgentMessage::Start { monotonic_start: 123_456_789 }) {
            AgentMessage::Start { monotonic_start } => assert_eq!(monotonic_start, 123_456_789),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
