// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The OpenSSH mux wire format, or the slice of it this server speaks.
//!
//! Every message is a 4-byte big-endian length prefix followed by that many
//! payload bytes; the payload starts with a 4-byte big-endian message type.
//! Strings are length-prefixed raw bytes, booleans are a u32 (zero or not).
//! Message types and layouts come from OpenSSH's PROTOCOL.mux.

use anyhow::{bail, Result};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MUX_MSG_HELLO: u32 = 0x0000_0001;
pub const MUX_C_NEW_SESSION: u32 = 0x1000_0002;
pub const MUX_C_ALIVE_CHECK: u32 = 0x1000_0004;
pub const MUX_S_EXIT_MESSAGE: u32 = 0x8000_0004;
pub const MUX_S_ALIVE: u32 = 0x8000_0005;
pub const MUX_S_SESSION_OPENED: u32 = 0x8000_0006;

/// Upper bound on a single mux frame. A legitimate NEW_SESSION is tiny;
/// anything bigger than this is a confused or hostile client.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// The mux messages this server understands, in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxMessage {
    Hello {
        version: u32,
    },
    AliveCheck {
        request_id: u32,
    },
    Alive {
        request_id: u32,
        server_pid: u32,
    },
    NewSession(NewSession),
    SessionOpened {
        client_request_id: u32,
        session_id: u32,
    },
    Exit {
        session_id: u32,
        exit_code: u32,
    },
}

/// Payload of a NEW_SESSION request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewSession {
    pub request_id: u32,
    pub reserved: String,
    pub want_tty: bool,
    pub want_x11: bool,
    pub want_agent: bool,
    pub subsystem: bool,
    pub escape_char: u32,
    pub terminal_type: String,
    pub command: String,
}

impl MuxMessage {
    pub fn message_type(&self) -> u32 {
        match self {
            MuxMessage::Hello { .. } => MUX_MSG_HELLO,
            MuxMessage::AliveCheck { .. } => MUX_C_ALIVE_CHECK,
            MuxMessage::Alive { .. } => MUX_S_ALIVE,
            MuxMessage::NewSession(_) => MUX_C_NEW_SESSION,
            MuxMessage::SessionOpened { .. } => MUX_S_SESSION_OPENED,
            MuxMessage::Exit { .. } => MUX_S_EXIT_MESSAGE,
        }
    }

    /// Serialize to a frame payload (message type included, length prefix
    /// not).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, self.message_type());
        match self {
            MuxMessage::Hello { version } => put_u32(&mut out, *version),
            MuxMessage::AliveCheck { request_id } => put_u32(&mut out, *request_id),
            MuxMessage::Alive {
                request_id,
                server_pid,
            } => {
                put_u32(&mut out, *request_id);
                put_u32(&mut out, *server_pid);
            }
            MuxMessage::NewSession(ns) => {
                put_u32(&mut out, ns.request_id);
                put_string(&mut out, &ns.reserved);
                put_bool(&mut out, ns.want_tty);
                put_bool(&mut out, ns.want_x11);
                put_bool(&mut out, ns.want_agent);
                put_bool(&mut out, ns.subsystem);
                put_u32(&mut out, ns.escape_char);
                put_string(&mut out, &ns.terminal_type);
                put_string(&mut out, &ns.command);
            }
            MuxMessage::SessionOpened {
                client_request_id,
                session_id,
            } => {
                put_u32(&mut out, *client_request_id);
                put_u32(&mut out, *session_id);
            }
            MuxMessage::Exit {
                session_id,
                exit_code,
            } => {
                put_u32(&mut out, *session_id);
                put_u32(&mut out, *exit_code);
            }
        }
        out
    }

    /// Parse a frame payload. Short payloads and unknown message types are
    /// errors; the caller drops the offending connection.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let msg_type = r.u32()?;
        let msg = match msg_type {
            MUX_MSG_HELLO => MuxMessage::Hello { version: r.u32()? },
            MUX_C_ALIVE_CHECK => MuxMessage::AliveCheck { request_id: r.u32()? },
            MUX_S_ALIVE => MuxMessage::Alive {
                request_id: r.u32()?,
                server_pid: r.u32()?,
            },
            MUX_C_NEW_SESSION => MuxMessage::NewSession(NewSession {
                request_id: r.u32()?,
                reserved: r.string()?,
                want_tty: r.bool()?,
                want_x11: r.bool()?,
                want_agent: r.bool()?,
                subsystem: r.bool()?,
                escape_char: r.u32()?,
                terminal_type: r.string()?,
                command: r.string()?,
            }),
            MUX_S_SESSION_OPENED => MuxMessage::SessionOpened {
                client_request_id: r.u32()?,
                session_id: r.u32()?,
            },
            MUX_S_EXIT_MESSAGE => MuxMessage::Exit {
                session_id: r.u32()?,
                exit_code: r.u32()?,
            },
            other => bail!("unknown mux message type {other:#010x}"),
        };
        Ok(msg)
    }
}

/// Whether a new session should have local stdin copied to the remote. The
/// copy eats the first keystroke after the session ends and control drops
/// back to an interactive shell, so it only runs when the session really
/// needs stdin: a TTY, a shell (empty command), or an scp sink.
pub fn wants_stdin(want_tty: bool, command: &str) -> bool {
    want_tty || command.is_empty() || command.contains("scp -t")
}

/// Read one length-prefixed frame and return its payload.
pub async fn read_frame<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len < 4 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("mux frame length {len} out of range"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one payload as a length-prefixed frame.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn u32(&mut self) -> Result<u32> {
        if self.buf.len() < 4 {
            bail!("short read: wanted 4 bytes, have {}", self.buf.len());
        }
        let (head, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u32()? != 0)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        if self.buf.len() < len {
            bail!("short read: wanted {len} bytes, have {}", self.buf.len());
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(String::from_utf8_lossy(head).into_owned())
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_bool(out: &mut Vec<u8>, value: bool) {
    put_u32(out, u32::from(value));
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_round_trip() {
        let msg = MuxMessage::Hello { version: 4 };
        assert_eq!(MuxMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_new_session_round_trip() {
        let msg = MuxMessage::NewSession(NewSession {
            request_id: 7,
            reserved: String::new(),
            want_tty: true,
            want_x11: false,
            want_agent: false,
            subsystem: false,
            escape_char: 0xffff_ffff,
            terminal_type: "xterm-256color".into(),
            command: "uptime".into(),
        });
        assert_eq!(MuxMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut payload = Vec::new();
        put_u32(&mut payload, 0x1000_0099);
        assert!(MuxMessage::decode(&payload).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_string() {
        let mut payload = Vec::new();
        put_u32(&mut payload, MUX_C_NEW_SESSION);
        put_u32(&mut payload, 1);
        put_u32(&mut payload, 64); // claims a 64-byte string with no bytes behind it
        assert!(MuxMessage::decode(&payload).is_err());
    }

    #[test]
    fn test_wants_stdin() {
        assert!(wants_stdin(true, "vmstat 1"));
        assert!(wants_stdin(false, ""));
        assert!(wants_stdin(false, "scp -t /tmp/"));
        assert!(!wants_stdin(false, "uptime"));
    }
}
