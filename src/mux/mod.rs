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

//! A ControlMaster server per live host: a UNIX socket speaking enough of
//! the OpenSSH mux sub-protocol that an unmodified `ssh -S <socket>` can
//! run alive-checks and exec/shell sessions over our pre-established
//! connection.

pub mod fdpass;
pub mod protocol;

pub use protocol::{MuxMessage, NewSession};

use anyhow::{bail, Context, Result};
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ssh::Client;
use crate::{Env, SSH_PORT};

/// Where a host's control socket lives: `{control_path}/{host}_{port}`,
/// the layout ssh expects from a `ControlPath` setting.
pub fn control_socket_path(dir: &Path, host: &str) -> PathBuf {
    dir.join(format!("{host}_{SSH_PORT}"))
}

/// Handle to one running control-master server.
pub struct Mux {
    events_tx: mpsc::Sender<MuxEvent>,
}

enum MuxEvent {
    Frame {
        payload: Vec<u8>,
        stream: UnixStream,
    },
    Kill {
        reply: oneshot::Sender<()>,
    },
}

impl Mux {
    /// Bind the control socket for `host` and start serving it. Refuses to
    /// clobber an existing path: a leftover socket means another instance
    /// (live or crashed) owns this host.
    pub async fn bind(host: &str, client: Client, env: Env) -> Result<Self> {
        let sock_path = control_socket_path(&env.cfg.control_path, host);
        if sock_path.exists() {
            bail!("socket {} already exists", sock_path.display());
        }
        let listener = UnixListener::bind(&sock_path)
            .with_context(|| format!("couldn't bind control socket {}", sock_path.display()))?;

        let (events_tx, events_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            events_tx.clone(),
            cancel.clone(),
            host.to_string(),
        ));
        let server = MuxServer {
            me: host.to_string(),
            client,
            sock_path,
            cancel,
            session_counter: 0,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(server.serve(events_rx));
        Ok(Self { events_tx })
    }

    /// Stop accepting and remove the socket. Sessions already in progress
    /// run to completion; they just can't report back.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .events_tx
            .send(MuxEvent::Kill { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    events_tx: mpsc::Sender<MuxEvent>,
    cancel: CancellationToken,
    me: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(read_into(stream, events_tx.clone(), me.clone()));
                }
                Err(e) => {
                    debug!("{me}: control socket accept failed: {e}");
                    return;
                }
            }
        }
    }
}

/// Read one frame off a connection and hand it (and the connection) to the
/// serving task. Connections that can't produce a whole frame are dropped
/// here.
async fn read_into(mut stream: UnixStream, events_tx: mpsc::Sender<MuxEvent>, me: String) {
    match protocol::read_frame(&mut stream).await {
        Ok(payload) => {
            let _ = events_tx.send(MuxEvent::Frame { payload, stream }).await;
        }
        Err(e) => {
            debug!("{me}: control socket read failed: {e}");
        }
    }
}

struct MuxServer {
    me: String,
    client: Client,
    sock_path: PathBuf,
    cancel: CancellationToken,
    session_counter: u32,
    events_tx: mpsc::Sender<MuxEvent>,
}

impl MuxServer {
    async fn serve(mut self, mut events_rx: mpsc::Receiver<MuxEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                MuxEvent::Kill { reply } => {
                    self.cancel.cancel();
                    let _ = std::fs::remove_file(&self.sock_path);
                    let _ = reply.send(());
                    return;
                }
                MuxEvent::Frame { payload, stream } => {
                    // A bad frame costs that connection, nothing more.
                    match MuxMessage::decode(&payload) {
                        Ok(msg) => self.dispatch(msg, stream).await,
                        Err(e) => debug!("{}: dropping control connection: {e:#}", self.me),
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, msg: MuxMessage, mut stream: UnixStream) {
        match msg {
            MuxMessage::Hello { version } => {
                // The client's version goes straight back; nothing is
                // checked against it.
                let reply = MuxMessage::Hello { version };
                if let Err(e) = protocol::write_frame(&mut stream, &reply.encode()).await {
                    debug!("{}: hello reply failed: {e}", self.me);
                    return;
                }
                self.rearm(stream);
            }
            MuxMessage::AliveCheck { request_id } => {
                let reply = MuxMessage::Alive {
                    request_id,
                    server_pid: std::process::id(),
                };
                if let Err(e) = protocol::write_frame(&mut stream, &reply.encode()).await {
                    debug!("{}: alive reply failed: {e}", self.me);
                    return;
                }
                self.rearm(stream);
            }
            MuxMessage::NewSession(ns) => {
                if let Err(e) = self.new_session(ns, stream).await {
                    debug!("{}: new session failed: {e:#}", self.me);
                }
            }
            other => {
                debug!(
                    "{}: unhandled mux message {:#010x}",
                    self.me,
                    other.message_type()
                );
            }
        }
    }

    /// Go back to listening for the next frame on this connection.
    fn rearm(&self, stream: UnixStream) {
        tokio::spawn(read_into(stream, self.events_tx.clone(), self.me.clone()));
    }

    async fn new_session(&mut self, ns: NewSession, mut stream: UnixStream) -> Result<()> {
        let channel = self.client.open_session().await?;
        let session_id = self.session_counter;
        self.session_counter = self.session_counter.wrapping_add(1);

        let opened = MuxMessage::SessionOpened {
            client_request_id: ns.request_id,
            session_id,
        };
        protocol::write_frame(&mut stream, &opened.encode())
            .await
            .context("session-opened send failed")?;

        // Exactly three descriptors follow, one message each: the client's
        // stdin, stdout, and stderr, in that order.
        let mut fds: [RawFd; 3] = [-1; 3];
        for slot in fds.iter_mut() {
            let fd = fdpass::recv_fd(&stream)
                .await
                .context("stdio descriptor receive failed")?;
            fdpass::set_cloexec(fd).context("couldn't mark descriptor close-on-exec")?;
            *slot = fd;
        }

        let local_stdin = file_from_fd(fds[0]);
        let local_stdout = file_from_fd(fds[1]);
        let local_stderr = file_from_fd(fds[2]);

        if ns.want_tty {
            // Size the PTY from whatever terminal is on the client's
            // stdout; pipes and files fall back to the classic 80x24.
            let (rows, cols) = match fdpass::win_size(local_stdout.as_raw_fd()) {
                Ok(dims) => dims,
                Err(e) => {
                    debug!("{}: winsize query failed: {e}", self.me);
                    (24, 80)
                }
            };
            let modes = [
                (Pty::ECHO, 0),
                (Pty::TTY_OP_ISPEED, 14400),
                (Pty::TTY_OP_OSPEED, 14400),
            ];
            channel
                .request_pty(
                    false,
                    &ns.terminal_type,
                    u32::from(cols),
                    u32::from(rows),
                    0,
                    0,
                    &modes,
                )
                .await
                .context("PTY request failed")?;
        }

        if !ns.command.is_empty() {
            channel
                .exec(true, ns.command.as_str())
                .await
                .context("exec request failed")?;
        } else {
            channel
                .request_shell(false)
                .await
                .context("shell request failed")?;
        }

        if protocol::wants_stdin(ns.want_tty, &ns.command) {
            let mut writer = channel.make_writer();
            let mut local_stdin = local_stdin;
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut local_stdin, &mut writer).await;
            });
        }

        tokio::spawn(session_waiter(
            stream,
            channel,
            session_id,
            local_stdout,
            local_stderr,
            self.me.clone(),
        ));
        Ok(())
    }
}

/// Pump remote output into the client's descriptors until the session
/// ends, then report the exit code over the control connection.
async fn session_waiter(
    mut stream: UnixStream,
    mut channel: Channel<Msg>,
    session_id: u32,
    mut stdout: File,
    mut stderr: File,
    me: String,
) {
    let mut exit_code: u32 = 0;
    let mut saw_status = false;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => {
                if let Err(e) = stdout.write_all(data).await {
                    debug!("{me}: stdout relay failed: {e}");
                }
            }
            ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                if let Err(e) = stderr.write_all(data).await {
                    debug!("{me}: stderr relay failed: {e}");
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = exit_status;
                saw_status = true;
            }
            _ => {}
        }
    }
    if !saw_status {
        debug!("{me}: no exit status, faking it");
        exit_code = 255;
    }
    let _ = stdout.flush().await;
    let _ = stderr.flush().await;

    let exit = MuxMessage::Exit {
        session_id,
        exit_code,
    };
    if let Err(e) = protocol::write_frame(&mut stream, &exit.encode()).await {
        debug!("{me}: exit report failed: {e}");
    }
    let _ = stream.shutdown().await;
}

/// Take ownership of a descriptor received over the control socket.
fn file_from_fd(fd: RawFd) -> File {
    let std_file = unsafe { std::fs::File::from_raw_fd(fd) };
    File::from_std(std_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_socket_path_shape() {
        let path = control_socket_path(Path::new("/home/me/.ssh/control"), "web-01.dc1");
        assert_eq!(
            path,
            PathBuf::from("/home/me/.ssh/control/web-01.dc1_22")
        );
    }
}
