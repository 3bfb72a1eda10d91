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

//! Remote command execution on a connected host, plus the fan-out helpers
//! that run a command across the whole fleet.

use anyhow::{Context, Result};
use futures::future::join_all;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use super::{arm_organic_timeout, HostRequest, RunRequest};
use crate::ssh::Client;
use crate::state::{WaitInfo, WaitState};
use crate::utils::output;
use crate::Env;

/// What came back from running a command: captured output, the remote exit
/// code, and an error message when the run itself failed locally or the
/// remote process exited non-zero.
#[derive(Debug, Clone, Default)]
pub struct RunResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub err: Option<String>,
}

impl RunResponse {
    fn from_error(err: anyhow::Error) -> Self {
        Self {
            err: Some(format!("{err:#}")),
            ..Default::default()
        }
    }
}

type SharedBuf = Arc<Mutex<Vec<u8>>>;

fn snapshot(buf: &SharedBuf) -> String {
    String::from_utf8_lossy(&buf.lock().unwrap_or_else(|e| e.into_inner())).into_owned()
}

/// Handle one [`RunRequest`] against the given client. Registered as a run
/// waiter and raced against its abort channel; when the timer wins the
/// session is closed (which does not kill the remote process) and the late
/// real response is drained in the background.
pub(crate) async fn run_cmd(me: String, req: RunRequest, client: Client, env: Env) {
    let stdout_buf: SharedBuf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf: SharedBuf = Arc::new(Mutex::new(Vec::new()));
    let (timeout_tx, mut timeout_rx) = mpsc::channel::<bool>(1);

    let spool = if env.cfg.spool {
        match SpoolHandles::create(&env.cfg.spool_dir, &me).await {
            Ok(handles) => Some(handles),
            Err(e) => {
                warn!("spool setup failed: {e:#}");
                warn!("spooling is off for this run; correct and re-run");
                None
            }
        }
    } else {
        None
    };

    env.state
        .set_run_wait_info(WaitInfo::new(&me, WaitState::NewSession, timeout_tx.clone()))
        .await;

    let channel = match client.open_session().await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = req.reply.send(RunResponse::from_error(e));
            env.state.delete_run_wait_info(&me).await;
            return;
        }
    };

    let (close_tx, close_rx) = oneshot::channel::<()>();
    let (done_tx, mut done_rx) = oneshot::channel::<RunResponse>();
    tokio::spawn(drive_session(
        channel,
        req.cmd.clone(),
        stdout_buf.clone(),
        stderr_buf.clone(),
        spool,
        env.clone(),
        me.clone(),
        done_tx,
        close_rx,
    ));
    arm_organic_timeout(timeout_tx, req.timeout);

    tokio::select! {
        resp = &mut done_rx => {
            let resp = resp.unwrap_or_else(|_| {
                RunResponse::from_error(anyhow::anyhow!("run task vanished"))
            });
            let _ = req.reply.send(resp);
        }
        verdict = timeout_rx.recv() => {
            let msg = if verdict.unwrap_or(true) {
                "Remote run timed out"
            } else {
                "Remote run aborted"
            };
            // Closing the session unblocks us locally; OpenSSH has no
            // usable signal support, so the remote process may live on.
            let _ = close_tx.send(());
            let _ = req.reply.send(RunResponse {
                stdout: snapshot(&stdout_buf),
                stderr: snapshot(&stderr_buf),
                exit_code: 0,
                err: Some(msg.to_string()),
            });
            let me = me.clone();
            tokio::spawn(async move {
                if let Ok(straggler) = done_rx.await {
                    debug!("{me}: caught a run straggler (exit {})", straggler.exit_code);
                }
            });
        }
    }

    env.state.delete_run_wait_info(&me).await;
}

/// Drive the session channel to completion: start the command, stream its
/// output into the shared buffers (and the spool files when enabled), and
/// report the exit code.
#[allow(clippy::too_many_arguments)]
async fn drive_session(
    mut channel: Channel<Msg>,
    cmd: String,
    stdout_buf: SharedBuf,
    stderr_buf: SharedBuf,
    mut spool: Option<SpoolHandles>,
    env: Env,
    me: String,
    done_tx: oneshot::Sender<RunResponse>,
    mut close_rx: oneshot::Receiver<()>,
) {
    env.state.set_run_wait_state(&me, WaitState::StartSession).await;
    if let Err(e) = channel.exec(true, cmd.as_str()).await {
        let _ = done_tx.send(RunResponse::from_error(e.into()));
        return;
    }
    env.state.set_run_wait_state(&me, WaitState::Running).await;

    let tee = env.cfg.tee && spool.is_some();
    let mut exit_status: Option<u32> = None;
    let mut close_requested = false;
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    stdout_buf.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(data);
                    if let Some(handles) = spool.as_mut() {
                        if let Err(e) = handles.stdout.write_all(data).await {
                            debug!("{me}: spool stdout write: {e}");
                        }
                    }
                    if tee {
                        output::write_stdout_raw(data);
                    }
                }
                Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                    stderr_buf.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(data);
                    if let Some(handles) = spool.as_mut() {
                        if let Err(e) = handles.stderr.write_all(data).await {
                            debug!("{me}: spool stderr write: {e}");
                        }
                    }
                    if tee {
                        output::write_stderr_raw(data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    // Data may still be in flight after this; keep reading
                    // until the channel actually closes.
                    exit_status = Some(status);
                }
                Some(_) => {}
                None => break,
            },
            _ = &mut close_rx, if !close_requested => {
                close_requested = true;
                let _ = channel.close().await;
            }
        }
    }

    let (exit_code, err) = match exit_status {
        Some(0) => (0, None),
        Some(code) => (code as i32, Some(format!("process exited with status {code}"))),
        None => {
            debug!("{me}: no exit status, faking it");
            (255, Some("session ended without an exit status".to_string()))
        }
    };

    if let Some(handles) = spool.as_mut() {
        if let Err(e) = handles.finish(exit_code).await {
            debug!("{me}: spool finish: {e:#}");
        }
    }

    env.state.set_run_wait_state(&me, WaitState::Done).await;
    let _ = done_tx.send(RunResponse {
        stdout: snapshot(&stdout_buf),
        stderr: snapshot(&stderr_buf),
        exit_code,
        err,
    });
}

/// Run the configured test command once after a successful connect and
/// record the result on the target.
pub async fn run_once(host: &str, cmd: &str, env: &Env, timeout: u64) {
    let start = Instant::now();
    let ci = match env.state.get_conn_info(host).await {
        Ok(ci) => ci,
        Err(e) => {
            debug!("get_conn_info: {e:#}");
            return;
        }
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = HostRequest::Run(RunRequest {
        cmd: cmd.to_string(),
        reply: reply_tx,
        timeout,
    });
    if ci.req_tx.send(request).await.is_err() {
        debug!("{host}: service loop is gone");
        return;
    }
    let Ok(resp) = reply_rx.await else {
        debug!("{host}: run reply dropped");
        return;
    };
    env.state
        .set_run_status(host, resp.err.is_none(), true, start.elapsed(), resp.err);
}

/// Run a command on every connected, non-proxy target in parallel, bounded
/// by the configured concurrency.
pub async fn run_everywhere(cmd: &str, env: &Env, timeout: u64) {
    let limiter = Arc::new(Semaphore::new(env.cfg.concurrency));
    let mut tasks = Vec::new();
    for host in env.state.get_conn_keys().await {
        let ci = match env.state.get_conn_info(&host).await {
            Ok(ci) => ci,
            Err(e) => {
                debug!("get_conn_info: {e:#}");
                continue;
            }
        };
        if ci.is_proxy {
            continue;
        }
        let env = env.clone();
        let cmd = cmd.to_string();
        let limiter = Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            let start = Instant::now();
            let (reply_tx, reply_rx) = oneshot::channel();
            let request = HostRequest::Run(RunRequest {
                cmd,
                reply: reply_tx,
                timeout,
            });
            if ci.req_tx.send(request).await.is_err() {
                debug!("{host}: service loop is gone");
                return;
            }
            let Ok(resp) = reply_rx.await else {
                debug!("{host}: run reply dropped");
                return;
            };
            let elapsed = start.elapsed();
            env.state.set_run_status(
                &host,
                resp.err.is_none(),
                true,
                elapsed,
                resp.err.clone(),
            );
            if !resp.stdout.is_empty() {
                let _ = output::synchronized_println(&format!(
                    "***** Host: {host}, Time: {:.2}s, Exit: {}, Err: {} *****\n{}",
                    elapsed.as_secs_f64(),
                    resp.exit_code,
                    resp.err.as_deref().unwrap_or("none"),
                    resp.stdout,
                ));
            }
        }));
    }
    join_all(tasks).await;
}

/// The three per-run spool files: captured stdout, captured stderr, and a
/// single-line decimal exit code.
struct SpoolHandles {
    stdout: File,
    stderr: File,
    retcode: File,
}

impl SpoolHandles {
    async fn create(dir: &Path, host: &str) -> Result<Self> {
        let stdout = File::create(dir.join(format!("{host}.out")))
            .await
            .with_context(|| format!("couldn't create {host}.out in {}", dir.display()))?;
        let stderr = File::create(dir.join(format!("{host}.err")))
            .await
            .with_context(|| format!("couldn't create {host}.err in {}", dir.display()))?;
        let retcode = File::create(dir.join(format!("{host}.ret")))
            .await
            .with_context(|| format!("couldn't create {host}.ret in {}", dir.display()))?;
        Ok(Self {
            stdout,
            stderr,
            retcode,
        })
    }

    async fn finish(&mut self, exit_code: i32) -> Result<()> {
        self.retcode
            .write_all(format!("{exit_code}\n").as_bytes())
            .await?;
        self.stdout.flush().await?;
        self.stderr.flush().await?;
        self.retcode.flush().await?;
        Ok(())
    }
}
