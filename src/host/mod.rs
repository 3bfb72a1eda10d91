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

//! The per-host service loop: one task per live SSH client that serializes
//! proxy-through, command-run, keep-alive, and teardown against it.
//!
//! Direct bastion hosts run several of these loops, each with its own SSH
//! client, all competing for requests on one shared inbox. That inbox
//! fan-out is how traffic through a bastion gets spread across parallel
//! connections.

pub mod proxy;
pub mod run;

pub use run::{run_everywhere, run_once, RunResponse};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, warn};

use crate::mux::Mux;
use crate::resolve::disconnect_host;
use crate::ssh::Client;
use crate::Env;

/// Inbox shared by every service loop of one logical host. For direct
/// bastions several loops receive from it; whichever loop is free takes
/// the next request.
pub type SharedInbox = Arc<Mutex<mpsc::Receiver<HostRequest>>>;

/// Requests a service loop knows how to field.
pub enum HostRequest {
    Proxy(ProxyRequest),
    Run(RunRequest),
    Cleanup(CleanupRequest),
}

/// Ask this host to tunnel a new SSH client to `target`.
pub struct ProxyRequest {
    pub target: String,
    pub reply: oneshot::Sender<Result<Client>>,
    pub timeout: u64,
}

/// Ask this host to run a command and report the outcome.
pub struct RunRequest {
    pub cmd: String,
    pub reply: oneshot::Sender<RunResponse>,
    pub timeout: u64,
}

/// Ask this service loop to shut down its client and exit.
pub struct CleanupRequest {
    pub reply: oneshot::Sender<CleanupResponse>,
}

pub struct CleanupResponse {
    pub all_good: bool,
}

/// Create the inbox pair for a new logical host.
pub fn new_inbox() -> (mpsc::Sender<HostRequest>, SharedInbox) {
    let (tx, rx) = mpsc::channel(64);
    (tx, Arc::new(Mutex::new(rx)))
}

/// Spawn one service loop on the given client.
pub fn spawn_service_loop(
    host: String,
    id: usize,
    inbox: SharedInbox,
    env: Env,
    client: Client,
    is_proxy: bool,
) {
    tokio::spawn(service_loop(host, id, inbox, env, client, is_proxy));
}

async fn service_loop(
    host: String,
    id: usize,
    inbox: SharedInbox,
    env: Env,
    client: Client,
    is_proxy: bool,
) {
    let me = env.state.get_ptr(&host).await;
    debug!("service loop {id} running for {me}");

    // Proxies don't get ControlMaster sockets, and outside server mode
    // nobody would connect to one anyway.
    let mut mux = if !is_proxy && env.cfg.server {
        match Mux::bind(&me, client.clone(), env.clone()).await {
            Ok(m) => Some(m),
            Err(e) => {
                debug!("{me}: mux setup failed: {e:#}");
                None
            }
        }
    } else {
        None
    };

    let mut keepalive = keepalive_timer(env.cfg.keep_alive);

    loop {
        tokio::select! {
            req = recv_shared(&inbox) => {
                match req {
                    Some(HostRequest::Proxy(preq)) => {
                        tokio::spawn(proxy::proxy_connect(preq, env.clone(), client.clone()));
                    }
                    Some(HostRequest::Run(rreq)) => {
                        tokio::spawn(run::run_cmd(me.clone(), rreq, client.clone(), env.clone()));
                    }
                    Some(HostRequest::Cleanup(creq)) => {
                        let mut all_good = true;
                        if let Some(m) = mux.take() {
                            m.close().await;
                        }
                        if let Err(e) = client.disconnect().await {
                            debug!("{me}: disconnect failed: {e:#}");
                            all_good = false;
                        }
                        let _ = creq.reply.send(CleanupResponse { all_good });
                        return;
                    }
                    None => {
                        // Every sender is gone; nothing can reach us anymore.
                        debug!("{me}: inbox closed, service loop {id} exiting");
                        if let Some(m) = mux.take() {
                            m.close().await;
                        }
                        let _ = client.disconnect().await;
                        return;
                    }
                }
            }
            _ = tick(&mut keepalive) => {
                if client.is_closed() {
                    warn!("{me}: keep-alive found the connection dead");
                    let env = env.clone();
                    let me = me.clone();
                    tokio::spawn(async move {
                        if let Err(e) = disconnect_host(&env, &me).await {
                            debug!("disconnect_host: {e:#}");
                        }
                    });
                }
            }
        }
    }
}

async fn recv_shared(inbox: &SharedInbox) -> Option<HostRequest> {
    inbox.lock().await.recv().await
}

/// The liveness timer: first fire after a randomized 1-60s splay so a big
/// fleet doesn't probe in lockstep, then every `keep_alive` seconds.
fn keepalive_timer(keep_alive: u64) -> Option<Interval> {
    if keep_alive == 0 {
        return None;
    }
    let splay = fastrand::u64(1..=60);
    Some(interval_at(
        Instant::now() + Duration::from_secs(splay),
        Duration::from_secs(keep_alive),
    ))
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Arm the organic timeout for one in-flight operation: after `secs` the
/// abort channel receives `true`. An externally-triggered abort sends
/// `false` on the same channel, which is how the two are told apart.
pub(crate) fn arm_organic_timeout(tx: mpsc::Sender<bool>, secs: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        let _ = tx.try_send(true);
    });
}
