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

//! The serializer task itself: a single owner for every mutable map in the
//! program. All other code talks to it through [`StateRequest`] messages,
//! so reads never observe partial writes and no lock discipline is needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

use super::types::{ConnInfo, HostInfo, WaitInfo, WaitState, WaiterInfo};
use crate::ssh::SshConfig;

/// One request into the serializer. Reads carry a reply channel; writes
/// whose completion must be observable before the caller proceeds carry one
/// too, the rest are fire-and-forget (FIFO per sender still holds).
pub(super) enum StateRequest {
    SetHostInfo(HostInfo),
    GetHostInfo {
        host_name: String,
        reply: oneshot::Sender<Option<HostInfo>>,
    },
    HostExists {
        host_name: String,
        reply: oneshot::Sender<bool>,
    },
    DeleteHostInfo {
        host_name: String,
        reply: oneshot::Sender<()>,
    },
    ClearHostInfo {
        reply: oneshot::Sender<()>,
    },
    GetHostKeys {
        reply: oneshot::Sender<Vec<String>>,
    },
    SetConnInfo(ConnInfo),
    GetConnInfo {
        host_name: String,
        reply: oneshot::Sender<Option<ConnInfo>>,
    },
    ConnExists {
        host_name: String,
        reply: oneshot::Sender<bool>,
    },
    DeleteConnInfo {
        host_name: String,
        reply: oneshot::Sender<()>,
    },
    GetConnKeys {
        reply: oneshot::Sender<Vec<String>>,
    },
    IncProxyCount {
        host_name: String,
    },
    SetConnectionStatus {
        host_name: String,
        connected_ok: bool,
        connect_time: Duration,
        last_error: Option<String>,
    },
    SetRunStatus {
        host_name: String,
        run_ok: bool,
        run_once: bool,
        run_time: Duration,
        last_error: Option<String>,
    },
    SetConnWaitInfo(WaitInfo),
    SetRunWaitInfo(WaitInfo),
    SetConnWaitState {
        host_name: String,
        state: WaitState,
    },
    SetRunWaitState {
        host_name: String,
        state: WaitState,
    },
    DeleteConnWaitInfo {
        host_name: String,
    },
    DeleteRunWaitInfo {
        host_name: String,
    },
    GetWaiterInfo {
        reply: oneshot::Sender<WaiterInfo>,
    },
    TimeoutWaiters {
        reply: oneshot::Sender<()>,
    },
    SetRequiresPw {
        host_name: String,
    },
    GetAuthPass {
        reply: oneshot::Sender<Zeroizing<String>>,
    },
    SetAuthPass {
        pass: Zeroizing<String>,
    },
    GetSshConfig {
        reply: oneshot::Sender<Option<Arc<SshConfig>>>,
    },
    SetSshConfig {
        config: Arc<SshConfig>,
    },
    GetPtr {
        name: String,
        reply: oneshot::Sender<String>,
    },
}

#[derive(Default)]
pub(super) struct Serializer {
    targets: HashMap<String, HostInfo>,
    conns: HashMap<String, ConnInfo>,
    ptr: HashMap<String, String>,
    conn_waiters: HashMap<String, WaitInfo>,
    run_waiters: HashMap<String, WaitInfo>,
    ssh_config: Option<Arc<SshConfig>>,
    auth_pass: Option<Zeroizing<String>>,
}

impl Serializer {
    pub(super) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<StateRequest>) {
        while let Some(req) = inbox.recv().await {
            self.handle(req);
        }
    }

    fn handle(&mut self, req: StateRequest) {
        match req {
            StateRequest::SetHostInfo(hi) => {
                if !hi.ip_address.is_empty() {
                    self.ptr.insert(hi.ip_address.clone(), hi.host_name.clone());
                }
                self.targets.insert(hi.host_name.clone(), hi);
            }
            StateRequest::GetHostInfo { host_name, reply } => {
                let _ = reply.send(self.targets.get(&host_name).cloned());
            }
            StateRequest::HostExists { host_name, reply } => {
                let _ = reply.send(self.targets.contains_key(&host_name));
            }
            StateRequest::DeleteHostInfo { host_name, reply } => {
                self.targets.remove(&host_name);
                let _ = reply.send(());
            }
            StateRequest::ClearHostInfo { reply } => {
                self.targets.clear();
                let _ = reply.send(());
            }
            StateRequest::GetHostKeys { reply } => {
                let _ = reply.send(self.targets.keys().cloned().collect());
            }
            StateRequest::SetConnInfo(ci) => {
                // Idempotent: the first registration for a canonical name wins.
                self.conns.entry(ci.host_name.clone()).or_insert(ci);
            }
            StateRequest::GetConnInfo { host_name, reply } => {
                let _ = reply.send(self.conns.get(&host_name).cloned());
            }
            StateRequest::ConnExists { host_name, reply } => {
                let _ = reply.send(self.conns.contains_key(&host_name));
            }
            StateRequest::DeleteConnInfo { host_name, reply } => {
                self.conns.remove(&host_name);
                let _ = reply.send(());
            }
            StateRequest::GetConnKeys { reply } => {
                let _ = reply.send(self.conns.keys().cloned().collect());
            }
            StateRequest::IncProxyCount { host_name } => {
                if let Some(ci) = self.conns.get_mut(&host_name) {
                    ci.proxy_count += 1;
                }
            }
            StateRequest::SetConnectionStatus {
                host_name,
                connected_ok,
                connect_time,
                last_error,
            } => {
                if let Some(hi) = self.targets.get_mut(&host_name) {
                    hi.connected_ok = connected_ok;
                    hi.connect_time = connect_time;
                    hi.last_error = last_error;
                }
            }
            StateRequest::SetRunStatus {
                host_name,
                run_ok,
                run_once,
                run_time,
                last_error,
            } => {
                if let Some(hi) = self.targets.get_mut(&host_name) {
                    hi.run_ok = run_ok;
                    hi.run_once = run_once;
                    hi.run_time = run_time;
                    hi.last_error = last_error;
                }
            }
            StateRequest::SetConnWaitInfo(wi) => {
                self.conn_waiters.insert(wi.host_name.clone(), wi);
            }
            StateRequest::SetRunWaitInfo(wi) => {
                self.run_waiters.insert(wi.host_name.clone(), wi);
            }
            StateRequest::SetConnWaitState { host_name, state } => {
                if let Some(wi) = self.conn_waiters.get_mut(&host_name) {
                    wi.state = state;
                }
            }
            StateRequest::SetRunWaitState { host_name, state } => {
                if let Some(wi) = self.run_waiters.get_mut(&host_name) {
                    wi.state = state;
                }
            }
            StateRequest::DeleteConnWaitInfo { host_name } => {
                self.conn_waiters.remove(&host_name);
            }
            StateRequest::DeleteRunWaitInfo { host_name } => {
                self.run_waiters.remove(&host_name);
            }
            StateRequest::GetWaiterInfo { reply } => {
                let _ = reply.send(self.waiter_info());
            }
            StateRequest::TimeoutWaiters { reply } => {
                // A full abort channel already carries a verdict for its
                // waiter, so a failed try_send is not a problem here.
                for wi in self.conn_waiters.values() {
                    let _ = wi.timeout_tx.try_send(false);
                }
                for wi in self.run_waiters.values() {
                    let _ = wi.timeout_tx.try_send(false);
                }
                let _ = reply.send(());
            }
            StateRequest::SetRequiresPw { host_name } => {
                if let Some(hi) = self.targets.get_mut(&host_name) {
                    hi.requires_pw = true;
                }
            }
            StateRequest::GetAuthPass { reply } => {
                let pass = self
                    .auth_pass
                    .clone()
                    .unwrap_or_else(|| Zeroizing::new(String::new()));
                let _ = reply.send(pass);
            }
            StateRequest::SetAuthPass { pass } => {
                self.auth_pass = Some(pass);
            }
            StateRequest::GetSshConfig { reply } => {
                let _ = reply.send(self.ssh_config.clone());
            }
            StateRequest::SetSshConfig { config } => {
                self.ssh_config = Some(config);
            }
            StateRequest::GetPtr { name, reply } => {
                let resolved = self.ptr.get(&name).cloned().unwrap_or(name);
                let _ = reply.send(resolved);
            }
        }
    }

    fn waiter_info(&self) -> WaiterInfo {
        let mut info = WaiterInfo {
            conn_waiters: self.conn_waiters.len(),
            run_waiters: self.run_waiters.len(),
            ..Default::default()
        };
        let mut total_conn = Duration::ZERO;
        let mut total_run = Duration::ZERO;
        for wi in self.conn_waiters.values() {
            *info.conn_states.entry(wi.state).or_insert(0) += 1;
            total_conn += wi.start_time.elapsed();
        }
        for wi in self.run_waiters.values() {
            *info.run_states.entry(wi.state).or_insert(0) += 1;
            total_run += wi.start_time.elapsed();
        }
        if info.conn_waiters > 0 {
            info.avg_conn_wait = total_conn / info.conn_waiters as u32;
        }
        if info.run_waiters > 0 {
            info.avg_run_wait = total_run / info.run_waiters as u32;
        }
        info
    }
}
