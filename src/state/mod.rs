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

//! Serialized access to all mutable program state.
//!
//! A single task owns the target inventory, the live connection map, the
//! reverse-DNS map, both in-flight waiter registries, and the shared SSH
//! auth material. Everything else holds a cheap [`State`] handle and talks
//! to the owner through messages; requests from one sender are handled in
//! send order and a read never observes a partial write.

mod serializer;
mod types;

pub use types::{ConnInfo, HostInfo, WaitInfo, WaitState, WaiterInfo};

use anyhow::{anyhow, Context, Result};
use serializer::{Serializer, StateRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

use crate::ssh::SshConfig;

/// Handle to the state serializer. Clone freely; all clones feed the same
/// single-owner task.
#[derive(Clone)]
pub struct State {
    req_tx: mpsc::UnboundedSender<StateRequest>,
}

impl State {
    /// Create the state store and spawn its serializer task.
    pub fn new() -> Self {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(Serializer::default().run(req_rx));
        Self { req_tx }
    }

    fn send(&self, req: StateRequest) {
        // The serializer task lives for the whole program; a send can only
        // fail during teardown, when nobody is left to care.
        let _ = self.req_tx.send(req);
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> StateRequest) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx));
        rx.await.context("state serializer is gone")
    }

    /// Reverse-DNS lookup against the map populated by [`set_host_info`]:
    /// an IP maps to its canonical hostname, anything unknown maps to
    /// itself (which makes normalization idempotent).
    ///
    /// [`set_host_info`]: State::set_host_info
    pub async fn get_ptr(&self, name: &str) -> String {
        self.ask(|reply| StateRequest::GetPtr {
            name: name.to_string(),
            reply,
        })
        .await
        .unwrap_or_else(|_| name.to_string())
    }

    /// Insert or overwrite a target, keyed by host name. Also records the
    /// ip -> name mapping for reverse lookups.
    pub fn set_host_info(&self, hi: HostInfo) {
        self.send(StateRequest::SetHostInfo(hi));
    }

    pub async fn get_host_info(&self, host_name: &str) -> Result<HostInfo> {
        self.ask(|reply| StateRequest::GetHostInfo {
            host_name: host_name.to_string(),
            reply,
        })
        .await?
        .ok_or_else(|| anyhow!("host '{host_name}' does not exist"))
    }

    pub async fn host_exists(&self, host_name: &str) -> bool {
        self.ask(|reply| StateRequest::HostExists {
            host_name: host_name.to_string(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn delete_host_info(&self, host_name: &str) {
        let _ = self
            .ask(|reply| StateRequest::DeleteHostInfo {
                host_name: host_name.to_string(),
                reply,
            })
            .await;
    }

    /// Drop every target. Useful when switching to a new target set.
    pub async fn clear_host_info(&self) {
        let _ = self.ask(|reply| StateRequest::ClearHostInfo { reply }).await;
    }

    /// Snapshot of the current target names.
    pub async fn get_host_keys(&self) -> Vec<String> {
        self.ask(|reply| StateRequest::GetHostKeys { reply })
            .await
            .unwrap_or_default()
    }

    /// Register a live connection. The host name is normalized through the
    /// reverse-DNS map first, and registration is idempotent: at most one
    /// connection record exists per canonical name.
    pub async fn set_conn_info(&self, mut ci: ConnInfo) {
        ci.host_name = self.get_ptr(&ci.host_name).await;
        self.send(StateRequest::SetConnInfo(ci));
    }

    pub async fn get_conn_info(&self, host_name: &str) -> Result<ConnInfo> {
        self.ask(|reply| StateRequest::GetConnInfo {
            host_name: host_name.to_string(),
            reply,
        })
        .await?
        .ok_or_else(|| anyhow!("connection '{host_name}' does not exist"))
    }

    pub async fn conn_exists(&self, host_name: &str) -> bool {
        self.ask(|reply| StateRequest::ConnExists {
            host_name: host_name.to_string(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn delete_conn_info(&self, host_name: &str) {
        let _ = self
            .ask(|reply| StateRequest::DeleteConnInfo {
                host_name: host_name.to_string(),
                reply,
            })
            .await;
    }

    /// Snapshot of the canonical names of all live connections.
    pub async fn get_conn_keys(&self) -> Vec<String> {
        self.ask(|reply| StateRequest::GetConnKeys { reply })
            .await
            .unwrap_or_default()
    }

    /// Count one more sub-connection traversing the given proxy.
    pub fn inc_proxy_count(&self, host_name: &str) {
        self.send(StateRequest::IncProxyCount {
            host_name: host_name.to_string(),
        });
    }

    pub fn set_connection_status(
        &self,
        host_name: &str,
        connected_ok: bool,
        connect_time: Duration,
        last_error: Option<String>,
    ) {
        self.send(StateRequest::SetConnectionStatus {
            host_name: host_name.to_string(),
            connected_ok,
            connect_time,
            last_error,
        });
    }

    pub fn set_run_status(
        &self,
        host_name: &str,
        run_ok: bool,
        run_once: bool,
        run_time: Duration,
        last_error: Option<String>,
    ) {
        self.send(StateRequest::SetRunStatus {
            host_name: host_name.to_string(),
            run_ok,
            run_once,
            run_time,
            last_error,
        });
    }

    /// Register an in-flight connect so it shows up in waiter stats and can
    /// be aborted. The host name is normalized first.
    pub async fn set_conn_wait_info(&self, mut wi: WaitInfo) {
        wi.host_name = self.get_ptr(&wi.host_name).await;
        self.send(StateRequest::SetConnWaitInfo(wi));
    }

    pub async fn set_conn_wait_state(&self, host_name: &str, state: WaitState) {
        let host_name = self.get_ptr(host_name).await;
        self.send(StateRequest::SetConnWaitState { host_name, state });
    }

    pub async fn delete_conn_wait_info(&self, host_name: &str) {
        let host_name = self.get_ptr(host_name).await;
        self.send(StateRequest::DeleteConnWaitInfo { host_name });
    }

    /// Register an in-flight command execution.
    pub async fn set_run_wait_info(&self, mut wi: WaitInfo) {
        wi.host_name = self.get_ptr(&wi.host_name).await;
        self.send(StateRequest::SetRunWaitInfo(wi));
    }

    pub async fn set_run_wait_state(&self, host_name: &str, state: WaitState) {
        let host_name = self.get_ptr(host_name).await;
        self.send(StateRequest::SetRunWaitState { host_name, state });
    }

    pub async fn delete_run_wait_info(&self, host_name: &str) {
        let host_name = self.get_ptr(host_name).await;
        self.send(StateRequest::DeleteRunWaitInfo { host_name });
    }

    /// Stats over everything currently in flight.
    pub async fn get_waiter_info(&self) -> WaiterInfo {
        self.ask(|reply| StateRequest::GetWaiterInfo { reply })
            .await
            .unwrap_or_default()
    }

    /// Send an abort to every registered connect and run waiter so they all
    /// finish immediately instead of waiting out their timeouts. Returns
    /// once every abort has been delivered.
    pub async fn timeout_waiters(&self) {
        let _ = self.ask(|reply| StateRequest::TimeoutWaiters { reply }).await;
    }

    /// Mark a target as unable to log in with the public key, meaning the
    /// password fallback was used for it.
    pub async fn set_requires_pw(&self, host_name: &str) {
        let host_name = self.get_ptr(host_name).await;
        self.send(StateRequest::SetRequiresPw { host_name });
    }

    /// The shared fallback password for all hosts.
    pub async fn get_auth_pass(&self) -> Zeroizing<String> {
        self.ask(|reply| StateRequest::GetAuthPass { reply })
            .await
            .unwrap_or_else(|_| Zeroizing::new(String::new()))
    }

    pub fn set_auth_pass(&self, pass: Zeroizing<String>) {
        self.send(StateRequest::SetAuthPass { pass });
    }

    /// The shared SSH client configuration (user and auth source) used for
    /// every hop.
    pub async fn get_ssh_config(&self) -> Option<Arc<SshConfig>> {
        self.ask(|reply| StateRequest::GetSshConfig { reply })
            .await
            .unwrap_or(None)
    }

    pub fn set_ssh_config(&self, config: Arc<SshConfig>) {
        self.send(StateRequest::SetSshConfig { config });
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
