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

//! Data carried by the state serializer: target inventory entries, live
//! connection records, and in-flight operation waiters.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::host::HostRequest;

/// Everything needed to reach a target host (address, proxy chain) plus the
/// outcome of the last connect and run attempts against it.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub host_name: String,
    pub ip_address: String,
    /// Ordered hop list; the last element is the host itself, everything
    /// before it is a bastion to traverse.
    pub chain: Vec<String>,
    pub requires_pw: bool,
    pub connected_ok: bool,
    pub connect_time: Duration,
    pub run_time: Duration,
    pub run_ok: bool,
    pub run_once: bool,
    pub last_error: Option<String>,
}

impl HostInfo {
    pub fn new(host_name: impl Into<String>, ip_address: impl Into<String>, chain: Vec<String>) -> Self {
        Self {
            host_name: host_name.into(),
            ip_address: ip_address.into(),
            chain,
            ..Default::default()
        }
    }
}

/// A live SSH connection: its canonical name, its role in the proxy graph,
/// and the inbox of the service loop(s) driving its client.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub host_name: String,
    /// This connection is used as a hop for other connections.
    pub is_proxy: bool,
    /// Reached without traversing another proxy (top-of-chain bastion or a
    /// plain direct target).
    pub is_direct: bool,
    /// How many sub-connections currently traverse this connection.
    pub proxy_count: usize,
    pub req_tx: mpsc::Sender<HostRequest>,
}

impl ConnInfo {
    pub fn new(host_name: impl Into<String>, req_tx: mpsc::Sender<HostRequest>, is_proxy: bool, is_direct: bool) -> Self {
        Self {
            host_name: host_name.into(),
            is_proxy,
            is_direct,
            proxy_count: 0,
            req_tx,
        }
    }
}

/// Where an in-flight connect or run currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitState {
    Dialing,
    Establishing,
    NewClient,
    NewSession,
    StartSession,
    Running,
    Done,
}

impl fmt::Display for WaitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WaitState::Dialing => "dialing connection",
            WaitState::Establishing => "establishing new client connection",
            WaitState::NewClient => "creating new client",
            WaitState::NewSession => "creating new session",
            WaitState::StartSession => "starting session",
            WaitState::Running => "running",
            WaitState::Done => "done",
        };
        f.write_str(s)
    }
}

/// Registry entry for one in-flight connect or run. The abort channel has
/// capacity one: the operation's own timer sends `true` (organic timeout),
/// an external abort sends `false`.
#[derive(Debug)]
pub struct WaitInfo {
    pub host_name: String,
    pub state: WaitState,
    pub start_time: Instant,
    pub timeout_tx: mpsc::Sender<bool>,
}

impl WaitInfo {
    pub fn new(host_name: impl Into<String>, state: WaitState, timeout_tx: mpsc::Sender<bool>) -> Self {
        Self {
            host_name: host_name.into(),
            state,
            start_time: Instant::now(),
            timeout_tx,
        }
    }
}

/// Snapshot of the in-flight operation registries: counts, average elapsed
/// wait, and a histogram of current states per category.
#[derive(Debug, Clone, Default)]
pub struct WaiterInfo {
    pub conn_waiters: usize,
    pub run_waiters: usize,
    pub avg_conn_wait: Duration,
    pub avg_run_wait: Duration,
    pub conn_states: HashMap<WaitState, usize>,
    pub run_states: HashMap<WaitState, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_state_display() {
        assert_eq!(WaitState::Dialing.to_string(), "dialing connection");
        assert_eq!(
            WaitState::Establishing.to_string(),
            "establishing new client connection"
        );
        assert_eq!(WaitState::Running.to_string(), "running");
        assert_eq!(WaitState::Done.to_string(), "done");
    }

    #[test]
    fn test_host_info_new() {
        let hi = HostInfo::new("web-01", "10.1.2.3", vec!["bastion".into(), "web-01".into()]);
        assert_eq!(hi.host_name, "web-01");
        assert_eq!(hi.chain.len(), 2);
        assert!(!hi.connected_ok);
        assert!(hi.last_error.is_none());
    }
}
