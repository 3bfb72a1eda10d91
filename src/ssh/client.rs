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

//! A thin clonable wrapper around a russh client handle.
//!
//! Two ways in: [`Client::dial`] for a plain TCP connection, or
//! [`Client::handshake_stream`] + [`Client::from_handle`] for a client
//! running over a `direct-tcpip` channel opened through another hop.

use anyhow::{Context, Result};
use russh::client::{Config, Handle, Handler, Msg};
use russh::{Channel, ChannelStream, Disconnect};
use std::fmt::Debug;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use super::auth;
use crate::{Env, Settings, SSH_PORT};

/// A connected, authenticated SSH client. Cloning shares the underlying
/// session; the per-host service loop owns the logical connection and all
/// other tasks interact with it through that loop.
#[derive(Clone)]
pub struct Client {
    handle: Arc<Handle<ClientHandler>>,
    host: String,
}

impl Client {
    /// The russh transport config shared by every hop. When keep-alives
    /// are enabled they ride on russh's own keepalive@openssh.com global
    /// requests at the configured interval.
    pub fn transport_config(settings: &Settings) -> Arc<Config> {
        let mut config = Config::default();
        if settings.keep_alive > 0 {
            config.keepalive_interval = Some(Duration::from_secs(settings.keep_alive));
            config.keepalive_max = 3;
        }
        Arc::new(config)
    }

    /// Dial `dial_addr:22` directly and authenticate. `host` is the name
    /// the connection is known by; `dial_addr` is usually the target's IP
    /// so no DNS lookup is needed on the hot path.
    pub async fn dial(env: &Env, host: &str, dial_addr: &str) -> Result<Self> {
        let config = Self::transport_config(&env.cfg);
        let dest = format!("{dial_addr}:{SSH_PORT}");
        let addrs = dest
            .to_socket_addrs()
            .with_context(|| format!("couldn't resolve {dest}"))?;

        let mut last_err = None;
        let mut connected = None;
        for addr in addrs {
            let handler = ClientHandler::new(host.to_string());
            match russh::client::connect(config.clone(), addr, handler).await {
                Ok(handle) => {
                    connected = Some(handle);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let mut handle = match connected {
            Some(h) => h,
            None => {
                return Err(last_err
                    .map(Into::into)
                    .unwrap_or_else(|| anyhow::anyhow!("{dest} resolved to no addresses")));
            }
        };

        auth::authenticate(&mut handle, host, env).await?;
        Ok(Self::from_handle(handle, host.to_string()))
    }

    /// Run the SSH handshake over an already-established byte stream (a
    /// `direct-tcpip` channel through a previous hop). Authentication is a
    /// separate step so callers can record progress in between.
    pub async fn handshake_stream(
        env: &Env,
        stream: ChannelStream<Msg>,
        host: &str,
    ) -> Result<Handle<ClientHandler>> {
        let config = Self::transport_config(&env.cfg);
        let handler = ClientHandler::new(host.to_string());
        let handle = russh::client::connect_stream(config, stream, handler)
            .await
            .with_context(|| format!("SSH handshake with {host} over tunnel failed"))?;
        Ok(handle)
    }

    pub fn from_handle(handle: Handle<ClientHandler>, host: String) -> Self {
        Self {
            handle: Arc::new(handle),
            host,
        }
    }

    /// Open a `direct-tcpip` channel to `target:port`. The remote end of
    /// this connection performs the name resolution and the dial, which is
    /// what makes bastion hops work for names only they can resolve.
    pub async fn open_direct_tcpip_channel(
        &self,
        target: &str,
        port: u16,
    ) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_direct_tcpip(target, u32::from(port), "127.0.0.1", 22)
            .await
            .with_context(|| format!("couldn't open a tunnel to {target}:{port}"))
    }

    /// Open a session channel for an exec, shell, or mux session.
    pub async fn open_session(&self) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_session()
            .await
            .context("couldn't open a session channel")
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await
            .map_err(Into::into)
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.host)
            .field("handle", &"Handle<ClientHandler>")
            .finish()
    }
}

/// Host keys are accepted unconditionally: the inventory comes from a
/// trusted source and the fleet's keys churn too fast for a known_hosts
/// file to keep up.
#[derive(Debug, Clone)]
pub struct ClientHandler {
    #[allow(dead_code)]
    host: String,
}

impl ClientHandler {
    pub fn new(host: String) -> Self {
        Self { host }
    }
}

impl Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
