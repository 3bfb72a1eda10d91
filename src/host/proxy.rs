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

//! Tunnel a new SSH client through an already-connected host. Any host can
//! serve as a hop this way; in practice only bastions do.

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{arm_organic_timeout, ProxyRequest};
use crate::ssh::{auth, Client};
use crate::state::{WaitInfo, WaitState};
use crate::{Env, SSH_PORT};

/// Handle one [`ProxyRequest`]: dial the target through `client`, do the
/// SSH handshake over the tunnel, authenticate, and reply with the new
/// client. The whole thing is registered as a connect waiter and raced
/// against its abort channel.
pub(crate) async fn proxy_connect(req: ProxyRequest, env: Env, client: Client) {
    let (timeout_tx, mut timeout_rx) = mpsc::channel::<bool>(1);
    let (done_tx, mut done_rx) = oneshot::channel::<Result<Client>>();

    env.state
        .set_conn_wait_info(WaitInfo::new(&req.target, WaitState::Dialing, timeout_tx.clone()))
        .await;

    // The dial, handshake, and auth can all block far longer than we are
    // willing to wait, so they run in their own task and race the timer.
    {
        let env = env.clone();
        let target = req.target.clone();
        tokio::spawn(async move {
            let res = tunnel_client(&env, &client, &target).await;
            let _ = done_tx.send(res);
        });
    }
    arm_organic_timeout(timeout_tx, req.timeout);

    tokio::select! {
        res = &mut done_rx => {
            let res = res.unwrap_or_else(|_| Err(anyhow!("proxy dial task vanished")));
            let _ = req.reply.send(res);
        }
        verdict = timeout_rx.recv() => {
            let err = if verdict.unwrap_or(true) {
                anyhow!("Remote connection timed out")
            } else {
                anyhow!("Remote connection aborted")
            };
            let _ = req.reply.send(Err(err));
            // The dial task is still out there; drain its eventual answer
            // so the tunnel doesn't leak a half-open client.
            let target = req.target.clone();
            tokio::spawn(async move {
                if let Ok(straggler) = done_rx.await {
                    debug!("{target}: caught a proxy straggler");
                    if let Ok(client) = straggler {
                        let _ = client.disconnect().await;
                    }
                }
            });
        }
    }

    env.state.delete_conn_wait_info(&req.target).await;
}

async fn tunnel_client(env: &Env, through: &Client, target: &str) -> Result<Client> {
    let channel = through.open_direct_tcpip_channel(target, SSH_PORT).await?;
    env.state
        .set_conn_wait_state(target, WaitState::Establishing)
        .await;

    let mut handle = Client::handshake_stream(env, channel.into_stream(), target).await?;
    env.state
        .set_conn_wait_state(target, WaitState::NewClient)
        .await;

    auth::authenticate(&mut handle, target, env).await?;
    env.state.set_conn_wait_state(target, WaitState::Done).await;

    Ok(Client::from_handle(handle, target.to_string()))
}
