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

//! Chain resolution: turning an ordered hop list into a connected client,
//! reusing hops that are already up, plus the fleet-wide connect and
//! teardown drivers.
//!
//! A chain like `bastion-vip pci-bastion web-01` means: dial the first hop
//! directly, then tunnel each following hop through the one before it.

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::host::{self, CleanupRequest, HostRequest, ProxyRequest};
use crate::ssh::Client;
use crate::state::{ConnInfo, WaitInfo, WaitState};
use crate::Env;

/// Walk a chain and make sure every hop is connected, creating service
/// loops and connection records along the way. Hops that already have a
/// connection are skipped, which is what makes concurrent resolves of
/// overlapping chains cheap.
pub async fn resolve(chain: &[String], env: &Env, is_proxy: bool, timeout: u64) -> Result<()> {
    debug!("resolve() chain: {chain:?}, is_proxy: {is_proxy}, timeout: {timeout}");
    for (idx, link) in chain.iter().enumerate() {
        if idx == 0 {
            direct_hop(env, link, is_proxy, timeout).await?;
        } else {
            proxied_hop(env, &chain[idx - 1], link, is_proxy, timeout).await?;
        }
    }
    Ok(())
}

/// Dial the first hop of a chain directly, with `bastion_conns` parallel
/// clients all serving one shared inbox.
async fn direct_hop(env: &Env, link: &str, is_proxy: bool, timeout: u64) -> Result<()> {
    let canonical = env.state.get_ptr(link).await;
    if env.state.conn_exists(&canonical).await {
        debug!("{link}: connection already exists");
        return Ok(());
    }

    // One connect waiter covers all parallel attempts; a relay turns an
    // external abort into a cancellation every attempt observes.
    let (timeout_tx, mut timeout_rx) = mpsc::channel::<bool>(1);
    env.state
        .set_conn_wait_info(WaitInfo::new(link, WaitState::Dialing, timeout_tx))
        .await;
    let abort = CancellationToken::new();
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            while let Some(verdict) = timeout_rx.recv().await {
                if !verdict {
                    abort.cancel();
                    break;
                }
            }
        });
    }

    // Dial the recorded IP when we have one so the hot path skips DNS.
    let dial_addr = match env.state.get_host_info(&canonical).await {
        Ok(hi) if !hi.ip_address.is_empty() => hi.ip_address,
        _ => link.to_string(),
    };

    let (req_tx, inbox) = host::new_inbox();
    let mut attempts = Vec::new();
    for id in 0..env.cfg.bastion_conns {
        let env = env.clone();
        let link = link.to_string();
        let dial_addr = dial_addr.clone();
        let req_tx = req_tx.clone();
        let inbox = inbox.clone();
        let abort = abort.clone();
        attempts.push(tokio::spawn(async move {
            direct_attempt(env, link, dial_addr, id, req_tx, inbox, is_proxy, timeout, abort).await
        }));
    }
    let results = join_all(attempts).await;
    env.state.delete_conn_wait_info(link).await;

    if env.state.conn_exists(&canonical).await {
        return Ok(());
    }
    let mut last = anyhow!("{link}: no connection attempt succeeded");
    for result in results.into_iter().flatten() {
        if let Err(e) = result {
            last = e;
        }
    }
    Err(last)
}

#[allow(clippy::too_many_arguments)]
async fn direct_attempt(
    env: Env,
    link: String,
    dial_addr: String,
    id: usize,
    req_tx: mpsc::Sender<HostRequest>,
    inbox: host::SharedInbox,
    is_proxy: bool,
    timeout: u64,
    abort: CancellationToken,
) -> Result<()> {
    tokio::select! {
        res = Client::dial(&env, &link, &dial_addr) => {
            match res {
                Ok(client) => {
                    host::spawn_service_loop(
                        link.clone(),
                        id,
                        inbox,
                        env.clone(),
                        client,
                        is_proxy,
                    );
                    env.state
                        .set_conn_info(ConnInfo::new(link, req_tx, is_proxy, true))
                        .await;
                    Ok(())
                }
                Err(e) => {
                    debug!("direct connect to {link} failed: {e:#}");
                    Err(e)
                }
            }
        }
        _ = tokio::time::sleep(Duration::from_secs(timeout)) => {
            Err(anyhow!("Remote connection timed out"))
        }
        _ = abort.cancelled() => {
            Err(anyhow!("Remote connection aborted"))
        }
    }
}

/// Reach `link` by asking the previous hop's service loop to tunnel a new
/// client to it.
async fn proxied_hop(
    env: &Env,
    proxyhost: &str,
    link: &str,
    is_proxy: bool,
    timeout: u64,
) -> Result<()> {
    let canonical = env.state.get_ptr(link).await;
    if env.state.conn_exists(&canonical).await {
        debug!("{link}: connection already exists");
        return Ok(());
    }
    let proxy_key = env.state.get_ptr(proxyhost).await;
    let ci = env.state.get_conn_info(&proxy_key).await?;

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = HostRequest::Proxy(ProxyRequest {
        target: link.to_string(),
        reply: reply_tx,
        timeout,
    });
    ci.req_tx
        .send(request)
        .await
        .map_err(|_| anyhow!("{proxy_key}: service loop is gone"))?;
    let client = reply_rx
        .await
        .with_context(|| format!("{proxy_key}: proxy reply dropped"))??;

    env.state.inc_proxy_count(&proxy_key);
    let (req_tx, inbox) = host::new_inbox();
    host::spawn_service_loop(link.to_string(), 0, inbox, env.clone(), client, is_proxy);
    env.state
        .set_conn_info(ConnInfo::new(link, req_tx, is_proxy, false))
        .await;
    Ok(())
}

/// The distinct proxy-chain prefixes of a target set: every chain minus its
/// final element, deduplicated in first-seen order.
pub fn proxy_prefixes<'a, I>(chains: I) -> Vec<Vec<String>>
where
    I: IntoIterator<Item = &'a Vec<String>>,
{
    let mut seen = HashSet::new();
    let mut prefixes = Vec::new();
    for chain in chains {
        if chain.len() <= 1 {
            continue;
        }
        let prefix = &chain[..chain.len() - 1];
        if seen.insert(prefix.join(" ")) {
            prefixes.push(prefix.to_vec());
        }
    }
    prefixes
}

/// Establish every distinct proxy chain serially, before the targets pile
/// in. Without this pass, N parallel targets behind one cold bastion would
/// each decide the bastion needs connecting and dial it N times over.
pub async fn resolve_proxies(env: &Env) -> Result<()> {
    debug!("resolving proxy chains");
    let mut chains = Vec::new();
    for hostname in env.state.get_host_keys().await {
        let hi = env.state.get_host_info(&hostname).await?;
        chains.push(hi.chain);
    }
    for prefix in proxy_prefixes(&chains) {
        resolve(&prefix, env, true, env.cfg.timeout)
            .await
            .with_context(|| format!("could not resolve proxy chain '{}'", prefix.join(" ")))?;
    }
    Ok(())
}

/// Connect every target that isn't connected yet, in parallel, bounded by
/// the configured concurrency. Records connect status per target and
/// optionally fires the test command on success.
pub async fn connect_everywhere(env: &Env, timeout: u64) -> Result<usize> {
    resolve_proxies(env).await?;

    let limiter = Arc::new(Semaphore::new(env.cfg.effective_concurrency()));
    let keys = env.state.get_host_keys().await;
    let mut tasks = Vec::new();
    let mut last_idx = 0;
    for (idx, hostname) in keys.iter().enumerate() {
        last_idx = idx;
        if env.state.conn_exists(hostname).await {
            debug!("already connected to {hostname}");
            continue;
        }
        let env = env.clone();
        let me = hostname.clone();
        let limiter = Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            let hi = match env.state.get_host_info(&me).await {
                Ok(hi) => hi,
                Err(e) => {
                    debug!("get_host_info: {e:#}");
                    return;
                }
            };
            let start = Instant::now();
            let result = resolve(&hi.chain, &env, false, timeout).await;
            let last_error = result.as_ref().err().map(|e| format!("{e:#}"));
            env.state
                .set_connection_status(&me, result.is_ok(), start.elapsed(), last_error);
            if result.is_ok() && env.cfg.execute {
                let test_cmd = env.cfg.test_cmd.clone();
                host::run_once(&me, &test_cmd, &env, timeout).await;
            }
        }));
    }
    join_all(tasks).await;
    Ok(last_idx + 1)
}

/// Tear down a single host's connection and forget it.
pub async fn disconnect_host(env: &Env, host: &str) -> Result<()> {
    let ci = env.state.get_conn_info(host).await?;
    drain_cleanup(env, &ci).await;
    env.state.delete_conn_info(host).await;
    Ok(())
}

/// Tear everything down in strict reverse dependency order: plain targets
/// first, proxies reached through other proxies next, directly-dialed
/// proxies last. Aborts anything still in flight before starting.
pub async fn disconnect_everywhere(env: &Env, proxies: bool) {
    env.state.timeout_waiters().await;

    // Leaves first.
    for key in env.state.get_conn_keys().await {
        let ci = match env.state.get_conn_info(&key).await {
            Ok(ci) => ci,
            Err(e) => {
                debug!("get_conn_info: {e:#}");
                continue;
            }
        };
        if ci.is_proxy {
            continue;
        }
        drain_cleanup(env, &ci).await;
        env.state.delete_conn_info(&key).await;
    }
    if !proxies {
        return;
    }

    // Indirect proxies next.
    for key in env.state.get_conn_keys().await {
        let ci = match env.state.get_conn_info(&key).await {
            Ok(ci) => ci,
            Err(e) => {
                debug!("get_conn_info: {e:#}");
                continue;
            }
        };
        if !ci.is_proxy {
            debug!("{key}: still present after the non-proxy sweep");
            continue;
        }
        if ci.is_direct {
            continue;
        }
        drain_cleanup(env, &ci).await;
        env.state.delete_conn_info(&key).await;
    }

    // Direct proxies last.
    for key in env.state.get_conn_keys().await {
        let ci = match env.state.get_conn_info(&key).await {
            Ok(ci) => ci,
            Err(e) => {
                debug!("get_conn_info: {e:#}");
                continue;
            }
        };
        if !ci.is_proxy || !ci.is_direct {
            debug!("{key}: still present after the indirect-proxy sweep");
            continue;
        }
        drain_cleanup(env, &ci).await;
        env.state.delete_conn_info(&key).await;
    }
    info!("disconnected everywhere");
}

/// Send cleanup to a connection and wait for the reply. Direct connections
/// run `bastion_conns` service loops on one inbox, so they need one
/// cleanup request per loop.
async fn drain_cleanup(env: &Env, ci: &ConnInfo) {
    let loops = if ci.is_direct { env.cfg.bastion_conns } else { 1 };
    for _ in 0..loops {
        let (reply_tx, reply_rx) = oneshot::channel();
        if ci
            .req_tx
            .send(HostRequest::Cleanup(CleanupRequest { reply: reply_tx }))
            .await
            .is_err()
        {
            break;
        }
        let _ = reply_rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(spec: &str) -> Vec<String> {
        spec.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_proxy_prefixes_dedup() {
        let chains = vec![
            chain("bastion b"),
            chain("bastion c"),
            chain("bastion pci-bastion d"),
            chain("direct-only"),
        ];
        let prefixes = proxy_prefixes(&chains);
        assert_eq!(prefixes.len(), 2);
        assert_eq!(prefixes[0], chain("bastion"));
        assert_eq!(prefixes[1], chain("bastion pci-bastion"));
    }

    #[test]
    fn test_proxy_prefixes_skips_direct_chains() {
        let chains = vec![chain("a"), chain("b")];
        assert!(proxy_prefixes(&chains).is_empty());
    }

    #[test]
    fn test_proxy_prefixes_shared_prefix_counted_once() {
        // Ten targets behind the same bastion still mean one prefix dial.
        let chains: Vec<Vec<String>> = (0..10).map(|i| chain(&format!("bastion t{i}"))).collect();
        assert_eq!(proxy_prefixes(&chains).len(), 1);
    }
}
