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

//! Authentication for every hop: one shared user plus either a private key
//! loaded once at startup or the ssh-agent. When public key auth fails and
//! the password fallback is enabled, the hop is recorded as requiring a
//! password before the shared password is tried.

use anyhow::{bail, Context, Result};
use russh::client::Handle;
use russh::keys::agent::client::AgentClient;
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::client::ClientHandler;
use crate::Env;

/// The shared SSH client configuration. One of these exists per program run
/// and lives in the state serializer; all connect attempts read it.
#[derive(Clone)]
pub struct SshConfig {
    pub user: String,
    pub auth: AuthSource,
}

#[derive(Clone)]
pub enum AuthSource {
    /// A private key decoded once at startup and shared by every hop.
    Key(Arc<PrivateKey>),
    /// Ask the ssh-agent for identities on every attempt.
    Agent,
}

impl SshConfig {
    /// Build a config around a private key file, decoding it up front so a
    /// bad key path fails at startup rather than on the first connect.
    pub fn from_key_file(user: impl Into<String>, key_path: &Path) -> Result<Self> {
        let key = load_secret_key(key_path, None)
            .with_context(|| format!("couldn't load SSH private key {}", key_path.display()))?;
        Ok(Self {
            user: user.into(),
            auth: AuthSource::Key(Arc::new(key)),
        })
    }

    pub fn with_agent(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            auth: AuthSource::Agent,
        }
    }
}

/// Authenticate a freshly-connected handle. Public key (file or agent)
/// first; if that fails and the password fallback is on, mark the target as
/// requiring a password and try the shared password.
pub(crate) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    host: &str,
    env: &Env,
) -> Result<()> {
    let cfg = env
        .state
        .get_ssh_config()
        .await
        .context("SSH client config is not initialized")?;

    let authed = match &cfg.auth {
        AuthSource::Key(key) => {
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(&cfg.user, PrivateKeyWithHashAlg::new(key.clone(), hash))
                .await?
                .success()
        }
        AuthSource::Agent => authenticate_with_agent(handle, &cfg.user).await?,
    };
    if authed {
        return Ok(());
    }

    if env.cfg.password {
        let canonical = env.state.get_ptr(host).await;
        env.state.set_requires_pw(&canonical).await;
        let pass = env.state.get_auth_pass().await;
        if handle
            .authenticate_password(&cfg.user, pass.as_str())
            .await?
            .success()
        {
            return Ok(());
        }
    }

    bail!("{host}: no supported methods remain")
}

/// Walk the agent's identities until one of them works.
async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    user: &str,
) -> Result<bool> {
    let mut agent = AgentClient::connect_env()
        .await
        .context("couldn't connect to the ssh-agent")?;
    let identities = agent
        .request_identities()
        .await
        .context("ssh-agent identity listing failed")?;
    if identities.is_empty() {
        bail!("ssh-agent holds no identities");
    }

    for identity in identities {
        let hash = handle.best_supported_rsa_hash().await?.flatten();
        match handle
            .authenticate_publickey_with(user, identity, hash, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => continue,
            Err(e) => {
                debug!("agent identity attempt failed: {e}");
                continue;
            }
        }
    }
    Ok(false)
}
