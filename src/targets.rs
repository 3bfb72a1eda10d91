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

//! Target inventory loading: the JSON dump format produced by the external
//! `target` program, plus the glue for invoking that program directly.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tracing::debug;

use crate::state::HostInfo;
use crate::Env;

/// One inventory record: `chain` is a space-separated hop list ending with
/// the host's own name.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetRecord {
    pub name: String,
    #[serde(default)]
    pub ip_address: String,
    pub chain: String,
}

/// Load targets from a JSON file into the inventory. Returns how many new
/// targets were added.
pub async fn load_file(env: &Env, path: &Path) -> Result<usize> {
    let blob = tokio::fs::read(path)
        .await
        .with_context(|| format!("couldn't read target file {}", path.display()))?;
    load_blob(env, &blob).await
}

/// Load a JSON blob of targets into the inventory. Names already present
/// are skipped, so repeated loads merge instead of clobbering history.
pub async fn load_blob(env: &Env, blob: &[u8]) -> Result<usize> {
    let records: Vec<TargetRecord> =
        serde_json::from_slice(blob).context("target JSON didn't parse")?;
    let mut count = 0;
    for record in records {
        if env.state.host_exists(&record.name).await {
            debug!("duplicate target entry for {}", record.name);
            continue;
        }
        let chain: Vec<String> = record.chain.split_whitespace().map(String::from).collect();
        env.state
            .set_host_info(HostInfo::new(record.name, record.ip_address, chain));
        count += 1;
    }
    Ok(count)
}

/// Run the external target program with the given arguments and merge its
/// stdout into the inventory. Its stderr goes straight to ours; a non-zero
/// exit is the program telling the user why, so it surfaces as an error.
pub async fn run_target_cmd(env: &Env, args: &[String]) -> Result<usize> {
    let output = tokio::process::Command::new(&env.cfg.target_cmd)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .await
        .with_context(|| {
            format!("couldn't run target program {}", env.cfg.target_cmd.display())
        })?;
    if !output.status.success() {
        bail!(
            "target program exited with {}",
            output.status.code().unwrap_or(-1)
        );
    }
    load_blob(env, &output.stdout).await
}
