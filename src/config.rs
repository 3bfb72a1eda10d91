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

//! Resolved program settings: command line options with home-relative
//! defaults expanded and cross-option rules applied.

use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use std::path::PathBuf;

use crate::cli::Cli;

/// ssh-agent serves at most this many concurrent requests, so agent-based
/// auth caps the connection concurrency.
pub const AGENT_MAX_CONCURRENCY: usize = 128;

#[derive(Debug, Clone)]
pub struct Settings {
    pub agent: bool,
    pub bastion_conns: usize,
    pub concurrency: usize,
    pub control_path: PathBuf,
    pub debug: bool,
    pub daemonize: bool,
    pub execute: bool,
    pub file: Option<PathBuf>,
    pub host_key: PathBuf,
    pub keep_alive: u64,
    pub key: PathBuf,
    pub password: bool,
    pub server: bool,
    pub spool: bool,
    pub spool_dir: PathBuf,
    pub target_cmd: PathBuf,
    pub tee: bool,
    pub test_cmd: String,
    pub timeout: u64,
    pub user: String,
    pub verbose: bool,
}

impl Settings {
    /// Resolve the raw command line into usable settings.
    ///
    /// Daemonizing implies server mode and forbids the interactive password
    /// prompt (there is no terminal to read it from).
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let base = BaseDirs::new().context("could not determine the home directory")?;
        let home = base.home_dir().to_path_buf();

        if cli.daemonize && cli.password {
            bail!("--daemonize cannot be combined with --password");
        }
        if cli.bastion_conns == 0 {
            bail!("--bastion-conns must be at least 1");
        }

        let user = match &cli.user {
            Some(u) => u.clone(),
            None => std::env::var("USER").context("no --user given and $USER is not set")?,
        };

        Ok(Self {
            agent: cli.agent,
            bastion_conns: cli.bastion_conns,
            concurrency: cli.concurrency,
            control_path: cli
                .control_path
                .clone()
                .unwrap_or_else(|| home.join(".ssh/control")),
            debug: cli.debug,
            daemonize: cli.daemonize,
            execute: cli.execute,
            file: cli.file.clone(),
            host_key: cli.host_key.clone().unwrap_or_else(|| home.join(".ssh/id_host")),
            keep_alive: cli.keep_alive,
            key: cli.key.clone().unwrap_or_else(|| home.join(".ssh/id_rsa")),
            password: cli.password,
            server: cli.server || cli.daemonize,
            spool: cli.spool,
            spool_dir: cli.spool_dir.clone().unwrap_or_else(|| home.join(".ssh/spool")),
            target_cmd: cli
                .target_cmd
                .clone()
                .unwrap_or_else(|| home.join("bin/target")),
            tee: cli.tee,
            test_cmd: cli.test_cmd.clone(),
            timeout: cli.timeout,
            user,
            verbose: cli.verbose,
        })
    }

    /// The connection concurrency bound actually applied, accounting for
    /// the ssh-agent cap.
    pub fn effective_concurrency(&self) -> usize {
        if self.agent {
            self.concurrency.min(AGENT_MAX_CONCURRENCY)
        } else {
            self.concurrency
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("mssh").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        assert!(!cli.agent);
        assert_eq!(cli.bastion_conns, 2);
        assert_eq!(cli.concurrency, 65536);
        assert_eq!(cli.keep_alive, 0);
        assert_eq!(cli.test_cmd, "exit 0");
        assert_eq!(cli.timeout, 60);
        assert!(!cli.server);
    }

    #[test]
    fn test_agent_caps_concurrency() {
        let cli = parse(&["-a", "-u", "nobody"]);
        let settings = Settings::from_cli(&cli).unwrap();
        assert_eq!(settings.effective_concurrency(), AGENT_MAX_CONCURRENCY);

        let cli = parse(&["-a", "-c", "64", "-u", "nobody"]);
        let settings = Settings::from_cli(&cli).unwrap();
        assert_eq!(settings.effective_concurrency(), 64);
    }

    #[test]
    fn test_daemonize_implies_server() {
        let cli = parse(&["--daemonize", "-u", "nobody"]);
        let settings = Settings::from_cli(&cli).unwrap();
        assert!(settings.server);
    }

    #[test]
    fn test_daemonize_forbids_password() {
        let cli = parse(&["--daemonize", "-p", "-u", "nobody"]);
        assert!(Settings::from_cli(&cli).is_err());
    }
}
