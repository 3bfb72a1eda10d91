use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use zeroize::Zeroizing;

use mssh::ssh::SshConfig;
use mssh::utils::logging::init_logging;
use mssh::{resolve, summary, targets, Cli, Env, Settings, State};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.verbose);

    let cfg = Arc::new(Settings::from_cli(&cli)?);
    let state = State::new();
    let env = Env::new(state, cfg);

    if env.cfg.password {
        let pw = rpassword::prompt_password("Password to use for auth: ")
            .context("couldn't read the password")?;
        env.state.set_auth_pass(Zeroizing::new(pw));
    }

    // One client config for every hop; a bad key path should fail here,
    // not on connect number one of ten thousand.
    let ssh_config = if env.cfg.agent {
        SshConfig::with_agent(&env.cfg.user)
    } else {
        SshConfig::from_key_file(&env.cfg.user, &env.cfg.key)?
    };
    env.state.set_ssh_config(Arc::new(ssh_config));

    if env.cfg.server {
        std::fs::metadata(&env.cfg.host_key).with_context(|| {
            format!("couldn't read server host key {}", env.cfg.host_key.display())
        })?;
        std::fs::create_dir_all(&env.cfg.control_path).with_context(|| {
            format!("couldn't create control path {}", env.cfg.control_path.display())
        })?;
    }
    if env.cfg.spool {
        std::fs::create_dir_all(&env.cfg.spool_dir).with_context(|| {
            format!("couldn't create spool dir {}", env.cfg.spool_dir.display())
        })?;
    }

    let mut count = 0;
    if let Some(file) = env.cfg.file.clone() {
        debug!("reading targets from {}", file.display());
        count = targets::load_file(&env, &file)
            .await
            .context("couldn't load the target data")?;
    }
    if count > 0 {
        debug!("connecting to {count} hosts");
        let start = Instant::now();
        let connected = resolve::connect_everywhere(&env, env.cfg.timeout).await?;
        debug!(
            "connected {connected} hosts in {:.2}s",
            start.elapsed().as_secs_f64()
        );
    }

    if env.cfg.server {
        info!(
            "holding connections open; control sockets under {}",
            env.cfg.control_path.display()
        );
        tokio::signal::ctrl_c()
            .await
            .context("couldn't wait for the interrupt signal")?;
        env.state.timeout_waiters().await;
        resolve::disconnect_everywhere(&env, true).await;
    } else {
        summary::print_summary(&env, env.cfg.verbose).await;
    }

    Ok(())
}
