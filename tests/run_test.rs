//! Fleet-wide command execution against mock service loops: status
//! recording, proxy skipping, and timing capture.

use std::path::PathBuf;
use std::sync::Arc;

use mssh::host::{new_inbox, run_everywhere, run_once, HostRequest, RunResponse, SharedInbox};
use mssh::state::{ConnInfo, HostInfo};
use mssh::summary;
use mssh::{Env, Settings, State};

fn test_env() -> Env {
    Env::new(
        State::new(),
        Arc::new(Settings {
            agent: false,
            bastion_conns: 1,
            concurrency: 8,
            control_path: PathBuf::from("/tmp"),
            debug: false,
            daemonize: false,
            execute: false,
            file: None,
            host_key: PathBuf::from("/tmp/id_host"),
            keep_alive: 0,
            key: PathBuf::from("/tmp/id_rsa"),
            password: false,
            server: false,
            spool: false,
            spool_dir: PathBuf::from("/tmp"),
            target_cmd: PathBuf::from("/bin/true"),
            tee: false,
            test_cmd: "exit 0".into(),
            timeout: 5,
            user: "test".into(),
            verbose: false,
        }),
    )
}

/// A service loop stand-in that answers every run request with a canned
/// response and counts how many it served.
fn spawn_mock_runner(
    inbox: SharedInbox,
    response: RunResponse,
    served: Arc<std::sync::Mutex<usize>>,
) {
    tokio::spawn(async move {
        loop {
            let req = inbox.lock().await.recv().await;
            match req {
                Some(HostRequest::Run(rreq)) => {
                    *served.lock().unwrap() += 1;
                    let _ = rreq.reply.send(response.clone());
                }
                Some(_) => {}
                None => return,
            }
        }
    });
}

#[tokio::test]
async fn test_run_once_records_success() {
    let env = test_env();
    env.state
        .set_host_info(HostInfo::new("a", "10.0.0.1", vec!["a".into()]));
    let (req_tx, inbox) = new_inbox();
    let served = Arc::new(std::sync::Mutex::new(0));
    spawn_mock_runner(
        inbox,
        RunResponse {
            stdout: "hi\n".into(),
            stderr: String::new(),
            exit_code: 0,
            err: None,
        },
        Arc::clone(&served),
    );
    env.state
        .set_conn_info(ConnInfo::new("a", req_tx, false, true))
        .await;

    run_once("a", "echo hi", &env, 5).await;

    let hi = env.state.get_host_info("a").await.unwrap();
    assert!(hi.run_ok);
    assert!(hi.run_once);
    assert!(hi.last_error.is_none());
    assert_eq!(*served.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_run_once_records_failure() {
    let env = test_env();
    env.state
        .set_host_info(HostInfo::new("b", "10.0.0.2", vec!["b".into()]));
    let (req_tx, inbox) = new_inbox();
    let served = Arc::new(std::sync::Mutex::new(0));
    spawn_mock_runner(
        inbox,
        RunResponse {
            stdout: String::new(),
            stderr: "boom\n".into(),
            exit_code: 2,
            err: Some("process exited with status 2".into()),
        },
        Arc::clone(&served),
    );
    env.state
        .set_conn_info(ConnInfo::new("b", req_tx, false, true))
        .await;

    run_once("b", "false", &env, 5).await;

    let hi = env.state.get_host_info("b").await.unwrap();
    assert!(!hi.run_ok);
    assert!(hi.run_once);
    assert_eq!(
        hi.last_error.as_deref(),
        Some("process exited with status 2")
    );
    assert_eq!(summary::classify(hi.last_error.as_deref().unwrap()), "process exited with status");
}

#[tokio::test]
async fn test_run_everywhere_skips_proxies() {
    let env = test_env();
    let served = Arc::new(std::sync::Mutex::new(0));

    for name in ["t1", "t2"] {
        env.state
            .set_host_info(HostInfo::new(name, "", vec![name.to_string()]));
        let (req_tx, inbox) = new_inbox();
        spawn_mock_runner(
            inbox,
            RunResponse {
                stdout: format!("{name} out\n"),
                stderr: String::new(),
                exit_code: 0,
                err: None,
            },
            Arc::clone(&served),
        );
        env.state
            .set_conn_info(ConnInfo::new(name, req_tx, false, true))
            .await;
    }

    // The bastion must not see a run request.
    let (bastion_tx, bastion_inbox) = new_inbox();
    let bastion_served = Arc::new(std::sync::Mutex::new(0));
    spawn_mock_runner(
        bastion_inbox,
        RunResponse::default(),
        Arc::clone(&bastion_served),
    );
    env.state
        .set_conn_info(ConnInfo::new("bastion", bastion_tx, true, true))
        .await;

    run_everywhere("uptime", &env, 5).await;

    assert_eq!(*served.lock().unwrap(), 2);
    assert_eq!(*bastion_served.lock().unwrap(), 0);
    for name in ["t1", "t2"] {
        let hi = env.state.get_host_info(name).await.unwrap();
        assert!(hi.run_ok, "{name} should have run");
    }

    // The summary over this state must not panic or block.
    summary::print_summary(&env, true).await;
}
