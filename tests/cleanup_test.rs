//! Teardown ordering: leaves first, indirect proxies next, direct proxies
//! last, with one cleanup reply drained per parallel bastion loop.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use mssh::host::{new_inbox, CleanupResponse, HostRequest, SharedInbox};
use mssh::resolve::{disconnect_everywhere, disconnect_host};
use mssh::state::ConnInfo;
use mssh::{Env, Settings, State};

fn test_settings(bastion_conns: usize) -> Arc<Settings> {
    Arc::new(Settings {
        agent: false,
        bastion_conns,
        concurrency: 64,
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
    })
}

/// A stand-in for a service loop: answers cleanup, records its name in the
/// shared teardown log, and exits.
fn spawn_mock_loop(inbox: SharedInbox, name: String, log: Arc<Mutex<Vec<String>>>) {
    tokio::spawn(async move {
        loop {
            let req = inbox.lock().await.recv().await;
            match req {
                Some(HostRequest::Cleanup(creq)) => {
                    log.lock().unwrap().push(name.clone());
                    let _ = creq.reply.send(CleanupResponse { all_good: true });
                    return;
                }
                Some(_) => {}
                None => return,
            }
        }
    });
}

async fn register(
    env: &Env,
    name: &str,
    is_proxy: bool,
    is_direct: bool,
    loops: usize,
    log: &Arc<Mutex<Vec<String>>>,
) {
    let (req_tx, inbox) = new_inbox();
    for _ in 0..loops {
        spawn_mock_loop(inbox.clone(), name.to_string(), Arc::clone(log));
    }
    env.state
        .set_conn_info(ConnInfo::new(name, req_tx, is_proxy, is_direct))
        .await;
}

#[tokio::test]
async fn test_disconnect_everywhere_honors_dependency_order() {
    let env = Env::new(State::new(), test_settings(2));
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    // A proxied leaf, a plain direct target, an indirect proxy, and a
    // direct bastion with two parallel loops.
    register(&env, "web", false, false, 1, &log).await;
    register(&env, "solo", false, true, 2, &log).await;
    register(&env, "pci-bastion", true, false, 1, &log).await;
    register(&env, "bastion", true, true, 2, &log).await;

    disconnect_everywhere(&env, true).await;

    let order = log.lock().unwrap().clone();
    let pos = |name: &str| {
        order
            .iter()
            .position(|entry| entry == name)
            .unwrap_or_else(|| panic!("{name} was never cleaned up"))
    };
    let last = |name: &str| {
        order
            .iter()
            .rposition(|entry| entry == name)
            .unwrap()
    };

    // No proxy goes down while a non-proxy remains.
    assert!(last("web") < pos("pci-bastion"));
    assert!(last("solo") < pos("pci-bastion"));
    // No direct proxy goes down while an indirect proxy remains.
    assert!(last("pci-bastion") < pos("bastion"));

    // One reply drained per parallel loop.
    assert_eq!(order.iter().filter(|entry| *entry == "bastion").count(), 2);
    assert_eq!(order.iter().filter(|entry| *entry == "solo").count(), 2);
    assert_eq!(order.iter().filter(|entry| *entry == "web").count(), 1);

    assert!(env.state.get_conn_keys().await.is_empty());
}

#[tokio::test]
async fn test_disconnect_everywhere_can_spare_proxies() {
    let env = Env::new(State::new(), test_settings(1));
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    register(&env, "web", false, false, 1, &log).await;
    register(&env, "bastion", true, true, 1, &log).await;

    disconnect_everywhere(&env, false).await;

    let order = log.lock().unwrap().clone();
    assert_eq!(order, vec!["web".to_string()]);
    assert_eq!(env.state.get_conn_keys().await, vec!["bastion".to_string()]);
}

#[tokio::test]
async fn test_disconnect_host_drains_every_direct_loop() {
    let env = Env::new(State::new(), test_settings(3));
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    register(&env, "bastion", true, true, 3, &log).await;
    disconnect_host(&env, "bastion").await.unwrap();

    assert_eq!(log.lock().unwrap().len(), 3);
    assert!(!env.state.conn_exists("bastion").await);
}

#[tokio::test]
async fn test_disconnect_host_unknown_is_an_error() {
    let env = Env::new(State::new(), test_settings(1));
    assert!(disconnect_host(&env, "ghost").await.is_err());
}
