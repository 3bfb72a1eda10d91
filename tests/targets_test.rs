//! Target inventory loading: the JSON schema, duplicate handling, chain
//! splitting, and the external target program path.

use std::path::PathBuf;
use std::sync::Arc;

use mssh::targets::{load_blob, load_file, run_target_cmd};
use mssh::{Env, Settings, State};

fn test_env(target_cmd: &str) -> Env {
    Env::new(
        State::new(),
        Arc::new(Settings {
            agent: false,
            bastion_conns: 2,
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
            target_cmd: PathBuf::from(target_cmd),
            tee: false,
            test_cmd: "exit 0".into(),
            timeout: 5,
            user: "test".into(),
            verbose: false,
        }),
    )
}

const BLOB: &str = r#"[
    {"name": "web-01", "ip_address": "10.0.0.1", "chain": "bastion web-01"},
    {"name": "web-02", "ip_address": "10.0.0.2", "chain": "bastion web-02"},
    {"name": "solo", "ip_address": "10.0.0.3", "chain": "solo"}
]"#;

#[tokio::test]
async fn test_load_blob_populates_inventory() {
    let env = test_env("/bin/true");
    let count = load_blob(&env, BLOB.as_bytes()).await.unwrap();
    assert_eq!(count, 3);

    let hi = env.state.get_host_info("web-01").await.unwrap();
    assert_eq!(hi.ip_address, "10.0.0.1");
    assert_eq!(hi.chain, vec!["bastion".to_string(), "web-01".to_string()]);

    let hi = env.state.get_host_info("solo").await.unwrap();
    assert_eq!(hi.chain, vec!["solo".to_string()]);

    // The reverse map is fed from the records.
    assert_eq!(env.state.get_ptr("10.0.0.2").await, "web-02");
}

#[tokio::test]
async fn test_load_blob_skips_duplicates() {
    let env = test_env("/bin/true");
    assert_eq!(load_blob(&env, BLOB.as_bytes()).await.unwrap(), 3);
    // Loading the same blob again adds nothing.
    assert_eq!(load_blob(&env, BLOB.as_bytes()).await.unwrap(), 0);
    assert_eq!(env.state.get_host_keys().await.len(), 3);
}

#[tokio::test]
async fn test_load_blob_rejects_garbage() {
    let env = test_env("/bin/true");
    assert!(load_blob(&env, b"not json at all").await.is_err());
    assert!(load_blob(&env, b"{\"name\": \"not-an-array\"}").await.is_err());
}

#[tokio::test]
async fn test_load_blob_tolerates_missing_ip() {
    let env = test_env("/bin/true");
    let blob = r#"[{"name": "bare", "chain": "bare"}]"#;
    assert_eq!(load_blob(&env, blob.as_bytes()).await.unwrap(), 1);
    let hi = env.state.get_host_info("bare").await.unwrap();
    assert!(hi.ip_address.is_empty());
}

#[tokio::test]
async fn test_load_file() {
    let env = test_env("/bin/true");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("targets.json");
    tokio::fs::write(&path, BLOB).await.unwrap();
    assert_eq!(load_file(&env, &path).await.unwrap(), 3);
    assert!(load_file(&env, &dir.path().join("missing.json")).await.is_err());
}

#[tokio::test]
async fn test_run_target_cmd_merges_stdout() {
    // `echo` stands in for the external target program: its argument is
    // the JSON it "produces".
    let env = test_env("/bin/echo");
    let blob = r#"[{"name": "from-cmd", "ip_address": "10.9.9.9", "chain": "from-cmd"}]"#;
    let count = run_target_cmd(&env, &[blob.to_string()]).await.unwrap();
    assert_eq!(count, 1);
    assert!(env.state.host_exists("from-cmd").await);
}

#[tokio::test]
async fn test_run_target_cmd_surfaces_failure() {
    let env = test_env("/bin/false");
    assert!(run_target_cmd(&env, &[]).await.is_err());
}
