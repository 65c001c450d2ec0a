//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use flatshard::{KeyPair, Role, Store, StoreConfig};
use rsa::RsaPrivateKey;
use std::sync::OnceLock;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Route store logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A key pair generated once per test binary.
pub fn keys() -> KeyPair {
    init_tracing();
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        KeyPair::new(RsaPrivateKey::new(&mut rng, 1024).unwrap())
    })
    .clone()
}

pub fn config(dir: &TempDir, shard_size: u64) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        shard_size,
        max_workers: 4,
        sync_writes: false,
        ..Default::default()
    }
}

/// Open a store at `config` with `admin`/`pw` logged in.
pub fn open_as_admin(config: StoreConfig) -> Store {
    let store = Store::open_or_create(config, keys()).unwrap();
    store.add_user("admin", "pw", Role::Admin).unwrap();
    store.authenticate("admin", "pw").unwrap();
    store
}

pub fn admin_store(dir: &TempDir, shard_size: u64) -> Store {
    open_as_admin(config(dir, shard_size))
}
