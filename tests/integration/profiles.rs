//! Saved server profiles.

use crate::helpers::*;
use remora::prelude::*;
use remora::session::{ProfileStore, SshCredentials, TomlProfileStore};
use remora::{LaunchKind, RemoraEngine, ServerProfile};
use std::sync::Arc;

#[tokio::test]
async fn test_profiles_roundtrip_through_toml_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("servers.toml");
    let store = Arc::new(TomlProfileStore::new(&path));

    let engine = RemoraEngine::builder()
        .connector(Arc::new(MockConnector::new()))
        .launchers(Arc::new(CountingLaunchers::default()))
        .server_config(loopback_config())
        .profiles(store.clone())
        .build()
        .unwrap();

    let local = engine.save_profile("Workstation").unwrap();

    let remote = ServerProfile::new(
        "GPU box",
        SessionConfig::remote("gpu.example.org", SshCredentials::new("ada")),
    );
    store.set(remote.clone()).unwrap();
    assert_eq!(engine.profiles().unwrap().len(), 2);

    let used = engine.use_profile(&remote.id).unwrap();
    assert_eq!(used, remote);
    let config = engine.server_config().unwrap();
    assert_eq!(config.launch_kind(), LaunchKind::Remote);

    engine.use_profile(&local.id).unwrap();
    assert_eq!(engine.server_config().unwrap(), loopback_config());

    // A second store over the same file sees both profiles.
    let reread = TomlProfileStore::new(&path);
    assert_eq!(reread.get(&remote.id).unwrap(), Some(remote));
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains(&format!("[servers.{}]", local.id)));
}

#[tokio::test]
async fn test_unknown_profile_is_a_store_error() {
    let t = test_engine(1, MockConnector::new());
    let err = t.engine.use_profile("missing").unwrap_err();
    assert!(matches!(err.session_error(), Some(SessionError::Store(_))));
}
