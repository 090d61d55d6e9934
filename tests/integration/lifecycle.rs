//! Controller state transitions as seen through the engine.

use crate::helpers::*;
use parking_lot::Mutex;
use remora::prelude::*;
use remora::session::{ArtifactStore, DirBlobStore, ModelConfig};
use remora::ModelArtifact;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn record_states(engine: &RemoraEngine) -> Arc<Mutex<Vec<ControllerState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine
        .controller()
        .register_listener(move |state| sink.lock().push(state));
    seen
}

#[tokio::test]
async fn test_listener_observes_full_lifecycle() {
    let t = test_engine(2, MockConnector::new());
    let seen = record_states(&t.engine);

    t.engine.load_model("a.zip").await.unwrap();
    t.engine.close_model().await.unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            ControllerState::Empty,
            ControllerState::Provisioning,
            ControllerState::Ready,
            ControllerState::Empty,
        ]
    );
}

#[tokio::test]
async fn test_rejected_model_moves_to_error_then_recovers() {
    let t = test_engine(2, MockConnector::new());
    let err = t
        .engine
        .load_model(std::str::from_utf8(REJECTED_MODEL).unwrap())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("unsupported model"));
    assert_eq!(t.engine.state(), ControllerState::Error);
    assert!(t.engine.model_info().is_none());
    // The server launched for the failed load was stopped again.
    assert_eq!(
        t.launches.starts.load(Ordering::SeqCst),
        t.launches.stops.load(Ordering::SeqCst)
    );

    t.engine.close_model().await.unwrap();
    assert_eq!(t.engine.state(), ControllerState::Empty);

    t.engine.load_model("b.zip").await.unwrap();
    assert_eq!(t.engine.state(), ControllerState::Ready);
}

#[tokio::test]
async fn test_config_change_demotes_to_read_until_upload() {
    let t = test_engine(2, MockConnector::new());
    t.engine.load_model("a.zip").await.unwrap();

    t.engine
        .set_server_config(loopback_config().with_ports(6000, 6001))
        .unwrap();
    assert!(eventually(|| t.engine.state() == ControllerState::Read).await);
    assert!(eventually(|| t.server.closes.load(Ordering::SeqCst) == 1).await);
    assert!(t.engine.model_info().is_some());

    let err = t
        .engine
        .predict(TensorBlock::new(vec![1], vec![1.0]))
        .await
        .unwrap_err();
    assert!(matches!(err.session_error(), Some(SessionError::NoSession)));

    t.engine.upload_model().await.unwrap();
    assert_eq!(t.engine.state(), ControllerState::Ready);
    let last = *t.server.endpoints.lock().last().unwrap();
    assert_eq!(last.primary_port, 6000);
}

#[tokio::test]
async fn test_model_survives_restart_through_dir_store() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(Arc::new(DirBlobStore::new(dir.path())));

    let connector = MockConnector::new();
    let engine = RemoraEngine::builder()
        .connector(Arc::new(connector.clone()))
        .launchers(Arc::new(CountingLaunchers::default()))
        .model_source(Arc::new(NameAsModel))
        .server_config(loopback_config())
        .store(store.clone())
        .build()
        .unwrap();
    engine.load_model("persisted.zip").await.unwrap();
    engine.controller().download_state().await.unwrap();
    drop(engine);

    // A fresh engine over the same directory.
    let reopened = ArtifactStore::new(Arc::new(DirBlobStore::new(dir.path())));
    let engine = RemoraEngine::builder()
        .connector(Arc::new(connector))
        .launchers(Arc::new(CountingLaunchers::default()))
        .server_config(loopback_config())
        .store(reopened)
        .build()
        .unwrap();
    let state = engine.controller().restore_from_store().await.unwrap();
    assert_eq!(state, ControllerState::Read);

    let artifact = engine.controller().artifact().unwrap();
    assert_eq!(artifact.code, b"persisted.zip");
    // The training state was empty on the optimizer side and must stay present.
    let training = artifact.state.unwrap();
    assert!(training.optimizer.is_empty());

    engine.upload_model().await.unwrap();
    assert_eq!(engine.state(), ControllerState::Ready);
}

#[tokio::test]
async fn test_restore_without_info_is_empty() {
    let t = test_engine(2, MockConnector::new());
    let state = t
        .engine
        .controller()
        .restore(ModelArtifact::new(b"code".to_vec(), ModelConfig::new()), None)
        .await
        .unwrap();
    assert_eq!(state, ControllerState::Empty);

    // Bytes are kept, so an upload still works and derives fresh info.
    let info = t.engine.upload_model().await.unwrap();
    assert_eq!(info.name, "code");
    assert_eq!(t.engine.state(), ControllerState::Ready);
}
