//! Engine building, device discovery, inference and shutdown.

use crate::helpers::*;
use remora::prelude::*;
use remora::DispatchError;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_engine_requires_connector() {
    init_tracing();
    let err = RemoraEngine::builder().build().unwrap_err();
    assert!(matches!(
        err,
        Error::Session(SessionError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_engine_rejects_zero_batch_size() {
    init_tracing();
    let err = RemoraEngine::builder()
        .connector(Arc::new(MockConnector::new()))
        .batch_size(0)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Dispatch(DispatchError::InvalidConfig(_))));
}

#[test]
fn test_engine_outside_runtime_needs_handle() {
    let err = RemoraEngine::builder()
        .connector(Arc::new(MockConnector::new()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("no tokio runtime"));

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = RemoraEngine::builder()
        .connector(Arc::new(MockConnector::new()))
        .runtime(runtime.handle().clone())
        .build()
        .unwrap();
    assert_eq!(engine.state(), ControllerState::Empty);
    assert_eq!(engine.dispatcher().batch_size(), remora::DEFAULT_BATCH_SIZE);
}

#[tokio::test]
async fn test_refresh_devices_keeps_selection() {
    let t = test_engine(2, MockConnector::new());
    let config = t.engine.refresh_devices().await.unwrap();
    assert_eq!(config.devices.len(), 2);
    assert!(config.devices.iter().all(|d| !d.selected));

    t.engine.select_devices(&["cuda:0"]).unwrap();
    let config = t.engine.refresh_devices().await.unwrap();
    let selected: Vec<_> = config.selected_device_ids();
    assert_eq!(selected, vec!["cuda:0".to_string()]);

    // Discovery probes on shifted ports and always stops its server.
    let probed = t.server.endpoints.lock()[0];
    assert_eq!(probed.primary_port, 5558);
    assert_eq!(t.launches.starts.load(Ordering::SeqCst), 2);
    assert_eq!(t.launches.stops.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_load_predict_close() {
    let t = test_engine(2, MockConnector::new());
    let info = t.engine.load_model("unet.zip").await.unwrap();
    assert_eq!(info.name, "unet.zip");
    assert_eq!(info.num_classes(), 2);
    assert_eq!(t.engine.state(), ControllerState::Ready);

    let output = t
        .engine
        .predict(TensorBlock::new(vec![3], vec![1.0, 2.0, 3.0]))
        .await
        .unwrap();
    assert_eq!(output.data, vec![2.0, 4.0, 6.0]);

    t.engine.close_model().await.unwrap();
    assert_eq!(t.engine.state(), ControllerState::Empty);
    assert!(t.engine.model_info().is_none());
    assert_eq!(t.server.closes.load(Ordering::SeqCst), 1);
    // The launcher started for the session is stopped with it.
    assert_eq!(t.launches.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_selected_devices_reach_the_session() {
    let t = test_engine(2, MockConnector::new());
    t.engine.refresh_devices().await.unwrap();
    t.engine.select_devices(&["cpu", "cuda:0"]).unwrap();
    t.engine.load_model("unet.zip").await.unwrap();

    let state = t.engine.controller().download_state().await.unwrap();
    assert_eq!(state.model, b"cpu,cuda:0");
}

#[tokio::test]
async fn test_invalid_config_is_rejected_up_front() {
    let t = test_engine(2, MockConnector::new());
    let err = t
        .engine
        .set_server_config(loopback_config().with_ports(7000, 7000))
        .unwrap_err();
    assert!(matches!(
        err.session_error(),
        Some(SessionError::InvalidConfig(_))
    ));
    assert_eq!(t.engine.server_config().unwrap(), loopback_config());
}

#[tokio::test]
async fn test_shutdown_closes_session_and_dispatcher() {
    let t = test_engine(2, MockConnector::new());
    t.engine.load_model("unet.zip").await.unwrap();
    t.engine.shutdown().await;

    assert_eq!(t.engine.state(), ControllerState::Empty);
    assert_eq!(t.server.closes.load(Ordering::SeqCst), 1);

    let err = t
        .engine
        .predict(TensorBlock::new(vec![1], vec![1.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Dispatch(DispatchError::Closed)));
}
