//! Inference fan-out through the dispatcher.

use crate::helpers::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use remora::prelude::*;
use remora::DispatchError;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_predict_blocks_bounds_concurrency_and_isolates_failures() {
    let connector = MockConnector::new().with_forward_delay(Duration::from_millis(2));
    let t = test_engine(5, connector);
    t.engine.load_model("unet.zip").await.unwrap();

    // Roughly one block in five is malformed and fails on the server.
    let mut rng = StdRng::seed_from_u64(7);
    let mut blocks = blocks(100, 4);
    let mut broken = Vec::new();
    for (i, block) in blocks.iter_mut().enumerate() {
        if rng.gen_bool(0.2) {
            block.shape = vec![5];
            broken.push(i);
        }
    }
    assert!(!broken.is_empty());

    let results = t.engine.predict_blocks(blocks).await;
    assert_eq!(results.len(), 100);

    for (i, result) in results.iter().enumerate() {
        if broken.contains(&i) {
            let err = result.as_ref().unwrap_err();
            assert!(
                matches!(err.session_error(), Some(SessionError::Protocol { .. })),
                "block {i}: {err}"
            );
        } else {
            let output = result.as_ref().unwrap();
            assert_eq!(output.data, vec![i as f32 * 2.0; 4], "block {i}");
        }
    }

    assert_eq!(t.server.forwards.load(Ordering::SeqCst), 100);
    let peak = t.server.peak_running.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak concurrency {peak} exceeded batch size");

    t.engine.dispatcher().wait_idle().await;
    let stats = t.engine.dispatch_stats();
    assert_eq!(stats.submitted, 100);
    assert_eq!(stats.completed, 100);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_predict_without_session_fails_every_block() {
    let t = test_engine(3, MockConnector::new());
    let results = t.engine.predict_blocks(blocks(6, 2)).await;

    assert_eq!(results.len(), 6);
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err.session_error(), Some(SessionError::NoSession)));
    }
    assert_eq!(t.server.forwards.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_abort_cancels_queued_blocks() {
    let connector = MockConnector::new().with_forward_delay(Duration::from_millis(200));
    let t = test_engine(1, connector);
    t.engine.load_model("unet.zip").await.unwrap();

    let controller = t.engine.controller().clone();
    let tickets = t.engine.dispatcher().submit_all(blocks(4, 1), move |block| {
        let controller = controller.clone();
        async move { controller.forward(block).await }
    });

    // Let the first block start, then drop the rest.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled = t.engine.dispatcher().abort();
    assert_eq!(cancelled, 3);

    let results = remora::join_all(tickets).await;
    assert!(results[0].is_ok());
    for result in &results[1..] {
        assert!(matches!(result, Err(DispatchError::Cancelled)));
    }
}
