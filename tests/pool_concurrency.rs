//! Concurrent dispatch through the pipe pool, against in-memory pipes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keybase_bot::ipc::{PipeFactory, PipePool, Transport};
use keybase_bot::protocol::Request;
use keybase_bot::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Barrier;
use tokio::time::timeout;

use common::{duplex_transport, next_request, respond, TEST_TIMEOUT};

#[derive(Debug, Default, Deserialize)]
struct Handled {
    pipe: usize,
    id: u64,
}

/// Pipes that answer with their own index. When a barrier is set, each
/// pipe holds its first answer until every pipe has received a request.
struct RecordingFactory {
    barrier: Option<Arc<Barrier>>,
    spawned: AtomicUsize,
}

#[async_trait]
impl PipeFactory for RecordingFactory {
    async fn spawn_pipe(&self, index: usize) -> Result<Box<dyn Transport>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (transport, mut peer) = duplex_transport();
        let barrier = self.barrier.clone();
        tokio::spawn(async move {
            let mut pending = Vec::new();
            let mut first = true;
            while let Some(request) = next_request(&mut peer, &mut pending).await {
                if first {
                    if let Some(barrier) = &barrier {
                        barrier.wait().await;
                    }
                    first = false;
                }
                let id = request["params"]["options"]["id"].clone();
                if !respond(&mut peer, &json!({"result": {"pipe": index, "id": id}})).await {
                    break;
                }
            }
        });
        Ok(transport)
    }
}

fn request(id: u64) -> Request<Value> {
    Request::new("echo", json!({ "id": id }))
}

#[tokio::test]
async fn test_fanout_three_runs_three_pipes_in_parallel() {
    let factory = Arc::new(RecordingFactory {
        barrier: Some(Arc::new(Barrier::new(3))),
        spawned: AtomicUsize::new(0),
    });
    let pool = Arc::new(PipePool::start(factory.clone(), 3).await.unwrap());
    assert_eq!(pool.len(), 3);

    // Every pipe blocks until all three have a request in flight, so this
    // only finishes if the three calls really run concurrently.
    let handles: Vec<_> = (0..3u64)
        .map(|id| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.dispatch::<_, Handled>(&request(id)).await })
        })
        .collect();

    let mut pipes = Vec::new();
    for (id, handle) in handles.into_iter().enumerate() {
        let handled = timeout(TEST_TIMEOUT, handle)
            .await
            .expect("Test timed out")
            .unwrap()
            .unwrap();
        assert_eq!(handled.id, id as u64);
        pipes.push(handled.pipe);
    }
    pipes.sort_unstable();
    assert_eq!(pipes, vec![0, 1, 2]);
    assert_eq!(factory.spawned.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_many_callers_get_their_own_answers() {
    let factory = Arc::new(RecordingFactory {
        barrier: None,
        spawned: AtomicUsize::new(0),
    });
    let pool = Arc::new(PipePool::start(factory, 3).await.unwrap());

    let handles: Vec<_> = (0..60u64)
        .map(|id| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { (id, pool.dispatch::<_, Handled>(&request(id)).await) })
        })
        .collect();

    let mut per_pipe = [0usize; 3];
    for handle in handles {
        let (id, result) = timeout(TEST_TIMEOUT, handle)
            .await
            .expect("Test timed out")
            .unwrap();
        let handled = result.unwrap();
        assert_eq!(handled.id, id);
        per_pipe[handled.pipe] += 1;
    }
    assert_eq!(per_pipe, [20, 20, 20]);

    pool.shutdown().await.unwrap();
    assert!(pool.is_empty());
}
