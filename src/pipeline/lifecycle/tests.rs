use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

use crate::config::Config;
use crate::embeddings::{EmbedPayload, EmbeddingFunction, EmbeddingProvider};
use crate::pipeline::{CollectedSources, DocumentSource};
use async_trait::async_trait;

struct NullProvider;

#[async_trait]
impl EmbeddingProvider for NullProvider {
    async fn embed(&self, batch: &[EmbedPayload]) -> Result<Vec<Vec<f32>>> {
        Ok(batch.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
    }

    fn embedding_dim(&self) -> usize {
        4
    }
}

struct EmptySource;

impl DocumentSource for EmptySource {
    fn collect(&self, _update_dir: &std::path::Path) -> Result<CollectedSources> {
        Ok(CollectedSources::default())
    }
}

fn service_in(dir: &TempDir) -> RagService {
    let config = Config {
        base_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let embedding = EmbeddingFunction::new(Arc::new(NullProvider));
    let pipeline =
        RagPipeline::new(&config, embedding.clone(), embedding, Box::new(EmptySource)).unwrap();
    RagService::new(Arc::new(pipeline), true)
}

#[tokio::test]
async fn runs_routine_once() {
    let manager = WarmupManager::new();
    let runs = AtomicUsize::new(0);

    manager
        .ensure_ready(|| {
            runs.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap();
    manager
        .ensure_ready(|| {
            runs.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state().await, WarmupState::Complete);
}

#[tokio::test]
async fn failure_resets_state_and_allows_retry() {
    let manager = WarmupManager::new();

    let err = manager
        .ensure_ready(|| async { Err(RagError::Storage("boom".to_string())) })
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Storage(_)));
    assert_eq!(manager.state().await, WarmupState::NotStarted);

    manager.ensure_ready(|| async { Ok(()) }).await.unwrap();
    assert_eq!(manager.state().await, WarmupState::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_run() {
    let manager = Arc::new(WarmupManager::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let runs = Arc::clone(&runs);
        handles.push(tokio::spawn(async move {
            manager
                .ensure_ready(|| {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(())
                    }
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state().await, WarmupState::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiter_becomes_runner_after_failure() {
    let manager = Arc::new(WarmupManager::new());
    let attempts = Arc::new(AtomicUsize::new(0));

    let routine = {
        let attempts = Arc::clone(&attempts);
        move || {
            let attempts = Arc::clone(&attempts);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                if n == 0 {
                    Err(RagError::Storage("first attempt fails".to_string()))
                } else {
                    Ok(())
                }
            }
        }
    };

    let first = {
        let manager = Arc::clone(&manager);
        let routine = routine.clone();
        tokio::spawn(async move { manager.ensure_ready(routine).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.ensure_ready(routine).await })
    };

    // the runner sees its own failure, the waiter retries and succeeds
    assert!(first.await.unwrap().is_err());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(manager.state().await, WarmupState::Complete);
}

#[test]
fn warmup_blocking_without_runtime() {
    let dir = TempDir::new().unwrap();
    let service = service_in(&dir);

    service.warmup_blocking().unwrap();
}

#[tokio::test]
async fn warmup_blocking_inside_runtime_is_an_error() {
    let dir = TempDir::new().unwrap();
    let service = service_in(&dir);

    assert!(service.warmup_blocking().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_warmup_completes_in_background() {
    let dir = TempDir::new().unwrap();
    let service = service_in(&dir);

    service.spawn_warmup().await.unwrap().unwrap();
    assert_eq!(service.warmup_state().await, WarmupState::Complete);
}
