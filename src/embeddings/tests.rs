use super::*;

struct FixedProvider {
    dim: usize,
    emit_dim: usize,
}

#[async_trait]
impl EmbeddingProvider for FixedProvider {
    async fn embed(&self, batch: &[EmbedPayload]) -> Result<Vec<Vec<f32>>> {
        Ok(batch.iter().map(|_| vec![0.5; self.emit_dim]).collect())
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }
}

#[tokio::test]
async fn adapter_reports_declared_dimension() {
    let f = EmbeddingFunction::new(Arc::new(FixedProvider {
        dim: 8,
        emit_dim: 8,
    }));
    assert_eq!(f.dim(), 8);
}

#[tokio::test]
async fn embed_passes_batch_through_in_order() {
    let f = EmbeddingFunction::new(Arc::new(FixedProvider {
        dim: 4,
        emit_dim: 4,
    }));

    let batch = vec![EmbedPayload::text("a"), EmbedPayload::text("b")];
    let vectors = f.embed(&batch).await.unwrap();

    assert_eq!(vectors.len(), 2);
    assert!(vectors.iter().all(|v| v.len() == 4));
}

#[tokio::test]
async fn dimension_mismatch_is_not_fatal() {
    // Declared 8 but the model emits 4; the adapter warns and passes
    // the vectors through unchanged.
    let f = EmbeddingFunction::new(Arc::new(FixedProvider {
        dim: 8,
        emit_dim: 4,
    }));

    let vectors = f.embed(&[EmbedPayload::text("x")]).await.unwrap();
    assert_eq!(vectors[0].len(), 4);
}

#[test]
fn payload_constructors() {
    assert_eq!(
        EmbedPayload::text("hi"),
        EmbedPayload::Text("hi".to_string())
    );
    assert_eq!(
        EmbedPayload::image("/tmp/a.png"),
        EmbedPayload::ImagePath(PathBuf::from("/tmp/a.png"))
    );
}
