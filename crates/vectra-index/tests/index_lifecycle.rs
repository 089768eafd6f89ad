use std::sync::Arc;

use vectra_core::Error;
use vectra_index::{AnnIndex, IndexConfig, IndexStatus};

fn flat(vectors: &[&[f32]]) -> Vec<f32> {
    vectors.iter().flat_map(|v| v.iter().copied()).collect()
}

#[tokio::test]
async fn add_train_search() {
    let dir = tempfile::tempdir().unwrap();
    let index = AnnIndex::open(dir.path(), 4, 0).unwrap();

    index
        .add(
            flat(&[&[1.0, 0.0, 0.0, 0.0], &[0.0, 1.0, 0.0, 0.0]]),
            vec![100, 200],
        )
        .await
        .unwrap();

    // Not searchable until the first train produces an index.
    assert!(!index.searchable());
    let err = index
        .search(Arc::new(vec![1.0, 0.0, 0.0, 0.0]), 1, 128, 128)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IndexNotReady));

    index.train(0).unwrap();
    assert!(index.searchable());

    let results = index
        .search(Arc::new(vec![1.0, 0.0, 0.0, 0.0]), 2, 128, 128)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].len(), 2);
    assert_eq!(results[0][0].vid, 100);
    assert!(results[0][0].score > results[0][1].score);
    assert_eq!(results[0][0].from, 0);
}

#[tokio::test]
async fn topk_bounds_results() {
    let dir = tempfile::tempdir().unwrap();
    let index = AnnIndex::open(dir.path(), 2, 1).unwrap();

    let mut vectors = Vec::new();
    let mut vids = Vec::new();
    for i in 0..10u64 {
        vectors.extend_from_slice(&[1.0, i as f32]);
        vids.push(i);
    }
    index.add(vectors, vids).await.unwrap();
    index.train(0).unwrap();

    let results = index
        .search(Arc::new(vec![1.0, 1.0]), 3, 128, 128)
        .await
        .unwrap();
    assert_eq!(results[0].len(), 3);
    for pair in results[0].windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    // Highest inner product against [1, 1] is the row with the largest
    // second component.
    assert_eq!(results[0][0].vid, 9);
}

#[tokio::test]
async fn multi_query_buffers_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let index = AnnIndex::open(dir.path(), 2, 0).unwrap();

    index
        .add(flat(&[&[1.0, 0.0], &[0.0, 1.0]]), vec![1, 2])
        .await
        .unwrap();
    index.train(0).unwrap();

    let results = index
        .search(Arc::new(vec![1.0, 0.0, 0.0, 1.0]), 1, 128, 128)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0][0].vid, 1);
    assert_eq!(results[1][0].vid, 2);
}

#[tokio::test]
async fn dump_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = AnnIndex::open(dir.path(), 2, 5).unwrap();
        index
            .add(flat(&[&[1.0, 0.0], &[0.5, 0.5]]), vec![7, 8])
            .await
            .unwrap();
        index.train(0).unwrap();
    }

    let reopened = AnnIndex::open(dir.path(), 2, 5).unwrap();
    let stats = reopened.stats().await.unwrap();
    assert_eq!(stats.dataset_size, 2);
    assert_eq!(stats.index_size, 2);
    assert_eq!(stats.status, IndexStatus::Ready);
    assert!(reopened.searchable());

    let results = reopened
        .search(Arc::new(vec![1.0, 0.0]), 1, 128, 128)
        .await
        .unwrap();
    assert_eq!(results[0][0].vid, 7);
}

#[tokio::test]
async fn destroy_fails_further_ops() {
    let dir = tempfile::tempdir().unwrap();
    let index = AnnIndex::open(dir.path(), 2, 0).unwrap();
    index.add(vec![1.0, 0.0], vec![1]).await.unwrap();

    index.destroy();
    index.destroy(); // idempotent

    assert!(!index.searchable());
    assert!(matches!(
        index.add(vec![0.0, 1.0], vec![2]).await,
        Err(Error::IndexNotInitialized)
    ));
    assert!(matches!(
        index.stats().await,
        Err(Error::IndexNotInitialized)
    ));
    assert!(matches!(
        index.search(Arc::new(vec![1.0, 0.0]), 1, 1, 1).await,
        Err(Error::IndexNotInitialized)
    ));
}

#[tokio::test]
async fn add_shape_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let index = AnnIndex::open(dir.path(), 4, 0).unwrap();
    let err = index.add(vec![1.0, 2.0], vec![1]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn train_admission_errors() {
    let dir = tempfile::tempdir().unwrap();
    let index = AnnIndex::open(dir.path(), 2, 0).unwrap();

    assert!(matches!(index.train(0), Err(Error::DatasetEmpty)));

    index.add(vec![1.0, 0.0], vec![1]).await.unwrap();
    index.train(0).unwrap();
    // Dataset unchanged since the last train.
    assert!(matches!(index.train(0), Err(Error::NothingToTrain)));

    index.add(vec![0.0, 1.0], vec![2]).await.unwrap();
    index.train(0).unwrap();
    let stats = index.stats().await.unwrap();
    assert_eq!(stats.index_size, 2);
}

#[tokio::test]
async fn partitioned_index_above_brute_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let config = IndexConfig {
        dim: 2,
        brute_threshold: 8,
    };
    let index = AnnIndex::open_with(dir.path(), config, 0).unwrap();

    let mut vectors = Vec::new();
    let mut vids = Vec::new();
    for i in 0..64u64 {
        let angle = i as f32 / 64.0 * std::f32::consts::TAU;
        vectors.extend_from_slice(&[angle.cos(), angle.sin()]);
        vids.push(i);
    }
    index.add(vectors, vids).await.unwrap();
    index.train(0).unwrap();

    let stats = index.stats().await.unwrap();
    assert!(!stats.is_brute);
    assert!(stats.nlist > 0);
    assert_eq!(stats.index_size, 64);

    // With every partition probed the exact best match must surface.
    let results = index
        .search(Arc::new(vec![1.0, 0.0]), 1, stats.nlist as usize, 128)
        .await
        .unwrap();
    assert_eq!(results[0][0].vid, 0);
}

#[tokio::test]
async fn status_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let index = AnnIndex::open(dir.path(), 2, 0).unwrap();
    assert_eq!(index.stats().await.unwrap().status, IndexStatus::NoIndex);

    index.add(vec![1.0, 0.0], vec![1]).await.unwrap();
    assert_eq!(index.stats().await.unwrap().status, IndexStatus::Add);

    index.train(0).unwrap();
    assert_eq!(index.stats().await.unwrap().status, IndexStatus::Ready);

    // Adds after training keep the index searchable.
    index.add(vec![0.0, 1.0], vec![2]).await.unwrap();
    let stats = index.stats().await.unwrap();
    assert_eq!(stats.status, IndexStatus::Add);
    assert!(index.searchable());
}
