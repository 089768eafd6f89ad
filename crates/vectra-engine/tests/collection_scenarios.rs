use std::sync::Arc;

use serde_json::json;

use vectra_core::{AddDocumentRequest, Error, QueryOptions, ServiceConfig};
use vectra_engine::{training, Collection, Registry, Segment};

fn doc(vqid: &str, vectors: Vec<Vec<f32>>) -> AddDocumentRequest {
    AddDocumentRequest {
        vqid: vqid.to_string(),
        metadata: json!({ "source": vqid }),
        vectors,
        vectors_tag: Vec::new(),
    }
}

/// Train a segment the way the spawned trainer does, without a child
/// process: persist the segment, run the trainer entry, reload the handle.
async fn train_in_process(segment: &Arc<Segment>) {
    segment.dump().await.unwrap();
    assert_eq!(training::run(segment.work_dir(), 0), 0);
    segment.load_index().unwrap();
}

async fn train_collection_in_process(collection: &Collection) {
    for segment in collection.segments_snapshot() {
        let stats = segment.stats().await.unwrap();
        if stats.index.vid_size > 0 && stats.index.index_size < stats.index.vid_size {
            train_in_process(&segment).await;
        }
    }
}

#[tokio::test]
async fn create_add_train_search() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 4, dir.path().join("c"), 10_000).unwrap();

    collection
        .add_document(&doc("a", vec![vec![1.0, 0.0, 0.0, 0.0]]))
        .await
        .unwrap();
    train_collection_in_process(&collection).await;

    let opts = QueryOptions {
        top_k: 1,
        ..QueryOptions::default()
    };
    let results = collection
        .search(vec![1.0, 0.0, 0.0, 0.0], &opts)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].len(), 1);
    assert_eq!(results[0][0].vqid, "a");
    assert_eq!(results[0][0].tag, 0);
    assert_eq!(results[0][0].metadata, json!({ "source": "a" }));
}

#[tokio::test]
async fn delete_hides_search_hit() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 4, dir.path().join("c"), 10_000).unwrap();

    collection
        .add_document(&doc("a", vec![vec![1.0, 0.0, 0.0, 0.0]]))
        .await
        .unwrap();
    train_collection_in_process(&collection).await;

    assert_eq!(collection.delete_document("a"), 1);

    let results = collection
        .search(vec![1.0, 0.0, 0.0, 0.0], &QueryOptions::default())
        .await
        .unwrap();
    assert!(results[0].is_empty());
}

#[tokio::test]
async fn positional_tags_round_trip_through_search() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 2, dir.path().join("c"), 10_000).unwrap();

    // One document, two vectors, no explicit tags: vids must decode to
    // tags 0 and 1.
    collection
        .add_document(&doc("multi", vec![vec![1.0, 0.0], vec![0.0, 1.0]]))
        .await
        .unwrap();
    train_collection_in_process(&collection).await;

    let opts = QueryOptions {
        top_k: 2,
        ..QueryOptions::default()
    };
    let results = collection.search(vec![1.0, 0.0], &opts).await.unwrap();
    let mut tags: Vec<u64> = results[0].iter().map(|r| r.tag).collect();
    tags.sort_unstable();
    assert_eq!(tags, vec![0, 1]);
    assert_eq!(results[0][0].tag, 0);
}

#[tokio::test]
async fn caller_tags_override_position() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 2, dir.path().join("c"), 10_000).unwrap();

    let mut request = doc("tagged", vec![vec![1.0, 0.0]]);
    request.vectors_tag = vec![42];
    collection.add_document(&request).await.unwrap();
    train_collection_in_process(&collection).await;

    let opts = QueryOptions {
        top_k: 1,
        ..QueryOptions::default()
    };
    let results = collection.search(vec![1.0, 0.0], &opts).await.unwrap();
    assert_eq!(results[0][0].tag, 42);
}

#[tokio::test]
async fn segment_rollover_at_max_size() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 2, dir.path().join("c"), 10_000).unwrap();

    let mut batch = Vec::with_capacity(500);
    for i in 0..10_001u32 {
        batch.push(doc(&format!("doc-{i}"), vec![vec![1.0, i as f32]]));
        if batch.len() == 500 || i == 10_000 {
            collection.batch_add_documents(&batch).await.unwrap();
            batch.clear();
        }
    }

    let segments = collection.segments_snapshot();
    assert_eq!(segments.len(), 2);

    let first = segments[0].stats().await.unwrap();
    assert!(first.sealed);
    assert_eq!(first.vector_count, 10_000);

    let second = segments[1].stats().await.unwrap();
    assert!(!second.sealed);
    assert_eq!(second.vector_count, 1);

    // Segment ids are strictly increasing and the id counter stays ahead.
    assert!(segments.windows(2).all(|w| w[0].id() < w[1].id()));
    assert!(collection.max_segment_id() > segments.last().unwrap().id());
}

#[tokio::test]
async fn batch_never_splits_across_segments() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 2, dir.path().join("c"), 10_000).unwrap();

    // 9 999 vectors leave one slot; the next batch of 10 lands whole in
    // the tail, which only rolls over on the admission after it fills.
    let docs: Vec<_> = (0..9_999u32)
        .map(|i| doc(&format!("d{i}"), vec![vec![0.0, i as f32]]))
        .collect();
    for chunk in docs.chunks(1000) {
        collection.batch_add_documents(chunk).await.unwrap();
    }
    let tail_batch: Vec<_> = (0..10u32)
        .map(|i| doc(&format!("t{i}"), vec![vec![1.0, i as f32]]))
        .collect();
    collection.batch_add_documents(&tail_batch).await.unwrap();

    let segments = collection.segments_snapshot();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].stats().await.unwrap().vector_count, 10_009);

    collection
        .add_document(&doc("overflow", vec![vec![1.0, 1.0]]))
        .await
        .unwrap();
    assert_eq!(collection.segments_snapshot().len(), 2);
}

#[tokio::test]
async fn fanout_merges_across_segments() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 2, dir.path().join("c"), 10_000).unwrap();

    collection
        .add_document(&doc("x", vec![vec![1.0, 0.0]]))
        .await
        .unwrap();
    train_collection_in_process(&collection).await;

    // Seal the tail and open a second segment for the next document.
    collection.segments_snapshot()[0].seal();
    collection.add_new_segment().unwrap();
    collection
        .add_document(&doc("y", vec![vec![0.0, 1.0]]))
        .await
        .unwrap();
    train_collection_in_process(&collection).await;

    let opts = QueryOptions {
        top_k: 2,
        ..QueryOptions::default()
    };
    let results = collection.search(vec![1.0, 0.0], &opts).await.unwrap();
    assert_eq!(results[0].len(), 2);
    assert_eq!(results[0][0].vqid, "x");
    assert_eq!(results[0][1].vqid, "y");
    assert!(results[0][0].score > results[0][1].score);
}

#[tokio::test]
async fn search_without_searchable_segments() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 2, dir.path().join("c"), 10_000).unwrap();

    collection
        .add_document(&doc("a", vec![vec![1.0, 0.0]]))
        .await
        .unwrap();
    // Never trained: segment 0 has no index to search.
    let err = collection
        .search(vec![1.0, 0.0], &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IndexUnavailable));
}

#[tokio::test]
async fn cross_segment_delete_update_get() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 2, dir.path().join("c"), 10_000).unwrap();

    collection
        .add_document(&doc("dup", vec![vec![1.0, 0.0]]))
        .await
        .unwrap();
    collection.segments_snapshot()[0].seal();
    collection.add_new_segment().unwrap();
    collection
        .add_document(&doc("dup", vec![vec![0.0, 1.0]]))
        .await
        .unwrap();

    let hits = collection.get_document_metadata("dup", true);
    assert_eq!(hits.len(), 2);
    let first_only = collection.get_document_metadata("dup", false);
    assert_eq!(first_only.len(), 1);

    let updated = collection
        .update_document_metadata("dup", &json!({ "v": 2 }))
        .unwrap();
    assert_eq!(updated, 2);
    let hits = collection.get_document_metadata("dup", true);
    assert!(hits.iter().all(|h| h.metadata == json!({ "v": 2 })));

    let previous = hits.len();
    let deleted = collection.delete_document("dup");
    assert_eq!(deleted, 2);
    assert_eq!(
        collection.get_document_metadata("dup", true).len(),
        previous - deleted
    );
}

#[tokio::test]
async fn dump_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("data");
    let config = ServiceConfig {
        data_path: data_path.clone(),
        ..ServiceConfig::default()
    };

    let top_hit = {
        let registry = Registry::new(&config);
        registry.load_all().await.unwrap();
        let collection = registry.create_collection("books", 4).unwrap();
        collection
            .add_document(&doc("a", vec![vec![1.0, 0.0, 0.0, 0.0]]))
            .await
            .unwrap();
        collection
            .add_document(&doc("b", vec![vec![0.0, 1.0, 0.0, 0.0]]))
            .await
            .unwrap();
        train_collection_in_process(&collection).await;
        collection.dump().await.unwrap();

        let opts = QueryOptions {
            top_k: 1,
            ..QueryOptions::default()
        };
        let results = collection
            .search(vec![1.0, 0.0, 0.0, 0.0], &opts)
            .await
            .unwrap();
        results[0][0].vqid.clone()
    };

    // Fresh registry over the same data dir stands in for a restart.
    let registry = Registry::new(&config);
    registry.load_all().await.unwrap();

    let stats = registry.statistics().await.unwrap();
    assert_eq!(stats.collection_count, 1);
    assert_eq!(stats.collections[0].doc_count, 2);

    let collection = registry.get("books").unwrap();
    let segments = collection.segments_snapshot();
    assert!(segments.iter().all(|s| s.is_searchable()));

    let opts = QueryOptions {
        top_k: 1,
        ..QueryOptions::default()
    };
    let results = collection
        .search(vec![1.0, 0.0, 0.0, 0.0], &opts)
        .await
        .unwrap();
    assert_eq!(results[0][0].vqid, top_hit);
}

#[tokio::test]
async fn registry_validations() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        data_path: dir.path().join("data"),
        ..ServiceConfig::default()
    };
    let registry = Registry::new(&config);
    registry.load_all().await.unwrap();

    assert!(matches!(
        registry.create_collection("", 4),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        registry.create_collection("c", 0),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        registry.create_collection("c", -3),
        Err(Error::InvalidInput(_))
    ));

    registry.create_collection("c", 4).unwrap();
    assert!(matches!(
        registry.create_collection("c", 4),
        Err(Error::AlreadyExists(_))
    ));

    assert!(matches!(
        registry.delete_document("missing", "x"),
        Err(Error::NotFound(_))
    ));

    registry.drop_collection("c").unwrap();
    assert!(registry.get("c").is_none());
    assert!(!config.data_path.join("c").exists());
}

#[tokio::test]
async fn search_on_cold_collection_reports_loading() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        data_path: dir.path().join("data"),
        ..ServiceConfig::default()
    };

    {
        let registry = Registry::new(&config);
        registry.load_all().await.unwrap();
        let collection = registry.create_collection("cold", 2).unwrap();
        collection
            .add_document(&doc("a", vec![vec![1.0, 0.0]]))
            .await
            .unwrap();
        train_collection_in_process(&collection).await;
        collection.dump().await.unwrap();
    }

    let registry = Registry::new(&config);
    // No load_all: the collection is only on disk.
    let err = registry
        .search("cold", &[vec![1.0, 0.0]], &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Loading(_)));

    // The background load eventually makes the collection resident.
    for _ in 0..100 {
        if registry.get("cold").is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    let results = registry
        .search("cold", &[vec![1.0, 0.0]], &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0][0].vqid, "a");
}

#[tokio::test]
async fn drop_index_keeps_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let collection =
        Collection::create("c", 2, dir.path().join("c"), 10_000).unwrap();
    collection
        .add_document(&doc("a", vec![vec![1.0, 0.0]]))
        .await
        .unwrap();
    train_collection_in_process(&collection).await;

    collection.drop_index();
    let segment = &collection.segments_snapshot()[0];
    assert!(!segment.is_searchable());
    assert!(matches!(segment.stats().await, Err(Error::IndexNotInitialized)));
    assert_eq!(collection.get_document_metadata("a", true).len(), 1);
}
