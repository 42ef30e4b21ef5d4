use agentmux::memory::{
    EmbeddingProvider, GetAllOptions, MemoryError, MemoryFilters, MemoryMetadata, MemoryQuery,
    MemoryStore, MemoryStoreConfig, MemoryType,
};
use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

/// Deterministic 3-dimensional embedder: counts occurrences of three marker
/// words so tests can reason about similarity exactly.
struct MarkerEmbedder;

#[async_trait]
impl EmbeddingProvider for MarkerEmbedder {
    fn dimension(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let lower = text.to_lowercase();
        Ok(vec![
            lower.matches("router").count() as f32,
            lower.matches("memory").count() as f32,
            lower.matches("stage").count() as f32,
        ])
    }
}

fn vector_store() -> MemoryStore {
    MemoryStore::open(MemoryStoreConfig {
        dimension: 3,
        ..MemoryStoreConfig::default()
    })
    .unwrap()
    .with_embedder(Arc::new(MarkerEmbedder))
}

fn metadata(entry_type: MemoryType, agent: &str) -> serde_json::Value {
    MemoryMetadata::new(entry_type)
        .with_agent_id(agent)
        .into_value()
}

#[tokio::test]
async fn search_ranks_by_cosine_similarity() {
    let store = vector_store();
    store
        .add("all about the router", Some(vec![1.0, 0.0, 0.0]), metadata(MemoryType::Document, "a"))
        .unwrap();
    store
        .add("router and memory", Some(vec![1.0, 1.0, 0.0]), metadata(MemoryType::Document, "a"))
        .unwrap();
    store
        .add("only stages here", Some(vec![0.0, 0.0, 1.0]), metadata(MemoryType::Document, "a"))
        .unwrap();

    let results = store
        .search(MemoryQuery::text("tell me about the router"))
        .await
        .unwrap();

    // The default threshold of 0 keeps even the orthogonal entry.
    assert_eq!(results.len(), 3);
    assert!(results[0].entry.content.contains("all about the router"));

    let results = store
        .search(MemoryQuery::text("tell me about the router").with_threshold(0.1))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].similarity > results[1].similarity);
    for result in &results {
        assert!((result.distance - (1.0 - result.similarity)).abs() < 1e-6);
    }
}

#[tokio::test]
async fn threshold_and_limit_apply() {
    let store = vector_store();
    for i in 0..5 {
        store
            .add(
                format!("entry {}", i),
                Some(vec![1.0, i as f32 * 0.5, 0.0]),
                metadata(MemoryType::Other, "a"),
            )
            .unwrap();
    }

    let results = store
        .search(
            MemoryQuery::vector(vec![1.0, 0.0, 0.0])
                .with_threshold(0.9)
                .with_limit(2),
        )
        .await
        .unwrap();

    assert!(results.len() <= 2);
    assert!(results.iter().all(|r| r.similarity >= 0.9));
}

#[tokio::test]
async fn metadata_filters_compose() {
    let store = vector_store();
    let tagged = MemoryMetadata::new(MemoryType::Task)
        .with_agent_id("researcher")
        .with_session_id("s-1")
        .with_tag("release")
        .with_tag("summary")
        .with_importance(0.8)
        .into_value();
    store
        .add("the important one", Some(vec![1.0, 0.0, 0.0]), tagged)
        .unwrap();
    store
        .add(
            "same direction, wrong metadata",
            Some(vec![1.0, 0.0, 0.0]),
            metadata(MemoryType::Conversation, "someone-else"),
        )
        .unwrap();

    let results = store
        .search(
            MemoryQuery::vector(vec![1.0, 0.0, 0.0]).with_filters(MemoryFilters {
                types: vec![MemoryType::Task],
                agent_id: Some("researcher".to_string()),
                session_id: Some("s-1".to_string()),
                tags: vec!["release".to_string(), "summary".to_string()],
                min_importance: Some(0.5),
                ..MemoryFilters::default()
            }),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].entry.content, "the important one");

    // Requiring a missing tag excludes the entry.
    let none = store
        .search(
            MemoryQuery::vector(vec![1.0, 0.0, 0.0]).with_filters(MemoryFilters {
                tags: vec!["release".to_string(), "missing".to_string()],
                ..MemoryFilters::default()
            }),
        )
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn access_tracking_updates_returned_entries() {
    let store = vector_store();
    let id = store
        .add("tracked", Some(vec![1.0, 0.0, 0.0]), metadata(MemoryType::Other, "a"))
        .unwrap();

    assert_eq!(store.get(id).unwrap().access_count, 0);
    store
        .search(MemoryQuery::vector(vec![1.0, 0.0, 0.0]))
        .await
        .unwrap();

    let entry = store.get(id).unwrap();
    assert_eq!(entry.access_count, 1);
    assert!(entry.last_accessed_at.is_some());
}

#[tokio::test]
async fn text_search_without_an_embedder_is_a_query_error() {
    let store = MemoryStore::open(MemoryStoreConfig {
        dimension: 3,
        ..MemoryStoreConfig::default()
    })
    .unwrap();

    let err = store.search(MemoryQuery::text("q")).await.unwrap_err();
    assert!(matches!(err, MemoryError::QueryError(_)));

    let err = store.search(MemoryQuery::default()).await.unwrap_err();
    assert!(matches!(err, MemoryError::QueryError(_)));
}

#[tokio::test]
async fn zero_dimension_mode_rejects_similarity_search() {
    let store = MemoryStore::open(MemoryStoreConfig::default()).unwrap();
    store
        .add("text only", None, metadata(MemoryType::Other, "a"))
        .unwrap();

    let err = store
        .search(MemoryQuery::vector(vec![1.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::QueryError(_)));
}

#[test]
fn persistence_round_trips_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("memory.jsonl");

    let id = {
        let store = MemoryStore::open(MemoryStoreConfig {
            dimension: 3,
            persist_path: Some(path.clone()),
            ..MemoryStoreConfig::default()
        })
        .unwrap();
        store
            .add("durable", Some(vec![1.0, 2.0, 3.0]), metadata(MemoryType::Code, "a"))
            .unwrap()
    };

    let reopened = MemoryStore::open(MemoryStoreConfig {
        dimension: 3,
        persist_path: Some(path),
        ..MemoryStoreConfig::default()
    })
    .unwrap();
    let entry = reopened.get(id).unwrap();
    assert_eq!(entry.content, "durable");
    assert_eq!(entry.embedding, Some(vec![1.0, 2.0, 3.0]));

    // Ids keep growing monotonically after a reload.
    let next = reopened
        .add("later", None, metadata(MemoryType::Other, "a"))
        .unwrap();
    assert!(next > id);
}

#[test]
fn update_delete_cleanup_and_stats() {
    let store = MemoryStore::open(MemoryStoreConfig::default()).unwrap();
    let id1 = store
        .add("first", None, metadata(MemoryType::Task, "a"))
        .unwrap();
    let id2 = store
        .add("second", None, metadata(MemoryType::Code, "b"))
        .unwrap();

    store
        .update(id1, serde_json::json!({"importance": 1.0}))
        .unwrap();
    assert_eq!(store.get(id1).unwrap().metadata["importance"], 1.0);

    store.delete(id2).unwrap();
    assert!(matches!(store.get(id2), Err(MemoryError::NotFound(_))));
    assert!(matches!(store.delete(id2), Err(MemoryError::NotFound(_))));

    let stats = store.stats();
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.by_type["task"], 1);

    // Nothing is old enough to clean up.
    assert_eq!(store.cleanup(30).unwrap(), 0);
    // Everything is older than "-1 days" from now.
    assert_eq!(store.cleanup(-1).unwrap(), 1);
    assert_eq!(store.stats().total_entries, 0);
}

#[test]
fn get_all_supports_type_filter_and_pagination() {
    let store = MemoryStore::open(MemoryStoreConfig::default()).unwrap();
    for i in 0..4 {
        store
            .add(format!("code {}", i), None, metadata(MemoryType::Code, "a"))
            .unwrap();
    }
    store
        .add("doc", None, metadata(MemoryType::Document, "a"))
        .unwrap();

    let code = store.get_all(GetAllOptions {
        entry_type: Some(MemoryType::Code),
        ..GetAllOptions::default()
    });
    assert_eq!(code.len(), 4);

    let page = store.get_all(GetAllOptions {
        entry_type: Some(MemoryType::Code),
        offset: 2,
        limit: Some(10),
    });
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].content, "code 2");
}

#[test]
fn export_and_import_round_trip_with_dedup() {
    let dir = TempDir::new().unwrap();
    let export_path = dir.path().join("export.json");

    let store = MemoryStore::open(MemoryStoreConfig {
        dimension: 3,
        ..MemoryStoreConfig::default()
    })
    .unwrap();
    store
        .add("alpha entry", Some(vec![1.0, 0.0, 0.0]), metadata(MemoryType::Task, "a"))
        .unwrap();
    store
        .add("beta entry", None, metadata(MemoryType::Other, "b"))
        .unwrap();

    let report = store.export_to_json(&export_path, true).unwrap();
    assert_eq!(report.transferred, 2);
    assert_eq!(report.failed, 0);

    let document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&export_path).unwrap()).unwrap();
    assert_eq!(document["version"], "4.0.0");
    assert_eq!(document["metadata"]["totalEntries"], 2);
    assert_eq!(document["metadata"]["includesEmbeddings"], true);
    assert_eq!(document["entries"][0]["embedding"][0], 1.0);

    // Import into a fresh store.
    let target = MemoryStore::open(MemoryStoreConfig {
        dimension: 3,
        ..MemoryStoreConfig::default()
    })
    .unwrap();
    let report = target.import_from_json(&export_path, false).unwrap();
    assert_eq!(report.transferred, 2);
    assert_eq!(report.skipped, 0);

    // Importing again deduplicates by content fingerprint.
    let report = target.import_from_json(&export_path, false).unwrap();
    assert_eq!(report.transferred, 0);
    assert_eq!(report.skipped, 2);

    // clear_existing replaces instead of appending.
    let report = target.import_from_json(&export_path, true).unwrap();
    assert_eq!(report.transferred, 2);
    assert_eq!(target.stats().total_entries, 2);
}

#[test]
fn import_rejects_unsupported_versions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(
        &path,
        serde_json::json!({"version": "2.0", "entries": []}).to_string(),
    )
    .unwrap();

    let store = MemoryStore::open(MemoryStoreConfig::default()).unwrap();
    let err = store.import_from_json(&path, false).unwrap_err();
    assert!(matches!(err, MemoryError::VersionMismatch(v) if v == "2.0"));

    // Legacy 1.0 documents are accepted.
    std::fs::write(
        &path,
        serde_json::json!({
            "version": "1.0",
            "entries": [{"content": "legacy entry", "metadata": {"type": "other"}}],
        })
        .to_string(),
    )
    .unwrap();
    let report = store.import_from_json(&path, false).unwrap();
    assert_eq!(report.transferred, 1);
}

#[test]
fn import_records_invalid_entries_and_continues() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mixed.json");
    std::fs::write(
        &path,
        serde_json::json!({
            "version": "4.0.0",
            "entries": [
                {"content": "good", "metadata": {"type": "other"}},
                {"metadata": {"type": "other"}},
                {"content": "", "metadata": {"type": "other"}},
            ],
        })
        .to_string(),
    )
    .unwrap();

    let store = MemoryStore::open(MemoryStoreConfig::default()).unwrap();
    let report = store.import_from_json(&path, false).unwrap();
    assert_eq!(report.transferred, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.errors.len(), 2);
}

#[test]
fn backup_and_restore() {
    let dir = TempDir::new().unwrap();
    let backup_path = dir.path().join("backup.jsonl");

    let store = MemoryStore::open(MemoryStoreConfig::default()).unwrap();
    store
        .add("keep me", None, metadata(MemoryType::Other, "a"))
        .unwrap();
    store.backup(&backup_path).unwrap();

    store.clear().unwrap();
    assert_eq!(store.stats().total_entries, 0);

    store.restore(&backup_path).unwrap();
    assert_eq!(store.stats().total_entries, 1);
    let entries = store.get_all(GetAllOptions::default());
    assert_eq!(entries[0].content, "keep me");
}
