use agentmux::checkpoint::{
    compute_checksum, is_valid_run_id, CheckpointData, CheckpointError, CheckpointStore,
    ExecutionModeFlags, RunStatus, StageRecord, StageStatus,
};
use tempfile::TempDir;

fn stage(name: &str, status: StageStatus) -> StageRecord {
    StageRecord {
        name: name.to_string(),
        description: format!("{} description", name),
        status,
        retries: 0,
        result: None,
    }
}

fn sample_checkpoint() -> CheckpointData {
    let mut data = CheckpointData::new("researcher", "summarise the corpus");
    data.mode = ExecutionModeFlags {
        resumable: true,
        ..Default::default()
    };
    data.stages = vec![
        stage("collect", StageStatus::Completed),
        stage("analyze", StageStatus::Pending),
    ];
    data.previous_outputs = vec!["collected everything".to_string()];
    data.recompute_last_completed();
    data
}

#[test]
fn save_load_round_trip_preserves_everything_but_updated_at() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoints")).unwrap();

    let mut data = sample_checkpoint();
    store.save(&mut data).unwrap();

    let loaded = store.load(&data.run_id).unwrap();
    assert_eq!(loaded.run_id, data.run_id);
    assert_eq!(loaded.agent, "researcher");
    assert_eq!(loaded.task, "summarise the corpus");
    assert_eq!(loaded.last_completed_stage_index, 0);
    assert_eq!(loaded.previous_outputs, vec!["collected everything"]);
    assert_eq!(loaded.stages.len(), 2);
    assert_eq!(loaded.checksum, data.checksum);
    assert_eq!(loaded.created_at, data.created_at);
}

#[test]
fn run_directory_layout_is_created() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("checkpoints");
    let store = CheckpointStore::new(&root).unwrap();

    let mut data = sample_checkpoint();
    store.save(&mut data).unwrap();

    let run_dir = root.canonicalize().unwrap().join(&data.run_id);
    assert!(run_dir.join("checkpoint.json").is_file());
    assert!(run_dir.join("metadata.json").is_file());
    assert!(run_dir.join("artifacts").is_dir());
    assert!(run_dir.join("logs").is_dir());
}

#[test]
fn tampered_checkpoints_fail_with_checksum_mismatch() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("checkpoints");
    let store = CheckpointStore::new(&root).unwrap();

    let mut data = sample_checkpoint();
    store.save(&mut data).unwrap();

    let file = root.join(&data.run_id).join("checkpoint.json");
    let tampered = std::fs::read_to_string(&file)
        .unwrap()
        .replace("summarise the corpus", "do something else");
    std::fs::write(&file, tampered).unwrap();

    let err = store.load(&data.run_id).unwrap_err();
    assert!(matches!(err, CheckpointError::ChecksumMismatch));
    assert_eq!(err.to_string(), "CHECKSUM_MISMATCH");
}

#[test]
fn missing_checksum_is_a_mismatch_too() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("checkpoints");
    let store = CheckpointStore::new(&root).unwrap();

    let mut data = sample_checkpoint();
    store.save(&mut data).unwrap();

    let file = root.join(&data.run_id).join("checkpoint.json");
    let mut value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
    value["checksum"] = serde_json::Value::String(String::new());
    std::fs::write(&file, value.to_string()).unwrap();

    assert!(matches!(
        store.load(&data.run_id).unwrap_err(),
        CheckpointError::ChecksumMismatch
    ));
}

#[test]
fn invalid_run_ids_are_rejected_before_touching_disk() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoints")).unwrap();

    for bad in [
        "not-a-uuid",
        "01234567-89AB-cdef-0123-456789abcdef", // uppercase
        "../../etc/01234567-89ab-cdef-0123-456789abcdef",
        "",
    ] {
        assert!(
            matches!(store.load(bad).unwrap_err(), CheckpointError::InvalidRunId(_)),
            "expected rejection for {:?}",
            bad
        );
        assert!(!is_valid_run_id(bad));
    }
}

#[test]
fn metadata_summarises_progress_and_status() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoints")).unwrap();

    let mut data = sample_checkpoint();
    data.stages.push(stage("report", StageStatus::Error));
    store.save(&mut data).unwrap();

    let metadata = store.metadata(&data.run_id).unwrap();
    assert_eq!(metadata.run_id, data.run_id);
    assert_eq!(metadata.total_stages, 3);
    assert_eq!(metadata.completed_stages, 1);
    assert_eq!(metadata.status, RunStatus::Failed);
    assert!(metadata.resumable);
}

#[test]
fn checksum_is_insensitive_to_updated_at_only() {
    let data = sample_checkpoint();
    let baseline = compute_checksum(&data).unwrap();

    let mut touched = data.clone();
    touched.updated_at = touched.updated_at + chrono::Duration::hours(5);
    assert_eq!(compute_checksum(&touched).unwrap(), baseline);

    let mut altered = data.clone();
    altered.previous_outputs.push("extra".to_string());
    assert_ne!(compute_checksum(&altered).unwrap(), baseline);

    let mut reindexed = data;
    reindexed.last_completed_stage_index = -1;
    assert_ne!(compute_checksum(&reindexed).unwrap(), baseline);
}

#[test]
fn list_delete_and_cleanup() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoints")).unwrap();

    let mut first = sample_checkpoint();
    let mut second = sample_checkpoint();
    store.save(&mut first).unwrap();
    store.save(&mut second).unwrap();

    let mut listed = store.list().unwrap();
    listed.sort();
    let mut expected = vec![first.run_id.clone(), second.run_id.clone()];
    expected.sort();
    assert_eq!(listed, expected);

    store.delete(&first.run_id).unwrap();
    assert!(matches!(
        store.load(&first.run_id).unwrap_err(),
        CheckpointError::NotFound(_)
    ));

    // Nothing is older than 30 days, so cleanup removes nothing.
    assert_eq!(store.cleanup(30).unwrap(), 0);
    // A negative cutoff is in the future, so everything is stale.
    assert_eq!(store.cleanup(-1).unwrap(), 1);
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn wire_format_uses_camel_case_field_names() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("checkpoints");
    let store = CheckpointStore::new(&root).unwrap();

    let mut data = sample_checkpoint();
    store.save(&mut data).unwrap();

    let raw =
        std::fs::read_to_string(root.join(&data.run_id).join("checkpoint.json")).unwrap();
    for field in [
        "\"schemaVersion\"",
        "\"checksum\"",
        "\"runId\"",
        "\"agent\"",
        "\"task\"",
        "\"mode\"",
        "\"stages\"",
        "\"lastCompletedStageIndex\"",
        "\"previousOutputs\"",
        "\"sharedData\"",
        "\"createdAt\"",
        "\"updatedAt\"",
    ] {
        assert!(raw.contains(field), "missing field {}", field);
    }
}
