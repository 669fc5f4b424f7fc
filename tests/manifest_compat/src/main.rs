fn main() {
    println!("Run `cargo test -p manifest-compat` to execute manifest compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use haul_engine::{EngineConfig, JobSnapshot, SubmitRequest};
    use haul_protocol::{ChunkStatus, ErrorClass, JobStatus, Manifest, TransferEvent};
    use haul_state::{FileStateStore, StateStore};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON numbers so that `2` and `2.0` compare equal.
    ///
    /// `f64` fields such as the retry multiplier always serialize with a
    /// fractional part, while hand-written records often omit it.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON
    /// values (order-independent, number-normalized).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  now:     {reserialized}"
        );
        parsed
    }

    // --- Persisted manifests ---

    #[test]
    fn fixture_manifest_upload() {
        let m: Manifest = roundtrip_test("manifest_upload.json");
        assert_eq!(m.version, 12);
        assert_eq!(m.job.status, JobStatus::InProgress);
        assert_eq!(m.job.bandwidth_cap, Some(1 << 20));
        assert!(m.job.session_id.is_some());
        assert_eq!(m.chunks[1].status, ChunkStatus::InFlight);
        assert_eq!(m.chunks[1].last_error, Some(ErrorClass::Transient));
        assert_eq!(m.bytes_completed(), 10);
    }

    #[test]
    fn fixture_manifest_failed() {
        let m: Manifest = roundtrip_test("manifest_failed.json");
        assert_eq!(m.job.status, JobStatus::Failed);
        assert_eq!(m.failed_range(), Some((1, 2)));
        let failure = m.job.failure.as_ref().unwrap();
        assert_eq!(failure.class, ErrorClass::Permanent);
        assert_eq!(failure.chunk_index, Some(1));
        assert!(m.job.expected_digest.as_deref().unwrap().ends_with("-4"));
    }

    #[test]
    fn manifest_chunks_tile_the_object() {
        for name in ["manifest_upload.json", "manifest_failed.json"] {
            let m: Manifest = serde_json::from_value(load_fixture(name)).unwrap();
            haul_transfer::coverage_check(&m.chunks, m.job.total_size)
                .unwrap_or_else(|e| panic!("{name}: {e}"));
        }
    }

    // --- Reading records through the state store ---

    #[test]
    fn state_store_reads_stored_record_and_requeues_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let fixture: Manifest = serde_json::from_value(load_fixture("manifest_upload.json")).unwrap();
        fs::copy(
            fixtures_dir().join("manifest_upload.json"),
            dir.path().join(format!("{}.json", fixture.job.id)),
        )
        .unwrap();

        let store = FileStateStore::open(dir.path()).unwrap();
        assert_eq!(store.list_jobs().unwrap(), vec![fixture.job.id.clone()]);

        let loaded = store.snapshot(&fixture.job.id).unwrap();
        assert_eq!(loaded.job, fixture.job);
        assert_eq!(loaded.chunks[0], fixture.chunks[0]);
        assert_eq!(loaded.chunks[1].status, ChunkStatus::Pending);
        assert_eq!(loaded.chunks[1].attempts, 2);
        assert_eq!(loaded.chunks[2], fixture.chunks[2]);
    }

    #[test]
    fn state_store_keeps_failed_record_intact() {
        let dir = tempfile::tempdir().unwrap();
        let fixture: Manifest = serde_json::from_value(load_fixture("manifest_failed.json")).unwrap();
        fs::copy(
            fixtures_dir().join("manifest_failed.json"),
            dir.path().join(format!("{}.json", fixture.job.id)),
        )
        .unwrap();

        let store = FileStateStore::open(dir.path()).unwrap();
        assert_eq!(store.snapshot(&fixture.job.id).unwrap(), fixture);
    }

    // --- Engine surface ---

    #[test]
    fn fixture_job_snapshot_matches_manifest() {
        let expected: JobSnapshot = roundtrip_test("job_snapshot_failed.json");
        let m: Manifest = serde_json::from_value(load_fixture("manifest_failed.json")).unwrap();
        assert_eq!(JobSnapshot::from(&m), expected);
    }

    #[test]
    fn fixture_transfer_events() {
        let events: Vec<TransferEvent> = roundtrip_test("transfer_events.json");
        assert_eq!(events.len(), 5);
        assert!(!events[0].is_terminal());
        assert!(!events[1].is_terminal());
        assert!(events[2..].iter().all(TransferEvent::is_terminal));
        match &events[0] {
            TransferEvent::Progress(p) => assert!((p.percentage() - 100.0 / 3.0).abs() < 1e-9),
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn fixture_submit_request() {
        let req: SubmitRequest = roundtrip_test("submit_request.json");
        assert_eq!(req.size_hint, Some(100));
        assert_eq!(req.options.parallelism, Some(4));
    }

    #[test]
    fn fixture_engine_config_is_the_default() {
        let config: EngineConfig = roundtrip_test("engine_config.json");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn empty_engine_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
