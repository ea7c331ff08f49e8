//! Integration test: crash recovery and persistence semantics.
//!
//! Validates that:
//! - Uncommitted batches are lost on restart
//! - Committed versions survive engine drop + reopen, tombstones included
//! - A crash between segment write and manifest publish leaves the prior
//!   version authoritative, and its leftovers are cleaned on open
//! - Corrupt current state is reported as an integrity error, never served

use std::fs;
use std::path::Path;

use cgdb::storage::manifest::{CURRENT_FILE, MANIFESTS_DIR};
use cgdb::storage::store::SEGMENTS_DIR;
use cgdb::{id_from_semantic, EdgeRecord, EngineConfig, GraphEngine, GraphError, GraphReader, NodeQuery, NodeRecord};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config() -> EngineConfig {
    EngineConfig::relaxed()
}

fn node(sem: &str, partition: &str) -> NodeRecord {
    NodeRecord::new(sem, "FUNCTION", sem, partition)
}

fn commit(engine: &GraphEngine, partition: &str, names: &[&str], edges: &[(&str, &str)]) {
    let mut batch = engine.begin_batch().unwrap();
    for n in names {
        batch.add_node(node(n, partition)).unwrap();
    }
    for (src, dst) in edges {
        batch
            .add_edge(EdgeRecord::new(id_from_semantic(src), id_from_semantic(dst), "CALLS", partition))
            .unwrap();
    }
    batch.commit(&[partition], &[]).unwrap();
}

fn segment_files(db: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(db.join(SEGMENTS_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Tests: Batch Volatility
// ---------------------------------------------------------------------------

#[test]
fn uncommitted_batch_lost_on_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph.cgdb");

    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        commit(&engine, "a.js", &["kept"], &[]);
        let mut batch = engine.begin_batch().unwrap();
        batch.add_node(node("lost", "b.js")).unwrap();
        // Drop without commit
    }

    let engine = GraphEngine::open(&db, config()).unwrap();
    assert!(engine.get_node(id_from_semantic("kept")).is_some());
    assert!(engine.get_node(id_from_semantic("lost")).is_none());
    assert!(!engine.batch_open());
}

// ---------------------------------------------------------------------------
// Tests: Committed Data Survives
// ---------------------------------------------------------------------------

#[test]
fn replacements_and_tombstones_survive_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph.cgdb");

    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        commit(&engine, "a.js", &["a1", "a2"], &[("a1", "a2")]);
        commit(&engine, "b.js", &["b1"], &[("b1", "a2")]);
        // a2 disappears; b1 -> a2 goes with it
        commit(&engine, "a.js", &["a1"], &[]);
        engine.tag_snapshot("after-edit").unwrap();
    }

    let engine = GraphEngine::open(&db, config()).unwrap();
    assert_eq!(engine.node_count(), 2);
    assert_eq!(engine.edge_count(), 0);
    assert!(engine.get_node(id_from_semantic("a2")).is_none());
    assert!(engine.incoming_edges(id_from_semantic("a2")).is_empty());
    assert_eq!(engine.find_snapshot("after-edit"), Some(4));

    // Older versions are still readable after restart
    let v3 = engine.snapshot_at(3).unwrap();
    assert_eq!(v3.node_count(), 3);
    assert_eq!(v3.incoming_edges(id_from_semantic("a2")).len(), 2);
}

#[test]
fn reopen_continues_the_version_chain() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph.cgdb");
    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        commit(&engine, "a.js", &["a"], &[]);
    }
    {
        let engine = GraphEngine::open(&db, config()).unwrap();
        commit(&engine, "b.js", &["b"], &[]);
        assert_eq!(engine.version(), 3);
    }
    let engine = GraphEngine::open(&db, config()).unwrap();
    let versions: Vec<u64> = engine.list_snapshots(false).iter().map(|s| s.version).collect();
    assert_eq!(versions, vec![3, 2, 1]);
    assert_eq!(engine.query_nodes(&NodeQuery::new()).len(), 2);
}

// ---------------------------------------------------------------------------
// Tests: Interrupted Commits
// ---------------------------------------------------------------------------

#[test]
fn crash_before_publish_keeps_prior_version() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph.cgdb");
    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        commit(&engine, "a.js", &["a"], &[]);
    }
    let before = segment_files(&db);

    // Segments of a commit that never published, plus a half-written file.
    fs::write(db.join(SEGMENTS_DIR).join("seg_000009_nodes.seg"), b"whatever").unwrap();
    fs::write(db.join(SEGMENTS_DIR).join("seg_000010_edges.seg.tmp"), b"partial").unwrap();
    // Manifest renamed into place but the pointer never moved.
    fs::write(db.join(MANIFESTS_DIR).join("manifest_00000003.json"), b"{ not even json").unwrap();

    let engine = GraphEngine::open(&db, config()).unwrap();
    assert_eq!(engine.version(), 2);
    assert_eq!(segment_files(&db), before);

    // The next commit takes version 3 over the stale file.
    commit(&engine, "b.js", &["b"], &[]);
    assert_eq!(engine.version(), 3);
    drop(engine);
    let engine = GraphEngine::open(&db, config()).unwrap();
    assert_eq!(engine.node_count(), 2);
}

// ---------------------------------------------------------------------------
// Tests: Corruption
// ---------------------------------------------------------------------------

#[test]
fn truncated_segment_is_an_integrity_error() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph.cgdb");
    {
        let engine = GraphEngine::create(&db, config()).unwrap();
        commit(&engine, "a.js", &["a", "b", "c"], &[]);
    }
    let seg = db.join(SEGMENTS_DIR).join(&segment_files(&db)[0]);
    let bytes = fs::read(&seg).unwrap();
    fs::write(&seg, &bytes[..bytes.len() / 2]).unwrap();

    let err = GraphEngine::open(&db, config()).unwrap_err();
    assert!(matches!(err, GraphError::Integrity(_)), "got {:?}", err);
}

#[test]
fn corrupt_pointer_is_an_integrity_error() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("graph.cgdb");
    GraphEngine::create(&db, config()).unwrap();
    fs::write(db.join(CURRENT_FILE), b"\x00garbage").unwrap();

    let err = GraphEngine::open(&db, config()).unwrap_err();
    assert!(matches!(err, GraphError::Integrity(_)), "got {:?}", err);
}

#[test]
fn open_missing_database_is_not_found() {
    let dir = TempDir::new().unwrap();
    let err = GraphEngine::open(dir.path().join("nothing"), config()).unwrap_err();
    assert!(matches!(err, GraphError::NotFound(_)));

    let engine = GraphEngine::open_or_create(dir.path().join("fresh"), config()).unwrap();
    assert_eq!(engine.version(), 1);
}
