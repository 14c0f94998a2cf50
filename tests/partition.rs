use std::sync::Mutex;

use eyre::{eyre, Result};
use hemofit::prelude::*;
use rusqlite::types::Value;

/// Copies the rows of its ids and remembers which ids each call received
struct CopyJob {
    seen: Mutex<Vec<Vec<i64>>>,
    fail_on: Option<i64>,
}

impl CopyJob {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    fn seen(&self) -> Vec<Vec<i64>> {
        self.seen.lock().unwrap().clone()
    }
}

impl Job for CopyJob {
    fn name(&self) -> &str {
        "copy"
    }

    fn source_table(&self) -> &str {
        "src"
    }

    fn id_column(&self) -> &str {
        "id"
    }

    fn output_table(&self) -> &str {
        "dst"
    }

    fn run(&self, source: &Store, sink: &Store, ids: &[Value]) -> Result<usize> {
        let ids: Vec<i64> = ids
            .iter()
            .map(|id| match id {
                Value::Integer(i) => *i,
                other => panic!("unexpected id {:?}", other),
            })
            .collect();
        self.seen.lock().unwrap().push(ids.clone());
        if let Some(bad) = self.fail_on {
            if ids.contains(&bad) {
                return Err(eyre!("cannot process {}", bad));
            }
        }
        let (Some(first), Some(last)) = (ids.first(), ids.last()) else {
            return Ok(0);
        };
        let rows = source.select(
            Query::new("SELECT id, value FROM src WHERE id BETWEEN ?1 AND ?2 ORDER BY id")
                .bind(*first)
                .bind(*last),
        )?;
        Ok(sink.write("dst", &rows, WriteMode::Append)?)
    }
}

/// 100 subjects with two rows each
fn seeded(dir: &tempfile::TempDir) -> Store {
    let store = Store::new(dir.path().join("part.db"), RetryPolicy::bounded(5, std::time::Duration::from_secs(1)));
    let rows: Vec<Row> = (0..100i64)
        .flat_map(|id| {
            (0..2).map(move |k| Row::new().with("id", id).with("value", (id * 10 + k) as f64))
        })
        .collect();
    store.write("src", &rows, WriteMode::Append).unwrap();
    store
}

fn count(store: &Store) -> i64 {
    match store.fetch_one(Query::new("SELECT count(*) FROM dst")).unwrap() {
        Some(Value::Integer(n)) => n,
        other => panic!("unexpected count {:?}", other),
    }
}

#[test]
fn test_nodes_cover_ids_without_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(&dir);
    let job = CopyJob::new();

    let mut written = 0;
    for node in 0..4 {
        let coordinator = Coordinator::new(store.clone(), Partition::Node { node, total: 4 });
        written += coordinator.run(&job, WriteMode::Append).unwrap();
    }

    let seen = job.seen();
    assert_eq!(seen.len(), 4);
    let mut next = 0;
    for slice in &seen {
        assert_eq!(slice.len(), 25);
        assert_eq!(slice[0], next);
        assert!(slice.windows(2).all(|w| w[1] == w[0] + 1));
        next = slice[slice.len() - 1] + 1;
    }
    assert_eq!(next, 100);

    // Same row count as a single unpartitioned run
    assert_eq!(written, 200);
    assert_eq!(count(&store), 200);

    let dir = tempfile::tempdir().unwrap();
    let single = seeded(&dir);
    Coordinator::new(single.clone(), Partition::default())
        .run(&CopyJob::new(), WriteMode::Append)
        .unwrap();
    assert_eq!(count(&single), count(&store));
}

#[test]
fn test_pool_merges_every_worker() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(&dir);
    let job = CopyJob::new();
    let partition = Partition::Jobs {
        start: 0,
        total: 3,
        workers: 3,
    };

    let written = Coordinator::new(store.clone(), partition)
        .run(&job, WriteMode::Append)
        .unwrap();
    assert_eq!(written, 200);
    assert_eq!(count(&store), 200);

    let mut sizes: Vec<usize> = job.seen().iter().map(|s| s.len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![32, 34, 34]);

    // No shard is left behind
    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("part.db."))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_failed_worker_prevents_merge() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(&dir);
    let mut job = CopyJob::new();
    job.fail_on = Some(80);
    let coordinator = Coordinator::new(
        store.clone(),
        Partition::Jobs {
            start: 0,
            total: 2,
            workers: 2,
        },
    );

    assert!(coordinator.run(&job, WriteMode::Append).is_err());
    assert!(!store.table_exists("dst").unwrap());

    job.fail_on = None;
    coordinator.run(&job, WriteMode::Append).unwrap();
    assert_eq!(count(&store), 200);
}

#[test]
fn test_replace_mode_clears_previous_output() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(&dir);
    let coordinator = Coordinator::new(store.clone(), Partition::default());

    coordinator.run(&CopyJob::new(), WriteMode::Append).unwrap();
    coordinator.run(&CopyJob::new(), WriteMode::Append).unwrap();
    assert_eq!(count(&store), 400);

    coordinator.run(&CopyJob::new(), WriteMode::Replace).unwrap();
    assert_eq!(count(&store), 200);
}

#[test]
fn test_replace_mode_keeps_peer_results() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(&dir);
    let job = CopyJob::new();

    for _ in 0..2 {
        for node in 0..2 {
            Coordinator::new(store.clone(), Partition::Node { node, total: 2 })
                .run(&job, WriteMode::Replace)
                .unwrap();
        }
        assert_eq!(count(&store), 200);
    }

    // Rerunning one node only replaces its own id range
    Coordinator::new(store.clone(), Partition::Node { node: 1, total: 2 })
        .run(&job, WriteMode::Replace)
        .unwrap();
    assert_eq!(count(&store), 200);
    let low = store
        .fetch_one(Query::new("SELECT count(*) FROM dst WHERE id < 50"))
        .unwrap();
    assert_eq!(low, Some(Value::Integer(100)));
}

#[test]
fn test_missing_source_table_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("empty.db"), RetryPolicy::default());
    let job = CopyJob::new();
    assert!(Coordinator::new(store, Partition::default())
        .run(&job, WriteMode::Append)
        .is_err());
    assert!(job.seen().is_empty());
}
