//! Failure paths of local persistence: retried flushes, parked commits and a drain that
//! cannot finish.
//!
//! Run with: cargo test -p sluice --test durability

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;

use common::{Harness, row, ts, wait_for};
use sluice::persist::LocalSinkStore;
use sluice::{PlumberError, PlumberState, RejectionPolicy};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_failed_flush_is_retried_and_commit_waits_for_it() {
    let harness = Harness::new("2013-01-01T00:30:00Z");
    let plumber = harness.plumber();
    plumber.start_job().await.unwrap();
    harness.block_writes();

    for i in 0..3 {
        plumber
            .add(&row(&format!("2013-01-01T00:00:{i:02}Z"), "a"))
            .unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    plumber
        .persist(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    // the explicit persist and at least one scheduled retry both failed
    assert!(wait_for(WAIT, || harness.metrics.snapshot().persist_failures >= 2).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.metrics.snapshot().rows_persisted, 0);

    harness.unblock_writes();
    assert!(wait_for(WAIT, || calls.load(Ordering::SeqCst) == 1).await);
    assert_eq!(harness.metrics.snapshot().rows_persisted, 3);

    plumber.finish_job().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let recovered = LocalSinkStore::new(harness.dir.path(), "test")
        .recover()
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);
    let rows: usize = recovered[0].chunks.iter().map(|(_, rows)| rows.len()).sum();
    assert_eq!(rows, 3);
}

#[tokio::test]
async fn test_finish_fails_when_final_flush_fails() {
    let harness = Harness::new("2013-01-01T00:30:00Z");
    let config = harness.config().with_persist_period(Duration::from_secs(3600));
    let plumber = harness.plumber_with(config, RejectionPolicy::Noop);
    plumber.start_job().await.unwrap();
    harness.block_writes();

    plumber.add(&row("2013-01-01T00:10:00Z", "a")).unwrap();

    let err = plumber.finish_job().await.unwrap_err();
    assert!(matches!(
        err,
        PlumberError::FlushIncomplete {
            unpersisted: 1,
            buffered_rows: 0
        }
    ));
    assert_eq!(plumber.state(), PlumberState::Stopped);
    assert_eq!(harness.metrics.snapshot().persist_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finish_times_out_when_drain_stalls() {
    let harness = Harness::new("2013-01-01T00:30:00Z");
    let config = harness
        .config()
        .with_persist_period(Duration::from_secs(3600))
        .with_finish_timeout(Duration::from_millis(50));
    let plumber = harness.plumber_with(config, RejectionPolicy::Noop);
    plumber.start_job().await.unwrap();
    plumber.add(&row("2013-01-01T00:10:00Z", "a")).unwrap();

    // a slow commit callback holds the persist worker past the deadline
    plumber
        .persist(|| std::thread::sleep(Duration::from_millis(500)))
        .unwrap();

    let err = plumber.finish_job().await.unwrap_err();
    assert!(matches!(err, PlumberError::DrainTimeout { .. }));
    assert_eq!(plumber.state(), PlumberState::Stopped);
}

#[tokio::test]
async fn test_finish_reports_rows_added_after_the_final_swap() {
    let harness = Harness::new("2013-01-01T00:30:00Z");
    let config = harness.config().with_persist_period(Duration::from_secs(3600));
    let plumber = harness.plumber_with(config, RejectionPolicy::Noop);
    plumber.start_job().await.unwrap();
    harness.block_writes();

    plumber.add(&row("2013-01-01T00:00:00Z", "a")).unwrap();
    let sink = plumber
        .get_sink(ts("2013-01-01T00:00:00Z"))
        .unwrap()
        .unwrap();
    let late = row("2013-01-01T00:00:01Z", "b");

    // parked until the first chunk lands, which only happens inside the final flush
    plumber
        .persist(move || {
            sink.add(&late).unwrap();
        })
        .unwrap();
    assert!(wait_for(WAIT, || harness.metrics.snapshot().persist_failures == 1).await);
    harness.unblock_writes();

    let err = plumber.finish_job().await.unwrap_err();
    assert!(matches!(
        err,
        PlumberError::FlushIncomplete {
            unpersisted: 0,
            buffered_rows: 1
        }
    ));
}

#[tokio::test]
async fn test_panicking_commit_callback_does_not_stop_persistence() {
    let harness = Harness::new("2013-01-01T00:30:00Z");
    let plumber = harness.plumber();
    plumber.start_job().await.unwrap();

    plumber.persist(|| panic!("commit hook failed")).unwrap();

    let (tx, rx) = oneshot::channel();
    plumber
        .persist(move || {
            let _ = tx.send(());
        })
        .unwrap();
    tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();

    plumber.add(&row("2013-01-01T00:10:00Z", "a")).unwrap();
    plumber.finish_job().await.unwrap();
    assert_eq!(harness.metrics.snapshot().rows_persisted, 1);
}
