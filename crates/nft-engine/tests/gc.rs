//! Expired element collection and its race with commits.

mod common;

use common::*;
use nft_engine::{AbortAction, ElemSpec, EngineConfig, GcOutcome, Net, SetFlags, SetSpec, TableFlags};
use pretty_assertions::assert_eq;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_millis(20);

/// Table with a timeout set "t" holding `n` elements, already expired.
fn expired_set(net: &Net, n: u8) {
    let mut batch = net.begin_transaction(0).unwrap();
    batch.new_table(FAMILY, TABLE, TableFlags::empty(), false).unwrap();
    let spec = SetSpec::new("t", 4).flags(SetFlags::TIMEOUT).timeout(TIMEOUT);
    batch.new_set(FAMILY, TABLE, &spec, false).unwrap();
    let elems: Vec<_> = (0..n).map(|i| ElemSpec::key([192, 168, 0, i])).collect();
    batch.new_setelems(FAMILY, TABLE, "t", &elems, false).unwrap();
    batch.commit().unwrap();
    thread::sleep(TIMEOUT * 3);
}

#[test]
fn test_collect_and_apply() {
    let net = net();
    expired_set(&net, 3);
    let set = net.set(FAMILY, TABLE, "t").unwrap();
    assert_eq!(set.nelems(), 3);
    // expired elements are already invisible to lookups and dumps
    assert!(net.set_elements(FAMILY, TABLE, "t").unwrap().is_empty());

    let batches = net.gc_collect(FAMILY, TABLE, "t").unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
    // claimed elements are not handed out twice
    assert!(net.gc_collect(FAMILY, TABLE, "t").unwrap().is_empty());

    for batch in batches {
        assert_eq!(net.gc_apply(batch), GcOutcome::Applied(3));
    }
    assert_eq!(set.nelems(), 0);
    assert_eq!(set.backend().len(), 0);
}

#[test]
fn test_batches_split_by_size() {
    let net = builder()
        .config(EngineConfig {
            gc_batch_size: 2,
            ..config()
        })
        .build()
        .unwrap();
    expired_set(&net, 5);
    let batches = net.gc_collect(FAMILY, TABLE, "t").unwrap();
    let sizes: Vec<_> = batches.iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    let removed: usize = batches
        .into_iter()
        .map(|b| match net.gc_apply(b) {
            GcOutcome::Applied(n) => n,
            GcOutcome::Discarded => 0,
        })
        .sum();
    assert_eq!(removed, 5);
}

#[test]
fn test_commit_between_collect_and_apply_discards() {
    let net = net();
    expired_set(&net, 2);
    let set = net.set(FAMILY, TABLE, "t").unwrap();

    let mut batches = net.gc_collect(FAMILY, TABLE, "t").unwrap();
    let stale = batches.remove(0);
    let seq = stale.seq();
    add_chain(&net, "unrelated");
    assert_eq!(net.gc_apply(stale), GcOutcome::Discarded);
    assert_eq!(set.nelems(), 2);

    // the claims were given back, a new scan sees the elements again
    let mut batches = net.gc_collect(FAMILY, TABLE, "t").unwrap();
    let fresh = batches.remove(0);
    assert_ne!(fresh.seq(), seq);
    assert_eq!(fresh.seq() % 2, 0);
    assert_eq!(net.gc_apply(fresh), GcOutcome::Applied(2));
    assert_eq!(set.nelems(), 0);
}

#[test]
fn test_set_deleted_before_apply() {
    let net = net();
    expired_set(&net, 2);
    let set = net.set(FAMILY, TABLE, "t").unwrap();
    let batches = net.gc_collect(FAMILY, TABLE, "t").unwrap();

    let mut batch = net.begin_transaction(0).unwrap();
    batch.del_set(FAMILY, TABLE, "t").unwrap();
    batch.commit().unwrap();
    net.barrier();
    assert!(set.is_dead());

    for batch in batches {
        assert_eq!(net.gc_apply(batch), GcOutcome::Discarded);
    }
    assert!(net.set(FAMILY, TABLE, "t").is_err());
}

#[test]
fn test_gc_sync_inside_batch() {
    let net = net();
    expired_set(&net, 4);
    let set = net.set(FAMILY, TABLE, "t").unwrap();

    let mut batch = net.begin_transaction(0).unwrap();
    assert_eq!(batch.gc_sync(FAMILY, TABLE, "t").unwrap(), 4);
    assert_eq!(batch.len(), 4);
    assert_eq!(set.nelems(), 4);
    batch.commit().unwrap();
    assert_eq!(set.nelems(), 0);
    assert_eq!(set.backend().len(), 0);
}

#[test]
fn test_gc_sync_abort_releases_claims() {
    let net = net();
    expired_set(&net, 2);

    let mut batch = net.begin_transaction(0).unwrap();
    assert_eq!(batch.gc_sync(FAMILY, TABLE, "t").unwrap(), 2);
    batch.abort(AbortAction::None).unwrap();

    let batches = net.gc_collect(FAMILY, TABLE, "t").unwrap();
    assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 2);
}

#[test]
fn test_aborted_delete_keeps_collector_claim() {
    let net = net();
    let mut batch = net.begin_transaction(0).unwrap();
    batch.new_table(FAMILY, TABLE, TableFlags::empty(), false).unwrap();
    let spec = SetSpec::new("t", 4).flags(SetFlags::TIMEOUT);
    batch.new_set(FAMILY, TABLE, &spec, false).unwrap();
    batch
        .new_setelems(
            FAMILY,
            TABLE,
            "t",
            &[
                ElemSpec::key([1, 1, 1, 1]).timeout(Duration::from_millis(100)),
                ElemSpec::key([2, 2, 2, 2]).timeout(Duration::from_secs(3600)),
            ],
            false,
        )
        .unwrap();
    batch.commit().unwrap();
    let set = net.set(FAMILY, TABLE, "t").unwrap();

    let mut batch = net.begin_transaction(0).unwrap();
    batch.del_setelems(FAMILY, TABLE, "t", &[ElemSpec::key([1, 1, 1, 1])]).unwrap();
    thread::sleep(Duration::from_millis(300));
    let first = net.gc_collect(FAMILY, TABLE, "t").unwrap();
    assert_eq!(first.iter().map(|b| b.len()).sum::<usize>(), 1);
    batch.abort(AbortAction::None).unwrap();

    // the abort must not hand the collector's claim out a second time
    let second = net.gc_collect(FAMILY, TABLE, "t").unwrap();
    assert!(second.is_empty());

    for batch in first {
        assert_eq!(net.gc_apply(batch), GcOutcome::Applied(1));
    }
    assert_eq!(set.nelems(), 1);
    assert_eq!(set.backend().len(), 1);
    let left: Vec<_> = net
        .set_elements(FAMILY, TABLE, "t")
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect();
    assert_eq!(left, vec![vec![2, 2, 2, 2]]);
}

#[test]
fn test_unexpired_elements_stay() {
    let net = net();
    let mut batch = net.begin_transaction(0).unwrap();
    batch.new_table(FAMILY, TABLE, TableFlags::empty(), false).unwrap();
    let spec = SetSpec::new("t", 4).flags(SetFlags::TIMEOUT);
    batch.new_set(FAMILY, TABLE, &spec, false).unwrap();
    batch
        .new_setelems(
            FAMILY,
            TABLE,
            "t",
            &[
                ElemSpec::key([1, 1, 1, 1]).timeout(TIMEOUT),
                ElemSpec::key([2, 2, 2, 2]).timeout(Duration::from_secs(3600)),
                ElemSpec::key([3, 3, 3, 3]),
            ],
            false,
        )
        .unwrap();
    batch.commit().unwrap();
    thread::sleep(TIMEOUT * 3);

    let batches = net.gc_collect(FAMILY, TABLE, "t").unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    for batch in batches {
        assert_eq!(net.gc_apply(batch), GcOutcome::Applied(1));
    }
    let mut left: Vec<_> = net
        .set_elements(FAMILY, TABLE, "t")
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect();
    left.sort();
    assert_eq!(left, vec![vec![2, 2, 2, 2], vec![3, 3, 3, 3]]);
}

#[test]
fn test_queue_reports_outcome() {
    let net = net();
    expired_set(&net, 3);
    let set = net.set(FAMILY, TABLE, "t").unwrap();
    for batch in net.gc_collect(FAMILY, TABLE, "t").unwrap() {
        let outcome = net.gc_queue(batch).recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, GcOutcome::Applied(3));
    }
    assert_eq!(set.nelems(), 0);
}

#[test]
fn test_periodic_worker_collects() {
    let net = builder()
        .config(EngineConfig {
            gc_worker: true,
            gc_interval_ms: 10,
            ..config()
        })
        .build()
        .unwrap();
    expired_set(&net, 3);
    let set = net.set(FAMILY, TABLE, "t").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while set.nelems() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(set.nelems(), 0);
}
