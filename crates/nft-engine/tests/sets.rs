//! Set staging: backend choice, duplicates, size limits and intervals.

mod common;

use common::*;
use nft_common::HasUse;
use nft_engine::{
    AbortAction, ChainSpec, ElemSpec, ErrorKind, ObjectSpec, Packet, SetFlags, SetPolicy, SetSpec, Verdict,
};
use pretty_assertions::assert_eq;

fn keys(net: &nft_engine::Net, set: &str) -> Vec<Vec<u8>> {
    let mut keys: Vec<_> = net
        .set_elements(FAMILY, TABLE, set)
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect();
    keys.sort();
    keys
}

fn create_set(net: &nft_engine::Net, spec: SetSpec) -> String {
    let mut batch = net.begin_transaction(0).unwrap();
    let name = batch.new_set(FAMILY, TABLE, &spec, false).unwrap();
    batch.commit().unwrap();
    name
}

#[test]
fn test_backend_selection() {
    let net = net_with_table();
    let mut batch = net.begin_transaction(0).unwrap();
    batch.new_set(FAMILY, TABLE, &SetSpec::new("ports", 2), false).unwrap();
    batch.new_set(FAMILY, TABLE, &SetSpec::new("addrs", 4), false).unwrap();
    batch
        .new_set(FAMILY, TABLE, &SetSpec::new("ranges", 4).flags(SetFlags::INTERVAL), false)
        .unwrap();
    batch.new_set(FAMILY, TABLE, &SetSpec::new("marks", 2).map(1, 4), false).unwrap();
    batch
        .new_set(
            FAMILY,
            TABLE,
            &SetSpec::new("small", 1).policy(SetPolicy::Memory),
            false,
        )
        .unwrap();
    batch.commit().unwrap();

    let backend = |name: &str| net.set(FAMILY, TABLE, name).unwrap().backend_name().to_string();
    assert_eq!(backend("ports"), "bitmap");
    assert_eq!(backend("addrs"), "hash");
    assert_eq!(backend("ranges"), "rbtree");
    assert_eq!(backend("marks"), "hash");
    assert_eq!(backend("small"), "bitmap");
}

#[test]
fn test_bad_set_declarations() {
    let net = net_with_table();
    let mut batch = net.begin_transaction(0).unwrap();
    let unknown = SetSpec::new("s", 4).flags(SetFlags::from_bits_retain(0x1000));
    assert_eq!(
        batch.new_set(FAMILY, TABLE, &unknown, false).unwrap_err().kind(),
        ErrorKind::Unsupported
    );
    let both = SetSpec::new("s", 4).map(1, 4).flags(SetFlags::MAP | SetFlags::OBJECT);
    assert_eq!(
        batch.new_set(FAMILY, TABLE, &both, false).unwrap_err().kind(),
        ErrorKind::Unsupported
    );
    assert_eq!(
        batch.new_set(FAMILY, TABLE, &SetSpec::new("s", 0), false).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        batch.new_set(FAMILY, "nope", &SetSpec::new("s", 4), false).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(batch.is_empty());
}

#[test]
fn test_existing_set() {
    let net = net_with_table();
    create_set(&net, SetSpec::new("s", 4));
    let mut batch = net.begin_transaction(0).unwrap();
    assert_eq!(batch.new_set(FAMILY, TABLE, &SetSpec::new("s", 4), false).unwrap(), "s");
    assert!(batch.is_empty());
    let err = batch.new_set(FAMILY, TABLE, &SetSpec::new("s", 4), true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn test_duplicate_insert() {
    let net = net_with_table();
    create_set(&net, SetSpec::new("s", 4));

    let mut batch = net.begin_transaction(0).unwrap();
    batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 2, 3, 4])], false)
        .unwrap();
    // same batch, same payload
    batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 2, 3, 4])], false)
        .unwrap();
    assert_eq!(batch.len(), 1);
    batch.commit().unwrap();
    let set = net.set(FAMILY, TABLE, "s").unwrap();
    assert_eq!(set.nelems(), 1);

    let mut batch = net.begin_transaction(0).unwrap();
    batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 2, 3, 4])], false)
        .unwrap();
    assert!(batch.is_empty());
    let err = batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 2, 3, 4])], true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    batch.commit().unwrap();

    assert_eq!(set.nelems(), 1);
    assert_eq!(keys(&net, "s"), vec![vec![1, 2, 3, 4]]);
}

#[test]
fn test_map_duplicate_with_other_data_is_busy() {
    let net = net_with_table();
    create_set(&net, SetSpec::new("m", 4).map(1, 2));

    let mut batch = net.begin_transaction(0).unwrap();
    batch
        .new_setelems(FAMILY, TABLE, "m", &[ElemSpec::key([1, 1, 1, 1]).data([0, 1])], false)
        .unwrap();
    batch
        .new_setelems(FAMILY, TABLE, "m", &[ElemSpec::key([1, 1, 1, 1]).data([0, 1])], false)
        .unwrap();
    let err = batch
        .new_setelems(FAMILY, TABLE, "m", &[ElemSpec::key([1, 1, 1, 1]).data([0, 2])], false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    let err = batch
        .new_setelems(FAMILY, TABLE, "m", &[ElemSpec::key([2, 2, 2, 2])], false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    batch.commit().unwrap();

    let elems = net.set_elements(FAMILY, TABLE, "m").unwrap();
    assert_eq!(elems.len(), 1);
    assert_eq!(elems[0].data, Some(vec![0, 1]));
}

#[test]
fn test_size_limit() {
    let net = net_with_table();
    create_set(&net, SetSpec::new("s", 4).size(2));

    let mut batch = net.begin_transaction(0).unwrap();
    batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([0, 0, 0, 1]), ElemSpec::key([0, 0, 0, 2])], false)
        .unwrap();
    let err = batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([0, 0, 0, 3])], false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    batch.commit().unwrap();
    assert_eq!(keys(&net, "s"), vec![vec![0, 0, 0, 1], vec![0, 0, 0, 2]]);

    // a staged delete frees its slot for the same batch
    let mut batch = net.begin_transaction(0).unwrap();
    batch
        .del_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([0, 0, 0, 1])])
        .unwrap();
    batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([0, 0, 0, 3])], false)
        .unwrap();
    batch.commit().unwrap();
    net.barrier();

    let set = net.set(FAMILY, TABLE, "s").unwrap();
    assert_eq!(set.nelems(), 2);
    assert_eq!(keys(&net, "s"), vec![vec![0, 0, 0, 2], vec![0, 0, 0, 3]]);
}

#[test]
fn test_abort_restores_elements() {
    let net = net_with_table();
    create_set(&net, SetSpec::new("s", 4));
    let mut batch = net.begin_transaction(0).unwrap();
    batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 0, 0, 1])], false)
        .unwrap();
    batch.commit().unwrap();

    let mut batch = net.begin_transaction(0).unwrap();
    batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 0, 0, 2])], false)
        .unwrap();
    batch
        .del_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 0, 0, 1])])
        .unwrap();
    let err = batch
        .del_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 0, 0, 1])])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    batch.abort(AbortAction::None).unwrap();

    let set = net.set(FAMILY, TABLE, "s").unwrap();
    assert_eq!(set.nelems(), 1);
    assert_eq!(keys(&net, "s"), vec![vec![1, 0, 0, 1]]);

    // the deleted element is usable again after the abort
    let mut batch = net.begin_transaction(0).unwrap();
    batch
        .del_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 0, 0, 1])])
        .unwrap();
    batch.commit().unwrap();
    assert!(keys(&net, "s").is_empty());
    assert_eq!(set.nelems(), 0);
}

#[test]
fn test_flush_set() {
    let net = net_with_table();
    create_set(&net, SetSpec::new("s", 2));
    let mut batch = net.begin_transaction(0).unwrap();
    let elems: Vec<_> = (0..10u8).map(|i| ElemSpec::key([0, i])).collect();
    batch.new_setelems(FAMILY, TABLE, "s", &elems, false).unwrap();
    batch.commit().unwrap();
    assert_eq!(keys(&net, "s").len(), 10);

    let mut batch = net.begin_transaction(0).unwrap();
    batch.flush_set(FAMILY, TABLE, "s").unwrap();
    assert_eq!(batch.len(), 10);
    assert_eq!(keys(&net, "s").len(), 10);
    batch.commit().unwrap();
    assert!(keys(&net, "s").is_empty());
    assert_eq!(net.set(FAMILY, TABLE, "s").unwrap().nelems(), 0);
}

#[test]
fn test_interval_lookup() {
    let net = net_with_table();
    create_set(&net, SetSpec::new("nets", 4).flags(SetFlags::INTERVAL));
    add_chain(&net, "c");

    let mut batch = net.begin_transaction(0).unwrap();
    batch
        .new_setelems(
            FAMILY,
            TABLE,
            "nets",
            &[ElemSpec::key([10, 0, 0, 0]), ElemSpec::key([10, 0, 1, 0]).interval_end()],
            false,
        )
        .unwrap();
    batch
        .new_rule(FAMILY, TABLE, "c", &rule(vec![lookup("nets"), verdict("drop")]))
        .unwrap();
    batch.commit().unwrap();

    let set = net.set(FAMILY, TABLE, "nets").unwrap();
    assert_eq!(set.backend_name(), "rbtree");
    // interval ends do not count against the size
    assert_eq!(set.nelems(), 1);

    let chain = net.chain(FAMILY, TABLE, "c").unwrap();
    let eval = |addr: [u8; 4]| net.evaluate(&chain, &Packet::new(addr.to_vec()));
    assert_eq!(eval([10, 0, 0, 0]), Verdict::Drop);
    assert_eq!(eval([10, 0, 0, 200]), Verdict::Drop);
    assert_eq!(eval([10, 0, 1, 0]), Verdict::Continue);
    assert_eq!(eval([10, 0, 2, 1]), Verdict::Continue);
    assert_eq!(eval([9, 255, 255, 255]), Verdict::Continue);
}

#[test]
fn test_interval_end_on_plain_set() {
    let net = net_with_table();
    create_set(&net, SetSpec::new("s", 4));
    let mut batch = net.begin_transaction(0).unwrap();
    let err = batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 0, 0, 0]).interval_end()], false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = batch
        .new_setelems(FAMILY, TABLE, "s", &[ElemSpec::key([1, 0, 0])], false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_object_map_holds_object() {
    let net = net_with_table();
    let mut batch = net.begin_transaction(0).unwrap();
    batch.new_obj(FAMILY, TABLE, &ObjectSpec::new("counter", "web"), false).unwrap();
    let spec = SetSpec {
        obj_type: Some("counter".to_string()),
        ..SetSpec::new("by_port", 2).flags(SetFlags::OBJECT)
    };
    batch.new_set(FAMILY, TABLE, &spec, false).unwrap();
    batch
        .new_setelems(FAMILY, TABLE, "by_port", &[ElemSpec::key([0, 80]).obj("web")], false)
        .unwrap();
    let err = batch
        .new_setelems(FAMILY, TABLE, "by_port", &[ElemSpec::key([0, 81]).obj("missing")], false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    batch.commit().unwrap();

    let obj = net.object(FAMILY, TABLE, "counter", "web").unwrap();
    assert_eq!(obj.use_count().get(), 1);
    assert_eq!(net.set(FAMILY, TABLE, "by_port").unwrap().backend_name(), "hash");

    let mut batch = net.begin_transaction(0).unwrap();
    let err = batch.del_obj(FAMILY, TABLE, "counter", "web").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    batch
        .del_setelems(FAMILY, TABLE, "by_port", &[ElemSpec::key([0, 80])])
        .unwrap();
    batch.commit().unwrap();
    net.barrier();
    assert_eq!(obj.use_count().get(), 0);

    let mut batch = net.begin_transaction(0).unwrap();
    batch.del_obj(FAMILY, TABLE, "counter", "web").unwrap();
    batch.commit().unwrap();
    assert_use_invariant(&net);
}

#[test]
fn test_bound_set_cannot_be_deleted() {
    let net = net_with_table();
    create_set(&net, SetSpec::new("s", 4));
    let mut batch = net.begin_transaction(0).unwrap();
    batch.new_chain(FAMILY, TABLE, &ChainSpec::regular("c"), false).unwrap();
    batch.new_rule(FAMILY, TABLE, "c", &rule(vec![lookup("s")])).unwrap();
    batch.commit().unwrap();

    let set = net.set(FAMILY, TABLE, "s").unwrap();
    assert!(set.has_bindings());
    let mut batch = net.begin_transaction(0).unwrap();
    let err = batch.del_set(FAMILY, TABLE, "s").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    batch.flush_chain(FAMILY, TABLE, "c").unwrap();
    batch.del_set(FAMILY, TABLE, "s").unwrap();
    batch.commit().unwrap();
    net.barrier();

    assert!(net.set(FAMILY, TABLE, "s").is_err());
    assert!(set.is_dead());
    assert!(!set.has_bindings());
    assert_use_invariant(&net);
}
