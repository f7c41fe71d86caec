//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use nft_engine::{
    ChainSpec, EngineConfig, ExprSpec, Family, Net, NetBuilder, Registry, RuleSpec, SetFlags, TableFlags,
};
use std::sync::Arc;

pub const FAMILY: Family = Family::Inet;
pub const TABLE: &str = "filter";

/// Config with the periodic GC scanner off, so tests drive collection.
pub fn config() -> EngineConfig {
    EngineConfig {
        gc_worker: false,
        ..Default::default()
    }
}

pub fn builder() -> NetBuilder {
    NetBuilder::new(Arc::new(Registry::with_builtins())).config(config())
}

pub fn net() -> Arc<Net> {
    builder().build().unwrap()
}

/// A namespace holding one empty table, already committed.
pub fn net_with_table() -> Arc<Net> {
    let net = net();
    let mut batch = net.begin_transaction(0).unwrap();
    batch.new_table(FAMILY, TABLE, TableFlags::empty(), false).unwrap();
    batch.commit().unwrap();
    net
}

pub fn verdict(code: &str) -> ExprSpec {
    ExprSpec::new("immediate").arg("verdict", code)
}

pub fn jump(code: &str, chain: &str) -> ExprSpec {
    ExprSpec::new("immediate").arg("verdict", code).arg("chain", chain)
}

pub fn counter() -> ExprSpec {
    ExprSpec::new("counter")
}

pub fn lookup(set: &str) -> ExprSpec {
    ExprSpec::new("lookup").arg("set", set)
}

pub fn rule(exprs: Vec<ExprSpec>) -> RuleSpec {
    RuleSpec::new(exprs)
}

/// Adds a regular chain in its own committed batch.
pub fn add_chain(net: &Net, name: &str) -> u64 {
    let mut batch = net.begin_transaction(0).unwrap();
    let handle = batch.new_chain(FAMILY, TABLE, &ChainSpec::regular(name), false).unwrap();
    batch.commit().unwrap();
    handle
}

/// Handles of the rules of a chain in the current generation.
pub fn rule_handles(net: &Net, chain: &str) -> Vec<u64> {
    net.chain_rules(FAMILY, TABLE, chain)
        .unwrap()
        .iter()
        .map(|r| r.handle)
        .collect()
}

/// Checks that every table's use count equals the number of chains,
/// named sets, objects and flowtables it holds.
pub fn assert_use_invariant(net: &Net) {
    for table in net.dump().tables {
        let named_sets = table
            .sets
            .iter()
            .filter(|s| !s.flags.contains(SetFlags::ANONYMOUS))
            .count();
        let expected = table.chains.len() + named_sets + table.objects.len() + table.flowtables.len();
        assert_eq!(
            table.use_count as usize, expected,
            "use count of table {} does not match its contents",
            table.name
        );
    }
}
