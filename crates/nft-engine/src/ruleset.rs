//! Declarative rulesets.
//!
//! A [`RulesetSpec`] describes tables and their contents as JSON. Loading
//! stages everything in one batch: objects first, then sets with their
//! elements, flowtables, every chain, and finally the rules, so jumps and
//! lookups always find their targets. A batch that misses an extension is
//! aborted with the autoload action and replayed.

use crate::batch::{AbortAction, Batch, RuleSpec};
use crate::chain::ChainSpec;
use crate::expr::ExprSpec;
use crate::flowtable::FlowtableSpec;
use crate::net::Net;
use crate::object::ObjectSpec;
use crate::set::{ElemSpec, SetSpec};
use crate::table::TableFlags;
use anyhow::Context;
use nft_common::{Family, NftError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Replays allowed for a batch that keeps missing extensions.
pub const MAX_REPLAYS: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesetSpec {
    /// Delete every existing table first
    pub flush: bool,
    pub tables: Vec<TableDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub family: Family,
    pub name: String,
    #[serde(default)]
    pub flags: TableFlags,
    #[serde(default)]
    pub chains: Vec<ChainDef>,
    #[serde(default)]
    pub sets: Vec<SetDef>,
    #[serde(default)]
    pub objects: Vec<ObjectSpec>,
    #[serde(default)]
    pub flowtables: Vec<FlowtableSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDef {
    #[serde(flatten)]
    pub chain: ChainSpec,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    pub exprs: Vec<ExprSpec>,
    #[serde(default)]
    pub udata: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetDef {
    #[serde(flatten)]
    pub set: SetSpec,
    #[serde(default)]
    pub elements: Vec<ElemSpec>,
}

impl RulesetSpec {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| NftError::invalid(format!("bad ruleset: {}", e)))
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn stage(&self, batch: &mut Batch<'_>) -> Result<()> {
        if self.flush {
            batch.flush_ruleset(None)?;
        }
        for table in &self.tables {
            batch.new_table(table.family, &table.name, table.flags, false)?;
        }
        for table in &self.tables {
            let (family, name) = (table.family, table.name.as_str());
            for obj in &table.objects {
                batch.new_obj(family, name, obj, false)?;
            }
            for set in &table.sets {
                let set_name = batch.new_set(family, name, &set.set, false)?;
                if !set.elements.is_empty() {
                    batch.new_setelems(family, name, set_name, &set.elements, false)?;
                }
            }
            for ft in &table.flowtables {
                batch.new_flowtable(family, name, ft, false)?;
            }
            for chain in &table.chains {
                batch.new_chain(family, name, &chain.chain, false)?;
            }
            for chain in &table.chains {
                for rule in &chain.rules {
                    let spec = RuleSpec {
                        exprs: rule.exprs.clone(),
                        udata: rule.udata.clone(),
                        ..Default::default()
                    };
                    batch.new_rule(family, name, &chain.chain.name, &spec)?;
                }
            }
        }
        Ok(())
    }

    /// Stages and commits the ruleset, replaying after module loads.
    /// Returns the new generation id.
    pub fn load(&self, net: &Net) -> Result<u32> {
        for attempt in 1..=MAX_REPLAYS {
            let mut batch = net.begin_transaction(0)?;
            match self.stage(&mut batch) {
                Ok(()) => return batch.commit(),
                Err(e) if e.kind().is_retryable() => {
                    tracing::info!(attempt, error = %e, "extension missing, replaying batch");
                    batch.abort(AbortAction::Autoload)?;
                }
                Err(e) => {
                    if let Err(abort_err) = batch.abort(AbortAction::None) {
                        tracing::error!(error = %abort_err, "abort of failed ruleset load");
                    }
                    return Err(e);
                }
            }
        }
        Err(NftError::exhausted(format!(
            "ruleset still missing extensions after {} replays",
            MAX_REPLAYS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::types::{ChainPolicy, Packet, Verdict};
    use crate::NetBuilder;
    use nft_common::HasUse;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::sync::Arc;

    const RULESET: &str = r#"{
        "tables": [{
            "family": "inet",
            "name": "filter",
            "sets": [{
                "name": "blocked",
                "key_len": 4,
                "elements": [{"key": [10, 0, 0, 1]}]
            }],
            "chains": [
                {
                    "name": "input",
                    "hook": {"type": "filter", "hook": "input", "priority": 0},
                    "policy": "accept",
                    "rules": [
                        {"exprs": [{"type": "immediate", "verdict": "jump", "chain": "deny"}]}
                    ]
                },
                {
                    "name": "deny",
                    "rules": [
                        {"exprs": [
                            {"type": "lookup", "set": "blocked"},
                            {"type": "immediate", "verdict": "drop"}
                        ]}
                    ]
                }
            ]
        }]
    }"#;

    #[test]
    fn test_parse_shape() {
        let spec = RulesetSpec::from_json(RULESET).unwrap();
        assert!(!spec.flush);
        let table = &spec.tables[0];
        assert_eq!(table.family, Family::Inet);
        assert_eq!(table.chains.len(), 2);
        assert_eq!(table.chains[0].chain.policy, Some(ChainPolicy::Accept));
        assert_eq!(table.sets[0].elements.len(), 1);
        assert!(RulesetSpec::from_json("{\"tables\": 1}").is_err());
    }

    #[test]
    fn test_load_and_evaluate() {
        let net = NetBuilder::new(Arc::new(Registry::with_builtins())).build().unwrap();
        let spec = RulesetSpec::from_json(RULESET).unwrap();
        let genid = spec.load(&net).unwrap();
        assert_eq!(genid, net.genid());

        let input = net.chain(Family::Inet, "filter", "input").unwrap();
        assert_eq!(net.evaluate(&input, &Packet::new(vec![10, 0, 0, 1])), Verdict::Drop);
        assert_eq!(net.evaluate(&input, &Packet::new(vec![10, 0, 0, 2])), Verdict::Accept);
        assert_eq!(net.chain(Family::Inet, "filter", "deny").unwrap().use_count().get(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"tables": [{"family": "ipv4", "name": "nat"}]}"#).unwrap();
        let spec = RulesetSpec::from_file(file.path()).unwrap();
        assert_eq!(spec.tables[0].name, "nat");

        let missing = RulesetSpec::from_file(Path::new("/nonexistent/ruleset.json"));
        assert!(missing.is_err());
    }

    #[test]
    fn test_failed_load_leaves_nothing() {
        let net = NetBuilder::new(Arc::new(Registry::with_builtins())).build().unwrap();
        let spec = RulesetSpec::from_json(
            r#"{"tables": [{"family": "inet", "name": "t", "chains": [
                {"name": "c", "rules": [{"exprs": [{"type": "immediate", "verdict": "jump", "chain": "missing"}]}]}
            ]}]}"#,
        )
        .unwrap();
        let err = spec.load(&net).unwrap_err();
        assert_eq!(err.kind(), nft_common::ErrorKind::NotFound);
        assert!(net.tables().is_empty());
    }
}
