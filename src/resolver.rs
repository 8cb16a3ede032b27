// 🔎 Resolver - Rule cascade over one mapping-source
//
// Pass 1 walks the catalog against each rule's own index. Pass 2 walks it
// again against the merged index, which catches records registered under
// one rule's key but queried through another's. First accepted hit wins.

use crate::mapping_table::MappingSource;
use crate::record::{multiplier_sum, EntityRecord, KeyTuple, Target};
use crate::rules::RuleCatalog;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Default tolerance around 1.0 for complete partitions
pub const SUM_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupPass {
    PerRule,
    Merged,
}

/// A successful lookup and where it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub pass: LookupPass,
    pub key: KeyTuple,
    pub fan_out: Vec<Target>,
}

pub fn sums_to_one(fan_out: &[Target], tolerance: f64) -> bool {
    (multiplier_sum(fan_out) - 1.0).abs() <= tolerance
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct Resolver<'a> {
    catalog: &'a RuleCatalog,
    tolerance: f64,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a RuleCatalog) -> Self {
        Resolver {
            catalog,
            tolerance: SUM_TOLERANCE,
        }
    }

    pub fn with_tolerance(catalog: &'a RuleCatalog, tolerance: f64) -> Self {
        Resolver { catalog, tolerance }
    }

    /// Resolve `query` against `source`, or `None` for no match
    ///
    /// With `require_sum_to_one`, a hit whose multipliers do not sum to
    /// 1.0 within tolerance is skipped and the cascade moves to the next
    /// rule. Nothing here raises.
    pub fn resolve(
        &self,
        source: &MappingSource,
        query: &EntityRecord,
        require_sum_to_one: bool,
    ) -> Option<RuleMatch> {
        if source.is_empty() {
            return None;
        }

        for pass in [LookupPass::PerRule, LookupPass::Merged] {
            if let Some(hit) = self.cascade(source, query, require_sum_to_one, pass) {
                debug!(
                    "{} match for {} via rule {} ({:?} pass, key {})",
                    source.kind(),
                    query,
                    hit.rule_id,
                    hit.pass,
                    hit.key
                );
                return Some(hit);
            }
        }

        trace!("No {} match for {}", source.kind(), query);
        None
    }

    fn cascade(
        &self,
        source: &MappingSource,
        query: &EntityRecord,
        require_sum_to_one: bool,
        pass: LookupPass,
    ) -> Option<RuleMatch> {
        for (index, rule) in self.catalog.iter().enumerate() {
            let table = match pass {
                LookupPass::PerRule => source.rule_table(index, self.catalog)?,
                LookupPass::Merged => source.merged_table(self.catalog),
            };

            // First candidate present in the table decides this rule
            let hit = rule
                .candidates(query)
                .into_iter()
                .find_map(|key| table.get(&key).map(|&group| (key, group)));

            let Some((key, group)) = hit else {
                continue;
            };

            let fan_out = source.fan_out(group);
            if require_sum_to_one && !sums_to_one(fan_out, self.tolerance) {
                trace!(
                    "Rejected {} fan-out for key {} under rule {}: multipliers sum to {:.4}",
                    source.kind(),
                    key,
                    rule.id(),
                    multiplier_sum(fan_out)
                );
                continue;
            }

            return Some(RuleMatch {
                rule_id: rule.id().to_string(),
                pass,
                key,
                fan_out: fan_out.to_vec(),
            });
        }

        None
    }
}

// ============================================================================
// TESTS
// ============================================================================
