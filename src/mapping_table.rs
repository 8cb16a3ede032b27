// 🗂️ Mapping Tables - Registrations and their derived key indexes
//
// A mapping-source owns an append-only list of registrations. Registrations
// for the same source record accumulate into one fan-out. Key indexes (one
// per rule, plus the merged fallback) are derived from that list on first
// use and thrown away whenever a new registration arrives.

use crate::error::{MappingError, Result};
use crate::record::{EntityRecord, KeyTuple, Payload, Target, DEFAULT_MULTIPLIER};
use crate::rules::RuleCatalog;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

// ============================================================================
// MAPPING-SOURCE KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSourceKind {
    /// Exact manual correspondences
    Direct,
    /// Analyst overrides, re-resolved through Direct
    Custom,
    /// Interlinked version-to-version chains, re-resolved through Direct
    Correspondence,
    /// Embedding-similarity proposals, re-resolved through Direct
    Similarity,
}

impl MappingSourceKind {
    /// Resolution priority, highest first
    pub const PRIORITY: [MappingSourceKind; 4] = [
        MappingSourceKind::Direct,
        MappingSourceKind::Custom,
        MappingSourceKind::Correspondence,
        MappingSourceKind::Similarity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MappingSourceKind::Direct => "direct",
            MappingSourceKind::Custom => "custom",
            MappingSourceKind::Correspondence => "correspondence",
            MappingSourceKind::Similarity => "similarity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        MappingSourceKind::PRIORITY
            .into_iter()
            .find(|kind| kind.as_str() == value)
    }

    /// Correspondence fan-outs must partition the source quantity completely
    pub fn requires_sum_to_one(&self) -> bool {
        matches!(self, MappingSourceKind::Correspondence)
    }
}

impl fmt::Display for MappingSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// REGISTRATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub source: EntityRecord,
    pub target: Payload,
    pub multiplier: f64,
}

/// Absent → 1.0; negative, NaN and infinite shares are rejected
pub fn validate_multiplier(multiplier: Option<f64>, context: &str) -> Result<f64> {
    let value = multiplier.unwrap_or(DEFAULT_MULTIPLIER);
    if !value.is_finite() || value < 0.0 {
        return Err(MappingError::malformed(
            context,
            format!("multiplier must be a non-negative number, got {}", value),
        ));
    }
    Ok(value)
}

/// All registrations of one source record, in registration order
#[derive(Debug, Clone)]
struct SourceGroup {
    source: EntityRecord,
    fan_out: Vec<Target>,
    /// Ordinal of this group's most recent registration
    last_registered: usize,
}

type KeyIndex = HashMap<KeyTuple, usize>;

// ============================================================================
// MAPPING SOURCE
// ============================================================================

/// One of the four independent registries, with its lazily built indexes
///
/// An empty `OnceLock` is the dirty flag: the index is rebuilt by the next
/// lookup that needs it. Lookups only need `&self`, so a fully built source
/// can be shared across threads; registration needs `&mut self`.
pub struct MappingSource {
    kind: MappingSourceKind,
    registrations: Vec<Registration>,
    groups: Vec<SourceGroup>,
    group_index: HashMap<EntityRecord, usize>,
    rule_tables: Vec<OnceLock<KeyIndex>>,
    merged: OnceLock<KeyIndex>,
}

impl MappingSource {
    pub fn new(kind: MappingSourceKind, rule_count: usize) -> Self {
        MappingSource {
            kind,
            registrations: Vec::new(),
            groups: Vec::new(),
            group_index: HashMap::new(),
            rule_tables: (0..rule_count).map(|_| OnceLock::new()).collect(),
            merged: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> MappingSourceKind {
        self.kind
    }

    /// Append a registration and invalidate every derived index
    pub fn register(
        &mut self,
        source: EntityRecord,
        target: Payload,
        multiplier: Option<f64>,
    ) -> Result<()> {
        let context = format!("{} registration for {}", self.kind, source);
        let multiplier = validate_multiplier(multiplier, &context)?;

        if source.is_empty() {
            return Err(MappingError::malformed(context, "source record has no fields"));
        }

        let group = match self.group_index.get(&source) {
            Some(&index) => index,
            None => {
                self.groups.push(SourceGroup {
                    source: source.clone(),
                    fan_out: Vec::new(),
                    last_registered: 0,
                });
                self.group_index.insert(source.clone(), self.groups.len() - 1);
                self.groups.len() - 1
            }
        };

        let ordinal = self.registrations.len();
        let entry = &mut self.groups[group];
        entry.fan_out.push(Target::new(target.clone(), multiplier));
        entry.last_registered = ordinal;
        self.registrations.push(Registration {
            source,
            target,
            multiplier,
        });

        self.invalidate();
        Ok(())
    }

    fn invalidate(&mut self) {
        for table in &mut self.rule_tables {
            table.take();
        }
        self.merged.take();
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Number of distinct source records
    pub fn source_count(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Accumulated fan-out of one exact source record
    pub fn fan_out_of(&self, source: &EntityRecord) -> Option<&[Target]> {
        self.group_index
            .get(source)
            .map(|&index| self.groups[index].fan_out.as_slice())
    }

    pub(crate) fn fan_out(&self, group: usize) -> &[Target] {
        &self.groups[group].fan_out
    }

    /// Whether the index for rule `rule` is currently built
    pub fn is_rule_table_built(&self, rule: usize) -> bool {
        self.rule_tables
            .get(rule)
            .map(|table| table.get().is_some())
            .unwrap_or(false)
    }

    pub fn is_merged_table_built(&self) -> bool {
        self.merged.get().is_some()
    }

    /// Group indexes ordered by their latest registration, oldest first
    fn groups_by_recency(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.groups.len()).collect();
        order.sort_by_key(|&index| self.groups[index].last_registered);
        order
    }

    /// Per-rule index: key tuple → source group
    ///
    /// Groups are inserted oldest-registration first, so when two sources
    /// share a key the one registered most recently wins.
    pub(crate) fn rule_table(&self, rule: usize, catalog: &RuleCatalog) -> Option<&KeyIndex> {
        let cell = self.rule_tables.get(rule)?;
        let key_rule = catalog.get(rule)?;

        Some(cell.get_or_init(|| {
            let mut table = KeyIndex::new();
            for index in self.groups_by_recency() {
                let group = &self.groups[index];
                if let Some(key) = key_rule.index_key(&group.source) {
                    table.insert(key, index);
                }
            }
            debug!(
                "Built {} table for rule {}: {} keys from {} sources",
                self.kind,
                key_rule.id(),
                table.len(),
                self.groups.len()
            );
            table
        }))
    }

    /// Merged index: union of every rule's keys, last registration wins
    pub(crate) fn merged_table(&self, catalog: &RuleCatalog) -> &KeyIndex {
        self.merged.get_or_init(|| {
            let mut table = KeyIndex::new();
            for index in self.groups_by_recency() {
                let group = &self.groups[index];
                for rule in catalog.iter() {
                    if let Some(key) = rule.index_key(&group.source) {
                        table.insert(key, index);
                    }
                }
            }
            debug!(
                "Built merged {} table: {} keys from {} sources",
                self.kind,
                table.len(),
                self.groups.len()
            );
            table
        })
    }

    /// Build every index now, so later lookups never write
    pub fn prepare(&self, catalog: &RuleCatalog) {
        for rule in 0..catalog.len() {
            self.rule_table(rule, catalog);
        }
        self.merged_table(catalog);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{FieldProjection, RuleCatalog};
    use crate::record::Field;

    fn catalog() -> RuleCatalog {
        RuleCatalog::new()
            .with_rule(FieldProjection::new("code_unit", &[Field::Code, Field::Unit]))
            .with_rule(FieldProjection::new("name_unit", &[Field::Name, Field::Unit]))
    }

    fn record(code: &str) -> EntityRecord {
        EntityRecord::new().with_code(code).with_unit("kg")
    }

    #[test]
    fn test_registrations_accumulate_in_order() {
        let mut source = MappingSource::new(MappingSourceKind::Direct, 2);

        source
            .register(record("A1"), Payload::Opaque(serde_json::json!("X")), Some(0.4))
            .unwrap();
        source
            .register(record("A1"), Payload::Opaque(serde_json::json!("Y")), Some(0.6))
            .unwrap();

        let fan_out = source.fan_out_of(&record("A1")).unwrap();
        assert_eq!(fan_out.len(), 2);
        assert_eq!(fan_out[0].multiplier, 0.4);
        assert_eq!(fan_out[1].payload, Payload::Opaque(serde_json::json!("Y")));
        assert_eq!(source.source_count(), 1);
        assert_eq!(source.registrations().len(), 2);
    }

    #[test]
    fn test_absent_multiplier_defaults_to_one() {
        let mut source = MappingSource::new(MappingSourceKind::Direct, 2);
        source
            .register(record("A1"), Payload::Record(record("B1")), None)
            .unwrap();

        assert_eq!(source.registrations()[0].multiplier, 1.0);
    }

    #[test]
    fn test_negative_multiplier_rejected() {
        let mut source = MappingSource::new(MappingSourceKind::Direct, 2);
        let result = source.register(record("A1"), Payload::Record(record("B1")), Some(-0.5));

        assert!(matches!(result, Err(MappingError::MalformedInput { .. })));
        assert!(source.is_empty());
    }

    #[test]
    fn test_empty_source_rejected() {
        let mut source = MappingSource::new(MappingSourceKind::Direct, 2);
        let result = source.register(EntityRecord::new(), Payload::Record(record("B1")), None);

        assert!(result.is_err());
    }

    #[test]
    fn test_tables_built_lazily_and_invalidated() {
        let catalog = catalog();
        let mut source = MappingSource::new(MappingSourceKind::Direct, catalog.len());
        source
            .register(record("A1"), Payload::Record(record("B1")), None)
            .unwrap();

        assert!(!source.is_rule_table_built(0));
        let table = source.rule_table(0, &catalog).unwrap();
        assert_eq!(table.len(), 1);
        assert!(source.is_rule_table_built(0));
        assert!(!source.is_rule_table_built(1));

        source.prepare(&catalog);
        assert!(source.is_merged_table_built());

        source
            .register(record("A2"), Payload::Record(record("B2")), None)
            .unwrap();
        assert!(!source.is_rule_table_built(0));
        assert!(!source.is_merged_table_built());
    }

    #[test]
    fn test_rule_table_skips_records_without_key() {
        let catalog = catalog();
        let mut source = MappingSource::new(MappingSourceKind::Direct, catalog.len());
        source
            .register(record("A1"), Payload::Record(record("B1")), None)
            .unwrap();

        // name_unit needs a name
        assert!(source.rule_table(1, &catalog).unwrap().is_empty());
        assert_eq!(source.merged_table(&catalog).len(), 1);
    }

    #[test]
    fn test_merged_table_last_registration_wins() {
        let catalog = catalog();
        let mut source = MappingSource::new(MappingSourceKind::Direct, catalog.len());

        // Same key tuple ("x", "kg") reached through two different rules
        let by_code = EntityRecord::new().with_code("X").with_unit("kg");
        let by_name = EntityRecord::new().with_name("x").with_unit("KG");
        source
            .register(by_code, Payload::Opaque(serde_json::json!("first")), None)
            .unwrap();
        source
            .register(by_name, Payload::Opaque(serde_json::json!("second")), None)
            .unwrap();

        let key = KeyTuple::from_components([Some("x"), Some("kg")]).unwrap();
        let group = *source.merged_table(&catalog).get(&key).unwrap();

        assert_eq!(
            source.fan_out(group)[0].payload,
            Payload::Opaque(serde_json::json!("second"))
        );
    }

    #[test]
    fn test_re_registered_source_wins_key_collision() {
        let catalog = catalog();
        let mut source = MappingSource::new(MappingSourceKind::Direct, catalog.len());

        // Both records share the code_unit key ("x", "kg")
        let first = EntityRecord::new().with_code("X").with_name("one").with_unit("kg");
        let second = EntityRecord::new().with_code("X").with_name("two").with_unit("kg");
        source
            .register(first.clone(), Payload::Opaque(serde_json::json!("A")), None)
            .unwrap();
        source
            .register(second, Payload::Opaque(serde_json::json!("B")), None)
            .unwrap();
        source
            .register(first.clone(), Payload::Opaque(serde_json::json!("C")), None)
            .unwrap();

        let key = KeyTuple::from_components([Some("x"), Some("kg")]).unwrap();
        let per_rule = *source.rule_table(0, &catalog).unwrap().get(&key).unwrap();
        let merged = *source.merged_table(&catalog).get(&key).unwrap();

        assert_eq!(source.fan_out(per_rule), source.fan_out_of(&first).unwrap());
        assert_eq!(per_rule, merged);
        assert_eq!(source.fan_out(merged).len(), 2);
    }

    #[test]
    fn test_kind_round_trip_names() {
        for kind in MappingSourceKind::PRIORITY {
            assert_eq!(MappingSourceKind::parse(kind.as_str()), Some(kind));
        }
        assert!(MappingSourceKind::Correspondence.requires_sum_to_one());
        assert!(!MappingSourceKind::Direct.requires_sum_to_one());
    }
}
