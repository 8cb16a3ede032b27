// 🔗 Chain Interlinker - Multi-hop FROM → TO resolution across versions
//
// Correspondence tables only link adjacent releases. To go from 3.5 to 3.9
// every chain is walked hop by hop: the identity reached in one table is
// joined against the FROM side of the next, and the hop shares multiply.

use crate::correspondence::{
    read_correspondence_table, CorrespondenceRow, CorrespondenceTable, VersionId,
};
use crate::error::{MappingError, Result};
use crate::record::{EntityRecord, Field, KeyTuple};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// Upper bound on tables walked by one interlink run
pub const MAX_HOPS: usize = 50;

// ============================================================================
// JOIN KEYS
// ============================================================================

/// Generic name, partial name, location, unit
///
/// The generic name is the activity name, or the display name for records
/// that only carry one.
pub fn primary_join_key(record: &EntityRecord) -> Option<KeyTuple> {
    let generic = record
        .get(Field::ActivityName)
        .or_else(|| record.get(Field::Name));

    KeyTuple::from_components([
        generic,
        record.get(Field::ProductName),
        record.get(Field::Location),
        record.get(Field::Unit),
    ])
}

/// Code pair
pub fn secondary_join_key(record: &EntityRecord) -> Option<KeyTuple> {
    KeyTuple::project(record, &[Field::Code, Field::ProductCode])
}

/// FROM-side indexes of one table
struct JoinIndex {
    primary: HashMap<KeyTuple, Vec<usize>>,
    secondary: HashMap<KeyTuple, Vec<usize>>,
}

impl JoinIndex {
    fn build(table: &CorrespondenceTable) -> Self {
        let mut primary: HashMap<KeyTuple, Vec<usize>> = HashMap::new();
        let mut secondary: HashMap<KeyTuple, Vec<usize>> = HashMap::new();

        for (index, row) in table.rows().iter().enumerate() {
            let Some(from) = &row.from else { continue };
            if let Some(key) = primary_join_key(from) {
                primary.entry(key).or_default().push(index);
            }
            if let Some(key) = secondary_join_key(from) {
                secondary.entry(key).or_default().push(index);
            }
        }

        JoinIndex { primary, secondary }
    }

    fn lookup(&self, identity: &EntityRecord) -> Option<(JoinKind, &[usize])> {
        if let Some(rows) = primary_join_key(identity).and_then(|key| self.primary.get(&key)) {
            return Some((JoinKind::Primary, rows.as_slice()));
        }
        secondary_join_key(identity)
            .and_then(|key| self.secondary.get(&key))
            .map(|rows| (JoinKind::Secondary, rows.as_slice()))
    }
}

// ============================================================================
// CHAINS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    Seeking,
    Interlinked,
    Failed,
    Deleted,
    NewlyIntroduced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// First table of the path
    Start,
    Primary,
    Secondary,
    /// No row joined; identity passed unchanged to the next table
    CarriedForward,
}

/// One hop of a chain's trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopLink {
    pub from_version: VersionId,
    pub to_version: VersionId,
    pub join: JoinKind,
    pub multiplier: f64,
    pub reached: Option<EntityRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    /// Identity in the requested FROM version; `None` for newly introduced
    pub origin: Option<EntityRecord>,
    /// Identity reached so far; `None` once deleted
    pub current: Option<EntityRecord>,
    pub state: ChainState,
    pub trail: Vec<HopLink>,
    /// Product of every hop multiplier
    pub multiplier: f64,
}

impl Chain {
    fn start(table: &CorrespondenceTable, row: &CorrespondenceRow) -> Self {
        let state = match (&row.from, &row.to) {
            (None, _) => ChainState::NewlyIntroduced,
            (Some(_), None) => ChainState::Deleted,
            (Some(_), Some(_)) => ChainState::Seeking,
        };

        Chain {
            origin: row.from.clone(),
            current: row.to.clone(),
            state,
            trail: vec![link(table, JoinKind::Start, row.multiplier, row.to.clone())],
            multiplier: row.multiplier,
        }
    }

    /// Follow `row` out of this chain's current identity
    fn extend(&self, table: &CorrespondenceTable, join: JoinKind, row: &CorrespondenceRow) -> Self {
        let mut next = self.clone();
        next.multiplier *= row.multiplier;
        next.current = row.to.clone();
        next.trail
            .push(link(table, join, row.multiplier, row.to.clone()));
        if row.to.is_none() {
            next.state = ChainState::Deleted;
        }
        next
    }

    fn carry_forward(mut self, table: &CorrespondenceTable) -> Self {
        let reached = self.current.clone();
        self.trail
            .push(link(table, JoinKind::CarriedForward, 1.0, reached));
        self
    }

    fn finish(mut self, state: ChainState) -> Self {
        self.state = state;
        self
    }

    /// Hops where a table row was actually followed
    pub fn joined_hops(&self) -> usize {
        self.trail
            .iter()
            .filter(|l| l.join != JoinKind::CarriedForward)
            .count()
    }
}

fn link(
    table: &CorrespondenceTable,
    join: JoinKind,
    multiplier: f64,
    reached: Option<EntityRecord>,
) -> HopLink {
    HopLink {
        from_version: table.from_version.clone(),
        to_version: table.to_version.clone(),
        join,
        multiplier,
        reached,
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterlinkReport {
    pub from_version: VersionId,
    pub to_version: VersionId,
    /// Version pairs walked, in order
    pub hops: Vec<(VersionId, VersionId)>,
    pub interlinked: Vec<Chain>,
    pub failed: Vec<Chain>,
    pub deleted: Vec<Chain>,
    pub newly_introduced: Vec<Chain>,
    pub generated_at: DateTime<Utc>,
}

impl InterlinkReport {
    fn new(from_version: VersionId, to_version: VersionId, hops: Vec<(VersionId, VersionId)>) -> Self {
        InterlinkReport {
            from_version,
            to_version,
            hops,
            interlinked: Vec::new(),
            failed: Vec::new(),
            deleted: Vec::new(),
            newly_introduced: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    fn push(&mut self, chain: Chain) {
        match chain.state {
            ChainState::Interlinked | ChainState::Seeking => self.interlinked.push(chain),
            ChainState::Failed => self.failed.push(chain),
            ChainState::Deleted => self.deleted.push(chain),
            ChainState::NewlyIntroduced => self.newly_introduced.push(chain),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} -> {} in {} hops: {} interlinked, {} failed, {} deleted, {} newly introduced",
            self.from_version,
            self.to_version,
            self.hops.len(),
            self.interlinked.len(),
            self.failed.len(),
            self.deleted.len(),
            self.newly_introduced.len()
        )
    }
}

// ============================================================================
// INTERLINKER
// ============================================================================

#[derive(Debug, Default)]
pub struct ChainInterlinker {
    tables: BTreeMap<(VersionId, VersionId), CorrespondenceTable>,
}

impl ChainInterlinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table; rows for an already loaded version pair are appended
    pub fn add_table(&mut self, table: CorrespondenceTable) -> Result<usize> {
        if table.from_version == table.to_version {
            return Err(MappingError::malformed(
                table.label(),
                "FROM and TO versions are identical",
            ));
        }

        let key = (table.from_version.clone(), table.to_version.clone());
        let added = table.len();

        match self.tables.get_mut(&key) {
            Some(existing) => {
                // Stage on a copy so a duplicate leaves the loaded table untouched
                let mut merged = existing.clone();
                for row in table.rows() {
                    let line = merged.len() + 1;
                    merged.push(row.clone(), line)?;
                }
                *existing = merged;
            }
            None => {
                self.tables.insert(key, table);
            }
        }

        Ok(added)
    }

    pub fn add_row(&mut self, from_version: &VersionId, to_version: &VersionId, row: CorrespondenceRow) -> Result<()> {
        let mut table = CorrespondenceTable::new(from_version.clone(), to_version.clone());
        table.push(row, 1)?;
        self.add_table(table).map(|_| ())
    }

    /// Load one CSV table; returns the number of rows read
    pub fn load_table<R: Read>(
        &mut self,
        reader: R,
        from_version: VersionId,
        to_version: VersionId,
    ) -> Result<usize> {
        let table = read_correspondence_table(reader, from_version, to_version)?;
        self.add_table(table)
    }

    pub fn load_table_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        from_version: VersionId,
        to_version: VersionId,
    ) -> Result<usize> {
        let file = File::open(path.as_ref())?;
        debug!("Reading correspondence table {:?}", path.as_ref());
        self.load_table(file, from_version, to_version)
    }

    pub fn table(&self, from_version: &VersionId, to_version: &VersionId) -> Option<&CorrespondenceTable> {
        self.tables.get(&(from_version.clone(), to_version.clone()))
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Version pairs that `interlink(from, to)` would walk
    pub fn plan_path(&self, from: &VersionId, to: &VersionId) -> Result<Vec<(VersionId, VersionId)>> {
        Ok(self
            .plan_tables(from, to)?
            .into_iter()
            .map(|t| (t.from_version.clone(), t.to_version.clone()))
            .collect())
    }

    /// From each version take the table that lands exactly on `to`, else the
    /// one landing nearest to it without passing it
    fn plan_tables(&self, from: &VersionId, to: &VersionId) -> Result<Vec<&CorrespondenceTable>> {
        if from == to {
            return Err(MappingError::malformed(
                format!("interlink {} -> {}", from, to),
                "FROM and TO versions are identical",
            ));
        }

        let forward = to > from;
        let mut path = Vec::new();
        let mut current = from.clone();

        while current != *to {
            if path.len() >= MAX_HOPS {
                return Err(MappingError::HopLimitExceeded {
                    from: from.clone(),
                    to: to.clone(),
                    cap: MAX_HOPS,
                });
            }

            let candidates = self.tables.values().filter(|t| {
                t.from_version == current
                    && if forward {
                        t.to_version > current && t.to_version <= *to
                    } else {
                        t.to_version < current && t.to_version >= *to
                    }
            });
            let next = if forward {
                candidates.max_by(|a, b| a.to_version.cmp(&b.to_version))
            } else {
                candidates.min_by(|a, b| a.to_version.cmp(&b.to_version))
            };

            let Some(table) = next else {
                return Err(MappingError::NoCorrespondencePath {
                    at: current,
                    target: to.clone(),
                });
            };

            current = table.to_version.clone();
            path.push(table);
        }

        Ok(path)
    }

    /// Walk every chain of the first table to version `to`
    pub fn interlink(&self, from: &VersionId, to: &VersionId) -> Result<InterlinkReport> {
        let tables = self.plan_tables(from, to)?;
        let hops = tables
            .iter()
            .map(|t| (t.from_version.clone(), t.to_version.clone()))
            .collect();
        let mut report = InterlinkReport::new(from.clone(), to.clone(), hops);

        let mut seeking = Vec::new();
        let last = tables.len() - 1;

        for (hop, table) in tables.iter().enumerate() {
            if hop == 0 {
                for row in table.rows() {
                    if row.multiplier == 0.0 {
                        trace!("Skipping zero-share row in {}", table.label());
                        continue;
                    }
                    let chain = Chain::start(table, row);
                    match chain.state {
                        ChainState::Seeking => seeking.push(chain),
                        _ => report.push(chain),
                    }
                }
                continue;
            }

            // Datasets that only appear partway along the path
            for row in table.rows().iter().filter(|r| r.from.is_none() && r.multiplier != 0.0) {
                report.push(Chain::start(table, row));
            }

            let index = JoinIndex::build(table);
            let mut next = Vec::with_capacity(seeking.len());

            for chain in seeking {
                let hit = chain.current.as_ref().and_then(|identity| index.lookup(identity));

                match hit {
                    Some((join, rows)) => {
                        for &row_index in rows {
                            let row = &table.rows()[row_index];
                            if row.multiplier == 0.0 {
                                continue;
                            }
                            let extended = chain.extend(table, join, row);
                            match extended.state {
                                ChainState::Seeking => next.push(extended),
                                _ => report.push(extended),
                            }
                        }
                    }
                    None if hop == last => {
                        warn!(
                            "No row in {} continues chain from {}",
                            table.label(),
                            chain
                                .origin
                                .as_ref()
                                .map(|r| r.to_string())
                                .unwrap_or_default()
                        );
                        report.push(chain.finish(ChainState::Failed));
                    }
                    None => next.push(chain.carry_forward(table)),
                }
            }

            seeking = next;
        }

        for chain in seeking {
            report.push(chain.finish(ChainState::Interlinked));
        }

        info!("Interlinked {}", report.summary());
        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VersionId {
        s.parse().unwrap()
    }

    fn activity(name: &str) -> EntityRecord {
        EntityRecord::new()
            .with_activity_name(name)
            .with_product_name("product")
            .with_location("GLO")
            .with_unit("kg")
    }

    fn table(from: &str, to: &str, rows: Vec<CorrespondenceRow>) -> CorrespondenceTable {
        let mut table = CorrespondenceTable::new(v(from), v(to));
        for (i, row) in rows.into_iter().enumerate() {
            table.push(row, i + 2).unwrap();
        }
        table
    }

    fn same(names: &[&str]) -> Vec<CorrespondenceRow> {
        names
            .iter()
            .map(|n| CorrespondenceRow::new(activity(n), activity(n), 1.0))
            .collect()
    }

    #[test]
    fn test_three_full_hops_interlink() {
        let mut linker = ChainInterlinker::new();
        linker.add_table(table("1", "2", same(&["a", "b"]))).unwrap();
        linker.add_table(table("2", "3", same(&["a", "b"]))).unwrap();
        linker.add_table(table("3", "4", same(&["a", "b"]))).unwrap();

        let report = linker.interlink(&v("1"), &v("4")).unwrap();

        assert_eq!(report.hops.len(), 3);
        assert_eq!(report.interlinked.len(), 2);
        assert!(report.failed.is_empty());
        for chain in &report.interlinked {
            assert_eq!(chain.multiplier, 1.0);
            assert_eq!(chain.trail.len(), 3);
            assert_eq!(chain.joined_hops(), 3);
            assert_eq!(chain.state, ChainState::Interlinked);
        }
    }

    #[test]
    fn test_split_multipliers_compose() {
        let mut linker = ChainInterlinker::new();
        linker
            .add_table(table(
                "1",
                "2",
                vec![
                    CorrespondenceRow::new(activity("a"), activity("a1"), 0.5),
                    CorrespondenceRow::new(activity("a"), activity("a2"), 0.5),
                ],
            ))
            .unwrap();
        linker
            .add_table(table(
                "2",
                "3",
                vec![
                    CorrespondenceRow::new(activity("a1"), activity("x"), 0.4),
                    CorrespondenceRow::new(activity("a1"), activity("y"), 0.6),
                    CorrespondenceRow::new(activity("a2"), activity("z"), 1.0),
                ],
            ))
            .unwrap();

        let report = linker.interlink(&v("1"), &v("3")).unwrap();

        let shares: Vec<f64> = report.interlinked.iter().map(|c| c.multiplier).collect();
        assert_eq!(shares, vec![0.2, 0.3, 0.5]);
        assert!((shares.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_share_rows_never_surface() {
        let mut linker = ChainInterlinker::new();
        linker
            .add_table(table(
                "1",
                "2",
                vec![
                    CorrespondenceRow::new(activity("a"), activity("a"), 1.0),
                    CorrespondenceRow::new(activity("a"), activity("doc only"), 0.0),
                ],
            ))
            .unwrap();

        let report = linker.interlink(&v("1"), &v("2")).unwrap();

        assert_eq!(report.interlinked.len(), 1);
        let all = report
            .interlinked
            .iter()
            .chain(&report.failed)
            .chain(&report.deleted)
            .chain(&report.newly_introduced);
        assert!(all.flat_map(|c| &c.trail).all(|l| l.multiplier != 0.0));
    }

    #[test]
    fn test_secondary_join_on_codes() {
        let renamed_from = EntityRecord::new()
            .with_code("C1")
            .with_product_code("P1")
            .with_activity_name("old name")
            .with_product_name("product")
            .with_location("GLO")
            .with_unit("kg");
        let renamed_to = renamed_from.clone().with_activity_name("new name");

        let mut linker = ChainInterlinker::new();
        linker
            .add_table(table("1", "2", vec![CorrespondenceRow::new(activity("a"), renamed_from, 1.0)]))
            .unwrap();
        linker
            .add_table(table(
                "2",
                "3",
                vec![CorrespondenceRow::new(
                    EntityRecord::new()
                        .with_code("C1")
                        .with_product_code("P1")
                        .with_activity_name("renamed again")
                        .with_product_name("product")
                        .with_location("GLO")
                        .with_unit("kg"),
                    renamed_to,
                    1.0,
                )],
            ))
            .unwrap();

        let report = linker.interlink(&v("1"), &v("3")).unwrap();

        assert_eq!(report.interlinked.len(), 1);
        assert_eq!(report.interlinked[0].trail[1].join, JoinKind::Secondary);
    }

    #[test]
    fn test_unmatched_chain_carried_then_failed() {
        let mut linker = ChainInterlinker::new();
        linker.add_table(table("1", "2", same(&["a", "b"]))).unwrap();
        linker.add_table(table("2", "3", same(&["a"]))).unwrap();
        linker.add_table(table("3", "4", same(&["a", "b"]))).unwrap();
        linker.add_table(table("4", "5", same(&["a"]))).unwrap();

        // "b" skips 2->3, rejoins at 3->4
        let report = linker.interlink(&v("1"), &v("4")).unwrap();
        assert_eq!(report.interlinked.len(), 2);
        let b = report
            .interlinked
            .iter()
            .find(|c| c.origin == Some(activity("b")))
            .unwrap();
        assert_eq!(b.trail[1].join, JoinKind::CarriedForward);
        assert_eq!(b.joined_hops(), 2);

        // "b" has nothing at the final hop 4->5
        let report = linker.interlink(&v("1"), &v("5")).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].origin, Some(activity("b")));
    }

    #[test]
    fn test_deleted_and_newly_introduced() {
        let mut linker = ChainInterlinker::new();
        linker
            .add_table(table(
                "1",
                "2",
                vec![
                    CorrespondenceRow::new(activity("a"), activity("a"), 1.0),
                    CorrespondenceRow::new(EntityRecord::new(), activity("fresh"), 1.0),
                ],
            ))
            .unwrap();
        linker
            .add_table(table(
                "2",
                "3",
                vec![CorrespondenceRow::new(activity("a"), EntityRecord::new(), 1.0)],
            ))
            .unwrap();

        let report = linker.interlink(&v("1"), &v("3")).unwrap();

        assert!(report.interlinked.is_empty());
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].current, None);
        assert_eq!(report.newly_introduced.len(), 1);
        assert_eq!(report.newly_introduced[0].origin, None);
    }

    #[test]
    fn test_plan_prefers_exact_target() {
        let mut linker = ChainInterlinker::new();
        linker.add_table(table("3.5", "3.6", same(&["a"]))).unwrap();
        linker.add_table(table("3.5", "3.9", same(&["a"]))).unwrap();
        linker.add_table(table("3.6", "3.9", same(&["a"]))).unwrap();

        assert_eq!(linker.plan_path(&v("3.5"), &v("3.9")).unwrap(), vec![(v("3.5"), v("3.9"))]);
        assert_eq!(linker.plan_path(&v("3.5"), &v("3.6")).unwrap().len(), 1);
    }

    #[test]
    fn test_backward_path() {
        let mut linker = ChainInterlinker::new();
        linker.add_table(table("3", "2", same(&["a"]))).unwrap();
        linker.add_table(table("2", "1", same(&["a"]))).unwrap();

        let report = linker.interlink(&v("3"), &v("1")).unwrap();
        assert_eq!(report.hops, vec![(v("3"), v("2")), (v("2"), v("1"))]);
        assert_eq!(report.interlinked.len(), 1);
    }

    #[test]
    fn test_missing_table_is_configuration_error() {
        let mut linker = ChainInterlinker::new();
        linker.add_table(table("1", "2", same(&["a"]))).unwrap();

        let err = linker.interlink(&v("1"), &v("3")).unwrap_err();
        assert!(matches!(err, MappingError::NoCorrespondencePath { ref at, .. } if *at == v("2")));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_hop_cap_is_fatal() {
        let mut linker = ChainInterlinker::new();
        for i in 0..=MAX_HOPS {
            let (from, to) = (i.to_string(), (i + 1).to_string());
            linker.add_table(table(&from, &to, same(&["a"]))).unwrap();
        }

        let end = (MAX_HOPS + 1).to_string();
        let err = linker.interlink(&v("0"), &v(&end)).unwrap_err();
        assert!(matches!(err, MappingError::HopLimitExceeded { cap: MAX_HOPS, .. }));

        // Exactly at the cap is fine
        assert!(linker.interlink(&v("0"), &v(&MAX_HOPS.to_string())).is_ok());
    }

    #[test]
    fn test_identical_versions_rejected() {
        let linker = ChainInterlinker::new();
        assert!(matches!(
            linker.interlink(&v("1"), &v("1")),
            Err(MappingError::MalformedInput { .. })
        ));
    }

    #[test]
    fn test_appending_to_existing_pair_checks_duplicates() {
        let mut linker = ChainInterlinker::new();
        linker.add_table(table("1", "2", same(&["a"]))).unwrap();
        linker.add_table(table("1", "2", same(&["b"]))).unwrap();
        assert_eq!(linker.table(&v("1"), &v("2")).unwrap().len(), 2);

        let err = linker.add_table(table("1", "2", same(&["a"]))).unwrap_err();
        assert!(matches!(err, MappingError::DuplicateRow { .. }));
    }

    #[test]
    fn test_failed_append_leaves_table_unchanged() {
        let mut linker = ChainInterlinker::new();
        linker.add_table(table("1", "2", same(&["a"]))).unwrap();

        let err = linker
            .add_table(table("1", "2", same(&["fresh", "a"])))
            .unwrap_err();

        assert!(matches!(err, MappingError::DuplicateRow { .. }));
        let loaded = linker.table(&v("1"), &v("2")).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.rows().iter().all(|r| r.from == Some(activity("a"))));

        // The staged row was not kept, so it can still be added on its own
        linker.add_table(table("1", "2", same(&["fresh"]))).unwrap();
        assert_eq!(linker.table(&v("1"), &v("2")).unwrap().len(), 2);
    }

    #[test]
    fn test_load_table_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "from_activity_name,from_product_name,from_location,from_unit,\
to_activity_name,to_product_name,to_location,to_unit,multiplier"
        )
        .unwrap();
        writeln!(file, "a,product,GLO,kg,a,product,GLO,kg,1").unwrap();

        let mut linker = ChainInterlinker::new();
        let rows = linker.load_table_file(file.path(), v("1"), v("2")).unwrap();

        assert_eq!(rows, 1);
        assert_eq!(linker.interlink(&v("1"), &v("2")).unwrap().interlinked.len(), 1);
    }
}
