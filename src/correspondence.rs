// 📑 Correspondence Tables - Version-to-version FROM → TO rows
//
// One table links every dataset of one version to its successor(s) in the
// next, with a share per row. Column headers differ between publications,
// so every logical column is found through a list of aliases.

use crate::error::{MappingError, Result};
use crate::record::{EntityRecord, Field};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use tracing::{debug, info};

// ============================================================================
// VERSION IDENTIFIER
// ============================================================================

/// Dotted integer version ("3.9.1"), compared component by component
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(Vec<u32>);

impl VersionId {
    pub fn new(parts: Vec<u32>) -> Self {
        VersionId(parts)
    }

    pub fn parts(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for VersionId {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MappingError::malformed("version identifier", "empty version"));
        }

        let parts = trimmed
            .split('.')
            .map(|part| {
                part.trim().parse::<u32>().map_err(|_| {
                    MappingError::malformed(
                        "version identifier",
                        format!("'{}' is not a dotted integer version", trimmed),
                    )
                })
            })
            .collect::<Result<Vec<u32>>>()?;

        Ok(VersionId(parts))
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

// ============================================================================
// MULTIPLIER TEXT
// ============================================================================

/// Markers for rows without a numeric share that still carry the full quantity
pub const NEW_DATASET_MARKERS: &[&str] = &["new", "new dataset", "placeholder"];

/// Marker for rows that exist for documentation only
pub const NO_SHARE_MARKER: &str = "no recommended share";

/// Normalize multiplier cell text
///
/// blank → 1.0, new/placeholder → 1.0, "no recommended share" → 0.0,
/// a non-negative number → itself. Anything else is malformed input.
pub fn parse_multiplier(text: &str) -> std::result::Result<f64, String> {
    let folded = text.trim().to_lowercase();

    if folded.is_empty() || NEW_DATASET_MARKERS.contains(&folded.as_str()) {
        return Ok(1.0);
    }
    if folded == NO_SHARE_MARKER {
        return Ok(0.0);
    }

    match folded.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        Ok(value) => Err(format!("multiplier must be non-negative, got {}", value)),
        Err(_) => Err(format!("unrecognized multiplier text '{}'", text.trim())),
    }
}

// ============================================================================
// ROWS & TABLES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrespondenceRow {
    /// `None`: dataset introduced in the TO version
    pub from: Option<EntityRecord>,
    /// `None`: dataset deleted in the TO version
    pub to: Option<EntityRecord>,
    pub multiplier: f64,
}

impl CorrespondenceRow {
    /// Empty records are stored as absent
    pub fn new(from: EntityRecord, to: EntityRecord, multiplier: f64) -> Self {
        CorrespondenceRow {
            from: Some(from).filter(|r| !r.is_empty()),
            to: Some(to).filter(|r| !r.is_empty()),
            multiplier,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

fn describe(record: &Option<EntityRecord>) -> String {
    record
        .as_ref()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "(none)".to_string())
}

#[derive(Debug, Clone)]
pub struct CorrespondenceTable {
    pub from_version: VersionId,
    pub to_version: VersionId,
    rows: Vec<CorrespondenceRow>,
    seen: HashSet<(Option<EntityRecord>, Option<EntityRecord>)>,
}

impl CorrespondenceTable {
    pub fn new(from_version: VersionId, to_version: VersionId) -> Self {
        CorrespondenceTable {
            from_version,
            to_version,
            rows: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn label(&self) -> String {
        format!("correspondence {} -> {}", self.from_version, self.to_version)
    }

    /// Append a row; a repeated FROM/TO pair means corrupted source data
    ///
    /// `line` is only used for the error message.
    pub fn push(&mut self, row: CorrespondenceRow, line: usize) -> Result<()> {
        if row.is_blank() {
            return Ok(());
        }

        let pair = (row.from.clone(), row.to.clone());
        if !self.seen.insert(pair) {
            return Err(MappingError::DuplicateRow {
                table: self.label(),
                line,
                from: describe(&row.from),
                to: describe(&row.to),
            });
        }

        self.rows.push(row);
        Ok(())
    }

    pub fn rows(&self) -> &[CorrespondenceRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ============================================================================
// COLUMN ALIASES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    From,
    To,
}

impl Side {
    fn prefixes(&self) -> &'static [&'static str] {
        match self {
            Side::From => &["from", "source", "old"],
            Side::To => &["to", "target", "new"],
        }
    }
}

/// Header labels used across publications for each identity field
fn field_labels(field: Field) -> &'static [&'static str] {
    match field {
        Field::Code => &["code", "activity uuid", "flow uuid", "uuid"],
        Field::ProductCode => &["product code", "product uuid", "reference product uuid"],
        Field::ActivityName => &["activity name", "activity"],
        Field::ProductName => &["product name", "reference product name", "reference product"],
        Field::Name => &["name", "flow name"],
        Field::VendorName => &["vendor name", "composite name"],
        Field::Location => &["location", "geography"],
        Field::Unit => &["unit", "reference product unit", "unit name"],
    }
}

const MULTIPLIER_LABELS: &[&str] = &["multiplier", "amount", "share", "allocation", "conversion factor"];

/// Fields every correspondence table must provide on both sides
pub const MANDATORY_FIELDS: [Field; 4] = [
    Field::ActivityName,
    Field::ProductName,
    Field::Location,
    Field::Unit,
];

/// Lowercase, treat `_ - ( )` as spaces, collapse whitespace
///
/// "Activity Name - 3.9", "Activity Name (3.9)" and "activity_name_3.9"
/// all become "activity name 3.9".
pub fn normalize_header(header: &str) -> String {
    header
        .to_lowercase()
        .chars()
        .map(|c| if matches!(c, '_' | '-' | '(' | ')') { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Every accepted spelling for one side's field
pub fn field_aliases(side: Side, field: Field, version: &VersionId) -> Vec<String> {
    let mut aliases = Vec::new();
    for label in field_labels(field) {
        for prefix in side.prefixes() {
            aliases.push(format!("{} {}", prefix, label));
        }
        aliases.push(format!("{} {}", label, version));
    }
    aliases
}

struct ColumnMap {
    fields: HashMap<(Side, Field), usize>,
    multiplier: usize,
}

impl ColumnMap {
    fn resolve(
        headers: &StringRecord,
        from_version: &VersionId,
        to_version: &VersionId,
        table: &str,
    ) -> Result<Self> {
        let normalized: Vec<String> = headers.iter().map(normalize_header).collect();
        let find = |aliases: &[String]| {
            aliases
                .iter()
                .find_map(|alias| normalized.iter().position(|h| h == alias))
        };

        let mut fields = HashMap::new();
        for (side, version) in [(Side::From, from_version), (Side::To, to_version)] {
            for field in Field::ALL {
                let aliases = field_aliases(side, field, version);
                match find(aliases.as_slice()) {
                    Some(index) => {
                        fields.insert((side, field), index);
                    }
                    None if MANDATORY_FIELDS.contains(&field) => {
                        return Err(MappingError::MissingColumn {
                            table: table.to_string(),
                            column: format!("{:?} {}", side, field.as_str()).to_lowercase(),
                            tried: aliases.join(", "),
                        });
                    }
                    None => {}
                }
            }
        }

        let multiplier_aliases: Vec<String> =
            MULTIPLIER_LABELS.iter().map(|s| s.to_string()).collect();
        let multiplier = find(multiplier_aliases.as_slice()).ok_or_else(|| MappingError::MissingColumn {
            table: table.to_string(),
            column: "multiplier".to_string(),
            tried: multiplier_aliases.join(", "),
        })?;

        Ok(ColumnMap { fields, multiplier })
    }

    fn record(&self, row: &StringRecord, side: Side) -> EntityRecord {
        Field::ALL
            .iter()
            .fold(EntityRecord::new(), |record, field| {
                match self.fields.get(&(side, *field)).and_then(|&i| row.get(i)) {
                    Some(value) => record.with(*field, value),
                    None => record,
                }
            })
    }
}

// ============================================================================
// LOADING
// ============================================================================

/// Read one correspondence table from CSV
pub fn read_correspondence_table<R: Read>(
    reader: R,
    from_version: VersionId,
    to_version: VersionId,
) -> Result<CorrespondenceTable> {
    let mut table = CorrespondenceTable::new(from_version, to_version);
    let label = table.label();

    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let columns = ColumnMap::resolve(&headers, &table.from_version, &table.to_version, &label)?;
    debug!("Resolved {} columns for {}", columns.fields.len() + 1, label);

    for (line_num, result) in csv_reader.records().enumerate() {
        let line = line_num + 2; // 1-indexed + header row
        let row = result?;

        let multiplier_text = row.get(columns.multiplier).unwrap_or("");
        let multiplier = parse_multiplier(multiplier_text)
            .map_err(|message| MappingError::malformed(format!("{} line {}", label, line), message))?;

        let entry = CorrespondenceRow::new(
            columns.record(&row, Side::From),
            columns.record(&row, Side::To),
            multiplier,
        );
        table.push(entry, line)?;
    }

    info!("Loaded {} rows for {}", table.len(), label);
    Ok(table)
}

// ============================================================================
// TESTS
// ============================================================================
