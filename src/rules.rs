// 🏷️ Key Rules - Matching policy as an ordered catalog
// Each rule projects a record onto a lookup key; catalog order is priority order

use crate::config::EngineConfig;
use crate::record::{normalize_key_component, EntityRecord, Field, KeyTuple};

// ============================================================================
// RULE DEFINITION
// ============================================================================

/// A pure projection from a record to its candidate lookup keys
///
/// Candidates are returned in preference order. The first candidate is the
/// record's own spelling and is the one used when the record is indexed as a
/// registration source.
pub trait KeyRule: Send + Sync {
    /// Rule ID for tracking which rule produced a match
    fn id(&self) -> &str;

    /// Every complete key tuple this rule can build for `record`
    fn candidates(&self, record: &EntityRecord) -> Vec<KeyTuple>;

    /// Key under which a registration source is indexed
    fn index_key(&self, record: &EntityRecord) -> Option<KeyTuple> {
        self.candidates(record).into_iter().next()
    }
}

// ============================================================================
// FIELD PROJECTION
// ============================================================================

/// Exact projection onto a fixed list of fields
#[derive(Debug, Clone)]
pub struct FieldProjection {
    id: String,
    fields: Vec<Field>,
}

impl FieldProjection {
    pub fn new(id: impl Into<String>, fields: &[Field]) -> Self {
        FieldProjection {
            id: id.into(),
            fields: fields.to_vec(),
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

impl KeyRule for FieldProjection {
    fn id(&self) -> &str {
        &self.id
    }

    fn candidates(&self, record: &EntityRecord) -> Vec<KeyTuple> {
        KeyTuple::project(record, &self.fields).into_iter().collect()
    }
}

// ============================================================================
// SPELLING VARIANTS
// ============================================================================

/// Projection that also tries every known alternative spelling
///
/// Each group lists spellings of one concept ("kg", "kilogram"). A field
/// value found in a group expands to itself followed by the rest of the
/// group; candidates are the cross product over all fields, first field
/// varying slowest, so the literal spelling always comes first.
#[derive(Debug, Clone)]
pub struct SpellingVariants {
    id: String,
    fields: Vec<Field>,
    groups: Vec<Vec<String>>,
}

impl SpellingVariants {
    pub fn new(id: impl Into<String>, fields: &[Field], groups: &[Vec<String>]) -> Self {
        let groups = groups
            .iter()
            .map(|group| {
                let mut normalized: Vec<String> = Vec::new();
                for spelling in group.iter().filter_map(|s| normalize_key_component(s)) {
                    if !normalized.contains(&spelling) {
                        normalized.push(spelling);
                    }
                }
                normalized
            })
            .filter(|group| group.len() > 1)
            .collect();

        SpellingVariants {
            id: id.into(),
            fields: fields.to_vec(),
            groups,
        }
    }

    fn variants_of(&self, value: &str) -> Vec<String> {
        let mut variants = vec![value.to_string()];
        for group in &self.groups {
            if group.iter().any(|s| s == value) {
                for spelling in group {
                    if !variants.contains(spelling) {
                        variants.push(spelling.clone());
                    }
                }
            }
        }
        variants
    }
}

impl KeyRule for SpellingVariants {
    fn id(&self) -> &str {
        &self.id
    }

    fn candidates(&self, record: &EntityRecord) -> Vec<KeyTuple> {
        let Some(literal) = KeyTuple::project(record, &self.fields) else {
            return Vec::new();
        };

        let mut partials: Vec<Vec<String>> = vec![Vec::new()];
        for component in literal.components() {
            let variants = self.variants_of(component);
            let mut extended = Vec::with_capacity(partials.len() * variants.len());
            for partial in &partials {
                for variant in &variants {
                    let mut next = partial.clone();
                    next.push(variant.clone());
                    extended.push(next);
                }
            }
            partials = extended;
        }

        partials
            .into_iter()
            .filter_map(|parts| KeyTuple::from_components(parts.iter().map(Some)))
            .collect()
    }
}

// ============================================================================
// RULE CATALOG
// ============================================================================

/// Ordered list of key rules; first accepted rule wins
pub struct RuleCatalog {
    rules: Vec<Box<dyn KeyRule>>,
}

impl RuleCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        RuleCatalog { rules: Vec::new() }
    }

    /// The standard catalog: identifiers first, then names of decreasing
    /// specificity, then spelling-tolerant name keys
    pub fn default_catalog(config: &EngineConfig) -> Self {
        let variants = &config.spelling_variants;

        RuleCatalog::new()
            .with_rule(FieldProjection::new("code_pair", &[Field::Code, Field::ProductCode]))
            .with_rule(FieldProjection::new("code_unit", &[Field::Code, Field::Unit]))
            .with_rule(FieldProjection::new(
                "vendor_name_unit",
                &[Field::VendorName, Field::Unit],
            ))
            .with_rule(FieldProjection::new(
                "activity_product_location_unit",
                &[
                    Field::ActivityName,
                    Field::ProductName,
                    Field::Location,
                    Field::Unit,
                ],
            ))
            .with_rule(FieldProjection::new(
                "name_location_unit",
                &[Field::Name, Field::Location, Field::Unit],
            ))
            .with_rule(FieldProjection::new("name_unit", &[Field::Name, Field::Unit]))
            .with_rule(SpellingVariants::new(
                "name_location_unit_variants",
                &[Field::Name, Field::Location, Field::Unit],
                variants,
            ))
            .with_rule(SpellingVariants::new(
                "name_unit_variants",
                &[Field::Name, Field::Unit],
                variants,
            ))
    }

    /// Builder: append a rule at lowest priority
    pub fn with_rule(mut self, rule: impl KeyRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn get(&self, index: usize) -> Option<&dyn KeyRule> {
        self.rules.get(index).map(|r| r.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn KeyRule> {
        self.rules.iter().map(|r| r.as_ref())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Get number of rules loaded
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleCatalog {
    fn default() -> Self {
        Self::default_catalog(&EngineConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
