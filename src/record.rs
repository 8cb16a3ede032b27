// 🧬 Entity Records - Identity-bearing values
// An activity or elementary flow described by a partial set of attributes.
//
// Identity is the VALUE: two records with the same fields are the same record.
// Blank strings never survive construction, so "absent" has one spelling.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

// ============================================================================
// FIELDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Activity or flow identifier
    Code,
    /// Reference product identifier
    ProductCode,
    ActivityName,
    ProductName,
    /// Generic display name
    Name,
    /// Vendor composite name (e.g. "Steel, low-alloyed {RER}| market for | Cut-off, U")
    VendorName,
    Location,
    Unit,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Code,
        Field::ProductCode,
        Field::ActivityName,
        Field::ProductName,
        Field::Name,
        Field::VendorName,
        Field::Location,
        Field::Unit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Code => "code",
            Field::ProductCode => "product_code",
            Field::ActivityName => "activity_name",
            Field::ProductName => "product_name",
            Field::Name => "name",
            Field::VendorName => "vendor_name",
            Field::Location => "location",
            Field::Unit => "unit",
        }
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Blank or whitespace-only strings become `None`; everything else is trimmed
pub fn normalize_value(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Key components are case-folded with internal whitespace collapsed
pub fn normalize_key_component(value: &str) -> Option<String> {
    let folded = value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if folded.is_empty() {
        None
    } else {
        Some(folded)
    }
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(normalize_value))
}

// ============================================================================
// ENTITY RECORD
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    code: Option<String>,

    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    product_code: Option<String>,

    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    activity_name: Option<String>,

    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    product_name: Option<String>,

    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    vendor_name: Option<String>,

    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    location: Option<String>,

    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
}

impl EntityRecord {
    /// Create an empty record (every field absent)
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set any field; blank values leave it absent
    pub fn with(mut self, field: Field, value: impl AsRef<str>) -> Self {
        *self.slot_mut(field) = normalize_value(value.as_ref());
        self
    }

    pub fn with_code(self, value: impl AsRef<str>) -> Self {
        self.with(Field::Code, value)
    }

    pub fn with_product_code(self, value: impl AsRef<str>) -> Self {
        self.with(Field::ProductCode, value)
    }

    pub fn with_activity_name(self, value: impl AsRef<str>) -> Self {
        self.with(Field::ActivityName, value)
    }

    pub fn with_product_name(self, value: impl AsRef<str>) -> Self {
        self.with(Field::ProductName, value)
    }

    pub fn with_name(self, value: impl AsRef<str>) -> Self {
        self.with(Field::Name, value)
    }

    pub fn with_vendor_name(self, value: impl AsRef<str>) -> Self {
        self.with(Field::VendorName, value)
    }

    pub fn with_location(self, value: impl AsRef<str>) -> Self {
        self.with(Field::Location, value)
    }

    pub fn with_unit(self, value: impl AsRef<str>) -> Self {
        self.with(Field::Unit, value)
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        let slot = match field {
            Field::Code => &self.code,
            Field::ProductCode => &self.product_code,
            Field::ActivityName => &self.activity_name,
            Field::ProductName => &self.product_name,
            Field::Name => &self.name,
            Field::VendorName => &self.vendor_name,
            Field::Location => &self.location,
            Field::Unit => &self.unit,
        };
        slot.as_deref()
    }

    fn slot_mut(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Code => &mut self.code,
            Field::ProductCode => &mut self.product_code,
            Field::ActivityName => &mut self.activity_name,
            Field::ProductName => &mut self.product_name,
            Field::Name => &mut self.name,
            Field::VendorName => &mut self.vendor_name,
            Field::Location => &mut self.location,
            Field::Unit => &mut self.unit,
        }
    }

    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_none())
    }

    /// Fields present on this record, in declaration order
    pub fn present_fields(&self) -> Vec<Field> {
        Field::ALL
            .iter()
            .copied()
            .filter(|f| self.get(*f).is_some())
            .collect()
    }

    /// Fill every absent field from `source`
    ///
    /// Used for analyst overrides: an override that only sets `location`
    /// inherits name, unit, codes... from the record it overrides.
    pub fn fill_from(&self, source: &EntityRecord) -> EntityRecord {
        let mut filled = self.clone();
        for field in Field::ALL {
            if filled.get(field).is_none() {
                *filled.slot_mut(field) = source.get(field).map(str::to_string);
            }
        }
        filled
    }
}

impl fmt::Display for EntityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = Field::ALL
            .iter()
            .filter_map(|field| self.get(*field).map(|v| format!("{}={}", field.as_str(), v)))
            .collect();

        if parts.is_empty() {
            write!(f, "{{}}")
        } else {
            write!(f, "{{{}}}", parts.join(", "))
        }
    }
}

// ============================================================================
// PAYLOADS & FAN-OUT
// ============================================================================

/// What a registration points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// Another entity record, which can be resolved further
    Record(EntityRecord),
    /// A row owned by an external system, passed through untouched
    Opaque(serde_json::Value),
}

impl Payload {
    pub fn as_record(&self) -> Option<&EntityRecord> {
        match self {
            Payload::Record(record) => Some(record),
            Payload::Opaque(_) => None,
        }
    }
}

impl From<EntityRecord> for Payload {
    fn from(record: EntityRecord) -> Self {
        Payload::Record(record)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Opaque(value)
    }
}

pub const DEFAULT_MULTIPLIER: f64 = 1.0;

/// One (target, multiplier) pair of a fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub payload: Payload,
    pub multiplier: f64,
}

impl Target {
    pub fn new(payload: Payload, multiplier: f64) -> Self {
        Target { payload, multiplier }
    }
}

pub fn multiplier_sum(fan_out: &[Target]) -> f64 {
    fan_out.iter().map(|t| t.multiplier).sum()
}

// ============================================================================
// KEY TUPLES
// ============================================================================

/// Normalized lookup key produced by a key rule
///
/// Only complete tuples exist: a projection with any absent component
/// yields no tuple at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyTuple(Vec<String>);

impl KeyTuple {
    pub fn from_components<I, S>(components: I) -> Option<Self>
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        let mut parts = Vec::new();
        for component in components {
            parts.push(normalize_key_component(component?.as_ref())?);
        }

        if parts.is_empty() {
            None
        } else {
            Some(KeyTuple(parts))
        }
    }

    /// Project `fields` out of `record`
    pub fn project(record: &EntityRecord, fields: &[Field]) -> Option<Self> {
        Self::from_components(fields.iter().map(|f| record.get(*f)))
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(" | "))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_values_are_absent() {
        let record = EntityRecord::new()
            .with_name("   ")
            .with_unit(" kg ")
            .with_location("");

        assert_eq!(record.get(Field::Name), None);
        assert_eq!(record.get(Field::Location), None);
        assert_eq!(record.get(Field::Unit), Some("kg"));
    }

    #[test]
    fn test_equality_is_by_value() {
        let a = EntityRecord::new().with_code("A1").with_unit("kg");
        let b = EntityRecord::new().with_unit("kg").with_code(" A1");
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_deserialize_normalizes_blanks() {
        let record: EntityRecord =
            serde_json::from_str(r#"{"name": "  ", "unit": "kg", "location": null}"#).unwrap();

        assert_eq!(record, EntityRecord::new().with_unit("kg"));
    }

    #[test]
    fn test_fill_from_keeps_override_fields() {
        let source = EntityRecord::new()
            .with_name("electricity")
            .with_location("DE")
            .with_unit("kWh");
        let override_ = EntityRecord::new().with_location("RER");

        let filled = override_.fill_from(&source);

        assert_eq!(filled.get(Field::Location), Some("RER"));
        assert_eq!(filled.get(Field::Name), Some("electricity"));
        assert_eq!(filled.get(Field::Unit), Some("kWh"));
    }

    #[test]
    fn test_key_tuple_requires_every_component() {
        let record = EntityRecord::new().with_name("Steel").with_unit("KG");

        let key = KeyTuple::project(&record, &[Field::Name, Field::Unit]).unwrap();
        assert_eq!(key.components(), &["steel".to_string(), "kg".to_string()]);

        assert!(KeyTuple::project(&record, &[Field::Name, Field::Location]).is_none());
    }

    #[test]
    fn test_key_component_collapses_whitespace() {
        assert_eq!(
            normalize_key_component("  Market   for  Steel "),
            Some("market for steel".to_string())
        );
        assert_eq!(normalize_key_component(" \t "), None);
    }

    #[test]
    fn test_payload_serialization_is_tagged() {
        let payload = Payload::Opaque(serde_json::json!({"result": "X"}));
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["kind"], "opaque");
        assert_eq!(json["value"]["result"], "X");

        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_display_lists_present_fields() {
        let record = EntityRecord::new().with_code("A1").with_unit("kg");
        assert_eq!(record.to_string(), "{code=A1, unit=kg}");
        assert_eq!(EntityRecord::new().to_string(), "{}");
    }
}
