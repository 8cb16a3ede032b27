// ⚙️ Engine Configuration - Tunables as data
// Loaded from JSON; every field has a default so partial files are fine

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// SIMILARITY SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Target views kept per query view
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Minimum score for a proposal (0.0 - 1.0)
    #[serde(default = "default_cutoff")]
    pub cutoff: f32,

    /// Minimum rank-1 score for promotion to a synonym pair
    #[serde(default = "default_synonym_cutoff")]
    pub synonym_cutoff: f32,

    /// Distinct oracle batches remembered by one matcher
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_top_n() -> usize {
    3
}

fn default_cutoff() -> f32 {
    0.95
}

fn default_synonym_cutoff() -> f32 {
    0.98
}

fn default_cache_capacity() -> usize {
    64
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        SimilarityConfig {
            top_n: default_top_n(),
            cutoff: default_cutoff(),
            synonym_cutoff: default_synonym_cutoff(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Allowed deviation from 1.0 when a fan-out must be a complete partition
    #[serde(default = "default_sum_tolerance")]
    pub sum_tolerance: f64,

    #[serde(default)]
    pub similarity: SimilarityConfig,

    /// Groups of equivalent spellings for the variant key rules
    #[serde(default = "default_spelling_variants")]
    pub spelling_variants: Vec<Vec<String>>,
}

fn default_sum_tolerance() -> f64 {
    0.001
}

fn default_spelling_variants() -> Vec<Vec<String>> {
    let groups: &[&[&str]] = &[
        &["kg", "kilogram"],
        &["g", "gram"],
        &["t", "ton", "tonne", "metric ton"],
        &["m3", "cubic meter", "cubic metre"],
        &["m2", "square meter", "square metre"],
        &["kwh", "kilowatt hour"],
        &["mj", "megajoule"],
        &["tkm", "ton kilometer", "tonne kilometre"],
        &["unit", "item", "p"],
        &["glo", "global"],
        &["row", "rest-of-world", "rest of world"],
    ];

    groups
        .iter()
        .map(|group| group.iter().map(|s| s.to_string()).collect())
        .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sum_tolerance: default_sum_tolerance(),
            similarity: SimilarityConfig::default(),
            spelling_variants: default_spelling_variants(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_json(&content)
            .with_context(|| format!("Invalid config file: {:?}", path.as_ref()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(content).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..0.5).contains(&self.sum_tolerance) {
            bail!("sum_tolerance must be in [0, 0.5), got {}", self.sum_tolerance);
        }
        if self.similarity.top_n == 0 {
            bail!("similarity.top_n must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.similarity.cutoff) {
            bail!("similarity.cutoff must be in [0, 1], got {}", self.similarity.cutoff);
        }
        if !(0.0..=1.0).contains(&self.similarity.synonym_cutoff) {
            bail!(
                "similarity.synonym_cutoff must be in [0, 1], got {}",
                self.similarity.synonym_cutoff
            );
        }
        if self.similarity.synonym_cutoff < self.similarity.cutoff {
            bail!("similarity.synonym_cutoff must not be below similarity.cutoff");
        }
        if self.similarity.cache_capacity == 0 {
            bail!("similarity.cache_capacity must be at least 1");
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
