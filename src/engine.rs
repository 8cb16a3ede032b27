// 🧭 Mapping Engine - Layered resolution across the four mapping-sources
//
// direct → custom → correspondence → similarity, first non-empty layer wins.
// Every layer except direct is two-step: its own table yields intermediate
// records, each of which must then resolve through direct. Multipliers of
// the two steps multiply.

use crate::config::EngineConfig;
use crate::correspondence::{CorrespondenceTable, VersionId};
use crate::error::Result;
use crate::interlink::{ChainInterlinker, InterlinkReport};
use crate::mapping_table::{MappingSource, MappingSourceKind};
use crate::record::{EntityRecord, Payload, Target};
use crate::resolver::{LookupPass, Resolver};
use crate::rules::RuleCatalog;
use crate::similarity::{promote_synonyms, SimilarityMatcher, SimilarityOracle, SimilarityProposal, SynonymPair};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

// ============================================================================
// RESOLUTION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedMapping {
    pub source: MappingSourceKind,
    /// Rule that matched in the layer's own table
    pub rule_id: String,
    pub pass: LookupPass,
    /// Leaf payloads with effective multipliers, in registration order
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Matched(MatchedMapping),
    NoMatch,
}

impl Resolution {
    pub fn is_match(&self) -> bool {
        matches!(self, Resolution::Matched(_))
    }

    pub fn matched(&self) -> Option<&MatchedMapping> {
        match self {
            Resolution::Matched(m) => Some(m),
            Resolution::NoMatch => None,
        }
    }

    /// Leaf targets, empty for no match
    pub fn targets(&self) -> &[Target] {
        self.matched().map(|m| m.targets.as_slice()).unwrap_or(&[])
    }

    pub fn source(&self) -> Option<MappingSourceKind> {
        self.matched().map(|m| m.source)
    }
}

/// Registrations added by one similarity linking run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimilarityLinkSummary {
    pub proposals: usize,
    pub similarity_registered: usize,
    pub synonyms_registered: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct MappingEngine {
    config: EngineConfig,
    catalog: RuleCatalog,
    sources: Vec<MappingSource>,
    chains: ChainInterlinker,
}

fn slot(kind: MappingSourceKind) -> usize {
    match kind {
        MappingSourceKind::Direct => 0,
        MappingSourceKind::Custom => 1,
        MappingSourceKind::Correspondence => 2,
        MappingSourceKind::Similarity => 3,
    }
}

impl MappingEngine {
    /// Engine with the default rule catalog built from `config`
    pub fn new(config: EngineConfig) -> Self {
        let catalog = RuleCatalog::default_catalog(&config);
        Self::with_catalog(config, catalog)
    }

    pub fn with_catalog(config: EngineConfig, catalog: RuleCatalog) -> Self {
        let sources = MappingSourceKind::PRIORITY
            .iter()
            .map(|kind| MappingSource::new(*kind, catalog.len()))
            .collect();

        MappingEngine {
            config,
            catalog,
            sources,
            chains: ChainInterlinker::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn mapping_source(&self, kind: MappingSourceKind) -> &MappingSource {
        &self.sources[slot(kind)]
    }

    pub fn interlinker(&self) -> &ChainInterlinker {
        &self.chains
    }

    pub fn registration_count(&self) -> usize {
        self.sources.iter().map(|s| s.registrations().len()).sum()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register `source → target` in one mapping-source
    ///
    /// Absent multiplier means 1.0. Invalidates only that mapping-source's
    /// derived tables.
    pub fn register(
        &mut self,
        kind: MappingSourceKind,
        source: EntityRecord,
        target: impl Into<Payload>,
        multiplier: Option<f64>,
    ) -> Result<()> {
        self.sources[slot(kind)].register(source, target.into(), multiplier)
    }

    /// Analyst override: fields left unset on `replacement` come from the query
    pub fn register_custom_override(&mut self, source: EntityRecord, replacement: EntityRecord) -> Result<()> {
        self.register(MappingSourceKind::Custom, source, replacement, None)
    }

    fn is_registered(&self, kind: MappingSourceKind, source: &EntityRecord, target: &EntityRecord) -> bool {
        self.mapping_source(kind)
            .fan_out_of(source)
            .map(|fan_out| fan_out.iter().any(|t| t.payload.as_record() == Some(target)))
            .unwrap_or(false)
    }

    /// Build every table now so later resolution never writes
    pub fn prepare(&self) {
        for source in &self.sources {
            source.prepare(&self.catalog);
        }
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    fn resolver(&self) -> Resolver<'_> {
        Resolver::with_tolerance(&self.catalog, self.config.sum_tolerance)
    }

    /// Resolve through one layer only
    pub fn resolve_in(&self, kind: MappingSourceKind, query: &EntityRecord) -> Resolution {
        let resolver = self.resolver();

        let Some(step_one) = resolver.resolve(self.mapping_source(kind), query, kind.requires_sum_to_one()) else {
            return Resolution::NoMatch;
        };

        let targets = if kind == MappingSourceKind::Direct {
            step_one.fan_out
        } else {
            let direct = self.mapping_source(MappingSourceKind::Direct);
            let mut leaves = Vec::new();

            for intermediate in &step_one.fan_out {
                let Some(record) = intermediate.payload.as_record() else {
                    debug!("{} intermediate for {} is opaque; cannot re-resolve", kind, query);
                    return Resolution::NoMatch;
                };
                let record = match kind {
                    MappingSourceKind::Custom => record.fill_from(query),
                    _ => record.clone(),
                };

                // All intermediates resolve or the whole query is no match
                let Some(step_two) = resolver.resolve(direct, &record, false) else {
                    debug!("{} intermediate {} for {} has no direct match", kind, record, query);
                    return Resolution::NoMatch;
                };

                leaves.extend(
                    step_two
                        .fan_out
                        .into_iter()
                        .map(|leaf| Target::new(leaf.payload, intermediate.multiplier * leaf.multiplier)),
                );
            }
            leaves
        };

        Resolution::Matched(MatchedMapping {
            source: kind,
            rule_id: step_one.rule_id,
            pass: step_one.pass,
            targets,
        })
    }

    /// First layer in priority order that yields targets
    pub fn resolve(&self, query: &EntityRecord) -> Resolution {
        for kind in MappingSourceKind::PRIORITY {
            let resolution = self.resolve_in(kind, query);
            if !resolution.targets().is_empty() {
                return resolution;
            }
        }
        Resolution::NoMatch
    }

    pub fn resolve_batch(&self, queries: &[EntityRecord]) -> Vec<Resolution> {
        let resolutions: Vec<Resolution> = queries.iter().map(|q| self.resolve(q)).collect();

        let matched = resolutions.iter().filter(|r| r.is_match()).count();
        info!("Resolved {}/{} queries", matched, queries.len());
        resolutions
    }

    // ------------------------------------------------------------------------
    // Correspondence chains
    // ------------------------------------------------------------------------

    pub fn add_correspondence_table(&mut self, table: CorrespondenceTable) -> Result<usize> {
        self.chains.add_table(table)
    }

    pub fn load_correspondence_table<R: Read>(
        &mut self,
        reader: R,
        from_version: VersionId,
        to_version: VersionId,
    ) -> Result<usize> {
        self.chains.load_table(reader, from_version, to_version)
    }

    pub fn load_correspondence_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        from_version: VersionId,
        to_version: VersionId,
    ) -> Result<usize> {
        self.chains.load_table_file(path, from_version, to_version)
    }

    pub fn interlink(&self, from: &VersionId, to: &VersionId) -> Result<InterlinkReport> {
        self.chains.interlink(from, to)
    }

    /// Register each interlinked chain as origin → final identity
    ///
    /// Chains already registered are skipped, so relinking the same versions
    /// keeps each fan-out summing to one.
    pub fn register_interlinked(&mut self, report: &InterlinkReport) -> Result<usize> {
        let mut registered = 0;
        for chain in &report.interlinked {
            let (Some(origin), Some(reached)) = (&chain.origin, &chain.current) else {
                continue;
            };
            if self.is_registered(MappingSourceKind::Correspondence, origin, reached) {
                debug!("Chain {:?} -> {:?} already registered", origin, reached);
                continue;
            }
            self.register(
                MappingSourceKind::Correspondence,
                origin.clone(),
                reached.clone(),
                Some(chain.multiplier),
            )?;
            registered += 1;
        }

        info!(
            "Registered {} correspondence chains {} -> {}",
            registered, report.from_version, report.to_version
        );
        Ok(registered)
    }

    /// Interlink and register in one step
    pub fn link_versions(&mut self, from: &VersionId, to: &VersionId) -> Result<InterlinkReport> {
        let report = self.interlink(from, to)?;
        self.register_interlinked(&report)?;
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Similarity
    // ------------------------------------------------------------------------

    /// Register the best-scoring proposal per query record, multiplier 1.0
    pub fn register_similarity(&mut self, proposals: &[SimilarityProposal]) -> Result<usize> {
        let mut best: Vec<&SimilarityProposal> = Vec::new();
        let mut position: HashMap<&EntityRecord, usize> = HashMap::new();

        for proposal in proposals {
            match position.get(&proposal.query) {
                Some(&i) if proposal.score > best[i].score => best[i] = proposal,
                Some(_) => {}
                None => {
                    position.insert(&proposal.query, best.len());
                    best.push(proposal);
                }
            }
        }

        let mut registered = 0;
        for proposal in best {
            if self.is_registered(MappingSourceKind::Similarity, &proposal.query, &proposal.target) {
                continue;
            }
            self.register(
                MappingSourceKind::Similarity,
                proposal.query.clone(),
                proposal.target.clone(),
                Some(1.0),
            )?;
            registered += 1;
        }
        Ok(registered)
    }

    /// Register each pair both ways in the custom layer
    pub fn register_synonyms(&mut self, pairs: &[SynonymPair]) -> Result<usize> {
        let mut registered = 0;
        for pair in pairs {
            for (source, target) in [(&pair.left, &pair.right), (&pair.right, &pair.left)] {
                if self.is_registered(MappingSourceKind::Custom, source, target) {
                    continue;
                }
                self.register(MappingSourceKind::Custom, source.clone(), target.clone(), Some(1.0))?;
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Propose with configured top-N and cutoff, then register proposals
    /// and promoted synonyms
    pub fn link_by_similarity<O: SimilarityOracle>(
        &mut self,
        matcher: &mut SimilarityMatcher<O>,
        query_pool: &[EntityRecord],
        target_pool: &[EntityRecord],
    ) -> Result<SimilarityLinkSummary> {
        let proposals = matcher.propose(query_pool, target_pool, &self.config.similarity)?;
        let synonyms = promote_synonyms(&proposals, self.config.similarity.synonym_cutoff);

        Ok(SimilarityLinkSummary {
            proposals: proposals.len(),
            similarity_registered: self.register_similarity(&proposals)?,
            synonyms_registered: self.register_synonyms(&synonyms)?,
        })
    }
}

impl Default for MappingEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
