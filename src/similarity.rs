// 🧲 Similarity Oracle - Last-resort matching by embedding similarity
//
// Records are projected into short text views, both pools are embedded in
// one batch each, and every query view is ranked against every target view.
// The result is a proposal list; nothing is registered from here.

use crate::config::SimilarityConfig;
use crate::error::{MappingError, Result};
use crate::record::{EntityRecord, Field};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, trace};

/// Embedding vector type
pub type Embedding = Vec<f32>;

// ============================================================================
// ORACLE SEAMS
// ============================================================================

/// Batch text embedding backend
pub trait Embedder: Send + Sync {
    /// Embed every text; output order matches input order
    fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Embedding>>;

    /// Model identifier, part of the batch fingerprint
    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;
}

/// One ranked target for a query text
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scored {
    /// Index into the target batch
    pub index: usize,
    /// Similarity in [0, 1]
    pub score: f32,
}

/// Black-box batch similarity backend
///
/// Returns, per query, up to `top_n` targets ordered by descending score.
pub trait SimilarityOracle: Send + Sync {
    fn rank(&self, queries: &[String], targets: &[String], top_n: usize) -> anyhow::Result<Vec<Vec<Scored>>>;

    fn name(&self) -> &str;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Oracle built from any embedder plus cosine similarity
pub struct EmbeddingOracle<E: Embedder> {
    embedder: E,
}

impl<E: Embedder> EmbeddingOracle<E> {
    pub fn new(embedder: E) -> Self {
        EmbeddingOracle { embedder }
    }
}

impl<E: Embedder> SimilarityOracle for EmbeddingOracle<E> {
    fn rank(&self, queries: &[String], targets: &[String], top_n: usize) -> anyhow::Result<Vec<Vec<Scored>>> {
        let query_refs: Vec<&str> = queries.iter().map(String::as_str).collect();
        let target_refs: Vec<&str> = targets.iter().map(String::as_str).collect();

        let query_vecs = self.embedder.embed_batch(&query_refs)?;
        let target_vecs = self.embedder.embed_batch(&target_refs)?;
        if query_vecs.len() != queries.len() || target_vecs.len() != targets.len() {
            anyhow::bail!(
                "{} returned {} + {} embeddings for {} + {} texts",
                self.embedder.model_name(),
                query_vecs.len(),
                target_vecs.len(),
                queries.len(),
                targets.len()
            );
        }

        Ok(query_vecs
            .iter()
            .map(|q| {
                let mut scored: Vec<Scored> = target_vecs
                    .iter()
                    .enumerate()
                    .map(|(index, t)| Scored {
                        index,
                        score: cosine_similarity(q, t),
                    })
                    .collect();
                // Stable: equal scores keep target order
                scored.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                scored.truncate(top_n);
                scored
            })
            .collect())
    }

    fn name(&self) -> &str {
        self.embedder.model_name()
    }
}

// ============================================================================
// HASHING EMBEDDER
// ============================================================================

/// Feature-hashing embedder: word tokens plus character trigrams
///
/// Needs no model files. Good enough to catch case, punctuation and small
/// spelling differences; not a semantic model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        HashingEmbedder {
            dimension: dimension.max(1),
        }
    }

    fn features(text: &str) -> Vec<String> {
        let folded = text.to_lowercase();

        let mut features: Vec<String> = folded
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| format!("w:{}", t))
            .collect();

        let padded: Vec<char> = format!(" {} ", folded.split_whitespace().collect::<Vec<_>>().join(" "))
            .chars()
            .collect();
        for window in padded.windows(3) {
            features.push(format!("c:{}", window.iter().collect::<String>()));
        }

        features
    }

    fn embed_one(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];

        for feature in Self::features(text) {
            let digest = Sha256::digest(feature.as_bytes());
            let bucket = digest[..8]
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[(bucket % self.dimension as u64) as usize] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Embedding>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// TEXT VIEWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    VendorNameUnit,
    NameLocationUnit,
    ActivityProductLocationUnit,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [
        ViewKind::VendorNameUnit,
        ViewKind::NameLocationUnit,
        ViewKind::ActivityProductLocationUnit,
    ];

    pub fn fields(&self) -> &'static [Field] {
        match self {
            ViewKind::VendorNameUnit => &[Field::VendorName, Field::Unit],
            ViewKind::NameLocationUnit => &[Field::Name, Field::Location, Field::Unit],
            ViewKind::ActivityProductLocationUnit => &[
                Field::ActivityName,
                Field::ProductName,
                Field::Location,
                Field::Unit,
            ],
        }
    }
}

/// Every view whose fields are all present on `record`
pub fn project_views(record: &EntityRecord) -> Vec<(ViewKind, String)> {
    ViewKind::ALL
        .iter()
        .filter_map(|kind| {
            let parts: Option<Vec<&str>> = kind.fields().iter().map(|f| record.get(*f)).collect();
            parts.map(|parts| (*kind, parts.join(" | ")))
        })
        .collect()
}

struct PoolView<'a> {
    record: &'a EntityRecord,
    kind: ViewKind,
    text: String,
}

fn pool_views(pool: &[EntityRecord]) -> Vec<PoolView<'_>> {
    pool.iter()
        .flat_map(|record| {
            project_views(record)
                .into_iter()
                .map(move |(kind, text)| PoolView { record, kind, text })
        })
        .collect()
}

// ============================================================================
// PROPOSALS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityProposal {
    pub query: EntityRecord,
    pub query_view: String,
    pub query_view_kind: ViewKind,
    pub target: EntityRecord,
    pub target_view: String,
    pub target_view_kind: ViewKind,
    pub score: f32,
    /// 1-based rank among this query view's targets
    pub rank: usize,
}

/// High-confidence equivalence, usable in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynonymPair {
    pub left: EntityRecord,
    pub right: EntityRecord,
    pub score: f32,
}

/// Keep rank-1 proposals scoring at least `threshold`, one pair per record pair
pub fn promote_synonyms(proposals: &[SimilarityProposal], threshold: f32) -> Vec<SynonymPair> {
    let mut seen = HashSet::new();

    proposals
        .iter()
        .filter(|p| p.rank == 1 && p.score >= threshold)
        .filter(|p| p.query != p.target)
        .filter(|p| seen.insert((p.query.clone(), p.target.clone())))
        .map(|p| SynonymPair {
            left: p.query.clone(),
            right: p.target.clone(),
            score: p.score,
        })
        .collect()
}

// ============================================================================
// MATCHER
// ============================================================================

/// Runs an oracle over record pools, once per distinct batch
///
/// Rankings are remembered for the most recent `cache_capacity` batches;
/// older ones are evicted first-in, first-out.
pub struct SimilarityMatcher<O: SimilarityOracle> {
    oracle: O,
    cache: HashMap<String, Vec<Vec<Scored>>>,
    /// Fingerprints in insertion order
    cached_order: VecDeque<String>,
    cache_capacity: usize,
    oracle_calls: usize,
}

impl<O: SimilarityOracle> SimilarityMatcher<O> {
    pub fn new(oracle: O) -> Self {
        SimilarityMatcher {
            oracle,
            cache: HashMap::new(),
            cached_order: VecDeque::new(),
            cache_capacity: SimilarityConfig::default().cache_capacity,
            oracle_calls: 0,
        }
    }

    /// Capacity below one is raised to one
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self.evict_to_capacity();
        self
    }

    pub fn from_config(oracle: O, config: &SimilarityConfig) -> Self {
        Self::new(oracle).with_cache_capacity(config.cache_capacity)
    }

    /// Batches currently remembered
    pub fn cached_batches(&self) -> usize {
        self.cache.len()
    }

    fn evict_to_capacity(&mut self) {
        while self.cached_order.len() > self.cache_capacity {
            if let Some(oldest) = self.cached_order.pop_front() {
                trace!("Evicting cached ranking {}", &oldest[..12]);
                self.cache.remove(&oldest);
            }
        }
    }

    /// Number of batches actually sent to the oracle
    pub fn oracle_calls(&self) -> usize {
        self.oracle_calls
    }

    fn fingerprint(&self, queries: &[String], targets: &[String], top_n: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.oracle.name().as_bytes());
        hasher.update(top_n.to_le_bytes());
        for text in queries {
            hasher.update(b"q\x1f");
            hasher.update(text.as_bytes());
        }
        for text in targets {
            hasher.update(b"t\x1f");
            hasher.update(text.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    fn ranked(&mut self, queries: &[String], targets: &[String], top_n: usize) -> Result<&Vec<Vec<Scored>>> {
        let key = self.fingerprint(queries, targets, top_n);

        if !self.cache.contains_key(&key) {
            let ranked = self
                .oracle
                .rank(queries, targets, top_n)
                .map_err(|e| MappingError::Oracle(format!("{:#}", e)))?;
            self.oracle_calls += 1;

            if ranked.len() != queries.len() {
                return Err(MappingError::Oracle(format!(
                    "{} ranked {} of {} queries",
                    self.oracle.name(),
                    ranked.len(),
                    queries.len()
                )));
            }
            if let Some(bad) = ranked.iter().flatten().find(|s| s.index >= targets.len()) {
                return Err(MappingError::Oracle(format!(
                    "{} returned target index {} for a batch of {}",
                    self.oracle.name(),
                    bad.index,
                    targets.len()
                )));
            }

            debug!(
                "Oracle {} ranked {} query views against {} target views",
                self.oracle.name(),
                queries.len(),
                targets.len()
            );
            self.cache.insert(key.clone(), ranked);
            self.cached_order.push_back(key.clone());
            self.evict_to_capacity();
        }

        self.cache
            .get(&key)
            .ok_or_else(|| MappingError::Oracle("ranking cache lost a batch".to_string()))
    }

    /// Pure proposal list, ordered by query view then rank
    pub fn propose_similarity_candidates(
        &mut self,
        query_pool: &[EntityRecord],
        target_pool: &[EntityRecord],
        top_n: usize,
        cutoff: f32,
    ) -> Result<Vec<SimilarityProposal>> {
        let query_views = pool_views(query_pool);
        let target_views = pool_views(target_pool);
        if query_views.is_empty() || target_views.is_empty() || top_n == 0 {
            return Ok(Vec::new());
        }

        let query_texts: Vec<String> = query_views.iter().map(|v| v.text.clone()).collect();
        let target_texts: Vec<String> = target_views.iter().map(|v| v.text.clone()).collect();
        let ranked = self.ranked(&query_texts, &target_texts, top_n)?;

        let mut proposals = Vec::new();
        for (query, targets) in query_views.iter().zip(ranked) {
            for (position, scored) in targets.iter().take(top_n).enumerate() {
                if scored.score < cutoff {
                    continue;
                }
                let target = &target_views[scored.index];
                proposals.push(SimilarityProposal {
                    query: query.record.clone(),
                    query_view: query.text.clone(),
                    query_view_kind: query.kind,
                    target: target.record.clone(),
                    target_view: target.text.clone(),
                    target_view_kind: target.kind,
                    score: scored.score,
                    rank: position + 1,
                });
            }
        }

        info!(
            "Similarity proposals: {} from {} query views x {} target views (cutoff {})",
            proposals.len(),
            query_views.len(),
            target_views.len(),
            cutoff
        );
        Ok(proposals)
    }

    /// Proposals with top-N and cutoff from configuration
    pub fn propose(
        &mut self,
        query_pool: &[EntityRecord],
        target_pool: &[EntityRecord],
        config: &SimilarityConfig,
    ) -> Result<Vec<SimilarityProposal>> {
        self.propose_similarity_candidates(query_pool, target_pool, config.top_n, config.cutoff)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> SimilarityMatcher<EmbeddingOracle<HashingEmbedder>> {
        SimilarityMatcher::new(EmbeddingOracle::new(HashingEmbedder::default()))
    }

    fn flow(name: &str, unit: &str) -> EntityRecord {
        EntityRecord::new()
            .with_name(name)
            .with_location("GLO")
            .with_unit(unit)
    }

    struct FailingOracle;

    impl SimilarityOracle for FailingOracle {
        fn rank(&self, _: &[String], _: &[String], _: usize) -> anyhow::Result<Vec<Vec<Scored>>> {
            anyhow::bail!("backend unavailable")
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::default();
        let vecs = embedder
            .embed_batch(&["Carbon dioxide, fossil", "carbon dioxide, fossil", "Water"])
            .unwrap();

        assert_eq!(vecs[0].len(), 256);
        assert_eq!(vecs[0], vecs[1]);
        assert!(cosine_similarity(&vecs[0], &vecs[2]) < 0.5);
    }

    #[test]
    fn test_project_views_requires_complete_fields() {
        let record = EntityRecord::new()
            .with_name("Methane")
            .with_location("GLO")
            .with_unit("kg")
            .with_vendor_name("Methane, fossil");

        let views = project_views(&record);

        assert_eq!(views.len(), 2);
        assert_eq!(views[0], (ViewKind::VendorNameUnit, "Methane, fossil | kg".to_string()));
        assert_eq!(views[1], (ViewKind::NameLocationUnit, "Methane | GLO | kg".to_string()));
    }

    #[test]
    fn test_proposals_match_spelling_differences() {
        let mut matcher = matcher();
        let queries = vec![flow("Carbon Dioxide, fossil", "kg"), flow("Nitrogen oxides", "kg")];
        let targets = vec![
            flow("carbon dioxide, fossil", "kg"),
            flow("Water, river", "m3"),
        ];

        let proposals = matcher
            .propose_similarity_candidates(&queries, &targets, 3, 0.95)
            .unwrap();

        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].query, queries[0]);
        assert_eq!(proposals[0].target, targets[0]);
        assert_eq!(proposals[0].rank, 1);
        assert!(proposals[0].score >= 0.95);
    }

    #[test]
    fn test_repeated_batch_calls_oracle_once() {
        let mut matcher = matcher();
        let queries = vec![flow("Methane", "kg")];
        let targets = vec![flow("methane", "kg")];

        let first = matcher.propose_similarity_candidates(&queries, &targets, 3, 0.9).unwrap();
        let second = matcher.propose_similarity_candidates(&queries, &targets, 3, 0.9).unwrap();

        assert_eq!(first, second);
        assert_eq!(matcher.oracle_calls(), 1);

        // A different top-N is a different batch
        matcher.propose_similarity_candidates(&queries, &targets, 1, 0.9).unwrap();
        assert_eq!(matcher.oracle_calls(), 2);
    }

    #[test]
    fn test_cache_evicts_oldest_batch() {
        let mut matcher = matcher().with_cache_capacity(1);
        let targets = vec![flow("methane", "kg")];
        let first = vec![flow("Methane", "kg")];
        let second = vec![flow("Ethane", "kg")];

        matcher.propose_similarity_candidates(&first, &targets, 3, 0.9).unwrap();
        matcher.propose_similarity_candidates(&second, &targets, 3, 0.9).unwrap();
        assert_eq!(matcher.cached_batches(), 1);

        // The first batch was evicted and goes back to the oracle
        let again = matcher.propose_similarity_candidates(&first, &targets, 3, 0.9).unwrap();
        assert_eq!(matcher.oracle_calls(), 3);
        assert_eq!(matcher.cached_batches(), 1);
        assert_eq!(again[0].target, targets[0]);
    }

    #[test]
    fn test_matcher_from_config_uses_capacity() {
        let config = SimilarityConfig {
            cache_capacity: 2,
            ..SimilarityConfig::default()
        };
        let mut matcher = SimilarityMatcher::from_config(
            EmbeddingOracle::new(HashingEmbedder::default()),
            &config,
        );
        let targets = vec![flow("methane", "kg")];

        for name in ["Methane", "Ethane", "Propane"] {
            matcher
                .propose_similarity_candidates(&[flow(name, "kg")], &targets, 3, 0.0)
                .unwrap();
        }

        assert_eq!(matcher.oracle_calls(), 3);
        assert_eq!(matcher.cached_batches(), 2);
    }

    #[test]
    fn test_empty_pools_skip_oracle() {
        let mut matcher = SimilarityMatcher::new(FailingOracle);
        let proposals = matcher
            .propose_similarity_candidates(&[], &[flow("Methane", "kg")], 3, 0.9)
            .unwrap();

        assert!(proposals.is_empty());
        assert_eq!(matcher.oracle_calls(), 0);
    }

    #[test]
    fn test_oracle_failure_is_typed() {
        let mut matcher = SimilarityMatcher::new(FailingOracle);
        let err = matcher
            .propose_similarity_candidates(&[flow("a", "kg")], &[flow("b", "kg")], 3, 0.9)
            .unwrap_err();

        assert!(matches!(err, MappingError::Oracle(ref msg) if msg.contains("backend unavailable")));
    }

    #[test]
    fn test_promote_synonyms_rank_one_only() {
        let a = flow("a", "kg");
        let b = flow("b", "kg");
        let c = flow("c", "kg");
        let proposal = |target: &EntityRecord, score: f32, rank: usize| SimilarityProposal {
            query: a.clone(),
            query_view: "a".to_string(),
            query_view_kind: ViewKind::NameLocationUnit,
            target: target.clone(),
            target_view: "t".to_string(),
            target_view_kind: ViewKind::NameLocationUnit,
            score,
            rank,
        };

        let proposals = vec![
            proposal(&b, 0.99, 1),
            proposal(&c, 0.99, 2),
            proposal(&b, 0.99, 1),
        ];
        let pairs = promote_synonyms(&proposals, 0.98);

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].right, b);
        assert!(promote_synonyms(&proposals, 0.995).is_empty());
    }
}
