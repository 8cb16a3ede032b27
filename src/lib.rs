// Flow Linker - Core Library
// Identity resolution for activities and elementary flows across naming
// schemes and dataset versions

pub mod error;
pub mod record;
pub mod config;
pub mod rules;          // Key rules and the ordered catalog
pub mod mapping_table;  // Registrations + lazily built key indexes
pub mod resolver;       // Rule cascade over one mapping-source
pub mod correspondence; // Version-to-version tables and CSV ingestion
pub mod interlink;      // Multi-hop chain walking
pub mod similarity;     // Embedding-similarity proposals
pub mod engine;         // Layered resolution across mapping-sources
pub mod db;             // SQLite registration store

// Re-export commonly used types
pub use error::{MappingError, Result};
pub use record::{EntityRecord, Field, KeyTuple, Payload, Target};
pub use config::{EngineConfig, SimilarityConfig};
pub use rules::{FieldProjection, KeyRule, RuleCatalog, SpellingVariants};
pub use mapping_table::{MappingSource, MappingSourceKind, Registration};
pub use resolver::{LookupPass, Resolver, RuleMatch, SUM_TOLERANCE};
pub use correspondence::{
    read_correspondence_table, parse_multiplier,
    CorrespondenceRow, CorrespondenceTable, VersionId,
};
pub use interlink::{
    Chain, ChainInterlinker, ChainState, HopLink, InterlinkReport, JoinKind, MAX_HOPS,
};
pub use similarity::{
    promote_synonyms, project_views,
    Embedder, EmbeddingOracle, HashingEmbedder, SimilarityMatcher, SimilarityOracle,
    SimilarityProposal, SynonymPair, ViewKind,
};
pub use engine::{MappingEngine, MatchedMapping, Resolution, SimilarityLinkSummary};
pub use db::{
    RegistrationEvent, StoredRegistration,
    setup_database, save_engine, load_registrations, restore_engine,
    insert_event, get_events_for_source, verify_count,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
