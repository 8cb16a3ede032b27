// 💾 Registration Store - SQLite snapshot of every mapping-source
//
// Only registrations are stored. Key tables are caches and get rebuilt on
// first lookup after a restore.

use crate::engine::MappingEngine;
use crate::error::MappingError;
use crate::mapping_table::{MappingSourceKind, Registration};
use crate::record::{EntityRecord, Payload};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Audit entry written when a registration reaches the store
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RegistrationEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub kind: MappingSourceKind,
    /// Idempotency hash of the registration row
    pub registration_hash: String,
    pub ordinal: usize,
    pub multiplier: f64,
    pub actor: String,
}

impl RegistrationEvent {
    pub fn added(kind: MappingSourceKind, registration_hash: &str, ordinal: usize, multiplier: f64) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: "registration_added".to_string(),
            kind,
            registration_hash: registration_hash.to_string(),
            ordinal,
            multiplier,
            actor: "registration_store".to_string(),
        }
    }
}

/// One row of the registrations table
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRegistration {
    pub kind: MappingSourceKind,
    /// Position within its mapping-source
    pub ordinal: usize,
    pub registration: Registration,
    pub reg_uuid: String,
    pub registered_at: DateTime<Utc>,
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Registrations Table
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS registrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            mapping_source TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            source_json TEXT NOT NULL,
            target_json TEXT NOT NULL,
            multiplier REAL NOT NULL,
            reg_uuid TEXT UNIQUE NOT NULL,
            registered_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            mapping_source TEXT NOT NULL,
            registration_hash TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            multiplier REAL NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_source ON registrations(mapping_source, ordinal)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_source ON events(mapping_source, id)",
        [],
    )?;

    Ok(())
}

/// SHA-256 over everything that identifies a registration
///
/// The ordinal is included so that registering the same pair twice (two
/// equal shares) survives a round trip.
pub fn registration_hash(
    kind: MappingSourceKind,
    ordinal: usize,
    source_json: &str,
    target_json: &str,
    multiplier: f64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(ordinal.to_le_bytes());
    hasher.update(source_json.as_bytes());
    hasher.update(target_json.as_bytes());
    hasher.update(multiplier.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Write every registration of `engine`; returns how many were new
pub fn save_engine(conn: &Connection, engine: &MappingEngine) -> Result<usize> {
    let mut inserted = 0;
    let mut duplicates = 0;

    for kind in MappingSourceKind::PRIORITY {
        for (ordinal, reg) in engine.mapping_source(kind).registrations().iter().enumerate() {
            let source_json = serde_json::to_string(&reg.source)?;
            let target_json = serde_json::to_string(&reg.target)?;
            let hash = registration_hash(kind, ordinal, &source_json, &target_json, reg.multiplier);

            let result = conn.execute(
                "INSERT INTO registrations (
                    idempotency_hash, mapping_source, ordinal, source_json, target_json,
                    multiplier, reg_uuid, registered_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    hash,
                    kind.as_str(),
                    ordinal as i64,
                    source_json,
                    target_json,
                    reg.multiplier,
                    uuid::Uuid::new_v4().to_string(),
                    Utc::now().to_rfc3339(),
                ],
            );

            match result {
                Ok(_) => {
                    inserted += 1;

                    let event = RegistrationEvent::added(kind, &hash, ordinal, reg.multiplier);
                    if let Err(e) = insert_event(conn, &event) {
                        warn!("Failed to log registration event {}: {:#}", hash, e);
                    }
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    duplicates += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    info!("Saved {} registrations, skipped {} duplicates", inserted, duplicates);
    Ok(inserted)
}

/// All stored registrations in insertion order
pub fn load_registrations(conn: &Connection) -> Result<Vec<StoredRegistration>> {
    let mut stmt = conn.prepare(
        "SELECT mapping_source, ordinal, source_json, target_json, multiplier, reg_uuid, registered_at
         FROM registrations
         ORDER BY id ASC",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(kind, ordinal, source_json, target_json, multiplier, reg_uuid, registered_at)| -> Result<StoredRegistration> {
            let kind = MappingSourceKind::parse(&kind)
                .ok_or_else(|| anyhow!("Unknown mapping source '{}' in store", kind))?;
            let source: EntityRecord = serde_json::from_str(&source_json)
                .with_context(|| format!("Bad source record in registration {}", reg_uuid))?;
            let target: Payload = serde_json::from_str(&target_json)
                .with_context(|| format!("Bad target payload in registration {}", reg_uuid))?;
            let registered_at = DateTime::parse_from_rfc3339(&registered_at)
                .with_context(|| format!("Bad timestamp in registration {}", reg_uuid))?
                .with_timezone(&Utc);

            Ok(StoredRegistration {
                kind,
                ordinal: usize::try_from(ordinal).context("Negative ordinal in store")?,
                registration: Registration {
                    source,
                    target,
                    multiplier,
                },
                reg_uuid,
                registered_at,
            })
        })
        .collect()
}

/// Replay stored registrations into `engine`
///
/// Replaying into an engine that already holds them duplicates fan-outs;
/// restore into a fresh engine.
pub fn restore_engine(conn: &Connection, engine: &mut MappingEngine) -> Result<usize> {
    let stored = load_registrations(conn)?;

    for entry in &stored {
        let reg = &entry.registration;
        engine
            .register(entry.kind, reg.source.clone(), reg.target.clone(), Some(reg.multiplier))
            .with_context(|| format!("Failed to restore registration {}", entry.reg_uuid))?;
    }

    info!("Restored {} registrations", stored.len());
    Ok(stored.len())
}

/// Append to the audit trail
pub fn insert_event(conn: &Connection, event: &RegistrationEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, mapping_source, registration_hash,
            ordinal, multiplier, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.kind.as_str(),
            event.registration_hash,
            event.ordinal as i64,
            event.multiplier,
            event.actor,
        ],
    )?;

    Ok(())
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

/// Audit trail of one mapping-source, oldest first
pub fn get_events_for_source(conn: &Connection, kind: MappingSourceKind) -> Result<Vec<RegistrationEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, mapping_source, registration_hash,
                ordinal, multiplier, actor
         FROM events
         WHERE mapping_source = ?1
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![kind.as_str()], |row| {
            let timestamp: String = row.get(1)?;
            let source: String = row.get(3)?;
            let ordinal: i64 = row.get(5)?;

            Ok(RegistrationEvent {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map_err(|e| conversion_error(1, e))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                kind: MappingSourceKind::parse(&source).ok_or_else(|| {
                    conversion_error(3, MappingError::malformed("events table", format!("unknown mapping source '{}'", source)))
                })?,
                registration_hash: row.get(4)?,
                ordinal: usize::try_from(ordinal).map_err(|e| conversion_error(5, e))?,
                multiplier: row.get(6)?,
                actor: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Stored registrations, for one mapping-source or all of them
pub fn verify_count(conn: &Connection, kind: Option<MappingSourceKind>) -> Result<i64> {
    let count: i64 = match kind {
        Some(kind) => conn.query_row(
            "SELECT COUNT(*) FROM registrations WHERE mapping_source = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?,
        None => conn.query_row("SELECT COUNT(*) FROM registrations", [], |row| row.get(0))?,
    };

    Ok(count)
}

// ============================================================================
// TESTS
// ============================================================================
