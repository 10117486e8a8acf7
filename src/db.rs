// 🗄️ Store - SQLite persistence for the registry, report rows and audit events
//
// One table per report type, keyed by (unit_id, academic_year, outcome_id).
// Saving a report is an upsert of its rows plus removal of orphaned outcomes
// (same unit+year, outcome no longer reported), all in one transaction.

use crate::report::{ReportRow, ReportType};
use crate::stagnation::{HistoricalOutcomeRecord, HistorySource};
use crate::units::{RegistryEntry, UnitRegistry, UnitType};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Event for audit trail ("Every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Open (or create) the database file and make sure the schema exists
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Unit Registry
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS units (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            unit_id TEXT UNIQUE NOT NULL,
            canonical_name TEXT NOT NULL,
            college_division TEXT NOT NULL,
            unit_type TEXT NOT NULL,
            previous_names TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Report tables (one per report type, all columns TEXT)
    // ==========================================================================
    for report_type in ReportType::ALL {
        let columns = report_type
            .columns()
            .iter()
            .map(|c| format!("{} TEXT NOT NULL DEFAULT ''", c))
            .collect::<Vec<_>>()
            .join(",\n            ");

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            {},
            UNIQUE (unit_id, academic_year, outcome_id)
        )",
                report_type.table_name(),
                columns
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_unit ON {0}(unit_id, outcome_id)",
                report_type.table_name()
            ),
            [],
        )?;
    }

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_units_type ON units(unit_type)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// UNIT REGISTRY
// ============================================================================

/// Insert or update a registry entry; the unit_id never changes
pub fn upsert_unit(conn: &Connection, entry: &RegistryEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO units (unit_id, canonical_name, college_division, unit_type, previous_names, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(unit_id) DO UPDATE SET
            canonical_name = excluded.canonical_name,
            college_division = excluded.college_division,
            previous_names = excluded.previous_names,
            active = excluded.active,
            updated_at = CURRENT_TIMESTAMP",
        params![
            entry.unit_id,
            entry.canonical_name,
            entry.college_division,
            entry.unit_type.as_str(),
            entry.previous_names_field(),
            entry.active,
        ],
    )?;

    Ok(())
}

/// Persist every entry of a registry snapshot
pub fn save_registry(conn: &mut Connection, registry: &UnitRegistry) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut saved = 0;
    for entry in registry.all_entries() {
        upsert_unit(&tx, entry)?;
        saved += 1;
    }
    tx.commit()?;

    info!("Saved {} registry entries", saved);
    Ok(saved)
}

/// Replace every stored unit of one type (bulk registry upload)
pub fn replace_units(conn: &mut Connection, unit_type: UnitType, entries: &[RegistryEntry]) -> Result<usize> {
    let tx = conn.transaction()?;
    let removed = tx.execute("DELETE FROM units WHERE unit_type = ?1", [unit_type.as_str()])?;

    let mut saved = 0;
    for entry in entries.iter().filter(|e| e.unit_type == unit_type) {
        upsert_unit(&tx, entry)?;
        saved += 1;
    }
    tx.commit()?;

    info!("Replaced {} {} units with {}", removed, unit_type, saved);
    Ok(saved)
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(RegistryEntry, String)> {
    let unit_type_text: String = row.get(3)?;
    let previous_names: String = row.get(4)?;

    let mut entry = RegistryEntry {
        unit_id: row.get(0)?,
        canonical_name: row.get(1)?,
        college_division: row.get(2)?,
        // Placeholder until the stored text is validated by the caller
        unit_type: UnitType::Academic,
        previous_names: Vec::new(),
        active: row.get(5)?,
    };
    entry.set_previous_names_field(&previous_names);

    Ok((entry, unit_type_text))
}

fn finish_entry((mut entry, unit_type_text): (RegistryEntry, String)) -> Result<RegistryEntry> {
    entry.unit_type = unit_type_text
        .parse()
        .with_context(|| format!("Stored unit {} has a bad unit_type", entry.unit_id))?;
    Ok(entry)
}

/// Load the whole registry snapshot, in insertion order
pub fn load_registry(conn: &Connection) -> Result<UnitRegistry> {
    let mut stmt = conn.prepare(
        "SELECT unit_id, canonical_name, college_division, unit_type, previous_names, active
         FROM units
         ORDER BY seq",
    )?;

    let rows = stmt
        .query_map([], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let entries = rows
        .into_iter()
        .map(finish_entry)
        .collect::<Result<Vec<_>>>()?;

    Ok(UnitRegistry::from_entries(entries))
}

pub fn get_unit(conn: &Connection, unit_id: &str) -> Result<Option<RegistryEntry>> {
    let row = conn
        .query_row(
            "SELECT unit_id, canonical_name, college_division, unit_type, previous_names, active
             FROM units
             WHERE unit_id = ?1",
            [unit_id],
            entry_from_row,
        )
        .optional()?;

    row.map(finish_entry).transpose()
}

pub fn count_units(conn: &Connection, unit_type: UnitType) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM units WHERE unit_type = ?1",
        [unit_type.as_str()],
        |row| row.get(0),
    )?;

    Ok(count)
}

// ============================================================================
// REPORT ROWS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSummary {
    pub inserted: usize,
    pub updated: usize,
    pub orphans_removed: usize,
}

/// Upsert a report's rows and drop orphaned outcomes of the same unit+year,
/// in one transaction
///
/// Updates keep the original upload_timestamp.
pub fn save_report_rows(conn: &mut Connection, report_type: ReportType, rows: &[ReportRow]) -> Result<SaveSummary> {
    let tx = conn.transaction()?;
    let summary = write_report_rows(&tx, report_type, rows)?;
    tx.commit()?;
    Ok(summary)
}

/// Same as `save_report_rows`, on a caller-owned connection or transaction
pub fn write_report_rows(conn: &Connection, report_type: ReportType, rows: &[ReportRow]) -> Result<SaveSummary> {
    if let Some(bad) = rows.iter().find(|r| r.report_type != report_type) {
        return Err(anyhow!(
            "Row {} is a {} row, expected {}",
            bad.key(),
            bad.report_type,
            report_type
        ));
    }

    let table = report_type.table_name();
    let columns = report_type.columns();

    let insert_sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        (1..=columns.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
    );

    let update_columns: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| *c != "upload_timestamp")
        .collect();
    let update_sql = format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        table,
        update_columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 1))
            .collect::<Vec<_>>()
            .join(", "),
        update_columns.len() + 1
    );

    let mut summary = SaveSummary::default();

    let mut new_keys: HashSet<String> = HashSet::new();
    let mut unit_years: HashSet<(String, String)> = HashSet::new();

    for row in rows {
        new_keys.insert(row.key());
        unit_years.insert((row.unit_id().to_string(), row.academic_year().to_string()));

        let existing: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT id FROM {} WHERE unit_id = ?1 AND academic_year = ?2 AND outcome_id = ?3",
                    table
                ),
                params![row.unit_id(), row.academic_year(), row.outcome_id()],
                |r| r.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                let mut values: Vec<String> = update_columns.iter().map(|c| row.get(c).to_string()).collect();
                values.push(id.to_string());
                conn.execute(&update_sql, params_from_iter(values.iter()))?;
                summary.updated += 1;
            }
            None => {
                conn.execute(&insert_sql, params_from_iter(row.values().iter()))?;
                summary.inserted += 1;
            }
        }
    }

    // Orphans: same unit+year, outcome not in this save
    for (unit_id, academic_year) in &unit_years {
        let stored: Vec<(i64, String)> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, outcome_id FROM {} WHERE unit_id = ?1 AND academic_year = ?2",
                table
            ))?;
            let found = stmt
                .query_map(params![unit_id, academic_year], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            found
        };

        for (id, outcome_id) in stored {
            let key = format!("{}|{}|{}", unit_id, academic_year, outcome_id);
            if !new_keys.contains(&key) {
                conn.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])?;
                debug!("Removed orphaned outcome {}", key);
                summary.orphans_removed += 1;
            }
        }
    }

    info!(
        "Wrote {} rows: {} inserted, {} updated, {} orphans removed",
        report_type.label(),
        summary.inserted,
        summary.updated,
        summary.orphans_removed
    );

    Ok(summary)
}

/// All stored rows of one report type for a unit, keyed by column
pub fn get_report_rows(
    conn: &Connection,
    report_type: ReportType,
    unit_id: &str,
) -> Result<Vec<HashMap<String, String>>> {
    let columns = report_type.columns();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} WHERE unit_id = ?1 ORDER BY academic_year, outcome_id",
        columns.join(", "),
        report_type.table_name()
    ))?;

    let rows = stmt
        .query_map([unit_id], |row| {
            let mut record = HashMap::new();
            for (i, column) in columns.iter().enumerate() {
                record.insert(column.to_string(), row.get::<_, String>(i)?);
            }
            Ok(record)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn count_rows(conn: &Connection, report_type: ReportType) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", report_type.table_name()),
        [],
        |row| row.get(0),
    )?;

    Ok(count)
}

// ============================================================================
// HISTORY
// ============================================================================

/// Stored Results rows for one unit+outcome, oldest year first
pub fn history_for(conn: &Connection, unit_id: &str, outcome_id: &str) -> Result<Vec<HistoricalOutcomeRecord>> {
    let mut stmt = conn.prepare(
        "SELECT unit_id, outcome_id, academic_year, achievement_level,
                assessment_method_normalized, assessment_method
         FROM results_data
         WHERE unit_id = ?1 AND outcome_id = ?2
         ORDER BY academic_year",
    )?;

    let records = stmt
        .query_map(params![unit_id, outcome_id], |row| {
            Ok(HistoricalOutcomeRecord {
                unit_id: row.get(0)?,
                outcome_id: row.get(1)?,
                academic_year: row.get(2)?,
                achievement_level: row.get(3)?,
                assessment_method_normalized: row.get(4)?,
                assessment_method: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

impl HistorySource for Connection {
    fn outcome_history(&self, unit_id: &str, outcome_id: &str) -> Result<Vec<HistoricalOutcomeRecord>> {
        history_for(self, unit_id, outcome_id)
    }
}

/// A proposed improvement from an earlier Results Report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousImprovement {
    pub academic_year: String,
    pub outcome_id: String,
    pub proposed_improvement: String,
}

/// Proposed improvements of a unit, most recent year first
pub fn previous_improvements(conn: &Connection, unit_id: &str) -> Result<Vec<PreviousImprovement>> {
    let mut stmt = conn.prepare(
        "SELECT academic_year, outcome_id, proposed_improvement
         FROM results_data
         WHERE unit_id = ?1 AND TRIM(proposed_improvement) != ''
         ORDER BY academic_year DESC, id",
    )?;

    let improvements = stmt
        .query_map([unit_id], |row| {
            Ok(PreviousImprovement {
                academic_year: row.get(0)?,
                outcome_id: row.get(1)?,
                proposed_improvement: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(improvements)
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
                    })?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}
