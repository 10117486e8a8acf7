// 📥 Intake - From extracted metadata to stored rows
//
// resolve unit → reuse or mint unit_id → stagnation per outcome (Results only)
// → flatten rows → persist + audit event

use crate::db::{self, Event, SaveSummary};
use crate::error::TrackerError;
use crate::report::{parse_extraction, prepare_rows, ExtractedReport, ReportRow, ReportType, RowIdentity};
use crate::resolver::{Confidence, MatchResult};
use crate::stagnation::{first_stagnant, scan_outcomes, HistorySource, OutcomeVerdict, StagnationPolicy};
use crate::units::{generate_unit_id, RegistryEntry, UnitRegistry, UnitType};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

// ============================================================================
// UNIT ASSIGNMENT
// ============================================================================

/// The unit a report is filed under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitAssignment {
    pub unit_id: String,

    /// Registry name when reused, the extracted name when minted
    pub canonical_name: String,

    /// True when no accepted registry entry exists yet
    pub is_new: bool,

    pub match_result: MatchResult,
}

impl UnitAssignment {
    /// A match that was found but not accepted (needs confirmation)
    pub fn possible_match(&self) -> Option<&RegistryEntry> {
        if self.is_new {
            self.match_result.matched_entry.as_ref()
        } else {
            None
        }
    }
}

/// Reuse the matched unit_id when the match is confident enough, else mint one
pub fn resolve_or_mint(
    extracted_name: &str,
    college_division: &str,
    unit_type: UnitType,
    registry: &UnitRegistry,
    accept: Confidence,
) -> UnitAssignment {
    let match_result = registry.resolve(extracted_name, unit_type);

    if let Some(entry) = &match_result.matched_entry {
        if match_result.confidence >= accept {
            return UnitAssignment {
                unit_id: entry.unit_id.clone(),
                canonical_name: entry.canonical_name.clone(),
                is_new: false,
                match_result: match_result.clone(),
            };
        }
    }

    let unit_id = generate_unit_id(extracted_name.trim(), college_division.trim(), unit_type);

    // Same derivation as an existing entry (e.g. renamed since registration)
    if let Some(existing) = registry.find_by_id(&unit_id) {
        return UnitAssignment {
            unit_id,
            canonical_name: existing.canonical_name.clone(),
            is_new: false,
            match_result,
        };
    }

    UnitAssignment {
        unit_id,
        canonical_name: extracted_name.trim().to_string(),
        is_new: true,
        match_result,
    }
}

// ============================================================================
// PREPARATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeOptions {
    /// Lowest match confidence that reuses an existing unit_id
    pub accept: Confidence,
    pub policy: StagnationPolicy,
}

impl Default for IntakeOptions {
    fn default() -> Self {
        IntakeOptions {
            accept: Confidence::High,
            policy: StagnationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedReport {
    pub report_type: ReportType,
    pub unit_type: UnitType,
    pub academic_year: String,
    pub assignment: UnitAssignment,

    /// Registry entry to add when the unit is new
    pub new_entry: Option<RegistryEntry>,

    /// One per outcome; empty for Improvement Reports and Next Cycle Plans
    pub verdicts: Vec<OutcomeVerdict>,

    pub rows: Vec<ReportRow>,
}

impl PreparedReport {
    pub fn first_stagnant(&self) -> Option<&OutcomeVerdict> {
        first_stagnant(&self.verdicts)
    }

    /// Prompt section for the first stagnant outcome, empty when none
    pub fn stagnation_context(&self) -> String {
        self.first_stagnant()
            .map(|v| v.verdict.analysis_context())
            .unwrap_or_default()
    }
}

/// Resolve, check and flatten one extracted report without touching storage
pub fn prepare_report<S>(
    report: &ExtractedReport,
    report_type: ReportType,
    registry: &UnitRegistry,
    history: &S,
    options: &IntakeOptions,
    now: DateTime<Utc>,
) -> Result<PreparedReport>
where
    S: HistorySource + ?Sized,
{
    let unit_type: UnitType = report.unit_type.parse()?;

    if report.unit_name.trim().is_empty() {
        return Err(TrackerError::MalformedExtraction("missing unit_name".to_string()).into());
    }

    let assignment = resolve_or_mint(
        &report.unit_name,
        &report.college_division,
        unit_type,
        registry,
        options.accept,
    );

    if let Some(candidate) = assignment.possible_match() {
        warn!(
            "Possible match for {:?}: {} ({}, {} confidence) not accepted",
            report.unit_name,
            candidate.canonical_name,
            candidate.unit_id,
            assignment.match_result.confidence.as_str()
        );
    }

    let new_entry = assignment.is_new.then(|| {
        RegistryEntry::new(&assignment.canonical_name, &report.college_division, unit_type)
    });

    let verdicts = match report_type {
        ReportType::Results => scan_outcomes(
            &options.policy,
            history,
            &assignment.unit_id,
            &report.outcome_ids(report_type),
            &report.academic_year,
        )?,
        _ => Vec::new(),
    };

    let rows = prepare_rows(
        report,
        report_type,
        &RowIdentity {
            unit_id: &assignment.unit_id,
            unit_type,
            unit_name: &assignment.canonical_name,
        },
        now,
    );

    Ok(PreparedReport {
        report_type,
        unit_type,
        academic_year: report.academic_year.clone(),
        assignment,
        new_entry,
        verdicts,
        rows,
    })
}

// ============================================================================
// INGEST
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub prepared: PreparedReport,
    pub summary: SaveSummary,
}

/// Prepare a report against the stored history and persist it
///
/// The unit registration, the rows and both audit events share one
/// transaction. `registry` only learns about a minted unit after commit.
pub fn ingest(
    conn: &mut Connection,
    registry: &mut UnitRegistry,
    report: &ExtractedReport,
    report_type: ReportType,
    options: &IntakeOptions,
    actor: &str,
) -> Result<IngestOutcome> {
    let tx = conn.transaction()?;
    let history: &Connection = &tx;
    let prepared = prepare_report(report, report_type, registry, history, options, Utc::now())?;
    let unit_id = prepared.assignment.unit_id.clone();

    if let Some(entry) = &prepared.new_entry {
        db::upsert_unit(&tx, entry)?;
        db::insert_event(
            &tx,
            &Event::new(
                "unit_registered",
                "unit",
                &unit_id,
                serde_json::json!({
                    "canonical_name": entry.canonical_name,
                    "college_division": entry.college_division,
                    "unit_type": entry.unit_type.as_str(),
                }),
                actor,
            ),
        )?;
    }

    let summary = db::write_report_rows(&tx, report_type, &prepared.rows)?;

    let stagnant: Vec<&str> = prepared
        .verdicts
        .iter()
        .filter(|v| v.verdict.stagnant)
        .map(|v| v.outcome_id.as_str())
        .collect();

    db::insert_event(
        &tx,
        &Event::new(
            "report_saved",
            "unit",
            &unit_id,
            serde_json::json!({
                "report_type": report_type.label(),
                "academic_year": prepared.academic_year,
                "match_type": prepared.assignment.match_result.match_type.as_str(),
                "inserted": summary.inserted,
                "updated": summary.updated,
                "orphans_removed": summary.orphans_removed,
                "stagnant_outcomes": stagnant,
            }),
            actor,
        ),
    )?;

    tx.commit()?;

    if let Some(entry) = &prepared.new_entry {
        registry.register(entry.clone())?;
        info!("Registered new unit {} ({})", entry.canonical_name, unit_id);
    }

    info!(
        "Ingested {} for {} {}: {} rows, {} stagnant outcomes",
        report_type,
        unit_id,
        prepared.academic_year,
        prepared.rows.len(),
        stagnant.len()
    );

    Ok(IngestOutcome { prepared, summary })
}

// ============================================================================
// BATCH
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSaved {
    /// File path or request index the answer came from
    pub source: String,
    pub outcome: IngestOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub source: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub saved: Vec<BatchSaved>,
    pub failures: Vec<BatchFailure>,
}

impl BatchSummary {
    /// "Saved N of M reports"
    pub fn summary_line(&self) -> String {
        format!("Saved {} of {} reports", self.saved.len(), self.total)
    }
}

/// Ingest many extraction answers of one report type
///
/// A failing answer (unreadable, malformed, rejected by the store) is logged
/// and skipped; its writes are rolled back and the rest still run.
pub fn ingest_batch<I>(
    conn: &mut Connection,
    registry: &mut UnitRegistry,
    answers: I,
    report_type: ReportType,
    options: &IntakeOptions,
    actor: &str,
) -> BatchSummary
where
    I: IntoIterator<Item = (String, Result<String>)>,
{
    let mut batch = BatchSummary::default();

    for (source, answer) in answers {
        batch.total += 1;

        let result = answer.and_then(|text| {
            let report = parse_extraction(&text)?;
            ingest(conn, registry, &report, report_type, options, actor)
        });

        match result {
            Ok(outcome) => batch.saved.push(BatchSaved { source, outcome }),
            Err(e) => {
                warn!("Skipping {}: {:#}", source, e);
                batch.failures.push(BatchFailure {
                    source,
                    error: format!("{:#}", e),
                });
            }
        }
    }

    info!("{} ({})", batch.summary_line(), report_type);
    batch
}

/// Ingest one extraction answer file per path
pub fn ingest_files(
    conn: &mut Connection,
    registry: &mut UnitRegistry,
    paths: &[PathBuf],
    report_type: ReportType,
    options: &IntakeOptions,
    actor: &str,
) -> BatchSummary {
    let answers = paths.iter().map(|path| {
        let answer = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()));
        (path.display().to_string(), answer)
    });

    ingest_batch(conn, registry, answers, report_type, options, actor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ExtractedOutcome;
    use crate::resolver::MatchType;
    use crate::stagnation::{HistoricalOutcomeRecord, NotStagnantReason};

    fn create_test_registry() -> UnitRegistry {
        let mut registry = UnitRegistry::new();
        let mut cs = RegistryEntry::new("Computer Science", "College of Engineering", UnitType::Academic);
        cs.add_previous_name("Comp Sci");
        registry.register(cs).unwrap();
        registry
            .register(RegistryEntry::new("Career Services", "Student Affairs", UnitType::Administrative))
            .unwrap();
        registry
    }

    fn create_test_report(name: &str, year: &str, levels: &[(&str, &str)]) -> ExtractedReport {
        ExtractedReport {
            unit_type: "Academic".to_string(),
            unit_name: name.to_string(),
            college_division: "College of Engineering".to_string(),
            academic_year: year.to_string(),
            outcomes: levels
                .iter()
                .map(|(id, level)| ExtractedOutcome {
                    outcome_id: id.to_string(),
                    outcome_text: format!("Outcome {}", id),
                    assessment_method: "Final exam in CSE 1310".to_string(),
                    assessment_method_normalized: "CSE 1310 final exam".to_string(),
                    achievement_level: level.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_resolve_or_mint_reuses_high_match() {
        let registry = create_test_registry();
        let cs_id = registry.entries(UnitType::Academic)[0].unit_id.clone();

        let assignment = resolve_or_mint("comp sci", "", UnitType::Academic, &registry, Confidence::High);
        assert!(!assignment.is_new);
        assert_eq!(assignment.unit_id, cs_id);
        assert_eq!(assignment.canonical_name, "Computer Science");
        assert_eq!(assignment.match_result.match_type, MatchType::PreviousName);
        assert!(assignment.possible_match().is_none());
    }

    #[test]
    fn test_resolve_or_mint_below_threshold_mints() {
        let registry = create_test_registry();

        let assignment = resolve_or_mint(
            "Dept of Computer Science",
            "College of Engineering",
            UnitType::Academic,
            &registry,
            Confidence::High,
        );
        assert!(assignment.is_new);
        assert_eq!(assignment.canonical_name, "Dept of Computer Science");
        assert_eq!(
            assignment.unit_id,
            generate_unit_id("Dept of Computer Science", "College of Engineering", UnitType::Academic)
        );
        assert_eq!(assignment.possible_match().unwrap().canonical_name, "Computer Science");

        let accepted = resolve_or_mint(
            "Dept of Computer Science",
            "College of Engineering",
            UnitType::Academic,
            &registry,
            Confidence::Low,
        );
        assert!(!accepted.is_new);
        assert_eq!(accepted.canonical_name, "Computer Science");
    }

    #[test]
    fn test_resolve_or_mint_respects_namespace() {
        let registry = create_test_registry();

        let assignment = resolve_or_mint("Career Services", "Student Affairs", UnitType::Academic, &registry, Confidence::High);
        assert!(assignment.is_new);
        assert_eq!(assignment.match_result.match_type, MatchType::None);
        assert_ne!(
            assignment.unit_id,
            registry.entries(UnitType::Administrative)[0].unit_id
        );
    }

    #[test]
    fn test_prepare_report_rejects_bad_unit_type() {
        let registry = create_test_registry();
        let history: Vec<HistoricalOutcomeRecord> = Vec::new();
        let mut report = create_test_report("Computer Science", "2024-2025", &[("SLO 1", "Fully Achieved")]);
        report.unit_type = "Research".to_string();

        let err = prepare_report(&report, ReportType::Results, &registry, &history, &IntakeOptions::default(), Utc::now())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrackerError>(),
            Some(&TrackerError::InvalidUnitType("Research".to_string()))
        );
    }

    #[test]
    fn test_prepare_report_requires_unit_name() {
        let registry = create_test_registry();
        let history: Vec<HistoricalOutcomeRecord> = Vec::new();
        let report = create_test_report("  ", "2024-2025", &[]);

        let err = prepare_report(&report, ReportType::Results, &registry, &history, &IntakeOptions::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrackerError>(),
            Some(TrackerError::MalformedExtraction(_))
        ));
    }

    #[test]
    fn test_prepare_report_flags_stagnant_outcome() {
        let registry = create_test_registry();
        let cs_id = registry.entries(UnitType::Academic)[0].unit_id.clone();

        let history: Vec<HistoricalOutcomeRecord> = ["2021-2022", "2022-2023", "2023-2024"]
            .iter()
            .map(|year| HistoricalOutcomeRecord {
                unit_id: cs_id.clone(),
                outcome_id: "SLO 2".to_string(),
                academic_year: year.to_string(),
                achievement_level: "Fully Achieved".to_string(),
                assessment_method_normalized: "CSE 1310 final exam".to_string(),
                assessment_method: String::new(),
            })
            .collect();

        let report = create_test_report(
            "Computer Science",
            "2024-2025",
            &[("SLO 1", "Fully Achieved"), ("SLO 2", "Fully Achieved")],
        );
        let prepared = prepare_report(&report, ReportType::Results, &registry, &history, &IntakeOptions::default(), Utc::now())
            .unwrap();

        assert!(prepared.new_entry.is_none());
        assert_eq!(prepared.verdicts.len(), 2);
        assert_eq!(
            prepared.verdicts[0].verdict.reason,
            Some(NotStagnantReason::InsufficientHistory)
        );
        assert_eq!(prepared.first_stagnant().unwrap().outcome_id, "SLO 2");
        assert!(prepared.stagnation_context().contains("2021-2022, 2022-2023, 2023-2024"));
        assert_eq!(prepared.rows.len(), 2);
        assert_eq!(prepared.rows[0].get("unit_name"), "Computer Science");
    }

    #[test]
    fn test_prepare_plan_skips_stagnation() {
        let registry = create_test_registry();
        let history: Vec<HistoricalOutcomeRecord> = Vec::new();
        let report = create_test_report("Computer Science", "2025-2026", &[("SLO 1", "")]);

        let prepared = prepare_report(&report, ReportType::Plan, &registry, &history, &IntakeOptions::default(), Utc::now())
            .unwrap();
        assert!(prepared.verdicts.is_empty());
        assert!(prepared.stagnation_context().is_empty());
        assert_eq!(prepared.rows[0].get("report_type"), "Plan");
    }

    #[test]
    fn test_ingest_registers_new_unit_once() {
        let mut conn = test_conn();
        let mut registry = create_test_registry();
        let report = create_test_report("Electrical Engineering", "2023-2024", &[("SLO 1", "Not Achieved")]);

        let first = ingest(&mut conn, &mut registry, &report, ReportType::Results, &IntakeOptions::default(), "test").unwrap();
        assert!(first.prepared.assignment.is_new);
        assert_eq!(first.summary.inserted, 1);
        assert_eq!(registry.count(), 3);

        let unit_id = first.prepared.assignment.unit_id.clone();
        assert!(db::get_unit(&conn, &unit_id).unwrap().is_some());

        let second = ingest(&mut conn, &mut registry, &report, ReportType::Results, &IntakeOptions::default(), "test").unwrap();
        assert!(!second.prepared.assignment.is_new);
        assert_eq!(second.prepared.assignment.unit_id, unit_id);
        assert_eq!(second.summary.updated, 1);
        assert_eq!(registry.count(), 3);
        assert_eq!(db::count_rows(&conn, ReportType::Results).unwrap(), 1);

        let events = db::get_events_for_entity(&conn, "unit", &unit_id).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().any(|e| e.event_type == "unit_registered"));
    }

    #[test]
    fn test_ingest_detects_stagnation_from_store() {
        let mut conn = test_conn();
        let mut registry = create_test_registry();
        let options = IntakeOptions::default();

        for year in ["2020-2021", "2021-2022", "2022-2023"] {
            let report = create_test_report("Computer Science", year, &[("SLO 1", "Fully Achieved")]);
            let outcome = ingest(&mut conn, &mut registry, &report, ReportType::Results, &options, "test").unwrap();
            assert!(outcome.prepared.first_stagnant().is_none());
        }

        let answer = r#"{"unit_type": "Academic", "unit_name": "Comp Sci", "academic_year": "2023-2024",
            "outcomes": [{"outcome_id": "SLO 1", "achievement_level": "Fully Achieved",
                          "assessment_method_normalized": "CSE 1310 final exam"}]}"#;
        let report = parse_extraction(answer).unwrap();
        let outcome = ingest(&mut conn, &mut registry, &report, ReportType::Results, &options, "test").unwrap();

        let stagnant = outcome.prepared.first_stagnant().unwrap();
        assert_eq!(stagnant.verdict.years, vec!["2020-2021", "2021-2022", "2022-2023"]);
        assert_eq!(outcome.prepared.assignment.canonical_name, "Computer Science");

        // Re-ingesting an earlier year does not count that year against itself
        let report = create_test_report("Computer Science", "2022-2023", &[("SLO 1", "Fully Achieved")]);
        let outcome = ingest(&mut conn, &mut registry, &report, ReportType::Results, &options, "test").unwrap();
        assert_eq!(
            outcome.prepared.verdicts[0].verdict.reason,
            Some(NotStagnantReason::InsufficientHistory)
        );
    }

    #[test]
    fn test_failed_row_write_leaves_nothing_behind() {
        let mut conn = test_conn();
        let mut registry = create_test_registry();
        conn.execute_batch(
            "CREATE TRIGGER reject_results BEFORE INSERT ON results_data
             BEGIN SELECT RAISE(ABORT, 'write failed'); END;",
        )
        .unwrap();

        let report = create_test_report("Electrical Engineering", "2023-2024", &[("SLO 1", "Fully Achieved")]);
        let err = ingest(&mut conn, &mut registry, &report, ReportType::Results, &IntakeOptions::default(), "test")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("write failed"));

        let unit_id = generate_unit_id("Electrical Engineering", "College of Engineering", UnitType::Academic);
        assert!(db::get_unit(&conn, &unit_id).unwrap().is_none());
        assert_eq!(db::count_units(&conn, UnitType::Academic).unwrap(), 0);
        assert!(db::get_events_for_entity(&conn, "unit", &unit_id).unwrap().is_empty());
        assert_eq!(registry.count(), 2);
        assert!(registry.find_by_id(&unit_id).is_none());
    }

    #[test]
    fn test_ingest_files_skips_bad_answers() {
        let dir = tempfile::tempdir().unwrap();

        let biology = dir.path().join("biology.json");
        std::fs::write(
            &biology,
            r#"{"unit_type": "Academic", "unit_name": "Biology", "college_division": "College of Science",
                "academic_year": "2023-2024", "outcomes": [{"outcome_id": "SLO 1", "achievement_level": "Not Achieved"}]}"#,
        )
        .unwrap();

        let wrapped = dir.path().join("comp_sci.txt");
        std::fs::write(
            &wrapped,
            "Extracted metadata below.\n```json\n{\"unit_type\": \"Academic\", \"unit_name\": \"Comp Sci\", \"academic_year\": \"2023-2024\", \"outcomes\": [{\"outcome_id\": \"SLO 1\"}, {\"outcome_id\": \"SLO 2\"}]}\n```",
        )
        .unwrap();

        let prose = dir.path().join("prose.txt");
        std::fs::write(&prose, "The document could not be read.").unwrap();

        let bad_type = dir.path().join("bad_type.json");
        std::fs::write(&bad_type, r#"{"unit_type": "Research", "unit_name": "Lab", "academic_year": "2023-2024"}"#).unwrap();

        let missing = dir.path().join("missing.json");

        let mut conn = test_conn();
        let mut registry = create_test_registry();
        let paths = vec![biology, prose, wrapped, missing.clone(), bad_type];

        let batch = ingest_files(&mut conn, &mut registry, &paths, ReportType::Results, &IntakeOptions::default(), "test");

        assert_eq!(batch.total, 5);
        assert_eq!(batch.saved.len(), 2);
        assert_eq!(batch.failures.len(), 3);
        assert_eq!(batch.summary_line(), "Saved 2 of 5 reports");

        assert!(batch.saved[0].source.ends_with("biology.json"));
        assert_eq!(batch.saved[1].outcome.prepared.assignment.canonical_name, "Computer Science");
        assert!(batch.failures[0].source.ends_with("prose.txt"));
        assert!(batch.failures[1].error.contains("Failed to read"));
        assert_eq!(batch.failures[1].source, missing.display().to_string());
        assert!(batch.failures[2].error.contains("Research"));

        assert_eq!(db::count_rows(&conn, ReportType::Results).unwrap(), 3);
        assert_eq!(registry.count(), 3);
    }
}
