// Assessment Tracker - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod config;
pub mod units;      // Unit Registry - canonical units, aliases, CSV
pub mod resolver;   // Unit Resolver - four-tier name matching
pub mod report;     // Report Model - extraction JSON → storage rows
pub mod stagnation; // Stagnation Detector - consecutive Fully Achieved years
pub mod db;
pub mod intake;     // Intake Pipeline - resolve, check, persist

// Re-export commonly used types
pub use error::{TrackerError, TrackerResult};
pub use config::Config;
pub use units::{
    RegistryEntry, UnitRegistry, UnitType,
    generate_unit_id, parse_previous_names,
    load_registry_csv, import_unit_list_csv, save_registry_csv,
};
pub use resolver::{resolve, Confidence, MatchResult, MatchType};
pub use report::{
    AchievementLevel, ExtractedImprovement, ExtractedOutcome, ExtractedReport,
    ReportRow, ReportType, RowIdentity,
    parse_extraction, prepare_rows,
    CORE_OBJECTIVES, STRATEGIC_THEMES,
};
pub use stagnation::{
    HistoricalOutcomeRecord, HistorySource, NotStagnantReason, OutcomeVerdict,
    StagnationPolicy, StagnationVerdict,
    check_stagnation, check_stagnation_with, first_stagnant, prior_history, scan_outcomes,
    STAGNATION_WINDOW,
};
pub use db::{
    Event, PreviousImprovement, SaveSummary,
    open_database, setup_database, insert_event, get_events_for_entity,
    load_registry, save_registry, upsert_unit, get_unit,
    save_report_rows, write_report_rows, history_for, previous_improvements,
};
pub use intake::{
    BatchFailure, BatchSaved, BatchSummary,
    IngestOutcome, IntakeOptions, PreparedReport, UnitAssignment,
    ingest, ingest_batch, ingest_files, prepare_report, resolve_or_mint,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
