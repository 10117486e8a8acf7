use anyhow::{bail, Result};
use assessment_tracker::{
    check_stagnation_with, db, import_unit_list_csv, ingest_files, load_registry_csv,
    prior_history, save_registry_csv, Config, Confidence, Event, IntakeOptions, RegistryEntry,
    ReportType, TrackerError, UnitType,
};
use clap::{Parser, Subcommand};
use log::info;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(author, version, about = "Assessment report tracker: unit registry, intake and stagnation checks", long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "ASSESSMENT_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn parse_unit_type(s: &str) -> Result<UnitType, TrackerError> {
    s.parse()
}

fn parse_report_type(s: &str) -> Result<ReportType, TrackerError> {
    s.parse()
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Replace one registry namespace from a full registry CSV
    ImportRegistry {
        csv: PathBuf,
        #[arg(long, value_parser = parse_unit_type)]
        unit_type: UnitType,
    },
    /// Add units from a two-column list (College/Division, Unit Name)
    ImportUnits {
        csv: PathBuf,
        #[arg(long, value_parser = parse_unit_type)]
        unit_type: UnitType,
    },
    /// Write one registry namespace to CSV
    ExportRegistry {
        csv: PathBuf,
        #[arg(long, value_parser = parse_unit_type)]
        unit_type: UnitType,
    },
    /// Register a single unit
    AddUnit {
        name: String,
        #[arg(long, default_value = "")]
        college: String,
        #[arg(long, value_parser = parse_unit_type)]
        unit_type: UnitType,
        /// Previous name (repeatable)
        #[arg(long = "alias")]
        aliases: Vec<String>,
    },
    /// Rename a unit, keeping its id; the old name becomes an alias
    RenameUnit { unit_id: String, new_name: String },
    /// Resolve a free-text unit name against the registry
    Resolve {
        name: String,
        #[arg(long, value_parser = parse_unit_type)]
        unit_type: UnitType,
    },
    /// Store extraction answers (JSON, optionally wrapped in prose), one file per report
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, value_parser = parse_report_type)]
        report_type: ReportType,
        /// Accept medium/low confidence unit matches
        #[arg(long)]
        confirm: bool,
    },
    /// Stagnation verdict for one unit+outcome from stored results
    Stagnation {
        unit_id: String,
        outcome_id: String,
        /// Only years before this one count as history
        #[arg(long)]
        current_year: Option<String>,
    },
    /// Proposed improvements from earlier Results Reports, newest first
    Improvements { unit_id: String },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.db {
        config.db_path = path;
    }

    let mut conn = db::open_database(&config.db_path)?;
    info!("Using database {}", config.db_path.display());

    match cli.command {
        Commands::Init => {
            println!("✓ Database initialized with WAL mode: {}", config.db_path.display());
        }
        Commands::ImportRegistry { csv, unit_type } => {
            let entries = load_registry_csv(&csv, unit_type)?;
            let saved = db::replace_units(&mut conn, unit_type, &entries)?;
            println!("✓ {} registry replaced: {} units", unit_type, saved);
        }
        Commands::ImportUnits { csv, unit_type } => run_import_units(&conn, &csv, unit_type)?,
        Commands::ExportRegistry { csv, unit_type } => {
            let registry = db::load_registry(&conn)?;
            save_registry_csv(&csv, registry.entries(unit_type))?;
            println!(
                "✓ Wrote {} {} units to {}",
                registry.entries(unit_type).len(),
                unit_type,
                csv.display()
            );
        }
        Commands::AddUnit {
            name,
            college,
            unit_type,
            aliases,
        } => {
            let mut entry = RegistryEntry::new(&name, &college, unit_type);
            for alias in &aliases {
                entry.add_previous_name(alias);
            }

            let mut registry = db::load_registry(&conn)?;
            registry.register(entry.clone())?;
            db::upsert_unit(&conn, &entry)?;
            log_unit_event(&conn, "unit_registered", &entry)?;
            println!("✓ Registered {} ({})", entry.canonical_name, entry.unit_id);
        }
        Commands::RenameUnit { unit_id, new_name } => {
            let mut registry = db::load_registry(&conn)?;
            let entry = registry.rename(&unit_id, &new_name)?.clone();
            db::upsert_unit(&conn, &entry)?;
            log_unit_event(&conn, "unit_renamed", &entry)?;
            println!(
                "✓ {} is now {} (previous names: {})",
                entry.unit_id,
                entry.canonical_name,
                entry.previous_names_field()
            );
        }
        Commands::Resolve { name, unit_type } => {
            let registry = db::load_registry(&conn)?;
            let result = registry.resolve(&name, unit_type);
            match &result.matched_entry {
                Some(entry) => println!(
                    "{} → {} ({}) [{}, {} confidence]",
                    name,
                    entry.canonical_name,
                    entry.unit_id,
                    result.match_type.as_str(),
                    result.confidence.as_str()
                ),
                None => println!("{} → no match", name),
            }
        }
        Commands::Ingest {
            files,
            report_type,
            confirm,
        } => run_ingest(&mut conn, &config, &files, report_type, confirm)?,
        Commands::Stagnation {
            unit_id,
            outcome_id,
            current_year,
        } => {
            let records = db::history_for(&conn, &unit_id, &outcome_id)?;
            let history = prior_history(records, current_year.as_deref().unwrap_or(""));
            let verdict = check_stagnation_with(&config.stagnation, &history);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
        Commands::Improvements { unit_id } => {
            let improvements = db::previous_improvements(&conn, &unit_id)?;
            if improvements.is_empty() {
                println!("No previous improvements recorded for {}", unit_id);
            }
            for imp in improvements {
                println!("{}  {}: {}", imp.academic_year, imp.outcome_id, imp.proposed_improvement);
            }
        }
    }

    Ok(())
}

fn log_unit_event(conn: &Connection, event_type: &str, entry: &RegistryEntry) -> Result<()> {
    db::insert_event(
        conn,
        &Event::new(event_type, "unit", &entry.unit_id, serde_json::to_value(entry)?, "cli"),
    )
}

fn run_import_units(conn: &Connection, csv: &Path, unit_type: UnitType) -> Result<()> {
    let mut registry = db::load_registry(conn)?;
    let mut added = 0;
    let mut skipped = 0;

    for entry in import_unit_list_csv(csv, unit_type)? {
        if registry.find_by_id(&entry.unit_id).is_some() {
            skipped += 1;
            continue;
        }
        db::upsert_unit(conn, &entry)?;
        registry.register(entry)?;
        added += 1;
    }

    println!("✓ Added {} {} units ({} already registered)", added, unit_type, skipped);
    Ok(())
}

fn run_ingest(
    conn: &mut Connection,
    config: &Config,
    files: &[PathBuf],
    report_type: ReportType,
    confirm: bool,
) -> Result<()> {
    let options = IntakeOptions {
        accept: if confirm { Confidence::Low } else { Confidence::High },
        policy: config.stagnation,
    };

    let mut registry = db::load_registry(conn)?;
    let batch = ingest_files(conn, &mut registry, files, report_type, &options, "cli");

    for saved in &batch.saved {
        let outcome = &saved.outcome;
        let assignment = &outcome.prepared.assignment;

        println!("📄 {}: {} {}", saved.source, report_type, outcome.prepared.academic_year);
        println!(
            "   Unit: {} ({}) [{}]",
            assignment.canonical_name,
            assignment.unit_id,
            assignment.match_result.match_type.as_str()
        );
        if assignment.is_new {
            println!("   New unit added to the registry");
        }
        if let Some(candidate) = assignment.possible_match() {
            println!(
                "   Possible match not accepted: {} ({}); rerun with --confirm to use it",
                candidate.canonical_name, candidate.unit_id
            );
        }
        println!(
            "   ✓ {} inserted, {} updated, {} orphaned outcomes removed",
            outcome.summary.inserted, outcome.summary.updated, outcome.summary.orphans_removed
        );

        let context = outcome.prepared.stagnation_context();
        if !context.is_empty() {
            println!("\n{}", context);
        }
    }

    for failure in &batch.failures {
        eprintln!("⚠️  {}: {}", failure.source, failure.error);
    }

    println!("\n{}", batch.summary_line());

    if batch.saved.is_empty() {
        bail!("No reports were saved");
    }

    Ok(())
}
