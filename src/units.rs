// 🏛️ Unit Registry - Stable identity for organizational units
//
// "Unit name is a VALUE (can change), unit_id is IDENTITY (never changes)"
//
// Problem solved:
// - "Computer Science", "CS Department", "Comp Sci" → same registry entry
// - Academic and administrative units live in disjoint namespaces
// - unit_id is derived deterministically, so re-importing a registry file
//   reproduces the same ids

use crate::error::{TrackerError, TrackerResult};
use crate::resolver::{self, MatchResult};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Separator used for previous names in CSV files and the database
pub const PREVIOUS_NAMES_SEPARATOR: char = ';';

/// Max characters of the college/division kept in the id prefix
const ID_PREFIX_LEN: usize = 10;

/// Hex digits of the hash kept in the id suffix
const ID_HASH_LEN: usize = 6;

// ============================================================================
// UNIT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitType {
    /// Degree programs and academic departments
    Academic,

    /// Offices and support units
    Administrative,
}

impl UnitType {
    pub const ALL: [UnitType; 2] = [UnitType::Academic, UnitType::Administrative];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitType::Academic => "Academic",
            UnitType::Administrative => "Administrative",
        }
    }

    /// Label used for outcomes of this unit type in stored rows
    pub fn outcome_label(&self) -> &'static str {
        match self {
            UnitType::Academic => "Student Learning Outcome",
            UnitType::Administrative => "Outcome",
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitType {
    type Err = TrackerError;

    /// Strict parse: anything other than the two names is rejected instead of
    /// being treated as administrative.
    fn from_str(s: &str) -> TrackerResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "academic" => Ok(UnitType::Academic),
            "administrative" => Ok(UnitType::Administrative),
            _ => Err(TrackerError::InvalidUnitType(s.to_string())),
        }
    }
}

// ============================================================================
// REGISTRY ENTRY
// ============================================================================

/// A known organizational unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Stable identity - NEVER changes, even on rename
    pub unit_id: String,

    /// The authoritative display name
    pub canonical_name: String,

    /// Owning college or division (part of the id derivation)
    pub college_division: String,

    pub unit_type: UnitType,

    /// Historical aliases, oldest first
    /// Example: ["CS Department", "Comp Sci"]
    pub previous_names: Vec<String>,

    /// Advisory only; matching ignores it
    pub active: bool,
}

impl RegistryEntry {
    /// Create a new active entry with a derived unit_id
    pub fn new(canonical_name: &str, college_division: &str, unit_type: UnitType) -> Self {
        let canonical_name = canonical_name.trim().to_string();
        let college_division = college_division.trim().to_string();

        RegistryEntry {
            unit_id: generate_unit_id(&canonical_name, &college_division, unit_type),
            canonical_name,
            college_division,
            unit_type,
            previous_names: Vec::new(),
            active: true,
        }
    }

    /// Add an alias; ignores blanks, duplicates (case-insensitive) and the canonical name itself
    pub fn add_previous_name(&mut self, alias: &str) {
        let alias = alias.trim();
        if alias.is_empty() {
            return;
        }

        let lower = alias.to_lowercase();
        if lower == self.canonical_name.to_lowercase() {
            return;
        }
        if self.previous_names.iter().any(|p| p.to_lowercase() == lower) {
            return;
        }

        self.previous_names.push(alias.to_string());
    }

    /// Replace aliases from the semicolon-delimited storage form
    pub fn set_previous_names_field(&mut self, field: &str) {
        self.previous_names.clear();
        for alias in parse_previous_names(field) {
            self.add_previous_name(&alias);
        }
    }

    /// Semicolon-delimited storage form of the aliases
    pub fn previous_names_field(&self) -> String {
        self.previous_names.join("; ")
    }

    /// Rename the unit, keeping its identity and remembering the old name
    pub fn rename(&mut self, new_name: &str) {
        let new_name = new_name.trim();
        if new_name.is_empty() || new_name == self.canonical_name {
            return;
        }

        let old = std::mem::replace(&mut self.canonical_name, new_name.to_string());
        // The new canonical name must not linger as an alias
        let new_lower = new_name.to_lowercase();
        self.previous_names.retain(|p| p.to_lowercase() != new_lower);
        self.add_previous_name(&old);
    }

    /// Canonical name followed by all aliases
    pub fn all_names(&self) -> Vec<String> {
        let mut names = vec![self.canonical_name.clone()];
        names.extend(self.previous_names.iter().cloned());
        names
    }
}

/// Split the semicolon-delimited alias field into trimmed, non-empty names
pub fn parse_previous_names(field: &str) -> Vec<String> {
    field
        .split(PREVIOUS_NAMES_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Derive a unit id from (college/division, unit name, unit type)
///
/// Shape: `CLEANDIV-HASH6`, upper-cased. The prefix is the first 10 ASCII
/// alphanumerics of the college/division; the suffix is the first 6 hex
/// digits of SHA-256 over `"{college}_{name}_{type}"`.
///
/// Example: ("Computer Science", "College of Engineering", Academic) → "COLLEGEOFE-3F2A1B"
pub fn generate_unit_id(unit_name: &str, college_division: &str, unit_type: UnitType) -> String {
    let combined = format!("{}_{}_{}", college_division, unit_name, unit_type.as_str());

    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let prefix: String = college_division
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(ID_PREFIX_LEN)
        .collect();

    format!("{}-{}", prefix, &digest[..ID_HASH_LEN]).to_uppercase()
}

// ============================================================================
// UNIT REGISTRY
// ============================================================================

/// Registry of all known units, one namespace per unit type
///
/// The registry is a plain snapshot: callers own it and pass it explicitly.
/// Persistence lives in `db`; this type never touches storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitRegistry {
    academic: Vec<RegistryEntry>,
    administrative: Vec<RegistryEntry>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from entries, skipping duplicate ids
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = RegistryEntry>,
    {
        let mut registry = UnitRegistry::new();
        for entry in entries {
            if let Err(e) = registry.register(entry) {
                warn!("Skipping registry entry: {}", e);
            }
        }
        registry
    }

    /// Entries of one namespace, in registration order
    pub fn entries(&self, unit_type: UnitType) -> &[RegistryEntry] {
        match unit_type {
            UnitType::Academic => &self.academic,
            UnitType::Administrative => &self.administrative,
        }
    }

    fn entries_mut(&mut self, unit_type: UnitType) -> &mut Vec<RegistryEntry> {
        match unit_type {
            UnitType::Academic => &mut self.academic,
            UnitType::Administrative => &mut self.administrative,
        }
    }

    /// All entries, academic first
    pub fn all_entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.academic.iter().chain(self.administrative.iter())
    }

    pub fn count(&self) -> usize {
        self.academic.len() + self.administrative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Append an entry to its namespace
    pub fn register(&mut self, entry: RegistryEntry) -> TrackerResult<()> {
        if self.find_by_id(&entry.unit_id).is_some() {
            return Err(TrackerError::DuplicateUnit(entry.unit_id));
        }

        debug!(
            "Registering {} unit {} ({})",
            entry.unit_type, entry.canonical_name, entry.unit_id
        );
        self.entries_mut(entry.unit_type).push(entry);
        Ok(())
    }

    /// Replace a whole namespace (bulk upload semantics)
    pub fn replace_namespace(&mut self, unit_type: UnitType, entries: Vec<RegistryEntry>) {
        let kept: Vec<RegistryEntry> = entries
            .into_iter()
            .filter(|e| e.unit_type == unit_type)
            .collect();
        info!("Replacing {} registry with {} units", unit_type, kept.len());
        *self.entries_mut(unit_type) = kept;
    }

    pub fn find_by_id(&self, unit_id: &str) -> Option<&RegistryEntry> {
        self.all_entries().find(|e| e.unit_id == unit_id)
    }

    fn find_by_id_mut(&mut self, unit_id: &str) -> Option<&mut RegistryEntry> {
        self.academic
            .iter_mut()
            .chain(self.administrative.iter_mut())
            .find(|e| e.unit_id == unit_id)
    }

    /// Resolve an extracted name against the namespace of `unit_type`
    pub fn resolve(&self, extracted_name: &str, unit_type: UnitType) -> MatchResult {
        resolver::resolve(extracted_name, unit_type, self.entries(unit_type))
    }

    /// Apply an edit to an entry in place; the unit_id is restored if the edit touched it
    pub fn update<F>(&mut self, unit_id: &str, update_fn: F) -> TrackerResult<&RegistryEntry>
    where
        F: FnOnce(&mut RegistryEntry),
    {
        let entry = self
            .find_by_id_mut(unit_id)
            .ok_or_else(|| TrackerError::UnitNotFound(unit_id.to_string()))?;

        let identity = entry.unit_id.clone();
        let unit_type = entry.unit_type;
        update_fn(entry);
        entry.unit_id = identity;
        entry.unit_type = unit_type;

        Ok(entry)
    }

    /// Rename a unit; the old name becomes a previous name
    pub fn rename(&mut self, unit_id: &str, new_name: &str) -> TrackerResult<&RegistryEntry> {
        self.update(unit_id, |entry| entry.rename(new_name))
    }

    pub fn add_previous_name(&mut self, unit_id: &str, alias: &str) -> TrackerResult<&RegistryEntry> {
        self.update(unit_id, |entry| entry.add_previous_name(alias))
    }

    pub fn set_active(&mut self, unit_id: &str, active: bool) -> TrackerResult<&RegistryEntry> {
        self.update(unit_id, |entry| entry.active = active)
    }
}

// ============================================================================
// CSV IMPORT / EXPORT
// ============================================================================

/// On-disk registry row
///
/// Columns: unit_id, canonical_name, college_dept, unit_type, previous_names, active
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryRecord {
    #[serde(default)]
    unit_id: String,
    canonical_name: String,
    #[serde(default)]
    college_dept: String,
    #[serde(default)]
    unit_type: String,
    #[serde(default)]
    previous_names: String,
    #[serde(default)]
    active: String,
}

impl RegistryRecord {
    fn into_entry(self, namespace: UnitType) -> TrackerResult<RegistryEntry> {
        // An explicit type column must agree with the namespace being loaded
        if !self.unit_type.trim().is_empty() {
            let declared: UnitType = self.unit_type.parse()?;
            if declared != namespace {
                return Err(TrackerError::InvalidUnitType(format!(
                    "{} (loading {} registry)",
                    self.unit_type, namespace
                )));
            }
        }

        let mut entry = RegistryEntry::new(&self.canonical_name, &self.college_dept, namespace);
        if !self.unit_id.trim().is_empty() {
            entry.unit_id = self.unit_id.trim().to_string();
        }
        entry.set_previous_names_field(&self.previous_names);
        entry.active = parse_active_flag(&self.active);

        Ok(entry)
    }

    fn from_entry(entry: &RegistryEntry) -> Self {
        RegistryRecord {
            unit_id: entry.unit_id.clone(),
            canonical_name: entry.canonical_name.clone(),
            college_dept: entry.college_division.clone(),
            unit_type: entry.unit_type.as_str().to_string(),
            previous_names: entry.previous_names_field(),
            active: if entry.active { "Yes" } else { "No" }.to_string(),
        }
    }
}

/// "Yes"/"No" (also true/false, 1/0); blank means active
fn parse_active_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_lowercase().as_str(),
        "no" | "n" | "false" | "0" | "inactive"
    )
}

/// Load a full registry file for one namespace
pub fn load_registry_csv(path: &Path, unit_type: UnitType) -> Result<Vec<RegistryEntry>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open registry file {}", path.display()))?;

    let mut entries = Vec::new();
    for (line, result) in rdr.deserialize::<RegistryRecord>().enumerate() {
        let record = result.with_context(|| format!("Bad registry row {}", line + 2))?;
        if record.canonical_name.trim().is_empty() {
            warn!("Registry row {} has no canonical name, skipping", line + 2);
            continue;
        }
        let entry = record
            .into_entry(unit_type)
            .with_context(|| format!("Invalid registry row {}", line + 2))?;
        entries.push(entry);
    }

    info!("Loaded {} {} units from {}", entries.len(), unit_type, path.display());
    Ok(entries)
}

/// Bulk unit list: two positional columns, College/Division then Unit Name
///
/// Every row becomes a fresh active entry with a derived id.
pub fn import_unit_list_csv(path: &Path, unit_type: UnitType) -> Result<Vec<RegistryEntry>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open unit list {}", path.display()))?;

    let mut entries = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("Bad unit list row {}", line + 2))?;
        let college = record.get(0).unwrap_or("").trim();
        let name = record.get(1).unwrap_or("").trim();

        if name.is_empty() {
            warn!("Unit list row {} has no unit name, skipping", line + 2);
            continue;
        }

        entries.push(RegistryEntry::new(name, college, unit_type));
    }

    info!("Imported {} {} units from {}", entries.len(), unit_type, path.display());
    Ok(entries)
}

/// Write one namespace back out in the full registry format
pub fn save_registry_csv(path: &Path, entries: &[RegistryEntry]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create registry file {}", path.display()))?;

    for entry in entries {
        wtr.serialize(RegistryRecord::from_entry(entry))?;
    }
    wtr.flush()?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
