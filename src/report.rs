// 📄 Report Model - Report types, extracted metadata, storage rows
//
// Metadata arrives as the answer text of an extraction call (JSON, sometimes
// wrapped in prose). This module parses it leniently and flattens it into one
// row per outcome, in the fixed column order of each report table.

use crate::error::{TrackerError, TrackerResult};
use crate::units::UnitType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// REFERENCE VOCABULARIES
// ============================================================================

pub const STRATEGIC_THEMES: [&str; 5] = [
    "People and Culture",
    "Student Success",
    "Alumni and Community Engagement",
    "Research and Innovation",
    "Finance and Infrastructure",
];

pub const CORE_OBJECTIVES: [&str; 6] = [
    "Critical Thinking",
    "Communication",
    "Empirical & Quantitative Skills",
    "Teamwork",
    "Personal Responsibility",
    "Social Responsibility",
];

// Character caps applied when flattening free text into rows
const OUTCOME_TEXT_MAX: usize = 500;
const PROPOSED_IMPROVEMENT_MAX: usize = 500;
const IMPROVEMENT_ACTION_MAX: usize = 1000;
const ACTION_STEPS_MAX: usize = 500;

// ============================================================================
// ACHIEVEMENT LEVEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AchievementLevel {
    /// Met ALL criteria for success
    FullyAchieved,

    /// Multiple criteria exist; some met, some not
    PartiallyAchieved,

    /// Did not meet criteria for success
    NotAchieved,

    /// Insufficient data or unclear results
    Inconclusive,

    /// Anything else, kept verbatim
    Other(String),
}

impl AchievementLevel {
    pub fn parse(s: &str) -> AchievementLevel {
        match s.trim().to_lowercase().as_str() {
            "fully achieved" => AchievementLevel::FullyAchieved,
            "partially achieved" => AchievementLevel::PartiallyAchieved,
            "not achieved" => AchievementLevel::NotAchieved,
            "inconclusive" => AchievementLevel::Inconclusive,
            _ => AchievementLevel::Other(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AchievementLevel::FullyAchieved => "Fully Achieved",
            AchievementLevel::PartiallyAchieved => "Partially Achieved",
            AchievementLevel::NotAchieved => "Not Achieved",
            AchievementLevel::Inconclusive => "Inconclusive",
            AchievementLevel::Other(s) => s,
        }
    }

    pub fn is_fully_achieved(&self) -> bool {
        matches!(self, AchievementLevel::FullyAchieved)
    }
}

// ============================================================================
// REPORT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportType {
    Results,
    Improvement,
    Plan,
}

const RESULTS_COLUMNS: &[&str] = &[
    "unit_id", "unit_type", "unit_name", "college_division", "degree_level",
    "modality", "academic_year", "report_type", "outcome_id", "outcome_text",
    "outcome_label", "related_competency_or_function", "strategic_plan_theme",
    "core_objective", "assessment_method", "assessment_method_normalized",
    "sample_size", "benchmark", "result_value", "achievement_level",
    "gap_from_benchmark", "proposed_improvement", "responsible_party",
    "improvement_timeline", "upload_timestamp", "last_updated",
];

const IMPROVEMENT_COLUMNS: &[&str] = &[
    "unit_id", "unit_type", "unit_name", "college_division",
    "academic_year", "report_type", "outcome_id", "improvement_action_taken",
    "connection_to_previous", "previous_proposal_text",
    "upload_timestamp", "last_updated",
];

const PLAN_COLUMNS: &[&str] = &[
    "unit_id", "unit_type", "unit_name", "college_division", "degree_level",
    "academic_year", "report_type", "outcome_id", "outcome_text",
    "outcome_label", "related_competency_or_function", "strategic_plan_theme",
    "core_objective", "planned_method", "planned_benchmark",
    "action_steps", "responsible_party", "upload_timestamp", "last_updated",
];

impl ReportType {
    pub const ALL: [ReportType; 3] = [ReportType::Results, ReportType::Improvement, ReportType::Plan];

    /// Display name as used on the report cover page
    pub fn display_name(&self) -> &'static str {
        match self {
            ReportType::Results => "Results Report",
            ReportType::Improvement => "Improvement Report",
            ReportType::Plan => "Next Cycle Plan",
        }
    }

    /// Short label stored in the report_type column
    pub fn label(&self) -> &'static str {
        match self {
            ReportType::Results => "Results",
            ReportType::Improvement => "Improvement",
            ReportType::Plan => "Plan",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            ReportType::Results => "results_data",
            ReportType::Improvement => "improvement_data",
            ReportType::Plan => "plan_data",
        }
    }

    /// Column order of this report's table
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            ReportType::Results => RESULTS_COLUMNS,
            ReportType::Improvement => IMPROVEMENT_COLUMNS,
            ReportType::Plan => PLAN_COLUMNS,
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ReportType {
    type Err = TrackerError;

    fn from_str(s: &str) -> TrackerResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "results report" | "results" => Ok(ReportType::Results),
            "improvement report" | "improvement" => Ok(ReportType::Improvement),
            "next cycle plan" | "plan" => Ok(ReportType::Plan),
            _ => Err(TrackerError::InvalidReportType(s.to_string())),
        }
    }
}

// ============================================================================
// EXTRACTED METADATA
// ============================================================================

/// Accept any JSON scalar as text; null and missing become ""
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    })
}

/// One outcome of a Results Report or Next Cycle Plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedOutcome {
    #[serde(deserialize_with = "lenient_string")]
    pub outcome_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub outcome_text: String,
    #[serde(deserialize_with = "lenient_string")]
    pub related_competency_or_function: String,
    #[serde(deserialize_with = "lenient_string")]
    pub strategic_plan_theme: String,
    #[serde(deserialize_with = "lenient_string")]
    pub core_objective: String,

    // Results Report
    #[serde(deserialize_with = "lenient_string")]
    pub assessment_method: String,
    /// Short method summary used for year-over-year comparison
    #[serde(deserialize_with = "lenient_string")]
    pub assessment_method_normalized: String,
    #[serde(deserialize_with = "lenient_string")]
    pub sample_size: String,
    #[serde(deserialize_with = "lenient_string")]
    pub benchmark: String,
    #[serde(deserialize_with = "lenient_string")]
    pub result_value: String,
    #[serde(deserialize_with = "lenient_string")]
    pub achievement_level: String,
    #[serde(deserialize_with = "lenient_string")]
    pub gap_from_benchmark: String,
    #[serde(deserialize_with = "lenient_string")]
    pub proposed_improvement: String,
    #[serde(deserialize_with = "lenient_string")]
    pub responsible_party: String,
    #[serde(deserialize_with = "lenient_string")]
    pub improvement_timeline: String,

    // Next Cycle Plan
    #[serde(deserialize_with = "lenient_string")]
    pub planned_method: String,
    #[serde(deserialize_with = "lenient_string")]
    pub planned_benchmark: String,
    #[serde(deserialize_with = "lenient_string")]
    pub action_steps: String,
}

/// One improvement of an Improvement Report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedImprovement {
    #[serde(deserialize_with = "lenient_string")]
    pub outcome_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub improvement_action_taken: String,
    /// Yes/No/Partial
    #[serde(deserialize_with = "lenient_string")]
    pub connection_to_previous: String,
    #[serde(deserialize_with = "lenient_string")]
    pub previous_proposal_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedReport {
    /// Left as text; validated when the report is resolved
    #[serde(deserialize_with = "lenient_string")]
    pub unit_type: String,
    #[serde(deserialize_with = "lenient_string")]
    pub unit_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub college_division: String,
    #[serde(deserialize_with = "lenient_string")]
    pub degree_level: String,
    #[serde(deserialize_with = "lenient_string")]
    pub modality: String,
    /// "YYYY-YYYY"
    #[serde(deserialize_with = "lenient_string")]
    pub academic_year: String,
    pub outcomes: Vec<ExtractedOutcome>,
    pub improvements: Vec<ExtractedImprovement>,
}

impl ExtractedReport {
    /// Outcome ids in report order (improvement ids for Improvement Reports)
    pub fn outcome_ids(&self, report_type: ReportType) -> Vec<String> {
        match report_type {
            ReportType::Improvement => self.improvements.iter().map(|i| i.outcome_id.clone()).collect(),
            _ => self.outcomes.iter().map(|o| o.outcome_id.clone()).collect(),
        }
    }
}

/// Parse the answer text of an extraction call
///
/// Everything from the first `{` to the last `}` is taken as the JSON object,
/// so prose or code fences around it are ignored.
pub fn parse_extraction(answer: &str) -> TrackerResult<ExtractedReport> {
    let start = answer.find('{');
    let end = answer.rfind('}');

    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &answer[s..=e],
        _ => {
            return Err(TrackerError::MalformedExtraction(
                "Could not parse JSON from response".to_string(),
            ))
        }
    };

    serde_json::from_str(json).map_err(|e| TrackerError::MalformedExtraction(e.to_string()))
}

// ============================================================================
// STORAGE ROWS
// ============================================================================

/// A flattened row for one outcome, keyed by column name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub report_type: ReportType,
    pub fields: HashMap<String, String>,
}

impl ReportRow {
    fn new(report_type: ReportType) -> Self {
        ReportRow {
            report_type,
            fields: HashMap::new(),
        }
    }

    fn set(&mut self, column: &str, value: impl Into<String>) {
        self.fields.insert(column.to_string(), value.into());
    }

    /// Value of a column, "" when unset
    pub fn get(&self, column: &str) -> &str {
        self.fields.get(column).map(String::as_str).unwrap_or("")
    }

    pub fn unit_id(&self) -> &str {
        self.get("unit_id")
    }

    pub fn academic_year(&self) -> &str {
        self.get("academic_year")
    }

    pub fn outcome_id(&self) -> &str {
        self.get("outcome_id")
    }

    /// Upsert key: unit_id|academic_year|outcome_id
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.unit_id(), self.academic_year(), self.outcome_id())
    }

    /// Values in the table's column order
    pub fn values(&self) -> Vec<String> {
        self.report_type
            .columns()
            .iter()
            .map(|c| self.get(c).to_string())
            .collect()
    }
}

/// Identity of the unit a report's rows belong to
#[derive(Debug, Clone, PartialEq)]
pub struct RowIdentity<'a> {
    pub unit_id: &'a str,
    pub unit_type: UnitType,
    /// Canonical registry name when matched, otherwise the extracted name
    pub unit_name: &'a str,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Flatten extracted metadata into one row per outcome/improvement
pub fn prepare_rows(
    report: &ExtractedReport,
    report_type: ReportType,
    identity: &RowIdentity<'_>,
    now: DateTime<Utc>,
) -> Vec<ReportRow> {
    let timestamp = now.to_rfc3339();

    let mut base = ReportRow::new(report_type);
    base.set("unit_id", identity.unit_id);
    base.set("unit_type", identity.unit_type.as_str());
    base.set("unit_name", identity.unit_name);
    base.set("college_division", report.college_division.as_str());
    base.set("academic_year", report.academic_year.as_str());
    base.set("report_type", report_type.label());
    base.set("upload_timestamp", timestamp.as_str());
    base.set("last_updated", timestamp.as_str());

    match report_type {
        ReportType::Results => {
            base.set("degree_level", report.degree_level.as_str());
            base.set("modality", report.modality.as_str());

            report
                .outcomes
                .iter()
                .map(|o| {
                    let mut row = base.clone();
                    row.set("outcome_id", o.outcome_id.as_str());
                    row.set("outcome_text", truncate_chars(&o.outcome_text, OUTCOME_TEXT_MAX));
                    row.set("outcome_label", identity.unit_type.outcome_label());
                    row.set("related_competency_or_function", o.related_competency_or_function.as_str());
                    row.set("strategic_plan_theme", o.strategic_plan_theme.as_str());
                    row.set("core_objective", o.core_objective.as_str());
                    row.set("assessment_method", o.assessment_method.as_str());
                    row.set("assessment_method_normalized", o.assessment_method_normalized.as_str());
                    row.set("sample_size", o.sample_size.as_str());
                    row.set("benchmark", o.benchmark.as_str());
                    row.set("result_value", o.result_value.as_str());
                    row.set("achievement_level", o.achievement_level.as_str());
                    row.set("gap_from_benchmark", o.gap_from_benchmark.as_str());
                    row.set(
                        "proposed_improvement",
                        truncate_chars(&o.proposed_improvement, PROPOSED_IMPROVEMENT_MAX),
                    );
                    row.set("responsible_party", o.responsible_party.as_str());
                    row.set("improvement_timeline", o.improvement_timeline.as_str());
                    row
                })
                .collect()
        }
        ReportType::Improvement => report
            .improvements
            .iter()
            .map(|i| {
                let mut row = base.clone();
                row.set("outcome_id", i.outcome_id.as_str());
                row.set(
                    "improvement_action_taken",
                    truncate_chars(&i.improvement_action_taken, IMPROVEMENT_ACTION_MAX),
                );
                row.set("connection_to_previous", i.connection_to_previous.as_str());
                row.set("previous_proposal_text", i.previous_proposal_text.as_str());
                row
            })
            .collect(),
        ReportType::Plan => {
            base.set("degree_level", report.degree_level.as_str());

            report
                .outcomes
                .iter()
                .map(|o| {
                    let mut row = base.clone();
                    row.set("outcome_id", o.outcome_id.as_str());
                    row.set("outcome_text", truncate_chars(&o.outcome_text, OUTCOME_TEXT_MAX));
                    row.set("outcome_label", identity.unit_type.outcome_label());
                    row.set("related_competency_or_function", o.related_competency_or_function.as_str());
                    row.set("strategic_plan_theme", o.strategic_plan_theme.as_str());
                    row.set("core_objective", o.core_objective.as_str());
                    row.set("planned_method", o.planned_method.as_str());
                    row.set("planned_benchmark", o.planned_benchmark.as_str());
                    row.set("action_steps", truncate_chars(&o.action_steps, ACTION_STEPS_MAX));
                    row.set("responsible_party", o.responsible_party.as_str());
                    row
                })
                .collect()
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_ANSWER: &str = r#"Here is the extracted metadata:
```json
{
  "unit_type": "Academic",
  "unit_name": "Comp Sci",
  "college_division": "College of Engineering",
  "degree_level": "UG",
  "modality": "On-campus",
  "academic_year": "2023-2024",
  "outcomes": [
    {
      "outcome_id": "SLO 1",
      "outcome_text": "Students will write correct programs.",
      "assessment_method": "Final exam in CSE 1310, questions 4-9",
      "assessment_method_normalized": "CSE 1310 final exam",
      "sample_size": 112,
      "benchmark": "70% score 3 or higher",
      "result_value": "81%",
      "achievement_level": "Fully Achieved",
      "gap_from_benchmark": 11,
      "proposed_improvement": null
    }
  ]
}
```"#;

    fn identity() -> RowIdentity<'static> {
        RowIdentity {
            unit_id: "COLLEGEOFE-ABC123",
            unit_type: UnitType::Academic,
            unit_name: "Computer Science",
        }
    }

    #[test]
    fn test_report_type_parse() {
        assert_eq!("Results Report".parse::<ReportType>(), Ok(ReportType::Results));
        assert_eq!("improvement".parse::<ReportType>(), Ok(ReportType::Improvement));
        assert_eq!("Next Cycle Plan".parse::<ReportType>(), Ok(ReportType::Plan));
        assert!("Annual Report".parse::<ReportType>().is_err());
    }

    #[test]
    fn test_report_columns_start_with_key_fields() {
        for report_type in ReportType::ALL {
            let columns = report_type.columns();
            assert_eq!(columns[0], "unit_id");
            assert!(columns.contains(&"academic_year"));
            assert!(columns.contains(&"outcome_id"));
            assert_eq!(columns[columns.len() - 1], "last_updated");
        }
    }

    #[test]
    fn test_achievement_level_parse() {
        assert!(AchievementLevel::parse("Fully Achieved").is_fully_achieved());
        assert!(AchievementLevel::parse(" fully achieved ").is_fully_achieved());
        assert_eq!(AchievementLevel::parse("Partially Achieved"), AchievementLevel::PartiallyAchieved);
        assert_eq!(
            AchievementLevel::parse("Mostly Achieved"),
            AchievementLevel::Other("Mostly Achieved".to_string())
        );
        assert!(!AchievementLevel::parse("Mostly Achieved").is_fully_achieved());
        assert_eq!(AchievementLevel::parse("Inconclusive").as_str(), "Inconclusive");
    }

    #[test]
    fn test_parse_extraction_with_surrounding_prose() {
        let report = parse_extraction(RESULTS_ANSWER).unwrap();
        assert_eq!(report.unit_name, "Comp Sci");
        assert_eq!(report.academic_year, "2023-2024");
        assert_eq!(report.outcomes.len(), 1);

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.sample_size, "112");
        assert_eq!(outcome.gap_from_benchmark, "11");
        assert_eq!(outcome.proposed_improvement, "");
        assert_eq!(outcome.responsible_party, "");
        assert!(report.improvements.is_empty());
    }

    #[test]
    fn test_parse_extraction_without_json() {
        let err = parse_extraction("I could not read the report.").unwrap_err();
        assert!(matches!(err, TrackerError::MalformedExtraction(_)));

        let err = parse_extraction("} backwards {").unwrap_err();
        assert!(matches!(err, TrackerError::MalformedExtraction(_)));
    }

    #[test]
    fn test_parse_extraction_invalid_json() {
        let err = parse_extraction("{\"unit_name\": }").unwrap_err();
        assert!(matches!(err, TrackerError::MalformedExtraction(_)));
    }

    #[test]
    fn test_prepare_results_rows() {
        let report = parse_extraction(RESULTS_ANSWER).unwrap();
        let now = Utc::now();
        let rows = prepare_rows(&report, ReportType::Results, &identity(), now);

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.unit_id(), "COLLEGEOFE-ABC123");
        assert_eq!(row.get("unit_name"), "Computer Science");
        assert_eq!(row.get("report_type"), "Results");
        assert_eq!(row.get("outcome_label"), "Student Learning Outcome");
        assert_eq!(row.get("assessment_method_normalized"), "CSE 1310 final exam");
        assert_eq!(row.get("upload_timestamp"), now.to_rfc3339());
        assert_eq!(row.key(), "COLLEGEOFE-ABC123|2023-2024|SLO 1");
        assert_eq!(row.values().len(), ReportType::Results.columns().len());
    }

    #[test]
    fn test_prepare_rows_truncates_long_text() {
        let report = ExtractedReport {
            unit_type: "Administrative".to_string(),
            unit_name: "Career Services".to_string(),
            academic_year: "2024-2025".to_string(),
            outcomes: vec![ExtractedOutcome {
                outcome_id: "O1".to_string(),
                outcome_text: "é".repeat(600),
                action_steps: "x".repeat(700),
                ..Default::default()
            }],
            ..Default::default()
        };
        let identity = RowIdentity {
            unit_id: "STUDENTAFF-000001",
            unit_type: UnitType::Administrative,
            unit_name: "Career Services",
        };

        let rows = prepare_rows(&report, ReportType::Plan, &identity, Utc::now());
        assert_eq!(rows[0].get("outcome_text").chars().count(), 500);
        assert_eq!(rows[0].get("action_steps").len(), 500);
        assert_eq!(rows[0].get("outcome_label"), "Outcome");
        assert_eq!(rows[0].get("report_type"), "Plan");
        // Results-only columns are absent from plan rows
        assert_eq!(rows[0].get("achievement_level"), "");
    }

    #[test]
    fn test_prepare_improvement_rows() {
        let report = parse_extraction(
            r#"{"unit_type": "Academic", "unit_name": "Biology", "academic_year": "2024-2025",
                "improvements": [
                    {"outcome_id": "SLO 2", "improvement_action_taken": "Added lab practicum", "connection_to_previous": "Yes"},
                    {"outcome_id": "SLO 3", "improvement_action_taken": "Revised rubric", "connection_to_previous": "Partial"}
                ]}"#,
        )
        .unwrap();

        let rows = prepare_rows(&report, ReportType::Improvement, &identity(), Utc::now());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].outcome_id(), "SLO 3");
        assert_eq!(rows[1].get("connection_to_previous"), "Partial");
        assert_eq!(rows[1].get("report_type"), "Improvement");
        assert_eq!(report.outcome_ids(ReportType::Improvement), vec!["SLO 2", "SLO 3"]);
    }
}
