// 📈 Stagnation Detector - Outcomes achieved year after year
//
// Establishes only the mechanical precondition: the most recent prior years
// were all Fully Achieved. Whether the assessment method stayed the same is
// left to a later judgment step (needs_ai_verification).
//
// academic_year is compared lexically; this is correct for zero-padded
// "YYYY-YYYY" labels only.

use crate::report::AchievementLevel;
use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

/// Years considered by the detector
pub const STAGNATION_WINDOW: usize = 3;

// ============================================================================
// HISTORICAL OUTCOME RECORD
// ============================================================================

/// One prior result for a unit+outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalOutcomeRecord {
    pub unit_id: String,
    pub outcome_id: String,
    /// "2022-2023"
    pub academic_year: String,
    pub achievement_level: String,
    #[serde(default)]
    pub assessment_method_normalized: String,
    /// Raw method text, used when no normalized summary exists
    #[serde(default)]
    pub assessment_method: String,
}

impl HistoricalOutcomeRecord {
    pub fn achievement(&self) -> AchievementLevel {
        AchievementLevel::parse(&self.achievement_level)
    }

    /// Normalized method summary, falling back to the raw method text
    pub fn method_summary(&self) -> &str {
        if self.assessment_method_normalized.trim().is_empty() {
            &self.assessment_method
        } else {
            &self.assessment_method_normalized
        }
    }
}

/// Drop records from `current_year` onwards so only prior cycles are counted
pub fn prior_history(records: Vec<HistoricalOutcomeRecord>, current_year: &str) -> Vec<HistoricalOutcomeRecord> {
    if current_year.trim().is_empty() {
        return records;
    }

    records
        .into_iter()
        .filter(|r| r.academic_year.as_str() < current_year)
        .collect()
}

// ============================================================================
// POLICY
// ============================================================================

/// How much history the detector demands before it may flag an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagnationPolicy {
    /// Fewer prior records than this → insufficient_history
    pub min_history: usize,

    /// Most recent records that must all be Fully Achieved
    pub window: usize,
}

impl StagnationPolicy {
    /// Require a full window of prior years (the default)
    pub fn strict() -> Self {
        StagnationPolicy {
            min_history: STAGNATION_WINDOW,
            window: STAGNATION_WINDOW,
        }
    }

    /// Accept two prior years as enough history
    pub fn lenient() -> Self {
        StagnationPolicy {
            min_history: 2,
            window: STAGNATION_WINDOW,
        }
    }

    /// Build a policy with a custom minimum, clamped to 1..=window
    pub fn with_min_history(min_history: usize) -> Self {
        StagnationPolicy {
            min_history: min_history.clamp(1, STAGNATION_WINDOW),
            window: STAGNATION_WINDOW,
        }
    }
}

impl Default for StagnationPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

// ============================================================================
// VERDICT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotStagnantReason {
    InsufficientHistory,
    NotAllAchieved,
}

impl NotStagnantReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotStagnantReason::InsufficientHistory => "insufficient_history",
            NotStagnantReason::NotAllAchieved => "not_all_achieved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagnationVerdict {
    pub stagnant: bool,

    /// Set only when not stagnant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NotStagnantReason>,

    pub years_achieved: usize,
    pub years: Vec<String>,
    pub methods: Vec<String>,

    /// Method equivalence still has to be judged downstream
    pub needs_ai_verification: bool,
}

impl StagnationVerdict {
    fn not_stagnant(reason: NotStagnantReason) -> Self {
        StagnationVerdict {
            stagnant: false,
            reason: Some(reason),
            years_achieved: 0,
            years: Vec::new(),
            methods: Vec::new(),
            needs_ai_verification: false,
        }
    }

    /// Prompt section for the downstream judgment step; empty when not stagnant
    pub fn analysis_context(&self) -> String {
        if !self.stagnant {
            return String::new();
        }

        format!(
            "## STAGNATION CHECK REQUIRED\n\n\
             Historical data shows this outcome may have been Fully Achieved for {} consecutive years:\n\
             Years: {}\n\
             Methods used: {}\n\n\
             Please evaluate:\n\
             1. Are these methodologies functionally the same? (Same test/exam in same course counts as same, \
             even if wording differs. Different test OR different course = different methodology)\n\
             2. If methodology is unchanged AND outcome achieved for 3+ years, include a gentle note suggesting \
             the unit consider evolving their assessment (raising benchmark, refining outcome, changing \
             methodology, or replacing with more challenging outcome).\n\n\
             Frame this supportively - sustained achievement is positive, but assessment should evolve over time.\n",
            self.years_achieved,
            self.years.join(", "),
            self.methods.join("; "),
        )
    }
}

// ============================================================================
// DETECTION
// ============================================================================

/// Check one unit+outcome history with the default policy
pub fn check_stagnation(history: &[HistoricalOutcomeRecord]) -> StagnationVerdict {
    check_stagnation_with(&StagnationPolicy::default(), history)
}

/// Check one unit+outcome history
///
/// `history` holds prior years only and may arrive in any order.
pub fn check_stagnation_with(policy: &StagnationPolicy, history: &[HistoricalOutcomeRecord]) -> StagnationVerdict {
    if history.len() < policy.min_history {
        return StagnationVerdict::not_stagnant(NotStagnantReason::InsufficientHistory);
    }

    let mut sorted: Vec<&HistoricalOutcomeRecord> = history.iter().collect();
    sorted.sort_by(|a, b| a.academic_year.cmp(&b.academic_year));

    let start = sorted.len().saturating_sub(policy.window);
    let recent = &sorted[start..];
    if recent.is_empty() {
        return StagnationVerdict::not_stagnant(NotStagnantReason::InsufficientHistory);
    }

    if !recent.iter().all(|r| r.achievement().is_fully_achieved()) {
        return StagnationVerdict::not_stagnant(NotStagnantReason::NotAllAchieved);
    }

    debug!(
        "Outcome {} of {} fully achieved for {} years",
        recent[0].outcome_id,
        recent[0].unit_id,
        recent.len()
    );

    StagnationVerdict {
        stagnant: true,
        reason: None,
        years_achieved: recent.len(),
        years: recent.iter().map(|r| r.academic_year.clone()).collect(),
        methods: recent.iter().map(|r| r.method_summary().to_string()).collect(),
        needs_ai_verification: true,
    }
}

/// Verdict for one outcome of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeVerdict {
    pub outcome_id: String,
    pub verdict: StagnationVerdict,
}

/// Where prior results come from (the store, or an in-memory snapshot)
pub trait HistorySource {
    /// All stored records for one unit+outcome, in any order
    fn outcome_history(&self, unit_id: &str, outcome_id: &str) -> Result<Vec<HistoricalOutcomeRecord>>;
}

impl HistorySource for [HistoricalOutcomeRecord] {
    fn outcome_history(&self, unit_id: &str, outcome_id: &str) -> Result<Vec<HistoricalOutcomeRecord>> {
        Ok(self
            .iter()
            .filter(|r| r.unit_id == unit_id && r.outcome_id == outcome_id)
            .cloned()
            .collect())
    }
}

impl HistorySource for Vec<HistoricalOutcomeRecord> {
    fn outcome_history(&self, unit_id: &str, outcome_id: &str) -> Result<Vec<HistoricalOutcomeRecord>> {
        self.as_slice().outcome_history(unit_id, outcome_id)
    }
}

/// Run the detector for every outcome, in outcome order
///
/// Records from `current_year` onwards are dropped before checking.
pub fn scan_outcomes<S>(
    policy: &StagnationPolicy,
    source: &S,
    unit_id: &str,
    outcome_ids: &[String],
    current_year: &str,
) -> Result<Vec<OutcomeVerdict>>
where
    S: HistorySource + ?Sized,
{
    outcome_ids
        .iter()
        .map(|outcome_id| {
            let records = source.outcome_history(unit_id, outcome_id)?;
            let prior = prior_history(records, current_year);
            Ok(OutcomeVerdict {
                outcome_id: outcome_id.clone(),
                verdict: check_stagnation_with(policy, &prior),
            })
        })
        .collect()
}

/// First stagnant verdict, the one forwarded to the judgment step
pub fn first_stagnant(verdicts: &[OutcomeVerdict]) -> Option<&OutcomeVerdict> {
    verdicts.iter().find(|v| v.verdict.stagnant)
}

// ============================================================================
// TESTS
// ============================================================================
