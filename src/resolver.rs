// 🔍 Unit Resolver - Map an extracted unit name to a registry entry
// Four tiers, strict order: Exact, Previous Name, Fuzzy (substring), Terms (word overlap)

use crate::units::{RegistryEntry, UnitType};
use serde::{Deserialize, Serialize};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Shared terms needed to become the running best in the terms tier
pub const MIN_RUNNING_OVERLAP: usize = 2;

/// Shared terms needed for the running best to be accepted
pub const MIN_ACCEPTED_OVERLAP: usize = 3;

// ============================================================================
// MATCH TYPE / CONFIDENCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Canonical name equal (case-insensitive, trimmed)
    Exact,

    /// Equal to one of the previous names
    PreviousName,

    /// One name contains the other
    Fuzzy,

    /// Enough shared words
    Terms,

    None,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::PreviousName => "previous_name",
            MatchType::Fuzzy => "fuzzy",
            MatchType::Terms => "terms",
            MatchType::None => "none",
        }
    }

    /// Confidence attached to each tier
    pub fn confidence(&self) -> Confidence {
        match self {
            MatchType::Exact | MatchType::PreviousName => Confidence::High,
            MatchType::Fuzzy => Confidence::Medium,
            MatchType::Terms => Confidence::Low,
            MatchType::None => Confidence::None,
        }
    }
}

/// Declared low to high so the derived ordering gives High > Medium > Low > None
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::None => "none",
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Confidence> {
        match s.trim().to_lowercase().as_str() {
            "none" => Some(Confidence::None),
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

// ============================================================================
// MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched_entry: Option<RegistryEntry>,
    pub match_type: MatchType,
    pub confidence: Confidence,
}

impl MatchResult {
    fn hit(entry: &RegistryEntry, match_type: MatchType) -> Self {
        MatchResult {
            matched_entry: Some(entry.clone()),
            match_type,
            confidence: match_type.confidence(),
        }
    }

    pub fn no_match() -> Self {
        MatchResult {
            matched_entry: None,
            match_type: MatchType::None,
            confidence: Confidence::None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.matched_entry.is_some()
    }

    pub fn unit_id(&self) -> Option<&str> {
        self.matched_entry.as_ref().map(|e| e.unit_id.as_str())
    }

    pub fn canonical_name(&self) -> Option<&str> {
        self.matched_entry.as_ref().map(|e| e.canonical_name.as_str())
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Resolve `extracted_name` against `registry` for one unit type
///
/// Entries of the other unit type are never considered. Within a tier the
/// first entry in iteration order wins; the terms tier keeps the entry with
/// the largest overlap (first one on ties).
pub fn resolve(extracted_name: &str, unit_type: UnitType, registry: &[RegistryEntry]) -> MatchResult {
    let extracted = extracted_name.trim().to_lowercase();
    let candidates: Vec<&RegistryEntry> = registry
        .iter()
        .filter(|e| e.unit_type == unit_type)
        .collect();

    // Tier 1: exact canonical name
    if let Some(entry) = candidates
        .iter()
        .find(|e| e.canonical_name.trim().to_lowercase() == extracted)
    {
        return MatchResult::hit(entry, MatchType::Exact);
    }

    // Tier 2: previous names
    if let Some(entry) = candidates.iter().find(|e| {
        e.previous_names
            .iter()
            .any(|alias| alias.trim().to_lowercase() == extracted)
    }) {
        return MatchResult::hit(entry, MatchType::PreviousName);
    }

    // Tier 3: containment either way; an empty side would contain trivially
    if !extracted.is_empty() {
        if let Some(entry) = candidates.iter().find(|e| {
            let canonical = e.canonical_name.trim().to_lowercase();
            !canonical.is_empty() && (canonical.contains(&extracted) || extracted.contains(&canonical))
        }) {
            return MatchResult::hit(entry, MatchType::Fuzzy);
        }
    }

    // Tier 4: word overlap
    let extracted_terms = terms(&extracted);
    let mut best: Option<&RegistryEntry> = None;
    let mut best_score = 0;

    for entry in &candidates {
        let canonical = entry.canonical_name.to_lowercase();
        let canonical_terms = terms(&canonical);
        let common = extracted_terms.intersection(&canonical_terms).count();

        if common > best_score && common >= MIN_RUNNING_OVERLAP {
            best_score = common;
            best = Some(*entry);
        }
    }

    match best {
        Some(entry) if best_score >= MIN_ACCEPTED_OVERLAP => MatchResult::hit(entry, MatchType::Terms),
        _ => MatchResult::no_match(),
    }
}

fn word_pattern() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"\b\w+\b").expect("word pattern is valid"))
}

/// Word set of a string (Unicode `\w` runs)
fn terms(s: &str) -> HashSet<&str> {
    word_pattern().find_iter(s).map(|m| m.as_str()).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, previous: &str) -> RegistryEntry {
        let mut e = RegistryEntry::new(name, "College of Testing", UnitType::Academic);
        e.set_previous_names_field(previous);
        e
    }

    fn sample_registry() -> Vec<RegistryEntry> {
        vec![
            entry("Computer Science", "CS Department; Comp Sci"),
            entry("Biology", "Life Sciences"),
            entry("Mechanical and Aerospace Engineering", ""),
            entry("Nursing", "School of Nursing"),
        ]
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
        assert!(Confidence::Low > Confidence::None);
    }

    #[test]
    fn test_every_canonical_name_is_exact() {
        let registry = sample_registry();
        for e in &registry {
            let result = resolve(&e.canonical_name, e.unit_type, &registry);
            assert_eq!(result.match_type, MatchType::Exact, "{}", e.canonical_name);
            assert_eq!(result.confidence, Confidence::High);
            assert_eq!(result.unit_id(), Some(e.unit_id.as_str()));
        }
    }

    #[test]
    fn test_every_alias_is_high_confidence() {
        let registry = sample_registry();
        for e in &registry {
            for alias in &e.previous_names {
                let result = resolve(alias, e.unit_type, &registry);
                assert!(
                    matches!(result.match_type, MatchType::Exact | MatchType::PreviousName),
                    "{} resolved as {:?}",
                    alias,
                    result.match_type
                );
                assert_eq!(result.confidence, Confidence::High);
            }
        }
    }

    #[test]
    fn test_exact_wins_over_previous_name() {
        // "Biology" is the canonical name of one entry and an alias of an earlier one
        let registry = vec![entry("Life Sciences", "Biology"), entry("Biology", "")];
        let result = resolve("biology", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(result.canonical_name(), Some("Biology"));
    }

    #[test]
    fn test_exact_is_case_and_whitespace_insensitive() {
        let registry = sample_registry();
        let result = resolve("  computer SCIENCE ", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::Exact);
    }

    #[test]
    fn test_previous_name_match() {
        let registry = sample_registry();
        let result = resolve("comp sci", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::PreviousName);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.canonical_name(), Some("Computer Science"));
    }

    #[test]
    fn test_empty_name_is_no_match() {
        let registry = sample_registry();
        let result = resolve("", UnitType::Academic, &registry);
        assert_eq!(result, MatchResult::no_match());

        let result = resolve("   ", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::None);
    }

    #[test]
    fn test_fuzzy_extracted_contains_canonical() {
        let registry = sample_registry();
        let result = resolve("Dept of Computer Science", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::Fuzzy);
        assert_eq!(result.confidence, Confidence::Medium);
        assert_eq!(result.canonical_name(), Some("Computer Science"));
    }

    #[test]
    fn test_fuzzy_canonical_contains_extracted() {
        let registry = sample_registry();
        let result = resolve("Aerospace Engineering", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::Fuzzy);
        assert_eq!(result.canonical_name(), Some("Mechanical and Aerospace Engineering"));
    }

    #[test]
    fn test_two_shared_terms_below_threshold() {
        // Neither contains the other; {computer, science} overlap is only 2
        let registry = sample_registry();
        let result = resolve("Computer and Information Science", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::None);
        assert_eq!(result.confidence, Confidence::None);
        assert!(result.matched_entry.is_none());
    }

    #[test]
    fn test_terms_match_three_shared() {
        let registry = sample_registry();
        let result = resolve(
            "Dept. of Mechanical & Aerospace Eng. (Engineering)",
            UnitType::Academic,
            &registry,
        );
        assert_eq!(result.match_type, MatchType::Terms);
        assert_eq!(result.confidence, Confidence::Low);
        assert_eq!(result.canonical_name(), Some("Mechanical and Aerospace Engineering"));
    }

    #[test]
    fn test_terms_keeps_largest_overlap() {
        let registry = vec![
            entry("Center for Teaching Learning", ""),
            entry("Center for Teaching Learning Innovation Excellence", ""),
        ];
        let result = resolve(
            "Excellence in Teaching Learning Innovation Office",
            UnitType::Academic,
            &registry,
        );
        assert_eq!(result.match_type, MatchType::Terms);
        assert_eq!(
            result.canonical_name(),
            Some("Center for Teaching Learning Innovation Excellence")
        );
    }

    #[test]
    fn test_terms_ties_keep_first() {
        let registry = vec![
            entry("Office of Research Integrity", ""),
            entry("Research Integrity Office Services", ""),
        ];
        let result = resolve("Integrity Research Office Board", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::Terms);
        assert_eq!(result.canonical_name(), Some("Office of Research Integrity"));
    }

    #[test]
    fn test_fuzzy_takes_precedence_over_terms() {
        // Second entry shares 4 words but is not a substring; first is a substring with 1 shared word
        let registry = vec![
            entry("Biology", ""),
            entry("Research Lab Department Of Biology", ""),
        ];
        let result = resolve("Biology Department Research Lab", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::Fuzzy);
        assert_eq!(result.canonical_name(), Some("Biology"));
    }

    #[test]
    fn test_other_namespace_ignored() {
        let mut admin = RegistryEntry::new("Computer Science", "IT", UnitType::Administrative);
        admin.set_previous_names_field("Comp Sci");
        let registry = vec![admin];

        let result = resolve("Computer Science", UnitType::Academic, &registry);
        assert_eq!(result.match_type, MatchType::None);
    }

    #[test]
    fn test_terms_tokenizer() {
        let t = terms("dept. of computer-science & stats_101");
        assert!(t.contains("dept"));
        assert!(t.contains("computer"));
        assert!(t.contains("science"));
        assert!(t.contains("stats_101"));
        assert!(!t.contains(""));
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn test_terms_tokenizer_unicode_words() {
        let t = terms("génie électrique (école)");
        assert_eq!(t.len(), 3);
        assert!(t.contains("génie"));
        assert!(t.contains("électrique"));
        assert!(t.contains("école"));
    }

    #[test]
    fn test_match_result_serializes_snake_case() {
        let registry = sample_registry();
        let result = resolve("Comp Sci", UnitType::Academic, &registry);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["match_type"], "previous_name");
        assert_eq!(json["confidence"], "high");
        assert_eq!(json["matched_entry"]["canonical_name"], "Computer Science");
    }
}
