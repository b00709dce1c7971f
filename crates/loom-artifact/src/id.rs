//! Artifact ID conventions
//!
//! IDs are prefix-coded: the part before the first `-` selects the
//! [`ArtifactType`]. Most IDs also carry a domain code and a three-digit
//! sequence (`AC-ORD-001`); domain-model names carry only the code
//! (`ENT-ORDER`); test cases embed the criterion they test
//! (`TC-AC-ORD-001-P01`).

use crate::artifact::ArtifactType;
use once_cell::sync::Lazy;
use regex::Regex;

/// Prefix to type lookup
const PREFIXES: &[(&str, ArtifactType)] = &[
    ("US", ArtifactType::UserStory),
    ("NFR", ArtifactType::Nfr),
    ("AC", ArtifactType::AcceptanceCriteria),
    ("BR", ArtifactType::BusinessRule),
    ("ENT", ArtifactType::Entity),
    ("VO", ArtifactType::ValueObject),
    ("BC", ArtifactType::BoundedContext),
    ("TS", ArtifactType::TechSpec),
    ("IC", ArtifactType::InterfaceOperation),
    ("AGG", ArtifactType::AggregateDesign),
    ("SEQ", ArtifactType::Sequence),
    ("DT", ArtifactType::DataTable),
    ("TC", ArtifactType::TestCase),
    ("API", ArtifactType::ApiEndpoint),
    ("EVT", ArtifactType::Event),
    ("CMD", ArtifactType::Command),
    ("TKT", ArtifactType::Ticket),
    ("SKL", ArtifactType::CodeSkeleton),
];

// Test-case IDs come first so `TC-AC-...` is not split into an AC match.
static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:TC-AC-[A-Z]+-\d{3}-[PNBH]\d{2}|(?:US|NFR|AC|BR|TS|IC|AGG|SEQ|DT|API|EVT|CMD|TKT|SKL)-[A-Z]+-\d{3}|(?:ENT|VO|BC)-[A-Z]+)\b",
    )
    .unwrap_or_else(|e| unreachable!("static ID pattern is valid: {e}"))
});

/// Infer the artifact type from an ID's prefix
///
/// Returns `None` for unrecognized prefixes; such IDs are simply not
/// artifacts.
#[must_use]
pub fn type_from_id(id: &str) -> Option<ArtifactType> {
    let prefix = id.split('-').next()?;
    PREFIXES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, t)| *t)
}

/// Whether the whole string is a well-formed artifact ID
#[must_use]
pub fn is_artifact_id(id: &str) -> bool {
    ID_PATTERN
        .find(id)
        .is_some_and(|m| m.start() == 0 && m.end() == id.len())
}

/// Every ID-shaped token in `text`, with byte offsets, in order of appearance
pub fn find_ids(text: &str) -> impl Iterator<Item = (usize, &str)> {
    ID_PATTERN.find_iter(text).map(|m| (m.start(), m.as_str()))
}

/// Distinct IDs in `text`, in order of first appearance
#[must_use]
pub fn extract_ids(text: &str) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    find_ids(text)
        .filter(|(_, id)| seen.insert(*id))
        .map(|(_, id)| id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Layer;
    use pretty_assertions::assert_eq;

    #[test]
    fn prefix_lookup() {
        assert_eq!(type_from_id("US-ORD-001"), Some(ArtifactType::UserStory));
        assert_eq!(type_from_id("ENT-ORDER"), Some(ArtifactType::Entity));
        assert_eq!(type_from_id("TC-AC-ORD-001-P01"), Some(ArtifactType::TestCase));
        assert_eq!(type_from_id("SKL-ORD-001").map(ArtifactType::layer), Some(Layer::L3));
        assert_eq!(type_from_id("XYZ-ORD-001"), None);
        assert_eq!(type_from_id(""), None);
    }

    #[test]
    fn test_case_ids_are_not_split() {
        let ids = extract_ids("Covers TC-AC-ORD-001-P01 and AC-ORD-002.");
        assert_eq!(ids, vec!["TC-AC-ORD-001-P01", "AC-ORD-002"]);
    }

    #[test]
    fn extract_deduplicates_in_order() {
        let ids = extract_ids("AC-ORD-002, US-ORD-001, AC-ORD-002, ENT-ORDER");
        assert_eq!(ids, vec!["AC-ORD-002", "US-ORD-001", "ENT-ORDER"]);
    }

    #[test]
    fn partial_tokens_do_not_match() {
        assert!(extract_ids("AC-ORD-01 and XAC-ORD-001 and ac-ord-001").is_empty());
    }

    #[test]
    fn whole_id_check() {
        assert!(is_artifact_id("BR-PAY-010"));
        assert!(is_artifact_id("VO-MONEY"));
        assert!(!is_artifact_id("BR-PAY-010 trailing"));
        assert!(!is_artifact_id("see BR-PAY-010"));
    }

    proptest::proptest! {
        #[test]
        fn embedded_ids_are_found(domain in "[A-Z]{2,5}", seq in 0u16..1000, filler in "[a-z ,.]{0,40}") {
            let id = format!("BR-{domain}-{seq:03}");
            let text = format!("{filler} {id} {filler}");
            proptest::prop_assert_eq!(extract_ids(&text), vec![id.clone()]);
            proptest::prop_assert!(is_artifact_id(&id));
        }
    }
}
