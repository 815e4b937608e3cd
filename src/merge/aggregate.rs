//! Order-independent aggregation of raw records into merged records
//!
//! Every fold here is a set union, a vote with a deterministic tie-break, or
//! a sum over contributions keyed by source id. Folding the same raw records
//! again, in any order and on top of the previous result, yields the same
//! content.

use crate::graph::{
    MergedEntity, MergedRelationship, RawEntity, RawRelationship, Workspace, GRAPH_FIELD_SEP,
    UNKNOWN_ENTITY_TYPE,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Contribution key for stored weight that predates per-source tracking
pub const LEGACY_CONTRIBUTION: &str = "<stored>";

/// Split a joined description into trimmed, non-empty fragments
pub fn split_fragments(description: &str) -> BTreeSet<String> {
    description
        .split(GRAPH_FIELD_SEP)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Join fragments in their canonical (sorted) order
pub fn join_fragments(fragments: &BTreeSet<String>) -> String {
    fragments
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(GRAPH_FIELD_SEP)
}

/// Split a keyword string on commas and the field separator
pub fn split_keywords(keywords: &str) -> BTreeSet<String> {
    keywords
        .split(GRAPH_FIELD_SEP)
        .flat_map(|part| part.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn source_ids<'a>(ids: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    ids.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Document paths; a raw value may already be a `<SEP>`-joined list
fn file_paths<'a>(paths: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    paths.flat_map(split_fragments).collect()
}

/// Most frequent type; ties go to the lexicographically smallest.
///
/// The stored type counts as one vote unless it is the stub type, so a stub
/// is upgraded by the first real extraction of that entity.
pub fn vote_entity_type<'a>(
    batch_types: impl IntoIterator<Item = &'a str>,
    existing: Option<&str>,
) -> String {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for t in batch_types {
        let t = t.trim();
        if !t.is_empty() {
            *counts.entry(t.to_string()).or_default() += 1;
        }
    }
    if let Some(t) = existing.map(str::trim) {
        if !t.is_empty() && t != UNKNOWN_ENTITY_TYPE {
            *counts.entry(t.to_string()).or_default() += 1;
        }
    }

    // BTreeMap iterates in key order, so the first maximum is the smallest.
    let mut best: Option<(&String, usize)> = None;
    for (t, &n) in &counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((t, n));
        }
    }
    best.map(|(t, _)| t.clone())
        .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string())
}

fn stored_fragments(description: &str, fragments: &BTreeSet<String>) -> BTreeSet<String> {
    if fragments.is_empty() {
        split_fragments(description)
    } else {
        fragments.clone()
    }
}

/// Fold a group of raw entities sharing one name onto the stored record.
///
/// The returned description is the unsummarized join of all fragments.
pub fn fold_entity(
    name: &str,
    workspace: &Workspace,
    raws: &[RawEntity],
    existing: Option<&MergedEntity>,
    now: DateTime<Utc>,
) -> MergedEntity {
    let entity_type = vote_entity_type(
        raws.iter().map(|r| r.entity_type.as_str()),
        existing.map(|e| e.entity_type.as_str()),
    );

    let mut fragments = existing
        .map(|e| stored_fragments(&e.description, &e.description_fragments))
        .unwrap_or_default();
    for raw in raws {
        fragments.extend(split_fragments(&raw.description));
    }

    let mut ids = existing.map(|e| e.source_ids.clone()).unwrap_or_default();
    ids.extend(source_ids(raws.iter().map(|r| r.source_id.as_str())));
    let mut paths = existing.map(|e| e.file_paths.clone()).unwrap_or_default();
    paths.extend(file_paths(raws.iter().map(|r| r.file_path.as_str())));

    MergedEntity {
        name: name.to_string(),
        entity_type,
        description: join_fragments(&fragments),
        description_fragments: fragments,
        source_ids: ids,
        file_paths: paths,
        workspace: workspace.clone(),
        updated_at: now,
    }
}

/// Sum raw weights per source id. Each group is summed in sorted order so the
/// result does not depend on input order.
fn batch_contributions(raws: &[RawRelationship]) -> BTreeMap<String, f64> {
    let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for raw in raws {
        grouped
            .entry(raw.source_id.trim().to_string())
            .or_default()
            .push(raw.weight);
    }
    grouped
        .into_iter()
        .map(|(id, mut weights)| {
            weights.sort_by(f64::total_cmp);
            (id, weights.into_iter().sum())
        })
        .collect()
}

/// Fold a group of raw relationships sharing one endpoint pair onto the
/// stored record.
///
/// Weight is the sum of per-source contributions. A batch contribution
/// replaces the stored one for the same source id, so re-merging a source
/// does not double its weight. The stored endpoint order wins; otherwise the
/// first raw record's order is kept.
pub fn fold_relationship(
    workspace: &Workspace,
    raws: &[RawRelationship],
    existing: Option<&MergedRelationship>,
    now: DateTime<Utc>,
) -> Option<MergedRelationship> {
    let first = raws.first()?;
    let (source_name, target_name) = match existing {
        Some(e) => (e.source_name.clone(), e.target_name.clone()),
        None => (
            first.source_name.trim().to_string(),
            first.target_name.trim().to_string(),
        ),
    };

    let mut contributions = match existing {
        Some(e) if e.weight_contributions.is_empty() && e.weight != 0.0 => {
            BTreeMap::from([(LEGACY_CONTRIBUTION.to_string(), e.weight)])
        }
        Some(e) => e.weight_contributions.clone(),
        None => BTreeMap::new(),
    };
    contributions.extend(batch_contributions(raws));
    let weight = contributions.values().sum();

    let mut fragments = existing
        .map(|e| stored_fragments(&e.description, &e.description_fragments))
        .unwrap_or_default();
    let mut keywords = existing.map(|e| e.keywords.clone()).unwrap_or_default();
    for raw in raws {
        fragments.extend(split_fragments(&raw.description));
        keywords.extend(split_keywords(&raw.keywords));
    }

    let mut ids = existing.map(|e| e.source_ids.clone()).unwrap_or_default();
    ids.extend(source_ids(raws.iter().map(|r| r.source_id.as_str())));
    let mut paths = existing.map(|e| e.file_paths.clone()).unwrap_or_default();
    paths.extend(file_paths(raws.iter().map(|r| r.file_path.as_str())));

    Some(MergedRelationship {
        source_name,
        target_name,
        description: join_fragments(&fragments),
        description_fragments: fragments,
        keywords,
        weight,
        weight_contributions: contributions,
        source_ids: ids,
        file_paths: paths,
        workspace: workspace.clone(),
        updated_at: now,
    })
}

/// Placeholder for an endpoint that exists neither in the batch nor in
/// storage. It carries the relationship's descriptions and sources so it is
/// traceable to what created it.
pub fn stub_entity(
    name: &str,
    workspace: &Workspace,
    raws: &[RawRelationship],
    now: DateTime<Utc>,
) -> MergedEntity {
    let mut fragments = BTreeSet::new();
    for raw in raws {
        fragments.extend(split_fragments(&raw.description));
    }
    MergedEntity {
        name: name.to_string(),
        entity_type: UNKNOWN_ENTITY_TYPE.to_string(),
        description: join_fragments(&fragments),
        description_fragments: fragments,
        source_ids: source_ids(raws.iter().map(|r| r.source_id.as_str())),
        file_paths: file_paths(raws.iter().map(|r| r.file_path.as_str())),
        workspace: workspace.clone(),
        updated_at: now,
    }
}

/// Reject a raw relationship that cannot be merged
pub fn validate_relationship(raw: &RawRelationship) -> Result<(), String> {
    let key = raw.key();
    if key.a.is_empty() || key.b.is_empty() {
        return Err("relationship endpoint name is empty".to_string());
    }
    if key.is_self_loop() {
        return Err(format!("self-loop on {}", key.a));
    }
    if !raw.weight.is_finite() || raw.weight < 0.0 {
        return Err(format!("invalid weight {}", raw.weight));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> Workspace {
        Workspace::new("w1").unwrap()
    }

    fn rel(a: &str, b: &str, weight: f64, source_id: &str) -> RawRelationship {
        RawRelationship::new(a, b, weight)
            .with_description(format!("{} with {}", a, b))
            .with_keywords("partner, supply")
            .with_source_id(source_id)
    }

    #[test]
    fn fragments_are_deduplicated_and_sorted() {
        let fragments = split_fragments(" b <SEP>a<SEP><SEP>b");
        assert_eq!(join_fragments(&fragments), "a<SEP>b");
    }

    #[test]
    fn keywords_split_on_commas_and_separator() {
        let keywords = split_keywords("alpha, beta<SEP>gamma,,alpha");
        assert_eq!(keywords.len(), 3);
        assert!(keywords.contains("gamma"));
    }

    #[test]
    fn type_vote_prefers_majority_then_smallest() {
        assert_eq!(vote_entity_type(["ORG", "PERSON", "ORG"], None), "ORG");
        assert_eq!(vote_entity_type(["PERSON", "ORG"], None), "ORG");
        assert_eq!(vote_entity_type(["PERSON"], Some("ORG")), "ORG");
        assert_eq!(vote_entity_type(["PERSON"], Some(UNKNOWN_ENTITY_TYPE)), "PERSON");
        assert_eq!(vote_entity_type(["", " "], None), UNKNOWN_ENTITY_TYPE);
    }

    #[test]
    fn entity_fold_unions_descriptions_and_sources() {
        let raws = vec![
            RawEntity::new("A", "PERSON", "a1", "c1"),
            RawEntity::new("A", "PERSON", "a2", "c2"),
            RawEntity::new("A", "PERSON", "a1", "c1"),
        ];
        let merged = fold_entity("A", &ws(), &raws, None, Utc::now());
        assert_eq!(merged.description, "a1<SEP>a2");
        assert_eq!(merged.source_ids.len(), 2);
        assert_eq!(merged.entity_type, "PERSON");
    }

    #[test]
    fn entity_fold_is_idempotent_and_order_independent() {
        let raws = vec![
            RawEntity::new("A", "PERSON", "a1", "c1"),
            RawEntity::new("A", "ORG", "a2", "c2"),
            RawEntity::new("A", "PERSON", "a3", "c3"),
        ];
        let first = fold_entity("A", &ws(), &raws, None, Utc::now());
        let again = fold_entity("A", &ws(), &raws, Some(&first), Utc::now());
        assert!(first.same_content(&again));

        let mut reversed = raws.clone();
        reversed.reverse();
        let other = fold_entity("A", &ws(), &reversed, None, Utc::now());
        assert!(first.same_content(&other));
    }

    #[test]
    fn entity_fold_extends_summarized_record_from_fragments() {
        let mut stored = fold_entity(
            "A",
            &ws(),
            &[RawEntity::new("A", "ORG", "a1", "c1")],
            None,
            Utc::now(),
        );
        stored.description = "summary".to_string();
        let merged = fold_entity(
            "A",
            &ws(),
            &[RawEntity::new("A", "ORG", "a2", "c2")],
            Some(&stored),
            Utc::now(),
        );
        assert_eq!(merged.description, "a1<SEP>a2");
    }

    #[test]
    fn file_paths_fold_into_a_deduplicated_set() {
        let raws = vec![
            RawEntity::new("A", "PERSON", "a1", "c1").with_file_path("docs/a.md"),
            RawEntity::new("A", "PERSON", "a2", "c2").with_file_path("docs/b.md<SEP>docs/a.md"),
            RawEntity::new("A", "PERSON", "a3", "c3"),
        ];
        let first = fold_entity("A", &ws(), &raws, None, Utc::now());
        assert_eq!(join_fragments(&first.file_paths), "docs/a.md<SEP>docs/b.md");

        let later = [RawEntity::new("A", "PERSON", "a4", "c4").with_file_path(" docs/c.md ")];
        let grown = fold_entity("A", &ws(), &later, Some(&first), Utc::now());
        assert_eq!(grown.file_paths.len(), 3);
        assert!(grown.file_paths.contains("docs/c.md"));

        let edges = [
            rel("A", "B", 1.0, "c1").with_file_path("docs/a.md"),
            rel("B", "A", 1.0, "c2").with_file_path("docs/a.md"),
        ];
        let merged = fold_relationship(&ws(), &edges, None, Utc::now()).unwrap();
        assert_eq!(merged.file_paths.len(), 1);
        let stub = stub_entity("B", &ws(), &edges, Utc::now());
        assert!(stub.file_paths.contains("docs/a.md"));
    }

    #[test]
    fn weights_sum_across_raw_records() {
        let raws = vec![rel("A", "B", 1.0, "c1"), rel("B", "A", 2.5, "c1")];
        let merged = fold_relationship(&ws(), &raws, None, Utc::now()).unwrap();
        assert_eq!(merged.weight, 3.5);
        assert_eq!(merged.source_name, "A");
        assert_eq!(merged.keywords.len(), 2);
        assert_eq!(merged.description_fragments.len(), 2);
    }

    #[test]
    fn remerging_a_source_does_not_double_weight() {
        let raws = vec![rel("A", "B", 1.0, "c1"), rel("A", "B", 2.0, "c2")];
        let first = fold_relationship(&ws(), &raws, None, Utc::now()).unwrap();
        assert_eq!(first.weight, 3.0);
        let again = fold_relationship(&ws(), &raws, Some(&first), Utc::now()).unwrap();
        assert!(first.same_content(&again));

        let more = vec![rel("A", "B", 4.0, "c3")];
        let grown = fold_relationship(&ws(), &more, Some(&first), Utc::now()).unwrap();
        assert_eq!(grown.weight, 7.0);
    }

    #[test]
    fn stored_direction_wins() {
        let stored = fold_relationship(&ws(), &[rel("B", "A", 1.0, "c1")], None, Utc::now())
            .unwrap();
        let merged = fold_relationship(
            &ws(),
            &[rel("A", "B", 1.0, "c2")],
            Some(&stored),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(merged.source_name, "B");
        assert_eq!(merged.target_name, "A");
    }

    #[test]
    fn legacy_weight_is_kept_as_a_contribution() {
        let mut stored = fold_relationship(&ws(), &[rel("A", "B", 5.0, "c1")], None, Utc::now())
            .unwrap();
        stored.weight_contributions.clear();
        let merged = fold_relationship(&ws(), &[rel("A", "B", 1.0, "c2")], Some(&stored), Utc::now())
            .unwrap();
        assert_eq!(merged.weight, 6.0);
        assert!(merged.weight_contributions.contains_key(LEGACY_CONTRIBUTION));
    }

    #[test]
    fn stub_carries_relationship_context() {
        let stub = stub_entity("Ghost", &ws(), &[rel("A", "Ghost", 1.0, "c9")], Utc::now());
        assert!(stub.is_stub());
        assert_eq!(stub.description, "A with Ghost");
        assert!(stub.source_ids.contains("c9"));
    }

    #[test]
    fn invalid_relationships_are_rejected() {
        assert!(validate_relationship(&rel("A", "B", 1.0, "c1")).is_ok());
        assert!(validate_relationship(&rel("A", "A", 1.0, "c1")).is_err());
        assert!(validate_relationship(&rel(" ", "B", 1.0, "c1")).is_err());
        assert!(validate_relationship(&rel("A", "B", f64::NAN, "c1")).is_err());
        assert!(validate_relationship(&rel("A", "B", -1.0, "c1")).is_err());
    }
}
