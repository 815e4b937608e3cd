//! Connected-component partitioning of an extraction batch
//!
//! Entities linked (transitively) by relationships end up in the same
//! component; components share no entity, so they can be merged in parallel
//! without contending on each other's locks.

use crate::graph::{EdgeKey, RawBatch, RawEntity, RawRelationship};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// One connected group of entities and the relationships among them
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedComponent {
    /// Position in discovery order
    pub index: usize,
    pub entity_names: BTreeSet<String>,
    pub relationships: BTreeSet<EdgeKey>,
}

impl ConnectedComponent {
    pub fn size(&self) -> usize {
        self.entity_names.len()
    }
}

/// Informational shape of a partition. Never used for merge decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub component_count: usize,
    pub largest: usize,
    pub singletons: usize,
    /// Component sizes, largest first
    pub sizes: Vec<usize>,
}

impl PartitionStats {
    pub fn from_components(components: &[ConnectedComponent]) -> Self {
        let mut sizes: Vec<usize> = components.iter().map(ConnectedComponent::size).collect();
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        Self {
            component_count: components.len(),
            largest: sizes.first().copied().unwrap_or(0),
            singletons: sizes.iter().filter(|&&s| s == 1).count(),
            sizes,
        }
    }
}

/// Partition entity names and relationship endpoint pairs into components.
///
/// Total: an endpoint missing from `entities` becomes a member of its
/// component as if it had been listed. BFS is seeded in input order
/// (entities, then relationship endpoints), so indices follow first
/// discovery and the output is deterministic for a fixed input order.
pub fn partition(entities: &[String], relationships: &[(String, String)]) -> Vec<ConnectedComponent> {
    let mut order: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for name in entities {
        if seen.insert(name.as_str()) {
            order.push(name.as_str());
        }
    }

    // Build undirected adjacency
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for (a, b) in relationships {
        for endpoint in [a.as_str(), b.as_str()] {
            if seen.insert(endpoint) {
                order.push(endpoint);
            }
        }
        adj.entry(a.as_str()).or_default().push(b.as_str());
        adj.entry(b.as_str()).or_default().push(a.as_str());
    }

    let mut assignment: HashMap<&str, usize> = HashMap::with_capacity(order.len());
    let mut components: Vec<ConnectedComponent> = Vec::new();

    for seed in order {
        if assignment.contains_key(seed) {
            continue;
        }
        let index = components.len();
        let mut names = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([seed]);
        assignment.insert(seed, index);

        while let Some(current) = queue.pop_front() {
            names.insert(current.to_string());
            for &neighbor in adj.get(current).into_iter().flatten() {
                if !assignment.contains_key(neighbor) {
                    assignment.insert(neighbor, index);
                    queue.push_back(neighbor);
                }
            }
        }

        components.push(ConnectedComponent {
            index,
            entity_names: names,
            relationships: BTreeSet::new(),
        });
    }

    for (a, b) in relationships {
        if let Some(&index) = assignment.get(a.as_str()) {
            components[index]
                .relationships
                .insert(EdgeKey::new(a.as_str(), b.as_str()));
        }
    }

    components
}

/// A component together with the raw records that belong to it
#[derive(Debug, Clone)]
pub struct ComponentBatch {
    pub component: ConnectedComponent,
    /// Raw entities in batch order
    pub entities: Vec<RawEntity>,
    /// Raw relationships in batch order
    pub relationships: Vec<RawRelationship>,
}

impl ComponentBatch {
    pub fn index(&self) -> usize {
        self.component.index
    }
}

/// Partition a raw batch and hand every component its records.
///
/// Names are trimmed before grouping, matching how the merge engine keys them.
pub fn partition_batch(batch: &RawBatch) -> Vec<ComponentBatch> {
    let names: Vec<String> = batch.entities.iter().map(|e| e.key().to_string()).collect();
    let pairs: Vec<(String, String)> = batch
        .relationships
        .iter()
        .map(|r| {
            (
                r.source_name.trim().to_string(),
                r.target_name.trim().to_string(),
            )
        })
        .collect();

    let components = partition(&names, &pairs);
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for component in &components {
        for name in &component.entity_names {
            index_of.insert(name.as_str(), component.index);
        }
    }

    let mut batches: Vec<ComponentBatch> = components
        .iter()
        .map(|c| ComponentBatch {
            component: c.clone(),
            entities: Vec::new(),
            relationships: Vec::new(),
        })
        .collect();

    for entity in &batch.entities {
        if let Some(&index) = index_of.get(entity.key()) {
            batches[index].entities.push(entity.clone());
        }
    }
    for relationship in &batch.relationships {
        if let Some(&index) = index_of.get(relationship.source_name.trim()) {
            batches[index].relationships.push(relationship.clone());
        }
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn isolated_entities_are_singletons() {
        let components = partition(&names(&["A", "B", "C"]), &[]);
        assert_eq!(components.len(), 3);
        assert!(components.iter().all(|c| c.size() == 1));
        assert_eq!(components[0].index, 0);
        assert!(components[0].entity_names.contains("A"));
        assert!(components[2].entity_names.contains("C"));
    }

    #[test]
    fn linked_entities_share_a_component() {
        let components = partition(
            &names(&["A", "B", "C", "D", "E"]),
            &pairs(&[("A", "B"), ("C", "B"), ("D", "E")]),
        );
        assert_eq!(components.len(), 2);
        assert_eq!(
            components[0].entity_names,
            ["A", "B", "C"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(components[0].relationships.len(), 2);
        assert_eq!(components[1].entity_names.len(), 2);
        assert!(components[1].relationships.contains(&EdgeKey::new("E", "D")));
    }

    #[test]
    fn unknown_endpoint_becomes_member() {
        let components = partition(&names(&["A"]), &pairs(&[("A", "Ghost")]));
        assert_eq!(components.len(), 1);
        assert!(components[0].entity_names.contains("Ghost"));
    }

    #[test]
    fn indices_follow_first_discovery() {
        let components = partition(
            &names(&["Z", "Y"]),
            &pairs(&[("Y", "X"), ("W", "V")]),
        );
        let firsts: Vec<bool> = vec![
            components[0].entity_names.contains("Z"),
            components[1].entity_names.contains("Y"),
            components[2].entity_names.contains("W"),
        ];
        assert_eq!(firsts, vec![true, true, true]);
    }

    #[test]
    fn reversed_duplicate_relationships_collapse() {
        let components = partition(&names(&["A", "B"]), &pairs(&[("A", "B"), ("B", "A")]));
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].relationships.len(), 1);
    }

    #[test]
    fn stats_describe_partition() {
        let components = partition(&names(&["A", "B", "C", "D"]), &pairs(&[("A", "B"), ("B", "C")]));
        let stats = PartitionStats::from_components(&components);
        assert_eq!(stats.component_count, 2);
        assert_eq!(stats.largest, 3);
        assert_eq!(stats.singletons, 1);
        assert_eq!(stats.sizes, vec![3, 1]);
    }

    #[test]
    fn random_inputs_partition_exhaustively_and_disjointly() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let n = rng.gen_range(1..40);
            let entities: Vec<String> = (0..n).map(|i| format!("e{}", i)).collect();
            let edge_count = rng.gen_range(0..60);
            let relationships: Vec<(String, String)> = (0..edge_count)
                .map(|_| {
                    // Occasionally reference an entity outside the list.
                    let a = format!("e{}", rng.gen_range(0..n + 3));
                    let b = format!("e{}", rng.gen_range(0..n + 3));
                    (a, b)
                })
                .collect();

            let components = partition(&entities, &relationships);

            let mut expected: BTreeSet<String> = entities.iter().cloned().collect();
            for (a, b) in &relationships {
                expected.insert(a.clone());
                expected.insert(b.clone());
            }

            let mut covered: BTreeSet<String> = BTreeSet::new();
            let mut total = 0;
            for component in &components {
                total += component.entity_names.len();
                covered.extend(component.entity_names.iter().cloned());
            }
            assert_eq!(covered, expected);
            assert_eq!(total, expected.len(), "components must be disjoint");

            let edges: usize = components.iter().map(|c| c.relationships.len()).sum();
            let distinct: BTreeSet<EdgeKey> = relationships
                .iter()
                .map(|(a, b)| EdgeKey::new(a.as_str(), b.as_str()))
                .collect();
            assert_eq!(edges, distinct.len());
            for component in &components {
                for edge in &component.relationships {
                    assert!(component.entity_names.contains(&edge.a));
                    assert!(component.entity_names.contains(&edge.b));
                }
            }
        }
    }

    #[test]
    fn partition_batch_routes_raw_records() {
        let batch = RawBatch::new(
            vec![
                RawEntity::new("A", "PERSON", "a1", "c1"),
                RawEntity::new(" A ", "PERSON", "a2", "c2"),
                RawEntity::new("C", "PLACE", "c1", "c1"),
            ],
            vec![RawRelationship::new("B", "A", 1.0)],
        );
        let batches = partition_batch(&batch);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].entities.len(), 2);
        assert_eq!(batches[0].relationships.len(), 1);
        assert!(batches[0].component.entity_names.contains("B"));
        assert_eq!(batches[1].entities.len(), 1);
        assert!(batches[1].relationships.is_empty());
    }
}
