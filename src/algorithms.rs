use std::collections::{BTreeMap, HashSet};

use crate::models::{Person, PersonId, Relationship, TreeMergeStats};

/// Appends every edge of `incoming` not already in `existing`, keeping order.
/// Returns the number of edges added.
pub fn union_relationships(existing: &mut Vec<Relationship>, incoming: &[Relationship]) -> usize {
    let mut added = 0usize;
    for edge in incoming {
        if !existing.contains(edge) {
            existing.push(edge.clone());
            added += 1;
        }
    }
    added
}

/// Rewrites edge targets through `id_map`. Edges whose target has no entry
/// point outside the translated subgraph and are dropped.
pub fn translate_relationships(
    edges: &[Relationship],
    id_map: &BTreeMap<PersonId, PersonId>,
) -> Vec<Relationship> {
    let mut translated: Vec<Relationship> = Vec::with_capacity(edges.len());
    for edge in edges {
        let Some(target) = id_map.get(&edge.related_person_id) else {
            continue;
        };
        let edge = Relationship {
            related_person_id: target.clone(),
            kind: edge.kind,
        };
        if !translated.contains(&edge) {
            translated.push(edge);
        }
    }
    translated
}

/// Distinct persons referenced by `person`'s own edges, in edge order.
pub fn related_person_ids(person: &Person) -> Vec<PersonId> {
    let mut seen = HashSet::with_capacity(person.relationships.len());
    person
        .relationships
        .iter()
        .filter(|edge| seen.insert(edge.related_person_id.clone()))
        .map(|edge| edge.related_person_id.clone())
        .collect()
}

pub fn relationship_stats(persons: &[Person]) -> TreeMergeStats {
    let mut relationship_types = BTreeMap::new();
    let mut total_relationships = 0usize;
    for person in persons {
        total_relationships += person.relationships.len();
        for edge in &person.relationships {
            *relationship_types.entry(edge.kind).or_insert(0usize) += 1;
        }
    }

    let average_relationships_per_person = if persons.is_empty() {
        0.0
    } else {
        total_relationships as f64 / persons.len() as f64
    };

    TreeMergeStats {
        total_persons: persons.len(),
        total_relationships,
        relationship_types,
        average_relationships_per_person,
    }
}
