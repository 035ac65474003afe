use std::collections::{HashMap, HashSet};

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{Person, PersonId, Relationship, RelationshipViolation};

/// Checks edge symmetry across `persons`.
///
/// Edges into persons outside the slice are reported as unknown references
/// only when `closed` is set; a group tree legitimately points at persons
/// whose primary tree is elsewhere.
pub fn relationship_violations(persons: &[Person], closed: bool) -> Vec<RelationshipViolation> {
    let by_id: HashMap<&PersonId, &Person> = persons
        .iter()
        .map(|person| (&person.person_id, person))
        .collect();

    let mut violations = Vec::new();
    for person in persons {
        let mut seen: HashSet<&Relationship> = HashSet::with_capacity(person.relationships.len());
        for edge in &person.relationships {
            if !seen.insert(edge) {
                violations.push(RelationshipViolation::DuplicateEdge {
                    person_id: person.person_id.clone(),
                    edge: edge.clone(),
                });
                continue;
            }

            if edge.related_person_id == person.person_id {
                violations.push(RelationshipViolation::SelfReference {
                    person_id: person.person_id.clone(),
                });
                continue;
            }

            let Some(related) = by_id.get(&edge.related_person_id) else {
                if closed {
                    violations.push(RelationshipViolation::UnknownPersonReference {
                        person_id: person.person_id.clone(),
                        related_person_id: edge.related_person_id.clone(),
                    });
                }
                continue;
            };

            let expected = edge.reciprocal_for(&person.person_id);
            if !related.has_relationship(&expected) {
                violations.push(RelationshipViolation::MissingReciprocal {
                    person_id: person.person_id.clone(),
                    edge: edge.clone(),
                    expected,
                });
            }
        }
    }

    violations
}

pub fn ensure_symmetric(persons: &[Person]) -> Result<()> {
    let violations = relationship_violations(persons, false);
    if let Some(first) = violations.first() {
        return Err(LibError::invalid_with_code(
            first.error_code(),
            first.public_message(),
            anyhow!("relationship validation failed: {:?}", violations),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{PersonStatus, RelationshipType, TreeId};

    fn person(id: &str, relationships: Vec<Relationship>) -> Person {
        Person {
            person_id: PersonId::new(id),
            tree_id: TreeId::new("t1"),
            group_tree_ids: vec![],
            first_name: id.to_string(),
            middle_name: None,
            last_name: "Test".to_string(),
            birth_date: None,
            birth_place: None,
            gender: None,
            status: PersonStatus::Living,
            date_of_death: None,
            place_of_death: None,
            relationships,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn symmetric_parent_child_pair_is_clean() {
        let persons = vec![
            person("a", vec![Relationship::new("b", RelationshipType::Parent)]),
            person("b", vec![Relationship::new("a", RelationshipType::Child)]),
        ];
        assert!(relationship_violations(&persons, true).is_empty());
        assert!(ensure_symmetric(&persons).is_ok());
    }

    #[test]
    fn wrong_reciprocal_type_is_reported() {
        let persons = vec![
            person("a", vec![Relationship::new("b", RelationshipType::Parent)]),
            person("b", vec![Relationship::new("a", RelationshipType::Parent)]),
        ];
        let violations = relationship_violations(&persons, true);
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| matches!(
            v,
            RelationshipViolation::MissingReciprocal { person_id, expected, .. }
                if person_id.as_str() == "a"
                    && *expected == Relationship::new("a", RelationshipType::Child)
        )));
    }

    #[test]
    fn spouse_edges_must_be_mirrored() {
        let persons = vec![
            person("a", vec![Relationship::new("b", RelationshipType::Spouse)]),
            person("b", vec![]),
        ];
        let err = ensure_symmetric(&persons).expect_err("one-sided spouse edge should fail");
        assert_eq!(err.code, "relationship_missing_reciprocal");
    }

    #[test]
    fn self_reference_and_duplicates_are_reported() {
        let edge = Relationship::new("a", RelationshipType::Spouse);
        let persons = vec![person("a", vec![edge.clone(), edge])];
        let violations = relationship_violations(&persons, true);
        assert!(
            violations
                .iter()
                .any(|v| matches!(v, RelationshipViolation::SelfReference { .. }))
        );
        assert!(
            violations
                .iter()
                .any(|v| matches!(v, RelationshipViolation::DuplicateEdge { .. }))
        );
    }

    #[test]
    fn outside_references_only_reported_when_closed() {
        let persons = vec![person(
            "a",
            vec![Relationship::new("elsewhere", RelationshipType::Parent)],
        )];
        assert!(relationship_violations(&persons, false).is_empty());
        assert!(matches!(
            &relationship_violations(&persons, true)[0],
            RelationshipViolation::UnknownPersonReference { related_person_id, .. }
                if related_person_id.as_str() == "elsewhere"
        ));
    }
}
