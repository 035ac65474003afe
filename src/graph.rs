use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;

use crate::algorithms::related_person_ids;
use crate::error::{LibError, Result};
use crate::invariants;
use crate::models::{
    DeleteOutcome, NewPerson, Person, PersonId, PersonPatch, Relationship, RelationshipType,
    RelationshipViolation, TreeId, UserId,
};
use crate::store::{FamilyStore, WriteBatch};

/// Person CRUD and relationship-edge maintenance.
#[derive(Clone)]
pub struct RelationshipGraph {
    store: Arc<dyn FamilyStore>,
}

impl RelationshipGraph {
    pub fn new(store: Arc<dyn FamilyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn FamilyStore> {
        Arc::clone(&self.store)
    }

    /// Creates a person under a generated id.
    ///
    /// Edges in `data` are stored as given; the related persons are not
    /// touched. Use [`RelationshipGraph::add_relationship`] for symmetric edges.
    pub async fn create_person(&self, tree_id: &TreeId, data: NewPerson) -> Result<Person> {
        self.create_with_id(PersonId::generate(), tree_id, data)
            .await
    }

    /// Creates the tree owner's own node, keyed by their user id.
    pub async fn create_person_self(
        &self,
        tree_id: &TreeId,
        uid: &UserId,
        data: NewPerson,
    ) -> Result<Person> {
        self.create_with_id(PersonId::for_user(uid), tree_id, data)
            .await
    }

    pub(crate) async fn create_with_id(
        &self,
        person_id: PersonId,
        tree_id: &TreeId,
        data: NewPerson,
    ) -> Result<Person> {
        let input = data.normalize()?;
        let person = Person::from_input(person_id, tree_id.clone(), input);
        let person = self.store.put_person(person).await?;
        tracing::debug!(person_id = %person.person_id, tree_id = %tree_id, "created person");
        Ok(person)
    }

    pub async fn get_person_by_id(&self, person_id: &PersonId) -> Result<Option<Person>> {
        self.store.get_person(person_id).await
    }

    pub async fn get_people_by_tree_id(&self, tree_id: &TreeId) -> Result<Vec<Person>> {
        self.store.persons_by_tree(tree_id).await
    }

    /// Persons visible in a group tree: cross-linked through `group_tree_ids`
    /// or created there directly. Each person appears once.
    pub async fn get_people_by_group_tree_id(&self, tree_id: &TreeId) -> Result<Vec<Person>> {
        let linked = self.store.persons_with_group_tree(tree_id).await?;
        let direct = self.store.persons_by_tree(tree_id).await?;

        let mut seen = HashSet::with_capacity(linked.len() + direct.len());
        Ok(linked
            .into_iter()
            .chain(direct)
            .filter(|person| seen.insert(person.person_id.clone()))
            .collect())
    }

    /// Returns `None` when the person does not exist.
    pub async fn update_person(
        &self,
        person_id: &PersonId,
        patch: PersonPatch,
    ) -> Result<Option<Person>> {
        patch.validate()?;
        self.store.apply_patch(person_id, &patch).await
    }

    /// Removes one edge from one person. The related person keeps its side.
    pub async fn delete_relationship_from_person(
        &self,
        person_id: &PersonId,
        edge: &Relationship,
    ) -> Result<Option<Person>> {
        self.store.remove_relationship(person_id, edge).await
    }

    /// Deletes a person after scrubbing every edge that points at it from the
    /// persons named in its own edges. Scrub and delete commit together.
    pub async fn delete_person(&self, person_id: &PersonId) -> Result<DeleteOutcome> {
        let person = self.require_person(person_id).await?;

        let mut batch = WriteBatch::new();
        let related = related_person_ids(&person);
        for related_id in &related {
            batch.remove_relationships_to(related_id.clone(), person_id.clone());
        }
        batch.delete_person(person_id.clone());
        self.store.commit(batch).await?;

        tracing::info!(
            person_id = %person_id,
            scrubbed = related.len(),
            "deleted person"
        );
        Ok(DeleteOutcome { success: true })
    }

    /// Adds `{b, kind}` to `a` and the reciprocal edge to `b` in one batch.
    pub async fn add_relationship(
        &self,
        a: &PersonId,
        b: &PersonId,
        kind: RelationshipType,
    ) -> Result<(Person, Person)> {
        ensure_distinct(a, b)?;
        self.require_person(a).await?;
        self.require_person(b).await?;

        let edge = Relationship::new(b.clone(), kind);
        let reciprocal = edge.reciprocal_for(a);
        let mut batch = WriteBatch::new();
        batch
            .union_relationships(a.clone(), vec![edge])
            .union_relationships(b.clone(), vec![reciprocal]);
        self.store.commit(batch).await?;

        tracing::debug!(from = %a, to = %b, kind = %kind, "added relationship");
        Ok((self.require_person(a).await?, self.require_person(b).await?))
    }

    /// Removes `{b, kind}` from `a` and the reciprocal edge from `b` in one batch.
    pub async fn remove_relationship(
        &self,
        a: &PersonId,
        b: &PersonId,
        kind: RelationshipType,
    ) -> Result<()> {
        ensure_distinct(a, b)?;
        let edge = Relationship::new(b.clone(), kind);
        let reciprocal = edge.reciprocal_for(a);
        let mut batch = WriteBatch::new();
        batch
            .remove_relationship(a.clone(), edge)
            .remove_relationship(b.clone(), reciprocal);
        self.store.commit(batch).await?;

        tracing::debug!(from = %a, to = %b, kind = %kind, "removed relationship");
        Ok(())
    }

    /// Symmetry findings across everyone visible in `tree_id`.
    pub async fn consistency_report(&self, tree_id: &TreeId) -> Result<Vec<RelationshipViolation>> {
        let persons = self.get_people_by_group_tree_id(tree_id).await?;
        Ok(invariants::relationship_violations(&persons, false))
    }

    async fn require_person(&self, person_id: &PersonId) -> Result<Person> {
        self.store.get_person(person_id).await?.ok_or_else(|| {
            LibError::not_found(
                "Person not found",
                anyhow!("person {} not found", person_id),
            )
        })
    }
}

fn ensure_distinct(a: &PersonId, b: &PersonId) -> Result<()> {
    if a == b {
        return Err(LibError::invalid_with_code(
            "relationship_self_reference",
            "A person cannot be related to themselves",
            anyhow!("self relationship on {}", a),
        ));
    }
    Ok(())
}
