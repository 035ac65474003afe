use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::algorithms::union_relationships;
use crate::error::Result;
use crate::models::{
    FamilyGroup, FamilyTree, GroupId, Person, PersonId, PersonPatch, Relationship, TreeId, UserId,
};
use crate::store::{FamilyStore, WriteBatch, WriteOp};

#[derive(Debug, Clone, Default)]
struct Collections {
    persons: BTreeMap<PersonId, Person>,
    trees: BTreeMap<TreeId, FamilyTree>,
    groups: BTreeMap<GroupId, FamilyGroup>,
}

impl Collections {
    fn patch_person(&mut self, person_id: &PersonId, patch: &PersonPatch) -> Option<Person> {
        let person = self.persons.get_mut(person_id)?;
        patch.attributes.apply_to(person);
        if let Some(edges) = &patch.relationships {
            union_relationships(&mut person.relationships, edges);
        }
        if let Some(tree_ids) = &patch.group_tree_ids {
            person.group_tree_ids = tree_ids.clone();
        }
        person.updated_at = Utc::now();
        Some(person.clone())
    }

    fn remove_edge(&mut self, person_id: &PersonId, edge: &Relationship) -> Option<Person> {
        let person = self.persons.get_mut(person_id)?;
        if let Some(position) = person.relationships.iter().position(|held| held == edge) {
            person.relationships.remove(position);
            person.updated_at = Utc::now();
        }
        Some(person.clone())
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::UnionRelationships { person_id, edges } => {
                self.patch_person(&person_id, &PersonPatch::relationships(edges));
            }
            WriteOp::RemoveRelationship { person_id, edge } => {
                self.remove_edge(&person_id, &edge);
            }
            WriteOp::RemoveRelationshipsTo {
                person_id,
                related_person_id,
            } => {
                if let Some(person) = self.persons.get_mut(&person_id) {
                    let before = person.relationships.len();
                    person
                        .relationships
                        .retain(|edge| edge.related_person_id != related_person_id);
                    if person.relationships.len() != before {
                        person.updated_at = Utc::now();
                    }
                }
            }
            WriteOp::DeletePerson { person_id } => {
                self.persons.remove(&person_id);
            }
            WriteOp::DeleteTree { tree_id } => {
                self.trees.remove(&tree_id);
                self.groups.retain(|_, group| group.tree_id != tree_id);
                for person in self.persons.values_mut() {
                    if person.group_tree_ids.contains(&tree_id) {
                        person.group_tree_ids.retain(|linked| *linked != tree_id);
                        person.updated_at = Utc::now();
                    }
                }
            }
        }
    }
}

/// In-process [`FamilyStore`] backed by ordered maps behind one lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn person_count(&self) -> usize {
        self.inner.read().await.persons.len()
    }
}

#[async_trait]
impl FamilyStore for MemoryStore {
    async fn put_person(&self, person: Person) -> Result<Person> {
        let mut inner = self.inner.write().await;
        inner
            .persons
            .insert(person.person_id.clone(), person.clone());
        Ok(person)
    }

    async fn get_person(&self, person_id: &PersonId) -> Result<Option<Person>> {
        Ok(self.inner.read().await.persons.get(person_id).cloned())
    }

    async fn persons_by_tree(&self, tree_id: &TreeId) -> Result<Vec<Person>> {
        let inner = self.inner.read().await;
        Ok(inner
            .persons
            .values()
            .filter(|person| person.tree_id == *tree_id)
            .cloned()
            .collect())
    }

    async fn persons_with_group_tree(&self, tree_id: &TreeId) -> Result<Vec<Person>> {
        let inner = self.inner.read().await;
        Ok(inner
            .persons
            .values()
            .filter(|person| person.group_tree_ids.contains(tree_id))
            .cloned()
            .collect())
    }

    async fn apply_patch(
        &self,
        person_id: &PersonId,
        patch: &PersonPatch,
    ) -> Result<Option<Person>> {
        Ok(self.inner.write().await.patch_person(person_id, patch))
    }

    async fn remove_relationship(
        &self,
        person_id: &PersonId,
        edge: &Relationship,
    ) -> Result<Option<Person>> {
        Ok(self.inner.write().await.remove_edge(person_id, edge))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut staged = inner.clone();
        for op in batch.into_ops() {
            staged.apply(op);
        }
        *inner = staged;
        Ok(())
    }

    async fn put_tree(&self, tree: FamilyTree) -> Result<FamilyTree> {
        let mut inner = self.inner.write().await;
        inner.trees.insert(tree.tree_id.clone(), tree.clone());
        Ok(tree)
    }

    async fn get_tree(&self, tree_id: &TreeId) -> Result<Option<FamilyTree>> {
        Ok(self.inner.read().await.trees.get(tree_id).cloned())
    }

    async fn trees_for_user(&self, user_id: &UserId) -> Result<Vec<FamilyTree>> {
        let inner = self.inner.read().await;
        Ok(inner
            .trees
            .values()
            .filter(|tree| tree.user_id == *user_id)
            .cloned()
            .collect())
    }

    async fn put_group(&self, group: FamilyGroup) -> Result<FamilyGroup> {
        let mut inner = self.inner.write().await;
        inner.groups.insert(group.group_id.clone(), group.clone());
        Ok(group)
    }

    async fn get_group(&self, group_id: &GroupId) -> Result<Option<FamilyGroup>> {
        Ok(self.inner.read().await.groups.get(group_id).cloned())
    }
}
