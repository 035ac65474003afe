use std::sync::Arc;

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{Person, PersonId, PersonPatch, TreeId, UserId};
use crate::store::FamilyStore;

/// Group membership without copying family data: only the user's own
/// person record gains or loses the group tree id.
#[derive(Clone)]
pub struct GroupMembership {
    store: Arc<dyn FamilyStore>,
}

impl GroupMembership {
    pub fn new(store: Arc<dyn FamilyStore>) -> Self {
        Self { store }
    }

    pub async fn add_user_to_group_tree(
        &self,
        user_id: &UserId,
        group_tree_id: &TreeId,
    ) -> Result<Person> {
        let person = self.own_person(user_id).await?;
        if person.group_tree_ids.contains(group_tree_id) {
            return Ok(person);
        }

        let mut tree_ids = person.group_tree_ids.clone();
        tree_ids.push(group_tree_id.clone());
        let person = self.replace_group_tree_ids(&person.person_id, tree_ids).await?;
        tracing::info!(user_id = %user_id, group_tree_id = %group_tree_id, "joined group tree");
        Ok(person)
    }

    pub async fn remove_user_from_group_tree(
        &self,
        user_id: &UserId,
        group_tree_id: &TreeId,
    ) -> Result<Person> {
        let person = self.own_person(user_id).await?;
        if !person.group_tree_ids.contains(group_tree_id) {
            return Ok(person);
        }

        let tree_ids = person
            .group_tree_ids
            .iter()
            .filter(|tree_id| *tree_id != group_tree_id)
            .cloned()
            .collect();
        let person = self.replace_group_tree_ids(&person.person_id, tree_ids).await?;
        tracing::info!(user_id = %user_id, group_tree_id = %group_tree_id, "left group tree");
        Ok(person)
    }

    async fn own_person(&self, user_id: &UserId) -> Result<Person> {
        self.store
            .get_person(&PersonId::for_user(user_id))
            .await?
            .ok_or_else(|| {
                LibError::not_found(
                    "User has no person record",
                    anyhow!("no self person for user {}", user_id),
                )
            })
    }

    // Full replace: a concurrent membership change on the same person can be lost.
    async fn replace_group_tree_ids(
        &self,
        person_id: &PersonId,
        tree_ids: Vec<TreeId>,
    ) -> Result<Person> {
        self.store
            .apply_patch(person_id, &PersonPatch::group_tree_ids(tree_ids))
            .await?
            .ok_or_else(|| {
                LibError::not_found(
                    "User has no person record",
                    anyhow!("person {} disappeared during membership update", person_id),
                )
            })
    }
}
