use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;

use crate::error::{LibError, Result};
use crate::graph::RelationshipGraph;
use crate::models::{FamilyGroup, FamilyTree, GroupId, NewPerson, Person, TreeId, UserId};
use crate::store::{FamilyStore, WriteBatch};

/// Family tree and family group bookkeeping.
#[derive(Clone)]
pub struct TreeService {
    store: Arc<dyn FamilyStore>,
    graph: RelationshipGraph,
}

impl TreeService {
    pub fn new(store: Arc<dyn FamilyStore>) -> Self {
        Self {
            graph: RelationshipGraph::new(Arc::clone(&store)),
            store,
        }
    }

    pub async fn create_tree(
        &self,
        user_id: &UserId,
        tree_name: &str,
        shared_users: Vec<UserId>,
    ) -> Result<FamilyTree> {
        let tree_name = tree_name.trim().to_string();
        if tree_name.is_empty() {
            return Err(LibError::invalid(
                "Tree name is required",
                anyhow!("empty tree name for user {}", user_id),
            ));
        }

        let tree = FamilyTree {
            tree_id: TreeId::generate(),
            user_id: user_id.clone(),
            tree_name,
            created_at: Utc::now(),
            shared_users,
        };
        let tree = self.store.put_tree(tree).await?;
        tracing::info!(tree_id = %tree.tree_id, user_id = %user_id, "created family tree");
        Ok(tree)
    }

    /// Creates the user's personal tree, or returns the existing one.
    pub async fn create_personal_tree(&self, user_id: &UserId) -> Result<FamilyTree> {
        if let Some(existing) = self.find_personal_tree(user_id).await? {
            return Ok(existing);
        }
        self.create_tree(user_id, user_id.as_str(), Vec::new())
            .await
    }

    /// Personal tree plus the user's own node inside it.
    pub async fn bootstrap_personal_tree(
        &self,
        user_id: &UserId,
        data: NewPerson,
    ) -> Result<(FamilyTree, Person)> {
        let tree = self.create_personal_tree(user_id).await?;
        let person = self
            .graph
            .create_person_self(&tree.tree_id, user_id, data)
            .await?;
        Ok((tree, person))
    }

    pub async fn find_personal_tree(&self, user_id: &UserId) -> Result<Option<FamilyTree>> {
        let trees = self.store.trees_for_user(user_id).await?;
        Ok(trees.into_iter().find(|tree| tree.is_personal_for(user_id)))
    }

    pub async fn get_tree(&self, tree_id: &TreeId) -> Result<Option<FamilyTree>> {
        self.store.get_tree(tree_id).await
    }

    /// Deletes a tree and every person whose primary tree it is.
    ///
    /// Edges held by persons outside the tree that point into it are scrubbed
    /// in the same batch, as are groups built on the tree and cross-links in
    /// other persons' `group_tree_ids`.
    pub async fn delete_tree(&self, tree_id: &TreeId) -> Result<usize> {
        if self.store.get_tree(tree_id).await?.is_none() {
            return Err(LibError::not_found(
                "Family tree not found",
                anyhow!("tree {} not found", tree_id),
            ));
        }

        let persons = self.store.persons_by_tree(tree_id).await?;
        let doomed: HashSet<_> = persons.iter().map(|person| &person.person_id).collect();

        let mut batch = WriteBatch::new();
        for person in &persons {
            for edge in &person.relationships {
                if !doomed.contains(&edge.related_person_id) {
                    batch.remove_relationships_to(
                        edge.related_person_id.clone(),
                        person.person_id.clone(),
                    );
                }
            }
            batch.delete_person(person.person_id.clone());
        }
        batch.delete_tree(tree_id.clone());
        self.store.commit(batch).await?;

        tracing::info!(tree_id = %tree_id, deleted_persons = persons.len(), "deleted family tree");
        Ok(persons.len())
    }

    /// Creates a family group together with its shared group tree.
    pub async fn create_group(&self, owner_id: &UserId, group_name: &str) -> Result<FamilyGroup> {
        let tree = self.create_tree(owner_id, group_name, Vec::new()).await?;
        let group = FamilyGroup {
            group_id: GroupId::generate(),
            group_name: tree.tree_name.clone(),
            owner_id: owner_id.clone(),
            tree_id: tree.tree_id,
            members: vec![owner_id.clone()],
            created_at: Utc::now(),
        };
        let group = self.store.put_group(group).await?;
        tracing::info!(group_id = %group.group_id, tree_id = %group.tree_id, "created family group");
        Ok(group)
    }

    pub async fn get_group(&self, group_id: &GroupId) -> Result<Option<FamilyGroup>> {
        self.store.get_group(group_id).await
    }
}
