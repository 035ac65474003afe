//! Document store abstraction.
//!
//! Services only talk to [`FamilyStore`]; the in-memory backend serves tests
//! and embedded use, the Postgres backend lives in `crate::db` behind the
//! `sqlx` feature.

mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    FamilyGroup, FamilyTree, GroupId, Person, PersonId, PersonPatch, Relationship, TreeId, UserId,
};

pub use memory::MemoryStore;

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    UnionRelationships {
        person_id: PersonId,
        edges: Vec<Relationship>,
    },
    RemoveRelationship {
        person_id: PersonId,
        edge: Relationship,
    },
    /// Drops every edge on `person_id` that targets `related_person_id`.
    RemoveRelationshipsTo {
        person_id: PersonId,
        related_person_id: PersonId,
    },
    DeletePerson {
        person_id: PersonId,
    },
    /// Deletes the tree and every group built on it, and drops the id from
    /// each person's `group_tree_ids`.
    DeleteTree {
        tree_id: TreeId,
    },
}

/// Writes committed together: either all apply or none do.
///
/// Ops naming a person that does not exist are skipped rather than failing
/// the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn union_relationships(&mut self, person_id: PersonId, edges: Vec<Relationship>) -> &mut Self {
        self.push(WriteOp::UnionRelationships { person_id, edges })
    }

    pub fn remove_relationship(&mut self, person_id: PersonId, edge: Relationship) -> &mut Self {
        self.push(WriteOp::RemoveRelationship { person_id, edge })
    }

    pub fn remove_relationships_to(
        &mut self,
        person_id: PersonId,
        related_person_id: PersonId,
    ) -> &mut Self {
        self.push(WriteOp::RemoveRelationshipsTo {
            person_id,
            related_person_id,
        })
    }

    pub fn delete_person(&mut self, person_id: PersonId) -> &mut Self {
        self.push(WriteOp::DeletePerson { person_id })
    }

    pub fn delete_tree(&mut self, tree_id: TreeId) -> &mut Self {
        self.push(WriteOp::DeleteTree { tree_id })
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Per-collection CRUD over persons, trees and groups.
///
/// `apply_patch` must merge `relationships` atomically with respect to other
/// writers of the same person. `group_tree_ids` replacement is last write wins.
#[async_trait]
pub trait FamilyStore: Send + Sync {
    /// Writes `person` under its id, overwriting any existing document.
    async fn put_person(&self, person: Person) -> Result<Person>;

    async fn get_person(&self, person_id: &PersonId) -> Result<Option<Person>>;

    async fn persons_by_tree(&self, tree_id: &TreeId) -> Result<Vec<Person>>;

    /// Persons whose `group_tree_ids` contains `tree_id`.
    async fn persons_with_group_tree(&self, tree_id: &TreeId) -> Result<Vec<Person>>;

    async fn apply_patch(&self, person_id: &PersonId, patch: &PersonPatch)
    -> Result<Option<Person>>;

    /// Removes the first edge equal to `edge`.
    async fn remove_relationship(
        &self,
        person_id: &PersonId,
        edge: &Relationship,
    ) -> Result<Option<Person>>;

    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    async fn put_tree(&self, tree: FamilyTree) -> Result<FamilyTree>;

    async fn get_tree(&self, tree_id: &TreeId) -> Result<Option<FamilyTree>>;

    async fn trees_for_user(&self, user_id: &UserId) -> Result<Vec<FamilyTree>>;

    async fn put_group(&self, group: FamilyGroup) -> Result<FamilyGroup>;

    async fn get_group(&self, group_id: &GroupId) -> Result<Option<FamilyGroup>>;
}
