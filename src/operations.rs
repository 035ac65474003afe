use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::FamilyConfig;
use crate::error::Result;
use crate::graph::RelationshipGraph;
use crate::membership::GroupMembership;
use crate::merge::TreeMergeEngine;
use crate::models::{
    DeleteOutcome, FamilyGroup, FamilyTree, MergeResult, NewPerson, Person, PersonId,
    PersonPatch, Relationship, RelationshipType, RelationshipViolation, RevertResult, TreeId,
    TreeMergeStats, UserId,
};
use crate::store::FamilyStore;
use crate::trees::TreeService;

/// High-level family graph actions.
///
/// Callers must provide a trusted `actor` sourced from validated auth/session state,
/// not from request arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum FamilyOperation {
    CreatePerson {
        tree_id: TreeId,
        person: NewPerson,
    },
    CreatePersonSelf {
        tree_id: TreeId,
        person: NewPerson,
    },
    GetPerson {
        person_id: PersonId,
    },
    ListTreePeople {
        tree_id: TreeId,
    },
    ListGroupTreePeople {
        tree_id: TreeId,
    },
    UpdatePerson {
        person_id: PersonId,
        patch: PersonPatch,
    },
    AddRelationship {
        person_id: PersonId,
        related_person_id: PersonId,
        kind: RelationshipType,
    },
    RemoveRelationship {
        person_id: PersonId,
        related_person_id: PersonId,
        kind: RelationshipType,
    },
    DeleteRelationshipFromPerson {
        person_id: PersonId,
        relationship: Relationship,
    },
    DeletePerson {
        person_id: PersonId,
    },
    CheckConsistency {
        tree_id: TreeId,
    },
    BootstrapPersonalTree {
        person: NewPerson,
    },
    CreateGroup {
        group_name: String,
    },
    DeleteTree {
        tree_id: TreeId,
    },
    JoinGroupTree {
        group_tree_id: TreeId,
    },
    LeaveGroupTree {
        group_tree_id: TreeId,
    },
    MergePersonalTree {
        group_tree_id: TreeId,
    },
    RevertMerge {
        group_tree_id: TreeId,
        merge_result: MergeResult,
    },
    TreeMergeStats {
        tree_id: TreeId,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FamilyOperationResult {
    Person {
        person: Option<Person>,
    },
    People {
        people: Vec<Person>,
    },
    Deleted {
        outcome: DeleteOutcome,
    },
    Unlinked,
    Violations {
        violations: Vec<RelationshipViolation>,
    },
    PersonalTree {
        tree: FamilyTree,
        person: Person,
    },
    Group {
        group: FamilyGroup,
    },
    TreeDeleted {
        deleted_persons: usize,
    },
    Merged {
        merge: MergeResult,
    },
    Reverted {
        revert: RevertResult,
    },
    Stats {
        stats: TreeMergeStats,
    },
}

#[derive(Clone)]
pub struct FamilyOperations {
    graph: RelationshipGraph,
    trees: TreeService,
    membership: GroupMembership,
    merge: TreeMergeEngine,
}

impl FamilyOperations {
    pub fn new(store: Arc<dyn FamilyStore>) -> Self {
        Self::with_config(store, &FamilyConfig::default())
    }

    pub fn with_config(store: Arc<dyn FamilyStore>, config: &FamilyConfig) -> Self {
        Self {
            graph: RelationshipGraph::new(Arc::clone(&store)),
            trees: TreeService::new(Arc::clone(&store)),
            membership: GroupMembership::new(Arc::clone(&store)),
            merge: TreeMergeEngine::from_config(store, &config.merge),
        }
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    pub fn trees(&self) -> &TreeService {
        &self.trees
    }

    pub fn merge_engine(&self) -> &TreeMergeEngine {
        &self.merge
    }

    pub async fn execute(
        &self,
        actor: &UserId,
        operation: FamilyOperation,
    ) -> Result<FamilyOperationResult> {
        match operation {
            FamilyOperation::CreatePerson { tree_id, person } => {
                let person = self.graph.create_person(&tree_id, person).await?;
                Ok(FamilyOperationResult::Person {
                    person: Some(person),
                })
            }
            FamilyOperation::CreatePersonSelf { tree_id, person } => {
                let person = self
                    .graph
                    .create_person_self(&tree_id, actor, person)
                    .await?;
                Ok(FamilyOperationResult::Person {
                    person: Some(person),
                })
            }
            FamilyOperation::GetPerson { person_id } => {
                let person = self.graph.get_person_by_id(&person_id).await?;
                Ok(FamilyOperationResult::Person { person })
            }
            FamilyOperation::ListTreePeople { tree_id } => {
                let people = self.graph.get_people_by_tree_id(&tree_id).await?;
                Ok(FamilyOperationResult::People { people })
            }
            FamilyOperation::ListGroupTreePeople { tree_id } => {
                let people = self.graph.get_people_by_group_tree_id(&tree_id).await?;
                Ok(FamilyOperationResult::People { people })
            }
            FamilyOperation::UpdatePerson { person_id, patch } => {
                let person = self.graph.update_person(&person_id, patch).await?;
                Ok(FamilyOperationResult::Person { person })
            }
            FamilyOperation::AddRelationship {
                person_id,
                related_person_id,
                kind,
            } => {
                let (person, _) = self
                    .graph
                    .add_relationship(&person_id, &related_person_id, kind)
                    .await?;
                Ok(FamilyOperationResult::Person {
                    person: Some(person),
                })
            }
            FamilyOperation::RemoveRelationship {
                person_id,
                related_person_id,
                kind,
            } => {
                self.graph
                    .remove_relationship(&person_id, &related_person_id, kind)
                    .await?;
                Ok(FamilyOperationResult::Unlinked)
            }
            FamilyOperation::DeleteRelationshipFromPerson {
                person_id,
                relationship,
            } => {
                let person = self
                    .graph
                    .delete_relationship_from_person(&person_id, &relationship)
                    .await?;
                Ok(FamilyOperationResult::Person { person })
            }
            FamilyOperation::DeletePerson { person_id } => {
                let outcome = self.graph.delete_person(&person_id).await?;
                Ok(FamilyOperationResult::Deleted { outcome })
            }
            FamilyOperation::CheckConsistency { tree_id } => {
                let violations = self.graph.consistency_report(&tree_id).await?;
                Ok(FamilyOperationResult::Violations { violations })
            }
            FamilyOperation::BootstrapPersonalTree { person } => {
                let (tree, person) = self.trees.bootstrap_personal_tree(actor, person).await?;
                Ok(FamilyOperationResult::PersonalTree { tree, person })
            }
            FamilyOperation::CreateGroup { group_name } => {
                let group = self.trees.create_group(actor, &group_name).await?;
                Ok(FamilyOperationResult::Group { group })
            }
            FamilyOperation::DeleteTree { tree_id } => {
                let deleted_persons = self.trees.delete_tree(&tree_id).await?;
                Ok(FamilyOperationResult::TreeDeleted { deleted_persons })
            }
            FamilyOperation::JoinGroupTree { group_tree_id } => {
                let person = self
                    .membership
                    .add_user_to_group_tree(actor, &group_tree_id)
                    .await?;
                Ok(FamilyOperationResult::Person {
                    person: Some(person),
                })
            }
            FamilyOperation::LeaveGroupTree { group_tree_id } => {
                let person = self
                    .membership
                    .remove_user_from_group_tree(actor, &group_tree_id)
                    .await?;
                Ok(FamilyOperationResult::Person {
                    person: Some(person),
                })
            }
            FamilyOperation::MergePersonalTree { group_tree_id } => {
                let merge = self
                    .merge
                    .merge_personal_tree_into_group(actor, &group_tree_id)
                    .await?;
                Ok(FamilyOperationResult::Merged { merge })
            }
            FamilyOperation::RevertMerge {
                group_tree_id,
                merge_result,
            } => {
                let revert = self.merge.revert_merge(&group_tree_id, &merge_result).await?;
                Ok(FamilyOperationResult::Reverted { revert })
            }
            FamilyOperation::TreeMergeStats { tree_id } => {
                let stats = self.merge.get_tree_merge_stats(&tree_id).await?;
                Ok(FamilyOperationResult::Stats { stats })
            }
        }
    }
}
