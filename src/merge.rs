//! Copies a personal tree into a group tree and reverts such copies.
//!
//! A merge runs in two sequential passes against the store. Pass one
//! materializes one group-tree person per source person (or maps it onto a
//! matching person already there), pass two rewrites the source edges through
//! the resulting id map. Nothing is batched: a failure part way through leaves
//! the persons written so far in place and is returned to the caller, who can
//! re-run the merge or revert it with the partial result.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::anyhow;

use crate::algorithms::{relationship_stats, translate_relationships};
use crate::config::{DuplicateMatching, MergeConfig};
use crate::error::{LibError, Result};
use crate::graph::RelationshipGraph;
use crate::models::{
    MergeResult, Person, PersonId, PersonPatch, RevertResult, TreeId, TreeMergeStats, UserId,
};
use crate::store::FamilyStore;
use crate::trees::TreeService;

/// Decides whether a source person already exists in the destination tree.
///
/// Matching is a heuristic with no confirmation step.
pub trait DuplicateMatcher: Send + Sync {
    fn find_match<'a>(&self, candidate: &Person, pool: &'a [Person]) -> Option<&'a Person>;
}

/// Case-insensitive first and last name with an exact birth date. Two persons
/// without a birth date match on names alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameAndBirthDate;

impl DuplicateMatcher for NameAndBirthDate {
    fn find_match<'a>(&self, candidate: &Person, pool: &'a [Person]) -> Option<&'a Person> {
        pool.iter().find(|existing| {
            existing.first_name.to_lowercase() == candidate.first_name.to_lowercase()
                && existing.last_name.to_lowercase() == candidate.last_name.to_lowercase()
                && existing.birth_date == candidate.birth_date
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoMatching;

impl DuplicateMatcher for NoMatching {
    fn find_match<'a>(&self, _candidate: &Person, _pool: &'a [Person]) -> Option<&'a Person> {
        None
    }
}

#[derive(Clone)]
pub struct TreeMergeEngine {
    store: Arc<dyn FamilyStore>,
    graph: RelationshipGraph,
    trees: TreeService,
    matcher: Arc<dyn DuplicateMatcher>,
}

impl TreeMergeEngine {
    pub fn new(store: Arc<dyn FamilyStore>) -> Self {
        Self::with_matcher(store, Arc::new(NameAndBirthDate))
    }

    pub fn with_matcher(store: Arc<dyn FamilyStore>, matcher: Arc<dyn DuplicateMatcher>) -> Self {
        Self {
            graph: RelationshipGraph::new(Arc::clone(&store)),
            trees: TreeService::new(Arc::clone(&store)),
            store,
            matcher,
        }
    }

    pub fn from_config(store: Arc<dyn FamilyStore>, config: &MergeConfig) -> Self {
        let matcher: Arc<dyn DuplicateMatcher> = match config.duplicate_matching {
            DuplicateMatching::NameAndBirthDate => Arc::new(NameAndBirthDate),
            DuplicateMatching::Disabled => Arc::new(NoMatching),
        };
        Self::with_matcher(store, matcher)
    }

    pub async fn merge_personal_tree_into_group(
        &self,
        requester: &UserId,
        group_tree_id: &TreeId,
    ) -> Result<MergeResult> {
        let personal_tree = self
            .trees
            .find_personal_tree(requester)
            .await?
            .ok_or_else(|| {
                LibError::precondition(
                    "personal_tree_missing",
                    "Personal family tree not found",
                    anyhow!("user {} has no personal tree", requester),
                )
            })?;

        let sources = self
            .graph
            .get_people_by_tree_id(&personal_tree.tree_id)
            .await?;
        if sources.is_empty() {
            tracing::info!(
                requester = %requester,
                personal_tree_id = %personal_tree.tree_id,
                "personal tree is empty, nothing to merge"
            );
            return Ok(MergeResult {
                success: true,
                merged_persons: 0,
                matched_persons: 0,
                personal_tree_id: Some(personal_tree.tree_id),
                group_tree_id: group_tree_id.clone(),
                person_id_map: Some(BTreeMap::new()),
                matched_person_ids: Vec::new(),
            });
        }

        if self.trees.get_tree(group_tree_id).await?.is_none() {
            return Err(LibError::not_found(
                "Group tree not found",
                anyhow!("group tree {} not found", group_tree_id),
            ));
        }

        let pool = self.graph.get_people_by_tree_id(group_tree_id).await?;
        tracing::info!(
            requester = %requester,
            personal_tree_id = %personal_tree.tree_id,
            group_tree_id = %group_tree_id,
            source_persons = sources.len(),
            existing_persons = pool.len(),
            "merging personal tree into group tree"
        );

        let mut id_map = BTreeMap::new();
        let mut matched_person_ids: Vec<PersonId> = Vec::new();
        let mut merged_persons = 0usize;
        let mut matched_persons = 0usize;
        let requester_person_id = PersonId::for_user(requester);

        for source in &sources {
            if let Some(existing) = self.matcher.find_match(source, &pool) {
                tracing::debug!(
                    source = %source.person_id,
                    existing = %existing.person_id,
                    "matched existing group person"
                );
                id_map.insert(source.person_id.clone(), existing.person_id.clone());
                if !matched_person_ids.contains(&existing.person_id) {
                    matched_person_ids.push(existing.person_id.clone());
                }
                matched_persons += 1;
                continue;
            }

            let destination_id = if source.person_id == requester_person_id {
                let self_id = PersonId::merged_self(requester, group_tree_id);
                if self.store.get_person(&self_id).await?.is_some() {
                    // An earlier merge already copied the requester.
                    id_map.insert(source.person_id.clone(), self_id.clone());
                    if !matched_person_ids.contains(&self_id) {
                        matched_person_ids.push(self_id);
                    }
                    matched_persons += 1;
                    continue;
                }
                self_id
            } else {
                PersonId::generate()
            };

            let copy = self
                .graph
                .create_with_id(destination_id, group_tree_id, source.to_new_person())
                .await?;
            id_map.insert(source.person_id.clone(), copy.person_id);
            merged_persons += 1;
        }

        let mut linked_persons = 0usize;
        for source in sources.iter().filter(|source| !source.relationships.is_empty()) {
            let Some(destination_id) = id_map.get(&source.person_id) else {
                continue;
            };
            let edges = translate_relationships(&source.relationships, &id_map)
                .into_iter()
                .filter(|edge| edge.related_person_id != *destination_id)
                .collect::<Vec<_>>();
            if edges.is_empty() {
                continue;
            }

            let updated = self
                .graph
                .update_person(destination_id, PersonPatch::relationships(edges))
                .await?;
            if updated.is_none() {
                tracing::warn!(
                    destination = %destination_id,
                    "group person vanished before its relationships were linked"
                );
                continue;
            }
            linked_persons += 1;
        }

        tracing::info!(
            group_tree_id = %group_tree_id,
            merged_persons,
            matched_persons,
            linked_persons,
            "merge complete"
        );

        Ok(MergeResult {
            success: true,
            merged_persons,
            matched_persons,
            personal_tree_id: Some(personal_tree.tree_id),
            group_tree_id: group_tree_id.clone(),
            person_id_map: Some(id_map),
            matched_person_ids,
        })
    }

    /// Best-effort undo of a merge.
    ///
    /// Deletes each distinct destination person in the id map except the ones
    /// that existed before the merge. Individual failures are logged and
    /// reported, never returned as an error.
    pub async fn revert_merge(
        &self,
        group_tree_id: &TreeId,
        merge_result: &MergeResult,
    ) -> Result<RevertResult> {
        let Some(id_map) = &merge_result.person_id_map else {
            return Err(LibError::precondition(
                "merge_result_missing_map",
                "Merge result has no person id map",
                anyhow!("revert of group tree {} without person id map", group_tree_id),
            ));
        };

        let protected: HashSet<&PersonId> = merge_result.matched_person_ids.iter().collect();
        let targets: BTreeSet<&PersonId> = id_map
            .values()
            .filter(|person_id| !protected.contains(person_id))
            .collect();

        let mut deleted_persons = 0usize;
        let mut failed = Vec::new();
        for person_id in &targets {
            match self.revert_one(group_tree_id, person_id).await {
                Ok(true) => deleted_persons += 1,
                Ok(false) => {
                    tracing::debug!(person_id = %person_id, "merged person already gone");
                }
                Err(err) => {
                    tracing::warn!(
                        person_id = %person_id,
                        error = %err,
                        "failed to delete merged person during revert"
                    );
                    failed.push((*person_id).clone());
                }
            }
        }

        tracing::info!(
            group_tree_id = %group_tree_id,
            attempted = targets.len(),
            deleted_persons,
            failed = failed.len(),
            "merge reverted"
        );

        Ok(RevertResult {
            success: true,
            deleted_persons,
            attempted: targets.len(),
            failed,
        })
    }

    async fn revert_one(&self, group_tree_id: &TreeId, person_id: &PersonId) -> Result<bool> {
        let Some(person) = self.store.get_person(person_id).await? else {
            return Ok(false);
        };
        if person.tree_id != *group_tree_id {
            return Err(LibError::invalid(
                "Merged person belongs to another tree",
                anyhow!(
                    "person {} is in tree {}, not {}",
                    person_id,
                    person.tree_id,
                    group_tree_id
                ),
            ));
        }

        match self.graph.delete_person(person_id).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn get_tree_merge_stats(&self, tree_id: &TreeId) -> Result<TreeMergeStats> {
        let persons = self.graph.get_people_by_tree_id(tree_id).await?;
        Ok(relationship_stats(&persons))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::error::ErrorKind;
    use crate::invariants;
    use crate::models::{
        FamilyGroup, FamilyTree, GroupId, NewPerson, Relationship, RelationshipType,
    };
    use crate::store::{MemoryStore, WriteBatch, WriteOp};

    struct Fixture {
        store: Arc<MemoryStore>,
        graph: RelationshipGraph,
        trees: TreeService,
        engine: TreeMergeEngine,
        requester: UserId,
        personal_tree: TreeId,
        group_tree: TreeId,
    }

    fn born(year: i32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, 1, 1)
    }

    fn new_person(first: &str, last: &str, year: i32) -> NewPerson {
        NewPerson {
            birth_date: born(year),
            ..NewPerson::named(first, last)
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn FamilyStore> = store.clone();
        let graph = RelationshipGraph::new(Arc::clone(&dyn_store));
        let trees = TreeService::new(Arc::clone(&dyn_store));
        let engine = TreeMergeEngine::new(Arc::clone(&dyn_store));

        let requester = UserId::new("u1");
        let (personal, _) = trees
            .bootstrap_personal_tree(&requester, new_person("Ada", "Smith", 1980))
            .await
            .expect("bootstrap");
        let group = trees
            .create_group(&UserId::new("owner"), "Smiths")
            .await
            .expect("group");

        Fixture {
            store,
            graph,
            trees,
            engine,
            requester,
            personal_tree: personal.tree_id,
            group_tree: group.tree_id,
        }
    }

    async fn add_relative(
        fx: &Fixture,
        first: &str,
        year: i32,
        kind: RelationshipType,
    ) -> Person {
        let person = fx
            .graph
            .create_person(&fx.personal_tree, new_person(first, "Smith", year))
            .await
            .expect("create relative");
        fx.graph
            .add_relationship(&PersonId::new("u1"), &person.person_id, kind)
            .await
            .expect("link relative");
        person
    }

    #[tokio::test]
    async fn merge_copies_persons_with_symmetric_edges() {
        let fx = fixture().await;
        let spouse = add_relative(&fx, "Bob", 1979, RelationshipType::Spouse).await;
        let child = add_relative(&fx, "Cy", 2010, RelationshipType::Child).await;
        fx.graph
            .add_relationship(&spouse.person_id, &child.person_id, RelationshipType::Child)
            .await
            .expect("link spouse to child");

        let result = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("merge");

        assert!(result.success);
        assert_eq!(result.merged_persons, 3);
        assert_eq!(result.matched_persons, 0);
        assert_eq!(result.personal_tree_id, Some(fx.personal_tree.clone()));
        let id_map = result.person_id_map.expect("id map");
        assert_eq!(id_map.len(), 3);
        assert_eq!(
            id_map[&PersonId::new("u1")],
            PersonId::merged_self(&fx.requester, &fx.group_tree)
        );

        let group_people = fx
            .graph
            .get_people_by_tree_id(&fx.group_tree)
            .await
            .expect("group people");
        assert_eq!(group_people.len(), 3);
        assert!(invariants::relationship_violations(&group_people, true).is_empty());

        let copied_child = fx
            .graph
            .get_person_by_id(&id_map[&child.person_id])
            .await
            .expect("get")
            .expect("child copied");
        assert_eq!(copied_child.relationships.len(), 2);
        assert!(
            copied_child
                .relationships
                .iter()
                .all(|edge| edge.kind == RelationshipType::Parent)
        );
    }

    #[tokio::test]
    async fn merge_never_touches_the_personal_tree() {
        let fx = fixture().await;
        add_relative(&fx, "Bob", 1979, RelationshipType::Spouse).await;
        let before = fx
            .graph
            .get_people_by_tree_id(&fx.personal_tree)
            .await
            .expect("before");

        fx.engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("merge");

        let after = fx
            .graph
            .get_people_by_tree_id(&fx.personal_tree)
            .await
            .expect("after");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn requester_node_is_idempotent_across_merges() {
        let fx = fixture().await;
        add_relative(&fx, "Bob", 1979, RelationshipType::Spouse).await;

        let first = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("first merge");
        let second = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("second merge");

        let expected = PersonId::merged_self(&fx.requester, &fx.group_tree);
        let requester_id = PersonId::new("u1");
        assert_eq!(first.person_id_map.as_ref().expect("map")[&requester_id], expected);
        assert_eq!(second.person_id_map.as_ref().expect("map")[&requester_id], expected);

        let group_people = fx
            .graph
            .get_people_by_tree_id(&fx.group_tree)
            .await
            .expect("group people");
        assert_eq!(
            group_people
                .iter()
                .filter(|p| p.first_name == "Ada")
                .count(),
            1
        );
        assert_eq!(second.merged_persons, 0);
        assert_eq!(second.matched_persons, 2);
        assert_eq!(group_people.len(), 2);
    }

    #[tokio::test]
    async fn requester_node_is_reused_even_after_rename() {
        let fx = fixture().await;
        fx.engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("first merge");

        let expected = PersonId::merged_self(&fx.requester, &fx.group_tree);
        fx.graph
            .update_person(
                &expected,
                PersonPatch::attributes(crate::models::PersonAttributes {
                    first_name: Some("Adeline".to_string()),
                    ..Default::default()
                }),
            )
            .await
            .expect("rename copy");

        let second = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("second merge");
        assert_eq!(second.merged_persons, 0);
        assert_eq!(second.matched_person_ids, vec![expected.clone()]);
        let copy = fx
            .graph
            .get_person_by_id(&expected)
            .await
            .expect("get")
            .expect("copy exists");
        assert_eq!(copy.first_name, "Adeline");
    }

    #[tokio::test]
    async fn duplicates_map_onto_existing_group_persons() {
        let fx = fixture().await;
        let grandma = add_relative(&fx, "Edna", 1930, RelationshipType::Parent).await;
        let existing = fx
            .graph
            .create_person(&fx.group_tree, new_person("EDNA", "smith", 1930))
            .await
            .expect("existing group person");

        let result = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("merge");

        let id_map = result.person_id_map.as_ref().expect("map");
        assert_eq!(id_map[&grandma.person_id], existing.person_id);
        assert_eq!(result.merged_persons, 1);
        assert_eq!(result.matched_persons, 1);
        assert_eq!(result.matched_person_ids, vec![existing.person_id.clone()]);

        let group_people = fx
            .graph
            .get_people_by_tree_id(&fx.group_tree)
            .await
            .expect("group people");
        assert_eq!(group_people.len(), 2);

        let existing = fx
            .graph
            .get_person_by_id(&existing.person_id)
            .await
            .expect("get")
            .expect("existing kept");
        let self_copy = PersonId::merged_self(&fx.requester, &fx.group_tree);
        assert_eq!(
            existing.relationships,
            vec![Relationship::new(self_copy, RelationshipType::Child)]
        );
    }

    #[tokio::test]
    async fn different_birth_date_is_not_a_duplicate() {
        let fx = fixture().await;
        add_relative(&fx, "Edna", 1930, RelationshipType::Parent).await;
        fx.graph
            .create_person(&fx.group_tree, new_person("Edna", "Smith", 1931))
            .await
            .expect("existing group person");

        let result = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("merge");
        assert_eq!(result.merged_persons, 2);
        assert_eq!(result.matched_persons, 0);
    }

    #[tokio::test]
    async fn disabled_matching_always_creates() {
        let fx = fixture().await;
        fx.graph
            .create_person(&fx.group_tree, new_person("Ada", "Smith", 1980))
            .await
            .expect("lookalike");
        let engine = TreeMergeEngine::from_config(
            fx.store.clone(),
            &MergeConfig {
                duplicate_matching: DuplicateMatching::Disabled,
            },
        );

        let result = engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("merge");
        assert_eq!(result.merged_persons, 1);
        assert_eq!(
            fx.graph
                .get_people_by_tree_id(&fx.group_tree)
                .await
                .expect("group people")
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn edges_outside_the_personal_tree_are_dropped() {
        let fx = fixture().await;
        let outsider = fx
            .graph
            .create_person(&TreeId::new("someone-else"), new_person("Out", "Sider", 1950))
            .await
            .expect("outsider");
        fx.graph
            .add_relationship(&PersonId::new("u1"), &outsider.person_id, RelationshipType::Parent)
            .await
            .expect("cross-tree edge");

        let result = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("merge");

        let id_map = result.person_id_map.expect("map");
        assert!(!id_map.contains_key(&outsider.person_id));
        let copy = fx
            .graph
            .get_person_by_id(&id_map[&PersonId::new("u1")])
            .await
            .expect("get")
            .expect("copy");
        assert!(copy.relationships.is_empty());
    }

    #[tokio::test]
    async fn merge_requires_personal_tree() {
        let fx = fixture().await;
        let err = fx
            .engine
            .merge_personal_tree_into_group(&UserId::new("stranger"), &fx.group_tree)
            .await
            .expect_err("no personal tree");
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);
        assert_eq!(err.code, "personal_tree_missing");
    }

    #[tokio::test]
    async fn merge_requires_group_tree() {
        let fx = fixture().await;
        let err = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &TreeId::new("missing"))
            .await
            .expect_err("no group tree");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn empty_personal_tree_merges_nothing() {
        let fx = fixture().await;
        let user = UserId::new("u2");
        fx.trees.create_personal_tree(&user).await.expect("tree");

        let result = fx
            .engine
            .merge_personal_tree_into_group(&user, &TreeId::new("does-not-matter"))
            .await
            .expect("merge");
        assert!(result.success);
        assert_eq!(result.merged_persons, 0);
        assert_eq!(result.person_id_map, Some(BTreeMap::new()));
    }

    #[tokio::test]
    async fn revert_deletes_created_persons_only() {
        let fx = fixture().await;
        let grandma = add_relative(&fx, "Edna", 1930, RelationshipType::Parent).await;
        add_relative(&fx, "Bob", 1979, RelationshipType::Spouse).await;
        let existing = fx
            .graph
            .create_person(&fx.group_tree, new_person("Edna", "Smith", 1930))
            .await
            .expect("existing group person");
        let personal_before = fx
            .graph
            .get_people_by_tree_id(&fx.personal_tree)
            .await
            .expect("personal people")
            .len();

        let result = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("merge");
        assert_eq!(
            result.person_id_map.as_ref().expect("map")[&grandma.person_id],
            existing.person_id
        );

        let revert = fx
            .engine
            .revert_merge(&fx.group_tree, &result)
            .await
            .expect("revert");
        assert!(revert.success);
        assert_eq!(revert.attempted, 2);
        assert_eq!(revert.deleted_persons, 2);
        assert!(revert.failed.is_empty());

        let group_people = fx
            .graph
            .get_people_by_tree_id(&fx.group_tree)
            .await
            .expect("group people");
        assert_eq!(group_people.len(), 1);
        assert!(
            group_people[0].relationships.is_empty(),
            "edges into reverted persons are scrubbed"
        );
        assert_eq!(
            fx.graph
                .get_people_by_tree_id(&fx.personal_tree)
                .await
                .expect("personal people")
                .len(),
            personal_before
        );
    }

    #[tokio::test]
    async fn revert_counts_only_confirmed_deletions() {
        let fx = fixture().await;
        let bob = add_relative(&fx, "Bob", 1979, RelationshipType::Spouse).await;
        let result = fx
            .engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("merge");
        let id_map = result.person_id_map.clone().expect("map");

        fx.graph
            .delete_person(&id_map[&bob.person_id])
            .await
            .expect("delete ahead of revert");

        let revert = fx
            .engine
            .revert_merge(&fx.group_tree, &result)
            .await
            .expect("revert");
        assert_eq!(revert.attempted, id_map.len());
        assert_eq!(revert.deleted_persons, 1);
        assert!(revert.deleted_persons <= id_map.len());
    }

    #[tokio::test]
    async fn revert_requires_id_map() {
        let fx = fixture().await;
        let result = MergeResult {
            success: true,
            merged_persons: 0,
            matched_persons: 0,
            personal_tree_id: None,
            group_tree_id: fx.group_tree.clone(),
            person_id_map: None,
            matched_person_ids: Vec::new(),
        };
        let err = fx
            .engine
            .revert_merge(&fx.group_tree, &result)
            .await
            .expect_err("missing map");
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn revert_refuses_persons_of_other_trees() {
        let fx = fixture().await;
        let result = MergeResult {
            success: true,
            merged_persons: 1,
            matched_persons: 0,
            personal_tree_id: Some(fx.personal_tree.clone()),
            group_tree_id: fx.group_tree.clone(),
            person_id_map: Some(BTreeMap::from([(
                PersonId::new("u1"),
                PersonId::new("u1"),
            )])),
            matched_person_ids: Vec::new(),
        };

        let revert = fx
            .engine
            .revert_merge(&fx.group_tree, &result)
            .await
            .expect("revert");
        assert_eq!(revert.deleted_persons, 0);
        assert_eq!(revert.failed, vec![PersonId::new("u1")]);
        assert!(
            fx.graph
                .get_person_by_id(&PersonId::new("u1"))
                .await
                .expect("get")
                .is_some()
        );
    }

    /// Delegates to a memory store but fails batches deleting chosen persons,
    /// and fails patches once `patch_budget` runs out.
    struct FlakyStore {
        inner: MemoryStore,
        fail_deletes: HashSet<PersonId>,
        patch_budget: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_deletes: HashSet<PersonId>) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_deletes,
                patch_budget: AtomicUsize::new(usize::MAX),
            }
        }
    }

    #[async_trait]
    impl FamilyStore for FlakyStore {
        async fn put_person(&self, person: Person) -> Result<Person> {
            self.inner.put_person(person).await
        }

        async fn get_person(&self, person_id: &PersonId) -> Result<Option<Person>> {
            self.inner.get_person(person_id).await
        }

        async fn persons_by_tree(&self, tree_id: &TreeId) -> Result<Vec<Person>> {
            self.inner.persons_by_tree(tree_id).await
        }

        async fn persons_with_group_tree(&self, tree_id: &TreeId) -> Result<Vec<Person>> {
            self.inner.persons_with_group_tree(tree_id).await
        }

        async fn apply_patch(
            &self,
            person_id: &PersonId,
            patch: &PersonPatch,
        ) -> Result<Option<Person>> {
            if self
                .patch_budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_err()
            {
                return Err(LibError::database(
                    "Failed to update person",
                    anyhow!("injected failure"),
                ));
            }
            self.inner.apply_patch(person_id, patch).await
        }

        async fn remove_relationship(
            &self,
            person_id: &PersonId,
            edge: &Relationship,
        ) -> Result<Option<Person>> {
            self.inner.remove_relationship(person_id, edge).await
        }

        async fn commit(&self, batch: WriteBatch) -> Result<()> {
            let blocked = batch.ops().iter().any(|op| {
                matches!(op, WriteOp::DeletePerson { person_id } if self.fail_deletes.contains(person_id))
            });
            if blocked {
                return Err(LibError::database(
                    "Failed to commit batch",
                    anyhow!("injected failure"),
                ));
            }
            self.inner.commit(batch).await
        }

        async fn put_tree(&self, tree: FamilyTree) -> Result<FamilyTree> {
            self.inner.put_tree(tree).await
        }

        async fn get_tree(&self, tree_id: &TreeId) -> Result<Option<FamilyTree>> {
            self.inner.get_tree(tree_id).await
        }

        async fn trees_for_user(&self, user_id: &UserId) -> Result<Vec<FamilyTree>> {
            self.inner.trees_for_user(user_id).await
        }

        async fn put_group(&self, group: FamilyGroup) -> Result<FamilyGroup> {
            self.inner.put_group(group).await
        }

        async fn get_group(&self, group_id: &GroupId) -> Result<Option<FamilyGroup>> {
            self.inner.get_group(group_id).await
        }
    }

    #[tokio::test]
    async fn revert_continues_past_failed_deletes() {
        let requester = UserId::new("u1");
        let group_tree = TreeId::new("g1");
        let fail_id = PersonId::merged_self(&requester, &group_tree);
        let store: Arc<dyn FamilyStore> =
            Arc::new(FlakyStore::new(HashSet::from([fail_id.clone()])));
        let trees = TreeService::new(Arc::clone(&store));
        let graph = RelationshipGraph::new(Arc::clone(&store));
        let engine = TreeMergeEngine::new(Arc::clone(&store));

        let (personal, _) = trees
            .bootstrap_personal_tree(&requester, new_person("Ada", "Smith", 1980))
            .await
            .expect("bootstrap");
        graph
            .create_person(&personal.tree_id, new_person("Bob", "Smith", 1979))
            .await
            .expect("relative");
        store
            .put_tree(FamilyTree {
                tree_id: group_tree.clone(),
                user_id: UserId::new("owner"),
                tree_name: "Smiths".to_string(),
                created_at: chrono::Utc::now(),
                shared_users: Vec::new(),
            })
            .await
            .expect("group tree");

        let result = engine
            .merge_personal_tree_into_group(&requester, &group_tree)
            .await
            .expect("merge");
        let revert = engine
            .revert_merge(&group_tree, &result)
            .await
            .expect("revert is best effort");

        assert_eq!(revert.attempted, 2);
        assert_eq!(revert.deleted_persons, 1);
        assert_eq!(revert.failed, vec![fail_id.clone()]);
        assert!(
            graph
                .get_person_by_id(&fail_id)
                .await
                .expect("get")
                .is_some()
        );
    }

    #[tokio::test]
    async fn failed_link_pass_keeps_copies_and_returns_store_error() {
        let requester = UserId::new("u1");
        let flaky = Arc::new(FlakyStore::new(HashSet::new()));
        let store: Arc<dyn FamilyStore> = flaky.clone();
        let trees = TreeService::new(Arc::clone(&store));
        let graph = RelationshipGraph::new(Arc::clone(&store));
        let engine = TreeMergeEngine::new(Arc::clone(&store));

        let (personal, _) = trees
            .bootstrap_personal_tree(&requester, new_person("Ada", "Smith", 1980))
            .await
            .expect("bootstrap");
        for (first, year, kind) in [
            ("Bob", 1979, RelationshipType::Spouse),
            ("Cy", 2010, RelationshipType::Child),
        ] {
            let relative = graph
                .create_person(&personal.tree_id, new_person(first, "Smith", year))
                .await
                .expect("relative");
            graph
                .add_relationship(&PersonId::new("u1"), &relative.person_id, kind)
                .await
                .expect("link relative");
        }
        let group = trees
            .create_group(&UserId::new("owner"), "Smiths")
            .await
            .expect("group");
        let personal_before = graph
            .get_people_by_tree_id(&personal.tree_id)
            .await
            .expect("personal persons");

        flaky.patch_budget.store(1, Ordering::SeqCst);
        let err = engine
            .merge_personal_tree_into_group(&requester, &group.tree_id)
            .await
            .expect_err("second link write fails");
        assert_eq!(err.kind, ErrorKind::Database);
        assert_eq!(err.public, "Failed to update person");

        let copies = graph
            .get_people_by_tree_id(&group.tree_id)
            .await
            .expect("group persons");
        assert_eq!(copies.len(), 3);
        assert_eq!(
            copies
                .iter()
                .filter(|person| !person.relationships.is_empty())
                .count(),
            1
        );
        assert_eq!(
            graph
                .get_people_by_tree_id(&personal.tree_id)
                .await
                .expect("personal persons"),
            personal_before
        );
    }

    #[tokio::test]
    async fn stats_after_merge() {
        let fx = fixture().await;
        add_relative(&fx, "Bob", 1979, RelationshipType::Spouse).await;
        add_relative(&fx, "Cy", 2010, RelationshipType::Child).await;
        fx.engine
            .merge_personal_tree_into_group(&fx.requester, &fx.group_tree)
            .await
            .expect("merge");

        let stats = fx
            .engine
            .get_tree_merge_stats(&fx.group_tree)
            .await
            .expect("stats");
        assert_eq!(stats.total_persons, 3);
        assert_eq!(stats.total_relationships, 4);
        assert_eq!(stats.relationship_types[&RelationshipType::Spouse], 2);
        assert_eq!(stats.relationship_types[&RelationshipType::Child], 1);
        assert_eq!(stats.relationship_types[&RelationshipType::Parent], 1);
        assert!((stats.average_relationships_per_person - 4.0 / 3.0).abs() < f64::EPSILON);

        let empty = fx
            .engine
            .get_tree_merge_stats(&TreeId::new("nobody"))
            .await
            .expect("stats");
        assert_eq!(empty.total_persons, 0);
        assert_eq!(empty.average_relationships_per_person, 0.0);
    }
}
