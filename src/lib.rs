pub mod algorithms;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod graph;
pub mod invariants;
pub mod membership;
pub mod merge;
pub mod models;
pub mod operations;
pub mod store;
pub mod telemetry;
pub mod trees;

pub mod prelude {
    pub use crate::algorithms::{relationship_stats, translate_relationships, union_relationships};
    pub use crate::config::{DatabaseConfig, DuplicateMatching, FamilyConfig, MergeConfig};
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgStore, connect, create_family_tables};
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::graph::RelationshipGraph;
    pub use crate::invariants::{ensure_symmetric, relationship_violations};
    pub use crate::membership::GroupMembership;
    pub use crate::merge::{DuplicateMatcher, NameAndBirthDate, NoMatching, TreeMergeEngine};
    pub use crate::models::{
        FamilyGroup, FamilyTree, FieldPatch, Gender, GroupId, MergeResult, NewPerson, Person,
        PersonAttributes, PersonId, PersonPatch, PersonStatus, Relationship, RelationshipType,
        RelationshipViolation, RevertResult, TreeId, TreeMergeStats, UserId,
    };
    pub use crate::operations::{FamilyOperation, FamilyOperationResult, FamilyOperations};
    pub use crate::store::{FamilyStore, MemoryStore, WriteBatch, WriteOp};
    pub use crate::telemetry::init_tracing;
    pub use crate::trees::TreeService;
}
