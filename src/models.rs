use std::collections::BTreeMap;
use std::fmt;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LibError, Result};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(PersonId);
string_id!(TreeId);
string_id!(UserId);
string_id!(GroupId);

impl PersonId {
    /// Person id of a user's own node: the user id itself.
    pub fn for_user(user: &UserId) -> Self {
        Self(user.0.clone())
    }

    /// Deterministic id of a requester's node copied into a group tree.
    pub fn merged_self(requester: &UserId, group_tree_id: &TreeId) -> Self {
        Self(format!("{}_{}", requester, group_tree_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipType {
    Parent,
    Child,
    Spouse,
}

impl RelationshipType {
    /// Type the related person must hold pointing back at the edge holder.
    pub const fn reciprocal(self) -> Self {
        match self {
            RelationshipType::Parent => RelationshipType::Child,
            RelationshipType::Child => RelationshipType::Parent,
            RelationshipType::Spouse => RelationshipType::Spouse,
        }
    }

    pub const fn as_db_value(self) -> &'static str {
        match self {
            RelationshipType::Parent => "parent",
            RelationshipType::Child => "child",
            RelationshipType::Spouse => "spouse",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "parent" => Some(RelationshipType::Parent),
            "child" => Some(RelationshipType::Child),
            "spouse" => Some(RelationshipType::Spouse),
            _ => None,
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_value())
    }
}

/// Edge held by a person. `kind` is the related person's role relative to
/// the holder: `{B, Parent}` on A means B is A's parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub related_person_id: PersonId,
    #[serde(rename = "type")]
    pub kind: RelationshipType,
}

impl Relationship {
    pub fn new(related_person_id: impl Into<PersonId>, kind: RelationshipType) -> Self {
        Self {
            related_person_id: related_person_id.into(),
            kind,
        }
    }

    /// The edge the related person must hold for this one to be symmetric.
    pub fn reciprocal_for(&self, holder: &PersonId) -> Relationship {
        Relationship {
            related_person_id: holder.clone(),
            kind: self.kind.reciprocal(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelationshipViolation {
    UnknownPersonReference {
        person_id: PersonId,
        related_person_id: PersonId,
    },
    SelfReference {
        person_id: PersonId,
    },
    DuplicateEdge {
        person_id: PersonId,
        edge: Relationship,
    },
    MissingReciprocal {
        person_id: PersonId,
        edge: Relationship,
        expected: Relationship,
    },
}

impl RelationshipViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            RelationshipViolation::UnknownPersonReference { .. } => {
                "relationship_unknown_person_reference"
            }
            RelationshipViolation::SelfReference { .. } => "relationship_self_reference",
            RelationshipViolation::DuplicateEdge { .. } => "relationship_duplicate_edge",
            RelationshipViolation::MissingReciprocal { .. } => "relationship_missing_reciprocal",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            RelationshipViolation::UnknownPersonReference { .. } => {
                "Relationship references a person that does not exist"
            }
            RelationshipViolation::SelfReference { .. } => {
                "A person cannot be related to themselves"
            }
            RelationshipViolation::DuplicateEdge { .. } => "Relationship is listed more than once",
            RelationshipViolation::MissingReciprocal { .. } => {
                "Relationship has no matching entry on the related person"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            "other" => Some(Gender::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersonStatus {
    #[default]
    Living,
    Deceased,
}

impl PersonStatus {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            PersonStatus::Living => "living",
            PersonStatus::Deceased => "deceased",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "living" => Some(PersonStatus::Living),
            "deceased" => Some(PersonStatus::Deceased),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub person_id: PersonId,
    pub tree_id: TreeId,
    #[serde(default)]
    pub group_tree_ids: Vec<TreeId>,
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_place: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub status: PersonStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_death: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place_of_death: Option<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Person {
    pub fn from_input(person_id: PersonId, tree_id: TreeId, input: PersonInput) -> Self {
        let now = Utc::now();
        Self {
            person_id,
            tree_id,
            group_tree_ids: Vec::new(),
            first_name: input.first_name,
            middle_name: input.middle_name,
            last_name: input.last_name,
            birth_date: input.birth_date,
            birth_place: input.birth_place,
            gender: input.gender,
            status: input.status,
            date_of_death: input.date_of_death,
            place_of_death: input.place_of_death,
            relationships: input.relationships,
            created_at: now,
            updated_at: now,
        }
    }

    /// Biographical fields of this person as creation input, without edges.
    pub fn to_new_person(&self) -> NewPerson {
        NewPerson {
            first_name: self.first_name.clone(),
            middle_name: self.middle_name.clone(),
            last_name: self.last_name.clone(),
            birth_date: self.birth_date,
            birth_place: self.birth_place.clone(),
            gender: self.gender,
            status: Some(self.status),
            date_of_death: self.date_of_death,
            place_of_death: self.place_of_death.clone(),
            relationships: Vec::new(),
        }
    }

    pub fn has_relationship(&self, edge: &Relationship) -> bool {
        self.relationships.contains(edge)
    }
}

/// Caller-supplied person fields. First and last name are required.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPerson {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub birth_date: Option<NaiveDate>,
    pub birth_place: Option<String>,
    pub gender: Option<Gender>,
    pub status: Option<PersonStatus>,
    pub date_of_death: Option<NaiveDate>,
    pub place_of_death: Option<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

/// Validated person input with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonInput {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub birth_date: Option<NaiveDate>,
    pub birth_place: Option<String>,
    pub gender: Option<Gender>,
    pub status: PersonStatus,
    pub date_of_death: Option<NaiveDate>,
    pub place_of_death: Option<String>,
    pub relationships: Vec<Relationship>,
}

impl NewPerson {
    pub fn named(first_name: &str, last_name: &str) -> Self {
        Self {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            ..Self::default()
        }
    }

    pub fn normalize(self) -> Result<PersonInput> {
        let first_name = self.first_name.trim().to_string();
        if first_name.is_empty() {
            return Err(LibError::invalid(
                "First name is required",
                anyhow!("person input had empty first name"),
            ));
        }
        let last_name = self.last_name.trim().to_string();
        if last_name.is_empty() {
            return Err(LibError::invalid(
                "Last name is required",
                anyhow!("person input had empty last name"),
            ));
        }

        let mut relationships: Vec<Relationship> = Vec::with_capacity(self.relationships.len());
        for edge in self.relationships {
            if !relationships.contains(&edge) {
                relationships.push(edge);
            }
        }

        Ok(PersonInput {
            first_name,
            middle_name: trim_optional(self.middle_name),
            last_name,
            birth_date: self.birth_date,
            birth_place: trim_optional(self.birth_place),
            gender: self.gender,
            status: self.status.unwrap_or_default(),
            date_of_death: self.date_of_death,
            place_of_death: trim_optional(self.place_of_death),
            relationships,
        })
    }
}

fn trim_optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Update for a nullable field: absent keeps the stored value, `null`
/// clears it, anything else replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldPatch<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> FieldPatch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, FieldPatch::Keep)
    }

    /// The new value, if this patch sets one.
    pub fn value(&self) -> Option<&T> {
        match self {
            FieldPatch::Set(value) => Some(value),
            FieldPatch::Keep | FieldPatch::Clear => None,
        }
    }

    fn apply(&self, current: &mut Option<T>)
    where
        T: Clone,
    {
        match self {
            FieldPatch::Keep => {}
            FieldPatch::Clear => *current = None,
            FieldPatch::Set(value) => *current = Some(value.clone()),
        }
    }
}

impl<T: Serialize> Serialize for FieldPatch<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            FieldPatch::Keep | FieldPatch::Clear => serializer.serialize_none(),
            FieldPatch::Set(value) => value.serialize(serializer),
        }
    }
}

// Absent fields never reach this impl; `#[serde(default)]` turns them into `Keep`.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for FieldPatch<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => FieldPatch::Set(value),
            None => FieldPatch::Clear,
        })
    }
}

/// Field overwrites. Names and status can be replaced but never cleared.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "FieldPatch::is_keep")]
    pub middle_name: FieldPatch<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "FieldPatch::is_keep")]
    pub birth_date: FieldPatch<NaiveDate>,
    #[serde(default, skip_serializing_if = "FieldPatch::is_keep")]
    pub birth_place: FieldPatch<String>,
    #[serde(default, skip_serializing_if = "FieldPatch::is_keep")]
    pub gender: FieldPatch<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PersonStatus>,
    #[serde(default, skip_serializing_if = "FieldPatch::is_keep")]
    pub date_of_death: FieldPatch<NaiveDate>,
    #[serde(default, skip_serializing_if = "FieldPatch::is_keep")]
    pub place_of_death: FieldPatch<String>,
}

impl PersonAttributes {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, person: &mut Person) {
        if let Some(value) = &self.first_name {
            person.first_name = value.clone();
        }
        if let Some(value) = &self.last_name {
            person.last_name = value.clone();
        }
        if let Some(value) = self.status {
            person.status = value;
        }
        self.middle_name.apply(&mut person.middle_name);
        self.birth_date.apply(&mut person.birth_date);
        self.birth_place.apply(&mut person.birth_place);
        self.gender.apply(&mut person.gender);
        self.date_of_death.apply(&mut person.date_of_death);
        self.place_of_death.apply(&mut person.place_of_death);
    }
}

/// Partial person update.
///
/// `relationships` is merged into the stored edges with set-union semantics
/// and never removes an edge. `group_tree_ids` replaces the stored list.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonPatch {
    #[serde(flatten)]
    pub attributes: PersonAttributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Vec<Relationship>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_tree_ids: Option<Vec<TreeId>>,
}

impl PersonPatch {
    pub fn relationships(edges: Vec<Relationship>) -> Self {
        Self {
            relationships: Some(edges),
            ..Self::default()
        }
    }

    pub fn group_tree_ids(tree_ids: Vec<TreeId>) -> Self {
        Self {
            group_tree_ids: Some(tree_ids),
            ..Self::default()
        }
    }

    pub fn attributes(attributes: PersonAttributes) -> Self {
        Self {
            attributes,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("first name", &self.attributes.first_name),
            ("last name", &self.attributes.last_name),
        ] {
            if value.as_deref().is_some_and(|value| value.trim().is_empty()) {
                return Err(LibError::invalid(
                    "Person names cannot be blank",
                    anyhow!("patch set blank {}", field),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyTree {
    pub tree_id: TreeId,
    pub user_id: UserId,
    pub tree_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub shared_users: Vec<UserId>,
}

impl FamilyTree {
    /// A personal tree is named after its owner and shared with nobody.
    pub fn is_personal_for(&self, user: &UserId) -> bool {
        self.user_id == *user && self.tree_name == user.0 && self.shared_users.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyGroup {
    pub group_id: GroupId,
    pub group_name: String,
    pub owner_id: UserId,
    pub tree_id: TreeId,
    #[serde(default)]
    pub members: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    /// Persons newly created in the group tree.
    pub merged_persons: usize,
    /// Source persons mapped onto persons that already existed in the group tree.
    #[serde(default)]
    pub matched_persons: usize,
    pub personal_tree_id: Option<TreeId>,
    pub group_tree_id: TreeId,
    #[serde(default)]
    pub person_id_map: Option<BTreeMap<PersonId, PersonId>>,
    #[serde(default)]
    pub matched_person_ids: Vec<PersonId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevertResult {
    pub success: bool,
    pub deleted_persons: usize,
    pub attempted: usize,
    pub failed: Vec<PersonId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TreeMergeStats {
    pub total_persons: usize,
    pub total_relationships: usize,
    pub relationship_types: BTreeMap<RelationshipType, usize>,
    pub average_relationships_per_person: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub success: bool,
}
