use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::config::DatabaseConfig;
use crate::error::{LibError, Result};
use crate::models::{
    FamilyGroup, FamilyTree, Gender, GroupId, Person, PersonId, PersonPatch, PersonStatus,
    Relationship, RelationshipType, TreeId, UserId,
};
use crate::store::{FamilyStore, WriteBatch, WriteOp};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_family_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let Some(url) = config.url.as_deref() else {
        return Err(LibError::invalid(
            "Database URL is not configured",
            anyhow!("FAMILY_DATABASE_URL is not set"),
        ));
    };

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
        .map_err(|err| db_err("Failed to connect to database", err))
}

#[derive(Debug, Clone, FromRow)]
struct PersonRow {
    id: String,
    tree_id: String,
    group_tree_ids: Vec<String>,
    first_name: String,
    middle_name: Option<String>,
    last_name: String,
    birth_date: Option<NaiveDate>,
    birth_place: Option<String>,
    gender: Option<String>,
    status: String,
    date_of_death: Option<NaiveDate>,
    place_of_death: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct RelationshipRow {
    person_id: String,
    related_person_id: String,
    relationship_type: String,
}

#[derive(Debug, Clone, FromRow)]
struct TreeRow {
    id: String,
    user_id: String,
    tree_name: String,
    shared_users: Vec<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct GroupRow {
    id: String,
    group_name: String,
    owner_id: String,
    tree_id: String,
    members: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<TreeRow> for FamilyTree {
    fn from(value: TreeRow) -> Self {
        Self {
            tree_id: TreeId(value.id),
            user_id: UserId(value.user_id),
            tree_name: value.tree_name,
            created_at: value.created_at,
            shared_users: value.shared_users.into_iter().map(UserId).collect(),
        }
    }
}

impl From<GroupRow> for FamilyGroup {
    fn from(value: GroupRow) -> Self {
        Self {
            group_id: GroupId(value.id),
            group_name: value.group_name,
            owner_id: UserId(value.owner_id),
            tree_id: TreeId(value.tree_id),
            members: value.members.into_iter().map(UserId).collect(),
            created_at: value.created_at,
        }
    }
}

const PERSON_COLUMNS: &str = r#"
    id,
    tree_id,
    group_tree_ids,
    first_name,
    middle_name,
    last_name,
    birth_date,
    birth_place,
    gender,
    status,
    date_of_death,
    place_of_death,
    created_at,
    updated_at
"#;

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

fn malformed(detail: String) -> LibError {
    LibError::database("Stored person is malformed", anyhow!(detail))
}

fn hydrate_persons(rows: Vec<PersonRow>, edges: Vec<RelationshipRow>) -> Result<Vec<Person>> {
    let mut by_person: HashMap<String, Vec<Relationship>> = HashMap::new();
    for edge in edges {
        let kind = RelationshipType::from_db_value(&edge.relationship_type).ok_or_else(|| {
            malformed(format!(
                "unknown relationship type {} on person {}",
                edge.relationship_type, edge.person_id
            ))
        })?;
        by_person
            .entry(edge.person_id)
            .or_default()
            .push(Relationship::new(edge.related_person_id, kind));
    }

    rows.into_iter()
        .map(|row| {
            let status = PersonStatus::from_db_value(&row.status).ok_or_else(|| {
                malformed(format!("unknown status {} on person {}", row.status, row.id))
            })?;
            let gender = match row.gender.as_deref() {
                Some(value) => Some(Gender::from_db_value(value).ok_or_else(|| {
                    malformed(format!("unknown gender {} on person {}", value, row.id))
                })?),
                None => None,
            };
            let relationships = by_person.remove(&row.id).unwrap_or_default();

            Ok(Person {
                person_id: PersonId(row.id),
                tree_id: TreeId(row.tree_id),
                group_tree_ids: row.group_tree_ids.into_iter().map(TreeId).collect(),
                first_name: row.first_name,
                middle_name: row.middle_name,
                last_name: row.last_name,
                birth_date: row.birth_date,
                birth_place: row.birth_place,
                gender,
                status,
                date_of_death: row.date_of_death,
                place_of_death: row.place_of_death,
                relationships,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        })
        .collect()
}

async fn load_relationships(pool: &PgPool, person_ids: Vec<String>) -> Result<Vec<RelationshipRow>> {
    if person_ids.is_empty() {
        return Ok(Vec::new());
    }

    sqlx::query_as::<_, RelationshipRow>(
        r#"
        SELECT person_id, related_person_id, relationship_type
        FROM family.relationships
        WHERE person_id = ANY($1)
        ORDER BY position ASC
        "#,
    )
    .bind(person_ids)
    .fetch_all(pool)
    .await
    .map_err(|err| db_err("Failed to query relationships", err))
}

async fn person_exists(tx: &mut Transaction<'_, Postgres>, person_id: &PersonId) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT id
        FROM family.persons
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(person_id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to query person", err))?;

    Ok(row.is_some())
}

async fn touch_person(tx: &mut Transaction<'_, Postgres>, person_id: &PersonId) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE family.persons
        SET updated_at = CURRENT_TIMESTAMP
        WHERE id = $1
        "#,
    )
    .bind(person_id.as_str())
    .execute(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to update person", err))?;

    Ok(())
}

/// Adds each edge unless already present. The primary key makes concurrent
/// unions on the same person safe. Missing persons are skipped.
async fn union_edges(
    tx: &mut Transaction<'_, Postgres>,
    person_id: &PersonId,
    edges: &[Relationship],
) -> Result<()> {
    for edge in edges {
        sqlx::query(
            r#"
            INSERT INTO family.relationships (person_id, related_person_id, relationship_type)
            SELECT $1, $2, $3
            WHERE EXISTS (
                SELECT 1
                FROM family.persons
                WHERE id = $1
            )
            ON CONFLICT (person_id, related_person_id, relationship_type) DO NOTHING
            "#,
        )
        .bind(person_id.as_str())
        .bind(edge.related_person_id.as_str())
        .bind(edge.kind.as_db_value())
        .execute(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to write relationships", err))?;
    }

    Ok(())
}

async fn delete_edge(
    tx: &mut Transaction<'_, Postgres>,
    person_id: &PersonId,
    edge: &Relationship,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM family.relationships
        WHERE person_id = $1
          AND related_person_id = $2
          AND relationship_type = $3
        "#,
    )
    .bind(person_id.as_str())
    .bind(edge.related_person_id.as_str())
    .bind(edge.kind.as_db_value())
    .execute(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to delete relationship", err))?;

    Ok(())
}

async fn apply_write(tx: &mut Transaction<'_, Postgres>, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::UnionRelationships { person_id, edges } => {
            union_edges(tx, person_id, edges).await?;
            touch_person(tx, person_id).await
        }
        WriteOp::RemoveRelationship { person_id, edge } => {
            delete_edge(tx, person_id, edge).await?;
            touch_person(tx, person_id).await
        }
        WriteOp::RemoveRelationshipsTo {
            person_id,
            related_person_id,
        } => {
            sqlx::query(
                r#"
                DELETE FROM family.relationships
                WHERE person_id = $1
                  AND related_person_id = $2
                "#,
            )
            .bind(person_id.as_str())
            .bind(related_person_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|err| db_err("Failed to delete relationships", err))?;
            touch_person(tx, person_id).await
        }
        WriteOp::DeletePerson { person_id } => {
            sqlx::query(
                r#"
                DELETE FROM family.persons
                WHERE id = $1
                "#,
            )
            .bind(person_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|err| db_err("Failed to delete person", err))?;
            Ok(())
        }
        WriteOp::DeleteTree { tree_id } => {
            sqlx::query(
                r#"
                UPDATE family.persons
                SET group_tree_ids = array_remove(group_tree_ids, $1),
                    updated_at = CURRENT_TIMESTAMP
                WHERE $1 = ANY(group_tree_ids)
                "#,
            )
            .bind(tree_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|err| db_err("Failed to unlink group tree", err))?;

            sqlx::query(
                r#"
                DELETE FROM family.groups
                WHERE tree_id = $1
                "#,
            )
            .bind(tree_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|err| db_err("Failed to delete groups", err))?;

            sqlx::query(
                r#"
                DELETE FROM family.trees
                WHERE id = $1
                "#,
            )
            .bind(tree_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|err| db_err("Failed to delete tree", err))?;
            Ok(())
        }
    }
}

/// [`FamilyStore`] on PostgreSQL. Edges live in their own table keyed by
/// `(person_id, related_person_id, relationship_type)`.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub fn from_pool(pool: &PgPool) -> Self {
        Self {
            pool: Arc::new(pool.clone()),
        }
    }

    pub fn pool(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))
    }

    async fn query_persons(&self, sql: &str, bind: &str) -> Result<Vec<Person>> {
        let rows = sqlx::query_as::<_, PersonRow>(sql)
            .bind(bind)
            .fetch_all(&*self.pool)
            .await
            .map_err(|err| db_err("Failed to query persons", err))?;
        let ids = rows.iter().map(|row| row.id.clone()).collect();
        let edges = load_relationships(&self.pool, ids).await?;
        hydrate_persons(rows, edges)
    }
}

async fn commit_tx(tx: Transaction<'_, Postgres>) -> Result<()> {
    tx.commit()
        .await
        .map_err(|err| db_err("Failed to commit transaction", err))
}

#[async_trait]
impl FamilyStore for PgStore {
    async fn put_person(&self, person: Person) -> Result<Person> {
        let mut tx = self.begin().await?;
        let group_tree_ids: Vec<String> = person
            .group_tree_ids
            .iter()
            .map(|tree_id| tree_id.0.clone())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO family.persons (
                id,
                tree_id,
                group_tree_ids,
                first_name,
                middle_name,
                last_name,
                birth_date,
                birth_place,
                gender,
                status,
                date_of_death,
                place_of_death,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE
            SET tree_id = EXCLUDED.tree_id,
                group_tree_ids = EXCLUDED.group_tree_ids,
                first_name = EXCLUDED.first_name,
                middle_name = EXCLUDED.middle_name,
                last_name = EXCLUDED.last_name,
                birth_date = EXCLUDED.birth_date,
                birth_place = EXCLUDED.birth_place,
                gender = EXCLUDED.gender,
                status = EXCLUDED.status,
                date_of_death = EXCLUDED.date_of_death,
                place_of_death = EXCLUDED.place_of_death,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(person.person_id.as_str())
        .bind(person.tree_id.as_str())
        .bind(group_tree_ids)
        .bind(&person.first_name)
        .bind(&person.middle_name)
        .bind(&person.last_name)
        .bind(person.birth_date)
        .bind(&person.birth_place)
        .bind(person.gender.map(Gender::as_db_value))
        .bind(person.status.as_db_value())
        .bind(person.date_of_death)
        .bind(&person.place_of_death)
        .bind(person.created_at)
        .bind(person.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to write person", err))?;

        sqlx::query(
            r#"
            DELETE FROM family.relationships
            WHERE person_id = $1
            "#,
        )
        .bind(person.person_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to replace relationships", err))?;

        union_edges(&mut tx, &person.person_id, &person.relationships).await?;
        commit_tx(tx).await?;

        Ok(person)
    }

    async fn get_person(&self, person_id: &PersonId) -> Result<Option<Person>> {
        let sql = format!("SELECT {PERSON_COLUMNS} FROM family.persons WHERE id = $1");
        let mut persons = self.query_persons(&sql, person_id.as_str()).await?;
        Ok(persons.pop())
    }

    async fn persons_by_tree(&self, tree_id: &TreeId) -> Result<Vec<Person>> {
        let sql =
            format!("SELECT {PERSON_COLUMNS} FROM family.persons WHERE tree_id = $1 ORDER BY id ASC");
        self.query_persons(&sql, tree_id.as_str()).await
    }

    async fn persons_with_group_tree(&self, tree_id: &TreeId) -> Result<Vec<Person>> {
        let sql = format!(
            "SELECT {PERSON_COLUMNS} FROM family.persons WHERE $1 = ANY(group_tree_ids) ORDER BY id ASC"
        );
        self.query_persons(&sql, tree_id.as_str()).await
    }

    async fn apply_patch(
        &self,
        person_id: &PersonId,
        patch: &PersonPatch,
    ) -> Result<Option<Person>> {
        let mut tx = self.begin().await?;
        if !person_exists(&mut tx, person_id).await? {
            return Ok(None);
        }

        let attributes = &patch.attributes;
        sqlx::query(
            r#"
            UPDATE family.persons
            SET first_name = COALESCE($2, first_name),
                last_name = COALESCE($3, last_name),
                status = COALESCE($4, status),
                middle_name = CASE WHEN $5 THEN $6 ELSE middle_name END,
                birth_date = CASE WHEN $7 THEN $8 ELSE birth_date END,
                birth_place = CASE WHEN $9 THEN $10 ELSE birth_place END,
                gender = CASE WHEN $11 THEN $12 ELSE gender END,
                date_of_death = CASE WHEN $13 THEN $14 ELSE date_of_death END,
                place_of_death = CASE WHEN $15 THEN $16 ELSE place_of_death END,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(person_id.as_str())
        .bind(&attributes.first_name)
        .bind(&attributes.last_name)
        .bind(attributes.status.map(PersonStatus::as_db_value))
        .bind(!attributes.middle_name.is_keep())
        .bind(attributes.middle_name.value().map(String::as_str))
        .bind(!attributes.birth_date.is_keep())
        .bind(attributes.birth_date.value().copied())
        .bind(!attributes.birth_place.is_keep())
        .bind(attributes.birth_place.value().map(String::as_str))
        .bind(!attributes.gender.is_keep())
        .bind(attributes.gender.value().map(|gender| gender.as_db_value()))
        .bind(!attributes.date_of_death.is_keep())
        .bind(attributes.date_of_death.value().copied())
        .bind(!attributes.place_of_death.is_keep())
        .bind(attributes.place_of_death.value().map(String::as_str))
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to update person", err))?;

        if let Some(tree_ids) = &patch.group_tree_ids {
            let tree_ids: Vec<String> = tree_ids.iter().map(|tree_id| tree_id.0.clone()).collect();
            sqlx::query(
                r#"
                UPDATE family.persons
                SET group_tree_ids = $2
                WHERE id = $1
                "#,
            )
            .bind(person_id.as_str())
            .bind(tree_ids)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to update group trees", err))?;
        }

        if let Some(edges) = &patch.relationships {
            union_edges(&mut tx, person_id, edges).await?;
        }

        commit_tx(tx).await?;
        self.get_person(person_id).await
    }

    async fn remove_relationship(
        &self,
        person_id: &PersonId,
        edge: &Relationship,
    ) -> Result<Option<Person>> {
        let mut tx = self.begin().await?;
        if !person_exists(&mut tx, person_id).await? {
            return Ok(None);
        }
        delete_edge(&mut tx, person_id, edge).await?;
        touch_person(&mut tx, person_id).await?;
        commit_tx(tx).await?;
        self.get_person(person_id).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin().await?;
        for op in batch.ops() {
            apply_write(&mut tx, op).await?;
        }
        commit_tx(tx).await
    }

    async fn put_tree(&self, tree: FamilyTree) -> Result<FamilyTree> {
        let shared_users: Vec<String> = tree.shared_users.iter().map(|user| user.0.clone()).collect();
        sqlx::query(
            r#"
            INSERT INTO family.trees (id, user_id, tree_name, shared_users, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                tree_name = EXCLUDED.tree_name,
                shared_users = EXCLUDED.shared_users
            "#,
        )
        .bind(tree.tree_id.as_str())
        .bind(tree.user_id.as_str())
        .bind(&tree.tree_name)
        .bind(shared_users)
        .bind(tree.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|err| db_err("Failed to write tree", err))?;

        Ok(tree)
    }

    async fn get_tree(&self, tree_id: &TreeId) -> Result<Option<FamilyTree>> {
        let row = sqlx::query_as::<_, TreeRow>(
            r#"
            SELECT id, user_id, tree_name, shared_users, created_at
            FROM family.trees
            WHERE id = $1
            "#,
        )
        .bind(tree_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|err| db_err("Failed to query tree", err))?;

        Ok(row.map(FamilyTree::from))
    }

    async fn trees_for_user(&self, user_id: &UserId) -> Result<Vec<FamilyTree>> {
        let rows = sqlx::query_as::<_, TreeRow>(
            r#"
            SELECT id, user_id, tree_name, shared_users, created_at
            FROM family.trees
            WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|err| db_err("Failed to list trees", err))?;

        Ok(rows.into_iter().map(FamilyTree::from).collect())
    }

    async fn put_group(&self, group: FamilyGroup) -> Result<FamilyGroup> {
        let members: Vec<String> = group.members.iter().map(|user| user.0.clone()).collect();
        sqlx::query(
            r#"
            INSERT INTO family.groups (id, group_name, owner_id, tree_id, members, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET group_name = EXCLUDED.group_name,
                owner_id = EXCLUDED.owner_id,
                tree_id = EXCLUDED.tree_id,
                members = EXCLUDED.members
            "#,
        )
        .bind(group.group_id.as_str())
        .bind(&group.group_name)
        .bind(group.owner_id.as_str())
        .bind(group.tree_id.as_str())
        .bind(members)
        .bind(group.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|err| db_err("Failed to write group", err))?;

        Ok(group)
    }

    async fn get_group(&self, group_id: &GroupId) -> Result<Option<FamilyGroup>> {
        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT id, group_name, owner_id, tree_id, members, created_at
            FROM family.groups
            WHERE id = $1
            "#,
        )
        .bind(group_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|err| db_err("Failed to query group", err))?;

        Ok(row.map(FamilyGroup::from))
    }
}
