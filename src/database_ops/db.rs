use anyhow::{Context, Result};
use futures::TryStreamExt;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::entity::{Entity, ImportRefStore, IMPORT_ID_FIELD, IMPORT_REFERENCES_TABLE};
use crate::util::env::env_flag;

/// Session settings applied to every destination connection for the run.
pub const SESSION_TUNING: &[&str] = &[
    "SET synchronous_commit = 'off'",
    "SET statement_timeout = 0",
    "SET lock_timeout = 0",
    "SET idle_in_transaction_session_timeout = 0",
    "SET jit = off",
];

#[derive(Debug, Clone)]
pub struct ExistingCategory {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub slug: String,
}

#[derive(Debug, Clone)]
pub struct ExistingGroup {
    pub id: i64,
    pub name: String,
    pub automatic: bool,
}

/// Destination database access outside the COPY path.
#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // Never put DSNs in spans; they carry credentials.
    #[instrument(skip(database_url))]
    pub async fn connect_no_migrate(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)
            .context("parsing destination database url")?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // pooler-safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    for &stmt in SESSION_TUNING {
                        if let Err(e) = sqlx::query(stmt).execute(&mut *conn).await {
                            debug!(statement = stmt, error = %e, "session tuning skipped");
                        }
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await
            .context("connecting to destination database")?;
        info!("connected to destination db");
        Ok(Self { pool })
    }

    pub async fn ensure_import_references(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {IMPORT_REFERENCES_TABLE} (
                entity_type TEXT NOT NULL,
                legacy_id BIGINT NOT NULL,
                new_id BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (entity_type, legacy_id)
            )"
        );
        sqlx::query(&sql)
            .persistent(false)
            .execute(&self.pool)
            .await
            .context("creating import_references")?;
        Ok(())
    }

    /// Persisted `(legacy_id, new_id)` pairs for an entity.
    pub async fn load_import_refs(&self, entity: Entity) -> Result<Vec<(i64, i64)>> {
        let mut out = Vec::new();
        match entity.import_ref_store() {
            ImportRefStore::CustomField { table, fk } => {
                let sql = format!(
                    "SELECT value, {fk}::bigint FROM {table} WHERE name = '{IMPORT_ID_FIELD}'"
                );
                let mut rows = sqlx::query_as::<_, (String, i64)>(&sql)
                    .persistent(false)
                    .fetch(&self.pool);
                while let Some((value, new_id)) = rows.try_next().await? {
                    match value.trim().parse::<i64>() {
                        Ok(legacy_id) => out.push((legacy_id, new_id)),
                        Err(_) => debug!(%entity, value, "non-numeric import id ignored"),
                    }
                }
            }
            ImportRefStore::SideTable => {
                let sql = format!(
                    "SELECT legacy_id, new_id FROM {IMPORT_REFERENCES_TABLE} WHERE entity_type = $1"
                );
                let mut rows = sqlx::query_as::<_, (i64, i64)>(&sql)
                    .bind(entity.as_str())
                    .persistent(false)
                    .fetch(&self.pool);
                while let Some(pair) = rows.try_next().await? {
                    out.push(pair);
                }
            }
        }
        Ok(out)
    }

    pub async fn max_id(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COALESCE(MAX(id), 0)::bigint FROM {table}");
        let max: i64 = sqlx::query_scalar(&sql)
            .persistent(false)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("reading max id of {table}"))?;
        Ok(max)
    }

    /// `(user_id, username)` of every destination user.
    pub async fn usernames(&self) -> Result<Vec<(i64, String)>> {
        Ok(sqlx::query_as("SELECT id::bigint, username FROM users")
            .persistent(false)
            .fetch_all(&self.pool)
            .await?)
    }

    /// `(lowercase email, user_id)` of every destination user.
    pub async fn emails(&self) -> Result<Vec<(String, i64)>> {
        Ok(
            sqlx::query_as("SELECT lower(email), user_id::bigint FROM user_emails")
                .persistent(false)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn groups(&self) -> Result<Vec<ExistingGroup>> {
        let rows: Vec<(i64, String, bool)> =
            sqlx::query_as("SELECT id::bigint, name, automatic FROM groups")
                .persistent(false)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, automatic)| ExistingGroup {
                id,
                name,
                automatic,
            })
            .collect())
    }

    pub async fn categories(&self) -> Result<Vec<ExistingCategory>> {
        let rows: Vec<(i64, String, Option<i64>, String)> = sqlx::query_as(
            "SELECT id::bigint, name, parent_category_id::bigint, slug FROM categories",
        )
        .persistent(false)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, parent_id, slug)| ExistingCategory {
                id,
                name,
                parent_id,
                slug,
            })
            .collect())
    }

    /// `(name, id)` pairs of a table with a unique `name` column (tags, badges).
    pub async fn names(&self, table: &str) -> Result<Vec<(String, i64)>> {
        let sql = format!("SELECT name, id::bigint FROM {table}");
        Ok(sqlx::query_as(&sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("reading names from {table}"))?)
    }

    pub async fn upload_sha1s(&self) -> Result<Vec<(String, i64)>> {
        Ok(sqlx::query_as("SELECT sha1, id::bigint FROM uploads WHERE sha1 IS NOT NULL")
            .persistent(false)
            .fetch_all(&self.pool)
            .await?)
    }

    /// `(post_id, topic_id, post_number)` for every previously imported post.
    pub async fn imported_posts(&self) -> Result<Vec<(i64, i64, i64)>> {
        let sql = format!(
            "SELECT p.id::bigint, p.topic_id::bigint, p.post_number::bigint
               FROM posts p
               JOIN post_custom_fields f ON f.post_id = p.id AND f.name = '{IMPORT_ID_FIELD}'"
        );
        let mut out = Vec::new();
        let mut rows = sqlx::query_as::<_, (i64, i64, i64)>(&sql)
            .persistent(false)
            .fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            out.push(row);
        }
        Ok(out)
    }

    /// `(topic_id, max post_number)` over imported topics.
    pub async fn topic_post_numbers(&self) -> Result<Vec<(i64, i64)>> {
        let sql = format!(
            "SELECT t.id::bigint, COALESCE(MAX(p.post_number), 0)::bigint
               FROM topics t
               JOIN topic_custom_fields f ON f.topic_id = t.id AND f.name = '{IMPORT_ID_FIELD}'
               LEFT JOIN posts p ON p.topic_id = t.id
              GROUP BY t.id"
        );
        Ok(sqlx::query_as(&sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Natural keys of a link table. The query must select three bigint columns.
    pub async fn link_keys(&self, sql: &str) -> Result<HashSet<(i64, i64, i64)>> {
        let mut out = HashSet::new();
        let mut rows = sqlx::query_as::<_, (i64, i64, i64)>(sql)
            .persistent(false)
            .fetch(&self.pool);
        while let Some(key) = rows.try_next().await? {
            out.insert(key);
        }
        Ok(out)
    }

    /// Latest applied schema migration, used to refuse merging mismatched schemas.
    pub async fn schema_version(pool: &PgPool) -> Result<Option<String>> {
        Ok(sqlx::query_scalar("SELECT MAX(version)::text FROM schema_migrations")
            .persistent(false)
            .fetch_one(pool)
            .await
            .context("reading schema_migrations")?)
    }
}
