use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::Row;
use std::fmt::Write as _;
use std::str::FromStr;

use crate::database_ops::entity::{Entity, ImportRefStore, IMPORT_ID_FIELD, IMPORT_REFERENCES_TABLE};
use crate::util::env as env_util;

/// Destination tables the importer writes, in phase order.
pub const COUNTED_TABLES: &[&str] = &[
    "groups",
    "users",
    "group_users",
    "user_emails",
    "user_profiles",
    "user_stats",
    "categories",
    "topics",
    "posts",
    "tags",
    "topic_tags",
    "post_actions",
    "uploads",
    "topic_allowed_users",
    "badges",
    "user_badges",
    "notifications",
];

#[derive(Debug, Clone, Default)]
pub struct DbCountsConfig {
    /// Optional override for the destination connection string.
    pub database_url: Option<String>,
    /// Show the most recently imported topics (defaults to env RECENT_TOPICS).
    pub show_recent_topics: Option<bool>,
    /// Override the recent topics LIMIT (defaults to env RECENT_TOPICS_LIMIT or 10).
    pub recent_topics_limit: Option<i64>,
}

fn is_undefined_table_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

/// `SELECT count(*)` of the rows an entity's import references cover.
pub fn imported_count_sql(entity: Entity) -> String {
    match entity.import_ref_store() {
        ImportRefStore::CustomField { table, .. } => format!(
            "SELECT count(*) FROM public.{table} WHERE name = '{IMPORT_ID_FIELD}'"
        ),
        ImportRefStore::SideTable => format!(
            "SELECT count(*) FROM public.{IMPORT_REFERENCES_TABLE} WHERE entity_type = '{}'",
            entity.as_str()
        ),
    }
}

pub async fn run(cfg: DbCountsConfig) -> Result<String> {
    env_util::init_env();
    let mut out = String::new();
    let db_url = match cfg.database_url.clone() {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    let mut connect_options = PgConnectOptions::from_str(&db_url)?.statement_cache_capacity(0);
    if db_url.contains("sslmode=require") {
        connect_options = connect_options.ssl_mode(PgSslMode::Require);
    }
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_with(connect_options)
        .await?;

    macro_rules! count {
        ($sql:expr) => {
            match sqlx::query_scalar::<_, i64>($sql)
                .persistent(false)
                .fetch_one(&pool)
                .await
            {
                Ok(val) => val,
                Err(e) if is_undefined_table_error(&e) => 0,
                Err(e) => return Err(e.into()),
            }
        };
    }

    writeln!(out, "DB COUNTS SUMMARY:").ok();
    for table in COUNTED_TABLES {
        let n = count!(&format!("SELECT count(*) FROM public.{table}"));
        writeln!(out, "{table:<22} {n:>10}").ok();
    }

    writeln!(out, "\nIMPORTED (by import reference):").ok();
    for entity in Entity::ALL {
        let n = count!(&imported_count_sql(entity));
        if n > 0 {
            writeln!(out, "{:<22} {n:>10}", entity.as_str()).ok();
        }
    }

    // timestamp without time zone
    let last_post: Option<String> = match sqlx::query_scalar(
        "SELECT max(created_at)::text FROM public.posts",
    )
    .persistent(false)
    .fetch_one(&pool)
    .await
    {
        Ok(v) => v,
        Err(e) if is_undefined_table_error(&e) => None,
        Err(e) => return Err(e.into()),
    };
    if let Some(at) = last_post {
        writeln!(out, "\nnewest post: {at}").ok();
    }

    let show_recent = cfg
        .show_recent_topics
        .unwrap_or_else(|| env_util::env_flag("RECENT_TOPICS", false));
    if show_recent {
        let limit = cfg
            .recent_topics_limit
            .unwrap_or_else(|| env_util::env_parse("RECENT_TOPICS_LIMIT", 10i64));
        let rows = sqlx::query(
            "SELECT t.id::bigint AS id, t.title, f.value AS legacy_id
               FROM public.topics t
               JOIN public.topic_custom_fields f ON f.topic_id = t.id AND f.name = $1
              ORDER BY t.id DESC
              LIMIT $2",
        )
        .bind(IMPORT_ID_FIELD)
        .bind(limit)
        .persistent(false)
        .fetch_all(&pool)
        .await
        .unwrap_or_default();
        writeln!(out, "\nrecently imported topics (limit {limit}):").ok();
        for row in rows {
            let id: i64 = row.get("id");
            let title: String = row.get("title");
            let legacy: String = row.get("legacy_id");
            writeln!(out, "  {id} {title} (legacy {legacy})").ok();
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imported_counts_read_the_right_store() {
        assert_eq!(
            imported_count_sql(Entity::Topic),
            "SELECT count(*) FROM public.topic_custom_fields WHERE name = 'import_id'"
        );
        assert_eq!(
            imported_count_sql(Entity::Tag),
            "SELECT count(*) FROM public.import_references WHERE entity_type = 'tag'"
        );
    }
}
