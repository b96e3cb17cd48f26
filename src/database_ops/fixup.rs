//! Post-load reconciliation: primary-key sequences and per-topic counters.
//! Every step is idempotent and runs even after row-level failures.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use super::context::ALLOCATED_TABLES;
use super::db::Db;

/// Fixed order; tables not listed here are reset afterwards in the order given.
pub const FIXUP_ORDER: &[&str] = &[
    "groups",
    "users",
    "user_emails",
    "categories",
    "topics",
    "posts",
    "post_actions",
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct FixupReport {
    /// `(table, new sequence value)` for every sequence that moved.
    pub sequences: Vec<(String, i64)>,
    pub topics_updated: u64,
    pub errors: u64,
}

/// New sequence value, or `None` when the sequence is already at or past `max_id`.
pub fn plan_sequence(max_id: i64, last_value: Option<i64>) -> Option<i64> {
    if max_id <= 0 {
        return None;
    }
    match last_value {
        Some(last) if last >= max_id => None,
        _ => Some(max_id),
    }
}

/// `tables` in [`FIXUP_ORDER`] order first, then the rest as given.
pub fn fixup_tables<'a>(tables: &[&'a str]) -> Vec<&'a str> {
    let mut out: Vec<&'a str> = FIXUP_ORDER
        .iter()
        .filter_map(|t| tables.iter().find(|x| *x == t).copied())
        .collect();
    for t in tables {
        if !out.contains(t) {
            out.push(*t);
        }
    }
    out
}

/// Every table the importer allocates ids for, whether or not this run wrote
/// to it: a rerun after a crash between COPY and fixup writes nothing.
pub fn sequence_tables() -> Vec<&'static str> {
    fixup_tables(ALLOCATED_TABLES)
}

async fn reset_sequence(db: &Db, table: &str) -> Result<Option<i64>> {
    let seq: Option<String> = sqlx::query_scalar("SELECT pg_get_serial_sequence($1, 'id')")
        .bind(table)
        .persistent(false)
        .fetch_one(&db.pool)
        .await?;
    let Some(seq) = seq else {
        return Ok(None);
    };
    let max_id = db.max_id(table).await?;
    let last: Option<i64> = sqlx::query_scalar(&format!("SELECT last_value::bigint FROM {seq}"))
        .persistent(false)
        .fetch_optional(&db.pool)
        .await?;
    let Some(value) = plan_sequence(max_id, last) else {
        return Ok(None);
    };
    sqlx::query("SELECT setval($1::regclass, $2)")
        .bind(&seq)
        .bind(value)
        .persistent(false)
        .execute(&db.pool)
        .await
        .with_context(|| format!("setval on {seq}"))?;
    Ok(Some(value))
}

const TOPIC_COUNTERS_SQL: &str = "
    UPDATE topics t
       SET highest_post_number = s.max_number,
           posts_count = s.post_count,
           last_posted_at = s.last_at
      FROM (
            SELECT topic_id,
                   MAX(post_number) AS max_number,
                   COUNT(*) AS post_count,
                   MAX(created_at) AS last_at
              FROM posts
             WHERE deleted_at IS NULL
             GROUP BY topic_id
           ) s
     WHERE s.topic_id = t.id
       AND (t.highest_post_number IS DISTINCT FROM s.max_number
            OR t.posts_count IS DISTINCT FROM s.post_count
            OR t.last_posted_at IS DISTINCT FROM s.last_at)";

pub async fn run(db: &Db) -> FixupReport {
    let mut report = FixupReport::default();
    for table in sequence_tables() {
        match reset_sequence(db, table).await {
            Ok(Some(value)) => {
                info!(target: "fixup", table, value, "sequence reset");
                report.sequences.push((table.to_string(), value));
            }
            Ok(None) => {}
            Err(e) => {
                report.errors += 1;
                warn!(target: "fixup", table, error = ?e, "sequence reset failed");
            }
        }
    }

    match sqlx::query(TOPIC_COUNTERS_SQL)
        .persistent(false)
        .execute(&db.pool)
        .await
    {
        Ok(done) => {
            report.topics_updated = done.rows_affected();
            info!(target: "fixup", topics = report.topics_updated, "topic counters recomputed");
        }
        Err(e) => {
            report.errors += 1;
            warn!(target: "fixup", error = %e, "topic counter update failed");
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_only_move_forward() {
        assert_eq!(plan_sequence(10, Some(3)), Some(10));
        assert_eq!(plan_sequence(10, Some(10)), None);
        assert_eq!(plan_sequence(10, Some(50)), None);
        assert_eq!(plan_sequence(0, Some(1)), None);
        assert_eq!(plan_sequence(4, None), Some(4));
    }

    #[test]
    fn every_allocated_table_is_reset_even_without_new_rows() {
        let tables = sequence_tables();
        assert_eq!(tables.len(), ALLOCATED_TABLES.len());
        assert_eq!(&tables[..FIXUP_ORDER.len()], FIXUP_ORDER);
        for table in ALLOCATED_TABLES {
            assert!(tables.contains(table), "{table}");
        }
        // keyed by user_id, no id sequence
        assert!(!tables.contains(&"user_profiles"));
        assert!(!tables.contains(&"user_stats"));
    }

    #[test]
    fn fixed_order_comes_first() {
        let tables = ["tags", "posts", "users", "topic_tags", "groups"];
        assert_eq!(
            fixup_tables(&tables),
            ["groups", "users", "posts", "tags", "topic_tags"]
        );
    }
}
