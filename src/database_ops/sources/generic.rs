//! Generic SQLite staging database, already in the destination's markup.

use anyhow::{bail, Result};

use super::{prefixed, SourceAdapter};
use crate::database_ops::etl::Phase;
use crate::database_ops::source::SourceDb;

// GROUPS is a window-frame keyword in newer SQLite.
const GROUPS: &str = r#"SELECT id, name, full_name, bio, created_at FROM "{p}groups" ORDER BY id"#;

const GROUP_USERS: &str = "SELECT group_id, user_id FROM {p}group_members";

const USERS: &str = "
    SELECT id, username, name, email, created_at, last_seen_at, admin, moderator,
           trust_level, active, suspended_at, suspended_till, ip_address
      FROM {p}users ORDER BY id";

const USER_EMAILS: &str = "SELECT id, email, created_at FROM {p}users ORDER BY id";

const USER_PROFILES: &str = "SELECT id, location, website, bio, views FROM {p}users ORDER BY id";

const USER_STATS: &str =
    "SELECT id, created_at, post_count, topic_count FROM {p}users ORDER BY id";

const CATEGORIES: &str = "
    WITH RECURSIVE tree(id, depth) AS (
        SELECT id, 0 FROM {p}categories WHERE parent_category_id IS NULL
        UNION ALL
        SELECT c.id, t.depth + 1 FROM {p}categories c JOIN tree t ON c.parent_category_id = t.id
    )
    SELECT c.id, c.name, c.description, c.parent_category_id AS parent_id, c.position, c.created_at
      FROM {p}categories c
      LEFT JOIN tree t ON t.id = c.id
     ORDER BY COALESCE(t.depth, 0), c.position, c.id";

const TOPICS: &str = "
    SELECT id, title, user_id, category_id, created_at, views, closed, pinned_at
      FROM {p}topics {public} ORDER BY id";

const POSTS: &str = "
    SELECT p.id, p.topic_id, p.user_id, p.raw, p.created_at, p.reply_to_post_id,
           p.like_count, p.hidden
      FROM {p}posts p
      JOIN {p}topics t ON t.id = p.topic_id
     {public_t}
     ORDER BY p.id";

const PRIVATE_TOPICS: &str = "
    SELECT id, title, user_id, created_at
      FROM {p}topics WHERE COALESCE(private_message, 0) <> 0 ORDER BY id";

const PRIVATE_POSTS: &str = "
    SELECT p.id, p.topic_id, p.user_id, p.raw, p.created_at, p.reply_to_post_id
      FROM {p}posts p
      JOIN {p}topics t ON t.id = p.topic_id
     WHERE COALESCE(t.private_message, 0) <> 0
     ORDER BY p.id";

const TAGS: &str = "SELECT id, name FROM {p}tags ORDER BY id";

const TOPIC_TAGS: &str = "SELECT topic_id, tag_id FROM {p}topic_tags";

const POST_ACTIONS: &str = "SELECT id, post_id, user_id, created_at FROM {p}likes ORDER BY id";

const UPLOADS: &str =
    "SELECT id, user_id, path, filename, created_at FROM {p}uploads ORDER BY id";

const TOPIC_ALLOWED_USERS: &str = "SELECT topic_id, user_id FROM {p}topic_allowed_users";

const BADGES: &str = "SELECT id, name, description, badge_type FROM {p}badges ORDER BY id";

const USER_BADGES: &str = "SELECT badge_id, user_id, granted_at FROM {p}user_badges";

const NOTIFICATIONS: &str = "
    SELECT id, user_id, notification_type, topic_id, post_id, data, read, created_at
      FROM {p}notifications ORDER BY id";

pub struct GenericAdapter {
    prefix: String,
    private_messages: bool,
}

impl GenericAdapter {
    pub fn new(prefix: String, private_messages: bool) -> Self {
        Self {
            prefix,
            private_messages,
        }
    }

    /// Look at the staging file to learn whether topics carry a private flag.
    pub async fn inspect(source: &SourceDb) -> Result<Self> {
        let SourceDb::Sqlite(pool) = source else {
            bail!("the generic adapter reads a SQLite staging file, got a {} source", source.kind());
        };
        let flagged: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('topics') WHERE name = 'private_message'",
        )
        .fetch_one(pool)
        .await?;
        Ok(Self::new(String::new(), flagged > 0))
    }
}

#[async_trait::async_trait]
impl SourceAdapter for GenericAdapter {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn query(&self, phase: Phase) -> Option<String> {
        let sql = match phase {
            Phase::Groups => GROUPS,
            Phase::Users => USERS,
            Phase::GroupUsers => GROUP_USERS,
            Phase::UserEmails => USER_EMAILS,
            Phase::UserProfiles => USER_PROFILES,
            Phase::UserStats => USER_STATS,
            Phase::Categories => CATEGORIES,
            Phase::Topics => TOPICS,
            Phase::Posts => POSTS,
            Phase::Tags => TAGS,
            Phase::TopicTags => TOPIC_TAGS,
            Phase::PostActions => POST_ACTIONS,
            Phase::Uploads => UPLOADS,
            Phase::PrivateTopics | Phase::PrivatePosts | Phase::TopicAllowedUsers
                if !self.private_messages =>
            {
                return None
            }
            Phase::PrivateTopics => PRIVATE_TOPICS,
            Phase::PrivatePosts => PRIVATE_POSTS,
            Phase::TopicAllowedUsers => TOPIC_ALLOWED_USERS,
            Phase::Badges => BADGES,
            Phase::UserBadges => USER_BADGES,
            Phase::Notifications => NOTIFICATIONS,
        };
        let (public, public_t) = if self.private_messages {
            (
                "WHERE COALESCE(private_message, 0) = 0",
                "WHERE COALESCE(t.private_message, 0) = 0",
            )
        } else {
            ("", "")
        };
        let sql = sql
            .replace("{public_t}", public_t)
            .replace("{public}", public);
        Some(prefixed(&sql, &self.prefix))
    }

    fn optional_table(&self, phase: Phase) -> Option<String> {
        let table = match phase {
            Phase::Groups => "groups",
            Phase::GroupUsers => "group_members",
            Phase::Categories => "categories",
            Phase::Tags => "tags",
            Phase::TopicTags => "topic_tags",
            Phase::PostActions => "likes",
            Phase::Uploads => "uploads",
            Phase::TopicAllowedUsers => "topic_allowed_users",
            Phase::Badges => "badges",
            Phase::UserBadges => "user_badges",
            Phase::Notifications => "notifications",
            _ => return None,
        };
        Some(format!("{}{table}", self.prefix))
    }

    fn required_tables(&self) -> Vec<String> {
        ["users", "topics", "posts"]
            .iter()
            .map(|t| format!("{}{t}", self.prefix))
            .collect()
    }

    fn convert_markup(&self) -> bool {
        false
    }

    fn decode_entities(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::context::{MigrationContext, RunOptions};
    use crate::database_ops::copy::BulkLoader;
    use crate::database_ops::entity::Entity;
    use crate::database_ops::etl::{run_phase, PhaseStats};
    use crate::database_ops::testing::MemoryCopyTarget;
    use crate::normalization::bbcode::MarkupTransformer;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashSet;

    const STAGING: &[&str] = &[
        "CREATE TABLE \"groups\" (id INTEGER, name TEXT, full_name TEXT, bio TEXT, created_at TEXT)",
        "CREATE TABLE group_members (group_id INTEGER, user_id INTEGER)",
        "CREATE TABLE users (id INTEGER, username TEXT, name TEXT, email TEXT, created_at TEXT,
            last_seen_at TEXT, admin INTEGER, moderator INTEGER, trust_level INTEGER,
            active INTEGER, suspended_at TEXT, suspended_till TEXT, ip_address TEXT,
            location TEXT, website TEXT, bio TEXT, views INTEGER, post_count INTEGER,
            topic_count INTEGER)",
        "CREATE TABLE categories (id INTEGER, name TEXT, description TEXT,
            parent_category_id INTEGER, position INTEGER, created_at TEXT)",
        "CREATE TABLE topics (id INTEGER, title TEXT, user_id INTEGER, category_id INTEGER,
            created_at TEXT, views INTEGER, closed INTEGER, pinned_at TEXT, private_message INTEGER)",
        "CREATE TABLE posts (id INTEGER, topic_id INTEGER, user_id INTEGER, raw TEXT,
            created_at TEXT, reply_to_post_id INTEGER, like_count INTEGER, hidden INTEGER)",
        "CREATE TABLE tags (id INTEGER, name TEXT)",
        "CREATE TABLE topic_tags (topic_id INTEGER, tag_id INTEGER)",
        "CREATE TABLE likes (id INTEGER, post_id INTEGER, user_id INTEGER, created_at TEXT)",
        "CREATE TABLE uploads (id INTEGER, user_id INTEGER, path TEXT, filename TEXT, created_at TEXT)",
        "CREATE TABLE topic_allowed_users (topic_id INTEGER, user_id INTEGER)",
        "CREATE TABLE badges (id INTEGER, name TEXT, description TEXT, badge_type INTEGER)",
        "CREATE TABLE user_badges (badge_id INTEGER, user_id INTEGER, granted_at TEXT)",
        "CREATE TABLE notifications (id INTEGER, user_id INTEGER, notification_type INTEGER,
            topic_id INTEGER, post_id INTEGER, data TEXT, read INTEGER, created_at TEXT)",
    ];

    async fn staging(statements: &[&str]) -> SourceDb {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for sql in statements {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        SourceDb::Sqlite(pool)
    }

    #[tokio::test]
    async fn every_phase_query_runs_against_the_staging_schema() {
        let source = staging(STAGING).await;
        let adapter = GenericAdapter::inspect(&source).await.unwrap();
        assert!(adapter.private_messages);
        for table in adapter.required_tables() {
            assert!(source.table_exists(&table).await.unwrap(), "{table}");
        }
        for phase in Phase::ALL {
            let sql = adapter.query(phase).unwrap();
            assert_eq!(source.count(&sql).await.unwrap(), 0, "{phase}");
        }
    }

    #[tokio::test]
    async fn private_rows_are_split_off() {
        let source = staging(&[
            STAGING[4],
            STAGING[5],
            "INSERT INTO topics (id, title, private_message) VALUES (1, 'public', 0), (2, 'dm', 1), (3, 'old', NULL)",
            "INSERT INTO posts (id, topic_id, raw) VALUES (10, 1, 'a'), (11, 2, 'b'), (12, 3, 'c')",
        ])
        .await;
        let adapter = GenericAdapter::inspect(&source).await.unwrap();
        let count = |phase| {
            let sql = adapter.query(phase).unwrap();
            let source = &source;
            async move { source.count(&sql).await.unwrap() }
        };
        assert_eq!(count(Phase::Topics).await, 2);
        assert_eq!(count(Phase::PrivateTopics).await, 1);
        assert_eq!(count(Phase::Posts).await, 2);
        assert_eq!(count(Phase::PrivatePosts).await, 1);
    }

    #[tokio::test]
    async fn unflagged_topics_have_no_private_phases() {
        let source = staging(&[
            "CREATE TABLE topics (id INTEGER, title TEXT, user_id INTEGER, category_id INTEGER,
                created_at TEXT, views INTEGER, closed INTEGER, pinned_at TEXT)",
        ])
        .await;
        let adapter = GenericAdapter::inspect(&source).await.unwrap();
        assert!(adapter.query(Phase::PrivatePosts).is_none());
        assert!(!adapter.query(Phase::Topics).unwrap().contains("private_message"));
    }

    const CHAIN: [Phase; 5] = [
        Phase::Users,
        Phase::UserEmails,
        Phase::Categories,
        Phase::Topics,
        Phase::Posts,
    ];

    /// One import run as a fresh process would do it: reload what the
    /// destination already holds, then every phase of the chain.
    async fn import_pass(
        adapter: &GenericAdapter,
        source: &SourceDb,
        target: &MemoryCopyTarget,
    ) -> Vec<PhaseStats> {
        let options = RunOptions {
            convert_markup: false,
            ..RunOptions::default()
        };
        let mut ctx =
            MigrationContext::new(options, MarkupTransformer::new(Vec::new()).unwrap()).unwrap();
        target.reload(&mut ctx);
        let mut loader = BulkLoader::new(target.clone(), 1);
        let mut out = Vec::new();
        for phase in CHAIN {
            ctx.link_keys = match phase {
                Phase::UserEmails => target.keys("user_emails", 1, None),
                _ => HashSet::new(),
            };
            let sql = adapter.query(phase).unwrap();
            out.push(run_phase(&mut ctx, &mut loader, source, &sql, phase.spec()).await);
        }
        out
    }

    #[tokio::test]
    async fn rerun_after_a_failed_post_completes_without_duplicates() {
        let source = staging(&[
            STAGING[2],
            STAGING[3],
            STAGING[4],
            STAGING[5],
            "INSERT INTO users (id, username, email) VALUES (1, 'ann', 'ann@x.io'), (2, 'bob', 'bob@x.io')",
            "INSERT INTO categories (id, name) VALUES (1, 'General')",
            "INSERT INTO topics (id, title, user_id, category_id) VALUES (10, 'First', 1, 1), (11, 'Second', 2, 1)",
            "INSERT INTO posts (id, topic_id, user_id, raw) VALUES
                (416, 10, 1, 'hello'), (417, 10, 2, 'reply that breaks the copy'), (418, 11, 2, 'other topic')",
        ])
        .await;
        let adapter = GenericAdapter::inspect(&source).await.unwrap();
        let target = MemoryCopyTarget::default();
        target.fail_row_containing("posts", "breaks the copy");

        let first = import_pass(&adapter, &source, &target).await;
        let posts = first.last().unwrap();
        assert!(posts.bulk_failed);
        assert!(target.lines("posts").is_empty());
        assert_eq!(target.lines("users").len(), 2);
        assert_eq!(target.lines("topics").len(), 2);

        target.heal();
        let second = import_pass(&adapter, &source, &target).await;
        for stats in &second[..CHAIN.len() - 1] {
            assert_eq!(stats.rows, 0, "{} written twice", stats.phase);
        }
        assert_eq!(second.last().unwrap().rows, 3);

        let third = import_pass(&adapter, &source, &target).await;
        assert!(third.iter().all(|s| s.rows == 0 && !s.bulk_failed));

        assert_eq!(target.lines("users").len(), 2);
        assert_eq!(target.lines("user_emails").len(), 2);
        assert_eq!(target.lines("categories").len(), 1);
        assert_eq!(target.lines("topics").len(), 2);
        assert_eq!(target.lines("posts").len(), 3);

        let legacy_posts: Vec<i64> = target
            .import_refs(Entity::Post)
            .into_iter()
            .map(|(legacy, _)| legacy)
            .collect();
        assert_eq!(legacy_posts.len(), 3);
        assert_eq!(legacy_posts.iter().collect::<HashSet<_>>().len(), 3);

        let topic_ids: HashSet<i64> = target.column("topics", 0).into_iter().collect();
        let post_topics = target.column("posts", 3);
        assert_eq!(post_topics.len(), 3);
        assert!(post_topics.iter().all(|t| topic_ids.contains(t)));
        let user_ids: HashSet<i64> = target.column("users", 0).into_iter().collect();
        assert!(target.column("user_emails", 1).iter().all(|u| user_ids.contains(u)));
    }
}
