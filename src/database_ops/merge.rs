//! Merging a second destination-schema database into this one.
//!
//! Bodies are already in target markup; only the topic numbers inside full
//! quote headers need renumbering. Users, categories and tags that already
//! exist by natural key merge instead of being duplicated.

use anyhow::{bail, Result};
use regex::Captures;
use tracing::info;

use super::db::Db;
use super::etl::Phase;
use super::source::{LegacyRow, SourceDb};
use super::sources::SourceAdapter;
use crate::normalization::bbcode::{MarkupLookup, Rule};

const GROUPS: &str = "
    SELECT id::bigint, name, full_name, bio_raw AS bio, created_at, automatic,
           visibility_level AS visibility
      FROM groups ORDER BY id";

const USERS: &str = "
    SELECT u.id::bigint, u.username, u.name, e.email, u.created_at, u.last_seen_at,
           u.admin, u.moderator, u.trust_level, u.active, u.suspended_at, u.suspended_till,
           host(u.ip_address) AS ip_address
      FROM users u
      LEFT JOIN user_emails e ON e.user_id = u.id AND e.\"primary\"
     WHERE u.id > 0
     ORDER BY u.id";

const GROUP_USERS: &str = "
    SELECT group_id::bigint, user_id::bigint, owner FROM group_users WHERE user_id > 0";

const USER_EMAILS: &str = "
    SELECT user_id::bigint AS id, email, created_at FROM user_emails
     WHERE \"primary\" AND user_id > 0 ORDER BY user_id";

const USER_PROFILES: &str = "
    SELECT user_id::bigint AS id, location, website, bio_raw AS bio, views
      FROM user_profiles WHERE user_id > 0 ORDER BY user_id";

const USER_STATS: &str = "
    SELECT user_id::bigint AS id, new_since AS created_at, post_count, topic_count,
           first_post_created_at AS first_post_at
      FROM user_stats WHERE user_id > 0 ORDER BY user_id";

const CATEGORIES: &str = "
    WITH RECURSIVE tree(id, depth) AS (
        SELECT id, 0 FROM categories WHERE parent_category_id IS NULL
        UNION ALL
        SELECT c.id, t.depth + 1 FROM categories c JOIN tree t ON c.parent_category_id = t.id
    )
    SELECT c.id::bigint, c.name, c.description, c.parent_category_id::bigint AS parent_id,
           c.position, c.created_at, c.user_id::bigint
      FROM categories c
      JOIN tree t ON t.id = c.id
     ORDER BY t.depth, c.id";

const TOPICS: &str = "
    SELECT id::bigint, title, user_id::bigint, category_id::bigint, created_at, views,
           closed, pinned_at, visible
      FROM topics
     WHERE archetype = 'regular' AND deleted_at IS NULL
     ORDER BY id";

const POSTS: &str = "
    SELECT p.id::bigint, p.topic_id::bigint, p.user_id::bigint, p.raw, p.created_at,
           r.id::bigint AS reply_to_post_id, p.like_count, p.hidden, p.post_number::bigint
      FROM posts p
      JOIN topics t ON t.id = p.topic_id
      LEFT JOIN posts r ON r.topic_id = p.topic_id AND r.post_number = p.reply_to_post_number
     WHERE t.archetype = '{archetype}' AND p.deleted_at IS NULL
     ORDER BY p.topic_id, p.post_number";

const TAGS: &str = "SELECT id::bigint, name FROM tags ORDER BY id";

const TOPIC_TAGS: &str = "SELECT topic_id::bigint, tag_id::bigint FROM topic_tags";

const POST_ACTIONS: &str = "
    SELECT id::bigint, post_id::bigint, user_id::bigint, created_at
      FROM post_actions
     WHERE post_action_type_id = 2 AND deleted_at IS NULL
     ORDER BY id";

const UPLOADS: &str = "
    SELECT id::bigint, user_id::bigint, url AS path, original_filename AS filename, created_at
      FROM uploads WHERE id > 0 ORDER BY id";

const PRIVATE_TOPICS: &str = "
    SELECT id::bigint, title, user_id::bigint, created_at
      FROM topics
     WHERE archetype = 'private_message' AND deleted_at IS NULL
     ORDER BY id";

const TOPIC_ALLOWED_USERS: &str = "
    SELECT topic_id::bigint, user_id::bigint FROM topic_allowed_users WHERE user_id > 0";

const BADGES: &str = "
    SELECT id::bigint, name, description, badge_type_id AS badge_type FROM badges ORDER BY id";

const USER_BADGES: &str = "
    SELECT badge_id::bigint, user_id::bigint, granted_at FROM user_badges WHERE user_id > 0";

const NOTIFICATIONS: &str = "
    SELECT n.id::bigint, n.user_id::bigint, n.notification_type, n.topic_id::bigint,
           p.id::bigint AS post_id, n.data, n.read, n.created_at
      FROM notifications n
      LEFT JOIN posts p ON p.topic_id = n.topic_id AND p.post_number = n.post_number
     WHERE n.user_id > 0
     ORDER BY n.id";

pub struct MergeAdapter;

/// `[quote="user, post:N, topic:T"]` with `T` taken from the merged database.
fn renumber_quote(caps: &Captures<'_>, lookup: &dyn MarkupLookup) -> String {
    let user = lookup
        .username_for(&caps[1])
        .unwrap_or_else(|| caps[1].to_string());
    match caps[3].parse::<i64>().ok().and_then(|t| lookup.remapped_topic(t)) {
        Some(topic) => format!("[quote=\"{user}, post:{}, topic:{topic}\"", &caps[2]),
        None => format!("[quote=\"{user}\""),
    }
}

/// Strip the `/uploads/<site>/` prefix so the path is relative to the uploads root.
fn upload_path(url: &str) -> String {
    let trimmed = url.trim_start_matches('/');
    match trimmed.strip_prefix("uploads/") {
        Some(rest) => rest.split_once('/').map_or(rest, |(_, p)| p).to_string(),
        None => trimmed.to_string(),
    }
}

#[async_trait::async_trait]
impl SourceAdapter for MergeAdapter {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn query(&self, phase: Phase) -> Option<String> {
        Some(match phase {
            Phase::Groups => GROUPS.to_string(),
            Phase::Users => USERS.to_string(),
            Phase::GroupUsers => GROUP_USERS.to_string(),
            Phase::UserEmails => USER_EMAILS.to_string(),
            Phase::UserProfiles => USER_PROFILES.to_string(),
            Phase::UserStats => USER_STATS.to_string(),
            Phase::Categories => CATEGORIES.to_string(),
            Phase::Topics => TOPICS.to_string(),
            Phase::Posts => POSTS.replace("{archetype}", "regular"),
            Phase::Tags => TAGS.to_string(),
            Phase::TopicTags => TOPIC_TAGS.to_string(),
            Phase::PostActions => POST_ACTIONS.to_string(),
            Phase::Uploads => UPLOADS.to_string(),
            Phase::PrivateTopics => PRIVATE_TOPICS.to_string(),
            Phase::PrivatePosts => POSTS.replace("{archetype}", "private_message"),
            Phase::TopicAllowedUsers => TOPIC_ALLOWED_USERS.to_string(),
            Phase::Badges => BADGES.to_string(),
            Phase::UserBadges => USER_BADGES.to_string(),
            Phase::Notifications => NOTIFICATIONS.to_string(),
        })
    }

    fn dialect(&self) -> Result<Vec<Rule>> {
        Ok(vec![Rule::with(
            "merge-quote-topics",
            r#"\[quote="([^",\]]+),\s*post:(\d+),\s*topic:(\d+)(?:,\s*full:true)?""#,
            renumber_quote,
        )?])
    }

    fn convert_markup(&self) -> bool {
        false
    }

    fn decode_entities(&self) -> bool {
        false
    }

    fn merge(&self) -> bool {
        true
    }

    fn locate_upload(&self, row: &mut LegacyRow) {
        if let Some(url) = row.text_nonempty("path") {
            row.set("path", upload_path(&url));
        }
    }

    /// Refuses to run unless both databases are at the same schema migration.
    async fn preflight(&self, source: &SourceDb, db: &Db) -> Result<()> {
        let SourceDb::Postgres(pool) = source else {
            bail!("merge source must be a postgres database, got {}", source.kind());
        };
        let theirs = Db::schema_version(pool).await?;
        let ours = Db::schema_version(&db.pool).await?;
        if theirs != ours {
            bail!(
                "schema version mismatch: destination is at {}, merge source is at {}",
                ours.as_deref().unwrap_or("none"),
                theirs.as_deref().unwrap_or("none")
            );
        }
        info!(target: "preflight", version = ours.as_deref().unwrap_or("none"), "schema versions match");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::bbcode::MarkupTransformer;

    struct Remap;

    impl MarkupLookup for Remap {
        fn remapped_topic(&self, legacy_topic_id: i64) -> Option<i64> {
            (legacy_topic_id == 12).then_some(912)
        }
    }

    #[test]
    fn quote_topics_are_renumbered() {
        let t = MarkupTransformer::new(MergeAdapter.dialect().unwrap()).unwrap();
        assert_eq!(
            t.apply_dialect("[quote=\"ann, post:3, topic:12\"]\nhi\n[/quote]", &Remap),
            "[quote=\"ann, post:3, topic:912\"]\nhi\n[/quote]"
        );
        assert_eq!(
            t.apply_dialect("[quote=\"ann, post:3, topic:99, full:true\"]x[/quote]", &Remap),
            "[quote=\"ann\"]x[/quote]"
        );
    }

    #[test]
    fn upload_urls_become_relative_paths() {
        assert_eq!(
            upload_path("/uploads/default/original/1X/abc.png"),
            "original/1X/abc.png"
        );
        assert_eq!(upload_path("original/2X/d.gif"), "original/2X/d.gif");
    }

    #[test]
    fn private_posts_select_private_topics() {
        let sql = MergeAdapter.query(Phase::PrivatePosts).unwrap();
        assert!(sql.contains("t.archetype = 'private_message'"));
        assert!(!sql.contains('{'));
    }
}
