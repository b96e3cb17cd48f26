//! phpBB 3.x. Bodies are either 3.0 bbcode with per-post uids or the 3.2+
//! s9e XML representation; both unwrap to plain bbcode here.

use anyhow::Result;

use super::{prefixed, SourceAdapter};
use crate::database_ops::etl::Phase;
use crate::normalization::bbcode::Rule;

// group_type 3 are the built-in special groups; user_type 2 are bots.
const GROUPS: &str = "
    SELECT group_id AS id, group_name AS name, group_desc AS bio,
           CASE WHEN group_type = 2 THEN 2 ELSE 0 END AS visibility
      FROM {p}groups
     WHERE group_type <> 3
     ORDER BY group_id";

const USERS: &str = "
    SELECT u.user_id AS id, u.username, u.user_email AS email,
           u.user_regdate AS created_at, u.user_lastvisit AS last_seen_at,
           CASE WHEN u.user_type = 3 THEN 1 ELSE 0 END AS admin,
           CASE WHEN u.user_type = 1 THEN 0 ELSE 1 END AS active,
           u.user_ip AS ip_address,
           b.ban_start AS suspended_at, b.ban_end AS suspended_till,
           CASE WHEN b.ban_userid IS NOT NULL AND b.ban_end = 0 THEN 1 ELSE 0 END AS banned_permanently
      FROM {p}users u
      LEFT JOIN {p}banlist b ON b.ban_userid = u.user_id AND b.ban_exclude = 0
     WHERE u.user_type <> 2
     ORDER BY u.user_id";

const GROUP_USERS: &str = "
    SELECT ug.group_id, ug.user_id, ug.group_leader AS owner
      FROM {p}user_group ug
      JOIN {p}groups g ON g.group_id = ug.group_id
     WHERE g.group_type <> 3 AND ug.user_pending = 0";

const USER_EMAILS: &str = "
    SELECT user_id AS id, user_email AS email, user_regdate AS created_at
      FROM {p}users WHERE user_type <> 2 ORDER BY user_id";

const USER_PROFILES: &str = "
    SELECT u.user_id AS id, pf.pf_phpbb_location AS location,
           pf.pf_phpbb_website AS website, u.user_sig AS bio
      FROM {p}users u
      LEFT JOIN {p}profile_fields_data pf ON pf.user_id = u.user_id
     WHERE u.user_type <> 2
     ORDER BY u.user_id";

const USER_STATS: &str = "
    SELECT user_id AS id, user_regdate AS created_at, user_posts AS post_count
      FROM {p}users WHERE user_type <> 2 ORDER BY user_id";

// Nested-set order puts every parent before its children.
const CATEGORIES: &str = "
    SELECT forum_id AS id, forum_name AS name, forum_desc AS description,
           NULLIF(parent_id, 0) AS parent_id, left_id AS position
      FROM {p}forums
     ORDER BY left_id";

// topic_status 2 marks shadow copies of moved topics.
const TOPICS: &str = "
    SELECT topic_id AS id, topic_title AS title, topic_poster AS user_id,
           forum_id AS category_id, topic_time AS created_at, topic_views AS views,
           CASE WHEN topic_status = 1 THEN 1 ELSE 0 END AS closed,
           CASE WHEN topic_type > 0 THEN topic_time ELSE NULL END AS pinned_at,
           CASE WHEN topic_visibility = 1 THEN 1 ELSE 0 END AS visible
      FROM {p}topics
     WHERE topic_status <> 2
     ORDER BY topic_id";

const POSTS: &str = "
    SELECT post_id AS id, topic_id, poster_id AS user_id, post_text AS raw,
           post_time AS created_at,
           CASE WHEN post_visibility = 1 THEN 0 ELSE 1 END AS hidden
      FROM {p}posts
     ORDER BY post_id";

const UPLOADS: &str = "
    SELECT attach_id AS id, poster_id AS user_id, physical_filename AS path,
           real_filename AS filename, filetime AS created_at
      FROM {p}attachments
     WHERE is_orphan = 0
     ORDER BY attach_id";

// Private messages have no threads; replies point at their root message.
const PRIVATE_TOPICS: &str = "
    SELECT msg_id AS id, message_subject AS title, author_id AS user_id,
           message_time AS created_at
      FROM {p}privmsgs
     WHERE root_level = 0
     ORDER BY msg_id";

const PRIVATE_POSTS: &str = "
    SELECT msg_id AS id,
           CASE WHEN root_level = 0 THEN msg_id ELSE root_level END AS topic_id,
           author_id AS user_id, message_text AS raw, message_time AS created_at
      FROM {p}privmsgs
     ORDER BY msg_id";

const TOPIC_ALLOWED_USERS: &str = "
    SELECT DISTINCT CASE WHEN m.root_level = 0 THEN m.msg_id ELSE m.root_level END AS topic_id,
           t.user_id
      FROM {p}privmsgs_to t
      JOIN {p}privmsgs m ON m.msg_id = t.msg_id";

pub struct PhpbbAdapter {
    prefix: String,
}

impl PhpbbAdapter {
    pub fn new(prefix: String) -> Self {
        Self { prefix }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for PhpbbAdapter {
    fn name(&self) -> &'static str {
        "phpbb"
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
            Phase::Uploads => UPLOADS,
            Phase::PrivateTopics => PRIVATE_TOPICS,
            Phase::PrivatePosts => PRIVATE_POSTS,
            Phase::TopicAllowedUsers => TOPIC_ALLOWED_USERS,
            Phase::Tags
            | Phase::TopicTags
            | Phase::PostActions
            | Phase::Badges
            | Phase::UserBadges
            | Phase::Notifications => return None,
        };
        Some(prefixed(sql, &self.prefix))
    }

    fn optional_table(&self, phase: Phase) -> Option<String> {
        match phase {
            Phase::UserProfiles => Some(format!("{}profile_fields_data", self.prefix)),
            _ => None,
        }
    }

    fn required_tables(&self) -> Vec<String> {
        ["users", "forums", "topics", "posts"]
            .iter()
            .map(|t| format!("{}{t}", self.prefix))
            .collect()
    }

    fn dialect(&self) -> Result<Vec<Rule>> {
        Ok(vec![
            Rule::replace(
                "phpbb-smilies",
                r"<!-- s(\S+?) --><img[^>]*><!-- s\S+? -->",
                "$1",
            )?,
            Rule::replace(
                "phpbb-magic-urls",
                r#"(?s)<!-- [mlwe] --><a [^>]*?href="([^"]*)"[^>]*>.*?</a><!-- [mlwe] -->"#,
                "$1",
            )?,
            Rule::replace("s9e-markers", r"</?[se]>", "")?,
            Rule::replace("s9e-breaks", r"<br\s*/?>", "\n")?,
            Rule::replace("s9e-root", r"</?[rti]>", "")?,
            Rule::replace("s9e-elements", r"</?[A-Z][A-Z0-9_]*(?:\s[^>]*)?>", "")?,
            Rule::replace(
                "phpbb-uid",
                r"\[(/?[^\[\]]+?)(?::[uom])?:[a-z0-9]{5,8}\]",
                "[$1]",
            )?,
            Rule::replace(
                "phpbb-quote-post",
                r#"(?i)\[quote="([^"]+)"[^\]]*?\bpost_id=(\d+)[^\]]*\]"#,
                "[quote=$1;$2]",
            )?,
            Rule::replace(
                "phpbb-quote-attrs",
                r#"(?i)\[quote="([^"]+)"\s+[^\]]*\]"#,
                "[quote=\"$1\"]",
            )?,
            Rule::replace(
                "phpbb-inline-attachments",
                r"(?is)\[attachment=\d+\].*?\[/attachment\]",
                "",
            )?,
        ])
    }
}
