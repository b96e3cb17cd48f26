//! vBulletin 5: every channel, topic, reply, comment and private message is a
//! row in `node`, told apart by content type. A topic and its first post share
//! the starter's node id.

use anyhow::Result;

use super::vbulletin::vbulletin_rules;
use super::{digit_path, prefixed, SourceAdapter};
use crate::database_ops::etl::Phase;
use crate::database_ops::source::LegacyRow;
use crate::normalization::bbcode::Rule;

const CHANNEL: &str = "(SELECT contenttypeid FROM {p}contenttype WHERE class = 'Channel')";
const TEXT: &str = "(SELECT contenttypeid FROM {p}contenttype WHERE class = 'Text')";
const PRIVATE_MESSAGE: &str =
    "(SELECT contenttypeid FROM {p}contenttype WHERE class = 'PrivateMessage')";

const GROUPS: &str = "
    SELECT usergroupid AS id, title AS name, description AS bio
      FROM {p}usergroup
     WHERE systemgroupid = 0
     ORDER BY usergroupid";

const USERS: &str = "
    SELECT u.userid AS id, u.username, u.email,
           u.joindate AS created_at, u.lastactivity AS last_seen_at,
           u.ipaddress AS ip_address,
           CASE WHEN u.usergroupid = 6 THEN 1 ELSE 0 END AS admin,
           CASE WHEN u.usergroupid IN (5, 7) THEN 1 ELSE 0 END AS moderator,
           CASE WHEN u.usergroupid = 3 THEN 0 ELSE 1 END AS active,
           b.bandate AS suspended_at, b.liftdate AS suspended_till,
           CASE WHEN b.userid IS NOT NULL AND b.liftdate = 0 THEN 1 ELSE 0 END AS banned_permanently
      FROM {p}user u
      LEFT JOIN {p}userban b ON b.userid = u.userid
     ORDER BY u.userid";

const GROUP_USERS: &str = "
    SELECT g.usergroupid AS group_id, u.userid AS user_id
      FROM {p}user u
      JOIN {p}usergroup g
        ON g.systemgroupid = 0
       AND (u.usergroupid = g.usergroupid OR FIND_IN_SET(g.usergroupid, u.membergroupids))";

const USER_EMAILS: &str = "
    SELECT userid AS id, email, joindate AS created_at FROM {p}user ORDER BY userid";

const USER_PROFILES: &str = "
    SELECT u.userid AS id, u.homepage AS website, f.field2 AS location,
           f.field1 AS bio, u.profilevisits AS views
      FROM {p}user u
      LEFT JOIN {p}userfield f ON f.userid = u.userid
     ORDER BY u.userid";

const USER_STATS: &str = "
    SELECT userid AS id, joindate AS created_at, posts AS post_count
      FROM {p}user ORDER BY userid";

// The root channel and its direct children (Forum, Blogs, Groups) are
// structural; the inner joins on parent and grandparent leave them out, and
// channels directly under a structural one become top-level categories.
const CATEGORIES: &str = "
    SELECT n.nodeid AS id, n.title AS name, n.description,
           CASE WHEN gp.parentid = 0 THEN NULL ELSE n.parentid END AS parent_id,
           n.displayorder AS position, n.publishdate AS created_at, n.userid AS user_id
      FROM {p}node n
      JOIN {p}node p ON p.nodeid = n.parentid
      JOIN {p}node gp ON gp.nodeid = p.parentid
     WHERE n.contenttypeid = {channel}
     ORDER BY (SELECT MAX(cl.depth) FROM {p}closure cl WHERE cl.child = n.nodeid),
              n.displayorder, n.nodeid";

const TOPICS: &str = "
    SELECT n.nodeid AS id, n.title, n.userid AS user_id, n.parentid AS category_id,
           n.publishdate AS created_at, COALESCE(nv.count, 0) AS views,
           CASE WHEN n.open = 0 THEN 1 ELSE 0 END AS closed,
           CASE WHEN n.sticky = 1 THEN n.publishdate ELSE NULL END AS pinned_at,
           CASE WHEN n.approved = 1 AND n.showpublished = 1 THEN 1 ELSE 0 END AS visible
      FROM {p}node n
      JOIN {p}node p ON p.nodeid = n.parentid
      LEFT JOIN {p}nodeview nv ON nv.nodeid = n.nodeid
     WHERE n.contenttypeid = {text} AND p.contenttypeid = {channel}
     ORDER BY n.nodeid";

// Comments hang off replies; their parent becomes the reply target.
const POSTS: &str = "
    SELECT n.nodeid AS id, n.starter AS topic_id, n.userid AS user_id, t.rawtext AS raw,
           n.publishdate AS created_at,
           CASE WHEN n.parentid <> n.starter THEN n.parentid ELSE NULL END AS reply_to_post_id,
           CASE WHEN n.approved = 1 THEN 0 ELSE 1 END AS hidden
      FROM {p}node n
      JOIN {p}text t ON t.nodeid = n.nodeid
      JOIN {p}node s ON s.nodeid = n.starter
      JOIN {p}node sp ON sp.nodeid = s.parentid
     WHERE n.contenttypeid = {text} AND sp.contenttypeid = {channel}
     ORDER BY n.nodeid";

const TAGS: &str = "SELECT tagid AS id, tagtext AS name FROM {p}tag ORDER BY tagid";

const TOPIC_TAGS: &str = "SELECT nodeid AS topic_id, tagid AS tag_id FROM {p}tagnode";

const POST_ACTIONS: &str = "
    SELECT reputationid AS id, nodeid AS post_id, whoadded AS user_id, dateline AS created_at
      FROM {p}reputation
     WHERE reputation > 0
     ORDER BY reputationid";

const UPLOADS: &str = "
    SELECT a.nodeid AS id, n.userid AS user_id, a.filename, a.filedataid AS filedata_id,
           n.publishdate AS created_at
      FROM {p}attach a
      JOIN {p}node n ON n.nodeid = a.nodeid
     ORDER BY a.nodeid";

const PRIVATE_TOPICS: &str = "
    SELECT n.nodeid AS id, n.title, n.userid AS user_id, n.publishdate AS created_at
      FROM {p}node n
     WHERE n.contenttypeid = {pm} AND n.nodeid = n.starter
     ORDER BY n.nodeid";

const PRIVATE_POSTS: &str = "
    SELECT n.nodeid AS id, n.starter AS topic_id, n.userid AS user_id, t.rawtext AS raw,
           n.publishdate AS created_at
      FROM {p}node n
      JOIN {p}text t ON t.nodeid = n.nodeid
     WHERE n.contenttypeid = {pm}
     ORDER BY n.nodeid";

const TOPIC_ALLOWED_USERS: &str = "
    SELECT DISTINCT n.starter AS topic_id, s.userid AS user_id
      FROM {p}sentto s
      JOIN {p}node n ON n.nodeid = s.nodeid
     WHERE n.contenttypeid = {pm}";

pub struct Vbulletin5Adapter {
    prefix: String,
}

impl Vbulletin5Adapter {
    pub fn new(prefix: String) -> Self {
        Self { prefix }
    }

    fn expand(&self, sql: &str) -> String {
        let sql = sql
            .replace("{channel}", CHANNEL)
            .replace("{text}", TEXT)
            .replace("{pm}", PRIVATE_MESSAGE);
        prefixed(&sql, &self.prefix)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for Vbulletin5Adapter {
    fn name(&self) -> &'static str {
        "vbulletin5"
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
            Phase::PrivateTopics => PRIVATE_TOPICS,
            Phase::PrivatePosts => PRIVATE_POSTS,
            Phase::TopicAllowedUsers => TOPIC_ALLOWED_USERS,
            Phase::Badges | Phase::UserBadges | Phase::Notifications => return None,
        };
        Some(self.expand(sql))
    }

    fn optional_table(&self, phase: Phase) -> Option<String> {
        let table = match phase {
            Phase::PostActions => "reputation",
            Phase::Uploads => "attach",
            _ => return None,
        };
        Some(format!("{}{table}", self.prefix))
    }

    fn required_tables(&self) -> Vec<String> {
        ["user", "node", "text", "contenttype", "closure"]
            .iter()
            .map(|t| format!("{}{t}", self.prefix))
            .collect()
    }

    fn dialect(&self) -> Result<Vec<Rule>> {
        let mut rules = vec![
            Rule::replace(
                "vb5-quote-node",
                r"(?i)\[quote=([^;\]]+);n(\d+)\]",
                "[quote=$1;$2]",
            )?,
            Rule::replace(
                "vb5-json-attachments",
                r"(?is)\[attach=json\].*?\[/attach\]",
                "",
            )?,
        ];
        rules.extend(vbulletin_rules()?);
        Ok(rules)
    }

    fn locate_upload(&self, row: &mut LegacyRow) {
        if let (Some(owner), Some(file)) = (row.int("user_id"), row.int("filedata_id")) {
            row.set("path", digit_path(owner, file));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::bbcode::{MarkupLookup, MarkupTransformer};

    struct Nodes;

    impl MarkupLookup for Nodes {
        fn quoted_post(&self, legacy_post_id: i64) -> Option<(i64, i64)> {
            (legacy_post_id == 8812).then_some((40, 7))
        }
    }

    #[test]
    fn node_quotes_and_json_attachments() {
        let t = MarkupTransformer::new(Vbulletin5Adapter::new(String::new()).dialect().unwrap())
            .unwrap();
        assert_eq!(
            t.transform(
                "[QUOTE=Ann;n8812]hello[/QUOTE] [ATTACH=JSON]{\"data-align\":\"none\"}[/ATTACH]",
                &Nodes
            ),
            "[quote=\"Ann, post:7, topic:40\"]hello[/QUOTE]"
        );
    }

    #[test]
    fn content_types_are_inlined() {
        let sql = Vbulletin5Adapter::new("vb_".into())
            .query(Phase::PrivatePosts)
            .unwrap();
        assert!(sql.contains("FROM vb_contenttype WHERE class = 'PrivateMessage'"));
        assert!(!sql.contains('{'));
    }
}
