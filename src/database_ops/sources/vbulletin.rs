use anyhow::Result;

use super::{digit_path, prefixed, SourceAdapter};
use crate::database_ops::etl::Phase;
use crate::database_ops::source::LegacyRow;
use crate::normalization::bbcode::Rule;

// Usergroups 1-8 are the built-in ones (guests, registered, admins, ...).
const GROUPS: &str = "
    SELECT usergroupid AS id, title AS name, description AS bio
      FROM {p}usergroup
     WHERE usergroupid > 8
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

// Primary group plus the comma-separated secondary groups.
const GROUP_USERS: &str = "
    SELECT g.usergroupid AS group_id, u.userid AS user_id
      FROM {p}user u
      JOIN {p}usergroup g
        ON g.usergroupid > 8
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

// parentlist is "self,parent,...,-1"; its comma count is the depth.
const CATEGORIES: &str = "
    SELECT forumid AS id, title AS name, description,
           NULLIF(parentid, -1) AS parent_id, displayorder AS position
      FROM {p}forum
     ORDER BY LENGTH(parentlist) - LENGTH(REPLACE(parentlist, ',', '')), displayorder, forumid";

// open = 10 marks redirect stubs left behind by moved threads.
const TOPICS: &str = "
    SELECT threadid AS id, title, postuserid AS user_id, forumid AS category_id,
           dateline AS created_at, views,
           CASE WHEN open = 0 THEN 1 ELSE 0 END AS closed,
           CASE WHEN sticky = 1 THEN dateline ELSE NULL END AS pinned_at,
           CASE WHEN visible = 1 THEN 1 ELSE 0 END AS visible
      FROM {p}thread
     WHERE open <> 10
     ORDER BY threadid";

const POSTS: &str = "
    SELECT postid AS id, threadid AS topic_id, userid AS user_id, pagetext AS raw,
           dateline AS created_at, NULLIF(parentid, 0) AS reply_to_post_id,
           CASE WHEN visible = 1 THEN 0 ELSE 1 END AS hidden
      FROM {p}post
     ORDER BY postid";

const TAGS: &str = "SELECT tagid AS id, tagtext AS name FROM {p}tag ORDER BY tagid";

const TOPIC_TAGS: &str = "SELECT threadid AS topic_id, tagid AS tag_id FROM {p}tagthread";

const UPLOADS: &str = "
    SELECT attachmentid AS id, userid AS user_id, filename, dateline AS created_at
      FROM {p}attachment
     ORDER BY attachmentid";

// vBulletin 3 has no conversations: every message is its own private topic.
const PRIVATE_TOPICS: &str = "
    SELECT pmtextid AS id, title, fromuserid AS user_id, dateline AS created_at
      FROM {p}pmtext ORDER BY pmtextid";

const PRIVATE_POSTS: &str = "
    SELECT pmtextid AS id, pmtextid AS topic_id, fromuserid AS user_id,
           message AS raw, dateline AS created_at
      FROM {p}pmtext ORDER BY pmtextid";

const TOPIC_ALLOWED_USERS: &str = "
    SELECT pmtextid AS topic_id, userid AS user_id FROM {p}pm
    UNION
    SELECT pmtextid AS topic_id, fromuserid AS user_id FROM {p}pmtext";

pub struct VbulletinAdapter {
    prefix: String,
}

impl VbulletinAdapter {
    pub fn new(prefix: String) -> Self {
        Self { prefix }
    }
}

/// Dialect shared by vBulletin 3, 4 and 5.
pub(crate) fn vbulletin_rules() -> Result<Vec<Rule>> {
    Ok(vec![
        Rule::replace("vb-code-blocks", r"(?i)\[(/?)(?:php|html|sql)\]", "[${1}code]")?,
        Rule::replace(
            "vb-video",
            r"(?is)\[video=youtube(?:_share)?;([^\]]+)\].*?\[/video\]",
            "\nhttps://www.youtube.com/watch?v=$1\n",
        )?,
        Rule::replace("vb-noparse", r"(?i)\[/?noparse\]", "")?,
        Rule::replace(
            "vb-inline-attachments",
            r"(?is)\[attach(?:=[^\]]*)?\].*?\[/attach\]",
            "",
        )?,
    ])
}

#[async_trait::async_trait]
impl SourceAdapter for VbulletinAdapter {
    fn name(&self) -> &'static str {
        "vbulletin"
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
            Phase::Uploads => UPLOADS,
            Phase::PrivateTopics => PRIVATE_TOPICS,
            Phase::PrivatePosts => PRIVATE_POSTS,
            Phase::TopicAllowedUsers => TOPIC_ALLOWED_USERS,
            Phase::PostActions | Phase::Badges | Phase::UserBadges | Phase::Notifications => {
                return None
            }
        };
        Some(prefixed(sql, &self.prefix))
    }

    fn optional_table(&self, phase: Phase) -> Option<String> {
        let table = match phase {
            Phase::Tags => "tag",
            Phase::TopicTags => "tagthread",
            Phase::Uploads => "attachment",
            _ => return None,
        };
        Some(format!("{}{table}", self.prefix))
    }

    fn required_tables(&self) -> Vec<String> {
        ["user", "forum", "thread", "post"]
            .iter()
            .map(|t| format!("{}{t}", self.prefix))
            .collect()
    }

    fn dialect(&self) -> Result<Vec<Rule>> {
        vbulletin_rules()
    }

    fn locate_upload(&self, row: &mut LegacyRow) {
        if let (Some(owner), Some(id)) = (row.int("user_id"), row.int("id")) {
            row.set("path", digit_path(owner, id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::bbcode::{MarkupTransformer, NoLookup};

    fn transformer() -> MarkupTransformer {
        MarkupTransformer::new(VbulletinAdapter::new(String::new()).dialect().unwrap()).unwrap()
    }

    #[test]
    fn php_blocks_become_code() {
        assert_eq!(
            transformer().transform("[php]echo $a < 1;[/php]", &NoLookup),
            "`echo $a < 1;`"
        );
    }

    #[test]
    fn youtube_video_tags() {
        assert_eq!(
            transformer().transform(
                "look [video=youtube;dQw4w9WgXcQ]http://www.youtube.com/watch?v=dQw4w9WgXcQ[/video]",
                &NoLookup
            ),
            "look\nhttps://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }

    #[test]
    fn attachments_resolve_to_digit_paths() {
        let adapter = VbulletinAdapter::new(String::new());
        let mut row = LegacyRow::new().with("id", 33i64).with("user_id", 105i64);
        adapter.locate_upload(&mut row);
        assert_eq!(row.text("path").as_deref(), Some("1/0/5/33.attach"));
    }
}
