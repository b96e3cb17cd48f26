//! Vanilla 2.x. Discussion bodies become the first post of their topic, under
//! negated ids so they never meet comment ids in the registry.

use anyhow::Result;

use super::{prefixed, SourceAdapter};
use crate::database_ops::etl::Phase;
use crate::normalization::bbcode::Rule;

// Typed roles are the built-in ones.
const GROUPS: &str = "
    SELECT RoleID AS id, Name AS name, Description AS bio
      FROM {p}Role
     WHERE Type IS NULL OR Type = ''
     ORDER BY RoleID";

// Admin = 2 is the system account.
const USERS: &str = "
    SELECT u.UserID AS id, u.Name AS username, u.Email AS email,
           u.DateInserted AS created_at, u.DateLastActive AS last_seen_at,
           CASE WHEN u.Admin = 1 THEN 1 ELSE 0 END AS admin,
           EXISTS (SELECT 1 FROM {p}UserRole ur JOIN {p}Role r ON r.RoleID = ur.RoleID
                    WHERE ur.UserID = u.UserID AND r.Type = 'moderator') AS moderator,
           CASE WHEN u.Confirmed = 0 THEN 0 ELSE 1 END AS active,
           CASE WHEN u.Banned > 0 THEN 1 ELSE 0 END AS banned_permanently,
           u.LastIPAddress AS ip_address
      FROM {p}User u
     WHERE u.Deleted = 0 AND u.Admin <> 2
     ORDER BY u.UserID";

const GROUP_USERS: &str = "
    SELECT ur.RoleID AS group_id, ur.UserID AS user_id
      FROM {p}UserRole ur
      JOIN {p}Role r ON r.RoleID = ur.RoleID
     WHERE r.Type IS NULL OR r.Type = ''";

const USER_EMAILS: &str = "
    SELECT UserID AS id, Email AS email, DateInserted AS created_at
      FROM {p}User WHERE Deleted = 0 AND Admin <> 2 ORDER BY UserID";

const USER_PROFILES: &str = "
    SELECT UserID AS id, About AS bio
      FROM {p}User WHERE Deleted = 0 AND Admin <> 2 ORDER BY UserID";

const USER_STATS: &str = "
    SELECT UserID AS id, DateInserted AS created_at,
           CountComments + CountDiscussions AS post_count, CountDiscussions AS topic_count
      FROM {p}User WHERE Deleted = 0 AND Admin <> 2 ORDER BY UserID";

const CATEGORIES: &str = "
    SELECT CategoryID AS id, Name AS name, Description AS description,
           NULLIF(ParentCategoryID, -1) AS parent_id, Sort AS position,
           DateInserted AS created_at, InsertUserID AS user_id
      FROM {p}Category
     WHERE CategoryID > 0
     ORDER BY Depth, Sort, CategoryID";

const TOPICS: &str = "
    SELECT DiscussionID AS id, Name AS title, InsertUserID AS user_id,
           CategoryID AS category_id, DateInserted AS created_at, CountViews AS views,
           Closed AS closed,
           CASE WHEN Announce > 0 THEN DateInserted ELSE NULL END AS pinned_at
      FROM {p}Discussion
     ORDER BY DiscussionID";

const POSTS: &str = "
    SELECT -d.DiscussionID AS id, d.DiscussionID AS topic_id, d.InsertUserID AS user_id,
           d.Body AS raw, d.DateInserted AS created_at
      FROM {p}Discussion d
    UNION ALL
    SELECT c.CommentID AS id, c.DiscussionID AS topic_id, c.InsertUserID AS user_id,
           c.Body AS raw, c.DateInserted AS created_at
      FROM {p}Comment c
     ORDER BY created_at, id";

const TAGS: &str = "
    SELECT TagID AS id, Name AS name FROM {p}Tag
     WHERE Type IS NULL OR Type = '' ORDER BY TagID";

const TOPIC_TAGS: &str = "SELECT DiscussionID AS topic_id, TagID AS tag_id FROM {p}TagDiscussion";

const UPLOADS: &str = "
    SELECT MediaID AS id, InsertUserID AS user_id, Path AS path, Name AS filename,
           DateInserted AS created_at
      FROM {p}Media ORDER BY MediaID";

const PRIVATE_TOPICS: &str = "
    SELECT ConversationID AS id, Subject AS title, InsertUserID AS user_id,
           DateInserted AS created_at
      FROM {p}Conversation ORDER BY ConversationID";

const PRIVATE_POSTS: &str = "
    SELECT MessageID AS id, ConversationID AS topic_id, InsertUserID AS user_id,
           Body AS raw, DateInserted AS created_at
      FROM {p}ConversationMessage ORDER BY MessageID";

const TOPIC_ALLOWED_USERS: &str = "
    SELECT ConversationID AS topic_id, UserID AS user_id FROM {p}UserConversation";

const BADGES: &str = "
    SELECT BadgeID AS id, Name AS name, Body AS description
      FROM {p}Badge ORDER BY BadgeID";

const USER_BADGES: &str = "
    SELECT BadgeID AS badge_id, UserID AS user_id, DateCompleted AS granted_at
      FROM {p}UserBadge WHERE DateCompleted IS NOT NULL";

pub struct VanillaAdapter {
    prefix: String,
}

impl VanillaAdapter {
    pub fn new(prefix: String) -> Self {
        Self { prefix }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for VanillaAdapter {
    fn name(&self) -> &'static str {
        "vanilla"
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
            Phase::Badges => BADGES,
            Phase::UserBadges => USER_BADGES,
            Phase::PostActions | Phase::Notifications => return None,
        };
        Some(prefixed(sql, &self.prefix))
    }

    fn optional_table(&self, phase: Phase) -> Option<String> {
        let table = match phase {
            Phase::Tags => "Tag",
            Phase::TopicTags => "TagDiscussion",
            Phase::Uploads => "Media",
            Phase::PrivateTopics | Phase::PrivatePosts => "ConversationMessage",
            Phase::TopicAllowedUsers => "UserConversation",
            Phase::Badges => "Badge",
            Phase::UserBadges => "UserBadge",
            _ => return None,
        };
        Some(format!("{}{table}", self.prefix))
    }

    fn required_tables(&self) -> Vec<String> {
        ["User", "Category", "Discussion", "Comment"]
            .iter()
            .map(|t| format!("{}{t}", self.prefix))
            .collect()
    }

    /// Bodies are HTML; rewrite the common tags into bbcode and drop the rest.
    fn dialect(&self) -> Result<Vec<Rule>> {
        Ok(vec![
            Rule::replace("vanilla-mentions", r#"@"([^"]+)""#, "[mention]$1[/mention]")?,
            Rule::replace("html-comments", r"(?s)<!--.*?-->", "")?,
            Rule::replace(
                "html-pre",
                r"(?is)<pre[^>]*>\s*(?:<code[^>]*>)?(.*?)(?:</code>\s*)?</pre>",
                "[code]$1[/code]",
            )?,
            Rule::replace("html-code", r"(?is)<code[^>]*>(.*?)</code>", "[code]$1[/code]")?,
            Rule::replace("html-breaks", r"(?i)<br\s*/?>", "\n")?,
            Rule::replace("html-paragraph-end", r"(?i)</p>\s*", "\n\n")?,
            Rule::replace("html-paragraph", r"(?i)<p(?:\s[^>]*)?>", "")?,
            Rule::replace(
                "html-bold",
                r"(?is)<(?:b|strong)(?:\s[^>]*)?>(.*?)</(?:b|strong)>",
                "[b]$1[/b]",
            )?,
            Rule::replace(
                "html-italic",
                r"(?is)<(?:i|em)(?:\s[^>]*)?>(.*?)</(?:i|em)>",
                "[i]$1[/i]",
            )?,
            Rule::replace(
                "html-strike",
                r"(?is)<(?:s|strike|del)(?:\s[^>]*)?>(.*?)</(?:s|strike|del)>",
                "[s]$1[/s]",
            )?,
            Rule::replace(
                "html-links",
                r#"(?is)<a\s[^>]*?href="([^"]*)"[^>]*>(.*?)</a>"#,
                "[url=$1]$2[/url]",
            )?,
            Rule::replace(
                "html-images",
                r#"(?is)<img\s[^>]*?src="([^"]*)"[^>]*>"#,
                "[img]$1[/img]",
            )?,
            Rule::replace(
                "html-user-quotes",
                r#"(?is)<blockquote[^>]*\brel="([^"]+)"[^>]*>"#,
                "[quote=\"$1\"]",
            )?,
            Rule::replace("html-quotes", r"(?i)<blockquote[^>]*>", "[quote]")?,
            Rule::replace("html-quote-end", r"(?i)</blockquote>", "[/quote]")?,
            Rule::replace("html-headings", r"(?is)<h([1-6])[^>]*>(.*?)</h[1-6]>", "[h$1]$2[/h$1]")?,
            Rule::replace("html-unordered", r"(?i)<ul[^>]*>", "[list]")?,
            Rule::replace("html-ordered", r"(?i)<ol[^>]*>", "[list=1]")?,
            Rule::replace("html-list-end", r"(?i)</[uo]l>", "[/list]")?,
            Rule::replace("html-items", r"(?i)<li[^>]*>", "[*]")?,
            Rule::replace("html-strip", r"(?s)</?[a-zA-Z][^>]*>", "")?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::bbcode::{MarkupLookup, MarkupTransformer, NoLookup};

    fn transformer() -> MarkupTransformer {
        MarkupTransformer::new(VanillaAdapter::new("GDN_".into()).dialect().unwrap()).unwrap()
    }

    struct Renamed;

    impl MarkupLookup for Renamed {
        fn username_for(&self, legacy_name: &str) -> Option<String> {
            (legacy_name == "Bob Smith").then(|| "Bob_Smith".to_string())
        }
    }

    #[test]
    fn html_and_mentions() {
        let body = "<p>Hi <strong>there</strong> <a href=\"http://x\">click</a></p><p>@\"Some Name\" said</p>";
        assert_eq!(
            transformer().transform(body, &NoLookup),
            "Hi **there** [click](http://x)\n\n@Some_Name said"
        );
    }

    #[test]
    fn user_quotes_follow_renames() {
        let body = "<blockquote class=\"Quote\" rel=\"Bob Smith\">hey</blockquote>reply";
        assert_eq!(
            transformer().transform(body, &Renamed),
            "[quote=\"Bob_Smith\"]hey[/quote]reply"
        );
    }

    #[test]
    fn lists_and_preformatted_code() {
        let body = "<ul><li>one</li><li>two</li></ul><pre>a < b\nc</pre>";
        assert_eq!(
            transformer().transform(body, &NoLookup),
            "* one\n* two\n\n```\na < b\nc\n```"
        );
    }

    #[test]
    fn discussion_bodies_use_negated_ids() {
        let sql = VanillaAdapter::new("GDN_".into()).query(Phase::Posts).unwrap();
        assert!(sql.contains("-d.DiscussionID AS id"));
        assert!(sql.contains("FROM GDN_Comment c"));
    }
}
