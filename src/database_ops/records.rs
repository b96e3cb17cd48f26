//! Destination rows, one struct per bulk-loaded table, each encoding itself in
//! the column order of its `COLUMNS` list.

use chrono::{DateTime, Utc};

use super::copy::{CopyLine, CopyRecord};

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub full_name: Option<String>,
    pub bio_raw: Option<String>,
    pub bio_cooked: Option<String>,
    pub visibility_level: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CopyRecord for GroupRow {
    const TABLE: &'static str = "groups";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "full_name",
        "bio_raw",
        "bio_cooked",
        "visibility_level",
        "created_at",
        "updated_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.name)
            .push(&self.full_name)
            .push(&self.bio_raw)
            .push(&self.bio_cooked)
            .push(&self.visibility_level)
            .push(&self.created_at)
            .push(&self.updated_at);
    }
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub username_lower: String,
    pub name: Option<String>,
    pub active: bool,
    pub approved: bool,
    pub admin: bool,
    pub moderator: bool,
    pub trust_level: i32,
    pub ip_address: Option<String>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspended_till: Option<DateTime<Utc>>,
    pub views: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CopyRecord for UserRow {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "username",
        "username_lower",
        "name",
        "active",
        "approved",
        "admin",
        "moderator",
        "trust_level",
        "ip_address",
        "registration_ip_address",
        "first_seen_at",
        "last_seen_at",
        "suspended_at",
        "suspended_till",
        "views",
        "created_at",
        "updated_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.username)
            .push(&self.username_lower)
            .push(&self.name)
            .push(&self.active)
            .push(&self.approved)
            .push(&self.admin)
            .push(&self.moderator)
            .push(&self.trust_level)
            .push(&self.ip_address)
            .push(&self.ip_address)
            .push(&self.first_seen_at)
            .push(&self.last_seen_at)
            .push(&self.suspended_at)
            .push(&self.suspended_till)
            .push(&self.views)
            .push(&self.created_at)
            .push(&self.updated_at);
    }
}

#[derive(Debug, Clone)]
pub struct UserEmailRow {
    pub id: i64,
    pub user_id: i64,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for UserEmailRow {
    const TABLE: &'static str = "user_emails";
    const COLUMNS: &'static [&'static str] =
        &["id", "user_id", "email", "primary", "created_at", "updated_at"];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.user_id)
            .push(&self.email)
            .push(&true)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

#[derive(Debug, Clone)]
pub struct UserProfileRow {
    pub user_id: i64,
    pub location: Option<String>,
    pub website: Option<String>,
    pub bio_raw: Option<String>,
    pub bio_cooked: Option<String>,
    pub views: i32,
}

impl CopyRecord for UserProfileRow {
    const TABLE: &'static str = "user_profiles";
    const COLUMNS: &'static [&'static str] =
        &["user_id", "location", "website", "bio_raw", "bio_cooked", "views"];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.user_id)
            .push(&self.location)
            .push(&self.website)
            .push(&self.bio_raw)
            .push(&self.bio_cooked)
            .push(&self.views);
    }
}

#[derive(Debug, Clone)]
pub struct UserStatRow {
    pub user_id: i64,
    pub new_since: DateTime<Utc>,
    pub post_count: i32,
    pub topic_count: i32,
    pub first_post_created_at: Option<DateTime<Utc>>,
}

impl CopyRecord for UserStatRow {
    const TABLE: &'static str = "user_stats";
    const COLUMNS: &'static [&'static str] = &[
        "user_id",
        "new_since",
        "post_count",
        "topic_count",
        "first_post_created_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.user_id)
            .push(&self.new_since)
            .push(&self.post_count)
            .push(&self.topic_count)
            .push(&self.first_post_created_at);
    }
}

#[derive(Debug, Clone)]
pub struct GroupUserRow {
    pub id: i64,
    pub group_id: i64,
    pub user_id: i64,
    pub owner: bool,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for GroupUserRow {
    const TABLE: &'static str = "group_users";
    const COLUMNS: &'static [&'static str] =
        &["id", "group_id", "user_id", "owner", "created_at", "updated_at"];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.group_id)
            .push(&self.user_id)
            .push(&self.owner)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

#[derive(Debug, Clone)]
pub struct CategoryRow {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub user_id: i64,
    pub parent_category_id: Option<i64>,
    pub position: i32,
    pub color: String,
    pub text_color: String,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for CategoryRow {
    const TABLE: &'static str = "categories";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "name_lower",
        "slug",
        "description",
        "user_id",
        "parent_category_id",
        "position",
        "color",
        "text_color",
        "created_at",
        "updated_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.name)
            .push(&self.name.to_lowercase())
            .push(&self.slug)
            .push(&self.description)
            .push(&self.user_id)
            .push(&self.parent_category_id)
            .push(&self.position)
            .push(&self.color)
            .push(&self.text_color)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

pub const ARCHETYPE_REGULAR: &str = "regular";
pub const ARCHETYPE_PRIVATE: &str = "private_message";

#[derive(Debug, Clone)]
pub struct TopicRow {
    pub id: i64,
    pub archetype: &'static str,
    pub title: String,
    pub fancy_title: String,
    pub slug: String,
    pub user_id: i64,
    pub category_id: Option<i64>,
    pub visible: bool,
    pub closed: bool,
    pub pinned_at: Option<DateTime<Utc>>,
    pub views: i32,
    pub subtype: Option<&'static str>,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for TopicRow {
    const TABLE: &'static str = "topics";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "archetype",
        "title",
        "fancy_title",
        "slug",
        "user_id",
        "last_post_user_id",
        "category_id",
        "visible",
        "closed",
        "pinned_at",
        "views",
        "subtype",
        "created_at",
        "bumped_at",
        "updated_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(self.archetype)
            .push(&self.title)
            .push(&self.fancy_title)
            .push(&self.slug)
            .push(&self.user_id)
            .push(&self.user_id)
            .push(&self.category_id)
            .push(&self.visible)
            .push(&self.closed)
            .push(&self.pinned_at)
            .push(&self.views)
            .push(&self.subtype)
            .push(&self.created_at)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

#[derive(Debug, Clone)]
pub struct PostRow {
    pub id: i64,
    pub user_id: i64,
    pub topic_id: i64,
    pub post_number: i64,
    pub reply_to_post_number: Option<i64>,
    pub raw: String,
    pub cooked: String,
    pub like_count: i32,
    pub hidden: bool,
    pub word_count: i32,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for PostRow {
    const TABLE: &'static str = "posts";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "user_id",
        "last_editor_id",
        "topic_id",
        "post_number",
        "sort_order",
        "reply_to_post_number",
        "raw",
        "cooked",
        "like_count",
        "hidden",
        "word_count",
        "created_at",
        "last_version_at",
        "updated_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.user_id)
            .push(&self.user_id)
            .push(&self.topic_id)
            .push(&self.post_number)
            .push(&self.post_number)
            .push(&self.reply_to_post_number)
            .push(&self.raw)
            .push(&self.cooked)
            .push(&self.like_count)
            .push(&self.hidden)
            .push(&self.word_count)
            .push(&self.created_at)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

#[derive(Debug, Clone)]
pub struct TagRow {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for TagRow {
    const TABLE: &'static str = "tags";
    const COLUMNS: &'static [&'static str] = &["id", "name", "created_at", "updated_at"];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.name)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

#[derive(Debug, Clone)]
pub struct TopicTagRow {
    pub id: i64,
    pub topic_id: i64,
    pub tag_id: i64,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for TopicTagRow {
    const TABLE: &'static str = "topic_tags";
    const COLUMNS: &'static [&'static str] =
        &["id", "topic_id", "tag_id", "created_at", "updated_at"];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.topic_id)
            .push(&self.tag_id)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

pub const POST_ACTION_LIKE: i32 = 2;

#[derive(Debug, Clone)]
pub struct PostActionRow {
    pub id: i64,
    pub post_id: i64,
    pub user_id: i64,
    pub post_action_type_id: i32,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for PostActionRow {
    const TABLE: &'static str = "post_actions";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "post_id",
        "user_id",
        "post_action_type_id",
        "created_at",
        "updated_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.post_id)
            .push(&self.user_id)
            .push(&self.post_action_type_id)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

#[derive(Debug, Clone)]
pub struct UploadRow {
    pub id: i64,
    pub user_id: i64,
    pub original_filename: String,
    pub filesize: i64,
    pub url: String,
    pub sha1: String,
    pub extension: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for UploadRow {
    const TABLE: &'static str = "uploads";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "user_id",
        "original_filename",
        "filesize",
        "url",
        "sha1",
        "extension",
        "created_at",
        "updated_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.user_id)
            .push(&self.original_filename)
            .push(&self.filesize)
            .push(&self.url)
            .push(&self.sha1)
            .push(&self.extension)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

#[derive(Debug, Clone)]
pub struct TopicAllowedUserRow {
    pub id: i64,
    pub topic_id: i64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for TopicAllowedUserRow {
    const TABLE: &'static str = "topic_allowed_users";
    const COLUMNS: &'static [&'static str] =
        &["id", "topic_id", "user_id", "created_at", "updated_at"];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.topic_id)
            .push(&self.user_id)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

#[derive(Debug, Clone)]
pub struct BadgeRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub badge_type_id: i32,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for BadgeRow {
    const TABLE: &'static str = "badges";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "description",
        "badge_type_id",
        "created_at",
        "updated_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.name)
            .push(&self.description)
            .push(&self.badge_type_id)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

#[derive(Debug, Clone)]
pub struct UserBadgeRow {
    pub id: i64,
    pub badge_id: i64,
    pub user_id: i64,
    pub granted_at: DateTime<Utc>,
    pub granted_by_id: i64,
}

impl CopyRecord for UserBadgeRow {
    const TABLE: &'static str = "user_badges";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "badge_id",
        "user_id",
        "granted_at",
        "granted_by_id",
        "created_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.badge_id)
            .push(&self.user_id)
            .push(&self.granted_at)
            .push(&self.granted_by_id)
            .push(&self.granted_at);
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: i64,
    pub notification_type: i32,
    pub user_id: i64,
    pub data: String,
    pub read: bool,
    pub topic_id: Option<i64>,
    pub post_number: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord for NotificationRow {
    const TABLE: &'static str = "notifications";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "notification_type",
        "user_id",
        "data",
        "read",
        "topic_id",
        "post_number",
        "created_at",
        "updated_at",
    ];
    fn encode(&self, line: &mut CopyLine) {
        line.push(&self.id)
            .push(&self.notification_type)
            .push(&self.user_id)
            .push(&self.data)
            .push(&self.read)
            .push(&self.topic_id)
            .push(&self.post_number)
            .push(&self.created_at)
            .push(&self.created_at);
    }
}

/// Any row a phase can emit.
#[derive(Debug, Clone)]
pub enum TargetRow {
    Group(GroupRow),
    User(UserRow),
    UserEmail(UserEmailRow),
    UserProfile(UserProfileRow),
    UserStat(UserStatRow),
    GroupUser(GroupUserRow),
    Category(CategoryRow),
    Topic(TopicRow),
    Post(PostRow),
    Tag(TagRow),
    TopicTag(TopicTagRow),
    PostAction(PostActionRow),
    Upload(UploadRow),
    TopicAllowedUser(TopicAllowedUserRow),
    Badge(BadgeRow),
    UserBadge(UserBadgeRow),
    Notification(NotificationRow),
}

macro_rules! dispatch {
    ($self:expr, $row:ident => $body:expr) => {
        match $self {
            TargetRow::Group($row) => $body,
            TargetRow::User($row) => $body,
            TargetRow::UserEmail($row) => $body,
            TargetRow::UserProfile($row) => $body,
            TargetRow::UserStat($row) => $body,
            TargetRow::GroupUser($row) => $body,
            TargetRow::Category($row) => $body,
            TargetRow::Topic($row) => $body,
            TargetRow::Post($row) => $body,
            TargetRow::Tag($row) => $body,
            TargetRow::TopicTag($row) => $body,
            TargetRow::PostAction($row) => $body,
            TargetRow::Upload($row) => $body,
            TargetRow::TopicAllowedUser($row) => $body,
            TargetRow::Badge($row) => $body,
            TargetRow::UserBadge($row) => $body,
            TargetRow::Notification($row) => $body,
        }
    };
}

fn table_of<R: CopyRecord>(_: &R) -> &'static str {
    R::TABLE
}

impl TargetRow {
    pub fn table(&self) -> &'static str {
        dispatch!(self, row => table_of(row))
    }

    pub fn encode(&self, line: &mut CopyLine) {
        dispatch!(self, row => row.encode(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn post_row_matches_its_columns() {
        let at = Utc.with_ymd_and_hms(2011, 5, 6, 7, 8, 9).unwrap();
        let row = TargetRow::Post(PostRow {
            id: 10,
            user_id: -1,
            topic_id: 3,
            post_number: 2,
            reply_to_post_number: None,
            raw: "hi\tthere".into(),
            cooked: "<p>hi</p>".into(),
            like_count: 0,
            hidden: false,
            word_count: 2,
            created_at: at,
        });
        let mut line = CopyLine::new();
        row.encode(&mut line);
        assert_eq!(row.table(), "posts");
        assert_eq!(line.fields(), PostRow::COLUMNS.len());
        let text = line.take();
        assert!(text.starts_with("10\t-1\t-1\t3\t2\t2\t\\N\thi\\tthere\t"));
    }

    #[test]
    fn every_row_type_encodes_all_columns() {
        let at = Utc::now();
        let rows = vec![
            TargetRow::UserEmail(UserEmailRow {
                id: 1,
                user_id: 2,
                email: "a@b.c".into(),
                created_at: at,
            }),
            TargetRow::Category(CategoryRow {
                id: 1,
                name: "News".into(),
                slug: "news".into(),
                description: None,
                user_id: -1,
                parent_category_id: None,
                position: 0,
                color: "0088CC".into(),
                text_color: "FFFFFF".into(),
                created_at: at,
            }),
            TargetRow::Notification(NotificationRow {
                id: 1,
                notification_type: 1,
                user_id: 2,
                data: "{}".into(),
                read: false,
                topic_id: None,
                post_number: None,
                created_at: at,
            }),
        ];
        let expected = [
            UserEmailRow::COLUMNS.len(),
            CategoryRow::COLUMNS.len(),
            NotificationRow::COLUMNS.len(),
        ];
        for (row, want) in rows.iter().zip(expected) {
            let mut line = CopyLine::new();
            row.encode(&mut line);
            assert_eq!(line.fields(), want, "{}", row.table());
        }
    }
}
