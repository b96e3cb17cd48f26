//! Per-entity transforms: one legacy row in, one staged destination row (or a
//! merge / skip decision) out. Ids are allocated here, after every check that
//! could reject the row.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use sha1::{Digest, Sha1};
use std::net::IpAddr;

use super::context::MigrationContext;
use super::entity::{Entity, ImportRef, SYSTEM_USER_ID};
use super::etl::{SkipReason, Staged, Transformed};
use super::records::{
    BadgeRow, CategoryRow, GroupRow, GroupUserRow, NotificationRow, PostActionRow, PostRow,
    TagRow, TargetRow, TopicAllowedUserRow, TopicRow, TopicTagRow, UploadRow, UserBadgeRow,
    UserEmailRow, UserProfileRow, UserRow, UserStatRow, ARCHETYPE_PRIVATE, ARCHETYPE_REGULAR,
    POST_ACTION_LIKE,
};
use super::source::LegacyRow;
use crate::normalization::slug::{
    clean_tag, fancy_title, sanitize_username, slugify, word_count,
};
use crate::normalization::text::{clean_body, normalize_line};

const CATEGORY_COLORS: [&str; 12] = [
    "0088CC", "BF1E2E", "F1592A", "3AB54A", "12A89D", "25AAE2", "652D90", "92278F", "ED207B",
    "8C6238", "231F20", "808281",
];
const MAX_CATEGORY_NAME: usize = 50;
const MAX_TITLE: usize = 255;
const PRIVATE_TITLE: &str = "Private message";
const PERMANENT_BAN_YEARS: i64 = 200;

fn skip(reason: SkipReason) -> Result<Transformed> {
    Ok(Transformed::Skip(reason))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn now(ctx: &MigrationContext) -> DateTime<Utc> {
    ctx.options.now
}

fn mapped(ctx: &MigrationContext, entity: Entity, legacy_id: Option<i64>) -> Option<i64> {
    ctx.registry.map(entity, legacy_id?)
}

/// Unknown or missing authors belong to the system user.
fn user_or_system(ctx: &MigrationContext, legacy_id: Option<i64>) -> i64 {
    mapped(ctx, Entity::User, legacy_id).unwrap_or(SYSTEM_USER_ID)
}

/// Legacy body to `(raw, cooked)`.
fn render(ctx: &MigrationContext, body: &str) -> (String, String) {
    let cleaned = clean_body(body);
    let raw = if ctx.options.convert_markup {
        ctx.markup.transform(&cleaned, ctx)
    } else {
        ctx.markup.apply_dialect(&cleaned, ctx).trim().to_string()
    };
    let cooked = ctx.cooker.cook(&raw, ctx);
    (raw, cooked)
}

/// Deterministic stand-in for blank or already-taken addresses.
pub fn fallback_email(legacy_id: i64, email: Option<&str>) -> String {
    let digest = Sha1::digest(format!("{legacy_id}{}", email.unwrap_or_default()).as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}@email.invalid", &hex[..16])
}

/// Lowercased address from the row, if it looks like one.
fn row_email(row: &LegacyRow) -> Option<String> {
    row.text_nonempty("email")
        .map(|e| e.trim().to_lowercase())
        .filter(|e| e.contains('@'))
}

/// The address `user_id` gets: its own unless another user already holds it.
fn claim_email(ctx: &mut MigrationContext, legacy_id: i64, user_id: i64, email: Option<String>) -> String {
    let email = match email {
        Some(e) if ctx.emails.get(&e).map_or(true, |&owner| owner == user_id) => e,
        other => fallback_email(legacy_id, other.as_deref()),
    };
    ctx.emails.insert(email.clone(), user_id);
    email
}

fn valid_ip(raw: Option<String>) -> Option<String> {
    let raw = raw?;
    raw.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

pub fn group(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let legacy_id = row.req_int("id")?;
    if ctx.options.merge && row.bool("automatic") {
        return Ok(Transformed::Merged(ImportRef::new(Entity::Group, legacy_id, legacy_id)));
    }
    let Some(raw_name) = row.text_nonempty("name") else {
        return skip(SkipReason::Blank);
    };
    let name = ctx.group_names.resolve(&sanitize_username(&raw_name, None));
    let full_name = row
        .text_nonempty("full_name")
        .or_else(|| (name != raw_name).then(|| normalize_line(&raw_name)));
    let (bio_raw, bio_cooked) = match row.text_nonempty("bio") {
        Some(bio) => {
            let (raw, cooked) = render(ctx, &bio);
            (Some(raw), Some(cooked))
        }
        None => (None, None),
    };
    let created_at = row.time("created_at").unwrap_or_else(|| now(ctx));
    let id = ctx.registry.allocate_for(Entity::Group);
    Ok(Transformed::Row(
        Staged::new(TargetRow::Group(GroupRow {
            id,
            name,
            full_name,
            bio_raw,
            bio_cooked,
            visibility_level: row.int("visibility").unwrap_or(0).clamp(0, 4) as i32,
            created_at,
            updated_at: created_at,
        }))
        .imported(Entity::Group, legacy_id, id),
    ))
}

pub fn user(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let legacy_id = row.req_int("id")?;
    let email = row_email(row);
    let raw_name = row.text("username").unwrap_or_default();
    let raw_name = raw_name.trim();
    if ctx.options.merge {
        if let Some(&existing) = email.as_ref().and_then(|e| ctx.emails.get(e)) {
            if let Some(name) = ctx.usernames_by_id.get(&existing) {
                if !raw_name.is_empty() && name != raw_name {
                    ctx.renamed_users.insert(raw_name.to_string(), name.clone());
                }
            }
            return Ok(Transformed::Merged(ImportRef::new(Entity::User, legacy_id, existing)));
        }
    }

    let username = ctx
        .usernames
        .resolve(&sanitize_username(raw_name, email.as_deref()));
    if !raw_name.is_empty() && username != raw_name {
        ctx.renamed_users
            .insert(raw_name.to_string(), username.clone());
    }

    let id = ctx.registry.allocate_for(Entity::User);
    let email = claim_email(ctx, legacy_id, id, email);
    ctx.pending_emails.insert(id, email);
    ctx.usernames_by_id.insert(id, username.clone());

    let created_at = row.time("created_at").unwrap_or_else(|| now(ctx));
    let suspended_till = if row.bool("banned_permanently") {
        Some(now(ctx) + Duration::days(365 * PERMANENT_BAN_YEARS))
    } else {
        row.time("suspended_till")
    };
    let suspended_at = row
        .time("suspended_at")
        .or_else(|| suspended_till.map(|_| now(ctx)));
    let active = !row.has("active") || row.bool("active");

    Ok(Transformed::Row(
        Staged::new(TargetRow::User(UserRow {
            id,
            username_lower: username.to_lowercase(),
            username,
            name: row.text_nonempty("name").map(|n| normalize_line(&n)),
            active,
            approved: true,
            admin: row.bool("admin"),
            moderator: row.bool("moderator"),
            trust_level: row.int("trust_level").unwrap_or(1).clamp(0, 4) as i32,
            ip_address: valid_ip(row.text("ip_address")),
            first_seen_at: Some(created_at),
            last_seen_at: row.time("last_seen_at"),
            suspended_at,
            suspended_till,
            views: row.int("views").unwrap_or(0) as i32,
            created_at,
            updated_at: created_at,
        }))
        .imported(Entity::User, legacy_id, id),
    ))
}

pub fn group_user(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let Some(group_id) = mapped(ctx, Entity::Group, row.int("group_id")) else {
        return skip(SkipReason::MissingReference("group"));
    };
    let Some(user_id) = mapped(ctx, Entity::User, row.int("user_id")) else {
        return skip(SkipReason::MissingReference("user"));
    };
    let key = (group_id, user_id, 0);
    if ctx.link_keys.contains(&key) {
        return skip(SkipReason::AlreadyImported);
    }
    let id = ctx.registry.allocate("group_users");
    Ok(Transformed::Row(
        Staged::new(TargetRow::GroupUser(GroupUserRow {
            id,
            group_id,
            user_id,
            owner: row.bool("owner"),
            created_at: now(ctx),
        }))
        .keyed(key),
    ))
}

/// Rows keyed by the legacy user id alone; returns the destination user id
/// unless the user is unknown or already has the row.
fn per_user(ctx: &MigrationContext, row: &LegacyRow) -> std::result::Result<i64, SkipReason> {
    let user_id = mapped(ctx, Entity::User, row.int("id"))
        .ok_or(SkipReason::MissingReference("user"))?;
    if ctx.link_keys.contains(&(user_id, 0, 0)) {
        return Err(SkipReason::AlreadyImported);
    }
    Ok(user_id)
}

pub fn user_email(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let user_id = match per_user(ctx, row) {
        Ok(id) => id,
        Err(reason) => return skip(reason),
    };
    // A user committed by an earlier run has nothing pending; derive it again.
    let email = match ctx.pending_emails.remove(&user_id) {
        Some(email) => email,
        None => {
            let legacy_id = row.req_int("id")?;
            claim_email(ctx, legacy_id, user_id, row_email(row))
        }
    };
    let id = ctx.registry.allocate("user_emails");
    Ok(Transformed::Row(
        Staged::new(TargetRow::UserEmail(UserEmailRow {
            id,
            user_id,
            email,
            created_at: row.time("created_at").unwrap_or_else(|| now(ctx)),
        }))
        .keyed((user_id, 0, 0)),
    ))
}

pub fn user_profile(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let user_id = match per_user(ctx, row) {
        Ok(id) => id,
        Err(reason) => return skip(reason),
    };
    let (bio_raw, bio_cooked) = match row.text_nonempty("bio") {
        Some(bio) => {
            let (raw, cooked) = render(ctx, &bio);
            (Some(raw).filter(|r| !r.is_empty()), Some(cooked).filter(|c| !c.is_empty()))
        }
        None => (None, None),
    };
    let website = row
        .text_nonempty("website")
        .filter(|w| url::Url::parse(w).is_ok());
    Ok(Transformed::Row(
        Staged::new(TargetRow::UserProfile(UserProfileRow {
            user_id,
            location: row.text_nonempty("location").map(|l| truncate(&normalize_line(&l), 3000)),
            website,
            bio_raw,
            bio_cooked,
            views: row.int("views").unwrap_or(0) as i32,
        }))
        .keyed((user_id, 0, 0)),
    ))
}

pub fn user_stat(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let user_id = match per_user(ctx, row) {
        Ok(id) => id,
        Err(reason) => return skip(reason),
    };
    Ok(Transformed::Row(
        Staged::new(TargetRow::UserStat(UserStatRow {
            user_id,
            new_since: row.time("created_at").unwrap_or_else(|| now(ctx)),
            post_count: row.int("post_count").unwrap_or(0) as i32,
            topic_count: row.int("topic_count").unwrap_or(0) as i32,
            first_post_created_at: row.time("first_post_at"),
        }))
        .keyed((user_id, 0, 0)),
    ))
}

pub fn category(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let legacy_id = row.req_int("id")?;
    let name = row
        .text("name")
        .map(|n| normalize_line(&n))
        .unwrap_or_default();
    if name.is_empty() {
        return skip(SkipReason::Blank);
    }
    let parent = mapped(
        ctx,
        Entity::Category,
        row.int("parent_id").filter(|&p| p > 0),
    );
    if ctx.options.merge {
        if let Some(&existing) = ctx.categories_by_name.get(&(parent, name.to_lowercase())) {
            return Ok(Transformed::Merged(ImportRef::new(
                Entity::Category,
                legacy_id,
                existing,
            )));
        }
    }
    let name = ctx
        .category_names
        .resolve(parent, &truncate(&name, MAX_CATEGORY_NAME));
    let id = ctx.registry.allocate_for(Entity::Category);
    let slug = match slugify(&name) {
        s if s.is_empty() => format!("{id}-category"),
        s => s,
    };
    let slug = ctx.category_slugs.resolve(&slug);
    ctx.categories_by_name
        .insert((parent, name.to_lowercase()), id);
    let created_at = row.time("created_at").unwrap_or_else(|| now(ctx));
    Ok(Transformed::Row(
        Staged::new(TargetRow::Category(CategoryRow {
            id,
            name,
            slug,
            description: row.text_nonempty("description").map(|d| normalize_line(&d)),
            user_id: user_or_system(ctx, row.int("user_id")),
            parent_category_id: parent,
            position: row.int("position").unwrap_or(0) as i32,
            color: CATEGORY_COLORS[id.unsigned_abs() as usize % CATEGORY_COLORS.len()].to_string(),
            text_color: "FFFFFF".to_string(),
            created_at,
        }))
        .imported(Entity::Category, legacy_id, id),
    ))
}

fn topic_row(ctx: &mut MigrationContext, row: &LegacyRow, private: bool) -> Result<Transformed> {
    let legacy_id = row.req_int("id")?;
    let mut title = row
        .text("title")
        .map(|t| normalize_line(&t))
        .unwrap_or_default();
    if title.is_empty() {
        if !private {
            return skip(SkipReason::Blank);
        }
        title = PRIVATE_TITLE.to_string();
    }
    let title = truncate(&title, MAX_TITLE);
    let category_id = if private {
        None
    } else {
        mapped(ctx, Entity::Category, row.int("category_id"))
    };
    let id = ctx.registry.allocate_for(Entity::Topic);
    ctx.topic_post_numbers.insert(id, 0);
    let slug = match slugify(&title) {
        s if s.is_empty() => "topic".to_string(),
        s => s,
    };
    Ok(Transformed::Row(
        Staged::new(TargetRow::Topic(TopicRow {
            id,
            archetype: if private { ARCHETYPE_PRIVATE } else { ARCHETYPE_REGULAR },
            fancy_title: fancy_title(&title),
            title,
            slug,
            user_id: user_or_system(ctx, row.int("user_id")),
            category_id,
            visible: !row.has("visible") || row.bool("visible"),
            closed: row.bool("closed"),
            pinned_at: row.time("pinned_at"),
            views: row.int("views").unwrap_or(0) as i32,
            subtype: private.then_some("user_to_user"),
            created_at: row.time("created_at").unwrap_or_else(|| now(ctx)),
        }))
        .imported(Entity::Topic, legacy_id, id),
    ))
}

pub fn topic(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    topic_row(ctx, row, false)
}

pub fn private_topic(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    topic_row(ctx, row, true)
}

/// Used for both public and private posts; private rows arrive already offset.
pub fn post(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let legacy_id = row.req_int("id")?;
    let Some(topic_id) = mapped(ctx, Entity::Topic, row.int("topic_id")) else {
        return skip(SkipReason::MissingReference("topic"));
    };
    let body = row.text("raw").unwrap_or_default();
    if body.trim().is_empty() {
        return skip(SkipReason::Blank);
    }
    let (raw, cooked) = render(ctx, &body);
    if raw.is_empty() {
        return skip(SkipReason::Blank);
    }
    let reply_to_post_number = mapped(ctx, Entity::Post, row.int("reply_to_post_id"))
        .and_then(|p| ctx.posts.get(&p))
        .filter(|(t, _)| *t == topic_id)
        .map(|&(_, n)| n);
    let user_id = user_or_system(ctx, row.int("user_id"));

    let highest = ctx.topic_post_numbers.entry(topic_id).or_insert(0);
    let post_number = match row.int("post_number") {
        Some(n) if n > *highest => n,
        _ => *highest + 1,
    };
    *highest = post_number;

    let id = ctx.registry.allocate_for(Entity::Post);
    ctx.posts.insert(id, (topic_id, post_number));
    Ok(Transformed::Row(
        Staged::new(TargetRow::Post(PostRow {
            id,
            user_id,
            topic_id,
            post_number,
            reply_to_post_number,
            word_count: word_count(&raw),
            raw,
            cooked,
            like_count: row.int("like_count").unwrap_or(0) as i32,
            hidden: row.bool("hidden"),
            created_at: row.time("created_at").unwrap_or_else(|| now(ctx)),
        }))
        .imported(Entity::Post, legacy_id, id),
    ))
}

pub fn tag(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let legacy_id = row.req_int("id")?;
    let name = clean_tag(&row.text("name").unwrap_or_default());
    if name.is_empty() {
        return skip(SkipReason::Blank);
    }
    if ctx.options.merge {
        if let Some(&existing) = ctx.tags_by_name.get(&name.to_lowercase()) {
            return Ok(Transformed::Merged(ImportRef::new(Entity::Tag, legacy_id, existing)));
        }
    }
    let name = ctx.tag_names.resolve(&name);
    let id = ctx.registry.allocate_for(Entity::Tag);
    ctx.tags_by_name.insert(name.to_lowercase(), id);
    Ok(Transformed::Row(
        Staged::new(TargetRow::Tag(TagRow {
            id,
            name,
            created_at: now(ctx),
        }))
        .imported(Entity::Tag, legacy_id, id),
    ))
}

pub fn topic_tag(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let Some(topic_id) = mapped(ctx, Entity::Topic, row.int("topic_id")) else {
        return skip(SkipReason::MissingReference("topic"));
    };
    let tag_id = mapped(ctx, Entity::Tag, row.int("tag_id")).or_else(|| {
        row.text("tag_name")
            .and_then(|n| ctx.tags_by_name.get(&clean_tag(&n).to_lowercase()).copied())
    });
    let Some(tag_id) = tag_id else {
        return skip(SkipReason::MissingReference("tag"));
    };
    let key = (topic_id, tag_id, 0);
    if ctx.link_keys.contains(&key) {
        return skip(SkipReason::AlreadyImported);
    }
    let id = ctx.registry.allocate("topic_tags");
    Ok(Transformed::Row(
        Staged::new(TargetRow::TopicTag(TopicTagRow {
            id,
            topic_id,
            tag_id,
            created_at: now(ctx),
        }))
        .keyed(key),
    ))
}

pub fn post_action(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let Some(post_id) = mapped(ctx, Entity::Post, row.int("post_id")) else {
        return skip(SkipReason::MissingReference("post"));
    };
    let Some(user_id) = mapped(ctx, Entity::User, row.int("user_id")) else {
        return skip(SkipReason::MissingReference("user"));
    };
    let key = (post_id, user_id, i64::from(POST_ACTION_LIKE));
    if ctx.link_keys.contains(&key) {
        return skip(SkipReason::AlreadyImported);
    }
    let id = ctx.registry.allocate_for(Entity::PostAction);
    let staged = Staged::new(TargetRow::PostAction(PostActionRow {
        id,
        post_id,
        user_id,
        post_action_type_id: POST_ACTION_LIKE,
        created_at: row.time("created_at").unwrap_or_else(|| now(ctx)),
    }))
    .keyed(key);
    Ok(Transformed::Row(match row.int("id") {
        Some(legacy_id) => staged.imported(Entity::PostAction, legacy_id, id),
        None => staged,
    }))
}

/// Expects a row already enriched by the asset store (`sha1`, `url`, `filesize`).
pub fn upload(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let legacy_id = row.req_int("id")?;
    let sha1 = row
        .text_nonempty("sha1")
        .ok_or_else(|| anyhow!("upload has no stored file"))?;
    if let Some(&existing) = ctx.uploads_by_sha1.get(&sha1) {
        return Ok(Transformed::Merged(ImportRef::new(Entity::Upload, legacy_id, existing)));
    }
    let url = row
        .text_nonempty("url")
        .ok_or_else(|| anyhow!("upload has no url"))?;
    let original_filename = row
        .text_nonempty("filename")
        .unwrap_or_else(|| format!("upload-{legacy_id}"));
    let id = ctx.registry.allocate_for(Entity::Upload);
    ctx.uploads_by_sha1.insert(sha1.clone(), id);
    Ok(Transformed::Row(
        Staged::new(TargetRow::Upload(UploadRow {
            id,
            user_id: user_or_system(ctx, row.int("user_id")),
            extension: row.text_nonempty("extension"),
            original_filename,
            filesize: row.int("filesize").unwrap_or(0),
            url,
            sha1,
            created_at: row.time("created_at").unwrap_or_else(|| now(ctx)),
        }))
        .imported(Entity::Upload, legacy_id, id),
    ))
}

pub fn topic_allowed_user(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let Some(topic_id) = mapped(ctx, Entity::Topic, row.int("topic_id")) else {
        return skip(SkipReason::MissingReference("topic"));
    };
    let Some(user_id) = mapped(ctx, Entity::User, row.int("user_id")) else {
        return skip(SkipReason::MissingReference("user"));
    };
    let key = (topic_id, user_id, 0);
    if ctx.link_keys.contains(&key) {
        return skip(SkipReason::AlreadyImported);
    }
    let id = ctx.registry.allocate("topic_allowed_users");
    Ok(Transformed::Row(
        Staged::new(TargetRow::TopicAllowedUser(TopicAllowedUserRow {
            id,
            topic_id,
            user_id,
            created_at: now(ctx),
        }))
        .keyed(key),
    ))
}

pub fn badge(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let legacy_id = row.req_int("id")?;
    let Some(name) = row.text_nonempty("name").map(|n| normalize_line(&n)) else {
        return skip(SkipReason::Blank);
    };
    if let Some(&existing) = ctx.badges_by_name.get(&name.to_lowercase()) {
        return Ok(Transformed::Merged(ImportRef::new(Entity::Badge, legacy_id, existing)));
    }
    let id = ctx.registry.allocate_for(Entity::Badge);
    ctx.badges_by_name.insert(name.to_lowercase(), id);
    Ok(Transformed::Row(
        Staged::new(TargetRow::Badge(BadgeRow {
            id,
            name,
            description: row.text_nonempty("description"),
            badge_type_id: row.int("badge_type").unwrap_or(3).clamp(1, 3) as i32,
            created_at: now(ctx),
        }))
        .imported(Entity::Badge, legacy_id, id),
    ))
}

pub fn user_badge(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let Some(badge_id) = mapped(ctx, Entity::Badge, row.int("badge_id")) else {
        return skip(SkipReason::MissingReference("badge"));
    };
    let Some(user_id) = mapped(ctx, Entity::User, row.int("user_id")) else {
        return skip(SkipReason::MissingReference("user"));
    };
    let key = (badge_id, user_id, 0);
    if ctx.link_keys.contains(&key) {
        return skip(SkipReason::AlreadyImported);
    }
    let id = ctx.registry.allocate("user_badges");
    Ok(Transformed::Row(
        Staged::new(TargetRow::UserBadge(UserBadgeRow {
            id,
            badge_id,
            user_id,
            granted_at: row.time("granted_at").unwrap_or_else(|| now(ctx)),
            granted_by_id: SYSTEM_USER_ID,
        }))
        .keyed(key),
    ))
}

pub fn notification(ctx: &mut MigrationContext, row: &LegacyRow) -> Result<Transformed> {
    let legacy_id = row.req_int("id")?;
    let Some(user_id) = mapped(ctx, Entity::User, row.int("user_id")) else {
        return skip(SkipReason::MissingReference("user"));
    };
    let topic_id = mapped(ctx, Entity::Topic, row.int("topic_id"));
    let post_number = mapped(ctx, Entity::Post, row.int("post_id"))
        .and_then(|p| ctx.posts.get(&p))
        .map(|&(_, n)| n);
    let data = match row.text_nonempty("data") {
        Some(d) if serde_json::from_str::<serde_json::Value>(&d).is_ok() => d,
        Some(d) => serde_json::json!({ "message": d }).to_string(),
        None => "{}".to_string(),
    };
    let id = ctx.registry.allocate_for(Entity::Notification);
    Ok(Transformed::Row(
        Staged::new(TargetRow::Notification(NotificationRow {
            id,
            notification_type: row.int("notification_type").unwrap_or(1) as i32,
            user_id,
            data,
            read: row.bool("read"),
            topic_id,
            post_number,
            created_at: row.time("created_at").unwrap_or_else(|| now(ctx)),
        }))
        .imported(Entity::Notification, legacy_id, id),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::context::RunOptions;
    use crate::database_ops::entity::PRIVATE_OFFSET;
    use crate::normalization::bbcode::MarkupTransformer;

    fn ctx(merge: bool) -> MigrationContext {
        let options = RunOptions {
            merge,
            ..RunOptions::default()
        };
        MigrationContext::new(options, MarkupTransformer::new(Vec::new()).unwrap()).unwrap()
    }

    fn staged(t: Transformed) -> Staged {
        match t {
            Transformed::Row(s) => s,
            other => panic!("expected a row, got {other:?}"),
        }
    }

    #[test]
    fn fallback_email_is_deterministic() {
        let a = fallback_email(7, Some("dup@x.io"));
        assert_eq!(a, fallback_email(7, Some("dup@x.io")));
        assert_ne!(a, fallback_email(8, Some("dup@x.io")));
        assert!(a.ends_with("@email.invalid"));
        assert_eq!(a.len(), 16 + "@email.invalid".len());
    }

    #[test]
    fn duplicate_emails_get_fallbacks_outside_merge() {
        let mut c = ctx(false);
        c.emails.insert("taken@x.io".into(), 3);
        let row = LegacyRow::new()
            .with("id", 10i64)
            .with("username", "Zed")
            .with("email", "Taken@x.io");
        let s = staged(user(&mut c, &row).unwrap());
        let TargetRow::User(u) = &s.row else { panic!() };
        assert_eq!(c.pending_emails.get(&u.id), Some(&fallback_email(10, Some("taken@x.io"))));
    }

    #[test]
    fn merge_matches_users_by_email() {
        let mut c = ctx(true);
        c.emails.insert("ann@x.io".into(), 42);
        let row = LegacyRow::new()
            .with("id", 5i64)
            .with("username", "ann")
            .with("email", "ANN@x.io");
        match user(&mut c, &row).unwrap() {
            Transformed::Merged(r) => assert_eq!(r, ImportRef::new(Entity::User, 5, 42)),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn merged_users_keep_the_destination_username() {
        let mut c = ctx(true);
        c.emails.insert("ann@x.io".into(), 42);
        c.usernames_by_id.insert(42, "ann_w".into());
        let row = LegacyRow::new()
            .with("id", 5i64)
            .with("username", "Ann W")
            .with("email", "ann@x.io");
        assert!(matches!(user(&mut c, &row).unwrap(), Transformed::Merged(_)));
        assert_eq!(c.renamed_users.get("Ann W").map(String::as_str), Some("ann_w"));
    }

    #[test]
    fn user_emails_are_rebuilt_for_users_from_an_earlier_run() {
        let mut c = ctx(false);
        c.registry.insert(Entity::User, 7, 70);
        c.registry.insert(Entity::User, 8, 80);
        c.emails.insert("held@x.io".into(), 3);
        let own = LegacyRow::new().with("id", 7i64).with("email", " Kay@X.io ");
        let s = staged(user_email(&mut c, &own).unwrap());
        let TargetRow::UserEmail(e) = s.row else { panic!() };
        assert_eq!((e.user_id, e.email.as_str()), (70, "kay@x.io"));
        assert_eq!(s.link_key, Some((70, 0, 0)));

        let taken = LegacyRow::new().with("id", 8i64).with("email", "held@x.io");
        let s = staged(user_email(&mut c, &taken).unwrap());
        let TargetRow::UserEmail(e) = s.row else { panic!() };
        assert_eq!(e.email, fallback_email(8, Some("held@x.io")));
    }

    #[test]
    fn colliding_long_tags_stay_distinct() {
        let mut c = ctx(false);
        let mut names = Vec::new();
        for id in 1..=3i64 {
            let row = LegacyRow::new()
                .with("id", id)
                .with("name", "abcdefghijklmnopqrstuvwxyz");
            let s = staged(tag(&mut c, &row).unwrap());
            let TargetRow::Tag(t) = s.row else { panic!() };
            assert!(t.name.chars().count() <= 20, "{}", t.name);
            names.push(t.name);
        }
        assert_eq!(names[0], "abcdefghijklmnopqrst");
        assert_eq!(names[1], "abcdefghijklmnopqr_1");
        assert_eq!(names[2], "abcdefghijklmnopqr_2");
    }

    #[test]
    fn permanent_bans_last_two_centuries() {
        let mut c = ctx(false);
        let row = LegacyRow::new()
            .with("id", 1i64)
            .with("username", "troll")
            .with("banned_permanently", true);
        let s = staged(user(&mut c, &row).unwrap());
        let TargetRow::User(u) = s.row else { panic!() };
        let till = u.suspended_till.unwrap();
        assert!(till > c.options.now + Duration::days(365 * 199));
        assert_eq!(u.suspended_at, Some(c.options.now));
    }

    #[test]
    fn posts_without_topic_are_skipped() {
        let mut c = ctx(false);
        let row = LegacyRow::new()
            .with("id", 417i64)
            .with("topic_id", 3i64)
            .with("raw", "hello");
        assert!(matches!(
            post(&mut c, &row).unwrap(),
            Transformed::Skip(SkipReason::MissingReference("topic"))
        ));
    }

    #[test]
    fn post_numbers_and_replies_follow_the_topic() {
        let mut c = ctx(false);
        c.registry.insert(Entity::Topic, 1, 100);
        c.registry.insert(Entity::User, 9, 900);
        let first = staged(
            post(
                &mut c,
                &LegacyRow::new()
                    .with("id", 1i64)
                    .with("topic_id", 1i64)
                    .with("user_id", 9i64)
                    .with("raw", "[b]hi[/b] [url=http://x]click[/url]"),
            )
            .unwrap(),
        );
        c.registry.insert_ref(&first.import_ref.unwrap());
        let second = staged(
            post(
                &mut c,
                &LegacyRow::new()
                    .with("id", 2i64)
                    .with("topic_id", 1i64)
                    .with("user_id", 55i64)
                    .with("reply_to_post_id", 1i64)
                    .with("raw", "reply"),
            )
            .unwrap(),
        );
        let (TargetRow::Post(a), TargetRow::Post(b)) = (first.row, second.row) else {
            panic!()
        };
        assert_eq!(a.raw, "**hi** [click](http://x)");
        assert_eq!((a.post_number, a.user_id), (1, 900));
        assert_eq!((b.post_number, b.user_id), (2, SYSTEM_USER_ID));
        assert_eq!(b.reply_to_post_number, Some(1));
        assert_eq!(c.topic_post_numbers.get(&100), Some(&2));
    }

    #[test]
    fn blank_private_titles_get_a_default() {
        let mut c = ctx(false);
        let row = LegacyRow::new().with("id", PRIVATE_OFFSET + 4).with("title", "  ");
        let s = staged(private_topic(&mut c, &row).unwrap());
        let TargetRow::Topic(t) = s.row else { panic!() };
        assert_eq!(t.title, PRIVATE_TITLE);
        assert_eq!(t.archetype, ARCHETYPE_PRIVATE);
        assert_eq!(s.import_ref.map(|r| r.legacy_id), Some(PRIVATE_OFFSET + 4));
        let public = LegacyRow::new().with("id", 4i64).with("title", "");
        assert!(matches!(topic(&mut c, &public).unwrap(), Transformed::Skip(SkipReason::Blank)));
    }

    #[test]
    fn categories_merge_by_name_under_same_parent() {
        let mut c = ctx(true);
        c.categories_by_name.insert((None, "news".into()), 12);
        let row = LegacyRow::new().with("id", 3i64).with("name", "News");
        assert!(matches!(category(&mut c, &row).unwrap(), Transformed::Merged(r) if r.new_id == 12));

        let mut c = ctx(false);
        c.category_names.seed(None, "News");
        c.category_slugs.seed(["news"]);
        let s = staged(category(&mut c, &row).unwrap());
        let TargetRow::Category(cat) = s.row else { panic!() };
        assert_eq!(cat.name, "news_1");
        assert_eq!(cat.slug, "news-1");
    }

    #[test]
    fn automatic_groups_pass_through_in_merge() {
        let mut c = ctx(true);
        let row = LegacyRow::new()
            .with("id", 10i64)
            .with("name", "trust_level_0")
            .with("automatic", true);
        match group(&mut c, &row).unwrap() {
            Transformed::Merged(r) => assert_eq!((r.legacy_id, r.new_id), (10, 10)),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn link_rows_are_not_duplicated() {
        let mut c = ctx(false);
        c.registry.insert(Entity::Topic, 1, 100);
        c.registry.insert(Entity::Tag, 2, 200);
        c.link_keys.insert((100, 200, 0));
        let row = LegacyRow::new().with("topic_id", 1i64).with("tag_id", 2i64);
        assert!(matches!(
            topic_tag(&mut c, &row).unwrap(),
            Transformed::Skip(SkipReason::AlreadyImported)
        ));
    }

    #[test]
    fn notification_data_is_always_json() {
        let mut c = ctx(false);
        c.registry.insert(Entity::User, 1, 10);
        let row = LegacyRow::new()
            .with("id", 1i64)
            .with("user_id", 1i64)
            .with("data", "you were mentioned");
        let s = staged(notification(&mut c, &row).unwrap());
        let TargetRow::Notification(n) = s.row else { panic!() };
        assert_eq!(n.data, r#"{"message":"you were mentioned"}"#);
    }
}
