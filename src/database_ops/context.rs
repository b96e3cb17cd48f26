use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use encoding_rs::Encoding;
use std::collections::{HashMap, HashSet};
use tracing::info;

use super::db::Db;
use super::entity::Entity;
use super::etl::PhaseStats;
use super::names::{NamePool, ScopedNames};
use super::progress::StageTiming;
use super::registry::IdRegistry;
use crate::normalization::bbcode::{MarkupLookup, MarkupTransformer};
use crate::normalization::cook::Cooker;
use crate::normalization::slug::{MAX_TAG_LEN, MAX_USERNAME_LEN};

/// Tables whose ids the run allocates itself.
pub const ALLOCATED_TABLES: &[&str] = &[
    "groups",
    "users",
    "user_emails",
    "group_users",
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

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub convert_markup: bool,
    /// Natural-key dedup against existing rows (emails, category and tag names).
    pub merge: bool,
    pub charset: Option<&'static Encoding>,
    pub now: DateTime<Utc>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            convert_markup: true,
            merge: false,
            charset: None,
            now: Utc::now(),
        }
    }
}

/// Everything one run knows beyond the row in hand. Lives exactly as long as the run.
pub struct MigrationContext {
    pub options: RunOptions,
    pub registry: IdRegistry,
    pub usernames: NamePool,
    pub group_names: NamePool,
    pub category_names: ScopedNames,
    pub category_slugs: NamePool,
    pub tag_names: NamePool,
    /// Legacy username (exact spelling) -> imported username, for renamed users only.
    pub renamed_users: HashMap<String, String>,
    /// Destination user id -> username.
    pub usernames_by_id: HashMap<i64, String>,
    /// Lowercase e-mail -> destination user id.
    pub emails: HashMap<String, i64>,
    /// E-mails chosen during the users phase, written by the user_emails phase.
    pub pending_emails: HashMap<i64, String>,
    /// `(parent id, lowercase name)` -> category id.
    pub categories_by_name: HashMap<(Option<i64>, String), i64>,
    pub tags_by_name: HashMap<String, i64>,
    pub badges_by_name: HashMap<String, i64>,
    pub uploads_by_sha1: HashMap<String, i64>,
    /// Destination post id -> `(topic_id, post_number)`.
    pub posts: HashMap<i64, (i64, i64)>,
    /// Destination topic id -> highest post number handed out.
    pub topic_post_numbers: HashMap<i64, i64>,
    /// Natural keys of the link table the current phase writes.
    pub link_keys: HashSet<(i64, i64, i64)>,
    pub markup: MarkupTransformer,
    pub cooker: Cooker,
    pub stats: Vec<PhaseStats>,
    pub stage_timings: Vec<StageTiming>,
}

impl MigrationContext {
    pub fn new(options: RunOptions, markup: MarkupTransformer) -> Result<Self> {
        Ok(Self {
            options,
            registry: IdRegistry::new(),
            usernames: NamePool::with_max_len(MAX_USERNAME_LEN),
            group_names: NamePool::with_max_len(MAX_USERNAME_LEN),
            category_names: ScopedNames::default(),
            category_slugs: NamePool::new(),
            tag_names: NamePool::with_max_len(MAX_TAG_LEN),
            renamed_users: HashMap::new(),
            usernames_by_id: HashMap::new(),
            emails: HashMap::new(),
            pending_emails: HashMap::new(),
            categories_by_name: HashMap::new(),
            tags_by_name: HashMap::new(),
            badges_by_name: HashMap::new(),
            uploads_by_sha1: HashMap::new(),
            posts: HashMap::new(),
            topic_post_numbers: HashMap::new(),
            link_keys: HashSet::new(),
            markup,
            cooker: Cooker::new()?,
            stats: Vec::new(),
            stage_timings: Vec::new(),
        })
    }

    /// Load import references, id high-water marks and every natural key the
    /// resolvers must respect, before any legacy row is looked at.
    pub async fn preload(&mut self, db: &Db) -> Result<()> {
        db.ensure_import_references().await?;
        for entity in Entity::ALL {
            let refs = db
                .load_import_refs(entity)
                .await
                .with_context(|| format!("loading import references for {entity}"))?;
            let n = refs.len();
            for (legacy_id, new_id) in refs {
                self.registry.insert(entity, legacy_id, new_id);
            }
            if n > 0 {
                info!(%entity, refs = n, "import references loaded");
            }
        }
        for &table in ALLOCATED_TABLES {
            let max = db.max_id(table).await?;
            self.registry.seed_table(table, max);
        }

        for (user_id, username) in db.usernames().await? {
            self.usernames.seed([username.as_str()]);
            self.usernames_by_id.insert(user_id, username);
        }
        for (email, user_id) in db.emails().await? {
            self.emails.insert(email, user_id);
        }
        for group in db.groups().await? {
            self.group_names.seed([group.name.as_str()]);
        }
        for cat in db.categories().await? {
            self.category_names.seed(cat.parent_id, &cat.name);
            self.category_slugs.seed([cat.slug.as_str()]);
            self.categories_by_name
                .insert((cat.parent_id, cat.name.to_lowercase()), cat.id);
        }
        for (name, id) in db.names("tags").await? {
            self.tag_names.seed([name.as_str()]);
            self.tags_by_name.insert(name.to_lowercase(), id);
        }
        for (name, id) in db.names("badges").await? {
            self.badges_by_name.insert(name.to_lowercase(), id);
        }
        self.uploads_by_sha1.extend(db.upload_sha1s().await?);
        for (post_id, topic_id, post_number) in db.imported_posts().await? {
            self.posts.insert(post_id, (topic_id, post_number));
        }
        self.topic_post_numbers.extend(db.topic_post_numbers().await?);

        info!(
            usernames = self.usernames.len(),
            emails = self.emails.len(),
            posts = self.posts.len(),
            "destination state preloaded"
        );
        Ok(())
    }

    /// Drop lookups that point at rows of `table` a failed phase rolled back.
    /// Claimed names stay reserved; a later run only picks another suffix.
    pub fn forget_rows(&mut self, table: &str, ids: &HashSet<i64>) {
        if ids.is_empty() {
            return;
        }
        match table {
            "users" => {
                let gone: HashSet<String> = ids
                    .iter()
                    .filter_map(|id| self.usernames_by_id.remove(id))
                    .collect();
                self.renamed_users.retain(|_, name| !gone.contains(name));
                self.emails.retain(|_, id| !ids.contains(id));
                self.pending_emails.retain(|id, _| !ids.contains(id));
            }
            "categories" => self.categories_by_name.retain(|_, id| !ids.contains(id)),
            "tags" => self.tags_by_name.retain(|_, id| !ids.contains(id)),
            "badges" => self.badges_by_name.retain(|_, id| !ids.contains(id)),
            "uploads" => self.uploads_by_sha1.retain(|_, id| !ids.contains(id)),
            "topics" => self.topic_post_numbers.retain(|id, _| !ids.contains(id)),
            // Post numbers already handed out stay used; a gap is harmless.
            "posts" => self.posts.retain(|id, _| !ids.contains(id)),
            _ => {}
        }
    }
}

impl MarkupLookup for MigrationContext {
    fn quoted_post(&self, legacy_post_id: i64) -> Option<(i64, i64)> {
        let post_id = self.registry.map(Entity::Post, legacy_post_id)?;
        self.posts.get(&post_id).copied()
    }

    fn remapped_topic(&self, legacy_topic_id: i64) -> Option<i64> {
        self.registry.map(Entity::Topic, legacy_topic_id)
    }

    fn username_for(&self, legacy_name: &str) -> Option<String> {
        self.renamed_users.get(legacy_name).cloned()
    }

    fn user_exists(&self, username: &str) -> bool {
        self.usernames.contains(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::bbcode::quote_header;

    #[test]
    fn quotes_resolve_through_registry() {
        let mut ctx = MigrationContext::new(
            RunOptions::default(),
            MarkupTransformer::new(Vec::new()).unwrap(),
        )
        .unwrap();
        ctx.registry.insert(Entity::Post, 417, 9001);
        ctx.posts.insert(9001, (55, 3));
        ctx.renamed_users.insert("Bob Smith".into(), "Bob_Smith".into());
        assert_eq!(
            quote_header("Bob Smith", Some(417), &ctx),
            "[quote=\"Bob_Smith, post:3, topic:55\"]"
        );
        assert_eq!(quote_header("ann", Some(1), &ctx), "[quote=\"ann\"]");
    }
}
